//! Manual trigger rules shared by every store.

use chrono::{DateTime, Duration, Utc};

use forgejobs_core::{DomainError, Run};

/// Outcome of a manual trigger: the run and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualRun {
    pub run: Run,
    pub created: bool,
}

/// Trimmed key, or `None` when absent or blank.
pub fn normalize_idempotency_key(key: Option<&str>) -> Option<String> {
    key.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string)
}

pub fn cooldown_message(cooldown: Duration) -> String {
    format!(
        "Manual trigger cooldown active ({}s). Try again later.",
        cooldown.num_seconds()
    )
}

/// Reject a trigger while the job's most recent run is younger than `cooldown`.
pub fn check_cooldown(
    latest_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> Result<(), DomainError> {
    if cooldown <= Duration::zero() {
        return Ok(());
    }
    match latest_created_at {
        Some(created_at) if now - created_at < cooldown => Err(DomainError::conflict(cooldown_message(cooldown))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_normalize_to_none() {
        assert_eq!(normalize_idempotency_key(Some("  K ")), Some("K".to_string()));
        assert_eq!(normalize_idempotency_key(Some("   ")), None);
        assert_eq!(normalize_idempotency_key(None), None);
    }

    #[test]
    fn cooldown_blocks_recent_runs_only() {
        let now = Utc::now();
        let cooldown = Duration::seconds(30);
        let err = check_cooldown(Some(now - Duration::seconds(10)), now, cooldown).unwrap_err();
        assert_eq!(err.message(), "Manual trigger cooldown active (30s). Try again later.");

        assert!(check_cooldown(Some(now - Duration::seconds(30)), now, cooldown).is_ok());
        assert!(check_cooldown(None, now, cooldown).is_ok());
        assert!(check_cooldown(Some(now), now, Duration::zero()).is_ok());
    }
}
