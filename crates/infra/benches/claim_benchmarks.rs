use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration as ChronoDuration, Utc};
use forgejobs_core::{CustomJob, JobTrigger, NewTriggerEvent, TenantId, TriggerType};
use forgejobs_infra::executor::{aggregate_metrics, output_preview};
use forgejobs_infra::{EngineStore, InMemoryStore, Scheduler};
use forgejobs_workflow::StepOutput;
use serde_json::json;
use std::sync::Arc;

/// Store with `jobs` scheduled jobs, all due one minute ago.
fn due_store(jobs: usize) -> (Arc<InMemoryStore>, TenantId) {
    let store = Arc::new(InMemoryStore::new());
    let tenant_id = TenantId::new();
    let now = Utc::now();
    futures::executor::block_on(async {
        for i in 0..jobs {
            let trigger = JobTrigger::from_fields(
                TriggerType::Daily,
                Some("UTC"),
                Some((i % 24) as i32),
                Some((i % 60) as i32),
                None,
                None,
                None,
            )
            .unwrap();
            let mut job =
                CustomJob::new(tenant_id, format!("job-{i}"), "weekly_content_summary", json!({}), trigger, now)
                    .unwrap();
            job.next_run_at = Some(now - ChronoDuration::minutes(1));
            store.insert_job(&job).await.unwrap();
        }
    });
    (store, tenant_id)
}

/// Store with one triggered job and `events` received events.
fn event_store(events: usize) -> (Arc<InMemoryStore>, TenantId) {
    let store = Arc::new(InMemoryStore::new());
    let tenant_id = TenantId::new();
    let now = Utc::now();
    futures::executor::block_on(async {
        let trigger = JobTrigger::from_fields(
            TriggerType::Triggered,
            None,
            None,
            None,
            None,
            Some("email".into()),
            Some(&json!({"max_concurrent_runs": 25})),
        )
        .unwrap();
        let job = CustomJob::new(tenant_id, "inbound", "email_crm_processor", json!({}), trigger, now).unwrap();
        store.insert_job(&job).await.unwrap();
        for i in 0..events {
            let event = NewTriggerEvent {
                job_id: job.id,
                source_type: "email".into(),
                source_event_id: Some(format!("m-{i}")),
                dedupe_key: format!("email:m-{i}"),
                dedupe_key_prefix: Some("email".into()),
                event_time: Some(now),
                payload: Some(json!({"document_id": i})),
            };
            store.create_trigger_event(event, now).await.unwrap();
        }
    });
    (store, tenant_id)
}

fn bench_due_claims(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_due_jobs");

    for jobs in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, &jobs| {
            b.to_async(&rt).iter_batched(
                || due_store(jobs),
                |(store, tenant_id)| async move {
                    let scheduler = Scheduler::new(store, tenant_id).with_claim_limit(jobs);
                    let runs = scheduler.claim_due_runs(Utc::now()).await.unwrap();
                    black_box(runs);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_trigger_claims(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("claim_trigger_events");

    // Admission caps each batch at the job's concurrency limit.
    for events in [25usize, 250, 2_500] {
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, &events| {
            b.to_async(&rt).iter_batched(
                || event_store(events),
                |(store, tenant_id)| async move {
                    let runs = Scheduler::new(store, tenant_id)
                        .claim_trigger_runs(Utc::now())
                        .await
                        .unwrap();
                    black_box(runs);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_run_summaries(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_summaries");

    let outputs: Vec<StepOutput> = (0..50)
        .map(|i| {
            json!({
                "input_tokens": i * 100,
                "output_tokens": i * 10,
                "search_cost": 0.002,
                "summary": if i == 49 { "x".repeat(5_000) } else { String::new() },
            })
            .as_object()
            .cloned()
            .unwrap()
        })
        .collect();

    group.bench_function("aggregate_metrics_50_steps", |b| {
        b.iter(|| black_box(aggregate_metrics(black_box(&outputs))));
    });
    group.bench_function("output_preview_50_steps", |b| {
        b.iter(|| black_box(output_preview(black_box(&outputs))));
    });

    group.finish();
}

criterion_group!(benches, bench_due_claims, bench_trigger_claims, bench_run_summaries);
criterion_main!(benches);
