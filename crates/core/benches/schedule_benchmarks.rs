use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use chrono::{TimeZone, Utc, Weekday};
use forgejobs_core::schedule::{parse_timezone, ScheduleSpec};

/// Next-run computation across zones with and without DST transitions.
fn bench_next_after(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_next_after");
    let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

    for zone in ["UTC", "America/New_York", "Australia/Lord_Howe"] {
        let tz = parse_timezone(zone).unwrap();
        let daily = ScheduleSpec::daily(2, 30, tz).unwrap();
        let weekly = ScheduleSpec::weekly(Weekday::Sun, 2, 30, tz).unwrap();

        group.bench_with_input(BenchmarkId::new("daily", zone), &daily, |b, spec| {
            b.iter(|| spec.next_after(black_box(now)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("weekly", zone), &weekly, |b, spec| {
            b.iter(|| spec.next_after(black_box(now)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_next_after);
criterion_main!(benches);
