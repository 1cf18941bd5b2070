//! Benchmarks for calendar schedules: next-instant generation.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tideline::Calendar;
use tideline::Schedule;

fn business_days() -> Calendar {
    // A year of holidays on top of the weekday mask
    (1..=12).fold(Calendar::new(), |cal, month| {
        cal.excluding(NaiveDate::from_ymd_opt(2024, month, 1).unwrap())
    })
}

fn bench_next_n_instants(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_n_instants");

    let base_time = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
    let valid_from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let times = |hours: &[u32]| -> Vec<NaiveTime> {
        hours
            .iter()
            .map(|h| NaiveTime::from_hms_opt(*h, 0, 0).unwrap())
            .collect()
    };

    let daily_utc = Schedule::new(business_days(), times(&[9]), chrono_tz::UTC, valid_from, None).unwrap();
    let hourly_ny = Schedule::new(
        Calendar::new(),
        times(&(8..18).collect::<Vec<_>>()),
        chrono_tz::America::New_York,
        valid_from,
        None,
    )
    .unwrap();

    for n in [10, 50, 100].iter() {
        group.bench_with_input(BenchmarkId::new("daily_utc", n), n, |b, &n| {
            b.iter(|| daily_utc.next_instants(base_time, n));
        });

        group.bench_with_input(BenchmarkId::new("hourly_new_york", n), n, |b, &n| {
            b.iter(|| hourly_ny.next_instants(base_time, n));
        });
    }

    group.finish();
}

fn bench_interval_ending_at(c: &mut Criterion) {
    let valid_from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let schedule = Schedule::new(
        business_days(),
        [NaiveTime::from_hms_opt(9, 0, 0).unwrap()],
        chrono_tz::UTC,
        valid_from,
        None,
    )
    .unwrap();
    // Tuesday after a Monday holiday: the interval reaches back to Friday
    let instant = Utc.with_ymd_and_hms(2024, 7, 2, 9, 0, 0).unwrap();

    c.bench_function("interval_ending_at", |b| {
        b.iter(|| schedule.interval_ending_at(instant));
    });
}

criterion_group!(benches, bench_next_n_instants, bench_interval_ending_at);

criterion_main!(benches);
