use cm600_exporter::{ModemMetrics, StaleSeriesPolicy, StatusPageLayout, StatusPageParser};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use prometheus::Registry;

const STATUS_PAGE: &str = include_str!("../fixtures/docsis_status.html");

fn bench_parse(c: &mut Criterion) {
    let parser = StatusPageParser::new(StatusPageLayout::default()).unwrap();

    c.bench_function("parse_status_page", |b| {
        b.iter(|| parser.parse(black_box(STATUS_PAGE.as_bytes())).unwrap())
    });
}

fn bench_publish(c: &mut Criterion) {
    let parser = StatusPageParser::new(StatusPageLayout::default()).unwrap();
    let snapshot = parser.parse(STATUS_PAGE.as_bytes()).unwrap();
    let metrics = ModemMetrics::new(&Registry::new()).unwrap();

    let mut group = c.benchmark_group("publish");
    group.bench_function("retain", |b| {
        b.iter(|| metrics.publish(black_box(&snapshot), StaleSeriesPolicy::Retain))
    });
    group.bench_function("reset", |b| {
        b.iter(|| metrics.publish(black_box(&snapshot), StaleSeriesPolicy::Reset))
    });
    group.finish();
}

criterion_group!(benches, bench_parse, bench_publish);
criterion_main!(benches);
