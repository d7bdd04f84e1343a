//! Benchmark for the advertisement pipeline.
//!
//! Feeds report bursts of iBeacon and named advertisements through
//! `AdvertisementPipeline::process`, with and without a MAC filter.

use beacon_gateway_scanner::advertisement::{AD_TYPE_COMPLETE_NAME, AD_TYPE_MANUFACTURER_DATA};
use beacon_gateway_scanner::{AdvertisementPipeline, DeviceId, MacFilter, RawAdvertisement, Tlv};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

/// Apple iBeacon, major 1, minor 2, -59 dBm at 1 m
const IBEACON_HEX: &str = "4C000215E2C56DB5DFFB48D2B060D0F5A71096E000010002C5";

fn device(i: u8) -> DeviceId {
    DeviceId([i, 0x05, 0x04, 0x03, 0x02, 0x01])
}

fn ibeacon_advertisement(i: u8) -> RawAdvertisement {
    RawAdvertisement {
        device_id: device(i),
        device_type: 0,
        event_type: 3,
        rssi: -70,
        seconds: 1_500_000_000,
        microseconds: 123_456,
        adv_payload: vec![
            Tlv::new(0x01, "06"),
            Tlv::new(AD_TYPE_MANUFACTURER_DATA, IBEACON_HEX),
        ],
        scan_response_payload: vec![Tlv::new(AD_TYPE_COMPLETE_NAME, "Beacon")],
    }
}

fn plain_advertisement(i: u8) -> RawAdvertisement {
    RawAdvertisement {
        adv_payload: vec![Tlv::new(0x01, "06"), Tlv::new(AD_TYPE_MANUFACTURER_DATA, "5900")],
        scan_response_payload: Vec::new(),
        ..ibeacon_advertisement(i)
    }
}

/// Benchmark single advertisements of each kind
fn bench_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_single");
    let pipeline = AdvertisementPipeline::new(None);
    group.throughput(Throughput::Elements(1));

    let ibeacon = vec![ibeacon_advertisement(0)];
    group.bench_function("ibeacon", |b| {
        b.iter(|| black_box(pipeline.process(black_box("gw1"), black_box(&ibeacon))))
    });

    let plain = vec![plain_advertisement(0)];
    group.bench_function("plain", |b| {
        b.iter(|| black_box(pipeline.process(black_box("gw1"), black_box(&plain))))
    });

    group.finish();
}

/// Benchmark bursts of increasing size
fn bench_bursts(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_burst");
    let pipeline = AdvertisementPipeline::new(None);

    for size in [1u8, 10, 100] {
        let burst: Vec<RawAdvertisement> = (0..size).map(ibeacon_advertisement).collect();
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &burst, |b, burst| {
            b.iter(|| black_box(pipeline.process("gw1", black_box(burst))))
        });
    }

    group.finish();
}

/// Benchmark a filtered burst where most advertisements are dropped
fn bench_filtered_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_filtered");

    let burst: Vec<RawAdvertisement> = (0..100u8).map(ibeacon_advertisement).collect();
    let allowed: Vec<String> = (0..10u8)
        .map(|i| device(i).display_mac().to_string())
        .collect();
    let pipeline = AdvertisementPipeline::new(Some(MacFilter::new(&allowed)));

    group.throughput(Throughput::Elements(100));
    group.bench_function("10_of_100", |b| {
        b.iter(|| {
            let records = pipeline.process("gw1", black_box(&burst));
            debug_assert_eq!(records.len(), 10);
            black_box(records)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_single, bench_bursts, bench_filtered_burst);
criterion_main!(benches);
