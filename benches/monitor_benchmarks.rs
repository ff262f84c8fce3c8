//! Benchmarks for the hot paths of the monitor.
//!
//! Ingestion runs per inbound webhook, so fingerprinting, signature checks
//! and the gate itself must stay cheap. Window aggregation and scoring run
//! once per provider per tick over every delivery in the window.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{hint::black_box, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use paywatch_core::{
    models::{
        DeliveryId, DeliveryRecord, DeliveryStatus, ErrorKind, MonitoringConfig, ProcessingStatus,
        ProviderName,
    },
    Clock, TestClock,
};
use paywatch_monitor::{
    aggregator::summarize,
    fingerprint::fingerprint,
    gate::SecurityInput,
    scorer::assess,
    security::{generate_signature, verify_signature, ProviderSecrets, SecurityPolicy},
    DeliveryEvent, IngestGate, MockMonitorStorage, MonitorStorage,
};
use serde_json::json;
use tokio::runtime::Runtime;

fn provider() -> ProviderName {
    ProviderName::parse("blockbee").unwrap()
}

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn payload(size: usize) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "payment_intent_id": "pi_bench",
        "status": "confirmed",
        "amount": "25.00",
        "currency": "USDT",
        "memo": "x".repeat(size),
    }))
    .unwrap()
}

fn record(i: usize) -> DeliveryRecord {
    let received_at = window_start() + Duration::seconds(i64::try_from(i % 900).unwrap());
    let failed = i % 17 == 0;
    let id = DeliveryId::new();
    DeliveryRecord {
        id,
        provider: provider(),
        payment_intent_id: None,
        webhook_kind: "payment".to_string(),
        request_id: None,
        expected_at: Some(received_at - Duration::milliseconds(i64::try_from(i % 5000).unwrap())),
        received_at,
        processing_started_at: Some(received_at),
        processing_completed_at: Some(received_at + Duration::milliseconds(120)),
        delivery_status: if i % 31 == 0 {
            DeliveryStatus::Duplicate
        } else {
            DeliveryStatus::Received
        },
        processing_status: if failed {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Success
        },
        error_kind: failed.then_some(ErrorKind::BusinessLogicError),
        error_message: None,
        retry_count: 0,
        signature_valid: i % 53 != 0,
        timestamp_valid: true,
        rate_limited: false,
        payload_size_bytes: 256,
        fingerprint: id.to_string(),
        payment_confirmed: !failed,
        balance_credited: !failed,
        user_notified: !failed,
        duplicate_of: None,
        recovery_alert_id: None,
        created_at: received_at,
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let provider = provider();

    for size in [64, 1_024, 16_384] {
        let body = payload(size);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("json", size), &body, |b, body| {
            b.iter(|| fingerprint(black_box(&provider), "payment_confirmed", black_box(body)));
        });
    }

    let opaque = vec![0xA5_u8; 1_024];
    group.bench_function("opaque_1024", |b| {
        b.iter(|| fingerprint(black_box(&provider), "payment_confirmed", black_box(&opaque)));
    });

    group.finish();
}

fn bench_signature(c: &mut Criterion) {
    let body = payload(1_024);
    let timestamp = window_start().timestamp();
    let header = format!("sha256={}", generate_signature("whsec_bench", timestamp, &body).unwrap());

    c.bench_function("signature/verify_1024", |b| {
        b.iter(|| {
            verify_signature("whsec_bench", Some(timestamp), black_box(&body), Some(&header))
                .unwrap();
        });
    });
}

fn bench_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("window");
    let config = MonitoringConfig::default_for(provider(), window_start());
    let computed_at = window_start() + Duration::minutes(15);

    for count in [100, 1_000, 10_000] {
        let records: Vec<DeliveryRecord> = (0..count).map(record).collect();
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("summarize", count), &records, |b, records| {
            b.iter(|| {
                summarize(&config.provider, window_start(), 15, black_box(records), computed_at)
            });
        });

        let snapshot = summarize(&config.provider, window_start(), 15, &records, computed_at);
        group.bench_with_input(BenchmarkId::new("assess", count), &snapshot, |b, snapshot| {
            b.iter(|| assess(black_box(snapshot), &config));
        });
    }

    group.finish();
}

fn bench_gate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let storage: Arc<dyn MonitorStorage> = Arc::new(MockMonitorStorage::new());
    let clock: Arc<dyn Clock> = Arc::new(TestClock::with_start_time(window_start()));
    let policy = SecurityPolicy { rate_limit_max: usize::MAX, ..SecurityPolicy::default() };
    let gate = IngestGate::new(storage, clock, ProviderSecrets::new(), policy);

    let mut group = c.benchmark_group("gate");
    group.throughput(Throughput::Elements(1));

    let mut sequence = 0_u64;
    group.bench_function("record_unique", |b| {
        b.to_async(&rt).iter(|| {
            sequence += 1;
            let body = Bytes::from(format!(r#"{{"payment_intent_id":"pi_{sequence}"}}"#));
            let event = DeliveryEvent::new(
                provider(),
                "payment_confirmed",
                body,
                SecurityInput::Precomputed { signature_valid: true, timestamp_valid: true },
            );
            let gate = gate.clone();
            async move { gate.record_delivery(event).await.unwrap() }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_signature, bench_window, bench_gate);
criterion_main!(benches);
