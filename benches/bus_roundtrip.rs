//! Bus round-trip benchmark suite.
//!
//! Measures correlated call latency between two realms, and poll body
//! fan-out through the interceptor:
//! - Concurrent calls in flight: 1, 16, 64
//! - Poll units per body: 8, 64
//!
//! Run with: cargo bench --bench bus_roundtrip
//! Results saved to: target/criterion/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures_util::future::join_all;
use realm_relay::protocol::poll::join_units;
use realm_relay::{
    BusMessage, EventTag, Interceptor, PollClient, PollExchange, Realm, RelayConfig, Result, bus,
};
use serde_json::Value;
use tokio::runtime::Runtime;
use url::Url;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CONCURRENCY: &[usize] = &[1, 16, 64];
const POLL_UNITS: &[usize] = &[8, 64];
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

/// Poll client that never touches the network.
struct NullPollClient;

#[async_trait]
impl PollClient for NullPollClient {
    async fn get(&self, _url: &Url) -> Result<String> {
        Ok(String::new())
    }

    async fn post(&self, _url: &Url, _body: String) -> Result<String> {
        Ok("ok".to_string())
    }
}

// ============================================================================
// Benchmark: Correlated Calls
// ============================================================================

fn bench_call_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (page, extension) = rt.block_on(async { bus::pair(Realm::Page, Realm::Extension) });
    page.on_receive(EventTag::IsWebSocketCaptured, |_| async {
        Ok(Some(Value::Bool(true)))
    });

    let mut group = c.benchmark_group("call_roundtrip");

    for &concurrency in CONCURRENCY {
        group.bench_with_input(
            BenchmarkId::new("in_flight", concurrency),
            &concurrency,
            |b, &in_flight| {
                b.to_async(&rt).iter(|| {
                    let extension = extension.clone();
                    async move {
                        let calls = (0..in_flight).map(|_| {
                            extension.send(BusMessage::IsWebSocketCaptured, Some(CALL_TIMEOUT))
                        });
                        for reply in join_all(calls).await {
                            reply.expect("reply");
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Benchmark: Poll Fan-out
// ============================================================================

fn bench_poll_fanout(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (interceptor, _extension) = rt.block_on(async {
        let (page, extension) = bus::pair(Realm::Page, Realm::Extension);
        extension.on_receive(EventTag::LongPollingEvent, |_| async { Ok(None) });
        let interceptor = Interceptor::new(RelayConfig::default(), page, Arc::new(NullPollClient));
        interceptor.start("https://app.test/chat");
        (interceptor, extension)
    });

    let mut group = c.benchmark_group("poll_fanout");

    for &units in POLL_UNITS {
        let body = join_units(
            &(0..units)
                .map(|i| format!("42[\"unit\",{i}]"))
                .collect::<Vec<_>>(),
        );
        group.bench_with_input(BenchmarkId::new("units", units), &body, |b, body| {
            b.iter(|| {
                interceptor.on_poll_complete(PollExchange::completed(
                    "https://app.test/socket.io/?EIO=4&transport=polling&sid=abc",
                    body.clone(),
                ));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_call_roundtrip, bench_poll_fanout);
criterion_main!(benches);
