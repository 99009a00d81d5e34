use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value as JsonValue;

use oguard_common::{GuardConfig, ParallelLimit};
use oguard_core::admission::AdmissionController;
use oguard_core::upstream_client::{
    UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};
use oguard_core::{AppState, EngineBody, EngineResponse, GuardEngine};
use oguard_scan::scanners::BlocklistScanner;
use oguard_scan::{Fingerprint, Pipeline, ScanCache, Side};

/// Canned upstream that counts calls and replays a fixed response.
struct MockUpstream {
    calls: Arc<AtomicUsize>,
    status: u16,
    body: Bytes,
    fail: bool,
}

impl MockUpstream {
    fn ok(body: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                calls: Arc::clone(&calls),
                status: 200,
                body: Bytes::from(body.to_string()),
                fail: false,
            }),
            calls,
        )
    }

    fn unreachable_host() -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                calls: Arc::clone(&calls),
                status: 0,
                body: Bytes::new(),
                fail: true,
            }),
            calls,
        )
    }
}

impl UpstreamClient for MockUpstream {
    fn send<'a>(
        &'a self,
        _req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamFailure {
                    kind: UpstreamTransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                });
            }
            Ok(UpstreamHttpResponse {
                status: self.status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: UpstreamBody::Bytes(self.body.clone()),
            })
        })
    }
}

fn engine_with(upstream: Arc<MockUpstream>, blocked_terms: &[&str]) -> GuardEngine {
    let mut config = GuardConfig::default();
    config.admission.default_parallel = ParallelLimit::Fixed(2);

    let scanners = |terms: &[&str]| -> Vec<Arc<dyn oguard_scan::Scanner>> {
        vec![Arc::new(BlocklistScanner::new(
            "blocklist",
            terms.iter().map(|t| t.to_string()),
        ))]
    };

    let state = Arc::new(AppState {
        admission: AdmissionController::new(&config.admission),
        cache: ScanCache::local_only(64, Duration::from_secs(60)),
        input_pipeline: Arc::new(Pipeline::new(scanners(blocked_terms), false)),
        output_pipeline: Arc::new(Pipeline::new(scanners(blocked_terms), false)),
        upstream,
        started_at: Instant::now(),
        config,
    });
    GuardEngine::new(state)
}

fn body_json(resp: EngineResponse) -> (u16, JsonValue) {
    let status = resp.status;
    match resp.body {
        EngineBody::Full(bytes) => (
            status,
            serde_json::from_slice(&bytes).expect("json response body"),
        ),
        EngineBody::Stream(_) => panic!("expected a buffered body"),
    }
}

/// Allowed non-streaming generate: the upstream body is forwarded verbatim
/// and both scan verdicts land in the cache.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allowed_generate_round_trip() {
    let (upstream, calls) = MockUpstream::ok(r#"{"response":"hi","done":true}"#);
    let engine = engine_with(upstream, &[]);

    let resp = engine
        .generate(Bytes::from(
            r#"{"model":"m","prompt":"hello","stream":false}"#,
        ))
        .await;
    let (status, body) = body_json(resp);
    assert_eq!(status, 200);
    assert_eq!(body["response"], "hi");
    assert_eq!(body["done"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = engine.state();
    assert_eq!(
        state.admission.snapshots()[0].in_flight,
        0,
        "admission slot released"
    );
    // The verdict store runs on the detached scan task; give it a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let input_fp = Fingerprint::compute(Side::Input, "hello");
    let output_fp = Fingerprint::compute(Side::Output, "hi");
    assert!(state.cache.lookup(&input_fp).await.is_some());
    assert!(state.cache.lookup(&output_fp).await.is_some());
}

/// Blocked prompt on the OpenAI surface: 451 with failed_scanners, and the
/// upstream is never called.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_input_never_reaches_upstream() {
    let (upstream, calls) = MockUpstream::ok(r#"{"message":{"role":"assistant","content":"x"}}"#);
    let engine = engine_with(upstream, &["FORBIDDEN"]);

    let resp = engine
        .openai_chat_completions(Bytes::from(
            r#"{"model":"m","messages":[{"role":"user","content":"FORBIDDEN"}],"stream":false}"#,
        ))
        .await;
    let (status, body) = body_json(resp);
    assert_eq!(status, 451);
    assert_eq!(body["error"]["type"], "content_policy_violation");
    assert_eq!(body["error"]["code"], "input_blocked");
    assert_eq!(body["error"]["failed_scanners"][0]["scanner"], "blocklist");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Blocked output on the non-streaming path: the finished upstream body is
/// scanned before anything is returned.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_output_non_streaming() {
    let (upstream, _calls) =
        MockUpstream::ok(r#"{"message":{"role":"assistant","content":"very FORBIDDEN text"},"done":true}"#);
    let engine = engine_with(upstream, &["FORBIDDEN"]);

    let resp = engine
        .chat(Bytes::from(
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stream":false}"#,
        ))
        .await;
    let (status, body) = body_json(resp);
    assert_eq!(status, 451);
    assert_eq!(body["type"], "output_blocked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_body_is_a_bad_request() {
    let (upstream, calls) = MockUpstream::ok("{}");
    let engine = engine_with(upstream, &[]);

    let resp = engine.generate(Bytes::from("not json")).await;
    let (status, body) = body_json(resp);
    assert_eq!(status, 400);
    assert_eq!(body["type"], "bad_request");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_upstream_is_a_bad_gateway() {
    let (upstream, _calls) = MockUpstream::unreachable_host();
    let engine = engine_with(upstream, &[]);

    let resp = engine
        .generate(Bytes::from(r#"{"model":"m","prompt":"hi","stream":false}"#))
        .await;
    let (status, body) = body_json(resp);
    assert_eq!(status, 502);
    assert_eq!(body["type"], "upstream_unavailable");
    // The slot freed up even though the call failed.
    assert_eq!(engine.state().admission.snapshots()[0].in_flight, 0);
}

/// The OpenAI models list is translated from the native tags listing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn models_list_translation() {
    let (upstream, _calls) =
        MockUpstream::ok(r#"{"models":[{"name":"llama3:8b","modified_at":"2024-05-01T00:00:00Z"}]}"#);
    let engine = engine_with(upstream, &[]);

    let (status, body) = body_json(engine.openai_models().await);
    assert_eq!(status, 200);
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "llama3:8b");
    assert_eq!(body["data"][0]["object"], "model");
}
