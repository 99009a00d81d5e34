use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use oguard_core::admission::{AdmissionTicket, ModelQueue};
use oguard_core::engine::stream_guard::{GenKind, GuardParams, StreamShape, spawn_guarded_stream};
use oguard_core::upstream_client::{
    StreamingBody, UpstreamFailure, UpstreamTransportErrorKind,
};
use oguard_scan::scanners::BlocklistScanner;
use oguard_scan::{Pipeline, ScanCache, Scanned, Scanner, ScannerError};

type UpstreamTx = mpsc::Sender<Result<Bytes, UpstreamFailure>>;

fn upstream_pair() -> (UpstreamTx, StreamingBody, CancellationToken) {
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    (tx, StreamingBody::new(rx, cancel.clone()), cancel)
}

fn blocklist_pipeline(terms: &[&str]) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        vec![Arc::new(BlocklistScanner::new(
            "blocklist",
            terms.iter().map(|t| t.to_string()),
        ))],
        false,
    ))
}

fn params(pipeline: Arc<Pipeline>, window_bytes: usize, kind: GenKind) -> GuardParams {
    GuardParams {
        cache: ScanCache::local_only(64, Duration::from_secs(60)),
        pipeline,
        output_enabled: true,
        window_bytes,
        prompt: "the prompt".to_string(),
        kind,
    }
}

async fn ticket(queue: &Arc<ModelQueue>) -> AdmissionTicket {
    queue.acquire().await.expect("admission ticket")
}

fn chat_line(content: &str, done: bool) -> String {
    let mut line = json!({
        "message": {"role": "assistant", "content": content},
        "done": done,
    })
    .to_string();
    line.push('\n');
    line
}

async fn collect_frames(mut rx: mpsc::Receiver<Bytes>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(chunk) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("stream must terminate")
    {
        frames.push(String::from_utf8(chunk.to_vec()).expect("utf8 frame"));
    }
    frames
}

/// Mid-stream violation: clean chunks pass through verbatim, the violating
/// chunk is withheld, exactly one terminal error line follows, the upstream
/// is cancelled, and the admission slot is released.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn violation_mid_stream_cancels_upstream() {
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, cancel) = upstream_pair();
    let guard = params(blocklist_pipeline(&["FORBIDDEN"]), 600, GenKind::Chat);

    let rx = spawn_guarded_stream(guard, StreamShape::Native, upstream, ticket(&queue).await);

    let clean = "a".repeat(250);
    tx.send(Ok(Bytes::from(chat_line(&clean, false))))
        .await
        .expect("send");
    tx.send(Ok(Bytes::from(chat_line(&clean, false))))
        .await
        .expect("send");
    // Crosses the 600-byte window and carries the violation.
    let tail = format!("{} and the FORBIDDEN part", "b".repeat(130));
    tx.send(Ok(Bytes::from(chat_line(&tail, false))))
        .await
        .expect("send");

    let frames = collect_frames(rx).await;
    assert_eq!(frames.len(), 3);
    assert!(frames[0].contains(&clean));
    assert!(frames[1].contains(&clean));
    // The violating chunk itself never reached the client.
    assert!(!frames[2].contains("FORBIDDEN part"));

    let terminal: JsonValue = serde_json::from_str(frames[2].trim()).expect("terminal json");
    assert_eq!(terminal["done"], true);
    assert_eq!(terminal["error"], "content_policy_violation");
    assert_eq!(terminal["type"], "output_blocked");
    assert_eq!(terminal["failed_scanners"][0]["scanner"], "blocklist");

    assert!(cancel.is_cancelled());
    sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.in_flight(), 0);
}

/// OpenAI SSE round-trip: delta frames concatenate to the native content,
/// then the finish frame and `[DONE]` terminate the stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn openai_chat_stream_round_trip() {
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, _cancel) = upstream_pair();
    let guard = params(blocklist_pipeline(&[]), 10_000, GenKind::Chat);

    let rx = spawn_guarded_stream(
        guard,
        StreamShape::OpenAiChat(Default::default()),
        upstream,
        ticket(&queue).await,
    );

    tx.send(Ok(Bytes::from(chat_line("He", false))))
        .await
        .expect("send");
    tx.send(Ok(Bytes::from(chat_line("llo", false))))
        .await
        .expect("send");
    tx.send(Ok(Bytes::from(chat_line("", true))))
        .await
        .expect("send");
    drop(tx);

    let frames = collect_frames(rx).await;
    assert_eq!(
        frames,
        vec![
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"},\"finish_reason\":null}]}\n\n".to_string(),
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":null}]}\n\n".to_string(),
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n".to_string(),
            "data: [DONE]\n\n".to_string(),
        ]
    );

    // The deltas across all frames concatenate back to the native content.
    let mut concatenated = String::new();
    for frame in &frames {
        let data = frame
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .expect("data frame");
        if data == "[DONE]" {
            continue;
        }
        let chunk: JsonValue = serde_json::from_str(data).expect("chunk json");
        if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
            concatenated.push_str(content);
        }
    }
    assert_eq!(concatenated, "Hello");
}

struct CountingScanner(Arc<AtomicUsize>);

impl Scanner for CountingScanner {
    fn name(&self) -> &str {
        "counting"
    }
    fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Scanned::pass(text))
    }
}

/// Scan cadence: scans fire when the accumulator grows past each window
/// multiple, and the EOF scan is skipped when the last windowed scan already
/// covered the full accumulator.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_cadence_and_eof_dedupe() {
    let scans = Arc::new(AtomicUsize::new(0));
    let pipeline = Arc::new(Pipeline::new(
        vec![Arc::new(CountingScanner(Arc::clone(&scans)))],
        false,
    ));
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, _cancel) = upstream_pair();

    let rx = spawn_guarded_stream(
        params(pipeline, 10, GenKind::Chat),
        StreamShape::Native,
        upstream,
        ticket(&queue).await,
    );

    // 6-byte deltas: accumulator 6, 12 (scan), 18, 24 (scan), EOF at 24
    // coincides with the last scan, so no extra EOF scan runs.
    for _ in 0..4 {
        tx.send(Ok(Bytes::from(chat_line("abcdef", false))))
            .await
            .expect("send");
    }
    drop(tx);

    let frames = collect_frames(rx).await;
    assert_eq!(frames.len(), 4);
    assert_eq!(scans.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eof_scan_runs_when_tail_unscanned() {
    let scans = Arc::new(AtomicUsize::new(0));
    let pipeline = Arc::new(Pipeline::new(
        vec![Arc::new(CountingScanner(Arc::clone(&scans)))],
        false,
    ));
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, _cancel) = upstream_pair();

    let rx = spawn_guarded_stream(
        params(pipeline, 10, GenKind::Chat),
        StreamShape::Native,
        upstream,
        ticket(&queue).await,
    );

    // 6, 12 (scan), 18 -> EOF with an unscanned tail: one final scan.
    for _ in 0..3 {
        tx.send(Ok(Bytes::from(chat_line("abcdef", false))))
            .await
            .expect("send");
    }
    drop(tx);

    collect_frames(rx).await;
    assert_eq!(scans.load(Ordering::SeqCst), 2);
}

/// A violation found only by the final scan still yields the terminal error
/// frame (already-delivered chunks are not retractable).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn final_scan_violation_emits_terminal_frame() {
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, _cancel) = upstream_pair();
    let guard = params(blocklist_pipeline(&["FORBIDDEN"]), 10_000, GenKind::Chat);

    let rx = spawn_guarded_stream(guard, StreamShape::Native, upstream, ticket(&queue).await);

    tx.send(Ok(Bytes::from(chat_line("clean then FORBIDDEN", true))))
        .await
        .expect("send");
    drop(tx);

    let frames = collect_frames(rx).await;
    assert_eq!(frames.len(), 2);
    let terminal: JsonValue = serde_json::from_str(frames[1].trim()).expect("terminal json");
    assert_eq!(terminal["type"], "output_blocked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_disconnect_cancels_upstream() {
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, cancel) = upstream_pair();
    let guard = params(blocklist_pipeline(&[]), 10_000, GenKind::Chat);

    let rx = spawn_guarded_stream(guard, StreamShape::Native, upstream, ticket(&queue).await);
    drop(rx);

    // Buffered sends keep succeeding until the driver notices the closed
    // client channel on a send.
    for _ in 0..32 {
        if tx
            .send(Ok(Bytes::from(chat_line("chunk", false))))
            .await
            .is_err()
        {
            break;
        }
        sleep(Duration::from_millis(5)).await;
        if cancel.is_cancelled() {
            break;
        }
    }

    assert!(cancel.is_cancelled());
    sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_read_timeout_surfaces_terminal_error() {
    let queue = ModelQueue::new("m", 1, 4);
    let (tx, upstream, _cancel) = upstream_pair();
    let guard = params(blocklist_pipeline(&[]), 10_000, GenKind::Chat);

    let rx = spawn_guarded_stream(guard, StreamShape::Native, upstream, ticket(&queue).await);

    tx.send(Ok(Bytes::from(chat_line("start", false))))
        .await
        .expect("send");
    tx.send(Err(UpstreamFailure {
        kind: UpstreamTransportErrorKind::ReadTimeout,
        message: "upstream went silent mid-stream".to_string(),
    }))
    .await
    .expect("send failure");
    drop(tx);

    let frames = collect_frames(rx).await;
    assert_eq!(frames.len(), 2);
    let terminal: JsonValue = serde_json::from_str(frames[1].trim()).expect("terminal json");
    assert_eq!(terminal["done"], true);
    assert_eq!(terminal["error"], "upstream_timeout");
}
