use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wreq::{Client, Method};

use oguard_common::GuardConfig;

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

pub type Headers = Vec<(String, String)>;

#[derive(Debug)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// When true a 2xx response body is handed over as a live stream instead
    /// of being buffered.
    pub want_stream: bool,
}

impl UpstreamHttpRequest {
    pub fn json_post(url: String, body: Bytes, want_stream: bool) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
            want_stream,
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(StreamingBody),
}

/// Live response body. Chunks arrive over a channel fed by a reader task that
/// enforces the idle timeout; `cancel()` makes that task drop the connection
/// immediately, freeing backend compute mid-generation.
#[derive(Debug)]
pub struct StreamingBody {
    rx: mpsc::Receiver<Result<Bytes, UpstreamFailure>>,
    cancel: CancellationToken,
}

impl StreamingBody {
    pub fn new(rx: mpsc::Receiver<Result<Bytes, UpstreamFailure>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn recv(&mut self) -> Option<Result<Bytes, UpstreamFailure>> {
        self.rx.recv().await
    }

    /// Abort the upstream connection. Idempotent; double-cancel only logs.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            debug!("upstream cancel called twice");
            return;
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    Other,
}

#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub kind: UpstreamTransportErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    /// Total-body cap for buffered (non-streaming) responses.
    pub request_timeout: Duration,
    /// Max silence between chunks of a streaming response.
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.timeout.upstream_connect_secs.max(1)),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(config.timeout.upstream_idle_secs.max(1)),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Process-wide pooled client over wreq. One instance per process; the pool
/// and keep-alive live inside the wreq `Client`.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.stream_idle_timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
                HttpMethod::Delete => Method::DELETE,
            };
            let mut builder = self.client.request(method, &req.url);

            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }

            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(
                resp,
                req.want_stream,
                self.config.request_timeout,
                self.config.stream_idle_timeout,
            )
            .await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = tokio::time::timeout(request_timeout, resp.bytes())
            .await
            .map_err(|_| UpstreamFailure {
                kind: UpstreamTransportErrorKind::Timeout,
                message: "upstream body read timed out".to_string(),
            })?
            .map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let cancel = CancellationToken::new();
    let reader_cancel = cancel.clone();
    let (tx, rx) = mpsc::channel::<Result<Bytes, UpstreamFailure>>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                next = tokio::time::timeout(stream_idle_timeout, stream.next()) => next,
            };
            let item = match next {
                Ok(item) => item,
                Err(_) => {
                    let _ = tx
                        .send(Err(UpstreamFailure {
                            kind: UpstreamTransportErrorKind::ReadTimeout,
                            message: "upstream went silent mid-stream".to_string(),
                        }))
                        .await;
                    break;
                }
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(map_wreq_error(err))).await;
                    break;
                }
            };
            if tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
        // Dropping `stream` here closes the pooled connection if the loop was
        // broken by cancellation.
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(StreamingBody::new(rx, cancel)),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (k, v) in map {
        if let Ok(s) = v.to_str() {
            out.push((k.as_str().to_string(), s.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    let kind = classify_wreq_error(&err);
    UpstreamFailure {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    UpstreamTransportErrorKind::Other
}
