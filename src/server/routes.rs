//! Server Routes - HTTP Handlers & MJPEG Writer
//!
//! ## Responsibilities
//!
//! - HTML endpoints: index, PIN entry, blocked notice, start/stop toggle
//! - `multipart/x-mixed-replace` stream endpoint with a per-client writer task
//! - Single-frame `.jpeg` fallback for clients without MJPEG support
//!
//! Every handler resolves the caller's identity from the socket address.
//! Blocked clients keep their stream connection; they receive a substitute
//! image until the block expires.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::clients::ClientRegistry;
use crate::frame::{FrameSource, Placeholder};
use crate::server::pages::{random_string, ServerPages};
use crate::server::ServerEvent;

/// Emitted-minus-written gap that marks a connection as slow
const SLOW_FRAME_GAP: u64 = 5;
/// Last frame is re-sent after this much silence to keep viewers alive
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

const FAVICON_PNG: &[u8] = include_bytes!("../../assets/favicon.png");
const LOGO_PNG: &[u8] = include_bytes!("../../assets/logo.png");

/// Shared handler context for one server instance
#[derive(Clone)]
pub struct ServerCtx {
    pub pages: Arc<ServerPages>,
    pub registry: Arc<ClientRegistry>,
    pub frames: Arc<FrameSource>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub enable_pin: bool,
    pub block_address: bool,
    pub enable_buttons: bool,
    pub shutdown: CancellationToken,
}

pub fn build_router(ctx: ServerCtx) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/pinrequest", get(pin_request))
        .route("/blocked", get(blocked))
        .route("/start-stop", get(start_stop))
        .route("/favicon.png", get(favicon))
        .route("/logo.png", get(logo))
        .route(&format!("/{}", ctx.pages.stream_path), get(mjpeg_stream))
        .route(&format!("/{}", ctx.pages.jpeg_path), get(jpeg_frame))
        .fallback(|| async { Redirect::to("/") })
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn index(
    State(ctx): State<ServerCtx>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    if !ctx.enable_pin {
        return Html(ctx.pages.index_html.clone()).into_response();
    }
    if ctx.registry.is_address_blocked(remote.ip()).await {
        return Redirect::to("/blocked").into_response();
    }
    if ctx.registry.is_client_authorized(remote.ip()).await {
        Html(ctx.pages.index_html.clone()).into_response()
    } else {
        Redirect::to("/pinrequest").into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PinQuery {
    pin: Option<String>,
}

async fn pin_request(
    State(ctx): State<ServerCtx>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PinQuery>,
) -> Response {
    if !ctx.enable_pin {
        return StatusCode::NOT_FOUND.into_response();
    }
    if ctx.registry.is_address_blocked(remote.ip()).await {
        return Redirect::to("/blocked").into_response();
    }

    let client_id = ctx.registry.on_connected(remote.ip(), remote.port()).await;
    let Some(pin) = query.pin else {
        return Html(ctx.pages.pin_request_html.clone()).into_response();
    };

    if ctx.registry.verify_pin(&client_id, &pin).await {
        tracing::debug!(client_id = %client_id, "PIN accepted");
        Redirect::to("/").into_response()
    } else if ctx.registry.is_client_blocked(&client_id).await {
        tracing::info!(address = %remote.ip(), "Address blocked after repeated PIN failures");
        Redirect::to("/blocked").into_response()
    } else {
        Html(ctx.pages.pin_request_error_html.clone()).into_response()
    }
}

async fn blocked(State(ctx): State<ServerCtx>) -> Response {
    if ctx.enable_pin && ctx.block_address {
        Html(ctx.pages.blocked_html.clone()).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn start_stop(State(ctx): State<ServerCtx>) -> StatusCode {
    if ctx.enable_buttons && !ctx.enable_pin {
        let _ = ctx.events.send(ServerEvent::StartStopRequest);
    }
    StatusCode::OK
}

async fn favicon() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], FAVICON_PNG)
}

async fn logo() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], LOGO_PNG)
}

/// Latest frame as a plain JPEG, for clients that cannot render MJPEG
async fn jpeg_frame(
    State(ctx): State<ServerCtx>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let jpeg = admitted_jpeg(&ctx, remote, ctx.frames.latest_jpeg()).await;
    (
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        jpeg,
    )
        .into_response()
}

async fn mjpeg_stream(
    State(ctx): State<ServerCtx>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let client_id = ctx.registry.on_connected(remote.ip(), remote.port()).await;
    let boundary = random_string(32);
    let content_type = format!("multipart/x-mixed-replace; boundary={boundary}");

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
    tokio::spawn(write_stream(ctx, client_id, remote, boundary, tx));

    (
        [
            (header::CONTENT_TYPE, content_type.as_str()),
            (header::CACHE_CONTROL, "no-cache, no-store"),
            (header::CONNECTION, "close"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Per-client writer: one frame part per watch update, keep-alive re-sends,
/// blocked-image substitution, byte accounting.
async fn write_stream(
    ctx: ServerCtx,
    client_id: String,
    remote: SocketAddr,
    boundary: String,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    tracing::debug!(client_id = %client_id, address = %remote, "Stream client connected");

    let mut frames = ctx.frames.subscribe();
    let mut gauge = SlowGauge::new();
    let mut last_jpeg = Bytes::new();
    let keep_alive = tokio::time::sleep(KEEP_ALIVE_INTERVAL);
    tokio::pin!(keep_alive);

    if send_chunk(&ctx, &client_id, &tx, Bytes::from(format!("--{boundary}\r\n")))
        .await
        .is_err()
    {
        ctx.registry.on_disconnected(&client_id).await;
        return;
    }

    // A client connecting while the source is idle still gets the current
    // frame immediately instead of waiting for the next publication.
    let current = frames.borrow_and_update().clone();
    if !current.is_empty() {
        last_jpeg = admitted_jpeg(&ctx, remote, current.jpeg).await;
        let part = encode_part(&boundary, &last_jpeg);
        if send_chunk(&ctx, &client_id, &tx, part).await.is_err() {
            ctx.registry.on_disconnected(&client_id).await;
            return;
        }
        keep_alive
            .as_mut()
            .reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
    }

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,

            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                if frame.is_empty() {
                    continue;
                }
                if gauge.on_frame(frame.id) {
                    tracing::debug!(client_id = %client_id, "Slow connection detected");
                    ctx.registry.on_slow_connection(&client_id).await;
                }
                last_jpeg = admitted_jpeg(&ctx, remote, frame.jpeg).await;
                let part = encode_part(&boundary, &last_jpeg);
                if send_chunk(&ctx, &client_id, &tx, part).await.is_err() {
                    break;
                }
                keep_alive.as_mut().reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
            }

            _ = &mut keep_alive => {
                keep_alive.as_mut().reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
                if last_jpeg.is_empty() {
                    continue;
                }
                let part = encode_part(&boundary, &last_jpeg);
                if send_chunk(&ctx, &client_id, &tx, part).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(client_id = %client_id, "Stream client disconnected");
    ctx.registry.on_disconnected(&client_id).await;
}

/// Blocked or unauthorized clients get the substitute image; the channel
/// itself stays open.
async fn admitted_jpeg(ctx: &ServerCtx, remote: SocketAddr, jpeg: Bytes) -> Bytes {
    if ctx.registry.is_client_allowed(remote.ip()).await {
        jpeg
    } else {
        Bytes::from_static(Placeholder::AddressBlocked.jpeg())
    }
}

/// Hand one chunk to the body stream. A writer blocked on a stalled client
/// must still observe shutdown, so the send races the cancellation token.
async fn send_chunk(
    ctx: &ServerCtx,
    client_id: &str,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    chunk: Bytes,
) -> Result<(), ()> {
    let len = chunk.len();
    tokio::select! {
        _ = ctx.shutdown.cancelled() => return Err(()),
        sent = tx.send(Ok(chunk)) => sent.map_err(|_| ())?,
    }
    ctx.registry.on_bytes(client_id, len).await;
    Ok(())
}

/// One multipart body part followed by the next boundary marker
fn encode_part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + boundary.len() + 64);
    part.extend_from_slice(
        format!(
            "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    Bytes::from(part)
}

/// Detects clients that keep falling behind the frame source.
///
/// Frame ids are monotonic, so conflation shows up as id gaps: `emitted`
/// advances by the gap, `written` by one per delivered frame. Crossing the
/// gap threshold reports slow once and rebases the counters.
struct SlowGauge {
    last_id: Option<u64>,
    emitted: u64,
    written: u64,
}

impl SlowGauge {
    fn new() -> Self {
        Self {
            last_id: None,
            emitted: 0,
            written: 0,
        }
    }

    fn on_frame(&mut self, id: u64) -> bool {
        match self.last_id {
            Some(prev) => self.emitted += id.saturating_sub(prev),
            None => self.emitted += 1,
        }
        self.last_id = Some(id);
        self.written += 1;
        if self.emitted.saturating_sub(self.written) >= SLOW_FRAME_GAP {
            self.written = self.emitted;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientRegistry, SystemClock};
    use crate::settings::SettingsSnapshot;

    fn test_ctx() -> ServerCtx {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        ServerCtx {
            pages: Arc::new(ServerPages::render(&SettingsSnapshot::default())),
            registry: ClientRegistry::new(
                false,
                false,
                "000000".to_string(),
                Arc::new(SystemClock),
                events_tx.clone(),
            ),
            frames: Arc::new(FrameSource::new()),
            events: events_tx,
            enable_pin: false,
            block_address: false,
            enable_buttons: false,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_send_chunk_unblocks_on_shutdown() {
        let ctx = test_ctx();
        let (tx, _rx) = mpsc::channel::<io::Result<Bytes>>(1);
        // Fill the capacity-1 channel so the next send would block forever.
        tx.send(Ok(Bytes::from_static(b"x"))).await.unwrap();

        ctx.shutdown.cancel();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            send_chunk(&ctx, "client", &tx, Bytes::from_static(b"y")),
        )
        .await
        .expect("blocked writer did not observe shutdown");
        assert_eq!(result, Err(()));
    }

    #[test]
    fn test_gauge_keeps_pace() {
        let mut gauge = SlowGauge::new();
        for id in 1..=100 {
            assert!(!gauge.on_frame(id), "sequential ids must not report slow");
        }
    }

    #[test]
    fn test_gauge_detects_gap() {
        let mut gauge = SlowGauge::new();
        assert!(!gauge.on_frame(1));
        assert!(!gauge.on_frame(3));
        assert!(!gauge.on_frame(5));
        // Cumulative gap reaches the threshold here.
        assert!(gauge.on_frame(9));
    }

    #[test]
    fn test_gauge_rebases_after_report() {
        let mut gauge = SlowGauge::new();
        assert!(!gauge.on_frame(1));
        assert!(gauge.on_frame(10));
        // Counters were rebased; steady delivery is quiet again.
        assert!(!gauge.on_frame(11));
        assert!(!gauge.on_frame(12));
        assert!(gauge.on_frame(25));
    }

    #[test]
    fn test_gauge_first_frame_has_no_history_penalty() {
        let mut gauge = SlowGauge::new();
        // A client joining mid-stream starts at a high id without being slow.
        assert!(!gauge.on_frame(5000));
        assert!(!gauge.on_frame(5001));
    }

    #[test]
    fn test_encode_part_layout() {
        let part = encode_part("abc", b"\xff\xd8jpeg\xff\xd9");
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("Content-Type: image/jpeg\r\nContent-Length: 8\r\n\r\n"));
        assert!(text.ends_with("\r\n--abc\r\n"));
    }
}
