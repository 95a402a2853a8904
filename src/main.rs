//! MirrorCast - MJPEG Screen Streaming Host
//!
//! Headless host binary: wires the orchestrator to a directory-backed frame
//! pipeline and serves the stream on every discovered interface. Capture
//! permission is auto-granted, so this host streams as soon as a viewer or
//! the web page asks for it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mirrorcast::capture::{CapturePipeline, CaptureSession, PermissionToken};
use mirrorcast::clients::SystemClock;
use mirrorcast::frame::FrameSource;
use mirrorcast::network::SystemInterfaceResolver;
use mirrorcast::settings::{Settings, SettingsSnapshot};
use mirrorcast::{Effect, Error, Orchestrator, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cycles the JPEG files of a directory as the frame feed
struct DirectoryPipeline {
    dir: PathBuf,
    fps: u64,
    frames: Arc<FrameSource>,
    active: Mutex<Option<CancellationToken>>,
    next_session_id: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl CapturePipeline for DirectoryPipeline {
    async fn acquire(&self, _token: &PermissionToken) -> Result<CaptureSession> {
        let mut jpegs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::CaptureFailed(format!("{}: {e}", self.dir.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::CaptureFailed(e.to_string()))?
        {
            let path = entry.path();
            let is_jpeg = path
                .extension()
                .is_some_and(|ext| ext == "jpg" || ext == "jpeg");
            if is_jpeg {
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::CaptureFailed(e.to_string()))?;
                jpegs.push(Bytes::from(data));
            }
        }
        if jpegs.is_empty() {
            return Err(Error::CaptureFailed(format!(
                "no JPEG files in {}",
                self.dir.display()
            )));
        }

        let token = CancellationToken::new();
        let frames = Arc::clone(&self.frames);
        let period = Duration::from_millis(1000 / self.fps.max(1));
        let feed_token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut index = 0usize;
            loop {
                tokio::select! {
                    _ = feed_token.cancelled() => break,
                    _ = interval.tick() => {
                        frames.publish(jpegs[index % jpegs.len()].clone());
                        index += 1;
                    }
                }
            }
        });

        *self.active.lock().await = Some(token);
        let id = self
            .next_session_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(CaptureSession { id })
    }

    async fn release(&self, _session: CaptureSession) {
        if let Some(token) = self.active.lock().await.take() {
            token.cancel();
        }
    }
}

fn settings_from_env() -> SettingsSnapshot {
    let var = |name: &str| std::env::var(name).ok();
    let flag = |name: &str, default: bool| {
        var(name).map(|v| v == "true" || v == "1").unwrap_or(default)
    };
    let mut snapshot = SettingsSnapshot::default();
    snapshot.server_port = var("MIRRORCAST_PORT")
        .and_then(|v| v.parse().ok())
        .unwrap_or(snapshot.server_port);
    snapshot.enable_pin = flag("MIRRORCAST_ENABLE_PIN", snapshot.enable_pin);
    if let Some(pin) = var("MIRRORCAST_PIN") {
        snapshot.pin = pin;
    }
    snapshot.new_pin_on_start = flag("MIRRORCAST_NEW_PIN_ON_START", snapshot.new_pin_on_start);
    snapshot.block_address = flag("MIRRORCAST_BLOCK_ADDRESS", snapshot.block_address);
    snapshot.enable_loopback = flag("MIRRORCAST_ENABLE_LOOPBACK", snapshot.enable_loopback);
    snapshot.loopback_only = flag("MIRRORCAST_LOOPBACK_ONLY", snapshot.loopback_only);
    snapshot.enable_ipv6 = flag("MIRRORCAST_ENABLE_IPV6", snapshot.enable_ipv6);
    snapshot.wifi_only = flag("MIRRORCAST_WIFI_ONLY", snapshot.wifi_only);
    snapshot.html_enable_buttons = flag("MIRRORCAST_HTML_BUTTONS", true);
    snapshot.auto_start_stop = flag("MIRRORCAST_AUTO_START_STOP", true);
    snapshot.notify_slow_connections = flag("MIRRORCAST_NOTIFY_SLOW", true);
    snapshot
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrorcast=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let snapshot = settings_from_env();
    if snapshot.enable_pin && !snapshot.new_pin_on_start {
        tracing::info!(pin = %snapshot.pin, "PIN protection enabled");
    }
    let settings = Settings::new(snapshot);
    let frames = Arc::new(FrameSource::new());
    let pipeline = Arc::new(DirectoryPipeline {
        dir: std::env::var("MIRRORCAST_FRAME_DIR")
            .unwrap_or_else(|_| "demo-frames".to_string())
            .into(),
        fps: std::env::var("MIRRORCAST_FPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
        frames: Arc::clone(&frames),
        active: Mutex::new(None),
        next_session_id: std::sync::atomic::AtomicU64::new(1),
    });

    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(SystemInterfaceResolver),
        pipeline,
        frames,
        Arc::new(SystemClock),
    );

    // Headless host: grant capture permission whenever the machine asks.
    let mut effects = orchestrator.subscribe_effects();
    let grantor = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        while let Ok(effect) = effects.recv().await {
            match effect {
                Effect::State(state) => {
                    tracing::info!(
                        streaming = state.is_streaming,
                        busy = state.is_busy,
                        interfaces = state.net_interfaces.len(),
                        error = ?state.error,
                        "State changed"
                    );
                    if state.waiting_for_permission {
                        grantor.start_projection(PermissionToken("granted".to_string()));
                    }
                }
                Effect::SlowConnectionDetected => {
                    tracing::warn!("Slow connection detected");
                }
                Effect::Clients(clients) => {
                    tracing::debug!(count = clients.len(), "Client list changed");
                }
                Effect::Traffic(_) => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    orchestrator.destroy().await;
    Ok(())
}
