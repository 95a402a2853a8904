//! HTTP Server - Lifecycle & Event Surface
//!
//! ## Responsibilities
//!
//! - Bind one listener per discovered interface at the configured port
//! - Per-start wiring: rendered pages, fresh client registry, router state
//! - Bounded graceful stop so restarts cannot hang on a stuck connection
//!
//! The server never mutates orchestrator state directly. Everything it
//! observes (toggle requests, client lists, traffic, runtime failures) is
//! reported through [`ServerEvent`] and consumed upstream.

pub mod pages;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::{ClientInfo, ClientRegistry, Clock, TrafficPoint};
use crate::error::{Error, Result};
use crate::frame::FrameSource;
use crate::network::NetInterface;
use crate::server::pages::ServerPages;
use crate::server::routes::{build_router, ServerCtx};
use crate::settings::SettingsSnapshot;

/// Upper bound on a graceful stop before tasks are aborted
const STOP_TIMEOUT: Duration = Duration::from_millis(300);

/// Everything the server reports upstream
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Web-page start/stop button was pressed
    StartStopRequest,
    /// Client list changed since the last publication
    Clients(Vec<ClientInfo>),
    /// Full traffic history window, sent every second
    Traffic(Vec<TrafficPoint>),
    /// Runtime failure while serving
    Error(Error),
}

struct RunningServer {
    shutdown: CancellationToken,
    registry: Arc<ClientRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

/// Embedded HTTP server, restartable without recreating the owner
pub struct HttpServer {
    clock: Arc<dyn Clock>,
    frames: Arc<FrameSource>,
    events: mpsc::UnboundedSender<ServerEvent>,
    running: Option<RunningServer>,
}

impl HttpServer {
    pub fn new(
        clock: Arc<dyn Clock>,
        frames: Arc<FrameSource>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            clock,
            frames,
            events,
            running: None,
        }
    }

    /// Stop any previous instance, then bind and serve on every interface.
    /// All listeners must bind before anything is served.
    pub async fn start(
        &mut self,
        interfaces: &[NetInterface],
        settings: &SettingsSnapshot,
    ) -> Result<()> {
        self.stop().await;

        let pages = Arc::new(ServerPages::render(settings));
        let registry = ClientRegistry::new(
            settings.enable_pin,
            settings.block_address,
            settings.pin.clone(),
            Arc::clone(&self.clock),
            self.events.clone(),
        );
        let shutdown = CancellationToken::new();
        let ctx = ServerCtx {
            pages: Arc::clone(&pages),
            registry: Arc::clone(&registry),
            frames: Arc::clone(&self.frames),
            events: self.events.clone(),
            enable_pin: settings.enable_pin,
            block_address: settings.block_address,
            enable_buttons: settings.html_enable_buttons,
            shutdown: shutdown.clone(),
        };

        let mut listeners = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let bind_addr = SocketAddr::new(interface.address, settings.server_port);
            let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    Error::AddressInUse
                } else {
                    Error::HttpServer(format!("bind {bind_addr}: {e}"))
                }
            })?;
            tracing::info!(address = %bind_addr, interface = %interface.name, "HTTP listener bound");
            listeners.push(listener);
        }

        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let router = build_router(ctx.clone());
            let events = self.events.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let serve = axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(token.cancelled_owned());
                if let Err(e) = serve.await {
                    let _ = events.send(ServerEvent::Error(Error::HttpServer(e.to_string())));
                }
            }));
        }

        registry.start();
        self.running = Some(RunningServer {
            shutdown,
            registry,
            tasks,
        });
        Ok(())
    }

    /// Bounded stop: cancel, wait up to [`STOP_TIMEOUT`], then abort
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        for mut task in running.tasks {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!("Server task did not stop in time, aborting");
                task.abort();
            }
        }
        running.registry.destroy();
        running.registry.clear().await;
        tracing::info!("HTTP server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}
