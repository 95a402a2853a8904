//! Orchestrator - Streaming State Machine
//!
//! ## Responsibilities
//!
//! - Single-owner event loop serializing every lifecycle transition
//! - Legality gating of each event through the [`matrix`] table
//! - Address discovery with retries, server start/restart, capture hand-off
//! - Conflated publication of [`PublicState`] and pass-through of server
//!   statistics as [`Effect`]s
//!
//! Events enter through a bounded queue. Overflow is a fatal condition and
//! is surfaced as [`Error::ChannelExhausted`] on the state effect stream.

pub mod matrix;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CapturePipeline, CaptureSession, PermissionToken};
use crate::clients::{ClientInfo, ClientStatus, Clock, TrafficPoint};
use crate::error::Error;
use crate::frame::{FrameSource, Placeholder};
use crate::network::{InterfaceFilter, InterfaceResolver, NetInterface};
use crate::orchestrator::matrix::{action_for, Action};
use crate::server::pages::random_pin;
use crate::server::{HttpServer, ServerEvent};
use crate::settings::{changed_keys, ChangeKind, Settings};

/// Bounded event queue; overflow is fatal
const EVENT_QUEUE_CAPACITY: usize = 32;
const EFFECT_CAPACITY: usize = 64;
/// Discovery attempts after the first before giving up
const DISCOVERY_RETRIES: u32 = 3;
const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Pause between server teardown and rediscovery on restart
const RESTART_DISCOVER_DELAY: Duration = Duration::from_secs(1);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle states of the streaming pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    Created,
    AddressDiscovered,
    ServerStarted,
    PermissionPending,
    Streaming,
    RestartPending,
    Error,
    Destroyed,
}

/// Why a server restart was requested; the payload is diagnostic only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    ConnectivityChanged(String),
    SettingsChanged(String),
    NetworkSettingsChanged(String),
}

/// Everything the state machine reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DiscoverAddress { attempt: u32 },
    StartServer,
    ComponentError(Error),
    StartStopFromWebPage,
    RestartServer(RestartReason),
    ScreenOff,
    Destroy,
    StartStream,
    CastPermissionsDenied,
    StartProjection(PermissionToken),
    StopStream,
    RequestPublicState,
    RecoverError,
}

/// Payload-free event discriminant, used by the legality matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DiscoverAddress,
    StartServer,
    ComponentError,
    StartStopFromWebPage,
    RestartServer,
    ScreenOff,
    Destroy,
    StartStream,
    CastPermissionsDenied,
    StartProjection,
    StopStream,
    RequestPublicState,
    RecoverError,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DiscoverAddress { .. } => EventKind::DiscoverAddress,
            Event::StartServer => EventKind::StartServer,
            Event::ComponentError(_) => EventKind::ComponentError,
            Event::StartStopFromWebPage => EventKind::StartStopFromWebPage,
            Event::RestartServer(_) => EventKind::RestartServer,
            Event::ScreenOff => EventKind::ScreenOff,
            Event::Destroy => EventKind::Destroy,
            Event::StartStream => EventKind::StartStream,
            Event::CastPermissionsDenied => EventKind::CastPermissionsDenied,
            Event::StartProjection(_) => EventKind::StartProjection,
            Event::StopStream => EventKind::StopStream,
            Event::RequestPublicState => EventKind::RequestPublicState,
            Event::RecoverError => EventKind::RecoverError,
        }
    }
}

/// Externally visible state, published only when it actually changes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicState {
    pub is_streaming: bool,
    pub is_busy: bool,
    pub waiting_for_permission: bool,
    pub net_interfaces: Vec<NetInterface>,
    pub error: Option<Error>,
}

impl Default for PublicState {
    fn default() -> Self {
        Self {
            is_streaming: false,
            is_busy: true,
            waiting_for_permission: false,
            net_interfaces: Vec::new(),
            error: None,
        }
    }
}

/// Outbound notifications for embedding applications
#[derive(Debug, Clone)]
pub enum Effect {
    State(PublicState),
    Clients(Vec<ClientInfo>),
    Traffic(Vec<TrafficPoint>),
    SlowConnectionDetected,
}

/// Owner of the event loop and all background tasks
pub struct Orchestrator {
    events_tx: mpsc::Sender<Event>,
    effects_tx: broadcast::Sender<Effect>,
    last_state: Arc<StdMutex<PublicState>>,
    lifecycle: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        resolver: Arc<dyn InterfaceResolver>,
        pipeline: Arc<dyn CapturePipeline>,
        frames: Arc<FrameSource>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        {
            let current = settings.get();
            if current.enable_pin && current.new_pin_on_start {
                settings.set_pin(random_pin());
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (effects_tx, _) = broadcast::channel(EFFECT_CAPACITY);
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let last_state = Arc::new(StdMutex::new(PublicState::default()));
        let lifecycle = CancellationToken::new();
        let is_streaming = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop {
            state: StreamingState::Created,
            interfaces: Vec::new(),
            token: None,
            session: None,
            error: None,
            previous: PublicState::default(),
            settings: settings.clone(),
            resolver,
            pipeline,
            frames: Arc::clone(&frames),
            server: HttpServer::new(clock, frames, server_tx),
            events_tx: events_tx.clone(),
            effects_tx: effects_tx.clone(),
            last_state: Arc::clone(&last_state),
            is_streaming: Arc::clone(&is_streaming),
            lifecycle: lifecycle.clone(),
        };
        let loop_task = tokio::spawn(event_loop.run(events_rx));

        spawn_server_event_consumer(
            server_rx,
            events_tx.clone(),
            effects_tx.clone(),
            settings.clone(),
            is_streaming,
            lifecycle.clone(),
        );
        spawn_settings_listener(settings, events_tx.clone(), lifecycle.clone());

        if events_tx.try_send(Event::DiscoverAddress { attempt: 0 }).is_err() {
            tracing::error!("Initial discovery event rejected");
        }

        Arc::new(Self {
            events_tx,
            effects_tx,
            last_state,
            lifecycle,
            loop_task: Mutex::new(Some(loop_task)),
        })
    }

    pub fn subscribe_effects(&self) -> broadcast::Receiver<Effect> {
        self.effects_tx.subscribe()
    }

    /// Enqueue an event. A full queue means the loop is wedged; this is
    /// reported as a fatal [`Error::ChannelExhausted`] state. Events after
    /// destroy are dropped silently.
    pub fn send_event(&self, event: Event) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::error!(?event, "Event queue exhausted");
                report_exhausted(&self.effects_tx, &self.last_state);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(?event, "Event after destroy ignored");
            }
        }
    }

    /// Enqueue an event after `delay`, unless the orchestrator is destroyed
    /// first. Lets embedders schedule things like start-on-boot streaming.
    pub fn send_event_after(self: &Arc<Self>, delay: Duration, event: Event) {
        let this = Arc::clone(self);
        let lifecycle = this.lifecycle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.send_event(event),
            }
        });
    }

    pub fn start_stream(&self) {
        self.send_event(Event::StartStream);
    }

    pub fn stop_stream(&self) {
        self.send_event(Event::StopStream);
    }

    pub fn start_projection(&self, token: PermissionToken) {
        self.send_event(Event::StartProjection(token));
    }

    pub fn cast_permissions_denied(&self) {
        self.send_event(Event::CastPermissionsDenied);
    }

    pub fn request_public_state(&self) {
        self.send_event(Event::RequestPublicState);
    }

    pub fn recover_error(&self) {
        self.send_event(Event::RecoverError);
    }

    pub fn connectivity_changed(&self, detail: impl Into<String>) {
        self.send_event(Event::RestartServer(RestartReason::ConnectivityChanged(
            detail.into(),
        )));
    }

    pub fn screen_off(&self) {
        self.send_event(Event::ScreenOff);
    }

    /// Terminal teardown; bounded, idempotent
    pub async fn destroy(&self) {
        let _ = self.events_tx.send(Event::Destroy).await;
        if let Some(task) = self.loop_task.lock().await.take() {
            if tokio::time::timeout(DESTROY_TIMEOUT, task).await.is_err() {
                tracing::warn!("Event loop did not stop in time");
            }
        }
        self.lifecycle.cancel();
    }
}

fn report_exhausted(
    effects_tx: &broadcast::Sender<Effect>,
    last_state: &StdMutex<PublicState>,
) {
    let snapshot = {
        let mut state = match last_state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.error = Some(Error::ChannelExhausted);
        state.clone()
    };
    let _ = effects_tx.send(Effect::State(snapshot));
}

/// Translates [`ServerEvent`]s into state-machine events and effects.
/// Also drives auto start/stop and slow-connection notifications from the
/// published client list.
fn spawn_server_event_consumer(
    mut server_rx: mpsc::UnboundedReceiver<ServerEvent>,
    events_tx: mpsc::Sender<Event>,
    effects_tx: broadcast::Sender<Effect>,
    settings: Settings,
    is_streaming: Arc<AtomicBool>,
    lifecycle: CancellationToken,
) {
    tokio::spawn(async move {
        let mut known_slow: Vec<String> = Vec::new();
        loop {
            let event = tokio::select! {
                _ = lifecycle.cancelled() => break,
                event = server_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                ServerEvent::StartStopRequest => {
                    let _ = events_tx.try_send(Event::StartStopFromWebPage);
                }
                ServerEvent::Clients(clients) => {
                    let snapshot = settings.get();
                    if snapshot.auto_start_stop {
                        let active = clients
                            .iter()
                            .any(|c| c.status != ClientStatus::Disconnected);
                        if active && !is_streaming.load(Ordering::SeqCst) {
                            let _ = events_tx.try_send(Event::StartStream);
                        } else if !active && is_streaming.load(Ordering::SeqCst) {
                            let _ = events_tx.try_send(Event::StopStream);
                        }
                    }
                    if snapshot.notify_slow_connections {
                        let newly_slow = clients.iter().any(|c| {
                            c.status == ClientStatus::SlowConnection
                                && !known_slow.contains(&c.id)
                        });
                        if newly_slow {
                            let _ = effects_tx.send(Effect::SlowConnectionDetected);
                        }
                    }
                    known_slow = clients
                        .iter()
                        .filter(|c| c.status == ClientStatus::SlowConnection)
                        .map(|c| c.id.clone())
                        .collect();
                    let _ = effects_tx.send(Effect::Clients(clients));
                }
                ServerEvent::Traffic(history) => {
                    let _ = effects_tx.send(Effect::Traffic(history));
                }
                ServerEvent::Error(error) => {
                    let _ = events_tx.try_send(Event::ComponentError(error));
                }
            }
        }
    });
}

/// Watches settings and requests a server restart when a key that affects
/// the running server changes. Behavior keys never force a restart.
fn spawn_settings_listener(
    settings: Settings,
    events_tx: mpsc::Sender<Event>,
    lifecycle: CancellationToken,
) {
    tokio::spawn(async move {
        let mut rx = settings.subscribe();
        let mut previous = settings.get();
        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let current = rx.borrow_and_update().clone();
            let keys = changed_keys(&previous, &current);
            previous = current;
            if keys.is_empty() {
                continue;
            }

            let named = |kind: ChangeKind| {
                keys.iter()
                    .filter(|(_, k)| *k == kind)
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let network = named(ChangeKind::NetworkSettings);
            let server = named(ChangeKind::Settings);
            let reason = if !network.is_empty() {
                RestartReason::NetworkSettingsChanged(network)
            } else if !server.is_empty() {
                RestartReason::SettingsChanged(server)
            } else {
                continue;
            };
            tracing::info!(?reason, "Settings change requires server restart");
            let _ = events_tx.try_send(Event::RestartServer(reason));
        }
    });
}

/// Mutable core; lives on the event-loop task only
struct EventLoop {
    state: StreamingState,
    interfaces: Vec<NetInterface>,
    token: Option<PermissionToken>,
    session: Option<CaptureSession>,
    error: Option<Error>,
    previous: PublicState,
    settings: Settings,
    resolver: Arc<dyn InterfaceResolver>,
    pipeline: Arc<dyn CapturePipeline>,
    frames: Arc<FrameSource>,
    server: HttpServer,
    events_tx: mpsc::Sender<Event>,
    effects_tx: broadcast::Sender<Effect>,
    last_state: Arc<StdMutex<PublicState>>,
    is_streaming: Arc<AtomicBool>,
    lifecycle: CancellationToken,
}

impl EventLoop {
    async fn run(mut self, mut events_rx: mpsc::Receiver<Event>) {
        while let Some(event) = events_rx.recv().await {
            let kind = event.kind();
            match action_for(self.state, kind) {
                Action::Process => {}
                Action::Skip => {
                    tracing::debug!(state = ?self.state, event = ?kind, "Event skipped");
                    continue;
                }
                Action::Error => {
                    panic!("illegal event {kind:?} in state {:?}", self.state)
                }
            }
            tracing::debug!(state = ?self.state, event = ?kind, "Processing event");
            self.dispatch(event).await;
            self.publish_if_changed();
            if self.state == StreamingState::Destroyed {
                break;
            }
        }
        self.lifecycle.cancel();
        tracing::info!("Event loop stopped");
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::DiscoverAddress { attempt } => self.discover(attempt),
            Event::StartServer => self.start_server().await,
            Event::ComponentError(error) => self.component_error(error).await,
            Event::StartStopFromWebPage => {
                if self.state == StreamingState::Streaming {
                    self.stop_stream().await;
                } else {
                    self.start_stream();
                }
            }
            Event::RestartServer(reason) => self.restart(reason).await,
            Event::ScreenOff => {
                if self.settings.get().stop_on_sleep && self.state == StreamingState::Streaming {
                    self.stop_stream().await;
                }
            }
            Event::Destroy => {
                self.release_session().await;
                self.server.stop().await;
                self.state = StreamingState::Destroyed;
            }
            Event::StartStream => self.start_stream(),
            Event::CastPermissionsDenied => {
                self.token = None;
                self.state = StreamingState::ServerStarted;
            }
            Event::StartProjection(token) => self.start_projection(token).await,
            Event::StopStream => self.stop_stream().await,
            Event::RequestPublicState => self.publish_always(),
            Event::RecoverError => {
                self.error = None;
                self.state = StreamingState::RestartPending;
                self.send(Event::DiscoverAddress { attempt: 0 });
            }
        }
    }

    fn discover(&mut self, attempt: u32) {
        let filter = InterfaceFilter::from_settings(&self.settings.get());
        let found = self.resolver.resolve(&filter);
        if found.is_empty() {
            self.interfaces.clear();
            if attempt < DISCOVERY_RETRIES {
                tracing::info!(attempt, "No usable interface, retrying discovery");
                self.state = StreamingState::RestartPending;
                self.send_after(
                    DISCOVERY_RETRY_DELAY,
                    Event::DiscoverAddress { attempt: attempt + 1 },
                );
            } else {
                tracing::error!("Address discovery exhausted its retries");
                self.error = Some(Error::AddressNotFound);
                self.state = StreamingState::Error;
            }
            return;
        }
        tracing::info!(count = found.len(), "Interfaces discovered");
        self.interfaces = found;
        self.state = StreamingState::AddressDiscovered;
        self.send(Event::StartServer);
    }

    async fn start_server(&mut self) {
        if self.interfaces.is_empty() {
            self.component_error(Error::AddressNotFound).await;
            return;
        }
        let snapshot = self.settings.get();
        match self.server.start(&self.interfaces, &snapshot).await {
            Ok(()) => {
                self.frames.publish_placeholder(Placeholder::PressStart);
                self.state = StreamingState::ServerStarted;
            }
            Err(error) => self.component_error(error).await,
        }
    }

    fn start_stream(&mut self) {
        match self.token.clone() {
            // A cached permission lets the stream restart without asking again.
            Some(token) => self.send(Event::StartProjection(token)),
            None => self.state = StreamingState::PermissionPending,
        }
    }

    async fn start_projection(&mut self, token: PermissionToken) {
        match self.pipeline.acquire(&token).await {
            Ok(session) => {
                self.session = Some(session);
                self.token = Some(token);
                self.state = StreamingState::Streaming;
            }
            Err(error) => {
                tracing::error!(%error, "Capture acquisition failed");
                self.token = None;
                self.error = Some(error);
                self.state = StreamingState::Error;
            }
        }
    }

    async fn stop_stream(&mut self) {
        self.release_session().await;
        let snapshot = self.settings.get();
        if snapshot.enable_pin && snapshot.auto_change_pin {
            // Triggers the settings listener, which restarts the server
            // with the fresh PIN and a new stream path.
            self.settings.set_pin(random_pin());
        } else {
            self.frames.publish_placeholder(Placeholder::PressStart);
        }
        self.state = StreamingState::ServerStarted;
    }

    async fn restart(&mut self, reason: RestartReason) {
        self.release_session().await;
        match &reason {
            RestartReason::ConnectivityChanged(_) => {}
            RestartReason::SettingsChanged(_) => {
                self.frames.publish_placeholder(Placeholder::ReloadPage);
            }
            RestartReason::NetworkSettingsChanged(_) => {
                self.frames.publish_placeholder(Placeholder::NewAddress);
            }
        }
        self.server.stop().await;
        self.interfaces.clear();
        if self.error.is_some() {
            self.send(Event::RecoverError);
        } else {
            self.send_after(RESTART_DISCOVER_DELAY, Event::DiscoverAddress { attempt: 0 });
        }
        self.state = StreamingState::RestartPending;
    }

    // The server, if one is running, stays up in the error state; recovery
    // and restart both rebuild it anyway.
    async fn component_error(&mut self, error: Error) {
        tracing::error!(%error, recoverable = error.is_recoverable(), "Component failure");
        self.release_session().await;
        self.error = Some(error);
        self.state = StreamingState::Error;
    }

    async fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.pipeline.release(session).await;
        }
    }

    fn snapshot(&self) -> PublicState {
        PublicState {
            is_streaming: self.state == StreamingState::Streaming,
            is_busy: !matches!(
                self.state,
                StreamingState::ServerStarted | StreamingState::Streaming
            ),
            waiting_for_permission: self.state == StreamingState::PermissionPending,
            net_interfaces: self.interfaces.clone(),
            error: self.error.clone(),
        }
    }

    fn publish_if_changed(&mut self) {
        self.is_streaming
            .store(self.state == StreamingState::Streaming, Ordering::SeqCst);
        if self.state == StreamingState::Destroyed {
            return;
        }
        let snapshot = self.snapshot();
        if snapshot != self.previous {
            self.publish(snapshot);
        }
    }

    fn publish_always(&mut self) {
        let snapshot = self.snapshot();
        self.publish(snapshot);
    }

    fn publish(&mut self, snapshot: PublicState) {
        self.previous = snapshot.clone();
        if let Ok(mut guard) = self.last_state.lock() {
            *guard = snapshot.clone();
        }
        let _ = self.effects_tx.send(Effect::State(snapshot));
    }

    fn send(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            tracing::error!(?event, "Event queue exhausted from the event loop");
            report_exhausted(&self.effects_tx, &self.last_state);
        }
    }

    fn send_after(&self, delay: Duration, event: Event) {
        let events_tx = self.events_tx.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events_tx.try_send(event);
                }
            }
        });
    }
}
