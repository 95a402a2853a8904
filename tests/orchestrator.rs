//! End-to-end orchestrator tests with fake discovery and capture.
//!
//! The HTTP server binds real loopback listeners on ephemeral ports, so
//! these tests exercise the full startup path without fixed port numbers.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mirrorcast::capture::{CapturePipeline, CaptureSession, PermissionToken};
use mirrorcast::clients::SystemClock;
use mirrorcast::frame::FrameSource;
use mirrorcast::network::{InterfaceFilter, InterfaceResolver, NetInterface};
use mirrorcast::settings::{Settings, SettingsSnapshot};
use mirrorcast::{Effect, Error, Orchestrator, PublicState};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

struct FakeResolver {
    interfaces: Mutex<Vec<NetInterface>>,
}

impl FakeResolver {
    fn with_loopback() -> Arc<Self> {
        Arc::new(Self {
            interfaces: Mutex::new(vec![loopback()]),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            interfaces: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, interfaces: Vec<NetInterface>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }
}

impl InterfaceResolver for FakeResolver {
    fn resolve(&self, _filter: &InterfaceFilter) -> Vec<NetInterface> {
        self.interfaces.lock().unwrap().clone()
    }
}

struct FakePipeline {
    fail: AtomicBool,
    acquired: AtomicU32,
    released: AtomicU32,
}

impl FakePipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            acquired: AtomicU32::new(0),
            released: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl CapturePipeline for FakePipeline {
    async fn acquire(&self, _token: &PermissionToken) -> mirrorcast::Result<CaptureSession> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::CastSecurity("projection rejected".to_string()));
        }
        let id = self.acquired.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        Ok(CaptureSession { id })
    }

    async fn release(&self, _session: CaptureSession) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn loopback() -> NetInterface {
    NetInterface {
        name: "lo".to_string(),
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

fn test_settings() -> SettingsSnapshot {
    SettingsSnapshot {
        server_port: 0,
        enable_loopback: true,
        loopback_only: true,
        ..Default::default()
    }
}

fn build(
    snapshot: SettingsSnapshot,
    resolver: Arc<FakeResolver>,
    pipeline: Arc<FakePipeline>,
) -> (Arc<Orchestrator>, broadcast::Receiver<Effect>, Settings) {
    let settings = Settings::new(snapshot);
    let orchestrator = Orchestrator::new(
        settings.clone(),
        resolver,
        pipeline,
        Arc::new(FrameSource::new()),
        Arc::new(SystemClock),
    );
    let effects = orchestrator.subscribe_effects();
    (orchestrator, effects, settings)
}

/// Wait for a state matching `predicate`. Re-requests the public state
/// periodically so a publication that raced the subscription is re-emitted.
async fn wait_for_state(
    orchestrator: &Orchestrator,
    effects: &mut broadcast::Receiver<Effect>,
    predicate: impl Fn(&PublicState) -> bool,
) -> PublicState {
    tokio::time::timeout(WAIT, async {
        let mut poll = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = poll.tick() => orchestrator.request_public_state(),
                result = effects.recv() => match result {
                    Ok(Effect::State(state)) if predicate(&state) => return state,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("effect stream closed: {e}"),
                },
            }
        }
    })
    .await
    .expect("expected state was never published")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_startup_reaches_server_started() {
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        FakePipeline::new(),
    );

    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;
    assert!(!state.is_streaming);
    assert!(state.error.is_none());
    assert_eq!(state.net_interfaces, vec![loopback()]);

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_stream_lifecycle() {
    let pipeline = FakePipeline::new();
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        Arc::clone(&pipeline),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;

    orchestrator.start_stream();
    let state = wait_for_state(&orchestrator, &mut effects, |s| s.waiting_for_permission).await;
    assert!(!state.is_streaming);

    orchestrator.start_projection(PermissionToken("granted".to_string()));
    wait_for_state(&orchestrator, &mut effects, |s| s.is_streaming).await;
    assert_eq!(pipeline.acquired.load(Ordering::SeqCst), 1);

    orchestrator.stop_stream();
    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.is_streaming && !s.is_busy).await;
    assert!(state.error.is_none());
    assert_eq!(pipeline.released.load(Ordering::SeqCst), 1);

    // The permission is cached, so restarting skips the pending phase.
    orchestrator.start_stream();
    wait_for_state(&orchestrator, &mut effects, |s| s.is_streaming).await;
    assert_eq!(pipeline.acquired.load(Ordering::SeqCst), 2);

    orchestrator.destroy().await;
    assert_eq!(pipeline.released.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_stream_while_streaming_is_ignored() {
    let pipeline = FakePipeline::new();
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        Arc::clone(&pipeline),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;

    orchestrator.start_stream();
    wait_for_state(&orchestrator, &mut effects, |s| s.waiting_for_permission).await;
    orchestrator.start_projection(PermissionToken("granted".to_string()));
    wait_for_state(&orchestrator, &mut effects, |s| s.is_streaming).await;

    orchestrator.start_stream();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.acquired.load(Ordering::SeqCst), 1);

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_permission_denied_returns_to_idle() {
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        FakePipeline::new(),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;

    orchestrator.start_stream();
    wait_for_state(&orchestrator, &mut effects, |s| s.waiting_for_permission).await;

    orchestrator.cast_permissions_denied();
    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.waiting_for_permission).await;
    assert!(!state.is_streaming);
    assert!(!state.is_busy);
    assert!(state.error.is_none());

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discovery_failure_then_recovery() {
    let resolver = FakeResolver::empty();
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        Arc::clone(&resolver),
        FakePipeline::new(),
    );

    // Three one-second retries precede the terminal discovery error.
    let state = wait_for_state(&orchestrator, &mut effects, |s| s.error.is_some()).await;
    assert_eq!(state.error, Some(Error::AddressNotFound));

    resolver.set(vec![loopback()]);
    orchestrator.recover_error();
    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;
    assert!(state.error.is_none());
    assert_eq!(state.net_interfaces, vec![loopback()]);

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capture_failure_enters_error_state() {
    let pipeline = FakePipeline::new();
    pipeline.fail.store(true, Ordering::SeqCst);
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        Arc::clone(&pipeline),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;

    orchestrator.start_stream();
    wait_for_state(&orchestrator, &mut effects, |s| s.waiting_for_permission).await;
    orchestrator.start_projection(PermissionToken("granted".to_string()));

    let state = wait_for_state(&orchestrator, &mut effects, |s| s.error.is_some()).await;
    assert_eq!(
        state.error,
        Some(Error::CastSecurity("projection rejected".to_string()))
    );
    assert!(!state.is_streaming);

    // Recovery clears the error and rebuilds the server.
    pipeline.fail.store(false, Ordering::SeqCst);
    orchestrator.recover_error();
    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy && s.error.is_none()).await;
    assert!(!state.is_streaming);

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settings_change_restarts_server() {
    let (orchestrator, mut effects, settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        FakePipeline::new(),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;

    settings.update(|s| s.html_back_color = 0x0000_FF00);
    wait_for_state(&orchestrator, &mut effects, |s| s.is_busy).await;
    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;
    assert!(state.error.is_none());

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connectivity_change_restarts_while_streaming() {
    let pipeline = FakePipeline::new();
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        Arc::clone(&pipeline),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;
    orchestrator.start_stream();
    wait_for_state(&orchestrator, &mut effects, |s| s.waiting_for_permission).await;
    orchestrator.start_projection(PermissionToken("granted".to_string()));
    wait_for_state(&orchestrator, &mut effects, |s| s.is_streaming).await;

    orchestrator.connectivity_changed("wifi roamed");
    let state = wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy && !s.is_streaming).await;
    assert!(state.error.is_none());
    // The restart released the capture session.
    assert_eq!(pipeline.released.load(Ordering::SeqCst), 1);

    orchestrator.destroy().await;
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

async fn index_status_line(port: u16) -> Option<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.ok()?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.ok()?;
    String::from_utf8_lossy(&buf).lines().next().map(str::to_string)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_keeps_serving_in_error_state() {
    let pipeline = FakePipeline::new();
    pipeline.fail.store(true, Ordering::SeqCst);
    let port = free_port();
    let snapshot = SettingsSnapshot {
        server_port: port,
        ..test_settings()
    };
    let (orchestrator, mut effects, _settings) = build(
        snapshot,
        FakeResolver::with_loopback(),
        Arc::clone(&pipeline),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;
    let line = index_status_line(port).await.expect("server unreachable");
    assert!(line.contains("200"), "unexpected response: {line}");

    orchestrator.start_stream();
    wait_for_state(&orchestrator, &mut effects, |s| s.waiting_for_permission).await;
    orchestrator.start_projection(PermissionToken("granted".to_string()));
    wait_for_state(&orchestrator, &mut effects, |s| s.error.is_some()).await;

    // The component failure must not tear down the HTTP server.
    let line = index_status_line(port)
        .await
        .expect("server unreachable in error state");
    assert!(line.contains("200"), "unexpected response in error state: {line}");

    orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_public_state_always_publishes() {
    let (orchestrator, mut effects, _settings) = build(
        test_settings(),
        FakeResolver::with_loopback(),
        FakePipeline::new(),
    );
    wait_for_state(&orchestrator, &mut effects, |s| !s.is_busy).await;

    // Drain, then ask twice; both requests must republish unchanged state.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while effects.try_recv().is_ok() {}
    for _ in 0..2 {
        orchestrator.request_public_state();
        let state = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(Effect::State(state)) = effects.recv().await {
                    return state;
                }
            }
        })
        .await
        .expect("state was not republished on request");
        assert!(!state.is_busy);
    }

    orchestrator.destroy().await;
}
