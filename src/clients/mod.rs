//! Client Registry - Connection Tracking & Access Control
//!
//! ## Responsibilities
//!
//! - One entry per distinct remote address:port, created on first contact
//! - PIN failure counting and temporary address blocking
//! - Disconnect hold windows before entries are pruned
//! - 1 Hz statistics tick: pruning, traffic aggregation, diffed publication
//!
//! The registry is owned by one HTTP server instance and recreated on every
//! server restart. Entry mutation is synchronized per entry, not globally.
//! All wall-clock reads go through the injected [`Clock`].

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::server::ServerEvent;

/// Consecutive PIN failures before the address is blocked
pub const WRONG_PIN_MAX_COUNT: u32 = 5;
/// How long a blocked address stays blocked
pub const ADDRESS_BLOCK_MILLIS: i64 = 5 * 60 * 1000;
/// Grace period before a disconnected entry becomes removable
pub const DISCONNECT_HOLD_MILLIS: i64 = 5 * 1000;
/// Length of the traffic history window, one sample per second
pub const TRAFFIC_HISTORY_SECONDS: usize = 30;

/// Injected wall clock
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Stable client id derived from the remote endpoint
pub fn client_id(address: IpAddr, port: u16) -> String {
    let digest = Sha256::digest(format!("{address}:{port}").as_bytes());
    STANDARD_NO_PAD.encode(digest)
}

/// Aggregate bytes sent during one one-second window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficPoint {
    pub time: i64,
    pub bytes: u64,
}

/// Derived per-client status, in publication precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Blocked,
    Disconnected,
    SlowConnection,
    Connected,
}

/// Published view of one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub address: String,
    pub status: ClientStatus,
}

#[derive(Debug)]
struct ConnectedClient {
    id: String,
    address: IpAddr,
    port: u16,
    pin_attempts: u32,
    is_pin_validated: bool,
    is_blocked: bool,
    blocked_until: i64,
    is_slow_connection: bool,
    is_disconnected: bool,
    hold_until: i64,
    bytes_sent: u64,
}

impl ConnectedClient {
    fn new(id: String, address: IpAddr, port: u16) -> Self {
        Self {
            id,
            address,
            port,
            pin_attempts: 0,
            is_pin_validated: false,
            is_blocked: false,
            blocked_until: 0,
            is_slow_connection: false,
            is_disconnected: false,
            hold_until: 0,
            bytes_sent: 0,
        }
    }

    fn on_pin_check(&mut self, is_valid: bool, block_address: bool, now: i64) {
        if !is_valid {
            self.pin_attempts += 1;
            if block_address && self.pin_attempts >= WRONG_PIN_MAX_COUNT {
                self.is_pin_validated = false;
                self.is_blocked = true;
                self.blocked_until = now + ADDRESS_BLOCK_MILLIS;
            }
        } else if !self.is_blocked {
            self.is_pin_validated = true;
            self.pin_attempts = 0;
        }
    }

    fn set_disconnected(&mut self, now: i64) {
        self.is_disconnected = true;
        if !self.is_blocked {
            self.hold_until = now + DISCONNECT_HOLD_MILLIS;
        }
    }

    fn take_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.bytes_sent)
    }

    // Blocked entries are retained until the block itself expires,
    // independent of the disconnect hold.
    fn can_remove(&self, now: i64) -> bool {
        let hold = if self.is_blocked {
            self.blocked_until
        } else {
            self.hold_until
        };
        self.is_disconnected && now >= hold
    }

    fn is_address_blocked(&self, now: i64) -> bool {
        self.is_blocked && now < self.blocked_until
    }

    fn to_info(&self) -> ClientInfo {
        let status = if self.is_blocked {
            ClientStatus::Blocked
        } else if self.is_disconnected {
            ClientStatus::Disconnected
        } else if self.is_slow_connection {
            ClientStatus::SlowConnection
        } else {
            ClientStatus::Connected
        };
        ClientInfo {
            id: self.id.clone(),
            address: format!("{}:{}", self.address, self.port),
            status,
        }
    }
}

/// Registry instance, one per running HTTP server
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Mutex<ConnectedClient>>>>,
    traffic: Mutex<VecDeque<TrafficPoint>>,
    published: Mutex<Vec<ClientInfo>>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<ServerEvent>,
    shutdown: CancellationToken,
    enable_pin: bool,
    block_address: bool,
    pin: String,
}

impl ClientRegistry {
    pub fn new(
        enable_pin: bool,
        block_address: bool,
        pin: String,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<Self> {
        let now = clock.now_millis();
        let past = now - TRAFFIC_HISTORY_SECONDS as i64 * 1000;
        let traffic = (0..TRAFFIC_HISTORY_SECONDS)
            .map(|i| TrafficPoint {
                time: past + i as i64 * 1000,
                bytes: 0,
            })
            .collect();

        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            traffic: Mutex::new(traffic),
            published: Mutex::new(Vec::new()),
            clock,
            events,
            shutdown: CancellationToken::new(),
            enable_pin,
            block_address,
            pin,
        })
    }

    /// Spawn the 1 Hz statistics loop; stopped by [`ClientRegistry::destroy`]
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = interval.tick() => registry.run_tick().await,
                }
            }
            tracing::debug!("Client statistics loop stopped");
        });
    }

    pub fn destroy(&self) {
        self.shutdown.cancel();
    }

    pub async fn clear(&self) {
        self.clients.write().await.clear();
    }

    /// Register first contact from `address:port`, or revive the existing
    /// entry. PIN and block state survive a reconnect from the same endpoint.
    pub async fn on_connected(&self, address: IpAddr, port: u16) -> String {
        let id = client_id(address, port);
        let mut clients = self.clients.write().await;
        match clients.get(&id) {
            Some(entry) => {
                let mut client = entry.lock().await;
                client.is_disconnected = false;
            }
            None => {
                clients.insert(
                    id.clone(),
                    Arc::new(Mutex::new(ConnectedClient::new(id.clone(), address, port))),
                );
            }
        }
        id
    }

    pub async fn on_disconnected(&self, id: &str) {
        let now = self.clock.now_millis();
        if let Some(entry) = self.entry(id).await {
            entry.lock().await.set_disconnected(now);
        }
    }

    /// Compare the submitted PIN and update failure/block state.
    /// Returns whether the PIN matched.
    pub async fn verify_pin(&self, id: &str, supplied: &str) -> bool {
        let Some(entry) = self.entry(id).await else {
            tracing::warn!(client_id = %id, "PIN check for unknown client");
            return false;
        };
        let is_valid = supplied == self.pin;
        let now = self.clock.now_millis();
        entry.lock().await.on_pin_check(is_valid, self.block_address, now);
        is_valid
    }

    /// Whether this exact client just crossed into the blocked state
    pub async fn is_client_blocked(&self, id: &str) -> bool {
        if !(self.enable_pin && self.block_address) {
            return false;
        }
        match self.entry(id).await {
            Some(entry) => entry.lock().await.is_blocked,
            None => false,
        }
    }

    /// Any entry sharing `address` has validated the PIN
    pub async fn is_client_authorized(&self, address: IpAddr) -> bool {
        if !self.enable_pin {
            return true;
        }
        for entry in self.clients.read().await.values() {
            let client = entry.lock().await;
            if client.address == address && client.is_pin_validated {
                return true;
            }
        }
        false
    }

    /// Any entry sharing `address` is inside an active block window
    pub async fn is_address_blocked(&self, address: IpAddr) -> bool {
        if !(self.enable_pin && self.block_address) {
            return false;
        }
        let now = self.clock.now_millis();
        for entry in self.clients.read().await.values() {
            let client = entry.lock().await;
            if client.address == address && client.is_address_blocked(now) {
                return true;
            }
        }
        false
    }

    /// Admission rule for frame delivery
    pub async fn is_client_allowed(&self, address: IpAddr) -> bool {
        !self.enable_pin
            || !self.block_address
            || (self.is_client_authorized(address).await && !self.is_address_blocked(address).await)
    }

    pub async fn on_bytes(&self, id: &str, count: usize) {
        if let Some(entry) = self.entry(id).await {
            entry.lock().await.bytes_sent += count as u64;
        }
    }

    /// Advisory; never cleared for a live connection
    pub async fn on_slow_connection(&self, id: &str) {
        if let Some(entry) = self.entry(id).await {
            let mut client = entry.lock().await;
            if !client.is_disconnected {
                client.is_slow_connection = true;
            }
        }
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<ConnectedClient>>> {
        self.clients.read().await.get(id).cloned()
    }

    /// One statistics tick: prune, aggregate traffic, publish diffs.
    /// Runs every second from the spawned loop; callable directly in tests.
    pub(crate) async fn run_tick(&self) {
        let now = self.clock.now_millis();
        let mut infos = Vec::new();
        let mut bytes_this_window: u64 = 0;

        {
            let mut clients = self.clients.write().await;
            let mut removable = Vec::new();
            for (id, entry) in clients.iter() {
                let mut client = entry.lock().await;
                if client.can_remove(now) {
                    removable.push(id.clone());
                    continue;
                }
                bytes_this_window += client.take_bytes();
                infos.push(client.to_info());
            }
            for id in removable {
                clients.remove(&id);
            }
        }

        let history = {
            let mut traffic = self.traffic.lock().await;
            traffic.pop_front();
            traffic.push_back(TrafficPoint {
                time: now,
                bytes: bytes_this_window,
            });
            traffic.iter().copied().collect::<Vec<_>>()
        };
        let _ = self.events.send(ServerEvent::Traffic(history));

        infos.sort_by(|a, b| a.address.cmp(&b.address));
        let mut published = self.published.lock().await;
        if *published != infos {
            *published = infos.clone();
            let _ = self.events.send(ServerEvent::Clients(infos));
        }
    }
}
