//! Settings - Reactive Runtime Configuration
//!
//! ## Responsibilities
//!
//! - Single source of truth for runtime-mutable settings
//! - Typed reads and writes
//! - Change notifications (changes only, never the initial value)
//!
//! The orchestrator subscribes and turns changed keys into server restart
//! reasons; everything else reads the current snapshot on demand.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Default HTML background color (0xRRGGBB)
pub const DEFAULT_BACK_COLOR: u32 = 0x15_15_15;

/// One immutable snapshot of every setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    // Security
    pub enable_pin: bool,
    pub pin: String,
    pub auto_change_pin: bool,
    pub new_pin_on_start: bool,
    pub block_address: bool,

    // Network
    pub server_port: u16,
    pub wifi_only: bool,
    pub enable_ipv6: bool,
    pub enable_loopback: bool,
    pub loopback_only: bool,

    // HTML
    pub html_enable_buttons: bool,
    pub html_back_color: u32,

    // Behavior
    pub auto_start_stop: bool,
    pub notify_slow_connections: bool,
    pub stop_on_sleep: bool,
    pub keep_awake: bool,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            enable_pin: false,
            pin: "000000".to_string(),
            auto_change_pin: false,
            new_pin_on_start: false,
            block_address: false,
            server_port: 8080,
            wifi_only: false,
            enable_ipv6: false,
            enable_loopback: false,
            loopback_only: false,
            html_enable_buttons: false,
            html_back_color: DEFAULT_BACK_COLOR,
            auto_start_stop: false,
            notify_slow_connections: false,
            stop_on_sleep: false,
            keep_awake: false,
        }
    }
}

/// Classification of a changed key, used to pick the restart reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Requires page re-render / PIN re-configuration
    Settings,
    /// Requires address rediscovery and rebinding
    NetworkSettings,
    /// Behavioral flag, no restart needed
    Behavior,
}

/// Diff two snapshots into `(key, kind)` pairs, one per changed field
pub fn changed_keys(old: &SettingsSnapshot, new: &SettingsSnapshot) -> Vec<(&'static str, ChangeKind)> {
    let mut keys = Vec::new();

    macro_rules! diff {
        ($field:ident, $kind:expr) => {
            if old.$field != new.$field {
                keys.push((stringify!($field), $kind));
            }
        };
    }

    diff!(enable_pin, ChangeKind::Settings);
    diff!(pin, ChangeKind::Settings);
    diff!(block_address, ChangeKind::Settings);
    diff!(html_enable_buttons, ChangeKind::Settings);
    diff!(html_back_color, ChangeKind::Settings);

    diff!(server_port, ChangeKind::NetworkSettings);
    diff!(wifi_only, ChangeKind::NetworkSettings);
    diff!(enable_ipv6, ChangeKind::NetworkSettings);
    diff!(enable_loopback, ChangeKind::NetworkSettings);
    diff!(loopback_only, ChangeKind::NetworkSettings);

    diff!(auto_change_pin, ChangeKind::Behavior);
    diff!(new_pin_on_start, ChangeKind::Behavior);
    diff!(auto_start_stop, ChangeKind::Behavior);
    diff!(notify_slow_connections, ChangeKind::Behavior);
    diff!(stop_on_sleep, ChangeKind::Behavior);
    diff!(keep_awake, ChangeKind::Behavior);

    keys
}

/// Settings store with change notifications
#[derive(Debug, Clone)]
pub struct Settings {
    tx: watch::Sender<SettingsSnapshot>,
}

impl Settings {
    /// Create a store seeded with `initial`
    pub fn new(initial: SettingsSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current snapshot (cheap clone)
    pub fn get(&self) -> SettingsSnapshot {
        self.tx.borrow().clone()
    }

    /// Apply a mutation; subscribers are notified only if the value changed
    pub fn update(&self, mutate: impl FnOnce(&mut SettingsSnapshot)) {
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            mutate(snapshot);
            before != *snapshot
        });
    }

    pub fn set_pin(&self, pin: String) {
        self.update(|s| s.pin = pin);
    }

    /// Subscribe to snapshot changes. The receiver is marked seen so the
    /// first `changed()` resolves only on an actual change.
    pub fn subscribe(&self) -> watch::Receiver<SettingsSnapshot> {
        let mut rx = self.tx.subscribe();
        rx.borrow_and_update();
        rx
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(SettingsSnapshot::default())
    }
}
