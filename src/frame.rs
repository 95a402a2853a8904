//! Frame Source - Latest-Frame Distribution
//!
//! Holds the single most recent JPEG frame. Distribution uses a watch
//! channel, so every reader always observes the newest frame and slow
//! readers skip superseded ones instead of queueing them. Frame ids are
//! monotonic; the gap between ids observed by a stream writer is what
//! drives slow-connection detection.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::watch;

/// Placeholder images published while no capture session is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// "Press start on the device"
    PressStart,
    /// Settings changed; clients must reload the page
    ReloadPage,
    /// Network settings changed; the server address moved
    NewAddress,
    /// Served to blocked/unauthorized stream clients
    AddressBlocked,
}

impl Placeholder {
    pub fn jpeg(self) -> &'static [u8] {
        match self {
            Placeholder::PressStart => include_bytes!("../assets/start.jpg"),
            Placeholder::ReloadPage => include_bytes!("../assets/reload-this-page.jpg"),
            Placeholder::NewAddress => include_bytes!("../assets/new-address.jpg"),
            Placeholder::AddressBlocked => include_bytes!("../assets/address-blocked.jpg"),
        }
    }
}

/// One published frame; `id == 0` is the empty pre-start frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub jpeg: Bytes,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }
}

/// Latest-value frame holder shared between the capture side and the server
#[derive(Debug)]
pub struct FrameSource {
    tx: watch::Sender<Frame>,
    next_id: AtomicU64,
}

impl FrameSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Frame {
            id: 0,
            jpeg: Bytes::new(),
        });
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish a new frame, replacing the previous one for every reader
    pub fn publish(&self, jpeg: Bytes) {
        if jpeg.is_empty() {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Frame { id, jpeg });
    }

    pub fn publish_placeholder(&self, placeholder: Placeholder) {
        self.publish(Bytes::from_static(placeholder.jpeg()));
    }

    /// Most recent frame bytes (empty before the first publish)
    pub fn latest_jpeg(&self) -> Bytes {
        self.tx.borrow().jpeg.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Frame> {
        self.tx.subscribe()
    }
}

impl Default for FrameSource {
    fn default() -> Self {
        Self::new()
    }
}
