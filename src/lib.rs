//! MirrorCast Library
//!
//! Screen streaming over HTTP as an MJPEG multipart stream.
//!
//! ## Architecture (7 Components)
//!
//! 1. Settings - Watched configuration snapshots
//! 2. Network - Interface discovery and filtering
//! 3. Frame - Conflated JPEG frame source and placeholders
//! 4. Capture - Permission-gated capture pipeline seam
//! 5. Clients - Connection registry, PIN/block enforcement, traffic stats
//! 6. Server - Embedded HTTP server and MJPEG delivery
//! 7. Orchestrator - Streaming state machine and effect publication
//!
//! ## Design Principles
//!
//! - One owner per mutable state: the orchestrator event loop
//! - Events in through a bounded queue, effects out through broadcast
//! - Frame delivery is conflated; slow clients never stall the source

pub mod capture;
pub mod clients;
pub mod error;
pub mod frame;
pub mod network;
pub mod orchestrator;
pub mod server;
pub mod settings;

pub use error::{Error, Result};
pub use orchestrator::{Effect, Event, Orchestrator, PublicState, StreamingState};
