//! Capture Pipeline Boundary
//!
//! The screen-capture/encoding pipeline is an external collaborator. The
//! orchestrator only acquires and releases sessions; the pipeline pushes
//! encoded frames into the shared [`FrameSource`](crate::frame::FrameSource)
//! on its own.

use async_trait::async_trait;

use crate::error::Result;

/// Opaque capture-permission token handed in by the platform layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionToken(pub String);

/// Handle to one active capture session; owned exclusively by the
/// orchestrator while streaming
#[derive(Debug)]
pub struct CaptureSession {
    pub id: u64,
}

/// Acquire/release seam toward the capture pipeline
#[async_trait]
pub trait CapturePipeline: Send + Sync {
    /// Start capturing under `token`. Fails with
    /// [`Error::CastSecurity`](crate::Error::CastSecurity) when the token
    /// is rejected.
    async fn acquire(&self, token: &PermissionToken) -> Result<CaptureSession>;

    /// Stop the session. Must be idempotent with respect to a pipeline
    /// that already tore itself down.
    async fn release(&self, session: CaptureSession);
}
