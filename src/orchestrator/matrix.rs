//! Event Legality Matrix
//!
//! Exhaustive (state, event kind) table deciding whether an event is
//! processed, silently skipped, or a contract violation. The match is total
//! over both enums, so adding a state or event without extending the table
//! fails compilation.

use crate::orchestrator::{EventKind, StreamingState};

/// Outcome of the legality check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run the transition
    Process,
    /// Drop the event, keep state unchanged
    Skip,
    /// Programming error; the dispatcher panics
    Error,
}

pub fn action_for(state: StreamingState, kind: EventKind) -> Action {
    use Action::{Error, Process, Skip};
    use EventKind as K;
    use StreamingState as S;

    match (state, kind) {
        (S::Created, K::DiscoverAddress) => Process,
        (S::Created, K::StartServer) => Error,
        (S::Created, K::ComponentError) => Process,
        (S::Created, K::StartStopFromWebPage) => Error,
        (S::Created, K::RestartServer) => Process,
        (S::Created, K::ScreenOff) => Skip,
        (S::Created, K::Destroy) => Process,
        (S::Created, K::StartStream) => Skip,
        (S::Created, K::CastPermissionsDenied) => Skip,
        (S::Created, K::StartProjection) => Error,
        (S::Created, K::StopStream) => Error,
        (S::Created, K::RequestPublicState) => Process,
        (S::Created, K::RecoverError) => Skip,

        (S::AddressDiscovered, K::DiscoverAddress) => Process,
        (S::AddressDiscovered, K::StartServer) => Process,
        (S::AddressDiscovered, K::ComponentError) => Process,
        (S::AddressDiscovered, K::StartStopFromWebPage) => Skip,
        (S::AddressDiscovered, K::RestartServer) => Process,
        (S::AddressDiscovered, K::ScreenOff) => Skip,
        (S::AddressDiscovered, K::Destroy) => Process,
        (S::AddressDiscovered, K::StartStream) => Skip,
        (S::AddressDiscovered, K::CastPermissionsDenied) => Skip,
        (S::AddressDiscovered, K::StartProjection) => Skip,
        (S::AddressDiscovered, K::StopStream) => Skip,
        (S::AddressDiscovered, K::RequestPublicState) => Process,
        (S::AddressDiscovered, K::RecoverError) => Process,

        (S::ServerStarted, K::DiscoverAddress) => Process,
        (S::ServerStarted, K::StartServer) => Skip,
        (S::ServerStarted, K::ComponentError) => Process,
        (S::ServerStarted, K::StartStopFromWebPage) => Process,
        (S::ServerStarted, K::RestartServer) => Process,
        (S::ServerStarted, K::ScreenOff) => Skip,
        (S::ServerStarted, K::Destroy) => Process,
        (S::ServerStarted, K::StartStream) => Process,
        (S::ServerStarted, K::CastPermissionsDenied) => Skip,
        (S::ServerStarted, K::StartProjection) => Process,
        (S::ServerStarted, K::StopStream) => Skip,
        (S::ServerStarted, K::RequestPublicState) => Process,
        (S::ServerStarted, K::RecoverError) => Process,

        (S::PermissionPending, K::DiscoverAddress) => Process,
        (S::PermissionPending, K::StartServer) => Process,
        (S::PermissionPending, K::ComponentError) => Process,
        (S::PermissionPending, K::StartStopFromWebPage) => Skip,
        (S::PermissionPending, K::RestartServer) => Process,
        (S::PermissionPending, K::ScreenOff) => Skip,
        (S::PermissionPending, K::Destroy) => Process,
        (S::PermissionPending, K::StartStream) => Skip,
        (S::PermissionPending, K::CastPermissionsDenied) => Process,
        (S::PermissionPending, K::StartProjection) => Process,
        (S::PermissionPending, K::StopStream) => Skip,
        (S::PermissionPending, K::RequestPublicState) => Process,
        (S::PermissionPending, K::RecoverError) => Process,

        (S::Streaming, K::DiscoverAddress) => Skip,
        (S::Streaming, K::StartServer) => Error,
        (S::Streaming, K::ComponentError) => Process,
        (S::Streaming, K::StartStopFromWebPage) => Process,
        (S::Streaming, K::RestartServer) => Process,
        (S::Streaming, K::ScreenOff) => Process,
        (S::Streaming, K::Destroy) => Process,
        (S::Streaming, K::StartStream) => Skip,
        (S::Streaming, K::CastPermissionsDenied) => Skip,
        (S::Streaming, K::StartProjection) => Skip,
        (S::Streaming, K::StopStream) => Process,
        (S::Streaming, K::RequestPublicState) => Process,
        (S::Streaming, K::RecoverError) => Process,

        (S::RestartPending, K::DiscoverAddress) => Process,
        (S::RestartPending, K::StartServer) => Skip,
        (S::RestartPending, K::ComponentError) => Process,
        (S::RestartPending, K::StartStopFromWebPage) => Skip,
        (S::RestartPending, K::RestartServer) => Skip,
        (S::RestartPending, K::ScreenOff) => Skip,
        (S::RestartPending, K::Destroy) => Process,
        (S::RestartPending, K::StartStream) => Skip,
        (S::RestartPending, K::CastPermissionsDenied) => Skip,
        (S::RestartPending, K::StartProjection) => Skip,
        (S::RestartPending, K::StopStream) => Skip,
        (S::RestartPending, K::RequestPublicState) => Process,
        (S::RestartPending, K::RecoverError) => Process,

        (S::Error, K::DiscoverAddress) => Skip,
        (S::Error, K::StartServer) => Skip,
        (S::Error, K::ComponentError) => Process,
        (S::Error, K::StartStopFromWebPage) => Skip,
        (S::Error, K::RestartServer) => Process,
        (S::Error, K::ScreenOff) => Skip,
        (S::Error, K::Destroy) => Process,
        (S::Error, K::StartStream) => Skip,
        (S::Error, K::CastPermissionsDenied) => Skip,
        (S::Error, K::StartProjection) => Skip,
        (S::Error, K::StopStream) => Skip,
        (S::Error, K::RequestPublicState) => Process,
        (S::Error, K::RecoverError) => Process,

        (S::Destroyed, _) => Skip,
    }
}
