//! Lifecycle of one device session.
//!
//! ```text
//! Discovered ─connect─▶ Connecting{n} ─▶ ServicesDiscovering ─▶ Ready ◀─▶ Subscribed ─▶ Streaming
//!                        ▲    │ │                 │
//!                  retry └────┘ └──── give up ────┴─▶ Failed
//!
//! any connected/connecting state ─disconnect─▶ Disconnecting ─▶ Disconnected
//! any connected state ─link lost─▶ Disconnected
//! ```
//!
//! `Disconnected` and `Failed` accept a new connect request.

use serde::Serialize;

#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub enum SessionState {
    Discovered,
    Connecting { attempt: u32 },
    ServicesDiscovering,
    Ready,
    Subscribed,
    Streaming,
    Disconnecting,
    Disconnected,
    Failed { reason: String },
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum SessionInput {
    ConnectRequested,
    Retry { attempt: u32 },
    Connected,
    ServicesDiscovered,
    Subscribed,
    Unsubscribed,
    SampleReceived,
    GaveUp { reason: String },
    DisconnectRequested,
    Closed,
    LinkLost,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid transition from {from:?} on {input:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub input: SessionInput,
}

impl SessionState {
    pub fn next(&self, input: SessionInput) -> Result<SessionState, InvalidTransition> {
        use SessionInput as I;
        use SessionState as S;

        let next = match (self, &input) {
            (S::Discovered | S::Disconnected | S::Failed { .. }, I::ConnectRequested) => {
                Some(S::Connecting { attempt: 1 })
            }
            (S::Connecting { attempt }, I::Retry { attempt: next }) if next > attempt => {
                Some(S::Connecting { attempt: *next })
            }
            (S::ServicesDiscovering, I::Retry { attempt: next }) if *next > 1 => {
                Some(S::Connecting { attempt: *next })
            }
            (S::Connecting { .. }, I::Connected) => Some(S::ServicesDiscovering),
            (S::ServicesDiscovering, I::ServicesDiscovered) => Some(S::Ready),
            (S::Connecting { .. } | S::ServicesDiscovering, I::GaveUp { reason }) => {
                Some(S::Failed {
                    reason: reason.clone(),
                })
            }
            (S::Ready, I::Subscribed) => Some(S::Subscribed),
            (S::Subscribed | S::Streaming, I::Unsubscribed) => Some(S::Ready),
            (S::Subscribed | S::Streaming, I::SampleReceived) => Some(S::Streaming),
            (
                S::Connecting { .. } | S::ServicesDiscovering | S::Ready | S::Subscribed | S::Streaming,
                I::DisconnectRequested,
            ) => Some(S::Disconnecting),
            (S::Disconnecting, I::Closed) => Some(S::Disconnected),
            (S::ServicesDiscovering | S::Ready | S::Subscribed | S::Streaming, I::LinkLost) => {
                Some(S::Disconnected)
            }
            _ => None,
        };

        next.ok_or_else(|| InvalidTransition {
            from: self.clone(),
            input,
        })
    }

    /// Link is up and services are known.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Subscribed | SessionState::Streaming
        )
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self, SessionState::Subscribed | SessionState::Streaming)
    }

    /// Anything between a connect request and a completed disconnect.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            SessionState::Discovered | SessionState::Disconnected | SessionState::Failed { .. }
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SessionState::*;
        match self {
            Discovered => write!(f, "discovered"),
            Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            ServicesDiscovering => write!(f, "discovering services"),
            Ready => write!(f, "ready"),
            Subscribed => write!(f, "subscribed"),
            Streaming => write!(f, "streaming"),
            Disconnecting => write!(f, "disconnecting"),
            Disconnected => write!(f, "disconnected"),
            Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}
