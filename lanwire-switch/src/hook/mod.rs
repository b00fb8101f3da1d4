//! Ordered hook pipeline every inbound frame passes through.
//!
//! Hooks run in registration order. The first hook returning an error drops
//! the frame; later hooks never see it.

pub mod access;
pub mod online;
pub mod request;

pub use access::AccessHook;
pub use online::{Flow, FlowKey, FlowSweeper, OnlineHook};
pub use request::{Control, RequestHook};

use crate::lease::LeaseError;
use crate::tap::TapError;
use async_trait::async_trait;
use lanwire_socket::{Action, Frame, FrameError, Session};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("session is not signed in")]
    NotSigned,

    #[error("authentication failed for {user}@{network}")]
    Denied { user: String, network: String },

    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("invalid control body: {0}")]
    Body(#[from] FrameError),

    #[error("tap: {0}")]
    Tap(#[from] TapError),

    #[error("lease: {0}")]
    Lease(#[from] LeaseError),

    #[error("switch is shutting down")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, HookError>;

#[async_trait]
pub trait Hook: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Inspect one frame. An error drops the frame.
    async fn on_frame(&self, session: &Session, frame: &Frame) -> Result<()>;

    /// Called once when a session closes.
    async fn on_close(&self, _session: &Session) {}
}

#[derive(Default)]
pub struct Pipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Run `frame` through every hook, stopping at the first error.
    pub async fn process(&self, session: &Session, frame: &Frame) -> Result<()> {
        for hook in &self.hooks {
            if let Err(e) = hook.on_frame(session, frame).await {
                trace!(hook = hook.name(), session = %session, error = %e, "Hook dropped frame");
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn on_close(&self, session: &Session) {
        for hook in &self.hooks {
            hook.on_close(session).await;
        }
    }
}

/// Send a control frame back on `session`, logging failures.
pub(crate) async fn reply<T: serde::Serialize>(session: &Session, action: Action, body: &T) {
    let frame = match Frame::control(action, body) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session = %session, %action, error = %e, "Failed to encode reply");
            return;
        }
    };
    if let Err(e) = session.write(&frame).await {
        debug!(session = %session, %action, error = %e, "Failed to send reply");
    }
}
