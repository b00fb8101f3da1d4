//! Control protocol requests: sign-in, ping, leave.

use super::{Hook, HookError, Result, reply};
use crate::message::{Ping, SignResponse, SignResult};
use async_trait::async_trait;
use lanwire_socket::{Action, Frame, Session};
use std::sync::Weak;
use tracing::info;

/// Switch operations the request hook drives.
#[async_trait]
pub trait Control: Send + Sync + 'static {
    /// Bind `session` to a point for an authenticated sign-in.
    async fn sign_in(&self, session: &Session, request: SignResponse) -> Result<SignResult>;

    /// The point asked to leave.
    async fn close_session(&self, session: &Session);
}

pub struct RequestHook {
    control: Weak<dyn Control>,
}

impl RequestHook {
    pub fn new(control: Weak<dyn Control>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Hook for RequestHook {
    fn name(&self) -> &'static str {
        "request"
    }

    async fn on_frame(&self, session: &Session, frame: &Frame) -> Result<()> {
        let Some(action) = frame.action() else {
            return Ok(());
        };
        match action {
            Action::SignResponse => {
                let control = self.control.upgrade().ok_or(HookError::Unavailable)?;
                let request: SignResponse = frame.parse_body()?;
                let network = request.network.clone();
                match control.sign_in(session, request).await {
                    Ok(result) => {
                        reply(session, Action::SignResult, &result).await;
                        Ok(())
                    }
                    Err(e) => {
                        reply(session, Action::SignResult, &SignResult::failed(&network, e.to_string())).await;
                        Err(e)
                    }
                }
            }
            Action::PingRequest => {
                reply(session, Action::PingResponse, &Ping::now()).await;
                Ok(())
            }
            Action::LeaveRequest => {
                info!(session = %session, "Point left");
                if let Some(control) = self.control.upgrade() {
                    control.close_session(session).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
