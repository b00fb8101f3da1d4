//! Access control: credentials on sign-in, a signed-in point for the rest.

use super::{Hook, HookError, Result, reply};
use crate::config::NetworkConfig;
use crate::message::{SignResponse, SignResult};
use crate::point::Point;
use async_trait::async_trait;
use lanwire_socket::{Action, Frame, Session};
use std::collections::HashMap;
use tracing::info;

pub struct AccessHook {
    /// network -> user -> password
    users: HashMap<String, HashMap<String, String>>,
}

impl AccessHook {
    pub fn new(networks: &[NetworkConfig]) -> Self {
        let users = networks
            .iter()
            .map(|n| {
                let users = n
                    .users
                    .iter()
                    .map(|u| (u.name.clone(), u.password.clone()))
                    .collect();
                (n.name.clone(), users)
            })
            .collect();
        Self { users }
    }

    pub fn authenticate(&self, request: &SignResponse) -> Result<()> {
        let users = self
            .users
            .get(&request.network)
            .ok_or_else(|| HookError::UnknownNetwork(request.network.clone()))?;
        match users.get(&request.username) {
            Some(password) if *password == request.password => Ok(()),
            _ => Err(HookError::Denied {
                user: request.username.clone(),
                network: request.network.clone(),
            }),
        }
    }
}

#[async_trait]
impl Hook for AccessHook {
    fn name(&self) -> &'static str {
        "access"
    }

    async fn on_frame(&self, session: &Session, frame: &Frame) -> Result<()> {
        if frame.action() == Some(Action::SignResponse) {
            let request: SignResponse = frame.parse_body()?;
            if let Err(e) = self.authenticate(&request) {
                info!(session = %session, network = %request.network, error = %e, "Sign-in rejected");
                let result = SignResult::failed(&request.network, e.to_string());
                reply(session, Action::SignResult, &result).await;
                return Err(e);
            }
            return Ok(());
        }
        if session.private::<Point>().is_none() {
            return Err(HookError::NotSigned);
        }
        Ok(())
    }
}
