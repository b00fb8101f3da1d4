//! Frame sessions for the lanwire overlay.
//!
//! Points and the switch exchange [`Frame`]s over one of several transports.
//! This crate hides the transport behind [`Session`] (one connection, with
//! reconnect for clients) and [`Listener`] (accepting side).

pub mod backoff;
pub mod crypt;
pub mod frame;
pub mod listener;
pub mod session;
pub mod transport;

pub use backoff::Backoff;
pub use crypt::{BlockCrypt, CryptConfig, CryptError};
pub use frame::{Action, Frame, FrameError};
pub use listener::Listener;
pub use session::{Session, SessionError, SessionHandler, SessionId, SessionOptions, Status};
pub use transport::{Protocol, TransportConfig, TransportError};
