//! Wallet-side client for the companion base device.
//!
//! Dial order: HTTP reachability probe, websocket upgrade, Noise XX
//! handshake (with human pairing verification when required), then the
//! encrypted transport pumps and the request/response dispatcher.

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod handshake;
pub mod session;
pub mod store;
pub mod transport;

pub use config::Config;
pub use dispatcher::{DispatchError, Dispatcher, FailureCallback};
pub use events::{pairing_code_topic, status_topic, Event, EventSink};
pub use handshake::AuthError;
pub use session::{BaseSession, ConnectError, ConnectOptions, SessionState};
pub use store::KeyStore;
pub use transport::{ShutdownToken, Transport, TransportError};
