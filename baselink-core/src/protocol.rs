//! Post-handshake wire messages between the wallet app and the base.

use serde::{Deserialize, Serialize};

/// All message kinds carried over the encrypted channel. Encoding is bincode;
/// framing is length-prefix (see the wire module). The enum is closed: every
/// frame decodes to exactly one of these or is a protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Ask the base for its system environment.
    SystemEnvRequest,
    /// Reply to `SystemEnvRequest`.
    SystemEnvResponse(SystemEnv),
    /// Unsolicited status broadcast from the base.
    StatusEvent(BaseStatus),
    /// Liveness probe; the base answers with `Pong`.
    Ping,
    Pong,
}

/// System environment reported by the base. `network` is its own field and is
/// never derived from the RPC port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEnv {
    pub electrs_rpc_port: String,
    pub network: String,
}

/// Last-known asynchronous status of the base, overwritten wholesale on each
/// status event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseStatus {
    pub blocks: i64,
    pub difficulty: f64,
    pub lightning_alias: String,
}

/// Correlation tag matching a reply to the request that triggered it. One
/// outstanding request per tag at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTag {
    SystemEnv,
    Ping,
}

impl RequestTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestTag::SystemEnv => "systemEnv",
            RequestTag::Ping => "ping",
        }
    }
}

impl Message {
    /// The tag this message answers, if it is a reply kind.
    pub fn reply_tag(&self) -> Option<RequestTag> {
        match self {
            Message::SystemEnvResponse(_) => Some(RequestTag::SystemEnv),
            Message::Pong => Some(RequestTag::Ping),
            _ => None,
        }
    }

    /// Whether this is an unsolicited event kind.
    pub fn is_event(&self) -> bool {
        matches!(self, Message::StatusEvent(_))
    }
}
