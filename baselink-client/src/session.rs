//! One authenticated connection to a base: dial, probe, upgrade, handshake,
//! then the encrypted transport and the dispatcher. A session is one-shot;
//! after `Closed` or `Failed` the caller dials a brand-new one.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use baselink_core::identity::Keypair;
use baselink_core::pairing::PairingStore;
use baselink_core::protocol::{BaseStatus, Message, RequestTag, SystemEnv};
use tokio::sync::watch;
use tokio_tungstenite::connect_async_with_config;

use crate::config::Config;
use crate::dispatcher::{DispatchError, Dispatcher, FailureCallback};
use crate::events::EventSink;
use crate::handshake::{authenticate, AuthError};
use crate::transport::{
    spawn_pumps, split_websocket, websocket_config, FrameReceiver, FrameSender,
};

/// Body marker the base serves on its plain HTTP root when it is up.
const READINESS_MARKER: &str = "OK!";

/// Lifecycle of one connection attempt. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Probing,
    WebSocketConnecting,
    Handshaking,
    PairingPending,
    Authenticated,
    Streaming,
    Closed,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The HTTP probe failed; the base may simply not be up yet.
    #[error("base unreachable: {0}")]
    Unreachable(String),
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The environment fetch after authentication did not complete.
    #[error("environment fetch failed: {0}")]
    Env(#[from] DispatchError),
    #[error("unexpected reply from base")]
    UnexpectedReply,
}

/// Caller-supplied timeouts. Nothing below the session layer has internal
/// timeouts; a silent peer would otherwise block the dial forever.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub probe_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConnectOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            probe_timeout: config.probe_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

pub struct BaseSession {
    identifier: String,
    address: String,
    registered_at: SystemTime,
    env: SystemEnv,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for BaseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseSession")
            .field("identifier", &self.identifier)
            .field("address", &self.address)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl BaseSession {
    /// Dial `address` (`host:port`): HTTP probe, websocket upgrade, noise
    /// handshake with pairing when required, then start streaming. The
    /// handshake timeout covers everything from the upgrade to the first
    /// environment reply, including the user's pairing confirmation.
    pub async fn connect(
        identifier: &str,
        address: &str,
        keypair: Keypair,
        store: &dyn PairingStore,
        sink: Arc<dyn EventSink>,
        on_failure: FailureCallback,
        options: &ConnectOptions,
    ) -> Result<BaseSession, ConnectError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Dialing);
        let state = Arc::new(state_tx);

        set_state(&state, SessionState::Probing);
        probe(address, options.probe_timeout).await?;

        set_state(&state, SessionState::WebSocketConnecting);
        let dial = async {
            let url = format!("ws://{address}/ws");
            // Bounded read at the socket layer; the pumps enforce the same
            // cap again per frame.
            let (ws, _) = connect_async_with_config(url, Some(websocket_config()), false)
                .await
                .map_err(|err| ConnectError::UpgradeFailed(err.to_string()))?;
            let (tx, rx) = split_websocket(ws);
            connect_over(
                tx, rx, identifier, address, keypair, store, sink, on_failure, state, state_rx,
            )
            .await
        };
        match tokio::time::timeout(options.handshake_timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout("handshake")),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Host part of the dialed address, without the port.
    pub fn address(&self) -> &str {
        self.address
            .split_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }

    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    pub fn electrs_rpc_port(&self) -> &str {
        &self.env.electrs_rpc_port
    }

    pub fn network(&self) -> &str {
        &self.env.network
    }

    /// Last status broadcast from the base, if any arrived yet.
    pub fn status(&self) -> Option<BaseStatus> {
        self.dispatcher.status()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Liveness round-trip over the encrypted channel.
    pub async fn ping(&self) -> Result<(), DispatchError> {
        self.dispatcher.request(RequestTag::Ping, Message::Ping).await?;
        Ok(())
    }

    /// Tear the connection down. Idempotent; the failure callback does not
    /// fire for a local close.
    pub fn close(&self) {
        set_state(&self.state, SessionState::Closed);
        self.dispatcher.close();
    }
}

/// Everything after the socket exists. Split out so tests can drive a
/// session over in-memory framed sockets.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn connect_over<TX, RX>(
    mut tx: TX,
    mut rx: RX,
    identifier: &str,
    address: &str,
    keypair: Keypair,
    store: &dyn PairingStore,
    sink: Arc<dyn EventSink>,
    on_failure: FailureCallback,
    state: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
) -> Result<BaseSession, ConnectError>
where
    TX: FrameSender,
    RX: FrameReceiver,
{
    set_state(&state, SessionState::Handshaking);
    let pairing_state = Arc::clone(&state);
    let channel = match authenticate(
        &mut tx,
        &mut rx,
        keypair,
        store,
        sink.as_ref(),
        identifier,
        move || set_state(&pairing_state, SessionState::PairingPending),
    )
    .await
    {
        Ok(channel) => channel,
        Err(err) => {
            set_state(&state, SessionState::Failed);
            return Err(err.into());
        }
    };
    set_state(&state, SessionState::Authenticated);

    let transport = spawn_pumps(tx, rx, channel.send_cipher, channel.recv_cipher);
    let failure_state = Arc::clone(&state);
    let dispatcher = Dispatcher::spawn(
        transport,
        sink,
        identifier.to_string(),
        address.to_string(),
        Box::new(move |addr| {
            set_state(&failure_state, SessionState::Failed);
            on_failure(addr);
        }),
    );
    set_state(&state, SessionState::Streaming);

    let env = match dispatcher
        .request(RequestTag::SystemEnv, Message::SystemEnvRequest)
        .await
    {
        Ok(Message::SystemEnvResponse(env)) => env,
        Ok(_) => {
            set_state(&state, SessionState::Failed);
            dispatcher.close();
            return Err(ConnectError::UnexpectedReply);
        }
        Err(err) => {
            set_state(&state, SessionState::Failed);
            dispatcher.close();
            return Err(err.into());
        }
    };
    tracing::info!(
        %identifier,
        network = %env.network,
        "base session established"
    );

    Ok(BaseSession {
        identifier: identifier.to_string(),
        address: address.to_string(),
        registered_at: SystemTime::now(),
        env,
        dispatcher,
        state,
        state_rx,
    })
}

/// Move the lifecycle forward. Terminal states are never overwritten.
fn set_state(state: &watch::Sender<SessionState>, next: SessionState) {
    state.send_if_modified(|current| {
        if matches!(*current, SessionState::Closed | SessionState::Failed) {
            return false;
        }
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// GET the base's plain HTTP root and check the readiness marker.
async fn probe(address: &str, timeout: Duration) -> Result<(), ConnectError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
    let response = client
        .get(format!("http://{address}/"))
        .send()
        .await
        .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(ConnectError::Unreachable(format!(
            "probe returned {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
    if !body.contains(READINESS_MARKER) {
        return Err(ConnectError::Unreachable(
            "readiness marker missing from probe response".into(),
        ));
    }
    Ok(())
}
