//! Handshake coordinator.
//!
//! ```text
//! Idle --connect--> Connecting --ok--> Ready
//!                              \-err--> Failed
//! ```
//!
//! `Ready` and `Failed` are terminal. `connect` is only accepted from `Idle`.

use futures::future::{self, BoxFuture, FutureExt};
use log::{info, warn};
use std::sync::{Arc, Mutex, PoisonError};

use crate::channel::TransportChannel;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameKind, Handshake, PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Failed,
}

/// Connection establishment, as seen by the client factory.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    /// Perform the handshake. The future resolves once the connection is
    /// ready, or fails with the cause unchanged. Dropping the future does
    /// not abort a handshake already started.
    fn connect(&self, config: &ClientConfig) -> BoxFuture<'static, Result<()>>;

    fn state(&self) -> ConnectionState;
}

/// Handshake coordinator bound to one channel.
pub struct ConnectionManager {
    channel: Arc<TransportChannel>,
    state: Arc<Mutex<ConnectionState>>,
    client_id: String,
}

impl ConnectionManager {
    pub fn new(channel: Arc<TransportChannel>) -> Self {
        Self {
            channel,
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Identifier presented to the server in the handshake
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn handshake_record(&self, config: &ClientConfig) -> Handshake {
        let credentials = config.credentials();
        let subscriptions = config.subscriptions();
        Handshake {
            version: PROTOCOL_VERSION,
            client_id: self.client_id.clone(),
            client_name: config.client_name().map(str::to_string),
            username: credentials.and_then(|c| c.username.clone()),
            password: credentials.map(|c| c.password.clone()),
            database_id: config.database_id(),
            channels: subscriptions.map(|s| s.channels().to_vec()).unwrap_or_default(),
            patterns: subscriptions.map(|s| s.patterns().to_vec()).unwrap_or_default(),
        }
    }

    fn set_state(state: &Mutex<ConnectionState>, next: ConnectionState) {
        *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// Interpret the server's answer to a handshake frame.
fn handshake_outcome(reply: Frame) -> Result<()> {
    match reply.kind {
        FrameKind::Response => Ok(()),
        FrameKind::Error => Err(Error::handshake_rejected(
            String::from_utf8_lossy(&reply.payload).into_owned(),
        )),
        other => Err(Error::protocol(format!(
            "unexpected {:?} frame in reply to handshake",
            other
        ))),
    }
}

impl Connector for ConnectionManager {
    fn connect(&self, config: &ClientConfig) -> BoxFuture<'static, Result<()>> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ConnectionState::Idle {
                let err = Error::invalid_state(format!("connect called while {:?}", *state));
                return future::ready(Err(err)).boxed();
            }
            *state = ConnectionState::Connecting;
        }

        let payload = match self.channel.codec().encode(&self.handshake_record(config)) {
            Ok(payload) => payload,
            Err(e) => {
                Self::set_state(&self.state, ConnectionState::Failed);
                return future::ready(Err(e)).boxed();
            }
        };
        let frame = Frame::handshake(self.channel.next_correlation_id(), payload);
        let channel = Arc::clone(&self.channel);
        let state = Arc::clone(&self.state);
        let timeout = config.connection_timeout();
        info!("Starting handshake with {}", channel.peer());

        // Runs on the channel's resource so the handshake and the state
        // transition complete even if the caller stops waiting.
        let handle = channel.resource().handle().clone();
        let task_state = Arc::clone(&state);
        let handshake = handle.spawn(async move {
            let exchange = channel.send(frame);
            let reply = match timeout {
                Some(limit) => tokio::time::timeout(limit, exchange)
                    .await
                    .unwrap_or_else(|_| Err(Error::timeout("handshake timed out"))),
                None => exchange.await,
            };
            let outcome = reply.and_then(handshake_outcome);
            match &outcome {
                Ok(()) => {
                    Self::set_state(&task_state, ConnectionState::Ready);
                    info!("Connection to {} is ready", channel.peer());
                }
                Err(e) => {
                    Self::set_state(&task_state, ConnectionState::Failed);
                    warn!("Handshake with {} failed: {}", channel.peer(), e);
                }
            }
            outcome
        });

        async move {
            handshake.await.unwrap_or_else(|e| {
                Self::set_state(&state, ConnectionState::Failed);
                Err(Error::connection_closed(format!("handshake task stopped: {}", e)))
            })
        }
        .boxed()
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
