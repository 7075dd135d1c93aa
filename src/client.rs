//! The application-facing client handle.

use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::TransportChannel;
use crate::error::{Error, Result};
use crate::managers::{ConnectionState, Connector, Dispatcher};
use crate::message::MessageHandler;
use crate::protocol::{Command, Response};
use crate::resource::SharedResource;

/// Where a client's execution resource came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOwnership {
    /// The allocator's process-wide default
    Shared(SharedResource),
    /// Supplied in the configuration by the caller
    External(SharedResource),
    /// Created for this client alone; quiesced when the client closes
    Private(SharedResource),
}

impl ResourceOwnership {
    pub fn resource(&self) -> &SharedResource {
        match self {
            ResourceOwnership::Shared(r)
            | ResourceOwnership::External(r)
            | ResourceOwnership::Private(r) => r,
        }
    }

    /// Quiesce the resource if this client owns it.
    pub(crate) fn release(&self) {
        if let ResourceOwnership::Private(resource) = self {
            resource.shutdown_gracefully();
        }
    }
}

/// A connected client.
///
/// Only produced by the client factory after a successful handshake.
/// Dropping the client closes it.
///
/// # Example
///
/// ```rust,no_run
/// use merkle_kv_client::{create_client, ClientConfig};
///
/// # async fn run() -> merkle_kv_client::Result<()> {
/// let client = create_client(ClientConfig::default()).await?;
/// client.set("user:1", "ada").await?;
/// assert_eq!(client.get("user:1").await?, Some("ada".to_string()));
/// client.close();
/// # Ok(())
/// # }
/// ```
pub struct Client {
    connection_manager: Arc<dyn Connector>,
    command_manager: Arc<dyn Dispatcher>,
    message_handler: Arc<MessageHandler>,
    channel: Arc<TransportChannel>,
    resource: ResourceOwnership,
    request_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl Client {
    pub(crate) fn new(
        connection_manager: Arc<dyn Connector>,
        command_manager: Arc<dyn Dispatcher>,
        message_handler: Arc<MessageHandler>,
        channel: Arc<TransportChannel>,
        resource: ResourceOwnership,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connection_manager,
            command_manager,
            message_handler,
            channel,
            resource,
            request_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_manager(&self) -> &Arc<dyn Connector> {
        &self.connection_manager
    }

    pub fn command_manager(&self) -> &Arc<dyn Dispatcher> {
        &self.command_manager
    }

    pub fn message_handler(&self) -> &Arc<MessageHandler> {
        &self.message_handler
    }

    pub fn resource(&self) -> &ResourceOwnership {
        &self.resource
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_manager.state()
    }

    /// Closed explicitly, or the transport went away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.channel.is_closed()
    }

    /// Run one command, bounded by the configured request timeout.
    pub async fn execute(&self, command: Command) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connection_closed("client is closed"));
        }
        let name = command.name();
        let pending = self.command_manager.execute(command);
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .unwrap_or_else(|_| Err(Error::timeout(format!("{} timed out", name)))),
            None => pending.await,
        }
    }

    /// `None` when the key does not exist.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>> {
        match self.execute(Command::Get { key: key.into() }).await? {
            Response::Value(value) => Ok(Some(value)),
            Response::NotFound => Ok(None),
            other => Err(Error::invalid_response(format!("GET answered {:?}", other))),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let command = Command::Set {
            key: key.into(),
            value: value.into(),
        };
        match self.execute(command).await? {
            Response::Ok => Ok(()),
            other => Err(Error::invalid_response(format!("SET answered {:?}", other))),
        }
    }

    /// `true` if the key existed.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool> {
        match self.execute(Command::Delete { key: key.into() }).await? {
            Response::Ok => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(Error::invalid_response(format!("DEL answered {:?}", other))),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.execute(Command::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(Error::invalid_response(format!("PING answered {:?}", other))),
        }
    }

    /// Release the channel and, for a private resource, quiesce it.
    ///
    /// Idempotent. Outstanding requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing client connected to {}", self.channel.peer());
        self.channel.close();
        self.resource.release();
        debug!(
            "Client closed after {} push message(s)",
            self.message_handler.delivered()
        );
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("channel", &self.channel)
            .field("resource", &self.resource)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
