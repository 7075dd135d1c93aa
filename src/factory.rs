//! # Client Bootstrap
//!
//! [`ClientFactory::create_client`] turns a [`ClientConfig`] into a connected
//! [`Client`]:
//!
//! 1. Resolve the execution resource (override, private, or shared default)
//! 2. Open a transport channel on it
//! 3. Bind a connection manager and a command manager to the channel
//! 4. Install a message handler for push traffic
//! 5. Run the handshake
//!
//! A client is only returned once the handshake succeeded. Any earlier
//! failure is returned as-is, after the channel has been closed and a
//! private resource quiesced.
//!
//! The collaborators are produced by a [`ClientComponents`] implementation
//! handed to the factory, so tests can substitute their own.

use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

use crate::channel::TransportChannel;
use crate::client::{Client, ResourceOwnership};
use crate::config::{ClientConfig, SubscriptionConfig};
use crate::error::{Error, Result};
use crate::managers::{CommandManager, ConnectionManager, Connector, Dispatcher};
use crate::message::MessageHandler;
use crate::resource::{ResourceAllocator, SharedResource};

/// Produces the default resource when the allocator has none.
///
/// Returning `Ok(None)` means no default can be provided on this platform.
pub type ResourceFactory = Arc<dyn Fn() -> Result<Option<SharedResource>> + Send + Sync>;

/// Builders for everything a client is made of.
pub trait ClientComponents: Send + Sync {
    fn build_channel<'a>(
        &'a self,
        config: &'a ClientConfig,
        resource: &'a SharedResource,
    ) -> BoxFuture<'a, Result<Arc<TransportChannel>>>;

    fn build_connection_manager(&self, channel: &Arc<TransportChannel>) -> Arc<dyn Connector>;

    fn build_command_manager(&self, channel: &Arc<TransportChannel>) -> Arc<dyn Dispatcher>;

    fn build_message_handler(
        &self,
        channel: &Arc<TransportChannel>,
        subscriptions: Option<&SubscriptionConfig>,
    ) -> Arc<MessageHandler> {
        MessageHandler::register(channel, subscriptions)
    }
}

/// TCP channel plus the real managers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultComponents;

impl ClientComponents for DefaultComponents {
    fn build_channel<'a>(
        &'a self,
        config: &'a ClientConfig,
        resource: &'a SharedResource,
    ) -> BoxFuture<'a, Result<Arc<TransportChannel>>> {
        TransportChannel::connect(config, resource).boxed()
    }

    fn build_connection_manager(&self, channel: &Arc<TransportChannel>) -> Arc<dyn Connector> {
        Arc::new(ConnectionManager::new(Arc::clone(channel)))
    }

    fn build_command_manager(&self, channel: &Arc<TransportChannel>) -> Arc<dyn Dispatcher> {
        Arc::new(CommandManager::new(Arc::clone(channel)))
    }
}

fn platform_default_resource() -> Result<Option<SharedResource>> {
    SharedResource::with_default_workers().map(Some)
}

pub struct ClientFactory {
    components: Arc<dyn ClientComponents>,
    allocator: Arc<ResourceAllocator>,
    resource_factory: ResourceFactory,
}

impl ClientFactory {
    /// Real components, the process-wide allocator, one worker per CPU for
    /// the default resource.
    pub fn new() -> Self {
        Self {
            components: Arc::new(DefaultComponents),
            allocator: ResourceAllocator::global(),
            resource_factory: Arc::new(platform_default_resource),
        }
    }

    pub fn with_components(mut self, components: Arc<dyn ClientComponents>) -> Self {
        self.components = components;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<ResourceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_resource_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Option<SharedResource>> + Send + Sync + 'static,
    {
        self.resource_factory = Arc::new(factory);
        self
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    fn resolve_resource(&self, config: &ClientConfig) -> Result<ResourceOwnership> {
        if let Some(resource) = config.resource() {
            debug!("Using caller-supplied resource {}", resource.id());
            return Ok(ResourceOwnership::External(resource.clone()));
        }
        if config.dedicated_resource() {
            let resource = match config.worker_threads() {
                Some(threads) => SharedResource::new(threads)?,
                None => SharedResource::with_default_workers()?,
            };
            return Ok(ResourceOwnership::Private(resource));
        }
        let factory = Arc::clone(&self.resource_factory);
        match self.allocator.get_or_create(move || factory())? {
            Some(resource) => Ok(ResourceOwnership::Shared(resource)),
            None => Err(Error::resource_creation(
                "no default resource is available and none was configured",
            )),
        }
    }

    /// Bootstrap a connected client.
    ///
    /// On failure the error produced by the failing stage is returned
    /// unchanged and nothing built along the way outlives the call.
    pub async fn create_client(&self, config: ClientConfig) -> Result<Client> {
        let ownership = self.resolve_resource(&config)?;

        let channel = match self
            .components
            .build_channel(&config, ownership.resource())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open transport channel: {}", e);
                ownership.release();
                return Err(e);
            }
        };

        let connection_manager = self.components.build_connection_manager(&channel);
        let command_manager = self.components.build_command_manager(&channel);
        let message_handler = self
            .components
            .build_message_handler(&channel, config.subscriptions());

        if let Err(e) = connection_manager.connect(&config).await {
            warn!("Client bootstrap against {} failed: {}", channel.peer(), e);
            channel.close();
            ownership.release();
            return Err(e);
        }

        info!("Client connected to {}", channel.peer());
        Ok(Client::new(
            connection_manager,
            command_manager,
            message_handler,
            channel,
            ownership,
            config.request_timeout(),
        ))
    }
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

/// Bootstrap a client with the default factory.
pub async fn create_client(config: ClientConfig) -> Result<Client> {
    ClientFactory::default().create_client(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::command::MockDispatcher;
    use crate::managers::connection::MockConnector;
    use crate::managers::ConnectionState;
    use futures::future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::runtime::Handle;

    /// Builds in-memory channels and mock managers, remembering every
    /// instance it handed out.
    struct MockComponents {
        handshake: Result<()>,
        servers: Mutex<Vec<DuplexStream>>,
        channels: Mutex<Vec<Arc<TransportChannel>>>,
        connectors: Mutex<Vec<Arc<dyn Connector>>>,
        dispatchers: Mutex<Vec<Arc<dyn Dispatcher>>>,
    }

    impl MockComponents {
        fn new(handshake: Result<()>) -> Arc<Self> {
            Arc::new(Self {
                handshake,
                servers: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                connectors: Mutex::new(Vec::new()),
                dispatchers: Mutex::new(Vec::new()),
            })
        }

        fn last_channel(&self) -> Arc<TransportChannel> {
            Arc::clone(self.channels.lock().unwrap().last().unwrap())
        }

        fn last_connector(&self) -> Arc<dyn Connector> {
            Arc::clone(self.connectors.lock().unwrap().last().unwrap())
        }

        fn last_dispatcher(&self) -> Arc<dyn Dispatcher> {
            Arc::clone(self.dispatchers.lock().unwrap().last().unwrap())
        }
    }

    impl ClientComponents for MockComponents {
        fn build_channel<'a>(
            &'a self,
            config: &'a ClientConfig,
            resource: &'a SharedResource,
        ) -> BoxFuture<'a, Result<Arc<TransportChannel>>> {
            async move {
                let (stream, server) = tokio::io::duplex(4096);
                let channel =
                    TransportChannel::from_stream(stream, "mock", config.codec(), resource)?;
                self.servers.lock().unwrap().push(server);
                self.channels.lock().unwrap().push(Arc::clone(&channel));
                Ok(channel)
            }
            .boxed()
        }

        fn build_connection_manager(&self, _: &Arc<TransportChannel>) -> Arc<dyn Connector> {
            let outcome = self.handshake.clone();
            let mut connector = MockConnector::new();
            connector
                .expect_connect()
                .times(1)
                .returning(move |_| future::ready(outcome.clone()).boxed());
            connector.expect_state().return_const(ConnectionState::Ready);
            let connector: Arc<dyn Connector> = Arc::new(connector);
            self.connectors.lock().unwrap().push(Arc::clone(&connector));
            connector
        }

        fn build_command_manager(&self, _: &Arc<TransportChannel>) -> Arc<dyn Dispatcher> {
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(MockDispatcher::new());
            self.dispatchers.lock().unwrap().push(Arc::clone(&dispatcher));
            dispatcher
        }
    }

    fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
        std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
    }

    fn current_runtime() -> Result<Option<SharedResource>> {
        Ok(Some(SharedResource::from_handle(Handle::current())))
    }

    fn factory(components: &Arc<MockComponents>) -> ClientFactory {
        ClientFactory::new()
            .with_components(Arc::clone(components) as Arc<dyn ClientComponents>)
            .with_allocator(Arc::new(ResourceAllocator::new()))
            .with_resource_factory(current_runtime)
    }

    #[tokio::test]
    async fn test_default_config_wires_built_managers() {
        let components = MockComponents::new(Ok(()));
        let factory = factory(&components);

        let client = factory.create_client(ClientConfig::default()).await.unwrap();

        assert!(same(client.connection_manager(), &components.last_connector()));
        assert!(same(client.command_manager(), &components.last_dispatcher()));
        assert_eq!(client.connection_state(), ConnectionState::Ready);
        assert!(matches!(client.resource(), ResourceOwnership::Shared(_)));
        assert_eq!(
            Some(client.resource().resource().clone()),
            factory.allocator().current()
        );
    }

    #[tokio::test]
    async fn test_resource_override_with_failed_handshake() {
        let cause = Error::connection_closed("disconnected");
        let components = MockComponents::new(Err(cause));
        let resource = SharedResource::from_handle(Handle::current());
        let config = ClientConfig::builder().resource(resource.clone()).build();

        let err = factory(&components).create_client(config).await.unwrap_err();

        assert!(matches!(err, Error::ConnectionClosed { ref message } if message == "disconnected"));
        assert!(components.last_channel().is_closed());
        assert_eq!(resource.lease_count(), 0);
        assert!(resource.is_live());
    }

    #[tokio::test]
    async fn test_handshake_cause_is_returned_not_rebuilt() {
        let cause = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "disconnected",
        ));
        let Error::Io { source: expected } = &cause else {
            unreachable!("io errors convert to Error::Io");
        };
        let expected = Arc::clone(expected);
        let components = MockComponents::new(Err(cause));
        let config = ClientConfig::builder()
            .resource(SharedResource::from_handle(Handle::current()))
            .build();

        let err = factory(&components).create_client(config).await.unwrap_err();

        match err {
            Error::Io { source } => assert!(Arc::ptr_eq(&source, &expected)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_override_skips_allocator() {
        let components = MockComponents::new(Ok(()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = factory(&components).with_resource_factory(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            current_runtime()
        });
        let resource = SharedResource::from_handle(Handle::current());
        let config = ClientConfig::builder().resource(resource.clone()).build();

        let client = factory.create_client(config).await.unwrap();

        assert_eq!(client.resource(), &ResourceOwnership::External(resource));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(factory.allocator().current().is_none());
    }

    #[tokio::test]
    async fn test_sequential_clients_share_default_resource() {
        let components = MockComponents::new(Ok(()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = factory(&components).with_resource_factory(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            current_runtime()
        });

        let first = factory.create_client(ClientConfig::default()).await.unwrap();
        let second = factory.create_client(ClientConfig::default()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.resource().resource(), second.resource().resource());
        assert_eq!(first.resource().resource().lease_count(), 2);

        // Closing one client leaves the shared default alone
        first.close();
        assert!(second.resource().resource().is_live());
        assert_eq!(second.resource().resource().lease_count(), 1);
    }

    #[tokio::test]
    async fn test_default_replaced_after_quiesce() {
        let components = MockComponents::new(Ok(()));
        let factory = factory(&components);

        let first = factory.create_client(ClientConfig::default()).await.unwrap();
        let first_resource = first.resource().resource().clone();
        drop(first);
        factory.allocator().shutdown_default();

        let second = factory.create_client(ClientConfig::default()).await.unwrap();
        assert_ne!(second.resource().resource(), &first_resource);
    }

    #[tokio::test]
    async fn test_absent_default_fails_bootstrap() {
        let components = MockComponents::new(Ok(()));
        let factory = factory(&components).with_resource_factory(|| Ok(None));

        let err = factory.create_client(ClientConfig::default()).await.unwrap_err();

        assert!(matches!(err, Error::ResourceCreationFailed { .. }));
        assert!(components.channels.lock().unwrap().is_empty());
        assert!(factory.allocator().current().is_none());
    }

    #[tokio::test]
    async fn test_resource_factory_error_propagates() {
        let components = MockComponents::new(Ok(()));
        let factory = factory(&components)
            .with_resource_factory(|| Err(Error::resource_creation("no threads left")));

        let err = factory.create_client(ClientConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceCreationFailed { ref message } if message == "no threads left"));
    }

    #[tokio::test]
    async fn test_dedicated_resource_is_private_and_quiesced() {
        let components = MockComponents::new(Ok(()));
        let factory = factory(&components);
        let config = ClientConfig::builder()
            .dedicated_resource(true)
            .worker_threads(1)
            .build();

        let client = factory.create_client(config).await.unwrap();
        let resource = client.resource().resource().clone();
        assert!(matches!(client.resource(), ResourceOwnership::Private(_)));
        assert!(factory.allocator().current().is_none());

        client.close();
        assert!(!resource.is_live());
    }

    #[tokio::test]
    async fn test_failed_bootstrap_quiesces_private_resource() {
        let components = MockComponents::new(Err(Error::handshake_rejected("WRONGPASS")));
        let config = ClientConfig::builder()
            .dedicated_resource(true)
            .worker_threads(1)
            .build();

        let err = factory(&components).create_client(config).await.unwrap_err();

        assert!(matches!(err, Error::HandshakeRejected { .. }));
        let channel = components.last_channel();
        assert!(channel.is_closed());
        assert!(!channel.resource().is_live());
    }
}
