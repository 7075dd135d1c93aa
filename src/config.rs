//! # Client Configuration
//!
//! Two layers live here:
//!
//! - [`ClientConfig`]: the immutable value handed to the client factory. It can
//!   carry live handles (a [`SharedResource`] override, a subscription
//!   callback) and is built with [`ClientConfig::builder`].
//! - [`ClientSettings`]: the serializable form loaded from a TOML file with the
//!   `config` crate and turned into a `ClientConfig`.
//!
//! ## Example Configuration File (client.toml)
//! ```toml
//! addresses = ["127.0.0.1:7379", "127.0.0.1:7380"]
//! client_name = "reporting"
//! database_id = 0
//! connection_timeout_ms = 250
//! request_timeout_ms = 5000
//! codec = "json"
//! dedicated_resource = false
//!
//! [credentials]
//! username = "default"
//! password = "hunter2"
//!
//! [subscriptions]
//! channels = ["news"]
//! patterns = ["alerts.*"]
//! ```

use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::{FrameCodec, PushMessage};
use crate::resource::SharedResource;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7379;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable that overrides the configured password
pub const PASSWORD_ENV: &str = "MERKLEKV_PASSWORD";

/// Callback invoked for every push message, in arrival order
pub type MessageCallback = Arc<dyn Fn(PushMessage) + Send + Sync>;

/// A server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. The port is taken after the last colon.
    pub fn parse(input: &str) -> Result<Self> {
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("address '{}' is not host:port", input)))?;
        if host.is_empty() {
            return Err(Error::config(format!("address '{}' has an empty host", input)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::config(format!("address '{}' has an invalid port", input)))?;
        Ok(Self::new(host, port))
    }
}

impl Default for NodeAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credentials presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
}

/// Push-message subscriptions requested at connect time.
///
/// Validating channel names is left to the server.
#[derive(Clone, Default)]
pub struct SubscriptionConfig {
    channels: Vec<String>,
    patterns: Vec<String>,
    callback: Option<MessageCallback>,
}

impl SubscriptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(PushMessage) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn message_callback(&self) -> Option<&MessageCallback> {
        self.callback.as_ref()
    }
}

impl PartialEq for SubscriptionConfig {
    fn eq(&self, other: &Self) -> bool {
        let same_callback = match (&self.callback, &other.callback) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.channels == other.channels && self.patterns == other.patterns && same_callback
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("channels", &self.channels)
            .field("patterns", &self.patterns)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Immutable description of the client to build.
///
/// Equality is structural; the resource override and the subscription
/// callback compare by identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    addresses: Vec<NodeAddress>,
    credentials: Option<Credentials>,
    client_name: Option<String>,
    database_id: u32,
    connection_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    codec: FrameCodec,
    resource: Option<SharedResource>,
    dedicated_resource: bool,
    worker_threads: Option<usize>,
    subscriptions: Option<SubscriptionConfig>,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// A builder preloaded with this configuration.
    pub fn to_builder(&self) -> ClientConfigBuilder {
        ClientConfigBuilder {
            addresses: self.addresses.clone(),
            credentials: self.credentials.clone(),
            client_name: self.client_name.clone(),
            database_id: self.database_id,
            connection_timeout: self.connection_timeout,
            request_timeout: self.request_timeout,
            codec: self.codec,
            resource: self.resource.clone(),
            dedicated_resource: self.dedicated_resource,
            worker_threads: self.worker_threads,
            subscriptions: self.subscriptions.clone(),
        }
    }

    /// Endpoints tried in order; never empty
    pub fn addresses(&self) -> &[NodeAddress] {
        &self.addresses
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn database_id(&self) -> u32 {
        self.database_id
    }

    /// Bound for each socket connect attempt and for the handshake
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout
    }

    /// Bound applied by `Client::execute`
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    /// Externally supplied resource; the client never quiesces it
    pub fn resource(&self) -> Option<&SharedResource> {
        self.resource.as_ref()
    }

    /// Whether the client should own a private runtime instead of the default
    pub fn dedicated_resource(&self) -> bool {
        self.dedicated_resource
    }

    pub fn worker_threads(&self) -> Option<usize> {
        self.worker_threads
    }

    pub fn subscriptions(&self) -> Option<&SubscriptionConfig> {
        self.subscriptions.as_ref()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    addresses: Vec<NodeAddress>,
    credentials: Option<Credentials>,
    client_name: Option<String>,
    database_id: u32,
    connection_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    codec: FrameCodec,
    resource: Option<SharedResource>,
    dedicated_resource: bool,
    worker_threads: Option<usize>,
    subscriptions: Option<SubscriptionConfig>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            credentials: None,
            client_name: None,
            database_id: 0,
            connection_timeout: Some(DEFAULT_CONNECTION_TIMEOUT),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            codec: FrameCodec::default(),
            resource: None,
            dedicated_resource: false,
            worker_threads: None,
            subscriptions: None,
        }
    }
}

impl ClientConfigBuilder {
    pub fn address(mut self, address: NodeAddress) -> Self {
        self.addresses.push(address);
        self
    }

    pub fn addresses<I: IntoIterator<Item = NodeAddress>>(mut self, addresses: I) -> Self {
        self.addresses.extend(addresses);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn database_id(mut self, id: u32) -> Self {
        self.database_id = id;
        self
    }

    /// `None` disables the bound
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// `None` disables the bound
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn resource(mut self, resource: SharedResource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn dedicated_resource(mut self, dedicated: bool) -> Self {
        self.dedicated_resource = dedicated;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn subscriptions(mut self, subscriptions: SubscriptionConfig) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn build(self) -> ClientConfig {
        let addresses = if self.addresses.is_empty() {
            vec![NodeAddress::default()]
        } else {
            self.addresses
        };
        ClientConfig {
            addresses,
            credentials: self.credentials,
            client_name: self.client_name,
            database_id: self.database_id,
            connection_timeout: self.connection_timeout,
            request_timeout: self.request_timeout,
            codec: self.codec,
            resource: self.resource,
            dedicated_resource: self.dedicated_resource,
            worker_threads: self.worker_threads,
            subscriptions: self.subscriptions,
        }
    }
}

/// Subscription section of [`ClientSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// File-backed client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Server endpoints as `host:port`
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    #[serde(default)]
    pub client_name: Option<String>,

    #[serde(default)]
    pub database_id: u32,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub codec: FrameCodec,

    /// Run this client on its own runtime rather than the shared default
    #[serde(default)]
    pub dedicated_resource: bool,

    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default)]
    pub subscriptions: Option<SubscriptionSettings>,
}

fn default_addresses() -> Vec<String> {
    vec![NodeAddress::default().to_string()]
}

fn default_connection_timeout_ms() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            credentials: None,
            client_name: None,
            database_id: 0,
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            codec: FrameCodec::default(),
            dedicated_resource: false,
            worker_threads: None,
            subscriptions: None,
        }
    }
}

impl ClientSettings {
    /// Load settings from a TOML file.
    ///
    /// A non-empty `MERKLEKV_PASSWORD` environment variable replaces the
    /// configured password (and supplies one when the file has none).
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        let mut loaded: ClientSettings = settings.try_deserialize()?;
        loaded.apply_env_password();
        Ok(loaded)
    }

    fn apply_env_password(&mut self) {
        let Some(password) = std::env::var(PASSWORD_ENV).ok().filter(|s| !s.is_empty()) else {
            return;
        };
        match self.credentials.as_mut() {
            Some(credentials) => credentials.password = password,
            None => {
                self.credentials = Some(Credentials {
                    username: None,
                    password,
                })
            }
        }
    }

    /// Validate and convert into a [`ClientConfig`].
    ///
    /// A zero timeout disables that bound.
    pub fn into_config(self) -> Result<ClientConfig> {
        let addresses = self
            .addresses
            .iter()
            .map(|a| NodeAddress::parse(a))
            .collect::<Result<Vec<_>>>()?;
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));

        let mut builder = ClientConfig::builder()
            .addresses(addresses)
            .database_id(self.database_id)
            .connection_timeout(millis(self.connection_timeout_ms))
            .request_timeout(millis(self.request_timeout_ms))
            .codec(self.codec)
            .dedicated_resource(self.dedicated_resource);
        if let Some(credentials) = self.credentials {
            builder = builder.credentials(credentials);
        }
        if let Some(name) = self.client_name {
            builder = builder.client_name(name);
        }
        if let Some(threads) = self.worker_threads {
            builder = builder.worker_threads(threads);
        }
        if let Some(subs) = self.subscriptions {
            let subscriptions = subs
                .channels
                .into_iter()
                .fold(SubscriptionConfig::new(), SubscriptionConfig::channel);
            let subscriptions = subs
                .patterns
                .into_iter()
                .fold(subscriptions, SubscriptionConfig::pattern);
            builder = builder.subscriptions(subscriptions);
        }
        Ok(builder.build())
    }
}
