//! # MerkleKV Client
//!
//! Asynchronous client for the MerkleKV key-value server.
//!
//! ## Architecture Overview
//!
//! A client is assembled by [`ClientFactory`] from a handful of parts:
//! - **Shared resource**: the tokio runtime all transport I/O runs on, shared
//!   process-wide through [`ResourceAllocator`] unless the caller brings one
//! - **Transport channel**: one TCP connection with a reader and a writer task,
//!   routing replies by correlation id and everything else to a push consumer
//! - **Connection manager**: the handshake state machine
//! - **Command manager**: command dispatch and reply decoding
//! - **Message handler**: delivery of pushed pub/sub messages to a callback
//!
//! [`create_client`] returns a [`Client`] only after the handshake succeeded;
//! on failure the original error is returned and nothing built on the way is
//! left running.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod frame;
pub mod managers;
pub mod message;
pub mod protocol;
pub mod resource;

pub use channel::TransportChannel;
pub use client::{Client, ResourceOwnership};
pub use config::{ClientConfig, ClientSettings, Credentials, NodeAddress, SubscriptionConfig};
pub use error::{Error, Result};
pub use factory::{create_client, ClientComponents, ClientFactory, DefaultComponents};
pub use frame::{Frame, FrameCodec, FrameKind, PushMessage};
pub use managers::{CommandManager, ConnectionManager, ConnectionState, Connector, Dispatcher};
pub use message::MessageHandler;
pub use protocol::{Command, Protocol, Response};
pub use resource::{ResourceAllocator, SharedResource};
