//! # Channel-Bound Managers
//!
//! Both managers are bound 1:1 to a [`TransportChannel`](crate::channel::TransportChannel)
//! and draw correlation ids from it:
//!
//! - **`connection`**: drives the handshake and tracks readiness
//! - **`command`**: turns commands into request frames and decodes replies
//!
//! Each manager is reached through a small trait ([`Connector`],
//! [`Dispatcher`]) so the client factory can be handed substitutes.

pub mod command;
pub mod connection;

pub use command::{CommandManager, Dispatcher};
pub use connection::{ConnectionManager, ConnectionState, Connector};
