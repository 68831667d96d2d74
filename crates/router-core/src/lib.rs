//! Router core.
//!
//! The router authenticates peers, keeps the persistent directory of users
//! and hosts, tracks which hosts are currently online, and splices relay
//! streams between introduced peers.

pub mod auth;
pub mod broker;
pub mod directory;
pub mod error;
pub mod registry;
pub mod server;
pub mod settings;

pub use broker::Broker;
pub use directory::Directory;
pub use error::{RouterError, RouterResult};
pub use registry::HostRegistry;
pub use server::run_router_server;
