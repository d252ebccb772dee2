//! PalNet node: UDP discovery, signed TCP links, and periodic character-state sync on top
//! of `pal-core`.

pub mod config;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod manager;
pub mod peers;
pub mod sync_service;
pub mod transport;

pub use config::{Config, ConfigError};
pub use error::NetError;
pub use handler::MessageHandler;
pub use manager::{NetStats, NetworkConfig, NetworkManager};
pub use peers::PeerInfo;
pub use sync_service::SyncService;
