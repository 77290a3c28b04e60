//! Shared building blocks for the editor side of the agent bridge: wire
//! protocol, configuration, auth tokens, discovery records and mentions.

pub mod config;
pub mod discovery;
pub mod mention;
pub mod protocol;
pub mod token;

pub use config::{BridgeConfig, ConfigError, LegacyKeyNotice, PortRange};
pub use discovery::{DiscoveryError, DiscoveryRecord, DiscoveryStore, LockFileStore};
pub use mention::{Mention, MentionError};
pub use token::{AuthToken, TokenGenerationError};
