//! Editor side of the agent bridge: a loopback WebSocket server the coding
//! agent connects to, a queue that holds mentions until it is ready, and the
//! facade that ties both to a discovery record on disk.

pub mod bridge;
pub mod command;
pub mod logging;
pub mod scheduler;
pub mod server;

pub use bridge::{AgentBridge, AgentSurface, BridgeError, BridgeStatus, MentionOutcome, NoopSurface};
pub use scheduler::{MentionScheduler, MentionSink, SchedulerConfig};
pub use server::{ConnectionServer, ServerConfig, ServerError, ServerEvent, ServerStatus};
