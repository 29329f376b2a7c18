//! Public interface to the relaychat core library, linked by both the
//! server and client binaries.

pub mod utils;

pub mod config;
pub mod election;
pub mod liveness;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;

pub use config::{ClusterConfig, PeerDescriptor, Rank, TimingConfig};
pub use election::{ClusterView, ElectionMonitor};
pub use liveness::{FailureDetector, PeerStatus};
pub use protocol::{ClientCommand, Identity, PeerWireMsg, ReplicatedAction, ServerFrame};
pub use server::{ServerNode, ServerStatus};
pub use state::ChatState;
pub use utils::{logger_init, safe_tcp_read, safe_tcp_write, RelayError, Timer};
