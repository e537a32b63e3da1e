pub mod config;
pub mod correlator;
pub mod error;
pub mod host;
pub mod message;
pub mod monitor;
pub mod notifier;
pub mod output;
pub mod router;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use config::{BridgeConfig, QueueMode};
pub use correlator::{ChannelTarget, Correlator, ReplyTarget, Source};
pub use error::{BridgeError, BridgeResult};
pub use host::{ExecutionEvent, ExecutionService, GraphEvent, GraphHost, HistoryEntry, QueuedPrompt};
pub use message::{InboundMessage, Namespace, OutboundMessage, ReplyKind, RequestKind};
pub use monitor::{ExecutionMonitor, ExecutionState};
pub use notifier::ChangeNotifier;
pub use router::{BridgeRouter, Envelope};
