use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::message::{BRIDGE_VERSION, DEFAULT_NAMESPACE};

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_BATCH_COUNT: u32 = 32;

/// How `execute-workflow` hands the graph to the execution service.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
    EnumString,
    AsRefStr,
    Display,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Queue the current snapshot once, ignoring `batchCount`.
    #[default]
    Snapshot,
    /// Queue the current snapshot `batchCount` times and follow the last one.
    Run,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub namespace: String,
    pub version: String,
    pub execution_timeout: Duration,
    /// Origins accepted by the router. `*` accepts anything.
    pub allowed_origins: Vec<String>,
    pub queue_mode: QueueMode,
    /// Upper bound for `batchCount` in run mode.
    pub max_batch_count: u32,
    pub priority: i64,
    /// Reply with an error to prefixed but unknown commands instead of dropping them.
    pub reject_unknown: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            version: BRIDGE_VERSION.to_string(),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            allowed_origins: vec!["*".to_string()],
            queue_mode: QueueMode::Snapshot,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
            priority: 0,
            reject_unknown: false,
        }
    }
}

impl BridgeConfig {
    pub fn accepts_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.accepts_any_origin() {
            return true;
        }
        let Some(origin) = origin else {
            return false;
        };
        let origin = origin.trim_end_matches('/');
        self.allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_accepts_missing_origin() {
        let config = BridgeConfig::default();
        assert!(config.origin_allowed(None));
        assert!(config.origin_allowed(Some("https://evil.example")));
    }

    #[test]
    fn explicit_list_is_enforced() {
        let config = BridgeConfig {
            allowed_origins: vec!["https://app.example/".into()],
            ..Default::default()
        };
        assert!(config.origin_allowed(Some("https://app.example")));
        assert!(!config.origin_allowed(Some("https://other.example")));
        assert!(!config.origin_allowed(None));
    }

    #[test]
    fn queue_mode_parses() {
        assert_eq!("RUN".parse::<QueueMode>().unwrap(), QueueMode::Run);
        assert_eq!(QueueMode::default().as_ref(), "snapshot");
    }
}
