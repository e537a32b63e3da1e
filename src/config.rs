use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use pilot_bridge::{BridgeConfig, QueueMode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

pub const LISTEN_KEY: &str = "COMFY_PILOT_LISTEN";
pub const COMFY_URL_KEY: &str = "COMFY_PILOT_COMFY_URL";
pub const ALLOWED_ORIGINS_KEY: &str = "COMFY_PILOT_ALLOWED_ORIGINS";
pub const NAMESPACE_KEY: &str = "COMFY_PILOT_NAMESPACE";
pub const TIMEOUT_KEY: &str = "COMFY_PILOT_TIMEOUT_SECS";
pub const QUEUE_MODE_KEY: &str = "COMFY_PILOT_QUEUE_MODE";
pub const REJECT_UNKNOWN_KEY: &str = "COMFY_PILOT_REJECT_UNKNOWN";
pub const MAX_BATCH_KEY: &str = "COMFY_PILOT_MAX_BATCH_COUNT";

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8190";
pub const DEFAULT_COMFY_URL: &str = "http://127.0.0.1:8188";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {}", env_file.display(), err),
            }
        } else {
            info!("no .env at {}, using process environment", env_file.display());
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with("COMFY_PILOT_"))
            .collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let mgr = Self::default();
        for (key, value) in pairs {
            mgr.insert(key, value);
        }
        Box::new(mgr)
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// The environment keys read by [`BridgeSettings::load`]. Only used to
/// publish the `config` schema.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SettingsKeys {
    /// Websocket listen address. Default `127.0.0.1:8190`.
    #[serde(rename = "COMFY_PILOT_LISTEN")]
    pub listen: Option<String>,
    /// ComfyUI base url, may carry a path prefix. Default `http://127.0.0.1:8188`.
    #[serde(rename = "COMFY_PILOT_COMFY_URL")]
    pub comfy_url: Option<String>,
    /// Comma separated origins, `*` accepts any. Default `*`.
    #[serde(rename = "COMFY_PILOT_ALLOWED_ORIGINS")]
    pub allowed_origins: Option<String>,
    /// Message type prefix without the colon. Default `comfy-pilot`.
    #[serde(rename = "COMFY_PILOT_NAMESPACE")]
    pub namespace: Option<String>,
    /// Seconds an execution may take, queueing included. Default 300.
    #[serde(rename = "COMFY_PILOT_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
    /// `snapshot` or `run`. Default `snapshot`.
    #[serde(rename = "COMFY_PILOT_QUEUE_MODE")]
    pub queue_mode: Option<QueueMode>,
    /// Largest `batchCount` honoured in run mode. Default 32.
    #[serde(rename = "COMFY_PILOT_MAX_BATCH_COUNT")]
    pub max_batch_count: Option<u32>,
    /// Answer unknown commands with an error. Default `false`.
    #[serde(rename = "COMFY_PILOT_REJECT_UNKNOWN")]
    pub reject_unknown: Option<bool>,
}

/// Everything `run` needs, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    pub listen: String,
    pub comfy_url: Url,
    pub bridge: BridgeConfig,
}

impl BridgeSettings {
    pub async fn load(config: &ConfigManager) -> anyhow::Result<Self> {
        let source = &config.0;
        let mut bridge = BridgeConfig::default();

        if let Some(namespace) = non_empty(source.get(NAMESPACE_KEY).await) {
            bridge.namespace = namespace;
        }
        if let Some(origins) = non_empty(source.get(ALLOWED_ORIGINS_KEY).await) {
            bridge.allowed_origins = parse_origins(&origins);
        }
        if let Some(secs) = non_empty(source.get(TIMEOUT_KEY).await) {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("{TIMEOUT_KEY} must be a number of seconds, got `{secs}`"))?;
            if secs == 0 {
                bail!("{TIMEOUT_KEY} must be greater than zero");
            }
            bridge.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(mode) = non_empty(source.get(QUEUE_MODE_KEY).await) {
            bridge.queue_mode = mode
                .parse::<QueueMode>()
                .with_context(|| format!("{QUEUE_MODE_KEY} must be `snapshot` or `run`, got `{mode}`"))?;
        }
        if let Some(max) = non_empty(source.get(MAX_BATCH_KEY).await) {
            let max: u32 = max
                .parse()
                .with_context(|| format!("{MAX_BATCH_KEY} must be a positive number, got `{max}`"))?;
            if max == 0 {
                bail!("{MAX_BATCH_KEY} must be greater than zero");
            }
            bridge.max_batch_count = max;
        }
        if let Some(flag) = non_empty(source.get(REJECT_UNKNOWN_KEY).await) {
            bridge.reject_unknown = parse_flag(&flag)
                .with_context(|| format!("{REJECT_UNKNOWN_KEY} must be a boolean, got `{flag}`"))?;
        }

        let listen = non_empty(source.get(LISTEN_KEY).await).unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let comfy_url = non_empty(source.get(COMFY_URL_KEY).await)
            .unwrap_or_else(|| DEFAULT_COMFY_URL.to_string());
        let comfy_url = Url::parse(&comfy_url).with_context(|| format!("invalid {COMFY_URL_KEY} `{comfy_url}`"))?;

        Ok(Self {
            listen,
            comfy_url,
            bridge,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("not a boolean"),
    }
}
