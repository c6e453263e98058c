// src/config.rs
//
// Key/value configuration sources and the typed settings resolved from them.

use std::{env, path::PathBuf, str::FromStr, time::Duration};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};
use url::Url;

use crate::error::ConfigurationError;

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

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

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {}", env_file.display(), e),
            }
        } else {
            info!("no .env at {}, using the process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
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

/// In-memory source, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
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

/// Path the broker pushes deliveries to, relative to the container root.
pub const INGRESS_PATH: &str = "/CoffeeShop/coffeeShop.do";

/// Everything the orchestrator needs to know about its surroundings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub client_name: String,
    pub board_client_name: String,
    pub menu_topic: String,
    pub sms_topic: String,
    pub osn_topic: String,
    pub board_topic: String,
    /// Base URL of the REST broker, validated on load.
    pub broker_url: String,
    /// Added to an application's idle timeout to form the check period.
    pub idle_grace: Duration,
    /// Window an idle check waits for events on the application topic.
    pub idle_poll: Duration,
    /// Window a message board pull waits for new posts.
    pub board_poll: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            client_name: "coffeeshop".to_string(),
            board_client_name: "messageboard".to_string(),
            menu_topic: "coffeeshop_menu".to_string(),
            sms_topic: "sms".to_string(),
            osn_topic: "osn".to_string(),
            board_topic: "messageboard".to_string(),
            broker_url: "http://localhost:8800/osgibroker".to_string(),
            idle_grace: Duration::from_secs(5),
            idle_poll: Duration::from_secs(1),
            board_poll: Duration::from_secs(3),
        }
    }
}

impl Settings {
    /// Resolve every setting from `config`, falling back to the defaults.
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigurationError> {
        let d = Settings::default();
        Ok(Self {
            host: text(config, "COFFEESHOP_HOST", d.host).await,
            port: parsed(config, "COFFEESHOP_PORT", d.port).await?,
            client_name: text(config, "COFFEESHOP_CLIENT_NAME", d.client_name).await,
            board_client_name: text(config, "MESSAGE_BOARD_CLIENT_NAME", d.board_client_name).await,
            menu_topic: text(config, "MENU_TOPIC", d.menu_topic).await,
            sms_topic: text(config, "SMS_TOPIC", d.sms_topic).await,
            osn_topic: text(config, "OSN_TOPIC", d.osn_topic).await,
            board_topic: text(config, "MESSAGE_BOARD_TOPIC", d.board_topic).await,
            broker_url: parsed::<Url>(config, "BROKER_URL", Url::parse(&d.broker_url).map_err(
                |e| ConfigurationError::InvalidSetting {
                    key: "BROKER_URL".to_string(),
                    reason: e.to_string(),
                },
            )?)
            .await?
            .to_string(),
            idle_grace: seconds(config, "IDLE_GRACE_SECONDS", d.idle_grace).await?,
            idle_poll: seconds(config, "IDLE_POLL_SECONDS", d.idle_poll).await?,
            board_poll: seconds(config, "BOARD_POLL_SECONDS", d.board_poll).await?,
        })
    }

    /// Delivery URL handed to the broker for pushed subscriptions.
    pub fn ingress_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, INGRESS_PATH)
    }
}

async fn text(config: &ConfigManager, key: &str, default: String) -> String {
    match config.get(key).await {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default,
    }
}

async fn parsed<T>(config: &ConfigManager, key: &str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match config.get(key).await {
        Some(v) if !v.trim().is_empty() => {
            v.trim().parse().map_err(|e: T::Err| ConfigurationError::InvalidSetting {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

async fn seconds(
    config: &ConfigManager,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigurationError> {
    parsed(config, key, default.as_secs()).await.map(Duration::from_secs)
}
