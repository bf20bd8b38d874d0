//! Broker configuration
//!
//! Settings are layered: a YAML file, an environment-specific YAML file,
//! `ATLAS_BROKER__*` environment variables (`__` separates nesting levels, as
//! in `ATLAS_BROKER__BROKER__MODE=dynamic-plans`) and finally command-line
//! flags.

use crate::catalog::Whitelist;
use crate::credentials::Credentials;
use crate::dynamic_plans::TemplateSet;
use crate::error::{BrokerError, Result as BrokerResult};
use crate::mode::BrokerMode;
use anyhow::{Context, Result};
use atlas_broker_shared::{LoggingConfig, ServerConfig};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// HTTP listener
    pub server: ServerConfig,

    /// Backend API
    pub atlas: AtlasConfig,

    /// Operating mode and its inputs
    pub broker: BrokerSettings,

    /// Instance metadata storage
    pub database: DatabaseConfig,

    pub logging: LoggingConfig,
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Base URL of the backend API; also the root of dashboard links
    pub base_url: String,

    /// Timeout of backend requests in seconds
    pub request_timeout_seconds: u64,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cloud.mongodb.com".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl AtlasConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub mode: BrokerMode,

    /// JSON credentials file
    pub credentials_file: Option<PathBuf>,

    /// Inline JSON credentials; takes precedence over `credentials_file`
    pub credentials: Option<String>,

    /// YAML or JSON plan whitelist
    pub whitelist_file: Option<PathBuf>,

    /// Directory of plan templates, for `dynamic-plans`
    pub templates_dir: Option<PathBuf>,
}

/// MongoDB instance store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string; without one instance metadata is not persisted
    pub mongo_url: Option<String>,
    pub database: String,
    pub collection: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mongo_url: None,
            database: "atlas-broker".to_string(),
            collection: "instances".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "atlas-broker-server",
    about = "Open Service Broker for MongoDB Atlas",
    version
)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/atlas-broker.yaml")]
    pub config: PathBuf,

    /// Environment (development, production)
    #[arg(short, long, default_value = "development")]
    pub environment: String,

    /// Server port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Broker mode (overrides config)
    #[arg(long, value_enum, env = "BROKER_MODE")]
    pub mode: Option<BrokerMode>,

    /// Credentials file (overrides config)
    #[arg(long, env = "BROKER_CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// Plan template directory (overrides config)
    #[arg(long, env = "BROKER_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    /// MongoDB URL (overrides config)
    #[arg(long)]
    pub mongo_url: Option<String>,
}

impl BrokerConfig {
    /// Load configuration from files, environment and arguments
    pub fn load(args: &Args) -> Result<Self> {
        let mut settings = config::Config::builder();

        if args.config.exists() {
            settings = settings.add_source(config::File::from(args.config.clone()).required(false));
        }

        let env_file = format!("config/atlas-broker-{}.yaml", args.environment);
        settings = settings.add_source(config::File::with_name(&env_file).required(false));

        settings =
            settings.add_source(config::Environment::with_prefix("ATLAS_BROKER").separator("__"));

        let mut config: BrokerConfig = settings
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.apply_args(args);

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.server.port = port;
        }

        if let Some(ref log_level) = args.log_level {
            self.logging.level = log_level.clone();
        }

        if args.debug {
            self.logging.level = "debug".to_string();
        }

        if let Some(mode) = args.mode {
            self.broker.mode = mode;
        }

        if let Some(ref path) = args.credentials_file {
            self.broker.credentials_file = Some(path.clone());
        }

        if let Some(ref path) = args.templates_dir {
            self.broker.templates_dir = Some(path.clone());
        }

        if let Some(ref url) = args.mongo_url {
            self.database.mongo_url = Some(url.clone());
        }
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        url::Url::parse(&self.atlas.base_url)
            .with_context(|| format!("Invalid Atlas base URL {:?}", self.atlas.base_url))?;

        if self.atlas.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Atlas request timeout cannot be 0"));
        }

        let has_credentials =
            self.broker.credentials.is_some() || self.broker.credentials_file.is_some();
        if !self.broker.mode.uses_request_credentials() && !has_credentials {
            return Err(anyhow::anyhow!(
                "Mode {} requires broker credentials",
                self.broker.mode
            ));
        }

        if self.broker.mode == BrokerMode::DynamicPlans && self.broker.templates_dir.is_none() {
            return Err(anyhow::anyhow!(
                "Mode {} requires a plan template directory",
                self.broker.mode
            ));
        }

        if let Some(ref url) = self.database.mongo_url {
            if url.is_empty() {
                return Err(anyhow::anyhow!("MongoDB URL cannot be empty"));
            }
            if self.database.database.is_empty() || self.database.collection.is_empty() {
                return Err(anyhow::anyhow!(
                    "MongoDB database and collection names are required"
                ));
            }
        }

        Ok(())
    }

    /// Credentials from inline JSON or the credentials file.
    ///
    /// `basic-auth` mode may run without any, in which case an empty set is
    /// returned.
    pub fn load_credentials(&self) -> BrokerResult<Credentials> {
        match (&self.broker.credentials, &self.broker.credentials_file) {
            (Some(raw), _) => Credentials::from_json(raw),
            (None, Some(path)) => Credentials::from_file(path),
            (None, None) if self.broker.mode.uses_request_credentials() => {
                Ok(Credentials::default())
            }
            (None, None) => Err(BrokerError::config(format!(
                "mode {} requires broker credentials",
                self.broker.mode
            ))),
        }
    }

    pub fn load_whitelist(&self) -> BrokerResult<Option<Whitelist>> {
        self.broker
            .whitelist_file
            .as_ref()
            .map(Whitelist::from_file)
            .transpose()
    }

    pub fn load_templates(&self) -> BrokerResult<Option<TemplateSet>> {
        self.broker
            .templates_dir
            .as_ref()
            .map(TemplateSet::load_dir)
            .transpose()
    }
}
