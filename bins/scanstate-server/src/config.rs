use clap::{Args, Parser, Subcommand};

use scanstate_api::StoreKind;
use scanstate_engine::{DecodeFailurePolicy, EngineConfig, SourceKind};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "scanstate-server", about = "Latest-observation state service for network scans")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume the subscription and keep the state store current
    Serve(ServeArgs),
    /// Read records from the configured store
    Inspect(InspectArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Clone, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(subcommand)]
    pub command: InspectCommand,
}

#[derive(Subcommand, Clone, Debug)]
pub enum InspectCommand {
    /// List records, newest first
    List {
        /// 0 lists everything
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show the record of one (ip, port, service) key
    Get { ip: String, port: u32, service: String },
}

/// Config file plus flag/env overrides shared by every subcommand.
#[derive(Args, Clone, Debug, Default)]
pub struct CommonArgs {
    /// Path to TOML config file
    #[arg(long, env = "SCANSTATE_CONFIG")]
    pub config: Option<String>,

    /// memory | sqlite | postgres
    #[arg(long, env = "STORE_TYPE")]
    pub store_type: Option<StoreKind>,

    /// SQLite path or Postgres connection string
    #[arg(long, env = "STORE_CONNECTION")]
    pub store_connection: Option<String>,

    /// pubsub | tcp
    #[arg(long, env = "SOURCE_TYPE")]
    pub source_type: Option<SourceKind>,

    #[arg(long, env = "PUBSUB_PROJECT_ID")]
    pub project_id: Option<String>,

    #[arg(long, env = "PUBSUB_SUBSCRIPTION_ID")]
    pub subscription_id: Option<String>,

    /// OAuth2 bearer token for the public Pub/Sub endpoint
    #[arg(long, env = "PUBSUB_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Listen address of the tcp source
    #[arg(long, env = "SOURCE_LISTEN")]
    pub listen: Option<String>,

    #[arg(long, env = "WORKER_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// nack | drop
    #[arg(long, env = "DECODE_FAILURE")]
    pub decode_failure: Option<DecodeFailurePolicy>,

    /// Inspection API port, 0 disables it
    #[arg(long, env = "API_PORT")]
    pub api_port: Option<u16>,
}

impl CommonArgs {
    /// Load the config file (or defaults) and apply every given override.
    pub fn resolve(&self) -> Result<EngineConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => {
                let config = EngineConfig::load(path)?;
                tracing::info!(config = %path, "loaded config");
                config
            }
            None => EngineConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut EngineConfig) {
        if let Some(kind) = self.store_type {
            config.store.kind = kind;
        }
        if let Some(connection) = &self.store_connection {
            config.store.connection = connection.clone();
        }
        if let Some(kind) = self.source_type {
            config.source.kind = kind;
        }
        if let Some(project_id) = &self.project_id {
            config.source.project_id = project_id.clone();
        }
        if let Some(subscription_id) = &self.subscription_id {
            config.source.subscription_id = subscription_id.clone();
        }
        if let Some(token) = &self.access_token {
            config.source.access_token = Some(token.clone());
        }
        if let Some(listen) = &self.listen {
            config.source.listen = listen.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.worker.concurrency = concurrency;
        }
        if let Some(policy) = self.decode_failure {
            config.worker.decode_failure = policy;
        }
        if let Some(port) = self.api_port {
            config.api.port = port;
        }
    }
}
