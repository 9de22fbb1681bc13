//! Core application

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::core::banner;
use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::simulate::{self, SimulateOptions};
use crate::data::memory::MemorySession;
use crate::data::session::Session;
use crate::domain::traces::TraceStorage;

pub struct CoreApp {
    pub config: AppConfig,
    pub session: Arc<dyn Session>,
    pub storage: TraceStorage,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::Simulate {
                traces,
                spans_per_trace,
                services,
            }) => {
                let config = AppConfig::load(&cli_config)?;
                let options = SimulateOptions {
                    traces,
                    spans_per_trace,
                    services,
                };
                let report = simulate::run(&config.storage, options).await?;
                banner::print_simulation(&report);
                Ok(())
            }
            Some(Commands::Check) | None => {
                let app = Self::init(&cli_config)?;
                app.check().await
            }
        }
    }

    /// Build the storage over the in-memory session
    pub fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let session: Arc<dyn Session> = Arc::new(MemorySession::default());
        let storage = TraceStorage::new(config.storage.clone(), session.clone())
            .context("Failed to initialize trace storage")?;
        Ok(Self {
            config,
            session,
            storage,
        })
    }

    async fn check(&self) -> Result<()> {
        let metadata = self
            .storage
            .metadata()
            .await
            .context("Failed to read schema metadata")?;
        self.storage
            .check()
            .await
            .context("Storage check failed")?;
        banner::print_capabilities(self.session.backend_name(), &metadata, &self.config.storage);
        self.storage.close();
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }
}
