// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logship::config::{self, Config};
use logship::error::SessionError;
use logship::logger::Formatter;
use logship::parameter_store::{FileParameterStore, ParameterStore};
use logship::plugin::PluginRegistry;
use logship::session_manager::SessionManager;

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to prepare data directory {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Default session failed to launch: {0}")]
    DefaultSession(#[from] SessionError),
    #[error("Failed to wait for shutdown signal: {0}")]
    Signal(std::io::Error),
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = config::get_config();
    init_logging(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_new(config.log_level.as_filter_directive())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
    }
    debug!("Logging subsystem enabled");
}

async fn run(config: Config) -> Result<(), AgentError> {
    config.validate().map_err(AgentError::Config)?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .map_err(|source| AgentError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;

    let parameter_store: Arc<dyn ParameterStore> =
        Arc::new(FileParameterStore::open(config.parameter_store_path()));

    info!(
        config = %config.config_file.display(),
        extras = ?config.extra_config_dir,
        data = %config.data_dir.display(),
        "Starting logship agent"
    );
    let manager = SessionManager::start(&config, PluginRegistry::with_builtins(), parameter_store).await?;

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutting down");
    manager.stop().await;
    signal.map_err(AgentError::Signal)
}
