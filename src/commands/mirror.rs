//! Commands that talk to the source: running the service, checking entity
//! types and printing their projected tables.

use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crm_mirror::config::{Config, ConfigError};
use crm_mirror::engine::{self, BulkSyncEngine};
use crm_mirror::feed::{DataverseClient, WatermarkStore};
use crm_mirror::orchestrator::{self, OrchestratorOptions, SyncOrchestrator};
use crm_mirror::schema::Dialect;

/// Print the table an entity type projects to
#[derive(Debug, Args)]
pub struct SchemaCommand {
    /// Entity logical name (e.g. "contact")
    pub entity: String,
}

fn source_client(config: &Config) -> Result<DataverseClient, Box<dyn std::error::Error>> {
    let url = config.source.url.as_deref().ok_or_else(|| {
        ConfigError::Invalid("source.url is required to reach the source".to_string())
    })?;
    let client = DataverseClient::new(
        url,
        config.source.access_token.clone(),
        WatermarkStore::new(config.data_dir.value.clone()),
    )?
    .with_page_size(config.source.page_size);
    Ok(client)
}

/// Runs the sync service until Ctrl-C.
pub async fn run_service(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if !config.run_service.value {
        info!("Sync service is disabled (run_service = false)");
        return Ok(());
    }
    config.validate()?;

    let client = Arc::new(source_client(config)?);
    let backend = engine::connect_backend(&config.target_connection_string.value).await?;
    let engine = BulkSyncEngine::new(backend, config.ignore_invalid_data.value);
    let orchestrator = SyncOrchestrator::start(
        OrchestratorOptions::from_config(config),
        &*client,
        client.clone(),
        engine,
    )
    .await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C; shutting down"),
        }
        shutdown.cancel();
    });

    orchestrator.run(cancel).await?;
    Ok(())
}

/// Validates every configured entity type against the source without writing anything.
pub async fn check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = source_client(config)?;
    if config.entity_types.value.is_empty() {
        println!("No entity types configured.");
        return Ok(());
    }

    let mut failures = 0;
    for entity_type in &config.entity_types.value {
        match orchestrator::prepare_mapping(&client, entity_type).await {
            Ok(mapping) => println!(
                "  ✓ {} -> table {} ({} columns)",
                entity_type,
                mapping.table_name,
                mapping.column_count() + 3
            ),
            Err(e) => {
                failures += 1;
                println!("  ✗ {}: {}", entity_type, e);
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} entity type(s) cannot be mirrored", failures).into());
    }
    Ok(())
}

impl SchemaCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let dialect = engine::target_dialect(&config.target_connection_string.value)
            .unwrap_or(Dialect::Sqlite);
        let client = source_client(config)?;
        let mapping = orchestrator::prepare_mapping(&client, &self.entity).await?;
        println!("{};", mapping.create_table_statement(dialect));
        Ok(())
    }
}
