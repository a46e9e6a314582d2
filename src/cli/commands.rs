//! CLI command implementations
//!
//! - init writes the first snapshot of a cell, which marks its data
//!   directory as initialized
//! - serve restores the cell from its snapshot, starts its background
//!   loops and answers JSON requests from stdin until EOF, then writes a
//!   final snapshot
//! - inspect prints the persisted state without starting anything

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::runtime::Runtime;

use crate::cell::{CellConfig, ChaosCell};
use crate::clock::LocalClock;
use crate::coordinator::{CoordinatorManager, LocalCoordinatorTransport};
use crate::observability::{log_event_with_fields, Event};
use crate::snapshot::{save_snapshot, snapshot_path, CellSnapshot};
use crate::storage::{ClusterDirectory, MemoryReplicaStore};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{read_requests, write_error, write_response};
use super::requests::{handle_request, CellRequest};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Serve { config } => serve(&config),
        Command::Inspect { config } => inspect(&config),
    }
}

fn load_config(config_path: &Path) -> CliResult<CellConfig> {
    let config = CellConfig::load(config_path).map_err(|e| CliError::config_error(e.to_string()))?;
    log_event_with_fields(
        Event::ConfigLoaded,
        &[
            ("path", &config_path.display().to_string()),
            ("cell_id", &config.cell_id.to_string()),
        ],
    );
    Ok(config)
}

fn is_initialized(config: &CellConfig) -> bool {
    snapshot_path(&config.data_dir).exists()
}

fn runtime() -> CliResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::boot_failed(format!("Failed to start runtime: {}", e)))
}

/// Initialize the data directory of a new cell
///
/// Writes an empty snapshot holding the configured coordinator cells.
pub fn init(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    if is_initialized(&config) {
        return Err(CliError::already_initialized(&config.data_dir));
    }

    let coordinators = CoordinatorManager::new();
    coordinators.update_cells(&config.coordinator_cells(), &[])?;
    let snapshot = CellSnapshot {
        cell_id: config.cell_id,
        cards: Vec::new(),
        coordinators: coordinators.state()?,
        table_nodes: Vec::new(),
    };
    let manifest = save_snapshot(&config.data_dir, &snapshot)?;

    write_response(json!({
        "initialized": true,
        "cell_id": config.cell_id,
        "checksum": manifest.checksum,
    }))
}

/// Restore the cell of `config` with in-memory stores for its clusters
fn boot_cell(config: CellConfig) -> CliResult<ChaosCell> {
    let directory = Arc::new(ClusterDirectory::new());
    for cluster_name in config.cluster_names() {
        directory.register(Arc::new(MemoryReplicaStore::new(cluster_name)))?;
    }
    let clock = Arc::new(LocalClock::new(config.clock_tag));
    ChaosCell::open(
        config,
        clock,
        Arc::new(LocalCoordinatorTransport::new()),
        directory,
    )
    .map_err(|e| CliError::boot_failed(e.to_string()))
}

/// Serve JSON requests from stdin until EOF
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    if !is_initialized(&config) {
        return Err(CliError::not_initialized(&config.data_dir));
    }

    let runtime = runtime()?;
    let cell = Arc::new(boot_cell(config)?);
    runtime.block_on(async { cell.start() })?;

    for request_result in read_requests() {
        match request_result {
            Ok(value) => {
                let result = match CellRequest::parse(value) {
                    Ok(request) => runtime.block_on(handle_request(&cell, request)),
                    Err(err) => Err(err),
                };
                match result {
                    Ok(data) => write_response(data)?,
                    Err(err) => write_error(err.category().as_str(), &err.to_string())?,
                }
            }
            Err(e) => {
                // Unreadable input ends the session
                write_error(e.code_str(), &e.message())?;
                break;
            }
        }
    }

    runtime.block_on(cell.shutdown())?;
    Ok(())
}

/// Print the persisted cell state and exit
pub fn inspect(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    if !is_initialized(&config) {
        return Err(CliError::not_initialized(&config.data_dir));
    }

    let runtime = runtime()?;
    let cell = boot_cell(config)?;
    let view = runtime.block_on(cell.describe())?;
    write_response(view)
}
