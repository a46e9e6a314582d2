//! CLI module for chaos cells
//!
//! Provides command-line interface for:
//! - init: Write the first snapshot of a cell
//! - serve: Restore the cell and answer JSON requests from stdin
//! - inspect: Print the persisted cell state

mod args;
mod commands;
mod errors;
mod io;
mod requests;

pub use args::{Cli, Command};
pub use commands::{init, inspect, run, run_command, serve};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_requests, write_error, write_response};
pub use requests::{handle_request, CellRequest};
