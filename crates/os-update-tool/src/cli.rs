//! Definition of the command line interface (CLI).

use std::env;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use os_update_common::cmd::SystemRunner;
use os_update_common::error::{Result, ToolError};
use tracing::error;
use tracing::level_filters::LevelFilter;

use crate::boot::{self, UkiStore};
use crate::system::blkdev;
use crate::write::Installer;

pub fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let runner = SystemRunner;
    match &args.command {
        Command::Write {
            image,
            checksum,
            dev,
        } => {
            let checksum = parse_checksum(checksum)?;
            Installer::new(&runner).write(image, &checksum, *dev)
        }
        Command::Apply => boot::apply(&runner, &UkiStore::default()),
        Command::Commit => boot::commit(&runner, &UkiStore::default()),
        Command::Rollback => boot::rollback(&runner, &UkiStore::default()),
        Command::Display => {
            let active = blkdev::get_active_partition(&runner)?;
            println!("{active}");
            Ok(())
        }
    }
}

/// Validate the user-supplied SHA-256 checksum and normalize it to
/// lowercase hex.
fn parse_checksum(checksum: &str) -> Result<String> {
    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ToolError::BadArguments(format!(
            "checksum must be 64 hexadecimal characters, got `{checksum}`"
        )));
    }
    Ok(checksum.to_ascii_lowercase())
}

fn init_tracing(debug: bool) {
    let debug = debug || env::var("DEBUG").map(|value| value == "true").unwrap_or(false);
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Parser)]
#[clap(name = "os-update-tool", version, about = "A/B update tool for UKI-booted systems")]
pub struct Args {
    /// Enable debug logging.
    #[clap(long, global = true)]
    pub debug: bool,
    /// The command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Write an update image to the inactive slot.
    Write {
        /// Path to the compressed update image (`.gz` or `.xz`).
        image: Utf8PathBuf,
        /// Expected SHA-256 checksum of the image, hex-encoded.
        checksum: String,
        /// Provision a development login on the written slot.
        #[clap(long)]
        dev: bool,
    },
    /// Boot the written slot once on the next reboot.
    Apply,
    /// Make the currently booted slot the permanent default.
    Commit,
    /// Set the default boot entry back to the previous slot.
    Rollback,
    /// Display the currently active partition.
    Display,
}
