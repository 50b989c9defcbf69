use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use parse_size::parse_size;

use dfu::{DfuFilter, DownloadOptions};
use dfu_flash::FlashOptions;
use error::CliError;
use flash::*;
use list::*;
use status::*;

mod error;
mod flash;
mod list;
mod status;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct TargetArgs {
    /// vendor ID (ex: "0483"), ignored when a serial number is given
    #[clap(short, long, value_parser=hex_u16, default_value = "0483")]
    vendor: u16,
    /// device serial number
    #[clap(short, long)]
    serial: Option<String>,
    /// interface number
    #[clap(short, long)]
    interface: Option<u8>,
    /// alternate setting
    #[clap(short, long)]
    alt: Option<u8>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
    },
    /// flash a raw binary image
    Flash {
        /// file to write
        file: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        /// bytes per transfer (ex: 1KiB, 2048)
        #[clap(
            short,
            long,
            value_parser = parse_block_size,
            default_value = "2048"
        )]
        block_size: usize,
        /// skip manifestation after the last block
        #[clap(long)]
        no_manifest: bool,
    },
    /// show device state
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List { vendor: None }
    }
}

impl TargetArgs {
    fn filter(&self) -> DfuFilter {
        let mut filter = DfuFilter::default().with_vendor_id(self.vendor);
        if let Some(serial) = &self.serial {
            filter = filter.with_serial_number(serial.as_str());
        }
        if let Some(interface) = self.interface {
            filter = filter.with_interface(interface);
        }
        if let Some(alt) = self.alt {
            filter = filter.with_alt_setting(alt);
        }
        filter
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_block_size(s: &str) -> Result<usize, String> {
    let size = parse_size(s).map_err(|e| format!("{e}"))?;
    match size.try_into() {
        Ok(0) => Err("block size must be at least 1 byte".into()),
        Ok(size) => Ok(size),
        Err(e) => Err(format!("{e}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { vendor } => list_dfu_devices(*vendor).await,
        Commands::Flash {
            file,
            target,
            block_size,
            no_manifest,
        } => {
            let options = FlashOptions {
                filter: target.filter(),
                download: DownloadOptions {
                    block_size: *block_size,
                    manifest: !*no_manifest,
                },
            };
            flash_file(file, &options).await
        }
        Commands::Status { target } => show_status(&target.filter()).await,
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
