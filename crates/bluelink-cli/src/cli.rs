//! Command-line interface definitions and parsing

use std::path::PathBuf;

use bluelink_core::{Address, BleUuid};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bluelink", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the simulated radio instead of the system Bluetooth stack
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Adapter id to use (defaults to the first adapter reported)
    #[arg(short, long, global = true)]
    pub adapter: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan for advertising devices
    Scan(ScanArgs),
    /// Connect to a device and read one characteristic
    Read {
        /// Device address (AA:BB:CC:DD:EE:FF)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Service UUID (short or full form)
        #[arg(value_parser = parse_uuid)]
        service: BleUuid,
        /// Characteristic UUID (short or full form)
        #[arg(value_parser = parse_uuid)]
        characteristic: BleUuid,
    },
    /// Advertise as a peripheral
    Advertise(AdvertiseArgs),
    /// List the Bluetooth adapters of this platform
    Adapters,
    /// Show or write the configuration
    Config {
        /// Print an example configuration file
        #[arg(long)]
        example: bool,
        /// Write the effective configuration to ~/.bluelink/config.toml
        #[arg(long, conflicts_with = "example")]
        save: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Scan duration in seconds, 0 scans until interrupted
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Only report devices advertising this service (repeatable)
    #[arg(short, long = "service", value_parser = parse_uuid)]
    pub services: Vec<BleUuid>,

    /// Only report devices whose name starts with this prefix
    #[arg(long)]
    pub name_prefix: Option<String>,

    /// Drop advertisements weaker than this (dBm)
    #[arg(long, allow_negative_numbers = true)]
    pub min_rssi: Option<i16>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct AdvertiseArgs {
    /// Local name to advertise
    #[arg(short, long)]
    pub name: Option<String>,

    /// Service UUID to publish and advertise
    #[arg(short, long, value_parser = parse_uuid)]
    pub service: Option<BleUuid>,

    /// Advertising duration in seconds, 0 advertises until interrupted
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

fn parse_uuid(input: &str) -> Result<BleUuid, String> {
    BleUuid::parse(input).map_err(|err| err.message().to_string())
}

fn parse_address(input: &str) -> Result<Address, String> {
    Address::parse(input).map_err(|err| err.message().to_string())
}
