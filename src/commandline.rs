use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show analog status: cell voltages, temperatures, current, pack voltage, capacities, cycles
    Analog,
    /// Show alarm and protection flag status (raw flag bytes)
    Alarms,
    /// Show the configured protection limits
    Limits,
    /// Show device model and firmware identification
    DeviceInfo,
    /// Show diagnostic event counters
    Diagnostics {
        /// Diagnostic operation selector byte (e.g. 0x00)
        #[arg(value_parser = maybe_hex::<u8>, default_value = "0")]
        op: u8,
    },
    /// Show the module ASCII info block
    ModuleInfo,
    /// Show the module capacity/energy block
    ModuleCapacity,
    /// Show all available BMS information by running every read command
    All,
    /// Write one basic protection parameter (value pre-scaled to the wire unit)
    SetParam {
        /// Parameter to write
        #[arg(value_enum)]
        param: CliBasicParam,
        /// Raw wire value: millivolts for cell thresholds, centivolts for
        /// pack thresholds, centiamps for the current limit
        #[arg(value_parser = maybe_hex::<u16>)]
        value: u16,
    },
    /// Send an opaque control command (operation bytes from your bus documentation)
    Control {
        /// Control service id (0x45 or 0x49)
        #[arg(value_parser = maybe_hex::<u8>)]
        service: u8,
        /// INFO field as hex characters, e.g. "010F"
        info: String,
    },
    /// Run in daemon mode, periodically fetching and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of metrics to fetch (e.g., analog,alarms,limits or all)
        #[clap(long, short, use_value_delimiter = true, default_value = "analog,alarms")]
        metrics: Vec<String>,
    },
}

/// CLI mirror of [`pacebms_lib::protocol::BasicParam`].
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum CliBasicParam {
    CellVoltageHigh,
    CellVoltageLow,
    ChargeCurrentLimit,
    PackVoltageHigh,
    PackVoltageLow,
}

impl From<CliBasicParam> for pacebms_lib::protocol::BasicParam {
    fn from(param: CliBasicParam) -> Self {
        match param {
            CliBasicParam::CellVoltageHigh => Self::CellVoltageHigh,
            CliBasicParam::CellVoltageLow => Self::CellVoltageLow,
            CliBasicParam::ChargeCurrentLimit => Self::ChargeCurrentLimit,
            CliBasicParam::PackVoltageHigh => Self::PackVoltageHigh,
            CliBasicParam::PackVoltageLow => Self::PackVoltageLow,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "PACE-dialect BMS command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Bus address of the pack to poll
    #[arg(short, long, value_parser = maybe_hex::<u8>, default_value = "1")]
    pub address: u8,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Deadline for one request/response cycle (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between sending multiple commands to the BMS (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub delay: Duration,
}
