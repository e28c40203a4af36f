use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use pacebms_lib::protocol::{self, ControlCommand};
use pacebms_lib::serialport::PaceBMS;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn parse_hex_info(info: &str) -> Result<Vec<u8>> {
    let info = info.trim();
    if info.len() % 2 != 0 {
        bail!("INFO hex string must have an even number of characters");
    }
    (0..info.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&info[i..i + 2], 16)
                .with_context(|| format!("Invalid hex characters in INFO: {:?}", &info[i..i + 2]))
        })
        .collect()
}

macro_rules! print_analog {
    ($bms:expr) => {
        println!(
            "Analog: {:?}",
            $bms.get_analog()
                .with_context(|| "Cannot get analog status")?
        )
    };
}
macro_rules! print_alarms {
    ($bms:expr) => {
        println!(
            "Alarms: {:?}",
            $bms.get_alarms()
                .with_context(|| "Cannot get alarm status")?
        )
    };
}
macro_rules! print_limits {
    ($bms:expr) => {
        println!(
            "Limits: {:?}",
            $bms.get_limits()
                .with_context(|| "Cannot get protection limits")?
        )
    };
}
macro_rules! print_device_info {
    ($bms:expr) => {
        println!(
            "Device info: {:?}",
            $bms.get_device_info()
                .with_context(|| "Cannot get device info")?
        )
    };
}
macro_rules! print_diagnostics {
    ($bms:expr, $op:expr) => {
        println!(
            "Diagnostics: {:?}",
            $bms.get_diagnostics($op)
                .with_context(|| "Cannot get diagnostic counters")?
        )
    };
}
macro_rules! print_module_info {
    ($bms:expr) => {
        println!(
            "Module info: {:?}",
            $bms.get_module_info()
                .with_context(|| "Cannot get module info")?
        )
    };
}
macro_rules! print_module_capacity {
    ($bms:expr) => {
        println!(
            "Module capacity: {:?}",
            $bms.get_module_capacity()
                .with_context(|| "Cannot get module capacity")?
        )
    };
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut bms = PaceBMS::new(&args.device, args.address)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout);
    bms.set_delay(args.delay);

    match args.command {
        commandline::CliCommands::Analog => print_analog!(bms),
        commandline::CliCommands::Alarms => print_alarms!(bms),
        commandline::CliCommands::Limits => print_limits!(bms),
        commandline::CliCommands::DeviceInfo => print_device_info!(bms),
        commandline::CliCommands::Diagnostics { op } => print_diagnostics!(bms, op),
        commandline::CliCommands::ModuleInfo => print_module_info!(bms),
        commandline::CliCommands::ModuleCapacity => print_module_capacity!(bms),
        commandline::CliCommands::All => {
            print_device_info!(bms);
            print_analog!(bms);
            print_alarms!(bms);
            print_limits!(bms);
            print_diagnostics!(bms, protocol::DiagnosticCounters::DEFAULT_OP);
            print_module_info!(bms);
            print_module_capacity!(bms);
        }
        commandline::CliCommands::SetParam { param, value } => {
            let ack = bms
                .set_basic_param(param.into(), value)
                .with_context(|| "Cannot write parameter")?;
            println!("Ack: {ack:?}");
        }
        commandline::CliCommands::Control { service, info } => {
            if !protocol::is_write_service(service) || service == protocol::service::SET_BASIC_PARAM
            {
                bail!(
                    "Service 0x{:02X} is not a control service (use 0x{:02X} or 0x{:02X})",
                    service,
                    protocol::service::CONTROL_PRIMARY,
                    protocol::service::CONTROL_SECONDARY
                );
            }
            let command = ControlCommand::new(service, parse_hex_info(&info)?);
            let ack = bms
                .control(&command)
                .with_context(|| "Cannot send control command")?;
            println!("Ack: {ack:?}");
        }
        commandline::CliCommands::Daemon {
            output,
            interval,
            metrics,
        } => daemon::run(bms, output, interval, metrics)?,
    }

    Ok(())
}
