//! Provides an asynchronous client for interacting with a PACE-dialect BMS
//! using Tokio and the `tokio-serial` crate for serial communication.
//!
//! This module is suitable for applications built on the Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use pacebms_lib::tokio_serial_async::{PaceBMS, Error};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut bms = PaceBMS::new("/dev/ttyUSB0", 0x01)?;
//!     bms.set_timeout(Duration::from_millis(500));
//!
//!     let analog = bms.get_analog().await?;
//!     println!("pack voltage: {:.2} V over {} cells", analog.pack_voltage, analog.cells.len());
//!
//!     let limits = bms.get_limits().await?;
//!     println!("limits: {:?}", limits);
//!
//!     Ok(())
//! }
//! ```

use crate::context::RequestContext;
use crate::protocol::{
    self, AlarmStatus, AnalogStatus, BasicParam, ControlCommand, DecodedRecord, DeviceInfo,
    DiagnosticCounters, ModuleCapacity, ModuleInfo, ProtectionLimits, SetBasicParam, WriteAck,
    MINIMUM_DELAY,
};
use crate::reassembler::FrameReassembler;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Errors specific to the asynchronous Tokio serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error originating from the protocol core.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::Error),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
    /// An error indicating that a Tokio timeout elapsed during an I/O operation.
    #[error("Tokio timeout elapsed: {0}")]
    TokioElapsed(#[from] tokio::time::error::Elapsed),
    /// No valid response frame was reassembled before the deadline.
    #[error("no valid response before deadline")]
    Timeout,
    /// The response decoded to a record of a different service than the
    /// request.
    #[error("unexpected response record")]
    UnexpectedResponse,
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

// Per-read timeout while draining chunks into the reassembler. The overall
// response deadline is `io_timeout`.
const CHUNK_TIMEOUT: Duration = Duration::from_millis(50);

macro_rules! request_with_retry {
    ($self:ident, $service:expr, $info:expr, $variant:ident) => {{
        'retry_block: {
            for t in 0..$self.retries {
                match $self.transact($service, $info).await {
                    Ok(DecodedRecord::$variant(inner)) => break 'retry_block Ok(inner),
                    Ok(other) => {
                        log::trace!(
                            "Failed try {} of {}, unexpected record ({other:?})",
                            t + 1,
                            $self.retries
                        );
                    }
                    Err(err) => {
                        log::trace!("Failed try {} of {}, repeating ({err})", t + 1, $self.retries);
                    }
                }
            }
            match $self.transact($service, $info).await? {
                DecodedRecord::$variant(inner) => Ok(inner),
                other => {
                    log::warn!("unexpected response record: {other:?}");
                    Err(Error::UnexpectedResponse)
                }
            }
        }
    }};
}

/// The main struct for interacting asynchronously with a PACE-dialect BMS
/// using Tokio.
///
/// It drives the same strictly sequential request/response cycle as the
/// synchronous client and adds a configurable per-request retry loop.
/// Most methods are `async` and require a mutable reference to `self`.
#[derive(Debug)]
pub struct PaceBMS {
    serial: tokio_serial::SerialStream,
    reassembler: FrameReassembler,
    context: RequestContext,
    pack_address: u8,
    last_execution: Instant,
    io_timeout: Duration, // Overall deadline for one response
    delay: Duration,      // Delay between commands
    retries: u8,
}

impl PaceBMS {
    /// Creates a new `PaceBMS` instance for asynchronous communication.
    ///
    /// # Arguments
    ///
    /// * `port`: The path to the serial port device (e.g., `/dev/ttyUSB0` on Linux, `COM3` on Windows).
    /// * `pack_address`: The bus address of the pack to poll.
    pub fn new(port: &str, pack_address: u8) -> Result<Self> {
        Ok(Self {
            serial: tokio_serial::new(port, 9600)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
            reassembler: FrameReassembler::new(),
            context: RequestContext::new(),
            pack_address,
            last_execution: Instant::now(),
            io_timeout: Duration::from_millis(500),
            delay: MINIMUM_DELAY,
            retries: 3,
        })
    }

    /// sets the number of retries for a failed request
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    /// Sets the overall per-request response deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Sets the minimum delay between sending commands to the BMS.
    ///
    /// If the provided `delay` is less than [`MINIMUM_DELAY`], the minimum
    /// will be used.
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    /// Age of the last request sent on this link.
    pub fn last_request_age(&self) -> Option<Duration> {
        self.context.age(self.pack_address, Instant::now())
    }

    /// Asynchronously waits for the configured delay duration since the last
    /// command execution.
    async fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            tokio::time::sleep(time_until_delay_reached).await;
        }
    }

    async fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // Before sending a new command, clear any lingering data in the
        // serial port's read buffer so a late response to a previous,
        // timed-out request cannot shift the request correlation.
        loop {
            let pending = self.serial.bytes_to_read()?;
            if pending > 0 {
                log::trace!("got {pending} pending bytes");
                let mut buf: Vec<u8> = vec![0; 64];
                let received =
                    tokio::time::timeout(self.io_timeout, self.serial.read(buf.as_mut_slice()))
                        .await??;
                log::trace!("{received} pending bytes consumed");
            } else {
                break;
            }
        }
        self.serial_await_delay().await;

        log::trace!("write frame: {:?}", String::from_utf8_lossy(tx_buffer));
        tokio::time::timeout(self.io_timeout, self.serial.write_all(tx_buffer)).await??;
        Ok(())
    }

    /// One full request/response cycle: build, send, record the request
    /// context, then drain chunks through the reassembler until the response
    /// decodes or the deadline passes.
    async fn transact(&mut self, service: u8, info: &[u8]) -> Result<DecodedRecord> {
        let request = protocol::build_frame(self.pack_address, service, info)?;
        self.reassembler.clear();
        self.send_bytes(request.as_bytes()).await?;
        self.context
            .record_sent(self.pack_address, service, Instant::now());

        let deadline = Instant::now() + self.io_timeout;
        loop {
            while let Some(frame) = self.reassembler.next_frame() {
                if frame.address != self.pack_address {
                    log::debug!(
                        "ignoring frame for address 0x{:02X} while polling 0x{:02X}",
                        frame.address,
                        self.pack_address
                    );
                    continue;
                }
                // On a two-wire link we read back our own request. A write
                // echo is indistinguishable from its acknowledgement and is
                // accepted as one; a read echo is skipped.
                if protocol::is_read_service(service)
                    && frame.service == service
                    && frame.payload == info
                {
                    log::trace!("skipping local echo of request 0x{service:02X}");
                    continue;
                }
                let hint = self.context.resolve_hint(frame.address);
                match protocol::decode_frame(&frame, hint) {
                    Ok(record) => {
                        self.last_execution = Instant::now();
                        return Ok(record);
                    }
                    Err(
                        err @ (crate::Error::ResponseNotOk { .. }
                        | crate::Error::AmbiguousAlignment { .. }
                        | crate::Error::TruncatedPayload { .. }),
                    ) => {
                        self.last_execution = Instant::now();
                        return Err(err.into());
                    }
                    Err(err) => log::debug!("skipping frame ({err})"),
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let mut buf = [0u8; 256];
            match tokio::time::timeout(CHUNK_TIMEOUT, self.serial.read(&mut buf)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => {
                    log::trace!("read {n} bytes");
                    self.reassembler.feed(&buf[..n]);
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_elapsed) => {} // keep waiting until the deadline
            }
        }
    }

    /// Asynchronously retrieves the analog status: cell voltages,
    /// temperatures, current, pack voltage, capacities and cycle count.
    pub async fn get_analog(&mut self) -> Result<AnalogStatus> {
        log::trace!("get analog status");
        let info = [self.pack_address];
        request_with_retry!(self, protocol::service::READ_ANALOG, &info, Analog)
    }

    /// Asynchronously retrieves the alarm/protection flag status.
    pub async fn get_alarms(&mut self) -> Result<AlarmStatus> {
        log::trace!("get alarm status");
        let info = [self.pack_address];
        request_with_retry!(self, protocol::service::READ_ALARMS, &info, Alarms)
    }

    /// Asynchronously retrieves the protection limit parameters.
    pub async fn get_limits(&mut self) -> Result<ProtectionLimits> {
        log::trace!("get protection limits");
        let info = [self.pack_address];
        request_with_retry!(self, protocol::service::READ_LIMITS, &info, Limits)
    }

    /// Asynchronously retrieves the device identification text.
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo> {
        log::trace!("get device info");
        let info = [self.pack_address];
        request_with_retry!(self, protocol::service::READ_DEVICE_INFO, &info, DeviceInfo)
    }

    /// Asynchronously retrieves the diagnostic event counters.
    pub async fn get_diagnostics(&mut self, op: u8) -> Result<DiagnosticCounters> {
        log::trace!("get diagnostic counters");
        let info = [self.pack_address, op];
        request_with_retry!(self, protocol::service::READ_DIAGNOSTICS, &info, Diagnostics)
    }

    /// Asynchronously retrieves the module ASCII info block.
    pub async fn get_module_info(&mut self) -> Result<ModuleInfo> {
        log::trace!("get module info");
        let info = [self.pack_address, protocol::MODULE_ASCII_INFO];
        request_with_retry!(self, protocol::service::READ_MODULE, &info, ModuleInfo)
    }

    /// Asynchronously retrieves the module capacity/energy block.
    pub async fn get_module_capacity(&mut self) -> Result<ModuleCapacity> {
        log::trace!("get module capacity");
        let info = [self.pack_address, protocol::MODULE_CAPACITY];
        request_with_retry!(self, protocol::service::READ_MODULE, &info, ModuleCapacity)
    }

    /// Asynchronously writes one basic protection parameter.
    ///
    /// The value must already be scaled to the wire unit documented on
    /// [`BasicParam`].
    pub async fn set_basic_param(&mut self, param: BasicParam, value: u16) -> Result<WriteAck> {
        log::trace!("set {param:?} to {value}");
        let payload = SetBasicParam::payload(self.pack_address, param, value);
        request_with_retry!(self, protocol::service::SET_BASIC_PARAM, &payload, Ack)
    }

    /// Asynchronously sends an opaque control command as configured, without
    /// interpreting its bytes.
    pub async fn control(&mut self, command: &ControlCommand) -> Result<WriteAck> {
        log::trace!("send control command 0x{:02X}", command.service);
        request_with_retry!(self, command.service, &command.info, Ack)
    }
}
