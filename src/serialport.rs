use crate::context::RequestContext;
use crate::protocol::{
    self, AlarmStatus, AnalogStatus, BasicParam, ControlCommand, DecodedRecord, DeviceInfo,
    DiagnosticCounters, ModuleCapacity, ModuleInfo, ProtectionLimits, SetBasicParam, WriteAck,
    MINIMUM_DELAY,
};
use crate::reassembler::FrameReassembler;
use std::time::{Duration, Instant};

/// Errors specific to the synchronous serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error originating from the protocol core.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::Error),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `serialport` crate.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// No valid response frame was reassembled before the deadline.
    #[error("no valid response before deadline")]
    Timeout,
    /// The response decoded to a record of a different service than the
    /// request.
    #[error("unexpected response record")]
    UnexpectedResponse,
}

/// A specialized `Result` type for operations within this module.
type Result<T> = std::result::Result<T, Error>;

// Per-read timeout while draining chunks into the reassembler. The overall
// response deadline is `io_timeout`.
const CHUNK_TIMEOUT: Duration = Duration::from_millis(50);

macro_rules! expect_record {
    ($record:expr, $variant:ident) => {
        match $record {
            DecodedRecord::$variant(inner) => Ok(inner),
            other => {
                log::warn!("unexpected response record: {other:?}");
                Err(Error::UnexpectedResponse)
            }
        }
    };
}

/// Synchronous client driving one BMS pack over a half-duplex RS485 link.
///
/// The bus allows a single outstanding request, so every operation is a
/// strictly sequential request, await-response, decode cycle. Timeouts and
/// pacing live here; the protocol core never blocks.
#[derive(Debug)]
pub struct PaceBMS {
    serial: Box<dyn serialport::SerialPort>,
    reassembler: FrameReassembler,
    context: RequestContext,
    pack_address: u8,
    last_execution: Instant,
    delay: Duration,
    io_timeout: Duration,
}

impl PaceBMS {
    pub fn new(port: &str, pack_address: u8) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, 9600)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(CHUNK_TIMEOUT)
                .open()?,
            reassembler: FrameReassembler::new(),
            context: RequestContext::new(),
            pack_address,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
            io_timeout: Duration::from_millis(500),
        })
    }

    /// Sets the overall per-request response deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    /// Age of the last request sent on this link, for staleness decisions in
    /// polling callers.
    pub fn last_request_age(&self) -> Option<Duration> {
        self.context.age(self.pack_address, Instant::now())
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self.serial.bytes_to_read()?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self.serial.read(buf.as_mut_slice())?;
                log::trace!("Read {} pending bytes", received);
            } else {
                break;
            }
        }
        self.serial_await_delay();

        log::trace!("write frame: {:?}", String::from_utf8_lossy(tx_buffer));
        self.serial.write_all(tx_buffer)?;
        Ok(())
    }

    /// One full request/response cycle: build, send, record the request
    /// context, then drain chunks through the reassembler until the response
    /// decodes or the deadline passes.
    fn transact(&mut self, service: u8, info: &[u8]) -> Result<DecodedRecord> {
        let request = protocol::build_frame(self.pack_address, service, info)?;
        self.reassembler.clear();
        self.send_bytes(request.as_bytes())?;
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
            match self.serial.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    log::trace!("read {n} bytes");
                    self.reassembler.feed(&buf[..n]);
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn get_analog(&mut self) -> Result<AnalogStatus> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(protocol::service::READ_ANALOG, &[pack])?,
            Analog
        )
    }

    pub fn get_alarms(&mut self) -> Result<AlarmStatus> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(protocol::service::READ_ALARMS, &[pack])?,
            Alarms
        )
    }

    pub fn get_limits(&mut self) -> Result<ProtectionLimits> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(protocol::service::READ_LIMITS, &[pack])?,
            Limits
        )
    }

    pub fn get_device_info(&mut self) -> Result<DeviceInfo> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(protocol::service::READ_DEVICE_INFO, &[pack])?,
            DeviceInfo
        )
    }

    pub fn get_diagnostics(&mut self, op: u8) -> Result<DiagnosticCounters> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(protocol::service::READ_DIAGNOSTICS, &[pack, op])?,
            Diagnostics
        )
    }

    pub fn get_module_info(&mut self) -> Result<ModuleInfo> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(
                protocol::service::READ_MODULE,
                &[pack, protocol::MODULE_ASCII_INFO]
            )?,
            ModuleInfo
        )
    }

    pub fn get_module_capacity(&mut self) -> Result<ModuleCapacity> {
        let pack = self.pack_address;
        expect_record!(
            self.transact(
                protocol::service::READ_MODULE,
                &[pack, protocol::MODULE_CAPACITY]
            )?,
            ModuleCapacity
        )
    }

    /// Writes one basic protection parameter. The value must already be
    /// scaled to the wire unit documented on [`BasicParam`].
    pub fn set_basic_param(&mut self, param: BasicParam, value: u16) -> Result<WriteAck> {
        let payload = SetBasicParam::payload(self.pack_address, param, value);
        expect_record!(
            self.transact(protocol::service::SET_BASIC_PARAM, &payload)?,
            Ack
        )
    }

    /// Sends an opaque control command as configured, without interpreting
    /// its bytes.
    pub fn control(&mut self, command: &ControlCommand) -> Result<WriteAck> {
        expect_record!(self.transact(command.service, &command.info)?, Ack)
    }
}
