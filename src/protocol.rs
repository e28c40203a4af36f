use crate::Error;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

/// Frame start marker.
pub const START_MARKER: char = '~';
/// Protocol version byte, fixed for this protocol family.
pub const VERSION: u8 = 0x22;
/// CID1 discriminator, fixed for this protocol family.
pub const PROTOCOL_ID: u8 = 0x4A;
/// Largest payload that still fits the 12-bit hex-character length field.
pub const MAX_PAYLOAD_BYTES: usize = 2047;

// Some USB - RS485 dongles need time to switch between TX and RX, so keep a
// minimum gap between request frames.
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(10);

// `~` + VER + ADR + CID1 + CID2 + LEN + CHKSUM, with an empty INFO field.
const MIN_FRAME_CHARS: usize = 17;

/// Service/command ids (CID2) understood by this crate.
///
/// Responses carry the RTN status code in the CID2 slot, so a successful
/// response arrives with `RTN_OK` here and must be resolved through the
/// request context.
pub mod service {
    /// Analog status: cell voltages, temperatures, current, capacity.
    pub const READ_ANALOG: u8 = 0x42;
    /// Alarm and protection flag status.
    pub const READ_ALARMS: u8 = 0x44;
    /// Control command, opaque operation byte (primary).
    pub const CONTROL_PRIMARY: u8 = 0x45;
    /// Module sub-read: ASCII info or capacity/energy block.
    pub const READ_MODULE: u8 = 0x46;
    /// Protection limit parameters.
    pub const READ_LIMITS: u8 = 0x47;
    /// Write one basic protection parameter.
    pub const SET_BASIC_PARAM: u8 = 0x48;
    /// Control command, opaque operation byte (secondary).
    pub const CONTROL_SECONDARY: u8 = 0x49;
    /// Diagnostic event counters.
    pub const READ_DIAGNOSTICS: u8 = 0x4B;
    /// Device model and firmware identification text.
    pub const READ_DEVICE_INFO: u8 = 0x51;
    /// RTN code of a successful response.
    pub const RTN_OK: u8 = 0x00;
}

/// Returns true for the six read services.
pub fn is_read_service(id: u8) -> bool {
    matches!(
        id,
        service::READ_ANALOG
            | service::READ_ALARMS
            | service::READ_MODULE
            | service::READ_LIMITS
            | service::READ_DIAGNOSTICS
            | service::READ_DEVICE_INFO
    )
}

/// Returns true for the three write/control services.
pub fn is_write_service(id: u8) -> bool {
    matches!(
        id,
        service::SET_BASIC_PARAM | service::CONTROL_PRIMARY | service::CONTROL_SECONDARY
    )
}

/// Human readable description of an RTN status code.
pub fn rtn_description(code: u8) -> &'static str {
    match code {
        0x00 => "ok",
        0x01 => "version error",
        0x02 => "frame checksum error",
        0x03 => "length checksum error",
        0x04 => "invalid service",
        0x05 => "command format error",
        0x06 => "invalid data",
        0x90 => "address error",
        0x91 => "internal communication error",
        _ => "unknown status",
    }
}

/// 4-bit nibble checksum over the three LENID nibbles.
fn length_checksum(lenid: u16) -> u8 {
    let sum = (lenid & 0xF) + ((lenid >> 4) & 0xF) + ((lenid >> 8) & 0xF);
    ((((!sum) & 0xF) + 1) & 0xF) as u8
}

/// 16-bit two's-complement checksum over the ASCII codes of the frame body
/// (everything between the start marker and the checksum field).
fn frame_checksum(body: &str) -> u16 {
    let sum: u32 = body.bytes().map(u32::from).sum();
    ((((!sum) & 0xFFFF) + 1) & 0xFFFF) as u16
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

fn decode_hex(s: &str) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        return Err(Error::InvalidHex);
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        out.push(u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::InvalidHex)?);
    }
    Ok(out)
}

fn hex_byte(s: &str, idx: usize) -> Result<u8, Error> {
    u8::from_str_radix(&s[idx..idx + 2], 16).map_err(|_| Error::InvalidHex)
}

/// Builds a complete frame string, terminator included.
///
/// Fails only when `payload` would overflow the 12-bit length field; this is
/// checked before anything is assembled.
pub fn build_frame(address: u8, service: u8, payload: &[u8]) -> Result<String, Error> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(Error::OversizedPayload(payload.len()));
    }
    let payload_hex = encode_hex(payload);
    let lenid = payload_hex.len() as u16;
    let length_word = (u16::from(length_checksum(lenid)) << 12) | (lenid & 0x0FFF);
    let body = format!(
        "{VERSION:02X}{address:02X}{PROTOCOL_ID:02X}{service:02X}{length_word:04X}{payload_hex}"
    );
    let crc = frame_checksum(&body);
    Ok(format!("{START_MARKER}{body}{crc:04X}\r"))
}

/// A verified incoming frame.
///
/// For responses the `service` field holds whatever the device put in the
/// CID2 slot, which is the RTN status code; [`decode_frame`] resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub version: u8,
    pub address: u8,
    pub protocol_id: u8,
    pub service: u8,
    pub payload: Vec<u8>,
}

/// Verifies a candidate frame string and parses its structural fields.
///
/// A trailing CR/LF is tolerated, so the output of [`build_frame`] verifies
/// unchanged. Both checksums are recomputed and the declared LENID must match
/// the carried payload exactly; any mismatch yields a typed error, never a
/// partial frame.
pub fn verify_frame(candidate: &str) -> Result<ParsedFrame, Error> {
    let frame = candidate.trim_end_matches(['\r', '\n']);
    if !frame.is_ascii() {
        return Err(Error::InvalidHex);
    }
    if frame.len() < MIN_FRAME_CHARS {
        return Err(Error::ShortFrame(frame.len()));
    }
    if !frame.starts_with(START_MARKER) {
        return Err(Error::MissingStartMarker);
    }

    let body = &frame[1..frame.len() - 4];
    let expected = frame_checksum(body);
    let got = u16::from_str_radix(&frame[frame.len() - 4..], 16).map_err(|_| Error::InvalidHex)?;
    if got != expected {
        return Err(Error::BadFrameChecksum { expected, got });
    }

    let version = hex_byte(frame, 1)?;
    let address = hex_byte(frame, 3)?;
    let protocol_id = hex_byte(frame, 5)?;
    let service = hex_byte(frame, 7)?;

    let length_word =
        u16::from_str_radix(&frame[9..13], 16).map_err(|_| Error::InvalidHex)?;
    let lenid = length_word & 0x0FFF;
    let lcs_got = (length_word >> 12) as u8;
    let lcs_expected = length_checksum(lenid);
    if lcs_got != lcs_expected {
        return Err(Error::BadLengthChecksum {
            expected: lcs_expected,
            got: lcs_got,
        });
    }

    let payload_region = &frame[13..frame.len() - 4];
    if payload_region.len() != lenid as usize {
        return Err(Error::LengthMismatch {
            declared: lenid as usize,
            actual: payload_region.len(),
        });
    }
    let payload = decode_hex(payload_region)?;

    Ok(ParsedFrame {
        version,
        address,
        protocol_id,
        service,
        payload,
    })
}

/// Bounds-checked big-endian reader over a service payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    service: u8,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8], service: u8) -> Self {
        Self {
            buf,
            pos: 0,
            service,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.buf.len() {
            return Err(Error::TruncatedPayload {
                service: self.service,
                needed: self.pos + n,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, Error> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Temperature unit as resolved by the raw-value heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum TemperatureUnit {
    Decikelvin,
    Decicelsius,
}

/// A temperature field, carrying the wire value alongside the resolved unit
/// and Celsius reading.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Temperature {
    pub raw: i16,
    pub unit: TemperatureUnit,
    pub celsius: f32,
}

impl Temperature {
    /// Firmware variants report either decikelvin or decicelsius without
    /// flagging which. A decicelsius value above 1000 would be 100 °C, so
    /// anything larger is taken as decikelvin.
    pub fn from_raw(raw: i16) -> Self {
        if raw > 1000 {
            Self {
                raw,
                unit: TemperatureUnit::Decikelvin,
                celsius: (f32::from(raw) - 2731.0) / 10.0,
            }
        } else {
            Self {
                raw,
                unit: TemperatureUnit::Decicelsius,
                celsius: f32::from(raw) / 10.0,
            }
        }
    }
}

/// Plausible single-cell voltage range in millivolts.
pub const CELL_MILLIVOLT_MIN: u16 = 2000;
pub const CELL_MILLIVOLT_MAX: u16 = 4000;

// Largest vendor header observed ahead of the cell array.
const ALIGNMENT_WINDOW: usize = 12;
// A pack with fewer cells than this never speaks this protocol.
const MIN_PLAUSIBLE_CELLS: usize = 4;
// Temperature counts above this mean the tail was not where the alignment
// put it.
const MAX_TEMPERATURES: usize = 16;

/// Number of consecutive big-endian u16 values at `offset` that fall inside
/// the plausible cell-voltage range.
pub fn cell_run_length(payload: &[u8], offset: usize) -> usize {
    let mut run = 0;
    let mut i = offset;
    while i + 2 <= payload.len() {
        let mv = u16::from_be_bytes([payload[i], payload[i + 1]]);
        if !(CELL_MILLIVOLT_MIN..=CELL_MILLIVOLT_MAX).contains(&mv) {
            break;
        }
        run += 1;
        i += 2;
    }
    run
}

/// Scores every candidate byte offset inside the alignment window and returns
/// `(offset, run_length)` for the best one. Ties go to the smallest offset.
///
/// The analog payload layout shifts between firmware variants; the cell
/// voltage array is located by this search rather than by a fixed offset.
pub fn find_cell_alignment(payload: &[u8]) -> Result<(usize, usize), Error> {
    let mut best_offset = 0;
    let mut best_run = 0;
    for offset in 0..=ALIGNMENT_WINDOW.min(payload.len()) {
        let run = cell_run_length(payload, offset);
        if run > best_run {
            best_run = run;
            best_offset = offset;
        }
    }
    if best_run < MIN_PLAUSIBLE_CELLS {
        return Err(Error::AmbiguousAlignment {
            offset: best_offset,
            best: best_run,
        });
    }
    log::trace!("cell alignment: offset={best_offset} run={best_run}");
    Ok((best_offset, best_run))
}

/// Analog status: per-cell voltages, temperatures, pack current/voltage,
/// capacities and cycle count.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct AnalogStatus {
    /// Cell voltages in volts.
    pub cells: Vec<f32>,
    pub temperatures: Vec<Temperature>,
    /// Pack current in amperes, negative while charging.
    pub current: f32,
    /// Pack voltage in volts.
    pub pack_voltage: f32,
    pub remaining_ah: f32,
    pub full_ah: f32,
    pub cycles: u16,
    /// Byte offset at which the alignment search located the cell array.
    pub alignment_offset: usize,
}

impl AnalogStatus {
    pub fn request(pack: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_ANALOG, &[pack])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let (offset, n_cells) = find_cell_alignment(payload)?;
        let mut cell_sum_mv: u32 = 0;
        let mut cells = Vec::with_capacity(n_cells);
        for i in 0..n_cells {
            let mv = u16::from_be_bytes([payload[offset + 2 * i], payload[offset + 2 * i + 1]]);
            cell_sum_mv += u32::from(mv);
            cells.push(f32::from(mv) / 1000.0);
        }
        let cell_sum = cell_sum_mv as f32 / 1000.0;

        let mut rd = PayloadReader::new(&payload[offset + 2 * n_cells..], service::READ_ANALOG);
        let temp_count = rd.u8()? as usize;
        if temp_count > MAX_TEMPERATURES {
            return Err(Error::TruncatedPayload {
                service: service::READ_ANALOG,
                needed: 1 + temp_count * 2,
                got: payload.len() - offset - 2 * n_cells,
            });
        }
        let mut temperatures = Vec::with_capacity(temp_count);
        for _ in 0..temp_count {
            temperatures.push(Temperature::from_raw(rd.i16()?));
        }
        let current_raw = rd.i16()?;
        let voltage_raw = rd.u16()?;
        let remaining_raw = rd.u16()?;
        let full_raw = rd.u16()?;
        let cycles = rd.u16()?;

        // The wire scale for current and voltage differs between firmware
        // variants: centi-units on most, milli-units on some. The pack
        // voltage must land within one volt of the cell sum; the current
        // follows whichever divisor the voltage selects.
        let v100 = f32::from(voltage_raw) / 100.0;
        let v1000 = f32::from(voltage_raw) / 1000.0;
        let (pack_voltage, current) = if (v100 - cell_sum).abs() <= 1.0 {
            (v100, f32::from(current_raw) / 100.0)
        } else if (v1000 - cell_sum).abs() <= 1.0 {
            log::debug!("pack voltage {voltage_raw} read with fallback divisor 1000");
            (v1000, f32::from(current_raw) / 1000.0)
        } else {
            log::debug!("pack voltage {voltage_raw} implausible, substituting cell sum");
            (cell_sum, f32::from(current_raw) / 100.0)
        };

        Ok(Self {
            cells,
            temperatures,
            current,
            pack_voltage,
            remaining_ah: f32::from(remaining_raw) / 100.0,
            full_ah: f32::from(full_raw) / 100.0,
            cycles,
            alignment_offset: offset,
        })
    }
}

/// Alarm and protection flag status.
///
/// The flag bits themselves are firmware specific and are kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct AlarmStatus {
    pub data_flag: u8,
    pub raw: Vec<u8>,
}

impl AlarmStatus {
    pub fn request(pack: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_ALARMS, &[pack])
    }

    pub fn decode(payload: &[u8], address: u8) -> Result<Self, Error> {
        let mut rd = PayloadReader::new(payload, service::READ_ALARMS);
        let data_flag = rd.u8()?;
        let mut rest = rd.rest();
        // Some firmware inserts an extra byte echoing the pack address, or
        // 0xFF, between the flag and the alarm bytes.
        if let Some(&b) = rest.first() {
            if b == 0xFF || b == address {
                rest = &rest[1..];
            }
        }
        Ok(Self {
            data_flag,
            raw: rest.to_vec(),
        })
    }
}

/// Protection limit parameters, thirteen 16-bit fields in wire order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct ProtectionLimits {
    /// Cell overvoltage alarm threshold in volts (wire: millivolts).
    pub cell_voltage_high: f32,
    pub cell_voltage_low: f32,
    pub cell_voltage_under: f32,
    pub charge_temp_high: Temperature,
    pub charge_temp_low: Temperature,
    /// Charge current limit in amperes (wire: centiamps).
    pub charge_current_limit: f32,
    /// Pack overvoltage alarm threshold in volts (wire: centivolts).
    pub pack_voltage_high: f32,
    pub pack_voltage_low: f32,
    pub pack_voltage_under: f32,
    pub discharge_temp_high: Temperature,
    pub discharge_temp_low: Temperature,
    pub discharge_current_limit: f32,
    pub reserved: u16,
}

impl ProtectionLimits {
    pub fn request(pack: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_LIMITS, &[pack])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut rd = PayloadReader::new(payload, service::READ_LIMITS);
        Ok(Self {
            cell_voltage_high: f32::from(rd.u16()?) / 1000.0,
            cell_voltage_low: f32::from(rd.u16()?) / 1000.0,
            cell_voltage_under: f32::from(rd.u16()?) / 1000.0,
            charge_temp_high: Temperature::from_raw(rd.i16()?),
            charge_temp_low: Temperature::from_raw(rd.i16()?),
            charge_current_limit: f32::from(rd.u16()?) / 100.0,
            pack_voltage_high: f32::from(rd.u16()?) / 100.0,
            pack_voltage_low: f32::from(rd.u16()?) / 100.0,
            pack_voltage_under: f32::from(rd.u16()?) / 100.0,
            discharge_temp_high: Temperature::from_raw(rd.i16()?),
            discharge_temp_low: Temperature::from_raw(rd.i16()?),
            discharge_current_limit: f32::from(rd.u16()?) / 100.0,
            reserved: rd.u16()?,
        })
    }
}

/// Device model and firmware identification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    pub text: String,
}

impl DeviceInfo {
    pub fn request(pack: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_DEVICE_INFO, &[pack])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            text: printable_text(payload),
        })
    }
}

fn printable_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Diagnostic event counters.
///
/// The response echoes the requested service and operation in its first two
/// bytes, followed by eight 16-bit counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct DiagnosticCounters {
    pub echo_service: u8,
    pub echo_op: u8,
    pub power_cycles: u16,
    pub full_charge_events: u16,
    pub overvoltage_alarms: u16,
    pub undervoltage_alarms: u16,
    pub overcurrent_alarms: u16,
    pub high_temperature_alarms: u16,
    pub low_temperature_alarms: u16,
    pub mosfet_fault_events: u16,
}

impl DiagnosticCounters {
    pub const DEFAULT_OP: u8 = 0x00;

    pub fn request(pack: u8, op: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_DIAGNOSTICS, &[pack, op])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut rd = PayloadReader::new(payload, service::READ_DIAGNOSTICS);
        Ok(Self {
            echo_service: rd.u8()?,
            echo_op: rd.u8()?,
            power_cycles: rd.u16()?,
            full_charge_events: rd.u16()?,
            overvoltage_alarms: rd.u16()?,
            undervoltage_alarms: rd.u16()?,
            overcurrent_alarms: rd.u16()?,
            high_temperature_alarms: rd.u16()?,
            low_temperature_alarms: rd.u16()?,
            mosfet_fault_events: rd.u16()?,
        })
    }
}

/// Module id selecting the ASCII info block of a module read.
pub const MODULE_ASCII_INFO: u8 = 0x01;
/// Module id selecting the capacity/energy block of a module read.
pub const MODULE_CAPACITY: u8 = 0x02;

const MODULE_HEADER_LEN: usize = 4;
const MODULE_ID_OFFSET: usize = 1;

/// Module ASCII info block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct ModuleInfo {
    pub text: String,
}

impl ModuleInfo {
    pub fn request(pack: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_MODULE, &[pack, MODULE_ASCII_INFO])
    }
}

/// Module capacity/energy block, seven 16-bit fields.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct ModuleCapacity {
    pub remaining_ah: f32,
    pub full_ah: f32,
    pub design_ah: f32,
    pub remaining_kwh: f32,
    pub full_kwh: f32,
    pub soc_percent: f32,
    pub soh_percent: f32,
}

impl ModuleCapacity {
    pub fn request(pack: u8) -> Result<String, Error> {
        build_frame(pack, service::READ_MODULE, &[pack, MODULE_CAPACITY])
    }
}

/// Sub-dispatches a module-read payload on the module id inside its header.
pub fn decode_module(payload: &[u8]) -> Result<DecodedRecord, Error> {
    if payload.len() < MODULE_HEADER_LEN {
        return Err(Error::TruncatedPayload {
            service: service::READ_MODULE,
            needed: MODULE_HEADER_LEN,
            got: payload.len(),
        });
    }
    let module = payload[MODULE_ID_OFFSET];
    let body = &payload[MODULE_HEADER_LEN..];
    match module {
        MODULE_ASCII_INFO => Ok(DecodedRecord::ModuleInfo(ModuleInfo {
            text: printable_text(body),
        })),
        MODULE_CAPACITY => {
            let mut rd = PayloadReader::new(body, service::READ_MODULE);
            Ok(DecodedRecord::ModuleCapacity(ModuleCapacity {
                remaining_ah: f32::from(rd.u16()?) / 100.0,
                full_ah: f32::from(rd.u16()?) / 100.0,
                design_ah: f32::from(rd.u16()?) / 100.0,
                remaining_kwh: f32::from(rd.u16()?) / 100.0,
                full_kwh: f32::from(rd.u16()?) / 100.0,
                soc_percent: f32::from(rd.u16()?) / 10.0,
                soh_percent: f32::from(rd.u16()?) / 10.0,
            }))
        }
        other => {
            log::warn!("unsupported module id 0x{other:02X}");
            Err(Error::UnknownService(other))
        }
    }
}

/// Generic acknowledgement for the write/control services.
///
/// Their payload layout is not established, so the bytes are kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct WriteAck {
    pub service: u8,
    pub raw: Vec<u8>,
}

/// Writable basic protection parameters.
///
/// Values are sent pre-scaled in the wire unit noted per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum BasicParam {
    /// Cell overvoltage threshold, millivolts.
    CellVoltageHigh,
    /// Cell undervoltage threshold, millivolts.
    CellVoltageLow,
    /// Charge current limit, centiamps.
    ChargeCurrentLimit,
    /// Pack overvoltage threshold, centivolts.
    PackVoltageHigh,
    /// Pack undervoltage threshold, centivolts.
    PackVoltageLow,
}

impl BasicParam {
    pub fn command_type(self) -> u8 {
        match self {
            BasicParam::CellVoltageHigh => 0x01,
            BasicParam::CellVoltageLow => 0x02,
            BasicParam::ChargeCurrentLimit => 0x03,
            BasicParam::PackVoltageHigh => 0x04,
            BasicParam::PackVoltageLow => 0x05,
        }
    }
}

pub struct SetBasicParam;

impl SetBasicParam {
    pub fn payload(pack: u8, param: BasicParam, value: u16) -> Vec<u8> {
        let value = value.to_be_bytes();
        vec![pack, param.command_type(), value[0], value[1]]
    }

    pub fn request(pack: u8, param: BasicParam, value: u16) -> Result<String, Error> {
        build_frame(pack, service::SET_BASIC_PARAM, &Self::payload(pack, param, value))
    }
}

/// An opaque control command.
///
/// The operation bytes are bus specific and supplied by configuration; this
/// crate sends them verbatim and does not interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct ControlCommand {
    pub service: u8,
    pub info: Vec<u8>,
}

impl ControlCommand {
    pub fn new(service: u8, info: Vec<u8>) -> Self {
        Self { service, info }
    }

    pub fn request(&self, address: u8) -> Result<String, Error> {
        build_frame(address, self.service, &self.info)
    }
}

/// One decoded record per service.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum DecodedRecord {
    Analog(AnalogStatus),
    Alarms(AlarmStatus),
    Limits(ProtectionLimits),
    DeviceInfo(DeviceInfo),
    Diagnostics(DiagnosticCounters),
    ModuleInfo(ModuleInfo),
    ModuleCapacity(ModuleCapacity),
    Ack(WriteAck),
}

fn decode_read(service_id: u8, frame: &ParsedFrame) -> Result<DecodedRecord, Error> {
    match service_id {
        service::READ_ANALOG => AnalogStatus::decode(&frame.payload).map(DecodedRecord::Analog),
        service::READ_ALARMS => {
            AlarmStatus::decode(&frame.payload, frame.address).map(DecodedRecord::Alarms)
        }
        service::READ_MODULE => decode_module(&frame.payload),
        service::READ_LIMITS => {
            ProtectionLimits::decode(&frame.payload).map(DecodedRecord::Limits)
        }
        service::READ_DIAGNOSTICS => {
            DiagnosticCounters::decode(&frame.payload).map(DecodedRecord::Diagnostics)
        }
        service::READ_DEVICE_INFO => {
            DeviceInfo::decode(&frame.payload).map(DecodedRecord::DeviceInfo)
        }
        other => Err(Error::UnknownService(other)),
    }
}

/// Decodes a verified frame into exactly one record or one typed error.
///
/// Frames carrying a known service id decode directly. A frame with RTN `00`
/// in the CID2 slot is a successful response and needs `hint`, the service of
/// the last request sent to that address; any other CID2 value is a failure
/// code when the frame correlates to a request, or an unknown service when it
/// does not.
pub fn decode_frame(frame: &ParsedFrame, hint: Option<u8>) -> Result<DecodedRecord, Error> {
    let service_id = frame.service;
    if is_read_service(service_id) {
        return decode_read(service_id, frame);
    }
    if is_write_service(service_id) {
        return Ok(DecodedRecord::Ack(WriteAck {
            service: service_id,
            raw: frame.payload.clone(),
        }));
    }
    if service_id == service::RTN_OK {
        let resolved = hint.ok_or(Error::UnknownService(service_id))?;
        if is_write_service(resolved) {
            return Ok(DecodedRecord::Ack(WriteAck {
                service: resolved,
                raw: frame.payload.clone(),
            }));
        }
        return decode_read(resolved, frame);
    }
    if hint.is_some() {
        log::warn!(
            "device 0x{:02X} returned status 0x{service_id:02X} ({})",
            frame.address,
            rtn_description(service_id)
        );
        Err(Error::ResponseNotOk { code: service_id })
    } else {
        Err(Error::UnknownService(service_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR: &str = "~22014A45C004010FFCAF";

    fn be16(v: u16) -> [u8; 2] {
        v.to_be_bytes()
    }

    /// Payload with `n` cells at `mv` behind `header` junk, followed by a
    /// regular tail block.
    fn analog_payload(header: &[u8], n: usize, mv: u16, voltage_raw: u16) -> Vec<u8> {
        let mut p = header.to_vec();
        for _ in 0..n {
            p.extend_from_slice(&be16(mv));
        }
        p.push(2); // two temperature sensors
        p.extend_from_slice(&be16(2931)); // decikelvin
        p.extend_from_slice(&be16(200)); // decicelsius
        p.extend_from_slice(&be16(0xFF06u16)); // current -250
        p.extend_from_slice(&be16(voltage_raw));
        p.extend_from_slice(&be16(5000)); // remaining 50.00 Ah
        p.extend_from_slice(&be16(10000)); // full 100.00 Ah
        p.extend_from_slice(&be16(12)); // cycles
        p
    }

    #[test]
    fn length_checksum_nibbles() {
        assert_eq!(length_checksum(0x004), 0xC);
        assert_eq!(length_checksum(0x000), 0x0);
        assert_eq!(length_checksum(0x01A), 0x5);
    }

    #[test]
    fn build_reproduces_documented_capture() {
        let frame = build_frame(0x01, 0x45, &[0x01, 0x0F]).unwrap();
        assert_eq!(frame, format!("{VECTOR}\r"));
    }

    #[test]
    fn verify_documented_capture() {
        let frame = verify_frame(VECTOR).unwrap();
        assert_eq!(frame.version, 0x22);
        assert_eq!(frame.address, 0x01);
        assert_eq!(frame.protocol_id, 0x4A);
        assert_eq!(frame.service, 0x45);
        assert_eq!(frame.payload, vec![0x01, 0x0F]);
    }

    #[test]
    fn round_trip() {
        for payload in [
            vec![],
            vec![0x01],
            vec![0x01, 0x02, 0x03, 0x04],
            (0..=255u8).collect::<Vec<_>>(),
        ] {
            let frame = build_frame(0x7F, 0x42, &payload).unwrap();
            let parsed = verify_frame(&frame).unwrap();
            assert_eq!(parsed.address, 0x7F);
            assert_eq!(parsed.service, 0x42);
            assert_eq!(parsed.payload, payload);
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            build_frame(0x01, 0x42, &payload),
            Err(Error::OversizedPayload(_))
        ));
        assert!(build_frame(0x01, 0x42, &vec![0u8; MAX_PAYLOAD_BYTES]).is_ok());
    }

    #[test]
    fn single_character_corruption_detected() {
        let frame = build_frame(0x01, 0x42, &[0xAA, 0xBB, 0xCC]).unwrap();
        let trimmed = frame.trim_end();
        for i in 1..trimmed.len() {
            let mut corrupted: Vec<char> = trimmed.chars().collect();
            corrupted[i] = if corrupted[i] == '0' { '1' } else { '0' };
            let corrupted: String = corrupted.into_iter().collect();
            let err = verify_frame(&corrupted).unwrap_err();
            assert!(
                matches!(
                    err,
                    Error::BadFrameChecksum { .. }
                        | Error::BadLengthChecksum { .. }
                        | Error::InvalidHex
                ),
                "flip at {i} gave {err:?}"
            );
        }
    }

    #[test]
    fn corrupted_start_marker() {
        let frame = build_frame(0x01, 0x42, &[0xAA]).unwrap();
        let corrupted = frame.replacen('~', "!", 1);
        assert_eq!(
            verify_frame(&corrupted).unwrap_err(),
            Error::MissingStartMarker
        );
    }

    #[test]
    fn bad_length_checksum_detected() {
        // Correct frame checksum over a body whose LCS nibble is wrong.
        let body = "22014A420004"; // empty payload, LCS should be 0 but claim 0 -> tweak below
        let mut bad = body.to_string();
        bad.replace_range(8..9, "5"); // claim LCS 5
        let crc = frame_checksum(&bad);
        let frame = format!("~{bad}{crc:04X}");
        assert!(matches!(
            verify_frame(&frame).unwrap_err(),
            Error::BadLengthChecksum { got: 5, .. }
        ));
    }

    #[test]
    fn declared_length_mismatch_detected() {
        // LENID 4 with a matching LCS but only 2 payload characters.
        let lenid = 4u16;
        let word = (u16::from(length_checksum(lenid)) << 12) | lenid;
        let body = format!("22014A42{word:04X}AB");
        let crc = frame_checksum(&body);
        let frame = format!("~{body}{crc:04X}");
        assert_eq!(
            verify_frame(&frame).unwrap_err(),
            Error::LengthMismatch {
                declared: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn short_candidate_rejected() {
        assert!(matches!(
            verify_frame("~22014A45"),
            Err(Error::ShortFrame(_))
        ));
    }

    #[test]
    fn temperature_unit_heuristic() {
        let dk = Temperature::from_raw(2931);
        assert_eq!(dk.unit, TemperatureUnit::Decikelvin);
        assert!((dk.celsius - 20.0).abs() < 0.01);

        let dc = Temperature::from_raw(200);
        assert_eq!(dc.unit, TemperatureUnit::Decicelsius);
        assert!((dc.celsius - 20.0).abs() < 0.01);
    }

    #[test]
    fn alignment_skips_vendor_header() {
        // Five header bytes that never form four in-range words, cells at
        // offset 5.
        let payload = analog_payload(&[0x00, 0x10, 0x01, 0x00, 0x08], 8, 3300, 2645);
        let status = AnalogStatus::decode(&payload).unwrap();
        assert_eq!(status.alignment_offset, 5);
        assert_eq!(status.cells.len(), 8);
        assert!((status.cells[0] - 3.3).abs() < 0.001);
        assert!((status.pack_voltage - 26.45).abs() < 0.001);
        assert!((status.current + 2.5).abs() < 0.001);
        assert_eq!(status.temperatures.len(), 2);
        assert_eq!(status.temperatures[0].unit, TemperatureUnit::Decikelvin);
        assert_eq!(status.temperatures[1].unit, TemperatureUnit::Decicelsius);
        assert!((status.remaining_ah - 50.0).abs() < 0.001);
        assert!((status.full_ah - 100.0).abs() < 0.001);
        assert_eq!(status.cycles, 12);
    }

    #[test]
    fn alignment_prefers_zero_offset_on_clean_layout() {
        let payload = analog_payload(&[], 4, 3250, 1300);
        let status = AnalogStatus::decode(&payload).unwrap();
        assert_eq!(status.alignment_offset, 0);
        assert_eq!(status.cells.len(), 4);
    }

    #[test]
    fn alignment_rejects_implausible_payload() {
        let err = AnalogStatus::decode(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, Error::AmbiguousAlignment { best: 0, .. }));
    }

    #[test]
    fn voltage_divisor_fallback() {
        // 4 cells of 3.3 V; 13200 only matches the sum at divisor 1000.
        let payload = analog_payload(&[], 4, 3300, 13200);
        let status = AnalogStatus::decode(&payload).unwrap();
        assert!((status.pack_voltage - 13.2).abs() < 0.001);
        assert!((status.current + 0.25).abs() < 0.001);
    }

    #[test]
    fn voltage_substitutes_cell_sum() {
        let payload = analog_payload(&[], 4, 3300, 60000);
        let status = AnalogStatus::decode(&payload).unwrap();
        assert!((status.pack_voltage - 13.2).abs() < 0.001);
        assert!((status.current + 2.5).abs() < 0.001);
    }

    #[test]
    fn decode_is_idempotent() {
        let payload = analog_payload(&[0x00, 0x10], 6, 3400, 2040);
        let a = AnalogStatus::decode(&payload).unwrap();
        let b = AnalogStatus::decode(&payload).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn alarm_artifact_byte_skipped() {
        let with_ff = AlarmStatus::decode(&[0x01, 0xFF, 0xAA, 0xBB], 0x01).unwrap();
        assert_eq!(with_ff.data_flag, 0x01);
        assert_eq!(with_ff.raw, vec![0xAA, 0xBB]);

        let with_addr = AlarmStatus::decode(&[0x01, 0x02, 0xAA, 0xBB], 0x02).unwrap();
        assert_eq!(with_addr.raw, vec![0xAA, 0xBB]);

        let plain = AlarmStatus::decode(&[0x01, 0xAA, 0xBB], 0x02).unwrap();
        assert_eq!(plain.raw, vec![0xAA, 0xBB]);
    }

    #[test]
    fn limits_field_order() {
        let mut payload = Vec::new();
        for v in [
            3650u16, 2800, 2500, // cell thresholds, mV
            550, 50, // charge temps, decicelsius
            10000, // charge current, cA
            5840, 4480, 4000, // pack thresholds, cV
            600, 0xFF38, // discharge temps (0xFF38 = -200 raw)
            15000, // discharge current
            0x1234, // reserved
        ] {
            payload.extend_from_slice(&be16(v));
        }
        let limits = ProtectionLimits::decode(&payload).unwrap();
        assert!((limits.cell_voltage_high - 3.65).abs() < 0.001);
        assert!((limits.cell_voltage_under - 2.5).abs() < 0.001);
        assert!((limits.charge_temp_high.celsius - 55.0).abs() < 0.01);
        assert!((limits.charge_current_limit - 100.0).abs() < 0.001);
        assert!((limits.pack_voltage_high - 58.4).abs() < 0.001);
        assert!((limits.discharge_temp_low.celsius + 20.0).abs() < 0.01);
        assert!((limits.discharge_current_limit - 150.0).abs() < 0.001);
        assert_eq!(limits.reserved, 0x1234);

        let short = ProtectionLimits::decode(&payload[..20]);
        assert!(matches!(short, Err(Error::TruncatedPayload { .. })));
    }

    #[test]
    fn device_info_text() {
        let info = DeviceInfo::decode(b"PACE-16S\x00\x00 v2.3\x00").unwrap();
        assert_eq!(info.text, "PACE-16S v2.3");
    }

    #[test]
    fn diagnostic_counters_echo_and_order() {
        let mut payload = vec![service::READ_DIAGNOSTICS, 0x00];
        for v in 1..=8u16 {
            payload.extend_from_slice(&be16(v));
        }
        let diag = DiagnosticCounters::decode(&payload).unwrap();
        assert_eq!(diag.echo_service, service::READ_DIAGNOSTICS);
        assert_eq!(diag.power_cycles, 1);
        assert_eq!(diag.mosfet_fault_events, 8);
    }

    #[test]
    fn module_sub_dispatch() {
        let mut info = vec![service::READ_MODULE, MODULE_ASCII_INFO, 0x00, 0x00];
        info.extend_from_slice(b"PACK-A");
        match decode_module(&info).unwrap() {
            DecodedRecord::ModuleInfo(m) => assert_eq!(m.text, "PACK-A"),
            other => panic!("unexpected record {other:?}"),
        }

        let mut cap = vec![service::READ_MODULE, MODULE_CAPACITY, 0x00, 0x00];
        for v in [5000u16, 10000, 10000, 2560, 5120, 500, 980] {
            cap.extend_from_slice(&be16(v));
        }
        match decode_module(&cap).unwrap() {
            DecodedRecord::ModuleCapacity(m) => {
                assert!((m.remaining_ah - 50.0).abs() < 0.001);
                assert!((m.full_kwh - 51.2).abs() < 0.001);
                assert!((m.soc_percent - 50.0).abs() < 0.001);
                assert!((m.soh_percent - 98.0).abs() < 0.001);
            }
            other => panic!("unexpected record {other:?}"),
        }

        let unknown = vec![service::READ_MODULE, 0x7E, 0x00, 0x00];
        assert!(matches!(
            decode_module(&unknown),
            Err(Error::UnknownService(0x7E))
        ));
    }

    #[test]
    fn write_services_decode_as_generic_ack() {
        for svc in [
            service::CONTROL_PRIMARY,
            service::SET_BASIC_PARAM,
            service::CONTROL_SECONDARY,
        ] {
            let frame = verify_frame(&build_frame(0x01, svc, &[0x01, 0x0F]).unwrap()).unwrap();
            match decode_frame(&frame, None).unwrap() {
                DecodedRecord::Ack(ack) => {
                    assert_eq!(ack.service, svc);
                    assert_eq!(ack.raw, vec![0x01, 0x0F]);
                }
                other => panic!("unexpected record {other:?}"),
            }
        }
    }

    #[test]
    fn documented_capture_decodes_as_ack() {
        let frame = verify_frame(VECTOR).unwrap();
        match decode_frame(&frame, None).unwrap() {
            DecodedRecord::Ack(ack) => assert_eq!(ack.service, 0x45),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn ok_response_resolved_through_hint() {
        let payload = analog_payload(&[], 4, 3300, 1320);
        let frame =
            verify_frame(&build_frame(0x01, service::RTN_OK, &payload).unwrap()).unwrap();

        match decode_frame(&frame, Some(service::READ_ANALOG)).unwrap() {
            DecodedRecord::Analog(status) => assert_eq!(status.cells.len(), 4),
            other => panic!("unexpected record {other:?}"),
        }

        // A write hint turns the same OK response into an acknowledgement.
        match decode_frame(&frame, Some(service::SET_BASIC_PARAM)).unwrap() {
            DecodedRecord::Ack(ack) => assert_eq!(ack.service, service::SET_BASIC_PARAM),
            other => panic!("unexpected record {other:?}"),
        }

        assert_eq!(
            decode_frame(&frame, None).unwrap_err(),
            Error::UnknownService(service::RTN_OK)
        );
    }

    #[test]
    fn nonzero_rtn_surfaced_with_code() {
        let frame = verify_frame(&build_frame(0x01, 0x02, &[]).unwrap()).unwrap();
        assert_eq!(
            decode_frame(&frame, Some(service::READ_ANALOG)).unwrap_err(),
            Error::ResponseNotOk { code: 0x02 }
        );
        // Without a correlated request the same frame is just unknown.
        assert_eq!(
            decode_frame(&frame, None).unwrap_err(),
            Error::UnknownService(0x02)
        );
    }

    #[test]
    fn basic_param_payload_layout() {
        let payload = SetBasicParam::payload(0x01, BasicParam::CellVoltageHigh, 3650);
        assert_eq!(payload, vec![0x01, 0x01, 0x0E, 0x42]);

        let frame = SetBasicParam::request(0x01, BasicParam::PackVoltageLow, 4480).unwrap();
        let parsed = verify_frame(&frame).unwrap();
        assert_eq!(parsed.service, service::SET_BASIC_PARAM);
        assert_eq!(parsed.payload, vec![0x01, 0x05, 0x11, 0x80]);
    }

    #[test]
    fn control_command_sends_opaque_bytes() {
        let cmd = ControlCommand::new(service::CONTROL_PRIMARY, vec![0x01, 0x0F]);
        let frame = cmd.request(0x01).unwrap();
        assert_eq!(frame, format!("{VECTOR}\r"));
    }
}
