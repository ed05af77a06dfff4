//! Command codec: ELM327 request text, response cleaning, ISO-TP
//! reassembly of headed CAN lines, and PID value decoders.

use std::collections::HashMap;

use rl_protocol::ParameterRequest;

use crate::error::{ObdError, ObdResult};
use crate::types::*;

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

/// One adapter round trip: up to six PIDs sharing a mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub mode: u8,
    pub requests: Vec<ParameterRequest>,
}

impl Batch {
    /// Wire text, e.g. `010D0C1104` for speed, RPM, throttle, load.
    pub fn command(&self) -> String {
        let mut cmd = format!("{:02X}", self.mode);
        for request in &self.requests {
            cmd.push_str(&format!("{:02X}", request.pid));
        }
        cmd
    }
}

/// Wire text for a single request, e.g. `010C`.
pub fn encode_request(request: ParameterRequest) -> String {
    request.to_string()
}

/// Group requests by mode (first-seen order) into adapter-sized batches.
pub fn batch_requests(requests: &[ParameterRequest]) -> Vec<Batch> {
    let mut by_mode: Vec<(u8, Vec<ParameterRequest>)> = Vec::new();
    for request in requests {
        match by_mode.iter_mut().find(|(mode, _)| *mode == request.mode) {
            Some((_, group)) if !group.contains(request) => group.push(*request),
            Some(_) => {}
            None => by_mode.push((request.mode, vec![*request])),
        }
    }

    by_mode
        .into_iter()
        .flat_map(|(mode, group)| {
            group
                .chunks(MAX_PIDS_PER_REQUEST)
                .map(|chunk| Batch {
                    mode,
                    requests: chunk.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Response cleaning
// ---------------------------------------------------------------------------

fn compact(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Meaningful lines of an adapter response: echo, prompt, and search
/// banners removed.
pub fn response_lines(command: &str, text: &str) -> Vec<String> {
    let echo = compact(command);
    text.split(['\r', '\n'])
        .map(|line| line.trim().trim_end_matches('>').trim())
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let upper = line.to_ascii_uppercase();
            upper != "SEARCHING..." && !(upper.starts_with("BUS INIT") && upper.ends_with("OK"))
        })
        .filter(|line| compact(line) != echo)
        .map(str::to_string)
        .collect()
}

/// Map an adapter status word to an error, if the line is one.
pub fn adapter_error(command: &str, line: &str) -> Option<ObdError> {
    let upper = line.trim().to_ascii_uppercase();
    let failed = |cause: &str| ObdError::CommandFailed {
        command: command.to_string(),
        cause: cause.to_string(),
    };
    match upper.as_str() {
        "NO DATA" => Some(ObdError::NoData(command.to_string())),
        "?" => Some(failed("unknown command")),
        "UNABLE TO CONNECT" => Some(ObdError::VehicleNotResponding),
        "STOPPED" => Some(failed("stopped")),
        "BUFFER FULL" => Some(failed("adapter buffer full")),
        "CAN ERROR" => Some(failed("CAN error")),
        _ if upper.starts_with("BUS INIT") && upper.contains("ERROR") => {
            Some(ObdError::VehicleNotResponding)
        }
        _ if upper.contains("BUS ERROR")
            || upper.contains("BUS BUSY")
            || upper.contains("FB ERROR")
            || upper.contains("DATA ERROR")
            || upper.contains("RX ERROR") =>
        {
            Some(failed(&upper))
        }
        _ => None,
    }
}

/// Split lines into data lines, failing only if no data line remains.
fn data_lines(command: &str, text: &str) -> ObdResult<Vec<String>> {
    let mut first_error = None;
    let mut data = Vec::new();
    for line in response_lines(command, text) {
        match adapter_error(command, &line) {
            Some(err) => {
                first_error.get_or_insert(err);
            }
            None => data.push(line),
        }
    }
    if data.is_empty() {
        return Err(first_error.unwrap_or_else(|| ObdError::NoData(command.to_string())));
    }
    Ok(data)
}

fn hex_bytes(hex: &str) -> ObdResult<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ObdError::Decode(format!("not a hex frame: {hex:?}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| ObdError::Decode(format!("bad hex byte in {hex:?}: {e}")))
        })
        .collect()
}

/// Parse a headers-off response into byte frames.
///
/// Single-frame lines become one frame each. CAN multi-frame responses
/// (`014` byte-count line followed by `0:`/`1:`… lines) are joined and
/// truncated to the announced length.
pub fn parse_response(command: &str, text: &str) -> ObdResult<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    let mut multi: Option<(usize, Vec<u8>)> = None;

    let flush = |multi: &mut Option<(usize, Vec<u8>)>, frames: &mut Vec<Vec<u8>>| {
        if let Some((len, mut buf)) = multi.take() {
            buf.truncate(len);
            frames.push(buf);
        }
    };

    for line in data_lines(command, text)? {
        let line = compact(&line);
        if line.len() == 3 && line.bytes().all(|b| b.is_ascii_hexdigit()) {
            flush(&mut multi, &mut frames);
            let len = usize::from_str_radix(&line, 16)
                .map_err(|e| ObdError::Decode(format!("bad byte count {line:?}: {e}")))?;
            multi = Some((len, Vec::new()));
            continue;
        }
        if let Some((_, rest)) = line.split_once(':') {
            let payload = hex_bytes(rest)?;
            match multi.as_mut() {
                Some((_, buf)) => buf.extend_from_slice(&payload),
                None => frames.push(payload),
            }
            continue;
        }
        flush(&mut multi, &mut frames);
        frames.push(hex_bytes(&line)?);
    }
    flush(&mut multi, &mut frames);

    Ok(frames)
}

// ---------------------------------------------------------------------------
// Headed CAN responses (ATH1) with ISO-TP reassembly
// ---------------------------------------------------------------------------

/// ISO-TP frame type nibbles (upper nibble of the PCI byte).
const ISOTP_SF: u8 = 0x0;
const ISOTP_FF: u8 = 0x1;
const ISOTP_CF: u8 = 0x2;

/// Width of the CAN identifier that leads each headed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanAddressing {
    /// 11-bit IDs, three hex digits (`7E8`).
    Standard,
    /// 29-bit IDs, eight hex digits (`18DAF110`).
    Extended,
}

impl CanAddressing {
    fn id_digits(self) -> usize {
        match self {
            CanAddressing::Standard => 3,
            CanAddressing::Extended => 8,
        }
    }

    /// From an `ATDPN` reply such as `A6` or `7`.
    ///
    /// `None` for J1850, ISO 9141-2 and KWP2000 (no ISO-TP framing), for
    /// J1939, and for anything the adapter could not settle on.
    pub fn from_protocol_number(reply: &str) -> Option<Self> {
        let reply = reply.trim().to_ascii_uppercase();
        // A leading `A` marks a protocol found by automatic search.
        let number = match reply.len() {
            2 => reply.strip_prefix('A')?,
            _ => reply.as_str(),
        };
        match number {
            "6" | "8" | "B" | "C" => Some(CanAddressing::Standard),
            "7" | "9" => Some(CanAddressing::Extended),
            _ => None,
        }
    }
}

/// A complete response payload from one ECU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuFrame {
    /// CAN response ID (`0x7E8`..`0x7EF`, or `0x18DAF1xx` for 29-bit).
    pub id: u32,
    pub payload: Vec<u8>,
}

struct Partial {
    total_len: usize,
    payload: Vec<u8>,
    expected_seq: u8,
}

/// Parse CAN lines with headers on (`7E8 06 43 02 03 00 01 71`) into
/// per-ECU payloads, reassembling First/Consecutive frames.
pub fn parse_headed_response(
    command: &str,
    text: &str,
    addressing: CanAddressing,
) -> ObdResult<Vec<EcuFrame>> {
    let mut complete = Vec::new();
    let mut partial: HashMap<u32, Partial> = HashMap::new();
    let digits = addressing.id_digits();

    for line in data_lines(command, text)? {
        let line = compact(&line);
        if !line.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ObdError::Decode(format!("not a hex frame: {line:?}")));
        }
        if line.len() < digits + 2 {
            return Err(ObdError::Decode(format!("headed line too short: {line:?}")));
        }
        let id = u32::from_str_radix(&line[..digits], 16)
            .map_err(|e| ObdError::Decode(format!("bad CAN ID in {line:?}: {e}")))?;
        let bytes = hex_bytes(&line[digits..])?;
        let pci = bytes[0];

        match (pci >> 4) & 0x0F {
            ISOTP_SF => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len + 1 > bytes.len() {
                    return Err(ObdError::Decode(format!("invalid SF length in {line:?}")));
                }
                complete.push(EcuFrame {
                    id,
                    payload: bytes[1..1 + len].to_vec(),
                });
            }
            ISOTP_FF => {
                if bytes.len() < 2 {
                    return Err(ObdError::Decode(format!("truncated FF in {line:?}")));
                }
                let total_len = (((pci & 0x0F) as usize) << 8) | bytes[1] as usize;
                partial.insert(
                    id,
                    Partial {
                        total_len,
                        payload: bytes[2..].to_vec(),
                        expected_seq: 1,
                    },
                );
            }
            ISOTP_CF => {
                let Some(entry) = partial.get_mut(&id) else {
                    return Err(ObdError::Decode(format!(
                        "consecutive frame from 0x{id:03X} without first frame"
                    )));
                };
                let seq = pci & 0x0F;
                if seq != (entry.expected_seq & 0x0F) {
                    return Err(ObdError::Decode(format!(
                        "sequence mismatch from 0x{id:03X}: expected {}, got {seq}",
                        entry.expected_seq & 0x0F
                    )));
                }
                entry.payload.extend_from_slice(&bytes[1..]);
                entry.expected_seq = entry.expected_seq.wrapping_add(1);

                if entry.payload.len() >= entry.total_len {
                    if let Some(mut done) = partial.remove(&id) {
                        done.payload.truncate(done.total_len);
                        complete.push(EcuFrame {
                            id,
                            payload: done.payload,
                        });
                    }
                }
            }
            other => {
                return Err(ObdError::Decode(format!(
                    "unexpected frame type 0x{other:X} from 0x{id:03X}"
                )));
            }
        }
    }

    if let Some(id) = partial.keys().next() {
        return Err(ObdError::Decode(format!(
            "incomplete multi-frame response from 0x{id:03X}"
        )));
    }

    Ok(complete)
}

/// Whether `id` is an OBD-II response to the diagnostic tester.
pub fn is_obd_response_id(id: u32) -> bool {
    (OBD_RESPONSE_ID_MIN..=OBD_RESPONSE_ID_MAX).contains(&id)
        || id & 0xFFFF_FF00 == OBD_EXTENDED_RESPONSE_PREFIX
}

/// Display name for an OBD-II CAN response ID.
pub fn ecu_name(id: u32) -> String {
    match id {
        0x7E8 | 0x18DA_F110 => "Engine".to_string(),
        0x7E9 | 0x18DA_F118 => "Transmission".to_string(),
        _ if id > 0x7FF => format!("ECU {:02X}", id & 0xFF),
        _ => format!("ECU {id:03X}"),
    }
}

// ---------------------------------------------------------------------------
// Mode 01 payloads
// ---------------------------------------------------------------------------

/// Number of data bytes a Mode 01 PID returns, if known.
pub fn pid_data_length(pid: u8) -> Option<usize> {
    let len = match pid {
        0x00 | 0x20 | 0x40 | 0x60 | 0x80 | 0xA0 | 0xC0 => 4,
        0x01 | 0x41 | 0x4F | 0x50 => 4,
        0x02 | 0x03 => 2,
        0x04..=0x0B => 1,
        0x0C => 2,
        0x0D..=0x0F => 1,
        0x10 => 2,
        0x11..=0x13 => 1,
        0x14..=0x1B => 2,
        0x1C..=0x1E => 1,
        0x1F => 2,
        0x21..=0x23 => 2,
        0x24..=0x2B => 4,
        0x2C..=0x30 => 1,
        0x31 | 0x32 => 2,
        0x33 => 1,
        0x34..=0x3B => 4,
        0x3C..=0x3F => 2,
        0x42..=0x44 => 2,
        0x45..=0x4C => 1,
        0x4D | 0x4E => 2,
        0x51 | 0x52 => 1,
        0x53..=0x59 => 2,
        0x5A..=0x5C => 1,
        0x5D | 0x5E => 2,
        0x5F => 1,
        _ => return None,
    };
    Some(len)
}

/// Walk Mode 01 frames (`41 pid data pid data …`) into per-request payloads.
///
/// Every requested parameter gets an entry. Missing PIDs are `NoData`,
/// truncated ones `Decode`; neither affects the other entries.
pub fn split_parameters(
    frames: &[Vec<u8>],
    requests: &[ParameterRequest],
) -> HashMap<ParameterRequest, ObdResult<Vec<u8>>> {
    let mut found: HashMap<u8, ObdResult<Vec<u8>>> = HashMap::new();
    let expected_sid = MODE_CURRENT_DATA + RESPONSE_SID_OFFSET;

    for frame in frames {
        let Some((&sid, mut rest)) = frame.split_first() else {
            continue;
        };
        if sid != expected_sid {
            continue;
        }
        while let Some((&pid, tail)) = rest.split_first() {
            let Some(len) = pid_data_length(pid) else {
                break;
            };
            if tail.len() < len {
                found.entry(pid).or_insert_with(|| {
                    Err(ObdError::Decode(format!(
                        "PID 0x{pid:02X}: need {len} bytes, got {}",
                        tail.len()
                    )))
                });
                break;
            }
            found.insert(pid, Ok(tail[..len].to_vec()));
            rest = &tail[len..];
        }
    }

    requests
        .iter()
        .map(|request| {
            let result = if request.mode == MODE_CURRENT_DATA {
                found
                    .remove(&request.pid)
                    .unwrap_or_else(|| Err(ObdError::NoData(request.to_string())))
            } else {
                Err(ObdError::NoData(request.to_string()))
            };
            (*request, result)
        })
        .collect()
}

/// Decode a Mode 01 value from its data bytes (metric units).
pub fn decode(request: ParameterRequest, data_bytes: &[u8]) -> ObdResult<Measurement> {
    let pid = request.pid;
    if request.mode != MODE_CURRENT_DATA {
        return Err(ObdError::UnsupportedPid { pid });
    }
    let need = |n: usize| -> ObdResult<()> {
        if data_bytes.len() < n {
            Err(ObdError::Decode(format!(
                "PID 0x{pid:02X}: need {n} bytes, got {}",
                data_bytes.len()
            )))
        } else {
            Ok(())
        }
    };
    let word = || (data_bytes[0] as f64) * 256.0 + data_bytes[1] as f64;
    let percent = || data_bytes[0] as f64 * 100.0 / 255.0;
    let celsius = || data_bytes[0] as f64 - 40.0;

    let (name, value, unit) = match pid {
        0x04 => {
            need(1)?;
            ("Engine Load", percent(), "%")
        }
        0x05 => {
            need(1)?;
            ("Coolant Temperature", celsius(), "°C")
        }
        0x0C => {
            need(2)?;
            ("Engine RPM", word() / 4.0, "rpm")
        }
        0x0D => {
            need(1)?;
            ("Vehicle Speed", data_bytes[0] as f64, "km/h")
        }
        0x0F => {
            need(1)?;
            ("Intake Air Temp", celsius(), "°C")
        }
        0x11 => {
            need(1)?;
            ("Throttle Position", percent(), "%")
        }
        0x2F => {
            need(1)?;
            ("Fuel Level", percent(), "%")
        }
        0x42 => {
            need(2)?;
            ("Control Module Voltage", word() / 1000.0, "V")
        }
        0x45 => {
            need(1)?;
            ("Relative Throttle Position", percent(), "%")
        }
        0x5C => {
            need(1)?;
            ("Engine Oil Temperature", celsius(), "°C")
        }
        0x5E => {
            need(2)?;
            ("Engine Fuel Rate", word() / 20.0, "L/h")
        }
        _ => return Err(ObdError::UnsupportedPid { pid }),
    };

    Ok(Measurement {
        request,
        name,
        value,
        unit,
    })
}

/// Idle reading of the absolute throttle position sensor, in percent.
pub const THROTTLE_IDLE_BASELINE: f64 = 15.0;

/// Rescale absolute throttle from `[baseline, 100]` to `[0, 100]`.
pub fn correct_throttle(raw: f64) -> f64 {
    ((raw - THROTTLE_IDLE_BASELINE) / (100.0 - THROTTLE_IDLE_BASELINE) * 100.0).clamp(0.0, 100.0)
}

/// Decode a supported-PIDs bitmap (`0100`, `0120`, …) answered for `base`.
pub fn decode_supported_pids(base: u8, data_bytes: &[u8]) -> ObdResult<Vec<ParameterRequest>> {
    if data_bytes.len() < 4 {
        return Err(ObdError::Decode(format!(
            "supported-PID bitmap 0x{base:02X}: need 4 bytes, got {}",
            data_bytes.len()
        )));
    }
    let mask = u32::from_be_bytes([data_bytes[0], data_bytes[1], data_bytes[2], data_bytes[3]]);
    Ok((0u8..32)
        .filter(|bit| mask & (1 << (31 - bit)) != 0)
        .map(|bit| ParameterRequest::current(base.wrapping_add(bit + 1)))
        .collect())
}

// ---------------------------------------------------------------------------
// Mode 09 / Mode 03 payloads
// ---------------------------------------------------------------------------

/// Extract the 17-character VIN from Mode 09 PID 02 frames.
///
/// Works for the CAN layout (`49 02 01` + 17 chars) and legacy protocols
/// that spread the VIN over several zero-padded `49 02 nn` lines.
pub fn decode_vin(frames: &[Vec<u8>]) -> ObdResult<String> {
    let mut chars = Vec::new();
    for frame in frames {
        if frame.len() < 3 || frame[0] != MODE_VEHICLE_INFO + RESPONSE_SID_OFFSET || frame[1] != PID_VIN {
            continue;
        }
        chars.extend(frame[3..].iter().copied().filter(u8::is_ascii_alphanumeric));
    }
    if chars.len() < 17 {
        return Err(ObdError::Decode(format!(
            "VIN response too short: {} characters (need 17)",
            chars.len()
        )));
    }
    String::from_utf8(chars[chars.len() - 17..].to_vec())
        .map_err(|e| ObdError::Decode(format!("VIN not valid ASCII: {e}")))
}

/// Decode two raw bytes into a standard DTC code string (e.g., "P0300").
pub fn decode_dtc_bytes(b1: u8, b2: u8) -> Option<String> {
    if b1 == 0x00 && b2 == 0x00 {
        return None;
    }

    let category = match (b1 >> 6) & 0x03 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };

    let digit1 = (b1 >> 4) & 0x03;
    let digit2 = b1 & 0x0F;
    let digit3 = (b2 >> 4) & 0x0F;
    let digit4 = b2 & 0x0F;

    Some(format!("{category}{digit1}{digit2:X}{digit3:X}{digit4:X}"))
}

/// Decode the codes in a Mode 03 payload.
///
/// CAN payloads carry a count byte (`43 02 03 00 01 71`); legacy ones are
/// fixed three-pair lines (`43 03 00 01 71 00 00`).
pub fn decode_dtc_payload(payload: &[u8]) -> ObdResult<Vec<String>> {
    let expected_sid = MODE_STORED_DTCS + RESPONSE_SID_OFFSET;
    match payload.first() {
        Some(&sid) if sid == expected_sid => {}
        _ => {
            return Err(ObdError::Decode(format!(
                "expected Mode 03 response (0x{expected_sid:02X}), got {payload:02X?}"
            )));
        }
    }

    let counted = payload.len() >= 2 && (payload.len() - 2) == payload[1] as usize * 2;
    let pairs = if counted { &payload[2..] } else { &payload[1..] };

    Ok(pairs
        .chunks_exact(2)
        .filter_map(|pair| decode_dtc_bytes(pair[0], pair[1]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Encoding ---

    #[test]
    fn encode_single_request() {
        assert_eq!(encode_request(ParameterRequest::ENGINE_RPM), "010C");
    }

    #[test]
    fn batch_fast_parameters_in_one_command() {
        let batches = batch_requests(&rl_protocol::FAST_PARAMETERS);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].command(), "010D0C1104");
    }

    #[test]
    fn batch_splits_after_six_pids() {
        let all: Vec<ParameterRequest> = rl_protocol::FAST_PARAMETERS
            .iter()
            .chain(rl_protocol::SLOW_PARAMETERS.iter())
            .copied()
            .collect();
        let batches = batch_requests(&all);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].requests.len(), 6);
        assert_eq!(batches[1].requests.len(), 4);
    }

    #[test]
    fn batch_groups_by_mode_and_dedups() {
        let vin = ParameterRequest { mode: 0x09, pid: 0x02 };
        let batches = batch_requests(&[
            ParameterRequest::ENGINE_RPM,
            vin,
            ParameterRequest::ENGINE_RPM,
            ParameterRequest::VEHICLE_SPEED,
        ]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].command(), "010C0D");
        assert_eq!(batches[1].command(), "0902");
    }

    // --- Response cleaning ---

    #[test]
    fn lines_drop_echo_prompt_and_banner() {
        let lines = response_lines("010C", "010C\rSEARCHING...\r41 0C 1A F8 \r\r>");
        assert_eq!(lines, vec!["41 0C 1A F8".to_string()]);
    }

    #[test]
    fn parse_single_frame() {
        let frames = parse_response("010C", "410C1AF8\r\r>").unwrap();
        assert_eq!(frames, vec![vec![0x41, 0x0C, 0x1A, 0xF8]]);
    }

    #[test]
    fn parse_multi_frame_truncates_to_length() {
        let text = "00A\r0:410C1AF80D32\r1:11264419000000\r\r>";
        let frames = parse_response("010C0D1104", text).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            vec![0x41, 0x0C, 0x1A, 0xF8, 0x0D, 0x32, 0x11, 0x26, 0x44, 0x19]
        );
    }

    #[test]
    fn no_data_is_typed() {
        let err = parse_response("015C", "NO DATA\r\r>").unwrap_err();
        assert_eq!(err, ObdError::NoData("015C".into()));
    }

    #[test]
    fn unknown_command_is_command_failure() {
        let err = parse_response("ATXX", "?\r\r>").unwrap_err();
        assert!(matches!(err, ObdError::CommandFailed { ref command, .. } if command == "ATXX"));
    }

    #[test]
    fn unable_to_connect_means_vehicle_silent() {
        let err = parse_response("0100", "SEARCHING...\rUNABLE TO CONNECT\r\r>").unwrap_err();
        assert_eq!(err, ObdError::VehicleNotResponding);
    }

    #[test]
    fn garbage_line_is_decode_error() {
        let err = parse_response("010C", "41 0C ZZ\r>").unwrap_err();
        assert!(matches!(err, ObdError::Decode(_)));
    }

    // --- Headed frames ---

    #[test]
    fn headed_single_frames_per_ecu() {
        let text = "7E806430203000171\r7E9024300\r\r>";
        let frames = parse_headed_response("03", text, CanAddressing::Standard).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 0x7E8);
        assert_eq!(frames[0].payload, vec![0x43, 0x02, 0x03, 0x00, 0x01, 0x71]);
        assert_eq!(frames[1].id, 0x7E9);
        assert_eq!(frames[1].payload, vec![0x43, 0x00]);
    }

    #[test]
    fn headed_multi_frame_reassembly() {
        // 0x0A bytes: 43 04 P0301 P0420 C0241 U0100
        let text = "7E8100A43040301\r7E82104204241C100\r>";
        let frames = parse_headed_response("03", text, CanAddressing::Standard).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].payload,
            vec![0x43, 0x04, 0x03, 0x01, 0x04, 0x20, 0x42, 0x41, 0xC1, 0x00]
        );
    }

    #[test]
    fn headed_sequence_mismatch() {
        let text = "7E8100A43040301\r7E82204204241C100\r>";
        let err = parse_headed_response("03", text, CanAddressing::Standard).unwrap_err();
        assert!(matches!(err, ObdError::Decode(msg) if msg.contains("sequence mismatch")));
    }

    #[test]
    fn headed_incomplete_response() {
        let err = parse_headed_response("03", "7E8100A43040301\r>", CanAddressing::Standard).unwrap_err();
        assert!(matches!(err, ObdError::Decode(msg) if msg.contains("incomplete")));
    }

    #[test]
    fn headed_noise_is_decode_error() {
        // A corrupted byte arrives as U+FFFD after lossy UTF-8 decoding.
        let text = String::from_utf8_lossy(b"7E\xFF06430203000171\r\r>");
        let err = parse_headed_response("03", &text, CanAddressing::Standard).unwrap_err();
        assert!(matches!(err, ObdError::Decode(msg) if msg.contains("not a hex frame")));

        let text = String::from_utf8_lossy(b"18DAF110\xFF430203000171\r>");
        let err = parse_headed_response("03", &text, CanAddressing::Extended).unwrap_err();
        assert!(matches!(err, ObdError::Decode(_)));
    }

    #[test]
    fn headed_extended_ids() {
        let text = "18DAF11006430203000171\r18DAF118024300\r\r>";
        let frames = parse_headed_response("03", text, CanAddressing::Extended).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 0x18DA_F110);
        assert_eq!(frames[0].payload, vec![0x43, 0x02, 0x03, 0x00, 0x01, 0x71]);
        assert_eq!(ecu_name(frames[0].id), "Engine");
        assert_eq!(ecu_name(frames[1].id), "Transmission");
    }

    #[test]
    fn headed_extended_multi_frame() {
        let text = "18DAF110100A43040301\r18DAF1102104204241C100\r>";
        let frames = parse_headed_response("03", text, CanAddressing::Extended).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 10);
    }

    #[test]
    fn addressing_from_protocol_number() {
        assert_eq!(CanAddressing::from_protocol_number("A6"), Some(CanAddressing::Standard));
        assert_eq!(CanAddressing::from_protocol_number("8"), Some(CanAddressing::Standard));
        assert_eq!(CanAddressing::from_protocol_number("A7"), Some(CanAddressing::Extended));
        assert_eq!(CanAddressing::from_protocol_number("9 "), Some(CanAddressing::Extended));
        // J1850 PWM, ISO 9141-2, KWP2000, J1939, not yet known.
        for reply in ["A1", "3", "A5", "A", "AA", "0", "?"] {
            assert_eq!(CanAddressing::from_protocol_number(reply), None, "{reply}");
        }
    }

    #[test]
    fn ecu_names() {
        assert_eq!(ecu_name(0x7E8), "Engine");
        assert_eq!(ecu_name(0x7E9), "Transmission");
        assert_eq!(ecu_name(0x7EA), "ECU 7EA");
        assert_eq!(ecu_name(0x18DA_F11A), "ECU 1A");
        assert!(is_obd_response_id(0x7EF));
        assert!(is_obd_response_id(0x18DA_F128));
        assert!(!is_obd_response_id(0x7E0));
        assert!(!is_obd_response_id(0x18DB_33F1));
    }

    // --- Parameter splitting ---

    #[test]
    fn split_multi_pid_frame() {
        let frames = vec![vec![0x41, 0x0C, 0x1A, 0xF8, 0x0D, 0x32]];
        let requests = [ParameterRequest::ENGINE_RPM, ParameterRequest::VEHICLE_SPEED];
        let split = split_parameters(&frames, &requests);
        assert_eq!(split[&ParameterRequest::ENGINE_RPM], Ok(vec![0x1A, 0xF8]));
        assert_eq!(split[&ParameterRequest::VEHICLE_SPEED], Ok(vec![0x32]));
    }

    #[test]
    fn split_marks_missing_and_truncated_fields() {
        // Speed present, RPM truncated to one byte, load absent.
        let frames = vec![vec![0x41, 0x0D, 0x32, 0x0C, 0x1A]];
        let requests = [
            ParameterRequest::VEHICLE_SPEED,
            ParameterRequest::ENGINE_RPM,
            ParameterRequest::ENGINE_LOAD,
        ];
        let split = split_parameters(&frames, &requests);
        assert_eq!(split[&ParameterRequest::VEHICLE_SPEED], Ok(vec![0x32]));
        assert!(matches!(
            split[&ParameterRequest::ENGINE_RPM],
            Err(ObdError::Decode(_))
        ));
        assert!(matches!(
            split[&ParameterRequest::ENGINE_LOAD],
            Err(ObdError::NoData(_))
        ));
    }

    #[test]
    fn split_ignores_negative_responses() {
        let frames = vec![vec![0x7F, 0x01, 0x12], vec![0x41, 0x05, 0x7B]];
        let split = split_parameters(&frames, &[ParameterRequest::COOLANT_TEMP]);
        assert_eq!(split[&ParameterRequest::COOLANT_TEMP], Ok(vec![0x7B]));
    }

    // --- PID decoding ---

    #[test]
    fn decode_rpm() {
        let v = decode(ParameterRequest::ENGINE_RPM, &[0x36, 0xB0]).unwrap();
        assert_eq!(v.name, "Engine RPM");
        assert!((v.value - 3500.0).abs() < 0.01);
        assert_eq!(v.unit, "rpm");
    }

    #[test]
    fn decode_speed() {
        let v = decode(ParameterRequest::VEHICLE_SPEED, &[0x3C]).unwrap();
        assert!((v.value - 60.0).abs() < 0.01);
    }

    #[test]
    fn decode_coolant_temp() {
        let v = decode(ParameterRequest::COOLANT_TEMP, &[130]).unwrap();
        assert!((v.value - 90.0).abs() < 0.01);
    }

    #[test]
    fn decode_voltage() {
        // 0x3758 = 14168 mV
        let v = decode(ParameterRequest::CONTROL_MODULE_VOLTAGE, &[0x37, 0x58]).unwrap();
        assert!((v.value - 14.168).abs() < 0.001);
        assert_eq!(v.unit, "V");
    }

    #[test]
    fn decode_fuel_rate() {
        // (0x00 * 256 + 0x32) / 20 = 2.5 L/h
        let v = decode(ParameterRequest::FUEL_RATE, &[0x00, 0x32]).unwrap();
        assert!((v.value - 2.5).abs() < 0.001);
    }

    #[test]
    fn decode_fuel_level() {
        let v = decode(ParameterRequest::FUEL_LEVEL, &[128]).unwrap();
        assert!((v.value - 50.196).abs() < 0.01);
    }

    #[test]
    fn decode_unsupported_pid() {
        let err = decode(ParameterRequest::current(0xA6), &[0x00]).unwrap_err();
        assert_eq!(err, ObdError::UnsupportedPid { pid: 0xA6 });
    }

    #[test]
    fn decode_insufficient_bytes() {
        let err = decode(ParameterRequest::ENGINE_RPM, &[0x36]).unwrap_err();
        assert!(matches!(err, ObdError::Decode(_)));
    }

    // --- Throttle correction ---

    #[test]
    fn throttle_baseline_maps_to_zero() {
        assert_eq!(correct_throttle(15.0), 0.0);
    }

    #[test]
    fn throttle_full_stays_full() {
        assert_eq!(correct_throttle(100.0), 100.0);
    }

    #[test]
    fn throttle_midpoint_rescales_linearly() {
        assert!((correct_throttle(57.5) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn throttle_below_baseline_clamps() {
        assert_eq!(correct_throttle(10.0), 0.0);
    }

    // --- Supported PIDs / VIN / DTCs ---

    #[test]
    fn supported_pid_bitmap() {
        // BE 1F A8 13 is the classic ELM327 example bitmap.
        let pids = decode_supported_pids(0x00, &[0xBE, 0x1F, 0xA8, 0x13]).unwrap();
        let raw: Vec<u8> = pids.iter().map(|p| p.pid).collect();
        assert_eq!(
            raw,
            vec![0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x13, 0x15, 0x1C, 0x1F, 0x20]
        );
    }

    #[test]
    fn supported_pid_bitmap_offset_base() {
        let pids = decode_supported_pids(0x40, &[0x40, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(pids, vec![ParameterRequest::CONTROL_MODULE_VOLTAGE]);
    }

    #[test]
    fn vin_from_can_multi_frame() {
        let text = "014\r0:490201314847\r1:434D3832363333\r2:41303034333532\r\r>";
        let frames = parse_response("0902", text).unwrap();
        assert_eq!(decode_vin(&frames).unwrap(), "1HGCM82633A004352");
    }

    #[test]
    fn vin_from_legacy_lines() {
        let mut frames = vec![vec![0x49, 0x02, 0x01, 0x00, 0x00, 0x00, b'1']];
        let rest = b"HGCM82633A004352";
        for (i, chunk) in rest.chunks(4).enumerate() {
            let mut frame = vec![0x49, 0x02, i as u8 + 2];
            frame.extend_from_slice(chunk);
            frames.push(frame);
        }
        assert_eq!(decode_vin(&frames).unwrap(), "1HGCM82633A004352");
    }

    #[test]
    fn vin_too_short() {
        let frames = vec![vec![0x49, 0x02, 0x01, b'A', b'B']];
        assert!(matches!(decode_vin(&frames), Err(ObdError::Decode(_))));
    }

    #[test]
    fn decode_dtc_p0300() {
        assert_eq!(decode_dtc_bytes(0x03, 0x00).as_deref(), Some("P0300"));
    }

    #[test]
    fn decode_dtc_c0035() {
        assert_eq!(decode_dtc_bytes(0x40, 0x35).as_deref(), Some("C0035"));
    }

    #[test]
    fn decode_dtc_u0100() {
        assert_eq!(decode_dtc_bytes(0xC1, 0x00).as_deref(), Some("U0100"));
    }

    #[test]
    fn decode_dtc_padding_returns_none() {
        assert_eq!(decode_dtc_bytes(0x00, 0x00), None);
    }

    #[test]
    fn dtc_payload_with_count() {
        let codes = decode_dtc_payload(&[0x43, 0x02, 0x03, 0x00, 0x01, 0x71]).unwrap();
        assert_eq!(codes, vec!["P0300".to_string(), "P0171".to_string()]);
    }

    #[test]
    fn dtc_payload_legacy_layout() {
        let codes = decode_dtc_payload(&[0x43, 0x01, 0x33, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(codes, vec!["P0133".to_string()]);
    }

    #[test]
    fn dtc_payload_empty() {
        assert!(decode_dtc_payload(&[0x43, 0x00]).unwrap().is_empty());
    }

    #[test]
    fn dtc_payload_wrong_sid() {
        assert!(decode_dtc_payload(&[0x41, 0x00]).is_err());
    }
}
