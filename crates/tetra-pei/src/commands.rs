//! PEI command builders and response parsers.
//!
//! The `cmd_*` and `parse_*` functions are pure: they render AT command
//! strings and parse the response lines returned by [`Pei::at`]. The
//! `request_*` helpers combine both with a session.
//!
//! # Command reference
//!
//! Based on ETSI EN 300 392-5 (PEI AT command set) as implemented by common
//! TETRA terminals. Responses are `+XXX: <fields>` lines followed by `OK`;
//! the session strips the final result code.

use std::fmt;

use tokio_util::sync::CancellationToken;

use tetra_core::error::{Error, Result};

use crate::io::Pei;

// ---------------------------------------------------------------
// Fixed commands
// ---------------------------------------------------------------

/// Use ISO 8859-1 for text parameters.
pub const SET_CHARSET_LATIN1: &str = "AT+CSCS=8859-1";

/// Select SDS-TL (AI service 12) for the following `AT+CMGS`.
pub const SWITCH_TO_SDS_TL: &str = "AT+CTSDS=12,0";

/// Select status messages (AI service 13) for the following `AT+CMGS`.
pub const SWITCH_TO_STATUS: &str = "AT+CTSDS=13,0";

/// Route status messages to the PEI.
pub const ROUTE_STATUS: &str = "AT+CTSP=2,2,20";

/// Route group management to the PEI, needed to change talkgroups.
pub const ROUTE_GROUP_MANAGEMENT: &str = "AT+CTSP=1,1,11";

/// Routing set up by `listen`: call signaling, status and every text
/// messaging protocol.
pub const LISTEN_ROUTING: [&str; 7] = [
    "AT+CTSP=2,0,0",
    ROUTE_STATUS,
    "AT+CTSP=1,3,2",
    "AT+CTSP=1,3,9",
    "AT+CTSP=1,3,130",
    "AT+CTSP=1,3,137",
    "AT+CTSP=1,3,138",
];

// ---------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------

/// Device identification (`ATI`).
pub fn cmd_read_info() -> String {
    "ATI".into()
}

/// Current service profile routing (`AT+CTSP?`).
pub fn cmd_read_routing() -> String {
    "AT+CTSP?".into()
}

/// Battery charge (`AT+CBC?`).
pub fn cmd_read_battery_charge() -> String {
    "AT+CBC?".into()
}

/// Received signal strength (`AT+CSQ?`).
pub fn cmd_read_signal_strength() -> String {
    "AT+CSQ?".into()
}

/// GPS position (`AT+GPSPOS?`).
pub fn cmd_read_gps_position() -> String {
    "AT+GPSPOS?".into()
}

/// Operating mode (`AT+CTOM?`).
pub fn cmd_read_operating_mode() -> String {
    "AT+CTOM?".into()
}

/// Switch the operating mode (`AT+CTOM=<mode>`).
pub fn cmd_set_operating_mode(mode: OperatingMode) -> String {
    format!("AT+CTOM={}", mode.code())
}

/// Selected talkgroup (`AT+CTGS?`).
pub fn cmd_read_talkgroup() -> String {
    "AT+CTGS?".into()
}

/// Select a talkgroup (`AT+CTGS=1,<gtsi>`).
pub fn cmd_set_talkgroup(gtsi: &str) -> String {
    format!("AT+CTGS=1,{}", gtsi.trim())
}

/// List the talkgroups of a folder (`AT+CTGL=<folder>,0,1`).
pub fn cmd_read_talkgroups(folder: TalkgroupFolder) -> String {
    format!("AT+CTGL={},0,1", folder as u8)
}

/// Supported SDS length range (`AT+CMGS=?`).
pub fn cmd_read_max_pdu_bits() -> String {
    "AT+CMGS=?".into()
}

// ---------------------------------------------------------------
// Types
// ---------------------------------------------------------------

/// Air interface operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    /// Trunked mode, via the network.
    Tmo,
    /// Direct mode, terminal to terminal.
    Dmo,
    /// Any other mode reported by the terminal (gateway, repeater, ...).
    Other(u8),
}

impl OperatingMode {
    pub fn code(self) -> u8 {
        match self {
            OperatingMode::Tmo => 0,
            OperatingMode::Dmo => 1,
            OperatingMode::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => OperatingMode::Tmo,
            1 => OperatingMode::Dmo,
            other => OperatingMode::Other(other),
        }
    }

    /// Parse `TMO` or `DMO` (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_uppercase().as_str() {
            "TMO" => Ok(OperatingMode::Tmo),
            "DMO" => Ok(OperatingMode::Dmo),
            _ => Err(Error::InvalidParameter(format!(
                "invalid operating mode {name}, expected TMO or DMO"
            ))),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Tmo => write!(f, "TMO"),
            OperatingMode::Dmo => write!(f, "DMO"),
            OperatingMode::Other(code) => write!(f, "MODE {code}"),
        }
    }
}

/// Talkgroup folders of `AT+CTGL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TalkgroupFolder {
    /// Groups assigned by the network (TMO).
    Dynamic = 0,
    /// Groups programmed into the terminal (DMO).
    Static = 1,
}

/// One entry of a talkgroup list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkgroupInfo {
    pub gtsi: String,
    pub name: String,
}

/// UTC time of day reported with a GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// A GPS position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub time: FixTime,
    pub latitude: f64,
    pub longitude: f64,
    pub satellites: u32,
}

// ---------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------

/// Find the first line with `prefix` and return the text after it.
fn response_fields<'a>(lines: &'a [String], prefix: &str) -> Result<&'a str> {
    lines
        .iter()
        .find_map(|line| line.trim().strip_prefix(prefix))
        .map(str::trim)
        .ok_or_else(|| Error::Protocol(format!("no {prefix} response")))
}

fn parse_number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T> {
    field
        .trim()
        .trim_matches('"')
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {what}: {field:?}")))
}

/// Parse `+CBC: <status>,<charge>` into the charge in percent.
pub fn parse_battery_charge(lines: &[String]) -> Result<u8> {
    let fields = response_fields(lines, "+CBC:")?;
    let charge = fields
        .split(',')
        .nth(1)
        .ok_or_else(|| Error::Protocol(format!("incomplete battery response: {fields}")))?;
    parse_number(charge, "battery charge")
}

/// Parse `+CSQ: <rssi>,<ber>` into dBm.
pub fn parse_signal_strength(lines: &[String]) -> Result<i32> {
    let fields = response_fields(lines, "+CSQ:")?;
    let rssi: u8 = parse_number(fields.split(',').next().unwrap_or(fields), "RSSI")?;
    if rssi == 99 {
        return Err(Error::Protocol("signal strength not known".into()));
    }
    Ok(-113 + 2 * i32::from(rssi))
}

/// Parse a `N: dd_mm.mmmm` / `E: ddd_mm.mmmm` coordinate.
fn parse_coordinate(field: &str) -> Result<f64> {
    let (hemisphere, value) = field
        .trim()
        .split_once(':')
        .ok_or_else(|| Error::Protocol(format!("invalid coordinate: {field:?}")))?;
    let (degrees, minutes) = value
        .trim()
        .split_once('_')
        .ok_or_else(|| Error::Protocol(format!("invalid coordinate: {field:?}")))?;
    let degrees: f64 = parse_number(degrees, "degrees")?;
    let minutes: f64 = parse_number(minutes, "minutes")?;
    let value = degrees + minutes / 60.0;

    match hemisphere.trim() {
        "N" | "E" => Ok(value),
        "S" | "W" => Ok(-value),
        other => Err(Error::Protocol(format!("invalid hemisphere: {other:?}"))),
    }
}

/// Parse `+GPSPOS: hh:mm:ss,N: dd_mm.mmmm,E: ddd_mm.mmmm,<satellites>`.
pub fn parse_gps_position(lines: &[String]) -> Result<Position> {
    let fields = response_fields(lines, "+GPSPOS:")?;
    let parts: Vec<&str> = fields.split(',').collect();
    let [time, latitude, longitude, satellites, ..] = parts.as_slice() else {
        return Err(Error::Protocol(format!("incomplete GPS position: {fields}")));
    };

    let clock: Vec<&str> = time.trim().split(':').collect();
    let [hour, minute, second] = clock.as_slice() else {
        return Err(Error::Protocol(format!("invalid GPS time: {time:?}")));
    };

    Ok(Position {
        time: FixTime {
            hour: parse_number(hour, "hour")?,
            minute: parse_number(minute, "minute")?,
            second: parse_number(second, "second")?,
        },
        latitude: parse_coordinate(latitude)?,
        longitude: parse_coordinate(longitude)?,
        satellites: parse_number(satellites, "satellite count")?,
    })
}

/// Parse `+CTOM: <mode>`.
pub fn parse_operating_mode(lines: &[String]) -> Result<OperatingMode> {
    let fields = response_fields(lines, "+CTOM:")?;
    let code = fields.split(',').next().unwrap_or(fields);
    Ok(OperatingMode::from_code(parse_number(code, "operating mode")?))
}

/// Parse `+CTGS: <group type>,<gtsi>` into the GTSI.
pub fn parse_talkgroup(lines: &[String]) -> Result<String> {
    let fields = response_fields(lines, "+CTGS:")?;
    let gtsi = fields
        .rsplit(',')
        .next()
        .map(|gtsi| gtsi.trim().trim_matches('"'))
        .unwrap_or_default();
    if gtsi.is_empty() {
        return Err(Error::Protocol(format!("no talkgroup in {fields:?}")));
    }
    Ok(gtsi.to_string())
}

/// Parse every `+CTGL: <gtsi>,<name>` line.
pub fn parse_talkgroups(lines: &[String]) -> Vec<TalkgroupInfo> {
    lines
        .iter()
        .filter_map(|line| line.trim().strip_prefix("+CTGL:"))
        .filter_map(|fields| {
            let (gtsi, name) = fields.split_once(',')?;
            Some(TalkgroupInfo {
                gtsi: gtsi.trim().to_string(),
                name: name.trim().trim_matches('"').to_string(),
            })
        })
        .collect()
}

/// Parse the answer to `AT+CMGS=?`: the largest number inside the
/// parentheses is the maximum PDU length in bits.
pub fn parse_max_pdu_bits(lines: &[String]) -> Result<usize> {
    let fields = response_fields(lines, "+CMGS:")?;
    let range = fields
        .rsplit_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(range, _)| range)
        .ok_or_else(|| Error::Protocol(format!("no length range in {fields:?}")))?;

    range
        .split(['-', ','])
        .filter_map(|n| n.trim().parse::<usize>().ok())
        .max()
        .ok_or_else(|| Error::Protocol(format!("no length in {range:?}")))
}

// ---------------------------------------------------------------
// Session helpers
// ---------------------------------------------------------------

pub async fn request_battery_charge(cancel: &CancellationToken, pei: &Pei) -> Result<u8> {
    parse_battery_charge(&pei.at(cancel, &cmd_read_battery_charge()).await?)
}

pub async fn request_signal_strength(cancel: &CancellationToken, pei: &Pei) -> Result<i32> {
    parse_signal_strength(&pei.at(cancel, &cmd_read_signal_strength()).await?)
}

pub async fn request_gps_position(cancel: &CancellationToken, pei: &Pei) -> Result<Position> {
    parse_gps_position(&pei.at(cancel, &cmd_read_gps_position()).await?)
}

pub async fn request_operating_mode(
    cancel: &CancellationToken,
    pei: &Pei,
) -> Result<OperatingMode> {
    parse_operating_mode(&pei.at(cancel, &cmd_read_operating_mode()).await?)
}

pub async fn request_talkgroup(cancel: &CancellationToken, pei: &Pei) -> Result<String> {
    parse_talkgroup(&pei.at(cancel, &cmd_read_talkgroup()).await?)
}

pub async fn request_talkgroups(
    cancel: &CancellationToken,
    pei: &Pei,
    folder: TalkgroupFolder,
) -> Result<Vec<TalkgroupInfo>> {
    Ok(parse_talkgroups(
        &pei.at(cancel, &cmd_read_talkgroups(folder)).await?,
    ))
}

/// Ask the radio how long an SDS PDU may be, in bits.
pub async fn request_max_pdu_bits(cancel: &CancellationToken, pei: &Pei) -> Result<usize> {
    parse_max_pdu_bits(&pei.at(cancel, &cmd_read_max_pdu_bits()).await?)
}
