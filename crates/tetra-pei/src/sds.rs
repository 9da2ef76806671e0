//! SDS (short data service) PDUs.
//!
//! Encoding of outgoing text and status messages, decoding of incoming
//! `+CTSDSR` indications, and reassembly of concatenated text messages.
//!
//! Supported PDUs:
//!
//! - simple text messaging (protocol 0x02, immediate 0x09)
//! - SDS-TL text messaging (0x82, immediate 0x89) with message reference
//!   and delivery report request
//! - SDS-TL text messaging with a concatenation user data header (0x8A)
//! - SDS-REPORT and SDS-SHORT-REPORT
//! - 16 bit status messages (SDS type 1, AI service 13)

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use tetra_core::error::{Error, Result};
use tetra_core::types::{Identity, MessageReference, ReportKind, ReportRequest};

/// AI service of SDS-TL messages in `+CTSDSR` and `AT+CTSDS`.
pub const SDS_TL_SERVICE: u8 = 12;

/// AI service of status messages in `+CTSDSR` and `AT+CTSDS`.
pub const STATUS_SERVICE: u8 = 13;

/// Protocol identifiers.
pub mod pid {
    pub const SIMPLE_TEXT: u8 = 0x02;
    pub const SIMPLE_IMMEDIATE_TEXT: u8 = 0x09;
    pub const TEXT: u8 = 0x82;
    pub const IMMEDIATE_TEXT: u8 = 0x89;
    pub const TEXT_WITH_UDH: u8 = 0x8A;
}

/// SDS-TL message types (upper nibble of the second PDU byte).
const SDS_TRANSFER: u8 = 0x0;
const SDS_REPORT: u8 = 0x1;

/// Delivery status values of an SDS-REPORT.
pub mod delivery_status {
    pub const RECEIPT_ACK_BY_DESTINATION: u8 = 0x00;
    pub const CONSUMED_BY_DESTINATION: u8 = 0x02;
}

/// Information element identifier of the concatenation header.
const IEI_CONCATENATED_8BIT: u8 = 0x00;

/// Bytes in front of the text of a concatenated part: protocol, flags,
/// reference, coding scheme, UDH length and the 5 byte concatenation
/// element.
const CONCAT_HEADER_BYTES: usize = 10;

/// The most parts a concatenated message can have.
pub const MAX_PARTS: usize = 255;

// ---------------------------------------------------------------------------
// Text encoding
// ---------------------------------------------------------------------------

/// Text coding scheme of a text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextEncoding {
    /// ISO/IEC 8859-1, one byte per character.
    #[default]
    Latin1,
    /// UTF-16 big endian (UCS-2 on older terminals).
    Utf16,
}

impl TextEncoding {
    /// Look up an encoding by its command line name.
    pub fn from_name(name: &str) -> Result<TextEncoding> {
        match name.trim().to_uppercase().as_str() {
            "ISO8859-1" | "ISO-8859-1" | "LATIN1" => Ok(TextEncoding::Latin1),
            "UTF16" | "UTF-16" | "UTF16BE" | "UCS2" => Ok(TextEncoding::Utf16),
            _ => Err(Error::InvalidParameter(format!("unexpected encoding: {name}"))),
        }
    }

    /// The 7 bit text coding scheme value.
    pub fn coding_scheme(self) -> u8 {
        match self {
            TextEncoding::Latin1 => 0x01,
            TextEncoding::Utf16 => 0x1A,
        }
    }

    pub fn from_coding_scheme(value: u8) -> Option<TextEncoding> {
        match value & 0x7F {
            0x01 => Some(TextEncoding::Latin1),
            0x1A => Some(TextEncoding::Utf16),
            _ => None,
        }
    }

    /// Encode `text`. Characters outside Latin-1 become `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            TextEncoding::Utf16 => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            TextEncoding::Utf16 => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Latin1 => write!(f, "ISO8859-1"),
            TextEncoding::Utf16 => write!(f, "UTF16"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outgoing PDUs
// ---------------------------------------------------------------------------

/// An encoded PDU and its length in bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub bytes: Vec<u8>,
    pub bits: usize,
}

impl Pdu {
    fn from_bytes(bytes: Vec<u8>) -> Pdu {
        let bits = bytes.len() * 8;
        Pdu { bytes, bits }
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

/// A simple text message. No reference, no delivery reports.
pub fn simple_text_message(immediate: bool, encoding: TextEncoding, text: &str) -> Pdu {
    let protocol = if immediate {
        pid::SIMPLE_IMMEDIATE_TEXT
    } else {
        pid::SIMPLE_TEXT
    };
    let mut bytes = vec![protocol, encoding.coding_scheme()];
    bytes.extend(encoding.encode(text));
    Pdu::from_bytes(bytes)
}

fn transfer_flags(report: ReportRequest) -> u8 {
    (SDS_TRANSFER << 4) | (report.to_bits() << 2)
}

/// An SDS-TL text message transfer.
pub fn text_message_transfer(
    reference: MessageReference,
    immediate: bool,
    report: ReportRequest,
    encoding: TextEncoding,
    text: &str,
) -> Pdu {
    let protocol = if immediate {
        pid::IMMEDIATE_TEXT
    } else {
        pid::TEXT
    };
    let mut bytes = vec![
        protocol,
        transfer_flags(report),
        reference.get(),
        encoding.coding_scheme(),
    ];
    bytes.extend(encoding.encode(text));
    Pdu::from_bytes(bytes)
}

/// Split `text` into concatenated SDS-TL transfers that each fit into
/// `max_pdu_bits`.
///
/// Part `i` uses `reference` advanced by `i` as its transfer reference; the
/// concatenation header carries `reference` itself.
pub fn concatenated_message_transfer(
    reference: MessageReference,
    report: ReportRequest,
    encoding: TextEncoding,
    max_pdu_bits: usize,
    text: &str,
) -> Result<Vec<Pdu>> {
    let capacity = (max_pdu_bits / 8).saturating_sub(CONCAT_HEADER_BYTES);
    let unit = match encoding {
        TextEncoding::Latin1 => 1,
        TextEncoding::Utf16 => 4,
    };
    if capacity < unit {
        return Err(Error::InvalidParameter(format!(
            "a PDU of {max_pdu_bits} bits cannot carry a message part"
        )));
    }

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    for c in text.chars() {
        let mut buf = [0u8; 4];
        let encoded = encoding.encode(c.encode_utf8(&mut buf));
        if current.len() + encoded.len() > capacity {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend(encoded);
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }

    if chunks.len() > MAX_PARTS {
        return Err(Error::InvalidParameter(format!(
            "the message needs {} parts, at most {MAX_PARTS} are possible",
            chunks.len()
        )));
    }

    let total = chunks.len() as u8;
    let mut part_reference = reference;
    let mut pdus = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut bytes = vec![
            pid::TEXT_WITH_UDH,
            transfer_flags(report),
            part_reference.get(),
            encoding.coding_scheme(),
            5,
            IEI_CONCATENATED_8BIT,
            3,
            reference.get(),
            total,
            (i + 1) as u8,
        ];
        bytes.extend(chunk);
        pdus.push(Pdu::from_bytes(bytes));
        part_reference = part_reference.next();
    }
    Ok(pdus)
}

/// A 16 bit status message.
pub fn status_message(value: u16) -> Pdu {
    Pdu::from_bytes(value.to_be_bytes().to_vec())
}

/// Parse a status given as hex digits (e.g. `8002`).
pub fn parse_status(hex_status: &str) -> Result<u16> {
    let bytes = hex::decode(hex_status.trim())
        .map_err(|e| Error::InvalidParameter(format!("wrong status format: {e}")))?;
    match bytes.as_slice() {
        [high, low] => Ok(u16::from_be_bytes([*high, *low])),
        _ => Err(Error::InvalidParameter(format!(
            "a status has 16 bits, got {} bits",
            bytes.len() * 8
        ))),
    }
}

/// An SDS-REPORT answering a received transfer.
pub fn report_message(protocol: u8, reference: MessageReference, kind: ReportKind) -> Pdu {
    let status = match kind {
        ReportKind::Received => delivery_status::RECEIPT_ACK_BY_DESTINATION,
        ReportKind::Consumed => delivery_status::CONSUMED_BY_DESTINATION,
    };
    Pdu::from_bytes(vec![protocol, SDS_REPORT << 4, status, reference.get()])
}

/// Render the `AT+CMGS` request that sends `pdu` to `destination`.
pub fn send_message(destination: &Identity, pdu: &Pdu) -> String {
    format!(
        "AT+CMGS={},{}\r\n{}\u{1a}",
        destination,
        pdu.bits,
        pdu.to_hex()
    )
}

// ---------------------------------------------------------------------------
// Incoming PDUs
// ---------------------------------------------------------------------------

/// A decoded SDS-REPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdsReport {
    pub protocol: u8,
    pub delivery_status: u8,
    pub reference: Option<MessageReference>,
}

impl SdsReport {
    /// The report kind, if the status is a positive delivery report.
    pub fn kind(&self) -> Option<ReportKind> {
        match self.delivery_status {
            delivery_status::RECEIPT_ACK_BY_DESTINATION => Some(ReportKind::Received),
            delivery_status::CONSUMED_BY_DESTINATION => Some(ReportKind::Consumed),
            _ => None,
        }
    }
}

/// A decoded SDS-SHORT-REPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortReport {
    /// 2 bit short report type.
    pub report_type: u8,
    pub reference: Option<MessageReference>,
}

impl ShortReport {
    pub fn kind(&self) -> Option<ReportKind> {
        match self.report_type {
            0b10 => Some(ReportKind::Received),
            0b11 => Some(ReportKind::Consumed),
            _ => None,
        }
    }
}

/// A text message, complete or one part of a concatenated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub protocol: u8,
    pub encoding: TextEncoding,
    pub text: String,
    /// Transfer reference, `None` for simple text messages.
    pub reference: Option<MessageReference>,
    pub report_request: ReportRequest,
    pub concatenation: Option<Concatenation>,
}

impl TextMessage {
    /// Whether the sender asked for delivery reports.
    pub fn wants_report(&self) -> bool {
        self.reference.is_some() && self.report_request.any()
    }
}

/// Position of a part within a concatenated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concatenation {
    pub reference: u8,
    pub total: u8,
    pub sequence: u8,
}

/// The payload of an incoming SDS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Status(u16),
    Text(TextMessage),
    Report(SdsReport),
    ShortReport(ShortReport),
}

/// An incoming SDS decoded from a `+CTSDSR` indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub service: u8,
    pub source: Identity,
    /// The called party, omitted by some terminals.
    pub destination: Option<Identity>,
    pub payload: Payload,
}

impl IncomingMessage {
    /// The delivery report kind and reference, if this is a report.
    pub fn report(&self) -> Option<(ReportKind, Option<MessageReference>)> {
        match &self.payload {
            Payload::Report(report) => report.kind().map(|kind| (kind, report.reference)),
            Payload::ShortReport(report) => report.kind().map(|kind| (kind, report.reference)),
            _ => None,
        }
    }
}

/// Decode a `+CTSDSR: <service>,<source>,<type>,<destination>,<type>,<bits>`
/// header and the hex PDU line that follows it.
pub fn parse_incoming(header: &str, pdu_hex: &str) -> Result<IncomingMessage> {
    let fields = header
        .strip_prefix("+CTSDSR:")
        .ok_or_else(|| Error::Protocol(format!("not an SDS indication: {header}")))?;
    let fields: Vec<&str> = fields.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(Error::Protocol(format!("incomplete SDS indication: {header}")));
    }

    let service: u8 = fields[0]
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid SDS service: {}", fields[0])))?;
    let source: Identity = fields[1].parse()?;
    let destination = if fields.len() >= 6 {
        Some(fields[3].parse()?)
    } else {
        None
    };
    let bits: usize = fields[fields.len() - 1]
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid SDS length in {header}")))?;

    let mut bytes = hex::decode(pdu_hex.trim())
        .map_err(|e| Error::Protocol(format!("invalid PDU hex: {e}")))?;
    let byte_len = bits.div_ceil(8);
    if bytes.len() < byte_len {
        return Err(Error::Protocol(format!(
            "PDU has {} bytes, header announces {bits} bits",
            bytes.len()
        )));
    }
    bytes.truncate(byte_len);

    let payload = match service {
        STATUS_SERVICE => parse_status_payload(&bytes)?,
        _ => parse_sds_tl(&bytes)?,
    };

    Ok(IncomingMessage {
        service,
        source,
        destination,
        payload,
    })
}

fn parse_status_payload(bytes: &[u8]) -> Result<Payload> {
    match bytes {
        [high, low] => Ok(Payload::Status(u16::from_be_bytes([*high, *low]))),
        _ => Err(Error::Protocol(format!(
            "a status has 16 bits, got {} bytes",
            bytes.len()
        ))),
    }
}

fn parse_sds_tl(bytes: &[u8]) -> Result<Payload> {
    let (&protocol, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::Protocol("empty PDU".into()))?;

    match protocol {
        pid::SIMPLE_TEXT | pid::SIMPLE_IMMEDIATE_TEXT => {
            let (&scheme, text) = rest
                .split_first()
                .ok_or_else(|| Error::Protocol("simple text message without coding scheme".into()))?;
            let encoding = encoding_of(scheme)?;
            Ok(Payload::Text(TextMessage {
                protocol,
                encoding,
                text: encoding.decode(text),
                reference: None,
                report_request: ReportRequest::NONE,
                concatenation: None,
            }))
        }
        pid::TEXT | pid::IMMEDIATE_TEXT | pid::TEXT_WITH_UDH => parse_tl_pdu(protocol, rest),
        other => Err(Error::Protocol(format!(
            "unsupported protocol identifier 0x{other:02X}"
        ))),
    }
}

fn parse_tl_pdu(protocol: u8, rest: &[u8]) -> Result<Payload> {
    let Some(&flags) = rest.first() else {
        return Err(Error::Protocol("SDS-TL PDU without message type".into()));
    };

    // Short reports are told apart by their two leading bits.
    if flags & 0xC0 == 0x40 {
        return Ok(Payload::ShortReport(ShortReport {
            report_type: (flags >> 4) & 0x03,
            reference: rest.get(1).copied().and_then(MessageReference::from_byte),
        }));
    }

    match flags >> 4 {
        SDS_TRANSFER => parse_transfer(protocol, flags, &rest[1..]),
        SDS_REPORT => match rest {
            [_, status, reference, ..] => Ok(Payload::Report(SdsReport {
                protocol,
                delivery_status: *status,
                reference: MessageReference::from_byte(*reference),
            })),
            _ => Err(Error::Protocol("SDS-REPORT too short".into())),
        },
        other => Err(Error::Protocol(format!(
            "unsupported SDS-TL message type {other}"
        ))),
    }
}

fn parse_transfer(protocol: u8, flags: u8, rest: &[u8]) -> Result<Payload> {
    if flags & 0x01 != 0 {
        return Err(Error::Protocol(
            "store and forward transfers are not supported".into(),
        ));
    }
    let [reference, scheme, user_data @ ..] = rest else {
        return Err(Error::Protocol("SDS-TRANSFER too short".into()));
    };
    let encoding = encoding_of(*scheme)?;

    let (concatenation, text) = if protocol == pid::TEXT_WITH_UDH {
        parse_user_data_header(user_data)?
    } else {
        (None, user_data)
    };

    Ok(Payload::Text(TextMessage {
        protocol,
        encoding,
        text: encoding.decode(text),
        reference: MessageReference::from_byte(*reference),
        report_request: ReportRequest::from_bits((flags >> 2) & 0x03),
        concatenation,
    }))
}

fn parse_user_data_header(user_data: &[u8]) -> Result<(Option<Concatenation>, &[u8])> {
    let Some((&length, rest)) = user_data.split_first() else {
        return Err(Error::Protocol("missing user data header".into()));
    };
    let length = usize::from(length);
    if rest.len() < length {
        return Err(Error::Protocol("truncated user data header".into()));
    }
    let (mut header, text) = rest.split_at(length);

    let mut concatenation = None;
    while let [iei, len, tail @ ..] = header {
        let len = usize::from(*len);
        if tail.len() < len {
            return Err(Error::Protocol("truncated information element".into()));
        }
        let (value, next) = tail.split_at(len);
        if *iei == IEI_CONCATENATED_8BIT {
            if let [reference, total, sequence] = value {
                concatenation = Some(Concatenation {
                    reference: *reference,
                    total: *total,
                    sequence: *sequence,
                });
            }
        } else {
            debug!(iei = *iei, "skipping information element");
        }
        header = next;
    }
    Ok((concatenation, text))
}

fn encoding_of(scheme: u8) -> Result<TextEncoding> {
    TextEncoding::from_coding_scheme(scheme).ok_or_else(|| {
        Error::Protocol(format!("unsupported text coding scheme 0x{scheme:02X}"))
    })
}

// ---------------------------------------------------------------------------
// Addressing in the text
// ---------------------------------------------------------------------------

/// Longest OPTA (operational tactical address) a text may start with.
pub const MAX_OPTA_LEN: usize = 24;

/// Split a leading `#<OPTA>#` from `text`.
///
/// Returns the OPTA, if any, and the remaining text. A `#` that is not
/// closed within [`MAX_OPTA_LEN`] characters is part of the text.
pub fn split_leading_opta(text: &str) -> (Option<&str>, &str) {
    let Some(rest) = text.strip_prefix('#') else {
        return (None, text);
    };
    match rest.find('#') {
        Some(end) if end > 0 && rest[..end].chars().count() <= MAX_OPTA_LEN => {
            (Some(rest[..end].trim()), &rest[end + 1..])
        }
        _ => (None, text),
    }
}

/// Split a trailing `#<ITSI>` from `text`.
///
/// Returns the remaining text and the ITSI, if any. Only digits count as an
/// ITSI.
pub fn split_trailing_itsi(text: &str) -> (&str, Option<Identity>) {
    let Some((head, tail)) = text.rsplit_once('#') else {
        return (text, None);
    };
    match tail.trim_end().parse::<Identity>() {
        Ok(itsi) => (head, Some(itsi)),
        Err(_) => (text, None),
    }
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// How long the parts of an incomplete message are kept.
pub const DEFAULT_PART_MAX_AGE: Duration = Duration::from_secs(600);

/// How many incomplete messages are kept at most.
pub const DEFAULT_MAX_INCOMPLETE: usize = 64;

/// Collects the parts of concatenated text messages.
///
/// Incomplete messages are dropped when their first part is older than the
/// maximum age, or, oldest first, when more than the maximum number are
/// incomplete.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<(Identity, u8), PendingMessage>,
    max_age: Duration,
    max_incomplete: usize,
}

#[derive(Debug)]
struct PendingMessage {
    started: Instant,
    parts: Vec<Option<String>>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler {
            pending: HashMap::new(),
            max_age: DEFAULT_PART_MAX_AGE,
            max_incomplete: DEFAULT_MAX_INCOMPLETE,
        }
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_age: Duration, max_incomplete: usize) -> Self {
        Reassembler {
            pending: HashMap::new(),
            max_age,
            max_incomplete: max_incomplete.max(1),
        }
    }

    /// Add a text message from `source`. Returns the complete text once all
    /// parts of its message are present; messages that are not concatenated
    /// are returned right away.
    pub fn put(&mut self, source: &Identity, message: &TextMessage) -> Option<String> {
        self.put_at(source, message, Instant::now())
    }

    fn put_at(&mut self, source: &Identity, message: &TextMessage, now: Instant) -> Option<String> {
        let Some(concat) = message.concatenation else {
            return Some(message.text.clone());
        };
        let total = usize::from(concat.total);
        let sequence = usize::from(concat.sequence);
        if total <= 1 {
            return Some(message.text.clone());
        }
        if sequence == 0 || sequence > total {
            debug!(sequence, total, "part out of range");
            return None;
        }

        self.expire(now);

        let key = (source.clone(), concat.reference);
        if !self.pending.contains_key(&key) {
            self.make_room();
        }
        let pending = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingMessage {
                started: now,
                parts: vec![None; total],
            });
        if pending.parts.len() != total {
            // Same reference reused for a different message.
            pending.started = now;
            pending.parts = vec![None; total];
        }
        pending.parts[sequence - 1] = Some(message.text.clone());

        if pending.parts.iter().all(Option::is_some) {
            let pending = self.pending.remove(&key)?;
            return Some(pending.parts.into_iter().flatten().collect());
        }
        None
    }

    fn expire(&mut self, now: Instant) {
        let max_age = self.max_age;
        self.pending.retain(|(source, reference), pending| {
            let keep = now.saturating_duration_since(pending.started) < max_age;
            if !keep {
                debug!(%source, reference, "dropping incomplete message");
            }
            keep
        });
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.max_incomplete {
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, pending)| pending.started)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            debug!(source = %oldest.0, reference = oldest.1, "too many incomplete messages");
            self.pending.remove(&oldest);
        }
    }

    /// Number of messages with missing parts.
    pub fn incomplete(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(value: u32) -> MessageReference {
        MessageReference::new(value).unwrap()
    }

    #[test]
    fn encoding_names() {
        assert_eq!(TextEncoding::from_name("iso8859-1").unwrap(), TextEncoding::Latin1);
        assert_eq!(TextEncoding::from_name(" UTF16 ").unwrap(), TextEncoding::Utf16);
        assert!(matches!(
            TextEncoding::from_name("EBCDIC"),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn latin1_replaces_unmappable_characters() {
        assert_eq!(TextEncoding::Latin1.encode("Grüße €"), b"Gr\xFC\xDFe ?");
        assert_eq!(TextEncoding::Latin1.decode(b"Gr\xFC\xDFe"), "Grüße");
    }

    #[test]
    fn utf16_is_big_endian() {
        assert_eq!(TextEncoding::Utf16.encode("A€"), vec![0x00, 0x41, 0x20, 0xAC]);
        assert_eq!(TextEncoding::Utf16.decode(&[0x00, 0x41, 0x20, 0xAC]), "A€");
    }

    #[test]
    fn simple_text_layout() {
        let pdu = simple_text_message(false, TextEncoding::Latin1, "hi");
        assert_eq!(pdu.bytes, vec![0x02, 0x01, b'h', b'i']);
        assert_eq!(pdu.bits, 32);
        assert_eq!(simple_text_message(true, TextEncoding::Latin1, "").bytes[0], 0x09);
    }

    #[test]
    fn transfer_layout() {
        let report = ReportRequest {
            received: true,
            consumed: true,
        };
        let pdu = text_message_transfer(reference(42), false, report, TextEncoding::Latin1, "ok");
        assert_eq!(pdu.bytes, vec![0x82, 0x0C, 42, 0x01, b'o', b'k']);
        assert_eq!(pdu.to_hex(), "820C2A016F6B");

        let immediate =
            text_message_transfer(reference(1), true, ReportRequest::NONE, TextEncoding::Utf16, "");
        assert_eq!(immediate.bytes, vec![0x89, 0x00, 1, 0x1A]);
    }

    #[test]
    fn send_message_request() {
        let destination: Identity = "1234567".parse().unwrap();
        let pdu = simple_text_message(false, TextEncoding::Latin1, "hi");
        assert_eq!(
            send_message(&destination, &pdu),
            "AT+CMGS=1234567,32\r\n02016869\u{1a}"
        );
    }

    #[test]
    fn concatenated_parts_fit_and_number_up() {
        // 20 bytes per PDU leave 10 bytes of text per part.
        let text = "abcdefghijklmnopqrstuvwxy";
        let pdus = concatenated_message_transfer(
            reference(255),
            ReportRequest::NONE,
            TextEncoding::Latin1,
            160,
            text,
        )
        .unwrap();
        assert_eq!(pdus.len(), 3);
        for pdu in &pdus {
            assert!(pdu.bits <= 160);
        }
        assert_eq!(
            &pdus[0].bytes[..10],
            &[0x8A, 0x00, 255, 0x01, 5, 0x00, 3, 255, 3, 1]
        );
        // Transfer references advance and wrap past 255.
        assert_eq!(pdus[1].bytes[2], 1);
        assert_eq!(pdus[2].bytes[2], 2);
        assert_eq!(pdus[2].bytes[9], 3);
        assert_eq!(&pdus[2].bytes[10..], b"uvwxy");
    }

    #[test]
    fn concatenated_utf16_never_splits_a_character() {
        let text = "😀😀😀";
        let pdus = concatenated_message_transfer(
            reference(7),
            ReportRequest::NONE,
            TextEncoding::Utf16,
            (CONCAT_HEADER_BYTES + 6) * 8,
            text,
        )
        .unwrap();
        assert_eq!(pdus.len(), 3);
        assert!(pdus.iter().all(|p| p.bytes.len() == CONCAT_HEADER_BYTES + 4));
    }

    #[test]
    fn concatenation_rejects_tiny_pdus() {
        let result = concatenated_message_transfer(
            reference(7),
            ReportRequest::NONE,
            TextEncoding::Latin1,
            80,
            "x",
        );
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status("8002").unwrap(), 0x8002);
        assert!(parse_status("80").is_err());
        assert!(parse_status("zz02").is_err());
        assert_eq!(status_message(0x8002).bits, 16);
    }

    #[test]
    fn incoming_status() {
        let message = parse_incoming("+CTSDSR: 13,1234567,0,7654321,0,16", "8002").unwrap();
        assert_eq!(message.service, STATUS_SERVICE);
        assert_eq!(message.source.as_str(), "1234567");
        assert_eq!(
            message.destination.as_ref().map(Identity::as_str),
            Some("7654321")
        );
        assert_eq!(message.payload, Payload::Status(0x8002));
    }

    #[test]
    fn incoming_text_transfer_with_report_request() {
        let message =
            parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,56", "82042A01686921").unwrap();
        let Payload::Text(text) = &message.payload else {
            panic!("expected text, got {:?}", message.payload);
        };
        assert_eq!(text.text, "hi!");
        assert_eq!(text.reference, Some(reference(42)));
        assert!(text.report_request.received);
        assert!(!text.report_request.consumed);
        assert!(text.wants_report());
    }

    #[test]
    fn incoming_reports() {
        let received = parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,32", "8210002A").unwrap();
        assert_eq!(received.report(), Some((ReportKind::Received, Some(reference(42)))));

        let consumed = parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,32", "8210022A").unwrap();
        assert_eq!(consumed.report(), Some((ReportKind::Consumed, Some(reference(42)))));

        let short = parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,24", "82602A").unwrap();
        assert_eq!(short.report(), Some((ReportKind::Received, Some(reference(42)))));

        let short_consumed =
            parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,24", "82702A").unwrap();
        assert_eq!(
            short_consumed.report(),
            Some((ReportKind::Consumed, Some(reference(42))))
        );
    }

    #[test]
    fn report_message_answers_transfer() {
        let pdu = report_message(pid::TEXT, reference(42), ReportKind::Consumed);
        assert_eq!(pdu.to_hex(), "8210022A");
    }

    #[test]
    fn malformed_incoming_is_rejected() {
        assert!(parse_incoming("+CTXG: 1,3", "00").is_err());
        assert!(parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,32", "82").is_err());
        assert!(parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,32", "xyz").is_err());
        assert!(parse_incoming("+CTSDSR: 12,1234567,0,7654321,0,16", "FF00").is_err());
    }

    #[test]
    fn reassembles_out_of_order_parts() {
        let pdus = concatenated_message_transfer(
            reference(9),
            ReportRequest::NONE,
            TextEncoding::Latin1,
            (CONCAT_HEADER_BYTES + 4) * 8,
            "hello world",
        )
        .unwrap();
        assert_eq!(pdus.len(), 3);

        let source: Identity = "1234567".parse().unwrap();
        let mut reassembler = Reassembler::new();
        let mut decoded: Vec<TextMessage> = pdus
            .iter()
            .map(|pdu| {
                let header = format!("+CTSDSR: 12,1234567,0,7654321,0,{}", pdu.bits);
                match parse_incoming(&header, &pdu.to_hex()).unwrap().payload {
                    Payload::Text(text) => text,
                    other => panic!("expected text, got {other:?}"),
                }
            })
            .collect();
        decoded.swap(0, 2);

        assert_eq!(reassembler.put(&source, &decoded[0]), None);
        assert_eq!(reassembler.put(&source, &decoded[1]), None);
        assert_eq!(reassembler.incomplete(), 1);
        assert_eq!(
            reassembler.put(&source, &decoded[2]).as_deref(),
            Some("hello world")
        );
        assert_eq!(reassembler.incomplete(), 0);
    }

    #[test]
    fn opta_is_split_from_the_start() {
        assert_eq!(
            split_leading_opta("#FL MUC 1/46-1#Einsatz"),
            (Some("FL MUC 1/46-1"), "Einsatz")
        );
        assert_eq!(split_leading_opta("no opta"), (None, "no opta"));
        assert_eq!(split_leading_opta("#open"), (None, "#open"));
        assert_eq!(split_leading_opta("##x"), (None, "##x"));
        let long = format!("#{}#x", "A".repeat(MAX_OPTA_LEN + 1));
        assert_eq!(split_leading_opta(&long), (None, long.as_str()));
    }

    #[test]
    fn itsi_is_split_from_the_end() {
        let (text, itsi) = split_trailing_itsi("come in#2621234");
        assert_eq!(text, "come in");
        assert_eq!(itsi.unwrap().as_str(), "2621234");

        assert_eq!(split_trailing_itsi("room #4a"), ("room #4a", None));
        assert_eq!(split_trailing_itsi("plain"), ("plain", None));
    }

    fn first_part(reference: u8) -> TextMessage {
        TextMessage {
            protocol: pid::TEXT_WITH_UDH,
            encoding: TextEncoding::Latin1,
            text: "part".into(),
            reference: None,
            report_request: ReportRequest::NONE,
            concatenation: Some(Concatenation {
                reference,
                total: 2,
                sequence: 1,
            }),
        }
    }

    #[test]
    fn stale_parts_are_dropped() {
        let source: Identity = "1234567".parse().unwrap();
        let mut reassembler = Reassembler::with_limits(Duration::from_secs(60), 8);
        let start = Instant::now();

        assert_eq!(reassembler.put_at(&source, &first_part(1), start), None);
        assert_eq!(reassembler.put_at(&source, &first_part(2), start), None);
        assert_eq!(reassembler.incomplete(), 2);

        let later = start + Duration::from_secs(61);
        assert_eq!(reassembler.put_at(&source, &first_part(3), later), None);
        assert_eq!(reassembler.incomplete(), 1);
    }

    #[test]
    fn incomplete_messages_are_capped() {
        let source: Identity = "1234567".parse().unwrap();
        let mut reassembler = Reassembler::with_limits(Duration::from_secs(600), 4);
        let start = Instant::now();

        for reference in 0..10u8 {
            let at = start + Duration::from_millis(u64::from(reference));
            reassembler.put_at(&source, &first_part(reference), at);
        }
        assert_eq!(reassembler.incomplete(), 4);

        // The newest messages survive and can still complete.
        let mut last = first_part(9);
        last.concatenation = Some(Concatenation {
            reference: 9,
            total: 2,
            sequence: 2,
        });
        let at = start + Duration::from_millis(20);
        assert_eq!(
            reassembler.put_at(&source, &last, at).as_deref(),
            Some("partpart")
        );
        assert_eq!(reassembler.incomplete(), 3);
    }
}
