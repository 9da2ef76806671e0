//! Core value types used throughout the PEI stack.
//!
//! These wrap the small pieces of TETRA addressing and SDS bookkeeping that
//! cross crate boundaries: subscriber identities, SDS message references and
//! the set of delivery reports requested for a message.

use std::fmt;
use std::num::NonZeroU8;
use std::str::FromStr;

use rand::Rng;

use crate::error::{Error, Result};

/// SDS message reference: an 8-bit identifier in `1..=255` correlating a sent
/// message with its later delivery and consumption reports.
///
/// Zero is reserved as "unset" and can never be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageReference(NonZeroU8);

impl MessageReference {
    /// Validate a caller-supplied reference.
    ///
    /// Returns [`Error::InvalidParameter`] for 0 and anything above 255.
    pub fn new(value: u32) -> Result<Self> {
        u8::try_from(value)
            .ok()
            .and_then(NonZeroU8::new)
            .map(MessageReference)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "the message reference must be 1-255, but got {value}"
                ))
            })
    }

    /// Pick a pseudo-random reference in `1..=255`.
    pub fn random() -> Self {
        let value: u8 = rand::thread_rng().gen_range(1..=255);
        MessageReference(NonZeroU8::new(value).unwrap_or(NonZeroU8::MIN))
    }

    /// Interpret a raw byte from a decoded PDU. Returns `None` for zero.
    pub fn from_byte(value: u8) -> Option<Self> {
        NonZeroU8::new(value).map(MessageReference)
    }

    /// The reference that follows this one, wrapping from 255 back to 1.
    pub fn next(self) -> Self {
        MessageReference(NonZeroU8::new(self.0.get().wrapping_add(1)).unwrap_or(NonZeroU8::MIN))
    }

    /// Return the raw byte value.
    pub fn get(self) -> u8 {
        self.0.get()
    }
}

impl fmt::Display for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A TETRA subscriber identity (ISSI, GTSI or ITSI) in its decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Return the identity as it is written on the PEI.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidParameter(format!(
                "not a valid TETRA identity: {s:?}"
            )));
        }
        Ok(Identity(s.to_string()))
    }
}

/// The kind of delivery report a sender can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    /// The destination received the message.
    Received,
    /// The destination user read (consumed) the message.
    Consumed,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Received => write!(f, "received"),
            ReportKind::Consumed => write!(f, "consumed"),
        }
    }
}

/// The set of delivery reports requested for an outgoing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReportRequest {
    /// Ask the destination to confirm reception.
    pub received: bool,
    /// Ask the destination to confirm consumption.
    pub consumed: bool,
}

impl ReportRequest {
    /// No delivery report requested.
    pub const NONE: ReportRequest = ReportRequest {
        received: false,
        consumed: false,
    };

    /// Whether any report is requested.
    pub fn any(&self) -> bool {
        self.received || self.consumed
    }

    /// Whether the given report kind is requested.
    pub fn contains(&self, kind: ReportKind) -> bool {
        match kind {
            ReportKind::Received => self.received,
            ReportKind::Consumed => self.consumed,
        }
    }

    /// Encode as the 2-bit delivery report request field of an SDS-TRANSFER.
    pub fn to_bits(self) -> u8 {
        (self.received as u8) | ((self.consumed as u8) << 1)
    }

    /// Decode the 2-bit delivery report request field of an SDS-TRANSFER.
    pub fn from_bits(bits: u8) -> Self {
        ReportRequest {
            received: bits & 0b01 != 0,
            consumed: bits & 0b10 != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_reference_bounds() {
        assert!(matches!(
            MessageReference::new(0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            MessageReference::new(256),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(MessageReference::new(1).unwrap().get(), 1);
        assert_eq!(MessageReference::new(255).unwrap().get(), 255);
    }

    #[test]
    fn message_reference_random_is_nonzero() {
        for _ in 0..1000 {
            let r = MessageReference::random();
            assert!(r.get() >= 1);
        }
    }

    #[test]
    fn message_reference_next_wraps_past_zero() {
        let r = MessageReference::new(254).unwrap();
        assert_eq!(r.next().get(), 255);
        assert_eq!(r.next().next().get(), 1);
    }

    #[test]
    fn message_reference_from_byte() {
        assert!(MessageReference::from_byte(0).is_none());
        assert_eq!(MessageReference::from_byte(42).unwrap().to_string(), "42");
    }

    #[test]
    fn identity_parse() {
        let id: Identity = " 1234567 ".parse().unwrap();
        assert_eq!(id.as_str(), "1234567");
        assert!("".parse::<Identity>().is_err());
        assert!("12a4".parse::<Identity>().is_err());
    }

    #[test]
    fn report_request_bits() {
        assert_eq!(ReportRequest::NONE.to_bits(), 0);
        let both = ReportRequest {
            received: true,
            consumed: true,
        };
        assert_eq!(both.to_bits(), 0b11);
        assert_eq!(ReportRequest::from_bits(0b10).consumed, true);
        assert_eq!(ReportRequest::from_bits(0b10).received, false);
        assert!(both.contains(ReportKind::Consumed));
        assert!(!ReportRequest::NONE.any());
    }
}
