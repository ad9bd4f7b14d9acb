//! Wire protocol handlers
//!
//! Two protocols are supported: the ASTM E1381 low-level frame protocol
//! (explicit handshake, sequence numbers, checksums) and HL7 v2 over MLLP
//! (block envelope with per-message separator declaration). A handler
//! consumes the session's buffered bytes and answers with response bytes
//! and zero or more reassembled message texts; frame-level faults are
//! expressed as acknowledgment bytes, never as errors.

pub mod astm;
pub mod hl7;

pub use astm::AstmHandler;
pub use hl7::Hl7Handler;

use serde::{Deserialize, Serialize};

use crate::core::session::ConnectionSession;
use crate::utils::decode::TextEncoding;

/// Resolved protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Astm,
    Hl7,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Astm => "astm",
            ProtocolKind::Hl7 => "hl7",
        }
    }
}

/// Lead-byte signatures for protocol auto-detection.
///
/// Resolved once from the first byte of a fresh session and sticky until
/// the session resets; re-detecting mid-session could misclassify a
/// partial frame.
const LEAD_SIGNATURES: &[(u8, ProtocolKind)] = &[
    (astm::ENQ, ProtocolKind::Astm),
    (astm::STX, ProtocolKind::Astm),
    (hl7::VT, ProtocolKind::Hl7),
];

/// Resolve the protocol for a fresh session from its lead byte.
///
/// `None` means unrecognized input; the link closes the connection rather
/// than guessing.
pub fn detect(lead: u8) -> Option<ProtocolKind> {
    LEAD_SIGNATURES
        .iter()
        .find(|(byte, _)| *byte == lead)
        .map(|(_, kind)| *kind)
}

/// Session milestones surfaced to the link for status events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNote {
    TransferStarted,
    TransferEnded,
}

/// What a handler asks the link to do after consuming buffered input
#[derive(Debug, Default)]
pub struct HandlerOutput {
    /// Bytes to write back (acknowledgments, synthesized responses)
    pub reply: Vec<u8>,
    /// Fully reassembled message texts, in completion order
    pub messages: Vec<String>,
    /// Session milestones for status reporting
    pub notes: Vec<SessionNote>,
}

/// A wire protocol handler. One instance per connection; owns all
/// protocol-level session state.
pub trait WireProtocol: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Consume buffered session input. Complete units are processed;
    /// partial ones are left in `session.buffer` for the next read.
    fn on_bytes(&mut self, session: &mut ConnectionSession) -> HandlerOutput;

    /// Drop all protocol-level state for the current message attempt.
    fn reset(&mut self);

    /// Bytes to write when the link aborts the current message on a guard
    /// violation. ASTM answers NAK; MLLP has no negative acknowledgment
    /// at the framing layer.
    fn abort_reply(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Instantiate the handler for a resolved protocol.
pub fn handler_for(kind: ProtocolKind, encoding: Option<TextEncoding>) -> Box<dyn WireProtocol> {
    match kind {
        ProtocolKind::Astm => Box::new(AstmHandler::new(encoding)),
        ProtocolKind::Hl7 => Box::new(Hl7Handler::new(encoding)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_table() {
        assert_eq!(detect(0x05), Some(ProtocolKind::Astm)); // ENQ
        assert_eq!(detect(0x02), Some(ProtocolKind::Astm)); // STX
        assert_eq!(detect(0x0B), Some(ProtocolKind::Hl7)); // VT
        assert_eq!(detect(b'M'), None);
        assert_eq!(detect(0x00), None);
    }
}
