//! HL7 v2 over MLLP handler
//!
//! Envelope: `<VT> message <FS> <CR>`. One envelope is one logical
//! message; a single read may carry several envelopes back to back, each
//! processed independently and in order. The field/component/repeat/
//! escape/subcomponent separators are declared by the MSH segment at
//! fixed offsets and are re-derived for every message, since a sender may
//! vary them. The acknowledgment is a synthesized minimal MSH+MSA pair that
//! echoes the sender's own separators and MSH-10 control id.

use bytes::Buf;
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::session::ConnectionSession;
use crate::protocols::{HandlerOutput, ProtocolKind, SessionNote, WireProtocol};
use crate::utils::decode::{self, TextEncoding};

pub const VT: u8 = 0x0B;
pub const FS: u8 = 0x1C;
const CR: u8 = 0x0D;

const SEGMENT_TAG: &str = "MSH";

/// Separator set declared by one message's MSH segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separators {
    pub field: char,
    pub component: char,
    pub repeat: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Separators {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repeat: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Separators {
    /// Derive the separator set from an MSH segment: the field separator
    /// sits directly after the segment tag, followed by the encoding
    /// characters. Missing encoding characters fall back to the standard
    /// set.
    fn from_msh(segment: &str) -> Option<Self> {
        if !segment.starts_with(SEGMENT_TAG) {
            return None;
        }
        let tail: Vec<char> = segment.chars().skip(SEGMENT_TAG.len()).collect();
        let field = *tail.first()?;
        let defaults = Separators::default();
        let enc: Vec<char> = tail[1..]
            .iter()
            .copied()
            .take_while(|&c| c != field)
            .take(4)
            .collect();
        Some(Self {
            field,
            component: enc.first().copied().unwrap_or(defaults.component),
            repeat: enc.get(1).copied().unwrap_or(defaults.repeat),
            escape: enc.get(2).copied().unwrap_or(defaults.escape),
            subcomponent: enc.get(3).copied().unwrap_or(defaults.subcomponent),
        })
    }

    fn encoding_chars(&self) -> String {
        let mut s = String::with_capacity(4);
        s.push(self.component);
        s.push(self.repeat);
        s.push(self.escape);
        s.push(self.subcomponent);
        s
    }
}

/// Handler state for one connection. The block protocol is stateless
/// between envelopes; only the decode preference persists.
pub struct Hl7Handler {
    encoding: Option<TextEncoding>,
}

impl Hl7Handler {
    pub fn new(encoding: Option<TextEncoding>) -> Self {
        Self { encoding }
    }

    /// Process one complete envelope's text: emit the message and build
    /// the acknowledgment. A message without a parseable MSH header gets
    /// no acknowledgment (there is nothing to echo) and is dropped.
    fn on_envelope(&self, text: &str, out: &mut HandlerOutput) {
        let header = text.split('\r').next().unwrap_or(text);
        let Some(separators) = Separators::from_msh(header) else {
            warn!("envelope without MSH header dropped");
            return;
        };

        let fields: Vec<&str> = header.split(separators.field).collect();
        // MSH-1 is the separator itself, so MSH-10 lands at index 9
        let control_id = fields.get(9).copied().unwrap_or("");
        let sending_app = fields.get(2).copied().unwrap_or("");
        let sending_facility = fields.get(3).copied().unwrap_or("");
        let receiving_app = fields.get(4).copied().unwrap_or("");
        let receiving_facility = fields.get(5).copied().unwrap_or("");

        debug!(control_id, "HL7 envelope accepted");

        let ack = build_ack(
            &separators,
            receiving_app,
            receiving_facility,
            sending_app,
            sending_facility,
            control_id,
        );
        out.reply.push(VT);
        out.reply.extend_from_slice(ack.as_bytes());
        out.reply.push(FS);
        out.reply.push(CR);

        out.messages.push(text.to_owned());
        out.notes.push(SessionNote::TransferEnded);
    }
}

/// Synthesize the minimal acknowledgment message: an MSH segment with the
/// sender/receiver roles swapped and an MSA segment carrying the echoed
/// control id. Built with the sender's own separator set, not ours.
fn build_ack(
    sep: &Separators,
    sending_app: &str,
    sending_facility: &str,
    receiving_app: &str,
    receiving_facility: &str,
    control_id: &str,
) -> String {
    let f = sep.field;
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    format!(
        "MSH{f}{enc}{f}{sending_app}{f}{sending_facility}{f}{receiving_app}{f}\
         {receiving_facility}{f}{timestamp}{f}{f}ACK{f}{control_id}{f}P{f}2.3.1\r\
         MSA{f}AA{f}{control_id}\r",
        enc = sep.encoding_chars(),
    )
}

impl WireProtocol for Hl7Handler {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Hl7
    }

    fn on_bytes(&mut self, session: &mut ConnectionSession) -> HandlerOutput {
        let mut out = HandlerOutput::default();

        loop {
            // Discard line noise ahead of the envelope start byte
            match session.buffer.iter().position(|&b| b == VT) {
                Some(0) => {}
                Some(skip) => {
                    debug!("discarding {} bytes before envelope start", skip);
                    session.buffer.advance(skip);
                }
                None => {
                    if !session.buffer.is_empty() {
                        debug!("discarding {} bytes of noise", session.buffer.len());
                        session.buffer.clear();
                    }
                    break;
                }
            }

            let Some(fs_idx) = session.buffer.iter().position(|&b| b == FS) else {
                break; // incomplete envelope, wait for more bytes
            };
            // The end byte must be immediately followed by CR; wait until
            // that trailing byte has arrived.
            if session.buffer.len() < fs_idx + 2 {
                break;
            }

            let envelope = session.buffer.split_to(fs_idx);
            if session.buffer[1] != CR {
                // Keep the offending byte: it may be the start of the
                // next envelope.
                session.buffer.advance(1);
                warn!("envelope end byte not followed by CR, dropped");
                continue;
            }
            session.buffer.advance(2);

            let decoded = decode::decode(&envelope[1..], self.encoding);
            if decoded.lossy {
                warn!("message text decoded lossily");
            }
            self.on_envelope(&decoded.text, &mut out);
        }

        out
    }

    fn reset(&mut self) {
        // No inter-envelope state to discard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineLimits;
    use tokio::time::Instant;

    fn session() -> ConnectionSession {
        ConnectionSession::new(EngineLimits::default())
    }

    fn feed(handler: &mut Hl7Handler, session: &mut ConnectionSession, data: &[u8]) -> HandlerOutput {
        session.push(data, Instant::now());
        handler.on_bytes(session)
    }

    fn envelope(text: &str) -> Vec<u8> {
        let mut bytes = vec![VT];
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(FS);
        bytes.push(CR);
        bytes
    }

    const ORU: &str = "MSH|^~\\&|c6000|lab|lis|central|20240101120000||ORU^R01|MSG123|P|2.3.1\r\
                       OBX|1|NM|GLU||105|mg/dL|||||F\r";

    #[tokio::test]
    async fn test_single_envelope_emits_message_and_ack() {
        let mut handler = Hl7Handler::new(None);
        let mut session = session();
        let out = feed(&mut handler, &mut session, &envelope(ORU));

        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].starts_with("MSH|^~\\&|c6000"));

        // ACK is wrapped in the same envelope markers
        assert_eq!(out.reply.first(), Some(&VT));
        assert_eq!(out.reply[out.reply.len() - 2], FS);
        assert_eq!(out.reply[out.reply.len() - 1], CR);

        let ack = String::from_utf8_lossy(&out.reply[1..out.reply.len() - 2]).into_owned();
        assert!(ack.starts_with("MSH|^~\\&|"));
        assert!(ack.contains("|ACK|MSG123|"));
        assert!(ack.contains("MSA|AA|MSG123"));
        // Sender and receiver roles are swapped in the echo
        assert!(ack.contains("|lis|central|c6000|lab|"));
    }

    #[tokio::test]
    async fn test_ack_echoes_custom_separators() {
        let mut handler = Hl7Handler::new(None);
        let mut session = session();
        let text = "MSH#*+?'#app#fac#lis#hub#20240101##ORU^R01#CTRL-9#P#2.3.1\r";
        let out = feed(&mut handler, &mut session, &envelope(text));

        let ack = String::from_utf8_lossy(&out.reply).into_owned();
        assert!(ack.contains("MSH#*+?'#"));
        assert!(ack.contains("MSA#AA#CTRL-9"));
    }

    #[tokio::test]
    async fn test_two_envelopes_in_one_read() {
        let mut handler = Hl7Handler::new(None);
        let mut session = session();

        let second = "MSH|^~\\&|c6000|lab|lis|central|20240101120001||ORU^R01|MSG124|P|2.3.1\r";
        let mut data = envelope(ORU);
        data.extend_from_slice(&envelope(second));

        let out = feed(&mut handler, &mut session, &data);
        assert_eq!(out.messages.len(), 2);
        assert!(out.messages[0].contains("MSG123"));
        assert!(out.messages[1].contains("MSG124"));

        // Two acknowledgments, in order
        let replies = String::from_utf8_lossy(&out.reply).into_owned();
        let first_idx = replies.find("MSA|AA|MSG123").expect("first ack present");
        let second_idx = replies.find("MSA|AA|MSG124").expect("second ack present");
        assert!(first_idx < second_idx);
    }

    #[tokio::test]
    async fn test_partial_envelope_across_reads() {
        let mut handler = Hl7Handler::new(None);
        let mut session = session();

        let data = envelope(ORU);
        let (head, tail) = data.split_at(20);
        let out = feed(&mut handler, &mut session, head);
        assert!(out.messages.is_empty());
        assert!(out.reply.is_empty());

        let out = feed(&mut handler, &mut session, tail);
        assert_eq!(out.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_noise_before_envelope_discarded() {
        let mut handler = Hl7Handler::new(None);
        let mut session = session();

        let mut data = b"\r\n\r\n".to_vec();
        data.extend_from_slice(&envelope(ORU));
        let out = feed(&mut handler, &mut session, &data);
        assert_eq!(out.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_envelope_without_msh_dropped() {
        let mut handler = Hl7Handler::new(None);
        let mut session = session();
        let out = feed(&mut handler, &mut session, &envelope("PID|1|notahl7header\r"));
        assert!(out.messages.is_empty());
        assert!(out.reply.is_empty());
    }

    #[tokio::test]
    async fn test_separator_derivation_defaults_for_short_msh() {
        let sep = Separators::from_msh("MSH|^~\\&|x").expect("standard header parses");
        assert_eq!(sep.field, '|');
        assert_eq!(sep.component, '^');
        assert_eq!(sep.subcomponent, '&');

        // Truncated encoding characters fall back to the standard set
        let sep = Separators::from_msh("MSH|^|x").expect("short header parses");
        assert_eq!(sep.component, '^');
        assert_eq!(sep.repeat, '~');

        assert!(Separators::from_msh("PID|1").is_none());
        assert!(Separators::from_msh("MSH").is_none());
    }
}
