//! ASTM E1381 / LIS1-A low-level protocol handler
//!
//! Session shape: the instrument opens with ENQ, we answer ACK, frames
//! follow, and EOT concludes the logical message. Each frame is
//! `<STX> seq text <ETB|ETX> c1 c2 <CR> <LF>` with a one-digit sequence
//! number (0–7, wrapping), ETB marking an intermediate frame and ETX the
//! final frame of a transmission unit, and a two-hex-digit modulo-256
//! checksum over the bytes between STX and the checksum field. A logical
//! message may span several ETX-terminated units; it is emitted only when
//! EOT arrives.

use bytes::Buf;
use tracing::{debug, warn};

use crate::core::session::ConnectionSession;
use crate::protocols::{HandlerOutput, ProtocolKind, SessionNote, WireProtocol};
use crate::utils::checksum;
use crate::utils::decode::{self, TextEncoding};

pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const EOT: u8 = 0x04;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ETB: u8 = 0x17;
const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// Non-conforming sender pass-through patterns.
///
/// A few analyzer firmwares skip the low-level handshake and write their
/// record stream directly: either completely bare (`H|` header record) or
/// STX-wrapped but without sequence number and checksum. A unit matching
/// one of these literal prefixes bypasses frame validation for that unit
/// only and is taken verbatim up to the terminating EOT. This is a closed
/// exception table, not a relaxation of validation; extending it is a
/// deliberate code change.
const PASSTHROUGH_PREFIXES: &[&[u8]] = &[b"H|", b"\x02H|"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Establishing,
    InTransfer,
    /// Inside a non-conforming pass-through unit
    Passthrough,
}

/// Handler state for one connection. Reset with the session.
pub struct AstmHandler {
    phase: Phase,
    /// Next expected frame sequence. `None` until the first frame of a
    /// session is accepted: the first frame adopts whatever sequence it
    /// carries as the baseline. Deliberate leniency: analyzers that do
    /// not reset numbering between messages would otherwise be rejected.
    expected_seq: Option<u8>,
    /// Accepted frame payloads awaiting end-of-transmission
    frames: Vec<Vec<u8>>,
    encoding: Option<TextEncoding>,
}

impl AstmHandler {
    pub fn new(encoding: Option<TextEncoding>) -> Self {
        Self {
            phase: Phase::Idle,
            expected_seq: None,
            frames: Vec::new(),
            encoding,
        }
    }

    fn on_enq(&mut self, out: &mut HandlerOutput) {
        if self.phase == Phase::InTransfer && !self.frames.is_empty() {
            debug!("ENQ during transfer, restarting session");
            self.frames.clear();
            self.expected_seq = None;
        }
        self.phase = Phase::Establishing;
        out.reply.push(ACK);
        out.notes.push(SessionNote::TransferStarted);
    }

    fn on_eot(&mut self, out: &mut HandlerOutput) {
        if self.phase != Phase::Idle || !self.frames.is_empty() {
            out.notes.push(SessionNote::TransferEnded);
        }
        if !self.frames.is_empty() {
            let total: usize = self.frames.iter().map(Vec::len).sum();
            let mut text = Vec::with_capacity(total);
            for payload in self.frames.drain(..) {
                text.extend_from_slice(&payload);
            }
            out.messages.push(self.decode_text(&text));
        }
        // EOT carries no payload to checksum and gets no acknowledgment
        self.phase = Phase::Idle;
        self.expected_seq = None;
    }

    /// Parse one frame starting at `session.buffer[0] == STX`.
    ///
    /// Returns false when the frame is not yet complete in the buffer.
    fn on_frame(&mut self, session: &mut ConnectionSession, out: &mut HandlerOutput) -> bool {
        let buf = &session.buffer[..];
        // Terminator search starts past STX and the sequence byte; the
        // frame text itself can never contain ETB or ETX.
        let Some(rel) = buf.iter().skip(2).position(|&b| b == ETB || b == ETX) else {
            return false;
        };
        let term_idx = rel + 2;
        // Terminator, two checksum characters; CR LF trail is consumed
        // separately as inter-frame filler.
        if buf.len() < term_idx + 3 {
            return false;
        }

        let seq_byte = buf[1];
        let terminator = buf[term_idx];
        let checked = &buf[1..=term_idx];
        let claimed = &buf[term_idx + 1..term_idx + 3];
        let checksum_ok = checksum::verify(checked, claimed);
        let payload = buf[2..term_idx].to_vec();
        session.buffer.advance(term_idx + 3);

        if !checksum_ok {
            // Sender is expected to resend the same frame; sequence state
            // is deliberately left untouched.
            debug!("frame checksum mismatch, NAK");
            out.reply.push(NAK);
            return true;
        }

        if !(b'0'..=b'7').contains(&seq_byte) {
            debug!("invalid frame sequence byte 0x{:02X}, NAK", seq_byte);
            out.reply.push(NAK);
            return true;
        }
        let seq = seq_byte - b'0';

        match self.expected_seq {
            // First frame of the session adopts its carried sequence
            None => {}
            Some(expected) if seq == expected => {}
            Some(expected) => {
                debug!("frame sequence {} but expected {}, NAK", seq, expected);
                out.reply.push(NAK);
                return true;
            }
        }

        if self.phase == Phase::Idle {
            // Frame without a preceding ENQ: implicit session start,
            // consistent with auto-detection admitting STX lead bytes.
            out.notes.push(SessionNote::TransferStarted);
        }
        self.phase = Phase::InTransfer;
        self.expected_seq = Some((seq + 1) % 8);
        self.frames.push(payload);
        out.reply.push(ACK);

        if terminator == ETX {
            // Transmission unit complete; the logical message still waits
            // for EOT, which may follow further units.
            debug!("final frame of unit accepted ({} so far)", self.frames.len());
        }
        true
    }

    /// Emit a pass-through unit once its terminating EOT has arrived.
    ///
    /// Returns false while the unit is still incomplete.
    fn on_passthrough(&mut self, session: &mut ConnectionSession, out: &mut HandlerOutput) -> bool {
        let Some(eot_idx) = session.buffer.iter().position(|&b| b == EOT) else {
            return false;
        };
        let unit = session.buffer.split_to(eot_idx);
        session.buffer.advance(1);
        warn!("non-conforming sender unit passed through unvalidated");
        out.messages.push(self.decode_text(&unit));
        out.notes.push(SessionNote::TransferEnded);
        self.phase = Phase::Idle;
        true
    }

    fn decode_text(&self, bytes: &[u8]) -> String {
        let decoded = decode::decode(bytes, self.encoding);
        if decoded.lossy {
            warn!("message text decoded lossily");
        }
        decoded.text
    }

    /// Pass-through table lookup for a unit beginning at the buffer start.
    /// `Pending` means too few bytes to decide yet.
    fn passthrough_check(buf: &[u8]) -> PassthroughCheck {
        for pattern in PASSTHROUGH_PREFIXES {
            if buf.len() >= pattern.len() {
                if buf.starts_with(pattern) {
                    return PassthroughCheck::Matched;
                }
            } else if pattern.starts_with(buf) {
                return PassthroughCheck::Pending;
            }
        }
        PassthroughCheck::NoMatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassthroughCheck {
    Matched,
    Pending,
    NoMatch,
}

impl WireProtocol for AstmHandler {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Astm
    }

    fn on_bytes(&mut self, session: &mut ConnectionSession) -> HandlerOutput {
        let mut out = HandlerOutput::default();

        loop {
            if session.buffer.is_empty() {
                break;
            }

            if self.phase == Phase::Passthrough {
                if self.on_passthrough(session, &mut out) {
                    continue;
                }
                break;
            }

            if self.phase == Phase::Idle {
                match Self::passthrough_check(&session.buffer[..]) {
                    PassthroughCheck::Matched => {
                        self.phase = Phase::Passthrough;
                        out.notes.push(SessionNote::TransferStarted);
                        continue;
                    }
                    PassthroughCheck::Pending => break,
                    PassthroughCheck::NoMatch => {}
                }
            }

            match session.buffer[0] {
                ENQ => {
                    session.buffer.advance(1);
                    self.on_enq(&mut out);
                }
                EOT => {
                    session.buffer.advance(1);
                    self.on_eot(&mut out);
                }
                STX => {
                    if !self.on_frame(session, &mut out) {
                        break; // incomplete frame, wait for more bytes
                    }
                }
                other => {
                    // Inter-frame filler (CR LF trails) and line noise
                    debug!("discarding unexpected byte 0x{:02X}", other);
                    session.buffer.advance(1);
                }
            }
        }

        out
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.expected_seq = None;
        self.frames.clear();
    }

    fn abort_reply(&self) -> Vec<u8> {
        vec![NAK]
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

    fn feed(handler: &mut AstmHandler, session: &mut ConnectionSession, data: &[u8]) -> HandlerOutput {
        session.push(data, Instant::now());
        handler.on_bytes(session)
    }

    fn frame(seq: u8, text: &[u8], last: bool) -> Vec<u8> {
        let mut body = vec![b'0' + seq];
        body.extend_from_slice(text);
        body.push(if last { ETX } else { ETB });
        let cc = checksum::compute(&body);
        let mut bytes = vec![STX];
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&cc);
        bytes.extend_from_slice(&[CR, LF]);
        bytes
    }

    #[tokio::test]
    async fn test_enq_gets_ack() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        let out = feed(&mut handler, &mut session, &[ENQ]);
        assert_eq!(out.reply, vec![ACK]);
        assert!(out.messages.is_empty());
        assert_eq!(out.notes, vec![SessionNote::TransferStarted]);
    }

    #[tokio::test]
    async fn test_multi_frame_reassembly_round_trip() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();

        feed(&mut handler, &mut session, &[ENQ]);
        let out = feed(&mut handler, &mut session, &frame(1, b"H|\\^&|||c311\r", false));
        assert_eq!(out.reply, vec![ACK]);
        let out = feed(&mut handler, &mut session, &frame(2, b"R|1|^^^GLU|105|mg/dL\r", false));
        assert_eq!(out.reply, vec![ACK]);
        let out = feed(&mut handler, &mut session, &frame(3, b"L|1|N\r", true));
        assert_eq!(out.reply, vec![ACK]);

        // Nothing is emitted until end-of-transmission
        assert!(out.messages.is_empty());

        let out = feed(&mut handler, &mut session, &[EOT]);
        assert!(out.reply.is_empty());
        assert_eq!(out.messages.len(), 1);
        assert_eq!(
            out.messages[0],
            "H|\\^&|||c311\rR|1|^^^GLU|105|mg/dL\rL|1|N\r"
        );
        assert_eq!(out.notes, vec![SessionNote::TransferEnded]);
    }

    #[tokio::test]
    async fn test_message_spanning_two_units() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();

        feed(&mut handler, &mut session, &[ENQ]);
        feed(&mut handler, &mut session, &frame(1, b"part-one;", true));
        feed(&mut handler, &mut session, &frame(2, b"part-two", true));
        let out = feed(&mut handler, &mut session, &[EOT]);
        assert_eq!(out.messages, vec!["part-one;part-two".to_string()]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_naks_without_advancing_sequence() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);
        feed(&mut handler, &mut session, &frame(1, b"first\r", false));

        let mut bad = frame(2, b"second\r", false);
        let cc_idx = bad.len() - 4;
        bad[cc_idx] = if bad[cc_idx] == b'0' { b'1' } else { b'0' };
        let out = feed(&mut handler, &mut session, &bad);
        assert_eq!(out.reply, vec![NAK]);

        // The resent frame with the same sequence number is accepted
        let out = feed(&mut handler, &mut session, &frame(2, b"second\r", true));
        assert_eq!(out.reply, vec![ACK]);
        let out = feed(&mut handler, &mut session, &[EOT]);
        assert_eq!(out.messages, vec!["first\rsecond\r".to_string()]);
    }

    #[tokio::test]
    async fn test_sequence_wraparound() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);

        // 0..=7 then wrapping back to 0 are all accepted in order
        for seq in [0u8, 1, 2, 3, 4, 5, 6, 7, 0, 1] {
            let out = feed(&mut handler, &mut session, &frame(seq, b"x", false));
            assert_eq!(out.reply, vec![ACK], "sequence {} should be accepted", seq);
        }
    }

    #[tokio::test]
    async fn test_sequence_skip_rejected_without_advancing() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);
        feed(&mut handler, &mut session, &frame(1, b"a", false));

        // (prev + 2) mod 8 must be refused
        let out = feed(&mut handler, &mut session, &frame(3, b"b", false));
        assert_eq!(out.reply, vec![NAK]);

        // Expectation did not advance: 2 is still the only acceptable next
        let out = feed(&mut handler, &mut session, &frame(2, b"b", false));
        assert_eq!(out.reply, vec![ACK]);
    }

    #[tokio::test]
    async fn test_first_frame_any_sequence_adopted() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);

        // Baseline is whatever the first frame carries, not a fixed value
        let out = feed(&mut handler, &mut session, &frame(5, b"a", false));
        assert_eq!(out.reply, vec![ACK]);
        let out = feed(&mut handler, &mut session, &frame(6, b"b", false));
        assert_eq!(out.reply, vec![ACK]);
    }

    #[tokio::test]
    async fn test_lowercase_checksum_accepted() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);

        let mut f = frame(1, b"m", true);
        let len = f.len();
        f[len - 4] = f[len - 4].to_ascii_lowercase();
        f[len - 3] = f[len - 3].to_ascii_lowercase();
        let out = feed(&mut handler, &mut session, &f);
        assert_eq!(out.reply, vec![ACK]);
    }

    #[tokio::test]
    async fn test_partial_frame_across_reads() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);

        let f = frame(1, b"split-me\r", true);
        let (head, tail) = f.split_at(5);
        let out = feed(&mut handler, &mut session, head);
        assert!(out.reply.is_empty());

        let out = feed(&mut handler, &mut session, tail);
        assert_eq!(out.reply, vec![ACK]);
    }

    #[tokio::test]
    async fn test_frame_without_enq_is_implicit_start() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        let out = feed(&mut handler, &mut session, &frame(1, b"no-handshake\r", true));
        assert_eq!(out.reply, vec![ACK]);
        assert_eq!(out.notes, vec![SessionNote::TransferStarted]);

        let out = feed(&mut handler, &mut session, &[EOT]);
        assert_eq!(out.messages, vec!["no-handshake\r".to_string()]);
    }

    #[tokio::test]
    async fn test_eot_without_frames_emits_nothing() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        let out = feed(&mut handler, &mut session, &[EOT]);
        assert!(out.messages.is_empty());
        assert!(out.reply.is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_bare_header_record() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        let mut data = b"H|\\^&|||quirky|||||||P|1\rL|1|N\r".to_vec();
        data.push(EOT);

        let out = feed(&mut handler, &mut session, &data);
        assert!(out.reply.is_empty());
        assert_eq!(
            out.messages,
            vec!["H|\\^&|||quirky|||||||P|1\rL|1|N\r".to_string()]
        );
    }

    #[tokio::test]
    async fn test_passthrough_only_for_that_unit() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        let mut data = b"H|bare\r".to_vec();
        data.push(EOT);
        feed(&mut handler, &mut session, &data);

        // The next unit is validated strictly again
        feed(&mut handler, &mut session, &[ENQ]);
        let out = feed(&mut handler, &mut session, &frame(1, b"strict\r", true));
        assert_eq!(out.reply, vec![ACK]);
        let out = feed(&mut handler, &mut session, &[EOT]);
        assert_eq!(out.messages, vec!["strict\r".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_clears_transfer_state() {
        let mut handler = AstmHandler::new(None);
        let mut session = session();
        feed(&mut handler, &mut session, &[ENQ]);
        feed(&mut handler, &mut session, &frame(4, b"stale", false));

        handler.reset();
        session.reset();

        // A fresh session adopts a fresh baseline
        feed(&mut handler, &mut session, &[ENQ]);
        let out = feed(&mut handler, &mut session, &frame(0, b"fresh", true));
        assert_eq!(out.reply, vec![ACK]);
        let out = feed(&mut handler, &mut session, &[EOT]);
        assert_eq!(out.messages, vec!["fresh".to_string()]);
    }
}
