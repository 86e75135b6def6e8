// APDU framing and parsing per ISO 7816-4, cases 1-4, short and extended.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Largest command frame: extended header (7) + max Lc (65 535) + extended Le (2).
pub const MAX_COMMAND_LEN: usize = 7 + 65_535 + 2;

/// Largest response frame: extended Le max (65 536) + two status bytes.
pub const MAX_RESPONSE_LEN: usize = 65_536 + 2;

/// Common status words.
pub mod sw {
    pub const SUCCESS: (u8, u8) = (0x90, 0x00);
    pub const WRONG_LENGTH: (u8, u8) = (0x67, 0x00);
    pub const SECURITY_STATUS: (u8, u8) = (0x69, 0x82);
    pub const WRONG_DATA: (u8, u8) = (0x6A, 0x80);
    pub const FILE_NOT_FOUND: (u8, u8) = (0x6A, 0x82);
    pub const WRONG_P1P2: (u8, u8) = (0x6A, 0x86);
    pub const INS_NOT_SUPPORTED: (u8, u8) = (0x6D, 0x00);
    pub const CLA_NOT_SUPPORTED: (u8, u8) = (0x6E, 0x00);
}

/// Common instruction bytes.
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const UPDATE_BINARY: u8 = 0xD6;
    pub const GET_RESPONSE: u8 = 0xC0;
}

/// Error produced while parsing a frame out of a byte view.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApduError {
    /// Fewer bytes than the structure requires.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Bytes left over after a structurally complete frame.
    #[error("{0} trailing bytes after complete frame")]
    TrailingBytes(usize),

    /// A zero or inconsistent length field.
    #[error("inconsistent length encoding")]
    LengthMismatch,

    /// Frame exceeds the hard size ceiling.
    #[error("frame length {0} exceeds maximum")]
    Oversized(usize),
}

/// Reason a frame or fragment was judged malformed by the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingFault {
    /// Idle boundary reached with fewer than four header bytes.
    ShortHeader,
    /// Instruction byte 0x00 or 0xFF.
    BadInstruction,
    /// Class byte with the reserved low nibble 0xF.
    ReservedClass,
    /// Length fields inconsistent with the buffered bytes.
    LengthMismatch,
    /// Trailing XOR checksum did not match the frame bytes.
    ChecksumMismatch,
    /// Response flushed at the idle boundary without SW1 SW2.
    MissingStatus,
}

impl FramingFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            FramingFault::ShortHeader => "short_header",
            FramingFault::BadInstruction => "bad_instruction",
            FramingFault::ReservedClass => "reserved_class",
            FramingFault::LengthMismatch => "length_mismatch",
            FramingFault::ChecksumMismatch => "checksum_mismatch",
            FramingFault::MissingStatus => "missing_status",
        }
    }
}

impl fmt::Display for FramingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completeness check over buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough bytes to decide; keep reading.
    NeedMore,
    /// A complete frame occupies the first `n` buffered bytes.
    Complete(usize),
    /// The buffered prefix cannot become a valid frame.
    Malformed(FramingFault),
}

/// ISO 7816-4 command classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduCase {
    /// Header only.
    Case1,
    /// Header + Le.
    Case2 { extended: bool },
    /// Header + Lc + data.
    Case3 { extended: bool },
    /// Header + Lc + data + Le.
    Case4 { extended: bool },
}

impl ApduCase {
    /// The case number, 1 through 4.
    pub fn number(&self) -> u8 {
        match self {
            ApduCase::Case1 => 1,
            ApduCase::Case2 { .. } => 2,
            ApduCase::Case3 { .. } => 3,
            ApduCase::Case4 { .. } => 4,
        }
    }

    /// True for the three-byte Lc / multi-byte Le encoding.
    pub fn is_extended(&self) -> bool {
        match self {
            ApduCase::Case1 => false,
            ApduCase::Case2 { extended }
            | ApduCase::Case3 { extended }
            | ApduCase::Case4 { extended } => *extended,
        }
    }
}

impl fmt::Display for ApduCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "case{}", self.number())?;
        if self.is_extended() {
            f.write_str("e")?;
        }
        Ok(())
    }
}

/// Opaque identifier pairing a command with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u32);

impl Fingerprint {
    /// Derives a fingerprint from the four mandatory header bytes.
    pub fn of(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self(u32::from_be_bytes([cla, ins, p1, p2]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A parsed command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduFrame {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Declared data length; `None` for cases 1 and 2.
    pub lc: Option<u16>,
    /// Command data; empty when `lc` is `None`.
    pub data: Bytes,
    /// Expected response length; short `0x00` decodes as 256, extended
    /// `0x0000` as 65 536.
    pub le: Option<u32>,
    pub case: ApduCase,
}

impl ApduFrame {
    /// Fingerprint over the mandatory header.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.cla, self.ins, self.p1, self.p2)
    }

    /// Structural self-consistency of the parsed fields.
    pub fn is_valid(&self) -> bool {
        match self.lc {
            Some(lc) => {
                if lc == 0 || self.data.len() != lc as usize {
                    return false;
                }
            }
            None => {
                if !self.data.is_empty() {
                    return false;
                }
            }
        }
        match self.le {
            Some(le) => {
                let max = if self.case.is_extended() { 65_536 } else { 256 };
                le >= 1 && le <= max
            }
            None => true,
        }
    }

    /// Total encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut len = 4;
        if let Some(lc) = self.lc {
            len += if self.case.is_extended() { 3 } else { 1 };
            len += lc as usize;
        }
        if self.le.is_some() {
            len += if self.case.is_extended() {
                if self.lc.is_some() {
                    2
                } else {
                    3
                }
            } else {
                1
            };
        }
        len
    }

    /// Serialises the frame back to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        let extended = self.case.is_extended();
        if let Some(lc) = self.lc {
            if extended {
                out.push(0x00);
                out.extend_from_slice(&lc.to_be_bytes());
            } else {
                out.push(lc as u8);
            }
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            if extended {
                let enc = if le == 65_536 { 0u16 } else { le as u16 };
                if self.lc.is_none() {
                    out.push(0x00);
                }
                out.extend_from_slice(&enc.to_be_bytes());
            } else {
                out.push(if le == 256 { 0x00 } else { le as u8 });
            }
        }
        out
    }
}

/// A parsed response APDU: opaque payload plus two status bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub payload: Bytes,
    pub sw1: u8,
    pub sw2: u8,
}

impl ResponseFrame {
    /// The combined status word.
    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// True for SW 0x9000.
    pub fn is_success(&self) -> bool {
        (self.sw1, self.sw2) == sw::SUCCESS
    }
}

/// Builds a response frame's wire bytes. Test and demo helper.
pub fn build_response(data: &[u8], sw1: u8, sw2: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.extend_from_slice(data);
    out.push(sw1);
    out.push(sw2);
    out
}

/// XOR of all bytes, as used by the ISO 14443-3 short-frame path.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Streaming frame-boundary detector.
///
/// The framer never consumes bytes itself; it judges whether the buffered
/// prefix holds a complete frame, needs more input, or can never become
/// one. Case 1/2 flushes and length-less responses are decided by the
/// caller-supplied `idle` flag (the inter-byte idle timeout elapsed).
#[derive(Debug, Clone)]
pub struct Framer {
    validate_headers: bool,
    verify_checksum: bool,
}

impl Framer {
    pub fn new(validate_headers: bool, verify_checksum: bool) -> Self {
        Self {
            validate_headers,
            verify_checksum,
        }
    }

    /// Extra trailing bytes each frame carries when checksums are enabled.
    pub fn trailer_len(&self) -> usize {
        usize::from(self.verify_checksum)
    }

    /// Verifies the advisory trailing checksum of a complete frame.
    ///
    /// Returns the fault without judging the frame undeliverable: the
    /// relay forwards the bytes verbatim either way.
    pub fn check_integrity(&self, frame: &[u8]) -> Result<(), FramingFault> {
        if !self.verify_checksum {
            return Ok(());
        }
        match frame.split_last() {
            Some((tail, body)) if *tail == xor_checksum(body) => Ok(()),
            _ => Err(FramingFault::ChecksumMismatch),
        }
    }

    /// Decides whether `buf` starts with a complete command frame.
    pub fn command_status(&self, buf: &[u8], idle: bool) -> FrameStatus {
        let t = self.trailer_len();
        if buf.is_empty() {
            return FrameStatus::NeedMore;
        }
        if buf.len() < 4 {
            return if idle {
                FrameStatus::Malformed(FramingFault::ShortHeader)
            } else {
                FrameStatus::NeedMore
            };
        }
        if self.validate_headers {
            if buf[1] == 0x00 || buf[1] == 0xFF {
                return FrameStatus::Malformed(FramingFault::BadInstruction);
            }
            if buf[0] & 0x0F == 0x0F {
                return FrameStatus::Malformed(FramingFault::ReservedClass);
            }
        }

        let ready = |len: usize| buf.len() >= len + t;
        let exactly = |len: usize| buf.len() == len + t;

        // Case 1: header only, confirmed by the idle boundary.
        if exactly(4) {
            return if idle {
                FrameStatus::Complete(4 + t)
            } else {
                FrameStatus::NeedMore
            };
        }
        if buf.len() < 5 {
            // Only possible while waiting on the checksum trailer.
            return FrameStatus::NeedMore;
        }

        let b4 = buf[4] as usize;
        if b4 != 0 {
            // Short form. Candidates, longest first: Case 4, Case 3, Case 2.
            let lc = b4;
            if ready(5 + lc + 1) {
                return FrameStatus::Complete(5 + lc + 1 + t);
            }
            if exactly(5 + lc) && idle {
                return FrameStatus::Complete(5 + lc + t);
            }
            if exactly(5) && idle {
                return FrameStatus::Complete(5 + t);
            }
            return if idle {
                FrameStatus::Malformed(FramingFault::LengthMismatch)
            } else {
                FrameStatus::NeedMore
            };
        }

        // byte 5 == 0x00: Case 2 short with Le = 256, or extended form.
        if exactly(5) {
            return if idle {
                FrameStatus::Complete(5 + t)
            } else {
                FrameStatus::NeedMore
            };
        }
        if buf.len() < 7 {
            return if idle {
                FrameStatus::Malformed(FramingFault::LengthMismatch)
            } else {
                FrameStatus::NeedMore
            };
        }

        let lc = (buf[5] as usize) << 8 | buf[6] as usize;
        if lc == 0 {
            // `00 00 00` after the header is Case 2 extended (Le = 65 536).
            // Any trailing data contradicts the zero length field.
            return if exactly(7) {
                if idle {
                    FrameStatus::Complete(7 + t)
                } else {
                    FrameStatus::NeedMore
                }
            } else {
                FrameStatus::Malformed(FramingFault::LengthMismatch)
            };
        }
        if ready(7 + lc + 2) {
            return FrameStatus::Complete(7 + lc + 2 + t);
        }
        if exactly(7 + lc) && idle {
            return FrameStatus::Complete(7 + lc + t);
        }
        if exactly(7) && idle {
            // The two length bytes were an extended Le after all.
            return FrameStatus::Complete(7 + t);
        }
        if idle {
            FrameStatus::Malformed(FramingFault::LengthMismatch)
        } else {
            FrameStatus::NeedMore
        }
    }

    /// Decides whether `buf` starts with a complete response frame.
    ///
    /// `expected` carries the paired command's Le when known; the frame is
    /// then `Le + 2` status bytes. Without it the idle boundary terminates
    /// the frame, bounded by [`MAX_RESPONSE_LEN`].
    pub fn response_status(&self, buf: &[u8], expected: Option<u32>, idle: bool) -> FrameStatus {
        let t = self.trailer_len();
        if buf.is_empty() {
            return FrameStatus::NeedMore;
        }
        if let Some(le) = expected {
            let want = le as usize + 2 + t;
            if buf.len() >= want {
                return FrameStatus::Complete(want);
            }
        }
        if buf.len() >= MAX_RESPONSE_LEN + t {
            return FrameStatus::Complete(MAX_RESPONSE_LEN + t);
        }
        if idle {
            // Error responses are legal at any length >= 2 (SW1 SW2 only).
            if buf.len() >= 2 + t {
                FrameStatus::Complete(buf.len())
            } else {
                FrameStatus::Malformed(FramingFault::MissingStatus)
            }
        } else {
            FrameStatus::NeedMore
        }
    }
}

/// Parses one complete command frame occupying the whole buffer.
pub fn parse_command(buf: &[u8]) -> Result<ApduFrame, ApduError> {
    let n = buf.len();
    if n < 4 {
        return Err(ApduError::BufferTooShort {
            expected: 4,
            actual: n,
        });
    }
    if n > MAX_COMMAND_LEN {
        return Err(ApduError::Oversized(n));
    }
    let (cla, ins, p1, p2) = (buf[0], buf[1], buf[2], buf[3]);
    let frame = |lc, data: &[u8], le, case| ApduFrame {
        cla,
        ins,
        p1,
        p2,
        lc,
        data: Bytes::copy_from_slice(data),
        le,
        case,
    };

    let rem = n - 4;
    if rem == 0 {
        return Ok(frame(None, &[], None, ApduCase::Case1));
    }
    if rem == 1 {
        let le = if buf[4] == 0 { 256 } else { buf[4] as u32 };
        return Ok(frame(None, &[], Some(le), ApduCase::Case2 { extended: false }));
    }

    if buf[4] != 0 {
        // Short Lc.
        let lc = buf[4] as usize;
        let data_end = 5 + lc;
        if n < data_end {
            return Err(ApduError::BufferTooShort {
                expected: data_end,
                actual: n,
            });
        }
        let data = &buf[5..data_end];
        return match n - data_end {
            0 => Ok(frame(
                Some(lc as u16),
                data,
                None,
                ApduCase::Case3 { extended: false },
            )),
            1 => {
                let b = buf[data_end];
                let le = if b == 0 { 256 } else { b as u32 };
                Ok(frame(
                    Some(lc as u16),
                    data,
                    Some(le),
                    ApduCase::Case4 { extended: false },
                ))
            }
            extra => Err(ApduError::TrailingBytes(extra - 1)),
        };
    }

    // byte 5 == 0x00: extended encodings.
    if rem == 3 {
        let raw = u16::from_be_bytes([buf[5], buf[6]]);
        let le = if raw == 0 { 65_536 } else { raw as u32 };
        return Ok(frame(None, &[], Some(le), ApduCase::Case2 { extended: true }));
    }
    if rem < 3 {
        return Err(ApduError::LengthMismatch);
    }
    let lc = u16::from_be_bytes([buf[5], buf[6]]) as usize;
    if lc == 0 {
        return Err(ApduError::LengthMismatch);
    }
    let data_end = 7 + lc;
    if n < data_end {
        return Err(ApduError::BufferTooShort {
            expected: data_end,
            actual: n,
        });
    }
    let data = &buf[7..data_end];
    match n - data_end {
        0 => Ok(frame(
            Some(lc as u16),
            data,
            None,
            ApduCase::Case3 { extended: true },
        )),
        2 => {
            let raw = u16::from_be_bytes([buf[data_end], buf[data_end + 1]]);
            let le = if raw == 0 { 65_536 } else { raw as u32 };
            Ok(frame(
                Some(lc as u16),
                data,
                Some(le),
                ApduCase::Case4 { extended: true },
            ))
        }
        _ => Err(ApduError::LengthMismatch),
    }
}

/// Parses one complete response frame occupying the whole buffer.
pub fn parse_response(buf: &[u8]) -> Result<ResponseFrame, ApduError> {
    let n = buf.len();
    if n < 2 {
        return Err(ApduError::BufferTooShort {
            expected: 2,
            actual: n,
        });
    }
    if n > MAX_RESPONSE_LEN {
        return Err(ApduError::Oversized(n));
    }
    Ok(ResponseFrame {
        payload: Bytes::copy_from_slice(&buf[..n - 2]),
        sw1: buf[n - 2],
        sw2: buf[n - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SELECT_AID: &[u8] = &[
        0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0x00,
    ];

    fn framer() -> Framer {
        Framer::new(true, false)
    }

    #[test]
    fn select_aid_is_case4_short() {
        assert_eq!(
            framer().command_status(SELECT_AID, false),
            FrameStatus::Complete(13)
        );
        let frame = parse_command(SELECT_AID).unwrap();
        assert_eq!(frame.case, ApduCase::Case4 { extended: false });
        assert_eq!(frame.lc, Some(7));
        assert_eq!(frame.le, Some(256));
        assert_eq!(frame.fingerprint(), Fingerprint::of(0x00, 0xA4, 0x04, 0x00));
        assert!(frame.is_valid());
        assert_eq!(frame.to_bytes(), SELECT_AID);
    }

    #[test]
    fn case1_requires_idle_boundary() {
        let hdr = [0x00, 0xA4, 0x04, 0x00];
        assert_eq!(framer().command_status(&hdr, false), FrameStatus::NeedMore);
        assert_eq!(framer().command_status(&hdr, true), FrameStatus::Complete(4));
        let frame = parse_command(&hdr).unwrap();
        assert_eq!(frame.case, ApduCase::Case1);
        assert!(frame.lc.is_none() && frame.le.is_none());
    }

    #[test]
    fn case2_short_le_zero_is_256() {
        let buf = [0x00, 0xB0, 0x00, 0x00, 0x00];
        assert_eq!(framer().command_status(&buf, true), FrameStatus::Complete(5));
        let frame = parse_command(&buf).unwrap();
        assert_eq!(frame.case, ApduCase::Case2 { extended: false });
        assert_eq!(frame.le, Some(256));
    }

    #[test]
    fn case3_flushes_on_idle_case4_on_surplus() {
        // Header + Lc=2 + data: complete as Case 3 only at the idle boundary.
        let case3 = [0x00, 0xD6, 0x00, 0x00, 0x02, 0xAA, 0xBB];
        assert_eq!(framer().command_status(&case3, false), FrameStatus::NeedMore);
        assert_eq!(
            framer().command_status(&case3, true),
            FrameStatus::Complete(7)
        );
        // One more byte present: taken as Le without waiting for idle.
        let case4 = [0x00, 0xD6, 0x00, 0x00, 0x02, 0xAA, 0xBB, 0x10];
        assert_eq!(
            framer().command_status(&case4, false),
            FrameStatus::Complete(8)
        );
        let frame = parse_command(&case4).unwrap();
        assert_eq!(frame.case, ApduCase::Case4 { extended: false });
        assert_eq!(frame.le, Some(0x10));
    }

    #[test]
    fn extended_max_lc_parses() {
        let mut buf = vec![0x00, 0xD6, 0x00, 0x00, 0x00, 0xFF, 0xFF];
        buf.extend(std::iter::repeat(0x5A).take(65_535));
        buf.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(
            framer().command_status(&buf, false),
            FrameStatus::Complete(buf.len())
        );
        let frame = parse_command(&buf).unwrap();
        assert_eq!(frame.case, ApduCase::Case4 { extended: true });
        assert_eq!(frame.lc, Some(65_535));
        assert_eq!(frame.data.len(), 65_535);
        assert_eq!(frame.le, Some(65_536));
        assert!(frame.is_valid());
    }

    #[test]
    fn extended_case2_on_idle() {
        let buf = [0x00, 0xB0, 0x00, 0x00, 0x00, 0x12, 0x34];
        assert_eq!(framer().command_status(&buf, false), FrameStatus::NeedMore);
        assert_eq!(framer().command_status(&buf, true), FrameStatus::Complete(7));
        let frame = parse_command(&buf).unwrap();
        assert_eq!(frame.case, ApduCase::Case2 { extended: true });
        assert_eq!(frame.le, Some(0x1234));
    }

    #[test]
    fn short_fragment_is_malformed_at_idle() {
        assert_eq!(
            framer().command_status(&[0xFF, 0xFF], false),
            FrameStatus::NeedMore
        );
        assert_eq!(
            framer().command_status(&[0xFF, 0xFF], true),
            FrameStatus::Malformed(FramingFault::ShortHeader)
        );
    }

    #[test]
    fn header_profile_rejections() {
        assert_eq!(
            framer().command_status(&[0x00, 0x00, 0x00, 0x00], true),
            FrameStatus::Malformed(FramingFault::BadInstruction)
        );
        assert_eq!(
            framer().command_status(&[0x0F, 0xA4, 0x00, 0x00], true),
            FrameStatus::Malformed(FramingFault::ReservedClass)
        );
        // Permissive framer accepts the same header.
        let lax = Framer::new(false, false);
        assert_eq!(
            lax.command_status(&[0x0F, 0xA4, 0x00, 0x00], true),
            FrameStatus::Complete(4)
        );
    }

    #[test]
    fn zero_extended_lc_with_trailing_data_is_malformed() {
        let buf = [0x00, 0xA4, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            framer().command_status(&buf, true),
            FrameStatus::Malformed(FramingFault::LengthMismatch)
        );
        assert!(parse_command(&buf).is_err());
    }

    #[test]
    fn response_with_le_hint_completes_without_idle() {
        let f = framer();
        let body = build_response(&[1, 2, 3, 4], 0x90, 0x00);
        assert_eq!(
            f.response_status(&body, Some(4), false),
            FrameStatus::Complete(6)
        );
        let r = parse_response(&body).unwrap();
        assert!(r.is_success());
        assert_eq!(r.payload.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(r.status_word(), 0x9000);
    }

    #[test]
    fn short_error_response_flushes_on_idle() {
        let f = framer();
        // Command expected 256 bytes; card answered 6A 82 only.
        assert_eq!(
            f.response_status(&[0x6A, 0x82], Some(256), false),
            FrameStatus::NeedMore
        );
        assert_eq!(
            f.response_status(&[0x6A, 0x82], Some(256), true),
            FrameStatus::Complete(2)
        );
        assert_eq!(
            f.response_status(&[0x6A], None, true),
            FrameStatus::Malformed(FramingFault::MissingStatus)
        );
    }

    #[test]
    fn checksum_trailer_verified_when_enabled() {
        let f = Framer::new(true, true);
        let mut buf = SELECT_AID.to_vec();
        buf.push(xor_checksum(SELECT_AID));
        assert_eq!(
            f.command_status(&buf, false),
            FrameStatus::Complete(SELECT_AID.len() + 1)
        );
        assert!(f.check_integrity(&buf).is_ok());
        *buf.last_mut().unwrap() ^= 0xFF;
        assert_eq!(
            f.check_integrity(&buf),
            Err(FramingFault::ChecksumMismatch)
        );
    }

    #[test]
    fn concatenated_frames_parse_one_by_one() {
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend_from_slice(SELECT_AID);
        }
        let f = framer();
        let mut seen = 0;
        let mut rest: &[u8] = &stream;
        while !rest.is_empty() {
            match f.command_status(rest, false) {
                FrameStatus::Complete(n) => {
                    assert_eq!(&rest[..n], SELECT_AID);
                    rest = &rest[n..];
                    seen += 1;
                }
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert_eq!(seen, 3);
    }

    proptest! {
        #[test]
        fn short_case4_roundtrip(
            cla in 0u8..=0xEF,
            p1: u8,
            p2: u8,
            data in prop::collection::vec(any::<u8>(), 1..=255),
            le in 1u32..=256,
        ) {
            prop_assume!(cla & 0x0F != 0x0F);
            let frame = ApduFrame {
                cla,
                ins: ins::SELECT,
                p1,
                p2,
                lc: Some(data.len() as u16),
                data: Bytes::from(data),
                le: Some(le),
                case: ApduCase::Case4 { extended: false },
            };
            prop_assert!(frame.is_valid());
            let bytes = frame.to_bytes();
            prop_assert_eq!(bytes.len(), frame.encoded_len());
            let parsed = parse_command(&bytes).unwrap();
            prop_assert_eq!(parsed, frame);
        }

        #[test]
        fn extended_case3_roundtrip(
            p1: u8,
            p2: u8,
            data in prop::collection::vec(any::<u8>(), 256..=2048),
        ) {
            let frame = ApduFrame {
                cla: 0x00,
                ins: ins::UPDATE_BINARY,
                p1,
                p2,
                lc: Some(data.len() as u16),
                data: Bytes::from(data),
                le: None,
                case: ApduCase::Case3 { extended: true },
            };
            let bytes = frame.to_bytes();
            let parsed = parse_command(&bytes).unwrap();
            prop_assert_eq!(parsed, frame);
        }

        #[test]
        fn parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = parse_command(&data);
            let _ = parse_response(&data);
            let _ = framer().command_status(&data, true);
            let _ = framer().command_status(&data, false);
        }
    }
}
