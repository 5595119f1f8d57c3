//! Tag values of the ETSI TS 102 232-1 PSHeader that the stream code keys
//! on, plus helpers for recognising string-carrying tags in raw bytes.

/// Outer `PS-PDU` SEQUENCE.
pub const PS_PDU: u8 = 0x30;
/// `pSHeader [1]` inside the PS-PDU.
pub const PS_HEADER: u8 = 0xa1;
/// `lawfulInterceptionIdentifier [1]`, counted as the generic string.
pub const LI_IDENTIFIER: u16 = 0x81;
/// `authorizationCountryCode [2]`.
pub const AUTH_COUNTRY_CODE: u16 = 0x82;
/// `communicationIdentifier [3]`, constructed.
pub const COMMUNICATION_ID: u8 = 0xa3;
/// `sequenceNumber [4]`.
pub const SEQUENCE_NUMBER: u8 = 0x84;
/// `timeStamp [5]`, GeneralizedTime.
pub const GENERALIZED_TIME: u8 = 0x85;
/// `interceptionPointID [6]`, the canonical stream identifier.
pub const INTERCEPTION_POINT_ID: u16 = 0x86;
/// `microSecondTimeStamp [7]`, constructed.
pub const MICROSECOND_TIMESTAMP: u8 = 0xa7;
/// `seconds [0]` inside the microsecond timestamp.
pub const TS_SECONDS: u8 = 0x80;
/// `microSeconds [1]` inside the microsecond timestamp.
pub const TS_MICROSECONDS: u8 = 0x81;
/// `timeStampQualifier [8]`.
pub const TIMESTAMP_QUALIFIER: u8 = 0x88;

/// Low five bits of a tag byte that announce a second tag byte.
pub const LONG_FORM_MARKER: u8 = 0x1f;
/// Constructed ("set") bit of a tag byte.
pub const CONSTRUCTED: u8 = 0x20;

/// Bytes that may carry a character string: CR, LF and 0x20..=0x7e.
#[inline]
pub fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\r' || b == b'\n'
}

#[inline]
pub fn all_printable(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|&b| is_printable(b))
}

/// Single-byte tags that can introduce a string value: universal octet
/// string, OID, object descriptor and PrintableString, and every primitive
/// context-class tag.
#[inline]
pub fn is_string_tag(b: u8) -> bool {
    matches!(b, 0x04 | 0x06 | 0x07 | 0x13) || (0x80..=0x9e).contains(&b)
}

/// Decode a string-carrying tag at `data[pos..]`.
///
/// Returns the tag value and its encoded size: one byte, or two for the
/// long form `0x9f nn` with `nn` below 0x80.
pub fn string_tag_at(data: &[u8], pos: usize) -> Option<(u16, usize)> {
    let b0 = *data.get(pos)?;
    if b0 == 0x80 | LONG_FORM_MARKER {
        let b1 = *data.get(pos + 1)?;
        if b1 < 0x80 {
            return Some((u16::from(b0) << 8 | u16::from(b1), 2));
        }
        return None;
    }
    if is_string_tag(b0) {
        Some((u16::from(b0), 1))
    } else {
        None
    }
}

/// Find the tag/length header in front of a string of `len` bytes at
/// `value_pos`. Returns the header start and the tag.
pub fn string_header_before(data: &[u8], value_pos: usize, len: usize) -> Option<(usize, u16)> {
    if len == 0 || len > 0x7f || value_pos < 2 || data.get(value_pos - 1) != Some(&(len as u8)) {
        return None;
    }
    if let Some((tag, 1)) = string_tag_at(data, value_pos - 2) {
        return Some((value_pos - 2, tag));
    }
    if value_pos >= 3 {
        if let Some((tag, 2)) = string_tag_at(data, value_pos - 3) {
            return Some((value_pos - 3, tag));
        }
    }
    None
}
