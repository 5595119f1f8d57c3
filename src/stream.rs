//! Per-stream HI3 record decoder.
//!
//! Each call consumes one TCP payload for a known stream. The stream's
//! identifier is located, the sequence number, microsecond timestamp and
//! qualifier around it are read, and the embedded CC packet is found by
//! checksum. Bytes that belong to a record cut short by a segment boundary
//! are kept on the stream and prepended to the next payload.

use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::checksum;
use crate::cursor::{be_u64, Cursor};
use crate::detect::find_bytes;
use crate::error::{Error, Result};
use crate::fields::read_length;
use crate::packet::PacketInspector;
use crate::registry::{StreamEntry, StreamHandle, StreamRegistry};
use crate::tags::{self, string_header_before};

/// Default distance from the payload end within which the unconsumed tail
/// is carried over instead of being resumed in place.
pub const CARRY_WINDOW: usize = 500;
/// How far in front of a canonical identifier the sequence number may start.
pub const SEQUENCE_LOOKBACK: usize = 11;
/// Longest INTEGER accepted: 8 value bytes plus a leading zero.
const MAX_INT_LEN: usize = 9;
/// Fields the substitute-form forward scan may step over.
const MAX_FORWARD_FIELDS: usize = 4;
const MAX_FORWARD_CONSTRUCTS: usize = 2;
/// How far in front of the identifier header the enclosing PS-PDU may start.
const PDU_LOOKBACK: usize = 160;

/// Items [`decode_stream`] attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub sequence_number: bool,
    pub timestamp: bool,
    pub timestamp_qualifier: bool,
    pub cc_packet: bool,
}

impl DecodeOptions {
    pub fn all() -> Self {
        Self { sequence_number: true, timestamp: true, timestamp_qualifier: true, cc_packet: true }
    }

    /// Header fields only, no CC extraction.
    pub fn header_only() -> Self {
        Self { cc_packet: false, ..Self::all() }
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u64,
    pub microseconds: u64,
}

/// Location of the extracted CC packet. The bytes themselves go to the
/// caller's output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcPacket {
    /// Tag of the DER field wrapping the packet, when one was found.
    pub tag: Option<u16>,
    pub length: u16,
    /// IP version, 4 or 6.
    pub version: u8,
}

/// Bitmask of the items found in one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoundItems(u8);

impl FoundItems {
    pub const SEQUENCE_NUMBER: u8 = 0x01;
    pub const INTERCEPT_POINT_ID: u8 = 0x02;
    pub const TIMESTAMP: u8 = 0x04;
    pub const TIMESTAMP_QUALIFIER: u8 = 0x08;
    pub const CC_PACKET: u8 = 0x10;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Fields decoded from one HI3 record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptRecord {
    /// Stream resume position after the call; non-zero means the same
    /// packet holds more and should be presented again.
    pub asn_index: usize,
    pub sequence_number: Option<u64>,
    pub interception_point_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub timestamp_qualifier: Option<u64>,
    pub cc_packet: Option<CcPacket>,
}

impl InterceptRecord {
    pub fn found(&self) -> FoundItems {
        let mut bits = 0u8;
        if self.sequence_number.is_some() {
            bits |= FoundItems::SEQUENCE_NUMBER;
        }
        if self.interception_point_id.is_some() {
            bits |= FoundItems::INTERCEPT_POINT_ID;
        }
        if self.timestamp.is_some() {
            bits |= FoundItems::TIMESTAMP;
        }
        if self.timestamp_qualifier.is_some() {
            bits |= FoundItems::TIMESTAMP_QUALIFIER;
        }
        if self.cc_packet.is_some() {
            bits |= FoundItems::CC_PACKET;
        }
        FoundItems(bits)
    }
}

/// Why a positional read stopped.
enum Fault {
    /// The buffer ended; the rest of the record is in a later segment.
    Truncated,
    Bad(Error),
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        match e {
            Error::BufferExceeded { .. } => Fault::Truncated,
            other => Fault::Bad(other),
        }
    }
}

type Step<T> = std::result::Result<T, Fault>;

/// Outcome of decoding from the resume position.
enum Outcome {
    /// A record was decoded; `next` is the first byte after it.
    Complete { next: usize, cc_len: usize },
    /// The identifier was found but the record runs past the buffer end.
    Incomplete { record_start: usize },
    NoIdentifier,
}

/// Decode the next record of `handle` from raw IP `packet`.
///
/// Returns the number of CC packet bytes written to `out` (0 when none).
/// `record` is overwritten on every call.
#[allow(clippy::too_many_arguments)]
pub fn decode_stream(
    registry: &StreamRegistry,
    inspector: &dyn PacketInspector,
    carry_window: usize,
    handle: StreamHandle,
    packet: &[u8],
    out: &mut [u8],
    opts: DecodeOptions,
    record: &mut InterceptRecord,
) -> Result<usize> {
    *record = InterceptRecord::default();
    let info = inspector.inspect(packet)?;
    let payload = info.payload(packet);

    registry.with_stream(handle, |entry| {
        if entry.identifier.is_empty() {
            return Err(Error::StreamNotConfigured);
        }
        if !entry.ports.contains(info.dst_port) {
            return Err(Error::NotOnPortList(info.dst_port));
        }

        if entry.asn_index > entry.carry.len() + payload.len() {
            log::warn!("stream {}: resume index {} beyond buffer, resetting", handle, entry.asn_index);
            reset(entry);
        }

        let origin = fingerprint(payload);
        if entry.asn_index == 0 && !entry.carry.is_empty() && entry.carry_origin == Some(origin) {
            log::debug!("stream {}: payload presented again, dropping the tail carried from it", handle);
            reset(entry);
        }

        let work: Cow<'_, [u8]> = if entry.carry.is_empty() {
            Cow::Borrowed(payload)
        } else {
            let mut joined = Vec::with_capacity(entry.carry.len() + payload.len());
            joined.extend_from_slice(&entry.carry);
            joined.extend_from_slice(payload);
            Cow::Owned(joined)
        };
        let start = entry.asn_index;
        let ctx = RecordCtx { work: &work, start, identifier: &entry.identifier, inspector, opts };

        let result = match ctx.decode(out, record) {
            Ok(Outcome::Complete { next, cc_len }) => {
                settle(entry, &work, next, payload.len(), carry_window);
                if cc_len > 0 {
                    entry.cc_packets += 1;
                }
                Ok(cc_len)
            }
            Ok(Outcome::Incomplete { record_start }) => {
                *record = InterceptRecord::default();
                carry_record(entry, &work, record_start, payload.len());
                Ok(0)
            }
            Ok(Outcome::NoIdentifier) => {
                let keep = PDU_LOOKBACK + 3 + entry.identifier.len();
                let from = work.len().saturating_sub(keep).max(start);
                carry_tail(entry, &work, from, payload.len().min(carry_window));
                Ok(0)
            }
            Err((e, resume)) => {
                log::debug!("stream {}: {} at {}", handle, e, resume);
                *record = InterceptRecord::default();
                settle(entry, &work, resume, payload.len(), carry_window);
                Err(e)
            }
        };
        entry.carry_origin = (!entry.carry.is_empty()).then_some(origin);
        record.asn_index = entry.asn_index;
        result
    })?
}

fn fingerprint(payload: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    payload.hash(&mut h);
    h.finish()
}

/// Apply the boundary rule to the position reached after a record.
fn settle(entry: &mut StreamEntry, work: &[u8], index: usize, payload_len: usize, window: usize) {
    let len = work.len();
    if index > len {
        log::warn!("decode ran {} bytes past the buffer, resetting carry-over", index - len);
        reset(entry);
    } else if index == len {
        reset(entry);
    } else if len - index <= window {
        carry_tail(entry, work, index, payload_len);
    } else {
        // More records follow in this packet; the caller presents it again.
        entry.asn_index = index;
    }
}

/// Keep `work[from..]` for the next payload if it is no longer than `max`.
fn carry_tail(entry: &mut StreamEntry, work: &[u8], from: usize, max: usize) {
    let tail = &work[from.min(work.len())..];
    if tail.is_empty() || tail.len() > max {
        reset(entry);
        return;
    }
    entry.carry = tail.to_vec();
    entry.asn_index = 0;
}

fn carry_record(entry: &mut StreamEntry, work: &[u8], record_start: usize, payload_len: usize) {
    let pending = work.len().saturating_sub(record_start);
    if pending > payload_len {
        log::warn!("dropping {} byte partial record longer than one payload", pending);
        reset(entry);
        return;
    }
    carry_tail(entry, work, record_start, payload_len);
}

fn reset(entry: &mut StreamEntry) {
    entry.carry.clear();
    entry.carry_origin = None;
    entry.asn_index = 0;
}

struct RecordCtx<'a> {
    work: &'a [u8],
    start: usize,
    identifier: &'a str,
    inspector: &'a dyn PacketInspector,
    opts: DecodeOptions,
}

impl RecordCtx<'_> {
    fn decode(&self, out: &mut [u8], record: &mut InterceptRecord) -> std::result::Result<Outcome, (Error, usize)> {
        let Some((id_pos, tag_pos, tag)) = locate_identifier(self.work, self.start, self.identifier) else {
            return Ok(Outcome::NoIdentifier);
        };
        let id_end = id_pos + self.identifier.len();
        record.interception_point_id = Some(self.identifier.to_string());
        let pdu = enclosing_pdu(self.work, self.start, tag_pos);
        let mut record_start = tag_pos;

        let header = self.decode_header(tag_pos, tag, id_end, record, &mut record_start);
        if let Some((pdu_start, _)) = pdu {
            record_start = record_start.min(pdu_start);
        }
        let pdu_end = pdu.map(|(_, end)| end);

        match header {
            Ok(idx) => self.extract_cc(idx, record_start, pdu_end, out, record).map_err(|e| (e, id_end)),
            // The header spills past a PS-PDU that ends inside the buffer.
            Err(Fault::Truncated) => match pdu_end {
                Some(end) if end <= self.work.len() => Ok(Outcome::Complete { next: end, cc_len: 0 }),
                _ => Ok(Outcome::Incomplete { record_start }),
            },
            Err(Fault::Bad(e)) => Err((e, id_end)),
        }
    }

    /// Sequence number, timestamp and qualifier. Returns the index after
    /// the last of them present.
    fn decode_header(
        &self,
        tag_pos: usize,
        tag: u16,
        id_end: usize,
        record: &mut InterceptRecord,
        record_start: &mut usize,
    ) -> Step<usize> {
        let mut idx = id_end;

        if tag == tags::INTERCEPTION_POINT_ID {
            if let Some((seq_pos, seq)) = reverse_sequence_scan(self.work, self.start, tag_pos) {
                *record_start = seq_pos;
                if self.opts.sequence_number {
                    record.sequence_number = Some(seq);
                }
            }
        } else if let Some((end, seq)) = forward_sequence_scan(self.work, id_end)? {
            idx = end;
            if self.opts.sequence_number {
                record.sequence_number = Some(seq);
            }
        }

        idx = skip_optional(self.work, idx, tags::GENERALIZED_TIME)?;

        if let Some((end, ts)) = read_timestamp(self.work, idx)? {
            idx = end;
            if self.opts.timestamp {
                record.timestamp = ts;
            }
        }

        if let Some((end, q)) = read_int_field(self.work, idx, tags::TIMESTAMP_QUALIFIER)? {
            idx = end;
            if self.opts.timestamp_qualifier {
                record.timestamp_qualifier = Some(q);
            }
        }
        Ok(idx)
    }

    /// Find the CC packet after the header. `pdu_end` is the declared end
    /// of the enclosing PS-PDU, which may lie past the buffer.
    fn extract_cc(
        &self,
        idx: usize,
        record_start: usize,
        pdu_end: Option<usize>,
        out: &mut [u8],
        record: &mut InterceptRecord,
    ) -> Result<Outcome> {
        let len = self.work.len();
        // A CC packet never reaches into the next record of this stream.
        let next_id = locate_identifier(self.work, idx, self.identifier).map(|(_, tag_pos, _)| tag_pos);
        let bound = next_id.unwrap_or(len);
        let skip_to = pdu_end.filter(|&end| end >= idx && end <= bound).unwrap_or(idx);

        if !self.opts.cc_packet {
            return Ok(Outcome::Complete { next: skip_to, cc_len: 0 });
        }

        let limit = bound.min(pdu_end.unwrap_or(len));
        let Some((pos, cc_len, version)) = scan_cc_packet(self.work, idx, limit, self.inspector) else {
            let continues = next_id.is_none() && pdu_end.map_or(true, |end| end > len);
            if continues {
                return Ok(Outcome::Incomplete { record_start });
            }
            return Ok(Outcome::Complete { next: skip_to, cc_len: 0 });
        };

        if out.len() < cc_len {
            return Err(Error::BufferExceeded { need: cc_len, have: out.len() });
        }
        out[..cc_len].copy_from_slice(&self.work[pos..pos + cc_len]);
        record.cc_packet = Some(CcPacket {
            tag: der_tag_before(self.work, idx, pos, cc_len),
            length: cc_len as u16,
            version,
        });
        log::trace!("CC packet v{} of {} bytes at {}", version, cc_len, pos);
        Ok(Outcome::Complete { next: pos + cc_len, cc_len })
    }
}

/// First occurrence of `identifier` at or after `from` that sits behind a
/// string tag/length header. Returns (value position, header position, tag).
fn locate_identifier(work: &[u8], from: usize, identifier: &str) -> Option<(usize, usize, u16)> {
    let needle = identifier.as_bytes();
    let mut at = from;
    while at < work.len() {
        let pos = find_bytes(&work[at..], needle)? + at;
        if let Some((hdr, tag)) = string_header_before(work, pos, needle.len()) {
            if hdr >= from {
                return Some((pos, hdr, tag));
            }
        }
        at = pos + 1;
    }
    None
}

/// PS-PDU `SEQUENCE` whose `pSHeader` set contains the identifier header
/// at `tag_pos`. Returns (start, declared end); the end may lie past `work`.
fn enclosing_pdu(work: &[u8], floor: usize, tag_pos: usize) -> Option<(usize, usize)> {
    let lowest = tag_pos.saturating_sub(PDU_LOOKBACK).max(floor);
    (lowest..tag_pos).rev().find_map(|p| {
        if work[p] != tags::PS_PDU {
            return None;
        }
        let mut cur = Cursor::with_bounds(work, p + 1, work.len());
        let len = read_outer_length(&mut cur)?;
        let end = cur.pos() + len;
        if cur.read_u8().ok()? != tags::PS_HEADER {
            return None;
        }
        let header_len = read_outer_length(&mut cur)?;
        let header_end = cur.pos() + header_len;
        let contains = cur.pos() <= tag_pos && tag_pos < header_end && header_end <= end;
        contains.then_some((p, end))
    })
}

/// Definite length of a PS-PDU or pSHeader. These may exceed the per-field
/// limit, so only the encoding is checked.
fn read_outer_length(cur: &mut Cursor<'_>) -> Option<usize> {
    let first = cur.read_u8().ok()?;
    match first {
        0..=0x7f => Some(usize::from(first)),
        0x81..=0x83 => cur.read_be(usize::from(first & 0x7f)).ok().map(|v| v as usize),
        _ => None,
    }
}

/// `sequenceNumber` ending exactly where the canonical identifier's header
/// starts, at most [`SEQUENCE_LOOKBACK`] bytes back.
fn reverse_sequence_scan(work: &[u8], floor: usize, tag_pos: usize) -> Option<(usize, u64)> {
    let lowest = tag_pos.saturating_sub(SEQUENCE_LOOKBACK).max(floor);
    let mut p = tag_pos.checked_sub(3)?;
    while p >= lowest {
        let len = tag_pos - p - 2;
        if work[p] == tags::SEQUENCE_NUMBER && usize::from(work[p + 1]) == len {
            return Some((p, be_u64(&work[p + 2..tag_pos])));
        }
        if p == 0 {
            break;
        }
        p -= 1;
    }
    None
}

/// Substitute form: the sequence number follows the identifier, after the
/// country code and the constructed communication identifier.
fn forward_sequence_scan(work: &[u8], from: usize) -> Step<Option<(usize, u64)>> {
    let mut cur = Cursor::with_bounds(work, from, work.len());
    let mut constructs = 0usize;

    for _ in 0..MAX_FORWARD_FIELDS {
        let tag = cur.peek_u8()?;
        if tag == tags::SEQUENCE_NUMBER {
            let start = cur.pos();
            return read_int_field(work, start, tags::SEQUENCE_NUMBER);
        }
        let is_context = tag & 0xc0 == 0x80 && tag & tags::LONG_FORM_MARKER != tags::LONG_FORM_MARKER;
        if !is_context {
            return Ok(None);
        }
        if tag & tags::CONSTRUCTED != 0 {
            if constructs == MAX_FORWARD_CONSTRUCTS {
                return Ok(None);
            }
            constructs += 1;
        }
        cur.read_u8()?;
        let len = read_length(&mut cur)?;
        cur.skip(len)?;
    }
    Ok(None)
}

fn skip_optional(work: &[u8], idx: usize, tag: u8) -> Step<usize> {
    let mut cur = Cursor::with_bounds(work, idx, work.len());
    if cur.peek_u8()? != tag {
        return Ok(idx);
    }
    cur.read_u8()?;
    let len = read_length(&mut cur)?;
    cur.skip(len)?;
    Ok(cur.pos())
}

/// Primitive integer field with the given tag at `idx`, if present.
fn read_int_field(work: &[u8], idx: usize, tag: u8) -> Step<Option<(usize, u64)>> {
    let mut cur = Cursor::with_bounds(work, idx, work.len());
    if cur.peek_u8()? != tag {
        return Ok(None);
    }
    cur.read_u8()?;
    let len = read_length(&mut cur)?;
    if len == 0 || len > MAX_INT_LEN {
        return Err(Fault::Bad(Error::MalformedLength { length: len, max: MAX_INT_LEN }));
    }
    let value = be_u64(cur.read_slice(len)?);
    Ok(Some((cur.pos(), value)))
}

/// `microSecondTimeStamp` at `idx`. A set whose contents are not the two
/// expected integers is stepped over and reported as no timestamp.
fn read_timestamp(work: &[u8], idx: usize) -> Step<Option<(usize, Option<Timestamp>)>> {
    let mut cur = Cursor::with_bounds(work, idx, work.len());
    if cur.peek_u8()? != tags::MICROSECOND_TIMESTAMP {
        return Ok(None);
    }
    cur.read_u8()?;
    let len = read_length(&mut cur)?;
    let body = cur.split(len)?;
    let end = cur.pos();

    let inner = |b: &Cursor<'_>| -> Result<Option<Timestamp>> {
        let (start, stop) = (b.pos(), b.end());
        let slice = &work[..stop];
        let secs = match read_int_field(slice, start, tags::TS_SECONDS) {
            Ok(Some(v)) => v,
            Ok(None) | Err(Fault::Truncated) => return Ok(None),
            Err(Fault::Bad(e)) => return Err(e),
        };
        let micros = match read_int_field(slice, secs.0, tags::TS_MICROSECONDS) {
            Ok(Some(v)) => v,
            Ok(None) | Err(Fault::Truncated) => return Ok(None),
            Err(Fault::Bad(e)) => return Err(e),
        };
        Ok(Some(Timestamp { seconds: secs.1, microseconds: micros.1 }))
    };
    let ts = inner(&body).map_err(Fault::Bad)?;
    Ok(Some((end, ts)))
}

/// Scan `work[from..limit]` for an IPv4 packet with a valid header checksum
/// or an IPv6/UDP packet with a valid UDP checksum, confirmed by the
/// inspector's length check. Returns (position, length, version).
fn scan_cc_packet(work: &[u8], from: usize, limit: usize, inspector: &dyn PacketInspector) -> Option<(usize, usize, u8)> {
    let limit = limit.min(work.len());
    for pos in from..limit {
        let cand = &work[pos..limit];
        let version = cand[0] >> 4;
        let plausible = match version {
            4 => ipv4_checksum_matches(cand),
            6 => ipv6_udp_checksum_matches(cand),
            _ => false,
        };
        if !plausible {
            continue;
        }
        match inspector.total_length(cand, true) {
            Some(total) if total <= cand.len() => return Some((pos, total, version)),
            _ => continue,
        }
    }
    None
}

fn ipv4_checksum_matches(cand: &[u8]) -> bool {
    if cand.len() < 20 {
        return false;
    }
    let ihl = usize::from(cand[0] & 0x0f) * 4;
    ihl >= 20 && ihl <= cand.len() && checksum::ipv4_header_valid(&cand[..ihl])
}

fn ipv6_udp_checksum_matches(cand: &[u8]) -> bool {
    const UDP: u8 = 17;
    if cand.len() < 48 || cand[6] != UDP {
        return false;
    }
    let plen = usize::from(u16::from_be_bytes([cand[4], cand[5]]));
    if plen < 8 || 40 + plen > cand.len() {
        return false;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&cand[8..24]);
    dst.copy_from_slice(&cand[24..40]);
    checksum::udp6_valid(&src, &dst, UDP, &cand[40..40 + plen])
}

/// Tag of a DER header directly in front of `pos` that declares exactly
/// `len` bytes, not reaching back before `floor`.
fn der_tag_before(work: &[u8], floor: usize, pos: usize, len: usize) -> Option<u16> {
    let encodings: [&[u8]; 3] = [
        &[len as u8],
        &[0x81, len as u8],
        &[0x82, (len >> 8) as u8, len as u8],
    ];
    for (i, enc) in encodings.iter().enumerate() {
        let short_ok = i > 0 || len < 0x80;
        let long_ok = i != 1 || len < 0x100;
        if !short_ok || !long_ok || pos < floor + enc.len() + 1 {
            continue;
        }
        let hdr = pos - enc.len();
        if &work[hdr..pos] == *enc {
            return Some(u16::from(work[hdr - 1]));
        }
    }
    None
}
