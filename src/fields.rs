//! Schema-less DER field decoder.
//!
//! Walks tag/length/value triples, descending into constructed tags, and
//! classifies every primitive value as text, a small integer or opaque
//! bytes. Nothing is known about the schema; the decoder is used for
//! diagnostics and for dumping records the stream decoder does not model.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::cursor::{be_u64, Cursor};
use crate::error::{Error, Result};
use crate::packet::PacketInspector;
use crate::tags::{all_printable, CONSTRUCTED, LONG_FORM_MARKER};
use crate::trace::TraceSink;

/// Largest length accepted for a single field or set.
pub const MAX_FIELD_SIZE: usize = 2047;
/// Ceiling for sibling loops and for nesting depth.
pub const MAX_ITERATIONS: usize = 100;
/// Payloads at least this long are assumed to continue in the next segment.
pub const AGGREGATION_THRESHOLD: usize = 1448;
/// Longest text kept on a [`DecodedField`].
pub const MAX_TEXT_LEN: usize = 512;

const MAX_AGGREGATION_PORTS: usize = 32;
const MAX_AGGREGATION_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Every byte is printable ASCII or CR/LF.
    Text,
    /// Up to 8 bytes, read big-endian.
    Integer,
    /// Longer than 8 bytes and not printable; `text` holds a hex dump.
    Bytes,
}

/// One decoded primitive field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedField {
    pub tag: u16,
    pub length: u16,
    /// Big-endian value of the field (its last 8 bytes when longer).
    pub value: u64,
    /// Printable text, decimal integer or hex dump, at most [`MAX_TEXT_LEN`] bytes.
    pub text: String,
    pub kind: FieldKind,
    /// Number of enclosing sets.
    pub depth: usize,
}

/// Recursive tag/length/value walker with optional tracing.
pub struct FieldDecoder<'s> {
    sink: Option<&'s mut dyn TraceSink>,
    label: String,
    fields: Vec<DecodedField>,
}

impl Default for FieldDecoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'s> FieldDecoder<'s> {
    pub fn new() -> Self {
        Self { sink: None, label: String::new(), fields: Vec::new() }
    }

    pub fn with_sink(mut self, sink: &'s mut dyn TraceSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Prefix written after the indentation of every trace line.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn fields(&self) -> &[DecodedField] {
        &self.fields
    }

    pub fn take_fields(&mut self) -> Vec<DecodedField> {
        std::mem::take(&mut self.fields)
    }

    /// Decode one top-level tag starting at `*index`, advancing `*index`
    /// past it on success.
    ///
    /// `bound` is the length of the valid part of `data`; zero means the
    /// whole slice. Returns the length of the outer set, or 0 when the tag
    /// is primitive.
    pub fn decode_tlv(&mut self, data: &[u8], index: &mut usize, bound: usize) -> Result<usize> {
        let end = if bound == 0 { data.len() } else { bound.min(data.len()) };
        let mut cur = Cursor::with_bounds(data, *index, end);
        if cur.pos() != *index {
            return Err(Error::BufferExceeded { need: 1, have: 0 });
        }
        let set_len = self.tlv(&mut cur, 0)?;
        *index = cur.pos();
        Ok(set_len)
    }

    /// Decode consecutive top-level fields covering `data[..length]` and
    /// return the number of bytes processed. A `length` of 0 decodes
    /// exactly one field.
    pub fn decode_fields(&mut self, data: &[u8], length: usize) -> Result<usize> {
        if length > data.len() {
            return Err(Error::BufferExceeded { need: length, have: data.len() });
        }
        let mut index = 0usize;
        if length == 0 {
            self.decode_tlv(data, &mut index, 0)?;
            return Ok(index);
        }

        let mut siblings = 0usize;
        while index < length {
            siblings += 1;
            if siblings > MAX_ITERATIONS {
                return Err(Error::IterationLimitExceeded(MAX_ITERATIONS));
            }
            self.decode_tlv(data, &mut index, length)?;
        }
        Ok(index)
    }

    fn tlv(&mut self, cur: &mut Cursor<'_>, depth: usize) -> Result<usize> {
        if depth > MAX_ITERATIONS {
            return Err(Error::IterationLimitExceeded(MAX_ITERATIONS));
        }

        let (tag, constructed) = read_tag(cur)?;
        let len = read_length(cur)?;

        if constructed {
            self.trace(depth, format_args!("set tag={:#04x} len={}", tag, len));
            let mut body = cur.split(len)?;
            let mut siblings = 0usize;
            while !body.is_empty() {
                siblings += 1;
                if siblings > MAX_ITERATIONS {
                    return Err(Error::IterationLimitExceeded(MAX_ITERATIONS));
                }
                self.tlv(&mut body, depth + 1)?;
            }
            return Ok(len);
        }

        let value = cur.read_slice(len)?;
        let field = classify(tag, value, depth);
        match field.kind {
            FieldKind::Text => self.trace(depth, format_args!("tag={:#04x} len={} text=\"{}\"", tag, len, field.text)),
            FieldKind::Integer => self.trace(depth, format_args!("tag={:#04x} len={} int={}", tag, len, field.value)),
            FieldKind::Bytes => self.trace(depth, format_args!("tag={:#04x} len={} hex={}", tag, len, field.text)),
        }
        self.fields.push(field);
        Ok(0)
    }

    fn trace(&mut self, depth: usize, args: std::fmt::Arguments<'_>) {
        let Some(sink) = self.sink.as_mut() else { return; };
        let mut line = String::with_capacity(64);
        for _ in 0..depth {
            line.push_str("  ");
        }
        if !self.label.is_empty() {
            line.push_str(&self.label);
            line.push(' ');
        }
        let _ = line.write_fmt(args);
        sink.line(&line);
    }
}

/// Tag byte(s). A low-five-bits value of 31 pulls in one extension byte;
/// an extension byte that itself announces another is rejected.
fn read_tag(cur: &mut Cursor<'_>) -> Result<(u16, bool)> {
    let b0 = cur.read_u8()?;
    let constructed = b0 & CONSTRUCTED != 0;
    if b0 & LONG_FORM_MARKER != LONG_FORM_MARKER {
        return Ok((u16::from(b0), constructed));
    }
    let at = cur.pos();
    let b1 = cur.read_u8()?;
    if b1 & 0x80 != 0 {
        return Err(Error::ConsecutiveLongFormTags(at));
    }
    Ok((u16::from(b0) << 8 | u16::from(b1), constructed))
}

pub(crate) fn read_length(cur: &mut Cursor<'_>) -> Result<usize> {
    let l0 = cur.read_u8()?;
    let len = if l0 & 0x80 == 0 {
        usize::from(l0)
    } else {
        let n = usize::from(l0 & 0x7f);
        // Indefinite form (n == 0) is not DER.
        if n == 0 || n > 4 {
            return Err(Error::MalformedLength { length: usize::from(l0), max: MAX_FIELD_SIZE });
        }
        cur.read_be(n)? as usize
    };
    if len >= MAX_FIELD_SIZE {
        return Err(Error::MalformedLength { length: len, max: MAX_FIELD_SIZE });
    }
    Ok(len)
}

fn classify(tag: u16, value: &[u8], depth: usize) -> DecodedField {
    let numeric = be_u64(value);
    let (kind, text) = if all_printable(value) {
        let end = value.len().min(MAX_TEXT_LEN);
        (FieldKind::Text, String::from_utf8_lossy(&value[..end]).into_owned())
    } else if value.len() <= 8 {
        let mut buf = itoa::Buffer::new();
        (FieldKind::Integer, buf.format(numeric).to_string())
    } else {
        let shown = &value[..value.len().min(MAX_TEXT_LEN / 2)];
        (FieldKind::Bytes, hex_string(shown))
    };
    DecodedField { tag, length: value.len() as u16, value: numeric, text, kind, depth }
}

/// Lowercase hex of `bytes`, two digits per byte.
pub fn hex_string(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 0x0f) as usize] as char);
    }
    s
}

/// Input to the standalone decoder: either DER bytes, or a raw IP packet
/// whose transport payload holds them.
#[derive(Debug, Clone, Copy)]
pub enum FieldInput<'a> {
    Buffer(&'a [u8]),
    Packet(&'a [u8]),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDump {
    pub processed: usize,
    /// The payload was held back waiting for the rest of its chunk.
    pub deferred: bool,
    pub fields: Vec<DecodedField>,
}

/// Result of offering a payload to the [`PortAggregator`].
#[derive(Debug)]
pub enum Aggregated<'a> {
    Ready(Cow<'a, [u8]>),
    Deferred,
}

/// Accumulates oversize payloads per destination port until a short
/// payload closes the chunk.
///
/// There is one outstanding buffer per port at most. Taking `&mut self`
/// makes callers serialise use per aggregator.
#[derive(Debug, Default)]
pub struct PortAggregator {
    pending: HashMap<u16, Vec<u8>>,
}

impl PortAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_ports(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_len(&self, port: u16) -> Option<usize> {
        self.pending.get(&port).map(Vec::len)
    }

    pub fn offer<'a>(&mut self, port: u16, payload: &'a [u8]) -> Aggregated<'a> {
        let oversize = payload.len() >= AGGREGATION_THRESHOLD;
        if !oversize && !self.pending.contains_key(&port) {
            return Aggregated::Ready(Cow::Borrowed(payload));
        }
        if !self.pending.contains_key(&port) && self.pending.len() >= MAX_AGGREGATION_PORTS {
            log::warn!("aggregation table full, decoding port {} payload unaggregated", port);
            return Aggregated::Ready(Cow::Borrowed(payload));
        }

        let buf = self.pending.entry(port).or_default();
        buf.extend_from_slice(payload);
        if oversize && buf.len() < MAX_AGGREGATION_BYTES {
            log::trace!("port {}: deferring {} aggregated bytes", port, buf.len());
            return Aggregated::Deferred;
        }
        if oversize {
            log::warn!("port {}: aggregate reached {} bytes, decoding early", port, buf.len());
        }
        match self.pending.remove(&port) {
            Some(done) => Aggregated::Ready(Cow::Owned(done)),
            None => Aggregated::Ready(Cow::Borrowed(payload)),
        }
    }
}

/// Standalone decode of a buffer or packet, with no stream involved.
///
/// For a [`FieldInput::Buffer`], `length` bounds the decode (0 decodes one
/// field). For a packet, the transport payload is routed through
/// `aggregator` and decoded whole once its chunk is complete.
pub fn decode_fields(
    input: FieldInput<'_>,
    length: usize,
    aggregator: &mut PortAggregator,
    inspector: &dyn PacketInspector,
    decoder: &mut FieldDecoder<'_>,
) -> Result<FieldDump> {
    let processed = match input {
        FieldInput::Buffer(data) => decoder.decode_fields(data, length)?,
        FieldInput::Packet(packet) => {
            let info = inspector.inspect(packet)?;
            match aggregator.offer(info.dst_port, info.payload(packet)) {
                Aggregated::Deferred => {
                    return Ok(FieldDump { processed: 0, deferred: true, fields: Vec::new() });
                }
                Aggregated::Ready(chunk) => {
                    if chunk.is_empty() {
                        0
                    } else {
                        decoder.decode_fields(&chunk, chunk.len())?
                    }
                }
            }
        }
    };
    Ok(FieldDump { processed, deferred: false, fields: decoder.take_fields() })
}
