//! Decoder for ETSI lawful-intercept HI3 streams carried over TCP.
//!
//! Records are BER/DER encoded PS-PDUs split across ordinary TCP segments.
//! Decoding is schema-less and single-pass: every packet is handled when it
//! arrives, and a small per-stream record carries what is needed across
//! segment boundaries.
//!
//! - [`detect`] finds the interception point identifier of a new stream.
//! - [`registry`] keeps per-stream state behind opaque handles.
//! - [`stream`] pulls the sequence number, timestamp and embedded CC packet
//!   out of each record.
//! - [`fields`] dumps arbitrary DER without a schema.

pub mod capture;
pub mod catalog;
pub mod checksum;
pub mod cursor;
mod decoder;
pub mod detect;
mod error;
pub mod fields;
pub mod packet;
pub mod registry;
pub mod stream;
pub mod tags;
pub mod trace;

pub use decoder::{configure, DecoderConfig, Hi3Decoder};
pub use detect::{Detection, DetectorConfig, FindOptions, StreamTarget};
pub use error::{Error, Result};
pub use fields::{hex_string, DecodedField, FieldDecoder, FieldDump, FieldInput, FieldKind, PortAggregator};
pub use packet::{IpInspector, PacketInfo, PacketInspector, Transport};
pub use registry::{PortList, StreamHandle, StreamItem, StreamRegistry, StreamValue, MAX_STREAMS};
pub use stream::{CcPacket, DecodeOptions, FoundItems, InterceptRecord, Timestamp};
pub use trace::{LogSink, TraceSink, WriterSink};
