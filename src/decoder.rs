//! Entry points that tie the registry, detector and decoders together.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::detect::{self, Detection, DetectorConfig, FindOptions, StreamTarget};
use crate::error::Result;
use crate::fields::{self, FieldDecoder, FieldDump, FieldInput, PortAggregator};
use crate::packet::{IpInspector, PacketInspector};
use crate::registry::{StreamHandle, StreamItem, StreamRegistry, StreamValue};
use crate::stream::{self, DecodeOptions, InterceptRecord, CARRY_WINDOW};
use crate::trace::{LogSink, TraceSink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub detector: DetectorConfig,
    /// Unconsumed bytes this close to the payload end are carried over.
    pub carry_window: usize,
    /// Send field traces to `log::trace!` when no sink is supplied.
    pub trace_fields: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { detector: DetectorConfig::default(), carry_window: CARRY_WINDOW, trace_fields: false }
    }
}

pub struct Hi3Decoder {
    config: DecoderConfig,
    registry: StreamRegistry,
    inspector: Box<dyn PacketInspector>,
}

static GLOBAL: OnceLock<Hi3Decoder> = OnceLock::new();

/// Install the process-wide decoder. Only the first call's `config` is
/// used; later calls return the same instance.
pub fn configure(config: DecoderConfig) -> &'static Hi3Decoder {
    GLOBAL.get_or_init(|| {
        log::debug!("configuring process decoder: {:?}", config);
        Hi3Decoder::new(config)
    })
}

impl Hi3Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self::with_inspector(config, Box::new(IpInspector))
    }

    pub fn with_inspector(config: DecoderConfig, inspector: Box<dyn PacketInspector>) -> Self {
        Self { config, registry: StreamRegistry::new(), inspector }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn inspector(&self) -> &dyn PacketInspector {
        self.inspector.as_ref()
    }

    pub fn create_stream(&self, identifier: &str, dst_port: u16) -> Result<StreamHandle> {
        self.registry.create(identifier, dst_port)
    }

    pub fn delete_stream(&self, handle: StreamHandle) -> Result<()> {
        self.registry.release(handle)
    }

    pub fn get_stream_info(&self, handle: StreamHandle, item: StreamItem) -> Result<StreamValue> {
        self.registry.get_info(handle, item)
    }

    pub fn set_stream_info(&self, handle: StreamHandle, item: StreamItem, value: StreamValue) -> Result<()> {
        self.registry.set_info(handle, item, value)
    }

    pub fn find_stream(&self, packet: &[u8], opts: FindOptions, target: &mut StreamTarget) -> Result<Detection> {
        detect::find_stream(packet, self.inspector(), &self.config.detector, opts, target)
    }

    /// Decode the next record of `handle`; see [`stream::decode_stream`].
    pub fn decode_stream(
        &self,
        handle: StreamHandle,
        packet: &[u8],
        out: &mut [u8],
        opts: DecodeOptions,
        record: &mut InterceptRecord,
    ) -> Result<usize> {
        stream::decode_stream(
            &self.registry,
            self.inspector(),
            self.config.carry_window,
            handle,
            packet,
            out,
            opts,
            record,
        )
    }

    /// Standalone field dump; see [`fields::decode_fields`].
    pub fn decode_fields(
        &self,
        input: FieldInput<'_>,
        length: usize,
        aggregator: &mut PortAggregator,
        sink: Option<&mut dyn TraceSink>,
        label: &str,
    ) -> Result<FieldDump> {
        let mut log_sink = LogSink;
        let mut decoder = FieldDecoder::new().with_label(label);
        match sink {
            Some(s) => decoder = decoder.with_sink(s),
            None if self.config.trace_fields => decoder = decoder.with_sink(&mut log_sink),
            None => {}
        }
        fields::decode_fields(input, length, aggregator, self.inspector(), &mut decoder)
    }
}
