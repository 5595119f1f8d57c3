mod common;

use common::*;
use hi3_stream_decoder::fields::{AGGREGATION_THRESHOLD, MAX_ITERATIONS};
use hi3_stream_decoder::{
    hex_string, DecoderConfig, Error, FieldDecoder, FieldInput, FieldKind, Hi3Decoder, PortAggregator, TraceSink, WriterSink,
};

#[test]
fn octet_string_field() {
    let data = [0x04, 0x05, b'H', b'e', b'l', b'l', b'o'];
    let mut dec = FieldDecoder::new();
    assert_eq!(dec.decode_fields(&data, data.len()).unwrap(), 7);

    let fields = dec.fields();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].tag, 4);
    assert_eq!(fields[0].length, 5);
    assert_eq!(fields[0].text, "Hello");
    assert_eq!(fields[0].kind, FieldKind::Text);
}

#[test]
fn nested_set() {
    let data = [0xa0, 0x06, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04];
    let mut dec = FieldDecoder::new();
    let mut index = 0;
    assert_eq!(dec.decode_tlv(&data, &mut index, 0).unwrap(), 6);
    assert_eq!(index, 8);

    let f = &dec.fields()[0];
    assert_eq!((f.tag, f.length, f.value), (2, 4, 16_909_060));
    assert_eq!(f.kind, FieldKind::Integer);
    assert_eq!(f.depth, 1);
}

#[test]
fn tree_round_trip() {
    let mut inner = der(&[0x80], b"abc");
    inner.extend(der(&[0x81], &[0x01, 0x00]));
    inner.extend(der(&[0xa2], &der(&[0x83], &[0xff; 12])));
    let mut data = der(&[0x30], &inner);
    data.extend(der(&[0x04], &[b'x'; 200]));
    data.extend(der(&[0x9f, 0x21], b"long tag"));

    let mut dec = FieldDecoder::new();
    assert_eq!(dec.decode_fields(&data, data.len()).unwrap(), data.len());

    let got: Vec<(u16, u16)> = dec.fields().iter().map(|f| (f.tag, f.length)).collect();
    assert_eq!(got, vec![(0x80, 3), (0x81, 2), (0x83, 12), (0x04, 200), (0x9f21, 8)]);
    assert_eq!(dec.fields()[2].kind, FieldKind::Bytes);
    assert_eq!(dec.fields()[2].depth, 2);
    assert_eq!(dec.fields()[4].text, "long tag");
}

#[test]
fn zero_length_sets_hit_the_ceiling() {
    let data: Vec<u8> = [0xa0, 0x00].repeat(1000);
    let mut dec = FieldDecoder::new();
    assert_eq!(dec.decode_fields(&data, data.len()), Err(Error::IterationLimitExceeded(MAX_ITERATIONS)));

    let body: Vec<u8> = [0xa0, 0x00].repeat(120);
    let data = der(&[0x30], &body);
    let mut dec = FieldDecoder::new();
    assert_eq!(dec.decode_fields(&data, 0), Err(Error::IterationLimitExceeded(MAX_ITERATIONS)));
}

#[test]
fn reads_never_pass_the_buffer() {
    let data = [0x04, 0x05, b'H', b'e'];
    let mut dec = FieldDecoder::new();
    assert!(matches!(dec.decode_fields(&data, data.len()), Err(Error::BufferExceeded { .. })));

    let set = [0xa0, 0x10, 0x02, 0x01, 0x05];
    assert!(matches!(dec.decode_fields(&set, set.len()), Err(Error::BufferExceeded { .. })));

    assert!(matches!(dec.decode_fields(&set, 9), Err(Error::BufferExceeded { need: 9, have: 5 })));

    // Bound shorter than the slice: the field would end past it.
    let data = [0x04, 0x03, b'a', b'b', b'c'];
    let mut index = 0;
    assert!(matches!(dec.decode_tlv(&data, &mut index, 4), Err(Error::BufferExceeded { .. })));
    assert_eq!(index, 0);
}

#[test]
fn malformed_lengths() {
    let mut dec = FieldDecoder::new();
    let too_big = [0x04, 0x82, 0x08, 0x00];
    assert!(matches!(dec.decode_fields(&too_big, 4), Err(Error::MalformedLength { length: 2048, .. })));

    let indefinite = [0x30, 0x80, 0x00, 0x00];
    assert!(matches!(dec.decode_fields(&indefinite, 4), Err(Error::MalformedLength { .. })));

    let wide = [0x04, 0x85, 0, 0, 0, 0, 1, 0];
    assert!(matches!(dec.decode_fields(&wide, 8), Err(Error::MalformedLength { .. })));
}

#[test]
fn chained_long_form_tag() {
    let data = [0x1f, 0x81, 0x01, 0x00];
    let mut dec = FieldDecoder::new();
    assert_eq!(dec.decode_fields(&data, 4), Err(Error::ConsecutiveLongFormTags(1)));
    assert_eq!(Error::ConsecutiveLongFormTags(1).code(), -4);
}

#[test]
fn trace_lines() {
    let data = [0xa0, 0x06, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04];
    let mut lines: Vec<String> = Vec::new();
    {
        let mut dec = FieldDecoder::new().with_sink(&mut lines).with_label("pdu");
        dec.decode_fields(&data, 0).unwrap();
    }
    assert_eq!(lines, vec!["pdu set tag=0xa0 len=6".to_string(), "  pdu tag=0x02 len=4 int=16909060".to_string()]);

    let mut sink = WriterSink::new(Vec::new());
    {
        let mut dec = FieldDecoder::new().with_sink(&mut sink);
        dec.decode_fields(b"\x04\x02hi", 4).unwrap();
    }
    assert!(sink.take_error().is_none());
    assert_eq!(sink.into_inner(), b"tag=0x04 len=2 text=\"hi\"\n".to_vec());
}

#[test]
fn oversize_payloads_are_aggregated() {
    let field = der(&[0x04], &[b'a'; 127]);
    let stream: Vec<u8> = field.repeat(12);
    let (head, tail) = stream.split_at(AGGREGATION_THRESHOLD);

    let dec = Hi3Decoder::new(DecoderConfig::default());
    let mut agg = PortAggregator::new();

    let first = tcp(HI3_PORT, head);
    let dump = dec.decode_fields(FieldInput::Packet(&first), 0, &mut agg, None, "").unwrap();
    assert!(dump.deferred);
    assert_eq!(agg.pending_len(HI3_PORT), Some(AGGREGATION_THRESHOLD));

    let second = tcp(HI3_PORT, tail);
    let dump = dec.decode_fields(FieldInput::Packet(&second), 0, &mut agg, None, "").unwrap();
    assert!(!dump.deferred);
    assert_eq!(dump.processed, stream.len());
    assert_eq!(dump.fields.len(), 12);
    assert_eq!(agg.pending_ports(), 0);
}

#[test]
fn short_payload_decodes_directly() {
    let dec = Hi3Decoder::new(DecoderConfig::default());
    let mut agg = PortAggregator::new();
    let packet = tcp(HI3_PORT, &[0x04, 0x05, b'H', b'e', b'l', b'l', b'o']);

    let mut lines: Vec<String> = Vec::new();
    let dump = dec
        .decode_fields(FieldInput::Packet(&packet), 0, &mut agg, Some(&mut lines as &mut dyn TraceSink), "p1")
        .unwrap();
    assert_eq!(dump.processed, 7);
    assert_eq!(dump.fields[0].text, "Hello");
    assert_eq!(lines, vec!["p1 tag=0x04 len=5 text=\"Hello\"".to_string()]);

    let dump = dec.decode_fields(FieldInput::Buffer(&[0x02, 0x01, 0x2a]), 3, &mut agg, None, "").unwrap();
    assert_eq!(dump.fields[0].value, 42);
}

#[test]
fn bytes_are_shown_as_hex() {
    assert_eq!(hex_string(&[0x00, 0x0f, 0xa0, 0xff]), "000fa0ff");
    assert_eq!(hex_string(&[]), "");

    let mut dec = FieldDecoder::new();
    let data = der(&[0x83], &[0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0x01]);
    dec.decode_fields(&data, data.len()).unwrap();
    assert_eq!(dec.fields()[0].kind, FieldKind::Bytes);
    assert_eq!(dec.fields()[0].text, "beef00000000000001");
}
