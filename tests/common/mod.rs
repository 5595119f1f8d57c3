#![allow(dead_code)]

use hi3_stream_decoder::checksum::{checksum, finish, WordWidth};

pub const HI3_PORT: u16 = 5000;
pub const IPID: &str = "IPID-0001";
pub const LIID: &str = "LIID-7";

/// One DER field: `tag` bytes, definite length, `value`.
pub fn der(tag: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = tag.to_vec();
    let len = value.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x100 {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
    out.extend_from_slice(value);
    out
}

/// Minimal two's-complement encoding of a non-negative INTEGER.
pub fn int(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    let mut out = Vec::new();
    if bytes[first] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&bytes[first..]);
    out
}

pub fn ipv4(proto: u8, l4: &[u8]) -> Vec<u8> {
    let total = 20 + l4.len();
    let mut p = vec![
        0x45, 0x00, (total >> 8) as u8, total as u8,
        0x12, 0x34, 0x40, 0x00,
        0x40, proto, 0x00, 0x00,
        10, 0, 0, 1,
        10, 0, 0, 2,
    ];
    let sum = finish(checksum(&p, 0, None, WordWidth::Bits16));
    p[10..12].copy_from_slice(&sum.to_be_bytes());
    p.extend_from_slice(l4);
    p
}

fn udp_header(dst_port: u16, payload_len: usize) -> Vec<u8> {
    let len = 8 + payload_len;
    let mut h = Vec::with_capacity(8);
    h.extend_from_slice(&[0x13, 0x8a]);
    h.extend_from_slice(&dst_port.to_be_bytes());
    h.extend_from_slice(&(len as u16).to_be_bytes());
    h.extend_from_slice(&[0, 0]);
    h
}

/// IPv4/UDP packet with a valid header checksum (UDP checksum left zero).
pub fn ipv4_udp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut l4 = udp_header(dst_port, payload.len());
    l4.extend_from_slice(payload);
    ipv4(17, &l4)
}

/// IPv6/UDP packet with a valid UDP checksum.
pub fn ipv6_udp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src[0] = 0xfd;
    src[15] = 1;
    dst[0] = 0xfd;
    dst[15] = 2;

    let mut udp = udp_header(dst_port, payload.len());
    udp.extend_from_slice(payload);

    let mut pseudo = Vec::with_capacity(40);
    pseudo.extend_from_slice(&src);
    pseudo.extend_from_slice(&dst);
    pseudo.extend_from_slice(&(udp.len() as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0, 17]);
    let partial = checksum(&pseudo, 0, None, WordWidth::Bits16);
    let mut sum = finish(checksum(&udp, u32::from(partial), None, WordWidth::Bits16));
    if sum == 0 {
        sum = 0xffff;
    }
    udp[6..8].copy_from_slice(&sum.to_be_bytes());

    let mut p = vec![0x60, 0, 0, 0];
    p.extend_from_slice(&(udp.len() as u16).to_be_bytes());
    p.extend_from_slice(&[17, 64]);
    p.extend_from_slice(&src);
    p.extend_from_slice(&dst);
    p.extend_from_slice(&udp);
    p
}

/// IPv4/TCP segment carrying `payload` to `dst_port`.
pub fn tcp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut l4 = vec![0xc3, 0x50];
    l4.extend_from_slice(&dst_port.to_be_bytes());
    l4.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    l4.extend_from_slice(payload);
    ipv4(6, &l4)
}

#[derive(Debug, Clone)]
pub struct Header {
    pub sequence: u64,
    pub seconds: u64,
    pub micros: u64,
    pub qualifier: u64,
}

impl Default for Header {
    fn default() -> Self {
        Self { sequence: 7, seconds: 1_700_000_000, micros: 123_456, qualifier: 1 }
    }
}

fn timestamp_fields(h: &Header) -> Vec<u8> {
    let mut out = Vec::new();
    let mut ts = der(&[0x80], &int(h.seconds));
    ts.extend(der(&[0x81], &int(h.micros)));
    out.extend(der(&[0xa7], &ts));
    out.extend(der(&[0x88], &int(h.qualifier)));
    out
}

/// PS-PDU with a canonical `interceptionPointID` and `cc` as its payload.
pub fn canonical_record(id: &str, h: &Header, payload: &[u8]) -> Vec<u8> {
    let mut ps = der(&[0x81], LIID.as_bytes());
    ps.extend(der(&[0x84], &int(h.sequence)));
    ps.extend(der(&[0x86], id.as_bytes()));
    ps.extend(timestamp_fields(h));

    let mut body = der(&[0xa1], &ps);
    body.extend(der(&[0xa2], payload));
    der(&[0x30], &body)
}

/// PS-PDU without an `interceptionPointID`; the LI identifier stands in.
pub fn substitute_record(liid: &str, h: &Header, payload: &[u8]) -> Vec<u8> {
    let mut ps = der(&[0x81], liid.as_bytes());
    ps.extend(der(&[0x82], b"DE"));
    ps.extend(der(&[0xa3], &der(&[0x80], &[0x00, 0x2a])));
    ps.extend(der(&[0x84], &int(h.sequence)));
    ps.extend(timestamp_fields(h));

    let mut body = der(&[0xa1], &ps);
    body.extend(der(&[0xa2], payload));
    der(&[0x30], &body)
}

/// Record payload wrapping `cc` in a single context field.
pub fn cc_payload(cc: &[u8]) -> Vec<u8> {
    der(&[0x80], cc)
}

pub fn sample_cc() -> Vec<u8> {
    ipv4_udp(10_000, b"rtp-voice-sample")
}

/// Deterministic pseudo-random bytes (xorshift64).
pub fn filler(seed: u64, len: usize) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}
