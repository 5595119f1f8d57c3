//! Raw IP packet queries used by the detector and the stream decoder.

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, NetSlice, SlicedPacket, TransportSlice};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Other(u8),
}

/// What the decoders need to know about one raw IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub protocol: Transport,
    pub dst_port: u16,
    /// Offset of the transport payload from the start of the IP header.
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Length the IP header declares for the whole packet.
    pub total_len: usize,
    /// RTP payload type, when a UDP payload looks like RTP version 2.
    pub rtp_payload_type: Option<u8>,
}

impl PacketInfo {
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.payload_offset..self.payload_offset + self.payload_len]
    }
}

/// Read-only packet parser. The decoders call it but never require a
/// particular implementation.
pub trait PacketInspector: Send + Sync {
    fn inspect(&self, packet: &[u8]) -> Result<PacketInfo>;

    /// Declared total length of the packet starting at `packet[0]`, if it is
    /// a sane IP packet that fits in `packet`. `quiet` suppresses logging
    /// for speculative checks.
    fn total_length(&self, packet: &[u8], quiet: bool) -> Option<usize>;
}

/// IPv4 / IPv6 parser for TCP and UDP, built on `etherparse` slices.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpInspector;

const IPV6_HEADER_LEN: usize = 40;

impl IpInspector {
    /// Total length the IP header declares, checked against the buffer.
    fn declared_length(packet: &[u8]) -> Result<usize> {
        let first = *packet.first().ok_or(Error::MalformedPacket("empty packet"))?;
        let total = match first >> 4 {
            4 => {
                let header = Ipv4HeaderSlice::from_slice(packet).map_err(|_| Error::MalformedPacket("bad IPv4 header"))?;
                let total = usize::from(header.total_len());
                if total < header.slice().len() {
                    return Err(Error::MalformedPacket("bad IPv4 header length"));
                }
                total
            }
            6 => {
                let header = Ipv6HeaderSlice::from_slice(packet).map_err(|_| Error::MalformedPacket("short IPv6 header"))?;
                IPV6_HEADER_LEN + usize::from(header.payload_length())
            }
            _ => return Err(Error::MalformedPacket("not an IP packet")),
        };
        if total > packet.len() {
            return Err(Error::MalformedPacket("declared IP length exceeds buffer"));
        }
        Ok(total)
    }
}

/// Position of `inner` inside `outer`, when it is a subslice of it.
fn offset_within(outer: &[u8], inner: &[u8]) -> Option<usize> {
    let off = (inner.as_ptr() as usize).checked_sub(outer.as_ptr() as usize)?;
    (off + inner.len() <= outer.len()).then_some(off)
}

impl PacketInspector for IpInspector {
    fn inspect(&self, packet: &[u8]) -> Result<PacketInfo> {
        let total_len = Self::declared_length(packet)?;
        let sliced = SlicedPacket::from_ip(packet).map_err(|e| {
            log::trace!("IP packet rejected: {}", e);
            Error::MalformedPacket("unparseable IP packet")
        })?;

        let ip_number = match &sliced.net {
            Some(NetSlice::Ipv4(v4)) => v4.payload().ip_number,
            Some(NetSlice::Ipv6(v6)) => v6.payload().ip_number,
            _ => return Err(Error::MalformedPacket("not an IP packet")),
        };

        let (protocol, dst_port, payload) = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => (Transport::Tcp, tcp.destination_port(), tcp.payload()),
            Some(TransportSlice::Udp(udp)) => (Transport::Udp, udp.destination_port(), udp.payload()),
            _ => (Transport::Other(ip_number.0), 0, &packet[total_len..total_len]),
        };
        let payload_offset = offset_within(packet, payload).ok_or(Error::MalformedPacket("payload outside packet"))?;
        let payload_len = payload.len();

        let rtp_payload_type = match protocol {
            Transport::Udp if payload_len >= 12 && payload[0] >> 6 == 2 => Some(payload[1] & 0x7f),
            _ => None,
        };

        Ok(PacketInfo { protocol, dst_port, payload_offset, payload_len, total_len, rtp_payload_type })
    }

    fn total_length(&self, packet: &[u8], quiet: bool) -> Option<usize> {
        match Self::declared_length(packet) {
            Ok(total) => Some(total),
            Err(e) => {
                if !quiet {
                    log::debug!("packet length check failed: {}", e);
                }
                None
            }
        }
    }
}
