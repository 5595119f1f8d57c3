//! Classic libpcap capture reader.
//!
//! Records come from `pcap-file`'s zero-copy parser over the mapped file.
//! Each frame is reduced to its IP packet by stripping Ethernet (with one
//! optional 802.1Q tag), Linux cooked (SLL) or raw-IP link headers.

use std::borrow::Cow;

use etherparse::{EtherType, Ethernet2HeaderSlice, LinuxSllHeaderSlice, LinuxSllProtocolType, SingleVlanHeaderSlice};
use pcap_file::pcap::PcapParser;
use pcap_file::{DataLink, PcapError};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("pcap header: {0}")]
    Header(#[from] PcapError),
    #[error("unsupported link type {0:?}")]
    UnsupportedLinkType(DataLink),
}

/// One capture record, reduced to its IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPacket<'a> {
    /// 1-based record number in the capture.
    pub frame_number: u64,
    pub timestamp_us: i64,
    pub data: &'a [u8],
}

pub struct PcapReader<'a> {
    parser: PcapParser,
    rest: &'a [u8],
    link_type: DataLink,
    frame: u64,
}

impl<'a> PcapReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, CaptureError> {
        let (rest, parser) = PcapParser::new(data)?;
        let link_type = parser.header().datalink;
        match link_type {
            DataLink::ETHERNET | DataLink::RAW | DataLink::LINUX_SLL | DataLink::IPV4 | DataLink::IPV6 => {
                Ok(Self { parser, rest, link_type, frame: 0 })
            }
            other => Err(CaptureError::UnsupportedLinkType(other)),
        }
    }

    pub fn link_type(&self) -> DataLink {
        self.link_type
    }

    fn ip_slice(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        match self.link_type {
            DataLink::ETHERNET => {
                let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
                let mut at = eth.slice().len();
                let mut ether_type = eth.ether_type();
                if ether_type == EtherType::VLAN_TAGGED_FRAME {
                    let vlan = SingleVlanHeaderSlice::from_slice(frame.get(at..)?).ok()?;
                    at += vlan.slice().len();
                    ether_type = vlan.ether_type();
                }
                if is_ip(ether_type) {
                    frame.get(at..)
                } else {
                    None
                }
            }
            DataLink::LINUX_SLL => {
                let sll = LinuxSllHeaderSlice::from_slice(frame).ok()?;
                match sll.protocol_type() {
                    LinuxSllProtocolType::EtherType(t) if is_ip(t) => frame.get(sll.slice().len()..),
                    _ => None,
                }
            }
            _ => Some(frame),
        }
    }
}

fn is_ip(ether_type: EtherType) -> bool {
    ether_type == EtherType::IPV4 || ether_type == EtherType::IPV6
}

impl<'a> Iterator for PcapReader<'a> {
    type Item = RawPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            let (rest, packet) = match self.parser.next_packet(self.rest) {
                Ok(next) => next,
                Err(e) => {
                    log::warn!("unreadable pcap record after frame {}: {}", self.frame, e);
                    self.rest = &[];
                    return None;
                }
            };
            self.rest = rest;
            self.frame += 1;

            let frame = match packet.data {
                Cow::Borrowed(frame) => frame,
                Cow::Owned(_) => {
                    log::trace!("frame {}: record not borrowed from the capture", self.frame);
                    continue;
                }
            };
            let Some(data) = self.ip_slice(frame) else {
                log::trace!("frame {}: not an IP packet", self.frame);
                continue;
            };
            let timestamp_us = i64::try_from(packet.timestamp.as_micros()).unwrap_or(i64::MAX);
            return Some(RawPacket { frame_number: self.frame, timestamp_us, data });
        }
    }
}
