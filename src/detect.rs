//! Discovery of the interception point identifier carried by a TCP stream.
//!
//! In auto mode the payload is scanned for printable string fields. A
//! canonical `interceptionPointID` wins outright. Some administrations omit
//! it, so the last LI identifier seen is accepted as a substitute when the
//! authorization country code is on the exception list or enough LI
//! identifiers were seen. In verify mode a caller-supplied identifier is
//! searched for and its DER header checked.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::packet::{PacketInspector, Transport};
use crate::registry::PortList;
use crate::tags::{self, all_printable, string_header_before, string_tag_at};

/// How (and whether) an identifier was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detection {
    NotFound,
    /// An `interceptionPointID` field was present.
    FoundCanonical,
    /// Substitute accepted because of the authorization country code.
    FoundByCountryCode,
    /// Substitute accepted because enough LI identifiers were seen.
    FoundByStringThreshold,
    /// Verify mode: the given identifier sits behind a string tag other
    /// than `interceptionPointID`.
    FoundByVerification,
}

impl Detection {
    pub fn is_found(self) -> bool {
        self != Detection::NotFound
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Country codes whose streams carry no canonical identifier.
    pub substitute_country_codes: Vec<String>,
    /// LI identifiers that must be seen in one payload before the last one
    /// is taken as the stream identifier.
    pub string_threshold: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { substitute_country_codes: vec!["DE".to_string()], string_threshold: 3 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Record the packet's destination port in the target's port list.
    pub discover_ports: bool,
}

/// In/out state for [`find_stream`]. An empty identifier selects auto mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamTarget {
    pub identifier: String,
    pub ports: PortList,
}

impl StreamTarget {
    pub fn auto() -> Self {
        Self::default()
    }

    pub fn verify(identifier: impl Into<String>) -> Self {
        Self { identifier: identifier.into(), ports: PortList::new() }
    }
}

#[derive(Debug, Default)]
struct StringScan {
    canonical: Option<String>,
    country: Option<String>,
    generic_count: usize,
    last_generic: Option<String>,
}

/// Look for a stream identifier in one raw IP packet.
pub fn find_stream(
    packet: &[u8],
    inspector: &dyn PacketInspector,
    config: &DetectorConfig,
    opts: FindOptions,
    target: &mut StreamTarget,
) -> Result<Detection> {
    let info = inspector.inspect(packet)?;
    if info.protocol != Transport::Tcp || info.payload_len == 0 {
        return Ok(Detection::NotFound);
    }
    let payload = info.payload(packet);

    let (detection, identifier) = if target.identifier.is_empty() {
        auto_detect(payload, config)
    } else {
        (verify(payload, &target.identifier), None)
    };

    if !detection.is_found() {
        return Ok(Detection::NotFound);
    }
    if let Some(id) = identifier {
        target.identifier = id;
    }
    if opts.discover_ports && !target.ports.insert(info.dst_port) {
        log::warn!("port list full, not recording port {} for '{}'", info.dst_port, target.identifier);
    }
    log::debug!("{:?}: '{}' on port {}", detection, target.identifier, info.dst_port);
    Ok(detection)
}

fn auto_detect(payload: &[u8], config: &DetectorConfig) -> (Detection, Option<String>) {
    let scan = scan_strings(payload);

    if let Some(id) = scan.canonical {
        return (Detection::FoundCanonical, Some(id));
    }
    let Some(generic) = scan.last_generic else {
        return (Detection::NotFound, None);
    };
    let exempt = scan
        .country
        .as_deref()
        .is_some_and(|cc| config.substitute_country_codes.iter().any(|c| c == cc));
    if exempt {
        (Detection::FoundByCountryCode, Some(generic))
    } else if scan.generic_count >= config.string_threshold {
        (Detection::FoundByStringThreshold, Some(generic))
    } else {
        (Detection::NotFound, None)
    }
}

fn scan_strings(payload: &[u8]) -> StringScan {
    let mut scan = StringScan::default();
    let mut i = 0usize;

    while i < payload.len() {
        let Some((tag, tag_len)) = string_tag_at(payload, i) else {
            i += 1;
            continue;
        };
        let len_pos = i + tag_len;
        let len = match payload.get(len_pos) {
            Some(&l) if (1..0x80).contains(&l) => usize::from(l),
            _ => {
                i += 1;
                continue;
            }
        };
        let start = len_pos + 1;
        let Some(value) = payload.get(start..start + len) else {
            i += 1;
            continue;
        };
        if !all_printable(value) {
            i += 1;
            continue;
        }

        let text = String::from_utf8_lossy(value).into_owned();
        match tag {
            tags::INTERCEPTION_POINT_ID => {
                scan.canonical = Some(text);
                return scan;
            }
            tags::AUTH_COUNTRY_CODE => scan.country = Some(text),
            tags::LI_IDENTIFIER => {
                scan.generic_count += 1;
                scan.last_generic = Some(text);
            }
            _ => {}
        }
        i = start + len;
    }
    scan
}

fn verify(payload: &[u8], identifier: &str) -> Detection {
    let needle = identifier.as_bytes();
    let mut from = 0usize;
    while let Some(pos) = find_bytes(&payload[from..], needle).map(|p| p + from) {
        if let Some((_, tag)) = string_header_before(payload, pos, needle.len()) {
            return if tag == tags::INTERCEPTION_POINT_ID {
                Detection::FoundCanonical
            } else {
                Detection::FoundByVerification
            };
        }
        from = pos + 1;
    }
    Detection::NotFound
}

pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
