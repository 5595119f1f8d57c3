//! Internet checksum (RFC 1071) primitives.

/// Word size the running sum is taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordWidth {
    #[default]
    Bits16,
    Bits8,
}

/// Running ones'-complement sum of `data`, folded to 16 bits.
///
/// `initial` lets a sum be continued over several buffers (pseudo-header,
/// then header, then body); every buffer but the last must have even length.
/// `omit_word` skips the word at that index, which is how a stored checksum
/// field is excluded while verifying. An odd trailing byte is zero-extended.
pub fn checksum(data: &[u8], initial: u32, omit_word: Option<usize>, width: WordWidth) -> u16 {
    let mut sum = initial;

    match width {
        WordWidth::Bits16 => {
            for (i, pair) in data.chunks(2).enumerate() {
                if omit_word == Some(i) {
                    continue;
                }
                let hi = u32::from(pair[0]) << 8;
                let lo = pair.get(1).copied().map(u32::from).unwrap_or(0);
                sum = fold_add(sum, hi | lo);
            }
        }
        WordWidth::Bits8 => {
            for (i, &b) in data.iter().enumerate() {
                if omit_word == Some(i) {
                    continue;
                }
                sum = fold_add(sum, u32::from(b));
            }
        }
    }

    fold(sum)
}

/// Complement of a folded sum, as stored in an IP/UDP header.
#[inline]
pub fn finish(sum: u16) -> u16 {
    !sum
}

/// True when the IPv4 header's stored checksum matches its contents.
pub fn ipv4_header_valid(header: &[u8]) -> bool {
    if header.len() < 20 || header.len() % 2 != 0 {
        return false;
    }
    let stored = u16::from_be_bytes([header[10], header[11]]);
    finish(checksum(header, 0, Some(5), WordWidth::Bits16)) == stored
}

/// True when the UDP datagram carried in an IPv6 packet has a valid checksum.
///
/// `src` and `dst` are the IPv6 addresses; `udp` covers the UDP header and
/// body exactly (its length is the pseudo-header's upper-layer length).
pub fn udp6_valid(src: &[u8; 16], dst: &[u8; 16], next_header: u8, udp: &[u8]) -> bool {
    if udp.len() < 8 {
        return false;
    }
    let stored = u16::from_be_bytes([udp[6], udp[7]]);
    if stored == 0 {
        // Zero is not a legal UDP checksum over IPv6.
        return false;
    }

    let mut pseudo = [0u8; 40];
    pseudo[..16].copy_from_slice(src);
    pseudo[16..32].copy_from_slice(dst);
    pseudo[32..36].copy_from_slice(&(udp.len() as u32).to_be_bytes());
    pseudo[39] = next_header;

    let partial = checksum(&pseudo, 0, None, WordWidth::Bits16);
    let mut computed = finish(checksum(udp, u32::from(partial), Some(3), WordWidth::Bits16));
    if computed == 0 {
        computed = 0xffff;
    }
    computed == stored
}

#[inline]
fn fold_add(sum: u32, word: u32) -> u32 {
    let s = sum + word;
    (s & 0xffff) + (s >> 16)
}

#[inline]
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
