//! Fixed-capacity pool of per-stream decode state.
//!
//! Allocation metadata sits behind one mutex. Each slot has its own mutex,
//! which stays uncontended as long as a single worker owns a handle's
//! packet sequence.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_STREAMS: usize = 256;
/// Destination ports a single stream may be delivered on.
pub const MAX_PORTS: usize = 8;

/// Opaque stream handle. Valid handles are `1..=MAX_STREAMS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u32);

impl StreamHandle {
    /// Wrap a raw value without checking it; registry calls reject handles
    /// that do not name a live slot.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    fn slot(self) -> Option<usize> {
        let raw = self.0 as usize;
        (1..=MAX_STREAMS).contains(&raw).then(|| raw - 1)
    }
}

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Up to [`MAX_PORTS`] destination ports; zero marks an empty slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortList([u16; MAX_PORTS]);

impl PortList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, port: u16) -> bool {
        port != 0 && self.0.contains(&port)
    }

    /// Record `port` in the first empty slot. Returns false when the list
    /// is full; a port already present is not duplicated.
    pub fn insert(&mut self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        if self.contains(port) {
            return true;
        }
        match self.0.iter_mut().find(|p| **p == 0) {
            Some(slot) => {
                *slot = port;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        self.0.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied().filter(|&p| p != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl FromIterator<u16> for PortList {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut list = PortList::new();
        for p in iter {
            list.insert(p);
        }
        list
    }
}

/// Decode state owned by one registry slot.
#[derive(Debug, Default)]
pub struct StreamEntry {
    pub(crate) in_use: bool,
    pub(crate) identifier: String,
    pub(crate) ports: PortList,
    /// Bytes prepended to the next payload.
    pub(crate) carry: Vec<u8>,
    /// Fingerprint of the payload `carry` was cut from.
    pub(crate) carry_origin: Option<u64>,
    /// Resume position inside the current (carry + payload) buffer.
    pub(crate) asn_index: usize,
    pub(crate) cc_packets: u64,
}

/// Selector for [`StreamRegistry::get_info`] / [`StreamRegistry::set_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamItem {
    DestPort(usize),
    DestPortList,
    InterceptPointId,
    AsnIndex,
    CcPacketCount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamValue {
    Port(u16),
    Ports(PortList),
    Id(String),
    Index(usize),
    Count(u64),
}

#[derive(Debug)]
struct AllocState {
    in_use: Vec<bool>,
    cursor: usize,
}

pub struct StreamRegistry {
    alloc: Mutex<AllocState>,
    slots: Box<[Mutex<StreamEntry>]>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        let slots = (0..MAX_STREAMS).map(|_| Mutex::new(StreamEntry::default())).collect();
        Self {
            alloc: Mutex::new(AllocState { in_use: vec![false; MAX_STREAMS], cursor: 0 }),
            slots,
        }
    }

    /// Claim a free slot for `identifier`, delivered on `dst_port`.
    pub fn create(&self, identifier: &str, dst_port: u16) -> Result<StreamHandle> {
        if identifier.is_empty() {
            return Err(Error::InvalidArgument("empty interception point identifier"));
        }
        if dst_port == 0 {
            return Err(Error::InvalidArgument("destination port is zero"));
        }

        let mut alloc = lock(&self.alloc);
        let start = alloc.cursor;
        let found = (0..MAX_STREAMS).map(|i| (start + i) % MAX_STREAMS).find(|&i| !alloc.in_use[i]);
        let Some(slot) = found else {
            log::warn!("stream registry full, cannot add '{}'", identifier);
            return Err(Error::RegistryFull);
        };

        alloc.in_use[slot] = true;
        alloc.cursor = (slot + 1) % MAX_STREAMS;

        let mut entry = lock(&self.slots[slot]);
        *entry = StreamEntry { in_use: true, identifier: identifier.to_string(), ..StreamEntry::default() };
        entry.ports.insert(dst_port);

        let handle = StreamHandle(slot as u32 + 1);
        log::debug!("stream {} created for '{}' on port {}", handle, identifier, dst_port);
        Ok(handle)
    }

    /// Free the slot behind `handle`; it can be handed out again at once.
    pub fn release(&self, handle: StreamHandle) -> Result<()> {
        let slot = handle.slot().ok_or(Error::InvalidHandle(handle.0))?;
        let mut alloc = lock(&self.alloc);
        if !alloc.in_use[slot] {
            return Err(Error::InvalidHandle(handle.0));
        }
        *lock(&self.slots[slot]) = StreamEntry::default();
        alloc.in_use[slot] = false;
        log::debug!("stream {} released", handle);
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        lock(&self.alloc).in_use.iter().filter(|&&u| u).count()
    }

    pub fn live_handles(&self) -> Vec<StreamHandle> {
        lock(&self.alloc)
            .in_use
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .map(|(i, _)| StreamHandle(i as u32 + 1))
            .collect()
    }

    /// Run `f` on the live entry behind `handle`.
    pub(crate) fn with_stream<T>(&self, handle: StreamHandle, f: impl FnOnce(&mut StreamEntry) -> T) -> Result<T> {
        let slot = handle.slot().ok_or(Error::InvalidHandle(handle.0))?;
        let mut entry = lock(&self.slots[slot]);
        if !entry.in_use {
            return Err(Error::InvalidHandle(handle.0));
        }
        Ok(f(&mut entry))
    }

    pub fn get_info(&self, handle: StreamHandle, item: StreamItem) -> Result<StreamValue> {
        self.with_stream(handle, |e| match item {
            StreamItem::DestPort(i) => {
                e.ports.get(i).map(StreamValue::Port).ok_or(Error::InvalidArgument("port index out of range"))
            }
            StreamItem::DestPortList => Ok(StreamValue::Ports(e.ports)),
            StreamItem::InterceptPointId => Ok(StreamValue::Id(e.identifier.clone())),
            StreamItem::AsnIndex => Ok(StreamValue::Index(e.asn_index)),
            StreamItem::CcPacketCount => Ok(StreamValue::Count(e.cc_packets)),
        })?
    }

    pub fn set_info(&self, handle: StreamHandle, item: StreamItem, value: StreamValue) -> Result<()> {
        self.with_stream(handle, |e| match (item, value) {
            (StreamItem::DestPort(i), StreamValue::Port(p)) => {
                let slot = e.ports.0.get_mut(i).ok_or(Error::InvalidArgument("port index out of range"))?;
                *slot = p;
                Ok(())
            }
            (StreamItem::DestPortList, StreamValue::Ports(list)) => {
                e.ports = list;
                Ok(())
            }
            (StreamItem::InterceptPointId, StreamValue::Id(id)) => {
                if id.is_empty() {
                    return Err(Error::InvalidArgument("empty interception point identifier"));
                }
                e.identifier = id;
                Ok(())
            }
            (StreamItem::AsnIndex, StreamValue::Index(i)) => {
                e.asn_index = i;
                Ok(())
            }
            (StreamItem::CcPacketCount, StreamValue::Count(n)) => {
                e.cc_packets = n;
                Ok(())
            }
            (StreamItem::DestPort(_), _) => Err(Error::InvalidStreamItem("DestPort")),
            (StreamItem::DestPortList, _) => Err(Error::InvalidStreamItem("DestPortList")),
            (StreamItem::InterceptPointId, _) => Err(Error::InvalidStreamItem("InterceptPointId")),
            (StreamItem::AsnIndex, _) => Err(Error::InvalidStreamItem("AsnIndex")),
            (StreamItem::CcPacketCount, _) => Err(Error::InvalidStreamItem("CcPacketCount")),
        })?
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
