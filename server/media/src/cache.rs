//! Per-sender datagram ring for NACK retransmission.

use bytes::Bytes;
use parking_lot::Mutex;

/// Ring capacity. Sequence numbers index `seq % SLOTS`, so the cache holds
/// the most recent 128 datagrams from a sender.
pub const SLOTS: usize = 128;

#[derive(Clone, Default)]
struct Slot {
    seq: u16,
    data: Bytes,
    set: bool,
}

/// One mutex is enough here: NACK lookups are orders of magnitude rarer
/// than datagram writes, and the critical section is a slot copy.
pub struct DatagramCache {
    slots: Mutex<Vec<Slot>>,
}

impl Default for DatagramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![Slot::default(); SLOTS]),
        }
    }

    /// Store a datagram after its sender id has been stamped. Overwrites
    /// whatever previously occupied the slot.
    pub fn insert(&self, seq: u16, data: Bytes) {
        let mut slots = self.slots.lock();
        slots[seq as usize % SLOTS] = Slot {
            seq,
            data,
            set: true,
        };
    }

    /// Retrieve the datagram for `seq` if it is still in the ring.
    pub fn lookup(&self, seq: u16) -> Option<Bytes> {
        let slots = self.slots.lock();
        let slot = &slots[seq as usize % SLOTS];
        if slot.set && slot.seq == seq {
            Some(slot.data.clone())
        } else {
            None
        }
    }
}
