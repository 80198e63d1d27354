//! User-mode AQL ring queue.
//!
//! Producers reserve a packet index by atomically incrementing the write
//! index (a compare-and-swap taken only once the slot is free), fill the
//! packet body, release-store the header and ring the doorbell with the
//! packet index. The consumer (the agent) resets a finished slot to the
//! invalid header and advances the read index before it signals completion.

use crate::packet::{PACKET_WORDS, PacketHeader, PacketSink};
use crate::signal::Signal;
use crate::status::HsaStatus;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Unclaimed faults kept per queue.
pub const FAULT_LOG_CAPACITY: usize = 64;

/// One 64-byte packet slot.
#[derive(Debug)]
pub struct RingSlot {
    words: [AtomicU32; PACKET_WORDS],
}

impl RingSlot {
    fn new() -> Self {
        let slot = Self { words: std::array::from_fn(|_| AtomicU32::new(0)) };
        slot.words[0].store(u32::from(PacketHeader::invalid().encode()), Ordering::Relaxed);
        slot
    }

    /// Acquire-load word 0 (`header | setup << 16`).
    pub fn load_header_acquire(&self) -> u32 {
        self.words[0].load(Ordering::Acquire)
    }

    /// Snapshot the slot. Word 0 is acquire-loaded first so the body reads
    /// observe everything published before the header.
    pub fn snapshot(&self) -> [u32; PACKET_WORDS] {
        let mut out = [0u32; PACKET_WORDS];
        out[0] = self.load_header_acquire();
        for (dst, word) in out.iter_mut().zip(self.words.iter()).skip(1) {
            *dst = word.load(Ordering::Relaxed);
        }
        out
    }

    /// Hand the slot back to producers.
    pub fn retire(&self) {
        self.words[0].store(u32::from(PacketHeader::invalid().encode()), Ordering::Release);
    }
}

impl PacketSink for RingSlot {
    fn store_body_word(&self, index: usize, value: u32) {
        debug_assert!(index > 0 && index < PACKET_WORDS);
        self.words[index].store(value, Ordering::Relaxed);
    }

    fn store_header_word(&self, value: u32) {
        self.words[0].store(value, Ordering::Release);
    }
}

/// Error raised by the agent while processing a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFault {
    pub packet_index: u64,
    pub status: HsaStatus,
    pub message: String,
}

#[derive(Debug)]
pub struct Queue {
    id: u64,
    size: u32,
    ring: Box<[RingSlot]>,
    write_index: AtomicU64,
    read_index: AtomicU64,
    doorbell: Signal,
    faults: Mutex<VecDeque<QueueFault>>,
    active: AtomicBool,
}

impl Queue {
    /// Create a queue with `size` slots (a non-zero power of two).
    pub fn new(id: u64, size: u32, doorbell: Signal) -> Result<Self, HsaStatus> {
        if size == 0 || !size.is_power_of_two() {
            return Err(HsaStatus::InvalidQueueCreation);
        }
        Ok(Self {
            id,
            size,
            ring: (0..size).map(|_| RingSlot::new()).collect(),
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            doorbell,
            faults: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of packet slots.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn doorbell(&self) -> &Signal {
        &self.doorbell
    }

    pub fn load_write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    pub fn load_read_index(&self) -> u64 {
        self.read_index.load(Ordering::Acquire)
    }

    /// Consumer side: every packet below `index` has been retired.
    pub fn store_read_index(&self, index: u64) {
        self.read_index.store(index, Ordering::Release);
    }

    /// Physical slot for a packet index.
    pub fn slot_index(&self, packet_index: u64) -> usize {
        (packet_index & u64::from(self.size - 1)) as usize
    }

    pub fn slot(&self, packet_index: u64) -> &RingSlot {
        &self.ring[self.slot_index(packet_index)]
    }

    /// Whether the previous occupant of `packet_index`'s slot has been retired.
    pub fn slot_free(&self, packet_index: u64) -> bool {
        packet_index.saturating_sub(self.load_read_index()) < u64::from(self.size)
    }

    /// Reserve the next packet index if its slot is free.
    ///
    /// The write index only moves once the slot's previous occupant has been
    /// retired.
    pub fn try_reserve(&self) -> Option<u64> {
        let mut index = self.write_index.load(Ordering::Acquire);
        loop {
            if !self.slot_free(index) {
                return None;
            }
            match self.write_index.compare_exchange_weak(
                index,
                index + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => index = current,
            }
        }
    }

    /// Block until a packet index can be reserved, or `timeout` elapses.
    pub fn reserve(&self, timeout: Option<Duration>) -> Option<u64> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0u32;
        loop {
            if let Some(index) = self.try_reserve() {
                return Some(index);
            }
            if !self.is_active() || deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            if spins < 64 {
                spins += 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }

    /// Tell the agent that packets up to `packet_index` are ready.
    pub fn ring_doorbell(&self, packet_index: u64) {
        self.doorbell.store_release(packet_index as i64);
    }

    /// Log a fault; the oldest entry is dropped once the log is full.
    pub fn record_fault(&self, fault: QueueFault) {
        let mut faults = self.faults();
        if faults.len() >= FAULT_LOG_CAPACITY {
            if let Some(dropped) = faults.pop_front() {
                trace!(queue = self.id, index = dropped.packet_index, "dropping unclaimed fault");
            }
        }
        faults.push_back(fault);
    }

    /// Remove and return the fault raised for `packet_index`, if any.
    pub fn take_fault(&self, packet_index: u64) -> Option<QueueFault> {
        let mut faults = self.faults();
        let pos = faults.iter().position(|f| f.packet_index == packet_index)?;
        faults.remove(pos)
    }

    /// Faults recorded and not yet claimed.
    pub fn pending_faults(&self) -> usize {
        self.faults().len()
    }

    fn faults(&self) -> MutexGuard<'_, VecDeque<QueueFault>> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the consumer; pending producers waiting for a slot give up.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        // Wake a consumer blocked on the doorbell.
        self.doorbell.store_release(i64::MAX);
    }
}
