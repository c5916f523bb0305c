use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, VidlinkError};
use crate::packet::Packet;

struct Entry {
    packet: Packet,
    expires: Instant,
}

struct IntakeState {
    entries: VecDeque<Entry>,
    closed: bool,
    expired: u64,
    evicted: u64,
}

/// Blocking FIFO whose entries expire.
///
/// Every packet is stamped with `now + ttl` on the way in. Consumers never
/// see an entry past its deadline: [`retrieve`](Self::retrieve) discards
/// stale entries while draining. The queue also holds at most `capacity`
/// entries, evicting the oldest when a new one arrives, so a packet storm
/// neither grows memory nor delays playback.
pub struct IntakeQueue {
    state: Mutex<IntakeState>,
    available: Condvar,
    ttl: Duration,
    capacity: usize,
}

impl IntakeQueue {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(IntakeState {
                entries: VecDeque::new(),
                closed: false,
                expired: 0,
                evicted: 0,
            }),
            available: Condvar::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Enqueue `packet`, received now.
    pub fn push(&self, packet: Packet) -> Result<()> {
        self.push_at(packet, Instant::now())
    }

    /// Enqueue `packet`, received at `now`. Fails once the queue is closed.
    pub fn push_at(&self, packet: Packet, now: Instant) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(VidlinkError::SocketClosed);
        }
        if state.entries.len() >= self.capacity {
            state.entries.pop_front();
            state.evicted += 1;
            tracing::trace!(capacity = self.capacity, "intake queue full, oldest packet evicted");
        }
        state.entries.push_back(Entry {
            packet,
            expires: now + self.ttl,
        });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an unexpired packet is available.
    ///
    /// Returns [`VidlinkError::SocketClosed`] once the queue is closed,
    /// including when it is closed while this call is waiting.
    pub fn retrieve(&self) -> Result<Packet> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(VidlinkError::SocketClosed);
            }
            if let Some(packet) = Self::take_fresh(&mut state, Instant::now()) {
                return Ok(packet);
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`retrieve`](Self::retrieve) but gives up after `timeout`,
    /// returning `Ok(None)`.
    pub fn retrieve_timeout(&self, timeout: Duration) -> Result<Option<Packet>> {
        let give_up = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(VidlinkError::SocketClosed);
            }
            let now = Instant::now();
            if let Some(packet) = Self::take_fresh(&mut state, now) {
                return Ok(Some(packet));
            }
            if now >= give_up {
                return Ok(None);
            }
            self.available.wait_until(&mut state, give_up);
        }
    }

    /// Pop entries until one is still within its deadline.
    fn take_fresh(state: &mut IntakeState, now: Instant) -> Option<Packet> {
        while let Some(entry) = state.entries.pop_front() {
            if entry.expires > now {
                return Some(entry.packet);
            }
            state.expired += 1;
            tracing::trace!(
                timestamp = entry.packet.timestamp(),
                seq = entry.packet.sequence_number(),
                "expired packet dropped"
            );
        }
        None
    }

    /// Refuse further pushes and wake every waiting consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.entries.clear();
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(expired, evicted)` counters.
    pub fn drop_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.expired, state.evicted)
    }
}
