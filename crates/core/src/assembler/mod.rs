//! Receiver-side frame reassembly.
//!
//! Packets are grouped by frame timestamp. A timestamp moves through:
//!
//! ```text
//! absent ──first packet──> accumulating ──resolve──> complete   (frame delivered)
//!                               │   ^                 abandoned (frame dropped)
//!                               └───┘ more packets
//! ```
//!
//! `complete` and `abandoned` are terminal: the group and its arrival
//! bookkeeping are removed. A later packet for that timestamp, or for any
//! earlier timestamp without an open group, is rejected as late. A packet
//! from a different SSRC, or one far behind the newest resolved timestamp,
//! marks a restarted stream and clears that watermark.
//!
//! ## Loss concealment
//!
//! When resolving, every sequence number between the group's lowest and
//! highest must be present. A hole is filled with the preceding fragment's
//! payload if the last packet for this timestamp arrived no more than
//! `round(1.5 * jitter)` ms ago; otherwise the whole frame is abandoned.
//!
//! ## Scheduling
//!
//! [`FrameAssembler::schedule_due`] hands out one reassembly job per
//! timestamp with a deadline of `now + max(interval, interval + round(jitter))`.
//! Deadlines never decrease, and [`AssemblyScheduler`] only resolves a
//! timestamp once no earlier one is open, so frames are delivered in
//! timestamp order.

pub mod jitter;
pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::media::{Frame, FrameListener};
use crate::packet::Packet;

pub use jitter::JitterEstimator;
pub use scheduler::AssemblyScheduler;

/// Multiplier on the jitter estimate that bounds how stale a frame may be
/// and still have its holes concealed.
pub const CONCEALMENT_FACTOR: f64 = 1.5;

/// What happened to a packet handed to [`FrameAssembler::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First packet of its timestamp: a new group was opened.
    Created,
    /// Added to an existing group.
    Added,
    /// Same sequence number already present; the new packet replaced it.
    Replaced,
    /// At or below the last resolved timestamp with no open group. Dropped.
    Late,
}

/// Result of one reassembly attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Frame delivered to subscribers. `concealed` slots were filled with
    /// the preceding payload.
    Completed { frame: Frame, concealed: usize },
    /// A hole could not be concealed; nothing was delivered.
    Abandoned {
        timestamp: u32,
        missing: u16,
        received: usize,
    },
    /// No group for this timestamp (never seen, or already resolved).
    Absent,
}

/// A reassembly attempt due at `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledAssembly {
    pub timestamp: u32,
    pub deadline: Instant,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Frames delivered, concealed ones included.
    pub completed: u64,
    /// Delivered frames that needed at least one concealed slot.
    pub concealed: u64,
    /// Frames dropped for an unconcealable hole.
    pub abandoned: u64,
    /// Packets rejected because their timestamp was already resolved.
    pub late_packets: u64,
    /// Total slots filled by concealment.
    pub concealed_slots: u64,
    /// Times a new stream was detected on the same assembler.
    pub restarts: u64,
}

/// Fragments of one timestamp, keyed by sequence number unwrapped around
/// the first fragment seen.
#[derive(Debug)]
struct PacketGroup {
    anchor: u16,
    packets: BTreeMap<i32, Packet>,
    scheduled: bool,
}

impl PacketGroup {
    fn new(anchor: u16) -> Self {
        Self {
            anchor,
            packets: BTreeMap::new(),
            scheduled: false,
        }
    }

    /// Returns `true` if a packet with the same sequence number was replaced.
    fn insert(&mut self, packet: Packet) -> bool {
        let key = unwrap_sequence(self.anchor, packet.sequence_number());
        self.packets.insert(key, packet).is_some()
    }
}

/// Place `seq` on a linear axis around `anchor` so that a run crossing the
/// 65535 → 0 wrap stays ordered.
fn unwrap_sequence(anchor: u16, seq: u16) -> i32 {
    i32::from(anchor) + i32::from(seq.wrapping_sub(anchor) as i16)
}

/// Backward timestamp jump, in 90 kHz ticks, read as a restarted sender
/// rather than a late packet. Ten seconds.
pub const STREAM_RESTART_JUMP: u32 = 900_000;

struct AssemblerState {
    groups: BTreeMap<u32, PacketGroup>,
    jitter: JitterEstimator,
    ssrc: Option<u32>,
    last_deadline: Option<Instant>,
    last_resolved: Option<u32>,
    stats: AssemblerStats,
}

impl AssemblerState {
    fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            jitter: JitterEstimator::new(),
            ssrc: None,
            last_deadline: None,
            last_resolved: None,
            stats: AssemblerStats::default(),
        }
    }

    /// A timestamp at or below the newest resolved one can only join a
    /// group that is still open.
    fn is_late(&self, timestamp: u32) -> bool {
        self.last_resolved.is_some_and(|r| timestamp <= r)
            && !self.groups.contains_key(&timestamp)
    }

    /// Forget the resolved-timestamp watermark when `packet` belongs to a
    /// new stream: a different SSRC, or a timestamp far behind the
    /// watermark.
    fn detect_restart(&mut self, packet: &Packet) {
        let ssrc = packet.ssrc();
        let timestamp = packet.timestamp();
        let new_source = self.ssrc.is_some_and(|s| s != ssrc);
        let jumped_back = self
            .last_resolved
            .is_some_and(|r| r.saturating_sub(timestamp) > STREAM_RESTART_JUMP);
        if new_source || jumped_back {
            tracing::info!(
                ssrc = format_args!("{:#010X}", ssrc),
                timestamp,
                last_resolved = ?self.last_resolved,
                "stream restarted, ordering state reset"
            );
            self.last_resolved = None;
            self.stats.restarts += 1;
        }
        self.ssrc = Some(ssrc);
    }

    /// Remove the group for `timestamp` and reassemble it as of `now`.
    fn take_and_reassemble(&mut self, timestamp: u32, now: Instant) -> FrameOutcome {
        let Some(group) = self.groups.remove(&timestamp) else {
            tracing::debug!(timestamp, "no packets buffered for timestamp");
            return FrameOutcome::Absent;
        };

        let last_arrival = self.jitter.last_arrival(timestamp);
        self.jitter.forget(timestamp);
        self.last_resolved = Some(self.last_resolved.map_or(timestamp, |r| r.max(timestamp)));

        let jitter = self.jitter.current_estimate();
        let threshold = Duration::from_millis((jitter * CONCEALMENT_FACTOR).round().max(0.0) as u64);
        let since_last = last_arrival
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::MAX);

        let outcome = reassemble(timestamp, group, since_last <= threshold);
        match &outcome {
            FrameOutcome::Completed { concealed, .. } => {
                self.stats.completed += 1;
                if *concealed > 0 {
                    self.stats.concealed += 1;
                    self.stats.concealed_slots += *concealed as u64;
                }
            }
            FrameOutcome::Abandoned {
                missing, received, ..
            } => {
                self.stats.abandoned += 1;
                tracing::warn!(
                    timestamp,
                    missing,
                    received,
                    jitter_ms = jitter,
                    since_last_ms = since_last.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "frame abandoned: packet missing beyond jitter threshold"
                );
            }
            FrameOutcome::Absent => {}
        }
        outcome
    }
}

/// Jitter-adaptive frame reassembler.
///
/// Thread-safe: ingress threads call [`insert`](Self::insert) while the
/// scheduler calls [`schedule_due`](Self::schedule_due) and
/// [`resolve`](Self::resolve). All per-timestamp state lives behind one
/// mutex, so insert-or-create and remove-then-reassemble are atomic and a
/// frame is delivered at most once. Subscribers run outside that lock.
pub struct FrameAssembler {
    state: Mutex<AssemblerState>,
    subscribers: RwLock<Vec<Arc<dyn FrameListener>>>,
    frame_interval: Duration,
}

impl FrameAssembler {
    /// Create an assembler pacing itself to `fps` frames per second.
    pub fn new(fps: u32) -> Self {
        Self::with_frame_interval(Duration::from_secs_f64(1.0 / f64::from(fps.max(1))))
    }

    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            state: Mutex::new(AssemblerState::new()),
            subscribers: RwLock::new(Vec::new()),
            frame_interval,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Register a listener for completed frames. Listeners are called in
    /// registration order.
    pub fn add_subscriber(&self, listener: Arc<dyn FrameListener>) {
        self.subscribers.write().push(listener);
    }

    /// Add a received packet, stamped with the current time.
    pub fn insert(&self, packet: Packet) -> InsertOutcome {
        self.insert_at(packet, Instant::now())
    }

    /// Add a received packet that arrived at `arrival`.
    pub fn insert_at(&self, packet: Packet, arrival: Instant) -> InsertOutcome {
        let timestamp = packet.timestamp();
        let seq = packet.sequence_number();
        let mut state = self.state.lock();

        state.detect_restart(&packet);
        if state.is_late(timestamp) {
            state.stats.late_packets += 1;
            tracing::trace!(timestamp, seq, "late packet dropped");
            return InsertOutcome::Late;
        }

        state.jitter.observe(timestamp, arrival);

        let mut created = false;
        let group = state.groups.entry(timestamp).or_insert_with(|| {
            created = true;
            PacketGroup::new(seq)
        });
        let replaced = group.insert(packet);

        tracing::trace!(timestamp, seq, created, replaced, "packet buffered");

        if created {
            InsertOutcome::Created
        } else if replaced {
            InsertOutcome::Replaced
        } else {
            InsertOutcome::Added
        }
    }

    /// Wait applied before a newly observed timestamp is resolved:
    /// `max(interval, interval + round(jitter))`.
    pub fn assembly_delay(&self) -> Duration {
        let jitter = self.state.lock().jitter.current_estimate();
        self.delay_for(jitter)
    }

    fn delay_for(&self, jitter_ms: f64) -> Duration {
        let compensation = Duration::from_millis(jitter_ms.round().max(0.0) as u64);
        self.frame_interval.max(self.frame_interval + compensation)
    }

    /// Hand out one reassembly job for every timestamp not yet scheduled,
    /// in timestamp order, each due `assembly_delay()` after `now`.
    ///
    /// A timestamp is handed out once, unless the scheduler holding its job
    /// stops first.
    pub fn schedule_due(&self, now: Instant) -> Vec<ScheduledAssembly> {
        let mut state = self.state.lock();
        let jitter = state.jitter.current_estimate();
        let delay = self.delay_for(jitter);
        let mut deadline = now + delay;
        if let Some(previous) = state.last_deadline {
            deadline = deadline.max(previous);
        }

        let mut jobs = Vec::new();
        for (&timestamp, group) in state.groups.iter_mut() {
            if group.scheduled {
                continue;
            }
            group.scheduled = true;
            jobs.push(ScheduledAssembly {
                timestamp,
                deadline,
            });
            tracing::debug!(
                timestamp,
                packets = group.packets.len(),
                jitter_ms = jitter,
                delay_ms = delay.as_millis() as u64,
                "frame assembly scheduled"
            );
        }

        if !jobs.is_empty() {
            state.last_deadline = Some(deadline);
        }
        jobs
    }

    /// Attempt reassembly of `timestamp` now.
    pub fn resolve(&self, timestamp: u32) -> FrameOutcome {
        self.resolve_at(timestamp, Instant::now())
    }

    /// Attempt reassembly of `timestamp` as of `now`.
    ///
    /// Removes the group whatever the result. A completed frame is handed
    /// to every subscriber before being returned.
    pub fn resolve_at(&self, timestamp: u32, now: Instant) -> FrameOutcome {
        let outcome = self.state.lock().take_and_reassemble(timestamp, now);
        self.deliver(&outcome);
        outcome
    }

    /// Resolve `timestamp` only if no earlier timestamp is still open.
    ///
    /// Returns `None`, leaving every group untouched, when an earlier group
    /// must be resolved first. The check and the removal happen under one
    /// lock, so frames handed out this way are strictly ordered.
    pub fn resolve_in_order(&self, timestamp: u32) -> Option<FrameOutcome> {
        let outcome = {
            let mut state = self.state.lock();
            let blocked = state
                .groups
                .first_key_value()
                .is_some_and(|(&earliest, _)| earliest < timestamp);
            if blocked {
                return None;
            }
            state.take_and_reassemble(timestamp, Instant::now())
        };
        self.deliver(&outcome);
        Some(outcome)
    }

    /// Drop every open group and the ordering state, for a fresh stream.
    /// Counters and subscribers are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let dropped = state.groups.len();
        let stats = state.stats;
        *state = AssemblerState::new();
        state.stats = stats;
        tracing::debug!(dropped, "assembler reset");
    }

    /// Mark every open group unscheduled so the next
    /// [`schedule_due`](Self::schedule_due) hands them out again.
    pub(crate) fn unschedule_all(&self) {
        for group in self.state.lock().groups.values_mut() {
            group.scheduled = false;
        }
    }

    fn deliver(&self, outcome: &FrameOutcome) {
        if let FrameOutcome::Completed { frame, concealed } = outcome {
            tracing::debug!(
                timestamp = frame.timestamp,
                bytes = frame.data.len(),
                concealed,
                "frame assembled"
            );
            self.notify(frame);
        }
    }

    fn notify(&self, frame: &Frame) {
        let subscribers = self.subscribers.read().clone();
        for listener in &subscribers {
            listener.on_frame(frame);
        }
    }

    /// Current jitter estimate in milliseconds.
    pub fn jitter_ms(&self) -> f64 {
        self.state.lock().jitter.current_estimate()
    }

    /// Number of timestamps still accumulating.
    pub fn pending(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Whether `timestamp` has a group in flight.
    pub fn contains(&self, timestamp: u32) -> bool {
        self.state.lock().groups.contains_key(&timestamp)
    }

    /// Number of timestamps with arrival bookkeeping. Equals
    /// [`pending`](Self::pending) at rest.
    pub fn tracked_arrivals(&self) -> usize {
        self.state.lock().jitter.tracked()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.state.lock().stats
    }
}

/// Concatenate a group's payloads in sequence order, concealing holes when
/// `conceal` allows it.
fn reassemble(timestamp: u32, group: PacketGroup, conceal: bool) -> FrameOutcome {
    let received = group.packets.len();
    let (Some(&first), Some(&last)) = (group.packets.keys().next(), group.packets.keys().next_back())
    else {
        return FrameOutcome::Absent;
    };

    let mut data = Vec::with_capacity(group.packets.values().map(|p| p.payload().len()).sum());
    let mut previous: Option<&[u8]> = None;
    let mut concealed = 0usize;

    for key in first..=last {
        match (group.packets.get(&key), previous) {
            (Some(packet), _) => {
                data.extend_from_slice(packet.payload());
                previous = Some(packet.payload());
            }
            (None, Some(prev)) if conceal => {
                tracing::warn!(
                    timestamp,
                    seq = key as u16,
                    "packet missing, concealed with previous payload"
                );
                data.extend_from_slice(prev);
                concealed += 1;
            }
            (None, _) => {
                return FrameOutcome::Abandoned {
                    timestamp,
                    missing: key as u16,
                    received,
                };
            }
        }
    }

    FrameOutcome::Completed {
        frame: Frame { data, timestamp },
        concealed,
    }
}
