use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{FrameAssembler, ScheduledAssembly};

/// Reassembly jobs keyed by timestamp. The head is always the lowest
/// timestamp, whatever order the jobs were pushed in.
struct DeadlineQueue {
    jobs: Mutex<(BTreeMap<u32, Instant>, bool)>,
    ready: Condvar,
}

impl DeadlineQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new((BTreeMap::new(), false)),
            ready: Condvar::new(),
        }
    }

    fn push(&self, job: ScheduledAssembly) {
        self.jobs.lock().0.insert(job.timestamp, job.deadline);
        self.ready.notify_one();
    }

    /// Block until the lowest timestamp's deadline has passed. `None` once
    /// closed.
    fn pop_due(&self) -> Option<ScheduledAssembly> {
        let mut guard = self.jobs.lock();
        loop {
            if guard.1 {
                return None;
            }
            match guard.0.first_key_value().map(|(&timestamp, &deadline)| (timestamp, deadline)) {
                Some((timestamp, deadline)) if deadline <= Instant::now() => {
                    guard.0.pop_first();
                    return Some(ScheduledAssembly { timestamp, deadline });
                }
                Some((_, deadline)) => {
                    self.ready.wait_until(&mut guard, deadline);
                }
                None => self.ready.wait(&mut guard),
            }
        }
    }

    fn close(&self) {
        let mut guard = self.jobs.lock();
        guard.1 = true;
        let dropped = guard.0.len();
        guard.0.clear();
        drop(guard);
        self.ready.notify_all();
        if dropped > 0 {
            tracing::debug!(dropped, "pending assembly jobs discarded");
        }
    }
}

/// Drives a [`FrameAssembler`] on two threads.
///
/// - **ticker**: every frame interval, asks the assembler for newly seen
///   timestamps and queues one job per timestamp.
/// - **worker**: sleeps until the lowest queued timestamp is due, then
///   resolves it. If an earlier timestamp turned up in the meantime, that
///   one is queued and the job waits its turn.
///
/// Jobs run one at a time, lowest timestamp first, so frames are delivered
/// in timestamp order.
pub struct AssemblyScheduler {
    assembler: Arc<FrameAssembler>,
    running: Arc<AtomicBool>,
    queue: Arc<DeadlineQueue>,
    ticker: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl AssemblyScheduler {
    /// Spawn the ticker and worker threads.
    pub fn start(assembler: Arc<FrameAssembler>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(DeadlineQueue::new());

        let ticker = {
            let running = running.clone();
            let queue = queue.clone();
            let assembler = assembler.clone();
            thread::Builder::new()
                .name("vidlink-ticker".into())
                .spawn(move || tick_loop(&assembler, &queue, &running))?
        };

        let worker = {
            let queue = queue.clone();
            let assembler = assembler.clone();
            thread::Builder::new()
                .name("vidlink-assembly".into())
                .spawn(move || work_loop(&assembler, &queue))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                ticker.thread().unpark();
                let _ = ticker.join();
                return Err(e);
            }
        };

        tracing::debug!("assembly scheduler started");
        Ok(Self {
            assembler,
            running,
            queue,
            ticker: Some(ticker),
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop both threads and wait for them. Queued jobs are discarded.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
        if let Some(ticker) = self.ticker.take() {
            ticker.thread().unpark();
            let _ = ticker.join();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            // Discarded jobs leave their groups open; let a later scheduler
            // pick them up again.
            self.assembler.unschedule_all();
        }
    }
}

impl Drop for AssemblyScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn work_loop(assembler: &FrameAssembler, queue: &DeadlineQueue) {
    while let Some(job) = queue.pop_due() {
        if assembler.resolve_in_order(job.timestamp).is_some() {
            continue;
        }
        tracing::trace!(timestamp = job.timestamp, "earlier timestamp still open, requeued");
        let earlier = assembler.schedule_due(Instant::now());
        if earlier.is_empty() {
            // The ticker has scheduled it and is about to push the job.
            thread::yield_now();
        }
        for job in earlier {
            queue.push(job);
        }
        queue.push(job);
    }
    tracing::debug!("assembly worker exited");
}

fn tick_loop(assembler: &FrameAssembler, queue: &DeadlineQueue, running: &AtomicBool) {
    let interval = assembler.frame_interval();
    let mut next_tick = Instant::now() + interval;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_tick {
            thread::park_timeout(next_tick - now);
            continue;
        }

        for job in assembler.schedule_due(now) {
            queue.push(job);
        }

        next_tick += interval;
        if next_tick <= now {
            next_tick = now + interval;
        }
    }
    tracing::debug!("assembly ticker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::InsertOutcome;
    use crate::media::Frame;
    use crate::packet::fragment;
    use std::time::Duration;

    #[test]
    fn deadline_queue_waits_for_deadline() {
        let q = DeadlineQueue::new();
        let start = Instant::now();
        q.push(ScheduledAssembly {
            timestamp: 1,
            deadline: start + Duration::from_millis(30),
        });
        let job = q.pop_due().unwrap();
        assert_eq!(job.timestamp, 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn deadline_queue_pops_lowest_timestamp_first() {
        let q = DeadlineQueue::new();
        let now = Instant::now();
        for timestamp in [3000, 1000, 2000] {
            q.push(ScheduledAssembly { timestamp, deadline: now });
        }
        let order: Vec<u32> = (0..3).map(|_| q.pop_due().unwrap().timestamp).collect();
        assert_eq!(order, vec![1000, 2000, 3000]);
    }

    #[test]
    fn deadline_queue_close_unblocks() {
        let q = Arc::new(DeadlineQueue::new());
        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.pop_due())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn scheduler_delivers_frames_in_timestamp_order() {
        let assembler = Arc::new(FrameAssembler::with_frame_interval(Duration::from_millis(10)));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        {
            let delivered = delivered.clone();
            assembler.add_subscriber(Arc::new(move |frame: &Frame| {
                delivered.lock().push(frame.timestamp);
            }));
        }

        for ts in [3000u32, 1000, 2000] {
            for p in fragment(&[7u8; 300], 112, ts, 1).unwrap() {
                assembler.insert(p);
            }
        }

        let mut scheduler = AssemblyScheduler::start(assembler.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while delivered.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();

        assert_eq!(*delivered.lock(), vec![1000, 2000, 3000]);
        assert_eq!(assembler.pending(), 0);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn earlier_timestamp_arriving_after_a_later_one_is_delivered_first() {
        let assembler = Arc::new(FrameAssembler::with_frame_interval(Duration::from_millis(30)));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        {
            let delivered = delivered.clone();
            assembler.add_subscriber(Arc::new(move |frame: &Frame| {
                delivered.lock().push(frame.timestamp);
            }));
        }

        for p in fragment(&[2u8; 300], 112, 2000, 1).unwrap() {
            assembler.insert(p);
        }
        let mut scheduler = AssemblyScheduler::start(assembler.clone()).unwrap();

        // The first tick has queued 2000 by now.
        thread::sleep(Duration::from_millis(40));
        for p in fragment(&[1u8; 300], 112, 1000, 1).unwrap() {
            assert_ne!(assembler.insert(p), InsertOutcome::Late);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while delivered.lock().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();

        assert_eq!(*delivered.lock(), vec![1000, 2000]);
        assert_eq!(assembler.stats().late_packets, 0);
        assert_eq!(assembler.pending(), 0);
    }
}
