use std::net::{SocketAddr, UdpSocket};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::StreamConfig;
use crate::error::{Result, VidlinkError};
use crate::media::{Encoder, Frame, FrameSource};
use crate::transport::PacketEgress;

/// Snapshot of a sender's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Frames encoded and handed to the egress.
    pub frames: u64,
    /// Capture slots that produced no frame.
    pub skipped: u64,
    /// Frames the encoder rejected.
    pub encode_failures: u64,
    pub packets_sent: u64,
    pub packets_failed: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    skipped: AtomicU64,
    encode_failures: AtomicU64,
    packets_sent: AtomicU64,
    packets_failed: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SenderStats {
        SenderStats {
            frames: self.frames.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_failed: self.packets_failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Sending pipeline: source → encoder → egress.
///
/// One thread drives the [`FrameSource`]; each captured frame is encoded
/// and sent before the next is requested. The thread ends when the source
/// is exhausted or [`stop`](Self::stop) is called.
pub struct StreamSender {
    egress: Arc<PacketEgress>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker: Option<JoinHandle<()>>,
}

impl StreamSender {
    pub fn new(config: &StreamConfig, destination: SocketAddr) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            egress: Arc::new(PacketEgress::new(config, destination)?),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            worker: None,
        })
    }

    /// Open the egress on `socket` and start the capture thread.
    pub fn start(
        &mut self,
        socket: UdpSocket,
        mut source: Box<dyn FrameSource>,
        mut encoder: Box<dyn Encoder>,
    ) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(VidlinkError::AlreadyRunning);
        }
        // Reap a worker whose source ran dry.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.egress.open(socket)?;
        self.running.store(true, Ordering::SeqCst);

        let egress = self.egress.clone();
        let running = self.running.clone();
        let counters = self.counters.clone();
        let spawned = thread::Builder::new()
            .name("vidlink-send".into())
            .spawn(move || {
                let result = source.capture(&mut |frame: Option<Frame>| {
                    if !running.load(Ordering::SeqCst) {
                        return ControlFlow::Break(());
                    }
                    match frame {
                        Some(frame) => send_frame(&frame, encoder.as_mut(), &egress, &counters),
                        None => {
                            counters.skipped.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("capture produced no frame");
                            ControlFlow::Continue(())
                        }
                    }
                });
                if let Err(e) = result {
                    tracing::error!(error = %e, "capture failed");
                }
                running.store(false, Ordering::SeqCst);
                egress.close();
                tracing::debug!("send loop exited");
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                tracing::info!(destination = %self.egress.destination(), "stream sender started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.egress.close();
                Err(e.into())
            }
        }
    }

    /// Block until the source is exhausted or the sender is stopped.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Stop capturing and close the egress.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.wait();
        self.egress.close();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn ssrc(&self) -> u32 {
        self.egress.ssrc()
    }

    pub fn stats(&self) -> SenderStats {
        self.counters.snapshot()
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_frame(
    frame: &Frame,
    encoder: &mut dyn Encoder,
    egress: &PacketEgress,
    counters: &Counters,
) -> ControlFlow<()> {
    let encoded = match encoder.encode(frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            counters.encode_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(timestamp = frame.timestamp, error = %e, "encode failed, frame skipped");
            return ControlFlow::Continue(());
        }
    };

    match egress.send(&encoded, frame.timestamp) {
        Ok(report) => {
            counters.frames.fetch_add(1, Ordering::Relaxed);
            counters.packets_sent.fetch_add(report.sent as u64, Ordering::Relaxed);
            counters.packets_failed.fetch_add(report.failed as u64, Ordering::Relaxed);
            counters.bytes.fetch_add(report.bytes as u64, Ordering::Relaxed);
            tracing::trace!(
                timestamp = frame.timestamp,
                packets = report.packets,
                bytes = report.bytes,
                "frame sent"
            );
            ControlFlow::Continue(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "egress unavailable, stopping send loop");
            ControlFlow::Break(())
        }
    }
}
