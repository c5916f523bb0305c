use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::assembler::{AssemblerStats, AssemblyScheduler, FrameAssembler};
use crate::config::StreamConfig;
use crate::error::{Result, VidlinkError};
use crate::media::FrameListener;
use crate::transport::udp::set_recv_buffer;
use crate::transport::{IngressStats, PacketIngress};

/// Snapshot of a receiver's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverStats {
    pub ingress: IngressStats,
    pub assembler: AssemblerStats,
    /// Current jitter estimate in milliseconds.
    pub jitter_ms: f64,
}

/// Receiving pipeline: socket → ingress → assembler → subscribers.
///
/// Runs three kinds of threads while started:
///
/// - the ingress receive loop, blocking on the socket;
/// - a processing thread moving packets from the intake queue into the
///   assembler;
/// - the [`AssemblyScheduler`] ticker and worker.
///
/// ```no_run
/// use std::sync::Arc;
/// use vidlink::{Frame, StreamConfig, StreamReceiver};
/// use vidlink::transport::udp::bind_receiver;
///
/// let config = StreamConfig::default();
/// let socket = bind_receiver("0.0.0.0:5004", &config).unwrap();
/// let mut receiver = StreamReceiver::new(config).unwrap();
/// receiver.add_subscriber(Arc::new(|frame: &Frame| {
///     println!("frame {} ({} bytes)", frame.timestamp, frame.data.len());
/// }));
/// receiver.start(socket).unwrap();
/// ```
pub struct StreamReceiver {
    config: StreamConfig,
    ingress: Arc<PacketIngress>,
    assembler: Arc<FrameAssembler>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    scheduler: Option<AssemblyScheduler>,
}

impl StreamReceiver {
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ingress: Arc::new(PacketIngress::new(&config)),
            assembler: Arc::new(FrameAssembler::with_frame_interval(config.frame_interval())),
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            scheduler: None,
            config,
        })
    }

    /// Register a listener for reassembled frames.
    pub fn add_subscriber(&self, listener: Arc<dyn FrameListener>) {
        self.assembler.add_subscriber(listener);
    }

    pub fn assembler(&self) -> &Arc<FrameAssembler> {
        &self.assembler
    }

    /// Start receiving on `socket`. Returns once every thread is spawned.
    ///
    /// Each start begins a fresh stream: groups left from an earlier run
    /// are dropped and timestamps may start over.
    pub fn start(&mut self, socket: UdpSocket) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(VidlinkError::AlreadyRunning);
        }
        if self.ingress.is_closed() {
            self.ingress = Arc::new(PacketIngress::new(&self.config));
        }
        self.assembler.reset();
        set_recv_buffer(&socket, self.config.recv_buffer_size);
        let local = socket.local_addr()?;

        self.running.store(true, Ordering::SeqCst);

        let receive = {
            let ingress = self.ingress.clone();
            thread::Builder::new()
                .name("vidlink-recv".into())
                .spawn(move || {
                    if let Err(e) = ingress.start_receiving(socket) {
                        tracing::error!(error = %e, "receive loop failed");
                    }
                })
        };
        match receive {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        }

        let process = {
            let ingress = self.ingress.clone();
            let assembler = self.assembler.clone();
            thread::Builder::new()
                .name("vidlink-process".into())
                .spawn(move || process_loop(&ingress, &assembler))
        };
        match process {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        }

        match AssemblyScheduler::start(self.assembler.clone()) {
            Ok(scheduler) => self.scheduler = Some(scheduler),
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        }

        tracing::info!(
            %local,
            fps = self.config.fps,
            ttl = ?self.config.packet_ttl,
            "stream receiver started"
        );
        Ok(())
    }

    /// Close the ingress, stop the scheduler and join every thread.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.threads.is_empty() {
            return;
        }
        self.ingress.close();
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("stream receiver stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            ingress: self.ingress.stats(),
            assembler: self.assembler.stats(),
            jitter_ms: self.assembler.jitter_ms(),
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process_loop(ingress: &PacketIngress, assembler: &FrameAssembler) {
    loop {
        match ingress.retrieve() {
            Ok(packet) => {
                assembler.insert(packet);
            }
            Err(VidlinkError::SocketClosed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "packet retrieval failed");
            }
        }
    }
    tracing::debug!("processing loop exited");
}
