//! Live video over UDP.
//!
//! A sender fragments each encoded frame into MTU-sized packets and writes
//! them to a UDP socket. A receiver decodes datagrams into a TTL-bounded
//! intake queue, groups packets by frame timestamp and reassembles them on
//! a jitter-adaptive schedule, concealing small holes instead of stalling.
//!
//! Layers, bottom up:
//!
//! - [`packet`]: wire codec and fragmentation.
//! - [`transport`]: UDP ingress and egress.
//! - [`assembler`]: reassembly, jitter estimation and scheduling.
//! - [`StreamSender`] / [`StreamReceiver`]: the threaded pipelines.

pub mod assembler;
pub mod config;
pub mod error;
pub mod media;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod transport;

pub use assembler::{FrameAssembler, FrameOutcome, JitterEstimator};
pub use config::StreamConfig;
pub use error::{Result, VidlinkError};
pub use media::{Encoder, Frame, FrameListener, FrameSource, PassthroughEncoder, TestPatternSource};
pub use packet::{Fragmenter, Packet};
pub use receiver::{ReceiverStats, StreamReceiver};
pub use sender::{SenderStats, StreamSender};
pub use transport::{PacketEgress, PacketIngress};
