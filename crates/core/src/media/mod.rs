//! Frames and the collaborators that produce and consume them.
//!
//! Capture, encoding and display live outside this crate. They plug in
//! through three narrow capabilities:
//!
//! - [`FrameSource`]: yields captured frames with their media timestamps.
//! - [`Encoder`]: turns a captured frame into the bytes that go on the wire.
//! - [`FrameListener`]: receives every reassembled frame on the far side.
//!
//! [`TestPatternSource`] and [`PassthroughEncoder`] are minimal
//! implementations used by the CLI and the tests.

use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;

/// A frame's bytes and its media timestamp.
///
/// On the sending side `data` is whatever the capture device produced; on
/// the receiving side it is the reassembled encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub timestamp: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, timestamp: u32) -> Self {
        Self { data, timestamp }
    }
}

/// Receives reassembled frames.
///
/// Implemented for any `Fn(&Frame) + Send + Sync` closure.
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, frame: &Frame);
}

impl<F> FrameListener for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) {
        self(frame)
    }
}

/// Capture device.
pub trait FrameSource: Send {
    /// Block, calling `on_frame` once per capture slot until the source is
    /// exhausted or `on_frame` returns [`ControlFlow::Break`].
    ///
    /// `None` marks a slot in which the device produced no frame. Returns
    /// an error only if the device cannot be opened.
    fn capture(&mut self, on_frame: &mut dyn FnMut(Option<Frame>) -> ControlFlow<()>)
    -> Result<()>;
}

/// Video encoder.
pub trait Encoder: Send {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>>;
}

/// Sends frame bytes unchanged. For input that is already encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncoder;

impl Encoder for PassthroughEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        Ok(frame.data.clone())
    }
}

/// Emits the same payload at a fixed rate.
///
/// Timestamps run on a 90 kHz clock, advancing by `90000 / fps` per frame
/// and starting at one increment.
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    payload: Vec<u8>,
    fps: u32,
    limit: Option<u64>,
}

impl TestPatternSource {
    pub fn new(payload: Vec<u8>, fps: u32) -> Self {
        Self {
            payload,
            fps: fps.max(1),
            limit: None,
        }
    }

    /// Payload of `size` bytes with a recognizable byte ramp.
    pub fn with_size(size: usize, fps: u32) -> Self {
        Self::new((0..size).map(|i| (i % 251) as u8).collect(), fps)
    }

    /// Stop after `frames` frames instead of running until told to stop.
    pub fn limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn timestamp_increment(&self) -> u32 {
        90_000 / self.fps
    }
}

impl FrameSource for TestPatternSource {
    fn capture(
        &mut self,
        on_frame: &mut dyn FnMut(Option<Frame>) -> ControlFlow<()>,
    ) -> Result<()> {
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.fps));
        let increment = self.timestamp_increment();
        let mut timestamp = 0u32;
        let mut emitted = 0u64;
        let mut next = Instant::now();

        while self.limit.is_none_or(|limit| emitted < limit) {
            timestamp = timestamp.wrapping_add(increment);
            let frame = Frame::new(self.payload.clone(), timestamp);
            if on_frame(Some(frame)).is_break() {
                break;
            }
            emitted += 1;

            next += interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }

        tracing::debug!(emitted, "test pattern source finished");
        Ok(())
    }
}
