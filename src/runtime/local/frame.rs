//! Frame descriptors moved between local nodes.
//!
//! No pixel data travels through the local runtime. A [`Frame`] carries the
//! geometry, layout and timing a real buffer would have, which is all graph
//! behaviour depends on.

use crate::node::PixelFormat;
use smallvec::SmallVec;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// What a frame's (absent) data would hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Raw pixels in a layout.
    Raw(PixelFormat),
    /// Compressed picture.
    Encoded {
        /// Whether the picture can be decoded on its own.
        keyframe: bool,
    },
}

/// One input placed on a composite frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    /// Compositor input index.
    pub input: usize,
    /// Left edge on the canvas.
    pub x: i32,
    /// Top edge on the canvas.
    pub y: i32,
    /// Width of the placed frame.
    pub width: u32,
    /// Height of the placed frame.
    pub height: u32,
    /// Sequence number of the placed frame.
    pub sequence: u64,
}

/// A frame descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position in the stream of the node that produced it.
    pub sequence: u64,
    /// Presentation timestamp.
    pub pts: Duration,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Data description.
    pub payload: Payload,
    /// Inputs composited into this frame. Empty unless it left a compositor.
    pub layers: SmallVec<[Layer; 4]>,
}

impl Frame {
    /// A raw frame with no layers.
    pub fn raw(sequence: u64, pts: Duration, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            sequence,
            pts,
            width,
            height,
            payload: Payload::Raw(format),
            layers: SmallVec::new(),
        }
    }

    /// Pixel layout, if the frame is raw.
    pub fn format(&self) -> Option<PixelFormat> {
        match self.payload {
            Payload::Raw(format) => Some(format),
            Payload::Encoded { .. } => None,
        }
    }

    /// Bytes the frame's data would occupy. Encoded frames report zero.
    pub fn byte_size(&self) -> u64 {
        self.format()
            .map_or(0, |f| f.frame_size(self.width, self.height))
    }
}

/// Maps a fixed frame rate onto timestamps.
///
/// Slot `k` sits at `k / rate` seconds. Rate conversion and compositing emit
/// one frame per slot that an incoming timestamp reaches, so incoming frames
/// are dropped when slots are sparser and repeated when they are denser.
#[derive(Debug, Clone)]
pub struct FrameClock {
    rate: u32,
    next_slot: u64,
}

impl FrameClock {
    /// A clock ticking `rate` times per second. A zero rate is treated as one.
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            next_slot: 0,
        }
    }

    /// Ticks per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Timestamp of a slot.
    pub fn slot_pts(&self, slot: u64) -> Duration {
        pts_for(slot, self.rate)
    }

    /// Slots due up to and including `pts`, consuming them.
    pub fn advance(&mut self, pts: Duration) -> std::ops::Range<u64> {
        let start = self.next_slot;
        while self.slot_pts(self.next_slot) <= pts {
            self.next_slot += 1;
        }
        start..self.next_slot
    }
}

/// Timestamp of frame `index` in a stream running at `rate` frames per second.
pub fn pts_for(index: u64, rate: u32) -> Duration {
    let nanos = u128::from(index) * NANOS_PER_SEC / u128::from(rate.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
