//! Per-kind processing for the local runtime.
//!
//! Each transform is a [`Stage`]: frames in, zero or more frames out. Sinks
//! are [`Terminal`]s. The executor owns the channels and tasks and only calls
//! into these.

use super::frame::{Frame, FrameClock, Layer, Payload};
use crate::error::Result;
use crate::layout::LayoutTile;
use crate::node::PixelFormat;
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Output of one processing step.
pub type Emitted = SmallVec<[Frame; 2]>;

/// A transform between one input and one output.
pub trait Stage: Send {
    /// Handle one frame.
    fn process(&mut self, frame: Frame, out: &mut Emitted) -> Result<()>;

    /// Flush at end-of-stream.
    fn finish(&mut self, _out: &mut Emitted) -> Result<()> {
        Ok(())
    }
}

/// A frame consumer at the end of the graph.
pub trait Terminal: Send {
    /// Handle one frame.
    fn consume(&mut self, frame: &Frame) -> Result<()>;

    /// Finalize at end-of-stream.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards frames unchanged. The buffering is in the link feeding it.
pub struct Passthrough;

impl Stage for Passthrough {
    fn process(&mut self, frame: Frame, out: &mut Emitted) -> Result<()> {
        out.push(frame);
        Ok(())
    }
}

/// Drops or repeats frames to hit a fixed rate.
pub struct RateConvert {
    clock: Option<FrameClock>,
}

impl RateConvert {
    /// Convert to `rate`, or pass through when unset.
    pub fn new(rate: Option<u32>) -> Self {
        Self {
            clock: rate.map(FrameClock::new),
        }
    }
}

impl Stage for RateConvert {
    fn process(&mut self, frame: Frame, out: &mut Emitted) -> Result<()> {
        let Some(clock) = self.clock.as_mut() else {
            out.push(frame);
            return Ok(());
        };
        for slot in clock.advance(frame.pts) {
            out.push(Frame {
                sequence: slot,
                pts: clock.slot_pts(slot),
                ..frame.clone()
            });
        }
        Ok(())
    }
}

/// Rescales frames to a fixed size.
pub struct Scale {
    size: Option<(u32, u32)>,
}

impl Scale {
    /// Scale to `size`, or pass through when unset.
    pub fn new(size: Option<(u32, u32)>) -> Self {
        Self { size }
    }
}

impl Stage for Scale {
    fn process(&mut self, mut frame: Frame, out: &mut Emitted) -> Result<()> {
        if let Some((width, height)) = self.size {
            frame.width = width;
            frame.height = height;
        }
        out.push(frame);
        Ok(())
    }
}

/// Converts the pixel layout.
pub struct Convert {
    format: Option<PixelFormat>,
}

impl Convert {
    /// Convert to `format`, or pass through when unset.
    pub fn new(format: Option<PixelFormat>) -> Self {
        Self { format }
    }
}

impl Stage for Convert {
    fn process(&mut self, mut frame: Frame, out: &mut Emitted) -> Result<()> {
        if let (Some(format), Payload::Raw(_)) = (self.format, frame.payload) {
            frame.payload = Payload::Raw(format);
        }
        out.push(frame);
        Ok(())
    }
}

/// Marks frames as encoded, with a keyframe at every GOP boundary.
pub struct Encode {
    gop: u64,
    count: u64,
}

impl Encode {
    /// Keyframe every `gop` frames.
    pub fn new(gop: u64) -> Self {
        Self {
            gop: gop.max(1),
            count: 0,
        }
    }
}

impl Stage for Encode {
    fn process(&mut self, mut frame: Frame, out: &mut Emitted) -> Result<()> {
        frame.payload = Payload::Encoded {
            keyframe: self.count % self.gop == 0,
        };
        frame.sequence = self.count;
        self.count += 1;
        out.push(frame);
        Ok(())
    }
}

/// Drops encoded frames until the first keyframe so the container starts decodable.
#[derive(Default)]
pub struct Mux {
    started: bool,
}

impl Stage for Mux {
    fn process(&mut self, frame: Frame, out: &mut Emitted) -> Result<()> {
        if let Payload::Encoded { keyframe } = frame.payload {
            self.started |= keyframe;
        }
        if self.started {
            out.push(frame);
        }
        Ok(())
    }
}

/// Places the latest frame of every input on a canvas at a fixed rate.
pub struct Composite {
    width: u32,
    height: u32,
    clock: FrameClock,
    tiles: Vec<Option<LayoutTile>>,
    latest: Vec<Option<Frame>>,
}

impl Composite {
    /// One entry in `tiles` per input, in input order.
    pub fn new(width: u32, height: u32, framerate: u32, tiles: Vec<Option<LayoutTile>>) -> Self {
        let latest = vec![None; tiles.len()];
        Self {
            width,
            height,
            clock: FrameClock::new(framerate),
            tiles,
            latest,
        }
    }

    /// Take a frame on `input` and emit any composite frames now due.
    ///
    /// Returns a warning when the frame does not match its tile.
    pub fn push(&mut self, input: usize, frame: Frame, out: &mut Emitted) -> Option<String> {
        let warning = match self.tiles.get(input).copied().flatten() {
            Some(tile) if (tile.width, tile.height) != (frame.width, frame.height) => Some(format!(
                "input {input} delivers {}x{} into a {}x{} tile",
                frame.width, frame.height, tile.width, tile.height
            )),
            Some(_) => None,
            None => Some(format!("input {input} has no placement")),
        };

        let pts = frame.pts;
        let format = frame.format().unwrap_or_default();
        if let Some(slot) = self.latest.get_mut(input) {
            *slot = Some(frame);
        }

        for slot in self.clock.advance(pts) {
            let mut composite =
                Frame::raw(slot, self.clock.slot_pts(slot), self.width, self.height, format);
            composite.layers = self
                .latest
                .iter()
                .enumerate()
                .filter_map(|(i, f)| {
                    let (f, tile) = (f.as_ref()?, self.tiles.get(i).copied().flatten()?);
                    Some(Layer {
                        input: i,
                        x: tile.x,
                        y: tile.y,
                        width: f.width,
                        height: f.height,
                        sequence: f.sequence,
                    })
                })
                .collect();
            out.push(composite);
        }
        warning
    }
}

/// Logs frames as if presenting them.
pub struct DisplaySink {
    name: String,
}

impl DisplaySink {
    /// Create a display sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Terminal for DisplaySink {
    fn consume(&mut self, frame: &Frame) -> Result<()> {
        tracing::trace!(
            "{} presents frame {} ({}x{}, {} layers) at {:?}",
            self.name,
            frame.sequence,
            frame.width,
            frame.height,
            frame.layers.len(),
            frame.pts
        );
        Ok(())
    }
}

/// Discards frames.
pub struct NullSink;

impl Terminal for NullSink {
    fn consume(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Writes one index line per frame.
///
/// The file starts with a header and ends with a trailer line holding the
/// frame count, written at end-of-stream.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: u64,
}

impl FileSink {
    /// Create the file and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "# tilecast frame index")?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            frames: 0,
        })
    }
}

impl Terminal for FileSink {
    fn consume(&mut self, frame: &Frame) -> Result<()> {
        let kind = match frame.payload {
            Payload::Raw(format) => format.as_str(),
            Payload::Encoded { keyframe: true } => "key",
            Payload::Encoded { keyframe: false } => "delta",
        };
        writeln!(
            self.writer,
            "{} {} {}x{} {} {}",
            frame.sequence,
            frame.pts.as_nanos(),
            frame.width,
            frame.height,
            kind,
            frame.layers.len()
        )?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        writeln!(self.writer, "# frames {}", self.frames)?;
        self.writer.flush()?;
        tracing::debug!("wrote {} frames to {}", self.frames, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileIndex;
    use crate::runtime::local::frame::pts_for;
    use std::time::Duration;

    fn frame(i: u64) -> Frame {
        Frame::raw(i, pts_for(i, 30), 1920, 1080, PixelFormat::Bgrx)
    }

    #[test]
    fn test_rate_convert_drops() {
        let mut stage = RateConvert::new(Some(10));
        let mut out = Emitted::new();
        for i in 0..30 {
            stage.process(frame(i), &mut out).unwrap();
        }
        assert_eq!(out.len(), 10);
        assert_eq!(out[1].sequence, 1);
        assert_eq!(out[1].pts, Duration::from_millis(100));
    }

    #[test]
    fn test_scale_and_convert() {
        let mut out = Emitted::new();
        Scale::new(Some((640, 480))).process(frame(0), &mut out).unwrap();
        let scaled = out.pop().unwrap();
        assert_eq!((scaled.width, scaled.height), (640, 480));

        Convert::new(Some(PixelFormat::I420)).process(scaled, &mut out).unwrap();
        assert_eq!(out[0].format(), Some(PixelFormat::I420));
    }

    #[test]
    fn test_mux_waits_for_keyframe() {
        let mut mux = Mux::default();
        let mut out = Emitted::new();
        let delta = Frame {
            payload: Payload::Encoded { keyframe: false },
            ..frame(0)
        };
        mux.process(delta.clone(), &mut out).unwrap();
        assert!(out.is_empty());

        let mut enc = Encode::new(30);
        enc.process(frame(1), &mut out).unwrap();
        let key = out.pop().unwrap();
        mux.process(key, &mut out).unwrap();
        mux.process(delta, &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_composite_layers() {
        let tiles = vec![
            Some(LayoutTile {
                profile_index: ProfileIndex(0),
                x: 0,
                y: 720,
                width: 640,
                height: 480,
            }),
            Some(LayoutTile {
                profile_index: ProfileIndex(1),
                x: 0,
                y: 0,
                width: 1280,
                height: 720,
            }),
        ];
        let mut comp = Composite::new(1280, 1200, 30, tiles);
        let mut out = Emitted::new();

        let mut small = frame(0);
        small.width = 640;
        small.height = 480;
        assert!(comp.push(0, small, &mut out).is_none());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].layers.len(), 1);

        let mut big = frame(1);
        big.width = 1280;
        big.height = 720;
        assert!(comp.push(1, big, &mut out).is_none());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].layers.len(), 2);
        assert_eq!((out[1].width, out[1].height), (1280, 1200));

        // wrong geometry is reported, not fatal
        assert!(comp.push(1, frame(2), &mut out).is_some());
    }

    #[test]
    fn test_file_sink_writes_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.idx");
        let mut sink = FileSink::create(&path).unwrap();
        sink.consume(&frame(0)).unwrap();
        sink.consume(&frame(1)).unwrap();
        sink.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "0 0 1920x1080 BGRx 0");
        assert_eq!(lines[3], "# frames 2");
    }
}
