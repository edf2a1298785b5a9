//! Format constraints applied to links.

use crate::profile::StreamProfile;
use std::fmt;

/// Raw pixel layouts understood by the processing nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// Packed 32-bit BGR with padding byte, as delivered by X11 capture.
    #[default]
    Bgrx,
    /// Packed 32-bit BGRA.
    Bgra,
    /// Packed 32-bit RGBA.
    Rgba,
    /// Planar YUV 4:2:0.
    I420,
    /// Semi-planar YUV 4:2:0.
    Nv12,
}

impl PixelFormat {
    /// Canonical caps-style name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Bgrx => "BGRx",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::I420 => "I420",
            PixelFormat::Nv12 => "NV12",
        }
    }

    /// Bytes needed for one frame of the given size.
    pub fn frame_size(&self, width: u32, height: u32) -> u64 {
        let pixels = u64::from(width) * u64::from(height);
        match self {
            PixelFormat::Bgrx | PixelFormat::Bgra | PixelFormat::Rgba => pixels * 4,
            PixelFormat::I420 | PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restriction on the frames that may flow over a link.
///
/// Unset fields are unconstrained. A runtime fixates every set field on the
/// nearest upstream node able to produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatConstraint {
    /// Required frame size.
    pub size: Option<(u32, u32)>,
    /// Required frame rate.
    pub framerate: Option<u32>,
    /// Required pixel layout.
    pub format: Option<PixelFormat>,
}

impl FormatConstraint {
    /// Unconstrained.
    pub fn any() -> Self {
        Self::default()
    }

    /// Size and frame rate of a stream profile.
    pub fn from_profile(profile: &StreamProfile) -> Self {
        Self {
            size: Some((profile.width(), profile.height())),
            framerate: Some(profile.framerate()),
            format: None,
        }
    }

    /// Also require a pixel layout.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Whether no field is set.
    pub fn is_any(&self) -> bool {
        self.size.is_none() && self.framerate.is_none() && self.format.is_none()
    }
}

impl fmt::Display for FormatConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return f.write_str("ANY");
        }
        f.write_str("video/x-raw")?;
        if let Some(format) = self.format {
            write!(f, ", format={format}")?;
        }
        if let Some((w, h)) = self.size {
            write!(f, ", width={w}, height={h}")?;
        }
        if let Some(rate) = self.framerate {
            write!(f, ", framerate={rate}/1")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_from_profile() {
        let profile = StreamProfile::new(640, 480, 15).unwrap();
        let c = FormatConstraint::from_profile(&profile);
        assert_eq!(c.size, Some((640, 480)));
        assert_eq!(c.framerate, Some(15));
        assert_eq!(c.to_string(), "video/x-raw, width=640, height=480, framerate=15/1");
        assert_eq!(FormatConstraint::any().to_string(), "ANY");
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Bgrx.frame_size(2, 2), 16);
        assert_eq!(PixelFormat::I420.frame_size(4, 4), 24);
    }
}
