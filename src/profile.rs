//! Stream profiles and capture targets.
//!
//! A [`StreamProfile`] describes one requested output variant of the shared
//! capture stream. Its identity is its position in the input list, carried as
//! a [`ProfileIndex`] through layout and graph construction so compositor
//! ports can be matched back to branches.

use crate::error::{Error, Result};
use std::fmt;

/// Maximum number of branches a single capture can be fanned out into.
pub const MAX_BRANCHES: usize = 10;

/// Largest accepted profile width or height, in pixels.
pub const MAX_DIMENSION: u32 = 32_768;

/// Position of a profile in the ordered input list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileIndex(pub usize);

impl ProfileIndex {
    /// Get the underlying index.
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ProfileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One requested output variant: geometry and frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamProfile {
    width: u32,
    height: u32,
    framerate: u32,
}

impl StreamProfile {
    /// Create a profile. Every field must be strictly positive and neither
    /// dimension may exceed [`MAX_DIMENSION`].
    pub fn new(width: u32, height: u32, framerate: u32) -> Result<Self> {
        if width == 0 || height == 0 || framerate == 0 {
            return Err(Error::Config(format!(
                "stream profile {width}x{height}@{framerate} must have positive dimensions and frame rate"
            )));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::Config(format!(
                "stream profile {width}x{height}@{framerate} exceeds {MAX_DIMENSION} pixels"
            )));
        }
        Ok(Self {
            width,
            height,
            framerate,
        })
    }

    /// Output width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Output height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Output frame rate in frames per second.
    pub fn framerate(&self) -> u32 {
        self.framerate
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.framerate)
    }
}

/// Which screen (and where on it) the shared capture source reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureTarget {
    /// Display number, or [`CaptureTarget::UNSET_DISPLAY`].
    pub display_id: i32,
    /// Left edge of the captured region.
    pub origin_x: i32,
    /// Top edge of the captured region.
    pub origin_y: i32,
}

impl CaptureTarget {
    /// Sentinel for "no display configured": the runtime picks its default.
    pub const UNSET_DISPLAY: i32 = -1;

    /// Capture the given display from its top-left corner.
    pub fn display(display_id: i32) -> Self {
        Self {
            display_id,
            origin_x: 0,
            origin_y: 0,
        }
    }

    /// Set the capture origin.
    pub fn with_origin(mut self, x: i32, y: i32) -> Self {
        self.origin_x = x;
        self.origin_y = y;
        self
    }

    /// Whether a display number was configured.
    pub fn has_display(&self) -> bool {
        self.display_id != Self::UNSET_DISPLAY
    }
}

impl Default for CaptureTarget {
    fn default() -> Self {
        Self::display(Self::UNSET_DISPLAY)
    }
}

/// Check the branch-count invariant `1 <= n <= MAX_BRANCHES`.
pub fn validate_profiles(profiles: &[StreamProfile]) -> Result<()> {
    if profiles.is_empty() {
        return Err(Error::Config("no stream profiles configured".into()));
    }
    if profiles.len() > MAX_BRANCHES {
        return Err(Error::Config(format!(
            "{} stream profiles configured, at most {MAX_BRANCHES} are supported",
            profiles.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_rejects_zero_fields() {
        assert!(StreamProfile::new(0, 480, 30).is_err());
        assert!(StreamProfile::new(640, 0, 30).is_err());
        assert!(StreamProfile::new(640, 480, 0).is_err());
        assert!(StreamProfile::new(640, 480, 30).is_ok());
    }

    #[test]
    fn test_profile_rejects_oversized_dimensions() {
        assert!(StreamProfile::new(MAX_DIMENSION, MAX_DIMENSION, 30).is_ok());
        assert!(StreamProfile::new(640, 3_000_000_000, 30).is_err());
        assert!(StreamProfile::new(MAX_DIMENSION + 1, 480, 30).is_err());
    }

    #[test]
    fn test_profile_display() {
        let p = StreamProfile::new(1280, 720, 30).unwrap();
        assert_eq!(p.to_string(), "1280x720@30fps");
    }

    #[test]
    fn test_capture_target_default_is_unset() {
        let target = CaptureTarget::default();
        assert!(!target.has_display());
        assert_eq!(target.origin_x, 0);

        let target = CaptureTarget::display(1).with_origin(100, 50);
        assert!(target.has_display());
        assert_eq!((target.origin_x, target.origin_y), (100, 50));
    }

    #[test]
    fn test_validate_branch_count() {
        let p = StreamProfile::new(640, 480, 30).unwrap();
        assert!(validate_profiles(&[]).is_err());
        assert!(validate_profiles(&[p]).is_ok());
        assert!(validate_profiles(&vec![p; MAX_BRANCHES]).is_ok());
        assert!(validate_profiles(&vec![p; MAX_BRANCHES + 1]).is_err());
    }
}
