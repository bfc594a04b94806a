//! Error types for map building and resampling
//!
//! Only structural problems are errors. Geometric degeneracies (parallel
//! planes, rays that miss every panel, out-of-range texels) are absorbed
//! where they occur and never show up here.

use thiserror::Error;

use crate::panel::Panel;

/// Largest supported output width. Panel texel coordinates are stored as `u16`.
pub const MAX_IMAGE_WIDTH: u32 = u16::MAX as u32;

/// Largest supported sample factor. `N² * 255` must fit the `u32` colour
/// accumulator, and a map holds `N²` descriptors per pixel.
pub const MAX_SAMPLE_FACTOR: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FisheyeError {
    #[error("image width must be between 1 and {MAX_IMAGE_WIDTH}, got {0}")]
    InvalidImageWidth(u32),

    #[error("sample factor must be between 1 and {MAX_SAMPLE_FACTOR}, got {0}")]
    InvalidSampleFactor(u32),

    #[error("no source buffer supplied for the {0} panel")]
    MissingPanel(Panel),

    #[error("{panel} panel: row stride {stride} is smaller than width x 4 = {min}")]
    StrideTooSmall {
        panel: Panel,
        stride: usize,
        min: usize,
    },

    #[error("{panel} panel: buffer holds {len} bytes but the declared layout needs {required}")]
    BufferTooSmall {
        panel: Panel,
        len: usize,
        required: usize,
    },

    #[error("{panel} panel is {width}x{height}, expected {required}x{required}")]
    PanelSizeMismatch {
        panel: Panel,
        width: u32,
        height: u32,
        required: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_panel() {
        let err = FisheyeError::StrideTooSmall {
            panel: Panel::Top,
            stride: 12,
            min: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("top"), "got {msg}");
        assert!(msg.contains("12"));

        assert_eq!(
            FisheyeError::MissingPanel(Panel::Left).to_string(),
            "no source buffer supplied for the left panel"
        );
    }
}
