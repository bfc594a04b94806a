//! Per-frame fisheye resampling
//!
//! Walks a [`PixelMap`] and gathers panel texels into a packed RGBA output
//! frame. Each output row is filled by one rayon task from the entries of
//! that row only, so tasks never share a destination byte.

use rayon::prelude::*;

use crate::error::FisheyeError;
use crate::panel::{Panel, PANEL_COUNT};
use crate::pixel_map::{PixelMap, PixelMapEntry};
use crate::projection::ProjectionModel;

const BYTES_PER_PIXEL: usize = 4;

/// Borrowed 8-bit RGBA image of one panel
#[derive(Debug, Clone, Copy)]
pub struct SourceBuffer<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`
    pub stride: usize,
}

impl<'a> SourceBuffer<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, stride: usize) -> Self {
        Self {
            data,
            width,
            height,
            stride,
        }
    }

    /// Tightly packed rows
    pub fn packed(data: &'a [u8], width: u32, height: u32) -> Self {
        Self::new(data, width, height, width as usize * BYTES_PER_PIXEL)
    }

    /// Texel coordinates cover `[0, required)`, so the panel must be exactly
    /// `required` texels on each side.
    fn validate(&self, panel: Panel, required: u32) -> Result<(), FisheyeError> {
        if self.width != required || self.height != required {
            return Err(FisheyeError::PanelSizeMismatch {
                panel,
                width: self.width,
                height: self.height,
                required,
            });
        }
        let row_bytes = self.width as usize * BYTES_PER_PIXEL;
        if self.stride < row_bytes {
            return Err(FisheyeError::StrideTooSmall {
                panel,
                stride: self.stride,
                min: row_bytes,
            });
        }
        // The last row only needs its pixels, not its padding.
        let needed = self.stride * (self.height as usize - 1) + row_bytes;
        if self.data.len() < needed {
            return Err(FisheyeError::BufferTooSmall {
                panel,
                len: self.data.len(),
                required: needed,
            });
        }
        Ok(())
    }

    #[inline]
    fn texel(&self, row: u16, col: u16) -> &[u8] {
        let offset = row as usize * self.stride + col as usize * BYTES_PER_PIXEL;
        &self.data[offset..offset + BYTES_PER_PIXEL]
    }
}

/// The five panel images of one rendered frame
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceFrame<'a> {
    panels: [Option<SourceBuffer<'a>>; PANEL_COUNT],
}

impl<'a> SourceFrame<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame with every panel present, in `Panel::ALL` order
    #[cfg(test)]
    pub fn complete(panels: [SourceBuffer<'a>; PANEL_COUNT]) -> Self {
        Self {
            panels: panels.map(Some),
        }
    }

    #[cfg(test)]
    pub fn with_panel(mut self, panel: Panel, buffer: SourceBuffer<'a>) -> Self {
        self.panels[panel.index()] = Some(buffer);
        self
    }

    pub fn set(&mut self, panel: Panel, buffer: SourceBuffer<'a>) {
        self.panels[panel.index()] = Some(buffer);
    }

    #[cfg(test)]
    pub fn get(&self, panel: Panel) -> Option<&SourceBuffer<'a>> {
        self.panels[panel.index()].as_ref()
    }

    /// Check that all five panels are present and sized for `image_width`.
    fn validated(&self, image_width: u32) -> Result<[SourceBuffer<'a>; PANEL_COUNT], FisheyeError> {
        let mut out = [SourceBuffer::packed(&[], 0, 0); PANEL_COUNT];
        for panel in Panel::ALL {
            let buffer = self.panels[panel.index()].ok_or(FisheyeError::MissingPanel(panel))?;
            buffer.validate(panel, image_width)?;
            out[panel.index()] = buffer;
        }
        Ok(out)
    }
}

/// A finished fisheye frame: reserved header bytes followed by RGBA pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    data: Vec<u8>,
    header_offset: usize,
    width: u32,
    projection: ProjectionModel,
}

impl OutputFrame {
    /// A cleared frame; every pixel starts as (0, 0, 0, 0).
    pub fn blank(width: u32, header_offset: usize, projection: ProjectionModel) -> Self {
        let w = width as usize;
        Self {
            data: vec![0u8; header_offset + w * w * BYTES_PER_PIXEL],
            header_offset,
            width,
            projection,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.width
    }

    #[cfg(test)]
    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    pub fn projection(&self) -> ProjectionModel {
        self.projection
    }

    /// Bytes reserved for the transport header
    #[cfg(test)]
    pub fn header(&self) -> &[u8] {
        &self.data[..self.header_offset]
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.header_offset]
    }

    /// Packed RGBA pixels, row-major
    pub fn pixels(&self) -> &[u8] {
        &self.data[self.header_offset..]
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.header_offset..]
    }

    /// RGBA value of output pixel `(row, col)`
    #[cfg(test)]
    pub fn pixel(&self, row: u32, col: u32) -> [u8; 4] {
        let offset = (row as usize * self.width as usize + col as usize) * BYTES_PER_PIXEL;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels()[offset..offset + BYTES_PER_PIXEL]);
        px
    }

    /// Header and pixels as one buffer
    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Resample the five panels of one frame through `map`.
///
/// The first `header_offset` bytes of the returned frame are left zeroed
/// for the transport. Pixels without a map entry stay (0, 0, 0, 0).
pub fn resample(
    map: &PixelMap,
    sources: &SourceFrame<'_>,
    header_offset: usize,
) -> Result<OutputFrame, FisheyeError> {
    let geometry = map.geometry();
    let panels = sources.validated(geometry.image_width())?;

    let mut frame = OutputFrame::blank(geometry.image_width(), header_offset, map.model());
    let row_bytes = geometry.image_width() as usize * BYTES_PER_PIXEL;
    let samples_per_pixel = geometry.samples_per_pixel() as u32;

    frame
        .pixels_mut()
        .par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(i, row)| {
            for entry in map.row(i) {
                let color = gather_pixel(entry, &panels, samples_per_pixel);
                let offset = entry.col as usize * BYTES_PER_PIXEL;
                row[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&color);
            }
        });

    Ok(frame)
}

/// Average of the sub-sample colours of one pixel, truncating.
///
/// Out-of-circle sub-samples and samples with no texel count as black but
/// still take part in the `N²` divisor; seam texels are averaged first.
#[inline]
fn gather_pixel(
    entry: &PixelMapEntry,
    panels: &[SourceBuffer<'_>; PANEL_COUNT],
    samples_per_pixel: u32,
) -> [u8; 4] {
    let mut acc = [0u32; 4];

    for sample in entry.active_samples() {
        if sample.contributions.is_empty() {
            continue;
        }
        let hits = sample.contributions.len() as u32;
        let mut sum = [0u32; 4];
        for texel in sample.contributions.iter() {
            let px = panels[texel.panel.index()].texel(texel.row, texel.col);
            for c in 0..4 {
                sum[c] += px[c] as u32;
            }
        }
        for c in 0..4 {
            acc[c] += sum[c] / hits;
        }
    }

    acc.map(|v| (v / samples_per_pixel) as u8)
}
