//! Panel image sources
//!
//! A source owns the five panel images and refreshes them in place for
//! every frame, so the render loop does not allocate per frame.

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{SourceConfig, SourceKind};
use crate::panel::{Panel, PANEL_COUNT};
use crate::resample::{SourceBuffer, SourceFrame};

/// One owned RGBA panel image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: usize,
}

impl PanelImage {
    /// Cleared square image of side `side` with `row_padding` spare bytes per row
    pub fn blank(side: u32, row_padding: usize) -> Self {
        let stride = side as usize * 4 + row_padding;
        Self {
            data: vec![0u8; stride * side as usize],
            width: side,
            height: side,
            stride,
        }
    }

    /// Tightly packed image from an RGBA buffer
    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            stride: width as usize * 4,
        }
    }

    #[cfg(test)]
    pub fn pixel(&self, row: u32, col: u32) -> [u8; 4] {
        let o = row as usize * self.stride + col as usize * 4;
        [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]]
    }

    /// Copy of the image without row padding
    pub fn to_rgba(&self) -> Option<RgbaImage> {
        let row_bytes = self.width as usize * 4;
        let mut packed = Vec::with_capacity(row_bytes * self.height as usize);
        for row in self.data.chunks(self.stride).take(self.height as usize) {
            packed.extend_from_slice(row.get(..row_bytes)?);
        }
        RgbaImage::from_raw(self.width, self.height, packed)
    }

    pub fn as_buffer(&self) -> SourceBuffer<'_> {
        SourceBuffer::new(&self.data, self.width, self.height, self.stride)
    }
}

/// The five panels of one frame, in `Panel::ALL` order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelSet {
    panels: [PanelImage; PANEL_COUNT],
}

impl PanelSet {
    pub fn new(panels: [PanelImage; PANEL_COUNT]) -> Self {
        Self { panels }
    }

    pub fn get(&self, panel: Panel) -> &PanelImage {
        &self.panels[panel.index()]
    }

    pub fn get_mut(&mut self, panel: Panel) -> &mut PanelImage {
        &mut self.panels[panel.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Panel, &PanelImage)> + '_ {
        Panel::ALL.into_iter().zip(self.panels.iter())
    }

    /// Borrowed view for one resample pass
    pub fn as_frame(&self) -> SourceFrame<'_> {
        let mut frame = SourceFrame::new();
        for (panel, image) in self.iter() {
            frame.set(panel, image.as_buffer());
        }
        frame
    }
}

/// Something that produces the five panel images frame after frame
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Current panel side length
    fn panel_size(&self) -> u32;

    /// Re-target the panels to `side x side` texels.
    fn resize(&mut self, side: u32) -> Result<()>;

    /// Produce the next frame's panels.
    fn next_frame(&mut self) -> Result<&PanelSet>;
}

/// Build the source selected in the configuration, with panels of side `side`.
pub fn open(config: &SourceConfig, side: u32) -> Result<Box<dyn FrameSource>> {
    match config.kind {
        SourceKind::TestPattern => {
            info!("Using synthetic test pattern source ({}x{} panels)", side, side);
            Ok(Box::new(TestPatternSource::new(side, config.row_padding)))
        }
        SourceKind::Directory => {
            let source = DirectorySource::load(&config.directory, side)?;
            Ok(Box::new(source))
        }
    }
}

/// Base colour of each panel in the test pattern
fn panel_color(panel: Panel) -> [u8; 3] {
    match panel {
        Panel::Front => [220, 60, 60],
        Panel::Left => [60, 200, 80],
        Panel::Right => [70, 90, 230],
        Panel::Top => [230, 210, 60],
        Panel::Bottom => [200, 80, 210],
    }
}

/// Coloured checkerboard per panel with a bar sweeping across every panel
pub struct TestPatternSource {
    panels: PanelSet,
    row_padding: usize,
    frame: u64,
}

impl TestPatternSource {
    /// Checker cell size in texels
    const CELL: u32 = 32;
    /// Bar advance per frame, in texels
    const BAR_SPEED: u64 = 4;

    pub fn new(side: u32, row_padding: usize) -> Self {
        Self {
            panels: PanelSet::new(Panel::ALL.map(|_| PanelImage::blank(side, row_padding))),
            row_padding,
            frame: 0,
        }
    }

    /// Column of the moving bar for a frame
    fn bar_column(&self) -> u32 {
        let side = self.panel_size().max(1) as u64;
        ((self.frame * Self::BAR_SPEED) % side) as u32
    }

    fn draw(&mut self) {
        let bar = self.bar_column();
        let bar_width = (self.panel_size() / 32).max(1);

        for panel in Panel::ALL {
            let [r, g, b] = panel_color(panel);
            let image = self.panels.get_mut(panel);
            let width = image.width;
            let stride = image.stride;

            for (row, line) in image.data.chunks_mut(stride).enumerate() {
                let row = row as u32;
                for (col, px) in line.chunks_exact_mut(4).take(width as usize).enumerate() {
                    let col = col as u32;
                    let color = if col >= bar && col < bar + bar_width {
                        [255, 255, 255]
                    } else if (row / Self::CELL + col / Self::CELL) % 2 == 0 {
                        [r, g, b]
                    } else {
                        [r / 2, g / 2, b / 2]
                    };
                    px[..3].copy_from_slice(&color);
                    px[3] = 255;
                }
            }
        }
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        "test pattern"
    }

    fn panel_size(&self) -> u32 {
        self.panels.get(Panel::Front).width
    }

    fn resize(&mut self, side: u32) -> Result<()> {
        debug!("Resizing test pattern panels to {}x{}", side, side);
        self.panels = PanelSet::new(Panel::ALL.map(|_| PanelImage::blank(side, self.row_padding)));
        Ok(())
    }

    fn next_frame(&mut self) -> Result<&PanelSet> {
        self.draw();
        self.frame += 1;
        Ok(&self.panels)
    }
}

/// Still panels loaded from `<dir>/<panel>.png`
pub struct DirectorySource {
    directory: PathBuf,
    originals: Vec<RgbaImage>,
    panels: PanelSet,
}

impl DirectorySource {
    /// Load all five panel images and scale them to `side x side`.
    pub fn load(directory: &Path, side: u32) -> Result<Self> {
        let mut originals = Vec::with_capacity(PANEL_COUNT);
        for panel in Panel::ALL {
            let path = directory.join(format!("{}.png", panel));
            let image = image::open(&path)
                .with_context(|| format!("Failed to load {} panel from {:?}", panel, path))?
                .to_rgba8();
            info!(
                "Loaded {} panel {}x{} from {:?}",
                panel,
                image.width(),
                image.height(),
                path
            );
            originals.push(image);
        }

        let panels = scale_panels(&originals, side)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            originals,
            panels,
        })
    }
}

fn scale_panels(originals: &[RgbaImage], side: u32) -> Result<PanelSet> {
    if side == 0 {
        bail!("Panel size must be at least 1");
    }
    let mut scaled = Vec::with_capacity(PANEL_COUNT);
    for image in originals {
        let image = if image.dimensions() == (side, side) {
            image.clone()
        } else {
            imageops::resize(image, side, side, FilterType::Triangle)
        };
        scaled.push(PanelImage::from_rgba(image));
    }
    let panels: [PanelImage; PANEL_COUNT] = scaled
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected {} panel images", PANEL_COUNT))?;
    Ok(PanelSet::new(panels))
}

impl FrameSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    fn panel_size(&self) -> u32 {
        self.panels.get(Panel::Front).width
    }

    fn resize(&mut self, side: u32) -> Result<()> {
        debug!("Rescaling panels from {:?} to {}x{}", self.directory, side, side);
        self.panels = scale_panels(&self.originals, side)?;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<&PanelSet> {
        Ok(&self.panels)
    }
}
