//! Still images of output frames and source panels

use anyhow::{anyhow, bail, Context, Result};
use image::{ImageBuffer, ImageOutputFormat, Rgb, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::resample::OutputFrame;
use crate::source::PanelSet;

/// Quality used for JPEG snapshots
const SNAPSHOT_JPEG_QUALITY: u8 = 100;

/// Encode packed RGBA pixels to JPEG, dropping alpha
pub fn encode_jpeg(rgba: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let rgb: Vec<u8> = rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    let img: ImageBuffer<Rgb<u8>, _> = ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("Failed to create image buffer"))?;

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    img.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

/// Write the pixel region of `frame` to `path`.
///
/// The format follows the extension: `.png` (alpha forced opaque) or
/// `.jpg`/`.jpeg`.
pub fn save_frame(path: &Path, frame: &OutputFrame) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    ensure_parent(path)?;

    match ext.as_str() {
        "png" => {
            let mut pixels = frame.pixels().to_vec();
            for px in pixels.chunks_exact_mut(4) {
                px[3] = 255;
            }
            let img = RgbaImage::from_raw(frame.width(), frame.height(), pixels)
                .ok_or_else(|| anyhow!("Failed to create image buffer"))?;
            img.save(path)
                .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        }
        "jpg" | "jpeg" => {
            let jpeg = encode_jpeg(
                frame.pixels(),
                frame.width(),
                frame.height(),
                SNAPSHOT_JPEG_QUALITY,
            )?;
            std::fs::write(path, jpeg)
                .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        }
        other => bail!("Unsupported snapshot format {:?} for {:?} (use .png or .jpg)", other, path),
    }

    info!("Saved {}x{} snapshot to {:?}", frame.width(), frame.height(), path);
    Ok(())
}

/// Dump the five source panels as `<dir>/<panel>.png`.
pub fn save_panels(dir: &Path, panels: &PanelSet) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;

    let mut written = Vec::new();
    for (panel, image) in panels.iter() {
        let path = dir.join(format!("{}.png", panel));
        let rgba = image
            .to_rgba()
            .ok_or_else(|| anyhow!("{} panel buffer does not match its size", panel))?;
        rgba.save(&path)
            .with_context(|| format!("Failed to write {} panel to {:?}", panel, path))?;
        written.push(path);
    }
    info!("Saved source panels to {:?}", dir);
    Ok(written)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create snapshot directory {:?}", parent))?;
    }
    Ok(())
}
