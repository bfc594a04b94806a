//! Configuration management for FisheyeCast

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::FisheyeError;
use crate::pixel_map::OutputGeometry;
use crate::projection::ProjectionModel;

/// Output image and lens settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FisheyeConfig {
    /// Width and height of the square output, in pixels
    pub image_width: u32,
    /// Sub-samples per pixel axis
    pub sample_factor: u32,
    pub projection: ProjectionModel,
}

impl Default for FisheyeConfig {
    fn default() -> Self {
        Self {
            image_width: 1080,
            sample_factor: 2,
            projection: ProjectionModel::Perspective,
        }
    }
}

impl FisheyeConfig {
    /// Validated output geometry
    pub fn geometry(&self) -> Result<OutputGeometry, FisheyeError> {
        OutputGeometry::new(self.image_width, self.sample_factor)
    }
}

/// Where panel images come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Synthetic coloured checkerboard with a moving bar
    #[default]
    TestPattern,
    /// `front.png`, `left.png`, ... in `directory`
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub directory: PathBuf,
    pub fps: u32,
    /// Extra bytes per row in synthetic panels
    pub row_padding: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            directory: PathBuf::from("panels"),
            fps: 30,
            row_padding: 0,
        }
    }
}

/// TCP frame stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub bind: String,
    /// Frames buffered between the render loop and the streamer
    pub queue_depth: usize,
    /// Bytes reserved in front of each frame for the header
    pub header_offset: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:2000".to_string(),
            queue_depth: 4,
            header_offset: 32,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub directory: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("snapshots"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub fisheye: FisheyeConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.fisheye.image_width, 1080);
        assert_eq!(config.fisheye.sample_factor, 2);
        assert_eq!(config.fisheye.projection, ProjectionModel::Perspective);
        assert_eq!(config.server.port, 8092);
        assert!(config.fisheye.geometry().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [fisheye]
            projection = "equisolid_angle"
            sample_factor = 3

            [source]
            kind = "directory"
            "#,
        )
        .unwrap();
        assert_eq!(config.fisheye.projection, ProjectionModel::EquisolidAngle);
        assert_eq!(config.fisheye.sample_factor, 3);
        assert_eq!(config.fisheye.image_width, 1080);
        assert_eq!(config.source.kind, SourceKind::Directory);
        assert_eq!(config.source.fps, 30);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_invalid_geometry_reported() {
        let config: Config = toml::from_str("[fisheye]\nsample_factor = 0\n").unwrap();
        assert_eq!(
            config.fisheye.geometry(),
            Err(FisheyeError::InvalidSampleFactor(0))
        );
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, Config::default());

        let mut changed = created.clone();
        changed.fisheye.projection = ProjectionModel::Orthogonal;
        changed.fisheye.image_width = 720;
        changed.stream.enabled = false;
        changed.save(&path).unwrap();

        assert_eq!(Config::load_or_create(&path).unwrap(), changed);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[fisheye]\nprojection = \"fisheye\"\n").unwrap();
        let err = Config::load_or_create(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }
}
