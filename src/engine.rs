//! Shared fisheye engine
//!
//! Owns the published pixel map. Any number of threads may render through
//! it; a reconfiguration builds the replacement map off to the side and
//! swaps it in once no frame is being resampled.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::FisheyeError;
use crate::pixel_map::{OutputGeometry, PixelMap};
use crate::projection::ProjectionModel;
use crate::resample::{resample, OutputFrame, SourceFrame};

pub struct FisheyeEngine {
    /// Current map; geometry and model are read from it
    current: RwLock<Arc<PixelMap>>,
    /// Serialises rebuilds so two reconfigurations never race
    rebuild: Mutex<()>,
}

impl FisheyeEngine {
    /// Validate the configuration and build the initial map.
    pub fn new(
        image_width: u32,
        sample_factor: u32,
        model: ProjectionModel,
    ) -> Result<Self, FisheyeError> {
        let geometry = OutputGeometry::new(image_width, sample_factor)?;
        let map = PixelMap::build(geometry, model);
        Ok(Self {
            current: RwLock::new(Arc::new(map)),
            rebuild: Mutex::new(()),
        })
    }

    /// Geometry and model of the published map
    pub fn configuration(&self) -> (OutputGeometry, ProjectionModel) {
        let map = self.current.read();
        (map.geometry(), map.model())
    }

    /// Handle on the published map. It stays valid after a reconfiguration.
    pub fn map(&self) -> Arc<PixelMap> {
        self.current.read().clone()
    }

    /// Switch to a new configuration.
    ///
    /// Returns `Ok(false)` without rebuilding when the configuration is
    /// unchanged. On error the previous map stays published.
    pub fn reconfigure(
        &self,
        image_width: u32,
        sample_factor: u32,
        model: ProjectionModel,
    ) -> Result<bool, FisheyeError> {
        let geometry = OutputGeometry::new(image_width, sample_factor)?;

        let _rebuilding = self.rebuild.lock();
        if self.configuration() == (geometry, model) {
            debug!("Fisheye configuration unchanged, keeping current map");
            return Ok(false);
        }

        // Frames keep rendering with the old map while this runs
        let map = Arc::new(PixelMap::build(geometry, model));

        *self.current.write() = map;
        info!(
            "Published {} map {}x{} (N={})",
            model,
            geometry.image_width(),
            geometry.image_width(),
            geometry.sample_factor()
        );
        Ok(true)
    }

    /// Resample one frame with the current map.
    ///
    /// The read guard is held for the whole pass, so the map cannot be
    /// replaced half way through a frame.
    pub fn render(
        &self,
        sources: &SourceFrame<'_>,
        header_offset: usize,
    ) -> Result<OutputFrame, FisheyeError> {
        let map = self.current.read();
        resample(&map, sources, header_offset)
    }
}
