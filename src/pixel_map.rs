//! Output-pixel to panel-texel mapping
//!
//! The pixel map is the expensive half of fisheye synthesis. For every output
//! pixel it records, per sub-sample, which panel texels the reversed lens ray
//! lands on. It only depends on the output geometry and the projection model,
//! so it is built once and reused for every frame until either changes.
//!
//! Axis conventions: output pixel `(i, j)` is row `i` (downwards) and column
//! `j` (rightwards). The focal point `o` is at `(-1, 0, 0)`, one unit behind
//! the rig origin `O`, and a sample at row `sx`, column `sy` becomes the
//! image-plane point `p = (-1, (sy - R) / R, (R - sx) / R)`.

use nalgebra::Vector3;
use rayon::prelude::*;
use std::f64::consts::TAU;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{FisheyeError, MAX_IMAGE_WIDTH, MAX_SAMPLE_FACTOR};
use crate::panel::{intersect_plane, is_point_in_cube, Panel, Plane, PANEL_COUNT};
use crate::projection::ProjectionModel;

/// Output image size and supersampling factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputGeometry {
    image_width: u32,
    sample_factor: u32,
}

impl OutputGeometry {
    /// Validate and create a geometry. Both values must be at least 1.
    pub fn new(image_width: u32, sample_factor: u32) -> Result<Self, FisheyeError> {
        if image_width == 0 || image_width > MAX_IMAGE_WIDTH {
            return Err(FisheyeError::InvalidImageWidth(image_width));
        }
        if sample_factor == 0 || sample_factor > MAX_SAMPLE_FACTOR {
            return Err(FisheyeError::InvalidSampleFactor(sample_factor));
        }
        Ok(Self {
            image_width,
            sample_factor,
        })
    }

    /// Output width and height in pixels (the output is square)
    #[inline]
    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    /// Sub-samples per axis, `N`
    #[inline]
    pub fn sample_factor(&self) -> u32 {
        self.sample_factor
    }

    /// Sub-samples per pixel, `N²`
    #[inline]
    pub fn samples_per_pixel(&self) -> usize {
        let n = self.sample_factor as usize;
        n * n
    }

    /// Radius of the inscribed image circle, in pixels
    #[inline]
    pub fn radius(&self) -> f64 {
        self.image_width as f64 / 2.0
    }

    /// Continuous position of sub-sample `(k, l)` of pixel `(i, j)`.
    #[inline]
    pub fn sample_position(&self, i: u32, j: u32, k: u32, l: u32) -> (f64, f64) {
        let d = 1.0 / (2.0 * self.sample_factor as f64);
        (
            i as f64 + d * (2 * k + 1) as f64,
            j as f64 + d * (2 * l + 1) as f64,
        )
    }

    /// Whether a continuous position lies within the inscribed circle.
    #[inline]
    pub fn is_in_circle(&self, sx: f64, sy: f64) -> bool {
        let r = self.radius();
        let dx = sx - r;
        let dy = sy - r;
        dx * dx + dy * dy <= r * r
    }
}

/// One panel texel contributing to a sub-sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texel {
    pub panel: Panel,
    /// Panel image row
    pub row: u16,
    /// Panel image column
    pub col: u16,
}

/// Up to three texels: a ray meets at most one face per axis pair, so a
/// corner of the cube is the worst case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Contributions {
    len: u8,
    texels: [Option<Texel>; 3],
}

impl Contributions {
    pub const CAPACITY: usize = 3;

    pub fn push(&mut self, texel: Texel) {
        let len = self.len as usize;
        debug_assert!(len < Self::CAPACITY, "more than three panels hit by one ray");
        if len < Self::CAPACITY {
            self.texels[len] = Some(texel);
            self.len += 1;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Texel> + '_ {
        self.texels.iter().flatten()
    }
}

impl FromIterator<Texel> for Contributions {
    fn from_iter<I: IntoIterator<Item = Texel>>(iter: I) -> Self {
        let mut c = Contributions::default();
        for texel in iter {
            c.push(texel);
        }
        c
    }
}

/// Geometry of one sub-sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleDescriptor {
    /// Continuous (row, column) position in output pixel space
    pub position: [f32; 2],
    /// Unit scene ray in the rig frame; `None` outside the image circle
    pub direction: Option<[f32; 3]>,
    /// Panel texels the ray lands on (more than one on a seam)
    pub contributions: Contributions,
}

impl SampleDescriptor {
    fn at(sx: f64, sy: f64) -> Self {
        Self {
            position: [sx as f32, sy as f32],
            direction: None,
            contributions: Contributions::default(),
        }
    }
}

/// Sampling geometry of one output pixel with at least one in-circle sub-sample
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMapEntry {
    pub row: u32,
    pub col: u32,
    /// In-circle flag per sub-sample, indexed `k * N + l`
    pub in_circle: Vec<bool>,
    /// Descriptor per sub-sample, indexed `k * N + l`
    pub samples: Vec<SampleDescriptor>,
}

impl PixelMapEntry {
    fn new(geometry: &OutputGeometry, row: u32, col: u32) -> Self {
        let n = geometry.sample_factor();
        let mut samples = Vec::with_capacity(geometry.samples_per_pixel());
        for k in 0..n {
            for l in 0..n {
                let (sx, sy) = geometry.sample_position(row, col, k, l);
                samples.push(SampleDescriptor::at(sx, sy));
            }
        }
        Self {
            row,
            col,
            in_circle: vec![false; geometry.samples_per_pixel()],
            samples,
        }
    }

    /// In-circle sub-samples paired with their descriptors
    pub fn active_samples(&self) -> impl Iterator<Item = &SampleDescriptor> + '_ {
        self.samples
            .iter()
            .zip(&self.in_circle)
            .filter_map(|(s, &inside)| inside.then_some(s))
    }
}

/// Summary counts of a built map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MapStats {
    /// Output pixels with an entry
    pub entries: usize,
    /// In-circle sub-samples
    pub samples: usize,
    /// Recorded panel texels over all samples
    pub contributions: usize,
    /// Samples with more than one texel
    pub seam_samples: usize,
    /// In-circle samples whose ray hit no panel
    pub empty_samples: usize,
    /// Texels per panel, indexed by `Panel::index`
    pub per_panel: [usize; PANEL_COUNT],
}

/// Cached mapping from output pixels to panel texels
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMap {
    geometry: OutputGeometry,
    model: ProjectionModel,
    /// Entries in row-major order
    entries: Vec<PixelMapEntry>,
    /// `entries[row_starts[i]..row_starts[i + 1]]` are the entries of row `i`
    row_starts: Vec<usize>,
}

impl PixelMap {
    /// Compute the map for a geometry and projection model.
    ///
    /// Rows are built independently on the rayon pool and concatenated in
    /// order, so the result does not depend on scheduling.
    pub fn build(geometry: OutputGeometry, model: ProjectionModel) -> Self {
        let start = Instant::now();
        let planes: [Plane; PANEL_COUNT] = Panel::ALL.map(Panel::plane);

        let rows: Vec<Vec<PixelMapEntry>> = (0..geometry.image_width())
            .into_par_iter()
            .map(|i| build_row(&geometry, model, &planes, i))
            .collect();

        let map = Self::from_rows(geometry, model, rows);

        let stats = map.stats();
        info!(
            "Built {} pixel map {}x{} (N={}): {} pixels, {} samples, {} seam, {} empty in {:.1?}",
            model,
            geometry.image_width(),
            geometry.image_width(),
            geometry.sample_factor(),
            stats.entries,
            stats.samples,
            stats.seam_samples,
            stats.empty_samples,
            start.elapsed()
        );
        debug!("Texels per panel: {:?}", stats.per_panel);

        map
    }

    fn from_rows(
        geometry: OutputGeometry,
        model: ProjectionModel,
        rows: Vec<Vec<PixelMapEntry>>,
    ) -> Self {
        let mut row_starts = Vec::with_capacity(rows.len() + 1);
        let mut entries = Vec::with_capacity(rows.iter().map(Vec::len).sum());
        for row in rows {
            row_starts.push(entries.len());
            entries.extend(row);
        }
        row_starts.push(entries.len());
        Self {
            geometry,
            model,
            entries,
            row_starts,
        }
    }

    /// Assemble a map from hand-made entries (entries may be in any order).
    #[cfg(test)]
    pub(crate) fn from_entries(
        geometry: OutputGeometry,
        model: ProjectionModel,
        entries: Vec<PixelMapEntry>,
    ) -> Self {
        let mut rows = vec![Vec::new(); geometry.image_width() as usize];
        for entry in entries {
            rows[entry.row as usize].push(entry);
        }
        for row in &mut rows {
            row.sort_by_key(|e| e.col);
        }
        Self::from_rows(geometry, model, rows)
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.geometry
    }

    pub fn model(&self) -> ProjectionModel {
        self.model
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[PixelMapEntry] {
        &self.entries
    }

    /// Entries of output row `i`, ordered by column
    #[inline]
    pub fn row(&self, i: usize) -> &[PixelMapEntry] {
        match (self.row_starts.get(i), self.row_starts.get(i + 1)) {
            (Some(&start), Some(&end)) => &self.entries[start..end],
            _ => &[],
        }
    }

    /// Entry for output pixel `(i, j)`, if it is covered
    #[cfg(test)]
    pub fn get(&self, i: u32, j: u32) -> Option<&PixelMapEntry> {
        let row = self.row(i as usize);
        row.binary_search_by_key(&j, |e| e.col)
            .ok()
            .map(|idx| &row[idx])
    }

    #[cfg(test)]
    pub fn contains(&self, i: u32, j: u32) -> bool {
        self.get(i, j).is_some()
    }

    /// Linear indices `i * width + j` of all covered output pixels
    #[cfg(test)]
    pub fn covered_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let w = self.geometry.image_width() as usize;
        self.entries
            .iter()
            .map(move |e| e.row as usize * w + e.col as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats {
            entries: self.entries.len(),
            ..MapStats::default()
        };
        for sample in self.entries.iter().flat_map(PixelMapEntry::active_samples) {
            let hits = sample.contributions.len();
            stats.samples += 1;
            stats.contributions += hits;
            match hits {
                0 => stats.empty_samples += 1,
                1 => {}
                _ => stats.seam_samples += 1,
            }
            for texel in sample.contributions.iter() {
                stats.per_panel[texel.panel.index()] += 1;
            }
        }
        stats
    }
}

fn build_row(
    geometry: &OutputGeometry,
    model: ProjectionModel,
    planes: &[Plane; PANEL_COUNT],
    i: u32,
) -> Vec<PixelMapEntry> {
    let n = geometry.sample_factor();
    let mut row = Vec::new();

    for j in 0..geometry.image_width() {
        let mut entry: Option<PixelMapEntry> = None;

        for k in 0..n {
            for l in 0..n {
                let (sx, sy) = geometry.sample_position(i, j, k, l);
                if !geometry.is_in_circle(sx, sy) {
                    continue;
                }

                let pixel = entry.get_or_insert_with(|| PixelMapEntry::new(geometry, i, j));
                let id = (k * n + l) as usize;
                pixel.in_circle[id] = true;

                let direction = sample_direction(geometry, model, sx, sy);
                let sample = &mut pixel.samples[id];
                sample.direction = Some([direction.x as f32, direction.y as f32, direction.z as f32]);
                sample.contributions = trace_panels(geometry, planes, &direction);
            }
        }

        if let Some(entry) = entry {
            row.push(entry);
        }
    }

    row
}

/// Scene ray for a continuous output position under `model`.
pub fn sample_direction(
    geometry: &OutputGeometry,
    model: ProjectionModel,
    sx: f64,
    sy: f64,
) -> Vector3<f64> {
    let r = geometry.radius();
    let p = Vector3::new(-1.0, (sy - r) / r, (r - sx) / r);

    // Focal point o = (-1, 0, 0), origin O = 0; oO is the optical axis.
    let optical_axis = Vector3::x();
    let p_to_origin = -p;
    let theta_d = (optical_axis.dot(&p_to_origin) / p_to_origin.norm())
        .clamp(-1.0, 1.0)
        .acos();
    let theta = model.apply(theta_d);

    // Azimuth of p in the image plane, measured from +y, in [0, 2π)
    let in_plane = Vector3::new(0.0, p.y, p.z);
    let in_plane_norm = in_plane.norm();
    let mut alpha = if in_plane_norm > 0.0 {
        (in_plane.y / in_plane_norm).clamp(-1.0, 1.0).acos()
    } else {
        0.0
    };
    if in_plane.z < 0.0 {
        alpha = TAU - alpha;
    }

    Vector3::new(
        theta.cos(),
        theta.sin() * alpha.cos(),
        theta.sin() * alpha.sin(),
    )
}

/// Panel texels hit by `direction`, clamped to the panel image.
fn trace_panels(
    geometry: &OutputGeometry,
    planes: &[Plane; PANEL_COUNT],
    direction: &Vector3<f64>,
) -> Contributions {
    let radius = geometry.radius();
    let last = (geometry.image_width() - 1) as u16;

    Panel::ALL
        .iter()
        .zip(planes)
        .filter_map(|(&panel, plane)| {
            let hit = intersect_plane(direction, plane)?;
            if !is_point_in_cube(&hit) {
                return None;
            }
            let (row, col) = panel.local_to_texel(&hit, radius);
            Some(Texel {
                panel,
                row: clamp_texel(row, last),
                col: clamp_texel(col, last),
            })
        })
        .collect()
}

/// Truncate a continuous texel coordinate, snapping anything past the edge
/// to the last row/column.
#[inline]
fn clamp_texel(value: f64, last: u16) -> u16 {
    // `as` saturates: tiny negative rounding errors become 0.
    let t = value as u32;
    t.min(last as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(width: u32, n: u32) -> OutputGeometry {
        OutputGeometry::new(width, n).unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        assert_eq!(
            OutputGeometry::new(0, 2),
            Err(FisheyeError::InvalidImageWidth(0))
        );
        assert_eq!(
            OutputGeometry::new(64, 0),
            Err(FisheyeError::InvalidSampleFactor(0))
        );
        assert!(OutputGeometry::new(MAX_IMAGE_WIDTH + 1, 1).is_err());
        assert_eq!(
            OutputGeometry::new(1, 65536),
            Err(FisheyeError::InvalidSampleFactor(65536))
        );
        assert_eq!(
            OutputGeometry::new(64, MAX_SAMPLE_FACTOR + 1),
            Err(FisheyeError::InvalidSampleFactor(MAX_SAMPLE_FACTOR + 1))
        );
        let finest = geometry(1, MAX_SAMPLE_FACTOR);
        assert_eq!(finest.samples_per_pixel(), (MAX_SAMPLE_FACTOR * MAX_SAMPLE_FACTOR) as usize);
        // A fully saturated pixel still fits the colour accumulator
        assert!((finest.samples_per_pixel() as u64) * 255 <= u32::MAX as u64);
        let g = geometry(1080, 2);
        assert_eq!(g.radius(), 540.0);
        assert_eq!(g.samples_per_pixel(), 4);
    }

    #[test]
    fn test_sample_positions() {
        let g = geometry(8, 2);
        assert_eq!(g.sample_position(3, 5, 0, 0), (3.25, 5.25));
        assert_eq!(g.sample_position(3, 5, 1, 0), (3.75, 5.25));
        assert_eq!(g.sample_position(3, 5, 0, 1), (3.25, 5.75));
        let g = geometry(8, 1);
        assert_eq!(g.sample_position(0, 0, 0, 0), (0.5, 0.5));
    }

    #[test]
    fn test_four_pixel_scenario() {
        let map = PixelMap::build(geometry(4, 1), ProjectionModel::Perspective);

        // Pixel centres at distance sqrt(4.5) > 2 (the four corners) are excluded
        assert_eq!(map.len(), 12);
        assert!(!map.contains(0, 0));
        assert!(!map.contains(0, 3));
        assert!(!map.contains(3, 0));
        assert!(!map.contains(3, 3));
        assert!(map.contains(1, 1));
        assert!(map.contains(0, 1));

        let entry = map.get(1, 1).unwrap();
        assert_eq!(entry.in_circle, vec![true]);
        assert_eq!(entry.samples[0].position, [1.5, 1.5]);
    }

    #[test]
    fn test_corner_pixel_never_mapped() {
        let map = PixelMap::build(geometry(100, 1), ProjectionModel::Perspective);
        assert!(!map.contains(0, 0));
        assert!(!map.contains(99, 99));
        assert!(map.contains(50, 50));
    }

    #[test]
    fn test_recorded_samples_satisfy_circle() {
        let g = geometry(24, 3);
        let map = PixelMap::build(g, ProjectionModel::Stereographic);
        for entry in map.entries() {
            assert!(entry.in_circle.iter().any(|&b| b));
            for (id, (sample, &inside)) in entry.samples.iter().zip(&entry.in_circle).enumerate() {
                let k = id as u32 / 3;
                let l = id as u32 % 3;
                let (sx, sy) = g.sample_position(entry.row, entry.col, k, l);
                assert_eq!(inside, g.is_in_circle(sx, sy));
                assert_eq!(inside, sample.direction.is_some());
                if !inside {
                    assert!(sample.contributions.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_texels_within_bounds_for_every_model() {
        for &model in ProjectionModel::all() {
            let g = geometry(32, 2);
            let map = PixelMap::build(g, model);
            let stats = map.stats();
            for sample in map.entries().iter().flat_map(PixelMapEntry::active_samples) {
                assert!(sample.contributions.len() <= Contributions::CAPACITY);
                for texel in sample.contributions.iter() {
                    assert!((texel.row as u32) < g.image_width(), "{model}: {texel:?}");
                    assert!((texel.col as u32) < g.image_width(), "{model}: {texel:?}");
                }
            }
            // Degenerate samples are rare edge cases, not the norm
            assert!(
                stats.empty_samples * 100 <= stats.samples,
                "{model}: {} of {} samples hit nothing",
                stats.empty_samples,
                stats.samples
            );
        }
    }

    #[test]
    fn test_perspective_reads_front_panel_in_place() {
        let g = geometry(16, 2);
        let map = PixelMap::build(g, ProjectionModel::Perspective);
        for entry in map.entries() {
            for sample in entry.active_samples() {
                let texels: Vec<_> = sample.contributions.iter().copied().collect();
                assert_eq!(
                    texels,
                    vec![Texel {
                        panel: Panel::Front,
                        row: entry.row as u16,
                        col: entry.col as u16,
                    }]
                );
            }
        }
    }

    #[test]
    fn test_wide_models_use_side_panels() {
        let map = PixelMap::build(geometry(64, 1), ProjectionModel::Orthogonal);
        let stats = map.stats();
        for panel in Panel::ALL {
            assert!(stats.per_panel[panel.index()] > 0, "{panel} never sampled");
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let g = geometry(40, 2);
        let a = PixelMap::build(g, ProjectionModel::EquisolidAngle);
        let b = PixelMap::build(g, ProjectionModel::EquisolidAngle);
        assert_eq!(a, b);
    }

    #[test]
    fn test_coverage_grows_with_nested_sample_factors() {
        // N = 1, 3, 9 place every coarser sample on a finer one
        let coverage: Vec<usize> = [1, 3, 9]
            .iter()
            .map(|&n| PixelMap::build(geometry(30, n), ProjectionModel::Perspective).len())
            .collect();
        assert!(coverage[0] <= coverage[1]);
        assert!(coverage[1] <= coverage[2]);

        // Every pixel touching the circle is covered at most once; never more than the square
        assert!(coverage[2] <= 30 * 30);
    }

    #[test]
    fn test_centre_sample_is_not_degenerate() {
        // Odd width and odd N put a sample exactly on the optical axis
        let g = geometry(5, 1);
        let dir = sample_direction(&g, ProjectionModel::Perspective, 2.5, 2.5);
        assert!((dir - Vector3::x()).norm() < 1e-12);
        let map = PixelMap::build(g, ProjectionModel::Perspective);
        let centre = map.get(2, 2).unwrap();
        assert_eq!(centre.samples[0].contributions.len(), 1);
    }

    #[test]
    fn test_row_index_matches_entries() {
        let map = PixelMap::build(geometry(20, 2), ProjectionModel::Equidistant);
        let mut total = 0;
        for i in 0..20 {
            let row = map.row(i);
            assert!(row.iter().all(|e| e.row as usize == i));
            assert!(row.windows(2).all(|w| w[0].col < w[1].col));
            total += row.len();
        }
        assert_eq!(total, map.len());
        assert!(map.row(20).is_empty());
        assert_eq!(map.covered_indices().count(), map.len());
    }

    #[test]
    fn test_clamp_texel() {
        assert_eq!(clamp_texel(3.9, 7), 3);
        assert_eq!(clamp_texel(8.0, 7), 7);
        assert_eq!(clamp_texel(-1e-15, 7), 0);
    }
}
