//! The five source panels of the cube rig
//!
//! Rig-local frame (left-handed): `x` points forward along the optical axis,
//! `y` to the right, `z` up. The panels are the faces of the cube
//! `[0,1] x [-1,1] x [-1,1]` that a forward-facing ray can reach; the back
//! face at `x = 0` has no camera.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One face of the cube-map rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Panel {
    Front = 0,
    Left = 1,
    Right = 2,
    Top = 3,
    Bottom = 4,
}

/// Number of source panels
pub const PANEL_COUNT: usize = 5;

/// Field of view of every panel camera, in degrees.
pub const PANEL_FOV_DEGREES: f32 = 90.0;

/// A plane `normal · p = offset`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vector3<f64>,
    pub offset: f64,
}

impl Panel {
    pub const ALL: [Panel; PANEL_COUNT] = [
        Panel::Front,
        Panel::Left,
        Panel::Right,
        Panel::Top,
        Panel::Bottom,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Panel::Front => "front",
            Panel::Left => "left",
            Panel::Right => "right",
            Panel::Top => "top",
            Panel::Bottom => "bottom",
        }
    }

    /// Boundary plane of this face of the unit cube.
    pub fn plane(self) -> Plane {
        let (normal, offset) = match self {
            Panel::Front => (Vector3::x(), 1.0),
            Panel::Left => (Vector3::y(), -1.0),
            Panel::Right => (Vector3::y(), 1.0),
            Panel::Top => (Vector3::z(), 1.0),
            Panel::Bottom => (Vector3::z(), -1.0),
        };
        Plane { normal, offset }
    }

    /// Camera orientation relative to the rig as (pitch, yaw) in degrees.
    pub fn orientation_degrees(self) -> (f32, f32) {
        match self {
            Panel::Front => (0.0, 0.0),
            Panel::Left => (0.0, -90.0),
            Panel::Right => (0.0, 90.0),
            Panel::Top => (90.0, 0.0),
            Panel::Bottom => (-90.0, 0.0),
        }
    }

    /// Map a point on this panel (rig-local, unit cube) to continuous texel
    /// coordinates `(row, col)` of a panel image of side `2 * radius`.
    ///
    /// Row grows downwards, column grows to the right, as seen by the panel camera.
    #[inline]
    pub fn local_to_texel(self, point: &Vector3<f64>, radius: f64) -> (f64, f64) {
        let p = point * radius;
        match self {
            Panel::Front => (radius - p.z, radius + p.y),
            Panel::Left => (radius - p.z, radius + p.x),
            Panel::Right => (radius - p.z, radius - p.x),
            Panel::Top => (radius + p.x, radius + p.y),
            Panel::Bottom => (radius - p.x, radius + p.y),
        }
    }
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intersect the line through the rig origin along `direction` with `plane`.
///
/// Returns `None` when the direction is parallel to the plane (or not a
/// number) and when the plane lies behind the origin along `direction`.
#[inline]
pub fn intersect_plane(direction: &Vector3<f64>, plane: &Plane) -> Option<Vector3<f64>> {
    let denom = direction.dot(&plane.normal);
    if denom == 0.0 || denom.is_nan() {
        return None;
    }
    let distance = plane.offset / denom;
    if !distance.is_finite() || distance < 0.0 {
        return None;
    }
    Some(direction * distance)
}

/// Slack on the cube bounds so that hits computed as `d * (1 / d)` still
/// count as lying on their own face, and seam hits land on both faces.
pub const CUBE_EPSILON: f64 = 1e-9;

/// Whether `point` lies on or inside the forward cube `[0,1] x [-1,1] x [-1,1]`.
///
/// The depth axis is bounded on both sides; hits behind the rig origin are rejected.
#[inline]
pub fn is_point_in_cube(point: &Vector3<f64>) -> bool {
    const LO: f64 = -1.0 - CUBE_EPSILON;
    const HI: f64 = 1.0 + CUBE_EPSILON;
    (-CUBE_EPSILON..=HI).contains(&point.x)
        && (LO..=HI).contains(&point.y)
        && (LO..=HI).contains(&point.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn test_forward_ray_hits_front() {
        let dir = Vector3::new(1.0, 0.0, 0.0);
        let hit = intersect_plane(&dir, &Panel::Front.plane()).unwrap();
        assert!((hit - Vector3::new(1.0, 0.0, 0.0)).norm() < EPS);
        assert!(is_point_in_cube(&hit));
    }

    #[test]
    fn test_parallel_ray_is_discarded() {
        let dir = Vector3::new(1.0, 0.0, 0.0);
        assert!(intersect_plane(&dir, &Panel::Left.plane()).is_none());
        assert!(intersect_plane(&dir, &Panel::Top.plane()).is_none());
    }

    #[test]
    fn test_plane_behind_origin_is_discarded() {
        // Heading right, the left plane (y = -1) is behind.
        let dir = Vector3::new(0.5, 0.5, 0.0);
        assert!(intersect_plane(&dir, &Panel::Left.plane()).is_none());
        let hit = intersect_plane(&dir, &Panel::Right.plane()).unwrap();
        assert!((hit.y - 1.0).abs() < EPS);
    }

    #[test]
    fn test_nan_direction_is_discarded() {
        let dir = Vector3::new(f64::NAN, 0.0, 0.0);
        for panel in Panel::ALL {
            assert!(intersect_plane(&dir, &panel.plane()).is_none());
        }
    }

    #[test]
    fn test_cube_bounds() {
        assert!(is_point_in_cube(&Vector3::new(0.0, -1.0, 1.0)));
        assert!(is_point_in_cube(&Vector3::new(1.0, 1.0, -1.0)));
        assert!(!is_point_in_cube(&Vector3::new(-0.01, 0.0, 0.0)));
        assert!(!is_point_in_cube(&Vector3::new(1.01, 0.0, 0.0)));
        assert!(!is_point_in_cube(&Vector3::new(0.5, 1.01, 0.0)));
        assert!(!is_point_in_cube(&Vector3::new(0.5, 0.0, -1.01)));
    }

    #[test]
    fn test_panel_centres_map_to_texel_centre() {
        let radius = 540.0;
        let (r, c) = Panel::Front.local_to_texel(&Vector3::new(1.0, 0.0, 0.0), radius);
        assert_eq!((r, c), (radius, radius));

        // Forward edge of the side panels lands in their middle column
        let (r, c) = Panel::Left.local_to_texel(&Vector3::new(0.0, -1.0, 0.0), radius);
        assert_eq!((r, c), (radius, radius));
        let (r, c) = Panel::Top.local_to_texel(&Vector3::new(0.0, 0.0, 1.0), radius);
        assert_eq!((r, c), (radius, radius));
    }

    #[test]
    fn test_front_panel_orientation() {
        let radius = 2.0;
        // Top-left corner of the front panel (up, left) is texel (0, 0)
        let (r, c) = Panel::Front.local_to_texel(&Vector3::new(1.0, -1.0, 1.0), radius);
        assert_eq!((r, c), (0.0, 0.0));
        // Bottom-right is (width, width)
        let (r, c) = Panel::Front.local_to_texel(&Vector3::new(1.0, 1.0, -1.0), radius);
        assert_eq!((r, c), (4.0, 4.0));
    }

    #[test]
    fn test_side_panels_share_the_front_seam() {
        let radius = 10.0;
        // Point on the front/right seam, halfway up
        let seam = Vector3::new(1.0, 1.0, 0.5);
        let (fr, fc) = Panel::Front.local_to_texel(&seam, radius);
        let (rr, rc) = Panel::Right.local_to_texel(&seam, radius);
        assert_eq!(fr, rr);
        assert_eq!(fc, 20.0);
        assert_eq!(rc, 0.0);
    }

    #[test]
    fn test_indices_match_all() {
        for (i, panel) in Panel::ALL.iter().enumerate() {
            assert_eq!(panel.index(), i);
        }
    }
}
