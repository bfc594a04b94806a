//! Lens projection models
//!
//! A projection model turns the incidence angle `θd` of a point on the
//! virtual image plane (measured from the optical axis) into the angle `θ`
//! of the scene ray that should be shown at that point.

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_4;
use std::fmt;
use std::str::FromStr;

/// Lens projection model used to build the pixel map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", try_from = "ProjectionRepr")]
pub enum ProjectionModel {
    /// θ = θd (rectilinear, straight lines stay straight)
    #[default]
    Perspective,
    /// θ = 2·atan(tan(θd)/2)
    Stereographic,
    /// θ = tan(θd)
    Equidistant,
    /// θ = 2·asin(tan(θd)/2)
    EquisolidAngle,
    /// θ = asin(tan(θd))
    Orthogonal,
}

impl ProjectionModel {
    /// Map the incidence angle on the image plane to the scene ray angle.
    ///
    /// The result is NaN when the model is undefined for `theta_d`
    /// (Orthogonal past the rim); callers treat that as a ray that hits nothing.
    #[inline]
    pub fn apply(self, theta_d: f64) -> f64 {
        match self {
            ProjectionModel::Perspective => theta_d,
            ProjectionModel::Stereographic => 2.0 * (theta_d.tan() / 2.0).atan(),
            ProjectionModel::Equidistant => theta_d.tan(),
            ProjectionModel::EquisolidAngle => 2.0 * (theta_d.tan() / 2.0).asin(),
            ProjectionModel::Orthogonal => theta_d.tan().asin(),
        }
    }

    /// Model for a numeric index (0..=4). Unknown indices behave as Perspective.
    pub fn from_index(index: i64) -> Self {
        match index {
            1 => ProjectionModel::Stereographic,
            2 => ProjectionModel::Equidistant,
            3 => ProjectionModel::EquisolidAngle,
            4 => ProjectionModel::Orthogonal,
            _ => ProjectionModel::Perspective,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            ProjectionModel::Perspective => 0,
            ProjectionModel::Stereographic => 1,
            ProjectionModel::Equidistant => 2,
            ProjectionModel::EquisolidAngle => 3,
            ProjectionModel::Orthogonal => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionModel::Perspective => "perspective",
            ProjectionModel::Stereographic => "stereographic",
            ProjectionModel::Equidistant => "equidistant",
            ProjectionModel::EquisolidAngle => "equisolid_angle",
            ProjectionModel::Orthogonal => "orthogonal",
        }
    }

    pub fn all() -> &'static [ProjectionModel] {
        &[
            ProjectionModel::Perspective,
            ProjectionModel::Stereographic,
            ProjectionModel::Equidistant,
            ProjectionModel::EquisolidAngle,
            ProjectionModel::Orthogonal,
        ]
    }

    /// Full field of view of the output circle, in degrees.
    ///
    /// The rim of the circle sits at unit distance from the image centre on a
    /// plane one unit from the focal point, so `θd` there is 45°.
    pub fn field_of_view_degrees(self) -> f64 {
        2.0 * self.apply(FRAC_PI_4).to_degrees()
    }
}

/// Either a model name or a numeric index
#[derive(Deserialize)]
#[serde(untagged)]
enum ProjectionRepr {
    Index(i64),
    Name(String),
}

impl TryFrom<ProjectionRepr> for ProjectionModel {
    type Error = String;

    fn try_from(repr: ProjectionRepr) -> Result<Self, Self::Error> {
        match repr {
            ProjectionRepr::Index(index) => Ok(ProjectionModel::from_index(index)),
            ProjectionRepr::Name(name) => name.parse(),
        }
    }
}

impl fmt::Display for ProjectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionModel {
    type Err = String;

    /// Accepts model names (`"equisolid_angle"`, `"equisolid-angle"`) or
    /// numeric indices (`"3"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        if let Ok(index) = normalized.parse::<i64>() {
            return Ok(ProjectionModel::from_index(index));
        }
        ProjectionModel::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown projection model '{}', expected one of: perspective, stereographic, \
                     equidistant, equisolid_angle, orthogonal",
                    s
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn test_perspective_is_identity() {
        for &a in &[0.0, 0.1, 0.5, FRAC_PI_4] {
            assert_eq!(ProjectionModel::Perspective.apply(a), a);
        }
    }

    #[test]
    fn test_model_formulas() {
        let theta_d = 0.3f64;
        let t = theta_d.tan();
        assert!((ProjectionModel::Stereographic.apply(theta_d) - 2.0 * (t / 2.0).atan()).abs() < EPS);
        assert!((ProjectionModel::Equidistant.apply(theta_d) - t).abs() < EPS);
        assert!((ProjectionModel::EquisolidAngle.apply(theta_d) - 2.0 * (t / 2.0).asin()).abs() < EPS);
        assert!((ProjectionModel::Orthogonal.apply(theta_d) - t.asin()).abs() < EPS);
    }

    #[test]
    fn test_all_models_fix_the_optical_axis() {
        for model in ProjectionModel::all() {
            assert!(model.apply(0.0).abs() < EPS, "{model} moved the axis");
        }
    }

    #[test]
    fn test_orthogonal_undefined_past_rim() {
        assert!(ProjectionModel::Orthogonal.apply(1.0).is_nan());
    }

    #[test]
    fn test_index_round_trip_and_fallback() {
        for model in ProjectionModel::all() {
            assert_eq!(ProjectionModel::from_index(model.index() as i64), *model);
        }
        assert_eq!(ProjectionModel::from_index(17), ProjectionModel::Perspective);
        assert_eq!(ProjectionModel::from_index(-1), ProjectionModel::Perspective);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("orthogonal".parse(), Ok(ProjectionModel::Orthogonal));
        assert_eq!("Equisolid-Angle".parse(), Ok(ProjectionModel::EquisolidAngle));
        assert_eq!("2".parse(), Ok(ProjectionModel::Equidistant));
        assert!("fisheye".parse::<ProjectionModel>().is_err());
    }

    #[test]
    fn test_deserialize_name_or_index() {
        #[derive(Deserialize)]
        struct Wrapper {
            projection: ProjectionModel,
        }
        let parse = |s: &str| toml::from_str::<Wrapper>(s).map(|w| w.projection);
        assert_eq!(parse("projection = 'stereographic'").unwrap(), ProjectionModel::Stereographic);
        assert_eq!(parse("projection = 4").unwrap(), ProjectionModel::Orthogonal);
        assert_eq!(parse("projection = 9").unwrap(), ProjectionModel::Perspective);
        assert!(parse("projection = 'fisheye'").is_err());

        let json: ProjectionModel = serde_json::from_str("\"equisolid_angle\"").unwrap();
        assert_eq!(json, ProjectionModel::EquisolidAngle);
        assert_eq!(serde_json::to_string(&ProjectionModel::EquisolidAngle).unwrap(), "\"equisolid_angle\"");
    }

    #[test]
    fn test_field_of_view() {
        assert!((ProjectionModel::Perspective.field_of_view_degrees() - 90.0).abs() < 1e-9);
        assert!((ProjectionModel::Orthogonal.field_of_view_degrees() - 180.0).abs() < 1e-4);
        assert!((ProjectionModel::EquisolidAngle.field_of_view_degrees() - 120.0).abs() < 1e-9);
    }
}
