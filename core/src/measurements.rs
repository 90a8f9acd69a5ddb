//! Landmark measurement model used by the weighting stage.
//!
//! Weighting a particle happens in three steps:
//! 1. Every ego-frame [`Observation`] is transformed into the map frame using the particle's own
//!    pose hypothesis ([`to_map_frame`]).
//! 2. The transformed observation is associated with its nearest landmark
//!    ([`nearest_landmark`], the only data-association routine in the crate).
//! 3. The residual between the two is scored with an axis-aligned bivariate Gaussian
//!    ([`bivariate_gaussian`]).
//!
//! The particle weight is the product of the per-observation densities. An empty observation
//! set therefore gives a weight of exactly one.

use log::trace;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::map::{Landmark, Map, Observation, Pose};
use crate::particle::Associations;

/// Candidate selection policy for data association.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AssociationGating {
    /// Every landmark in the map is a candidate; `sensor_range` is accepted but ignored.
    #[default]
    Disabled,
    /// Only landmarks within `sensor_range` of the particle are candidates. Observations with
    /// no candidate are left unassociated and do not contribute to the weight.
    SensorRange,
}

/// Standard deviations of the landmark measurement noise along the map x and y axes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkNoise {
    pub std_x: f64,
    pub std_y: f64,
}
impl LandmarkNoise {
    pub fn new(std_x: f64, std_y: f64) -> Self {
        LandmarkNoise { std_x, std_y }
    }
    pub fn validate(&self) -> Result<()> {
        for (axis, std) in [("x", self.std_x), ("y", self.std_y)] {
            if !(std.is_finite() && std > 0.0) {
                return Err(FilterError::InvalidInput(format!(
                    "landmark std dev along {axis} must be positive and finite, got {std}"
                )));
            }
        }
        Ok(())
    }
}
impl From<[f64; 2]> for LandmarkNoise {
    fn from(std: [f64; 2]) -> Self {
        LandmarkNoise::new(std[0], std[1])
    }
}

/// Transform an ego-frame observation into the map frame as seen from `pose`.
///
/// `map_x = obs_x cos(theta) - obs_y sin(theta) + x` and
/// `map_y = obs_x sin(theta) + obs_y cos(theta) + y`.
pub fn to_map_frame(pose: &Pose, observation: &Observation) -> Point2<f64> {
    pose.transform_point(&observation.local())
}

/// Nearest-neighbour association over `candidates`.
///
/// Distances are compared with a strict less-than against the running minimum, so the first
/// candidate wins ties. Candidates at a NaN distance are never selected. Returns `None` when
/// there are no candidates.
pub fn nearest_landmark<'a, I>(point: &Point2<f64>, candidates: I) -> Option<&'a Landmark>
where
    I: IntoIterator<Item = &'a Landmark>,
{
    let mut best: Option<(&Landmark, f64)> = None;
    for landmark in candidates {
        let distance = nalgebra::distance(point, &landmark.position());
        if distance.is_nan() {
            continue;
        }
        match best {
            Some((_, min_distance)) if distance >= min_distance => {}
            _ => best = Some((landmark, distance)),
        }
    }
    best.map(|(landmark, _)| landmark)
}

/// Associate a map-frame point with the nearest landmark of the whole map.
pub fn associate<'a>(map: &'a Map, point: &Point2<f64>) -> Result<&'a Landmark> {
    nearest_landmark(point, map.iter()).ok_or(FilterError::EmptyMap)
}

/// Associate a map-frame point with the nearest landmark that lies within `sensor_range` of
/// `origin`.
pub fn associate_in_range<'a>(
    map: &'a Map,
    point: &Point2<f64>,
    origin: &Point2<f64>,
    sensor_range: f64,
) -> Option<&'a Landmark> {
    nearest_landmark(
        point,
        map.iter()
            .filter(|l| nalgebra::distance(origin, &l.position()) <= sensor_range),
    )
}

/// Bivariate Gaussian density with independent axes evaluated at the residual `(dx, dy)`.
pub fn bivariate_gaussian(dx: f64, dy: f64, noise: &LandmarkNoise) -> f64 {
    let (sigma_x, sigma_y) = (noise.std_x, noise.std_y);
    let normalizer = 1.0 / (2.0 * std::f64::consts::PI * sigma_x * sigma_y);
    let exponent =
        -((dx * dx) / (2.0 * sigma_x * sigma_x) + (dy * dy) / (2.0 * sigma_y * sigma_y));
    normalizer * exponent.exp()
}

/// Likelihood of an observation set given a single pose hypothesis.
///
/// Returns the product of the per-observation densities together with the association
/// bookkeeping (matched landmark ids and the map-frame observation coordinates).
pub fn observation_likelihood(
    pose: &Pose,
    observations: &[Observation],
    map: &Map,
    noise: &LandmarkNoise,
    sensor_range: f64,
    gating: AssociationGating,
) -> Result<(f64, Associations)> {
    let mut likelihood = 1.0;
    let mut associations = Associations::with_capacity(observations.len());
    let origin = pose.position();
    for observation in observations {
        let point = to_map_frame(pose, observation);
        let landmark = match gating {
            AssociationGating::Disabled => associate(map, &point)?,
            AssociationGating::SensorRange => {
                if map.is_empty() {
                    return Err(FilterError::EmptyMap);
                }
                match associate_in_range(map, &point, &origin, sensor_range) {
                    Some(landmark) => landmark,
                    None => {
                        trace!(
                            "Observation {} at ({:.3}, {:.3}) has no landmark in range",
                            observation.id, point.x, point.y
                        );
                        continue;
                    }
                }
            }
        };
        likelihood *= bivariate_gaussian(point.x - landmark.x, point.y - landmark.y, noise);
        associations.push(landmark.id, point.x, point.y);
    }
    Ok((likelihood, associations))
}
