//! Value types shared by every stage of the filter: poses, landmarks, the landmark map, and
//! ego-frame observations.
//!
//! The [`Map`] is supplied by the caller, is never mutated by the filter, and is expected to be
//! loaded before the first weighting pass (see [`crate::sim::Scenario`] for CSV loading).

use nalgebra::{Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A 2-D pose hypothesis in the map frame.
///
/// `theta` is the heading in radians measured counter-clockwise from the map x-axis. It is
/// not wrapped by the motion model; use [`crate::wrap_to_pi`] when comparing headings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose {{ x: {:.4} m, y: {:.4} m, theta: {:.4} rad }}",
            self.x, self.y, self.theta
        )
    }
}
impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose { x, y, theta }
    }
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Rigid transform taking ego-frame coordinates into the map frame.
    pub fn transform_point(&self, local: &Point2<f64>) -> Point2<f64> {
        let rotation = Rotation2::new(self.theta);
        rotation * local + Vector2::new(self.x, self.y)
    }
}

/// A single landmark with a fixed position in the map frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: i32,
    pub x: f64,
    pub y: f64,
}
impl Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Landmark {} @ ({:.3}, {:.3})", self.id, self.x, self.y)
    }
}
impl Landmark {
    pub fn new(id: i32, x: f64, y: f64) -> Self {
        Landmark { id, x, y }
    }
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// An immutable, ordered set of landmarks.
///
/// Order matters: nearest-neighbour association breaks distance ties in favour of the landmark
/// that appears first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Map {
    landmarks: Vec<Landmark>,
}
impl Map {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Map { landmarks }
    }
    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }
    pub fn iter(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.iter()
    }
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
    /// Look up a landmark by identifier (linear scan).
    pub fn get(&self, id: i32) -> Option<&Landmark> {
        self.landmarks.iter().find(|l| l.id == id)
    }
}
impl From<Vec<Landmark>> for Map {
    fn from(landmarks: Vec<Landmark>) -> Self {
        Map::new(landmarks)
    }
}
impl FromIterator<Landmark> for Map {
    fn from_iter<I: IntoIterator<Item = Landmark>>(iter: I) -> Self {
        Map::new(iter.into_iter().collect())
    }
}

/// A single landmark detection in the vehicle (ego) frame.
///
/// The identifier is carried through for bookkeeping only; association never uses it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i32,
    pub x: f64,
    pub y: f64,
}
impl Observation {
    pub fn new(id: i32, x: f64, y: f64) -> Self {
        Observation { id, x, y }
    }
    pub fn local(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn transform_point_rotates_then_translates() {
        let pose = Pose::new(4.0, 5.0, -FRAC_PI_2);
        let mapped = pose.transform_point(&Point2::new(2.0, 2.0));
        assert_approx_eq!(mapped.x, 6.0, 1e-12);
        assert_approx_eq!(mapped.y, 3.0, 1e-12);
    }

    #[test]
    fn map_lookup_by_id() {
        let map: Map = vec![Landmark::new(1, 5.0, 3.0), Landmark::new(7, 2.0, 1.0)]
            .into_iter()
            .collect();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(7), Some(&Landmark::new(7, 2.0, 1.0)));
        assert!(map.get(3).is_none());
        assert!(Map::default().is_empty());
    }
}
