//! Landmark particle filter toolbox
//!
//! This crate implements a sequential Monte Carlo (particle filter) estimator for the planar pose
//! $(x, y, \theta)$ of a vehicle driving through a field of known landmarks. The filter is driven
//! synchronously by its caller: a control command $(v, \dot\psi, t)$ moves the particles, and a set
//! of landmark detections in the vehicle frame reweights them. The landmark map is supplied by the
//! caller and is never modified; this crate does not build maps.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the geometry (points, rotations) and the
//!   covariance of the pose estimate.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   Provide the seeded random number generator and the Gaussian and categorical distributions used for
//!   sampling and resampling.
//!
//! All other functionality is auxiliary (configuration files, CSV I/O, the simulation binary).
//!
//! ## Crate overview
//!
//! - [error]: The [`FilterError`] taxonomy returned by every filter operation.
//! - [map]: Poses, landmarks, the landmark map, and observations.
//! - [motion]: The unicycle motion model used by the prediction step.
//! - [measurements]: Coordinate transforms, nearest-neighbour data association, and the Gaussian
//!   observation likelihood.
//! - [particle]: Particles, resampling and averaging strategies, and the [`ParticleFilter`] itself.
//! - [config]: Filter configuration and configuration file I/O.
//! - [sim]: Scenario loading, synthetic scenario generation, and a driver that runs the filter
//!   cycle over a scenario.
//!
//! ## Filter cycle
//!
//! Each sensor cycle runs three stages in sequence over the shared particle set:
//!
//! $$
//! \text{predict}(u_k, t) \rightarrow \text{update\\_weights}(z_k, M) \rightarrow \text{resample}()
//! $$
//!
//! where the particle weight after the update is the product over observations $z_k^j$ of an
//! axis-aligned bivariate Gaussian density:
//!
//! $$
//! w = \prod_j \frac{1}{2 \pi \sigma_x \sigma_y}
//!     \exp\left( -\frac{\Delta x_j^2}{2 \sigma_x^2} - \frac{\Delta y_j^2}{2 \sigma_y^2} \right)
//! $$
//!
//! with $(\Delta x_j, \Delta y_j)$ the residual between the observation (transformed into the map
//! frame using the particle's pose) and its nearest landmark.

pub mod config;
pub mod error;
pub mod map;
pub mod measurements;
pub mod motion;
pub mod particle;
pub mod sim;

pub use error::{FilterError, Result};
pub use map::{Landmark, Map, Observation, Pose};
pub use motion::ControlInput;
pub use particle::{Particle, ParticleFilter};

/// Wrap an angle in radians to the range (-pi, pi].
///
/// Runs in constant time for any finite input. Non-finite input is returned unchanged.
///
/// # Example
///
/// ```
/// use landmark_pf::wrap_to_pi;
/// let wrapped = wrap_to_pi(3.0 * std::f64::consts::PI);
/// assert!((wrapped - std::f64::consts::PI).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let wrapped = angle.rem_euclid(2.0 * std::f64::consts::PI);
    if wrapped > std::f64::consts::PI {
        wrapped - 2.0 * std::f64::consts::PI
    } else {
        wrapped
    }
}
