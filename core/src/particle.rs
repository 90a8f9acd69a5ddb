//! Particle filter for 2-D localization against a known landmark map.
//!
//! The filter owns a fixed-size set of [`Particle`]s and runs four stages once per sensor cycle:
//!
//! 1. [`ParticleFilter::initialize`] samples N poses around an initial estimate (once per run).
//! 2. [`ParticleFilter::predict`] advances every particle through the [motion model](crate::motion)
//!    and adds process noise.
//! 3. [`ParticleFilter::update_weights`] scores every particle against the current observation set
//!    with the [landmark measurement model](crate::measurements).
//! 4. [`ParticleFilter::resample`] draws a new set of N particles with probability proportional to
//!    weight.
//!
//! All randomness comes from a single [`StdRng`] owned by the filter, seeded once at construction
//! and advanced once per draw, so a seeded run is reproducible and successive cycles draw
//! uncorrelated noise.
//!
//! ```
//! use landmark_pf::config::FilterConfig;
//! use landmark_pf::map::{Landmark, Map, Observation};
//! use landmark_pf::particle::ParticleFilter;
//!
//! let map = Map::new(vec![Landmark::new(1, 5.0, 0.0)]);
//! let config = FilterConfig { seed: Some(1), ..FilterConfig::default() };
//! let mut pf = ParticleFilter::new(config).unwrap();
//! pf.initialize(0.0, 0.0, 0.0, [0.3, 0.3, 0.01]).unwrap();
//! pf.predict(0.1, [0.3, 0.3, 0.01], 1.0, 0.0).unwrap();
//! pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(0, 4.9, 0.0)], &map).unwrap();
//! pf.resample().unwrap();
//! assert_eq!(pf.num_particles(), 10);
//! ```

use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::map::{Map, Observation, Pose};
use crate::measurements::{LandmarkNoise, observation_likelihood};
use crate::motion::{ControlInput, propagate};
use crate::wrap_to_pi;

/// Association diagnostics attached to a particle by the last weighting pass.
///
/// Entry `i` of each list describes one associated observation: the id of the matched landmark
/// and the observation's coordinates in the map frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Associations {
    /// Id of the landmark each observation was matched to.
    pub landmark_ids: Vec<i32>,
    /// Map-frame x coordinate of each associated observation.
    pub sense_x: Vec<f64>,
    /// Map-frame y coordinate of each associated observation.
    pub sense_y: Vec<f64>,
}
impl Associations {
    pub fn with_capacity(capacity: usize) -> Self {
        Associations {
            landmark_ids: Vec::with_capacity(capacity),
            sense_x: Vec::with_capacity(capacity),
            sense_y: Vec::with_capacity(capacity),
        }
    }
    pub fn push(&mut self, landmark_id: i32, map_x: f64, map_y: f64) {
        self.landmark_ids.push(landmark_id);
        self.sense_x.push(map_x);
        self.sense_y.push(map_y);
    }
    pub fn len(&self) -> usize {
        self.landmark_ids.len()
    }
    pub fn is_empty(&self) -> bool {
        self.landmark_ids.is_empty()
    }
    /// Matched landmark ids as a space separated list.
    pub fn ids_string(&self) -> String {
        join_whitespace(&self.landmark_ids)
    }
    /// Map-frame x coordinates as a space separated list.
    pub fn sense_x_string(&self) -> String {
        join_whitespace(&self.sense_x)
    }
    /// Map-frame y coordinates as a space separated list.
    pub fn sense_y_string(&self) -> String {
        join_whitespace(&self.sense_y)
    }
}
impl Display for Associations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ids: [{}] x: [{}] y: [{}]",
            self.ids_string(),
            self.sense_x_string(),
            self.sense_y_string()
        )
    }
}

fn join_whitespace<T: Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// One pose hypothesis and its importance weight.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    /// Index in the initial particle set. Copies made by resampling keep their source id.
    pub id: usize,
    pub pose: Pose,
    /// Unnormalized importance weight.
    pub weight: f64,
    pub associations: Option<Associations>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(id: usize, pose: Pose, weight: f64) -> Particle {
        Particle {
            id,
            pose,
            weight,
            associations: None,
        }
    }
    /// Replace any previous association diagnostics.
    ///
    /// The three lists must have the same length.
    pub fn set_associations(
        &mut self,
        landmark_ids: Vec<i32>,
        sense_x: Vec<f64>,
        sense_y: Vec<f64>,
    ) -> Result<()> {
        if landmark_ids.len() != sense_x.len() || landmark_ids.len() != sense_y.len() {
            return Err(FilterError::InvalidInput(format!(
                "association lists differ in length: {} ids, {} x, {} y",
                landmark_ids.len(),
                sense_x.len(),
                sense_y.len()
            )));
        }
        self.associations = Some(Associations {
            landmark_ids,
            sense_x,
            sense_y,
        });
        Ok(())
    }
    pub fn clear_associations(&mut self) {
        self.associations = None;
    }
}

/// Reduction of the particle set to a single pose estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    /// Weight-proportional mean, heading averaged on the unit circle.
    #[default]
    WeightedAverage,
    /// Plain mean over all particles.
    UnweightedAverage,
    /// Pose of the highest-weight particle.
    HighestWeight,
}

/// Fallback used by [`ParticleFilter::resample`] when every weight is zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateWeightPolicy {
    /// Resample as if every particle had the same weight.
    #[default]
    Uniform,
    /// Refuse with [`FilterError::DegenerateWeights`].
    Error,
}

/// Scheme used to draw the new particle set.
///
/// Every scheme selects index `i` with expected frequency proportional to `weights[i]`; they
/// differ in the variance of the number of copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// N independent draws from the categorical distribution over the weights.
    #[default]
    Multinomial,
    /// One uniform offset, N evenly spaced pointers.
    Systematic,
    /// One uniform draw inside each of N equal strata.
    Stratified,
    /// Deterministic floor(N w_i) copies, remainder drawn systematically from the residuals.
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draw `particles.len()` particles according to normalized `weights`.
    ///
    /// `weights` must be non-negative, finite, and sum to one.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        particles: &[Particle],
        weights: &[f64],
        rng: &mut R,
    ) -> Result<Vec<Particle>> {
        debug_assert_eq!(particles.len(), weights.len());
        let indices = match self {
            ParticleResamplingStrategy::Multinomial => Self::multinomial(weights, rng)?,
            ParticleResamplingStrategy::Systematic => {
                let n = weights.len();
                let offset = rng.random::<f64>();
                let positions: Vec<f64> = (0..n).map(|i| (i as f64 + offset) / n as f64).collect();
                Self::select(weights, &positions)
            }
            ParticleResamplingStrategy::Stratified => {
                let n = weights.len();
                let positions: Vec<f64> = (0..n)
                    .map(|i| (i as f64 + rng.random::<f64>()) / n as f64)
                    .collect();
                Self::select(weights, &positions)
            }
            ParticleResamplingStrategy::Residual => Self::residual(weights, rng),
        };
        Ok(indices.into_iter().map(|i| particles[i].clone()).collect())
    }

    fn multinomial<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Result<Vec<usize>> {
        let distribution = WeightedIndex::new(weights)
            .map_err(|e| FilterError::DegenerateWeights(e.to_string()))?;
        Ok((0..weights.len())
            .map(|_| distribution.sample(rng))
            .collect())
    }

    /// Walk the cumulative weights once for sorted `positions` in [0, 1).
    fn select(weights: &[f64], positions: &[f64]) -> Vec<usize> {
        // Rounding can leave the final pointer past the total; never land on a zero weight.
        let last = weights
            .iter()
            .rposition(|w| *w > 0.0)
            .unwrap_or(weights.len() - 1);
        let mut indices = Vec::with_capacity(positions.len());
        let mut i = 0;
        let mut cumsum = weights[0];
        for &u in positions {
            while u >= cumsum && i < last {
                i += 1;
                cumsum += weights[i];
            }
            indices.push(i);
        }
        indices
    }

    fn residual<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
        let n = weights.len();
        let mut indices = Vec::with_capacity(n);
        let mut residual: Vec<f64> = vec![0.0; n];
        for (i, &w) in weights.iter().enumerate() {
            let copies = (w * n as f64).floor() as usize;
            residual[i] = w * n as f64 - copies as f64;
            indices.extend(std::iter::repeat_n(i, copies));
        }
        // Rounding can leave the deterministic pass one particle over.
        indices.truncate(n);
        let remaining = n - indices.len();
        if remaining > 0 {
            let sum_residual: f64 = residual.iter().sum();
            if sum_residual > 0.0 {
                for r in residual.iter_mut() {
                    *r /= sum_residual;
                }
            } else {
                residual.fill(1.0 / n as f64);
            }
            let offset = rng.random::<f64>();
            let positions: Vec<f64> = (0..remaining)
                .map(|j| (j as f64 + offset) / remaining as f64)
                .collect();
            indices.extend(Self::select(&residual, &positions));
        }
        indices
    }
}

/// Particle filter over 2-D poses.
///
/// Constructed uninitialized; every operation other than [`initialize`](Self::initialize)
/// fails with [`FilterError::NotInitialized`] until it has run.
#[derive(Clone)]
pub struct ParticleFilter {
    config: FilterConfig,
    particles: Vec<Particle>,
    rng: StdRng,
    is_initialized: bool,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ParticleFilter");
        s.field("num_particles", &self.config.num_particles)
            .field("is_initialized", &self.is_initialized);
        if self.is_initialized {
            let min_weight = self
                .particles
                .iter()
                .map(|p| p.weight)
                .fold(f64::INFINITY, f64::min);
            let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
            s.field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("effective_particles", &self.effective_sample_size());
            if let Ok((mean, _)) = self.estimate() {
                s.field(
                    "mean_pose",
                    &format_args!("({:.3}, {:.3}, {:.3} rad)", mean.x, mean.y, mean.theta),
                );
            }
        }
        s.finish()
    }
}

impl ParticleFilter {
    /// Create an uninitialized filter.
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        debug!(
            "Created particle filter with {} particles (seed {})",
            config.num_particles, seed
        );
        Ok(ParticleFilter {
            config,
            particles: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            is_initialized: false,
        })
    }

    /// Create an initialized filter from an explicit particle set.
    ///
    /// The configured particle count is replaced by the length of `particles`.
    pub fn with_particles(config: FilterConfig, particles: Vec<Particle>) -> Result<Self> {
        if particles.is_empty() {
            return Err(FilterError::InvalidConfiguration(
                "particle set must not be empty".to_string(),
            ));
        }
        if let Some(p) = particles
            .iter()
            .find(|p| !(p.weight.is_finite() && p.weight >= 0.0))
        {
            return Err(FilterError::InvalidConfiguration(format!(
                "particle {} has invalid weight {}",
                p.id, p.weight
            )));
        }
        let config = FilterConfig {
            num_particles: particles.len(),
            ..config
        };
        let mut filter = ParticleFilter::new(config)?;
        filter.particles = particles;
        filter.is_initialized = true;
        Ok(filter)
    }

    /// Sample N particles around `(x, y, theta)` with per-axis standard deviations `std`.
    ///
    /// Every particle starts with weight 1. Standard deviations must be strictly positive.
    pub fn initialize(&mut self, x: f64, y: f64, theta: f64, std: [f64; 3]) -> Result<()> {
        if self.is_initialized {
            return Err(FilterError::AlreadyInitialized);
        }
        if !(x.is_finite() && y.is_finite() && theta.is_finite()) {
            return Err(FilterError::InvalidConfiguration(format!(
                "initial pose must be finite, got ({x}, {y}, {theta})"
            )));
        }
        if let Some(s) = std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(FilterError::InvalidConfiguration(format!(
                "initial std devs must be positive and finite, got {s}"
            )));
        }
        let dist_x = normal(x, std[0])?;
        let dist_y = normal(y, std[1])?;
        let dist_theta = normal(theta, std[2])?;
        let n = self.config.num_particles;
        let mut particles = Vec::with_capacity(n);
        for id in 0..n {
            let pose = Pose {
                x: dist_x.sample(&mut self.rng),
                y: dist_y.sample(&mut self.rng),
                theta: dist_theta.sample(&mut self.rng),
            };
            particles.push(Particle::new(id, pose, 1.0));
        }
        self.particles = particles;
        self.is_initialized = true;
        debug!(
            "Initialized {} particles around ({:.3}, {:.3}, {:.3})",
            n, x, y, theta
        );
        Ok(())
    }

    /// Advance every particle by `delta_t` seconds under `velocity` and `yaw_rate`, then add
    /// zero-mean Gaussian noise with standard deviations `std_pos` = [x, y, theta].
    ///
    /// A zero standard deviation disables noise on that axis.
    pub fn predict(
        &mut self,
        delta_t: f64,
        std_pos: [f64; 3],
        velocity: f64,
        yaw_rate: f64,
    ) -> Result<()> {
        self.ensure_initialized()?;
        if !delta_t.is_finite() || delta_t < 0.0 {
            return Err(FilterError::InvalidInput(format!(
                "time step must be finite and non-negative, got {delta_t}"
            )));
        }
        if !(velocity.is_finite() && yaw_rate.is_finite()) {
            return Err(FilterError::InvalidInput(format!(
                "control must be finite, got velocity {velocity}, yaw rate {yaw_rate}"
            )));
        }
        if let Some(s) = std_pos.iter().find(|s| !(s.is_finite() && **s >= 0.0)) {
            return Err(FilterError::InvalidInput(format!(
                "process noise std devs must be non-negative and finite, got {s}"
            )));
        }
        let noise_x = normal(0.0, std_pos[0])?;
        let noise_y = normal(0.0, std_pos[1])?;
        let noise_theta = normal(0.0, std_pos[2])?;
        let control = ControlInput::new(velocity, yaw_rate);
        for particle in &mut self.particles {
            let mean = propagate(&particle.pose, &control, delta_t);
            particle.pose = Pose {
                x: mean.x + noise_x.sample(&mut self.rng),
                y: mean.y + noise_y.sample(&mut self.rng),
                theta: mean.theta + noise_theta.sample(&mut self.rng),
            };
        }
        debug!(
            "Predicted {} particles over {:.3} s (v = {:.3}, yaw rate = {:.4})",
            self.particles.len(),
            delta_t,
            velocity,
            yaw_rate
        );
        Ok(())
    }

    /// Replace every particle weight by the likelihood of `observations` under its pose.
    ///
    /// With an empty observation set every weight becomes exactly 1. With a non-empty set and an
    /// empty map the call fails with [`FilterError::EmptyMap`] and no weight is modified. Non-finite
    /// observation or landmark coordinates are rejected with [`FilterError::InvalidInput`].
    pub fn update_weights(
        &mut self,
        sensor_range: f64,
        std_landmark: [f64; 2],
        observations: &[Observation],
        map: &Map,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let noise = LandmarkNoise::from(std_landmark);
        noise.validate()?;
        if sensor_range.is_nan() || sensor_range < 0.0 {
            return Err(FilterError::InvalidInput(format!(
                "sensor range must be non-negative, got {sensor_range}"
            )));
        }
        if let Some(o) = observations
            .iter()
            .find(|o| !(o.x.is_finite() && o.y.is_finite()))
        {
            return Err(FilterError::InvalidInput(format!(
                "observation {} has non-finite coordinates ({}, {})",
                o.id, o.x, o.y
            )));
        }
        if let Some(l) = map.iter().find(|l| !(l.x.is_finite() && l.y.is_finite())) {
            return Err(FilterError::InvalidInput(format!(
                "landmark {} has non-finite coordinates ({}, {})",
                l.id, l.x, l.y
            )));
        }
        if observations.is_empty() {
            warn!("Empty observation set; all particle weights reset to 1");
        }
        let gating = self.config.association_gating;
        let score = |pose: &Pose| {
            observation_likelihood(pose, observations, map, &noise, sensor_range, gating)
        };
        let scores: Vec<(f64, Associations)> = if self.config.parallel_weighting {
            self.particles
                .par_iter()
                .map(|p| score(&p.pose))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.particles
                .iter()
                .map(|p| score(&p.pose))
                .collect::<Result<Vec<_>>>()?
        };
        let record = self.config.record_associations;
        for (particle, (weight, associations)) in self.particles.iter_mut().zip(scores) {
            particle.weight = weight;
            particle.associations = if record { Some(associations) } else { None };
        }
        if log::log_enabled!(log::Level::Debug) {
            let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
            debug!(
                "Weighted {} particles against {} observations (max weight {:.4e})",
                self.particles.len(),
                observations.len(),
                max_weight
            );
        }
        Ok(())
    }

    /// Replace the particle set by N draws with probability proportional to weight.
    ///
    /// Copies keep their weight and association diagnostics until the next weighting pass.
    /// Weights are rescaled by their maximum before normalizing, so a sum that overflows is still
    /// usable. Weights that overflowed to infinity share the probability mass equally and every
    /// finite weight gets none. If every weight is zero the configured [`DegenerateWeightPolicy`]
    /// applies. Negative or NaN weights always fail with [`FilterError::DegenerateWeights`].
    pub fn resample(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let weights = self.weights()?;
        if let Some(w) = weights.iter().find(|w| !(**w >= 0.0)) {
            return Err(FilterError::DegenerateWeights(format!(
                "weight {w} is not a non-negative number"
            )));
        }
        let n = weights.len();
        let normalized = match normalize(&weights) {
            Some(normalized) => normalized,
            None => match self.config.degenerate_weights {
                DegenerateWeightPolicy::Uniform => {
                    warn!("All particle weights are zero; resampling uniformly");
                    vec![1.0 / n as f64; n]
                }
                DegenerateWeightPolicy::Error => {
                    return Err(FilterError::DegenerateWeights(
                        "all particle weights are zero".to_string(),
                    ));
                }
            },
        };
        let resampled =
            self.config
                .resampling_strategy
                .resample(&self.particles, &normalized, &mut self.rng)?;
        debug_assert_eq!(resampled.len(), n);
        debug!(
            "Resampled {} particles ({:?}), {} distinct survivors",
            n,
            self.config.resampling_strategy,
            distinct_ids(&resampled)
        );
        self.particles = resampled;
        Ok(())
    }

    /// Drop the particle set and return to the uninitialized state.
    pub fn reset(&mut self) {
        self.particles.clear();
        self.is_initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn num_particles(&self) -> usize {
        self.config.num_particles
    }

    pub fn particles(&self) -> Result<&[Particle]> {
        self.ensure_initialized()?;
        Ok(&self.particles)
    }

    /// Mutable access to the particle set, e.g. for attaching diagnostics.
    pub fn particles_mut(&mut self) -> Result<&mut [Particle]> {
        self.ensure_initialized()?;
        Ok(&mut self.particles)
    }

    /// Current (unnormalized) weights in particle order.
    pub fn weights(&self) -> Result<Vec<f64>> {
        self.ensure_initialized()?;
        Ok(self.particles.iter().map(|p| p.weight).collect())
    }

    /// Effective sample size `1 / sum(w_i^2)` of the normalized weights. Zero if every weight is
    /// zero, any weight is negative or NaN, or the filter is uninitialized.
    pub fn effective_sample_size(&self) -> f64 {
        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        match normalize(&weights) {
            Some(normalized) => 1.0 / normalized.iter().map(|w| w * w).sum::<f64>(),
            None => 0.0,
        }
    }

    /// Highest-weight particle; the first one wins ties.
    pub fn best_particle(&self) -> Result<&Particle> {
        self.ensure_initialized()?;
        let mut best = &self.particles[0];
        for particle in &self.particles[1..] {
            if particle.weight > best.weight {
                best = particle;
            }
        }
        Ok(best)
    }

    /// Pose estimate and its covariance according to the configured averaging strategy.
    pub fn estimate(&self) -> Result<(Pose, Matrix3<f64>)> {
        self.ensure_initialized()?;
        let estimate = match self.config.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => {
                let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
                match normalize(&weights) {
                    Some(normalized) => weighted_mean_and_covariance(&self.particles, &normalized),
                    None => unweighted_mean_and_covariance(&self.particles),
                }
            }
            ParticleAveragingStrategy::UnweightedAverage => {
                unweighted_mean_and_covariance(&self.particles)
            }
            ParticleAveragingStrategy::HighestWeight => {
                (self.best_particle()?.pose, Matrix3::zeros())
            }
        };
        Ok(estimate)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized {
            Ok(())
        } else {
            Err(FilterError::NotInitialized)
        }
    }
}

fn normal(mean: f64, std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std_dev).map_err(|e| FilterError::InvalidInput(e.to_string()))
}

/// Scale `weights` to sum to one.
///
/// Weights are divided by their maximum first so the sum cannot overflow. If any weight is
/// infinite the infinite ones share the mass equally. `None` if every weight is zero or any is
/// negative or NaN.
fn normalize(weights: &[f64]) -> Option<Vec<f64>> {
    if weights.iter().any(|w| !(*w >= 0.0)) {
        return None;
    }
    let scaled: Vec<f64> = if weights.iter().any(|w| w.is_infinite()) {
        weights
            .iter()
            .map(|w| if w.is_infinite() { 1.0 } else { 0.0 })
            .collect()
    } else {
        let max = weights.iter().copied().fold(0.0, f64::max);
        if max == 0.0 {
            return None;
        }
        weights.iter().map(|w| w / max).collect()
    };
    let sum: f64 = scaled.iter().sum();
    Some(scaled.iter().map(|w| w / sum).collect())
}

fn distinct_ids(particles: &[Particle]) -> usize {
    let mut ids: Vec<usize> = particles.iter().map(|p| p.id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}

fn unweighted_mean_and_covariance(particles: &[Particle]) -> (Pose, Matrix3<f64>) {
    let weights = vec![1.0; particles.len()];
    weighted_mean_and_covariance(particles, &weights)
}

/// Weighted mean with a circular mean for heading. `weights` must have a positive sum.
fn weighted_mean_and_covariance(particles: &[Particle], weights: &[f64]) -> (Pose, Matrix3<f64>) {
    let sum: f64 = weights.iter().sum();
    let (mut x, mut y, mut sin, mut cos) = (0.0, 0.0, 0.0, 0.0);
    for (particle, w) in particles.iter().zip(weights) {
        let w = w / sum;
        x += w * particle.pose.x;
        y += w * particle.pose.y;
        sin += w * particle.pose.theta.sin();
        cos += w * particle.pose.theta.cos();
    }
    let mean = Pose::new(x, y, sin.atan2(cos));
    let mut cov = Matrix3::<f64>::zeros();
    for (particle, w) in particles.iter().zip(weights) {
        let diff = Vector3::new(
            particle.pose.x - mean.x,
            particle.pose.y - mean.y,
            wrap_to_pi(particle.pose.theta - mean.theta),
        );
        cov += (w / sum) * diff * diff.transpose();
    }
    (mean, cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Landmark;
    use crate::measurements::{AssociationGating, bivariate_gaussian};
    use assert_approx_eq::assert_approx_eq;

    fn seeded(n: usize) -> FilterConfig {
        FilterConfig {
            num_particles: n,
            seed: Some(1234),
            ..FilterConfig::default()
        }
    }

    fn particles_at(poses: &[Pose], weights: &[f64]) -> Vec<Particle> {
        poses
            .iter()
            .zip(weights)
            .enumerate()
            .map(|(i, (pose, w))| Particle::new(i, *pose, *w))
            .collect()
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut pf = ParticleFilter::new(seeded(10)).unwrap();
        assert_eq!(
            pf.predict(0.1, [0.0; 3], 1.0, 0.0),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(
            pf.update_weights(50.0, [0.3, 0.3], &[], &Map::default()),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(pf.resample(), Err(FilterError::NotInitialized));
        assert_eq!(pf.weights(), Err(FilterError::NotInitialized));
        assert!(pf.estimate().is_err());
        assert!(pf.best_particle().is_err());
    }

    #[test]
    fn initialize_twice_fails_until_reset() {
        let mut pf = ParticleFilter::new(seeded(10)).unwrap();
        pf.initialize(1.0, 2.0, 0.5, [0.3, 0.3, 0.01]).unwrap();
        assert_eq!(
            pf.initialize(1.0, 2.0, 0.5, [0.3, 0.3, 0.01]),
            Err(FilterError::AlreadyInitialized)
        );
        pf.reset();
        assert!(!pf.is_initialized());
        pf.initialize(1.0, 2.0, 0.5, [0.3, 0.3, 0.01]).unwrap();
    }

    #[test]
    fn initialize_samples_around_estimate_with_unit_weights() {
        let mut pf = ParticleFilter::new(seeded(2000)).unwrap();
        pf.initialize(10.0, -5.0, 1.0, [0.5, 0.2, 0.05]).unwrap();
        let particles = pf.particles().unwrap();
        assert_eq!(particles.len(), 2000);
        assert!(particles.iter().all(|p| p.weight == 1.0));
        assert!(particles.iter().enumerate().all(|(i, p)| p.id == i));
        let (mean, cov) = pf.estimate().unwrap();
        assert_approx_eq!(mean.x, 10.0, 0.05);
        assert_approx_eq!(mean.y, -5.0, 0.02);
        assert_approx_eq!(mean.theta, 1.0, 0.01);
        assert_approx_eq!(cov[(0, 0)].sqrt(), 0.5, 0.05);
        assert_approx_eq!(cov[(1, 1)].sqrt(), 0.2, 0.02);
    }

    #[test]
    fn initialize_rejects_non_positive_std() {
        let mut pf = ParticleFilter::new(seeded(10)).unwrap();
        for std in [[0.0, 0.3, 0.01], [0.3, -0.3, 0.01], [0.3, 0.3, f64::NAN]] {
            assert!(matches!(
                pf.initialize(0.0, 0.0, 0.0, std),
                Err(FilterError::InvalidConfiguration(_))
            ));
        }
        assert!(!pf.is_initialized());
    }

    #[test]
    fn zero_particles_rejected() {
        assert!(matches!(
            ParticleFilter::new(seeded(0)),
            Err(FilterError::InvalidConfiguration(_))
        ));
        assert!(ParticleFilter::with_particles(seeded(0), Vec::new()).is_err());
    }

    #[test]
    fn same_seed_reproduces_run() {
        let run = || {
            let mut pf = ParticleFilter::new(seeded(50)).unwrap();
            pf.initialize(0.0, 0.0, 0.0, [0.3, 0.3, 0.01]).unwrap();
            pf.predict(0.1, [0.3, 0.3, 0.01], 5.0, 0.2).unwrap();
            pf.particles().unwrap().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn successive_predictions_draw_fresh_noise() {
        let particles = particles_at(&[Pose::default(); 2], &[1.0, 1.0]);
        let mut pf = ParticleFilter::with_particles(seeded(2), particles).unwrap();
        pf.predict(1.0, [0.5, 0.5, 0.0], 0.0, 0.0).unwrap();
        let first: Vec<Pose> = pf.particles().unwrap().iter().map(|p| p.pose).collect();
        // Two particles from the same start must not receive the same noise.
        assert_ne!(first[0], first[1]);
        pf.predict(1.0, [0.5, 0.5, 0.0], 0.0, 0.0).unwrap();
        let second: Vec<Pose> = pf.particles().unwrap().iter().map(|p| p.pose).collect();
        let step0 = (second[0].x - first[0].x, second[0].y - first[0].y);
        let step1 = (first[0].x, first[0].y);
        assert_ne!(step0, step1);
    }

    #[test]
    fn predict_rejects_negative_noise() {
        let mut pf = ParticleFilter::with_particles(
            seeded(1),
            particles_at(&[Pose::default()], &[1.0]),
        )
        .unwrap();
        assert!(matches!(
            pf.predict(0.1, [0.3, -0.1, 0.0], 1.0, 0.0),
            Err(FilterError::InvalidInput(_))
        ));
        assert!(matches!(
            pf.predict(f64::NAN, [0.3, 0.1, 0.0], 1.0, 0.0),
            Err(FilterError::InvalidInput(_))
        ));
    }

    #[test]
    fn update_weights_attaches_associations() {
        let map = Map::new(vec![Landmark::new(3, 2.0, 0.0), Landmark::new(9, 0.0, 2.0)]);
        let mut pf = ParticleFilter::with_particles(
            seeded(1),
            particles_at(&[Pose::default()], &[1.0]),
        )
        .unwrap();
        let observations = [Observation::new(0, 2.0, 0.0), Observation::new(1, 0.1, 1.9)];
        pf.update_weights(50.0, [0.3, 0.3], &observations, &map)
            .unwrap();
        let particle = &pf.particles().unwrap()[0];
        let associations = particle.associations.as_ref().unwrap();
        assert_eq!(associations.ids_string(), "3 9");
        assert_eq!(associations.sense_x_string(), "2 0.1");
        assert_eq!(associations.sense_y_string(), "0 1.9");
    }

    #[test]
    fn association_recording_can_be_disabled() {
        let map = Map::new(vec![Landmark::new(3, 2.0, 0.0)]);
        let config = FilterConfig {
            record_associations: false,
            ..seeded(1)
        };
        let mut pf =
            ParticleFilter::with_particles(config, particles_at(&[Pose::default()], &[1.0]))
                .unwrap();
        pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(0, 2.0, 0.0)], &map)
            .unwrap();
        assert!(pf.particles().unwrap()[0].associations.is_none());
    }

    #[test]
    fn empty_map_with_observations_fails_without_touching_weights() {
        let mut pf = ParticleFilter::with_particles(
            seeded(2),
            particles_at(&[Pose::default(); 2], &[0.25, 0.75]),
        )
        .unwrap();
        assert_eq!(
            pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(0, 1.0, 1.0)], &Map::default()),
            Err(FilterError::EmptyMap)
        );
        assert_eq!(pf.weights().unwrap(), vec![0.25, 0.75]);
        // No observations against an empty map is fine.
        pf.update_weights(50.0, [0.3, 0.3], &[], &Map::default())
            .unwrap();
        assert_eq!(pf.weights().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn parallel_weighting_matches_sequential() {
        let map = Map::new(vec![
            Landmark::new(1, 5.0, 3.0),
            Landmark::new(2, 2.0, 1.0),
            Landmark::new(3, 6.0, 1.0),
        ]);
        let observations = [Observation::new(0, 2.0, 2.0), Observation::new(0, 3.0, -2.0)];
        let weigh = |parallel: bool| {
            let config = FilterConfig {
                num_particles: 64,
                seed: Some(5),
                parallel_weighting: parallel,
                ..FilterConfig::default()
            };
            let mut pf = ParticleFilter::new(config).unwrap();
            pf.initialize(4.0, 5.0, -1.5, [0.3, 0.3, 0.05]).unwrap();
            pf.update_weights(50.0, [0.3, 0.3], &observations, &map)
                .unwrap();
            pf.weights().unwrap()
        };
        assert_eq!(weigh(true), weigh(false));
    }

    #[test]
    fn zero_weights_resample_uniformly_by_default() {
        let poses = [Pose::new(0.0, 0.0, 0.0), Pose::new(1.0, 0.0, 0.0)];
        let mut pf =
            ParticleFilter::with_particles(seeded(2), particles_at(&poses, &[0.0, 0.0])).unwrap();
        pf.resample().unwrap();
        assert_eq!(pf.particles().unwrap().len(), 2);
    }

    #[test]
    fn zero_weights_error_when_configured() {
        let config = FilterConfig {
            degenerate_weights: DegenerateWeightPolicy::Error,
            ..seeded(2)
        };
        let mut pf = ParticleFilter::with_particles(
            config,
            particles_at(&[Pose::default(); 2], &[0.0, 0.0]),
        )
        .unwrap();
        assert!(matches!(
            pf.resample(),
            Err(FilterError::DegenerateWeights(_))
        ));
    }

    #[test]
    fn invalid_weights_always_error() {
        let mut pf = ParticleFilter::with_particles(
            seeded(2),
            particles_at(&[Pose::default(); 2], &[1.0, 1.0]),
        )
        .unwrap();
        pf.particles_mut().unwrap()[1].weight = f64::NAN;
        assert!(matches!(
            pf.resample(),
            Err(FilterError::DegenerateWeights(_))
        ));
    }

    #[test]
    fn every_strategy_keeps_cardinality_and_drops_zero_weight() {
        let poses: Vec<Pose> = (0..8).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect();
        let weights = [0.0, 3.0, 0.0, 1.0, 0.0, 0.0, 4.0, 0.0];
        for strategy in [
            ParticleResamplingStrategy::Multinomial,
            ParticleResamplingStrategy::Systematic,
            ParticleResamplingStrategy::Stratified,
            ParticleResamplingStrategy::Residual,
        ] {
            let config = FilterConfig {
                resampling_strategy: strategy,
                ..seeded(8)
            };
            let mut pf =
                ParticleFilter::with_particles(config, particles_at(&poses, &weights)).unwrap();
            pf.resample().unwrap();
            let particles = pf.particles().unwrap();
            assert_eq!(particles.len(), 8, "{strategy:?}");
            assert!(
                particles.iter().all(|p| [1, 3, 6].contains(&p.id)),
                "{strategy:?} kept a zero-weight particle"
            );
        }
    }

    #[test]
    fn residual_resampling_copies_floor_share() {
        let poses: Vec<Pose> = (0..4).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect();
        let config = FilterConfig {
            resampling_strategy: ParticleResamplingStrategy::Residual,
            ..seeded(4)
        };
        let mut pf =
            ParticleFilter::with_particles(config, particles_at(&poses, &[0.5, 0.25, 0.25, 0.0]))
                .unwrap();
        pf.resample().unwrap();
        let mut ids: Vec<usize> = pf.particles().unwrap().iter().map(|p| p.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 0, 1, 2]);
    }

    #[test]
    fn resampling_keeps_association_diagnostics() {
        let mut particles = particles_at(&[Pose::default()], &[1.0]);
        particles[0]
            .set_associations(vec![4], vec![1.5], vec![-2.0])
            .unwrap();
        let mut pf = ParticleFilter::with_particles(seeded(1), particles).unwrap();
        pf.resample().unwrap();
        let associations = pf.particles().unwrap()[0].associations.clone().unwrap();
        assert_eq!(associations.ids_string(), "4");
    }

    #[test]
    fn set_associations_checks_lengths() {
        let mut particle = Particle::new(0, Pose::default(), 1.0);
        assert!(
            particle
                .set_associations(vec![1, 2], vec![0.0], vec![0.0, 1.0])
                .is_err()
        );
        particle
            .set_associations(vec![1, 2], vec![0.5, 1.25], vec![-1.0, 3.0])
            .unwrap();
        let associations = particle.associations.as_ref().unwrap();
        assert_eq!(associations.ids_string(), "1 2");
        assert_eq!(associations.sense_x_string(), "0.5 1.25");
        assert_eq!(associations.sense_y_string(), "-1 3");
        assert_eq!(Associations::default().ids_string(), "");
        particle.clear_associations();
        assert!(particle.associations.is_none());
    }

    #[test]
    fn best_particle_prefers_first_on_ties() {
        let poses: Vec<Pose> = (0..3).map(|i| Pose::new(i as f64, 0.0, 0.0)).collect();
        let pf =
            ParticleFilter::with_particles(seeded(3), particles_at(&poses, &[0.2, 0.4, 0.4]))
                .unwrap();
        assert_eq!(pf.best_particle().unwrap().id, 1);
    }

    #[test]
    fn estimate_strategies() {
        let poses = [Pose::new(0.0, 0.0, 3.1), Pose::new(4.0, 2.0, -3.1)];
        let weights = [1.0, 3.0];
        let estimate = |strategy| {
            let config = FilterConfig {
                averaging_strategy: strategy,
                ..seeded(2)
            };
            ParticleFilter::with_particles(config, particles_at(&poses, &weights))
                .unwrap()
                .estimate()
                .unwrap()
                .0
        };
        let weighted = estimate(ParticleAveragingStrategy::WeightedAverage);
        assert_approx_eq!(weighted.x, 3.0, 1e-12);
        assert_approx_eq!(weighted.y, 1.5, 1e-12);
        // Headings straddle +/- pi; the mean must stay near pi rather than collapse to zero.
        assert!(weighted.theta.abs() > 3.0);

        let unweighted = estimate(ParticleAveragingStrategy::UnweightedAverage);
        assert_approx_eq!(unweighted.x, 2.0, 1e-12);
        assert_approx_eq!(unweighted.y, 1.0, 1e-12);

        let best = estimate(ParticleAveragingStrategy::HighestWeight);
        assert_eq!(best, poses[1]);
    }

    #[test]
    fn effective_sample_size_bounds() {
        let poses = [Pose::default(); 4];
        let uniform =
            ParticleFilter::with_particles(seeded(4), particles_at(&poses, &[2.0; 4])).unwrap();
        assert_approx_eq!(uniform.effective_sample_size(), 4.0, 1e-12);
        let peaked = ParticleFilter::with_particles(
            seeded(4),
            particles_at(&poses, &[0.0, 5.0, 0.0, 0.0]),
        )
        .unwrap();
        assert_approx_eq!(peaked.effective_sample_size(), 1.0, 1e-12);
        let dead =
            ParticleFilter::with_particles(seeded(4), particles_at(&poses, &[0.0; 4])).unwrap();
        assert_eq!(dead.effective_sample_size(), 0.0);
    }

    #[test]
    fn update_weights_rejects_non_finite_coordinates() {
        let map = Map::new(vec![Landmark::new(1, 1.0, 0.0), Landmark::new(2, 5.0, 0.0)]);
        let mut pf = ParticleFilter::with_particles(
            seeded(1),
            particles_at(&[Pose::default()], &[0.5]),
        )
        .unwrap();
        for observation in [
            Observation::new(0, f64::NAN, 0.0),
            Observation::new(0, 0.0, f64::INFINITY),
        ] {
            assert!(matches!(
                pf.update_weights(50.0, [0.3, 0.3], &[observation], &map),
                Err(FilterError::InvalidInput(_))
            ));
        }
        let bad_map = Map::new(vec![Landmark::new(1, 1.0, 0.0), Landmark::new(2, f64::NAN, 0.0)]);
        assert!(matches!(
            pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(0, 1.0, 0.0)], &bad_map),
            Err(FilterError::InvalidInput(_))
        ));
        assert_eq!(pf.weights().unwrap(), vec![0.5]);
        assert!(pf.particles().unwrap()[0].associations.is_none());
    }

    #[test]
    fn overflowing_weights_still_resample() {
        // 70 exact matches at sigma = 1e-3 multiply past f64::MAX.
        let map = Map::new(vec![Landmark::new(1, 1.0, 0.0)]);
        let observations = vec![Observation::new(0, 1.0, 0.0); 70];
        let mut pf = ParticleFilter::with_particles(
            seeded(2),
            particles_at(&[Pose::default(); 2], &[1.0, 1.0]),
        )
        .unwrap();
        pf.update_weights(50.0, [1e-3, 1e-3], &observations, &map)
            .unwrap();
        assert!(pf.weights().unwrap().iter().all(|w| w.is_infinite()));
        assert_approx_eq!(pf.effective_sample_size(), 2.0, 1e-12);
        assert!(pf.estimate().is_ok());
        pf.resample().unwrap();
        assert_eq!(pf.particles().unwrap().len(), 2);
    }

    #[test]
    fn infinite_weight_takes_all_the_mass() {
        let poses = [Pose::new(0.0, 0.0, 0.0), Pose::new(1.0, 0.0, 0.0)];
        let mut pf =
            ParticleFilter::with_particles(seeded(2), particles_at(&poses, &[1.0, 1.0])).unwrap();
        pf.particles_mut().unwrap()[0].weight = f64::INFINITY;
        let (estimate, _) = pf.estimate().unwrap();
        assert_approx_eq!(estimate.x, 0.0, 1e-12);
        pf.resample().unwrap();
        assert!(pf.particles().unwrap().iter().all(|p| p.id == 0));
    }

    #[test]
    fn weight_sum_overflow_is_rescaled() {
        let poses = [Pose::new(0.0, 0.0, 0.0), Pose::new(2.0, 0.0, 0.0)];
        let mut pf = ParticleFilter::with_particles(
            seeded(2),
            particles_at(&poses, &[f64::MAX, f64::MAX]),
        )
        .unwrap();
        assert_approx_eq!(pf.effective_sample_size(), 2.0, 1e-12);
        let (estimate, _) = pf.estimate().unwrap();
        assert_approx_eq!(estimate.x, 1.0, 1e-12);
        pf.resample().unwrap();
        assert_eq!(pf.particles().unwrap().len(), 2);
    }

    #[test]
    fn negative_weights_always_error() {
        let mut pf = ParticleFilter::with_particles(
            seeded(2),
            particles_at(&[Pose::default(); 2], &[1.0, 1.0]),
        )
        .unwrap();
        pf.particles_mut().unwrap()[0].weight = -1.0;
        assert!(matches!(
            pf.resample(),
            Err(FilterError::DegenerateWeights(_))
        ));
        assert_eq!(pf.effective_sample_size(), 0.0);
    }

    #[test]
    fn estimate_handles_huge_headings() {
        let mut pf = ParticleFilter::new(seeded(10)).unwrap();
        pf.initialize(0.0, 0.0, 1e17, [0.3, 0.3, 0.01]).unwrap();
        let (estimate, covariance) = pf.estimate().unwrap();
        assert!(estimate.theta.is_finite() && estimate.theta.abs() <= std::f64::consts::PI);
        assert!(covariance.iter().all(|c| c.is_finite()));
        assert!(format!("{pf:?}").contains("mean_pose"));
    }

    #[test]
    fn range_gating_skips_particles_without_landmarks_in_range() {
        // Candidates are the landmarks within range of the particle, so a particle with none in
        // range skips the observation entirely.
        let map = Map::new(vec![Landmark::new(1, 2.0, 0.0), Landmark::new(2, 100.0, 0.0)]);
        let poses = [Pose::new(0.0, 0.0, 0.0), Pose::new(50.0, 0.0, 0.0)];
        let observations = [Observation::new(0, 2.0, 0.1)];
        let weigh = |gating| {
            let config = FilterConfig {
                association_gating: gating,
                ..seeded(2)
            };
            let mut pf =
                ParticleFilter::with_particles(config, particles_at(&poses, &[1.0, 1.0])).unwrap();
            pf.update_weights(10.0, [0.3, 0.3], &observations, &map)
                .unwrap();
            pf.particles().unwrap().to_vec()
        };
        let noise = LandmarkNoise::new(0.3, 0.3);

        let gated = weigh(AssociationGating::SensorRange);
        assert_approx_eq!(gated[0].weight, bivariate_gaussian(0.0, 0.1, &noise), 1e-12);
        let near = gated[0].associations.as_ref().unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near.landmark_ids, vec![1]);
        assert_eq!(gated[1].weight, 1.0);
        assert!(gated[1].associations.as_ref().unwrap().is_empty());

        // Without gating the far particle is forced onto landmark 2, 48 m away.
        let ungated = weigh(AssociationGating::Disabled);
        assert_eq!(ungated[1].associations.as_ref().unwrap().landmark_ids, vec![2]);
        assert!(ungated[1].weight < 1e-100);
    }
}
