//! Simulation utilities and CSV data loading for landmark localization.
//!
//! This module provides:
//! - A [`Scenario`] (landmark map, control stream, per-step observation sets, optional ground
//!   truth) with CSV import/export
//! - [`SimulationConfig`], the filter configuration plus the noise parameters of a run
//! - [`generate_scenario`] for producing synthetic scenarios from a map and a control stream
//! - [`run_scenario`], which drives the filter cycle over a scenario, and [`StepResult`] for
//!   storing and analyzing the output
//!
//! A scenario directory contains the following CSV files (with headers):
//!
//! | file               | columns                 |
//! |--------------------|-------------------------|
//! | `landmarks.csv`    | `id,x,y`                |
//! | `controls.csv`     | `velocity,yaw_rate`     |
//! | `observations.csv` | `step,id,x,y`           |
//! | `ground_truth.csv` | `x,y,theta` (optional)  |
//!
//! Row `k` of `controls.csv` is the command executed between step `k` and step `k + 1`.

use anyhow::{Context, Result, bail, ensure};
use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::config::{FilterConfig, read_config, write_config};
use crate::map::{Landmark, Map, Observation, Pose};
use crate::motion::{ControlInput, propagate};
use crate::particle::ParticleFilter;
use crate::wrap_to_pi;

pub const LANDMARKS_FILE: &str = "landmarks.csv";
pub const CONTROLS_FILE: &str = "controls.csv";
pub const OBSERVATIONS_FILE: &str = "observations.csv";
pub const GROUND_TRUTH_FILE: &str = "ground_truth.csv";

/// One row of `observations.csv`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct ObservationRecord {
    step: usize,
    id: i32,
    x: f64,
    y: f64,
}

/// A complete localization run: the map, what the vehicle was told to do, and what it saw.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scenario {
    pub map: Map,
    /// Control executed after each step; one entry per step.
    pub controls: Vec<ControlInput>,
    /// Observation set of each step; one entry per step, possibly empty.
    pub observations: Vec<Vec<Observation>>,
    /// True pose at each step, when known.
    pub ground_truth: Option<Vec<Pose>>,
}

impl Scenario {
    /// Number of sensor cycles in the scenario.
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Check that the per-step streams line up.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.observations.len() == self.controls.len(),
            "scenario has {} controls but {} observation sets",
            self.controls.len(),
            self.observations.len()
        );
        if let Some(truth) = &self.ground_truth {
            ensure!(
                truth.len() == self.controls.len(),
                "scenario has {} controls but {} ground truth poses",
                self.controls.len(),
                truth.len()
            );
        }
        Ok(())
    }

    /// Load a scenario from a directory of CSV files.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let map = read_map(dir.join(LANDMARKS_FILE))?;
        let controls: Vec<ControlInput> = read_csv(&dir.join(CONTROLS_FILE))?;
        let records: Vec<ObservationRecord> = read_csv(&dir.join(OBSERVATIONS_FILE))?;
        let mut observations = vec![Vec::new(); controls.len()];
        for record in records {
            let Some(set) = observations.get_mut(record.step) else {
                bail!(
                    "observation at step {} but only {} control steps in {}",
                    record.step,
                    controls.len(),
                    dir.display()
                );
            };
            set.push(Observation::new(record.id, record.x, record.y));
        }
        let truth_path = dir.join(GROUND_TRUTH_FILE);
        let ground_truth = if truth_path.exists() {
            Some(read_csv(&truth_path)?)
        } else {
            None
        };
        let scenario = Scenario {
            map,
            controls,
            observations,
            ground_truth,
        };
        scenario
            .validate()
            .with_context(|| format!("inconsistent scenario in {}", dir.display()))?;
        info!(
            "Loaded scenario from {}: {} landmarks, {} steps",
            dir.display(),
            scenario.map.len(),
            scenario.len()
        );
        Ok(scenario)
    }

    /// Write the scenario as a directory of CSV files, creating the directory if needed.
    pub fn to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        write_csv(&dir.join(LANDMARKS_FILE), self.map.landmarks())?;
        write_csv(&dir.join(CONTROLS_FILE), &self.controls)?;
        let records: Vec<ObservationRecord> = self
            .observations
            .iter()
            .enumerate()
            .flat_map(|(step, set)| {
                set.iter().map(move |o| ObservationRecord {
                    step,
                    id: o.id,
                    x: o.x,
                    y: o.y,
                })
            })
            .collect();
        write_csv(&dir.join(OBSERVATIONS_FILE), &records)?;
        if let Some(truth) = &self.ground_truth {
            write_csv(&dir.join(GROUND_TRUTH_FILE), truth)?;
        }
        Ok(())
    }
}

/// Read a landmark map from a CSV file with columns `id,x,y`.
pub fn read_map<P: AsRef<Path>>(path: P) -> Result<Map> {
    let landmarks: Vec<Landmark> = read_csv(path.as_ref())?;
    Ok(Map::new(landmarks))
}

fn read_csv<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result.with_context(|| format!("malformed row in {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}

fn write_csv<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn default_delta_t() -> f64 {
    0.1
}
fn default_sensor_range() -> f64 {
    50.0
}
fn default_init_std() -> [f64; 3] {
    [0.3, 0.3, 0.01]
}
fn default_process_std() -> [f64; 3] {
    [0.3, 0.3, 0.01]
}
fn default_landmark_std() -> [f64; 2] {
    [0.3, 0.3]
}

/// Parameters of a simulation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Time between sensor cycles in seconds.
    #[serde(default = "default_delta_t")]
    pub delta_t: f64,
    /// Maximum reliable range of the landmark sensor in meters.
    #[serde(default = "default_sensor_range")]
    pub sensor_range: f64,
    /// Spread [x (m), y (m), theta (rad)] of the initial particle cloud.
    #[serde(default = "default_init_std")]
    pub init_std: [f64; 3],
    /// Process noise [x (m), y (m), theta (rad)] added at every prediction.
    #[serde(default = "default_process_std")]
    pub process_std: [f64; 3],
    /// Landmark measurement noise [x (m), y (m)].
    #[serde(default = "default_landmark_std")]
    pub landmark_std: [f64; 2],
    /// Initial pose estimate. Defaults to the first ground truth pose of the scenario.
    #[serde(default)]
    pub initial_pose: Option<Pose>,
    #[serde(default)]
    pub filter: FilterConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            delta_t: default_delta_t(),
            sensor_range: default_sensor_range(),
            init_std: default_init_std(),
            process_std: default_process_std(),
            landmark_std: default_landmark_std(),
            initial_pose: None,
            filter: FilterConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Read the configuration from a JSON, YAML, or TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_config(path)
    }

    /// Write the configuration as JSON, YAML, or TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_config(self, path)
    }
}

/// Filter output for one sensor cycle.
///
/// The estimate is taken after weighting and before resampling. Error columns are empty when the
/// scenario has no ground truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub best_x: f64,
    pub best_y: f64,
    pub best_theta: f64,
    pub best_weight: f64,
    pub effective_sample_size: f64,
    pub error_x: Option<f64>,
    pub error_y: Option<f64>,
    pub error_theta: Option<f64>,
    /// Landmark ids matched by the best particle, space separated.
    pub associations: String,
    pub sense_x: String,
    pub sense_y: String,
}

impl StepResult {
    pub fn to_csv<P: AsRef<Path>>(results: &[Self], path: P) -> Result<()> {
        write_csv(path.as_ref(), results)
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        read_csv(path.as_ref())
    }
}

/// Root-mean-square error of the estimate against ground truth.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub steps: usize,
    pub rmse_x: f64,
    pub rmse_y: f64,
    pub rmse_theta: f64,
}

/// Summarize the error columns of `results`; `None` if no step carries an error.
pub fn summarize(results: &[StepResult]) -> Option<ErrorSummary> {
    let errors: Vec<(f64, f64, f64)> = results
        .iter()
        .filter_map(|r| Some((r.error_x?, r.error_y?, r.error_theta?)))
        .collect();
    if errors.is_empty() {
        return None;
    }
    let n = errors.len() as f64;
    let rms = |f: fn(&(f64, f64, f64)) -> f64| {
        (errors.iter().map(|e| f(e).powi(2)).sum::<f64>() / n).sqrt()
    };
    Some(ErrorSummary {
        steps: errors.len(),
        rmse_x: rms(|e| e.0),
        rmse_y: rms(|e| e.1),
        rmse_theta: rms(|e| e.2),
    })
}

/// Run the filter over every step of `scenario`.
///
/// Step 0 initializes the filter around the initial pose; every later step predicts with the
/// previous step's control. Each step then weights against its observation set and resamples.
pub fn run_scenario(scenario: &Scenario, config: &SimulationConfig) -> Result<Vec<StepResult>> {
    scenario.validate()?;
    let initial = match (config.initial_pose, &scenario.ground_truth) {
        (Some(pose), _) => pose,
        (None, Some(truth)) if !truth.is_empty() => truth[0],
        _ => bail!("no initial pose configured and the scenario has no ground truth"),
    };
    let mut pf = ParticleFilter::new(config.filter.clone())?;
    let mut results = Vec::with_capacity(scenario.len());
    for (step, observations) in scenario.observations.iter().enumerate() {
        if step == 0 {
            pf.initialize(initial.x, initial.y, initial.theta, config.init_std)?;
        } else {
            let control = scenario.controls[step - 1];
            pf.predict(
                config.delta_t,
                config.process_std,
                control.velocity,
                control.yaw_rate,
            )
            .with_context(|| format!("prediction failed at step {step}"))?;
        }
        pf.update_weights(
            config.sensor_range,
            config.landmark_std,
            observations,
            &scenario.map,
        )
        .with_context(|| format!("weighting failed at step {step}"))?;

        let (estimate, _) = pf.estimate()?;
        let best = pf.best_particle()?;
        let truth = scenario.ground_truth.as_ref().map(|t| t[step]);
        let associations = best.associations.clone().unwrap_or_default();
        let result = StepResult {
            step,
            x: estimate.x,
            y: estimate.y,
            theta: estimate.theta,
            best_x: best.pose.x,
            best_y: best.pose.y,
            best_theta: best.pose.theta,
            best_weight: best.weight,
            effective_sample_size: pf.effective_sample_size(),
            error_x: truth.map(|t| estimate.x - t.x),
            error_y: truth.map(|t| estimate.y - t.y),
            error_theta: truth.map(|t| wrap_to_pi(estimate.theta - t.theta)),
            associations: associations.ids_string(),
            sense_x: associations.sense_x_string(),
            sense_y: associations.sense_y_string(),
        };
        debug!(
            "Step {}: estimate ({:.3}, {:.3}, {:.3}), best particle {} matched [{}]",
            step, result.x, result.y, result.theta, best.id, result.associations
        );
        results.push(result);

        pf.resample()
            .with_context(|| format!("resampling failed at step {step}"))?;
    }
    if let Some(summary) = summarize(&results) {
        info!(
            "Completed {} steps: RMSE x {:.3} m, y {:.3} m, theta {:.4} rad",
            results.len(),
            summary.rmse_x,
            summary.rmse_y,
            summary.rmse_theta
        );
    } else {
        info!("Completed {} steps", results.len());
    }
    Ok(results)
}

/// Simulate a vehicle executing `controls` from `start` through `map`.
///
/// The true trajectory follows the noiseless motion model. At every step each landmark within
/// `config.sensor_range` of the true pose is reported in the vehicle frame with Gaussian noise of
/// `config.landmark_std`. Observations carry their index within the step as identifier.
pub fn generate_scenario(
    map: &Map,
    controls: &[ControlInput],
    start: Pose,
    config: &SimulationConfig,
    seed: u64,
) -> Result<Scenario> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise_x = Normal::new(0.0, config.landmark_std[0])?;
    let noise_y = Normal::new(0.0, config.landmark_std[1])?;
    let mut truth = Vec::with_capacity(controls.len());
    let mut observations = Vec::with_capacity(controls.len());
    let mut pose = start;
    for control in controls {
        let (sin, cos) = pose.theta.sin_cos();
        let mut set = Vec::new();
        for landmark in map.iter() {
            let dx = landmark.x - pose.x;
            let dy = landmark.y - pose.y;
            if dx.hypot(dy) > config.sensor_range {
                continue;
            }
            // Inverse of the ego-to-map transform.
            let local_x = dx * cos + dy * sin;
            let local_y = -dx * sin + dy * cos;
            set.push(Observation::new(
                set.len() as i32,
                local_x + noise_x.sample(&mut rng),
                local_y + noise_y.sample(&mut rng),
            ));
        }
        truth.push(pose);
        observations.push(set);
        pose = propagate(&pose, control, config.delta_t);
    }
    Ok(Scenario {
        map: map.clone(),
        controls: controls.to_vec(),
        observations,
        ground_truth: Some(truth),
    })
}
