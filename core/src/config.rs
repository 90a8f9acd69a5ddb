//! Filter configuration and configuration file I/O.
//!
//! Configuration files may be JSON, YAML, or TOML; the format is chosen by file extension.
//!
//! ```
//! use landmark_pf::config::FilterConfig;
//! use landmark_pf::particle::ParticleResamplingStrategy;
//!
//! let cfg = FilterConfig {
//!     num_particles: 100,
//!     seed: Some(7),
//!     resampling_strategy: ParticleResamplingStrategy::Systematic,
//!     ..FilterConfig::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{FilterError, Result};
use crate::measurements::AssociationGating;
use crate::particle::{
    DegenerateWeightPolicy, ParticleAveragingStrategy, ParticleResamplingStrategy,
};

/// Number of particles used when none is configured.
///
/// Deliberately small. Raising it trades runtime for estimation quality.
pub const DEFAULT_NUM_PARTICLES: usize = 10;

fn default_num_particles() -> usize {
    DEFAULT_NUM_PARTICLES
}

fn default_record_associations() -> bool {
    true
}

/// Tunables of a single filter run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Number of particles N, fixed for the lifetime of the filter.
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,

    /// Seed for the filter's random number generator.
    ///
    /// The same seed reproduces a run exactly. When `None` a seed is drawn once from the
    /// thread-local generator when the filter is constructed.
    #[serde(default)]
    pub seed: Option<u64>,

    /// How a new particle set is drawn from the weighted one.
    #[serde(default)]
    pub resampling_strategy: ParticleResamplingStrategy,

    /// How the particle set is reduced to a single pose estimate.
    #[serde(default)]
    pub averaging_strategy: ParticleAveragingStrategy,

    /// Whether `sensor_range` restricts association candidates.
    #[serde(default)]
    pub association_gating: AssociationGating,

    /// What `resample` does when every weight is zero.
    #[serde(default)]
    pub degenerate_weights: DegenerateWeightPolicy,

    /// Attach matched landmark ids and map-frame observations to each particle.
    #[serde(default = "default_record_associations")]
    pub record_associations: bool,

    /// Weigh particles in parallel on the rayon thread pool.
    #[serde(default)]
    pub parallel_weighting: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: DEFAULT_NUM_PARTICLES,
            seed: None,
            resampling_strategy: ParticleResamplingStrategy::default(),
            averaging_strategy: ParticleAveragingStrategy::default(),
            association_gating: AssociationGating::default(),
            degenerate_weights: DegenerateWeightPolicy::default(),
            record_associations: true,
            parallel_weighting: false,
        }
    }
}

impl FilterConfig {
    /// Reject configurations that cannot produce a usable particle set.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfiguration(
                "number of particles must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the configuration from a JSON, YAML, or TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_config(path)
    }

    /// Write the configuration as JSON, YAML, or TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_config(self, path)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!(
            "unsupported configuration file extension: {}",
            path.display()
        ),
    )
}

/// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
pub fn read_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let p = path.as_ref();
    match extension(p).as_deref() {
        Some("json") => {
            let file = File::open(p)?;
            serde_json::from_reader(file).map_err(io::Error::other)
        }
        Some("yaml") | Some("yml") => {
            let file = File::open(p)?;
            serde_yaml::from_reader(file).map_err(io::Error::other)
        }
        Some("toml") => {
            let mut s = String::new();
            File::open(p)?.read_to_string(&mut s)?;
            toml::from_str(&s).map_err(io::Error::other)
        }
        _ => Err(unsupported_extension(p)),
    }
}

/// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
pub fn write_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> io::Result<()> {
    let p = path.as_ref();
    match extension(p).as_deref() {
        Some("json") => {
            let file = File::create(p)?;
            serde_json::to_writer_pretty(file, config).map_err(io::Error::other)
        }
        Some("yaml") | Some("yml") => {
            let s = serde_yaml::to_string(config).map_err(io::Error::other)?;
            File::create(p)?.write_all(s.as_bytes())
        }
        Some("toml") => {
            let s = toml::to_string(config).map_err(io::Error::other)?;
            File::create(p)?.write_all(s.as_bytes())
        }
        _ => Err(unsupported_extension(p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_uses_ten_particles() {
        let cfg = FilterConfig::default();
        assert_eq!(cfg.num_particles, 10);
        assert!(cfg.record_associations);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_particles_is_rejected() {
        let cfg = FilterConfig {
            num_particles: 0,
            ..FilterConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(FilterError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn round_trips_through_every_format() {
        let dir = tempdir().unwrap();
        let cfg = FilterConfig {
            num_particles: 250,
            seed: Some(42),
            resampling_strategy: ParticleResamplingStrategy::Residual,
            association_gating: AssociationGating::SensorRange,
            degenerate_weights: DegenerateWeightPolicy::Error,
            ..FilterConfig::default()
        };
        for name in ["cfg.json", "cfg.yaml", "cfg.toml"] {
            let path = dir.path().join(name);
            cfg.to_file(&path).unwrap();
            let read = FilterConfig::from_file(&path).unwrap();
            assert_eq!(read, cfg, "mismatch for {name}");
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: FilterConfig = toml::from_str("seed = 3").unwrap();
        assert_eq!(cfg.seed, Some(3));
        assert_eq!(cfg.num_particles, DEFAULT_NUM_PARTICLES);
        assert!(cfg.record_associations);
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.ini");
        let err = FilterConfig::default().to_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
