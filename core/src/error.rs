//! Error types for the landmark particle filter.
//!
//! The filter is a pure numerical transform with no internal recovery path. Every failure is
//! reported to the caller as a [`FilterError`], who then decides whether to abort the run,
//! skip the cycle, or [`reset`](crate::particle::ParticleFilter::reset) and reinitialize.

use thiserror::Error;

/// Failures raised by [`ParticleFilter`](crate::particle::ParticleFilter) operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    /// An operation other than `initialize` was called on an uninitialized filter.
    #[error("particle filter used before initialization")]
    NotInitialized,

    /// `initialize` was called on a filter that already holds a particle set.
    #[error("particle filter is already initialized; call reset() first")]
    AlreadyInitialized,

    /// Resampling was requested but the weight vector cannot define a distribution.
    #[error("degenerate particle weights: {0}")]
    DegenerateWeights(String),

    /// Data association was attempted against a map with no landmarks.
    #[error("landmark map is empty; observations cannot be associated")]
    EmptyMap,

    /// Invalid filter configuration (particle count, initial spread).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed per-cycle input (time step, noise parameters, sensor range).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FilterError>;
