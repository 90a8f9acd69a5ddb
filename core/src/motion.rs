//! Motion model for the prediction stage.
//!
//! The vehicle follows a unicycle (constant velocity, constant yaw rate) model over each time
//! step. For a pose $(x, y, \theta)$, velocity $v$, yaw rate $\dot\psi$ and time step $t$:
//!
//! $$
//! \theta(+) = \theta(-) + \dot\psi t
//! $$
//!
//! $$
//! x(+) = x(-) + \frac{v}{\dot\psi} \left( \sin\theta(+) - \sin\theta(-) \right), \quad
//! y(+) = y(-) + \frac{v}{\dot\psi} \left( \cos\theta(-) - \cos\theta(+) \right)
//! $$
//!
//! When $|\dot\psi|$ is below [`YAW_RATE_EPSILON`] the closed form is replaced by straight-line
//! motion, $x(+) = x(-) + v t \cos\theta$ and $y(+) = y(-) + v t \sin\theta$, to avoid dividing
//! by a near-zero yaw rate. Process noise is applied by the filter after this deterministic
//! update.

use serde::{Deserialize, Serialize};

use crate::map::Pose;

/// Yaw rates with a magnitude below this value (rad/s) are treated as straight-line motion.
///
/// Moving this threshold changes trajectories for yaw rates near zero.
pub const YAW_RATE_EPSILON: f64 = 1e-4;

/// A single control command applied over one prediction step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// Forward velocity in m/s
    pub velocity: f64,
    /// Yaw rate in rad/s
    pub yaw_rate: f64,
}
impl ControlInput {
    pub fn new(velocity: f64, yaw_rate: f64) -> Self {
        ControlInput { velocity, yaw_rate }
    }
    pub fn is_straight(&self) -> bool {
        self.yaw_rate.abs() < YAW_RATE_EPSILON
    }
}

/// Deterministic pose update for one time step, without process noise.
pub fn propagate(pose: &Pose, control: &ControlInput, dt: f64) -> Pose {
    let velocity = control.velocity;
    let yaw_rate = control.yaw_rate;
    if control.is_straight() {
        Pose {
            x: pose.x + velocity * dt * pose.theta.cos(),
            y: pose.y + velocity * dt * pose.theta.sin(),
            theta: pose.theta,
        }
    } else {
        let theta = pose.theta + yaw_rate * dt;
        let radius = velocity / yaw_rate;
        Pose {
            x: pose.x + radius * (theta.sin() - pose.theta.sin()),
            y: pose.y + radius * (pose.theta.cos() - theta.cos()),
            theta,
        }
    }
}
