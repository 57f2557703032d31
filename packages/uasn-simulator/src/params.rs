//! params.rs — acoustic, simulation and algorithm constants
//!
//! A single immutable [`Params`] value is threaded through construction of
//! the environment, the solvers and the protocol nodes. There is no
//! process-wide configuration state; two environments with different
//! parameters can coexist in one process.

use serde::Deserialize;
use thiserror::Error;

/// Which end of an acoustic link the speed-of-sound field is sampled at
/// when computing a propagation delay. The physical medium varies along
/// the path; the simulation approximates it with a single sample, and the
/// choice of end is an ablation knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundSpeedAt {
    /// Sample at the receiving node's position (default).
    #[default]
    Receiver,
    /// Sample at the transmitting node's position.
    Sender,
}

/// Simulation parameters. All distances in meters, times in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Mean speed of sound (m/s). Also the speed nodes assume when they
    /// convert timing into ranges.
    pub snd_speed: f64,
    /// Standard deviation of the relative speed-of-sound field.
    pub snd_var: f64,
    /// Maximum range a transmission can reach (m).
    pub sim_range: f64,
    /// Probability of a transmission not being received (0-1).
    pub sim_loss: f64,
    /// Duration between two activations of the nodes (s).
    pub sim_tick: f64,
    /// Where the speed field is sampled for delay computation.
    pub sound_speed_at: SoundSpeedAt,

    /// Duration between two successive UPS beacon cycles (s).
    pub ups_period: f64,
    /// Number of beacon cycles per localization round.
    pub ups_number: u32,

    /// Maximum number of Gauss-Newton iterations.
    pub toa_itermax: u32,
    /// Step-norm threshold stopping the Gauss-Newton method (m).
    pub toa_threshold: f64,

    /// Length of an LST node's assigned time slot (s).
    pub lst_timeslot: f64,

    /// Length of an RLS node's assigned time slot (s).
    pub rls_timeslot: f64,
    /// Maximum error for a position estimate to be taken into account (m).
    pub rls_tolerance: f64,

    /// "K" factor scaling LSLS candidate waiting periods.
    pub lsls_waitfactor: f64,
    /// Secondary range for LSLS anchor selection (m).
    pub lsls_subrange: f64,
    /// Maximum error estimate to consider an LSLS node localized (m).
    pub lsls_tolerance: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            snd_speed: 1500.0,
            snd_var: 0.01,
            sim_range: 1000.0,
            sim_loss: 0.0,
            sim_tick: 0.1,
            sound_speed_at: SoundSpeedAt::Receiver,
            ups_period: 1.0,
            ups_number: 10,
            toa_itermax: 10,
            toa_threshold: 0.01,
            lst_timeslot: 2.0,
            rls_timeslot: 2.0,
            rls_tolerance: 5.0,
            lsls_waitfactor: 10.0,
            lsls_subrange: 500.0,
            lsls_tolerance: 5.0,
        }
    }
}

impl Params {
    /// Reject configurations the kernel cannot run on. Called once at
    /// environment construction; solver and protocol code relies on these
    /// invariants afterwards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.snd_speed > 0.0) {
            return Err(ConfigError::NonPositive("snd_speed", self.snd_speed));
        }
        if !(self.snd_var >= 0.0) {
            return Err(ConfigError::Negative("snd_var", self.snd_var));
        }
        if !(self.sim_range > 0.0) {
            return Err(ConfigError::NonPositive("sim_range", self.sim_range));
        }
        if !(0.0..=1.0).contains(&self.sim_loss) {
            return Err(ConfigError::OutOfUnitRange("sim_loss", self.sim_loss));
        }
        if !(self.sim_tick > 0.0) {
            return Err(ConfigError::NonPositive("sim_tick", self.sim_tick));
        }
        if !(self.ups_period > 0.0) {
            return Err(ConfigError::NonPositive("ups_period", self.ups_period));
        }
        if self.ups_number == 0 {
            return Err(ConfigError::ZeroCount("ups_number"));
        }
        if self.toa_itermax == 0 {
            return Err(ConfigError::ZeroCount("toa_itermax"));
        }
        if !(self.toa_threshold > 0.0) {
            return Err(ConfigError::NonPositive("toa_threshold", self.toa_threshold));
        }
        if !(self.lst_timeslot > 0.0) {
            return Err(ConfigError::NonPositive("lst_timeslot", self.lst_timeslot));
        }
        if !(self.rls_timeslot > 0.0) {
            return Err(ConfigError::NonPositive("rls_timeslot", self.rls_timeslot));
        }
        if !(self.lsls_waitfactor > 0.0) {
            return Err(ConfigError::NonPositive("lsls_waitfactor", self.lsls_waitfactor));
        }
        if !(self.lsls_subrange > 0.0) {
            return Err(ConfigError::NonPositive("lsls_subrange", self.lsls_subrange));
        }
        Ok(())
    }
}

/// Fatal configuration errors. Only construction fails on these; once an
/// environment exists, nothing in the kernel aborts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} must be positive, got {1}")]
    NonPositive(&'static str, f64),
    #[error("{0} must be non-negative, got {1}")]
    Negative(&'static str, f64),
    #[error("{0} must lie in [0, 1], got {1}")]
    OutOfUnitRange(&'static str, f64),
    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),
    #[error("simulation volume must have positive dimensions, got ({0}, {1}, {2})")]
    EmptyVolume(f64, f64, f64),
    #[error("node name {0:?} is already registered")]
    DuplicateName(String),
}
