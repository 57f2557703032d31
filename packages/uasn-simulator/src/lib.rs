//! # uasn-simulator
//!
//! Discrete-event simulation of self-localizing underwater acoustic
//! sensor networks.
//!
//! The crate has three layers:
//! - the **kernel**: [`environment::Environment`] drives a `(time, seq)`
//!   event queue, delivering broadcasts to in-range nodes after the
//!   acoustic propagation delay through a drifting speed-of-sound field;
//! - the **numerics**: [`solver::ups`] (closed-form TDOA 4-lateration)
//!   and [`solver::toa`] (Gauss-Newton trilateration), fed by the
//!   [`collector::PositionCollector`] substrate;
//! - the **protocols**: UPS, LST, RLS and LSLS as [`node::Node`] state
//!   machines exchanging whitespace-token messages.
//!
//! Host programs wire up scenarios directly against the kernel; the
//! `uasn-sim` binary runs the canned grids from [`scenarios`].
//!
//! Everything is single-threaded and deterministic: the only entropy
//! source is the seed handed to [`environment::Environment::with_seed`].

pub mod collector;
pub mod environment;
pub mod event_queue;
pub mod node;
pub mod params;
pub mod protocols;
pub mod rng;
pub mod scenarios;
pub mod solver;
pub mod sound_field;

pub use collector::{CalculatorKind, CollectError, Fix, PositionCollector};
pub use environment::{Environment, RunOptions};
pub use node::Node;
pub use params::{ConfigError, Params, SoundSpeedAt};
pub use solver::{toa, ups, ToaError, ToaFix, UpsError};
pub use uasn_types::{MessageBody, Vec3, WireMessage};
