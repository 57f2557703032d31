//! environment.rs — owns the nodes, the medium and the event queue
//!
//! `run` pops the earliest event, advances the clock, and dispatches:
//! a `Tick` polls every node in insertion order (broadcasting whatever
//! they emit, then scheduling the next tick, then relaxing the speed
//! field); a `Delivery` invokes the recipient's `receive`, whose reply, if
//! any, is broadcast from the recipient's position at the same instant.
//! All ordering guarantees flow from the `(time, seq)` queue.

use tracing::{debug, info};
use uasn_types::{Vec3, WireMessage};

use crate::event_queue::{EventKind, EventQueue};
use crate::node::Node;
use crate::params::{ConfigError, Params, SoundSpeedAt};
use crate::rng::SimRng;
use crate::sound_field::SoundField;

/// Options controlling a single `run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Log every transmission and delivery at info level instead of debug.
    pub verbose: bool,
    /// Seconds between per-node snapshot logs; 0 disables snapshots.
    pub snapshot_interval: f64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { verbose: false, snapshot_interval: 0.0 }
    }
}

pub struct Environment {
    params: Params,
    max_x: f64,
    max_y: f64,
    min_z: f64,
    nodes: Vec<Box<dyn Node>>,
    field: SoundField,
    queue: EventQueue,
    rng: SimRng,
    time: f64,
    trace: Option<Vec<(f64, String)>>,
}

impl Environment {
    /// Create an environment over the volume `0..max_x × 0..max_y ×
    /// -dim_z..0`, seeded with 0. `size` is `(max_x, max_y, dim_z)` with
    /// `dim_z` the positive depth of the volume.
    pub fn new(size: (f64, f64, f64), params: Params) -> Result<Self, ConfigError> {
        Self::with_seed(size, params, 0)
    }

    /// Like [`Environment::new`] with an explicit seed for the master
    /// random source. Two environments built with the same nodes, params
    /// and seed replay identically.
    pub fn with_seed(
        size: (f64, f64, f64),
        params: Params,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        let (max_x, max_y, dim_z) = size;
        if !(max_x > 0.0 && max_y > 0.0 && dim_z > 0.0) {
            return Err(ConfigError::EmptyVolume(max_x, max_y, dim_z));
        }
        let min_z = -dim_z;
        let mut rng = SimRng::seed_from_u64(seed);
        let field = SoundField::new(
            max_x,
            max_y,
            min_z,
            params.snd_speed,
            params.snd_var,
            params.sim_tick,
            &mut rng,
        );
        Ok(Self {
            params,
            max_x,
            max_y,
            min_z,
            nodes: Vec::new(),
            field,
            queue: EventQueue::new(),
            rng,
            time: 0.0,
            trace: None,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Fork a deterministic sub-source from the master random source.
    /// Scenario builders must call this in a fixed order at setup time.
    pub fn fork_rng(&mut self) -> SimRng {
        self.rng.fork()
    }

    /// Add a node. A node whose position lies outside the simulation
    /// volume is assigned uniform random in-bounds coordinates. Names must
    /// be unique.
    pub fn add_node(&mut self, mut node: Box<dyn Node>) -> Result<(), ConfigError> {
        if self.nodes.iter().any(|n| n.name() == node.name()) {
            return Err(ConfigError::DuplicateName(node.name().to_string()));
        }
        let p = node.position();
        let out_of_bounds = p.x < 0.0
            || p.x > self.max_x
            || p.y < 0.0
            || p.y > self.max_y
            || p.z < self.min_z
            || p.z > 0.0;
        if out_of_bounds {
            node.set_position(Vec3::new(
                self.rng.uniform(0.0, self.max_x),
                self.rng.uniform(0.0, self.max_y),
                self.rng.uniform(self.min_z, 0.0),
            ));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn nodes(&self) -> &[Box<dyn Node>] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&dyn Node> {
        self.nodes.iter().find(|n| n.name() == name).map(|n| n.as_ref())
    }

    /// Current simulated time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Local speed of sound at `position`, as the medium currently stands.
    pub fn speed_of_sound(&self, position: &Vec3) -> f64 {
        self.field.speed_at(position)
    }

    /// Record every broadcast as a `(time, wire line)` pair, for replay
    /// comparison. Must be enabled before `run`.
    pub fn enable_trace(&mut self) {
        self.trace = Some(Vec::new());
    }

    pub fn trace(&self) -> &[(f64, String)] {
        self.trace.as_deref().unwrap_or(&[])
    }

    /// Run the simulation until the earliest pending event lies beyond
    /// `horizon` seconds.
    pub fn run(&mut self, horizon: f64, options: RunOptions) {
        self.queue.push(self.time, EventKind::Tick);
        let mut next_snapshot = self.time;
        info!(horizon, nodes = self.nodes.len(), "simulation start");
        while let Some(t) = self.queue.peek_time() {
            if t > horizon {
                break;
            }
            let event = match self.queue.pop() {
                Some(e) => e,
                None => break,
            };
            debug_assert!(event.time >= self.time, "event queue went backwards");
            self.time = event.time;

            if options.snapshot_interval > 0.0 && self.time >= next_snapshot {
                self.snapshot();
                next_snapshot += options.snapshot_interval;
            }

            match event.kind {
                EventKind::Tick => {
                    for i in 0..self.nodes.len() {
                        if let Some(msg) = self.nodes[i].tick(self.time) {
                            let line = msg.to_wire();
                            let from = self.nodes[i].position();
                            self.broadcast(self.time, from, &line, options.verbose);
                        }
                    }
                    self.queue.push(self.time + self.params.sim_tick, EventKind::Tick);
                    self.field.relax(self.params.sim_tick, &mut self.rng);
                }
                EventKind::Delivery { recipient, line } => {
                    let Some(msg) = WireMessage::parse(&line) else {
                        continue;
                    };
                    if options.verbose {
                        info!("{:.3}    {} >> {}", self.time, line, self.nodes[recipient].name());
                    } else {
                        debug!("{:.3}    {} >> {}", self.time, line, self.nodes[recipient].name());
                    }
                    if let Some(reply) = self.nodes[recipient].receive(self.time, &msg) {
                        let reply_line = reply.to_wire();
                        let from = self.nodes[recipient].position();
                        self.broadcast(self.time, from, &reply_line, options.verbose);
                    }
                }
            }
        }
        info!(time = self.time, "simulation end");
    }

    /// Schedule `line` for reception by every node in range of `position`.
    /// Each in-range node is reached after the acoustic propagation delay
    /// for its distance, unless the transmission is lost (probability
    /// `sim_loss`, drawn per recipient at scheduling time). A node at zero
    /// distance is the sender itself and is excluded.
    pub fn broadcast(&mut self, time: f64, position: Vec3, line: &str, verbose: bool) {
        if verbose {
            info!("{:.3} >> {}", time, line);
        } else {
            debug!("{:.3} >> {}", time, line);
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.push((time, line.to_string()));
        }
        for i in 0..self.nodes.len() {
            let target = self.nodes[i].position();
            let d = target.dist(&position);
            if d <= 0.0 || d > self.params.sim_range {
                continue;
            }
            if self.rng.uniform(0.0, 1.0) < self.params.sim_loss {
                continue;
            }
            let sample_at = match self.params.sound_speed_at {
                SoundSpeedAt::Receiver => target,
                SoundSpeedAt::Sender => position,
            };
            let toa = time + d / self.field.speed_at(&sample_at);
            self.queue.push(toa, EventKind::Delivery { recipient: i, line: line.to_string() });
        }
    }

    fn snapshot(&self) {
        info!("t = {:.3}", self.time);
        for node in &self.nodes {
            let p = node.position();
            match node.estimate() {
                Some(e) => info!(
                    "  {} {} at ({:.1}, {:.1}, {:.1}) estimate ({:.1}, {:.1}, {:.1}) error {:.2}",
                    node.name(),
                    node.status(),
                    p.x,
                    p.y,
                    p.z,
                    e.x,
                    e.y,
                    e.z,
                    p.dist(&e)
                ),
                None => info!(
                    "  {} {} at ({:.1}, {:.1}, {:.1}) no estimate",
                    node.name(),
                    node.status(),
                    p.x,
                    p.y,
                    p.z
                ),
            }
        }
    }
}
