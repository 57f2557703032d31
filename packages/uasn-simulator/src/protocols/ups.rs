//! ups.rs — the cyclic TDOA beaconing protocol
//!
//! Four anchors beacon in a fixed priority order. The master (priority 0)
//! opens a cycle every `ups_period`; each relay anchor, on hearing its
//! predecessor, reconstructs the cycle origin from the known
//! predecessor distance and the delay the predecessor reported, then
//! beacons on its next tick carrying its own delay since that origin.
//! Sensors never transmit: they collect `(arrival, delay)` pairs per
//! cycle and 4-laterate once the beaconing goes quiet.

use tracing::info;
use uasn_types::{MessageBody, Vec3, WireMessage};

use crate::collector::PositionCollector;
use crate::node::Node;
use crate::params::Params;

/// Seconds of beacon silence after which a sensor attempts its fix.
const SENSOR_SETTLE: f64 = 5.0;

// ── Relay anchor ──────────────────────────────────────────────────────────────

/// Anchor that knows its position and beacons when its predecessor's
/// beacon arrives.
pub struct UpsAnchor {
    name: String,
    position: Vec3,
    params: Params,
    priority: u32,
    series: u32,
    distance_to_previous: Option<f64>,
    /// Reconstructed cycle origin; `Some` arms a beacon on the next tick.
    time_origin: Option<f64>,
}

impl UpsAnchor {
    /// `priority` runs 0..=3; the priority-0 anchor should be a
    /// [`UpsMaster`] instead.
    pub fn new(priority: u32, position: Vec3, params: Params) -> Self {
        Self {
            name: format!("anchor{priority}"),
            position,
            params,
            priority,
            series: 0,
            distance_to_previous: None,
            time_origin: None,
        }
    }
}

impl Node for UpsAnchor {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    fn tick(&mut self, time: f64) -> Option<WireMessage> {
        let origin = self.time_origin.take()?;
        Some(WireMessage::new(
            self.name.clone(),
            MessageBody::Beacon {
                series: self.series,
                level: self.priority,
                delay: time - origin,
                position: Some(self.position),
                err: None,
            },
        ))
    }

    fn receive(&mut self, time: f64, message: &WireMessage) -> Option<WireMessage> {
        if let MessageBody::Beacon { series, level, delay, position: Some(p), .. } = &message.body
        {
            if level + 1 == self.priority {
                self.series = *series;
                let d = *self
                    .distance_to_previous
                    .get_or_insert_with(|| self.position.dist(p));
                self.time_origin = Some(time - d / self.params.snd_speed - delay);
            }
        }
        None
    }

    fn status(&self) -> String {
        "ANCHOR".to_string()
    }
}

// ── Master anchor ─────────────────────────────────────────────────────────────

/// Priority-0 anchor initiating the beacon cycles.
pub struct UpsMaster {
    anchor: UpsAnchor,
    next_beacon_time: f64,
    cycles_sent: u32,
}

impl UpsMaster {
    pub fn new(position: Vec3, params: Params) -> Self {
        Self { anchor: UpsAnchor::new(0, position, params), next_beacon_time: 0.0, cycles_sent: 0 }
    }
}

impl Node for UpsMaster {
    fn name(&self) -> &str {
        self.anchor.name()
    }

    fn position(&self) -> Vec3 {
        self.anchor.position()
    }

    fn set_position(&mut self, position: Vec3) {
        self.anchor.set_position(position);
    }

    fn tick(&mut self, time: f64) -> Option<WireMessage> {
        if time >= self.next_beacon_time && self.cycles_sent < self.anchor.params.ups_number {
            // the cycle origin is the master's own transmission time
            self.anchor.series = self.cycles_sent;
            self.anchor.time_origin = Some(time);
            self.next_beacon_time += self.anchor.params.ups_period;
            self.cycles_sent += 1;
            return self.anchor.tick(time);
        }
        None
    }

    fn receive(&mut self, _time: f64, _message: &WireMessage) -> Option<WireMessage> {
        None
    }

    fn status(&self) -> String {
        "MASTER".to_string()
    }
}

// ── Sensor ────────────────────────────────────────────────────────────────────

/// Node that does not know its position and 4-laterates it from the
/// beacons it overhears.
pub struct UpsSensor {
    name: String,
    position: Vec3,
    params: Params,
    collector: Option<PositionCollector>,
    deadline: Option<f64>,
    estimate: Option<Vec3>,
}

impl UpsSensor {
    /// The default position is out of bounds, so the environment assigns
    /// random coordinates on registration.
    pub fn new(id: u32, params: Params) -> Self {
        Self {
            name: format!("sensor{id}"),
            position: Vec3::new(-1.0, -1.0, 0.0),
            params,
            collector: None,
            deadline: None,
            estimate: None,
        }
    }
}

impl Node for UpsSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    fn tick(&mut self, time: f64) -> Option<WireMessage> {
        if self.deadline.is_some_and(|d| time >= d) {
            self.deadline = None;
            if let Some(collector) = &self.collector {
                match collector.position(false) {
                    Ok(fix) => {
                        info!(
                            "{} found position ({:.3}, {:.3}, {:.3}), error {:.3}",
                            self.name,
                            fix.position.x,
                            fix.position.y,
                            fix.position.z,
                            self.position.dist(&fix.position)
                        );
                        self.estimate = Some(fix.position);
                    }
                    Err(e) => {
                        info!("{} could not find its position: {}", self.name, e);
                    }
                }
            }
        }
        None
    }

    fn receive(&mut self, time: f64, message: &WireMessage) -> Option<WireMessage> {
        if let MessageBody::Beacon { series, level, delay, position: Some(p), .. } = &message.body
        {
            let collector =
                self.collector.get_or_insert_with(|| PositionCollector::ups(&self.params));
            // beacons slot by priority, so arrival order is immaterial
            collector.add_anchor_at(*level as usize, message.sender.clone(), *p);
            collector.add_sample(&message.sender, *series as usize, (time, *delay));
            self.deadline = Some(time + SENSOR_SETTLE);
        }
        None
    }

    fn estimate(&self) -> Option<Vec3> {
        self.estimate
    }

    fn status(&self) -> String {
        if self.estimate.is_some() { "LOCALIZED" } else { "UNLOCALIZED" }.to_string()
    }
}
