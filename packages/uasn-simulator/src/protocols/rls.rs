//! rls.rs — the reactive localization scheme
//!
//! Nodes discover localized neighbors (ping/ack and position
//! announcements), rate every quadruple they could recruit as anchors by
//! tetrahedron volume over accumulated error, and `request` the best one
//! in their own time slot. Recruited neighbors run a UPS-style chained
//! beacon round: the level-0 anchor re-arms on the level-3 beacon, each
//! other level re-arms on its predecessor, and everyone stops after
//! `ups_number` cycles. Listeners feed the beacons into a TDOA collector
//! and solve when the final beacon of the round arrives. Every fix is
//! kept with an error figure; the lowest-error fix is the one a node
//! answers and announces with.

use std::collections::BTreeMap;

use tracing::{debug, info};
use uasn_types::{MessageBody, Vec3, WireMessage};

use crate::collector::PositionCollector;
use crate::node::Node;
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RlsState {
    /// Unlocalized, passively listening.
    UnlocalizedPassive,
    /// Unlocalized with candidate anchor sets; will request in slot.
    UnlocalizedActive,
    /// Localized, announcement pending.
    LocalizedNew,
    /// Localized and announced; may be recruited as an anchor.
    LocalizedReady,
    /// Recruited: beaconing in a chained round.
    Anchor,
}

/// A rated anchor quadruple, ordered best-first (highest score, then
/// lexicographically smallest names for determinism).
#[derive(Debug, Clone, PartialEq)]
struct ScoredQuad {
    score: f64,
    names: [String; 4],
}

impl Eq for ScoredQuad {}

impl Ord for ScoredQuad {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.names.cmp(&self.names))
    }
}

impl PartialOrd for ScoredQuad {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct RlsNode {
    name: String,
    position: Vec3,
    params: Params,
    slots: u32,
    state: RlsState,
    slot_timer: f64,
    /// Known neighbor estimates: name → (position, error).
    neighbors: BTreeMap<String, (Vec3, f64)>,
    /// Do not transmit requests/announcements before this time.
    listening_timer: f64,
    collector: Option<PositionCollector>,
    anchor_errors: [f64; 4],
    best_anchors: std::collections::BinaryHeap<ScoredQuad>,
    /// Accumulated fixes: (position, error).
    estimates: Vec<(Vec3, f64)>,
    /// A fresh fix should be piggy-backed on the next beacon.
    update: bool,
    // anchor-mode state
    anchor_level: u32,
    anchor_master: String,
    master_delay: f64,
    beacon_time: Option<f64>,
    beacon_series: u32,
}

impl RlsNode {
    pub fn new(id: u32, slots: u32, position: Vec3, localized: bool, params: Params) -> Self {
        Self {
            name: format!("node-{id}"),
            position,
            params,
            slots,
            state: if localized { RlsState::LocalizedNew } else { RlsState::UnlocalizedPassive },
            slot_timer: id as f64,
            neighbors: BTreeMap::new(),
            listening_timer: 0.0,
            collector: None,
            anchor_errors: [0.0; 4],
            best_anchors: std::collections::BinaryHeap::new(),
            estimates: if localized { vec![(position, 0.0)] } else { Vec::new() },
            update: false,
            anchor_level: 0,
            anchor_master: String::new(),
            master_delay: 0.0,
            beacon_time: None,
            beacon_series: 0,
        }
    }

    /// Best (lowest-error) accumulated fix.
    fn best_estimate(&self) -> Option<(Vec3, f64)> {
        self.estimates
            .iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .copied()
    }

    /// Rate all quadruples led by a newly announced neighbor and queue the
    /// viable ones. High neighbor errors only depress the score; the sole
    /// hard discard is the pairwise range check in `rate_anchors`.
    fn find_anchors(&mut self, new_node: &str, position: Vec3, error: f64) {
        let known: Vec<(&String, &(Vec3, f64))> = self
            .neighbors
            .iter()
            .filter(|(name, _)| name.as_str() != new_node)
            .collect();
        for i in 0..known.len() {
            for j in (i + 1)..known.len() {
                for k in (j + 1)..known.len() {
                    let (n1, (p1, e1)) = known[i];
                    let (n2, (p2, e2)) = known[j];
                    let (n3, (p3, e3)) = known[k];
                    let score = self.rate_anchors(
                        [&position, p1, p2, p3],
                        [error, *e1, *e2, *e3],
                    );
                    if score > 0.0 {
                        self.best_anchors.push(ScoredQuad {
                            score,
                            names: [
                                new_node.to_string(),
                                n1.clone(),
                                n2.clone(),
                                n3.clone(),
                            ],
                        });
                    }
                }
            }
        }
    }

    /// Tetrahedron volume over accumulated error; zero when any pair is
    /// out of acoustic range of each other.
    fn rate_anchors(&self, positions: [&Vec3; 4], errors: [f64; 4]) -> f64 {
        for i in 0..4 {
            for j in (i + 1)..4 {
                if positions[i].dist(positions[j]) > self.params.sim_range {
                    return 0.0;
                }
            }
        }
        let a = positions[1].sub(positions[0]);
        let b = positions[2].sub(positions[0]);
        let c = positions[3].sub(positions[0]);
        let shape = a.dot(&b.cross(&c)).abs();
        let error: f64 = errors.iter().sum();
        shape / (1.0 + error)
    }

    fn register_neighbor(&mut self, sender: &str, position: Vec3, error: f64, time: f64) {
        if matches!(self.state, RlsState::UnlocalizedPassive | RlsState::UnlocalizedActive) {
            self.find_anchors(sender, position, error);
        }
        self.neighbors.insert(sender.to_string(), (position, error));
        // back off to passive when the announcement lands close to our
        // own slot: the new information may yield a better request
        if self.state == RlsState::UnlocalizedActive
            && time / self.params.rls_timeslot > self.slot_timer - self.slots as f64 / 2.0
        {
            self.state = RlsState::UnlocalizedPassive;
        }
    }

    fn handle_beacon(
        &mut self,
        sender: &str,
        series: u32,
        level: u32,
        delay: f64,
        time: f64,
    ) -> Option<WireMessage> {
        if self.state == RlsState::Anchor {
            self.listening_timer = time + 4.0 * self.params.rls_timeslot;
            if sender == self.anchor_master {
                if self.anchor_level == 0 {
                    // the chain closed: the level-3 beacon re-arms the
                    // level-0 anchor for the next cycle
                    self.beacon_series += 1;
                    self.beacon_time = Some(time);
                } else {
                    self.beacon_series = series;
                    self.beacon_time = Some(time - self.master_delay - delay);
                }
            }
            return None;
        }

        if self.state == RlsState::UnlocalizedActive {
            self.state = RlsState::UnlocalizedPassive;
        }
        self.listening_timer = time + 2.0 * self.params.rls_timeslot;

        if series == 1 && level == 0 {
            self.collector = Some(PositionCollector::ups(&self.params));
            self.anchor_errors = [0.0; 4];
        } else if self.collector.is_none() {
            return None;
        }
        if series == 1 {
            let Some(&(position, error)) = self.neighbors.get(sender) else {
                // an anchor we never heard announce; this round is unusable
                self.collector = None;
                return None;
            };
            if let Some(collector) = &mut self.collector {
                collector.add_anchor_at(level as usize, sender.to_string(), position);
            }
            self.anchor_errors[level.min(3) as usize] = error;
        } else if self.collector.as_ref().is_some_and(|c| c.anchor_count() < 4) {
            // joined mid-round: not enough registered anchors to use it
            self.collector = None;
            return None;
        }
        if let Some(collector) = &mut self.collector {
            collector.add_sample(sender, series as usize, (time, delay));
        }
        if series == self.params.ups_number && level == 3 {
            let collector = self.collector.take()?;
            match collector.position(false) {
                Ok(fix) => {
                    let error = 1.0 + self.anchor_errors.iter().cloned().fold(0.0, f64::max);
                    info!(
                        "{} fixed ({:.3}, {:.3}, {:.3}) error figure {:.2}, true error {:.3}",
                        self.name,
                        fix.position.x,
                        fix.position.y,
                        fix.position.z,
                        error,
                        self.position.dist(&fix.position)
                    );
                    self.estimates.push((fix.position, error));
                    match self.state {
                        RlsState::UnlocalizedPassive | RlsState::UnlocalizedActive => {
                            self.state = RlsState::LocalizedNew;
                        }
                        RlsState::LocalizedReady => self.update = true,
                        _ => {}
                    }
                }
                Err(e) => debug!("{} beacon round failed: {}", self.name, e),
            }
        }
        None
    }
}

impl Node for RlsNode {
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
        // armed anchors beacon regardless of slots
        if self.state == RlsState::Anchor {
            if let Some(origin) = self.beacon_time.take() {
                if self.beacon_series == self.params.ups_number {
                    self.state = RlsState::LocalizedReady;
                }
                let (position, err) = if self.update {
                    self.update = false;
                    match self.best_estimate() {
                        Some((p, e)) => (Some(p), Some(e)),
                        None => (None, None),
                    }
                } else {
                    (None, None)
                };
                return Some(WireMessage::new(
                    self.name.clone(),
                    MessageBody::Beacon {
                        series: self.beacon_series,
                        level: self.anchor_level,
                        delay: time - origin,
                        position,
                        err,
                    },
                ));
            }
        }

        if time / self.params.rls_timeslot > self.slot_timer {
            self.slot_timer += self.slots as f64;

            if self.state == RlsState::UnlocalizedPassive && !self.best_anchors.is_empty() {
                self.state = RlsState::UnlocalizedActive;
                return None;
            }

            if time > self.listening_timer {
                match self.state {
                    RlsState::UnlocalizedPassive => {
                        // nothing to request and nothing heard: probe for
                        // localized neighbors
                        if self.neighbors.is_empty() {
                            return Some(WireMessage::new(self.name.clone(), MessageBody::Ping));
                        }
                    }
                    RlsState::UnlocalizedActive => {
                        let quad = self.best_anchors.pop()?;
                        if self.best_anchors.is_empty() {
                            self.state = RlsState::UnlocalizedPassive;
                        }
                        debug!("{} requesting anchors, score {:.1}", self.name, quad.score);
                        return Some(WireMessage::new(
                            self.name.clone(),
                            MessageBody::Request { anchors: quad.names },
                        ));
                    }
                    RlsState::LocalizedNew => {
                        self.state = RlsState::LocalizedReady;
                        let (p, e) = self.best_estimate()?;
                        return Some(WireMessage::new(
                            self.name.clone(),
                            MessageBody::Position { position: p, err: Some(e) },
                        ));
                    }
                    RlsState::Anchor => {
                        // no beacon heard for a long time: the round died
                        self.state = RlsState::LocalizedReady;
                    }
                    _ => {}
                }
            }
        }
        None
    }

    fn receive(&mut self, time: f64, message: &WireMessage) -> Option<WireMessage> {
        let sender = message.sender.clone();
        match &message.body {
            MessageBody::Position { position, err } => {
                self.register_neighbor(&sender, *position, err.unwrap_or(0.0), time);
                None
            }
            MessageBody::Ack { position, err } => {
                self.register_neighbor(&sender, *position, *err, time);
                None
            }
            MessageBody::Ping => {
                let (p, e) = self.best_estimate()?;
                Some(WireMessage::new(
                    self.name.clone(),
                    MessageBody::Ack { position: p, err: e },
                ))
            }
            MessageBody::Request { anchors } => {
                if self.state != RlsState::LocalizedReady {
                    return None;
                }
                let index = anchors.iter().position(|n| *n == self.name)?;
                let master = anchors[(index + 3) % 4].clone();
                let Some(&(master_pos, _)) = self.neighbors.get(&master) else {
                    return None;
                };
                self.state = RlsState::Anchor;
                self.anchor_level = index as u32;
                self.anchor_master = master;
                self.master_delay = self.position.dist(&master_pos) / self.params.snd_speed;
                if index == 0 {
                    self.beacon_time = Some(time);
                    self.beacon_series = 1;
                }
                None
            }
            MessageBody::Beacon { series, level, delay, position, err } => {
                if let Some(p) = position {
                    self.neighbors
                        .insert(sender.clone(), (*p, err.unwrap_or(0.0)));
                }
                self.handle_beacon(&sender, *series, *level, *delay, time)
            }
            _ => None,
        }
    }

    fn estimate(&self) -> Option<Vec3> {
        self.best_estimate().map(|(p, _)| p)
    }

    fn status(&self) -> String {
        match self.state {
            RlsState::UnlocalizedPassive => "UP",
            RlsState::UnlocalizedActive => "UA",
            RlsState::LocalizedNew => "LN",
            RlsState::LocalizedReady => "LR",
            RlsState::Anchor => "A",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_node(params: &Params) -> RlsNode {
        let mut node = RlsNode::new(0, 10, Vec3::new(500.0, 500.0, -100.0), true, params.clone());
        node.state = RlsState::LocalizedReady;
        node
    }

    #[test]
    fn localized_node_acks_pings() {
        let params = Params::default();
        let mut node = ready_node(&params);
        let ack = node
            .receive(1.0, &WireMessage::new("node-9", MessageBody::Ping))
            .expect("localized node must ack");
        match ack.body {
            MessageBody::Ack { position, err } => {
                assert_eq!(position, Vec3::new(500.0, 500.0, -100.0));
                assert_eq!(err, 0.0);
            }
            _ => panic!("unexpected message"),
        }
    }

    #[test]
    fn unlocalized_node_never_acks() {
        let params = Params::default();
        let mut node = RlsNode::new(1, 10, Vec3::new(0.0, 0.0, 0.0), false, params);
        assert!(node.receive(1.0, &WireMessage::new("node-9", MessageBody::Ping)).is_none());
    }

    #[test]
    fn anchor_rating_prefers_volume_and_penalizes_error() {
        let params = Params::default();
        let node = RlsNode::new(0, 10, Vec3::zero(), false, params);
        let flat = node.rate_anchors(
            [
                &Vec3::new(0.0, 0.0, 0.0),
                &Vec3::new(500.0, 0.0, 0.0),
                &Vec3::new(0.0, 500.0, 0.0),
                &Vec3::new(500.0, 500.0, 0.0),
            ],
            [0.0; 4],
        );
        assert_eq!(flat, 0.0);
        let volume = node.rate_anchors(
            [
                &Vec3::new(0.0, 0.0, 0.0),
                &Vec3::new(500.0, 0.0, 0.0),
                &Vec3::new(0.0, 500.0, 0.0),
                &Vec3::new(0.0, 0.0, -500.0),
            ],
            [0.0; 4],
        );
        assert!(volume > 0.0);
        let noisy = node.rate_anchors(
            [
                &Vec3::new(0.0, 0.0, 0.0),
                &Vec3::new(500.0, 0.0, 0.0),
                &Vec3::new(0.0, 500.0, 0.0),
                &Vec3::new(0.0, 0.0, -500.0),
            ],
            [2.0, 2.0, 0.0, 0.0],
        );
        assert!(noisy < volume);
        let spread = node.rate_anchors(
            [
                &Vec3::new(0.0, 0.0, 0.0),
                &Vec3::new(2000.0, 0.0, 0.0),
                &Vec3::new(0.0, 500.0, 0.0),
                &Vec3::new(0.0, 0.0, -500.0),
            ],
            [0.0; 4],
        );
        assert_eq!(spread, 0.0);
    }

    #[test]
    fn request_recruits_named_neighbors_only() {
        let params = Params::default();
        let mut node = ready_node(&params);
        // master (previous in the ring) must be a known neighbor
        node.register_neighbor("node-3", Vec3::new(400.0, 500.0, -100.0), 0.0, 0.0);
        let request = WireMessage::new(
            "node-9",
            MessageBody::Request {
                anchors: [
                    "node-3".to_string(),
                    "node-0".to_string(),
                    "node-5".to_string(),
                    "node-6".to_string(),
                ],
            },
        );
        node.receive(10.0, &request);
        assert_eq!(node.state, RlsState::Anchor);
        assert_eq!(node.anchor_level, 1);
        assert_eq!(node.anchor_master, "node-3");

        // a request that does not name this node leaves it alone
        let mut other = ready_node(&params);
        let request = WireMessage::new(
            "node-9",
            MessageBody::Request {
                anchors: [
                    "node-5".to_string(),
                    "node-6".to_string(),
                    "node-7".to_string(),
                    "node-8".to_string(),
                ],
            },
        );
        other.receive(10.0, &request);
        assert_eq!(other.state, RlsState::LocalizedReady);
    }

    #[test]
    fn level_zero_anchor_starts_beaconing_immediately() {
        let params = Params::default();
        let mut node = ready_node(&params);
        node.register_neighbor("node-8", Vec3::new(400.0, 500.0, -100.0), 0.0, 0.0);
        let request = WireMessage::new(
            "node-9",
            MessageBody::Request {
                anchors: [
                    "node-0".to_string(),
                    "node-5".to_string(),
                    "node-6".to_string(),
                    "node-8".to_string(),
                ],
            },
        );
        node.receive(10.0, &request);
        assert_eq!(node.state, RlsState::Anchor);
        assert_eq!(node.anchor_level, 0);
        // master of level 0 is the last name in the ring
        assert_eq!(node.anchor_master, "node-8");
        let beacon = node.tick(10.1).expect("level-0 anchor beacons at once");
        match beacon.body {
            MessageBody::Beacon { series, level, delay, .. } => {
                assert_eq!(series, 1);
                assert_eq!(level, 0);
                assert!((delay - 0.1).abs() < 1e-12);
            }
            _ => panic!("unexpected message"),
        }
    }

    #[test]
    fn listener_solves_after_the_final_beacon() {
        let mut params = Params::default();
        params.ups_number = 3;
        let truth = Vec3::new(250.0, 250.0, -100.0);
        let anchors = [
            ("node-1", Vec3::new(0.0, 0.0, 0.0)),
            ("node-2", Vec3::new(0.0, 500.0, 0.0)),
            ("node-3", Vec3::new(500.0, 250.0, 0.0)),
            ("node-4", Vec3::new(500.0, 250.0, -200.0)),
        ];
        let mut node = RlsNode::new(0, 10, truth, false, params.clone());
        for (name, p) in &anchors {
            node.register_neighbor(
                name,
                *p,
                0.5,
                0.0,
            );
        }
        // three beacon cycles with exact straight-line timing
        for series in 1..=params.ups_number {
            let origin = series as f64;
            for (level, (name, p)) in anchors.iter().enumerate() {
                let delay = 0.2 * level as f64;
                let arrival = origin + delay + truth.dist(p) / params.snd_speed;
                let beacon = WireMessage::new(
                    *name,
                    MessageBody::Beacon {
                        series,
                        level: level as u32,
                        delay,
                        position: None,
                        err: None,
                    },
                );
                node.receive(arrival, &beacon);
            }
        }
        let estimate = node.estimate().expect("listener must fix after the round");
        assert!(estimate.dist(&truth) < 1e-6);
        assert_eq!(node.state, RlsState::LocalizedNew);
        // the error figure folds in the worst anchor error
        assert_eq!(node.estimates[0].1, 1.5);
    }
}
