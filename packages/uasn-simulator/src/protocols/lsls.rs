//! lsls.rs — large-scale localization scheme: a spanning tree of anchors
//!
//! One seeded master announces itself as a level-0 anchor and beacons.
//! Localized nodes within the sub-range of a lower-level anchor become
//! candidates for the next level, racing distance-derived timers; the
//! winner confirms, announces, and beacons chained on its parent. Anchor
//! announcements build up 4-chains at unlocalized listeners, which lock
//! the first complete chain, collect its beacon series and 4-laterate at
//! the end of the round. Freshly localized nodes immediately compete to
//! anchor the next region, so localization sweeps outward as a wave.

use tracing::{debug, info};
use uasn_types::{MessageBody, Vec3, WireMessage};

use crate::collector::PositionCollector;
use crate::node::Node;
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LslsState {
    /// No estimate; collecting anchor announcements into chains.
    Unlocalized,
    /// Locked onto a complete chain; collecting its beacons.
    Listening,
    /// Has an estimate; eligible to become a candidate.
    Localized,
    /// Racing a timer to volunteer as the next anchor.
    Candidate,
    /// Won the local race; waiting out the confirmation window.
    Confirming,
    /// Beaconing as part of the current chain.
    Anchor,
}

pub struct LslsNode {
    name: String,
    position: Vec3,
    params: Params,
    state: LslsState,
    level: u32,
    /// State-dependent deadline; also the beacon time origin in the
    /// anchor state.
    timer: f64,
    beacon_series: u32,
    collector: Option<PositionCollector>,
    /// Growing anchor chains (unlocalized state): each entry is the
    /// (name, position) list from level 0 upward.
    chains: Vec<Vec<(String, Vec3)>>,
    /// The locked chain (listening state).
    chain: Vec<(String, Vec3)>,
    /// Parent anchor and distance to it (candidate through anchor states).
    parent: Option<(String, f64)>,
    estimate: Option<Vec3>,
}

impl LslsNode {
    pub fn new(id: u32, position: Vec3, localized: bool, params: Params) -> Self {
        Self {
            name: format!("node{id}"),
            position,
            params,
            state: if localized { LslsState::Localized } else { LslsState::Unlocalized },
            level: if localized { 1 } else { 0 },
            timer: f64::INFINITY,
            beacon_series: 0,
            collector: None,
            chains: Vec::new(),
            chain: Vec::new(),
            parent: None,
            estimate: if localized { Some(position) } else { None },
        }
    }

    /// Seed the spanning tree: call on exactly one localized node before
    /// the run. The node skips the candidate race and anchors level 0.
    pub fn make_master(&mut self) {
        self.state = LslsState::Confirming;
        self.level = 0;
        self.parent = Some(("master".to_string(), 0.0));
        self.timer = -1.0;
    }

    /// Max transmission range over the speed of sound; the unit for all
    /// staging delays.
    fn standard_timer(&self) -> f64 {
        self.params.sim_range / self.params.snd_speed
    }

    /// Candidate race delay: nodes nearer the sub-range boundary of the
    /// parent fire earlier, favoring widely spread anchors.
    fn candidate_timer(&self, d: f64) -> f64 {
        self.params.lsls_waitfactor * (self.params.sim_range - 2.0 * d) / self.params.snd_speed
    }

    fn handle_anchor(&mut self, time: f64, sender: &str, level: u32, position: Vec3, parent: &str) {
        match self.state {
            LslsState::Unlocalized => {
                if level == 0 {
                    self.chains.push(vec![(sender.to_string(), position)]);
                    return;
                }
                let mut locked: Option<Vec<(String, Vec3)>> = None;
                for chain in &mut self.chains {
                    if chain.len() == level as usize && chain.last().is_some_and(|(n, _)| n == parent)
                    {
                        chain.push((sender.to_string(), position));
                    }
                    if chain.len() == 4 {
                        locked = Some(chain.clone());
                    }
                }
                if let Some(chain) = locked {
                    let mut collector = PositionCollector::ups(&self.params);
                    for (level, (name, p)) in chain.iter().enumerate() {
                        collector.add_anchor_at(level, name.clone(), *p);
                    }
                    self.collector = Some(collector);
                    self.chain = chain;
                    self.chains.clear();
                    self.state = LslsState::Listening;
                }
            }
            LslsState::Localized => {
                let Some(estimate) = self.estimate else { return };
                let d = estimate.dist(&position);
                if self.level == level + 1 && d <= self.params.lsls_subrange {
                    // an anchor one level below is recruiting: volunteer
                    self.state = LslsState::Candidate;
                    self.parent = Some((sender.to_string(), d));
                    self.timer = time + self.candidate_timer(d);
                }
            }
            LslsState::Candidate => {
                let Some(estimate) = self.estimate else { return };
                let Some((current_parent, _)) = self.parent.clone() else { return };
                let d = estimate.dist(&position);
                if level == self.level + 1 && d <= self.params.lsls_subrange {
                    // a deeper anchor appeared; switch if it fires earlier
                    let t = time + self.candidate_timer(d);
                    if t < self.timer {
                        self.parent = Some((sender.to_string(), d));
                        self.timer = t;
                    }
                } else if level == self.level
                    && parent == current_parent
                    && d <= self.params.lsls_subrange
                {
                    // a concurrent candidate won this level: move up, or
                    // stand down when the chain is complete
                    if self.level == 3 {
                        self.state = LslsState::Localized;
                        self.level = 1;
                        self.timer = f64::INFINITY;
                    } else {
                        self.level += 1;
                        self.parent = Some((sender.to_string(), d));
                        self.timer = time + self.candidate_timer(d);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_confirm(&mut self, level: u32, factor: f64, parent: &str) {
        let Some((current_parent, d)) = self.parent.clone() else { return };
        let concurrent = level == self.level && parent == current_parent;
        match self.state {
            LslsState::Candidate => {
                if concurrent {
                    // someone else confirmed first: prepare for the next
                    // round at the following level
                    self.state = LslsState::Localized;
                    self.level = (self.level % 3) + 1;
                    self.timer = f64::INFINITY;
                }
            }
            LslsState::Confirming => {
                if concurrent && self.candidate_timer(d) > factor {
                    self.state = LslsState::Localized;
                    self.level = (self.level % 3) + 1;
                    self.timer = f64::INFINITY;
                }
            }
            _ => {}
        }
    }

    fn handle_beacon(&mut self, sender: &str, series: u32, level: u32, delay: f64, time: f64) {
        match self.state {
            LslsState::Unlocalized => {
                // a beacon round is in progress; announcements collected
                // so far belong to the previous round
                self.chains.clear();
            }
            LslsState::Listening => {
                if self.chain.get(level as usize).is_some_and(|(n, _)| n == sender) {
                    if let Some(collector) = &mut self.collector {
                        collector.add_sample(sender, series as usize, (time, delay));
                    }
                    if level == 3 && series == self.params.ups_number - 1 {
                        let Some(collector) = self.collector.take() else { return };
                        match collector.position(false) {
                            Ok(fix) => {
                                info!(
                                    "{} localized at ({:.3}, {:.3}, {:.3}), error {:.3}",
                                    self.name,
                                    fix.position.x,
                                    fix.position.y,
                                    fix.position.z,
                                    self.position.dist(&fix.position)
                                );
                                self.estimate = Some(fix.position);
                                self.state = LslsState::Candidate;
                                self.level = 0;
                                // race from the center of the anchor set
                                let center = self
                                    .chain
                                    .iter()
                                    .fold(Vec3::zero(), |acc, (_, p)| acc.add(p))
                                    .scale(0.25);
                                let d = fix.position.dist(&center);
                                self.parent = Some(("master".to_string(), d));
                                self.timer = time + self.candidate_timer(d);
                            }
                            Err(e) => {
                                debug!("{} chain round failed: {}", self.name, e);
                                self.state = LslsState::Unlocalized;
                                self.chains.clear();
                            }
                        }
                        self.chain.clear();
                    }
                }
            }
            LslsState::Localized => {
                // a new beaconing round resets the level rotation
                self.level = 1;
            }
            LslsState::Anchor => {
                let Some((parent, d)) = self.parent.clone() else { return };
                if parent == sender && self.level == level + 1 {
                    // reconstruct the parent's beacon origin; beacon on
                    // the next tick against the same origin
                    self.timer = time - d / self.params.snd_speed - delay;
                    self.beacon_series = series;
                }
            }
            _ => {}
        }
    }
}

impl Node for LslsNode {
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
        if time <= self.timer {
            return None;
        }
        match self.state {
            LslsState::Candidate => {
                self.state = LslsState::Confirming;
                self.timer = time + 2.0 * self.standard_timer();
                let (parent, d) = self.parent.clone()?;
                Some(WireMessage::new(
                    self.name.clone(),
                    MessageBody::Confirm {
                        level: self.level,
                        factor: self.candidate_timer(d),
                        parent,
                    },
                ))
            }
            LslsState::Confirming => {
                self.state = LslsState::Anchor;
                self.beacon_series = 0;
                let (parent, _) = self.parent.clone()?;
                let position = self.estimate?;
                // level 0 schedules its first beacon after the tree has
                // settled; deeper levels wait for their parent's beacon
                self.timer = if self.level > 0 {
                    f64::INFINITY
                } else {
                    time + (3.0 * self.params.lsls_waitfactor + 10.0) * self.standard_timer()
                };
                Some(WireMessage::new(
                    self.name.clone(),
                    MessageBody::Anchor { level: self.level, position, parent },
                ))
            }
            LslsState::Anchor => {
                let message = WireMessage::new(
                    self.name.clone(),
                    MessageBody::Beacon {
                        series: self.beacon_series,
                        level: self.level,
                        delay: time - self.timer,
                        position: None,
                        err: None,
                    },
                );
                if self.beacon_series == self.params.ups_number - 1 {
                    // final beacon of the round: step back into the pool
                    self.state = LslsState::Localized;
                    self.level = 1;
                    self.timer = f64::INFINITY;
                } else if self.level == 0 {
                    self.beacon_series += 1;
                    self.timer += self.params.ups_period;
                } else {
                    self.timer = f64::INFINITY;
                }
                Some(message)
            }
            _ => None,
        }
    }

    fn receive(&mut self, time: f64, message: &WireMessage) -> Option<WireMessage> {
        match &message.body {
            MessageBody::Anchor { level, position, parent } => {
                self.handle_anchor(time, &message.sender, *level, *position, parent);
            }
            MessageBody::Confirm { level, factor, parent } => {
                self.handle_confirm(*level, *factor, parent);
            }
            MessageBody::Beacon { series, level, delay, .. } => {
                self.handle_beacon(&message.sender, *series, *level, *delay, time);
            }
            _ => {}
        }
        None
    }

    fn estimate(&self) -> Option<Vec3> {
        self.estimate
    }

    fn status(&self) -> String {
        match self.state {
            LslsState::Unlocalized => "UNLOCALIZED",
            LslsState::Listening => "LISTENING",
            LslsState::Localized => "LOCALIZED",
            LslsState::Candidate => "CANDIDATE",
            LslsState::Confirming => "CONFIRMING",
            LslsState::Anchor => "ANCHOR",
        }
        .to_string()
    }
}
