//! lst.rs — large-scale ToA: slotted call-and-reply localization
//!
//! Every node owns a recurring time slot (slot index = node id). Localized
//! nodes announce their position once; unlocalized nodes that know at
//! least three localized neighbors use their slot to broadcast a ranging
//! `call`, collect the addressed `reply` round trips, and trilaterate at
//! the end of the slot, seeding Gauss-Newton with their prior estimate.
//! Replies go out the instant the call arrives, so the reply delay is
//! zero and the round trip is twice the one-way flight time.

use std::collections::BTreeMap;

use tracing::{debug, info};
use uasn_types::{MessageBody, Vec3, WireMessage};

use crate::collector::PositionCollector;
use crate::node::Node;
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LstState {
    /// Unlocalized, fewer than three known neighbors.
    Waiting,
    /// Unlocalized, enough neighbors to attempt ranging.
    Ready,
    /// Call sent; collecting replies until the slot closes.
    Localizing,
    /// Localized but the position announcement is still pending.
    New,
    /// Localized and announced; answers calls.
    Idle,
}

pub struct LstNode {
    name: String,
    position: Vec3,
    params: Params,
    /// Total number of slots in a full cycle.
    slots: u32,
    state: LstState,
    /// Next open slot, in units of slot lengths.
    slot_timer: f64,
    neighbors: BTreeMap<String, Vec3>,
    collector: Option<PositionCollector>,
    /// Transmission time of the pending call.
    timestamp: f64,
    estimate: Vec3,
}

impl LstNode {
    /// `id` doubles as the slot index and must be unique; `slots` is the
    /// cycle length (at least the highest id + 1). A node created
    /// `localized` acts as a seed anchor announcing `position`.
    pub fn new(id: u32, slots: u32, position: Vec3, localized: bool, params: Params) -> Self {
        Self {
            name: format!("node-{id}"),
            position,
            params,
            slots,
            state: if localized { LstState::New } else { LstState::Waiting },
            slot_timer: id as f64,
            neighbors: BTreeMap::new(),
            collector: None,
            timestamp: 0.0,
            estimate: if localized { position } else { Vec3::zero() },
        }
    }

    /// Seed the ToA iteration with a position known to be near the true
    /// one (deployment target, dead-reckoning drop point, ...).
    pub fn set_initial_estimate(&mut self, estimate: Vec3) {
        if self.state != LstState::New && self.state != LstState::Idle {
            self.estimate = estimate;
        }
    }

    fn slot_open(&mut self, time: f64) -> bool {
        if time / self.params.lst_timeslot >= self.slot_timer {
            self.slot_timer += self.slots as f64;
            true
        } else {
            false
        }
    }
}

impl Node for LstNode {
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
        let slot_open = self.slot_open(time);
        match self.state {
            LstState::Waiting | LstState::Idle => None,
            LstState::Ready => {
                if slot_open {
                    self.state = LstState::Localizing;
                    self.timestamp = time;
                    self.collector = Some(PositionCollector::toa(&self.params, self.estimate));
                    Some(WireMessage::new(self.name.clone(), MessageBody::Call))
                } else {
                    None
                }
            }
            LstState::Localizing => {
                if time > self.timestamp + self.params.lst_timeslot {
                    let collector = self.collector.take()?;
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
                            self.state = LstState::New;
                            self.estimate = fix.position;
                        }
                        Err(e) => {
                            debug!("{} localization failed: {}", self.name, e);
                            if collector.anchor_count() < self.neighbors.len() {
                                // not every neighbor replied; worth retrying
                                self.state = LstState::Ready;
                            } else {
                                self.state = LstState::Waiting;
                            }
                        }
                    }
                }
                None
            }
            LstState::New => {
                if slot_open {
                    self.state = LstState::Idle;
                    Some(WireMessage::new(
                        self.name.clone(),
                        MessageBody::Position { position: self.estimate, err: None },
                    ))
                } else {
                    None
                }
            }
        }
    }

    fn receive(&mut self, time: f64, message: &WireMessage) -> Option<WireMessage> {
        match &message.body {
            MessageBody::Position { position, .. } => {
                self.neighbors.insert(message.sender.clone(), *position);
                if self.state == LstState::Waiting && self.neighbors.len() >= 3 {
                    self.state = LstState::Ready;
                }
                None
            }
            MessageBody::Call => {
                if self.state == LstState::Idle {
                    Some(WireMessage::new(
                        self.name.clone(),
                        MessageBody::Reply { recipient: message.sender.clone() },
                    ))
                } else {
                    None
                }
            }
            MessageBody::Reply { recipient } => {
                if self.state == LstState::Localizing && *recipient == self.name {
                    if let Some(p) = self.neighbors.get(&message.sender) {
                        if let Some(collector) = &mut self.collector {
                            collector.add_anchor(message.sender.clone(), *p);
                            // replies are instantaneous: zero reply delay
                            collector.add_sample(&message.sender, 0, (time - self.timestamp, 0.0));
                        }
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn estimate(&self) -> Option<Vec3> {
        match self.state {
            LstState::New | LstState::Idle => Some(self.estimate),
            _ => None,
        }
    }

    fn status(&self) -> String {
        match self.state {
            LstState::Waiting => "UNLOCALIZED waiting",
            LstState::Ready => "UNLOCALIZED ready",
            LstState::Localizing => "UNLOCALIZED localizing",
            LstState::New => "LOCALIZED new",
            LstState::Idle => "LOCALIZED idle",
        }
        .to_string()
    }
}
