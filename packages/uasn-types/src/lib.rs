//! # uasn-types
//!
//! Shared types for the UASN self-localization simulator.
//!
//! These types are used by:
//! - `uasn-simulator`: the acoustic simulation kernel and localization
//!   protocols
//! - host programs wiring up their own scenarios against the kernel
//!
//! ## Coordinate Conventions
//!
//! - **World frame**: Cartesian, meters. `0 ≤ x ≤ max_x`, `0 ≤ y ≤ max_y`,
//!   `min_z ≤ z ≤ 0` — z is depth, negative downward, with the surface at
//!   z = 0.
//!
//! ## Wire Format
//!
//! Acoustic messages are a single line of whitespace-separated tokens:
//! `<sender> <verb> <fields...>`. Floats are formatted with Rust's
//! shortest-round-trip notation so that timing values survive the text
//! round trip exactly. Unknown verbs parse to [`MessageBody::Other`] and
//! are ignored by receivers; malformed lines parse to `None`.

use serde::{Deserialize, Serialize};

// ── 3D Vector ─────────────────────────────────────────────────────────────────

/// 3D vector (meters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0 }
    }

    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(&self, s: f64) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn norm_sq(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm_sq().sqrt()
    }

    pub fn dist(&self, other: &Vec3) -> f64 {
        self.sub(other).norm()
    }
}

// ── Acoustic message grammar ──────────────────────────────────────────────────

/// One acoustic broadcast: sender name plus a structured body.
///
/// The wire text is `<sender> <verb> <fields...>`; [`WireMessage::to_wire`]
/// and [`WireMessage::parse`] convert between the two. `parse(to_wire(m))`
/// reproduces `m` exactly for every constructible message.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub sender: String,
    pub body: MessageBody,
}

/// Verb-specific payload of an acoustic message.
///
/// The `beacon` layout is shared by every TDOA protocol: a series (cycle)
/// number, the rank of the anchor in the beaconing chain, the transmission
/// delay since the series origin, and an optional piggy-backed position
/// announcement with error estimate.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Position announcement by a localized node. The error estimate is
    /// carried by protocols that track it (RLS) and omitted otherwise.
    Position { position: Vec3, err: Option<f64> },
    /// Anchor-chain announcement (LSLS): level in the chain, the
    /// announcer's position, and the name of its parent anchor.
    Anchor { level: u32, position: Vec3, parent: String },
    /// Request naming four neighbors as a beaconing quadruple (RLS).
    Request { anchors: [String; 4] },
    /// Candidacy confirmation (LSLS): level, the candidate's timer factor,
    /// and the parent anchor it confirms under.
    Confirm { level: u32, factor: f64, parent: String },
    /// Neighbor discovery probe.
    Ping,
    /// Answer to a ping: the responder's position estimate and its error.
    Ack { position: Vec3, err: f64 },
    /// TDOA beacon.
    Beacon {
        series: u32,
        level: u32,
        delay: f64,
        position: Option<Vec3>,
        err: Option<f64>,
    },
    /// ToA ranging call; localized neighbors reply.
    Call,
    /// Answer to a call, addressed to the caller by name.
    Reply { recipient: String },
    /// Any verb this grammar does not know. Receivers ignore it.
    Other { verb: String },
}

impl WireMessage {
    pub fn new(sender: impl Into<String>, body: MessageBody) -> Self {
        Self { sender: sender.into(), body }
    }

    /// Format as the single-line wire text.
    pub fn to_wire(&self) -> String {
        let mut out = self.sender.clone();
        match &self.body {
            MessageBody::Position { position, err } => {
                out.push_str(&format!(" position {} {} {}", position.x, position.y, position.z));
                if let Some(e) = err {
                    out.push_str(&format!(" {}", e));
                }
            }
            MessageBody::Anchor { level, position, parent } => {
                out.push_str(&format!(
                    " anchor {} {} {} {} {}",
                    level, position.x, position.y, position.z, parent
                ));
            }
            MessageBody::Request { anchors } => {
                out.push_str(" request");
                for a in anchors {
                    out.push(' ');
                    out.push_str(a);
                }
            }
            MessageBody::Confirm { level, factor, parent } => {
                out.push_str(&format!(" confirm {} {} {}", level, factor, parent));
            }
            MessageBody::Ping => out.push_str(" ping"),
            MessageBody::Ack { position, err } => {
                out.push_str(&format!(
                    " ack {} {} {} {}",
                    position.x, position.y, position.z, err
                ));
            }
            MessageBody::Beacon { series, level, delay, position, err } => {
                out.push_str(&format!(" beacon {} {} {}", series, level, delay));
                if let Some(p) = position {
                    out.push_str(&format!(" {} {} {}", p.x, p.y, p.z));
                    if let Some(e) = err {
                        out.push_str(&format!(" {}", e));
                    }
                }
            }
            MessageBody::Call => out.push_str(" call"),
            MessageBody::Reply { recipient } => {
                out.push_str(&format!(" reply {}", recipient));
            }
            MessageBody::Other { verb } => {
                out.push(' ');
                out.push_str(verb);
            }
        }
        out
    }

    /// Parse one line of wire text. Returns `None` when the line has no
    /// sender/verb or when a known verb carries a malformed payload.
    /// Unknown verbs parse successfully into [`MessageBody::Other`].
    pub fn parse(line: &str) -> Option<WireMessage> {
        let mut tokens = line.split_whitespace();
        let sender = tokens.next()?.to_string();
        let verb = tokens.next()?;
        let rest: Vec<&str> = tokens.collect();
        let body = match verb {
            "position" => match rest.len() {
                3 => MessageBody::Position { position: parse_vec3(&rest[0..3])?, err: None },
                4 => MessageBody::Position {
                    position: parse_vec3(&rest[0..3])?,
                    err: Some(rest[3].parse().ok()?),
                },
                _ => return None,
            },
            "anchor" => {
                if rest.len() != 5 {
                    return None;
                }
                MessageBody::Anchor {
                    level: rest[0].parse().ok()?,
                    position: parse_vec3(&rest[1..4])?,
                    parent: rest[4].to_string(),
                }
            }
            "request" => {
                if rest.len() != 4 {
                    return None;
                }
                MessageBody::Request {
                    anchors: [
                        rest[0].to_string(),
                        rest[1].to_string(),
                        rest[2].to_string(),
                        rest[3].to_string(),
                    ],
                }
            }
            "confirm" => {
                if rest.len() != 3 {
                    return None;
                }
                MessageBody::Confirm {
                    level: rest[0].parse().ok()?,
                    factor: rest[1].parse().ok()?,
                    parent: rest[2].to_string(),
                }
            }
            "ping" => {
                if !rest.is_empty() {
                    return None;
                }
                MessageBody::Ping
            }
            "ack" => {
                if rest.len() != 4 {
                    return None;
                }
                MessageBody::Ack {
                    position: parse_vec3(&rest[0..3])?,
                    err: rest[3].parse().ok()?,
                }
            }
            "beacon" => {
                let (position, err) = match rest.len() {
                    3 => (None, None),
                    6 => (Some(parse_vec3(&rest[3..6])?), None),
                    7 => (Some(parse_vec3(&rest[3..6])?), Some(rest[6].parse().ok()?)),
                    _ => return None,
                };
                MessageBody::Beacon {
                    series: rest[0].parse().ok()?,
                    level: rest[1].parse().ok()?,
                    delay: rest[2].parse().ok()?,
                    position,
                    err,
                }
            }
            "call" => {
                if !rest.is_empty() {
                    return None;
                }
                MessageBody::Call
            }
            "reply" => {
                if rest.len() != 1 {
                    return None;
                }
                MessageBody::Reply { recipient: rest[0].to_string() }
            }
            other => MessageBody::Other { verb: other.to_string() },
        };
        Some(WireMessage { sender, body })
    }
}

fn parse_vec3(tokens: &[&str]) -> Option<Vec3> {
    Some(Vec3::new(
        tokens[0].parse().ok()?,
        tokens[1].parse().ok()?,
        tokens[2].parse().ok()?,
    ))
}
