//! node.rs — the contract between the scheduler and a protocol node

use uasn_types::{Vec3, WireMessage};

/// A simulated node. Protocols implement their state machines behind this
/// trait; the scheduler only ever calls `tick`, `receive`, `name` and
/// `position`.
///
/// Both callbacks run to completion on the single simulation thread and
/// must not block. A returned message is broadcast from the node's current
/// position at the current simulated time; `None` means silence. Timers
/// must be expressed as comparisons against the `time` argument, never as
/// counts of ticks.
pub trait Node {
    /// Stable identifier, unique within an environment.
    fn name(&self) -> &str;

    /// Current true position. Mutated only by the environment, before the
    /// run starts.
    fn position(&self) -> Vec3;

    /// Called by the environment when placing the node (random assignment
    /// of out-of-bounds positions). Not called after `run` begins.
    fn set_position(&mut self, position: Vec3);

    /// Called once per tick for every node, in insertion order.
    fn tick(&mut self, time: f64) -> Option<WireMessage>;

    /// Called when a broadcast reaches this node.
    fn receive(&mut self, time: f64, message: &WireMessage) -> Option<WireMessage>;

    /// The node's current position estimate, if it has one. Hosts read
    /// this after (or during) a run for reporting; the scheduler never
    /// calls it.
    fn estimate(&self) -> Option<Vec3> {
        None
    }

    /// Short label describing the protocol state, for snapshots and
    /// reports. Purely informational.
    fn status(&self) -> String {
        String::new()
    }
}
