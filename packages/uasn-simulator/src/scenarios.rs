//! scenarios.rs — canned node populations for the runner and the tests
//!
//! Each builder seeds a few localized nodes and scatters a jittered grid
//! of sensors over the area. Placement noise comes from a sub-source
//! forked off the environment's master generator, so a scenario is fully
//! determined by the run seed.

use serde::Deserialize;
use uasn_types::Vec3;

use crate::environment::Environment;
use crate::node::Node;
use crate::params::ConfigError;
use crate::protocols::{LslsNode, LstNode, RlsNode, UpsAnchor, UpsMaster, UpsSensor};
use crate::rng::SimRng;

/// Which protocol a scenario exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ups,
    Lst,
    Rls,
    Lsls,
}

/// Geometry of the canned scenarios.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Side of the (square) simulation area (m).
    pub area: f64,
    /// Depth of the water column (m, positive).
    pub depth: f64,
    /// Sensor grid spacing (m).
    pub spacing: f64,
    /// Std-dev of the placement noise around grid points (m).
    pub jitter: f64,
    /// Nominal deployment depth of the sensors (m, positive down).
    pub sensor_depth: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self { area: 4000.0, depth: 500.0, spacing: 400.0, jitter: 50.0, sensor_depth: 300.0 }
    }
}

impl ScenarioConfig {
    /// The environment volume this scenario needs.
    pub fn volume(&self) -> (f64, f64, f64) {
        (self.area, self.area, self.depth)
    }

    /// Seed positions: three surface buoys around the area center plus
    /// one submerged, spaced half a grid step out.
    fn seed_positions(&self) -> [Vec3; 4] {
        let c = self.area / 2.0;
        let l = self.spacing;
        [
            Vec3::new(c - l, c - l, 0.0),
            Vec3::new(c + l, c - l, 0.0),
            Vec3::new(c, c + l, 0.0),
            Vec3::new(c, c + l, -0.6 * self.depth),
        ]
    }

    /// Grid side length in cells.
    fn cells(&self) -> u32 {
        (self.area / self.spacing).max(1.0) as u32
    }

    /// Ideal grid point for cell (i, j).
    fn grid_point(&self, i: u32, j: u32) -> Vec3 {
        Vec3::new(
            (0.5 + i as f64) * self.spacing,
            (0.5 + j as f64) * self.spacing,
            -self.sensor_depth,
        )
    }

    /// Jittered true position around an ideal grid point, clamped into
    /// the volume.
    fn place(&self, ideal: &Vec3, rng: &mut SimRng) -> Vec3 {
        Vec3::new(
            rng.normal(ideal.x, self.jitter).clamp(0.0, self.area),
            rng.normal(ideal.y, self.jitter).clamp(0.0, self.area),
            rng.normal(ideal.z, self.jitter).clamp(-self.depth, 0.0),
        )
    }
}

/// Populate `env` for `protocol`. Returns the number of nodes added.
pub fn build(
    env: &mut Environment,
    protocol: Protocol,
    cfg: &ScenarioConfig,
) -> Result<usize, ConfigError> {
    let mut placement = env.fork_rng();
    let params = env.params().clone();
    let seeds = cfg.seed_positions();
    let cells = cfg.cells();
    let mut count = 0usize;

    match protocol {
        Protocol::Ups => {
            env.add_node(Box::new(UpsMaster::new(seeds[0], params.clone())))?;
            for (priority, seed) in seeds.iter().enumerate().skip(1) {
                env.add_node(Box::new(UpsAnchor::new(priority as u32, *seed, params.clone())))?;
            }
            count += 4;
            for i in 0..cells {
                for j in 0..cells {
                    let mut sensor = UpsSensor::new(i * cells + j, params.clone());
                    sensor.set_position(cfg.place(&cfg.grid_point(i, j), &mut placement));
                    env.add_node(Box::new(sensor))?;
                    count += 1;
                }
            }
        }
        Protocol::Lst => {
            let slots = 3 + cells * cells;
            for (id, seed) in seeds.iter().take(3).enumerate() {
                env.add_node(Box::new(LstNode::new(
                    id as u32,
                    slots,
                    *seed,
                    true,
                    params.clone(),
                )))?;
                count += 1;
            }
            let mut id = 3;
            for i in 0..cells {
                for j in 0..cells {
                    let ideal = cfg.grid_point(i, j);
                    let mut node =
                        LstNode::new(id, slots, cfg.place(&ideal, &mut placement), false, params.clone());
                    // the deployment target is a fair prior for Gauss-Newton
                    node.set_initial_estimate(ideal);
                    env.add_node(Box::new(node))?;
                    id += 1;
                    count += 1;
                }
            }
        }
        Protocol::Rls => {
            let slots = 4 + cells * cells;
            for (id, seed) in seeds.iter().enumerate() {
                env.add_node(Box::new(RlsNode::new(
                    id as u32,
                    slots,
                    *seed,
                    true,
                    params.clone(),
                )))?;
                count += 1;
            }
            let mut id = 4;
            for i in 0..cells {
                for j in 0..cells {
                    let node = RlsNode::new(
                        id,
                        slots,
                        cfg.place(&cfg.grid_point(i, j), &mut placement),
                        false,
                        params.clone(),
                    );
                    env.add_node(Box::new(node))?;
                    id += 1;
                    count += 1;
                }
            }
        }
        Protocol::Lsls => {
            // LSLS recruits its anchor chain from localized nodes within
            // the sub-range of the master, so the seeds form a tight
            // cluster around the area center instead of the wide quad
            let c = cfg.area / 2.0;
            let r = 0.4 * params.lsls_subrange.min(cfg.area / 2.0);
            let cluster = [
                Vec3::new(c, c, 0.0),
                Vec3::new(c + r, c, 0.0),
                Vec3::new(c, c + r, 0.0),
                Vec3::new(c - 0.7 * r, c - 0.7 * r, -0.4 * cfg.depth),
            ];
            let mut master = LslsNode::new(0, cluster[0], true, params.clone());
            master.make_master();
            env.add_node(Box::new(master))?;
            for (id, seed) in cluster.iter().enumerate().skip(1) {
                env.add_node(Box::new(LslsNode::new(id as u32, *seed, true, params.clone())))?;
            }
            count += 4;
            let mut id = 4;
            for i in 0..cells {
                for j in 0..cells {
                    let node = LslsNode::new(
                        id,
                        cfg.place(&cfg.grid_point(i, j), &mut placement),
                        false,
                        params.clone(),
                    );
                    env.add_node(Box::new(node))?;
                    id += 1;
                    count += 1;
                }
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;

    #[test]
    fn builders_populate_every_protocol() {
        for protocol in [Protocol::Ups, Protocol::Lst, Protocol::Rls, Protocol::Lsls] {
            let cfg = ScenarioConfig::default();
            let mut env = Environment::with_seed(cfg.volume(), Params::default(), 1).unwrap();
            let count = build(&mut env, protocol, &cfg).unwrap();
            assert_eq!(count, env.nodes().len());
            assert_eq!(count, 4 + 10 * 10 - if protocol == Protocol::Lst { 1 } else { 0 });
        }
    }

    #[test]
    fn placement_is_reproducible() {
        let cfg = ScenarioConfig::default();
        let positions = |seed: u64| {
            let mut env = Environment::with_seed(cfg.volume(), Params::default(), seed).unwrap();
            build(&mut env, Protocol::Rls, &cfg).unwrap();
            env.nodes().iter().map(|n| n.position()).collect::<Vec<_>>()
        };
        assert_eq!(positions(5), positions(5));
        assert_ne!(positions(5), positions(6));
    }

    #[test]
    fn placements_stay_in_bounds() {
        let cfg = ScenarioConfig { jitter: 500.0, ..Default::default() };
        let mut env = Environment::with_seed(cfg.volume(), Params::default(), 2).unwrap();
        build(&mut env, Protocol::Lst, &cfg).unwrap();
        for node in env.nodes() {
            let p = node.position();
            assert!((0.0..=cfg.area).contains(&p.x));
            assert!((0.0..=cfg.area).contains(&p.y));
            assert!((-cfg.depth..=0.0).contains(&p.z));
        }
    }
}
