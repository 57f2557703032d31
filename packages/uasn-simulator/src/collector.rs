//! collector.rs — data-gathering substrate feeding the solvers
//!
//! Protocol state machines do not call the solvers directly: they push
//! anchors and timing samples into a [`PositionCollector`] as beacons and
//! replies come in, and ask for a position when a round completes. The
//! collector compiles each measurement series into solver coefficients,
//! averages them column-wise across series, runs the solver matching its
//! calculator kind, and attaches a dispersion estimate obtained by
//! re-solving at sigma-point perturbations of the averaged coefficients.

use std::collections::BTreeMap;

use thiserror::Error;
use uasn_types::Vec3;

use crate::params::Params;
use crate::solver::{self, ToaError, UpsError};

/// Which compile step and solver a collector drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculatorKind {
    /// TDOA: series are beacon cycles; compiled coefficients are the three
    /// k range differences against the master anchor.
    Ups,
    /// ToA: compiled coefficients are per-anchor one-way ranges from
    /// round-trip measurements.
    Toa,
}

/// A successful localization: the estimate plus a dispersion figure (m)
/// describing how far the solution moves under the measurement scatter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub position: Vec3,
    pub dispersion: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectError {
    /// Fewer anchors registered than the calculation needs.
    #[error("not enough anchors")]
    NotEnoughAnchors,
    /// No measurement series at all.
    #[error("no data")]
    NoData,
    /// Every series left some coefficient column empty.
    #[error("incomplete data")]
    IncompleteData,
    #[error(transparent)]
    Ups(#[from] UpsError),
    #[error(transparent)]
    Toa(#[from] ToaError),
}

/// One timing sample. For UPS: `(arrival time, reported transmit delay)`.
/// For ToA: `(round-trip time, reply delay)`.
pub type Sample = (f64, f64);

/// How anchors are identified. TDOA slots anchors by their beacon level,
/// so beacons may arrive in any order; ToA appends names as replies come
/// in.
enum AnchorRegistry {
    /// Four slots indexed by beacon level; slot 0 is the master.
    Slots([Option<String>; 4]),
    /// Names in registration order.
    Names(Vec<String>),
}

pub struct PositionCollector {
    kind: CalculatorKind,
    snd_speed: f64,
    sim_range: f64,
    toa_itermax: u32,
    toa_threshold: f64,
    anchor_min: usize,
    registry: AnchorRegistry,
    positions: BTreeMap<String, Vec3>,
    /// Sparse series table: `series[n][anchor] = sample`.
    series: Vec<BTreeMap<String, Sample>>,
    /// Starting estimate for the iterative solver.
    x0: Vec3,
}

impl PositionCollector {
    /// TDOA collector: exactly four anchors, slotted by beacon level.
    pub fn ups(params: &Params) -> Self {
        Self::new(
            CalculatorKind::Ups,
            params,
            4,
            AnchorRegistry::Slots([None, None, None, None]),
            Vec3::zero(),
        )
    }

    /// ToA collector seeded with a prior position estimate. Unlocalized
    /// callers should pass an estimate known to be near their true
    /// position, or Gauss-Newton may walk to the mirror solution.
    pub fn toa(params: &Params, x0: Vec3) -> Self {
        Self::new(CalculatorKind::Toa, params, 3, AnchorRegistry::Names(Vec::new()), x0)
    }

    fn new(
        kind: CalculatorKind,
        params: &Params,
        anchor_min: usize,
        registry: AnchorRegistry,
        x0: Vec3,
    ) -> Self {
        Self {
            kind,
            snd_speed: params.snd_speed,
            sim_range: params.sim_range,
            toa_itermax: params.toa_itermax,
            toa_threshold: params.toa_threshold,
            anchor_min,
            registry,
            positions: BTreeMap::new(),
            series: Vec::new(),
            x0,
        }
    }

    /// Register a TDOA anchor at its beacon level, in any arrival order.
    /// Levels beyond the four slots are ignored; repeating a level
    /// updates it. No-op on a ToA collector.
    pub fn add_anchor_at(&mut self, level: usize, name: impl Into<String>, position: Vec3) {
        let AnchorRegistry::Slots(slots) = &mut self.registry else {
            return;
        };
        let Some(slot) = slots.get_mut(level) else {
            return;
        };
        let name = name.into();
        self.positions.insert(name.clone(), position);
        *slot = Some(name);
    }

    /// Register a ToA anchor; repeating a name updates its position.
    /// No-op on a TDOA collector, which slots anchors by level instead.
    pub fn add_anchor(&mut self, name: impl Into<String>, position: Vec3) {
        let AnchorRegistry::Names(names) = &mut self.registry else {
            return;
        };
        let name = name.into();
        if !self.positions.contains_key(&name) {
            names.push(name.clone());
        }
        self.positions.insert(name, position);
    }

    pub fn anchor_count(&self) -> usize {
        match &self.registry {
            AnchorRegistry::Slots(slots) => slots.iter().flatten().count(),
            AnchorRegistry::Names(names) => names.len(),
        }
    }

    pub fn has_anchor(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Record a timing sample from `anchor` in measurement series `n`.
    /// Samples from unregistered anchors are dropped.
    pub fn add_sample(&mut self, anchor: &str, n: usize, sample: Sample) {
        if !self.positions.contains_key(anchor) {
            return;
        }
        while self.series.len() <= n {
            self.series.push(BTreeMap::new());
        }
        self.series[n].insert(anchor.to_string(), sample);
    }

    /// Compile one series into coefficient columns; `None` marks a value
    /// this series cannot provide.
    fn compile(&self, series: &BTreeMap<String, Sample>) -> Vec<Option<f64>> {
        match &self.registry {
            AnchorRegistry::Slots(slots) => {
                let master = slots[0]
                    .as_ref()
                    .and_then(|name| series.get(name))
                    .map(|&(t0, dt0)| t0 - dt0);
                slots[1..]
                    .iter()
                    .map(|slot| {
                        let name = slot.as_ref()?;
                        let &(ti, dti) = series.get(name)?;
                        Some((master? - (ti - dti)) * self.snd_speed)
                    })
                    .collect()
            }
            AnchorRegistry::Names(names) => names
                .iter()
                .map(|name| {
                    let &(rtt, delay) = series.get(name)?;
                    Some(self.snd_speed * (rtt - delay) / 2.0)
                })
                .collect(),
        }
    }

    /// Compile the stored data and calculate a position estimate.
    ///
    /// `complete_only` drops series that are missing any coefficient
    /// instead of contributing their partial columns.
    pub fn position(&self, complete_only: bool) -> Result<Fix, CollectError> {
        if self.anchor_count() < self.anchor_min {
            return Err(CollectError::NotEnoughAnchors);
        }
        if self.series.is_empty() {
            return Err(CollectError::NoData);
        }

        let width = match self.kind {
            CalculatorKind::Ups => 3,
            CalculatorKind::Toa => self.anchor_count(),
        };
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); width];
        for series in &self.series {
            let compiled = self.compile(series);
            if complete_only && compiled.iter().any(Option::is_none) {
                continue;
            }
            for (column, value) in columns.iter_mut().zip(&compiled) {
                if let Some(v) = value {
                    column.push(*v);
                }
            }
        }
        if columns.iter().any(Vec::is_empty) {
            return Err(CollectError::IncompleteData);
        }

        let mean: Vec<f64> =
            columns.iter().map(|c| c.iter().sum::<f64>() / c.len() as f64).collect();
        let sigma: Vec<f64> = columns
            .iter()
            .zip(&mean)
            .map(|(c, m)| {
                (c.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / c.len() as f64).sqrt()
            })
            .collect();

        match self.kind {
            CalculatorKind::Ups => self.solve_ups(&mean, &sigma),
            CalculatorKind::Toa => self.solve_toa(&mean, &sigma),
        }
    }

    /// Slot positions in level order; `None` while any slot is empty.
    fn slot_positions(&self) -> Option<[Vec3; 4]> {
        let AnchorRegistry::Slots(slots) = &self.registry else {
            return None;
        };
        let mut out = [Vec3::zero(); 4];
        for (slot, dst) in slots.iter().zip(out.iter_mut()) {
            *dst = *self.positions.get(slot.as_ref()?)?;
        }
        Some(out)
    }

    fn name_positions(&self) -> Vec<Vec3> {
        match &self.registry {
            AnchorRegistry::Names(names) => names.iter().map(|a| self.positions[a]).collect(),
            AnchorRegistry::Slots(_) => Vec::new(),
        }
    }

    fn solve_ups(&self, mean: &[f64], sigma: &[f64]) -> Result<Fix, CollectError> {
        let anchors = self.slot_positions().ok_or(CollectError::NotEnoughAnchors)?;
        let k = [mean[0], mean[1], mean[2]];
        let position = solver::ups(&anchors, &k, self.sim_range)?;

        // sigma-point propagation: re-solve at K ± σ_i e_i and accumulate
        // the half-spread per axis; a failed perturbed solve degrades the
        // figure to the coefficient-space error instead of failing the fix
        let mut var = 0.0;
        let mut degraded = false;
        for i in 0..3 {
            if sigma[i] == 0.0 {
                continue;
            }
            let mut hi = k;
            let mut lo = k;
            hi[i] += sigma[i];
            lo[i] -= sigma[i];
            match (
                solver::ups(&anchors, &hi, self.sim_range),
                solver::ups(&anchors, &lo, self.sim_range),
            ) {
                (Ok(p_hi), Ok(p_lo)) => {
                    let half_spread = p_hi.dist(&p_lo) / 2.0;
                    var += half_spread * half_spread;
                }
                _ => degraded = true,
            }
        }
        let dispersion = if degraded {
            sigma.iter().map(|s| s * s).sum::<f64>().sqrt()
        } else {
            var.sqrt()
        };
        Ok(Fix { position, dispersion })
    }

    fn solve_toa(&self, mean: &[f64], _sigma: &[f64]) -> Result<Fix, CollectError> {
        let anchors = self.name_positions();
        let fix = solver::toa(&anchors, mean, self.x0, self.toa_itermax, self.toa_threshold)?;
        let rms = (anchors
            .iter()
            .zip(mean)
            .map(|(a, d)| {
                let r = a.dist(&fix.position) - d;
                r * r
            })
            .sum::<f64>()
            / anchors.len() as f64)
            .sqrt();
        Ok(Fix { position: fix.position, dispersion: rms })
    }
}
