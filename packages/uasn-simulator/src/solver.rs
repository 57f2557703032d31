//! solver.rs — numerical localization kernels
//!
//! Two solvers share this module: the closed-form 4-anchor TDOA solver
//! (`ups`) and the iterative Gauss-Newton ToA solver (`toa`). Both are
//! free functions over plain arrays; the data-gathering side lives in
//! `collector`. The systems involved are ill-conditioned for flat anchor
//! geometries, so every failure mode is reported as a typed error instead
//! of a garbage position.

use thiserror::Error;
use uasn_types::Vec3;

// ── 3×3 linear algebra ────────────────────────────────────────────────────────

/// Row-major 3×3 matrix, just big enough for the two solvers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mat3 {
    pub m: [[f64; 3]; 3],
}

impl Mat3 {
    pub fn from_rows(r0: [f64; 3], r1: [f64; 3], r2: [f64; 3]) -> Self {
        Self { m: [r0, r1, r2] }
    }

    pub fn det(&self) -> f64 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Solve `M x = b` by Cramer's rule. `None` when the determinant
    /// vanishes relative to the matrix scale.
    pub fn solve(&self, b: [f64; 3]) -> Option<[f64; 3]> {
        let det = self.det();
        let scale = self
            .m
            .iter()
            .flatten()
            .fold(0.0f64, |acc, v| acc.max(v.abs()))
            .max(1.0);
        if det.abs() <= 1e-12 * scale * scale * scale {
            return None;
        }
        let mut x = [0.0; 3];
        for (col, slot) in x.iter_mut().enumerate() {
            let mut replaced = *self;
            for row in 0..3 {
                replaced.m[row][col] = b[row];
            }
            *slot = replaced.det() / det;
        }
        Some(x)
    }
}

// ── UPS: closed-form TDOA 4-lateration ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpsError {
    /// The anchor geometry does not determine a solution (degenerate
    /// linear system). Transient from the caller's point of view: a later
    /// beacon cycle may use a better geometry.
    #[error("anchor geometry is singular")]
    Singular,
    /// The range equations have no admissible root.
    #[error("range equations have no solution")]
    NoSolution,
    /// Two admissible positions; the measurement cannot tell them apart.
    #[error("two admissible solutions")]
    Ambiguous,
    /// The computed position is unreachably far from its anchors.
    #[error("solution out of acoustic range of its anchors")]
    OutOfRange,
}

/// Acceptance margin on the distance between a solution and its anchors,
/// relative to the maximum acoustic range.
const RANGE_MARGIN: f64 = 1.1;

/// Tolerance for treating the four anchors as lying at a common depth.
const PLANE_TOLERANCE: f64 = 1e-6;

/// Closed-form hyperbolic 4-lateration.
///
/// `anchors[0]` is the master. `k[i-1]` is the range difference
/// `‖P − A_0‖ − ‖P − A_i‖` in meters, i.e. the timing observation
/// `(t_0 − dt_0) − (t_i − dt_i)` scaled by the speed of sound.
///
/// Solves the linear system `M·P = I·w + J` in the auxiliary unknown
/// `w = ‖P − A_0‖`, then the scalar quadratic `α w² + β w + γ = 0`.
/// Negative roots are discarded; two admissible roots are `Ambiguous`.
/// When all four anchors lie at one depth (surface buoys) the system is
/// singular and the reduced in-plane form is solved instead, recovering
/// depth from `w` and rejecting the mirror image above the anchor plane.
///
/// The accepted position must lie within `max_range * 1.1` of every
/// anchor, else `OutOfRange`.
pub fn ups(anchors: &[Vec3; 4], k: &[f64; 3], max_range: f64) -> Result<Vec3, UpsError> {
    let a0 = anchors[0];
    let m = Mat3::from_rows(
        diff_row(&a0, &anchors[1]),
        diff_row(&a0, &anchors[2]),
        diff_row(&a0, &anchors[3]),
    );
    let i_vec = [-2.0 * k[0], -2.0 * k[1], -2.0 * k[2]];
    let j_vec = [
        k[0] * k[0] + a0.norm_sq() - anchors[1].norm_sq(),
        k[1] * k[1] + a0.norm_sq() - anchors[2].norm_sq(),
        k[2] * k[2] + a0.norm_sq() - anchors[3].norm_sq(),
    ];

    let position = match (m.solve(i_vec), m.solve(j_vec)) {
        (Some(a), Some(b)) => {
            let a = Vec3::new(a[0], a[1], a[2]);
            let b = Vec3::new(b[0], b[1], b[2]);
            let alpha = a.dot(&a) - 1.0;
            let beta = 2.0 * (a.dot(&b) - a.dot(&a0));
            let gamma = b.dot(&b) - 2.0 * b.dot(&a0) + a0.dot(&a0);
            let w = solve_quadratic(alpha, beta, gamma)?;
            a.scale(w).add(&b)
        }
        _ => planar_fallback(anchors, k)?,
    };

    let reach = anchors.iter().map(|a| a.dist(&position)).fold(0.0, f64::max);
    if !reach.is_finite() || reach > max_range * RANGE_MARGIN {
        return Err(UpsError::OutOfRange);
    }
    Ok(position)
}

fn diff_row(a0: &Vec3, ai: &Vec3) -> [f64; 3] {
    [2.0 * (a0.x - ai.x), 2.0 * (a0.y - ai.y), 2.0 * (a0.z - ai.z)]
}

/// Roots policy for `α w² + β w + γ = 0`, `w` a distance.
fn solve_quadratic(alpha: f64, beta: f64, gamma: f64) -> Result<f64, UpsError> {
    if alpha == 0.0 {
        return Err(UpsError::NoSolution);
    }
    let delta = beta * beta - 4.0 * alpha * gamma;
    if delta < 0.0 {
        return Err(UpsError::NoSolution);
    }
    if delta == 0.0 {
        let w = -beta / (2.0 * alpha);
        return if w >= 0.0 { Ok(w) } else { Err(UpsError::NoSolution) };
    }
    let sqrt_delta = delta.sqrt();
    let w1 = (-beta - sqrt_delta) / (2.0 * alpha);
    let w2 = (-beta + sqrt_delta) / (2.0 * alpha);
    match (w1 >= 0.0, w2 >= 0.0) {
        (false, false) => Err(UpsError::NoSolution),
        (true, true) => Err(UpsError::Ambiguous),
        (true, false) => Ok(w1),
        (false, true) => Ok(w2),
    }
}

/// Reduced system for four anchors at a common depth.
///
/// With every `A_0 − A_i` lying in the anchor plane, the three difference
/// equations are linear in `(x, y, w)`:
/// `2(x0−xi)·x + 2(y0−yi)·y + 2k_i·w = k_i² + ‖a0‖² − ‖a_i‖²`
/// (2-D norms; the common z² cancels). Depth follows from
/// `z = z̄ ± sqrt(w² − ρ²)` with `ρ` the in-plane distance to the master;
/// the candidate above the surface (z > 0) is rejected, and two admissible
/// depths are `Ambiguous`.
fn planar_fallback(anchors: &[Vec3; 4], k: &[f64; 3]) -> Result<Vec3, UpsError> {
    let z_plane = anchors[0].z;
    if anchors.iter().any(|a| (a.z - z_plane).abs() > PLANE_TOLERANCE) {
        return Err(UpsError::Singular);
    }
    let a0 = anchors[0];
    let sq2 = |a: &Vec3| a.x * a.x + a.y * a.y;
    let mut rows = [[0.0; 3]; 3];
    let mut rhs = [0.0; 3];
    for i in 0..3 {
        let ai = anchors[i + 1];
        rows[i] = [2.0 * (a0.x - ai.x), 2.0 * (a0.y - ai.y), 2.0 * k[i]];
        rhs[i] = k[i] * k[i] + sq2(&a0) - sq2(&ai);
    }
    let sol = Mat3::from_rows(rows[0], rows[1], rows[2])
        .solve(rhs)
        .ok_or(UpsError::Singular)?;
    let (x, y, w) = (sol[0], sol[1], sol[2]);
    if w < 0.0 {
        return Err(UpsError::NoSolution);
    }
    let rho_sq = (x - a0.x).powi(2) + (y - a0.y).powi(2);
    let depth_sq = w * w - rho_sq;
    if depth_sq < -PLANE_TOLERANCE {
        return Err(UpsError::NoSolution);
    }
    let s = depth_sq.max(0.0).sqrt();
    let below = z_plane - s;
    let above = z_plane + s;
    let below_ok = below <= 0.0;
    // the surface bounds the water column: nothing floats above z = 0
    let above_ok = above <= 0.0 && s > 0.0;
    match (below_ok, above_ok) {
        (true, true) => Err(UpsError::Ambiguous),
        (true, false) => Ok(Vec3::new(x, y, below)),
        (false, true) => Ok(Vec3::new(x, y, above)),
        (false, false) => Err(UpsError::NoSolution),
    }
}

// ── ToA: Gauss-Newton trilateration ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ToaError {
    /// The normal equations lost rank (collinear anchors, or an iterate
    /// collapsed onto the anchor set).
    #[error("normal equations are singular")]
    Singular,
    /// The iteration cap was reached before the step shrank below the
    /// threshold. `best` is the last iterate; the caller may accept it
    /// explicitly.
    #[error("did not converge within the iteration cap")]
    NotConverged { best: Vec3 },
}

/// Converged ToA solution with the number of iterations it took.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToaFix {
    pub position: Vec3,
    pub iterations: u32,
}

/// Iterative spherical multilateration.
///
/// Minimizes `Σ (d_i − ‖A_i − X‖)²` from the starting estimate `x0`:
/// residuals `r_i = d_i − ‖A_i − X‖`, Jacobian rows
/// `(A_i − X)/‖A_i − X‖`, update `X ← X − (JᵀJ)⁻¹ Jᵀ r`. Stops when the
/// step norm drops below `threshold`, or reports `NotConverged` with the
/// final iterate after `itermax` rounds. An anchor coincident with the
/// iterate contributes nothing that round rather than dividing by zero.
pub fn toa(
    anchors: &[Vec3],
    distances: &[f64],
    x0: Vec3,
    itermax: u32,
    threshold: f64,
) -> Result<ToaFix, ToaError> {
    debug_assert_eq!(anchors.len(), distances.len());
    let mut x = x0;
    for iteration in 1..=itermax {
        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        for (a, d) in anchors.iter().zip(distances) {
            let offset = a.sub(&x);
            let dist = offset.norm();
            if dist == 0.0 {
                continue;
            }
            let j = [offset.x / dist, offset.y / dist, offset.z / dist];
            let r = d - dist;
            for (row, jr) in j.iter().enumerate() {
                for (col, jc) in j.iter().enumerate() {
                    jtj[row][col] += jr * jc;
                }
                jtr[row] += jr * r;
            }
        }
        let step = Mat3::from_rows(jtj[0], jtj[1], jtj[2])
            .solve(jtr)
            .ok_or(ToaError::Singular)?;
        x = Vec3::new(x.x - step[0], x.y - step[1], x.z - step[2]);
        let step_norm = (step[0] * step[0] + step[1] * step[1] + step[2] * step[2]).sqrt();
        if step_norm < threshold {
            return Ok(ToaFix { position: x, iterations: iteration });
        }
    }
    Err(ToaError::NotConverged { best: x })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SND_SPEED: f64 = 1500.0;
    const SIM_RANGE: f64 = 1000.0;

    fn k_for(anchors: &[Vec3; 4], p: &Vec3) -> [f64; 3] {
        let w0 = p.dist(&anchors[0]);
        [
            w0 - p.dist(&anchors[1]),
            w0 - p.dist(&anchors[2]),
            w0 - p.dist(&anchors[3]),
        ]
    }

    #[test]
    fn mat3_solves_a_known_system() {
        let m = Mat3::from_rows([2.0, 0.0, 1.0], [0.0, 3.0, -1.0], [1.0, 1.0, 1.0]);
        let x = m.solve([5.0, 1.0, 4.0]).unwrap();
        for (lhs, rhs) in [
            (2.0 * x[0] + x[2], 5.0),
            (3.0 * x[1] - x[2], 1.0),
            (x[0] + x[1] + x[2], 4.0),
        ] {
            assert!((lhs - rhs).abs() < 1e-12);
        }
    }

    #[test]
    fn mat3_reports_singular() {
        let m = Mat3::from_rows([1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 1.0, 0.0]);
        assert!(m.solve([1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn ups_recovers_the_exact_position() {
        // one submerged anchor breaks the coplanarity
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 500.0, 0.0),
            Vec3::new(500.0, 250.0, 0.0),
            Vec3::new(500.0, 250.0, -200.0),
        ];
        let truth = Vec3::new(250.0, 250.0, -100.0);
        // synthesize the timing chain: master beacons at t=0, each relay
        // reports its own delay, so the k coefficients reduce to range
        // differences
        let delays = [0.0, 0.4, 0.8, 1.0];
        let t: Vec<f64> = anchors
            .iter()
            .zip(&delays)
            .map(|(a, dt)| dt + truth.dist(a) / SND_SPEED)
            .collect();
        let k = [
            SND_SPEED * ((t[0] - delays[0]) - (t[1] - delays[1])),
            SND_SPEED * ((t[0] - delays[0]) - (t[2] - delays[2])),
            SND_SPEED * ((t[0] - delays[0]) - (t[3] - delays[3])),
        ];
        let p = ups(&anchors, &k, SIM_RANGE).unwrap();
        assert!(p.dist(&truth) < 1e-6, "got {p:?}");
    }

    #[test]
    fn ups_planar_anchors_reject_the_surface_mirror() {
        // all anchors on the surface; the +100 m
        // mirror image is cut off by the z-range check
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 500.0, 0.0),
            Vec3::new(500.0, 250.0, 0.0),
            Vec3::new(500.0, 0.0, 0.0),
        ];
        let truth = Vec3::new(250.0, 250.0, -100.0);
        let p = ups(&anchors, &k_for(&anchors, &truth), SIM_RANGE).unwrap();
        assert!(p.dist(&truth) < 1e-6, "got {p:?}");
    }

    #[test]
    fn ups_submerged_plane_is_ambiguous() {
        // anchors at a mid-water depth: both mirror images are underwater
        let anchors = [
            Vec3::new(0.0, 0.0, -150.0),
            Vec3::new(0.0, 500.0, -150.0),
            Vec3::new(500.0, 250.0, -150.0),
            Vec3::new(500.0, 0.0, -150.0),
        ];
        let truth = Vec3::new(250.0, 250.0, -100.0);
        assert_eq!(
            ups(&anchors, &k_for(&anchors, &truth), SIM_RANGE),
            Err(UpsError::Ambiguous)
        );
    }

    #[test]
    fn ups_degenerate_geometry_is_singular() {
        // three anchors collinear and the fourth on the same line
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(100.0, 0.0, 0.0),
            Vec3::new(200.0, 0.0, 0.0),
            Vec3::new(300.0, 0.0, 0.0),
        ];
        let truth = Vec3::new(250.0, 250.0, -100.0);
        assert_eq!(
            ups(&anchors, &k_for(&anchors, &truth), SIM_RANGE),
            Err(UpsError::Singular)
        );
    }

    #[test]
    fn ups_far_position_is_out_of_range() {
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 500.0, 0.0),
            Vec3::new(500.0, 250.0, 0.0),
            Vec3::new(500.0, 250.0, -200.0),
        ];
        let truth = Vec3::new(4000.0, 4000.0, -100.0);
        let result = ups(&anchors, &k_for(&anchors, &truth), SIM_RANGE);
        assert!(matches!(result, Err(UpsError::OutOfRange) | Err(UpsError::Ambiguous)));
    }

    #[test]
    fn quadratic_roots_policy() {
        // alpha = 0 must not divide
        assert_eq!(solve_quadratic(0.0, 1.0, 1.0), Err(UpsError::NoSolution));
        // negative discriminant
        assert_eq!(solve_quadratic(1.0, 0.0, 1.0), Err(UpsError::NoSolution));
        // double root at w = 2
        assert_eq!(solve_quadratic(1.0, -4.0, 4.0), Ok(2.0));
        // double root at w = -2: negative distance
        assert_eq!(solve_quadratic(1.0, 4.0, 4.0), Err(UpsError::NoSolution));
        // roots 1 and 2: both admissible
        assert_eq!(solve_quadratic(1.0, -3.0, 2.0), Err(UpsError::Ambiguous));
        // roots -1 and 2: unique admissible root
        assert_eq!(solve_quadratic(1.0, -1.0, -2.0), Ok(2.0));
        // roots -2 and -1: none admissible
        assert_eq!(solve_quadratic(1.0, 3.0, 2.0), Err(UpsError::NoSolution));
    }

    #[test]
    fn toa_converges_on_exact_data() {
        
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1000.0, 0.0, 0.0),
            Vec3::new(0.0, 1000.0, 0.0),
            Vec3::new(0.0, 0.0, 1000.0),
        ];
        let truth = Vec3::new(300.0, 400.0, -200.0);
        let d: Vec<f64> = anchors.iter().map(|a| truth.dist(a)).collect();
        let fix = toa(&anchors, &d, Vec3::zero(), 10, 0.01).unwrap();
        assert!(fix.iterations <= 5, "took {} iterations", fix.iterations);
        assert!(fix.position.dist(&truth) < 0.01);
    }

    #[test]
    fn toa_residuals_bound_the_accepted_fix() {
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(800.0, 100.0, 0.0),
            Vec3::new(100.0, 900.0, -50.0),
            Vec3::new(400.0, 400.0, -300.0),
        ];
        let truth = Vec3::new(350.0, 420.0, -120.0);
        let d: Vec<f64> = anchors.iter().map(|a| truth.dist(a)).collect();
        let fix = toa(&anchors, &d, Vec3::new(300.0, 300.0, 0.0), 10, 0.01).unwrap();
        for (a, di) in anchors.iter().zip(&d) {
            assert!((a.dist(&fix.position) - di).abs() < 0.05);
        }
    }

    #[test]
    fn toa_collinear_anchors_are_singular() {
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(100.0, 0.0, 0.0),
            Vec3::new(200.0, 0.0, 0.0),
        ];
        let d = [50.0, 60.0, 70.0];
        assert_eq!(
            toa(&anchors, &d, Vec3::new(10.0, 0.0, 0.0), 10, 0.01),
            Err(ToaError::Singular)
        );
    }

    #[test]
    fn toa_reports_not_converged_with_its_best_iterate() {
        let anchors = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1000.0, 0.0, 0.0),
            Vec3::new(0.0, 1000.0, 0.0),
            Vec3::new(0.0, 0.0, 1000.0),
        ];
        let truth = Vec3::new(300.0, 400.0, -200.0);
        let d: Vec<f64> = anchors.iter().map(|a| truth.dist(a)).collect();
        // one iteration cannot reach the threshold from a distant start
        match toa(&anchors, &d, Vec3::new(5000.0, 5000.0, 1000.0), 1, 1e-9) {
            Err(ToaError::NotConverged { best }) => {
                assert!(best.dist(&Vec3::new(5000.0, 5000.0, 1000.0)) > 0.0);
            }
            other => panic!("expected NotConverged, got {other:?}"),
        }
    }
}
