// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Newton-Raphson refinement of a position estimate
//! from range measurements to three reference points.
//!
//! Each reference point `p_i` with measured distance `d_i` contributes one
//! squared-distance equation `|x - p_i|^2 = d_i^2`. With exactly three
//! reference points the system is square, so each iteration can linearize
//! it around the current estimate and solve a 3x3 system directly for the
//! update step. No least-squares machinery is involved; generalizing to
//! more reference points would require it.

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

type Mat3 = Matrix3<f64>;
type Vec3 = Vector3<f64>;

/// Number of reference points the solver requires.
///
/// Three ranges make the squared-distance system square (three equations in
/// three unknowns), which is what allows the direct 3x3 solve per iteration.
pub const ANCHOR_COUNT: usize = 3;

/// Input rejected before any iteration is run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidInput {
    /// Not exactly [`ANCHOR_COUNT`] reference points.
    #[error("requires exactly {expected} reference points, got {0}", expected = ANCHOR_COUNT)]
    AnchorCount(usize),

    /// Distance count differs from the reference point count.
    #[error("requires exactly {expected} distances, one per reference point, got {0}", expected = ANCHOR_COUNT)]
    DistanceCount(usize),

    /// An iteration budget of zero can never produce an update.
    #[error("max_iters must be at least 1")]
    ZeroMaxIters,

    /// A tolerance that no update step could ever satisfy.
    #[error("tol must be positive and finite, got {0}")]
    NonPositiveTol(f64),
}

/// Stopping condition that ended the refinement loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The last update step was smaller than the tolerance.
    Converged,
    /// The linearized system lost rank; refinement halted early.
    Singular,
    /// The iteration budget ran out before the tolerance was met.
    Exhausted,
}

impl Status {
    /// `true` only for [`Status::Converged`].
    pub fn is_converged(self) -> bool {
        matches!(self, Status::Converged)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Status::Converged => write!(f, "converged"),
            Status::Singular => write!(f, "singular system"),
            Status::Exhausted => write!(f, "did not converge"),
        }
    }
}

/// Position estimate returned by the `solve` functions.
///
/// An estimate is returned for every stopping condition, not only on
/// convergence. On [`Status::Singular`] the position is the one held
/// *before* the failed update; on [`Status::Exhausted`] it is the one
/// *after* the last completed update. Callers wanting to rank estimates
/// obtained from different starting points can compare them with
/// [`residual_norm`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Estimate {
    /// Estimated position.
    pub position: [f64; 3],
    /// Completed iterations, counting the one that converged.
    pub iterations: usize,
    /// Stopping condition.
    pub status: Status,
}

/// Iteration controls for [`solve_with`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Params {
    /// Upper bound on refinement iterations.
    pub max_iters: usize,
    /// Update-step norm below which the estimate is accepted.
    pub tol: f64,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            max_iters: 100,
            tol: 1e-6,
        }
    }
}

/// Estimate the position whose distances to the three `anchors` match
/// `distances`, refining `initial_guess` under the default [`Params`]
/// (100 iterations, tolerance `1e-6`).
///
/// `distances` correspond to `anchors` in order. Both must have exactly
/// [`ANCHOR_COUNT`] elements; anything else is rejected with
/// [`InvalidInput`] before any iteration.
///
/// ```
/// let anchors = [
///     [0.0, 0.0, 1000.0],
///     [1000.0, 0.0, 1200.0],
///     [500.0, 800.0, 1100.0],
/// ];
/// let distances = [950.0, 1200.0, 850.0];
///
/// let estimate = trilateration::newton::solve(&anchors, &distances, [500.0, 500.0, 500.0])?;
/// assert!(estimate.position.iter().all(|c| c.is_finite()));
/// # Ok::<(), trilateration::newton::InvalidInput>(())
/// ```
pub fn solve(
    anchors: &[[f64; 3]],
    distances: &[f64],
    initial_guess: [f64; 3],
) -> Result<Estimate, InvalidInput> {
    solve_with(anchors, distances, initial_guess, &Params::default())
}

/// Same as [`solve`] with explicit iteration controls.
///
/// Each iteration linearizes the squared-distance equations around the
/// current estimate `x`:
///
/// - Jacobian row `i`: `2 * (x - p_i)`
/// - residual entry `i`: `|x - p_i|^2 - d_i^2`
///
/// and solves `J * delta = -residual` for the update step. The loop stops
/// as soon as one of three conditions holds:
///
/// - the applied step satisfies `|delta| < tol` ([`Status::Converged`],
///   the step is kept);
/// - the system is singular, from degenerate reference geometry relative
///   to the current estimate ([`Status::Singular`], the estimate from
///   before this iteration is returned);
/// - `max_iters` updates were applied without meeting the tolerance
///   ([`Status::Exhausted`]).
pub fn solve_with(
    anchors: &[[f64; 3]],
    distances: &[f64],
    initial_guess: [f64; 3],
    params: &Params,
) -> Result<Estimate, InvalidInput> {
    check_cardinality(anchors, distances)?;
    params.check()?;

    let anchors = anchor_vectors(anchors);
    let mut x_est = Vec3::from(initial_guess);

    for iteration in 1..=params.max_iters {
        let (jacobian, residual) = linearize(&anchors, distances, &x_est);

        // Direct LU solve of J * delta = -residual. A rank-deficient
        // Jacobian (collinear anchors, or an estimate on the anchor plane)
        // ends refinement with the estimate held before this iteration.
        let delta = if jacobian.determinant().abs() < DET_EPSILON {
            None
        } else {
            jacobian.lu().solve(&(-residual))
        };
        let delta = delta.filter(|step| step.iter().all(|c| c.is_finite()));
        let Some(delta) = delta else {
            tracing::warn!(iteration, "singular system, keeping last estimate");
            return Ok(Estimate {
                position: x_est.into(),
                iterations: iteration - 1,
                status: Status::Singular,
            });
        };

        x_est += delta;

        if delta.norm() < params.tol {
            tracing::debug!(iterations = iteration, "converged");
            return Ok(Estimate {
                position: x_est.into(),
                iterations: iteration,
                status: Status::Converged,
            });
        }
    }

    tracing::debug!(
        max_iters = params.max_iters,
        "iteration budget exhausted before convergence"
    );
    Ok(Estimate {
        position: x_est.into(),
        iterations: params.max_iters,
        status: Status::Exhausted,
    })
}

/// Euclidean norm of the squared-distance residual vector at `position`.
///
/// This is the quantity the solver drives toward zero. It lets callers
/// compare candidate estimates, e.g. when retrying a non-converged solve
/// from a different initial guess.
pub fn residual_norm(
    anchors: &[[f64; 3]],
    distances: &[f64],
    position: [f64; 3],
) -> Result<f64, InvalidInput> {
    check_cardinality(anchors, distances)?;
    let anchors = anchor_vectors(anchors);
    let (_, residual) = linearize(&anchors, distances, &Vec3::from(position));
    Ok(residual.norm())
}

// Private functions ###########################################################

/// Determinant magnitude below which the Jacobian is treated as singular.
const DET_EPSILON: f64 = 1e-12;

impl Params {
    fn check(&self) -> Result<(), InvalidInput> {
        if self.max_iters == 0 {
            return Err(InvalidInput::ZeroMaxIters);
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(InvalidInput::NonPositiveTol(self.tol));
        }
        Ok(())
    }
}

fn check_cardinality(anchors: &[[f64; 3]], distances: &[f64]) -> Result<(), InvalidInput> {
    if anchors.len() != ANCHOR_COUNT {
        return Err(InvalidInput::AnchorCount(anchors.len()));
    }
    if distances.len() != ANCHOR_COUNT {
        return Err(InvalidInput::DistanceCount(distances.len()));
    }
    Ok(())
}

/// Cardinality must have been checked by the caller.
fn anchor_vectors(anchors: &[[f64; 3]]) -> [Vec3; ANCHOR_COUNT] {
    [
        Vec3::from(anchors[0]),
        Vec3::from(anchors[1]),
        Vec3::from(anchors[2]),
    ]
}

/// Build the linearization of the squared-distance equations around
/// `x_est`: one Jacobian row and one residual entry per reference point.
fn linearize(anchors: &[Vec3; ANCHOR_COUNT], distances: &[f64], x_est: &Vec3) -> (Mat3, Vec3) {
    let mut jacobian = Mat3::zeros();
    let mut residual = Vec3::zeros();
    for (i, (anchor, distance)) in anchors.iter().zip(distances).enumerate() {
        let diff = x_est - anchor;
        jacobian.set_row(i, &(diff * 2.0).transpose());
        residual[i] = diff.norm_squared() - distance * distance;
    }
    (jacobian, residual)
}

// Tests #######################################################################

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON_APPROX: f64 = 1e-4;

    fn exact_distances(anchors: &[[f64; 3]; ANCHOR_COUNT], truth: [f64; 3]) -> [f64; ANCHOR_COUNT] {
        let truth = Vec3::from(truth);
        anchors.map(|a| (truth - Vec3::from(a)).norm())
    }

    #[test]
    fn recovers_known_position() {
        let anchors = [[0.0, 0.0, 0.0], [100.0, 0.0, 10.0], [40.0, 80.0, -20.0]];
        let truth = [30.0, 40.0, 25.0];
        let distances = exact_distances(&anchors, truth);

        let estimate = solve(&anchors, &distances, [25.0, 45.0, 20.0]).unwrap();

        assert_eq!(estimate.status, Status::Converged);
        for (estimated, expected) in estimate.position.iter().zip(&truth) {
            assert_relative_eq!(*estimated, *expected, epsilon = EPSILON_APPROX);
        }
    }

    #[test]
    fn rejects_wrong_anchor_count() {
        let distances = [1.0, 2.0, 3.0];

        assert_eq!(
            solve(&[[0.0; 3]; 2], &distances, [0.0; 3]),
            Err(InvalidInput::AnchorCount(2))
        );
        assert_eq!(
            solve(&[[0.0; 3]; 4], &distances, [0.0; 3]),
            Err(InvalidInput::AnchorCount(4))
        );
        assert!(InvalidInput::AnchorCount(2)
            .to_string()
            .starts_with("requires exactly 3 reference points"));
    }

    #[test]
    fn rejects_mismatched_distance_count() {
        let anchors = [[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

        assert_eq!(
            solve(&anchors, &[1.0, 2.0], [0.0; 3]),
            Err(InvalidInput::DistanceCount(2))
        );
    }

    #[test]
    fn rejects_invalid_params() {
        let anchors = [[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let distances = [1.0, 1.0, 1.0];

        let no_iters = Params {
            max_iters: 0,
            ..Params::default()
        };
        assert_eq!(
            solve_with(&anchors, &distances, [0.0; 3], &no_iters),
            Err(InvalidInput::ZeroMaxIters)
        );

        for tol in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let params = Params {
                tol,
                ..Params::default()
            };
            assert!(matches!(
                solve_with(&anchors, &distances, [0.0; 3], &params),
                Err(InvalidInput::NonPositiveTol(_))
            ));
        }
    }

    #[test]
    fn collinear_anchors_are_singular() {
        let anchors = [[0.0; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        let guess = [0.5, 0.5, 0.5];

        let estimate = solve(&anchors, &[1.0, 1.0, 1.0], guess).unwrap();

        assert_eq!(estimate.status, Status::Singular);
        assert_eq!(estimate.iterations, 0);
        assert_eq!(estimate.position, guess);
    }

    #[test]
    fn exhausts_single_iteration_budget() {
        let anchors = [[0.0, 0.0, 1000.0], [1000.0, 0.0, 1200.0], [500.0, 800.0, 1100.0]];
        let distances = [950.0, 1200.0, 850.0];
        let guess = [-4000.0, 3000.0, -2500.0];
        let params = Params {
            max_iters: 1,
            ..Params::default()
        };

        let estimate = solve_with(&anchors, &distances, guess, &params).unwrap();

        assert_eq!(estimate.status, Status::Exhausted);
        assert_eq!(estimate.iterations, 1);
        // The single update is applied and returned, not discarded.
        assert_ne!(estimate.position, guess);
        assert!(estimate.position.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn residual_norm_does_not_increase_near_solution() {
        let anchors = [[0.0, 0.0, 0.0], [100.0, 0.0, 10.0], [40.0, 80.0, -20.0]];
        let truth = [30.0, 40.0, 25.0];
        let distances = exact_distances(&anchors, truth);
        let guess = [33.0, 37.0, 28.0];

        let mut norms = vec![residual_norm(&anchors, &distances, guess).unwrap()];
        for max_iters in 1..=4 {
            let params = Params {
                max_iters,
                ..Params::default()
            };
            let estimate = solve_with(&anchors, &distances, guess, &params).unwrap();
            norms.push(residual_norm(&anchors, &distances, estimate.position).unwrap());
        }

        for pair in norms.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-9, "residual increased: {:?}", pair);
        }
        assert!(norms[4] < norms[0]);
    }

    #[test]
    fn reference_scenario_terminates_and_reproduces() {
        let anchors = [[0.0, 0.0, 1000.0], [1000.0, 0.0, 1200.0], [500.0, 800.0, 1100.0]];
        let distances = [950.0, 1200.0, 850.0];
        let guess = [500.0, 500.0, 500.0];

        let first = solve(&anchors, &distances, guess).unwrap();
        let second = solve(&anchors, &distances, guess).unwrap();

        assert!(matches!(first.status, Status::Converged | Status::Exhausted));
        assert!(first.position.iter().all(|c| c.is_finite()));
        // Bit-identical across runs.
        assert_eq!(first, second);
    }
}
