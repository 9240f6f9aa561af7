//! Equation solving for the decoder.
//!
//! A block turns into a system `A x = b` where `A[c][f]` is the number of
//! times flow `f` was hashed into non-empty cell `c`. The decoder asks an
//! [`EquationSolver`] for the non-negative `x` with the smallest sum.

use std::fmt::Debug;

use nalgebra as na;
use na::{DMatrix, DVector};
use tracing::trace;

use crate::error::{RadarError, RadarResult};

mod simplex;

use simplex::{minimize_sum, SimplexFailure};

/// Sparse description of one block's equations.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationSystem {
    pub num_vars: usize,
    /// For every equation, the participating variables. A variable listed
    /// twice has coefficient 2.
    pub rows: Vec<Vec<usize>>,
    pub rhs: Vec<f64>,
}

impl EquationSystem {
    pub fn new(num_vars: usize) -> EquationSystem {
        EquationSystem {
            num_vars,
            rows: Vec::new(),
            rhs: Vec::new(),
        }
    }

    pub fn push(&mut self, vars: Vec<usize>, value: f64) {
        self.rows.push(vars);
        self.rhs.push(value);
    }

    pub fn num_equations(&self) -> usize {
        self.rows.len()
    }

    pub fn matrix(&self) -> DMatrix<f64> {
        let mut a = DMatrix::zeros(self.rows.len(), self.num_vars);
        for (i, row) in self.rows.iter().enumerate() {
            for &j in row {
                a[(i, j)] += 1.0;
            }
        }
        a
    }

    pub fn vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.rhs)
    }

    /// Largest absolute equation error of `x`.
    pub fn residual(&self, x: &[f64]) -> f64 {
        self.rows
            .iter()
            .zip(&self.rhs)
            .map(|(row, b)| (row.iter().map(|&j| x[j]).sum::<f64>() - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Result of a solve that did not fail internally.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    Solved(Vec<f64>),
    Infeasible(String),
}

/// Finds the minimum-sum non-negative solution of an [`EquationSystem`].
pub trait EquationSolver: Send + Sync + Debug {
    fn solve(&self, system: &EquationSystem) -> RadarResult<SolveOutcome>;
}

/// Default solver: least squares when the system pins every variable,
/// simplex otherwise.
#[derive(Debug, Clone, Copy)]
pub struct SimplexSolver {
    pub least_squares_fast_path: bool,
}

impl Default for SimplexSolver {
    fn default() -> Self {
        SimplexSolver {
            least_squares_fast_path: true,
        }
    }
}

impl SimplexSolver {
    /// Unique solution via `lstsq` if `A` has full column rank and the
    /// solution is exact and non-negative.
    fn exact_solve(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
        if a.nrows() < a.ncols() {
            return None;
        }
        let result = lstsq::lstsq(a, b, 1e-12).ok()?;
        if result.rank < a.ncols() {
            return None;
        }
        let x = result.solution;
        let error = (a * &x - b).amax();
        if error > 1e-6 || x.iter().any(|v| *v < -1e-6) {
            return None;
        }
        Some(x.map(|v| v.max(0.0)))
    }
}

impl EquationSolver for SimplexSolver {
    fn solve(&self, system: &EquationSystem) -> RadarResult<SolveOutcome> {
        if system.num_vars == 0 {
            return Ok(match system.rhs.iter().find(|b| **b != 0.0) {
                None => SolveOutcome::Solved(Vec::new()),
                Some(b) => {
                    SolveOutcome::Infeasible(format!("no variables for observed count {}", b))
                }
            });
        }

        // work on a system scaled to unit magnitude, byte counts would
        // otherwise swamp the tolerances
        let scale = system.rhs.iter().map(|v| v.abs()).fold(0.0, f64::max);
        if scale == 0.0 {
            return Ok(SolveOutcome::Solved(vec![0.0; system.num_vars]));
        }
        let a = system.matrix();
        let b = system.vector() / scale;

        if self.least_squares_fast_path {
            if let Some(x) = self.exact_solve(&a, &b) {
                trace!(
                    vars = system.num_vars,
                    rows = system.num_equations(),
                    "solved by least squares"
                );
                return Ok(SolveOutcome::Solved(x.iter().map(|v| v * scale).collect()));
            }
        }

        match minimize_sum(&a, &b) {
            Ok(x) => {
                trace!(vars = system.num_vars, rows = system.num_equations(), "solved by simplex");
                Ok(SolveOutcome::Solved(x.iter().map(|v| v * scale).collect()))
            }
            Err(SimplexFailure::Infeasible(gap)) => Ok(SolveOutcome::Infeasible(format!(
                "artificial sum {:.3e} left after phase one",
                gap * scale
            ))),
            Err(SimplexFailure::Unbounded) => {
                Err(RadarError::Solver("unbounded system".to_string()))
            }
            Err(SimplexFailure::IterationLimit(n)) => {
                Err(RadarError::Solver(format!("no optimum after {} pivots", n)))
            }
        }
    }
}
