//! Dense two-phase simplex for `min sum(x)` subject to `A x = b`, `x >= 0`.
//!
//! Entering and leaving variables follow Bland's rule, so the method cannot
//! cycle and a given system always yields the same vertex.

use nalgebra as na;
use na::{DMatrix, DVector};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SimplexFailure {
    /// Phase one ended with a positive artificial sum.
    Infeasible(f64),
    Unbounded,
    IterationLimit(usize),
}

struct Tableau {
    t: DMatrix<f64>,
    basis: Vec<usize>,
    m: usize,
    n: usize,
}

impl Tableau {
    fn rhs(&self) -> usize {
        self.n + self.m
    }

    fn pivot(&mut self, r: usize, c: usize) {
        let cols = self.t.ncols();
        let p = self.t[(r, c)];
        for j in 0..cols {
            self.t[(r, j)] /= p;
        }
        for i in 0..=self.m {
            if i == r {
                continue;
            }
            let f = self.t[(i, c)];
            if f == 0.0 {
                continue;
            }
            for j in 0..cols {
                let v = self.t[(r, j)];
                if v != 0.0 {
                    self.t[(i, j)] -= f * v;
                }
            }
            // keep the pivot column exact
            self.t[(i, c)] = 0.0;
        }
        self.basis[r] = c;
    }

    /// Runs simplex iterations on the objective row, only letting columns
    /// below `allowed` enter the basis.
    fn run(&mut self, allowed: usize) -> Result<(), SimplexFailure> {
        let rhs = self.rhs();
        let limit = 50 * (self.m + self.n + 1);
        for _ in 0..limit {
            let entering = match (0..allowed).find(|&j| self.t[(self.m, j)] < -EPS) {
                Some(j) => j,
                None => return Ok(()),
            };
            let mut leaving: Option<(usize, f64)> = None;
            for i in 0..self.m {
                let a = self.t[(i, entering)];
                if a <= EPS {
                    continue;
                }
                let ratio = self.t[(i, rhs)] / a;
                leaving = match leaving {
                    None => Some((i, ratio)),
                    Some((r, best)) => {
                        let tie = (ratio - best).abs() <= EPS && self.basis[i] < self.basis[r];
                        if ratio < best - EPS || tie {
                            Some((i, ratio))
                        } else {
                            Some((r, best))
                        }
                    }
                };
            }
            match leaving {
                Some((r, _)) => self.pivot(r, entering),
                None => return Err(SimplexFailure::Unbounded),
            }
        }
        Err(SimplexFailure::IterationLimit(limit))
    }

    fn set_objective(&mut self, cost: impl Fn(usize) -> f64) {
        let rhs = self.rhs();
        for j in 0..=rhs {
            let mut d = if j == rhs { 0.0 } else { cost(j) };
            for i in 0..self.m {
                let cb = cost(self.basis[i]);
                if cb != 0.0 {
                    d -= cb * self.t[(i, j)];
                }
            }
            self.t[(self.m, j)] = d;
        }
    }
}

/// Solves `min 1^T x` s.t. `A x = b`, `x >= 0`. `b` must be non-negative.
pub(crate) fn minimize_sum(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
) -> Result<DVector<f64>, SimplexFailure> {
    let (m, n) = a.shape();
    let mut t = DMatrix::zeros(m + 1, n + m + 1);
    for i in 0..m {
        let sign = if b[i] < 0.0 { -1.0 } else { 1.0 };
        for j in 0..n {
            t[(i, j)] = sign * a[(i, j)];
        }
        t[(i, n + i)] = 1.0;
        t[(i, n + m)] = sign * b[i];
    }
    let mut tab = Tableau {
        t,
        basis: (n..n + m).collect(),
        m,
        n,
    };

    // phase one: drive the artificial variables to zero
    tab.set_objective(|j| if j >= n { 1.0 } else { 0.0 });
    tab.run(n + m)?;
    let rhs = tab.rhs();
    let artificial: f64 = -tab.t[(m, rhs)];
    let scale = b.iter().map(|v| v.abs()).fold(1.0, f64::max);
    if artificial > 1e-7 * scale {
        return Err(SimplexFailure::Infeasible(artificial));
    }
    for i in 0..m {
        if tab.basis[i] >= n {
            if let Some(j) = (0..n).find(|&j| tab.t[(i, j)].abs() > EPS) {
                tab.pivot(i, j);
            }
        }
    }

    // phase two: minimise the sum over the real columns only
    tab.set_objective(|j| if j < n { 1.0 } else { 0.0 });
    tab.run(n)?;

    let mut x = DVector::zeros(n);
    for i in 0..m {
        let var = tab.basis[i];
        if var < n {
            x[var] = tab.t[(i, rhs)].max(0.0);
        }
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(rows: &[&[f64]], b: &[f64]) -> (DMatrix<f64>, DVector<f64>) {
        let n = rows[0].len();
        let a = DMatrix::from_fn(rows.len(), n, |i, j| rows[i][j]);
        (a, DVector::from_column_slice(b))
    }

    #[test]
    fn test_unique_solution() {
        let (a, b) = system(&[&[1.0, 1.0], &[1.0, 0.0], &[0.0, 1.0]], &[13.0, 10.0, 3.0]);
        let x = minimize_sum(&a, &b).unwrap();
        assert!((x[0] - 10.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_underdetermined_minimum_sum() {
        // x0 + x1 = 4, x1 + x2 = 4: minimum sum is 4 with x1 = 4
        let (a, b) = system(&[&[1.0, 1.0, 0.0], &[0.0, 1.0, 1.0]], &[4.0, 4.0]);
        let x = minimize_sum(&a, &b).unwrap();
        assert!((x.sum() - 4.0).abs() < 1e-9);
        assert!((x[1] - 4.0).abs() < 1e-9);
        assert!(x.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_infeasible() {
        // x0 = 5 and x0 = 3
        let (a, b) = system(&[&[1.0], &[1.0]], &[5.0, 3.0]);
        assert!(matches!(minimize_sum(&a, &b), Err(SimplexFailure::Infeasible(_))));
    }

    #[test]
    fn test_redundant_rows() {
        let (a, b) = system(&[&[1.0, 1.0], &[1.0, 1.0]], &[13.0, 13.0]);
        let x = minimize_sum(&a, &b).unwrap();
        assert!((x.sum() - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_multiplicity_coefficient() {
        // a flow counted twice in the same cell
        let (a, b) = system(&[&[2.0, 1.0], &[0.0, 1.0]], &[7.0, 1.0]);
        let x = minimize_sum(&a, &b).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-9);
        assert!((x[1] - 1.0).abs() < 1e-9);
    }
}
