//! Box-constrained limited-memory BFGS
//!
//! Projected L-BFGS with a backtracking Armijo line search. The iterate is
//! kept inside `[lower, upper]` by clipping every trial point, and the
//! search direction is masked on active bounds. A direction that fails to
//! descend drops the curvature history and falls back to steepest descent.

use super::Objective;
use crate::errors::{FwiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Sufficient decrease constant
const ARMIJO_C1: f64 = 1e-4;
/// Step reduction per rejected trial
const BACKTRACK: f64 = 0.5;
/// First steepest-descent step moves at most this share of the box width
const INITIAL_STEP_FRACTION: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct LbfgsConfig {
    /// Outer iterations
    pub max_iter: usize,
    /// Objective calls of any kind
    pub max_feval: usize,
    /// Correction pairs kept
    pub memory: usize,
    /// Trial points per line search
    pub max_line_search: usize,
    /// Stop when the projected gradient falls below this (max norm)
    pub gtol: f64,
    /// Evaluate trial points with `value` and fetch the gradient afterwards
    pub value_only_line_search: bool,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            max_iter: 20,
            max_feval: usize::MAX,
            memory: 10,
            max_line_search: 20,
            gtol: 1e-10,
            value_only_line_search: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Converged,
    MaxIterations,
    MaxEvaluations,
    LineSearchFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LbfgsResult {
    pub x: Vec<f32>,
    pub f: f64,
    /// Gradient at the starting point
    pub initial_gradient: Vec<f32>,
    pub n_iter: usize,
    pub n_feval: usize,
    pub stop: StopReason,
}

impl LbfgsResult {
    pub fn converged(&self) -> bool {
        self.stop == StopReason::Converged
    }
}

struct Evaluator<'o, O: Objective + ?Sized> {
    objective: &'o mut O,
    n_feval: usize,
    max_feval: usize,
}

impl<'o, O: Objective + ?Sized> Evaluator<'o, O> {
    fn exhausted(&self) -> bool {
        self.n_feval >= self.max_feval
    }

    async fn value_and_gradient(&mut self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.n_feval += 1;
        let (f, g) = self.objective.value_and_gradient(&to_f32(x)).await?;
        Ok((f, check_gradient(g, x.len())?))
    }

    async fn value(&mut self, x: &[f64]) -> Result<f64> {
        self.n_feval += 1;
        self.objective.value(&to_f32(x)).await
    }

    async fn gradient(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        self.n_feval += 1;
        let g = self.objective.gradient(&to_f32(x)).await?;
        check_gradient(g, x.len())
    }
}

/// Minimize `objective` over the box `[lower, upper]` starting from `x0`.
pub async fn minimize<O: Objective + ?Sized>(
    objective: &mut O,
    x0: &[f32],
    lower: f32,
    upper: f32,
    config: &LbfgsConfig,
) -> Result<LbfgsResult> {
    if x0.is_empty() {
        return Err(FwiError::Solver("empty starting point".to_string()));
    }
    if lower.is_nan() || upper.is_nan() || lower > upper {
        return Err(FwiError::Solver(format!(
            "invalid bounds [{}, {}]",
            lower, upper
        )));
    }
    let (lo, hi) = (lower as f64, upper as f64);

    let mut eval = Evaluator {
        objective,
        n_feval: 0,
        max_feval: config.max_feval.max(1),
    };
    let mut x: Vec<f64> = x0.iter().map(|&v| (v as f64).clamp(lo, hi)).collect();
    let (mut f, mut g) = eval.value_and_gradient(&x).await?;
    let initial_gradient = to_f32(&g);
    let mut history: VecDeque<(Vec<f64>, Vec<f64>)> = VecDeque::with_capacity(config.memory);

    info!(objective = f, n = x.len(), "L-BFGS started");

    let mut n_iter = 0;
    let stop = loop {
        if projected_gradient_norm(&x, &g, lo, hi) <= config.gtol {
            break StopReason::Converged;
        }
        if n_iter >= config.max_iter {
            break StopReason::MaxIterations;
        }
        if eval.exhausted() {
            break StopReason::MaxEvaluations;
        }

        let mut d = two_loop(&g, &history);
        mask_active(&mut d, &x, lo, hi);
        if dot(&g, &d) >= 0.0 {
            debug!(iteration = n_iter, "Not a descent direction, restarting from steepest descent");
            history.clear();
            d = g.iter().map(|v| -v).collect();
            mask_active(&mut d, &x, lo, hi);
        }
        if dot(&g, &d) >= 0.0 {
            break StopReason::Converged;
        }

        let mut alpha = if history.is_empty() {
            initial_step(&d, lo, hi)
        } else {
            1.0
        };

        // backtracking Armijo search along the projected path
        let mut accepted = None;
        for _ in 0..config.max_line_search.max(1) {
            if eval.exhausted() {
                break;
            }
            let trial: Vec<f64> = x
                .iter()
                .zip(&d)
                .map(|(xi, di)| (xi + alpha * di).clamp(lo, hi))
                .collect();
            let step: Vec<f64> = trial.iter().zip(&x).map(|(a, b)| a - b).collect();
            let decrease = dot(&g, &step).min(0.0);

            let (f_trial, g_trial) = if config.value_only_line_search {
                (eval.value(&trial).await?, None)
            } else {
                let (ft, gt) = eval.value_and_gradient(&trial).await?;
                (ft, Some(gt))
            };

            if f_trial <= f + ARMIJO_C1 * decrease {
                accepted = Some((trial, step, f_trial, g_trial));
                break;
            }
            debug!(iteration = n_iter, alpha, f_trial, "Trial step rejected");
            alpha *= BACKTRACK;
        }

        let Some((trial, step, f_new, g_new)) = accepted else {
            warn!(iteration = n_iter, objective = f, "Line search failed to decrease the objective");
            break if eval.exhausted() {
                StopReason::MaxEvaluations
            } else {
                StopReason::LineSearchFailed
            };
        };
        let g_new = match g_new {
            Some(g_new) => g_new,
            None => eval.gradient(&trial).await?,
        };

        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&step, &y);
        if sy > f64::EPSILON * norm(&step) * norm(&y) {
            if history.len() == config.memory {
                history.pop_front();
            }
            if config.memory > 0 {
                history.push_back((step, y));
            }
        }

        x = trial;
        f = f_new;
        g = g_new;
        n_iter += 1;
        info!(
            iteration = n_iter,
            objective = f,
            evaluations = eval.n_feval,
            "L-BFGS iteration"
        );
    };

    info!(
        ?stop,
        objective = f,
        iterations = n_iter,
        evaluations = eval.n_feval,
        "L-BFGS finished"
    );
    Ok(LbfgsResult {
        x: to_f32(&x),
        f,
        initial_gradient,
        n_iter,
        n_feval: eval.n_feval,
        stop,
    })
}

/// `-H g` from the stored correction pairs
fn two_loop(g: &[f64], history: &VecDeque<(Vec<f64>, Vec<f64>)>) -> Vec<f64> {
    let mut q: Vec<f64> = g.to_vec();
    let mut alphas = Vec::with_capacity(history.len());

    for (s, y) in history.iter().rev() {
        let rho = 1.0 / dot(y, s);
        let a = rho * dot(s, &q);
        q.iter_mut().zip(y).for_each(|(qi, yi)| *qi -= a * yi);
        alphas.push((rho, a));
    }

    if let Some((s, y)) = history.back() {
        let gamma = dot(s, y) / dot(y, y);
        q.iter_mut().for_each(|qi| *qi *= gamma);
    }

    for ((s, y), (rho, a)) in history.iter().zip(alphas.into_iter().rev()) {
        let b = rho * dot(y, &q);
        q.iter_mut().zip(s).for_each(|(qi, si)| *qi += (a - b) * si);
    }

    q.iter_mut().for_each(|qi| *qi = -*qi);
    q
}

/// Zero components that would push through an active bound.
fn mask_active(d: &mut [f64], x: &[f64], lo: f64, hi: f64) {
    for (di, &xi) in d.iter_mut().zip(x) {
        if (xi <= lo && *di < 0.0) || (xi >= hi && *di > 0.0) {
            *di = 0.0;
        }
    }
}

fn initial_step(d: &[f64], lo: f64, hi: f64) -> f64 {
    let d_max = d.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let width = hi - lo;
    if d_max > 0.0 && width > 0.0 {
        INITIAL_STEP_FRACTION * width / d_max
    } else {
        1.0
    }
}

fn projected_gradient_norm(x: &[f64], g: &[f64], lo: f64, hi: f64) -> f64 {
    x.iter()
        .zip(g)
        .map(|(xi, gi)| ((xi - gi).clamp(lo, hi) - xi).abs())
        .fold(0.0, f64::max)
}

fn check_gradient(g: Vec<f32>, n: usize) -> Result<Vec<f64>> {
    if g.len() != n {
        return Err(FwiError::Shape(format!(
            "gradient has {} entries for {} unknowns",
            g.len(),
            n
        )));
    }
    Ok(g.into_iter().map(f64::from).collect())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn to_f32(x: &[f64]) -> Vec<f32> {
    x.iter().map(|&v| v as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// `sum w_i (x_i - c_i)^2 / 2`
    struct Quadratic {
        center: Vec<f64>,
        weights: Vec<f64>,
        calls: usize,
        value_calls: usize,
    }

    impl Quadratic {
        fn new(center: Vec<f64>, weights: Vec<f64>) -> Self {
            Self {
                center,
                weights,
                calls: 0,
                value_calls: 0,
            }
        }

        fn eval(&self, x: &[f32]) -> (f64, Vec<f32>) {
            let mut f = 0.0;
            let mut g = Vec::with_capacity(x.len());
            for ((xi, ci), wi) in x.iter().zip(&self.center).zip(&self.weights) {
                let r = *xi as f64 - ci;
                f += 0.5 * wi * r * r;
                g.push((wi * r) as f32);
            }
            (f, g)
        }
    }

    #[async_trait]
    impl Objective for Quadratic {
        async fn value_and_gradient(&mut self, x: &[f32]) -> Result<(f64, Vec<f32>)> {
            self.calls += 1;
            Ok(self.eval(x))
        }

        async fn value(&mut self, x: &[f32]) -> Result<f64> {
            self.calls += 1;
            self.value_calls += 1;
            Ok(self.eval(x).0)
        }

        async fn gradient(&mut self, x: &[f32]) -> Result<Vec<f32>> {
            self.calls += 1;
            Ok(self.eval(x).1)
        }
    }

    #[tokio::test]
    async fn test_unconstrained_minimum_inside_box() {
        let mut objective = Quadratic::new(vec![0.3, 0.5, 0.2], vec![1.0, 4.0, 10.0]);
        let config = LbfgsConfig {
            max_iter: 100,
            gtol: 1e-5,
            ..Default::default()
        };
        let result = minimize(&mut objective, &[0.1, 0.1, 0.1], 0.0, 1.0, &config)
            .await
            .unwrap();

        assert!(result.converged());
        for (x, c) in result.x.iter().zip([0.3, 0.5, 0.2]) {
            assert!((*x as f64 - c).abs() < 1e-3, "{} vs {}", x, c);
        }
        assert_eq!(result.n_feval, objective.calls);
    }

    #[tokio::test]
    async fn test_solution_respects_bounds() {
        let mut objective = Quadratic::new(vec![-1.0, 0.5, 3.0], vec![1.0, 1.0, 1.0]);
        let config = LbfgsConfig {
            max_iter: 100,
            gtol: 1e-6,
            ..Default::default()
        };
        let result = minimize(&mut objective, &[0.5, 0.9, 0.1], 0.0, 1.0, &config)
            .await
            .unwrap();

        assert!(result.x.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(result.x[0].abs() < 1e-6);
        assert!((result.x[1] - 0.5).abs() < 1e-3);
        assert!((result.x[2] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_iteration_and_evaluation_limits() {
        let config = LbfgsConfig {
            max_iter: 2,
            ..Default::default()
        };
        let mut objective = Quadratic::new(vec![0.9; 4], vec![1.0, 3.0, 9.0, 27.0]);
        let result = minimize(&mut objective, &[0.1; 4], 0.0, 1.0, &config).await.unwrap();
        assert_eq!(result.stop, StopReason::MaxIterations);
        assert_eq!(result.n_iter, 2);

        let config = LbfgsConfig {
            max_iter: 100,
            max_feval: 3,
            ..Default::default()
        };
        let mut objective = Quadratic::new(vec![0.9; 4], vec![1.0, 3.0, 9.0, 27.0]);
        let result = minimize(&mut objective, &[0.1; 4], 0.0, 1.0, &config).await.unwrap();
        assert_eq!(result.stop, StopReason::MaxEvaluations);
        assert!(objective.calls <= 3);
    }

    #[tokio::test]
    async fn test_value_only_line_search() {
        let config = LbfgsConfig {
            max_iter: 5,
            value_only_line_search: true,
            ..Default::default()
        };
        let mut objective = Quadratic::new(vec![0.4, 0.6], vec![1.0, 2.0]);
        let start = objective.eval(&[0.1, 0.1]).0;
        let result = minimize(&mut objective, &[0.1, 0.1], 0.0, 1.0, &config).await.unwrap();

        assert!(objective.value_calls > 0);
        assert!(result.f < start);
        assert_eq!(result.initial_gradient.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let mut objective = Quadratic::new(vec![0.0], vec![1.0]);
        let config = LbfgsConfig::default();
        assert!(minimize(&mut objective, &[], 0.0, 1.0, &config).await.is_err());
        assert!(minimize(&mut objective, &[0.5], 1.0, 0.0, &config).await.is_err());
    }

    #[test]
    fn test_two_loop_without_history_is_steepest_descent() {
        let d = two_loop(&[1.0, -2.0], &VecDeque::new());
        assert_eq!(d, vec![-1.0, 2.0]);
    }
}
