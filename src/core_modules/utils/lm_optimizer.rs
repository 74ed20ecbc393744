//! Levenberg-Marquardt least squares for small one-dimensional curve models.
//!
//! Uses f64 throughout; parameter vectors are fixed-size arrays.

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Converged once every parameter step is below this, relative to the parameter.
    pub parameter_tolerance: f64,
    /// Converged once an accepted step lowers chi² by less than this fraction.
    pub chi2_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            parameter_tolerance: 1e-10,
            chi2_tolerance: 1e-14,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LmResult<const N: usize> {
    pub params: [f64; N],
    pub chi2: f64,
    pub converged: bool,
    pub iterations: usize,
}

/// A model `y = f(x; params)` that can be fit with L-M optimization.
pub trait LmModel<const N: usize> {
    fn evaluate(&self, x: f64, params: &[f64; N]) -> f64;

    /// Partial derivatives of `evaluate` with respect to each parameter.
    fn jacobian_row(&self, x: f64, params: &[f64; N]) -> [f64; N];

    /// Apply parameter constraints after an update.
    fn constrain(&self, _params: &mut [f64; N]) {}
}

/// Minimises the squared residuals of `model` over `(data_x, data_y)`.
pub fn optimize<const N: usize, M: LmModel<N>>(
    model: &M,
    data_x: &[f64],
    data_y: &[f64],
    initial_params: [f64; N],
    config: &LmConfig,
) -> LmResult<N> {
    let mut params = initial_params;
    let mut lambda = config.initial_lambda;
    let mut prev_chi2 = compute_chi2(model, data_x, data_y, &params);
    let mut converged = false;
    let mut iterations = 0;

    // An exact fit from the start needs no iterations.
    let scale: f64 = data_y.iter().map(|y| y * y).sum();
    if prev_chi2 <= f64::EPSILON * scale {
        return LmResult {
            params,
            chi2: prev_chi2,
            converged: prev_chi2.is_finite(),
            iterations,
        };
    }

    let mut jacobian = Vec::with_capacity(data_x.len());
    let mut residuals = Vec::with_capacity(data_x.len());

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        jacobian.clear();
        residuals.clear();
        for (&x, &y) in data_x.iter().zip(data_y) {
            jacobian.push(model.jacobian_row(x, &params));
            residuals.push(y - model.evaluate(x, &params));
        }
        let (hessian, gradient) = compute_hessian_gradient(&jacobian, &residuals);

        let mut damped_hessian = hessian;
        for (i, row) in damped_hessian.iter_mut().enumerate() {
            row[i] *= 1.0 + lambda;
        }

        let Some(delta) = solve(&damped_hessian, &gradient) else {
            break;
        };

        let mut new_params = params;
        for (p, d) in new_params.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        model.constrain(&mut new_params);

        let new_chi2 = compute_chi2(model, data_x, data_y, &new_params);

        if new_chi2 < prev_chi2 {
            let reduction = (prev_chi2 - new_chi2) / prev_chi2;
            params = new_params;
            lambda *= config.lambda_down;
            prev_chi2 = new_chi2;

            let small_step = params
                .iter()
                .zip(delta.iter())
                .all(|(p, d)| d.abs() <= config.parameter_tolerance * (p.abs() + config.parameter_tolerance));
            if small_step || reduction < config.chi2_tolerance || new_chi2 <= f64::EPSILON * scale {
                converged = true;
                break;
            }
        } else {
            lambda *= config.lambda_up;
            if lambda > 1e10 {
                break;
            }
        }
    }

    LmResult {
        params,
        chi2: prev_chi2,
        converged,
        iterations,
    }
}

fn compute_chi2<const N: usize, M: LmModel<N>>(model: &M, data_x: &[f64], data_y: &[f64], params: &[f64; N]) -> f64 {
    data_x
        .iter()
        .zip(data_y)
        .map(|(&x, &y)| {
            let residual = y - model.evaluate(x, params);
            residual * residual
        })
        .sum()
}

/// Hessian approximation (JᵀJ) and gradient (Jᵀr).
#[allow(clippy::needless_range_loop)]
fn compute_hessian_gradient<const N: usize>(jacobian: &[[f64; N]], residuals: &[f64]) -> ([[f64; N]; N], [f64; N]) {
    let mut hessian = [[0.0f64; N]; N];
    let mut gradient = [0.0f64; N];

    for (row, &r) in jacobian.iter().zip(residuals) {
        for i in 0..N {
            gradient[i] += row[i] * r;
            for j in i..N {
                hessian[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 1..N {
        for j in 0..i {
            hessian[i][j] = hessian[j][i];
        }
    }

    (hessian, gradient)
}

/// Gaussian elimination with partial pivoting. `None` when the system is
/// singular relative to its largest entry.
#[allow(clippy::needless_range_loop)]
fn solve<const N: usize>(a: &[[f64; N]; N], b: &[f64; N]) -> Option<[f64; N]> {
    let mut matrix = *a;
    let mut rhs = *b;
    let largest = matrix
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0f64, |m, v| m.max(v.abs()));
    if !largest.is_finite() || largest == 0.0 {
        return None;
    }
    let tolerance = largest * 1e-15;

    for col in 0..N {
        let mut max_row = col;
        let mut max_val = matrix[col][col].abs();
        for row in (col + 1)..N {
            if matrix[row][col].abs() > max_val {
                max_val = matrix[row][col].abs();
                max_row = row;
            }
        }
        if !(max_val > tolerance) {
            return None;
        }
        if max_row != col {
            matrix.swap(col, max_row);
            rhs.swap(col, max_row);
        }

        for row in (col + 1)..N {
            let factor = matrix[row][col] / matrix[col][col];
            let pivot_row = matrix[col];
            for (j, m) in matrix[row].iter_mut().enumerate().skip(col) {
                *m -= factor * pivot_row[j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        let mut sum = rhs[i];
        for (j, &xj) in x.iter().enumerate().skip(i + 1) {
            sum -= matrix[i][j] * xj;
        }
        x[i] = sum / matrix[i][i];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Line;

    impl LmModel<2> for Line {
        fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
            params[0] * x + params[1]
        }

        fn jacobian_row(&self, x: f64, _params: &[f64; 2]) -> [f64; 2] {
            [x, 1.0]
        }
    }

    struct Exponential;

    impl LmModel<2> for Exponential {
        fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
            params[0] * (params[1] * x).exp()
        }

        fn jacobian_row(&self, x: f64, params: &[f64; 2]) -> [f64; 2] {
            let e = (params[1] * x).exp();
            [e, params[0] * x * e]
        }
    }

    #[test]
    fn fits_a_line_exactly() {
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.5 * x - 1.0).collect();
        let result = optimize(&Line, &xs, &ys, [0.0, 0.0], &LmConfig::default());
        assert!(result.converged);
        assert!((result.params[0] - 2.5).abs() < 1e-6);
        assert!((result.params[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn fits_a_nonlinear_model_from_a_rough_start() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * (0.4 * x).exp()).collect();
        let result = optimize(&Exponential, &xs, &ys, [1.0, 0.1], &LmConfig::default());
        assert!(result.converged);
        assert!((result.params[0] - 3.0).abs() < 1e-4);
        assert!((result.params[1] - 0.4).abs() < 1e-5);
    }

    #[test]
    fn solver_rejects_singular_systems() {
        assert!(solve(&[[1.0, 2.0], [2.0, 4.0]], &[1.0, 2.0]).is_none());
        let x = solve(&[[2.0, 1.0], [1.0, 3.0]], &[3.0, 5.0]).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
    }
}
