//! Small dense linear algebra helpers used when re-factoring adapter deltas.
//!
//! Deltas are at most `out x in` of a single layer, so a one-sided Jacobi SVD
//! on host memory is fast enough and keeps the crate free of BLAS/LAPACK.

use candle_core::{DType, Device, Tensor};

use crate::error::{PeftError, Result};

const MAX_SWEEPS: usize = 64;
const EPS: f64 = 1e-12;

/// Truncated singular value decomposition `a ≈ u · diag(s) · vt`.
#[derive(Debug, Clone)]
pub struct Svd {
    /// Left singular vectors, `[m, k]`.
    pub u: Tensor,
    /// Singular values in descending order, `[k]`.
    pub s: Tensor,
    /// Right singular vectors, `[k, n]`.
    pub vt: Tensor,
}

/// Column-major dense matrix.
struct Columns {
    rows: usize,
    data: Vec<Vec<f64>>,
}

impl Columns {
    fn from_rows(rows: &[Vec<f64>], transpose: bool) -> Self {
        let m = rows.len();
        let n = rows.first().map_or(0, Vec::len);
        if transpose {
            // columns of the transpose are the rows
            Self {
                rows: n,
                data: rows.to_vec(),
            }
        } else {
            let data = (0..n)
                .map(|j| rows.iter().map(|r| r[j]).collect())
                .collect();
            Self { rows: m, data }
        }
    }

    fn identity(n: usize) -> Self {
        let data = (0..n)
            .map(|j| (0..n).map(|i| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        Self { rows: n, data }
    }

    fn rotate(&mut self, p: usize, q: usize, c: f64, s: f64) {
        for i in 0..self.rows {
            let xp = self.data[p][i];
            let xq = self.data[q][i];
            self.data[p][i] = c * xp - s * xq;
            self.data[q][i] = s * xp + c * xq;
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// One-sided Jacobi on a tall matrix. Returns `(u_cols, s, v_cols)`.
fn jacobi(mut u: Columns) -> (Vec<Vec<f64>>, Vec<f64>, Vec<Vec<f64>>) {
    let n = u.data.len();
    let mut v = Columns::identity(n);
    for _ in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n {
            for q in (p + 1)..n {
                let alpha = dot(&u.data[p], &u.data[p]);
                let beta = dot(&u.data[q], &u.data[q]);
                let gamma = dot(&u.data[p], &u.data[q]);
                if gamma.abs() <= EPS * (alpha * beta).sqrt() || gamma == 0.0 {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                u.rotate(p, q, c, s);
                v.rotate(p, q, c, s);
            }
        }
        if !rotated {
            break;
        }
    }

    let mut order: Vec<(f64, usize)> = u
        .data
        .iter()
        .enumerate()
        .map(|(j, col)| (dot(col, col).sqrt(), j))
        .collect();
    order.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut u_cols = Vec::with_capacity(n);
    let mut s = Vec::with_capacity(n);
    let mut v_cols = Vec::with_capacity(n);
    for (sigma, j) in order {
        let col = if sigma > EPS {
            u.data[j].iter().map(|x| x / sigma).collect()
        } else {
            vec![0.0; u.rows]
        };
        u_cols.push(col);
        s.push(sigma);
        v_cols.push(v.data[j].clone());
    }
    (u_cols, s, v_cols)
}

/// Singular value decomposition of a 2-D tensor, truncated to `rank`.
///
/// `rank` is clamped to `min(m, n)`. The factors keep the dtype and device of `a`.
///
/// # Errors
///
/// Returns an error if `a` is not 2-D or `rank` is zero.
pub fn truncated_svd(a: &Tensor, rank: usize) -> Result<Svd> {
    let (m, n) = a.dims2()?;
    if rank == 0 {
        return Err(PeftError::InvalidConfig("svd rank must be > 0".into()));
    }
    let rows = a.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let wide = m < n;
    // work on the tall orientation; for wide input decompose aᵀ = v s uᵀ
    let (left, s, right) = jacobi(Columns::from_rows(&rows, wide));
    let (u_cols, v_cols) = if wide { (right, left) } else { (left, right) };
    let k = rank.min(m.min(n));

    let mut u = Vec::with_capacity(m * k);
    for i in 0..m {
        u.extend(u_cols.iter().take(k).map(|col| col[i]));
    }
    let vt: Vec<f64> = v_cols.iter().take(k).flatten().copied().collect();

    let device = a.device();
    let dtype = a.dtype();
    Ok(Svd {
        u: Tensor::from_vec(u, (m, k), device)?.to_dtype(dtype)?,
        s: Tensor::from_vec(s[..k].to_vec(), k, device)?.to_dtype(dtype)?,
        vt: Tensor::from_vec(vt, (k, n), device)?.to_dtype(dtype)?,
    })
}

/// Linearly interpolated quantile of every element of `t`.
///
/// # Errors
///
/// Returns an error if `q` is outside `[0, 1]` or `t` is empty.
pub fn quantile(t: &Tensor, q: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&q) {
        return Err(PeftError::InvalidConfig(format!(
            "quantile must be in [0, 1], got {q}"
        )));
    }
    let mut values = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    if values.is_empty() {
        return Err(PeftError::InvalidConfig("quantile of an empty tensor".into()));
    }
    values.sort_by(f64::total_cmp);
    #[allow(clippy::cast_precision_loss)]
    let pos = q * (values.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lower = pos.floor() as usize;
    let upper = (lower + 1).min(values.len() - 1);
    let frac = pos - pos.floor();
    Ok(values[lower] + (values[upper] - values[lower]) * frac)
}

/// `n x n` identity matrix.
///
/// # Errors
///
/// Returns an error if the tensor cannot be allocated.
pub fn eye(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..n * n)
        .map(|k| if k % (n + 1) == 0 { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)?)
}

/// Inverse of a square 2-D tensor by Gauss-Jordan elimination with partial pivoting.
///
/// # Errors
///
/// Returns an error if `a` is not square or is numerically singular.
pub fn inverse(a: &Tensor) -> Result<Tensor> {
    let (n, m) = a.dims2()?;
    if n != m {
        return Err(PeftError::ShapeMismatch {
            expected: vec![n, n],
            actual: vec![n, m],
        });
    }
    let mut rows = a.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let mut inv: Vec<Vec<f64>> = Columns::identity(n).data;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| rows[i][col].abs().total_cmp(&rows[j][col].abs()))
            .unwrap_or(col);
        if rows[pivot][col].abs() < EPS {
            return Err(PeftError::InvalidConfig("matrix is singular".into()));
        }
        rows.swap(col, pivot);
        inv.swap(col, pivot);
        let p = rows[col][col];
        for j in 0..n {
            rows[col][j] /= p;
            inv[col][j] /= p;
        }
        for i in 0..n {
            if i == col {
                continue;
            }
            let f = rows[i][col];
            if f == 0.0 {
                continue;
            }
            for j in 0..n {
                rows[i][j] -= f * rows[col][j];
                inv[i][j] -= f * inv[col][j];
            }
        }
    }
    let flat: Vec<f64> = inv.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (n, n), a.device())?.to_dtype(a.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reconstruct(svd: &Svd) -> Result<Tensor> {
        Ok(svd.u.broadcast_mul(&svd.s.unsqueeze(0)?)?.matmul(&svd.vt)?)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_full_rank_reconstruction() -> Result<()> {
        for (m, n) in [(6, 4), (4, 6), (5, 5)] {
            let a = Tensor::randn(0f32, 1.0, (m, n), &Device::Cpu)?;
            let svd = truncated_svd(&a, m.min(n))?;
            assert!(max_abs_diff(&a, &reconstruct(&svd)?)? < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_low_rank_input_is_exact() -> Result<()> {
        let b = Tensor::randn(0f32, 1.0, (8, 2), &Device::Cpu)?;
        let a = Tensor::randn(0f32, 1.0, (2, 5), &Device::Cpu)?;
        let delta = b.matmul(&a)?;
        let svd = truncated_svd(&delta, 2)?;
        assert_eq!(svd.u.dims(), &[8, 2]);
        assert_eq!(svd.vt.dims(), &[2, 5]);
        assert!(max_abs_diff(&delta, &reconstruct(&svd)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_singular_values_descending() -> Result<()> {
        let a = Tensor::new(&[[3f32, 0.0], [0.0, 5.0], [0.0, 0.0]], &Device::Cpu)?;
        let svd = truncated_svd(&a, 2)?;
        let s = svd.s.to_vec1::<f32>()?;
        assert!((s[0] - 5.0).abs() < 1e-5);
        assert!((s[1] - 3.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_quantile_interpolates() -> Result<()> {
        let t = Tensor::new(&[4f32, 1.0, 3.0, 2.0], &Device::Cpu)?;
        assert!((quantile(&t, 0.5)? - 2.5).abs() < 1e-12);
        assert!((quantile(&t, 1.0)? - 4.0).abs() < 1e-12);
        assert!(quantile(&t, 1.5).is_err());
        Ok(())
    }

    #[test]
    fn test_inverse() -> Result<()> {
        let a = Tensor::new(&[[0f32, 2.0, 1.0], [1.0, 0.0, 0.0], [3.0, 1.0, 4.0]], &Device::Cpu)?;
        let eye = a.matmul(&inverse(&a)?)?;
        let expected = super::eye(3, DType::F32, &Device::Cpu)?;
        assert!(max_abs_diff(&eye, &expected)? < 1e-5);

        let singular = Tensor::new(&[[1f32, 2.0], [2.0, 4.0]], &Device::Cpu)?;
        assert!(inverse(&singular).is_err());
        Ok(())
    }
}
