use crate::errors::{GpError, Result};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array, Array1, Array2, ArrayBase, Data, Ix1, Ix2};

/// Computes differences between x and each element of y
/// resulting in a 2d array of shape (nrows(y), ncols(x));
/// *Panics* if x and y have not the same number of components
pub fn differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    assert!(x.len() == y.ncols());
    x.to_owned() - y
}

/// Make a square matrix exactly symmetric: (a + a^T) / 2
pub fn symmetrize<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    (a + &a.t()).mapv(|v| v * F::cast(0.5))
}

/// Inverse of a symmetric positive definite matrix via its Cholesky factor.
///
/// `what` names the matrix in the error raised when the factorization fails.
pub fn cholesky_inverse<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    what: &str,
) -> Result<Array2<F>> {
    let l = a
        .cholesky()
        .map_err(|e| GpError::IllConditioned(format!("{what}: {e}")))?;
    let li = l.solve_triangular(&Array::eye(l.nrows()), UPLO::Lower)?;
    Ok(symmetrize(&li.t().dot(&li)))
}

/// Log-determinant of a symmetric positive definite matrix
pub fn log_det<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>, what: &str) -> Result<F> {
    let l = a
        .cholesky()
        .map_err(|e| GpError::IllConditioned(format!("{what}: {e}")))?;
    Ok(l.diag().mapv(|v| v.ln()).sum() * F::cast(2.))
}

/// Deduplicate the rows of `x`.
///
/// Returns the unique rows in order of first appearance and, for every row of `x`,
/// the index of its unique row.
pub fn unique_rows<F: Float>(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> (Array2<F>, Vec<usize>) {
    let mut uniques: Vec<usize> = Vec::new();
    let mut index = Vec::with_capacity(x.nrows());
    for (i, row) in x.rows().into_iter().enumerate() {
        match uniques.iter().position(|&u| x.row(u) == row) {
            Some(pos) => index.push(pos),
            None => {
                index.push(uniques.len());
                uniques.push(i);
            }
        }
    }
    let mut u = Array2::zeros((uniques.len(), x.ncols()));
    for (k, &i) in uniques.iter().enumerate() {
        u.row_mut(k).assign(&x.row(i));
    }
    (u, index)
}

/// Row-wise quadratic forms `a_i^T m a_i` for each row `a_i` of `a`
pub fn row_quadratic_forms<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    m: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array1<F> {
    (a.dot(m) * a).sum_axis(ndarray::Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_differences() {
        let x = array![1., 2.];
        let y = array![[0., 0.], [1., 3.]];
        assert_abs_diff_eq!(differences(&x, &y), array![[1., 2.], [0., -1.]]);
    }

    #[test]
    fn test_cholesky_inverse() {
        let a = array![[4., 1., 0.], [1., 3., 0.5], [0., 0.5, 2.]];
        let inv = cholesky_inverse(&a, "a").unwrap();
        assert_abs_diff_eq!(a.dot(&inv), Array2::<f64>::eye(3), epsilon = 1e-12);
        assert_abs_diff_eq!(inv, inv.t(), epsilon = 1e-15);
    }

    #[test]
    fn test_cholesky_inverse_singular() {
        let a = array![[1., 2.], [2., 1.]];
        assert!(matches!(
            cholesky_inverse(&a, "singular"),
            Err(GpError::IllConditioned(_))
        ));
    }

    #[test]
    fn test_log_det() {
        let a = array![[2., 0.], [0., 3.]];
        assert_abs_diff_eq!(log_det(&a, "a").unwrap(), 6f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_unique_rows() {
        let x = array![[0., 1.], [2., 3.], [0., 1.], [4., 5.]];
        let (u, index) = unique_rows(&x);
        assert_eq!(u, array![[0., 1.], [2., 3.], [4., 5.]]);
        assert_eq!(index, vec![0, 1, 0, 2]);
    }
}
