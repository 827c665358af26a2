use crate::correlation_models::{
    broadcast_length_scales, covariance, length_scale_derivative, prior_variance, self_covariance,
    CorrelationModel,
};
use crate::errors::{GpError, Result};
use crate::utils::{cholesky_inverse, log_det, row_quadratic_forms};
use linfa::prelude::{DatasetBase, Fit};
use linfa::Float;
use linfa_clustering::KMeans;
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix1, Ix2, Zip};
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Max number of k-means iterations when placing inducing points
pub const KMEANS_MAX_ITER: u64 = 100;

/// Inducing points specification
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Inducings<F: Float> {
    /// At most `usize` points placed at k-means centroids of the training locations.
    /// When the budget exceeds the number of locations, the locations themselves are used.
    Clustered(usize),
    /// Points are given as a (npoints, nx) matrix
    Located(Array2<F>),
}

impl<F: Float> Default for Inducings<F> {
    fn default() -> Inducings<F> {
        Self::Clustered(500)
    }
}

/// Place inducing points over the (unique) locations `x`
pub fn select_inducings<F: Float>(
    inducings: &Inducings<F>,
    x: &ArrayView2<F>,
    rng: &mut Xoshiro256Plus,
) -> Result<Array2<F>> {
    match inducings {
        Inducings::Located(z) => {
            if z.ncols() != x.ncols() {
                return Err(GpError::DimensionMismatch(format!(
                    "inducing points have {} columns, locations have {}",
                    z.ncols(),
                    x.ncols()
                )));
            }
            Ok(z.to_owned())
        }
        Inducings::Clustered(n) if *n >= x.nrows() => Ok(x.to_owned()),
        Inducings::Clustered(n) => {
            debug!("Select {} inducing points among {} locations", n, x.nrows());
            let dataset = DatasetBase::from(x.to_owned());
            let model = KMeans::params_with_rng(*n, rng.clone())
                .max_n_iterations(KMEANS_MAX_ITER)
                .fit(&dataset)?;
            rng.jump();
            Ok(model.centroids().to_owned())
        }
    }
}

/// Kernel matrices of a sparse GP summarized at inducing points.
///
/// `K_mm` carries the jitter; the projection `A = K_nm K_mm^-1` maps values at the
/// inducing points to the training locations.
#[derive(Clone, Debug)]
pub struct InducingSpace<F: Float, Corr: CorrelationModel<F>> {
    corr: Corr,
    length_scales: Array1<F>,
    jitter: F,
    inducings: Array2<F>,
    xtrain: Array2<F>,
    k_mm: Array2<F>,
    inv_k_mm: Array2<F>,
    log_det_k_mm: F,
    k_nm: Array2<F>,
    projection: Array2<F>,
    prior_var: F,
}

impl<F: Float, Corr: CorrelationModel<F>> InducingSpace<F, Corr> {
    /// Build kernel matrices between `inducings` (M, nx) and training locations `xtrain` (N, nx)
    pub fn new(
        corr: Corr,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
        inducings: Array2<F>,
        xtrain: Array2<F>,
        jitter: F,
    ) -> Result<Self> {
        if inducings.ncols() != xtrain.ncols() {
            return Err(GpError::DimensionMismatch(format!(
                "inducing points have {} columns, training locations have {}",
                inducings.ncols(),
                xtrain.ncols()
            )));
        }
        let length_scales = broadcast_length_scales(length_scales, xtrain.ncols())?;
        let k_mm = self_covariance(&corr, &inducings, &length_scales, jitter);
        let inv_k_mm = cholesky_inverse(&k_mm, "inducing points covariance K_mm")?;
        let log_det_k_mm = log_det(&k_mm, "inducing points covariance K_mm")?;
        let k_nm = covariance(&corr, &xtrain, &inducings, &length_scales);
        let projection = k_nm.dot(&inv_k_mm);
        let prior_var = prior_variance(&corr, &length_scales);
        Ok(InducingSpace {
            corr,
            length_scales,
            jitter,
            inducings,
            xtrain,
            k_mm,
            inv_k_mm,
            log_det_k_mm,
            k_nm,
            projection,
            prior_var,
        })
    }

    /// Rebuild the kernel matrices at the same locations with new length-scales
    pub fn with_length_scales(&self, length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Self> {
        Self::new(
            self.corr,
            length_scales,
            self.inducings.to_owned(),
            self.xtrain.to_owned(),
            self.jitter,
        )
    }

    /// Kernel
    pub fn corr(&self) -> &Corr {
        &self.corr
    }

    /// Length-scales, one per input dimension
    pub fn length_scales(&self) -> &Array1<F> {
        &self.length_scales
    }

    /// Diagonal jitter added to `K_mm`
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Number of inducing points M
    pub fn n_inducings(&self) -> usize {
        self.inducings.nrows()
    }

    /// Number of training locations N
    pub fn n_train(&self) -> usize {
        self.xtrain.nrows()
    }

    /// Inducing points (M, nx)
    pub fn inducings(&self) -> &Array2<F> {
        &self.inducings
    }

    /// Training locations (N, nx)
    pub fn xtrain(&self) -> &Array2<F> {
        &self.xtrain
    }

    /// `K_mm` with jitter
    pub fn k_mm(&self) -> &Array2<F> {
        &self.k_mm
    }

    /// `K_mm^-1`
    pub fn inv_k_mm(&self) -> &Array2<F> {
        &self.inv_k_mm
    }

    /// `ln |K_mm|`
    pub fn log_det_k_mm(&self) -> F {
        self.log_det_k_mm
    }

    /// `K_nm`
    pub fn k_nm(&self) -> &Array2<F> {
        &self.k_nm
    }

    /// `K_nm K_mm^-1` (N, M)
    pub fn projection(&self) -> &Array2<F> {
        &self.projection
    }

    /// Prior variance k(x, x) before output scaling
    pub fn prior_var(&self) -> F {
        self.prior_var
    }

    /// Project values at inducing points to every training location
    pub fn project_mean(&self, u: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
        self.projection.dot(u)
    }

    /// `K_xm K_mm^-1` for new locations `x`
    pub fn cross_projection(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        if x.ncols() != self.xtrain.ncols() {
            return Err(GpError::DimensionMismatch(format!(
                "query locations have {} columns, expected {}",
                x.ncols(),
                self.xtrain.ncols()
            )));
        }
        Ok(covariance(&self.corr, x, &self.inducings, &self.length_scales).dot(&self.inv_k_mm))
    }

    /// Posterior mean at new locations given values `u` at inducing points
    pub fn predict_mean(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        u: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        Ok(self.cross_projection(x)?.dot(u))
    }

    /// Posterior variances at new locations: `k(x,x)/s + a_x (S - K_mm/s) a_x^T`
    pub fn predict_variances(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        cov: &Array2<F>,
        scale: F,
    ) -> Result<Array1<F>> {
        let a = self.cross_projection(x)?;
        Ok(self.projected_variances(&a, cov, scale))
    }

    /// Posterior variances at every training location
    pub fn train_variances(&self, cov: &Array2<F>, scale: F) -> Array1<F> {
        self.projected_variances(&self.projection, cov, scale)
    }

    fn projected_variances(&self, a: &Array2<F>, cov: &Array2<F>, scale: F) -> Array1<F> {
        let residual = cov - &self.k_mm.mapv(|v| v / scale);
        let mut var = row_quadratic_forms(a, &residual);
        var.mapv_inplace(|v| (v + self.prior_var / scale).max(F::zero()));
        var
    }

    /// Rows `A_a - A_b` of the projection for pairs of training locations (a, b)
    pub fn difference_projection(&self, a: &[usize], b: &[usize]) -> Array2<F> {
        let mut d = Array2::zeros((a.len(), self.n_inducings()));
        Zip::from(d.rows_mut())
            .and(&Array1::from_vec(a.to_vec()))
            .and(&Array1::from_vec(b.to_vec()))
            .for_each(|mut row, &ia, &ib| {
                row.assign(&(&self.projection.row(ia) - &self.projection.row(ib)));
            });
        d
    }

    /// Prior variances of `f_a - f_b` before output scaling: `k_aa + k_bb - 2 k_ab`
    pub fn prior_difference_variances(&self, a: &[usize], b: &[usize]) -> Array1<F> {
        let mut dx = Array2::zeros((a.len(), self.xtrain.ncols()));
        Zip::from(dx.rows_mut())
            .and(&Array1::from_vec(a.to_vec()))
            .and(&Array1::from_vec(b.to_vec()))
            .for_each(|mut row, &ia, &ib| {
                row.assign(&(&self.xtrain.row(ia) - &self.xtrain.row(ib)));
            });
        let k_ab = self.corr.value(&dx, &self.length_scales);
        k_ab.mapv(|v| (F::cast(2.) * (self.prior_var - v)).max(F::zero()))
    }

    /// Posterior variances of `f_a - f_b` given the difference projection rows `d_proj`
    /// and prior difference variances `prior_diff`
    pub fn posterior_difference_variances(
        &self,
        d_proj: &Array2<F>,
        prior_diff: &Array1<F>,
        cov: &Array2<F>,
        scale: F,
    ) -> Array1<F> {
        let residual = cov - &self.k_mm.mapv(|v| v / scale);
        let q = row_quadratic_forms(d_proj, &residual);
        (q + prior_diff.mapv(|v| v / scale)).mapv(|v| v.max(F::zero()))
    }

    /// `dK_mm / dl_dim`
    pub fn k_mm_derivative(&self, dim: usize) -> Array2<F> {
        length_scale_derivative(
            &self.corr,
            &self.inducings,
            &self.inducings,
            &self.length_scales,
            dim,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation_models::Kernel;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;

    fn locations() -> Array2<f64> {
        Array::linspace(0., 5., 20).insert_axis(ndarray::Axis(1))
    }

    #[test]
    fn test_select_all_locations_when_budget_exceeds() {
        let x = locations();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let z = select_inducings(&Inducings::Clustered(50), &x.view(), &mut rng).unwrap();
        assert_eq!(z, x);
    }

    #[test]
    fn test_select_clustered_inducings() {
        let x = locations();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let z = select_inducings(&Inducings::Clustered(5), &x.view(), &mut rng).unwrap();
        assert_eq!(z.dim(), (5, 1));
        assert!(z.iter().all(|v| (0. ..=5.).contains(v)));

        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let z2 = select_inducings(&Inducings::Clustered(5), &x.view(), &mut rng).unwrap();
        assert_eq!(z, z2);
    }

    #[test]
    fn test_projection_is_exact_at_inducings() {
        let x = Array::linspace(0., 5., 6).insert_axis(ndarray::Axis(1));
        let space =
            InducingSpace::new(Kernel::Matern32, &array![1.], x.to_owned(), x.to_owned(), 1e-6)
                .unwrap();
        let u = x.column(0).mapv(|v: f64| v.sin());
        assert_abs_diff_eq!(space.project_mean(&u), u, epsilon = 1e-4);
    }

    #[test]
    fn test_prior_covariance_recovered() {
        let x = locations();
        let z = array![[0.5], [2.5], [4.5]];
        let space = InducingSpace::new(Kernel::Matern32, &array![1.5], z, x, 1e-6).unwrap();
        let scale = 2.;
        // Posterior equal to the prior gives back prior variances
        let prior = space.k_mm().mapv(|v| v / scale);
        let var = space.train_variances(&prior, scale);
        assert_abs_diff_eq!(var, Array1::from_elem(20, 0.5), epsilon = 1e-10);

        let d = space.difference_projection(&[0, 3], &[3, 3]);
        let prior_diff = space.prior_difference_variances(&[0, 3], &[3, 3]);
        let dvar = space.posterior_difference_variances(&d, &prior_diff, &prior, scale);
        assert_abs_diff_eq!(dvar[1], 0., epsilon = 1e-12);
        assert!(dvar[0] > 0.);
    }

    #[test]
    fn test_dimension_mismatch() {
        let x = locations();
        let z = array![[0.5, 1.]];
        assert!(matches!(
            InducingSpace::new(Kernel::Matern32, &array![1.], z, x, 1e-6),
            Err(GpError::DimensionMismatch(_))
        ));
    }
}
