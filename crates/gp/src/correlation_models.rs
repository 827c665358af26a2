//! Stationary kernels used as prior covariances of the latent preference functions.
//!
//! The following correlation models are implemented:
//! * matern 3/2 (default),
//! * squared exponential.
//!
//! Both are products over input dimensions of one-dimensional kernels whose
//! width is given by a per-dimension length-scale `l`.

use crate::errors::{GpError, Result};
use crate::utils::differences;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// A trait for kernels evaluated on componentwise differences
pub trait CorrelationModel<F: Float>: Clone + Copy + Default + fmt::Display + Sync + Send {
    /// Compute correlation values r(x, x') given componentwise differences `d` (n, nx)
    /// between x and x' and `length_scales` (nx).
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F>;

    /// Compute the factor `g` such that `dr/dl_dim = r * g` for the given differences.
    fn length_scale_factor(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
        dim: usize,
    ) -> Array1<F>;
}

/// Matern 3/2 correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern32Corr();

impl From<Matern32Corr> for String {
    fn from(_item: Matern32Corr) -> String {
        "Matern32".to_string()
    }
}

impl TryFrom<String> for Matern32Corr {
    type Error = &'static str;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s == "Matern32" {
            Ok(Self::default())
        } else {
            Err("Bad string value for Matern32Corr, should be \'Matern32\'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for Matern32Corr {
    ///   d
    /// prod (1 + sqrt(3) * |d_j| / l_j) * exp( - sqrt(3) * |d_j| / l_j )
    ///  j=1
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        let sqrt3 = F::cast(3.).sqrt();
        let r = d.mapv(|v| v.abs() * sqrt3) / length_scales;
        r.map_axis(Axis(1), |row| {
            let a = row.fold(F::one(), |acc, v| acc * (F::one() + *v));
            let b = row.sum();
            a * F::exp(-b)
        })
    }

    fn length_scale_factor(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
        dim: usize,
    ) -> Array1<F> {
        let sqrt3 = F::cast(3.).sqrt();
        let l = length_scales[dim];
        d.column(dim).mapv(|v| {
            let r = v.abs() * sqrt3 / l;
            r * r / (l * (F::one() + r))
        })
    }
}

impl fmt::Display for Matern32Corr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern32")
    }
}

/// Squared exponential correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialCorr();

impl From<SquaredExponentialCorr> for String {
    fn from(_item: SquaredExponentialCorr) -> String {
        "SquaredExponential".to_string()
    }
}

impl TryFrom<String> for SquaredExponentialCorr {
    type Error = &'static str;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s == "SquaredExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for SquaredExponentialCorr, should be \'SquaredExponential\'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for SquaredExponentialCorr {
    ///   d
    /// prod exp( - (d_j / l_j)^2 / 2 )
    ///  j=1
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        let r = (d / length_scales).mapv(|v| v * v).sum_axis(Axis(1));
        r.mapv(|v| F::exp(F::cast(-0.5) * v))
    }

    fn length_scale_factor(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
        dim: usize,
    ) -> Array1<F> {
        let l = length_scales[dim];
        d.column(dim).mapv(|v| v * v / (l * l * l))
    }
}

impl fmt::Display for SquaredExponentialCorr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}

/// Kernel selected by name at configuration time.
///
/// Serialized as its name so that a posterior snapshot never carries
/// anything but plain data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub enum Kernel {
    /// Matern 3/2 kernel
    #[default]
    Matern32,
    /// Squared exponential kernel
    SquaredExponential,
}

impl From<Kernel> for String {
    fn from(item: Kernel) -> String {
        item.to_string()
    }
}

impl FromStr for Kernel {
    type Err = GpError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Matern32" | "matern_3_2" => Ok(Kernel::Matern32),
            "SquaredExponential" | "squared_exponential" => Ok(Kernel::SquaredExponential),
            _ => Err(GpError::UnknownKernel(s.to_string())),
        }
    }
}

impl TryFrom<String> for Kernel {
    type Error = GpError;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Kernel::Matern32 => write!(f, "{}", Matern32Corr()),
            Kernel::SquaredExponential => write!(f, "{}", SquaredExponentialCorr()),
        }
    }
}

impl<F: Float> CorrelationModel<F> for Kernel {
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array1<F> {
        match self {
            Kernel::Matern32 => Matern32Corr().value(d, length_scales),
            Kernel::SquaredExponential => SquaredExponentialCorr().value(d, length_scales),
        }
    }

    fn length_scale_factor(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
        dim: usize,
    ) -> Array1<F> {
        match self {
            Kernel::Matern32 => Matern32Corr().length_scale_factor(d, length_scales, dim),
            Kernel::SquaredExponential => {
                SquaredExponentialCorr().length_scale_factor(d, length_scales, dim)
            }
        }
    }
}

/// Expand `length_scales` to one value per input dimension.
///
/// A single value is shared by all `nx` dimensions.
pub fn broadcast_length_scales<F: Float>(
    length_scales: &ArrayBase<impl Data<Elem = F>, Ix1>,
    nx: usize,
) -> Result<Array1<F>> {
    if length_scales.iter().any(|l| *l <= F::zero()) {
        return Err(GpError::InvalidValueError(
            "length-scales should be strictly positive".to_string(),
        ));
    }
    match length_scales.len() {
        1 => Ok(Array1::from_elem(nx, length_scales[0])),
        n if n == nx => Ok(length_scales.to_owned()),
        n => Err(GpError::DimensionMismatch(format!(
            "{n} length-scales given for {nx} feature dimensions"
        ))),
    }
}

/// Covariance matrix (na, nb) between rows of `a` and rows of `b`
pub fn covariance<F: Float, Corr: CorrelationModel<F>>(
    corr: &Corr,
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    length_scales: &Array1<F>,
) -> Array2<F> {
    let b = b.view();
    let mut k = Array2::zeros((a.nrows(), b.nrows()));
    Zip::from(k.rows_mut())
        .and(a.rows())
        .par_for_each(|mut krow, ai| {
            let d = differences(&ai, &b);
            krow.assign(&corr.value(&d, length_scales));
        });
    k
}

/// Covariance matrix of `a` with itself plus `jitter` on the diagonal
pub fn self_covariance<F: Float, Corr: CorrelationModel<F>>(
    corr: &Corr,
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    length_scales: &Array1<F>,
    jitter: F,
) -> Array2<F> {
    let mut k = covariance(corr, a, a, length_scales);
    k.diag_mut().mapv_inplace(|v| v + jitter);
    k
}

/// Partial derivative of the covariance between `a` and `b` with respect to `l_dim`
pub fn length_scale_derivative<F: Float, Corr: CorrelationModel<F>>(
    corr: &Corr,
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    length_scales: &Array1<F>,
    dim: usize,
) -> Array2<F> {
    let b = b.view();
    let mut dk = Array2::zeros((a.nrows(), b.nrows()));
    Zip::from(dk.rows_mut())
        .and(a.rows())
        .par_for_each(|mut row, ai| {
            let d = differences(&ai, &b);
            let r = corr.value(&d, length_scales);
            let g = corr.length_scale_factor(&d, length_scales, dim);
            row.assign(&(r * g));
        });
    dk
}

/// Prior variance k(x, x) of a stationary kernel
pub fn prior_variance<F: Float, Corr: CorrelationModel<F>>(
    corr: &Corr,
    length_scales: &Array1<F>,
) -> F {
    let d = Array2::zeros((1, length_scales.len()));
    corr.value(&d, length_scales)[0]
}
