//! The Moran drift operator: matrix-exponential action on allele-count
//! distributions.
//!
//! Within one population segment the number of sampled lineages `n` is
//! fixed, and the count of derived-allele carriers among them evolves as
//! the neutral Moran death/birth chain on `0..=n`: from state `k`, moves
//! one step up or down at rate `k(n-k)/2`, with `0` and `n` absorbing.
//! Population size enters only through the rescaled duration passed to
//! [`action`], never through the generator itself, so the
//! eigendecomposition depends on `n` alone and is cached process-wide.
//!
//! `action` applies `P e^{tD} P^{-1}` along one axis of a tensor without
//! forming the matrix exponential; because `t` enters only through
//! `e^{t d_i}`, the operation differentiates cleanly with respect to `t`.

use crate::scalar::Scalar;
use dashmap::DashMap;
use ndarray::{Array1, Array2, ArrayD, Axis};
use ndarray_linalg::{Eig, Inv};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoranError {
    #[error("eigendecomposition of the Moran generator (n = {n}) failed: {source}")]
    Eigen {
        n: usize,
        source: ndarray_linalg::error::LinalgError,
    },

    #[error("eigenvector matrix of the Moran generator (n = {n}) is singular: {source}")]
    SingularEigenbasis {
        n: usize,
        source: ndarray_linalg::error::LinalgError,
    },
}

/// Cached eigendecomposition `M = P diag(d) P^{-1}` of the generator for a
/// fixed lineage count.
pub struct MoranEigensystem {
    pub p: Array2<f64>,
    pub d: Array1<f64>,
    pub pinv: Array2<f64>,
}

/// Tri-diagonal generator of the Moran chain on `0..=n`.
fn rate_matrix(n: usize) -> Array2<f64> {
    let mut m = Array2::zeros((n + 1, n + 1));
    for k in 0..=n {
        let rate = (k * (n - k)) as f64 / 2.0;
        if rate > 0.0 {
            m[[k, k - 1]] = rate;
            m[[k, k + 1]] = rate;
            m[[k, k]] = -2.0 * rate;
        }
    }
    m
}

fn cache() -> &'static DashMap<usize, Arc<MoranEigensystem>> {
    static CACHE: OnceLock<DashMap<usize, Arc<MoranEigensystem>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// The eigendecomposition for `n` lineages, computed once per process.
///
/// The generator is a birth/death chain, so its spectrum is real
/// (`-k(k-1)/2` for `k = 0..=n`); the imaginary parts returned by the
/// general eigensolver are identically zero and are discarded.
pub fn eigensystem(n: usize) -> Result<Arc<MoranEigensystem>, MoranError> {
    if let Some(hit) = cache().get(&n) {
        return Ok(hit.clone());
    }
    let m = rate_matrix(n);
    let (values, vectors) = m.eig().map_err(|source| MoranError::Eigen { n, source })?;
    let d = values.mapv(|z| z.re);
    let p = vectors.mapv(|z| z.re);
    let pinv = p
        .inv()
        .map_err(|source| MoranError::SingularEigenbasis { n, source })?;
    let system = Arc::new(MoranEigensystem { p, d, pinv });
    cache().insert(n, system.clone());
    Ok(system)
}

/// Apply `e^{tM}` along `axis` of `tensor`, leaving other axes untouched.
///
/// The lineage count is read off the axis length. Each lane `v` becomes
/// `P (e^{t d} .* (P^{-1} v))`.
pub fn action<S: Scalar>(t: S, tensor: &ArrayD<S>, axis: usize) -> Result<ArrayD<S>, MoranError> {
    let len = tensor.shape()[axis];
    let system = eigensystem(len - 1)?;
    let decay: Vec<S> = system
        .d
        .iter()
        .map(|&d| (t * S::from_f64(d)).exp())
        .collect();

    let mut out = tensor.clone();
    let mut v = vec![S::zero(); len];
    let mut w = vec![S::zero(); len];
    for mut lane in out.lanes_mut(Axis(axis)) {
        for (dst, src) in v.iter_mut().zip(lane.iter()) {
            *dst = *src;
        }
        for i in 0..len {
            let mut acc = S::zero();
            for j in 0..len {
                acc += S::from_f64(system.pinv[[i, j]]) * v[j];
            }
            w[i] = acc * decay[i];
        }
        for i in 0..len {
            let mut acc = S::zero();
            for j in 0..len {
                acc += S::from_f64(system.p[[i, j]]) * w[j];
            }
            lane[i] = acc;
        }
    }
    Ok(out)
}
