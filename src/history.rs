//! Truncated size histories: per-segment coalescence-time expectations and
//! drift transitions.
//!
//! A population segment covers a bounded time interval `[0, tau]` with some
//! size trajectory. From the trajectory the segment derives, once, at
//! construction:
//!
//! - `etjj`: for `j = 2..=n_max`, the expected time spent with exactly `j`
//!   ancestral lineages before truncation at `tau`;
//! - `scaled_time`: the integral of the inverse size over the interval,
//!   which is the duration seen by the Moran drift operator;
//! - `sfs`: the truncated site-frequency vector obtained from `etjj`
//!   through the Polanski-Kimmel weights, with the monomorphic entry fixed
//!   by branch-length conservation
//!   (`sfs[n] = tau - sum_b sfs[b] * b/n`).
//!
//! All three are ordinary `Scalar` expressions of the segment parameters,
//! so they carry derivatives when evaluated with dual numbers.

use crate::moran::{self, MoranError};
use crate::scalar::Scalar;
use crate::special::{binom, expm1d, polanski_kimmel_w, transformed_expi};
use ndarray::ArrayD;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("population size must be positive, got {0}")]
    NonPositiveSize(f64),

    #[error("segment duration must be non-negative, got {0}")]
    NegativeDuration(f64),

    #[error("{0} size histories require a finite, positive duration")]
    NonFiniteDuration(&'static str),

    #[error("a piecewise history needs at least one piece")]
    EmptyPiecewise,

    #[error("piecewise pieces disagree on the number of lineages ({0} vs {1})")]
    PiecewiseLineageMismatch(usize, usize),

    #[error("an infinite-duration piece must be the last piece of a piecewise history")]
    InfinitePieceNotLast,

    #[error(
        "expected coalescence time for j = {j} lineages is out of bounds ({value}); \
         the parameters are outside the model's valid regime"
    )]
    NumericalInstability { j: usize, value: f64 },

    #[error("cannot advance a distribution across an interval of infinite scaled time")]
    InfiniteScaledTime,

    #[error("distribution axis has length {got}, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },

    #[error(transparent)]
    Moran(#[from] MoranError),
}

/// Quantities every variant derives at construction.
#[derive(Debug, Clone)]
pub struct HistoryCore<S> {
    n_max: usize,
    tau: S,
    etjj: Vec<S>,
    scaled_time: S,
    sfs: Vec<S>,
}

/// A parameter-only size-model specification.
///
/// The demography builder resolves a `SizeModel` into a [`SizeHistory`]
/// once the lineage count at its node is known.
#[derive(Clone)]
pub enum SizeModel<S: Scalar> {
    Constant {
        size: S,
        tau: S,
    },
    Exponential {
        size_top: S,
        size_bottom: S,
        tau: S,
    },
    Functional {
        /// Instantaneous coalescence rate (inverse population size) as a
        /// function of time since the segment bottom.
        rate: Arc<dyn Fn(S) -> S + Send + Sync>,
        tau: S,
    },
    Piecewise(Vec<SizeModel<S>>),
}

impl<S: Scalar> SizeModel<S> {
    pub fn resolve(&self, n_max: usize) -> Result<SizeHistory<S>, HistoryError> {
        match self {
            SizeModel::Constant { size, tau } => SizeHistory::constant(n_max, *tau, *size),
            SizeModel::Exponential {
                size_top,
                size_bottom,
                tau,
            } => SizeHistory::exponential(n_max, *tau, *size_top, *size_bottom),
            SizeModel::Functional { rate, tau } => {
                SizeHistory::functional(n_max, *tau, rate.clone())
            }
            SizeModel::Piecewise(specs) => {
                let pieces = specs
                    .iter()
                    .map(|spec| spec.resolve(n_max))
                    .collect::<Result<Vec<_>, _>>()?;
                SizeHistory::piecewise(pieces)
            }
        }
    }
}

/// A resolved, immutable size history for one population segment.
pub enum SizeHistory<S: Scalar> {
    Constant {
        size: S,
        core: HistoryCore<S>,
    },
    Exponential {
        size_top: S,
        size_bottom: S,
        growth: S,
        core: HistoryCore<S>,
    },
    Functional {
        rate: Arc<dyn Fn(S) -> S + Send + Sync>,
        core: HistoryCore<S>,
    },
    Piecewise {
        pieces: Vec<SizeHistory<S>>,
        core: HistoryCore<S>,
    },
}

impl<S: Scalar> SizeHistory<S> {
    /// Constant size `size` for duration `tau` (which may be infinite).
    pub fn constant(n_max: usize, tau: S, size: S) -> Result<Self, HistoryError> {
        if !(size.value() > 0.0) {
            return Err(HistoryError::NonPositiveSize(size.value()));
        }
        if !(tau.value() >= 0.0) {
            return Err(HistoryError::NegativeDuration(tau.value()));
        }
        let mut etjj = Vec::with_capacity(n_max.saturating_sub(1));
        for j in 2..=n_max {
            let denom = S::from_f64(binom(j, 2)) / size;
            let value = if tau.value().is_infinite() {
                S::one() / denom
            } else {
                -(-(denom * tau)).expm1() / denom
            };
            etjj.push(value);
        }
        let scaled_time = tau / size;
        Ok(SizeHistory::Constant {
            size,
            core: HistoryCore::assemble(n_max, tau, etjj, scaled_time)?,
        })
    }

    /// Size moving exponentially from `size_top` (ancient end) to
    /// `size_bottom` (recent end) over a finite duration `tau`.
    ///
    /// The expected coalescence times come out of the transformed
    /// exponential integral; the computation is arranged so that a zero
    /// growth rate (equal endpoint sizes) works without special-casing.
    pub fn exponential(n_max: usize, tau: S, size_top: S, size_bottom: S) -> Result<Self, HistoryError> {
        if !(size_top.value() > 0.0) {
            return Err(HistoryError::NonPositiveSize(size_top.value()));
        }
        if !(size_bottom.value() > 0.0) {
            return Err(HistoryError::NonPositiveSize(size_bottom.value()));
        }
        if !(tau.value() > 0.0) || tau.value().is_infinite() {
            return Err(HistoryError::NonFiniteDuration("exponential"));
        }
        // size_bottom = size_top * exp(tau * growth)
        let growth = (size_bottom / size_top).ln() / tau;
        let mut etjj = Vec::with_capacity(n_max.saturating_sub(1));
        for j in 2..=n_max {
            let pow0 = size_bottom / S::from_f64(binom(j, 2));
            let pow1 = growth * tau;
            let mut value = -transformed_expi(pow0 * growth / pow1.exp());
            value = value * (-(expm1d(pow1) * tau / pow0) - pow1).exp();
            value = value + transformed_expi(pow0 * growth);
            value = value * pow0;
            etjj.push(value);
        }
        let scaled_time = expm1d(growth * tau) * tau / size_bottom;
        Ok(SizeHistory::Exponential {
            size_top,
            size_bottom,
            growth,
            core: HistoryCore::assemble(n_max, tau, etjj, scaled_time)?,
        })
    }

    /// Size given by an arbitrary instantaneous coalescence-rate function;
    /// expectations are computed by composite Gauss-Legendre quadrature.
    pub fn functional(
        n_max: usize,
        tau: S,
        rate: Arc<dyn Fn(S) -> S + Send + Sync>,
    ) -> Result<Self, HistoryError> {
        if !(tau.value() > 0.0) || tau.value().is_infinite() {
            return Err(HistoryError::NonFiniteDuration("functional"));
        }
        let cumulative = |t: S| integrate(|u| rate(u), S::zero(), t);
        let scaled_time = cumulative(tau);
        let mut etjj = Vec::with_capacity(n_max.saturating_sub(1));
        for j in 2..=n_max {
            let j2 = S::from_f64(binom(j, 2));
            // tau * P(T_jj > tau), plus the truncated expectation by parts
            let survived = tau * (-(j2 * scaled_time)).exp();
            let integral = integrate(
                |t| t * rate(t) * (-(j2 * cumulative(t))).exp(),
                S::zero(),
                tau,
            );
            etjj.push(survived + j2 * integral);
        }
        Ok(SizeHistory::Functional {
            rate,
            core: HistoryCore::assemble(n_max, tau, etjj, scaled_time)?,
        })
    }

    /// A sequence of sub-histories sharing `n_max`, later pieces discounted
    /// by the probability that no coalescence happened in earlier ones.
    pub fn piecewise(pieces: Vec<SizeHistory<S>>) -> Result<Self, HistoryError> {
        let n_max = pieces.first().ok_or(HistoryError::EmptyPiecewise)?.n_max();
        for piece in &pieces {
            if piece.n_max() != n_max {
                return Err(HistoryError::PiecewiseLineageMismatch(n_max, piece.n_max()));
            }
        }
        let mut tau = S::zero();
        let mut scaled_time = S::zero();
        let mut etjj = vec![S::zero(); n_max.saturating_sub(1)];
        let mut no_coal = vec![S::one(); etjj.len()];
        let last = pieces.len() - 1;
        for (idx, piece) in pieces.iter().enumerate() {
            tau += piece.tau();
            scaled_time += piece.scaled_time();
            for (slot, (survive, value)) in
                etjj.iter_mut().zip(no_coal.iter().zip(piece.etjj()))
            {
                *slot += *survive * *value;
            }
            if piece.scaled_time().value().is_infinite() {
                if idx != last {
                    return Err(HistoryError::InfinitePieceNotLast);
                }
            } else {
                for (i, survive) in no_coal.iter_mut().enumerate() {
                    let j2 = S::from_f64(binom(i + 2, 2));
                    *survive *= (-(piece.scaled_time() * j2)).exp();
                }
            }
        }
        Ok(SizeHistory::Piecewise {
            pieces,
            core: HistoryCore::assemble(n_max, tau, etjj, scaled_time)?,
        })
    }

    fn core(&self) -> &HistoryCore<S> {
        match self {
            SizeHistory::Constant { core, .. }
            | SizeHistory::Exponential { core, .. }
            | SizeHistory::Functional { core, .. }
            | SizeHistory::Piecewise { core, .. } => core,
        }
    }

    pub fn n_max(&self) -> usize {
        self.core().n_max
    }

    pub fn tau(&self) -> S {
        self.core().tau
    }

    /// Expected time with exactly `j` lineages, for `j = 2..=n_max`.
    pub fn etjj(&self) -> &[S] {
        &self.core().etjj
    }

    /// Integral of the inverse size over the segment.
    pub fn scaled_time(&self) -> S {
        self.core().scaled_time
    }

    /// Truncated SFS vector over derived counts `0..=n_max`; entry 0 is
    /// zero, entry `n_max` is the monomorphic (pre-TMRCA) mass.
    pub fn sfs(&self) -> &[S] {
        &self.core().sfs
    }

    /// Expected branch length subtending `b` of `n_max` lineages.
    pub fn freq(&self, b: usize) -> S {
        if b == 0 { S::zero() } else { self.core().sfs[b] }
    }

    /// Advance an allele-count distribution across this segment along
    /// `axis`. `scaled_time == 0` is the identity (no drift).
    pub fn transition(&self, values: &ArrayD<S>, axis: usize) -> Result<ArrayD<S>, HistoryError> {
        let expected = self.n_max() + 1;
        let got = values.shape()[axis];
        if got != expected {
            return Err(HistoryError::DimensionMismatch { got, expected });
        }
        let t = self.scaled_time();
        if t.value() == 0.0 {
            return Ok(values.clone());
        }
        if t.value().is_infinite() {
            return Err(HistoryError::InfiniteScaledTime);
        }
        Ok(moran::action(t, values, axis)?)
    }
}

impl<S: Scalar> HistoryCore<S> {
    fn assemble(
        n_max: usize,
        tau: S,
        etjj: Vec<S>,
        scaled_time: S,
    ) -> Result<Self, HistoryError> {
        validate_etjj(tau, &etjj)?;
        let sfs = sfs_from_etjj(n_max, tau, &etjj);
        Ok(HistoryCore {
            n_max,
            tau,
            etjj,
            scaled_time,
            sfs,
        })
    }
}

/// `etjj` must be non-negative, non-increasing in `j`, and bounded by the
/// segment duration; anything else means the parameters left the model's
/// valid regime or a stability switch failed.
fn validate_etjj<S: Scalar>(tau: S, etjj: &[S]) -> Result<(), HistoryError> {
    let scale = etjj
        .first()
        .map(|v| v.value().abs())
        .unwrap_or(0.0)
        .max(1.0);
    let tol = 1e-9 * scale;
    let mut prev = f64::INFINITY;
    for (i, v) in etjj.iter().enumerate() {
        let x = v.value();
        let in_bounds =
            x >= -tol && x <= prev + tol && (tau.value().is_infinite() || x <= tau.value() + tol);
        if !in_bounds {
            return Err(HistoryError::NumericalInstability { j: i + 2, value: x });
        }
        prev = x;
    }
    Ok(())
}

fn sfs_from_etjj<S: Scalar>(n_max: usize, tau: S, etjj: &[S]) -> Vec<S> {
    if n_max <= 1 {
        return vec![S::zero(), tau];
    }
    let w = polanski_kimmel_w(n_max);
    let mut sfs = vec![S::zero(); n_max + 1];
    for b in 1..n_max {
        let mut acc = S::zero();
        for j in 2..=n_max {
            acc += etjj[j - 2] * S::from_f64(w[[j - 2, b - 1]]);
        }
        sfs[b] = acc;
    }
    let mut monomorphic = tau;
    for (b, value) in sfs.iter().enumerate().take(n_max).skip(1) {
        monomorphic = monomorphic - *value * S::from_f64(b as f64 / n_max as f64);
    }
    sfs[n_max] = monomorphic;
    sfs
}

/// 20-point Gauss-Legendre nodes on `[-1, 1]` and their weights.
const GL_NODES: [f64; 20] = [
    -0.993_128_599_185_094_9,
    -0.963_971_927_277_913_8,
    -0.912_234_428_251_325_9,
    -0.839_116_971_822_218_8,
    -0.746_331_906_460_150_8,
    -0.636_053_680_726_515_0,
    -0.510_867_001_950_827_1,
    -0.373_706_088_715_419_5,
    -0.227_785_851_141_645_1,
    -0.076_526_521_133_497_3,
    0.076_526_521_133_497_3,
    0.227_785_851_141_645_1,
    0.373_706_088_715_419_5,
    0.510_867_001_950_827_1,
    0.636_053_680_726_515_0,
    0.746_331_906_460_150_8,
    0.839_116_971_822_218_8,
    0.912_234_428_251_325_9,
    0.963_971_927_277_913_8,
    0.993_128_599_185_094_9,
];

const GL_WEIGHTS: [f64; 20] = [
    0.017_614_007_139_152_1,
    0.040_601_429_800_386_9,
    0.062_672_048_334_109_1,
    0.083_276_741_576_704_8,
    0.101_930_119_817_240_4,
    0.118_194_531_961_518_4,
    0.131_688_638_449_176_6,
    0.142_096_109_318_382_0,
    0.152_753_387_130_725_8,
    0.152_753_387_130_725_8,
    0.142_096_109_318_382_0,
    0.131_688_638_449_176_6,
    0.118_194_531_961_518_4,
    0.101_930_119_817_240_4,
    0.083_276_741_576_704_8,
    0.062_672_048_334_109_1,
    0.040_601_429_800_386_9,
    0.017_614_007_139_152_1,
];

const GL_PANELS: usize = 24;

/// Composite fixed-order Gauss-Legendre quadrature of `f` over `[a, b]`.
fn integrate<S: Scalar, F: Fn(S) -> S>(f: F, a: S, b: S) -> S {
    let width = (b - a) / S::from_f64(GL_PANELS as f64);
    let half = width / S::from_f64(2.0);
    let mut total = S::zero();
    for panel in 0..GL_PANELS {
        let mid = a + width * S::from_f64(panel as f64 + 0.5);
        for (node, weight) in GL_NODES.iter().zip(GL_WEIGHTS.iter()) {
            total += S::from_f64(*weight) * f(mid + half * S::from_f64(*node)) * half;
        }
    }
    total
}
