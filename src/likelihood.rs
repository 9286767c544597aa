//! Likelihood primitives consumed by the optimization layer: the SFS
//! normalizing constant (total expected branch length) and the
//! Poisson-Random-Field composite log-likelihood.
//!
//! Both are plain `Scalar` expressions of the demography's continuous
//! parameters, so evaluating a `Demography<Dual<f64>>` yields their exact
//! derivatives. Out-of-domain parameter vectors surface as errors; penalty
//! substitution is the caller's policy, never this crate's.

use crate::demography::{Configuration, Demography};
use crate::engine::{EngineError, SumProduct};
use crate::scalar::Scalar;
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(
        "total branch length must be positive, got {0}; \
         the demography is outside the model's valid regime"
    )]
    NonPositiveBranchTotal(f64),

    #[error("composite log-likelihood must be negative, got {0}")]
    NonNegativeLogLikelihood(f64),
}

/// Total expected branch length over all tree topologies: the factor that
/// normalizes joint SFS entries into probabilities, and the Poisson rate
/// multiplier of the PRF likelihood.
///
/// Computed from two boundary evaluations of an otherwise untouched
/// demography: an all-ancestral sweep counting, in every population, the
/// expected branch length subtending at least one sampled lineage, minus
/// the all-derived probability (which the sweep double-counts). Cached on
/// the demography after the first call.
pub fn total_branch_length<S: Scalar>(demo: &Demography<S>) -> Result<S, LikelihoodError> {
    if let Some(&cached) = demo.cached_branch_total.get() {
        return Ok(cached);
    }
    let ancestral = demo.all_ancestral();
    let sweep = SumProduct::new(demo, &ancestral)?;
    let mut total = S::zero();
    for (event, node) in demo.event_tree().iter() {
        for &pop in node.parent_pops() {
            let none_derived = sweep
                .partial_likelihood(event)
                .zeroth_vector(pop)
                .map_err(EngineError::from)?;
            let sfs = sweep.truncated_sfs(pop);
            // 1 - P(no derived leaf | k derived here) against the branch
            // lengths subtending k lineages
            for (lik, branch) in none_derived.iter().zip(sfs.iter()) {
                total += (S::one() - *lik) * *branch;
            }
        }
    }

    let derived = demo.all_derived();
    let monomorphic = SumProduct::new(demo, &derived)?.p(false)?;
    let total = total - monomorphic;

    if !(total.value() > 0.0) {
        return Err(LikelihoodError::NonPositiveBranchTotal(total.value()));
    }
    log::debug!("total branch length: {}", total.value());
    let _ = demo.cached_branch_total.set(total);
    Ok(total)
}

/// Poisson-Random-Field composite log-likelihood of weighted
/// configurations under mutation rate `theta`.
pub fn log_likelihood_prf<S: Scalar>(
    demo: &Demography<S>,
    theta: S,
    observed: &[(Configuration, f64)],
) -> Result<S, LikelihoodError> {
    let half_theta = theta / S::from_f64(2.0);
    let mut ll = -(total_branch_length(demo)? * half_theta);
    for (config, weight) in observed {
        let evaluation = SumProduct::new(demo, config)?;
        let p = evaluation.p(false)?;
        ll += (p * half_theta).ln() * S::from_f64(*weight);
        ll -= S::from_f64(ln_gamma(*weight + 1.0));
    }
    if !(ll.value() < 0.0) {
        return Err(LikelihoodError::NonNegativeLogLikelihood(ll.value()));
    }
    Ok(ll)
}

impl<S: Scalar> Demography<S> {
    /// See [`total_branch_length`].
    pub fn total_branch_length(&self) -> Result<S, LikelihoodError> {
        total_branch_length(self)
    }

    /// See [`log_likelihood_prf`].
    pub fn log_likelihood_prf(
        &self,
        theta: S,
        observed: &[(Configuration, f64)],
    ) -> Result<S, LikelihoodError> {
        log_likelihood_prf(self, theta, observed)
    }
}
