#![deny(unused_imports)]

//! `kingman` computes exact joint site-frequency-spectrum likelihoods for
//! structured demographies: populations that split, merge, and admix over
//! time, each with its own (possibly time-varying) size history.
//!
//! The demographic model is a directed acyclic graph of populations
//! ([`Demography`]), compiled once into an event tree scheduling a bottom-up
//! sum-product computation ([`SumProduct`]). Allele-count distributions are
//! propagated through each population segment by a Moran drift operator
//! (eigendecomposition-based matrix-exponential action) and combined at
//! merge and admixture events by exact hypergeometric downsampling.
//!
//! The two likelihood primitives exposed to an optimizer are the total
//! expected branch length (the normalizing constant of the SFS) and the
//! Poisson-Random-Field composite log-likelihood. Both are generic over a
//! [`Scalar`] type, so evaluating them with [`Dual`] numbers yields exact
//! derivatives with respect to every continuous demographic parameter;
//! nesting duals yields Hessian-vector products.

pub mod demography;
pub mod engine;
pub mod events;
pub mod history;
pub mod likelihood;
pub mod moran;
pub mod scalar;
pub mod special;
pub mod tensor;

pub use demography::{Configuration, Demography, DemographyBuilder, PopId};
pub use engine::SumProduct;
pub use history::{SizeHistory, SizeModel};
pub use likelihood::LikelihoodError;
pub use scalar::{Dual, Scalar};
