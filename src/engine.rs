//! The bottom-up sum-product over the event tree.
//!
//! For each event, in schedule order, the engine computes the partial
//! likelihood of the observed leaf data below it, indexed by the derived
//! allele count at the bottom of each of the event's newly created
//! populations (and of any other population still coexisting there):
//!
//! - a leaf event starts from the observed configuration as a one-hot
//!   indicator;
//! - a merge fetches the consumed populations' tensors at the top of their
//!   segments (drift transition applied), then downsamples exactly: the
//!   hypergeometric split of `k` derived among the two consumed groups is
//!   a polynomial convolution of the binomially weighted child axes,
//!   renormalized by `C(n, k)` on the new axis;
//! - an admixture contracts the consumed axis against the
//!   admixture-probability tensor, producing the two parent axes.
//!
//! The joint SFS entry `p` for a configuration sums, over the events whose
//! subtree could contain the single mutation, the expected branch length
//! in each newly created population weighted by the likelihood that all
//! other coexisting populations carry no derived lineages. A cluster whose
//! sibling subtends derived alleles is skipped: one mutation cannot
//! explain derived alleles on both sides of an independent merge.

use crate::demography::{Configuration, Demography, DemographyError, PopId};
use crate::events::{EventId, EventKind};
use crate::history::HistoryError;
use crate::likelihood::LikelihoodError;
use crate::scalar::Scalar;
use crate::special::binom;
use crate::tensor::{LabeledTensor, TensorError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Demography(#[from] DemographyError),
}

/// One evaluation of the sum-product algorithm: a demography plus one
/// observed configuration. All partial likelihoods are computed at
/// construction; queries are cheap afterwards.
pub struct SumProduct<'a, S: Scalar> {
    demo: &'a Demography<S>,
    config: &'a Configuration,
    bottoms: Vec<LabeledTensor<S>>,
}

impl<'a, S: Scalar> SumProduct<'a, S> {
    pub fn new(
        demo: &'a Demography<S>,
        config: &'a Configuration,
    ) -> Result<Self, EngineError> {
        let tree = demo.event_tree();
        let mut bottoms: Vec<LabeledTensor<S>> = Vec::with_capacity(tree.len());
        for (_, node) in tree.iter() {
            let tensor = match node.kind() {
                EventKind::Leaf => {
                    let leaf = node.parent_pops()[0];
                    LabeledTensor::one_hot(leaf, demo.lineages(leaf), config.derived(leaf))
                }
                EventKind::MergeSubpops => {
                    let (first, source) = node.child_pops()[0];
                    let (second, _) = node.child_pops()[1];
                    let parent = node.parent_pops()[0];
                    let tensor = transitioned(demo, bottoms[source].clone(), first)?;
                    let tensor = transitioned(demo, tensor, second)?;
                    merge_axes(demo, tensor, first, second, parent)?
                }
                EventKind::MergeClusters => {
                    let (first, left) = node.child_pops()[0];
                    let (second, right) = node.child_pops()[1];
                    let parent = node.parent_pops()[0];
                    let a = transitioned(demo, bottoms[left].clone(), first)?;
                    let b = transitioned(demo, bottoms[right].clone(), second)?;
                    merge_axes(demo, a.product(&b), first, second, parent)?
                }
                EventKind::Admixture => {
                    let (consumed, source) = node.child_pops()[0];
                    let tensor = transitioned(demo, bottoms[source].clone(), consumed)?;
                    let admixture = demo.admixture_prob(consumed)?;
                    tensor.product(&admixture).sum_out(consumed)?
                }
            };
            bottoms.push(tensor);
        }
        Ok(SumProduct {
            demo,
            config,
            bottoms,
        })
    }

    /// Partial likelihood at the bottom of the event's created
    /// population(s), axes labeled by the event's `subpops`.
    pub fn partial_likelihood(&self, event: EventId) -> &LabeledTensor<S> {
        &self.bottoms[event]
    }

    /// Truncated SFS vector for one population's segment.
    ///
    /// An infinite root segment has its monomorphic entry suppressed: a
    /// mutation above the sample's common ancestor subtends every lineage
    /// and never yields a polymorphic site.
    pub fn truncated_sfs(&self, pop: PopId) -> Vec<S> {
        let model = self.demo.model(pop);
        let mut sfs = model.sfs().to_vec();
        if model.tau().value().is_infinite() {
            debug_assert_eq!(pop, self.demo.root());
            let top = sfs.len() - 1;
            sfs[top] = S::zero();
        }
        sfs
    }

    /// Expected branch length, within the event's created populations,
    /// of a mutation producing exactly the observed configuration.
    fn own_term(&self, event: EventId) -> Result<S, EngineError> {
        let node = self.demo.event_tree().node(event);
        let mut total = S::zero();
        for &pop in node.parent_pops() {
            let conditional = self.bottoms[event].zeroth_vector(pop)?;
            let sfs = self.truncated_sfs(pop);
            for (lik, branch) in conditional.iter().zip(sfs.iter()) {
                total += *lik * *branch;
            }
        }
        Ok(total)
    }

    /// Observed derived alleles among the leaves below `event`.
    fn derived_under(&self, event: EventId) -> usize {
        self.demo
            .event_tree()
            .node(event)
            .leaves()
            .iter()
            .map(|&l| self.config.derived(l))
            .sum()
    }

    /// The joint SFS entry for this configuration.
    ///
    /// With `normalized = false`, the expected branch length producing
    /// exactly the configuration; with `normalized = true`, that value
    /// divided by the demography's total branch length.
    pub fn p(&self, normalized: bool) -> Result<S, LikelihoodError> {
        let tree = self.demo.event_tree();
        let mut active = vec![false; tree.len()];
        if self.derived_under(tree.root()) > 0 {
            active[tree.root()] = true;
        }
        let mut total = S::zero();
        for event in (0..tree.len()).rev() {
            if !active[event] {
                continue;
            }
            total += self.own_term(event)?;
            let node = tree.node(event);
            match node.kind() {
                EventKind::Leaf => {}
                EventKind::MergeClusters => {
                    let (left, right) = (node.children()[0], node.children()[1]);
                    if self.derived_under(right) == 0 && self.derived_under(left) > 0 {
                        active[left] = true;
                    }
                    if self.derived_under(left) == 0 && self.derived_under(right) > 0 {
                        active[right] = true;
                    }
                }
                EventKind::MergeSubpops | EventKind::Admixture => {
                    let child = node.children()[0];
                    if self.derived_under(child) > 0 {
                        active[child] = true;
                    }
                }
            }
        }
        if normalized {
            total = total / crate::likelihood::total_branch_length(self.demo)?;
        }
        Ok(total)
    }
}

/// Advance a tensor across `pop`'s segment (the "top" of that population).
fn transitioned<S: Scalar>(
    demo: &Demography<S>,
    tensor: LabeledTensor<S>,
    pop: PopId,
) -> Result<LabeledTensor<S>, EngineError> {
    let axis = tensor.axis(pop)?;
    let values = demo.model(pop).transition(tensor.values(), axis)?;
    Ok(tensor.with_values(values))
}

/// Exact hypergeometric downsampling of two consumed axes into the parent
/// population's axis, as a binomially weighted polynomial convolution.
fn merge_axes<S: Scalar>(
    demo: &Demography<S>,
    tensor: LabeledTensor<S>,
    first: PopId,
    second: PopId,
    parent: PopId,
) -> Result<LabeledTensor<S>, EngineError> {
    let weights = |n: usize| -> Vec<S> {
        (0..=n).map(|k| S::from_f64(binom(n, k))).collect()
    };
    let tensor = tensor
        .scale_axis(first, &weights(demo.lineages(first)))?
        .scale_axis(second, &weights(demo.lineages(second)))?
        .convolve(first, second, parent)?;
    let joined = demo.lineages(parent);
    let inverse: Vec<S> = (0..=joined)
        .map(|k| S::one() / S::from_f64(binom(joined, k)))
        .collect();
    Ok(tensor.scale_axis(parent, &inverse)?)
}
