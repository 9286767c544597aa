//! The demographic graph: populations, size models, admixture, and the
//! observed-configuration values evaluated against it.
//!
//! Edges point from parent population to child population, i.e. against
//! time; leaves are the sampled populations at the present. A
//! [`DemographyBuilder`] collects populations, edges, split probabilities,
//! and the ordered coalescent-event list, then `build` validates the
//! structure, computes lineage counts bottom-up, resolves every size model
//! into a concrete [`SizeHistory`], and compiles the event tree. The
//! resulting [`Demography`] is immutable: observation state lives in
//! [`Configuration`] values passed to each evaluation, never on the graph,
//! so one instance can back any number of concurrent evaluations.

use crate::events::EventTree;
use crate::history::{HistoryError, SizeHistory, SizeModel};
use crate::scalar::Scalar;
use crate::special::binom;
use crate::tensor::LabeledTensor;
use dashmap::DashMap;
use ndarray::{ArrayD, IxDyn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Interned population identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PopId(pub(crate) usize);

impl fmt::Display for PopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum DemographyError {
    #[error("population name {0:?} is already in use")]
    DuplicateName(String),

    #[error("unknown population {0:?}")]
    UnknownName(String),

    #[error("an edge cannot connect a population to itself")]
    SelfEdge,

    #[error("edge {0} -> {1} appears more than once")]
    DuplicateEdge(PopId, PopId),

    #[error("the graph must have exactly one root population, found {0}")]
    RootCount(usize),

    #[error("the population graph contains a cycle")]
    GraphCycle,

    #[error("leaf population {0:?} must carry a positive number of sampled lineages")]
    MissingLineages(String),

    #[error("population {0:?} carries sampled lineages but is not a leaf")]
    LineagesOnInternal(String),

    #[error("population {0:?} has {1} parents; at most two are allowed")]
    TooManyParents(String, usize),

    #[error("admixture population {0:?} needs split probabilities for both parents")]
    MissingSplitProbs(String),

    #[error("split probabilities of {0:?} must name exactly its two parents")]
    SplitProbParentMismatch(String),

    #[error("split probabilities of {0:?} sum to {1}, expected 1")]
    SplitProbSum(String, f64),

    #[error("event {index} references edge {parent} -> {child}, which is not in the graph")]
    EventEdgeMissing {
        index: usize,
        parent: PopId,
        child: PopId,
    },

    #[error("event {index} must involve exactly three distinct populations, found {roles}")]
    MalformedEvent { index: usize, roles: usize },

    #[error("event {index} consumes population {pop}, which is not live at that time")]
    DeadPopulation { index: usize, pop: PopId },

    #[error("event {index} re-creates population {pop}, which is still live")]
    PopulationAlreadyLive { index: usize, pop: PopId },

    #[error("population {0:?} is not an admixture node")]
    NotAdmixture(String),

    #[error("{0:?} is not a leaf population")]
    NotALeaf(String),

    #[error(
        "configuration for leaf {name:?}: derived ({derived}) + ancestral ({ancestral}) \
         does not equal the lineage count ({lineages})"
    )]
    BadConfiguration {
        name: String,
        derived: usize,
        ancestral: usize,
        lineages: usize,
    },

    #[error("configuration must cover every leaf; {0:?} is missing")]
    MissingLeafState(String),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Per-leaf observed allele counts for one evaluation.
///
/// Kept separate from the graph (which stays immutable) so that repeated
/// and concurrent evaluations cannot trample each other's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    derived: BTreeMap<PopId, usize>,
}

impl Configuration {
    pub fn derived(&self, leaf: PopId) -> usize {
        self.derived.get(&leaf).copied().unwrap_or(0)
    }
}

/// An immutable, validated demographic graph with its compiled event tree.
pub struct Demography<S: Scalar> {
    names: Vec<String>,
    index: HashMap<String, PopId>,
    parents: Vec<Vec<PopId>>,
    children: Vec<Vec<PopId>>,
    lineages: Vec<usize>,
    models: Vec<SizeHistory<S>>,
    splitprobs: Vec<Option<[(PopId, S); 2]>>,
    root: PopId,
    leaves: Vec<PopId>,
    event_tree: EventTree,
    pub(crate) cached_branch_total: OnceLock<S>,
}

pub struct DemographyBuilder<S: Scalar> {
    names: Vec<String>,
    index: HashMap<String, PopId>,
    lineages: Vec<Option<usize>>,
    models: Vec<SizeModel<S>>,
    edges: Vec<(PopId, PopId)>,
    splitprobs: Vec<Option<[(PopId, S); 2]>>,
    events: Vec<[(PopId, PopId); 2]>,
}

impl<S: Scalar> Default for DemographyBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scalar> DemographyBuilder<S> {
    pub fn new() -> Self {
        DemographyBuilder {
            names: Vec::new(),
            index: HashMap::new(),
            lineages: Vec::new(),
            models: Vec::new(),
            edges: Vec::new(),
            splitprobs: Vec::new(),
            events: Vec::new(),
        }
    }

    fn intern(&mut self, name: &str) -> Result<PopId, DemographyError> {
        if self.index.contains_key(name) {
            return Err(DemographyError::DuplicateName(name.to_string()));
        }
        let id = PopId(self.names.len());
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    /// An ancestral (internal) population.
    pub fn add_population(
        &mut self,
        name: &str,
        model: SizeModel<S>,
    ) -> Result<PopId, DemographyError> {
        let id = self.intern(name)?;
        self.lineages.push(None);
        self.models.push(model);
        self.splitprobs.push(None);
        Ok(id)
    }

    /// A sampled population with `lineages` lineages at the present.
    pub fn add_leaf(
        &mut self,
        name: &str,
        lineages: usize,
        model: SizeModel<S>,
    ) -> Result<PopId, DemographyError> {
        if lineages == 0 {
            return Err(DemographyError::MissingLineages(name.to_string()));
        }
        let id = self.intern(name)?;
        self.lineages.push(Some(lineages));
        self.models.push(model);
        self.splitprobs.push(None);
        Ok(id)
    }

    /// An edge from `parent` (earlier) to `child` (later).
    pub fn add_edge(&mut self, parent: PopId, child: PopId) -> Result<(), DemographyError> {
        if parent == child {
            return Err(DemographyError::SelfEdge);
        }
        self.edges.push((parent, child));
        Ok(())
    }

    /// Mixture probabilities for an admixture node's two parents.
    pub fn set_split_probs(
        &mut self,
        child: PopId,
        first: (PopId, S),
        second: (PopId, S),
    ) {
        self.splitprobs[child.0] = Some([first, second]);
    }

    /// Append a coalescent event realized by two parent->child edges, in
    /// temporal order from the present backwards.
    pub fn add_event(&mut self, first: (PopId, PopId), second: (PopId, PopId)) {
        self.events.push([first, second]);
    }

    pub fn build(self) -> Result<Demography<S>, DemographyError> {
        let n = self.names.len();
        let mut parents: Vec<Vec<PopId>> = vec![Vec::new(); n];
        let mut children: Vec<Vec<PopId>> = vec![Vec::new(); n];
        for &(p, c) in &self.edges {
            if parents[c.0].contains(&p) {
                return Err(DemographyError::DuplicateEdge(p, c));
            }
            parents[c.0].push(p);
            children[p.0].push(c);
        }

        let roots: Vec<PopId> = (0..n)
            .map(PopId)
            .filter(|&v| parents[v.0].is_empty())
            .collect();
        if roots.len() != 1 {
            return Err(DemographyError::RootCount(roots.len()));
        }
        let root = roots[0];
        let leaves: Vec<PopId> = (0..n)
            .map(PopId)
            .filter(|&v| children[v.0].is_empty())
            .collect();

        for v in 0..n {
            let is_leaf = children[v].is_empty();
            match (is_leaf, self.lineages[v]) {
                (true, None) => {
                    return Err(DemographyError::MissingLineages(self.names[v].clone()));
                }
                (false, Some(_)) => {
                    return Err(DemographyError::LineagesOnInternal(self.names[v].clone()));
                }
                _ => {}
            }
        }

        // lineage counts accumulate from the leaves up; an admixture child
        // contributes its full count to both parents
        let mut lineages = vec![0usize; n];
        let mut remaining: Vec<usize> = (0..n).map(|v| children[v].len()).collect();
        let mut queue: Vec<PopId> = leaves.clone();
        for &l in &leaves {
            lineages[l.0] = self.lineages[l.0].expect("leaves were checked above");
        }
        let mut processed = 0;
        while let Some(v) = queue.pop() {
            processed += 1;
            for &p in &parents[v.0] {
                lineages[p.0] += lineages[v.0];
                remaining[p.0] -= 1;
                if remaining[p.0] == 0 {
                    queue.push(p);
                }
            }
        }
        if processed != n {
            return Err(DemographyError::GraphCycle);
        }

        for v in 0..n {
            let name = || self.names[v].clone();
            match (parents[v].len(), &self.splitprobs[v]) {
                (0, None) | (1, None) => {}
                (2, Some(probs)) => {
                    let mut named: Vec<PopId> = probs.iter().map(|&(p, _)| p).collect();
                    named.sort();
                    let mut actual = parents[v].clone();
                    actual.sort();
                    if named != actual || named[0] == named[1] {
                        return Err(DemographyError::SplitProbParentMismatch(name()));
                    }
                    let total: f64 = probs.iter().map(|&(_, w)| w.value()).sum();
                    if (total - 1.0).abs() > 1e-9 {
                        return Err(DemographyError::SplitProbSum(name(), total));
                    }
                }
                (2, None) => return Err(DemographyError::MissingSplitProbs(name())),
                (k, None) => return Err(DemographyError::TooManyParents(name(), k)),
                (_, Some(_)) => return Err(DemographyError::SplitProbParentMismatch(name())),
            }
        }

        // events must reference real edges
        let edge_set: std::collections::HashSet<(PopId, PopId)> =
            self.edges.iter().copied().collect();
        for (index, event) in self.events.iter().enumerate() {
            for &(parent, child) in event {
                if !edge_set.contains(&(parent, child)) {
                    return Err(DemographyError::EventEdgeMissing {
                        index,
                        parent,
                        child,
                    });
                }
            }
        }

        let models = self
            .models
            .iter()
            .enumerate()
            .map(|(v, model)| model.resolve(lineages[v]))
            .collect::<Result<Vec<_>, _>>()?;

        let mut sorted_leaves = leaves;
        sorted_leaves.sort();
        let event_tree = EventTree::build(&sorted_leaves, &self.events)?;
        log::debug!(
            "demography built: {} populations ({} leaves), {} events, root {:?}",
            n,
            sorted_leaves.len(),
            event_tree.len(),
            self.names[root.0],
        );

        Ok(Demography {
            names: self.names,
            index: self.index,
            parents,
            children,
            lineages,
            models,
            splitprobs: self.splitprobs,
            root,
            leaves: sorted_leaves,
            event_tree,
            cached_branch_total: OnceLock::new(),
        })
    }
}

impl<S: Scalar> Demography<S> {
    pub fn builder() -> DemographyBuilder<S> {
        DemographyBuilder::new()
    }

    pub fn pop(&self, name: &str) -> Option<PopId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, pop: PopId) -> &str {
        &self.names[pop.0]
    }

    /// Number of lineages present at the bottom of this population's
    /// segment (at least the leaf total below it).
    pub fn lineages(&self, pop: PopId) -> usize {
        self.lineages[pop.0]
    }

    pub fn model(&self, pop: PopId) -> &SizeHistory<S> {
        &self.models[pop.0]
    }

    pub fn root(&self) -> PopId {
        self.root
    }

    pub fn leaves(&self) -> &[PopId] {
        &self.leaves
    }

    pub fn is_leaf(&self, pop: PopId) -> bool {
        self.children[pop.0].is_empty()
    }

    pub fn parents(&self, pop: PopId) -> &[PopId] {
        &self.parents[pop.0]
    }

    pub fn event_tree(&self) -> &EventTree {
        &self.event_tree
    }

    /// Validate per-leaf observation state `(name, derived, ancestral)`.
    pub fn configuration(
        &self,
        states: &[(&str, usize, usize)],
    ) -> Result<Configuration, DemographyError> {
        let mut derived = BTreeMap::new();
        for &(name, der, anc) in states {
            let pop = self
                .pop(name)
                .ok_or_else(|| DemographyError::UnknownName(name.to_string()))?;
            if !self.is_leaf(pop) {
                return Err(DemographyError::NotALeaf(name.to_string()));
            }
            let lineages = self.lineages(pop);
            if der + anc != lineages {
                return Err(DemographyError::BadConfiguration {
                    name: name.to_string(),
                    derived: der,
                    ancestral: anc,
                    lineages,
                });
            }
            derived.insert(pop, der);
        }
        for &leaf in &self.leaves {
            if !derived.contains_key(&leaf) {
                return Err(DemographyError::MissingLeafState(
                    self.name(leaf).to_string(),
                ));
            }
        }
        Ok(Configuration { derived })
    }

    /// Every leaf fully ancestral.
    pub fn all_ancestral(&self) -> Configuration {
        Configuration {
            derived: self.leaves.iter().map(|&l| (l, 0)).collect(),
        }
    }

    /// Every leaf fully derived.
    pub fn all_derived(&self) -> Configuration {
        Configuration {
            derived: self
                .leaves
                .iter()
                .map(|&l| (l, self.lineages(l)))
                .collect(),
        }
    }

    /// The admixture-probability tensor for an admixture node: entry
    /// `(child_derived, parent1_derived, parent2_derived)` is the
    /// probability of observing `child_derived` derived alleles among the
    /// node's lineages given the parents' derived counts, mixing over the
    /// binomially distributed number of lineages inherited from each
    /// parent.
    pub fn admixture_prob(&self, child: PopId) -> Result<LabeledTensor<S>, DemographyError> {
        let probs = self.splitprobs[child.0]
            .as_ref()
            .ok_or_else(|| DemographyError::NotAdmixture(self.name(child).to_string()))?;
        let [(parent1, prob1), (parent2, prob2)] = *probs;
        let n = self.lineages(child);
        let mut values = ArrayD::from_elem(IxDyn(&[n + 1, n + 1, n + 1]), S::zero());
        for from_first in 0..=n {
            let from_second = n - from_first;
            let weight = S::from_f64(binom(n, from_first))
                * prob1.powi(from_first as i32)
                * prob2.powi(from_second as i32);
            for d1 in 0..=n {
                for d2 in 0..=n {
                    let kernel = inherited_derived(from_first, from_second, d1, d2);
                    for (cd, k) in kernel.iter().enumerate() {
                        if *k != 0.0 {
                            values[[cd, d1, d2]] += weight * S::from_f64(*k);
                        }
                    }
                }
            }
        }
        Ok(LabeledTensor::new(values, vec![child, parent1, parent2])
            .expect("child and parent labels are distinct"))
    }
}

/// Probability vector over the admixture node's derived count, given that
/// it inherits `n1` lineages from a parent carrying `d1` derived alleles
/// and `n2` from one carrying `d2`.
///
/// The two per-parent hypergeometric sampling kernels are convolved; the
/// result depends only on the four integers, recurs across admixture
/// evaluations, and is therefore memoized process-wide.
fn inherited_derived(n1: usize, n2: usize, d1: usize, d2: usize) -> Arc<Vec<f64>> {
    static CACHE: OnceLock<DashMap<(usize, usize, usize, usize), Arc<Vec<f64>>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(DashMap::new);
    let key = (n1, n2, d1, d2);
    if let Some(hit) = cache.get(&key) {
        return hit.clone();
    }
    let n = n1 + n2;
    let mut parts: Vec<Vec<f64>> = Vec::with_capacity(2);
    for (m, d) in [(n1, d1), (n2, d2)] {
        let anc = n - d;
        parts.push(
            (0..=m)
                .map(|k| binom(d, k) * binom(anc, m - k) / binom(n, m))
                .collect(),
        );
    }
    let mut out = vec![0.0; n + 1];
    for (i, a) in parts[0].iter().enumerate() {
        for (j, b) in parts[1].iter().enumerate() {
            out[i + j] += a * b;
        }
    }
    let out = Arc::new(out);
    cache.insert(key, out.clone());
    out
}
