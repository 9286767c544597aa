//! The event tree: the discrete schedule driving the sum-product
//! computation.
//!
//! Built once per demography from the leaves and the ordered list of raw
//! coalescent events (pairs of parent->child edges). Each node records the
//! populations coexisting just above it (`subpops`), the populations it
//! creates (`parent_pops`), and which earlier event produced each consumed
//! population (`child_pops`). The vector order is the raw event order,
//! which is also a topological order of the tree: every child event
//! precedes its parent, and the final event owns the root population.

use crate::demography::{DemographyError, PopId};
use itertools::Itertools;
use std::collections::{BTreeSet, HashMap};

pub type EventId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A sampled population entering the computation.
    Leaf,
    /// One consumed population, two created parent populations.
    Admixture,
    /// Two consumed populations produced by two distinct child events.
    MergeClusters,
    /// Two consumed populations produced by the same child event.
    MergeSubpops,
}

#[derive(Debug, Clone)]
pub struct EventNode {
    subpops: Vec<PopId>,
    parent_pops: Vec<PopId>,
    child_pops: Vec<(PopId, EventId)>,
    children: Vec<EventId>,
    leaves: Vec<PopId>,
}

impl EventNode {
    /// Populations coexisting just above this event, sorted.
    pub fn subpops(&self) -> &[PopId] {
        &self.subpops
    }

    /// Populations created by this event (one for merges, two for an
    /// admixture).
    pub fn parent_pops(&self) -> &[PopId] {
        &self.parent_pops
    }

    /// Consumed population together with the event that produced it.
    pub fn child_pops(&self) -> &[(PopId, EventId)] {
        &self.child_pops
    }

    /// Distinct child events, in id order.
    pub fn children(&self) -> &[EventId] {
        &self.children
    }

    /// Leaf populations subtended by this event.
    pub fn leaves(&self) -> &[PopId] {
        &self.leaves
    }

    /// The event type is derived from the stored structure, never stored.
    pub fn kind(&self) -> EventKind {
        if self.children.is_empty() {
            EventKind::Leaf
        } else if self.parent_pops.len() == 2 {
            EventKind::Admixture
        } else if self.children.len() == 2 {
            EventKind::MergeClusters
        } else {
            EventKind::MergeSubpops
        }
    }
}

/// Immutable schedule of events, bottom-up in vector order.
#[derive(Debug, Clone)]
pub struct EventTree {
    nodes: Vec<EventNode>,
    root: EventId,
}

impl EventTree {
    pub(crate) fn build(
        leaves: &[PopId],
        raw: &[[(PopId, PopId); 2]],
    ) -> Result<Self, DemographyError> {
        let mut nodes: Vec<EventNode> = leaves
            .iter()
            .map(|&l| EventNode {
                subpops: vec![l],
                parent_pops: vec![l],
                child_pops: Vec::new(),
                children: Vec::new(),
                leaves: vec![l],
            })
            .collect();
        let mut live: HashMap<PopId, EventId> =
            leaves.iter().enumerate().map(|(e, &l)| (l, e)).collect();

        for (index, &[first, second]) in raw.iter().enumerate() {
            let parent_pops: Vec<PopId> =
                [first.0, second.0].into_iter().unique().sorted().collect();
            let consumed: Vec<PopId> =
                [first.1, second.1].into_iter().unique().sorted().collect();
            let roles = parent_pops.len() + consumed.len();
            if roles != 3 {
                return Err(DemographyError::MalformedEvent { index, roles });
            }

            let mut child_pops = Vec::with_capacity(consumed.len());
            for &pop in &consumed {
                let owner = *live
                    .get(&pop)
                    .ok_or(DemographyError::DeadPopulation { index, pop })?;
                child_pops.push((pop, owner));
            }
            let children: Vec<EventId> = child_pops
                .iter()
                .map(|&(_, e)| e)
                .unique()
                .sorted()
                .collect();

            let mut subpops: BTreeSet<PopId> = children
                .iter()
                .flat_map(|&e| nodes[e].subpops.iter().copied())
                .collect();
            for &(pop, _) in &child_pops {
                subpops.remove(&pop);
            }
            for &pop in &parent_pops {
                if live.contains_key(&pop) {
                    return Err(DemographyError::PopulationAlreadyLive { index, pop });
                }
                subpops.insert(pop);
            }
            let event_leaves: Vec<PopId> = children
                .iter()
                .flat_map(|&e| nodes[e].leaves.iter().copied())
                .unique()
                .sorted()
                .collect();

            let id = nodes.len();
            for &(pop, _) in &child_pops {
                live.remove(&pop);
            }
            for &pop in &subpops {
                live.insert(pop, id);
            }
            nodes.push(EventNode {
                subpops: subpops.into_iter().collect(),
                parent_pops,
                child_pops,
                children,
                leaves: event_leaves,
            });
        }

        if live.len() != 1 {
            return Err(DemographyError::RootCount(live.len()));
        }
        let root = *live.values().next().expect("live has exactly one entry");
        Ok(EventTree { nodes, root })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> EventId {
        self.root
    }

    pub fn node(&self, event: EventId) -> &EventNode {
        &self.nodes[event]
    }

    /// Events in bottom-up (construction) order.
    pub fn iter(&self) -> impl Iterator<Item = (EventId, &EventNode)> {
        self.nodes.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pop(i: usize) -> PopId {
        PopId(i)
    }

    /// x, y -> anc
    fn simple_merge() -> EventTree {
        EventTree::build(
            &[pop(0), pop(1)],
            &[[(pop(2), pop(0)), (pop(2), pop(1))]],
        )
        .unwrap()
    }

    #[test]
    fn merge_of_two_leaves() {
        let tree = simple_merge();
        assert_eq!(tree.len(), 3);
        let root = tree.node(tree.root());
        assert_eq!(root.kind(), EventKind::MergeClusters);
        assert_eq!(root.subpops(), &[pop(2)]);
        assert_eq!(root.parent_pops(), &[pop(2)]);
        assert_eq!(root.children(), &[0, 1]);
        assert_eq!(root.leaves(), &[pop(0), pop(1)]);
        assert_eq!(tree.node(0).kind(), EventKind::Leaf);
    }

    #[test]
    fn admixture_followed_by_merge_of_its_parents() {
        // leaf 0 admixes from 1 and 2, which then merge into 3
        let tree = EventTree::build(
            &[pop(0)],
            &[
                [(pop(1), pop(0)), (pop(2), pop(0))],
                [(pop(3), pop(1)), (pop(3), pop(2))],
            ],
        )
        .unwrap();
        assert_eq!(tree.len(), 3);
        let admix = tree.node(1);
        assert_eq!(admix.kind(), EventKind::Admixture);
        assert_eq!(admix.parent_pops(), &[pop(1), pop(2)]);
        assert_eq!(admix.subpops(), &[pop(1), pop(2)]);
        let merge = tree.node(tree.root());
        // both consumed pops come from the same child event
        assert_eq!(merge.kind(), EventKind::MergeSubpops);
        assert_eq!(merge.children(), &[1]);
        assert_eq!(merge.subpops(), &[pop(3)]);
    }

    #[test]
    fn three_leaves_nested_merges() {
        // (0, 1) -> 3, then (3, 2) -> 4
        let tree = EventTree::build(
            &[pop(0), pop(1), pop(2)],
            &[
                [(pop(3), pop(0)), (pop(3), pop(1))],
                [(pop(4), pop(3)), (pop(4), pop(2))],
            ],
        )
        .unwrap();
        assert_eq!(tree.len(), 5);
        let root = tree.node(tree.root());
        assert_eq!(root.kind(), EventKind::MergeClusters);
        assert_eq!(root.subpops(), &[pop(4)]);
        assert_eq!(root.leaves(), &[pop(0), pop(1), pop(2)]);
    }

    #[test]
    fn unmerged_clusters_are_rejected() {
        let result = EventTree::build(&[pop(0), pop(1)], &[]);
        assert!(matches!(result, Err(DemographyError::RootCount(2))));
    }

    #[test]
    fn consuming_a_dead_population_is_rejected() {
        // second event consumes leaf 0 again
        let result = EventTree::build(
            &[pop(0), pop(1)],
            &[
                [(pop(2), pop(0)), (pop(2), pop(1))],
                [(pop(3), pop(0)), (pop(3), pop(2))],
            ],
        );
        assert!(matches!(
            result,
            Err(DemographyError::DeadPopulation { index: 1, .. })
        ));
    }

    #[test]
    fn degenerate_edge_pairs_are_rejected() {
        // the same edge twice involves only two distinct roles
        let result = EventTree::build(
            &[pop(0)],
            &[[(pop(1), pop(0)), (pop(1), pop(0))]],
        );
        assert!(matches!(
            result,
            Err(DemographyError::MalformedEvent { roles: 2, .. })
        ));
    }

    #[test]
    fn single_leaf_tree_has_leaf_root() {
        let tree = EventTree::build(&[pop(0)], &[]).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.node(tree.root()).kind(), EventKind::Leaf);
    }
}
