//! Layer dependency graph.
//!
//! Models layers as nodes in a directed acyclic graph. An edge `A → B` means
//! "B consumes A's output": B is only eligible once A is terminal. Most layers
//! have no edges; the cross-reference layer depends on the vision layer.
//!
//! Readiness is evaluated against the set of terminal layers, so a dependent
//! never waits on a dependency that has already failed or timed out. The
//! scheduler decides separately whether a ready layer runs or is skipped,
//! via [`DependencyGraph::failed_dependency`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::domain::{LayerId, LayerOutcome};

/// Errors produced while building the layer graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// An edge referenced a layer that is not registered.
    #[error("layer not registered in graph: {layer}")]
    UnknownLayer { layer: LayerId },

    /// The edge would introduce a dependency cycle.
    #[error("dependency cycle detected involving layers: {layers:?}")]
    DependencyCycle { layers: Vec<LayerId> },
}

/// Convenience result alias.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Directed dependency graph over [`LayerId`]s.
///
/// Edges are stored in both directions. Cycles are rejected at insertion.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<LayerId>,
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<LayerId, BTreeSet<LayerId>>,
    /// `dependent → {dependency, ...}`
    upstream: BTreeMap<LayerId, BTreeSet<LayerId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer. Idempotent.
    pub fn add_layer(&mut self, layer: LayerId) {
        self.nodes.insert(layer);
        self.downstream.entry(layer).or_default();
        self.upstream.entry(layer).or_default();
    }

    /// Add an edge: `dependent` consumes the output of `dependency`.
    ///
    /// Both layers must already be registered. The edge is rolled back and
    /// [`GraphError::DependencyCycle`] returned if it would close a cycle.
    pub fn add_dependency(&mut self, dependency: LayerId, dependent: LayerId) -> GraphResult<()> {
        for layer in [dependency, dependent] {
            if !self.nodes.contains(&layer) {
                return Err(GraphError::UnknownLayer { layer });
            }
        }

        self.downstream
            .entry(dependency)
            .or_default()
            .insert(dependent);
        self.upstream.entry(dependent).or_default().insert(dependency);

        if let Some(cycle) = self.find_cycle_through(dependent) {
            if let Some(set) = self.downstream.get_mut(&dependency) {
                set.remove(&dependent);
            }
            if let Some(set) = self.upstream.get_mut(&dependent) {
                set.remove(&dependency);
            }
            return Err(GraphError::DependencyCycle { layers: cycle });
        }

        Ok(())
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn contains(&self, layer: LayerId) -> bool {
        self.nodes.contains(&layer)
    }

    /// Direct dependencies of `layer`.
    pub fn dependencies_of(&self, layer: LayerId) -> GraphResult<Vec<LayerId>> {
        if !self.nodes.contains(&layer) {
            return Err(GraphError::UnknownLayer { layer });
        }
        Ok(self
            .upstream
            .get(&layer)
            .into_iter()
            .flatten()
            .copied()
            .collect())
    }

    /// Direct dependents of `layer`.
    pub fn dependents_of(&self, layer: LayerId) -> GraphResult<Vec<LayerId>> {
        if !self.nodes.contains(&layer) {
            return Err(GraphError::UnknownLayer { layer });
        }
        Ok(self
            .downstream
            .get(&layer)
            .into_iter()
            .flatten()
            .copied()
            .collect())
    }

    /// Layers that are not yet terminal and whose dependencies all are.
    pub fn ready_set(&self, terminal: &BTreeSet<LayerId>) -> BTreeSet<LayerId> {
        self.nodes
            .iter()
            .copied()
            .filter(|layer| !terminal.contains(layer))
            .filter(|layer| {
                self.upstream
                    .get(layer)
                    .map_or(true, |deps| deps.iter().all(|d| terminal.contains(d)))
            })
            .collect()
    }

    /// First dependency of `layer` whose outcome is not `completed`.
    ///
    /// A dependency with no recorded outcome counts as failed; callers only
    /// ask about layers in the ready set, where that cannot happen.
    pub fn failed_dependency(
        &self,
        layer: LayerId,
        outcomes: &BTreeMap<LayerId, LayerOutcome>,
    ) -> Option<LayerId> {
        self.upstream.get(&layer)?.iter().copied().find(|dep| {
            outcomes
                .get(dep)
                .map_or(true, |outcome| !outcome.is_completed())
        })
    }

    /// Layers in dependency order (Kahn's algorithm, ties broken by id order).
    pub fn topological_order(&self) -> GraphResult<Vec<LayerId>> {
        let mut in_degree: BTreeMap<LayerId, usize> =
            self.nodes.iter().map(|id| (*id, 0)).collect();
        for dependents in self.downstream.values() {
            for dependent in dependents {
                *in_degree.entry(*dependent).or_default() += 1;
            }
        }

        let mut queue: VecDeque<LayerId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(layer) = queue.pop_front() {
            sorted.push(layer);
            if let Some(dependents) = self.downstream.get(&layer) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            return Err(GraphError::DependencyCycle {
                layers: self.nodes.iter().copied().collect(),
            });
        }
        Ok(sorted)
    }

    /// DFS from `start` to detect cycles. Returns the cycle path if found.
    fn find_cycle_through(&self, start: LayerId) -> Option<Vec<LayerId>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(
        &self,
        node: LayerId,
        visited: &mut BTreeSet<LayerId>,
        path: &mut Vec<LayerId>,
    ) -> bool {
        if path.contains(&node) {
            path.push(node);
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        path.push(node);

        if let Some(dependents) = self.downstream.get(&node) {
            for dependent in dependents {
                if self.dfs_cycle(*dependent, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutcomeKind;
    use std::time::Duration;

    fn standard() -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for id in LayerId::ALL {
            g.add_layer(id);
        }
        g.add_dependency(LayerId::Vision, LayerId::CrossReference)
            .unwrap();
        g
    }

    fn outcome(layer: LayerId, kind: OutcomeKind) -> LayerOutcome {
        match kind {
            OutcomeKind::Completed => LayerOutcome::completed(
                layer,
                1.0,
                vec![],
                serde_json::Value::Null,
                Duration::ZERO,
            ),
            other => LayerOutcome::fallback(layer, other, 0.0, Duration::ZERO, "test"),
        }
    }

    #[test]
    fn test_initial_ready_set_excludes_dependent() {
        let g = standard();
        let ready = g.ready_set(&BTreeSet::new());
        assert_eq!(ready.len(), 5);
        assert!(!ready.contains(&LayerId::CrossReference));
    }

    #[test]
    fn test_dependent_ready_once_dependency_terminal() {
        let g = standard();
        let terminal: BTreeSet<LayerId> = [LayerId::Vision].into_iter().collect();
        let ready = g.ready_set(&terminal);
        assert!(ready.contains(&LayerId::CrossReference));
        assert!(!ready.contains(&LayerId::Vision));
    }

    #[test]
    fn test_failed_dependency_detected_for_timeout_and_failure() {
        let g = standard();
        for kind in [OutcomeKind::TimedOut, OutcomeKind::Failed] {
            let outcomes: BTreeMap<_, _> = [(LayerId::Vision, outcome(LayerId::Vision, kind))]
                .into_iter()
                .collect();
            assert_eq!(
                g.failed_dependency(LayerId::CrossReference, &outcomes),
                Some(LayerId::Vision)
            );
        }

        let ok: BTreeMap<_, _> = [(
            LayerId::Vision,
            outcome(LayerId::Vision, OutcomeKind::Completed),
        )]
        .into_iter()
        .collect();
        assert_eq!(g.failed_dependency(LayerId::CrossReference, &ok), None);
        assert_eq!(g.failed_dependency(LayerId::Exif, &ok), None);
    }

    #[test]
    fn test_topological_order_puts_vision_before_cross_reference() {
        let order = standard().topological_order().unwrap();
        let vision = order.iter().position(|l| *l == LayerId::Vision).unwrap();
        let xref = order
            .iter()
            .position(|l| *l == LayerId::CrossReference)
            .unwrap();
        assert!(vision < xref);
        assert_eq!(order.len(), 6);
    }

    #[test]
    fn test_cycle_detection_rejects_and_rolls_back() {
        let mut g = standard();
        let result = g.add_dependency(LayerId::CrossReference, LayerId::Vision);
        assert!(matches!(result, Err(GraphError::DependencyCycle { .. })));
        // Original edge survives, reverse edge was rolled back.
        assert_eq!(
            g.dependencies_of(LayerId::CrossReference).unwrap(),
            vec![LayerId::Vision]
        );
        assert!(g.dependencies_of(LayerId::Vision).unwrap().is_empty());
        assert!(g.topological_order().is_ok());
    }

    #[test]
    fn test_unknown_layer_rejected() {
        let mut g = DependencyGraph::new();
        g.add_layer(LayerId::Exif);
        let r = g.add_dependency(LayerId::Exif, LayerId::Geo);
        assert!(matches!(
            r,
            Err(GraphError::UnknownLayer {
                layer: LayerId::Geo
            })
        ));
    }

    #[test]
    fn test_dependents_of() {
        let g = standard();
        assert_eq!(
            g.dependents_of(LayerId::Vision).unwrap(),
            vec![LayerId::CrossReference]
        );
        assert!(g.dependents_of(LayerId::Geo).unwrap().is_empty());
    }
}
