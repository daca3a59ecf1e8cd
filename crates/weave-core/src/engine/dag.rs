//! Step dependency graph: an arena of steps with index-set edges, validated
//! by a topological sort at submission.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::ValidationError;
use crate::models::agent::Capability;
use crate::models::definition::WorkflowDefinition;

/// Longest per-step timeout a definition or the engine config may ask for
/// (one week).
pub const MAX_STEP_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    capabilities: Vec<Capability>,
    deps: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    /// primary → its designated fallback
    fallback: Vec<Option<usize>>,
    /// fallback → the primary it covers
    primary: Vec<Option<usize>>,
    order: Vec<usize>,
}

impl StepGraph {
    /// Validate a definition and build its graph.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, ValidationError> {
        if def.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if def.steps.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }
        if let Some(retry) = &def.retry {
            retry.validate()?;
        }

        let mut index = HashMap::with_capacity(def.steps.len());
        let mut ids = Vec::with_capacity(def.steps.len());
        let mut capabilities = Vec::with_capacity(def.steps.len());
        for (i, step) in def.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(ValidationError::EmptyStepId);
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateStepId(step.id.clone()));
            }
            let cap = Capability::from_str(&step.step_type).ok_or_else(|| {
                ValidationError::UnknownStepType {
                    step: step.id.clone(),
                    step_type: step.step_type.clone(),
                }
            })?;
            if step.max_attempts == Some(0) {
                return Err(ValidationError::InvalidRetryPolicy(format!(
                    "step {} maxAttempts must be at least 1",
                    step.id
                )));
            }
            if let Some(timeout) = step.timeout_ms {
                if timeout == 0 || timeout > MAX_STEP_TIMEOUT_MS {
                    return Err(ValidationError::InvalidRetryPolicy(format!(
                        "step {} timeoutMs must be within 1..={}",
                        step.id, MAX_STEP_TIMEOUT_MS
                    )));
                }
            }
            ids.push(step.id.clone());
            capabilities.push(cap);
        }

        let n = ids.len();
        let mut deps = vec![BTreeSet::new(); n];
        let mut dependents = vec![BTreeSet::new(); n];
        for (i, step) in def.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(ValidationError::SelfDependency(step.id.clone()));
                }
                let d = *index.get(dep).ok_or_else(|| ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
                deps[i].insert(d);
                dependents[d].insert(i);
            }
        }

        let mut fallback = vec![None; n];
        let mut primary = vec![None; n];
        for (i, step) in def.steps.iter().enumerate() {
            let Some(target) = &step.fallback_for else {
                continue;
            };
            let invalid = |reason: String| ValidationError::InvalidFallback {
                step: step.id.clone(),
                reason,
            };
            if target == &step.id {
                return Err(invalid("a step cannot be its own fallback".to_string()));
            }
            let p = *index
                .get(target)
                .ok_or_else(|| invalid(format!("unknown step {}", target)))?;
            if let Some(existing) = fallback[p] {
                return Err(invalid(format!(
                    "step {} already has fallback {}",
                    target, ids[existing]
                )));
            }
            fallback[p] = Some(i);
            primary[i] = Some(p);
        }

        let mut graph = Self {
            ids,
            index,
            capabilities,
            deps,
            dependents,
            fallback,
            primary,
            order: Vec::new(),
        };
        graph.order = graph.topological_order()?;

        for i in 0..n {
            if let Some(p) = graph.primary[i] {
                if graph.ancestors(i).contains(&p) {
                    return Err(ValidationError::InvalidFallback {
                        step: graph.ids[i].clone(),
                        reason: format!("must not depend on its primary {}", graph.ids[p]),
                    });
                }
            }
        }
        Ok(graph)
    }

    /// Kahn's algorithm over dependency edges plus primary → fallback edges
    /// (a fallback can only start once its primary is decided).
    fn topological_order(&self) -> Result<Vec<usize>, ValidationError> {
        let n = self.ids.len();
        let mut in_degree = vec![0usize; n];
        for i in 0..n {
            in_degree[i] = self.deps[i].len() + usize::from(self.primary[i].is_some());
        }
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            let successors = self.dependents[i].iter().copied().chain(self.fallback[i]);
            for s in successors {
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    queue.push_back(s);
                }
            }
        }
        if order.len() < n {
            let stuck = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.ids[i].clone())
                .collect();
            return Err(ValidationError::CyclicDependency(stuck));
        }
        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, i: usize) -> &str {
        &self.ids[i]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn capability(&self, i: usize) -> Capability {
        self.capabilities[i]
    }

    pub fn deps(&self, i: usize) -> &BTreeSet<usize> {
        &self.deps[i]
    }

    pub fn dependents(&self, i: usize) -> &BTreeSet<usize> {
        &self.dependents[i]
    }

    pub fn fallback_of(&self, i: usize) -> Option<usize> {
        self.fallback[i]
    }

    pub fn primary_of(&self, i: usize) -> Option<usize> {
        self.primary[i]
    }

    /// Topological order; every step comes after its dependencies and
    /// after its primary.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Every step reachable downstream of `i` through dependency edges.
    pub fn transitive_dependents(&self, i: usize) -> BTreeSet<usize> {
        self.walk(i, |j| &self.dependents[j])
    }

    pub fn ancestors(&self, i: usize) -> BTreeSet<usize> {
        self.walk(i, |j| &self.deps[j])
    }

    fn walk<'a, F>(&'a self, start: usize, next: F) -> BTreeSet<usize>
    where
        F: Fn(usize) -> &'a BTreeSet<usize>,
    {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = next(start).iter().copied().collect();
        while let Some(j) = stack.pop() {
            if seen.insert(j) {
                stack.extend(next(j).iter().copied());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::definition::StepDefinition;
    use proptest::prelude::*;

    fn def(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", steps)
    }

    #[test]
    fn orders_diamond() {
        let g = StepGraph::build(&def(vec![
            StepDefinition::new("d", "release", &["b", "c"]),
            StepDefinition::new("b", "build", &["a"]),
            StepDefinition::new("c", "test", &["a"]),
            StepDefinition::new("a", "design", &[]),
        ]))
        .unwrap();
        let pos = |id: &str| {
            let i = g.index_of(id).unwrap();
            g.order().iter().position(|&x| x == i).unwrap()
        };
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d") && pos("c") < pos("d"));
        let a = g.index_of("a").unwrap();
        assert_eq!(g.transitive_dependents(a).len(), 3);
    }

    #[test]
    fn rejects_structural_errors() {
        let cases: Vec<(Vec<StepDefinition>, &str)> = vec![
            (vec![], "empty-workflow"),
            (
                vec![StepDefinition::new("a", "build", &[]), StepDefinition::new("a", "test", &[])],
                "duplicate-step-id",
            ),
            (vec![StepDefinition::new("a", "build", &["zz"])], "unknown-dependency"),
            (vec![StepDefinition::new("a", "build", &["a"])], "self-dependency"),
            (vec![StepDefinition::new("a", "deploy", &[])], "unknown-step-type"),
            (
                vec![
                    StepDefinition::new("a", "build", &["c"]),
                    StepDefinition::new("b", "build", &["a"]),
                    StepDefinition::new("c", "build", &["b"]),
                ],
                "cyclic-dependency",
            ),
        ];
        for (steps, code) in cases {
            assert_eq!(StepGraph::build(&def(steps)).unwrap_err().code(), code);
        }
        for timeout in [0, MAX_STEP_TIMEOUT_MS + 1, u64::MAX] {
            let mut slow = StepDefinition::new("a", "build", &[]);
            slow.timeout_ms = Some(timeout);
            assert_eq!(
                StepGraph::build(&def(vec![slow])).unwrap_err().code(),
                "invalid-retry-policy"
            );
        }
        let mut week = StepDefinition::new("a", "build", &[]);
        week.timeout_ms = Some(MAX_STEP_TIMEOUT_MS);
        assert!(StepGraph::build(&def(vec![week])).is_ok());

        let mut nameless = def(vec![StepDefinition::new("a", "build", &[])]);
        nameless.name = " ".into();
        assert_eq!(StepGraph::build(&nameless).unwrap_err(), ValidationError::EmptyName);
    }

    #[test]
    fn validates_fallbacks() {
        let mut fb = StepDefinition::new("manual", "test", &[]);
        fb.fallback_for = Some("auto".into());
        let g = StepGraph::build(&def(vec![
            StepDefinition::new("auto", "test", &[]),
            fb.clone(),
        ]))
        .unwrap();
        assert_eq!(g.fallback_of(0), Some(1));
        assert_eq!(g.primary_of(1), Some(0));

        let mut second = StepDefinition::new("other", "test", &[]);
        second.fallback_for = Some("auto".into());
        let err = StepGraph::build(&def(vec![
            StepDefinition::new("auto", "test", &[]),
            fb.clone(),
            second,
        ]))
        .unwrap_err();
        assert_eq!(err.code(), "invalid-fallback");

        let mut dependent = StepDefinition::new("manual", "test", &["auto"]);
        dependent.fallback_for = Some("auto".into());
        assert!(StepGraph::build(&def(vec![
            StepDefinition::new("auto", "test", &[]),
            dependent
        ]))
        .is_err());

        // primary waiting on its own fallback is a cycle
        let err = StepGraph::build(&def(vec![
            StepDefinition::new("auto", "test", &["manual"]),
            fb,
        ]))
        .unwrap_err();
        assert_eq!(err.code(), "cyclic-dependency");
    }

    fn random_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..12).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>()
        })
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, deps)| deps.into_iter().filter(|&d| d < i).collect())
                .collect()
        })
    }

    fn to_def(deps: &[Vec<usize>]) -> WorkflowDefinition {
        let steps = deps
            .iter()
            .enumerate()
            .map(|(i, ds)| {
                let names: Vec<String> = ds.iter().map(|d| format!("s{}", d)).collect();
                let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
                StepDefinition::new(&format!("s{}", i), "build", &refs)
            })
            .collect();
        def(steps)
    }

    proptest! {
        #[test]
        fn acyclic_graphs_are_accepted_in_dependency_order(deps in random_dag()) {
            let g = StepGraph::build(&to_def(&deps)).unwrap();
            let mut pos = vec![0; g.len()];
            for (p, &i) in g.order().iter().enumerate() {
                pos[i] = p;
            }
            for i in 0..g.len() {
                for &d in g.deps(i) {
                    prop_assert!(pos[d] < pos[i]);
                }
            }
        }

        #[test]
        fn any_back_edge_is_rejected_as_a_cycle(deps in random_dag(), pick in any::<prop::sample::Index>()) {
            // Close a cycle along an existing edge d -> i by making d depend on i.
            let edges: Vec<(usize, usize)> = deps
                .iter()
                .enumerate()
                .flat_map(|(i, ds)| ds.iter().map(move |&d| (d, i)))
                .collect();
            prop_assume!(!edges.is_empty());
            let (d, i) = edges[pick.index(edges.len())];
            let mut cyclic = deps.clone();
            cyclic[d].push(i);
            let err = StepGraph::build(&to_def(&cyclic)).unwrap_err();
            prop_assert_eq!(err.code(), "cyclic-dependency");
        }
    }
}
