//! Task dependency graph

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::task::TaskDescriptor;

/// Directed "requires" graph over tasks.
///
/// An edge `(t, d)` means `t` requires `d` to have completed. Edges are a
/// multi-relation: adding the same dependency twice stores it twice. No cycle
/// detection happens here; a cycle shows up as a scheduling stall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    tasks: BTreeSet<TaskDescriptor>,
    edges: BTreeMap<TaskDescriptor, Vec<TaskDescriptor>>,
}

impl Dependencies {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `task` and its dependencies. Repeated calls append edges.
    pub fn add<I>(&mut self, task: TaskDescriptor, dependencies: I)
    where
        I: IntoIterator<Item = TaskDescriptor>,
    {
        let edges = self.edges.entry(task.clone()).or_default();
        for dependency in dependencies {
            edges.push(dependency.clone());
            self.tasks.insert(dependency);
        }
        self.tasks.insert(task);
    }

    /// Sub-graph of `other` induced by `targets` and everything they
    /// transitively require.
    ///
    /// Targets unknown to `other` are ignored. Every edge between two
    /// surviving tasks is kept.
    #[instrument(skip_all, fields(tasks = other.len(), targets = tracing::field::Empty))]
    pub fn subset<'a, I>(other: &Dependencies, targets: I) -> Self
    where
        I: IntoIterator<Item = &'a TaskDescriptor>,
    {
        let mut closure: BTreeSet<TaskDescriptor> = BTreeSet::new();
        let mut queue: VecDeque<&TaskDescriptor> = VecDeque::new();

        for target in targets {
            if other.tasks.contains(target) && closure.insert(target.clone()) {
                queue.push_back(target);
            }
        }
        tracing::Span::current().record("targets", closure.len());

        while let Some(task) = queue.pop_front() {
            for dependency in other.dependencies_of(task) {
                if closure.insert(dependency.clone()) {
                    queue.push_back(dependency);
                }
            }
        }

        let edges = other
            .edges
            .iter()
            .filter(|(task, _)| closure.contains(*task))
            .map(|(task, deps)| (task.clone(), deps.clone()))
            .collect();

        debug!(kept = closure.len(), "extracted sub-graph");
        Self {
            tasks: closure,
            edges,
        }
    }

    /// All tasks in the graph
    pub fn tasks(&self) -> &BTreeSet<TaskDescriptor> {
        &self.tasks
    }

    /// Everything `task` directly requires, duplicates included
    pub fn dependencies_of(&self, task: &TaskDescriptor) -> &[TaskDescriptor] {
        self.edges.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the graph contains `task`
    pub fn contains(&self, task: &TaskDescriptor) -> bool {
        self.tasks.contains(task)
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Group tasks into waves using Kahn's algorithm.
    ///
    /// Wave 0 holds tasks with no dependencies; each later wave holds tasks
    /// whose dependencies all sit in earlier waves.
    #[instrument(skip_all, fields(tasks = self.tasks.len()))]
    pub fn waves(&self) -> Result<Vec<Vec<TaskDescriptor>>, DagError> {
        let mut in_degree: HashMap<&TaskDescriptor, usize> = HashMap::new();
        let mut dependents: HashMap<&TaskDescriptor, Vec<&TaskDescriptor>> = HashMap::new();

        for task in &self.tasks {
            let unique: BTreeSet<&TaskDescriptor> = self.dependencies_of(task).iter().collect();
            in_degree.insert(task, unique.len());
            for dependency in unique {
                dependents.entry(dependency).or_default().push(task);
            }
        }

        let mut waves: Vec<Vec<TaskDescriptor>> = Vec::new();
        let mut current: Vec<&TaskDescriptor> = self
            .tasks
            .iter()
            .filter(|t| in_degree.get(*t).copied() == Some(0))
            .collect();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for task in &current {
                for dependent in dependents.get(task).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            placed += current.len();
            let mut wave: Vec<TaskDescriptor> = current.into_iter().cloned().collect();
            wave.sort();
            waves.push(wave);
            current = next;
        }

        if placed != self.tasks.len() {
            let cyclic: Vec<String> = self
                .tasks
                .iter()
                .filter(|t| in_degree.get(*t).copied().unwrap_or(0) > 0)
                .map(|t| t.to_string())
                .collect();
            return Err(DagError::CyclicDependency(cyclic.join(", ")));
        }

        Ok(waves)
    }

    /// Human-readable summary of the execution plan
    pub fn execution_plan(&self) -> Result<String, DagError> {
        let mut plan = String::new();
        for (i, wave) in self.waves()?.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} tasks):\n", i, wave.len()));
            for task in wave {
                let deps: BTreeSet<String> =
                    self.dependencies_of(task).iter().map(|d| d.to_string()).collect();
                if deps.is_empty() {
                    plan.push_str(&format!("  {}\n", task));
                } else {
                    plan.push_str(&format!(
                        "  {} (after: {})\n",
                        task,
                        deps.into_iter().collect::<Vec<_>>().join(", ")
                    ));
                }
            }
        }
        Ok(plan)
    }
}

/// Errors while analysing a graph
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// Cyclic dependency detected
    #[error("Cyclic dependency detected among tasks: {0}")]
    CyclicDependency(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(name: &str) -> TaskDescriptor {
        TaskDescriptor::new(name, "", vec![])
    }

    fn sample() -> Dependencies {
        let mut deps = Dependencies::new();
        deps.add(t("a1"), [t("b1"), t("c1"), t("d1"), t("a2")]);
        deps.add(t("a2"), [t("b2"), t("c2"), t("d2")]);
        deps.add(t("c1"), [t("d2")]);
        deps
    }

    #[test]
    fn test_add_registers_dependencies_as_tasks() {
        let deps = sample();
        assert_eq!(deps.len(), 8);
        for task in deps.edges.values().flatten() {
            assert!(deps.contains(task));
        }
    }

    #[test]
    fn test_add_appends_edges() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), [t("b")]);
        deps.add(t("a"), [t("c"), t("b")]);
        assert_eq!(deps.dependencies_of(&t("a")), &[t("b"), t("c"), t("b")]);
        assert_eq!(deps.len(), 3);
    }

    #[test]
    fn test_task_without_edges() {
        let mut deps = Dependencies::new();
        deps.add(t("solo"), []);
        assert!(deps.contains(&t("solo")));
        assert!(deps.dependencies_of(&t("solo")).is_empty());
    }

    #[test]
    fn test_subset_closes_over_requirements() {
        let deps = sample();
        let sub = Dependencies::subset(&deps, [&t("c1")]);
        let names: Vec<&str> = sub.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["c1", "d2"]);
        assert_eq!(sub.dependencies_of(&t("c1")), &[t("d2")]);

        let sub = Dependencies::subset(&deps, [&t("a2")]);
        assert_eq!(sub.len(), 4);
        assert!(!sub.contains(&t("a1")));
    }

    #[test]
    fn test_subset_is_idempotent() {
        let deps = sample();
        let targets = [t("a2"), t("c1")];
        let once = Dependencies::subset(&deps, &targets);
        let twice = Dependencies::subset(&once, &targets);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_subset_of_root_is_whole_graph() {
        let deps = sample();
        assert_eq!(Dependencies::subset(&deps, [&t("a1")]), deps);
    }

    #[test]
    fn test_subset_ignores_unknown_targets() {
        let deps = sample();
        assert!(Dependencies::subset(&deps, [&t("missing")]).is_empty());
    }

    #[test]
    fn test_waves() {
        let waves = sample().waves().unwrap();
        let names: Vec<Vec<&str>> = waves
            .iter()
            .map(|w| w.iter().map(|t| t.name.as_str()).collect())
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["b1", "b2", "c2", "d1", "d2"],
                vec!["a2", "c1"],
                vec!["a1"],
            ]
        );
    }

    #[test]
    fn test_waves_detect_cycle() {
        let mut deps = Dependencies::new();
        deps.add(t("x"), [t("y")]);
        deps.add(t("y"), [t("x")]);
        deps.add(t("z"), []);
        let err = deps.waves().unwrap_err();
        let DagError::CyclicDependency(names) = err;
        assert!(names.contains('x') && names.contains('y'));
        assert!(!names.contains('z'));
    }

    #[test]
    fn test_execution_plan_output() {
        let plan = sample().execution_plan().unwrap();
        assert!(plan.starts_with("Wave 0 (5 tasks):"));
        assert!(plan.contains("c1 (after: d2)"));
        assert!(plan.contains("Wave 2 (1 tasks):"));
    }
}
