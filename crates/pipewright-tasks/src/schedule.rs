//! Stateful scheduler over a fixed dependency graph

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::dag::Dependencies;
use crate::task::TaskDescriptor;

/// Tracks which tasks are complete and which are runnable
#[derive(Debug, Clone)]
pub struct Schedule {
    dependencies: Dependencies,
    complete: BTreeSet<TaskDescriptor>,
}

impl Schedule {
    /// Create a schedule with nothing completed
    pub fn new(dependencies: Dependencies) -> Self {
        Self {
            dependencies,
            complete: BTreeSet::new(),
        }
    }

    /// The underlying graph
    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    /// Incomplete tasks whose every dependency is complete.
    ///
    /// The returned set has no meaningful order and may be run in parallel.
    pub fn get_ready(&self) -> BTreeSet<TaskDescriptor> {
        self.pending()
            .filter(|task| {
                self.dependencies
                    .dependencies_of(task)
                    .iter()
                    .all(|d| self.complete.contains(d))
            })
            .cloned()
            .collect()
    }

    /// Mark a task complete. No readiness check is made.
    pub fn complete(&mut self, task: TaskDescriptor) {
        debug!(task = %task, "task complete");
        self.complete.insert(task);
    }

    /// Whether every task in the graph is complete
    pub fn is_complete(&self) -> bool {
        self.dependencies.tasks().iter().all(|t| self.complete.contains(t))
    }

    /// Tasks not yet completed
    pub fn pending(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.dependencies
            .tasks()
            .iter()
            .filter(move |t| !self.complete.contains(*t))
    }

    /// Find the task with this name and source file
    pub fn get_task(&self, name: &str, source_file: &str) -> Option<&TaskDescriptor> {
        self.dependencies
            .tasks()
            .iter()
            .find(|t| t.matches(name, Some(source_file)))
    }

    /// Every task with this name
    pub fn get_tasks(&self, name: &str) -> Vec<&TaskDescriptor> {
        self.dependencies
            .tasks()
            .iter()
            .filter(|t| t.matches(name, None))
            .collect()
    }

    /// Describe the frontier when no progress is possible.
    ///
    /// Returns `None` if the schedule is complete or something is ready.
    pub fn stall_report(&self) -> Option<ScheduleError> {
        if self.is_complete() || !self.get_ready().is_empty() {
            return None;
        }

        let pending = self
            .pending()
            .map(|task| {
                let unmet: BTreeSet<TaskDescriptor> = self
                    .dependencies
                    .dependencies_of(task)
                    .iter()
                    .filter(|d| !self.complete.contains(*d))
                    .cloned()
                    .collect();
                StalledTask {
                    task: task.clone(),
                    unmet: unmet.into_iter().collect(),
                }
            })
            .collect();

        Some(ScheduleError::Stalled { pending })
    }
}

/// A pending task and the dependencies holding it back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledTask {
    pub task: TaskDescriptor,
    pub unmet: Vec<TaskDescriptor>,
}

impl fmt::Display for StalledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unmet: Vec<String> = self.unmet.iter().map(|t| t.to_string()).collect();
        write!(f, "{} waiting on [{}]", self.task, unmet.join(", "))
    }
}

fn format_stalled(pending: &[StalledTask]) -> String {
    pending
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Scheduling errors
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Nothing is ready but the schedule is incomplete: a cycle or an
    /// unsatisfiable dependency
    #[error("Failed to make progress executing pipeline: {}", format_stalled(.pending))]
    Stalled { pending: Vec<StalledTask> },

    /// A requested task is not in the graph
    #[error("Task not found: {0}")]
    TaskNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(name: &str) -> TaskDescriptor {
        TaskDescriptor::new(name, "", vec![])
    }

    fn names(set: &BTreeSet<TaskDescriptor>) -> Vec<&str> {
        set.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_single_dependency() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), [t("b")]);
        deps.add(t("b"), []);
        let mut schedule = Schedule::new(deps);

        assert_eq!(names(&schedule.get_ready()), vec!["b"]);
        schedule.complete(t("b"));
        assert_eq!(names(&schedule.get_ready()), vec!["a"]);
        assert!(!schedule.is_complete());
        schedule.complete(t("a"));
        assert!(schedule.is_complete());
        assert!(schedule.get_ready().is_empty());
    }

    #[test]
    fn test_frontier_sequence() {
        let mut deps = Dependencies::new();
        deps.add(t("a1"), [t("b1"), t("c1"), t("d1"), t("a2")]);
        deps.add(t("a2"), [t("b2"), t("c2"), t("d2")]);
        deps.add(t("c1"), [t("d2")]);
        let mut schedule = Schedule::new(deps);

        let ready = schedule.get_ready();
        assert_eq!(names(&ready), vec!["b1", "b2", "c2", "d1", "d2"]);
        for task in ready {
            schedule.complete(task);
        }

        let ready = schedule.get_ready();
        assert_eq!(names(&ready), vec!["a2", "c1"]);
        for task in ready {
            schedule.complete(task);
        }

        let ready = schedule.get_ready();
        assert_eq!(names(&ready), vec!["a1"]);
        schedule.complete(t("a1"));
        assert!(schedule.is_complete());
    }

    #[test]
    fn test_each_task_ready_at_most_once() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), [t("b"), t("c")]);
        deps.add(t("b"), [t("c")]);
        deps.add(t("d"), [t("c")]);
        let mut schedule = Schedule::new(deps);

        let mut seen = BTreeSet::new();
        while !schedule.is_complete() {
            let ready = schedule.get_ready();
            assert!(!ready.is_empty());
            for task in ready {
                for dep in schedule.dependencies().dependencies_of(&task).to_vec() {
                    assert!(seen.contains(&dep), "{} ran before {}", task, dep);
                }
                assert!(seen.insert(task.clone()), "{} returned twice", task);
                schedule.complete(task);
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_complete_out_of_order_is_allowed() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), [t("b")]);
        let mut schedule = Schedule::new(deps);
        schedule.complete(t("a"));
        assert_eq!(names(&schedule.get_ready()), vec!["b"]);
    }

    #[test]
    fn test_lookups() {
        let mut deps = Dependencies::new();
        deps.add(
            TaskDescriptor::new("compile", "a.src", vec![]),
            [TaskDescriptor::new("manifest", "", vec![])],
        );
        deps.add(
            TaskDescriptor::new("compile", "b.src", vec![]),
            [TaskDescriptor::new("manifest", "", vec![])],
        );
        let schedule = Schedule::new(deps);

        assert_eq!(schedule.get_tasks("compile").len(), 2);
        assert!(schedule.get_task("compile", "b.src").is_some());
        assert!(schedule.get_task("compile", "c.src").is_none());
        assert!(schedule.get_tasks("link").is_empty());
    }

    #[test]
    fn test_stall_report_names_cycle() {
        let mut deps = Dependencies::new();
        deps.add(t("x"), [t("y")]);
        deps.add(t("y"), [t("x")]);
        deps.add(t("z"), []);
        let mut schedule = Schedule::new(deps);

        assert!(schedule.stall_report().is_none());
        schedule.complete(t("z"));

        let err = schedule.stall_report().unwrap();
        let ScheduleError::Stalled { pending } = &err else {
            panic!("expected stall");
        };
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].unmet, vec![t("y")]);
        let message = err.to_string();
        assert!(message.contains("x waiting on [y]"));
        assert!(message.contains("y waiting on [x]"));
    }

    #[test]
    fn test_stall_report_none_when_complete() {
        let mut deps = Dependencies::new();
        deps.add(t("a"), []);
        let mut schedule = Schedule::new(deps);
        schedule.complete(t("a"));
        assert!(schedule.stall_report().is_none());
    }
}
