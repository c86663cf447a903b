// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use crate::step::{PlanStep, StepObservation, StepStatus};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unknown plan step: {0}")]
    UnknownStep(String),
    #[error("step {id} is already {current}; cannot transition to {requested}")]
    IllegalTransition {
        id: String,
        current: StepStatus,
        requested: StepStatus,
    },
}

/// Holds the current plan behind a mutex.
///
/// The scheduler drives it through [`ready`](PlanManager::ready) /
/// [`update_status`](PlanManager::update_status); everything else is a
/// read-only view.  Replacing the plan discards all prior pending steps
/// atomically.
#[derive(Debug, Default)]
pub struct PlanManager {
    steps: Mutex<Vec<PlanStep>>,
}

impl PlanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically install a new plan.
    ///
    /// Dependencies pointing at ids that are not part of `steps` are pruned:
    /// they reference steps completed in a prior pass and count as satisfied.
    /// Any executing flags carried in are cleared.
    pub fn replace(&self, mut steps: Vec<PlanStep>) {
        let ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();
        for step in &mut steps {
            step.executing = false;
            step.waiting_for_id.retain(|dep| ids.contains(dep));
        }
        debug!(count = steps.len(), "installing plan");
        *self.steps.lock().unwrap() = steps;
    }

    /// Return one pending step whose every in-plan dependency is completed
    /// and which is not already dispatched, marking it executing.  Ties break
    /// in plan order.
    pub fn ready(&self) -> Option<PlanStep> {
        let mut steps = self.steps.lock().unwrap();
        let completed: HashSet<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        let ids: HashSet<String> = steps.iter().map(|s| s.id.clone()).collect();

        let idx = steps.iter().position(|s| {
            s.status == StepStatus::Pending
                && !s.executing
                && s.waiting_for_id
                    .iter()
                    .all(|dep| completed.contains(dep) || !ids.contains(dep))
        })?;
        steps[idx].executing = true;
        Some(steps[idx].clone())
    }

    /// Transition a step to a terminal status and attach its observation.
    /// Fails when the id is unknown or the step already left `pending`.
    pub fn update_status(
        &self,
        id: &str,
        status: StepStatus,
        observation: Option<StepObservation>,
    ) -> Result<(), PlanError> {
        let mut steps = self.steps.lock().unwrap();
        let step = steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| PlanError::UnknownStep(id.to_string()))?;
        if step.status.is_terminal() {
            return Err(PlanError::IllegalTransition {
                id: id.to_string(),
                current: step.status,
                requested: status,
            });
        }
        step.status = status;
        step.executing = false;
        step.observation = observation;
        Ok(())
    }

    /// Defensive copy of the current plan.
    pub fn snapshot(&self) -> Vec<PlanStep> {
        self.steps.lock().unwrap().clone()
    }

    pub fn has_pending(&self) -> bool {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.status == StepStatus::Pending)
    }

    /// Number of pending steps that can still reach execution.
    ///
    /// Computed as a fixed point: a step is executable when every in-plan
    /// dependency is either already completed or itself executable.  Steps
    /// left out by the fixed point are stuck behind a failed/abandoned
    /// dependency or participate in a cycle, and will never be dispatched.
    pub fn executable_count(&self) -> usize {
        let steps = self.steps.lock().unwrap();
        let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let completed: HashSet<&str> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.as_str())
            .collect();

        let mut executable: HashSet<&str> = HashSet::new();
        loop {
            let mut grew = false;
            for step in steps.iter() {
                if step.status != StepStatus::Pending || executable.contains(step.id.as_str()) {
                    continue;
                }
                let satisfied = step.waiting_for_id.iter().all(|dep| {
                    !ids.contains(dep.as_str())
                        || completed.contains(dep.as_str())
                        || executable.contains(dep.as_str())
                });
                if satisfied {
                    executable.insert(step.id.as_str());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        executable.len()
    }

    /// A pending step is stuck when some in-plan dependency already failed or
    /// was abandoned; stuck steps never become ready.
    pub fn is_stuck(&self, id: &str) -> bool {
        let steps = self.steps.lock().unwrap();
        let Some(step) = steps.iter().find(|s| s.id == id) else {
            return false;
        };
        if step.status != StepStatus::Pending {
            return false;
        }
        step.waiting_for_id.iter().any(|dep| {
            steps
                .iter()
                .find(|s| &s.id == dep)
                .map(|s| matches!(s.status, StepStatus::Failed | StepStatus::Abandoned))
                .unwrap_or(false)
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::CommandDraft;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, id, CommandDraft::shell_command("true")).waiting_for(deps)
    }

    fn manager(steps: Vec<PlanStep>) -> PlanManager {
        let m = PlanManager::new();
        m.replace(steps);
        m
    }

    // ── Ready computation ─────────────────────────────────────────────────────

    #[test]
    fn steps_without_dependencies_are_immediately_ready() {
        let m = manager(vec![step("a", &[]), step("b", &[])]);
        assert!(m.ready().is_some());
        assert!(m.ready().is_some());
        // Both now executing; nothing further.
        assert!(m.ready().is_none());
    }

    #[test]
    fn ready_respects_plan_order() {
        let m = manager(vec![step("first", &[]), step("second", &[])]);
        assert_eq!(m.ready().unwrap().id, "first");
        assert_eq!(m.ready().unwrap().id, "second");
    }

    #[test]
    fn dependent_step_waits_for_completion() {
        let m = manager(vec![step("a", &[]), step("b", &["a"])]);
        let a = m.ready().unwrap();
        assert_eq!(a.id, "a");
        assert!(m.ready().is_none(), "b must wait for a");
        m.update_status("a", StepStatus::Completed, None).unwrap();
        assert_eq!(m.ready().unwrap().id, "b");
    }

    #[test]
    fn dependency_on_unknown_id_is_satisfied() {
        // Prior-pass ids are pruned at replace time; this also covers a
        // direct ready() call against an unknown reference.
        let m = manager(vec![step("b", &["from-last-pass"])]);
        assert_eq!(m.ready().unwrap().id, "b");
    }

    #[test]
    fn failed_dependency_blocks_forever() {
        let m = manager(vec![step("a", &[]), step("b", &["a"])]);
        m.ready().unwrap();
        m.update_status("a", StepStatus::Failed, None).unwrap();
        assert!(m.ready().is_none());
        assert!(m.is_stuck("b"));
    }

    #[test]
    fn cyclic_pending_steps_never_become_ready() {
        let m = manager(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(m.ready().is_none());
        assert_eq!(m.executable_count(), 0);
    }

    // ── Replace semantics ─────────────────────────────────────────────────────

    #[test]
    fn replace_prunes_dependencies_outside_the_plan() {
        let m = manager(vec![step("x", &["done-earlier", "y"]), step("y", &[])]);
        let snap = m.snapshot();
        let x = snap.iter().find(|s| s.id == "x").unwrap();
        assert_eq!(x.waiting_for_id, vec!["y"]);
    }

    #[test]
    fn replace_discards_previous_plan() {
        let m = manager(vec![step("old", &[])]);
        m.replace(vec![step("new", &[])]);
        let snap = m.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, "new");
    }

    #[test]
    fn replace_clears_executing_flags() {
        let m = manager(vec![step("a", &[])]);
        m.ready().unwrap();
        let mut carried = m.snapshot();
        carried[0].executing = true;
        m.replace(carried);
        // If the flag survived, ready() would skip the step.
        assert!(m.ready().is_some());
    }

    // ── Status transitions ────────────────────────────────────────────────────

    #[test]
    fn update_unknown_step_errors() {
        let m = manager(vec![]);
        let err = m.update_status("ghost", StepStatus::Completed, None);
        assert!(matches!(err, Err(PlanError::UnknownStep(_))));
    }

    #[test]
    fn terminal_status_cannot_transition_again() {
        let m = manager(vec![step("a", &[])]);
        m.update_status("a", StepStatus::Completed, None).unwrap();
        let err = m.update_status("a", StepStatus::Failed, None);
        assert!(matches!(err, Err(PlanError::IllegalTransition { .. })));
    }

    #[test]
    fn update_attaches_observation_and_clears_executing() {
        let m = manager(vec![step("a", &[])]);
        m.ready().unwrap();
        let obs = StepObservation {
            id: "a".into(),
            status: StepStatus::Completed,
            stdout: "out".into(),
            ..Default::default()
        };
        m.update_status("a", StepStatus::Completed, Some(obs)).unwrap();
        let snap = m.snapshot();
        assert!(!snap[0].executing);
        assert_eq!(snap[0].observation.as_ref().unwrap().stdout, "out");
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    #[test]
    fn has_pending_reflects_remaining_work() {
        let m = manager(vec![step("a", &[])]);
        assert!(m.has_pending());
        m.update_status("a", StepStatus::Completed, None).unwrap();
        assert!(!m.has_pending());
    }

    #[test]
    fn executable_count_follows_dependency_chains() {
        let m = manager(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        assert_eq!(m.executable_count(), 3);
    }

    #[test]
    fn executable_count_excludes_steps_behind_a_failure() {
        let m = manager(vec![step("a", &[]), step("b", &["a"]), step("c", &[])]);
        m.ready().unwrap();
        m.update_status("a", StepStatus::Failed, None).unwrap();
        // Only c can still run; b is stuck behind the failed a.
        assert_eq!(m.executable_count(), 1);
    }

    #[test]
    fn executable_count_zero_for_completed_plan() {
        let m = manager(vec![step("a", &[])]);
        m.update_status("a", StepStatus::Completed, None).unwrap();
        assert_eq!(m.executable_count(), 0);
    }
}
