//! Local state machine per task group, reporting transitions to the master.
//!
//! `READY -> EXECUTING -> {COMPLETE | ON_HOLD | FAILED_RECOVERABLE |
//! FAILED_UNRECOVERABLE}`. Per-task states drive the roll-up: the group
//! completes when every task completed, parks when any task is on hold at
//! the end of the walk, and fails on the first failing task. Each transition
//! is sent as a single control message carrying the attempt index; sends are
//! at-most-once per attempt, the master deduplicates re-deliveries.

use std::collections::HashMap;

use tracing::{info, warn};

use cascade_common::states::{RecoverableFailureCause, TaskGroupState, TaskState};
use cascade_common::TaskGroup;
use cascade_message::{Message, MessageSender, Payload, RUNTIME_MASTER_LISTENER_ID};

/// Tracks and reports the state of one task group attempt.
pub struct TaskGroupStateManager {
    task_group_id: String,
    attempt_index: u32,
    executor_id: String,
    master: MessageSender,
    task_states: HashMap<String, TaskState>,
    current_state: TaskGroupState,
}

impl TaskGroupStateManager {
    /// Creates the manager for one attempt of `task_group`.
    pub fn new(
        task_group: &TaskGroup,
        attempt_index: u32,
        executor_id: impl Into<String>,
        master: MessageSender,
    ) -> Self {
        let task_states = task_group
            .task_dag
            .tasks
            .iter()
            .map(|task| (task.task_id().to_string(), TaskState::Ready))
            .collect();
        Self {
            task_group_id: task_group.task_group_id.clone(),
            attempt_index,
            executor_id: executor_id.into(),
            master,
            task_states,
            current_state: TaskGroupState::Ready,
        }
    }

    /// The last reported task-group state.
    pub fn current_state(&self) -> TaskGroupState {
        self.current_state
    }

    /// Reports a task-group state transition to the master.
    pub fn on_task_group_state_changed(
        &mut self,
        state: TaskGroupState,
        tasks_on_hold: Vec<String>,
        failure_cause: Option<RecoverableFailureCause>,
    ) {
        info!(
            task_group_id = %self.task_group_id,
            attempt_index = self.attempt_index,
            state = %state,
            operator = "TaskGroupStateManager",
            "task group state changed"
        );
        self.current_state = state;
        let message = Message::new(
            RUNTIME_MASTER_LISTENER_ID,
            Payload::TaskGroupStateChanged {
                executor_id: self.executor_id.clone(),
                task_group_id: self.task_group_id.clone(),
                state,
                tasks_on_hold,
                failure_cause,
                attempt_index: self.attempt_index,
            },
        );
        if let Err(e) = self.master.send(message) {
            warn!(
                task_group_id = %self.task_group_id,
                error = %e,
                "task group state report was not delivered"
            );
        }
    }

    /// Records a task state transition and rolls it up to the group state.
    pub fn on_task_state_changed(
        &mut self,
        task_id: &str,
        state: TaskState,
        failure_cause: Option<RecoverableFailureCause>,
    ) {
        self.task_states.insert(task_id.to_string(), state);
        match state {
            TaskState::Ready | TaskState::Executing => {}
            TaskState::FailedRecoverable => {
                self.on_task_group_state_changed(
                    TaskGroupState::FailedRecoverable,
                    Vec::new(),
                    failure_cause,
                );
            }
            TaskState::FailedUnrecoverable => {
                self.on_task_group_state_changed(
                    TaskGroupState::FailedUnrecoverable,
                    Vec::new(),
                    None,
                );
            }
            TaskState::Complete | TaskState::OnHold => {
                let all_done = self
                    .task_states
                    .values()
                    .all(|s| matches!(s, TaskState::Complete | TaskState::OnHold));
                if all_done {
                    let on_hold: Vec<String> = self
                        .task_states
                        .iter()
                        .filter(|(_, s)| matches!(s, TaskState::OnHold))
                        .map(|(id, _)| id.clone())
                        .collect();
                    if on_hold.is_empty() {
                        self.on_task_group_state_changed(
                            TaskGroupState::Complete,
                            Vec::new(),
                            None,
                        );
                    } else {
                        self.on_task_group_state_changed(TaskGroupState::OnHold, on_hold, None);
                    }
                }
            }
        }
    }
}
