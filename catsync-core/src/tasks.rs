//! Supervised task set with structured shutdown.
//!
//! Every long-running loop in the workspace is spawned through a [`TaskSet`]
//! so that shutdown is verifiable: [`TaskSet::shutdown`] cancels the shared
//! token, waits up to a grace period, aborts stragglers, and reports how every
//! task ended.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// How one supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(String),
    Panicked(String),
    Aborted(String),
}

impl TaskOutcome {
    pub fn name(&self) -> &str {
        match self {
            TaskOutcome::Completed(name)
            | TaskOutcome::Panicked(name)
            | TaskOutcome::Aborted(name) => name,
        }
    }
}

/// Summary returned by [`TaskSet::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub panicked: Vec<String>,
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    /// True when every task returned on its own after cancellation.
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.aborted.is_empty()
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.panicked.len() + self.aborted.len()
    }

    /// Folds the report of a nested set into this one.
    pub fn absorb(&mut self, other: ShutdownReport) {
        self.completed.extend(other.completed);
        self.panicked.extend(other.panicked);
        self.aborted.extend(other.aborted);
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed(name) => self.completed.push(name),
            TaskOutcome::Panicked(name) => self.panicked.push(name),
            TaskOutcome::Aborted(name) => self.aborted.push(name),
        }
    }
}

/// A named group of tasks sharing one cancellation token.
#[derive(Debug)]
pub struct TaskSet {
    label: &'static str,
    token: CancellationToken,
    tasks: JoinSet<Id>,
    names: HashMap<Id, String>,
}

impl TaskSet {
    /// Creates a set whose token is a child of `parent`.
    pub fn new(label: &'static str, parent: &CancellationToken) -> Self {
        Self {
            label,
            token: parent.child_token(),
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// Token cancelled when the set shuts down (or its parent is cancelled).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns `fut` under `name`.
    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(set = self.label, task = %name, "spawning supervised task");
        let handle = self.tasks.spawn(async move {
            fut.await;
            tokio::task::id()
        });
        self.names.insert(handle.id(), name);
    }

    /// Waits for the next task to end.
    pub async fn join_next(&mut self) -> Option<TaskOutcome> {
        let result = self.tasks.join_next().await?;
        Some(self.outcome(result))
    }

    /// Collects tasks that already ended without waiting.
    pub fn reap_finished(&mut self) -> Vec<TaskOutcome> {
        let mut finished = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            finished.push(self.outcome(result));
        }
        finished
    }

    fn take_name(&mut self, id: Id) -> String {
        self.names
            .remove(&id)
            .unwrap_or_else(|| format!("{}-{id}", self.label))
    }

    fn outcome(&mut self, result: Result<Id, JoinError>) -> TaskOutcome {
        match result {
            Ok(id) => TaskOutcome::Completed(self.take_name(id)),
            Err(err) => {
                let name = self.take_name(err.id());
                if err.is_panic() {
                    tracing::error!(set = self.label, task = %name, "supervised task panicked");
                    TaskOutcome::Panicked(name)
                } else {
                    TaskOutcome::Aborted(name)
                }
            }
        }
    }

    /// Cancels the token, waits up to `grace` for every task, then aborts
    /// whatever is left.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        self.token.cancel();
        let mut report = ShutdownReport::default();

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = self.tasks.join_next().await {
                let outcome = self.outcome(result);
                report.record(outcome);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                set = self.label,
                remaining = self.tasks.len(),
                "grace period elapsed, aborting remaining tasks",
            );
            self.tasks.abort_all();
            while let Some(result) = self.tasks.join_next().await {
                let outcome = self.outcome(result);
                report.record(outcome);
            }
        }

        tracing::debug!(
            set = self.label,
            completed = report.completed.len(),
            aborted = report.aborted.len(),
            panicked = report.panicked.len(),
            "task set shut down",
        );
        report
    }
}
