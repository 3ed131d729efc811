//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Tracks the background tasks owned by a bomb so they can be cancelled together.
///
/// Once [`TaskSet::close`] has been called no new task is started.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    closed: bool,
}

impl TaskSet {
    /// Spawn `fut` on the current runtime. Returns `false` if the set is closed.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed {
            debug!(task = name, "task set closed, not spawning");
            return false;
        }
        self.tasks.retain(|(_, handle)| !handle.is_finished());
        self.tasks.push((name, tokio::spawn(fut)));
        true
    }

    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every task and hand back the handles to be awaited.
    pub fn close(&mut self) -> Vec<(&'static str, JoinHandle<()>)> {
        self.closed = true;
        let tasks = std::mem::take(&mut self.tasks);
        for (_, handle) in &tasks {
            handle.abort();
        }
        tasks
    }
}

/// Wait until every aborted task has stopped running.
pub async fn join_cancelled(tasks: Vec<(&'static str, JoinHandle<()>)>) {
    let names: Vec<_> = tasks.iter().map(|(name, _)| *name).collect();
    let results = join_all(tasks.into_iter().map(|(_, handle)| handle)).await;
    for (name, result) in names.into_iter().zip(results) {
        match result {
            Ok(()) => debug!(task = name, "task finished before cancellation"),
            Err(err) if err.is_cancelled() => debug!(task = name, "task cancelled"),
            Err(err) => error!(task = name, error = %err, "task join failure"),
        }
    }
}
