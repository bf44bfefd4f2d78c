use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;

use super::handle::{Control, Shared};
use super::{
    Outcome, OutcomeCell, ProcessComponent, ProcessHandle, ProcessListener, ProcessState,
    RollbackReport, Step,
};
use crate::error::SyncError;

/// A composed process, ready to run once
pub struct Process {
    root: ProcessComponent,
    outcome: OutcomeCell,
    timeout: Option<Duration>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.shared.name())
            .field("root", &self.root)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Process {
    pub fn new(name: impl Into<String>, root: ProcessComponent) -> Self {
        Self {
            root,
            outcome: OutcomeCell::default(),
            timeout: None,
            shared: Shared::new(name.into()),
        }
    }

    /// Share `outcome` with the steps that may report a no-op
    pub fn with_outcome(mut self, outcome: OutcomeCell) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle::new(self.shared.clone())
    }

    pub fn listen(&self, listener: Arc<dyn ProcessListener>) {
        self.handle().listen(listener);
    }

    /// Run on a background task
    pub fn start(self) -> ProcessHandle {
        let handle = self.handle();
        tokio::spawn(async move {
            let _ = self.run().await;
        });
        handle
    }

    /// Run to completion on the current task, rolling back on failure
    pub async fn run(self) -> Result<Outcome, SyncError> {
        let Process {
            root,
            outcome,
            timeout,
            shared,
        } = self;
        let name = shared.name().to_string();

        let mut executor = Executor {
            completed: Vec::new(),
            control: shared.control(),
            deadline: timeout.map(|limit| (Instant::now() + limit, limit)),
            shared: shared.clone(),
        };
        shared.set_state(ProcessState::Running);
        tracing::info!("process {} started", name);

        match executor.run_component(root).await {
            Ok(()) => {
                let outcome = outcome.get();
                tracing::info!("process {} succeeded ({:?})", name, outcome);
                shared.finish_succeeded(outcome);
                Ok(outcome)
            }
            Err(error) => {
                tracing::error!("process {} failed: {}", name, error);
                shared.finish_failed(&error);
                let report = executor.rollback().await;
                if report.is_clean() {
                    tracing::info!(
                        "process {} rolled back {} step(s)",
                        name,
                        report.rolled_back.len()
                    );
                } else {
                    tracing::warn!(
                        "process {} rolled back with {} failure(s)",
                        name,
                        report.failures.len()
                    );
                }
                shared.finish_rolled_back(report);
                Err(error)
            }
        }
    }
}

struct Executor {
    /// Completed steps, most recent last
    completed: Vec<Box<dyn Step>>,
    control: watch::Receiver<Control>,
    deadline: Option<(Instant, Duration)>,
    shared: Arc<Shared>,
}

impl Executor {
    fn run_component(&mut self, component: ProcessComponent) -> BoxFuture<'_, Result<(), SyncError>> {
        async move {
            match component {
                ProcessComponent::Step(mut step) => {
                    self.checkpoint().await?;
                    tracing::debug!("step {} executing", step.name());
                    if let Err(err) = step.execute().await {
                        tracing::warn!("step {} failed: {}", step.name(), err);
                        return Err(err);
                    }
                    self.completed.push(step);
                    Ok(())
                }
                ProcessComponent::Sequence(children) => {
                    for child in children {
                        self.run_component(child).await?;
                    }
                    Ok(())
                }
                ProcessComponent::Decision {
                    predicate,
                    then,
                    otherwise,
                } => {
                    let branch = if predicate() { *then } else { *otherwise };
                    self.run_component(branch).await
                }
            }
        }
        .boxed()
    }

    /// Between steps: honour cancel, the deadline, and pause
    async fn checkpoint(&mut self) -> Result<(), SyncError> {
        loop {
            if let Some((deadline, limit)) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(SyncError::Timeout(limit));
                }
            }
            let control = *self.control.borrow_and_update();
            match control {
                Control::Run => {
                    if self.shared.state() == ProcessState::Paused {
                        tracing::info!("process {} resumed", self.shared.name());
                        self.shared.set_state(ProcessState::Running);
                    }
                    return Ok(());
                }
                Control::Cancel => return Err(SyncError::Cancelled),
                Control::Pause => {
                    if self.shared.state() != ProcessState::Paused {
                        tracing::info!("process {} paused", self.shared.name());
                        self.shared.set_state(ProcessState::Paused);
                    }
                }
            }

            let changed = match self.deadline {
                Some((deadline, _)) => {
                    match tokio::time::timeout_at(deadline, self.control.changed()).await {
                        Ok(changed) => changed,
                        // the deadline check at the top of the loop reports it
                        Err(_) => Ok(()),
                    }
                }
                None => self.control.changed().await,
            };
            if changed.is_err() {
                // every handle is gone, nobody can resume us
                return Err(SyncError::Cancelled);
            }
        }
    }

    async fn rollback(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();
        while let Some(mut step) = self.completed.pop() {
            let name = step.name().to_string();
            match step.rollback().await {
                Ok(()) => {
                    tracing::debug!("step {} rolled back", name);
                    report.rolled_back.push(name);
                }
                Err(err) => {
                    tracing::warn!("rollback of step {} failed: {}", name, err);
                    report.failures.push((name, err));
                }
            }
        }
        report
    }
}
