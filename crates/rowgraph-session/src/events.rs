//! Commit lifecycle callbacks.

use rowgraph_core::Result;

type ContextEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Context lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Fired before a commit builds its statements. An error aborts the
    /// commit before the database is touched.
    BeforeCommit,
    /// Fired after a commit has been applied to the database and the graph.
    AfterCommit,
    /// Fired after local changes were rolled back.
    AfterRollback,
}

/// Callbacks registered on a context, fired in registration order.
#[derive(Default)]
pub struct ContextEvents {
    before_commit: Vec<ContextEventFn>,
    after_commit: Vec<ContextEventFn>,
    after_rollback: Vec<ContextEventFn>,
}

impl std::fmt::Debug for ContextEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEvents")
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl ContextEvents {
    pub(crate) fn register(&mut self, event: ContextEvent, f: ContextEventFn) {
        self.callbacks(event).push(f);
    }

    /// Run every callback for `event`, stopping at the first error.
    pub(crate) fn fire(&mut self, event: ContextEvent) -> Result<()> {
        for cb in self.callbacks(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }

    fn callbacks(&mut self, event: ContextEvent) -> &mut Vec<ContextEventFn> {
        match event {
            ContextEvent::BeforeCommit => &mut self.before_commit,
            ContextEvent::AfterCommit => &mut self.after_commit,
            ContextEvent::AfterRollback => &mut self.after_rollback,
        }
    }
}
