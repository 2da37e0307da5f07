//! In-process change notices for the job table.

use std::sync::{Arc, RwLock, Weak};

use crate::storage::TableId;

/// Published after a transaction that changed the job table commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeNotice {
    /// The table that changed. `None` means every table.
    pub table: Option<TableId>,
    /// Set when the change deleted a job.
    pub removed_job: Option<i64>,
}

impl ChangeNotice {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn table(table: Option<TableId>) -> Self {
        Self {
            table,
            removed_job: None,
        }
    }

    pub fn removed(table: Option<TableId>, job_id: i64) -> Self {
        Self {
            table,
            removed_job: Some(job_id),
        }
    }
}

pub trait InvalidationListener: Send + Sync {
    fn on_invalidate(&self, notice: &ChangeNotice);
}

/// Fan-out of change notices to subscribed listeners.
///
/// Listeners are held weakly; a dropped cache simply stops receiving.
#[derive(Default)]
pub struct InvalidationBus {
    listeners: RwLock<Vec<Weak<dyn InvalidationListener>>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(Arc::downgrade(&listener));
    }

    pub fn publish(&self, notice: ChangeNotice) {
        let live: Vec<Arc<dyn InvalidationListener>> = {
            let listeners = match self.listeners.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(
            "Publishing change notice {:?} to {} listener(s)",
            notice,
            live.len()
        );
        for listener in live {
            listener.on_invalidate(&notice);
        }
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.iter().filter(|l| l.strong_count() > 0).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter(|l| l.strong_count() > 0)
                .count(),
        }
    }
}
