//! Read-only progress cards shown next to real tasks.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identifier of an informational card, chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InformationalId(pub u64);

/// A progress card for work that is not a file operation, such as a
/// directory compare or a rename batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InformationalTask {
    pub id: InformationalId,
    pub title: String,
    pub detail: Option<String>,
    pub completed: u64,
    /// Unknown totals render as an indeterminate bar.
    pub total: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl InformationalTask {
    pub fn new(id: InformationalId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            detail: None,
            completed: 0,
            total: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_progress(mut self, completed: u64, total: Option<u64>) -> Self {
        self.completed = completed;
        self.total = total;
        self
    }

    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.completed.min(total) as f64 / total as f64) * 100.0),
            None => None,
        }
    }
}
