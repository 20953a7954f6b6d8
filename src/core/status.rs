//! StatusProjector: read-only merge of ledger records and live engine
//! counters. Never mutates anything and never takes per-content locks.

use crate::core::config::MAX_PAGE_SIZE;
use crate::core::error::CommandError;
use crate::core::reconciler::{Reconciler, SessionView};
use crate::core::session::{ContentId, SessionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One row of the merged listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusItem {
    pub info_hash: ContentId,
    pub name: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_added: Option<DateTime<Utc>>,
    /// Whether a live engine handle backs these numbers.
    pub live: bool,
    pub progress: f64,
    pub peers: u32,
    pub downloaded: u64,
    pub uploaded: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<StatusItem>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Aggregate counters for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub active: usize,
    pub paused: usize,
    pub live: usize,
    pub downloaded: u64,
    pub uploaded: u64,
}

pub struct StatusProjector {
    reconciler: Arc<Reconciler>,
}

impl StatusProjector {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// 1-based page of the merged view, in ledger order.
    pub fn list(&self, page: usize, page_size: usize) -> Result<Page, CommandError> {
        if page < 1 {
            return Err(CommandError::validation("page must be at least 1"));
        }
        if page_size < 1 || page_size > MAX_PAGE_SIZE {
            return Err(CommandError::validation(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let views = self.reconciler.sessions();
        let total = views.len();
        let items = views
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .map(|view| self.project(view))
            .collect();

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for view in self.reconciler.sessions() {
            match view.session.state {
                SessionState::Active => summary.active += 1,
                SessionState::Paused => summary.paused += 1,
            }
            let item = self.project(view);
            if item.live {
                summary.live += 1;
            }
            summary.downloaded += item.downloaded;
            summary.uploaded += item.uploaded;
        }
        summary
    }

    fn project(&self, view: SessionView) -> StatusItem {
        let session = view.session;
        let stats = if view.live {
            self.reconciler.engine().get(&session.content_id)
        } else {
            None
        };

        // Handle-less rows report a finished-looking placeholder.
        let (live, progress, peers, downloaded, uploaded) = match stats {
            Some(s) => (true, s.progress.clamp(0.0, 1.0), s.peers, s.downloaded, s.uploaded),
            None => (false, 1.0, 0, 0, 0),
        };

        StatusItem {
            info_hash: session.content_id,
            name: session.name,
            state: session.state,
            magnet: session.descriptor,
            size: session.size_bytes,
            date_added: session.date_added,
            live,
            progress,
            peers,
            downloaded,
            uploaded,
        }
    }
}
