use std::sync::Arc;
use tracing::debug;

use crate::page::{HostPage, ViewportStyle};

/// Pins the host document while an embed covers it.
pub struct ScrollLock {
    page: Arc<dyn HostPage>,
}

impl ScrollLock {
    pub fn new(page: Arc<dyn HostPage>) -> Self {
        Self { page }
    }

    /// Capture the current style and pin the page.
    pub fn acquire(&self) -> ScrollLease {
        let snapshot = self.page.viewport_style();
        self.page.set_viewport_style(snapshot.pinned());
        debug!(?snapshot, "Scroll lock acquired");
        ScrollLease {
            page: self.page.clone(),
            snapshot,
            released: false,
        }
    }

    pub fn release(&self, mut lease: ScrollLease) {
        lease.restore();
    }
}

/// The style captured at acquisition. Restored exactly once, on release or drop.
pub struct ScrollLease {
    page: Arc<dyn HostPage>,
    snapshot: ViewportStyle,
    released: bool,
}

impl ScrollLease {
    pub fn snapshot(&self) -> ViewportStyle {
        self.snapshot
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn restore(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.page.set_viewport_style(self.snapshot);
        debug!(snapshot = ?self.snapshot, "Scroll lock released");
    }
}

impl Drop for ScrollLease {
    fn drop(&mut self) {
        self.restore();
    }
}

impl std::fmt::Debug for ScrollLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollLease")
            .field("snapshot", &self.snapshot)
            .field("released", &self.released)
            .finish()
    }
}
