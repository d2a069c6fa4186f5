//! Round-robin rotation over the current working set
//!
//! The rotator exclusively owns the working set and its cursor. The set
//! is replaced atomically on refresh (readers see the old list or the
//! new list, never a mix) and the cursor always indexes the list it was
//! taken against, so `next()` can never go out of range.

use crate::config::SelectionMode;
use crate::error::Result;
use crate::repository::ProxyRepository;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct Rotator {
    urls: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    /// Per-upstream hand-out counts, kept for observability only
    usage: DashMap<String, u64>,
    selection_mode: SelectionMode,
    only_china: bool,
    capacity: u32,
    topup_tx: mpsc::Sender<()>,
}

impl Rotator {
    /// Create a rotator and the channel on which it signals that the
    /// pool needs a top-up run
    pub fn new(
        selection_mode: SelectionMode,
        only_china: bool,
        capacity: u32,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (topup_tx, topup_rx) = mpsc::channel(1);
        let rotator = Arc::new(Self {
            urls: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            usage: DashMap::new(),
            selection_mode,
            only_china,
            capacity,
            topup_tx,
        });
        (rotator, topup_rx)
    }

    /// Replace the working set from the store.
    ///
    /// An empty result installs an empty set and requests an
    /// out-of-band discovery run; callers of `next()` simply get `None`
    /// until a later refresh finds upstreams.
    pub async fn refresh(&self, repo: &ProxyRepository) -> Result<usize> {
        let country = self.only_china.then_some("中国");

        let urls = match self.selection_mode {
            SelectionMode::Random => repo.list_random_active_urls(self.capacity, country).await?,
            SelectionMode::Priority => {
                repo.list_active_urls_by_priority(self.capacity, country)
                    .await?
            }
        };

        if urls.is_empty() {
            debug!("Store yielded no usable upstreams, requesting top-up");
            self.request_topup();
        } else {
            info!(
                mode = self.selection_mode.as_str(),
                count = urls.len(),
                "Refreshed working set"
            );
        }

        let count = urls.len();
        let mut guard = self.urls.write();
        *guard = urls;
        self.cursor.store(0, Ordering::Relaxed);
        self.usage.clear();

        Ok(count)
    }

    /// Hand out the next upstream URL, round-robin.
    ///
    /// Returns `None` when the working set is empty, after signalling
    /// for a top-up.
    pub fn next(&self) -> Option<String> {
        let guard = self.urls.read();

        if guard.is_empty() {
            drop(guard);
            self.request_topup();
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % guard.len();
        let url = guard[index].clone();

        self.usage
            .entry(url.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);

        Some(url)
    }

    /// Number of upstreams currently rotated
    pub fn len(&self) -> usize {
        self.urls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.read().is_empty()
    }

    /// Times a given upstream has been handed out since the last refresh
    pub fn usage_count(&self, url: &str) -> u64 {
        self.usage.get(url).map(|v| *v).unwrap_or(0)
    }

    fn request_topup(&self) {
        // A full channel means a run is already pending; dropping the
        // signal is correct.
        let _ = self.topup_tx.try_send(());
    }
}
