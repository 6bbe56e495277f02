//! Proactive pinning: as a room's manifest grows, ask the configured
//! [`ContentClient`] to pin every newly-seen cid. Pinning is monotone — the
//! hub never unpins a cid just because a later manifest edit drops the
//! file entry that named it.

use std::collections::HashSet;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use roomsync_core::{FileEntry, Manifest};

use crate::content_client::ContentClient;

pub struct PinTracker {
    client: Arc<dyn ContentClient>,
    pinned: Mutex<HashSet<String>>,
    mirror_mode: bool,
}

impl PinTracker {
    pub fn new(client: Arc<dyn ContentClient>, mirror_mode: bool) -> Arc<Self> {
        Arc::new(Self {
            client,
            pinned: Mutex::new(HashSet::new()),
            mirror_mode,
        })
    }

    /// Handler for newly-appeared manifest entries, the default hook.
    pub fn on_new_files(self: &Arc<Self>, files: &[FileEntry]) {
        self.pin_all(files);
    }

    /// Handler used instead of `on_new_files` when `mirror_mode` is set:
    /// re-evaluates the whole manifest every time, so files that were
    /// already present when the hub joined the room still get pinned.
    pub fn on_manifest_update(self: &Arc<Self>, manifest: &Manifest) {
        if self.mirror_mode {
            self.pin_all(&manifest.files);
        }
    }

    fn pin_all(self: &Arc<Self>, files: &[FileEntry]) {
        let to_pin: Vec<FileEntry> = {
            let mut pinned = self.pinned.lock();
            files
                .iter()
                .filter(|f| pinned.insert(f.cid.as_str().to_string()))
                .cloned()
                .collect()
        };
        for entry in to_pin {
            let client = self.client.clone();
            let tracker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.pin(&entry.cid).await {
                    warn!("failed to pin {}: {e}", entry.cid);
                    tracker.pinned.lock().remove(entry.cid.as_str());
                }
            });
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().len()
    }
}
