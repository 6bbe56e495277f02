//! Pluggable content-addressed storage client the hub uses to proactively
//! pin manifest files. The hub itself never interprets file bytes; it only
//! asks a `ContentClient` to make sure a cid stays retrievable.

use async_trait::async_trait;
use log::debug;
use roomsync_core::ContentId;

#[async_trait]
pub trait ContentClient: Send + Sync {
    async fn pin(&self, cid: &ContentId) -> anyhow::Result<()>;
}

/// No-op client for deployments with no external content-addressed store
/// configured. Pinning always "succeeds" by doing nothing, so manifests
/// still replicate and the pinning observer's bookkeeping still runs.
pub struct NullContentClient;

#[async_trait]
impl ContentClient for NullContentClient {
    async fn pin(&self, cid: &ContentId) -> anyhow::Result<()> {
        debug!("no content client configured, skipping pin of {cid}");
        Ok(())
    }
}
