//! # Media Handles
//!
//! Every candidate encoding of an inbound chunk is exposed to the output as a
//! `MediaUrl`, the equivalent of a browser object URL. The registry tracks how many
//! are alive so leaks are observable; a handle is revoked exactly once, when it is
//! dropped.
//!
//! ## Rust Concepts:
//! - **Drop**: Revocation runs on every exit path (played, dropped, flushed, panicked)
//! - **Arc<[u8]>**: All candidates of a chunk share one decoded buffer
//! - **Atomics**: Counters are updated from playback tasks without a lock

use crate::audio::format::AudioFormat;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    live: AtomicUsize,
    revoked: AtomicU64,
}

/// Issues and tracks media handles for one session.
#[derive(Debug, Clone, Default)]
pub struct MediaRegistry {
    inner: Arc<RegistryInner>,
}

impl MediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bytes` under `format` and return the owning handle.
    pub fn create(&self, format: AudioFormat, bytes: Arc<[u8]>) -> MediaUrl {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        trace!(id, format = %format, "Created media handle");
        MediaUrl {
            id,
            format,
            bytes,
            registry: self.clone(),
        }
    }

    /// Handles created and not yet revoked.
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn revoked_count(&self) -> u64 {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    fn revoke(&self, id: u64) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.revoked.fetch_add(1, Ordering::SeqCst);
        trace!(id, "Revoked media handle");
    }
}

/// One candidate encoding of a chunk.
pub struct MediaUrl {
    id: u64,
    format: AudioFormat,
    bytes: Arc<[u8]>,
    registry: MediaRegistry,
}

impl MediaUrl {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Shared view of the payload, handed to playback adapters.
    pub fn bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }

    pub fn as_uri(&self) -> String {
        format!("media:{}#{}", self.id, self.format.container())
    }
}

impl fmt::Debug for MediaUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaUrl")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for MediaUrl {
    fn drop(&mut self) {
        self.registry.revoke(self.id);
    }
}
