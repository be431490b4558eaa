//! Process-wide transfer caps shared by every download.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::SessionConfig;
use crate::engine::TorrentEngine;

#[derive(Debug)]
struct LimitState {
    download: Option<u64>,
    upload: Option<u64>,
    buffering: usize,
}

/// Download and upload caps applied uniformly through the engine.
///
/// While any download is buffering the download cap can be lifted so the
/// window fills at full speed. Buffering is reference-counted across
/// downloads; the cap returns once the last buffer completes.
pub struct RateLimits {
    engine: Arc<dyn TorrentEngine>,
    unlimited_while_buffering: bool,
    state: Mutex<LimitState>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RateLimits {
    /// Creates the limits and applies the configured caps to the engine.
    pub fn new(engine: Arc<dyn TorrentEngine>, config: &SessionConfig) -> Self {
        let limits = Self {
            engine,
            unlimited_while_buffering: config.unlimited_while_buffering,
            state: Mutex::new(LimitState {
                download: config.download_limit,
                upload: config.upload_limit,
                buffering: 0,
            }),
        };
        limits.engine.set_download_limit(config.download_limit);
        limits.engine.set_upload_limit(config.upload_limit);
        limits
    }

    /// Replaces the configured caps.
    pub fn set_limits(&self, download: Option<u64>, upload: Option<u64>) {
        let mut state = self.state.lock();
        state.download = download;
        state.upload = upload;
        self.engine.set_upload_limit(upload);
        if !self.held_open(&state) {
            self.engine.set_download_limit(download);
        }
    }

    pub fn download_limit(&self) -> Option<u64> {
        self.state.lock().download
    }

    pub fn upload_limit(&self) -> Option<u64> {
        self.state.lock().upload
    }

    /// Called when a download starts buffering.
    pub fn release_for_buffering(&self) {
        let mut state = self.state.lock();
        state.buffering += 1;
        if state.buffering == 1 && self.unlimited_while_buffering && state.download.is_some() {
            debug!("Lifting download limit while buffering");
            self.engine.set_download_limit(None);
        }
    }

    /// Called when a download stops buffering, for any reason.
    pub fn restore_after_buffering(&self) {
        let mut state = self.state.lock();
        state.buffering = state.buffering.saturating_sub(1);
        if state.buffering == 0 && self.unlimited_while_buffering {
            if let Some(limit) = state.download {
                debug!("Restoring download limit of {} B/s", limit);
            }
            self.engine.set_download_limit(state.download);
        }
    }

    fn held_open(&self, state: &LimitState) -> bool {
        self.unlimited_while_buffering && state.buffering > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedEngine;

    fn limited(engine: &Arc<SimulatedEngine>) -> RateLimits {
        let config = SessionConfig {
            download_limit: Some(1000),
            upload_limit: Some(500),
            ..Default::default()
        };
        RateLimits::new(Arc::clone(engine) as Arc<dyn TorrentEngine>, &config)
    }

    #[test]
    fn test_limits_applied_on_creation() {
        let engine = Arc::new(SimulatedEngine::new());
        let limits = limited(&engine);
        assert_eq!(engine.download_limit(), Some(1000));
        assert_eq!(engine.upload_limit(), Some(500));
        assert_eq!(limits.download_limit(), Some(1000));
    }

    #[test]
    fn test_buffering_lifts_and_restores_download_cap() {
        let engine = Arc::new(SimulatedEngine::new());
        let limits = limited(&engine);

        limits.release_for_buffering();
        limits.release_for_buffering();
        assert_eq!(engine.download_limit(), None);

        limits.restore_after_buffering();
        assert_eq!(engine.download_limit(), None);

        limits.restore_after_buffering();
        assert_eq!(engine.download_limit(), Some(1000));
        assert_eq!(engine.upload_limit(), Some(500));
    }

    #[test]
    fn test_set_limits_deferred_while_buffering() {
        let engine = Arc::new(SimulatedEngine::new());
        let limits = limited(&engine);

        limits.release_for_buffering();
        limits.set_limits(Some(2000), None);
        assert_eq!(engine.download_limit(), None);
        assert_eq!(engine.upload_limit(), None);

        limits.restore_after_buffering();
        assert_eq!(engine.download_limit(), Some(2000));
    }
}
