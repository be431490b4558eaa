//! Set of active downloads and the policies that span them.
//!
//! A [`DownloadSession`] adds and removes torrents, applies process-wide
//! rate limits, guards disk space, remembers torrent descriptors for resume
//! and periodically sweeps finished downloads into the library.

pub mod limits;
pub mod resolve;
pub mod space;
pub mod sweep;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use limits::RateLimits;
pub use resolve::{DescriptorResolver, ResolvedSource, SourceKind};
pub use space::{DiskSpace, FixedDiskSpace, SysinfoDiskSpace, required_space};

use crate::config::UndertowConfig;
use crate::engine::{DownloadHandle, EngineError, TorrentEngine};
use crate::playback::ui::Notifier;
use crate::storage::{RecordStore, lookup_record};
use crate::streaming::{DownloadContext, ItemLookup, StreamingDownload};
use crate::torrent::InfoHash;

/// Errors raised by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Download path is not configured")]
    DownloadPathUnset,

    #[error("Cannot resolve {uri}: {reason}")]
    Resolution { uri: String, reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Not enough disk space: need {needed} bytes, {available} available")]
    SpaceExhausted { needed: u64, available: u64 },

    #[error("Metadata for {info_hash} did not arrive within {waited:?}")]
    MetadataTimeout {
        info_hash: InfoHash,
        waited: Duration,
    },

    #[error("Metadata for {info_hash} is not available")]
    MetadataUnavailable { info_hash: InfoHash },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner of every active [`StreamingDownload`].
pub struct DownloadSession {
    engine: Arc<dyn TorrentEngine>,
    config: UndertowConfig,
    records: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    disk: Arc<dyn DiskSpace>,
    item_lookup: Option<Arc<dyn ItemLookup>>,
    limits: Arc<RateLimits>,
    resolver: DescriptorResolver,
    downloads: RwLock<Vec<Arc<StreamingDownload>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("downloads", &self.downloads.read().len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl DownloadSession {
    /// Creates a session using `sysinfo` for disk space.
    ///
    /// # Errors
    ///
    /// - `SessionError::Resolution` - HTTP client could not be built
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        config: UndertowConfig,
        records: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SessionError> {
        let limits = Arc::new(RateLimits::new(Arc::clone(&engine), &config.session));
        let resolver = DescriptorResolver::new(&config.session)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            engine,
            config,
            records,
            notifier,
            disk: Arc::new(SysinfoDiskSpace),
            item_lookup: None,
            limits,
            resolver,
            downloads: RwLock::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_item_lookup(mut self, lookup: Arc<dyn ItemLookup>) -> Self {
        self.item_lookup = Some(lookup);
        self
    }

    /// Shares the session and starts the background library sweep.
    pub fn start(self) -> Arc<Self> {
        let session = Arc::new(self);
        let shutdown_rx = session.shutdown_tx.subscribe();
        tokio::spawn(run_sweep_loop(
            Arc::downgrade(&session),
            session.config.session.sweep_interval,
            shutdown_rx,
        ));
        session
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn limits(&self) -> &Arc<RateLimits> {
        &self.limits
    }

    /// Snapshot of the active downloads.
    pub fn downloads(&self) -> Vec<Arc<StreamingDownload>> {
        self.downloads.read().clone()
    }

    pub fn find(&self, info_hash: InfoHash) -> Option<Arc<StreamingDownload>> {
        self.downloads
            .read()
            .iter()
            .find(|d| d.info_hash() == info_hash)
            .cloned()
    }

    /// Adds a torrent from a magnet link, HTTP(S) URL or local descriptor.
    ///
    /// Adding a torrent that is already active returns the existing
    /// download.
    ///
    /// # Errors
    ///
    /// - `SessionError::DownloadPathUnset` - No download path configured
    /// - `SessionError::Resolution` - URI cannot be resolved to a torrent
    /// - `SessionError::Engine` - The engine rejected the torrent
    pub async fn add_torrent(&self, uri: &str) -> Result<Arc<StreamingDownload>, SessionError> {
        if self.config.storage.download_path.as_os_str().is_empty() {
            return Err(SessionError::DownloadPathUnset);
        }

        let handle = match SourceKind::classify(uri)? {
            SourceKind::Magnet => self.engine.add_magnet(uri).await?,
            SourceKind::File(path) => self.engine.add_torrent_file(&path).await?,
            SourceKind::Http => {
                match self
                    .resolver
                    .resolve(uri, &self.config.storage.torrents_path)
                    .await?
                {
                    ResolvedSource::Magnet(magnet) => self.engine.add_magnet(&magnet).await?,
                    ResolvedSource::DescriptorFile(path) => {
                        let added = self.engine.add_torrent_file(&path).await;
                        // Saved again under its info-hash once metadata is known.
                        let _ = tokio::fs::remove_file(&path).await;
                        added?
                    }
                }
            }
        };

        Ok(self.track(handle))
    }

    fn track(&self, handle: Arc<dyn DownloadHandle>) -> Arc<StreamingDownload> {
        let info_hash = handle.info_hash();
        let mut downloads = self.downloads.write();
        if let Some(existing) = downloads.iter().find(|d| d.info_hash() == info_hash) {
            debug!("Torrent {} already active", info_hash);
            return Arc::clone(existing);
        }

        let download = StreamingDownload::spawn(
            handle,
            DownloadContext {
                config: self.config.streaming.clone(),
                storage_mode: self.engine.storage_mode(),
                limits: Arc::clone(&self.limits),
                records: Arc::clone(&self.records),
                item_lookup: self.item_lookup.clone(),
            },
        );
        downloads.push(Arc::clone(&download));
        info!("Added torrent {} ({})", info_hash, download.name());
        download
    }

    /// Waits for metadata, then saves the descriptor for resume.
    ///
    /// # Errors
    ///
    /// - `SessionError::MetadataTimeout` - Metadata did not arrive in time
    pub async fn await_metadata(
        &self,
        download: &StreamingDownload,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let info_hash = download.info_hash();
        if tokio::time::timeout(timeout, download.handle().wait_for_info())
            .await
            .is_err()
        {
            return Err(SessionError::MetadataTimeout {
                info_hash,
                waited: timeout,
            });
        }

        if let Err(e) = self.save_descriptor(download).await {
            warn!("Failed to save descriptor for {}: {}", info_hash, e);
        }
        Ok(())
    }

    /// Removes a download from the active set.
    ///
    /// The list update is immediate; dropping the torrent and deleting files
    /// happen on a background task, whose handle is returned. `None` means the
    /// download was not active.
    pub fn remove_torrent(&self, info_hash: InfoHash, remove_files: bool) -> Option<JoinHandle<()>> {
        let download = {
            let mut downloads = self.downloads.write();
            let position = downloads.iter().position(|d| d.info_hash() == info_hash)?;
            downloads.remove(position)
        };

        let download_path = self.config.storage.download_path.clone();
        Some(tokio::spawn(async move {
            download.close();
            let info = download.handle().info();
            download.handle().drop_torrent();
            info!(
                "Dropped torrent {}{}",
                info_hash,
                if remove_files { " and its files" } else { "" }
            );

            if !remove_files {
                return;
            }
            let Some(info) = info else {
                return;
            };
            for entry in sweep::top_level_entries(&info) {
                let path = download_path.join(entry);
                if let Err(e) = sweep::remove_path(&path).await {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
        }))
    }

    /// Verifies the download path can hold the rest of the download.
    ///
    /// On shortfall the download is paused and the user notified. Without
    /// metadata, or when free space cannot be determined, the check passes.
    ///
    /// # Errors
    ///
    /// - `SessionError::SpaceExhausted` - Not enough free space
    pub fn check_available_space(&self, download: &StreamingDownload) -> Result<(), SessionError> {
        if download.handle().info().is_none() {
            debug!("Skipping space check for {}: no metadata", download.info_hash());
            return Ok(());
        }

        let needed = required_space(download.remaining_bytes(), download.flags().is_rar_archive);
        let available = match self.disk.available_space(&self.config.storage.download_path) {
            Ok(available) => available,
            Err(e) => {
                warn!("Cannot determine free space: {}", e);
                return Ok(());
            }
        };

        if available >= needed {
            return Ok(());
        }

        download.pause();
        error!(
            "Not enough space for {}: need {} bytes, {} available",
            download.info_hash(),
            needed,
            available
        );
        self.notifier.notify(
            "Not enough space",
            &format!(
                "{} needs {} MB but only {} MB are free",
                download.name(),
                needed / (1024 * 1024),
                available / (1024 * 1024)
            ),
        );
        Err(SessionError::SpaceExhausted { needed, available })
    }

    fn descriptor_path(&self, info_hash: InfoHash) -> PathBuf {
        self.config
            .storage
            .torrents_path
            .join(format!("{info_hash}.torrent"))
    }

    /// Writes `<torrents dir>/<info-hash>.torrent`.
    ///
    /// # Errors
    ///
    /// - `SessionError::MetadataUnavailable` - Engine has no descriptor yet
    /// - `SessionError::Io` - Write failed
    pub async fn save_descriptor(&self, download: &StreamingDownload) -> Result<PathBuf, SessionError> {
        let info_hash = download.info_hash();
        let bytes = download
            .handle()
            .metainfo_bytes()
            .ok_or(SessionError::MetadataUnavailable { info_hash })?;

        tokio::fs::create_dir_all(&self.config.storage.torrents_path).await?;
        let path = self.descriptor_path(info_hash);
        tokio::fs::write(&path, bytes).await?;
        debug!("Saved descriptor {}", path.display());
        Ok(path)
    }

    /// Deletes the saved descriptor. Failures are logged.
    pub async fn delete_descriptor(&self, info_hash: InfoHash) {
        let path = self.descriptor_path(info_hash);
        if let Err(e) = sweep::remove_path(&path).await {
            warn!("Failed to delete descriptor {}: {}", path.display(), e);
        }
    }

    /// Re-adds every saved descriptor whose record is still active.
    ///
    /// # Errors
    ///
    /// - `SessionError::Io` - Descriptor directory cannot be read
    pub async fn resume_saved(&self) -> Result<Vec<Arc<StreamingDownload>>, SessionError> {
        let dir = &self.config.storage.torrents_path;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut resumed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(info_hash) = descriptor_info_hash(&path) else {
                continue;
            };
            let Some(record) = lookup_record(self.records.as_ref(), info_hash).await else {
                debug!("No record for saved descriptor {}, skipping", info_hash);
                continue;
            };
            if !record.is_active() {
                continue;
            }

            match self.engine.add_torrent_file(&path).await {
                Ok(handle) => {
                    let download = self.track(handle);
                    download.download_file(record.file_index);
                    download.set_record(record).await;
                    resumed.push(download);
                }
                Err(e) => warn!("Failed to resume {}: {}", path.display(), e),
            }
        }

        info!("Resumed {} saved downloads", resumed.len());
        Ok(resumed)
    }

    /// Stops the sweep and every download's event loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for download in self.downloads.read().iter() {
            download.close();
        }
    }
}

fn descriptor_info_hash(path: &Path) -> Option<InfoHash> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("torrent") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

async fn run_sweep_loop(
    session: Weak<DownloadSession>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(session) = session.upgrade() else {
                    break;
                };
                sweep::sweep_completed(&session).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Library sweep stopped");
}
