//! Turns user-supplied torrent URIs into something the engine accepts.

use std::path::{Path, PathBuf};

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use tracing::{debug, info};

use super::SessionError;
use crate::config::SessionConfig;
use crate::torrent::MagnetParser;

const MAX_REDIRECTS: usize = 10;

/// Kind of torrent source a URI names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Magnet,
    Http,
    File(PathBuf),
}

impl SourceKind {
    /// Classifies `uri`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Resolution` - Unsupported scheme or missing file
    pub fn classify(uri: &str) -> Result<Self, SessionError> {
        if MagnetParser::is_magnet(uri) {
            return Ok(Self::Magnet);
        }
        let lower = uri.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Self::Http);
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(Self::File(path));
        }
        Err(SessionError::Resolution {
            uri: uri.to_string(),
            reason: "not a magnet link, URL or existing torrent file".to_string(),
        })
    }
}

/// What an HTTP torrent URL resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// The server redirected to a magnet link
    Magnet(String),
    /// The descriptor was downloaded to this file
    DescriptorFile(PathBuf),
}

/// Downloads torrent descriptors over HTTP.
#[derive(Debug, Clone)]
pub struct DescriptorResolver {
    client: reqwest::Client,
}

impl DescriptorResolver {
    /// # Errors
    ///
    /// - `SessionError::Resolution` - HTTP client could not be built
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        // Magnet redirects cannot be followed by HTTP; stop and hand them back.
        let policy = Policy::custom(|attempt| {
            if attempt.url().scheme() == "magnet" {
                attempt.stop()
            } else if attempt.previous().len() > MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .timeout(config.resolve_timeout)
            .user_agent(config.user_agent)
            .redirect(policy)
            .build()
            .map_err(|e| SessionError::Resolution {
                uri: String::new(),
                reason: format!("HTTP client setup failed: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Fetches `url` and stores the descriptor under `dest_dir`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Resolution` - Request failed or returned an error status
    /// - `SessionError::Io` - Descriptor could not be written
    pub async fn resolve(&self, url: &str, dest_dir: &Path) -> Result<ResolvedSource, SessionError> {
        let resolution = |reason: String| SessionError::Resolution {
            uri: url.to_string(),
            reason,
        };

        debug!("Resolving torrent URL {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| resolution(format!("request failed: {e}")))?;

        if response.status().is_redirection()
            && let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            && MagnetParser::is_magnet(location)
        {
            info!("Torrent URL {} redirected to a magnet link", url);
            return Ok(ResolvedSource::Magnet(location.to_string()));
        }

        let response = response
            .error_for_status()
            .map_err(|e| resolution(format!("server returned error: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| resolution(format!("failed to read body: {e}")))?;
        if body.is_empty() {
            return Err(resolution("empty descriptor".to_string()));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(format!("download-{}.torrent", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &body).await?;
        debug!("Saved descriptor from {} to {}", url, path.display());
        Ok(ResolvedSource::DescriptorFile(path))
    }
}
