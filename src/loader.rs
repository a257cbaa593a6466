use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use std::path::PathBuf;
use tracing::{debug, instrument};

use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::manifest::Segment;

/// A segment's bytes, ready to be handed to the bootloader.
#[derive(Clone, Debug)]
pub struct LoadedSegment {
    pub bytes: Bytes,
    pub flash_offset: u32,
    /// CRC32 of `bytes`, used to verify what the device reports back.
    pub crc: u32,
}

impl LoadedSegment {
    pub fn new(bytes: impl Into<Bytes>, flash_offset: u32) -> Self {
        let bytes = bytes.into();
        let crc = crc32fast::hash(&bytes);
        Self {
            bytes,
            flash_offset,
            crc,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

enum SegmentLocation {
    Remote(Url),
    Local(PathBuf),
}

/// Fetches segment bytes over HTTP(S) or from the local firmware directory.
///
/// Loading is never retried here; that is the caller's decision.
#[derive(Clone, Debug)]
pub struct BinarySegmentLoader {
    client: Client,
    base_url: Option<Url>,
    firmware_dir: PathBuf,
}

impl BinarySegmentLoader {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            client: config.http_client.clone(),
            base_url: config.base_url.clone(),
            firmware_dir: config.firmware_dir.clone(),
        }
    }

    /// Materialises a segment.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::NotFound`], [`LoadError::Status`] or
    /// [`LoadError::Empty`] when the source exists nowhere usable, and
    /// [`LoadError::Network`] when the host could not be reached at all.
    #[instrument(skip(self, segment), fields(path = %segment.source_path))]
    pub async fn load(&self, segment: &Segment) -> Result<LoadedSegment, LoadError> {
        let path = segment.source_path.as_str();

        let bytes = match self.locate(path)? {
            SegmentLocation::Remote(url) => self.fetch_remote(path, url).await?,
            SegmentLocation::Local(file) => read_local(path, file).await?,
        };

        if bytes.is_empty() {
            return Err(LoadError::Empty {
                path: path.to_string(),
            });
        }

        metrics::counter!("flash_bytes_loaded_total").increment(bytes.len() as u64);
        let loaded = LoadedSegment::new(bytes, segment.flash_offset);
        debug!(bytes = loaded.len(), crc = loaded.crc, "Loaded segment");

        Ok(loaded)
    }

    fn locate(&self, path: &str) -> Result<SegmentLocation, LoadError> {
        let invalid = |reason: String| LoadError::InvalidSource {
            path: path.to_string(),
            reason,
        };

        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map(SegmentLocation::Remote)
                .map_err(|e| invalid(e.to_string()));
        }

        match &self.base_url {
            Some(base) => base
                .join(path.trim_start_matches('/'))
                .map(SegmentLocation::Remote)
                .map_err(|e| invalid(e.to_string())),
            None => Ok(SegmentLocation::Local(self.firmware_dir.join(path))),
        }
    }

    async fn fetch_remote(&self, path: &str, url: Url) -> Result<Bytes, LoadError> {
        let network = |source: reqwest::Error| LoadError::Network {
            path: path.to_string(),
            source,
        };

        let resp = self.client.get(url).send().await.map_err(network)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(LoadError::NotFound {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(LoadError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        debug!(
            "Segment content type: {:?}",
            resp.headers().get(reqwest::header::CONTENT_TYPE)
        );
        resp.bytes().await.map_err(network)
    }
}

async fn read_local(path: &str, file: PathBuf) -> Result<Bytes, LoadError> {
    match tokio::fs::read(&file).await {
        Ok(data) => Ok(Bytes::from(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LoadError::NotFound {
            path: path.to_string(),
        }),
        Err(source) => Err(LoadError::Io {
            path: path.to_string(),
            source,
        }),
    }
}
