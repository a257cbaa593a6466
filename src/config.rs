use anyhow::{Context, Result};
use reqwest::{Client, Url};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where relative segment paths are resolved, and the HTTP client used to fetch them.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub base_url: Option<Url>,
    pub firmware_dir: PathBuf,
    pub http_client: Client,
}

impl LoaderConfig {
    /// Builds the loader configuration.
    ///
    /// A base URL, when given, always ends up with a trailing slash so that
    /// relative paths are appended to it rather than replacing its last
    /// path component.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL does not parse or the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: Option<&str>,
        firmware_dir: impl Into<PathBuf>,
        http_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url
            .map(|raw| {
                let normalized = if raw.ends_with('/') {
                    raw.to_string()
                } else {
                    format!("{raw}/")
                };
                Url::parse(&normalized).with_context(|| format!("invalid firmware base URL {raw}"))
            })
            .transpose()?;

        let http_client = Client::builder()
            .user_agent("flashflux")
            .timeout(http_timeout)
            .build()
            .context("building HTTP client failed")?;

        Ok(Self {
            base_url,
            firmware_dir: firmware_dir.into(),
            http_client,
        })
    }

    /// Local-only configuration rooted at `firmware_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn local(firmware_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new(None, firmware_dir, DEFAULT_HTTP_TIMEOUT)
    }
}
