use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::bootloader::{ChipIdentity, FlashOptions, Transport};
use crate::connection::{ConnectionState, DeviceConnection, StateGuard};
use crate::error::{classify, FlashError};
use crate::loader::{BinarySegmentLoader, LoadedSegment};
use crate::manifest::{FirmwareManifestEntry, ManifestCatalog, Segment};
use crate::progress::{ProgressAccumulator, ProgressEvent};
use crate::sink::{EventSink, Severity};

const BANNER: &str = "═══════════════════════════════════════";

/// Default minimum percent increment between two progress events.
pub const DEFAULT_PROGRESS_STEP: u8 = 1;

/// Drives a device session: connection lifecycle, programming and erasing.
///
/// All operations take `&self` and may be called from several tasks, but
/// they never run against the device concurrently. `program`, `erase` and
/// `connect` refuse to start unless the session is in the state they
/// require and fail fast with [`FlashError::Busy`] otherwise; only
/// `disconnect` is accepted at any time.
pub struct FlashOrchestrator {
    connection: DeviceConnection,
    loader: BinarySegmentLoader,
    sink: Arc<dyn EventSink>,
    progress_step: u8,
}

impl FlashOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        loader: BinarySegmentLoader,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            connection: DeviceConnection::new(transport, Arc::clone(&sink)),
            loader,
            sink,
            progress_step: DEFAULT_PROGRESS_STEP,
        }
    }

    /// Sets the minimum percent increment between two progress events.
    #[must_use]
    pub fn with_progress_step(mut self, step: u8) -> Self {
        self.progress_step = step;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.connection
    }

    /// See [`DeviceConnection::connect`].
    ///
    /// # Errors
    ///
    /// Propagates the connection failure, already reported to the sink.
    pub async fn connect(&self, baud_rate: u32) -> Result<ChipIdentity, FlashError> {
        self.connection
            .connect(baud_rate)
            .await
            .inspect_err(|e| self.report_failure("connect", e))
    }

    /// See [`DeviceConnection::disconnect`].
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Resolves `key` in `catalog` and programs it.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::InvalidSelection`] for an unknown key, and
    /// otherwise whatever [`FlashOrchestrator::program`] returns.
    pub async fn program_named(
        &self,
        catalog: &ManifestCatalog,
        key: &str,
    ) -> Result<(), FlashError> {
        let entry = catalog
            .resolve(key)
            .inspect_err(|e| self.report_failure("program", e))?;

        self.sink
            .log(Severity::Success, &format!("Firmware selected: {}", entry.name));
        if let Some(description) = &entry.description {
            self.sink.log(Severity::Info, description);
        }

        self.program(entry).await
    }

    /// Writes every segment of `entry` to the device, then resets it.
    ///
    /// All segments are loaded before anything is written, so a missing
    /// segment means nothing is written at all. The session is back in
    /// `Connected` when this returns, whatever the outcome. A failed write
    /// is not retried and the device is not reset afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::InvalidSelection`] for an entry without
    /// segments, [`FlashError::NotConnected`] or [`FlashError::Busy`] if
    /// the session is not `Connected`, [`FlashError::Load`] if a segment
    /// cannot be loaded, [`FlashError::SessionClosed`] if the session was
    /// torn down while segments were loading and [`FlashError::Write`] if
    /// the bootloader write fails.
    #[instrument(skip(self, entry), fields(firmware = %entry.name, version = %entry.version))]
    pub async fn program(&self, entry: &FirmwareManifestEntry) -> Result<(), FlashError> {
        if entry.segments.is_empty() {
            let err = FlashError::InvalidSelection(format!(
                "firmware '{}' has no segments to flash",
                entry.name
            ));
            self.report_failure("program", &err);
            return Err(err);
        }

        let guard = self
            .connection
            .begin(ConnectionState::Flashing)
            .inspect_err(|e| self.report_failure("program", e))?;

        self.sink.log(Severity::Info, BANNER);
        self.sink.log(Severity::Info, "Starting programming");
        self.sink.log(Severity::Info, BANNER);
        self.sink.log(
            Severity::Info,
            &format!("Firmware: {} v{}", entry.name, entry.version),
        );
        self.sink
            .log(Severity::Info, &format!("Files: {}", entry.segments.len()));

        let result = self.write_entry(entry, &guard).await;
        drop(guard);

        match result {
            Ok(()) => {
                metrics::counter!("flash_program_total", "outcome" => "success").increment(1);
                info!("Programming complete");
                self.sink.log(Severity::Info, BANNER);
                self.sink.log(Severity::Success, "Programming complete");
                self.sink.log(Severity::Info, BANNER);
                self.sink.log(
                    Severity::Info,
                    "The device is restarting with the new firmware",
                );
                Ok(())
            }
            Err(e) => {
                metrics::counter!("flash_program_total", "outcome" => "failure").increment(1);
                self.sink.log(Severity::Info, BANNER);
                self.sink.log(Severity::Error, "Programming failed");
                self.sink.log(Severity::Info, BANNER);
                self.report_failure("program", &e);
                Err(e)
            }
        }
    }

    async fn write_entry(
        &self,
        entry: &FirmwareManifestEntry,
        guard: &StateGuard<'_>,
    ) -> Result<(), FlashError> {
        let loaded = self.load_segments(&entry.segments).await?;
        let total_bytes: usize = loaded.iter().map(LoadedSegment::len).sum();

        self.sink
            .log(Severity::Success, "All files loaded successfully");
        self.sink.log(Severity::Info, BANNER);
        self.sink.log(Severity::Info, "Writing flash...");
        self.sink
            .log(Severity::Warning, "Do NOT unplug the device!");
        self.sink.log(Severity::Info, BANNER);

        let mut link = self.connection.link().lock().await;
        // Loading does not hold the link; the session may have been replaced.
        guard.ensure_current()?;
        let bootloader = link.as_mut().ok_or(FlashError::NotConnected)?;

        let names: Vec<&str> = entry.segments.iter().map(Segment::file_name).collect();
        let options = FlashOptions::preserve_device();
        let mut accumulator = ProgressAccumulator::new(self.progress_step);

        debug!(segments = loaded.len(), bytes = total_bytes, "Starting flash write");
        let mut report = |index: usize, written: u64, total: u64| {
            for event in accumulator.observe(index, written, total) {
                self.emit_progress(&names, &event);
            }
        };
        bootloader
            .write_segments(&loaded, &options, &mut report)
            .await
            .map_err(FlashError::Write)?;
        if let Some(event) = accumulator.finish() {
            self.emit_progress(&names, &event);
        }
        drop(loaded);

        self.sink.log(Severity::Info, "Resetting device...");
        if let Err(e) = bootloader.reset_device().await {
            // The image is on flash; a manual reset boots it.
            warn!(error = %e, "Reset after programming failed");
            self.sink.log(
                Severity::Warning,
                &format!("Device reset failed, reset it manually: {e}"),
            );
        }

        Ok(())
    }

    /// Loads segments one at a time, in manifest order, stopping at the first failure.
    async fn load_segments(&self, segments: &[Segment]) -> Result<Vec<LoadedSegment>, FlashError> {
        self.sink.log(Severity::Info, "Loading files...");

        let count = segments.len();
        let mut loaded = Vec::with_capacity(count);
        for (index, segment) in segments.iter().enumerate() {
            self.sink.log(
                Severity::Info,
                &format!(
                    "[{}/{count}] {} @ 0x{:X}",
                    index + 1,
                    segment.source_path,
                    segment.flash_offset
                ),
            );
            let data = self.loader.load(segment).await?;
            self.sink.log(
                Severity::Success,
                &format!(
                    "{} loaded ({:.1} KiB)",
                    segment.file_name(),
                    kib(data.len() as u64)
                ),
            );
            loaded.push(data);
        }

        Ok(loaded)
    }

    /// Erases the whole flash. `confirmed` must be `true`; otherwise the
    /// call is refused as a cancellation without touching the device.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::Cancelled`] if not confirmed,
    /// [`FlashError::NotConnected`] or [`FlashError::Busy`] if the session
    /// is not `Connected`, and [`FlashError::Erase`] if the bootloader fails.
    #[instrument(skip(self))]
    pub async fn erase(&self, confirmed: bool) -> Result<(), FlashError> {
        if !confirmed {
            metrics::counter!("flash_erase_total", "outcome" => "cancelled").increment(1);
            self.sink.log(Severity::Info, "Erase cancelled");
            return Err(FlashError::Cancelled);
        }

        let guard = self
            .connection
            .begin(ConnectionState::Erasing)
            .inspect_err(|e| self.report_failure("erase", e))?;

        self.sink.log(Severity::Info, BANNER);
        self.sink.log(Severity::Info, "Erasing flash");
        self.sink.log(Severity::Info, BANNER);
        self.sink
            .log(Severity::Warning, "Do NOT unplug the device!");
        self.sink
            .log(Severity::Info, "This can take up to 30 seconds...");

        let result = async {
            let mut link = self.connection.link().lock().await;
            guard.ensure_current()?;
            let bootloader = link.as_mut().ok_or(FlashError::NotConnected)?;
            bootloader.erase_all().await.map_err(FlashError::Erase)
        }
        .await;
        drop(guard);

        match result {
            Ok(()) => {
                metrics::counter!("flash_erase_total", "outcome" => "success").increment(1);
                info!("Flash erased");
                self.sink
                    .log(Severity::Success, "Flash erased successfully");
                self.sink
                    .log(Severity::Info, "The device is blank and ready for new firmware");
                Ok(())
            }
            Err(e) => {
                metrics::counter!("flash_erase_total", "outcome" => "failure").increment(1);
                self.sink.log(Severity::Error, "Erase failed");
                self.report_failure("erase", &e);
                Err(e)
            }
        }
    }

    fn emit_progress(&self, names: &[&str], event: &ProgressEvent) {
        self.sink.progress(event);
        self.sink.log(
            Severity::Progress,
            &format!(
                "[{}/{}] {}: {}% ({:.1}/{:.1} KiB)",
                event.segment_index + 1,
                names.len(),
                names.get(event.segment_index).copied().unwrap_or("?"),
                event.percent,
                kib(event.bytes_written),
                kib(event.bytes_total),
            ),
        );
    }

    fn report_failure(&self, operation: &str, error: &FlashError) {
        let diagnosis = classify(error);
        metrics::counter!("flash_errors_total", "kind" => diagnosis.kind.as_str()).increment(1);
        warn!(operation, kind = %diagnosis.kind, error = %error, "Operation failed");

        self.sink
            .log(Severity::Error, &format!("Error: {}", diagnosis.message));
        if let Some(hint) = diagnosis.hint {
            self.sink.log(Severity::Warning, &format!("Hint: {hint}"));
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn kib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0
}
