//! Shared test utilities for `flashflux` integration tests.
//!
//! This module provides a scripted bootloader that records every call it
//! receives, a sink that records everything the core reports, and helpers
//! for serving segment files from a mock HTTP server.

// Allow dead code since not all test files use all helpers
#![allow(dead_code)]

use async_trait::async_trait;
use flashflux::bootloader::{Bootloader, ChipIdentity, FlashOptions, ProgressCallback, Transport};
use flashflux::config::LoaderConfig;
use flashflux::error::BootloaderError;
use flashflux::loader::{BinarySegmentLoader, LoadedSegment};
use flashflux::manifest::{FirmwareManifestEntry, Segment};
use flashflux::orchestrator::FlashOrchestrator;
use flashflux::progress::ProgressEvent;
use flashflux::sink::{EventSink, Severity};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// One collaborator call, as seen by [`MockTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Open(u32),
    Handshake,
    ReadMac,
    WriteBatch { segments: usize, options: FlashOptions },
    WriteSegment { index: usize, offset: u32, len: usize },
    EraseAll,
    Reset,
    Close,
}

/// Failure injection and pacing for [`MockTransport`].
#[derive(Default)]
pub struct Script {
    pub open_error: Option<String>,
    pub handshake_error: Option<String>,
    pub mac: Option<String>,
    pub write_timeout: bool,
    pub erase_timeout: bool,
    pub reset_error: bool,
    pub close_error: bool,
    /// When set, `write_segments` signals `write_started` and then waits
    /// for this to be notified before writing anything.
    pub write_gate: Option<Arc<Notify>>,
    pub write_started: Arc<Notify>,
    /// Same pacing for `handshake`.
    pub handshake_gate: Option<Arc<Notify>>,
    pub handshake_started: Arc<Notify>,
    /// Same pacing for `erase_all`.
    pub erase_gate: Option<Arc<Notify>>,
    pub erase_started: Arc<Notify>,
}

/// Transport whose links record every call into a shared log.
#[derive(Clone)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub fn new(script: Script) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub fn healthy() -> Self {
        Self::new(Script {
            mac: Some("24:0a:c4:12:34:56".to_string()),
            ..Script::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == wanted).count()
    }

    pub fn write_segments(&self) -> Vec<(usize, u32, usize)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::WriteSegment { index, offset, len } => Some((*index, *offset, *len)),
                _ => None,
            })
            .collect()
    }

    pub fn write_batches(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::WriteBatch { .. }))
            .count()
    }

    /// Changes the script of links opened from now on and of already open ones.
    pub fn script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.script.lock());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, baud_rate: u32) -> Result<Box<dyn Bootloader>, BootloaderError> {
        self.calls.lock().push(Call::Open(baud_rate));
        if let Some(message) = self.script.lock().open_error.clone() {
            return Err(BootloaderError::Open(message));
        }
        Ok(Box::new(MockBootloader {
            calls: Arc::clone(&self.calls),
            script: Arc::clone(&self.script),
        }))
    }
}

pub struct MockBootloader {
    calls: Arc<Mutex<Vec<Call>>>,
    script: Arc<Mutex<Script>>,
}

impl MockBootloader {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Bootloader for MockBootloader {
    async fn handshake(&mut self) -> Result<ChipIdentity, BootloaderError> {
        self.record(Call::Handshake);
        let (gate, started) = {
            let script = self.script.lock();
            (
                script.handshake_gate.clone(),
                Arc::clone(&script.handshake_started),
            )
        };
        pace(gate, &started).await;

        if let Some(message) = self.script.lock().handshake_error.clone() {
            return Err(BootloaderError::Handshake(message));
        }
        Ok(ChipIdentity {
            chip: "ESP32-S3".to_string(),
            mac: None,
        })
    }

    async fn read_mac(&mut self) -> Result<String, BootloaderError> {
        self.record(Call::ReadMac);
        self.script
            .lock()
            .mac
            .clone()
            .ok_or_else(|| BootloaderError::Other("no MAC".to_string()))
    }

    async fn write_segments(
        &mut self,
        segments: &[LoadedSegment],
        options: &FlashOptions,
        progress: ProgressCallback<'_>,
    ) -> Result<(), BootloaderError> {
        self.record(Call::WriteBatch {
            segments: segments.len(),
            options: options.clone(),
        });

        let (gate, started) = {
            let script = self.script.lock();
            (script.write_gate.clone(), Arc::clone(&script.write_started))
        };
        pace(gate, &started).await;

        if self.script.lock().write_timeout {
            return Err(BootloaderError::Timeout("no response to FLASH_DATA".to_string()));
        }

        for (index, segment) in segments.iter().enumerate() {
            self.record(Call::WriteSegment {
                index,
                offset: segment.flash_offset,
                len: segment.len(),
            });
            let total = segment.len() as u64;
            for written in [0, total / 3, total / 3, total / 2, total] {
                progress(index, written, total);
            }
        }
        Ok(())
    }

    async fn erase_all(&mut self) -> Result<(), BootloaderError> {
        self.record(Call::EraseAll);
        let (gate, started) = {
            let script = self.script.lock();
            (script.erase_gate.clone(), Arc::clone(&script.erase_started))
        };
        pace(gate, &started).await;

        if self.script.lock().erase_timeout {
            return Err(BootloaderError::Timeout("erase did not complete".to_string()));
        }
        Ok(())
    }

    async fn reset_device(&mut self) -> Result<(), BootloaderError> {
        self.record(Call::Reset);
        if self.script.lock().reset_error {
            return Err(BootloaderError::LinkLost("reset line unavailable".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BootloaderError> {
        self.record(Call::Close);
        if self.script.lock().close_error {
            return Err(BootloaderError::Other("port already gone".to_string()));
        }
        Ok(())
    }
}

/// Signals `started`, then parks until `gate` is notified, if one is set.
async fn pace(gate: Option<Arc<Notify>>, started: &Notify) {
    started.notify_one();
    if let Some(gate) = gate {
        gate.notified().await;
    }
}

/// Sink keeping every log line and progress event it receives.
#[derive(Default)]
pub struct RecordingSink {
    logs: Mutex<Vec<(Severity, String)>>,
    progress: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn logs(&self) -> Vec<(Severity, String)> {
        self.logs.lock().clone()
    }

    pub fn progress_events(&self) -> Vec<ProgressEvent> {
        self.progress.lock().clone()
    }

    pub fn has_log(&self, severity: Severity, needle: &str) -> bool {
        self.logs
            .lock()
            .iter()
            .any(|(s, line)| *s == severity && line.contains(needle))
    }
}

impl EventSink for RecordingSink {
    fn log(&self, severity: Severity, message: &str) {
        self.logs.lock().push((severity, message.to_string()));
    }

    fn progress(&self, event: &ProgressEvent) {
        self.progress.lock().push(*event);
    }
}

/// Serves each `(path, bytes)` pair under `/path`; anything else is a 404.
pub async fn serve_segments(files: &[(&str, Vec<u8>)]) -> MockServer {
    let server = MockServer::start().await;
    for (file, bytes) in files {
        Mock::given(method("GET"))
            .and(path(format!("/{file}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/octet-stream")
                    .set_body_bytes(bytes.clone()),
            )
            .mount(&server)
            .await;
    }
    server
}

/// Loader resolving relative paths against `server`.
pub fn http_loader(server: &MockServer) -> BinarySegmentLoader {
    let config = LoaderConfig::new(Some(server.uri().as_str()), ".", Duration::from_secs(5))
        .expect("loader config");
    BinarySegmentLoader::new(&config)
}

pub fn orchestrator(
    transport: &MockTransport,
    loader: BinarySegmentLoader,
    sink: &Arc<RecordingSink>,
) -> Arc<FlashOrchestrator> {
    Arc::new(FlashOrchestrator::new(
        Arc::new(transport.clone()),
        loader,
        Arc::clone(sink) as Arc<dyn EventSink>,
    ))
}

/// The two-segment firmware used throughout the tests.
pub fn two_part_entry() -> FirmwareManifestEntry {
    FirmwareManifestEntry {
        name: "Weather Station".to_string(),
        version: "1.4.0".to_string(),
        description: None,
        segments: vec![Segment::new("a.bin", 0x1000), Segment::new("b.bin", 0x8000)],
    }
}

pub fn two_part_files() -> Vec<(&'static str, Vec<u8>)> {
    vec![("a.bin", vec![0xA5; 3000]), ("b.bin", vec![0x5A; 12_000])]
}

/// Initialize tracing for tests (only once).
///
/// Defaults to `warn` level to reduce noise. Use `RUST_LOG=debug` for verbose output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_test_writer()
        .try_init();
}
