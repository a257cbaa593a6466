//! In-memory device emulator.
//!
//! Behaves like a microcontroller sitting in its serial bootloader: flash
//! starts erased (0xFF), writes erase the sectors they touch first, every
//! written region is checked against the segment CRC, and progress is
//! reported per block. Flash contents outlive a single connection, so a
//! reconnect sees what the previous session wrote.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::bootloader::{Bootloader, ChipIdentity, FlashOptions, ProgressCallback, Transport};
use crate::error::BootloaderError;
use crate::loader::LoadedSegment;

const ERASED: u8 = 0xFF;

#[derive(Clone, Debug)]
pub struct EmulatorConfig {
    pub chip: String,
    pub mac: String,
    /// Flash size in bytes
    pub flash_size: usize,
    /// Erase granularity, also the progress reporting granularity
    pub sector_size: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            chip: "ESP32-D0WD-V3 (emulated)".to_string(),
            mac: "24:0a:c4:00:00:01".to_string(),
            flash_size: 4 * 1024 * 1024,
            sector_size: 4096,
        }
    }
}

/// Opens links to one emulated device.
#[derive(Clone, Debug)]
pub struct EmulatorTransport {
    config: EmulatorConfig,
    flash: Arc<Mutex<Vec<u8>>>,
    resets: Arc<AtomicUsize>,
}

impl EmulatorTransport {
    pub fn new(config: EmulatorConfig) -> Self {
        let flash = vec![ERASED; config.flash_size];
        Self {
            config,
            flash: Arc::new(Mutex::new(flash)),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Copy of `len` bytes of flash starting at `offset`, clipped to the flash size.
    pub fn read_flash(&self, offset: usize, len: usize) -> Vec<u8> {
        let flash = self.flash.lock();
        let start = offset.min(flash.len());
        let end = offset.saturating_add(len).min(flash.len());
        flash[start..end].to_vec()
    }

    /// Number of device resets issued so far, across all links.
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Default for EmulatorTransport {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

#[async_trait]
impl Transport for EmulatorTransport {
    async fn open(&self, baud_rate: u32) -> Result<Box<dyn Bootloader>, BootloaderError> {
        if baud_rate == 0 {
            return Err(BootloaderError::Open("baud rate must be non-zero".to_string()));
        }
        debug!(baud_rate, "Opened emulated link");

        Ok(Box::new(EmulatedBootloader {
            config: self.config.clone(),
            flash: Arc::clone(&self.flash),
            resets: Arc::clone(&self.resets),
            synced: false,
            open: true,
        }))
    }
}

/// Bootloader client for an [`EmulatorTransport`] link.
pub struct EmulatedBootloader {
    config: EmulatorConfig,
    flash: Arc<Mutex<Vec<u8>>>,
    resets: Arc<AtomicUsize>,
    synced: bool,
    open: bool,
}

impl EmulatedBootloader {
    fn ensure_open(&self) -> Result<(), BootloaderError> {
        if self.open {
            Ok(())
        } else {
            Err(BootloaderError::LinkLost("link already closed".to_string()))
        }
    }

    fn ensure_synced(&self) -> Result<(), BootloaderError> {
        self.ensure_open()?;
        if self.synced {
            Ok(())
        } else {
            Err(BootloaderError::Handshake("bootloader not synced".to_string()))
        }
    }

    fn check_bounds(&self, index: usize, segment: &LoadedSegment) -> Result<(), BootloaderError> {
        let start = segment.flash_offset as usize;
        let end = start.checked_add(segment.len());
        match end {
            Some(end) if end <= self.config.flash_size => Ok(()),
            _ => Err(BootloaderError::Write(format!(
                "segment {index} at 0x{:X} ({} bytes) does not fit in {} bytes of flash",
                segment.flash_offset,
                segment.len(),
                self.config.flash_size
            ))),
        }
    }

    fn erase_sectors(&self, start: usize, end: usize) {
        let sector = self.config.sector_size.max(1);
        let first = start / sector * sector;
        let last = end.div_ceil(sector).saturating_mul(sector).min(self.config.flash_size);
        self.flash.lock()[first..last].fill(ERASED);
    }
}

#[async_trait]
impl Bootloader for EmulatedBootloader {
    async fn handshake(&mut self) -> Result<ChipIdentity, BootloaderError> {
        self.ensure_open()?;
        self.synced = true;
        Ok(ChipIdentity {
            chip: self.config.chip.clone(),
            mac: None,
        })
    }

    async fn read_mac(&mut self) -> Result<String, BootloaderError> {
        self.ensure_synced()?;
        Ok(self.config.mac.clone())
    }

    async fn write_segments(
        &mut self,
        segments: &[LoadedSegment],
        options: &FlashOptions,
        progress: ProgressCallback<'_>,
    ) -> Result<(), BootloaderError> {
        self.ensure_synced()?;
        for (index, segment) in segments.iter().enumerate() {
            self.check_bounds(index, segment)?;
        }

        if options.erase_all {
            self.flash.lock().fill(ERASED);
        }

        let block = self.config.sector_size.max(1);
        for (index, segment) in segments.iter().enumerate() {
            let start = segment.flash_offset as usize;
            let total = segment.len();
            self.erase_sectors(start, start + total);

            progress(index, 0, total as u64);
            let mut written = 0;
            for chunk in segment.bytes.chunks(block) {
                let at = start + written;
                self.flash.lock()[at..at + chunk.len()].copy_from_slice(chunk);
                written += chunk.len();
                progress(index, written as u64, total as u64);
                tokio::task::yield_now().await;
            }

            let digest = crc32fast::hash(&self.flash.lock()[start..start + total]);
            if digest != segment.crc {
                return Err(BootloaderError::Write(format!(
                    "digest mismatch for segment {index}: expected {:08x}, got {digest:08x}",
                    segment.crc
                )));
            }
            debug!(index, offset = start, bytes = total, "Emulated segment written");
        }

        Ok(())
    }

    async fn erase_all(&mut self) -> Result<(), BootloaderError> {
        self.ensure_synced()?;
        self.flash.lock().fill(ERASED);
        Ok(())
    }

    async fn reset_device(&mut self) -> Result<(), BootloaderError> {
        self.ensure_open()?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BootloaderError> {
        self.ensure_open()?;
        self.open = false;
        self.synced = false;
        Ok(())
    }
}
