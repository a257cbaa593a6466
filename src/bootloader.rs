//! Seams to the device-side collaborators.
//!
//! The flashing core never speaks the bootloader wire protocol itself. A
//! [`Transport`] opens a link to the device and hands back a
//! [`Bootloader`] bound to it; everything else goes through that handle.

use async_trait::async_trait;
use std::fmt;

use crate::error::BootloaderError;
use crate::loader::LoadedSegment;

/// Callback receiving `(segment_index, bytes_written, bytes_total)` while a write runs.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(usize, u64, u64) + Send);

/// What the handshake found on the other end of the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipIdentity {
    pub chip: String,
    pub mac: Option<String>,
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mac {
            Some(mac) => write!(f, "{} ({mac})", self.chip),
            None => f.write_str(&self.chip),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashMode {
    Qio,
    Qout,
    Dio,
    Dout,
}

/// Options passed with every segment write. `None` keeps whatever the
/// device already reports for that setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    pub flash_size: Option<u32>,
    pub flash_mode: Option<FlashMode>,
    pub flash_freq_mhz: Option<u8>,
    pub erase_all: bool,
    pub compress: bool,
}

impl FlashOptions {
    /// Keep the device's flash geometry, only touch the addressed regions,
    /// and compress where the bootloader supports it.
    pub fn preserve_device() -> Self {
        Self {
            flash_size: None,
            flash_mode: None,
            flash_freq_mhz: None,
            erase_all: false,
            compress: true,
        }
    }
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self::preserve_device()
    }
}

/// Opens byte-stream links to a device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the link at `baud_rate`. Nothing has been said to the
    /// bootloader yet when this returns.
    async fn open(&self, baud_rate: u32) -> Result<Box<dyn Bootloader>, BootloaderError>;
}

/// A bootloader client bound to one open link.
#[async_trait]
pub trait Bootloader: Send {
    /// Syncs with the bootloader and identifies the chip.
    async fn handshake(&mut self) -> Result<ChipIdentity, BootloaderError>;

    /// Reads the factory MAC address.
    async fn read_mac(&mut self) -> Result<String, BootloaderError> {
        Err(BootloaderError::Other(
            "MAC address not available from this bootloader".to_string(),
        ))
    }

    /// Writes all segments in order in a single session, reporting progress
    /// per segment.
    async fn write_segments(
        &mut self,
        segments: &[LoadedSegment],
        options: &FlashOptions,
        progress: ProgressCallback<'_>,
    ) -> Result<(), BootloaderError>;

    async fn erase_all(&mut self) -> Result<(), BootloaderError>;

    /// Resets the device into whatever firmware is on flash.
    async fn reset_device(&mut self) -> Result<(), BootloaderError>;

    /// Releases the underlying link.
    async fn close(&mut self) -> Result<(), BootloaderError>;
}
