use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::bootloader::{Bootloader, ChipIdentity, Transport};
use crate::error::FlashError;
use crate::sink::{EventSink, Severity};

/// Lifecycle of the one device link a session owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Flashing,
    Erasing,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Flashing => "flashing",
            ConnectionState::Erasing => "erasing",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Current state plus a counter bumped by every teardown, so an operation
/// can tell its own session from a later one in the same state.
#[derive(Debug)]
struct Slot {
    state: ConnectionState,
    epoch: u64,
}

/// Holds the session in a transient state and puts it back on drop.
///
/// The state is only restored while the guard is still current, so a
/// teardown that moved the session elsewhere in the meantime, or a later
/// session that reached the same state, is never overwritten.
pub(crate) struct StateGuard<'a> {
    slot: &'a Mutex<Slot>,
    held: ConnectionState,
    restore: ConnectionState,
    epoch: u64,
}

impl<'a> StateGuard<'a> {
    /// Moves `from -> held` atomically, or returns the state found instead.
    fn acquire(
        slot: &'a Mutex<Slot>,
        from: ConnectionState,
        held: ConnectionState,
        restore: ConnectionState,
    ) -> Result<Self, ConnectionState> {
        let mut current = slot.lock();
        if current.state != from {
            return Err(current.state);
        }
        current.state = held;
        Ok(Self {
            slot,
            held,
            restore,
            epoch: current.epoch,
        })
    }

    /// Moves to `held` from any state, invalidating every other guard.
    fn force(
        slot: &'a Mutex<Slot>,
        held: ConnectionState,
        restore: ConnectionState,
    ) -> (Self, ConnectionState) {
        let mut current = slot.lock();
        let previous = std::mem::replace(&mut current.state, held);
        current.epoch = current.epoch.wrapping_add(1);
        (
            Self {
                slot,
                held,
                restore,
                epoch: current.epoch,
            },
            previous,
        )
    }

    fn is_current(&self) -> bool {
        let current = self.slot.lock();
        current.state == self.held && current.epoch == self.epoch
    }

    /// Fails once the session this guard was taken on has been torn down.
    pub(crate) fn ensure_current(&self) -> Result<(), FlashError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(FlashError::SessionClosed)
        }
    }

    /// Leaves the transient state for `next` instead of the restore state.
    fn finish(mut self, next: ConnectionState) {
        self.restore = next;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.slot.lock();
        if current.state == self.held && current.epoch == self.epoch {
            current.state = self.restore;
        }
    }
}

/// Owns the link to one device for the lifetime of a session.
pub struct DeviceConnection {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    slot: Mutex<Slot>,
    link: tokio::sync::Mutex<Option<Box<dyn Bootloader>>>,
    identity: Mutex<Option<ChipIdentity>>,
}

impl DeviceConnection {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            transport,
            sink,
            slot: Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                epoch: 0,
            }),
            link: tokio::sync::Mutex::new(None),
            identity: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    /// Identity reported by the last successful handshake, while connected.
    pub fn identity(&self) -> Option<ChipIdentity> {
        self.identity.lock().clone()
    }

    /// Opens the link and identifies the chip.
    ///
    /// On failure the session is back in `Disconnected` and any partially
    /// opened link has been released.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::AlreadyConnected`] or [`FlashError::Busy`] if
    /// the session is not `Disconnected`, [`FlashError::Transport`] if the
    /// link cannot be opened, [`FlashError::Handshake`] if the bootloader
    /// does not answer and [`FlashError::SessionClosed`] if a disconnect
    /// overtook the handshake.
    #[instrument(skip(self))]
    pub async fn connect(&self, baud_rate: u32) -> Result<ChipIdentity, FlashError> {
        let guard = StateGuard::acquire(
            &self.slot,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
        )
        .map_err(|state| match state {
            ConnectionState::Connected => FlashError::AlreadyConnected,
            state => FlashError::Busy { state },
        })?;

        self.sink
            .log(Severity::Info, &format!("Connecting at {baud_rate} baud..."));

        let (bootloader, identity) = match self.open_and_identify(baud_rate).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                return Err(e);
            }
        };

        let mut link = self.link.lock().await;
        if !guard.is_current() {
            // Torn down while the handshake was running.
            drop(link);
            let mut bootloader = bootloader;
            if let Err(e) = bootloader.close().await {
                warn!(error = %e, "Failed to release link after concurrent disconnect");
            }
            return Err(FlashError::SessionClosed);
        }
        *link = Some(bootloader);
        drop(link);
        *self.identity.lock() = Some(identity.clone());
        guard.finish(ConnectionState::Connected);

        info!(chip = %identity.chip, mac = ?identity.mac, "Connected");
        self.sink.log(Severity::Success, "Connected");
        self.sink
            .log(Severity::Success, &format!("Chip detected: {}", identity.chip));
        if let Some(mac) = &identity.mac {
            self.sink
                .log(Severity::Success, &format!("MAC address: {mac}"));
        }

        Ok(identity)
    }

    async fn open_and_identify(
        &self,
        baud_rate: u32,
    ) -> Result<(Box<dyn Bootloader>, ChipIdentity), FlashError> {
        let mut bootloader = self
            .transport
            .open(baud_rate)
            .await
            .map_err(FlashError::Transport)?;

        self.sink.log(Severity::Info, "Detecting chip...");
        let mut identity = match bootloader.handshake().await {
            Ok(identity) => identity,
            Err(e) => {
                if let Err(close_err) = bootloader.close().await {
                    warn!(error = %close_err, "Failed to release link after handshake failure");
                }
                return Err(FlashError::Handshake(e));
            }
        };

        if identity.mac.is_none() {
            match bootloader.read_mac().await {
                Ok(mac) => identity.mac = Some(mac),
                Err(e) => info!(error = %e, "MAC address unavailable"),
            }
        }

        Ok((bootloader, identity))
    }

    /// Resets the device into its current firmware and releases the link.
    ///
    /// Allowed from any state and always ends in `Disconnected`. Reset and
    /// release are attempted independently; failures are logged, never
    /// returned. If an operation is in flight, its current collaborator
    /// call is allowed to finish first.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let (guard, previous) = StateGuard::force(
            &self.slot,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        );
        info!(previous = %previous, "Disconnecting");
        self.sink.log(Severity::Info, "Disconnecting...");

        let mut held_link = self.link.lock().await;
        if !guard.is_current() {
            debug!("Superseded by a later disconnect");
            return;
        }
        let link = held_link.take();
        drop(held_link);
        if let Some(mut bootloader) = link {
            if let Err(e) = bootloader.reset_device().await {
                warn!(error = %e, "Device reset failed during disconnect");
                self.sink
                    .log(Severity::Warning, &format!("Device reset failed: {e}"));
            }
            if let Err(e) = bootloader.close().await {
                warn!(error = %e, "Link release failed during disconnect");
                self.sink
                    .log(Severity::Warning, &format!("Failed to release link: {e}"));
            }
        }

        *self.identity.lock() = None;
        guard.finish(ConnectionState::Disconnected);
        self.sink.log(Severity::Success, "Disconnected");
    }

    /// Enters `next` from `Connected` for the lifetime of the returned guard.
    pub(crate) fn begin(&self, next: ConnectionState) -> Result<StateGuard<'_>, FlashError> {
        StateGuard::acquire(
            &self.slot,
            ConnectionState::Connected,
            next,
            ConnectionState::Connected,
        )
        .map_err(|state| match state {
            ConnectionState::Disconnected => FlashError::NotConnected,
            state => FlashError::Busy { state },
        })
    }

    pub(crate) fn link(&self) -> &tokio::sync::Mutex<Option<Box<dyn Bootloader>>> {
        &self.link
    }
}
