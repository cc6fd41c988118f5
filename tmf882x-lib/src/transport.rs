//! Collaborator contracts the driver core is written against.
//!
//! The core never touches a bus, a GPIO or a filesystem directly. A host port
//! supplies:
//!
//! - a [`Transport`] for register bursts (an I2C client in production),
//! - optionally an [`EnableLine`] controlling the chip-enable pin,
//! - an [`InterruptLine`] when the interrupt producer is used,
//! - a [`FirmwareSource`] resolving RAM-patch images by name.
//!
//! [`crate::sim::SimulatedTmf882x`] implements all of the hardware contracts for host
//! testing, and [`FirmwareDir`] resolves images from a directory.

use bytes::Bytes;
use std::future::Future;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Addressed register access over a single contiguous burst.
pub trait Transport: Send + 'static {
    /// Read `buf.len()` bytes starting at `register`.
    fn read(&mut self, register: u8, buf: &mut [u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Write `data` starting at `register`.
    fn write(&mut self, register: u8, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Chip-enable line. Low holds the sensor in reset and drops any RAM patch.
pub trait EnableLine: Send + 'static {
    fn is_high(&self) -> bool;
    fn set(&mut self, high: bool) -> Result<(), TransportError>;
}

/// Interrupt line of the sensor; `wait` resolves once per asserted edge.
pub trait InterruptLine: Send + 'static {
    fn wait(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Resolves firmware images by name. `None` means the image is not available.
pub trait FirmwareSource: Send + Sync + 'static {
    fn load(&self, name: &str) -> impl Future<Output = Option<Bytes>> + Send;
}

/// Loads firmware images from files inside a directory.
#[derive(Debug, Clone)]
pub struct FirmwareDir {
    root: PathBuf,
}

impl FirmwareDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FirmwareSource for FirmwareDir {
    async fn load(&self, name: &str) -> Option<Bytes> {
        // names are plain file names, never paths
        if name.contains(['/', '\\']) || name.starts_with('.') {
            warn!(name, "Refusing firmware name with path components");
            return None;
        }
        let path = self.root.join(name);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                debug!(path = %path.display(), len = data.len(), "Loaded firmware image");
                Some(Bytes::from(data))
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Firmware image not readable");
                None
            }
        }
    }
}

/// A firmware source that never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFirmware;

impl FirmwareSource for NoFirmware {
    async fn load(&self, _name: &str) -> Option<Bytes> {
        None
    }
}
