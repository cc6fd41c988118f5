pub mod attr;
pub mod chip;
pub mod config;
pub mod constants;
pub mod controller;
pub mod driver;
pub mod error;
pub mod events;
pub mod firmware;
pub mod message;
pub mod queue;
pub mod sim;
pub mod spad;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export the driver entry points for easy access
pub use attr::TofAttribute;
pub use chip::Mode;
pub use config::AppConfig;
pub use controller::ChipState;
pub use driver::{Access, DriverConfig, OpenFlags, Tof, TofReader};
pub use error::{Result, TofError, TransportError};
pub use events::InputEvent;
pub use message::Message;
pub use transport::{EnableLine, FirmwareDir, FirmwareSource, InterruptLine, NoFirmware, Transport};
