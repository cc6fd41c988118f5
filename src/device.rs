//! Command-line device setup shared by the binaries.
//!
//! Both tools drive the driver against a simulated TMF882x. Driver settings come
//! from an optional JSON file (`DriverConfig`) with command-line overrides on top.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

use tmf882x_lib::sim::{MemoryFirmware, SimulatedTmf882x, demo_patch_ihex};
use tmf882x_lib::{DriverConfig, FirmwareDir, FirmwareSource, Tof};

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// JSON file with driver settings.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Directory to load RAM patch images from. Without it the built-in demo
    /// patch is used.
    #[arg(short, long)]
    pub firmware_dir: Option<PathBuf>,
    /// Producer poll period in units of 100 us; 0 uses the interrupt line.
    #[arg(short, long)]
    pub poll_period: Option<u32>,
    /// Initial driver debug level.
    #[arg(long)]
    pub debug_level: Option<u8>,
    /// Attach without the initial hard reset.
    #[arg(long)]
    pub no_reset: bool,
}

impl DeviceArgs {
    pub fn driver_config(&self) -> Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read driver config at: {:?}", path))?;
                DriverConfig::from_json(&text).with_context(|| format!("Invalid driver config in {:?}", path))?
            }
            None => DriverConfig::default(),
        };
        if let Some(period) = self.poll_period {
            config = config.with_poll_period(period);
        }
        if let Some(level) = self.debug_level {
            config = config.with_debug_level(level);
        }
        if self.no_reset {
            config = config.with_reset_on_attach(false);
        }
        Ok(config)
    }

    pub fn firmware(&self, config: &DriverConfig) -> CliFirmware {
        match &self.firmware_dir {
            Some(dir) => CliFirmware::Dir(FirmwareDir::new(dir)),
            None => {
                let demo = Bytes::from(demo_patch_ihex());
                let images = config
                    .firmware_names
                    .iter()
                    .fold(MemoryFirmware::new(), |fw, name| fw.with_image(name.clone(), demo.clone()));
                CliFirmware::Demo(images)
            }
        }
    }
}

/// Firmware for the command-line tools: a directory or the built-in demo patch.
#[derive(Clone)]
pub enum CliFirmware {
    Dir(FirmwareDir),
    Demo(MemoryFirmware),
}

impl FirmwareSource for CliFirmware {
    async fn load(&self, name: &str) -> Option<Bytes> {
        match self {
            CliFirmware::Dir(dir) => dir.load(name).await,
            CliFirmware::Demo(images) => images.load(name).await,
        }
    }
}

pub type SimTof = Tof<SimulatedTmf882x, CliFirmware>;

/// Attach the driver to a fresh simulated chip, interrupt-driven unless the
/// config selects polling.
pub async fn attach_simulated(args: &DeviceArgs) -> Result<(SimulatedTmf882x, SimTof)> {
    let config = args.driver_config()?;
    let firmware = args.firmware(&config);
    let sim = SimulatedTmf882x::new();
    info!(poll_period = config.poll_period, reset = config.reset_on_attach, "Attaching to simulated TMF882x");
    let tof = Tof::attach_with_interrupt(
        sim.clone(),
        Some(Box::new(sim.enable_line())),
        sim.interrupt_line(),
        firmware,
        config,
    )
    .await
    .context("Failed to attach to device")?;
    Ok((sim, tof))
}
