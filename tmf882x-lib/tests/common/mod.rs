//! Common test utilities and shared imports

// Shared across test files; not every helper is used by every file
#![allow(dead_code, unused_imports)]

pub use bytes::Bytes;
pub use tmf882x_lib::chip::Mode;
pub use tmf882x_lib::constants::*;
pub use tmf882x_lib::controller::ChipState;
pub use tmf882x_lib::driver::{DriverConfig, OpenFlags, Tof};
pub use tmf882x_lib::error::TofError;
pub use tmf882x_lib::message::{ErrorCode, MeasResult, MeasResults, Message};
pub use tmf882x_lib::sim::{MemoryFirmware, SimulatedTmf882x, demo_patch_ihex, ihex_record};
pub use tmf882x_lib::transport::{EnableLine, FirmwareSource};

use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub const FIRMWARE_NAME: &str = "tmf882x_firmware.bin";

pub type SimState = ChipState<SimulatedTmf882x, MemoryFirmware>;
pub type SimTof = Tof<SimulatedTmf882x, MemoryFirmware>;

/// Route library logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Firmware source whose lookups never complete.
#[derive(Debug, Clone, Copy)]
pub struct StalledFirmware;

impl FirmwareSource for StalledFirmware {
    async fn load(&self, _name: &str) -> Option<Bytes> {
        std::future::pending().await
    }
}

pub fn firmware() -> MemoryFirmware {
    MemoryFirmware::new().with_image(FIRMWARE_NAME, demo_patch_ihex())
}

/// Driver settings for tests: no reset while attaching, a small command poll
/// budget so stuck commands fail fast.
pub fn test_config() -> DriverConfig {
    DriverConfig::default()
        .with_reset_on_attach(false)
        .with_command_poll_budget(8)
}

pub fn enable_line(sim: &SimulatedTmf882x) -> Option<Box<dyn EnableLine>> {
    Some(Box::new(sim.enable_line()))
}

/// Bare driver state over `sim`. Keep the sender alive, dropping it is not a
/// teardown request but tests may want to send one.
pub fn new_state(sim: &SimulatedTmf882x, fw: MemoryFirmware, config: &DriverConfig) -> (SimState, watch::Sender<bool>) {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel(16);
    let state = ChipState::new(sim.clone(), enable_line(sim), fw, config, shutdown_rx, events);
    (state, shutdown)
}

/// Driver state already running the application.
pub async fn app_state(sim: &SimulatedTmf882x) -> (SimState, watch::Sender<bool>) {
    let (mut state, shutdown) = new_state(sim, firmware(), &test_config());
    state
        .set_mode(Mode::Application)
        .await
        .expect("Failed to enter application mode");
    (state, shutdown)
}

/// Attached driver without a producer task; call `service()` to drain.
pub async fn attach(sim: &SimulatedTmf882x, config: DriverConfig) -> Arc<SimTof> {
    let tof = Tof::attach_without_producer(sim.clone(), enable_line(sim), firmware(), config)
        .await
        .expect("Failed to attach");
    Arc::new(tof)
}

pub fn results_with(result_num: u8, channels: u8) -> MeasResults {
    MeasResults {
        result_num,
        temperature_c: 25,
        ambient_light: 10,
        photon_count: 20,
        ref_photon_count: 30,
        sys_tick: 1000 * result_num as u32,
        results: (1..=channels)
            .map(|channel| MeasResult {
                channel,
                sub_capture: 0,
                confidence: 100,
                distance_mm: 100 * channel as u16,
            })
            .collect(),
    }
}

/// Split a read buffer into its framed messages.
pub fn split_messages(mut bytes: &[u8]) -> Vec<Message> {
    let mut out = Vec::new();
    while bytes.len() >= MSG_HEADER_SIZE {
        let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        out.push(Message::decode(&bytes[..len]).expect("Failed to decode message"));
        bytes = &bytes[len..];
    }
    assert!(bytes.is_empty(), "trailing partial message");
    out
}
