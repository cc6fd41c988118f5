mod common;

use common::*;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[tokio::test]
async fn test_open_application_downloads_firmware() {
    init_tracing();
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = new_state(&sim, firmware(), &test_config());
    assert!(state.fwdl_needed());

    state.open_mode(Mode::Application).await.expect("Failed to open application");

    assert_eq!(state.mode(), Mode::Application);
    assert!(!state.fwdl_needed());
    assert_eq!(sim.mode(), Mode::Application);
    assert!(sim.ram_patch_loaded());
    let counters = sim.counters();
    assert_eq!(counters.downloads, 1);
    assert_eq!(counters.ram_bytes_written, 256);
}

#[tokio::test]
async fn test_open_mode_is_idempotent() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = new_state(&sim, firmware(), &test_config());

    state.open_mode(Mode::Application).await.unwrap();
    let before = sim.counters();
    state.open_mode(Mode::Application).await.expect("Second open failed");
    let after = sim.counters();
    assert_eq!(after.mode_switches, before.mode_switches);
    assert_eq!(after.downloads, before.downloads);
    assert_eq!(state.mode(), Mode::Application);

    state.open_mode(Mode::Bootloader).await.unwrap();
    let before = sim.counters();
    state.open_mode(Mode::Bootloader).await.expect("Second bootloader open failed");
    assert_eq!(sim.counters().mode_switches, before.mode_switches);
    assert_eq!(state.mode(), Mode::Bootloader);
}

#[tokio::test]
async fn test_firmware_needed_invariant() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = new_state(&sim, firmware(), &test_config());

    state.open_mode(Mode::Application).await.unwrap();
    assert!(!state.fwdl_needed());

    state.power_off().await.unwrap();
    assert!(state.fwdl_needed());
    assert!(!sim.is_powered());

    state.open_mode(Mode::Application).await.unwrap();
    assert!(!state.fwdl_needed());
    assert_eq!(sim.counters().downloads, 2);

    state.open_mode(Mode::Bootloader).await.unwrap();
    assert!(state.fwdl_needed());
    assert!(!sim.ram_patch_loaded());
}

#[tokio::test]
async fn test_bootloader_then_application_without_firmware_fails() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = new_state(&sim, MemoryFirmware::new(), &test_config());

    state.open_mode(Mode::Bootloader).await.expect("Failed to open bootloader");
    let result = state.open_mode(Mode::Application).await;

    assert!(result.is_err(), "application without firmware must fail");
    assert_eq!(state.mode(), Mode::Bootloader);
    assert!(state.fwdl_needed());
    assert_eq!(sim.mode(), Mode::Bootloader);
}

#[tokio::test]
async fn test_rom_application_starts_without_patch() {
    let sim = SimulatedTmf882x::new();
    sim.set_rom_app(true);
    let (mut state, _shutdown) = new_state(&sim, MemoryFirmware::new(), &test_config());

    state.open_mode(Mode::Application).await.expect("ROM application should start");
    assert_eq!(state.mode(), Mode::Application);
    // the download failed, so the next open tries again
    assert!(state.fwdl_needed());
    assert_eq!(sim.counters().downloads, 0);
}

#[tokio::test]
async fn test_first_successful_candidate_wins() {
    let sim = SimulatedTmf882x::new();
    let fw = MemoryFirmware::new()
        .with_image("second.hex", demo_patch_ihex())
        .with_image("third.hex", demo_patch_ihex());
    let config = test_config().with_firmware_names(["first.hex", "second.hex", "third.hex"]);
    let (mut state, _shutdown) = new_state(&sim, fw.clone(), &config);

    state.open_mode(Mode::Application).await.unwrap();

    assert_eq!(fw.requests(), vec!["first.hex".to_string(), "second.hex".to_string()]);
    assert_eq!(sim.counters().downloads, 1);
}

#[tokio::test]
async fn test_malformed_candidate_falls_through() {
    let sim = SimulatedTmf882x::new();
    let fw = MemoryFirmware::new()
        .with_image("broken.hex", ":0400000001020304F1\n")
        .with_image("good.hex", demo_patch_ihex());
    let config = test_config().with_firmware_names(["broken.hex", "good.hex"]);
    let (mut state, _shutdown) = new_state(&sim, fw.clone(), &config);

    state.open_mode(Mode::Application).await.expect("second candidate should load");
    assert_eq!(fw.requests().len(), 2);
    assert!(!state.fwdl_needed());
}

#[tokio::test]
async fn test_download_reports_io_error_when_nothing_loads() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = new_state(&sim, MemoryFirmware::new(), &test_config());
    state.open_mode(Mode::Bootloader).await.unwrap();

    let err = state.download_firmware().await.unwrap_err();
    assert!(matches!(err, TofError::Io(_)), "unexpected error: {:?}", err);
}

#[tokio::test(start_paused = true)]
async fn test_download_timeout_moves_on() {
    let sim = SimulatedTmf882x::new();
    sim.set_download_delay(Duration::from_secs(30));
    let config = test_config().with_fwdl_timeout(Duration::from_millis(200));
    let (mut state, _shutdown) = new_state(&sim, firmware(), &config);

    let started = tokio::time::Instant::now();
    let result = state.open_mode(Mode::Application).await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(state.fwdl_needed());
    assert_eq!(sim.counters().downloads, 0);
    assert_eq!(sim.mode(), Mode::Bootloader);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_cancels_firmware_wait() {
    let sim = SimulatedTmf882x::new();
    sim.set_download_delay(Duration::from_secs(30));
    let config = test_config().with_fwdl_timeout(Duration::from_secs(600));
    let (mut state, shutdown) = new_state(&sim, firmware(), &config);

    let opener = tokio::spawn(async move {
        let result = state.open_mode(Mode::Application).await;
        (result, state)
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.send(true).unwrap();

    let (result, state) = opener.await.unwrap();
    assert!(matches!(result, Err(TofError::Cancelled)), "unexpected result: {:?}", result);
    assert_eq!(state.mode(), Mode::Unknown);
    assert!(state.fwdl_needed());
}

fn stalled_state(sim: &SimulatedTmf882x, config: &DriverConfig) -> (ChipState<SimulatedTmf882x, StalledFirmware>, watch::Sender<bool>) {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel(16);
    let state = ChipState::new(sim.clone(), enable_line(sim), StalledFirmware, config, shutdown_rx, events);
    (state, shutdown)
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_firmware_fetch_times_out() {
    let sim = SimulatedTmf882x::new();
    let config = test_config().with_fwdl_timeout(Duration::from_millis(50));
    let (mut state, _shutdown) = stalled_state(&sim, &config);

    let result = tokio::time::timeout(Duration::from_secs(2), state.open_mode(Mode::Application))
        .await
        .expect("open_mode stayed blocked on the firmware source");

    assert!(result.is_err());
    assert!(state.fwdl_needed());
    assert_eq!(sim.counters().downloads, 0);
}

#[tokio::test]
async fn test_teardown_cancels_firmware_fetch() {
    let sim = SimulatedTmf882x::new();
    let config = test_config().with_fwdl_timeout(Duration::from_secs(600));
    let (mut state, shutdown) = stalled_state(&sim, &config);
    shutdown.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), state.open_mode(Mode::Application))
        .await
        .expect("open_mode ignored the teardown request");

    assert!(matches!(result, Err(TofError::Cancelled)), "unexpected result: {:?}", result);
    assert!(state.fwdl_needed());
}

#[tokio::test]
async fn test_hard_reset_power_cycles() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    let toggles = sim.counters().enable_toggles;

    state.hard_reset().await.expect("Hard reset failed");

    assert_eq!(sim.counters().enable_toggles, toggles + 2);
    assert_eq!(sim.counters().downloads, 2);
    assert_eq!(state.mode(), Mode::Application);
}

#[tokio::test]
async fn test_chip_enable_requires_line() {
    let sim = SimulatedTmf882x::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (events, _) = tokio::sync::broadcast::channel(4);
    let mut state = ChipState::new(sim.clone(), None, firmware(), &test_config(), shutdown_rx, events);

    assert_eq!(state.chip_enabled(), None);
    assert!(matches!(state.set_chip_enable(false).await, Err(TofError::NotSupported(_))));
    // without a line power-off only closes the chip
    state.open_mode(Mode::Application).await.unwrap();
    state.power_off().await.unwrap();
    assert!(sim.is_powered());
    assert!(state.fwdl_needed());
    drop(shutdown_tx);
}

#[tokio::test]
async fn test_device_info() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    assert_eq!(state.firmware_version().await.unwrap(), "4.2.3.7");
    assert_eq!(state.device_revision().await.unwrap(), "8.1");
    assert_eq!(state.device_uid().await.unwrap(), "18.52.86.120");
    // no stream handle open, the chip goes back to standby
    assert_eq!(sim.mode(), Mode::Unknown);
}

#[tokio::test]
async fn test_stuck_command_times_out() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    sim.set_command_latency(u32::MAX);

    let err = state.start_capture().await.unwrap_err();
    assert!(matches!(err, TofError::Timeout(_)), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_slow_command_completes_within_budget() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    sim.set_command_latency(3);

    state.start_capture().await.expect("Slow command should complete");
    assert!(sim.is_measuring());
}

#[tokio::test]
async fn test_suspend_resume_restarts_capture() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    state.start_capture().await.unwrap();
    state.enqueue(&Message::overflow());

    state.suspend().await.unwrap();
    assert!(state.queue().is_empty());
    assert_eq!(sim.mode(), Mode::Unknown);

    state.resume().await.unwrap();
    assert!(sim.is_measuring());
    assert_eq!(sim.counters().downloads, 1);
}

#[tokio::test]
async fn test_stop_capture_flushes_queue() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    state.start_capture().await.unwrap();
    assert!(sim.inject_result(results_with(1, 3)));
    assert_eq!(state.drain().await.unwrap(), 1);
    assert!(!state.queue().is_empty());

    state.stop_capture().await.unwrap();
    assert!(state.queue().is_empty());
    assert!(!sim.is_measuring());
}

#[tokio::test]
async fn test_drain_collects_results_and_errors() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    state.start_capture().await.unwrap();

    sim.inject_result(results_with(1, 2));
    sim.inject_result(results_with(2, 2));
    sim.raise_error();
    assert_eq!(state.drain().await.unwrap(), 3);

    let mut seen = Vec::new();
    while let Some(bytes) = state.queue_mut().take_message() {
        seen.push(Message::decode(&bytes).unwrap());
    }
    assert_eq!(
        seen,
        vec![
            Message::MeasResults(results_with(1, 2)),
            Message::Error(ErrorCode::Measurement),
            Message::MeasResults(results_with(2, 2)),
        ]
    );
}

#[tokio::test]
async fn test_bus_failure_surfaces() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    sim.set_nack_all(true);

    let err = state.firmware_version().await.unwrap_err();
    assert!(matches!(err, TofError::Transport(_)));
}
