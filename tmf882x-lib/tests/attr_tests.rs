mod common;

use common::*;
use tmf882x_lib::attr::{self, TofAttribute};

#[tokio::test]
async fn test_show_device_identity() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    assert_eq!(attr::show(&mut state, TofAttribute::Mode).await.unwrap(), "0x3\n");
    assert_eq!(attr::show(&mut state, TofAttribute::FirmwareVersion).await.unwrap(), "4.2.3.7\n");
    assert_eq!(attr::show(&mut state, TofAttribute::DeviceRevision).await.unwrap(), "8.1\n");
    assert_eq!(attr::show(&mut state, TofAttribute::DeviceUid).await.unwrap(), "18.52.86.120\n");
    assert_eq!(attr::show(&mut state, TofAttribute::ChipEnable).await.unwrap(), "1\n");
}

#[tokio::test]
async fn test_store_mode_switches() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::Mode, "0x80").await.expect("Failed to enter bootloader");
    assert_eq!(state.mode(), Mode::Bootloader);
    assert_eq!(attr::show(&mut state, TofAttribute::Mode).await.unwrap(), "0x80\n");

    attr::store(&mut state, TofAttribute::Mode, "3\n").await.expect("Failed to enter application");
    assert_eq!(state.mode(), Mode::Application);

    let err = attr::store(&mut state, TofAttribute::Mode, "0x42").await.unwrap_err();
    assert!(matches!(err, TofError::InvalidInput(_)));
}

#[tokio::test]
async fn test_config_attributes_round_trip_through_device() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::ReportPeriodMs, "0x64").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::ReportPeriodMs).await.unwrap(), "100\n");
    assert_eq!(sim.device_config().report_period_ms, 100);

    attr::store(&mut state, TofAttribute::ConfThreshold, "010").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::ConfThreshold).await.unwrap(), "8\n");

    attr::store(&mut state, TofAttribute::ZoneMask, "0x1ff").await.unwrap();
    assert_eq!(sim.device_config().zone_mask, 0x1FF);
}

#[tokio::test]
async fn test_iterations_are_kept_in_thousands() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::Iterations, "550000").await.unwrap();
    assert_eq!(sim.device_config().kilo_iterations, 537);
    assert_eq!(attr::show(&mut state, TofAttribute::Iterations).await.unwrap(), "549888\n");

    let err = attr::store(&mut state, TofAttribute::Iterations, "100000000").await.unwrap_err();
    assert!(matches!(err, TofError::InvalidInput(_)));
}

#[tokio::test]
async fn test_out_of_range_values_are_rejected() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    let writes = sim.counters().config_writes;

    for (attribute, input) in [
        (TofAttribute::AlgSetting, "256"),
        (TofAttribute::ReportPeriodMs, "-1"),
        (TofAttribute::SpadMapId, "16"),
        (TofAttribute::Xsize0, "19"),
        (TofAttribute::Ysize1, "11"),
        (TofAttribute::Persistence, "five"),
        (TofAttribute::LowThreshold, "12abc"),
    ] {
        let result = attr::store(&mut state, attribute, input).await;
        assert!(
            matches!(result, Err(TofError::InvalidInput(_))),
            "{} accepted '{}': {:?}",
            attribute,
            input,
            result
        );
    }
    assert_eq!(sim.counters().config_writes, writes);
    assert!(!state.spad_uncommitted());
}

#[tokio::test]
async fn test_access_direction_is_enforced() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    for attribute in [TofAttribute::FirmwareVersion, TofAttribute::DeviceUid, TofAttribute::Registers] {
        let err = attr::store(&mut state, attribute, "1").await.unwrap_err();
        assert!(matches!(err, TofError::NotSupported(_)), "{} is writable", attribute);
    }
    for attribute in [TofAttribute::RegisterWrite, TofAttribute::RequestRamPatch, TofAttribute::ResetSpadCfg] {
        let err = attr::show(&mut state, attribute).await.unwrap_err();
        assert!(matches!(err, TofError::NotSupported(_)), "{} is readable", attribute);
    }
}

#[tokio::test]
async fn test_spad_attributes_stage_until_commit() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::Xsize0, "4").await.unwrap();
    attr::store(&mut state, TofAttribute::Ysize0, "2").await.unwrap();
    attr::store(&mut state, TofAttribute::SpadMap0, "1 2 x 3 4\n5 6 7 8").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::CommitSpadCfg).await.unwrap(), "0\n");
    assert_eq!(attr::show(&mut state, TofAttribute::SpadMap0).await.unwrap(), "1 2 3 4 \n5 6 7 8 \n");
    assert_eq!(sim.device_spad(0).unwrap().xsize, MAX_SPAD_XSIZE);

    // anything but 1 leaves the drafts alone
    attr::store(&mut state, TofAttribute::CommitSpadCfg, "0").await.unwrap();
    assert!(state.spad_uncommitted());

    attr::store(&mut state, TofAttribute::CommitSpadCfg, "1").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::CommitSpadCfg).await.unwrap(), "1\n");
    let device = sim.device_spad(0).unwrap();
    assert_eq!((device.xsize, device.ysize), (4, 2));
    assert_eq!(&device.spad_map[..9], &[1, 2, 3, 4, 5, 6, 7, 8, 0]);
}

#[tokio::test]
async fn test_reset_spad_cfg_restores_device_maps() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::XoffQ1_1, "-6").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::XoffQ1_1).await.unwrap(), "-6\n");

    attr::store(&mut state, TofAttribute::ResetSpadCfg, "1").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::XoffQ1_1).await.unwrap(), "1\n");
    assert!(!state.spad_uncommitted());
}

#[tokio::test]
async fn test_capture_attribute() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    assert_eq!(attr::show(&mut state, TofAttribute::Capture).await.unwrap(), "0\n");
    attr::store(&mut state, TofAttribute::Capture, "1").await.unwrap();
    assert!(sim.is_measuring());
    assert_eq!(attr::show(&mut state, TofAttribute::Capture).await.unwrap(), "1\n");

    attr::store(&mut state, TofAttribute::Capture, "0").await.unwrap();
    assert!(!sim.is_measuring());
}

#[tokio::test]
async fn test_register_write_and_dump() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::RegisterWrite, "0xE2:0x0A").await.unwrap();
    attr::store(&mut state, TofAttribute::RegisterWrite, "0xE2:0xFF:0x01").await.unwrap();

    let dump = attr::show(&mut state, TofAttribute::Registers).await.unwrap();
    assert_eq!(dump.lines().count(), MAX_REGS / 4);
    let line = dump.lines().find(|l| l.starts_with("0xe0:")).expect("Failed to find row 0xe0");
    // enable, int status, int enable, chip id
    assert_eq!(line, "0xe0: 41 00 0b 08");

    let err = attr::store(&mut state, TofAttribute::RegisterWrite, "0x100:1").await.unwrap_err();
    assert!(matches!(err, TofError::InvalidInput(_)));
}

#[tokio::test]
async fn test_driver_debug_attribute() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::DriverDebug, "2").await.unwrap();
    assert_eq!(state.debug_level(), 2);
    assert_eq!(attr::show(&mut state, TofAttribute::DriverDebug).await.unwrap(), "2\n");
}

#[tokio::test]
async fn test_chip_enable_attribute_power_cycles() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::ChipEnable, "0").await.unwrap();
    assert!(!sim.is_powered());
    assert_eq!(attr::show(&mut state, TofAttribute::ChipEnable).await.unwrap(), "0\n");

    attr::store(&mut state, TofAttribute::ChipEnable, "1").await.unwrap();
    assert_eq!(sim.mode(), Mode::Application);
    assert_eq!(sim.counters().downloads, 2);
}

#[tokio::test]
async fn test_request_ram_patch_resyncs() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;
    attr::store(&mut state, TofAttribute::XoffQ1_0, "3").await.unwrap();

    attr::store(&mut state, TofAttribute::RequestRamPatch, "1").await.unwrap();

    assert_eq!(sim.counters().downloads, 2);
    assert!(!state.spad_uncommitted());
    assert_eq!(state.spad_draft(0).unwrap().xoff_q1, 1);
}

#[tokio::test]
async fn test_mode_8x8_attribute() {
    let sim = SimulatedTmf882x::new();
    let (mut state, _shutdown) = app_state(&sim).await;

    attr::store(&mut state, TofAttribute::Mode8x8, "1").await.unwrap();
    assert_eq!(attr::show(&mut state, TofAttribute::Mode8x8).await.unwrap(), "1\n");
    assert_eq!(attr::show(&mut state, TofAttribute::SpadMapId).await.unwrap(), "15\n");
}
