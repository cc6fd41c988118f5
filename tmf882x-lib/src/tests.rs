use crate::attr::{
    TofAttribute, format_registers, parse_c_int, parse_field, parse_mode, parse_register_write, parse_spad_values,
};
use crate::chip::{EnableReg, IntStatus, Mode, RESULT_PAGE_SIZE, ResultPageRaw, bl_checksum, default_int_enable};
use crate::config::{AppConfig, CONFIG_PAGE_SIZE, CalibrationCache};
use crate::constants::*;
use crate::error::TofError;
use crate::events::{InputEvent, events_for};
use crate::firmware::FirmwareImage;
use crate::message::{ErrorCode, MeasResult, MeasResults, Message, MessageId, decode_header, meas_results_size};
use crate::queue::{MessageQueue, PushOutcome};
use crate::sim::ihex_record;
use crate::spad::{SPAD_PAGE_SIZE, SpadConfig};
use bytes::Bytes;
use num_enum::FromPrimitive;
use zerocopy::IntoBytes;

fn opaque(id: u16, payload_len: usize) -> Bytes {
    Message::Unknown {
        id,
        payload: Bytes::from(vec![id as u8; payload_len]),
    }
    .encode()
}

fn sample_results() -> MeasResults {
    MeasResults {
        result_num: 7,
        temperature_c: -4,
        ambient_light: 1000,
        photon_count: 2000,
        ref_photon_count: 3000,
        sys_tick: 0xDEADBEEF,
        results: vec![
            MeasResult {
                channel: 1,
                sub_capture: 0,
                confidence: 255,
                distance_mm: 512,
            },
            MeasResult {
                channel: 9,
                sub_capture: 1,
                confidence: 12,
                distance_mm: 4000,
            },
        ],
    }
}

#[test]
fn test_decode_header() {
    let bytes = hex::decode("01000c00aabbccdd").expect("Failed to decode hex");
    let header = decode_header(&bytes).expect("Failed to decode header");
    assert_eq!(header.id, MessageId::MeasResults);
    assert_eq!(header.length, 12);
}

#[test]
fn test_decode_header_rejects_short_and_out_of_range() {
    assert!(matches!(decode_header(&[0x01, 0x00, 0x0c]), Err(TofError::Format(_))));
    // length below the header itself
    assert!(matches!(decode_header(&hex::decode("01000300").unwrap()), Err(TofError::Format(_))));
    // 1025 bytes
    assert!(matches!(decode_header(&hex::decode("01000104").unwrap()), Err(TofError::Format(_))));
}

#[test]
fn test_unknown_message_id_is_carried() {
    let bytes = hex::decode("3412060099aa").unwrap();
    let msg = Message::decode(&bytes).expect("Failed to decode message");
    assert_eq!(
        msg,
        Message::Unknown {
            id: 0x1234,
            payload: Bytes::from_static(&[0x99, 0xaa]),
        }
    );
    assert_eq!(MessageId::from_primitive(0x1234), MessageId::Unknown(0x1234));
}

#[test]
fn test_measurement_message_layout() {
    let msg = Message::MeasResults(sample_results());
    let bytes = msg.encode();
    assert_eq!(bytes.len(), meas_results_size(2));
    assert_eq!(&bytes[..4], &hex::decode("01002400").unwrap()[..]);
    // result_num, temperature, count
    assert_eq!(&bytes[4..7], &[7, 0xfc, 2]);
    assert_eq!(Message::decode(&bytes).unwrap(), msg);
}

#[test]
fn test_overflow_record_encoding() {
    let bytes = Message::overflow().encode();
    assert_eq!(hex::encode(&bytes), "0200080001000000");
    assert_eq!(Message::decode(&bytes).unwrap(), Message::Error(ErrorCode::BufOverflow));
}

#[test]
fn test_decode_rejects_frame_length_mismatch() {
    let mut bytes = opaque(0x20, 8).to_vec();
    bytes.push(0);
    assert!(matches!(Message::decode(&bytes), Err(TofError::Format(_))));
}

#[test]
fn test_queue_twelve_byte_scenario() {
    let mut queue = MessageQueue::with_capacity(64);
    let msg = opaque(0x42, 8);
    assert_eq!(msg.len(), 12);

    assert_eq!(queue.push(&msg).unwrap(), PushOutcome::Queued);
    assert_eq!(queue.peek_next_length(), Some(12));

    let mut out = [0u8; 64];
    let n = queue.pop_message(&mut out).unwrap();
    assert_eq!(n, 12);
    assert_eq!(&out[..n], &msg[..]);
    assert!(queue.is_empty());
    assert_eq!(queue.peek_next_length(), None);
}

#[test]
fn test_queue_overflow_recovery() {
    let mut queue = MessageQueue::with_capacity(64);
    let first = opaque(0x10, 26);
    let second = opaque(0x11, 26);
    let third = opaque(0x12, 20);
    assert_eq!(queue.push(&first).unwrap(), PushOutcome::Queued);
    assert_eq!(queue.push(&second).unwrap(), PushOutcome::Queued);
    assert_eq!(queue.push(&third).unwrap(), PushOutcome::RecoveredFromOverflow);

    let overflow = queue.take_message().expect("overflow record");
    assert_eq!(Message::decode(&overflow).unwrap(), Message::Error(ErrorCode::BufOverflow));
    assert_eq!(queue.take_message().expect("retried message"), third);
    assert!(queue.take_message().is_none());
}

#[test]
fn test_queue_message_larger_than_capacity() {
    let mut queue = MessageQueue::with_capacity(32);
    queue.push(&opaque(0x10, 4)).unwrap();
    let err = queue.push(&opaque(0x11, 40)).unwrap_err();
    assert!(matches!(err, TofError::Overflow { len: 44, capacity: 32 }));
    // only the overflow record survived
    assert_eq!(queue.len(), 8);
}

#[test]
fn test_queue_rejects_unframed_bytes() {
    let mut queue = MessageQueue::with_capacity(64);
    assert!(matches!(queue.push(&[1, 2, 3]), Err(TofError::Format(_))));
    assert!(matches!(queue.push(&hex::decode("01000800aabb").unwrap()), Err(TofError::Format(_))));
    assert!(queue.is_empty());
}

#[test]
fn test_queue_pop_into_small_buffer_leaves_queue() {
    let mut queue = MessageQueue::with_capacity(64);
    let msg = opaque(0x42, 8);
    queue.push(&msg).unwrap();
    let mut small = [0u8; 8];
    assert!(matches!(queue.pop_message(&mut small), Err(TofError::InvalidArgument(_))));
    assert_eq!(queue.len(), 12);
    assert_eq!(queue.take_message().unwrap(), msg);
}

#[test]
fn test_queue_wraps_around() {
    let mut queue = MessageQueue::with_capacity(64);
    let msgs: Vec<Bytes> = (0..4).map(|i| opaque(0x30 + i, 16)).collect();
    for m in &msgs[..3] {
        queue.push(m).unwrap();
    }
    assert_eq!(queue.take_message().unwrap(), msgs[0]);
    // tail sits at 60, this one straddles the end of the ring
    assert_eq!(queue.push(&msgs[3]).unwrap(), PushOutcome::Queued);
    assert_eq!(queue.utilization_percent(), 93);
    for m in &msgs[1..] {
        assert_eq!(queue.take_message().unwrap(), *m);
    }
    assert!(queue.is_empty());
}

#[test]
fn test_ihex_parse_segments() {
    let text = [
        ihex_record(0x04, 0, &[0x00, 0x00]),
        ihex_record(0x00, 0x0000, &[1, 2, 3, 4]),
        ihex_record(0x00, 0x0004, &[5, 6]),
        ihex_record(0x00, 0x0100, &[7]),
        ihex_record(0x01, 0, &[]),
    ]
    .join("\n");
    let image = FirmwareImage::parse(text.as_bytes()).expect("Failed to parse image");
    assert_eq!(image.segments().len(), 2);
    assert_eq!(image.segments()[0].address, 0);
    assert_eq!(image.segments()[0].data, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(image.segments()[1].address, 0x100);
    assert_eq!(image.len(), 7);
}

#[test]
fn test_ihex_checksum_rejected() {
    let good = ihex_record(0x00, 0, &[0xAA, 0xBB]);
    let mut bad = good.clone();
    bad.replace_range(bad.len() - 2.., "00");
    let text = format!("{}\n:00000001FF\n", bad);
    let err = FirmwareImage::from_ihex(&text).unwrap_err();
    assert!(err.to_string().contains("checksum"), "unexpected error: {}", err);
}

#[test]
fn test_ihex_requires_eof_record() {
    let text = ihex_record(0x00, 0, &[1]);
    assert!(matches!(FirmwareImage::from_ihex(&text), Err(TofError::Format(_))));
}

#[test]
fn test_binary_image_loads_at_zero() {
    let image = FirmwareImage::parse(&[0x12, 0x34, 0x56]).unwrap();
    assert_eq!(image.segments().len(), 1);
    assert_eq!(image.segments()[0].address, 0);
    assert!(FirmwareImage::parse(b"  \n").is_err());
}

#[test]
fn test_bl_checksum() {
    // DOWNLOAD_INIT with seed
    assert_eq!(bl_checksum(&[BL_CMD_DOWNLOAD_INIT, 0x01, BL_DOWNLOAD_INIT_SEED]), 0xC1);
    assert_eq!(bl_checksum(&[BL_CMD_RAMREMAP_RESET, 0x00]), 0xEE);
}

#[test]
fn test_register_bitfields() {
    assert!(IntStatus::from_byte(0x02).results());
    assert!(IntStatus::from_byte(0x08).error());
    assert_eq!(default_int_enable(), 0x0A);
    let enable = EnableReg::from_bytes([0x41]);
    assert!(enable.pon());
    assert!(enable.cpu_ready());
}

#[test]
fn test_mode_names_and_ids() {
    assert_eq!(Mode::Application.to_string(), "application");
    assert_eq!(Mode::from_appid(0x80), Mode::Bootloader);
    assert_eq!(Mode::from_appid(0x03), Mode::Application);
    assert_eq!(Mode::from_appid(0x00), Mode::Unknown);
    assert_eq!(Mode::Unknown.appid(), None);
}

#[test]
fn test_result_page_conversion() {
    let meas = sample_results();
    let page = ResultPageRaw::from_results(&meas);
    assert_eq!(page.as_bytes().len(), RESULT_PAGE_SIZE);
    assert_eq!(page.page_id, PAGE_ID_RESULTS);
    assert_eq!(page.results[1].channel_subcap, 0x19);
    assert_eq!(page.to_results(), meas);
}

#[test]
fn test_config_page_layout() {
    let config = AppConfig::default();
    let page = config.to_page();
    let bytes = page.as_bytes();
    assert_eq!(bytes.len(), CONFIG_PAGE_SIZE);
    assert_eq!(bytes[0], PAGE_ID_COMMON);
    // 33 ms report period, little endian
    assert_eq!(&bytes[4..6], &[33, 0]);
    assert_eq!(AppConfig::from_page(&page), config);
}

#[test]
fn test_alters_framing_ignores_report_period() {
    let base = AppConfig::default();
    let mut next = base;
    next.report_period_ms = 100;
    assert!(!base.alters_framing(&next));
    next.zone_mask = 0x1FF;
    assert!(base.alters_framing(&next));
    let mut gpio = base;
    gpio.gpio_1 = 3;
    assert!(base.alters_framing(&gpio));
}

#[test]
fn test_config_validate() {
    let mut config = AppConfig::default();
    config.spad_map_id = 16;
    assert!(matches!(config.validate(), Err(TofError::InvalidInput(_))));
    config.spad_map_id = 15;
    config.zone_mask = 1 << 18;
    assert!(matches!(config.validate(), Err(TofError::InvalidInput(_))));
}

#[test]
fn test_calibration_window() {
    let mut cache = CalibrationCache::default();
    cache.fill((0..10).collect());
    assert_eq!(cache.window(0, 4), &[0, 1, 2, 3]);
    assert_eq!(cache.window(8, 4), &[8, 9]);
    assert!(cache.window(10, 4).is_empty());
    assert!(cache.window(usize::MAX, 4).is_empty());
}

#[test]
fn test_spad_page_packing() {
    let mut spad = SpadConfig {
        xoff_q1: -2,
        yoff_q1: 3,
        ..SpadConfig::default()
    };
    spad.spad_mask[0] = 1;
    spad.spad_mask[9] = 1;
    spad.spad_map[0] = 0x3;
    spad.spad_map[1] = 0xA;
    let page = spad.to_page(PAGE_ID_SPAD_1).unwrap();
    let bytes = page.as_bytes();
    assert_eq!(bytes.len(), SPAD_PAGE_SIZE);
    assert_eq!(&bytes[..6], &[PAGE_ID_SPAD_1, 0, 0xFE, 3, 18, 10]);
    assert_eq!(page.mask[0], 0x01);
    assert_eq!(page.mask[1], 0x02);
    assert_eq!(page.map[0], 0xA3);
    assert_eq!(SpadConfig::from_page(&page), spad);
}

#[test]
fn test_spad_validate_rejects_oversize() {
    let spad = SpadConfig {
        xsize: 19,
        ..SpadConfig::default()
    };
    assert!(matches!(spad.validate(), Err(TofError::InvalidInput(_))));
    let mut map = SpadConfig::default();
    map.spad_map[5] = 0x10;
    assert!(map.to_page(PAGE_ID_SPAD_2).is_err());
}

#[test]
fn test_spad_grid_format() {
    let spad = SpadConfig {
        xsize: 3,
        ysize: 2,
        ..SpadConfig::default()
    };
    assert_eq!(spad.format_grid(&[1, 2, 3, 4, 5, 6]), "1 2 3 \n4 5 6 \n");
}

#[test]
fn test_parse_c_int_forms() {
    assert_eq!(parse_c_int("42").unwrap(), 42);
    assert_eq!(parse_c_int(" -7\n").unwrap(), -7);
    assert_eq!(parse_c_int("0x2A").unwrap(), 42);
    assert_eq!(parse_c_int("052").unwrap(), 42);
    assert_eq!(parse_c_int("0").unwrap(), 0);
    assert_eq!(parse_c_int("+0x10").unwrap(), 16);
    assert!(parse_c_int("").is_err());
    assert!(parse_c_int("0x").is_err());
    assert!(parse_c_int("09").is_err());
    assert!(parse_c_int("12abc").is_err());
    assert!(parse_c_int("--1").is_err());
}

#[test]
fn test_parse_field_width() {
    assert_eq!(parse_field::<u8>("gpio_0", "255").unwrap(), 255);
    assert!(matches!(parse_field::<u8>("gpio_0", "256"), Err(TofError::InvalidInput(_))));
    assert!(matches!(parse_field::<u16>("low_threshold", "-1"), Err(TofError::InvalidInput(_))));
    assert_eq!(parse_field::<i8>("xoff_q1_0", "-128").unwrap(), -128);
    assert!(parse_field::<i8>("xoff_q1_0", "128").is_err());
}

#[test]
fn test_parse_spad_values() {
    let values = parse_spad_values("1 0 x 1\n0x1 junk 01\t1").unwrap();
    assert_eq!(values.len(), MAX_SPAD_SIZE);
    assert_eq!(&values[..6], &[1, 0, 1, 1, 1, 1]);
    assert!(values[6..].iter().all(|&v| v == 0));

    assert!(matches!(parse_spad_values("1 2 300"), Err(TofError::InvalidInput(_))));

    let long = vec!["2"; MAX_SPAD_SIZE + 5].join(" ");
    assert_eq!(parse_spad_values(&long).unwrap(), vec![2; MAX_SPAD_SIZE]);
    // entries past the limit are never looked at
    let tail = format!("{} 999", vec!["1"; MAX_SPAD_SIZE].join(" "));
    assert!(parse_spad_values(&tail).is_ok());
}

#[test]
fn test_parse_register_write() {
    assert_eq!(parse_register_write("0xe0:0x01").unwrap(), (0xE0, 0x01, None));
    assert_eq!(parse_register_write("0xe0:0x41:0x01\n").unwrap(), (0xE0, 0x41, Some(0x01)));
    assert!(parse_register_write("0xe0").is_err());
    assert!(parse_register_write("0x100:1").is_err());
    assert!(parse_register_write("1:2:3:4").is_err());
}

#[test]
fn test_parse_mode() {
    assert_eq!(parse_mode("0x80").unwrap(), Mode::Bootloader);
    assert_eq!(parse_mode("3").unwrap(), Mode::Application);
    assert!(matches!(parse_mode("0x42"), Err(TofError::InvalidInput(_))));
}

#[test]
fn test_format_registers() {
    let regs: Vec<u8> = (0..8).collect();
    assert_eq!(format_registers(&regs), "0x00: 00 01 02 03\n0x04: 04 05 06 07\n");
}

#[test]
fn test_attribute_names() {
    assert_eq!(TofAttribute::ALL.len(), 42);
    for attr in TofAttribute::ALL {
        assert_eq!(TofAttribute::from_name(&attr.to_string()), Some(attr));
    }
    assert_eq!(TofAttribute::from_name("xoff_q1_1"), Some(TofAttribute::XoffQ1_1));
    assert_eq!(TofAttribute::from_name("nope"), None);
    assert!(!TofAttribute::RegisterWrite.is_readable());
    assert!(!TofAttribute::Registers.is_writable());
}

#[test]
fn test_events_for_results() {
    let events = events_for(&Message::MeasResults(sample_results()));
    assert_eq!(
        events,
        vec![
            InputEvent::Abs {
                code: 1,
                value: 0x00FF_0200,
            },
            InputEvent::Abs {
                code: 9,
                value: 0x010C_0FA0,
            },
            InputEvent::Sync,
        ]
    );
    assert!(events_for(&Message::overflow()).is_empty());
}
