// Register map and protocol constants for the TMF882x family

/// Default 7-bit I2C address of the sensor
pub const DEFAULT_I2C_ADDR: u16 = 0x41;

// --- Registers shared by bootloader and application ---

/// Running application id (see `APPID_*`)
pub const REG_APPID: u8 = 0x00;
/// Command / status register; bootloader frames also start here
pub const REG_CMD_STAT: u8 = 0x08;
/// Start of the currently loaded config page or result page
pub const REG_PAGE: u8 = 0x20;
/// Enable register (`EnableReg`)
pub const REG_ENABLE: u8 = 0xE0;
/// Interrupt status, write-1-to-clear (`IntStatus`)
pub const REG_INT_STATUS: u8 = 0xE1;
/// Interrupt enable
pub const REG_INT_ENAB: u8 = 0xE2;
/// Chip id
pub const REG_ID: u8 = 0xE3;
/// Chip revision
pub const REG_REVID: u8 = 0xE4;
/// Reset control; `RESET_TO_BOOTLOADER` restarts the CPU in the bootloader
pub const REG_RESET: u8 = 0xF0;

// --- Application-only registers ---

/// Application version, 4 bytes: major, minor, patch, build
pub const REG_APP_VERSION: u8 = 0x01;
/// Application state flags (`APP_FLAG_*`)
pub const REG_APP_FLAGS: u8 = 0x1C;
/// Oscillator trim frequency, u16 little endian
pub const REG_OSC_TRIM_FREQ: u8 = 0x1E;
/// Device serial number, 4 bytes
pub const REG_SERIAL: u8 = 0x18;

pub const APPID_BOOTLOADER: u8 = 0x80;
pub const APPID_MEASUREMENT: u8 = 0x03;

pub const APP_FLAG_MEASURING: u8 = 0x01;
pub const APP_FLAG_SHORT_RANGE: u8 = 0x02;
pub const APP_FLAG_8X8: u8 = 0x04;
pub const APP_FLAG_CLK_CORR: u8 = 0x08;

pub const RESET_TO_BOOTLOADER: u8 = 0x80;

// --- Application commands, written to REG_CMD_STAT ---

pub const CMD_MEASURE: u8 = 0x10;
pub const CMD_WRITE_CONFIG_PAGE: u8 = 0x15;
pub const CMD_LOAD_CONFIG_PAGE_COMMON: u8 = 0x16;
pub const CMD_LOAD_CONFIG_PAGE_SPAD_1: u8 = 0x17;
pub const CMD_LOAD_CONFIG_PAGE_SPAD_2: u8 = 0x18;
pub const CMD_LOAD_CONFIG_PAGE_FACTORY_CALIB: u8 = 0x19;
pub const CMD_FACTORY_CALIBRATION: u8 = 0x20;
pub const CMD_CLK_CORR_ON: u8 = 0x29;
pub const CMD_CLK_CORR_OFF: u8 = 0x2A;
pub const CMD_SWITCH_8X8_MODE: u8 = 0x65;
pub const CMD_SWITCH_3X3_MODE: u8 = 0x66;
pub const CMD_SHORT_RANGE: u8 = 0x6E;
pub const CMD_LONG_RANGE: u8 = 0x6F;
pub const CMD_STOP: u8 = 0xFF;

pub const STAT_OK: u8 = 0x00;
pub const STAT_ACCEPTED: u8 = 0x01;
/// Status values from here up are the pending command itself, not a result
pub const STAT_PENDING_MIN: u8 = 0x10;
/// Generic command rejection
pub const STAT_ERR_REJECTED: u8 = 0x02;
/// Unknown command
pub const STAT_ERR_UNKNOWN_CMD: u8 = 0x03;
/// Bootloader frame checksum mismatch
pub const STAT_ERR_CHECKSUM: u8 = 0x04;

// --- Page ids echoed at REG_PAGE ---

pub const PAGE_ID_RESULTS: u8 = 0x10;
pub const PAGE_ID_COMMON: u8 = CMD_LOAD_CONFIG_PAGE_COMMON;
pub const PAGE_ID_SPAD_1: u8 = CMD_LOAD_CONFIG_PAGE_SPAD_1;
pub const PAGE_ID_SPAD_2: u8 = CMD_LOAD_CONFIG_PAGE_SPAD_2;
pub const PAGE_ID_FACTORY_CALIB: u8 = CMD_LOAD_CONFIG_PAGE_FACTORY_CALIB;

// --- Bootloader protocol ---

pub const BL_CMD_RAMREMAP_RESET: u8 = 0x11;
pub const BL_CMD_DOWNLOAD_INIT: u8 = 0x14;
pub const BL_CMD_W_RAM: u8 = 0x41;
pub const BL_CMD_ADDR_RAM: u8 = 0x43;

/// Seed byte sent with DOWNLOAD_INIT
pub const BL_DOWNLOAD_INIT_SEED: u8 = 0x29;
/// Largest W_RAM payload
pub const BL_MAX_DATA: usize = 128;
pub const BL_STAT_READY: u8 = 0x00;

// --- Sizes ---

/// Header of every framed output message (id + length)
pub const MSG_HEADER_SIZE: usize = 4;
/// Largest framed output message
pub const MAX_MSG_SIZE: usize = 1024;
/// Default output queue capacity (four 4 KiB pages)
pub const DEFAULT_QUEUE_CAPACITY: usize = 4 * 4096;

/// Largest calibration blob, fills the page up to REG_ENABLE
pub const MAX_CALIB_SIZE: usize = 188;
/// SPAD array bounds per map
pub const MAX_SPAD_XSIZE: u8 = 18;
pub const MAX_SPAD_YSIZE: u8 = 10;
pub const MAX_SPAD_SIZE: usize = MAX_SPAD_XSIZE as usize * MAX_SPAD_YSIZE as usize;
/// Result entries in the device result page
pub const MAX_MEAS_RESULTS: usize = 36;
/// Register file size read by a full register dump
pub const MAX_REGS: usize = 256;

/// Highest SPAD channel id a map entry may reference
pub const MAX_SPAD_CHANNEL: u8 = 9;
/// Zone mask bits in use
pub const ZONE_MASK_BITS: u32 = 18;

// --- Config field values ---

/// `power_cfg` bit allowing the oscillator to be re-trimmed
pub const POWER_CFG_ALLOW_OSC_RETRIM: u8 = 0x20;
/// SPAD map used for time-multiplexed 8x8 operation
pub const SPAD_MAP_ID_USER_DEFINED_2: u8 = 15;
pub const SPAD_MAP_ID_MAX: u8 = 15;

// --- Timing ---

/// Bound on fetching and downloading one RAM-patch candidate
pub const TOF_FWDL_TIMEOUT_MSEC: u64 = 5000;
/// Polls of REG_CMD_STAT before a command is declared stuck
pub const CMD_POLL_BUDGET: u32 = 100;
/// Delay between REG_CMD_STAT polls
pub const CMD_POLL_INTERVAL_US: u64 = 100;
/// Poll period unit of the polled producer
pub const POLL_PERIOD_UNIT_US: u64 = 100;
/// Poll period for attaches without an interrupt line (10 ms)
pub const DEFAULT_POLL_PERIOD: u32 = 100;
