//! Register-level protocol of the TMF882x.
//!
//! [`Tmf882x`] speaks to the chip through a [`Transport`]: power-on handshake,
//! mode detection, bootloader frames used for RAM-patch download, application
//! commands, config page load/write and result page readout. It keeps no state
//! beyond what it needs to address the device; the driver state above it owns
//! the cached configuration.

use modular_bitfield::prelude::*;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info, trace, warn};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{AppConfig, ConfigPageRaw, CONFIG_PAGE_SIZE};
use crate::constants::*;
use crate::error::{Result, TofError};
use crate::firmware::FirmwareImage;
use crate::message::{ErrorCode, MeasResult, MeasResults, Message};
use crate::spad::{SPAD_PAGE_SIZE, SpadConfig, SpadPageRaw};
use crate::transport::Transport;

/// Which program the chip CPU is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Mode {
    #[strum(serialize = "unknown")]
    Unknown,
    #[strum(serialize = "bootloader")]
    Bootloader,
    #[strum(serialize = "application")]
    Application,
}

impl Mode {
    pub fn from_appid(appid: u8) -> Self {
        match appid {
            APPID_BOOTLOADER => Mode::Bootloader,
            APPID_MEASUREMENT => Mode::Application,
            _ => Mode::Unknown,
        }
    }

    /// APPID value the chip reports in this mode. Also the numeric form used by
    /// the `mode` attribute.
    pub fn appid(self) -> Option<u8> {
        match self {
            Mode::Bootloader => Some(APPID_BOOTLOADER),
            Mode::Application => Some(APPID_MEASUREMENT),
            Mode::Unknown => None,
        }
    }
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnableReg {
    pub pon: bool,
    #[skip]
    unused: B5,
    pub cpu_ready: bool,
    #[skip]
    unused2: bool,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntStatus {
    #[skip]
    unused: bool,
    pub results: bool,
    pub histogram: bool,
    pub error: bool,
    #[skip]
    unused2: B4,
}

impl IntStatus {
    pub fn from_byte(value: u8) -> Self {
        Self::from_bytes([value])
    }

    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }
}

/// Interrupts the driver enables while in application mode.
pub fn default_int_enable() -> u8 {
    IntStatus::new().with_results(true).with_error(true).to_byte()
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ResultEntryRaw {
    /// Low nibble channel, high nibble sub-capture
    pub channel_subcap: u8,
    pub confidence: u8,
    pub distance_mm: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ResultPageRaw {
    pub page_id: u8,
    pub result_number: u8,
    pub temperature: i8,
    pub number_valid_results: u8,
    pub ambient_light: U32,
    pub photon_count: U32,
    pub reference_count: U32,
    pub sys_tick: U32,
    pub results: [ResultEntryRaw; MAX_MEAS_RESULTS],
}

impl ResultPageRaw {
    pub fn to_results(&self) -> MeasResults {
        let count = (self.number_valid_results as usize).min(MAX_MEAS_RESULTS);
        MeasResults {
            result_num: self.result_number,
            temperature_c: self.temperature,
            ambient_light: self.ambient_light.get(),
            photon_count: self.photon_count.get(),
            ref_photon_count: self.reference_count.get(),
            sys_tick: self.sys_tick.get(),
            results: self.results[..count]
                .iter()
                .map(|r| MeasResult {
                    channel: r.channel_subcap & 0x0F,
                    sub_capture: r.channel_subcap >> 4,
                    confidence: r.confidence,
                    distance_mm: r.distance_mm.get(),
                })
                .collect(),
        }
    }

    pub fn from_results(meas: &MeasResults) -> Self {
        let mut page = Self::new_zeroed();
        page.page_id = PAGE_ID_RESULTS;
        page.result_number = meas.result_num;
        page.temperature = meas.temperature_c;
        page.ambient_light = U32::new(meas.ambient_light);
        page.photon_count = U32::new(meas.photon_count);
        page.reference_count = U32::new(meas.ref_photon_count);
        page.sys_tick = U32::new(meas.sys_tick);
        let count = meas.results.len().min(MAX_MEAS_RESULTS);
        page.number_valid_results = count as u8;
        for (slot, r) in page.results.iter_mut().zip(&meas.results[..count]) {
            *slot = ResultEntryRaw {
                channel_subcap: (r.channel & 0x0F) | (r.sub_capture << 4),
                confidence: r.confidence,
                distance_mm: U16::new(r.distance_mm),
            };
        }
        page
    }
}

pub const RESULT_PAGE_SIZE: usize = size_of::<ResultPageRaw>();

/// Calibration page header; the blob follows at `REG_PAGE + 4`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CalibPageHeader {
    pub page_id: u8,
    pub calib_len: u8,
    pub reserved: [u8; 2],
}

pub const CALIB_DATA_REG: u8 = REG_PAGE + size_of::<CalibPageHeader>() as u8;

/// Raw identity registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRevision {
    pub id: u8,
    pub revision: u8,
}

/// Upper bound on status passes per interrupt service.
const MAX_IRQ_PASSES: usize = 8;

/// One TMF882x on a transport.
pub struct Tmf882x<T> {
    transport: T,
    mode: Mode,
    open: bool,
    debug_level: u8,
    poll_budget: u32,
}

impl<T: Transport> Tmf882x<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            mode: Mode::Unknown,
            open: false,
            debug_level: 0,
            poll_budget: CMD_POLL_BUDGET,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Mode as of the last open, switch or detection.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn debug_level(&self) -> u8 {
        self.debug_level
    }

    pub fn set_debug_level(&mut self, level: u8) {
        self.debug_level = level;
    }

    pub fn set_poll_budget(&mut self, polls: u32) {
        self.poll_budget = polls.max(1);
    }

    pub async fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<()> {
        self.transport.read(register, buf).await?;
        trace!(register, data = %hex::encode(&*buf), "i2c read");
        Ok(())
    }

    pub async fn read_reg(&mut self, register: u8) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(register, &mut buf).await?;
        Ok(buf[0])
    }

    pub async fn write(&mut self, register: u8, data: &[u8]) -> Result<()> {
        if let Err(e) = self.transport.write(register, data).await {
            warn!(register, len = data.len(), error = %e, "i2c write failed");
            return Err(e.into());
        }
        if self.debug_level > 2 {
            info!(register = format_args!("{:#04x}", register), data = %hex::encode(data), "i2c write");
        }
        Ok(())
    }

    pub async fn write_reg(&mut self, register: u8, value: u8) -> Result<()> {
        self.write(register, &[value]).await
    }

    /// Read-modify-write of the bits selected by `mask`.
    pub async fn write_masked(&mut self, register: u8, value: u8, mask: u8) -> Result<()> {
        let current = self.read_reg(register).await?;
        self.write_reg(register, (current & !mask) | (value & mask)).await
    }

    /// The whole register file.
    pub async fn dump_registers(&mut self) -> Result<Vec<u8>> {
        let mut regs = vec![0u8; MAX_REGS];
        self.read(0x00, &mut regs).await?;
        Ok(regs)
    }

    /// Power the CPU on and find out what it is running.
    pub async fn open(&mut self) -> Result<Mode> {
        let enable = EnableReg::from_bytes([self.read_reg(REG_ENABLE).await?]);
        if !enable.pon() {
            self.write_reg(REG_ENABLE, enable.with_pon(true).into_bytes()[0]).await?;
        }
        self.wait_cpu_ready().await?;
        self.open = true;
        let mode = self.detect_mode().await?;
        debug!(%mode, "Device opened");
        Ok(mode)
    }

    /// Put the CPU in standby. RAM contents survive.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.mode = Mode::Unknown;
        let enable = EnableReg::from_bytes([self.read_reg(REG_ENABLE).await?]);
        self.write_reg(REG_ENABLE, enable.with_pon(false).into_bytes()[0]).await
    }

    /// Forget everything about the device without touching it.
    pub fn invalidate(&mut self) {
        self.open = false;
        self.mode = Mode::Unknown;
    }

    pub async fn detect_mode(&mut self) -> Result<Mode> {
        let appid = self.read_reg(REG_APPID).await?;
        self.mode = Mode::from_appid(appid);
        if self.mode == Mode::Unknown {
            warn!(appid = format_args!("{:#04x}", appid), "Unrecognized application id");
        }
        Ok(self.mode)
    }

    async fn wait_cpu_ready(&mut self) -> Result<()> {
        for _ in 0..self.poll_budget {
            let enable = EnableReg::from_bytes([self.read_reg(REG_ENABLE).await?]);
            if enable.cpu_ready() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_micros(CMD_POLL_INTERVAL_US)).await;
        }
        Err(TofError::Timeout("CPU ready"))
    }

    fn ensure_mode(&self, expected: Mode) -> Result<()> {
        if self.mode != expected {
            return Err(TofError::State {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }

    /// Switch between bootloader and application. A switch to the current mode
    /// touches nothing.
    ///
    /// Entering the application from the bootloader starts whatever image the
    /// bootloader holds (a fresh RAM patch or the ROM application).
    pub async fn mode_switch(&mut self, target: Mode) -> Result<()> {
        if !self.open {
            self.open().await?;
        }
        if self.mode == target {
            return Ok(());
        }
        info!(from = %self.mode, to = %target, "Switching device mode");
        match target {
            Mode::Bootloader => {
                self.write_reg(REG_RESET, RESET_TO_BOOTLOADER).await?;
                self.wait_cpu_ready().await?;
            }
            Mode::Application => {
                if self.mode != Mode::Bootloader {
                    return Err(TofError::State {
                        expected: Mode::Bootloader,
                        actual: self.mode,
                    });
                }
                self.bl_command(BL_CMD_RAMREMAP_RESET, &[]).await?;
                self.wait_cpu_ready().await?;
            }
            Mode::Unknown => return Err(TofError::InvalidArgument("cannot switch to unknown mode".to_string())),
        }
        let reached = self.detect_mode().await?;
        if reached != target {
            return Err(TofError::State {
                expected: target,
                actual: reached,
            });
        }
        Ok(())
    }

    /// Send one bootloader frame and check its status.
    pub async fn bl_command(&mut self, command: u8, data: &[u8]) -> Result<()> {
        if data.len() > BL_MAX_DATA {
            return Err(TofError::InvalidArgument(format!(
                "bootloader payload of {} bytes exceeds {}",
                data.len(),
                BL_MAX_DATA
            )));
        }
        let mut frame = Vec::with_capacity(data.len() + 3);
        frame.push(command);
        frame.push(data.len() as u8);
        frame.extend_from_slice(data);
        frame.push(bl_checksum(&frame));
        self.write(REG_CMD_STAT, &frame).await?;

        let mut status = [0u8; 3];
        self.read(REG_CMD_STAT, &mut status).await?;
        if status[0] != BL_STAT_READY {
            return Err(TofError::Command {
                command,
                status: status[0],
            });
        }
        Ok(())
    }

    /// Stream `image` into RAM and start it. The chip must be in the bootloader.
    pub async fn download(&mut self, image: &FirmwareImage) -> Result<()> {
        self.ensure_mode(Mode::Bootloader)?;
        if image.is_empty() {
            return Err(TofError::InvalidInput("firmware image has no data".to_string()));
        }
        self.bl_command(BL_CMD_DOWNLOAD_INIT, &[BL_DOWNLOAD_INIT_SEED]).await?;
        for segment in image.segments() {
            let address = u16::try_from(segment.address).map_err(|_| {
                TofError::InvalidInput(format!("segment address {:#x} outside RAM", segment.address))
            })?;
            self.bl_command(BL_CMD_ADDR_RAM, &address.to_le_bytes()).await?;
            for chunk in segment.data.chunks(BL_MAX_DATA) {
                self.bl_command(BL_CMD_W_RAM, chunk).await?;
            }
        }
        debug!(bytes = image.len(), segments = image.segments().len(), "RAM patch written");
        self.bl_command(BL_CMD_RAMREMAP_RESET, &[]).await?;
        self.wait_cpu_ready().await?;
        match self.detect_mode().await? {
            Mode::Application => Ok(()),
            actual => Err(TofError::State {
                expected: Mode::Application,
                actual,
            }),
        }
    }

    /// Issue an application command and wait for its status.
    pub async fn command(&mut self, command: u8) -> Result<()> {
        self.ensure_mode(Mode::Application)?;
        self.write_reg(REG_CMD_STAT, command).await?;
        for _ in 0..self.poll_budget {
            match self.read_reg(REG_CMD_STAT).await? {
                STAT_OK | STAT_ACCEPTED => return Ok(()),
                s if s >= STAT_PENDING_MIN => {
                    tokio::time::sleep(Duration::from_micros(CMD_POLL_INTERVAL_US)).await;
                }
                status => return Err(TofError::Command { command, status }),
            }
        }
        Err(TofError::Timeout("command completion"))
    }

    async fn load_page(&mut self, command: u8) -> Result<()> {
        self.command(command).await?;
        let page_id = self.read_reg(REG_PAGE).await?;
        if page_id != command {
            return Err(TofError::Format(format!(
                "expected config page {:#04x}, device shows {:#04x}",
                command, page_id
            )));
        }
        Ok(())
    }

    pub async fn read_config(&mut self) -> Result<AppConfig> {
        self.load_page(CMD_LOAD_CONFIG_PAGE_COMMON).await?;
        let mut raw = [0u8; CONFIG_PAGE_SIZE];
        self.read(REG_PAGE, &mut raw).await?;
        let page = ConfigPageRaw::read_from_bytes(&raw)
            .map_err(|_| TofError::Format("config page".to_string()))?;
        Ok(AppConfig::from_page(&page))
    }

    pub async fn write_config(&mut self, config: &AppConfig) -> Result<()> {
        self.load_page(CMD_LOAD_CONFIG_PAGE_COMMON).await?;
        let page = config.to_page();
        // page id stays as loaded
        self.write(REG_PAGE + 4, &page.as_bytes()[4..]).await?;
        self.command(CMD_WRITE_CONFIG_PAGE).await
    }

    pub async fn read_spad_config(&mut self, index: usize) -> Result<SpadConfig> {
        self.load_page(spad_page_command(index)?).await?;
        let mut raw = [0u8; SPAD_PAGE_SIZE];
        self.read(REG_PAGE, &mut raw).await?;
        let page = SpadPageRaw::read_from_bytes(&raw)
            .map_err(|_| TofError::Format("SPAD page".to_string()))?;
        Ok(SpadConfig::from_page(&page))
    }

    pub async fn write_spad_config(&mut self, index: usize, spad: &SpadConfig) -> Result<()> {
        let command = spad_page_command(index)?;
        let page = spad.to_page(command)?;
        self.load_page(command).await?;
        self.write(REG_PAGE + 2, &page.as_bytes()[2..]).await?;
        self.command(CMD_WRITE_CONFIG_PAGE).await
    }

    /// The calibration blob currently held by the application.
    pub async fn read_calibration(&mut self) -> Result<Vec<u8>> {
        self.load_page(CMD_LOAD_CONFIG_PAGE_FACTORY_CALIB).await?;
        let mut raw = [0u8; size_of::<CalibPageHeader>()];
        self.read(REG_PAGE, &mut raw).await?;
        let header = CalibPageHeader::read_from_bytes(&raw)
            .map_err(|_| TofError::Format("calibration page".to_string()))?;
        let len = (header.calib_len as usize).min(MAX_CALIB_SIZE);
        let mut data = vec![0u8; len];
        if len > 0 {
            self.read(CALIB_DATA_REG, &mut data).await?;
        }
        Ok(data)
    }

    pub async fn write_calibration(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_CALIB_SIZE {
            return Err(TofError::InvalidInput(format!(
                "calibration blob of {} bytes exceeds {}",
                data.len(),
                MAX_CALIB_SIZE
            )));
        }
        self.load_page(CMD_LOAD_CONFIG_PAGE_FACTORY_CALIB).await?;
        self.write(REG_PAGE + 1, &[data.len() as u8]).await?;
        if !data.is_empty() {
            self.write(CALIB_DATA_REG, data).await?;
        }
        self.command(CMD_WRITE_CONFIG_PAGE).await
    }

    /// Run factory calibration and return the blob it produced.
    pub async fn factory_calibrate(&mut self) -> Result<Vec<u8>> {
        info!("Running factory calibration");
        self.command(CMD_FACTORY_CALIBRATION).await?;
        self.read_calibration().await
    }

    pub async fn app_flags(&mut self) -> Result<u8> {
        self.ensure_mode(Mode::Application)?;
        self.read_reg(REG_APP_FLAGS).await
    }

    pub async fn is_measuring(&mut self) -> Result<bool> {
        Ok(self.app_flags().await? & APP_FLAG_MEASURING != 0)
    }

    pub async fn start_measurements(&mut self) -> Result<()> {
        self.write_reg(REG_INT_ENAB, default_int_enable()).await?;
        self.command(CMD_MEASURE).await
    }

    pub async fn stop_measurements(&mut self) -> Result<()> {
        self.command(CMD_STOP).await
    }

    pub async fn set_8x8(&mut self, enabled: bool) -> Result<()> {
        self.command(if enabled { CMD_SWITCH_8X8_MODE } else { CMD_SWITCH_3X3_MODE }).await
    }

    pub async fn set_short_range(&mut self, enabled: bool) -> Result<()> {
        self.command(if enabled { CMD_SHORT_RANGE } else { CMD_LONG_RANGE }).await
    }

    pub async fn set_clock_correction(&mut self, enabled: bool) -> Result<()> {
        self.command(if enabled { CMD_CLK_CORR_ON } else { CMD_CLK_CORR_OFF }).await
    }

    pub async fn osc_trim_freq(&mut self) -> Result<u16> {
        self.ensure_mode(Mode::Application)?;
        let mut raw = [0u8; 2];
        self.read(REG_OSC_TRIM_FREQ, &mut raw).await?;
        Ok(u16::from_le_bytes(raw))
    }

    pub async fn set_osc_trim_freq(&mut self, freq: u16) -> Result<()> {
        self.ensure_mode(Mode::Application)?;
        self.write(REG_OSC_TRIM_FREQ, &freq.to_le_bytes()).await
    }

    /// Application version as `major.minor.patch.build`.
    pub async fn firmware_version(&mut self) -> Result<[u8; 4]> {
        self.ensure_mode(Mode::Application)?;
        let mut version = [0u8; 4];
        self.read(REG_APP_VERSION, &mut version).await?;
        Ok(version)
    }

    pub async fn device_revision(&mut self) -> Result<DeviceRevision> {
        let mut raw = [0u8; 2];
        self.read(REG_ID, &mut raw).await?;
        Ok(DeviceRevision {
            id: raw[0] & 0x3F,
            revision: raw[1] & 0x07,
        })
    }

    pub async fn device_uid(&mut self) -> Result<[u8; 4]> {
        self.ensure_mode(Mode::Application)?;
        let mut uid = [0u8; 4];
        self.read(REG_SERIAL, &mut uid).await?;
        Ok(uid)
    }

    /// Service pending interrupts and return the messages they carried.
    ///
    /// Outside application mode there is nothing to drain.
    pub async fn process_irq(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        if !self.open || self.mode != Mode::Application {
            return Ok(messages);
        }
        for _ in 0..MAX_IRQ_PASSES {
            let status = IntStatus::from_byte(self.read_reg(REG_INT_STATUS).await?);
            if status.to_byte() == 0 {
                break;
            }
            if status.results() {
                let mut raw = [0u8; RESULT_PAGE_SIZE];
                self.read(REG_PAGE, &mut raw).await?;
                match ResultPageRaw::read_from_bytes(&raw) {
                    Ok(page) if page.page_id == PAGE_ID_RESULTS => {
                        messages.push(Message::MeasResults(page.to_results()));
                    }
                    _ => warn!(page_id = raw[0], "Result interrupt without a result page"),
                }
            }
            if status.error() {
                messages.push(Message::Error(ErrorCode::Measurement));
            }
            self.write_reg(REG_INT_STATUS, status.to_byte()).await?;
        }
        Ok(messages)
    }
}

fn spad_page_command(index: usize) -> Result<u8> {
    match index {
        0 => Ok(CMD_LOAD_CONFIG_PAGE_SPAD_1),
        1 => Ok(CMD_LOAD_CONFIG_PAGE_SPAD_2),
        _ => Err(TofError::InvalidArgument(format!("no SPAD map {}", index))),
    }
}

/// Ones' complement of the byte sum, closing every bootloader frame.
pub fn bl_checksum(frame: &[u8]) -> u8 {
    !frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}
