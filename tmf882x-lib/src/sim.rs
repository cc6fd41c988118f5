//! In-memory TMF882x register model.
//!
//! [`SimulatedTmf882x`] answers the same register protocol as the real chip:
//! bootloader frames, RAM patch download, application commands, config pages,
//! result pages and write-1-to-clear interrupt status. Handles obtained from it
//! ([`SimEnable`], [`SimInterrupt`]) drive the enable and interrupt lines of the
//! same simulated chip, so one instance stands in for the whole board.
//!
//! Failure injection hooks let tests NACK the bus, reject commands, stall
//! command completion and slow down downloads.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};
use zerocopy::{FromBytes, IntoBytes};

use crate::chip::{CalibPageHeader, EnableReg, IntStatus, Mode, ResultPageRaw, bl_checksum};
use crate::config::{AppConfig, CONFIG_PAGE_SIZE, ConfigPageRaw};
use crate::constants::*;
use crate::error::TransportError;
use crate::message::{MeasResult, MeasResults};
use crate::spad::{SPAD_MAP_COUNT, SPAD_PAGE_SIZE, SpadConfig, SpadPageRaw};
use crate::transport::{EnableLine, FirmwareSource, InterruptLine, Transport};

/// Application version reported once a RAM patch runs.
pub const SIM_APP_VERSION: [u8; 4] = [4, 2, 3, 7];
pub const SIM_SERIAL: [u8; 4] = [0x12, 0x34, 0x56, 0x78];
pub const SIM_CHIP_ID: u8 = 0x08;
pub const SIM_REVISION: u8 = 0x01;
/// Size of the blob factory calibration produces.
pub const SIM_FACTORY_CALIB_LEN: usize = 144;

/// Activity observed by the simulated chip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCounters {
    /// Resets into the bootloader plus starts of the application
    pub mode_switches: u32,
    /// RAM patches that were started
    pub downloads: u32,
    pub ram_bytes_written: usize,
    /// Application commands in the order received
    pub commands: Vec<u8>,
    pub config_writes: u32,
    pub enable_toggles: u32,
}

#[derive(Debug, Clone, Copy)]
struct Download {
    address: u16,
    bytes: usize,
}

struct SimState {
    powered: bool,
    regs: [u8; MAX_REGS],
    running: Mode,
    ram_valid: bool,
    rom_app: bool,
    download: Option<Download>,
    loaded_page: Option<u8>,
    config: [u8; CONFIG_PAGE_SIZE],
    spad_pages: [[u8; SPAD_PAGE_SIZE]; SPAD_MAP_COUNT],
    calibration: Vec<u8>,
    flags: u8,
    pending_results: VecDeque<MeasResults>,
    result_number: u8,
    command_latency: u32,
    pending_command: Option<(u8, u32)>,
    rejected_commands: HashSet<u8>,
    failing_register: Option<u8>,
    nack_all: bool,
    download_delay: Duration,
    counters: SimCounters,
}

impl SimState {
    fn new() -> Self {
        let mut state = Self {
            powered: true,
            regs: [0; MAX_REGS],
            running: Mode::Bootloader,
            ram_valid: false,
            rom_app: false,
            download: None,
            loaded_page: None,
            config: [0; CONFIG_PAGE_SIZE],
            spad_pages: [[0; SPAD_PAGE_SIZE]; SPAD_MAP_COUNT],
            calibration: Vec::new(),
            flags: 0,
            pending_results: VecDeque::new(),
            result_number: 0,
            command_latency: 0,
            pending_command: None,
            rejected_commands: HashSet::new(),
            failing_register: None,
            nack_all: false,
            download_delay: Duration::ZERO,
            counters: SimCounters::default(),
        };
        state.config.copy_from_slice(AppConfig::default().to_page().as_bytes());
        state.load_spad_presets(AppConfig::default().spad_map_id);
        state.power_up();
        state
    }

    /// Cold boot: bootloader, CPU off, RAM empty.
    fn power_up(&mut self) {
        self.regs = [0; MAX_REGS];
        self.regs[REG_ID as usize] = SIM_CHIP_ID;
        self.regs[REG_REVID as usize] = SIM_REVISION;
        self.running = Mode::Bootloader;
        self.ram_valid = false;
        self.download = None;
        self.loaded_page = None;
        self.flags = 0;
        self.pending_results.clear();
        self.pending_command = None;
    }

    fn cpu_ready(&self) -> bool {
        EnableReg::from_bytes([self.regs[REG_ENABLE as usize]]).cpu_ready()
    }

    fn load_spad_presets(&mut self, map_id: u8) {
        for (index, page) in self.spad_pages.iter_mut().enumerate() {
            let preset = SpadConfig {
                xoff_q1: map_id as i8,
                yoff_q1: index as i8,
                xsize: MAX_SPAD_XSIZE,
                ysize: MAX_SPAD_YSIZE,
                spad_mask: vec![1; MAX_SPAD_SIZE],
                spad_map: (0..MAX_SPAD_SIZE).map(|i| (i % MAX_SPAD_CHANNEL as usize) as u8 + 1).collect(),
            };
            let page_id = if index == 0 { PAGE_ID_SPAD_1 } else { PAGE_ID_SPAD_2 };
            if let Ok(raw) = preset.to_page(page_id) {
                page.copy_from_slice(raw.as_bytes());
            }
        }
    }

    fn check_access(&self, register: u8, len: usize) -> Result<(), TransportError> {
        if !self.powered || self.nack_all {
            return Err(TransportError::Nack { register });
        }
        if register as usize + len > MAX_REGS {
            return Err(TransportError::Bus(format!(
                "burst of {} bytes from {:#04x} runs past the register file",
                len, register
            )));
        }
        Ok(())
    }

    fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        self.check_access(register, buf.len())?;
        let start = register as usize;
        if start <= REG_CMD_STAT as usize && REG_CMD_STAT as usize - start < buf.len() {
            self.tick_pending_command();
        }
        let mut view = self.regs;
        view[REG_APPID as usize] = match (self.cpu_ready(), self.running.appid()) {
            (true, Some(appid)) => appid,
            _ => 0,
        };
        if self.running == Mode::Application {
            view[REG_APP_FLAGS as usize] = self.flags;
        }
        buf.copy_from_slice(&view[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, register: u8, data: &[u8]) -> Result<(), TransportError> {
        self.check_access(register, data.len())?;
        if self.failing_register == Some(register) {
            return Err(TransportError::Nack { register });
        }
        let Some(&first) = data.first() else {
            return Ok(());
        };
        match register {
            REG_ENABLE => {
                let pon = EnableReg::from_bytes([first]).pon();
                self.regs[REG_ENABLE as usize] = EnableReg::new().with_pon(pon).with_cpu_ready(pon).into_bytes()[0];
            }
            REG_INT_STATUS => self.clear_interrupts(first),
            REG_RESET if first & RESET_TO_BOOTLOADER != 0 => {
                debug!("sim: reset into bootloader");
                self.running = Mode::Bootloader;
                self.ram_valid = false;
                self.download = None;
                self.flags = 0;
                self.loaded_page = None;
                self.pending_results.clear();
                self.regs[REG_APP_VERSION as usize..REG_APP_VERSION as usize + 4].fill(0);
                self.counters.mode_switches += 1;
            }
            REG_CMD_STAT if self.cpu_ready() && self.running == Mode::Bootloader => self.bootloader_frame(data),
            REG_CMD_STAT if self.cpu_ready() && self.running == Mode::Application => self.app_command(first),
            _ => {
                let start = register as usize;
                self.regs[start..start + data.len()].copy_from_slice(data);
            }
        }
        Ok(())
    }

    fn set_status(&mut self, status: u8) {
        let at = REG_CMD_STAT as usize;
        self.regs[at] = status;
        self.regs[at + 1] = 0;
        self.regs[at + 2] = !status;
    }

    fn bootloader_frame(&mut self, frame: &[u8]) {
        if frame.len() < 3 || frame.len() != frame[1] as usize + 3 {
            self.set_status(STAT_ERR_REJECTED);
            return;
        }
        let (body, checksum) = frame.split_at(frame.len() - 1);
        if bl_checksum(body) != checksum[0] {
            self.set_status(STAT_ERR_CHECKSUM);
            return;
        }
        let payload = &body[2..];
        let status = match (body[0], self.download.as_mut()) {
            (BL_CMD_DOWNLOAD_INIT, _) => {
                self.download = Some(Download { address: 0, bytes: 0 });
                self.ram_valid = false;
                BL_STAT_READY
            }
            (BL_CMD_ADDR_RAM, Some(download)) if payload.len() == 2 => {
                download.address = u16::from_le_bytes([payload[0], payload[1]]);
                BL_STAT_READY
            }
            (BL_CMD_W_RAM, Some(download)) => {
                download.address = download.address.wrapping_add(payload.len() as u16);
                download.bytes += payload.len();
                self.counters.ram_bytes_written += payload.len();
                BL_STAT_READY
            }
            (BL_CMD_RAMREMAP_RESET, _) => {
                if self.download.take().is_some_and(|d| d.bytes > 0) {
                    self.ram_valid = true;
                    self.counters.downloads += 1;
                }
                if self.ram_valid || self.rom_app {
                    debug!("sim: starting application");
                    self.running = Mode::Application;
                    self.flags = 0;
                    self.loaded_page = None;
                    self.regs[REG_APP_VERSION as usize..REG_APP_VERSION as usize + 4].copy_from_slice(&SIM_APP_VERSION);
                    self.regs[REG_SERIAL as usize..REG_SERIAL as usize + 4].copy_from_slice(&SIM_SERIAL);
                    self.counters.mode_switches += 1;
                    BL_STAT_READY
                } else {
                    STAT_ERR_REJECTED
                }
            }
            (BL_CMD_ADDR_RAM | BL_CMD_W_RAM, None) => STAT_ERR_REJECTED,
            _ => STAT_ERR_UNKNOWN_CMD,
        };
        self.set_status(status);
    }

    fn app_command(&mut self, command: u8) {
        self.counters.commands.push(command);
        if self.command_latency > 0 {
            self.pending_command = Some((command, self.command_latency));
            self.regs[REG_CMD_STAT as usize] = command;
            return;
        }
        let status = self.execute(command);
        self.set_status(status);
    }

    fn tick_pending_command(&mut self) {
        let Some((command, remaining)) = self.pending_command else {
            return;
        };
        if remaining == u32::MAX {
            return;
        }
        if remaining <= 1 {
            self.pending_command = None;
            let status = self.execute(command);
            self.set_status(status);
        } else {
            self.pending_command = Some((command, remaining - 1));
        }
    }

    fn execute(&mut self, command: u8) -> u8 {
        if self.rejected_commands.contains(&command) {
            return STAT_ERR_REJECTED;
        }
        trace!(command, "sim: application command");
        match command {
            CMD_MEASURE => {
                self.flags |= APP_FLAG_MEASURING;
                self.latch_next_result();
            }
            CMD_STOP => {
                self.flags &= !APP_FLAG_MEASURING;
                self.pending_results.clear();
            }
            CMD_LOAD_CONFIG_PAGE_COMMON => {
                let config = self.config;
                self.show_page(command, &config);
            }
            CMD_LOAD_CONFIG_PAGE_SPAD_1 | CMD_LOAD_CONFIG_PAGE_SPAD_2 => {
                let page = self.spad_pages[(command - CMD_LOAD_CONFIG_PAGE_SPAD_1) as usize];
                self.show_page(command, &page);
            }
            CMD_LOAD_CONFIG_PAGE_FACTORY_CALIB => {
                let header = CalibPageHeader {
                    page_id: PAGE_ID_FACTORY_CALIB,
                    calib_len: self.calibration.len() as u8,
                    reserved: [0; 2],
                };
                let mut page = header.as_bytes().to_vec();
                page.extend_from_slice(&self.calibration);
                self.show_page(command, &page);
            }
            CMD_WRITE_CONFIG_PAGE => return self.store_page(),
            CMD_FACTORY_CALIBRATION => {
                self.calibration = (0..SIM_FACTORY_CALIB_LEN).map(|i| (i as u8).wrapping_mul(7).wrapping_add(3)).collect();
            }
            CMD_CLK_CORR_ON => self.flags |= APP_FLAG_CLK_CORR,
            CMD_CLK_CORR_OFF => self.flags &= !APP_FLAG_CLK_CORR,
            CMD_SWITCH_8X8_MODE => self.flags |= APP_FLAG_8X8,
            CMD_SWITCH_3X3_MODE => self.flags &= !APP_FLAG_8X8,
            CMD_SHORT_RANGE => self.flags |= APP_FLAG_SHORT_RANGE,
            CMD_LONG_RANGE => self.flags &= !APP_FLAG_SHORT_RANGE,
            _ => return STAT_ERR_UNKNOWN_CMD,
        }
        STAT_OK
    }

    fn show_page(&mut self, page_id: u8, page: &[u8]) {
        let start = REG_PAGE as usize;
        let end = REG_ENABLE as usize;
        self.regs[start..end].fill(0);
        self.regs[start..start + page.len()].copy_from_slice(page);
        self.regs[start] = page_id;
        self.loaded_page = Some(page_id);
    }

    fn store_page(&mut self) -> u8 {
        let start = REG_PAGE as usize;
        match self.loaded_page {
            Some(CMD_LOAD_CONFIG_PAGE_COMMON) => {
                let Ok(raw) = ConfigPageRaw::read_from_bytes(&self.regs[start..start + CONFIG_PAGE_SIZE]) else {
                    return STAT_ERR_REJECTED;
                };
                let next = AppConfig::from_page(&raw);
                if next.report_period_ms == 0 || next.validate().is_err() {
                    return STAT_ERR_REJECTED;
                }
                let previous = self.stored_config();
                self.config.copy_from_slice(&self.regs[start..start + CONFIG_PAGE_SIZE]);
                if previous.spad_map_id != next.spad_map_id {
                    self.load_spad_presets(next.spad_map_id);
                }
            }
            Some(page_id @ (CMD_LOAD_CONFIG_PAGE_SPAD_1 | CMD_LOAD_CONFIG_PAGE_SPAD_2)) => {
                let Ok(raw) = SpadPageRaw::read_from_bytes(&self.regs[start..start + SPAD_PAGE_SIZE]) else {
                    return STAT_ERR_REJECTED;
                };
                if raw.xsize > MAX_SPAD_XSIZE || raw.ysize > MAX_SPAD_YSIZE {
                    return STAT_ERR_REJECTED;
                }
                self.spad_pages[(page_id - CMD_LOAD_CONFIG_PAGE_SPAD_1) as usize].copy_from_slice(raw.as_bytes());
            }
            Some(CMD_LOAD_CONFIG_PAGE_FACTORY_CALIB) => {
                let len = self.regs[start + 1] as usize;
                if len > MAX_CALIB_SIZE {
                    return STAT_ERR_REJECTED;
                }
                let data = start + size_of::<CalibPageHeader>();
                self.calibration = self.regs[data..data + len].to_vec();
            }
            _ => return STAT_ERR_REJECTED,
        }
        self.counters.config_writes += 1;
        STAT_OK
    }

    fn stored_config(&self) -> AppConfig {
        ConfigPageRaw::read_from_bytes(&self.config)
            .map(|raw| AppConfig::from_page(&raw))
            .unwrap_or_default()
    }

    fn measuring(&self) -> bool {
        self.running == Mode::Application && self.cpu_ready() && self.flags & APP_FLAG_MEASURING != 0
    }

    /// Move the next pending result into the page once the previous one was
    /// acknowledged.
    fn latch_next_result(&mut self) {
        let status = IntStatus::from_byte(self.regs[REG_INT_STATUS as usize]);
        if status.results() {
            return;
        }
        let Some(meas) = self.pending_results.pop_front() else {
            return;
        };
        let page = ResultPageRaw::from_results(&meas);
        let start = REG_PAGE as usize;
        self.regs[start..start + page.as_bytes().len()].copy_from_slice(page.as_bytes());
        self.loaded_page = None;
        self.regs[REG_INT_STATUS as usize] = status.with_results(true).to_byte();
    }

    fn clear_interrupts(&mut self, mask: u8) {
        self.regs[REG_INT_STATUS as usize] &= !mask;
        if IntStatus::from_byte(mask).results() && self.measuring() {
            self.latch_next_result();
        }
    }

    fn interrupt_asserted(&self) -> bool {
        self.regs[REG_INT_STATUS as usize] & self.regs[REG_INT_ENAB as usize] != 0
    }
}

struct SimShared {
    state: Mutex<SimState>,
    irq: Notify,
}

/// A simulated chip. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedTmf882x {
    shared: Arc<SimShared>,
}

impl Default for SimulatedTmf882x {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTmf882x {
    /// A powered chip sitting in the bootloader with no RAM patch.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState::new()),
                irq: Notify::new(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Like `with_state`, then pulses the interrupt line if anything is pending.
    fn mutate<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let (result, asserted) = self.with_state(|s| {
            let result = f(s);
            (result, s.interrupt_asserted())
        });
        if asserted {
            self.shared.irq.notify_one();
        }
        result
    }

    pub fn enable_line(&self) -> SimEnable {
        SimEnable { sim: self.clone() }
    }

    pub fn interrupt_line(&self) -> SimInterrupt {
        SimInterrupt { sim: self.clone() }
    }

    /// Mode the CPU is running, `Unknown` while it is off.
    pub fn mode(&self) -> Mode {
        self.with_state(|s| if s.powered && s.cpu_ready() { s.running } else { Mode::Unknown })
    }

    pub fn is_powered(&self) -> bool {
        self.with_state(|s| s.powered)
    }

    pub fn ram_patch_loaded(&self) -> bool {
        self.with_state(|s| s.ram_valid)
    }

    pub fn is_measuring(&self) -> bool {
        self.with_state(|s| s.measuring())
    }

    pub fn app_flags(&self) -> u8 {
        self.with_state(|s| s.flags)
    }

    pub fn counters(&self) -> SimCounters {
        self.with_state(|s| s.counters.clone())
    }

    /// The configuration the device would measure with.
    pub fn device_config(&self) -> AppConfig {
        self.with_state(|s| s.stored_config())
    }

    pub fn device_spad(&self, index: usize) -> Option<SpadConfig> {
        self.with_state(|s| {
            let page = s.spad_pages.get(index)?;
            SpadPageRaw::read_from_bytes(page).ok().map(|raw| SpadConfig::from_page(&raw))
        })
    }

    pub fn calibration(&self) -> Vec<u8> {
        self.with_state(|s| s.calibration.clone())
    }

    pub fn set_calibration(&self, data: &[u8]) {
        self.with_state(|s| s.calibration = data[..data.len().min(MAX_CALIB_SIZE)].to_vec());
    }

    /// Let the bootloader start an application without a RAM patch.
    pub fn set_rom_app(&self, present: bool) {
        self.with_state(|s| s.rom_app = present);
    }

    pub fn set_nack_all(&self, nack: bool) {
        self.with_state(|s| s.nack_all = nack);
    }

    /// NACK every write starting at `register`.
    pub fn fail_writes_to(&self, register: Option<u8>) {
        self.with_state(|s| s.failing_register = register);
    }

    pub fn reject_command(&self, command: u8) {
        self.with_state(|s| {
            s.rejected_commands.insert(command);
        });
    }

    pub fn clear_rejections(&self) {
        self.with_state(|s| s.rejected_commands.clear());
    }

    /// Status polls before a command completes; `u32::MAX` never completes.
    pub fn set_command_latency(&self, polls: u32) {
        self.with_state(|s| s.command_latency = polls);
    }

    /// Delay applied to every RAM write frame.
    pub fn set_download_delay(&self, delay: Duration) {
        self.with_state(|s| s.download_delay = delay);
    }

    /// Queue a measurement cycle. Ignored unless the chip is measuring.
    pub fn inject_result(&self, meas: MeasResults) -> bool {
        self.mutate(|s| {
            if !s.measuring() {
                return false;
            }
            s.pending_results.push_back(meas);
            s.latch_next_result();
            true
        })
    }

    /// Queue a plausible 3x3 measurement cycle.
    pub fn inject_synthetic_result(&self) -> bool {
        let number = self.with_state(|s| {
            s.result_number = s.result_number.wrapping_add(1);
            s.result_number
        });
        let results = (1..=MAX_SPAD_CHANNEL)
            .map(|channel| MeasResult {
                channel,
                sub_capture: 0,
                confidence: 200 - channel * 10,
                distance_mm: 400 + channel as u16 * 25 + (number as u16 % 16),
            })
            .collect();
        self.inject_result(MeasResults {
            result_num: number,
            temperature_c: 31,
            ambient_light: 1200,
            photon_count: 54_000,
            ref_photon_count: 23_000,
            sys_tick: number as u32 * 33_000,
            results,
        })
    }

    /// Raise the error interrupt.
    pub fn raise_error(&self) {
        self.mutate(|s| {
            let status = IntStatus::from_byte(s.regs[REG_INT_STATUS as usize]);
            s.regs[REG_INT_STATUS as usize] = status.with_error(true).to_byte();
        });
    }

    fn download_delay_for(&self, register: u8, data: &[u8]) -> Duration {
        if register != REG_CMD_STAT || data.first() != Some(&BL_CMD_W_RAM) {
            return Duration::ZERO;
        }
        self.with_state(|s| if s.running == Mode::Bootloader { s.download_delay } else { Duration::ZERO })
    }
}

impl Transport for SimulatedTmf882x {
    async fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        self.with_state(|s| s.read(register, buf))
    }

    async fn write(&mut self, register: u8, data: &[u8]) -> Result<(), TransportError> {
        let delay = self.download_delay_for(register, data);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.mutate(|s| s.write(register, data))
    }
}

/// Enable line of a [`SimulatedTmf882x`].
#[derive(Clone)]
pub struct SimEnable {
    sim: SimulatedTmf882x,
}

impl EnableLine for SimEnable {
    fn is_high(&self) -> bool {
        self.sim.is_powered()
    }

    fn set(&mut self, high: bool) -> Result<(), TransportError> {
        self.sim.with_state(|s| {
            if s.powered == high {
                return;
            }
            s.counters.enable_toggles += 1;
            s.powered = high;
            // losing power loses the RAM patch, gaining it cold-boots
            s.power_up();
        });
        Ok(())
    }
}

/// Interrupt line of a [`SimulatedTmf882x`].
#[derive(Clone)]
pub struct SimInterrupt {
    sim: SimulatedTmf882x,
}

impl InterruptLine for SimInterrupt {
    async fn wait(&mut self) -> Result<(), TransportError> {
        self.sim.shared.irq.notified().await;
        Ok(())
    }
}

/// Firmware images held in memory, recording every lookup.
#[derive(Clone, Default)]
pub struct MemoryFirmware {
    images: HashMap<String, Bytes>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, name: impl Into<String>, image: impl Into<Bytes>) -> Self {
        self.images.insert(name.into(), image.into());
        self
    }

    /// Names looked up so far, in order.
    pub fn requests(&self) -> Vec<String> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl FirmwareSource for MemoryFirmware {
    async fn load(&self, name: &str) -> Option<Bytes> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(name.to_string());
        }
        self.images.get(name).cloned()
    }
}

/// A small, valid Intel HEX RAM patch.
pub fn demo_patch_ihex() -> String {
    let payload: Vec<u8> = (0..=255u8).map(|b| b.wrapping_mul(13) ^ 0x5A).collect();
    let mut text = String::new();
    for (i, chunk) in payload.chunks(16).enumerate() {
        text.push_str(&ihex_record(0x00, (i * 16) as u16, chunk));
        text.push('\n');
    }
    text.push_str(&ihex_record(0x01, 0, &[]));
    text.push('\n');
    text
}

/// One `:`-prefixed Intel HEX record with its checksum.
pub fn ihex_record(kind: u8, offset: u16, data: &[u8]) -> String {
    let mut record = vec![data.len() as u8];
    record.extend_from_slice(&offset.to_be_bytes());
    record.push(kind);
    record.extend_from_slice(data);
    let sum = record.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    record.push(sum.wrapping_neg());
    format!(":{}", hex::encode_upper(record))
}
