//! Cached application configuration.
//!
//! The driver mirrors the device's common config page, both SPAD maps and the
//! calibration blob. Every setter writes through to the device first and only
//! updates the mirror once the device accepted the write.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::chip::Mode;
use crate::constants::*;
use crate::controller::ChipState;
use crate::error::{Result, TofError};
use crate::spad::{SPAD_MAP_COUNT, SpadConfig, SpadLayout};
use crate::transport::{FirmwareSource, Transport};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ConfigPageRaw {
    pub page_id: u8,
    pub reserved: [u8; 3],
    pub period_ms: U16,
    pub kilo_iterations: U16,
    pub alg_setting: u8,
    pub power_cfg: u8,
    pub spad_map_id: u8,
    pub conf_threshold: u8,
    pub low_threshold: U16,
    pub high_threshold: U16,
    pub zone_mask: U32,
    pub persistence: u8,
    pub gpio_0: u8,
    pub gpio_1: u8,
    pub histogram_dump: u8,
}

pub const CONFIG_PAGE_SIZE: usize = size_of::<ConfigPageRaw>();

/// Common application configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub report_period_ms: u16,
    /// Measurement iterations in thousands
    pub kilo_iterations: u16,
    pub alg_setting: u8,
    pub power_cfg: u8,
    pub spad_map_id: u8,
    pub conf_threshold: u8,
    pub low_threshold: u16,
    pub high_threshold: u16,
    pub zone_mask: u32,
    pub persistence: u8,
    pub gpio_0: u8,
    pub gpio_1: u8,
    pub histogram_dump: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            report_period_ms: 33,
            kilo_iterations: 537,
            alg_setting: 0x04,
            power_cfg: 0,
            spad_map_id: 1,
            conf_threshold: 6,
            low_threshold: 0,
            high_threshold: 0xFFFF,
            zone_mask: (1 << ZONE_MASK_BITS) - 1,
            persistence: 0,
            gpio_0: 0,
            gpio_1: 0,
            histogram_dump: 0,
        }
    }
}

impl AppConfig {
    pub fn from_page(raw: &ConfigPageRaw) -> Self {
        Self {
            report_period_ms: raw.period_ms.get(),
            kilo_iterations: raw.kilo_iterations.get(),
            alg_setting: raw.alg_setting,
            power_cfg: raw.power_cfg,
            spad_map_id: raw.spad_map_id,
            conf_threshold: raw.conf_threshold,
            low_threshold: raw.low_threshold.get(),
            high_threshold: raw.high_threshold.get(),
            zone_mask: raw.zone_mask.get(),
            persistence: raw.persistence,
            gpio_0: raw.gpio_0,
            gpio_1: raw.gpio_1,
            histogram_dump: raw.histogram_dump,
        }
    }

    pub fn to_page(&self) -> ConfigPageRaw {
        ConfigPageRaw {
            page_id: PAGE_ID_COMMON,
            reserved: [0; 3],
            period_ms: U16::new(self.report_period_ms),
            kilo_iterations: U16::new(self.kilo_iterations),
            alg_setting: self.alg_setting,
            power_cfg: self.power_cfg,
            spad_map_id: self.spad_map_id,
            conf_threshold: self.conf_threshold,
            low_threshold: U16::new(self.low_threshold),
            high_threshold: U16::new(self.high_threshold),
            zone_mask: U32::new(self.zone_mask),
            persistence: self.persistence,
            gpio_0: self.gpio_0,
            gpio_1: self.gpio_1,
            histogram_dump: self.histogram_dump,
        }
    }

    /// True when going from `self` to `next` changes anything but the report
    /// period. Data queued under the old settings is then stale.
    pub fn alters_framing(&self, next: &AppConfig) -> bool {
        let mut unchanged_period = *next;
        unchanged_period.report_period_ms = self.report_period_ms;
        unchanged_period != *self
    }

    pub fn osc_trim_enabled(&self) -> bool {
        self.power_cfg & POWER_CFG_ALLOW_OSC_RETRIM != 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.spad_map_id > SPAD_MAP_ID_MAX {
            return Err(TofError::InvalidInput(format!("SPAD map id {} above {}", self.spad_map_id, SPAD_MAP_ID_MAX)));
        }
        if self.zone_mask >> ZONE_MASK_BITS != 0 {
            return Err(TofError::InvalidInput(format!(
                "zone mask {:#x} uses more than {} zones",
                self.zone_mask, ZONE_MASK_BITS
            )));
        }
        Ok(())
    }
}

/// Calibration blob with the windowed read protocol: a read at offset 0 refills
/// the cache, later offsets slice it.
#[derive(Debug, Clone, Default)]
pub struct CalibrationCache {
    data: Vec<u8>,
}

impl CalibrationCache {
    pub fn fill(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Up to `len` bytes from `offset`; empty once `offset` reaches the end.
    pub fn window(&self, offset: usize, len: usize) -> &[u8] {
        if offset >= self.data.len() {
            return &[];
        }
        let end = offset.saturating_add(len).min(self.data.len());
        &self.data[offset..end]
    }
}

/// Everything the driver remembers about device configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    pub app: AppConfig,
    pub spad: SpadLayout,
    pub spad_uncommitted: bool,
    pub calibration: CalibrationCache,
}

impl ConfigStore {
    /// Mutate the draft of SPAD map `index`, marking it uncommitted.
    pub fn stage_spad(&mut self, index: usize, stage: impl FnOnce(&mut SpadConfig)) -> Result<()> {
        let draft = self
            .spad
            .configs
            .get_mut(index)
            .ok_or_else(|| TofError::InvalidArgument(format!("no SPAD map {}", index)))?;
        stage(draft);
        self.spad_uncommitted = true;
        Ok(())
    }
}

impl<T: Transport, F: FirmwareSource> ChipState<T, F> {
    fn ensure_application(&self) -> Result<()> {
        match self.chip.mode() {
            Mode::Application => Ok(()),
            actual => Err(TofError::State {
                expected: Mode::Application,
                actual,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.store.app
    }

    pub fn spad_draft(&self, index: usize) -> Option<&SpadConfig> {
        self.store.spad.configs.get(index)
    }

    pub fn spad_uncommitted(&self) -> bool {
        self.store.spad_uncommitted
    }

    /// Re-read the common config and both SPAD maps from the device.
    pub async fn resync_config(&mut self) -> Result<()> {
        self.ensure_application()?;
        let app = self.chip.read_config().await?;
        let spad = self.read_spad_layout().await?;
        self.store.app = app;
        self.store.spad = spad;
        self.store.spad_uncommitted = false;
        debug!(config = ?self.store.app, "Configuration resynchronized");
        Ok(())
    }

    async fn read_spad_layout(&mut self) -> Result<SpadLayout> {
        let mut layout = SpadLayout::default();
        for index in 0..SPAD_MAP_COUNT {
            layout.configs[index] = self.chip.read_spad_config(index).await?;
        }
        Ok(layout)
    }

    /// Write a full configuration record.
    ///
    /// The cache changes only if the device accepts the record. A new SPAD map
    /// id reloads the SPAD drafts; any change besides the report period drops
    /// queued messages.
    pub async fn set_config(&mut self, next: AppConfig) -> Result<()> {
        self.ensure_application()?;
        next.validate()?;
        if let Err(e) = self.chip.write_config(&next).await {
            warn!(error = %e, "Device rejected configuration");
            return Err(e);
        }
        let previous = std::mem::replace(&mut self.store.app, next);
        if previous.alters_framing(&next) {
            self.flush();
        }
        info!(config = ?next, "Configuration updated");
        if previous.spad_map_id != next.spad_map_id {
            // the device holds the new record either way
            self.discard_spad()
                .await
                .inspect_err(|e| warn!(error = %e, "SPAD reload after map change failed"))?;
        }
        Ok(())
    }

    /// Apply `change` to a copy of the cached record and write it.
    pub async fn update_config(&mut self, change: impl FnOnce(&mut AppConfig)) -> Result<()> {
        let mut next = self.store.app;
        change(&mut next);
        self.set_config(next).await
    }

    pub fn stage_spad(&mut self, index: usize, stage: impl FnOnce(&mut SpadConfig)) -> Result<()> {
        self.store.stage_spad(index, stage)
    }

    /// Push both SPAD drafts to the device as one unit.
    ///
    /// Both pages are loaded before either is written. If a later write is
    /// refused, the maps already written get the live layout back.
    pub async fn commit_spad(&mut self) -> Result<()> {
        self.ensure_application()?;
        for config in &self.store.spad.configs {
            config.validate()?;
        }
        let live = self.read_spad_layout().await?;
        let drafts = self.store.spad.clone();
        for (index, draft) in drafts.configs.iter().enumerate() {
            if let Err(e) = self.chip.write_spad_config(index, draft).await {
                warn!(index, error = %e, "SPAD commit refused, restoring live layout");
                for written in 0..index {
                    if let Err(e) = self.chip.write_spad_config(written, &live.configs[written]).await {
                        error!(index = written, error = %e, "Failed to restore SPAD map");
                    }
                }
                if index > 0 {
                    self.flush();
                }
                return Err(e);
            }
        }
        self.store.spad_uncommitted = false;
        self.flush();
        info!("SPAD configuration committed");
        Ok(())
    }

    /// Replace the drafts with what the device currently holds.
    pub async fn discard_spad(&mut self) -> Result<()> {
        self.ensure_application()?;
        self.store.spad = self.read_spad_layout().await?;
        self.store.spad_uncommitted = false;
        Ok(())
    }

    pub async fn mode_8x8(&mut self) -> Result<bool> {
        Ok(self.chip.app_flags().await? & APP_FLAG_8X8 != 0)
    }

    /// Switch between 3x3 and time-multiplexed 8x8 operation. 8x8 always runs
    /// on the user-defined time-multiplexed SPAD map.
    pub async fn set_mode_8x8(&mut self, enabled: bool) -> Result<()> {
        self.chip.set_8x8(enabled).await?;
        if enabled && self.store.app.spad_map_id != SPAD_MAP_ID_USER_DEFINED_2 {
            self.update_config(|c| c.spad_map_id = SPAD_MAP_ID_USER_DEFINED_2).await?;
        }
        self.flush();
        Ok(())
    }

    pub async fn short_range(&mut self) -> Result<bool> {
        Ok(self.chip.app_flags().await? & APP_FLAG_SHORT_RANGE != 0)
    }

    pub async fn set_short_range(&mut self, enabled: bool) -> Result<()> {
        self.chip.set_short_range(enabled).await?;
        self.flush();
        Ok(())
    }

    pub async fn clock_compensation(&mut self) -> Result<bool> {
        Ok(self.chip.app_flags().await? & APP_FLAG_CLK_CORR != 0)
    }

    pub async fn set_clock_compensation(&mut self, enabled: bool) -> Result<()> {
        self.chip.set_clock_correction(enabled).await
    }

    pub async fn set_osc_trim(&mut self, enabled: bool) -> Result<()> {
        self.update_config(|c| {
            if enabled {
                c.power_cfg |= POWER_CFG_ALLOW_OSC_RETRIM;
            } else {
                c.power_cfg &= !POWER_CFG_ALLOW_OSC_RETRIM;
            }
        })
        .await
    }

    pub async fn osc_trim_freq(&mut self) -> Result<u16> {
        self.chip.osc_trim_freq().await
    }

    pub async fn set_osc_trim_freq(&mut self, freq: u16) -> Result<()> {
        self.chip.set_osc_trim_freq(freq).await
    }

    /// Windowed calibration read. Offset 0 fetches a fresh blob from the device.
    pub async fn read_calibration(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset == 0 {
            self.ensure_application()?;
            let blob = self.chip.read_calibration().await?;
            self.store.calibration.fill(blob);
        }
        Ok(self.store.calibration.window(offset, len).to_vec())
    }

    /// Like [`Self::read_calibration`] but offset 0 runs factory calibration.
    pub async fn factory_calibration(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset == 0 {
            self.ensure_application()?;
            let blob = self.chip.factory_calibrate().await?;
            info!(len = blob.len(), "Factory calibration complete");
            self.store.calibration.fill(blob);
        }
        Ok(self.store.calibration.window(offset, len).to_vec())
    }

    pub async fn write_calibration(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_application()?;
        self.chip.write_calibration(data).await?;
        self.store.calibration.fill(data.to_vec());
        Ok(())
    }
}
