//! Named get/set endpoints over the driver state.
//!
//! Every attribute reads and writes text. Integers are accepted in the
//! C `%i` forms (`42`, `-3`, `0x2a`, `052`) and must fit the width of the field
//! they land in. Reads end with a newline.

use std::fmt::Write as _;
use strum_macros::Display;
use tracing::{debug, info};

use crate::constants::*;
use crate::controller::ChipState;
use crate::error::{Result, TofError};
use crate::spad::SpadConfig;
use crate::transport::{FirmwareSource, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TofAttribute {
    #[strum(serialize = "mode")]
    Mode,
    #[strum(serialize = "chip_enable")]
    ChipEnable,
    #[strum(serialize = "driver_debug")]
    DriverDebug,
    #[strum(serialize = "firmware_version")]
    FirmwareVersion,
    #[strum(serialize = "device_revision")]
    DeviceRevision,
    #[strum(serialize = "device_uid")]
    DeviceUid,
    #[strum(serialize = "registers")]
    Registers,
    #[strum(serialize = "register_write")]
    RegisterWrite,
    #[strum(serialize = "request_ram_patch")]
    RequestRamPatch,
    #[strum(serialize = "capture")]
    Capture,
    #[strum(serialize = "short_range_mode")]
    ShortRangeMode,
    #[strum(serialize = "report_period_ms")]
    ReportPeriodMs,
    #[strum(serialize = "iterations")]
    Iterations,
    #[strum(serialize = "alg_setting")]
    AlgSetting,
    #[strum(serialize = "power_cfg")]
    PowerCfg,
    #[strum(serialize = "gpio_0")]
    Gpio0,
    #[strum(serialize = "gpio_1")]
    Gpio1,
    #[strum(serialize = "histogram_dump")]
    HistogramDump,
    #[strum(serialize = "spad_map_id")]
    SpadMapId,
    #[strum(serialize = "zone_mask")]
    ZoneMask,
    #[strum(serialize = "conf_threshold")]
    ConfThreshold,
    #[strum(serialize = "low_threshold")]
    LowThreshold,
    #[strum(serialize = "high_threshold")]
    HighThreshold,
    #[strum(serialize = "persistence")]
    Persistence,
    #[strum(serialize = "mode_8x8")]
    Mode8x8,
    #[strum(serialize = "xoff_q1_0")]
    XoffQ1_0,
    #[strum(serialize = "xoff_q1_1")]
    XoffQ1_1,
    #[strum(serialize = "yoff_q1_0")]
    YoffQ1_0,
    #[strum(serialize = "yoff_q1_1")]
    YoffQ1_1,
    #[strum(serialize = "xsize_0")]
    Xsize0,
    #[strum(serialize = "xsize_1")]
    Xsize1,
    #[strum(serialize = "ysize_0")]
    Ysize0,
    #[strum(serialize = "ysize_1")]
    Ysize1,
    #[strum(serialize = "spad_mask_0")]
    SpadMask0,
    #[strum(serialize = "spad_mask_1")]
    SpadMask1,
    #[strum(serialize = "spad_map_0")]
    SpadMap0,
    #[strum(serialize = "spad_map_1")]
    SpadMap1,
    #[strum(serialize = "commit_spad_cfg")]
    CommitSpadCfg,
    #[strum(serialize = "reset_spad_cfg")]
    ResetSpadCfg,
    #[strum(serialize = "clock_compensation")]
    ClockCompensation,
    #[strum(serialize = "osc_trim")]
    OscTrim,
    #[strum(serialize = "osc_trim_freq")]
    OscTrimFreq,
}

/// One SPAD geometry field of one map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpadField {
    XoffQ1,
    YoffQ1,
    Xsize,
    Ysize,
    Mask,
    Map,
}

impl TofAttribute {
    pub const ALL: [TofAttribute; 42] = [
        TofAttribute::Mode,
        TofAttribute::ChipEnable,
        TofAttribute::DriverDebug,
        TofAttribute::FirmwareVersion,
        TofAttribute::DeviceRevision,
        TofAttribute::DeviceUid,
        TofAttribute::Registers,
        TofAttribute::RegisterWrite,
        TofAttribute::RequestRamPatch,
        TofAttribute::Capture,
        TofAttribute::ShortRangeMode,
        TofAttribute::ReportPeriodMs,
        TofAttribute::Iterations,
        TofAttribute::AlgSetting,
        TofAttribute::PowerCfg,
        TofAttribute::Gpio0,
        TofAttribute::Gpio1,
        TofAttribute::HistogramDump,
        TofAttribute::SpadMapId,
        TofAttribute::ZoneMask,
        TofAttribute::ConfThreshold,
        TofAttribute::LowThreshold,
        TofAttribute::HighThreshold,
        TofAttribute::Persistence,
        TofAttribute::Mode8x8,
        TofAttribute::XoffQ1_0,
        TofAttribute::XoffQ1_1,
        TofAttribute::YoffQ1_0,
        TofAttribute::YoffQ1_1,
        TofAttribute::Xsize0,
        TofAttribute::Xsize1,
        TofAttribute::Ysize0,
        TofAttribute::Ysize1,
        TofAttribute::SpadMask0,
        TofAttribute::SpadMask1,
        TofAttribute::SpadMap0,
        TofAttribute::SpadMap1,
        TofAttribute::CommitSpadCfg,
        TofAttribute::ResetSpadCfg,
        TofAttribute::ClockCompensation,
        TofAttribute::OscTrim,
        TofAttribute::OscTrimFreq,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.to_string() == name)
    }

    pub fn is_readable(self) -> bool {
        !matches!(
            self,
            TofAttribute::RegisterWrite | TofAttribute::RequestRamPatch | TofAttribute::ResetSpadCfg
        )
    }

    pub fn is_writable(self) -> bool {
        !matches!(
            self,
            TofAttribute::FirmwareVersion
                | TofAttribute::DeviceRevision
                | TofAttribute::DeviceUid
                | TofAttribute::Registers
        )
    }

    fn spad_field(self) -> Option<(usize, SpadField)> {
        use TofAttribute::*;
        Some(match self {
            XoffQ1_0 => (0, SpadField::XoffQ1),
            XoffQ1_1 => (1, SpadField::XoffQ1),
            YoffQ1_0 => (0, SpadField::YoffQ1),
            YoffQ1_1 => (1, SpadField::YoffQ1),
            Xsize0 => (0, SpadField::Xsize),
            Xsize1 => (1, SpadField::Xsize),
            Ysize0 => (0, SpadField::Ysize),
            Ysize1 => (1, SpadField::Ysize),
            SpadMask0 => (0, SpadField::Mask),
            SpadMask1 => (1, SpadField::Mask),
            SpadMap0 => (0, SpadField::Map),
            SpadMap1 => (1, SpadField::Map),
            _ => return None,
        })
    }
}

/// Parse one integer in any of the C `%i` notations.
pub fn parse_c_int(text: &str) -> Result<i64> {
    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let (digits, radix) = if let Some(hex) = unsigned.strip_prefix("0x").or_else(|| unsigned.strip_prefix("0X")) {
        (hex, 16)
    } else if unsigned.len() > 1 && unsigned.starts_with('0') {
        (&unsigned[1..], 8)
    } else {
        (unsigned, 10)
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(TofError::InvalidInput(format!("'{}' is not an integer", text.trim())));
    }
    let magnitude = i64::from_str_radix(digits, radix)
        .map_err(|_| TofError::InvalidInput(format!("'{}' is not an integer", text.trim())))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Parse an integer that has to fit `N`.
pub fn parse_field<N: TryFrom<i64>>(name: &str, text: &str) -> Result<N> {
    let value = parse_c_int(text)?;
    N::try_from(value).map_err(|_| TofError::InvalidInput(format!("{} out of range for {}", value, name)))
}

fn parse_flag(text: &str) -> Result<bool> {
    Ok(parse_c_int(text)? != 0)
}

/// Whitespace-separated SPAD values.
///
/// Tokens that are not integers are skipped, parsing stops after
/// `MAX_SPAD_SIZE` values and missing entries are zero. A value that does not
/// fit a byte rejects the whole input.
pub fn parse_spad_values(text: &str) -> Result<Vec<u8>> {
    let mut values = Vec::with_capacity(MAX_SPAD_SIZE);
    for token in text.split_whitespace() {
        if values.len() == MAX_SPAD_SIZE {
            break;
        }
        let Ok(value) = parse_c_int(token) else {
            debug!(token, "Skipping non-numeric SPAD token");
            continue;
        };
        let byte = u8::try_from(value)
            .map_err(|_| TofError::InvalidInput(format!("SPAD value {} does not fit a byte", value)))?;
        values.push(byte);
    }
    values.resize(MAX_SPAD_SIZE, 0);
    Ok(values)
}

/// `reg:value[:mask]` as taken by `register_write`.
pub fn parse_register_write(text: &str) -> Result<(u8, u8, Option<u8>)> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    match parts.as_slice() {
        [reg, value] => Ok((parse_field("register", reg)?, parse_field("value", value)?, None)),
        [reg, value, mask] => Ok((
            parse_field("register", reg)?,
            parse_field("value", value)?,
            Some(parse_field("mask", mask)?),
        )),
        _ => Err(TofError::InvalidInput(format!("expected reg:value[:mask], got '{}'", text.trim()))),
    }
}

/// Register dump, four registers per line.
pub fn format_registers(regs: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in regs.chunks(4).enumerate() {
        let _ = write!(out, "0x{:02x}:", row * 4);
        for b in chunk {
            let _ = write!(out, " {:02x}", b);
        }
        out.push('\n');
    }
    out
}

fn flag(value: bool) -> String {
    format!("{}\n", value as u8)
}

fn spad_draft<T: Transport, F: FirmwareSource>(state: &ChipState<T, F>, index: usize) -> Result<&SpadConfig> {
    state
        .spad_draft(index)
        .ok_or_else(|| TofError::InvalidArgument(format!("no SPAD map {}", index)))
}

/// Read `attr` as text.
pub async fn show<T: Transport, F: FirmwareSource>(state: &mut ChipState<T, F>, attr: TofAttribute) -> Result<String> {
    use TofAttribute::*;
    if !attr.is_readable() {
        return Err(TofError::NotSupported("write-only attribute"));
    }
    if let Some((index, field)) = attr.spad_field() {
        let draft = spad_draft(state, index)?;
        return Ok(match field {
            SpadField::XoffQ1 => format!("{}\n", draft.xoff_q1),
            SpadField::YoffQ1 => format!("{}\n", draft.yoff_q1),
            SpadField::Xsize => format!("{}\n", draft.xsize),
            SpadField::Ysize => format!("{}\n", draft.ysize),
            SpadField::Mask => draft.format_grid(&draft.spad_mask),
            SpadField::Map => draft.format_grid(&draft.spad_map),
        });
    }
    let config = *state.config();
    let text = match attr {
        Mode => format!("{:#x}\n", state.mode().appid().unwrap_or(0)),
        ChipEnable => flag(state.chip_enabled().ok_or(TofError::NotSupported("chip enable line"))?),
        DriverDebug => format!("{}\n", state.debug_level()),
        FirmwareVersion => format!("{}\n", state.firmware_version().await?),
        DeviceRevision => format!("{}\n", state.device_revision().await?),
        DeviceUid => format!("{}\n", state.device_uid().await?),
        Registers => format_registers(&state.chip_mut().dump_registers().await?),
        Capture => flag(state.is_capturing().await?),
        ShortRangeMode => flag(state.short_range().await?),
        ReportPeriodMs => format!("{}\n", config.report_period_ms),
        Iterations => format!("{}\n", (config.kilo_iterations as u32) << 10),
        AlgSetting => format!("{}\n", config.alg_setting),
        PowerCfg => format!("{}\n", config.power_cfg),
        Gpio0 => format!("{}\n", config.gpio_0),
        Gpio1 => format!("{}\n", config.gpio_1),
        HistogramDump => format!("{}\n", config.histogram_dump),
        SpadMapId => format!("{}\n", config.spad_map_id),
        ZoneMask => format!("{}\n", config.zone_mask),
        ConfThreshold => format!("{}\n", config.conf_threshold),
        LowThreshold => format!("{}\n", config.low_threshold),
        HighThreshold => format!("{}\n", config.high_threshold),
        Persistence => format!("{}\n", config.persistence),
        Mode8x8 => flag(state.mode_8x8().await?),
        CommitSpadCfg => flag(!state.spad_uncommitted()),
        ClockCompensation => flag(state.clock_compensation().await?),
        OscTrim => flag(config.osc_trim_enabled()),
        OscTrimFreq => format!("{}\n", state.osc_trim_freq().await?),
        _ => return Err(TofError::NotSupported("write-only attribute")),
    };
    Ok(text)
}

/// Write `input` to `attr`.
pub async fn store<T: Transport, F: FirmwareSource>(
    state: &mut ChipState<T, F>,
    attr: TofAttribute,
    input: &str,
) -> Result<()> {
    use TofAttribute::*;
    if !attr.is_writable() {
        return Err(TofError::NotSupported("read-only attribute"));
    }
    info!(attribute = %attr, input = input.trim(), "Attribute store");
    let name = attr.to_string();

    if let Some((index, field)) = attr.spad_field() {
        return match field {
            SpadField::XoffQ1 => {
                let v: i8 = parse_field(&name, input)?;
                state.stage_spad(index, |d| d.xoff_q1 = v)
            }
            SpadField::YoffQ1 => {
                let v: i8 = parse_field(&name, input)?;
                state.stage_spad(index, |d| d.yoff_q1 = v)
            }
            SpadField::Xsize => {
                let v = bounded(&name, input, MAX_SPAD_XSIZE)?;
                state.stage_spad(index, |d| d.xsize = v)
            }
            SpadField::Ysize => {
                let v = bounded(&name, input, MAX_SPAD_YSIZE)?;
                state.stage_spad(index, |d| d.ysize = v)
            }
            SpadField::Mask => {
                let values = parse_spad_values(input)?;
                state.stage_spad(index, |d| d.spad_mask = values)
            }
            SpadField::Map => {
                let values = parse_spad_values(input)?;
                state.stage_spad(index, |d| d.spad_map = values)
            }
        };
    }

    match attr {
        Mode => state.set_mode(parse_mode(input)?).await,
        ChipEnable => state.set_chip_enable(parse_flag(input)?).await,
        DriverDebug => {
            state.set_debug_level(parse_field(&name, input)?);
            Ok(())
        }
        RegisterWrite => {
            let (register, value, mask) = parse_register_write(input)?;
            match mask {
                Some(mask) => state.chip_mut().write_masked(register, value, mask).await,
                None => state.chip_mut().write_reg(register, value).await,
            }
        }
        RequestRamPatch => state.request_ram_patch().await,
        Capture => {
            if parse_flag(input)? {
                state.start_capture().await
            } else {
                state.stop_capture().await
            }
        }
        ShortRangeMode => state.set_short_range(parse_flag(input)?).await,
        ReportPeriodMs => {
            let v: u16 = parse_field(&name, input)?;
            state.update_config(|c| c.report_period_ms = v).await
        }
        Iterations => {
            let iterations: u32 = parse_field(&name, input)?;
            let kilo = u16::try_from(iterations >> 10)
                .map_err(|_| TofError::InvalidInput(format!("{} iterations out of range", iterations)))?;
            state.update_config(|c| c.kilo_iterations = kilo).await
        }
        AlgSetting => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.alg_setting = v).await
        }
        PowerCfg => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.power_cfg = v).await
        }
        Gpio0 => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.gpio_0 = v).await
        }
        Gpio1 => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.gpio_1 = v).await
        }
        HistogramDump => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.histogram_dump = v).await
        }
        SpadMapId => {
            let v = bounded(&name, input, SPAD_MAP_ID_MAX)?;
            state.update_config(|c| c.spad_map_id = v).await
        }
        ZoneMask => {
            let v: u32 = parse_field(&name, input)?;
            state.update_config(|c| c.zone_mask = v).await
        }
        ConfThreshold => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.conf_threshold = v).await
        }
        LowThreshold => {
            let v: u16 = parse_field(&name, input)?;
            state.update_config(|c| c.low_threshold = v).await
        }
        HighThreshold => {
            let v: u16 = parse_field(&name, input)?;
            state.update_config(|c| c.high_threshold = v).await
        }
        Persistence => {
            let v: u8 = parse_field(&name, input)?;
            state.update_config(|c| c.persistence = v).await
        }
        Mode8x8 => state.set_mode_8x8(parse_flag(input)?).await,
        CommitSpadCfg => {
            if parse_c_int(input)? == 1 {
                state.commit_spad().await?;
            }
            Ok(())
        }
        ResetSpadCfg => {
            if parse_c_int(input)? == 1 {
                state.discard_spad().await?;
            }
            Ok(())
        }
        ClockCompensation => state.set_clock_compensation(parse_flag(input)?).await,
        OscTrim => state.set_osc_trim(parse_flag(input)?).await,
        OscTrimFreq => {
            let v: u16 = parse_field(&name, input)?;
            state.set_osc_trim_freq(v).await
        }
        _ => Err(TofError::NotSupported("read-only attribute")),
    }
}

/// Mode named by its application id, as shown by the `mode` attribute.
pub fn parse_mode(text: &str) -> Result<crate::chip::Mode> {
    let appid: u8 = parse_field("mode", text)?;
    match crate::chip::Mode::from_appid(appid) {
        crate::chip::Mode::Unknown => Err(TofError::InvalidInput(format!("no mode with id {:#x}", appid))),
        mode => Ok(mode),
    }
}

fn bounded(name: &str, input: &str, max: u8) -> Result<u8> {
    let v: u8 = parse_field(name, input)?;
    if v > max {
        return Err(TofError::InvalidInput(format!("{} above {} for {}", v, max, name)));
    }
    Ok(v)
}
