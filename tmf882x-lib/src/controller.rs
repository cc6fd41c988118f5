//! Driver state and the mode/firmware controller.
//!
//! [`ChipState`] is everything the driver owns about one sensor. It is only ever
//! reached through the driver lock, so every method here takes `&mut self` and
//! assumes exclusive access.

use std::io;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::chip::{Mode, Tmf882x};
use crate::config::ConfigStore;
use crate::driver::DriverConfig;
use crate::error::{Result, TofError};
use crate::events::{InputEvent, publish_events};
use crate::firmware::FirmwareImage;
use crate::message::Message;
use crate::queue::{MessageQueue, PushOutcome};
use crate::transport::{EnableLine, FirmwareSource, Transport};

/// How one firmware candidate ended.
#[derive(Debug)]
pub enum FwdlOutcome {
    Completed,
    Missing,
    Failed(TofError),
    TimedOut,
    Cancelled,
}

pub struct ChipState<T, F> {
    pub(crate) chip: Tmf882x<T>,
    enable: Option<Box<dyn EnableLine>>,
    firmware: F,
    firmware_names: Vec<String>,
    fwdl_timeout: Duration,
    fwdl_needed: bool,
    driver_debug: u8,
    poll_period: u32,
    pub(crate) open_count: usize,
    resume_measurements: bool,
    pub(crate) queue: MessageQueue,
    pub(crate) store: ConfigStore,
    removing: bool,
    shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<InputEvent>,
}

impl<T: Transport, F: FirmwareSource> ChipState<T, F> {
    pub fn new(
        transport: T,
        enable: Option<Box<dyn EnableLine>>,
        firmware: F,
        config: &DriverConfig,
        shutdown: watch::Receiver<bool>,
        events: broadcast::Sender<InputEvent>,
    ) -> Self {
        let mut chip = Tmf882x::new(transport);
        chip.set_poll_budget(config.command_poll_budget);
        chip.set_debug_level(config.debug_level);
        Self {
            chip,
            enable,
            firmware,
            firmware_names: config.firmware_names.clone(),
            fwdl_timeout: Duration::from_millis(config.fwdl_timeout_ms),
            fwdl_needed: true,
            driver_debug: config.debug_level,
            poll_period: config.poll_period,
            open_count: 0,
            resume_measurements: false,
            queue: MessageQueue::with_capacity(config.queue_capacity),
            store: ConfigStore::default(),
            removing: false,
            shutdown,
            events,
        }
    }

    pub fn chip(&self) -> &Tmf882x<T> {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut Tmf882x<T> {
        &mut self.chip
    }

    pub fn mode(&self) -> Mode {
        self.chip.mode()
    }

    pub fn fwdl_needed(&self) -> bool {
        self.fwdl_needed
    }

    pub fn debug_level(&self) -> u8 {
        self.driver_debug
    }

    pub fn set_debug_level(&mut self, level: u8) {
        self.driver_debug = level;
        self.chip.set_debug_level(level);
    }

    /// Producer poll period in units of 100 us.
    pub fn poll_period(&self) -> u32 {
        self.poll_period
    }

    pub fn set_poll_period(&mut self, period: u32) {
        self.poll_period = period;
    }

    pub fn open_count(&self) -> usize {
        self.open_count
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MessageQueue {
        &mut self.queue
    }

    pub fn is_removing(&self) -> bool {
        self.removing
    }

    pub(crate) fn mark_removing(&mut self) {
        self.removing = true;
    }

    /// Drop every queued message.
    pub fn flush(&mut self) {
        if !self.queue.is_empty() {
            debug!(bytes = self.queue.len(), "Flushing output queue");
        }
        self.queue.reset();
    }

    /// Raise the enable line if it is low. A rising edge reboots the chip.
    pub fn power_on(&mut self) -> Result<()> {
        if let Some(line) = self.enable.as_mut() {
            if !line.is_high() {
                line.set(true).inspect_err(|e| error!(error = %e, "Error powering chip"))?;
                self.chip.invalidate();
                self.fwdl_needed = true;
            }
        }
        Ok(())
    }

    /// Close the chip and drop the enable line. The RAM patch is gone afterwards.
    pub async fn power_off(&mut self) -> Result<()> {
        if let Err(e) = self.chip.close().await {
            debug!(error = %e, "Close before power-off failed");
        }
        self.chip.invalidate();
        self.fwdl_needed = true;
        if let Some(line) = self.enable.as_mut() {
            line.set(false)?;
        }
        Ok(())
    }

    pub fn has_enable_line(&self) -> bool {
        self.enable.is_some()
    }

    pub fn chip_enabled(&self) -> Option<bool> {
        self.enable.as_ref().map(|line| line.is_high())
    }

    /// Bring the chip into `requested` mode, downloading firmware first when
    /// application mode needs it.
    pub async fn open_mode(&mut self, requested: Mode) -> Result<()> {
        self.power_on()?;
        info!(mode = %requested, "Opening device");
        self.chip.open().await.inspect_err(|e| error!(error = %e, "Failed to open device"))?;

        match requested {
            Mode::Bootloader => {
                if let Err(e) = self.chip.mode_switch(Mode::Bootloader).await {
                    warn!(error = %e, "Mode switch to bootloader failed");
                    self.log_registers().await;
                    return Err(e);
                }
                // entering the bootloader drops the RAM patch
                self.fwdl_needed = true;
            }
            Mode::Application => {
                if self.fwdl_needed {
                    match self.download_firmware().await {
                        Ok(()) => self.fwdl_needed = false,
                        Err(TofError::Cancelled) => return Err(TofError::Cancelled),
                        Err(e) => warn!(error = %e, "Firmware download failed"),
                    }
                }
                if let Err(e) = self.chip.mode_switch(Mode::Application).await {
                    warn!(error = %e, "Mode switch to application failed");
                    self.log_registers().await;
                    return Err(e);
                }
            }
            Mode::Unknown => {
                return Err(TofError::InvalidArgument("cannot open unknown mode".to_string()));
            }
        }

        let actual = self.chip.mode();
        if actual != requested {
            return Err(TofError::State {
                expected: requested,
                actual,
            });
        }
        Ok(())
    }

    /// Open `requested` and, for application mode, reload the cached config.
    pub async fn set_mode(&mut self, requested: Mode) -> Result<()> {
        self.open_mode(requested).await?;
        if requested == Mode::Application {
            self.resync_config().await?;
        }
        Ok(())
    }

    /// Try each configured firmware image until one starts.
    pub async fn download_firmware(&mut self) -> Result<()> {
        let names = self.firmware_names.clone();
        for name in &names {
            info!(name = %name, "Trying firmware");
            match self.try_candidate(name).await {
                FwdlOutcome::Completed => return Ok(()),
                FwdlOutcome::Missing => warn!(name = %name, "Firmware not available"),
                FwdlOutcome::Failed(e) => warn!(name = %name, error = %e, "RAM patch failed"),
                FwdlOutcome::TimedOut => {
                    error!(name = %name, timeout_ms = self.fwdl_timeout.as_millis() as u64, "Timeout waiting for RAM patch")
                }
                FwdlOutcome::Cancelled => {
                    self.chip.invalidate();
                    return Err(TofError::Cancelled);
                }
            }
        }
        Err(TofError::Io(io::Error::other("no firmware image could be downloaded")))
    }

    /// Fetch one candidate and stream it to the bootloader. Fetch and download
    /// share one deadline and both end on teardown.
    async fn try_candidate(&mut self, name: &str) -> FwdlOutcome {
        let deadline = self.fwdl_timeout;
        let mut shutdown = self.shutdown.clone();
        let firmware = &self.firmware;
        let chip = &mut self.chip;

        let attempt = async move {
            let Some(blob) = firmware.load(name).await else {
                return None;
            };
            let started = Instant::now();
            let result = ram_patch(chip, &blob).await;
            if result.is_ok() {
                info!(dl_time_ms = started.elapsed().as_millis() as u64, "RAM patch complete");
            }
            Some(result)
        };

        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => FwdlOutcome::Cancelled,
            waited = tokio::time::timeout(deadline, attempt) => match waited {
                Err(_) => FwdlOutcome::TimedOut,
                Ok(None) => FwdlOutcome::Missing,
                Ok(Some(Ok(()))) => FwdlOutcome::Completed,
                Ok(Some(Err(e))) => FwdlOutcome::Failed(e),
            },
        };
        if matches!(outcome, FwdlOutcome::TimedOut) {
            // the interrupted download left the chip somewhere mid-protocol
            self.chip.invalidate();
        }
        outcome
    }

    /// Power-cycle and come back up in application mode.
    pub async fn hard_reset(&mut self) -> Result<()> {
        info!("Hard reset");
        if let Err(e) = self.power_off().await {
            warn!(error = %e, "Power-off during hard reset failed");
        }
        self.open_mode(Mode::Application).await
    }

    /// Hard reset (re-patching if possible) followed by a config resync.
    pub async fn request_ram_patch(&mut self) -> Result<()> {
        self.hard_reset().await?;
        self.resync_config().await
    }

    pub async fn set_chip_enable(&mut self, enabled: bool) -> Result<()> {
        if self.enable.is_none() {
            return Err(TofError::NotSupported("chip enable line"));
        }
        if enabled {
            self.open_mode(Mode::Application).await
        } else {
            self.power_off().await
        }
    }

    pub async fn is_capturing(&mut self) -> Result<bool> {
        if self.chip.mode() != Mode::Application {
            return Ok(false);
        }
        self.chip.is_measuring().await
    }

    pub async fn start_capture(&mut self) -> Result<()> {
        info!("Start capture");
        self.open_mode(Mode::Application).await?;
        self.chip.start_measurements().await
    }

    /// Stop measuring and drop whatever was still queued.
    pub async fn stop_capture(&mut self) -> Result<()> {
        info!("Stop capture");
        self.chip.stop_measurements().await?;
        self.flush();
        Ok(())
    }

    pub async fn suspend(&mut self) -> Result<()> {
        info!("Suspend");
        self.resume_measurements = self.is_capturing().await?;
        self.chip.close().await?;
        self.flush();
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        info!(restart_capture = self.resume_measurements, "Resume");
        self.open_mode(Mode::Application).await?;
        if self.resume_measurements {
            self.chip.start_measurements().await?;
            self.resume_measurements = false;
        }
        Ok(())
    }

    pub async fn firmware_version(&mut self) -> Result<String> {
        let v = self.chip.firmware_version().await?;
        Ok(format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3]))
    }

    /// Serial number; only the application can report it.
    pub async fn device_uid(&mut self) -> Result<String> {
        self.open_mode(Mode::Application).await?;
        let uid = self.chip.device_uid().await?;
        if self.open_count == 0 {
            self.chip.close().await?;
        }
        Ok(format!("{}.{}.{}.{}", uid[0], uid[1], uid[2], uid[3]))
    }

    pub async fn device_revision(&mut self) -> Result<String> {
        self.power_on()?;
        let rev = self.chip.device_revision().await?;
        Ok(format!("{}.{}", rev.id, rev.revision))
    }

    async fn log_registers(&mut self) {
        match self.chip.dump_registers().await {
            Ok(regs) => {
                for (row, chunk) in regs.chunks(16).enumerate() {
                    debug!("{:#04x}: {}", row * 16, hex::encode(chunk));
                }
            }
            Err(e) => debug!(error = %e, "Register dump failed"),
        }
    }

    /// One producer step: service the chip and queue what it produced.
    pub async fn drain(&mut self) -> Result<usize> {
        if self.removing {
            return Ok(0);
        }
        let messages = self.chip.process_irq().await?;
        for message in &messages {
            self.enqueue(message);
        }
        Ok(messages.len())
    }

    /// Queue one message and publish its input events.
    pub fn enqueue(&mut self, message: &Message) {
        publish_events(&self.events, message);
        let bytes = message.encode();
        match self.queue.push(&bytes) {
            Ok(PushOutcome::Queued) => {}
            Ok(PushOutcome::RecoveredFromOverflow) => {
                if self.driver_debug == 1 {
                    error!("Message buffer is full, clearing buffer");
                }
            }
            Err(e) => error!(error = %e, "Error queueing output message"),
        }
        if self.driver_debug == 2 {
            info!(
                len = self.queue.len(),
                utilization = self.queue.utilization_percent(),
                "Output queue level"
            );
        }
    }
}

/// Parse a RAM patch and stream it through the bootloader.
async fn ram_patch<T: Transport>(chip: &mut Tmf882x<T>, blob: &[u8]) -> Result<()> {
    let image = FirmwareImage::parse(blob)?;
    chip.mode_switch(Mode::Bootloader).await?;
    chip.download(&image).await
}

/// Resolves once teardown has been requested.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // no teardown signal will ever come
        std::future::pending::<()>().await;
    }
}
