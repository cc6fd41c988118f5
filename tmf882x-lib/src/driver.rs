//! Driver instance: one lock over all chip state, a producer task feeding the
//! output queue and stream handles reading whole messages from it.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chip::Mode;
use crate::constants::{CMD_POLL_BUDGET, DEFAULT_POLL_PERIOD, DEFAULT_QUEUE_CAPACITY, MAX_MSG_SIZE, POLL_PERIOD_UNIT_US, TOF_FWDL_TIMEOUT_MSEC};
use crate::controller::{ChipState, cancelled};
use crate::error::{Result, TofError};
use crate::events::{EVENT_CHANNEL_CAPACITY, InputEvent};
use crate::transport::{EnableLine, FirmwareSource, InterruptLine, Transport};

/// Tunables of one driver instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Producer poll period in units of 100 us; 0 selects interrupt-driven I/O
    /// when an interrupt line is attached
    pub poll_period: u32,
    /// RAM patch candidates, tried in order
    pub firmware_names: Vec<String>,
    pub fwdl_timeout_ms: u64,
    pub queue_capacity: usize,
    pub debug_level: u8,
    /// Status polls allowed per command
    pub command_poll_budget: u32,
    /// Hard reset into application mode while attaching
    pub reset_on_attach: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_period: 0,
            firmware_names: vec!["tmf882x_firmware.bin".to_string()],
            fwdl_timeout_ms: TOF_FWDL_TIMEOUT_MSEC,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            debug_level: 0,
            command_poll_budget: CMD_POLL_BUDGET,
            reset_on_attach: true,
        }
    }
}

impl DriverConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TofError::InvalidInput(format!("driver config: {}", e)))
    }

    pub fn with_poll_period(mut self, period: u32) -> Self {
        self.poll_period = period;
        self
    }

    pub fn with_firmware_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.firmware_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fwdl_timeout(mut self, timeout: Duration) -> Self {
        self.fwdl_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_debug_level(mut self, level: u8) -> Self {
        self.debug_level = level;
        self
    }

    pub fn with_command_poll_budget(mut self, polls: u32) -> Self {
        self.command_poll_budget = polls;
        self
    }

    pub fn with_reset_on_attach(mut self, reset: bool) -> Self {
        self.reset_on_attach = reset;
        self
    }
}

/// How a stream handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: Access,
    pub nonblocking: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            access: Access::ReadOnly,
            nonblocking: false,
        }
    }

    pub fn nonblocking(mut self) -> Self {
        self.nonblocking = true;
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }
}

struct Shared<T, F> {
    state: Mutex<ChipState<T, F>>,
    data_ready: Notify,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<InputEvent>,
}

impl<T: Transport, F: FirmwareSource> Shared<T, F> {
    /// Drain the chip under the lock and wake every parked reader, whatever
    /// the drain produced.
    async fn service(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = state.drain().await {
            debug!(error = %e, "Interrupt service failed");
        }
        self.data_ready.notify_waiters();
    }

    async fn acquire(&self, nonblocking: bool) -> Result<MutexGuard<'_, ChipState<T, F>>> {
        if nonblocking {
            self.state.try_lock().map_err(|_| TofError::WouldBlock)
        } else {
            Ok(self.state.lock().await)
        }
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        state.open_count = state.open_count.saturating_sub(1);
        if state.open_count == 0 {
            debug!("Last stream handle closed");
            state.flush();
        }
    }
}

/// One attached sensor.
pub struct Tof<T: Transport, F: FirmwareSource> {
    shared: Arc<Shared<T, F>>,
    producer: StdMutex<Option<JoinHandle<()>>>,
}

impl<T: Transport, F: FirmwareSource> Tof<T, F> {
    /// Attach with a polling producer. Without an interrupt line there is
    /// nothing else to wake readers, so a zero `config.poll_period` falls back
    /// to [`DEFAULT_POLL_PERIOD`].
    pub async fn attach(
        transport: T,
        enable: Option<Box<dyn EnableLine>>,
        firmware: F,
        mut config: DriverConfig,
    ) -> Result<Self> {
        if config.poll_period == 0 {
            info!(poll_period = DEFAULT_POLL_PERIOD, "No interrupt line, using polled I/O");
            config.poll_period = DEFAULT_POLL_PERIOD;
        }
        let tof = Self::build(transport, enable, firmware, &config);
        let shared = tof.shared.clone();
        let shutdown = tof.shared.shutdown.subscribe();
        tof.set_producer(tokio::spawn(poll_producer(shared, shutdown)));
        tof.bring_up(&config).await?;
        Ok(tof)
    }

    /// Attach without any producer task. Nothing drains the chip or wakes
    /// readers until the caller runs [`Self::service`].
    pub async fn attach_without_producer(
        transport: T,
        enable: Option<Box<dyn EnableLine>>,
        firmware: F,
        config: DriverConfig,
    ) -> Result<Self> {
        let tof = Self::build(transport, enable, firmware, &config);
        tof.bring_up(&config).await?;
        Ok(tof)
    }

    /// Attach with the interrupt line as producer, unless `config.poll_period`
    /// asks for polled I/O.
    pub async fn attach_with_interrupt<I: InterruptLine>(
        transport: T,
        enable: Option<Box<dyn EnableLine>>,
        irq: I,
        firmware: F,
        config: DriverConfig,
    ) -> Result<Self> {
        let tof = Self::build(transport, enable, firmware, &config);
        let shared = tof.shared.clone();
        let shutdown = tof.shared.shutdown.subscribe();
        let producer = if config.poll_period != 0 {
            tokio::spawn(poll_producer(shared, shutdown))
        } else {
            tokio::spawn(irq_producer(shared, irq, shutdown))
        };
        tof.set_producer(producer);
        tof.bring_up(&config).await?;
        Ok(tof)
    }

    fn build(transport: T, enable: Option<Box<dyn EnableLine>>, firmware: F, config: &DriverConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = ChipState::new(transport, enable, firmware, config, shutdown_rx, events.clone());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                data_ready: Notify::new(),
                shutdown,
                events,
            }),
            producer: StdMutex::new(None),
        }
    }

    fn set_producer(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.producer.lock() {
            *slot = Some(handle);
        }
    }

    async fn bring_up(&self, config: &DriverConfig) -> Result<()> {
        if !config.reset_on_attach {
            info!("Attached without reset");
            return Ok(());
        }
        let result = async {
            let mut state = self.shared.state.lock().await;
            state.hard_reset().await?;
            state.chip_mut().stop_measurements().await?;
            state.flush();
            Ok::<_, TofError>(())
        }
        .await;
        match result {
            Ok(()) => {
                info!("Attach ok");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Chip init failed");
                self.remove().await;
                Err(e)
            }
        }
    }

    /// Exclusive access to the driver state.
    pub async fn lock(&self) -> MutexGuard<'_, ChipState<T, F>> {
        self.shared.state.lock().await
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, ChipState<T, F>>> {
        self.shared.state.try_lock().map_err(|_| TofError::WouldBlock)
    }

    /// Run one producer step by hand: drain the chip and wake readers.
    pub async fn service(&self) {
        self.shared.service().await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InputEvent> {
        self.shared.events.subscribe()
    }

    /// Open a stream handle. The first handle brings the chip into application
    /// mode and reloads its configuration.
    pub async fn open(&self, flags: OpenFlags) -> Result<TofReader<T, F>> {
        if flags.access == Access::WriteOnly {
            return Err(TofError::InvalidArgument("the measurement stream is read-only".to_string()));
        }
        let mut state = self.shared.acquire(flags.nonblocking).await?;
        if state.is_removing() {
            return Err(TofError::NotSupported("device is being removed"));
        }
        state.open_count += 1;
        if state.open_count == 1 {
            info!("Opening measurement stream");
            if let Err(e) = state.set_mode(Mode::Application).await {
                error!(error = %e, "Chip init failed");
                state.open_count -= 1;
                return Err(e);
            }
        }
        Ok(TofReader {
            shared: self.shared.clone(),
            nonblocking: flags.nonblocking,
            closed: false,
        })
    }

    pub async fn suspend(&self) -> Result<()> {
        self.lock().await.suspend().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.lock().await.resume().await
    }

    /// Tear the device down: cancel any firmware wait, stop the producer, power
    /// off and end every reader's stream.
    pub async fn remove(&self) {
        let _ = self.shared.shutdown.send(true);
        {
            let mut state = self.shared.state.lock().await;
            if let Err(e) = state.power_off().await {
                warn!(error = %e, "Power-off during removal failed");
            }
            state.mark_removing();
            state.flush();
        }
        self.shared.data_ready.notify_waiters();

        let producer = self.producer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = producer {
            if let Err(e) = handle.await {
                warn!(error = %e, "Producer task ended abnormally");
            }
        }
        info!("Device removed");
    }
}

impl<T: Transport, F: FirmwareSource> Drop for Tof<T, F> {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
    }
}

async fn poll_producer<T: Transport, F: FirmwareSource>(shared: Arc<Shared<T, F>>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.state.lock().await.poll_period();
    info!(period_us = period as u64 * POLL_PERIOD_UNIT_US, "Starting polling producer");
    loop {
        shared.service().await;
        let period = shared.state.lock().await.poll_period().max(1);
        let sleep = Duration::from_micros(period as u64 * POLL_PERIOD_UNIT_US);
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }
    debug!("Polling producer stopped");
}

async fn irq_producer<T: Transport, F: FirmwareSource, I: InterruptLine>(
    shared: Arc<Shared<T, F>>,
    mut irq: I,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting interrupt producer");
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            edge = irq.wait() => match edge {
                Ok(()) => shared.service().await,
                Err(e) => {
                    error!(error = %e, "Interrupt line failed");
                    break;
                }
            },
        }
    }
    debug!("Interrupt producer stopped");
}

/// A stream handle delivering whole framed messages.
pub struct TofReader<T: Transport, F: FirmwareSource> {
    shared: Arc<Shared<T, F>>,
    nonblocking: bool,
    closed: bool,
}

impl<T: Transport, F: FirmwareSource> TofReader<T, F> {
    /// Read as many whole messages as fit into `buf`.
    ///
    /// Blocks until at least one message is queued, unless the handle is
    /// non-blocking. Returns `Ok(0)` once the device is being removed. `buf`
    /// smaller than the next message is `InvalidArgument`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.shared.acquire(self.nonblocking).await?;
        let first = loop {
            if state.is_removing() {
                return Ok(0);
            }
            match state.queue().peek_next_length() {
                Some(len) => break len as usize,
                None if !state.queue().is_empty() => {
                    warn!(bytes = state.queue().len(), "Output queue holds no complete message, resetting");
                    state.flush();
                }
                None => {}
            }
            if self.nonblocking {
                return Err(TofError::NoData);
            }

            let notified = self.shared.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let mut shutdown = self.shared.shutdown.subscribe();
            drop(state);
            tokio::select! {
                _ = &mut notified => {}
                _ = cancelled(&mut shutdown) => return Ok(0),
            }
            state = self.shared.state.lock().await;
        };

        if buf.len() < first {
            return Err(TofError::InvalidArgument(format!(
                "read buffer of {} bytes, next message is {} bytes",
                buf.len(),
                first
            )));
        }
        let mut copied = 0;
        while let Some(next) = state.queue().peek_next_length() {
            if next as usize > buf.len() - copied {
                break;
            }
            copied += state.queue_mut().pop_message(&mut buf[copied..])?;
        }
        Ok(copied)
    }

    /// Read into a fresh buffer sized for the largest message.
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let n = self.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// True when a read would not block.
    pub async fn poll_readable(&self) -> Result<bool> {
        let state = self.shared.acquire(self.nonblocking).await?;
        Ok(!state.queue().is_empty() || state.is_removing())
    }

    pub async fn flush(&self) -> Result<()> {
        self.shared.acquire(self.nonblocking).await?.flush();
        Ok(())
    }

    pub async fn hard_reset(&self) -> Result<()> {
        let mut state = self.shared.acquire(self.nonblocking).await?;
        state
            .hard_reset()
            .await
            .inspect_err(|e| error!(error = %e, "Hard reset failed"))
    }

    /// Release the handle; the last one flushes the queue.
    pub async fn close(mut self) {
        self.closed = true;
        self.shared.release().await;
    }
}

impl<T: Transport, F: FirmwareSource> Drop for TofReader<T, F> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { shared.release().await });
            }
            Err(_) => warn!("Stream handle dropped outside a runtime, open count not released"),
        }
    }
}
