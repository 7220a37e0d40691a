//! Inventory engine.
//!
//! Owns the transport and three kinds of threads:
//!
//! - the reader thread, which feeds every received byte to the
//!   [`StreamDispatcher`] and completes pending waits,
//! - at most one inventory worker (bounded, continuous or idle run),
//! - the control thread, which drains [`ControlEvent`]s sent from other
//!   contexts (door logic, sensor interrupts).
//!
//! Caller threads use [`InventoryEngine::execute_and_wait`] as a blocking
//! request/response primitive. Responses are matched to waiters by command id
//! only, so one request per id may be outstanding.
//!
//! Tag views, the dispatcher session, pending waits and the runtime tunables
//! live together under one mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::command::{Baudrate, CommandId, MemBank, WorkAntenna};
use crate::config::EngineConfig;
use crate::dispatcher::StreamDispatcher;
use crate::frame::Frame;
use crate::notify::InventoryObserver;
use crate::pending::{PendingCommands, WaitOutcome};
use crate::protocol::ReaderCommands;
use crate::tags::{TagDiff, TagStore};
use crate::transport::RfidTransport;
use crate::types::{AntennaSettings, RfidError};

/// Requests accepted by the control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Door opened: poll until stopped
    StartContinuous { require_final_result: bool },
    Stop,
    /// Plain content query over `cycles` poll cycles
    RunBounded { cycles: usize },
    /// Door closed: content query over the close-read number of cycles
    RunClosing,
    FindBrokenLabels { iterations: usize },
    ReportContents,
}

struct EngineState {
    dispatcher: StreamDispatcher,
    tags: TagStore,
    pending: PendingCommands,
    poll_count: usize,
    close_read_attempts: usize,
    poll_interval: Duration,
}

/// Stop side of an inventory worker: disconnected means stop
struct StopSignal(Receiver<()>);

impl StopSignal {
    /// Sleep for `duration`; returns true if a stop was requested meanwhile
    fn pause(&self, duration: Duration) -> bool {
        !matches!(self.0.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }

    fn is_stopped(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Disconnected) | Ok(()))
    }
}

/// The active inventory worker. Dropping it stops and joins the thread.
struct InventoryRun {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for InventoryRun {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            debug!("Reset with join.");
            if handle.join().is_err() {
                error!("inventory worker panicked");
            }
        }
    }
}

struct Shared<T: RfidTransport> {
    transport: Mutex<Option<T>>,
    state: Mutex<EngineState>,
    run: Mutex<Option<InventoryRun>>,
    commands: ReaderCommands,
    config: EngineConfig,
    observer: Arc<dyn InventoryObserver>,
    initialized: AtomicBool,
    reading: AtomicBool,
    inventory_active: AtomicBool,
}

impl<T: RfidTransport + 'static> Shared<T> {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn mark_failed(&self) {
        self.initialized.store(false, Ordering::Release);
        self.reading.store(false, Ordering::Release);
    }

    fn send(&self, frame: &Frame) -> Result<(), RfidError> {
        if !self.is_initialized() {
            return Err(RfidError::NotInitialized);
        }
        let mut transport = self.transport.lock();
        let transport = transport.as_mut().ok_or(RfidError::NotInitialized)?;
        match transport.write(frame.as_bytes()) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("serial write failed: {:?}", e);
                self.mark_failed();
                Err(RfidError::Transport(format!("{:?}", e)))
            }
        }
    }

    /// Send `frame` and block until `expect` completes or `timeout` elapses
    fn request(
        &self,
        frame: &Frame,
        expect: CommandId,
        timeout: Duration,
    ) -> Result<WaitOutcome, RfidError> {
        let waiter = self.state.lock().pending.register(expect);
        self.send(frame)?;
        Ok(waiter.wait(timeout))
    }

    fn read_loop(&self) {
        let mut buf = [0u8; 64];
        let slice = self.config.read_slice_ms.min(u32::MAX as u64) as u32;
        while self.reading.load(Ordering::Acquire) {
            let result = {
                let mut transport = self.transport.lock();
                match transport.as_mut() {
                    Some(transport) => transport.read(&mut buf, slice),
                    None => break,
                }
            };
            match result {
                Ok(n) => {
                    for &byte in &buf[..n] {
                        self.on_byte(byte);
                    }
                }
                Err(e) => {
                    error!("serial read failed: {:?}", e);
                    self.mark_failed();
                    break;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        debug!("reader thread stopped");
    }

    fn on_byte(&self, byte: u8) {
        let mut state = self.state.lock();
        let Some(cid) = state.dispatcher.push(byte) else {
            return;
        };
        let state = &mut *state;

        for (cmd, read) in state.dispatcher.session_mut().take_tag_reads() {
            let announced = read.tag_count as usize;
            let received = state.tags.record(read);
            let buffered = matches!(
                cmd,
                CommandId::GetInventoryBuffer | CommandId::GetAndResetInventoryBuffer
            );
            if buffered && announced != 0 && announced == received {
                state.pending.complete(CommandId::AllTagsReceived);
            }
        }
        match state.dispatcher.session_mut().take_last_error() {
            Some((cmd, err)) if cmd == cid => {
                if cmd == CommandId::GetAndResetInventoryBuffer {
                    state.pending.complete(CommandId::AllTagsReceived);
                }
                state.pending.reject(cid, err);
            }
            _ => {
                state.pending.complete(cid);
            }
        }
    }

    /// One poll: settle, inventory, buffer count, buffer read
    fn poll(&self, stop: &StopSignal) -> Result<(), RfidError> {
        if stop.pause(self.config.settle_delay()) {
            return Ok(());
        }
        let timeout = self.config.command_timeout();

        let inventory = self.commands.inventory(self.config.inventory_repeat);
        self.request(&inventory, CommandId::Inventory, timeout)?;

        let waiter = {
            let mut state = self.state.lock();
            state.dispatcher.session_mut().set_tag_count(0);
            state.pending.register(CommandId::GetInventoryBufferTagCount)
        };
        self.send(&self.commands.get_inventory_buffer_tag_count())?;
        let tag_count = match waiter.wait(timeout) {
            WaitOutcome::Completed => self.state.lock().dispatcher.session().tag_count(),
            _ => 0,
        };
        debug!("In buffer {} tag counts", tag_count);
        if tag_count == 0 {
            error!("Tags count is 0.");
            return Ok(());
        }

        let waiter = {
            let mut state = self.state.lock();
            state.tags.begin_buffer_read();
            state.pending.register(CommandId::AllTagsReceived)
        };
        self.send(&self.commands.get_and_reset_inventory_buffer())?;
        waiter.wait(self.config.all_tags_timeout());

        let received = {
            let mut state = self.state.lock();
            let received = state.tags.pending_len();
            state.tags.absorb_pending();
            received
        };
        if received != tag_count as usize {
            error!("Received tags count is {} [{}].", received, tag_count);
        } else {
            debug!("Received tags count is {} [{}].", received, tag_count);
        }
        Ok(())
    }

    /// Clear the cycle, poll `attempts` times, diff and commit.
    /// Returns `None` when stopped mid-cycle.
    fn cycle(&self, attempts: usize, stop: &StopSignal) -> Result<Option<TagDiff>, RfidError> {
        self.state.lock().tags.begin_cycle();
        for attempt in 0..attempts.max(1) {
            debug!("STEP: {}", attempt);
            self.poll(stop)?;
            if stop.is_stopped() {
                return Ok(None);
            }
        }
        let mut state = self.state.lock();
        let diff = state.tags.diff();
        state.tags.commit_cycle();
        Ok(Some(diff))
    }

    /// `cycles` cycles of one poll each, then a single report
    fn run_bounded(&self, cycles: usize, diagnostic: bool, stop: &StopSignal) -> Result<(), RfidError> {
        debug!("Inventory thread start.");
        self.state.lock().tags.begin_run(diagnostic);
        for i in 0..cycles {
            if self.cycle(1, stop)?.is_none() {
                return Ok(());
            }
            let interval = self.state.lock().poll_interval;
            if i + 1 < cycles && stop.pause(interval) {
                return Ok(());
            }
        }
        debug!("Inventory thread complete.");

        if diagnostic {
            let tags = self.state.lock().tags.probability_counts();
            self.observer.report_probability_buffer(&tags);
        } else {
            let tags = self.state.lock().tags.accumulated_counts();
            self.observer.report_current_contents(&tags);
        }
        Ok(())
    }

    fn run_continuous(&self, require_final_result: bool, stop: &StopSignal) -> Result<(), RfidError> {
        self.state.lock().tags.begin_run(false);
        while !stop.is_stopped() {
            let (attempts, interval) = {
                let state = self.state.lock();
                let attempts = if require_final_result { state.poll_count } else { 1 };
                (attempts, state.poll_interval)
            };
            let Some(diff) = self.cycle(attempts, stop)? else {
                break;
            };
            if require_final_result && !diff.is_empty() {
                self.observer.report_product_change(&diff.removed, &diff.added);
            }
            if stop.pause(interval) {
                break;
            }
        }
        Ok(())
    }

    fn run_idle(&self, stop: &StopSignal) -> Result<(), RfidError> {
        while !stop.pause(self.config.idle_interval()) {
            debug!("Periodic timeout is active.");
            self.state.lock().tags.begin_run(false);
            if self.cycle(1, stop)?.is_none() {
                break;
            }
            let tags = self.state.lock().tags.accumulated_counts();
            self.observer.report_current_contents(&tags);
        }
        Ok(())
    }
}

/// Start `body` as the inventory worker, stopping any active one first
fn start_run<T, F>(shared: &Arc<Shared<T>>, name: &str, body: F) -> Result<(), RfidError>
where
    T: RfidTransport + 'static,
    F: FnOnce(&Shared<T>, &StopSignal) -> Result<(), RfidError> + Send + 'static,
{
    if !shared.is_initialized() {
        return Err(RfidError::NotInitialized);
    }
    let mut slot = shared.run.lock();
    drop(slot.take());

    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    let worker = Arc::clone(shared);
    shared.inventory_active.store(true, Ordering::Release);
    let spawned = thread::Builder::new()
        .name(format!("rfid-{}", name))
        .spawn(move || {
            if let Err(e) = body(&*worker, &StopSignal(stop_rx)) {
                error!("inventory stopped: {}", e);
            }
            worker.inventory_active.store(false, Ordering::Release);
        });
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            shared.inventory_active.store(false, Ordering::Release);
            return Err(e.into());
        }
    };

    *slot = Some(InventoryRun {
        stop: Some(stop_tx),
        handle: Some(handle),
    });
    Ok(())
}

fn stop_run<T: RfidTransport>(shared: &Shared<T>) {
    let run = shared.run.lock().take();
    drop(run);
}

fn handle_event<T: RfidTransport + 'static>(shared: &Arc<Shared<T>>, event: ControlEvent) {
    debug!("control event {:?}", event);
    let result = match event {
        ControlEvent::StartContinuous { require_final_result } => {
            start_run(shared, "continuous", move |s, stop| {
                s.run_continuous(require_final_result, stop)
            })
        }
        ControlEvent::Stop => {
            stop_run(shared);
            Ok(())
        }
        ControlEvent::RunBounded { cycles } => {
            start_run(shared, "bounded", move |s, stop| s.run_bounded(cycles, false, stop))
        }
        ControlEvent::RunClosing => {
            let cycles = shared.state.lock().close_read_attempts;
            start_run(shared, "closing", move |s, stop| s.run_bounded(cycles, false, stop))
        }
        ControlEvent::FindBrokenLabels { iterations } => {
            start_run(shared, "labels", move |s, stop| {
                s.run_bounded(iterations.max(1), true, stop)
            })
        }
        ControlEvent::ReportContents => {
            report_contents(shared);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("{:?} refused: {}", event, e);
    }
}

fn report_contents<T: RfidTransport>(shared: &Shared<T>) -> bool {
    if shared.inventory_active.load(Ordering::Acquire) {
        debug!("inventory is running, contents not reported");
        return false;
    }
    let tags = shared.state.lock().tags.accumulated_counts();
    shared.observer.report_current_contents(&tags);
    true
}

fn control_loop<T: RfidTransport + 'static>(
    shared: Arc<Shared<T>>,
    events: Receiver<ControlEvent>,
    shutdown: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(&shared, event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("control thread stopped");
}

/// RFID reader driver running inventory cycles in the background
pub struct InventoryEngine<T: RfidTransport + 'static> {
    shared: Arc<Shared<T>>,
    reader: Option<JoinHandle<()>>,
    events: Sender<ControlEvent>,
    shutdown: Option<Sender<()>>,
    control: Option<JoinHandle<()>>,
}

impl<T: RfidTransport + 'static> InventoryEngine<T> {
    /// Start the reader thread and check the reader answers the firmware
    /// query. A reader that stays silent leaves the engine uninitialized.
    pub fn new(transport: T, observer: Arc<dyn InventoryObserver>, config: EngineConfig) -> Self {
        let mut engine = Self::build(Some(transport), observer, config);
        engine.handshake();
        engine
    }

    fn build(transport: Option<T>, observer: Arc<dyn InventoryObserver>, config: EngineConfig) -> Self {
        let state = EngineState {
            dispatcher: StreamDispatcher::new(),
            tags: TagStore::new(),
            pending: PendingCommands::new(),
            poll_count: config.poll_count,
            close_read_attempts: config.close_read_attempts,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        };
        let shared = Arc::new(Shared {
            transport: Mutex::new(transport),
            state: Mutex::new(state),
            run: Mutex::new(None),
            commands: ReaderCommands::new(config.reader_address),
            config,
            observer,
            initialized: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            inventory_active: AtomicBool::new(false),
        });

        let (events, events_rx) = channel::unbounded();
        let (shutdown, shutdown_rx) = channel::bounded::<()>(0);
        let control_shared = Arc::clone(&shared);
        let control = thread::Builder::new()
            .name("rfid-control".into())
            .spawn(move || control_loop(control_shared, events_rx, shutdown_rx))
            .map_err(|e| error!("control thread failed to start: {}", e))
            .ok();

        Self {
            shared,
            reader: None,
            events,
            shutdown: Some(shutdown),
            control,
        }
    }

    fn handshake(&mut self) {
        let shared = &self.shared;
        match shared.transport.lock().as_mut() {
            Some(transport) => {
                if let Err(e) = transport.clear_input() {
                    warn!("can't flush reader input: {:?}", e);
                }
            }
            None => return,
        }
        shared.initialized.store(true, Ordering::Release);
        shared.reading.store(true, Ordering::Release);

        let reader_shared = Arc::clone(shared);
        match thread::Builder::new()
            .name("rfid-reader".into())
            .spawn(move || reader_shared.read_loop())
        {
            Ok(handle) => self.reader = Some(handle),
            Err(e) => {
                error!("reader thread failed to start: {}", e);
                shared.mark_failed();
                return;
            }
        }

        let frame = shared.commands.get_firmware_version();
        let outcome = shared.request(&frame, CommandId::GetFirmwareVersion, shared.config.command_timeout());
        let firmware = shared.state.lock().dispatcher.session().firmware();
        match (outcome, firmware) {
            (Ok(WaitOutcome::Completed), Some((major, minor))) => {
                info!("reader firmware {}.{}", major, minor);
            }
            _ => {
                error!("reader did not answer the firmware query");
                self.stop_reader();
            }
        }
    }

    fn stop_reader(&mut self) {
        self.shared.mark_failed();
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                error!("reader thread panicked");
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_initialized()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Firmware version reported during the handshake
    pub fn firmware_version(&self) -> Option<(u8, u8)> {
        self.shared.state.lock().dispatcher.session().firmware()
    }

    /// Whether an inventory worker is currently polling
    pub fn is_inventory_running(&self) -> bool {
        self.shared.inventory_active.load(Ordering::Acquire)
    }

    /// Build the request for a raw command id and payload
    fn raw_request(&self, id: u8, payload: &[u8]) -> Result<(Frame, CommandId), RfidError> {
        let cmd = CommandId::try_from(id).map_err(RfidError::UnsupportedCommand)?;
        let c = &self.shared.commands;
        let invalid = |what: &str, value: u8| {
            RfidError::InvalidParameter(format!("{}: bad {} {:#04x}", cmd, what, value))
        };

        let frame = match (cmd, payload) {
            (CommandId::Reset, []) => c.reset(),
            (CommandId::SetUartBaudrate, [b]) => {
                c.set_uart_baudrate(Baudrate::try_from(*b).map_err(|v| invalid("baud rate", v))?)
            }
            (CommandId::GetFirmwareVersion, []) => c.get_firmware_version(),
            (CommandId::SetWorkAntenna, [a]) => {
                c.set_work_antenna(WorkAntenna::try_from(*a).map_err(|v| invalid("antenna", v))?)
            }
            (CommandId::GetWorkAntenna, []) => c.get_work_antenna(),
            (CommandId::SetOutputPower, [p]) => c.set_output_power([*p; WorkAntenna::COUNT]),
            (CommandId::SetOutputPower, [p1, p2, p3, p4]) => c.set_output_power([*p1, *p2, *p3, *p4]),
            (CommandId::GetOutputPower, []) => c.get_output_power(),
            (CommandId::SetFrequencyRegion, [region, start, end]) => {
                c.set_frequency_region(*region, *start, *end)
            }
            (CommandId::SetFrequencyRegion, [region, freq]) => {
                c.set_frequency_region(*region, *freq, *freq)
            }
            (CommandId::GetFrequencyRegion, []) => c.get_frequency_region(),
            (CommandId::Inventory, []) => c.inventory(0),
            (CommandId::Inventory, [repeat]) => c.inventory(*repeat),
            (CommandId::Read, []) => c.read(MemBank::Epc, 0, 1),
            (CommandId::Read, [bank]) => {
                c.read(MemBank::try_from(*bank).map_err(|v| invalid("memory bank", v))?, 0, 1)
            }
            (CommandId::GetInventoryBuffer, []) => c.get_inventory_buffer(),
            (CommandId::GetAndResetInventoryBuffer, []) => c.get_and_reset_inventory_buffer(),
            (CommandId::GetInventoryBufferTagCount, []) => c.get_inventory_buffer_tag_count(),
            (CommandId::ResetInventoryBuffer, []) => c.reset_inventory_buffer(),
            (CommandId::AllTagsReceived, _) => return Err(RfidError::UnsupportedCommand(id)),
            (cmd, payload) => {
                return Err(RfidError::InvalidParameter(format!(
                    "{}: unexpected payload length {}",
                    cmd,
                    payload.len()
                )));
            }
        };
        Ok((frame, cmd))
    }

    /// Send a raw command without waiting for its answer
    pub fn execute(&self, id: u8, payload: &[u8]) -> Result<(), RfidError> {
        let (frame, _) = self.raw_request(id, payload)?;
        self.shared.send(&frame)
    }

    /// Send a raw command and block until the reader answers it or the
    /// command timeout elapses. An error status from the reader is returned
    /// as [`RfidError::Device`].
    pub fn execute_and_wait(&self, id: u8, payload: &[u8]) -> Result<WaitOutcome, RfidError> {
        let (frame, cmd) = self.raw_request(id, payload)?;
        match self
            .shared
            .request(&frame, cmd, self.shared.config.command_timeout())?
        {
            WaitOutcome::Rejected(err) => Err(err.into()),
            outcome => Ok(outcome),
        }
    }

    /// Poll until [`stop_inventory`](Self::stop_inventory). With
    /// `require_final_result` every cycle merges [`poll_count`](Self::poll_count)
    /// polls and non-empty changes are reported to the observer; otherwise a
    /// cycle is a single poll.
    pub fn start_continuous(&self, require_final_result: bool) -> Result<(), RfidError> {
        start_run(&self.shared, "continuous", move |s, stop| {
            s.run_continuous(require_final_result, stop)
        })
    }

    /// Stop the active inventory run and wait for its worker to finish
    pub fn stop_inventory(&self) {
        stop_run(&self.shared);
    }

    /// Run `cycles` poll cycles in the background, then report the
    /// accumulated contents, or the occurrence counts when `diagnostic`
    pub fn run_bounded(&self, cycles: usize, diagnostic: bool) -> Result<(), RfidError> {
        start_run(&self.shared, "bounded", move |s, stop| {
            s.run_bounded(cycles, diagnostic, stop)
        })
    }

    /// Content query over [`close_read_attempts`](Self::close_read_attempts)
    /// cycles
    pub fn run_closing(&self) -> Result<(), RfidError> {
        let cycles = self.close_read_attempts();
        self.run_bounded(cycles, false)
    }

    /// Diagnostic run over `iterations` cycles (at least one)
    pub fn find_broken_labels(&self, iterations: usize) -> Result<(), RfidError> {
        self.run_bounded(iterations.max(1), true)
    }

    /// Every `idle_interval`, poll once and report the current contents
    pub fn start_idle_inventory(&self) -> Result<(), RfidError> {
        start_run(&self.shared, "idle", |s, stop| s.run_idle(stop))
    }

    /// Query the frequency region and output power. `None` while an
    /// inventory runs or when the reader is not initialized.
    pub fn antenna_settings(&self) -> Option<AntennaSettings> {
        let shared = &self.shared;
        if !shared.is_initialized() || self.is_inventory_running() {
            return None;
        }
        let timeout = shared.config.command_timeout();
        let region = shared
            .request(&shared.commands.get_frequency_region(), CommandId::GetFrequencyRegion, timeout)
            .ok()?;
        let power = shared
            .request(&shared.commands.get_output_power(), CommandId::GetOutputPower, timeout)
            .ok()?;
        if !region.is_completed() || !power.is_completed() {
            warn!("antenna settings may be stale");
        }
        Some(shared.state.lock().dispatcher.session().antenna_settings())
    }

    /// [`antenna_settings`](Self::antenna_settings) as the JSON fragment
    /// embedded in status messages
    pub fn antenna_settings_text(&self) -> Option<String> {
        self.antenna_settings().map(|settings| settings.to_string())
    }

    pub fn set_poll_count(&self, count: usize) {
        self.shared.state.lock().poll_count = count;
    }

    pub fn poll_count(&self) -> usize {
        self.shared.state.lock().poll_count
    }

    pub fn set_close_read_attempts(&self, count: usize) {
        self.shared.state.lock().close_read_attempts = count;
    }

    pub fn close_read_attempts(&self) -> usize {
        self.shared.state.lock().close_read_attempts
    }

    /// Pause between poll cycles, in milliseconds
    pub fn set_poll_interval(&self, ms: u64) {
        self.shared.state.lock().poll_interval = Duration::from_millis(ms);
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.state.lock().poll_interval
    }

    /// Report the accumulated contents; refused while an inventory runs
    pub fn report_current_contents(&self) -> bool {
        report_contents(&self.shared)
    }

    /// Occurrence counts since the last diagnostic run
    pub fn probability_buffer(&self) -> Vec<(String, u32)> {
        self.shared.state.lock().tags.probability_counts()
    }

    /// Queue for requests from other contexts, handled on the control thread
    pub fn control(&self) -> Sender<ControlEvent> {
        self.events.clone()
    }
}

#[cfg(feature = "serial")]
impl InventoryEngine<crate::serial::SerialTransport> {
    /// Open a serial device and start the engine on it
    pub fn try_open(
        path: &str,
        observer: Arc<dyn InventoryObserver>,
        config: EngineConfig,
    ) -> Result<Self, RfidError> {
        let transport = crate::serial::SerialTransport::open(path, config.baud_rate)?;
        Ok(Self::new(transport, observer, config))
    }

    /// Like [`try_open`](Self::try_open), but a device that cannot be opened
    /// leaves the engine uninitialized
    pub fn open(path: &str, observer: Arc<dyn InventoryObserver>, config: EngineConfig) -> Self {
        match Self::try_open(path, Arc::clone(&observer), config.clone()) {
            Ok(engine) => engine,
            Err(e) => {
                error!("can't open {}: {}", path, e);
                Self::build(None, observer, config)
            }
        }
    }
}

impl<T: RfidTransport + 'static> Drop for InventoryEngine<T> {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.control.take() {
            if handle.join().is_err() {
                error!("control thread panicked");
            }
        }
        stop_run(&self.shared);
        self.stop_reader();
        self.shared.state.lock().pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::DeviceError;
    use crate::frame::BROADCAST_ADDRESS;
    use std::collections::VecDeque;
    use std::time::Instant;

    #[derive(Default)]
    struct ReaderState {
        rx: VecDeque<u8>,
        written: Vec<Frame>,
        silent: bool,
        broken: bool,
        // records announced but never streamed by a buffer read
        short_by: usize,
        // status answering every buffer read instead of its records
        buffer_error: Option<u8>,
        script: VecDeque<Vec<Vec<u8>>>,
        in_range: Vec<Vec<u8>>,
        buffered: Vec<Vec<u8>>,
    }

    impl ReaderState {
        fn reply(&mut self, cmd: CommandId, payload: &[u8]) {
            let frame = Frame::new(BROADCAST_ADDRESS, cmd as u8, payload);
            self.rx.extend(frame.as_bytes());
        }

        fn answer(&mut self, request: &Frame) {
            let Ok(cmd) = CommandId::try_from(request.command()) else {
                return;
            };
            match cmd {
                CommandId::GetFirmwareVersion => self.reply(cmd, &[0x01, 0x02]),
                CommandId::GetFrequencyRegion => self.reply(cmd, &[0x02, 0x00, 0x06]),
                CommandId::GetOutputPower => self.reply(cmd, &[0x1E]),
                CommandId::Inventory => {
                    if let Some(next) = self.script.pop_front() {
                        self.in_range = next;
                    }
                    self.buffered = self.in_range.clone();
                    let n = self.buffered.len() as u16;
                    let [hi, lo] = n.to_be_bytes();
                    self.reply(cmd, &[0x00, hi, lo, 0x00, 0x10, 0x00, 0x00, 0x00, 0x20]);
                }
                CommandId::GetInventoryBufferTagCount => {
                    let n = self.buffered.len() as u16;
                    self.reply(cmd, &n.to_be_bytes());
                }
                CommandId::GetAndResetInventoryBuffer => {
                    let tags = std::mem::take(&mut self.buffered);
                    if let Some(code) = self.buffer_error {
                        self.reply(cmd, &[code]);
                        return;
                    }
                    if tags.is_empty() {
                        self.reply(cmd, &[0x38]);
                    }
                    let [hi, lo] = (tags.len() as u16).to_be_bytes();
                    let streamed = tags.len().saturating_sub(self.short_by);
                    for epc in tags.into_iter().take(streamed) {
                        let mut record = vec![hi, lo, epc.len() as u8 + 4, 0x30, 0x00];
                        record.extend(&epc);
                        record.extend([0x12, 0x34, 0x50, 0x01, 0x01]);
                        self.reply(cmd, &record);
                    }
                }
                _ => self.reply(cmd, &[0x10]),
            }
        }
    }

    /// Scripted reader: answers each written request with well-formed frames
    #[derive(Clone, Default)]
    struct SimulatedReader {
        inner: Arc<Mutex<ReaderState>>,
    }

    impl SimulatedReader {
        fn with_cycles(cycles: &[&[&[u8]]]) -> Self {
            let reader = Self::default();
            reader.inner.lock().script = cycles
                .iter()
                .map(|tags| tags.iter().map(|epc| epc.to_vec()).collect())
                .collect();
            reader
        }

        fn silent() -> Self {
            let reader = Self::default();
            reader.inner.lock().silent = true;
            reader
        }

        fn set_silent(&self, silent: bool) {
            self.inner.lock().silent = silent;
        }

        fn written(&self, cmd: CommandId) -> usize {
            self.inner
                .lock()
                .written
                .iter()
                .filter(|f| f.command() == cmd as u8)
                .count()
        }
    }

    impl RfidTransport for SimulatedReader {
        type Error = std::io::Error;

        fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
            let mut state = self.inner.lock();
            if state.broken {
                return Err(std::io::Error::other("device unplugged"));
            }
            let frame = Frame::decode(data)
                .ok_or_else(|| std::io::Error::other("malformed request"))?;
            if !state.silent {
                state.answer(&frame);
            }
            state.written.push(frame);
            Ok(data.len())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, Self::Error> {
            let mut state = self.inner.lock();
            let len = state.rx.len().min(buf.len());
            for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..len)) {
                *slot = byte;
            }
            Ok(len)
        }

        fn clear_input(&mut self) -> Result<(), Self::Error> {
            self.inner.lock().rx.clear();
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        changes: Mutex<Vec<(Vec<String>, Vec<String>)>>,
        contents: Mutex<Vec<Vec<(String, u32)>>>,
        probability: Mutex<Vec<Vec<(String, u32)>>>,
    }

    impl InventoryObserver for RecordingObserver {
        fn report_product_change(&self, removed: &[String], added: &[String]) {
            self.changes.lock().push((removed.to_vec(), added.to_vec()));
        }

        fn report_current_contents(&self, tags: &[(String, u32)]) {
            self.contents.lock().push(tags.to_vec());
        }

        fn report_probability_buffer(&self, tags: &[(String, u32)]) {
            self.probability.lock().push(tags.to_vec());
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig::builder()
            .command_timeout_ms(300)
            .all_tags_timeout_ms(500)
            .settle_delay_ms(0)
            .poll_interval_ms(1)
            .idle_interval_ms(20)
            .read_slice_ms(1)
            .build()
    }

    fn engine(reader: &SimulatedReader) -> (InventoryEngine<SimulatedReader>, Arc<RecordingObserver>) {
        engine_with(reader, fast_config())
    }

    fn engine_with(
        reader: &SimulatedReader,
        config: EngineConfig,
    ) -> (InventoryEngine<SimulatedReader>, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let engine = InventoryEngine::new(reader.clone(), observer.clone(), config);
        (engine, observer)
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // ===================
    // initialization
    // ===================

    #[test]
    fn test_handshake_initializes() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);
        assert!(engine.is_initialized());
        assert_eq!(engine.firmware_version(), Some((1, 2)));
    }

    #[test]
    fn test_silent_reader_stays_uninitialized() {
        let reader = SimulatedReader::silent();
        let (engine, _) = engine(&reader);
        assert!(!engine.is_initialized());
        assert!(matches!(engine.execute(0x70, &[]), Err(RfidError::NotInitialized)));
        assert!(matches!(engine.start_continuous(false), Err(RfidError::NotInitialized)));
        assert_eq!(engine.antenna_settings_text(), None);
    }

    #[test]
    fn test_write_failure_uninitializes() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);
        reader.inner.lock().broken = true;
        assert!(matches!(engine.execute(0x77, &[]), Err(RfidError::Transport(_))));
        assert!(!engine.is_initialized());
        assert!(matches!(engine.execute(0x77, &[]), Err(RfidError::NotInitialized)));
    }

    // ===================
    // command execution
    // ===================

    #[test]
    fn test_timeout_then_recovers() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);

        reader.set_silent(true);
        let started = Instant::now();
        assert_eq!(engine.execute_and_wait(0x77, &[]).unwrap(), WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));

        reader.set_silent(false);
        assert_eq!(engine.execute_and_wait(0x77, &[]).unwrap(), WaitOutcome::Completed);
    }

    #[test]
    fn test_error_status_is_device_error() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);

        // nothing buffered: the reader answers "Buffer is empty."
        let result = engine.execute_and_wait(CommandId::GetAndResetInventoryBuffer as u8, &[]);
        assert!(matches!(result, Err(RfidError::Device(DeviceError(0x38)))));
        assert!(engine.is_initialized());
    }

    #[test]
    fn test_raw_payload_mapping() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);

        assert_eq!(engine.execute_and_wait(0x76, &[0x30]).unwrap(), WaitOutcome::Completed);
        let sent = reader.inner.lock().written.last().cloned().unwrap();
        assert_eq!(sent.payload(), &[0x00, 0x00, 0x00, 0x00]);

        engine.execute(0x78, &[0x01, 0x05]).unwrap();
        let sent = reader.inner.lock().written.last().cloned().unwrap();
        assert_eq!(sent.payload(), &[0x01, 0x05, 0x05]);

        engine.execute(0x81, &[]).unwrap();
        let sent = reader.inner.lock().written.last().cloned().unwrap();
        assert_eq!(sent.payload(), &[0x01, 0x00, 0x01]);

        assert!(matches!(engine.execute(0x76, &[1, 2]), Err(RfidError::InvalidParameter(_))));
        assert!(matches!(engine.execute(0x71, &[0x09]), Err(RfidError::InvalidParameter(_))));
        assert!(matches!(engine.execute(0x42, &[]), Err(RfidError::UnsupportedCommand(0x42))));
        assert!(matches!(engine.execute(0x94, &[]), Err(RfidError::UnsupportedCommand(0x94))));
    }

    #[test]
    fn test_antenna_settings_text() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);
        assert_eq!(
            engine.antenna_settings_text().as_deref(),
            Some(
                "\"frequencyRegion\":{\"startFrequency\":0,\"endFrequency\":6,\"region\":2},\"powers\":[30,30,30,30]"
            )
        );
    }

    #[test]
    fn test_runtime_tunables() {
        let reader = SimulatedReader::default();
        let (engine, _) = engine(&reader);
        engine.set_poll_count(2);
        engine.set_close_read_attempts(5);
        engine.set_poll_interval(250);
        assert_eq!(engine.poll_count(), 2);
        assert_eq!(engine.close_read_attempts(), 5);
        assert_eq!(engine.poll_interval(), Duration::from_millis(250));
    }

    // ===================
    // inventory runs
    // ===================

    #[test]
    fn test_bounded_run_reports_once() {
        let reader = SimulatedReader::with_cycles(&[&[&[0xAA, 0x01], &[0xBB, 0x02]]]);
        let (engine, observer) = engine(&reader);

        engine.run_bounded(3, false).unwrap();
        wait_until("bounded run", || !observer.contents.lock().is_empty());
        wait_until("worker exit", || !engine.is_inventory_running());

        assert_eq!(reader.written(CommandId::Inventory), 3);
        assert_eq!(reader.written(CommandId::GetAndResetInventoryBuffer), 3);
        let contents = observer.contents.lock();
        assert_eq!(contents.len(), 1);
        let epcs: Vec<&str> = contents[0].iter().map(|(epc, _)| epc.as_str()).collect();
        assert_eq!(epcs, vec!["AA01", "BB02"]);
        assert!(observer.changes.lock().is_empty());
    }

    #[test]
    fn test_continuous_reports_diff() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x0A], &[0x0B]], &[&[0x0B], &[0x0C]]]);
        let (engine, observer) = engine(&reader);

        engine.start_continuous(true).unwrap();
        wait_until("two product changes", || observer.changes.lock().len() >= 2);
        // later cycles repeat {B, C} and must stay quiet
        wait_until("third cycle", || reader.written(CommandId::Inventory) >= 4);
        engine.stop_inventory();
        assert!(!engine.is_inventory_running());

        let changes = observer.changes.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], (vec![], strings(&["0A", "0B"])));
        assert_eq!(changes[1], (strings(&["0A"]), strings(&["0C"])));
    }

    #[test]
    fn test_bounded_run_polls_once_per_cycle() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let (engine, observer) = engine(&reader);
        engine.set_poll_count(2);

        engine.run_bounded(3, false).unwrap();
        wait_until("bounded run", || !observer.contents.lock().is_empty());
        wait_until("worker exit", || !engine.is_inventory_running());
        assert_eq!(reader.written(CommandId::Inventory), 3);
    }

    #[test]
    fn test_settle_delay_precedes_inventory() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let config = EngineConfig::builder()
            .command_timeout_ms(300)
            .all_tags_timeout_ms(500)
            .settle_delay_ms(400)
            .read_slice_ms(1)
            .build();
        let (engine, observer) = engine_with(&reader, config);

        engine.run_bounded(1, false).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(reader.written(CommandId::Inventory), 0);
        wait_until("bounded run", || !observer.contents.lock().is_empty());
        assert_eq!(reader.written(CommandId::Inventory), 1);
    }

    #[test]
    fn test_closing_run_uses_close_read_attempts_as_cycles() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let (engine, observer) = engine(&reader);
        engine.set_close_read_attempts(2);
        engine.set_poll_count(4);

        engine.run_closing().unwrap();
        wait_until("closing report", || !observer.contents.lock().is_empty());
        wait_until("worker exit", || !engine.is_inventory_running());
        assert_eq!(reader.written(CommandId::Inventory), 2);
        assert_eq!(observer.contents.lock().len(), 1);
    }

    #[test]
    fn test_continuous_merges_polls_of_one_cycle() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x0A]], &[&[0x0B]]]);
        let (engine, observer) = engine(&reader);
        engine.set_poll_count(2);

        engine.start_continuous(true).unwrap();
        wait_until("first product change", || !observer.changes.lock().is_empty());
        engine.stop_inventory();

        assert_eq!(observer.changes.lock()[0], (vec![], strings(&["0A", "0B"])));
    }

    #[test]
    fn test_short_buffer_read_keeps_what_arrived() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01], &[0x02]]]);
        reader.inner.lock().short_by = 1;
        let (engine, observer) = engine(&reader);

        let started = Instant::now();
        engine.run_bounded(1, false).unwrap();
        wait_until("bounded run", || !observer.contents.lock().is_empty());
        // all-tags wait ran out before the cycle went on
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(observer.contents.lock()[0], vec![("01".to_string(), 1)]);
    }

    #[test]
    fn test_buffer_read_error_ends_all_tags_wait() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01], &[0x02]]]);
        reader.inner.lock().buffer_error = Some(0x38);
        let config = EngineConfig::builder()
            .command_timeout_ms(300)
            .all_tags_timeout_ms(10_000)
            .settle_delay_ms(0)
            .read_slice_ms(1)
            .build();
        let (engine, observer) = engine_with(&reader, config);

        let started = Instant::now();
        engine.run_bounded(1, false).unwrap();
        wait_until("bounded run", || !observer.contents.lock().is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(observer.contents.lock()[0].is_empty());
    }

    #[test]
    fn test_continuous_without_final_result_is_quiet() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]], &[&[0x02]]]);
        let (engine, observer) = engine(&reader);

        engine.start_continuous(false).unwrap();
        wait_until("a few cycles", || reader.written(CommandId::Inventory) >= 3);
        engine.stop_inventory();
        assert!(observer.changes.lock().is_empty());
    }

    #[test]
    fn test_empty_buffer_skips_read() {
        let reader = SimulatedReader::default();
        let (engine, observer) = engine(&reader);

        engine.run_bounded(2, false).unwrap();
        wait_until("bounded run", || !observer.contents.lock().is_empty());
        assert_eq!(reader.written(CommandId::GetInventoryBufferTagCount), 2);
        assert_eq!(reader.written(CommandId::GetAndResetInventoryBuffer), 0);
        assert!(observer.contents.lock()[0].is_empty());
    }

    #[test]
    fn test_find_broken_labels_counts_occurrences() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01], &[0x02]], &[&[0x01]]]);
        let (engine, observer) = engine(&reader);

        engine.find_broken_labels(2).unwrap();
        wait_until("probability report", || !observer.probability.lock().is_empty());
        assert_eq!(
            observer.probability.lock()[0],
            vec![("01".to_string(), 2), ("02".to_string(), 1)]
        );
        assert_eq!(engine.probability_buffer().len(), 2);
    }

    #[test]
    fn test_find_broken_labels_zero_runs_once() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let (engine, observer) = engine(&reader);

        engine.find_broken_labels(0).unwrap();
        wait_until("probability report", || !observer.probability.lock().is_empty());
        assert_eq!(reader.written(CommandId::Inventory), 1);
    }

    #[test]
    fn test_new_run_replaces_active_one() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let (engine, observer) = engine(&reader);

        engine.start_continuous(false).unwrap();
        wait_until("first cycle", || reader.written(CommandId::Inventory) >= 1);
        engine.run_bounded(1, false).unwrap();
        wait_until("bounded report", || !observer.contents.lock().is_empty());
        assert_eq!(observer.contents.lock().len(), 1);
    }

    #[test]
    fn test_report_contents_refused_while_running() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let (engine, observer) = engine(&reader);

        engine.start_continuous(false).unwrap();
        assert!(!engine.report_current_contents());
        assert!(engine.antenna_settings().is_none());
        engine.stop_inventory();
        assert!(engine.report_current_contents());
        assert_eq!(observer.contents.lock().len(), 1);
    }

    #[test]
    fn test_idle_inventory_reports_periodically() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x01]]]);
        let (engine, observer) = engine(&reader);

        engine.start_idle_inventory().unwrap();
        wait_until("two idle reports", || observer.contents.lock().len() >= 2);
        engine.stop_inventory();
        assert_eq!(observer.contents.lock()[0], vec![("01".to_string(), 1)]);
    }

    #[test]
    fn test_control_queue() {
        let reader = SimulatedReader::with_cycles(&[&[&[0x0A]]]);
        let (engine, observer) = engine(&reader);
        let control = engine.control();

        control.send(ControlEvent::StartContinuous { require_final_result: true }).unwrap();
        wait_until("door open report", || !observer.changes.lock().is_empty());
        control.send(ControlEvent::Stop).unwrap();
        wait_until("stop", || !engine.is_inventory_running());

        control.send(ControlEvent::RunClosing).unwrap();
        wait_until("closing report", || !observer.contents.lock().is_empty());
        assert_eq!(observer.changes.lock()[0], (vec![], strings(&["0A"])));
    }
}
