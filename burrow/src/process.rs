//! Execution units.
//!
//! A [`Process`] is one schedulable script: its virtual address space, its
//! register file, a run state and the wall clock the watchdog is measured
//! against. The machine creates processes; a processor drives them.
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    MemoryView, NativeThread, PeripheralCall, PeripheralFunctionId, RunHandle, ValueCell,
    VirtualMemory, VmError, VmResult, machine::MachineShared,
};

pub const INVALID_PROCESS_ID: i32 = -1;
pub const DEFAULT_WATCHDOG_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Wired up, clock not started.
    Ready,
    Running,
    /// Finished normally or disposed. Terminal.
    Stopped,
    /// The watchdog fired or an instruction failed. Stays until disposed.
    Faulted,
}

/// The five views the memory part carves for one process.
#[derive(Debug, Clone)]
pub struct ProcessSegments {
    pub program: MemoryView,
    pub global: MemoryView,
    pub heap: MemoryView,
    pub stack: MemoryView,
    pub registers: MemoryView,
}

impl ProcessSegments {
    pub fn views(&self) -> [&MemoryView; 5] {
        [
            &self.program,
            &self.global,
            &self.heap,
            &self.stack,
            &self.registers,
        ]
    }
}

#[derive(Debug, Default)]
struct Stopwatch {
    started: Option<Instant>,
    accumulated: Duration,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => self.accumulated + started.elapsed(),
            None => self.accumulated,
        }
    }
}

pub struct Process {
    id: i32,
    segments: ProcessSegments,
    memory: VirtualMemory,
    state: Mutex<ProcessState>,
    clock: Mutex<Stopwatch>,
    watchdog_ms: AtomicU64,
    disposed: AtomicBool,
    /// Set while a background run may still touch the segments.
    run_active: Mutex<bool>,
    released: AtomicBool,
    machine: Weak<MachineShared>,
}

impl Process {
    pub(crate) fn new(
        id: i32,
        segments: ProcessSegments,
        watchdog_ms: u64,
        machine: Weak<MachineShared>,
    ) -> Self {
        let memory = VirtualMemory::new(
            segments.program.clone(),
            segments.global.clone(),
            segments.heap.clone(),
            segments.stack.clone(),
        );
        Self {
            id,
            segments,
            memory,
            state: Mutex::new(ProcessState::Ready),
            clock: Mutex::new(Stopwatch::default()),
            watchdog_ms: AtomicU64::new(watchdog_ms),
            disposed: AtomicBool::new(false),
            run_active: Mutex::new(false),
            released: AtomicBool::new(false),
            machine,
        }
    }

    /// A process with no owning machine. It can be driven by a processor
    /// directly but cannot `run` or call peripherals.
    pub fn detached(id: i32, segments: ProcessSegments) -> Self {
        Self::new(id, segments, DEFAULT_WATCHDOG_MS, Weak::new())
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn virtual_memory(&self) -> &VirtualMemory {
        &self.memory
    }

    pub fn registers(&self) -> &MemoryView {
        &self.segments.registers
    }

    pub fn segments(&self) -> &ProcessSegments {
        &self.segments
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // ── Clock and watchdog ────────────────────────────────────────────

    /// Elapsed running time in nanoseconds, read at call time.
    pub fn running_time(&self) -> u64 {
        u64::try_from(self.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.lock().elapsed()
    }

    /// Milliseconds a single run may take before it is presumed stuck.
    /// Zero disables the watchdog.
    pub fn watchdog_threshold(&self) -> u64 {
        self.watchdog_ms.load(Ordering::Relaxed)
    }

    pub fn set_watchdog_threshold(&self, millis: u64) {
        self.watchdog_ms.store(millis, Ordering::Relaxed);
    }

    pub fn is_watchdog_expired(&self) -> bool {
        let threshold = self.watchdog_threshold();
        threshold != 0 && self.elapsed() > Duration::from_millis(threshold)
    }

    /// The watchdog error for the current clock reading.
    pub fn watchdog_error(&self) -> VmError {
        VmError::Watchdog {
            elapsed_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            threshold_ms: self.watchdog_threshold(),
        }
    }

    // ── State transitions ─────────────────────────────────────────────

    /// `Ready -> Running`, starting the clock.
    pub fn start(&self) -> VmResult<()> {
        if self.is_disposed() {
            return Err(VmError::Disposed);
        }
        let mut state = self.state.lock();
        if *state != ProcessState::Ready {
            return Err(VmError::invalid_argument(format!(
                "process {} cannot start from {:?}",
                self.id, *state
            )));
        }
        *state = ProcessState::Running;
        self.clock.lock().start();
        log::debug!("process {} running", self.id);
        Ok(())
    }

    /// `Running -> Stopped` on normal completion.
    pub fn stop(&self) {
        self.leave_running(ProcessState::Stopped);
    }

    /// `Running -> Faulted`.
    pub fn fault(&self) {
        self.leave_running(ProcessState::Faulted);
    }

    fn leave_running(&self, next: ProcessState) {
        let mut state = self.state.lock();
        if *state == ProcessState::Running {
            *state = next;
            self.clock.lock().stop();
            log::debug!("process {} {:?} after {:?}", self.id, next, self.elapsed());
        }
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Hands the process to the machine's processor on a background thread.
    /// Does not block; completion is observed through the returned handle.
    pub fn run(self: &Arc<Self>) -> VmResult<RunHandle> {
        let machine = self.machine.upgrade().ok_or(VmError::Disposed)?;
        let processor = machine.processor()?;
        // raised before the state change so a racing dispose defers its release
        *self.run_active.lock() = true;
        if let Err(err) = self.start() {
            self.finish_run();
            return Err(err);
        }

        let process = Arc::clone(self);
        NativeThread::spawn(format!("burrow-process-{}", self.id), move || {
            let outcome = processor.execute(&process);
            process.finish_run();
            outcome
        })
        .inspect_err(|_| {
            self.fault();
            self.finish_run();
        })
    }

    /// Called on the run thread once the processor let go of the segments.
    /// A dispose that arrived mid-run left the release to this point.
    fn finish_run(&self) {
        let mut active = self.run_active.lock();
        *active = false;
        if self.is_disposed() {
            drop(active);
            self.release_segments();
        }
    }

    pub(crate) fn belongs_to(&self, machine: &Arc<MachineShared>) -> bool {
        std::ptr::eq(self.machine.as_ptr(), Arc::as_ptr(machine))
    }

    /// Invokes a host function through the owning machine's firmware.
    pub fn call_peripheral(&self, id: PeripheralFunctionId, args: &[ValueCell]) -> VmResult<ValueCell> {
        let machine = self.machine.upgrade().ok_or(VmError::Disposed)?;
        let function = machine
            .peripheral_function(id)?
            .ok_or(VmError::UnknownPeripheralFunction(id.raw()))?;
        let mut call = PeripheralCall::new(self, args);
        function(&mut call)?;
        Ok(call.into_result())
    }

    // ── Disposal ──────────────────────────────────────────────────────

    /// Stops the process and returns its segments to the machine. Repeated
    /// calls do nothing.
    ///
    /// While a background run is in flight the segments stay allocated until
    /// that run returns; the processor notices the `Stopped` state and exits
    /// at its next check.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.state.lock();
            *state = ProcessState::Stopped;
        }
        self.clock.lock().stop();

        if *self.run_active.lock() {
            log::debug!("process {} disposed mid-run, release deferred", self.id);
            return;
        }
        self.release_segments();
        log::debug!("process {} disposed", self.id);
    }

    fn release_segments(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(machine) = self.machine.upgrade() {
            if let Err(err) = machine.release_process(&self.segments) {
                log::warn!("process {} released with error: {err}", self.id);
            }
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("watchdog_ms", &self.watchdog_threshold())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Pool, Segment};

    fn segments(cells: usize) -> ProcessSegments {
        let view = || MemoryView::whole(Pool::new(cells));
        ProcessSegments {
            program: view(),
            global: view(),
            heap: view(),
            stack: view(),
            registers: view(),
        }
    }

    #[test]
    fn test_new_process_is_ready_with_clock_stopped() {
        let process = Process::detached(7, segments(4));
        assert_eq!(process.id(), 7);
        assert_eq!(process.state(), ProcessState::Ready);
        assert_eq!(process.running_time(), 0);
        assert_eq!(process.watchdog_threshold(), DEFAULT_WATCHDOG_MS);
        assert!(!process.is_watchdog_expired());
    }

    #[test]
    fn test_virtual_memory_is_wired_to_segments() {
        let process = Process::detached(0, segments(4));
        process.segments().heap.set(1, 5i64).unwrap();
        let heap = process.virtual_memory().segment(Segment::Heap);
        assert!(heap.aliases(&process.segments().heap));
        assert_eq!(process.virtual_memory().read(0x0020_0001).unwrap().as_i64(), 5);
    }

    #[test]
    fn test_state_transitions() {
        let process = Process::detached(0, segments(4));
        process.start().unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.start().is_err());
        std::thread::sleep(Duration::from_millis(2));
        process.stop();
        assert_eq!(process.state(), ProcessState::Stopped);
        let frozen = process.running_time();
        assert!(frozen > 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(process.running_time(), frozen);

        // leaving Running only happens once
        process.fault();
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[test]
    fn test_running_time_advances_while_running() {
        let process = Process::detached(0, segments(4));
        process.start().unwrap();
        let first = process.running_time();
        std::thread::sleep(Duration::from_millis(2));
        assert!(process.running_time() > first);
    }

    #[test]
    fn test_watchdog_expiry() {
        let process = Process::detached(0, segments(4));
        process.set_watchdog_threshold(1);
        process.start().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(process.is_watchdog_expired());
        assert!(matches!(
            process.watchdog_error(),
            VmError::Watchdog { threshold_ms: 1, .. }
        ));

        process.set_watchdog_threshold(0);
        assert!(!process.is_watchdog_expired());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let process = Process::detached(0, segments(4));
        process.start().unwrap();
        process.dispose();
        assert_eq!(process.state(), ProcessState::Stopped);
        let time = process.running_time();
        process.dispose();
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.running_time(), time);
        assert!(process.is_disposed());
        assert!(matches!(process.start(), Err(VmError::Disposed)));
    }

    #[test]
    fn test_detached_process_cannot_run_or_call_out() {
        let process = Arc::new(Process::detached(0, segments(4)));
        assert!(matches!(process.run(), Err(VmError::Disposed)));
        assert_eq!(process.state(), ProcessState::Ready);
        assert!(matches!(
            process.call_peripheral(PeripheralFunctionId::new(0, 0), &[]),
            Err(VmError::Disposed)
        ));
    }
}
