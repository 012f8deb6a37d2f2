//! The machine and its parts.
//!
//! A [`Machine`] owns four parts built by a [`MachinePartsFactory`]: the
//! processor that runs processes, the memory that carves their segments, the
//! firmware that hosts peripherals and the storage modules are loaded from.
//! Parts are torn down in a fixed order, storage first and processor last.
use std::{
    any::Any,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    CompiledModule, ConsolePeripheral, FileStorage, MachineConfig, PeripheralFunction,
    PeripheralFunctionId, Process, ProcessSegments, StandardFirmware, StandardMemory,
    StandardProcessor, ValueCell, VmError, VmResult, process::DEFAULT_WATCHDOG_MS,
};

// ── Parts ─────────────────────────────────────────────────────────────

pub trait Processor: Send + Sync {
    /// Runs `process` to completion on the calling thread.
    fn execute(&self, process: &Arc<Process>) -> VmResult<()>;

    fn dispose(&self) {}
}

/// Segment provider. Calls are serialized by the machine.
pub trait Memory: Send {
    fn create_process(&mut self, module: &CompiledModule) -> VmResult<ProcessSegments>;

    fn release_process(&mut self, segments: &ProcessSegments) -> VmResult<()>;

    fn dispose(&self) {}
}

pub trait Firmware: Send + Sync {
    fn peripheral(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;

    fn resolve_function(&self, peripheral: &str, function: &str) -> Option<PeripheralFunctionId>;

    fn function(&self, id: PeripheralFunctionId) -> Option<PeripheralFunction>;

    fn dispose(&self) {}
}

pub trait Storage: Send + Sync {
    fn load(&self, path: &str) -> VmResult<Vec<u8>>;

    fn dispose(&self) {}
}

/// Builds the parts of a machine. Returning `None` for any part makes
/// machine construction fail with [`VmError::MissingPart`].
pub trait MachinePartsFactory {
    fn create_processor(&self) -> Option<Arc<dyn Processor>>;

    fn create_memory(&self) -> Option<Box<dyn Memory>>;

    fn create_firmware(&self) -> Option<Arc<dyn Firmware>>;

    fn create_storage(&self) -> Option<Box<dyn Storage>>;

    /// Watchdog threshold new processes start with.
    fn watchdog_threshold(&self) -> u64 {
        DEFAULT_WATCHDOG_MS
    }
}

/// Standard parts configured from a [`MachineConfig`], with a console
/// peripheral writing to stdout.
#[derive(Debug, Clone, Default)]
pub struct StandardPartsFactory {
    config: MachineConfig,
}

impl StandardPartsFactory {
    pub fn new(config: MachineConfig) -> VmResult<Self> {
        Ok(Self {
            config: config.validated()?,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }
}

impl MachinePartsFactory for StandardPartsFactory {
    fn create_processor(&self) -> Option<Arc<dyn Processor>> {
        Some(Arc::new(StandardProcessor))
    }

    fn create_memory(&self) -> Option<Box<dyn Memory>> {
        match StandardMemory::from_config(&self.config) {
            Ok(memory) => Some(Box::new(memory)),
            Err(err) => {
                log::error!("cannot build memory part: {err}");
                None
            }
        }
    }

    fn create_firmware(&self) -> Option<Arc<dyn Firmware>> {
        let firmware = StandardFirmware::new();
        firmware.install(Arc::new(ConsolePeripheral::stdout())).ok()?;
        Some(Arc::new(firmware))
    }

    fn create_storage(&self) -> Option<Box<dyn Storage>> {
        Some(Box::new(FileStorage::new(self.config.storage_root.clone())))
    }

    fn watchdog_threshold(&self) -> u64 {
        self.config.watchdog_ms
    }
}

// ── Machine ───────────────────────────────────────────────────────────

struct Parts {
    processor: Arc<dyn Processor>,
    memory: Mutex<Box<dyn Memory>>,
    firmware: Arc<dyn Firmware>,
    storage: Box<dyn Storage>,
}

/// State shared between the machine handle and the processes it created.
pub struct MachineShared {
    parts: RwLock<Option<Parts>>,
    disposed: AtomicBool,
    next_process_id: AtomicI32,
    watchdog_ms: u64,
    processes: Mutex<Vec<Weak<Process>>>,
}

impl MachineShared {
    fn with_parts<R>(&self, f: impl FnOnce(&Parts) -> VmResult<R>) -> VmResult<R> {
        let parts = self.parts.read();
        match parts.as_ref() {
            Some(parts) => f(parts),
            None => Err(VmError::Disposed),
        }
    }

    pub(crate) fn processor(&self) -> VmResult<Arc<dyn Processor>> {
        self.with_parts(|parts| Ok(Arc::clone(&parts.processor)))
    }

    pub(crate) fn peripheral_function(
        &self,
        id: PeripheralFunctionId,
    ) -> VmResult<Option<PeripheralFunction>> {
        self.with_parts(|parts| Ok(parts.firmware.function(id)))
    }

    /// Hands segments back. Once the memory part is gone its pools went with
    /// it, so there is nothing left to release.
    pub(crate) fn release_process(&self, segments: &ProcessSegments) -> VmResult<()> {
        let parts = self.parts.read();
        match parts.as_ref() {
            Some(parts) => parts.memory.lock().release_process(segments),
            None => Ok(()),
        }
    }
}

/// The owner of a set of machine parts.
///
/// Dropping the machine disposes it. Processes keep only a weak reference,
/// so they never keep a disposed machine's parts alive.
pub struct Machine {
    inner: Arc<MachineShared>,
}

impl Machine {
    /// A machine with the standard parts and default configuration.
    pub fn new() -> VmResult<Self> {
        Self::with_factory(&StandardPartsFactory::default())
    }

    pub fn with_config(config: MachineConfig) -> VmResult<Self> {
        Self::with_factory(&StandardPartsFactory::new(config)?)
    }

    pub fn with_factory(factory: &dyn MachinePartsFactory) -> VmResult<Self> {
        let processor = factory
            .create_processor()
            .ok_or(VmError::MissingPart("processor"))?;
        let memory = factory
            .create_memory()
            .ok_or(VmError::MissingPart("memory"))?;
        let firmware = factory
            .create_firmware()
            .ok_or(VmError::MissingPart("firmware"))?;
        let storage = factory
            .create_storage()
            .ok_or(VmError::MissingPart("storage"))?;

        let parts = Parts {
            processor,
            memory: Mutex::new(memory),
            firmware,
            storage,
        };
        log::debug!("machine created");
        Ok(Self {
            inner: Arc::new(MachineShared {
                parts: RwLock::new(Some(parts)),
                disposed: AtomicBool::new(false),
                next_process_id: AtomicI32::new(0),
                watchdog_ms: factory.watchdog_threshold(),
                processes: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> VmResult<()> {
        if self.is_disposed() {
            Err(VmError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Loads `path` through storage and builds a process from it.
    pub fn create_process(&self, path: &str) -> VmResult<Arc<Process>> {
        self.ensure_alive()?;
        let bytes = self.inner.with_parts(|parts| parts.storage.load(path))?;
        let module = CompiledModule::decode(&bytes)?;
        log::info!(
            "loaded '{path}': {} instructions, {} globals",
            module.instructions.len(),
            module.globals.len()
        );
        self.create_process_from_module(&module)
    }

    pub fn create_process_from_module(&self, module: &CompiledModule) -> VmResult<Arc<Process>> {
        self.ensure_alive()?;
        let segments = self
            .inner
            .with_parts(|parts| parts.memory.lock().create_process(module))?;
        let id = self.inner.next_process_id.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(Process::new(
            id,
            segments,
            self.inner.watchdog_ms,
            Arc::downgrade(&self.inner),
        ));

        let mut processes = self.inner.processes.lock();
        processes.retain(|p| p.strong_count() > 0);
        processes.push(Arc::downgrade(&process));
        log::debug!("process {id} created");
        Ok(process)
    }

    /// The peripheral installed as `name`, if it is a `T`.
    ///
    /// A missing name or a different type is `Ok(None)`; only a disposed
    /// machine is an error.
    pub fn get_peripheral<T: Any + Send + Sync>(&self, name: &str) -> VmResult<Option<Arc<T>>> {
        self.ensure_alive()?;
        self.inner.with_parts(|parts| {
            Ok(parts
                .firmware
                .peripheral(name)
                .and_then(|any| any.downcast::<T>().ok()))
        })
    }

    pub fn resolve_peripheral_function(
        &self,
        peripheral: &str,
        function: &str,
    ) -> VmResult<Option<PeripheralFunctionId>> {
        self.ensure_alive()?;
        self.inner
            .with_parts(|parts| Ok(parts.firmware.resolve_function(peripheral, function)))
    }

    /// Calls a host function on behalf of `process`, which must have been
    /// created by this machine.
    pub fn call_peripheral(
        &self,
        process: &Process,
        id: PeripheralFunctionId,
        args: &[ValueCell],
    ) -> VmResult<ValueCell> {
        self.ensure_alive()?;
        if !process.belongs_to(&self.inner) {
            return Err(VmError::invalid_argument(format!(
                "process {} belongs to another machine",
                process.id()
            )));
        }
        process.call_peripheral(id, args)
    }

    /// Disposes live processes, then the parts in order: storage, firmware,
    /// memory, processor. Repeated calls do nothing.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let live: Vec<Arc<Process>> = self
            .inner
            .processes
            .lock()
            .drain(..)
            .filter_map(|p| p.upgrade())
            .collect();
        for process in &live {
            process.dispose();
        }

        let Some(parts) = self.inner.parts.write().take() else {
            return;
        };
        let Parts {
            processor,
            memory,
            firmware,
            storage,
        } = parts;

        storage.dispose();
        drop(storage);
        log::trace!("storage disposed");

        firmware.dispose();
        drop(firmware);
        log::trace!("firmware disposed");

        let memory = memory.into_inner();
        memory.dispose();
        drop(memory);
        log::trace!("memory disposed");

        processor.dispose();
        drop(processor);
        log::debug!("machine disposed after {} live processes", live.len());
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("disposed", &self.is_disposed())
            .field(
                "next_process_id",
                &self.inner.next_process_id.load(Ordering::Relaxed),
            )
            .finish()
    }
}
