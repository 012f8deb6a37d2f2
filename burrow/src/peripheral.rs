//! Host peripherals and the function tables scripts call through.
//!
//! A [`Peripheral`] declares its named host functions once, when it is
//! installed into [`StandardFirmware`]. Scripts refer to a function by the
//! packed [`PeripheralFunctionId`] resolved at link time, never by name.
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    io::{self, Write},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use crate::{Firmware, Process, ValueCell, VmError, VmResult};

/// Id returned by [`PeripheralRegistry::resolve`] for an unknown name.
pub const INVALID_FUNCTION_ID: i32 = -1;

/// Host callback invoked by a `callp` instruction.
pub type PeripheralFunction = Arc<dyn Fn(&mut PeripheralCall<'_>) -> VmResult<()> + Send + Sync>;

/// One host call: the calling process, the arguments copied out of its
/// registers, and the result cell written back to the destination register.
pub struct PeripheralCall<'a> {
    process: &'a Process,
    args: &'a [ValueCell],
    result: ValueCell,
}

impl<'a> PeripheralCall<'a> {
    pub fn new(process: &'a Process, args: &'a [ValueCell]) -> Self {
        Self {
            process,
            args,
            result: ValueCell::zero(),
        }
    }

    pub fn process(&self) -> &Process {
        self.process
    }

    pub fn args(&self) -> &[ValueCell] {
        self.args
    }

    pub fn arg(&self, index: usize) -> VmResult<&ValueCell> {
        self.args.get(index).ok_or(VmError::OutOfRange {
            index,
            length: self.args.len(),
        })
    }

    pub fn set_result(&mut self, value: impl Into<ValueCell>) {
        self.result = value.into();
    }

    pub fn result(&self) -> &ValueCell {
        &self.result
    }

    pub fn into_result(self) -> ValueCell {
        self.result
    }
}

// ── Registry ──────────────────────────────────────────────────────────

/// Name to id to callback table of one peripheral.
///
/// Ids are handed out sequentially from zero. Registering a name twice gives
/// it a fresh id and the name resolves to the newest one. Clearing the table
/// does not rewind the counter.
#[derive(Default)]
pub struct PeripheralRegistry {
    next_function_id: i32,
    ids: HashMap<String, i32>,
    functions: HashMap<i32, PeripheralFunction>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F) -> i32
    where
        F: Fn(&mut PeripheralCall<'_>) -> VmResult<()> + Send + Sync + 'static,
    {
        let id = self.next_function_id;
        self.next_function_id += 1;
        self.ids.insert(name.into(), id);
        self.functions.insert(id, Arc::new(function));
        id
    }

    /// The id registered for `name`, [`INVALID_FUNCTION_ID`] when unknown.
    pub fn resolve(&self, name: &str) -> i32 {
        self.ids.get(name).copied().unwrap_or(INVALID_FUNCTION_ID)
    }

    pub fn function(&self, id: i32) -> Option<PeripheralFunction> {
        self.functions.get(&id).cloned()
    }

    pub fn unregister_all(&mut self) {
        self.functions.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for PeripheralRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralRegistry")
            .field("next_function_id", &self.next_function_id)
            .field("functions", &self.ids)
            .finish()
    }
}

/// A named host component exposing functions to scripts.
pub trait Peripheral: Any + Send + Sync {
    fn name(&self) -> &str;

    /// Declares the peripheral's functions. Called once, at installation.
    fn setup_functions(self: Arc<Self>, registry: &mut PeripheralRegistry);
}

// ── Firmware ──────────────────────────────────────────────────────────

/// `peripheral << 16 | function`, the immediate operand of `callp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralFunctionId(i32);

impl PeripheralFunctionId {
    pub const fn new(peripheral: u16, function: u16) -> Self {
        Self(((peripheral as u32) << 16 | function as u32) as i32)
    }

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn peripheral(self) -> u16 {
        ((self.0 as u32) >> 16) as u16
    }

    pub const fn function(self) -> u16 {
        self.0 as u16
    }
}

struct InstalledPeripheral {
    name: String,
    instance: Arc<dyn Any + Send + Sync>,
    registry: PeripheralRegistry,
}

/// Default firmware part: peripherals by name, sequential peripheral ids.
#[derive(Default)]
pub struct StandardFirmware {
    peripherals: RwLock<Vec<InstalledPeripheral>>,
}

impl StandardFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `peripheral` and runs its function setup. Returns the
    /// peripheral id.
    pub fn install<P: Peripheral>(&self, peripheral: Arc<P>) -> VmResult<u16> {
        let mut peripherals = self.peripherals.write();
        let name = peripheral.name().to_owned();
        if peripherals.iter().any(|p| p.name == name) {
            return Err(VmError::invalid_argument(format!(
                "peripheral '{name}' is already installed"
            )));
        }
        let id = u16::try_from(peripherals.len())
            .map_err(|_| VmError::invalid_argument("too many peripherals"))?;

        let mut registry = PeripheralRegistry::new();
        Arc::clone(&peripheral).setup_functions(&mut registry);
        log::debug!(
            "installed peripheral '{name}' as {id} with {} functions",
            registry.len()
        );
        peripherals.push(InstalledPeripheral {
            name,
            instance: peripheral,
            registry,
        });
        Ok(id)
    }

    pub fn with_peripheral<P: Peripheral>(self, peripheral: Arc<P>) -> VmResult<Self> {
        self.install(peripheral)?;
        Ok(self)
    }

    pub fn peripheral_names(&self) -> Vec<String> {
        self.peripherals.read().iter().map(|p| p.name.clone()).collect()
    }
}

impl Firmware for StandardFirmware {
    fn peripheral(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.peripherals
            .read()
            .iter()
            .find(|p| p.name == name)
            .map(|p| Arc::clone(&p.instance))
    }

    fn resolve_function(&self, peripheral: &str, function: &str) -> Option<PeripheralFunctionId> {
        let peripherals = self.peripherals.read();
        let index = peripherals.iter().position(|p| p.name == peripheral)?;
        let function = peripherals[index].registry.resolve(function);
        if function == INVALID_FUNCTION_ID {
            return None;
        }
        Some(PeripheralFunctionId::new(
            u16::try_from(index).ok()?,
            u16::try_from(function).ok()?,
        ))
    }

    fn function(&self, id: PeripheralFunctionId) -> Option<PeripheralFunction> {
        self.peripherals
            .read()
            .get(id.peripheral() as usize)?
            .registry
            .function(id.function() as i32)
    }

    fn dispose(&self) {
        for peripheral in self.peripherals.write().iter_mut() {
            peripheral.registry.unregister_all();
        }
    }
}

// ── Console ───────────────────────────────────────────────────────────

/// Writes script output to a host stream.
///
/// `print` writes its arguments separated by spaces followed by a newline.
/// A cell carrying a host string prints the string, any other cell prints
/// its bits as `i64`. `print_float` does the same reading `f64`.
pub struct ConsolePeripheral {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsolePeripheral {
    pub const NAME: &'static str = "console";

    pub fn stdout() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    fn write_line(&self, args: &[ValueCell], render: fn(&ValueCell) -> String) -> VmResult<()> {
        let line = args.iter().map(render).collect::<Vec<_>>().join(" ");
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

fn render_int(cell: &ValueCell) -> String {
    match cell.host_string() {
        Some(s) => s.to_owned(),
        None => cell.as_i64().to_string(),
    }
}

fn render_float(cell: &ValueCell) -> String {
    match cell.host_string() {
        Some(s) => s.to_owned(),
        None => cell.as_f64().to_string(),
    }
}

impl Peripheral for ConsolePeripheral {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn setup_functions(self: Arc<Self>, registry: &mut PeripheralRegistry) {
        let console = Arc::clone(&self);
        registry.register_function("print", move |call| {
            console.write_line(call.args(), render_int)?;
            call.set_result(call.args().len() as i64);
            Ok(())
        });
        let console = self;
        registry.register_function("print_float", move |call| {
            console.write_line(call.args(), render_float)?;
            call.set_result(call.args().len() as i64);
            Ok(())
        });
    }
}
