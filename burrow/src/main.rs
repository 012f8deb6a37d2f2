use clap::{Parser as ClapParser, Subcommand};
use std::{
    fs,
    path::{Path, PathBuf},
    process,
    time::Duration,
};

use burrow::{
    CompiledModule, GlobalValue, Instruction, LittleEndian, Machine, MachineConfig, Op,
    ProcessState, Segment, VirtualAddress, VmError, VmResult,
};

const REGISTER_PRINT_LIMIT: usize = 16;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a compiled module and run it to completion
    Run {
        #[arg(help = "The .brm module to run")]
        module: PathBuf,

        #[command(flatten)]
        machine: MachineArgs,

        /// Print the register file after the run
        #[arg(long)]
        dump_registers: bool,
    },
    /// Decode a compiled module and print its contents
    Inspect {
        #[arg(help = "The .brm module to inspect")]
        module: PathBuf,
    },
    /// Write a small sample module
    Demo {
        #[arg(help = "Where to write the module")]
        out: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct MachineArgs {
    /// Bytes of the shared segment pool
    #[arg(long, default_value_t = MachineConfig::default().pool_size)]
    pool_size: usize,

    /// Heap cells per process
    #[arg(long, default_value_t = MachineConfig::default().heap_cells)]
    heap_cells: usize,

    /// Stack cells per process
    #[arg(long, default_value_t = MachineConfig::default().stack_cells)]
    stack_cells: usize,

    /// Registers per process
    #[arg(long, default_value_t = MachineConfig::default().register_count)]
    registers: usize,

    /// Watchdog threshold in milliseconds, 0 disables it
    #[arg(long, default_value_t = MachineConfig::default().watchdog_ms)]
    watchdog_ms: u64,

    /// Give every segment its own pool
    #[arg(long)]
    host_allocator: bool,

    /// Directory modules are resolved against (defaults to the module's directory)
    #[arg(long)]
    storage_root: Option<PathBuf>,
}

impl MachineArgs {
    fn to_config(&self, storage_root: PathBuf) -> MachineConfig {
        MachineConfig {
            pool_size: self.pool_size,
            heap_cells: self.heap_cells,
            stack_cells: self.stack_cells,
            register_count: self.registers,
            watchdog_ms: self.watchdog_ms,
            host_allocator: self.host_allocator,
            storage_root,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Run {
            module,
            machine,
            dump_registers,
        } => run_module(module, machine, *dump_registers),
        Command::Inspect { module } => inspect_module(module),
        Command::Demo { out } => write_demo(out),
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn run_module(path: &Path, args: &MachineArgs, dump_registers: bool) -> VmResult<()> {
    let (root, name) = match &args.storage_root {
        Some(root) => (root.clone(), path.to_string_lossy().into_owned()),
        None => (
            path.parent().map(Path::to_path_buf).unwrap_or_default(),
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| VmError::invalid_argument("module path has no file name"))?,
        ),
    };

    let machine = Machine::with_config(args.to_config(root))?;
    let process = machine.create_process(&name)?;
    let handle = process.run()?;
    while !handle.join_timeout(Duration::from_millis(250)) {
        log::debug!("process {} still running", process.id());
    }
    let outcome = handle.join();

    log::info!(
        "process {} {:?} after {}µs",
        process.id(),
        process.state(),
        process.running_time() / 1_000
    );
    if dump_registers {
        dump_register_file(&process)?;
    }
    outcome?;
    if process.state() != ProcessState::Stopped {
        return Err(VmError::invalid_argument(format!(
            "process ended {:?}",
            process.state()
        )));
    }
    machine.dispose();
    Ok(())
}

fn dump_register_file(process: &burrow::Process) -> VmResult<()> {
    let registers = process.registers();
    for r in 0..registers.len().min(REGISTER_PRINT_LIMIT) {
        let cell = registers.get(r)?;
        match cell.host_string() {
            Some(s) => println!("r{r:<3} {s:?}"),
            None => println!("r{r:<3} {:>20} 0x{:016x}", cell.as_i64(), cell.as_u64()),
        }
    }
    if registers.len() > REGISTER_PRINT_LIMIT {
        println!("... {} more", registers.len() - REGISTER_PRINT_LIMIT);
    }
    Ok(())
}

fn inspect_module(path: &Path) -> VmResult<()> {
    let bytes = fs::read(path)?;
    let module = CompiledModule::decode(&bytes)?;
    println!("== {} ==", path.display());
    println!("instructions: {}", module.instructions.len());
    for (i, inst) in module.instructions.iter().enumerate() {
        println!("  {i:04}  {inst}");
    }
    println!("globals: {}", module.globals.len());
    for (i, global) in module.globals.iter().enumerate() {
        println!("  {i:04}  {global:?}");
    }
    Ok(())
}

/// Prints a greeting three times through the console peripheral.
fn write_demo(out: &Path) -> VmResult<()> {
    // link against the standard firmware to learn the function id
    let machine = Machine::new()?;
    let print = machine
        .resolve_peripheral_function("console", "print")?
        .ok_or(VmError::UnknownPeripheralFunction(-1))?;
    machine.dispose();

    let greeting = VirtualAddress::new(Segment::Global, 0)? as i32;
    let module = CompiledModule::new(
        vec![
            Instruction::new(Op::Movl, 0, 0, 0, greeting),
            Instruction::new(Op::Ldr, 1, 0, 0, 0),
            Instruction::new(Op::Movl, 2, 0, 0, 3),
            Instruction::new(Op::Movl, 3, 0, 0, 1),
            Instruction::new(Op::Callp, 1, 1, 4, print.raw()),
            Instruction::new(Op::Sub, 2, 2, 3, 0),
            Instruction::new(Op::Bnz, 2, 0, 0, 4),
            Instruction::halt(),
        ],
        vec![GlobalValue::Str("hello from burrow".into())],
    );
    fs::write(out, module.to_bytes::<LittleEndian>()?)?;
    log::info!("wrote {}", out.display());
    Ok(())
}
