mod allocator;
mod config;
mod endian;
mod error;
mod instruction;
mod machine;
mod memory;
mod module;
mod peripheral;
mod process;
mod processor;
mod storage;
mod thread;
mod value;
mod view;
mod vmem;

pub use allocator::*;
pub use config::MachineConfig;
pub use endian::{BigEndian, EndianReader, EndianWriter, LittleEndian};
pub use error::{VmError, VmResult};
pub use instruction::{Instruction, Op};
pub use machine::{
    Firmware, Machine, MachinePartsFactory, Memory, Processor, StandardPartsFactory, Storage,
};
pub use memory::{SegmentLayout, StandardMemory};
pub use module::{CompiledModule, GlobalValue, MODULE_MAGIC, MODULE_VERSION};
pub use peripheral::*;
pub use process::*;
pub use processor::StandardProcessor;
pub use storage::{FileStorage, InMemoryStorage, MODULE_EXTENSION};
pub use thread::{NativeThread, RunHandle};
pub use value::{CELL_SIZE, HostObject, ValueCell};
pub use view::{MemoryView, Pool};
pub use vmem::*;
