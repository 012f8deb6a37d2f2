//! Default processor: a plain fetch, decode, dispatch loop.
use std::sync::Arc;

use crate::{
    Instruction, MemoryView, Op, PeripheralFunctionId, Process, ProcessState, Processor,
    Segment, ValueCell, VmError, VmResult,
};

/// How many instructions run between two watchdog checks.
const WATCHDOG_INTERVAL: u32 = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardProcessor;

impl StandardProcessor {
    pub fn new() -> Self {
        Self
    }

    fn dispatch(&self, process: &Process) -> VmResult<()> {
        let program = process.virtual_memory().segment(Segment::Program);
        let registers = process.registers();
        let mut pc = 0usize;
        let mut budget = WATCHDOG_INTERVAL;

        loop {
            budget -= 1;
            if budget == 0 {
                budget = WATCHDOG_INTERVAL;
                if process.state() != ProcessState::Running {
                    // disposed while running
                    return Ok(());
                }
                if process.is_watchdog_expired() {
                    return Err(process.watchdog_error());
                }
            }

            if pc >= program.len() {
                return Ok(());
            }
            let inst = program.get(pc)?.as_instruction();
            pc += 1;

            let op = inst.opcode().map_err(VmError::InvalidInstruction)?;
            log::trace!("process {} @{:<4} {inst}", process.id(), pc - 1);
            match op {
                Op::Halt => return Ok(()),
                Op::Nop => {}
                Op::Mov => {
                    let value = registers.get(inst.rb as usize)?;
                    registers.set(inst.ra as usize, value)?;
                }
                Op::Movl => registers.set(inst.ra as usize, inst.immediate as i64)?,
                Op::Add => {
                    let (lhs, rhs) = operands(registers, &inst)?;
                    registers.set(inst.ra as usize, lhs.wrapping_add(rhs))?;
                }
                Op::Sub => {
                    let (lhs, rhs) = operands(registers, &inst)?;
                    registers.set(inst.ra as usize, lhs.wrapping_sub(rhs))?;
                }
                Op::Ldr => {
                    let address = effective_address(registers, &inst)?;
                    let value = process.virtual_memory().read(address)?;
                    registers.set(inst.ra as usize, value)?;
                }
                Op::Str => {
                    let address = effective_address(registers, &inst)?;
                    let value = registers.get(inst.ra as usize)?;
                    process.virtual_memory().write(address, value)?;
                }
                Op::Br => pc = branch_target(program, inst.immediate)?,
                Op::Bnz => {
                    if registers.get(inst.ra as usize)?.as_i64() != 0 {
                        pc = branch_target(program, inst.immediate)?;
                    }
                }
                Op::Callp => {
                    let first = inst.ra as usize;
                    let args: Vec<ValueCell> = (first..first + inst.rb as usize)
                        .map(|r| registers.get(r))
                        .collect::<VmResult<_>>()?;
                    let result = process
                        .call_peripheral(PeripheralFunctionId::from_raw(inst.immediate), &args)?;
                    // host calls may block, a dispose during one ends the run here
                    if process.state() != ProcessState::Running {
                        return Ok(());
                    }
                    registers.set(inst.rc as usize, result)?;
                }
            }
        }
    }
}

fn operands(registers: &MemoryView, inst: &Instruction) -> VmResult<(i64, i64)> {
    Ok((
        registers.get(inst.rb as usize)?.as_i64(),
        registers.get(inst.rc as usize)?.as_i64(),
    ))
}

fn effective_address(registers: &MemoryView, inst: &Instruction) -> VmResult<u32> {
    let base = registers.get(inst.rb as usize)?.as_i64();
    let address = base.wrapping_add(inst.immediate as i64);
    u32::try_from(address).map_err(|_| VmError::AddressingError(address as u32))
}

fn branch_target(program: &MemoryView, target: i32) -> VmResult<usize> {
    match usize::try_from(target) {
        Ok(pc) if pc <= program.len() => Ok(pc),
        _ => Err(VmError::InvalidBranch {
            target,
            length: program.len(),
        }),
    }
}

impl Processor for StandardProcessor {
    fn execute(&self, process: &Arc<Process>) -> VmResult<()> {
        if process.state() == ProcessState::Ready {
            process.start()?;
        }
        match self.dispatch(process) {
            Ok(()) => {
                process.stop();
                Ok(())
            }
            Err(err) => {
                log::warn!("process {} faulted: {err}", process.id());
                process.fault();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryView, Pool, ProcessSegments, VirtualAddress};

    fn process_with(code: &[Instruction]) -> Arc<Process> {
        let program = MemoryView::whole(Pool::new(code.len().max(1)));
        for (i, inst) in code.iter().enumerate() {
            program.set(i, *inst).unwrap();
        }
        let view = |n| MemoryView::whole(Pool::new(n));
        Arc::new(Process::detached(
            0,
            ProcessSegments {
                program,
                global: view(4),
                heap: view(8),
                stack: view(8),
                registers: view(8),
            },
        ))
    }

    fn reg(process: &Process, r: usize) -> i64 {
        process.registers().get(r).unwrap().as_i64()
    }

    #[test]
    fn test_arithmetic_and_halt() {
        let process = process_with(&[
            Instruction::new(Op::Movl, 0, 0, 0, 40),
            Instruction::new(Op::Movl, 1, 0, 0, 2),
            Instruction::new(Op::Add, 2, 0, 1, 0),
            Instruction::new(Op::Sub, 3, 0, 1, 0),
            Instruction::new(Op::Mov, 4, 2, 0, 0),
            Instruction::halt(),
            Instruction::new(Op::Movl, 5, 0, 0, 1),
        ]);
        StandardProcessor.execute(&process).unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(reg(&process, 2), 42);
        assert_eq!(reg(&process, 3), 38);
        assert_eq!(reg(&process, 4), 42);
        assert_eq!(reg(&process, 5), 0);
    }

    #[test]
    fn test_load_store_through_virtual_memory() {
        let heap = VirtualAddress::new(Segment::Heap, 0).unwrap() as i32;
        let process = process_with(&[
            Instruction::new(Op::Movl, 0, 0, 0, heap),
            Instruction::new(Op::Movl, 1, 0, 0, 77),
            Instruction::new(Op::Str, 1, 0, 0, 3),
            Instruction::new(Op::Ldr, 2, 0, 0, 3),
        ]);
        StandardProcessor.execute(&process).unwrap();
        assert_eq!(process.segments().heap.get(3).unwrap().as_i64(), 77);
        assert_eq!(reg(&process, 2), 77);
    }

    #[test]
    fn test_countdown_loop() {
        // r0 = 5; do { r1 += 1; r0 -= 1 } while r0 != 0
        let process = process_with(&[
            Instruction::new(Op::Movl, 0, 0, 0, 5),
            Instruction::new(Op::Movl, 2, 0, 0, 1),
            Instruction::new(Op::Add, 1, 1, 2, 0),
            Instruction::new(Op::Sub, 0, 0, 2, 0),
            Instruction::new(Op::Bnz, 0, 0, 0, 2),
            Instruction::halt(),
        ]);
        StandardProcessor.execute(&process).unwrap();
        assert_eq!(reg(&process, 0), 0);
        assert_eq!(reg(&process, 1), 5);
    }

    #[test]
    fn test_invalid_opcode_faults() {
        let process = process_with(&[Instruction::from_u64(0xFE)]);
        assert!(matches!(
            StandardProcessor.execute(&process),
            Err(VmError::InvalidInstruction(0xFE))
        ));
        assert_eq!(process.state(), ProcessState::Faulted);
    }

    #[test]
    fn test_bad_address_and_branch_fault() {
        let process = process_with(&[Instruction::new(Op::Ldr, 0, 1, 0, 0x0040_0000)]);
        assert!(matches!(
            StandardProcessor.execute(&process),
            Err(VmError::AddressingError(0x0040_0000))
        ));
        assert_eq!(process.state(), ProcessState::Faulted);

        let process = process_with(&[Instruction::new(Op::Br, 0, 0, 0, -1)]);
        let err = StandardProcessor.execute(&process).unwrap_err();
        assert!(matches!(err, VmError::InvalidBranch { target: -1, length: 1 }));
        assert!(err.to_string().contains("-1"));

        let process = process_with(&[
            Instruction::new(Op::Bnz, 0, 0, 0, 0),
            Instruction::new(Op::Br, 0, 0, 0, 3),
        ]);
        assert!(matches!(
            StandardProcessor.execute(&process),
            Err(VmError::InvalidBranch { target: 3, length: 2 })
        ));
    }

    #[test]
    fn test_watchdog_faults_endless_loop() {
        let process = process_with(&[Instruction::new(Op::Br, 0, 0, 0, 0)]);
        process.set_watchdog_threshold(20);
        assert!(matches!(
            StandardProcessor.execute(&process),
            Err(VmError::Watchdog { threshold_ms: 20, .. })
        ));
        assert_eq!(process.state(), ProcessState::Faulted);
    }

    #[test]
    fn test_peripheral_call_needs_a_machine() {
        let process = process_with(&[Instruction::new(Op::Callp, 0, 1, 1, 0)]);
        assert!(matches!(
            StandardProcessor.execute(&process),
            Err(VmError::Disposed)
        ));
    }

    #[test]
    fn test_running_off_the_end_stops() {
        let process = process_with(&[Instruction::new(Op::Nop, 0, 0, 0, 0)]);
        StandardProcessor.execute(&process).unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
    }
}
