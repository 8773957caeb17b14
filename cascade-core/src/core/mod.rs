//! The five-stage in-order pipeline and its cycle-driven scheduler.
//!
//! One [`Pipeline::step`] is one cycle. Within a cycle the stages are
//! visited in W → M → E → D → F order, so every stage consumes the latch
//! its upstream neighbour filled the *previous* cycle — the edge-triggered
//! latch discipline — and a writeback committing this cycle is visible to
//! the register reads decode performs later in the same cycle.

pub mod clint;
pub mod csr;
pub mod execute;
pub mod interrupts;
pub mod status;
pub mod trap;

use log::{debug, trace};

use crate::core::csr::CsrBank;
use crate::core::execute::ExecuteOutcome;
use crate::core::interrupts::InterruptController;
use crate::core::status::Status;
use crate::core::trap::{Exception, TrapController};
use crate::instruction::{Instruction, Op};
use crate::memory::{Memory, MemoryError};
use crate::registers::{Registers, Specifier};
use crate::{unit, PrivilegeLevel};

/// A program image: pre-decoded instruction records laid out word by word
/// from a base address. Fetch resolves the PC against this image.
#[derive(Debug, Clone)]
pub struct Program {
    base_address: u32,
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(base_address: u32, instructions: Vec<Instruction>) -> Self {
        Self {
            base_address,
            instructions,
        }
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The instruction at `pc`, or `None` if `pc` lies outside the image or
    /// off the word grid.
    pub fn at(&self, pc: u32) -> Option<&Instruction> {
        let offset = pc.checked_sub(self.base_address)?;
        if offset % unit::WORD != 0 {
            return None;
        }
        self.instructions.get((offset / unit::WORD) as usize)
    }
}

/// A retired instruction together with the cycle its writeback completed.
#[derive(Debug, Clone)]
pub struct RetiredInstruction {
    pub instruction: Instruction,
    pub completed_cycle: u64,
}

/// The five-stage pipeline with its latches, hazard logic, flush mechanism,
/// and the microarchitectural state it orchestrates.
#[derive(Debug)]
pub struct Pipeline {
    registers: Registers,
    csr: CsrBank,
    trap: TrapController,
    memory: Memory,

    // One latch per stage boundary; a bubble is a valid occupant, `None`
    // means the slot has drained.
    latch_fetch_decode: Option<Instruction>,
    latch_decode_execute: Option<Instruction>,
    latch_execute_memory: Option<Instruction>,
    latch_memory_writeback: Option<Instruction>,

    /// One-shot flush signal carrying the redirect target. Raised by execute
    /// (control flow, traps) or memory (access faults); consumed by fetch in
    /// the same cycle.
    flush: Option<u32>,

    cycle: u64,
    retired: Vec<RetiredInstruction>,
    stall_count: u64,
    bubble_count: u64,
    flush_count: u64,
}

impl Pipeline {
    /// Build a pipeline around `memory`, with all architectural state in
    /// reset.
    pub fn new(memory: Memory) -> Self {
        Self {
            registers: Registers::new(0),
            csr: CsrBank::new(),
            trap: TrapController::new(),
            memory,
            latch_fetch_decode: None,
            latch_decode_execute: None,
            latch_execute_memory: None,
            latch_memory_writeback: None,
            flush: None,
            cycle: 0,
            retired: Vec::new(),
            stall_count: 0,
            bubble_count: 0,
            flush_count: 0,
        }
    }

    /// Advance the simulation by one cycle.
    pub fn step(&mut self, program: &Program) {
        self.cycle += 1;
        self.csr.increment_cycle();
        if let Some(clint) = self.memory.clint_mut() {
            clint.tick(1, self.trap.interrupts_mut(), &mut self.csr);
        }

        // Downstream destination registers, sampled at the cycle edge.
        // Decode compares against this snapshot rather than the latches as
        // the stages rewrite them below: an instruction sitting in the
        // memory→writeback latch has not committed yet at sampling time, so
        // it still blocks its consumers for this cycle.
        let hazard_dests = [
            Self::latched_dest(&self.latch_decode_execute),
            Self::latched_dest(&self.latch_execute_memory),
            Self::latched_dest(&self.latch_memory_writeback),
        ];

        self.writeback_stage();
        self.memory_stage();
        self.execute_stage();
        self.decode_stage(&hazard_dests);
        self.fetch_stage(program);
    }

    /// Step until the program is exhausted and the pipeline has drained, or
    /// until `max_cycles` further cycles have elapsed.
    pub fn run(&mut self, program: &Program, max_cycles: u64) {
        let deadline = self.cycle.saturating_add(max_cycles);
        while self.cycle < deadline {
            self.step(program);
            if self.is_drained(program) {
                break;
            }
        }
    }

    /// Returns `true` when no latch holds an occupant and fetch can make no
    /// further progress.
    pub fn is_drained(&self, program: &Program) -> bool {
        self.latch_fetch_decode.is_none()
            && self.latch_decode_execute.is_none()
            && self.latch_execute_memory.is_none()
            && self.latch_memory_writeback.is_none()
            && program.at(self.registers.pc()).is_none()
    }

    fn latched_dest(latch: &Option<Instruction>) -> Option<Specifier> {
        // Bubbles, stores, and branches carry no destination, so they fall
        // out here without a special case. x0 is excluded: it is hardwired
        // to zero, so a consumer never has to wait for it.
        latch
            .as_ref()
            .and_then(|instruction| instruction.dest())
            .filter(|dest| *dest != Specifier::X0)
    }

    // ----- Writeback -----

    fn writeback_stage(&mut self) {
        let Some(instruction) = self.latch_memory_writeback.take() else {
            return;
        };
        if instruction.is_bubble() {
            // Bubbles are consumed silently at the end of the pipe.
            return;
        }
        match instruction.outcome() {
            ExecuteOutcome::Value(value) => {
                if let Some(dest) = instruction.dest() {
                    self.registers.set_x(dest, value);
                }
            }
            ExecuteOutcome::Csr { op, address } => {
                let old_value = self.apply_csr_operation(&instruction, op, address);
                if let Some(dest) = instruction.dest() {
                    self.registers.set_x(dest, old_value);
                }
            }
            _ => {}
        }
        trace!("retiring {instruction} (cycle {})", self.cycle);
        self.csr.increment_instret();
        self.retired.push(RetiredInstruction {
            instruction,
            completed_cycle: self.cycle,
        });
    }

    /// The CSR read-modify-write deferred from execute: applied against the
    /// bank using the source value latched in decode (or the 5-bit
    /// zero-extended immediate), returning the CSR's old value.
    fn apply_csr_operation(
        &mut self,
        instruction: &Instruction,
        op: Op,
        address: csr::CsrSpecifier,
    ) -> u32 {
        let source = match op.csr_uses_immediate() {
            true => instruction.immediate() as u32 & 0x1F,
            false => instruction.src_values().first().copied().unwrap_or(0),
        };
        match op {
            Op::Csrrw | Op::Csrrwi => self.csr.write(address, source),
            // A zero mask is a pure read; the CSR must not observe a write.
            Op::Csrrs | Op::Csrrsi if source == 0 => self.csr.read(address),
            Op::Csrrs | Op::Csrrsi => self.csr.set_bits(address, source),
            Op::Csrrc | Op::Csrrci if source == 0 => self.csr.read(address),
            Op::Csrrc | Op::Csrrci => self.csr.clear_bits(address, source),
            _ => unreachable!("non-CSR operation {op:?} carried a CSR outcome"),
        }
    }

    // ----- Memory -----

    fn memory_stage(&mut self) {
        let Some(mut instruction) = self.latch_execute_memory.take() else {
            return;
        };
        let op = instruction.op();
        if op.is_load() {
            let address = instruction.mem_address().unwrap_or(0);
            let result = match op {
                Op::Lw => self.memory.read_word(address),
                Op::Lh => self.memory.read_halfword(address, true),
                Op::Lhu => self.memory.read_halfword(address, false),
                Op::Lb => self.memory.read_byte(address, true),
                Op::Lbu => self.memory.read_byte(address, false),
                _ => unreachable!(),
            };
            match result {
                Ok(value) => instruction.set_outcome(ExecuteOutcome::Value(value)),
                Err(error) => self.enter_memory_trap(&mut instruction, error),
            }
        } else if op.is_store() {
            let address = instruction.mem_address().unwrap_or(0);
            let value = instruction.src_values().first().copied().unwrap_or(0);
            let result = match op {
                Op::Sw => {
                    self.memory
                        .write_word(address, value, self.trap.interrupts_mut(), &mut self.csr)
                }
                Op::Sh => self.memory.write_halfword(address, value),
                Op::Sb => self.memory.write_byte(address, value),
                _ => unreachable!(),
            };
            if let Err(error) = result {
                self.enter_memory_trap(&mut instruction, error);
            }
        }
        self.latch_memory_writeback = Some(instruction);
    }

    /// Convert a load/store fault into an architectural trap: enter the
    /// handler via the trap controller, raise the flush towards it, and
    /// squash the faulting instruction (its only effect is the trap entry).
    fn enter_memory_trap(&mut self, instruction: &mut Instruction, error: MemoryError) {
        let exception = match (error, instruction.op().is_store()) {
            (MemoryError::MisalignedAccess { .. }, false) => Exception::LoadAddressMisaligned,
            (MemoryError::AccessFault { .. }, false) => Exception::LoadAccessFault,
            (MemoryError::MisalignedAccess { .. }, true) => Exception::StoreAddressMisaligned,
            (MemoryError::AccessFault { .. }, true) => Exception::StoreAccessFault,
        };
        let entry = self.trap.trigger_exception(
            &mut self.csr,
            exception,
            instruction.pc(),
            error.address(),
        );
        self.raise_flush(entry.handler_pc);
        instruction.set_trap(entry);
        instruction.squash();
    }

    // ----- Execute -----

    fn execute_stage(&mut self) {
        let Some(mut instruction) = self.latch_decode_execute.take() else {
            return;
        };
        if instruction.is_bubble() {
            self.latch_execute_memory = Some(instruction);
            return;
        }
        if self.flush.is_some() {
            // The memory stage trapped earlier this cycle; this occupant is
            // younger than the trap and must not execute.
            trace!("squashing {instruction} behind a memory-stage trap");
            instruction.squash();
            self.bubble_count += 1;
            self.latch_execute_memory = Some(instruction);
            return;
        }

        let evaluation = execute::evaluate(&instruction);
        instruction.set_outcome(evaluation.outcome);
        instruction.set_mem_address(evaluation.mem_address);

        match evaluation.outcome {
            ExecuteOutcome::Mret => {
                // Resolve against the CSR bank: pop the status stack and
                // jump to the saved exception PC.
                let target = self.csr.read(csr::MEPC);
                let mut status = Status::from_bits(self.csr.read(csr::MSTATUS));
                status.set_mie(status.mpie());
                status.set_mpie(true);
                status.set_mpp(PrivilegeLevel::User);
                self.csr.write(csr::MSTATUS, status.into_bits());
                instruction.set_jump_target(target);
                debug!("mret to {target:#010x}");
                self.raise_flush(target);
            }
            ExecuteOutcome::Ecall => {
                let entry = self.trap.ecall(&mut self.csr, instruction.pc());
                self.raise_flush(entry.handler_pc);
                instruction.set_trap(entry);
                instruction.squash();
            }
            ExecuteOutcome::Ebreak => {
                let entry = self.trap.ebreak(&mut self.csr, instruction.pc());
                self.raise_flush(entry.handler_pc);
                instruction.set_trap(entry);
                instruction.squash();
            }
            ExecuteOutcome::Value(predicate) if instruction.op().is_branch() => {
                // The unit only evaluates the predicate; the pipeline forms
                // the target from the branch's own PC and offset when taken.
                if predicate != 0 {
                    let target = instruction.pc().wrapping_add_signed(instruction.immediate());
                    instruction.set_jump_target(target);
                    self.raise_flush(target);
                }
            }
            ExecuteOutcome::Value(_) if instruction.op().is_jump() => {
                if let Some(target) = evaluation.jump_target {
                    instruction.set_jump_target(target);
                    self.raise_flush(target);
                }
            }
            _ => {}
        }
        self.latch_execute_memory = Some(instruction);
    }

    fn raise_flush(&mut self, target: u32) {
        debug!("flush raised towards {target:#010x}");
        self.flush = Some(target);
        self.flush_count += 1;
    }

    // ----- Decode -----

    fn decode_stage(&mut self, hazard_dests: &[Option<Specifier>; 3]) {
        if self.flush.is_some() {
            // Squash the wrong-path occupant so only a bubble enters execute.
            if let Some(mut instruction) = self.latch_fetch_decode.take() {
                if !instruction.is_bubble() {
                    trace!("squashing {instruction} behind a flush");
                    instruction.squash();
                    self.bubble_count += 1;
                }
                self.latch_decode_execute = Some(instruction);
            }
            return;
        }

        let hazard = match &self.latch_fetch_decode {
            Some(instruction) if !instruction.is_bubble() => {
                self.raw_hazard_source(instruction, hazard_dests)
            }
            _ => None,
        };
        if let Some(register) = hazard {
            // RAW: hold the instruction in decode and send a bubble down
            // instead; re-check next cycle.
            trace!("RAW hazard on {register}, stalling decode");
            self.stall_count += 1;
            self.bubble_count += 1;
            self.latch_decode_execute = Some(Instruction::bubble());
            return;
        }

        if let Some(mut instruction) = self.latch_fetch_decode.take() {
            let values = instruction
                .srcs()
                .iter()
                .map(|specifier| self.registers.x(*specifier))
                .collect();
            instruction.set_src_values(values);
            self.latch_decode_execute = Some(instruction);
        }
    }

    /// The first source register of `instruction` that an in-flight
    /// downstream instruction is still going to write, if any.
    fn raw_hazard_source(
        &self,
        instruction: &Instruction,
        hazard_dests: &[Option<Specifier>; 3],
    ) -> Option<Specifier> {
        instruction
            .srcs()
            .iter()
            .copied()
            .find(|src| *src != Specifier::X0 && hazard_dests.contains(&Some(*src)))
    }

    // ----- Fetch -----

    fn fetch_stage(&mut self, program: &Program) {
        if let Some(target) = self.flush.take() {
            // The squash is complete (decode re-stamped its occupant this
            // cycle); redirect and clear the signal.
            debug!("fetch redirected to {target:#010x}");
            self.registers.set_pc(target);
        }

        // The interrupt check runs immediately before each fetch, with the
        // PC of the instruction that would be fetched next. In-flight older
        // instructions are unaffected; they retire normally behind the
        // redirect.
        let next_pc = self.registers.pc();
        if let Some(entry) = self.trap.check_pending_interrupts(&mut self.csr, next_pc) {
            self.registers.set_pc(entry.handler_pc);
        }

        if self.latch_fetch_decode.is_some() {
            // Decode is stalled on the current occupant; hold fetch.
            return;
        }
        let pc = self.registers.pc();
        if let Some(instruction) = program.at(pc) {
            let mut instruction = instruction.clone();
            instruction.set_pc(pc);
            trace!("fetched {instruction} at {pc:#010x}");
            self.latch_fetch_decode = Some(instruction);
            let fall_through = pc.wrapping_add(unit::WORD);
            self.registers.set_next_pc(fall_through);
            self.registers.set_pc(fall_through);
        }
    }

    // ----- State access -----

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn csr(&self) -> &CsrBank {
        &self.csr
    }

    pub fn csr_mut(&mut self) -> &mut CsrBank {
        &mut self.csr
    }

    pub fn trap(&self) -> &TrapController {
        &self.trap
    }

    pub fn trap_mut(&mut self) -> &mut TrapController {
        &mut self.trap
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// The memory together with the interrupt controller and CSR bank its
    /// word-write path needs (CLINT writes move interrupt pending state).
    pub fn memory_parts_mut(&mut self) -> (&mut Memory, &mut InterruptController, &mut CsrBank) {
        (
            &mut self.memory,
            self.trap.interrupts_mut(),
            &mut self.csr,
        )
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn stall_count(&self) -> u64 {
        self.stall_count
    }

    pub fn bubble_count(&self) -> u64 {
        self.bubble_count
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn retired(&self) -> &[RetiredInstruction] {
        &self.retired
    }

    /// Drain the retirement list.
    pub fn take_retired(&mut self) -> Vec<RetiredInstruction> {
        std::mem::take(&mut self.retired)
    }

    /// Restore every component and all pipeline bookkeeping to reset state.
    pub fn reset(&mut self) {
        self.registers = Registers::new(0);
        self.csr.reset();
        self.trap.interrupts_mut().reset(&mut self.csr);
        if let Some(uart) = self.memory.uart_mut() {
            uart.reset();
        }
        {
            let (memory, interrupts, csr) = (
                &mut self.memory,
                self.trap.interrupts_mut(),
                &mut self.csr,
            );
            if let Some(clint) = memory.clint_mut() {
                clint.reset(interrupts, csr);
            }
        }
        self.memory.reset();
        self.latch_fetch_decode = None;
        self.latch_decode_execute = None;
        self.latch_execute_memory = None;
        self.latch_memory_writeback = None;
        self.flush = None;
        self.cycle = 0;
        self.retired.clear();
        self.stall_count = 0;
        self.bubble_count = 0;
        self.flush_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_lookup() {
        let program = Program::new(
            0x100,
            vec![
                Instruction::system(Op::Fence),
                Instruction::system(Op::FenceI),
            ],
        );
        assert_eq!(2, program.len());
        assert_eq!(Some(Op::Fence), program.at(0x100).map(|i| i.op()));
        assert_eq!(Some(Op::FenceI), program.at(0x104).map(|i| i.op()));
        // Off the end, below the base, and off the word grid.
        assert!(program.at(0x108).is_none());
        assert!(program.at(0xFC).is_none());
        assert!(program.at(0x102).is_none());
    }

    #[test]
    fn test_empty_program_is_drained_immediately() {
        let pipeline = Pipeline::new(Memory::new(0x100, 0));
        let program = Program::new(0, Vec::new());
        assert!(program.is_empty());
        assert!(pipeline.is_drained(&program));
    }
}
