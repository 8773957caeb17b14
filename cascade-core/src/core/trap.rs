//! Machine-mode trap entry sequencing.

use log::debug;

use crate::core::csr::{self, CsrBank};
use crate::core::interrupts::InterruptController;
use crate::core::status::Status;
use crate::PrivilegeLevel;

/// The synchronous exceptions of the machine-mode taxonomy.
///
/// The page-fault and lower-privilege ECALL codes are part of the taxonomy
/// but are never raised by this core (it has no address translation and no
/// privilege level below machine).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
}

impl Exception {
    /// Returns the mcause code for this exception (bit 31 clear).
    pub const fn code(self) -> u32 {
        match self {
            Self::InstructionAddressMisaligned => 0,
            Self::InstructionAccessFault => 1,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned => 4,
            Self::LoadAccessFault => 5,
            Self::StoreAddressMisaligned => 6,
            Self::StoreAccessFault => 7,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromSMode => 9,
            Self::EnvironmentCallFromMMode => 11,
            Self::InstructionPageFault => 12,
            Self::LoadPageFault => 13,
            Self::StorePageFault => 15,
        }
    }
}

/// The mtvec addressing mode, encoded in its low two bits.
///
/// > When MODE=Direct, all traps into machine mode cause the pc to be set to
/// > the address in the BASE field. When MODE=Vectored, all synchronous
/// > exceptions into machine mode cause the pc to be set to the address in
/// > the BASE field, whereas interrupts cause the pc to be set to the
/// > address in the BASE field plus four times the interrupt cause number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VectorMode {
    Direct,
    Vectored,
}

impl VectorMode {
    /// Decode the mode field of an mtvec value. The reserved encodings
    /// (2 and 3) behave as direct.
    pub fn from_mtvec(mtvec: u32) -> Self {
        match mtvec & 0b11 {
            1 => Self::Vectored,
            _ => Self::Direct,
        }
    }
}

/// Whether a trap entry was caused by a synchronous exception or an
/// asynchronous interrupt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapKind {
    Exception,
    Interrupt,
}

/// The record a trap entry produces: where to redirect fetch, plus the
/// values just written to mcause/mepc/mtval.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TrapEntry {
    pub kind: TrapKind,
    pub handler_pc: u32,
    pub cause: u32,
    pub epc: u32,
    pub tval: u32,
}

/// Owns the trap entry sequence for exceptions and interrupts, and the
/// interrupt controller that feeds the asynchronous side.
#[derive(Debug, Clone, Default)]
pub struct TrapController {
    interrupts: InterruptController,
}

impl TrapController {
    pub fn new() -> Self {
        Self {
            interrupts: InterruptController::new(),
        }
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    /// Enter a synchronous exception trap.
    ///
    /// Writes, in order: mepc ← `pc` (the faulting instruction), the
    /// mstatus stack push (MPIE ← MIE, MIE ← 0, MPP ← machine), mcause ←
    /// the exception code, mtval ← `tval`. The handler address is the mtvec
    /// base; exceptions never vector.
    pub fn trigger_exception(
        &mut self,
        csr: &mut CsrBank,
        exception: Exception,
        pc: u32,
        tval: u32,
    ) -> TrapEntry {
        csr.write(csr::MEPC, pc);
        self.push_status_stack(csr);
        let cause = exception.code() & 0x7FFF_FFFF;
        csr.write(csr::MCAUSE, cause);
        csr.write(csr::MTVAL, tval);
        let handler_pc = csr.read(csr::MTVEC) & !0b11;
        debug!(
            "exception {exception:?} at pc {pc:#010x} (tval {tval:#010x}), \
             handler at {handler_pc:#010x}"
        );
        TrapEntry {
            kind: TrapKind::Exception,
            handler_pc,
            cause,
            epc: pc,
            tval,
        }
    }

    /// Deliver the highest-priority pending interrupt, if any is
    /// deliverable.
    ///
    /// Invoked with the PC of the next instruction that would have been
    /// fetched; on delivery that address goes to mepc so MRET resumes the
    /// interrupted flow. The delivered bit is cleared from mip (the
    /// controller's acknowledge path); level-triggered sources re-raise it
    /// as long as the device condition holds.
    pub fn check_pending_interrupts(
        &mut self,
        csr: &mut CsrBank,
        next_pc: u32,
    ) -> Option<TrapEntry> {
        let bit = self.interrupts.highest_priority(csr)?;
        self.interrupts.clear_pending(csr, bit);

        csr.write(csr::MEPC, next_pc);
        self.push_status_stack(csr);
        let cause = 0x8000_0000 | bit;
        csr.write(csr::MCAUSE, cause);
        csr.write(csr::MTVAL, 0);

        let mtvec = csr.read(csr::MTVEC);
        let base = mtvec & !0b11;
        let handler_pc = match VectorMode::from_mtvec(mtvec) {
            VectorMode::Direct => base,
            VectorMode::Vectored => base.wrapping_add(4 * (cause & 0x7FFF_FFFF)),
        };
        debug!("delivering interrupt bit {bit}, handler at {handler_pc:#010x}");
        Some(TrapEntry {
            kind: TrapKind::Interrupt,
            handler_pc,
            cause,
            epc: next_pc,
            tval: 0,
        })
    }

    /// Environment call from machine mode (cause 11).
    pub fn ecall(&mut self, csr: &mut CsrBank, pc: u32) -> TrapEntry {
        self.trigger_exception(csr, Exception::EnvironmentCallFromMMode, pc, 0)
    }

    /// Breakpoint (cause 3).
    pub fn ebreak(&mut self, csr: &mut CsrBank, pc: u32) -> TrapEntry {
        self.trigger_exception(csr, Exception::Breakpoint, pc, 0)
    }

    /// Illegal instruction (cause 2), with the offending encoding in mtval.
    pub fn illegal_instruction(
        &mut self,
        csr: &mut CsrBank,
        pc: u32,
        instruction_bits: u32,
    ) -> TrapEntry {
        self.trigger_exception(csr, Exception::IllegalInstruction, pc, instruction_bits)
    }

    // MPIE ← MIE, MIE ← 0, MPP ← machine.
    fn push_status_stack(&self, csr: &mut CsrBank) {
        let mut status = Status::from_bits(csr.read(csr::MSTATUS));
        status.set_mpie(status.mie());
        status.set_mie(false);
        status.set_mpp(PrivilegeLevel::Machine);
        csr.write(csr::MSTATUS, status.into_bits());
    }
}
