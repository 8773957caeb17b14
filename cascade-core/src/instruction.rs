//! The pre-decoded instruction record that flows through the pipeline.

use crate::core::csr::CsrSpecifier;
use crate::core::execute::ExecuteOutcome;
use crate::core::trap::TrapEntry;
use crate::registers::Specifier;
use std::fmt;

/// Closed set of operations the execution unit understands.
///
/// A [`Bubble`](Op::Bubble) is a first-class member of the set: it traverses
/// the stages like any other occupant but has no observable effects and does
/// not retire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sra,
    Slt,
    Sltu,
    Addi,
    Andi,
    Ori,
    Xori,
    Slli,
    Srli,
    Srai,
    Slti,
    Sltiu,
    Lui,
    Auipc,
    Lw,
    Lh,
    Lhu,
    Lb,
    Lbu,
    Sw,
    Sh,
    Sb,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Jal,
    Jalr,
    Ecall,
    Ebreak,
    Mret,
    Fence,
    FenceI,
    Csrrw,
    Csrrs,
    Csrrc,
    Csrrwi,
    Csrrsi,
    Csrrci,
    Bubble,
}

impl Op {
    /// Returns `true` for the five load operations.
    pub fn is_load(self) -> bool {
        matches!(self, Op::Lw | Op::Lh | Op::Lhu | Op::Lb | Op::Lbu)
    }

    /// Returns `true` for the three store operations.
    pub fn is_store(self) -> bool {
        matches!(self, Op::Sw | Op::Sh | Op::Sb)
    }

    /// Returns `true` for the six conditional branches.
    pub fn is_branch(self) -> bool {
        matches!(self, Op::Beq | Op::Bne | Op::Blt | Op::Bge | Op::Bltu | Op::Bgeu)
    }

    /// Returns `true` for the unconditional jumps.
    pub fn is_jump(self) -> bool {
        matches!(self, Op::Jal | Op::Jalr)
    }

    /// Returns `true` for the six Zicsr operations.
    pub fn is_csr(self) -> bool {
        matches!(
            self,
            Op::Csrrw | Op::Csrrs | Op::Csrrc | Op::Csrrwi | Op::Csrrsi | Op::Csrrci
        )
    }

    /// Returns `true` for the CSR operations whose source is the 5-bit
    /// zero-extended immediate rather than a register.
    pub fn csr_uses_immediate(self) -> bool {
        matches!(self, Op::Csrrwi | Op::Csrrsi | Op::Csrrci)
    }

    /// The assembly mnemonic of this operation.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Sll => "sll",
            Op::Srl => "srl",
            Op::Sra => "sra",
            Op::Slt => "slt",
            Op::Sltu => "sltu",
            Op::Addi => "addi",
            Op::Andi => "andi",
            Op::Ori => "ori",
            Op::Xori => "xori",
            Op::Slli => "slli",
            Op::Srli => "srli",
            Op::Srai => "srai",
            Op::Slti => "slti",
            Op::Sltiu => "sltiu",
            Op::Lui => "lui",
            Op::Auipc => "auipc",
            Op::Lw => "lw",
            Op::Lh => "lh",
            Op::Lhu => "lhu",
            Op::Lb => "lb",
            Op::Lbu => "lbu",
            Op::Sw => "sw",
            Op::Sh => "sh",
            Op::Sb => "sb",
            Op::Beq => "beq",
            Op::Bne => "bne",
            Op::Blt => "blt",
            Op::Bge => "bge",
            Op::Bltu => "bltu",
            Op::Bgeu => "bgeu",
            Op::Jal => "jal",
            Op::Jalr => "jalr",
            Op::Ecall => "ecall",
            Op::Ebreak => "ebreak",
            Op::Mret => "mret",
            Op::Fence => "fence",
            Op::FenceI => "fence.i",
            Op::Csrrw => "csrrw",
            Op::Csrrs => "csrrs",
            Op::Csrrc => "csrrc",
            Op::Csrrwi => "csrrwi",
            Op::Csrrsi => "csrrsi",
            Op::Csrrci => "csrrci",
            Op::Bubble => "bubble",
        }
    }
}

/// A single pre-decoded instruction flowing between the pipeline stages.
///
/// The static part (operation, register indices, immediate, CSR address) is
/// provided by the external decoder through [`Instruction::from_parts`] or
/// one of the shape-specific constructors. The carry fields are stamped by
/// the stages as the record travels: fetch records the instruction's own
/// `pc`, decode latches the source register values, execute attaches the
/// outcome, memory address, and jump target, and trap entry attaches the
/// trap record.
#[derive(Debug, Clone)]
pub struct Instruction {
    op: Op,
    dest: Option<Specifier>,
    srcs: Vec<Specifier>,
    immediate: i32,
    csr: Option<CsrSpecifier>,
    has_immediate: bool,
    // Carry fields.
    pc: u32,
    src_values: Vec<u32>,
    outcome: ExecuteOutcome,
    mem_address: Option<u32>,
    jump_target: Option<u32>,
    trap: Option<TrapEntry>,
}

impl Instruction {
    /// The decoder-facing constructor: builds a record from the full set of
    /// static fields. `is_bubble` overrides everything else.
    pub fn from_parts(
        op: Op,
        dest: Option<Specifier>,
        srcs: &[Specifier],
        immediate: i32,
        csr: Option<CsrSpecifier>,
        has_immediate: bool,
        is_bubble: bool,
    ) -> Self {
        let op = if is_bubble { Op::Bubble } else { op };
        Self {
            op,
            dest: if op == Op::Bubble { None } else { dest },
            srcs: srcs.to_vec(),
            immediate,
            csr,
            has_immediate,
            pc: 0,
            src_values: Vec::new(),
            outcome: ExecuteOutcome::None,
            mem_address: None,
            jump_target: None,
            trap: None,
        }
    }

    /// A pipeline bubble: traverses all stages without observable effects.
    pub fn bubble() -> Self {
        Self::from_parts(Op::Bubble, None, &[], 0, None, false, true)
    }

    /// An R-type register-register operation, e.g. `add dest, src1, src2`.
    pub fn reg(op: Op, dest: Specifier, src1: Specifier, src2: Specifier) -> Self {
        Self::from_parts(op, Some(dest), &[src1, src2], 0, None, false, false)
    }

    /// An I-type register-immediate operation, e.g. `addi dest, src, imm`.
    pub fn imm(op: Op, dest: Specifier, src: Specifier, immediate: i32) -> Self {
        Self::from_parts(op, Some(dest), &[src], immediate, None, true, false)
    }

    /// An upper-immediate operation (`lui`/`auipc`).
    pub fn upper(op: Op, dest: Specifier, immediate: i32) -> Self {
        Self::from_parts(op, Some(dest), &[], immediate, None, true, false)
    }

    /// A load, e.g. `lw dest, offset(base)`.
    pub fn load(op: Op, dest: Specifier, base: Specifier, offset: i32) -> Self {
        Self::from_parts(op, Some(dest), &[base], offset, None, false, false)
    }

    /// A store, e.g. `sw src, offset(base)`. The value register comes first
    /// in the source list, the base register second.
    pub fn store(op: Op, src: Specifier, base: Specifier, offset: i32) -> Self {
        Self::from_parts(op, None, &[src, base], offset, None, false, false)
    }

    /// A conditional branch, e.g. `beq src1, src2, offset`.
    pub fn branch(op: Op, src1: Specifier, src2: Specifier, offset: i32) -> Self {
        Self::from_parts(op, None, &[src1, src2], offset, None, false, false)
    }

    /// A `jal dest, offset` instruction.
    pub fn jal(dest: Specifier, offset: i32) -> Self {
        Self::from_parts(Op::Jal, Some(dest), &[], offset, None, false, false)
    }

    /// A `jalr dest, base, offset` instruction.
    pub fn jalr(dest: Specifier, base: Specifier, offset: i32) -> Self {
        Self::from_parts(Op::Jalr, Some(dest), &[base], offset, None, false, false)
    }

    /// A register-sourced CSR operation, e.g. `csrrw dest, csr, src`.
    pub fn csr(op: Op, dest: Specifier, csr: CsrSpecifier, src: Specifier) -> Self {
        Self::from_parts(op, Some(dest), &[src], 0, Some(csr), false, false)
    }

    /// An immediate-sourced CSR operation, e.g. `csrrwi dest, csr, zimm`.
    pub fn csri(op: Op, dest: Specifier, csr: CsrSpecifier, zimm: u32) -> Self {
        Self::from_parts(op, Some(dest), &[], zimm as i32, Some(csr), true, false)
    }

    /// An operand-less system instruction (`ecall`, `ebreak`, `mret`,
    /// `fence`, `fence.i`).
    pub fn system(op: Op) -> Self {
        Self::from_parts(op, None, &[], 0, None, false, false)
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn is_bubble(&self) -> bool {
        self.op == Op::Bubble
    }

    pub fn dest(&self) -> Option<Specifier> {
        self.dest
    }

    pub fn srcs(&self) -> &[Specifier] {
        &self.srcs
    }

    pub fn immediate(&self) -> i32 {
        self.immediate
    }

    pub fn csr_address(&self) -> Option<CsrSpecifier> {
        self.csr
    }

    pub fn has_immediate(&self) -> bool {
        self.has_immediate
    }

    /// The address this instruction was fetched from. Stamped by fetch.
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// The source register values latched in decode, in [`srcs`](Self::srcs)
    /// order.
    pub fn src_values(&self) -> &[u32] {
        &self.src_values
    }

    /// The outcome the execution unit produced (or that the memory stage
    /// substituted for loads).
    pub fn outcome(&self) -> ExecuteOutcome {
        self.outcome
    }

    /// The effective address computed in execute for loads and stores.
    pub fn mem_address(&self) -> Option<u32> {
        self.mem_address
    }

    /// The redirect target computed in execute for taken branches, jumps,
    /// and MRET.
    pub fn jump_target(&self) -> Option<u32> {
        self.jump_target
    }

    /// The trap record attached when this instruction entered a trap.
    pub fn trap(&self) -> Option<&TrapEntry> {
        self.trap.as_ref()
    }

    pub(crate) fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub(crate) fn set_src_values(&mut self, values: Vec<u32>) {
        self.src_values = values;
    }

    pub(crate) fn set_outcome(&mut self, outcome: ExecuteOutcome) {
        self.outcome = outcome;
    }

    pub(crate) fn set_mem_address(&mut self, address: Option<u32>) {
        self.mem_address = address;
    }

    pub(crate) fn set_jump_target(&mut self, target: u32) {
        self.jump_target = Some(target);
    }

    pub(crate) fn set_trap(&mut self, entry: TrapEntry) {
        self.trap = Some(entry);
    }

    /// Re-stamp this record as a bubble, keeping any attached trap record.
    /// Used for squashed wrong-path fetches and for instructions whose only
    /// architectural effect was the trap they entered.
    pub(crate) fn squash(&mut self) {
        self.op = Op::Bubble;
        self.dest = None;
        self.outcome = ExecuteOutcome::None;
        self.mem_address = None;
        self.jump_target = None;
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.op;
        write!(f, "{}", op.mnemonic())?;
        if op.is_load() {
            // lw x1, 8(x2)
            if let (Some(dest), Some(base)) = (self.dest, self.srcs.first()) {
                write!(f, " {dest}, {}({base})", self.immediate)?;
            }
        } else if op.is_store() {
            // sw x1, 8(x2)
            if let [src, base] = self.srcs[..] {
                write!(f, " {src}, {}({base})", self.immediate)?;
            }
        } else if op.is_csr() {
            if let (Some(dest), Some(csr)) = (self.dest, self.csr) {
                write!(f, " {dest}, {csr:#05x}, ")?;
                match self.srcs.first() {
                    Some(src) => write!(f, "{src}")?,
                    None => write!(f, "{}", self.immediate as u32 & 0x1F)?,
                }
            }
        } else {
            if let Some(dest) = self.dest {
                write!(f, " {dest}")?;
            }
            for src in &self.srcs {
                write!(f, " {src}")?;
            }
            if self.has_immediate || op.is_branch() || op.is_jump() {
                write!(f, " {}", self.immediate)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(i: u8) -> Specifier {
        Specifier::from_u5(i)
    }

    #[test]
    fn test_bubble_is_first_class() {
        let bubble = Instruction::bubble();
        assert!(bubble.is_bubble());
        assert_eq!(Op::Bubble, bubble.op());
        assert_eq!(None, bubble.dest());
        assert!(bubble.srcs().is_empty());
    }

    #[test]
    fn test_from_parts_bubble_marker_wins() {
        let inst = Instruction::from_parts(Op::Add, Some(x(1)), &[x(2)], 0, None, false, true);
        assert!(inst.is_bubble());
        assert_eq!(None, inst.dest());
    }

    #[test]
    fn test_reg_shape() {
        let inst = Instruction::reg(Op::Add, x(1), x(2), x(3));
        assert_eq!(Op::Add, inst.op());
        assert_eq!(Some(x(1)), inst.dest());
        assert_eq!(&[x(2), x(3)], inst.srcs());
        assert!(!inst.has_immediate());
    }

    #[test]
    fn test_store_source_order() {
        // The value register comes first, the base register second.
        let inst = Instruction::store(Op::Sw, x(5), x(6), 16);
        assert_eq!(None, inst.dest());
        assert_eq!(&[x(5), x(6)], inst.srcs());
        assert_eq!(16, inst.immediate());
    }

    #[test]
    fn test_squash_keeps_trap_field_shape() {
        let mut inst = Instruction::reg(Op::Add, x(1), x(2), x(3));
        inst.squash();
        assert!(inst.is_bubble());
        assert_eq!(None, inst.dest());
        assert!(inst.trap().is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!("add x1 x2 x3", Instruction::reg(Op::Add, x(1), x(2), x(3)).to_string());
        assert_eq!("lw x1, 8(x2)", Instruction::load(Op::Lw, x(1), x(2), 8).to_string());
        assert_eq!("sw x1, -4(x2)", Instruction::store(Op::Sw, x(1), x(2), -4).to_string());
        assert_eq!("bubble", Instruction::bubble().to_string());
    }
}
