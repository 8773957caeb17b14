//! EXE, the pure-functional execution unit.
//!
//! [`evaluate`] maps an instruction record (with its source values already
//! latched by decode) to an [`Evaluation`]. It touches no shared state:
//! operations that need the CSR bank or the trap controller come back as
//! markers, which the owning pipeline stage resolves — MRET, ECALL, and
//! EBREAK in execute, the CSR read-modify-writes in writeback.

use log::trace;

use crate::core::csr::CsrSpecifier;
use crate::instruction::{Instruction, Op};

/// What the execution unit produced for an instruction.
///
/// A closed set, so the stages that resolve markers can match exhaustively.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ExecuteOutcome {
    /// Nothing to write back (bubbles, fences, stores, and loads until the
    /// memory stage substitutes the loaded value).
    #[default]
    None,
    /// An ordinary 32-bit result destined for the destination register.
    /// Branches produce `Value(1)` when taken and `Value(0)` otherwise.
    Value(u32),
    /// A CSR read-modify-write to be applied against the bank in writeback,
    /// using the source value latched on the instruction record.
    Csr { op: Op, address: CsrSpecifier },
    /// Environment call; routed through the trap controller in execute.
    Ecall,
    /// Environment breakpoint; routed through the trap controller in execute.
    Ebreak,
    /// Machine-mode trap return; resolved against the CSR bank in execute.
    Mret,
}

/// The full result of evaluating one instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Evaluation {
    pub outcome: ExecuteOutcome,
    /// Effective address for loads and stores.
    pub mem_address: Option<u32>,
    /// Redirect target for the unconditional jumps. Taken-branch targets are
    /// formed by the pipeline from the branch's own PC and offset.
    pub jump_target: Option<u32>,
}

impl Evaluation {
    fn outcome(outcome: ExecuteOutcome) -> Self {
        Self {
            outcome,
            mem_address: None,
            jump_target: None,
        }
    }
}

/// Evaluate `instruction`, using the source values decode latched onto it.
///
/// Operand width is 32 bits throughout; all arithmetic wraps modulo 2^32.
pub fn evaluate(instruction: &Instruction) -> Evaluation {
    let op = instruction.op();
    trace!("executing {instruction}");

    let src = |index: usize| instruction.src_values().get(index).copied().unwrap_or(0);
    let immediate = instruction.immediate();
    let pc = instruction.pc();

    if op.is_load() {
        // Loads carry the base register as their only source.
        return Evaluation {
            outcome: ExecuteOutcome::None,
            mem_address: Some(src(0).wrapping_add_signed(immediate)),
            jump_target: None,
        };
    }
    if op.is_store() {
        // Stores carry the value register first and the base register second.
        return Evaluation {
            outcome: ExecuteOutcome::None,
            mem_address: Some(src(1).wrapping_add_signed(immediate)),
            jump_target: None,
        };
    }
    if op.is_branch() {
        let taken = branch_taken(op, src(0), src(1));
        return Evaluation::outcome(ExecuteOutcome::Value(taken as u32));
    }
    if op.is_csr() {
        return Evaluation::outcome(ExecuteOutcome::Csr {
            op,
            address: instruction.csr_address().unwrap_or(0),
        });
    }

    match op {
        // > LUI places the U-immediate value in the top 20 bits of the
        // > destination register rd, filling in the lowest 12 bits with zeros.
        Op::Lui => Evaluation::outcome(ExecuteOutcome::Value(upper_immediate(immediate))),
        // > AUIPC forms a 32-bit offset from the 20-bit U-immediate, [...]
        // > adds this offset to the address of the AUIPC instruction, then
        // > places the result in register rd.
        Op::Auipc => Evaluation::outcome(ExecuteOutcome::Value(
            pc.wrapping_add(upper_immediate(immediate)),
        )),
        // The return value of both jumps is the address of the following
        // instruction; the target of JALR has its lowest bit forced to 0.
        Op::Jal => Evaluation {
            outcome: ExecuteOutcome::Value(pc.wrapping_add(4)),
            mem_address: None,
            jump_target: Some(pc.wrapping_add_signed(immediate)),
        },
        Op::Jalr => Evaluation {
            outcome: ExecuteOutcome::Value(pc.wrapping_add(4)),
            mem_address: None,
            jump_target: Some(src(0).wrapping_add_signed(immediate) & !1),
        },
        Op::Ecall => Evaluation::outcome(ExecuteOutcome::Ecall),
        Op::Ebreak => Evaluation::outcome(ExecuteOutcome::Ebreak),
        Op::Mret => Evaluation::outcome(ExecuteOutcome::Mret),
        // Memory ordering is trivial on a single in-order hart; fences
        // traverse the pipeline and retire without touching any state.
        Op::Fence | Op::FenceI => Evaluation::outcome(ExecuteOutcome::None),
        Op::Bubble => Evaluation::outcome(ExecuteOutcome::None),
        _ => {
            let operand1 = src(0);
            let operand2 = match instruction.has_immediate() {
                true => immediate as u32,
                false => src(1),
            };
            Evaluation::outcome(ExecuteOutcome::Value(alu(op, operand1, operand2)))
        }
    }
}

fn upper_immediate(immediate: i32) -> u32 {
    (immediate as u32 & 0xF_FFFF) << 12
}

/// Evaluate a register/immediate ALU operation on two 32-bit operands.
fn alu(op: Op, operand1: u32, operand2: u32) -> u32 {
    match op {
        Op::Add | Op::Addi => operand1.wrapping_add(operand2),
        Op::Sub => operand1.wrapping_sub(operand2),
        Op::And | Op::Andi => operand1 & operand2,
        Op::Or | Op::Ori => operand1 | operand2,
        Op::Xor | Op::Xori => operand1 ^ operand2,
        // Shift amounts use the low 5 bits of the shift operand.
        Op::Sll | Op::Slli => operand1 << (operand2 & 0x1F),
        Op::Srl | Op::Srli => operand1 >> (operand2 & 0x1F),
        // > SRAI is an arithmetic right shift (the original sign bit is
        // > copied into the vacated upper bits).
        Op::Sra | Op::Srai => ((operand1 as i32) >> (operand2 & 0x1F)) as u32,
        Op::Slt | Op::Slti => ((operand1 as i32) < (operand2 as i32)) as u32,
        Op::Sltu | Op::Sltiu => (operand1 < operand2) as u32,
        // All other operations are dispatched before reaching the ALU.
        _ => unreachable!("non-ALU operation {op:?} routed to the ALU"),
    }
}

/// Evaluate a branch predicate on two 32-bit operands.
fn branch_taken(op: Op, value1: u32, value2: u32) -> bool {
    match op {
        Op::Beq => value1 == value2,
        Op::Bne => value1 != value2,
        Op::Blt => (value1 as i32) < (value2 as i32),
        Op::Bge => (value1 as i32) >= (value2 as i32),
        Op::Bltu => value1 < value2,
        Op::Bgeu => value1 >= value2,
        _ => unreachable!("non-branch operation {op:?} routed to the branch unit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Specifier;

    fn x(i: u8) -> Specifier {
        Specifier::from_u5(i)
    }

    fn eval_reg(op: Op, value1: u32, value2: u32) -> ExecuteOutcome {
        let mut inst = Instruction::reg(op, x(1), x(2), x(3));
        inst.set_src_values(vec![value1, value2]);
        evaluate(&inst).outcome
    }

    fn eval_imm(op: Op, value: u32, immediate: i32) -> ExecuteOutcome {
        let mut inst = Instruction::imm(op, x(1), x(2), immediate);
        inst.set_src_values(vec![value]);
        evaluate(&inst).outcome
    }

    #[test]
    fn test_arithmetic_wraps() {
        assert_eq!(ExecuteOutcome::Value(0), eval_reg(Op::Add, u32::MAX, 1));
        assert_eq!(ExecuteOutcome::Value(u32::MAX), eval_reg(Op::Sub, 0, 1));
        assert_eq!(ExecuteOutcome::Value(30), eval_reg(Op::Add, 10, 20));
    }

    #[test]
    fn test_logic_ops() {
        assert_eq!(ExecuteOutcome::Value(0b1000), eval_reg(Op::And, 0b1100, 0b1010));
        assert_eq!(ExecuteOutcome::Value(0b1110), eval_reg(Op::Or, 0b1100, 0b1010));
        assert_eq!(ExecuteOutcome::Value(0b0110), eval_reg(Op::Xor, 0b1100, 0b1010));
        assert_eq!(ExecuteOutcome::Value(0xF0), eval_imm(Op::Andi, 0xFF, 0xF0));
    }

    #[test]
    fn test_shift_amount_uses_low_5_bits() {
        assert_eq!(ExecuteOutcome::Value(1 << 4), eval_reg(Op::Sll, 1, 36));
        assert_eq!(ExecuteOutcome::Value(1), eval_reg(Op::Sll, 1, 32));
        assert_eq!(ExecuteOutcome::Value(0x0800_0000), eval_reg(Op::Srl, 0x8000_0000, 4));
        assert_eq!(ExecuteOutcome::Value(4), eval_imm(Op::Srli, 64, 4));
    }

    #[test]
    fn test_sra_replicates_sign_bit() {
        assert_eq!(
            ExecuteOutcome::Value(0xF800_0000),
            eval_reg(Op::Sra, 0x8000_0000, 4)
        );
        assert_eq!(ExecuteOutcome::Value(0x0800_0000), eval_reg(Op::Srl, 0x8000_0000, 4));
        assert_eq!(ExecuteOutcome::Value(u32::MAX), eval_reg(Op::Sra, u32::MAX, 31));
    }

    #[test]
    fn test_signed_and_unsigned_compare() {
        // -1 < 1 signed, but 0xFFFFFFFF > 1 unsigned.
        assert_eq!(ExecuteOutcome::Value(1), eval_reg(Op::Slt, u32::MAX, 1));
        assert_eq!(ExecuteOutcome::Value(0), eval_reg(Op::Sltu, u32::MAX, 1));
        assert_eq!(ExecuteOutcome::Value(1), eval_imm(Op::Slti, u32::MAX, 1));
        assert_eq!(ExecuteOutcome::Value(0), eval_imm(Op::Sltiu, u32::MAX, 1));
    }

    #[test]
    fn test_lui_and_auipc() {
        let inst = Instruction::upper(Op::Lui, x(1), 0x12345);
        assert_eq!(
            ExecuteOutcome::Value(0x1234_5000),
            evaluate(&inst).outcome
        );

        let mut inst = Instruction::upper(Op::Auipc, x(1), 0x1);
        inst.set_pc(0x400);
        assert_eq!(ExecuteOutcome::Value(0x1400), evaluate(&inst).outcome);
    }

    #[test]
    fn test_jal() {
        let mut inst = Instruction::jal(x(1), -8);
        inst.set_pc(0x100);
        let evaluation = evaluate(&inst);
        assert_eq!(ExecuteOutcome::Value(0x104), evaluation.outcome);
        assert_eq!(Some(0xF8), evaluation.jump_target);
    }

    #[test]
    fn test_jalr_clears_low_bit() {
        for base in [0x200u32, 0x201] {
            let mut inst = Instruction::jalr(x(1), x(2), 1);
            inst.set_pc(0x100);
            inst.set_src_values(vec![base]);
            let evaluation = evaluate(&inst);
            assert_eq!(ExecuteOutcome::Value(0x104), evaluation.outcome);
            assert_eq!(Some((base + 1) & !1), evaluation.jump_target);
        }
    }

    #[test]
    fn test_branch_predicates() {
        let taken = |op, a, b| {
            let mut inst = Instruction::branch(op, x(1), x(2), 16);
            inst.set_src_values(vec![a, b]);
            evaluate(&inst).outcome == ExecuteOutcome::Value(1)
        };
        assert!(taken(Op::Beq, 5, 5));
        assert!(!taken(Op::Beq, 5, 6));
        assert!(taken(Op::Bne, 5, 6));
        assert!(taken(Op::Blt, u32::MAX, 0)); // -1 < 0 signed
        assert!(!taken(Op::Bltu, u32::MAX, 0));
        assert!(taken(Op::Bge, 0, u32::MAX)); // 0 >= -1 signed
        assert!(taken(Op::Bgeu, u32::MAX, 0));
    }

    #[test]
    fn test_memory_address_computation() {
        let mut load = Instruction::load(Op::Lw, x(1), x(2), -4);
        load.set_src_values(vec![0x1000]);
        assert_eq!(Some(0xFFC), evaluate(&load).mem_address);

        // Stores carry [value, base]; the address comes from the base.
        let mut store = Instruction::store(Op::Sw, x(1), x(2), 8);
        store.set_src_values(vec![0xAAAA_AAAA, 0x2000]);
        assert_eq!(Some(0x2008), evaluate(&store).mem_address);
    }

    #[test]
    fn test_markers() {
        assert_eq!(
            ExecuteOutcome::Ecall,
            evaluate(&Instruction::system(Op::Ecall)).outcome
        );
        assert_eq!(
            ExecuteOutcome::Ebreak,
            evaluate(&Instruction::system(Op::Ebreak)).outcome
        );
        assert_eq!(
            ExecuteOutcome::Mret,
            evaluate(&Instruction::system(Op::Mret)).outcome
        );
        let csr = Instruction::csr(Op::Csrrw, x(1), 0x300, x(2));
        assert_eq!(
            ExecuteOutcome::Csr {
                op: Op::Csrrw,
                address: 0x300
            },
            evaluate(&csr).outcome
        );
    }

    #[test]
    fn test_fence_is_a_no_op() {
        for op in [Op::Fence, Op::FenceI] {
            let evaluation = evaluate(&Instruction::system(op));
            assert_eq!(ExecuteOutcome::None, evaluation.outcome);
            assert_eq!(None, evaluation.mem_address);
            assert_eq!(None, evaluation.jump_target);
        }
    }
}
