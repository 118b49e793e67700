//! Strength reduction: multiplies and divides by small powers of two become shifts.

use crate::deferred::DeferredQueue;
use veloce_bytecode::{Block, Instruction, Opcode};

/// Rewrites `mul_int` and `div_int` with a literal power-of-two operand in `{2, 4, ..., 256}`
/// into `shl_int` and `shr_int`.
///
/// Both operand orders are recognized for multiplication. Division only reduces when the literal
/// is the right operand (`x / k`); `k / x` is not a shift.
pub(crate) fn run(input: Block) -> Block {
    let mut output = Vec::with_capacity(input.len());
    let mut deferred = DeferredQueue::new();

    for instruction in input.instructions {
        match instruction.op {
            Opcode::LoadIntLit(_) | Opcode::LoadIntVar { .. } => deferred.defer(instruction),
            Opcode::MulInt | Opcode::DivInt => {
                reduce(instruction, &mut deferred, &mut output);
            }
            _ => {
                deferred.flush_into(&mut output);
                output.push(instruction);
            }
        }
    }
    deferred.flush_into(&mut output);

    Block::new(output)
}

/// The shift amount for a power-of-two multiplier, limited to `{2, 4, ..., 256}`.
fn shift_amount(value: i64) -> Option<i64> {
    match value {
        2 => Some(1),
        4 => Some(2),
        8 => Some(3),
        16 => Some(4),
        32 => Some(5),
        64 => Some(6),
        128 => Some(7),
        256 => Some(8),
        _ => None,
    }
}

fn reduce(instruction: Instruction, deferred: &mut DeferredQueue, output: &mut Vec<Instruction>) {
    if deferred.len() < 2 {
        deferred.flush_into(output);
        output.push(instruction);
        return;
    }
    let Some(top) = deferred.pop_front() else {
        return;
    };

    match top.op {
        // var; lit k; op  =>  var op k
        Opcode::LoadIntLit(literal)
            if matches!(deferred.front().map(|i| i.op), Some(Opcode::LoadIntVar { .. })) =>
        {
            let Some(variable) = deferred.pop_front() else {
                return;
            };
            emit(literal, variable, top, false, instruction, deferred, output);
        }
        // lit k; var; op  =>  k op var; only a shift when the operation commutes
        Opcode::LoadIntVar { .. }
            if matches!(deferred.front().map(|i| i.op), Some(Opcode::LoadIntLit(_))) =>
        {
            if instruction.op == Opcode::MulInt {
                let Some(literal_instruction) = deferred.pop_front() else {
                    return;
                };
                let Opcode::LoadIntLit(literal) = literal_instruction.op else {
                    return;
                };
                emit(
                    literal,
                    top,
                    literal_instruction,
                    true,
                    instruction,
                    deferred,
                    output,
                );
            } else {
                add_back(top, instruction, deferred, output);
            }
        }
        _ => add_back(top, instruction, deferred, output),
    }
}

/// Emits the shift rewrite, or restores the operands in source order when the literal is not a
/// reducible power of two. `literal_first` records which operand came first in the source.
fn emit(
    literal: i64,
    variable: Instruction,
    literal_instruction: Instruction,
    literal_first: bool,
    instruction: Instruction,
    deferred: &mut DeferredQueue,
    output: &mut Vec<Instruction>,
) {
    deferred.flush_into(output);
    match shift_amount(literal) {
        Some(shift) => {
            output.push(variable);
            output.push(Instruction {
                op: Opcode::LoadIntLit(shift),
                line: instruction.line,
            });
            let shifted = if instruction.op == Opcode::MulInt {
                Opcode::ShlInt(shift)
            } else {
                Opcode::ShrInt(shift)
            };
            output.push(Instruction {
                op: shifted,
                line: instruction.line,
            });
        }
        None => {
            if literal_first {
                output.push(literal_instruction);
                output.push(variable);
            } else {
                output.push(variable);
                output.push(literal_instruction);
            }
            output.push(instruction);
        }
    }
}

fn add_back(
    top: Instruction,
    instruction: Instruction,
    deferred: &mut DeferredQueue,
    output: &mut Vec<Instruction>,
) {
    deferred.flush_into(output);
    output.push(top);
    output.push(instruction);
}

#[cfg(test)]
mod test {
    use super::*;
    use veloce_bytecode::MemoryContext;

    fn block(ops: Vec<Opcode>) -> Block {
        Block::new(ops.into_iter().map(Instruction::new).collect())
    }

    fn var(slot: u32) -> Opcode {
        Opcode::LoadIntVar {
            slot,
            context: MemoryContext::Local,
        }
    }

    #[test]
    fn test_multiply_by_eight_becomes_shift() {
        let input = block(vec![
            var(1),
            Opcode::LoadIntLit(8),
            Opcode::MulInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            var(1),
            Opcode::LoadIntLit(3),
            Opcode::ShlInt(3),
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }

    #[test]
    fn test_multiply_literal_first_also_reduces() {
        let input = block(vec![
            Opcode::LoadIntLit(16),
            var(1),
            Opcode::MulInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            var(1),
            Opcode::LoadIntLit(4),
            Opcode::ShlInt(4),
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }

    #[test]
    fn test_divide_by_power_of_two_becomes_shift() {
        let input = block(vec![
            var(2),
            Opcode::LoadIntLit(4),
            Opcode::DivInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            var(2),
            Opcode::LoadIntLit(2),
            Opcode::ShrInt(2),
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }

    #[test]
    fn test_literal_over_variable_not_reduced() {
        // 256 / x is not a shift of x
        let input = block(vec![
            Opcode::LoadIntLit(256),
            var(1),
            Opcode::DivInt,
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_non_power_of_two_unchanged() {
        let input = block(vec![
            var(1),
            Opcode::LoadIntLit(5),
            Opcode::MulInt,
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_largest_multiplier() {
        let input = block(vec![
            var(1),
            Opcode::LoadIntLit(256),
            Opcode::MulInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            var(1),
            Opcode::LoadIntLit(8),
            Opcode::ShlInt(8),
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }

    #[test]
    fn test_out_of_range_power_unchanged() {
        let input = block(vec![
            var(1),
            Opcode::LoadIntLit(512),
            Opcode::MulInt,
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_no_power_of_two_multiplies_remain() {
        let input = block(vec![
            var(1),
            Opcode::LoadIntLit(2),
            Opcode::MulInt,
            var(2),
            Opcode::LoadIntLit(64),
            Opcode::MulInt,
            Opcode::AddInt,
            Opcode::Rtrn,
        ]);
        let output = run(input);
        for window in output.instructions.windows(3) {
            let reducible = matches!(window[2].op, Opcode::MulInt)
                && (matches!(window[0].op, Opcode::LoadIntLit(v) if shift_amount(v).is_some())
                    || matches!(window[1].op, Opcode::LoadIntLit(v) if shift_amount(v).is_some()));
            assert!(!reducible, "reducible multiply survived: {window:?}");
        }
    }

    #[test]
    fn test_two_variables_unchanged() {
        let input = block(vec![var(1), var(2), Opcode::MulInt, Opcode::Rtrn]);
        assert_eq!(input.clone(), run(input));
    }
}
