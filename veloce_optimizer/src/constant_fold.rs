//! Integer and float constant folding.

use crate::deferred::DeferredQueue;
use veloce_bytecode::{Block, Instruction, Opcode};

/// Folds chains of integer literals through binary operations.
///
/// Two deferred `load_int_lit` instructions followed by an arithmetic or bitwise opcode collapse
/// into one literal. The operand popped first is the right operand, so the fold computes
/// `left op right` with `left` the literal pushed earlier. The folded literal is deferred again,
/// which lets longer constant chains collapse in a single pass.
///
/// Division and modulo by a zero right operand are not folded; the queue is flushed unmodified
/// and the operation is left for the runtime to trap.
pub(crate) fn fold_int(input: Block) -> Block {
    let mut output = Vec::with_capacity(input.len());
    let mut deferred = DeferredQueue::new();

    for instruction in input.instructions {
        match instruction.op {
            Opcode::LoadIntLit(_) => deferred.defer(instruction),
            Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::DivInt
            | Opcode::ModInt
            | Opcode::BitAndInt
            | Opcode::BitOrInt
            | Opcode::BitXorInt => fold_int_operation(instruction, &mut deferred, &mut output),
            _ => {
                deferred.flush_into(&mut output);
                output.push(instruction);
            }
        }
    }
    deferred.flush_into(&mut output);

    Block::new(output)
}

fn fold_int_operation(
    instruction: Instruction,
    deferred: &mut DeferredQueue,
    output: &mut Vec<Instruction>,
) {
    if deferred.len() < 2 {
        deferred.flush_into(output);
        output.push(instruction);
        return;
    }
    let (Some(right), Some(left)) = (deferred.pop_front(), deferred.pop_front()) else {
        return;
    };
    let (Opcode::LoadIntLit(right_value), Opcode::LoadIntLit(left_value)) = (right.op, left.op)
    else {
        return;
    };

    let value = match instruction.op {
        Opcode::AddInt => left_value.wrapping_add(right_value),
        Opcode::SubInt => left_value.wrapping_sub(right_value),
        Opcode::MulInt => left_value.wrapping_mul(right_value),
        Opcode::DivInt | Opcode::ModInt if right_value == 0 => {
            // leave the division for the runtime to trap
            deferred.defer(left);
            deferred.defer(right);
            deferred.flush_into(output);
            output.push(instruction);
            return;
        }
        Opcode::DivInt => left_value.wrapping_div(right_value),
        Opcode::ModInt => left_value.wrapping_rem(right_value),
        Opcode::BitAndInt => left_value & right_value,
        Opcode::BitOrInt => left_value | right_value,
        Opcode::BitXorInt => left_value ^ right_value,
        _ => return,
    };
    deferred.defer(Instruction {
        op: Opcode::LoadIntLit(value),
        line: instruction.line,
    });
}

/// Folds chains of float literals through `add`, `sub`, `mul`, and `div`.
///
/// Float division by zero is well-defined under IEEE 754, so it folds like any other operation.
pub(crate) fn fold_float(input: Block) -> Block {
    let mut output = Vec::with_capacity(input.len());
    let mut deferred = DeferredQueue::new();

    for instruction in input.instructions {
        match instruction.op {
            Opcode::LoadFloatLit(_) => deferred.defer(instruction),
            Opcode::AddFloat | Opcode::SubFloat | Opcode::MulFloat | Opcode::DivFloat => {
                fold_float_operation(instruction, &mut deferred, &mut output);
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

fn fold_float_operation(
    instruction: Instruction,
    deferred: &mut DeferredQueue,
    output: &mut Vec<Instruction>,
) {
    if deferred.len() < 2 {
        deferred.flush_into(output);
        output.push(instruction);
        return;
    }
    let (Some(right), Some(left)) = (deferred.pop_front(), deferred.pop_front()) else {
        return;
    };
    let (Opcode::LoadFloatLit(right_value), Opcode::LoadFloatLit(left_value)) = (right.op, left.op)
    else {
        return;
    };

    let value = match instruction.op {
        Opcode::AddFloat => left_value + right_value,
        Opcode::SubFloat => left_value - right_value,
        Opcode::MulFloat => left_value * right_value,
        Opcode::DivFloat => left_value / right_value,
        _ => return,
    };
    deferred.defer(Instruction {
        op: Opcode::LoadFloatLit(value),
        line: instruction.line,
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn block(ops: Vec<Opcode>) -> Block {
        Block::new(ops.into_iter().map(Instruction::new).collect())
    }

    #[test]
    fn test_add_folds() {
        let input = block(vec![
            Opcode::LoadIntLit(3),
            Opcode::LoadIntLit(4),
            Opcode::AddInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadIntLit(7), Opcode::Rtrn]);
        assert_eq!(expected, fold_int(input));
    }

    #[test]
    fn test_sub_uses_push_order() {
        // The operand pushed first is the left operand: 10 - 3, not 3 - 10.
        let input = block(vec![
            Opcode::LoadIntLit(10),
            Opcode::LoadIntLit(3),
            Opcode::SubInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadIntLit(7), Opcode::Rtrn]);
        assert_eq!(expected, fold_int(input));
    }

    #[test]
    fn test_chain_folds_in_one_pass() {
        let input = block(vec![
            Opcode::LoadIntLit(1),
            Opcode::LoadIntLit(2),
            Opcode::AddInt,
            Opcode::LoadIntLit(3),
            Opcode::MulInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadIntLit(9), Opcode::Rtrn]);
        assert_eq!(expected, fold_int(input));
    }

    #[test]
    fn test_bitwise_folds() {
        let input = block(vec![
            Opcode::LoadIntLit(0b1100),
            Opcode::LoadIntLit(0b1010),
            Opcode::BitXorInt,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadIntLit(0b0110), Opcode::Rtrn]);
        assert_eq!(expected, fold_int(input));
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let input = block(vec![
            Opcode::LoadIntLit(10),
            Opcode::LoadIntLit(0),
            Opcode::DivInt,
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), fold_int(input));
    }

    #[test]
    fn test_modulo_by_zero_not_folded() {
        let input = block(vec![
            Opcode::LoadIntLit(10),
            Opcode::LoadIntLit(0),
            Opcode::ModInt,
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), fold_int(input));
    }

    #[test]
    fn test_single_literal_flushed() {
        let input = block(vec![
            Opcode::LoadIntLit(3),
            Opcode::AddInt,
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), fold_int(input));
    }

    #[test]
    fn test_no_foldable_sequence_remains() {
        let input = block(vec![
            Opcode::LoadIntLit(1),
            Opcode::LoadIntLit(2),
            Opcode::AddInt,
            Opcode::LoadIntLit(4),
            Opcode::LoadIntLit(5),
            Opcode::MulInt,
            Opcode::AddInt,
            Opcode::Rtrn,
        ]);
        let output = fold_int(input);
        for window in output.instructions.windows(3) {
            let foldable = matches!(window[0].op, Opcode::LoadIntLit(_))
                && matches!(window[1].op, Opcode::LoadIntLit(_))
                && matches!(
                    window[2].op,
                    Opcode::AddInt
                        | Opcode::SubInt
                        | Opcode::MulInt
                        | Opcode::DivInt
                        | Opcode::ModInt
                        | Opcode::BitAndInt
                        | Opcode::BitOrInt
                        | Opcode::BitXorInt
                );
            assert!(!foldable, "foldable sequence survived: {window:?}");
        }
        assert_eq!(
            block(vec![Opcode::LoadIntLit(23), Opcode::Rtrn]),
            output
        );
    }

    #[test]
    fn test_float_folds() {
        let input = block(vec![
            Opcode::LoadFloatLit(1.5),
            Opcode::LoadFloatLit(2.0),
            Opcode::MulFloat,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadFloatLit(3.0), Opcode::Rtrn]);
        assert_eq!(expected, fold_float(input));
    }

    #[test]
    fn test_float_division_by_zero_folds_to_infinity() {
        let input = block(vec![
            Opcode::LoadFloatLit(1.0),
            Opcode::LoadFloatLit(0.0),
            Opcode::DivFloat,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadFloatLit(f64::INFINITY), Opcode::Rtrn]);
        assert_eq!(expected, fold_float(input));
    }

    #[test]
    fn test_float_sub_uses_push_order() {
        let input = block(vec![
            Opcode::LoadFloatLit(5.0),
            Opcode::LoadFloatLit(1.5),
            Opcode::SubFloat,
            Opcode::Rtrn,
        ]);
        let expected = block(vec![Opcode::LoadFloatLit(3.5), Opcode::Rtrn]);
        assert_eq!(expected, fold_float(input));
    }
}
