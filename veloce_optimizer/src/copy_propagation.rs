//! Copy propagation: a store immediately reloaded becomes a copy.

use crate::deferred::DeferredQueue;
use veloce_bytecode::{Block, Instruction, Opcode};

/// Rewrites `stor_*_var s, ctx; load_*_var s, ctx` into `copy_*_var s, ctx`.
///
/// The copy stores the top of the operand stack without popping it, which is exactly the effect
/// of the store-reload pair. The rewrite requires the same slot and context and matching value
/// types. A store followed by another store flushes the first to the output.
pub(crate) fn run(input: Block) -> Block {
    let mut output = Vec::with_capacity(input.len());
    let mut deferred = DeferredQueue::new();

    for instruction in input.instructions {
        match instruction.op {
            Opcode::LoadIntVar { .. } | Opcode::LoadFloatVar { .. } => {
                replace(instruction, &mut deferred, &mut output);
            }
            Opcode::StorIntVar { .. } | Opcode::StorFloatVar { .. } => {
                let store_pending = deferred.front().is_some_and(|front| {
                    matches!(
                        front.op,
                        Opcode::StorIntVar { .. } | Opcode::StorFloatVar { .. }
                    )
                });
                if store_pending {
                    deferred.flush_into(&mut output);
                    output.push(instruction);
                } else {
                    deferred.defer(instruction);
                }
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

fn replace(instruction: Instruction, deferred: &mut DeferredQueue, output: &mut Vec<Instruction>) {
    let Some(front) = deferred.front() else {
        output.push(instruction);
        return;
    };

    let copy = match (front.op, instruction.op) {
        (
            Opcode::StorIntVar {
                slot: stored,
                context: stored_context,
            },
            Opcode::LoadIntVar { slot, context },
        ) if stored == slot && stored_context == context => Some(Opcode::CopyIntVar { slot, context }),
        (
            Opcode::StorFloatVar {
                slot: stored,
                context: stored_context,
            },
            Opcode::LoadFloatVar { slot, context },
        ) if stored == slot && stored_context == context => {
            Some(Opcode::CopyFloatVar { slot, context })
        }
        _ => None,
    };

    match copy {
        Some(op) => {
            deferred.pop_front();
            output.push(Instruction {
                op,
                line: instruction.line,
            });
        }
        None => {
            deferred.flush_into(output);
            output.push(instruction);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use veloce_bytecode::MemoryContext;

    fn block(ops: Vec<Opcode>) -> Block {
        Block::new(ops.into_iter().map(Instruction::new).collect())
    }

    #[test]
    fn test_store_reload_becomes_copy() {
        let input = block(vec![
            Opcode::StorIntVar {
                slot: 2,
                context: MemoryContext::Local,
            },
            Opcode::LoadIntVar {
                slot: 2,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            Opcode::CopyIntVar {
                slot: 2,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }

    #[test]
    fn test_float_store_reload_becomes_copy() {
        let input = block(vec![
            Opcode::StorFloatVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::LoadFloatVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            Opcode::CopyFloatVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }

    #[test]
    fn test_type_mismatch_preserved() {
        let input = block(vec![
            Opcode::StorIntVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::LoadFloatVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_slot_mismatch_preserved() {
        let input = block(vec![
            Opcode::StorIntVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::LoadIntVar {
                slot: 2,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_context_mismatch_preserved() {
        let input = block(vec![
            Opcode::StorIntVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::LoadIntVar {
                slot: 1,
                context: MemoryContext::Instance,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_store_store_flushes_first() {
        let input = block(vec![
            Opcode::StorIntVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::StorIntVar {
                slot: 2,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(input.clone(), run(input));
    }

    #[test]
    fn test_copy_in_instance_context() {
        let input = block(vec![
            Opcode::StorIntVar {
                slot: 0,
                context: MemoryContext::Instance,
            },
            Opcode::LoadIntVar {
                slot: 0,
                context: MemoryContext::Instance,
            },
            Opcode::Rtrn,
        ]);
        let expected = block(vec![
            Opcode::CopyIntVar {
                slot: 0,
                context: MemoryContext::Instance,
            },
            Opcode::Rtrn,
        ]);
        assert_eq!(expected, run(input));
    }
}
