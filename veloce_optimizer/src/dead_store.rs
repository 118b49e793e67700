//! Dead store removal: drops a local load immediately written back to the same slot.

use crate::deferred::DeferredQueue;
use veloce_bytecode::{Block, MemoryContext, Opcode};

/// Removes `load_int_var s, local; stor_int_var s, local` pairs.
///
/// The pair pushes a slot and writes it straight back, so both instructions are dead. Stores to
/// instance or class scope and stores whose preceding load reads a different slot are preserved.
pub(crate) fn run(input: Block) -> Block {
    let mut output = Vec::with_capacity(input.len());
    let mut deferred = DeferredQueue::new();

    for instruction in input.instructions {
        match instruction.op {
            Opcode::LoadIntVar { context, .. } if context == MemoryContext::Local => {
                deferred.defer(instruction);
            }
            Opcode::StorIntVar { slot, context } if context == MemoryContext::Local => {
                let matching = deferred.front().is_some_and(|front| {
                    matches!(
                        front.op,
                        Opcode::LoadIntVar {
                            slot: loaded,
                            context: MemoryContext::Local,
                        } if loaded == slot
                    )
                });
                if matching {
                    deferred.pop_front();
                } else {
                    deferred.flush_into(&mut output);
                    output.push(instruction);
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
