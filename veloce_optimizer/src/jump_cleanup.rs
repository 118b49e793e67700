//! Jump cleanup: removes unconditional jumps to the immediately following label.

use crate::deferred::DeferredQueue;
use veloce_bytecode::{Block, Opcode};

/// Fuses `jmp L; lbl L` into `lbl L`.
///
/// Pending jumps are deferred; when a label arrives and the most recent deferred jump is an
/// unconditional jump to that label, the jump is dropped. An unconditional jump to the
/// immediately following label is always dead. Conditional jumps also pop their condition, so
/// they are never dropped.
pub(crate) fn run(input: Block) -> Block {
    let mut output = Vec::with_capacity(input.len());
    let mut deferred = DeferredQueue::new();

    for instruction in input.instructions {
        match instruction.op {
            Opcode::Jmp { .. } => deferred.defer(instruction),
            Opcode::Lbl { id } => {
                let fused = deferred.front().is_some_and(|front| {
                    matches!(
                        front.op,
                        Opcode::Jmp { label, condition } if condition < 0 && label == id
                    )
                });
                if fused {
                    deferred.pop_front();
                }
                deferred.flush_into(&mut output);
                output.push(instruction);
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
