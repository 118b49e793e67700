//! Whole-method inlining: splices eligible leaf callees into the caller.

use std::collections::HashSet;
use tracing::debug;
use veloce_bytecode::{
    Block, Instruction, MemoryContext, Method, Opcode, Program, WORD_SIZE,
};

/// Opcodes that disqualify a callee from inlining: anything that calls back into the runtime, and
/// function-value locals, which the splice does not remap.
fn is_unsupported(op: Opcode) -> bool {
    match op {
        Opcode::MthdCall { .. }
        | Opcode::DynMthdCall { .. }
        | Opcode::AsyncMthdCall { .. }
        | Opcode::Trap { .. }
        | Opcode::TrapRtrn { .. }
        | Opcode::ThreadJoin
        | Opcode::ThreadSleep
        | Opcode::ThreadMutex
        | Opcode::CriticalStart
        | Opcode::CriticalEnd
        | Opcode::DllLoad
        | Opcode::DllUnload
        | Opcode::DllFuncCall => true,
        Opcode::LoadFuncVar { context, .. } | Opcode::StorFuncVar { context, .. } => {
            context == MemoryContext::Local
        }
        _ => false,
    }
}

/// A callee is eligible when it has exactly one block ending in its only return, is not already
/// recorded for this caller, has labels disjoint from the caller's, and contains no unsupported
/// opcodes. Callees with multiple returns stay un-inlined.
fn can_inline(
    callee: &Method,
    inlined: &HashSet<(u32, u32)>,
    used_labels: &HashSet<u32>,
    key: (u32, u32),
) -> bool {
    if inlined.contains(&key) || callee.blocks.len() != 1 {
        return false;
    }
    let instructions = &callee.blocks[0].instructions;
    let Some(last) = instructions.last() else {
        return false;
    };
    if last.op != Opcode::Rtrn {
        return false;
    }
    let return_count = instructions
        .iter()
        .filter(|instruction| instruction.op == Opcode::Rtrn)
        .count();
    if return_count != 1 {
        return false;
    }
    for instruction in instructions {
        if is_unsupported(instruction.op) {
            return false;
        }
        match instruction.op {
            Opcode::Lbl { id } if used_labels.contains(&id) => return false,
            Opcode::Jmp { label, .. } if used_labels.contains(&label) => return false,
            _ => {}
        }
    }
    true
}

/// Inlines eligible static calls within the block.
///
/// `frame_size` is the caller's local frame size in bytes; every inline enlarges it by the
/// callee's frame plus two words, one for the saved self reference and one of slack in case the
/// caller's last variable is a double.
pub(crate) fn run(input: Block, program: &Program, frame_size: &mut u32) -> Block {
    let mut inlined: HashSet<(u32, u32)> = HashSet::new();
    let mut used_labels: HashSet<u32> = HashSet::new();
    for instruction in &input.instructions {
        match instruction.op {
            Opcode::Lbl { id } => {
                used_labels.insert(id);
            }
            Opcode::Jmp { label, .. } => {
                used_labels.insert(label);
            }
            _ => {}
        }
    }

    let mut output = Vec::with_capacity(input.len());
    for instruction in input.instructions {
        let Opcode::MthdCall { class, method, .. } = instruction.op else {
            output.push(instruction);
            continue;
        };
        let Some(callee) = program.method(class, method) else {
            output.push(instruction);
            continue;
        };
        if !can_inline(callee, &inlined, &used_labels, (class, method)) {
            output.push(instruction);
            continue;
        }

        // reserve the slot after the caller frame, leaving one word of slack in case the last
        // variable is a double
        let offset = *frame_size / WORD_SIZE + 1;
        *frame_size += callee.local_frame_size + 2 * WORD_SIZE;
        debug!(
            "inlining method {class}.{method} at local offset {offset}; caller frame now {frame_size} bytes"
        );

        // save the incoming self reference
        output.push(Instruction {
            op: Opcode::StorIntVar {
                slot: offset,
                context: MemoryContext::Local,
            },
            line: instruction.line,
        });

        let body = &callee.blocks[0].instructions;
        for callee_instruction in &body[..body.len() - 1] {
            let remapped = remap(callee_instruction.op, offset);
            match remapped {
                Some(op) => output.push(Instruction {
                    op,
                    line: instruction.line,
                }),
                None => output.push(*callee_instruction),
            }
            match callee_instruction.op {
                Opcode::Lbl { id } => {
                    used_labels.insert(id);
                }
                Opcode::Jmp { label, .. } => {
                    used_labels.insert(label);
                }
                _ => {}
            }
        }
        inlined.insert((class, method));
    }

    Block::new(output)
}

/// Rewrites local variable slots by the inline offset and redirects self loads to the saved
/// reference. Instance and class accesses pass through unchanged.
fn remap(op: Opcode, offset: u32) -> Option<Opcode> {
    let remapped = match op {
        Opcode::LoadIntVar {
            slot,
            context: MemoryContext::Local,
        } => Opcode::LoadIntVar {
            slot: slot + offset + 1,
            context: MemoryContext::Local,
        },
        Opcode::StorIntVar {
            slot,
            context: MemoryContext::Local,
        } => Opcode::StorIntVar {
            slot: slot + offset + 1,
            context: MemoryContext::Local,
        },
        Opcode::CopyIntVar {
            slot,
            context: MemoryContext::Local,
        } => Opcode::CopyIntVar {
            slot: slot + offset + 1,
            context: MemoryContext::Local,
        },
        Opcode::LoadFloatVar {
            slot,
            context: MemoryContext::Local,
        } => Opcode::LoadFloatVar {
            slot: slot + offset + 1,
            context: MemoryContext::Local,
        },
        Opcode::StorFloatVar {
            slot,
            context: MemoryContext::Local,
        } => Opcode::StorFloatVar {
            slot: slot + offset + 1,
            context: MemoryContext::Local,
        },
        Opcode::CopyFloatVar {
            slot,
            context: MemoryContext::Local,
        } => Opcode::CopyFloatVar {
            slot: slot + offset + 1,
            context: MemoryContext::Local,
        },
        Opcode::LoadInstMem => Opcode::LoadIntVar {
            slot: offset,
            context: MemoryContext::Local,
        },
        _ => return None,
    };
    Some(remapped)
}
