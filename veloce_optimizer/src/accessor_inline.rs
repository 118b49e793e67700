//! Setter/getter inlining: replaces calls to trivial accessors with their bodies.

use tracing::debug;
use veloce_bytecode::{Block, Instruction, Method, Opcode, Program};

/// The four accessor shapes eligible for inlining.
///
/// Every shape is matched structurally against the callee's single block, and every spliced
/// sequence has the same net stack effect as the call it replaces. The caller has already pushed
/// the self reference; splices that do not consume it start with `pop_int`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AccessorShape {
    /// `load_inst_mem; load_*_var s, instance; rtrn`: the spliced field load consumes the
    /// pushed self as its base reference.
    InstanceGetter,
    /// `load_*_lit; rtrn`: the self reference is discarded and the literal pushed.
    ConstantGetter,
    /// `load_char_lit; trap; rtrn`: a helper that prints a fixed character.
    CharPrint,
    /// `pop_int; load_*_lit; rtrn`: the callee's own pop consumes the self reference.
    PoppingGetter,
}

/// Replaces calls to methods matching one of the accessor shapes with the callee's instructions.
pub(crate) fn run(input: Block, program: &Program) -> Block {
    let mut output = Vec::with_capacity(input.len());

    for instruction in input.instructions {
        let Opcode::MthdCall { class, method, .. } = instruction.op else {
            output.push(instruction);
            continue;
        };
        let callee = program.method(class, method);
        let shape = callee.and_then(classify);
        let (Some(callee), Some(shape)) = (callee, shape) else {
            output.push(instruction);
            continue;
        };

        debug!("inlining accessor {class}.{method}: {shape:?}");
        let body = &callee.blocks[0].instructions;
        let pop = Instruction {
            op: Opcode::PopInt,
            line: instruction.line,
        };
        match shape {
            AccessorShape::InstanceGetter => output.push(body[1]),
            AccessorShape::ConstantGetter => {
                output.push(pop);
                output.push(body[0]);
            }
            AccessorShape::CharPrint => {
                output.push(pop);
                output.push(body[0]);
                output.push(body[1]);
            }
            AccessorShape::PoppingGetter => output.push(body[1]),
        }
    }

    Block::new(output)
}

/// Matches a callee against the accessor shapes.
fn classify(method: &Method) -> Option<AccessorShape> {
    if method.param_count != 0 || method.blocks.len() != 1 {
        return None;
    }
    let ops: Vec<Opcode> = method.blocks[0]
        .instructions
        .iter()
        .map(|instruction| instruction.op)
        .collect();

    let shape = match ops.as_slice() {
        [
            Opcode::LoadInstMem,
            Opcode::LoadIntVar {
                context: veloce_bytecode::MemoryContext::Instance,
                ..
            }
            | Opcode::LoadFloatVar {
                context: veloce_bytecode::MemoryContext::Instance,
                ..
            },
            Opcode::Rtrn,
        ] => AccessorShape::InstanceGetter,
        [
            Opcode::LoadIntLit(_) | Opcode::LoadFloatLit(_) | Opcode::LoadCharLit(_),
            Opcode::Rtrn,
        ] => AccessorShape::ConstantGetter,
        [Opcode::LoadCharLit(_), Opcode::Trap { .. }, Opcode::Rtrn] => AccessorShape::CharPrint,
        [
            Opcode::PopInt,
            Opcode::LoadIntLit(_) | Opcode::LoadFloatLit(_) | Opcode::LoadCharLit(_),
            Opcode::Rtrn,
        ] => AccessorShape::PoppingGetter,
        _ => return None,
    };
    Some(shape)
}
