//! Symbolic values on the compile-time working stack.

use crate::register::{Gpr, Xmm};

/// The translator's model of one runtime operand stack entry.
///
/// Values stay symbolic for as long as possible: literals are unevaluated immediates and local
/// variables are frame memory references until an instruction forces them into a register.
/// Operands are never mutated in place; every transformation pops and pushes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Operand {
    /// An unevaluated integer literal.
    IntImm(i64),
    /// An integer live in a general purpose register.
    IntReg(Gpr),
    /// An integer in the frame at the given RBP-relative offset.
    IntMem(i32),
    /// An unevaluated float literal.
    FloatImm(f64),
    /// A float live in an SSE register.
    FloatReg(Xmm),
    /// A float in the frame at the given RBP-relative offset.
    FloatMem(i32),
}
