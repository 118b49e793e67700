//! Compiled method handles.

use crate::memory::ExecutableMemory;
use veloce_bytecode::Instruction;

/// The C signature of a compiled method.
///
/// Arguments: class identifier, method identifier, class (static) memory, instance memory,
/// operand stack base, and a pointer to the stack position counter. Returns `0` on a normal
/// return and non-zero when a trap exited the method.
type EntryPoint =
    extern "C" fn(i64, i64, *mut i64, *mut i64, *mut i64, *mut i64) -> i64;

/// A method lowered to native code.
///
/// Owns the executable pages and the flattened instruction sequence; the generated code holds
/// raw pointers into the latter for the runtime callback bridge, so both live exactly as long as
/// the compiled method.
#[derive(Debug)]
pub struct CompiledMethod {
    class_id: u32,
    method_id: u32,
    code: ExecutableMemory,
    code_size: usize,
    instructions: Vec<Instruction>,
}

impl CompiledMethod {
    pub(crate) fn new(
        class_id: u32,
        method_id: u32,
        code: ExecutableMemory,
        code_size: usize,
        instructions: Vec<Instruction>,
    ) -> Self {
        CompiledMethod {
            class_id,
            method_id,
            code,
            code_size,
            instructions,
        }
    }

    /// The size of the generated code in bytes.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Invokes the native code on the caller's execution context.
    ///
    /// The declared parameters must already be on the operand stack and `stack_pos` must count
    /// them; on return the stack holds the method's result, if any.
    ///
    /// # Safety
    ///
    /// `class_memory` and `instance` must point to frames large enough for the method's class,
    /// `op_stack` must have room for the method's worst-case stack depth, and `stack_pos` must
    /// point to the live position counter. The runtime hooks baked in at compile time must still
    /// be valid.
    pub unsafe fn execute(
        &self,
        class_memory: *mut i64,
        instance: *mut i64,
        op_stack: *mut i64,
        stack_pos: *mut i64,
    ) -> i64 {
        let entry: EntryPoint = unsafe { std::mem::transmute(self.code.as_ptr()) };
        entry(
            i64::from(self.class_id),
            i64::from(self.method_id),
            class_memory,
            instance,
            op_stack,
            stack_pos,
        )
    }
}
