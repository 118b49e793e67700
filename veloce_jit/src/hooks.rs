//! The runtime services generated code calls back into.
//!
//! The JIT never links the runtime directly; the host hands over a table of C-ABI entry points
//! and the compiler bakes their addresses into the emitted call sequences. All callbacks follow
//! the SysV AMD64 calling convention.

use veloce_bytecode::Instruction;

/// The central runtime dispatcher for every operation too heavy to lower inline: method calls,
/// allocations, traps, casts, and thread primitives.
///
/// Arguments: opcode wire byte, pointer to the instruction being executed, class and method
/// identifiers of the executing method, instance memory, operand stack base, pointer to the
/// stack position counter, and the index of the instruction to resume after.
pub type StackCallbackFn = extern "C" fn(
    op_code: i64,
    instruction: *const Instruction,
    class_id: i64,
    method_id: i64,
    instance: *mut i64,
    op_stack: *mut i64,
    stack_pos: *mut i64,
    instruction_index: i64,
);

/// Registers the frame's local variable area as a garbage collection root.
///
/// Arguments: class and method identifiers, instance memory, lowest address of the local area,
/// and the size of the area in bytes.
pub type AddRootFn =
    extern "C" fn(class_id: i64, method_id: i64, instance: *mut i64, locals: *mut i64, size: i64);

/// Removes a root registered by [`AddRootFn`]; receives the same lowest local address.
pub type RemoveRootFn = extern "C" fn(locals: *mut i64);

/// Raises a language-level exception through the virtual machine. Receives the class and method
/// identifiers of the faulting method. The hook may unwind instead of returning; if it returns,
/// the generated code exits the method with a non-zero status.
pub type TrapFn = extern "C" fn(class_id: i64, method_id: i64);

/// The table of runtime entry points baked into generated code.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeHooks {
    pub stack_callback: StackCallbackFn,
    pub add_method_root: AddRootFn,
    pub remove_method_root: RemoveRootFn,
    /// Raised on a null object dereference.
    pub nil_dereference: TrapFn,
    /// Raised on an array index outside the bounds.
    pub index_out_of_bounds: TrapFn,
}
