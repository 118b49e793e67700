//! Error types for the Veloce JIT compiler.
//!
//! Every compilation failure is non-fatal to the host: the method is left to the interpreter.
//! Nothing here surfaces at runtime; traps raised by generated code go through the runtime hook
//! table instead.

use std::num::TryFromIntError;

/// Veloce JIT result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that abort compilation of a single method.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// The executable code pages could not be allocated or protected
    #[error("Code page allocation failed: {0}")]
    CodePageAllocation(String),
    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
    /// A call site references a class or method that does not exist
    #[error("Invalid method reference: class={class}; method={method}")]
    InvalidMethodReference { class: u32, method: u32 },
    /// A jump displacement does not fit in 32 bits
    #[error("Jump displacement out of range for label {0}")]
    JumpDisplacementOutOfRange(u32),
    /// Native methods have no bytecode body to compile
    #[error("Native method: {0}")]
    NativeMethod(String),
    /// The working stack underflowed while translating
    #[error("Operand stack underflow")]
    OperandStackUnderflow,
    /// No general purpose or SSE register is available and nothing can be spilled
    #[error("Register pool exhausted")]
    RegisterPoolExhausted,
    /// The red-zone spill area is full
    #[error("Spill area exhausted")]
    SpillAreaExhausted,
    /// An error occurred while trying to convert a number
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
    /// Only single-dimension array accesses are lowered to native code
    #[error("Unsupported array dimensions: {0}")]
    UnsupportedArrayDimensions(u32),
    /// The instruction is not supported by the JIT compiler
    #[error("Unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    /// A jump references a label with no recorded definition
    #[error("Unresolved label: {0}")]
    UnresolvedLabel(u32),
}
