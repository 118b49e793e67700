//! Error types for the Veloce executable format.
//!
//! The main type exported is the [`Error`] enum, which represents all possible errors that can
//! occur while reading, writing, or validating a Veloce program image. The module also provides a
//! [`Result`] type alias for convenience.

use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A specialized Result type for Veloce bytecode operations.
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur when processing Veloce program images.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// Invalid character literal operand
    #[error("Invalid character literal: {0}")]
    InvalidCharacterLiteral(u32),
    /// Duplicate or out-of-range class identifier
    #[error("Invalid class identifier: {0}")]
    InvalidClassIdentifier(u32),
    /// Invalid declaration type code
    #[error("Invalid declaration type code: {0}")]
    InvalidDeclarationType(i32),
    /// Invalid magic number when reading a program image
    #[error("Invalid magic number: {0}")]
    InvalidMagicNumber(u32),
    /// Invalid memory context code
    #[error("Invalid memory context: {0}")]
    InvalidMemoryContext(i32),
    /// Duplicate or out-of-range method identifier
    #[error("Invalid method identifier: {0}")]
    InvalidMethodIdentifier(u32),
    /// A call site references a class or method that does not exist
    #[error("Invalid method reference: class={class}; method={method}")]
    InvalidMethodReference { class: u32, method: u32 },
    /// Unknown opcode byte in a statement stream
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u8),
    /// Invalid return type signature string
    #[error("Invalid return type signature: {0}")]
    InvalidReturnSignature(String),
    /// Invalid return type code
    #[error("Invalid return type code: {0}")]
    InvalidReturnType(i32),
    /// Version mismatch between the image and the runtime
    #[error("Invalid version: expected {expected}; found {actual}")]
    InvalidVersion { expected: u32, actual: u32 },
    /// A local variable reference is outside the method frame
    #[error("Local variable slot out of range: slot {slot}; frame holds {slots} slots")]
    LocalSlotOutOfRange { slot: u32, slots: u32 },
    /// Simulating a block's stack effect underflowed the operand stack
    #[error("Operand stack underflow at instruction {index}")]
    OperandStackUnderflow { index: usize },
    /// A jump references a label with no matching definition
    #[error("Unresolved label: {0}")]
    UnresolvedLabel(u32),
    /// The image is a shared library, which cannot be executed directly
    #[error("Unable to execute a shared library")]
    UnexpectedLibrary,
    /// The statement stream contains an instruction only valid in a library image
    #[error("Unsupported instruction for an executable: {0}")]
    UnsupportedInstruction(&'static str),
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
    /// Error when attempting to create a UTF-8 string from bytes
    #[error("Invalid UTF-8 sequence: {0}")]
    FromUtf8Error(String),
    /// Error when attempting to convert a numeric value to a different type
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
}

/// Convert [`FromUtf8Error` errors](FromUtf8Error) to [`FromUtf8Error`](Error::FromUtf8Error)
impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Self {
        Error::FromUtf8Error(error.to_string())
    }
}

/// Convert [`std::io::Error` errors](std::io::Error) to [`IoError`](Error::IoError)
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IoError(error.to_string())
    }
}
