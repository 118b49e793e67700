//! # Veloce JIT
//!
//! ## Getting Started
//!
//! A single-pass x86-64 compiler for Veloce bytecode. Stack IR is lowered directly to native
//! code: literals and local variables stay symbolic in a compile-time working stack, arithmetic
//! combines register, memory, and immediate operands, compares fuse with the conditional jumps
//! that follow them, and everything heavier (calls, allocations, traps, thread primitives)
//! goes through a uniform callback bridge into host-supplied [`RuntimeHooks`].
//!
//! ```rust,no_run
//! use veloce_jit::{Compiler, RuntimeHooks};
//!
//! # fn jit(program: &veloce_bytecode::Program, hooks: RuntimeHooks) -> veloce_jit::Result<()> {
//! let compiler = Compiler::new(hooks);
//! match compiler.compile(program, 0, 1) {
//!     Ok(compiled) => { /* publish for execution */ }
//!     Err(error) => { /* leave the method to the interpreter */ }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Compilation failures are always graceful: the method stays interpreted and the process keeps
//! running.

mod assembler;
mod compiler;
mod error;
mod frame;
mod function;
mod hooks;
mod memory;
mod operand;
mod register;

pub use compiler::Compiler;
pub use error::{Error, Result};
pub use function::CompiledMethod;
pub use hooks::{AddRootFn, RemoveRootFn, RuntimeHooks, StackCallbackFn, TrapFn};
