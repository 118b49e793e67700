//! # Veloce Optimizer
//!
//! ## Getting Started
//!
//! Peephole and data-flow optimization for Veloce programs. The pipeline rewrites every method's
//! blocks through an ordered list of pure block-to-block stages: jump cleanup and dead store
//! removal always run; accessor inlining, constant folding, strength reduction, copy propagation,
//! and whole-method inlining are enabled by increasing [`OptimizationLevel`]s.
//!
//! ```rust
//! use veloce_optimizer::{OptimizationLevel, optimize};
//!
//! # fn run(program: &mut veloce_bytecode::Program) {
//! optimize(program, OptimizationLevel::Standard);
//! # }
//! ```
//!
//! Stages never fail: an instruction sequence that does not match a stage's pattern passes
//! through unchanged, in source order.

mod accessor_inline;
mod constant_fold;
mod copy_propagation;
mod dead_store;
mod deferred;
mod jump_cleanup;
mod method_inline;
mod pipeline;
mod strength_reduction;
#[cfg(test)]
mod test_support;

pub use pipeline::{OptimizationLevel, optimize};
