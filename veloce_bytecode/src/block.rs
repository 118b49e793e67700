//! Instruction blocks.

use crate::instruction::Instruction;
use std::fmt;

/// A linear instruction sequence with no internal joins or exits except through jumps, labels, and
/// returns.
///
/// Blocks have a stable identity for the lifetime of a method's block list: optimizer passes
/// produce a new block rather than editing one in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub instructions: Vec<Instruction>,
}

impl Block {
    /// Creates a block from an instruction sequence.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Block { instructions }
    }

    /// Returns the number of instructions in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the block contains no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl From<Vec<Instruction>> for Block {
    fn from(instructions: Vec<Instruction>) -> Self {
        Block { instructions }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "{instruction}")?;
        }
        Ok(())
    }
}
