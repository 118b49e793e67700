//! The level-gated optimization pipeline.

use crate::{
    accessor_inline, constant_fold, copy_propagation, dead_store, jump_cleanup, method_inline,
    strength_reduction,
};
use std::mem;
use tracing::debug;
use veloce_bytecode::{Block, Program};

/// How aggressively to optimize.
///
/// Jump cleanup and dead store removal always run. [`Basic`](OptimizationLevel::Basic) adds
/// accessor inlining and constant folding, [`Standard`](OptimizationLevel::Standard) adds
/// strength reduction, and [`Full`](OptimizationLevel::Full) adds copy propagation and method
/// inlining.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum OptimizationLevel {
    None,
    Basic,
    Standard,
    Full,
}

impl From<u8> for OptimizationLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => OptimizationLevel::None,
            1 => OptimizationLevel::Basic,
            2 => OptimizationLevel::Standard,
            _ => OptimizationLevel::Full,
        }
    }
}

/// Optimizes every method of every class in place.
///
/// Each class gets two passes over its methods: the per-block peephole stages, then method
/// inlining. Every stage is a pure block-to-block function, so method order carries no
/// significance.
pub fn optimize(program: &mut Program, level: OptimizationLevel) {
    for class_index in 0..program.classes.len() {
        let method_count = program.classes[class_index].methods.len();

        for method_index in 0..method_count {
            debug!(
                "optimizing method, pass 1: name='{}'",
                program.classes[class_index].methods[method_index].name
            );
            let blocks = mem::take(&mut program.classes[class_index].methods[method_index].blocks);
            let blocks = optimize_method(blocks, program, level);
            program.classes[class_index].methods[method_index].blocks = blocks;
        }

        if level >= OptimizationLevel::Full {
            for method_index in 0..method_count {
                debug!(
                    "optimizing method, pass 2: name='{}'",
                    program.classes[class_index].methods[method_index].name
                );
                let mut frame_size =
                    program.classes[class_index].methods[method_index].local_frame_size;
                let blocks =
                    mem::take(&mut program.classes[class_index].methods[method_index].blocks);
                let blocks = blocks
                    .into_iter()
                    .map(|block| method_inline::run(block, program, &mut frame_size))
                    .collect();
                let method = &mut program.classes[class_index].methods[method_index];
                method.blocks = blocks;
                method.local_frame_size = frame_size;
            }
        }
    }
}

/// Applies the ordered per-block stages, each gated by the optimization level.
fn optimize_method(blocks: Vec<Block>, program: &Program, level: OptimizationLevel) -> Vec<Block> {
    let blocks: Vec<Block> = blocks.into_iter().map(jump_cleanup::run).collect();
    let blocks: Vec<Block> = blocks.into_iter().map(dead_store::run).collect();
    if level < OptimizationLevel::Basic {
        return blocks;
    }

    let blocks: Vec<Block> = blocks
        .into_iter()
        .map(|block| accessor_inline::run(block, program))
        .collect();
    let blocks: Vec<Block> = blocks.into_iter().map(constant_fold::fold_int).collect();
    let blocks: Vec<Block> = blocks.into_iter().map(constant_fold::fold_float).collect();
    if level < OptimizationLevel::Standard {
        return blocks;
    }

    let blocks: Vec<Block> = blocks.into_iter().map(strength_reduction::run).collect();
    if level < OptimizationLevel::Full {
        return blocks;
    }

    blocks.into_iter().map(copy_propagation::run).collect()
}
