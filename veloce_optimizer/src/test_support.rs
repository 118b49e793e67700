//! Shared builders for optimizer tests.

use veloce_bytecode::{
    Block, Class, Instruction, Method, Opcode, Program, ReturnType,
};

/// Builds a method with a single block of the given opcodes, two local slots, and an int return.
pub(crate) fn method_with(id: u32, ops: Vec<Opcode>) -> Method {
    Method {
        id,
        name: format!("method_{id}"),
        is_virtual: false,
        has_and_or: false,
        is_native: false,
        declarations: vec![],
        param_count: 0,
        local_frame_size: 16,
        return_type: ReturnType::Int,
        blocks: vec![Block::new(ops.into_iter().map(Instruction::new).collect())],
        class_id: 0,
    }
}

/// Builds a program whose classes hold the given method lists. Class and method identifiers
/// follow positions.
pub(crate) fn program_with(classes: Vec<Vec<Method>>) -> Program {
    let classes = classes
        .into_iter()
        .enumerate()
        .map(|(id, mut methods)| {
            for method in &mut methods {
                method.class_id = id as u32;
            }
            Class {
                id: id as u32,
                name: format!("Class{id}"),
                parent_id: -1,
                interface_ids: vec![],
                is_virtual: false,
                is_debug: false,
                file_name: String::new(),
                class_frame_size: 0,
                instance_frame_size: 16,
                class_declarations: vec![],
                instance_declarations: vec![],
                methods,
            }
        })
        .collect();

    Program {
        classes,
        float_strings: vec![],
        int_strings: vec![],
        char_strings: vec![],
        string_class_id: 0,
        start_class_id: 0,
        start_method_id: 0,
        init_method: method_with(u32::MAX, vec![Opcode::Rtrn]),
        is_web: false,
    }
}
