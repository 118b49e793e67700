//! The program image: root container and binary reader/writer.

use crate::block::Block;
use crate::class::Class;
use crate::declaration::{Declaration, DeclarationType};
use crate::error::Error::{
    InvalidClassIdentifier, InvalidMagicNumber, InvalidMethodReference, InvalidVersion,
    LocalSlotOutOfRange, OperandStackUnderflow, UnexpectedLibrary, UnresolvedLabel,
};
use crate::error::Result;
use crate::instruction::{Instruction, MemoryContext, Opcode, ReturnType};
use crate::method::{Method, WORD_SIZE};
use crate::stream::{read_count, read_string, write_count, write_string};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tracing::debug;

/// Image format version; an image compiled for any other version is rejected.
pub const VERSION: u32 = 13;

/// Magic number of an executable image.
pub const MAGIC_EXECUTABLE: u32 = u32::from_le_bytes(*b"EXE\0");
/// Magic number of a shared library image, which cannot be executed directly.
pub const MAGIC_LIBRARY: u32 = u32::from_le_bytes(*b"LIB\0");
/// Magic number of a web-hosted executable image.
pub const MAGIC_WEB: u32 = u32::from_le_bytes(*b"WEB\0");

/// Runtime service index that copies a pooled character string into a character array.
pub const COPY_CHAR_STRING_SERVICE: i64 = 2;

/// A loaded Veloce program.
///
/// Class identifiers are dense; `classes[id]` is the class with identifier `id`. Command-line
/// arguments are appended to the character string pool at load time so the synthesized
/// initialization method can reference them by pool index.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub classes: Vec<Class>,
    pub float_strings: Vec<Vec<f64>>,
    pub int_strings: Vec<Vec<i64>>,
    pub char_strings: Vec<String>,
    /// Identifier of the system `String` class.
    pub string_class_id: u32,
    pub start_class_id: u32,
    pub start_method_id: u32,
    /// Synthesized method that builds the argv array and calls the entry point.
    pub init_method: Method,
    pub is_web: bool,
}

impl Program {
    /// Look up a class by identifier.
    #[must_use]
    pub fn class(&self, id: u32) -> Option<&Class> {
        self.classes.get(id as usize)
    }

    /// Look up a method by class and method identifier.
    #[must_use]
    pub fn method(&self, class: u32, method: u32) -> Option<&Method> {
        self.class(class).and_then(|class| class.method(method))
    }

    /// Deserialize a program image and synthesize its initialization method.
    ///
    /// `arguments` are the command-line arguments of the hosting process; they are appended to
    /// the character string pool and wrapped into the argv array by the initialization method.
    ///
    /// # Errors
    ///
    /// Returns an error if the version or magic number does not match, the image is a shared
    /// library, or any class, method, or statement is malformed.
    pub fn from_bytes(bytes: &mut Cursor<Vec<u8>>, arguments: &[String]) -> Result<Program> {
        let version = bytes.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(InvalidVersion {
                expected: VERSION,
                actual: version,
            });
        }

        let magic = bytes.read_u32::<LittleEndian>()?;
        let is_web = match magic {
            MAGIC_EXECUTABLE => false,
            MAGIC_WEB => true,
            MAGIC_LIBRARY => return Err(UnexpectedLibrary),
            _ => return Err(InvalidMagicNumber(magic)),
        };

        let string_class_id = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;

        let float_string_count = read_count(bytes)?;
        let mut float_strings = Vec::with_capacity(float_string_count);
        for _ in 0..float_string_count {
            let length = read_count(bytes)?;
            let mut values = Vec::with_capacity(length);
            for _ in 0..length {
                values.push(bytes.read_f64::<LittleEndian>()?);
            }
            float_strings.push(values);
        }

        let int_string_count = read_count(bytes)?;
        let mut int_strings = Vec::with_capacity(int_string_count);
        for _ in 0..int_string_count {
            let length = read_count(bytes)?;
            let mut values = Vec::with_capacity(length);
            for _ in 0..length {
                values.push(i64::from(bytes.read_i32::<LittleEndian>()?));
            }
            int_strings.push(values);
        }

        let char_string_count = read_count(bytes)?;
        let mut char_strings = Vec::with_capacity(char_string_count + arguments.len());
        for _ in 0..char_string_count {
            char_strings.push(read_string(bytes)?);
        }
        char_strings.extend(arguments.iter().cloned());

        let start_class_id = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;
        let start_method_id = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;
        debug!("program starting point: {start_class_id},{start_method_id}");

        read_enums(bytes)?;
        let classes = read_classes(bytes)?;

        let init_method = synthesize_init_method(
            arguments,
            char_string_count,
            string_class_id,
            start_class_id,
            start_method_id,
        );

        Ok(Program {
            classes,
            float_strings,
            int_strings,
            char_strings,
            string_class_id,
            start_class_id,
            start_method_id,
            init_method,
            is_web,
        })
    }

    /// Serialize the program image.
    ///
    /// The synthesized initialization method and any appended command-line arguments are load
    /// artifacts and are not written.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not fit its wire representation.
    pub fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_u32::<LittleEndian>(VERSION)?;
        let magic = if self.is_web {
            MAGIC_WEB
        } else {
            MAGIC_EXECUTABLE
        };
        bytes.write_u32::<LittleEndian>(magic)?;
        bytes.write_i32::<LittleEndian>(i32::try_from(self.string_class_id)?)?;

        write_count(bytes, self.float_strings.len())?;
        for values in &self.float_strings {
            write_count(bytes, values.len())?;
            for value in values {
                bytes.write_f64::<LittleEndian>(*value)?;
            }
        }

        write_count(bytes, self.int_strings.len())?;
        for values in &self.int_strings {
            write_count(bytes, values.len())?;
            for value in values {
                bytes.write_i32::<LittleEndian>(i32::try_from(*value)?)?;
            }
        }

        write_count(bytes, self.char_strings.len())?;
        for value in &self.char_strings {
            write_string(bytes, value)?;
        }

        bytes.write_i32::<LittleEndian>(i32::try_from(self.start_class_id)?)?;
        bytes.write_i32::<LittleEndian>(i32::try_from(self.start_method_id)?)?;

        // empty enum block
        write_count(bytes, 0)?;

        write_count(bytes, self.classes.len())?;
        for class in &self.classes {
            class.to_bytes(bytes)?;
        }
        Ok(())
    }

    /// Validate the structural invariants every well-formed program upholds: jumps resolve
    /// through the label table, call sites reference existing methods, local variable slots fit
    /// the frame, and no block underflows the operand stack.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn verify(&self) -> Result<()> {
        for class in &self.classes {
            for method in &class.methods {
                self.verify_method(method)?;
            }
        }
        Ok(())
    }

    fn verify_method(&self, method: &Method) -> Result<()> {
        let labels = method.label_table();
        let slots = method.local_slots();
        for instruction in method.instructions() {
            match instruction.op {
                Opcode::Jmp { label, .. } => {
                    if !labels.contains_key(&label) {
                        return Err(UnresolvedLabel(label));
                    }
                }
                Opcode::MthdCall { class, method, .. }
                | Opcode::AsyncMthdCall { class, method, .. } => {
                    if self.method(class, method).is_none() {
                        return Err(InvalidMethodReference { class, method });
                    }
                }
                Opcode::LoadIntVar { slot, context }
                | Opcode::LoadFloatVar { slot, context }
                | Opcode::StorIntVar { slot, context }
                | Opcode::StorFloatVar { slot, context }
                | Opcode::CopyIntVar { slot, context }
                | Opcode::CopyFloatVar { slot, context }
                    if context == MemoryContext::Local =>
                {
                    if slot >= slots {
                        return Err(LocalSlotOutOfRange { slot, slots });
                    }
                }
                Opcode::LoadFuncVar { slot, context } | Opcode::StorFuncVar { slot, context }
                    if context == MemoryContext::Local =>
                {
                    // a function value occupies two slots
                    if slot + 1 >= slots {
                        return Err(LocalSlotOutOfRange { slot, slots });
                    }
                }
                _ => {}
            }
        }
        for (index, block) in method.blocks.iter().enumerate() {
            // the caller leaves the declared parameters on the operand stack for the first block
            let arguments = if index == 0 {
                method.param_count as usize
            } else {
                0
            };
            self.verify_stack_effect(block, arguments)?;
        }
        Ok(())
    }

    /// Simulate the block's stack effect, failing on underflow. Opcodes whose effect depends on
    /// runtime state end the simulation early.
    fn verify_stack_effect(&self, block: &Block, arguments: usize) -> Result<()> {
        let mut depth = arguments;
        for (index, instruction) in block.instructions.iter().enumerate() {
            let Some((pops, pushes)) = self.stack_effect(instruction.op) else {
                return Ok(());
            };
            depth = depth
                .checked_sub(pops)
                .ok_or(OperandStackUnderflow { index })?;
            depth += pushes;
        }
        Ok(())
    }

    /// The `(pops, pushes)` pair for an opcode, or `None` when the effect is not statically
    /// known.
    #[expect(clippy::too_many_lines)]
    fn stack_effect(&self, op: Opcode) -> Option<(usize, usize)> {
        let effect = match op {
            Opcode::LoadIntLit(_)
            | Opcode::LoadCharLit(_)
            | Opcode::LoadFloatLit(_)
            | Opcode::LoadInstMem
            | Opcode::LoadClsMem
            | Opcode::RandFloat => (0, 1),
            Opcode::LoadIntVar { context, .. } | Opcode::LoadFloatVar { context, .. } => {
                if context == MemoryContext::Local {
                    (0, 1)
                } else {
                    (1, 1)
                }
            }
            Opcode::LoadFuncVar { context, .. } => {
                if context == MemoryContext::Local {
                    (0, 2)
                } else {
                    (1, 2)
                }
            }
            Opcode::StorIntVar { context, .. } | Opcode::StorFloatVar { context, .. } => {
                if context == MemoryContext::Local {
                    (1, 0)
                } else {
                    (2, 0)
                }
            }
            Opcode::StorFuncVar { context, .. } => {
                if context == MemoryContext::Local {
                    (2, 0)
                } else {
                    (3, 0)
                }
            }
            Opcode::CopyIntVar { context, .. } | Opcode::CopyFloatVar { context, .. } => {
                if context == MemoryContext::Local {
                    (1, 1)
                } else {
                    (2, 1)
                }
            }
            Opcode::LoadByteAryElm { dimensions, .. }
            | Opcode::LoadCharAryElm { dimensions, .. }
            | Opcode::LoadIntAryElm { dimensions, .. }
            | Opcode::LoadFloatAryElm { dimensions, .. } => (dimensions as usize + 1, 1),
            Opcode::StorByteAryElm { dimensions, .. }
            | Opcode::StorCharAryElm { dimensions, .. }
            | Opcode::StorIntAryElm { dimensions, .. }
            | Opcode::StorFloatAryElm { dimensions, .. } => (dimensions as usize + 2, 0),
            Opcode::NewByteAry { dimensions }
            | Opcode::NewCharAry { dimensions }
            | Opcode::NewIntAry { dimensions }
            | Opcode::NewFloatAry { dimensions } => (dimensions as usize, 1),
            Opcode::NewObjInst { .. } => (0, 1),
            Opcode::LoadArySize | Opcode::ObjTypeOf { .. } | Opcode::ObjInstCast { .. } => (1, 1),
            Opcode::CpyByteAry | Opcode::CpyCharAry | Opcode::CpyIntAry | Opcode::CpyFloatAry => {
                (5, 0)
            }
            Opcode::MthdCall { class, method, .. } => {
                let callee = self.method(class, method)?;
                (
                    callee.param_count as usize + 1,
                    callee.return_type.words(),
                )
            }
            Opcode::DynMthdCall {
                parameters,
                return_type,
            } => (parameters as usize + 3, return_type.words()),
            Opcode::Jmp { condition, .. } => {
                if condition < 0 {
                    (0, 0)
                } else {
                    (1, 0)
                }
            }
            Opcode::Lbl { .. } | Opcode::Rtrn | Opcode::ThreadJoin => (0, 0),
            Opcode::AndInt
            | Opcode::OrInt
            | Opcode::AddInt
            | Opcode::SubInt
            | Opcode::MulInt
            | Opcode::DivInt
            | Opcode::ModInt
            | Opcode::BitAndInt
            | Opcode::BitOrInt
            | Opcode::BitXorInt
            | Opcode::ShlInt(_)
            | Opcode::ShrInt(_)
            | Opcode::EqlInt
            | Opcode::NeqlInt
            | Opcode::LesInt
            | Opcode::GtrInt
            | Opcode::LesEqlInt
            | Opcode::GtrEqlInt
            | Opcode::AddFloat
            | Opcode::SubFloat
            | Opcode::MulFloat
            | Opcode::DivFloat
            | Opcode::EqlFloat
            | Opcode::NeqlFloat
            | Opcode::LesFloat
            | Opcode::GtrFloat
            | Opcode::LesEqlFloat
            | Opcode::GtrEqlFloat
            | Opcode::PowFloat => (2, 1),
            Opcode::FlorFloat
            | Opcode::CeilFloat
            | Opcode::SinFloat
            | Opcode::CosFloat
            | Opcode::TanFloat
            | Opcode::AsinFloat
            | Opcode::AcosFloat
            | Opcode::AtanFloat
            | Opcode::LogFloat
            | Opcode::SqrtFloat
            | Opcode::F2i
            | Opcode::I2f => (1, 1),
            Opcode::SwapInt => (2, 2),
            Opcode::PopInt | Opcode::PopFloat => (1, 0),
            Opcode::Trap { arguments } => (arguments as usize, 0),
            Opcode::TrapRtrn { arguments } => (arguments as usize, 1),
            Opcode::ThreadSleep
            | Opcode::ThreadMutex
            | Opcode::CriticalStart
            | Opcode::CriticalEnd => (1, 0),
            Opcode::AsyncMthdCall { .. }
            | Opcode::DllLoad
            | Opcode::DllUnload
            | Opcode::DllFuncCall => return None,
        };
        Some(effect)
    }
}

fn read_enums(bytes: &mut Cursor<Vec<u8>>) -> Result<()> {
    let count = read_count(bytes)?;
    for _ in 0..count {
        let _ = read_string(bytes)?;
        let _ = bytes.read_i32::<LittleEndian>()?;
        let item_count = read_count(bytes)?;
        for _ in 0..item_count {
            let _ = read_string(bytes)?;
            let _ = bytes.read_i32::<LittleEndian>()?;
        }
    }
    Ok(())
}

fn read_classes(bytes: &mut Cursor<Vec<u8>>) -> Result<Vec<Class>> {
    let count = read_count(bytes)?;
    debug!("reading {count} class(es)");
    let mut class_slots: Vec<Option<Class>> = Vec::new();
    class_slots.resize_with(count, || None);
    for _ in 0..count {
        let class = Class::from_bytes(bytes)?;
        let id = class.id as usize;
        if id >= count || class_slots[id].is_some() {
            return Err(InvalidClassIdentifier(class.id));
        }
        class_slots[id] = Some(class);
    }
    class_slots
        .into_iter()
        .enumerate()
        .map(|(id, slot)| slot.ok_or(InvalidClassIdentifier(u32::try_from(id)?)))
        .collect()
}

/// Build the `$Initialization$` method: allocate the argv array, wrap each command-line argument
/// in a `String` instance, store it into the array, and call the entry point with the array and a
/// nil self reference.
fn synthesize_init_method(
    arguments: &[String],
    pooled_strings: usize,
    string_class_id: u32,
    start_class_id: u32,
    start_method_id: u32,
) -> Method {
    let local = MemoryContext::Local;
    let mut instructions = vec![
        Instruction::new(Opcode::LoadIntLit(arguments.len() as i64)),
        Instruction::new(Opcode::NewIntAry { dimensions: 1 }),
        Instruction::new(Opcode::StorIntVar {
            slot: 0,
            context: local,
        }),
    ];

    for (index, argument) in arguments.iter().enumerate() {
        instructions.push(Instruction::new(Opcode::LoadIntLit(
            argument.chars().count() as i64,
        )));
        instructions.push(Instruction::new(Opcode::NewCharAry { dimensions: 1 }));
        instructions.push(Instruction::new(Opcode::LoadIntLit(
            (pooled_strings + index) as i64,
        )));
        instructions.push(Instruction::new(Opcode::LoadIntLit(
            COPY_CHAR_STRING_SERVICE,
        )));
        instructions.push(Instruction::new(Opcode::TrapRtrn { arguments: 3 }));

        instructions.push(Instruction::new(Opcode::NewObjInst {
            class: string_class_id,
        }));
        // the String(CharAry) constructor is position dependent
        instructions.push(Instruction::new(Opcode::MthdCall {
            class: string_class_id,
            method: 2,
            native: false,
        }));

        instructions.push(Instruction::new(Opcode::LoadIntLit(index as i64)));
        instructions.push(Instruction::new(Opcode::LoadIntVar {
            slot: 0,
            context: local,
        }));
        instructions.push(Instruction::new(Opcode::StorIntAryElm {
            dimensions: 1,
            context: local,
        }));
    }

    instructions.push(Instruction::new(Opcode::LoadIntVar {
        slot: 0,
        context: local,
    }));
    instructions.push(Instruction::new(Opcode::LoadInstMem));
    instructions.push(Instruction::new(Opcode::MthdCall {
        class: start_class_id,
        method: start_method_id,
        native: false,
    }));
    instructions.push(Instruction::new(Opcode::Rtrn));

    Method {
        id: u32::MAX,
        name: "$Initialization$".to_string(),
        is_virtual: false,
        has_and_or: false,
        is_native: false,
        declarations: vec![Declaration::new("args", DeclarationType::ObjectArray)],
        param_count: 0,
        local_frame_size: WORD_SIZE,
        return_type: ReturnType::None,
        blocks: vec![Block::new(instructions)],
        class_id: u32::MAX,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::declaration::DeclarationType;

    fn entry_method(id: u32, class_id: u32) -> Method {
        Method {
            id,
            name: "Main".to_string(),
            is_virtual: false,
            has_and_or: false,
            is_native: false,
            declarations: vec![Declaration::new("args", DeclarationType::ObjectArray)],
            param_count: 1,
            local_frame_size: 16,
            return_type: ReturnType::None,
            blocks: vec![Block::new(vec![
                Instruction::new(Opcode::StorIntVar {
                    slot: 0,
                    context: MemoryContext::Local,
                }),
                Instruction::new(Opcode::Rtrn),
            ])],
            class_id,
        }
    }

    fn sample_program() -> Program {
        let class = Class {
            id: 0,
            name: "App".to_string(),
            parent_id: -1,
            interface_ids: vec![],
            is_virtual: false,
            is_debug: false,
            file_name: String::new(),
            class_frame_size: 0,
            instance_frame_size: 0,
            class_declarations: vec![],
            instance_declarations: vec![],
            methods: vec![entry_method(0, 0)],
        };
        Program {
            classes: vec![class],
            float_strings: vec![vec![1.5, 2.5]],
            int_strings: vec![vec![3, 4]],
            char_strings: vec!["version".to_string()],
            string_class_id: 0,
            start_class_id: 0,
            start_method_id: 0,
            init_method: synthesize_init_method(&[], 1, 0, 0, 0),
            is_web: false,
        }
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let program = sample_program();
        let mut bytes = Vec::new();
        program.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        let loaded = Program::from_bytes(&mut cursor, &[])?;
        assert_eq!(program, loaded);
        Ok(())
    }

    #[test]
    fn test_invalid_version() -> Result<()> {
        let program = sample_program();
        let mut bytes = Vec::new();
        program.to_bytes(&mut bytes)?;
        bytes[0] = 0xFE;
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            Program::from_bytes(&mut cursor, &[]),
            Err(InvalidVersion { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_library_rejected() -> Result<()> {
        let program = sample_program();
        let mut bytes = Vec::new();
        program.to_bytes(&mut bytes)?;
        bytes[4..8].copy_from_slice(&MAGIC_LIBRARY.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        assert_eq!(Err(UnexpectedLibrary), Program::from_bytes(&mut cursor, &[]));
        Ok(())
    }

    #[test]
    fn test_invalid_magic() -> Result<()> {
        let program = sample_program();
        let mut bytes = Vec::new();
        program.to_bytes(&mut bytes)?;
        bytes[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        assert_eq!(
            Err(InvalidMagicNumber(0xDEAD_BEEF)),
            Program::from_bytes(&mut cursor, &[])
        );
        Ok(())
    }

    #[test]
    fn test_arguments_appended_to_pool() -> Result<()> {
        let program = sample_program();
        let mut bytes = Vec::new();
        program.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        let arguments = vec!["app.obe".to_string(), "--fast".to_string()];
        let loaded = Program::from_bytes(&mut cursor, &arguments)?;
        assert_eq!(
            vec!["version", "app.obe", "--fast"],
            loaded.char_strings.iter().map(String::as_str).collect::<Vec<_>>()
        );
        // one argv store sequence per argument plus the prolog and entry call
        assert!(loaded.init_method.instruction_count() > program.init_method.instruction_count());
        Ok(())
    }

    #[test]
    fn test_verify_valid_program() -> Result<()> {
        sample_program().verify()
    }

    #[test]
    fn test_verify_unresolved_label() {
        let mut program = sample_program();
        program.classes[0].methods[0].blocks[0]
            .instructions
            .insert(
                0,
                Instruction::new(Opcode::Jmp {
                    label: 9,
                    condition: crate::instruction::JUMP_UNCONDITIONAL,
                }),
            );
        assert_eq!(Err(UnresolvedLabel(9)), program.verify());
    }

    #[test]
    fn test_verify_bad_call_reference() {
        let mut program = sample_program();
        program.classes[0].methods[0].blocks[0].instructions.insert(
            0,
            Instruction::new(Opcode::MthdCall {
                class: 3,
                method: 0,
                native: false,
            }),
        );
        assert_eq!(
            Err(InvalidMethodReference {
                class: 3,
                method: 0
            }),
            program.verify()
        );
    }

    #[test]
    fn test_verify_slot_out_of_range() {
        let mut program = sample_program();
        program.classes[0].methods[0].blocks[0].instructions.insert(
            0,
            Instruction::new(Opcode::LoadIntVar {
                slot: 6,
                context: MemoryContext::Local,
            }),
        );
        assert_eq!(
            Err(LocalSlotOutOfRange { slot: 6, slots: 2 }),
            program.verify()
        );
    }

    #[test]
    fn test_verify_stack_underflow() {
        let mut program = sample_program();
        program.classes[0].methods[0].blocks[0]
            .instructions
            .insert(0, Instruction::new(Opcode::AddInt));
        assert_eq!(
            Err(OperandStackUnderflow { index: 0 }),
            program.verify()
        );
    }

    #[test]
    fn test_init_method_shape() {
        let arguments = vec!["app.obe".to_string()];
        let method = synthesize_init_method(&arguments, 4, 7, 1, 3);
        let instructions = &method.blocks[0].instructions;
        assert_eq!(
            Opcode::LoadIntLit(1),
            instructions[0].op,
            "argv length first"
        );
        assert_eq!(Opcode::NewIntAry { dimensions: 1 }, instructions[1].op);
        // the pooled argument index follows the character array allocation
        assert_eq!(Opcode::LoadIntLit(4), instructions[5].op);
        assert_eq!(
            Opcode::MthdCall {
                class: 1,
                method: 3,
                native: false
            },
            instructions[instructions.len() - 2].op
        );
        assert_eq!(Opcode::Rtrn, instructions[instructions.len() - 1].op);
    }
}
