//! Methods and their statement streams.

use crate::block::Block;
use crate::declaration::Declaration;
use crate::error::Error::InvalidReturnSignature;
use crate::error::Result;
use crate::instruction::{END_STATEMENTS, Instruction, Opcode, ReturnType};
use crate::stream::{read_count, read_flag, read_string, write_count, write_flag, write_string};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use std::io::Cursor;

/// The size in bytes of one frame word.
pub const WORD_SIZE: u32 = 8;

impl ReturnType {
    /// Parse a return type from its signature string.
    ///
    /// The first character decides the type: `l` (bool), `b` (byte), `c` (char), `i` (int), and
    /// `o` (object) are all integer words; `f` is a float unless the signature is longer than one
    /// character, which indicates an array reference; `n` is nil; `m` is a function reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is empty or starts with an unknown character.
    pub fn from_signature(signature: &str) -> Result<ReturnType> {
        let return_type = match signature.chars().next() {
            Some('l' | 'b' | 'c' | 'i' | 'o') => ReturnType::Int,
            Some('f') => {
                if signature.len() > 1 {
                    ReturnType::Int
                } else {
                    ReturnType::Float
                }
            }
            Some('n') => ReturnType::None,
            Some('m') => ReturnType::FuncRef,
            _ => return Err(InvalidReturnSignature(signature.to_string())),
        };
        Ok(return_type)
    }

    /// The canonical signature string for this return type.
    #[must_use]
    pub fn signature(&self) -> &'static str {
        match self {
            ReturnType::None => "n",
            ReturnType::Int => "i",
            ReturnType::Float => "f",
            ReturnType::FuncRef => "m",
        }
    }
}

/// A Veloce method.
///
/// The statement stream is grouped into [`Block`]s. Optimizer passes replace the block list
/// wholesale; the label table is derived from the current blocks and must be rebuilt after any
/// pass that moves instructions.
#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub id: u32,
    pub name: String,
    pub is_virtual: bool,
    pub has_and_or: bool,
    pub is_native: bool,
    pub declarations: Vec<Declaration>,
    pub param_count: u32,
    /// Size of the local variable frame in bytes.
    pub local_frame_size: u32,
    pub return_type: ReturnType,
    pub blocks: Vec<Block>,
    /// Identifier of the owning class; synthetic methods use [`u32::MAX`].
    pub class_id: u32,
}

impl Method {
    /// The number of word-sized local variable slots in the frame.
    #[must_use]
    pub fn local_slots(&self) -> u32 {
        self.local_frame_size / WORD_SIZE
    }

    /// Iterates over all instructions across the method's blocks.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|block| &block.instructions)
    }

    /// The total number of instructions across the method's blocks.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Builds the label table, mapping each label identifier to the `(block, instruction)`
    /// position of its definition.
    ///
    /// Optimization invalidates any previously built table; callers rebuild before use.
    #[must_use]
    pub fn label_table(&self) -> IndexMap<u32, (usize, usize)> {
        let mut labels = IndexMap::new();
        for (block_index, block) in self.blocks.iter().enumerate() {
            for (instruction_index, instruction) in block.instructions.iter().enumerate() {
                if let Opcode::Lbl { id } = instruction.op {
                    labels.insert(id, (block_index, instruction_index));
                }
            }
        }
        labels
    }

    /// Deserialize a method. The owning class identifier is patched in by the class reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is malformed.
    pub(crate) fn from_bytes(bytes: &mut Cursor<Vec<u8>>, is_debug: bool) -> Result<Method> {
        let id = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;
        // method type, unused by the runtime
        let _ = bytes.read_i32::<LittleEndian>()?;
        let is_virtual = read_flag(bytes)?;
        let has_and_or = read_flag(bytes)?;
        let is_native = read_flag(bytes)?;
        // static flag, unused by the runtime
        let _ = read_flag(bytes)?;
        let name = read_string(bytes)?;
        let signature = read_string(bytes)?;
        let param_count = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;
        let local_frame_size = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;

        let declaration_count = read_count(bytes)?;
        let mut declarations = Vec::with_capacity(declaration_count);
        for _ in 0..declaration_count {
            declarations.push(Declaration::from_bytes(bytes, is_debug)?);
        }

        let return_type = ReturnType::from_signature(&signature)?;
        let instructions = read_statements(bytes, is_debug)?;

        Ok(Method {
            id,
            name,
            is_virtual,
            has_and_or,
            is_native,
            declarations,
            param_count,
            local_frame_size,
            return_type,
            blocks: vec![Block::new(instructions)],
            class_id: u32::MAX,
        })
    }

    /// Serialize the method.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not fit its wire representation.
    pub(crate) fn to_bytes(&self, bytes: &mut Vec<u8>, is_debug: bool) -> Result<()> {
        bytes.write_i32::<LittleEndian>(i32::try_from(self.id)?)?;
        bytes.write_i32::<LittleEndian>(0)?;
        write_flag(bytes, self.is_virtual)?;
        write_flag(bytes, self.has_and_or)?;
        write_flag(bytes, self.is_native)?;
        write_flag(bytes, false)?;
        write_string(bytes, &self.name)?;
        write_string(bytes, self.return_type.signature())?;
        bytes.write_i32::<LittleEndian>(i32::try_from(self.param_count)?)?;
        bytes.write_i32::<LittleEndian>(i32::try_from(self.local_frame_size)?)?;

        write_count(bytes, self.declarations.len())?;
        for declaration in &self.declarations {
            declaration.to_bytes(bytes, is_debug)?;
        }

        for instruction in self.instructions() {
            instruction.op.to_bytes(bytes)?;
            if is_debug {
                let line = instruction.line.map_or(-1, |line| line as i64);
                bytes.write_i32::<LittleEndian>(i32::try_from(line)?)?;
            }
        }
        bytes.push(END_STATEMENTS);
        Ok(())
    }
}

/// Read a statement stream terminated by the end-of-statements byte.
fn read_statements(bytes: &mut Cursor<Vec<u8>>, is_debug: bool) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    loop {
        let code = bytes.read_u8()?;
        if code == END_STATEMENTS {
            break;
        }
        let op = Opcode::from_bytes(code, bytes)?;
        let line = if is_debug {
            let line = bytes.read_i32::<LittleEndian>()?;
            u32::try_from(line).ok()
        } else {
            None
        };
        instructions.push(Instruction { op, line });
    }
    Ok(instructions)
}
