//! Classes and their method tables.

use crate::declaration::Declaration;
use crate::error::Error::InvalidMethodIdentifier;
use crate::error::Result;
use crate::method::Method;
use crate::stream::{read_count, read_flag, read_string, write_count, write_flag, write_string};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// A Veloce class: identity, hierarchy, frame layouts, and methods.
///
/// Method identifiers are dense; `methods[id]` is the method with identifier `id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Class {
    pub id: u32,
    pub name: String,
    /// Parent class identifier; `-1` when the class has no parent.
    pub parent_id: i32,
    pub interface_ids: Vec<u32>,
    pub is_virtual: bool,
    pub is_debug: bool,
    /// Source file name; present only in debug images.
    pub file_name: String,
    /// Size of the class (static) variable frame in bytes.
    pub class_frame_size: u32,
    /// Size of one instance's variable frame in bytes.
    pub instance_frame_size: u32,
    pub class_declarations: Vec<Declaration>,
    pub instance_declarations: Vec<Declaration>,
    pub methods: Vec<Method>,
}

impl Class {
    /// Look up a method by identifier.
    #[must_use]
    pub fn method(&self, id: u32) -> Option<&Method> {
        self.methods.get(id as usize)
    }

    /// Deserialize a class.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is malformed or method identifiers are not dense.
    pub(crate) fn from_bytes(bytes: &mut Cursor<Vec<u8>>) -> Result<Class> {
        let id = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;
        let name = read_string(bytes)?;
        let parent_id = bytes.read_i32::<LittleEndian>()?;
        // parent name, redundant with the identifier
        let _ = read_string(bytes)?;

        let interface_count = read_count(bytes)?;
        let mut interface_ids = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interface_ids.push(u32::try_from(bytes.read_i32::<LittleEndian>()?)?);
        }
        let interface_name_count = read_count(bytes)?;
        for _ in 0..interface_name_count {
            let _ = read_string(bytes)?;
        }

        // interface flag, covered by the virtual flag
        let _ = read_flag(bytes)?;
        let is_virtual = read_flag(bytes)?;
        let is_debug = read_flag(bytes)?;
        let file_name = if is_debug {
            read_string(bytes)?
        } else {
            String::new()
        };

        let class_frame_size = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;
        let instance_frame_size = u32::try_from(bytes.read_i32::<LittleEndian>()?)?;

        let class_declaration_count = read_count(bytes)?;
        let mut class_declarations = Vec::with_capacity(class_declaration_count);
        for _ in 0..class_declaration_count {
            class_declarations.push(Declaration::from_bytes(bytes, is_debug)?);
        }

        let instance_declaration_count = read_count(bytes)?;
        let mut instance_declarations = Vec::with_capacity(instance_declaration_count);
        for _ in 0..instance_declaration_count {
            instance_declarations.push(Declaration::from_bytes(bytes, is_debug)?);
        }

        let method_count = read_count(bytes)?;
        let mut method_slots: Vec<Option<Method>> = Vec::new();
        method_slots.resize_with(method_count, || None);
        for _ in 0..method_count {
            let mut method = Method::from_bytes(bytes, is_debug)?;
            method.class_id = id;
            let method_id = method.id as usize;
            if method_id >= method_count || method_slots[method_id].is_some() {
                return Err(InvalidMethodIdentifier(method.id));
            }
            method_slots[method_id] = Some(method);
        }
        let methods = method_slots
            .into_iter()
            .enumerate()
            .map(|(method_id, slot)| {
                slot.ok_or(InvalidMethodIdentifier(u32::try_from(method_id)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Class {
            id,
            name,
            parent_id,
            interface_ids,
            is_virtual,
            is_debug,
            file_name,
            class_frame_size,
            instance_frame_size,
            class_declarations,
            instance_declarations,
            methods,
        })
    }

    /// Serialize the class.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not fit its wire representation.
    pub(crate) fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.write_i32::<LittleEndian>(i32::try_from(self.id)?)?;
        write_string(bytes, &self.name)?;
        bytes.write_i32::<LittleEndian>(self.parent_id)?;
        write_string(bytes, "")?;

        write_count(bytes, self.interface_ids.len())?;
        for interface_id in &self.interface_ids {
            bytes.write_i32::<LittleEndian>(i32::try_from(*interface_id)?)?;
        }
        write_count(bytes, 0)?;

        write_flag(bytes, false)?;
        write_flag(bytes, self.is_virtual)?;
        write_flag(bytes, self.is_debug)?;
        if self.is_debug {
            write_string(bytes, &self.file_name)?;
        }

        bytes.write_i32::<LittleEndian>(i32::try_from(self.class_frame_size)?)?;
        bytes.write_i32::<LittleEndian>(i32::try_from(self.instance_frame_size)?)?;

        write_count(bytes, self.class_declarations.len())?;
        for declaration in &self.class_declarations {
            declaration.to_bytes(bytes, self.is_debug)?;
        }
        write_count(bytes, self.instance_declarations.len())?;
        for declaration in &self.instance_declarations {
            declaration.to_bytes(bytes, self.is_debug)?;
        }

        write_count(bytes, self.methods.len())?;
        for method in &self.methods {
            method.to_bytes(bytes, self.is_debug)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::Block;
    use crate::instruction::{Instruction, Opcode, ReturnType};

    fn sample_class() -> Class {
        Class {
            id: 2,
            name: "Counter".to_string(),
            parent_id: 0,
            interface_ids: vec![1],
            is_virtual: false,
            is_debug: false,
            file_name: String::new(),
            class_frame_size: 0,
            instance_frame_size: 8,
            class_declarations: vec![],
            instance_declarations: vec![Declaration::new(
                "",
                crate::declaration::DeclarationType::Int,
            )],
            methods: vec![Method {
                id: 0,
                name: "New".to_string(),
                is_virtual: false,
                has_and_or: false,
                is_native: false,
                declarations: vec![],
                param_count: 0,
                local_frame_size: 8,
                return_type: ReturnType::None,
                blocks: vec![Block::new(vec![Instruction::new(Opcode::Rtrn)])],
                class_id: 2,
            }],
        }
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let class = sample_class();
        let mut bytes = Vec::new();
        class.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(class, Class::from_bytes(&mut cursor)?);
        Ok(())
    }

    #[test]
    fn test_method_lookup() {
        let class = sample_class();
        assert_eq!("New", class.method(0).map(|m| m.name.as_str()).unwrap_or(""));
        assert!(class.method(9).is_none());
    }

    #[test]
    fn test_duplicate_method_identifier() -> Result<()> {
        let mut class = sample_class();
        let mut duplicate = class.methods[0].clone();
        duplicate.id = 0;
        class.methods.push(duplicate);
        let mut bytes = Vec::new();
        class.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(
            Err(InvalidMethodIdentifier(0)),
            Class::from_bytes(&mut cursor)
        );
        Ok(())
    }
}
