//! Variable declarations for classes and methods.

use crate::error::Error::InvalidDeclarationType;
use crate::error::Result;
use crate::stream::{read_string, write_string};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// The declared type of a class, instance, or local variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeclarationType {
    Int,
    Char,
    Float,
    ByteArray,
    CharArray,
    IntArray,
    FloatArray,
    Object,
    ObjectArray,
    Function,
}

impl DeclarationType {
    /// The wire code for this declaration type.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            DeclarationType::Int => 0,
            DeclarationType::Char => 1,
            DeclarationType::Float => 2,
            DeclarationType::ByteArray => 3,
            DeclarationType::CharArray => 4,
            DeclarationType::IntArray => 5,
            DeclarationType::FloatArray => 6,
            DeclarationType::Object => 7,
            DeclarationType::ObjectArray => 8,
            DeclarationType::Function => 9,
        }
    }

    /// Whether a variable of this type occupies two frame words.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self, DeclarationType::Float | DeclarationType::Function)
    }
}

impl TryFrom<i32> for DeclarationType {
    type Error = crate::Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(DeclarationType::Int),
            1 => Ok(DeclarationType::Char),
            2 => Ok(DeclarationType::Float),
            3 => Ok(DeclarationType::ByteArray),
            4 => Ok(DeclarationType::CharArray),
            5 => Ok(DeclarationType::IntArray),
            6 => Ok(DeclarationType::FloatArray),
            7 => Ok(DeclarationType::Object),
            8 => Ok(DeclarationType::ObjectArray),
            9 => Ok(DeclarationType::Function),
            _ => Err(InvalidDeclarationType(code)),
        }
    }
}

/// A named, typed variable slot.
///
/// Names are only present in debug images; release images carry the type alone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub declaration_type: DeclarationType,
}

impl Declaration {
    /// Creates a declaration.
    #[must_use]
    pub fn new<S: Into<String>>(name: S, declaration_type: DeclarationType) -> Self {
        Declaration {
            name: name.into(),
            declaration_type,
        }
    }

    /// Deserialize a declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if the type code is unknown or the name is malformed.
    pub(crate) fn from_bytes(bytes: &mut Cursor<Vec<u8>>, is_debug: bool) -> Result<Declaration> {
        let declaration_type = DeclarationType::try_from(bytes.read_i32::<LittleEndian>()?)?;
        let name = if is_debug {
            read_string(bytes)?
        } else {
            String::new()
        };
        Ok(Declaration {
            name,
            declaration_type,
        })
    }

    /// Serialize the declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name does not fit its wire representation.
    pub(crate) fn to_bytes(&self, bytes: &mut Vec<u8>, is_debug: bool) -> Result<()> {
        bytes.write_i32::<LittleEndian>(self.declaration_type.code())?;
        if is_debug {
            write_string(bytes, &self.name)?;
        }
        Ok(())
    }
}
