//! The Veloce instruction set.
//!
//! Veloce methods are linear sequences of stack-machine instructions. All operands flow through an
//! implicit operand stack; an instruction's encoded operands are immediates (literals, variable
//! slots, label and class/method identifiers), never stack positions.
//!
//! Instructions are immutable once constructed. The optimizer replaces instructions rather than
//! mutating them, so [`Instruction`] is a small `Copy` type.

use crate::error::Error::{
    InvalidCharacterLiteral, InvalidMemoryContext, InvalidOpcode, InvalidReturnType,
    UnsupportedInstruction,
};
use crate::error::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

/// Terminates the statement stream of a method.
pub(crate) const END_STATEMENTS: u8 = 0x00;

/// Library-image relocation opcodes. A linker resolves these into `NewObjInst`, `MthdCall`, and
/// `ObjInstCast` before an executable is produced, so encountering one in an executable is a load
/// error.
pub(crate) const LIB_NEW_OBJ_INST: u8 = 0x5F;
pub(crate) const LIB_MTHD_CALL: u8 = 0x60;
pub(crate) const LIB_OBJ_INST_CAST: u8 = 0x61;

/// The three addressable variable scopes.
///
/// `Local` variables live in the executing frame. `Instance` and `Class` variables live in heap
/// memory reached through an object (or class) reference that the instruction pops from the
/// operand stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryContext {
    Local,
    Instance,
    Class,
}

impl MemoryContext {
    /// The wire code for this context.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            MemoryContext::Local => 0,
            MemoryContext::Instance => 1,
            MemoryContext::Class => 2,
        }
    }
}

impl TryFrom<i32> for MemoryContext {
    type Error = crate::Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(MemoryContext::Local),
            1 => Ok(MemoryContext::Instance),
            2 => Ok(MemoryContext::Class),
            _ => Err(InvalidMemoryContext(code)),
        }
    }
}

impl fmt::Display for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryContext::Local => write!(f, "local"),
            MemoryContext::Instance => write!(f, "instance"),
            MemoryContext::Class => write!(f, "class"),
        }
    }
}

/// The type a method leaves on the operand stack when it returns.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReturnType {
    /// Nothing is pushed.
    #[default]
    None,
    /// One integer word (also used for booleans, bytes, characters, and object references).
    Int,
    /// One 64-bit float word.
    Float,
    /// A function value: a `(class, method)` pair occupying two words.
    FuncRef,
}

impl ReturnType {
    /// The wire code for this return type.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            ReturnType::None => 0,
            ReturnType::Int => 1,
            ReturnType::Float => 2,
            ReturnType::FuncRef => 3,
        }
    }

    /// The number of operand stack words a returned value occupies.
    #[must_use]
    pub fn words(&self) -> usize {
        match self {
            ReturnType::None => 0,
            ReturnType::Int | ReturnType::Float => 1,
            ReturnType::FuncRef => 2,
        }
    }
}

impl TryFrom<i32> for ReturnType {
    type Error = crate::Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(ReturnType::None),
            1 => Ok(ReturnType::Int),
            2 => Ok(ReturnType::Float),
            3 => Ok(ReturnType::FuncRef),
            _ => Err(InvalidReturnType(code)),
        }
    }
}

/// A jump condition of `-1` marks an unconditional jump. Non-negative conditions pop the value on
/// top of the operand stack and jump when it equals the condition (`1` = jump if true, `0` = jump
/// if false).
pub const JUMP_UNCONDITIONAL: i32 = -1;

/// A Veloce opcode with its operands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Opcode {
    /// Push an integer literal.
    LoadIntLit(i64),
    /// Push a character literal.
    LoadCharLit(char),
    /// Push a float literal.
    LoadFloatLit(f64),
    /// Push an integer variable. A non-local context pops the base reference first.
    LoadIntVar { slot: u32, context: MemoryContext },
    /// Push a float variable.
    LoadFloatVar { slot: u32, context: MemoryContext },
    /// Push a function value variable (two words).
    LoadFuncVar { slot: u32, context: MemoryContext },
    /// Pop an integer into a variable.
    StorIntVar { slot: u32, context: MemoryContext },
    /// Pop a float into a variable.
    StorFloatVar { slot: u32, context: MemoryContext },
    /// Pop a function value (two words) into a variable pair.
    StorFuncVar { slot: u32, context: MemoryContext },
    /// Store the top integer into a variable without popping it.
    CopyIntVar { slot: u32, context: MemoryContext },
    /// Store the top float into a variable without popping it.
    CopyFloatVar { slot: u32, context: MemoryContext },
    /// Push the executing frame's instance memory (self).
    LoadInstMem,
    /// Push the executing frame's class memory.
    LoadClsMem,
    /// Pop indices and an array reference; push the byte element.
    LoadByteAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices and an array reference; push the character element.
    LoadCharAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices and an array reference; push the integer element.
    LoadIntAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices and an array reference; push the float element.
    LoadFloatAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices, an array reference, and a value; store the byte element.
    StorByteAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices, an array reference, and a value; store the character element.
    StorCharAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices, an array reference, and a value; store the integer element.
    StorIntAryElm { dimensions: u32, context: MemoryContext },
    /// Pop indices, an array reference, and a value; store the float element.
    StorFloatAryElm { dimensions: u32, context: MemoryContext },
    /// Allocate a byte array; pops one size per dimension.
    NewByteAry { dimensions: u32 },
    /// Allocate a character array.
    NewCharAry { dimensions: u32 },
    /// Allocate an integer array.
    NewIntAry { dimensions: u32 },
    /// Allocate a float array.
    NewFloatAry { dimensions: u32 },
    /// Allocate an instance of the class.
    NewObjInst { class: u32 },
    /// Pop an array reference; push its element count.
    LoadArySize,
    /// Bulk byte array copy; pops five operands.
    CpyByteAry,
    /// Bulk character array copy; pops five operands.
    CpyCharAry,
    /// Bulk integer array copy; pops five operands.
    CpyIntAry,
    /// Bulk float array copy; pops five operands.
    CpyFloatAry,
    /// Pop an object reference; push whether it is an instance of the class.
    ObjTypeOf { check: u32 },
    /// Pop an object reference; push it downcast to the class, trapping on failure.
    ObjInstCast { to: u32 },
    /// Static call: pops the declared parameters plus the self reference.
    MthdCall { class: u32, method: u32, native: bool },
    /// Call through a function value on the operand stack.
    DynMthdCall { parameters: u32, return_type: ReturnType },
    /// Static call executed on a new thread.
    AsyncMthdCall { class: u32, method: u32, native: bool },
    /// Jump to a label; see [`JUMP_UNCONDITIONAL`].
    Jmp { label: u32, condition: i32 },
    /// Jump target.
    Lbl { id: u32 },
    /// Return from the method.
    Rtrn,
    /// Logical and.
    AndInt,
    /// Logical or.
    OrInt,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    BitAndInt,
    BitOrInt,
    BitXorInt,
    /// Shift left; the count is popped from the stack. The operand mirrors the count when it is
    /// statically known and is not encoded in the image.
    ShlInt(i64),
    /// Arithmetic shift right; the count is popped from the stack.
    ShrInt(i64),
    EqlInt,
    NeqlInt,
    LesInt,
    GtrInt,
    LesEqlInt,
    GtrEqlInt,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    EqlFloat,
    NeqlFloat,
    LesFloat,
    GtrFloat,
    LesEqlFloat,
    GtrEqlFloat,
    FlorFloat,
    CeilFloat,
    SinFloat,
    CosFloat,
    TanFloat,
    AsinFloat,
    AcosFloat,
    AtanFloat,
    LogFloat,
    PowFloat,
    SqrtFloat,
    RandFloat,
    /// Pop a float; push it truncated to an integer.
    F2i,
    /// Pop an integer; push it converted to a float.
    I2f,
    /// Swap the top two integer words.
    SwapInt,
    /// Discard the top integer word.
    PopInt,
    /// Discard the top float word.
    PopFloat,
    /// Invoke a runtime service; pops `arguments` operands, the last of which is the service
    /// index.
    Trap { arguments: u32 },
    /// Invoke a runtime service that pushes a result.
    TrapRtrn { arguments: u32 },
    /// Wait for the thread whose reference is popped by the runtime service.
    ThreadJoin,
    /// Pop a timeout and sleep the current thread.
    ThreadSleep,
    /// Pop a mutex reference and operate on it.
    ThreadMutex,
    /// Pop a mutex reference and enter its critical section.
    CriticalStart,
    /// Pop a mutex reference and leave its critical section.
    CriticalEnd,
    /// Load a native library.
    DllLoad,
    /// Unload a native library.
    DllUnload,
    /// Call into a native library.
    DllFuncCall,
}

impl Opcode {
    /// The wire byte for this opcode.
    #[must_use]
    #[expect(clippy::too_many_lines)]
    pub fn code(&self) -> u8 {
        match self {
            Opcode::LoadIntLit(_) => 0x01,
            Opcode::LoadCharLit(_) => 0x02,
            Opcode::LoadFloatLit(_) => 0x03,
            Opcode::LoadIntVar { .. } => 0x04,
            Opcode::LoadFloatVar { .. } => 0x05,
            Opcode::LoadFuncVar { .. } => 0x06,
            Opcode::StorIntVar { .. } => 0x07,
            Opcode::StorFloatVar { .. } => 0x08,
            Opcode::StorFuncVar { .. } => 0x09,
            Opcode::CopyIntVar { .. } => 0x0A,
            Opcode::CopyFloatVar { .. } => 0x0B,
            Opcode::LoadInstMem => 0x0C,
            Opcode::LoadClsMem => 0x0D,
            Opcode::LoadByteAryElm { .. } => 0x0E,
            Opcode::LoadCharAryElm { .. } => 0x0F,
            Opcode::LoadIntAryElm { .. } => 0x10,
            Opcode::LoadFloatAryElm { .. } => 0x11,
            Opcode::StorByteAryElm { .. } => 0x12,
            Opcode::StorCharAryElm { .. } => 0x13,
            Opcode::StorIntAryElm { .. } => 0x14,
            Opcode::StorFloatAryElm { .. } => 0x15,
            Opcode::NewByteAry { .. } => 0x16,
            Opcode::NewCharAry { .. } => 0x17,
            Opcode::NewIntAry { .. } => 0x18,
            Opcode::NewFloatAry { .. } => 0x19,
            Opcode::NewObjInst { .. } => 0x1A,
            Opcode::LoadArySize => 0x1B,
            Opcode::CpyByteAry => 0x1C,
            Opcode::CpyCharAry => 0x1D,
            Opcode::CpyIntAry => 0x1E,
            Opcode::CpyFloatAry => 0x1F,
            Opcode::ObjTypeOf { .. } => 0x20,
            Opcode::ObjInstCast { .. } => 0x21,
            Opcode::MthdCall { .. } => 0x22,
            Opcode::DynMthdCall { .. } => 0x23,
            Opcode::AsyncMthdCall { .. } => 0x24,
            Opcode::Jmp { .. } => 0x25,
            Opcode::Lbl { .. } => 0x26,
            Opcode::Rtrn => 0x27,
            Opcode::AndInt => 0x28,
            Opcode::OrInt => 0x29,
            Opcode::AddInt => 0x2A,
            Opcode::SubInt => 0x2B,
            Opcode::MulInt => 0x2C,
            Opcode::DivInt => 0x2D,
            Opcode::ModInt => 0x2E,
            Opcode::BitAndInt => 0x2F,
            Opcode::BitOrInt => 0x30,
            Opcode::BitXorInt => 0x31,
            Opcode::ShlInt(_) => 0x32,
            Opcode::ShrInt(_) => 0x33,
            Opcode::EqlInt => 0x34,
            Opcode::NeqlInt => 0x35,
            Opcode::LesInt => 0x36,
            Opcode::GtrInt => 0x37,
            Opcode::LesEqlInt => 0x38,
            Opcode::GtrEqlInt => 0x39,
            Opcode::AddFloat => 0x3A,
            Opcode::SubFloat => 0x3B,
            Opcode::MulFloat => 0x3C,
            Opcode::DivFloat => 0x3D,
            Opcode::EqlFloat => 0x3E,
            Opcode::NeqlFloat => 0x3F,
            Opcode::LesFloat => 0x40,
            Opcode::GtrFloat => 0x41,
            Opcode::LesEqlFloat => 0x42,
            Opcode::GtrEqlFloat => 0x43,
            Opcode::FlorFloat => 0x44,
            Opcode::CeilFloat => 0x45,
            Opcode::SinFloat => 0x46,
            Opcode::CosFloat => 0x47,
            Opcode::TanFloat => 0x48,
            Opcode::AsinFloat => 0x49,
            Opcode::AcosFloat => 0x4A,
            Opcode::AtanFloat => 0x4B,
            Opcode::LogFloat => 0x4C,
            Opcode::PowFloat => 0x4D,
            Opcode::SqrtFloat => 0x4E,
            Opcode::RandFloat => 0x4F,
            Opcode::F2i => 0x50,
            Opcode::I2f => 0x51,
            Opcode::SwapInt => 0x52,
            Opcode::PopInt => 0x53,
            Opcode::PopFloat => 0x54,
            Opcode::Trap { .. } => 0x55,
            Opcode::TrapRtrn { .. } => 0x56,
            Opcode::ThreadJoin => 0x57,
            Opcode::ThreadSleep => 0x58,
            Opcode::ThreadMutex => 0x59,
            Opcode::CriticalStart => 0x5A,
            Opcode::CriticalEnd => 0x5B,
            Opcode::DllLoad => 0x5C,
            Opcode::DllUnload => 0x5D,
            Opcode::DllFuncCall => 0x5E,
        }
    }

    /// The opcode mnemonic without operands.
    #[must_use]
    #[expect(clippy::too_many_lines)]
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::LoadIntLit(_) => "load_int_lit",
            Opcode::LoadCharLit(_) => "load_char_lit",
            Opcode::LoadFloatLit(_) => "load_float_lit",
            Opcode::LoadIntVar { .. } => "load_int_var",
            Opcode::LoadFloatVar { .. } => "load_float_var",
            Opcode::LoadFuncVar { .. } => "load_func_var",
            Opcode::StorIntVar { .. } => "stor_int_var",
            Opcode::StorFloatVar { .. } => "stor_float_var",
            Opcode::StorFuncVar { .. } => "stor_func_var",
            Opcode::CopyIntVar { .. } => "copy_int_var",
            Opcode::CopyFloatVar { .. } => "copy_float_var",
            Opcode::LoadInstMem => "load_inst_mem",
            Opcode::LoadClsMem => "load_cls_mem",
            Opcode::LoadByteAryElm { .. } => "load_byte_ary_elm",
            Opcode::LoadCharAryElm { .. } => "load_char_ary_elm",
            Opcode::LoadIntAryElm { .. } => "load_int_ary_elm",
            Opcode::LoadFloatAryElm { .. } => "load_float_ary_elm",
            Opcode::StorByteAryElm { .. } => "stor_byte_ary_elm",
            Opcode::StorCharAryElm { .. } => "stor_char_ary_elm",
            Opcode::StorIntAryElm { .. } => "stor_int_ary_elm",
            Opcode::StorFloatAryElm { .. } => "stor_float_ary_elm",
            Opcode::NewByteAry { .. } => "new_byte_ary",
            Opcode::NewCharAry { .. } => "new_char_ary",
            Opcode::NewIntAry { .. } => "new_int_ary",
            Opcode::NewFloatAry { .. } => "new_float_ary",
            Opcode::NewObjInst { .. } => "new_obj_inst",
            Opcode::LoadArySize => "load_ary_size",
            Opcode::CpyByteAry => "cpy_byte_ary",
            Opcode::CpyCharAry => "cpy_char_ary",
            Opcode::CpyIntAry => "cpy_int_ary",
            Opcode::CpyFloatAry => "cpy_float_ary",
            Opcode::ObjTypeOf { .. } => "obj_type_of",
            Opcode::ObjInstCast { .. } => "obj_inst_cast",
            Opcode::MthdCall { .. } => "mthd_call",
            Opcode::DynMthdCall { .. } => "dyn_mthd_call",
            Opcode::AsyncMthdCall { .. } => "async_mthd_call",
            Opcode::Jmp { .. } => "jmp",
            Opcode::Lbl { .. } => "lbl",
            Opcode::Rtrn => "rtrn",
            Opcode::AndInt => "and_int",
            Opcode::OrInt => "or_int",
            Opcode::AddInt => "add_int",
            Opcode::SubInt => "sub_int",
            Opcode::MulInt => "mul_int",
            Opcode::DivInt => "div_int",
            Opcode::ModInt => "mod_int",
            Opcode::BitAndInt => "bit_and_int",
            Opcode::BitOrInt => "bit_or_int",
            Opcode::BitXorInt => "bit_xor_int",
            Opcode::ShlInt(_) => "shl_int",
            Opcode::ShrInt(_) => "shr_int",
            Opcode::EqlInt => "eql_int",
            Opcode::NeqlInt => "neql_int",
            Opcode::LesInt => "les_int",
            Opcode::GtrInt => "gtr_int",
            Opcode::LesEqlInt => "les_eql_int",
            Opcode::GtrEqlInt => "gtr_eql_int",
            Opcode::AddFloat => "add_float",
            Opcode::SubFloat => "sub_float",
            Opcode::MulFloat => "mul_float",
            Opcode::DivFloat => "div_float",
            Opcode::EqlFloat => "eql_float",
            Opcode::NeqlFloat => "neql_float",
            Opcode::LesFloat => "les_float",
            Opcode::GtrFloat => "gtr_float",
            Opcode::LesEqlFloat => "les_eql_float",
            Opcode::GtrEqlFloat => "gtr_eql_float",
            Opcode::FlorFloat => "flor_float",
            Opcode::CeilFloat => "ceil_float",
            Opcode::SinFloat => "sin_float",
            Opcode::CosFloat => "cos_float",
            Opcode::TanFloat => "tan_float",
            Opcode::AsinFloat => "asin_float",
            Opcode::AcosFloat => "acos_float",
            Opcode::AtanFloat => "atan_float",
            Opcode::LogFloat => "log_float",
            Opcode::PowFloat => "pow_float",
            Opcode::SqrtFloat => "sqrt_float",
            Opcode::RandFloat => "rand_float",
            Opcode::F2i => "f2i",
            Opcode::I2f => "i2f",
            Opcode::SwapInt => "swap_int",
            Opcode::PopInt => "pop_int",
            Opcode::PopFloat => "pop_float",
            Opcode::Trap { .. } => "trap",
            Opcode::TrapRtrn { .. } => "trap_rtrn",
            Opcode::ThreadJoin => "thread_join",
            Opcode::ThreadSleep => "thread_sleep",
            Opcode::ThreadMutex => "thread_mutex",
            Opcode::CriticalStart => "critical_start",
            Opcode::CriticalEnd => "critical_end",
            Opcode::DllLoad => "dll_load",
            Opcode::DllUnload => "dll_unload",
            Opcode::DllFuncCall => "dll_func_call",
        }
    }

    /// Deserialize the opcode that follows an already-consumed wire byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the byte is not a valid opcode for an executable image or an operand is
    /// malformed.
    #[expect(clippy::too_many_lines)]
    pub(crate) fn from_bytes(code: u8, bytes: &mut Cursor<Vec<u8>>) -> Result<Opcode> {
        let opcode = match code {
            0x01 => Opcode::LoadIntLit(i64::from(bytes.read_i32::<LittleEndian>()?)),
            0x02 => {
                let value = bytes.read_u32::<LittleEndian>()?;
                let value = char::from_u32(value).ok_or(InvalidCharacterLiteral(value))?;
                Opcode::LoadCharLit(value)
            }
            0x03 => Opcode::LoadFloatLit(bytes.read_f64::<LittleEndian>()?),
            0x04 => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::LoadIntVar { slot, context }
            }
            0x05 => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::LoadFloatVar { slot, context }
            }
            0x06 => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::LoadFuncVar { slot, context }
            }
            0x07 => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::StorIntVar { slot, context }
            }
            0x08 => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::StorFloatVar { slot, context }
            }
            0x09 => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::StorFuncVar { slot, context }
            }
            0x0A => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::CopyIntVar { slot, context }
            }
            0x0B => {
                let (slot, context) = read_variable(bytes)?;
                Opcode::CopyFloatVar { slot, context }
            }
            0x0C => Opcode::LoadInstMem,
            0x0D => Opcode::LoadClsMem,
            0x0E => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::LoadByteAryElm {
                    dimensions,
                    context,
                }
            }
            0x0F => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::LoadCharAryElm {
                    dimensions,
                    context,
                }
            }
            0x10 => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::LoadIntAryElm {
                    dimensions,
                    context,
                }
            }
            0x11 => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::LoadFloatAryElm {
                    dimensions,
                    context,
                }
            }
            0x12 => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::StorByteAryElm {
                    dimensions,
                    context,
                }
            }
            0x13 => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::StorCharAryElm {
                    dimensions,
                    context,
                }
            }
            0x14 => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::StorIntAryElm {
                    dimensions,
                    context,
                }
            }
            0x15 => {
                let (dimensions, context) = read_variable(bytes)?;
                Opcode::StorFloatAryElm {
                    dimensions,
                    context,
                }
            }
            0x16 => Opcode::NewByteAry {
                dimensions: read_id(bytes)?,
            },
            0x17 => Opcode::NewCharAry {
                dimensions: read_id(bytes)?,
            },
            0x18 => Opcode::NewIntAry {
                dimensions: read_id(bytes)?,
            },
            0x19 => Opcode::NewFloatAry {
                dimensions: read_id(bytes)?,
            },
            0x1A => Opcode::NewObjInst {
                class: read_id(bytes)?,
            },
            0x1B => Opcode::LoadArySize,
            0x1C => Opcode::CpyByteAry,
            0x1D => Opcode::CpyCharAry,
            0x1E => Opcode::CpyIntAry,
            0x1F => Opcode::CpyFloatAry,
            0x20 => Opcode::ObjTypeOf {
                check: read_id(bytes)?,
            },
            0x21 => Opcode::ObjInstCast {
                to: read_id(bytes)?,
            },
            0x22 => {
                let class = read_id(bytes)?;
                let method = read_id(bytes)?;
                let native = bytes.read_i32::<LittleEndian>()? != 0;
                Opcode::MthdCall {
                    class,
                    method,
                    native,
                }
            }
            0x23 => {
                let parameters = read_id(bytes)?;
                let return_type = ReturnType::try_from(bytes.read_i32::<LittleEndian>()?)?;
                Opcode::DynMthdCall {
                    parameters,
                    return_type,
                }
            }
            0x24 => {
                let class = read_id(bytes)?;
                let method = read_id(bytes)?;
                let native = bytes.read_i32::<LittleEndian>()? != 0;
                Opcode::AsyncMthdCall {
                    class,
                    method,
                    native,
                }
            }
            0x25 => {
                let label = read_id(bytes)?;
                let condition = bytes.read_i32::<LittleEndian>()?;
                Opcode::Jmp { label, condition }
            }
            0x26 => Opcode::Lbl {
                id: read_id(bytes)?,
            },
            0x27 => Opcode::Rtrn,
            0x28 => Opcode::AndInt,
            0x29 => Opcode::OrInt,
            0x2A => Opcode::AddInt,
            0x2B => Opcode::SubInt,
            0x2C => Opcode::MulInt,
            0x2D => Opcode::DivInt,
            0x2E => Opcode::ModInt,
            0x2F => Opcode::BitAndInt,
            0x30 => Opcode::BitOrInt,
            0x31 => Opcode::BitXorInt,
            0x32 => Opcode::ShlInt(0),
            0x33 => Opcode::ShrInt(0),
            0x34 => Opcode::EqlInt,
            0x35 => Opcode::NeqlInt,
            0x36 => Opcode::LesInt,
            0x37 => Opcode::GtrInt,
            0x38 => Opcode::LesEqlInt,
            0x39 => Opcode::GtrEqlInt,
            0x3A => Opcode::AddFloat,
            0x3B => Opcode::SubFloat,
            0x3C => Opcode::MulFloat,
            0x3D => Opcode::DivFloat,
            0x3E => Opcode::EqlFloat,
            0x3F => Opcode::NeqlFloat,
            0x40 => Opcode::LesFloat,
            0x41 => Opcode::GtrFloat,
            0x42 => Opcode::LesEqlFloat,
            0x43 => Opcode::GtrEqlFloat,
            0x44 => Opcode::FlorFloat,
            0x45 => Opcode::CeilFloat,
            0x46 => Opcode::SinFloat,
            0x47 => Opcode::CosFloat,
            0x48 => Opcode::TanFloat,
            0x49 => Opcode::AsinFloat,
            0x4A => Opcode::AcosFloat,
            0x4B => Opcode::AtanFloat,
            0x4C => Opcode::LogFloat,
            0x4D => Opcode::PowFloat,
            0x4E => Opcode::SqrtFloat,
            0x4F => Opcode::RandFloat,
            0x50 => Opcode::F2i,
            0x51 => Opcode::I2f,
            0x52 => Opcode::SwapInt,
            0x53 => Opcode::PopInt,
            0x54 => Opcode::PopFloat,
            0x55 => Opcode::Trap {
                arguments: read_id(bytes)?,
            },
            0x56 => Opcode::TrapRtrn {
                arguments: read_id(bytes)?,
            },
            0x57 => Opcode::ThreadJoin,
            0x58 => Opcode::ThreadSleep,
            0x59 => Opcode::ThreadMutex,
            0x5A => Opcode::CriticalStart,
            0x5B => Opcode::CriticalEnd,
            0x5C => Opcode::DllLoad,
            0x5D => Opcode::DllUnload,
            0x5E => Opcode::DllFuncCall,
            LIB_NEW_OBJ_INST => return Err(UnsupportedInstruction("lib_new_obj_inst")),
            LIB_MTHD_CALL => return Err(UnsupportedInstruction("lib_mthd_call")),
            LIB_OBJ_INST_CAST => return Err(UnsupportedInstruction("lib_obj_inst_cast")),
            _ => return Err(InvalidOpcode(code)),
        };
        Ok(opcode)
    }

    /// Serialize the opcode byte and its operands.
    ///
    /// # Errors
    ///
    /// Returns an error if an operand does not fit its wire representation (e.g. a folded integer
    /// literal wider than 32 bits).
    pub(crate) fn to_bytes(&self, bytes: &mut Vec<u8>) -> Result<()> {
        bytes.push(self.code());
        match self {
            Opcode::LoadIntLit(value) => bytes.write_i32::<LittleEndian>(i32::try_from(*value)?)?,
            Opcode::LoadCharLit(value) => bytes.write_u32::<LittleEndian>(*value as u32)?,
            Opcode::LoadFloatLit(value) => bytes.write_f64::<LittleEndian>(*value)?,
            Opcode::LoadIntVar { slot, context }
            | Opcode::LoadFloatVar { slot, context }
            | Opcode::LoadFuncVar { slot, context }
            | Opcode::StorIntVar { slot, context }
            | Opcode::StorFloatVar { slot, context }
            | Opcode::StorFuncVar { slot, context }
            | Opcode::CopyIntVar { slot, context }
            | Opcode::CopyFloatVar { slot, context } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*slot)?)?;
                bytes.write_i32::<LittleEndian>(context.code())?;
            }
            Opcode::LoadByteAryElm {
                dimensions,
                context,
            }
            | Opcode::LoadCharAryElm {
                dimensions,
                context,
            }
            | Opcode::LoadIntAryElm {
                dimensions,
                context,
            }
            | Opcode::LoadFloatAryElm {
                dimensions,
                context,
            }
            | Opcode::StorByteAryElm {
                dimensions,
                context,
            }
            | Opcode::StorCharAryElm {
                dimensions,
                context,
            }
            | Opcode::StorIntAryElm {
                dimensions,
                context,
            }
            | Opcode::StorFloatAryElm {
                dimensions,
                context,
            } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*dimensions)?)?;
                bytes.write_i32::<LittleEndian>(context.code())?;
            }
            Opcode::NewByteAry { dimensions }
            | Opcode::NewCharAry { dimensions }
            | Opcode::NewIntAry { dimensions }
            | Opcode::NewFloatAry { dimensions } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*dimensions)?)?;
            }
            Opcode::NewObjInst { class } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*class)?)?;
            }
            Opcode::ObjTypeOf { check } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*check)?)?;
            }
            Opcode::ObjInstCast { to } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*to)?)?;
            }
            Opcode::MthdCall {
                class,
                method,
                native,
            }
            | Opcode::AsyncMthdCall {
                class,
                method,
                native,
            } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*class)?)?;
                bytes.write_i32::<LittleEndian>(i32::try_from(*method)?)?;
                bytes.write_i32::<LittleEndian>(i32::from(*native))?;
            }
            Opcode::DynMthdCall {
                parameters,
                return_type,
            } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*parameters)?)?;
                bytes.write_i32::<LittleEndian>(return_type.code())?;
            }
            Opcode::Jmp { label, condition } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*label)?)?;
                bytes.write_i32::<LittleEndian>(*condition)?;
            }
            Opcode::Lbl { id } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*id)?)?;
            }
            Opcode::Trap { arguments } | Opcode::TrapRtrn { arguments } => {
                bytes.write_i32::<LittleEndian>(i32::try_from(*arguments)?)?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::LoadIntLit(value) | Opcode::ShlInt(value) | Opcode::ShrInt(value) => {
                write!(f, "{} {value}", self.name())
            }
            Opcode::LoadCharLit(value) => write!(f, "{} {value:?}", self.name()),
            Opcode::LoadFloatLit(value) => write!(f, "{} {value}", self.name()),
            Opcode::LoadIntVar { slot, context }
            | Opcode::LoadFloatVar { slot, context }
            | Opcode::LoadFuncVar { slot, context }
            | Opcode::StorIntVar { slot, context }
            | Opcode::StorFloatVar { slot, context }
            | Opcode::StorFuncVar { slot, context }
            | Opcode::CopyIntVar { slot, context }
            | Opcode::CopyFloatVar { slot, context } => {
                write!(f, "{} {slot}, {context}", self.name())
            }
            Opcode::LoadByteAryElm {
                dimensions,
                context,
            }
            | Opcode::LoadCharAryElm {
                dimensions,
                context,
            }
            | Opcode::LoadIntAryElm {
                dimensions,
                context,
            }
            | Opcode::LoadFloatAryElm {
                dimensions,
                context,
            }
            | Opcode::StorByteAryElm {
                dimensions,
                context,
            }
            | Opcode::StorCharAryElm {
                dimensions,
                context,
            }
            | Opcode::StorIntAryElm {
                dimensions,
                context,
            }
            | Opcode::StorFloatAryElm {
                dimensions,
                context,
            } => write!(f, "{} {dimensions}, {context}", self.name()),
            Opcode::NewByteAry { dimensions }
            | Opcode::NewCharAry { dimensions }
            | Opcode::NewIntAry { dimensions }
            | Opcode::NewFloatAry { dimensions } => {
                write!(f, "{} {dimensions}", self.name())
            }
            Opcode::NewObjInst { class } => write!(f, "{} {class}", self.name()),
            Opcode::ObjTypeOf { check } => write!(f, "{} {check}", self.name()),
            Opcode::ObjInstCast { to } => write!(f, "{} {to}", self.name()),
            Opcode::MthdCall { class, method, .. } | Opcode::AsyncMthdCall { class, method, .. } => {
                write!(f, "{} {class}.{method}", self.name())
            }
            Opcode::DynMthdCall { parameters, .. } => write!(f, "{} {parameters}", self.name()),
            Opcode::Jmp { label, condition } => write!(f, "{} {label}, {condition}", self.name()),
            Opcode::Lbl { id } => write!(f, "{} {id}", self.name()),
            Opcode::Trap { arguments } | Opcode::TrapRtrn { arguments } => {
                write!(f, "{} {arguments}", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// An opcode together with the source line it was compiled from.
///
/// The line is `None` unless the enclosing class was compiled with debug rows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub line: Option<u32>,
}

impl Instruction {
    /// Creates an instruction with no source line.
    #[must_use]
    pub fn new(op: Opcode) -> Self {
        Instruction { op, line: None }
    }

    /// Creates an instruction with a source line.
    #[must_use]
    pub fn with_line(op: Opcode, line: u32) -> Self {
        Instruction {
            op,
            line: Some(line),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.op.fmt(f)
    }
}

fn read_id(bytes: &mut Cursor<Vec<u8>>) -> Result<u32> {
    let value = bytes.read_i32::<LittleEndian>()?;
    Ok(u32::try_from(value)?)
}

fn read_variable(bytes: &mut Cursor<Vec<u8>>) -> Result<(u32, MemoryContext)> {
    let slot = read_id(bytes)?;
    let context = MemoryContext::try_from(bytes.read_i32::<LittleEndian>()?)?;
    Ok((slot, context))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;

    fn round_trip(opcode: Opcode) -> Result<Opcode> {
        let mut bytes = Vec::new();
        opcode.to_bytes(&mut bytes)?;
        let mut cursor = Cursor::new(bytes);
        let code = byteorder::ReadBytesExt::read_u8(&mut cursor)?;
        Opcode::from_bytes(code, &mut cursor)
    }

    #[test]
    fn test_literal_round_trips() -> Result<()> {
        assert_eq!(Opcode::LoadIntLit(-42), round_trip(Opcode::LoadIntLit(-42))?);
        assert_eq!(
            Opcode::LoadCharLit('λ'),
            round_trip(Opcode::LoadCharLit('λ'))?
        );
        assert_eq!(
            Opcode::LoadFloatLit(2.5),
            round_trip(Opcode::LoadFloatLit(2.5))?
        );
        Ok(())
    }

    #[test]
    fn test_variable_round_trips() -> Result<()> {
        let opcode = Opcode::StorIntVar {
            slot: 3,
            context: MemoryContext::Instance,
        };
        assert_eq!(opcode, round_trip(opcode)?);
        let opcode = Opcode::CopyFloatVar {
            slot: 7,
            context: MemoryContext::Local,
        };
        assert_eq!(opcode, round_trip(opcode)?);
        Ok(())
    }

    #[test]
    fn test_call_round_trips() -> Result<()> {
        let opcode = Opcode::MthdCall {
            class: 5,
            method: 2,
            native: false,
        };
        assert_eq!(opcode, round_trip(opcode)?);
        let opcode = Opcode::DynMthdCall {
            parameters: 2,
            return_type: ReturnType::Float,
        };
        assert_eq!(opcode, round_trip(opcode)?);
        Ok(())
    }

    #[test]
    fn test_jump_round_trip() -> Result<()> {
        let opcode = Opcode::Jmp {
            label: 9,
            condition: JUMP_UNCONDITIONAL,
        };
        assert_eq!(opcode, round_trip(opcode)?);
        Ok(())
    }

    #[test]
    fn test_shift_operand_not_encoded() -> Result<()> {
        // The shift operand only exists after strength reduction and is never serialized.
        assert_eq!(Opcode::ShlInt(0), round_trip(Opcode::ShlInt(3))?);
        Ok(())
    }

    #[test]
    fn test_invalid_opcode() {
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(
            Err(Error::InvalidOpcode(0xE7)),
            Opcode::from_bytes(0xE7, &mut cursor)
        );
    }

    #[test]
    fn test_library_instruction_rejected() {
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(
            Err(Error::UnsupportedInstruction("lib_mthd_call")),
            Opcode::from_bytes(LIB_MTHD_CALL, &mut cursor)
        );
    }

    #[test]
    fn test_invalid_memory_context() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&7i32.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        assert_eq!(
            Err(Error::InvalidMemoryContext(7)),
            Opcode::from_bytes(0x04, &mut cursor)
        );
    }

    #[test]
    fn test_display() {
        let opcode = Opcode::LoadIntVar {
            slot: 2,
            context: MemoryContext::Local,
        };
        assert_eq!("load_int_var 2, local", opcode.to_string());
        assert_eq!("add_int", Opcode::AddInt.to_string());
        assert_eq!(
            "mthd_call 5.2",
            Opcode::MthdCall {
                class: 5,
                method: 2,
                native: false
            }
            .to_string()
        );
    }
}
