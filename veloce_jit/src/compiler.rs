//! Single-pass translation of stack IR into x86-64 machine code.
//!
//! The translator consumes a method's instructions in order, keeping a compile-time working
//! stack of symbolic operands so values stay in registers between instructions. Anything the
//! instruction set cannot express in a few machine instructions is routed through the runtime
//! callback bridge. Compilation failures are never fatal; the caller keeps the method
//! interpreted.

use crate::assembler::{Assembler, Condition, Rounding};
use crate::error::Error::{
    InternalError, InvalidMethodReference, JumpDisplacementOutOfRange, NativeMethod,
    OperandStackUnderflow, RegisterPoolExhausted, SpillAreaExhausted, UnresolvedLabel,
    UnsupportedArrayDimensions, UnsupportedInstruction,
};
use crate::error::Result;
use crate::frame::{
    CLS_ID, CLASS_MEM, Frame, INSTANCE_MEM, MTHD_ID, OP_STACK, STACK_POS, TempSlots,
};
use crate::function::CompiledMethod;
use crate::hooks::RuntimeHooks;
use crate::memory::ExecutableMemory;
use crate::operand::Operand;
use crate::register::{Gpr, RegisterPool, Xmm};
use indexmap::IndexMap;
use std::collections::VecDeque;
use tracing::debug;
use veloce_bytecode::{
    Instruction, MemoryContext, Opcode, Program, ReturnType, WORD_SIZE,
};

/// Byte offset of the element count in an array header.
const ARRAY_SIZE_OFFSET: i32 = 0;
/// Byte offset of the first element of a one-dimensional array: size, dimension count, and one
/// dimension extent precede the data.
const ARRAY_DATA_OFFSET: i32 = 24;

/// Registers preserved by the prolog, restored in reverse by the epilog.
const SAVED_REGISTERS: [Gpr; 13] = [
    Gpr::Rbx,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rdi,
    Gpr::Rsi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// Veloce bytecode to native code compiler.
#[derive(Clone, Debug)]
pub struct Compiler {
    hooks: RuntimeHooks,
}

impl Compiler {
    /// Creates a compiler that bakes the given runtime hooks into generated code.
    #[must_use]
    pub fn new(hooks: RuntimeHooks) -> Self {
        Compiler { hooks }
    }

    /// Compiles one method to native code.
    ///
    /// # Errors
    ///
    /// Any error is a compilation abort: the method is unchanged and the host falls back to the
    /// interpreter.
    pub fn compile(
        &self,
        program: &Program,
        class_id: u32,
        method_id: u32,
    ) -> Result<CompiledMethod> {
        let method = program
            .method(class_id, method_id)
            .ok_or(InvalidMethodReference {
                class: class_id,
                method: method_id,
            })?;
        if method.is_native {
            return Err(NativeMethod(method.name.clone()));
        }
        debug!("compiling {}.{}: '{}'", class_id, method_id, method.name);

        let instructions: Vec<Instruction> = method.instructions().copied().collect();
        let mut translator = Translator {
            program,
            hooks: &self.hooks,
            instructions,
            asm: Assembler::new(),
            frame: Frame::new(method.local_frame_size),
            pool: RegisterPool::new(),
            temps: TempSlots::default(),
            working: VecDeque::new(),
            labels: IndexMap::new(),
            jump_fixups: Vec::new(),
            nil_fixups: Vec::new(),
            bounds_fixups: Vec::new(),
            skip_jump: false,
            index: 0,
        };

        translator.prolog();
        translator.register_root();
        translator.process_parameters(method.param_count)?;
        while translator.index < translator.instructions.len() {
            let instruction = translator.instructions[translator.index];
            translator.index += 1;
            translator.translate(instruction)?;
        }
        let (code, instructions) = translator.finish()?;

        let code_size = code.len();
        let mut memory = ExecutableMemory::allocate(code_size)?;
        memory.write(&code)?;
        memory.make_executable()?;
        debug!("compiled {}.{}: {code_size} bytes", class_id, method_id);
        Ok(CompiledMethod::new(
            class_id,
            method_id,
            memory,
            code_size,
            instructions,
        ))
    }
}

struct Translator<'a> {
    program: &'a Program,
    hooks: &'a RuntimeHooks,
    instructions: Vec<Instruction>,
    asm: Assembler,
    frame: Frame,
    pool: RegisterPool,
    temps: TempSlots,
    /// Symbolic model of the runtime operand stack; the front is the top.
    working: VecDeque<Operand>,
    labels: IndexMap<u32, usize>,
    jump_fixups: Vec<(usize, u32)>,
    nil_fixups: Vec<usize>,
    bounds_fixups: Vec<usize>,
    /// Set when a compare fused with the following conditional jump.
    skip_jump: bool,
    index: usize,
}

impl Translator<'_> {
    // ---- working stack ----

    fn push(&mut self, operand: Operand) {
        self.working.push_front(operand);
    }

    fn pop(&mut self) -> Result<Operand> {
        self.working.pop_front().ok_or(OperandStackUnderflow)
    }

    /// Frees whatever resources back a consumed operand.
    fn release_operand(&mut self, operand: Operand) {
        match operand {
            Operand::IntReg(register) => self.pool.release(register),
            Operand::FloatReg(register) => self.pool.release_xmm(register),
            Operand::IntMem(offset) | Operand::FloatMem(offset) => self.release_temp(offset),
            Operand::IntImm(_) | Operand::FloatImm(_) => {}
        }
    }

    /// Frees a red-zone spill slot if the offset names one.
    fn release_temp(&mut self, offset: i32) {
        if let Some(index) = self.frame.temp_gpr_index(offset) {
            self.temps.release_gpr(index);
        } else if let Some(index) = self.frame.temp_xmm_index(offset) {
            self.temps.release_xmm(index);
        }
    }

    // ---- register acquisition with red-zone spilling ----

    fn acquire_gpr(&mut self) -> Result<Gpr> {
        if let Ok(register) = self.pool.acquire() {
            return Ok(register);
        }
        self.spill_gpr(|_| true)
    }

    fn acquire_byte_gpr(&mut self) -> Result<Gpr> {
        if let Ok(register) = self.pool.acquire_byte_addressable() {
            return Ok(register);
        }
        self.spill_gpr(Gpr::is_byte_addressable)
    }

    /// Spills the oldest working-stack value held in an eligible register and hands the register
    /// over.
    fn spill_gpr(&mut self, eligible: fn(Gpr) -> bool) -> Result<Gpr> {
        for index in (0..self.working.len()).rev() {
            if let Operand::IntReg(register) = self.working[index] {
                if !eligible(register) {
                    continue;
                }
                let slot = self.temps.acquire_gpr().ok_or(SpillAreaExhausted)?;
                let offset = self.frame.temp_gpr(slot);
                self.asm.mov_reg_mem(register, offset, Gpr::Rbp);
                self.working[index] = Operand::IntMem(offset);
                return Ok(register);
            }
        }
        Err(RegisterPoolExhausted)
    }

    fn acquire_xmm(&mut self) -> Result<Xmm> {
        if let Ok(register) = self.pool.acquire_xmm() {
            return Ok(register);
        }
        for index in (0..self.working.len()).rev() {
            if let Operand::FloatReg(register) = self.working[index] {
                let slot = self.temps.acquire_xmm().ok_or(SpillAreaExhausted)?;
                let offset = self.frame.temp_xmm(slot);
                self.asm.movsd_xreg_mem(register, offset, Gpr::Rbp);
                self.working[index] = Operand::FloatMem(offset);
                return Ok(register);
            }
        }
        Err(RegisterPoolExhausted)
    }

    // ---- materialization ----

    fn materialize_int(&mut self, operand: Operand) -> Result<Gpr> {
        match operand {
            Operand::IntImm(value) => {
                let register = self.acquire_gpr()?;
                self.asm.mov_imm_reg(value, register);
                Ok(register)
            }
            Operand::IntReg(register) => Ok(register),
            Operand::IntMem(offset) => {
                let register = self.acquire_gpr()?;
                self.asm.mov_mem_reg(offset, Gpr::Rbp, register);
                self.release_temp(offset);
                Ok(register)
            }
            Operand::FloatImm(_) | Operand::FloatReg(_) | Operand::FloatMem(_) => Err(
                InternalError("expected an integer operand".to_string()),
            ),
        }
    }

    fn materialize_float(&mut self, operand: Operand) -> Result<Xmm> {
        match operand {
            Operand::FloatImm(value) => {
                let bits = self.acquire_gpr()?;
                self.asm.mov_imm_reg(value.to_bits() as i64, bits);
                let register = self.acquire_xmm()?;
                self.asm.movq_reg_xreg(bits, register);
                self.pool.release(bits);
                Ok(register)
            }
            Operand::FloatReg(register) => Ok(register),
            Operand::FloatMem(offset) | Operand::IntMem(offset) => {
                let register = self.acquire_xmm()?;
                self.asm.movsd_mem_xreg(offset, Gpr::Rbp, register);
                self.release_temp(offset);
                Ok(register)
            }
            Operand::IntImm(_) | Operand::IntReg(_) => Err(InternalError(
                "expected a float operand".to_string(),
            )),
        }
    }

    // ---- prolog, epilog, and roots ----

    fn prolog(&mut self) {
        self.asm.push_reg(Gpr::Rbp);
        self.asm.mov_reg_reg(Gpr::Rsp, Gpr::Rbp);
        self.asm.sub_imm_reg(self.frame.size(), Gpr::Rsp);
        // home the six incoming arguments
        self.asm.mov_reg_mem(Gpr::Rdi, CLS_ID, Gpr::Rbp);
        self.asm.mov_reg_mem(Gpr::Rsi, MTHD_ID, Gpr::Rbp);
        self.asm.mov_reg_mem(Gpr::Rdx, CLASS_MEM, Gpr::Rbp);
        self.asm.mov_reg_mem(Gpr::Rcx, INSTANCE_MEM, Gpr::Rbp);
        self.asm.mov_reg_mem(Gpr::R8, OP_STACK, Gpr::Rbp);
        self.asm.mov_reg_mem(Gpr::R9, STACK_POS, Gpr::Rbp);
        for register in SAVED_REGISTERS {
            self.asm.push_reg(register);
        }
    }

    fn epilog(&mut self, status: i64) {
        self.asm.mov_imm_reg(status, Gpr::Rax);
        for register in SAVED_REGISTERS.iter().rev() {
            self.asm.pop_reg(*register);
        }
        self.asm.mov_reg_reg(Gpr::Rbp, Gpr::Rsp);
        self.asm.pop_reg(Gpr::Rbp);
        self.asm.ret();
    }

    /// Registers the local variable area as a garbage collection root.
    fn register_root(&mut self) {
        self.asm.mov_reg_reg(Gpr::Rbp, Gpr::Rcx);
        self.asm.sub_imm_reg(self.frame.locals_base(), Gpr::Rcx);
        self.asm.mov_mem_reg(INSTANCE_MEM, Gpr::Rbp, Gpr::Rdx);
        self.asm.mov_mem_reg(MTHD_ID, Gpr::Rbp, Gpr::Rsi);
        self.asm.mov_mem_reg(CLS_ID, Gpr::Rbp, Gpr::Rdi);
        self.asm
            .mov_imm_reg(i64::from(self.frame.locals_bytes()), Gpr::R8);
        self.asm
            .mov_imm_reg(self.hooks.add_method_root as usize as i64, Gpr::Rax);
        self.asm.call_reg(Gpr::Rax);
    }

    fn unregister_root(&mut self) {
        self.asm.mov_reg_reg(Gpr::Rbp, Gpr::Rdi);
        self.asm.sub_imm_reg(self.frame.locals_base(), Gpr::Rdi);
        self.asm
            .mov_imm_reg(self.hooks.remove_method_root as usize as i64, Gpr::Rax);
        self.asm.call_reg(Gpr::Rax);
    }

    /// Emits a null check on a heap pointer; jumps to the nil trap stub when zero.
    fn check_nil(&mut self, register: Gpr) {
        self.asm.test_reg_reg(register, register);
        let fixup = self.asm.jcc_rel32(Condition::Equal);
        self.nil_fixups.push(fixup);
    }

    // ---- parameter binding ----

    /// Binds the declared parameters: the method body opens with one store per parameter, each
    /// consuming a value the caller left on the operand stack.
    fn process_parameters(&mut self, count: u32) -> Result<()> {
        let mut remaining = i64::from(count);
        while remaining > 0 {
            let instruction = self
                .instructions
                .get(self.index)
                .copied()
                .ok_or_else(|| InternalError("missing parameter binding".to_string()))?;
            self.index += 1;
            match instruction.op {
                Opcode::StorIntVar { .. } => {
                    self.load_stack_int()?;
                    self.process_store(instruction.op)?;
                    remaining -= 1;
                }
                Opcode::StorFloatVar { .. } => {
                    self.load_stack_float()?;
                    self.process_store(instruction.op)?;
                    remaining -= 1;
                }
                Opcode::StorFuncVar { .. } => {
                    self.load_stack_func()?;
                    self.process_store(instruction.op)?;
                    remaining -= 2;
                }
                op => return Err(UnsupportedInstruction(op.to_string())),
            }
        }
        Ok(())
    }

    /// Pops one integer word from the runtime operand stack into a register.
    fn load_stack_int(&mut self) -> Result<()> {
        let stack = self.acquire_gpr()?;
        self.asm.mov_mem_reg(OP_STACK, Gpr::Rbp, stack);
        let position = self.acquire_gpr()?;
        self.asm.mov_mem_reg(STACK_POS, Gpr::Rbp, position);
        self.asm.dec_mem(0, position);
        self.asm.mov_mem_reg(0, position, position);
        self.asm.shl_imm_reg(3, position);
        self.asm.add_reg_reg(position, stack);
        self.asm.mov_mem_reg(0, stack, stack);
        self.pool.release(position);
        self.push(Operand::IntReg(stack));
        Ok(())
    }

    /// Pops one float word from the runtime operand stack into an SSE register.
    fn load_stack_float(&mut self) -> Result<()> {
        let stack = self.acquire_gpr()?;
        self.asm.mov_mem_reg(OP_STACK, Gpr::Rbp, stack);
        let position = self.acquire_gpr()?;
        self.asm.mov_mem_reg(STACK_POS, Gpr::Rbp, position);
        let destination = self.acquire_xmm()?;
        self.asm.dec_mem(0, position);
        self.asm.mov_mem_reg(0, position, position);
        self.asm.shl_imm_reg(3, position);
        self.asm.add_reg_reg(position, stack);
        self.asm.movsd_mem_xreg(0, stack, destination);
        self.pool.release(stack);
        self.pool.release(position);
        self.push(Operand::FloatReg(destination));
        Ok(())
    }

    /// Pops a function value (two words) from the runtime operand stack.
    fn load_stack_func(&mut self) -> Result<()> {
        let stack = self.acquire_gpr()?;
        self.asm.mov_mem_reg(OP_STACK, Gpr::Rbp, stack);
        let position = self.acquire_gpr()?;
        self.asm.mov_mem_reg(STACK_POS, Gpr::Rbp, position);
        self.asm.sub_imm_mem(2, 0, position);
        self.asm.mov_mem_reg(0, position, position);
        self.asm.shl_imm_reg(3, position);
        self.asm.add_reg_reg(position, stack);
        let second = self.acquire_gpr()?;
        self.asm.mov_reg_reg(stack, second);
        self.asm.mov_mem_reg(0, stack, stack);
        self.push(Operand::IntReg(stack));
        self.asm.mov_mem_reg(8, second, second);
        self.push(Operand::IntReg(second));
        self.pool.release(position);
        Ok(())
    }

    // ---- the per-opcode dispatch ----

    #[expect(clippy::too_many_lines)]
    fn translate(&mut self, instruction: Instruction) -> Result<()> {
        match instruction.op {
            Opcode::LoadIntLit(value) => self.push(Operand::IntImm(value)),
            Opcode::LoadCharLit(value) => self.push(Operand::IntImm(i64::from(u32::from(value)))),
            Opcode::LoadFloatLit(value) => self.push(Operand::FloatImm(value)),
            Opcode::LoadInstMem => self.push(Operand::IntMem(INSTANCE_MEM)),
            Opcode::LoadClsMem => self.push(Operand::IntMem(CLASS_MEM)),
            Opcode::LoadIntVar { .. }
            | Opcode::LoadFloatVar { .. }
            | Opcode::LoadFuncVar { .. } => self.process_load(instruction.op)?,
            Opcode::StorIntVar { .. }
            | Opcode::StorFloatVar { .. }
            | Opcode::StorFuncVar { .. } => self.process_store(instruction.op)?,
            Opcode::CopyIntVar { .. } | Opcode::CopyFloatVar { .. } => {
                self.process_copy(instruction.op)?;
            }
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
            | Opcode::ShrInt(_) => self.process_int_calculation(instruction.op)?,
            Opcode::EqlInt
            | Opcode::NeqlInt
            | Opcode::LesInt
            | Opcode::GtrInt
            | Opcode::LesEqlInt
            | Opcode::GtrEqlInt => self.process_int_compare(instruction.op)?,
            Opcode::AddFloat | Opcode::SubFloat | Opcode::MulFloat | Opcode::DivFloat => {
                self.process_float_calculation(instruction.op)?;
            }
            Opcode::EqlFloat
            | Opcode::NeqlFloat
            | Opcode::LesFloat
            | Opcode::GtrFloat
            | Opcode::LesEqlFloat
            | Opcode::GtrEqlFloat => self.process_float_compare(instruction.op)?,
            Opcode::FlorFloat => self.process_round(Rounding::Floor)?,
            Opcode::CeilFloat => self.process_round(Rounding::Ceiling)?,
            Opcode::F2i => self.process_float_to_int()?,
            Opcode::I2f => self.process_int_to_float()?,
            Opcode::SwapInt => {
                let top = self.pop()?;
                let below = self.pop()?;
                self.push(top);
                self.push(below);
            }
            Opcode::PopInt | Opcode::PopFloat => {
                // constants that never reached a register still need their entry dropped
                if let Some(operand) = self.working.pop_front() {
                    self.release_operand(operand);
                }
            }
            Opcode::Jmp { label, condition } => self.process_jump(label, condition)?,
            Opcode::Lbl { id } => {
                self.labels.insert(id, self.asm.position());
            }
            Opcode::Rtrn => {
                self.process_return(None)?;
                self.unregister_root();
                self.epilog(0);
            }
            Opcode::MthdCall { class, method, .. } => {
                let callee = self
                    .program
                    .method(class, method)
                    .ok_or(InvalidMethodReference { class, method })?;
                let parameters = callee.param_count as usize + 1;
                let return_type = callee.return_type;
                self.process_stack_callback(instruction.op, parameters)?;
                self.load_stack_return(return_type)?;
            }
            Opcode::DynMthdCall {
                parameters,
                return_type,
            } => {
                self.process_stack_callback(instruction.op, parameters as usize + 3)?;
                self.load_stack_return(return_type)?;
            }
            Opcode::NewByteAry { dimensions }
            | Opcode::NewCharAry { dimensions }
            | Opcode::NewIntAry { dimensions }
            | Opcode::NewFloatAry { dimensions } => {
                self.process_stack_callback(instruction.op, dimensions as usize)?;
                self.load_stack_return(ReturnType::Int)?;
            }
            Opcode::NewObjInst { .. } => {
                self.process_stack_callback(instruction.op, 0)?;
                self.load_stack_return(ReturnType::Int)?;
            }
            Opcode::ObjTypeOf { .. } | Opcode::ObjInstCast { .. } => {
                self.process_stack_callback(instruction.op, 1)?;
                self.load_stack_return(ReturnType::Int)?;
            }
            Opcode::Trap { arguments } => {
                self.process_stack_callback(instruction.op, arguments as usize)?;
            }
            Opcode::TrapRtrn { arguments } => {
                self.process_stack_callback(instruction.op, arguments as usize)?;
                self.load_stack_return(ReturnType::Int)?;
            }
            Opcode::ThreadJoin => self.process_stack_callback(instruction.op, 0)?,
            Opcode::ThreadSleep | Opcode::CriticalStart | Opcode::CriticalEnd => {
                self.process_stack_callback(instruction.op, 1)?;
            }
            Opcode::CpyByteAry | Opcode::CpyCharAry | Opcode::CpyIntAry | Opcode::CpyFloatAry => {
                self.process_stack_callback(instruction.op, 5)?;
            }
            Opcode::LoadByteAryElm {
                dimensions, ..
            } => self.process_load_element(dimensions, ElementKind::Byte)?,
            Opcode::LoadCharAryElm {
                dimensions, ..
            } => self.process_load_element(dimensions, ElementKind::Char)?,
            Opcode::LoadIntAryElm {
                dimensions, ..
            } => self.process_load_element(dimensions, ElementKind::Int)?,
            Opcode::LoadFloatAryElm {
                dimensions, ..
            } => self.process_load_element(dimensions, ElementKind::Float)?,
            Opcode::StorByteAryElm {
                dimensions, ..
            } => self.process_store_element(dimensions, ElementKind::Byte)?,
            Opcode::StorCharAryElm {
                dimensions, ..
            } => self.process_store_element(dimensions, ElementKind::Char)?,
            Opcode::StorIntAryElm {
                dimensions, ..
            } => self.process_store_element(dimensions, ElementKind::Int)?,
            Opcode::StorFloatAryElm {
                dimensions, ..
            } => self.process_store_element(dimensions, ElementKind::Float)?,
            op => return Err(UnsupportedInstruction(op.to_string())),
        }
        Ok(())
    }

    // ---- variable access ----

    fn process_load(&mut self, op: Opcode) -> Result<()> {
        let (slot, context) = match op {
            Opcode::LoadIntVar { slot, context }
            | Opcode::LoadFloatVar { slot, context }
            | Opcode::LoadFuncVar { slot, context } => (slot, context),
            _ => return Err(InternalError("expected a variable load".to_string())),
        };
        if context == MemoryContext::Local {
            let offset = self.frame.local_offset(slot);
            match op {
                Opcode::LoadIntVar { .. } => self.push(Operand::IntMem(offset)),
                Opcode::LoadFloatVar { .. } => self.push(Operand::FloatMem(offset)),
                _ => {
                    // a function value spans this slot and the next
                    self.push(Operand::IntMem(self.frame.local_offset(slot + 1)));
                    self.push(Operand::IntMem(offset));
                }
            }
            return Ok(());
        }

        let base_operand = self.pop()?;
        let base = self.materialize_int(base_operand)?;
        self.check_nil(base);
        let field = field_offset(slot);
        match op {
            Opcode::LoadIntVar { .. } => {
                self.asm.mov_mem_reg(field, base, base);
                self.push(Operand::IntReg(base));
            }
            Opcode::LoadFloatVar { .. } => {
                let destination = self.acquire_xmm()?;
                self.asm.movsd_mem_xreg(field, base, destination);
                self.pool.release(base);
                self.push(Operand::FloatReg(destination));
            }
            _ => {
                let second = self.acquire_gpr()?;
                self.asm
                    .mov_mem_reg(field + WORD_SIZE as i32, base, second);
                self.push(Operand::IntReg(second));
                self.asm.mov_mem_reg(field, base, base);
                self.push(Operand::IntReg(base));
            }
        }
        Ok(())
    }

    fn process_store(&mut self, op: Opcode) -> Result<()> {
        let (slot, context) = match op {
            Opcode::StorIntVar { slot, context }
            | Opcode::StorFloatVar { slot, context }
            | Opcode::StorFuncVar { slot, context } => (slot, context),
            _ => return Err(InternalError("expected a variable store".to_string())),
        };
        let (base, offset, base_register) = if context == MemoryContext::Local {
            (Gpr::Rbp, self.frame.local_offset(slot), None)
        } else {
            let base_operand = self.pop()?;
            let base = self.materialize_int(base_operand)?;
            self.check_nil(base);
            (base, field_offset(slot), Some(base))
        };

        match op {
            Opcode::StorIntVar { .. } => {
                let value = self.pop()?;
                self.store_int(value, offset, base)?;
            }
            Opcode::StorFloatVar { .. } => {
                let value = self.pop()?;
                let register = self.materialize_float(value)?;
                self.asm.movsd_xreg_mem(register, offset, base);
                self.pool.release_xmm(register);
            }
            _ => {
                let first = self.pop()?;
                self.store_int(first, offset, base)?;
                // local slots descend in memory; heap fields ascend
                let second_offset = if context == MemoryContext::Local {
                    self.frame.local_offset(slot + 1)
                } else {
                    offset + WORD_SIZE as i32
                };
                let second = self.pop()?;
                self.store_int(second, second_offset, base)?;
            }
        }
        if let Some(register) = base_register {
            self.pool.release(register);
        }
        Ok(())
    }

    /// Stores an integer operand into `[base + offset]`, picking the immediate form when it fits.
    fn store_int(&mut self, value: Operand, offset: i32, base: Gpr) -> Result<()> {
        match value {
            Operand::IntImm(immediate) => {
                if let Ok(immediate) = i32::try_from(immediate) {
                    self.asm.mov_imm_mem(immediate, offset, base);
                } else {
                    let register = self.acquire_gpr()?;
                    self.asm.mov_imm_reg(immediate, register);
                    self.asm.mov_reg_mem(register, offset, base);
                    self.pool.release(register);
                }
            }
            Operand::IntReg(register) => {
                self.asm.mov_reg_mem(register, offset, base);
                self.pool.release(register);
            }
            Operand::IntMem(source) => {
                let register = self.acquire_gpr()?;
                self.asm.mov_mem_reg(source, Gpr::Rbp, register);
                self.asm.mov_reg_mem(register, offset, base);
                self.pool.release(register);
                self.release_temp(source);
            }
            _ => return Err(InternalError("expected an integer operand".to_string())),
        }
        Ok(())
    }

    /// Stores the top of the working stack into a variable without consuming it; the value ends
    /// up register-resident.
    fn process_copy(&mut self, op: Opcode) -> Result<()> {
        let (slot, context, float) = match op {
            Opcode::CopyIntVar { slot, context } => (slot, context, false),
            Opcode::CopyFloatVar { slot, context } => (slot, context, true),
            _ => return Err(InternalError("expected a variable copy".to_string())),
        };
        let (base, offset, base_register) = if context == MemoryContext::Local {
            (Gpr::Rbp, self.frame.local_offset(slot), None)
        } else {
            let base_operand = self.pop()?;
            let base = self.materialize_int(base_operand)?;
            self.check_nil(base);
            (base, field_offset(slot), Some(base))
        };

        let value = self.pop()?;
        if float {
            let register = self.materialize_float(value)?;
            self.asm.movsd_xreg_mem(register, offset, base);
            self.push(Operand::FloatReg(register));
        } else {
            let register = self.materialize_int(value)?;
            self.asm.mov_reg_mem(register, offset, base);
            self.push(Operand::IntReg(register));
        }
        if let Some(register) = base_register {
            self.pool.release(register);
        }
        Ok(())
    }

    // ---- integer arithmetic ----

    fn process_int_calculation(&mut self, op: Opcode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;

        if let (Operand::IntImm(left_value), Operand::IntImm(right_value)) = (left, right) {
            if let Some(value) = fold_int(op, left_value, right_value) {
                self.push(Operand::IntImm(value));
                return Ok(());
            }
        }

        let destination = self.materialize_int(left)?;
        match right {
            Operand::IntImm(value) => {
                if let Ok(value) = i32::try_from(value) {
                    self.math_imm_reg(op, value, destination)?;
                } else {
                    let register = self.acquire_gpr()?;
                    self.asm.mov_imm_reg(value, register);
                    self.math_reg_reg(op, register, destination)?;
                    self.pool.release(register);
                }
            }
            Operand::IntReg(register) => {
                self.math_reg_reg(op, register, destination)?;
                self.pool.release(register);
            }
            Operand::IntMem(offset) => {
                self.math_mem_reg(op, offset, destination)?;
                self.release_temp(offset);
            }
            _ => return Err(InternalError("expected an integer operand".to_string())),
        }
        self.push(Operand::IntReg(destination));
        Ok(())
    }

    fn math_imm_reg(&mut self, op: Opcode, value: i32, destination: Gpr) -> Result<()> {
        match op {
            Opcode::AddInt => self.asm.add_imm_reg(value, destination),
            Opcode::SubInt => self.asm.sub_imm_reg(value, destination),
            Opcode::MulInt => self.asm.imul_imm_reg(value, destination),
            Opcode::DivInt | Opcode::ModInt => {
                let register = self.acquire_gpr()?;
                self.asm.mov_imm_reg(i64::from(value), register);
                self.integer_divide(register, destination, op == Opcode::ModInt)?;
                self.pool.release(register);
            }
            Opcode::AndInt | Opcode::BitAndInt => self.asm.and_imm_reg(value, destination),
            Opcode::OrInt | Opcode::BitOrInt => self.asm.or_imm_reg(value, destination),
            Opcode::BitXorInt => self.asm.xor_imm_reg(value, destination),
            Opcode::ShlInt(_) => self.asm.shl_imm_reg((value & 63) as u8, destination),
            Opcode::ShrInt(_) => self.asm.sar_imm_reg((value & 63) as u8, destination),
            _ => return Err(InternalError("unexpected arithmetic opcode".to_string())),
        }
        Ok(())
    }

    fn math_reg_reg(&mut self, op: Opcode, source: Gpr, destination: Gpr) -> Result<()> {
        match op {
            Opcode::AddInt => self.asm.add_reg_reg(source, destination),
            Opcode::SubInt => self.asm.sub_reg_reg(source, destination),
            Opcode::MulInt => self.asm.imul_reg_reg(source, destination),
            Opcode::DivInt | Opcode::ModInt => {
                self.integer_divide(source, destination, op == Opcode::ModInt)?;
            }
            Opcode::AndInt | Opcode::BitAndInt => self.asm.and_reg_reg(source, destination),
            Opcode::OrInt | Opcode::BitOrInt => self.asm.or_reg_reg(source, destination),
            Opcode::BitXorInt => self.asm.xor_reg_reg(source, destination),
            Opcode::ShlInt(_) => self.shift_by_register(source, destination, true)?,
            Opcode::ShrInt(_) => self.shift_by_register(source, destination, false)?,
            _ => return Err(InternalError("unexpected arithmetic opcode".to_string())),
        }
        Ok(())
    }

    fn math_mem_reg(&mut self, op: Opcode, offset: i32, destination: Gpr) -> Result<()> {
        match op {
            Opcode::AddInt => self.asm.add_mem_reg(offset, Gpr::Rbp, destination),
            Opcode::SubInt => self.asm.sub_mem_reg(offset, Gpr::Rbp, destination),
            Opcode::MulInt => self.asm.imul_mem_reg(offset, Gpr::Rbp, destination),
            Opcode::AndInt | Opcode::BitAndInt => {
                self.asm.and_mem_reg(offset, Gpr::Rbp, destination);
            }
            Opcode::OrInt | Opcode::BitOrInt => self.asm.or_mem_reg(offset, Gpr::Rbp, destination),
            Opcode::BitXorInt => self.asm.xor_mem_reg(offset, Gpr::Rbp, destination),
            Opcode::DivInt | Opcode::ModInt | Opcode::ShlInt(_) | Opcode::ShrInt(_) => {
                let register = self.acquire_gpr()?;
                self.asm.mov_mem_reg(offset, Gpr::Rbp, register);
                self.math_reg_reg(op, register, destination)?;
                self.pool.release(register);
            }
            _ => return Err(InternalError("unexpected arithmetic opcode".to_string())),
        }
        Ok(())
    }

    /// The `cqo; idiv` sequence with RAX/RDX preserved in red-zone slots. `destination` receives
    /// the quotient (or the remainder for modulo).
    fn integer_divide(&mut self, divisor: Gpr, destination: Gpr, is_mod: bool) -> Result<()> {
        let rax_slot = self.temps.acquire_gpr().ok_or(SpillAreaExhausted)?;
        let rdx_slot = self.temps.acquire_gpr().ok_or(SpillAreaExhausted)?;
        let rax_offset = self.frame.temp_gpr(rax_slot);
        let rdx_offset = self.frame.temp_gpr(rdx_slot);
        self.asm.mov_reg_mem(Gpr::Rax, rax_offset, Gpr::Rbp);
        self.asm.mov_reg_mem(Gpr::Rdx, rdx_offset, Gpr::Rbp);

        self.asm.mov_reg_reg(destination, Gpr::Rax);
        self.asm.cqo();
        if divisor == Gpr::Rdx {
            // the live divisor was saved before CQO clobbered RDX
            self.asm.idiv_mem(rdx_offset, Gpr::Rbp);
        } else {
            self.asm.idiv_reg(divisor);
        }
        let result = if is_mod { Gpr::Rdx } else { Gpr::Rax };
        self.asm.mov_reg_reg(result, destination);

        if destination != Gpr::Rax {
            self.asm.mov_mem_reg(rax_offset, Gpr::Rbp, Gpr::Rax);
        }
        if destination != Gpr::Rdx {
            self.asm.mov_mem_reg(rdx_offset, Gpr::Rbp, Gpr::Rdx);
        }
        self.temps.release_gpr(rax_slot);
        self.temps.release_gpr(rdx_slot);
        Ok(())
    }

    /// Variable shift; the hardware takes the count in CL.
    fn shift_by_register(&mut self, count: Gpr, destination: Gpr, left: bool) -> Result<()> {
        let (work, moved) = if destination == Gpr::Rcx {
            let register = self.acquire_gpr()?;
            self.asm.mov_reg_reg(destination, register);
            (register, true)
        } else {
            (destination, false)
        };

        let saved_rcx = if count == Gpr::Rcx {
            None
        } else {
            let slot = self.temps.acquire_gpr().ok_or(SpillAreaExhausted)?;
            let offset = self.frame.temp_gpr(slot);
            self.asm.mov_reg_mem(Gpr::Rcx, offset, Gpr::Rbp);
            self.asm.mov_reg_reg(count, Gpr::Rcx);
            Some((slot, offset))
        };

        if left {
            self.asm.shl_cl_reg(work);
        } else {
            self.asm.sar_cl_reg(work);
        }

        if let Some((slot, offset)) = saved_rcx {
            self.asm.mov_mem_reg(offset, Gpr::Rbp, Gpr::Rcx);
            self.temps.release_gpr(slot);
        }
        if moved {
            self.asm.mov_reg_reg(work, destination);
            self.pool.release(work);
        }
        Ok(())
    }

    // ---- comparisons ----

    fn process_int_compare(&mut self, op: Opcode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;

        if let (Operand::IntImm(left_value), Operand::IntImm(right_value)) = (left, right) {
            if let Some(value) = fold_int(op, left_value, right_value) {
                self.push(Operand::IntImm(value));
                return Ok(());
            }
        }

        let destination = self.materialize_int(left)?;
        match right {
            Operand::IntImm(value) => {
                if let Ok(value) = i32::try_from(value) {
                    self.asm.cmp_imm_reg(value, destination);
                } else {
                    let register = self.acquire_gpr()?;
                    self.asm.mov_imm_reg(value, register);
                    self.asm.cmp_reg_reg(register, destination);
                    self.pool.release(register);
                }
            }
            Operand::IntReg(register) => {
                self.asm.cmp_reg_reg(register, destination);
                self.pool.release(register);
            }
            Operand::IntMem(offset) => {
                self.asm.cmp_mem_reg(offset, Gpr::Rbp, destination);
                self.release_temp(offset);
            }
            _ => return Err(InternalError("expected an integer operand".to_string())),
        }

        let condition = int_condition(op)?;
        if self.try_fuse(condition) {
            self.pool.release(destination);
        } else {
            self.emit_boolean(destination, condition)?;
            self.push(Operand::IntReg(destination));
        }
        Ok(())
    }

    /// Peeks the next instruction; a conditional jump fuses with the flags the compare just set.
    fn try_fuse(&mut self, condition: Condition) -> bool {
        let Some(next) = self.instructions.get(self.index) else {
            return false;
        };
        let Opcode::Jmp {
            label,
            condition: jump_condition,
        } = next.op
        else {
            return false;
        };
        if jump_condition < 0 {
            return false;
        }
        let condition = if jump_condition == 0 {
            condition.negate()
        } else {
            condition
        };
        let fixup = self.asm.jcc_rel32(condition);
        self.jump_fixups.push((fixup, label));
        self.skip_jump = true;
        true
    }

    /// Materializes the flags into a canonical 0/1 value via `cmov`.
    fn emit_boolean(&mut self, destination: Gpr, condition: Condition) -> Result<()> {
        self.asm.mov_imm_reg(0, destination);
        let one = self.acquire_gpr()?;
        self.asm.mov_imm_reg(1, one);
        self.asm.cmov_reg_reg(condition, one, destination);
        self.pool.release(one);
        Ok(())
    }

    // ---- float arithmetic ----

    fn process_float_calculation(&mut self, op: Opcode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let destination = self.materialize_float(left)?;
        match right {
            Operand::FloatMem(offset) | Operand::IntMem(offset) => {
                match op {
                    Opcode::AddFloat => self.asm.addsd_mem_xreg(offset, Gpr::Rbp, destination),
                    Opcode::SubFloat => self.asm.subsd_mem_xreg(offset, Gpr::Rbp, destination),
                    Opcode::MulFloat => self.asm.mulsd_mem_xreg(offset, Gpr::Rbp, destination),
                    Opcode::DivFloat => self.asm.divsd_mem_xreg(offset, Gpr::Rbp, destination),
                    _ => return Err(InternalError("unexpected float opcode".to_string())),
                }
                self.release_temp(offset);
            }
            _ => {
                let register = self.materialize_float(right)?;
                match op {
                    Opcode::AddFloat => self.asm.addsd_xreg_xreg(register, destination),
                    Opcode::SubFloat => self.asm.subsd_xreg_xreg(register, destination),
                    Opcode::MulFloat => self.asm.mulsd_xreg_xreg(register, destination),
                    Opcode::DivFloat => self.asm.divsd_xreg_xreg(register, destination),
                    _ => return Err(InternalError("unexpected float opcode".to_string())),
                }
                self.pool.release_xmm(register);
            }
        }
        self.push(Operand::FloatReg(destination));
        Ok(())
    }

    fn process_float_compare(&mut self, op: Opcode) -> Result<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let left_register = self.materialize_float(left)?;
        match right {
            Operand::FloatMem(offset) | Operand::IntMem(offset) => {
                self.asm.ucomisd_mem_xreg(offset, Gpr::Rbp, left_register);
                self.release_temp(offset);
            }
            _ => {
                let register = self.materialize_float(right)?;
                self.asm.ucomisd_xreg_xreg(register, left_register);
                self.pool.release_xmm(register);
            }
        }
        self.pool.release_xmm(left_register);

        let condition = float_condition(op)?;
        if !self.try_fuse(condition) {
            let destination = self.acquire_gpr()?;
            self.emit_boolean(destination, condition)?;
            self.push(Operand::IntReg(destination));
        }
        Ok(())
    }

    fn process_round(&mut self, mode: Rounding) -> Result<()> {
        let value = self.pop()?;
        match value {
            Operand::FloatReg(register) => {
                self.asm.roundsd_xreg_xreg(mode, register, register);
                self.push(Operand::FloatReg(register));
            }
            Operand::FloatMem(offset) | Operand::IntMem(offset) => {
                let register = self.acquire_xmm()?;
                self.asm.roundsd_mem_xreg(mode, offset, Gpr::Rbp, register);
                self.release_temp(offset);
                self.push(Operand::FloatReg(register));
            }
            Operand::FloatImm(_) => {
                let register = self.materialize_float(value)?;
                self.asm.roundsd_xreg_xreg(mode, register, register);
                self.push(Operand::FloatReg(register));
            }
            _ => return Err(InternalError("expected a float operand".to_string())),
        }
        Ok(())
    }

    fn process_float_to_int(&mut self) -> Result<()> {
        let value = self.pop()?;
        let destination = self.acquire_gpr()?;
        match value {
            Operand::FloatReg(register) => {
                self.asm.cvttsd2si_xreg_reg(register, destination);
                self.pool.release_xmm(register);
            }
            Operand::FloatMem(offset) | Operand::IntMem(offset) => {
                self.asm.cvttsd2si_mem_reg(offset, Gpr::Rbp, destination);
                self.release_temp(offset);
            }
            Operand::FloatImm(_) => {
                let register = self.materialize_float(value)?;
                self.asm.cvttsd2si_xreg_reg(register, destination);
                self.pool.release_xmm(register);
            }
            _ => return Err(InternalError("expected a float operand".to_string())),
        }
        self.push(Operand::IntReg(destination));
        Ok(())
    }

    fn process_int_to_float(&mut self) -> Result<()> {
        let value = self.pop()?;
        let destination = self.acquire_xmm()?;
        match value {
            Operand::IntReg(register) => {
                self.asm.cvtsi2sd_reg_xreg(register, destination);
                self.pool.release(register);
            }
            Operand::IntMem(offset) => {
                self.asm.cvtsi2sd_mem_xreg(offset, Gpr::Rbp, destination);
                self.release_temp(offset);
            }
            Operand::IntImm(immediate) => {
                let register = self.acquire_gpr()?;
                self.asm.mov_imm_reg(immediate, register);
                self.asm.cvtsi2sd_reg_xreg(register, destination);
                self.pool.release(register);
            }
            _ => return Err(InternalError("expected an integer operand".to_string())),
        }
        self.push(Operand::FloatReg(destination));
        Ok(())
    }

    // ---- control flow ----

    fn process_jump(&mut self, label: u32, condition: i32) -> Result<()> {
        if self.skip_jump {
            // the preceding compare already branched on these flags
            self.skip_jump = false;
            return Ok(());
        }
        if condition < 0 {
            let fixup = self.asm.jmp_rel32();
            self.jump_fixups.push((fixup, label));
            return Ok(());
        }
        let operand = self.pop()?;
        let register = self.materialize_int(operand)?;
        self.asm.cmp_imm_reg(condition, register);
        self.pool.release(register);
        let fixup = self.asm.jcc_rel32(Condition::Equal);
        self.jump_fixups.push((fixup, label));
        Ok(())
    }

    // ---- array elements ----

    /// Pops the array reference and index and leaves the element address in the returned
    /// register. Emits the null and bounds checks.
    fn array_element_address(&mut self, dimensions: u32, scale_log2: u8) -> Result<Gpr> {
        if dimensions != 1 {
            return Err(UnsupportedArrayDimensions(dimensions));
        }
        let array_operand = self.pop()?;
        let index_operand = self.pop()?;
        let array = self.materialize_int(array_operand)?;
        self.check_nil(array);
        let index = self.materialize_int(index_operand)?;
        // an unsigned compare against the element count also rejects negative indices
        self.asm.cmp_mem_reg(ARRAY_SIZE_OFFSET, array, index);
        let fixup = self.asm.jcc_rel32(Condition::AboveEqual);
        self.bounds_fixups.push(fixup);
        if scale_log2 > 0 {
            self.asm.shl_imm_reg(scale_log2, index);
        }
        self.asm.add_imm_reg(ARRAY_DATA_OFFSET, array);
        self.asm.add_reg_reg(index, array);
        self.pool.release(index);
        Ok(array)
    }

    fn process_load_element(&mut self, dimensions: u32, kind: ElementKind) -> Result<()> {
        let address = self.array_element_address(dimensions, kind.scale_log2())?;
        match kind {
            ElementKind::Byte => {
                self.asm.mov_mem8_reg(0, address, address);
                self.push(Operand::IntReg(address));
            }
            ElementKind::Char => {
                self.asm.mov_mem32_reg(0, address, address);
                self.push(Operand::IntReg(address));
            }
            ElementKind::Int => {
                self.asm.mov_mem_reg(0, address, address);
                self.push(Operand::IntReg(address));
            }
            ElementKind::Float => {
                let destination = self.acquire_xmm()?;
                self.asm.movsd_mem_xreg(0, address, destination);
                self.pool.release(address);
                self.push(Operand::FloatReg(destination));
            }
        }
        Ok(())
    }

    fn process_store_element(&mut self, dimensions: u32, kind: ElementKind) -> Result<()> {
        let address = self.array_element_address(dimensions, kind.scale_log2())?;
        let value = self.pop()?;
        match kind {
            ElementKind::Byte => match value {
                Operand::IntImm(immediate) => {
                    self.asm.mov_imm_mem8(immediate as u8, 0, address);
                }
                Operand::IntReg(register) => {
                    if register.is_byte_addressable() {
                        self.asm.mov_reg_mem8(register, 0, address);
                    } else {
                        let scratch = self.acquire_byte_gpr()?;
                        self.asm.mov_reg_reg(register, scratch);
                        self.asm.mov_reg_mem8(scratch, 0, address);
                        self.pool.release(scratch);
                    }
                    self.pool.release(register);
                }
                Operand::IntMem(offset) => {
                    let scratch = self.acquire_byte_gpr()?;
                    self.asm.mov_mem_reg(offset, Gpr::Rbp, scratch);
                    self.asm.mov_reg_mem8(scratch, 0, address);
                    self.pool.release(scratch);
                    self.release_temp(offset);
                }
                _ => return Err(InternalError("expected an integer operand".to_string())),
            },
            ElementKind::Char => match value {
                Operand::IntImm(immediate) => {
                    self.asm.mov_imm_mem32(immediate as i32, 0, address);
                }
                Operand::IntReg(register) => {
                    self.asm.mov_reg_mem32(register, 0, address);
                    self.pool.release(register);
                }
                Operand::IntMem(offset) => {
                    let scratch = self.acquire_gpr()?;
                    self.asm.mov_mem_reg(offset, Gpr::Rbp, scratch);
                    self.asm.mov_reg_mem32(scratch, 0, address);
                    self.pool.release(scratch);
                    self.release_temp(offset);
                }
                _ => return Err(InternalError("expected an integer operand".to_string())),
            },
            ElementKind::Int => self.store_int(value, 0, address)?,
            ElementKind::Float => {
                let register = self.materialize_float(value)?;
                self.asm.movsd_xreg_mem(register, 0, address);
                self.pool.release_xmm(register);
            }
        }
        self.pool.release(address);
        Ok(())
    }

    // ---- return and the callback bridge ----

    /// Flushes working-stack entries to the runtime operand stack. With `Some(parameters)` only
    /// the top `parameters` entries are flushed and popped; with `None` everything is.
    fn process_return(&mut self, parameters: Option<usize>) -> Result<()> {
        if self.working.is_empty() {
            return Ok(());
        }
        let flush_count = parameters.unwrap_or(self.working.len());
        let skipped = self.working.len() - flush_count;

        let stack = self.acquire_gpr()?;
        self.asm.mov_mem_reg(OP_STACK, Gpr::Rbp, stack);
        let position = self.acquire_gpr()?;
        self.asm.mov_mem_reg(STACK_POS, Gpr::Rbp, position);
        self.asm.mov_mem_reg(0, position, position);
        self.asm.shl_imm_reg(3, position);
        self.asm.add_reg_reg(position, stack);

        // bottom to top, skipping the entries that stay symbolic
        let entries: Vec<Operand> = self.working.iter().rev().copied().collect();
        for entry in entries.into_iter().skip(skipped) {
            self.asm.mov_mem_reg(STACK_POS, Gpr::Rbp, position);
            match entry {
                Operand::IntImm(immediate) => {
                    if let Ok(immediate) = i32::try_from(immediate) {
                        self.asm.mov_imm_mem(immediate, 0, stack);
                    } else {
                        let scratch = self.acquire_gpr()?;
                        self.asm.mov_imm_reg(immediate, scratch);
                        self.asm.mov_reg_mem(scratch, 0, stack);
                        self.pool.release(scratch);
                    }
                }
                Operand::IntMem(offset) => {
                    let scratch = self.acquire_gpr()?;
                    self.asm.mov_mem_reg(offset, Gpr::Rbp, scratch);
                    self.asm.mov_reg_mem(scratch, 0, stack);
                    self.pool.release(scratch);
                }
                Operand::IntReg(register) => {
                    self.asm.mov_reg_mem(register, 0, stack);
                }
                Operand::FloatImm(value) => {
                    let scratch = self.acquire_gpr()?;
                    self.asm.mov_imm_reg(value.to_bits() as i64, scratch);
                    self.asm.mov_reg_mem(scratch, 0, stack);
                    self.pool.release(scratch);
                }
                Operand::FloatMem(offset) => {
                    let scratch = self.acquire_xmm()?;
                    self.asm.movsd_mem_xreg(offset, Gpr::Rbp, scratch);
                    self.asm.movsd_xreg_mem(scratch, 0, stack);
                    self.pool.release_xmm(scratch);
                }
                Operand::FloatReg(register) => {
                    self.asm.movsd_xreg_mem(register, 0, stack);
                }
            }
            self.asm.inc_mem(0, position);
            self.asm.add_imm_reg(WORD_SIZE as i32, stack);
        }
        self.pool.release(stack);
        self.pool.release(position);

        for _ in 0..flush_count {
            let operand = self.pop()?;
            self.release_operand(operand);
        }
        Ok(())
    }

    /// The uniform save/flush/call/restore sequence for every runtime service.
    fn process_stack_callback(&mut self, op: Opcode, parameters: usize) -> Result<()> {
        if self.working.len() < parameters {
            return Err(OperandStackUnderflow);
        }
        let non_parameters = self.working.len() - parameters;

        // preserve register-resident non-parameter entries across the call
        let mut saved_general: Vec<(Gpr, usize)> = Vec::new();
        let mut saved_simd: Vec<(Xmm, usize)> = Vec::new();
        for position in 0..non_parameters {
            let index = self.working.len() - 1 - position;
            match self.working[index] {
                Operand::IntReg(register) => {
                    let slot = self.temps.acquire_gpr().ok_or(SpillAreaExhausted)?;
                    self.asm
                        .mov_reg_mem(register, self.frame.temp_gpr(slot), Gpr::Rbp);
                    saved_general.push((register, slot));
                }
                Operand::FloatReg(register) => {
                    let slot = self.temps.acquire_xmm().ok_or(SpillAreaExhausted)?;
                    self.asm
                        .movsd_xreg_mem(register, self.frame.temp_xmm(slot), Gpr::Rbp);
                    saved_simd.push((register, slot));
                }
                _ => {}
            }
        }

        self.process_return(Some(parameters))?;

        self.asm.push_reg(Gpr::R15);
        self.asm.push_reg(Gpr::R14);
        self.asm.push_reg(Gpr::R13);
        self.asm.push_reg(Gpr::R8);

        let instruction_index = self.index - 1;
        let instruction_pointer =
            std::ptr::from_ref(&self.instructions[instruction_index]) as i64;
        self.asm.mov_mem_reg(OP_STACK, Gpr::Rbp, Gpr::R9);
        self.asm.mov_mem_reg(INSTANCE_MEM, Gpr::Rbp, Gpr::R8);
        self.asm.mov_mem_reg(MTHD_ID, Gpr::Rbp, Gpr::Rcx);
        self.asm.mov_mem_reg(CLS_ID, Gpr::Rbp, Gpr::Rdx);
        self.asm.mov_imm_reg(instruction_pointer, Gpr::Rsi);
        self.asm.mov_imm_reg(i64::from(op.code()), Gpr::Rdi);
        self.asm.push_imm32(i32::try_from(instruction_index)?);
        self.asm.push_mem(STACK_POS, Gpr::Rbp);

        self.asm
            .mov_imm_reg(self.hooks.stack_callback as usize as i64, Gpr::Rax);
        self.asm.call_reg(Gpr::Rax);
        self.asm.add_imm_reg(16, Gpr::Rsp);

        self.asm.pop_reg(Gpr::R8);
        self.asm.pop_reg(Gpr::R13);
        self.asm.pop_reg(Gpr::R14);
        self.asm.pop_reg(Gpr::R15);

        for (register, slot) in saved_general {
            self.asm
                .mov_mem_reg(self.frame.temp_gpr(slot), Gpr::Rbp, register);
            self.temps.release_gpr(slot);
        }
        for (register, slot) in saved_simd {
            self.asm
                .movsd_mem_xreg(self.frame.temp_xmm(slot), Gpr::Rbp, register);
            self.temps.release_xmm(slot);
        }
        Ok(())
    }

    /// Pulls a runtime service's result back off the operand stack into the working stack.
    fn load_stack_return(&mut self, return_type: ReturnType) -> Result<()> {
        match return_type {
            ReturnType::None => Ok(()),
            ReturnType::Int => self.load_stack_int(),
            ReturnType::Float => self.load_stack_float(),
            ReturnType::FuncRef => self.load_stack_func(),
        }
    }

    // ---- finalization ----

    /// Emits the trap stubs and resolves every recorded fixup.
    fn finish(mut self) -> Result<(Vec<u8>, Vec<Instruction>)> {
        let nil_target = if self.nil_fixups.is_empty() {
            None
        } else {
            Some(self.emit_trap_stub(self.hooks.nil_dereference as usize as i64))
        };
        let bounds_target = if self.bounds_fixups.is_empty() {
            None
        } else {
            Some(self.emit_trap_stub(self.hooks.index_out_of_bounds as usize as i64))
        };

        for (fixup, label) in &self.jump_fixups {
            let target = *self
                .labels
                .get(label)
                .ok_or(UnresolvedLabel(*label))?;
            self.asm
                .patch_rel32(*fixup, target)
                .ok_or(JumpDisplacementOutOfRange(*label))?;
        }
        if let Some(target) = nil_target {
            for fixup in &self.nil_fixups {
                self.asm
                    .patch_rel32(*fixup, target)
                    .ok_or_else(|| InternalError("trap stub out of range".to_string()))?;
            }
        }
        if let Some(target) = bounds_target {
            for fixup in &self.bounds_fixups {
                self.asm
                    .patch_rel32(*fixup, target)
                    .ok_or_else(|| InternalError("trap stub out of range".to_string()))?;
            }
        }
        Ok((self.asm.into_code(), self.instructions))
    }

    /// A per-method stub that raises a runtime trap and exits with a failure status.
    fn emit_trap_stub(&mut self, hook: i64) -> usize {
        let target = self.asm.position();
        self.asm.mov_mem_reg(CLS_ID, Gpr::Rbp, Gpr::Rdi);
        self.asm.mov_mem_reg(MTHD_ID, Gpr::Rbp, Gpr::Rsi);
        self.asm.mov_imm_reg(hook, Gpr::Rax);
        self.asm.call_reg(Gpr::Rax);
        self.epilog(1);
        target
    }
}

/// Array element widths as shift amounts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ElementKind {
    Byte,
    Char,
    Int,
    Float,
}

impl ElementKind {
    fn scale_log2(self) -> u8 {
        match self {
            ElementKind::Byte => 0,
            ElementKind::Char => 2,
            ElementKind::Int | ElementKind::Float => 3,
        }
    }
}

/// Byte offset of an instance or class variable slot.
fn field_offset(slot: u32) -> i32 {
    (slot as i32) * WORD_SIZE as i32
}

fn int_condition(op: Opcode) -> Result<Condition> {
    let condition = match op {
        Opcode::EqlInt => Condition::Equal,
        Opcode::NeqlInt => Condition::NotEqual,
        Opcode::LesInt => Condition::Less,
        Opcode::GtrInt => Condition::Greater,
        Opcode::LesEqlInt => Condition::LessEqual,
        Opcode::GtrEqlInt => Condition::GreaterEqual,
        _ => return Err(InternalError("expected an integer compare".to_string())),
    };
    Ok(condition)
}

fn float_condition(op: Opcode) -> Result<Condition> {
    let condition = match op {
        Opcode::EqlFloat => Condition::Equal,
        Opcode::NeqlFloat => Condition::NotEqual,
        Opcode::LesFloat => Condition::Below,
        Opcode::GtrFloat => Condition::Above,
        Opcode::LesEqlFloat => Condition::BelowEqual,
        Opcode::GtrEqlFloat => Condition::AboveEqual,
        _ => return Err(InternalError("expected a float compare".to_string())),
    };
    Ok(condition)
}

/// Compile-time folding of integer operations on two immediates. Division and modulo by zero are
/// left for the hardware trap.
fn fold_int(op: Opcode, left: i64, right: i64) -> Option<i64> {
    let value = match op {
        Opcode::AndInt => i64::from(left != 0 && right != 0),
        Opcode::OrInt => i64::from(left != 0 || right != 0),
        Opcode::AddInt => left.wrapping_add(right),
        Opcode::SubInt => left.wrapping_sub(right),
        Opcode::MulInt => left.wrapping_mul(right),
        Opcode::DivInt | Opcode::ModInt if right == 0 => return None,
        Opcode::DivInt => left.wrapping_div(right),
        Opcode::ModInt => left.wrapping_rem(right),
        Opcode::BitAndInt => left & right,
        Opcode::BitOrInt => left | right,
        Opcode::BitXorInt => left ^ right,
        Opcode::ShlInt(_) => left.wrapping_shl(right as u32 & 63),
        Opcode::ShrInt(_) => left.wrapping_shr(right as u32 & 63),
        Opcode::EqlInt => i64::from(left == right),
        Opcode::NeqlInt => i64::from(left != right),
        Opcode::LesInt => i64::from(left < right),
        Opcode::GtrInt => i64::from(left > right),
        Opcode::LesEqlInt => i64::from(left <= right),
        Opcode::GtrEqlInt => i64::from(left >= right),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
#[cfg(all(unix, target_arch = "x86_64"))]
mod test {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicI64, Ordering};
    use veloce_bytecode::{Block, Class, Declaration, DeclarationType};

    static NIL_TRAPS: AtomicI64 = AtomicI64::new(0);
    static BOUNDS_TRAPS: AtomicI64 = AtomicI64::new(0);
    static CALLBACK_OP: AtomicI64 = AtomicI64::new(-1);
    static CALLBACK_VALUE: AtomicI64 = AtomicI64::new(0);
    static ROOTS: AtomicI64 = AtomicI64::new(0);

    extern "C" fn nil_trap(_class_id: i64, _method_id: i64) {
        NIL_TRAPS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn bounds_trap(_class_id: i64, _method_id: i64) {
        BOUNDS_TRAPS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn add_root(
        _class_id: i64,
        _method_id: i64,
        _instance: *mut i64,
        _locals: *mut i64,
        _size: i64,
    ) {
        ROOTS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn remove_root(_locals: *mut i64) {
        ROOTS.fetch_sub(1, Ordering::SeqCst);
    }

    /// Records the opcode and the top operand, then consumes one stack entry.
    extern "C" fn stack_callback(
        op_code: i64,
        _instruction: *const Instruction,
        _class_id: i64,
        _method_id: i64,
        _instance: *mut i64,
        op_stack: *mut i64,
        stack_pos: *mut i64,
        _instruction_index: i64,
    ) {
        CALLBACK_OP.store(op_code, Ordering::SeqCst);
        unsafe {
            let position = *stack_pos;
            if position > 0 {
                CALLBACK_VALUE.store(*op_stack.add(position as usize - 1), Ordering::SeqCst);
                *stack_pos = position - 1;
            }
        }
    }

    fn hooks() -> RuntimeHooks {
        RuntimeHooks {
            stack_callback,
            add_method_root: add_root,
            remove_method_root: remove_root,
            nil_dereference: nil_trap,
            index_out_of_bounds: bounds_trap,
        }
    }

    fn program_with_method(param_count: u32, local_frame_size: u32, ops: Vec<Opcode>) -> Program {
        let method = veloce_bytecode::Method {
            id: 0,
            name: "subject".to_string(),
            is_virtual: false,
            has_and_or: false,
            is_native: false,
            declarations: vec![Declaration::new("", DeclarationType::Int)],
            param_count,
            local_frame_size,
            return_type: ReturnType::Int,
            blocks: vec![Block::new(
                ops.into_iter().map(Instruction::new).collect(),
            )],
            class_id: 0,
        };
        let class = Class {
            id: 0,
            name: "Subject".to_string(),
            parent_id: -1,
            interface_ids: vec![],
            is_virtual: false,
            is_debug: false,
            file_name: String::new(),
            class_frame_size: 0,
            instance_frame_size: 16,
            class_declarations: vec![],
            instance_declarations: vec![],
            methods: vec![method],
        };
        Program {
            classes: vec![class],
            float_strings: vec![],
            int_strings: vec![],
            char_strings: vec![],
            string_class_id: 0,
            start_class_id: 0,
            start_method_id: 0,
            init_method: veloce_bytecode::Method {
                id: u32::MAX,
                name: "$Initialization$".to_string(),
                is_virtual: false,
                has_and_or: false,
                is_native: false,
                declarations: vec![],
                param_count: 0,
                local_frame_size: 8,
                return_type: ReturnType::None,
                blocks: vec![Block::new(vec![Instruction::new(Opcode::Rtrn)])],
                class_id: u32::MAX,
            },
            is_web: false,
        }
    }

    /// Compiles the method and runs it with the given values pre-pushed on the operand stack.
    fn run(
        param_count: u32,
        frame: u32,
        ops: Vec<Opcode>,
        arguments: &[i64],
        instance: *mut i64,
    ) -> Result<(i64, Vec<i64>, i64)> {
        let program = program_with_method(param_count, frame, ops);
        let compiled = Compiler::new(hooks()).compile(&program, 0, 0)?;
        assert!(compiled.code_size() > 0);

        let mut op_stack = vec![0i64; 64];
        op_stack[..arguments.len()].copy_from_slice(arguments);
        let mut stack_pos = arguments.len() as i64;
        let mut class_memory = [0i64; 8];
        let status = unsafe {
            compiled.execute(
                class_memory.as_mut_ptr(),
                instance,
                op_stack.as_mut_ptr(),
                &mut stack_pos,
            )
        };
        Ok((status, op_stack, stack_pos))
    }

    fn stor(slot: u32) -> Opcode {
        Opcode::StorIntVar {
            slot,
            context: MemoryContext::Local,
        }
    }

    fn load(slot: u32) -> Opcode {
        Opcode::LoadIntVar {
            slot,
            context: MemoryContext::Local,
        }
    }

    #[test]
    fn test_constant_return() -> Result<()> {
        let (status, stack, position) =
            run(0, 16, vec![Opcode::LoadIntLit(7), Opcode::Rtrn], &[], std::ptr::null_mut())?;
        assert_eq!(0, status);
        assert_eq!(1, position);
        assert_eq!(7, stack[0]);
        Ok(())
    }

    #[test]
    fn test_parameter_add() -> Result<()> {
        let ops = vec![
            stor(0),
            stor(1),
            load(0),
            load(1),
            Opcode::AddInt,
            Opcode::Rtrn,
        ];
        let (status, stack, position) = run(2, 16, ops, &[2, 3], std::ptr::null_mut())?;
        assert_eq!(0, status);
        assert_eq!(1, position);
        assert_eq!(5, stack[0]);
        Ok(())
    }

    #[test]
    fn test_subtract_operand_order() -> Result<()> {
        // caller pushes 10 then 3; binding pops 3 into slot 0 and 10 into slot 1
        let ops = vec![
            stor(0),
            stor(1),
            load(1),
            load(0),
            Opcode::SubInt,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(2, 16, ops, &[10, 3], std::ptr::null_mut())?;
        assert_eq!(7, stack[0]);
        Ok(())
    }

    #[test]
    fn test_immediate_folding() -> Result<()> {
        let ops = vec![
            Opcode::LoadIntLit(6),
            Opcode::LoadIntLit(7),
            Opcode::MulInt,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(42, stack[0]);
        Ok(())
    }

    #[test]
    fn test_division_and_modulo() -> Result<()> {
        let ops = vec![
            stor(0),
            stor(1),
            load(1),
            load(0),
            Opcode::DivInt,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(2, 16, ops, &[20, 5], std::ptr::null_mut())?;
        assert_eq!(4, stack[0]);

        let ops = vec![
            stor(0),
            stor(1),
            load(1),
            load(0),
            Opcode::ModInt,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(2, 16, ops, &[17, 5], std::ptr::null_mut())?;
        assert_eq!(2, stack[0]);
        Ok(())
    }

    #[test]
    fn test_shift_with_stack_count() -> Result<()> {
        let ops = vec![
            stor(0),
            load(0),
            Opcode::LoadIntLit(2),
            Opcode::ShlInt(2),
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(1, 16, ops, &[5], std::ptr::null_mut())?;
        assert_eq!(20, stack[0]);

        let ops = vec![
            stor(0),
            load(0),
            Opcode::LoadIntLit(1),
            Opcode::ShrInt(1),
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(1, 16, ops, &[-8], std::ptr::null_mut())?;
        assert_eq!(-4, stack[0], "shift right is arithmetic");
        Ok(())
    }

    #[test]
    fn test_fused_compare_and_jump() -> Result<()> {
        // returns the larger of the two parameters
        let ops = vec![
            stor(0),
            stor(1),
            load(1),
            load(0),
            Opcode::LesInt,
            Opcode::Jmp {
                label: 1,
                condition: 1,
            },
            load(1),
            Opcode::Rtrn,
            Opcode::Lbl { id: 1 },
            load(0),
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(2, 16, ops.clone(), &[10, 3], std::ptr::null_mut())?;
        assert_eq!(10, stack[0]);
        let (_, stack, _) = run(2, 16, ops, &[2, 9], std::ptr::null_mut())?;
        assert_eq!(9, stack[0]);
        Ok(())
    }

    #[test]
    fn test_unfused_compare_materializes_boolean() -> Result<()> {
        let ops = vec![
            stor(0),
            load(0),
            Opcode::LoadIntLit(3),
            Opcode::GtrInt,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(1, 16, ops.clone(), &[7], std::ptr::null_mut())?;
        assert_eq!(1, stack[0]);
        let (_, stack, _) = run(1, 16, ops, &[2], std::ptr::null_mut())?;
        assert_eq!(0, stack[0]);
        Ok(())
    }

    #[test]
    fn test_unconditional_jump() -> Result<()> {
        let ops = vec![
            Opcode::Jmp {
                label: 3,
                condition: veloce_bytecode::JUMP_UNCONDITIONAL,
            },
            Opcode::Lbl { id: 3 },
            Opcode::LoadIntLit(6),
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(6, stack[0]);
        Ok(())
    }

    #[test]
    fn test_conditional_jump_on_value() -> Result<()> {
        // jump taken when the popped value equals the jump condition
        let ops = vec![
            stor(0),
            load(0),
            Opcode::Jmp {
                label: 2,
                condition: 0,
            },
            Opcode::LoadIntLit(100),
            Opcode::Rtrn,
            Opcode::Lbl { id: 2 },
            Opcode::LoadIntLit(200),
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(1, 16, ops.clone(), &[0], std::ptr::null_mut())?;
        assert_eq!(200, stack[0]);
        let (_, stack, _) = run(1, 16, ops, &[1], std::ptr::null_mut())?;
        assert_eq!(100, stack[0]);
        Ok(())
    }

    #[test]
    fn test_swap_and_pop() -> Result<()> {
        let ops = vec![
            Opcode::LoadIntLit(1),
            Opcode::LoadIntLit(2),
            Opcode::SwapInt,
            Opcode::PopInt,
            Opcode::Rtrn,
        ];
        let (_, stack, position) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(1, position);
        assert_eq!(2, stack[0]);
        Ok(())
    }

    #[test]
    fn test_copy_variable() -> Result<()> {
        let ops = vec![
            Opcode::LoadIntLit(11),
            Opcode::CopyIntVar {
                slot: 1,
                context: MemoryContext::Local,
            },
            Opcode::PopInt,
            load(1),
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(11, stack[0]);
        Ok(())
    }

    #[test]
    fn test_float_arithmetic() -> Result<()> {
        let float_stor = |slot| Opcode::StorFloatVar {
            slot,
            context: MemoryContext::Local,
        };
        let float_load = |slot| Opcode::LoadFloatVar {
            slot,
            context: MemoryContext::Local,
        };
        let ops = vec![
            float_stor(0),
            float_stor(1),
            float_load(1),
            float_load(0),
            Opcode::AddFloat,
            Opcode::Rtrn,
        ];
        let arguments = [1.5f64.to_bits() as i64, 2.25f64.to_bits() as i64];
        let (_, stack, position) = run(2, 16, ops, &arguments, std::ptr::null_mut())?;
        assert_eq!(1, position);
        assert_eq!(3.75, f64::from_bits(stack[0] as u64));
        Ok(())
    }

    #[test]
    fn test_float_literal_and_conversions() -> Result<()> {
        let ops = vec![
            Opcode::LoadFloatLit(3.75),
            Opcode::F2i,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(3, stack[0]);

        let ops = vec![Opcode::LoadIntLit(4), Opcode::I2f, Opcode::Rtrn];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(4.0, f64::from_bits(stack[0] as u64));
        Ok(())
    }

    #[test]
    fn test_floor_and_ceiling() -> Result<()> {
        let ops = vec![
            Opcode::LoadFloatLit(2.5),
            Opcode::FlorFloat,
            Opcode::F2i,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(2, stack[0]);

        let ops = vec![
            Opcode::LoadFloatLit(2.5),
            Opcode::CeilFloat,
            Opcode::F2i,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(3, stack[0]);
        Ok(())
    }

    #[test]
    fn test_float_compare() -> Result<()> {
        let ops = vec![
            Opcode::LoadFloatLit(1.5),
            Opcode::LoadFloatLit(2.5),
            Opcode::LesFloat,
            Opcode::Rtrn,
        ];
        let (_, stack, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(1, stack[0]);
        Ok(())
    }

    #[test]
    fn test_instance_field_load() -> Result<()> {
        let ops = vec![
            Opcode::LoadInstMem,
            Opcode::LoadIntVar {
                slot: 0,
                context: MemoryContext::Instance,
            },
            Opcode::Rtrn,
        ];
        let mut instance = [99i64, 0];
        let (status, stack, _) = run(0, 16, ops, &[], instance.as_mut_ptr())?;
        assert_eq!(0, status);
        assert_eq!(99, stack[0]);
        Ok(())
    }

    #[test]
    fn test_instance_field_store() -> Result<()> {
        let ops = vec![
            Opcode::LoadIntLit(55),
            Opcode::LoadInstMem,
            Opcode::StorIntVar {
                slot: 1,
                context: MemoryContext::Instance,
            },
            Opcode::LoadIntLit(0),
            Opcode::Rtrn,
        ];
        let mut instance = [0i64, 0];
        let (status, _, _) = run(0, 16, ops, &[], instance.as_mut_ptr())?;
        assert_eq!(0, status);
        assert_eq!(55, instance[1]);
        Ok(())
    }

    #[test]
    fn test_nil_dereference_traps() -> Result<()> {
        NIL_TRAPS.store(0, Ordering::SeqCst);
        let ops = vec![
            Opcode::LoadInstMem,
            Opcode::LoadIntVar {
                slot: 0,
                context: MemoryContext::Instance,
            },
            Opcode::Rtrn,
        ];
        let (status, _, _) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(1, status);
        assert_eq!(1, NIL_TRAPS.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_callback_bridge() -> Result<()> {
        CALLBACK_OP.store(-1, Ordering::SeqCst);
        CALLBACK_VALUE.store(0, Ordering::SeqCst);
        let ops = vec![
            Opcode::LoadIntLit(42),
            Opcode::Trap { arguments: 1 },
            Opcode::LoadIntLit(7),
            Opcode::Rtrn,
        ];
        let (status, stack, position) = run(0, 16, ops, &[], std::ptr::null_mut())?;
        assert_eq!(0, status);
        assert_eq!(
            i64::from(Opcode::Trap { arguments: 1 }.code()),
            CALLBACK_OP.load(Ordering::SeqCst)
        );
        assert_eq!(42, CALLBACK_VALUE.load(Ordering::SeqCst));
        assert_eq!(1, position);
        assert_eq!(7, stack[0]);
        Ok(())
    }

    #[test]
    fn test_callback_preserves_live_registers() -> Result<()> {
        // a register-resident value stays correct across the bridge
        let ops = vec![
            stor(0),
            load(0),
            Opcode::LoadIntLit(1),
            Opcode::AddInt,
            Opcode::LoadIntLit(9),
            Opcode::Trap { arguments: 1 },
            Opcode::Rtrn,
        ];
        let (_, stack, position) = run(1, 16, ops, &[41], std::ptr::null_mut())?;
        assert_eq!(1, position);
        assert_eq!(42, stack[0]);
        Ok(())
    }

    #[test]
    fn test_array_element_round_trip() -> Result<()> {
        let ops = vec![
            stor(0),
            Opcode::LoadIntLit(77),
            Opcode::LoadIntLit(2),
            load(0),
            Opcode::StorIntAryElm {
                dimensions: 1,
                context: MemoryContext::Local,
            },
            Opcode::LoadIntLit(2),
            load(0),
            Opcode::LoadIntAryElm {
                dimensions: 1,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ];
        // header: element count, dimension count, extent; then four elements
        let mut array = [4i64, 1, 4, 0, 0, 0, 0];
        let pointer = array.as_mut_ptr() as i64;
        let (status, stack, _) = run(1, 16, ops, &[pointer], std::ptr::null_mut())?;
        assert_eq!(0, status);
        assert_eq!(77, array[5]);
        assert_eq!(77, stack[0]);
        Ok(())
    }

    #[test]
    fn test_array_bounds_trap() -> Result<()> {
        BOUNDS_TRAPS.store(0, Ordering::SeqCst);
        let ops = vec![
            stor(0),
            Opcode::LoadIntLit(9),
            load(0),
            Opcode::LoadIntAryElm {
                dimensions: 1,
                context: MemoryContext::Local,
            },
            Opcode::Rtrn,
        ];
        let mut array = [4i64, 1, 4, 0, 0, 0, 0];
        let pointer = array.as_mut_ptr() as i64;
        let (status, _, _) = run(1, 16, ops, &[pointer], std::ptr::null_mut())?;
        assert_eq!(1, status);
        assert_eq!(1, BOUNDS_TRAPS.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_multi_dimension_access_aborts() {
        let program = program_with_method(
            0,
            16,
            vec![
                Opcode::LoadIntLit(0),
                Opcode::LoadIntLit(0),
                Opcode::LoadIntLit(0),
                Opcode::LoadIntAryElm {
                    dimensions: 2,
                    context: MemoryContext::Local,
                },
                Opcode::Rtrn,
            ],
        );
        assert_eq!(
            Err(Error::UnsupportedArrayDimensions(2)),
            Compiler::new(hooks())
                .compile(&program, 0, 0)
                .map(|_| ())
        );
    }

    #[test]
    fn test_unsupported_instruction_aborts() {
        let program =
            program_with_method(0, 16, vec![Opcode::SqrtFloat, Opcode::Rtrn]);
        assert!(matches!(
            Compiler::new(hooks()).compile(&program, 0, 0),
            Err(Error::UnsupportedInstruction(_))
        ));
    }

    #[test]
    fn test_unresolved_label_aborts() {
        let program = program_with_method(
            0,
            16,
            vec![
                Opcode::Jmp {
                    label: 9,
                    condition: veloce_bytecode::JUMP_UNCONDITIONAL,
                },
                Opcode::Rtrn,
            ],
        );
        assert!(matches!(
            Compiler::new(hooks()).compile(&program, 0, 0),
            Err(Error::UnresolvedLabel(9))
        ));
    }

    #[test]
    fn test_roots_balance() -> Result<()> {
        ROOTS.store(0, Ordering::SeqCst);
        let (_, _, _) = run(0, 16, vec![Opcode::LoadIntLit(1), Opcode::Rtrn], &[], std::ptr::null_mut())?;
        assert_eq!(0, ROOTS.load(Ordering::SeqCst), "every root is unregistered");
        Ok(())
    }

    #[test]
    fn test_optimized_method_compiles() -> Result<()> {
        let mut program = program_with_method(
            0,
            16,
            vec![
                Opcode::LoadIntLit(3),
                Opcode::LoadIntLit(4),
                Opcode::AddInt,
                Opcode::Rtrn,
            ],
        );
        veloce_optimizer::optimize(&mut program, veloce_optimizer::OptimizationLevel::Basic);
        let compiled = Compiler::new(hooks()).compile(&program, 0, 0)?;
        let mut op_stack = vec![0i64; 8];
        let mut stack_pos = 0i64;
        let mut class_memory = [0i64; 2];
        let status = unsafe {
            compiled.execute(
                class_memory.as_mut_ptr(),
                std::ptr::null_mut(),
                op_stack.as_mut_ptr(),
                &mut stack_pos,
            )
        };
        assert_eq!(0, status);
        assert_eq!(7, op_stack[0]);
        Ok(())
    }
}
