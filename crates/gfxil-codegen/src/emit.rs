//! Instruction-level helpers shared by every generated function.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    FuncRef, InstBuilder, MemFlags, StackSlotData, StackSlotKind, TrapCode, Type, Value, types,
};
use cranelift_frontend::FunctionBuilder;
use cranelift_module::{FuncId, Module};
use gfxil_semantic::TypeId;

use crate::CodegenError;
use crate::compiler::Compiler;
use crate::runtime::HostFn;
use crate::types::NativeType;

/// A value of a semantic type. Scalars are held in `value` directly;
/// aggregates (classes, slices, arrays) are addressed by it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Operand {
    pub ty: TypeId,
    pub value: Value,
}

impl Operand {
    pub fn new(ty: TypeId, value: Value) -> Self {
        Self { ty, value }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cleanup {
    Release(Operand),
    /// Releases whatever the slot holds when the scope exits.
    ReleaseAt { ty: TypeId, addr: Value },
}

pub(crate) fn clif_type(native: &NativeType, ptr: Type) -> Option<Type> {
    match native {
        NativeType::Int { bits: 8, .. } => Some(types::I8),
        NativeType::Int { bits: 16, .. } => Some(types::I16),
        NativeType::Int { bits: 32, .. } => Some(types::I32),
        NativeType::Int { .. } => Some(types::I64),
        NativeType::F32 => Some(types::F32),
        NativeType::F64 => Some(types::F64),
        NativeType::Pointer(_) => Some(ptr),
        NativeType::Void | NativeType::Struct(_) | NativeType::Array(..) => None,
    }
}

pub(crate) struct Emitter<'e, 'p> {
    pub c: &'e mut Compiler<'p>,
    pub b: FunctionBuilder<'e>,
    pub params: Vec<Value>,
    /// The `Context` pointer passed to host callbacks. Defaults to the
    /// first parameter.
    pub ctx: Value,
    pub ptr: Type,
    function: String,
    funcs: HashMap<FuncId, FuncRef>,
    scopes: Vec<Vec<Cleanup>>,
}

impl<'e, 'p> Emitter<'e, 'p> {
    pub fn new(c: &'e mut Compiler<'p>, mut b: FunctionBuilder<'e>, function: &str) -> Self {
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let params = b.block_params(entry).to_vec();
        let ptr = c.ptr;
        let ctx = match params.first() {
            Some(first) => *first,
            None => b.ins().iconst(ptr, 0),
        };
        Self {
            c,
            b,
            params,
            ctx,
            ptr,
            function: function.to_string(),
            funcs: HashMap::new(),
            scopes: vec![Vec::new()],
        }
    }

    pub fn finish(mut self) {
        self.b.seal_all_blocks();
        self.b.finalize();
    }

    pub fn invalid(&self, detail: impl Into<String>) -> CodegenError {
        CodegenError::InvalidBody {
            function: self.function.clone(),
            detail: detail.into(),
        }
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    pub fn native(&self, ty: TypeId) -> NativeType {
        self.c.lowering.target_type(ty)
    }

    pub fn clif(&self, native: &NativeType) -> Option<Type> {
        clif_type(native, self.ptr)
    }

    pub fn size_of(&self, ty: TypeId) -> u32 {
        self.c.lowering.size_of(ty)
    }

    pub fn is_ref_counted(&self, ty: TypeId) -> bool {
        self.c.program.types.is_ref_counted(ty)
    }

    // ------------------------------------------------------------------
    // Constants and memory
    // ------------------------------------------------------------------

    /// Integer constant, truncated to the width of `ty`.
    pub fn iconst(&mut self, ty: Type, value: i64) -> Value {
        let bits = ty.bits();
        let value = if bits < 64 {
            value & ((1i64 << bits) - 1)
        } else {
            value
        };
        self.b.ins().iconst(ty, value)
    }

    pub fn null(&mut self) -> Value {
        self.b.ins().iconst(self.ptr, 0)
    }

    pub fn load(&mut self, ty: Type, addr: Value, offset: u32) -> Value {
        self.b.ins().load(ty, MemFlags::new(), addr, offset as i32)
    }

    pub fn store(&mut self, value: Value, addr: Value, offset: u32) {
        self.b.ins().store(MemFlags::new(), value, addr, offset as i32);
    }

    pub fn load_ptr(&mut self, addr: Value, offset: u32) -> Value {
        self.load(self.ptr, addr, offset)
    }

    pub fn addr_at(&mut self, base: Value, offset: u32) -> Value {
        if offset == 0 {
            base
        } else {
            self.b.ins().iadd_imm(base, i64::from(offset))
        }
    }

    /// The value of type `ty` living at `addr`. Aggregates are not copied.
    pub fn operand_at(&mut self, ty: TypeId, addr: Value) -> Operand {
        let native = self.native(ty);
        let value = match self.clif(&native) {
            Some(clif) => self.load(clif, addr, 0),
            None => addr,
        };
        Operand::new(ty, value)
    }

    pub fn store_operand(&mut self, operand: Operand, addr: Value) {
        let native = self.native(operand.ty);
        if self.clif(&native).is_some() {
            self.store(operand.value, addr, 0);
        } else {
            let size = self.c.lowering.table.size_of(&native);
            self.copy_bytes(addr, operand.value, size);
        }
    }

    pub fn slot(&mut self, size: u32, align: u32) -> Value {
        let align_shift = align.max(1).trailing_zeros() as u8;
        let slot = self.b.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size.max(1),
            align_shift,
        ));
        self.b.ins().stack_addr(self.ptr, slot, 0)
    }

    /// Zeroed stack storage for one value of `ty`.
    pub fn temp(&mut self, ty: TypeId) -> Value {
        let size = self.size_of(ty);
        let align = self.c.lowering.align_of(ty);
        let addr = self.slot(size, align);
        self.zero_bytes(addr, size);
        addr
    }

    pub fn copy_bytes(&mut self, dst: Value, src: Value, size: u32) {
        let mut offset = 0;
        for (width, ty) in [(8, types::I64), (4, types::I32), (2, types::I16), (1, types::I8)] {
            while size - offset >= width {
                let value = self.load(ty, src, offset);
                self.store(value, dst, offset);
                offset += width;
            }
        }
    }

    pub fn zero_bytes(&mut self, dst: Value, size: u32) {
        let mut offset = 0;
        for (width, ty) in [(8, types::I64), (4, types::I32), (2, types::I16), (1, types::I8)] {
            if size - offset < width {
                continue;
            }
            let zero = self.b.ins().iconst(ty, 0);
            while size - offset >= width {
                self.store(zero, dst, offset);
                offset += width;
            }
        }
    }

    /// Converts a scalar between native representations, extending or
    /// truncating integers by the signedness of the source.
    pub fn convert_scalar(&mut self, value: Value, from: &NativeType, to: &NativeType) -> Value {
        let pointer_bits = self.ptr.bits() as u8;
        let as_int = |native: &NativeType| match native {
            NativeType::Pointer(_) => NativeType::Int {
                bits: pointer_bits,
                signed: false,
            },
            other => other.clone(),
        };
        let (from, to) = (as_int(from), as_int(to));
        let Some(target) = self.clif(&to) else {
            return value;
        };
        match (&from, &to) {
            (NativeType::Int { bits: a, signed }, NativeType::Int { bits: b, .. }) => {
                if a < b {
                    if *signed {
                        self.b.ins().sextend(target, value)
                    } else {
                        self.b.ins().uextend(target, value)
                    }
                } else if a > b {
                    self.b.ins().ireduce(target, value)
                } else {
                    value
                }
            }
            (NativeType::F32, NativeType::F64) => self.b.ins().fpromote(target, value),
            (NativeType::F64, NativeType::F32) => self.b.ins().fdemote(target, value),
            (NativeType::Int { signed: true, .. }, NativeType::F32 | NativeType::F64) => {
                self.b.ins().fcvt_from_sint(target, value)
            }
            (NativeType::Int { .. }, NativeType::F32 | NativeType::F64) => {
                self.b.ins().fcvt_from_uint(target, value)
            }
            (NativeType::F32 | NativeType::F64, NativeType::Int { signed: true, .. }) => {
                self.b.ins().fcvt_to_sint_sat(target, value)
            }
            (NativeType::F32 | NativeType::F64, NativeType::Int { .. }) => {
                self.b.ins().fcvt_to_uint_sat(target, value)
            }
            _ => value,
        }
    }

    /// Widens an integer operand to `i64`.
    pub fn to_i64(&mut self, operand: Operand) -> Value {
        let native = self.native(operand.ty);
        self.convert_scalar(operand.value, &native, &NativeType::U64)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn func_ref(&mut self, id: FuncId) -> FuncRef {
        if let Some(func_ref) = self.funcs.get(&id) {
            return *func_ref;
        }
        let func_ref = self.c.module.declare_func_in_func(id, self.b.func);
        self.funcs.insert(id, func_ref);
        func_ref
    }

    pub fn call(&mut self, id: FuncId, args: &[Value]) -> Vec<Value> {
        let func_ref = self.func_ref(id);
        let call = self.b.ins().call(func_ref, args);
        self.b.inst_results(call).to_vec()
    }

    /// Calls a function returning exactly one value.
    pub fn call1(&mut self, id: FuncId, args: &[Value]) -> Value {
        let results = self.call(id, args);
        results[0]
    }

    pub fn call_host(&mut self, function: HostFn, args: &[Value]) -> Vec<Value> {
        let id = self.c.host_fn(function);
        self.call(id, args)
    }

    pub fn call_host1(&mut self, function: HostFn, args: &[Value]) -> Value {
        let id = self.c.host_fn(function);
        self.call1(id, args)
    }

    pub fn arena(&mut self) -> Value {
        let ctx = self.ctx;
        self.load_ptr(ctx, crate::runtime::Context::ARENA)
    }

    /// Zero-filled heap memory from `arena`.
    pub fn alloc(&mut self, arena: Value, size: u32, align: u32) -> Value {
        let size = self.b.ins().iconst(types::I64, i64::from(size));
        let align = self.b.ins().iconst(types::I64, i64::from(align.max(1)));
        self.call_host1(HostFn::Alloc, &[arena, size, align])
    }

    /// Address of a NUL-terminated constant.
    pub fn message(&mut self, text: &str) -> Result<Value, CodegenError> {
        let id = self.c.message(text)?;
        let global = self.c.module.declare_data_in_func(id, self.b.func);
        Ok(self.b.ins().global_value(self.ptr, global))
    }

    /// Reports an invariant violation to the host and traps.
    pub fn fatal(&mut self, message: &str, object: Value) -> Result<(), CodegenError> {
        let text = self.message(message)?;
        let ctx = self.ctx;
        self.call_host(HostFn::Fatal, &[ctx, text, object]);
        self.b.ins().trap(TrapCode::unwrap_user(1));
        Ok(())
    }

    pub fn fatal_if(
        &mut self,
        condition: Value,
        message: &str,
        object: Value,
    ) -> Result<(), CodegenError> {
        let fail = self.b.create_block();
        let ok = self.b.create_block();
        self.b.ins().brif(condition, fail, &[], ok, &[]);
        self.b.switch_to_block(fail);
        self.fatal(message, object)?;
        self.b.switch_to_block(ok);
        Ok(())
    }

    /// The current block already ends in a return, jump or trap.
    pub fn is_terminated(&self) -> bool {
        let Some(block) = self.b.current_block() else {
            return true;
        };
        let func = &self.b.func;
        func.layout
            .last_inst(block)
            .is_some_and(|inst| func.dfg.insts[inst].opcode().is_terminator())
    }

    pub fn is_null(&mut self, value: Value) -> Value {
        self.b.ins().icmp_imm(IntCC::Equal, value, 0)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    pub fn if_then<F>(&mut self, condition: Value, then: F) -> Result<(), CodegenError>
    where
        F: FnOnce(&mut Self) -> Result<(), CodegenError>,
    {
        let then_block = self.b.create_block();
        let merge = self.b.create_block();
        self.b.ins().brif(condition, then_block, &[], merge, &[]);
        self.b.switch_to_block(then_block);
        then(self)?;
        if !self.is_terminated() {
            self.b.ins().jump(merge, &[]);
        }
        self.b.switch_to_block(merge);
        Ok(())
    }

    pub fn if_else<F, G>(&mut self, condition: Value, then: F, otherwise: G) -> Result<(), CodegenError>
    where
        F: FnOnce(&mut Self) -> Result<(), CodegenError>,
        G: FnOnce(&mut Self) -> Result<(), CodegenError>,
    {
        let then_block = self.b.create_block();
        let else_block = self.b.create_block();
        let merge = self.b.create_block();
        self.b
            .ins()
            .brif(condition, then_block, &[], else_block, &[]);
        self.b.switch_to_block(then_block);
        then(self)?;
        if !self.is_terminated() {
            self.b.ins().jump(merge, &[]);
        }
        self.b.switch_to_block(else_block);
        otherwise(self)?;
        if !self.is_terminated() {
            self.b.ins().jump(merge, &[]);
        }
        self.b.switch_to_block(merge);
        Ok(())
    }

    /// Runs `body` for every `i64` index in `[0, count)`.
    pub fn for_n<F>(&mut self, count: Value, mut body: F) -> Result<(), CodegenError>
    where
        F: FnMut(&mut Self, Value) -> Result<(), CodegenError>,
    {
        let header = self.b.create_block();
        let body_block = self.b.create_block();
        let exit = self.b.create_block();
        self.b.append_block_param(header, types::I64);
        let zero = self.b.ins().iconst(types::I64, 0);
        self.b.ins().jump(header, &[zero]);

        self.b.switch_to_block(header);
        let index = self.b.block_params(header)[0];
        let more = self.b.ins().icmp(IntCC::UnsignedLessThan, index, count);
        self.b.ins().brif(more, body_block, &[], exit, &[]);

        self.b.switch_to_block(body_block);
        body(self, index)?;
        if !self.is_terminated() {
            let next = self.b.ins().iadd_imm(index, 1);
            self.b.ins().jump(header, &[next]);
        }
        self.b.switch_to_block(exit);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scopes and reference counting
    // ------------------------------------------------------------------

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Runs the innermost scope's cleanups unless the current block has
    /// already returned.
    pub fn pop_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            if !self.is_terminated() {
                self.run_cleanups(&scope);
            }
        }
    }

    fn innermost(&mut self) -> &mut Vec<Cleanup> {
        if self.scopes.is_empty() {
            self.scopes.push(Vec::new());
        }
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Releases `operand` when the current scope exits.
    pub fn defer_release(&mut self, operand: Operand) {
        if self.is_ref_counted(operand.ty) {
            self.innermost().push(Cleanup::Release(operand));
        }
    }

    /// Releases the value held at `addr` when the current scope exits.
    pub fn defer_release_at(&mut self, ty: TypeId, addr: Value) {
        if self.is_ref_counted(ty) {
            self.innermost().push(Cleanup::ReleaseAt { ty, addr });
        }
    }

    fn run_cleanups(&mut self, scope: &[Cleanup]) {
        for cleanup in scope.iter().rev() {
            match *cleanup {
                Cleanup::Release(operand) => self.release(operand),
                Cleanup::ReleaseAt { ty, addr } => {
                    let operand = self.operand_at(ty, addr);
                    self.release(operand);
                }
            }
        }
    }

    /// Runs every pending cleanup, innermost scope first, then returns.
    pub fn ret(&mut self, values: &[Value]) {
        let scopes = self.scopes.clone();
        for scope in scopes.iter().rev() {
            self.run_cleanups(scope);
        }
        self.b.ins().return_(values);
    }

    pub fn reference(&mut self, operand: Operand) {
        self.ref_rel(operand, true);
    }

    pub fn release(&mut self, operand: Operand) {
        self.ref_rel(operand, false);
    }

    fn ref_rel(&mut self, operand: Operand, reference: bool) {
        if !self.is_ref_counted(operand.ty) {
            return;
        }
        let pair = self.c.refrels.pair(&self.c.program.types, operand.ty);
        let function = if reference {
            pair.reference
        } else {
            pair.release
        };
        let ctx = self.ctx;
        self.call(function, &[ctx, operand.value]);
    }
}
