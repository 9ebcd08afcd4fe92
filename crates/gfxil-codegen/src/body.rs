//! Lowering of command bodies and global initialisers.
//!
//! Expression results are borrowed: a value read from a global, local or
//! field stays owned by its location, and a fresh temporary is owned by the
//! enclosing scope, which releases it on exit. Storing into a location
//! references the new value and releases the old one.

use std::mem::offset_of;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{InstBuilder, Value, types};
use gfxil_semantic::{
    Api, BinaryOp, Block, Builtin, Expr, Field, LValue, Param, Program, Stmt, TypeId, TypeKind,
};

use crate::CodegenError;
use crate::compiler::{Compiler, RESULT_FIELD};
use crate::convert::convert_value;
use crate::emit::{Emitter, Operand};
use crate::lowering::MapShape;
use crate::maps::MapFuncs;
use crate::runtime::{ACCESS_READ, ACCESS_WRITE, Context, ERR_ABORTED, ERR_SUCCESS, HostFn, Slice};
use crate::types::{NativeType, StructId};

/// The argument block of the command being lowered.
pub(crate) struct Args<'a> {
    pub base: Value,
    pub layout: StructId,
    pub params: &'a [Param],
}

struct Local {
    name: String,
    ty: TypeId,
    addr: Value,
}

pub(crate) struct Body<'a, 'e, 'p> {
    e: &'a mut Emitter<'e, 'p>,
    api: Option<&'a Api>,
    args: Option<Args<'a>>,
    locals: Vec<Vec<Local>>,
}

fn int_cc(op: BinaryOp, signed: bool) -> Option<IntCC> {
    Some(match (op, signed) {
        (BinaryOp::Eq, _) => IntCC::Equal,
        (BinaryOp::Ne, _) => IntCC::NotEqual,
        (BinaryOp::Lt, true) => IntCC::SignedLessThan,
        (BinaryOp::Lt, false) => IntCC::UnsignedLessThan,
        (BinaryOp::Le, true) => IntCC::SignedLessThanOrEqual,
        (BinaryOp::Le, false) => IntCC::UnsignedLessThanOrEqual,
        (BinaryOp::Gt, true) => IntCC::SignedGreaterThan,
        (BinaryOp::Gt, false) => IntCC::UnsignedGreaterThan,
        (BinaryOp::Ge, true) => IntCC::SignedGreaterThanOrEqual,
        (BinaryOp::Ge, false) => IntCC::UnsignedGreaterThanOrEqual,
        _ => return None,
    })
}

fn float_cc(op: BinaryOp) -> Option<FloatCC> {
    Some(match op {
        BinaryOp::Eq => FloatCC::Equal,
        BinaryOp::Ne => FloatCC::NotEqual,
        BinaryOp::Lt => FloatCC::LessThan,
        BinaryOp::Le => FloatCC::LessThanOrEqual,
        BinaryOp::Gt => FloatCC::GreaterThan,
        BinaryOp::Ge => FloatCC::GreaterThanOrEqual,
        _ => return None,
    })
}

const SLICE_POOL: u32 = offset_of!(Slice, pool) as u32;
const SLICE_ROOT: u32 = offset_of!(Slice, root) as u32;
const SLICE_BASE: u32 = offset_of!(Slice, base) as u32;
const SLICE_SIZE: u32 = offset_of!(Slice, size) as u32;
const SLICE_COUNT: u32 = offset_of!(Slice, count) as u32;

impl<'a, 'e, 'p> Body<'a, 'e, 'p> {
    pub fn new(e: &'a mut Emitter<'e, 'p>, api: Option<&'a Api>, args: Option<Args<'a>>) -> Self {
        Self {
            e,
            api,
            args,
            locals: vec![Vec::new()],
        }
    }

    fn program(&self) -> &'p Program {
        self.e.c.program
    }

    fn type_name(&self, ty: TypeId) -> &'p str {
        self.program().types.name(ty)
    }

    // ------------------------------------------------------------------
    // Default values
    // ------------------------------------------------------------------

    /// The default-initialised value of `ty`: zero scalars, the context's
    /// empty string, a fresh empty map, a class built from its field
    /// defaults.
    pub fn initial_value(&mut self, ty: TypeId) -> Result<Operand, CodegenError> {
        let program = self.program();
        match program.types.underlying_kind(ty) {
            TypeKind::Builtin(Builtin::String) => {
                let ctx = self.e.ctx;
                let empty = self.e.load_ptr(ctx, Context::EMPTY_STRING);
                Ok(Operand::new(ty, empty))
            }
            TypeKind::Builtin(Builtin::Void) => Err(self.e.invalid("`void` has no value")),
            TypeKind::Class { fields } => self.construct(ty, fields, &[]),
            TypeKind::Map { .. } => self.new_map(ty),
            TypeKind::StaticArray { .. } | TypeKind::Slice { .. } => {
                let addr = self.e.temp(ty);
                Ok(Operand::new(ty, addr))
            }
            _ => {
                let native = self.e.native(ty);
                let value = match native {
                    NativeType::F32 => self.e.b.ins().f32const(0.0),
                    NativeType::F64 => self.e.b.ins().f64const(0.0),
                    other => match self.e.clif(&other) {
                        Some(clif) => self.e.b.ins().iconst(clif, 0),
                        None => {
                            return Err(self
                                .e
                                .invalid(format!("no default for `{}`", self.type_name(ty))));
                        }
                    },
                };
                Ok(Operand::new(ty, value))
            }
        }
    }

    fn construct(
        &mut self,
        class: TypeId,
        fields: &'p [Field],
        explicit: &[(String, Expr)],
    ) -> Result<Operand, CodegenError> {
        let Some(id) = self.e.c.lowering.target_struct(class) else {
            return Err(self
                .e
                .invalid(format!("class `{}` was not lowered", self.type_name(class))));
        };
        if let Some((name, _)) = explicit
            .iter()
            .find(|(name, _)| !fields.iter().any(|field| field.name == *name))
        {
            return Err(self.e.invalid(format!(
                "class `{}` has no field `{name}`",
                self.type_name(class)
            )));
        }
        let addr = self.e.temp(class);
        for field in fields {
            let value = match explicit.iter().find(|(name, _)| *name == field.name) {
                Some((_, expr)) => self.expr(expr)?,
                None => match &field.default {
                    Some(default) => self.expr(default)?,
                    None => self.initial_value(field.ty)?,
                },
            };
            let offset = self.e.c.lowering.table.field_offset(id, &field.name);
            let slot = self.e.addr_at(addr, offset);
            self.e.store_operand(value, slot);
            let held = self.e.operand_at(field.ty, slot);
            self.e.reference(held);
        }
        self.e.defer_release_at(class, addr);
        Ok(Operand::new(class, addr))
    }

    fn new_map(&mut self, ty: TypeId) -> Result<Operand, CodegenError> {
        let (_, shape) = self.map_of(ty)?;
        let table = &self.e.c.lowering.table;
        let header = NativeType::Struct(shape.header);
        let size = table.size_of(&header);
        let align = table.align_of(&header);
        let ref_count = table.field_offset(shape.header, "ref_count");
        let arena_offset = table.field_offset(shape.header, "arena");
        let arena = self.e.arena();
        let map = self.e.alloc(arena, size, align);
        let one = self.e.b.ins().iconst(types::I32, 1);
        self.e.store(one, map, ref_count);
        self.e.store(arena, map, arena_offset);
        let map = Operand::new(ty, map);
        self.e.defer_release(map);
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Locations
    // ------------------------------------------------------------------

    fn param(&mut self, name: &str) -> Result<(TypeId, Value), CodegenError> {
        let Some(args) = &self.args else {
            return Err(self.e.invalid(format!("parameter `{name}` outside a command")));
        };
        let Some(param) = args.params.iter().find(|param| param.name == name) else {
            return Err(self.e.invalid(format!("unknown parameter `{name}`")));
        };
        let (ty, base, layout) = (param.ty, args.base, args.layout);
        let offset = self.e.c.lowering.table.field_offset(layout, name);
        Ok((ty, self.e.addr_at(base, offset)))
    }

    fn global(&mut self, name: &str) -> Result<(TypeId, Value), CodegenError> {
        let Some(api) = self.api else {
            return Err(self.e.invalid(format!("global `{name}` outside an API")));
        };
        let Some(global) = api.global(name) else {
            return Err(self
                .e
                .invalid(format!("`{}` has no global `{name}`", api.name)));
        };
        let Some(block) = self.e.c.globals.get(api.index as usize).copied() else {
            return Err(self.e.invalid("globals are not emitted"));
        };
        let offset = block.offset + self.e.c.lowering.table.field_offset(block.layout, name);
        let ctx = self.e.ctx;
        let globals = self.e.load_ptr(ctx, Context::GLOBALS);
        Ok((global.ty, self.e.addr_at(globals, offset)))
    }

    fn local(&self, name: &str) -> Result<(TypeId, Value), CodegenError> {
        self.locals
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|local| local.name == name)
            .map(|local| (local.ty, local.addr))
            .ok_or_else(|| self.e.invalid(format!("unknown local `{name}`")))
    }

    fn field_addr(
        &mut self,
        class: TypeId,
        base: Value,
        name: &str,
    ) -> Result<(TypeId, Value), CodegenError> {
        let program = self.program();
        let (Some(field), Some(id)) = (
            program.types.class_field(class, name),
            self.e.c.lowering.target_struct(class),
        ) else {
            return Err(self.e.invalid(format!(
                "`{}` has no field `{name}`",
                self.type_name(class)
            )));
        };
        let offset = self.e.c.lowering.table.field_offset(id, name);
        Ok((field.ty, self.e.addr_at(base, offset)))
    }

    fn non_null(&mut self, value: Value) -> Result<(), CodegenError> {
        let null = self.e.is_null(value);
        self.e.fatal_if(null, "Null-dereference", value)
    }

    /// Address of the value held by a reference.
    fn deref_addr(&mut self, reference: Operand) -> Result<(TypeId, Value), CodegenError> {
        let program = self.program();
        let ty = program.types.underlying(reference.ty);
        let (TypeKind::Reference { to }, Some(id)) = (
            program.types.kind(ty),
            self.e.c.lowering.refs.get(&ty).copied(),
        ) else {
            return Err(self.e.invalid(format!(
                "cannot dereference `{}`",
                self.type_name(reference.ty)
            )));
        };
        self.non_null(reference.value)?;
        let offset = self.e.c.lowering.table.field_offset(id, "value");
        Ok((*to, self.e.addr_at(reference.value, offset)))
    }

    fn map_of(&self, ty: TypeId) -> Result<(Option<MapFuncs>, MapShape), CodegenError> {
        let ty = self.program().types.underlying(ty);
        match self.e.c.lowering.maps.get(&ty) {
            Some(shape) => Ok((self.e.c.maps.get(&ty).copied(), *shape)),
            None => Err(self
                .e
                .invalid(format!("`{}` is not a registered map", self.type_name(ty)))),
        }
    }

    fn map_funcs(&mut self, map: Operand) -> Result<(MapFuncs, MapShape), CodegenError> {
        let (funcs, shape) = self.map_of(map.ty)?;
        let Some(funcs) = funcs else {
            return Err(self.e.invalid("map operations were not declared"));
        };
        self.non_null(map.value)?;
        Ok((funcs, shape))
    }

    fn lvalue(&mut self, target: &LValue) -> Result<(TypeId, Value), CodegenError> {
        match target {
            LValue::Global(name) => self.global(name),
            LValue::Local(name) => self.local(name),
            LValue::Field { base, field } => {
                let (class, addr) = self.lvalue(base)?;
                self.field_addr(class, addr, field)
            }
            LValue::MapIndex { map, key } => {
                let map = self.expr(map)?;
                let key = self.expr(key)?;
                let (funcs, shape) = self.map_funcs(map)?;
                let add = self.e.b.ins().iconst(types::I8, 1);
                let ctx = self.e.ctx;
                let slot = self.e.call1(funcs.index, &[ctx, map.value, key.value, add]);
                Ok((shape.value, slot))
            }
            LValue::Deref(reference) => {
                let reference = self.expr(reference)?;
                self.deref_addr(reference)
            }
        }
    }

    // ------------------------------------------------------------------
    // Slices
    // ------------------------------------------------------------------

    fn slice_elem(&self, slice: TypeId) -> Result<TypeId, CodegenError> {
        match self.program().types.underlying_kind(slice) {
            TypeKind::Slice { elem } => Ok(*elem),
            _ => Err(self
                .e
                .invalid(format!("`{}` is not a slice", self.type_name(slice)))),
        }
    }

    /// Bounds-checks `index` and resolves the storage bytes of that element.
    fn element(
        &mut self,
        slice: Operand,
        index: Operand,
        access: u32,
    ) -> Result<(TypeId, Value), CodegenError> {
        let elem = self.slice_elem(slice.ty)?;
        let stride = self.e.c.lowering.storage_stride(elem)?;
        let index = self.e.to_i64(index);
        let count = self.e.load(types::I64, slice.value, SLICE_COUNT);
        let out_of_bounds = self
            .e
            .b
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, index, count);
        self.e
            .fatal_if(out_of_bounds, "Slice index out of bounds", slice.value)?;
        let pool = self.e.load(types::I64, slice.value, SLICE_POOL);
        let base = self.e.load(types::I64, slice.value, SLICE_BASE);
        let offset = self.e.b.ins().imul_imm(index, i64::from(stride));
        let addr = self.e.b.ins().iadd(base, offset);
        let access = self.e.b.ins().iconst(types::I32, i64::from(access));
        let size = self.e.b.ins().iconst(types::I64, i64::from(stride));
        let ctx = self.e.ctx;
        let data = self
            .e
            .call_host1(HostFn::ResolvePoolData, &[ctx, pool, addr, access, size]);
        Ok((elem, data))
    }

    fn make_slice(&mut self, slice: TypeId, count: u64) -> Result<Operand, CodegenError> {
        let elem = self.slice_elem(slice)?;
        let stride = self.e.c.lowering.storage_stride(elem)?;
        let size = u64::from(stride).saturating_mul(count);
        let size = self.e.b.ins().iconst(types::I64, size as i64);
        let ctx = self.e.ctx;
        let pool = self.e.call_host1(HostFn::MakePool, &[ctx, size]);
        let out = self.e.temp(slice);
        let count = self.e.b.ins().iconst(types::I64, count as i64);
        self.e.store(pool, out, SLICE_POOL);
        self.e.store(size, out, SLICE_SIZE);
        self.e.store(count, out, SLICE_COUNT);
        self.e.defer_release_at(slice, out);
        Ok(Operand::new(slice, out))
    }

    fn pointer_slice(
        &mut self,
        slice: TypeId,
        ptr: Operand,
        count: Operand,
    ) -> Result<Operand, CodegenError> {
        let elem = self.slice_elem(slice)?;
        let stride = self.e.c.lowering.storage_stride(elem)?;
        let ptr = self.e.to_i64(ptr);
        let count = self.e.to_i64(count);
        let size = self.e.b.ins().imul_imm(count, i64::from(stride));
        let out = self.e.temp(slice);
        self.e.store(ptr, out, SLICE_ROOT);
        self.e.store(ptr, out, SLICE_BASE);
        self.e.store(size, out, SLICE_SIZE);
        self.e.store(count, out, SLICE_COUNT);
        Ok(Operand::new(slice, out))
    }

    fn cstring_slice(&mut self, slice: TypeId, ptr: Operand) -> Result<Operand, CodegenError> {
        let elem = self.slice_elem(slice)?;
        if self.e.c.lowering.storage_stride(elem)? != 1 {
            return Err(self.e.invalid(format!(
                "C strings convert to byte slices, not `{}`",
                self.type_name(slice)
            )));
        }
        let ptr = self.e.to_i64(ptr);
        let out = self.e.temp(slice);
        let ctx = self.e.ctx;
        self.e.call_host(HostFn::CStringToSlice, &[ctx, ptr, out]);
        self.e.defer_release_at(slice, out);
        Ok(Operand::new(slice, out))
    }

    fn store_in_database(&mut self, slice: Operand) -> Result<Operand, CodegenError> {
        self.slice_elem(slice.ty)?;
        let id = self.program().types.content_id();
        let out = self.e.temp(id);
        let pool = self.e.load(types::I64, slice.value, SLICE_POOL);
        let base = self.e.load(types::I64, slice.value, SLICE_BASE);
        let size = self.e.load(types::I64, slice.value, SLICE_SIZE);
        let access = self.e.b.ins().iconst(types::I32, i64::from(ACCESS_READ));
        let ctx = self.e.ctx;
        let data = self
            .e
            .call_host1(HostFn::ResolvePoolData, &[ctx, pool, base, access, size]);
        self.e
            .call_host(HostFn::StoreInDatabase, &[ctx, data, size, out]);
        Ok(Operand::new(id, out))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn expr(&mut self, expr: &Expr) -> Result<Operand, CodegenError> {
        let program = self.program();
        match expr {
            Expr::Bool(value) => {
                let value = self.e.b.ins().iconst(types::I8, i64::from(*value));
                Ok(Operand::new(Builtin::Bool.id(), value))
            }
            Expr::Int { ty, value } => {
                let native = self.e.native(*ty);
                let value = match native {
                    NativeType::F32 => self.e.b.ins().f32const(*value as f32),
                    NativeType::F64 => self.e.b.ins().f64const(*value as f64),
                    other => match self.e.clif(&other) {
                        Some(clif) => self.e.iconst(clif, *value),
                        None => {
                            return Err(self.e.invalid(format!(
                                "integer literal of type `{}`",
                                self.type_name(*ty)
                            )));
                        }
                    },
                };
                Ok(Operand::new(*ty, value))
            }
            Expr::Float { ty, value } => {
                let value = match self.e.native(*ty) {
                    NativeType::F32 => self.e.b.ins().f32const(*value as f32),
                    NativeType::F64 => self.e.b.ins().f64const(*value),
                    _ => {
                        return Err(self.e.invalid(format!(
                            "float literal of type `{}`",
                            self.type_name(*ty)
                        )));
                    }
                };
                Ok(Operand::new(*ty, value))
            }
            Expr::Str(text) => {
                let data = self.e.message(text)?;
                let length = self.e.b.ins().iconst(types::I64, text.len() as i64);
                let arena = self.e.arena();
                let string = self
                    .e
                    .call_host1(HostFn::MakeString, &[arena, length, data]);
                let string = Operand::new(Builtin::String.id(), string);
                self.e.defer_release(string);
                Ok(string)
            }
            Expr::Zero(ty) => self.initial_value(*ty),
            Expr::Param(name) => {
                let (ty, addr) = self.param(name)?;
                Ok(self.e.operand_at(ty, addr))
            }
            Expr::Global(name) => {
                let (ty, addr) = self.global(name)?;
                Ok(self.e.operand_at(ty, addr))
            }
            Expr::Local(name) => {
                let (ty, addr) = self.local(name)?;
                Ok(self.e.operand_at(ty, addr))
            }
            Expr::Field { base, field } => {
                let base = self.expr(base)?;
                let (ty, addr) = self.field_addr(base.ty, base.value, field)?;
                Ok(self.e.operand_at(ty, addr))
            }
            Expr::ClassInit { class, fields } => {
                let Some(class_fields) = program.types.class_fields(*class) else {
                    return Err(self
                        .e
                        .invalid(format!("`{}` is not a class", self.type_name(*class))));
                };
                self.construct(*class, class_fields, fields)
            }
            Expr::MapLookup { map, key } => {
                let map = self.expr(map)?;
                let key = self.expr(key)?;
                let (funcs, shape) = self.map_funcs(map)?;
                let out = self.e.temp(shape.value);
                let ctx = self.e.ctx;
                self.e
                    .call(funcs.lookup, &[ctx, map.value, key.value, out]);
                self.e.defer_release_at(shape.value, out);
                Ok(self.e.operand_at(shape.value, out))
            }
            Expr::MapContains { map, key } => {
                let map = self.expr(map)?;
                let key = self.expr(key)?;
                let (funcs, _) = self.map_funcs(map)?;
                let ctx = self.e.ctx;
                let found = self.e.call1(funcs.contains, &[ctx, map.value, key.value]);
                Ok(Operand::new(Builtin::Bool.id(), found))
            }
            Expr::MapLength(map) => {
                let map = self.expr(map)?;
                let (_, shape) = self.map_funcs(map)?;
                let count = self.e.c.lowering.table.field_offset(shape.header, "count");
                let count = self.e.load(types::I64, map.value, count);
                Ok(Operand::new(Builtin::Uint64.id(), count))
            }
            Expr::New { reference, value } => {
                let value = self.expr(value)?;
                let ty = program.types.underlying(*reference);
                let Some(id) = self.e.c.lowering.refs.get(&ty).copied() else {
                    return Err(self.e.invalid(format!(
                        "`{}` is not a registered reference",
                        self.type_name(*reference)
                    )));
                };
                let table = &self.e.c.lowering.table;
                let boxed = NativeType::Struct(id);
                let size = table.size_of(&boxed);
                let align = table.align_of(&boxed);
                let ref_count = table.field_offset(id, "ref_count");
                let arena_offset = table.field_offset(id, "arena");
                let value_offset = table.field_offset(id, "value");
                let arena = self.e.arena();
                let object = self.e.alloc(arena, size, align);
                let one = self.e.b.ins().iconst(types::I32, 1);
                self.e.store(one, object, ref_count);
                self.e.store(arena, object, arena_offset);
                let slot = self.e.addr_at(object, value_offset);
                self.e.store_operand(value, slot);
                let held = self.e.operand_at(value.ty, slot);
                self.e.reference(held);
                let object = Operand::new(*reference, object);
                self.e.defer_release(object);
                Ok(object)
            }
            Expr::Deref(reference) => {
                let reference = self.expr(reference)?;
                let (ty, addr) = self.deref_addr(reference)?;
                Ok(self.e.operand_at(ty, addr))
            }
            Expr::IsNull(value) => {
                let value = self.expr(value)?;
                let null = self.e.is_null(value.value);
                Ok(Operand::new(Builtin::Bool.id(), null))
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                self.binary(*op, lhs, rhs)
            }
            Expr::Not(value) => {
                let value = self.expr(value)?;
                let not = self.e.b.ins().icmp_imm(IntCC::Equal, value.value, 0);
                Ok(Operand::new(Builtin::Bool.id(), not))
            }
            Expr::MakeSlice { slice, count } => self.make_slice(*slice, *count),
            Expr::PointerSlice { slice, ptr, count } => {
                let ptr = self.expr(ptr)?;
                let count = self.expr(count)?;
                self.pointer_slice(*slice, ptr, count)
            }
            Expr::SliceIndex { slice, index } => {
                let slice = self.expr(slice)?;
                let index = self.expr(index)?;
                let (elem, data) = self.element(slice, index, ACCESS_READ)?;
                let storage = self.e.c.lowering.storage_type(elem)?;
                let target = self.e.native(elem);
                let out = self.e.temp(elem);
                convert_value(self.e, &storage, data, &target, out)?;
                Ok(self.e.operand_at(elem, out))
            }
            Expr::SliceLength(slice) => {
                let slice = self.expr(slice)?;
                self.slice_elem(slice.ty)?;
                let count = self.e.load(types::I64, slice.value, SLICE_COUNT);
                Ok(Operand::new(Builtin::Uint64.id(), count))
            }
            Expr::CStringToSlice { slice, ptr } => {
                let ptr = self.expr(ptr)?;
                self.cstring_slice(*slice, ptr)
            }
            Expr::StoreInDatabase(slice) => {
                let slice = self.expr(slice)?;
                self.store_in_database(slice)
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand) -> Result<Operand, CodegenError> {
        let program = self.program();
        let boolean = Builtin::Bool.id();
        let (a, b) = (lhs.value, rhs.value);
        match op {
            BinaryOp::And => return Ok(Operand::new(boolean, self.e.b.ins().band(a, b))),
            BinaryOp::Or => return Ok(Operand::new(boolean, self.e.b.ins().bor(a, b))),
            _ => {}
        }
        let unsupported =
            |body: &Self| body.e.invalid(format!("operator {op:?} on `{}`", body.type_name(lhs.ty)));

        if program.types.as_builtin(lhs.ty) == Some(Builtin::String) {
            let Some(cc) = int_cc(op, true) else {
                return Err(unsupported(self));
            };
            let order = self.e.call_host1(HostFn::StringCompare, &[a, b]);
            let result = self.e.b.ins().icmp_imm(cc, order, 0);
            return Ok(Operand::new(boolean, result));
        }

        match self.e.native(lhs.ty) {
            NativeType::F32 | NativeType::F64 => {
                if let Some(cc) = float_cc(op) {
                    let result = self.e.b.ins().fcmp(cc, a, b);
                    return Ok(Operand::new(boolean, result));
                }
                let result = match op {
                    BinaryOp::Add => self.e.b.ins().fadd(a, b),
                    BinaryOp::Sub => self.e.b.ins().fsub(a, b),
                    BinaryOp::Mul => self.e.b.ins().fmul(a, b),
                    _ => return Err(unsupported(self)),
                };
                Ok(Operand::new(lhs.ty, result))
            }
            native @ (NativeType::Int { .. } | NativeType::Pointer(_)) => {
                let signed = matches!(native, NativeType::Int { signed: true, .. });
                if let Some(cc) = int_cc(op, signed) {
                    let result = self.e.b.ins().icmp(cc, a, b);
                    return Ok(Operand::new(boolean, result));
                }
                let result = match op {
                    BinaryOp::Add => self.e.b.ins().iadd(a, b),
                    BinaryOp::Sub => self.e.b.ins().isub(a, b),
                    BinaryOp::Mul => self.e.b.ins().imul(a, b),
                    BinaryOp::BitAnd => self.e.b.ins().band(a, b),
                    BinaryOp::BitOr => self.e.b.ins().bor(a, b),
                    _ => return Err(unsupported(self)),
                };
                Ok(Operand::new(lhs.ty, result))
            }
            _ => Err(unsupported(self)),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub fn block(&mut self, block: &Block) -> Result<(), CodegenError> {
        self.e.push_scope();
        self.locals.push(Vec::new());
        for stmt in block.stmts() {
            if self.e.is_terminated() {
                break;
            }
            self.stmt(stmt)?;
        }
        self.locals.pop();
        self.e.pop_scope();
        Ok(())
    }

    /// Copies an aggregate into a fresh stack slot so that it survives
    /// stores that may move or release its source.
    fn stage(&mut self, value: Operand) -> Operand {
        let native = self.e.native(value.ty);
        if self.e.clif(&native).is_some() {
            return value;
        }
        let staged = self.e.temp(value.ty);
        self.e.store_operand(value, staged);
        Operand::new(value.ty, staged)
    }

    fn finish_command(&mut self, code: u32) -> Result<(), CodegenError> {
        if self.args.is_none() {
            return Err(self.e.invalid("`return` outside a command"));
        }
        let code = self.e.b.ins().iconst(types::I32, i64::from(code));
        self.e.ret(&[code]);
        Ok(())
    }

    pub fn stmt(&mut self, stmt: &Stmt) -> Result<(), CodegenError> {
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.expr(value)?;
                let addr = self.e.temp(value.ty);
                self.e.store_operand(value, addr);
                let held = self.e.operand_at(value.ty, addr);
                self.e.reference(held);
                self.e.defer_release_at(value.ty, addr);
                if let Some(scope) = self.locals.last_mut() {
                    scope.push(Local {
                        name: name.clone(),
                        ty: value.ty,
                        addr,
                    });
                }
            }
            Stmt::Assign { target, value } => {
                let value = self.expr(value)?;
                let value = self.stage(value);
                let (ty, addr) = self.lvalue(target)?;
                self.e.reference(value);
                let old = self.e.operand_at(ty, addr);
                self.e.release(old);
                self.e.store_operand(value, addr);
            }
            Stmt::MapRemove { map, key } => {
                let map = self.expr(map)?;
                let key = self.expr(key)?;
                let (funcs, _) = self.map_funcs(map)?;
                let ctx = self.e.ctx;
                self.e.call(funcs.remove, &[ctx, map.value, key.value]);
            }
            Stmt::MapClear(map) => {
                let map = self.expr(map)?;
                let (funcs, _) = self.map_funcs(map)?;
                let ctx = self.e.ctx;
                self.e.call(funcs.clear, &[ctx, map.value]);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expr(cond)?;
                let then_block = self.e.b.create_block();
                let else_block = self.e.b.create_block();
                let merge = self.e.b.create_block();
                self.e
                    .b
                    .ins()
                    .brif(cond.value, then_block, &[], else_block, &[]);
                for (block, body) in [(then_block, then), (else_block, otherwise)] {
                    self.e.b.switch_to_block(block);
                    self.block(body)?;
                    if !self.e.is_terminated() {
                        self.e.b.ins().jump(merge, &[]);
                    }
                }
                self.e.b.switch_to_block(merge);
            }
            Stmt::Block(block) => self.block(block)?,
            Stmt::Return(value) => {
                if let Some(value) = value {
                    let value = self.expr(value)?;
                    let Some(args) = &self.args else {
                        return Err(self.e.invalid("`return` outside a command"));
                    };
                    let (base, layout) = (args.base, args.layout);
                    let Some(offset) = self
                        .e
                        .c
                        .lowering
                        .table
                        .field(layout, RESULT_FIELD)
                        .map(|(offset, _)| offset)
                    else {
                        return Err(self.e.invalid("command has no result"));
                    };
                    let addr = self.e.addr_at(base, offset);
                    self.e.store_operand(value, addr);
                }
                self.finish_command(ERR_SUCCESS)?;
            }
            Stmt::Abort => self.finish_command(ERR_ABORTED)?,
            Stmt::SliceWrite {
                slice,
                index,
                value,
            } => {
                let slice = self.expr(slice)?;
                let index = self.expr(index)?;
                let value = self.expr(value)?;
                let (elem, data) = self.element(slice, index, ACCESS_WRITE)?;
                let storage = self.e.c.lowering.storage_type(elem)?;
                let target = self.e.native(elem);
                let src = self.e.temp(elem);
                self.e.store_operand(value, src);
                convert_value(self.e, &target, src, &storage, data)?;
            }
            Stmt::SliceCopy { dst, src } => {
                let dst = self.expr(dst)?;
                let src = self.expr(src)?;
                self.slice_elem(dst.ty)?;
                self.slice_elem(src.ty)?;
                let ctx = self.e.ctx;
                self.e
                    .call_host(HostFn::CopySlice, &[ctx, dst.value, src.value]);
            }
            Stmt::ApplyReads => {
                let ctx = self.e.ctx;
                self.e.call_host(HostFn::ApplyReads, &[ctx]);
            }
            Stmt::ApplyWrites => {
                let ctx = self.e.ctx;
                self.e.call_host(HostFn::ApplyWrites, &[ctx]);
            }
        }
        Ok(())
    }
}

impl<'p> Compiler<'p> {
    pub(crate) fn build_commands(&mut self) -> Result<(), CodegenError> {
        if !self.settings.emit_exec {
            return Ok(());
        }
        let program = self.program;
        let signature = self.signature(&[self.ptr], &[types::I32]);
        for api in &program.apis {
            for (index, command) in api.commands.iter().enumerate() {
                let Some(info) = self
                    .commands
                    .get(api.index as usize)
                    .and_then(|commands| commands.get(index))
                    .cloned()
                else {
                    continue;
                };
                let Some(func) = info.func else {
                    continue;
                };
                let name = format!("{}_{}", api.name, command.name);
                tracing::trace!(command = %name, "lowering command body");
                self.define(func, signature.clone(), &name, |e| {
                    let ctx = e.ctx;
                    let base = e.load_ptr(ctx, Context::ARGUMENTS);
                    let args = Args {
                        base,
                        layout: info.args,
                        params: &command.params,
                    };
                    Body::new(e, Some(api), Some(args)).block(&command.body)?;
                    if !e.is_terminated() {
                        let ok = e.b.ins().iconst(types::I32, i64::from(ERR_SUCCESS));
                        e.ret(&[ok]);
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicIsize, Ordering};

    use gfxil_semantic::{
        BinaryOp, Block, Builtin, Command, Expr, Field, LValue, Program, ProgramBuilder, Stmt,
    };
    use proptest::prelude::*;

    use crate::runtime::{Context, ERR_ABORTED, ERR_SUCCESS};
    use crate::{CodegenError, CompiledModule, Settings, compile, test_host};

    /// A live context plus a counter of the blocks it has allocated.
    struct Harness {
        module: CompiledModule,
        live: Box<AtomicIsize>,
        ctx: *mut Context,
    }

    impl Harness {
        fn new(program: &Program) -> Self {
            let module = compile(program, &Settings::default(), &test_host::callbacks())
                .expect("program should compile");
            let live = Box::new(AtomicIsize::new(0));
            let arena = &*live as *const AtomicIsize as *mut std::ffi::c_void;
            let ctx = unsafe { (module.create_context())(arena, 1) };
            Self { module, live, ctx }
        }

        /// Runs a command with 64-bit arguments laid out by name and
        /// returns the error code and the raw result slot.
        fn run(&self, command: &str, args: &[(&str, u64)]) -> (u32, u64) {
            let entry = self.module.api(0).unwrap().command(command).unwrap();
            let mut block = vec![0u64; (entry.args.size as usize).div_ceil(8).max(1)];
            let bytes = block.as_mut_ptr() as *mut u8;
            for (name, value) in args {
                let field = entry.args.field(name).unwrap();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        value.to_le_bytes().as_ptr(),
                        bytes.add(field.offset as usize),
                        field.size as usize,
                    );
                }
            }
            let code = unsafe {
                (*self.ctx).arguments = bytes;
                (entry.func)(self.ctx)
            };
            let result = entry.result.as_ref().map_or(0, |field| {
                let mut out = [0u8; 8];
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.add(field.offset as usize),
                        out.as_mut_ptr(),
                        field.size as usize,
                    );
                }
                u64::from_le_bytes(out)
            });
            (code, result)
        }

        fn dispose(self) -> isize {
            unsafe { (self.module.destroy_context())(self.ctx) };
            self.live.load(Ordering::SeqCst)
        }
    }

    fn u32_lit(value: i64) -> Expr {
        Expr::int(Builtin::Uint32.id(), value)
    }

    #[test]
    fn commands_update_globals_and_return_results() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let u32_ty = Builtin::Uint32.id();
        builder
            .global(api, "Count", u32_ty, Some(u32_lit(5)))
            .unwrap();
        builder
            .command(
                api,
                Command::new("add")
                    .param("n", u32_ty)
                    .result(u32_ty)
                    .body(vec![
                        Stmt::assign(
                            LValue::global("Count"),
                            Expr::binary(BinaryOp::Add, Expr::global("Count"), Expr::param("n")),
                        ),
                        Stmt::Return(Some(Expr::global("Count"))),
                    ]),
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let harness = Harness::new(&program);
        assert_eq!(unsafe { (*harness.ctx).id }, 1);
        assert_eq!(harness.run("add", &[("n", 3)]), (ERR_SUCCESS, 8));
        assert_eq!(harness.run("add", &[("n", 4)]), (ERR_SUCCESS, 12));
        assert_eq!(harness.dispose(), 0);
    }

    #[test]
    fn abort_reports_the_aborted_code_and_skips_the_rest() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let u32_ty = Builtin::Uint32.id();
        builder.global(api, "Seen", u32_ty, None).unwrap();
        builder
            .command(
                api,
                Command::new("check").param("n", u32_ty).body(vec![
                    Stmt::if_else(
                        Expr::binary(BinaryOp::Gt, Expr::param("n"), u32_lit(10)),
                        vec![Stmt::Abort],
                        vec![],
                    ),
                    Stmt::assign(LValue::global("Seen"), Expr::param("n")),
                ]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("seen")
                    .result(u32_ty)
                    .body(vec![Stmt::Return(Some(Expr::global("Seen")))]),
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let harness = Harness::new(&program);
        assert_eq!(harness.run("check", &[("n", 11)]).0, ERR_ABORTED);
        assert_eq!(harness.run("seen", &[]), (ERR_SUCCESS, 0));
        assert_eq!(harness.run("check", &[("n", 7)]).0, ERR_SUCCESS);
        assert_eq!(harness.run("seen", &[]), (ERR_SUCCESS, 7));
        assert_eq!(harness.dispose(), 0);
    }

    #[test]
    fn early_returns_release_every_open_scope_once() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let u32_ty = Builtin::Uint32.id();
        builder.global(api, "Reached", u32_ty, None).unwrap();
        builder
            .command(
                api,
                Command::new("early")
                    .param("n", u32_ty)
                    .result(u32_ty)
                    .body(vec![
                        Stmt::let_("outer", Expr::string("outer")),
                        Stmt::Block(Block::new(vec![
                            Stmt::let_("inner", Expr::string("inner")),
                            Stmt::if_else(
                                Expr::binary(BinaryOp::Gt, Expr::param("n"), u32_lit(1)),
                                vec![
                                    Stmt::let_("deep", Expr::string("deep")),
                                    Stmt::Return(Some(u32_lit(1))),
                                    Stmt::assign(LValue::global("Reached"), u32_lit(1)),
                                ],
                                vec![],
                            ),
                        ])),
                        Stmt::Return(Some(u32_lit(0))),
                    ]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("reached")
                    .result(u32_ty)
                    .body(vec![Stmt::Return(Some(Expr::global("Reached")))]),
            )
            .unwrap();
        let harness = Harness::new(&builder.finish().unwrap());
        let baseline = harness.live.load(Ordering::SeqCst);

        for n in [5, 0, 2] {
            let expected = u64::from(n > 1);
            assert_eq!(harness.run("early", &[("n", n)]), (ERR_SUCCESS, expected));
            assert_eq!(harness.live.load(Ordering::SeqCst), baseline, "n = {n}");
        }
        assert_eq!(harness.run("reached", &[]).1, 0);
        assert_eq!(harness.dispose(), 0);
    }

    fn names_program() -> Program {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let u32_ty = Builtin::Uint32.id();
        let names = builder.map(api, u32_ty, Builtin::String.id());
        builder.global(api, "Names", names, None).unwrap();
        builder
            .command(
                api,
                Command::new("name").param("id", u32_ty).body(vec![
                    Stmt::let_("label", Expr::string("texture")),
                    Stmt::assign(
                        LValue::map_index(Expr::global("Names"), Expr::param("id")),
                        Expr::local("label"),
                    ),
                ]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("forget").param("id", u32_ty).body(vec![Stmt::MapRemove {
                    map: Expr::global("Names"),
                    key: Expr::param("id"),
                }]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("count")
                    .result(Builtin::Uint64.id())
                    .body(vec![Stmt::Return(Some(Expr::global("Names").length()))]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("named")
                    .param("id", u32_ty)
                    .result(Builtin::Bool.id())
                    .body(vec![Stmt::Return(Some(
                        Expr::global("Names").contains(Expr::param("id")),
                    ))]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("wipe").body(vec![Stmt::MapClear(Expr::global("Names"))]),
            )
            .unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn map_entries_own_their_strings_until_removed() {
        let harness = Harness::new(&names_program());
        // Context, globals, empty string and the map header.
        let baseline = harness.live.load(Ordering::SeqCst);

        harness.run("name", &[("id", 1)]);
        harness.run("name", &[("id", 2)]);
        harness.run("name", &[("id", 1)]);
        assert_eq!(harness.run("count", &[]).1, 2);
        assert_eq!(harness.run("named", &[("id", 2)]).1, 1);
        // Two strings plus the element array.
        assert_eq!(harness.live.load(Ordering::SeqCst), baseline + 3);

        harness.run("forget", &[("id", 2)]);
        harness.run("forget", &[("id", 9)]);
        assert_eq!(harness.run("count", &[]).1, 1);
        assert_eq!(harness.run("named", &[("id", 2)]).1, 0);
        assert_eq!(harness.live.load(Ordering::SeqCst), baseline + 2);
        assert_eq!(harness.dispose(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn maps_agree_with_a_model(ops in prop::collection::vec((any::<bool>(), 0u64..24), 0..64)) {
            let harness = Harness::new(&names_program());
            let baseline = harness.live.load(Ordering::SeqCst);
            let mut model = BTreeSet::new();
            for (insert, id) in ops {
                if insert {
                    harness.run("name", &[("id", id)]);
                    model.insert(id);
                } else {
                    harness.run("forget", &[("id", id)]);
                    model.remove(&id);
                }
                prop_assert_eq!(harness.run("count", &[]).1, model.len() as u64);
                prop_assert_eq!(harness.run("named", &[("id", id)]).1, u64::from(insert));
            }
            harness.run("wipe", &[]);
            prop_assert_eq!(harness.run("count", &[]).1, 0);
            prop_assert_eq!(harness.live.load(Ordering::SeqCst), baseline);
            prop_assert_eq!(harness.dispose(), 0);
        }
    }

    #[test]
    fn references_release_their_values_when_overwritten() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let node = builder.class(api, "Node");
        let boxed = builder.reference(api, node);
        builder
            .define_class(
                node,
                vec![
                    Field::new("label", Builtin::String.id())
                        .with_default(Expr::string("node")),
                    Field::new("next", boxed),
                ],
            )
            .unwrap();
        builder.global(api, "Head", boxed, None).unwrap();
        builder
            .command(
                api,
                Command::new("push").body(vec![
                    Stmt::let_("fresh", Expr::new_ref(boxed, Expr::Zero(node))),
                    Stmt::assign(
                        LValue::Deref(Box::new(Expr::local("fresh"))).field("next"),
                        Expr::global("Head"),
                    ),
                    Stmt::assign(LValue::global("Head"), Expr::local("fresh")),
                ]),
            )
            .unwrap();
        builder
            .command(
                api,
                Command::new("reset")
                    .body(vec![Stmt::assign(LValue::global("Head"), Expr::Zero(boxed))]),
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let harness = Harness::new(&program);
        let baseline = harness.live.load(Ordering::SeqCst);
        for _ in 0..3 {
            assert_eq!(harness.run("push", &[]).0, ERR_SUCCESS);
        }
        // Each node holds its box and its label.
        assert_eq!(harness.live.load(Ordering::SeqCst), baseline + 6);
        harness.run("reset", &[]);
        assert_eq!(harness.live.load(Ordering::SeqCst), baseline);
        assert_eq!(harness.dispose(), 0);
    }

    #[test]
    fn unknown_locals_are_rejected() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        builder
            .command(
                api,
                Command::new("broken").body(vec![Stmt::assign(
                    LValue::local("nowhere"),
                    Expr::Bool(true),
                )]),
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let err = compile(&program, &Settings::default(), &test_host::callbacks())
            .err()
            .expect("unknown locals should be rejected");
        let CodegenError::InvalidBody { function, detail } = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(function, "gles_broken");
        assert!(detail.contains("nowhere"), "{detail}");
    }
}
