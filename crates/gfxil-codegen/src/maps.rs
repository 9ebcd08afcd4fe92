//! Map operations: linear-scan tables of `{key, value}` elements that grow
//! by [`MAP_GROW_BY`] slots at a time.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{InstBuilder, Value, types};
use cranelift_module::FuncId;
use gfxil_semantic::{Builtin, TypeId};

use crate::body::Body;
use crate::compiler::Compiler;
use crate::emit::{Emitter, Operand, clif_type};
use crate::lowering::MapShape;
use crate::runtime::{HostFn, MAP_GROW_BY};
use crate::types::NativeType;
use crate::CodegenError;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MapFuncs {
    /// API whose name prefixes the functions; map initial values are
    /// evaluated in its scope.
    pub api: usize,
    pub contains: FuncId,
    pub index: FuncId,
    pub lookup: FuncId,
    pub remove: FuncId,
    pub clear: FuncId,
}

/// Field offsets of one map type's header and elements.
#[derive(Debug, Clone, Copy)]
struct Layout {
    key_ty: TypeId,
    value_ty: TypeId,
    count: u32,
    capacity: u32,
    elements: u32,
    arena: u32,
    key: u32,
    value: u32,
    stride: u32,
    align: u32,
}

impl Layout {
    fn new(c: &Compiler<'_>, shape: MapShape) -> Self {
        let table = &c.lowering.table;
        let element = NativeType::Struct(shape.element);
        Self {
            key_ty: shape.key,
            value_ty: shape.value,
            count: table.field_offset(shape.header, "count"),
            capacity: table.field_offset(shape.header, "capacity"),
            elements: table.field_offset(shape.header, "elements"),
            arena: table.field_offset(shape.header, "arena"),
            key: table.field_offset(shape.element, "key"),
            value: table.field_offset(shape.element, "value"),
            stride: table.stride_of(&element),
            align: table.align_of(&element),
        }
    }

    fn element(&self, e: &mut Emitter<'_, '_>, elements: Value, index: Value) -> Value {
        let offset = e.b.ins().imul_imm(index, i64::from(self.stride));
        e.b.ins().iadd(elements, offset)
    }
}

/// Equality under the key type's semantics: strings by content, floats by
/// IEEE comparison, everything else bitwise.
fn keys_equal(e: &mut Emitter<'_, '_>, key_ty: TypeId, a: Value, b: Value) -> Value {
    if e.c.program.types.as_builtin(key_ty) == Some(Builtin::String) {
        let order = e.call_host1(HostFn::StringCompare, &[a, b]);
        return e.b.ins().icmp_imm(IntCC::Equal, order, 0);
    }
    match e.native(key_ty) {
        NativeType::F32 | NativeType::F64 => e.b.ins().fcmp(FloatCC::Equal, a, b),
        _ => e.b.ins().icmp(IntCC::Equal, a, b),
    }
}

/// Calls `found(element, index, elements)` for the first element whose key
/// equals `key`. `found` must leave the block filled.
fn scan<'e, 'p, F>(
    e: &mut Emitter<'e, 'p>,
    layout: Layout,
    map: Value,
    key: Value,
    mut found: F,
) -> Result<(), CodegenError>
where
    F: FnMut(&mut Emitter<'e, 'p>, Value, Value, Value) -> Result<(), CodegenError>,
{
    let count = e.load(types::I64, map, layout.count);
    let elements = e.load_ptr(map, layout.elements);
    e.for_n(count, |e, index| {
        let element = layout.element(e, elements, index);
        let key_native = e.native(layout.key_ty);
        let key_clif = e.clif(&key_native).unwrap_or(types::I64);
        let stored = e.load(key_clif, element, layout.key);
        let equal = keys_equal(e, layout.key_ty, stored, key);
        e.if_then(equal, |e| found(e, element, index, elements))
    })
}

/// Writes a fresh default value of `ty` to `dst` and takes one reference
/// to it.
fn store_initial(
    e: &mut Emitter<'_, '_>,
    api: Option<&gfxil_semantic::Api>,
    ty: TypeId,
    dst: Value,
) -> Result<(), CodegenError> {
    e.push_scope();
    let value = Body::new(e, api, None).initial_value(ty)?;
    e.store_operand(value, dst);
    let held = e.operand_at(ty, dst);
    e.reference(held);
    e.pop_scope();
    Ok(())
}

impl<'p> Compiler<'p> {
    pub(crate) fn declare_maps(&mut self) -> Result<(), CodegenError> {
        let program = self.program;
        let types = &program.types;
        let p = self.ptr;
        for (api_index, api) in program.apis.iter().enumerate() {
            for &map in &api.maps {
                let map = types.underlying(map);
                if self.maps.contains_key(&map) {
                    continue;
                }
                let Some(shape) = self.lowering.maps.get(&map).copied() else {
                    continue;
                };
                let key_native = self.lowering.target_type(shape.key);
                let Some(key) = clif_type(&key_native, p) else {
                    return Err(CodegenError::UnsupportedMapKey {
                        map: types.name(map).to_string(),
                        key: types.name(shape.key).to_string(),
                    });
                };
                let base = format!("{}_{}", api.name, types.name(map));
                let contains = self.signature(&[p, p, key], &[types::I8]);
                let index = self.signature(&[p, p, key, types::I8], &[p]);
                let lookup = self.signature(&[p, p, key, p], &[]);
                let remove = self.signature(&[p, p, key], &[]);
                let clear = self.signature(&[p, p], &[]);
                let funcs = MapFuncs {
                    api: api_index,
                    contains: self.declare(&format!("{base}•contains"), &contains)?,
                    index: self.declare(&format!("{base}•index"), &index)?,
                    lookup: self.declare(&format!("{base}•lookup"), &lookup)?,
                    remove: self.declare(&format!("{base}•remove"), &remove)?,
                    clear: self.declare(&format!("{base}•clear"), &clear)?,
                };
                self.maps.insert(map, funcs);
            }
        }
        self.stats.map_types = self.maps.len();
        Ok(())
    }

    pub(crate) fn build_maps(&mut self) -> Result<(), CodegenError> {
        let program = self.program;
        let mut maps: Vec<_> = self.maps.iter().map(|(ty, funcs)| (*ty, *funcs)).collect();
        maps.sort_by_key(|(ty, _)| *ty);
        for (map, funcs) in maps {
            let Some(shape) = self.lowering.maps.get(&map).copied() else {
                continue;
            };
            let layout = Layout::new(self, shape);
            let api = program.apis.get(funcs.api);
            let name = format!(
                "{}_{}",
                api.map(|api| api.name.as_str()).unwrap_or_default(),
                program.types.name(map)
            );
            let p = self.ptr;
            let key = clif_type(&self.lowering.target_type(shape.key), p).unwrap_or(types::I64);

            let signature = self.signature(&[p, p, key], &[types::I8]);
            self.define(funcs.contains, signature, &format!("{name}•contains"), |e| {
                let (map, key) = (e.params[1], e.params[2]);
                scan(e, layout, map, key, |e, _, _, _| {
                    let yes = e.b.ins().iconst(types::I8, 1);
                    e.ret(&[yes]);
                    Ok(())
                })?;
                let no = e.b.ins().iconst(types::I8, 0);
                e.ret(&[no]);
                Ok(())
            })?;

            let signature = self.signature(&[p, p, key, types::I8], &[p]);
            self.define(funcs.index, signature, &format!("{name}•index"), |e| {
                let (map, key, add) = (e.params[1], e.params[2], e.params[3]);
                scan(e, layout, map, key, |e, element, _, _| {
                    let value = e.addr_at(element, layout.value);
                    e.ret(&[value]);
                    Ok(())
                })?;
                let lookup_only = e.b.ins().icmp_imm(IntCC::Equal, add, 0);
                e.if_then(lookup_only, |e| {
                    let null = e.null();
                    e.ret(&[null]);
                    Ok(())
                })?;

                let count = e.load(types::I64, map, layout.count);
                let capacity = e.load(types::I64, map, layout.capacity);
                let full = e
                    .b
                    .ins()
                    .icmp(IntCC::UnsignedGreaterThanOrEqual, count, capacity);
                e.if_then(full, |e| {
                    let grown = e.b.ins().iadd_imm(capacity, MAP_GROW_BY as i64);
                    let bytes = e.b.ins().imul_imm(grown, i64::from(layout.stride));
                    let align = e.b.ins().iconst(types::I64, i64::from(layout.align));
                    let arena = e.load_ptr(map, layout.arena);
                    let elements = e.load_ptr(map, layout.elements);
                    let empty = e.is_null(elements);
                    e.if_else(
                        empty,
                        |e| {
                            let fresh = e.call_host1(HostFn::Alloc, &[arena, bytes, align]);
                            e.store(fresh, map, layout.elements);
                            Ok(())
                        },
                        |e| {
                            let moved =
                                e.call_host1(HostFn::Realloc, &[arena, elements, bytes, align]);
                            e.store(moved, map, layout.elements);
                            Ok(())
                        },
                    )?;
                    e.store(grown, map, layout.capacity);
                    Ok(())
                })?;

                let elements = e.load_ptr(map, layout.elements);
                let element = layout.element(e, elements, count);
                let key_addr = e.addr_at(element, layout.key);
                e.store(key, key_addr, 0);
                e.reference(Operand::new(layout.key_ty, key));
                let value = e.addr_at(element, layout.value);
                store_initial(e, api, layout.value_ty, value)?;
                let next = e.b.ins().iadd_imm(count, 1);
                e.store(next, map, layout.count);
                e.ret(&[value]);
                Ok(())
            })?;

            let signature = self.signature(&[p, p, key, p], &[]);
            let index = funcs.index;
            self.define(funcs.lookup, signature, &format!("{name}•lookup"), |e| {
                let (ctx, map, key, out) = (e.params[0], e.params[1], e.params[2], e.params[3]);
                let no = e.b.ins().iconst(types::I8, 0);
                let found = e.call1(index, &[ctx, map, key, no]);
                let missing = e.is_null(found);
                e.if_else(
                    missing,
                    |e| store_initial(e, api, layout.value_ty, out),
                    |e| {
                        // `index` hands back the value slot, not the element.
                        let value = e.operand_at(layout.value_ty, found);
                        e.store_operand(value, out);
                        let held = e.operand_at(layout.value_ty, out);
                        e.reference(held);
                        Ok(())
                    },
                )?;
                e.ret(&[]);
                Ok(())
            })?;

            let signature = self.signature(&[p, p, key], &[]);
            self.define(funcs.remove, signature, &format!("{name}•remove"), |e| {
                let (map, key) = (e.params[1], e.params[2]);
                scan(e, layout, map, key, |e, element, index, elements| {
                    let key_addr = e.addr_at(element, layout.key);
                    let held_key = e.operand_at(layout.key_ty, key_addr);
                    e.release(held_key);
                    let value_addr = e.addr_at(element, layout.value);
                    let held_value = e.operand_at(layout.value_ty, value_addr);
                    e.release(held_value);

                    let count = e.load(types::I64, map, layout.count);
                    let last = e.b.ins().iadd_imm(count, -1);
                    let moved = e.b.ins().icmp(IntCC::NotEqual, index, last);
                    e.if_then(moved, |e| {
                        let tail = layout.element(e, elements, last);
                        e.copy_bytes(element, tail, layout.stride);
                        Ok(())
                    })?;
                    e.store(last, map, layout.count);
                    e.ret(&[]);
                    Ok(())
                })?;
                e.ret(&[]);
                Ok(())
            })?;

            let signature = self.signature(&[p, p], &[]);
            self.define(funcs.clear, signature, &format!("{name}•clear"), |e| {
                let map = e.params[1];
                let count = e.load(types::I64, map, layout.count);
                let elements = e.load_ptr(map, layout.elements);
                e.for_n(count, |e, index| {
                    let element = layout.element(e, elements, index);
                    let key_addr = e.addr_at(element, layout.key);
                    let held_key = e.operand_at(layout.key_ty, key_addr);
                    e.release(held_key);
                    let value_addr = e.addr_at(element, layout.value);
                    let held_value = e.operand_at(layout.value_ty, value_addr);
                    e.release(held_value);
                    Ok(())
                })?;
                let allocated = e.b.ins().icmp_imm(IntCC::NotEqual, elements, 0);
                e.if_then(allocated, |e| {
                    let arena = e.load_ptr(map, layout.arena);
                    e.call_host(HostFn::Free, &[arena, elements]);
                    Ok(())
                })?;
                let zero = e.b.ins().iconst(types::I64, 0);
                e.store(zero, map, layout.count);
                e.store(zero, map, layout.capacity);
                let null = e.null();
                e.store(null, map, layout.elements);
                e.ret(&[]);
                Ok(())
            })?;
        }
        Ok(())
    }
}
