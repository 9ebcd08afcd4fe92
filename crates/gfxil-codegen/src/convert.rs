//! Copies between the packed storage form of a class and its in-memory
//! target form. Only emitted when the two ABIs differ.

use cranelift_codegen::ir::{InstBuilder, Value, types};
use cranelift_module::FuncId;
use gfxil_semantic::TypeId;

use crate::CodegenError;
use crate::compiler::Compiler;
use crate::emit::Emitter;
use crate::types::{NativeType, StructId};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Converters {
    pub storage: StructId,
    pub target: StructId,
    pub to_target: FuncId,
    pub to_storage: FuncId,
}

/// Copies one value from `src` laid out as `from` into `dst` laid out as
/// `to`, converting scalars and recursing through arrays and classes.
pub(crate) fn convert_value(
    e: &mut Emitter<'_, '_>,
    from: &NativeType,
    src: Value,
    to: &NativeType,
    dst: Value,
) -> Result<(), CodegenError> {
    match (from, to) {
        (NativeType::Struct(a), NativeType::Struct(b)) if a == b => {
            let size = e.c.lowering.table.size_of(from);
            e.copy_bytes(dst, src, size);
        }
        (NativeType::Struct(a), NativeType::Struct(b)) => {
            let converter = e.c.converters.values().find_map(|converters| {
                if converters.storage == *a && converters.target == *b {
                    Some(converters.to_target)
                } else if converters.target == *a && converters.storage == *b {
                    Some(converters.to_storage)
                } else {
                    None
                }
            });
            let Some(converter) = converter else {
                let table = &e.c.lowering.table;
                return Err(e.invalid(format!(
                    "no conversion from `{}` to `{}`",
                    table.name(*a),
                    table.name(*b)
                )));
            };
            let ctx = e.ctx;
            e.call(converter, &[ctx, src, dst]);
        }
        (NativeType::Array(from_elem, count), NativeType::Array(to_elem, _)) => {
            if from_elem == to_elem {
                let size = e.c.lowering.table.size_of(from);
                e.copy_bytes(dst, src, size);
                return Ok(());
            }
            let from_stride = e.c.lowering.table.stride_of(from_elem);
            let to_stride = e.c.lowering.table.stride_of(to_elem);
            let count = e.b.ins().iconst(types::I64, i64::from(*count));
            e.for_n(count, |e, index| {
                let src_offset = e.b.ins().imul_imm(index, i64::from(from_stride));
                let dst_offset = e.b.ins().imul_imm(index, i64::from(to_stride));
                let src = e.b.ins().iadd(src, src_offset);
                let dst = e.b.ins().iadd(dst, dst_offset);
                convert_value(e, from_elem, src, to_elem, dst)
            })?;
        }
        _ => {
            let (Some(load), Some(_)) = (e.clif(from), e.clif(to)) else {
                return Err(e.invalid("aggregate and scalar representations differ"));
            };
            let value = e.load(load, src, 0);
            let value = e.convert_scalar(value, from, to);
            e.store(value, dst, 0);
        }
    }
    Ok(())
}

impl<'p> Compiler<'p> {
    pub(crate) fn declare_converters(&mut self) -> Result<(), CodegenError> {
        if self.lowering.same_abi() {
            return Ok(());
        }
        let program = self.program;
        let signature = self.signature(&[self.ptr, self.ptr, self.ptr], &[]);
        for class in self.lowering.classes.clone() {
            let (Some(storage), Some(target)) = (
                self.lowering.storage_struct(class),
                self.lowering.target_struct(class),
            ) else {
                continue;
            };
            let name = program.types.name(class);
            let converters = Converters {
                storage,
                target,
                to_target: self.declare(&format!("S_{name}•copy_to_target"), &signature)?,
                to_storage: self.declare(&format!("T_{name}•copy_to_storage"), &signature)?,
            };
            self.converters.insert(class, converters);
        }
        self.stats.converters = self.converters.len();
        Ok(())
    }

    pub(crate) fn build_converters(&mut self) -> Result<(), CodegenError> {
        let program = self.program;
        let mut classes: Vec<(TypeId, Converters)> = self
            .converters
            .iter()
            .map(|(class, converters)| (*class, *converters))
            .collect();
        classes.sort_by_key(|(class, _)| *class);
        let signature = self.signature(&[self.ptr, self.ptr, self.ptr], &[]);
        for (class, converters) in classes {
            let Some(fields) = program.types.class_fields(class) else {
                continue;
            };
            let table = &self.lowering.table;
            let mut pairs = Vec::with_capacity(fields.len());
            for field in fields {
                let storage = table.field(converters.storage, &field.name);
                let target = table.field(converters.target, &field.name);
                if let (Some(storage), Some(target)) = (storage, target) {
                    pairs.push(((storage.0, storage.1.clone()), (target.0, target.1.clone())));
                }
            }
            let name = program.types.name(class);

            let to_target = pairs.clone();
            self.define(
                converters.to_target,
                signature.clone(),
                &format!("S_{name}•copy_to_target"),
                |e| {
                    let (src, dst) = (e.params[1], e.params[2]);
                    for ((storage_offset, storage), (target_offset, target)) in &to_target {
                        let from = e.addr_at(src, *storage_offset);
                        let into = e.addr_at(dst, *target_offset);
                        convert_value(e, storage, from, target, into)?;
                    }
                    e.ret(&[]);
                    Ok(())
                },
            )?;
            self.define(
                converters.to_storage,
                signature.clone(),
                &format!("T_{name}•copy_to_storage"),
                |e| {
                    let (src, dst) = (e.params[1], e.params[2]);
                    for ((storage_offset, storage), (target_offset, target)) in &pairs {
                        let from = e.addr_at(src, *target_offset);
                        let into = e.addr_at(dst, *storage_offset);
                        convert_value(e, target, from, storage, into)?;
                    }
                    e.ret(&[]);
                    Ok(())
                },
            )?;
        }
        Ok(())
    }
}
