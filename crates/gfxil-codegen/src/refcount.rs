//! Reference/release synthesis.
//!
//! Every reference-counted semantic type gets its own named pair of entry
//! points. Bodies are only built once per mangled native type: the first
//! type seen with a given mangled name owns the canonical implementation
//! and every type (the owner included) forwards to it.

use std::collections::{BTreeMap, HashMap};
use std::mem::offset_of;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{InstBuilder, Value, types};
use cranelift_module::FuncId;
use gfxil_semantic::{Builtin, TypeId, TypeKind, Types};

use crate::compiler::Compiler;
use crate::emit::Emitter;
use crate::runtime::{
    HostFn, SLICE_REFERENCE, SLICE_RELEASE, STRING_REFERENCE, STRING_RELEASE, Slice,
};
use crate::types::NativeType;
use crate::{CodegenError, module_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefRel {
    pub reference: FuncId,
    pub release: FuncId,
}

#[derive(Debug, Clone, Copy)]
struct Canonical {
    owner: TypeId,
    funcs: RefRel,
}

#[derive(Debug, Clone)]
struct Delegate {
    name: String,
    funcs: RefRel,
    target: RefRel,
}

#[derive(Debug, Default)]
pub(crate) struct RefRels {
    string: Option<RefRel>,
    slice: Option<RefRel>,
    tys: HashMap<TypeId, RefRel>,
    canonical: BTreeMap<String, Canonical>,
    delegates: Vec<Delegate>,
}

impl RefRels {
    /// The entry points for `ty`.
    ///
    /// # Panics
    /// If `ty` is reference counted but no API registered it.
    pub fn pair(&self, types: &Types, ty: TypeId) -> RefRel {
        let ty = types.underlying(ty);
        let found = match types.kind(ty) {
            TypeKind::Builtin(Builtin::String) => self.string,
            TypeKind::Slice { .. } => self.slice,
            _ => self.tys.get(&ty).copied(),
        };
        match found {
            Some(pair) => pair,
            None => panic!(
                "no reference/release registered for `{}`",
                types.name(ty)
            ),
        }
    }
}

enum Direction {
    Reference,
    Release,
}

/// Null check, zero check, count update and, on release reaching zero,
/// `destroy`.
fn counted<'e, 'p, F>(
    e: &mut Emitter<'e, 'p>,
    name: &str,
    object: Value,
    direction: Direction,
    destroy: F,
) -> Result<(), CodegenError>
where
    F: FnOnce(&mut Emitter<'e, 'p>) -> Result<(), CodegenError>,
{
    let null = e.is_null(object);
    let live = e.b.create_block();
    let done = e.b.create_block();
    e.b.ins().brif(null, done, &[], live, &[]);
    e.b.switch_to_block(live);

    let count = e.load(types::I32, object, 0);
    let released = e.b.ins().icmp_imm(IntCC::Equal, count, 0);
    let message = match direction {
        Direction::Reference => format!("Attempting to reference released {name}"),
        Direction::Release => {
            format!("Attempting to release {name} with no remaining references!")
        }
    };
    e.fatal_if(released, &message, object)?;

    let delta = match direction {
        Direction::Reference => 1,
        Direction::Release => -1,
    };
    let updated = e.b.ins().iadd_imm(count, delta);
    if e.c.settings.debug_ref_counts {
        let type_name = e.message(name)?;
        e.call_host(HostFn::TraceRefCount, &[type_name, object, count, updated]);
    }
    e.store(updated, object, 0);
    if let Direction::Release = direction {
        let dead = e.b.ins().icmp_imm(IntCC::Equal, updated, 0);
        e.if_then(dead, destroy)?;
    }
    e.b.ins().jump(done, &[]);
    e.b.switch_to_block(done);
    e.ret(&[]);
    Ok(())
}

fn slice_pool<'e, 'p>(e: &mut Emitter<'e, 'p>, host: HostFn) -> Result<(), CodegenError> {
    let slice = e.params[1];
    let pool = e.load(types::I64, slice, offset_of!(Slice, pool) as u32);
    let counted = e.b.ins().icmp_imm(IntCC::NotEqual, pool, 0);
    e.if_then(counted, |e| {
        let ctx = e.ctx;
        e.call_host(host, &[ctx, pool]);
        Ok(())
    })?;
    e.ret(&[]);
    Ok(())
}

impl<'p> Compiler<'p> {
    pub(crate) fn declare_ref_rels(&mut self) -> Result<(), CodegenError> {
        let signature = self.signature(&[self.ptr, self.ptr], &[]);
        self.refrels.string = Some(RefRel {
            reference: self.declare(STRING_REFERENCE, &signature)?,
            release: self.declare(STRING_RELEASE, &signature)?,
        });
        self.refrels.slice = Some(RefRel {
            reference: self.declare(SLICE_REFERENCE, &signature)?,
            release: self.declare(SLICE_RELEASE, &signature)?,
        });

        let program = self.program;
        let types = &program.types;
        for api in &program.apis {
            let classes = api
                .classes
                .iter()
                .filter(|class| types.is_ref_counted(**class));
            for &ty in api.references.iter().chain(&api.maps).chain(classes) {
                let ty = types.underlying(ty);
                if self.refrels.tys.contains_key(&ty) {
                    continue;
                }
                let mangled = self
                    .lowering
                    .table
                    .mangle(&self.lowering.target_type(ty));
                let target = match self.refrels.canonical.get(&mangled) {
                    Some(canonical) => canonical.funcs,
                    None => {
                        let funcs = RefRel {
                            reference: self.declare(&format!("{mangled}•reference"), &signature)?,
                            release: self.declare(&format!("{mangled}•release"), &signature)?,
                        };
                        self.refrels
                            .canonical
                            .insert(mangled, Canonical { owner: ty, funcs });
                        funcs
                    }
                };
                let name = format!("{}_{}", api.name, types.name(ty));
                let funcs = RefRel {
                    reference: self.declare(&format!("{name}_reference"), &signature)?,
                    release: self.declare(&format!("{name}_release"), &signature)?,
                };
                self.refrels.delegates.push(Delegate {
                    name,
                    funcs,
                    target,
                });
                self.refrels.tys.insert(ty, funcs);
            }
        }
        self.stats.canonical_ref_rels = self.refrels.canonical.len();
        self.stats.delegating_ref_rels = self.refrels.delegates.len();
        tracing::trace!(
            canonical = self.stats.canonical_ref_rels,
            delegating = self.stats.delegating_ref_rels,
            "declared reference/release pairs"
        );
        Ok(())
    }

    pub(crate) fn build_ref_rels(&mut self) -> Result<(), CodegenError> {
        let signature = self.signature(&[self.ptr, self.ptr], &[]);
        let (Some(string), Some(slice)) = (self.refrels.string, self.refrels.slice) else {
            return Err(module_error("runtime reference/release pairs were not declared"));
        };

        self.define(string.reference, signature.clone(), STRING_REFERENCE, |e| {
            let object = e.params[1];
            counted(e, "string", object, Direction::Reference, |_| Ok(()))
        })?;
        self.define(string.release, signature.clone(), STRING_RELEASE, |e| {
            let object = e.params[1];
            counted(e, "string", object, Direction::Release, |e| {
                e.call_host(HostFn::FreeString, &[object]);
                Ok(())
            })
        })?;
        self.define(slice.reference, signature.clone(), SLICE_REFERENCE, |e| {
            slice_pool(e, HostFn::PoolReference)
        })?;
        self.define(slice.release, signature.clone(), SLICE_RELEASE, |e| {
            slice_pool(e, HostFn::PoolRelease)
        })?;

        let canonicals: Vec<_> = self
            .refrels
            .canonical
            .iter()
            .map(|(mangled, canonical)| (mangled.clone(), *canonical))
            .collect();
        for (mangled, canonical) in canonicals {
            self.build_canonical(&mangled, canonical, &signature)?;
        }

        for delegate in self.refrels.delegates.clone() {
            let Delegate {
                name,
                funcs,
                target,
            } = delegate;
            for (function, forward, suffix) in [
                (funcs.reference, target.reference, "reference"),
                (funcs.release, target.release, "release"),
            ] {
                self.define(
                    function,
                    signature.clone(),
                    &format!("{name}_{suffix}"),
                    |e| {
                        let (ctx, object) = (e.params[0], e.params[1]);
                        e.call(forward, &[ctx, object]);
                        e.ret(&[]);
                        Ok(())
                    },
                )?;
            }
        }
        Ok(())
    }

    fn build_canonical(
        &mut self,
        mangled: &str,
        canonical: Canonical,
        signature: &cranelift_codegen::ir::Signature,
    ) -> Result<(), CodegenError> {
        let program = self.program;
        let types = &program.types;
        let owner = canonical.owner;
        let name = types.name(owner).to_string();
        let reference_name = format!("{mangled}•reference");
        let release_name = format!("{mangled}•release");
        let table = &self.lowering.table;

        match types.kind(owner) {
            TypeKind::Reference { to } => {
                let to = *to;
                let Some(id) = self.lowering.refs.get(&owner).copied() else {
                    panic!("reference `{name}` was not lowered");
                };
                let value = table.field_offset(id, "value");
                let arena = table.field_offset(id, "arena");
                self.define(
                    canonical.funcs.reference,
                    signature.clone(),
                    &reference_name,
                    |e| {
                        let object = e.params[1];
                        counted(e, &name, object, Direction::Reference, |_| Ok(()))
                    },
                )?;
                self.define(canonical.funcs.release, signature.clone(), &release_name, |e| {
                    let object = e.params[1];
                    counted(e, &name, object, Direction::Release, |e| {
                        let addr = e.addr_at(object, value);
                        let held = e.operand_at(to, addr);
                        e.release(held);
                        let arena = e.load_ptr(object, arena);
                        e.call_host(HostFn::Free, &[arena, object]);
                        Ok(())
                    })
                })?;
            }
            TypeKind::Map { .. } => {
                let Some(clear) = self.maps.get(&owner).map(|funcs| funcs.clear) else {
                    panic!("map `{name}` has no operations");
                };
                let Some(shape) = self.lowering.maps.get(&owner).copied() else {
                    panic!("map `{name}` was not lowered");
                };
                let arena = table.field_offset(shape.header, "arena");
                self.define(
                    canonical.funcs.reference,
                    signature.clone(),
                    &reference_name,
                    |e| {
                        let object = e.params[1];
                        counted(e, &name, object, Direction::Reference, |_| Ok(()))
                    },
                )?;
                self.define(canonical.funcs.release, signature.clone(), &release_name, |e| {
                    let object = e.params[1];
                    counted(e, &name, object, Direction::Release, |e| {
                        let ctx = e.ctx;
                        e.call(clear, &[ctx, object]);
                        let arena = e.load_ptr(object, arena);
                        e.call_host(HostFn::Free, &[arena, object]);
                        Ok(())
                    })
                })?;
            }
            TypeKind::Class { fields } => {
                let NativeType::Struct(id) = self.lowering.target_type(owner) else {
                    panic!("class `{name}` did not lower to a struct");
                };
                let counted_fields: Vec<(TypeId, u32)> = fields
                    .iter()
                    .filter(|field| types.is_ref_counted(field.ty))
                    .map(|field| (field.ty, table.field_offset(id, &field.name)))
                    .collect();
                for (function, function_name, reference) in [
                    (canonical.funcs.reference, &reference_name, true),
                    (canonical.funcs.release, &release_name, false),
                ] {
                    let counted_fields = counted_fields.clone();
                    self.define(function, signature.clone(), function_name, |e| {
                        let object = e.params[1];
                        for (ty, offset) in counted_fields {
                            let addr = e.addr_at(object, offset);
                            let held = e.operand_at(ty, addr);
                            if reference {
                                e.reference(held);
                            } else {
                                e.release(held);
                            }
                        }
                        e.ret(&[]);
                        Ok(())
                    })?;
                }
            }
            other => panic!("`{name}` ({other:?}) has no canonical reference/release"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gfxil_semantic::{Builtin, Field, ProgramBuilder};

    use crate::{Settings, compile, test_host};

    #[test]
    fn structurally_identical_classes_share_one_implementation() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        for name in ["Shader", "Program"] {
            let class = builder.class(api, name);
            builder
                .define_class(
                    class,
                    vec![
                        Field::new("label", Builtin::String.id()),
                        Field::new("id", Builtin::Uint32.id()),
                    ],
                )
                .unwrap();
        }
        let program = builder.finish().unwrap();
        let module = compile(&program, &Settings::default(), &test_host::callbacks())
            .expect("program should compile");

        assert_eq!(module.stats().canonical_ref_rels, 1);
        assert_eq!(module.stats().delegating_ref_rels, 2);
        for symbol in [
            "gles_Shader_reference",
            "gles_Shader_release",
            "gles_Program_reference",
            "gles_Program_release",
            "gfxil_string_reference",
            "gfxil_slice_release",
        ] {
            assert!(module.symbol(symbol).is_some(), "missing `{symbol}`");
        }
    }

    #[test]
    fn slices_never_share_code_with_same_shaped_classes() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let u64_ty = Builtin::Uint64.id();
        let bytes = builder.slice(api, Builtin::Uint8.id());
        let extent = builder.class(api, "Extent");
        builder
            .define_class(
                extent,
                ["a", "b", "c", "d", "e"]
                    .into_iter()
                    .map(|name| Field::new(name, u64_ty))
                    .collect(),
            )
            .unwrap();
        let region = builder.class(api, "Region");
        builder
            .define_class(
                region,
                vec![
                    Field::new("extent", extent),
                    Field::new("label", Builtin::String.id()),
                ],
            )
            .unwrap();
        let staging = builder.class(api, "Staging");
        builder
            .define_class(
                staging,
                vec![
                    Field::new("data", bytes),
                    Field::new("label", Builtin::String.id()),
                ],
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let module = compile(&program, &Settings::default(), &test_host::callbacks())
            .expect("program should compile");

        assert_eq!(module.stats().canonical_ref_rels, 2);
        assert_eq!(module.stats().delegating_ref_rels, 2);
    }

    #[test]
    fn plain_classes_get_no_reference_functions() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let class = builder.class(api, "Rect");
        builder
            .define_class(
                class,
                vec![
                    Field::new("x", Builtin::Int32.id()),
                    Field::new("y", Builtin::Int32.id()),
                ],
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let module = compile(&program, &Settings::default(), &test_host::callbacks())
            .expect("program should compile");
        assert_eq!(module.stats().canonical_ref_rels, 0);
        assert!(module.symbol("gles_Rect_reference").is_none());
    }

    #[test]
    fn self_referential_reference_types_compile() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let node = builder.class(api, "Node");
        let next = builder.reference(api, node);
        builder
            .define_class(
                node,
                vec![
                    Field::new("value", Builtin::Uint32.id()),
                    Field::new("next", next),
                ],
            )
            .unwrap();
        let program = builder.finish().unwrap();
        let module = compile(&program, &Settings::default(), &test_host::callbacks())
            .expect("recursive types should compile");
        assert!(module.symbol("gles_ref!Node_release").is_some());
        assert!(module.symbol("gles_Node_release").is_some());
    }

    #[test]
    fn string_counts_survive_a_reference_release_pair() {
        let program = ProgramBuilder::new().finish().unwrap();
        let module = compile(&program, &Settings::default(), &test_host::callbacks())
            .expect("empty program should compile");
        let reference = module.symbol("gfxil_string_reference").unwrap();
        let release = module.symbol("gfxil_string_release").unwrap();
        unsafe {
            let ctx = (module.create_context())(std::ptr::null_mut(), 7);
            assert_eq!((*ctx).id, 7);
            let string = (*ctx).empty_string;
            assert_eq!((*string).ref_count, 1);
            let reference: extern "C" fn(*mut crate::Context, *mut u8) =
                std::mem::transmute(reference);
            let release: extern "C" fn(*mut crate::Context, *mut u8) =
                std::mem::transmute(release);
            reference(ctx, string.cast());
            assert_eq!((*string).ref_count, 2);
            release(ctx, string.cast());
            assert_eq!((*string).ref_count, 1);
            reference(ctx, std::ptr::null_mut());
            (module.destroy_context())(ctx);
        }
    }
}
