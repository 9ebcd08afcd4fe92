//! `gfxil_create_context` / `gfxil_destroy_context`.

use cranelift_codegen::ir::{InstBuilder, types};
use gfxil_semantic::{Api, Builtin, Global};

use crate::CodegenError;
use crate::body::Body;
use crate::compiler::{Compiler, ContextFuncs};
use crate::emit::Operand;
use crate::runtime::{CREATE_CONTEXT, Context, DESTROY_CONTEXT, HostFn};

impl<'p> Compiler<'p> {
    pub(crate) fn declare_context(&mut self) -> Result<ContextFuncs, CodegenError> {
        let create = self.signature(&[self.ptr, types::I32], &[self.ptr]);
        let destroy = self.signature(&[self.ptr], &[]);
        Ok(ContextFuncs {
            create: self.declare(CREATE_CONTEXT, &create)?,
            destroy: self.declare(DESTROY_CONTEXT, &destroy)?,
        })
    }

    /// Every global with its offset from the start of the globals block.
    fn global_slots(&self) -> Vec<(&'p Api, &'p Global, u32)> {
        let program = self.program;
        let table = &self.lowering.table;
        let mut slots = Vec::new();
        for api in &program.apis {
            let Some(block) = self.globals.get(api.index as usize) else {
                continue;
            };
            for global in &api.globals {
                let offset = block.offset + table.field_offset(block.layout, &global.name);
                slots.push((api, global, offset));
            }
        }
        slots
    }

    pub(crate) fn build_context(&mut self) -> Result<(), CodegenError> {
        let slots = self.global_slots();
        let (globals_size, globals_align) = (self.globals_size, self.globals_align);
        let size = std::mem::size_of::<Context>() as u32;
        let align = std::mem::align_of::<Context>() as u32;

        let signature = self.signature(&[self.ptr, types::I32], &[self.ptr]);
        let create = self.create_context_id()?;
        self.define(create, signature, CREATE_CONTEXT, |e| {
            let (arena, id) = (e.params[0], e.params[1]);
            let ctx = e.alloc(arena, size, align);
            e.store(id, ctx, Context::ID);
            e.store(arena, ctx, Context::ARENA);
            e.ctx = ctx;

            let length = e.b.ins().iconst(types::I64, 0);
            let null = e.null();
            let empty = e.call_host1(HostFn::MakeString, &[arena, length, null]);
            e.store(empty, ctx, Context::EMPTY_STRING);

            if globals_size > 0 {
                let globals = e.alloc(arena, globals_size, globals_align);
                e.store(globals, ctx, Context::GLOBALS);
                e.push_scope();
                for (api, global, offset) in &slots {
                    let mut body = Body::new(e, Some(*api), None);
                    let value = match &global.default {
                        Some(default) => body.expr(default)?,
                        None => body.initial_value(global.ty)?,
                    };
                    let slot = e.addr_at(globals, *offset);
                    e.store_operand(value, slot);
                    let held = e.operand_at(global.ty, slot);
                    e.reference(held);
                }
                e.pop_scope();
            }
            e.ret(&[ctx]);
            Ok(())
        })?;

        let signature = self.signature(&[self.ptr], &[]);
        let destroy = self.destroy_context_id()?;
        self.define(destroy, signature, DESTROY_CONTEXT, |e| {
            let ctx = e.ctx;
            let arena = e.arena();
            if globals_size > 0 {
                let globals = e.load_ptr(ctx, Context::GLOBALS);
                for (_, global, offset) in slots.iter().rev() {
                    let slot = e.addr_at(globals, *offset);
                    let held = e.operand_at(global.ty, slot);
                    e.release(held);
                }
                e.call_host(HostFn::Free, &[arena, globals]);
            }
            let empty = e.load_ptr(ctx, Context::EMPTY_STRING);
            e.release(Operand::new(Builtin::String.id(), empty));
            e.call_host(HostFn::Free, &[arena, ctx]);
            e.ret(&[]);
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicIsize, Ordering};

    use gfxil_semantic::{Builtin, Expr, Field, ProgramBuilder};

    use crate::runtime::StringHeader;
    use crate::{Settings, compile, test_host};

    #[test]
    fn globals_are_primed_from_defaults_and_released_on_destroy() {
        let mut builder = ProgramBuilder::new();
        let gles = builder.api("gles");
        let vulkan = builder.api("vulkan");
        let state = builder.class(gles, "State");
        builder
            .define_class(
                state,
                vec![
                    Field::new("width", Builtin::Uint32.id()).with_default(Expr::int(
                        Builtin::Uint32.id(),
                        640,
                    )),
                    Field::new("label", Builtin::String.id()),
                ],
            )
            .unwrap();
        let names = builder.map(vulkan, Builtin::Uint64.id(), Builtin::String.id());
        builder
            .global(gles, "Vendor", Builtin::String.id(), Some(Expr::string("gfxil")))
            .unwrap();
        builder.global(gles, "Current", state, None).unwrap();
        builder.global(vulkan, "Names", names, None).unwrap();
        let program = builder.finish().unwrap();

        let module = compile(&program, &Settings::default(), &test_host::callbacks())
            .expect("program should compile");
        let gles = module.api_by_name("gles").unwrap();
        let vulkan = module.api_by_name("vulkan").unwrap();
        assert!(vulkan.globals_offset >= gles.globals.as_ref().unwrap().size);

        let live = AtomicIsize::new(0);
        let arena = &live as *const AtomicIsize as *mut std::ffi::c_void;
        unsafe {
            let ctx = (module.create_context())(arena, 42);
            assert_eq!((*ctx).id, 42);
            assert_eq!((*ctx).arena, arena);

            let layout = gles.globals.as_ref().unwrap();
            let base = (*ctx).globals.add(gles.globals_offset as usize);
            let vendor = *(base.add(layout.field("Vendor").unwrap().offset as usize)
                as *const *const StringHeader);
            assert_eq!(StringHeader::bytes(vendor), b"gfxil");
            assert_eq!((*vendor).ref_count, 1);

            let current = base.add(layout.field("Current").unwrap().offset as usize);
            let state = module.target_layout("State").unwrap();
            let width = *(current.add(state.field("width").unwrap().offset as usize) as *const u32);
            assert_eq!(width, 640);
            let label = *(current.add(state.field("label").unwrap().offset as usize)
                as *const *const StringHeader);
            assert_eq!(label, (*ctx).empty_string as *const StringHeader);
            // Held by the context and by `Current.label`.
            assert_eq!((*label).ref_count, 2);

            // Context, globals block, empty string, vendor and the map.
            assert_eq!(live.load(Ordering::SeqCst), 5);
            (module.destroy_context())(ctx);
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn runtime_only_modules_still_create_contexts() {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        builder
            .global(api, "Unused", Builtin::Uint32.id(), None)
            .unwrap();
        let program = builder.finish().unwrap();
        let settings = Settings {
            emit_exec: false,
            ..Settings::default()
        };
        let module =
            compile(&program, &settings, &test_host::callbacks()).expect("program should compile");
        assert_eq!(module.globals_size(), 0);
        assert!(module.api(0).unwrap().globals.is_none());
        let live = AtomicIsize::new(0);
        let arena = &live as *const AtomicIsize as *mut std::ffi::c_void;
        unsafe {
            let ctx = (module.create_context())(arena, 3);
            assert!((*ctx).globals.is_null());
            (module.destroy_context())(ctx);
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
