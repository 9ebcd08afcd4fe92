//! Drives one compilation: declares every generated function up front so
//! bodies may call each other in any order, then defines them and hands
//! the finalized JIT module to [`CompiledModule`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cranelift_codegen::ir::{AbiParam, Signature, Type, types};
use cranelift_codegen::isa::TargetIsa;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use gfxil_abi::align_up;
use gfxil_semantic::{Program, TypeId};

use crate::convert::Converters;
use crate::emit::Emitter;
use crate::lowering::TypeLowering;
use crate::maps::MapFuncs;
use crate::module::{
    ApiModule, CommandEntry, CompileStats, CompiledModule, FieldLayout, StructLayout,
};
use crate::refcount::RefRels;
use crate::runtime::{CommandFn, CreateContextFn, DestroyContextFn, HostCallbacks, HostFn};
use crate::types::{NativeField, NativeType, StructId};
use crate::{CodegenError, Settings, module_error};

/// Name of the argument-block field receiving a command's result.
pub(crate) const RESULT_FIELD: &str = "__result";

/// One API's slice of the globals block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalsBlock {
    pub layout: StructId,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct CommandInfo {
    pub func: Option<FuncId>,
    pub args: StructId,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextFuncs {
    pub create: FuncId,
    pub destroy: FuncId,
}

pub(crate) struct Compiler<'p> {
    pub module: JITModule,
    pub program: &'p Program,
    pub settings: Settings,
    pub lowering: TypeLowering<'p>,
    pub ptr: Type,
    host: BTreeMap<HostFn, FuncId>,
    pub refrels: RefRels,
    pub maps: HashMap<TypeId, MapFuncs>,
    pub converters: HashMap<TypeId, Converters>,
    /// Indexed by API index.
    pub globals: Vec<GlobalsBlock>,
    pub globals_size: u32,
    pub globals_align: u32,
    /// Indexed by API index, then command index.
    pub commands: Vec<Vec<CommandInfo>>,
    context: Option<ContextFuncs>,
    messages: HashMap<String, DataId>,
    names: HashSet<String>,
    symbols: Vec<(String, FuncId)>,
    pub stats: CompileStats,
}

impl<'p> Compiler<'p> {
    pub fn new(
        program: &'p Program,
        settings: &Settings,
        isa: Arc<dyn TargetIsa>,
        host: &HostCallbacks,
    ) -> Result<Self, CodegenError> {
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for function in HostFn::ALL {
            builder.symbol(function.symbol(), host.address(function));
        }
        let module = JITModule::new(builder);
        let ptr = module.target_config().pointer_type();
        let lowering = TypeLowering::new(
            &program.types,
            settings.target_abi.clone(),
            settings.storage_abi.clone(),
        );
        Ok(Self {
            module,
            program,
            settings: settings.clone(),
            lowering,
            ptr,
            host: BTreeMap::new(),
            refrels: RefRels::default(),
            maps: HashMap::new(),
            converters: HashMap::new(),
            globals: Vec::new(),
            globals_size: 0,
            globals_align: 1,
            commands: Vec::new(),
            context: None,
            messages: HashMap::new(),
            names: HashSet::new(),
            symbols: Vec::new(),
            stats: CompileStats::default(),
        })
    }

    pub fn compile(mut self) -> Result<CompiledModule, CodegenError> {
        self.lowering.declare(self.program);
        self.lowering.build()?;
        self.declare_frames()?;
        self.lowering.table.compute_layouts()?;
        self.layout_globals();

        self.declare_host()?;
        self.declare_ref_rels()?;
        self.declare_maps()?;
        self.declare_converters()?;
        self.context = Some(self.declare_context()?);
        self.declare_commands()?;

        self.build_ref_rels()?;
        self.build_maps()?;
        self.build_converters()?;
        self.build_context()?;
        self.build_commands()?;

        self.finish()
    }

    // ------------------------------------------------------------------
    // Frames: per-API globals and per-command argument blocks
    // ------------------------------------------------------------------

    fn declare_frames(&mut self) -> Result<(), CodegenError> {
        if !self.settings.emit_exec {
            return Ok(());
        }
        let program = self.program;
        let types = &program.types;
        for api in &program.apis {
            let fields = api
                .globals
                .iter()
                .map(|global| NativeField::new(global.name.clone(), self.lowering.target_type(global.ty)))
                .collect();
            let layout = self.lowering.table.declare(format!("{}•globals", api.name));
            self.lowering.table.set_body(layout, false, fields);
            self.globals.push(GlobalsBlock { layout, offset: 0 });

            let mut commands = Vec::with_capacity(api.commands.len());
            for command in &api.commands {
                let qualified = format!("{}_{}", api.name, command.name);
                let mut fields = Vec::with_capacity(command.params.len() + 1);
                for param in &command.params {
                    if types.is_ref_counted(param.ty) {
                        return Err(CodegenError::UnsupportedParam {
                            command: qualified,
                            param: param.name.clone(),
                            ty: types.name(param.ty).to_string(),
                        });
                    }
                    fields.push(NativeField::new(
                        param.name.clone(),
                        self.lowering.target_type(param.ty),
                    ));
                }
                if let Some(result) = command.result {
                    if types.is_ref_counted(result) {
                        return Err(CodegenError::UnsupportedResult {
                            command: qualified,
                            ty: types.name(result).to_string(),
                        });
                    }
                    fields.push(NativeField::new(
                        RESULT_FIELD,
                        self.lowering.target_type(result),
                    ));
                }
                let args = self.lowering.table.declare(format!("{qualified}•args"));
                self.lowering.table.set_body(args, false, fields);
                commands.push(CommandInfo { func: None, args });
            }
            self.commands.push(commands);
        }
        Ok(())
    }

    fn layout_globals(&mut self) {
        let table = &self.lowering.table;
        let mut offset = 0;
        let mut align = 1;
        for block in &mut self.globals {
            let ty = NativeType::Struct(block.layout);
            let block_align = table.align_of(&ty);
            offset = align_up(offset, block_align);
            block.offset = offset;
            offset += table.size_of(&ty);
            align = align.max(block_align);
        }
        self.globals_size = align_up(offset, align);
        self.globals_align = align.max(std::mem::align_of::<u64>() as u32);
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn declare_host(&mut self) -> Result<(), CodegenError> {
        let p = self.ptr;
        for function in HostFn::ALL {
            let (params, returns): (&[Type], &[Type]) = match function {
                HostFn::Alloc => (&[p, types::I64, types::I64], &[p]),
                HostFn::Realloc => (&[p, p, types::I64, types::I64], &[p]),
                HostFn::Free => (&[p, p], &[]),
                HostFn::MakeString => (&[p, types::I64, p], &[p]),
                HostFn::FreeString => (&[p], &[]),
                HostFn::StringCompare => (&[p, p], &[types::I32]),
                HostFn::ApplyReads | HostFn::ApplyWrites => (&[p], &[]),
                HostFn::ResolvePoolData => {
                    (&[p, types::I64, types::I64, types::I32, types::I64], &[p])
                }
                HostFn::CopySlice => (&[p, p, p], &[]),
                HostFn::CStringToSlice => (&[p, types::I64, p], &[]),
                HostFn::StoreInDatabase => (&[p, p, types::I64, p], &[]),
                HostFn::MakePool => (&[p, types::I64], &[types::I64]),
                HostFn::PoolReference | HostFn::PoolRelease => (&[p, types::I64], &[]),
                HostFn::Fatal => (&[p, p, p], &[]),
                HostFn::TraceRefCount => (&[p, p, types::I32, types::I32], &[]),
            };
            let signature = self.signature(params, returns);
            let id = self
                .module
                .declare_function(function.symbol(), Linkage::Import, &signature)
                .map_err(module_error)?;
            self.host.insert(function, id);
        }
        Ok(())
    }

    fn declare_commands(&mut self) -> Result<(), CodegenError> {
        if !self.settings.emit_exec {
            return Ok(());
        }
        let program = self.program;
        let signature = self.signature(&[self.ptr], &[types::I32]);
        for api in &program.apis {
            for (index, command) in api.commands.iter().enumerate() {
                let name = format!("{}_{}", api.name, command.name);
                let func = self.declare(&name, &signature)?;
                self.commands[api.index as usize][index].func = Some(func);
            }
        }
        self.stats.commands = self.commands.iter().map(Vec::len).sum();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    pub fn signature(&self, params: &[Type], returns: &[Type]) -> Signature {
        let mut signature = self.module.make_signature();
        signature
            .params
            .extend(params.iter().map(|ty| AbiParam::new(*ty)));
        signature
            .returns
            .extend(returns.iter().map(|ty| AbiParam::new(*ty)));
        signature
    }

    /// Makes `base` unique among generated symbol names.
    pub fn unique_name(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        let mut suffix = 1;
        while self.names.contains(&name) {
            name = format!("{base}.{suffix}");
            suffix += 1;
        }
        self.names.insert(name.clone());
        name
    }

    /// Declares an exported function under a unique name and records it in
    /// the symbol table.
    pub fn declare(&mut self, name: &str, signature: &Signature) -> Result<FuncId, CodegenError> {
        let name = self.unique_name(name);
        let id = self
            .module
            .declare_function(&name, Linkage::Export, signature)
            .map_err(module_error)?;
        self.symbols.push((name, id));
        Ok(id)
    }

    pub fn host_fn(&self, function: HostFn) -> FuncId {
        match self.host.get(&function) {
            Some(id) => *id,
            None => panic!("host function `{}` used before declaration", function.symbol()),
        }
    }

    /// NUL-terminated read-only data, shared between identical texts.
    pub fn message(&mut self, text: &str) -> Result<DataId, CodegenError> {
        if let Some(id) = self.messages.get(text) {
            return Ok(*id);
        }
        let id = self
            .module
            .declare_anonymous_data(false, false)
            .map_err(module_error)?;
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let mut description = DataDescription::new();
        description.define(bytes.into_boxed_slice());
        self.module
            .define_data(id, &description)
            .map_err(module_error)?;
        self.messages.insert(text.to_string(), id);
        Ok(id)
    }

    /// Defines the body of a previously declared function.
    pub fn define<F>(
        &mut self,
        id: FuncId,
        signature: Signature,
        name: &str,
        body: F,
    ) -> Result<(), CodegenError>
    where
        F: FnOnce(&mut Emitter<'_, 'p>) -> Result<(), CodegenError>,
    {
        let mut context = self.module.make_context();
        context.func.signature = signature;
        let mut builder_context = FunctionBuilderContext::new();
        {
            let builder = FunctionBuilder::new(&mut context.func, &mut builder_context);
            let mut emitter = Emitter::new(self, builder, name);
            body(&mut emitter)?;
            emitter.finish();
        }
        self.module
            .define_function(id, &mut context)
            .map_err(|detail| CodegenError::Module {
                detail: format!("{name}: {detail:?}"),
            })?;
        self.module.clear_context(&mut context);
        self.stats.functions += 1;
        Ok(())
    }

    fn context_funcs(&self) -> Result<ContextFuncs, CodegenError> {
        self.context.ok_or_else(|| CodegenError::Module {
            detail: "context functions were not declared".to_string(),
        })
    }

    pub fn create_context_id(&self) -> Result<FuncId, CodegenError> {
        Ok(self.context_funcs()?.create)
    }

    pub fn destroy_context_id(&self) -> Result<FuncId, CodegenError> {
        Ok(self.context_funcs()?.destroy)
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    fn struct_layout(&self, id: StructId, fields: &[(String, TypeId)]) -> StructLayout {
        let table = &self.lowering.table;
        let ty = NativeType::Struct(id);
        StructLayout {
            name: table.name(id).to_string(),
            size: table.size_of(&ty),
            align: table.align_of(&ty),
            fields: fields
                .iter()
                .filter_map(|(name, field_ty)| {
                    let (offset, native) = table.field(id, name)?;
                    Some(FieldLayout {
                        name: name.clone(),
                        ty: *field_ty,
                        offset,
                        size: table.size_of(native),
                    })
                })
                .collect(),
        }
    }

    fn class_layouts(&self) -> BTreeMap<String, (StructLayout, Option<StructLayout>)> {
        let types = &self.program.types;
        let mut layouts = BTreeMap::new();
        for &class in &self.lowering.classes {
            let Some(fields) = types.class_fields(class) else {
                continue;
            };
            let fields: Vec<_> = fields
                .iter()
                .map(|field| (field.name.clone(), field.ty))
                .collect();
            let Some(target) = self.lowering.target_struct(class) else {
                continue;
            };
            let storage = self
                .lowering
                .storage_struct(class)
                .map(|id| self.struct_layout(id, &fields));
            layouts.insert(
                types.name(class).to_string(),
                (self.struct_layout(target, &fields), storage),
            );
        }
        layouts
    }

    fn finish(mut self) -> Result<CompiledModule, CodegenError> {
        self.module.finalize_definitions().map_err(module_error)?;

        let symbols: BTreeMap<String, usize> = self
            .symbols
            .iter()
            .map(|(name, id)| (name.clone(), self.module.get_finalized_function(*id) as usize))
            .collect();
        let context = self.context_funcs()?;
        // SAFETY: both functions were declared with exactly these signatures
        // and their definitions have been finalized.
        let (create_context, destroy_context) = unsafe {
            (
                std::mem::transmute::<*const u8, CreateContextFn>(
                    self.module.get_finalized_function(context.create),
                ),
                std::mem::transmute::<*const u8, DestroyContextFn>(
                    self.module.get_finalized_function(context.destroy),
                ),
            )
        };

        let mut apis = Vec::with_capacity(self.program.apis.len());
        for api in &self.program.apis {
            let index = api.index as usize;
            let (globals_offset, globals) = match self.globals.get(index) {
                Some(block) => {
                    let fields: Vec<_> = api
                        .globals
                        .iter()
                        .map(|global| (global.name.clone(), global.ty))
                        .collect();
                    (block.offset, Some(self.struct_layout(block.layout, &fields)))
                }
                None => (0, None),
            };
            let infos = self.commands.get(index).map(Vec::as_slice).unwrap_or(&[]);
            let mut commands = Vec::with_capacity(infos.len());
            for (command_index, (command, info)) in api.commands.iter().zip(infos).enumerate() {
                let mut fields: Vec<_> = command
                    .params
                    .iter()
                    .map(|param| (param.name.clone(), param.ty))
                    .collect();
                if let Some(result) = command.result {
                    fields.push((RESULT_FIELD.to_string(), result));
                }
                let args = self.struct_layout(info.args, &fields);
                let result = command
                    .result
                    .and_then(|_| args.field(RESULT_FIELD).cloned());
                let func_id = info.func.ok_or_else(|| CodegenError::Module {
                    detail: format!("command `{}_{}` was not declared", api.name, command.name),
                })?;
                // SAFETY: commands are declared as `fn(ctx) -> i32` and finalized.
                let func = unsafe {
                    std::mem::transmute::<*const u8, CommandFn>(
                        self.module.get_finalized_function(func_id),
                    )
                };
                commands.push(CommandEntry {
                    name: command.name.clone(),
                    index: command_index as u32,
                    func,
                    args,
                    result,
                });
            }
            apis.push(ApiModule {
                name: api.name.clone(),
                index: api.index,
                globals_offset,
                globals,
                commands,
            });
        }

        let classes = self.class_layouts();
        Ok(CompiledModule::new(
            self.module,
            create_context,
            destroy_context,
            apis,
            symbols,
            classes,
            self.globals_size,
            self.globals_align,
            self.stats,
        ))
    }
}
