use std::collections::BTreeMap;

use cranelift_jit::JITModule;
use gfxil_semantic::TypeId;
use serde::Serialize;

use crate::runtime::{CommandFn, CreateContextFn, DestroyContextFn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldLayout {
    pub name: String,
    pub ty: TypeId,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructLayout {
    pub name: String,
    pub size: u32,
    pub align: u32,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompileStats {
    /// Reference/release pairs with a real body.
    pub canonical_ref_rels: usize,
    /// Per-type pairs that forward to a canonical pair.
    pub delegating_ref_rels: usize,
    pub map_types: usize,
    pub converters: usize,
    pub commands: usize,
    pub functions: usize,
}

#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub name: String,
    pub index: u32,
    pub func: CommandFn,
    /// Layout of the argument block read through `Context::arguments`.
    pub args: StructLayout,
    pub result: Option<FieldLayout>,
}

#[derive(Debug, Clone)]
pub struct ApiModule {
    pub name: String,
    pub index: u32,
    /// Offset of this API's globals within the globals block.
    pub globals_offset: u32,
    pub globals: Option<StructLayout>,
    pub commands: Vec<CommandEntry>,
}

impl ApiModule {
    pub fn command(&self, name: &str) -> Option<&CommandEntry> {
        self.commands.iter().find(|command| command.name == name)
    }
}

/// Finalized native code for one program.
pub struct CompiledModule {
    jit: Option<JITModule>,
    create_context: CreateContextFn,
    destroy_context: DestroyContextFn,
    apis: Vec<ApiModule>,
    symbols: BTreeMap<String, usize>,
    classes: BTreeMap<String, (StructLayout, Option<StructLayout>)>,
    globals_size: u32,
    globals_align: u32,
    stats: CompileStats,
}

// SAFETY: the JIT module is only held so its memory can be freed on drop;
// after finalization the generated code is immutable and every entry point
// takes its mutable state through an explicit context pointer.
unsafe impl Send for CompiledModule {}
unsafe impl Sync for CompiledModule {}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("apis", &self.apis)
            .field("symbols", &self.symbols.len())
            .field("globals_size", &self.globals_size)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl CompiledModule {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        jit: JITModule,
        create_context: CreateContextFn,
        destroy_context: DestroyContextFn,
        apis: Vec<ApiModule>,
        symbols: BTreeMap<String, usize>,
        classes: BTreeMap<String, (StructLayout, Option<StructLayout>)>,
        globals_size: u32,
        globals_align: u32,
        stats: CompileStats,
    ) -> Self {
        Self {
            jit: Some(jit),
            create_context,
            destroy_context,
            apis,
            symbols,
            classes,
            globals_size,
            globals_align,
            stats,
        }
    }

    pub fn create_context(&self) -> CreateContextFn {
        self.create_context
    }

    pub fn destroy_context(&self) -> DestroyContextFn {
        self.destroy_context
    }

    pub fn apis(&self) -> &[ApiModule] {
        &self.apis
    }

    pub fn api(&self, index: u32) -> Option<&ApiModule> {
        self.apis.get(index as usize)
    }

    pub fn api_by_name(&self, name: &str) -> Option<&ApiModule> {
        self.apis.iter().find(|api| api.name == name)
    }

    /// Address of a generated function.
    pub fn symbol(&self, name: &str) -> Option<*const u8> {
        self.symbols.get(name).map(|address| *address as *const u8)
    }

    pub fn symbol_names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    /// In-memory layout of a class while compiled code runs.
    pub fn target_layout(&self, class: &str) -> Option<&StructLayout> {
        self.classes.get(class).map(|(target, _)| target)
    }

    /// Packed layout of a class in storage buffers.
    pub fn storage_layout(&self, class: &str) -> Option<&StructLayout> {
        self.classes.get(class).and_then(|(_, storage)| storage.as_ref())
    }

    pub fn globals_size(&self) -> u32 {
        self.globals_size
    }

    pub fn globals_align(&self) -> u32 {
        self.globals_align
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }
}

impl Drop for CompiledModule {
    fn drop(&mut self) {
        if let Some(jit) = self.jit.take() {
            // SAFETY: function pointers handed out by this module must not
            // outlive it; owners drop their contexts before the module.
            unsafe { jit.free_memory() };
        }
    }
}
