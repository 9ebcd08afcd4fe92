//! Cranelift backend for gfxil programs.
//!
//! Compiles a [`Program`] into a JIT module holding:
//!
//! - native descriptors of every registered class, reference, map and
//!   slice, in both target and storage form,
//! - a reference/release function pair per reference-counted type, shared
//!   between types whose lowered layouts are identical,
//! - contains/index/lookup/remove/clear per map type,
//! - storage↔target converters for storable classes,
//! - context creation/destruction and one entry point per command.
//!
//! Generated code calls back into the host through [`HostCallbacks`].

use std::sync::Arc;

use cranelift_codegen::settings::Configurable;
use cranelift_codegen::{isa, settings};
use gfxil_abi::{Abi, LayoutError};
use gfxil_semantic::Program;
use serde::{Deserialize, Serialize};

mod body;
mod compiler;
mod context;
mod convert;
mod emit;
mod lowering;
mod maps;
mod module;
mod refcount;
pub mod runtime;
pub mod types;

pub use module::{ApiModule, CommandEntry, CompileStats, CompiledModule, FieldLayout, StructLayout};
pub use runtime::{
    CommandFn, Context, CreateContextFn, DestroyContextFn, HostCallbacks, HostFn, MapHeader, Slice,
    StringHeader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizationLevel {
    None,
    Default,
    Aggressive,
}

/// Compilation settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Settings {
    /// ABI of serialized buffers and pool memory.
    pub storage_abi: Abi,
    /// ABI of the code being generated. Must match the host's pointer size.
    pub target_abi: Abi,
    pub opt_level: OptimizationLevel,
    /// Route every reference-count change through `trace_ref_count`.
    pub debug_ref_counts: bool,
    /// Emit globals and commands. Without it only the runtime entry points
    /// are generated.
    pub emit_exec: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_abi: Abi::host(),
            target_abi: Abi::host(),
            opt_level: OptimizationLevel::Default,
            debug_ref_counts: false,
            emit_exec: true,
        }
    }
}

impl Settings {
    /// Stable key identifying the generated code.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{:?}/{}/{}",
            self.storage_abi.name,
            self.target_abi.name,
            self.opt_level,
            self.debug_ref_counts,
            self.emit_exec
        )
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error(
        "target ABI `{abi}` uses {pointer_size}-byte pointers but the host uses {host_pointer_size}"
    )]
    UnsupportedTarget {
        abi: String,
        pointer_size: u32,
        host_pointer_size: u32,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("type `{ty}` has no storage representation")]
    NotStorable { ty: String },
    #[error("ABI `{abi}` has an unsupported {what} width of {bytes} bytes")]
    UnsupportedWidth {
        abi: String,
        what: &'static str,
        bytes: u32,
    },
    #[error("map `{map}` has key type `{key}`; keys must be scalars, pointers or strings")]
    UnsupportedMapKey { map: String, key: String },
    #[error("static array `{ty}` holds reference-counted elements")]
    RefCountedArray { ty: String },
    #[error("parameter `{param}` of `{command}` has reference-counted type `{ty}`")]
    UnsupportedParam {
        command: String,
        param: String,
        ty: String,
    },
    #[error("command `{command}` returns reference-counted type `{ty}`")]
    UnsupportedResult { command: String, ty: String },
    #[error("invalid body in `{function}`: {detail}")]
    InvalidBody { function: String, detail: String },
    #[error("native struct `{name}` has no body")]
    IncompleteStruct { name: String },
    #[error("native struct `{name}` contains itself by value")]
    RecursiveStruct { name: String },
    #[error("Cranelift module error: {detail}")]
    Module { detail: String },
}

pub(crate) fn module_error(detail: impl std::fmt::Display) -> CodegenError {
    CodegenError::Module {
        detail: detail.to_string(),
    }
}

/// Compiles `program` into executable code bound to `host`.
pub fn compile(
    program: &Program,
    settings: &Settings,
    host: &HostCallbacks,
) -> Result<CompiledModule, CodegenError> {
    let span = tracing::debug_span!("compile", key = %settings.key());
    let _entered = span.enter();

    let host_pointer_size = std::mem::size_of::<usize>() as u32;
    let pointer_size = settings.target_abi.memory_layout.pointer.size;
    if pointer_size != host_pointer_size {
        return Err(CodegenError::UnsupportedTarget {
            abi: settings.target_abi.name.clone(),
            pointer_size,
            host_pointer_size,
        });
    }

    let isa = build_isa(settings)?;
    let module = compiler::Compiler::new(program, settings, isa, host)?.compile()?;
    tracing::debug!(stats = ?module.stats(), "compiled program");
    Ok(module)
}

fn build_isa(config: &Settings) -> Result<Arc<dyn isa::TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level_setting(config.opt_level))
        .map_err(module_error)?;
    flag_builder
        .set("preserve_frame_pointers", "true")
        .map_err(module_error)?;
    let isa_builder = cranelift_native::builder().map_err(|detail| CodegenError::Module {
        detail: format!("host ISA not supported: {detail}"),
    })?;
    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(module_error)
}

fn opt_level_setting(level: OptimizationLevel) -> &'static str {
    match level {
        OptimizationLevel::None => "none",
        OptimizationLevel::Default => "speed",
        OptimizationLevel::Aggressive => "speed_and_size",
    }
}

#[cfg(test)]
pub(crate) mod test_host;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_json() {
        let settings = Settings {
            storage_abi: Abi::armv7a(),
            debug_ref_counts: true,
            ..Settings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
        assert_eq!(back.key(), settings.key());
    }

    #[test]
    fn mismatched_pointer_width_is_rejected() {
        let program = gfxil_semantic::ProgramBuilder::new().finish().unwrap();
        let settings = Settings {
            target_abi: Abi::armv7a(),
            ..Settings::default()
        };
        let err = compile(&program, &settings, &test_host::callbacks())
            .err()
            .expect("32-bit target should be rejected on a 64-bit host");
        assert!(matches!(err, CodegenError::UnsupportedTarget { .. }));
    }

    #[test]
    fn host_isa_builds_for_every_opt_level() {
        for opt_level in [
            OptimizationLevel::None,
            OptimizationLevel::Default,
            OptimizationLevel::Aggressive,
        ] {
            let settings = Settings {
                opt_level,
                ..Settings::default()
            };
            build_isa(&settings).expect("host ISA should build");
        }
    }
}
