//! Execution environments for compiled gfxil programs.
//!
//! An [`Executor`] owns one compiled module. Each [`Env`] created from it
//! holds an isolated native context (globals, arena, memory pools) and runs
//! batches of [`Cmd`] records through the module's command entry points.
//!
//! Generated code reaches back into its Env through the host callbacks in
//! this crate, which find the Env by the id stored in the native context.
//! Invariant violations detected on either side of that boundary abort the
//! process; only command failures are returned to callers.

mod arena;
mod cmd;
mod database;
mod env;
mod executor;
mod host;
mod pools;
mod registry;

pub use arena::{Arena, ArenaStats};
pub use cmd::{Cmd, Observation, Observations};
pub use database::{ContentId, Database};
pub use env::{Env, GlobalsView};
pub use executor::Executor;
pub use gfxil_abi::Abi;
pub use gfxil_codegen::{OptimizationLevel, Settings};
pub use host::callbacks;
pub use pools::{PAGE_SIZE, Pool, PoolError, Pools};

use gfxil_codegen::CodegenError;
use gfxil_codegen::runtime::{ERR_ABORTED, ERR_SUCCESS};
use serde::{Deserialize, Serialize};

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub settings: Settings,
    /// When false, code is generated without optimisation regardless of
    /// `settings.opt_level`.
    pub optimize: bool,
    /// Keep freed native blocks zeroed until the Env is disposed, so a
    /// release after destruction trips the zero-count check instead of
    /// reading reused memory.
    pub poison_freed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            optimize: true,
            poison_freed: false,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The settings actually handed to the compiler.
    pub fn codegen_settings(&self) -> Settings {
        let mut settings = self.settings.clone();
        if !self.optimize {
            settings.opt_level = OptimizationLevel::None;
        }
        settings
    }

    pub fn key(&self) -> String {
        format!(
            "{} poison:{}",
            self.codegen_settings().key(),
            self.poison_freed
        )
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error("no API named `{0}`")]
    UnknownApi(String),
    #[error("API `{api}` has no command `{command}`")]
    UnknownCommand { api: String, command: String },
    #[error("command `{command}` has no parameter `{param}`")]
    UnknownParam { command: String, param: String },
    #[error("parameter `{param}` of `{command}` is {expected} bytes, got a {actual}-byte value")]
    ParamSize {
        command: String,
        param: String,
        expected: u32,
        actual: usize,
    },
    #[error("could not fingerprint program: {0}")]
    Fingerprint(String),
}

/// Why a command did not complete.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("command aborted")]
    Aborted,
    #[error("command failed with error code {0}")]
    Unknown(u32),
    #[error("API {api} has no command {index}")]
    Missing { api: u32, index: u32 },
}

impl CommandError {
    pub fn from_code(code: u32) -> Result<(), CommandError> {
        match code {
            ERR_SUCCESS => Ok(()),
            ERR_ABORTED => Err(CommandError::Aborted),
            other => Err(CommandError::Unknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_command_errors() {
        assert_eq!(CommandError::from_code(ERR_SUCCESS), Ok(()));
        assert_eq!(CommandError::from_code(ERR_ABORTED), Err(CommandError::Aborted));
        assert_eq!(CommandError::from_code(42), Err(CommandError::Unknown(42)));
    }

    #[test]
    fn config_keys_follow_effective_settings() {
        let optimized = Config::default();
        let plain = Config {
            optimize: false,
            ..Config::default()
        };
        assert_ne!(optimized.key(), plain.key());
        assert_eq!(plain.codegen_settings().opt_level, OptimizationLevel::None);

        let json = r#"{ "optimize": false, "poison_freed": true }"#;
        let parsed = Config::from_json(json).unwrap();
        assert_eq!(parsed.settings, Settings::default());
        assert!(parsed.poison_freed);
        assert_eq!(
            parsed.key(),
            Config {
                poison_freed: true,
                ..plain
            }
            .key()
        );
    }
}
