use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use gfxil_codegen::CompiledModule;
use gfxil_semantic::Program;
use parking_lot::Mutex;

use crate::cmd::Cmd;
use crate::database::{ContentId, Database};
use crate::env::Env;
use crate::{Config, ExecError, host};

struct Inner {
    config: Config,
    program: Program,
    module: CompiledModule,
    database: Arc<Database>,
}

/// A compiled program from which Envs are created. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("key", &self.inner.config.key())
            .field("module", &self.inner.module)
            .finish_non_exhaustive()
    }
}

type Slot = Arc<OnceLock<Result<Executor, ExecError>>>;

static CACHE: OnceLock<Mutex<HashMap<String, Slot>>> = OnceLock::new();

fn fingerprint(program: &Program) -> Result<ContentId, ExecError> {
    let bytes = serde_json::to_vec(program).map_err(|err| ExecError::Fingerprint(err.to_string()))?;
    Ok(ContentId::of(&bytes))
}

impl Executor {
    /// Compiles `program` into a fresh executor.
    pub fn compile(program: &Program, config: &Config) -> Result<Self, ExecError> {
        let span = tracing::debug_span!("executor.compile", key = %config.key());
        let _entered = span.enter();
        let module = gfxil_codegen::compile(program, &config.codegen_settings(), &host::callbacks())?;
        tracing::debug!(
            apis = module.apis().len(),
            globals_size = module.globals_size(),
            "executor ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                program: program.clone(),
                module,
                database: Arc::new(Database::new()),
            }),
        })
    }

    /// Like [`Executor::compile`], but compiles each program and
    /// configuration only once per process. Concurrent callers for the same
    /// key wait for the first compilation.
    pub fn cached(program: &Program, config: &Config) -> Result<Self, ExecError> {
        let key = format!("{} program:{}", config.key(), fingerprint(program)?);
        let slot = {
            let mut cache = CACHE.get_or_init(Default::default).lock();
            Arc::clone(cache.entry(key).or_default())
        };
        slot.get_or_init(|| Self::compile(program, config)).clone()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn program(&self) -> &Program {
        &self.inner.program
    }

    pub fn module(&self) -> &CompiledModule {
        &self.inner.module
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.inner.database
    }

    /// Address of a generated entry point such as `gfxil_string_release`.
    pub fn symbol(&self, name: &str) -> Option<*const u8> {
        self.inner.module.symbol(name)
    }

    pub fn new_env(&self) -> Env {
        Env::new(self.clone())
    }

    /// A record for command `name` of `api` with zeroed arguments.
    pub fn command(&self, api: &str, name: &str) -> Result<Cmd, ExecError> {
        let module = self
            .inner
            .module
            .api_by_name(api)
            .ok_or_else(|| ExecError::UnknownApi(api.to_string()))?;
        let entry = module
            .command(name)
            .ok_or_else(|| ExecError::UnknownCommand {
                api: api.to_string(),
                command: name.to_string(),
            })?;
        Ok(Cmd::new(
            entry.name.clone(),
            module.index,
            entry.index,
            entry.args.clone(),
            entry.result.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use gfxil_semantic::{Builtin, Command, Expr, ProgramBuilder, Stmt};

    use super::*;

    fn program(vendor: &str) -> Program {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        builder
            .global(api, "Vendor", Builtin::String.id(), Some(Expr::string(vendor)))
            .unwrap();
        builder
            .command(api, Command::new("glFinish").body(vec![Stmt::ApplyReads]))
            .unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn cached_executors_are_shared_per_program_and_config() {
        let config = Config::default();
        let a = Executor::cached(&program("a"), &config).unwrap();
        let again = Executor::cached(&program("a"), &config).unwrap();
        let b = Executor::cached(&program("b"), &config).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &again.inner));
        assert!(!Arc::ptr_eq(&a.inner, &b.inner));

        let unoptimized = Config {
            optimize: false,
            ..Config::default()
        };
        let c = Executor::cached(&program("a"), &unoptimized).unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
    }

    #[test]
    fn commands_are_looked_up_by_name() {
        let executor = Executor::compile(&program("a"), &Config::default()).unwrap();
        let cmd = executor.command("gles", "glFinish").unwrap();
        assert_eq!((cmd.api(), cmd.index()), (0, 0));
        assert_eq!(
            executor.command("vulkan", "vkQueueSubmit").err(),
            Some(ExecError::UnknownApi("vulkan".into()))
        );
        assert!(matches!(
            executor.command("gles", "glFlush"),
            Err(ExecError::UnknownCommand { .. })
        ));
        assert!(executor.symbol("gfxil_create_context").is_some());
        assert!(executor.symbol("gles_glFinish").is_some());
    }
}
