//! Execution environments.

use std::sync::Arc;

use bytemuck::Pod;
use gfxil_codegen::runtime::{
    APPLICATION_POOL, CMD_FLAG_HAS_READS, CMD_FLAG_HAS_WRITES, Context, MapHeader, Slice,
    StringHeader,
};
use gfxil_codegen::{CompiledModule, StructLayout};
use gfxil_semantic::{Builtin, TypeKind, Types};
use parking_lot::Mutex;

use crate::arena::{Arena, ArenaStats};
use crate::cmd::{Cmd, Observation, Observations};
use crate::database::{ContentId, Database};
use crate::executor::Executor;
use crate::host::fatal;
use crate::pools::{PoolError, Pools};
use crate::registry::registry;
use crate::CommandError;

/// A write buffer handed to generated code, copied into its pool at the
/// next callback or when the command returns.
#[derive(Debug)]
struct PendingWrite {
    pool: u64,
    addr: u64,
    buffer: usize,
    size: u64,
}

#[derive(Debug, Default)]
struct State {
    pools: Pools,
    /// Pool-read buffers handed out during the current command.
    read_buffers: Vec<usize>,
    last_cmd_id: Option<u64>,
    pending: Vec<PendingWrite>,
    /// Observations of the batch being executed, by `Context::cmd_idx`.
    batch: Vec<Option<Arc<Observations>>>,
}

/// The part of an Env reachable from host callbacks through the registry.
#[derive(Debug)]
pub(crate) struct Shared {
    pub id: u32,
    /// Backs every object generated code allocates.
    pub arena: Arena,
    /// Backs pool-read and pool-write buffers.
    scratch: Arena,
    pub database: Arc<Database>,
    state: Mutex<State>,
}

fn or_fatal<T>(env: u32, result: Result<T, PoolError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(Some(env), &err.to_string()),
    }
}

impl Shared {
    fn new(id: u32, poison_freed: bool, database: Arc<Database>) -> Self {
        Self {
            id,
            arena: Arena::new("env").poisoning(poison_freed),
            scratch: Arena::new("scratch"),
            database,
            state: Mutex::new(State::default()),
        }
    }

    fn flush(&self, state: &mut State) {
        for write in std::mem::take(&mut state.pending) {
            let data =
                unsafe { std::slice::from_raw_parts(write.buffer as *const u8, write.size as usize) };
            let pool = or_fatal(self.id, state.pools.get_mut(write.pool));
            or_fatal(self.id, pool.write(write.addr, data));
            self.scratch.free(write.buffer as *mut u8);
        }
    }

    /// Locks the state with every pending write applied.
    fn state(&self) -> parking_lot::MutexGuard<'_, State> {
        let mut state = self.state.lock();
        self.flush(&mut state);
        state
    }

    pub fn finish_command(&self) {
        drop(self.state());
    }

    /// Copies `size` bytes of `pool` at `addr` into a scratch buffer that
    /// stays valid until the context moves to another command.
    pub fn read_pool_data(&self, ctx: &Context, pool: u64, addr: u64, size: u64) -> *mut u8 {
        let mut state = self.state();
        if state.last_cmd_id != Some(ctx.cmd_id) {
            state.last_cmd_id = Some(ctx.cmd_id);
            if !state.read_buffers.is_empty() {
                tracing::trace!(
                    env = self.id,
                    buffers = state.read_buffers.len(),
                    "command changed, freeing pool-read buffers"
                );
                for buffer in state.read_buffers.drain(..) {
                    self.scratch.free(buffer as *mut u8);
                }
            }
        }
        let buffer = self.scratch.alloc(size, 16);
        let out = unsafe { std::slice::from_raw_parts_mut(buffer, size as usize) };
        let source = or_fatal(self.id, state.pools.get(pool));
        or_fatal(self.id, source.read(addr, out));
        state.read_buffers.push(buffer as usize);
        buffer
    }

    /// A zeroed buffer whose contents are written to `pool` at `addr` once
    /// generated code has filled it.
    pub fn write_pool_data(&self, pool: u64, addr: u64, size: u64) -> *mut u8 {
        let mut state = self.state();
        or_fatal(self.id, state.pools.get(pool));
        let buffer = self.scratch.alloc(size, 16);
        state.pending.push(PendingWrite {
            pool,
            addr,
            buffer: buffer as usize,
            size,
        });
        buffer
    }

    fn apply(&self, ctx: &Context, flag: u32, pick: fn(&Observations) -> &[Observation]) {
        if ctx.cmd_flags & flag == 0 {
            return;
        }
        let mut state = self.state();
        let Some(Some(observations)) = state.batch.get(ctx.cmd_idx as usize).cloned() else {
            return;
        };
        let application = state.pools.application();
        for observation in pick(&observations) {
            or_fatal(
                self.id,
                application.write(observation.address, &observation.data),
            );
        }
    }

    pub fn apply_reads(&self, ctx: &Context) {
        self.apply(ctx, CMD_FLAG_HAS_READS, |observations| observations.reads.as_slice());
    }

    pub fn apply_writes(&self, ctx: &Context) {
        self.apply(ctx, CMD_FLAG_HAS_WRITES, |observations| observations.writes.as_slice());
    }

    pub fn copy_slice(&self, dst: &Slice, src: &Slice) {
        let mut state = self.state();
        let size = dst.size.min(src.size);
        or_fatal(
            self.id,
            state.pools.copy(dst.pool, dst.base, src.pool, src.base, size),
        );
    }

    /// A byte slice over the NUL-terminated string at `ptr` in application
    /// memory, terminator included.
    pub fn cstring_to_slice(&self, ptr: u64) -> Slice {
        let mut state = self.state();
        let size = or_fatal(self.id, state.pools.application().strlen(ptr)) + 1;
        Slice {
            pool: APPLICATION_POOL,
            root: ptr,
            base: ptr,
            size,
            count: size,
        }
    }

    pub fn store_in_database(&self, data: &[u8]) -> ContentId {
        self.database.store(data)
    }

    pub fn make_pool(&self, size: u64) -> u64 {
        let id = self.state().pools.make(size);
        tracing::debug!(env = self.id, pool = id, size, "created pool");
        id
    }

    pub fn pool_reference(&self, pool: u64) {
        or_fatal(self.id, self.state().pools.reference(pool));
    }

    pub fn pool_release(&self, pool: u64) {
        let remaining = or_fatal(self.id, self.state().pools.release(pool));
        if remaining == 0 {
            tracing::debug!(env = self.id, pool, "released pool");
        }
    }
}

/// One isolated execution of a compiled program.
///
/// An Env is driven by one thread at a time; independent Envs may run
/// concurrently.
#[derive(Debug)]
pub struct Env {
    executor: Executor,
    shared: Arc<Shared>,
    ctx: *mut Context,
}

// SAFETY: the context is only touched through `&mut self` or by generated
// code running on the thread that called `execute_n`.
unsafe impl Send for Env {}

impl Env {
    pub(crate) fn new(executor: Executor) -> Self {
        let poison_freed = executor.config().poison_freed;
        let database = Arc::clone(executor.database());
        let shared = registry().register(|id| Shared::new(id, poison_freed, database));
        let create = executor.module().create_context();
        let ctx = unsafe { create(shared.arena.as_native(), shared.id) };
        tracing::debug!(env = shared.id, "created Env");
        Self {
            executor,
            shared,
            ctx,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The native context generated code runs against.
    pub fn context(&self) -> *mut Context {
        self.ctx
    }

    fn module(&self) -> &CompiledModule {
        self.executor.module()
    }

    pub fn execute(&mut self, id: u64, cmd: &mut Cmd) -> Result<(), CommandError> {
        let mut results = self.execute_n(id, std::slice::from_mut(cmd));
        results.pop().unwrap_or(Ok(()))
    }

    /// Runs `cmds` in order, the i-th with command id `first_id + i`.
    ///
    /// Returns one result per command. A failing command does not stop the
    /// batch.
    pub fn execute_n(&mut self, first_id: u64, cmds: &mut [Cmd]) -> Vec<Result<(), CommandError>> {
        let span = tracing::debug_span!("execute", env = self.id(), first_id, count = cmds.len());
        let _entered = span.enter();

        self.shared.state.lock().batch = cmds
            .iter()
            .map(|cmd| cmd.observations.clone())
            .collect();

        let mut results = Vec::with_capacity(cmds.len());
        for (idx, cmd) in cmds.iter_mut().enumerate() {
            let entry = self
                .module()
                .api(cmd.api)
                .and_then(|api| api.commands.get(cmd.index as usize))
                .filter(|entry| entry.index == cmd.index);
            let Some(func) = entry.map(|entry| entry.func) else {
                tracing::debug!(api = cmd.api, index = cmd.index, "no entry point for command");
                results.push(Err(CommandError::Missing {
                    api: cmd.api,
                    index: cmd.index,
                }));
                continue;
            };
            let id = first_id + idx as u64;
            let code = unsafe {
                let ctx = &mut *self.ctx;
                ctx.thread = cmd.thread;
                ctx.cmd_id = id;
                ctx.cmd_idx = idx as u64;
                ctx.cmd_flags = cmd.flags();
                ctx.arguments = cmd.arguments();
                func(self.ctx)
            };
            self.shared.finish_command();
            let result = CommandError::from_code(code);
            if let Err(err) = &result {
                tracing::debug!(command = cmd.name(), id, %err, "command failed");
            }
            results.push(result);
        }

        unsafe { (*self.ctx).arguments = std::ptr::null_mut() };
        self.shared.state.lock().batch.clear();
        results
    }

    /// The whole globals block.
    pub fn globals(&self) -> &[u8] {
        let size = self.module().globals_size() as usize;
        let base = unsafe { (*self.ctx).globals };
        if base.is_null() || size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(base, size) }
    }

    /// The globals of one API.
    pub fn api_globals(&self, api: &str) -> Option<GlobalsView<'_>> {
        let module = self.module().api_by_name(api)?;
        let layout = module.globals.as_ref()?;
        let start = module.globals_offset as usize;
        let bytes = self.globals().get(start..start + layout.size as usize)?;
        Some(GlobalsView {
            bytes,
            layout,
            types: &self.executor.program().types,
        })
    }

    pub fn read_memory(&self, pool: u64, addr: u64, size: u64) -> Result<Vec<u8>, PoolError> {
        self.shared.state().pools.get(pool)?.read_vec(addr, size)
    }

    pub fn write_memory(&self, pool: u64, addr: u64, data: &[u8]) -> Result<(), PoolError> {
        self.shared.state().pools.get_mut(pool)?.write(addr, data)
    }

    pub fn with_pools<R>(&self, f: impl FnOnce(&mut Pools) -> R) -> R {
        f(&mut self.shared.state().pools)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.shared.database
    }

    /// Blocks held by generated code.
    pub fn arena_stats(&self) -> ArenaStats {
        self.shared.arena.stats()
    }

    /// Pool-read and pool-write buffers still held.
    pub fn scratch_stats(&self) -> ArenaStats {
        self.shared.scratch.stats()
    }

    /// Destroys the native context and unregisters the Env.
    pub fn dispose(self) {}
}

impl Drop for Env {
    fn drop(&mut self) {
        let destroy = self.module().destroy_context();
        unsafe { destroy(self.ctx) };
        registry().remove(self.shared.id);
        tracing::debug!(
            env = self.shared.id,
            leaked = self.shared.arena.stats().live,
            "disposed Env"
        );
    }
}

/// Typed access to one API's globals.
#[derive(Debug, Clone, Copy)]
pub struct GlobalsView<'a> {
    bytes: &'a [u8],
    layout: &'a StructLayout,
    types: &'a Types,
}

impl<'a> GlobalsView<'a> {
    pub fn layout(&self) -> &'a StructLayout {
        self.layout
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The raw value of global `name`, if it is exactly `T`'s size.
    pub fn get<T: Pod>(&self, name: &str) -> Option<T> {
        let field = self.layout.field(name)?;
        if std::mem::size_of::<T>() != field.size as usize {
            return None;
        }
        let offset = field.offset as usize;
        let bytes = self.bytes.get(offset..offset + field.size as usize)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    fn pointer(&self, name: &str) -> Option<*const u8> {
        self.get::<usize>(name).map(|address| address as *const u8)
    }

    pub fn string(&self, name: &str) -> Option<String> {
        let field = self.layout.field(name)?;
        if self.types.as_builtin(field.ty) != Some(Builtin::String) {
            return None;
        }
        let string = self.pointer(name)?.cast::<StringHeader>();
        if string.is_null() {
            return None;
        }
        let bytes = unsafe { StringHeader::bytes(string) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// A copy of the header of map global `name`.
    pub fn map(&self, name: &str) -> Option<MapHeader> {
        let field = self.layout.field(name)?;
        if !matches!(self.types.underlying_kind(field.ty), TypeKind::Map { .. }) {
            return None;
        }
        let map = self.pointer(name)?.cast::<MapHeader>();
        if map.is_null() {
            return None;
        }
        Some(unsafe { *map })
    }
}
