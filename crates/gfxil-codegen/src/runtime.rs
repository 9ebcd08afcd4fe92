//! Data shared between generated code and the host.
//!
//! Every struct here is `#[repr(C)]` and is read or written by generated
//! code at fixed offsets; the native type table describes the same layouts.

use std::ffi::c_void;
use std::mem::offset_of;

/// Command completed.
pub const ERR_SUCCESS: u32 = 0;
/// Command body executed `abort`.
pub const ERR_ABORTED: u32 = 1;

/// Bits of [`Context::cmd_flags`].
pub const CMD_FLAG_HAS_READS: u32 = 1;
pub const CMD_FLAG_HAS_WRITES: u32 = 2;

/// Access kinds passed to `resolve_pool_data`.
pub const ACCESS_READ: u32 = 1;
pub const ACCESS_WRITE: u32 = 2;

/// The application pool: the traced process's own address space.
pub const APPLICATION_POOL: u64 = 0;

/// Per-Env native execution context.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub id: u32,
    pub cmd_flags: u32,
    pub cmd_id: u64,
    pub cmd_idx: u64,
    pub thread: u64,
    pub globals: *mut u8,
    pub arena: *mut c_void,
    pub arguments: *mut u8,
    pub empty_string: *mut StringHeader,
}

impl Context {
    pub const ID: u32 = offset_of!(Context, id) as u32;
    pub const GLOBALS: u32 = offset_of!(Context, globals) as u32;
    pub const ARENA: u32 = offset_of!(Context, arena) as u32;
    pub const ARGUMENTS: u32 = offset_of!(Context, arguments) as u32;
    pub const EMPTY_STRING: u32 = offset_of!(Context, empty_string) as u32;
}

/// Header of a heap string; `length` bytes of data plus a NUL follow it.
#[repr(C)]
#[derive(Debug)]
pub struct StringHeader {
    pub ref_count: u32,
    pub arena: *mut c_void,
    pub length: u64,
    pub data: [u8; 0],
}

impl StringHeader {
    /// # Safety
    /// `this` must point to a live string produced by `make_string`.
    pub unsafe fn bytes<'a>(this: *const StringHeader) -> &'a [u8] {
        unsafe {
            let len = (*this).length as usize;
            let data = this.cast::<u8>().add(offset_of!(StringHeader, data));
            std::slice::from_raw_parts(data, len)
        }
    }
}

/// A window onto a memory pool.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slice {
    pub pool: u64,
    pub root: u64,
    pub base: u64,
    pub size: u64,
    pub count: u64,
}

/// Header of a map; `elements` points at `capacity` `{key, value}` slots.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MapHeader {
    pub ref_count: u32,
    pub arena: *mut c_void,
    pub count: u64,
    pub capacity: u64,
    pub elements: *mut u8,
}

/// Prefix shared by every boxed reference; the value follows, aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RefHeader {
    pub ref_count: u32,
    pub arena: *mut c_void,
}

/// Number of slots a map grows by when full.
pub const MAP_GROW_BY: u64 = 16;

pub const CREATE_CONTEXT: &str = "gfxil_create_context";
pub const DESTROY_CONTEXT: &str = "gfxil_destroy_context";
pub const STRING_REFERENCE: &str = "gfxil_string_reference";
pub const STRING_RELEASE: &str = "gfxil_string_release";
pub const SLICE_REFERENCE: &str = "gfxil_slice_reference";
pub const SLICE_RELEASE: &str = "gfxil_slice_release";

pub type CreateContextFn = unsafe extern "C" fn(arena: *mut c_void, env: u32) -> *mut Context;
pub type DestroyContextFn = unsafe extern "C" fn(ctx: *mut Context);
pub type CommandFn = unsafe extern "C" fn(ctx: *mut Context) -> u32;

/// Functions the host provides to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostFn {
    Alloc,
    Realloc,
    Free,
    MakeString,
    FreeString,
    StringCompare,
    ApplyReads,
    ApplyWrites,
    ResolvePoolData,
    CopySlice,
    CStringToSlice,
    StoreInDatabase,
    MakePool,
    PoolReference,
    PoolRelease,
    Fatal,
    TraceRefCount,
}

impl HostFn {
    pub const ALL: [HostFn; 17] = [
        HostFn::Alloc,
        HostFn::Realloc,
        HostFn::Free,
        HostFn::MakeString,
        HostFn::FreeString,
        HostFn::StringCompare,
        HostFn::ApplyReads,
        HostFn::ApplyWrites,
        HostFn::ResolvePoolData,
        HostFn::CopySlice,
        HostFn::CStringToSlice,
        HostFn::StoreInDatabase,
        HostFn::MakePool,
        HostFn::PoolReference,
        HostFn::PoolRelease,
        HostFn::Fatal,
        HostFn::TraceRefCount,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            HostFn::Alloc => "gfxil_alloc",
            HostFn::Realloc => "gfxil_realloc",
            HostFn::Free => "gfxil_free",
            HostFn::MakeString => "gfxil_make_string",
            HostFn::FreeString => "gfxil_free_string",
            HostFn::StringCompare => "gfxil_string_compare",
            HostFn::ApplyReads => "gfxil_apply_reads",
            HostFn::ApplyWrites => "gfxil_apply_writes",
            HostFn::ResolvePoolData => "gfxil_resolve_pool_data",
            HostFn::CopySlice => "gfxil_copy_slice",
            HostFn::CStringToSlice => "gfxil_cstring_to_slice",
            HostFn::StoreInDatabase => "gfxil_store_in_database",
            HostFn::MakePool => "gfxil_make_pool",
            HostFn::PoolReference => "gfxil_pool_reference",
            HostFn::PoolRelease => "gfxil_pool_release",
            HostFn::Fatal => "gfxil_fatal",
            HostFn::TraceRefCount => "gfxil_trace_ref_count",
        }
    }
}

/// Addresses of the host implementations of every [`HostFn`].
///
/// `arena` arguments are the opaque pointers stored in [`Context::arena`]
/// and in heap headers. Allocations are zero-filled.
#[derive(Debug, Clone, Copy)]
pub struct HostCallbacks {
    pub alloc: unsafe extern "C" fn(arena: *mut c_void, size: u64, align: u64) -> *mut u8,
    pub realloc:
        unsafe extern "C" fn(arena: *mut c_void, ptr: *mut u8, size: u64, align: u64) -> *mut u8,
    pub free: unsafe extern "C" fn(arena: *mut c_void, ptr: *mut u8),
    pub make_string:
        unsafe extern "C" fn(arena: *mut c_void, length: u64, data: *const u8) -> *mut StringHeader,
    pub free_string: unsafe extern "C" fn(string: *mut StringHeader),
    pub string_compare: unsafe extern "C" fn(a: *const StringHeader, b: *const StringHeader) -> i32,
    pub apply_reads: unsafe extern "C" fn(ctx: *mut Context),
    pub apply_writes: unsafe extern "C" fn(ctx: *mut Context),
    pub resolve_pool_data:
        unsafe extern "C" fn(ctx: *mut Context, pool: u64, ptr: u64, access: u32, size: u64) -> *mut u8,
    pub copy_slice: unsafe extern "C" fn(ctx: *mut Context, dst: *const Slice, src: *const Slice),
    pub cstring_to_slice: unsafe extern "C" fn(ctx: *mut Context, ptr: u64, out: *mut Slice),
    pub store_in_database:
        unsafe extern "C" fn(ctx: *mut Context, data: *const u8, size: u64, id_out: *mut u8),
    pub make_pool: unsafe extern "C" fn(ctx: *mut Context, size: u64) -> u64,
    pub pool_reference: unsafe extern "C" fn(ctx: *mut Context, pool: u64),
    pub pool_release: unsafe extern "C" fn(ctx: *mut Context, pool: u64),
    pub fatal: unsafe extern "C" fn(ctx: *mut Context, message: *const u8, object: *const u8),
    pub trace_ref_count:
        unsafe extern "C" fn(type_name: *const u8, object: *const u8, old: u32, new: u32),
}

impl HostCallbacks {
    pub fn address(&self, function: HostFn) -> *const u8 {
        match function {
            HostFn::Alloc => self.alloc as *const u8,
            HostFn::Realloc => self.realloc as *const u8,
            HostFn::Free => self.free as *const u8,
            HostFn::MakeString => self.make_string as *const u8,
            HostFn::FreeString => self.free_string as *const u8,
            HostFn::StringCompare => self.string_compare as *const u8,
            HostFn::ApplyReads => self.apply_reads as *const u8,
            HostFn::ApplyWrites => self.apply_writes as *const u8,
            HostFn::ResolvePoolData => self.resolve_pool_data as *const u8,
            HostFn::CopySlice => self.copy_slice as *const u8,
            HostFn::CStringToSlice => self.cstring_to_slice as *const u8,
            HostFn::StoreInDatabase => self.store_in_database as *const u8,
            HostFn::MakePool => self.make_pool as *const u8,
            HostFn::PoolReference => self.pool_reference as *const u8,
            HostFn::PoolRelease => self.pool_release as *const u8,
            HostFn::Fatal => self.fatal as *const u8,
            HostFn::TraceRefCount => self.trace_ref_count as *const u8,
        }
    }
}
