//! Host side of the native callback ABI.
//!
//! Callbacks that take a context find their Env through the registry using
//! `Context::id`; allocation callbacks work on the arena pointer alone.

use std::ffi::{CStr, c_void};
use std::mem::offset_of;
use std::sync::Arc;

use gfxil_codegen::runtime::{
    ACCESS_READ, ACCESS_WRITE, Context, HostCallbacks, Slice, StringHeader,
};

use crate::arena::Arena;
use crate::env::Shared;
use crate::registry::registry;

/// Logs `message` and aborts the process.
pub(crate) fn fatal(env: Option<u32>, message: &str) -> ! {
    tracing::error!(env, "fatal: {message}");
    eprintln!("gfxil fatal error: {message}");
    std::process::abort()
}

/// The Env behind `ctx`.
unsafe fn env<'a>(ctx: *mut Context) -> (Arc<Shared>, &'a Context) {
    if ctx.is_null() {
        fatal(None, "host callback without a context");
    }
    let ctx = unsafe { &*ctx };
    match registry().get(ctx.id) {
        Some(env) => (env, ctx),
        None => fatal(Some(ctx.id), &format!("unknown Env id {}", ctx.id)),
    }
}

unsafe extern "C" fn alloc(arena: *mut c_void, size: u64, align: u64) -> *mut u8 {
    unsafe { Arena::from_native(arena) }.alloc(size, align)
}

unsafe extern "C" fn realloc(arena: *mut c_void, ptr: *mut u8, size: u64, align: u64) -> *mut u8 {
    unsafe { Arena::from_native(arena) }.realloc(ptr, size, align)
}

unsafe extern "C" fn free(arena: *mut c_void, ptr: *mut u8) {
    unsafe { Arena::from_native(arena) }.free(ptr)
}

unsafe extern "C" fn make_string(
    arena: *mut c_void,
    length: u64,
    data: *const u8,
) -> *mut StringHeader {
    let header = offset_of!(StringHeader, data);
    let size = header as u64 + length + 1;
    let arena_ref = unsafe { Arena::from_native(arena) };
    let string = arena_ref
        .alloc(size, std::mem::align_of::<StringHeader>() as u64)
        .cast::<StringHeader>();
    unsafe {
        (*string).ref_count = 1;
        (*string).arena = arena;
        (*string).length = length;
        if !data.is_null() && length > 0 {
            std::ptr::copy_nonoverlapping(data, string.cast::<u8>().add(header), length as usize);
        }
    }
    string
}

unsafe extern "C" fn free_string(string: *mut StringHeader) {
    if string.is_null() {
        return;
    }
    unsafe { Arena::from_native((*string).arena) }.free(string.cast());
}

unsafe extern "C" fn string_compare(a: *const StringHeader, b: *const StringHeader) -> i32 {
    if a == b {
        return 0;
    }
    let (a, b) = unsafe { (StringHeader::bytes(a), StringHeader::bytes(b)) };
    a.cmp(b) as i32
}

unsafe extern "C" fn apply_reads(ctx: *mut Context) {
    let (env, ctx) = unsafe { env(ctx) };
    env.apply_reads(ctx);
}

unsafe extern "C" fn apply_writes(ctx: *mut Context) {
    let (env, ctx) = unsafe { env(ctx) };
    env.apply_writes(ctx);
}

unsafe extern "C" fn resolve_pool_data(
    ctx: *mut Context,
    pool: u64,
    ptr: u64,
    access: u32,
    size: u64,
) -> *mut u8 {
    let (env, ctx) = unsafe { env(ctx) };
    match access {
        ACCESS_READ => env.read_pool_data(ctx, pool, ptr, size),
        ACCESS_WRITE => env.write_pool_data(pool, ptr, size),
        other => fatal(Some(env.id), &format!("unexpected pool access {other}")),
    }
}

unsafe extern "C" fn copy_slice(ctx: *mut Context, dst: *const Slice, src: *const Slice) {
    let (env, _) = unsafe { env(ctx) };
    let (dst, src) = unsafe { (&*dst, &*src) };
    env.copy_slice(dst, src);
}

unsafe extern "C" fn cstring_to_slice(ctx: *mut Context, ptr: u64, out: *mut Slice) {
    let (env, _) = unsafe { env(ctx) };
    let slice = env.cstring_to_slice(ptr);
    unsafe { out.write(slice) };
}

unsafe extern "C" fn store_in_database(
    ctx: *mut Context,
    data: *const u8,
    size: u64,
    id_out: *mut u8,
) {
    let (env, _) = unsafe { env(ctx) };
    let data = unsafe { std::slice::from_raw_parts(data, size as usize) };
    let id = env.store_in_database(data);
    unsafe { std::ptr::copy_nonoverlapping(id.0.as_ptr(), id_out, id.0.len()) };
}

unsafe extern "C" fn make_pool(ctx: *mut Context, size: u64) -> u64 {
    let (env, _) = unsafe { env(ctx) };
    env.make_pool(size)
}

unsafe extern "C" fn pool_reference(ctx: *mut Context, pool: u64) {
    let (env, _) = unsafe { env(ctx) };
    env.pool_reference(pool);
}

unsafe extern "C" fn pool_release(ctx: *mut Context, pool: u64) {
    let (env, _) = unsafe { env(ctx) };
    env.pool_release(pool);
}

unsafe extern "C" fn fatal_callback(ctx: *mut Context, message: *const u8, object: *const u8) {
    let env = (!ctx.is_null()).then(|| unsafe { (*ctx).id });
    let message = unsafe { CStr::from_ptr(message.cast()) }.to_string_lossy();
    fatal(env, &format!("{message} (object {object:p})"))
}

unsafe extern "C" fn trace_ref_count(type_name: *const u8, object: *const u8, old: u32, new: u32) {
    let type_name = unsafe { CStr::from_ptr(type_name.cast()) }.to_string_lossy();
    tracing::trace!(ty = %type_name, ?object, old, new, "reference count changed");
}

/// The callbacks every executor compiles against.
pub fn callbacks() -> HostCallbacks {
    HostCallbacks {
        alloc,
        realloc,
        free,
        make_string,
        free_string,
        string_compare,
        apply_reads,
        apply_writes,
        resolve_pool_data,
        copy_slice,
        cstring_to_slice,
        store_in_database,
        make_pool,
        pool_reference,
        pool_release,
        fatal: fatal_callback,
        trace_ref_count,
    }
}
