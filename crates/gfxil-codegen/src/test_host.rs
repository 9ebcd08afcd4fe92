//! A minimal host for running generated code in unit tests.
//!
//! Allocation, strings and comparison are real. The arena pointer, when not
//! null, points at an `AtomicIsize` counting live blocks so tests can check
//! that everything a context allocated is freed again. Pool, database and
//! observation callbacks abort.

use std::alloc::Layout;
use std::ffi::{CStr, c_void};
use std::mem::offset_of;
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::runtime::{Context, HostCallbacks, Slice, StringHeader};

const PREFIX: usize = 16;

fn track(arena: *mut c_void, delta: isize) {
    if !arena.is_null() {
        let live = unsafe { &*(arena as *const AtomicIsize) };
        live.fetch_add(delta, Ordering::SeqCst);
    }
}

/// Blocks carry their total size and alignment just before the returned
/// pointer so `free` can rebuild the layout.
unsafe extern "C" fn alloc(arena: *mut c_void, size: u64, align: u64) -> *mut u8 {
    let align = (align as usize).max(PREFIX);
    let total = size as usize + align;
    let layout = Layout::from_size_align(total, align).unwrap();
    unsafe {
        let base = std::alloc::alloc_zeroed(layout);
        assert!(!base.is_null(), "test allocation failed");
        let ptr = base.add(align);
        ptr.cast::<u64>().sub(1).write(total as u64);
        ptr.cast::<u64>().sub(2).write(align as u64);
        track(arena, 1);
        ptr
    }
}

unsafe fn block(ptr: *mut u8) -> (*mut u8, Layout, usize) {
    unsafe {
        let total = ptr.cast::<u64>().sub(1).read() as usize;
        let align = ptr.cast::<u64>().sub(2).read() as usize;
        let layout = Layout::from_size_align(total, align).unwrap();
        (ptr.sub(align), layout, total - align)
    }
}

unsafe extern "C" fn free(arena: *mut c_void, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let (base, layout, _) = block(ptr);
        std::alloc::dealloc(base, layout);
    }
    track(arena, -1);
}

unsafe extern "C" fn realloc(arena: *mut c_void, ptr: *mut u8, size: u64, align: u64) -> *mut u8 {
    unsafe {
        let fresh = alloc(arena, size, align);
        if !ptr.is_null() {
            let (_, _, old) = block(ptr);
            std::ptr::copy_nonoverlapping(ptr, fresh, old.min(size as usize));
            free(arena, ptr);
        }
        fresh
    }
}

unsafe extern "C" fn make_string(
    arena: *mut c_void,
    length: u64,
    data: *const u8,
) -> *mut StringHeader {
    let header = offset_of!(StringHeader, data);
    unsafe {
        let string = alloc(arena, (header + length as usize + 1) as u64, 8).cast::<StringHeader>();
        (*string).ref_count = 1;
        (*string).arena = arena;
        (*string).length = length;
        if !data.is_null() {
            std::ptr::copy_nonoverlapping(data, string.cast::<u8>().add(header), length as usize);
        }
        string
    }
}

unsafe extern "C" fn free_string(string: *mut StringHeader) {
    unsafe { free((*string).arena, string.cast()) }
}

unsafe extern "C" fn string_compare(a: *const StringHeader, b: *const StringHeader) -> i32 {
    let (a, b) = unsafe { (StringHeader::bytes(a), StringHeader::bytes(b)) };
    a.cmp(b) as i32
}

unsafe extern "C" fn fatal(_ctx: *mut Context, message: *const u8, object: *const u8) {
    let message = unsafe { CStr::from_ptr(message.cast()) };
    eprintln!("fatal: {} ({object:p})", message.to_string_lossy());
    std::process::abort();
}

fn unsupported(name: &str) -> ! {
    eprintln!("test host has no `{name}`");
    std::process::abort();
}

unsafe extern "C" fn apply_reads(_: *mut Context) {
    unsupported("apply_reads")
}

unsafe extern "C" fn apply_writes(_: *mut Context) {
    unsupported("apply_writes")
}

unsafe extern "C" fn resolve_pool_data(_: *mut Context, _: u64, _: u64, _: u32, _: u64) -> *mut u8 {
    unsupported("resolve_pool_data")
}

unsafe extern "C" fn copy_slice(_: *mut Context, _: *const Slice, _: *const Slice) {
    unsupported("copy_slice")
}

unsafe extern "C" fn cstring_to_slice(_: *mut Context, _: u64, _: *mut Slice) {
    unsupported("cstring_to_slice")
}

unsafe extern "C" fn store_in_database(_: *mut Context, _: *const u8, _: u64, _: *mut u8) {
    unsupported("store_in_database")
}

unsafe extern "C" fn make_pool(_: *mut Context, _: u64) -> u64 {
    unsupported("make_pool")
}

unsafe extern "C" fn pool_reference(_: *mut Context, _: u64) {
    unsupported("pool_reference")
}

unsafe extern "C" fn pool_release(_: *mut Context, _: u64) {
    unsupported("pool_release")
}

unsafe extern "C" fn trace_ref_count(_: *const u8, _: *const u8, _: u32, _: u32) {}

pub(crate) fn callbacks() -> HostCallbacks {
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
        fatal,
        trace_ref_count,
    }
}
