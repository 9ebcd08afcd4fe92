//! Bulk allocator handed to generated code as its `arena` pointer.
//!
//! Every block is tracked so the arena can free whatever is still live when
//! it is dropped, and so freeing a pointer it never handed out is caught.

use std::alloc::Layout;
use std::collections::HashMap;
use std::ffi::c_void;

use parking_lot::Mutex;

use crate::host::fatal;

#[derive(Debug, Default)]
struct Blocks {
    live: HashMap<usize, Layout>,
    /// Freed blocks kept zeroed until the arena drops.
    poisoned: Vec<(usize, Layout)>,
    bytes: usize,
}

#[derive(Debug)]
pub struct Arena {
    name: &'static str,
    poison_freed: bool,
    blocks: Mutex<Blocks>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Blocks allocated and not yet freed.
    pub live: usize,
    /// Bytes held by live blocks.
    pub bytes: usize,
}

impl Arena {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            poison_freed: false,
            blocks: Mutex::new(Blocks::default()),
        }
    }

    /// Freed blocks are zeroed and held until drop instead of being
    /// returned to the system, so a stale reference count reads as zero.
    pub fn poisoning(mut self, poison_freed: bool) -> Self {
        self.poison_freed = poison_freed;
        self
    }

    /// The pointer generated code receives for this arena.
    pub fn as_native(&self) -> *mut c_void {
        self as *const Arena as *mut c_void
    }

    /// # Safety
    /// `arena` must come from [`Arena::as_native`] on an arena that is
    /// still alive.
    pub unsafe fn from_native<'a>(arena: *mut c_void) -> &'a Arena {
        if arena.is_null() {
            fatal(None, "allocation through a null arena");
        }
        unsafe { &*(arena as *const Arena) }
    }

    /// Allocates `size` zeroed bytes aligned to `align`.
    pub fn alloc(&self, size: u64, align: u64) -> *mut u8 {
        let Ok(layout) = Layout::from_size_align(size.max(1) as usize, align.max(1) as usize)
        else {
            fatal(
                None,
                &format!("{} arena: invalid allocation of {size} bytes aligned to {align}", self.name),
            );
        };
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        let mut blocks = self.blocks.lock();
        blocks.live.insert(ptr as usize, layout);
        blocks.bytes += layout.size();
        ptr
    }

    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut blocks = self.blocks.lock();
        let Some(layout) = blocks.live.remove(&(ptr as usize)) else {
            drop(blocks);
            fatal(
                None,
                &format!("{} arena: free of unowned block {ptr:p}", self.name),
            );
        };
        blocks.bytes -= layout.size();
        if self.poison_freed {
            unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
            blocks.poisoned.push((ptr as usize, layout));
        } else {
            unsafe { std::alloc::dealloc(ptr, layout) };
        }
    }

    pub fn realloc(&self, ptr: *mut u8, size: u64, align: u64) -> *mut u8 {
        let fresh = self.alloc(size, align);
        if ptr.is_null() {
            return fresh;
        }
        let old = self
            .blocks
            .lock()
            .live
            .get(&(ptr as usize))
            .map(|layout| layout.size());
        let Some(old) = old else {
            fatal(
                None,
                &format!("{} arena: realloc of unowned block {ptr:p}", self.name),
            );
        };
        unsafe { std::ptr::copy_nonoverlapping(ptr, fresh, old.min(size as usize)) };
        self.free(ptr);
        fresh
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        self.blocks.lock().live.contains_key(&(ptr as usize))
    }

    pub fn stats(&self) -> ArenaStats {
        let blocks = self.blocks.lock();
        ArenaStats {
            live: blocks.live.len(),
            bytes: blocks.bytes,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();
        if !blocks.live.is_empty() {
            tracing::debug!(
                arena = self.name,
                live = blocks.live.len(),
                bytes = blocks.bytes,
                "freeing blocks still live at arena drop"
            );
        }
        for (ptr, layout) in blocks.live.drain().chain(blocks.poisoned.drain(..)) {
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_zeroed_aligned_and_counted() {
        let arena = Arena::new("test");
        let a = arena.alloc(24, 16);
        let b = arena.alloc(0, 1);
        assert_eq!(a as usize % 16, 0);
        assert!(unsafe { std::slice::from_raw_parts(a, 24) }.iter().all(|b| *b == 0));
        assert_eq!(arena.stats(), ArenaStats { live: 2, bytes: 25 });
        arena.free(a);
        arena.free(std::ptr::null_mut());
        assert!(!arena.owns(a));
        assert!(arena.owns(b));
        assert_eq!(arena.stats().live, 1);
    }

    #[test]
    fn realloc_keeps_the_common_prefix() {
        let arena = Arena::new("test");
        let ptr = arena.alloc(4, 4);
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr, 4) };
        let grown = arena.realloc(ptr, 8, 4);
        let bytes = unsafe { std::slice::from_raw_parts(grown, 8) };
        assert_eq!(bytes, &[1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(arena.stats(), ArenaStats { live: 1, bytes: 8 });
    }

    #[test]
    fn poisoned_blocks_read_as_zero_after_free() {
        let arena = Arena::new("test").poisoning(true);
        let ptr = arena.alloc(8, 8);
        unsafe { ptr.cast::<u32>().write(1) };
        arena.free(ptr);
        assert_eq!(unsafe { ptr.cast::<u32>().read() }, 0);
        assert_eq!(arena.stats().live, 0);
    }
}
