//! Sparse memory pools.
//!
//! Pool 0 models the traced application's address space. Every other pool is
//! created by generated code for a fresh slice and is reference counted.

use std::collections::{BTreeMap, HashMap};

use gfxil_codegen::runtime::APPLICATION_POOL;

pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown pool {0}")]
    Unknown(u64),
    #[error("the application pool is not reference counted")]
    ApplicationPool,
    #[error("address range {addr:#x}+{size} overflows")]
    Overflow { addr: u64, size: u64 },
}

/// Byte store that only materialises the pages that were written.
/// Unwritten memory reads as zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pool {
    size: u64,
    ref_count: u32,
    pages: BTreeMap<u64, Box<[u8]>>,
}

fn check(addr: u64, size: u64) -> Result<(), PoolError> {
    match addr.checked_add(size) {
        Some(_) => Ok(()),
        None => Err(PoolError::Overflow { addr, size }),
    }
}

impl Pool {
    fn new(size: u64, ref_count: u32) -> Self {
        Self {
            size,
            ref_count,
            pages: BTreeMap::new(),
        }
    }

    /// Size requested at creation; 0 for the application pool.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), PoolError> {
        check(addr, out.len() as u64)?;
        let mut done = 0;
        while done < out.len() {
            let at = addr + done as u64;
            let (page, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            let chunk = (PAGE_SIZE as usize - offset).min(out.len() - done);
            let dst = &mut out[done..done + chunk];
            match self.pages.get(&page) {
                Some(data) => dst.copy_from_slice(&data[offset..offset + chunk]),
                None => dst.fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), PoolError> {
        check(addr, data.len() as u64)?;
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            let (page, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            let chunk = (PAGE_SIZE as usize - offset).min(data.len() - done);
            let page = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
            page[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn read_vec(&self, addr: u64, size: u64) -> Result<Vec<u8>, PoolError> {
        let mut out = vec![0; size as usize];
        self.read(addr, &mut out)?;
        Ok(out)
    }

    /// Length of the NUL-terminated string at `addr`, terminator excluded.
    pub fn strlen(&self, addr: u64) -> Result<u64, PoolError> {
        let mut at = addr;
        loop {
            let (page, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            let Some(data) = self.pages.get(&page) else {
                return Ok(at - addr);
            };
            if let Some(nul) = data[offset..].iter().position(|byte| *byte == 0) {
                return Ok(at - addr + nul as u64);
            }
            at = (page + 1)
                .checked_mul(PAGE_SIZE)
                .ok_or(PoolError::Overflow { addr, size: at - addr })?;
        }
    }
}

/// All pools of one Env.
#[derive(Debug)]
pub struct Pools {
    pools: HashMap<u64, Pool>,
    next_id: u64,
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

impl Pools {
    pub fn new() -> Self {
        let mut pools = HashMap::new();
        pools.insert(APPLICATION_POOL, Pool::new(0, 0));
        Self {
            pools,
            next_id: APPLICATION_POOL + 1,
        }
    }

    pub fn application(&mut self) -> &mut Pool {
        self.pools
            .entry(APPLICATION_POOL)
            .or_insert_with(|| Pool::new(0, 0))
    }

    pub fn get(&self, id: u64) -> Result<&Pool, PoolError> {
        self.pools.get(&id).ok_or(PoolError::Unknown(id))
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut Pool, PoolError> {
        self.pools.get_mut(&id).ok_or(PoolError::Unknown(id))
    }

    /// Creates a pool holding one reference.
    pub fn make(&mut self, size: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pools.insert(id, Pool::new(size, 1));
        id
    }

    pub fn reference(&mut self, id: u64) -> Result<u32, PoolError> {
        if id == APPLICATION_POOL {
            return Err(PoolError::ApplicationPool);
        }
        let pool = self.get_mut(id)?;
        pool.ref_count += 1;
        Ok(pool.ref_count)
    }

    /// Drops one reference and frees the pool when none remain. Returns the
    /// remaining count.
    pub fn release(&mut self, id: u64) -> Result<u32, PoolError> {
        if id == APPLICATION_POOL {
            return Err(PoolError::ApplicationPool);
        }
        let pool = self.get_mut(id)?;
        pool.ref_count -= 1;
        let remaining = pool.ref_count;
        if remaining == 0 {
            self.pools.remove(&id);
        }
        Ok(remaining)
    }

    /// Number of live pools, the application pool included.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Copies `size` bytes between pools, reading before writing so the
    /// ranges may overlap.
    pub fn copy(
        &mut self,
        dst: u64,
        dst_addr: u64,
        src: u64,
        src_addr: u64,
        size: u64,
    ) -> Result<(), PoolError> {
        let data = self.get(src)?.read_vec(src_addr, size)?;
        self.get_mut(dst)?.write(dst_addr, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn writes_span_pages_and_gaps_read_as_zero() {
        let mut pool = Pool::default();
        let data: Vec<u8> = (1..=16).collect();
        pool.write(PAGE_SIZE - 8, &data).unwrap();
        assert_eq!(pool.resident_pages(), 2);
        assert_eq!(pool.read_vec(PAGE_SIZE - 8, 16).unwrap(), data);
        assert_eq!(pool.read_vec(PAGE_SIZE * 5, 4).unwrap(), vec![0; 4]);
        assert_eq!(
            pool.read_vec(PAGE_SIZE + 6, 4).unwrap(),
            vec![15, 16, 0, 0]
        );
    }

    #[test]
    fn strlen_stops_at_the_terminator_or_unwritten_memory() {
        let mut pool = Pool::default();
        pool.write(PAGE_SIZE - 3, b"hello\0").unwrap();
        assert_eq!(pool.strlen(PAGE_SIZE - 3).unwrap(), 5);
        assert_eq!(pool.strlen(PAGE_SIZE * 9).unwrap(), 0);
        let long = vec![b'x'; PAGE_SIZE as usize];
        pool.write(PAGE_SIZE * 20, &long).unwrap();
        assert_eq!(pool.strlen(PAGE_SIZE * 20 + 1).unwrap(), PAGE_SIZE - 1);
    }

    #[test]
    fn pools_are_freed_with_their_last_reference() {
        let mut pools = Pools::new();
        let id = pools.make(64);
        assert_ne!(id, APPLICATION_POOL);
        assert_eq!(pools.reference(id), Ok(2));
        assert_eq!(pools.release(id), Ok(1));
        assert_eq!(pools.release(id), Ok(0));
        assert_eq!(pools.get(id).err(), Some(PoolError::Unknown(id)));
        assert_eq!(pools.release(id), Err(PoolError::Unknown(id)));
        assert_eq!(pools.len(), 1);
    }

    #[test]
    fn the_application_pool_is_not_counted() {
        let mut pools = Pools::new();
        assert_eq!(
            pools.reference(APPLICATION_POOL),
            Err(PoolError::ApplicationPool)
        );
        assert_eq!(
            pools.release(APPLICATION_POOL),
            Err(PoolError::ApplicationPool)
        );
        assert!(pools.get(APPLICATION_POOL).is_ok());
    }

    #[test]
    fn copies_cross_pools() {
        let mut pools = Pools::new();
        pools.application().write(0x1000, b"abcd").unwrap();
        let id = pools.make(4);
        pools.copy(id, 0, APPLICATION_POOL, 0x1000, 4).unwrap();
        assert_eq!(pools.get(id).unwrap().read_vec(0, 4).unwrap(), b"abcd");
    }

    proptest! {
        #[test]
        fn reads_observe_the_last_write(
            writes in prop::collection::vec((0u64..3 * PAGE_SIZE, prop::collection::vec(any::<u8>(), 1..64)), 1..16),
        ) {
            let mut pool = Pool::default();
            let mut model = vec![0u8; 4 * PAGE_SIZE as usize];
            for (addr, data) in &writes {
                pool.write(*addr, data).unwrap();
                model[*addr as usize..*addr as usize + data.len()].copy_from_slice(data);
            }
            prop_assert_eq!(pool.read_vec(0, model.len() as u64).unwrap(), model);
        }
    }
}
