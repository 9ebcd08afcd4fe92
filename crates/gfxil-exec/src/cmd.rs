//! Command records passed to [`Env::execute_n`](crate::Env::execute_n).

use std::sync::Arc;

use bytemuck::Pod;
use gfxil_codegen::runtime::{CMD_FLAG_HAS_READS, CMD_FLAG_HAS_WRITES};
use gfxil_codegen::{FieldLayout, StructLayout};

use crate::ExecError;

/// Application memory observed around one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub address: u64,
    pub data: Vec<u8>,
}

impl Observation {
    pub fn new(address: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }
}

/// Memory the traced application read before and wrote after a command.
/// Applied to the application pool by the command's `apply_reads` /
/// `apply_writes` statements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observations {
    pub reads: Vec<Observation>,
    pub writes: Vec<Observation>,
}

impl Observations {
    pub fn read(mut self, address: u64, data: impl Into<Vec<u8>>) -> Self {
        self.reads.push(Observation::new(address, data));
        self
    }

    pub fn write(mut self, address: u64, data: impl Into<Vec<u8>>) -> Self {
        self.writes.push(Observation::new(address, data));
        self
    }

    pub(crate) fn flags(&self) -> u32 {
        let mut flags = 0;
        if !self.reads.is_empty() {
            flags |= CMD_FLAG_HAS_READS;
        }
        if !self.writes.is_empty() {
            flags |= CMD_FLAG_HAS_WRITES;
        }
        flags
    }
}

/// One command invocation: which entry point to call, its argument block
/// and the observations that accompany it.
///
/// The argument block is laid out in the target ABI. After execution the
/// command's result, if it has one, can be read back with [`Cmd::result`].
#[derive(Debug, Clone)]
pub struct Cmd {
    pub(crate) name: String,
    pub(crate) api: u32,
    pub(crate) index: u32,
    layout: StructLayout,
    result: Option<FieldLayout>,
    /// 8-byte aligned backing for the argument block.
    words: Vec<u64>,
    pub(crate) thread: u64,
    pub(crate) observations: Option<Arc<Observations>>,
}

impl Cmd {
    pub(crate) fn new(
        name: String,
        api: u32,
        index: u32,
        layout: StructLayout,
        result: Option<FieldLayout>,
    ) -> Self {
        let words = vec![0; (layout.size as usize).div_ceil(8).max(1)];
        Self {
            name,
            api,
            index,
            layout,
            result,
            words,
            thread: 0,
            observations: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> u32 {
        self.api
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.layout.size as usize]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let size = self.layout.size as usize;
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..size]
    }

    pub(crate) fn arguments(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    /// Writes parameter `param`. The value must have the parameter's exact
    /// target size.
    pub fn set<T: Pod>(&mut self, param: &str, value: T) -> Result<&mut Self, ExecError> {
        let Some(field) = self.layout.field(param) else {
            return Err(ExecError::UnknownParam {
                command: self.name.clone(),
                param: param.to_string(),
            });
        };
        let value = bytemuck::bytes_of(&value);
        if value.len() != field.size as usize {
            return Err(ExecError::ParamSize {
                command: self.name.clone(),
                param: param.to_string(),
                expected: field.size,
                actual: value.len(),
            });
        }
        let offset = field.offset as usize;
        self.bytes_mut()[offset..offset + value.len()].copy_from_slice(value);
        Ok(self)
    }

    pub fn with<T: Pod>(mut self, param: &str, value: T) -> Result<Self, ExecError> {
        self.set(param, value)?;
        Ok(self)
    }

    pub fn on_thread(mut self, thread: u64) -> Self {
        self.thread = thread;
        self
    }

    pub fn observing(mut self, observations: Observations) -> Self {
        self.observations = Some(Arc::new(observations));
        self
    }

    pub(crate) fn flags(&self) -> u32 {
        self.observations
            .as_ref()
            .map_or(0, |observations| observations.flags())
    }

    /// Reads parameter `param` back.
    pub fn get<T: Pod>(&self, param: &str) -> Option<T> {
        let field = self.layout.field(param)?;
        self.read(field)
    }

    /// The value the command returned, if it returned one of type `T`.
    pub fn result<T: Pod>(&self) -> Option<T> {
        let field = self.result.as_ref()?;
        self.read(field)
    }

    fn read<T: Pod>(&self, field: &FieldLayout) -> Option<T> {
        if std::mem::size_of::<T>() != field.size as usize {
            return None;
        }
        let offset = field.offset as usize;
        let bytes = self.bytes().get(offset..offset + field.size as usize)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}
