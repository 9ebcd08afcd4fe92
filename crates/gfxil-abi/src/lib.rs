//! ABI descriptors and the storage layout engine.
//!
//! A value exists in two representations: the *storage* form packed into
//! serialized buffers under the storage ABI, and the *target* form that
//! compiled code holds in memory. [`AbiLayout`] computes size, alignment and
//! alloca size of semantic types for a given [`MemoryLayout`]; the storage
//! form is always byte-exact with the rules implemented here.

use gfxil_semantic::{Builtin, TypeId, TypeKind, Types};
use serde::{Deserialize, Serialize};


/// Size and alignment of one primitive, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataTypeLayout {
    pub size: u32,
    pub alignment: u32,
}

impl DataTypeLayout {
    pub const fn new(size: u32, alignment: u32) -> Self {
        Self { size, alignment }
    }
}

/// Primitive layouts of one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryLayout {
    pub pointer: DataTypeLayout,
    pub integer: DataTypeLayout,
    pub size: DataTypeLayout,
    pub char: DataTypeLayout,
    pub i8: DataTypeLayout,
    pub i16: DataTypeLayout,
    pub i32: DataTypeLayout,
    pub i64: DataTypeLayout,
    pub f32: DataTypeLayout,
    pub f64: DataTypeLayout,
}

impl MemoryLayout {
    /// LP64 platforms with natural alignment (x86-64, AArch64).
    pub const fn lp64() -> Self {
        Self {
            pointer: DataTypeLayout::new(8, 8),
            integer: DataTypeLayout::new(8, 8),
            size: DataTypeLayout::new(8, 8),
            char: DataTypeLayout::new(1, 1),
            i8: DataTypeLayout::new(1, 1),
            i16: DataTypeLayout::new(2, 2),
            i32: DataTypeLayout::new(4, 4),
            i64: DataTypeLayout::new(8, 8),
            f32: DataTypeLayout::new(4, 4),
            f64: DataTypeLayout::new(8, 8),
        }
    }

    /// ILP32 with 8-byte aligned 64-bit scalars (ARMv7-A EABI).
    pub const fn ilp32_aligned64() -> Self {
        Self {
            pointer: DataTypeLayout::new(4, 4),
            integer: DataTypeLayout::new(4, 4),
            size: DataTypeLayout::new(4, 4),
            ..Self::lp64()
        }
    }

    /// ILP32 where 64-bit scalars only need 4-byte alignment (i386 SysV).
    pub const fn ilp32_packed64() -> Self {
        Self {
            i64: DataTypeLayout::new(8, 4),
            f64: DataTypeLayout::new(8, 4),
            ..Self::ilp32_aligned64()
        }
    }
}

/// A named ABI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Abi {
    pub name: String,
    pub memory_layout: MemoryLayout,
}

impl Abi {
    pub fn new(name: impl Into<String>, memory_layout: MemoryLayout) -> Self {
        Self {
            name: name.into(),
            memory_layout,
        }
    }

    pub fn x86_64() -> Self {
        Self::new("x86_64", MemoryLayout::lp64())
    }

    pub fn arm64() -> Self {
        Self::new("arm64", MemoryLayout::lp64())
    }

    pub fn armv7a() -> Self {
        Self::new("armv7a", MemoryLayout::ilp32_aligned64())
    }

    pub fn x86() -> Self {
        Self::new("x86", MemoryLayout::ilp32_packed64())
    }

    /// The ABI of the process running the compiler.
    pub fn host() -> Self {
        if cfg!(all(target_pointer_width = "64", target_arch = "aarch64")) {
            Self::arm64()
        } else if cfg!(target_pointer_width = "64") {
            Self::x86_64()
        } else if cfg!(target_arch = "x86") {
            Self::x86()
        } else {
            Self::armv7a()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for Abi {
    fn default() -> Self {
        Self::host()
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("type `{0}` has no storage representation")]
    NotStorable(String),
}

pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Layout rules for semantic types under one [`MemoryLayout`].
#[derive(Debug, Clone, Copy)]
pub struct AbiLayout<'a> {
    types: &'a Types,
    layout: &'a MemoryLayout,
}

impl<'a> AbiLayout<'a> {
    pub fn new(types: &'a Types, layout: &'a MemoryLayout) -> Self {
        Self { types, layout }
    }

    pub fn memory_layout(&self) -> &'a MemoryLayout {
        self.layout
    }

    pub fn builtin(&self, builtin: Builtin) -> Option<DataTypeLayout> {
        let layout = self.layout;
        Some(match builtin {
            Builtin::Bool | Builtin::Int8 | Builtin::Uint8 => layout.i8,
            Builtin::Int16 | Builtin::Uint16 => layout.i16,
            Builtin::Int32 | Builtin::Uint32 => layout.i32,
            Builtin::Int64 | Builtin::Uint64 => layout.i64,
            Builtin::Float32 => layout.f32,
            Builtin::Float64 => layout.f64,
            Builtin::Int | Builtin::Uint => layout.integer,
            Builtin::Size => layout.size,
            Builtin::Char => layout.char,
            Builtin::Void | Builtin::String | Builtin::Any | Builtin::Message => return None,
        })
    }

    fn not_storable(&self, ty: TypeId) -> LayoutError {
        LayoutError::NotStorable(self.types.name(ty).to_string())
    }

    /// Number of bytes a value occupies, excluding trailing padding.
    pub fn size(&self, ty: TypeId) -> Result<u32, LayoutError> {
        match self.types.underlying_kind(ty) {
            TypeKind::Builtin(builtin) => self
                .builtin(*builtin)
                .map(|layout| layout.size)
                .ok_or_else(|| self.not_storable(ty)),
            TypeKind::Enum { .. } => Ok(self.layout.i32.size),
            TypeKind::Pointer { .. } => Ok(self.layout.pointer.size),
            TypeKind::StaticArray { elem, count } => Ok(self.alloca_size(*elem)? * count),
            TypeKind::Class { fields } => {
                let mut size = 0;
                for field in fields {
                    let field_size = self.alloca_size(field.ty)?;
                    size = align_up(size, self.alignment(field.ty)?) + field_size;
                }
                Ok(size)
            }
            TypeKind::Slice { .. } | TypeKind::Reference { .. } | TypeKind::Map { .. } => {
                Err(self.not_storable(ty))
            }
            TypeKind::Pseudonym { .. } => unreachable!("underlying strips pseudonyms"),
        }
    }

    pub fn alignment(&self, ty: TypeId) -> Result<u32, LayoutError> {
        match self.types.underlying_kind(ty) {
            TypeKind::Builtin(builtin) => self
                .builtin(*builtin)
                .map(|layout| layout.alignment)
                .ok_or_else(|| self.not_storable(ty)),
            TypeKind::Enum { .. } => Ok(self.layout.i32.alignment),
            TypeKind::Pointer { .. } => Ok(self.layout.pointer.alignment),
            TypeKind::StaticArray { elem, .. } => self.alignment(*elem),
            TypeKind::Class { fields } => {
                let mut alignment = 1;
                for field in fields {
                    alignment = alignment.max(self.alignment(field.ty)?);
                }
                Ok(alignment)
            }
            TypeKind::Slice { .. } | TypeKind::Reference { .. } | TypeKind::Map { .. } => {
                Err(self.not_storable(ty))
            }
            TypeKind::Pseudonym { .. } => unreachable!("underlying strips pseudonyms"),
        }
    }

    /// Size rounded up to the alignment: the stride of consecutive values.
    pub fn alloca_size(&self, ty: TypeId) -> Result<u32, LayoutError> {
        Ok(align_up(self.size(ty)?, self.alignment(ty)?))
    }

    /// Byte offset of every field of a class, in declaration order.
    pub fn field_offsets(&self, class: TypeId) -> Result<Vec<u32>, LayoutError> {
        let fields = self
            .types
            .class_fields(class)
            .ok_or_else(|| self.not_storable(class))?;
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0;
        for field in fields {
            offset = align_up(offset, self.alignment(field.ty)?);
            offsets.push(offset);
            offset += self.alloca_size(field.ty)?;
        }
        Ok(offsets)
    }
}
