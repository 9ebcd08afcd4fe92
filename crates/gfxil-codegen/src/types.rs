//! Native type descriptors.
//!
//! Aggregates are forward-declared [`StructId`] cells whose bodies are set
//! later, so recursive types (a class holding a reference to itself) can be
//! described. Layouts are computed once every body is known.

use std::fmt::Write;

use gfxil_abi::{DataTypeLayout, MemoryLayout, align_up};

use crate::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pointee {
    Opaque,
    Struct(StructId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NativeType {
    Void,
    Int { bits: u8, signed: bool },
    F32,
    F64,
    Pointer(Pointee),
    Struct(StructId),
    Array(Box<NativeType>, u32),
}

impl NativeType {
    pub const BOOL: NativeType = NativeType::Int {
        bits: 8,
        signed: false,
    };
    pub const U32: NativeType = NativeType::Int {
        bits: 32,
        signed: false,
    };
    pub const U64: NativeType = NativeType::Int {
        bits: 64,
        signed: false,
    };
    pub const OPAQUE_PTR: NativeType = NativeType::Pointer(Pointee::Opaque);

    pub fn int(bytes: u32, signed: bool) -> Option<NativeType> {
        matches!(bytes, 1 | 2 | 4 | 8).then(|| NativeType::Int {
            bits: (bytes * 8) as u8,
            signed,
        })
    }

    pub fn bytes(len: u32) -> NativeType {
        NativeType::Array(
            Box::new(NativeType::Int {
                bits: 8,
                signed: false,
            }),
            len,
        )
    }

    /// Held in a register rather than addressed in memory.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            NativeType::Int { .. } | NativeType::F32 | NativeType::F64 | NativeType::Pointer(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeField {
    pub name: String,
    pub ty: NativeType,
}

impl NativeField {
    pub fn new(name: impl Into<String>, ty: NativeType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone)]
struct StructDef {
    name: String,
    /// Mangled by name. Runtime structs whose fields carry their own
    /// ref-counting rules must never match a user class by shape.
    nominal: bool,
    packed: bool,
    fields: Option<Vec<NativeField>>,
    layout: Option<Computed>,
}

#[derive(Debug, Clone)]
struct Computed {
    size: u32,
    align: u32,
    offsets: Vec<u32>,
}

/// Every native struct of one compilation, laid out for the target.
#[derive(Debug, Clone)]
pub struct TypeTable {
    structs: Vec<StructDef>,
    layout: MemoryLayout,
}

impl TypeTable {
    pub fn new(layout: MemoryLayout) -> Self {
        Self {
            structs: Vec::new(),
            layout,
        }
    }

    pub fn declare(&mut self, name: impl Into<String>) -> StructId {
        let id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            name: name.into(),
            nominal: false,
            packed: false,
            fields: None,
            layout: None,
        });
        id
    }

    pub fn declare_nominal(&mut self, name: impl Into<String>) -> StructId {
        let id = self.declare(name);
        self.structs[id.0 as usize].nominal = true;
        id
    }

    pub fn set_body(&mut self, id: StructId, packed: bool, fields: Vec<NativeField>) {
        let def = &mut self.structs[id.0 as usize];
        def.packed = packed;
        def.fields = Some(fields);
        def.layout = None;
    }

    pub fn name(&self, id: StructId) -> &str {
        &self.structs[id.0 as usize].name
    }

    pub fn fields(&self, id: StructId) -> &[NativeField] {
        self.structs[id.0 as usize].fields.as_deref().unwrap_or(&[])
    }

    pub fn is_packed(&self, id: StructId) -> bool {
        self.structs[id.0 as usize].packed
    }

    /// Lays out every struct. Must run after all bodies are set and before
    /// any size or offset query.
    pub fn compute_layouts(&mut self) -> Result<(), CodegenError> {
        for index in 0..self.structs.len() {
            self.ensure_struct(StructId(index as u32), 0)?;
        }
        Ok(())
    }

    fn ensure_struct(&mut self, id: StructId, depth: usize) -> Result<(), CodegenError> {
        let def = &self.structs[id.0 as usize];
        if def.layout.is_some() {
            return Ok(());
        }
        if depth > self.structs.len() {
            return Err(CodegenError::RecursiveStruct {
                name: def.name.clone(),
            });
        }
        let fields = def
            .fields
            .clone()
            .ok_or_else(|| CodegenError::IncompleteStruct {
                name: def.name.clone(),
            })?;
        let packed = def.packed;
        for field in &fields {
            self.ensure_type(&field.ty, depth + 1)?;
        }

        let mut offset = 0;
        let mut align = 1;
        let mut offsets = Vec::with_capacity(fields.len());
        for field in &fields {
            let field_size = self.size_of(&field.ty);
            if !packed {
                let field_align = self.align_of(&field.ty);
                offset = align_up(offset, field_align);
                align = align.max(field_align);
            }
            offsets.push(offset);
            offset += field_size;
        }
        let size = if packed { offset } else { align_up(offset, align) };
        self.structs[id.0 as usize].layout = Some(Computed {
            size,
            align,
            offsets,
        });
        Ok(())
    }

    fn ensure_type(&mut self, ty: &NativeType, depth: usize) -> Result<(), CodegenError> {
        match ty {
            NativeType::Struct(id) => self.ensure_struct(*id, depth),
            NativeType::Array(elem, _) => self.ensure_type(elem, depth),
            _ => Ok(()),
        }
    }

    fn computed(&self, id: StructId) -> &Computed {
        let def = &self.structs[id.0 as usize];
        match &def.layout {
            Some(computed) => computed,
            None => panic!("layout of native struct `{}` queried before it was computed", def.name),
        }
    }

    fn primitive(&self, ty: &NativeType) -> DataTypeLayout {
        let layout = &self.layout;
        match ty {
            NativeType::Void => DataTypeLayout::new(0, 1),
            NativeType::Int { bits: 8, .. } => layout.i8,
            NativeType::Int { bits: 16, .. } => layout.i16,
            NativeType::Int { bits: 32, .. } => layout.i32,
            NativeType::Int { .. } => layout.i64,
            NativeType::F32 => layout.f32,
            NativeType::F64 => layout.f64,
            NativeType::Pointer(_) => layout.pointer,
            NativeType::Struct(_) | NativeType::Array(..) => {
                unreachable!("aggregates have no primitive layout")
            }
        }
    }

    pub fn size_of(&self, ty: &NativeType) -> u32 {
        match ty {
            NativeType::Struct(id) => self.computed(*id).size,
            NativeType::Array(elem, count) => self.stride_of(elem) * count,
            _ => self.primitive(ty).size,
        }
    }

    pub fn align_of(&self, ty: &NativeType) -> u32 {
        match ty {
            NativeType::Struct(id) => self.computed(*id).align,
            NativeType::Array(elem, _) => self.align_of(elem),
            _ => self.primitive(ty).alignment,
        }
    }

    pub fn stride_of(&self, ty: &NativeType) -> u32 {
        align_up(self.size_of(ty), self.align_of(ty))
    }

    pub fn offsets(&self, id: StructId) -> &[u32] {
        &self.computed(id).offsets
    }

    /// Offset and type of a named field.
    pub fn field(&self, id: StructId, name: &str) -> Option<(u32, &NativeType)> {
        let index = self.fields(id).iter().position(|field| field.name == name)?;
        Some((self.offsets(id)[index], &self.fields(id)[index].ty))
    }

    pub fn field_offset(&self, id: StructId, name: &str) -> u32 {
        match self.field(id, name) {
            Some((offset, _)) => offset,
            None => panic!("native struct `{}` has no field `{name}`", self.name(id)),
        }
    }

    /// Structural name of a native type. Two types with the same mangled
    /// name have identical layouts and can share generated functions.
    /// Nominal structs contribute their name instead of their fields.
    pub fn mangle(&self, ty: &NativeType) -> String {
        let mut out = String::new();
        self.mangle_into(ty, &mut Vec::new(), &mut out);
        out
    }

    fn mangle_into(&self, ty: &NativeType, stack: &mut Vec<StructId>, out: &mut String) {
        match ty {
            NativeType::Void => out.push('v'),
            NativeType::Int { bits, signed } => {
                let _ = write!(out, "{}{bits}", if *signed { 'i' } else { 'u' });
            }
            NativeType::F32 => out.push_str("f32"),
            NativeType::F64 => out.push_str("f64"),
            NativeType::Pointer(Pointee::Opaque) => out.push_str("Pv"),
            NativeType::Pointer(Pointee::Struct(id)) => {
                out.push('P');
                self.mangle_struct(*id, stack, out);
            }
            NativeType::Struct(id) => self.mangle_struct(*id, stack, out),
            NativeType::Array(elem, count) => {
                let _ = write!(out, "A{count}");
                self.mangle_into(elem, stack, out);
            }
        }
    }

    fn mangle_struct(&self, id: StructId, stack: &mut Vec<StructId>, out: &mut String) {
        if let Some(depth) = stack.iter().rev().position(|open| *open == id) {
            let _ = write!(out, "R{depth}");
            return;
        }
        let def = &self.structs[id.0 as usize];
        if def.nominal {
            let _ = write!(out, "N<{}>", def.name);
            return;
        }
        let Some(fields) = &def.fields else {
            let _ = write!(out, "S<{}>", def.name);
            return;
        };
        stack.push(id);
        out.push_str(if def.packed { "Sp{" } else { "S{" });
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            self.mangle_into(&field.ty, stack, out);
        }
        out.push('}');
        stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TypeTable {
        TypeTable::new(MemoryLayout::lp64())
    }

    #[test]
    fn natural_layout_pads_like_c() {
        let mut table = table();
        let id = table.declare("Mixed");
        table.set_body(
            id,
            false,
            vec![
                NativeField::new("a", NativeType::BOOL),
                NativeField::new("b", NativeType::U64),
                NativeField::new("c", NativeType::U32),
            ],
        );
        table.compute_layouts().expect("layout should succeed");
        assert_eq!(table.offsets(id), &[0, 8, 16]);
        assert_eq!(table.size_of(&NativeType::Struct(id)), 24);
        assert_eq!(table.align_of(&NativeType::Struct(id)), 8);
    }

    #[test]
    fn packed_layout_has_no_implicit_padding() {
        let mut table = table();
        let id = table.declare("S_Mixed");
        table.set_body(
            id,
            true,
            vec![
                NativeField::new("a", NativeType::BOOL),
                NativeField::new("__dummy0", NativeType::bytes(3)),
                NativeField::new("b", NativeType::U64),
            ],
        );
        table.compute_layouts().expect("layout should succeed");
        assert_eq!(table.offsets(id), &[0, 1, 4]);
        assert_eq!(table.size_of(&NativeType::Struct(id)), 12);
        assert_eq!(table.align_of(&NativeType::Struct(id)), 1);
    }

    #[test]
    fn mangling_is_structural_and_handles_cycles() {
        let mut table = table();
        let a = table.declare("A");
        let b = table.declare("B");
        let node = table.declare("Node");
        for id in [a, b] {
            table.set_body(
                id,
                false,
                vec![
                    NativeField::new("x", NativeType::U32),
                    NativeField::new("y", NativeType::F64),
                ],
            );
        }
        table.set_body(
            node,
            false,
            vec![
                NativeField::new("value", NativeType::U32),
                NativeField::new("next", NativeType::Pointer(Pointee::Struct(node))),
            ],
        );
        table.compute_layouts().expect("layout should succeed");

        assert_eq!(
            table.mangle(&NativeType::Struct(a)),
            table.mangle(&NativeType::Struct(b))
        );
        assert_eq!(table.mangle(&NativeType::Struct(a)), "S{u32,f64}");
        assert_eq!(table.mangle(&NativeType::Struct(node)), "S{u32,PR0}");
    }

    #[test]
    fn nominal_structs_never_match_by_shape() {
        let mut table = table();
        let slice = table.declare_nominal("slice");
        let five = table.declare("Five");
        for id in [slice, five] {
            table.set_body(
                id,
                false,
                ["a", "b", "c", "d", "e"]
                    .into_iter()
                    .map(|name| NativeField::new(name, NativeType::U64))
                    .collect(),
            );
        }
        table.compute_layouts().expect("layout should succeed");

        assert_eq!(table.size_of(&NativeType::Struct(slice)), 40);
        assert_eq!(table.mangle(&NativeType::Struct(slice)), "N<slice>");
        assert_eq!(table.mangle(&NativeType::Struct(five)), "S{u64,u64,u64,u64,u64}");
    }

    #[test]
    fn missing_body_is_reported() {
        let mut table = table();
        let outer = table.declare("Outer");
        let inner = table.declare("Inner");
        table.set_body(
            outer,
            false,
            vec![NativeField::new("inner", NativeType::Struct(inner))],
        );
        assert_eq!(
            table.compute_layouts(),
            Err(CodegenError::IncompleteStruct {
                name: "Inner".into()
            })
        );
    }

    #[test]
    fn arrays_use_element_stride() {
        let mut table = table();
        let id = table.declare("Odd");
        table.set_body(
            id,
            false,
            vec![
                NativeField::new("a", NativeType::U32),
                NativeField::new("b", NativeType::BOOL),
            ],
        );
        table.compute_layouts().expect("layout should succeed");
        let array = NativeType::Array(Box::new(NativeType::Struct(id)), 3);
        assert_eq!(table.stride_of(&NativeType::Struct(id)), 8);
        assert_eq!(table.size_of(&array), 24);
    }
}
