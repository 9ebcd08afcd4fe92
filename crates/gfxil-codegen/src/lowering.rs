//! Semantic type → native type lowering.
//!
//! Lowering runs in two phases: [`TypeLowering::declare`] creates a native
//! struct cell for every registered class, reference and map so that types
//! may refer to each other in any order; [`TypeLowering::build`] then fills
//! in the bodies and lays everything out.

use std::collections::HashMap;

use gfxil_abi::{Abi, AbiLayout, align_up};
use gfxil_semantic::{Builtin, Program, TypeId, TypeKind, Types};

use crate::CodegenError;
use crate::types::{NativeField, NativeType, Pointee, StructId, TypeTable};

/// Native cells backing one map type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MapShape {
    pub header: StructId,
    pub element: StructId,
    pub key: TypeId,
    pub value: TypeId,
}

#[derive(Debug)]
pub(crate) struct TypeLowering<'p> {
    pub types: &'p Types,
    pub table: TypeTable,
    pub target_abi: Abi,
    pub storage_abi: Abi,
    target: HashMap<TypeId, NativeType>,
    storage: HashMap<TypeId, NativeType>,
    pub string: StructId,
    pub slice: StructId,
    pub maps: HashMap<TypeId, MapShape>,
    pub refs: HashMap<TypeId, StructId>,
    /// Registered classes in registration order.
    pub classes: Vec<TypeId>,
}

impl<'p> TypeLowering<'p> {
    pub fn new(types: &'p Types, target_abi: Abi, storage_abi: Abi) -> Self {
        let mut table = TypeTable::new(target_abi.memory_layout.clone());
        let string = table.declare_nominal("string");
        table.set_body(
            string,
            false,
            vec![
                NativeField::new("ref_count", NativeType::U32),
                NativeField::new("arena", NativeType::OPAQUE_PTR),
                NativeField::new("length", NativeType::U64),
                NativeField::new("data", NativeType::bytes(0)),
            ],
        );
        let slice = table.declare_nominal("slice");
        table.set_body(
            slice,
            false,
            ["pool", "root", "base", "size", "count"]
                .into_iter()
                .map(|name| NativeField::new(name, NativeType::U64))
                .collect(),
        );
        Self {
            types,
            table,
            target_abi,
            storage_abi,
            target: HashMap::new(),
            storage: HashMap::new(),
            string,
            slice,
            maps: HashMap::new(),
            refs: HashMap::new(),
            classes: Vec::new(),
        }
    }

    /// Storage and target layouts coincide, so storage conversion is a copy.
    pub fn same_abi(&self) -> bool {
        self.storage_abi.memory_layout == self.target_abi.memory_layout
    }

    pub fn storage_layout(&self) -> AbiLayout<'_> {
        AbiLayout::new(self.types, &self.storage_abi.memory_layout)
    }

    pub fn declare(&mut self, program: &Program) {
        for api in &program.apis {
            for &class in &api.classes {
                let class = self.types.underlying(class);
                if self.target.contains_key(&class) {
                    continue;
                }
                let name = self.types.name(class);
                let target = self.table.declare(format!("T_{name}"));
                self.target.insert(class, NativeType::Struct(target));
                self.classes.push(class);
                if self.types.is_storage_type(class) {
                    let storage = if self.same_abi() {
                        target
                    } else {
                        self.table.declare(format!("S_{name}"))
                    };
                    self.storage.insert(class, NativeType::Struct(storage));
                }
            }
            for &reference in &api.references {
                let reference = self.types.underlying(reference);
                if self.target.contains_key(&reference) {
                    continue;
                }
                let id = self.table.declare(self.types.name(reference));
                self.refs.insert(reference, id);
                self.target
                    .insert(reference, NativeType::Pointer(Pointee::Struct(id)));
            }
            for &map in &api.maps {
                let map = self.types.underlying(map);
                if self.target.contains_key(&map) {
                    continue;
                }
                let TypeKind::Map { key, value } = self.types.kind(map) else {
                    continue;
                };
                let name = self.types.name(map);
                let header = self.table.declare(name);
                let element = self.table.declare(format!("{name}•element"));
                self.maps.insert(
                    map,
                    MapShape {
                        header,
                        element,
                        key: *key,
                        value: *value,
                    },
                );
                self.target
                    .insert(map, NativeType::Pointer(Pointee::Struct(header)));
            }
        }
    }

    pub fn build(&mut self) -> Result<(), CodegenError> {
        for class in self.classes.clone() {
            let Some(fields) = self.types.class_fields(class) else {
                continue;
            };
            for field in fields {
                self.check_array(field.ty)?;
            }
            let native = fields
                .iter()
                .map(|field| NativeField::new(field.name.clone(), self.target_type(field.ty)))
                .collect();
            let NativeType::Struct(target) = self.target_type(class) else {
                unreachable!("classes lower to structs");
            };
            self.table.set_body(target, false, native);
            if !self.same_abi() && self.types.is_storage_type(class) {
                self.build_storage_class(class)?;
            }
        }
        let refs: Vec<_> = self.refs.iter().map(|(ty, id)| (*ty, *id)).collect();
        for (reference, id) in refs {
            let TypeKind::Reference { to } = self.types.kind(reference) else {
                continue;
            };
            self.check_array(*to)?;
            let value = self.target_type(*to);
            self.table.set_body(
                id,
                false,
                vec![
                    NativeField::new("ref_count", NativeType::U32),
                    NativeField::new("arena", NativeType::OPAQUE_PTR),
                    NativeField::new("value", value),
                ],
            );
        }
        let maps: Vec<_> = self.maps.values().copied().collect();
        for shape in maps {
            self.check_array(shape.value)?;
            let key = self.target_type(shape.key);
            let value = self.target_type(shape.value);
            self.table.set_body(
                shape.element,
                false,
                vec![NativeField::new("key", key), NativeField::new("value", value)],
            );
            self.table.set_body(
                shape.header,
                false,
                vec![
                    NativeField::new("ref_count", NativeType::U32),
                    NativeField::new("arena", NativeType::OPAQUE_PTR),
                    NativeField::new("count", NativeType::U64),
                    NativeField::new("capacity", NativeType::U64),
                    NativeField::new(
                        "elements",
                        NativeType::Pointer(Pointee::Struct(shape.element)),
                    ),
                ],
            );
        }
        Ok(())
    }

    /// Static arrays are copied bytewise and never reference counted, so
    /// they may not hold reference-counted elements.
    fn check_array(&self, ty: TypeId) -> Result<(), CodegenError> {
        if let TypeKind::StaticArray { elem, .. } = self.types.underlying_kind(ty) {
            if self.types.is_ref_counted(*elem) {
                return Err(CodegenError::RefCountedArray {
                    ty: self.types.name(ty).to_string(),
                });
            }
        }
        Ok(())
    }

    /// Packed storage struct with explicit `__dummyN` padding so that field
    /// offsets match the storage ABI exactly.
    fn build_storage_class(&mut self, class: TypeId) -> Result<(), CodegenError> {
        let Some(NativeType::Struct(id)) = self.storage.get(&class).cloned() else {
            return Ok(());
        };
        let Some(fields) = self.types.class_fields(class) else {
            return Ok(());
        };
        let abi = self.storage_layout();
        let mut native = Vec::with_capacity(fields.len());
        let mut offset = 0;
        let mut dummies = 0;
        let mut pad = |native: &mut Vec<NativeField>, bytes: u32| {
            native.push(NativeField::new(
                format!("__dummy{dummies}"),
                NativeType::bytes(bytes),
            ));
            dummies += 1;
        };
        for field in fields {
            let aligned = align_up(offset, abi.alignment(field.ty)?);
            if aligned > offset {
                pad(&mut native, aligned - offset);
            }
            native.push(NativeField::new(
                field.name.clone(),
                self.storage_type(field.ty)?,
            ));
            offset = aligned + abi.alloca_size(field.ty)?;
        }
        let total = abi.alloca_size(class)?;
        if total > offset {
            pad(&mut native, total - offset);
        }
        self.table.set_body(id, true, native);
        Ok(())
    }

    fn builtin_target(&self, builtin: Builtin) -> NativeType {
        let layout = &self.target_abi.memory_layout;
        let sized = |bytes: u32, signed: bool| {
            NativeType::int(bytes, signed).unwrap_or(NativeType::Int { bits: 64, signed })
        };
        match builtin {
            Builtin::Void => NativeType::Void,
            Builtin::Bool | Builtin::Uint8 => NativeType::BOOL,
            Builtin::Int8 => NativeType::Int {
                bits: 8,
                signed: true,
            },
            Builtin::Int16 => NativeType::Int {
                bits: 16,
                signed: true,
            },
            Builtin::Int32 => NativeType::Int {
                bits: 32,
                signed: true,
            },
            Builtin::Int64 => NativeType::Int {
                bits: 64,
                signed: true,
            },
            Builtin::Uint16 => NativeType::Int {
                bits: 16,
                signed: false,
            },
            Builtin::Uint32 => NativeType::U32,
            Builtin::Uint64 => NativeType::U64,
            Builtin::Float32 => NativeType::F32,
            Builtin::Float64 => NativeType::F64,
            Builtin::Int => sized(layout.integer.size, true),
            Builtin::Uint => sized(layout.integer.size, false),
            Builtin::Size => sized(layout.size.size, false),
            Builtin::Char => sized(layout.char.size, false),
            Builtin::String => NativeType::Pointer(Pointee::Struct(self.string)),
            Builtin::Any | Builtin::Message => NativeType::OPAQUE_PTR,
        }
    }

    /// How a value is held while compiled code runs.
    ///
    /// # Panics
    /// If a class, reference or map was never registered by any API.
    pub fn target_type(&self, ty: TypeId) -> NativeType {
        let ty = self.types.underlying(ty);
        match self.types.kind(ty) {
            TypeKind::Builtin(builtin) => self.builtin_target(*builtin),
            TypeKind::Enum { .. } => NativeType::U32,
            TypeKind::Pointer { .. } => NativeType::U64,
            TypeKind::StaticArray { elem, count } => {
                NativeType::Array(Box::new(self.target_type(*elem)), *count)
            }
            TypeKind::Slice { .. } => NativeType::Struct(self.slice),
            TypeKind::Class { .. } | TypeKind::Reference { .. } | TypeKind::Map { .. } => {
                match self.target.get(&ty) {
                    Some(native) => native.clone(),
                    None => panic!(
                        "type `{}` was not registered by any API",
                        self.types.name(ty)
                    ),
                }
            }
            TypeKind::Pseudonym { .. } => unreachable!("underlying strips pseudonyms"),
        }
    }

    /// How a value is packed in a storage buffer.
    pub fn storage_type(&self, ty: TypeId) -> Result<NativeType, CodegenError> {
        let ty = self.types.underlying(ty);
        let layout = &self.storage_abi.memory_layout;
        let sized = |bytes: u32, signed: bool, what: &'static str| {
            NativeType::int(bytes, signed).ok_or_else(|| CodegenError::UnsupportedWidth {
                abi: self.storage_abi.name.clone(),
                what,
                bytes,
            })
        };
        let not_storable = || CodegenError::NotStorable {
            ty: self.types.name(ty).to_string(),
        };
        match self.types.kind(ty) {
            TypeKind::Builtin(builtin) => match builtin {
                Builtin::Void | Builtin::String | Builtin::Any | Builtin::Message => {
                    Err(not_storable())
                }
                Builtin::Int => sized(layout.integer.size, true, "integer"),
                Builtin::Uint => sized(layout.integer.size, false, "integer"),
                Builtin::Size => sized(layout.size.size, false, "size"),
                Builtin::Char => sized(layout.char.size, false, "char"),
                other => Ok(self.builtin_target(*other)),
            },
            TypeKind::Enum { .. } => Ok(NativeType::U32),
            TypeKind::Pointer { .. } => sized(layout.pointer.size, false, "pointer"),
            TypeKind::StaticArray { elem, count } => Ok(NativeType::Array(
                Box::new(self.storage_type(*elem)?),
                *count,
            )),
            TypeKind::Class { .. } => self.storage.get(&ty).cloned().ok_or_else(not_storable),
            TypeKind::Slice { .. } | TypeKind::Reference { .. } | TypeKind::Map { .. } => {
                Err(not_storable())
            }
            TypeKind::Pseudonym { .. } => unreachable!("underlying strips pseudonyms"),
        }
    }

    /// Size in bytes of the target representation.
    pub fn size_of(&self, ty: TypeId) -> u32 {
        self.table.size_of(&self.target_type(ty))
    }

    pub fn align_of(&self, ty: TypeId) -> u32 {
        self.table.align_of(&self.target_type(ty))
    }

    /// Distance between consecutive elements of `ty` in a storage buffer.
    pub fn storage_stride(&self, ty: TypeId) -> Result<u32, CodegenError> {
        Ok(self.storage_layout().alloca_size(ty)?)
    }

    pub fn target_struct(&self, ty: TypeId) -> Option<StructId> {
        match self.target.get(&self.types.underlying(ty)) {
            Some(NativeType::Struct(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn storage_struct(&self, ty: TypeId) -> Option<StructId> {
        match self.storage.get(&self.types.underlying(ty)) {
            Some(NativeType::Struct(id)) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxil_semantic::{Field, ProgramBuilder};

    fn program() -> (Program, TypeId, TypeId, TypeId) {
        let mut builder = ProgramBuilder::new();
        let api = builder.api("gles");
        let vertex = builder.class(api, "Vertex");
        let ptr = builder.types().pointer(Builtin::Uint8.id());
        builder
            .define_class(
                vertex,
                vec![
                    Field::new("flag", Builtin::Bool.id()),
                    Field::new("position", Builtin::Int64.id()),
                    Field::new("count", Builtin::Int.id()),
                    Field::new("data", ptr),
                    Field::new("tag", Builtin::Uint16.id()),
                ],
            )
            .unwrap();
        let node = builder.class(api, "Node");
        let boxed = builder.reference(api, node);
        let names = builder.map(api, Builtin::Uint32.id(), Builtin::String.id());
        builder
            .define_class(
                node,
                vec![
                    Field::new("next", boxed),
                    Field::new("names", names),
                ],
            )
            .unwrap();
        (builder.finish().unwrap(), vertex, boxed, names)
    }

    fn lowered<'p>(program: &'p Program, storage: Abi) -> TypeLowering<'p> {
        let mut lowering = TypeLowering::new(&program.types, Abi::x86_64(), storage);
        lowering.declare(program);
        lowering.build().expect("build should succeed");
        lowering.table.compute_layouts().expect("layout should succeed");
        lowering
    }

    #[test]
    fn storage_struct_padding_matches_the_abi_engine() {
        let (program, vertex, _, _) = program();
        let abi = Abi::armv7a();
        let lowering = lowered(&program, abi.clone());
        let storage = lowering.storage_struct(vertex).expect("vertex is storable");
        let engine = AbiLayout::new(&program.types, &abi.memory_layout);
        let expected = engine.field_offsets(vertex).unwrap();
        let fields = program.types.class_fields(vertex).unwrap();
        for (field, offset) in fields.iter().zip(expected) {
            assert_eq!(
                lowering.table.field_offset(storage, &field.name),
                offset,
                "field `{}`",
                field.name
            );
        }
        assert_eq!(
            lowering.table.size_of(&NativeType::Struct(storage)),
            engine.alloca_size(vertex).unwrap()
        );
        assert!(lowering.table.is_packed(storage));
        assert_ne!(storage, lowering.target_struct(vertex).unwrap());
    }

    #[test]
    fn same_abi_reuses_the_target_struct_for_storage() {
        let (program, vertex, _, _) = program();
        let lowering = lowered(&program, Abi::x86_64());
        assert_eq!(
            lowering.storage_struct(vertex),
            lowering.target_struct(vertex)
        );
        let engine = AbiLayout::new(&program.types, &lowering.target_abi.memory_layout);
        assert_eq!(
            lowering.size_of(vertex),
            engine.alloca_size(vertex).unwrap()
        );
    }

    #[test]
    fn references_and_maps_lower_to_pointers_at_runtime_headers() {
        let (program, _, boxed, names) = program();
        let lowering = lowered(&program, Abi::x86_64());
        assert!(matches!(
            lowering.target_type(boxed),
            NativeType::Pointer(Pointee::Struct(_))
        ));
        let shape = lowering.maps[&names];
        let table = &lowering.table;
        assert_eq!(
            table.field_offset(shape.header, "count") as usize,
            std::mem::offset_of!(crate::runtime::MapHeader, count)
        );
        assert_eq!(
            table.field_offset(shape.header, "elements") as usize,
            std::mem::offset_of!(crate::runtime::MapHeader, elements)
        );
        assert_eq!(
            table.field_offset(lowering.string, "length") as usize,
            std::mem::offset_of!(crate::runtime::StringHeader, length)
        );
        assert_eq!(
            table.size_of(&NativeType::Struct(lowering.slice)) as usize,
            std::mem::size_of::<crate::runtime::Slice>()
        );
    }

    #[test]
    fn heap_types_have_no_storage_form() {
        let (program, _, boxed, names) = program();
        let lowering = lowered(&program, Abi::armv7a());
        assert!(matches!(
            lowering.storage_type(boxed),
            Err(CodegenError::NotStorable { .. })
        ));
        assert!(lowering.storage_type(names).is_err());
        assert!(lowering.storage_type(Builtin::String.id()).is_err());
    }

    #[test]
    #[should_panic(expected = "was not registered")]
    fn unregistered_class_is_fatal() {
        let mut builder = ProgramBuilder::new();
        builder.api("gles");
        let orphan = builder.types().declare_class("Orphan");
        builder.types().define_class(orphan, vec![]).unwrap();
        let program = builder.finish().unwrap();
        let lowering = lowered(&program, Abi::x86_64());
        lowering.target_type(orphan);
    }
}
