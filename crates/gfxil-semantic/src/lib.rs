//! Semantic model for gfxil.
//!
//! This crate describes a graphics-API command set the way the compiler
//! consumes it: an arena of semantic types, one [`Api`] per registered API
//! (classes, references, maps, slices, globals, commands) and the small
//! statement/expression IR used for command bodies and global defaults.
//!
//! Types are addressed by [`TypeId`] handles into a frozen [`Types`] arena.
//! Identity, not structure, distinguishes types: two `ref!Foo` types created
//! separately are different semantic types even though they lower to the
//! same native representation.

use std::fmt;

use serde::{Deserialize, Serialize};

mod body;
mod program;

pub use body::{BinaryOp, Block, Expr, LValue, Stmt};
pub use program::{Api, ApiId, Command, Global, Param, Program, ProgramBuilder};

/// Number of bytes in a content-database identifier.
pub const CONTENT_ID_SIZE: u32 = 20;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Handle to a semantic type inside a [`Types`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

/// Builtin scalar and opaque types.
///
/// `Int`, `Uint` and `Size` are the platform-sized integers whose width is
/// chosen by the ABI in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Builtin {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Int,
    Uint,
    Size,
    Char,
    String,
    Any,
    Message,
}

impl Builtin {
    pub const ALL: [Builtin; 19] = [
        Builtin::Void,
        Builtin::Bool,
        Builtin::Int8,
        Builtin::Int16,
        Builtin::Int32,
        Builtin::Int64,
        Builtin::Uint8,
        Builtin::Uint16,
        Builtin::Uint32,
        Builtin::Uint64,
        Builtin::Float32,
        Builtin::Float64,
        Builtin::Int,
        Builtin::Uint,
        Builtin::Size,
        Builtin::Char,
        Builtin::String,
        Builtin::Any,
        Builtin::Message,
    ];

    /// Builtins occupy the first slots of every arena, in declaration order.
    pub const fn id(self) -> TypeId {
        TypeId(self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Void => "void",
            Builtin::Bool => "bool",
            Builtin::Int8 => "s8",
            Builtin::Int16 => "s16",
            Builtin::Int32 => "s32",
            Builtin::Int64 => "s64",
            Builtin::Uint8 => "u8",
            Builtin::Uint16 => "u16",
            Builtin::Uint32 => "u32",
            Builtin::Uint64 => "u64",
            Builtin::Float32 => "f32",
            Builtin::Float64 => "f64",
            Builtin::Int => "int",
            Builtin::Uint => "uint",
            Builtin::Size => "size",
            Builtin::Char => "char",
            Builtin::String => "string",
            Builtin::Any => "any",
            Builtin::Message => "message",
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Builtin::Int8 | Builtin::Int16 | Builtin::Int32 | Builtin::Int64 | Builtin::Int
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Builtin::Float32 | Builtin::Float64)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A named class field with an optional default initialiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
    pub default: Option<Expr>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Expr) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeKind {
    Builtin(Builtin),
    StaticArray { elem: TypeId, count: u32 },
    Slice { elem: TypeId },
    Pointer { to: TypeId },
    Class { fields: Vec<Field> },
    Reference { to: TypeId },
    Map { key: TypeId, value: TypeId },
    /// Enumerations are backed by a `u32`.
    Enum { entries: Vec<(String, u32)> },
    Pseudonym { to: TypeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
}

/// Frozen arena of semantic types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Types {
    defs: Vec<TypeDef>,
    content_id: TypeId,
}

impl Types {
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.defs[id.index()]
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.get(id).kind
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.get(id).name
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> {
        self.defs
            .iter()
            .enumerate()
            .map(|(index, def)| (TypeId(index as u32), def))
    }

    /// The `u8[20]` type produced by storing a slice in the content database.
    pub fn content_id(&self) -> TypeId {
        self.content_id
    }

    /// Follows pseudonyms until a non-alias type is reached.
    pub fn underlying(&self, mut id: TypeId) -> TypeId {
        while let TypeKind::Pseudonym { to } = self.kind(id) {
            id = *to;
        }
        id
    }

    pub fn underlying_kind(&self, id: TypeId) -> &TypeKind {
        self.kind(self.underlying(id))
    }

    pub fn as_builtin(&self, id: TypeId) -> Option<Builtin> {
        match self.underlying_kind(id) {
            TypeKind::Builtin(builtin) => Some(*builtin),
            _ => None,
        }
    }

    pub fn class_fields(&self, id: TypeId) -> Option<&[Field]> {
        match self.underlying_kind(id) {
            TypeKind::Class { fields } => Some(fields),
            _ => None,
        }
    }

    pub fn class_field(&self, id: TypeId, name: &str) -> Option<&Field> {
        self.class_fields(id)?.iter().find(|field| field.name == name)
    }

    /// Whether values of this type carry a reference count, either directly
    /// (strings, slices, references, maps) or through a class field.
    pub fn is_ref_counted(&self, id: TypeId) -> bool {
        match self.underlying_kind(id) {
            TypeKind::Builtin(Builtin::String) => true,
            TypeKind::Slice { .. } | TypeKind::Reference { .. } | TypeKind::Map { .. } => true,
            TypeKind::Class { fields } => fields.iter().any(|field| self.is_ref_counted(field.ty)),
            _ => false,
        }
    }

    /// Whether a value of this type can be packed into a storage buffer.
    pub fn is_storage_type(&self, id: TypeId) -> bool {
        match self.underlying_kind(id) {
            TypeKind::Builtin(builtin) => !matches!(
                builtin,
                Builtin::Void | Builtin::String | Builtin::Any | Builtin::Message
            ),
            TypeKind::Enum { .. } | TypeKind::Pointer { .. } => true,
            TypeKind::StaticArray { elem, .. } => self.is_storage_type(*elem),
            TypeKind::Class { fields } => fields.iter().all(|field| self.is_storage_type(field.ty)),
            TypeKind::Slice { .. } | TypeKind::Reference { .. } | TypeKind::Map { .. } => false,
            TypeKind::Pseudonym { .. } => unreachable!("underlying strips pseudonyms"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SemanticError {
    #[error("class `{0}` was declared but never defined")]
    UndefinedClass(String),
    #[error("type {0} is not a class")]
    NotAClass(TypeId),
    #[error("class `{0}` is already defined")]
    ClassRedefined(String),
    #[error("class `{class}` has duplicate field `{field}`")]
    DuplicateField { class: String, field: String },
    #[error("unknown type handle {0}")]
    UnknownType(TypeId),
    #[error("unknown api handle {0}")]
    UnknownApi(u32),
    #[error("api `{api}` already has a global named `{name}`")]
    DuplicateGlobal { api: String, name: String },
    #[error("api `{api}` already has a command named `{name}`")]
    DuplicateCommand { api: String, name: String },
    #[error("class `{0}` contains itself by value")]
    RecursiveClass(String),
}

/// Mutable builder for a [`Types`] arena.
///
/// Classes are created in two steps so that mutually recursive classes can
/// refer to each other through references: [`TypesBuilder::declare_class`]
/// hands out the id, [`TypesBuilder::define_class`] supplies the fields.
#[derive(Debug, Clone)]
pub struct TypesBuilder {
    defs: Vec<TypeDef>,
    content_id: TypeId,
    pending_classes: Vec<TypeId>,
}

impl Default for TypesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TypesBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            defs: Builtin::ALL
                .iter()
                .map(|builtin| TypeDef {
                    name: builtin.name().to_string(),
                    kind: TypeKind::Builtin(*builtin),
                })
                .collect(),
            content_id: TypeId(0),
            pending_classes: Vec::new(),
        };
        builder.content_id = builder.static_array(Builtin::Uint8.id(), CONTENT_ID_SIZE);
        builder
    }

    fn push(&mut self, name: String, kind: TypeKind) -> TypeId {
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(TypeDef { name, kind });
        id
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.defs[id.index()].name
    }

    pub fn content_id(&self) -> TypeId {
        self.content_id
    }

    pub fn static_array(&mut self, elem: TypeId, count: u32) -> TypeId {
        let name = format!("{}[{count}]", self.name(elem));
        self.push(name, TypeKind::StaticArray { elem, count })
    }

    pub fn slice(&mut self, elem: TypeId) -> TypeId {
        let name = format!("{}[]", self.name(elem));
        self.push(name, TypeKind::Slice { elem })
    }

    pub fn pointer(&mut self, to: TypeId) -> TypeId {
        let name = format!("{}*", self.name(to));
        self.push(name, TypeKind::Pointer { to })
    }

    pub fn reference(&mut self, to: TypeId) -> TypeId {
        let name = format!("ref!{}", self.name(to));
        self.push(name, TypeKind::Reference { to })
    }

    pub fn map(&mut self, key: TypeId, value: TypeId) -> TypeId {
        let name = format!("map!{}!{}", self.name(key), self.name(value));
        self.push(name, TypeKind::Map { key, value })
    }

    pub fn enumeration(&mut self, name: impl Into<String>, entries: Vec<(String, u32)>) -> TypeId {
        self.push(name.into(), TypeKind::Enum { entries })
    }

    pub fn pseudonym(&mut self, name: impl Into<String>, to: TypeId) -> TypeId {
        self.push(name.into(), TypeKind::Pseudonym { to })
    }

    pub fn declare_class(&mut self, name: impl Into<String>) -> TypeId {
        let id = self.push(name.into(), TypeKind::Class { fields: Vec::new() });
        self.pending_classes.push(id);
        id
    }

    pub fn define_class(&mut self, id: TypeId, fields: Vec<Field>) -> Result<(), SemanticError> {
        let def = self.defs.get(id.index()).ok_or(SemanticError::UnknownType(id))?;
        if !matches!(def.kind, TypeKind::Class { .. }) {
            return Err(SemanticError::NotAClass(id));
        }
        let Some(position) = self.pending_classes.iter().position(|pending| *pending == id) else {
            return Err(SemanticError::ClassRedefined(def.name.clone()));
        };
        for (index, field) in fields.iter().enumerate() {
            if field.ty.index() >= self.defs.len() {
                return Err(SemanticError::UnknownType(field.ty));
            }
            if fields[..index].iter().any(|other| other.name == field.name) {
                return Err(SemanticError::DuplicateField {
                    class: def.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        self.pending_classes.swap_remove(position);
        self.defs[id.index()].kind = TypeKind::Class { fields };
        Ok(())
    }

    pub fn finish(self) -> Result<Types, SemanticError> {
        if let Some(pending) = self.pending_classes.first() {
            return Err(SemanticError::UndefinedClass(
                self.defs[pending.index()].name.clone(),
            ));
        }
        let types = Types {
            defs: self.defs,
            content_id: self.content_id,
        };
        for (id, def) in types.iter() {
            if matches!(def.kind, TypeKind::Class { .. }) && contains_by_value(&types, id, id, 0) {
                return Err(SemanticError::RecursiveClass(def.name.clone()));
            }
        }
        Ok(types)
    }
}

fn contains_by_value(types: &Types, root: TypeId, current: TypeId, depth: usize) -> bool {
    if depth > types.len() {
        return true;
    }
    let current = types.underlying(current);
    match types.kind(current) {
        TypeKind::Class { fields } => fields.iter().any(|field| {
            let ty = types.underlying(field.ty);
            ty == root || contains_by_value(types, root, ty, depth + 1)
        }),
        TypeKind::StaticArray { elem, .. } => {
            let elem = types.underlying(*elem);
            elem == root || contains_by_value(types, root, elem, depth + 1)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_live_at_fixed_handles() {
        let types = TypesBuilder::new().finish().unwrap();
        for builtin in Builtin::ALL {
            assert_eq!(types.kind(builtin.id()), &TypeKind::Builtin(builtin));
        }
        assert_eq!(types.name(types.content_id()), "u8[20]");
    }

    #[test]
    fn ref_counting_is_transitive_through_classes_and_pseudonyms() {
        let mut builder = TypesBuilder::new();
        let inner = builder.declare_class("Inner");
        let outer = builder.declare_class("Outer");
        let plain = builder.declare_class("Plain");
        let alias = builder.pseudonym("Name", Builtin::String.id());
        builder
            .define_class(inner, vec![Field::new("name", alias)])
            .unwrap();
        builder
            .define_class(
                outer,
                vec![
                    Field::new("id", Builtin::Uint32.id()),
                    Field::new("inner", inner),
                ],
            )
            .unwrap();
        builder
            .define_class(plain, vec![Field::new("x", Builtin::Float32.id())])
            .unwrap();
        let types = builder.finish().unwrap();

        assert!(types.is_ref_counted(inner));
        assert!(types.is_ref_counted(outer));
        assert!(!types.is_ref_counted(plain));
        assert!(types.is_storage_type(plain));
        assert!(!types.is_storage_type(outer));
    }

    #[test]
    fn distinct_references_to_the_same_type_keep_their_identity() {
        let mut builder = TypesBuilder::new();
        let a = builder.reference(Builtin::Uint32.id());
        let b = builder.reference(Builtin::Uint32.id());
        assert_ne!(a, b);
        assert_eq!(builder.name(a), builder.name(b));
    }

    #[test]
    fn undefined_class_is_rejected() {
        let mut builder = TypesBuilder::new();
        builder.declare_class("Dangling");
        assert_eq!(
            builder.finish(),
            Err(SemanticError::UndefinedClass("Dangling".into()))
        );
    }

    #[test]
    fn class_cannot_contain_itself_by_value() {
        let mut builder = TypesBuilder::new();
        let node = builder.declare_class("Node");
        let boxed = builder.reference(node);
        let pair = builder.static_array(node, 2);
        builder
            .define_class(node, vec![Field::new("next", boxed), Field::new("pair", pair)])
            .unwrap();
        assert_eq!(
            builder.finish(),
            Err(SemanticError::RecursiveClass("Node".into()))
        );
    }

    #[test]
    fn self_reference_through_a_box_is_fine() {
        let mut builder = TypesBuilder::new();
        let node = builder.declare_class("Node");
        let boxed = builder.reference(node);
        builder
            .define_class(node, vec![Field::new("next", boxed)])
            .unwrap();
        let types = builder.finish().unwrap();
        assert!(types.is_ref_counted(node));
    }
}
