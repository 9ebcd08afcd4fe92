//! Command body IR.
//!
//! Bodies arrive already resolved and type-checked: every literal carries
//! the type it should be materialised as and every name refers to an
//! existing parameter, global or local.

use serde::{Deserialize, Serialize};

use crate::TypeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Bool(bool),
    /// Integer, enum or pointer literal of the given type.
    Int { ty: TypeId, value: i64 },
    Float { ty: TypeId, value: f64 },
    Str(String),
    /// The default-initialised value of a type: zero scalars, the shared
    /// empty string, a fresh empty map, a class with its field defaults.
    Zero(TypeId),
    Param(String),
    Global(String),
    Local(String),
    Field { base: Box<Expr>, field: String },
    ClassInit { class: TypeId, fields: Vec<(String, Expr)> },
    MapLookup { map: Box<Expr>, key: Box<Expr> },
    MapContains { map: Box<Expr>, key: Box<Expr> },
    MapLength(Box<Expr>),
    New { reference: TypeId, value: Box<Expr> },
    Deref(Box<Expr>),
    IsNull(Box<Expr>),
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Not(Box<Expr>),
    /// A slice over a fresh pool large enough for `count` elements.
    MakeSlice { slice: TypeId, count: u64 },
    /// A slice over application memory starting at a pointer value.
    PointerSlice { slice: TypeId, ptr: Box<Expr>, count: Box<Expr> },
    SliceIndex { slice: Box<Expr>, index: Box<Expr> },
    SliceLength(Box<Expr>),
    CStringToSlice { slice: TypeId, ptr: Box<Expr> },
    /// Stores the bytes of a slice in the content database and yields the
    /// `u8[20]` content id.
    StoreInDatabase(Box<Expr>),
}

impl Expr {
    pub fn int(ty: TypeId, value: i64) -> Self {
        Expr::Int { ty, value }
    }

    pub fn float(ty: TypeId, value: f64) -> Self {
        Expr::Float { ty, value }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Str(value.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Param(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        Expr::Global(name.into())
    }

    pub fn local(name: impl Into<String>) -> Self {
        Expr::Local(name.into())
    }

    pub fn field(self, field: impl Into<String>) -> Self {
        Expr::Field {
            base: Box::new(self),
            field: field.into(),
        }
    }

    pub fn lookup(self, key: Expr) -> Self {
        Expr::MapLookup {
            map: Box::new(self),
            key: Box::new(key),
        }
    }

    pub fn contains(self, key: Expr) -> Self {
        Expr::MapContains {
            map: Box::new(self),
            key: Box::new(key),
        }
    }

    pub fn length(self) -> Self {
        Expr::MapLength(Box::new(self))
    }

    pub fn new_ref(reference: TypeId, value: Expr) -> Self {
        Expr::New {
            reference,
            value: Box::new(value),
        }
    }

    pub fn deref(self) -> Self {
        Expr::Deref(Box::new(self))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn index(self, index: Expr) -> Self {
        Expr::SliceIndex {
            slice: Box::new(self),
            index: Box::new(index),
        }
    }
}

/// An assignable location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LValue {
    Global(String),
    Local(String),
    Field { base: Box<LValue>, field: String },
    MapIndex { map: Box<Expr>, key: Box<Expr> },
    /// The value held by a reference.
    Deref(Box<Expr>),
}

impl LValue {
    pub fn global(name: impl Into<String>) -> Self {
        LValue::Global(name.into())
    }

    pub fn local(name: impl Into<String>) -> Self {
        LValue::Local(name.into())
    }

    pub fn field(self, field: impl Into<String>) -> Self {
        LValue::Field {
            base: Box::new(self),
            field: field.into(),
        }
    }

    pub fn map_index(map: Expr, key: Expr) -> Self {
        LValue::MapIndex {
            map: Box::new(map),
            key: Box::new(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Assign { target: LValue, value: Expr },
    MapRemove { map: Expr, key: Expr },
    MapClear(Expr),
    If { cond: Expr, then: Block, otherwise: Block },
    Block(Block),
    Return(Option<Expr>),
    Abort,
    SliceWrite { slice: Expr, index: Expr, value: Expr },
    SliceCopy { dst: Expr, src: Expr },
    ApplyReads,
    ApplyWrites,
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            value,
        }
    }

    pub fn assign(target: LValue, value: Expr) -> Self {
        Stmt::Assign { target, value }
    }

    pub fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then: Block(then),
            otherwise: Block(otherwise),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block(pub Vec<Stmt>);

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self(stmts)
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.0
    }
}
