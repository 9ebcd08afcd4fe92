use serde::{Deserialize, Serialize};

use crate::{Block, Expr, Field, SemanticError, Stmt, TypeId, Types, TypesBuilder};

/// Index of an API within a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: TypeId,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub params: Vec<Param>,
    pub result: Option<TypeId>,
    pub body: Block,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            result: None,
            body: Block::default(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeId) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn result(mut self, ty: TypeId) -> Self {
        self.result = Some(ty);
        self
    }

    pub fn body(mut self, stmts: Vec<Stmt>) -> Self {
        self.body = Block(stmts);
        self
    }
}

/// Everything one graphics API contributes to a program.
///
/// The class/reference/map/slice lists are the types this API registers for
/// lowering; every such type reachable from a global, parameter or body must
/// be listed by some API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Api {
    pub name: String,
    pub index: u32,
    pub classes: Vec<TypeId>,
    pub references: Vec<TypeId>,
    pub maps: Vec<TypeId>,
    pub slices: Vec<TypeId>,
    pub globals: Vec<Global>,
    pub commands: Vec<Command>,
}

impl Api {
    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|global| global.name == name)
    }

    pub fn command_index(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|command| command.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub types: Types,
    pub apis: Vec<Api>,
}

impl Program {
    pub fn api(&self, name: &str) -> Option<&Api> {
        self.apis.iter().find(|api| api.name == name)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Incrementally assembles a [`Program`].
///
/// API-scoped type constructors create the type in the shared arena and
/// register it with the API in one step.
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    types: TypesBuilder,
    apis: Vec<Api>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&mut self) -> &mut TypesBuilder {
        &mut self.types
    }

    pub fn api(&mut self, name: impl Into<String>) -> ApiId {
        let index = self.apis.len() as u32;
        self.apis.push(Api {
            name: name.into(),
            index,
            classes: Vec::new(),
            references: Vec::new(),
            maps: Vec::new(),
            slices: Vec::new(),
            globals: Vec::new(),
            commands: Vec::new(),
        });
        ApiId(index)
    }

    fn api_mut(&mut self, api: ApiId) -> &mut Api {
        &mut self.apis[api.0 as usize]
    }

    pub fn class(&mut self, api: ApiId, name: impl Into<String>) -> TypeId {
        let id = self.types.declare_class(name);
        self.api_mut(api).classes.push(id);
        id
    }

    pub fn define_class(&mut self, id: TypeId, fields: Vec<Field>) -> Result<(), SemanticError> {
        self.types.define_class(id, fields)
    }

    pub fn reference(&mut self, api: ApiId, to: TypeId) -> TypeId {
        let id = self.types.reference(to);
        self.api_mut(api).references.push(id);
        id
    }

    pub fn map(&mut self, api: ApiId, key: TypeId, value: TypeId) -> TypeId {
        let id = self.types.map(key, value);
        self.api_mut(api).maps.push(id);
        id
    }

    pub fn slice(&mut self, api: ApiId, elem: TypeId) -> TypeId {
        let id = self.types.slice(elem);
        self.api_mut(api).slices.push(id);
        id
    }

    pub fn global(
        &mut self,
        api: ApiId,
        name: impl Into<String>,
        ty: TypeId,
        default: Option<Expr>,
    ) -> Result<(), SemanticError> {
        let name = name.into();
        let target = self.api_mut(api);
        if target.global(&name).is_some() {
            return Err(SemanticError::DuplicateGlobal {
                api: target.name.clone(),
                name,
            });
        }
        target.globals.push(Global { name, ty, default });
        Ok(())
    }

    /// Adds a command and returns its index within the API.
    pub fn command(&mut self, api: ApiId, command: Command) -> Result<u32, SemanticError> {
        let target = self.api_mut(api);
        if target.command_index(&command.name).is_some() {
            return Err(SemanticError::DuplicateCommand {
                api: target.name.clone(),
                name: command.name,
            });
        }
        target.commands.push(command);
        Ok(target.commands.len() as u32 - 1)
    }

    pub fn finish(self) -> Result<Program, SemanticError> {
        Ok(Program {
            types: self.types.finish()?,
            apis: self.apis,
        })
    }
}
