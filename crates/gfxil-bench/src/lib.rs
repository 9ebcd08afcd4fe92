//! Program fixtures shared by the benchmarks.

use gfxil_semantic::{
    BinaryOp, Builtin, Command, Expr, Field, LValue, Program, ProgramBuilder, SemanticError, Stmt,
};

/// `classes` texture-like classes, each with a string label, kept in one
/// map per class plus a create/delete command pair per class.
pub fn object_tables(classes: usize) -> Result<Program, SemanticError> {
    let mut builder = ProgramBuilder::new();
    let gles = builder.api("gles");
    let u32_ty = Builtin::Uint32.id();
    for i in 0..classes {
        let class = builder.class(gles, format!("Object{i}"));
        builder.define_class(
            class,
            vec![
                Field::new("id", u32_ty),
                Field::new("width", u32_ty),
                Field::new("label", Builtin::String.id())
                    .with_default(Expr::string(format!("object {i}"))),
            ],
        )?;
        let table = builder.map(gles, u32_ty, class);
        let global = format!("Objects{i}");
        builder.global(gles, global.clone(), table, None)?;
        let entry = || LValue::map_index(Expr::global(global.clone()), Expr::param("id"));
        builder.command(
            gles,
            Command::new(format!("glCreate{i}"))
                .param("id", u32_ty)
                .body(vec![
                    Stmt::assign(entry(), Expr::Zero(class)),
                    Stmt::assign(entry().field("id"), Expr::param("id")),
                ]),
        )?;
        builder.command(
            gles,
            Command::new(format!("glDelete{i}"))
                .param("id", u32_ty)
                .body(vec![Stmt::MapRemove {
                    map: Expr::global(global.clone()),
                    key: Expr::param("id"),
                }]),
        )?;
    }
    builder.finish()
}

/// A counter with one `add` command, the cheapest useful command.
pub fn counter() -> Result<Program, SemanticError> {
    let mut builder = ProgramBuilder::new();
    let gles = builder.api("gles");
    let u32_ty = Builtin::Uint32.id();
    builder.global(gles, "Count", u32_ty, None)?;
    builder.command(
        gles,
        Command::new("add").param("n", u32_ty).body(vec![Stmt::assign(
            LValue::global("Count"),
            Expr::binary(BinaryOp::Add, Expr::global("Count"), Expr::param("n")),
        )]),
    )?;
    builder.finish()
}

/// Stores `size` observed bytes at `data` in the content database.
pub fn buffer_upload() -> Result<Program, SemanticError> {
    let mut builder = ProgramBuilder::new();
    let gles = builder.api("gles");
    let u64_ty = Builtin::Uint64.id();
    let bytes = builder.slice(gles, Builtin::Uint8.id());
    let content_id = builder.types().content_id();
    builder.global(gles, "LastBlob", content_id, None)?;
    let source = Expr::PointerSlice {
        slice: bytes,
        ptr: Box::new(Expr::param("data")),
        count: Box::new(Expr::param("size")),
    };
    builder.command(
        gles,
        Command::new("glBufferData")
            .param("data", u64_ty)
            .param("size", u64_ty)
            .body(vec![
                Stmt::ApplyReads,
                Stmt::assign(
                    LValue::global("LastBlob"),
                    Expr::StoreInDatabase(Box::new(source)),
                ),
            ]),
    )?;
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_are_well_formed() {
        let tables = object_tables(3).unwrap();
        let gles = tables.api("gles").unwrap();
        assert_eq!(gles.commands.len(), 6);
        assert_eq!(gles.maps.len(), 3);
        assert_eq!(counter().unwrap().apis[0].commands.len(), 1);
        assert_eq!(buffer_upload().unwrap().apis[0].slices.len(), 1);
    }
}
