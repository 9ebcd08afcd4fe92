mod common;

use common::executor;
use gfxil_codegen::runtime::MAP_GROW_BY;
use gfxil_exec::{Env, Executor};
use gfxil_semantic::{Builtin, Command, Expr, LValue, ProgramBuilder, Stmt};

fn sizes() -> Executor {
    let mut builder = ProgramBuilder::new();
    let gles = builder.api("gles");
    let u32_ty = Builtin::Uint32.id();
    let sizes = builder.map(gles, u32_ty, u32_ty);
    builder.global(gles, "Sizes", sizes, None).unwrap();
    builder
        .command(
            gles,
            Command::new("glBufferSize")
                .param("id", u32_ty)
                .param("size", u32_ty)
                .body(vec![Stmt::assign(
                    LValue::map_index(Expr::global("Sizes"), Expr::param("id")),
                    Expr::param("size"),
                )]),
        )
        .unwrap();
    builder
        .command(
            gles,
            Command::new("glDeleteBuffer")
                .param("id", u32_ty)
                .body(vec![Stmt::MapRemove {
                    map: Expr::global("Sizes"),
                    key: Expr::param("id"),
                }]),
        )
        .unwrap();
    builder
        .command(
            gles,
            Command::new("glBufferSizeOf")
                .param("id", u32_ty)
                .result(u32_ty)
                .body(vec![Stmt::Return(Some(
                    Expr::global("Sizes").lookup(Expr::param("id")),
                ))]),
        )
        .unwrap();
    builder
        .command(
            gles,
            Command::new("glIsBuffer")
                .param("id", u32_ty)
                .result(Builtin::Bool.id())
                .body(vec![Stmt::Return(Some(
                    Expr::global("Sizes").contains(Expr::param("id")),
                ))]),
        )
        .unwrap();
    builder
        .command(
            gles,
            Command::new("glDeleteAll").body(vec![Stmt::MapClear(Expr::global("Sizes"))]),
        )
        .unwrap();
    executor(&builder.finish().unwrap())
}

fn run(executor: &Executor, env: &mut Env, name: &str, args: &[(&str, u32)]) -> Option<u32> {
    let mut cmd = executor.command("gles", name).unwrap();
    for (param, value) in args {
        cmd.set(param, *value).unwrap();
    }
    env.execute(0, &mut cmd).unwrap();
    cmd.result::<u32>()
}

fn is_buffer(executor: &Executor, env: &mut Env, id: u32) -> bool {
    let mut cmd = executor
        .command("gles", "glIsBuffer")
        .unwrap()
        .with("id", id)
        .unwrap();
    env.execute(0, &mut cmd).unwrap();
    cmd.result::<u8>() == Some(1)
}

#[test]
fn maps_grow_in_fixed_steps() {
    let executor = sizes();
    let mut env = executor.new_env();
    let header = |env: &Env| env.api_globals("gles").unwrap().map("Sizes").unwrap();
    assert_eq!((header(&env).count, header(&env).capacity), (0, 0));

    for id in 0..MAP_GROW_BY as u32 {
        run(&executor, &mut env, "glBufferSize", &[("id", id), ("size", id * 4)]);
    }
    assert_eq!(header(&env).count, 16);
    assert_eq!(header(&env).capacity, MAP_GROW_BY);

    run(&executor, &mut env, "glBufferSize", &[("id", 100), ("size", 1)]);
    assert_eq!(header(&env).count, 17);
    assert_eq!(header(&env).capacity, 2 * MAP_GROW_BY);

    // Overwriting an existing key does not add an entry.
    run(&executor, &mut env, "glBufferSize", &[("id", 3), ("size", 64)]);
    assert_eq!(header(&env).count, 17);
    assert_eq!(run(&executor, &mut env, "glBufferSizeOf", &[("id", 3)]), Some(64));
    assert_eq!(run(&executor, &mut env, "glBufferSizeOf", &[("id", 15)]), Some(60));
}

#[test]
fn every_entry_reads_back_after_growth() {
    let executor = sizes();
    let mut env = executor.new_env();
    let total = 2 * MAP_GROW_BY as u32 + 3;
    for id in 0..total {
        run(&executor, &mut env, "glBufferSize", &[("id", id), ("size", 1000 + id)]);
    }
    for id in 0..total {
        assert_eq!(
            run(&executor, &mut env, "glBufferSizeOf", &[("id", id)]),
            Some(1000 + id),
            "buffer {id}"
        );
    }
    // The last element sits at the end of the allocation.
    assert_eq!(
        run(&executor, &mut env, "glBufferSizeOf", &[("id", total - 1)]),
        Some(1000 + total - 1)
    );
}

#[test]
fn lookups_of_missing_keys_ignore_unrelated_entries() {
    let executor = sizes();
    let mut env = executor.new_env();
    run(&executor, &mut env, "glBufferSize", &[("id", 9), ("size", 77)]);
    assert_eq!(run(&executor, &mut env, "glBufferSizeOf", &[("id", 10)]), Some(0));
    assert!(!is_buffer(&executor, &mut env, 10));
    assert_eq!(run(&executor, &mut env, "glBufferSizeOf", &[("id", 9)]), Some(77));
    assert_eq!(env.api_globals("gles").unwrap().map("Sizes").unwrap().count, 1);
}

#[test]
fn removed_keys_are_gone_and_missing_keys_read_as_zero() {
    let executor = sizes();
    let mut env = executor.new_env();
    run(&executor, &mut env, "glBufferSize", &[("id", 1), ("size", 10)]);
    run(&executor, &mut env, "glBufferSize", &[("id", 2), ("size", 20)]);
    assert!(is_buffer(&executor, &mut env, 2));

    run(&executor, &mut env, "glDeleteBuffer", &[("id", 2)]);
    run(&executor, &mut env, "glDeleteBuffer", &[("id", 7)]);
    assert!(!is_buffer(&executor, &mut env, 2));
    assert!(is_buffer(&executor, &mut env, 1));
    assert_eq!(run(&executor, &mut env, "glBufferSizeOf", &[("id", 2)]), Some(0));

    run(&executor, &mut env, "glDeleteAll", &[]);
    assert!(!is_buffer(&executor, &mut env, 1));
    assert_eq!(env.api_globals("gles").unwrap().map("Sizes").unwrap().count, 0);
}
