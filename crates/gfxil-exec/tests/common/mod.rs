#![allow(dead_code)]

use gfxil_exec::{Config, Executor};
use gfxil_semantic::{Builtin, Expr, Program};
use tracing_subscriber::EnvFilter;

/// Routes `RUST_LOG`-filtered output through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn u32_lit(value: i64) -> Expr {
    Expr::int(Builtin::Uint32.id(), value)
}

pub fn u64_lit(value: i64) -> Expr {
    Expr::int(Builtin::Uint64.id(), value)
}

pub fn executor(program: &Program) -> Executor {
    init_tracing();
    Executor::compile(program, &Config::default()).expect("program should compile")
}
