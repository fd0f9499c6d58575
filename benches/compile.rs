//! Compilation throughput over synthetic modules.

use divan::{black_box, Bencher};
use jasm::ir::{BinOp, IPred, InstKind, Module, ModuleBuilder, Value};
use jasm::{compile_module, Options};

fn main() {
    divan::main();
}

/// A long chain of blocks, each doing a little arithmetic and conditionally
/// skipping ahead: lots of relooping and coercion work, no SIMD.
fn synthetic_module(blocks: usize) -> Module {
    let mut mb = ModuleBuilder::new();
    let i32t = mb.tys().i32();
    let i1 = mb.tys().i1();
    let mut fb = mb.define_function("churn", i32t, &[(Some("n"), i32t)]);
    let n = fb.arg(0);

    let mut ids = Vec::with_capacity(blocks);
    for i in 0..blocks {
        ids.push(if i == 0 {
            0
        } else {
            fb.block(None)
        });
    }
    let exit = fb.block(Some("exit"));

    let mut acc = n;
    for (i, &block) in ids.iter().enumerate() {
        fb.switch_to(block);
        let k = fb.const_i32(i as i64 + 1);
        acc = fb.binary(BinOp::Add, i32t, acc, k, &format!("acc{i}"));
        let next = if i + 1 < ids.len() { ids[i + 1] } else { exit };
        if i % 3 == 2 {
            let cond = fb.push(
                i1,
                InstKind::ICmp {
                    pred: IPred::Slt,
                    lhs: acc,
                    rhs: n,
                },
                Some(&format!("c{i}")),
            );
            fb.cond_br(cond, exit, next);
        } else {
            fb.br(next);
        }
    }
    fb.switch_to(exit);
    let ret: Value = acc;
    fb.ret(Some(ret));
    mb.finish()
}

#[divan::bench(args = [16, 128, 1024])]
fn compile_chain(bencher: Bencher, blocks: usize) {
    let module = synthetic_module(blocks);
    let options = Options::default();
    bencher.bench(|| compile_module(black_box(&module), black_box(&options)).unwrap());
}
