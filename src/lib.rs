//! jasm compiles a legalized, LLVM-shaped IR into asm.js-style JavaScript.
//!
//! The input is a [`ir::Module`] that already went through the upstream
//! normalization pipeline (integers ≤32 bits, no varargs, no aggregates in
//! registers, constant expressions reduced to casts and pointer
//! arithmetic). The output is a single text stream: one `function` per
//! implemented IR function with structured control flow reconstructed by
//! the relooper, a `runPostSets` initializer, the memory-image literal, and
//! a JSON metadata record for the downstream linker.
//!
//! ```
//! use jasm::{compile_module, Options};
//! use jasm::ir::{BinOp, ModuleBuilder};
//!
//! let mut mb = ModuleBuilder::new();
//! let i32t = mb.tys().i32();
//! let mut f = mb.define_function("add", i32t, &[(Some("a"), i32t), (Some("b"), i32t)]);
//! let (a, b) = (f.arg(0), f.arg(1));
//! let r = f.binary(BinOp::Add, i32t, a, b, "r");
//! f.ret(Some(r));
//! let module = mb.finish();
//!
//! let js = compile_module(&module, &Options::default()).unwrap();
//! assert!(js.contains("function _add($a,$b) {"));
//! ```
//!
//! Modules can also be parsed from the LLVM-flavored text format via
//! [`ir_parse::parse_module`], which tests and fixtures use.

pub mod alloca;
pub mod cast;
pub mod error;
pub mod heap;
pub mod ir;
pub mod ir_parse;
pub mod mangle;
pub mod relooper;
pub mod tables;

mod calls;
mod consts;
mod emit;
mod expr;

pub use error::{CompileError, CompileResult};

/// Code generator optimization level. `None` enables the nativization pass
/// and the large-locals advisory; at `Default` the upstream optimizer is
/// assumed to have done better already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    None,
    Default,
}

/// Code generator configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Emit `Math_fround` wrappers to preserve float32 semantics.
    pub precise_f32: bool,
    /// Log a diagnostic at each emitted unaligned load or store.
    pub warn_unaligned: bool,
    /// Slots reserved at the front of each dispatch table for functions
    /// added at runtime (each reserved slot is 2-aligned).
    pub reserved_function_pointers: u32,
    /// Non-zero injects a stack-overflow check into every stack bump.
    pub assertions: u32,
    /// Never let two functions of different signatures share a table index.
    pub no_aliasing_function_pointers: bool,
    /// Where global variables start out in memory.
    pub global_base: u32,
    pub opt_level: OptLevel,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            precise_f32: false,
            warn_unaligned: false,
            reserved_function_pointers: 0,
            assertions: 0,
            no_aliasing_function_pointers: false,
            global_base: 8,
            opt_level: OptLevel::Default,
        }
    }
}

/// Compile a module to the target dialect. The module is read-only; all
/// compilation state lives and dies inside this call.
pub fn compile_module(module: &ir::Module, options: &Options) -> CompileResult<String> {
    emit::Codegen::new(module, options).run()
}
