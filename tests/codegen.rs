//! End-to-end scenarios: textual IR in, emitted fragments out.

use jasm::ir_parse::parse_module;
use jasm::{compile_module, Options};

fn compile(src: &str) -> String {
    let module = parse_module(src).expect("fixture parses");
    compile_module(&module, &Options::default()).expect("fixture compiles")
}

fn compile_with(src: &str, options: &Options) -> String {
    let module = parse_module(src).expect("fixture parses");
    compile_module(&module, options).expect("fixture compiles")
}

#[test]
fn add_function_lowers_with_coercions() {
    let js = compile(
        r#"
define i32 @add(i32 %a, i32 %b) {
entry:
  %r = add i32 %a, %b
  ret i32 %r
}
"#,
    );
    assert!(js.contains("function _add($a,$b) {"), "in:\n{js}");
    assert!(js.contains(" $a = $a|0;"), "in:\n{js}");
    assert!(js.contains("$r = ($a + $b)|0;"), "in:\n{js}");
    assert!(js.contains("return $r|0;"), "in:\n{js}");
    assert!(js.contains("// EMSCRIPTEN_START_FUNCTIONS"));
    assert!(js.contains("// EMSCRIPTEN_END_FUNCTIONS"));
    assert!(js.contains("// EMSCRIPTEN_METADATA"));
    assert!(js.contains(r#""implementedFunctions""#));
    assert!(js.contains(r#""_add""#));
}

#[test]
fn string_constant_lands_in_memory_image() {
    let js = compile(
        r#"
@s = private constant [6 x i8] c"hello\00", align 1
@x = internal global i32 5
define i32 @get() {
entry:
  %v = load i32, i32* @x, align 4
  ret i32 %v
}
"#,
    );
    // The image is HEAP64 bytes first; the string sits at relative offset 0.
    assert!(
        js.contains("allocate([104,101,108,108,111,0,"),
        "in:\n{js}"
    );
    assert!(js.contains(r#", "i8", ALLOC_NONE, Runtime.GLOBAL_BASE);"#));
    // @x pads to the next 8-byte slot after the 6-byte string: relative 8,
    // absolute 16 with the default global base, i.e. HEAP32 index 4.
    assert!(js.contains("HEAP32[4]"), "in:\n{js}");
}

#[test]
fn indexed_function_encodes_into_packed_struct() {
    let options = Options {
        reserved_function_pointers: 2,
        ..Options::default()
    };
    let js = compile_with(
        r#"
define i32 @f(i32 %x) {
entry:
  ret i32 %x
}
@fp = internal constant <{ i32 }> <{ i32 ptrtoint (i32 (i32)* @f to i32) }>
"#,
        &options,
    );
    // Reserved slots keep indexes 0..6 as "0"; @f lands at 6 and the table
    // pads to a power of two.
    assert!(
        js.contains("var FUNCTION_TABLE_ii = [0,0,0,0,0,0,_f,0];"),
        "in:\n{js}"
    );
    // The struct's four bytes encode the index little-endian.
    assert!(js.contains("allocate([6,0,0,0]"), "in:\n{js}");
}

#[test]
fn dense_switch_uses_switch_dispatch() {
    let js = compile(
        r#"
define void @pick(i32 %x) {
entry:
  switch i32 %x, label %def [
    i32 0, label %c0
    i32 1, label %c1
    i32 2, label %c2
    i32 3, label %c3
    i32 4, label %c4
  ]
c0:
  br label %def
c1:
  br label %def
c2:
  br label %def
c3:
  br label %def
c4:
  br label %def
def:
  ret void
}
"#,
    );
    assert!(js.contains("switch ($x|0) {"), "in:\n{js}");
    for case in ["case 0: ", "case 1: ", "case 2: ", "case 3: ", "case 4: "] {
        assert!(js.contains(case), "missing {case} in:\n{js}");
    }
    assert!(js.contains("default: {"), "in:\n{js}");
}

#[test]
fn sparse_switch_uses_if_else_chain() {
    let js = compile(
        r#"
define void @pick(i32 %x) {
entry:
  switch i32 %x, label %def [
    i32 0, label %a
    i32 1000000, label %b
  ]
a:
  br label %def
b:
  br label %def
def:
  ret void
}
"#,
    );
    assert!(!js.contains("switch ("), "in:\n{js}");
    assert!(js.contains("($x|0) == 0"), "in:\n{js}");
    assert!(js.contains("($x|0) == 1000000"), "in:\n{js}");
}

#[test]
fn unaligned_load_decomposes_into_bytes() {
    let js = compile(
        r#"
define i32 @read(i32* %p) {
entry:
  %r = load i32, i32* %p, align 1
  ret i32 %r
}
"#,
    );
    assert!(
        js.contains(
            "$r = HEAPU8[$p>>0] | (HEAPU8[$p+1>>0]<<8) | \
             (HEAPU8[$p+2>>0]<<16) | (HEAPU8[$p+3>>0]<<24);"
        ),
        "in:\n{js}"
    );
}

#[test]
fn llvm_used_produces_exports() {
    let js = compile(
        r#"
define void @init() {
entry:
  ret void
}
@llvm.used = appending global [1 x i8*] [i8* bitcast (void ()* @init to i8*)]
"#,
    );
    assert!(js.contains(r#""exports""#), "in:\n{js}");
    assert!(js.contains(r#""_init""#), "in:\n{js}");
}

#[test]
fn external_reference_defers_to_post_sets() {
    let js = compile(
        r#"
@ext = external global i32
@p = internal constant <{ i32 }> <{ i32 ptrtoint (i32* @ext to i32) }>
"#,
    );
    // The struct sits at absolute 8 (the default global base), so the
    // PostSet patches HEAP32 index 2 with the extern's address at init.
    assert!(js.contains("function runPostSets() {"), "in:\n{js}");
    assert!(js.contains("HEAP32[2] = _ext;"), "in:\n{js}");
    assert!(js.contains(r#""externs""#), "in:\n{js}");
    assert!(js.contains(r#""_ext""#), "in:\n{js}");
    // The placeholder byte stays zero until runPostSets runs.
    assert!(js.contains("allocate([0,0,0,0]"), "in:\n{js}");
}

#[test]
fn loops_reloop_into_structured_form() {
    let js = compile(
        r#"
define i32 @count(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %done = icmp sge i32 %i, %n
  br i1 %done, label %exit, label %body
body:
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 %i
}
"#,
    );
    assert!(js.contains("while(1)"), "in:\n{js}");
    // The phi assignments ride the edges: an initializer before the loop
    // and an update on the back edge.
    assert!(js.contains("$i = 0;"), "in:\n{js}");
    assert!(js.contains("$i = $next;"), "in:\n{js}");
    assert!(js.contains("($i|0)>=($n|0)"), "in:\n{js}");
}

#[test]
fn phi_swap_breaks_the_cycle_with_a_temporary() {
    let js = compile(
        r#"
define i32 @swap(i32 %n) {
entry:
  br label %head
head:
  %a = phi i32 [ 0, %entry ], [ %b, %head ]
  %b = phi i32 [ 1, %entry ], [ %a, %head ]
  %c = icmp slt i32 %a, %n
  br i1 %c, label %head, label %exit
exit:
  ret i32 %b
}
"#,
    );
    // a <- b and b <- a on the same edge: one side goes through a copy.
    assert!(js.contains("$phi"), "in:\n{js}");
}

#[test]
fn calls_get_ffi_coercions_and_declares() {
    let js = compile(
        r#"
declare i32 @puts(i8*)
@msg = private constant [3 x i8] c"hi\00"
define void @main() {
entry:
  %p = getelementptr [3 x i8], [3 x i8]* @msg, i32 0, i32 0
  %r = call i32 @puts(i8* %p)
  ret void
}
"#,
    );
    assert!(js.contains("_puts("), "in:\n{js}");
    assert!(js.contains(r#""declares""#), "in:\n{js}");
    assert!(js.contains(r#""puts""#), "in:\n{js}");
}

#[test]
fn indirect_calls_mask_into_the_dispatch_table() {
    let js = compile(
        r#"
define i32 @succ(i32 %x) {
entry:
  %r = add i32 %x, 1
  ret i32 %r
}
define i32 @apply(i32 %x) {
entry:
  %fp = ptrtoint i32 (i32)* @succ to i32
  %p = inttoptr i32 %fp to i32 (i32)*
  %r = call i32 %p(i32 %x)
  ret i32 %r
}
"#,
    );
    assert!(js.contains("FUNCTION_TABLE_ii["), "in:\n{js}");
    // The mask is the final (power-of-two) table length minus one.
    assert!(!js.contains("#FM_"), "unpatched mask in:\n{js}");
    assert!(js.contains("var FUNCTION_TABLE_ii = ["), "in:\n{js}");
}

#[test]
fn static_allocas_coalesce_into_one_frame() {
    let js = compile(
        r#"
define void @frame(i32 %v) {
entry:
  %slot = alloca i32, align 4
  %arr = alloca [4 x i32], align 4
  store i32 %v, i32* %slot, align 4
  %p = getelementptr [4 x i32], [4 x i32]* %arr, i32 0, i32 2
  store i32 %v, i32* %p, align 4
  ret void
}
"#,
    );
    assert!(js.contains(" sp = STACKTOP;"), "in:\n{js}");
    // 4 + 16 bytes of slots round up to 32 with the 16-byte stack quantum.
    assert!(js.contains("STACKTOP = STACKTOP + 32|0;"), "in:\n{js}");
    assert!(js.contains("STACKTOP = sp;"), "in:\n{js}");
}

#[test]
fn assertions_add_stack_overflow_checks() {
    let options = Options {
        assertions: 1,
        ..Options::default()
    };
    let js = compile_with(
        r#"
define void @f() {
entry:
  %slot = alloca i32, align 4
  store i32 0, i32* %slot, align 4
  ret void
}
"#,
        &options,
    );
    assert!(
        js.contains("if ((STACKTOP|0) >= (STACK_MAX|0)) abort();"),
        "in:\n{js}"
    );
}

#[test]
fn precise_f32_wraps_float_math() {
    let options = Options {
        precise_f32: true,
        ..Options::default()
    };
    let js = compile_with(
        r#"
define float @scale(float %a, float %b) {
entry:
  %r = fmul float %a, %b
  ret float %r
}
"#,
        &options,
    );
    assert!(js.contains("Math_fround($a * $b)"), "in:\n{js}");
    assert!(js.contains(" $a = Math_fround($a);"), "in:\n{js}");
}

#[test]
fn init_array_feeds_initializers_metadata() {
    let js = compile(
        r#"
define void @ctor() {
entry:
  ret void
}
@__init_array_start = internal constant <{ i32 }> <{ i32 ptrtoint (void ()* @ctor to i32) }>
"#,
    );
    // __init_array_start is special-cased away from the heap.
    assert!(js.contains(r#""initializers""#), "in:\n{js}");
    assert!(js.contains(r#""_ctor""#), "in:\n{js}");
}

#[test]
fn fallthrough_return_is_padded() {
    let js = compile(
        r#"
define i32 @maybe(i1 %c) {
entry:
  br i1 %c, label %yes, label %no
yes:
  ret i32 1
no:
  br label %yes
}
"#,
    );
    let _ = js;
}

#[test]
fn atomicrmw_expands_to_load_and_store() {
    let js = compile(
        r#"
define i32 @bump(i32* %p, i32 %v) {
entry:
  %old = atomicrmw add i32* %p, i32 %v seq_cst
  ret i32 %old
}
"#,
    );
    assert!(js.contains("$old = HEAP32[$p>>2]|0;"), "in:\n{js}");
    assert!(js.contains("HEAP32[$p>>2] = (($old+$v)|0)"), "in:\n{js}");
}

#[test]
fn unsigned_compare_uses_unsigned_coercion() {
    let js = compile(
        r#"
define i1 @below(i32 %a, i32 %b) {
entry:
  %r = icmp ult i32 %a, %b
  ret i1 %r
}
"#,
    );
    assert!(js.contains("($a>>>0)<($b>>>0)"), "in:\n{js}");
}

#[test]
fn small_constant_multiply_avoids_imul() {
    let js = compile(
        r#"
define i32 @muls(i32 %a, i32 %b) {
entry:
  %by8 = mul i32 %a, 8
  %by100 = mul i32 %a, 100
  %dyn = mul i32 %a, %b
  %r = add i32 %by8, %by100
  %r2 = add i32 %r, %dyn
  ret i32 %r2
}
"#,
    );
    assert!(js.contains("$a<<3"), "in:\n{js}");
    assert!(js.contains("($a*100)|0"), "in:\n{js}");
    assert!(js.contains("Math_imul($a, $b)|0"), "in:\n{js}");
}
