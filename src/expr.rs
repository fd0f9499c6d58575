//! Per-instruction expression generation.
//!
//! Each IR instruction lowers to one line of target-dialect source with the
//! canonical coercion for its result type on the outside. The walker runs in
//! program order within a block; terminators are left to the relooper and
//! phis to the edge preludes.

use std::fmt::Write;

use crate::cast::{cast, double_to_int, ensure_float, ftostr, paren_cast, CastMode};
use crate::error::{CompileError, CompileResult};
use crate::heap::{stack_align, stack_align_expr};
use crate::ir::{
    BinOp, CastOp, Const, ConstExpr, ConstId, FPred, Function, IPred, Inst, InstId, InstKind,
    RmwOp, Ty, TyId, Value, VecKind,
};
use crate::emit::Codegen;

const SIMD_LANE_UPPER: [char; 4] = ['X', 'Y', 'Z', 'W'];
const SIMD_LANE_LOWER: [char; 4] = ['x', 'y', 'z', 'w'];

impl<'m> Codegen<'m> {
    // ─── Value printing ─────────────────────────────────────────────

    pub(crate) fn get_value_as_str(
        &mut self,
        f: &Function,
        v: Value,
        mode: CastMode,
    ) -> CompileResult<String> {
        let v = self.m.strip_pointer_casts(f, v);
        match v {
            Value::Const(c) => self.get_constant(f, c, mode),
            _ => Ok(self.js_name(f, v)),
        }
    }

    pub(crate) fn get_value_as_cast_str(
        &mut self,
        f: &Function,
        v: Value,
        mode: CastMode,
    ) -> CompileResult<String> {
        let v = self.m.strip_pointer_casts(f, v);
        if let Value::Const(c) = v {
            if matches!(self.m.consts[c], Const::Int { .. } | Const::Float { .. }) {
                return self.get_constant(f, c, mode);
            }
        }
        let s = self.get_value_as_str(f, v, CastMode::SIGNED)?;
        let ty = self.m.value_ty(f, v);
        cast(&self.m.tys, &s, ty, mode, self.opts.precise_f32)
    }

    /// Like [`Self::get_value_as_str`], parenthesizing literals that would
    /// otherwise glue onto a neighboring operator (`- -1`, `+ +5`). Names
    /// are atomic tokens and stay bare.
    pub(crate) fn get_value_as_paren_str(&mut self, f: &Function, v: Value) -> CompileResult<String> {
        let v = self.m.strip_pointer_casts(f, v);
        match v {
            Value::Const(c) => {
                let s = self.get_constant(f, c, CastMode::SIGNED)?;
                if s.starts_with('-') || s.starts_with('+') {
                    Ok(format!("({s})"))
                } else {
                    Ok(s)
                }
            }
            _ => Ok(self.js_name(f, v)),
        }
    }

    pub(crate) fn get_value_as_cast_paren_str(
        &mut self,
        f: &Function,
        v: Value,
        mode: CastMode,
    ) -> CompileResult<String> {
        let v = self.m.strip_pointer_casts(f, v);
        if let Value::Const(c) = v {
            if matches!(
                self.m.consts[c],
                Const::Int { .. } | Const::Float { .. } | Const::Undef(_)
            ) {
                return self.get_constant(f, c, mode);
            }
        }
        let s = self.get_value_as_str(f, v, CastMode::SIGNED)?;
        let ty = self.m.value_ty(f, v);
        Ok(format!(
            "({})",
            cast(&self.m.tys, &s, ty, mode, self.opts.precise_f32)?
        ))
    }

    pub(crate) fn get_constant(
        &mut self,
        f: &Function,
        c: ConstId,
        mode: CastMode,
    ) -> CompileResult<String> {
        match self.m.consts[c].clone() {
            Const::Null(_) => Ok("0".to_string()),
            Const::Function(func) => Ok(self.get_function_index(func)?.to_string()),
            Const::Global(g) => {
                let global = &self.m.globals[g];
                if global.is_declaration() {
                    let name = crate::mangle::mangle_global(&global.name);
                    self.externals.insert(name.clone());
                    return Ok(name);
                }
                Ok(self.layout.absolute_address(&global.name)?.to_string())
            }
            Const::Float { ty, value } => {
                let is_float = self.m.tys.is_float(ty);
                let mut s = ftostr(value, is_float, self.opts.precise_f32);
                if self.opts.precise_f32 && is_float && !mode.has(CastMode::FFI_OUT) {
                    s = format!("Math_fround({s})");
                }
                Ok(s)
            }
            Const::Int { ty, value } => {
                let bits = self.m.tys.int_bits(ty);
                // Bools are always unsigned: either 0 or 1.
                let unsigned = mode == CastMode::UNSIGNED || bits == 1;
                Ok(print_int(value, bits, unsigned))
            }
            Const::Undef(ty) => {
                if let Ty::Vector(kind) = self.m.tys.get(ty) {
                    let kind = *kind;
                    self.uses_simd = true;
                    return Ok(match kind {
                        VecKind::Int32x4 => "SIMD_int32x4_splat(0)".to_string(),
                        VecKind::Float32x4 => "SIMD_float32x4_splat(Math_fround(0))".to_string(),
                    });
                }
                let mut s = if self.m.tys.is_fp(ty) { "+0" } else { "0" }.to_string();
                if self.opts.precise_f32 && self.m.tys.is_float(ty) && !mode.has(CastMode::FFI_OUT) {
                    s = format!("Math_fround({s})");
                }
                Ok(s)
            }
            Const::Zero(ty) => {
                if let Ty::Vector(kind) = self.m.tys.get(ty) {
                    let kind = *kind;
                    self.uses_simd = true;
                    return Ok(match kind {
                        VecKind::Int32x4 => "SIMD_int32x4_splat(0)".to_string(),
                        VecKind::Float32x4 => "SIMD_float32x4_splat(Math_fround(0))".to_string(),
                    });
                }
                // Things like `[0 x i8*] zeroinitializer`, which front ends
                // emit for landing pads.
                Ok("0".to_string())
            }
            Const::Vector { ty, lanes } => {
                self.uses_simd = true;
                let int = matches!(self.m.tys.get(ty), Ty::Vector(VecKind::Int32x4));
                let mut parts = Vec::with_capacity(4);
                for i in 0..4 {
                    let lane = lanes.get(i).copied();
                    parts.push(match lane {
                        Some(l) => self.get_constant(f, l, CastMode::SIGNED)?,
                        None => "0".to_string(),
                    });
                }
                Ok(self.get_constant_vector(int, &parts))
            }
            Const::Array { elems, .. } => {
                // A one-element constant array of a bitcast pointer is the
                // landing-pad form front ends still emit.
                if elems.len() != 1 {
                    return Err(CompileError::Legalization(
                        "unexpected constant array in expression".to_string(),
                    ));
                }
                let inner = self
                    .m
                    .strip_pointer_casts(f, Value::Const(elems[0]));
                match inner {
                    Value::Const(c) => self.get_constant(f, c, CastMode::SIGNED),
                    _ => unreachable!("constants strip to constants"),
                }
            }
            Const::BlockAddress { func, block } => {
                Ok(self.block_address(func, block).to_string())
            }
            Const::Str { .. } | Const::Struct { .. } => Err(CompileError::Unsupported(
                "aggregate constant in expression position".to_string(),
            )),
            Const::Expr(e) => self.get_const_expr(f, e),
        }
    }

    fn get_const_expr(&mut self, f: &Function, e: ConstExpr) -> CompileResult<String> {
        match e {
            ConstExpr::Bitcast { val, .. }
            | ConstExpr::PtrToInt { val, .. }
            | ConstExpr::IntToPtr { val, .. } => self.get_constant(f, val, CastMode::SIGNED),
            ConstExpr::Add { ty, lhs, rhs } => {
                let l = self.get_constant(f, lhs, CastMode::SIGNED)?;
                let r = self.get_constant(f, rhs, CastMode::SIGNED)?;
                Ok(format!(
                    "({})",
                    paren_cast(
                        &self.m.tys,
                        &format!("({l}) + ({r})"),
                        ty,
                        CastMode::SIGNED,
                        self.opts.precise_f32
                    )?
                ))
            }
            ConstExpr::Gep { base, offset, .. } => {
                let b = self.get_constant(f, base, CastMode::SIGNED)?;
                Ok(format!("(({b}) + {offset}|0)"))
            }
        }
    }

    fn get_constant_vector(&mut self, int: bool, lanes: &[String]) -> String {
        // A splat collapses to the dedicated intrinsic.
        if lanes.iter().all(|l| *l == lanes[0]) {
            return if int {
                format!("SIMD_int32x4_splat({})", lanes[0])
            } else {
                format!("SIMD_float32x4_splat(Math_fround({}))", lanes[0])
            };
        }
        if int {
            format!(
                "SIMD_int32x4({},{},{},{})",
                lanes[0], lanes[1], lanes[2], lanes[3]
            )
        } else {
            format!(
                "SIMD_float32x4(Math_fround({}),Math_fround({}),Math_fround({}),Math_fround({}))",
                lanes[0], lanes[1], lanes[2], lanes[3]
            )
        }
    }

    // ─── Memory access ──────────────────────────────────────────────

    pub(crate) fn get_heap_access(&self, name: &str, bytes: u32, integer: bool) -> String {
        match bytes {
            8 => format!("HEAPF64[{name}>>3]"),
            4 if integer => format!("HEAP32[{name}>>2]"),
            4 => format!("HEAPF32[{name}>>2]"),
            2 => format!("HEAP16[{name}>>1]"),
            1 => format!("HEAP8[{name}>>0]"),
            _ => panic!("unsupported heap access size {bytes}"),
        }
    }

    fn get_ptr_use(&mut self, f: &Function, ptr: Value) -> CompileResult<String> {
        let ty = self.m.value_ty(f, self.m.strip_pointer_casts(f, ptr));
        let t = self.m.tys.pointee(ty);
        let bytes = self.m.tys.alloc_size(t);
        let integer = self.m.tys.is_int(t) || self.m.tys.is_ptr(t);
        // A defined global collapses to a constant heap index.
        if let Value::Const(c) = self.m.strip_pointer_casts(f, ptr) {
            if let Const::Global(g) = self.m.consts[c] {
                let global = &self.m.globals[g];
                if !global.is_declaration() {
                    let addr = self.layout.absolute_address(&global.name)?;
                    return Ok(match bytes {
                        8 => format!("HEAPF64[{}]", addr >> 3),
                        4 if integer => format!("HEAP32[{}]", addr >> 2),
                        4 => format!("HEAPF32[{}]", addr >> 2),
                        2 => format!("HEAP16[{}]", addr >> 1),
                        1 => format!("HEAP8[{addr}]"),
                        _ => {
                            return Err(CompileError::Unsupported(format!(
                                "heap access of {bytes} bytes"
                            )))
                        }
                    });
                }
            }
        }
        let p = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
        Ok(self.get_heap_access(&p, bytes, integer))
    }

    fn get_ptr_load(&mut self, f: &Function, ptr: Value) -> CompileResult<String> {
        let ty = self.m.value_ty(f, self.m.strip_pointer_casts(f, ptr));
        let t = self.m.tys.pointee(ty);
        let access = self.get_ptr_use(f, ptr)?;
        cast(
            &self.m.tys,
            &access,
            t,
            CastMode::NONSPECIFIC,
            self.opts.precise_f32,
        )
    }

    /// Is this pointer a known absolute address (a deliberate segfault or a
    /// code problem)?
    fn is_absolute(&self, f: &Function, ptr: Value) -> bool {
        match ptr {
            Value::Inst(i) => match &f.insts[i].kind {
                InstKind::Cast {
                    op: CastOp::IntToPtr,
                    val,
                } => self.m.const_int_value(*val).is_some(),
                _ => false,
            },
            Value::Const(c) => match &self.m.consts[c] {
                Const::Null(_) | Const::Undef(_) => true,
                Const::Expr(ConstExpr::IntToPtr { val, .. }) => {
                    matches!(self.m.consts[*val], Const::Int { .. })
                }
                _ => false,
            },
            Value::Arg(_) => false,
        }
    }

    pub(crate) fn get_load(
        &mut self,
        f: &Function,
        id: InstId,
        ptr: Value,
        ty: TyId,
        alignment: u32,
        sep: char,
    ) -> CompileResult<String> {
        let assign = self.get_assign(f, id);
        let bytes = self.m.tys.alloc_size(ty);
        if bytes <= alignment || alignment == 0 {
            let mut text = format!("{assign}{}", self.get_ptr_load(f, ptr)?);
            if self.is_absolute(f, ptr) {
                // Loads from absolute constants are either intentional
                // segfaults (int x = *((int*)0)) or code problems.
                text.push_str("; abort() /* segfault, load from absolute addr */");
            }
            return Ok(text);
        }

        // Unaligned in some manner.
        if self.opts.warn_unaligned {
            log::warn!("unaligned load in {}", f.name);
        }
        let ps = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
        let text = match bytes {
            8 => {
                let mut text = match alignment {
                    4 => format!(
                        "HEAP32[tempDoublePtr>>2]=HEAP32[{ps}>>2]{sep}\
                         HEAP32[tempDoublePtr+4>>2]=HEAP32[{ps}+4>>2]"
                    ),
                    2 => (0..4)
                        .map(|i| {
                            let o = i * 2;
                            let (td, pp) = if i == 0 {
                                ("tempDoublePtr".to_string(), ps.clone())
                            } else {
                                (format!("tempDoublePtr+{o}"), format!("{ps}+{o}"))
                            };
                            format!("HEAP16[{td}>>1]=HEAP16[{pp}>>1]")
                        })
                        .collect::<Vec<_>>()
                        .join(&sep.to_string()),
                    1 => (0..8)
                        .map(|i| {
                            let (td, pp) = if i == 0 {
                                ("tempDoublePtr".to_string(), ps.clone())
                            } else {
                                (format!("tempDoublePtr+{i}"), format!("{ps}+{i}"))
                            };
                            format!("HEAP8[{td}>>0]=HEAP8[{pp}>>0]")
                        })
                        .collect::<Vec<_>>()
                        .join(&sep.to_string()),
                    _ => {
                        return Err(CompileError::Invariant(format!(
                            "bad alignment {alignment} on 8-byte load"
                        )))
                    }
                };
                let _ = write!(text, "{sep}{assign}+HEAPF64[tempDoublePtr>>3]");
                text
            }
            4 => {
                if self.m.tys.is_int(ty) || self.m.tys.is_ptr(ty) {
                    match alignment {
                        2 => format!(
                            "{assign}HEAPU16[{ps}>>1]|(HEAPU16[{ps}+2>>1]<<16)"
                        ),
                        1 => format!(
                            "{assign}HEAPU8[{ps}>>0] | (HEAPU8[{ps}+1>>0]<<8) | \
                             (HEAPU8[{ps}+2>>0]<<16) | (HEAPU8[{ps}+3>>0]<<24)"
                        ),
                        _ => {
                            return Err(CompileError::Invariant(format!(
                                "bad alignment {alignment} on 4-byte integer load"
                            )))
                        }
                    }
                } else {
                    debug_assert!(self.m.tys.is_fp(ty));
                    let mut text = match alignment {
                        2 => format!(
                            "HEAP16[tempDoublePtr>>1]=HEAP16[{ps}>>1]{sep}\
                             HEAP16[tempDoublePtr+2>>1]=HEAP16[{ps}+2>>1]"
                        ),
                        1 => (0..4)
                            .map(|i| {
                                let (td, pp) = if i == 0 {
                                    ("tempDoublePtr".to_string(), ps.clone())
                                } else {
                                    (format!("tempDoublePtr+{i}"), format!("{ps}+{i}"))
                                };
                                format!("HEAP8[{td}>>0]=HEAP8[{pp}>>0]")
                            })
                            .collect::<Vec<_>>()
                            .join(&sep.to_string()),
                        _ => {
                            return Err(CompileError::Invariant(format!(
                                "bad alignment {alignment} on 4-byte float load"
                            )))
                        }
                    };
                    let float_ty = ty;
                    let access = cast(
                        &self.m.tys,
                        "HEAPF32[tempDoublePtr>>2]",
                        float_ty,
                        CastMode::SIGNED,
                        self.opts.precise_f32,
                    )?;
                    let _ = write!(text, "{sep}{assign}{access}");
                    text
                }
            }
            2 => format!("{assign}HEAPU8[{ps}>>0] | (HEAPU8[{ps}+1>>0]<<8)"),
            _ => {
                return Err(CompileError::Invariant(format!(
                    "bad unaligned load of {bytes} bytes"
                )))
            }
        };
        Ok(text)
    }

    pub(crate) fn get_store(
        &mut self,
        f: &Function,
        ptr: Value,
        ty: TyId,
        vs: String,
        alignment: u32,
    ) -> CompileResult<String> {
        let bytes = self.m.tys.alloc_size(ty);
        if bytes <= alignment || alignment == 0 {
            return Ok(format!("{} = {vs}", self.get_ptr_use(f, ptr)?));
        }

        if self.opts.warn_unaligned {
            log::warn!("unaligned store in {}", f.name);
        }
        let ps = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
        let text = match bytes {
            8 => {
                let mut text = format!("HEAPF64[tempDoublePtr>>3]={vs};");
                match alignment {
                    4 => {
                        let _ = write!(
                            text,
                            "HEAP32[{ps}>>2]=HEAP32[tempDoublePtr>>2];\
                             HEAP32[{ps}+4>>2]=HEAP32[tempDoublePtr+4>>2]"
                        );
                    }
                    2 => {
                        for i in 0..4 {
                            let o = i * 2;
                            if i > 0 {
                                text.push(';');
                            }
                            if i == 0 {
                                let _ =
                                    write!(text, "HEAP16[{ps}>>1]=HEAP16[tempDoublePtr>>1]");
                            } else {
                                let _ = write!(
                                    text,
                                    "HEAP16[{ps}+{o}>>1]=HEAP16[tempDoublePtr+{o}>>1]"
                                );
                            }
                        }
                    }
                    1 => {
                        for i in 0..8 {
                            if i > 0 {
                                text.push(';');
                            }
                            if i == 0 {
                                let _ = write!(text, "HEAP8[{ps}>>0]=HEAP8[tempDoublePtr>>0]");
                            } else {
                                let _ = write!(
                                    text,
                                    "HEAP8[{ps}+{i}>>0]=HEAP8[tempDoublePtr+{i}>>0]"
                                );
                            }
                        }
                    }
                    _ => {
                        return Err(CompileError::Invariant(format!(
                            "bad alignment {alignment} on 8-byte store"
                        )))
                    }
                }
                text
            }
            4 => {
                if self.m.tys.is_int(ty) || self.m.tys.is_ptr(ty) {
                    match alignment {
                        2 => format!(
                            "HEAP16[{ps}>>1]={vs}&65535;HEAP16[{ps}+2>>1]={vs}>>>16"
                        ),
                        1 => format!(
                            "HEAP8[{ps}>>0]={vs}&255;HEAP8[{ps}+1>>0]=({vs}>>8)&255;\
                             HEAP8[{ps}+2>>0]=({vs}>>16)&255;HEAP8[{ps}+3>>0]={vs}>>24"
                        ),
                        _ => {
                            return Err(CompileError::Invariant(format!(
                                "bad alignment {alignment} on 4-byte integer store"
                            )))
                        }
                    }
                } else {
                    debug_assert!(self.m.tys.is_fp(ty));
                    let mut text = format!("HEAPF32[tempDoublePtr>>2]={vs};");
                    match alignment {
                        2 => {
                            let _ = write!(
                                text,
                                "HEAP16[{ps}>>1]=HEAP16[tempDoublePtr>>1];\
                                 HEAP16[{ps}+2>>1]=HEAP16[tempDoublePtr+2>>1]"
                            );
                        }
                        1 => {
                            for i in 0..4 {
                                if i > 0 {
                                    text.push(';');
                                }
                                if i == 0 {
                                    let _ =
                                        write!(text, "HEAP8[{ps}>>0]=HEAP8[tempDoublePtr>>0]");
                                } else {
                                    let _ = write!(
                                        text,
                                        "HEAP8[{ps}+{i}>>0]=HEAP8[tempDoublePtr+{i}>>0]"
                                    );
                                }
                            }
                        }
                        _ => {
                            return Err(CompileError::Invariant(format!(
                                "bad alignment {alignment} on 4-byte float store"
                            )))
                        }
                    }
                    text
                }
            }
            2 => format!("HEAP8[{ps}>>0]={vs}&255;HEAP8[{ps}+1>>0]={vs}>>8"),
            _ => {
                return Err(CompileError::Invariant(format!(
                    "bad unaligned store of {bytes} bytes"
                )))
            }
        };
        Ok(text)
    }

    pub(crate) fn get_stack_bump(&self, size: &str) -> String {
        let mut ret = format!("STACKTOP = STACKTOP + {size}|0;");
        if self.opts.assertions > 0 {
            ret.push_str(" if ((STACKTOP|0) >= (STACK_MAX|0)) abort();");
        }
        ret
    }

    // ─── Arithmetic helpers ─────────────────────────────────────────

    /// Integer multiplication, avoiding `Math_imul` for small or power-of-
    /// two constants. Constant-times-constant was already folded upstream.
    fn get_imul(&mut self, f: &Function, a: Value, b: Value) -> CompileResult<String> {
        let (constant, other) = match (self.m.const_int_value(a), self.m.const_int_value(b)) {
            (Some(c), _) => (Some(c), b),
            (_, Some(c)) => (Some(c), a),
            _ => (None, a),
        };
        if let Some(c) = constant {
            let c = c as u32;
            let other_str = self.get_value_as_str(f, other, CastMode::SIGNED)?;
            if c == 0 {
                return Ok("0".to_string());
            }
            if c == 1 {
                return Ok(other_str);
            }
            if c.is_power_of_two() {
                return Ok(format!("{other_str}<<{}", c.trailing_zeros()));
            }
            if c < (1 << 20) {
                // Small enough to stay precise in a double; avoid imul.
                return Ok(format!("({other_str}*{c})|0"));
            }
        }
        let l = self.get_value_as_str(f, a, CastMode::SIGNED)?;
        let r = self.get_value_as_str(f, b, CastMode::SIGNED)?;
        Ok(format!("Math_imul({l}, {r})|0"))
    }

    fn is_fneg(&self, f: &Function, lhs: Value) -> bool {
        // The IR spells fneg(x) as -0.0 - x.
        match lhs {
            Value::Const(c) => match self.m.consts[c] {
                Const::Float { value, .. } => value == 0.0 && value.is_sign_negative(),
                _ => false,
            },
            _ => {
                let _ = f;
                false
            }
        }
    }

    // ─── The expression generator ───────────────────────────────────

    /// Emit the code for one instruction into `code`. No-op pointer casts
    /// and relooper-handled instructions (phis, branches) emit nothing.
    pub(crate) fn generate_expression(
        &mut self,
        f: &Function,
        id: InstId,
        code: &mut String,
    ) -> CompileResult<()> {
        let inst = &f.insts[id];
        let ty = inst.ty;
        if self.m.tys.is_int(ty) && self.m.tys.int_bits(ty) > 32 {
            return Err(CompileError::Legalization(format!(
                "integer of width {} in {}",
                self.m.tys.int_bits(ty),
                f.name
            )));
        }

        if self.generate_simd_expression(f, id, code)? {
            self.finish_line(f, id, code);
            return Ok(());
        }

        let kind = inst.kind.clone();
        match kind {
            InstKind::Ret(rv) => {
                if self.stack_bumped {
                    code.push_str("STACKTOP = sp;");
                }
                code.push_str("return");
                if let Some(rv) = rv {
                    let s = self.get_value_as_cast_str(
                        f,
                        rv,
                        CastMode::NONSPECIFIC.with(CastMode::MUST_CAST),
                    )?;
                    let _ = write!(code, " {s}");
                }
            }
            // Handled while relooping.
            InstKind::Br { .. }
            | InstKind::CondBr { .. }
            | InstKind::Switch { .. }
            | InstKind::IndirectBr { .. }
            | InstKind::Phi { .. } => return Ok(()),
            InstKind::Unreachable => {
                // Typically there is an abort right before these.
                code.push_str("// unreachable");
            }
            InstKind::Binary { op, lhs, rhs } => {
                let assign = self.assign_if_needed(f, id);
                code.push_str(&assign);
                let expr = self.generate_binary(f, op, ty, lhs, rhs)?;
                code.push_str(&expr);
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let assign = self.assign_if_needed(f, id);
                let mode = if pred.is_unsigned() {
                    CastMode::UNSIGNED
                } else {
                    CastMode::SIGNED
                };
                let l = self.get_value_as_cast_str(f, lhs, mode)?;
                let r = self.get_value_as_cast_str(f, rhs, mode)?;
                let op = match pred {
                    IPred::Eq => "==",
                    IPred::Ne => "!=",
                    IPred::Ule | IPred::Sle => "<=",
                    IPred::Uge | IPred::Sge => ">=",
                    IPred::Ult | IPred::Slt => "<",
                    IPred::Ugt | IPred::Sgt => ">",
                };
                let _ = write!(code, "{assign}({l}){op}({r})");
            }
            InstKind::FCmp { pred, lhs, rhs } => {
                let assign = self.assign_if_needed(f, id);
                code.push_str(&assign);
                let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                let expr = match pred {
                    FPred::Oeq => format!("{l} == {r}"),
                    FPred::Une => format!("{l} != {r}"),
                    FPred::Ogt => format!("{l} > {r}"),
                    FPred::Oge => format!("{l} >= {r}"),
                    FPred::Olt => format!("{l} < {r}"),
                    FPred::Ole => format!("{l} <= {r}"),
                    // Inverses of the plain operators.
                    FPred::Ugt => format!("!({l} <= {r})"),
                    FPred::Uge => format!("!({l} < {r})"),
                    FPred::Ult => format!("!({l} >= {r})"),
                    FPred::Ule => format!("!({l} > {r})"),
                    // Explicit NaN checks.
                    FPred::Ueq => format!("({l} != {l}) | ({r} != {r}) |({l} == {r})"),
                    FPred::One => format!("({l} == {l}) & ({r} == {r}) &({l} != {r})"),
                    FPred::Ord => format!("({l} == {l}) & ({r} == {r})"),
                    FPred::Uno => format!("({l} != {l}) | ({r} != {r})"),
                    FPred::False => "0".to_string(),
                    FPred::True => "1".to_string(),
                };
                code.push_str(&expr);
            }
            InstKind::Alloca {
                allocated,
                count,
                align: _,
            } => {
                // Any alloca bumps the stack; the epilogue must restore it.
                self.stack_bumped = true;

                if self.nativized.contains(id) {
                    // Nativized stack variable: just a var declaration.
                    let name = self.js_name(f, Value::Inst(id));
                    let kind = self.local_kind(self.m.tys.pointee(ty));
                    self.used_vars.insert(name, kind);
                    return Ok(());
                }

                if let Some(offset) = self.frame.frame_offset(id) {
                    let assign = self.get_assign(f, id);
                    code.push_str(&assign);
                    if self.frame.max_alignment() <= crate::heap::STACK_ALIGN {
                        code.push_str("sp");
                    } else {
                        // The aligned base of the frame differs; use it.
                        code.push_str("sp_a");
                    }
                    if offset != 0 {
                        let _ = write!(code, " + {offset}|0");
                    }
                } else {
                    // Dynamic alloca: claim stack space inline.
                    let base = self.m.tys.alloc_size(allocated);
                    let size = match self.m.const_int_value(count) {
                        Some(n) => stack_align(base * n.max(0) as u32).to_string(),
                        None => {
                            let n = self.get_value_as_str(f, count, CastMode::SIGNED)?;
                            stack_align_expr(&format!("(({base}*{n})|0)"))
                        }
                    };
                    let assign = self.get_assign(f, id);
                    let bump = self.get_stack_bump(&size);
                    let _ = write!(code, "{assign}STACKTOP; {bump}");
                }
            }
            InstKind::Load { ptr, align } => {
                if self.nativized.contains_value(self.m.strip_pointer_casts(f, ptr)) {
                    let assign = self.get_assign(f, id);
                    let v = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
                    let _ = write!(code, "{assign}{v}");
                } else {
                    let text = self.get_load(f, id, ptr, ty, align, ';')?;
                    code.push_str(&text);
                }
            }
            InstKind::Store { val, ptr, align } => {
                let vty = self.m.value_ty(f, val);
                if self.m.tys.is_int(vty) && self.m.tys.int_bits(vty) > 32 {
                    return Err(CompileError::Legalization(format!(
                        "integer of width {} stored in {}",
                        self.m.tys.int_bits(vty),
                        f.name
                    )));
                }
                let vs = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                if self.nativized.contains_value(self.m.strip_pointer_casts(f, ptr)) {
                    let p = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
                    let _ = write!(code, "{p} = {vs}");
                } else {
                    let text = self.get_store(f, ptr, vty, vs, align)?;
                    code.push_str(&text);
                }
            }
            InstKind::Gep { base, indices } => {
                let assign = self.assign_if_needed(f, id);
                code.push_str(&assign);
                let expr = self.generate_gep(f, base, &indices)?;
                code.push_str(&expr);
            }
            InstKind::Cast { op, val } => {
                let assign = self.assign_if_needed(f, id);
                code.push_str(&assign);
                let expr = self.generate_cast(f, op, val, ty)?;
                code.push_str(&expr);
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                let assign = self.assign_if_needed(f, id);
                let c = self.get_value_as_str(f, cond, CastMode::SIGNED)?;
                let t = self.get_value_as_str(f, if_true, CastMode::SIGNED)?;
                let e = self.get_value_as_str(f, if_false, CastMode::SIGNED)?;
                let _ = write!(code, "{assign}{c} ? {t} : {e}");
            }
            InstKind::Call { .. } => {
                let call = self.handle_call(f, id)?;
                if call.is_empty() {
                    return Ok(());
                }
                code.push_str(&call);
            }
            InstKind::AtomicRmw { op, ptr, val } => {
                let vs = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                let load = self.get_load(f, id, ptr, ty, 0, ';')?;
                let _ = write!(code, "{load};");
                let old = self.js_name(f, Value::Inst(id));
                let new_val = match op {
                    RmwOp::Xchg => vs,
                    RmwOp::Add => format!("(({old}+{vs})|0)"),
                    RmwOp::Sub => format!("(({old}-{vs})|0)"),
                    RmwOp::And => format!("({old}&{vs})"),
                    RmwOp::Nand => format!("(~({old}&{vs}))"),
                    RmwOp::Or => format!("({old}|{vs})"),
                    RmwOp::Xor => format!("({old}^{vs})"),
                    RmwOp::Max | RmwOp::Min | RmwOp::UMax | RmwOp::UMin => {
                        return Err(CompileError::Legalization(
                            "unsupported atomic RMW operation".to_string(),
                        ))
                    }
                };
                let store = self.get_store(f, ptr, ty, new_val, 0)?;
                code.push_str(&store);
            }
            InstKind::Fence => {
                // No threads, so nothing to do here.
                code.push_str("/* fence */");
            }
            InstKind::ExtractElement { .. }
            | InstKind::InsertElement { .. }
            | InstKind::Shuffle { .. } => {
                return Err(CompileError::Unsupported(
                    "vector instruction on non-vector operands".to_string(),
                ))
            }
        }

        self.finish_line(f, id, code);
        Ok(())
    }

    fn finish_line(&self, f: &Function, id: InstId, code: &mut String) {
        if code.ends_with('\n') {
            return;
        }
        code.push(';');
        if let Some(loc) = &f.insts[id].loc {
            let _ = write!(code, " //@line {} \"{}\"", loc.line, loc.file);
        }
        code.push('\n');
    }

    fn generate_binary(
        &mut self,
        f: &Function,
        op: BinOp,
        ty: TyId,
        lhs: Value,
        rhs: Value,
    ) -> CompileResult<String> {
        let precise = self.opts.precise_f32;
        Ok(match op {
            BinOp::Add | BinOp::Sub => {
                let l = self.get_value_as_paren_str(f, lhs)?;
                let r = self.get_value_as_paren_str(f, rhs)?;
                let sign = if op == BinOp::Add { "+" } else { "-" };
                paren_cast(
                    &self.m.tys,
                    &format!("{l} {sign} {r}"),
                    ty,
                    CastMode::SIGNED,
                    precise,
                )?
            }
            BinOp::Mul => self.get_imul(f, lhs, rhs)?,
            BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem => {
                let mode = if matches!(op, BinOp::SDiv | BinOp::SRem) {
                    CastMode::SIGNED
                } else {
                    CastMode::UNSIGNED
                };
                let l = self.get_value_as_cast_paren_str(f, lhs, mode)?;
                let r = self.get_value_as_cast_paren_str(f, rhs, mode)?;
                let sign = if matches!(op, BinOp::UDiv | BinOp::SDiv) {
                    " / "
                } else {
                    " % "
                };
                format!("({l}{sign}{r})&-1")
            }
            BinOp::And | BinOp::Or | BinOp::Xor => {
                let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                let sign = match op {
                    BinOp::And => "&",
                    BinOp::Or => "|",
                    _ => "^",
                };
                format!("{l} {sign} {r}")
            }
            BinOp::Shl => {
                let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                let shifted = format!("{l} << {r}");
                if self.m.tys.int_bits(ty) < 32 {
                    // Drop the bits shifted beyond the width of this value.
                    paren_cast(&self.m.tys, &shifted, ty, CastMode::UNSIGNED, precise)?
                } else {
                    shifted
                }
            }
            BinOp::LShr | BinOp::AShr => {
                let mut input = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                if self.m.tys.int_bits(ty) < 32 {
                    // Fill in the high bits; the shift itself runs in 32.
                    let mode = if op == BinOp::AShr {
                        CastMode::SIGNED
                    } else {
                        CastMode::UNSIGNED
                    };
                    input = format!("({})", cast(&self.m.tys, &input, ty, mode, precise)?);
                }
                let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                let shift = if op == BinOp::AShr { " >> " } else { " >>> " };
                format!("{input}{shift}{r}")
            }
            BinOp::FAdd | BinOp::FMul | BinOp::FDiv | BinOp::FRem => {
                let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                let sign = match op {
                    BinOp::FAdd => "+",
                    BinOp::FMul => "*",
                    BinOp::FDiv => "/",
                    _ => "%",
                };
                ensure_float(format!("{l} {sign} {r}"), self.m.tys.get(ty), precise)
            }
            BinOp::FSub => {
                if self.is_fneg(f, lhs) {
                    let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                    ensure_float(format!("-{r}"), self.m.tys.get(ty), precise)
                } else {
                    let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                    let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                    ensure_float(format!("{l} - {r}"), self.m.tys.get(ty), precise)
                }
            }
        })
    }

    fn generate_gep(
        &mut self,
        f: &Function,
        base: Value,
        indices: &[Value],
    ) -> CompileResult<String> {
        let base_ty = self.m.value_ty(f, self.m.strip_pointer_casts(f, base));
        let mut cur = self.m.tys.pointee(base_ty);
        let mut text = self.get_value_as_paren_str(f, base)?;
        let mut constant_offset: i64 = 0;

        for (i, &index) in indices.iter().enumerate() {
            if i == 0 {
                // The first index steps over whole pointee-sized elements.
                let size = self.m.tys.alloc_size(cur) as i64;
                match self.m.const_int_value(index) {
                    Some(c) => constant_offset += c * size,
                    None => {
                        let scaled = self.gep_scaled_index(f, index, size as u32)?;
                        text = format!("({text} + ({scaled})|0)");
                    }
                }
                continue;
            }
            match self.m.tys.get(cur).clone() {
                Ty::Struct { fields, packed } => {
                    let field = self
                        .m
                        .const_int_value(index)
                        .ok_or_else(|| {
                            CompileError::Legalization(
                                "struct GEP index must be constant".to_string(),
                            )
                        })? as usize;
                    let layout = self.m.tys.struct_layout(&fields, packed);
                    constant_offset += layout.offsets[field] as i64;
                    cur = fields[field];
                }
                Ty::Array { elem, .. } => {
                    let size = self.m.tys.alloc_size(elem) as i64;
                    match self.m.const_int_value(index) {
                        Some(c) => constant_offset += c * size,
                        None => {
                            let scaled = self.gep_scaled_index(f, index, size as u32)?;
                            text = format!("({text} + ({scaled})|0)");
                        }
                    }
                    cur = elem;
                }
                other => {
                    return Err(CompileError::Legalization(format!(
                        "cannot index into {other:?} in GEP"
                    )))
                }
            }
        }

        if constant_offset != 0 {
            text = format!("({text} + {constant_offset}|0)");
        }
        Ok(text)
    }

    fn gep_scaled_index(
        &mut self,
        f: &Function,
        index: Value,
        size: u32,
    ) -> CompileResult<String> {
        if size == 1 {
            return self.get_value_as_str(f, index, CastMode::SIGNED);
        }
        let index_str = self.get_value_as_str(f, index, CastMode::SIGNED)?;
        if size.is_power_of_two() {
            return Ok(format!("{index_str}<<{}", size.trailing_zeros()));
        }
        Ok(format!("Math_imul({index_str}, {size})|0"))
    }

    fn generate_cast(
        &mut self,
        f: &Function,
        op: CastOp,
        val: Value,
        ty: TyId,
    ) -> CompileResult<String> {
        let precise = self.opts.precise_f32;
        Ok(match op {
            CastOp::PtrToInt | CastOp::IntToPtr => {
                self.get_value_as_str(f, val, CastMode::SIGNED)?
            }
            CastOp::Trunc => {
                let out_bits = self.m.tys.int_bits(ty);
                let mask = lsb_mask(out_bits);
                let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                format!("{v}&{mask}")
            }
            CastOp::SExt => {
                let src = self.m.value_ty(f, val);
                let bits = 32 - self.m.tys.int_bits(src);
                let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                format!("{v} << {bits} >> {bits}")
            }
            CastOp::ZExt => self.get_value_as_cast_str(f, val, CastMode::UNSIGNED)?,
            CastOp::FPExt => {
                let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                if precise {
                    format!("+{v}")
                } else {
                    v
                }
            }
            CastOp::FPTrunc => {
                let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                ensure_float(v, self.m.tys.get(ty), precise)
            }
            CastOp::SIToFP => {
                let v = self.get_value_as_cast_paren_str(f, val, CastMode::SIGNED)?;
                format!("({})", cast(&self.m.tys, &v, ty, CastMode::SIGNED, precise)?)
            }
            CastOp::UIToFP => {
                let v = self.get_value_as_cast_paren_str(f, val, CastMode::UNSIGNED)?;
                format!("({})", cast(&self.m.tys, &v, ty, CastMode::SIGNED, precise)?)
            }
            CastOp::FPToSI => {
                let v = self.get_value_as_paren_str(f, val)?;
                format!("({})", double_to_int(&v))
            }
            CastOp::FPToUI => {
                let v = self.get_value_as_paren_str(f, val)?;
                format!(
                    "({})",
                    cast(
                        &self.m.tys,
                        &double_to_int(&v),
                        ty,
                        CastMode::UNSIGNED,
                        precise
                    )?
                )
            }
            CastOp::Bitcast => {
                // Most bitcasts are no-ops; int<->float goes through the
                // shared staging slot.
                let in_ty = self.m.value_ty(f, val);
                let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                if self.m.tys.is_int(in_ty) && self.m.tys.is_fp(ty) {
                    debug_assert_eq!(self.m.tys.int_bits(in_ty), 32);
                    let read = cast(
                        &self.m.tys,
                        "HEAPF32[tempDoublePtr>>2]",
                        ty,
                        CastMode::SIGNED,
                        precise,
                    )?;
                    format!("(HEAP32[tempDoublePtr>>2]={v},{read})")
                } else if self.m.tys.is_fp(in_ty) && self.m.tys.is_int(ty) {
                    debug_assert_eq!(self.m.tys.int_bits(ty), 32);
                    format!("(HEAPF32[tempDoublePtr>>2]={v},HEAP32[tempDoublePtr>>2]|0)")
                } else {
                    v
                }
            }
        })
    }

    // ─── SIMD ───────────────────────────────────────────────────────

    fn simd_prefix(&self, kind: VecKind) -> &'static str {
        match kind {
            VecKind::Int32x4 => "SIMD_int32x4",
            VecKind::Float32x4 => "SIMD_float32x4",
        }
    }

    fn vec_kind(&self, ty: TyId) -> Option<VecKind> {
        match self.m.tys.get(ty) {
            Ty::Vector(k) => Some(*k),
            _ => None,
        }
    }

    /// Emit vector-typed instructions (and vector-consuming stores and
    /// extracts). Returns whether this instruction was SIMD and handled.
    fn generate_simd_expression(
        &mut self,
        f: &Function,
        id: InstId,
        code: &mut String,
    ) -> CompileResult<bool> {
        let inst: &Inst = &f.insts[id];
        let ty = inst.ty;
        if let Some(kind) = self.vec_kind(ty) {
            self.uses_simd = true;
            let prefix = self.simd_prefix(kind);
            let k = inst.kind.clone();
            match k {
                // A SIMD-valued call is just a call; no special handling.
                InstKind::Call { .. } => return Ok(false),
                // Phis ride the relooper branchings.
                InstKind::Phi { .. } => return Ok(true),
                InstKind::ICmp { pred, lhs, rhs } => {
                    self.generate_vector_icmp(f, id, pred, lhs, rhs, code)?
                }
                InstKind::FCmp { pred, lhs, rhs } => {
                    self.generate_vector_fcmp(f, id, pred, lhs, rhs, code)?
                }
                InstKind::Cast {
                    op: CastOp::SExt,
                    val,
                } => {
                    // Compare results are already sign-filled lanes, so the
                    // extension is a no-op.
                    let assign = self.assign_if_needed(f, id);
                    let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                    let _ = write!(code, "{assign}{v}");
                }
                InstKind::Select {
                    cond,
                    if_true,
                    if_false,
                } => {
                    if self.vec_kind(self.m.value_ty(f, cond)).is_none() {
                        // Scalar condition: the ternary path handles it.
                        return Ok(false);
                    }
                    let assign = self.assign_if_needed(f, id);
                    let c = self.get_value_as_str(f, cond, CastMode::SIGNED)?;
                    let t = self.get_value_as_str(f, if_true, CastMode::SIGNED)?;
                    let e = self.get_value_as_str(f, if_false, CastMode::SIGNED)?;
                    let _ = write!(code, "{assign}{prefix}_select({c},{t},{e})");
                }
                InstKind::Binary { op, lhs, rhs } => match op {
                    BinOp::FAdd | BinOp::FMul | BinOp::FDiv | BinOp::Add | BinOp::Sub
                    | BinOp::Mul | BinOp::And | BinOp::Or => {
                        let name = match op {
                            BinOp::FAdd | BinOp::Add => "add",
                            BinOp::FMul | BinOp::Mul => "mul",
                            BinOp::FDiv => "div",
                            BinOp::Sub => "sub",
                            BinOp::And => "and",
                            _ => "or",
                        };
                        let assign = self.assign_if_needed(f, id);
                        let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                        let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                        let _ = write!(code, "{assign}{prefix}_{name}({l},{r})");
                    }
                    BinOp::Xor => {
                        let assign = self.assign_if_needed(f, id);
                        // not(x) is spelled -1 ^ x.
                        if let Some(other) = self.vector_not_operand(lhs, rhs) {
                            let v = self.get_value_as_str(f, other, CastMode::SIGNED)?;
                            let _ = write!(code, "{assign}SIMD_int32x4_not({v})");
                        } else {
                            let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                            let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                            let _ = write!(code, "{assign}SIMD_int32x4_xor({l},{r})");
                        }
                    }
                    BinOp::FSub => {
                        let assign = self.assign_if_needed(f, id);
                        if self.is_vector_fneg(lhs) {
                            let v = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                            let _ = write!(code, "{assign}SIMD_float32x4_neg({v})");
                        } else {
                            let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
                            let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
                            let _ = write!(code, "{assign}SIMD_float32x4_sub({l},{r})");
                        }
                    }
                    BinOp::SDiv | BinOp::UDiv | BinOp::SRem | BinOp::URem => {
                        // The SIMD API has no integer division; emulate with
                        // scalar lanes, which is what hardware would do.
                        self.generate_unrolled(f, id, op, lhs, rhs, code)?
                    }
                    BinOp::AShr | BinOp::LShr | BinOp::Shl => {
                        self.generate_vector_shift(f, id, op, lhs, rhs, code)?
                    }
                    BinOp::FRem => {
                        return Err(CompileError::Unsupported(
                            "vector frem".to_string(),
                        ))
                    }
                },
                InstKind::Cast {
                    op: CastOp::Bitcast,
                    val,
                } => {
                    let assign = self.assign_if_needed(f, id);
                    let v = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                    let name = match kind {
                        VecKind::Int32x4 => "SIMD_int32x4_fromFloat32x4Bits",
                        VecKind::Float32x4 => "SIMD_float32x4_fromInt32x4Bits",
                    };
                    let _ = write!(code, "{assign}{name}({v})");
                }
                InstKind::Load { ptr, .. } => {
                    let assign = self.assign_if_needed(f, id);
                    let ps = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
                    let _ = write!(code, "{assign}{prefix}_load(HEAPU8, {ps})");
                }
                InstKind::InsertElement { .. } => {
                    self.generate_insert_element(f, id, code)?
                }
                InstKind::Shuffle { .. } => self.generate_shuffle_vector(f, id, code)?,
                other => {
                    return Err(CompileError::Unsupported(format!(
                        "vector instruction {other:?}"
                    )))
                }
            }
            return Ok(true);
        }

        // Vector-consuming instructions with scalar (or void) results.
        match inst.kind.clone() {
            InstKind::Store { val, ptr, .. }
                if self.vec_kind(self.m.value_ty(f, val)).is_some() =>
            {
                let kind = self.vec_kind(self.m.value_ty(f, val)).unwrap();
                self.uses_simd = true;
                let prefix = self.simd_prefix(kind);
                let ps = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
                let vs = self.get_value_as_str(f, val, CastMode::SIGNED)?;
                let _ = write!(code, "{prefix}_store(HEAPU8, {ps}, {vs})");
                Ok(true)
            }
            InstKind::ExtractElement { vec, lane } => {
                let kind = self
                    .vec_kind(self.m.value_ty(f, vec))
                    .ok_or_else(|| {
                        CompileError::Legalization("extractelement from non-vector".to_string())
                    })?;
                self.uses_simd = true;
                let lane = self.m.const_int_value(lane).ok_or_else(|| {
                    CompileError::Unsupported(
                        "SIMD extract element with non-constant index".to_string(),
                    )
                })?;
                if !(0..4).contains(&lane) {
                    return Err(CompileError::Unsupported(format!(
                        "SIMD lane index {lane}"
                    )));
                }
                let _ = kind;
                let assign = self.assign_if_needed(f, id);
                let v = self.get_value_as_str(f, vec, CastMode::SIGNED)?;
                let access = format!("{v}.{}", SIMD_LANE_LOWER[lane as usize]);
                let out = cast(
                    &self.m.tys,
                    &access,
                    ty,
                    CastMode::SIGNED,
                    self.opts.precise_f32,
                )?;
                let _ = write!(code, "{assign}{out}");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn vector_not_operand(&self, lhs: Value, rhs: Value) -> Option<Value> {
        if self.is_all_ones_vector(lhs) {
            Some(rhs)
        } else if self.is_all_ones_vector(rhs) {
            Some(lhs)
        } else {
            None
        }
    }

    fn is_all_ones_vector(&self, v: Value) -> bool {
        match v {
            Value::Const(c) => match &self.m.consts[c] {
                Const::Vector { lanes, .. } => lanes.iter().all(|&l| {
                    matches!(self.m.consts[l], Const::Int { value: -1, .. })
                }),
                _ => false,
            },
            _ => false,
        }
    }

    fn is_vector_fneg(&self, lhs: Value) -> bool {
        match lhs {
            Value::Const(c) => match &self.m.consts[c] {
                Const::Vector { lanes, .. } => lanes.iter().all(|&l| {
                    matches!(self.m.consts[l],
                        Const::Float { value, .. } if value == 0.0 && value.is_sign_negative())
                }),
                _ => false,
            },
            _ => false,
        }
    }

    fn generate_vector_icmp(
        &mut self,
        f: &Function,
        id: InstId,
        pred: IPred,
        lhs: Value,
        rhs: Value,
        code: &mut String,
    ) -> CompileResult<()> {
        let (name, invert) = match pred {
            IPred::Eq => ("equal", false),
            IPred::Ne => ("equal", true),
            IPred::Sle => ("greaterThan", true),
            IPred::Sge => ("lessThan", true),
            IPred::Ule => ("unsignedLessThanOrEqual", false),
            IPred::Uge => ("unsignedGreaterThanOrEqual", false),
            IPred::Ult => ("unsignedLessThan", false),
            IPred::Slt => ("lessThan", false),
            IPred::Ugt => ("unsignedGreaterThan", false),
            IPred::Sgt => ("greaterThan", false),
        };
        let assign = self.assign_if_needed(f, id);
        code.push_str(&assign);
        if invert {
            code.push_str("SIMD_int32x4_not(");
        }
        let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
        let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
        let _ = write!(code, "SIMD_int32x4_{name}({l}, {r})");
        if invert {
            code.push(')');
        }
        Ok(())
    }

    fn generate_vector_fcmp(
        &mut self,
        f: &Function,
        id: InstId,
        pred: FPred,
        lhs: Value,
        rhs: Value,
        code: &mut String,
    ) -> CompileResult<()> {
        let assign = self.assign_if_needed(f, id);
        code.push_str(&assign);
        let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
        let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
        match pred {
            FPred::False => {
                code.push_str("SIMD_int32x4_splat(0)");
                return Ok(());
            }
            FPred::True => {
                code.push_str("SIMD_int32x4_splat(-1)");
                return Ok(());
            }
            FPred::One => {
                let _ = write!(
                    code,
                    "SIMD_float32x4_and(SIMD_float32x4_and(\
                     SIMD_float32x4_equal({l}, {l}), \
                     SIMD_float32x4_equal({r}, {r})), \
                     SIMD_float32x4_notEqual({l}, {r}))"
                );
                return Ok(());
            }
            FPred::Ueq => {
                let _ = write!(
                    code,
                    "SIMD_float32x4_or(SIMD_float32x4_or(\
                     SIMD_float32x4_notEqual({l}, {l}), \
                     SIMD_float32x4_notEqual({r}, {r})), \
                     SIMD_float32x4_equal({l}, {r}))"
                );
                return Ok(());
            }
            FPred::Ord => {
                let _ = write!(
                    code,
                    "SIMD_float32x4_and(SIMD_float32x4_equal({l}, {l}), \
                     SIMD_float32x4_equal({r}, {r}))"
                );
                return Ok(());
            }
            FPred::Uno => {
                let _ = write!(
                    code,
                    "SIMD_float32x4_or(SIMD_float32x4_notEqual({l}, {l}), \
                     SIMD_float32x4_notEqual({r}, {r}))"
                );
                return Ok(());
            }
            _ => {}
        }
        let (name, invert) = match pred {
            FPred::Oeq => ("equal", false),
            FPred::Ogt => ("greaterThan", false),
            FPred::Oge => ("greaterThanOrEqual", false),
            FPred::Olt => ("lessThan", false),
            FPred::Ole => ("lessThanOrEqual", false),
            FPred::Ugt => ("lessThanOrEqual", true),
            FPred::Uge => ("lessThan", true),
            FPred::Ult => ("greaterThanOrEqual", true),
            FPred::Ule => ("greaterThan", true),
            FPred::Une => ("notEqual", false),
            _ => unreachable!(),
        };
        if invert {
            code.push_str("SIMD_int32x4_not(");
        }
        let _ = write!(code, "SIMD_float32x4_{name}({l}, {r})");
        if invert {
            code.push(')');
        }
        Ok(())
    }

    /// The splat scalar behind a vector value, if every lane agrees.
    fn get_splat_value(&self, f: &Function, v: Value) -> Option<Value> {
        match v {
            Value::Const(c) => match &self.m.consts[c] {
                Const::Vector { lanes, .. } => {
                    let first = *lanes.first()?;
                    let all_same = lanes.iter().all(|&l| {
                        match (&self.m.consts[l], &self.m.consts[first]) {
                            (Const::Int { value: a, .. }, Const::Int { value: b, .. }) => a == b,
                            (Const::Float { value: a, .. }, Const::Float { value: b, .. }) => {
                                a == b
                            }
                            _ => false,
                        }
                    });
                    all_same.then_some(Value::Const(first))
                }
                _ => None,
            },
            Value::Inst(_) => {
                let mut lanes: [Option<Value>; 4] = [None; 4];
                let mut cur = v;
                while let Value::Inst(i) = cur {
                    let InstKind::InsertElement { vec, elt, lane } = &f.insts[i].kind else {
                        return None;
                    };
                    let lane = self.m.const_int_value(*lane)?;
                    if !(0..4).contains(&lane) {
                        return None;
                    }
                    if lanes[lane as usize].is_none() {
                        lanes[lane as usize] = Some(*elt);
                    }
                    cur = *vec;
                }
                let first = lanes[0]?;
                lanes.iter().all(|&l| l == Some(first)).then_some(first)
            }
            Value::Arg(_) => None,
        }
    }

    fn generate_vector_shift(
        &mut self,
        f: &Function,
        id: InstId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        code: &mut String,
    ) -> CompileResult<()> {
        if let Some(splat) = self.get_splat_value(f, rhs) {
            let assign = self.assign_if_needed(f, id);
            let name = match op {
                BinOp::AShr => "shiftRightArithmeticByScalar",
                BinOp::LShr => "shiftRightLogicalByScalar",
                _ => "shiftLeftByScalar",
            };
            let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
            let c = self.get_value_as_str(f, splat, CastMode::SIGNED)?;
            let _ = write!(code, "{assign}SIMD_int32x4_{name}({l}, {c})");
            return Ok(());
        }
        // No vector-vector shifts in the SIMD API.
        self.generate_unrolled(f, id, op, lhs, rhs, code)
    }

    fn generate_unrolled(
        &mut self,
        f: &Function,
        id: InstId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        code: &mut String,
    ) -> CompileResult<()> {
        let ty = f.insts[id].ty;
        let kind = self.vec_kind(ty).expect("unrolled op is vector-typed");
        let float_lanes = kind == VecKind::Float32x4;
        let assign = self.assign_if_needed(f, id);
        code.push_str(&assign);
        code.push_str(self.simd_prefix(kind));
        code.push('(');
        let l = self.get_value_as_str(f, lhs, CastMode::SIGNED)?;
        let r = self.get_value_as_str(f, rhs, CastMode::SIGNED)?;
        for lane in 0..4 {
            if lane != 0 {
                code.push_str(", ");
            }
            if float_lanes && !self.opts.precise_f32 {
                code.push_str("Math_fround(");
            }
            let x = SIMD_LANE_LOWER[lane];
            let part = match op {
                BinOp::SDiv => format!("({l}.{x}|0) / ({r}.{x}|0)|0"),
                BinOp::UDiv => format!("({l}.{x}>>>0) / ({r}.{x}>>>0)>>>0"),
                BinOp::SRem => format!("({l}.{x}|0) % ({r}.{x}|0)|0"),
                BinOp::URem => format!("({l}.{x}>>>0) % ({r}.{x}>>>0)>>>0"),
                BinOp::AShr => format!("({l}.{x}|0) >> ({r}.{x}|0)|0"),
                BinOp::LShr => format!("({l}.{x}|0) >>> ({r}.{x}|0)|0"),
                BinOp::Shl => format!("({l}.{x}|0) << ({r}.{x}|0)|0"),
                other => {
                    return Err(CompileError::Unsupported(format!(
                        "unrolled vector op {other:?}"
                    )))
                }
            };
            code.push_str(&part);
            if float_lanes && !self.opts.precise_f32 {
                code.push(')');
            }
        }
        code.push(')');
        Ok(())
    }

    fn generate_insert_element(
        &mut self,
        f: &Function,
        id: InstId,
        code: &mut String,
    ) -> CompileResult<()> {
        let ty = f.insts[id].ty;
        let kind = self.vec_kind(ty).unwrap();
        let int_lanes = kind == VecKind::Int32x4;

        // Part of a chain or a splat idiom? Skip; the chain end (or the
        // shuffle) emits everything.
        if self.uses().has_one_use(id) {
            if let Some(user) = self.uses().single_user(id) {
                match &f.insts[user].kind {
                    InstKind::InsertElement { .. } => return Ok(()),
                    InstKind::Shuffle { a, mask, .. } => {
                        let InstKind::InsertElement { vec, lane, .. } = &f.insts[id].kind else {
                            unreachable!()
                        };
                        let base_is_insert = matches!(
                            vec,
                            Value::Inst(b) if matches!(f.insts[*b].kind, InstKind::InsertElement { .. })
                        );
                        if *a == Value::Inst(id)
                            && mask.iter().all(|&m| m == 0)
                            && !base_is_insert
                            && self.m.const_int_value(*lane) == Some(0)
                        {
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
        }

        // This insert ends a chain. Collect the inserted lanes so the chain
        // reads as a splat, a constructor, or a series of withX/withY.
        let mut operands: [Option<Value>; 4] = [None; 4];
        let mut num_inserted = 0usize;
        let InstKind::InsertElement { elt, .. } = &f.insts[id].kind else {
            unreachable!()
        };
        let mut splat = Some(*elt);
        let mut base = Value::Inst(id);
        loop {
            let Value::Inst(i) = base else { break };
            let InstKind::InsertElement { vec, elt, lane } = &f.insts[i].kind else {
                break;
            };
            let lane = self.m.const_int_value(*lane).ok_or_else(|| {
                CompileError::Unsupported("insertelement with non-constant index".to_string())
            })? as usize;
            if lane >= 4 {
                return Err(CompileError::Unsupported(format!(
                    "SIMD lane index {lane}"
                )));
            }
            if operands[lane].is_none() {
                num_inserted += 1;
                operands[lane] = Some(*elt);
                if Some(*elt) != splat {
                    splat = None;
                }
            }
            base = *vec;
            let cont = matches!(base, Value::Inst(b)
                if self.uses().has_one_use(b)
                    && matches!(f.insts[b].kind, InstKind::InsertElement { .. }));
            if !cont {
                break;
            }
        }

        let assign = self.assign_if_needed(f, id);
        code.push_str(&assign);
        if num_inserted == 4 {
            if let Some(splat) = splat {
                let mut operand = self.get_value_as_str(f, splat, CastMode::SIGNED)?;
                if int_lanes {
                    let _ = write!(code, "SIMD_int32x4_splat({operand})");
                } else {
                    if !self.opts.precise_f32 {
                        // The splat intrinsic wants an actual float32 even
                        // when we are otherwise not precise about it.
                        operand = format!("Math_fround({operand})");
                    }
                    let _ = write!(code, "SIMD_float32x4_splat({operand})");
                }
            } else {
                code.push_str(if int_lanes {
                    "SIMD_int32x4("
                } else {
                    "SIMD_float32x4("
                });
                for lane in 0..4 {
                    if lane != 0 {
                        code.push_str(", ");
                    }
                    let mut operand =
                        self.get_value_as_str(f, operands[lane].unwrap(), CastMode::SIGNED)?;
                    if !int_lanes && !self.opts.precise_f32 {
                        operand = format!("Math_fround({operand})");
                    }
                    code.push_str(&operand);
                }
                code.push(')');
            }
        } else {
            // A sparse series of inserts on an existing vector.
            let mut result = self.get_value_as_str(f, base, CastMode::SIGNED)?;
            for lane in 0..4 {
                let Some(op) = operands[lane] else { continue };
                let with = if int_lanes {
                    "SIMD_int32x4_with"
                } else {
                    "SIMD_float32x4_with"
                };
                let mut operand = self.get_value_as_str(f, op, CastMode::SIGNED)?;
                if !self.opts.precise_f32 && !int_lanes {
                    operand = format!("Math_fround({operand})");
                }
                result = format!("{with}{}({result},{operand})", SIMD_LANE_UPPER[lane]);
            }
            code.push_str(&result);
        }
        Ok(())
    }

    fn generate_shuffle_vector(
        &mut self,
        f: &Function,
        id: InstId,
        code: &mut String,
    ) -> CompileResult<()> {
        let ty = f.insts[id].ty;
        let kind = self.vec_kind(ty).unwrap();
        let int_lanes = kind == VecKind::Int32x4;
        let InstKind::Shuffle { a, b, mask } = f.insts[id].kind.clone() else {
            unreachable!()
        };

        let assign = self.assign_if_needed(f, id);
        code.push_str(&assign);

        // The splat idiom: insert into lane 0, then shuffle with a zero
        // mask. The insert skipped itself; emit the splat here.
        if mask.iter().all(|&m| m == 0) {
            if let Value::Inst(ai) = a {
                if let InstKind::InsertElement { elt, lane, .. } = &f.insts[ai].kind {
                    if self.m.const_int_value(*lane) == Some(0) {
                        let mut operand = self.get_value_as_str(f, *elt, CastMode::SIGNED)?;
                        if !self.opts.precise_f32 && !int_lanes {
                            operand = format!("Math_fround({operand})");
                        }
                        let name = if int_lanes {
                            "SIMD_int32x4_splat"
                        } else {
                            "SIMD_float32x4_splat"
                        };
                        let _ = write!(code, "{name}({operand})");
                        return Ok(());
                    }
                }
            }
        }

        let a_str = self.get_value_as_str(f, a, CastMode::SIGNED)?;
        let b_str = self.get_value_as_str(f, b, CastMode::SIGNED)?;
        let num = 4i32;

        // A mask drawing from only one operand is a swizzle.
        let swizzle_a = mask.iter().all(|&m| m < num);
        let swizzle_b = mask.iter().all(|&m| m < 0 || (m >= num && m < num * 2));
        if swizzle_a || swizzle_b {
            let t = if swizzle_a { &a_str } else { &b_str };
            let name = if int_lanes {
                "SIMD_int32x4_swizzle"
            } else {
                "SIMD_float32x4_swizzle"
            };
            let _ = write!(code, "{name}({t}");
            for i in 0..4 {
                let m = mask.get(i).copied().unwrap_or(-1);
                let lane = if m < 0 {
                    0
                } else if m < num {
                    m
                } else {
                    m - num
                };
                let _ = write!(code, ", {lane}");
            }
            code.push(')');
            return Ok(());
        }

        // Fully general shuffle.
        let name = if int_lanes {
            "SIMD_int32x4_shuffle"
        } else {
            "SIMD_float32x4_shuffle"
        };
        let _ = write!(code, "{name}({a_str}, {b_str}, ");
        for (i, &m) in mask.iter().enumerate() {
            if i != 0 {
                code.push_str(", ");
            }
            let lane = if m < 0 {
                0
            } else if m >= num {
                m - num + 4
            } else {
                m
            };
            let _ = write!(code, "{lane}");
        }
        code.push(')');
        Ok(())
    }
}

fn lsb_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Print an integer constant of the given width, signed or unsigned.
fn print_int(value: i64, bits: u32, unsigned: bool) -> String {
    let mask: u64 = if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };
    let raw = (value as u64) & mask;
    if unsigned {
        format!("{raw}")
    } else {
        // Sign-extend from the type's width.
        let shift = 64 - bits;
        let signed = ((raw << shift) as i64) >> shift;
        format!("{signed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_printing_honors_width_and_sign() {
        assert_eq!(print_int(-1, 32, false), "-1");
        assert_eq!(print_int(-1, 32, true), "4294967295");
        assert_eq!(print_int(255, 8, false), "-1");
        assert_eq!(print_int(255, 8, true), "255");
        assert_eq!(print_int(1, 1, true), "1");
    }

    #[test]
    fn lsb_masks() {
        assert_eq!(lsb_mask(1), 1);
        assert_eq!(lsb_mask(8), 255);
        assert_eq!(lsb_mask(16), 65535);
        assert_eq!(lsb_mask(64), u64::MAX);
    }
}
