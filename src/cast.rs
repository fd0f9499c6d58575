//! The coercion engine: every value crossing an expression boundary in the
//! target dialect gets an explicit cast annotation, and this module knows
//! the canonical spelling for each type.
//!
//! The wrappers are purely textual. `cast` never inspects the expression it
//! wraps; idempotence (wrapping an already-canonical expression) costs at
//! most one redundant outer `|0` / `+` / `Math_fround`.

use crate::error::{CompileError, CompileResult};
use crate::ir::{Ty, TyId, TypeStore, VecKind};

/// Cast mode flags. `SIGNED` is the absence of every other flag, mirroring
/// how call sites combine these with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastMode(u32);

impl CastMode {
    pub const SIGNED: CastMode = CastMode(0);
    pub const UNSIGNED: CastMode = CastMode(1);
    /// Do not differentiate int widths or signs: `|0` for every integer.
    pub const NONSPECIFIC: CastMode = CastMode(2);
    /// Value is coming back across an FFI boundary.
    pub const FFI_IN: CastMode = CastMode(4);
    /// Value is going out across an FFI boundary.
    pub const FFI_OUT: CastMode = CastMode(8);
    /// Force a cast even on expressions that normally pass through bare.
    pub const MUST_CAST: CastMode = CastMode(16);

    pub fn with(self, other: CastMode) -> CastMode {
        CastMode(self.0 | other.0)
    }

    pub fn has(self, other: CastMode) -> bool {
        self.0 & other.0 != 0
    }
}

/// Wrap `s` in the canonical coercion for `ty` under the given mode.
pub fn cast(
    tys: &TypeStore,
    s: &str,
    ty: TyId,
    mode: CastMode,
    precise_f32: bool,
) -> CompileResult<String> {
    Ok(match tys.get(ty) {
        Ty::Vector(VecKind::Int32x4) => format!("SIMD_int32x4_check({s})"),
        Ty::Vector(VecKind::Float32x4) => format!("SIMD_float32x4_check({s})"),
        Ty::Float if precise_f32 && !mode.has(CastMode::FFI_OUT) => {
            if mode.has(CastMode::FFI_IN) {
                format!("Math_fround(+({s}))")
            } else {
                format!("Math_fround({s})")
            }
        }
        // Without precise-f32 (or across an FFI-out boundary), float falls
        // through to the double coercion.
        Ty::Float | Ty::Double => format!("+{s}"),
        Ty::Int(bits) => match bits {
            1 if !mode.has(CastMode::NONSPECIFIC) => {
                if mode == CastMode::UNSIGNED {
                    format!("{s}&1")
                } else {
                    format!("{s}<<31>>31")
                }
            }
            8 if !mode.has(CastMode::NONSPECIFIC) => {
                if mode == CastMode::UNSIGNED {
                    format!("{s}&255")
                } else {
                    format!("{s}<<24>>24")
                }
            }
            16 if !mode.has(CastMode::NONSPECIFIC) => {
                if mode == CastMode::UNSIGNED {
                    format!("{s}&65535")
                } else {
                    format!("{s}<<16>>16")
                }
            }
            1 | 8 | 16 | 32 => {
                if mode == CastMode::SIGNED || mode.has(CastMode::NONSPECIFIC) {
                    format!("{s}|0")
                } else {
                    format!("{s}>>>0")
                }
            }
            other => {
                return Err(CompileError::Legalization(format!(
                    "unsupported integer cast bitwidth {other}"
                )))
            }
        },
        Ty::Ptr(_) | Ty::Func { .. } => {
            if mode == CastMode::SIGNED || mode.has(CastMode::NONSPECIFIC) {
                format!("{s}|0")
            } else {
                format!("{s}>>>0")
            }
        }
        other => {
            return Err(CompileError::Unsupported(format!(
                "cannot cast value of type {other:?}"
            )))
        }
    })
}

/// Like [`cast`], but parenthesizes the expression first.
pub fn paren_cast(
    tys: &TypeStore,
    s: &str,
    ty: TyId,
    mode: CastMode,
    precise_f32: bool,
) -> CompileResult<String> {
    cast(tys, &format!("({s})"), ty, mode, precise_f32)
}

/// Apply the cast only when the mode demands one.
pub fn ensure_cast(
    tys: &TypeStore,
    s: String,
    ty: TyId,
    mode: CastMode,
    precise_f32: bool,
) -> CompileResult<String> {
    if mode.has(CastMode::MUST_CAST) {
        cast(tys, &s, ty, CastMode::SIGNED, precise_f32)
    } else {
        Ok(s)
    }
}

/// Wrap in `Math_fround` iff the type is float32 and precise-f32 is on.
pub fn ensure_float(s: String, ty: &Ty, precise_f32: bool) -> String {
    if precise_f32 && matches!(ty, Ty::Float) {
        format!("Math_fround({s})")
    } else {
        s
    }
}

/// The canonical double-to-int conversion.
pub fn double_to_int(s: &str) -> String {
    format!("~~({s})")
}

/// Format a floating constant the way the target dialect expects.
///
/// Infinities and NaN use the runtime's own spellings. Integral values get a
/// leading `+` so downstream minifiers cannot turn them back into integer
/// tokens.
pub fn ftostr(value: f64, is_float32: bool, precise_f32: bool) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    // Under precise-f32 a float constant prints from its f32 value, which
    // keeps the literal short; otherwise print the double it was widened to.
    let s = if is_float32 && precise_f32 {
        format!("{}", value as f32)
    } else {
        format!("{value}")
    };
    if value.fract() == 0.0 && !s.contains('.') && !s.contains('e') {
        format!("+{s}")
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (TypeStore, TyId, TyId, TyId, TyId, TyId) {
        let mut tys = TypeStore::new();
        let i1 = tys.i1();
        let i16 = tys.i16();
        let i32 = tys.i32();
        let f = tys.float();
        let d = tys.double();
        (tys, i1, i16, i32, f, d)
    }

    #[test]
    fn integer_casts() {
        let (tys, i1, i16, i32, _, _) = store();
        assert_eq!(cast(&tys, "x", i1, CastMode::UNSIGNED, false).unwrap(), "x&1");
        assert_eq!(
            cast(&tys, "x", i1, CastMode::SIGNED, false).unwrap(),
            "x<<31>>31"
        );
        assert_eq!(
            cast(&tys, "x", i16, CastMode::UNSIGNED, false).unwrap(),
            "x&65535"
        );
        assert_eq!(
            cast(&tys, "x", i16, CastMode::SIGNED, false).unwrap(),
            "x<<16>>16"
        );
        assert_eq!(cast(&tys, "x", i32, CastMode::SIGNED, false).unwrap(), "x|0");
        assert_eq!(
            cast(&tys, "x", i32, CastMode::UNSIGNED, false).unwrap(),
            "x>>>0"
        );
    }

    #[test]
    fn nonspecific_flattens_widths() {
        let (tys, i1, i16, _, _, _) = store();
        let ns = CastMode::NONSPECIFIC;
        assert_eq!(cast(&tys, "x", i1, ns, false).unwrap(), "x|0");
        assert_eq!(cast(&tys, "x", i16, ns, false).unwrap(), "x|0");
    }

    #[test]
    fn float_casts_follow_precision() {
        let (tys, _, _, _, f, d) = store();
        assert_eq!(cast(&tys, "x", d, CastMode::SIGNED, true).unwrap(), "+x");
        assert_eq!(
            cast(&tys, "x", f, CastMode::SIGNED, true).unwrap(),
            "Math_fround(x)"
        );
        // Without precise-f32 a float coerces like a double.
        assert_eq!(cast(&tys, "x", f, CastMode::SIGNED, false).unwrap(), "+x");
        // FFI boundaries exchange doubles.
        assert_eq!(
            cast(&tys, "x", f, CastMode::FFI_OUT, true).unwrap(),
            "+x"
        );
        assert_eq!(
            cast(&tys, "x", f, CastMode::FFI_IN, true).unwrap(),
            "Math_fround(+(x))"
        );
    }

    #[test]
    fn coercion_idempotence() {
        let (tys, _, _, i32, _, d) = store();
        let once = cast(&tys, "x", i32, CastMode::SIGNED, false).unwrap();
        let twice = cast(&tys, &once, i32, CastMode::SIGNED, false).unwrap();
        assert_eq!(twice, format!("{once}|0"));
        let once = cast(&tys, "x", d, CastMode::SIGNED, false).unwrap();
        let twice = cast(&tys, &once, d, CastMode::SIGNED, false).unwrap();
        assert_eq!(twice, format!("+{once}"));
    }

    #[test]
    fn float_literals() {
        assert_eq!(ftostr(0.0, false, false), "+0");
        assert_eq!(ftostr(1.0, false, false), "+1");
        assert_eq!(ftostr(0.5, false, false), "0.5");
        assert_eq!(ftostr(f64::INFINITY, false, false), "inf");
        assert_eq!(ftostr(f64::NEG_INFINITY, false, false), "-inf");
        assert_eq!(ftostr(f64::NAN, false, false), "nan");
    }
}
