//! Call-site lowering: the pluggable handler table.
//!
//! Every call is dispatched on the callee's mangled name. Most names hit the
//! default handler (a direct call, or a masked dispatch-table access for
//! function pointers); a fixed set of intrinsics get special treatment:
//! dropped entirely, rewritten onto the runtime library, mapped to native
//! `Math_*` operators, or threaded through the invoke (exception) protocol.
//!
//! Handlers also run in "indexed-only" mode when a function is assigned a
//! dispatch index without ever being called directly, so redirects for
//! library-implemented intrinsics land in the metadata even then.

use std::fmt::Write;

use crate::cast::{cast, CastMode};
use crate::error::{CompileError, CompileResult};
use crate::emit::Codegen;
use crate::ir::{Callee, FuncId, Function, InstId, InstKind, Ty, TyId, Value};
use crate::mangle::mangle_global;
use crate::tables::{mask_placeholder, signature_code};

/// Intrinsics that expand to nothing: debug metadata, lifetime markers and
/// hints no validated code can express.
const SKIPPED_INTRINSICS: &[&str] = &[
    "llvm.dbg.declare",
    "llvm.dbg.value",
    "llvm.lifetime.start",
    "llvm.lifetime.end",
    "llvm.invariant.start",
    "llvm.invariant.end",
    "llvm.prefetch",
    "llvm.flt.rounds",
];

/// Intrinsics that lower onto the runtime library; the redirect is recorded
/// so table slots holding the intrinsic name resolve to the real function.
fn library_lowering(name: &str) -> Option<&'static str> {
    if name.starts_with("llvm.memcpy.") {
        Some("memcpy")
    } else if name.starts_with("llvm.memset.") {
        Some("memset")
    } else if name.starts_with("llvm.memmove.") {
        Some("memmove")
    } else {
        None
    }
}

/// Intrinsics that map to native `Math_*` builtins.
fn math_lowering(name: &str) -> Option<&'static str> {
    let stem = name.strip_prefix("llvm.")?;
    let (op, _) = stem.split_once('.')?;
    match op {
        "sqrt" => Some("Math_sqrt"),
        "fabs" => Some("Math_abs"),
        "ceil" => Some("Math_ceil"),
        "floor" => Some("Math_floor"),
        "pow" => Some("Math_pow"),
        _ => None,
    }
}

impl<'m> Codegen<'m> {
    /// Assign (or fetch) the dispatch index for a function, running its
    /// handler in indexed-only mode on first assignment.
    pub(crate) fn get_function_index(&mut self, func: FuncId) -> CompileResult<u32> {
        let target = &self.m.funcs[func];
        let name = mangle_global(&target.name);
        let params: Vec<TyId> = target.params.iter().map(|p| p.ty).collect();
        let sig = signature_code(&self.m.tys, target.ret, &params, self.opts.precise_f32)?;
        let align = target.align;
        let (index, fresh) = self.tables.function_index(&name, &sig, align);
        if fresh {
            self.run_indexed_handler(func);
        }
        Ok(index)
    }

    /// The indexed-only handler pass: a function that lands in a table but
    /// lowers to a library call needs its redirect registered anyway.
    fn run_indexed_handler(&mut self, func: FuncId) {
        let raw = self.m.funcs[func].name.clone();
        if let Some(lib) = library_lowering(&raw) {
            let mangled = mangle_global(&raw);
            self.redirects
                .insert(mangled[1..].to_string(), mangle_global(lib));
            self.declares.insert(lib.to_string());
        }
    }

    /// Lower one call instruction. An empty string means "emit nothing".
    pub(crate) fn handle_call(&mut self, f: &Function, id: InstId) -> CompileResult<String> {
        let InstKind::Call { callee, args } = f.insts[id].kind.clone() else {
            unreachable!("handle_call on non-call");
        };
        match callee {
            Callee::Direct(target) => self.handle_direct_call(f, id, target, &args),
            Callee::Indirect { ptr, sig } => self.handle_indirect_call(f, id, ptr, sig, &args),
        }
    }

    fn handle_direct_call(
        &mut self,
        f: &Function,
        id: InstId,
        target: FuncId,
        args: &[Value],
    ) -> CompileResult<String> {
        let callee = &self.m.funcs[target];
        let raw_name = callee.name.clone();
        let external = callee.is_declaration();
        let ret = callee.ret;

        if SKIPPED_INTRINSICS
            .iter()
            .any(|p| raw_name == *p || raw_name.starts_with(&format!("{p}.")))
        {
            return Ok(String::new());
        }

        // llvm.expect's hint evaporates; the value passes through.
        if raw_name.starts_with("llvm.expect.") {
            let assign = self.assign_if_needed(f, id);
            let v = self.get_value_as_str(f, args[0], CastMode::SIGNED)?;
            return Ok(format!("{assign}{v}"));
        }

        match raw_name.as_str() {
            "llvm.stacksave" => {
                let assign = self.assign_if_needed(f, id);
                return Ok(format!("{assign}STACKTOP"));
            }
            "llvm.stackrestore" => {
                let v = self.get_value_as_str(f, args[0], CastMode::SIGNED)?;
                return Ok(format!("STACKTOP = {v}"));
            }
            "emscripten_preinvoke" => {
                self.invoke_state = 1;
                return Ok("__THREW__ = 0".to_string());
            }
            "emscripten_postinvoke" => {
                self.invoke_state = 0;
                let assign = self.assign_if_needed(f, id);
                return Ok(format!("{assign}__THREW__; __THREW__ = 0"));
            }
            "setTempRet0" => {
                let v = self.get_value_as_cast_str(f, args[0], CastMode::NONSPECIFIC)?;
                return Ok(format!("tempRet0 = ({v})"));
            }
            "getTempRet0" => {
                let assign = self.assign_if_needed(f, id);
                return Ok(format!("{assign}(tempRet0 | 0)"));
            }
            _ => {}
        }

        if let Some(math) = math_lowering(&raw_name) {
            let assign = self.assign_if_needed(f, id);
            let mut text = format!("{assign}{math}(");
            for (i, &arg) in args.iter().enumerate() {
                if i > 0 {
                    text.push_str(", ");
                }
                let a = self.get_value_as_cast_str(f, arg, CastMode::NONSPECIFIC)?;
                let _ = write!(text, "{a}");
            }
            text.push(')');
            return Ok(text);
        }

        if let Some(lib) = library_lowering(&raw_name) {
            // Memory intrinsics carry (dst, src/val, len, align, volatile);
            // the library functions take the first three.
            self.declares.insert(lib.to_string());
            self.redirects
                .insert(mangle_global(&raw_name)[1..].to_string(), mangle_global(lib));
            let assign = self.assign_if_needed(f, id);
            let mut text = format!("{assign}{}(", mangle_global(lib));
            for (i, &arg) in args.iter().take(3).enumerate() {
                if i > 0 {
                    text.push_str(", ");
                }
                let a = self.get_value_as_cast_str(f, arg, CastMode::NONSPECIFIC)?;
                let _ = write!(text, "{a}");
            }
            text.push_str(")|0");
            return Ok(text);
        }

        if external {
            self.declares.insert(raw_name.clone());
        }

        // The invoke protocol replaces the call in flight with a dispatch
        // through the runtime's invoke_<sig> wrappers.
        if self.invoke_state == 1 {
            let params: Vec<TyId> = callee.params.iter().map(|p| p.ty).collect();
            let sig = signature_code(&self.m.tys, ret, &params, self.opts.precise_f32)?;
            let index = self.get_function_index(target)?;
            self.invoke_state = 2;
            self.declares.insert(format!("invoke_{sig}"));
            let mut text = format!("invoke_{sig}({index}|0");
            for &arg in args {
                text.push(',');
                let a = self.get_value_as_cast_str(
                    f,
                    arg,
                    CastMode::NONSPECIFIC.with(CastMode::FFI_OUT),
                )?;
                let _ = write!(text, "{a}");
            }
            text.push(')');
            return self.finish_call(f, id, text, ret, true);
        }

        let mut text = format!("{}(", mangle_global(&raw_name));
        let arg_mode = if external {
            CastMode::NONSPECIFIC.with(CastMode::FFI_OUT)
        } else {
            CastMode::NONSPECIFIC
        };
        for (i, &arg) in args.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            let a = self.get_value_as_cast_str(f, arg, arg_mode)?;
            let _ = write!(text, "{a}");
        }
        text.push(')');
        self.finish_call(f, id, text, ret, external)
    }

    fn handle_indirect_call(
        &mut self,
        f: &Function,
        id: InstId,
        ptr: Value,
        sig_ty: TyId,
        args: &[Value],
    ) -> CompileResult<String> {
        let (ret, params) = match self.m.tys.get(sig_ty).clone() {
            Ty::Func { ret, params } => (ret, params),
            other => {
                return Err(CompileError::Invariant(format!(
                    "indirect call through non-function type {other:?}"
                )))
            }
        };
        let sig = signature_code(&self.m.tys, ret, &params, self.opts.precise_f32)?;
        self.tables.ensure_table(&sig);
        let p = self.get_value_as_str(f, ptr, CastMode::SIGNED)?;
        let mut text = format!(
            "FUNCTION_TABLE_{sig}[({p})&{}](",
            mask_placeholder(&sig)
        );
        for (i, &arg) in args.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            let a = self.get_value_as_cast_str(f, arg, CastMode::NONSPECIFIC)?;
            let _ = write!(text, "{a}");
        }
        text.push(')');
        self.finish_call(f, id, text, ret, false)
    }

    /// Attach the result coercion and assignment to a built call expression.
    fn finish_call(
        &mut self,
        f: &Function,
        id: InstId,
        call: String,
        ret: TyId,
        ffi: bool,
    ) -> CompileResult<String> {
        if self.m.tys.is_void(ret) {
            return Ok(call);
        }
        let mode = if ffi {
            CastMode::NONSPECIFIC.with(CastMode::FFI_IN)
        } else {
            CastMode::NONSPECIFIC
        };
        let coerced = cast(&self.m.tys, &call, ret, mode, self.opts.precise_f32)?;
        let assign = self.assign_if_needed(f, id);
        Ok(format!("{assign}{coerced}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_lowerings_are_detected() {
        assert_eq!(library_lowering("llvm.memcpy.p0i8.p0i8.i32"), Some("memcpy"));
        assert_eq!(library_lowering("llvm.memset.p0i8.i32"), Some("memset"));
        assert_eq!(library_lowering("llvm.sin.f64"), None);
        assert_eq!(math_lowering("llvm.sqrt.f64"), Some("Math_sqrt"));
        assert_eq!(math_lowering("llvm.fabs.f32"), Some("Math_abs"));
        assert_eq!(math_lowering("llvm.memcpy.p0i8.p0i8.i32"), None);
    }
}
