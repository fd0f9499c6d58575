//! The module emitter: drives the per-function pipeline and assembles the
//! final output stream.
//!
//! Per function: alloca analysis, optional nativization, relooped body,
//! batched local declarations, stack-frame prologue, trailing-return
//! repair. Per module: constant processing, the `runPostSets` routine, the
//! memory-initializer literal, dispatch tables and the metadata record the
//! downstream linker consumes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write;

use serde::Serialize;

use crate::alloca::{FramePlan, NativizedVars};
use crate::cast::{cast, paren_cast, CastMode};
use crate::error::{CompileError, CompileResult};
use crate::heap::{GlobalLayout, STACK_ALIGN};
use crate::ir::{
    Const, FuncId, Function, InstId, InstKind, Module, Ty, TyId, UseInfo, Value, VecKind,
};
use crate::mangle::{mangle_global, mangle_local};
use crate::relooper::Relooper;
use crate::tables::FunctionTables;
use crate::{OptLevel, Options};

const EXPECTED_TRIPLE: &str = "asmjs-unknown-emscripten";

/// What a local variable is, for declaration defaults. Locals only ever
/// hold scalar or vector values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalKind {
    Int,
    Float,
    Double,
    IntVec,
    FloatVec,
}

pub(crate) struct Codegen<'m> {
    pub(crate) m: &'m Module,
    pub(crate) opts: &'m Options,

    // Module-lifetime state.
    pub(crate) layout: GlobalLayout,
    pub(crate) tables: FunctionTables,
    pub(crate) externals: BTreeSet<String>,
    pub(crate) declares: BTreeSet<String>,
    pub(crate) redirects: BTreeMap<String, String>,
    pub(crate) post_sets: String,
    pub(crate) named_globals: BTreeMap<String, u32>,
    pub(crate) global_initializers: Vec<String>,
    pub(crate) exports: Vec<String>,
    block_addresses: BTreeMap<FuncId, BTreeMap<usize, u32>>,
    pub(crate) cant_validate: String,
    pub(crate) uses_simd: bool,

    // Per-function state, reset by `emit_function`.
    value_names: HashMap<Value, String>,
    pub(crate) used_vars: BTreeMap<String, LocalKind>,
    unique_num: u32,
    pub(crate) invoke_state: u32,
    pub(crate) stack_bumped: bool,
    pub(crate) frame: FramePlan,
    pub(crate) nativized: NativizedVars,
    use_info: Option<UseInfo>,
    inst_blocks: Vec<usize>,
    warned_many_locals: bool,
}

impl<'m> Codegen<'m> {
    pub(crate) fn new(m: &'m Module, opts: &'m Options) -> Self {
        Self {
            m,
            opts,
            layout: GlobalLayout::new(opts.global_base),
            tables: FunctionTables::new(
                opts.reserved_function_pointers,
                opts.no_aliasing_function_pointers,
            ),
            externals: BTreeSet::new(),
            declares: BTreeSet::new(),
            redirects: BTreeMap::new(),
            post_sets: String::new(),
            named_globals: BTreeMap::new(),
            global_initializers: Vec::new(),
            exports: Vec::new(),
            block_addresses: BTreeMap::new(),
            cant_validate: String::new(),
            uses_simd: false,
            value_names: HashMap::new(),
            used_vars: BTreeMap::new(),
            unique_num: 0,
            invoke_state: 0,
            stack_bumped: false,
            frame: FramePlan::default(),
            nativized: NativizedVars::none(),
            use_info: None,
            inst_blocks: Vec::new(),
            warned_many_locals: false,
        }
    }

    // ─── Naming ─────────────────────────────────────────────────────

    pub(crate) fn js_name(&mut self, f: &Function, v: Value) -> String {
        if let Some(name) = self.value_names.get(&v) {
            return name.clone();
        }
        let name = match v {
            Value::Const(c) => match &self.m.consts[c] {
                Const::Function(func) => mangle_global(&self.m.funcs[*func].name),
                Const::Global(g) => mangle_global(&self.m.globals[*g].name),
                other => panic!("no name for constant {other:?}"),
            },
            Value::Inst(i) => {
                let base = match &f.insts[i].name {
                    Some(n) => n.clone(),
                    None => {
                        let n = self.unique_num;
                        self.unique_num += 1;
                        n.to_string()
                    }
                };
                mangle_local(&base)
            }
            Value::Arg(i) => {
                let base = match &f.params[i as usize].name {
                    Some(n) => n.clone(),
                    None => {
                        let n = self.unique_num;
                        self.unique_num += 1;
                        n.to_string()
                    }
                };
                mangle_local(&base)
            }
        };
        self.value_names.insert(v, name.clone());
        name
    }

    pub(crate) fn local_kind(&self, ty: TyId) -> LocalKind {
        match self.m.tys.get(ty) {
            Ty::Int(_) | Ty::Ptr(_) | Ty::Func { .. } => LocalKind::Int,
            Ty::Float => LocalKind::Float,
            Ty::Double => LocalKind::Double,
            Ty::Vector(VecKind::Int32x4) => LocalKind::IntVec,
            Ty::Vector(VecKind::Float32x4) => LocalKind::FloatVec,
            other => panic!("local variable of type {other:?}"),
        }
    }

    pub(crate) fn ad_hoc_assign(&mut self, name: &str, ty: TyId) -> String {
        self.used_vars.insert(name.to_string(), self.local_kind(ty));
        format!("{name} = ")
    }

    pub(crate) fn get_assign(&mut self, f: &Function, id: InstId) -> String {
        let name = self.js_name(f, Value::Inst(id));
        self.ad_hoc_assign(&name, f.insts[id].ty)
    }

    pub(crate) fn assign_if_needed(&mut self, f: &Function, id: InstId) -> String {
        if self.uses().is_used(id) {
            self.get_assign(f, id)
        } else {
            String::new()
        }
    }

    pub(crate) fn uses(&self) -> &UseInfo {
        self.use_info
            .as_ref()
            .expect("use analysis runs before emission")
    }

    /// Per-function block index, assigned in first-reference order.
    pub(crate) fn block_address(&mut self, func: FuncId, block: usize) -> u32 {
        let map = self.block_addresses.entry(func).or_default();
        let next = map.len() as u32;
        *map.entry(block).or_insert(next)
    }

    // ─── Phi preludes ───────────────────────────────────────────────

    /// The assignments an edge `from -> to` must perform for the phis of
    /// `to`. A dependency between two phi targets of the same block is
    /// broken by copying one value into a `$phi` temporary first.
    fn get_phi_code(&mut self, f: &Function, from: usize, to: usize) -> CompileResult<String> {
        let mut phi_vars = HashSet::new();
        for &id in &f.blocks[to].insts {
            let InstKind::Phi { .. } = f.insts[id].kind else {
                break;
            };
            phi_vars.insert(self.js_name(f, Value::Inst(id)));
        }
        if phi_vars.is_empty() {
            return Ok(String::new());
        }

        let mut assigns: BTreeMap<String, String> = BTreeMap::new();
        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        let mut deps: BTreeMap<String, String> = BTreeMap::new();
        let mut undeps: BTreeMap<String, String> = BTreeMap::new();
        for &id in &f.blocks[to].insts {
            let InstKind::Phi { ref incoming } = f.insts[id].kind else {
                break;
            };
            let Some(&(v, _)) = incoming.iter().find(|&&(_, pred)| pred == from) else {
                continue;
            };
            let name = self.js_name(f, Value::Inst(id));
            assigns.insert(name.clone(), self.get_assign(f, id));
            // Strip pointer casts so the dependency scan sees the same
            // value the translation will print.
            let v = self.m.strip_pointer_casts(f, v);
            values.insert(name.clone(), v);
            let vname = self.get_value_as_str(f, v, CastMode::SIGNED)?;
            if let Value::Inst(vi) = v {
                if self.inst_blocks[vi.index()] == to && phi_vars.contains(&vname) {
                    deps.insert(name.clone(), vname.clone());
                    undeps.insert(vname, name);
                }
            }
        }

        // Emit assignments respecting dependencies, breaking cycles.
        let mut pre = String::new();
        let mut post = String::new();
        while !assigns.is_empty() {
            let mut emitted = false;
            let keys: Vec<String> = assigns.keys().cloned().collect();
            for (idx, curr) in keys.iter().enumerate() {
                if !assigns.contains_key(curr) {
                    continue;
                }
                let v = values[curr];
                let mut cv = self.get_value_as_str(f, v, CastMode::SIGNED)?;
                let dep = deps.get(curr).cloned();
                if dep.is_none() || (!emitted && idx == keys.len() - 1) {
                    if let Some(dep_name) = dep {
                        // Break the cycle with a temporary copy.
                        let temp = format!("{curr}$phi");
                        let ty = self.m.value_ty(f, v);
                        let assign = self.ad_hoc_assign(&temp, ty);
                        let _ = write!(pre, "{assign}{cv};");
                        cv = temp;
                        deps.remove(curr);
                        undeps.remove(&dep_name);
                    }
                    let _ = write!(post, "{}{cv};", assigns[curr]);
                    assigns.remove(curr);
                    emitted = true;
                }
            }
        }
        Ok(pre + &post)
    }

    // ─── Function emission ──────────────────────────────────────────

    /// A condition variable makes the relooper render `switch` dispatch:
    /// worthwhile for dense switches, mandatory for indirect branches.
    fn consider_condition_var(
        &mut self,
        f: &Function,
        term: InstId,
    ) -> CompileResult<Option<String>> {
        match &f.insts[term].kind {
            InstKind::IndirectBr { addr, .. } => {
                let addr = *addr;
                Ok(Some(self.get_value_as_cast_str(f, addr, CastMode::SIGNED)?))
            }
            InstKind::Switch { cond, cases, .. } => {
                let cond = *cond;
                let num = cases.len() as i64;
                let min = cases.iter().map(|&(v, _)| v).min().unwrap_or(0);
                let max = cases.iter().map(|&(v, _)| v).max().unwrap_or(0);
                let range = max - min;
                // Use a switch unless the range is too big or sparse.
                if num < 5 || range > 10 * 1024 || (range / num) > 1024 {
                    Ok(None)
                } else {
                    Ok(Some(self.get_value_as_cast_str(f, cond, CastMode::SIGNED)?))
                }
            }
            _ => Ok(None),
        }
    }

    fn emit_function(&mut self, fid: FuncId, out: &mut String) -> CompileResult<()> {
        let f = &self.m.funcs[fid];
        debug_assert!(!f.is_declaration());

        // Reset per-function caches and analyses.
        self.value_names.clear();
        self.used_vars.clear();
        self.unique_num = 0;
        self.invoke_state = 0;
        self.stack_bumped = false;
        // When optimizing, the regular pipeline already took every
        // nativization opportunity.
        self.nativized = if self.opts.opt_level == OptLevel::None {
            NativizedVars::analyze(self.m, f)
        } else {
            NativizedVars::none()
        };
        self.frame = FramePlan::analyze(self.m, f, &self.nativized);
        self.use_info = Some(UseInfo::analyze(f));
        self.inst_blocks = vec![0; f.insts.len()];
        for (bi, block) in f.blocks.iter().enumerate() {
            for &id in &block.insts {
                self.inst_blocks[id.index()] = bi;
            }
        }

        let name = mangle_global(&f.name);
        let _ = write!(out, "function {name}(");
        for i in 0..f.params.len() {
            if i > 0 {
                out.push(',');
            }
            let arg = self.js_name(f, Value::Arg(i as u32));
            out.push_str(&arg);
        }
        out.push_str(") {\n");
        for (i, param) in f.params.iter().enumerate() {
            let arg = self.js_name(f, Value::Arg(i as u32));
            let coerced = cast(
                &self.m.tys,
                &arg,
                param.ty,
                CastMode::NONSPECIFIC,
                self.opts.precise_f32,
            )?;
            let _ = writeln!(out, " {arg} = {coerced};");
        }

        let body = self.reloop_function(fid, f)?;

        // Declare the locals the walker used, in batches with defaults.
        self.used_vars.insert("sp".to_string(), LocalKind::Int);
        if self.frame.max_alignment() > STACK_ALIGN {
            self.used_vars.insert("sp_a".to_string(), LocalKind::Int);
        }
        self.used_vars.insert("label".to_string(), LocalKind::Int);
        let num_locals = self.used_vars.len();
        let mut count = 0;
        for (name, kind) in std::mem::take(&mut self.used_vars) {
            if count == 20 {
                out.push_str(";\n");
                count = 0;
            }
            if count == 0 {
                out.push_str(" var ");
            } else {
                out.push_str(", ");
            }
            count += 1;
            let default = match kind {
                LocalKind::Int => "0",
                LocalKind::Float if self.opts.precise_f32 => "Math_fround(0)",
                LocalKind::Float | LocalKind::Double => "+0",
                LocalKind::IntVec => "SIMD_int32x4(0,0,0,0)",
                LocalKind::FloatVec => "SIMD_float32x4(0,0,0,0)",
            };
            let _ = write!(out, "{name} = {default}");
        }
        if count > 0 {
            out.push_str(";\n");
        }

        if !self.warned_many_locals
            && self.opts.opt_level == OptLevel::None
            && num_locals > 2000
        {
            log::warn!(
                "emitted code will contain very large numbers of local variables, \
                 which is bad for performance (compile with optimizations to avoid this)"
            );
            self.warned_many_locals = true;
        }

        // Stack entry.
        out.push_str(" sp = STACKTOP;\n");
        if self.frame.frame_size() > 0 {
            let max_align = self.frame.max_alignment();
            if max_align > STACK_ALIGN {
                // The whole frame needs more than the default alignment.
                let _ = writeln!(
                    out,
                    " sp_a = STACKTOP = (STACKTOP + {})&-{max_align};",
                    max_align - 1
                );
            }
            let bump = self.get_stack_bump(&self.frame.frame_size().to_string());
            let _ = writeln!(out, " {bump}");
        }

        out.push_str(&body);

        // Ensure a final return when the body can fall off the end.
        if !self.m.tys.is_void(f.ret) {
            let tail = match body.rfind('}') {
                Some(pos) => &body[pos..],
                None => &body[..],
            };
            if !tail.contains("return ") {
                let default = self.default_value_str(f.ret)?;
                let ret = paren_cast(
                    &self.m.tys,
                    &default,
                    f.ret,
                    CastMode::NONSPECIFIC,
                    self.opts.precise_f32,
                )?;
                let _ = writeln!(out, " return {ret};");
            }
        }
        out.push_str("}\n");
        Ok(())
    }

    /// The canonical "don't care" value of a type, for padding returns.
    fn default_value_str(&mut self, ty: TyId) -> CompileResult<String> {
        Ok(match self.m.tys.get(ty) {
            Ty::Vector(VecKind::Int32x4) => {
                self.uses_simd = true;
                "SIMD_int32x4_splat(0)".to_string()
            }
            Ty::Vector(VecKind::Float32x4) => {
                self.uses_simd = true;
                "SIMD_float32x4_splat(Math_fround(0))".to_string()
            }
            Ty::Float | Ty::Double => "+0".to_string(),
            _ => "0".to_string(),
        })
    }

    /// Build relooper blocks and branchings from the CFG, then render.
    fn reloop_function(&mut self, fid: FuncId, f: &Function) -> CompileResult<String> {
        let mut relooper = Relooper::new();
        relooper.set_min_size(f.min_size);

        for (bi, block) in f.blocks.iter().enumerate() {
            // Each basic block begins in invoke state 0; the previous block
            // may not have cleared it.
            self.invoke_state = 0;
            let mut code = String::new();
            for &id in &block.insts {
                if !self.m.is_no_op_cast(f, id) {
                    self.generate_expression(f, id, &mut code)?;
                }
            }
            let term = f.terminator(bi);
            let condition = self.consider_condition_var(f, term)?;
            let added = relooper.add_block(code, condition);
            debug_assert_eq!(added, bi);
        }

        for (bi, _) in f.blocks.iter().enumerate() {
            let term = f.terminator(bi);
            match f.insts[term].kind.clone() {
                InstKind::CondBr {
                    cond,
                    if_true,
                    if_false,
                } => {
                    let p0 = self.get_phi_code(f, bi, if_true)?;
                    let p1 = self.get_phi_code(f, bi, if_false)?;
                    let c = self.get_value_as_str(f, cond, CastMode::SIGNED)?;
                    relooper.add_branch(bi, if_true, Some(c), none_if_empty(p0));
                    relooper.add_branch(bi, if_false, None, none_if_empty(p1));
                }
                InstKind::Br { dest } => {
                    let p = self.get_phi_code(f, bi, dest)?;
                    relooper.add_branch(bi, dest, None, none_if_empty(p));
                }
                InstKind::IndirectBr { dests, .. } => {
                    // The same destination may appear several times; the
                    // first unique one doubles as the default.
                    let mut seen = HashSet::new();
                    let mut set_default = false;
                    for dest in dests {
                        if !seen.insert(dest) {
                            continue;
                        }
                        let p = self.get_phi_code(f, bi, dest)?;
                        let condition = if set_default {
                            Some(format!("case {}: ", self.block_address(fid, dest)))
                        } else {
                            set_default = true;
                            None
                        };
                        relooper.add_branch(bi, dest, condition, none_if_empty(p));
                    }
                }
                InstKind::Switch {
                    cond,
                    default,
                    cases,
                } => {
                    let use_switch = self.consider_condition_var(f, term)?.is_some();
                    let p = self.get_phi_code(f, bi, default)?;
                    relooper.add_branch(bi, default, None, none_if_empty(p));
                    let mut conditions: BTreeMap<usize, String> = BTreeMap::new();
                    for (value, dest) in cases {
                        let curr = if use_switch {
                            format!("case {value}: ")
                        } else {
                            let c = self.get_value_as_cast_paren_str(f, cond, CastMode::SIGNED)?;
                            format!("({c} == {value})")
                        };
                        let prior = conditions.remove(&dest).unwrap_or_default();
                        let merged = if prior.is_empty() {
                            curr
                        } else if use_switch {
                            format!("{curr}{prior}")
                        } else {
                            format!("{curr} | {prior}")
                        };
                        conditions.insert(dest, merged);
                    }
                    for (dest, condition) in conditions {
                        if dest == default {
                            // The default destination gets there anyhow.
                            continue;
                        }
                        let p = self.get_phi_code(f, bi, dest)?;
                        relooper.add_branch(bi, dest, Some(condition), none_if_empty(p));
                    }
                }
                InstKind::Ret(_) | InstKind::Unreachable => {}
                other => {
                    return Err(CompileError::Legalization(format!(
                        "invalid terminator {other:?} in {}",
                        f.name
                    )))
                }
            }
        }

        Ok(relooper.render(0).to_string())
    }

    // ─── Module emission ────────────────────────────────────────────

    pub(crate) fn run(mut self) -> CompileResult<String> {
        if self.m.triple != EXPECTED_TRIPLE {
            log::warn!(
                "incorrect target triple '{}' (expected {EXPECTED_TRIPLE})",
                self.m.triple
            );
        }

        self.process_constants()?;

        let mut funcs = String::new();
        for (fid, f) in self.m.funcs.iter() {
            if !f.is_declaration() {
                self.emit_function(fid, &mut funcs)?;
            }
        }

        self.tables.finalize();
        let funcs = self.tables.patch_masks(&funcs);

        let mut out = String::new();
        out.push_str("\n// EMSCRIPTEN_START_FUNCTIONS\n");
        out.push_str(&funcs);
        out.push_str("function runPostSets() {\n");
        let _ = writeln!(out, " {}", self.post_sets);
        out.push_str("}\n");
        out.push_str("// EMSCRIPTEN_END_FUNCTIONS\n\n");

        out.push_str("/* memory initializer */ allocate([");
        let mut first = true;
        for region in [&self.layout.data64, &self.layout.data32, &self.layout.data8] {
            for &b in region.iter() {
                if !first {
                    out.push(',');
                }
                first = false;
                let _ = write!(out, "{b}");
            }
        }
        out.push_str("], \"i8\", ALLOC_NONE, Runtime.GLOBAL_BASE);");

        out.push_str("\n\n// EMSCRIPTEN_METADATA\n");
        let metadata = self.metadata()?;
        out.push_str(&serde_json::to_string_pretty(&metadata).map_err(|e| {
            CompileError::Invariant(format!("metadata serialization failed: {e}"))
        })?);
        out.push('\n');
        Ok(out)
    }

    fn metadata(&mut self) -> CompileResult<Metadata> {
        let mut tables = BTreeMap::new();
        for (sig, table) in self.tables.iter() {
            let mut line = format!("var FUNCTION_TABLE_{sig} = [");
            for (i, entry) in table.iter().enumerate() {
                if i > 0 {
                    line.push(',');
                }
                line.push_str(entry);
            }
            line.push_str("];");
            tables.insert(sig.clone(), line);
        }

        Ok(Metadata {
            declares: self.declares.iter().cloned().collect(),
            redirects: self
                .redirects
                .iter()
                .map(|(k, v)| (format!("_{k}"), v.clone()))
                .collect(),
            externs: self.externals.iter().cloned().collect(),
            implemented_functions: self
                .m
                .funcs
                .iter()
                .filter(|(_, f)| !f.is_declaration())
                .map(|(_, f)| mangle_global(&f.name))
                .collect(),
            tables,
            initializers: self.global_initializers.clone(),
            exports: self.exports.clone(),
            cant_validate: self.cant_validate.clone(),
            simd: u8::from(self.uses_simd),
            named_globals: self
                .named_globals
                .iter()
                .map(|(k, v)| (format!("_{k}"), v.to_string()))
                .collect(),
        })
    }
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// The metadata record consumed by the downstream linker. Field order fixes
/// JSON key order.
#[derive(Serialize)]
struct Metadata {
    declares: Vec<String>,
    redirects: BTreeMap<String, String>,
    externs: Vec<String>,
    #[serde(rename = "implementedFunctions")]
    implemented_functions: Vec<String>,
    tables: BTreeMap<String, String>,
    initializers: Vec<String>,
    exports: Vec<String>,
    #[serde(rename = "cantValidate")]
    cant_validate: String,
    simd: u8,
    #[serde(rename = "namedGlobals")]
    named_globals: BTreeMap<String, String>,
}
