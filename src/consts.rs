//! Two-phase constant lowering into the memory image.
//!
//! Phase one ("calculate") walks every initialized global, reserves its
//! address and serializes self-contained bytes: strings, numbers, zeros.
//! Phase two ("emit") fills in the fields that reference other globals,
//! which is only possible once every address is known. A reference to an
//! external global cannot be resolved at all at compile time; it serializes
//! as zero and a PostSet assignment patches it at module init.
//!
//! Byte order is little-endian throughout.

use std::fmt::Write;

use crate::error::{CompileError, CompileResult};
use crate::emit::Codegen;
use crate::ir::{Const, ConstExpr, ConstId, Ty};
use crate::mangle::mangle_global;

impl<'m> Codegen<'m> {
    /// Run both constant phases over the module's globals.
    pub(crate) fn process_constants(&mut self) -> CompileResult<()> {
        for (_, g) in self.m.globals.iter() {
            if let Some(init) = g.init {
                self.parse_constant(&g.name.clone(), init, true)?;
            }
        }
        for (_, g) in self.m.globals.iter() {
            if let Some(init) = g.init {
                self.parse_constant(&g.name.clone(), init, false)?;
            }
        }
        Ok(())
    }

    /// Strip aliases-of-aliases down to the referenced definition: constant
    /// casts contribute nothing to an address.
    fn resolve_fully(&self, mut c: ConstId) -> ConstId {
        loop {
            match &self.m.consts[c] {
                Const::Expr(ConstExpr::Bitcast { val, .. })
                | Const::Expr(ConstExpr::PtrToInt { val, .. })
                | Const::Expr(ConstExpr::IntToPtr { val, .. }) => c = *val,
                _ => return c,
            }
        }
    }

    /// The numeric value a constant contributes when written into a global:
    /// a dispatch index for functions, a block index for block addresses,
    /// an absolute address for defined globals. Undefined external globals
    /// produce zero plus a PostSet that patches `absolute_target` at init.
    pub(crate) fn get_const_as_offset(
        &mut self,
        c: ConstId,
        absolute_target: u32,
    ) -> CompileResult<u32> {
        let c = self.resolve_fully(c);
        match self.m.consts[c].clone() {
            Const::Function(func) => self.get_function_index(func),
            Const::BlockAddress { func, block } => Ok(self.block_address(func, block)),
            Const::Global(g) => {
                let global = &self.m.globals[g];
                if global.is_declaration() {
                    // All postsets are of external values, hence pointers,
                    // hence 32-bit.
                    let name = mangle_global(&global.name);
                    self.externals.insert(name.clone());
                    let _ = write!(
                        self.post_sets,
                        "HEAP32[{}] = {name};",
                        absolute_target >> 2
                    );
                    return Ok(0);
                }
                self.layout.absolute_address(&global.name)
            }
            other => Err(CompileError::Invariant(format!(
                "constant {other:?} has no address"
            ))),
        }
    }

    fn parse_constant(&mut self, name: &str, c: ConstId, calculate: bool) -> CompileResult<()> {
        match self.m.consts[c].clone() {
            // A global aliasing another global value contributes no bytes.
            Const::Global(_) | Const::Function(_) => Ok(()),
            Const::Str { bytes, .. } => {
                if calculate {
                    self.layout.allocate(name, 64).extend_from_slice(&bytes);
                }
                Ok(())
            }
            Const::Float { ty, value } => {
                if calculate {
                    let region = self.layout.allocate(name, 64);
                    if matches!(self.m.tys.get(ty), Ty::Float) {
                        region.extend_from_slice(&(value as f32).to_le_bytes());
                    } else {
                        region.extend_from_slice(&value.to_le_bytes());
                    }
                }
                Ok(())
            }
            Const::Int { ty, value } => {
                if calculate {
                    let bits = self.m.tys.int_bits(ty);
                    let mask = if bits >= 64 {
                        u64::MAX
                    } else {
                        (1u64 << bits) - 1
                    };
                    // Integers serialize as a full 64-bit slot; the unused
                    // high bytes stay zero.
                    let raw = (value as u64) & mask;
                    self.layout
                        .allocate(name, 64)
                        .extend_from_slice(&raw.to_le_bytes());
                }
                Ok(())
            }
            Const::Null(_) => Err(CompileError::Legalization(format!(
                "unlowered null pointer initializer on {name}"
            ))),
            Const::Undef(_) => Err(CompileError::Legalization(format!(
                "unlowered undef initializer on {name}"
            ))),
            Const::Vector { .. } => Err(CompileError::Legalization(format!(
                "unlowered vector initializer on {name}"
            ))),
            Const::BlockAddress { .. } => Err(CompileError::Legalization(format!(
                "unlowered blockaddress initializer on {name}"
            ))),
            Const::Zero(ty) => {
                if calculate {
                    let bytes = self.m.tys.store_size(ty) as usize;
                    let region = self.layout.allocate(name, 64);
                    region.resize(region.len() + bytes, 0);
                }
                Ok(())
            }
            Const::Array { elems, .. } => self.parse_tagged_array(name, &elems, calculate),
            Const::Struct { ty, fields } => {
                if name == "__init_array_start" {
                    // The global static initializer list.
                    if calculate {
                        for field in fields {
                            let target = self.resolve_fully(field);
                            if let Const::Function(func) = self.m.consts[target] {
                                let fname = mangle_global(&self.m.funcs[func].name);
                                self.global_initializers.push(fname);
                            }
                        }
                    }
                    Ok(())
                } else if calculate {
                    let bytes = self.m.tys.store_size(ty) as usize;
                    let region = self.layout.allocate(name, 64);
                    region.resize(region.len() + bytes, 0);
                    Ok(())
                } else {
                    self.emit_struct_bytes(name, ty, &fields)
                }
            }
            Const::Expr(e) => {
                if name == "__init_array_start" {
                    if calculate {
                        let target = self.resolve_fully(c);
                        if let Const::Function(func) = self.m.consts[target] {
                            let fname = mangle_global(&self.m.funcs[func].name);
                            self.global_initializers.push(fname);
                        }
                    }
                    Ok(())
                } else if name == "__fini_array_start" {
                    Ok(())
                } else if calculate {
                    // A global equal to a ptrtoint of something: one 32-bit
                    // slot, patched in phase two.
                    let region = self.layout.allocate(name, 64);
                    region.resize(region.len() + 4, 0);
                    Ok(())
                } else {
                    self.emit_expr_bytes(name, e)
                }
            }
        }
    }

    /// `llvm.used` keeps extra exports alive; `llvm.global.annotations` is
    /// noise. Any other module-scope constant array should not have survived
    /// the upstream passes.
    fn parse_tagged_array(
        &mut self,
        name: &str,
        elems: &[ConstId],
        calculate: bool,
    ) -> CompileResult<()> {
        match name {
            "llvm.used" => {
                for &elem in elems {
                    let target = self.resolve_fully(elem);
                    match self.m.consts[target].clone() {
                        Const::Function(func) => {
                            if calculate {
                                let fname = mangle_global(&self.m.funcs[func].name);
                                self.exports.push(fname);
                            }
                        }
                        Const::Global(g) => {
                            let global_name = self.m.globals[g].name.clone();
                            if calculate {
                                self.exports.push(mangle_global(&global_name));
                            } else if self.layout.contains(&global_name) {
                                // Addresses exist by now; export the global
                                // by name for the outside world.
                                let addr = self.layout.absolute_address(&global_name)?;
                                self.named_globals.insert(global_name, addr);
                            }
                        }
                        other => {
                            return Err(CompileError::Legalization(format!(
                                "unexpected llvm.used member {other:?}"
                            )))
                        }
                    }
                }
                Ok(())
            }
            "llvm.global.annotations" => Ok(()),
            _ => Err(CompileError::Legalization(format!(
                "unexpected constant array {name}"
            ))),
        }
    }

    /// Phase-two body of a packed struct: strings inline, pointer-sized
    /// numbers from `get_const_as_offset`, zeros skipped.
    fn emit_struct_bytes(
        &mut self,
        name: &str,
        ty: crate::ir::TyId,
        fields: &[ConstId],
    ) -> CompileResult<()> {
        // Per the upstream flattening pass this must be a packed struct.
        match self.m.tys.get(ty) {
            Ty::Struct { packed: true, .. } => {}
            _ => {
                return Err(CompileError::Legalization(format!(
                    "global struct {name} is not packed"
                )))
            }
        }
        let mut offset = self.layout.relative_address(name)? as usize;
        let offset_start = offset;
        let absolute = self.layout.absolute_address(name)?;

        for &field in fields {
            match self.m.consts[field].clone() {
                Const::Zero(zty) => {
                    offset += self.m.tys.store_size(zty) as usize;
                }
                Const::Str { bytes, .. } => {
                    debug_assert!(offset + bytes.len() <= self.layout.data64.len());
                    self.layout.data64[offset..offset + bytes.len()].copy_from_slice(&bytes);
                    offset += bytes.len();
                }
                Const::Int { ty: ity, value } => {
                    let bytes = self.m.tys.store_size(ity) as usize;
                    let raw = (value as u64).to_le_bytes();
                    self.layout.data64[offset..offset + bytes].copy_from_slice(&raw[..bytes]);
                    offset += bytes;
                }
                Const::Expr(e) => {
                    let target = (absolute as usize + offset - offset_start) as u32;
                    let data = match e {
                        ConstExpr::PtrToInt { val, .. } => self.get_const_as_offset(val, target)?,
                        ConstExpr::Add { lhs, rhs, .. } => {
                            let base = match self.m.consts[lhs].clone() {
                                Const::Expr(ConstExpr::PtrToInt { val, .. }) => val,
                                _ => lhs,
                            };
                            let addend = match self.m.consts[rhs] {
                                Const::Int { value, .. } => value as u32,
                                _ => {
                                    return Err(CompileError::Legalization(format!(
                                        "non-constant addend in {name}"
                                    )))
                                }
                            };
                            self.get_const_as_offset(base, target)?.wrapping_add(addend)
                        }
                        other => {
                            return Err(CompileError::Legalization(format!(
                                "unexpected constant expression {other:?} in {name}"
                            )))
                        }
                    };
                    debug_assert!(offset + 4 <= self.layout.data64.len());
                    self.layout.data64[offset..offset + 4].copy_from_slice(&data.to_le_bytes());
                    offset += 4;
                }
                other => {
                    return Err(CompileError::Legalization(format!(
                        "unexpected constant kind {other:?} in packed struct {name}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Phase-two body of a bare constant-expression global: deconstruct the
    /// lowered pointer arithmetic and write one 32-bit slot.
    fn emit_expr_bytes(&mut self, name: &str, e: ConstExpr) -> CompileResult<()> {
        let mut data: u32 = 0;
        let mut expr = e;

        // A lowered getelementptr arrives as add(ptrtoint, K).
        if let ConstExpr::Add { lhs, rhs, .. } = expr {
            match self.m.consts[rhs] {
                Const::Int { value, .. } => data = data.wrapping_add(value as u32),
                _ => {
                    return Err(CompileError::Legalization(format!(
                        "non-constant addend in {name}"
                    )))
                }
            }
            match self.m.consts[lhs].clone() {
                Const::Expr(inner) => expr = inner,
                _ => {
                    return Err(CompileError::Legalization(format!(
                        "unexpected add base in {name}"
                    )))
                }
            }
        }

        let mut base = match expr {
            ConstExpr::PtrToInt { val, .. }
            | ConstExpr::IntToPtr { val, .. }
            | ConstExpr::Bitcast { val, .. } => val,
            ConstExpr::Gep { base, offset, .. } => {
                data = data.wrapping_add(offset as u32);
                base
            }
            ConstExpr::Add { .. } => {
                return Err(CompileError::Legalization(format!(
                    "nested add initializer in {name}"
                )))
            }
        };

        // Fold further constant-offset geps into the base.
        loop {
            match self.m.consts[base].clone() {
                Const::Expr(ConstExpr::Gep {
                    base: inner,
                    offset,
                    ..
                }) => {
                    data = data.wrapping_add(offset as u32);
                    base = inner;
                }
                _ => break,
            }
        }

        let absolute = self.layout.absolute_address(name)?;
        data = data.wrapping_add(self.get_const_as_offset(base, absolute)?);

        let offset = self.layout.relative_address(name)? as usize;
        debug_assert!(offset + 4 <= self.layout.data64.len());
        self.layout.data64[offset..offset + 4].copy_from_slice(&data.to_le_bytes());
        Ok(())
    }
}
