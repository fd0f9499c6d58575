//! Function-pointer indexing: per-signature dispatch tables.
//!
//! Indirect calls in the target dialect are `FUNCTION_TABLE_sig[ptr & mask]`,
//! so every address-taken function needs a slot in the table for its
//! signature letter-code. Tables grow monotonically while the module is
//! walked and are padded to a power of two at emission; until then, call
//! sites reference the mask through a placeholder this module knows how to
//! patch.

use std::collections::BTreeMap;

use crate::error::{CompileError, CompileResult};
use crate::ir::{Ty, TyId, TypeStore, VecKind};

/// The letter-code for one type position of a signature.
pub fn signature_letter(tys: &TypeStore, ty: TyId, precise_f32: bool) -> CompileResult<char> {
    Ok(match tys.get(ty) {
        Ty::Void => 'v',
        Ty::Float if precise_f32 => 'f',
        Ty::Float | Ty::Double => 'd',
        Ty::Vector(VecKind::Int32x4) => 'I',
        Ty::Vector(VecKind::Float32x4) => 'F',
        Ty::Int(bits) if *bits > 32 => {
            return Err(CompileError::Legalization(format!(
                "integer of width {bits} in function signature"
            )))
        }
        _ => 'i',
    })
}

/// The full letter-code of a function type: return first, then parameters.
pub fn signature_code(
    tys: &TypeStore,
    ret: TyId,
    params: &[TyId],
    precise_f32: bool,
) -> CompileResult<String> {
    let mut code = String::with_capacity(params.len() + 1);
    code.push(signature_letter(tys, ret, precise_f32)?);
    for &p in params {
        code.push(signature_letter(tys, p, precise_f32)?);
    }
    Ok(code)
}

/// The mask placeholder a call site embeds for signature `sig`; patched by
/// [`FunctionTables::patch_masks`] once table sizes are final.
pub fn mask_placeholder(sig: &str) -> String {
    format!("#FM_{sig}#")
}

pub struct FunctionTables {
    tables: BTreeMap<String, Vec<String>>,
    indexed: BTreeMap<String, u32>,
    next_function_index: u32,
    reserved: u32,
    no_aliasing: bool,
    finalized: bool,
}

impl FunctionTables {
    pub fn new(reserved: u32, no_aliasing: bool) -> Self {
        Self {
            tables: BTreeMap::new(),
            indexed: BTreeMap::new(),
            next_function_index: 0,
            reserved,
            no_aliasing,
            finalized: false,
        }
    }

    /// The table for a signature, created at its minimum size on first use.
    /// Each reserved runtime slot must be 2-aligned, hence the doubling.
    pub fn ensure_table(&mut self, sig: &str) -> &mut Vec<String> {
        let reserved = self.reserved;
        let table = self.tables.entry(sig.to_string()).or_default();
        let min_size = if reserved > 0 {
            2 * (reserved + 1) as usize
        } else {
            1
        };
        while table.len() < min_size {
            table.push("0".to_string());
        }
        table
    }

    /// Assign (or look up) the dispatch index of a function. Returns the
    /// index and whether this call created the assignment, so the caller can
    /// run indexed-only handler hooks exactly once.
    pub fn function_index(
        &mut self,
        mangled_name: &str,
        sig: &str,
        alignment: u32,
    ) -> (u32, bool) {
        debug_assert!(!self.finalized);
        if let Some(&index) = self.indexed.get(mangled_name) {
            return (index, false);
        }
        let no_aliasing = self.no_aliasing;
        let next = self.next_function_index;
        let table = self.ensure_table(sig);
        if no_aliasing {
            while (table.len() as u32) < next {
                table.push("0".to_string());
            }
        }
        let alignment = alignment.max(1);
        while table.len() as u32 % alignment != 0 {
            table.push("0".to_string());
        }
        let index = table.len() as u32;
        table.push(mangled_name.to_string());
        self.indexed.insert(mangled_name.to_string(), index);
        if no_aliasing {
            self.next_function_index = index + 1;
        }
        (index, true)
    }

    /// Pad every table to a power-of-two length. Must run before masks are
    /// patched or tables emitted.
    pub fn finalize(&mut self) {
        for table in self.tables.values_mut() {
            let mut size = 1usize;
            while size < table.len() {
                size <<= 1;
            }
            while table.len() < size {
                table.push("0".to_string());
            }
        }
        self.finalized = true;
    }

    /// Replace every mask placeholder in `text` with the final mask of its
    /// signature's table.
    pub fn patch_masks(&self, text: &str) -> String {
        debug_assert!(self.finalized);
        let mut out = text.to_string();
        for (sig, table) in &self.tables {
            let mask = table.len().saturating_sub(1);
            out = out.replace(&mask_placeholder(sig), &mask.to_string());
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.tables.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_codes() {
        let mut tys = TypeStore::new();
        let v = tys.void();
        let i = tys.i32();
        let f = tys.float();
        let d = tys.double();
        let p = tys.ptr(i);
        assert_eq!(signature_letter(&tys, v, false).unwrap(), 'v');
        assert_eq!(signature_letter(&tys, i, false).unwrap(), 'i');
        assert_eq!(signature_letter(&tys, p, false).unwrap(), 'i');
        assert_eq!(signature_letter(&tys, d, false).unwrap(), 'd');
        assert_eq!(signature_letter(&tys, f, false).unwrap(), 'd');
        assert_eq!(signature_letter(&tys, f, true).unwrap(), 'f');
        assert_eq!(signature_code(&tys, i, &[i, i], false).unwrap(), "iii");
    }

    #[test]
    fn reserved_slots_precede_assignments() {
        let mut tables = FunctionTables::new(2, false);
        let (index, fresh) = tables.function_index("_f", "ii", 1);
        assert!(fresh);
        assert_eq!(index, 6); // 2*(2+1) zeros first
        let (again, fresh) = tables.function_index("_f", "ii", 1);
        assert!(!fresh);
        assert_eq!(again, index);
    }

    #[test]
    fn finalize_pads_to_power_of_two() {
        let mut tables = FunctionTables::new(0, false);
        for name in ["_a", "_b", "_c"] {
            tables.function_index(name, "v", 1);
        }
        tables.finalize();
        let (_, table) = tables.iter().next().unwrap();
        assert_eq!(table.len(), 4);
        assert!(table.len().is_power_of_two());
    }

    #[test]
    fn no_aliasing_indexes_are_globally_unique() {
        let mut tables = FunctionTables::new(0, true);
        let (a, _) = tables.function_index("_a", "v", 1);
        let (b, _) = tables.function_index("_b", "ii", 1);
        let (c, _) = tables.function_index("_c", "v", 1);
        assert!(b > a, "{b} vs {a}");
        assert!(c > b, "{c} vs {b}");
    }

    #[test]
    fn masks_patch_to_table_len_minus_one() {
        let mut tables = FunctionTables::new(0, false);
        for name in ["_a", "_b", "_c"] {
            tables.function_index(name, "ii", 1);
        }
        tables.finalize();
        let patched = tables.patch_masks("FUNCTION_TABLE_ii[$p&#FM_ii#]($a|0)");
        assert_eq!(patched, "FUNCTION_TABLE_ii[$p&3]($a|0)");
    }
}
