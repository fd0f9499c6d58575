//! Stack frame planning: alloca coalescing and nativization.
//!
//! Coalescing packs every static alloca into a single frame claimed once in
//! the function prologue, so the body addresses them as `sp + offset`.
//! Nativization finds static allocas whose address never escapes (only
//! loaded from and stored to) and turns them into plain local variables; it
//! only runs at the lowest optimization level, where no earlier pass had
//! the chance.

use std::collections::{BTreeMap, BTreeSet};

use crate::heap::{stack_align, STACK_ALIGN};
use crate::ir::{round_up, Function, InstId, InstKind, Module, Value};

/// Frame layout for one function's static allocas.
#[derive(Debug, Default)]
pub struct FramePlan {
    offsets: BTreeMap<InstId, u32>,
    frame_size: u32,
    max_alignment: u32,
}

impl FramePlan {
    /// Pack the static allocas of `f` into one frame. Offsets honor each
    /// alloca's required alignment; the frame size is stack-aligned.
    pub fn analyze(m: &Module, f: &Function, nativized: &NativizedVars) -> FramePlan {
        let mut plan = FramePlan {
            offsets: BTreeMap::new(),
            frame_size: 0,
            max_alignment: STACK_ALIGN,
        };
        let mut offset = 0u32;
        for id in static_allocas(m, f) {
            if nativized.contains(id) {
                continue;
            }
            let (allocated, count, align) = match &f.insts[id].kind {
                InstKind::Alloca {
                    allocated,
                    count,
                    align,
                } => (*allocated, *count, *align),
                _ => unreachable!(),
            };
            let count = m.const_int_value(count).unwrap_or(1).max(0) as u32;
            let size = m.tys.alloc_size(allocated) * count;
            let align = align.max(m.tys.abi_align(allocated)).max(1);
            offset = round_up(offset, align);
            plan.offsets.insert(id, offset);
            offset += size;
            plan.max_alignment = plan.max_alignment.max(align);
        }
        plan.frame_size = stack_align(offset);
        plan
    }

    pub fn frame_offset(&self, id: InstId) -> Option<u32> {
        self.offsets.get(&id).copied()
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn max_alignment(&self) -> u32 {
        self.max_alignment
    }
}

/// Static allocas of a function: constant-size allocas in the entry block.
fn static_allocas(m: &Module, f: &Function) -> Vec<InstId> {
    let Some(entry) = f.blocks.first() else {
        return Vec::new();
    };
    entry
        .insts
        .iter()
        .copied()
        .filter(|&id| match &f.insts[id].kind {
            InstKind::Alloca { count, .. } => m.const_int_value(*count).is_some(),
            _ => false,
        })
        .collect()
}

/// The set of allocas promoted to plain local variables.
#[derive(Debug, Default)]
pub struct NativizedVars {
    set: BTreeSet<InstId>,
}

impl NativizedVars {
    pub fn none() -> Self {
        Self::default()
    }

    /// Scan `f` for promotable allocas: scalar (no vectors, no aggregates),
    /// and used only as a load source or a store destination. A store *of*
    /// the address escapes it; anything else disqualifies outright.
    pub fn analyze(m: &Module, f: &Function) -> Self {
        let mut set = BTreeSet::new();
        for (id, inst) in f.insts.iter() {
            let InstKind::Alloca { allocated, .. } = &inst.kind else {
                continue;
            };
            if m.tys.is_vector(*allocated) || m.tys.is_aggregate(*allocated) {
                continue;
            }
            let mut escapes = false;
            for (_, user) in f.insts.iter() {
                match &user.kind {
                    InstKind::Load { ptr, .. } if *ptr == Value::Inst(id) => {}
                    InstKind::Store { val, ptr, .. } => {
                        if *val == Value::Inst(id) {
                            escapes = true;
                        } else if *ptr != Value::Inst(id) {
                            continue;
                        }
                    }
                    other => {
                        let mut referenced = false;
                        other.for_each_operand(|v| {
                            if v == Value::Inst(id) {
                                referenced = true;
                            }
                        });
                        if referenced {
                            escapes = true;
                        }
                    }
                }
                if escapes {
                    break;
                }
            }
            if !escapes {
                set.insert(id);
            }
        }
        Self { set }
    }

    pub fn contains(&self, id: InstId) -> bool {
        self.set.contains(&id)
    }

    pub fn contains_value(&self, v: Value) -> bool {
        matches!(v, Value::Inst(i) if self.contains(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, InstKind, ModuleBuilder, Value};

    #[test]
    fn frame_offsets_are_aligned_and_fit() {
        let mut mb = ModuleBuilder::new();
        let i8t = mb.tys().i8();
        let i32t = mb.tys().i32();
        let dbl = mb.tys().double();
        let p8 = mb.tys().ptr(i8t);
        let p32 = mb.tys().ptr(i32t);
        let pd = mb.tys().ptr(dbl);
        let void = mb.tys().void();
        let mut fb = mb.define_function("f", void, &[]);
        let one = fb.const_i32(1);
        let a = fb.push(
            p8,
            InstKind::Alloca {
                allocated: i8t,
                count: one,
                align: 1,
            },
            Some("a"),
        );
        let b = fb.push(
            pd,
            InstKind::Alloca {
                allocated: dbl,
                count: one,
                align: 8,
            },
            Some("b"),
        );
        let c = fb.push(
            p32,
            InstKind::Alloca {
                allocated: i32t,
                count: one,
                align: 4,
            },
            Some("c"),
        );
        fb.ret(None);
        let m = mb.finish();
        let (_, f) = m.funcs.iter().next().unwrap();
        let plan = FramePlan::analyze(&m, f, &NativizedVars::none());
        let ids: Vec<_> = [a, b, c]
            .iter()
            .map(|v| match v {
                Value::Inst(i) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(plan.frame_offset(ids[0]), Some(0));
        assert_eq!(plan.frame_offset(ids[1]), Some(8));
        assert_eq!(plan.frame_offset(ids[2]), Some(16));
        assert_eq!(plan.frame_size(), 32); // 20 rounded up to the stack alignment
        for (id, size) in [(ids[0], 1u32), (ids[1], 8), (ids[2], 4)] {
            let off = plan.frame_offset(id).unwrap();
            assert!(off + size <= plan.frame_size());
        }
    }

    #[test]
    fn nativization_wants_unescaped_scalars() {
        let mut mb = ModuleBuilder::new();
        let i32t = mb.tys().i32();
        let p32 = mb.tys().ptr(i32t);
        let void = mb.tys().void();
        let mut fb = mb.define_function("f", void, &[]);
        let one = fb.const_i32(1);
        let promotable = fb.push(
            p32,
            InstKind::Alloca {
                allocated: i32t,
                count: one,
                align: 4,
            },
            Some("ok"),
        );
        let escaped = fb.push(
            p32,
            InstKind::Alloca {
                allocated: i32t,
                count: one,
                align: 4,
            },
            Some("no"),
        );
        let init = fb.const_i32(7);
        fb.push(
            void,
            InstKind::Store {
                val: init,
                ptr: promotable,
                align: 4,
            },
            None,
        );
        let loaded = fb.push(
            i32t,
            InstKind::Load {
                ptr: promotable,
                align: 4,
            },
            Some("v"),
        );
        // Escape: the address itself participates in arithmetic.
        fb.push(
            i32t,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: escaped,
                rhs: loaded,
            },
            Some("esc"),
        );
        fb.ret(None);
        let m = mb.finish();
        let (_, f) = m.funcs.iter().next().unwrap();
        let nat = NativizedVars::analyze(&m, f);
        let (p, e) = match (promotable, escaped) {
            (Value::Inst(a), Value::Inst(b)) => (a, b),
            _ => unreachable!(),
        };
        assert!(nat.contains(p));
        assert!(!nat.contains(e));
    }
}
