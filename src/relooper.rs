//! Structured control flow reconstruction ("relooping").
//!
//! Input: abstract basic blocks with pre-emitted body strings and labeled
//! outgoing edges (condition expression + optional phi prelude per edge).
//! Output: a structured program of nested `while(1)` loops, `if`/`switch`
//! dispatch and labeled `break`/`continue`, written into a reusable output
//! buffer.
//!
//! The module knows nothing about the IR; the emitter lowers terminators
//! into edges and hands over strings. That keeps the CFG-shaping pass
//! independently testable against hand-built graphs.
//!
//! Shapes are derived recursively from the live block set:
//!
//! - a single entry that nothing in the set branches to becomes a *Simple*
//!   shape (the block, then its branching);
//! - multiple entries with disjoint reachable regions become a *Multiple*
//!   shape dispatching on the `label` variable;
//! - anything cyclic becomes a *Loop* shape, with branches back to the
//!   entries turned into `continue` and branches out turned into `break`.
//!
//! Edges to the lexically-following shape fall through; every other edge
//! sets `label` when its destination is dispatch-selected, then breaks or
//! continues to the structure that will reach it. An emulated rendering (a
//! single dispatch loop over all blocks) exists as a fallback for
//! pathological graphs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

pub type BlockId = usize;
type ShapeId = usize;

/// Reserved capacity of the output buffer, per contract with the emitter.
const OUTPUT_RESERVE: usize = 1024 * 1024;

/// An outgoing edge as supplied by the caller.
#[derive(Debug, Clone)]
struct Branch {
    target: BlockId,
    /// `None` marks the default branch. In switch mode this is a
    /// `case N: `-style label list instead of a boolean expression.
    condition: Option<String>,
    /// Phi prelude to run when taking this edge.
    code: Option<String>,
}

/// How a processed edge leaves its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Falls through to the chain's next shape.
    Direct,
    /// Exits the ancestor structure.
    Break(ShapeId),
    /// Re-enters the ancestor loop from the top.
    Continue(ShapeId),
}

#[derive(Debug, Clone)]
struct ProcessedBranch {
    target: BlockId,
    condition: Option<String>,
    code: Option<String>,
    flow: Flow,
}

struct BlockData {
    code: String,
    /// Condition value for switch-style dispatch (switches, indirect
    /// branches). `None` renders an `if`/`else` chain.
    branch_var: Option<String>,
    branches: Vec<Branch>,
    processed: Vec<ProcessedBranch>,
}

enum ShapeKind {
    Simple { block: BlockId },
    Loop { inner: ShapeId },
    /// Entry-keyed alternatives, dispatched on `label`.
    Multiple { handled: Vec<(BlockId, ShapeId)> },
}

struct Shape {
    kind: ShapeKind,
    next: Option<ShapeId>,
    /// Some branch references this shape by label.
    labeled: bool,
}

pub struct Relooper {
    blocks: Vec<BlockData>,
    shapes: Vec<Shape>,
    emulate: bool,
    min_size: bool,
    out: String,
}

impl Default for Relooper {
    fn default() -> Self {
        Self::new()
    }
}

impl Relooper {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            shapes: Vec::new(),
            emulate: false,
            min_size: false,
            out: String::with_capacity(OUTPUT_RESERVE),
        }
    }

    /// Force the emulated dispatch-loop rendering. Normal emission never
    /// needs this; it exists for pathological (irreducible) graphs.
    pub fn set_emulate(&mut self, emulate: bool) {
        self.emulate = emulate;
    }

    /// Size-over-speed hint from the function's attributes. Shape derivation
    /// is unaffected; the hint is recorded for parity with the input.
    pub fn set_min_size(&mut self, min_size: bool) {
        self.min_size = min_size;
    }

    pub fn add_block(&mut self, code: String, branch_var: Option<String>) -> BlockId {
        self.blocks.push(BlockData {
            code,
            branch_var,
            branches: Vec::new(),
            processed: Vec::new(),
        });
        self.blocks.len() - 1
    }

    /// Add an edge. At most one edge per block may carry no condition (the
    /// default); it renders last.
    pub fn add_branch(
        &mut self,
        from: BlockId,
        to: BlockId,
        condition: Option<String>,
        code: Option<String>,
    ) {
        self.blocks[from].branches.push(Branch {
            target: to,
            condition,
            code,
        });
    }

    /// Reconstruct structure from `entry` and render the program.
    pub fn render(&mut self, entry: BlockId) -> &str {
        self.out.clear();

        let live = self.reachable_from(entry);
        for b in 0..self.blocks.len() {
            self.blocks[b].branches.retain(|br| live.contains(&br.target));
        }

        if self.min_size {
            log::debug!("relooping with the min-size hint");
        }
        if self.emulate {
            self.render_emulated(entry, &live);
            return &self.out;
        }

        let mut pool: BTreeSet<BlockId> = live;
        let mut entries = BTreeSet::new();
        entries.insert(entry);
        let head = self.process(&mut pool, entries);
        debug_assert!(pool.is_empty(), "unstructured blocks left behind: {pool:?}");

        self.mark_labeled();
        if let Some(head) = head {
            self.render_shape(head, 1);
        }
        &self.out
    }

    // ─── Shape derivation ───────────────────────────────────────────

    fn reachable_from(&self, entry: BlockId) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![entry];
        while let Some(b) = work.pop() {
            if !seen.insert(b) {
                continue;
            }
            for br in &self.blocks[b].branches {
                work.push(br.target);
            }
        }
        seen
    }

    fn process(
        &mut self,
        pool: &mut BTreeSet<BlockId>,
        mut entries: BTreeSet<BlockId>,
    ) -> Option<ShapeId> {
        let mut head: Option<ShapeId> = None;
        let mut tail: Option<ShapeId> = None;
        let mut fuel = pool.len() * pool.len() + pool.len() + 8;

        while !entries.is_empty() {
            // A stuck derivation indicates a graph this algorithm cannot
            // shrink; the emulated renderer would be the escape hatch.
            fuel -= 1;
            assert!(fuel > 0, "relooper failed to make progress");

            let shape = if entries.len() == 1 {
                let entry = *entries.iter().next().unwrap();
                let targeted = pool.iter().any(|&b| {
                    self.blocks[b].branches.iter().any(|br| br.target == entry)
                });
                if !targeted {
                    self.make_simple(pool, entry, &mut entries)
                } else {
                    self.make_loop(pool, &mut entries)
                }
            } else {
                let groups = self.independent_groups(pool, &entries);
                if !groups.is_empty() {
                    self.make_multiple(pool, &mut entries, groups)
                } else {
                    self.make_loop(pool, &mut entries)
                }
            };

            match tail {
                None => head = Some(shape),
                Some(prev) => self.shapes[prev].next = Some(shape),
            }
            tail = Some(shape);
        }
        head
    }

    fn push_shape(&mut self, kind: ShapeKind) -> ShapeId {
        self.shapes.push(Shape {
            kind,
            next: None,
            labeled: false,
        });
        self.shapes.len() - 1
    }

    fn make_simple(
        &mut self,
        pool: &mut BTreeSet<BlockId>,
        entry: BlockId,
        entries: &mut BTreeSet<BlockId>,
    ) -> ShapeId {
        pool.remove(&entry);
        let mut next_entries = BTreeSet::new();
        let branches = std::mem::take(&mut self.blocks[entry].branches);
        for br in branches {
            debug_assert!(pool.contains(&br.target), "direct branch must stay in pool");
            next_entries.insert(br.target);
            self.blocks[entry].processed.push(ProcessedBranch {
                target: br.target,
                condition: br.condition,
                code: br.code,
                flow: Flow::Direct,
            });
        }
        *entries = next_entries;
        self.push_shape(ShapeKind::Simple { block: entry })
    }

    fn make_loop(
        &mut self,
        pool: &mut BTreeSet<BlockId>,
        entries: &mut BTreeSet<BlockId>,
    ) -> ShapeId {
        // Everything that can still reach an entry belongs inside the loop.
        let mut inner: BTreeSet<BlockId> = entries.clone();
        loop {
            let mut grew = false;
            for &b in pool.iter() {
                if inner.contains(&b) {
                    continue;
                }
                if self.blocks[b].branches.iter().any(|br| inner.contains(&br.target)) {
                    inner.insert(b);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let shape = self.push_shape(ShapeKind::Loop { inner: usize::MAX });

        let mut next_entries = BTreeSet::new();
        for &b in &inner {
            let branches = std::mem::take(&mut self.blocks[b].branches);
            for br in branches {
                if entries.contains(&br.target) {
                    self.blocks[b].processed.push(ProcessedBranch {
                        target: br.target,
                        condition: br.condition,
                        code: br.code,
                        flow: Flow::Continue(shape),
                    });
                } else if !inner.contains(&br.target) {
                    next_entries.insert(br.target);
                    self.blocks[b].processed.push(ProcessedBranch {
                        target: br.target,
                        condition: br.condition,
                        code: br.code,
                        flow: Flow::Break(shape),
                    });
                } else {
                    self.blocks[b].branches.push(br);
                }
            }
        }

        for &b in &inner {
            pool.remove(&b);
        }
        let mut inner_pool = inner;
        let inner_shape = self
            .process(&mut inner_pool, entries.clone())
            .expect("loop body cannot be empty");
        match &mut self.shapes[shape].kind {
            ShapeKind::Loop { inner } => *inner = inner_shape,
            _ => unreachable!(),
        }
        *entries = next_entries;
        shape
    }

    /// For each entry, the blocks reachable from it and from no other entry.
    /// Groups are pruned until no non-entry member is targeted from outside
    /// its group, so each group has a single way in.
    fn independent_groups(
        &self,
        pool: &BTreeSet<BlockId>,
        entries: &BTreeSet<BlockId>,
    ) -> BTreeMap<BlockId, BTreeSet<BlockId>> {
        let reach: BTreeMap<BlockId, BTreeSet<BlockId>> = entries
            .iter()
            .map(|&e| (e, self.reachable_within(e, pool)))
            .collect();

        let mut groups: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        for &e in entries {
            let mut group = BTreeSet::new();
            for &b in &reach[&e] {
                let owners = entries.iter().filter(|&&o| reach[&o].contains(&b)).count();
                if owners == 1 {
                    group.insert(b);
                }
            }
            if group.contains(&e) {
                groups.insert(e, group);
            }
        }

        // Prune members with predecessors outside the group, then drop
        // anything the entry can no longer reach inside the group.
        loop {
            let mut changed = false;
            let keys: Vec<BlockId> = groups.keys().copied().collect();
            for e in keys {
                let group = &groups[&e];
                let invalid: Vec<BlockId> = group
                    .iter()
                    .copied()
                    .filter(|&b| {
                        b != e
                            && pool.iter().any(|&p| {
                                !group.contains(&p)
                                    && self.blocks[p].branches.iter().any(|br| br.target == b)
                            })
                    })
                    .collect();
                if !invalid.is_empty() {
                    changed = true;
                    let group = groups.get_mut(&e).unwrap();
                    for b in invalid {
                        group.remove(&b);
                    }
                    let restricted = self.reachable_restricted(e, group);
                    *group = restricted;
                    if !groups[&e].contains(&e) {
                        groups.remove(&e);
                    }
                }
            }
            if !changed {
                break;
            }
        }
        groups
    }

    fn reachable_within(&self, from: BlockId, pool: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![from];
        while let Some(b) = work.pop() {
            if !pool.contains(&b) || !seen.insert(b) {
                continue;
            }
            for br in &self.blocks[b].branches {
                work.push(br.target);
            }
        }
        seen
    }

    fn reachable_restricted(&self, from: BlockId, within: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![from];
        while let Some(b) = work.pop() {
            if !within.contains(&b) || !seen.insert(b) {
                continue;
            }
            for br in &self.blocks[b].branches {
                work.push(br.target);
            }
        }
        seen
    }

    fn make_multiple(
        &mut self,
        pool: &mut BTreeSet<BlockId>,
        entries: &mut BTreeSet<BlockId>,
        groups: BTreeMap<BlockId, BTreeSet<BlockId>>,
    ) -> ShapeId {
        let shape = self.push_shape(ShapeKind::Multiple {
            handled: Vec::new(),
        });

        let mut next_entries: BTreeSet<BlockId> = entries
            .iter()
            .copied()
            .filter(|e| !groups.contains_key(e))
            .collect();

        let mut handled = Vec::new();
        for (&e, group) in &groups {
            // Branches leaving the group exit the whole Multiple.
            for &b in group {
                let branches = std::mem::take(&mut self.blocks[b].branches);
                for br in branches {
                    if group.contains(&br.target) {
                        self.blocks[b].branches.push(br);
                    } else {
                        next_entries.insert(br.target);
                        self.blocks[b].processed.push(ProcessedBranch {
                            target: br.target,
                            condition: br.condition,
                            code: br.code,
                            flow: Flow::Break(shape),
                        });
                    }
                }
            }
            for &b in group {
                pool.remove(&b);
            }
            let mut group_pool = group.clone();
            let mut group_entries = BTreeSet::new();
            group_entries.insert(e);
            let sub = self
                .process(&mut group_pool, group_entries)
                .expect("independent group cannot be empty");
            handled.push((e, sub));
        }

        match &mut self.shapes[shape].kind {
            ShapeKind::Multiple { handled: h } => *h = handled,
            _ => unreachable!(),
        }
        *entries = next_entries;
        shape
    }

    // ─── Rendering ──────────────────────────────────────────────────

    fn mark_labeled(&mut self) {
        let mut referenced = Vec::new();
        for block in &self.blocks {
            for br in &block.processed {
                match br.flow {
                    Flow::Break(s) | Flow::Continue(s) => referenced.push(s),
                    Flow::Direct => {}
                }
            }
        }
        for s in referenced {
            self.shapes[s].labeled = true;
        }
    }

    /// Does entering this shape dispatch on `label`?
    fn entry_needs_label(&self, shape: Option<ShapeId>) -> bool {
        match shape {
            None => false,
            Some(s) => match &self.shapes[s].kind {
                ShapeKind::Simple { .. } => false,
                ShapeKind::Loop { inner } => self.entry_needs_label(Some(*inner)),
                ShapeKind::Multiple { .. } => true,
            },
        }
    }

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push(' ');
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn emit_code(&mut self, depth: usize, code: &str) {
        // Body strings carry their own newlines; indent each line.
        for l in code.lines() {
            if l.is_empty() {
                continue;
            }
            self.line(depth, l);
        }
    }

    fn render_shape(&mut self, shape: ShapeId, depth: usize) {
        match &self.shapes[shape].kind {
            ShapeKind::Simple { block } => {
                let block = *block;
                let code = std::mem::take(&mut self.blocks[block].code);
                self.emit_code(depth, &code);
                let next = self.shapes[shape].next;
                self.render_branching(block, next, depth);
                if let Some(next) = next {
                    self.render_shape(next, depth);
                }
            }
            ShapeKind::Loop { inner } => {
                let inner = *inner;
                let header = if self.shapes[shape].labeled {
                    format!("L{shape}: while(1) {{")
                } else {
                    "while(1) {".to_string()
                };
                self.line(depth, &header);
                self.render_shape(inner, depth + 1);
                self.line(depth, "}");
                if let Some(next) = self.shapes[shape].next {
                    self.render_shape(next, depth);
                }
            }
            ShapeKind::Multiple { handled } => {
                let handled: Vec<(BlockId, ShapeId)> = handled.clone();
                let labeled = self.shapes[shape].labeled;
                let mut inner_depth = depth;
                if labeled {
                    self.line(depth, &format!("L{shape}: do {{"));
                    inner_depth += 1;
                }
                for (i, (entry, sub)) in handled.iter().enumerate() {
                    let check = format!("((label|0) == {entry})");
                    let header = if i == 0 {
                        format!("if ({check}) {{")
                    } else {
                        format!("}} else if ({check}) {{")
                    };
                    self.line(inner_depth, &header);
                    self.render_shape(*sub, inner_depth + 1);
                }
                self.line(inner_depth, "}");
                if labeled {
                    self.line(depth, "} while(0);");
                }
                if let Some(next) = self.shapes[shape].next {
                    self.render_shape(next, depth);
                }
            }
        }
    }

    /// The statements performed when a branch is taken: phi prelude, label
    /// assignment when the destination is dispatch-selected, then the
    /// break/continue that gets us there.
    fn branch_body(&self, br: &ProcessedBranch, next: Option<ShapeId>) -> String {
        let mut body = String::new();
        if let Some(code) = &br.code {
            body.push_str(code);
        }
        let dispatch = match br.flow {
            Flow::Direct => next,
            Flow::Break(s) => self.shapes[s].next,
            Flow::Continue(s) => match &self.shapes[s].kind {
                ShapeKind::Loop { inner } => Some(*inner),
                _ => unreachable!("continue targets a loop"),
            },
        };
        if self.entry_needs_label(dispatch) {
            let _ = write!(body, "label = {};", br.target);
        }
        match br.flow {
            Flow::Direct => {}
            Flow::Break(s) => {
                let _ = write!(body, "break L{s};");
            }
            Flow::Continue(s) => {
                let _ = write!(body, "continue L{s};");
            }
        }
        body
    }

    fn render_branching(&mut self, block: BlockId, next: Option<ShapeId>, depth: usize) {
        let branches = std::mem::take(&mut self.blocks[block].processed);
        if branches.is_empty() {
            return;
        }
        let (conditional, default): (Vec<_>, Vec<_>) =
            branches.into_iter().partition(|b| b.condition.is_some());
        debug_assert!(default.len() <= 1, "more than one default branch");

        if let Some(var) = self.blocks[block].branch_var.clone() {
            // Switch-style dispatch; conditions are `case N: ` label lists.
            self.line(depth, &format!("switch ({var}) {{"));
            for br in &conditional {
                let body = self.branch_body(br, next);
                self.line(depth, &format!("{}{{", br.condition.as_deref().unwrap()));
                self.emit_code(depth + 1, &body);
                self.line(depth + 1, "break;");
                self.line(depth, "}");
            }
            if let Some(br) = default.first() {
                let body = self.branch_body(br, next);
                self.line(depth, "default: {");
                self.emit_code(depth + 1, &body);
                self.line(depth, "}");
            }
            self.line(depth, "}");
            return;
        }

        if conditional.is_empty() {
            if let Some(br) = default.first() {
                let body = self.branch_body(br, next);
                self.emit_code(depth, &body);
            }
            return;
        }

        for (i, br) in conditional.iter().enumerate() {
            let body = self.branch_body(br, next);
            let cond = br.condition.as_deref().unwrap();
            let header = if i == 0 {
                format!("if ({cond}) {{")
            } else {
                format!("}} else if ({cond}) {{")
            };
            self.line(depth, &header);
            self.emit_code(depth + 1, &body);
        }
        let default_body = default
            .first()
            .map(|br| self.branch_body(br, next))
            .unwrap_or_default();
        if default_body.is_empty() {
            self.line(depth, "}");
        } else {
            self.line(depth, "} else {");
            self.emit_code(depth + 1, &default_body);
            self.line(depth, "}");
        }
    }

    fn render_emulated(&mut self, entry: BlockId, live: &BTreeSet<BlockId>) {
        self.line(1, &format!("label = {entry};"));
        self.line(1, "L0: while(1) {");
        self.line(2, "switch ((label|0)) {");
        let live: Vec<BlockId> = live.iter().copied().collect();
        for b in live {
            self.line(2, &format!("case {b}: {{"));
            let code = std::mem::take(&mut self.blocks[b].code);
            self.emit_code(3, &code);
            let branches = std::mem::take(&mut self.blocks[b].branches);
            let (conditional, default): (Vec<_>, Vec<_>) =
                branches.into_iter().partition(|br| br.condition.is_some());
            for (i, br) in conditional.iter().enumerate() {
                let cond = br.condition.as_deref().unwrap();
                let header = if i == 0 {
                    format!("if ({cond}) {{")
                } else {
                    format!("}} else if ({cond}) {{")
                };
                self.line(3, &header);
                if let Some(code) = &br.code {
                    self.emit_code(4, code);
                }
                self.line(4, &format!("label = {}; continue L0;", br.target));
            }
            if !conditional.is_empty() {
                self.line(3, "}");
            }
            if let Some(br) = default.first() {
                if let Some(code) = &br.code {
                    self.emit_code(3, code);
                }
                self.line(3, &format!("label = {}; continue L0;", br.target));
            }
            self.line(3, "break;");
            self.line(2, "}");
        }
        self.line(2, "}");
        self.line(1, "}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_occurrences(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn straight_line_has_no_structure() {
        let mut r = Relooper::new();
        let b0 = r.add_block("A();\n".into(), None);
        let b1 = r.add_block("B();\n".into(), None);
        r.add_branch(b0, b1, None, None);
        let out = r.render(b0).to_string();
        assert!(out.contains("A();"));
        assert!(out.contains("B();"));
        assert!(!out.contains("while"));
        assert!(!out.contains("label"));
        assert!(out.find("A();").unwrap() < out.find("B();").unwrap());
    }

    #[test]
    fn diamond_renders_if_else_and_merges() {
        let mut r = Relooper::new();
        let b0 = r.add_block("entry();\n".into(), None);
        let b1 = r.add_block("left();\n".into(), None);
        let b2 = r.add_block("right();\n".into(), None);
        let b3 = r.add_block("merge();\n".into(), None);
        r.add_branch(b0, b1, Some("$c".into()), None);
        r.add_branch(b0, b2, None, None);
        r.add_branch(b1, b3, None, None);
        r.add_branch(b2, b3, None, None);
        let out = r.render(b0).to_string();
        assert!(out.contains("if ($c)"));
        // Every block appears exactly once.
        for body in ["entry();", "left();", "right();", "merge();"] {
            assert_eq!(count_occurrences(&out, body), 1, "in:\n{out}");
        }
        // The merge block renders after both arms.
        assert!(out.rfind("merge();").unwrap() > out.find("left();").unwrap());
        assert!(out.rfind("merge();").unwrap() > out.find("right();").unwrap());
    }

    #[test]
    fn self_loop_renders_while_and_continue() {
        let mut r = Relooper::new();
        let b0 = r.add_block("top();\n".into(), None);
        let b1 = r.add_block("after();\n".into(), None);
        r.add_branch(b0, b0, Some("$again".into()), None);
        r.add_branch(b0, b1, None, None);
        let out = r.render(b0).to_string();
        assert!(out.contains("while(1)"), "in:\n{out}");
        assert!(out.contains("continue L"), "in:\n{out}");
        assert!(out.contains("break L"), "in:\n{out}");
        assert!(out.contains("after();"));
        assert_eq!(count_occurrences(&out, "top();"), 1);
    }

    #[test]
    fn loop_with_body_block() {
        // 0 -> 1; 1 -> 1? no: 1 -> 2 cond, 1 -> 3; 2 -> 1 (back edge); 3 exit.
        let mut r = Relooper::new();
        let b0 = r.add_block("init();\n".into(), None);
        let b1 = r.add_block("head();\n".into(), None);
        let b2 = r.add_block("body();\n".into(), None);
        let b3 = r.add_block("exit();\n".into(), None);
        r.add_branch(b0, b1, None, None);
        r.add_branch(b1, b2, Some("$go".into()), None);
        r.add_branch(b1, b3, None, None);
        r.add_branch(b2, b1, None, None);
        let out = r.render(b0).to_string();
        assert!(out.contains("while(1)"));
        for body in ["init();", "head();", "body();", "exit();"] {
            assert_eq!(count_occurrences(&out, body), 1, "in:\n{out}");
        }
        // The loop surrounds head and body but not init or exit.
        let while_pos = out.find("while(1)").unwrap();
        assert!(out.find("init();").unwrap() < while_pos);
        assert!(out.find("head();").unwrap() > while_pos);
    }

    #[test]
    fn switch_mode_uses_case_labels() {
        let mut r = Relooper::new();
        let b0 = r.add_block("pick();\n".into(), Some("$x|0".into()));
        let b1 = r.add_block("one();\n".into(), None);
        let b2 = r.add_block("two();\n".into(), None);
        let b3 = r.add_block("done();\n".into(), None);
        r.add_branch(b0, b3, None, None);
        r.add_branch(b0, b1, Some("case 0: ".into()), None);
        r.add_branch(b0, b2, Some("case 1: ".into()), None);
        r.add_branch(b1, b3, None, None);
        r.add_branch(b2, b3, None, None);
        let out = r.render(b0).to_string();
        assert!(out.contains("switch ($x|0) {"), "in:\n{out}");
        assert!(out.contains("case 0: "), "in:\n{out}");
        assert!(out.contains("default: {"), "in:\n{out}");
        for body in ["one();", "two();", "done();"] {
            assert_eq!(count_occurrences(&out, body), 1, "in:\n{out}");
        }
    }

    #[test]
    fn phi_prelude_rides_the_edge() {
        let mut r = Relooper::new();
        let b0 = r.add_block("entry();\n".into(), None);
        let b1 = r.add_block("use();\n".into(), None);
        r.add_branch(b0, b1, None, Some("$p = 1;".into()));
        let out = r.render(b0).to_string();
        let phi = out.find("$p = 1;").expect("phi prelude present");
        assert!(phi > out.find("entry();").unwrap());
        assert!(phi < out.find("use();").unwrap());
    }

    #[test]
    fn irreducible_graph_still_covers_every_block() {
        // Two blocks jumping into each other's loop from the entry.
        let mut r = Relooper::new();
        let b0 = r.add_block("entry();\n".into(), None);
        let b1 = r.add_block("alpha();\n".into(), None);
        let b2 = r.add_block("beta();\n".into(), None);
        let b3 = r.add_block("out();\n".into(), None);
        r.add_branch(b0, b1, Some("$c".into()), None);
        r.add_branch(b0, b2, None, None);
        r.add_branch(b1, b2, Some("$d".into()), None);
        r.add_branch(b1, b3, None, None);
        r.add_branch(b2, b1, Some("$e".into()), None);
        r.add_branch(b2, b3, None, None);
        let out = r.render(b0).to_string();
        for body in ["entry();", "alpha();", "beta();", "out();"] {
            assert_eq!(count_occurrences(&out, body), 1, "in:\n{out}");
        }
        assert!(out.contains("while(1)"));
        assert!(out.contains("label = "));
    }

    #[test]
    fn emulated_rendering_dispatches_on_label() {
        let mut r = Relooper::new();
        let b0 = r.add_block("a();\n".into(), None);
        let b1 = r.add_block("b();\n".into(), None);
        r.add_branch(b0, b1, None, None);
        r.set_emulate(true);
        let out = r.render(b0).to_string();
        assert!(out.contains("switch ((label|0))"));
        assert!(out.contains("case 0: {"));
        assert!(out.contains("case 1: {"));
        assert!(out.contains("continue L0;"));
    }

    #[test]
    fn unreachable_blocks_are_dropped() {
        let mut r = Relooper::new();
        let b0 = r.add_block("a();\n".into(), None);
        let _orphan = r.add_block("orphan();\n".into(), None);
        let out = r.render(b0).to_string();
        assert!(out.contains("a();"));
        assert!(!out.contains("orphan();"));
    }
}
