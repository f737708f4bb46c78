//! Register allocation by iterated graph coloring with coalescing.
//!
//! One `ColorPass` builds the interference graph from liveness, runs the
//! simplify/coalesce/freeze/spill worklist loop, and assigns colors off the
//! selection stack. Actual spills rewrite the instruction list with frame
//! loads and stores around every use and def, and the whole pass restarts;
//! the loop ends when a pass colors everything.
//!
//! Nodes are dense indices in first-appearance order and every worklist is
//! an ordered set, so identical input always produces identical output.

use crate::{
    assem::Instr,
    flow,
    frame::{Frame, FrameRef, Register},
    liveness,
    temp::{Temp, Uuids},
};

use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

// stands in for the infinite degree of precolored nodes.
const INFINITY: usize = usize::MAX >> 1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum MoveState {
    Worklist,
    Active,
    Coalesced,
    Constrained,
    Frozen,
}

struct ColorPass {
    temps: Vec<Temp>,
    precolored: Vec<bool>,
    color: Vec<Option<usize>>,
    usable: usize,

    adj_set: HashSet<(usize, usize)>,
    adj_list: Vec<BTreeSet<usize>>,
    degree: Vec<usize>,
    occurrences: Vec<usize>,

    moves: Vec<(usize, usize)>,
    move_state: Vec<MoveState>,
    move_list: Vec<BTreeSet<usize>>,
    worklist_moves: BTreeSet<usize>,
    active_moves: BTreeSet<usize>,

    simplify_wl: BTreeSet<usize>,
    freeze_wl: BTreeSet<usize>,
    spill_wl: BTreeSet<usize>,

    select_stack: Vec<usize>,
    // true while a node sits on the selection stack or has been coalesced
    // away; such nodes are invisible to `adjacent`.
    removed: Vec<bool>,
    coalesced: Vec<bool>,
    alias: Vec<usize>,

    spilled: Vec<usize>,
}

impl ColorPass {
    fn new(
        instrs: &[Instr],
        live_out: &[HashSet<Temp>],
        registers: &'static [Register],
        usable: usize,
        gen: &dyn Uuids,
    ) -> Self {
        // dense node ids in first-appearance order.
        fn node(t: Temp, temps: &mut Vec<Temp>, index: &mut HashMap<Temp, usize>) -> usize {
            *index.entry(t).or_insert_with(|| {
                temps.push(t);
                temps.len() - 1
            })
        }
        let mut temps = Vec::new();
        let mut index: HashMap<Temp, usize> = HashMap::new();
        for ins in instrs {
            for t in ins.sources().into_iter().chain(ins.dests()) {
                node(t, &mut temps, &mut index);
            }
        }

        let n = temps.len();
        let mut this = ColorPass {
            precolored: vec![false; n],
            color: vec![None; n],
            usable,
            adj_set: HashSet::new(),
            adj_list: vec![BTreeSet::new(); n],
            degree: vec![0; n],
            occurrences: vec![0; n],
            moves: Vec::new(),
            move_state: Vec::new(),
            move_list: vec![BTreeSet::new(); n],
            worklist_moves: BTreeSet::new(),
            active_moves: BTreeSet::new(),
            simplify_wl: BTreeSet::new(),
            freeze_wl: BTreeSet::new(),
            spill_wl: BTreeSet::new(),
            select_stack: Vec::new(),
            removed: vec![false; n],
            coalesced: vec![false; n],
            alias: (0..n).collect(),
            spilled: Vec::new(),
            temps,
        };

        for (i, t) in this.temps.iter().enumerate() {
            if let Temp::Named(sym) = t {
                let name = gen
                    .resolve(sym)
                    .expect("impl bug: named temp from foreign interner");
                let position = registers
                    .iter()
                    .position(|r| *r == name)
                    .unwrap_or_else(|| panic!("impl bug: named temp {} is not a register", name));
                this.precolored[i] = true;
                this.color[i] = Some(position);
                this.degree[i] = INFINITY;
            }
        }

        for (i, ins) in instrs.iter().enumerate() {
            for t in ins.sources().into_iter().chain(ins.dests()) {
                this.occurrences[index[&t]] += 1;
            }

            let move_src = if let Instr::Move { dst, src, .. } = ins {
                let d = index[dst];
                let s = index[src];
                let mi = this.moves.len();
                this.moves.push((d, s));
                this.move_state.push(MoveState::Worklist);
                this.move_list[d].insert(mi);
                this.move_list[s].insert(mi);
                this.worklist_moves.insert(mi);
                Some(s)
            } else {
                None
            };

            for d in ins.dests() {
                let d = index[&d];
                for l in &live_out[i] {
                    let l = index[l];
                    if l == d || move_src == Some(l) {
                        continue;
                    }
                    this.add_edge(d, l);
                }
            }
        }

        this.make_worklists();
        this
    }

    fn add_edge(&mut self, u: usize, v: usize) {
        if u == v || self.adj_set.contains(&(u, v)) {
            return;
        }
        self.adj_set.insert((u, v));
        self.adj_set.insert((v, u));
        if !self.precolored[u] {
            self.adj_list[u].insert(v);
            self.degree[u] += 1;
        }
        if !self.precolored[v] {
            self.adj_list[v].insert(u);
            self.degree[v] += 1;
        }
    }

    fn make_worklists(&mut self) {
        for n in 0..self.temps.len() {
            if self.precolored[n] {
                continue;
            }
            if self.degree[n] >= self.usable {
                self.spill_wl.insert(n);
            } else if self.move_related(n) {
                self.freeze_wl.insert(n);
            } else {
                self.simplify_wl.insert(n);
            }
        }
    }

    fn adjacent(&self, n: usize) -> Vec<usize> {
        self.adj_list[n]
            .iter()
            .copied()
            .filter(|&m| !self.removed[m])
            .collect()
    }

    fn node_moves(&self, n: usize) -> Vec<usize> {
        self.move_list[n]
            .iter()
            .copied()
            .filter(|mi| {
                self.worklist_moves.contains(mi) || self.active_moves.contains(mi)
            })
            .collect()
    }

    fn move_related(&self, n: usize) -> bool {
        !self.node_moves(n).is_empty()
    }

    fn get_alias(&self, n: usize) -> usize {
        let mut n = n;
        while self.coalesced[n] {
            n = self.alias[n];
        }
        n
    }

    fn run(&mut self) {
        loop {
            if !self.simplify_wl.is_empty() {
                self.simplify();
            } else if !self.worklist_moves.is_empty() {
                self.coalesce();
            } else if !self.freeze_wl.is_empty() {
                self.freeze();
            } else if !self.spill_wl.is_empty() {
                self.select_spill();
            } else {
                break;
            }
        }
        self.assign_colors();
    }

    fn simplify(&mut self) {
        let n = *self.simplify_wl.iter().next().unwrap();
        self.simplify_wl.remove(&n);
        self.select_stack.push(n);
        self.removed[n] = true;
        for m in self.adjacent(n) {
            self.decrement_degree(m);
        }
    }

    fn decrement_degree(&mut self, m: usize) {
        if self.precolored[m] {
            return;
        }
        let d = self.degree[m];
        self.degree[m] = d - 1;
        if d == self.usable {
            // m just became low-degree; its moves (and its neighbors') are
            // worth another coalescing look.
            let mut nodes = self.adjacent(m);
            nodes.push(m);
            self.enable_moves(&nodes);
            self.spill_wl.remove(&m);
            if self.move_related(m) {
                self.freeze_wl.insert(m);
            } else {
                self.simplify_wl.insert(m);
            }
        }
    }

    fn enable_moves(&mut self, nodes: &[usize]) {
        for &n in nodes {
            for mi in self.node_moves(n) {
                if self.active_moves.remove(&mi) {
                    self.move_state[mi] = MoveState::Worklist;
                    self.worklist_moves.insert(mi);
                }
            }
        }
    }

    fn coalesce(&mut self) {
        let mi = *self.worklist_moves.iter().next().unwrap();
        self.worklist_moves.remove(&mi);
        let (d, s) = self.moves[mi];
        let x = self.get_alias(d);
        let y = self.get_alias(s);
        let (u, v) = if self.precolored[y] { (y, x) } else { (x, y) };

        if u == v {
            self.move_state[mi] = MoveState::Coalesced;
            self.add_work_list(u);
        } else if self.precolored[v] || self.adj_set.contains(&(u, v)) {
            self.move_state[mi] = MoveState::Constrained;
            self.add_work_list(u);
            self.add_work_list(v);
        } else if (self.precolored[u] && self.george(u, v))
            || (!self.precolored[u] && self.briggs(u, v))
        {
            self.move_state[mi] = MoveState::Coalesced;
            self.combine(u, v);
            self.add_work_list(u);
        } else {
            self.move_state[mi] = MoveState::Active;
            self.active_moves.insert(mi);
        }
    }

    // George: coalescing v into precolored u is safe if every neighbor of v
    // is low-degree, precolored, or already clashes with u.
    fn george(&self, u: usize, v: usize) -> bool {
        self.adjacent(v).into_iter().all(|t| {
            self.degree[t] < self.usable
                || self.precolored[t]
                || self.adj_set.contains(&(t, u))
        })
    }

    // Briggs: the combined node is safe if it has fewer than K high-degree
    // neighbors.
    fn briggs(&self, u: usize, v: usize) -> bool {
        let mut neighbors: BTreeSet<usize> = self.adjacent(u).into_iter().collect();
        neighbors.extend(self.adjacent(v));
        let high = neighbors
            .into_iter()
            .filter(|&t| self.degree[t] >= self.usable)
            .count();
        high < self.usable
    }

    fn add_work_list(&mut self, u: usize) {
        if !self.precolored[u] && !self.move_related(u) && self.degree[u] < self.usable {
            self.freeze_wl.remove(&u);
            self.simplify_wl.insert(u);
        }
    }

    fn combine(&mut self, u: usize, v: usize) {
        self.freeze_wl.remove(&v);
        self.spill_wl.remove(&v);
        self.coalesced[v] = true;
        self.removed[v] = true;
        self.alias[v] = u;
        let v_moves = self.move_list[v].clone();
        self.move_list[u].extend(v_moves);
        self.enable_moves(&[v]);
        for t in self.adjacent(v) {
            self.add_edge(t, u);
            self.decrement_degree(t);
        }
        if self.degree[u] >= self.usable && self.freeze_wl.remove(&u) {
            self.spill_wl.insert(u);
        }
    }

    fn freeze(&mut self) {
        let u = *self.freeze_wl.iter().next().unwrap();
        self.freeze_wl.remove(&u);
        self.simplify_wl.insert(u);
        self.freeze_moves(u);
    }

    fn freeze_moves(&mut self, u: usize) {
        for mi in self.node_moves(u) {
            let (d, s) = self.moves[mi];
            let v = if self.get_alias(s) == self.get_alias(u) {
                self.get_alias(d)
            } else {
                self.get_alias(s)
            };
            self.active_moves.remove(&mi);
            self.worklist_moves.remove(&mi);
            self.move_state[mi] = MoveState::Frozen;
            if !self.precolored[v] && !self.move_related(v) && self.degree[v] < self.usable {
                self.freeze_wl.remove(&v);
                self.simplify_wl.insert(v);
            }
        }
    }

    /// Potential spill: the highest degree-per-occurrence node, ties broken
    /// by lowest temp id.
    fn select_spill(&mut self) {
        let mut best: Option<usize> = None;
        for &n in &self.spill_wl {
            let better = match best {
                None => true,
                Some(b) => {
                    // degree[n]/occ[n] > degree[b]/occ[b], integer-exactly.
                    let lhs = self.degree[n] * self.occurrences[b];
                    let rhs = self.degree[b] * self.occurrences[n];
                    lhs > rhs || (lhs == rhs && self.temps[n] < self.temps[b])
                }
            };
            if better {
                best = Some(n);
            }
        }
        let m = best.expect("impl bug: select_spill with empty spill worklist");
        self.spill_wl.remove(&m);
        self.simplify_wl.insert(m);
        self.freeze_moves(m);
    }

    fn assign_colors(&mut self) {
        while let Some(n) = self.select_stack.pop() {
            let mut available = vec![true; self.usable];
            for &w in &self.adj_list[n] {
                let a = self.get_alias(w);
                if let Some(c) = self.color[a] {
                    if c < self.usable {
                        available[c] = false;
                    }
                }
            }
            match available.iter().position(|&free| free) {
                Some(c) => self.color[n] = Some(c),
                None => self.spilled.push(n),
            }
        }
        for v in 0..self.temps.len() {
            if self.coalesced[v] {
                self.color[v] = self.color[self.get_alias(v)];
            }
        }
    }

    /// The final temp-to-register map; total over every temp that appears in
    /// the instruction list.
    fn assignment(&self, registers: &'static [Register]) -> HashMap<Temp, Register> {
        let mut map = HashMap::new();
        for (i, t) in self.temps.iter().enumerate() {
            let c = self.color[i]
                .unwrap_or_else(|| panic!("impl bug: uncolored temp {:?} in final assignment", t));
            map.insert(*t, registers[c]);
        }
        map
    }
}

/// Rewrites every use and def of the spilled temps through fresh temps and
/// frame slots: a load before each use, a store after each def. The fresh
/// temps have tiny live ranges, which is what makes the next pass converge.
fn rewrite_spills(
    instrs: Vec<Instr>,
    spilled: &[Temp],
    frame: &FrameRef,
    gen: &mut dyn Uuids,
) -> Vec<Instr> {
    let mut slots = BTreeMap::new();
    for t in spilled {
        let access = frame.borrow_mut().alloc_local(true, gen);
        slots.insert(*t, access);
    }

    let mut out = Vec::with_capacity(instrs.len());
    for mut ins in instrs {
        let used: Vec<Temp> = dedup_in_order(ins.sources().into_iter().filter(|t| slots.contains_key(t)));
        let defd: Vec<Temp> = dedup_in_order(ins.dests().into_iter().filter(|t| slots.contains_key(t)));
        if used.is_empty() && defd.is_empty() {
            out.push(ins);
            continue;
        }

        let mut fresh: BTreeMap<Temp, Temp> = BTreeMap::new();
        for t in used.iter().chain(defd.iter()) {
            fresh.entry(*t).or_insert_with(|| gen.new_unnamed_temp());
        }

        for t in &used {
            out.push(frame.borrow().spill_load(&slots[t], fresh[t], gen));
        }
        rename_temps(&mut ins, &fresh);
        out.push(ins);
        for t in &defd {
            out.push(frame.borrow().spill_store(&slots[t], fresh[t], gen));
        }
    }
    out
}

fn dedup_in_order(temps: impl Iterator<Item = Temp>) -> Vec<Temp> {
    let mut seen = HashSet::new();
    temps.filter(|t| seen.insert(*t)).collect()
}

fn rename_temps(ins: &mut Instr, map: &BTreeMap<Temp, Temp>) {
    let rename = |t: &mut Temp| {
        if let Some(r) = map.get(t) {
            *t = *r;
        }
    };
    match ins {
        Instr::Oper { dst, src, .. } => {
            dst.0.iter_mut().for_each(rename);
            src.0.iter_mut().for_each(rename);
        }
        Instr::Move { dst, src, .. } => {
            rename(dst);
            rename(src);
        }
        Instr::Label { .. } => {}
    }
}

/// Allocates every temp in `instrs` to a register of `F`, spilling through
/// `frame` as needed. Returns the (possibly rewritten) instructions and a
/// total temp-to-register map.
pub fn allocate<F: Frame + 'static>(
    mut instrs: Vec<Instr>,
    frame: &FrameRef,
    gen: &mut dyn Uuids,
) -> (Vec<Instr>, HashMap<Temp, Register>) {
    let registers = F::registers();
    let usable = F::allocatable_registers().len();
    debug_assert_eq!(&registers[..usable], F::allocatable_registers());

    loop {
        let succ = flow::successors(&instrs);
        let live = liveness::analyze(&instrs, &succ);
        let mut pass = ColorPass::new(&instrs, &live.live_out, registers, usable, gen);
        pass.run();
        if pass.spilled.is_empty() {
            debug!(
                "regalloc: {} instrs, {} temps, no spills",
                instrs.len(),
                pass.temps.len()
            );
            return (instrs, pass.assignment(registers));
        }
        let spilled: Vec<Temp> = pass.spilled.iter().map(|&n| pass.temps[n]).collect();
        debug!("regalloc: spilling {} temps, rewriting", spilled.len());
        instrs = rewrite_spills(instrs, &spilled, frame, gen);
    }
}
