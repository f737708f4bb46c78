//! Iterative dataflow liveness over an instruction list.

use crate::assem::Instr;
use crate::temp::Temp;
use std::collections::HashSet;

/// Per-instruction live-out sets.
pub struct Liveness {
    pub live_out: Vec<HashSet<Temp>>,
}

/// Computes liveness to a fixpoint, walking instructions backwards:
/// `live_in = use ∪ (live_out − def)`, `live_out = ⋃ live_in(successors)`.
pub fn analyze(instrs: &[Instr], successors: &[Vec<usize>]) -> Liveness {
    let n = instrs.len();
    let uses: Vec<Vec<Temp>> = instrs.iter().map(|i| i.sources()).collect();
    let defs: Vec<Vec<Temp>> = instrs.iter().map(|i| i.dests()).collect();

    let mut live_in: Vec<HashSet<Temp>> = vec![HashSet::new(); n];
    let mut live_out: Vec<HashSet<Temp>> = vec![HashSet::new(); n];

    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..n).rev() {
            let mut new_out = HashSet::new();
            for &s in &successors[i] {
                new_out.extend(live_in[s].iter().copied());
            }

            let mut new_in: HashSet<Temp> = uses[i].iter().copied().collect();
            for t in &new_out {
                if !defs[i].contains(t) {
                    new_in.insert(*t);
                }
            }

            if new_in != live_in[i] || new_out != live_out[i] {
                changed = true;
                live_in[i] = new_in;
                live_out[i] = new_out;
            }
        }
    }

    Liveness { live_out }
}
