//! Per-instruction control flow.

use crate::assem::Instr;
use crate::temp::Label;
use std::collections::HashMap;

/// Successor indices for every instruction. An instruction with explicit
/// jump targets flows to those labels (a conditional branch lists both of
/// its targets); anything else falls through to the next instruction.
/// Targets outside the instruction list (none, in a well-formed procedure)
/// are dropped.
pub fn successors(instrs: &[Instr]) -> Vec<Vec<usize>> {
    let label_at: HashMap<Label, usize> = instrs
        .iter()
        .enumerate()
        .filter_map(|(i, ins)| ins.label().map(|l| (l, i)))
        .collect();

    instrs
        .iter()
        .enumerate()
        .map(|(i, ins)| {
            let jumps = ins.jumps();
            if jumps.is_empty() {
                if i + 1 < instrs.len() {
                    vec![i + 1]
                } else {
                    vec![]
                }
            } else {
                jumps
                    .iter()
                    .filter_map(|l| label_at.get(l).copied())
                    .collect()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assem::{Dst, Src};
    use crate::temp::{test_helpers, Uuids, UuidsImpl};

    #[test]
    fn branch_flows_to_both_targets() {
        let mut gen: UuidsImpl = Uuids::new();
        let t = gen.new_unnamed_label();
        let f = gen.new_unnamed_label();
        let instrs = vec![
            Instr::Oper {
                assem: "jl .L'J0".into(),
                dst: Dst::empty(),
                src: Src::empty(),
                jump: vec![t, f],
            },
            Instr::Label {
                assem: ".L'L:".into(),
                lab: f,
            },
            Instr::Label {
                assem: ".L'L:".into(),
                lab: t,
            },
        ];
        let succ = successors(&instrs);
        assert_eq!(vec![2, 1], succ[0]);
        assert_eq!(vec![2], succ[1]);
        assert!(succ[2].is_empty());
    }

    #[test]
    fn straight_line_falls_through() {
        let t = test_helpers::new_unnamed_temp(1);
        let instrs = vec![
            Instr::Oper {
                assem: "movq $1, %'D0".into(),
                dst: Dst(vec![t]),
                src: Src::empty(),
                jump: vec![],
            },
            Instr::Oper {
                assem: "movq $2, %'D0".into(),
                dst: Dst(vec![t]),
                src: Src::empty(),
                jump: vec![],
            },
        ];
        assert_eq!(vec![vec![1], vec![]], successors(&instrs));
    }
}
