//! Canonicalization of the tree IR, in three passes.
//!
//! `linearize` rewrites a statement so no `Eseq` remains and every `Call`
//! sits at the top of a `Move` or `Exp`, then flattens the result into a
//! statement list. `basic_blocks` partitions that list into single-entry,
//! single-exit blocks. `trace_schedule` orders the blocks so that every
//! `Cjump` falls through to its false label.

use crate::{
    ir::{helpers::*, IrExp, IrStm},
    temp,
    temp::Uuids,
};

use std::collections::{HashMap, VecDeque};
use std::mem;

// The empty statement. Introduced where a rewrite needs a placeholder,
// dropped again when the tree is flattened.
fn nop() -> IrStm {
    Exp(IrExp::Const(0))
}

fn is_nop(s: &IrStm) -> bool {
    matches!(s, IrStm::Exp(e) if matches!(e.as_ref(), IrExp::Const(0)))
}

// Seq, except that empty statements disappear instead of nesting.
fn join(a: IrStm, b: IrStm) -> IrStm {
    if is_nop(&a) {
        b
    } else if is_nop(&b) {
        a
    } else {
        Seq(a, b)
    }
}

/// Whether `s` can be evaluated before `e` without changing `e`'s value.
/// Deliberately conservative: constants and label addresses commute with
/// anything, an effect-free statement commutes with anything, and nothing
/// else is trusted.
fn commutes(s: &IrStm, e: &IrExp) -> bool {
    match (s, e) {
        (IrStm::Exp(x), _) if matches!(x.as_ref(), IrExp::Const(..)) => true,
        (_, IrExp::Name(..)) => true,
        (_, IrExp::Const(..)) => true,
        (_, _) => false,
    }
}

/// Pulls the statements out of a list of subexpressions, preserving
/// evaluation order. Returns the combined statement and the cleaned
/// subexpressions. Where a later statement does not commute with an earlier
/// subexpression, the subexpression's value is parked in a fresh temp.
fn reorder(mut ev: VecDeque<IrExp>, gen: &mut dyn Uuids) -> (IrStm, VecDeque<IrExp>) {
    if ev.is_empty() {
        return (nop(), VecDeque::with_capacity(0));
    }

    let e0 = ev.pop_front().unwrap();
    let (s0, e0) = do_exp(e0, gen);
    // only `Move(Temp _, Call ..)` and `Exp(Call ..)` may keep a call, and
    // those statement shapes never route the call itself through here; any
    // call surfacing in an operand position moves into its own temp, where
    // the next call cannot clobber its value.
    let (s0, e0) = if matches!(e0, IrExp::Call(..)) {
        let t = gen.new_unnamed_temp();
        (join(s0, Move(IrExp::Temp(t), e0)), IrExp::Temp(t))
    } else {
        (s0, e0)
    };
    if ev.is_empty() {
        let mut out = VecDeque::with_capacity(1);
        out.push_back(e0);
        return (s0, out);
    }
    let (s_rest, mut e_rest) = reorder(ev, gen);
    if commutes(&s_rest, &e0) {
        e_rest.push_front(e0);
        (join(s0, s_rest), e_rest)
    } else {
        let t = gen.new_unnamed_temp();
        e_rest.push_front(IrExp::Temp(t));
        (join(s0, join(Move(IrExp::Temp(t), e0), s_rest)), e_rest)
    }
}

fn reorder_exp<F>(ev: VecDeque<IrExp>, build: F, gen: &mut dyn Uuids) -> (IrStm, IrExp)
where
    F: FnOnce(VecDeque<IrExp>) -> IrExp,
{
    let (s, ev) = reorder(ev, gen);
    (s, build(ev))
}

fn reorder_stm<F>(ev: VecDeque<IrExp>, build: F, gen: &mut dyn Uuids) -> IrStm
where
    F: FnOnce(VecDeque<IrExp>) -> IrStm,
{
    let (s, ev) = reorder(ev, gen);
    join(s, build(ev))
}

fn do_stm(s: IrStm, gen: &mut dyn Uuids) -> IrStm {
    match s {
        IrStm::Seq(a, b) => join(do_stm(*a, gen), do_stm(*b, gen)),
        IrStm::Jump(e, labs) => reorder_stm(
            VecDeque::from(vec![*e]),
            |mut ev| Jump(ev.pop_front().unwrap(), labs),
            gen,
        ),
        IrStm::Cjump(r, a, b, t, f) => reorder_stm(
            VecDeque::from(vec![*a, *b]),
            |mut ev| {
                Cjump(
                    r,
                    ev.pop_front().unwrap(),
                    ev.pop_front().unwrap(),
                    t,
                    f,
                )
            },
            gen,
        ),
        IrStm::Move(dst, src) => match (*dst, *src) {
            (IrExp::Temp(t), IrExp::Call(f, args)) => {
                let mut ev = VecDeque::from(args);
                ev.push_front(*f);
                reorder_stm(
                    ev,
                    |mut ev| {
                        Move(
                            IrExp::Temp(t),
                            Call(ev.pop_front().unwrap(), Vec::from(ev)),
                        )
                    },
                    gen,
                )
            }
            (IrExp::Temp(t), src) => reorder_stm(
                VecDeque::from(vec![src]),
                |mut ev| Move(IrExp::Temp(t), ev.pop_front().unwrap()),
                gen,
            ),
            (IrExp::Mem(addr), src) => reorder_stm(
                VecDeque::from(vec![*addr, src]),
                |mut ev| {
                    Move(
                        Mem(ev.pop_front().unwrap()),
                        ev.pop_front().unwrap(),
                    )
                },
                gen,
            ),
            (IrExp::Eseq(s, dst), src) => do_stm(
                Seq(*s, IrStm::Move(dst, Box::new(src))),
                gen,
            ),
            (dst, src) => reorder_stm(
                VecDeque::with_capacity(0),
                move |_| Move(dst, src),
                gen,
            ),
        },
        IrStm::Exp(e) => match *e {
            IrExp::Call(f, args) => {
                let mut ev = VecDeque::from(args);
                ev.push_front(*f);
                reorder_stm(
                    ev,
                    |mut ev| Exp(Call(ev.pop_front().unwrap(), Vec::from(ev))),
                    gen,
                )
            }
            e => reorder_stm(
                VecDeque::from(vec![e]),
                |mut ev| Exp(ev.pop_front().unwrap()),
                gen,
            ),
        },
        s => reorder_stm(VecDeque::with_capacity(0), move |_| s, gen),
    }
}

fn do_exp(e: IrExp, gen: &mut dyn Uuids) -> (IrStm, IrExp) {
    match e {
        IrExp::Binop(op, a, b) => reorder_exp(
            VecDeque::from(vec![*a, *b]),
            |mut ev| Binop(op, ev.pop_front().unwrap(), ev.pop_front().unwrap()),
            gen,
        ),
        IrExp::Mem(a) => reorder_exp(
            VecDeque::from(vec![*a]),
            |mut ev| Mem(ev.pop_front().unwrap()),
            gen,
        ),
        IrExp::Eseq(s, e) => {
            let s = do_stm(*s, gen);
            let (s2, e) = do_exp(*e, gen);
            (join(s, s2), e)
        }
        IrExp::Call(f, args) => {
            let mut ev = VecDeque::from(args);
            ev.push_front(*f);
            reorder_exp(
                ev,
                |mut ev| Call(ev.pop_front().unwrap(), Vec::from(ev)),
                gen,
            )
        }
        e => (nop(), e),
    }
}

/// Rewrites an arbitrary statement into a list of statements with no `Seq`
/// or `Eseq`, where the parent of every `Call` is an `Exp` or a
/// `Move(Temp _, _)`.
pub fn linearize(s: IrStm, gen: &mut dyn Uuids) -> Vec<IrStm> {
    fn flatten(s: IrStm, out: &mut Vec<IrStm>) {
        match s {
            IrStm::Seq(a, b) => {
                flatten(*a, out);
                flatten(*b, out);
            }
            s if is_nop(&s) => {}
            s => out.push(s),
        }
    }
    let mut out = Vec::new();
    flatten(do_stm(s, gen), &mut out);
    out
}

/// A maximal straight-line run: first statement is its label, last is its
/// only jump.
#[derive(Debug)]
pub struct BasicBlock {
    pub stmts: Vec<IrStm>,
}

impl BasicBlock {
    pub fn label(&self) -> temp::Label {
        match self.stmts.first() {
            Some(IrStm::Label(l)) => *l,
            _ => panic!("impl bug: basic block must start with a label"),
        }
    }

    /// Successor labels in scheduling-preference order: a conditional's
    /// false target comes first so traces fall through to it.
    pub fn successors(&self) -> Vec<temp::Label> {
        match self.stmts.last() {
            Some(IrStm::Cjump(_, _, _, t, f)) => vec![*f, *t],
            Some(IrStm::Jump(_, labels)) => labels.clone(),
            _ => panic!("impl bug: basic block must end in a jump"),
        }
    }
}

#[cfg(debug_assertions)]
fn validate_block(block: &BasicBlock) {
    debug_assert!(matches!(block.stmts.first(), Some(IrStm::Label(..))));
    debug_assert!(matches!(
        block.stmts.last(),
        Some(IrStm::Jump(..)) | Some(IrStm::Cjump(..))
    ));
    for stm in &block.stmts[1..block.stmts.len() - 1] {
        debug_assert!(!matches!(
            stm,
            IrStm::Label(..) | IrStm::Jump(..) | IrStm::Cjump(..)
        ));
    }
}

/// Partitions a linearized statement list into basic blocks, in source
/// order, and returns the label control reaches when the body finishes.
pub fn basic_blocks(
    stmts: Vec<IrStm>,
    gen: &mut dyn Uuids,
) -> (Vec<BasicBlock>, temp::Label) {
    let done_label = gen.new_unnamed_label();
    let mut blocks = Vec::new();
    let mut cur: Vec<IrStm> = Vec::new();
    let mut iter = stmts.into_iter().peekable();

    while iter.peek().is_some() {
        match iter.peek() {
            Some(IrStm::Label(..)) => cur.push(iter.next().unwrap()),
            _ => cur.push(IrStm::Label(gen.new_unnamed_label())),
        }
        loop {
            match iter.peek() {
                None => {
                    // ran out without a jump; exit toward the done label.
                    cur.push(Jump(IrExp::Name(done_label), vec![done_label]));
                    break;
                }
                Some(IrStm::Label(l)) => {
                    // falling into the next block becomes an explicit jump.
                    let l = *l;
                    cur.push(Jump(IrExp::Name(l), vec![l]));
                    break;
                }
                Some(IrStm::Jump(..)) | Some(IrStm::Cjump(..)) => {
                    cur.push(iter.next().unwrap());
                    break;
                }
                Some(_) => cur.push(iter.next().unwrap()),
            }
        }
        let block = BasicBlock {
            stmts: mem::take(&mut cur),
        };
        #[cfg(debug_assertions)]
        validate_block(&block);
        blocks.push(block);
    }
    (blocks, done_label)
}

/// Orders blocks into traces so every `Cjump` is immediately followed by its
/// false label, eliminating fall-through jumps along the way. Trace heads
/// are chosen in source order, which keeps the whole pipeline deterministic.
pub fn trace_schedule(
    mut blocks: Vec<BasicBlock>,
    done_label: temp::Label,
    gen: &mut dyn Uuids,
) -> Vec<IrStm> {
    let labels: Vec<temp::Label> = blocks.iter().map(|b| b.label()).collect();
    let index: HashMap<temp::Label, usize> = labels
        .iter()
        .enumerate()
        .map(|(i, l)| (*l, i))
        .collect();

    let mut scheduled = vec![false; blocks.len()];
    let mut order = Vec::with_capacity(blocks.len());
    for start in 0..blocks.len() {
        let mut cur = start;
        while !scheduled[cur] {
            scheduled[cur] = true;
            order.push(cur);
            let next = blocks[cur]
                .successors()
                .into_iter()
                .filter_map(|l| index.get(&l).copied())
                .find(|&j| !scheduled[j]);
            match next {
                Some(j) => cur = j,
                None => break,
            }
        }
    }

    let mut out = Vec::new();
    for (k, &bi) in order.iter().enumerate() {
        let following = order
            .get(k + 1)
            .map(|&j| labels[j])
            .unwrap_or(done_label);
        let mut stmts = mem::take(&mut blocks[bi].stmts);
        let terminal = stmts.pop().unwrap();
        out.extend(stmts);
        match terminal {
            IrStm::Jump(e, target_labels) => {
                let falls_through = matches!(e.as_ref(), IrExp::Name(l) if *l == following)
                    && target_labels.len() == 1;
                if !falls_through {
                    out.push(IrStm::Jump(e, target_labels));
                }
            }
            IrStm::Cjump(r, a, b, t, f) => {
                if f == following {
                    out.push(IrStm::Cjump(r, a, b, t, f));
                } else if t == following {
                    out.push(IrStm::Cjump(r.negate(), a, b, f, t));
                } else {
                    // neither arm follows; give the conditional a local
                    // false label that trampolines to the real one.
                    let ff = gen.new_unnamed_label();
                    out.push(IrStm::Cjump(r, a, b, t, ff));
                    out.push(IrStm::Label(ff));
                    out.push(Jump(IrExp::Name(f), vec![f]));
                }
            }
            _ => panic!("impl bug: basic block without terminal jump"),
        }
    }
    out.push(IrStm::Label(done_label));
    out
}
