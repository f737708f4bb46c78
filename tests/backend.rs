//! End-to-end pipeline tests.
//!
//! Lexing, parsing and type checking live outside this crate, so each
//! scenario builds the typed AST a checker would have produced and runs it
//! through translate, canonicalization, instruction selection and register
//! allocation, asserting the pipeline's observable properties.

use std::collections::HashMap;

use tiger_backend::assem::x86_64::X86Asm;
use tiger_backend::assem::{Codegen, Instr};
use tiger_backend::ast::{Dec, Exp, FunDec, Oper, Var};
use tiger_backend::backend;
use tiger_backend::canon;
use tiger_backend::frame::x86_64::X86_64Frame;
use tiger_backend::frame::{Frag, Frame, FrameRef, Register};
use tiger_backend::ir::{IrExp, IrStm};
use tiger_backend::regalloc;
use tiger_backend::symbol::Symbol;
use tiger_backend::temp::{Label, Temp, Uuids, UuidsImpl};
use tiger_backend::translate;

type F = X86_64Frame;
type C = X86Asm;

// ------------------------------------------------------------- AST builders

fn int(i: i64) -> Exp {
    Exp::Int(i)
}

fn op(left: Exp, oper: Oper, right: Exp) -> Exp {
    Exp::Op {
        left: Box::new(left),
        oper,
        right: Box::new(right),
        strings: false,
    }
}

fn var(name: Symbol) -> Exp {
    Exp::Var(Box::new(Var::Simple(name)))
}

fn var_dec(name: Symbol, escape: bool, init: Exp) -> Dec {
    Dec::Var {
        name,
        escape,
        init: Box::new(init),
    }
}

fn let_in(decs: Vec<Dec>, body: Exp) -> Exp {
    Exp::Let {
        decs,
        body: Box::new(body),
    }
}

// ------------------------------------------------------------- IR predicates

fn exp_has_eseq(e: &IrExp) -> bool {
    match e {
        IrExp::Eseq(..) => true,
        IrExp::Const(..) | IrExp::Name(..) | IrExp::Temp(..) => false,
        IrExp::Binop(_, a, b) => exp_has_eseq(a) || exp_has_eseq(b),
        IrExp::Mem(a) => exp_has_eseq(a),
        IrExp::Call(f, args) => exp_has_eseq(f) || args.iter().any(exp_has_eseq),
    }
}

fn stm_has_eseq(s: &IrStm) -> bool {
    match s {
        IrStm::Move(a, b) => exp_has_eseq(a) || exp_has_eseq(b),
        IrStm::Exp(e) => exp_has_eseq(e),
        IrStm::Jump(e, _) => exp_has_eseq(e),
        IrStm::Cjump(_, a, b, _, _) => exp_has_eseq(a) || exp_has_eseq(b),
        IrStm::Seq(a, b) => stm_has_eseq(a) || stm_has_eseq(b),
        IrStm::Label(..) => false,
    }
}

fn exp_has_nested_call(e: &IrExp) -> bool {
    // a call anywhere inside `e` is nested, since `e` is already below the
    // statement level.
    match e {
        IrExp::Call(..) => true,
        IrExp::Const(..) | IrExp::Name(..) | IrExp::Temp(..) => false,
        IrExp::Binop(_, a, b) => exp_has_nested_call(a) || exp_has_nested_call(b),
        IrExp::Mem(a) => exp_has_nested_call(a),
        IrExp::Eseq(s, e) => stm_has_nested_call(s) || exp_has_nested_call(e),
    }
}

fn stm_has_nested_call(s: &IrStm) -> bool {
    match s {
        IrStm::Move(dst, src) => {
            let src_ok = matches!(
                (dst.as_ref(), src.as_ref()),
                (IrExp::Temp(..), IrExp::Call(..))
            );
            let src_nested = if src_ok {
                match src.as_ref() {
                    IrExp::Call(f, args) => {
                        exp_has_nested_call(f) || args.iter().any(exp_has_nested_call)
                    }
                    _ => unreachable!(),
                }
            } else {
                exp_has_nested_call(src)
            };
            exp_has_nested_call(dst) || src_nested
        }
        IrStm::Exp(e) => match e.as_ref() {
            IrExp::Call(f, args) => {
                exp_has_nested_call(f) || args.iter().any(exp_has_nested_call)
            }
            e => exp_has_nested_call(e),
        },
        IrStm::Jump(e, _) => exp_has_nested_call(e),
        IrStm::Cjump(_, a, b, _, _) => exp_has_nested_call(a) || exp_has_nested_call(b),
        IrStm::Seq(a, b) => stm_has_nested_call(a) || stm_has_nested_call(b),
        IrStm::Label(..) => false,
    }
}

fn assert_canonical(stms: &[IrStm]) {
    for s in stms {
        assert!(!stm_has_eseq(s), "eseq survived canonicalization: {:?}", s);
        assert!(
            !stm_has_nested_call(s),
            "nested call survived canonicalization: {:?}",
            s
        );
        assert!(!matches!(s, IrStm::Seq(..)), "seq survived linearize");
    }
}

fn assert_cjumps_fall_through(stms: &[IrStm]) {
    for (i, s) in stms.iter().enumerate() {
        if let IrStm::Cjump(_, _, _, _, f) = s {
            match stms.get(i + 1) {
                Some(IrStm::Label(l)) if l == f => {}
                other => panic!("cjump not followed by its false label: {:?}", other),
            }
        }
    }
}

// --------------------------------------------------------- pipeline helpers

/// The pure per-procedure pipeline: canonical statements, allocated
/// instructions, register map.
fn lower_proc(
    body: IrStm,
    frame: FrameRef,
    gen: &mut UuidsImpl,
) -> (Vec<IrStm>, Vec<Instr>, HashMap<Temp, Register>) {
    let stms = canon::linearize(body, gen);
    let (blocks, done_label) = canon::basic_blocks(stms, gen);
    let scheduled = canon::trace_schedule(blocks, done_label, gen);

    let mut instrs = Vec::new();
    for stm in scheduled.clone() {
        C::munch_stm(stm, &mut instrs, gen);
    }
    frame.borrow().proc_entry_exit2(&mut instrs, gen);
    let (instrs, map) = regalloc::allocate::<F>(instrs, &frame, gen);
    (scheduled, instrs, map)
}

fn proc_frags(frags: Vec<Frag>) -> (Vec<(IrStm, FrameRef)>, Vec<(Label, String)>) {
    let mut procs = Vec::new();
    let mut strings = Vec::new();
    for frag in frags {
        match frag {
            Frag::Proc { body, frame } => procs.push((body, frame)),
            Frag::String(l, s) => strings.push((l, s)),
        }
    }
    (procs, strings)
}

// ------------------------------------------------------------------ scenarios

#[test]
fn empty_program_compiles_to_bare_frame() {
    let mut gen: UuidsImpl = Uuids::new();
    // let in () end
    let ast = let_in(vec![], Exp::Seq(vec![]));
    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, strings) = proc_frags(frags);

    assert_eq!(1, procs.len(), "expected exactly the main fragment");
    assert!(strings.is_empty());

    let (body, frame) = procs.into_iter().next().unwrap();
    let (scheduled, _, _) = lower_proc(body, frame, &mut gen);
    // nothing but the frame's own bookkeeping: callee-save shuffles, labels
    // and the exit path.
    for s in &scheduled {
        assert!(
            matches!(s, IrStm::Move(..) | IrStm::Label(..) | IrStm::Jump(..)),
            "unexpected statement in empty program: {:?}",
            s
        );
    }
    assert!(matches!(scheduled.last(), Some(IrStm::Label(..))));
}

#[test]
fn arithmetic_lands_in_the_return_register() {
    let mut gen: UuidsImpl = Uuids::new();
    let x = gen.intern("x");
    // let var x := 1 + 2 * 3 in x end
    let ast = let_in(
        vec![var_dec(
            x,
            false,
            op(int(1), Oper::Plus, op(int(2), Oper::Times, int(3))),
        )],
        var(x),
    );
    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, _) = proc_frags(frags);
    let (body, frame) = procs.into_iter().next().unwrap();
    let (scheduled, instrs, map) = lower_proc(body, frame, &mut gen);

    assert_canonical(&scheduled);

    // the function's value flows into %rax before the epilogue.
    let rax = gen.named_temp("rax");
    let feeds_rax = instrs
        .iter()
        .any(|i| matches!(i, Instr::Move { dst, .. } if *dst == rax));
    assert!(feeds_rax, "no move into the return register");
    assert_eq!("rax", map[&rax]);
}

#[test]
fn nested_function_reads_outer_variable_through_static_link() {
    let mut gen: UuidsImpl = Uuids::new();
    let a = gen.intern("a");
    let f = gen.intern("f");
    // let var a := 5 function f() : int = a in f() end
    let ast = let_in(
        vec![
            var_dec(a, true, int(5)),
            Dec::Function(vec![FunDec {
                name: f,
                params: vec![],
                returns_value: true,
                body: Box::new(var(a)),
            }]),
        ],
        Exp::Call {
            func: f,
            args: vec![],
        },
    );
    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, _) = proc_frags(frags);
    assert_eq!(2, procs.len(), "main and f");

    let mut f_body = None;
    for (body, frame) in procs {
        let is_f = frame.borrow().name().resolve_named(&gen) == "f";
        if is_f {
            f_body = Some(body.clone());
        }
        // both procedures canonicalize: calls only at statement level.
        let (scheduled, _, _) = lower_proc(body, frame, &mut gen);
        assert_canonical(&scheduled);
    }
    let f_body = f_body.expect("no fragment for f");

    // the access to `a` reads memory twice: once through the static link
    // (formal #0 of f's frame), once for the variable's slot in main.
    fn max_mem_depth_exp(e: &IrExp) -> usize {
        match e {
            IrExp::Mem(inner) => 1 + max_mem_depth_exp(inner),
            IrExp::Binop(_, a, b) => max_mem_depth_exp(a).max(max_mem_depth_exp(b)),
            IrExp::Call(f, args) => args
                .iter()
                .map(max_mem_depth_exp)
                .fold(max_mem_depth_exp(f), usize::max),
            IrExp::Eseq(s, e) => max_mem_depth_stm(s).max(max_mem_depth_exp(e)),
            _ => 0,
        }
    }
    fn max_mem_depth_stm(s: &IrStm) -> usize {
        match s {
            IrStm::Move(a, b) => max_mem_depth_exp(a).max(max_mem_depth_exp(b)),
            IrStm::Exp(e) => max_mem_depth_exp(e),
            IrStm::Jump(e, _) => max_mem_depth_exp(e),
            IrStm::Cjump(_, a, b, _, _) => max_mem_depth_exp(a).max(max_mem_depth_exp(b)),
            IrStm::Seq(a, b) => max_mem_depth_stm(a).max(max_mem_depth_stm(b)),
            IrStm::Label(..) => 0,
        }
    }
    assert_eq!(2, max_mem_depth_stm(&f_body));
}

#[test]
fn if_else_schedules_false_arm_as_fall_through() {
    let mut gen: UuidsImpl = Uuids::new();
    let x = gen.intern("x");
    // let var x := if 1 < 2 then 10 else 20 in x end
    let ast = let_in(
        vec![var_dec(
            x,
            false,
            Exp::If {
                test: Box::new(op(int(1), Oper::Lt, int(2))),
                then: Box::new(int(10)),
                els: Some(Box::new(int(20))),
            },
        )],
        var(x),
    );
    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, _) = proc_frags(frags);
    let (body, frame) = procs.into_iter().next().unwrap();
    let (scheduled, instrs, map) = lower_proc(body, frame, &mut gen);

    assert!(
        scheduled.iter().any(|s| matches!(s, IrStm::Cjump(..))),
        "comparison did not lower to a cjump"
    );
    assert_cjumps_fall_through(&scheduled);

    // both arms made it to code, and every temp got a register.
    let templates: Vec<String> = instrs
        .iter()
        .map(|i| match i {
            Instr::Oper { assem, .. }
            | Instr::Label { assem, .. }
            | Instr::Move { assem, .. } => assem.clone(),
        })
        .collect();
    assert!(templates.iter().any(|t| t.contains("$10")));
    assert!(templates.iter().any(|t| t.contains("$20")));
    for i in &instrs {
        for t in i.sources().into_iter().chain(i.dests()) {
            assert!(map.contains_key(&t));
        }
    }
}

#[test]
fn string_literal_becomes_a_data_fragment() {
    let mut gen: UuidsImpl = Uuids::new();
    let s = gen.intern("s");
    // let var s := "hello" in s end
    let ast = let_in(vec![var_dec(s, false, Exp::Str("hello".into()))], var(s));
    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, strings) = proc_frags(frags);

    assert_eq!(1, strings.len());
    let (label, value) = &strings[0];
    assert_eq!("hello", value);

    // the body references the literal's label by name.
    fn exp_mentions(e: &IrExp, l: &Label) -> bool {
        match e {
            IrExp::Name(n) => n == l,
            IrExp::Binop(_, a, b) => exp_mentions(a, l) || exp_mentions(b, l),
            IrExp::Mem(a) => exp_mentions(a, l),
            IrExp::Call(f, args) => {
                exp_mentions(f, l) || args.iter().any(|a| exp_mentions(a, l))
            }
            IrExp::Eseq(s, e) => stm_mentions(s, l) || exp_mentions(e, l),
            _ => false,
        }
    }
    fn stm_mentions(s: &IrStm, l: &Label) -> bool {
        match s {
            IrStm::Move(a, b) => exp_mentions(a, l) || exp_mentions(b, l),
            IrStm::Exp(e) => exp_mentions(e, l),
            IrStm::Jump(e, _) => exp_mentions(e, l),
            IrStm::Cjump(_, a, b, _, _) => exp_mentions(a, l) || exp_mentions(b, l),
            IrStm::Seq(a, b) => stm_mentions(a, l) || stm_mentions(b, l),
            IrStm::Label(..) => false,
        }
    }
    let (main_body, _) = &procs[0];
    assert!(stm_mentions(main_body, label));

    // the data section carries the length word and the bytes.
    let data = backend::codegen_data::<F>(&strings);
    assert!(data.iter().any(|l| l.contains(".quad 5")));
    assert!(data.iter().any(|l| l.contains("hello")));
}

#[test]
fn register_pressure_spills_and_still_colors_within_k() {
    let mut gen: UuidsImpl = Uuids::new();
    let k = F::allocatable_registers().len();
    let names: Vec<Symbol> = (0..k + 3)
        .map(|i| gen.intern(&format!("a{}", i)))
        .collect();

    // let var a0 := 0 ... var aN := N in a0 + a1 + ... + aN end
    let decs: Vec<Dec> = names
        .iter()
        .enumerate()
        .map(|(i, n)| var_dec(*n, false, int(i as i64)))
        .collect();
    let sum = names[1..]
        .iter()
        .fold(var(names[0]), |acc, n| op(acc, Oper::Plus, var(*n)));
    let ast = let_in(decs, sum);

    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, _) = proc_frags(frags);
    let (body, frame) = procs.into_iter().next().unwrap();
    let (_, instrs, map) = lower_proc(body, frame, &mut gen);

    // allocation terminated (we are here) and spill code exists: stores into
    // frame slots and loads back out.
    let spill_stores: Vec<&Instr> = instrs
        .iter()
        .filter(|i| matches!(i, Instr::Oper { assem, .. } if assem.contains("(%'S1)")))
        .collect();
    let spill_loads = instrs
        .iter()
        .filter(|i| matches!(i, Instr::Oper { assem, .. } if assem.contains("(%'S0), %'D0")))
        .count();
    assert!(spill_loads > 0, "no spill loads inserted");

    // at least three distinct frame slots were needed.
    let mut offsets: Vec<&str> = spill_stores
        .iter()
        .filter_map(|i| match i {
            Instr::Oper { assem, .. } => assem.split("%'S0,").nth(1),
            _ => None,
        })
        .collect();
    offsets.sort();
    offsets.dedup();
    assert!(
        offsets.len() >= 3,
        "expected at least 3 spill slots, saw {:?}",
        offsets
    );

    // the final coloring stays within the allocatable set.
    let allocatable = F::allocatable_registers();
    for i in &instrs {
        for t in i.sources().into_iter().chain(i.dests()) {
            let r = map
                .get(&t)
                .unwrap_or_else(|| panic!("unmapped temp {:?}", t));
            if matches!(t, Temp::Unnamed(..)) {
                assert!(allocatable.contains(r), "{:?} colored to {}", t, r);
            }
        }
    }
}

// ------------------------------------------------------------------ invariants

#[test]
fn jump_targets_are_defined_within_the_procedure() {
    let mut gen: UuidsImpl = Uuids::new();
    let x = gen.intern("x");
    let ast = let_in(
        vec![var_dec(x, false, int(0))],
        Exp::While {
            test: Box::new(op(var(x), Oper::Lt, int(10))),
            body: Box::new(Exp::Assign {
                var: Box::new(Var::Simple(x)),
                exp: Box::new(op(var(x), Oper::Plus, int(1))),
            }),
        },
    );
    let frags = translate::program::<F>(&ast, &mut gen);
    let (procs, _) = proc_frags(frags);
    let (body, frame) = procs.into_iter().next().unwrap();
    let (_, instrs, _) = lower_proc(body, frame, &mut gen);

    let defined: Vec<Label> = instrs.iter().filter_map(|i| i.label()).collect();
    for i in &instrs {
        for target in i.jumps() {
            assert!(
                defined.contains(target),
                "jump target {:?} not defined in procedure",
                target
            );
        }
    }
}

#[test]
fn pipeline_is_deterministic() {
    let build = || {
        let mut gen: UuidsImpl = Uuids::new();
        let x = gen.intern("x");
        let s = gen.intern("s");
        let ast = let_in(
            vec![
                var_dec(s, false, Exp::Str("hi".into())),
                var_dec(
                    x,
                    false,
                    Exp::If {
                        test: Box::new(op(int(1), Oper::Lt, int(2))),
                        then: Box::new(int(10)),
                        els: Some(Box::new(int(20))),
                    },
                ),
            ],
            var(x),
        );
        backend::compile::<F, C>(&ast, &mut gen).into_lines()
    };
    assert_eq!(build(), build());
}

#[test]
fn whole_pipeline_emits_prologue_body_epilogue() {
    let mut gen: UuidsImpl = Uuids::new();
    let x = gen.intern("x");
    let ast = let_in(vec![var_dec(x, false, int(1))], var(x));
    let asm = backend::compile::<F, C>(&ast, &mut gen);

    assert_eq!(1, asm.procs.len());
    let p = &asm.procs[0];
    assert!(p.prologue.contains("main:"));
    assert!(p.prologue.contains("pushq %rbp"));
    assert!(p.epilogue.contains("ret"));
    // formatted body lines contain no unfilled template holes.
    for line in &p.body {
        assert!(!line.contains('\''), "unsubstituted hole in {}", line);
    }
}
