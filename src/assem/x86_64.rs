//! Maximal-munch instruction selection for x86-64, AT&T syntax.
//!
//! Consumes canonical IR only: no `Eseq`, no `Seq`, every `Call` at the top
//! of a `Move` or `Exp`. Anything else reaching a munch function is a bug in
//! an earlier stage.

use crate::{
    assem::{Codegen, Dst, Instr, Src},
    frame::{x86_64, FrameRef},
    ir::{
        helpers,
        IrBinop::{self, *},
        IrExp, IrRelop,
        IrRelop::*,
        IrStm,
    },
    temp,
    temp::Uuids,
};

pub struct X86Asm;

/// Splits a memory address into base expression and constant displacement,
/// munching `Binop(Plus, e, Const c)` in either operand order.
fn base_and_disp(addr: IrExp) -> (IrExp, i64) {
    match addr {
        IrExp::Binop(Plus, a, b) => match (*a, *b) {
            (e, IrExp::Const(c)) | (IrExp::Const(c), e) => (e, c),
            (a, b) => (helpers::Binop(Plus, a, b), 0),
        },
        e => (e, 0),
    }
}

fn mem_operand(disp: i64, src_index: usize) -> String {
    if disp == 0 {
        format!("(%'S{})", src_index)
    } else {
        format!("{}(%'S{})", disp, src_index)
    }
}

fn branch_mnemonic(r: IrRelop) -> &'static str {
    match r {
        Eq => "je .L'J0",
        Ne => "jne .L'J0",
        Lt => "jl .L'J0",
        Gt => "jg .L'J0",
        Le => "jle .L'J0",
        Ge => "jge .L'J0",
        Ult => "jb .L'J0",
        Ule => "jbe .L'J0",
        Ugt => "ja .L'J0",
        Uge => "jae .L'J0",
    }
}

impl X86Asm {
    /// Emits the call sequence: arguments into their convention-mandated
    /// places, the call itself with the caller-save registers listed as
    /// clobbers, stack cleanup for pushed arguments. Returns nothing; the
    /// caller decides whether the value in %rax is kept.
    fn munch_call(f: IrExp, args: Vec<IrExp>, result: &mut Vec<Instr>, gen: &mut dyn Uuids) {
        let num_args = args.len();
        let mut arg_temps = Vec::with_capacity(num_args);
        // evaluation order is left to right; pushes happen afterwards so the
        // addressing of later arguments cannot disturb earlier ones.
        for arg in args {
            arg_temps.push(Self::munch_exp(arg, result, gen));
        }

        let rsp = gen.named_temp(x86_64::RSP);
        for i in (x86_64::ARG_REGS.len()..num_args).rev() {
            result.push(Instr::Oper {
                assem: "pushq %'S0".into(),
                dst: Dst(vec![rsp]),
                src: Src(vec![arg_temps[i], rsp]),
                jump: vec![],
            });
        }

        let arg_regs = x86_64::arg_regs(gen);
        let in_reg = num_args.min(arg_regs.len());
        for i in (0..in_reg).rev() {
            result.push(Instr::Move {
                assem: "movq %'S, %'D".into(),
                dst: arg_regs[i],
                src: arg_temps[i],
            });
        }

        let callee = match f {
            IrExp::Name(label) => label.resolve_named(gen).to_string(),
            _ => panic!("impl bug: call target must be a named label"),
        };
        // the caller saves are clobbered: anything live across the call is
        // forced into a callee save or onto the stack by the allocator.
        let mut clobbers = x86_64::caller_saves(gen);
        clobbers.push(rsp);
        result.push(Instr::Oper {
            assem: format!("call {}", callee),
            dst: Dst(clobbers),
            src: Src(arg_regs.into_iter().take(in_reg).collect()),
            jump: vec![],
        });

        if num_args > x86_64::ARG_REGS.len() {
            let pushed = num_args - x86_64::ARG_REGS.len();
            result.push(Instr::Oper {
                assem: format!("addq ${}, %'D0", pushed * x86_64::WORD_SIZE),
                dst: Dst(vec![rsp]),
                src: Src(vec![rsp]),
                jump: vec![],
            });
        }
    }
}

impl Codegen for X86Asm {
    fn munch_stm(stm: IrStm, result: &mut Vec<Instr>, gen: &mut dyn Uuids) {
        match stm {
            IrStm::Move(dst, src) => match (*dst, *src) {
                (IrExp::Temp(t), IrExp::Call(f, args)) => {
                    Self::munch_call(*f, args, result, gen);
                    result.push(Instr::Move {
                        assem: "movq %'S, %'D".into(),
                        dst: t,
                        src: gen.named_temp(x86_64::RAX),
                    });
                }
                (IrExp::Temp(t), IrExp::Const(c)) => {
                    result.push(Instr::Oper {
                        assem: format!("movq ${}, %'D0", c),
                        dst: Dst(vec![t]),
                        src: Src::empty(),
                        jump: vec![],
                    });
                }
                (IrExp::Temp(t), IrExp::Mem(addr)) => {
                    let (base, disp) = base_and_disp(*addr);
                    let tb = Self::munch_exp(base, result, gen);
                    result.push(Instr::Oper {
                        assem: format!("movq {}, %'D0", mem_operand(disp, 0)),
                        dst: Dst(vec![t]),
                        src: Src(vec![tb]),
                        jump: vec![],
                    });
                }
                (IrExp::Temp(t), IrExp::Temp(s)) => {
                    result.push(Instr::Move {
                        assem: "movq %'S, %'D".into(),
                        dst: t,
                        src: s,
                    });
                }
                (IrExp::Temp(t), e) => {
                    let te = Self::munch_exp(e, result, gen);
                    result.push(Instr::Move {
                        assem: "movq %'S, %'D".into(),
                        dst: t,
                        src: te,
                    });
                }
                (IrExp::Mem(addr), e) => {
                    let ts = Self::munch_exp(e, result, gen);
                    let (base, disp) = base_and_disp(*addr);
                    let tb = Self::munch_exp(base, result, gen);
                    result.push(Instr::Oper {
                        assem: format!("movq %'S0, {}", mem_operand(disp, 1)),
                        dst: Dst::empty(),
                        src: Src(vec![ts, tb]),
                        jump: vec![],
                    });
                }
                (dst, _) => panic!("impl bug: move destination {:?} is not Temp or Mem", dst),
            },
            IrStm::Exp(e) => match *e {
                IrExp::Call(f, args) => {
                    Self::munch_call(*f, args, result, gen);
                }
                e => {
                    Self::munch_exp(e, result, gen);
                }
            },
            IrStm::Jump(e, target_labels) => match *e {
                IrExp::Name(label) => {
                    debug_assert!(matches!(label, temp::Label::Unnamed(..)));
                    result.push(Instr::Oper {
                        assem: "jmp .L'J0".into(),
                        dst: Dst::empty(),
                        src: Src::empty(),
                        jump: target_labels,
                    });
                }
                e => {
                    let t = Self::munch_exp(e, result, gen);
                    result.push(Instr::Oper {
                        assem: "jmp *%'S0".into(),
                        dst: Dst::empty(),
                        src: Src(vec![t]),
                        jump: target_labels,
                    });
                }
            },
            IrStm::Cjump(r, a, b, lt, lf) => {
                let ta = Self::munch_exp(*a, result, gen);
                let tb = Self::munch_exp(*b, result, gen);
                result.push(Instr::Oper {
                    // S1 - S0 in AT&T order, so this compares a against b.
                    assem: "cmpq %'S0, %'S1".into(),
                    dst: Dst::empty(),
                    src: Src(vec![tb, ta]),
                    jump: vec![],
                });
                // trace scheduling put the false label right after this
                // instruction, so only the true branch is emitted. both
                // targets stay in `jump` for the dataflow passes.
                result.push(Instr::Oper {
                    assem: branch_mnemonic(r).into(),
                    dst: Dst::empty(),
                    src: Src::empty(),
                    jump: vec![lt, lf],
                });
            }
            IrStm::Label(lab) => match lab {
                temp::Label::Named(..) => result.push(Instr::Label {
                    assem: "'L:".into(),
                    lab,
                }),
                temp::Label::Unnamed(..) => result.push(Instr::Label {
                    assem: ".L'L:".into(),
                    lab,
                }),
            },
            IrStm::Seq(..) => panic!("impl bug: Seq survived canonicalization"),
        }
    }

    fn munch_exp(exp: IrExp, result: &mut Vec<Instr>, gen: &mut dyn Uuids) -> temp::Temp {
        match exp {
            IrExp::Const(c) => {
                let t = gen.new_unnamed_temp();
                result.push(Instr::Oper {
                    assem: format!("movq ${}, %'D0", c),
                    dst: Dst(vec![t]),
                    src: Src::empty(),
                    jump: vec![],
                });
                t
            }
            IrExp::Name(label) => {
                let t = gen.new_unnamed_temp();
                let assem = match label {
                    temp::Label::Named(..) => format!("leaq {}(%rip), %'D0", label.resolve_named(gen)),
                    temp::Label::Unnamed(id) => format!("leaq .L{}(%rip), %'D0", id),
                };
                result.push(Instr::Oper {
                    assem,
                    dst: Dst(vec![t]),
                    src: Src::empty(),
                    jump: vec![],
                });
                t
            }
            IrExp::Temp(t) => t,
            IrExp::Mem(addr) => {
                let (base, disp) = base_and_disp(*addr);
                let tb = Self::munch_exp(base, result, gen);
                let t = gen.new_unnamed_temp();
                result.push(Instr::Oper {
                    assem: format!("movq {}, %'D0", mem_operand(disp, 0)),
                    dst: Dst(vec![t]),
                    src: Src(vec![tb]),
                    jump: vec![],
                });
                t
            }
            IrExp::Binop(Div, a, b) => {
                let ta = Self::munch_exp(*a, result, gen);
                let tb = Self::munch_exp(*b, result, gen);
                let rax = gen.named_temp(x86_64::RAX);
                let rdx = gen.named_temp(x86_64::RDX);
                result.push(Instr::Move {
                    assem: "movq %'S, %'D".into(),
                    dst: rax,
                    src: ta,
                });
                // sign-extend the dividend into %rdx:%rax.
                result.push(Instr::Oper {
                    assem: "cqto".into(),
                    dst: Dst(vec![rdx]),
                    src: Src(vec![rax]),
                    jump: vec![],
                });
                result.push(Instr::Oper {
                    assem: "idivq %'S0".into(),
                    dst: Dst(vec![rax, rdx]),
                    src: Src(vec![tb, rax, rdx]),
                    jump: vec![],
                });
                let t = gen.new_unnamed_temp();
                result.push(Instr::Move {
                    assem: "movq %'S, %'D".into(),
                    dst: t,
                    src: rax,
                });
                t
            }
            IrExp::Binop(op, a, b) => {
                let mnemonic = match op {
                    Plus => "addq %'S0, %'D0",
                    Minus => "subq %'S0, %'D0",
                    Mul => "imulq %'S0, %'D0",
                    And => "andq %'S0, %'D0",
                    Or => "orq %'S0, %'D0",
                    Xor => "xorq %'S0, %'D0",
                    Lshift => "shlq %'S0, %'D0",
                    Rshift => "shrq %'S0, %'D0",
                    ArShift => "sarq %'S0, %'D0",
                    IrBinop::Div => unreachable!(),
                };
                let ta = Self::munch_exp(*a, result, gen);
                let tb = Self::munch_exp(*b, result, gen);
                // two-address form: copy the left operand into a fresh temp
                // first, so a live temp is never clobbered.
                let t = gen.new_unnamed_temp();
                result.push(Instr::Move {
                    assem: "movq %'S, %'D".into(),
                    dst: t,
                    src: ta,
                });
                result.push(Instr::Oper {
                    assem: mnemonic.into(),
                    dst: Dst(vec![t]),
                    src: Src(vec![tb, t]),
                    jump: vec![],
                });
                t
            }
            IrExp::Call(..) => {
                panic!("impl bug: nested Call survived canonicalization")
            }
            IrExp::Eseq(..) => panic!("impl bug: Eseq survived canonicalization"),
        }
    }

    fn code_gen_frame(_: FrameRef, stm: IrStm, instrs: &mut Vec<Instr>, gen: &mut dyn Uuids) {
        Self::munch_stm(stm, instrs, gen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::helpers::*;
    use crate::temp::{Uuids, UuidsImpl};

    // raw templates; enough to check tiling without running the allocator.
    fn templates(instrs: &[Instr]) -> Vec<String> {
        instrs
            .iter()
            .map(|i| match i {
                Instr::Label { assem, .. }
                | Instr::Oper { assem, .. }
                | Instr::Move { assem, .. } => assem.clone(),
            })
            .collect()
    }

    #[test]
    fn const_move_tiles_to_immediate() {
        let mut gen: UuidsImpl = Uuids::new();
        let t = gen.new_unnamed_temp();
        let mut instrs = Vec::new();
        X86Asm::munch_stm(
            Move(IrExp::Temp(t), IrExp::Const(42)),
            &mut instrs,
            &mut gen,
        );
        assert_eq!(1, instrs.len());
        assert_eq!(vec!["movq $42, %'D0"], templates(&instrs));
    }

    #[test]
    fn mem_load_folds_constant_displacement() {
        let mut gen: UuidsImpl = Uuids::new();
        let t = gen.new_unnamed_temp();
        let base = gen.new_unnamed_temp();
        let mut instrs = Vec::new();
        X86Asm::munch_stm(
            Move(
                IrExp::Temp(t),
                Mem(Binop(Plus, IrExp::Temp(base), IrExp::Const(-16))),
            ),
            &mut instrs,
            &mut gen,
        );
        assert_eq!(1, instrs.len());
        assert_eq!(vec!["movq -16(%'S0), %'D0"], templates(&instrs));
    }

    #[test]
    fn temp_to_temp_move_is_coalescable() {
        let mut gen: UuidsImpl = Uuids::new();
        let a = gen.new_unnamed_temp();
        let b = gen.new_unnamed_temp();
        let mut instrs = Vec::new();
        X86Asm::munch_stm(Move(IrExp::Temp(a), IrExp::Temp(b)), &mut instrs, &mut gen);
        assert!(matches!(instrs[0], Instr::Move { .. }));
    }

    #[test]
    fn cjump_emits_compare_then_single_branch() {
        let mut gen: UuidsImpl = Uuids::new();
        let t = gen.new_unnamed_label();
        let f = gen.new_unnamed_label();
        let mut instrs = Vec::new();
        X86Asm::munch_stm(
            Cjump(IrRelop::Lt, IrExp::Const(1), IrExp::Const(2), t, f),
            &mut instrs,
            &mut gen,
        );
        let branch = instrs.last().unwrap();
        match branch {
            Instr::Oper { assem, jump, .. } => {
                assert_eq!("jl .L'J0", assem);
                assert_eq!(&vec![t, f], jump);
            }
            _ => panic!("expected branch"),
        }
    }

    #[test]
    fn call_clobbers_caller_saves() {
        let mut gen: UuidsImpl = Uuids::new();
        let f = gen.named_label("print");
        let t = gen.new_unnamed_temp();
        let mut instrs = Vec::new();
        X86Asm::munch_stm(
            Move(IrExp::Temp(t), Call(IrExp::Name(f), vec![IrExp::Const(7)])),
            &mut instrs,
            &mut gen,
        );
        let call = instrs
            .iter()
            .find(|i| matches!(i, Instr::Oper { assem, .. } if assem.starts_with("call")))
            .expect("no call emitted");
        let rax = gen.named_temp(x86_64::RAX);
        let r10 = gen.named_temp(x86_64::R10);
        assert!(call.dests().contains(&rax));
        assert!(call.dests().contains(&r10));
        // the value is kept by a post-move from %rax.
        assert!(matches!(
            instrs.last().unwrap(),
            Instr::Move { dst, src, .. } if *dst == t && *src == rax
        ));
    }
}
