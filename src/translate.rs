//! Translation of the typed AST into tree-IR fragments.
//!
//! A `Level` wraps a frame with its lexical parent so non-local variable
//! accesses can chase static links. Every lowered expression is one of three
//! shapes (`Ex`/`Nx`/`Cx`); the conversions between them are where booleans
//! get materialized and conditions get wired to labels.

use crate::{
    ast::{Dec, Exp, Oper, Var},
    frame,
    frame::{Frag, Frame, FrameRef},
    ir::{helpers::*, IrBinop, IrExp, IrRelop, IrStm},
    symtab::SymbolTable,
    temp::{Label, Uuids},
};

use std::cell::RefCell;
use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::rc::Rc;

/// A lexical level: a frame plus the level it is nested in. Identity (the
/// `id`) is what distinguishes two levels, never structure.
#[derive(Debug)]
pub struct Level {
    pub parent: Option<Rc<Level>>,
    pub frame: FrameRef,
    id: NonZeroUsize,
}

impl PartialEq for Level {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Level {}

/// Where a variable lives: the level that defined it, and its slot within
/// that level's frame.
#[derive(Clone, Debug)]
pub struct Access(pub Rc<Level>, pub frame::Access);

// level identity comes from the same uuid supply as everything else.
fn fresh_level_id(gen: &mut dyn Uuids) -> NonZeroUsize {
    match gen.new_unnamed_label() {
        Label::Unnamed(id) => id,
        Label::Named(..) => unreachable!(),
    }
}

impl Level {
    /// The level of the whole program: no parent, a frame named `main` with
    /// no formals (there is nothing above it to link to).
    pub fn outermost<F: Frame + 'static>(gen: &mut dyn Uuids) -> Rc<Level> {
        let name = gen.named_label("main");
        let id = fresh_level_id(gen);
        Rc::new(Level {
            parent: None,
            frame: Rc::new(RefCell::new(F::new(name, Vec::new(), gen))),
            id,
        })
    }

    /// A function's level. The static link is a synthetic first formal that
    /// always escapes.
    pub fn new_level<F: Frame + 'static>(
        parent: &Rc<Level>,
        name: Label,
        mut escapes: Vec<bool>,
        gen: &mut dyn Uuids,
    ) -> Rc<Level> {
        escapes.insert(0, true);
        let id = fresh_level_id(gen);
        Rc::new(Level {
            parent: Some(Rc::clone(parent)),
            frame: Rc::new(RefCell::new(F::new(name, escapes, gen))),
            id,
        })
    }

    /// The user-visible formals: the static link is elided.
    pub fn formals(level: &Rc<Level>) -> Vec<Access> {
        let skip = if level.parent.is_some() { 1 } else { 0 };
        level
            .frame
            .borrow()
            .formals()
            .iter()
            .skip(skip)
            .map(|a| Access(Rc::clone(level), a.clone()))
            .collect()
    }

    pub fn alloc_local(level: &Rc<Level>, escape: bool, gen: &mut dyn Uuids) -> Access {
        let access = level.frame.borrow_mut().alloc_local(escape, gen);
        Access(Rc::clone(level), access)
    }

    fn static_link(&self) -> frame::Access {
        self.frame
            .borrow()
            .formals()
            .first()
            .cloned()
            .unwrap_or_else(|| panic!("impl bug: level {:?} has no static link", self.id))
    }
}

/// A lowered expression: yields a value (`Ex`), is a pure statement (`Nx`),
/// or is a conditional waiting for its branch targets (`Cx`).
pub enum TrExp {
    Ex(IrExp),
    Nx(IrStm),
    Cx(CxFn),
}

pub type CxFn = Box<dyn FnOnce(Label, Label) -> IrStm>;

impl Debug for TrExp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrExp::Ex(e) => write!(f, "Ex({:?})", e),
            TrExp::Nx(s) => write!(f, "Nx({:?})", s),
            TrExp::Cx(..) => write!(f, "Cx(..)"),
        }
    }
}

pub fn make_seq(mut stms: Vec<IrStm>) -> IrStm {
    match stms.len() {
        0 => Exp(IrExp::Const(0)),
        1 => stms.pop().unwrap(),
        _ => {
            let last = stms.pop().unwrap();
            stms.into_iter().rev().fold(last, |acc, s| Seq(s, acc))
        }
    }
}

pub fn un_ex(tr: TrExp, gen: &mut dyn Uuids) -> IrExp {
    match tr {
        TrExp::Ex(e) => e,
        TrExp::Cx(k) => {
            let r = gen.new_unnamed_temp();
            let t = gen.new_unnamed_label();
            let f = gen.new_unnamed_label();
            Eseq(
                make_seq(vec![
                    Move(IrExp::Temp(r), IrExp::Const(1)),
                    k(t, f),
                    IrStm::Label(f),
                    Move(IrExp::Temp(r), IrExp::Const(0)),
                    IrStm::Label(t),
                ]),
                IrExp::Temp(r),
            )
        }
        TrExp::Nx(s) => panic!("impl bug: un_ex of statement {:?}", s),
    }
}

pub fn un_nx(tr: TrExp, gen: &mut dyn Uuids) -> IrStm {
    match tr {
        TrExp::Ex(e) => Exp(e),
        TrExp::Nx(s) => s,
        TrExp::Cx(k) => {
            // evaluate the condition for effect; both branches land on the
            // same label.
            let l = gen.new_unnamed_label();
            Seq(k(l, l), IrStm::Label(l))
        }
    }
}

pub fn un_cx(tr: TrExp) -> CxFn {
    match tr {
        TrExp::Ex(IrExp::Const(0)) => Box::new(|_t, f| Jump(IrExp::Name(f), vec![f])),
        TrExp::Ex(IrExp::Const(_)) => Box::new(|t, _f| Jump(IrExp::Name(t), vec![t])),
        TrExp::Ex(e) => Box::new(move |t, f| Cjump(IrRelop::Ne, e, IrExp::Const(0), t, f)),
        TrExp::Cx(k) => k,
        TrExp::Nx(s) => panic!("impl bug: un_cx of statement {:?}", s),
    }
}

// ---------------------------------------------------------------- constructors

pub fn int_exp(i: i64) -> TrExp {
    TrExp::Ex(IrExp::Const(i))
}

/// `nil` is the null pointer.
pub fn nil_exp() -> TrExp {
    TrExp::Ex(IrExp::Const(0))
}

pub fn string_exp(s: &str, frags: &mut Vec<Frag>, gen: &mut dyn Uuids) -> TrExp {
    let label = gen.new_unnamed_label();
    frags.push(Frag::String(label, s.to_string()));
    TrExp::Ex(IrExp::Name(label))
}

fn relop_of(op: Oper) -> IrRelop {
    match op {
        Oper::Eq => IrRelop::Eq,
        Oper::Neq => IrRelop::Ne,
        Oper::Lt => IrRelop::Lt,
        Oper::Le => IrRelop::Le,
        Oper::Gt => IrRelop::Gt,
        Oper::Ge => IrRelop::Ge,
        _ => panic!("impl bug: {} is not a comparison", op),
    }
}

pub fn binop(op: Oper, lhs: TrExp, rhs: TrExp, gen: &mut dyn Uuids) -> TrExp {
    let l = un_ex(lhs, gen);
    let r = un_ex(rhs, gen);
    match op {
        Oper::Plus => TrExp::Ex(Binop(IrBinop::Plus, l, r)),
        Oper::Minus => TrExp::Ex(Binop(IrBinop::Minus, l, r)),
        Oper::Times => TrExp::Ex(Binop(IrBinop::Mul, l, r)),
        Oper::Divide => TrExp::Ex(Binop(IrBinop::Div, l, r)),
        cmp => {
            let rel = relop_of(cmp);
            TrExp::Cx(Box::new(move |t, f| Cjump(rel, l, r, t, f)))
        }
    }
}

/// String comparisons go through the runtime: `stringEqual` for (in)equality,
/// `stringCompare` (three-way) for the ordered operators.
pub fn string_cmp<F: Frame + 'static>(
    op: Oper,
    lhs: TrExp,
    rhs: TrExp,
    gen: &mut dyn Uuids,
) -> TrExp {
    let l = un_ex(lhs, gen);
    let r = un_ex(rhs, gen);
    match op {
        Oper::Eq | Oper::Neq => {
            let call = F::external_call(gen, "stringEqual", vec![l, r]);
            let want = if op == Oper::Eq { 1 } else { 0 };
            TrExp::Cx(Box::new(move |t, f| {
                Cjump(IrRelop::Eq, call, IrExp::Const(want), t, f)
            }))
        }
        cmp => {
            let rel = relop_of(cmp);
            let call = F::external_call(gen, "stringCompare", vec![l, r]);
            TrExp::Cx(Box::new(move |t, f| {
                Cjump(rel, call, IrExp::Const(0), t, f)
            }))
        }
    }
}

/// Reads a variable from wherever it lives. If the use is in a nested
/// function, the chain of static links from the use level up to the defining
/// level is folded into one address expression.
pub fn simple_var<F: Frame + 'static>(
    access: &Access,
    use_level: &Rc<Level>,
    gen: &mut dyn Uuids,
) -> TrExp {
    let mut addr = IrExp::Temp(F::frame_pointer(gen));
    let mut cur = Rc::clone(use_level);
    while *cur != *access.0 {
        addr = cur.static_link().exp(addr);
        cur = match cur.parent {
            Some(ref p) => Rc::clone(p),
            None => panic!("impl bug: variable defined on no enclosing level"),
        };
    }
    TrExp::Ex(access.1.exp(addr))
}

pub fn field_var<F: Frame + 'static>(record: TrExp, index: usize, gen: &mut dyn Uuids) -> TrExp {
    let base = un_ex(record, gen);
    TrExp::Ex(Mem(Binop(
        IrBinop::Plus,
        base,
        IrExp::Const((index * F::word_size()) as i64),
    )))
}

pub fn subscript_var<F: Frame + 'static>(arr: TrExp, index: TrExp, gen: &mut dyn Uuids) -> TrExp {
    let base = un_ex(arr, gen);
    let idx = un_ex(index, gen);
    TrExp::Ex(Mem(Binop(
        IrBinop::Plus,
        base,
        Binop(IrBinop::Mul, idx, IrExp::Const(F::word_size() as i64)),
    )))
}

/// A call to a Tiger function. The static link — the frame pointer of the
/// level the callee is declared under — is passed as a hidden first
/// argument, computed by walking up from the caller's level.
pub fn call_exp<F: Frame + 'static>(
    label: Label,
    caller: &Rc<Level>,
    callee: &Rc<Level>,
    args: Vec<IrExp>,
    gen: &mut dyn Uuids,
) -> TrExp {
    let dest = callee
        .parent
        .as_ref()
        .map(Rc::clone)
        .unwrap_or_else(|| panic!("impl bug: calling the outermost level"));
    let mut link = IrExp::Temp(F::frame_pointer(gen));
    let mut cur = Rc::clone(caller);
    while *cur != *dest {
        link = cur.static_link().exp(link);
        cur = match cur.parent {
            Some(ref p) => Rc::clone(p),
            None => panic!("impl bug: callee's parent not on caller's level chain"),
        };
    }
    let mut all_args = vec![link];
    all_args.extend(args);
    TrExp::Ex(Call(IrExp::Name(label), all_args))
}

/// A record constructor: allocate with the runtime, then store every field.
pub fn record_exp<F: Frame + 'static>(fields: Vec<IrExp>, gen: &mut dyn Uuids) -> TrExp {
    let ws = F::word_size();
    let r = gen.new_unnamed_temp();
    let mut stms = vec![Move(
        IrExp::Temp(r),
        F::external_call(gen, "initRecord", vec![IrExp::Const((fields.len() * ws) as i64)]),
    )];
    for (i, init) in fields.into_iter().enumerate() {
        stms.push(Move(
            Mem(Binop(
                IrBinop::Plus,
                IrExp::Temp(r),
                IrExp::Const((i * ws) as i64),
            )),
            init,
        ));
    }
    TrExp::Ex(Eseq(make_seq(stms), IrExp::Temp(r)))
}

pub fn array_exp<F: Frame + 'static>(size: IrExp, init: IrExp, gen: &mut dyn Uuids) -> TrExp {
    TrExp::Ex(F::external_call(gen, "initArray", vec![size, init]))
}

pub fn assignment(dst: TrExp, src: TrExp, gen: &mut dyn Uuids) -> TrExp {
    let d = un_ex(dst, gen);
    let s = un_ex(src, gen);
    TrExp::Nx(Move(d, s))
}

/// A sequence keeps the shape of its last expression: all-statement
/// sequences stay statements, value-tailed sequences become `Eseq`s.
pub fn seq_exp(mut exps: Vec<TrExp>, gen: &mut dyn Uuids) -> TrExp {
    match exps.len() {
        0 => TrExp::Nx(Exp(IrExp::Const(0))),
        1 => exps.pop().unwrap(),
        _ => {
            let last = exps.pop().unwrap();
            let stms: Vec<IrStm> = exps.into_iter().map(|e| un_nx(e, gen)).collect();
            match last {
                TrExp::Nx(s) => {
                    let mut all = stms;
                    all.push(s);
                    TrExp::Nx(make_seq(all))
                }
                value => {
                    let tail = un_ex(value, gen);
                    TrExp::Ex(Eseq(make_seq(stms), tail))
                }
            }
        }
    }
}

pub fn if_exp(test: TrExp, then_tr: TrExp, else_tr: Option<TrExp>, gen: &mut dyn Uuids) -> TrExp {
    let cond = un_cx(test);
    match else_tr {
        None => {
            let t = gen.new_unnamed_label();
            let done = gen.new_unnamed_label();
            let then_stm = un_nx(then_tr, gen);
            TrExp::Nx(make_seq(vec![
                cond(t, done),
                IrStm::Label(t),
                then_stm,
                IrStm::Label(done),
            ]))
        }
        Some(else_tr) => {
            let t = gen.new_unnamed_label();
            let f = gen.new_unnamed_label();
            let done = gen.new_unnamed_label();
            // a statement arm means the whole conditional is a statement.
            if matches!(then_tr, TrExp::Nx(..)) || matches!(else_tr, TrExp::Nx(..)) {
                let then_stm = un_nx(then_tr, gen);
                let else_stm = un_nx(else_tr, gen);
                TrExp::Nx(make_seq(vec![
                    cond(t, f),
                    IrStm::Label(t),
                    then_stm,
                    Jump(IrExp::Name(done), vec![done]),
                    IrStm::Label(f),
                    else_stm,
                    IrStm::Label(done),
                ]))
            } else {
                let r = gen.new_unnamed_temp();
                let then_e = un_ex(then_tr, gen);
                let else_e = un_ex(else_tr, gen);
                TrExp::Ex(Eseq(
                    make_seq(vec![
                        cond(t, f),
                        IrStm::Label(t),
                        Move(IrExp::Temp(r), then_e),
                        Jump(IrExp::Name(done), vec![done]),
                        IrStm::Label(f),
                        Move(IrExp::Temp(r), else_e),
                        IrStm::Label(done),
                    ]),
                    IrExp::Temp(r),
                ))
            }
        }
    }
}

pub fn while_exp(test: TrExp, body: TrExp, done: Label, gen: &mut dyn Uuids) -> TrExp {
    let test_l = gen.new_unnamed_label();
    let body_l = gen.new_unnamed_label();
    let cond = un_cx(test);
    let body_stm = un_nx(body, gen);
    TrExp::Nx(make_seq(vec![
        IrStm::Label(test_l),
        cond(body_l, done),
        IrStm::Label(body_l),
        body_stm,
        Jump(IrExp::Name(test_l), vec![test_l]),
        IrStm::Label(done),
    ]))
}

/// `for` runs its body with the loop variable stepping from lo to hi
/// inclusive; the extra test before the increment keeps `hi = maxint` from
/// wrapping around.
pub fn for_exp(
    var: IrExp,
    lo: IrExp,
    hi: IrExp,
    body: IrStm,
    done: Label,
    gen: &mut dyn Uuids,
) -> TrExp {
    let limit = gen.new_unnamed_temp();
    let body_l = gen.new_unnamed_label();
    let incr_l = gen.new_unnamed_label();
    TrExp::Nx(make_seq(vec![
        Move(var.clone(), lo),
        Move(IrExp::Temp(limit), hi),
        Cjump(IrRelop::Le, var.clone(), IrExp::Temp(limit), body_l, done),
        IrStm::Label(body_l),
        body,
        Cjump(IrRelop::Lt, var.clone(), IrExp::Temp(limit), incr_l, done),
        IrStm::Label(incr_l),
        Move(
            var.clone(),
            Binop(IrBinop::Plus, var, IrExp::Const(1)),
        ),
        Jump(IrExp::Name(body_l), vec![body_l]),
        IrStm::Label(done),
    ]))
}

pub fn break_exp(done: Label) -> TrExp {
    TrExp::Nx(Jump(IrExp::Name(done), vec![done]))
}

pub fn let_exp(dec_stms: Vec<IrStm>, body: TrExp, gen: &mut dyn Uuids) -> TrExp {
    if dec_stms.is_empty() {
        return body;
    }
    match body {
        TrExp::Nx(s) => {
            let mut all = dec_stms;
            all.push(s);
            TrExp::Nx(make_seq(all))
        }
        value => {
            let tail = un_ex(value, gen);
            TrExp::Ex(Eseq(make_seq(dec_stms), tail))
        }
    }
}

/// The initializing move of a `var` declaration, addressed through the
/// declaring level's own frame pointer.
pub fn var_dec_assignment<F: Frame + 'static>(
    access: &Access,
    init: IrExp,
    gen: &mut dyn Uuids,
) -> IrStm {
    let fp = IrExp::Temp(F::frame_pointer(gen));
    Move(access.1.exp(fp), init)
}

/// Stage 1 of the entry/exit pipeline: move the result into the return-value
/// register, let the frame add its view shift and callee-save shuffle, then
/// remember the finished body as a fragment.
pub fn proc_entry_exit<F: Frame + 'static>(
    has_return_value: bool,
    level: &Rc<Level>,
    body: TrExp,
    frags: &mut Vec<Frag>,
    gen: &mut dyn Uuids,
) {
    let body_stm = if has_return_value {
        let rv = F::return_value(gen);
        Move(IrExp::Temp(rv), un_ex(body, gen))
    } else {
        un_nx(body, gen)
    };
    let wrapped = level.frame.borrow_mut().proc_entry_exit1(body_stm, gen);
    frags.push(Frag::Proc {
        body: wrapped,
        frame: Rc::clone(&level.frame),
    });
}

// ----------------------------------------------------------------- the walker

#[derive(Clone)]
enum EnvEntry {
    Var {
        access: Access,
    },
    Fun {
        level: Rc<Level>,
        label: Label,
    },
    /// Runtime-provided function: no level, no static link.
    ExternalFun {
        label: Label,
    },
}

/// The ten standard-library functions every Tiger program may call.
const BUILTINS: &[&str] = &[
    "print",
    "flush",
    "getChar",
    "ord",
    "chr",
    "size",
    "substring",
    "concat",
    "not",
    "exit",
];

struct Context<'a> {
    gen: &'a mut dyn Uuids,
    env: SymbolTable<EnvEntry>,
    frags: Vec<Frag>,
}

impl<'a> Context<'a> {
    fn new(gen: &'a mut dyn Uuids) -> Self {
        let mut env = SymbolTable::empty();
        env.begin_scope();
        for name in BUILTINS {
            let sym = gen.intern(name);
            let label = gen.named_label(name);
            env.enter(sym, EnvEntry::ExternalFun { label });
        }
        Self {
            gen,
            env,
            frags: Vec::new(),
        }
    }
}

/// Translates a whole type-checked program into fragments: one `Proc` per
/// function plus one for the `main` wrapper, and one `String` per literal.
pub fn program<F: Frame + 'static>(ast: &Exp, gen: &mut dyn Uuids) -> Vec<Frag> {
    let mut ctx = Context::new(gen);
    let main_level = Level::outermost::<F>(ctx.gen);
    let body = trans_exp::<F>(&mut ctx, &main_level, ast, None);
    let has_return_value = !matches!(body, TrExp::Nx(..));
    proc_entry_exit::<F>(has_return_value, &main_level, body, &mut ctx.frags, ctx.gen);
    ctx.frags
}

fn trans_exp<F: Frame + 'static>(
    ctx: &mut Context,
    level: &Rc<Level>,
    exp: &Exp,
    break_label: Option<Label>,
) -> TrExp {
    match exp {
        Exp::Int(i) => int_exp(*i),
        Exp::Nil => nil_exp(),
        Exp::Str(s) => string_exp(s, &mut ctx.frags, ctx.gen),
        Exp::Var(v) => trans_var::<F>(ctx, level, v, break_label),
        Exp::Op {
            left,
            oper,
            right,
            strings,
        } => {
            let l = trans_exp::<F>(ctx, level, left, break_label);
            let r = trans_exp::<F>(ctx, level, right, break_label);
            if *strings {
                debug_assert!(oper.is_comparison());
                string_cmp::<F>(*oper, l, r, ctx.gen)
            } else {
                binop(*oper, l, r, ctx.gen)
            }
        }
        Exp::Call { func, args } => {
            let arg_irs: Vec<IrExp> = args
                .iter()
                .map(|a| {
                    let tr = trans_exp::<F>(ctx, level, a, break_label);
                    un_ex(tr, ctx.gen)
                })
                .collect();
            let entry = ctx
                .env
                .look(*func)
                .cloned()
                .unwrap_or_else(|| panic!("impl bug: call to unbound function"));
            match entry {
                EnvEntry::ExternalFun { label } => {
                    TrExp::Ex(Call(IrExp::Name(label), arg_irs))
                }
                EnvEntry::Fun {
                    level: callee,
                    label,
                } => call_exp::<F>(label, level, &callee, arg_irs, ctx.gen),
                EnvEntry::Var { .. } => panic!("impl bug: call target bound to a variable"),
            }
        }
        Exp::Record { fields } => {
            let field_irs: Vec<IrExp> = fields
                .iter()
                .map(|f| {
                    let tr = trans_exp::<F>(ctx, level, f, break_label);
                    un_ex(tr, ctx.gen)
                })
                .collect();
            record_exp::<F>(field_irs, ctx.gen)
        }
        Exp::Array { size, init } => {
            let size_tr = trans_exp::<F>(ctx, level, size, break_label);
            let size_ir = un_ex(size_tr, ctx.gen);
            let init_tr = trans_exp::<F>(ctx, level, init, break_label);
            let init_ir = un_ex(init_tr, ctx.gen);
            array_exp::<F>(size_ir, init_ir, ctx.gen)
        }
        Exp::Seq(exps) => {
            let trs: Vec<TrExp> = exps
                .iter()
                .map(|e| trans_exp::<F>(ctx, level, e, break_label))
                .collect();
            seq_exp(trs, ctx.gen)
        }
        Exp::Assign { var, exp } => {
            let dst = trans_var::<F>(ctx, level, var, break_label);
            let src = trans_exp::<F>(ctx, level, exp, break_label);
            assignment(dst, src, ctx.gen)
        }
        Exp::If { test, then, els } => {
            let test_tr = trans_exp::<F>(ctx, level, test, break_label);
            let then_tr = trans_exp::<F>(ctx, level, then, break_label);
            let else_tr = els
                .as_ref()
                .map(|e| trans_exp::<F>(ctx, level, e, break_label));
            if_exp(test_tr, then_tr, else_tr, ctx.gen)
        }
        Exp::While { test, body } => {
            let done = ctx.gen.new_unnamed_label();
            let test_tr = trans_exp::<F>(ctx, level, test, break_label);
            let body_tr = trans_exp::<F>(ctx, level, body, Some(done));
            while_exp(test_tr, body_tr, done, ctx.gen)
        }
        Exp::For {
            var,
            escape,
            lo,
            hi,
            body,
        } => {
            let done = ctx.gen.new_unnamed_label();
            let lo_tr = trans_exp::<F>(ctx, level, lo, break_label);
            let lo_ir = un_ex(lo_tr, ctx.gen);
            let hi_tr = trans_exp::<F>(ctx, level, hi, break_label);
            let hi_ir = un_ex(hi_tr, ctx.gen);

            // the loop variable scopes over the body only.
            ctx.env.begin_scope();
            let access = Level::alloc_local(level, *escape, ctx.gen);
            ctx.env.enter(
                *var,
                EnvEntry::Var {
                    access: access.clone(),
                },
            );
            let var_ir = match simple_var::<F>(&access, level, ctx.gen) {
                TrExp::Ex(e) => e,
                _ => unreachable!(),
            };
            let body_tr = trans_exp::<F>(ctx, level, body, Some(done));
            let body_stm = un_nx(body_tr, ctx.gen);
            ctx.env.end_scope();

            for_exp(var_ir, lo_ir, hi_ir, body_stm, done, ctx.gen)
        }
        Exp::Break => match break_label {
            Some(done) => break_exp(done),
            None => panic!("impl bug: break outside any loop"),
        },
        Exp::Let { decs, body } => {
            ctx.env.begin_scope();
            let mut dec_stms = Vec::new();
            for dec in decs {
                trans_dec::<F>(ctx, level, dec, break_label, &mut dec_stms);
            }
            let body_tr = trans_exp::<F>(ctx, level, body, break_label);
            ctx.env.end_scope();
            let_exp(dec_stms, body_tr, ctx.gen)
        }
    }
}

fn trans_var<F: Frame + 'static>(
    ctx: &mut Context,
    level: &Rc<Level>,
    var: &Var,
    break_label: Option<Label>,
) -> TrExp {
    match var {
        Var::Simple(sym) => {
            let entry = ctx
                .env
                .look(*sym)
                .cloned()
                .unwrap_or_else(|| panic!("impl bug: use of unbound variable"));
            match entry {
                EnvEntry::Var { access } => simple_var::<F>(&access, level, ctx.gen),
                _ => panic!("impl bug: variable use bound to a function"),
            }
        }
        Var::Field(lvalue, index) => {
            let base = trans_var::<F>(ctx, level, lvalue, break_label);
            field_var::<F>(base, *index, ctx.gen)
        }
        Var::Subscript(lvalue, index) => {
            let base = trans_var::<F>(ctx, level, lvalue, break_label);
            let idx = trans_exp::<F>(ctx, level, index, break_label);
            subscript_var::<F>(base, idx, ctx.gen)
        }
    }
}

fn trans_dec<F: Frame + 'static>(
    ctx: &mut Context,
    level: &Rc<Level>,
    dec: &Dec,
    break_label: Option<Label>,
    dec_stms: &mut Vec<IrStm>,
) {
    match dec {
        Dec::Var { name, escape, init } => {
            let init_tr = trans_exp::<F>(ctx, level, init, break_label);
            let init_ir = un_ex(init_tr, ctx.gen);
            let access = Level::alloc_local(level, *escape, ctx.gen);
            ctx.env.enter(
                *name,
                EnvEntry::Var {
                    access: access.clone(),
                },
            );
            dec_stms.push(var_dec_assignment::<F>(&access, init_ir, ctx.gen));
        }
        Dec::Function(fundecs) => {
            // functions in one declaration block are mutually recursive, so
            // every header goes into the environment before any body is
            // translated.
            let mut levels = Vec::with_capacity(fundecs.len());
            for fundec in fundecs {
                let name = ctx
                    .gen
                    .resolve(&fundec.name)
                    .expect("impl bug: function name from foreign interner")
                    .to_string();
                let label = ctx.gen.named_label(&name);
                let escapes = fundec.params.iter().map(|p| p.escape).collect();
                let fun_level = Level::new_level::<F>(level, label, escapes, ctx.gen);
                ctx.env.enter(
                    fundec.name,
                    EnvEntry::Fun {
                        level: Rc::clone(&fun_level),
                        label,
                    },
                );
                levels.push(fun_level);
            }
            for (fundec, fun_level) in fundecs.iter().zip(levels) {
                ctx.env.begin_scope();
                for (param, access) in fundec.params.iter().zip(Level::formals(&fun_level)) {
                    ctx.env.enter(param.name, EnvEntry::Var { access });
                }
                // breaks do not cross function boundaries.
                let body_tr = trans_exp::<F>(ctx, &fun_level, &fundec.body, None);
                ctx.env.end_scope();
                proc_entry_exit::<F>(
                    fundec.returns_value,
                    &fun_level,
                    body_tr,
                    &mut ctx.frags,
                    ctx.gen,
                );
            }
        }
    }
}
