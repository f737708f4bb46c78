pub mod x86_64;

use crate::{
    frame::FrameRef,
    ir::{IrExp, IrStm},
    temp::{self, TempMap, Uuids},
};

#[derive(Debug, Clone)]
pub struct Src(pub Vec<temp::Temp>);

#[derive(Debug, Clone)]
pub struct Dst(pub Vec<temp::Temp>);

impl Dst {
    pub fn empty() -> Self {
        Dst(vec![])
    }
}

impl Src {
    pub fn empty() -> Self {
        Src(vec![])
    }
}

/// An abstract target instruction over virtual registers.
///
/// `assem` is a template. `'S<i>` and `'D<i>` are holes for the i-th source
/// and destination register, `'J<i>` for the i-th jump target, `'L` for a
/// label instruction's own label. Unnamed labels expand to their bare id (the
/// local-label `.L` prefix lives in the template), named labels to their
/// symbol text.
#[derive(Debug, Clone)]
pub enum Instr {
    Oper {
        assem: String,
        // registers written by the instruction, implicit clobbers included.
        dst: Dst,
        // registers read; includes dependencies that never show up in the
        // template text, e.g. argument registers at a call.
        src: Src,
        jump: Vec<temp::Label>,
    },
    Label {
        assem: String,
        lab: temp::Label,
    },
    /// A register-to-register copy; the allocator may coalesce it away.
    Move {
        assem: String,
        dst: temp::Temp,
        src: temp::Temp,
    },
}

impl Instr {
    pub fn sources(&self) -> Vec<temp::Temp> {
        match self {
            Instr::Oper { src, .. } => src.0.clone(),
            Instr::Move { src, .. } => vec![*src],
            Instr::Label { .. } => vec![],
        }
    }

    pub fn dests(&self) -> Vec<temp::Temp> {
        match self {
            Instr::Oper { dst, .. } => dst.0.clone(),
            Instr::Move { dst, .. } => vec![*dst],
            Instr::Label { .. } => vec![],
        }
    }

    pub fn jumps(&self) -> &[temp::Label] {
        match self {
            Instr::Oper { jump, .. } => jump,
            _ => &[],
        }
    }

    pub fn label(&self) -> Option<temp::Label> {
        match self {
            Instr::Label { lab, .. } => Some(*lab),
            _ => None,
        }
    }

    /// Substitutes the template holes with physical register names from `tm`
    /// and label text from `gen`. Every temp the instruction mentions must be
    /// in `tm` by the time this is called.
    pub fn format(&self, tm: &TempMap, gen: &dyn Uuids) -> String {
        let (assem, srcs, dsts, jumps, lab): (&str, Vec<temp::Temp>, Vec<temp::Temp>, &[temp::Label], Option<temp::Label>) =
            match self {
                Instr::Oper {
                    assem,
                    dst,
                    src,
                    jump,
                } => (
                    assem.as_str(),
                    src.0.clone(),
                    dst.0.clone(),
                    jump.as_slice(),
                    None,
                ),
                Instr::Label { assem, lab } => (assem.as_str(), vec![], vec![], &[], Some(*lab)),
                Instr::Move { assem, dst, src } => {
                    (assem.as_str(), vec![*src], vec![*dst], &[], None)
                }
            };

        let reg_name = |t: &temp::Temp| -> &'static str {
            *tm.get(t)
                .unwrap_or_else(|| panic!("impl bug: temp {:?} missing from register map", t))
        };
        let label_text = |l: &temp::Label| -> String {
            match l {
                temp::Label::Unnamed(id) => format!("{}", id),
                temp::Label::Named(..) => l.resolve_named(gen).to_string(),
            }
        };

        let mut out = String::with_capacity(assem.len());
        let mut chars = assem.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\'' {
                out.push(c);
                continue;
            }
            let kind = chars
                .next()
                .expect("impl bug: dangling quote in assem template");
            let mut idx = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                idx = idx * 10 + d as usize;
                chars.next();
            }
            match kind {
                'S' => out.push_str(reg_name(&srcs[idx])),
                'D' => out.push_str(reg_name(&dsts[idx])),
                'J' => out.push_str(&label_text(&jumps[idx])),
                'L' => out.push_str(&label_text(
                    &lab.expect("impl bug: 'L hole outside a label instruction"),
                )),
                other => panic!("impl bug: unknown assem template hole '{}", other),
            }
        }
        out
    }
}

/// Instruction selection for one target: maximal-munch tiling of canonical
/// IR statements.
pub trait Codegen {
    /// Emits the abstract assembly for one canonical statement.
    fn munch_stm(stm: IrStm, result: &mut Vec<Instr>, gen: &mut dyn Uuids);

    /// Emits code computing `exp` and returns the temp holding its value.
    fn munch_exp(exp: IrExp, result: &mut Vec<Instr>, gen: &mut dyn Uuids) -> temp::Temp;

    /// Tiles a whole procedure body (one canonical statement at a time).
    fn code_gen_frame(frame: FrameRef, stm: IrStm, instrs: &mut Vec<Instr>, gen: &mut dyn Uuids);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::{test_helpers, UuidsImpl};

    #[test]
    fn format_substitutes_sources_and_dests() {
        let mut gen: UuidsImpl = Uuids::new();
        let tm = gen.to_temp_map(&["rax", "rbx"]);
        let rax = gen.named_temp("rax");
        let rbx = gen.named_temp("rbx");
        let instr = Instr::Oper {
            assem: "addq %'S0, %'D0".into(),
            dst: Dst(vec![rbx]),
            src: Src(vec![rax, rbx]),
            jump: vec![],
        };
        assert_eq!("addq %rax, %rbx", instr.format(&tm, &gen));
    }

    #[test]
    fn format_substitutes_unnamed_jump_targets() {
        let gen: UuidsImpl = Uuids::new();
        let tm = TempMap::new();
        let l = test_helpers::new_unnamed_label(7);
        let instr = Instr::Oper {
            assem: "jmp .L'J0".into(),
            dst: Dst::empty(),
            src: Src::empty(),
            jump: vec![l],
        };
        assert_eq!("jmp .L7", instr.format(&tm, &gen));
    }

    #[test]
    fn format_move_uses_bare_holes() {
        let mut gen: UuidsImpl = Uuids::new();
        let tm = gen.to_temp_map(&["rcx", "rdx"]);
        let instr = Instr::Move {
            assem: "movq %'S, %'D".into(),
            dst: gen.named_temp("rdx"),
            src: gen.named_temp("rcx"),
        };
        assert_eq!("movq %rcx, %rdx", instr.format(&tm, &gen));
    }
}
