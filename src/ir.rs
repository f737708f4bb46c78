//! The tree intermediate language every backend stage manipulates.

use crate::temp;
use strum_macros::Display;

#[derive(Hash, Eq, PartialEq, Debug, Clone)]
pub enum IrExp {
    Const(i64),
    Name(temp::Label),
    Temp(temp::Temp),
    Binop(IrBinop, Box<IrExp>, Box<IrExp>),
    Mem(Box<IrExp>),
    Call(Box<IrExp>, Vec<IrExp>),
    Eseq(Box<IrStm>, Box<IrExp>),
}

#[derive(Hash, Eq, PartialEq, Debug, Clone)]
pub enum IrStm {
    Move(Box<IrExp>, Box<IrExp>),
    Exp(Box<IrExp>),
    Jump(Box<IrExp>, Vec<temp::Label>),
    Cjump(IrRelop, Box<IrExp>, Box<IrExp>, temp::Label, temp::Label),
    Seq(Box<IrStm>, Box<IrStm>),
    Label(temp::Label),
}

#[derive(Display, Hash, Eq, PartialEq, Debug, Copy, Clone)]
pub enum IrBinop {
    Plus,
    Minus,
    Mul,
    Div,
    And,
    Or,
    Lshift,
    Rshift,
    ArShift,
    Xor,
}

#[derive(Display, Hash, Eq, PartialEq, Debug, Copy, Clone)]
pub enum IrRelop {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IrRelop {
    /// The relop with operands kept but branch sense flipped, so that
    /// `Cjump(op, a, b, t, f)` and `Cjump(op.negate(), a, b, f, t)` branch
    /// identically.
    pub fn negate(&self) -> IrRelop {
        use IrRelop::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Gt => Le,
            Le => Gt,
            Ge => Lt,
            Ult => Uge,
            Ule => Ugt,
            Ugt => Ule,
            Uge => Ult,
        }
    }
}

/// Constructor helpers that hide the `Box::new` noise. Names mirror the enum
/// variants (hence the pascal case) so construction sites read like the tree
/// they build.
#[allow(non_snake_case)]
pub mod helpers {
    use super::*;

    #[inline]
    pub fn Binop(r: IrBinop, a: IrExp, b: IrExp) -> IrExp {
        IrExp::Binop(r, Box::new(a), Box::new(b))
    }

    #[inline]
    pub fn Mem(e: IrExp) -> IrExp {
        IrExp::Mem(Box::new(e))
    }

    #[inline]
    pub fn Call(f: IrExp, args: Vec<IrExp>) -> IrExp {
        IrExp::Call(Box::new(f), args)
    }

    #[inline]
    pub fn Eseq(s: IrStm, e: IrExp) -> IrExp {
        IrExp::Eseq(Box::new(s), Box::new(e))
    }

    #[inline]
    pub fn Move(dst: IrExp, src: IrExp) -> IrStm {
        IrStm::Move(Box::new(dst), Box::new(src))
    }

    #[inline]
    pub fn Exp(e: IrExp) -> IrStm {
        IrStm::Exp(Box::new(e))
    }

    #[inline]
    pub fn Jump(e: IrExp, l: Vec<temp::Label>) -> IrStm {
        IrStm::Jump(Box::new(e), l)
    }

    #[inline]
    pub fn Cjump(r: IrRelop, a: IrExp, b: IrExp, t: temp::Label, f: temp::Label) -> IrStm {
        IrStm::Cjump(r, Box::new(a), Box::new(b), t, f)
    }

    #[inline]
    pub fn Seq(a: IrStm, b: IrStm) -> IrStm {
        IrStm::Seq(Box::new(a), Box::new(b))
    }
}
