pub mod x86_64;

use crate::{
    assem::Instr,
    ir::{helpers::*, IrBinop, IrExp, IrStm},
    temp::{self, Label, Temp, Uuids},
};

use std::{cell::RefCell, fmt::Debug, rc::Rc};

pub type FrameRef = Rc<RefCell<dyn Frame>>;

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Access {
    /// Lives at frame_pointer + offset.
    InFrame(i32),
    /// Lives in a virtual register; only possible for non-escaping variables.
    InReg(Temp),
}

impl Access {
    /// The expression reading this access, given the address of the frame it
    /// belongs to. Register accesses ignore the frame address: a variable in
    /// a register can only ever be touched from its own level.
    pub fn exp(&self, frame_ptr: IrExp) -> IrExp {
        match self {
            Access::InFrame(offset) => Mem(Binop(
                IrBinop::Plus,
                frame_ptr,
                IrExp::Const(*offset as i64),
            )),
            Access::InReg(t) => IrExp::Temp(*t),
        }
    }
}

pub type Escapes = bool;

pub type Register = &'static str;

pub type Prologue = String;
pub type Epilogue = String;

/// The target-specific activation record. One implementation per target;
/// everything the rest of the backend knows about the machine flows through
/// this trait.
pub trait Frame: Debug {
    fn new(name: Label, formals: Vec<Escapes>, gen: &mut dyn Uuids) -> Self
    where
        Self: Sized;

    fn name(&self) -> Label;

    /// All formals, the static link included as the first entry.
    fn formals(&self) -> &[Access];

    fn alloc_local(&mut self, escapes: Escapes, gen: &mut dyn Uuids) -> Access;

    /// A call to a runtime routine known by name (initArray, stringEqual, ...).
    fn external_call(gen: &mut dyn Uuids, name: &str, args: Vec<IrExp>) -> IrExp
    where
        Self: Sized;

    fn word_size() -> usize
    where
        Self: Sized;

    /// Every machine register, in color-numbering order.
    fn registers() -> &'static [Register]
    where
        Self: Sized;

    /// The registers the allocator may assign; excludes the stack and frame
    /// pointers.
    fn allocatable_registers() -> &'static [Register]
    where
        Self: Sized;

    fn temp_map(gen: &mut dyn Uuids) -> temp::TempMap
    where
        Self: Sized;

    fn frame_pointer(gen: &mut dyn Uuids) -> Temp
    where
        Self: Sized;

    fn return_value(gen: &mut dyn Uuids) -> Temp
    where
        Self: Sized;

    /// Data-section lines for one string literal: label, length word, bytes.
    fn string(label: Label, val: &str) -> Vec<String>
    where
        Self: Sized;

    /// Wraps a procedure body with the view shift (formals moved from their
    /// argument-passing locations) and callee-save save/restore moves that
    /// the allocator is free to coalesce away.
    fn proc_entry_exit1(&mut self, body: IrStm, gen: &mut dyn Uuids) -> IrStm;

    /// Appends the sink instruction marking the registers live at procedure
    /// exit, so the allocator keeps them live through the body.
    fn proc_entry_exit2(&self, instrs: &mut Vec<Instr>, gen: &mut dyn Uuids);

    /// The textual prologue and epilogue. Called after register allocation,
    /// when the frame size (spill slots included) is final.
    fn proc_entry_exit3(&self, gen: &dyn Uuids) -> (Prologue, Epilogue);

    /// Load a spilled value from its frame slot into `dst`. Used by the
    /// allocator's rewrite pass, which stays target-generic this way.
    fn spill_load(&self, access: &Access, dst: Temp, gen: &mut dyn Uuids) -> Instr;

    /// Store `src` into a spilled value's frame slot.
    fn spill_store(&self, access: &Access, src: Temp, gen: &mut dyn Uuids) -> Instr;
}

#[derive(Debug)]
pub enum Frag {
    Proc {
        /// The output of proc_entry_exit1.
        body: IrStm,
        frame: FrameRef,
    },
    String(Label, String),
}
