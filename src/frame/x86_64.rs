//! System V x86-64 frames.

use crate::{
    assem::{Dst, Instr, Src},
    frame::{Access, Epilogue, Escapes, Frame, Prologue, Register},
    ir::{helpers::*, IrExp, IrStm},
    temp,
    temp::{Label, Uuids},
    translate,
};

#[derive(Debug)]
pub struct X86_64Frame {
    name: Label,
    formals: Vec<Access>,
    // The view shift: moves putting each register-passed formal where the
    // body expects to find it. Built once at frame creation.
    formals_move: Option<IrStm>,
    num_locals: usize,
}

pub const RAX: &str = "rax";
pub const RBX: &str = "rbx";
pub const RCX: &str = "rcx";
pub const RDX: &str = "rdx";
pub const RSI: &str = "rsi";
pub const RDI: &str = "rdi";
pub const RBP: &str = "rbp";
pub const RSP: &str = "rsp";
pub const R8: &str = "r8";
pub const R9: &str = "r9";
pub const R10: &str = "r10";
pub const R11: &str = "r11";
pub const R12: &str = "r12";
pub const R13: &str = "r13";
pub const R14: &str = "r14";
pub const R15: &str = "r15";

pub const WORD_SIZE: usize = 8;

pub const ARG_REGS: &[&str] = &[RDI, RSI, RDX, RCX, R8, R9];

/// The stack and frame pointers; never handed out as colors.
pub const SPECIAL_REGS: &[&str] = &[RSP, RBP];

/// Callee saves the allocator can use, `rbp` excluded since the prologue
/// owns it.
pub const CALLEE_SAVES: &[&str] = &[RBX, R12, R13, R14, R15];

pub const CALLER_SAVES: &[&str] = &[RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

pub fn callee_saves(gen: &mut dyn Uuids) -> Vec<temp::Temp> {
    CALLEE_SAVES.iter().map(|r| gen.named_temp(r)).collect()
}

pub fn caller_saves(gen: &mut dyn Uuids) -> Vec<temp::Temp> {
    CALLER_SAVES.iter().map(|r| gen.named_temp(r)).collect()
}

pub fn arg_regs(gen: &mut dyn Uuids) -> Vec<temp::Temp> {
    ARG_REGS.iter().map(|r| gen.named_temp(r)).collect()
}

pub fn special_regs(gen: &mut dyn Uuids) -> Vec<temp::Temp> {
    SPECIAL_REGS.iter().map(|r| gen.named_temp(r)).collect()
}

impl X86_64Frame {
    fn next_local_offset(&mut self) -> i32 {
        self.num_locals += 1;
        -((self.num_locals * WORD_SIZE) as i32)
    }

    fn frame_size(&self) -> usize {
        // keep %rsp 16-byte aligned across calls.
        (self.num_locals * WORD_SIZE + 15) & !15
    }
}

impl Frame for X86_64Frame {
    fn new(name: Label, formals_escapes: Vec<Escapes>, gen: &mut dyn Uuids) -> Self {
        let mut this = Self {
            name,
            formals: Vec::with_capacity(formals_escapes.len()),
            formals_move: None,
            num_locals: 0,
        };
        for (i, escape) in formals_escapes.iter().enumerate() {
            if i < ARG_REGS.len() {
                // Passed in a register. An escaping formal still needs a
                // memory home, so it gets a slot and the view shift copies
                // the register into it.
                if *escape {
                    let offset = this.next_local_offset();
                    this.formals.push(Access::InFrame(offset));
                } else {
                    this.formals.push(Access::InReg(gen.new_unnamed_temp()));
                }
            } else {
                // Already on the stack, above the saved %rbp and the return
                // address.
                let offset = (2 + i - ARG_REGS.len()) * WORD_SIZE;
                this.formals.push(Access::InFrame(offset as i32));
            }
        }

        let fp = Self::frame_pointer(gen);
        let mut moves = Vec::new();
        for (i, access) in this.formals.iter().enumerate().take(ARG_REGS.len()) {
            moves.push(Move(
                access.exp(IrExp::Temp(fp)),
                IrExp::Temp(gen.named_temp(ARG_REGS[i])),
            ));
        }
        this.formals_move = if moves.is_empty() {
            None
        } else {
            Some(translate::make_seq(moves))
        };
        this
    }

    fn name(&self) -> Label {
        self.name
    }

    fn formals(&self) -> &[Access] {
        &self.formals
    }

    fn alloc_local(&mut self, escapes: Escapes, gen: &mut dyn Uuids) -> Access {
        if escapes {
            let offset = self.next_local_offset();
            Access::InFrame(offset)
        } else {
            Access::InReg(gen.new_unnamed_temp())
        }
    }

    fn external_call(gen: &mut dyn Uuids, name: &str, args: Vec<IrExp>) -> IrExp {
        Call(IrExp::Name(gen.named_label(name)), args)
    }

    fn word_size() -> usize {
        WORD_SIZE
    }

    fn registers() -> &'static [Register] {
        &[
            RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11, RBX, R12, R13, R14, R15, RSP, RBP,
        ]
    }

    fn allocatable_registers() -> &'static [Register] {
        // caller saves first so cheap short-lived temps take them; callee
        // saves only under pressure.
        &[
            RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11, RBX, R12, R13, R14, R15,
        ]
    }

    fn temp_map(gen: &mut dyn Uuids) -> temp::TempMap {
        gen.to_temp_map(Self::registers())
    }

    fn frame_pointer(gen: &mut dyn Uuids) -> temp::Temp {
        gen.named_temp(RBP)
    }

    fn return_value(gen: &mut dyn Uuids) -> temp::Temp {
        gen.named_temp(RAX)
    }

    fn string(label: Label, val: &str) -> Vec<String> {
        let id = match label {
            Label::Named(..) => panic!("impl bug: string literals get unnamed labels"),
            Label::Unnamed(id) => id,
        };
        assert!(val.is_ascii(), "tiger strings are ascii");
        let escaped = val.replace('\\', "\\\\").replace('"', "\\\"");
        vec![
            format!(".L{}:", id),
            format!("\t.quad {}", val.len()),
            format!("\t.ascii \"{}\"", escaped),
        ]
    }

    fn proc_entry_exit1(&mut self, body: IrStm, gen: &mut dyn Uuids) -> IrStm {
        // Save callee-save registers into fresh temps on entry and restore
        // them on exit. If the body leaves a register untouched the allocator
        // coalesces the pair into nothing.
        let saves: Vec<(temp::Temp, temp::Temp)> = CALLEE_SAVES
            .iter()
            .map(|name| (gen.new_unnamed_temp(), gen.named_temp(name)))
            .collect();

        let mut stms = Vec::new();
        if let Some(ref formals_move) = self.formals_move {
            stms.push(formals_move.clone());
        }
        for (fresh, reg) in &saves {
            stms.push(Move(IrExp::Temp(*fresh), IrExp::Temp(*reg)));
        }
        stms.push(body);
        for (fresh, reg) in &saves {
            stms.push(Move(IrExp::Temp(*reg), IrExp::Temp(*fresh)));
        }
        translate::make_seq(stms)
    }

    fn proc_entry_exit2(&self, instrs: &mut Vec<Instr>, gen: &mut dyn Uuids) {
        let mut live = callee_saves(gen);
        live.push(Self::return_value(gen));
        live.append(&mut special_regs(gen));
        instrs.push(Instr::Oper {
            assem: String::new(),
            dst: Dst::empty(),
            src: Src(live),
            jump: vec![],
        });
    }

    fn proc_entry_exit3(&self, gen: &dyn Uuids) -> (Prologue, Epilogue) {
        let function_name = self.name.resolve_named(gen);
        let mut prologue = format!(
            "\t.globl {}\n{}:\n\tpushq %rbp\n\tmovq %rsp, %rbp",
            function_name, function_name
        );
        let frame_size = self.frame_size();
        if frame_size > 0 {
            prologue.push_str(&format!("\n\tsubq ${}, %rsp", frame_size));
        }
        let epilogue = "\tleave\n\tret".to_string();
        (prologue, epilogue)
    }

    fn spill_load(&self, access: &Access, dst: temp::Temp, gen: &mut dyn Uuids) -> Instr {
        let offset = match access {
            Access::InFrame(offset) => *offset,
            Access::InReg(..) => panic!("impl bug: spill slots live in the frame"),
        };
        let fp = Self::frame_pointer(gen);
        Instr::Oper {
            assem: format!("movq {}(%'S0), %'D0", offset),
            dst: Dst(vec![dst]),
            src: Src(vec![fp]),
            jump: vec![],
        }
    }

    fn spill_store(&self, access: &Access, src: temp::Temp, gen: &mut dyn Uuids) -> Instr {
        let offset = match access {
            Access::InFrame(offset) => *offset,
            Access::InReg(..) => panic!("impl bug: spill slots live in the frame"),
        };
        let fp = Self::frame_pointer(gen);
        Instr::Oper {
            assem: format!("movq %'S0, {}(%'S1)", offset),
            dst: Dst::empty(),
            src: Src(vec![src, fp]),
            jump: vec![],
        }
    }
}
