//! The top-level backend pipeline: typed AST in, assembly lines out.

use crate::{
    assem::{Codegen, Instr},
    ast::Exp,
    canon,
    frame::{Frag, Frame, FrameRef},
    regalloc,
    temp::{Label, TempMap, Uuids},
    translate,
};

use itertools::Itertools;
use log::debug;

/// One finished procedure: prologue, formatted body, epilogue.
pub struct CompiledProc {
    pub prologue: String,
    pub body: Vec<String>,
    pub epilogue: String,
}

/// The whole program's output. The caller writes it to a file; this crate
/// does no I/O.
pub struct Assembly {
    pub procs: Vec<CompiledProc>,
    pub data: Vec<String>,
}

impl Assembly {
    /// Flattens into final file order: text section, then data.
    pub fn into_lines(self) -> Vec<String> {
        let mut lines = vec!["\t.text".to_string()];
        for p in self.procs {
            lines.push(p.prologue);
            lines.extend(p.body);
            lines.push(p.epilogue);
        }
        if !self.data.is_empty() {
            lines.push("\t.data".to_string());
            lines.extend(self.data);
        }
        lines
    }

    pub fn into_text(self) -> String {
        self.into_lines().iter().join("\n")
    }
}

/// Lowers one procedure body: canonicalize, trace-schedule, tile, append the
/// live-out sink, color registers, wrap with prologue and epilogue.
pub fn compile_proc<F: Frame + 'static, C: Codegen>(
    body: crate::ir::IrStm,
    frame: FrameRef,
    gen: &mut dyn Uuids,
) -> CompiledProc {
    let stms = canon::linearize(body, gen);
    let (blocks, done_label) = canon::basic_blocks(stms, gen);
    let scheduled = canon::trace_schedule(blocks, done_label, gen);
    debug!("canon: {} scheduled statements", scheduled.len());

    let mut instrs: Vec<Instr> = Vec::new();
    for stm in scheduled {
        C::code_gen_frame(frame.clone(), stm, &mut instrs, gen);
    }
    frame.borrow().proc_entry_exit2(&mut instrs, gen);
    debug!("codegen: {} instructions", instrs.len());

    let (instrs, assignment) = regalloc::allocate::<F>(instrs, &frame, gen);

    let mut tm = TempMap::new();
    for (t, r) in assignment {
        tm.insert(t, r);
    }
    let body_lines: Vec<String> = instrs
        .iter()
        .filter(|i| match i {
            // a coalesced copy is a no-op once both sides share a register.
            Instr::Move { dst, src, .. } => tm.get(dst) != tm.get(src),
            _ => true,
        })
        .map(|i| i.format(&tm, gen))
        .filter(|line| !line.is_empty())
        .collect();

    let (prologue, epilogue) = frame.borrow().proc_entry_exit3(gen);
    CompiledProc {
        prologue,
        body: body_lines,
        epilogue,
    }
}

/// Lowers the string fragments to data directives.
pub fn codegen_data<F: Frame>(strings: &[(Label, String)]) -> Vec<String> {
    strings
        .iter()
        .flat_map(|(label, value)| F::string(*label, value))
        .collect()
}

/// Runs the full backend over a type-checked program.
pub fn compile<F: Frame + 'static, C: Codegen>(ast: &Exp, gen: &mut dyn Uuids) -> Assembly {
    let frags = translate::program::<F>(ast, gen);
    debug!("translate: {} fragments", frags.len());

    let mut procs = Vec::new();
    let mut strings = Vec::new();
    for frag in frags {
        match frag {
            Frag::Proc { body, frame } => {
                procs.push(compile_proc::<F, C>(body, frame, gen));
            }
            Frag::String(label, value) => strings.push((label, value)),
        }
    }
    let data = codegen_data::<F>(&strings);
    Assembly { procs, data }
}
