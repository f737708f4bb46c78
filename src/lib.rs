//! The backend of a Tiger compiler.
//!
//! Input is a type-checked abstract syntax tree with escape information
//! (`ast`); output is assembly text per procedure plus data directives for
//! string literals (`backend::Assembly`). In between: translation to tree IR
//! with frames and static links (`translate`), canonicalization and trace
//! scheduling (`canon`), maximal-munch instruction selection (`assem`), and
//! register allocation by iterated graph coloring (`regalloc`).

pub mod assem;
pub mod ast;
pub mod backend;
pub mod canon;
pub mod flow;
pub mod frame;
pub mod ir;
pub mod liveness;
pub mod regalloc;
pub mod symbol;
pub mod symtab;
pub mod temp;
pub mod translate;
