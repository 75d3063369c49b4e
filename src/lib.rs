//! Bytecode-level analysis for JVM class files.
//!
//! The crate decodes method bodies into typed, randomly indexable
//! instruction streams and derives a control-flow graph of basic blocks
//! from each, with dominator and post-dominator trees on top. Parsing of
//! the surrounding class file structure is delegated to `jclassfile`; the
//! instruction layer, offset translation, and graph construction live
//! here.
//!
//! ```no_run
//! use javanalysis::ClassNode;
//!
//! # fn main() -> javanalysis::Result<()> {
//! let data = std::fs::read("Sample.class").unwrap();
//! let class = ClassNode::parse(&data)?;
//! for (method, result) in class.analyze_all() {
//!     let analysis = result?;
//!     println!("{} {} blocks", method.name(), analysis.cfg().len());
//! }
//! # Ok(())
//! # }
//! ```

mod cfg;
mod class;
mod decode;
mod dominators;
mod error;
mod insn;
mod method;
pub mod opcodes;
mod stream;

pub use cfg::{Catcher, ControlFlowGraph, ExceptionHandler, FlowBlock};
pub use class::{ClassNode, MethodNode};
pub use dominators::{DomNode, DomTree};
pub use error::{Error, Result};
pub use insn::{Insn, LookupSwitch, MemberRef, Operand, TableSwitch};
pub use method::MethodAnalysis;
pub use stream::{InsnStream, LineNumber};
