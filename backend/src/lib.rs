//! x86-64 backend: register definitions, machine-code writer,
//! instruction decoder and relocator.
//!
//! The writer emits directly into executable slabs at their final
//! virtual addresses; all displacement math is done on absolute
//! addresses. The decoder is a length-and-classification decoder: it
//! computes instruction boundaries and fully decodes control-transfer
//! operands, which is all the engine needs to virtualize a block.

pub mod insn;
pub mod regs;
pub mod reloc;
pub mod writer;

pub use insn::{BranchTarget, Insn, InsnKind, MemOperand, Segment};
pub use regs::Reg;
pub use reloc::Relocator;
pub use writer::{Cc, CodeWriter, Label};
