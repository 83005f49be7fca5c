mod insn;
mod reloc;
mod writer;
