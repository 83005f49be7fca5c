/// Saved architectural state of a followed thread.
///
/// The layout is fixed: fields ascend in memory from `rip` to `rax`,
/// matching the push sequence of the full prolog (which pushes `rax`
/// first and fills the `rip` slot last). The saved `rflags` qword sits
/// immediately above `rax` and is not part of this struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub rip: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    /// The application stack pointer at the virtualized site, not the
    /// engine's own stack.
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// RFLAGS trap flag, set by the single-step fallback trampoline.
pub const RFLAGS_TF: u64 = 1 << 8;
