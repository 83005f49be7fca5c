//! Call probes: user callbacks fired on calls to specific addresses.

use crate::cpu::CpuContext;

/// Handle returned by `add_call_probe`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(pub u64);

/// Details of the intercepted call, handed to each probe callback.
///
/// The CPU context is mutable; changes are restored into the thread
/// when the probe trampoline's epilog runs.
pub struct CallDetails<'a> {
    pub target: u64,
    pub return_address: u64,
    /// Application stack pointer at the call site; the first qword is
    /// the return address.
    pub stack_pointer: u64,
    pub cpu_context: &'a mut CpuContext,
}

/// Probe callback. Dropped when the probe is removed.
pub type ProbeCallback = Box<dyn FnMut(&mut CallDetails<'_>) + Send>;
