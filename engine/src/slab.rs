//! Near-allocated executable and data slabs.
//!
//! Every code slab must be reachable from the engine's own text
//! section with a signed 32-bit displacement so that emitted code can
//! `call rel32` into the entry gates, and data slabs must be reachable
//! from code slabs under the same bound for RIP-relative cell
//! addressing. Allocation probes `mmap` with hint addresses spiralling
//! out from the anchor until the distance constraint holds.

use std::io;
use std::ptr;

use shade_core::{Error, Result};

use crate::helpers::HelperSet;

/// Placement constraint for a slab.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpec {
    pub near: u64,
    pub max_distance: u64,
}

impl AddressSpec {
    /// Anchored at `near`, reachable by rel32 with headroom to spare.
    pub fn near(near: u64) -> Self {
        Self {
            near,
            max_distance: (i32::MAX as u64) - (64 << 20),
        }
    }

    fn satisfied_by(&self, base: u64, size: usize) -> bool {
        let lo = base.min(self.near);
        let hi = (base + size as u64).max(self.near);
        hi - lo <= self.max_distance
    }
}

/// One mmap'd region. Unmapped on drop.
pub struct Mapping {
    base: *mut u8,
    size: usize,
    /// False when the host refused W+X and the region runs under the
    /// thaw/freeze discipline instead.
    pub rwx: bool,
}

// SAFETY: Mapping owns its mmap'd memory exclusively.
unsafe impl Send for Mapping {}

impl Mapping {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        let b = self.base as u64;
        addr >= b && addr < b + self.size as u64
    }

    /// Map `size` bytes near `spec`. Executable mappings try RWX first
    /// and fall back to RW with explicit freeze transitions.
    pub fn allocate_near(spec: &AddressSpec, size: usize, executable: bool) -> Result<Self> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);

        if executable {
            if let Some(m) = Self::probe(spec, size, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
            {
                return Ok(Self {
                    base: m,
                    size,
                    rwx: true,
                });
            }
            // Hardened hosts refuse W+X outright; emit under W^X.
            log::warn!("rwx mapping refused, falling back to thaw/freeze");
            if let Some(m) = Self::probe(spec, size, libc::PROT_READ | libc::PROT_WRITE) {
                return Ok(Self {
                    base: m,
                    size,
                    rwx: false,
                });
            }
        } else if let Some(m) = Self::probe(spec, size, libc::PROT_READ | libc::PROT_WRITE) {
            return Ok(Self {
                base: m,
                size,
                rwx: true,
            });
        }

        Err(Error::NearAllocation { near: spec.near })
    }

    fn probe(spec: &AddressSpec, size: usize, prot: i32) -> Option<*mut u8> {
        // Spiral outwards in 64 MiB steps, alternating sides.
        const STEP: u64 = 64 << 20;
        for i in 0..64u64 {
            let delta = (i / 2 + 1) * STEP;
            let raw = if i % 2 == 0 {
                spec.near.saturating_add(delta)
            } else {
                spec.near.saturating_sub(delta)
            };
            let hint = raw & !(page_size() as u64 - 1);
            if hint == 0 {
                continue;
            }

            // SAFETY: anonymous private mapping, hint only.
            let p = unsafe {
                libc::mmap(
                    hint as *mut libc::c_void,
                    size,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if p == libc::MAP_FAILED {
                continue;
            }
            if spec.satisfied_by(p as u64, size) {
                return Some(p as *mut u8);
            }
            unsafe { libc::munmap(p, size) };
        }

        // Last try: let the kernel pick and hope it lands in range.
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return None;
        }
        if spec.satisfied_by(p as u64, size) {
            return Some(p as *mut u8);
        }
        unsafe { libc::munmap(p, size) };
        None
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

/// Make `[addr, addr+len)` writable. No-op on RWX mappings.
pub fn thaw(addr: u64, len: usize, rwx: bool) -> io::Result<()> {
    if rwx {
        return Ok(());
    }
    mprotect_range(addr, len, libc::PROT_READ | libc::PROT_WRITE)
}

/// Make `[addr, addr+len)` executable again and flush the i-cache
/// (a no-op on x86; the mprotect itself serializes).
pub fn freeze(addr: u64, len: usize, rwx: bool) -> io::Result<()> {
    if rwx {
        return Ok(());
    }
    mprotect_range(addr, len, libc::PROT_READ | libc::PROT_EXEC)
}

fn mprotect_range(addr: u64, len: usize, prot: i32) -> io::Result<()> {
    let page = page_size() as u64;
    let start = addr & !(page - 1);
    let end = (addr + len as u64 + page - 1) & !(page - 1);
    let ret = unsafe {
        libc::mprotect(start as *mut libc::c_void, (end - start) as usize, prot)
    };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Executable bump slab.
///
/// Each code slab carries its emitted helpers plus a companion
/// one-page RW mapping holding the communication cells written by
/// emitted code (helper return slots, the dynamic-target scratch and
/// the resume cell). The cells must stay writable even under W^X, so
/// they cannot live in the frozen code pages; the companion is
/// allocated adjacent so RIP-relative addressing still reaches it.
pub struct CodeSlab {
    pub mem: Mapping,
    pub cells: Mapping,
    cursor: usize,
    pub helpers: HelperSet,
    /// Holds the dynamic branch target between its resolution and use.
    pub scratch_cell: u64,
    /// Holds the resolved continuation address across an epilog.
    pub resume_cell: u64,
}

impl CodeSlab {
    pub fn new(mem: Mapping, cells: Mapping) -> Self {
        Self {
            mem,
            cells,
            cursor: 0,
            helpers: HelperSet::default(),
            scratch_cell: 0,
            resume_cell: 0,
        }
    }

    #[inline]
    pub fn cursor_ptr(&self) -> *mut u8 {
        unsafe { self.mem.base().add(self.cursor) }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.mem.size() - self.cursor
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.mem.contains(addr)
    }

    /// Claim `size` bytes at the cursor.
    pub fn reserve(&mut self, size: usize) -> Option<*mut u8> {
        if size > self.remaining() {
            return None;
        }
        let p = self.cursor_ptr();
        self.cursor += size;
        Some(p)
    }
}

/// Read-write bump slab for block records and site descriptors.
pub struct DataSlab {
    pub mem: Mapping,
    cursor: usize,
}

impl DataSlab {
    pub fn new(mem: Mapping) -> Self {
        Self { mem, cursor: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.mem.size() - self.cursor
    }

    /// Claim `size` bytes aligned to `align`.
    pub fn reserve(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        debug_assert!(align.is_power_of_two());
        let base = self.mem.base() as usize;
        let aligned = (base + self.cursor + align - 1) & !(align - 1);
        let new_cursor = aligned - base + size;
        if new_cursor > self.mem.size() {
            return None;
        }
        self.cursor = new_cursor;
        Some(aligned as *mut u8)
    }
}
