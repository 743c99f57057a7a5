//! Emulator contract for the tenvm sandbox.
//!
//! The RISC-V CPU emulator itself is an external library; this crate pins
//! down the surface the runtime drives it through: budgeted guest calls,
//! copy-on-write forks from a warm template, guest memory access, and the
//! hypercall trap back into the host. `ScriptedMachine` is a deterministic
//! in-process implementation of the same contract, used by tests and local
//! development.

use std::collections::BTreeMap;

use thiserror::Error;

mod scripted;

pub use scripted::{GuestCall, GuestFn, GuestStop, ScriptedLoader, ScriptedMachine, ScriptedProgram};

/// Guest virtual address. A single XLEN is configured per deployment; the
/// host always widens to 64 bits.
pub type GuestAddr = u64;

/// Number of argument registers in a hypercall frame (a0..a6; a7 carries
/// the syscall id).
pub const HYPERCALL_ARGS: usize = 7;

/// Guest heap base shared by all machines forked from one template, so
/// that symbol and allocation addresses are stable across forks.
pub const SHEAP_BASE: GuestAddr = 0x8000_0000;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("instruction budget exhausted ({budget} instructions)")]
    Timeout { budget: u64 },
    #[error("machine fault: {what} (data: {data:#x})")]
    Fault { what: String, data: u64 },
    #[error("guest out of memory")]
    OutOfMemory,
    #[error("invalid guest memory access at {addr:#x}+{len}")]
    MemoryAccess { addr: GuestAddr, len: usize },
    #[error("no guest function at {0:#x}")]
    NoSuchFunction(GuestAddr),
    #[error("machine is not paused")]
    NotPaused,
    #[error("unknown program image")]
    UnknownProgram,
}

impl MachineError {
    /// Short tag for log lines; mirrors the distinction the error policy
    /// draws between budget exhaustion and other faults.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MachineError::Timeout { .. })
    }
}

/// Outcome of one hypercall as decided by the host handler.
pub enum HypercallOutcome {
    /// Plain return value placed in a0.
    Value(i64),
    /// Non-returning hypercall (synth, forge, serialize): the machine
    /// halts with the trap registers preserved for `sysargs()`.
    Halt,
    /// `pause_for`: the machine stops but stays resumable.
    Pause,
}

/// Byte-level guest memory access.
pub trait GuestMemory {
    fn read(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>, MachineError>;
    fn write(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MachineError>;
    /// Read a NUL-terminated string starting at `addr`.
    fn read_cstr(&self, addr: GuestAddr) -> Result<Vec<u8>, MachineError>;
    /// Arena allocation in the guest heap. Returns a 16-byte aligned
    /// address; the region reads back as zeroes until written.
    fn alloc(&mut self, len: usize) -> Result<GuestAddr, MachineError>;
    /// Release an arena allocation. Returns false for addresses that do
    /// not name a live allocation.
    fn free(&mut self, addr: GuestAddr) -> bool;
}

/// Controlled re-entry into the running machine, handed to the hypercall
/// handler. `preempt` is how host-side enumeration (foreach) calls back
/// into guest code from within a hypercall.
pub trait MachinePort {
    fn mem(&mut self) -> &mut dyn GuestMemory;
    fn mem_ref(&self) -> &dyn GuestMemory;
    fn preempt(
        &mut self,
        handler: &mut dyn HypercallHandler,
        addr: GuestAddr,
        args: &[u64],
    ) -> Result<i64, MachineError>;
}

/// Host side of the hypercall trap. Implementations must never unwind
/// into the guest; failures surface as sentinel return values or as a
/// `MachineError` that aborts the whole guest call.
pub trait HypercallHandler {
    fn hypercall(
        &mut self,
        port: &mut dyn MachinePort,
        num: u32,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError>;
}

/// How a budgeted guest call came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The guest function returned normally with this value.
    Returned(i64),
    /// A non-returning hypercall stopped the machine; read `sysargs()`.
    Halted,
    /// The guest paused via `pause_for`; `resume()` continues it.
    Paused,
}

pub trait Machine: Send + Sync {
    /// Constant-time copy-on-write fork. The source is left untouched;
    /// guest-visible addresses are identical in the child.
    fn fork(&self) -> Result<Box<dyn Machine>, MachineError>;

    /// Call the guest function at `addr` under an instruction budget.
    fn call(
        &mut self,
        handler: &mut dyn HypercallHandler,
        addr: GuestAddr,
        args: &[u64],
        budget: u64,
    ) -> Result<CallOutcome, MachineError>;

    /// Continue a machine stopped by `pause_for`.
    fn resume(
        &mut self,
        handler: &mut dyn HypercallHandler,
        budget: u64,
    ) -> Result<CallOutcome, MachineError>;

    /// Run a short guest call with the register file saved and restored
    /// around it. Used for callbacks issued from within a hypercall.
    fn preempt(
        &mut self,
        handler: &mut dyn HypercallHandler,
        addr: GuestAddr,
        args: &[u64],
        budget: u64,
    ) -> Result<i64, MachineError>;

    fn mem(&self) -> &dyn GuestMemory;
    fn mem_mut(&mut self) -> &mut dyn GuestMemory;

    /// Register snapshot (a0..a7) from the most recent halting trap.
    fn sysargs(&self) -> [u64; 8];

    /// Heap top after template initialization; forks reset to it.
    fn arena_watermark(&self) -> GuestAddr;

    /// Collect the guest data range `[addr, addr+len)` as a scatter list
    /// of at most `max` buffers.
    fn gather_buffers(
        &self,
        addr: GuestAddr,
        len: u64,
        max: usize,
    ) -> Result<Vec<Vec<u8>>, MachineError>;

    fn is_paused(&self) -> bool;
}

/// Limits applied when mapping a program image.
#[derive(Debug, Clone, Copy)]
pub struct MachineLimits {
    pub max_memory: u64,
    pub max_heap: u64,
}

/// A freshly mapped machine plus the metadata the runtime needs from the
/// image: the entry point and the symbol table for string-keyed calls.
pub struct LoadedMachine {
    pub machine: Box<dyn Machine>,
    pub entry: GuestAddr,
    pub symbols: BTreeMap<String, GuestAddr>,
}

/// The seam to the external emulator library: maps a binary into a fresh
/// machine. The proxy supplies the production loader; tests supply
/// [`ScriptedLoader`].
pub trait MachineLoader: Send + Sync {
    fn load(
        &self,
        binary: &[u8],
        limits: &MachineLimits,
        argv: &[String],
    ) -> Result<LoadedMachine, MachineError>;
}

/// Copy `len` bytes from one machine's memory into another's. The only
/// cross-machine operation the runtime needs (live-update handoff).
pub fn memcpy_across(
    dst: &mut dyn Machine,
    dst_addr: GuestAddr,
    src: &dyn Machine,
    src_addr: GuestAddr,
    len: usize,
) -> Result<(), MachineError> {
    let data = src.mem().read(src_addr, len)?;
    dst.mem_mut().write(dst_addr, &data)
}
