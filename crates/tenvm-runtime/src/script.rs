//! Per-request scripts: a copy-on-write fork of a tenant template bound
//! to one request for its lifetime.

use std::sync::Arc;

use regex::Regex;
use sha2::{Digest, Sha256};

use tenvm_contracts::{VclCtx, VslLog};
use tenvm_machine::{CallOutcome, GuestAddr, Machine, MachineError};

use crate::cache::HandleCache;
use crate::decision::{DecisionState, Hook, RESULTS_MAX};
use crate::hypercalls::HypercallPort;
use crate::program::MachineInstance;
use crate::tenancy::TenantConfig;

pub const REGEX_HARD_MAX: usize = 64;
pub const DIRECTOR_HARD_MAX: usize = 32;

/// Budget for host-initiated callbacks issued from within a hypercall
/// (foreach enumeration).
pub const PREEMPT_BUDGET: u64 = 50_000;

/// Everything the hypercall dispatcher needs besides the machine itself.
/// Split from [`Script`] so the machine and its handler can be borrowed
/// disjointly during a guest call.
pub(crate) struct ScriptState {
    pub config: TenantConfig,
    pub decision: DecisionState,
    pub regex: HandleCache<Arc<Regex>>,
    pub directors: HandleCache<String>,
    pub sha: Option<Sha256>,
    pub post_addr: GuestAddr,
    pub is_storage: bool,
    pub is_debug: bool,
    pub last_newline: bool,
}

pub struct Script {
    machine: Box<dyn Machine>,
    inst: Arc<MachineInstance>,
    pub(crate) state: ScriptState,
}

impl Script {
    /// Constant-time fork from the tenant's template. Decision state
    /// starts cleared; template-compiled regex patterns are loaned in as
    /// non-owned entries at their original handles.
    pub fn fork(config: &TenantConfig, inst: Arc<MachineInstance>) -> Result<Script, MachineError> {
        let machine = inst.fork_machine()?;
        let mut regex = HandleCache::new(config.group.max_regex, REGEX_HARD_MAX);
        regex.loan_from(inst.template_regex());
        let directors = HandleCache::new(config.group.max_backends, DIRECTOR_HARD_MAX);
        let is_debug = inst.debug;
        Ok(Script {
            machine,
            state: ScriptState {
                config: config.clone(),
                decision: DecisionState::new(),
                regex,
                directors,
                sha: None,
                post_addr: 0,
                is_storage: false,
                is_debug,
                last_newline: true,
            },
            inst,
        })
    }

    pub fn name(&self) -> &str {
        &self.state.config.name
    }

    pub fn instance(&self) -> &Arc<MachineInstance> {
        &self.inst
    }

    pub fn max_instructions(&self) -> u64 {
        self.state.config.max_instructions()
    }

    pub fn want_result(&self) -> &'static str {
        self.state.decision.result.as_str()
    }

    pub fn want_values(&self) -> [u64; RESULTS_MAX] {
        self.state.decision.values
    }

    pub fn is_paused(&self) -> bool {
        self.state.decision.paused
    }

    pub fn is_debug(&self) -> bool {
        self.state.is_debug
    }

    pub(crate) fn decision(&self) -> &DecisionState {
        &self.state.decision
    }

    /// Dispatch the hook registered at `hook`, if any. Returns the guest
    /// return value, or -1 on a missing hook, fault or timeout.
    pub fn vcall(&mut self, ctx: &mut VclCtx, hook: Hook, arg1: u64, arg2: u64) -> i64 {
        let addr = self.inst.callback_entries[hook as usize];
        if addr == 0 {
            ctx.log.error(format!(
                "VM call '{}' skipped: the function at index {} is not available",
                hook.name(),
                hook as usize
            ));
            return -1;
        }
        self.run_at(ctx, addr, &[arg1, arg2])
    }

    /// String-keyed guest call through the function map. On a non-zero
    /// return the guest string at that address is copied into workspace
    /// and returned.
    pub fn call_named(&mut self, ctx: &mut VclCtx, name: &str, arg: &str) -> Option<String> {
        let Some(addr) = self.inst.resolve_address(name) else {
            ctx.fail(format!("VM call failed: function '{name}' not registered"));
            return None;
        };
        let (ptr, len) = match self.copy_cstr_to_guest(arg) {
            Ok(pair) => pair,
            Err(e) => {
                self.log_vm_error(&mut ctx.log, addr, &e);
                return None;
            }
        };
        let ret = self.run_at(ctx, addr, &[ptr, len]);
        if ret <= 0 {
            return None;
        }
        match self.machine.mem().read_cstr(ret as GuestAddr) {
            Ok(bytes) => {
                if ctx.ws.alloc(bytes.len() + 1).is_err() {
                    ctx.fail("VM call failed: out of workspace");
                    return None;
                }
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(e) => {
                self.log_vm_error(&mut ctx.log, addr, &e);
                None
            }
        }
    }

    /// Continue a guest paused by `pause_for`.
    pub fn resume(&mut self, ctx: &mut VclCtx) -> i64 {
        let budget = self.max_instructions();
        let Script { machine, state, .. } = self;
        let outcome = {
            let mut port = HypercallPort {
                state,
                ctx: &mut *ctx,
            };
            machine.resume(&mut port, budget)
        };
        match outcome {
            Ok(CallOutcome::Returned(v)) => v,
            Ok(CallOutcome::Halted) | Ok(CallOutcome::Paused) => machine.sysargs()[0] as i64,
            Err(e) => {
                let pc = machine.sysargs()[7];
                self.log_vm_error(&mut ctx.log, pc, &e);
                -1
            }
        }
    }

    /// Run a short host-initiated guest call with the register file
    /// saved and restored around it.
    pub fn preempt(&mut self, ctx: &mut VclCtx, addr: GuestAddr, args: &[u64]) -> i64 {
        let Script { machine, state, .. } = self;
        let result = {
            let mut port = HypercallPort {
                state,
                ctx: &mut *ctx,
            };
            machine.preempt(&mut port, addr, args, PREEMPT_BUDGET)
        };
        match result {
            Ok(v) => v,
            Err(e) => {
                self.log_vm_error(&mut ctx.log, addr, &e);
                -1
            }
        }
    }

    fn run_at(&mut self, ctx: &mut VclCtx, addr: GuestAddr, args: &[u64]) -> i64 {
        let budget = self.max_instructions();
        let Script { machine, state, .. } = self;
        let outcome = {
            let mut port = HypercallPort {
                state,
                ctx: &mut *ctx,
            };
            machine.call(&mut port, addr, args, budget)
        };
        match outcome {
            Ok(CallOutcome::Returned(v)) => v,
            // Halting hypercalls leave their status in a0.
            Ok(CallOutcome::Halted) | Ok(CallOutcome::Paused) => machine.sysargs()[0] as i64,
            Err(e) => {
                self.log_vm_error(&mut ctx.log, addr, &e);
                -1
            }
        }
    }

    fn log_vm_error(&self, log: &mut VslLog, addr: GuestAddr, e: &MachineError) {
        if e.is_timeout() {
            log.error(format!(
                "VM timeout in '{}' at {addr:#x} (limit {} instructions)",
                self.name(),
                self.max_instructions()
            ));
        } else {
            log.error(format!("VM exception in '{}' at {addr:#x}: {e}", self.name()));
        }
    }

    /// Copy a NUL-terminated string into fresh guest memory, returning
    /// its (ptr, len) pair.
    fn copy_cstr_to_guest(&mut self, s: &str) -> Result<(GuestAddr, u64), MachineError> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        let addr = self.machine.mem_mut().alloc(bytes.len())?;
        self.machine.mem_mut().write(addr, &bytes)?;
        Ok((addr, s.len() as u64))
    }

    /// Allocate the single contiguous POST buffer, first segment only.
    pub fn allocate_post_data(&mut self, capacity: u64) -> Result<GuestAddr, MachineError> {
        let addr = self.machine.mem_mut().alloc(capacity as usize)?;
        self.state.post_addr = addr;
        Ok(addr)
    }

    pub fn post_addr(&self) -> GuestAddr {
        self.state.post_addr
    }

    pub fn copy_to_guest(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MachineError> {
        self.machine.mem_mut().write(addr, data)
    }

    /// Invoke a backend generator and return the forge registers, or
    /// `None` when the guest halted without forging a response.
    pub fn backend_call(
        &mut self,
        ctx: &mut VclCtx,
        funcaddr: GuestAddr,
        funcarg: u64,
        post_addr: GuestAddr,
        post_len: u64,
    ) -> Result<Option<[u64; 8]>, MachineError> {
        let budget = self.max_instructions();
        let Script { machine, state, .. } = self;
        let outcome = {
            let mut port = HypercallPort {
                state,
                ctx: &mut *ctx,
            };
            machine.call(&mut port, funcaddr, &[funcarg, post_addr, post_len], budget)?
        };
        match outcome {
            CallOutcome::Halted => Ok(Some(machine.sysargs())),
            CallOutcome::Returned(_) | CallOutcome::Paused => Ok(None),
        }
    }

    /// Gather a guest data range as a scatter list.
    pub fn gather_buffers(
        &self,
        addr: GuestAddr,
        len: u64,
        max: usize,
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        self.machine.gather_buffers(addr, len, max)
    }

    pub fn read_guest_cstr(&self, addr: GuestAddr) -> Option<String> {
        self.machine
            .mem()
            .read_cstr(addr)
            .ok()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn read_guest(&self, addr: GuestAddr, len: usize) -> Option<Vec<u8>> {
        self.machine.mem().read(addr, len).ok()
    }

    /// Copy the guest string at `want_values[idx]` into workspace.
    pub fn result_string(&self, ctx: &mut VclCtx, idx: usize) -> Option<String> {
        if idx >= RESULTS_MAX {
            return None;
        }
        let s = self.read_guest_cstr(self.state.decision.values[idx])?;
        if ctx.ws.alloc(s.len() + 1).is_err() {
            ctx.fail("result_as_string: out of workspace");
            return None;
        }
        Some(s)
    }

    /// Contribute the accumulated SHA-256 to the object hash. Returns
    /// false when no hash_data was ever fed.
    pub fn apply_hash(&mut self, ctx: &mut VclCtx) -> bool {
        match self.state.sha.take() {
            Some(sha) => {
                let digest = sha.finalize();
                ctx.hash_contribute(&digest);
                true
            }
            None => false,
        }
    }

    /// Resolve a proxy director by name into the per-request cache,
    /// returning its guest-visible handle.
    pub fn cache_director(&mut self, name: &str) -> Option<usize> {
        let hash = tenvm_contracts::crc32c(name.as_bytes());
        if let Some(idx) = self.state.directors.find(hash) {
            return Some(idx);
        }
        self.state.directors.manage(name.to_string(), hash)
    }
}
