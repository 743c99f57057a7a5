//! Warm tenant templates.
//!
//! A `MachineInstance` is built once per tenant program: the binary is
//! mapped, main() runs under budget until the guest parks itself in the
//! wait-for-requests hypercall, and the halted machine becomes the
//! immutable template every request forks from. A second, mutable
//! *storage* machine of the same program backs the live-update state
//! handoff.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use regex::Regex;

use tenvm_contracts::{crc32c, VslLog, VslTag};
use tenvm_machine::{
    GuestAddr, HypercallHandler, HypercallOutcome, Machine, MachineError, MachineLoader,
    MachinePort, HYPERCALL_ARGS,
};

use crate::decision::CALLBACK_MAX;
use crate::hypercalls::{read_guest_str, Syscall, DYNCALL_FORGE};
use crate::script::REGEX_HARD_MAX;
use crate::tenancy::TenantConfig;

pub struct MachineInstance {
    /// Retained for on-disk persistence after a successful update.
    pub binary: Vec<u8>,
    template: Box<dyn Machine>,
    storage: Mutex<Box<dyn Machine>>,
    /// Guest addresses of the registered hooks; 0 means "not registered".
    pub callback_entries: [GuestAddr; CALLBACK_MAX],
    /// name → guest address, for string-keyed calls.
    pub function_map: BTreeMap<String, GuestAddr>,
    /// Resumption address recorded by wait-for-requests.
    pub fast_exit: GuestAddr,
    /// Heap top after main(); forks start from here.
    pub arena_watermark: GuestAddr,
    pub debug: bool,
    template_regex: Vec<(u32, Arc<Regex>)>,
}

impl MachineInstance {
    /// Map `binary` and run its main() to the wait-for-requests sentinel.
    /// Fails if init faults or exhausts the instruction budget; the
    /// caller keeps whatever program was previously installed.
    pub fn new(
        loader: &dyn MachineLoader,
        binary: Vec<u8>,
        config: &TenantConfig,
        debug: bool,
        log: &mut VslLog,
    ) -> Result<Self> {
        let mut argv = vec![config.name.clone()];
        argv.extend(config.group.argv.load().iter().cloned());
        let limits = config.machine_limits();
        let budget = config.max_instructions();
        let max_regex = config.group.max_regex.min(REGEX_HARD_MAX);

        let loaded = loader
            .load(&binary, &limits, &argv)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("mapping program for tenant '{}'", config.name))?;
        let mut template = loaded.machine;

        let mut env = ServiceEnv::new(log, &config.name, false, max_regex);
        template
            .call(&mut env, loaded.entry, &[], budget)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("running main() for tenant '{}'", config.name))?;
        let callback_entries = env.callbacks;
        let fast_exit = env.fast_exit;
        let template_regex = env.regex;

        let storage_loaded = loader
            .load(&binary, &limits, &argv)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("mapping storage machine for tenant '{}'", config.name))?;
        let mut storage = storage_loaded.machine;
        let mut storage_env = ServiceEnv::new(log, &config.name, true, max_regex);
        storage
            .call(&mut storage_env, storage_loaded.entry, &[], budget)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("running storage main() for tenant '{}'", config.name))?;

        let arena_watermark = template.arena_watermark();
        Ok(MachineInstance {
            binary,
            template,
            storage: Mutex::new(storage),
            callback_entries,
            function_map: loaded.symbols,
            fast_exit,
            arena_watermark,
            debug,
            template_regex,
        })
    }

    /// CoW fork of the template for a new request.
    pub fn fork_machine(&self) -> Result<Box<dyn Machine>, MachineError> {
        self.template.fork()
    }

    pub fn storage(&self) -> &Mutex<Box<dyn Machine>> {
        &self.storage
    }

    /// Patterns compiled at main()-time; loaned non-owned to every fork.
    pub fn template_regex(&self) -> &[(u32, Arc<Regex>)] {
        &self.template_regex
    }

    pub fn resolve_address(&self, name: &str) -> Option<GuestAddr> {
        self.function_map.get(name).copied()
    }
}

/// Hypercall handler for machines running outside a request: template
/// and storage init, and the live-update handoff calls. Header access
/// and decisions are not available here.
pub(crate) struct ServiceEnv<'a> {
    log: &'a mut VslLog,
    tenant: &'a str,
    is_storage: bool,
    max_regex: usize,
    pub callbacks: [GuestAddr; CALLBACK_MAX],
    pub fast_exit: GuestAddr,
    pub regex: Vec<(u32, Arc<Regex>)>,
}

impl<'a> ServiceEnv<'a> {
    pub fn new(log: &'a mut VslLog, tenant: &'a str, is_storage: bool, max_regex: usize) -> Self {
        ServiceEnv {
            log,
            tenant,
            is_storage,
            max_regex,
            callbacks: [0; CALLBACK_MAX],
            fast_exit: 0,
            regex: Vec::new(),
        }
    }
}

impl HypercallHandler for ServiceEnv<'_> {
    fn hypercall(
        &mut self,
        port: &mut dyn MachinePort,
        num: u32,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        if num == DYNCALL_FORGE {
            // Serializer trap: halt with the data registers preserved.
            return Ok(HypercallOutcome::Halt);
        }
        let Some(sc) = Syscall::from_u32(num) else {
            self.log
                .error(format!("{}: unknown hypercall {num}", self.tenant));
            return Ok(HypercallOutcome::Value(-1));
        };
        match sc {
            Syscall::Print => {
                let text = read_guest_str(port.mem_ref(), args[0], args[1])?;
                self.log.log(VslTag::Print, text.trim_end().to_string());
                Ok(HypercallOutcome::Value(0))
            }
            Syscall::Log => {
                let text = read_guest_str(port.mem_ref(), args[0], args[1])?;
                self.log.info(text);
                Ok(HypercallOutcome::Value(0))
            }
            Syscall::RegisterCallback => {
                let idx = args[0] as usize;
                if idx >= 1 && idx < CALLBACK_MAX {
                    self.callbacks[idx] = args[1];
                    Ok(HypercallOutcome::Value(0))
                } else {
                    self.log.error(format!(
                        "{}: register_callback with invalid index {idx}",
                        self.tenant
                    ));
                    Ok(HypercallOutcome::Value(-1))
                }
            }
            Syscall::WaitForRequests => {
                // The template snapshot point: record on_recv and the
                // resumption address, then halt at a stable instruction.
                self.callbacks[crate::decision::Hook::Recv as usize] = args[0];
                self.fast_exit = args[1];
                Ok(HypercallOutcome::Halt)
            }
            Syscall::RegexCompile => {
                let pattern = read_guest_str(port.mem_ref(), args[0], args[1])?;
                let hash = crc32c(pattern.as_bytes());
                if let Some(idx) = self.regex.iter().position(|(h, _)| *h == hash) {
                    return Ok(HypercallOutcome::Value(idx as i64));
                }
                if self.regex.len() >= self.max_regex {
                    self.log
                        .error(format!("{}: template regex cache full", self.tenant));
                    return Ok(HypercallOutcome::Value(-1));
                }
                match Regex::new(&pattern) {
                    Ok(re) => {
                        self.regex.push((hash, Arc::new(re)));
                        Ok(HypercallOutcome::Value(self.regex.len() as i64 - 1))
                    }
                    Err(e) => {
                        self.log
                            .error(format!("{}: bad regex '{pattern}': {e}", self.tenant));
                        Ok(HypercallOutcome::Value(-1))
                    }
                }
            }
            Syscall::RegexMatch => {
                let idx = args[0] as usize;
                let text = read_guest_str(port.mem_ref(), args[1], args[2])?;
                match self.regex.get(idx) {
                    Some((_, re)) => Ok(HypercallOutcome::Value(re.is_match(&text) as i64)),
                    None => Ok(HypercallOutcome::Value(-1)),
                }
            }
            Syscall::MyName => {
                let name = self.tenant.as_bytes();
                let cap = args[1] as usize;
                let n = name.len().min(cap);
                port.mem().write(args[0], &name[..n])?;
                Ok(HypercallOutcome::Value(name.len() as i64))
            }
            Syscall::IsStorage => Ok(HypercallOutcome::Value(self.is_storage as i64)),
            Syscall::SetDecision => {
                self.log
                    .debug(format!("{}: decision ignored during init", self.tenant));
                Ok(HypercallOutcome::Value(0))
            }
            Syscall::Breakpoint => Ok(HypercallOutcome::Value(0)),
            Syscall::AssertFail => {
                let expr = read_guest_cstr(port.mem_ref(), args[0]);
                let file = read_guest_cstr(port.mem_ref(), args[1]);
                let func = read_guest_cstr(port.mem_ref(), args[3]);
                Err(MachineError::Fault {
                    what: format!("assertion failed: {expr} in {func} ({file}:{})", args[2]),
                    data: args[2],
                })
            }
            Syscall::Fail => Err(MachineError::Fault {
                what: "guest failure".to_string(),
                data: args[0],
            }),
            other => {
                self.log.error(format!(
                    "{}: hypercall {:?} not available outside a request",
                    self.tenant, other
                ));
                Ok(HypercallOutcome::Value(-1))
            }
        }
    }
}

fn read_guest_cstr(mem: &dyn tenvm_machine::GuestMemory, addr: GuestAddr) -> String {
    match mem.read_cstr(addr) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}
