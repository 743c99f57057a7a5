//! The typed hypercall ABI.
//!
//! The guest traps with a syscall id in a7 and arguments in a0..a6;
//! strings are (ptr, len) pairs. Every operation has fixed arity and
//! fails by returning a sentinel (-1, or [`HDR_INVALID`] for header
//! handles) — never by unwinding into the guest. A hot-path "dyncall"
//! encoding exists for the non-returning forge/serialize trap
//! ([`DYNCALL_FORGE`]); its behavior is identical to a regular trap.

use std::sync::Arc;

use regex::Regex;
use sha2::{Digest, Sha256};

use tenvm_contracts::{crc32c, HttpWhere, VclCtx, VslTag, HDR_INVALID};
use tenvm_machine::{
    GuestAddr, GuestMemory, HypercallHandler, HypercallOutcome, MachineError, MachinePort,
    HYPERCALL_ARGS,
};

use crate::decision::{Decision, ForgeRequest, SynthBody};
use crate::script::ScriptState;

/// Custom-instruction slot for the non-returning forge/serialize trap.
pub const DYNCALL_FORGE: u32 = 0x7FF;

/// Upper bound on a single string argument copied out of guest memory.
const STR_ARG_MAX: u64 = 16 << 20;

/// Syscall numbers, base 10, in the guest SDK's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Fail = 10,
    AssertFail = 11,
    Print = 12,
    Log = 13,
    RegexCompile = 14,
    RegexMatch = 15,
    RegexSubst = 16,
    RegsubHdr = 17,
    RegexFree = 18,
    MyName = 19,
    SetDecision = 20,
    Ban = 21,
    HashData = 22,
    Purge = 23,
    Synth = 24,
    ForeachField = 25,
    FieldGet = 26,
    FieldRetrieve = 27,
    FieldAppend = 28,
    FieldSet = 29,
    FieldCopy = 30,
    FieldUnset = 31,
    HttpRollback = 32,
    HttpCopy = 33,
    HttpSetStatus = 34,
    HttpUnsetRe = 35,
    HttpFind = 36,
    RegisterCallback = 37,
    WaitForRequests = 38,
    BackendDecision = 39,
    Cacheable = 40,
    Ttl = 41,
    IsStorage = 42,
    SetBackend = 43,
    Breakpoint = 44,
}

impl Syscall {
    pub fn from_u32(v: u32) -> Option<Syscall> {
        Some(match v {
            10 => Syscall::Fail,
            11 => Syscall::AssertFail,
            12 => Syscall::Print,
            13 => Syscall::Log,
            14 => Syscall::RegexCompile,
            15 => Syscall::RegexMatch,
            16 => Syscall::RegexSubst,
            17 => Syscall::RegsubHdr,
            18 => Syscall::RegexFree,
            19 => Syscall::MyName,
            20 => Syscall::SetDecision,
            21 => Syscall::Ban,
            22 => Syscall::HashData,
            23 => Syscall::Purge,
            24 => Syscall::Synth,
            25 => Syscall::ForeachField,
            26 => Syscall::FieldGet,
            27 => Syscall::FieldRetrieve,
            28 => Syscall::FieldAppend,
            29 => Syscall::FieldSet,
            30 => Syscall::FieldCopy,
            31 => Syscall::FieldUnset,
            32 => Syscall::HttpRollback,
            33 => Syscall::HttpCopy,
            34 => Syscall::HttpSetStatus,
            35 => Syscall::HttpUnsetRe,
            36 => Syscall::HttpFind,
            37 => Syscall::RegisterCallback,
            38 => Syscall::WaitForRequests,
            39 => Syscall::BackendDecision,
            40 => Syscall::Cacheable,
            41 => Syscall::Ttl,
            42 => Syscall::IsStorage,
            43 => Syscall::SetBackend,
            44 => Syscall::Breakpoint,
            _ => return None,
        })
    }
}

/// Read a (ptr, len) guest string, lossy on invalid UTF-8.
pub(crate) fn read_guest_str(
    mem: &dyn GuestMemory,
    ptr: u64,
    len: u64,
) -> Result<String, MachineError> {
    if len == 0 {
        return Ok(String::new());
    }
    if len > STR_ARG_MAX {
        return Err(MachineError::MemoryAccess {
            addr: ptr,
            len: len as usize,
        });
    }
    let bytes = mem.read(ptr, len as usize)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_guest_cstr(mem: &dyn GuestMemory, addr: GuestAddr) -> Result<String, MachineError> {
    let bytes = mem.read_cstr(addr)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn value(v: i64) -> Result<HypercallOutcome, MachineError> {
    Ok(HypercallOutcome::Value(v))
}

fn invalid() -> Result<HypercallOutcome, MachineError> {
    value(HDR_INVALID as i64)
}

/// The request-time hypercall handler: one per guest call, borrowing the
/// script's state and the live ctx (rebound on every hook entry).
pub(crate) struct HypercallPort<'a> {
    pub state: &'a mut ScriptState,
    pub ctx: &'a mut VclCtx,
}

impl HypercallPort<'_> {
    fn whence(&self, arg: u64) -> Option<HttpWhere> {
        HttpWhere::from_u32(u32::try_from(arg).ok()?)
    }

    fn dispatch(
        &mut self,
        port: &mut dyn MachinePort,
        sc: Syscall,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        match sc {
            Syscall::Fail => {
                self.ctx.fail("guest failure");
                Err(MachineError::Fault {
                    what: "guest failure".to_string(),
                    data: args[0],
                })
            }
            Syscall::AssertFail => {
                let expr = read_guest_cstr(port.mem_ref(), args[0]).unwrap_or_default();
                let file = read_guest_cstr(port.mem_ref(), args[1]).unwrap_or_default();
                let func = read_guest_cstr(port.mem_ref(), args[3]).unwrap_or_default();
                Err(MachineError::Fault {
                    what: format!("assertion failed: {expr} in {func} ({file}:{})", args[2]),
                    data: args[2],
                })
            }
            Syscall::Print => {
                let text = read_guest_str(port.mem_ref(), args[0], args[1])?;
                self.state.last_newline = text.ends_with('\n');
                self.ctx
                    .log
                    .log(VslTag::Print, text.trim_end_matches('\n').to_string());
                value(args[1] as i64)
            }
            Syscall::Log => {
                let text = read_guest_str(port.mem_ref(), args[0], args[1])?;
                self.ctx.log.info(text);
                value(0)
            }
            Syscall::RegexCompile => self.regex_compile(port, args),
            Syscall::RegexMatch => {
                let text = read_guest_str(port.mem_ref(), args[1], args[2])?;
                match self.state.regex.get(args[0] as usize) {
                    Some(re) => value(re.is_match(&text) as i64),
                    None => value(-1),
                }
            }
            Syscall::RegexSubst => self.regex_subst(port, args),
            Syscall::RegsubHdr => self.regsub_hdr(port, args),
            Syscall::RegexFree => {
                // Loaned template entries vacate their slot only; the
                // compiled pattern stays with the template.
                let (existed, _owned) = self.state.regex.free(args[0] as usize);
                value(if existed { 0 } else { -1 })
            }
            Syscall::MyName => {
                let name = self.state.config.name.clone();
                let n = name.len().min(args[1] as usize);
                port.mem().write(args[0], &name.as_bytes()[..n])?;
                value(name.len() as i64)
            }
            Syscall::SetDecision => self.set_decision(port, args),
            Syscall::Ban | Syscall::Purge => {
                let expr = read_guest_str(port.mem_ref(), args[0], args[1])?;
                self.ctx.bans.push(expr);
                value(0)
            }
            Syscall::HashData => {
                let bytes = port.mem_ref().read(args[0], args[1] as usize)?;
                self.state
                    .sha
                    .get_or_insert_with(Sha256::new)
                    .update(&bytes);
                value(0)
            }
            Syscall::Synth => self.synth(port, args),
            Syscall::ForeachField => self.foreach_field(port, args),
            Syscall::FieldGet => {
                let Some(w) = self.whence(args[0]) else {
                    return value(-1);
                };
                match self
                    .ctx
                    .msg(w)
                    .and_then(|m| m.line(args[1] as u32))
                {
                    Some(line) => value(line.len() as i64),
                    None => value(-1),
                }
            }
            Syscall::FieldRetrieve => self.field_retrieve(port, args),
            Syscall::FieldAppend => self.field_append(port, args),
            Syscall::FieldSet => self.field_set(port, args),
            Syscall::FieldUnset => {
                let Some(w) = self.whence(args[0]) else {
                    return value(-1);
                };
                match self.ctx.msg_mut(w) {
                    Some(m) => {
                        if m.unset(args[1] as u32) {
                            value(0)
                        } else {
                            value(-1)
                        }
                    }
                    _ => value(-1),
                }
            }
            Syscall::HttpRollback => {
                let Some(w) = self.whence(args[0]) else {
                    return value(-1);
                };
                match self.ctx.msg_mut(w) {
                    Some(m) => {
                        m.rollback();
                        value(0)
                    }
                    None => value(-1),
                }
            }
            Syscall::HttpCopy => {
                let (Some(src), Some(dst)) = (self.whence(args[0]), self.whence(args[1])) else {
                    return value(-1);
                };
                value(self.ctx.copy_all_fields(src, dst) as i64)
            }
            Syscall::FieldCopy => {
                let (Some(src), Some(dst)) = (self.whence(args[0]), self.whence(args[2])) else {
                    return invalid();
                };
                value(self.ctx.copy_field(src, args[1] as u32, dst) as i64)
            }
            // code 0 reads the current status, anything else sets it.
            Syscall::HttpSetStatus => {
                let Some(w) = self.whence(args[0]) else {
                    return value(-1);
                };
                let Some(m) = self.ctx.msg_mut(w) else {
                    return value(-1);
                };
                if args[1] == 0 {
                    value(m.status() as i64)
                } else {
                    m.set_status(args[1] as u16);
                    value(args[1] as i64)
                }
            }
            Syscall::HttpUnsetRe => {
                let Some(w) = self.whence(args[0]) else {
                    return value(-1);
                };
                let Some(re) = self.state.regex.get(args[1] as usize).cloned() else {
                    return value(-1);
                };
                match self.ctx.msg_mut(w) {
                    Some(m) => value(m.unset_re(&re) as i64),
                    None => value(-1),
                }
            }
            Syscall::HttpFind => {
                let Some(w) = self.whence(args[0]) else {
                    return invalid();
                };
                let name = read_guest_str(port.mem_ref(), args[1], args[2])?;
                match self.ctx.msg(w) {
                    Some(m) => value(m.find(&name) as i64),
                    None => invalid(),
                }
            }
            Syscall::RegisterCallback | Syscall::WaitForRequests => {
                self.ctx.log.error(format!(
                    "{}: {sc:?} is only available during initialization",
                    self.state.config.name
                ));
                value(-1)
            }
            Syscall::BackendDecision => {
                self.state.decision.forge = if args[1] != 0 {
                    Some(ForgeRequest {
                        cached: args[0] != 0,
                        trampoline: args[1],
                        func: args[2],
                        arg: None,
                    })
                } else {
                    let arg = port.mem_ref().read(args[2], args[3] as usize)?;
                    Some(ForgeRequest {
                        cached: args[0] != 0,
                        trampoline: 0,
                        func: 0,
                        arg: Some(arg),
                    })
                };
                value(0)
            }
            Syscall::Cacheable => {
                if args[0] != 0 {
                    self.ctx.cacheable = args[1] != 0;
                }
                value(self.ctx.cacheable as i64)
            }
            // Float register convention: f32 bits travel in the low half.
            Syscall::Ttl => {
                if args[0] != 0 {
                    self.ctx.ttl = f32::from_bits(args[1] as u32);
                }
                value(self.ctx.ttl.to_bits() as i64)
            }
            Syscall::IsStorage => value(self.state.is_storage as i64),
            Syscall::SetBackend => match self.state.directors.get(args[0] as usize) {
                Some(name) => {
                    self.ctx.backend = Some(name.clone());
                    value(0)
                }
                None => value(-1),
            },
            Syscall::Breakpoint => {
                if self.state.is_debug {
                    self.ctx
                        .log
                        .debug(format!("{}: breakpoint", self.state.config.name));
                }
                value(0)
            }
        }
    }

    fn regex_compile(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let pattern = read_guest_str(port.mem_ref(), args[0], args[1])?;
        let hash = crc32c(pattern.as_bytes());
        if let Some(idx) = self.state.regex.find(hash) {
            return value(idx as i64);
        }
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                self.ctx
                    .log
                    .error(format!("regex_compile('{pattern}') failed: {e}"));
                return value(-1);
            }
        };
        match self.state.regex.manage(Arc::new(re), hash) {
            Some(idx) => value(idx as i64),
            None => {
                self.ctx.log.error("regex cache full".to_string());
                value(-1)
            }
        }
    }

    /// regex_subst(idx, text*, subst*, dst, dst_cap, all): C-string text
    /// and replacement, result written to dst (truncated to dst_cap),
    /// returns the full result length.
    fn regex_subst(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let Some(re) = self.state.regex.get(args[0] as usize).cloned() else {
            return value(-1);
        };
        let text = read_guest_cstr(port.mem_ref(), args[1])?;
        let subst = read_guest_cstr(port.mem_ref(), args[2])?;
        let all = args[5] != 0;
        let result = if all {
            re.replace_all(&text, subst.as_str())
        } else {
            re.replace(&text, subst.as_str())
        };
        let out = result.as_bytes();
        let cap = args[4] as usize;
        if cap > 0 {
            let n = out.len().min(cap.saturating_sub(1));
            port.mem().write(args[3], &out[..n])?;
            port.mem().write(args[3] + n as u64, &[0])?;
        }
        value(out.len() as i64)
    }

    /// regsub_hdr(idx, where, handle, subst*, all): substitute within the
    /// header's value, rewriting the field in place.
    fn regsub_hdr(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let Some(re) = self.state.regex.get(args[0] as usize).cloned() else {
            return value(-1);
        };
        let Some(w) = self.whence(args[1]) else {
            return value(-1);
        };
        let subst = read_guest_cstr(port.mem_ref(), args[3])?;
        let all = args[4] != 0;
        let handle = args[2] as u32;
        let Some(m) = self.ctx.msg_mut(w) else {
            return value(-1);
        };
        let Some(line) = m.line(handle) else {
            return value(-1);
        };
        let Some(colon) = line.find(':') else {
            return value(-1);
        };
        let (name, rest) = line.split_at(colon);
        let old_value = rest[1..].trim_start();
        let new_value = if all {
            re.replace_all(old_value, subst.as_str())
        } else {
            re.replace(old_value, subst.as_str())
        };
        let len = new_value.len() as i64;
        let new_line = format!("{name}: {new_value}");
        m.set(handle, &new_line);
        value(len)
    }

    fn set_decision(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let token = read_guest_str(port.mem_ref(), args[0], args[1])?;
        let Some(decision) = Decision::parse(&token) else {
            self.ctx
                .log
                .error(format!("unknown decision '{token}' ignored"));
            return value(-1);
        };
        let paused = args[3] != 0;
        if paused && self.state.decision.paused {
            self.ctx
                .log
                .error("pause_for may only be used once per hook".to_string());
            return value(-1);
        }
        self.state.decision.set(decision, args[2], paused);
        if paused {
            Ok(HypercallOutcome::Pause)
        } else {
            value(0)
        }
    }

    /// synth(status, ctype*, clen, data*, dlen): records the synth body
    /// and terminates the guest call with an implicit synth decision.
    fn synth(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let ctype = read_guest_str(port.mem_ref(), args[1], args[2])?;
        let body = if args[4] > 0 {
            port.mem_ref().read(args[3], args[4] as usize)?
        } else {
            Vec::new()
        };
        if self.ctx.ws.alloc(ctype.len() + body.len()).is_err() {
            self.ctx.fail("synth: out of workspace");
            return Err(MachineError::Fault {
                what: "workspace exhausted".to_string(),
                data: args[4],
            });
        }
        self.state.decision.synth = Some(SynthBody { ctype, body });
        self.state.decision.set(Decision::Synth, args[0], false);
        Ok(HypercallOutcome::Halt)
    }

    /// foreach_field(where, fn, udata): enumerate the current fields,
    /// preempting the guest callback for each. Unsets issued by the
    /// callback are deferred until the enumeration ends.
    fn foreach_field(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let Some(w) = self.whence(args[0]) else {
            return value(-1);
        };
        let fn_addr = args[1];
        let udata = args[2];
        let handles = match self.ctx.msg_mut(w) {
            Some(m) => m.begin_foreach(),
            None => return value(-1),
        };
        let mut visited = 0i64;
        let mut failure = None;
        for handle in handles {
            match port.preempt(&mut *self, fn_addr, &[args[0], handle as u64, udata]) {
                Ok(_) => visited += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(m) = self.ctx.msg_mut(w) {
            m.end_foreach();
        }
        match failure {
            Some(e) => Err(e),
            None => value(visited),
        }
    }

    /// field_retrieve(where, handle, dst, cap): two-pass — cap 0 queries
    /// the length, otherwise copies up to cap bytes.
    fn field_retrieve(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let Some(w) = self.whence(args[0]) else {
            return value(-1);
        };
        // An unset or invalidated field reads back as length 0.
        let line = match self.ctx.msg(w).and_then(|m| m.line(args[1] as u32)) {
            Some(l) => l.to_string(),
            None => return value(0),
        };
        let cap = args[3] as usize;
        if cap == 0 {
            return value(line.len() as i64);
        }
        let n = line.len().min(cap);
        port.mem().write(args[2], &line.as_bytes()[..n])?;
        value(n as i64)
    }

    fn field_append(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let Some(w) = self.whence(args[0]) else {
            return invalid();
        };
        let line = read_guest_str(port.mem_ref(), args[1], args[2])?;
        if self.ctx.ws.alloc(line.len()).is_err() {
            self.ctx.fail("http_append: out of workspace");
            return invalid();
        }
        let Some(m) = self.ctx.msg_mut(w) else {
            return invalid();
        };
        match m.append(&line) {
            Ok(handle) => value(handle as i64),
            Err(e) => {
                self.ctx.log.error(format!("http_append failed: {e}"));
                invalid()
            }
        }
    }

    fn field_set(
        &mut self,
        port: &mut dyn MachinePort,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        let Some(w) = self.whence(args[0]) else {
            return value(-1);
        };
        let line = read_guest_str(port.mem_ref(), args[2], args[3])?;
        if self.ctx.ws.alloc(line.len()).is_err() {
            self.ctx.fail("field_set: out of workspace");
            return value(-1);
        }
        match self.ctx.msg_mut(w) {
            Some(m) => {
                if m.set(args[1] as u32, &line) {
                    value(0)
                } else {
                    value(-1)
                }
            }
            _ => value(-1),
        }
    }
}

impl HypercallHandler for HypercallPort<'_> {
    fn hypercall(
        &mut self,
        port: &mut dyn MachinePort,
        num: u32,
        args: [u64; HYPERCALL_ARGS],
    ) -> Result<HypercallOutcome, MachineError> {
        if num == DYNCALL_FORGE {
            // forge_response / serializer: halts with its registers
            // intact; the caller interprets them.
            return Ok(HypercallOutcome::Halt);
        }
        match Syscall::from_u32(num) {
            Some(sc) => self.dispatch(port, sc, args),
            None => {
                self.ctx.log.error(format!(
                    "{}: unknown hypercall {num}",
                    self.state.config.name
                ));
                value(-1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        assert_eq!(Syscall::Fail as u32, 10);
        assert_eq!(Syscall::Synth as u32, 24);
        assert_eq!(Syscall::HttpFind as u32, 36);
        assert_eq!(Syscall::Breakpoint as u32, 44);
        assert_eq!(Syscall::from_u32(24), Some(Syscall::Synth));
        assert_eq!(Syscall::from_u32(9), None);
        assert_eq!(Syscall::from_u32(45), None);
    }
}
