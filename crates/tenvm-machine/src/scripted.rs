//! A deterministic, in-process [`Machine`] used by tests and local
//! development. Guest "programs" are Rust closures registered at fixed
//! guest addresses; hypercalls go through the same [`HypercallHandler`]
//! trap as the production emulator, and fuel accounting gives the same
//! budget-exhaustion behavior.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::{
    CallOutcome, GuestAddr, GuestMemory, HypercallHandler, HypercallOutcome, LoadedMachine,
    Machine, MachineError, MachineLimits, MachineLoader, MachinePort, HYPERCALL_ARGS, SHEAP_BASE,
};

const ENTRY_ADDR: GuestAddr = 0x1000;
const FIRST_FN_ADDR: GuestAddr = 0x0010_0000;
const SYSCALL_COST: u64 = 100;

/// Why a scripted guest function stopped early. Closures propagate these
/// with `?`; the machine maps them onto [`CallOutcome`].
pub enum GuestStop {
    /// A non-returning hypercall (synth, forge, serialize) stopped the
    /// machine.
    Halt,
    /// The guest paused; the payload runs on `resume()`.
    Pause(GuestFn),
    Fault(MachineError),
}

impl From<MachineError> for GuestStop {
    fn from(e: MachineError) -> Self {
        GuestStop::Fault(e)
    }
}

pub type GuestFn = Arc<dyn Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync>;

#[derive(Clone)]
struct Seg {
    base: GuestAddr,
    size: u64,
    data: Vec<u8>,
}

impl Seg {
    fn contains(&self, addr: GuestAddr, len: u64) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.base + self.size
    }
}

/// Sparse segment memory: allocations reserve a range, bytes materialize
/// on first write and read back as zeroes before that.
#[derive(Clone)]
struct ScriptedMem {
    segs: Vec<Seg>,
    heap_top: GuestAddr,
    heap_limit: u64,
}

impl ScriptedMem {
    fn new(limits: &MachineLimits) -> Self {
        ScriptedMem {
            segs: Vec::new(),
            heap_top: SHEAP_BASE,
            heap_limit: limits.max_heap,
        }
    }

    fn seg_for(&self, addr: GuestAddr, len: u64) -> Option<usize> {
        self.segs.iter().position(|s| s.contains(addr, len))
    }
}

impl GuestMemory for ScriptedMem {
    fn read(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>, MachineError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let idx = self
            .seg_for(addr, len as u64)
            .ok_or(MachineError::MemoryAccess { addr, len })?;
        let seg = &self.segs[idx];
        let off = (addr - seg.base) as usize;
        let mut out = vec![0u8; len];
        if off < seg.data.len() {
            let have = (seg.data.len() - off).min(len);
            out[..have].copy_from_slice(&seg.data[off..off + have]);
        }
        Ok(out)
    }

    fn write(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), MachineError> {
        if data.is_empty() {
            return Ok(());
        }
        let idx = self
            .seg_for(addr, data.len() as u64)
            .ok_or(MachineError::MemoryAccess {
                addr,
                len: data.len(),
            })?;
        let seg = &mut self.segs[idx];
        let off = (addr - seg.base) as usize;
        if seg.data.len() < off + data.len() {
            seg.data.resize(off + data.len(), 0);
        }
        seg.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_cstr(&self, addr: GuestAddr) -> Result<Vec<u8>, MachineError> {
        let idx = self
            .seg_for(addr, 1)
            .ok_or(MachineError::MemoryAccess { addr, len: 1 })?;
        let seg = &self.segs[idx];
        let off = (addr - seg.base) as usize;
        let tail = &seg.data[off.min(seg.data.len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(tail[..end].to_vec())
    }

    fn alloc(&mut self, len: usize) -> Result<GuestAddr, MachineError> {
        let aligned = (self.heap_top + 15) & !15;
        let end = aligned
            .checked_add(len.max(1) as u64)
            .ok_or(MachineError::OutOfMemory)?;
        if end > SHEAP_BASE + self.heap_limit {
            return Err(MachineError::OutOfMemory);
        }
        self.segs.push(Seg {
            base: aligned,
            size: len.max(1) as u64,
            data: Vec::new(),
        });
        self.heap_top = end;
        Ok(aligned)
    }

    fn free(&mut self, addr: GuestAddr) -> bool {
        match self.segs.iter().position(|s| s.base == addr) {
            Some(i) => {
                self.segs.remove(i);
                true
            }
            None => false,
        }
    }
}

/// The execution context handed to a scripted guest function.
pub struct GuestCall<'a> {
    mem: &'a mut ScriptedMem,
    funcs: &'a BTreeMap<GuestAddr, GuestFn>,
    argv: &'a [String],
    handler: Option<&'a mut dyn HypercallHandler>,
    args: [u64; 8],
    fuel: &'a mut u64,
    budget: u64,
    trap_regs: Option<[u64; 8]>,
    resume_fn: Option<GuestFn>,
}

impl GuestCall<'_> {
    pub fn arg(&self, i: usize) -> u64 {
        self.args[i]
    }

    pub fn argv(&self) -> &[String] {
        self.argv
    }

    /// Charge instructions against the call budget.
    pub fn burn(&mut self, n: u64) -> Result<(), GuestStop> {
        if *self.fuel < n {
            *self.fuel = 0;
            return Err(GuestStop::Fault(MachineError::Timeout {
                budget: self.budget,
            }));
        }
        *self.fuel -= n;
        Ok(())
    }

    /// Issue a hypercall: syscall id in a7, arguments in a0..a6.
    pub fn syscall(&mut self, num: u32, args: &[u64]) -> Result<i64, GuestStop> {
        self.burn(SYSCALL_COST)?;
        let mut a = [0u64; HYPERCALL_ARGS];
        for (i, v) in args.iter().take(HYPERCALL_ARGS).enumerate() {
            a[i] = *v;
        }
        let mut regs = [0u64; 8];
        regs[..HYPERCALL_ARGS].copy_from_slice(&a);
        regs[7] = num as u64;

        let handler = match self.handler.take() {
            Some(h) => h,
            None => {
                return Err(GuestStop::Fault(MachineError::Fault {
                    what: "re-entrant hypercall".to_string(),
                    data: num as u64,
                }))
            }
        };
        let outcome = handler.hypercall(&mut *self, num, a);
        self.handler = Some(handler);

        match outcome {
            Ok(HypercallOutcome::Value(v)) => Ok(v),
            Ok(HypercallOutcome::Halt) => {
                self.trap_regs = Some(regs);
                Err(GuestStop::Halt)
            }
            Ok(HypercallOutcome::Pause) => {
                self.trap_regs = Some(regs);
                let cont = self
                    .resume_fn
                    .take()
                    .unwrap_or_else(|| Arc::new(|_: &mut GuestCall<'_>| Ok(0)));
                Err(GuestStop::Pause(cont))
            }
            Err(e) => Err(GuestStop::Fault(e)),
        }
    }

    /// Register the continuation run by `resume()` if a later hypercall
    /// pauses the machine.
    pub fn on_resume<F>(&mut self, f: F)
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        self.resume_fn = Some(Arc::new(f));
    }

    pub fn read(&self, addr: GuestAddr, len: usize) -> Result<Vec<u8>, GuestStop> {
        Ok(self.mem.read(addr, len)?)
    }

    pub fn write(&mut self, addr: GuestAddr, data: &[u8]) -> Result<(), GuestStop> {
        Ok(self.mem.write(addr, data)?)
    }

    /// Allocate guest memory and copy `data` into it.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Result<GuestAddr, GuestStop> {
        let addr = self.mem.alloc(data.len())?;
        self.mem.write(addr, data)?;
        Ok(addr)
    }

    /// Allocate `s` as a NUL-terminated guest string, returning its address.
    pub fn alloc_cstr(&mut self, s: &str) -> Result<GuestAddr, GuestStop> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }

    /// Allocate `s` without a terminator, returning (addr, len) for the
    /// (ptr, len) string convention.
    pub fn alloc_str(&mut self, s: &str) -> Result<(GuestAddr, u64), GuestStop> {
        let addr = self.alloc_bytes(s.as_bytes())?;
        Ok((addr, s.len() as u64))
    }
}

impl MachinePort for GuestCall<'_> {
    fn mem(&mut self) -> &mut dyn GuestMemory {
        self.mem
    }

    fn mem_ref(&self) -> &dyn GuestMemory {
        self.mem
    }

    fn preempt(
        &mut self,
        handler: &mut dyn HypercallHandler,
        addr: GuestAddr,
        args: &[u64],
    ) -> Result<i64, MachineError> {
        let f = self
            .funcs
            .get(&addr)
            .cloned()
            .ok_or(MachineError::NoSuchFunction(addr))?;
        let mut regs = [0u64; 8];
        for (i, v) in args.iter().take(HYPERCALL_ARGS).enumerate() {
            regs[i] = *v;
        }
        let mut nested = GuestCall {
            mem: &mut *self.mem,
            funcs: self.funcs,
            argv: self.argv,
            handler: Some(handler),
            args: regs,
            fuel: &mut *self.fuel,
            budget: self.budget,
            trap_regs: None,
            resume_fn: None,
        };
        match f(&mut nested) {
            Ok(v) => Ok(v),
            // A preempted callback cannot stop the outer machine.
            Err(GuestStop::Halt) | Err(GuestStop::Pause(_)) => Ok(-1),
            Err(GuestStop::Fault(e)) => Err(e),
        }
    }
}

pub struct ScriptedMachine {
    mem: ScriptedMem,
    funcs: Arc<BTreeMap<GuestAddr, GuestFn>>,
    argv: Arc<Vec<String>>,
    regs: [u64; 8],
    paused: Option<GuestFn>,
}

impl ScriptedMachine {
    fn run_fn(
        &mut self,
        handler: &mut dyn HypercallHandler,
        f: GuestFn,
        args: [u64; 8],
        budget: u64,
    ) -> Result<CallOutcome, MachineError> {
        let mut fuel = budget;
        let mut call = GuestCall {
            mem: &mut self.mem,
            funcs: &*self.funcs,
            argv: &self.argv[..],
            handler: Some(handler),
            args,
            fuel: &mut fuel,
            budget,
            trap_regs: None,
            resume_fn: None,
        };
        let res = f(&mut call);
        let trap = call.trap_regs;
        match res {
            Ok(v) => {
                self.regs = args;
                self.regs[0] = v as u64;
                Ok(CallOutcome::Returned(v))
            }
            Err(GuestStop::Halt) => {
                if let Some(r) = trap {
                    self.regs = r;
                }
                Ok(CallOutcome::Halted)
            }
            Err(GuestStop::Pause(cont)) => {
                if let Some(r) = trap {
                    self.regs = r;
                }
                self.paused = Some(cont);
                Ok(CallOutcome::Paused)
            }
            Err(GuestStop::Fault(e)) => Err(e),
        }
    }
}

impl Machine for ScriptedMachine {
    fn fork(&self) -> Result<Box<dyn Machine>, MachineError> {
        Ok(Box::new(ScriptedMachine {
            mem: self.mem.clone(),
            funcs: Arc::clone(&self.funcs),
            argv: Arc::clone(&self.argv),
            regs: self.regs,
            paused: self.paused.clone(),
        }))
    }

    fn call(
        &mut self,
        handler: &mut dyn HypercallHandler,
        addr: GuestAddr,
        args: &[u64],
        budget: u64,
    ) -> Result<CallOutcome, MachineError> {
        let f = self
            .funcs
            .get(&addr)
            .cloned()
            .ok_or(MachineError::NoSuchFunction(addr))?;
        let mut regs = [0u64; 8];
        for (i, v) in args.iter().take(HYPERCALL_ARGS).enumerate() {
            regs[i] = *v;
        }
        self.paused = None;
        self.run_fn(handler, f, regs, budget)
    }

    fn resume(
        &mut self,
        handler: &mut dyn HypercallHandler,
        budget: u64,
    ) -> Result<CallOutcome, MachineError> {
        let cont = self.paused.take().ok_or(MachineError::NotPaused)?;
        let args = self.regs;
        self.run_fn(handler, cont, args, budget)
    }

    fn preempt(
        &mut self,
        handler: &mut dyn HypercallHandler,
        addr: GuestAddr,
        args: &[u64],
        budget: u64,
    ) -> Result<i64, MachineError> {
        let saved = self.regs;
        let paused = self.paused.clone();
        let res = self.call(handler, addr, args, budget);
        self.regs = saved;
        self.paused = paused;
        match res? {
            CallOutcome::Returned(v) => Ok(v),
            CallOutcome::Halted | CallOutcome::Paused => Ok(-1),
        }
    }

    fn mem(&self) -> &dyn GuestMemory {
        &self.mem
    }

    fn mem_mut(&mut self) -> &mut dyn GuestMemory {
        &mut self.mem
    }

    fn sysargs(&self) -> [u64; 8] {
        self.regs
    }

    fn arena_watermark(&self) -> GuestAddr {
        self.mem.heap_top
    }

    fn gather_buffers(
        &self,
        addr: GuestAddr,
        len: u64,
        max: usize,
    ) -> Result<Vec<Vec<u8>>, MachineError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        // Chunk so the scatter list always fits the caller's cap.
        let chunk = ((len as usize).div_ceil(max)).max(64 * 1024);
        let data = self.mem.read(addr, len as usize)?;
        Ok(data.chunks(chunk).map(|c| c.to_vec()).collect())
    }

    fn is_paused(&self) -> bool {
        self.paused.is_some()
    }
}

/// Builder for a scripted guest program.
pub struct ScriptedProgram {
    funcs: BTreeMap<GuestAddr, GuestFn>,
    symbols: BTreeMap<String, GuestAddr>,
    next: GuestAddr,
}

impl ScriptedProgram {
    pub fn new() -> Self {
        ScriptedProgram {
            funcs: BTreeMap::new(),
            symbols: BTreeMap::new(),
            next: FIRST_FN_ADDR,
        }
    }

    /// Register a named guest function; the name lands in the symbol
    /// table the loader reports.
    pub fn define<F>(&mut self, name: &str, f: F) -> GuestAddr
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        let addr = self.define_anon(f);
        self.symbols.insert(name.to_string(), addr);
        addr
    }

    /// Register a guest function reachable only by address (trampolines,
    /// foreach callbacks).
    pub fn define_anon<F>(&mut self, f: F) -> GuestAddr
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        let addr = self.next;
        self.next += 0x10;
        self.funcs.insert(addr, Arc::new(f));
        addr
    }

    /// Register the program entry point (`_start` equivalent).
    pub fn entry<F>(&mut self, f: F)
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        self.funcs.insert(ENTRY_ADDR, Arc::new(f));
        self.symbols.insert("_start".to_string(), ENTRY_ADDR);
    }
}

#[derive(Clone)]
struct ProgramImage {
    funcs: Arc<BTreeMap<GuestAddr, GuestFn>>,
    symbols: BTreeMap<String, GuestAddr>,
}

/// Loader over a registry of scripted programs keyed by binary bytes.
/// Tests register a tag (any byte string standing in for an ELF) and the
/// program it "loads" to.
#[derive(Default)]
pub struct ScriptedLoader {
    programs: Mutex<HashMap<Vec<u8>, ProgramImage>>,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, binary: impl Into<Vec<u8>>, mut prog: ScriptedProgram) {
        if !prog.funcs.contains_key(&ENTRY_ADDR) {
            prog.entry(|_| Ok(0));
        }
        let image = ProgramImage {
            funcs: Arc::new(prog.funcs),
            symbols: prog.symbols,
        };
        self.programs.lock().unwrap().insert(binary.into(), image);
    }
}

impl MachineLoader for ScriptedLoader {
    fn load(
        &self,
        binary: &[u8],
        limits: &MachineLimits,
        argv: &[String],
    ) -> Result<LoadedMachine, MachineError> {
        let image = self
            .programs
            .lock()
            .map_err(|_| MachineError::Fault {
                what: "program registry poisoned".to_string(),
                data: 0,
            })?
            .get(binary)
            .cloned()
            .ok_or(MachineError::UnknownProgram)?;
        let machine = ScriptedMachine {
            mem: ScriptedMem::new(limits),
            funcs: image.funcs,
            argv: Arc::new(argv.to_vec()),
            regs: [0; 8],
            paused: None,
        };
        Ok(LoadedMachine {
            machine: Box::new(machine),
            entry: ENTRY_ADDR,
            symbols: image.symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;
    impl HypercallHandler for NullHandler {
        fn hypercall(
            &mut self,
            _port: &mut dyn MachinePort,
            _num: u32,
            args: [u64; HYPERCALL_ARGS],
        ) -> Result<HypercallOutcome, MachineError> {
            Ok(HypercallOutcome::Value(args[0] as i64))
        }
    }

    fn machine_with(prog: ScriptedProgram) -> Box<dyn Machine> {
        let loader = ScriptedLoader::new();
        loader.register(b"p".as_slice(), prog);
        let limits = MachineLimits {
            max_memory: 32 << 20,
            max_heap: 32 << 20,
        };
        loader.load(b"p", &limits, &[]).unwrap().machine
    }

    #[test]
    fn call_returns_value() {
        let mut prog = ScriptedProgram::new();
        let addr = prog.define("double", |gc| Ok((gc.arg(0) * 2) as i64));
        let mut m = machine_with(prog);
        let out = m.call(&mut NullHandler, addr, &[21], 1_000_000).unwrap();
        assert_eq!(out, CallOutcome::Returned(42));
    }

    #[test]
    fn fuel_exhaustion_times_out() {
        let mut prog = ScriptedProgram::new();
        let addr = prog.define("spin", |gc| loop {
            gc.burn(1_000)?;
        });
        let mut m = machine_with(prog);
        let err = m.call(&mut NullHandler, addr, &[], 10_000).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn fork_isolates_memory() {
        let mut prog = ScriptedProgram::new();
        let addr = prog.define("alloc", |gc| {
            let a = gc.alloc_bytes(b"base")?;
            Ok(a as i64)
        });
        let mut m = machine_with(prog);
        let out = m.call(&mut NullHandler, addr, &[], 1_000_000).unwrap();
        let a = match out {
            CallOutcome::Returned(v) => v as GuestAddr,
            other => panic!("unexpected outcome {other:?}"),
        };
        let mut child = m.fork().unwrap();
        child.mem_mut().write(a, b"CHLD").unwrap();
        assert_eq!(m.mem().read(a, 4).unwrap(), b"base");
        assert_eq!(child.mem().read(a, 4).unwrap(), b"CHLD");
    }

    #[test]
    fn memcpy_across_machines() {
        let mut prog = ScriptedProgram::new();
        prog.define("noop", |_| Ok(0));
        let mut src = machine_with(prog);
        let a = src.mem_mut().alloc(8).unwrap();
        src.mem_mut().write(a, b"transfer").unwrap();

        let mut prog2 = ScriptedProgram::new();
        prog2.define("noop", |_| Ok(0));
        let mut dst = machine_with(prog2);
        let b = dst.mem_mut().alloc(8).unwrap();
        crate::memcpy_across(&mut *dst, b, &*src, a, 8).unwrap();
        assert_eq!(dst.mem().read(b, 8).unwrap(), b"transfer");
    }
}
