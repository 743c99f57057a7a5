//! Shared scripted-guest helpers for the integration tests: a test bed
//! wiring a `ScriptedLoader` into a `Sandbox`, a hook-program builder
//! that performs the register/wait-for-requests init dance, and thin
//! wrappers over the syscall ABI.

#![allow(dead_code)]

use std::sync::Arc;

use tenvm_contracts::{VclCtx, VclPhase};
use tenvm_machine::{GuestAddr, GuestCall, GuestStop, ScriptedLoader, ScriptedProgram};
use tenvm_runtime::{vcl, Hook, RequestState, Sandbox, Syscall};

pub struct TestBed {
    pub sandbox: Sandbox,
    pub loader: Arc<ScriptedLoader>,
    dir: tempfile::TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        let loader = Arc::new(ScriptedLoader::new());
        TestBed {
            sandbox: Sandbox::new(loader.clone()),
            loader,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Make a fake program binary available on disk and in the loader.
    pub fn register_program(&self, tag: &str, prog: ScriptedProgram) -> String {
        self.loader.register(tag.as_bytes(), prog);
        let path = self.dir.path().join(format!("{tag}.elf"));
        std::fs::write(&path, tag.as_bytes()).expect("write program file");
        path.to_string_lossy().into_owned()
    }

    /// Declare a tenant for an already registered program and finalize.
    /// `extra` is spliced into the tenant's JSON entry.
    pub fn add_tenant(&self, name: &str, tag: &str, extra: &str) {
        let path = self.dir.path().join(format!("{tag}.elf"));
        let sep = if extra.is_empty() { "" } else { ", " };
        let json = format!(
            r#"{{ "{name}": {{ "filename": "{}"{sep}{extra} }} }}"#,
            path.to_string_lossy()
        );
        let mut ctx = VclCtx::for_request("GET", "/");
        vcl::embed_tenants(&self.sandbox, &mut ctx, &json);
        assert_eq!(ctx.failed(), None, "tenant load failed");
        vcl::finalize_tenants(&self.sandbox, &mut ctx);
    }

    pub fn install(&self, name: &str, tag: &str, prog: ScriptedProgram) {
        self.register_program(tag, prog);
        self.add_tenant(name, tag, "");
    }

    /// Fork a script for `name` into a fresh request state.
    pub fn fork(&self, ctx: &mut VclCtx, name: &str) -> RequestState {
        let mut state = RequestState::new();
        assert!(
            vcl::fork(&self.sandbox, ctx, &mut state, name, false),
            "fork of '{name}' failed: {:?}",
            ctx.log.lines()
        );
        state
    }
}

/// Builds a guest program from per-hook closures, wiring the
/// register-callback / wait-for-requests init sequence.
pub struct HookProgram {
    pub prog: ScriptedProgram,
    hooks: Vec<(Hook, GuestAddr)>,
    init: Option<Arc<dyn Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync>>,
}

impl HookProgram {
    pub fn new() -> Self {
        HookProgram {
            prog: ScriptedProgram::new(),
            hooks: Vec::new(),
            init: None,
        }
    }

    pub fn hook<F>(mut self, hook: Hook, f: F) -> Self
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        let addr = self.prog.define_anon(f);
        self.hooks.push((hook, addr));
        self
    }

    /// Add a named function reachable through the symbol table.
    pub fn func<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        self.prog.define(name, f);
        self
    }

    /// Run extra guest code during main(), before the hooks register.
    pub fn init<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut GuestCall<'_>) -> Result<i64, GuestStop> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(f));
        self
    }

    pub fn build(mut self) -> ScriptedProgram {
        let hooks = self.hooks.clone();
        let init = self.init.clone();
        self.prog.entry(move |gc| {
            if let Some(init) = &init {
                init(gc)?;
            }
            let mut recv: GuestAddr = 0;
            for (hook, addr) in &hooks {
                if *hook == Hook::Recv {
                    recv = *addr;
                } else {
                    gc.syscall(Syscall::RegisterCallback as u32, &[*hook as u64, *addr])?;
                }
            }
            gc.syscall(Syscall::WaitForRequests as u32, &[recv, 0xFEE0])?;
            Ok(0)
        });
        self.prog
    }
}

// Guest-side syscall wrappers.

pub fn sys_append(gc: &mut GuestCall<'_>, whence: u64, line: &str) -> Result<i64, GuestStop> {
    let (ptr, len) = gc.alloc_str(line)?;
    gc.syscall(Syscall::FieldAppend as u32, &[whence, ptr, len])
}

pub fn sys_find(gc: &mut GuestCall<'_>, whence: u64, name: &str) -> Result<i64, GuestStop> {
    let (ptr, len) = gc.alloc_str(name)?;
    gc.syscall(Syscall::HttpFind as u32, &[whence, ptr, len])
}

/// Two-pass retrieve: size query, then copy.
pub fn sys_retrieve(
    gc: &mut GuestCall<'_>,
    whence: u64,
    handle: u64,
) -> Result<Option<String>, GuestStop> {
    let len = gc.syscall(Syscall::FieldRetrieve as u32, &[whence, handle, 0, 0])?;
    if len <= 0 {
        return Ok(None);
    }
    let buf = gc.alloc_bytes(&vec![0u8; len as usize + 1])?;
    let n = gc.syscall(
        Syscall::FieldRetrieve as u32,
        &[whence, handle, buf, len as u64],
    )?;
    if n < 0 {
        return Ok(None);
    }
    let bytes = gc.read(buf, n as usize)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

pub fn sys_decision(
    gc: &mut GuestCall<'_>,
    token: &str,
    status: u64,
    paused: bool,
) -> Result<i64, GuestStop> {
    let (ptr, len) = gc.alloc_str(token)?;
    gc.syscall(
        Syscall::SetDecision as u32,
        &[ptr, len, status, paused as u64],
    )
}

/// Non-returning synth: records the body and halts the guest call.
pub fn sys_synth(
    gc: &mut GuestCall<'_>,
    status: u64,
    ctype: &str,
    body: &[u8],
) -> Result<i64, GuestStop> {
    let (cptr, clen) = gc.alloc_str(ctype)?;
    let dptr = gc.alloc_bytes(body)?;
    gc.syscall(
        Syscall::Synth as u32,
        &[status, cptr, clen, dptr, body.len() as u64],
    )
}

pub fn sys_hash_data(gc: &mut GuestCall<'_>, data: &[u8]) -> Result<i64, GuestStop> {
    let ptr = gc.alloc_bytes(data)?;
    gc.syscall(Syscall::HashData as u32, &[ptr, data.len() as u64])
}

pub fn sys_regex_compile(gc: &mut GuestCall<'_>, pattern: &str) -> Result<i64, GuestStop> {
    let (ptr, len) = gc.alloc_str(pattern)?;
    gc.syscall(Syscall::RegexCompile as u32, &[ptr, len])
}

pub fn sys_regex_match(gc: &mut GuestCall<'_>, idx: u64, text: &str) -> Result<i64, GuestStop> {
    let (ptr, len) = gc.alloc_str(text)?;
    gc.syscall(Syscall::RegexMatch as u32, &[idx, ptr, len])
}

/// The non-returning forge trap; halts the machine with the response in
/// its registers.
pub fn sys_forge(
    gc: &mut GuestCall<'_>,
    status: u64,
    ctype: &str,
    body: &[u8],
) -> Result<i64, GuestStop> {
    let (cptr, clen) = gc.alloc_str(ctype)?;
    let dptr = if body.is_empty() {
        0
    } else {
        gc.alloc_bytes(body)?
    };
    gc.syscall(
        tenvm_runtime::DYNCALL_FORGE,
        &[status, cptr, clen, dptr, body.len() as u64],
    )
}

/// Standard ctx for the deliver phase (req + resp present).
pub fn deliver_ctx(method: &str, url: &str) -> VclCtx {
    let mut ctx = VclCtx::for_request(method, url);
    ctx.phase = VclPhase::Deliver;
    ctx
}
