//! The VCL-facing API surface.
//!
//! Mirrors the functions the proxy exposes to VCL, operating on a
//! per-request [`RequestState`] slot (the proxy's priv_task rendered as
//! an owned value). The script created by `fork` lives in the slot until
//! the request ends; dropping the state is the unconditional destructor.

use tenvm_contracts::VclCtx;
use tenvm_machine::GuestAddr;

use crate::backend::{UpdaterDirector, VmBackendDirector};
use crate::decision::{action_for, Hook, SynthBody, VclAction, RESULTS_MAX};
use crate::script::Script;
use crate::tenancy::Sandbox;
use crate::update;

/// Per-request slot owning the script.
#[derive(Default)]
pub struct RequestState {
    pub script: Option<Script>,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Load tenant definitions from an inline JSON string.
pub fn embed_tenants(sandbox: &Sandbox, ctx: &mut VclCtx, json: &str) {
    sandbox.load_tenants_json(ctx, json, "string");
}

/// Load tenant definitions from a JSON file.
pub fn load_tenants(sandbox: &Sandbox, ctx: &mut VclCtx, path: &str) {
    sandbox.load_tenants_file(ctx, path);
}

/// Instantiate every tenant that still lacks a program. Call after the
/// tenant and argv setup, before the first request.
pub fn finalize_tenants(sandbox: &Sandbox, ctx: &mut VclCtx) {
    sandbox.finalize(&mut ctx.log);
}

pub fn add_main_argument(sandbox: &Sandbox, ctx: &mut VclCtx, tenant: &str, arg: &str) {
    sandbox.add_main_argument(&mut ctx.log, tenant, arg);
}

/// Fork a per-request VM for `tenant`. The script is freed when the
/// request state is dropped.
pub fn fork(
    sandbox: &Sandbox,
    ctx: &mut VclCtx,
    state: &mut RequestState,
    tenant: &str,
    debug: bool,
) -> bool {
    let Some(t) = sandbox.tenant(tenant) else {
        ctx.log.error(format!("fork: no such tenant '{tenant}'"));
        return false;
    };
    match t.vmfork(&mut ctx.log, debug) {
        Some(script) => {
            state.script = Some(script);
            true
        }
        None => false,
    }
}

/// Is there a VM for this request?
pub fn active(state: &RequestState) -> bool {
    state.script.is_some()
}

pub fn current_name(state: &RequestState) -> Option<&str> {
    state.script.as_ref().map(|s| s.name())
}

/// Dispatch to the hook matching the current VCL phase. The string
/// argument is accepted for VCL symmetry and currently unused.
pub fn run(ctx: &mut VclCtx, state: &mut RequestState, _arg: Option<&str>) -> i64 {
    let hook = Hook::for_phase(ctx.phase);
    vcall(ctx, state, hook)
}

/// Dispatch to a specific hook.
pub fn vcall(ctx: &mut VclCtx, state: &mut RequestState, hook: Hook) -> i64 {
    let Some(script) = state.script.as_mut() else {
        ctx.fail("vcall failed (no running machine)");
        return -1;
    };
    let (arg1, arg2) = hook.args();
    script.vcall(ctx, hook, arg1, arg2)
}

/// String-keyed guest call; the returned guest string is copied into
/// workspace.
pub fn call(
    ctx: &mut VclCtx,
    state: &mut RequestState,
    function: &str,
    arg: &str,
) -> Option<String> {
    let Some(script) = state.script.as_mut() else {
        ctx.fail("no active VM for this request");
        return None;
    };
    script.call_named(ctx, function, arg)
}

/// Resume a script paused by `pause_for`.
pub fn resume(ctx: &mut VclCtx, state: &mut RequestState) -> i64 {
    match state.script.as_mut() {
        Some(script) => script.resume(ctx),
        None => -1,
    }
}

/// The decision token the VM wants acted on ("lookup", "synth", ...).
pub fn want_result(state: &RequestState) -> &str {
    state
        .script
        .as_ref()
        .map(|s| s.want_result())
        .unwrap_or("")
}

/// Status code the VM wants returned, when relevant (synth).
pub fn want_status(state: &RequestState) -> i64 {
    result_value(state, 0)
}

pub fn result_value(state: &RequestState, idx: usize) -> i64 {
    match state.script.as_ref() {
        Some(script) if idx < RESULTS_MAX => script.want_values()[idx] as i64,
        _ => 503,
    }
}

/// Read `want_values[idx]` as a guest string copied into workspace.
pub fn result_as_string(ctx: &mut VclCtx, state: &RequestState, idx: usize) -> Option<String> {
    state.script.as_ref()?.result_string(ctx, idx)
}

pub fn want_resume(state: &RequestState) -> bool {
    state.script.as_ref().map(|s| s.is_paused()).unwrap_or(false)
}

/// Contribute the accumulated hash_data SHA-256 to the object hash.
pub fn apply_hash(ctx: &mut VclCtx, state: &mut RequestState) -> bool {
    match state.script.as_mut() {
        Some(script) => script.apply_hash(ctx),
        None => false,
    }
}

/// The proxy action implied by the current decision state.
pub fn decision_action(state: &RequestState) -> VclAction {
    match state.script.as_ref() {
        Some(script) => action_for(script.decision()),
        None => VclAction::Default,
    }
}

/// The synth body recorded by the guest, if any.
pub fn synth_body(state: &RequestState) -> Option<&SynthBody> {
    state.script.as_ref()?.decision().synth.as_ref()
}

/// Install the VM backend director. `func`/`farg` carry a guest address
/// and argument as decimal strings (usually read back from result
/// values); with no `func`, the generator recorded by the guest's
/// `backend_decision` is used.
pub fn vm_backend(
    ctx: &mut VclCtx,
    state: &RequestState,
    func: Option<&str>,
    farg: Option<&str>,
) -> Option<VmBackendDirector> {
    let Some(script) = state.script.as_ref() else {
        ctx.fail("VM backend: no active tenant");
        return None;
    };
    if let Some(func) = func {
        let funcaddr: GuestAddr = func.trim().parse().unwrap_or(0);
        if funcaddr == 0 {
            return None;
        }
        let funcarg: u64 = farg.and_then(|s| s.trim().parse().ok()).unwrap_or(0);
        return Some(VmBackendDirector::new(funcaddr, funcarg, script.name()));
    }
    match &script.decision().forge {
        Some(forge) if forge.trampoline != 0 => Some(VmBackendDirector::new(
            forge.trampoline,
            forge.func,
            script.name(),
        )),
        _ => {
            ctx.fail("VM backend: no generator recorded");
            None
        }
    }
}

/// Install the live-update backend for `tenant`.
pub fn live_update(
    sandbox: &Sandbox,
    ctx: &mut VclCtx,
    tenant: &str,
    max_size: u64,
) -> Option<UpdaterDirector> {
    updater(sandbox, ctx, tenant, max_size, false)
}

/// Same, targeting the debug program slot.
pub fn live_debug(
    sandbox: &Sandbox,
    ctx: &mut VclCtx,
    tenant: &str,
    max_size: u64,
) -> Option<UpdaterDirector> {
    updater(sandbox, ctx, tenant, max_size, true)
}

fn updater(
    sandbox: &Sandbox,
    ctx: &mut VclCtx,
    tenant: &str,
    max_size: u64,
    is_debug: bool,
) -> Option<UpdaterDirector> {
    let Some(t) = sandbox.tenant(tenant) else {
        ctx.fail(format!("could not find tenant: {tenant}"));
        return None;
    };
    Some(UpdaterDirector::new(
        sandbox.loader_arc(),
        t,
        max_size,
        is_debug,
    ))
}

/// Builtin update from a file path.
pub fn live_update_file(
    sandbox: &Sandbox,
    ctx: &mut VclCtx,
    tenant: &str,
    path: &str,
    extra_argument: Option<&str>,
) -> bool {
    let Some(t) = sandbox.tenant(tenant) else {
        ctx.fail(format!("live_update_file: could not find tenant: {tenant}"));
        return false;
    };
    update::update_from_file(sandbox.loader(), &t, &mut ctx.log, path, extra_argument)
}
