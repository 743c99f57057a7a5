//! Live updates: atomic program swap with optional state handoff.
//!
//! A candidate instance is constructed first (running its main(), which
//! validates the program), then swapped into the tenant's program slot.
//! If the old program registered a serializer (hook slot 10) and the new
//! one a resumer (slot 11), the serialized state moves across the two
//! storage machines. The guest owns the serialized format; the host only
//! moves bytes.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};

use tenvm_contracts::VslLog;
use tenvm_machine::{memcpy_across, CallOutcome, MachineError, MachineLoader};

use crate::decision::Hook;
use crate::program::{MachineInstance, ServiceEnv};
use crate::script::REGEX_HARD_MAX;
use crate::tenancy::{apply_dollar_vars, file_loader, SandboxTenant, TenantConfig};

pub struct UpdateParams<'a> {
    pub data: &'a [u8],
    pub is_debug: bool,
}

/// Install a new program for `tenant`, returning the result text sent
/// back to the updater client. Debug updates go to the debug slot and
/// are never persisted.
pub fn update_program(
    loader: &dyn MachineLoader,
    tenant: &SandboxTenant,
    log: &mut VslLog,
    params: &UpdateParams<'_>,
) -> String {
    if params.data.is_empty() {
        return "Empty file received".to_string();
    }

    let inst = match MachineInstance::new(
        loader,
        params.data.to_vec(),
        &tenant.config,
        params.is_debug,
        log,
    ) {
        Ok(inst) => Arc::new(inst),
        Err(e) => return describe_failure(&e),
    };

    let old = if params.is_debug {
        tenant.debug_program.swap(Some(Arc::clone(&inst)))
    } else {
        tenant.program.swap(Some(Arc::clone(&inst)))
    };

    if let Some(old) = old {
        if let Err(e) = transfer_state(&old, &inst, &tenant.config, log) {
            // The swap stands; running requests keep the program they
            // forked from and new requests get the new one.
            return format!("Machine exception: {e}\n");
        }
    }

    if !params.is_debug {
        if let Err(e) = persist_program(&tenant.config.filename, &inst.binary) {
            let msg = format!("Could not write '{}'", tenant.config.filename);
            log.error(format!("{msg}: {e:#}"));
            return msg;
        }
    }
    "Update successful\n".to_string()
}

/// Builtin file-path update: snapshot argv, optionally append one extra
/// argument visible only to the constructed instance, and restore the
/// snapshot afterwards (or on failure).
pub fn update_from_file(
    loader: &dyn MachineLoader,
    tenant: &SandboxTenant,
    log: &mut VslLog,
    filename: &str,
    extra_argument: Option<&str>,
) -> bool {
    let path = apply_dollar_vars(filename);
    let binary = match file_loader(&path) {
        Ok(b) => b,
        Err(e) => {
            log.error(format!("live_update_file '{path}' failed: {e:#}"));
            return false;
        }
    };

    let old_argv = tenant.config.group.argv.load_full();
    if let Some(arg) = extra_argument {
        let mut next = (*old_argv).clone();
        next.push(arg.to_string());
        tenant.config.group.argv.store(Arc::new(next));
    }

    let inst = match MachineInstance::new(loader, binary, &tenant.config, false, log) {
        Ok(inst) => Arc::new(inst),
        Err(e) => {
            tenant.config.group.argv.store(old_argv);
            log.error(format!("live_update_file '{path}' failed: {e:#}"));
            return false;
        }
    };
    tenant.config.group.argv.store(old_argv);

    let old = tenant.program.swap(Some(Arc::clone(&inst)));
    if let Some(old) = old {
        if let Err(e) = transfer_state(&old, &inst, &tenant.config, log) {
            log.error(format!("live_update_file state transfer failed: {e}"));
            return false;
        }
    }
    true
}

fn describe_failure(e: &anyhow::Error) -> String {
    match e.root_cause().downcast_ref::<MachineError>() {
        Some(MachineError::OutOfMemory) => {
            "Program ran out of memory, update not applied".to_string()
        }
        Some(MachineError::Fault { what, data }) => {
            format!("Machine exception: {what} (data: {data:#x})\n")
        }
        Some(other) => format!("Machine exception: {other}\n"),
        None => format!("{e:#}"),
    }
}

/// Move serialized guest state from the old instance's storage machine
/// into the new one's, if both sides implement the handoff pair.
fn transfer_state(
    old: &MachineInstance,
    new: &MachineInstance,
    config: &TenantConfig,
    log: &mut VslLog,
) -> Result<(), MachineError> {
    let luaddr = old.callback_entries[Hook::LiveUpdate as usize];
    if luaddr == 0 {
        log.debug("live-update state transfer skipped (old program lacks serializer)".to_string());
        return Ok(());
    }
    let resaddr = new.callback_entries[Hook::ResumeUpdate as usize];
    if resaddr == 0 {
        log.debug("live-update deserialization skipped (new program lacks resume)".to_string());
        return Ok(());
    }

    let budget = config.max_instructions();
    let max_regex = config.group.max_regex.min(REGEX_HARD_MAX);

    let mut old_machine = old.storage().lock().map_err(|_| MachineError::Fault {
        what: "storage machine poisoned".to_string(),
        data: 0,
    })?;
    let outcome = {
        let mut env = ServiceEnv::new(log, &config.name, true, max_regex);
        old_machine.call(&mut env, luaddr, &[], budget)?
    };
    if outcome != CallOutcome::Halted {
        log.debug("live-update serializer returned no data".to_string());
        return Ok(());
    }
    let regs = old_machine.sysargs();
    let (data_addr, data_len) = (regs[0], regs[1] as usize);

    let mut new_machine = new.storage().lock().map_err(|_| MachineError::Fault {
        what: "storage machine poisoned".to_string(),
        data: 0,
    })?;
    let dst = new_machine.mem_mut().alloc(data_len)?;
    memcpy_across(&mut **new_machine, dst, &**old_machine, data_addr, data_len)?;

    let mut env = ServiceEnv::new(log, &config.name, true, max_regex);
    new_machine.call(&mut env, resaddr, &[dst, data_len as u64], budget)?;
    Ok(())
}

/// Write-then-rename persist next to the target file.
fn persist_program(filename: &str, binary: &[u8]) -> Result<()> {
    let path = std::path::Path::new(filename);
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file near '{filename}'"))?;
    tmp.write_all(binary)
        .with_context(|| format!("writing program for '{filename}'"))?;
    tmp.persist(path)
        .with_context(|| format!("renaming program into '{filename}'"))?;
    Ok(())
}
