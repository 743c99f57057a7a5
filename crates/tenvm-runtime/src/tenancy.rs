//! Tenant configuration and registry.
//!
//! Tenants are declared in a JSON document mapping names to entries: an
//! entry with a `filename` creates a tenant, an entry without one either
//! reconfigures an existing tenant of that name or defines/extends a
//! limit group. The registry is written once at VCL load and read-only
//! afterwards; `finalize` instantiates every tenant program before the
//! first request runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use arc_swap::{ArcSwap, ArcSwapOption};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use tenvm_contracts::{crc32c, VclCtx, VslLog};
use tenvm_machine::{MachineLimits, MachineLoader};

use crate::program::MachineInstance;
use crate::script::Script;

/// Aggregate limits shared by a named group of tenants. Each tenant
/// captures its own copy at load time, overrides applied.
#[derive(Debug)]
pub struct TenantGroup {
    pub max_instructions: u64,
    pub max_memory_mb: u32,
    pub max_heap_mb: u32,
    pub max_backends: usize,
    pub max_regex: usize,
    pub verbose: bool,
    /// Shared main() argument vector; replaced atomically, never mutated
    /// in place.
    pub argv: ArcSwap<Vec<String>>,
}

impl Default for TenantGroup {
    fn default() -> Self {
        TenantGroup {
            max_instructions: 20_000_000,
            max_memory_mb: 32,
            max_heap_mb: 512,
            max_backends: 8,
            max_regex: 32,
            verbose: false,
            argv: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl Clone for TenantGroup {
    fn clone(&self) -> Self {
        TenantGroup {
            max_instructions: self.max_instructions,
            max_memory_mb: self.max_memory_mb,
            max_heap_mb: self.max_heap_mb,
            max_backends: self.max_backends,
            max_regex: self.max_regex,
            verbose: self.verbose,
            argv: ArcSwap::new(self.argv.load_full()),
        }
    }
}

/// One tenant entry in the JSON document. Entries double as group
/// property bags, so every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TenantEntry {
    filename: Option<String>,
    group: Option<String>,
    max_memory: Option<u32>,
    max_heap: Option<u32>,
    max_instructions: Option<u64>,
    max_regex: Option<usize>,
    max_backends: Option<usize>,
    verbose: Option<bool>,
    arguments: Option<Vec<String>>,
}

impl TenantEntry {
    fn apply_to(&self, group: &mut TenantGroup) {
        if let Some(v) = self.max_memory {
            group.max_memory_mb = v;
        }
        if let Some(v) = self.max_heap {
            group.max_heap_mb = v;
        }
        if let Some(v) = self.max_instructions {
            group.max_instructions = v;
        }
        if let Some(v) = self.max_regex {
            group.max_regex = v;
        }
        if let Some(v) = self.max_backends {
            group.max_backends = v;
        }
        if let Some(v) = self.verbose {
            group.verbose = v;
        }
        if let Some(v) = &self.arguments {
            group.argv.store(Arc::new(v.clone()));
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub name: String,
    pub filename: String,
    pub group: TenantGroup,
}

impl TenantConfig {
    pub fn new(name: impl Into<String>, filename: impl Into<String>, group: TenantGroup) -> Self {
        TenantConfig {
            name: name.into(),
            filename: filename.into(),
            group,
        }
    }

    pub fn max_instructions(&self) -> u64 {
        self.group.max_instructions
    }

    pub fn max_memory(&self) -> u64 {
        (self.group.max_memory_mb as u64) << 20
    }

    pub fn max_heap(&self) -> u64 {
        (self.group.max_heap_mb as u64) << 20
    }

    pub fn machine_limits(&self) -> MachineLimits {
        MachineLimits {
            max_memory: self.max_memory(),
            max_heap: self.max_heap(),
        }
    }
}

/// A named tenant: its config plus the atomically swappable program
/// slots. Old programs stay alive until the last script forked from them
/// is dropped.
pub struct SandboxTenant {
    pub config: TenantConfig,
    pub program: ArcSwapOption<MachineInstance>,
    pub debug_program: ArcSwapOption<MachineInstance>,
}

impl SandboxTenant {
    pub fn new(config: TenantConfig) -> Self {
        SandboxTenant {
            config,
            program: ArcSwapOption::empty(),
            debug_program: ArcSwapOption::empty(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn no_program_loaded(&self) -> bool {
        self.program.load().is_none()
    }

    /// Read the tenant's program file and construct its template.
    pub fn load(&self, loader: &dyn MachineLoader, log: &mut VslLog) -> Result<()> {
        let path = apply_dollar_vars(&self.config.filename);
        let binary = file_loader(&path)?;
        let inst = MachineInstance::new(loader, binary, &self.config, false, log)?;
        self.program.store(Some(Arc::new(inst)));
        Ok(())
    }

    /// Fork a per-request script from the current program. The script
    /// takes its own strong reference; a concurrent hot swap does not
    /// affect it.
    pub fn vmfork(&self, log: &mut VslLog, debug: bool) -> Option<Script> {
        let slot = if debug { &self.debug_program } else { &self.program };
        let Some(inst) = slot.load_full() else {
            log.error(format!("vmfork: no program loaded for '{}'", self.name()));
            return None;
        };
        match Script::fork(&self.config, inst) {
            Ok(script) => Some(script),
            Err(e) => {
                log.error(format!("vmfork of '{}' failed: {e}", self.name()));
                None
            }
        }
    }

    /// Append one argument to the shared argv vector, copy-on-write.
    pub fn append_main_argument(&self, arg: &str) {
        self.config.group.argv.rcu(|argv| {
            let mut next = (**argv).clone();
            next.push(arg.to_string());
            next
        });
    }
}

/// The tenant registry, keyed by CRC32-C of the tenant name. One per
/// loaded VCL.
pub struct Sandbox {
    loader: Arc<dyn MachineLoader>,
    tenants: RwLock<HashMap<u32, Arc<SandboxTenant>>>,
}

impl Sandbox {
    pub fn new(loader: Arc<dyn MachineLoader>) -> Self {
        Sandbox {
            loader,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &dyn MachineLoader {
        &*self.loader
    }

    pub fn loader_arc(&self) -> Arc<dyn MachineLoader> {
        Arc::clone(&self.loader)
    }

    pub fn tenant(&self, name: &str) -> Option<Arc<SandboxTenant>> {
        let key = crc32c(name.as_bytes());
        self.tenants.read().ok()?.get(&key).cloned()
    }

    pub fn tenant_names(&self) -> Vec<String> {
        match self.tenants.read() {
            Ok(map) => map.values().map(|t| t.name().to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Load tenant definitions from a JSON string. Config errors fail the
    /// VCL load via `ctx.fail`; per-entry group mismatches are logged and
    /// skipped.
    pub fn load_tenants_json(&self, ctx: &mut VclCtx, text: &str, source: &str) {
        if let Err(e) = self.init_tenants(ctx, text) {
            ctx.fail(format!("exception '{e:#}' when loading tenants from: {source}"));
        }
    }

    /// Same, from a file path ($-variables expanded from the environment).
    pub fn load_tenants_file(&self, ctx: &mut VclCtx, path: &str) {
        let path = apply_dollar_vars(path);
        match std::fs::read_to_string(&path) {
            Ok(text) => self.load_tenants_json(ctx, &text, &path),
            Err(e) => ctx.fail(format!("could not read tenant config '{path}': {e}")),
        }
    }

    fn init_tenants(&self, ctx: &mut VclCtx, text: &str) -> Result<()> {
        let doc: BTreeMap<String, TenantEntry> =
            serde_json::from_str(text).context("tenant config is not a JSON object")?;

        let mut groups: BTreeMap<String, TenantGroup> = BTreeMap::new();
        groups.insert("test".to_string(), TenantGroup::default());

        for (name, entry) in &doc {
            if let Some(filename) = &entry.filename {
                let group_name = entry.group.as_deref().unwrap_or("test");
                let Some(base) = groups.get(group_name) else {
                    ctx.log.error(format!(
                        "group '{group_name}' missing for tenant: {name}"
                    ));
                    continue;
                };
                let mut group = base.clone();
                entry.apply_to(&mut group);
                self.insert_tenant(TenantConfig::new(name, filename, group))?;
            } else if let Some(tenant) = self.tenant(name) {
                // Existing tenant: reconfigure in place. Load-time only,
                // before any script can hold the tenant.
                let key = crc32c(name.as_bytes());
                let mut map = self
                    .tenants
                    .write()
                    .map_err(|_| anyhow::anyhow!("tenant registry poisoned"))?;
                drop(tenant);
                if let Some(slot) = map.get_mut(&key) {
                    match Arc::get_mut(slot) {
                        Some(t) => entry.apply_to(&mut t.config.group),
                        None => ctx.log.error(format!(
                            "cannot reconfigure tenant '{name}' while it is in use"
                        )),
                    }
                }
            } else {
                let group = groups.entry(name.clone()).or_default();
                entry.apply_to(group);
            }
        }
        Ok(())
    }

    fn insert_tenant(&self, config: TenantConfig) -> Result<()> {
        let key = crc32c(config.name.as_bytes());
        let mut map = self
            .tenants
            .write()
            .map_err(|_| anyhow::anyhow!("tenant registry poisoned"))?;
        if map.contains_key(&key) {
            anyhow::bail!("tenant {} already existed", config.name);
        }
        map.insert(key, Arc::new(SandboxTenant::new(config)));
        Ok(())
    }

    /// Instantiate every tenant that still lacks a program. Individual
    /// load failures are logged; other tenants are unaffected.
    pub fn finalize(&self, log: &mut VslLog) {
        let tenants: Vec<Arc<SandboxTenant>> = match self.tenants.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return,
        };
        for tenant in tenants {
            if tenant.no_program_loaded() {
                if let Err(e) = tenant.load(&*self.loader, log) {
                    log.error(format!(
                        "could not load program for tenant '{}': {e:#}",
                        tenant.name()
                    ));
                }
            }
        }
    }

    pub fn add_main_argument(&self, log: &mut VslLog, tenant: &str, arg: &str) {
        match self.tenant(tenant) {
            Some(t) => t.append_main_argument(arg),
            None => log.error(format!(
                "attempted to add main argument to non-existent tenant '{tenant}'"
            )),
        }
    }
}

static DOLLAR_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Expand `$VAR` / `${VAR}` from the environment; unknown variables
/// expand to the empty string.
pub(crate) fn apply_dollar_vars(s: &str) -> String {
    DOLLAR_VAR
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or("");
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

pub(crate) fn file_loader(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("could not open file: {path}"))
}
