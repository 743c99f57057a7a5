//! The tenvm sandbox runtime.
//!
//! Operators load guest programs as *tenants*; each request forks a
//! per-request VM from the tenant's warm template, guest hooks run in the
//! proxy's VCL phases, and their hypercalls and decision tokens drive the
//! proxy: cache lookups, passes, synthesized responses, hash
//! contributions, header edits, and guest-generated backend responses.
//! Tenants can be hot-swapped at runtime with optional state handoff.

mod backend;
mod cache;
mod decision;
mod hypercalls;
mod program;
mod script;
mod tenancy;
mod update;
pub mod vcl;

pub use backend::{Director, UpdaterDirector, VmBackendDirector, POST_BUFFER, VMBE_NUM_BUFFERS};
pub use cache::HandleCache;
pub use decision::{
    Decision, DecisionState, ForgeRequest, Hook, SynthBody, VclAction, CALLBACK_MAX,
    CALLBACK_NAMES, RESULTS_MAX,
};
pub use hypercalls::{Syscall, DYNCALL_FORGE};
pub use program::MachineInstance;
pub use script::{Script, DIRECTOR_HARD_MAX, REGEX_HARD_MAX};
pub use tenancy::{Sandbox, SandboxTenant, TenantConfig, TenantGroup};
pub use update::{update_from_file, update_program, UpdateParams};
pub use vcl::RequestState;
