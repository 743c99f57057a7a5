//! Guest decision state and the mapping from hooks to proxy actions.

use tenvm_contracts::{HttpWhere, VclPhase, HDR_INVALID};
use tenvm_machine::GuestAddr;

pub const RESULTS_MAX: usize = 3;
pub const CALLBACK_MAX: usize = 12;

/// Hook slot names, indexed by [`Hook`] value. Slot 0 is unused.
pub const CALLBACK_NAMES: [&str; CALLBACK_MAX] = [
    "",
    "on_recv",
    "on_hash",
    "on_synth",
    "on_backend_fetch",
    "on_backend_response",
    "on_backend_error",
    "on_deliver",
    "on_hit",
    "on_miss",
    "on_live_update",
    "on_resume_update",
];

/// Guest hook slots. The values are part of the guest ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Hook {
    Recv = 1,
    Hash = 2,
    Synth = 3,
    BackendFetch = 4,
    BackendResponse = 5,
    BackendError = 6,
    Deliver = 7,
    Hit = 8,
    Miss = 9,
    LiveUpdate = 10,
    ResumeUpdate = 11,
}

impl Hook {
    pub fn name(self) -> &'static str {
        CALLBACK_NAMES[self as usize]
    }

    pub fn for_phase(phase: VclPhase) -> Hook {
        match phase {
            VclPhase::Recv => Hook::Recv,
            VclPhase::Hash => Hook::Hash,
            VclPhase::Synth => Hook::Synth,
            VclPhase::Hit => Hook::Hit,
            VclPhase::Miss => Hook::Miss,
            VclPhase::Deliver => Hook::Deliver,
            VclPhase::BackendFetch => Hook::BackendFetch,
            VclPhase::BackendResponse => Hook::BackendResponse,
            VclPhase::BackendError => Hook::BackendError,
        }
    }

    /// The two `where` arguments handed to the hook, [`HDR_INVALID`]
    /// where the phase has no message of that kind.
    pub fn args(self) -> (u64, u64) {
        let w = |x: HttpWhere| x as u64;
        let inv = HDR_INVALID as u64;
        match self {
            Hook::Recv => (w(HttpWhere::Req), inv),
            Hook::Hash => (inv, inv),
            Hook::Synth => (w(HttpWhere::Req), w(HttpWhere::Resp)),
            Hook::BackendFetch | Hook::BackendResponse | Hook::BackendError => {
                (w(HttpWhere::Bereq), w(HttpWhere::Beresp))
            }
            Hook::Deliver => (w(HttpWhere::Req), w(HttpWhere::Resp)),
            Hook::Hit => (w(HttpWhere::Req), w(HttpWhere::Obj)),
            Hook::Miss => (w(HttpWhere::Req), w(HttpWhere::Bereq)),
            Hook::LiveUpdate | Hook::ResumeUpdate => (inv, inv),
        }
    }
}

/// The closed set of decision tokens a guest can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// No decision taken; the proxy continues with its default.
    #[default]
    None,
    Hash,
    Pass,
    Lookup,
    Synth,
    Fetch,
    Deliver,
    Retry,
    Restart,
    Abandon,
    Fail,
}

impl Decision {
    pub fn parse(token: &str) -> Option<Decision> {
        Some(match token {
            "" => Decision::None,
            "hash" => Decision::Hash,
            "pass" => Decision::Pass,
            "lookup" => Decision::Lookup,
            "synth" => Decision::Synth,
            "fetch" => Decision::Fetch,
            "deliver" => Decision::Deliver,
            "retry" => Decision::Retry,
            "restart" => Decision::Restart,
            "abandon" => Decision::Abandon,
            "fail" => Decision::Fail,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::None => "",
            Decision::Hash => "hash",
            Decision::Pass => "pass",
            Decision::Lookup => "lookup",
            Decision::Synth => "synth",
            Decision::Fetch => "fetch",
            Decision::Deliver => "deliver",
            Decision::Retry => "retry",
            Decision::Restart => "restart",
            Decision::Abandon => "abandon",
            Decision::Fail => "fail",
        }
    }
}

/// Synth body recorded by the `synth` hypercall.
#[derive(Debug, Clone)]
pub struct SynthBody {
    pub ctype: String,
    pub body: Vec<u8>,
}

/// Backend generator recorded by `backend_decision`: either a trampoline
/// plus guest function, or an inline argument blob for the default
/// generator.
#[derive(Debug, Clone)]
pub struct ForgeRequest {
    pub cached: bool,
    pub trampoline: GuestAddr,
    pub func: GuestAddr,
    pub arg: Option<Vec<u8>>,
}

/// Per-hook decision state. Small and fixed-size; reset on every fork.
#[derive(Debug, Default)]
pub struct DecisionState {
    pub result: Decision,
    pub values: [u64; RESULTS_MAX],
    pub paused: bool,
    pub synth: Option<SynthBody>,
    pub forge: Option<ForgeRequest>,
}

impl DecisionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decision. The first decision per hook wins; later calls
    /// are ignored except that a pause request still pauses.
    pub fn set(&mut self, decision: Decision, status: u64, paused: bool) -> bool {
        if paused {
            self.paused = true;
        }
        if self.result != Decision::None {
            return false;
        }
        self.result = decision;
        self.values[0] = status;
        true
    }
}

/// What the proxy should do after reading the decision state in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VclAction {
    Default,
    ApplyHash,
    Lookup,
    Pass,
    Synth(u16),
    Fetch,
    Deliver,
    Retry,
    Restart,
    Abandon,
    Fail,
}

/// Map the decision state onto the proxy action for the current phase.
pub fn action_for(state: &DecisionState) -> VclAction {
    match state.result {
        Decision::None => VclAction::Default,
        Decision::Hash => VclAction::ApplyHash,
        Decision::Lookup => VclAction::Lookup,
        Decision::Pass => VclAction::Pass,
        Decision::Synth => VclAction::Synth(state.values[0] as u16),
        Decision::Fetch => VclAction::Fetch,
        Decision::Deliver => VclAction::Deliver,
        Decision::Retry => VclAction::Retry,
        Decision::Restart => VclAction::Restart,
        Decision::Abandon => VclAction::Abandon,
        Decision::Fail => VclAction::Fail,
    }
}
