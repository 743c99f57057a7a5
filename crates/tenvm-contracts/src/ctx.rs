//! The per-request proxy context the sandbox operates on.

use crate::http::{HttpMessage, HttpWhere};
use crate::workspace::Workspace;
use crate::HDR_INVALID;

/// VCL phase the request is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VclPhase {
    Recv,
    Hash,
    Synth,
    Hit,
    Miss,
    Deliver,
    BackendFetch,
    BackendResponse,
    BackendError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VslTag {
    Error,
    Debug,
    Info,
    /// Guest stdout forwarded through `write()`.
    Print,
}

/// Shared-log sink. Lines are collected per request; `echo` mirrors them
/// to stderr for local runs.
#[derive(Debug, Default)]
pub struct VslLog {
    lines: Vec<(VslTag, String)>,
    pub echo: bool,
}

impl VslLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, tag: VslTag, msg: impl Into<String>) {
        let msg = msg.into();
        if self.echo {
            eprintln!("[{tag:?}] {msg}");
        }
        self.lines.push((tag, msg));
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.log(VslTag::Error, msg);
    }

    pub fn debug(&mut self, msg: impl Into<String>) {
        self.log(VslTag::Debug, msg);
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        self.log(VslTag::Info, msg);
    }

    pub fn lines(&self) -> &[(VslTag, String)] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|(_, l)| l.contains(needle))
    }
}

/// The request context handed to every hook invocation. The sandbox never
/// stores it; the proxy may rebind messages between hooks (waitlist
/// processing), which is why everything flows through `&mut VclCtx`
/// parameters.
pub struct VclCtx {
    pub phase: VclPhase,
    msgs: [Option<HttpMessage>; HttpWhere::COUNT],
    pub ws: Workspace,
    pub log: VslLog,
    /// Bans issued against the proxy's global ban list.
    pub bans: Vec<String>,
    /// Object-hash contributions collected during vcl_hash.
    pub hash: Vec<u8>,
    pub cacheable: bool,
    pub ttl: f32,
    /// Backend selected via `set_backend`, by director name.
    pub backend: Option<String>,
    failure: Option<String>,
}

impl VclCtx {
    pub fn new(phase: VclPhase) -> Self {
        VclCtx {
            phase,
            msgs: Default::default(),
            ws: Workspace::default(),
            log: VslLog::new(),
            bans: Vec::new(),
            hash: Vec::new(),
            cacheable: true,
            ttl: 0.0,
            backend: None,
            failure: None,
        }
    }

    /// Client request ctx: req + resp messages.
    pub fn for_request(method: &str, url: &str) -> Self {
        let mut ctx = Self::new(VclPhase::Recv);
        ctx.msgs[HttpWhere::Req as usize] = Some(HttpMessage::new_request(method, url));
        ctx.msgs[HttpWhere::Resp as usize] = Some(HttpMessage::new_response(200));
        ctx
    }

    /// Backend-side ctx: bereq cloned from the client request, fresh beresp.
    pub fn for_backend(method: &str, url: &str) -> Self {
        let mut ctx = Self::new(VclPhase::BackendFetch);
        ctx.msgs[HttpWhere::Bereq as usize] = Some(HttpMessage::new_request(method, url));
        ctx.msgs[HttpWhere::Beresp as usize] = Some(HttpMessage::new_response(200));
        ctx
    }

    pub fn with_msg(mut self, whence: HttpWhere, msg: HttpMessage) -> Self {
        self.msgs[whence as usize] = Some(msg);
        self
    }

    pub fn msg(&self, whence: HttpWhere) -> Option<&HttpMessage> {
        self.msgs[whence as usize].as_ref()
    }

    pub fn msg_mut(&mut self, whence: HttpWhere) -> Option<&mut HttpMessage> {
        self.msgs[whence as usize].as_mut()
    }

    /// Copy one field between messages, returning the new handle or
    /// [`HDR_INVALID`]. `src == dst` duplicates the field.
    pub fn copy_field(&mut self, src: HttpWhere, handle: u32, dst: HttpWhere) -> u32 {
        let line = match self.msg(src).and_then(|m| m.line(handle)) {
            Some(l) => l.to_string(),
            None => return HDR_INVALID,
        };
        match self.msg_mut(dst) {
            Some(m) => m.append(&line).unwrap_or(HDR_INVALID),
            None => HDR_INVALID,
        }
    }

    /// Copy every regular field from one message to another; returns the
    /// number of fields copied.
    pub fn copy_all_fields(&mut self, src: HttpWhere, dst: HttpWhere) -> u32 {
        let lines: Vec<String> = match self.msg_mut(src) {
            Some(m) => {
                let handles = m.begin_foreach();
                let lines = handles
                    .iter()
                    .filter_map(|&h| m.line(h).map(str::to_string))
                    .collect();
                m.end_foreach();
                lines
            }
            None => return 0,
        };
        let Some(dst_msg) = self.msg_mut(dst) else {
            return 0;
        };
        let mut count = 0;
        for line in lines {
            if dst_msg.append(&line).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Proxy-level request failure (VRT_fail). The first failure sticks.
    pub fn fail(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        self.log.error(msg.clone());
        if self.failure.is_none() {
            self.failure = Some(msg);
        }
    }

    pub fn failed(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn hash_contribute(&mut self, bytes: &[u8]) {
        self.hash.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_field_between_messages() {
        let mut ctx = VclCtx::for_request("GET", "/x");
        let h = ctx
            .msg_mut(HttpWhere::Req)
            .unwrap()
            .append("X-Hello: world")
            .unwrap();
        let copied = ctx.copy_field(HttpWhere::Req, h, HttpWhere::Resp);
        assert_ne!(copied, HDR_INVALID);
        assert_eq!(
            ctx.msg(HttpWhere::Resp).unwrap().line(copied),
            Some("X-Hello: world")
        );
    }

    #[test]
    fn first_failure_sticks() {
        let mut ctx = VclCtx::for_request("GET", "/");
        ctx.fail("first");
        ctx.fail("second");
        assert_eq!(ctx.failed(), Some("first"));
    }
}
