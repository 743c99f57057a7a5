//! Directors: the VM backend (a guest generator presented as a pullable
//! HTTP origin) and the live-update backend (program upload endpoint).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tenvm_contracts::{http_date, BackendResult, BodySource, HttpWhere, VclCtx};
use tenvm_machine::{GuestAddr, MachineLoader};

use crate::tenancy::SandboxTenant;
use crate::update::{update_program, UpdateParams};
use crate::vcl::RequestState;

/// Cap on the single contiguous guest POST buffer.
pub const POST_BUFFER: u64 = 128 * 1024 * 1024;
/// Cap on the response scatter list.
pub const VMBE_NUM_BUFFERS: usize = 1024;

/// The director contract the proxy drives: produce headers and a
/// pullable body (gethdrs), then release per-fetch state (finish).
pub trait Director {
    fn vcl_name(&self) -> &str;

    fn fetch(
        &self,
        ctx: &mut VclCtx,
        state: &mut RequestState,
        body: Option<&mut dyn BodySource>,
    ) -> BackendResult;

    fn finish(&self, _ctx: &mut VclCtx) {}
}

/// Presents a guest generator function as the origin: the request body is
/// streamed into guest memory, the generator runs until it forges a
/// response, and the forged buffers are pulled through the fetch
/// pipeline.
pub struct VmBackendDirector {
    pub funcaddr: GuestAddr,
    pub funcarg: u64,
    pub max_response_size: u64,
    name: String,
}

impl VmBackendDirector {
    pub fn new(funcaddr: GuestAddr, funcarg: u64, tenant_name: &str) -> Self {
        VmBackendDirector {
            funcaddr,
            funcarg,
            max_response_size: 0,
            name: tenant_name.to_string(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sanitize_status(raw: u64) -> u16 {
    match u16::try_from(raw) {
        Ok(s) if (100..=599).contains(&s) => s,
        _ => 500,
    }
}

impl Director for VmBackendDirector {
    fn vcl_name(&self) -> &str {
        &self.name
    }

    fn fetch(
        &self,
        ctx: &mut VclCtx,
        state: &mut RequestState,
        body: Option<&mut dyn BodySource>,
    ) -> BackendResult {
        let Some(script) = state.script.as_mut() else {
            ctx.log.error("VM backend: no active tenant".to_string());
            return BackendResult::error(500);
        };

        // Request body first: one contiguous guest buffer, allocated on
        // the first segment, filled in order.
        let mut post_len: u64 = 0;
        if let Some(body) = body {
            let mut copy_err = None;
            let res = body.for_each_segment(&mut |seg| {
                if script.post_addr() == 0 {
                    if let Err(e) = script.allocate_post_data(POST_BUFFER) {
                        copy_err = Some(e.to_string());
                        return Err(tenvm_contracts::HostError::Failed("post alloc".into()));
                    }
                }
                if post_len + seg.len() as u64 > POST_BUFFER {
                    copy_err = Some("request body exceeds POST buffer".to_string());
                    return Err(tenvm_contracts::HostError::Failed("post overflow".into()));
                }
                if let Err(e) = script.copy_to_guest(script.post_addr() + post_len, seg) {
                    copy_err = Some(e.to_string());
                    return Err(tenvm_contracts::HostError::Failed("post copy".into()));
                }
                post_len += seg.len() as u64;
                Ok(())
            });
            if res.is_err() {
                ctx.log.error(format!(
                    "unable to aggregate request body data for program {}: {}",
                    script.name(),
                    copy_err.unwrap_or_default()
                ));
                return BackendResult::error(503);
            }
        }

        let post_addr = script.post_addr();
        match script.backend_call(ctx, self.funcaddr, self.funcarg, post_addr, post_len) {
            Ok(Some(regs)) => {
                let status = sanitize_status(regs[0]);
                let ctype = match script.read_guest(regs[1], regs[2] as usize) {
                    Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    None => String::new(),
                };
                let (data, dlen) = (regs[3], regs[4]);
                if self.max_response_size > 0 && dlen > self.max_response_size {
                    ctx.log.error(format!(
                        "backend VM response too large ({dlen} bytes)"
                    ));
                    return BackendResult::error(500);
                }
                let buffers = match script.gather_buffers(data, dlen, VMBE_NUM_BUFFERS) {
                    Ok(b) => b,
                    Err(e) => {
                        ctx.log.error(format!("backend VM result unreadable: {e}"));
                        return BackendResult::error(500);
                    }
                };
                if ctx.ws.alloc(ctype.len()).is_err() {
                    ctx.fail("backend VM: out of workspace for result");
                    return BackendResult::error(503);
                }
                let result = BackendResult::new(status, ctype, buffers);
                if let Some(beresp) = ctx.msg_mut(HttpWhere::Beresp) {
                    beresp.set_status(status);
                    if result.content_length > 0 {
                        let _ = beresp.append(&format!("Content-Type: {}", result.ctype));
                        let _ =
                            beresp.append(&format!("Content-Length: {}", result.content_length));
                    }
                    let _ = beresp.append(&format!("Last-Modified: {}", http_date(unix_now())));
                }
                result
            }
            Ok(None) => {
                // The generator halted without forging a response.
                ctx.log.error(format!(
                    "backend VM '{}' produced no response",
                    script.name()
                ));
                sync_error_status(ctx, 500);
                BackendResult::error(500)
            }
            Err(e) => {
                ctx.log
                    .error(format!("backend VM exception: {e}"));
                sync_error_status(ctx, 500);
                BackendResult::error(500)
            }
        }
    }
}

fn sync_error_status(ctx: &mut VclCtx, status: u16) {
    if let Some(beresp) = ctx.msg_mut(HttpWhere::Beresp) {
        beresp.set_status(status);
    }
}

/// The special updater backend: the uploaded body is a new program for
/// one tenant; the response body reports the update outcome.
pub struct UpdaterDirector {
    loader: Arc<dyn MachineLoader>,
    tenant: Arc<SandboxTenant>,
    pub max_binary_size: u64,
    pub is_debug: bool,
}

impl UpdaterDirector {
    pub fn new(
        loader: Arc<dyn MachineLoader>,
        tenant: Arc<SandboxTenant>,
        max_binary_size: u64,
        is_debug: bool,
    ) -> Self {
        UpdaterDirector {
            loader,
            tenant,
            max_binary_size,
            is_debug,
        }
    }
}

impl Director for UpdaterDirector {
    fn vcl_name(&self) -> &str {
        self.tenant.name()
    }

    fn fetch(
        &self,
        ctx: &mut VclCtx,
        _state: &mut RequestState,
        body: Option<&mut dyn BodySource>,
    ) -> BackendResult {
        let mut blob = Vec::new();
        let mut oversize = false;
        if let Some(body) = body {
            let _ = body.for_each_segment(&mut |seg| {
                if blob.len() as u64 + seg.len() as u64 > self.max_binary_size {
                    oversize = true;
                    return Err(tenvm_contracts::HostError::Failed("too large".into()));
                }
                blob.extend_from_slice(seg);
                Ok(())
            });
        }
        if oversize {
            ctx.log.error(format!(
                "update for '{}' exceeds max binary size {}",
                self.tenant.name(),
                self.max_binary_size
            ));
            sync_error_status(ctx, 503);
            return BackendResult::error(503);
        }

        let params = UpdateParams {
            data: &blob,
            is_debug: self.is_debug,
        };
        let text = update_program(&*self.loader, &self.tenant, &mut ctx.log, &params);
        let result = BackendResult::new(200, "text/plain", vec![text.into_bytes()]);
        if let Some(beresp) = ctx.msg_mut(HttpWhere::Beresp) {
            beresp.set_status(200);
            let _ = beresp.append(&format!("Content-Length: {}", result.content_length));
        }
        result
    }
}
