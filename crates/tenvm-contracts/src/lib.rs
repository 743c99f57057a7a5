//! Host-side contracts for the tenvm sandbox.
//!
//! The proxy's own plumbing (VCL parser, workspace allocator, shared log,
//! fetch processors) is out of scope; this crate pins down the shapes the
//! sandbox runtime consumes: the per-request ctx with its HTTP messages,
//! workspace accounting, the shared-log sink, and the streaming
//! backend-result/body-source traits the director path is built on.

mod checksum;
mod ctx;
mod director;
mod http;
mod workspace;

use thiserror::Error;

pub use checksum::{crc32c, http_date};
pub use ctx::{VclCtx, VclPhase, VslLog, VslTag};
pub use director::{BackendResult, BodySource, BytesBody, PullStatus};
pub use http::{HttpMessage, HttpWhere, FIELD_METHOD, FIELD_PROTO, FIELD_URL, HDR_FIRST, HDR_INVALID};
pub use workspace::Workspace;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("out of workspace")]
    OutOfWorkspace,
    #[error("too many header fields")]
    TooManyFields,
    #[error("malformed header line")]
    BadHeader,
    #[error("{0}")]
    Failed(String),
}
