//! Streaming backend plumbing: body sources pushed into directors and the
//! scatter-list result the fetch pipeline pulls from.

use crate::HostError;

/// A request body the proxy can iterate segment by segment.
pub trait BodySource {
    fn for_each_segment(
        &mut self,
        cb: &mut dyn FnMut(&[u8]) -> Result<(), HostError>,
    ) -> Result<(), HostError>;
}

/// In-memory body that yields fixed-size segments; stands in for the
/// proxy's chunked body iterator.
pub struct BytesBody {
    data: Vec<u8>,
    segment: usize,
}

impl BytesBody {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        BytesBody {
            data: data.into(),
            segment: 8 * 1024,
        }
    }

    pub fn with_segment_size(mut self, segment: usize) -> Self {
        self.segment = segment.max(1);
        self
    }
}

impl BodySource for BytesBody {
    fn for_each_segment(
        &mut self,
        cb: &mut dyn FnMut(&[u8]) -> Result<(), HostError>,
    ) -> Result<(), HostError> {
        for chunk in self.data.chunks(self.segment) {
            cb(chunk)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// More data remains; pull again.
    More,
    /// The last buffer is drained.
    End,
}

/// A produced backend response: status, content type, and the body as a
/// scatter list the fetch pipeline drains across one or more pulls.
#[derive(Debug)]
pub struct BackendResult {
    pub status: u16,
    pub ctype: String,
    pub content_length: u64,
    buffers: Vec<Vec<u8>>,
    idx: usize,
    off: usize,
}

impl BackendResult {
    pub fn new(status: u16, ctype: impl Into<String>, buffers: Vec<Vec<u8>>) -> Self {
        let content_length = buffers.iter().map(|b| b.len() as u64).sum();
        BackendResult {
            status,
            ctype: ctype.into(),
            content_length,
            buffers,
            idx: 0,
            off: 0,
        }
    }

    /// Synthetic error result with an empty body.
    pub fn error(status: u16) -> Self {
        BackendResult::new(status, "", Vec::new())
    }

    /// Drain into `out`, advancing the buffer index and per-buffer
    /// cursor across calls.
    pub fn pull(&mut self, out: &mut [u8]) -> (usize, PullStatus) {
        if self.content_length == 0 || self.idx >= self.buffers.len() {
            return (0, PullStatus::End);
        }
        let mut written = 0;
        while written < out.len() {
            let buf = &self.buffers[self.idx];
            let n = (buf.len() - self.off).min(out.len() - written);
            out[written..written + n].copy_from_slice(&buf[self.off..self.off + n]);
            written += n;
            self.off += n;
            if self.off == buf.len() {
                self.idx += 1;
                self.off = 0;
                if self.idx == self.buffers.len() {
                    return (written, PullStatus::End);
                }
            }
        }
        (written, PullStatus::More)
    }

    /// Convenience for callers that want the whole body at once.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content_length as usize);
        let mut chunk = [0u8; 4096];
        loop {
            let (n, status) = self.pull(&mut chunk);
            out.extend_from_slice(&chunk[..n]);
            if status == PullStatus::End {
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_spans_buffers_and_calls() {
        let mut result = BackendResult::new(
            200,
            "text/plain",
            vec![b"hello ".to_vec(), b"scatter ".to_vec(), b"world".to_vec()],
        );
        assert_eq!(result.content_length, 19);
        let mut out = [0u8; 7];
        let (n, st) = result.pull(&mut out);
        assert_eq!((n, st), (7, PullStatus::More));
        let mut rest = Vec::new();
        loop {
            let (n, st) = result.pull(&mut out);
            rest.extend_from_slice(&out[..n]);
            if st == PullStatus::End {
                break;
            }
        }
        assert_eq!(rest, b"catter world");
    }

    #[test]
    fn empty_body_ends_immediately() {
        let mut result = BackendResult::error(500);
        let mut out = [0u8; 8];
        assert_eq!(result.pull(&mut out), (0, PullStatus::End));
    }

    #[test]
    fn bytes_body_segments() {
        let mut body = BytesBody::new(vec![7u8; 10]).with_segment_size(4);
        let mut seen = Vec::new();
        body.for_each_segment(&mut |seg| {
            seen.push(seg.len());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![4, 4, 2]);
    }
}
