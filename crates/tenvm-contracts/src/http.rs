//! HTTP message model with stable, generation-tagged field handles.
//!
//! The guest addresses header fields by integer handle. A handle stays
//! valid for the life of the message generation; `rollback` starts a new
//! generation and every previously issued handle decodes to nothing from
//! then on. Slots below [`HDR_FIRST`] hold the start line (method, URL,
//! protocol) and survive rollback.

use regex::Regex;

use crate::HostError;

/// Which HTTP message a header operation targets. Stable across
/// revisions; the values are part of the guest ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HttpWhere {
    Req = 0,
    ReqTop = 1,
    Resp = 2,
    Obj = 3,
    Bereq = 4,
    Beresp = 5,
}

impl HttpWhere {
    pub const COUNT: usize = 6;

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HttpWhere::Req),
            1 => Some(HttpWhere::ReqTop),
            2 => Some(HttpWhere::Resp),
            3 => Some(HttpWhere::Obj),
            4 => Some(HttpWhere::Bereq),
            5 => Some(HttpWhere::Beresp),
            _ => None,
        }
    }
}

/// Sentinel for "no such field"; part of the guest ABI.
pub const HDR_INVALID: u32 = u32::MAX;

/// Start-line pseudo slots.
pub const FIELD_METHOD: u32 = 0;
pub const FIELD_URL: u32 = 1;
pub const FIELD_PROTO: u32 = 2;
/// First regular header slot.
pub const HDR_FIRST: u32 = 3;

const SLOT_MAX: usize = 0xFFFE;

#[derive(Debug, Clone)]
pub struct HttpMessage {
    generation: u32,
    fields: Vec<Option<String>>,
    status: u16,
    foreach_depth: u32,
    deferred_unset: Vec<usize>,
}

fn encode(generation: u32, slot: usize) -> u32 {
    ((generation & 0xFFFF) << 16) | (slot as u32 & 0xFFFF)
}

/// Case-insensitive match of `line`'s field name against `name`.
fn name_matches(line: &str, name: &str) -> bool {
    let Some(colon) = line.find(':') else {
        return false;
    };
    line[..colon].trim().eq_ignore_ascii_case(name)
}

impl HttpMessage {
    pub fn new() -> Self {
        HttpMessage {
            generation: 0,
            fields: vec![None, None, None],
            status: 200,
            foreach_depth: 0,
            deferred_unset: Vec::new(),
        }
    }

    pub fn new_request(method: &str, url: &str) -> Self {
        let mut msg = Self::new();
        msg.fields[FIELD_METHOD as usize] = Some(method.to_string());
        msg.fields[FIELD_URL as usize] = Some(url.to_string());
        msg.fields[FIELD_PROTO as usize] = Some("HTTP/1.1".to_string());
        msg
    }

    pub fn new_response(status: u16) -> Self {
        let mut msg = Self::new();
        msg.fields[FIELD_PROTO as usize] = Some("HTTP/1.1".to_string());
        msg.status = status;
        msg
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn url(&self) -> &str {
        self.fields[FIELD_URL as usize].as_deref().unwrap_or("")
    }

    pub fn method(&self) -> &str {
        self.fields[FIELD_METHOD as usize].as_deref().unwrap_or("")
    }

    /// Decode a guest handle into a live slot index. Pseudo slots ignore
    /// the generation; everything else must match the current one.
    fn decode(&self, handle: u32) -> Option<usize> {
        if handle == HDR_INVALID {
            return None;
        }
        let slot = (handle & 0xFFFF) as usize;
        let generation = handle >> 16;
        if slot >= HDR_FIRST as usize && generation != (self.generation & 0xFFFF) {
            return None;
        }
        if slot >= self.fields.len() || self.fields[slot].is_none() {
            return None;
        }
        Some(slot)
    }

    /// Find the first field named `name`, returning its handle or
    /// [`HDR_INVALID`].
    pub fn find(&self, name: &str) -> u32 {
        for (slot, field) in self.fields.iter().enumerate().skip(HDR_FIRST as usize) {
            if let Some(line) = field {
                if name_matches(line, name) {
                    return encode(self.generation, slot);
                }
            }
        }
        HDR_INVALID
    }

    /// Append a full "Name: Value" line, returning the new field's handle.
    pub fn append(&mut self, line: &str) -> Result<u32, HostError> {
        if !line.contains(':') {
            return Err(HostError::BadHeader);
        }
        if self.fields.len() >= SLOT_MAX {
            return Err(HostError::TooManyFields);
        }
        self.fields.push(Some(line.to_string()));
        Ok(encode(self.generation, self.fields.len() - 1))
    }

    /// Full line text of a field, start-line slots included.
    pub fn line(&self, handle: u32) -> Option<&str> {
        self.decode(handle).and_then(|s| self.fields[s].as_deref())
    }

    /// Replace a field's line. Start-line slots accept raw tokens.
    pub fn set(&mut self, handle: u32, line: &str) -> bool {
        match self.decode(handle) {
            Some(slot) => {
                self.fields[slot] = Some(line.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a field. During an enumeration the removal is deferred
    /// until the enumeration ends; the handle reports success either way.
    pub fn unset(&mut self, handle: u32) -> bool {
        let Some(slot) = self.decode(handle) else {
            return false;
        };
        if slot < HDR_FIRST as usize {
            return false;
        }
        if self.foreach_depth > 0 {
            self.deferred_unset.push(slot);
        } else {
            self.fields[slot] = None;
        }
        true
    }

    /// Remove every field whose full line matches `re`. Deferred during
    /// enumeration like `unset`.
    pub fn unset_re(&mut self, re: &Regex) -> usize {
        let mut count = 0;
        for slot in HDR_FIRST as usize..self.fields.len() {
            let hit = match &self.fields[slot] {
                Some(line) => re.is_match(line),
                None => false,
            };
            if hit {
                count += 1;
                if self.foreach_depth > 0 {
                    self.deferred_unset.push(slot);
                } else {
                    self.fields[slot] = None;
                }
            }
        }
        count
    }

    /// Discard every regular field and start a new handle generation;
    /// all previously issued handles become invalid. The start line is
    /// kept.
    pub fn rollback(&mut self) {
        self.fields.truncate(HDR_FIRST as usize);
        self.generation = self.generation.wrapping_add(1);
        self.deferred_unset.clear();
    }

    /// Snapshot the current regular field handles and enter enumeration
    /// mode: unsets are deferred until [`end_foreach`](Self::end_foreach).
    pub fn begin_foreach(&mut self) -> Vec<u32> {
        self.foreach_depth += 1;
        self.fields
            .iter()
            .enumerate()
            .skip(HDR_FIRST as usize)
            .filter_map(|(slot, f)| f.as_ref().map(|_| encode(self.generation, slot)))
            .collect()
    }

    pub fn end_foreach(&mut self) {
        if self.foreach_depth == 0 {
            return;
        }
        self.foreach_depth -= 1;
        if self.foreach_depth == 0 {
            for slot in self.deferred_unset.drain(..) {
                if slot < self.fields.len() {
                    self.fields[slot] = None;
                }
            }
        }
    }

    /// Number of live regular fields.
    pub fn field_count(&self) -> usize {
        self.fields
            .iter()
            .skip(HDR_FIRST as usize)
            .filter(|f| f.is_some())
            .count()
    }

    /// Handle for the URL pseudo slot (generation-free).
    pub fn url_handle() -> u32 {
        FIELD_URL
    }
}

impl Default for HttpMessage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve_unset() {
        let mut msg = HttpMessage::new_request("GET", "/foo");
        let h = msg.append("X-Test: 1").unwrap();
        assert_eq!(msg.line(h), Some("X-Test: 1"));
        assert_eq!(msg.find("x-test"), h);
        assert!(msg.unset(h));
        assert_eq!(msg.line(h), None);
        assert_eq!(msg.find("X-Test"), HDR_INVALID);
    }

    #[test]
    fn rollback_invalidates_handles() {
        let mut msg = HttpMessage::new_request("GET", "/");
        let h = msg.append("X-A: 1").unwrap();
        msg.rollback();
        assert_eq!(msg.line(h), None);
        assert!(!msg.set(h, "X-A: 2"));
        // Pseudo slots survive.
        assert_eq!(msg.url(), "/");
    }

    #[test]
    fn unset_deferred_during_foreach() {
        let mut msg = HttpMessage::new_request("GET", "/");
        let h = msg.append("X-A: 1").unwrap();
        msg.append("X-B: 2").unwrap();
        let handles = msg.begin_foreach();
        assert_eq!(handles.len(), 2);
        assert!(msg.unset(h));
        // Still visible until the enumeration ends.
        assert_eq!(msg.line(h), Some("X-A: 1"));
        msg.end_foreach();
        assert_eq!(msg.line(h), None);
        assert_eq!(msg.find("X-A"), HDR_INVALID);
    }

    #[test]
    fn unset_re_counts_matches() {
        let mut msg = HttpMessage::new();
        msg.append("X-Trace-A: 1").unwrap();
        msg.append("X-Trace-B: 2").unwrap();
        msg.append("X-Keep: 3").unwrap();
        let re = Regex::new("^X-Trace-").unwrap();
        assert_eq!(msg.unset_re(&re), 2);
        assert_eq!(msg.field_count(), 1);
    }
}
