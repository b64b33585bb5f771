//! W3C trace-context (`traceparent` / `tracestate`) carried on outbox rows.
//!
//! The writer stores the caller's context on the row; the worker restores it
//! so the row's processing span is a child of the originating request.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::WordloomError;

const VERSION: &str = "00";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// 32 lowercase hex chars.
    pub trace_id: String,
    /// 16 lowercase hex chars; the span that is the parent of whatever runs next.
    pub span_id: String,
    pub flags: u8,
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Fresh sampled root context.
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace = [0u8; 16];
        rng.fill_bytes(&mut trace);
        Self {
            trace_id: hex::encode(trace),
            span_id: random_span_id(),
            flags: 0x01,
            tracestate: None,
        }
    }

    /// Child context: same trace, new span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_span_id(),
            flags: self.flags,
            tracestate: self.tracestate.clone(),
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & 0x01 == 0x01
    }

    pub fn traceparent(&self) -> String {
        format!(
            "{VERSION}-{}-{}-{:02x}",
            self.trace_id, self.span_id, self.flags
        )
    }

    pub fn parse(traceparent: &str, tracestate: Option<&str>) -> Result<Self, WordloomError> {
        let bad = || WordloomError::InvalidInput(format!("invalid traceparent '{traceparent}'"));
        let parts: Vec<&str> = traceparent.trim().split('-').collect();
        let [version, trace_id, span_id, flags] = parts.as_slice() else {
            return Err(bad());
        };
        if version.len() != 2 || *version == "ff" || !is_lower_hex(version) {
            return Err(bad());
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return Err(bad());
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return Err(bad());
        }
        if flags.len() != 2 {
            return Err(bad());
        }
        let flags = u8::from_str_radix(flags, 16).map_err(|_| bad())?;
        Ok(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags,
            tracestate: tracestate
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }
}

fn random_span_id() -> String {
    let mut span = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut span);
    if span.iter().all(|b| *b == 0) {
        span[7] = 1;
    }
    hex::encode(span)
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(s: &str) -> bool {
    s.chars().all(|c| c == '0')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn parses_spec_example() {
        let ctx = TraceContext::parse(SAMPLE, Some("rojo=00f067aa0ba902b7")).unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, "00f067aa0ba902b7");
        assert!(ctx.is_sampled());
        assert_eq!(ctx.traceparent(), SAMPLE);
        assert_eq!(ctx.tracestate.as_deref(), Some("rojo=00f067aa0ba902b7"));
    }

    #[test]
    fn rejects_malformed_headers() {
        for bad in [
            "",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-zz",
        ] {
            assert!(TraceContext::parse(bad, None).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn child_keeps_trace_and_changes_span() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert!(TraceContext::parse(&child.traceparent(), None).is_ok());
    }

    #[test]
    fn blank_tracestate_is_dropped() {
        let ctx = TraceContext::parse(SAMPLE, Some("  ")).unwrap();
        assert_eq!(ctx.tracestate, None);
    }
}
