//! Incremental `text/event-stream` decoder.
//!
//! Feed raw body chunks as they arrive; complete messages come out once their
//! terminating blank line has been seen. Chunks may split lines or UTF-8
//! sequences anywhere.

use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: String,
    has_data: bool,
    event: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-requested reconnection delay, if one was sent.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Id of the last dispatched message; sent back as `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(msg) = self.process_line(&line) {
                out.push(msg);
            }
        }
        out
    }

    /// Drop any partially received message, e.g. after the connection broke.
    pub fn reset_partial(&mut self) {
        self.pending.clear();
        self.data.clear();
        self.has_data = false;
        self.event = None;
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseMessage {
            event,
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_single_message() {
        let mut d = SseDecoder::new();
        let msgs = d.push(b"data: {\"type\":\"log\"}\n\n");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, "{\"type\":\"log\"}");
        assert_eq!(msgs[0].event, None);
    }

    #[test]
    fn joins_multiline_data_and_handles_crlf() {
        let mut d = SseDecoder::new();
        let msgs = d.push(b"event: update\r\ndata: one\r\ndata:two\r\n\r\n");
        assert_eq!(
            msgs,
            vec![SseMessage {
                event: Some("update".into()),
                data: "one\ntwo".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn survives_arbitrary_chunk_boundaries() {
        let body = "data: ✓ Code parsed\n\n: keep-alive\n\ndata: second\n\n".as_bytes();
        let mut d = SseDecoder::new();
        let mut msgs = Vec::new();
        for chunk in body.chunks(3) {
            msgs.extend(d.push(chunk));
        }
        let data: Vec<_> = msgs.into_iter().map(|m| m.data).collect();
        assert_eq!(data, vec!["✓ Code parsed", "second"]);
    }

    #[test]
    fn tracks_id_and_retry() {
        let mut d = SseDecoder::new();
        let msgs = d.push(b"retry: 1500\nid: 7\ndata: x\n\n");
        assert_eq!(msgs[0].id.as_deref(), Some("7"));
        assert_eq!(d.last_event_id(), Some("7"));
        assert_eq!(d.retry(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn blank_line_without_data_dispatches_nothing() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: ping\n\n").is_empty());
        let msgs = d.push(b"data: y\n\n");
        assert_eq!(msgs[0].event, None);
    }

    #[test]
    fn reset_drops_partial_message() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: half").is_empty());
        d.reset_partial();
        let msgs = d.push(b"data: whole\n\n");
        assert_eq!(msgs[0].data, "whole");
    }
}
