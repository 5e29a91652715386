//! Text event stream framing for progress subscriptions.
//!
//! ```text
//! event: progress
//! data: {"loadPercent":12.5}
//!
//! ```

use crate::ProtocolError;
use crate::types::{EventKind, ProgressPayload};

/// Renders one event frame, including the terminating blank line.
pub fn encode_event(kind: EventKind, payload: &ProgressPayload) -> Result<String, ProtocolError> {
    let data = serde_json::to_string(payload)?;
    Ok(format!("event: {}\ndata: {data}\n\n", kind.as_str()))
}

/// Line-fed decoder for the event stream.
///
/// Feed it one line at a time (without the trailing newline). A frame is
/// dispatched on the blank line that ends it. Comment lines, unknown fields
/// and events with unknown names are skipped.
#[derive(Debug, Default)]
pub struct EventDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a line and returns a decoded event when a frame completes.
    pub fn feed_line(
        &mut self,
        line: &str,
    ) -> Result<Option<(EventKind, ProgressPayload)>, ProtocolError> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Result<Option<(EventKind, ProgressPayload)>, ProtocolError> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return Ok(None);
        }

        let Some(kind) = event.and_then(|name| name.parse::<EventKind>().ok()) else {
            return Ok(None);
        };
        let payload: ProgressPayload = serde_json::from_str(&data.join("\n"))?;
        Ok(Some((kind, payload)))
    }
}
