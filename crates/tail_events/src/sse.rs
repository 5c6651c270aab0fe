//! Server-sent-events framing for transports that deliver one event per `data:` frame.

use crate::StreamEvent;

/// Renders `event` as a single SSE frame: `data: <json>\n\n`.
pub fn frame(event: &StreamEvent) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(format!("data: {json}\n\n"))
}
