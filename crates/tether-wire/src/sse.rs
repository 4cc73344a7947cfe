use crate::envelope::EventEnvelope;

/// One complete server-sent event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Removes the next complete frame from `buffer`, if one has fully arrived.
///
/// Frames end with a blank line (`\n\n` or `\r\n\r\n`). The buffer holds raw
/// bytes so a multi-byte character split across reads stays intact; only a
/// complete frame is decoded. A frame may carry several `data:` lines, which
/// are joined with `\n`; the space after the colon is optional. Comment lines
/// (`:keepalive`) are skipped, so a frame made only of comments comes back
/// with empty `data`.
pub fn take_sse_frame(buffer: &mut Vec<u8>) -> Option<SseFrame> {
    let crlf = find(buffer, b"\r\n\r\n");
    let lf = find(buffer, b"\n\n");
    let (end_idx, delim_len) = match (crlf, lf) {
        (Some(a), Some(b)) if a < b => (a, 4),
        (_, Some(b)) => (b, 2),
        (Some(a), None) => (a, 4),
        (None, None) => return None,
    };

    let raw: Vec<u8> = buffer.drain(..end_idx + delim_len).take(end_idx).collect();
    let raw = String::from_utf8_lossy(&raw);

    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        }
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Drains every complete frame in `buffer` and decodes the ones that carry an
/// event envelope. Partial trailing data stays in the buffer.
pub fn drain_envelopes(buffer: &mut Vec<u8>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Some(frame) = take_sse_frame(buffer) {
        if frame.data.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(&frame.data) {
            Ok(value) => match EventEnvelope::from_value(value) {
                Some(envelope) => out.push(envelope),
                None => tracing::debug!(data = %frame.data, "sse frame is not an event envelope"),
            },
            Err(err) => {
                tracing::debug!(error = %err, data = %frame.data, "failed to parse sse frame")
            }
        }
    }
    out
}
