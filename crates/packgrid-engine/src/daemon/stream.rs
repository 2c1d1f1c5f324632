//! Helpers for the daemon's streamed response bodies.
//!
//! Exec and log output arrive multiplexed: each frame is an 8-byte header
//! (stream type, three zero bytes, big-endian payload length) followed by
//! the payload. Pull and push report progress as newline-delimited JSON
//! objects, where a failure shows up as an `error` member rather than as a
//! non-2xx status.

use serde_json::Value;

const HEADER_LEN: usize = 8;

/// Concatenate the payloads of a multiplexed stream.
///
/// Bodies that do not parse as frames (TTY containers) are returned as-is.
pub fn demux(body: &[u8]) -> String {
    match split_frames(body) {
        Some(payload) => String::from_utf8_lossy(&payload).into_owned(),
        None => String::from_utf8_lossy(body).into_owned(),
    }
}

fn split_frames(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN || rest[0] > 2 || rest[1..4] != [0, 0, 0] {
            return None;
        }
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = HEADER_LEN.checked_add(len)?;
        if rest.len() < end {
            return None;
        }
        out.extend_from_slice(&rest[HEADER_LEN..end]);
        rest = &rest[end..];
    }
    Some(out)
}

/// First error reported in a progress stream, if any.
pub fn progress_error(body: &[u8]) -> Option<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .find_map(|event| {
            event
                .get("errorDetail")
                .and_then(|d| d.get("message"))
                .or_else(|| event.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &str) -> Vec<u8> {
        let mut f = vec![stream, 0, 0, 0];
        f.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        f.extend_from_slice(payload.as_bytes());
        f
    }

    #[test]
    fn demux_joins_stdout_and_stderr() {
        let mut body = frame(1, "hello ");
        body.extend(frame(2, "world\n"));
        assert_eq!(demux(&body), "hello world\n");
    }

    #[test]
    fn demux_passes_raw_output_through() {
        assert_eq!(demux(b"plain tty output"), "plain tty output");
        // Truncated frame falls back to raw text.
        let mut body = frame(1, "abc");
        body.truncate(9);
        assert_eq!(demux(&body).len(), 9);
    }

    #[test]
    fn progress_error_finds_failure_lines() {
        let ok = b"{\"status\":\"Pulling\"}\n{\"status\":\"Done\"}\n";
        assert_eq!(progress_error(ok), None);

        let failed = b"{\"status\":\"Pulling\"}\n{\"errorDetail\":{\"message\":\"manifest unknown\"},\"error\":\"manifest unknown\"}\n";
        assert_eq!(progress_error(failed).as_deref(), Some("manifest unknown"));
    }
}
