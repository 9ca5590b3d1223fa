use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

// Seeded randomly so ids stay distinct across process restarts within one conversation.
static CALL_ID_COUNTER: LazyLock<AtomicU64> = LazyLock::new(|| AtomicU64::new(fastrand::u64(..)));
const HEX: &[u8; 16] = b"0123456789abcdef";

/// Id for a tool call the provider did not name (Gemini, some Chat-compatible vendors).
#[inline]
pub(crate) fn next_call_id() -> String {
    let id = CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(21);
    out.push_str("call_");
    push_u64_hex_16(&mut out, id);
    out
}

/// Id for a message the provider did not name.
pub(crate) fn new_message_id(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 32);
    out.push_str(prefix);
    out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Parse accumulated tool arguments, treating an empty string as an empty object.
pub(crate) fn parse_arguments(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_are_unique_and_prefixed() {
        let a = next_call_id();
        let b = next_call_id();
        assert_ne!(a, b);
        assert!(a.starts_with("call_"));
        assert_eq!(a.len(), 21);
    }

    #[test]
    fn test_message_id_prefix() {
        let id = new_message_id("gen_");
        assert!(id.starts_with("gen_"));
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn test_parse_arguments_empty_is_object() {
        assert_eq!(parse_arguments("  ").unwrap(), serde_json::json!({}));
        assert!(parse_arguments("{\"a\":").is_err());
    }
}
