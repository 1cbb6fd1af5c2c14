//! Response governor — rejects tool results above a byte limit.

use super::errors::McpError;

/// Fraction of the limit above which a warning is logged.
const WARN_RATIO: f64 = 0.8;

/// Serialized size of a result in bytes.
pub fn measure(value: &serde_json::Value) -> usize {
    value.to_string().len()
}

/// Pass `value` through if its serialized size is within `max_bytes`.
///
/// A result exactly at the limit is accepted.
pub fn check(
    value: serde_json::Value,
    server: &str,
    tool: &str,
    max_bytes: usize,
) -> Result<serde_json::Value, McpError> {
    let actual_bytes = measure(&value);

    if actual_bytes > max_bytes {
        return Err(McpError::ResponseTooLarge {
            server: server.to_string(),
            tool: tool.to_string(),
            actual_bytes,
            max_bytes,
        });
    }

    if actual_bytes as f64 > max_bytes as f64 * WARN_RATIO {
        tracing::warn!(
            server,
            tool,
            actual_bytes,
            max_bytes,
            "tool response close to size limit"
        );
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_at_limit_is_accepted() {
        let value = json!("x".repeat(8)); // 10 bytes with quotes
        assert_eq!(measure(&value), 10);
        assert_eq!(check(value.clone(), "s", "t", 10).unwrap(), value);
    }

    #[test]
    fn test_over_limit_is_rejected() {
        let value = json!("x".repeat(48));
        let err = check(value, "github", "search", 10).unwrap_err();
        match err {
            McpError::ResponseTooLarge {
                server,
                tool,
                actual_bytes,
                max_bytes,
            } => {
                assert_eq!(server, "github");
                assert_eq!(tool, "search");
                assert_eq!(actual_bytes, 50);
                assert_eq!(max_bytes, 10);
            }
            other => panic!("expected ResponseTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_measures_utf8_bytes() {
        // "é" is two bytes.
        assert_eq!(measure(&json!("éé")), 6);
    }

    #[test]
    fn test_near_limit_still_passes() {
        let value = json!({"k": "v".repeat(80)});
        let size = measure(&value);
        assert!(check(value, "s", "t", size + 1).is_ok());
    }
}
