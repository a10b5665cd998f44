//! Order-sensitive signatures of tool sequences.

use sha2::{Digest, Sha256};

/// Separator that cannot appear in a tool name
const TOOL_SEPARATOR: u8 = 0x1f;

/// Canonical form of a tool name: trimmed, lowercased
pub fn normalize_tool(tool: &str) -> String {
    tool.trim().to_lowercase()
}

/// Hex SHA-256 over the normalized sequence; `[a, b]` and `[b, a]` differ
pub fn tool_signature<S: AsRef<str>>(tools: &[S]) -> String {
    let mut hasher = Sha256::new();
    for (i, tool) in tools.iter().enumerate() {
        if i > 0 {
            hasher.update([TOOL_SEPARATOR]);
        }
        hasher.update(normalize_tool(tool.as_ref()).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_and_normalized() {
        let a = tool_signature(&["Read", "Edit", "Bash"]);
        assert_eq!(a, tool_signature(&[" read", "edit ", "BASH"]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_signature_is_order_sensitive() {
        assert_ne!(tool_signature(&["read", "edit"]), tool_signature(&["edit", "read"]));
    }

    #[test]
    fn test_signature_respects_boundaries() {
        assert_ne!(tool_signature(&["ab", "c"]), tool_signature(&["a", "bc"]));
    }
}
