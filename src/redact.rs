//! Secret redaction for error text entering the event log.
//!
//! Error messages can embed credentials (connection strings, API keys,
//! bearer tokens). Everything that ends up in an ERROR event payload is
//! passed through [`redact`] first.

use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement marker for redacted spans.
pub const REDACTED: &str = "[REDACTED]";

static KEY_VALUE_SECRET: Lazy<Regex> = Lazy::new(|| {
    // key=value / key: value where the key smells like a credential.
    Regex::new(r#"(?i)\b(api[_-]?key|token|secret|password|authorization)\b\s*[:=]\s*\S+"#)
        .unwrap()
});

static BEARER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]+=*").unwrap());

static PROVIDER_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9-]{8,}").unwrap());

/// Strip credential-shaped substrings from `text`.
///
/// Conservative: the surrounding message is preserved, only the matched
/// span is replaced, so operators still see what failed.
pub fn redact(text: &str) -> String {
    let pass1 = KEY_VALUE_SECRET.replace_all(text, REDACTED);
    let pass2 = BEARER_TOKEN.replace_all(&pass1, REDACTED);
    PROVIDER_KEY.replace_all(&pass2, REDACTED).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_key_value_pairs() {
        let s = redact("connect failed: api_key=abc123 host=db.local");
        assert!(!s.contains("abc123"));
        assert!(s.contains("host=db.local"));
    }

    #[test]
    fn redacts_bearer_tokens() {
        let s = redact("401 from provider, header was Bearer eyJhbGciOiJIUzI1NiJ9.x.y");
        assert!(!s.contains("eyJhbGciOiJIUzI1NiJ9"));
        assert!(s.contains(REDACTED));
    }

    #[test]
    fn redacts_provider_keys() {
        let s = redact("invalid key sk-proj-aabbccddeeff provided");
        assert!(!s.contains("sk-proj-aabbccddeeff"));
    }

    #[test]
    fn leaves_plain_messages_alone() {
        let msg = "lease expired for task t-42";
        assert_eq!(redact(msg), msg);
    }
}
