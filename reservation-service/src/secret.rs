use std::fmt;

/// A server-held secret that callers present as a token.
#[derive(Clone)]
pub struct SharedSecret(String);

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Constant-time comparison. An empty secret never matches anything.
    pub fn verify(&self, presented: &str) -> bool {
        !self.0.is_empty() && constant_time_eq::constant_time_eq(self.0.as_bytes(), presented.as_bytes())
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(***)")
    }
}

/// Pulls `<token>` out of an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_exact_match_only() {
        let secret = SharedSecret::new("s3cret");
        assert!(secret.verify("s3cret"));
        assert!(!secret.verify("s3cre"));
        assert!(!secret.verify("s3cret "));
        assert!(!SharedSecret::new("").verify(""));
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn debug_does_not_leak() {
        assert_eq!(format!("{:?}", SharedSecret::new("abc")), "SharedSecret(***)");
    }
}
