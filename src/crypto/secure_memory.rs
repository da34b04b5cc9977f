//! Secure handling of secrets
//!
//! Provides a string type that zeroes its contents on drop and never prints
//! them, plus a helper to scrub secrets out of captured tool output.

use std::fmt;
use std::ops::Deref;

use zeroize::Zeroize;

const REDACTED: &str = "[REDACTED]";

/// A string type that zeros its contents on drop
///
/// Use this for connection passwords and the encryption secret.
#[derive(Clone)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    /// Create a new SecureString
    pub fn new(s: impl Into<String>) -> Self {
        Self { inner: s.into() }
    }

    /// Get the string contents
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of characters, used for minimum-length checks
    pub fn char_count(&self) -> usize {
        self.inner.chars().count()
    }
}

impl Drop for SecureString {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl Deref for SecureString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AsRef<str> for SecureString {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// Don't print the contents in Debug output
impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureString")
            .field("len", &self.inner.len())
            .finish()
    }
}

// Don't print the contents in Display output
impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED {} bytes]", self.inner.len())
    }
}

/// Replace every occurrence of `secret` in `text`
///
/// Empty secrets leave the text unchanged.
pub fn redact(text: &str, secret: Option<&SecureString>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => text.replace(secret.as_str(), REDACTED),
        _ => text.to_string(),
    }
}
