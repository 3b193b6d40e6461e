use crate::error::ConfigurationError;
use std::collections::HashSet;
use std::fmt;

/// Cipher names the russh backend knows how to negotiate, in default preference order.
pub const SUPPORTED_CIPHERS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes256-ctr",
    "aes192-ctr",
    "aes128-ctr",
];

/// Ordered, fixed cipher override applied to a transport before it starts.
///
/// Construction validates the shape only (non-empty, no blanks, no duplicates);
/// whether a backend supports each name is checked when it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSuite(Vec<String>);

impl CipherSuite {
    pub fn new<I, S>(names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(ConfigurationError::EmptyCipherList);
        }
        let mut seen = HashSet::new();
        for name in &names {
            if name.trim().is_empty() {
                return Err(ConfigurationError::BlankCipher);
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigurationError::DuplicateCipher(name.clone()));
            }
        }
        Ok(Self(names))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// First name not in [`SUPPORTED_CIPHERS`], if any.
    pub fn first_unsupported(&self) -> Option<&str> {
        self.0
            .iter()
            .map(String::as_str)
            .find(|name| !SUPPORTED_CIPHERS.contains(name))
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}
