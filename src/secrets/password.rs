//! Password policies and generation.

use super::SecretString;
use crate::errors::{DbSecretsError, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 256;

/// Character-class rules for generated passwords.
///
/// The default yields 20 characters drawn from letters, digits and `-`, with
/// at least one of each class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PasswordPolicy {
    pub length: usize,
    pub min_lowercase: usize,
    pub min_uppercase: usize,
    pub min_digits: usize,
    pub min_symbols: usize,
    /// Symbol alphabet; empty disables symbols
    pub symbols: String,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: 20,
            min_lowercase: 1,
            min_uppercase: 1,
            min_digits: 1,
            min_symbols: 1,
            symbols: "-".to_string(),
        }
    }
}

impl PasswordPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&self.length) {
            return Err(DbSecretsError::validation_field(
                format!(
                    "length must be between {} and {}",
                    MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH
                ),
                "length",
            ));
        }

        let required = self.min_lowercase + self.min_uppercase + self.min_digits + self.min_symbols;
        if required > self.length {
            return Err(DbSecretsError::validation(format!(
                "minimum character counts ({}) exceed length ({})",
                required, self.length
            )));
        }

        if self.min_symbols > 0 && self.symbols.is_empty() {
            return Err(DbSecretsError::validation_field(
                "min_symbols requires a non-empty symbol alphabet",
                "symbols",
            ));
        }

        if self.symbols.chars().any(|c| !c.is_ascii_graphic() || c.is_ascii_alphanumeric()) {
            return Err(DbSecretsError::validation_field(
                "symbols must be printable ASCII punctuation",
                "symbols",
            ));
        }

        // MySQL reads a backslash differently under NO_BACKSLASH_ESCAPES
        if self.symbols.contains('\\') {
            return Err(DbSecretsError::validation_field(
                "symbols cannot contain a backslash",
                "symbols",
            ));
        }

        Ok(())
    }

    /// Produce a password satisfying every minimum, in random order
    pub fn generate(&self) -> SecretString {
        let mut rng = rand::thread_rng();
        let symbols = self.symbols.as_bytes();

        let mut alphabet = Vec::with_capacity(LOWERCASE.len() * 2 + DIGITS.len() + symbols.len());
        alphabet.extend_from_slice(LOWERCASE);
        alphabet.extend_from_slice(UPPERCASE);
        alphabet.extend_from_slice(DIGITS);
        alphabet.extend_from_slice(symbols);

        let mut chars = Vec::with_capacity(self.length);
        for (class, count) in [
            (LOWERCASE, self.min_lowercase),
            (UPPERCASE, self.min_uppercase),
            (DIGITS, self.min_digits),
            (symbols, self.min_symbols),
        ] {
            if class.is_empty() {
                continue;
            }
            for _ in 0..count {
                chars.push(class[rng.gen_range(0..class.len())]);
            }
        }
        while chars.len() < self.length {
            chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        chars.shuffle(&mut rng);

        SecretString::new(chars.into_iter().map(char::from).collect::<String>())
    }
}

/// Source of fresh secrets for principals.
///
/// Treated as a potentially blocking call: callers must not hold locks
/// across it.
#[async_trait]
pub trait PasswordGenerator: Send + Sync + std::fmt::Debug {
    /// Generate a password under the named policy, or the default policy
    async fn generate(&self, policy: Option<&str>) -> Result<SecretString>;

    /// Whether `name` refers to a known policy
    fn has_policy(&self, name: &str) -> bool;
}

/// Generator backed by the policies declared in configuration
#[derive(Debug, Clone, Default)]
pub struct PolicyPasswordGenerator {
    policies: HashMap<String, PasswordPolicy>,
    default_policy: PasswordPolicy,
}

impl PolicyPasswordGenerator {
    pub fn new(policies: HashMap<String, PasswordPolicy>) -> Self {
        Self { policies, default_policy: PasswordPolicy::default() }
    }

    fn policy(&self, name: Option<&str>) -> Result<&PasswordPolicy> {
        match name {
            None => Ok(&self.default_policy),
            Some("") => Ok(&self.default_policy),
            Some(name) => self.policies.get(name).ok_or_else(|| {
                DbSecretsError::invalid_config_field(
                    format!("Unknown password policy '{}'", name),
                    "password_policy",
                )
            }),
        }
    }
}

#[async_trait]
impl PasswordGenerator for PolicyPasswordGenerator {
    async fn generate(&self, policy: Option<&str>) -> Result<SecretString> {
        Ok(self.policy(policy)?.generate())
    }

    fn has_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}
