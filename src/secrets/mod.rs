//! Secret values and password generation.

pub mod password;
pub mod types;

pub use password::{PasswordGenerator, PasswordPolicy, PolicyPasswordGenerator};
pub use types::SecretString;
