//! Statement templating.
//!
//! Statements carry `{{name}}`, `{{username}}`, `{{password}}` and
//! `{{expiration}}` placeholders. Values are escaped for the target
//! dialect before substitution and substitution happens in a single pass,
//! so a value that itself contains `{{...}}` is never expanded again.

use crate::errors::{DbSecretsError, Result};

/// SQL string-literal quoting rules.
///
/// Principal names are never escaped; `validate_principal_name` rejects any
/// name that would need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
}

impl Dialect {
    /// Escape `value` for use inside a single-quoted string literal
    pub fn escape_literal(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        match self {
            Self::MySql => {
                for c in value.chars() {
                    match c {
                        '\'' => out.push_str("''"),
                        '\\' => out.push_str("\\\\"),
                        '\0' => out.push_str("\\0"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\x1a' => out.push_str("\\Z"),
                        c => out.push(c),
                    }
                }
            }
            // standard_conforming_strings: only quotes are special
            Self::Postgres => {
                for c in value.chars() {
                    if c == '\'' {
                        out.push('\'');
                    }
                    out.push(c);
                }
            }
        }
        out
    }

}

/// Reject principal names that could break out of any quoting context
pub fn validate_principal_name(username: &str, max_len: usize) -> Result<()> {
    if username.is_empty() {
        return Err(DbSecretsError::validation_field("username cannot be empty", "username"));
    }
    if username.chars().count() > max_len {
        return Err(DbSecretsError::validation_field(
            format!("username exceeds {} characters", max_len),
            "username",
        ));
    }
    if username.chars().any(|c| matches!(c, '\'' | '"' | '`' | '\\') || c.is_control()) {
        return Err(DbSecretsError::validation_field(
            "username cannot contain quotes, backslashes or control characters",
            "username",
        ));
    }
    Ok(())
}

/// Split templated statements on `;` into individual statements.
///
/// Splitting happens before substitution so values cannot introduce
/// statement boundaries.
pub fn split_statements(statements: &[String]) -> Vec<String> {
    statements
        .iter()
        .flat_map(|s| s.split(';'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Substitute `{{key}}` placeholders. Unknown placeholders are kept verbatim.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match values.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render each statement with the principal's escaped values
pub fn render_statements(
    dialect: Dialect,
    statements: &[String],
    username: &str,
    password: Option<&str>,
    expiration: Option<&str>,
) -> Vec<String> {
    let escaped_password = password.map(|p| dialect.escape_literal(p));
    let mut values: Vec<(&str, &str)> = vec![("name", username), ("username", username)];
    if let Some(password) = escaped_password.as_deref() {
        values.push(("password", password));
    }
    if let Some(expiration) = expiration {
        values.push(("expiration", expiration));
    }

    split_statements(statements).iter().map(|s| render(s, &values)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_keys() {
        let out = render(
            "CREATE USER '{{name}}'@'%' IDENTIFIED BY '{{ password }}'",
            &[("name", "svc1"), ("password", "pw")],
        );
        assert_eq!(out, "CREATE USER 'svc1'@'%' IDENTIFIED BY 'pw'");
    }

    #[test]
    fn test_render_keeps_unknown_and_unterminated() {
        assert_eq!(render("GRANT {{role}} TO x", &[]), "GRANT {{role}} TO x");
        assert_eq!(render("broken {{name", &[("name", "x")]), "broken {{name");
    }

    #[test]
    fn test_render_is_single_pass() {
        let out = render("{{name}}:{{password}}", &[("name", "{{password}}"), ("password", "pw")]);
        assert_eq!(out, "{{password}}:pw");
    }

    #[test]
    fn test_mysql_literal_escaping() {
        let d = Dialect::MySql;
        assert_eq!(d.escape_literal("it's"), "it''s");
        assert_eq!(d.escape_literal("a\\b"), "a\\\\b");
        assert_eq!(d.escape_literal("x\ny"), "x\\ny");
    }

    #[test]
    fn test_postgres_literal_escaping() {
        let d = Dialect::Postgres;
        assert_eq!(d.escape_literal("it's"), "it''s");
        assert_eq!(d.escape_literal("a\\b"), "a\\b");
    }

    #[test]
    fn test_injection_attempt_stays_inside_literal() {
        let statements = vec!["ALTER USER '{{name}}'@'%' IDENTIFIED BY '{{password}}'".to_string()];
        let rendered = render_statements(
            Dialect::MySql,
            &statements,
            "svc1",
            Some("x'; DROP DATABASE prod; --"),
            None,
        );
        assert_eq!(rendered.len(), 1);
        assert_eq!(
            rendered[0],
            "ALTER USER 'svc1'@'%' IDENTIFIED BY 'x''; DROP DATABASE prod; --'"
        );
    }

    #[test]
    fn test_split_statements() {
        let statements = vec![
            "CREATE USER '{{name}}'; GRANT SELECT ON *.* TO '{{name}}';".to_string(),
            "  ".to_string(),
        ];
        assert_eq!(
            split_statements(&statements),
            vec!["CREATE USER '{{name}}'", "GRANT SELECT ON *.* TO '{{name}}'"]
        );
    }

    #[test]
    fn test_validate_principal_name() {
        assert!(validate_principal_name("v-app-abc123", 32).is_ok());
        assert!(validate_principal_name("", 32).is_err());
        assert!(validate_principal_name("a'b", 32).is_err());
        assert!(validate_principal_name("a\"b", 32).is_err());
        assert!(validate_principal_name("a\nb", 32).is_err());
        assert!(validate_principal_name(&"x".repeat(33), 32).is_err());
    }
}
