//! Identifier validation and quoting.
//!
//! SQL identifiers cannot be passed as parameters in prepared statements,
//! so every identifier that ends up in generated SQL goes through these
//! functions. User-supplied names (seed tables, filter tables) are
//! validated when they are parsed into a [`crate::schema::TableRef`];
//! names read back from the catalog are quoted directly.

use crate::error::{DumpError, Result};

/// Maximum identifier length accepted (PostgreSQL truncates at 63 bytes;
/// we reject rather than truncate).
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier before it is interpolated into SQL.
///
/// Rejects empty identifiers, identifiers containing null bytes, and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DumpError::Usage("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(DumpError::Usage(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DumpError::Usage(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded double quotes.
///
/// Callers hand this either a catalog-sourced name or one that already
/// passed [`validate_identifier`] at parse time.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualify a table name with its schema, both quoted.
pub fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_normal() {
        assert_eq!(quote("users"), "\"users\"");
        assert_eq!(quote("my_table"), "\"my_table\"");
        assert_eq!(quote("Users"), "\"Users\"");
    }

    #[test]
    fn test_quote_escapes_double_quote() {
        assert_eq!(quote("table\"name"), "\"table\"\"name\"");
        assert_eq!(quote("a\"b\"c"), "\"a\"\"b\"\"c\"");
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("public", "users"), "\"public\".\"users\"");
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_validate_rejects_null_byte() {
        assert!(validate_identifier("table\0name").is_err());
    }

    #[test]
    fn test_validate_rejects_too_long() {
        let long = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(validate_identifier(&long).is_err());
        let max = "a".repeat(MAX_IDENTIFIER_LENGTH);
        assert!(validate_identifier(&max).is_ok());
    }

    #[test]
    fn test_injection_attempt_is_quoted_not_executed() {
        let name = "Robert'); DROP TABLE Students;--";
        assert!(validate_identifier(name).is_ok());
        assert_eq!(quote(name), "\"Robert'); DROP TABLE Students;--\"");
    }
}
