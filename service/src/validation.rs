//! Field validation for incoming requests.

use bank_common::{BankError, Result};

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 100;
const EMAIL_MAX: usize = 200;

fn invalid(field: &'static str, reason: impl Into<String>) -> BankError {
    BankError::InvalidArgument {
        field,
        reason: reason.into(),
    }
}

fn check_length(field: &'static str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(invalid(
            field,
            format!("must contain from {min}-{max} characters"),
        ));
    }
    Ok(())
}

/// Lowercase letters, digits and underscores, 3 to 100 characters.
pub fn validate_username(value: &str) -> Result<()> {
    check_length("username", value, NAME_MIN, NAME_MAX)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(invalid(
            "username",
            "must contain only lowercase letters, digits, or underscore",
        ));
    }
    Ok(())
}

/// Letters and spaces, 3 to 100 characters.
pub fn validate_full_name(value: &str) -> Result<()> {
    check_length("full_name", value, NAME_MIN, NAME_MAX)?;
    if !value.chars().all(|c| c.is_ascii_alphabetic() || c.is_whitespace()) {
        return Err(invalid("full_name", "must contain only letters or spaces"));
    }
    Ok(())
}

/// `local@domain` with both parts non-empty and no whitespace.
pub fn validate_email(value: &str) -> Result<()> {
    check_length("email", value, NAME_MIN, EMAIL_MAX)?;
    let valid = match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !value.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(invalid("email", "is not a valid email address"));
    }
    Ok(())
}

/// Credential hashes are opaque but never empty.
pub fn validate_password_hash(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid("hashed_password", "must not be empty"));
    }
    Ok(())
}

/// Positive row id.
pub fn validate_id(field: &'static str, value: i64) -> Result<()> {
    if value < 1 {
        return Err(invalid(field, "must be a positive id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_username() {
        assert!(validate_username("alice_01").is_ok());
        assert!(validate_username("al").is_err());
        assert!(validate_username("Alice").is_err());
        assert!(validate_username("alice-smith").is_err());
        assert!(validate_username(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_full_name() {
        assert!(validate_full_name("Alice Smith").is_ok());
        assert!(validate_full_name("Al1ce").is_err());
        assert!(validate_full_name("Al").is_err());
    }

    #[test]
    fn test_email() {
        assert!(validate_email("alice@example.com").is_ok());
        assert!(validate_email("alice.example.com").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("alice@").is_err());
        assert!(validate_email("a b@example.com").is_err());
        assert!(validate_email("a@b@c").is_err());
    }

    #[test]
    fn test_error_names_field() {
        match validate_username("x") {
            Err(BankError::InvalidArgument { field, .. }) => assert_eq!(field, "username"),
            other => panic!("unexpected {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn prop_valid_usernames_accepted(name in "[a-z0-9_]{3,100}") {
            prop_assert!(validate_username(&name).is_ok());
        }

        #[test]
        fn prop_uppercase_usernames_rejected(name in "[a-z]{2,20}[A-Z][a-z]{0,20}") {
            prop_assert!(validate_username(&name).is_err());
        }
    }
}
