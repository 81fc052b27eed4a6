//! Username and channel-name validation.

use thiserror::Error;

/// Byte-length cap for usernames after trimming.
pub const MAX_NAME_LEN: usize = 50;

/// Byte-length cap for channel names after trimming.
pub const MAX_CHANNEL_NAME_LEN: usize = 50;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is too long")]
    TooLong,
}

/// Trim Unicode whitespace and validate byte length against `max_len`.
///
/// Returns the trimmed view into the input on success.
pub fn validate_name(s: &str, max_len: usize) -> Result<&str, NameError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(NameError::Empty);
    }
    if trimmed.len() > max_len {
        return Err(NameError::TooLong);
    }
    Ok(trimmed)
}

/// Case-folded key for uniqueness checks.
pub fn fold(name: &str) -> String {
    name.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_unicode_whitespace() {
        assert_eq!(validate_name("\u{00A0}alice\t ", MAX_NAME_LEN), Ok("alice"));
    }

    #[test]
    fn round_trips_validated_names() {
        let name = "bob";
        let padded = format!(" {name} ");
        assert_eq!(validate_name(&padded, MAX_NAME_LEN), Ok(name));
    }

    #[test]
    fn rejects_empty_and_whitespace_only() {
        assert_eq!(validate_name("", MAX_NAME_LEN), Err(NameError::Empty));
        assert_eq!(validate_name(" \u{2003} ", MAX_NAME_LEN), Err(NameError::Empty));
    }

    #[test]
    fn length_is_measured_in_bytes() {
        // 17 four-byte scalars: 68 bytes, over the 50-byte cap.
        let name = "\u{1F3A4}".repeat(17);
        assert_eq!(validate_name(&name, MAX_NAME_LEN), Err(NameError::TooLong));
        assert!(validate_name(&"x".repeat(50), MAX_NAME_LEN).is_ok());
        assert_eq!(
            validate_name(&"x".repeat(51), MAX_NAME_LEN),
            Err(NameError::TooLong)
        );
    }

    #[test]
    fn fold_is_case_insensitive() {
        assert_eq!(fold("Alice"), fold("aLICE"));
    }
}
