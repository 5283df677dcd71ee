//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Validates a caller-supplied identifier: 1 to 64 visible ASCII characters
/// drawn from letters, digits, `-`, `_`, `.` and `:`.
fn validate_identifier(
    value: &str,
    code: &'static str,
    label: &str,
) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LENGTH {
        let mut err = ValidationError::new(code);
        err.message = Some(
            format!(
                "{label} must be between 1 and {MAX_IDENTIFIER_LENGTH} characters (got {})",
                value.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        let mut err = ValidationError::new(code);
        err.message = Some(format!("{label} contains unsupported characters").into());
        return Err(err);
    }

    Ok(())
}

/// Validates a device identifier presented by a scanner.
///
/// # Examples
///
/// ```ignore
/// validate_device_id("GM_STATION_1") // Ok
/// validate_device_id("")             // Err - empty
/// validate_device_id("gm station")   // Err - whitespace
/// ```
pub fn validate_device_id(id: &str) -> Result<(), ValidationError> {
    validate_identifier(id, "device_id", "Device ID")
}

/// Validates a scanned token identifier (RFID tag content).
pub fn validate_token_id(id: &str) -> Result<(), ValidationError> {
    validate_identifier(id, "token_id", "Token ID")
}

/// Validates a team identifier such as `001`.
pub fn validate_team_id(id: &str) -> Result<(), ValidationError> {
    validate_identifier(id, "team_id", "Team ID")
}

/// Validates a client-generated batch identifier.
pub fn validate_batch_id(id: &str) -> Result<(), ValidationError> {
    validate_identifier(id, "batch_id", "Batch ID")
}

/// Validation error for a required field that was omitted.
pub fn missing(field: &'static str) -> ValidationError {
    let mut err = ValidationError::new("required");
    err.message = Some(format!("{field} is required").into());
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_device_id_valid() {
        assert!(validate_device_id("GM_STATION_1").is_ok());
        assert!(validate_device_id("esp32-0a1b").is_ok());
        assert!(validate_device_id("kiosk.lobby:2").is_ok());
    }

    #[test]
    fn test_validate_device_id_invalid_length() {
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_token_id_invalid_format() {
        assert!(validate_token_id("kaa 001").is_err()); // space
        assert!(validate_token_id("kaa001/").is_err());
        assert!(validate_token_id("kaa001").is_ok());
    }

    #[test]
    fn test_missing_carries_field_name() {
        let err = missing("tokenId");
        assert_eq!(err.code, "required");
        assert_eq!(err.message.as_deref(), Some("tokenId is required"));
    }
}
