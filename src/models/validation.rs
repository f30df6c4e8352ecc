use lettre::Address;

use crate::models::error::DecodeError;

const MAX_ADDRESS_LENGTH: usize = 254;

pub fn validate_email(address: &str) -> Result<(), DecodeError> {
    let invalid = |reason: &str| DecodeError::InvalidRecipient {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.trim().is_empty() {
        return Err(DecodeError::EmptyField("to"));
    }

    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(invalid("address too long (maximum 254 characters)"));
    }

    address
        .parse::<Address>()
        .map_err(|e| invalid(&e.to_string()))?;

    Ok(())
}

pub fn validate_non_empty(field: &'static str, value: &str) -> Result<(), DecodeError> {
    if value.trim().is_empty() {
        return Err(DecodeError::EmptyField(field));
    }

    Ok(())
}
