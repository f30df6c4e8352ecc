//! Wire format of queued notification requests.
//!
//! Every failure here is poison: the same bytes will fail the same way on
//! every redelivery, so callers drop instead of retrying.

use crate::models::{
    error::DecodeError,
    message::NotificationRequest,
    validation::{validate_email, validate_non_empty},
};

/// Producers cap request bodies at 1 MiB; anything larger did not come from them.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

pub fn decode(bytes: &[u8]) -> Result<NotificationRequest, DecodeError> {
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            limit: MAX_PAYLOAD_BYTES,
        });
    }

    let request = serde_json::from_slice::<NotificationRequest>(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    validate_email(&request.to)?;
    validate_non_empty("subject", &request.subject)?;
    validate_non_empty("text", &request.text)?;

    Ok(request)
}
