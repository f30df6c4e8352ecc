pub mod error;
pub mod message;
pub mod retry;
pub mod status;
pub mod validation;
