//! Reusable blocks that do not belong to any particular instrument.

pub mod command_response;

pub use command_response::CommandResponse;
