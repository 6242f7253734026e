//! Backblaze B2 origin client

pub mod client;
pub mod errors;
pub mod types;

pub use client::B2Client;
pub use errors::OriginError;
