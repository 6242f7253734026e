//! HTTP surface: the media proxy and the cache administration endpoints

pub mod errors;
pub mod media;
pub mod protocol;
pub mod range;
pub mod server;

pub use server::MediaServer;
