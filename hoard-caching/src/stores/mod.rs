//! Backend implementations

pub mod inmemory;

#[cfg(feature = "moka")]
pub mod moka;

pub use inmemory::InMemoryBackend;

#[cfg(feature = "moka")]
pub use self::moka::MokaBackend;
