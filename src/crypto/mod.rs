// Chat key lifecycle and message encryption

pub mod cipher;
pub mod key_manager;
pub mod key_store;

pub use cipher::{ChatKey, Envelope};
pub use key_manager::{KeyManager, KeySource};
pub use key_store::SessionKeyCache;
