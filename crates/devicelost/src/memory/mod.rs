pub mod layout;
mod protect;

pub use protect::{ProtectGuard, exchange_word, write_word};
