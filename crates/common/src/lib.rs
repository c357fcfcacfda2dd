pub mod frames;
pub mod identities;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
