//! Join token authority.

mod authority;

pub use authority::{Token, TokenAuthority, fingerprint};
