//! Authentication
//!
//! - Password hashing with Argon2id
//! - HS256 session tokens

pub mod password;
pub mod token;

pub use password::{hash_password, verify_password};
pub use token::{Claims, TokenIssuer};
