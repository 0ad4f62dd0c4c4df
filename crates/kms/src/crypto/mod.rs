//! Key wrapping primitives.
//!
//! This module is free of AWS and HTTP dependencies. It provides the
//! wrap/unwrap operations used when a KEK is held locally.
//!
//! # Wrapped DEK format
//!
//! ```text
//! v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```
//!
//! The key ID is bound as associated data, so a wrapped DEK copied under a
//! different key ID fails to unwrap.

pub mod codec;

pub use codec::{CodecError, KekBytes, KeyWrapCodec, WrappedDek, KEY_LEN};
