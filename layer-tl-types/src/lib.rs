//! TL binary primitives and a dynamic value model.
//!
//! The engine never links a generated schema. Fixed MTProto constructors are
//! written by hand against [`Serializable`] / [`Deserializable`], while
//! API-level calls travel as [`Value`] trees that an external codec turns
//! into bytes.
//!
//! # Overview
//!
//! | Module          | Contents                                                 |
//! |-----------------|----------------------------------------------------------|
//! | [`serialize`]   | [`Serializable`] and impls for TL primitives             |
//! | [`deserialize`] | [`Deserializable`], the [`Cursor`] reader, errors        |
//! | [`value`]       | [`Value`] / [`Object`], the dynamic argument/result tree |
//!
//! # Example
//!
//! ```rust
//! use layer_tl_types::{Object, Value};
//!
//! let args: Value = Object::new("upload.getFile")
//!     .with("offset", 0i64)
//!     .with("limit", 1024 * 1024)
//!     .into();
//! assert_eq!(args.get("limit").and_then(Value::as_i32), Some(1024 * 1024));
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
pub mod serialize;
pub mod value;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;
pub use value::{Object, Value};

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every hand-written constructor has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent as an RPC call.
///
/// `Return` is the type the server will respond with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
