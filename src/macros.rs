//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in graphstore.
//!
//! ## zerocopy_getters!
//!
//! Generates getter methods for zerocopy struct fields that use little-endian
//! wrapper types (U32, U64). Entity record headers are read-only in this crate
//! (records are produced by the binary serialization layer, an external
//! collaborator), so only the getter form is provided.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::U64;
//!
//! #[repr(C)]
//! struct EntityHeader {
//!     length: U64,
//!     type_id: U64,
//! }
//!
//! impl EntityHeader {
//!     zerocopy_getters! {
//!         length: u64,
//!         type_id: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn length(&self) -> u64 { self.length.get() }
//! // pub fn type_id(&self) -> u64 { self.type_id.get() }
//! ```

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
