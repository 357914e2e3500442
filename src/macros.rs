//! # Internal Macros
//!
//! Accessor generation for wire-format structs. Log records are declared as
//! `#[repr(C)]` zerocopy structs whose fields use little-endian wrapper
//! types (`U16`, `U32`, `U64`); `wire_accessors!` generates native-typed
//! getters and setters so call sites never touch the wrapper types
//! directly. Getter and setter names are both spelled out at the call site,
//! which keeps the macro a single arm over any wrapper width.
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U32};
//!
//! #[repr(C)]
//! struct LogHeader {
//!     log_type_code: U16,
//!     log_length: U16,
//!     storage_id: U32,
//! }
//!
//! impl LogHeader {
//!     wire_accessors! {
//!         log_type_code, set_log_type_code: u16 as U16;
//!         log_length, set_log_length: u16 as U16;
//!         storage_id, set_storage_id: u32 as U32;
//!     }
//! }
//! ```

/// Generates a native-typed getter and setter pair per little-endian
/// wire-struct field: `$getter` reads the field, `$setter` stores a new
/// value through the `$wrapper` type.
#[macro_export]
macro_rules! wire_accessors {
    ($($getter:ident, $setter:ident: $native:ty as $wrapper:ty;)*) => {
        $(
            #[inline]
            pub fn $getter(&self) -> $native {
                self.$getter.get()
            }

            #[inline]
            pub fn $setter(&mut self, value: $native) {
                self.$getter = <$wrapper>::new(value);
            }
        )*
    };
}
