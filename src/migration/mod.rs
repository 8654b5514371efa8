//! Structure-aware search/replace used for migrations and URL rewrites.

pub mod search_replace;
pub mod serialized;

pub use search_replace::{replace_text, search_replace, SearchReplaceOptions, SearchReplaceReport};
pub use serialized::{looks_serialized, SerializedError, SerializedValue};
