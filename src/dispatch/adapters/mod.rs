//! Provider adapters.

pub mod http;

pub use http::{extract_text, ApiFlavor, HttpAdapter};
