//! SIP message model used by the tandem B2BUA.
//!
//! Messages are kept close to the wire: headers are an ordered multimap of
//! names to unparsed values so a forwarded message prints exactly the headers
//! it arrived with, in their original order and casing. Typed accessors parse
//! individual values on demand.

pub mod header;
pub mod host;
pub mod msg;
pub mod parse;
pub mod uri;

mod code;
mod method;

pub use code::{CodeKind, StatusCode};
pub use header::headers::Headers;
pub use header::name::Name;
pub use method::Method;
