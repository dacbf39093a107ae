//! A remote object store mounted as a local filesystem.
//!
//! The namespace lives in an embedded key/value store ([`meta`]); file
//! content is either inlined there ([`types::Attributes::has_content`]),
//! streamed from the remote on demand ([`reader`]), or staged in a local
//! working copy while open for writing ([`cache`]) and pushed back through
//! a durable upload queue ([`sync`]). The FUSE front-end ([`fs`]) ties the
//! pieces together.

pub mod cache;
pub mod config;
pub mod fs;
pub mod keyed_mutex;
pub mod meta;
pub mod reader;
pub mod remote;
pub mod sync;
pub mod types;
