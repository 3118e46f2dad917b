//! Hash collections used by the dedup lookup and the session writer.
//!
//! With the `gxhash` feature the maps use gxhash, which needs AES-NI/SSE2
//! (or NEON) at compile time; without it they fall back to std's SipHash maps
//! behind the same names. Both hashers implement `Default`, so call sites
//! construct maps with `default()` and `with_capacity_and_hasher` and never
//! change between builds.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap, HashSet};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};
