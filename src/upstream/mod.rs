//! Concrete [`FileLookup`](crate::FileLookup) and [`Session`](crate::Session)
//! implementations.
//!
//! [`http`] talks to an origin over HTTP and is what the binary runs against.
//! [`memory`] keeps everything in process and can inject faults, which is
//! what the test suite uses.

pub mod http;
pub mod memory;

pub use self::http::{HttpOrigin, HttpSession};
pub use self::memory::{Faults, FetchRecord, MemorySession, MemoryStore};
