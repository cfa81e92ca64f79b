//! Frame cache backend implementations

pub mod mem;
