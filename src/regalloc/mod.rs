//! Register allocation.

pub mod linear_scan;

pub use linear_scan::{allocate, AllocationMap};
