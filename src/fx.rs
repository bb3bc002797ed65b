//! `FxHashMap` and `FxHashSet` aliases with deterministic default state.

pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
