//! Shared compilation settings.
//!
//! The whole pipeline is driven by one immutable `Flags` record passed by
//! reference into every pass. There are no process-wide singletons; two
//! compilations with different flags can coexist in one process.

/// Flags controlling code generation for a single compilation.
#[derive(Clone, Debug)]
pub struct Flags {
    /// Emit absolute `MOVZ`/`MOVK` address materialization sequences instead
    /// of `ADRP`+`ADD` pairs for every cross-section reference. Used when the
    /// output is loaded by the JIT rather than linked statically.
    pub jit_mode: bool,

    /// Absolute address of the writable data segment. Must be non-zero before
    /// code emission when `jit_mode` is set; ignored otherwise.
    pub data_segment_base_addr: u64,

    /// Guard vector and string element accesses with a length check that
    /// branches to a per-function `BCPL_BOUNDS_ERROR` stub.
    pub bounds_checking_enabled: bool,

    /// Run the optional cross-validation passes (class layouts, allocator
    /// conflict scan) in addition to normal tracing.
    pub trace_enabled: bool,

    /// Verbosity of pass tracing, 0..=5. Textual output goes through `log`;
    /// this only gates how much of it is produced.
    pub trace_level: u8,

    /// Scope-based automatic memory management. When set, block entry/exit
    /// emit `HeapManager_enter_scope`/`HeapManager_exit_scope` calls and no
    /// legacy `FREEVEC`/`BCPL_FREE_LIST`/`RELEASE` cleanup is synthesized.
    /// Exactly one cleanup strategy is used per compilation; the two are
    /// never mixed.
    pub samm_enabled: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            jit_mode: false,
            data_segment_base_addr: 0,
            bounds_checking_enabled: false,
            trace_enabled: false,
            trace_level: 0,
            samm_enabled: true,
        }
    }
}

impl Flags {
    /// Flags for a static (linked) build with SAMM cleanup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags for a JIT build with the data segment at `data_base`.
    pub fn jit(data_base: u64) -> Self {
        Self {
            jit_mode: true,
            data_segment_base_addr: data_base,
            ..Self::default()
        }
    }
}
