//! Pass configuration.

/// When a by-value argument whose pointee degenerated to an array gets an
/// explicit copy at the call site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByValCopyPolicy {
    /// Copy unless the callee is known to only read the argument.
    #[default]
    SkipReadOnlyCallees,
    /// Copy at every call site.
    Always,
}

/// Knobs for [`optimize_types`](crate::optimize_types).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeOptimizerConfig {
    /// Width of the shared word small integer fields are packed into.
    /// Only integer fields strictly narrower than this are packed.
    pub packing_word_bits: u32,
    pub byval_copy: ByValCopyPolicy,
}

impl Default for TypeOptimizerConfig {
    fn default() -> Self {
        Self {
            packing_word_bits: 32,
            byval_copy: ByValCopyPolicy::default(),
        }
    }
}
