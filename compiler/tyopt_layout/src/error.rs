//! Layout rewrite errors.
//!
//! Every error is an internal consistency violation: the module being
//! rewritten is left partially transformed and must be discarded.

use thiserror::Error;

/// Failure of a layout rewrite. Type names are rendered for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// An address index cannot be applied to the type reached so far.
    #[error("index {position} of an address computation does not resolve against `{ty}`")]
    UnresolvedIndex { ty: String, position: usize },

    #[error("struct `{ty}` indexed with a non-constant field index")]
    NonConstantStructIndex { ty: String },

    /// The rewritten address does not end at the rewritten target type.
    #[error("rewritten address reaches `{found}`, expected `{expected}`")]
    TargetMismatch { expected: String, found: String },

    #[error("unexpected constant in layout rewrite: {what}")]
    UnexpectedConstant { what: String },

    #[error("merged struct `{ty}` has no member mapping for field {field}")]
    MissingMemberMapping { ty: String, field: usize },

    /// A collapse-in-progress mapping was observed outside type resolution.
    #[error("unresolved collapsing mapping for `{ty}`")]
    TransientMapping { ty: String },

    #[error("function #{id} is not defined in the module")]
    UnknownFunction { id: u32 },
}
