//! Stack growth for deep type graphs.
//!
//! Type rewriting recurses once per nesting level of the type graph, so a
//! long chain of wrapper structs or nested arrays can exhaust the native
//! stack. Recursive entry points go through [`ensure_sufficient_stack`].

/// A type rewrite step, with its memo bookkeeping, stays well inside this.
#[cfg(not(target_arch = "wasm32"))]
const RED_ZONE: usize = 64 * 1024;

/// Segment size for each growth; covers a few thousand nesting levels.
#[cfg(not(target_arch = "wasm32"))]
const GROW_BY: usize = 2 * 1024 * 1024;

/// Run `f` on a fresh stack segment if less than [`RED_ZONE`] remains.
#[inline]
#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, GROW_BY, f)
}

/// No stack switching on wasm; deep graphs rely on the host stack.
#[inline]
#[cfg(target_arch = "wasm32")]
pub(crate) fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    f()
}
