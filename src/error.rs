//! Small helpers that turn an internal failure into a conventional Python
//! exception. Hash and equality failures have no helper here: those are
//! just whatever `PyErr` the host object's `__hash__`/`__eq__`/`__lt__` raised,
//! propagated unchanged via `?`.

use pyo3::exceptions::{PyKeyError, PyMemoryError, PyTypeError, PyValueError};
use pyo3::prelude::*;

/// A mode violation: the requested mutation is not permitted in the facade's
/// current mode.
pub fn type_mismatch(msg: impl Into<String>) -> PyErr {
    PyTypeError::new_err(msg.into())
}

/// A structural problem in a pair-iterable input to `zdict(...)` / `update()`.
pub fn value_mismatch(msg: impl Into<String>) -> PyErr {
    PyValueError::new_err(msg.into())
}

/// Lookup or `pop()` on an absent key with no default supplied. Carries the
/// key itself, matching `dict`'s own `KeyError` convention.
pub fn key_missing(key: Py<PyAny>) -> PyErr {
    PyKeyError::new_err(key)
}

/// Growth step failed to allocate. Reported before any slot is touched.
pub fn allocation_failure(msg: impl Into<String>) -> PyErr {
    PyMemoryError::new_err(msg.into())
}

pub fn mode_error(op: &str, mode: &str) -> PyErr {
    type_mismatch(format!("cannot {op} in '{mode}' mode"))
}
