//! `ZdictKeyIter` — the iterator returned by `iter(f)` / `for k in f`.
//!
//! Snapshots the key handles up front (one full scan of the slot array) and
//! then serves them one at a time. Mutating the facade afterwards, including
//! a resize, never affects an iterator already in flight: it owns retained
//! handles, not a cursor into the table.

use pyo3::prelude::*;

#[pyclass(module = "zdict")]
pub struct ZdictKeyIter {
    keys: std::vec::IntoIter<Py<PyAny>>,
}

impl ZdictKeyIter {
    pub fn new(keys: Vec<Py<PyAny>>) -> Self {
        ZdictKeyIter {
            keys: keys.into_iter(),
        }
    }
}

#[pymethods]
impl ZdictKeyIter {
    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(mut slf: PyRefMut<'_, Self>) -> Option<Py<PyAny>> {
        slf.keys.next()
    }
}
