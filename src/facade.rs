//! `zdict` — the mode-gated mapping façade wrapping a [`HashCore`].
//!
//! All user operations enter here; reads and writes that survive the mode
//! check delegate straight to `HashCore`. This module never touches `meta`,
//! `hash`, `key`, or `val` arrays directly.

use std::cell::Cell;
use std::cmp::Ordering;

use pyo3::exceptions::PyKeyError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};
use pyo3::{PyTraverseError, PyVisit};

use crate::error::{key_missing, mode_error, value_mismatch};
use crate::hashcore::{HashCore, MIN_CAPACITY};
use crate::iterator::ZdictKeyIter;
use crate::mode::Mode;

#[pyclass(name = "zdict", module = "zdict")]
pub struct Zdict {
    core: HashCore,
    mode: Mode,
    cached_hash: Cell<Option<isize>>,
}

/// Unpack one element of a pair-iterable into `(key, value)`, enforcing the
/// "each item must be a 2-tuple" rule from the construct/update protocol.
fn unpack_pair(item: &Bound<'_, PyAny>) -> PyResult<(Py<PyAny>, Py<PyAny>)> {
    let tup = item
        .cast::<PyTuple>()
        .map_err(|_| value_mismatch("each item must be a 2-tuple"))?;
    if tup.len() != 2 {
        return Err(value_mismatch("each item must be a 2-tuple"));
    }
    Ok((tup.get_item(0)?.unbind(), tup.get_item(1)?.unbind()))
}

/// Gather `(key, value)` pairs from a construct/update source: a callable
/// `items` attribute if present, otherwise any iterable of 2-tuples.
fn collect_pairs(source: &Bound<'_, PyAny>, out: &mut Vec<(Py<PyAny>, Py<PyAny>)>) -> PyResult<()> {
    if let Ok(items_attr) = source.getattr("items") {
        if items_attr.is_callable() {
            let items = items_attr.call0()?;
            for pair in items.try_iter()? {
                out.push(unpack_pair(&pair?)?);
            }
            return Ok(());
        }
    }
    for pair in source.try_iter()? {
        out.push(unpack_pair(&pair?)?);
    }
    Ok(())
}

/// Sort `(key, value)` pairs by key using Python's `<`, mirroring the
/// stable-preorder behavior of `sorted()`. Any comparison failure from host
/// code is propagated unchanged once sorting completes.
fn sort_pairs_by_key(py: Python<'_>, pairs: &mut [(Py<PyAny>, Py<PyAny>)]) -> PyResult<()> {
    let mut sort_err: Option<PyErr> = None;
    pairs.sort_by(|a, b| {
        if sort_err.is_some() {
            return Ordering::Equal;
        }
        let ak = a.0.bind(py);
        let bk = b.0.bind(py);
        match ak.lt(bk) {
            Ok(true) => Ordering::Less,
            Ok(false) => match bk.lt(ak) {
                Ok(true) => Ordering::Greater,
                Ok(false) => Ordering::Equal,
                Err(e) => {
                    sort_err = Some(e);
                    Ordering::Equal
                }
            },
            Err(e) => {
                sort_err = Some(e);
                Ordering::Equal
            }
        }
    });
    match sort_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[pymethods]
impl Zdict {
    #[new]
    #[pyo3(signature = (data=None, mode="mutable", **kwargs))]
    fn new(
        py: Python<'_>,
        data: Option<&Bound<'_, PyAny>>,
        mode: &str,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<Self> {
        let mode = Mode::from_name(mode)?;
        let mut core = HashCore::new(MIN_CAPACITY)?;

        if let Some(src) = data {
            let mut pairs = Vec::new();
            collect_pairs(src, &mut pairs)?;
            for (k, v) in pairs {
                core.set(py, k, v)?;
            }
        }
        if let Some(kw) = kwargs {
            for (k, v) in kw.iter() {
                core.set(py, k.unbind(), v.unbind())?;
            }
        }

        Ok(Zdict {
            core,
            mode,
            cached_hash: Cell::new(None),
        })
    }

    fn __len__(&self) -> usize {
        self.core.len()
    }

    fn __getitem__(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        match self.core.get(py, key)? {
            Some(v) => Ok(v),
            None => Err(key_missing(key.clone().unbind())),
        }
    }

    fn __setitem__(&mut self, py: Python<'_>, key: Py<PyAny>, value: Py<PyAny>) -> PyResult<()> {
        let exists = self.core.get(py, key.bind(py))?.is_some();
        if exists {
            if !self.mode.allows_update() {
                return Err(mode_error("update", self.mode.name()));
            }
        } else if !self.mode.allows_insert() {
            return Err(mode_error("insert", self.mode.name()));
        }
        self.core.set(py, key, value)?;
        self.cached_hash.set(None);
        Ok(())
    }

    fn __delitem__(&mut self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<()> {
        if !self.mode.allows_remove() {
            return Err(mode_error("delete", self.mode.name()));
        }
        match self.core.delete(py, key)? {
            Some(_) => {
                self.cached_hash.set(None);
                Ok(())
            }
            None => Err(key_missing(key.clone().unbind())),
        }
    }

    fn __contains__(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<bool> {
        Ok(self.core.get(py, key)?.is_some())
    }

    fn __iter__(&self, py: Python<'_>) -> ZdictKeyIter {
        ZdictKeyIter::new(self.core.keys_snapshot(py))
    }

    fn __repr__(&self, py: Python<'_>) -> PyResult<String> {
        let items = self.core.items_snapshot(py);
        let mut parts = Vec::with_capacity(items.len());
        for (k, v) in &items {
            parts.push(format!(
                "{}: {}",
                k.bind(py).repr()?,
                v.bind(py).repr()?
            ));
        }
        Ok(format!(
            "zdict({{{}}}, mode='{}')",
            parts.join(", "),
            self.mode.name()
        ))
    }

    fn __eq__(&self, py: Python<'_>, other: &Bound<'_, PyAny>) -> PyResult<bool> {
        let other_pairs: Vec<(Py<PyAny>, Py<PyAny>)> =
            if let Ok(other_zdict) = other.extract::<PyRef<'_, Zdict>>() {
                other_zdict.core.items_snapshot(py)
            } else if other
                .getattr("items")
                .map(|a| a.is_callable())
                .unwrap_or(false)
            {
                let mut pairs = Vec::new();
                collect_pairs(other, &mut pairs)?;
                pairs
            } else {
                return Ok(false);
            };

        if other_pairs.len() != self.core.len() {
            return Ok(false);
        }
        for (k, v) in &other_pairs {
            match self.core.get(py, k.bind(py))? {
                Some(sv) => {
                    if !sv.bind(py).eq(v.bind(py))? {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn __hash__(&self, py: Python<'_>) -> PyResult<isize> {
        if !self.mode.is_hashable() {
            return Err(mode_error("hash", self.mode.name()));
        }
        if let Some(h) = self.cached_hash.get() {
            return Ok(h);
        }
        let mut pairs = self.core.items_snapshot(py);
        sort_pairs_by_key(py, &mut pairs)?;

        let mut tuples = Vec::with_capacity(pairs.len());
        for (k, v) in &pairs {
            tuples.push(PyTuple::new(py, [k.bind(py).clone(), v.bind(py).clone()])?);
        }
        let outer = PyTuple::new(py, tuples)?;
        let h = outer.hash()?;
        self.cached_hash.set(Some(h));
        Ok(h)
    }

    #[getter]
    fn mode(&self) -> &'static str {
        self.mode.name()
    }

    #[pyo3(signature = (key, default=None))]
    fn get(
        &self,
        py: Python<'_>,
        key: &Bound<'_, PyAny>,
        default: Option<Py<PyAny>>,
    ) -> PyResult<Option<Py<PyAny>>> {
        match self.core.get(py, key)? {
            Some(v) => Ok(Some(v)),
            None => Ok(default),
        }
    }

    #[pyo3(signature = (key, *default))]
    fn pop(
        &mut self,
        py: Python<'_>,
        key: Py<PyAny>,
        default: &Bound<'_, PyTuple>,
    ) -> PyResult<Py<PyAny>> {
        if !self.mode.allows_remove() {
            return Err(mode_error("pop", self.mode.name()));
        }
        match self.core.delete(py, key.bind(py))? {
            Some(removed) => {
                self.cached_hash.set(None);
                Ok(removed)
            }
            None => {
                if default.len() > 0 {
                    Ok(default.get_item(0)?.unbind())
                } else {
                    Err(key_missing(key))
                }
            }
        }
    }

    fn popitem(&mut self, py: Python<'_>) -> PyResult<(Py<PyAny>, Py<PyAny>)> {
        if !self.mode.allows_remove() {
            return Err(mode_error("popitem", self.mode.name()));
        }
        let _ = py;
        match self.core.pop_first_occupied() {
            Some(pair) => {
                self.cached_hash.set(None);
                Ok(pair)
            }
            None => Err(PyKeyError::new_err("popitem(): zdict is empty")),
        }
    }

    #[pyo3(signature = (key, default=None))]
    fn setdefault(
        &mut self,
        py: Python<'_>,
        key: Py<PyAny>,
        default: Option<Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        if let Some(v) = self.core.get(py, key.bind(py))? {
            return Ok(v);
        }
        if !self.mode.allows_insert() {
            return Err(mode_error("setdefault", self.mode.name()));
        }
        let default_val = default.unwrap_or_else(|| py.None());
        self.core.set(py, key, default_val.clone_ref(py))?;
        self.cached_hash.set(None);
        Ok(default_val)
    }

    #[pyo3(signature = (other=None, **kwargs))]
    fn update(
        &mut self,
        py: Python<'_>,
        other: Option<&Bound<'_, PyAny>>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<()> {
        let mut pairs = Vec::new();
        if let Some(src) = other {
            collect_pairs(src, &mut pairs)?;
        }
        if let Some(kw) = kwargs {
            for (k, v) in kw.iter() {
                pairs.push((k.unbind(), v.unbind()));
            }
        }

        match self.mode {
            Mode::Insert => {
                // Pre-stage and verify before applying anything: a single
                // collision with an existing key rejects the whole call.
                for (k, _) in &pairs {
                    if self.core.get(py, k.bind(py))?.is_some() {
                        return Err(mode_error("update", self.mode.name()));
                    }
                }
                for (k, v) in pairs {
                    self.core.set(py, k, v)?;
                }
            }
            Mode::Mutable | Mode::Arena => {
                for (k, v) in pairs {
                    self.core.set(py, k, v)?;
                }
            }
            Mode::Immutable | Mode::Readonly => {
                return Err(mode_error("update", self.mode.name()));
            }
        }
        self.cached_hash.set(None);
        Ok(())
    }

    fn clear(&mut self, py: Python<'_>) -> PyResult<()> {
        if !self.mode.allows_remove() {
            return Err(mode_error("clear", self.mode.name()));
        }
        let _ = py;
        self.core.clear();
        self.cached_hash.set(None);
        Ok(())
    }

    fn copy(&self, py: Python<'_>) -> PyResult<Zdict> {
        Ok(Zdict {
            core: self.core.shallow_copy(py)?,
            mode: self.mode,
            cached_hash: Cell::new(self.cached_hash.get()),
        })
    }

    fn keys(&self, py: Python<'_>) -> Vec<Py<PyAny>> {
        self.core.keys_snapshot(py)
    }

    fn values(&self, py: Python<'_>) -> Vec<Py<PyAny>> {
        self.core.values_snapshot(py)
    }

    fn items(&self, py: Python<'_>) -> Vec<(Py<PyAny>, Py<PyAny>)> {
        self.core.items_snapshot(py)
    }

    fn __traverse__(&self, visit: PyVisit<'_>) -> Result<(), PyTraverseError> {
        let mut result = Ok(());
        self.core.for_each_handle(|h| {
            if result.is_ok() {
                result = visit.call(h);
            }
        });
        result
    }

    fn __clear__(&mut self) {
        self.core.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyDict;

    fn make(py: Python<'_>, mode: &str) -> Zdict {
        Zdict::new(py, None, mode, None).unwrap()
    }

    #[test]
    fn insert_get_len() {
        Python::attach(|py| {
            let mut f = make(py, "mutable");
            let k = "a".into_pyobject(py).unwrap().into_any().unbind();
            let v = 1i64.into_pyobject(py).unwrap().into_any().unbind();
            f.__setitem__(py, k.clone_ref(py), v).unwrap();
            assert_eq!(f.__len__(), 1);
            let got = f.__getitem__(py, k.bind(py)).unwrap();
            assert_eq!(got.bind(py).extract::<i64>().unwrap(), 1);
        });
    }

    #[test]
    fn readonly_rejects_insert() {
        Python::attach(|py| {
            let mut f = make(py, "readonly");
            let k = "y".into_pyobject(py).unwrap().into_any().unbind();
            let v = 1i64.into_pyobject(py).unwrap().into_any().unbind();
            let err = f.__setitem__(py, k, v).unwrap_err();
            assert!(err.is_instance_of::<pyo3::exceptions::PyTypeError>(py));
            assert_eq!(f.__len__(), 0);
        });
    }

    #[test]
    fn insert_mode_update_fails_atomically() {
        Python::attach(|py| {
            let mut f = make(py, "insert");
            let d1 = PyDict::new(py);
            d1.set_item("a", 1).unwrap();
            d1.set_item("b", 2).unwrap();
            f.update(py, Some(d1.as_any()), None).unwrap();

            let d2 = PyDict::new(py);
            d2.set_item("b", 3).unwrap();
            d2.set_item("c", 4).unwrap();
            assert!(f.update(py, Some(d2.as_any()), None).is_err());

            assert_eq!(f.__len__(), 2);
            let b = "b".into_pyobject(py).unwrap().into_any().unbind();
            let v = f.__getitem__(py, b.bind(py)).unwrap();
            assert_eq!(v.bind(py).extract::<i64>().unwrap(), 2);
        });
    }

    #[test]
    fn immutable_hash_stable_and_order_independent() {
        Python::attach(|py| {
            let d1 = PyDict::new(py);
            d1.set_item("p", 1).unwrap();
            d1.set_item("q", 2).unwrap();
            let f = Zdict::new(py, Some(d1.as_any()), "immutable", None).unwrap();

            let d2 = PyDict::new(py);
            d2.set_item("q", 2).unwrap();
            d2.set_item("p", 1).unwrap();
            let g = Zdict::new(py, Some(d2.as_any()), "immutable", None).unwrap();

            let f_copy = Py::new(py, f.copy(py).unwrap()).unwrap();
            assert!(f.__eq__(py, f_copy.bind(py).as_any()).unwrap());
            let h1 = f.__hash__(py).unwrap();
            let h2 = f.__hash__(py).unwrap();
            assert_eq!(h1, h2);
            let hg = g.__hash__(py).unwrap();
            assert_eq!(h1, hg);
        });
    }

    #[test]
    fn immutable_forbids_mutation_and_keeps_cached_hash() {
        Python::attach(|py| {
            let d = PyDict::new(py);
            d.set_item("a", 1).unwrap();
            let mut f = Zdict::new(py, Some(d.as_any()), "immutable", None).unwrap();
            let h_before = f.__hash__(py).unwrap();

            let k = "a".into_pyobject(py).unwrap().into_any().unbind();
            let v = 2i64.into_pyobject(py).unwrap().into_any().unbind();
            assert!(f.__setitem__(py, k, v).is_err());

            let h_after = f.__hash__(py).unwrap();
            assert_eq!(h_before, h_after);
        });
    }

    #[test]
    fn popitem_on_empty_raises_key_error() {
        Python::attach(|py| {
            let mut f = make(py, "mutable");
            let err = f.popitem(py).unwrap_err();
            assert!(err.is_instance_of::<PyKeyError>(py));
        });
    }

    /// Dict-equivalence property: a scripted sequence of inserts and deletes
    /// applied to both a mutable facade and a plain `dict` leaves their
    /// entry sets equal after every step.
    #[test]
    fn matches_reference_dict_across_a_scripted_sequence() {
        Python::attach(|py| {
            let mut f = make(py, "mutable");
            let reference = PyDict::new(py);

            let ops: &[(i64, Option<i64>)] = &[
                (1, Some(10)),
                (2, Some(20)),
                (3, Some(30)),
                (2, Some(99)), // overwrite
                (1, None),     // delete
                (4, Some(40)),
                (3, None), // delete
            ];

            for &(key, value) in ops {
                let k = key.into_pyobject(py).unwrap().into_any().unbind();
                match value {
                    Some(v) => {
                        let pv = v.into_pyobject(py).unwrap().into_any().unbind();
                        f.__setitem__(py, k.clone_ref(py), pv.clone_ref(py))
                            .unwrap();
                        reference.set_item(k.clone_ref(py), pv).unwrap();
                    }
                    None => {
                        f.__delitem__(py, k.bind(py)).unwrap();
                        reference.del_item(k.bind(py)).unwrap();
                    }
                }
                assert_eq!(f.__len__(), reference.len());
                for (rk, rv) in reference.iter() {
                    let got = f.__getitem__(py, &rk).unwrap();
                    assert!(got.bind(py).eq(&rv).unwrap());
                }
            }
        });
    }

    /// Reference discipline: removing an entry (or dropping the facade
    /// entirely) releases the handles it held, observed via CPython's own
    /// refcount rather than any bookkeeping internal to this crate.
    #[test]
    fn delete_releases_its_reference() {
        Python::attach(|py| {
            let k = "shared".into_pyobject(py).unwrap().into_any().unbind();
            let v = PyDict::new(py).into_any().unbind();
            let before = v.bind(py).get_refcnt();

            let mut f = make(py, "mutable");
            f.__setitem__(py, k.clone_ref(py), v.clone_ref(py)).unwrap();
            assert_eq!(v.bind(py).get_refcnt(), before + 1);

            f.__delitem__(py, k.bind(py)).unwrap();
            assert_eq!(v.bind(py).get_refcnt(), before);
        });
    }
}
