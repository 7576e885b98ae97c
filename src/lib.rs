mod error;
mod facade;
mod hashcore;
mod iterator;
mod mode;

use pyo3::prelude::*;

use facade::Zdict;
use iterator::ZdictKeyIter;
use mode::Mode;

#[pymodule]
fn _zdict(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Zdict>()?;
    m.add_class::<ZdictKeyIter>()?;
    m.add("MODE_MUTABLE", Mode::Mutable.code())?;
    m.add("MODE_IMMUTABLE", Mode::Immutable.code())?;
    m.add("MODE_READONLY", Mode::Readonly.code())?;
    m.add("MODE_INSERT", Mode::Insert.code())?;
    m.add("MODE_ARENA", Mode::Arena.code())?;
    Ok(())
}
