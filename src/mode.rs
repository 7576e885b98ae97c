//! Tagged variant for the facade's operational mode, with a small table of
//! per-mode capability predicates, dispatched the same way a storage policy
//! tag would be: matched directly on a plain enum, no dynamic dispatch
//! needed since the hot path (`get`) is mode-agnostic.

use crate::error::type_mismatch;
use pyo3::prelude::*;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Mutable,
    Immutable,
    Readonly,
    Insert,
    Arena,
}

pub const MODE_MUTABLE: u8 = 0;
pub const MODE_IMMUTABLE: u8 = 1;
pub const MODE_READONLY: u8 = 2;
pub const MODE_INSERT: u8 = 3;
pub const MODE_ARENA: u8 = 4;

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Mutable => "mutable",
            Mode::Immutable => "immutable",
            Mode::Readonly => "readonly",
            Mode::Insert => "insert",
            Mode::Arena => "arena",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Mode::Mutable => MODE_MUTABLE,
            Mode::Immutable => MODE_IMMUTABLE,
            Mode::Readonly => MODE_READONLY,
            Mode::Insert => MODE_INSERT,
            Mode::Arena => MODE_ARENA,
        }
    }

    pub fn from_name(name: &str) -> PyResult<Mode> {
        match name {
            "mutable" => Ok(Mode::Mutable),
            "immutable" => Ok(Mode::Immutable),
            "readonly" => Ok(Mode::Readonly),
            "insert" => Ok(Mode::Insert),
            "arena" => Ok(Mode::Arena),
            other => Err(type_mismatch(format!("unknown mode '{other}'"))),
        }
    }

    /// Inserting a brand-new key.
    #[inline(always)]
    pub fn allows_insert(self) -> bool {
        matches!(self, Mode::Mutable | Mode::Insert | Mode::Arena)
    }

    /// Overwriting the value of an already-present key.
    #[inline(always)]
    pub fn allows_update(self) -> bool {
        matches!(self, Mode::Mutable | Mode::Arena)
    }

    /// Removing entries: `del`, `pop`, `popitem`, `clear`.
    #[inline(always)]
    pub fn allows_remove(self) -> bool {
        matches!(self, Mode::Mutable | Mode::Arena)
    }

    /// Whether a facade in this mode may be used as a dict key / set member.
    #[inline(always)]
    pub fn is_hashable(self) -> bool {
        matches!(self, Mode::Immutable)
    }
}
