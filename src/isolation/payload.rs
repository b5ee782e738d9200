//! Module bytes crossing the execution boundary.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Wasm bytes handed to the execution context.
///
/// `Shared` bytes cross the boundary by reference; `Owned` bytes are moved.
/// Either way the far side observes exactly the bytes the caller supplied.
#[derive(Clone, PartialEq, Eq)]
pub enum ModuleBytes {
    Shared(Arc<[u8]>),
    Owned(Vec<u8>),
}

impl ModuleBytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ModuleBytes::Shared(bytes) => bytes,
            ModuleBytes::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ModuleBytes::Shared(_))
    }
}

impl Deref for ModuleBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ModuleBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ModuleBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_shared() { "Shared" } else { "Owned" };
        write!(f, "ModuleBytes::{kind}({} bytes)", self.len())
    }
}

impl From<Vec<u8>> for ModuleBytes {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleBytes::Owned(bytes)
    }
}

impl From<Arc<[u8]>> for ModuleBytes {
    fn from(bytes: Arc<[u8]>) -> Self {
        ModuleBytes::Shared(bytes)
    }
}

impl From<&[u8]> for ModuleBytes {
    fn from(bytes: &[u8]) -> Self {
        ModuleBytes::Owned(bytes.to_vec())
    }
}
