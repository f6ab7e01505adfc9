use std::ops::Deref;
use std::ops::DerefMut;

use crate::error::Result;
use crate::io::ReadData;
use crate::io::Reader;

/// A linear array of fixed-size records decoded back-to-back from a byte
/// slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table<T>(pub Vec<T>);

impl<T> Table<T> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }
}

impl<T: ReadData> Table<T> {
    pub fn new_linear(data_ptr: &mut impl Reader, items_count: usize) -> Result<Self> {
        let mut items = Self::with_capacity(items_count);
        for _ in 0..items_count {
            items.push(data_ptr.read()?);
        }
        Ok(items)
    }
}

impl<T> Deref for Table<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Table<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
