//! Cache item value object.

use serde::{Deserialize, Serialize};

use crate::characteristics::Characteristics;

/// One cached value together with the identity it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItem<T> {
    name: String,
    characteristics: Characteristics,
    data: T,
}

impl<T> CacheItem<T> {
    pub fn new(name: impl Into<String>, characteristics: Characteristics, data: T) -> Self {
        Self {
            name: name.into(),
            characteristics,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn characteristics(&self) -> &Characteristics {
        &self.characteristics
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// Consumes the item and returns its payload.
    pub fn into_data(self) -> T {
        self.data
    }

    /// Exact identity match on the characteristic set.
    pub fn matches_characteristics(&self, characteristics: &Characteristics) -> bool {
        &self.characteristics == characteristics
    }

    /// Subset match: `true` if the item carries every needle pair.
    pub fn contains_characteristics(&self, needles: &Characteristics) -> bool {
        self.characteristics.contains_all(needles)
    }
}
