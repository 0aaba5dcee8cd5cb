//! Persistence contract for reduction outputs.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};

use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DataError;
use crate::tag::with_fresh_tags;
use crate::value::Value;

/// A result type that can be written to and read back from disk.
///
/// The default encoding is CBOR. Types with a native file format can override
/// both methods, as long as `load` accepts what `save` produced.
pub trait Data: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn save(&self, path: &Utf8Path) -> Result<(), DataError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(path)?;
        ciborium::into_writer(self, BufWriter::new(file))?;
        Ok(())
    }

    /// Tags inside the file get fresh identities, consistent across it.
    fn load(path: &Utf8Path) -> Result<Self, DataError> {
        let file = fs::File::open(path)?;
        Ok(with_fresh_tags(|| ciborium::from_reader(BufReader::new(file)))?)
    }
}

impl Data for () {}
impl Data for bool {}
impl Data for i64 {}
impl Data for u64 {}
impl Data for f64 {}
impl Data for String {}
impl Data for Value {}
impl<T: Data> Data for Vec<T> {}
impl<T: Data> Data for Option<T> {}
impl<T: Data> Data for BTreeMap<String, T> {}
