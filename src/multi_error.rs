//! Aggregation of independent failures from best-effort batches.

use std::error::Error as StdError;

use thiserror::Error;

type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

/// Ordered collection of errors gathered from operations that run
/// independently of one another.
///
/// An empty collection represents success. The rendered message joins every
/// collected message with a newline, in insertion order.
#[derive(Debug, Default, Error)]
#[error("{}", self.messages().join("\n"))]
pub struct MultiError {
    errors: Vec<BoxedError>,
}

impl MultiError {
    /// Creates an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Appends an error, preserving insertion order.
    pub fn collect<E>(&mut self, err: E)
    where
        E: Into<BoxedError>,
    {
        self.errors.push(err.into());
    }

    /// Number of collected errors.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` when nothing failed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterates over collected errors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        self.errors.iter().map(AsRef::as_ref)
    }

    /// Rendered message of each collected error.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    /// Converts the collection into `Ok(())` when empty.
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one error was collected.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl<E> FromIterator<E> for MultiError
where
    E: Into<BoxedError>,
{
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        let mut errors = Self::new();
        for err in iter {
            errors.collect(err);
        }
        errors
    }
}
