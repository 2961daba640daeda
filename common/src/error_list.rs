// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregate errors for "attempt everything, report at the end" operations
//!
//! Segments on a host, and hosts in a cluster, are independent of one
//! another: one failing must not stop the others from making progress. Code
//! that loops over such items collects failures into an [`ErrorList`], where
//! every entry keeps the identity (path, segment, host) of the item that
//! failed.

use display_error_chain::DisplayErrorChain;
use std::fmt;

/// One failed item: a label identifying it, and the reason it failed.
#[derive(Debug)]
pub struct LabeledError<E> {
    label: String,
    error: E,
}

impl<E> LabeledError<E> {
    pub fn new(label: impl Into<String>, error: E) -> Self {
        Self { label: label.into(), error }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn error(&self) -> &E {
        &self.error
    }
}

/// An ordered list of labeled failures.
///
/// The `Display` implementation lists every entry, including each entry's
/// full source chain, so `source()` deliberately returns `None`: there is no
/// single cause. Use [`ErrorList::any`] to check for a particular cause.
#[derive(Debug)]
pub struct ErrorList<E> {
    errors: Vec<LabeledError<E>>,
}

impl<E> Default for ErrorList<E> {
    fn default() -> Self {
        Self { errors: Vec::new() }
    }
}

impl<E> ErrorList<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, error: E) {
        self.errors.push(LabeledError::new(label, error));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LabeledError<E>> {
        self.errors.iter()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.label())
    }

    /// Returns true if any entry satisfies `pred`.
    pub fn any(&self, pred: impl Fn(&E) -> bool) -> bool {
        self.errors.iter().any(|e| pred(&e.error))
    }

    /// Returns true if every entry satisfies `pred` (and the list is not
    /// empty).
    pub fn all(&self, pred: impl Fn(&E) -> bool) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(|e| pred(&e.error))
    }

    /// `Ok(())` if nothing failed, otherwise the list itself.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E> IntoIterator for ErrorList<E> {
    type Item = LabeledError<E>;
    type IntoIter = std::vec::IntoIter<LabeledError<E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<E> FromIterator<LabeledError<E>> for ErrorList<E> {
    fn from_iter<I: IntoIterator<Item = LabeledError<E>>>(iter: I) -> Self {
        Self { errors: iter.into_iter().collect() }
    }
}

impl<E: std::error::Error> fmt::Display for ErrorList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => {
                let e = &self.errors[0];
                write!(f, "{}: {}", e.label, DisplayErrorChain::new(&e.error))
            }
            n => {
                write!(f, "{n} errors: ")?;
                for (i, e) in self.errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(
                        f,
                        "{}: {}",
                        e.label,
                        DisplayErrorChain::new(&e.error)
                    )?;
                }
                Ok(())
            }
        }
    }
}

impl<E: std::error::Error> std::error::Error for ErrorList<E> {}
