//! Failure-category sets used by the "apply on / retry on / fail on" and
//! "skip on / abort on" parameters of each policy.
//!
//! Matching is "is-instance-of any member". Rust has no class hierarchy, so a member is an
//! [`ErrorClass`]: a named predicate over the wrapped error. [`ErrorClass::of`] matches one
//! concrete type, [`ErrorClass::any`] matches everything, [`ErrorClass::fault_tolerance`]
//! matches every failure produced by the policies themselves, and [`ErrorClass::custom`]
//! lets callers model their own families (e.g. all `io::Error`s of a kind).

use crate::error::{BulkheadRejectedError, CircuitBreakerOpenError, Failure, TimeoutError};
use std::fmt;
use std::sync::Arc;

type Matcher = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;

/// A category of failures.
#[derive(Clone)]
pub struct ErrorClass {
    name: &'static str,
    matches: Matcher,
}

impl ErrorClass {
    /// Matches failures wrapping an `E`.
    pub fn of<E>() -> Self
    where
        E: std::error::Error + 'static,
    {
        Self { name: std::any::type_name::<E>(), matches: Arc::new(|f: &Failure| f.is::<E>()) }
    }

    /// Matches every failure.
    pub fn any() -> Self {
        Self { name: "*", matches: Arc::new(|_: &Failure| true) }
    }

    /// Matches timeout, open-circuit and bulkhead-rejection failures.
    pub fn fault_tolerance() -> Self {
        Self {
            name: "fault-tolerance",
            matches: Arc::new(|f: &Failure| {
                f.is::<TimeoutError>()
                    || f.is::<CircuitBreakerOpenError>()
                    || f.is::<BulkheadRejectedError>()
            }),
        }
    }

    /// A named category with an arbitrary predicate.
    pub fn custom<F>(name: &'static str, predicate: F) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        Self { name, matches: Arc::new(predicate) }
    }

    /// Category name, used in logs and debug output.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `true` if `failure` belongs to this category.
    pub fn matches(&self, failure: &Failure) -> bool {
        (self.matches)(failure)
    }
}

impl fmt::Debug for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// An immutable set of failure categories.
#[derive(Clone)]
pub struct ThrowableSet {
    classes: Arc<[ErrorClass]>,
}

impl ThrowableSet {
    /// The empty set; includes nothing.
    pub fn empty() -> Self {
        Self { classes: Arc::from(Vec::new()) }
    }

    /// Set including every failure.
    pub fn all() -> Self {
        Self::from_classes([ErrorClass::any()])
    }

    /// Set with a single concrete error type.
    pub fn of<E>() -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::from_classes([ErrorClass::of::<E>()])
    }

    /// Set built from explicit categories.
    pub fn from_classes(classes: impl IntoIterator<Item = ErrorClass>) -> Self {
        Self { classes: classes.into_iter().collect::<Vec<_>>().into() }
    }

    /// Copy of this set with `E` added.
    pub fn with<E>(self) -> Self
    where
        E: std::error::Error + 'static,
    {
        self.with_class(ErrorClass::of::<E>())
    }

    /// Copy of this set with `class` added.
    pub fn with_class(self, class: ErrorClass) -> Self {
        let mut classes = self.classes.to_vec();
        classes.push(class);
        Self { classes: classes.into() }
    }

    /// `true` if no category is present.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// `true` if `failure` is an instance of any member.
    pub fn includes(&self, failure: &Failure) -> bool {
        self.classes.iter().any(|class| class.matches(failure))
    }
}

impl Default for ThrowableSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ThrowableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.classes.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("other")]
    struct Other;

    fn io_failure() -> Failure {
        Failure::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[test]
    fn empty_set_includes_nothing() {
        assert!(!ThrowableSet::empty().includes(&io_failure()));
        assert!(ThrowableSet::empty().is_empty());
    }

    #[test]
    fn all_includes_everything() {
        assert!(ThrowableSet::all().includes(&io_failure()));
        assert!(ThrowableSet::all().includes(&Failure::new(Other)));
    }

    #[test]
    fn typed_membership() {
        let set = ThrowableSet::of::<io::Error>();
        assert!(set.includes(&io_failure()));
        assert!(!set.includes(&Failure::new(Other)));
        let set = set.with::<Other>();
        assert!(set.includes(&Failure::new(Other)));
    }

    #[test]
    fn fault_tolerance_family() {
        let set = ThrowableSet::from_classes([ErrorClass::fault_tolerance()]);
        let timeout = Failure::new(TimeoutError { name: "t".into(), timeout: Duration::from_secs(1) });
        assert!(set.includes(&timeout));
        assert!(!set.includes(&io_failure()));
    }

    #[test]
    fn custom_predicate() {
        let resets = ErrorClass::custom("connection-reset", |f| {
            f.downcast_ref::<io::Error>().map_or(false, |e| e.kind() == io::ErrorKind::ConnectionReset)
        });
        let set = ThrowableSet::from_classes([resets]);
        assert!(set.includes(&io_failure()));
        assert!(!set.includes(&Failure::new(io::Error::new(io::ErrorKind::NotFound, "x"))));
    }
}
