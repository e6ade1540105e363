//! Ordered release of acquired resources
//!
//! A `Closer` collects resources as they are acquired and releases them in
//! reverse order. When a release fails while another error is already being
//! propagated, the release failure is attached to that error instead of
//! replacing it.

use blockio_common::{Error, Result};
use blockio_storage::LocalFileBlockReader;
use std::sync::Arc;
use tracing::warn;

/// A resource that must be released explicitly
pub trait Closeable: Send + Sync {
    /// Release the resource
    ///
    /// Implementations must be idempotent.
    fn close(&self) -> Result<()>;
}

impl Closeable for LocalFileBlockReader {
    fn close(&self) -> Result<()> {
        Self::close(self)
    }
}

/// Resources to release, in acquisition order
#[derive(Default)]
pub struct Closer {
    resources: Vec<Arc<dyn Closeable>>,
}

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource for release
    pub fn register(&mut self, resource: Arc<dyn Closeable>) {
        self.resources.push(resource);
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Release every resource, most recently registered first
    fn release_all(&mut self) -> Vec<Error> {
        let mut failures = Vec::new();
        while let Some(resource) = self.resources.pop() {
            if let Err(e) = resource.close() {
                failures.push(e);
            }
        }
        failures
    }

    /// Release every resource
    ///
    /// All resources are attempted. The first failure is returned with any
    /// later failures attached.
    pub fn close(&mut self) -> Result<()> {
        let mut failures = self.release_all().into_iter();
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(first.with_suppressed(failures.collect())),
        }
    }

    /// Release every resource on behalf of a failure
    ///
    /// Returns `err` unchanged apart from any release failures attached to
    /// it.
    #[must_use]
    pub fn rethrow(&mut self, err: Error) -> Error {
        err.with_suppressed(self.release_all())
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        if self.resources.is_empty() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to release resources on drop");
        }
    }
}
