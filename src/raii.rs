//! RAII wrappers tying kernel object lifetimes to Rust scopes, so error
//! paths that `?`-out early still release what they acquired.

extern crate alloc;

use alloc::sync::Arc;

use crate::ipc::Endpoint;
use crate::process::{Did, DescriptorTable};

/// Closes an endpoint when dropped, unless [`disarm`](Self::disarm) was
/// called first. Useful on a function's early-return paths where an
/// endpoint was created for internal use and must not outlive the call.
pub struct ChannelGuard {
    endpoint: Option<Arc<Endpoint>>,
}

impl ChannelGuard {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint: Some(endpoint) }
    }

    /// Release ownership without closing the endpoint.
    pub fn disarm(mut self) -> Arc<Endpoint> {
        self.endpoint.take().expect("endpoint guard used after disarm")
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            let _ = endpoint.close();
        }
    }
}

/// Uninstalls a descriptor when dropped, unless disarmed. Used while
/// assembling a multi-descriptor operation (spec.md §4.6's transfer
/// protocol) so a failure partway through doesn't leak the descriptors
/// already installed.
pub struct DescriptorGuard<'a> {
    table: &'a DescriptorTable,
    did: Option<Did>,
}

impl<'a> DescriptorGuard<'a> {
    pub fn new(table: &'a DescriptorTable, did: Did) -> Self {
        Self { table, did: Some(did) }
    }

    pub fn disarm(mut self) -> Did {
        self.did.take().expect("descriptor guard used after disarm")
    }
}

impl Drop for DescriptorGuard<'_> {
    fn drop(&mut self) {
        if let Some(did) = self.did.take() {
            let _ = self.table.uninstall(did);
        }
    }
}

/// Runs an arbitrary closure on drop, unless disarmed. The general-purpose
/// escape hatch for cleanup that doesn't warrant its own named guard.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self { cleanup: Some(cleanup) }
    }

    pub fn disarm(mut self) {
        self.cleanup.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scope_guard_runs_cleanup_on_drop() {
        let ran = AtomicUsize::new(0);
        {
            let _guard = ScopeGuard::new(|| {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn scope_guard_disarmed_does_not_run_cleanup() {
        let ran = AtomicUsize::new(0);
        {
            let guard = ScopeGuard::new(|| {
                ran.fetch_add(1, Ordering::Relaxed);
            });
            guard.disarm();
        }
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn channel_guard_closes_the_endpoint_on_drop() {
        let (a, b) = crate::ipc::new_pair();
        {
            let _guard = ChannelGuard::new(a);
        }
        assert!(b.is_closed_for_receive());
    }

    #[test]
    fn descriptor_guard_uninstalls_on_drop() {
        use crate::process::descriptor::DescriptorObject;
        use crate::error::KernelResult;

        struct Dummy;
        impl DescriptorObject for Dummy {
            fn retain(&self) {}
            fn release(&self) -> KernelResult<()> {
                Ok(())
            }
        }

        let table = DescriptorTable::new();
        let did = table.install(Arc::new(Dummy));
        {
            let _guard = DescriptorGuard::new(&table, did);
        }
        assert!(table.lookup(did, false).is_err());
    }
}
