//! Process-wide map from USB port path to the handle currently open on it.
//!
//! Entries are weak: the cache never keeps a handle alive. A handle removes its
//! own entry before it releases the device, so a lookup never observes a
//! released handle as live.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::PortPath;
use crate::config::ClaimPolicy;
use crate::{Error, Result};

/// An open device handle that can be forcibly released.
pub(crate) trait Releasable: Send + Sync {
    /// Releases the device; later I/O on the handle fails.
    fn release(&self);

    /// Returns `false` once released.
    fn is_live(&self) -> bool;
}

/// Weak handle map keyed by port path, guarded by one mutex.
#[derive(Debug)]
pub(crate) struct HandleCache<T> {
    /// Port path to the last handle opened there.
    entries: Mutex<BTreeMap<PortPath, Weak<T>>>,
}

impl<T: Releasable> HandleCache<T> {
    /// Creates an empty cache.
    pub(crate) const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Locks the map, ignoring poisoning.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<PortPath, Weak<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a handle on `path` while holding the cache lock.
    ///
    /// A live handle already on `path` is released first under
    /// [`ClaimPolicy::Replace`], or reported as [`Error::DeviceBusy`] under
    /// [`ClaimPolicy::Exclusive`].
    pub(crate) fn claim(
        &self,
        path: &PortPath,
        policy: ClaimPolicy,
        open: impl FnOnce() -> Result<Arc<T>>,
    ) -> Result<Arc<T>> {
        let mut entries = self.lock();
        if let Some(old) = entries.get(path).and_then(Weak::upgrade)
            && old.is_live()
        {
            match policy {
                ClaimPolicy::Exclusive => return Err(Error::DeviceBusy(path.to_string())),
                ClaimPolicy::Replace => {
                    tracing::warn!(%path, "closing stale handle on port");
                    entries.remove(path);
                    old.release();
                }
            }
        }
        entries.remove(path);
        let handle = open()?;
        entries.insert(path.clone(), Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Removes the entry for `path` if it refers to `handle`.
    pub(crate) fn forget(&self, path: &PortPath, handle: &Arc<T>) {
        let mut entries = self.lock();
        if entries
            .get(path)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(handle)))
        {
            entries.remove(path);
        }
    }

    /// Returns the live handle on `path`, if any.
    pub(crate) fn get(&self, path: &PortPath) -> Option<Arc<T>> {
        self.lock()
            .get(path)
            .and_then(Weak::upgrade)
            .filter(|h| h.is_live())
    }

    /// Number of entries whose handle is still live.
    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|h| h.is_live())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct FakeHandle {
        released: AtomicBool,
        id: usize,
    }

    impl Releasable for FakeHandle {
        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn is_live(&self) -> bool {
            !self.released.load(Ordering::SeqCst)
        }
    }

    fn path(s: &str) -> PortPath {
        s.parse().unwrap()
    }

    #[test]
    fn second_open_closes_first() {
        let cache = HandleCache::<FakeHandle>::new();
        let opened = AtomicUsize::new(0);
        let open = || {
            let id = opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeHandle {
                id,
                ..FakeHandle::default()
            }))
        };

        let first = cache.claim(&path("1-4"), ClaimPolicy::Replace, open).unwrap();
        let second = cache
            .claim(&path("1-4"), ClaimPolicy::Replace, || {
                assert!(!first.is_live(), "first handle must be closed before reopening");
                open()
            })
            .unwrap();

        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(cache.live(), 1);
        assert_eq!(cache.get(&path("1-4")).unwrap().id, 1);
    }

    #[test]
    fn exclusive_policy_reports_busy() {
        let cache = HandleCache::<FakeHandle>::new();
        let _held = cache
            .claim(&path("2-1.3"), ClaimPolicy::Exclusive, || {
                Ok(Arc::new(FakeHandle::default()))
            })
            .unwrap();
        let err = cache
            .claim(&path("2-1.3"), ClaimPolicy::Exclusive, || {
                Ok(Arc::new(FakeHandle::default()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::DeviceBusy(p) if p == "2-1.3"));
    }

    #[test]
    fn cache_does_not_own_handles() {
        let cache = HandleCache::<FakeHandle>::new();
        let h = cache
            .claim(&path("1-1"), ClaimPolicy::Replace, || Ok(Arc::new(FakeHandle::default())))
            .unwrap();
        assert_eq!(cache.live(), 1);
        drop(h);
        assert_eq!(cache.live(), 0);
        assert!(cache.get(&path("1-1")).is_none());
    }

    #[test]
    fn forget_only_removes_matching_handle() {
        let cache = HandleCache::<FakeHandle>::new();
        let a = cache
            .claim(&path("3-2"), ClaimPolicy::Replace, || Ok(Arc::new(FakeHandle::default())))
            .unwrap();
        let stranger = Arc::new(FakeHandle::default());
        cache.forget(&path("3-2"), &stranger);
        assert_eq!(cache.live(), 1);
        cache.forget(&path("3-2"), &a);
        assert_eq!(cache.live(), 0);
    }

    #[test]
    fn failed_open_leaves_no_entry() {
        let cache = HandleCache::<FakeHandle>::new();
        let err = cache
            .claim(&path("1-9"), ClaimPolicy::Replace, || {
                Err(Error::DeviceNotFound("gone".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        assert!(cache.get(&path("1-9")).is_none());
    }
}
