//! Identity and ordering of schedulable requests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Global request ID counter
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Root requests draw their last key component from here.
static ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        RequestId(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Priority class a request is created with.
///
/// The class is only the leading component of the full [`RequestKey`]; the
/// creation order and the parent's key decide the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Realtime = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    fn component(self) -> u64 {
        self as u64
    }
}

/// Hierarchical scheduling key; smaller runs first.
///
/// Root requests get `[class, n]` with `n` strictly increasing. A request
/// created while another one executes gets `parent ++ [class, k]` where `k`
/// counts that parent's children, so a child sorts right after its parent
/// and before any later-created unrelated root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey(Arc<[u64]>);

impl RequestKey {
    pub(crate) fn root(class: Priority) -> Self {
        let n = ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
        RequestKey(Arc::from(vec![class.component(), n]))
    }

    pub(crate) fn child(&self, class: Priority, nth_child: u64) -> Self {
        let mut components = Vec::with_capacity(self.0.len() + 2);
        components.extend_from_slice(&self.0);
        components.push(class.component());
        components.push(nth_child);
        RequestKey(Arc::from(components))
    }

    /// Sorts after every real key; used for waiters with no request context.
    pub(crate) fn lowest() -> Self {
        RequestKey(Arc::from(vec![u64::MAX]))
    }

    pub fn depth(&self) -> usize {
        self.0.len() / 2
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}
