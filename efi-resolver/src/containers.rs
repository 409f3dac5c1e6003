//! Containers used by the analyses: interning, work queues, and maps/sets whose iteration order
//! is controlled by the `deterministic_containers` feature.

use std::collections::VecDeque;
use unordered::{UnorderedMap, UnorderedSet};

/// Interns values of type `T`, numbering them densely in order of first insertion
#[derive(Default)]
pub struct InsertionOrderedSet<T: Eq + std::hash::Hash + Ord + Clone> {
    data: Vec<T>,
    revmap: UnorderedMap<T, usize>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> InsertionOrderedSet<T> {
    pub fn new() -> Self {
        Self {
            data: vec![],
            revmap: UnorderedMap::new(),
        }
    }

    /// The interned values; `v[i]` is the value [`Self::insert`] numbered `i`
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// The number of `v`, interning it first if it is new
    pub fn insert(&mut self, v: T) -> usize {
        if let Some(idx) = self.revmap.get(&v) {
            *idx
        } else {
            let idx = self.data.len();
            self.data.push(v.clone());
            self.revmap.insert(v, idx);
            idx
        }
    }

    /// Number of members in the set
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing has been inserted yet
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A first-in first-out queue in which any value is pending at most once at a time.
///
/// Pushing a value that is already pending is a no-op; once a value has been popped it may be
/// pushed again.
pub struct WorkQueue<T: Eq + std::hash::Hash + Ord + Clone> {
    order: VecDeque<T>,
    pending: UnorderedSet<T>,
}

impl<T: Eq + std::hash::Hash + Ord + Clone> WorkQueue<T> {
    /// A new, empty queue
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            pending: UnorderedSet::new(),
        }
    }

    /// Enqueue `v` unless it is already pending. Returns `true` if it was enqueued.
    pub fn push(&mut self, v: T) -> bool {
        if self.pending.insert(v.clone()) {
            self.order.push_back(v);
            true
        } else {
            false
        }
    }

    /// Take the oldest pending value
    pub fn pop(&mut self) -> Option<T> {
        let v = self.order.pop_front()?;
        self.pending.remove(&v);
        Some(v)
    }

    /// Number of pending values
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<T: Eq + std::hash::Hash + Ord + Clone> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps and sets that are only ever used as if unordered. With the `deterministic_containers`
/// feature (on by default) they are backed by B-trees, so that iteration, and therefore logs and
/// output, are reproducible from run to run; without it, by hash tables.
pub mod unordered {
    #[cfg(feature = "deterministic_containers")]
    type BaseMap<K, V> = std::collections::BTreeMap<K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseMap<K, V> = std::collections::HashMap<K, V>;
    #[cfg(feature = "deterministic_containers")]
    pub type UnorderedMapEntry<'a, K, V> = std::collections::btree_map::Entry<'a, K, V>;
    #[cfg(not(feature = "deterministic_containers"))]
    pub type UnorderedMapEntry<'a, K, V> = std::collections::hash_map::Entry<'a, K, V>;
    #[cfg(feature = "deterministic_containers")]
    type BaseSet<T> = std::collections::BTreeSet<T>;
    #[cfg(not(feature = "deterministic_containers"))]
    type BaseSet<T> = std::collections::HashSet<T>;

    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedMap<K: std::hash::Hash + Ord + Eq, V> {
        map: BaseMap<K, V>,
    }

    impl<K: std::hash::Hash + Ord + Eq, V> UnorderedMap<K, V> {
        pub fn new() -> Self {
            Self {
                map: Default::default(),
            }
        }

        pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
        where
            K: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.map.get(k)
        }

        /// Insert, returning the value previously at `k`
        pub fn insert(&mut self, k: K, v: V) -> Option<V> {
            self.map.insert(k, v)
        }

        pub fn entry(&mut self, k: K) -> UnorderedMapEntry<'_, K, V> {
            self.map.entry(k)
        }

        pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
            self.map.iter()
        }

        pub fn values(&self) -> impl Iterator<Item = &V> {
            self.map.values()
        }

        pub fn len(&self) -> usize {
            self.map.len()
        }

        pub fn is_empty(&self) -> bool {
            self.map.is_empty()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> Default for UnorderedMap<K, V> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<K: std::hash::Hash + Ord + Eq, V> FromIterator<(K, V)> for UnorderedMap<K, V> {
        fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
            Self {
                map: iter.into_iter().collect(),
            }
        }
    }

    /// Always printed in key order, whichever backing store is in use
    impl<K, V> std::fmt::Debug for UnorderedMap<K, V>
    where
        K: std::hash::Hash + Ord + Eq + std::fmt::Debug,
        V: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_map()
                .entries(
                    self.map
                        .iter()
                        .collect::<std::collections::BTreeMap<_, _>>(),
                )
                .finish()
        }
    }

    #[derive(Clone, PartialEq, Eq)]
    pub struct UnorderedSet<T: std::hash::Hash + Ord + Eq> {
        set: BaseSet<T>,
    }

    impl<T: std::hash::Hash + Ord + Eq> UnorderedSet<T> {
        pub fn new() -> Self {
            Self {
                set: Default::default(),
            }
        }

        /// Returns `true` if `v` was not already present
        pub fn insert(&mut self, v: T) -> bool {
            self.set.insert(v)
        }

        /// Returns `true` if `v` was present
        pub fn remove<Q: ?Sized>(&mut self, v: &Q) -> bool
        where
            T: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.set.remove(v)
        }

        pub fn contains<Q: ?Sized>(&self, v: &Q) -> bool
        where
            T: std::borrow::Borrow<Q>,
            Q: std::hash::Hash + Ord + Eq,
        {
            self.set.contains(v)
        }

        pub fn len(&self) -> usize {
            self.set.len()
        }

        pub fn is_empty(&self) -> bool {
            self.set.is_empty()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq> Default for UnorderedSet<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T: std::hash::Hash + Ord + Eq + std::fmt::Debug> std::fmt::Debug for UnorderedSet<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_set()
                .entries(self.set.iter().collect::<std::collections::BTreeSet<_>>())
                .finish()
        }
    }
}
