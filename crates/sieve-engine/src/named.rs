//! [`NamedMap`]: an insertion-ordered map of values keyed by their own
//! names. Backs the command, extension, and match-capability
//! registries, where registration order assigns stable codes.

/// A [`Named`] type has a name and can live in a [`NamedMap`].
pub trait Named {
    /// The value's name. Must be pure and stable.
    fn name(&self) -> &str;
}

impl<T: Named + ?Sized> Named for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// An insertion-ordered mapping of named values.
#[derive(Clone, Debug)]
pub struct NamedMap<V> {
    map: indexmap::IndexSet<ByName<V>, fnv::FnvBuildHasher>,
}

impl<V> NamedMap<V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            map: indexmap::IndexSet::default(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.map.iter().map(|x| &x.0)
    }
}

/// An entry with this name already exists.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("an entry with that name already exists")]
pub struct AlreadyExists;

impl<V: Named> NamedMap<V> {
    /// Inserts a value, erroring if its name is taken.
    pub fn insert(&mut self, val: V) -> Result<(), AlreadyExists> {
        if self.map.insert(ByName(val)) {
            Ok(())
        } else {
            Err(AlreadyExists)
        }
    }

    /// Inserts a value, replacing any entry with the same name.
    pub fn replace(&mut self, val: V) {
        self.map.replace(ByName(val));
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&V> {
        self.map.get(name.as_ref()).map(|x| &x.0)
    }

    /// True when an entry with this name exists.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.map.contains(name.as_ref())
    }
}

impl<V> Default for NamedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug)]
struct ByName<V>(V);

impl<V: Named> PartialEq for ByName<V> {
    fn eq(&self, other: &Self) -> bool {
        self.0.name() == other.0.name()
    }
}
impl<V: Named> Eq for ByName<V> {}

impl<V: Named> core::hash::Hash for ByName<V> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.0.name().hash(state);
    }
}

impl<V: Named> core::borrow::Borrow<str> for ByName<V> {
    fn borrow(&self) -> &str {
        self.0.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry(&'static str);
    impl Named for Entry {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn insertion_order_and_lookup() {
        let mut map = NamedMap::new();
        map.insert(Entry("b")).unwrap();
        map.insert(Entry("a")).unwrap();
        assert!(map.insert(Entry("b")).is_err());
        assert_eq!(map.len(), 2);
        assert!(map.get("b").is_some());
        assert!(!map.contains("c"));
    }
}
