//! Ordered collections of child entities keyed by stable identity.
//!
//! Position is the index in the backing vector, so positions are always a dense
//! zero-based permutation of the members. Every operation that changes order
//! completes inside one call; callers never observe an entity in two parents or
//! in none.

use std::{collections::HashMap, fmt::Debug, hash::Hash};

use shared::{
    domain::{BoardId, CardId, ListId},
    protocol::{Board, Card, List},
};

/// An entity that lives in exactly one ordered parent collection.
pub trait Entity: Clone {
    type Key: Copy + Eq + Hash + Debug;
    type Parent: Copy + Eq + Hash + Debug;

    fn key(&self) -> Self::Key;
    fn parent(&self) -> Self::Parent;
    fn set_parent(&mut self, parent: Self::Parent);
}

impl Entity for Board {
    type Key = BoardId;
    type Parent = ();

    fn key(&self) -> BoardId {
        self.id
    }

    fn parent(&self) {}

    fn set_parent(&mut self, _parent: ()) {}
}

impl Entity for List {
    type Key = ListId;
    type Parent = BoardId;

    fn key(&self) -> ListId {
        self.id
    }

    fn parent(&self) -> BoardId {
        self.board_id
    }

    fn set_parent(&mut self, parent: BoardId) {
        self.board_id = parent;
    }
}

impl Entity for Card {
    type Key = CardId;
    type Parent = ListId;

    fn key(&self) -> CardId {
        self.id
    }

    fn parent(&self) -> ListId {
        self.list_id
    }

    fn set_parent(&mut self, parent: ListId) {
        self.list_id = parent;
    }
}

/// A position inside a specific parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<P> {
    pub parent: P,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion<P> {
    Inserted(Slot<P>),
    /// The id is already a member somewhere; nothing changed.
    AlreadyPresent(Slot<P>),
    UnknownParent(P),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation<P> {
    Moved { from: Slot<P>, to: Slot<P> },
    Unchanged(Slot<P>),
    /// The entity is not a member of the named source. Benign when a
    /// concurrent deletion raced the gesture.
    Stale,
    UnknownParent(P),
}

impl<P> Relocation<P> {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }
}

/// One parent's ordered children.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedCollection<T> {
    items: Vec<T>,
}

impl<T> Default for OrderedCollection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Entity> OrderedCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from items already in display order, dropping
    /// repeated ids (first occurrence wins).
    pub fn from_ordered(items: impl IntoIterator<Item = T>) -> Self {
        let mut collection = Self::new();
        for item in items {
            if !collection.contains(item.key()) {
                collection.items.push(item);
            }
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn ids(&self) -> Vec<T::Key> {
        self.items.iter().map(Entity::key).collect()
    }

    pub fn position(&self, key: T::Key) -> Option<usize> {
        self.items.iter().position(|item| item.key() == key)
    }

    pub fn contains(&self, key: T::Key) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: T::Key) -> Option<&T> {
        self.items.iter().find(|item| item.key() == key)
    }

    pub fn get_mut(&mut self, key: T::Key) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.key() == key)
    }

    /// Inserts at `index` clamped to `[0, len]`. Returns the final index, or
    /// `Err` with the existing index when the id is already present.
    pub fn insert_at(&mut self, item: T, index: usize) -> Result<usize, usize> {
        if let Some(existing) = self.position(item.key()) {
            return Err(existing);
        }
        let index = index.min(self.items.len());
        self.items.insert(index, item);
        Ok(index)
    }

    pub fn remove(&mut self, key: T::Key) -> Option<(usize, T)> {
        let index = self.position(key)?;
        Some((index, self.items.remove(index)))
    }

    /// Moves a member to `new_index`, clamped against the collection without
    /// the moved member. `None` when the id is not a member.
    pub fn move_within(&mut self, key: T::Key, new_index: usize) -> Option<(usize, usize)> {
        let from = self.position(key)?;
        let to = new_index.min(self.items.len() - 1);
        if from != to {
            let item = self.items.remove(from);
            self.items.insert(to, item);
        }
        Some((from, to))
    }

    /// Rearranges members so the ids in `order` come first, in that order.
    /// Unknown ids are skipped; members not named keep their relative order.
    pub fn reorder(&mut self, order: &[T::Key]) {
        let mut rest = std::mem::take(&mut self.items);
        for key in order {
            if let Some(index) = rest.iter().position(|item| item.key() == *key) {
                self.items.push(rest.remove(index));
            }
        }
        self.items.append(&mut rest);
    }
}

/// Ordered collections for many parents of the same kind, with a reverse
/// index guaranteeing each child belongs to exactly one parent.
#[derive(Debug, Clone)]
pub struct CollectionSet<T: Entity> {
    collections: HashMap<T::Parent, OrderedCollection<T>>,
    owners: HashMap<T::Key, T::Parent>,
}

impl<T: Entity> Default for CollectionSet<T> {
    fn default() -> Self {
        Self {
            collections: HashMap::new(),
            owners: HashMap::new(),
        }
    }
}

impl<T: Entity> CollectionSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, parent: T::Parent) -> bool {
        self.collections.contains_key(&parent)
    }

    pub fn get(&self, parent: T::Parent) -> Option<&OrderedCollection<T>> {
        self.collections.get(&parent)
    }

    pub fn parent_of(&self, key: T::Key) -> Option<T::Parent> {
        self.owners.get(&key).copied()
    }

    pub fn slot_of(&self, key: T::Key) -> Option<Slot<T::Parent>> {
        let parent = self.parent_of(key)?;
        let index = self.collections.get(&parent)?.position(key)?;
        Some(Slot { parent, index })
    }

    pub fn find(&self, key: T::Key) -> Option<&T> {
        let parent = self.parent_of(key)?;
        self.collections.get(&parent)?.get(key)
    }

    pub fn find_mut(&mut self, key: T::Key) -> Option<&mut T> {
        let parent = self.parent_of(key)?;
        self.collections.get_mut(&parent)?.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Registers an empty collection for `parent` if none is loaded.
    pub fn ensure_parent(&mut self, parent: T::Parent) {
        self.collections.entry(parent).or_default();
    }

    /// Drops a parent and every child it owned.
    pub fn drop_parent(&mut self, parent: T::Parent) -> Option<OrderedCollection<T>> {
        let removed = self.collections.remove(&parent)?;
        for item in removed.iter() {
            self.owners.remove(&item.key());
        }
        Some(removed)
    }

    /// Replaces one parent's children wholesale. Children that were owned by a
    /// different parent are taken out of it first so ownership stays unique.
    pub fn replace_parent(&mut self, parent: T::Parent, items: impl IntoIterator<Item = T>) {
        self.drop_parent(parent);
        let mut fresh = OrderedCollection::new();
        for mut item in items {
            let key = item.key();
            if fresh.contains(key) {
                continue;
            }
            if let Some(previous) = self.owners.get(&key).copied() {
                if let Some(collection) = self.collections.get_mut(&previous) {
                    collection.remove(key);
                }
            }
            item.set_parent(parent);
            self.owners.insert(key, parent);
            fresh.items.push(item);
        }
        self.collections.insert(parent, fresh);
    }

    pub fn insert_at(&mut self, parent: T::Parent, mut item: T, index: usize) -> Insertion<T::Parent> {
        let key = item.key();
        if let Some(slot) = self.slot_of(key) {
            return Insertion::AlreadyPresent(slot);
        }
        let Some(collection) = self.collections.get_mut(&parent) else {
            return Insertion::UnknownParent(parent);
        };
        item.set_parent(parent);
        match collection.insert_at(item, index) {
            Ok(index) | Err(index) => {
                self.owners.insert(key, parent);
                Insertion::Inserted(Slot { parent, index })
            }
        }
    }

    pub fn remove_from(&mut self, parent: T::Parent, key: T::Key) -> Option<(usize, T)> {
        if self.owners.get(&key) != Some(&parent) {
            return None;
        }
        let removed = self.collections.get_mut(&parent)?.remove(key)?;
        self.owners.remove(&key);
        Some(removed)
    }

    /// Removes an entity from whichever parent owns it.
    pub fn remove(&mut self, key: T::Key) -> Option<(Slot<T::Parent>, T)> {
        let parent = self.parent_of(key)?;
        let (index, item) = self.remove_from(parent, key)?;
        Some((Slot { parent, index }, item))
    }

    pub fn move_within(&mut self, parent: T::Parent, key: T::Key, new_index: usize) -> Relocation<T::Parent> {
        if self.owners.get(&key) != Some(&parent) {
            return Relocation::Stale;
        }
        let Some(collection) = self.collections.get_mut(&parent) else {
            return Relocation::UnknownParent(parent);
        };
        match collection.move_within(key, new_index) {
            Some((from, to)) if from == to => Relocation::Unchanged(Slot { parent, index: to }),
            Some((from, to)) => Relocation::Moved {
                from: Slot { parent, index: from },
                to: Slot { parent, index: to },
            },
            None => Relocation::Stale,
        }
    }

    /// Transfers ownership of `key` from `source` to `target` at `new_index`.
    /// Checks every precondition before touching either collection.
    pub fn move_across(
        &mut self,
        source: T::Parent,
        target: T::Parent,
        key: T::Key,
        new_index: usize,
    ) -> Relocation<T::Parent> {
        if source == target {
            return self.move_within(source, key, new_index);
        }
        if self.owners.get(&key) != Some(&source) {
            return Relocation::Stale;
        }
        if !self.collections.contains_key(&target) {
            return Relocation::UnknownParent(target);
        }
        let Some((from, mut item)) = self
            .collections
            .get_mut(&source)
            .and_then(|collection| collection.remove(key))
        else {
            return Relocation::Stale;
        };
        item.set_parent(target);
        let to = match self
            .collections
            .entry(target)
            .or_default()
            .insert_at(item, new_index)
        {
            Ok(index) | Err(index) => index,
        };
        self.owners.insert(key, target);
        Relocation::Moved {
            from: Slot {
                parent: source,
                index: from,
            },
            to: Slot {
                parent: target,
                index: to,
            },
        }
    }

    /// Checks the ownership index against the collections. Used by tests and
    /// debug assertions.
    pub fn is_consistent(&self) -> bool {
        let mut seen = 0;
        for (parent, collection) in &self.collections {
            for item in collection.iter() {
                seen += 1;
                if self.owners.get(&item.key()) != Some(parent) || item.parent() != *parent {
                    return false;
                }
            }
        }
        seen == self.owners.len()
    }
}

#[cfg(test)]
#[path = "tests/collection_tests.rs"]
mod tests;
