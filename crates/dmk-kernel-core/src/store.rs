//! Local half of the MHT
//!
//! `LocalStore` holds the partitions this domain currently serves and the
//! nonce source used for their locks. It picks the partition from the key's
//! PE bits and otherwise delegates to [`Partition`].
//!
//! Partitions exist only for PEs the domain serves: they are created by
//! [`LocalStore::populate`] at boot and by [`LocalStore::install`] when a
//! migration arrives. Writes to any other PE are `InvalidArgs`.

use std::collections::BTreeMap;

use crate::error::KernelError;
use crate::key::Key;
use crate::partition::{Access, Partition, PartitionImage, StoredItem, TokenSource, Waiter, Wakeup};
use crate::types::{LockToken, PeId};

/// Partitions served by one domain.
pub struct LocalStore {
    partitions: BTreeMap<PeId, Partition>,
    tokens: TokenSource,
}

impl LocalStore {
    /// Empty store with a seeded nonce source.
    pub fn new(seed: u64) -> Self {
        Self {
            partitions: BTreeMap::new(),
            tokens: TokenSource::seeded(seed),
        }
    }

    /// Partition for `pe`, if present.
    pub fn partition(&self, pe: PeId) -> Option<&Partition> {
        self.partitions.get(&pe)
    }

    fn partition_mut(&mut self, pe: PeId) -> Result<&mut Partition, KernelError> {
        self.partitions.get_mut(&pe).ok_or(KernelError::InvalidArgs)
    }

    /// Create empty partitions for `pes`, keeping any that already exist.
    pub fn populate(&mut self, pes: &[PeId]) {
        for &pe in pes {
            self.partitions.entry(pe).or_insert_with(|| Partition::new(pe));
        }
    }

    /// PEs with a partition in this store.
    pub fn pes(&self) -> impl Iterator<Item = PeId> + '_ {
        self.partitions.keys().copied()
    }

    /// Total number of items.
    pub fn len(&self) -> usize {
        self.partitions.values().map(Partition::len).sum()
    }

    /// Whether no partition holds any item.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an item with `key` is stored here.
    pub fn contains(&self, key: Key) -> bool {
        self.partitions
            .get(&key.pe_id())
            .is_some_and(|p| p.item(key).is_some())
    }

    /// See [`Partition::put`].
    pub fn put(&mut self, key: Key, data: Vec<u8>, lock: Option<LockToken>) -> Result<(), KernelError> {
        self.partition_mut(key.pe_id())?.put(key, data, lock)
    }

    /// See [`Partition::put_unlocking`].
    pub fn put_unlocking(&mut self, key: Key, data: Vec<u8>, lock: LockToken) -> Result<Vec<Wakeup>, KernelError> {
        let Self { partitions, tokens } = self;
        partitions
            .get_mut(&key.pe_id())
            .ok_or(KernelError::InvalidArgs)?
            .put_unlocking(key, data, lock, tokens)
    }

    /// See [`Partition::get`].
    pub fn get(&mut self, key: Key, want_lock: bool) -> Access {
        let Self { partitions, tokens } = self;
        match partitions.get_mut(&key.pe_id()) {
            Some(partition) => partition.get(key, want_lock, tokens),
            None => Access::NotFound,
        }
    }

    /// See [`Partition::enqueue`].
    pub fn enqueue(&mut self, key: Key, waiter: Waiter) -> bool {
        self.partitions
            .get_mut(&key.pe_id())
            .is_some_and(|p| p.enqueue(key, waiter))
    }

    /// See [`Partition::lock`].
    pub fn lock(&mut self, key: Key) -> Result<LockToken, KernelError> {
        let Self { partitions, tokens } = self;
        partitions
            .get_mut(&key.pe_id())
            .ok_or(KernelError::NotFound)?
            .lock(key, tokens)
    }

    /// See [`Partition::unlock`].
    pub fn unlock(&mut self, key: Key, token: LockToken) -> Result<Vec<Wakeup>, KernelError> {
        let Self { partitions, tokens } = self;
        match partitions.get_mut(&key.pe_id()) {
            Some(partition) => partition.unlock(key, token, tokens),
            None => Ok(Vec::new()),
        }
    }

    /// See [`Partition::reserve`].
    pub fn reserve(&mut self, key: Key) -> Result<Option<LockToken>, KernelError> {
        let Self { partitions, tokens } = self;
        partitions
            .get_mut(&key.pe_id())
            .ok_or(KernelError::InvalidArgs)?
            .reserve(key, tokens)
    }

    /// See [`Partition::release`].
    pub fn release(&mut self, key: Key, token: LockToken) -> Result<Vec<Wakeup>, KernelError> {
        match self.partitions.get_mut(&key.pe_id()) {
            Some(partition) => partition.release(key, token),
            None => Ok(Vec::new()),
        }
    }

    /// See [`Partition::remove`].
    pub fn remove(&mut self, key: Key) -> Option<StoredItem> {
        self.partitions.get_mut(&key.pe_id())?.remove(key)
    }

    /// Take the partitions of `pes` out of the store for migration.
    ///
    /// Returns their images together with the wake-ups for tasks that were
    /// queued on them. PEs without a partition ship an empty image.
    pub fn take_partitions(&mut self, pes: &[PeId]) -> (Vec<PartitionImage>, Vec<Wakeup>) {
        let mut images = Vec::with_capacity(pes.len());
        let mut wakeups = Vec::new();
        for &pe in pes {
            let mut partition = self.partitions.remove(&pe).unwrap_or_else(|| Partition::new(pe));
            wakeups.extend(partition.drain_waiters());
            images.push(partition.image());
        }
        (images, wakeups)
    }

    /// Install partitions received from another domain.
    ///
    /// Items already present for those PEs are replaced wholesale.
    pub fn install(&mut self, images: Vec<PartitionImage>) -> Result<(), KernelError> {
        let restored = images
            .into_iter()
            .map(Partition::from_image)
            .collect::<Result<Vec<_>, _>>()?;
        for partition in restored {
            self.partitions.insert(partition.pe(), partition);
        }
        Ok(())
    }

    /// Images of the given partitions, leaving the store untouched.
    pub fn images(&self, pes: &[PeId]) -> Vec<PartitionImage> {
        pes.iter()
            .map(|pe| {
                self.partitions
                    .get(pe)
                    .map(Partition::image)
                    .unwrap_or(PartitionImage { pe: *pe, items: Vec::new() })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ItemType;
    use crate::types::OwnerId;

    fn key(pe: u16, obj: u64) -> Key {
        Key::compose(PeId(pe), OwnerId(pe), ItemType::NoType, obj)
    }

    #[test]
    fn test_items_land_in_their_pe_partition() {
        let mut store = LocalStore::new(1);
        store.populate(&[PeId(1), PeId(2)]);
        store.put(key(1, 1), vec![1], None).unwrap();
        store.put(key(2, 1), vec![2], None).unwrap();
        store.put(key(2, 2), vec![3], None).unwrap();

        assert_eq!(store.partition(PeId(1)).unwrap().len(), 1);
        assert_eq!(store.partition(PeId(2)).unwrap().len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_lock_on_unknown_partition_is_not_found() {
        let mut store = LocalStore::new(1);
        assert_eq!(store.lock(key(9, 1)), Err(KernelError::NotFound));
        assert_eq!(store.get(key(9, 1), true), Access::NotFound);
    }

    #[test]
    fn test_writes_to_unserved_pe_are_rejected() {
        let mut store = LocalStore::new(1);
        store.populate(&[PeId(1)]);
        assert_eq!(store.put(key(7, 1), vec![1], None), Err(KernelError::InvalidArgs));
        assert_eq!(store.reserve(key(7, 1)), Err(KernelError::InvalidArgs));
        let token = LockToken::new(5).unwrap();
        assert_eq!(store.put_unlocking(key(7, 1), vec![1], token), Err(KernelError::InvalidArgs));
        assert!(store.partition(PeId(7)).is_none());
        assert_eq!(store.pes().collect::<Vec<_>>(), vec![PeId(1)]);
    }

    #[test]
    fn test_take_and_install_moves_items() {
        let mut source = LocalStore::new(1);
        let mut dest = LocalStore::new(2);
        source.populate(&[PeId(4), PeId(5)]);
        source.put(key(4, 1), vec![4], None).unwrap();
        source.put(key(5, 1), vec![5], None).unwrap();

        let (images, wakeups) = source.take_partitions(&[PeId(4)]);
        assert!(wakeups.is_empty());
        dest.install(images).unwrap();

        assert!(!source.contains(key(4, 1)));
        assert!(dest.contains(key(4, 1)));
        assert!(source.contains(key(5, 1)));
    }
}
