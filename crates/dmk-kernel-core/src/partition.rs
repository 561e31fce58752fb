//! Partitions of the MHT
//!
//! A partition owns every stored item whose key maps to one PE id. Items can
//! be locked by one holder at a time; callers that find an item locked queue
//! on the item and are served in arrival order when it is unlocked.
//!
//! Partitions never suspend. Operations that need to wait report it
//! (`Access::Locked`) and operations that free an item return the
//! [`Wakeup`]s the runtime has to deliver.

use std::collections::{BTreeMap, VecDeque};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::key::Key;
use crate::types::{LockToken, PeId, WaitToken};

/// Source of lock nonces.
pub struct TokenSource {
    rng: ChaCha8Rng,
}

impl TokenSource {
    /// Deterministic source for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Next non-zero nonce.
    pub fn next_token(&mut self) -> LockToken {
        loop {
            if let Some(token) = LockToken::new(self.rng.next_u32()) {
                return token;
            }
        }
    }
}

/// A task queued on a locked item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Waiter {
    /// Token the task is parked on
    pub token: WaitToken,
    /// Whether the task wants the lock once the item is free
    pub want_lock: bool,
}

/// Copy of an item handed to a caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Item key
    pub key: Key,
    /// Payload
    pub data: Vec<u8>,
    /// Lock acquired by this access, if one was requested
    pub lock: Option<LockToken>,
}

/// Result of a non-blocking lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// Item was available
    Found(Item),
    /// No item with this key
    NotFound,
    /// Item is locked; enqueue and wait
    Locked,
}

/// Why a queued task is being resumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Woken {
    /// The item became available (with the lock, if it was requested)
    Served(Item),
    /// The item was removed while the task waited
    NotFound,
    /// The partition left this domain; re-route the request
    Migrated,
}

/// A resumption the runtime must deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Wakeup {
    /// Token of the parked task
    pub token: WaitToken,
    /// Outcome to hand to it
    pub outcome: Woken,
}

/// One stored record.
#[derive(Debug)]
pub struct StoredItem {
    key: Key,
    data: Vec<u8>,
    lock: Option<LockToken>,
    reservation: bool,
    waiters: VecDeque<Waiter>,
}

impl StoredItem {
    fn new(key: Key, data: Vec<u8>) -> Self {
        Self {
            key,
            data,
            lock: None,
            reservation: false,
            waiters: VecDeque::new(),
        }
    }

    /// Item key.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether a holder currently owns the lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Whether this is an unfilled reservation placeholder.
    pub fn is_reservation(&self) -> bool {
        self.reservation
    }

    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    fn snapshot(&self, lock: Option<LockToken>) -> Item {
        Item {
            key: self.key,
            data: self.data.clone(),
            lock,
        }
    }

    /// Serve queued waiters after the lock was dropped.
    ///
    /// Leading readers get a snapshot; the first locking waiter receives
    /// the lock and ends the hand-off, everyone behind it keeps waiting.
    fn hand_off(&mut self, tokens: &mut TokenSource) -> Vec<Wakeup> {
        let mut woken = Vec::new();
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.want_lock {
                let token = tokens.next_token();
                self.lock = Some(token);
                woken.push(Wakeup {
                    token: waiter.token,
                    outcome: Woken::Served(self.snapshot(Some(token))),
                });
                break;
            }
            woken.push(Wakeup {
                token: waiter.token,
                outcome: Woken::Served(self.snapshot(None)),
            });
        }
        woken
    }

    /// Dismiss every waiter with the given outcome.
    pub fn dismiss_waiters(&mut self, outcome: Woken) -> Vec<Wakeup> {
        self.waiters
            .drain(..)
            .map(|waiter| Wakeup {
                token: waiter.token,
                outcome: outcome.clone(),
            })
            .collect()
    }
}

/// Serialized form of a stored item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemImage {
    /// Item key
    pub key: Key,
    /// Payload
    pub data: Vec<u8>,
    /// Live lock, carried so the holder can still unlock at the new owner
    pub lock: Option<LockToken>,
    /// Reservation placeholder flag
    pub reservation: bool,
}

/// Serialized form of a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionImage {
    /// PE the partition belongs to
    pub pe: PeId,
    /// Items in key order
    pub items: Vec<ItemImage>,
}

/// All items of one PE id.
#[derive(Debug)]
pub struct Partition {
    pe: PeId,
    items: BTreeMap<Key, StoredItem>,
}

impl Partition {
    /// Empty partition for `pe`.
    pub fn new(pe: PeId) -> Self {
        Self {
            pe,
            items: BTreeMap::new(),
        }
    }

    /// PE id served by this partition.
    pub fn pe(&self) -> PeId {
        self.pe
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the partition holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Borrow a stored item.
    pub fn item(&self, key: Key) -> Option<&StoredItem> {
        self.items.get(&key)
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.items.keys().copied()
    }

    fn check_key(&self, key: Key) -> Result<(), KernelError> {
        if key.pe_id() == self.pe {
            Ok(())
        } else {
            Err(KernelError::InvalidArgs)
        }
    }

    /// Insert or replace an item.
    ///
    /// A locked item is only replaced when `lock` matches its holder; the
    /// lock stays held. Filling a reservation clears the placeholder flag.
    pub fn put(&mut self, key: Key, data: Vec<u8>, lock: Option<LockToken>) -> Result<(), KernelError> {
        self.check_key(key)?;
        match self.items.get_mut(&key) {
            None => {
                self.items.insert(key, StoredItem::new(key, data));
                Ok(())
            }
            Some(item) => match item.lock {
                Some(held) if Some(held) != lock => Err(KernelError::Locked),
                _ => {
                    item.data = data;
                    item.reservation = false;
                    Ok(())
                }
            },
        }
    }

    /// Replace a locked item and release the lock in one step.
    pub fn put_unlocking(
        &mut self,
        key: Key,
        data: Vec<u8>,
        lock: LockToken,
        tokens: &mut TokenSource,
    ) -> Result<Vec<Wakeup>, KernelError> {
        self.put(key, data, Some(lock))?;
        self.unlock(key, lock, tokens)
    }

    /// Non-blocking lookup, optionally acquiring the lock.
    pub fn get(&mut self, key: Key, want_lock: bool, tokens: &mut TokenSource) -> Access {
        match self.items.get_mut(&key) {
            None => Access::NotFound,
            Some(item) if item.is_locked() => Access::Locked,
            Some(item) => {
                let lock = want_lock.then(|| tokens.next_token());
                item.lock = lock;
                Access::Found(item.snapshot(lock))
            }
        }
    }

    /// Queue a task on a locked item.
    ///
    /// Returns `false` when the item no longer exists.
    pub fn enqueue(&mut self, key: Key, waiter: Waiter) -> bool {
        match self.items.get_mut(&key) {
            Some(item) => {
                item.waiters.push_back(waiter);
                true
            }
            None => false,
        }
    }

    /// Acquire the lock of an existing item without waiting.
    pub fn lock(&mut self, key: Key, tokens: &mut TokenSource) -> Result<LockToken, KernelError> {
        let item = self.items.get_mut(&key).ok_or(KernelError::NotFound)?;
        if item.is_locked() {
            return Err(KernelError::WouldBlock);
        }
        let token = tokens.next_token();
        item.lock = Some(token);
        Ok(token)
    }

    /// Release a lock and serve queued waiters.
    ///
    /// Unlocking an absent or unlocked item succeeds. A wrong token leaves
    /// the item locked.
    pub fn unlock(
        &mut self,
        key: Key,
        token: LockToken,
        tokens: &mut TokenSource,
    ) -> Result<Vec<Wakeup>, KernelError> {
        let Some(item) = self.items.get_mut(&key) else {
            return Ok(Vec::new());
        };
        match item.lock {
            None => Ok(Vec::new()),
            Some(held) if held == token => {
                item.lock = None;
                Ok(item.hand_off(tokens))
            }
            Some(_) => Err(KernelError::NoPermission),
        }
    }

    /// Claim a key that does not exist yet.
    ///
    /// Returns `None` if any item, placeholder or not, already uses the key.
    pub fn reserve(&mut self, key: Key, tokens: &mut TokenSource) -> Result<Option<LockToken>, KernelError> {
        self.check_key(key)?;
        if self.items.contains_key(&key) {
            return Ok(None);
        }
        let token = tokens.next_token();
        let mut item = StoredItem::new(key, Vec::new());
        item.lock = Some(token);
        item.reservation = true;
        self.items.insert(key, item);
        Ok(Some(token))
    }

    /// Drop a locked item (normally a reservation placeholder).
    ///
    /// Waiters queued on it are told the key no longer exists.
    pub fn release(&mut self, key: Key, token: LockToken) -> Result<Vec<Wakeup>, KernelError> {
        match self.items.get(&key) {
            None => return Ok(Vec::new()),
            Some(item) if item.lock != Some(token) => return Err(KernelError::NoPermission),
            Some(_) => {}
        }
        Ok(self
            .items
            .remove(&key)
            .map(|mut item| item.dismiss_waiters(Woken::NotFound))
            .unwrap_or_default())
    }

    /// Delete an item unconditionally.
    pub fn remove(&mut self, key: Key) -> Option<StoredItem> {
        self.items.remove(&key)
    }

    /// Wake every queued task with `Migrated`.
    pub fn drain_waiters(&mut self) -> Vec<Wakeup> {
        self.items
            .values_mut()
            .flat_map(|item| item.dismiss_waiters(Woken::Migrated))
            .collect()
    }

    /// Serialize all items. Waiters are not part of the image.
    pub fn image(&self) -> PartitionImage {
        PartitionImage {
            pe: self.pe,
            items: self
                .items
                .values()
                .map(|item| ItemImage {
                    key: item.key,
                    data: item.data.clone(),
                    lock: item.lock,
                    reservation: item.reservation,
                })
                .collect(),
        }
    }

    /// Rebuild a partition from its image.
    pub fn from_image(image: PartitionImage) -> Result<Self, KernelError> {
        let mut partition = Partition::new(image.pe);
        for entry in image.items {
            partition.check_key(entry.key)?;
            let mut item = StoredItem::new(entry.key, entry.data);
            item.lock = entry.lock;
            item.reservation = entry.reservation;
            partition.items.insert(entry.key, item);
        }
        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ItemType;
    use crate::types::OwnerId;
    use assert_matches::assert_matches;

    fn key(obj: u64) -> Key {
        Key::compose(PeId(3), OwnerId(3), ItemType::NoType, obj)
    }

    fn setup() -> (Partition, TokenSource) {
        (Partition::new(PeId(3)), TokenSource::seeded(42))
    }

    fn waiter(id: u64, want_lock: bool) -> Waiter {
        Waiter {
            token: WaitToken(id),
            want_lock,
        }
    }

    #[test]
    fn test_put_rejects_foreign_pe() {
        let (mut part, _) = setup();
        let foreign = Key::compose(PeId(4), OwnerId(3), ItemType::NoType, 1);
        assert_eq!(part.put(foreign, vec![1], None), Err(KernelError::InvalidArgs));
    }

    #[test]
    fn test_put_get_replace() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), b"one".to_vec(), None).unwrap();
        part.put(key(1), b"uno".to_vec(), None).unwrap();
        assert_matches!(
            part.get(key(1), false, &mut tokens),
            Access::Found(Item { data, lock: None, .. }) if data == b"uno"
        );
        assert_eq!(part.get(key(2), false, &mut tokens), Access::NotFound);
    }

    #[test]
    fn test_put_on_locked_item_needs_token() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![1], None).unwrap();
        let token = part.lock(key(1), &mut tokens).unwrap();

        assert_eq!(part.put(key(1), vec![2], None), Err(KernelError::Locked));
        part.put(key(1), vec![3], Some(token)).unwrap();
        assert!(part.item(key(1)).unwrap().is_locked());
        assert_eq!(part.item(key(1)).unwrap().data(), &[3]);
    }

    #[test]
    fn test_lock_distinguishes_missing_and_blocked() {
        let (mut part, mut tokens) = setup();
        assert_eq!(part.lock(key(1), &mut tokens), Err(KernelError::NotFound));
        part.put(key(1), vec![], None).unwrap();
        part.lock(key(1), &mut tokens).unwrap();
        assert_eq!(part.lock(key(1), &mut tokens), Err(KernelError::WouldBlock));
        assert_eq!(part.get(key(1), false, &mut tokens), Access::Locked);
    }

    #[test]
    fn test_unlock_with_wrong_token_keeps_lock() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![], None).unwrap();
        let token = part.lock(key(1), &mut tokens).unwrap();
        let wrong = LockToken::new(token.get().wrapping_add(1).max(1)).unwrap();

        assert_eq!(part.unlock(key(1), wrong, &mut tokens), Err(KernelError::NoPermission));
        assert!(part.item(key(1)).unwrap().is_locked());
        assert_eq!(part.unlock(key(1), token, &mut tokens), Ok(vec![]));
        assert!(!part.item(key(1)).unwrap().is_locked());
    }

    #[test]
    fn test_lock_waiters_served_in_arrival_order() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![9], None).unwrap();
        let first = part.lock(key(1), &mut tokens).unwrap();
        assert!(part.enqueue(key(1), waiter(10, true)));
        assert!(part.enqueue(key(1), waiter(11, true)));
        assert!(part.enqueue(key(1), waiter(12, true)));

        let woken = part.unlock(key(1), first, &mut tokens).unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].token, WaitToken(10));
        let Woken::Served(Item { lock: Some(second), .. }) = woken[0].outcome else {
            panic!("first waiter should receive the lock");
        };

        let woken = part.unlock(key(1), second, &mut tokens).unwrap();
        assert_eq!(woken.iter().map(|w| w.token).collect::<Vec<_>>(), vec![WaitToken(11)]);
        assert_eq!(part.item(key(1)).unwrap().waiting(), 1);
    }

    #[test]
    fn test_readers_before_locker_are_all_served() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![], None).unwrap();
        let token = part.lock(key(1), &mut tokens).unwrap();
        part.enqueue(key(1), waiter(1, false));
        part.enqueue(key(1), waiter(2, false));
        part.enqueue(key(1), waiter(3, true));
        part.enqueue(key(1), waiter(4, false));

        let woken = part.unlock(key(1), token, &mut tokens).unwrap();
        let order: Vec<_> = woken.iter().map(|w| w.token.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_matches!(&woken[0].outcome, Woken::Served(Item { lock: None, .. }));
        assert_matches!(&woken[2].outcome, Woken::Served(Item { lock: Some(_), .. }));
    }

    #[test]
    fn test_put_unlocking_hands_off() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![1], None).unwrap();
        let token = part.lock(key(1), &mut tokens).unwrap();
        part.enqueue(key(1), waiter(5, false));

        let woken = part.put_unlocking(key(1), vec![2], token, &mut tokens).unwrap();
        assert_matches!(&woken[0].outcome, Woken::Served(Item { data, .. }) if data == &vec![2]);
        assert!(!part.item(key(1)).unwrap().is_locked());
    }

    #[test]
    fn test_reservation_exclusive() {
        let (mut part, mut tokens) = setup();
        let token = part.reserve(key(7), &mut tokens).unwrap().unwrap();
        assert_eq!(part.reserve(key(7), &mut tokens), Ok(None));
        assert!(part.item(key(7)).unwrap().is_reservation());

        let wrong = LockToken::new(token.get() ^ 0x1).unwrap_or(token);
        if wrong != token {
            assert_eq!(part.release(key(7), wrong), Err(KernelError::NoPermission));
        }
        assert!(part.item(key(7)).is_some());

        part.enqueue(key(7), waiter(3, false));
        let woken = part.release(key(7), token).unwrap();
        assert_eq!(woken, vec![Wakeup { token: WaitToken(3), outcome: Woken::NotFound }]);
        assert!(part.item(key(7)).is_none());
    }

    #[test]
    fn test_reserve_on_present_key_fails() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![], None).unwrap();
        assert_eq!(part.reserve(key(1), &mut tokens), Ok(None));
    }

    #[test]
    fn test_fill_reservation_with_token() {
        let (mut part, mut tokens) = setup();
        let token = part.reserve(key(2), &mut tokens).unwrap().unwrap();
        assert_eq!(part.put(key(2), vec![1], None), Err(KernelError::Locked));
        part.put_unlocking(key(2), vec![1], token, &mut tokens).unwrap();
        let item = part.item(key(2)).unwrap();
        assert!(!item.is_reservation());
        assert!(!item.is_locked());
    }

    #[test]
    fn test_remove_and_drain() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), vec![], None).unwrap();
        part.put(key(2), vec![], None).unwrap();
        part.lock(key(2), &mut tokens).unwrap();
        part.enqueue(key(2), waiter(8, true));

        assert!(part.remove(key(1)).is_some());
        let woken = part.drain_waiters();
        assert_eq!(woken, vec![Wakeup { token: WaitToken(8), outcome: Woken::Migrated }]);
    }

    #[test]
    fn test_image_restores_locks() {
        let (mut part, mut tokens) = setup();
        part.put(key(1), b"x".to_vec(), None).unwrap();
        let token = part.lock(key(1), &mut tokens).unwrap();
        part.reserve(key(2), &mut tokens).unwrap();

        let mut restored = Partition::from_image(part.image()).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.item(key(2)).unwrap().is_reservation());
        assert_eq!(restored.unlock(key(1), token, &mut tokens), Ok(vec![]));
    }

    #[test]
    fn test_from_image_rejects_misplaced_items() {
        let image = PartitionImage {
            pe: PeId(1),
            items: vec![ItemImage {
                key: key(1),
                data: vec![],
                lock: None,
                reservation: false,
            }],
        };
        assert_eq!(Partition::from_image(image).unwrap_err(), KernelError::InvalidArgs);
    }
}
