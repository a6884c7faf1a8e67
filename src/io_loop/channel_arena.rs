use crate::errors::*;
use snafu::{ensure, OptionExt};
use std::collections::VecDeque;

/// Arena of per-channel state, indexed by channel id.
///
/// Channel 0 is the connection's own channel and never lives here; slot
/// `i` holds channel id `i + 1`. Ids are handed out densely from 1, never
/// exceed the negotiated channel-max, and never collide with an open
/// channel. Removing a channel leaves a tombstone: its id only becomes
/// eligible again once every never-used id is exhausted, and then oldest
/// tombstone first, so the id of a channel whose close is still settling
/// on the wire is not immediately resurrected. Tombstones are cleared
/// lazily by the I/O thread (the sole writer) when an id is re-granted.
pub(crate) struct ChannelArena<T> {
    slots: Vec<Slot<T>>,
    channel_max: u16,

    // Lowest id never granted by automatic allocation; u32 so a
    // channel-max of 65535 cannot overflow it.
    next_fresh: u32,

    // Freed ids awaiting reuse, oldest first. May contain ids that were
    // explicitly re-claimed in the meantime; those are skipped and cleared
    // when encountered.
    tombstones: VecDeque<u16>,

    live: usize,
}

enum Slot<T> {
    Vacant,
    Occupied(T),
}

impl<T> Slot<T> {
    fn occupant(&self) -> Option<&T> {
        match self {
            Slot::Occupied(entry) => Some(entry),
            Slot::Vacant => None,
        }
    }

    fn occupant_mut(&mut self) -> Option<&mut T> {
        match self {
            Slot::Occupied(entry) => Some(entry),
            Slot::Vacant => None,
        }
    }
}

// Where a granted id came from; decides which cursor to advance on commit.
enum Grant {
    Fresh,
    Tombstone,
    Requested,
}

impl<T> ChannelArena<T> {
    pub(crate) fn new() -> ChannelArena<T> {
        ChannelArena {
            slots: Vec::new(),
            channel_max: 0,
            next_fresh: 1,
            tombstones: VecDeque::new(),
            live: 0,
        }
    }

    pub(crate) fn set_channel_max(&mut self, channel_max: u16) {
        assert!(
            self.live == 0 && self.next_fresh == 1 && self.tombstones.is_empty(),
            "channel_max should not be set after channels have been opened"
        );
        self.channel_max = channel_max;
    }

    fn index(channel_id: u16) -> usize {
        channel_id as usize - 1
    }

    pub(crate) fn get(&self, channel_id: u16) -> Option<&T> {
        if channel_id == 0 {
            return None;
        }
        self.slots.get(Self::index(channel_id)).and_then(Slot::occupant)
    }

    pub(crate) fn get_mut(&mut self, channel_id: u16) -> Option<&mut T> {
        if channel_id == 0 {
            return None;
        }
        self.slots
            .get_mut(Self::index(channel_id))
            .and_then(Slot::occupant_mut)
    }

    /// Place a new channel at an explicitly requested id, or at the lowest
    /// id consistent with the allocation rule. `make_entry` builds the
    /// slot contents once the id is known; if it fails, the arena is left
    /// exactly as it was.
    pub(crate) fn insert<F, U>(&mut self, requested: Option<u16>, make_entry: F) -> Result<U>
    where
        F: FnOnce(u16) -> Result<(T, U)>,
    {
        let (channel_id, grant) = match requested {
            Some(id) => {
                // id 0 is reserved for the connection itself
                ensure!(
                    id != 0 && id <= self.channel_max && self.get(id).is_none(),
                    UnavailableChannelIdSnafu { channel_id: id }
                );
                (id, Grant::Requested)
            }
            None => self.pick_lowest()?,
        };

        let (entry, out) = make_entry(channel_id)?;
        self.commit(channel_id, grant, entry);
        Ok(out)
    }

    /// The lowest grantable id: fresh ids first (skipping any that were
    /// explicitly claimed inside the fresh range), then the oldest vacant
    /// tombstone.
    fn pick_lowest(&self) -> Result<(u16, Grant)> {
        let mut candidate = self.next_fresh;
        while candidate <= u32::from(self.channel_max) {
            let id = candidate as u16;
            if self.get(id).is_none() {
                return Ok((id, Grant::Fresh));
            }
            candidate += 1;
        }

        self.tombstones
            .iter()
            .copied()
            .find(|id| self.get(*id).is_none())
            .map(|id| (id, Grant::Tombstone))
            .context(ExhaustedChannelIdsSnafu)
    }

    fn commit(&mut self, channel_id: u16, grant: Grant, entry: T) {
        let index = Self::index(channel_id);
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || Slot::Vacant);
        }
        self.slots[index] = Slot::Occupied(entry);
        self.live += 1;
        match grant {
            Grant::Fresh => self.next_fresh = u32::from(channel_id) + 1,
            // clear the (possibly stale) tombstone for a re-granted id
            Grant::Tombstone | Grant::Requested => {
                self.tombstones.retain(|id| *id != channel_id)
            }
        }
    }

    pub(crate) fn remove(&mut self, channel_id: u16) -> Option<T> {
        if channel_id == 0 {
            return None;
        }
        let slot = self.slots.get_mut(Self::index(channel_id))?;
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::Occupied(entry) => {
                self.live -= 1;
                self.tombstones.push_back(channel_id);
                Some(entry)
            }
            Slot::Vacant => None,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.occupant().map(|entry| (index as u16 + 1, entry))
        })
    }

    /// Empty the arena, tombstoning every id; used at connection teardown
    /// to notify each surviving channel exactly once.
    pub(crate) fn drain(&mut self) -> Vec<(u16, T)> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied(entry) = std::mem::replace(slot, Slot::Vacant) {
                let channel_id = index as u16 + 1;
                self.tombstones.push_back(channel_id);
                drained.push((channel_id, entry));
            }
        }
        self.live = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u16) -> Result<(u16, u16)> {
        Ok((id, id))
    }

    fn with_channel_max(channel_max: u16) -> ChannelArena<u16> {
        let mut arena = ChannelArena::new();
        arena.set_channel_max(channel_max);
        arena
    }

    #[test]
    fn automatic_ids_are_dense_from_one() {
        let mut arena = with_channel_max(8);
        assert_eq!(arena.insert(None, entry).unwrap(), 1);
        assert_eq!(arena.insert(None, entry).unwrap(), 2);
        assert_eq!(arena.insert(None, entry).unwrap(), 3);
    }

    #[test]
    fn channel_zero_is_never_grantable() {
        let mut arena = with_channel_max(8);
        match arena.insert(Some(0), entry).unwrap_err() {
            Error::UnavailableChannelId { channel_id: 0 } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn requested_id_above_max_or_taken_is_unavailable() {
        let mut arena = with_channel_max(4);
        match arena.insert(Some(5), entry).unwrap_err() {
            Error::UnavailableChannelId { channel_id: 5 } => (),
            err => panic!("unexpected error {}", err),
        }

        arena.insert(Some(2), entry).unwrap();
        match arena.insert(Some(2), entry).unwrap_err() {
            Error::UnavailableChannelId { channel_id: 2 } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn requested_ids_leave_the_dense_cursor_alone() {
        let mut arena = with_channel_max(4);
        arena.insert(Some(3), entry).unwrap();
        // automatic allocation still fills the gap below the claimed id
        assert_eq!(arena.insert(None, entry).unwrap(), 1);
        assert_eq!(arena.insert(None, entry).unwrap(), 2);
        assert_eq!(arena.insert(None, entry).unwrap(), 4);
    }

    #[test]
    fn fresh_ids_win_over_tombstones() {
        let mut arena = with_channel_max(3);
        arena.insert(None, entry).unwrap();
        arena.insert(None, entry).unwrap();
        assert!(arena.remove(1).is_some());

        // 3 has never been used; it is preferred over the freed 1
        assert_eq!(arena.insert(None, entry).unwrap(), 3);
        assert_eq!(arena.insert(None, entry).unwrap(), 1);
    }

    #[test]
    fn tombstones_reused_oldest_first() {
        let mut arena = with_channel_max(2);
        arena.insert(None, entry).unwrap();
        arena.insert(None, entry).unwrap();
        assert!(arena.remove(2).is_some());
        assert!(arena.remove(1).is_some());

        // 2 was freed before 1, so it comes back first
        assert_eq!(arena.insert(None, entry).unwrap(), 2);
        assert_eq!(arena.insert(None, entry).unwrap(), 1);
    }

    #[test]
    fn explicit_reclaim_clears_the_stale_tombstone() {
        let mut arena = with_channel_max(1);
        arena.insert(None, entry).unwrap();
        assert!(arena.remove(1).is_some());
        arena.insert(Some(1), entry).unwrap();

        // the freed-then-reclaimed id must not be granted a second time
        match arena.insert(None, entry).unwrap_err() {
            Error::ExhaustedChannelIds => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn exhausted_when_all_ids_live() {
        let mut arena = with_channel_max(4);
        for _ in 1..=4 {
            arena.insert(None, entry).unwrap();
        }
        match arena.insert(None, entry).unwrap_err() {
            Error::ExhaustedChannelIds => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn failed_make_entry_leaves_arena_unchanged() {
        let mut arena = with_channel_max(4);
        let result: Result<u16> =
            arena.insert(None, |_| FrameUnexpectedSnafu.fail());
        assert!(result.is_err());

        // the id that failed to materialize is granted again
        assert_eq!(arena.insert(None, entry).unwrap(), 1);
        assert_eq!(arena.iter().count(), 1);
    }

    #[test]
    fn drain_tombstones_everything() {
        let mut arena = with_channel_max(4);
        arena.insert(None, entry).unwrap();
        arena.insert(None, entry).unwrap();

        let drained = arena.drain();
        assert_eq!(drained.len(), 2);
        assert!(arena.get(1).is_none());
        assert!(arena.get(2).is_none());
        assert_eq!(arena.iter().count(), 0);

        // freed ids remain reusable afterwards
        assert_eq!(arena.insert(None, entry).unwrap(), 3);
    }

    #[test]
    #[should_panic]
    fn set_channel_max_after_use_panics() {
        let mut arena = with_channel_max(4);
        if arena.insert(None, entry).is_err() {
            return;
        }
        arena.set_channel_max(8);
    }
}
