//! Open/closed slot scheduling.
//!
//! On rounds flagged `FlagOpenClosedRequest` each client contributes a
//! DC-net cell whose plaintext is a bitmap of the slots it wants open; the
//! XOR-combine yields the schedule for the next `n_clients` rounds. Slot
//! bits are unique per client, so the XOR is a union.

/// Builds one client's bitmap contribution.
pub fn contribution(n_clients: usize, my_slot: usize, wants_to_transmit: bool) -> Vec<u8> {
    let mut bitmap = vec![0u8; bitmap_len(n_clients)];
    if wants_to_transmit {
        bitmap[my_slot / 8] |= 0x80 >> (my_slot % 8);
    }
    bitmap
}

/// Bytes needed for an `n_clients`-slot bitmap.
pub fn bitmap_len(n_clients: usize) -> usize {
    n_clients.div_ceil(8)
}

/// The relay's view of one schedule window.
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    open: Vec<bool>,
    cursor: usize,
    remaining: usize,
}

impl Schedule {
    /// Parses the combined bitmap into a schedule covering `n_clients`
    /// rounds.
    pub fn from_combined(bitmap: &[u8], n_clients: usize) -> Self {
        let open = (0..n_clients)
            .map(|slot| {
                bitmap
                    .get(slot / 8)
                    .map(|byte| byte & (0x80 >> (slot % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect();
        Self {
            open,
            cursor: 0,
            remaining: n_clients,
        }
    }

    /// A schedule with every slot open, used before the first open/closed
    /// round and when scheduling is disabled.
    pub fn all_open(n_clients: usize) -> Self {
        Self {
            open: vec![true; n_clients],
            cursor: 0,
            remaining: n_clients,
        }
    }

    /// Whether this window still covers upcoming rounds.
    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Slots currently marked open.
    pub fn open_slots(&self) -> Vec<usize> {
        self.open
            .iter()
            .enumerate()
            .filter_map(|(slot, open)| open.then_some(slot))
            .collect()
    }

    /// Picks the owner of the next round, cycling through open slots;
    /// `None` means the round is closed and decodes to the zero cell.
    pub fn next_owner(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let n = self.open.len();
        for _ in 0..n {
            let slot = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            if self.open[slot] {
                return Some(slot);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contribution_sets_own_bit() {
        assert_eq!(contribution(4, 2, true), vec![0b0010_0000]);
        assert_eq!(contribution(4, 2, false), vec![0b0000_0000]);
        assert_eq!(contribution(9, 8, true), vec![0x00, 0x80]);
    }

    #[test]
    fn test_combine_is_union() {
        let mut combined = contribution(4, 0, true);
        for (byte, other) in combined.iter_mut().zip(contribution(4, 3, true)) {
            *byte ^= other;
        }
        let schedule = Schedule::from_combined(&combined, 4);
        assert_eq!(schedule.open_slots(), vec![0, 3]);
    }

    #[test]
    fn test_round_robin_over_open_slots() {
        let mut combined = contribution(4, 1, true);
        for (byte, other) in combined.iter_mut().zip(contribution(4, 2, true)) {
            *byte ^= other;
        }
        let mut schedule = Schedule::from_combined(&combined, 4);
        let owners: Vec<_> = std::iter::from_fn(|| {
            (!schedule.exhausted()).then(|| schedule.next_owner())
        })
        .collect();
        assert_eq!(owners, vec![Some(1), Some(2), Some(1), Some(2)]);
        assert!(schedule.exhausted());
    }

    #[test]
    fn test_all_closed_yields_no_owner() {
        let mut schedule = Schedule::from_combined(&[0u8], 3);
        assert_eq!(schedule.next_owner(), None);
        assert_eq!(schedule.next_owner(), None);
        assert_eq!(schedule.next_owner(), None);
        assert!(schedule.exhausted());
    }

    #[test]
    fn test_short_bitmap_is_closed() {
        let schedule = Schedule::from_combined(&[], 4);
        assert!(schedule.open_slots().is_empty());
    }
}
