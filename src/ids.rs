use crate::errors::*;
use std::sync::Mutex;

const WORD_BITS: u16 = 64;

/// Thread-safe allocator for the 16-bit channel id space.
///
/// Ids run from 1 to the negotiated channel max; id 0 is the connection's own
/// channel and is never handed out. Allocation scans a bitset starting from a
/// rotating hint so recently released ids are not immediately reused.
pub(crate) struct IdAllocator {
    inner: Mutex<Bits>,
}

struct Bits {
    words: Vec<u64>,
    channel_max: u16,
    next_hint: u16,
}

impl IdAllocator {
    pub(crate) fn new(channel_max: u16) -> IdAllocator {
        let words = (channel_max as usize / WORD_BITS as usize) + 1;
        IdAllocator {
            inner: Mutex::new(Bits {
                words: vec![0; words],
                channel_max,
                next_hint: 1,
            }),
        }
    }

    /// Claim the lowest free id at or after the rotating hint, wrapping once.
    pub(crate) fn allocate(&self) -> Result<u16> {
        let mut bits = self.inner.lock().unwrap();
        if bits.channel_max == 0 {
            return ExhaustedChannelIdsSnafu.fail();
        }
        let start = bits.next_hint;
        let mut candidate = start;
        loop {
            if !bits.get(candidate) {
                bits.set(candidate, true);
                bits.next_hint = if candidate == bits.channel_max {
                    1
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
            candidate = if candidate == bits.channel_max {
                1
            } else {
                candidate + 1
            };
            if candidate == start {
                return ExhaustedChannelIdsSnafu.fail();
            }
        }
    }

    /// Claim a specific id requested by the caller.
    pub(crate) fn reserve(&self, id: u16) -> Result<()> {
        let mut bits = self.inner.lock().unwrap();
        if id == 0 || id > bits.channel_max || bits.get(id) {
            return UnavailableChannelIdSnafu { channel_id: id }.fail();
        }
        bits.set(id, true);
        Ok(())
    }

    pub(crate) fn release(&self, id: u16) {
        let mut bits = self.inner.lock().unwrap();
        if id != 0 && id <= bits.channel_max {
            bits.set(id, false);
        }
    }

    pub(crate) fn is_allocated(&self, id: u16) -> bool {
        let bits = self.inner.lock().unwrap();
        id != 0 && id <= bits.channel_max && bits.get(id)
    }

    /// Free every id. Used when a connection is torn down for recovery and
    /// channels will be re-reserved under their old ids.
    pub(crate) fn reset(&self) {
        let mut bits = self.inner.lock().unwrap();
        for word in bits.words.iter_mut() {
            *word = 0;
        }
        bits.next_hint = 1;
    }
}

impl Bits {
    fn get(&self, id: u16) -> bool {
        let word = (id / WORD_BITS) as usize;
        let bit = id % WORD_BITS;
        self.words[word] & (1 << bit) != 0
    }

    fn set(&mut self, id: u16, value: bool) {
        let word = (id / WORD_BITS) as usize;
        let bit = id % WORD_BITS;
        if value {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }
}
