use crate::{BlockError, BlockResult};

/// Flat bitmap over a byte range, one bit per `granularity` bytes.  Used for dirty tracking on
/// nodes and for allocation maps in drivers.
///
/// Setting rounds outwards (any touched granule becomes set); clearing rounds inwards (only
/// granules fully covered are cleared), except at the very end of the bitmap where a partial
/// final granule counts as covered.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Vec<u64>,
    length: u64,
    set_count: u64,
    ld_granularity: u32,
}

const WORD_BITS: u64 = u64::BITS as u64;

impl Bitmap {
    pub fn new(length: u64, granularity: u64) -> BlockResult<Self> {
        if !granularity.is_power_of_two() {
            return Err(BlockError::invalid(format!(
                "Bitmap granularity must be a power of two; {} is not",
                granularity
            )));
        }

        let mut bitmap = Bitmap {
            words: Vec::new(),
            length: 0,
            set_count: 0,
            ld_granularity: granularity.trailing_zeros(),
        };
        bitmap.resize(length)?;
        Ok(bitmap)
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.set_count == 0
    }

    pub fn granularity(&self) -> u64 {
        1u64 << self.ld_granularity
    }

    /// Number of set bytes (whole granules)
    pub fn set_bytes(&self) -> u64 {
        self.set_count << self.ld_granularity
    }

    /// Grow or shrink the covered range.  New granules start cleared.
    pub fn resize(&mut self, length: u64) -> BlockResult<()> {
        let bits = length
            .checked_add(self.granularity() - 1)
            .ok_or_else(|| BlockError::invalid(format!("Bitmap size {} too large", length)))?
            >> self.ld_granularity;
        let word_count: usize = ((bits + WORD_BITS - 1) / WORD_BITS).try_into()?;

        self.words.resize(word_count, 0);
        self.length = length;

        // Drop bits beyond the new end
        if bits % WORD_BITS != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << (bits % WORD_BITS)) - 1;
            }
        }
        self.set_count = self.words.iter().map(|w| w.count_ones() as u64).sum();
        Ok(())
    }

    fn bit_range(&self, start: u64, length: u64, outwards: bool) -> Option<(u64, u64)> {
        let end = std::cmp::min(start.checked_add(length)?, self.length);
        if start >= end {
            return None;
        }

        let gran = self.granularity();
        let (first, past_last) = if outwards {
            (start >> self.ld_granularity, (end + gran - 1) >> self.ld_granularity)
        } else {
            let past_last = if end == self.length {
                (end + gran - 1) >> self.ld_granularity
            } else {
                end >> self.ld_granularity
            };
            ((start + gran - 1) >> self.ld_granularity, past_last)
        };

        (first < past_last).then_some((first, past_last))
    }

    fn update(&mut self, first: u64, past_last: u64, set: bool) {
        let mut bit = first;
        while bit < past_last {
            let word = (bit / WORD_BITS) as usize;
            let in_word = bit % WORD_BITS;
            let count = std::cmp::min(WORD_BITS - in_word, past_last - bit);
            let mask = if count == WORD_BITS {
                u64::MAX
            } else {
                ((1u64 << count) - 1) << in_word
            };

            let old = self.words[word];
            let new = if set { old | mask } else { old & !mask };
            self.words[word] = new;

            let changed = (old ^ new).count_ones() as u64;
            if set {
                self.set_count += changed;
            } else {
                self.set_count -= changed;
            }

            bit += count;
        }
    }

    pub fn set(&mut self, start: u64, length: u64) {
        if let Some((first, past_last)) = self.bit_range(start, length, true) {
            self.update(first, past_last, true);
        }
    }

    pub fn clear(&mut self, start: u64, length: u64) {
        if let Some((first, past_last)) = self.bit_range(start, length, false) {
            self.update(first, past_last, false);
        }
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
        self.set_count = 0;
    }

    fn is_set_bit(&self, bit: u64) -> bool {
        self.words[(bit / WORD_BITS) as usize] & (1u64 << (bit % WORD_BITS)) != 0
    }

    /// Length of the run starting at `offset` whose bits all equal `set`, capped at `max_len` and
    /// at the end of the bitmap
    fn run_length(&self, offset: u64, max_len: u64, set: bool) -> u64 {
        if offset >= self.length {
            return 0;
        }
        let max_len = std::cmp::min(max_len, self.length - offset);
        let first = offset >> self.ld_granularity;
        let bit_count = (self.length + self.granularity() - 1) >> self.ld_granularity;

        let mut bit = first;
        while bit < bit_count {
            let in_word = bit % WORD_BITS;
            let word = self.words[(bit / WORD_BITS) as usize];
            // Normalize so we are always looking for the first zero bit
            let word = if set { word } else { !word };
            let masked = word | ((1u64 << in_word) - 1);
            if masked != u64::MAX {
                bit = bit - in_word + masked.trailing_ones() as u64;
                break;
            }
            bit += WORD_BITS - in_word;

            if ((bit - first) << self.ld_granularity) >= max_len + self.granularity() {
                break;
            }
        }
        let bit = std::cmp::min(bit, bit_count);

        let run_end = bit << self.ld_granularity;
        std::cmp::min(run_end.saturating_sub(offset), max_len)
    }

    /// Length of the set area starting at `offset` (0 if the granule at `offset` is clear)
    pub fn get_set_area(&self, offset: u64, max_len: u64) -> u64 {
        self.run_length(offset, max_len, true)
    }

    /// Length of the clear area starting at `offset` (0 if the granule at `offset` is set)
    pub fn get_clear_area(&self, offset: u64, max_len: u64) -> u64 {
        self.run_length(offset, max_len, false)
    }

    pub fn is_set(&self, offset: u64) -> bool {
        offset < self.length && self.is_set_bit(offset >> self.ld_granularity)
    }

    /// Whether any granule in `[offset, offset + length)` is set
    pub fn any_set_in(&self, offset: u64, length: u64) -> bool {
        self.get_clear_area(offset, length) < std::cmp::min(length, self.length.saturating_sub(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_rounds_out_clear_rounds_in() {
        let mut bm = Bitmap::new(64 * 1024, 4096).unwrap();
        bm.set(100, 10);
        assert!(bm.is_set(0));
        assert_eq!(bm.set_bytes(), 4096);

        bm.clear(100, 4000);
        assert!(bm.is_set(0), "partial clear must not clear the granule");
        bm.clear(0, 4096);
        assert!(bm.is_empty());
    }

    #[test]
    fn runs_across_words() {
        let mut bm = Bitmap::new(1 << 20, 512).unwrap();
        bm.set(512 * 60, 512 * 10);
        assert_eq!(bm.get_clear_area(0, 1 << 20), 512 * 60);
        assert_eq!(bm.get_set_area(512 * 60, 1 << 20), 512 * 10);
        assert_eq!(bm.get_set_area(512 * 65, 512), 512);
        assert_eq!(bm.get_clear_area(512 * 70, 1 << 20), (1 << 20) - 512 * 70);
        assert!(bm.any_set_in(0, 512 * 61));
        assert!(!bm.any_set_in(512 * 70, 4096));
    }

    #[test]
    fn partial_final_granule() {
        let mut bm = Bitmap::new(1000, 512).unwrap();
        bm.set(600, 1);
        assert_eq!(bm.get_set_area(512, 4096), 1000 - 512);
        bm.clear(512, 488);
        assert!(bm.is_empty());
    }

    #[test]
    fn resize_drops_trailing_bits() {
        let mut bm = Bitmap::new(8192, 512).unwrap();
        bm.set(0, 8192);
        bm.resize(1024).unwrap();
        assert_eq!(bm.set_bytes(), 1024);
        bm.resize(8192).unwrap();
        assert_eq!(bm.get_set_area(0, 8192), 1024);
    }
}
