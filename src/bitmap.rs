use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

/// Fixed-domain bit-set over a dense index space (node indices or global
/// core indices). Value semantics: the set operators return new sets, so
/// callers never mutate a bitmap another reservation is holding.
///
/// Bits at or above `nbits` are always zero; every operation maintains
/// that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    nbits: usize,
    words: Vec<u64>,
}

impl Bitmap {
    /// Empty set over a domain of `nbits` indices.
    pub fn new(nbits: usize) -> Self {
        Self {
            nbits,
            words: vec![0; nbits.div_ceil(WORD_BITS)],
        }
    }

    /// Full set: every index in the domain is a member.
    pub fn filled(nbits: usize) -> Self {
        let mut bm = Self {
            nbits,
            words: vec![u64::MAX; nbits.div_ceil(WORD_BITS)],
        };
        bm.mask_tail();
        bm
    }

    /// Build from explicit member indices.
    pub fn from_indices(nbits: usize, indices: &[usize]) -> Self {
        let mut bm = Self::new(nbits);
        for &i in indices {
            bm.set(i);
        }
        bm
    }

    fn mask_tail(&mut self) {
        let tail = self.nbits % WORD_BITS;
        if tail != 0
            && let Some(last) = self.words.last_mut()
        {
            *last &= (1u64 << tail) - 1;
        }
        if self.nbits == 0 {
            self.words.clear();
        }
    }

    /// Size of the index domain (not the member count).
    pub fn domain(&self) -> usize {
        self.nbits
    }

    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < self.nbits, "index {idx} outside domain {}", self.nbits);
        if idx < self.nbits {
            self.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
        }
    }

    pub fn unset(&mut self, idx: usize) {
        if idx < self.nbits {
            self.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
        }
    }

    pub fn test(&self, idx: usize) -> bool {
        idx < self.nbits && self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }

    /// Member count (population count).
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Set intersection.
    pub fn and(&self, other: &Bitmap) -> Bitmap {
        self.zip_words(other, |a, b| a & b)
    }

    /// Set union.
    pub fn or(&self, other: &Bitmap) -> Bitmap {
        self.zip_words(other, |a, b| a | b)
    }

    /// Set difference: members of `self` not in `other`.
    pub fn and_not(&self, other: &Bitmap) -> Bitmap {
        self.zip_words(other, |a, b| a & !b)
    }

    /// Complement within the domain.
    pub fn not(&self) -> Bitmap {
        let mut out = Bitmap {
            nbits: self.nbits,
            words: self.words.iter().map(|w| !w).collect(),
        };
        out.mask_tail();
        out
    }

    /// In-place union, for accumulator-style call sites.
    pub fn or_assign(&mut self, other: &Bitmap) {
        let n = self.words.len().min(other.words.len());
        for i in 0..n {
            self.words[i] |= other.words[i];
        }
        self.mask_tail();
    }

    fn zip_words(&self, other: &Bitmap, f: impl Fn(u64, u64) -> u64) -> Bitmap {
        debug_assert_eq!(self.nbits, other.nbits, "bitmap domain mismatch");
        let mut out = Bitmap {
            nbits: self.nbits,
            words: self
                .words
                .iter()
                .zip(other.words.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        };
        // Domains should match; if a caller slipped, keep the shorter word
        // vector consistent with nbits.
        out.words.resize(self.nbits.div_ceil(WORD_BITS), 0);
        out.mask_tail();
        out
    }

    pub fn overlaps(&self, other: &Bitmap) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn overlap_count(&self, other: &Bitmap) -> usize {
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a & b).count_ones() as usize)
            .sum()
    }

    /// True if every member of `other` is also a member of `self`.
    pub fn is_superset_of(&self, other: &Bitmap) -> bool {
        other
            .words
            .iter()
            .zip(self.words.iter())
            .all(|(o, s)| o & !s == 0)
            && other.words.len() <= self.words.len()
    }

    /// Lowest-index members, exactly `n` of them, as a new set.
    /// Returns `None` if the set holds fewer than `n` members.
    pub fn pick_n(&self, n: usize) -> Option<Bitmap> {
        if n == 0 {
            return Some(Bitmap::new(self.nbits));
        }
        let mut out = Bitmap::new(self.nbits);
        let mut taken = 0;
        for idx in self.iter_ones() {
            out.set(idx);
            taken += 1;
            if taken == n {
                return Some(out);
            }
        }
        None
    }

    pub fn first_set(&self) -> Option<usize> {
        self.iter_ones().next()
    }

    /// Iterate member indices in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            let mut w = *w;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * WORD_BITS + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_unset() {
        let mut bm = Bitmap::new(130);
        bm.set(0);
        bm.set(64);
        bm.set(129);
        assert!(bm.test(0));
        assert!(bm.test(64));
        assert!(bm.test(129));
        assert!(!bm.test(1));
        assert_eq!(bm.count(), 3);
        bm.unset(64);
        assert!(!bm.test(64));
        assert_eq!(bm.count(), 2);
    }

    #[test]
    fn filled_masks_tail() {
        let bm = Bitmap::filled(70);
        assert_eq!(bm.count(), 70);
        assert!(bm.test(69));
        assert!(!bm.test(70));
    }

    #[test]
    fn algebra() {
        let a = Bitmap::from_indices(8, &[0, 1, 2, 3]);
        let b = Bitmap::from_indices(8, &[2, 3, 4, 5]);
        assert_eq!(a.and(&b), Bitmap::from_indices(8, &[2, 3]));
        assert_eq!(a.or(&b), Bitmap::from_indices(8, &[0, 1, 2, 3, 4, 5]));
        assert_eq!(a.and_not(&b), Bitmap::from_indices(8, &[0, 1]));
        assert_eq!(a.not(), Bitmap::from_indices(8, &[4, 5, 6, 7]));
        assert_eq!(a.overlap_count(&b), 2);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&Bitmap::from_indices(8, &[6, 7])));
    }

    #[test]
    fn superset() {
        let outer = Bitmap::from_indices(16, &[1, 2, 3, 9]);
        let inner = Bitmap::from_indices(16, &[2, 9]);
        assert!(outer.is_superset_of(&inner));
        assert!(outer.is_superset_of(&outer));
        assert!(!inner.is_superset_of(&outer));
        assert!(outer.is_superset_of(&Bitmap::new(16)));
    }

    #[test]
    fn pick_n_lowest() {
        let bm = Bitmap::from_indices(128, &[5, 9, 70, 100]);
        let picked = bm.pick_n(2).unwrap();
        assert_eq!(picked, Bitmap::from_indices(128, &[5, 9]));
        assert!(bm.pick_n(5).is_none());
        assert_eq!(bm.pick_n(0).unwrap().count(), 0);
    }

    #[test]
    fn iter_ones_crosses_words() {
        let bm = Bitmap::from_indices(200, &[0, 63, 64, 127, 128, 199]);
        let ones: Vec<usize> = bm.iter_ones().collect();
        assert_eq!(ones, vec![0, 63, 64, 127, 128, 199]);
        assert_eq!(bm.first_set(), Some(0));
        assert_eq!(Bitmap::new(200).first_set(), None);
    }

    #[test]
    fn not_of_empty_domain() {
        let bm = Bitmap::new(0);
        assert!(bm.not().is_clear());
        assert_eq!(bm.count(), 0);
    }

    #[test]
    fn serde_roundtrip() {
        let bm = Bitmap::from_indices(100, &[3, 50, 99]);
        let bytes = bincode::serialize(&bm).unwrap();
        let back: Bitmap = bincode::deserialize(&bytes).unwrap();
        assert_eq!(bm, back);
    }
}
