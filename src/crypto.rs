//! Implements the layer scrambling found in some of the file formats.
//!
//! Three formats (`ctb`, `fdg`, `phz`) scramble their layer data with what is
//! essentially the same stream cipher, differing only in the *key schedule*:
//! the arithmetic used to derive the cipher state from the file's seed and the
//! layer index. See the documentation on `KeyStream`.

use byteorder::{ByteOrder, LittleEndian};

/// Selects which key schedule derives the cipher state.
///
/// The schedules use different constants and even different operations, and
/// the firmware for each format only understands its own. They can't be
/// unified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Schedule {
    Ctb,
    Fdg,
    Phz,
}

/// A key stream for the layer cipher.
///
/// This gets seeded with a file-wide `seed` and a per-layer `slice` index at
/// creation, and maintains the cipher state as bytes are processed. It can be
/// `clone`d to fork the cipher state.
///
/// # Cipher details
///
/// The key stream is produced by a degenerate linear congruential PRNG: in the
/// step function `X[n+1] = (a * X[n]) + c`, `a` is fixed at 1, and `c` (the
/// *increment*) is derived from the seed. `X[0]` (the *key*) is derived from
/// both the seed and the slice index. Each `X[n]` supplies four key bytes,
/// least significant first.
///
/// Concretely (all math modulo 2^32), for the CTB schedule:
///
/// - `c = seed * 0x2D83_CDAC + 0xD8A8_3423`
/// - `X[0] = (slice * 0x1E15_30CD + 0xEC3D_47CD) * c`
///
/// for the FDG schedule:
///
/// - `c = (seed - 0x1DCB_76C3) ^ 0x257E_2431`
/// - `X[0] = c * 0x8239_1EFD * (slice ^ 0x110B_DACD)`
///
/// and for the PHZ schedule, with `s = seed % 0x4324`:
///
/// - `c = s * 0x34A3_2231`
/// - `X[0] = (slice ^ 0x3FAD_2212) * (s * 0x4910_913D)`
///
/// Data is combined with the key stream using XOR, so encryption and
/// decryption are the same operation.
///
/// ## Weaknesses
///
/// There is no diffusion whatsoever, and the key is written in the file
/// header. This is obfuscation that the printers insist on, not security.
#[derive(Clone, Debug)]
pub struct KeyStream {
    increment: u32,
    key: u32,
    index: u32,
}

impl KeyStream {
    /// Creates a key stream for a given seed and slice index.
    pub fn new(schedule: Schedule, seed: u32, slice: u32) -> Self {
        let (increment, key) = match schedule {
            Schedule::Ctb => {
                let increment =
                    seed.wrapping_mul(0x2D83_CDAC).wrapping_add(0xD8A8_3423);
                let key = slice
                    .wrapping_mul(0x1E15_30CD)
                    .wrapping_add(0xEC3D_47CD)
                    .wrapping_mul(increment);
                (increment, key)
            }
            Schedule::Fdg => {
                let increment = seed.wrapping_sub(0x1DCB_76C3) ^ 0x257E_2431;
                let key = increment
                    .wrapping_mul(0x8239_1EFD)
                    .wrapping_mul(slice ^ 0x110B_DACD);
                (increment, key)
            }
            Schedule::Phz => {
                let seed = seed % 0x4324;
                let increment = seed.wrapping_mul(0x34A3_2231);
                let key = (slice ^ 0x3FAD_2212)
                    .wrapping_mul(seed.wrapping_mul(0x4910_913D));
                (increment, key)
            }
        };
        Self {
            increment,
            key,
            index: 0,
        }
    }

    /// The per-file increment added to the key every four bytes.
    pub fn increment(&self) -> u32 {
        self.increment
    }

    /// The key word bytes are currently being drawn from.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Produces the next byte in the keystream.
    pub fn next_byte(&mut self) -> u8 {
        let result = (self.key >> (8 * self.index)) as u8;
        self.index += 1;
        if self.index == 4 {
            self.index = 0;
            self.key = self.key.wrapping_add(self.increment);
        }
        result
    }

    /// Produces the next four bytes of the keystream as a little-endian word.
    ///
    /// This is only equivalent to four calls to `next_byte` when the stream is
    /// word-aligned, which it is unless someone has been calling `next_byte`.
    pub fn next_word(&mut self) -> u32 {
        debug_assert_eq!(self.index, 0);
        let result = self.key;
        self.key = self.key.wrapping_add(self.increment);
        result
    }
}

/// A seed bound to a key schedule: everything needed to scramble a file's
/// layers, given each layer's index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cipher {
    pub schedule: Schedule,
    pub seed: u32,
}

impl Cipher {
    /// Returns a cipher for `seed`, or `None` if `seed` is zero, which files
    /// use to mean "not scrambled."
    pub fn for_seed(schedule: Schedule, seed: u32) -> Option<Self> {
        if seed == 0 {
            None
        } else {
            Some(Self { schedule, seed })
        }
    }

    /// Scrambles or unscrambles the data for layer `slice` in place.
    pub fn apply(&self, slice: u32, data: &mut [u8]) {
        crypt(self.schedule, self.seed, slice, data)
    }
}

/// Picks a random seed suitable for a new file. Never returns zero, since a
/// zero seed means "unencrypted" and printers reject it in formats that
/// require scrambling.
pub fn random_seed() -> u32 {
    loop {
        let seed = rand::random::<u32>();
        if seed != 0 {
            return seed;
        }
    }
}

/// Encrypts or decrypts `data` using key schedule `schedule` with `seed` and
/// `slice`.
pub fn crypt(schedule: Schedule, seed: u32, slice: u32, mut data: &mut [u8]) {
    let mut ks = KeyStream::new(schedule, seed, slice);

    while data.len() >= 4 {
        let (four, rest) = data.split_at_mut(4);
        let word = LittleEndian::read_u32(four);
        LittleEndian::write_u32(four, word ^ ks.next_word());
        data = rest;
    }

    // Handle up to 3 trailing bytes as though they are the prefix of a
    // little-endian u32.
    for byte in data.iter_mut() {
        *byte ^= ks.next_byte();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ctb_schedule_regression() {
        let ks = KeyStream::new(Schedule::Ctb, 0xdcbe_9950, 20);
        assert_eq!(ks.increment(), 0x4d6c_45e3);
        assert_eq!(ks.key(), 0xa2bb_7353);
    }

    #[test]
    fn fdg_schedule_regression() {
        let ks = KeyStream::new(Schedule::Fdg, 0xdcbe_9950, 20);
        assert_eq!(ks.increment(), 0x9b8d_06bc);
        assert_eq!(ks.key(), 0x4749_bbec);
    }

    #[test]
    fn phz_schedule_regression() {
        let ks = KeyStream::new(Schedule::Phz, 0xdcbe_9950, 20);
        assert_eq!(ks.increment(), 0xe701_2f20);
        assert_eq!(ks.key(), 0xafa1_abc0);
    }

    #[test]
    fn bytes_match_words() {
        let mut by_byte = KeyStream::new(Schedule::Ctb, 0x1234_5678, 3);
        let mut by_word = by_byte.clone();
        for _ in 0..5 {
            let mut word = [0u8; 4];
            for b in &mut word {
                *b = by_byte.next_byte();
            }
            assert_eq!(LittleEndian::read_u32(&word), by_word.next_word());
        }
    }

    #[test]
    fn first_bytes_are_key_little_endian() {
        let mut data = [0u8; 6];
        crypt(Schedule::Ctb, 0xdcbe_9950, 20, &mut data);
        let key: u32 = 0xa2bb_7353;
        let next = key.wrapping_add(0x4d6c_45e3);
        assert_eq!(&data[..4], &key.to_le_bytes());
        assert_eq!(&data[4..], &next.to_le_bytes()[..2]);
    }

    #[test]
    fn zero_seed_disables() {
        assert_eq!(Cipher::for_seed(Schedule::Ctb, 0), None);
        assert!(Cipher::for_seed(Schedule::Fdg, 1).is_some());
    }

    #[test]
    fn random_seed_nonzero() {
        for _ in 0..100 {
            assert_ne!(random_seed(), 0);
        }
    }

    proptest! {
        #[test]
        fn crypt_is_involution(
            seed in any::<u32>(),
            slice in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            for &schedule in &[Schedule::Ctb, Schedule::Fdg, Schedule::Phz] {
                let mut buf = data.clone();
                crypt(schedule, seed, slice, &mut buf);
                crypt(schedule, seed, slice, &mut buf);
                prop_assert_eq!(&buf, &data);
            }
        }
    }
}
