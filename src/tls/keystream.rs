/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Counter-mode keystream used as the randomness source for leaf issuance.
///
/// Keyed by SHA-256 over the root's PKCS#8 bytes and a salt, so the stream is as
/// unpredictable as the root key itself while never touching system entropy. Every draw
/// advances the AES-CTR counter; a byte position is never produced twice by one stream.
/// Instances are not shared between issuances.
pub struct KeyStream {
    cipher: Aes256Ctr,
    drawn: u64,
}

impl KeyStream {
    pub fn new(root_key_der: &[u8], salt: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(root_key_der);
        hasher.update(salt);
        let key: [u8; 32] = hasher.finalize().into();
        let iv = [0u8; 16];

        Self {
            cipher: Aes256Ctr::new(&key.into(), &iv.into()),
            drawn: 0,
        }
    }

    /// Total bytes handed out so far.
    pub fn drawn(&self) -> u64 {
        self.drawn
    }

    fn draw(&mut self, dest: &mut [u8]) {
        dest.fill(0);
        self.cipher.apply_keystream(dest);
        self.drawn += dest.len() as u64;
    }
}

impl std::fmt::Debug for KeyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStream")
            .field("drawn", &self.drawn)
            .finish_non_exhaustive()
    }
}

impl RngCore for KeyStream {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.draw(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.draw(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.draw(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.draw(dest);
        Ok(())
    }
}

impl CryptoRng for KeyStream {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_reproduces_the_stream() {
        let mut a = KeyStream::new(b"root-key", b"example.com");
        let mut b = KeyStream::new(b"root-key", b"example.com");
        let mut left = [0u8; 64];
        let mut right = [0u8; 64];
        a.fill_bytes(&mut left);
        b.fill_bytes(&mut right);
        assert_eq!(left, right);
    }

    #[test]
    fn consecutive_draws_do_not_repeat() {
        let mut stream = KeyStream::new(b"root-key", b"example.com");
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        stream.fill_bytes(&mut first);
        stream.fill_bytes(&mut second);
        assert_ne!(first, second);
        assert_eq!(stream.drawn(), 64);
    }

    #[test]
    fn salt_separates_streams() {
        let mut a = KeyStream::new(b"root-key", b"a.example");
        let mut b = KeyStream::new(b"root-key", b"b.example");
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn split_reads_match_one_large_read() {
        let mut whole = KeyStream::new(b"root-key", b"");
        let mut parts = KeyStream::new(b"root-key", b"");
        let mut big = [0u8; 48];
        whole.fill_bytes(&mut big);

        let mut small = [0u8; 48];
        parts.fill_bytes(&mut small[..5]);
        parts.fill_bytes(&mut small[5..21]);
        parts.fill_bytes(&mut small[21..]);
        assert_eq!(big, small, "counter mode keeps position across odd-sized reads");
    }
}
