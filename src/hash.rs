//! Content fingerprints: MD5 for dedup/integrity, CRC32 as an alternative.
//!
//! MD5 is the dedup key (`(uncompressed size, MD5)`, spec-frozen) and the
//! weak integrity check run after decompression. CRC32 is available as a
//! cheaper alternative fingerprint for callers that don't need MD5's
//! collision resistance.

use md5::{Digest, Md5};

pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_vector() {
        // MD5("") per RFC 1321 test vectors.
        let expect = hex::decode("d41d8cd98f00b204e9800998ecf8427e").unwrap();
        assert_eq!(md5(b"").to_vec(), expect);
    }

    #[test]
    fn crc32_matches_crc32fast() {
        assert_eq!(crc32(b"123456789"), crc32fast::hash(b"123456789"));
    }
}
