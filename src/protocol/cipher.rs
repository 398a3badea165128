use bytes::Buf;

use crate::core::{Error, Result};

/// Pluggable symmetric cipher over raw key/IV bytes.
///
/// The transport does not fix an algorithm; callers supply an AES-style
/// implementation when the publisher encrypts data packets or requires
/// authentication.
pub trait SymmetricCipher: Send + Sync {
    /// Encrypts a buffer with the given key and initialization vector
    fn encrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts a buffer with the given key and initialization vector
    fn decrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>;
}

/// A key and initialization vector pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIv {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// One generation of cipher key material: even and odd key/IV pairs plus
/// the index the publisher currently encrypts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherKeySet {
    active_index: usize,
    pairs: [KeyIv; 2],
}

impl CipherKeySet {
    /// Index of the pair the publisher reported as active
    pub fn active_index(&self) -> usize {
        self.active_index
    }

    /// Returns the key/IV pair for a cipher index (0 = even, 1 = odd)
    pub fn pair(&self, cipher_index: usize) -> &KeyIv {
        &self.pairs[cipher_index & 1]
    }

    /// Parses an `UpdateCipherKeys` payload: 1 byte active index, then for
    /// the even and odd pairs a length-prefixed key and a length-prefixed
    /// initialization vector.
    ///
    /// The whole payload must parse before any key material is returned,
    /// so a truncated update can never be applied partially.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;

        if buf.remaining() < 1 {
            return Err(Error::framing("empty cipher key payload"));
        }

        let active_index = (buf.get_u8() & 1) as usize;
        let even = read_pair(&mut buf)?;
        let odd = read_pair(&mut buf)?;

        Ok(CipherKeySet {
            active_index,
            pairs: [even, odd],
        })
    }
}

fn read_block(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(Error::framing("truncated cipher key payload"));
    }

    let length = buf.get_u32() as usize;

    if buf.remaining() < length {
        return Err(Error::framing("truncated cipher key payload"));
    }

    let block = buf[..length].to_vec();
    buf.advance(length);
    Ok(block)
}

fn read_pair(buf: &mut &[u8]) -> Result<KeyIv> {
    Ok(KeyIv {
        key: read_block(buf)?,
        iv: read_block(buf)?,
    })
}

/// Holds the active cipher key generation and tracks a requested rotation.
///
/// A rotation becomes visible only through [`CipherManager::apply`], which
/// swaps the whole key set at once. Decrypting with no active keys is a
/// protocol/configuration mismatch and therefore fatal to the channel.
#[derive(Default)]
pub struct CipherManager {
    active: Option<CipherKeySet>,
    rotation_pending: bool,
}

impl CipherManager {
    /// Creates a manager with no key material
    pub fn new() -> Self {
        CipherManager::default()
    }

    /// Returns true once a key set has been applied
    pub fn has_keys(&self) -> bool {
        self.active.is_some()
    }

    /// Returns true while a requested rotation awaits its key update
    pub fn rotation_pending(&self) -> bool {
        self.rotation_pending
    }

    /// Marks that a key rotation has been requested from the publisher
    pub fn begin_rotation(&mut self) {
        self.rotation_pending = true;
    }

    /// Installs a fully parsed key set as the active generation
    pub fn apply(&mut self, keys: CipherKeySet) {
        self.active = Some(keys);
        self.rotation_pending = false;
    }

    /// Drops all key material, used when a session ends
    pub fn clear(&mut self) {
        self.active = None;
        self.rotation_pending = false;
    }

    /// Decrypts a data packet payload with the pair selected by the packet's
    /// cipher index flag
    pub fn decrypt(
        &self,
        cipher: &dyn SymmetricCipher,
        cipher_index: usize,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let keys = self
            .active
            .as_ref()
            .ok_or_else(|| Error::crypto("received encrypted payload with no active keys"))?;

        let pair = keys.pair(cipher_index);
        cipher.decrypt(&pair.key, &pair.iv, data)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// XOR keystream stand-in for a real block cipher
    pub struct XorCipher;

    impl SymmetricCipher for XorCipher {
        fn encrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
            if key.is_empty() || iv.is_empty() {
                return Err(Error::crypto("empty key material"));
            }

            Ok(data
                .iter()
                .enumerate()
                .map(|(i, byte)| byte ^ key[i % key.len()] ^ iv[i % iv.len()])
                .collect())
        }

        fn decrypt(&self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
            self.encrypt(key, iv, data)
        }
    }

    /// Builds an `UpdateCipherKeys` payload for the given pairs
    pub fn encode_key_set(active_index: u8, even: &KeyIv, odd: &KeyIv) -> Vec<u8> {
        let mut payload = vec![active_index];

        for pair in [even, odd] {
            payload.extend_from_slice(&(pair.key.len() as u32).to_be_bytes());
            payload.extend_from_slice(&pair.key);
            payload.extend_from_slice(&(pair.iv.len() as u32).to_be_bytes());
            payload.extend_from_slice(&pair.iv);
        }

        payload
    }

    pub fn sample_pair(seed: u8) -> KeyIv {
        KeyIv {
            key: vec![seed; 32],
            iv: vec![seed.wrapping_add(1); 16],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_key_set_decode() {
        let even = sample_pair(0x11);
        let odd = sample_pair(0x22);
        let payload = encode_key_set(1, &even, &odd);

        let keys = CipherKeySet::decode(&payload).unwrap();
        assert_eq!(keys.active_index(), 1);
        assert_eq!(keys.pair(0), &even);
        assert_eq!(keys.pair(1), &odd);
    }

    #[test]
    fn test_truncated_key_set_rejected() {
        let payload = encode_key_set(0, &sample_pair(1), &sample_pair(2));

        for cut in [0, 1, 5, payload.len() - 1] {
            assert!(CipherKeySet::decode(&payload[..cut]).is_err());
        }
    }

    #[test]
    fn test_decrypt_without_keys_is_fatal() {
        let manager = CipherManager::new();
        let err = manager.decrypt(&XorCipher, 0, b"payload").unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rotation_swaps_atomically() {
        let mut manager = CipherManager::new();
        let first = CipherKeySet::decode(&encode_key_set(0, &sample_pair(1), &sample_pair(2)))
            .unwrap();
        manager.apply(first);

        manager.begin_rotation();
        assert!(manager.rotation_pending());

        // A truncated update never reaches apply, the old keys stay whole
        let next_payload = encode_key_set(1, &sample_pair(3), &sample_pair(4));
        assert!(CipherKeySet::decode(&next_payload[..10]).is_err());

        let plaintext = b"compact measurements";
        let old_pair = sample_pair(1);
        let ciphertext = XorCipher
            .encrypt(&old_pair.key, &old_pair.iv, plaintext)
            .unwrap();
        assert_eq!(
            manager.decrypt(&XorCipher, 0, &ciphertext).unwrap(),
            plaintext
        );

        // The full update swaps both pairs at once
        manager.apply(CipherKeySet::decode(&next_payload).unwrap());
        assert!(!manager.rotation_pending());

        let new_pair = sample_pair(3);
        let ciphertext = XorCipher
            .encrypt(&new_pair.key, &new_pair.iv, plaintext)
            .unwrap();
        assert_eq!(
            manager.decrypt(&XorCipher, 0, &ciphertext).unwrap(),
            plaintext
        );
    }
}
