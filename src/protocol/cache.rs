use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use uuid::Uuid;

use super::message::OperationalEncoding;
use crate::core::{Error, MeasurementKey, Result};

/// Bidirectional mapping between compact 16-bit signal indices and full
/// measurement identities.
///
/// Both directions are owned by one structure so they can never drift apart:
/// entries are only added through [`SignalIndexCache::from_entries`] or
/// [`SignalIndexCache::decode`], and a server-pushed update replaces the
/// whole cache, never merges into it. A signal index is only meaningful
/// within the cache generation that defined it.
#[derive(Debug, Default, Clone)]
pub struct SignalIndexCache {
    subscriber_id: Uuid,
    by_index: HashMap<u16, MeasurementKey>,
    by_signal: HashMap<Uuid, u16>,
    unauthorized_ids: Vec<Uuid>,
}

impl SignalIndexCache {
    /// Creates an empty cache
    pub fn new() -> Self {
        SignalIndexCache::default()
    }

    /// Builds a cache from index/key pairs, keeping both directions
    /// consistent. Fails on a duplicate index or signal id.
    pub fn from_entries(
        subscriber_id: Uuid,
        entries: impl IntoIterator<Item = (u16, MeasurementKey)>,
    ) -> Result<Self> {
        let mut cache = SignalIndexCache {
            subscriber_id,
            ..Default::default()
        };

        for (index, key) in entries {
            cache.insert(index, key)?;
        }

        Ok(cache)
    }

    fn insert(&mut self, index: u16, key: MeasurementKey) -> Result<()> {
        if self.by_index.contains_key(&index) {
            return Err(Error::framing(format!("duplicate signal index {}", index)));
        }

        if self.by_signal.contains_key(&key.signal_id()) {
            return Err(Error::framing(format!(
                "duplicate signal id {}",
                key.signal_id()
            )));
        }

        self.by_signal.insert(key.signal_id(), index);
        self.by_index.insert(index, key);
        Ok(())
    }

    /// Resolves a compact signal index to its measurement key
    pub fn key_for(&self, index: u16) -> Option<&MeasurementKey> {
        self.by_index.get(&index)
    }

    /// Resolves a signal id to its compact index
    pub fn index_of(&self, signal_id: Uuid) -> Option<u16> {
        self.by_signal.get(&signal_id).copied()
    }

    /// Returns the subscriber id the publisher stamped on this cache
    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    /// Signal ids the subscriber requested but is not authorized to receive
    pub fn unauthorized_ids(&self) -> &[Uuid] {
        &self.unauthorized_ids
    }

    /// Number of mapped signals
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Returns true when no signals are mapped
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// Serializes the cache into the common cross-implementation format
    pub fn encode(&self, encoding: OperationalEncoding) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_slice(self.subscriber_id.as_bytes());
        body.put_u32(self.by_index.len() as u32);

        // Deterministic order keeps the image reproducible
        let mut indices: Vec<u16> = self.by_index.keys().copied().collect();
        indices.sort_unstable();

        for index in indices {
            let key = &self.by_index[&index];
            let source = encoding.encode(key.source());

            body.put_u16(index);
            body.put_slice(key.signal_id().as_bytes());
            body.put_u32(source.len() as u32);
            body.put_slice(&source);
            body.put_u32(key.id());
        }

        body.put_u32(self.unauthorized_ids.len() as u32);

        for id in &self.unauthorized_ids {
            body.put_slice(id.as_bytes());
        }

        let mut image = BytesMut::with_capacity(body.len() + 4);
        image.put_u32((body.len() + 4) as u32);
        image.put_slice(&body);
        image.to_vec()
    }

    /// Deserializes a cache image in the common cross-implementation format
    pub fn decode(bytes: &[u8], encoding: OperationalEncoding) -> Result<Self> {
        let mut buf = bytes;

        if buf.remaining() < 24 {
            return Err(Error::framing("signal index cache image too short"));
        }

        let image_length = buf.get_u32() as usize;

        if image_length != bytes.len() {
            return Err(Error::framing(format!(
                "signal index cache length mismatch: header says {}, got {}",
                image_length,
                bytes.len()
            )));
        }

        let subscriber_id = read_uuid(&mut buf)?;
        let reference_count = buf.get_u32();

        let mut cache = SignalIndexCache {
            subscriber_id,
            ..Default::default()
        };

        for _ in 0..reference_count {
            if buf.remaining() < 26 {
                return Err(Error::framing("truncated signal index cache entry"));
            }

            let index = buf.get_u16();
            let signal_id = read_uuid(&mut buf)?;
            let source_length = buf.get_u32() as usize;

            if buf.remaining() < source_length + 4 {
                return Err(Error::framing("truncated signal index cache entry"));
            }

            let source = encoding.decode(&buf[..source_length])?;
            buf.advance(source_length);
            let id = buf.get_u32();

            cache.insert(index, MeasurementKey::new(signal_id, source, id)?)?;
        }

        if buf.remaining() < 4 {
            return Err(Error::framing("truncated unauthorized id list"));
        }

        let unauthorized_count = buf.get_u32();

        for _ in 0..unauthorized_count {
            cache.unauthorized_ids.push(read_uuid(&mut buf)?);
        }

        Ok(cache)
    }
}

fn read_uuid(buf: &mut &[u8]) -> Result<Uuid> {
    if buf.remaining() < 16 {
        return Err(Error::framing("truncated uuid field"));
    }

    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> SignalIndexCache {
        let entries = (1u16..=3)
            .map(|i| {
                (
                    i,
                    MeasurementKey::new(Uuid::new_v4(), "PPA", i as u32).unwrap(),
                )
            })
            .collect::<Vec<_>>();
        SignalIndexCache::from_entries(Uuid::new_v4(), entries).unwrap()
    }

    #[test]
    fn test_bidirectional_consistency() {
        let cache = sample_cache();

        for index in 1u16..=3 {
            let key = cache.key_for(index).unwrap();
            assert_eq!(cache.index_of(key.signal_id()), Some(index));
        }

        assert_eq!(cache.key_for(99), None);
        assert_eq!(cache.index_of(Uuid::new_v4()), None);
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let signal_id = Uuid::new_v4();
        let a = MeasurementKey::new(signal_id, "PPA", 1).unwrap();
        let b = MeasurementKey::new(signal_id, "PPA", 2).unwrap();

        assert!(SignalIndexCache::from_entries(Uuid::new_v4(), vec![(1, a), (2, b)]).is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let cache = sample_cache();
        let image = cache.encode(OperationalEncoding::Utf8);
        let decoded = SignalIndexCache::decode(&image, OperationalEncoding::Utf8).unwrap();

        assert_eq!(decoded.subscriber_id(), cache.subscriber_id());
        assert_eq!(decoded.len(), cache.len());

        for index in 1u16..=3 {
            let original = cache.key_for(index).unwrap();
            let round_tripped = decoded.key_for(index).unwrap();
            assert_eq!(round_tripped.signal_id(), original.signal_id());
            assert_eq!(round_tripped.source(), original.source());
            assert_eq!(round_tripped.id(), original.id());
        }
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let cache = sample_cache();
        let mut image = cache.encode(OperationalEncoding::Utf8);
        image.truncate(image.len() - 1);

        assert!(SignalIndexCache::decode(&image, OperationalEncoding::Utf8).is_err());
    }

    #[test]
    fn test_replacement_invalidates_old_indices() {
        // A wholesale replacement drops every index of the prior generation
        let old = sample_cache();
        let replacement = SignalIndexCache::from_entries(
            Uuid::new_v4(),
            vec![(
                10,
                MeasurementKey::new(Uuid::new_v4(), "STAT", 1).unwrap(),
            )],
        )
        .unwrap();

        assert!(old.key_for(1).is_some());
        assert!(replacement.key_for(1).is_none());
        assert!(replacement.key_for(10).is_some());
    }
}
