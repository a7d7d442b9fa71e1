//! Byte-string keys on top of a [`HashFile`]
//!
//! Records are framed as `key_len:u16 LE | key | value` and stored under
//! [`hash_key`]`(key)`, so keys whose hashes collide are told apart by the
//! stored key.

use super::cursor::Cursor;
use super::hash_file::HashFile;
use super::hash_key;
use super::page::max_record_len;
use crate::error::{Error, Result};

/// Frame a key/value pair as one record
pub fn frame(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    let key_len = u16::try_from(key.len()).map_err(|_| Error::RecordTooLarge {
        len: key.len(),
        max: u16::MAX as usize,
    })?;
    let mut record = Vec::with_capacity(2 + key.len() + value.len());
    record.extend_from_slice(&key_len.to_le_bytes());
    record.extend_from_slice(key);
    record.extend_from_slice(value);
    Ok(record)
}

/// Split a framed record into key and value
pub fn unframe(record: &[u8]) -> Result<(&[u8], &[u8])> {
    if record.len() < 2 {
        return Err(Error::Corrupt(format!("keyed record of {} bytes", record.len())));
    }
    let key_len = u16::from_le_bytes([record[0], record[1]]) as usize;
    if record.len() < 2 + key_len {
        return Err(Error::Corrupt(format!(
            "keyed record of {} bytes claims a {} byte key",
            record.len(),
            key_len
        )));
    }
    Ok(record[2..].split_at(key_len))
}

impl HashFile {
    /// Value stored under `key`
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.locate(key)? {
            Some((_, record)) => Ok(Some(unframe(&record)?.1.to_vec())),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing any previous value
    ///
    /// Returns `true` if a previous value was replaced.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let record = frame(key, value)?;
        let max = max_record_len(self.config().page_size);
        if record.len() > max {
            return Err(Error::RecordTooLarge {
                len: record.len(),
                max,
            });
        }
        let replaced = self.delete(key)?;
        self.insert(hash_key(key), &record)?;
        Ok(replaced)
    }

    /// Remove `key`. Returns `false` if it was not present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        match self.locate(key)? {
            Some((cursor, _)) => {
                self.remove(&cursor)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn locate(&mut self, key: &[u8]) -> Result<Option<(Cursor, Vec<u8>)>> {
        let hash = hash_key(key);
        let mut next = self.find_first(hash)?;
        while let Some(cursor) = next {
            let record = self.copy(&cursor)?;
            if unframe(&record)?.0 == key {
                return Ok(Some((cursor, record)));
            }
            next = self.find_next(&cursor, hash)?;
        }
        Ok(None)
    }
}
