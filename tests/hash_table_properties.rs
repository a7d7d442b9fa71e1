//! Property tests for the in-memory hash table and directory

use hashstore::storage::{Directory, HashTable};
use hashstore::TableConfig;
use proptest::prelude::*;
use std::collections::HashMap;

fn table(page_size: usize) -> HashTable {
    HashTable::with_config(&TableConfig {
        page_size,
        probe_seed: Some(17),
    })
    .expect("valid table config")
}

/// Every record stored under `hash`, in probe order
fn records_for(table: &mut HashTable, hash: u32) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = table.find_first(hash).expect("find_first");
    while let Some(c) = cursor {
        out.push(table.copy(&c).expect("copy"));
        cursor = table.find_next(&c, hash).expect("find_next");
    }
    out
}

fn group(records: &[(u32, Vec<u8>)]) -> HashMap<u32, Vec<Vec<u8>>> {
    let mut expected: HashMap<u32, Vec<Vec<u8>>> = HashMap::new();
    for (hash, bytes) in records {
        expected.entry(*hash).or_default().push(bytes.clone());
    }
    for values in expected.values_mut() {
        values.sort();
    }
    expected
}

proptest! {
    /// Whatever goes in comes back out under the same hash
    #[test]
    fn inserted_records_round_trip(
        records in prop::collection::vec((any::<u32>(), prop::collection::vec(any::<u8>(), 0..200)), 1..300)
    ) {
        let mut table = table(2048);
        for (hash, bytes) in &records {
            table.insert(*hash, bytes).expect("insert");
        }
        prop_assert_eq!(table.len(), records.len());

        for (hash, expected) in group(&records) {
            let mut found = records_for(&mut table, hash);
            found.sort();
            prop_assert_eq!(found, expected);
        }
    }

    /// Duplicate hashes behave as a multiset, including after removals
    #[test]
    fn duplicate_hashes_form_a_multiset(
        records in prop::collection::vec((0u32..6, prop::collection::vec(any::<u8>(), 0..64)), 1..60),
        removals in prop::collection::vec(0u32..6, 0..20)
    ) {
        let pool = [0x0000_0001u32, 0x4000_0001, 0x8000_0001, 0xC000_0001, 0x1234_5678, 0xFFFF_FFFF];
        let records: Vec<(u32, Vec<u8>)> = records
            .into_iter()
            .map(|(i, bytes)| (pool[i as usize], bytes))
            .collect();

        let mut table = table(8192);
        for (hash, bytes) in &records {
            table.insert(*hash, bytes).expect("insert");
        }

        let mut expected = group(&records);
        for i in removals {
            let hash = pool[i as usize];
            if let Some(cursor) = table.find_first(hash).expect("find_first") {
                let bytes = table.copy(&cursor).expect("copy");
                table.remove(&cursor).expect("remove");
                let values = expected.get_mut(&hash).expect("hash was inserted");
                let at = values.iter().position(|v| *v == bytes).expect("value was inserted");
                values.remove(at);
            }
        }

        for hash in pool {
            let mut found = records_for(&mut table, hash);
            found.sort();
            prop_assert_eq!(found, expected.remove(&hash).unwrap_or_default());
        }
    }

    /// Hashes that agree on their low bits still spread out and terminate
    #[test]
    fn colliding_low_bits_grow_boundedly(highs in prop::collection::vec(any::<u16>(), 1..400)) {
        let mut table = table(1024);
        for (i, high) in highs.iter().enumerate() {
            let hash = (u32::from(*high) << 16) | 0xBEEF;
            table.insert(hash, &(i as u32).to_le_bytes()).expect("insert");
        }
        let stats = table.stats();
        prop_assert!(stats.directory_depth <= 32);
        prop_assert_eq!(stats.entries, highs.len() as u64);

        for (i, high) in highs.iter().enumerate() {
            let hash = (u32::from(*high) << 16) | 0xBEEF;
            let found = records_for(&mut table, hash);
            prop_assert!(found.contains(&(i as u32).to_le_bytes().to_vec()));
        }
    }

    /// Doubling never changes which page a hash resolves to
    #[test]
    fn doubling_is_transparent(
        entries in prop::collection::vec(any::<u64>(), 8),
        hashes in prop::collection::vec(any::<u32>(), 1..64)
    ) {
        let mut dir = Directory::from_entries(3, entries).expect("eight entries");
        let before: Vec<u64> = hashes.iter().map(|&h| dir.resolve(h)).collect();
        dir.double();
        dir.double();
        let after: Vec<u64> = hashes.iter().map(|&h| dir.resolve(h)).collect();
        prop_assert_eq!(before, after);
    }
}
