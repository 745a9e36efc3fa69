use crate::*;
use rand::prelude::*;
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn get_rng() -> impl Rng + Clone {
    let seed: u64 = std::env::var("SEED")
        .map_or_else(|_| thread_rng().gen(), |seed_str| seed_str.parse().unwrap());
    println!("SEED {seed}");
    SmallRng::seed_from_u64(seed)
}

fn test_store() -> (TempDir, Store) {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(StoreOptions::new(dir.path(), "data")).unwrap();
    (dir, store)
}

fn rand_key(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| b'a' + rng.gen_range(0..26u8)).collect()
}

fn get(store: &Store, key: &[u8]) -> Option<KeyValuePair> {
    let mut out = None;
    store
        .view_tx(|tx| {
            out = tx.get(key, None)?;
            Ok(())
        })
        .unwrap();
    out
}

fn put_pairs(store: &Store, pairs: &[(&[u8], &[u8])]) {
    store
        .update_tx(|tx| {
            for (key, value) in pairs {
                tx.put(key, value)?;
            }
            Ok(())
        })
        .unwrap();
}

fn version(store: &Store) -> u64 {
    store.metadata().unwrap().version
}

#[test]
fn test_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}

    assert_send_sync::<Store>();
    assert_send_sync::<Error>();
    assert_send_sync::<StoreOptions>();
}

#[test]
fn put_then_get() {
    let (_dir, store) = test_store();
    assert_eq!(version(&store), 0);
    put_pairs(
        &store,
        &[
            (&b"hello"[..], &b"world"[..]),
            (&b"new"[..], &b"wow!"[..]),
            (&b"again"[..], &b"test!"[..]),
        ],
    );
    assert_eq!(version(&store), 1);
    store
        .view_tx(|tx| {
            assert_eq!(tx.get(b"hello", None)?.unwrap().value, b"world");
            assert_eq!(tx.get(b"new", None)?.unwrap().value, b"wow!");
            assert_eq!(tx.get(b"again", None)?.unwrap().value, b"test!");
            assert_eq!(tx.get(b"absent", None)?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn same_body_overwrite_observes_own_writes() {
    let (_dir, store) = test_store();
    put_pairs(&store, &[(&b"hello"[..], &b"world"[..])]);
    store
        .update_tx(|tx| {
            tx.put(b"asdfasdf", b"add 10")?;
            assert_eq!(tx.get(b"asdfasdf", None)?.unwrap().value, b"add 10");
            tx.put(b"asdfasdf", b"123123")?;
            assert_eq!(tx.get(b"asdfasdf", None)?.unwrap().value, b"123123");
            // the published version is not visible inside the body yet
            Ok(())
        })
        .unwrap();
    assert_eq!(get(&store, b"asdfasdf").unwrap().value, b"123123");
    assert_eq!(version(&store), 2);
}

#[test]
fn range_is_sorted_and_bounded() {
    let (_dir, store) = test_store();
    let keys: &[&[u8]] = &[
        b"hello", b"new", b"again", b"woah", b"key", b"sup", b"final", b"yup",
    ];
    store
        .update_tx(|tx| {
            for key in keys {
                tx.put(key, b"v")?;
            }
            Ok(())
        })
        .unwrap();

    let mut results = Vec::new();
    store
        .view_tx(|tx| {
            results = tx.range(b"hello", b"yup", RangeOpts::default())?;
            Ok(())
        })
        .unwrap();

    let expected: Vec<&[u8]> = {
        let mut sorted: Vec<&[u8]> = keys
            .iter()
            .copied()
            .filter(|k| *k >= b"hello".as_slice() && *k <= b"yup".as_slice())
            .collect();
        sorted.sort();
        sorted
    };
    let got: Vec<&[u8]> = results.iter().map(|p| p.key.as_slice()).collect();
    assert_eq!(got, expected);
    assert!(results.windows(2).all(|w| w[0].key < w[1].key));

    store
        .view_tx(|tx| {
            assert!(tx.range(b"yup", b"hello", RangeOpts::default()).is_err());
            assert_eq!(tx.range(b"a", b"aa", RangeOpts::default())?, vec![]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn keys_differing_at_byte_zero_coexist() {
    let (_dir, store) = test_store();
    put_pairs(
        &store,
        &[(&b"Woah"[..], &b"upper"[..]), (&b"woah"[..], &b"lower"[..])],
    );
    assert_eq!(get(&store, b"Woah").unwrap().value, b"upper");
    assert_eq!(get(&store, b"woah").unwrap().value, b"lower");
    let mut results = Vec::new();
    store
        .view_tx(|tx| {
            results = tx.range(b"A", b"z", RangeOpts::default())?;
            Ok(())
        })
        .unwrap();
    let got: Vec<&[u8]> = results.iter().map(|p| p.key.as_slice()).collect();
    assert_eq!(got, vec![b"Woah".as_slice(), b"woah".as_slice()]);
}

#[test]
fn prefix_families_stay_sorted() {
    let (_dir, store) = test_store();
    // adversarial insertion order: longer keys first so every collision and
    // displacement case in the put path gets exercised
    let keys: &[&[u8]] = &[
        b"ac", b"abc", b"aBc", b"ab", b"a", b"abd", b"b", b"abcd", b"aa",
    ];
    for key in keys {
        put_pairs(&store, &[(*key, *key)]);
    }
    for key in keys {
        assert_eq!(get(&store, key).unwrap().value, *key, "key {key:?}");
    }
    let mut all = Vec::new();
    store
        .view_tx(|tx| {
            all = tx.iterate(&[], usize::MAX, RangeOpts::default())?;
            Ok(())
        })
        .unwrap();
    let mut expected: Vec<&[u8]> = keys.to_vec();
    expected.sort();
    let got: Vec<&[u8]> = all.iter().map(|p| p.key.as_slice()).collect();
    assert_eq!(got, expected);
}

#[test]
fn delete_is_idempotent() {
    let (_dir, store) = test_store();
    put_pairs(&store, &[(&b"keep"[..], &b"1"[..]), (&b"drop"[..], &b"2"[..])]);
    store.update_tx(|tx| tx.delete(b"drop")).unwrap();
    assert_eq!(get(&store, b"drop"), None);
    assert_eq!(get(&store, b"keep").unwrap().value, b"1");
    assert_eq!(version(&store), 2);

    // deleting an absent key succeeds and changes nothing but the version
    store.update_tx(|tx| tx.delete(b"never-there")).unwrap();
    assert_eq!(version(&store), 3);
    assert_eq!(get(&store, b"keep").unwrap().value, b"1");
    assert_eq!(get(&store, b"drop"), None);
}

#[test]
fn delete_contracts_prefix_chains() {
    let (_dir, store) = test_store();
    put_pairs(
        &store,
        &[(&b"aaaa"[..], &b"deep"[..]), (&b"aaab"[..], &b"deeper"[..])],
    );
    store.update_tx(|tx| tx.delete(b"aaab")).unwrap();
    assert_eq!(get(&store, b"aaaa").unwrap().value, b"deep");
    assert_eq!(get(&store, b"aaab"), None);
    store.update_tx(|tx| tx.delete(b"aaaa")).unwrap();
    let mut all = Vec::new();
    store
        .view_tx(|tx| {
            all = tx.iterate(&[], usize::MAX, RangeOpts::default())?;
            Ok(())
        })
        .unwrap();
    assert_eq!(all, vec![]);
}

#[test]
fn iterate_start_and_count() {
    let (_dir, store) = test_store();
    store
        .update_tx(|tx| {
            for b in b'a'..=b'j' {
                tx.put(&[b], &[b])?;
            }
            Ok(())
        })
        .unwrap();
    store
        .view_tx(|tx| {
            let got = tx.iterate(b"c", 3, RangeOpts::default())?;
            let keys: Vec<&[u8]> = got.iter().map(|p| p.key.as_slice()).collect();
            assert_eq!(keys, vec![b"c".as_slice(), b"d", b"e"]);

            assert_eq!(tx.iterate(b"c", 0, RangeOpts::default())?, vec![]);
            assert_eq!(tx.iterate(b"z", 10, RangeOpts::default())?, vec![]);
            // start key between stored keys
            let got = tx.iterate(b"ca", 2, RangeOpts::default())?;
            let keys: Vec<&[u8]> = got.iter().map(|p| p.key.as_slice()).collect();
            assert_eq!(keys, vec![b"d".as_slice(), b"e"]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn min_version_and_transform() {
    let (_dir, store) = test_store();
    put_pairs(&store, &[(&b"alpha"[..], &b"first"[..])]);
    put_pairs(&store, &[(&b"beta"[..], &b"second"[..])]);

    let upper: &TransformFn = &|mut pair: KeyValuePair| {
        pair.value.make_ascii_uppercase();
        pair
    };
    store
        .view_tx(|tx| {
            let recent = tx.range(
                b"a",
                b"z",
                RangeOpts {
                    min_version: Some(2),
                    transform: None,
                },
            )?;
            assert_eq!(recent.len(), 1);
            assert_eq!(recent[0].key, b"beta");
            assert_eq!(recent[0].version, 2);

            let transformed = tx.range(
                b"a",
                b"z",
                RangeOpts {
                    min_version: None,
                    transform: Some(upper),
                },
            )?;
            assert_eq!(transformed[0].value, b"FIRST");
            assert_eq!(transformed[1].value, b"SECOND");

            let pair = tx.get(b"alpha", Some(upper))?.unwrap();
            assert_eq!(pair.value, b"FIRST");
            Ok(())
        })
        .unwrap();
}

#[test]
fn rejects_bad_arguments() {
    let (_dir, store) = test_store();
    let huge = vec![b'k'; usize::from(u16::MAX) + 1];
    store
        .update_tx(|tx| {
            assert!(matches!(tx.put(b"", b"v"), Err(Error::Validation(_))));
            assert!(matches!(tx.delete(b""), Err(Error::Validation(_))));
            assert!(matches!(tx.put(&huge, b"v"), Err(Error::Validation(_))));
            assert_eq!(tx.get(b"", None)?, None);
            Ok(())
        })
        .unwrap();

    store
        .view_tx(|tx| {
            assert!(matches!(
                tx.put(b"k", b"v"),
                Err(Error::WriteTransactionRequired)
            ));
            assert!(matches!(
                tx.delete(b"k"),
                Err(Error::WriteTransactionRequired)
            ));
            assert_eq!(tx.get(b"anything", None)?, None);
            Ok(())
        })
        .unwrap();

    let err = store
        .update_tx(|tx| {
            tx.put(b"ghost", b"value")?;
            Err(Error::validation("user abort"))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    // the aborted body published nothing
    assert_eq!(get(&store, b"ghost"), None);
}

#[test]
fn view_snapshot_isolation() {
    let (_dir, store) = test_store();
    store.update_tx(|tx| tx.put(b"key", b"one")).unwrap();

    let (to_writer, on_view_ready) = mpsc::channel();
    let (to_view, on_write_done) = mpsc::channel();
    std::thread::scope(|s| {
        let store_ref = &store;
        s.spawn(move || {
            store_ref
                .view_tx(|tx| {
                    assert_eq!(tx.get(b"key", None)?.unwrap().value, b"one");
                    to_writer.send(()).unwrap();
                    on_write_done.recv().unwrap();
                    // the concurrent publication must not leak into this snapshot
                    assert_eq!(tx.get(b"key", None)?.unwrap().value, b"one");
                    Ok(())
                })
                .unwrap();
        });
        let store_ref = &store;
        s.spawn(move || {
            on_view_ready.recv().unwrap();
            store_ref.update_tx(|tx| tx.put(b"key", b"two")).unwrap();
            to_view.send(()).unwrap();
        });
    });
    assert_eq!(get(&store, b"key").unwrap().value, b"two");
}

#[test]
fn concurrent_writers_and_readers() {
    const KEYS: usize = 5_000;
    const WRITERS: usize = 2;
    const BATCH: usize = 250;
    const READERS: usize = 4;

    let (_dir, store) = test_store();
    let mut rng = get_rng();
    let mut unique = BTreeSet::new();
    while unique.len() < KEYS {
        unique.insert(rand_key(&mut rng, 32));
    }
    let keys: Vec<Vec<u8>> = unique.into_iter().collect();

    std::thread::scope(|s| {
        for chunk in keys.chunks(KEYS / WRITERS) {
            let store_ref = &store;
            s.spawn(move || {
                for batch in chunk.chunks(BATCH) {
                    store_ref
                        .update_tx(|tx| {
                            for key in batch {
                                tx.put(key, key)?;
                            }
                            Ok(())
                        })
                        .unwrap();
                }
            });
        }
        for reader in 0..READERS as u64 {
            let store_ref = &store;
            let keys_ref = &keys;
            s.spawn(move || {
                let mut rng = SmallRng::seed_from_u64(reader);
                for _ in 0..500 {
                    let key = &keys_ref[rng.gen_range(0..keys_ref.len())];
                    store_ref
                        .view_tx(|tx| {
                            // a racing reader may miss the key, but anything it
                            // sees must be the exact pair the writer put
                            if let Some(pair) = tx.get(key, None)? {
                                assert_eq!(&pair.key, key);
                                assert_eq!(&pair.value, key);
                            }
                            Ok(())
                        })
                        .unwrap();
                }
            });
        }
    });

    // one publication per successful update transaction
    assert_eq!(version(&store), (WRITERS * (KEYS / WRITERS / BATCH)) as u64);
    store
        .view_tx(|tx| {
            for key in &keys {
                assert_eq!(&tx.get(key, None)?.unwrap().value, key);
            }
            let all = tx.iterate(&[], usize::MAX, RangeOpts::default())?;
            assert_eq!(all.len(), KEYS);
            assert!(all.windows(2).all(|w| w[0].key < w[1].key));
            Ok(())
        })
        .unwrap();
}

#[test]
fn reopen_preserves_contents() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut rng = get_rng();
    let mut unique = BTreeSet::new();
    while unique.len() < 500 {
        unique.insert(rand_key(&mut rng, 16));
    }
    let keys: Vec<Vec<u8>> = unique.into_iter().collect();

    let meta_before;
    {
        let store = Store::open(StoreOptions::new(dir.path(), "data")).unwrap();
        for batch in keys.chunks(50) {
            store
                .update_tx(|tx| {
                    for key in batch {
                        tx.put(key, key)?;
                    }
                    Ok(())
                })
                .unwrap();
        }
        meta_before = store.metadata().unwrap();
        store.close().unwrap();
    }

    let store = Store::open(StoreOptions::new(dir.path(), "data")).unwrap();
    let meta = store.metadata().unwrap();
    assert_eq!(meta, meta_before);
    assert!(store.file_size().unwrap() >= meta.next_free);
    store
        .view_tx(|tx| {
            for key in &keys {
                assert_eq!(&tx.get(key, None)?.unwrap().value, key);
            }
            Ok(())
        })
        .unwrap();
    store.remove().unwrap();
    assert!(!dir.path().join("data").exists());
}

#[test]
fn closed_store_errors() {
    let (_dir, store) = test_store();
    store.close().unwrap();
    assert!(matches!(store.metadata(), Err(Error::StoreClosed)));
    assert!(matches!(
        store.update_tx(|tx| tx.put(b"k", b"v")),
        Err(Error::StoreClosed)
    ));
    assert!(matches!(store.view_tx(|_| Ok(())), Err(Error::StoreClosed)));
    // close is idempotent
    store.close().unwrap();
}

#[test]
fn compaction_rebuilds_live_set() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut opts = StoreOptions::new(dir.path(), "data");
    // fires exactly once, on the publication of the delete below
    opts.set_compact_trigger(Some(Box::new(|meta| meta.version >= 6)));
    let store = Store::open(opts).unwrap();

    for i in 0..5u32 {
        let key = format!("key-{i}");
        store
            .update_tx(|tx| tx.put(key.as_bytes(), &i.to_le_bytes()))
            .unwrap();
    }
    let tail_before = store.metadata().unwrap().next_free;
    store.update_tx(|tx| tx.delete(b"key-2")).unwrap();

    // the trigger fired on publication; wait for the worker to swap files
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let meta = store.metadata().unwrap();
        if meta.version < 6 {
            break;
        }
        assert!(Instant::now() < deadline, "compaction never completed");
        std::thread::sleep(Duration::from_millis(10));
    }

    let meta = store.metadata().unwrap();
    assert!(meta.next_free < tail_before);
    store
        .view_tx(|tx| {
            for i in [0u32, 1, 3, 4] {
                let key = format!("key-{i}");
                let pair = tx.get(key.as_bytes(), None)?.unwrap();
                assert_eq!(pair.value, i.to_le_bytes());
                // the rebuilt file starts over at version 0
                assert_eq!(pair.version, 0);
            }
            assert_eq!(tx.get(b"key-2", None)?, None);
            Ok(())
        })
        .unwrap();

    // the store keeps working after the swap
    let base = version(&store);
    store.update_tx(|tx| tx.put(b"after", b"compaction")).unwrap();
    assert_eq!(version(&store), base + 1);
    assert_eq!(get(&store, b"after").unwrap().value, b"compaction");
    // no stray compaction files
    assert!(!dir.path().join("datatemp").exists());
    assert!(!dir.path().join("dataswap").exists());
}

#[test]
fn append_only_disables_compaction() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut opts = StoreOptions::new(dir.path(), "data");
    opts.append_only = true;
    opts.set_compact_trigger(Some(Box::new(|_| true)));
    let store = Store::open(opts).unwrap();
    for i in 0..10u32 {
        store
            .update_tx(|tx| tx.put(&i.to_le_bytes(), b"v"))
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    // versions only ever move forward
    assert_eq!(version(&store), 10);
}

#[test]
fn grows_past_the_initial_region() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut opts = StoreOptions::new(dir.path(), "data");
    opts.append_only = true;
    let store = Store::open(opts).unwrap();

    let value = vec![0xabu8; 3 * 1024 * 1024];
    const PUTS: u32 = 25;
    for i in 0..PUTS {
        let key = format!("big-{i:04}");
        store
            .update_tx(|tx| tx.put(key.as_bytes(), &value))
            .unwrap();
    }
    let meta = store.metadata().unwrap();
    assert!(meta.next_free > region_len_for_test());
    assert!(store.file_size().unwrap() > region_len_for_test());
    assert_eq!(meta.version, u64::from(PUTS));
    store
        .view_tx(|tx| {
            for i in 0..PUTS {
                let key = format!("big-{i:04}");
                let pair = tx.get(key.as_bytes(), None)?.unwrap();
                assert_eq!(pair.value.len(), value.len());
                assert_eq!(pair.value, value);
            }
            Ok(())
        })
        .unwrap();
}

fn region_len_for_test() -> u64 {
    crate::region::INITIAL_REGION_LEN
}

#[test]
fn single_key_ranges() {
    let (_dir, store) = test_store();
    put_pairs(
        &store,
        &[
            (&b"a"[..], &b"1"[..]),
            (&b"ab"[..], &b"2"[..]),
            (&b"abc"[..], &b"3"[..]),
        ],
    );
    store
        .view_tx(|tx| {
            for key in [&b"a"[..], b"ab", b"abc"] {
                let got = tx.range(key, key, RangeOpts::default())?;
                assert_eq!(got.len(), 1, "range [{key:?}, {key:?}]");
                assert_eq!(got[0].key, key);
            }
            // an empty interval strictly between keys
            assert_eq!(tx.range(b"aba", b"abb", RangeOpts::default())?, vec![]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn overwrites_keep_one_entry() {
    let (_dir, store) = test_store();
    put_pairs(&store, &[(&b"dup"[..], &b"one"[..])]);
    put_pairs(&store, &[(&b"dup"[..], &b"two"[..])]);
    let pair = get(&store, b"dup").unwrap();
    assert_eq!(pair.value, b"two");
    assert_eq!(pair.version, 2);
    store
        .view_tx(|tx| {
            let all = tx.iterate(&[], usize::MAX, RangeOpts::default())?;
            assert_eq!(all.len(), 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn empty_values_round_trip() {
    let (_dir, store) = test_store();
    put_pairs(&store, &[(&b"void"[..], &b""[..])]);
    let pair = get(&store, b"void").unwrap();
    assert_eq!(pair.key, b"void");
    assert_eq!(pair.value, b"");
}

#[test]
fn deep_common_prefixes() {
    let (_dir, store) = test_store();
    let prefix = b"shared/prefix/that/runs/deep/".to_vec();
    let mut keys = Vec::new();
    for suffix in [&b"alpha"[..], b"beta", b"gamma", b""] {
        let mut key = prefix.clone();
        key.extend_from_slice(suffix);
        keys.push(key);
    }
    store
        .update_tx(|tx| {
            for key in &keys {
                tx.put(key, key)?;
            }
            Ok(())
        })
        .unwrap();
    store
        .view_tx(|tx| {
            for key in &keys {
                assert_eq!(&tx.get(key, None)?.unwrap().value, key);
            }
            let all = tx.range(&prefix, b"shared/prefix/that/runs/deep0", RangeOpts::default())?;
            assert_eq!(all.len(), keys.len());
            assert!(all.windows(2).all(|w| w[0].key < w[1].key));
            Ok(())
        })
        .unwrap();
}

#[test]
fn iterate_honors_min_version() {
    let (_dir, store) = test_store();
    put_pairs(&store, &[(&b"old"[..], &b"v"[..])]);
    put_pairs(&store, &[(&b"recent"[..], &b"v"[..])]);
    store
        .view_tx(|tx| {
            let got = tx.iterate(
                &[],
                usize::MAX,
                RangeOpts {
                    min_version: Some(2),
                    transform: None,
                },
            )?;
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].key, b"recent");
            Ok(())
        })
        .unwrap();
}

#[test]
fn remove_then_open_starts_fresh() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::open(StoreOptions::new(dir.path(), "data")).unwrap();
        put_pairs(&store, &[(&b"gone"[..], &b"soon"[..])]);
        store.remove().unwrap();
    }
    let store = Store::open(StoreOptions::new(dir.path(), "data")).unwrap();
    assert_eq!(version(&store), 0);
    assert_eq!(get(&store, b"gone"), None);
    assert!(store.file_size().unwrap() >= store.metadata().unwrap().next_free);
}
