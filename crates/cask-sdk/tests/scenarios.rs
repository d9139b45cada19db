//! End-to-end scenarios across store, indexes, lineages, and resolver.

use std::sync::Arc;
use std::thread;

use cask_sdk::{
    schema_envelope, Advance, Cask, CaskConfig, EnvelopeBuilder, EnvelopeId, ErrorKind,
    IndexValue, Timestamp,
};
use cask_store::{EnvelopeStore, FileEnvelopeStore, FileOptions, StoreError};
use proptest::prelude::*;

fn post_schema(cask: &Cask) -> EnvelopeId {
    let schema = cask
        .seal(schema_envelope("post", &b"{\"title\":\"string\"}"[..]))
        .unwrap();
    cask.put(&schema).unwrap().id
}

// -----------------------------------------------------------------------
// Identity and deduplication
// -----------------------------------------------------------------------

#[test]
fn identity_is_deterministic() {
    let schema = EnvelopeId::from_hash([7; 32]);
    let author = EnvelopeId::from_hash([1; 32]);
    let build = || {
        EnvelopeBuilder::new(schema, &b"body"[..])
            .relate("author", author)
            .field("title", "hello")
            .field("rank", 3i64)
            .build()
            .unwrap()
    };
    let (a, b) = (build(), build());
    assert_eq!(a.id(), b.id());
    assert_eq!(a.as_bytes(), b.as_bytes());
}

#[test]
fn putting_twice_stores_once() {
    let cask = Cask::in_memory();
    let schema = post_schema(&cask);
    let a = cask
        .seal(EnvelopeBuilder::new(schema, &b"A"[..]).field("title", "a"))
        .unwrap();

    let first = cask.put(&a).unwrap();
    let count = cask.len().unwrap();
    let second = cask.put(&a).unwrap();

    assert_eq!(first.id, second.id);
    assert!(second.deduplicated);
    assert_eq!(cask.len().unwrap(), count);
    assert_eq!(cask.find_exact("title", "a").unwrap(), vec![a.id()]);
}

// -----------------------------------------------------------------------
// Version chains
// -----------------------------------------------------------------------

#[test]
fn superseding_keeps_the_original_and_moves_the_head() {
    let cask = Cask::in_memory();
    let schema = post_schema(&cask);
    let a = cask
        .seal(EnvelopeBuilder::new(schema, &b"A"[..]).field("tag", vec!["x"]))
        .unwrap();
    cask.put(&a).unwrap();
    let b = cask
        .seal(
            EnvelopeBuilder::new(schema, &b"B"[..])
                .previous(a.id())
                .field("tag", vec!["y"]),
        )
        .unwrap();
    let receipt = cask.put(&b).unwrap();
    assert_eq!(receipt.advance, Advance::Extended { previous: a.id() });

    assert_eq!(cask.get(&a.id()).unwrap(), a);
    assert_eq!(cask.find_tagged("tag", "x").unwrap(), vec![a.id()]);
    assert_eq!(cask.find_tagged("tag", "y").unwrap(), vec![b.id()]);
    assert_eq!(cask.head_of(&a.id()).unwrap(), b.id());
    assert_eq!(cask.history(&b.id()).unwrap(), vec![b.id(), a.id()]);
}

#[test]
fn previous_must_already_be_stored() {
    let cask = Cask::in_memory();
    let schema = post_schema(&cask);
    let a = cask.seal(EnvelopeBuilder::new(schema, &b"A"[..])).unwrap();
    let b = cask
        .seal(EnvelopeBuilder::new(schema, &b"B"[..]).previous(a.id()))
        .unwrap();

    assert_eq!(cask.put(&b).unwrap_err().kind(), ErrorKind::Encoding);
    cask.put(&a).unwrap();
    cask.put(&b).unwrap();
    assert_eq!(cask.head_of(&a.id()).unwrap(), b.id());
}

#[test]
fn tombstone_marks_lineage_deleted() {
    let cask = Cask::in_memory();
    let schema = post_schema(&cask);
    let x = cask.seal(EnvelopeBuilder::new(schema, &b"X"[..])).unwrap();
    cask.put(&x).unwrap();
    assert!(!cask.is_deleted(&x.id()).unwrap());

    let t = cask.tombstone(&x.id()).unwrap();
    assert!(cask.is_deleted(&x.id()).unwrap());
    assert_eq!(cask.head_of(&x.id()).unwrap(), t.id);
    assert!(cask.contains(&x.id()).unwrap());
}

#[test]
fn concurrent_versions_fork_instead_of_losing_one() {
    let cask = Arc::new(Cask::in_memory());
    let schema = post_schema(&cask);
    let root = cask.seal(EnvelopeBuilder::new(schema, &b"root"[..])).unwrap();
    cask.put(&root).unwrap();

    let handles: Vec<_> = (0..6u8)
        .map(|n| {
            let cask = Arc::clone(&cask);
            let root = root.id();
            thread::spawn(move || {
                let env = cask
                    .seal(EnvelopeBuilder::new(schema, vec![n]).previous(root))
                    .unwrap();
                cask.put(&env).unwrap()
            })
        })
        .collect();
    let receipts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(
        receipts.iter().filter(|r| r.forked_heads().is_some()).count(),
        5
    );
    assert_eq!(cask.heads_of(&root.id()).unwrap().len(), 6);
    assert_eq!(cask.head_of(&root.id()).unwrap_err().kind(), ErrorKind::ForkDetected);
}

// -----------------------------------------------------------------------
// Relationships
// -----------------------------------------------------------------------

#[test]
fn forward_reference_to_missing_envelope() {
    let cask = Cask::in_memory();
    let schema = post_schema(&cask);
    let d = cask.seal(EnvelopeBuilder::new(schema, &b"D"[..])).unwrap();
    let c = cask
        .seal(EnvelopeBuilder::new(schema, &b"C"[..]).relate("author", d.id()))
        .unwrap();

    cask.put(&c).unwrap();
    let referrers = cask.referrers(&d.id());
    assert_eq!(referrers.len(), 1);
    assert_eq!(referrers[0].source, c.id());
    assert_eq!(referrers[0].relation, "author");
    assert_eq!(cask.get(&d.id()).unwrap_err().kind(), ErrorKind::NotFound);

    cask.put(&d).unwrap();
    assert_eq!(cask.get(&d.id()).unwrap(), d);
    assert_eq!(cask.referrers_via(&d.id(), "author"), vec![c.id()]);
    assert_eq!(cask.targets(&c.id(), "author").unwrap(), vec![d.id()]);
}

// -----------------------------------------------------------------------
// Queries
// -----------------------------------------------------------------------

#[test]
fn range_scan_over_timestamps() {
    let cask = Cask::in_memory();
    let schema = post_schema(&cask);
    let at = |ms: i64| {
        let env = cask
            .seal(
                EnvelopeBuilder::new(schema, ms.to_be_bytes().to_vec())
                    .field("published", Timestamp::from_millis(ms)),
            )
            .unwrap();
        cask.put(&env).unwrap().id
    };
    let ids: Vec<EnvelopeId> = [100, 200, 300, 400].into_iter().map(at).collect();

    let hits = cask
        .find_range(
            "published",
            IndexValue::Timestamp(Timestamp::from_millis(150))
                ..=IndexValue::Timestamp(Timestamp::from_millis(300)),
        )
        .unwrap();
    assert_eq!(hits, vec![ids[1], ids[2]]);
    assert_eq!(
        cask.find_range("published", ..).unwrap_err().kind(),
        ErrorKind::Encoding
    );
}

// -----------------------------------------------------------------------
// Persistence and recovery
// -----------------------------------------------------------------------

#[test]
fn reopened_cask_answers_the_same_queries() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b, snapshot) = {
        let cask = Cask::open(CaskConfig::in_dir(dir.path())).unwrap();
        let schema = post_schema(&cask);
        let a = cask
            .seal(EnvelopeBuilder::new(schema, &b"A"[..]).field("tag", vec!["x"]))
            .unwrap();
        cask.put(&a).unwrap();
        let b = cask
            .seal(EnvelopeBuilder::new(schema, &b"B"[..]).previous(a.id()))
            .unwrap();
        cask.put(&b).unwrap();
        (a, b, cask.index().snapshot())
    };

    let cask = Cask::open(CaskConfig::in_dir(dir.path())).unwrap();
    assert_eq!(cask.index().snapshot(), snapshot);
    assert_eq!(cask.get(&a.id()).unwrap(), a);
    assert_eq!(cask.head_of(&a.id()).unwrap(), b.id());
    assert_eq!(cask.find_tagged("tag", "x").unwrap(), vec![a.id()]);
}

#[test]
fn lineages_are_rebuilt_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = {
        let cask = Cask::open(CaskConfig::in_dir(dir.path())).unwrap();
        let schema = post_schema(&cask);
        let a = cask.seal(EnvelopeBuilder::new(schema, &b"A"[..])).unwrap();
        cask.put(&a).unwrap();
        let b = cask
            .seal(EnvelopeBuilder::new(schema, &b"B"[..]).previous(a.id()))
            .unwrap();
        cask.put(&b).unwrap();
        (a, b)
    };
    let snapshot = dir.path().join(cask_sdk::LINEAGE_FILE);
    for path in [cask_refs::journal_path_for(&snapshot), snapshot] {
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
    }

    let cask = Cask::open(CaskConfig::in_dir(dir.path())).unwrap();
    assert_eq!(cask.head_of(&a.id()).unwrap(), b.id());
}

#[test]
fn lineage_writes_per_put_do_not_grow_with_the_table() {
    let dir = tempfile::tempdir().unwrap();
    let cask = Cask::open(CaskConfig::in_dir(dir.path())).unwrap();
    let schema = post_schema(&cask);
    let journal = cask_refs::journal_path_for(&dir.path().join(cask_sdk::LINEAGE_FILE));
    let journal_growth = |body: u32| {
        let env = cask
            .seal(EnvelopeBuilder::new(schema, body.to_be_bytes().to_vec()))
            .unwrap();
        let before = std::fs::metadata(&journal).unwrap().len();
        cask.put(&env).unwrap();
        std::fs::metadata(&journal).unwrap().len() - before
    };

    let early = journal_growth(0);
    for body in 1..400 {
        journal_growth(body);
    }
    let late = journal_growth(400);
    assert_eq!(early, late);

    // Compaction folds the journal into the snapshot.
    cask.compact().unwrap();
    assert_eq!(std::fs::metadata(&journal).unwrap().len(), 0);
    assert!(dir.path().join(cask_sdk::LINEAGE_FILE).exists());
}

#[test]
fn corrupted_bytes_are_quarantined_not_served() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileEnvelopeStore::open(dir.path(), FileOptions::default()).unwrap();
    let env = EnvelopeBuilder::new(EnvelopeId::null(), &b"precious payload"[..])
        .build()
        .unwrap();
    store.insert(&env).unwrap();

    // Flip a payload byte inside the only frame of the log.
    let log = dir.path().join(cask_store::LOG_FILE);
    let mut bytes = std::fs::read(&log).unwrap();
    let needle = b"precious";
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    bytes[at] ^= 0x20;
    std::fs::write(&log, &bytes).unwrap();

    assert!(store.read(&env.id()).is_err());
    assert_eq!(store.quarantined(), vec![env.id()]);
    assert!(matches!(
        store.read(&env.id()),
        Err(StoreError::Quarantined(id)) if id == env.id()
    ));

    // A verified copy lifts the quarantine.
    store.insert(&env).unwrap();
    assert_eq!(store.read(&env.id()).unwrap(), Some(env));
    assert!(store.quarantined().is_empty());
}

// -----------------------------------------------------------------------
// Properties
// -----------------------------------------------------------------------

proptest! {
    #[test]
    fn rebuild_equals_incremental(
        titles in proptest::collection::vec("[a-c]{1,3}", 1..16),
        chain_mask in proptest::collection::vec(any::<bool>(), 16),
    ) {
        let cask = Cask::in_memory();
        let schema = post_schema(&cask);
        let mut last: Option<EnvelopeId> = None;
        for (n, (title, chained)) in titles.iter().zip(&chain_mask).enumerate() {
            let mut builder = EnvelopeBuilder::new(schema, (n as u32).to_be_bytes().to_vec())
                .field("title", title.as_str())
                .field("tags", vec![title.as_str(), "all"]);
            if let (true, Some(previous)) = (*chained, last) {
                builder = builder.previous(previous);
            }
            let env = cask.seal(builder).unwrap();
            cask.put(&env).unwrap();
            last = Some(env.id());
        }

        let incremental = cask.index().snapshot();
        cask.rebuild_indexes().unwrap();
        prop_assert_eq!(cask.index().snapshot(), incremental);
        prop_assert!(cask.check_consistency().unwrap().is_consistent());
    }
}
