use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use cask_dag::{resolve_type_chain, Reachability, RelationshipGraph, TypeChain, VersionResolver};
use cask_envelope::{Envelope, EnvelopeBuilder, EnvelopeError, Relationship};
use cask_index::{ConsistencyReport, EnvelopeIndex, Referrer, RepairReport};
use cask_refs::{FileLineageStore, InMemoryLineageStore, Lineage, LineageStore, LineageTracker};
use cask_store::{EnvelopeStore, InMemoryEnvelopeStore};
use cask_types::{EnvelopeId, IndexValue};
use tracing::{debug, info, warn};

use crate::config::CaskConfig;
use crate::error::{SdkError, SdkResult};
use crate::receipt::{CompactionReport, PutReceipt};

/// A content-addressed envelope store with its indexes and lineage table.
///
/// The store is the source of truth. Indexes live in memory and are rebuilt
/// from the store on open; the lineage table is rebuilt too whenever it lags
/// behind the store.
pub struct Cask {
    config: CaskConfig,
    store: Arc<dyn EnvelopeStore>,
    index: Arc<EnvelopeIndex>,
    lineages: LineageTracker,
    resolver: VersionResolver,
    graph: RelationshipGraph,
}

impl Cask {
    /// Open the backends named by `config`.
    pub fn open(config: CaskConfig) -> SdkResult<Self> {
        let store = config.store.open()?;
        let lineages: Arc<dyn LineageStore> = match &config.lineage_path {
            Some(path) => Arc::new(FileLineageStore::open_with(path, config.store.sync_mode)?),
            None => Arc::new(InMemoryLineageStore::new()),
        };
        Self::with_backends(config, store, lineages)
    }

    /// An empty, purely in-memory cask.
    pub fn in_memory() -> Self {
        Self::assemble(
            CaskConfig::default(),
            Arc::new(InMemoryEnvelopeStore::new()),
            Arc::new(InMemoryLineageStore::new()),
        )
    }

    /// Use caller-supplied backends.
    pub fn with_backends(
        config: CaskConfig,
        store: Arc<dyn EnvelopeStore>,
        lineages: Arc<dyn LineageStore>,
    ) -> SdkResult<Self> {
        let cask = Self::assemble(config, store, lineages);
        cask.recover()?;
        Ok(cask)
    }

    fn assemble(
        config: CaskConfig,
        store: Arc<dyn EnvelopeStore>,
        lineages: Arc<dyn LineageStore>,
    ) -> Self {
        let index = Arc::new(EnvelopeIndex::new());
        let lineages = LineageTracker::new(lineages);
        Self {
            resolver: VersionResolver::new(lineages.clone()),
            graph: RelationshipGraph::new(Arc::clone(&store), Arc::clone(&index)),
            config,
            store,
            index,
            lineages,
        }
    }

    /// Bring derived state in line with whatever the store already holds.
    fn recover(&self) -> SdkResult<()> {
        if self.store.is_empty()? {
            return Ok(());
        }
        let indexed = self.index.rebuild_from(self.store.as_ref())?;

        let quarantined = self.store.quarantined();
        let backend = self.lineages.backend();
        let mut untracked = 0usize;
        for id in self.store.ids()? {
            if !quarantined.contains(&id) && backend.lineage_of(&id)?.is_none() {
                untracked += 1;
            }
        }
        if untracked > 0 {
            warn!(untracked, "lineage table lags behind the store; rebuilding");
            self.lineages.rebuild_from(self.store.as_ref())?;
        }
        info!(envelopes = indexed, "cask opened");
        Ok(())
    }

    pub fn config(&self) -> &CaskConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EnvelopeStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<EnvelopeIndex> {
        &self.index
    }

    pub fn lineages(&self) -> &LineageTracker {
        &self.lineages
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    /// Number of stored envelopes.
    pub fn len(&self) -> SdkResult<usize> {
        Ok(self.store.len()?)
    }

    pub fn is_empty(&self) -> SdkResult<bool> {
        Ok(self.store.is_empty()?)
    }

    // ---------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------

    /// Encode `builder` under the configured encoder limits.
    pub fn seal(&self, builder: EnvelopeBuilder) -> SdkResult<Envelope> {
        Ok(builder.build_with(&self.config.encoder)?)
    }

    /// Store an envelope and bring indexes and lineages up to date.
    ///
    /// Idempotent: putting a stored envelope again writes nothing and
    /// replays any index or lineage update an earlier put did not finish.
    /// Validation failures are reported before anything is written. A put
    /// that fails later may already have stored the envelope; putting it
    /// again completes the indexes and lineage.
    pub fn put(&self, envelope: &Envelope) -> SdkResult<PutReceipt> {
        let id = envelope.id();
        self.validate(envelope)?;
        if let Some(previous) = envelope.previous() {
            self.ensure_tracked(&previous)?;
        }

        let deduplicated = !self.store.insert(envelope)?.is_new();
        if self.index.apply_envelope(envelope) && deduplicated {
            warn!(id = %id.short_hex(), "stored envelope was missing from the indexes; replayed");
        }
        let advance = self.lineages.record_envelope(envelope)?;

        debug!(id = %id.short_hex(), deduplicated, "envelope put");
        Ok(PutReceipt {
            id,
            deduplicated,
            advance,
        })
    }

    /// Admit stored-layout bytes received from elsewhere. The identity
    /// trailer must match the hash of the canonical bytes.
    pub fn put_bytes(&self, bytes: impl Into<Bytes>) -> SdkResult<PutReceipt> {
        let envelope = Envelope::decode(bytes)?;
        self.put(&envelope)
    }

    /// Mark the lineage through `target` as deleted.
    pub fn tombstone(&self, target: &EnvelopeId) -> SdkResult<PutReceipt> {
        let envelope = self.seal(EnvelopeBuilder::tombstone(*target))?;
        self.put(&envelope)
    }

    fn validate(&self, envelope: &Envelope) -> SdkResult<()> {
        let id = envelope.id();
        let max = self.config.encoder.max_payload_len;
        if envelope.payload().len() > max {
            return Err(EnvelopeError::PayloadTooLarge {
                size: envelope.payload().len(),
                max,
            }
            .into());
        }
        if envelope.relationships().any(|r| r.contains(&id)) {
            return Err(SdkError::CycleDetected {
                id,
                reason: "a relationship targets the envelope itself".into(),
            });
        }
        if let Some(previous) = envelope.previous() {
            if previous == id {
                return Err(SdkError::CycleDetected {
                    id,
                    reason: "the envelope supersedes itself".into(),
                });
            }
            if !self.store.exists(&previous)? {
                return Err(SdkError::DanglingPrevious { id, previous });
            }
            self.lineages.check_acyclic(&id, &previous)?;
        }
        Ok(())
    }

    /// Record `id` and any unrecorded ancestors, oldest first, so a
    /// successor never lands in a lineage of its own because its
    /// predecessor's put has not finished recording yet.
    fn ensure_tracked(&self, id: &EnvelopeId) -> SdkResult<()> {
        let backend = self.lineages.backend();
        let mut pending = Vec::new();
        let mut current = Some(*id);
        while let Some(member) = current {
            if backend.lineage_of(&member)?.is_some() {
                break;
            }
            let Some(envelope) = self.store.read(&member)? else {
                break;
            };
            current = envelope.previous();
            pending.push(envelope);
        }
        for envelope in pending.iter().rev() {
            self.lineages.record_envelope(envelope)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Retrieval
    // ---------------------------------------------------------------

    pub fn get(&self, id: &EnvelopeId) -> SdkResult<Envelope> {
        self.store.read(id)?.ok_or(SdkError::NotFound(*id))
    }

    pub fn contains(&self, id: &EnvelopeId) -> SdkResult<bool> {
        Ok(self.store.exists(id)?)
    }

    // ---------------------------------------------------------------
    // Index queries
    // ---------------------------------------------------------------

    pub fn find_exact(&self, field: &str, value: impl Into<IndexValue>) -> SdkResult<Vec<EnvelopeId>> {
        Ok(self.index.exact(field, &value.into())?)
    }

    pub fn find_range<R: RangeBounds<IndexValue>>(
        &self,
        field: &str,
        range: R,
    ) -> SdkResult<Vec<EnvelopeId>> {
        Ok(self.index.range(field, range)?)
    }

    pub fn find_tagged(&self, field: &str, token: impl Into<IndexValue>) -> SdkResult<Vec<EnvelopeId>> {
        Ok(self.index.tagged(field, &token.into())?)
    }

    pub fn find_by_type(&self, type_descriptor: &EnvelopeId) -> Vec<EnvelopeId> {
        self.index.by_type(type_descriptor)
    }

    pub fn referrers(&self, target: &EnvelopeId) -> Vec<Referrer> {
        self.index.referrers(target)
    }

    pub fn referrers_via(&self, target: &EnvelopeId, relation: &str) -> Vec<EnvelopeId> {
        self.index.referrers_via(target, relation)
    }

    /// Envelopes that directly supersede `id`.
    pub fn successors(&self, id: &EnvelopeId) -> Vec<EnvelopeId> {
        self.index.successors(id)
    }

    // ---------------------------------------------------------------
    // Graph
    // ---------------------------------------------------------------

    pub fn targets(&self, id: &EnvelopeId, relation: &str) -> SdkResult<Vec<EnvelopeId>> {
        Ok(self.graph.targets(id, relation)?)
    }

    pub fn relations(&self, id: &EnvelopeId) -> SdkResult<Vec<Relationship>> {
        Ok(self.graph.relations(id)?)
    }

    pub fn reachable_from(&self, roots: &[EnvelopeId]) -> SdkResult<Reachability> {
        Ok(self.graph.reachable_from(roots)?)
    }

    /// Schemas typing `id`, bounded by `max_schema_depth`.
    pub fn type_chain(&self, id: &EnvelopeId) -> SdkResult<TypeChain> {
        Ok(resolve_type_chain(
            self.store.as_ref(),
            id,
            self.config.max_schema_depth,
        )?)
    }

    // ---------------------------------------------------------------
    // Version chains
    // ---------------------------------------------------------------

    /// The single current version of the lineage through `id`. Fails with a
    /// fork error when the chain has diverged after `id`.
    pub fn head_of(&self, id: &EnvelopeId) -> SdkResult<EnvelopeId> {
        Ok(self.resolver.head_of(id)?)
    }

    pub fn heads_of(&self, id: &EnvelopeId) -> SdkResult<Vec<EnvelopeId>> {
        Ok(self.resolver.heads_of(id)?)
    }

    pub fn is_deleted(&self, id: &EnvelopeId) -> SdkResult<bool> {
        Ok(self.resolver.is_deleted(id)?)
    }

    pub fn history(&self, id: &EnvelopeId) -> SdkResult<Vec<EnvelopeId>> {
        Ok(self.resolver.history(id)?)
    }

    pub fn lineage(&self, id: &EnvelopeId) -> SdkResult<Option<Lineage>> {
        Ok(self.lineages.lineage(id)?)
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    pub fn check_consistency(&self) -> SdkResult<ConsistencyReport> {
        Ok(self.index.check(self.store.as_ref())?)
    }

    /// Replay extraction for stored envelopes the indexes lack and drop
    /// entries for envelopes the store lacks.
    pub fn repair_indexes(&self) -> SdkResult<RepairReport> {
        Ok(self.index.repair(self.store.as_ref())?)
    }

    pub fn rebuild_indexes(&self) -> SdkResult<usize> {
        Ok(self.index.rebuild_from(self.store.as_ref())?)
    }

    pub fn rebuild_lineages(&self) -> SdkResult<usize> {
        Ok(self.lineages.rebuild_from(self.store.as_ref())?)
    }

    /// Remove superseded envelopes nothing references any more.
    ///
    /// Heads are never removed, nor is any envelope that is the target of a
    /// relationship or the type descriptor of a stored envelope. Lineages
    /// keep listing removed members as history. Must not run concurrently
    /// with `put`.
    pub fn compact(&self) -> SdkResult<CompactionReport> {
        let backend = self.lineages.backend();
        let mut report = CompactionReport::default();
        for root in backend.roots()? {
            let Some(lineage) = backend.read_lineage(&root)? else {
                continue;
            };
            for member in lineage.members() {
                if lineage.heads().contains(&member) || !self.store.exists(&member)? {
                    continue;
                }
                let referenced = !self.index.referrers(&member).is_empty()
                    || !self.index.by_type(&member).is_empty();
                if referenced {
                    report.retained.push(member);
                } else {
                    report.removed.push(member);
                }
            }
        }

        if !report.removed.is_empty() {
            self.store.remove(&report.removed)?;
            self.index.compact(&report.removed);
        }
        backend.checkpoint()?;
        info!(
            removed = report.removed.len(),
            retained = report.retained.len(),
            "compaction finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Cask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cask")
            .field("config", &self.config)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_envelope::schema_envelope;
    use std::sync::atomic::{AtomicBool, Ordering};

    use cask_refs::{Advance, LineageError, LineageResult};

    use crate::error::ErrorKind;

    fn schema(cask: &Cask) -> EnvelopeId {
        let schema = cask
            .seal(schema_envelope("note", &b"{\"body\":\"string\"}"[..]))
            .unwrap();
        cask.put(&schema).unwrap().id
    }

    fn note(cask: &Cask, schema: EnvelopeId, body: &'static str) -> Envelope {
        cask.seal(EnvelopeBuilder::new(schema, body.as_bytes()).field("body", body))
            .unwrap()
    }

    // ---------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------

    #[test]
    fn put_then_get() {
        let cask = Cask::in_memory();
        let schema = schema(&cask);
        let env = note(&cask, schema, "hello");

        let receipt = cask.put(&env).unwrap();
        assert_eq!(receipt.id, env.id());
        assert!(!receipt.deduplicated);
        assert_eq!(receipt.advance, Advance::Started);
        assert_eq!(cask.get(&env.id()).unwrap(), env);
        assert_eq!(cask.find_exact("body", "hello").unwrap(), vec![env.id()]);
        assert_eq!(cask.find_by_type(&schema), vec![env.id()]);
    }

    #[test]
    fn second_put_is_deduplicated() {
        let cask = Cask::in_memory();
        let env = note(&cask, schema(&cask), "same");
        let first = cask.put(&env).unwrap();
        let second = cask.put(&env).unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.deduplicated);
        assert_eq!(second.advance, Advance::AlreadyMember);
        assert_eq!(cask.len().unwrap(), 2);
    }

    #[test]
    fn dangling_previous_is_rejected_before_writing() {
        let cask = Cask::in_memory();
        let schema = schema(&cask);
        let missing = EnvelopeId::from_hash([0x42; 32]);
        let env = cask
            .seal(EnvelopeBuilder::new(schema, &b"v2"[..]).previous(missing))
            .unwrap();

        let err = cask.put(&env).unwrap_err();
        assert!(matches!(err, SdkError::DanglingPrevious { previous, .. } if previous == missing));
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert!(!cask.contains(&env.id()).unwrap());
        assert!(!cask.index().contains(&env.id()));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut config = CaskConfig::default();
        config.encoder.max_payload_len = 4;
        let cask = Cask::with_backends(
            config,
            Arc::new(InMemoryEnvelopeStore::new()),
            Arc::new(InMemoryLineageStore::new()),
        )
        .unwrap();

        // Built under default limits, offered to a stricter cask.
        let env = EnvelopeBuilder::new(EnvelopeId::null(), &b"too long"[..])
            .build()
            .unwrap();
        assert_eq!(cask.put(&env).unwrap_err().kind(), ErrorKind::Encoding);
        assert!(cask.seal(EnvelopeBuilder::new(EnvelopeId::null(), &b"12345"[..])).is_err());
        assert!(cask.is_empty().unwrap());
    }

    #[test]
    fn put_bytes_verifies_identity() {
        let cask = Cask::in_memory();
        let env = note(&cask, schema(&cask), "wire");

        let receipt = cask.put_bytes(env.as_bytes().to_vec()).unwrap();
        assert_eq!(receipt.id, env.id());

        let mut tampered = env.as_bytes().to_vec();
        let last_payload_byte = tampered.len() - EnvelopeId::LEN - 1;
        tampered[last_payload_byte] ^= 0xff;
        let err = cask.put_bytes(tampered).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HashMismatch);
        assert_eq!(err.envelope_id(), Some(env.id()));
    }

    /// Lineage backend whose next swap fails once armed.
    #[derive(Default)]
    struct FlakyLineages {
        inner: InMemoryLineageStore,
        fail_next: AtomicBool,
    }

    impl LineageStore for FlakyLineages {
        fn read_lineage(&self, root: &EnvelopeId) -> LineageResult<Option<Lineage>> {
            self.inner.read_lineage(root)
        }

        fn lineage_of(&self, member: &EnvelopeId) -> LineageResult<Option<EnvelopeId>> {
            self.inner.lineage_of(member)
        }

        fn compare_and_swap(&self, expected: Option<u64>, lineage: Lineage) -> LineageResult<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(LineageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.compare_and_swap(expected, lineage)
        }

        fn roots(&self) -> LineageResult<Vec<EnvelopeId>> {
            self.inner.roots()
        }

        fn reset(&self, lineages: Vec<Lineage>) -> LineageResult<()> {
            self.inner.reset(lineages)
        }
    }

    #[test]
    fn put_that_failed_after_storing_completes_on_retry() {
        let lineages = Arc::new(FlakyLineages::default());
        let cask = Cask::with_backends(
            CaskConfig::default(),
            Arc::new(InMemoryEnvelopeStore::new()),
            lineages.clone(),
        )
        .unwrap();
        let env = note(&cask, schema(&cask), "interrupted");

        lineages.fail_next.store(true, Ordering::SeqCst);
        let err = cask.put(&env).unwrap_err();
        assert!(matches!(err, SdkError::Lineage(LineageError::Io(_))));
        assert!(cask.contains(&env.id()).unwrap());
        assert!(cask.lineages().lineage(&env.id()).unwrap().is_none());

        let receipt = cask.put(&env).unwrap();
        assert!(receipt.deduplicated);
        assert_eq!(receipt.advance, Advance::Started);
        assert_eq!(cask.head_of(&env.id()).unwrap(), env.id());
    }

    // ---------------------------------------------------------------
    // Version chains
    // ---------------------------------------------------------------

    #[test]
    fn tombstone_deletes_lineage() {
        let cask = Cask::in_memory();
        let schema = schema(&cask);
        let v1 = note(&cask, schema, "v1");
        cask.put(&v1).unwrap();

        let receipt = cask.tombstone(&v1.id()).unwrap();
        assert!(cask.is_deleted(&v1.id()).unwrap());
        assert_eq!(cask.head_of(&v1.id()).unwrap(), receipt.id);
        assert!(cask.get(&receipt.id).unwrap().is_tombstone());
        // The superseded version is still readable.
        assert_eq!(cask.get(&v1.id()).unwrap(), v1);
    }

    #[test]
    fn tombstone_of_unknown_target_fails() {
        let cask = Cask::in_memory();
        let err = cask.tombstone(&EnvelopeId::from_hash([3; 32])).unwrap_err();
        assert!(matches!(err, SdkError::DanglingPrevious { .. }));
    }

    #[test]
    fn fork_is_reported_on_put_and_head_of() {
        let cask = Cask::in_memory();
        let schema = schema(&cask);
        let root = note(&cask, schema, "root");
        cask.put(&root).unwrap();

        let left = cask
            .seal(EnvelopeBuilder::new(schema, &b"left"[..]).previous(root.id()))
            .unwrap();
        let right = cask
            .seal(EnvelopeBuilder::new(schema, &b"right"[..]).previous(root.id()))
            .unwrap();
        assert!(cask.put(&left).unwrap().forked_heads().is_none());
        let receipt = cask.put(&right).unwrap();
        assert_eq!(receipt.forked_heads().map(<[EnvelopeId]>::len), Some(2));

        let err = cask.head_of(&root.id()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ForkDetected);
        assert_eq!(cask.heads_of(&root.id()).unwrap().len(), 2);
        let mut successors = cask.successors(&root.id());
        successors.sort();
        let mut expected = vec![left.id(), right.id()];
        expected.sort();
        assert_eq!(successors, expected);
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    #[test]
    fn lost_index_entries_are_repaired() {
        let cask = Cask::in_memory();
        let env = note(&cask, schema(&cask), "indexed");
        cask.put(&env).unwrap();

        cask.index().remove(&env.id());
        let report = cask.check_consistency().unwrap();
        assert_eq!(report.missing_from_index, vec![env.id()]);

        let repaired = cask.repair_indexes().unwrap();
        assert_eq!(repaired.replayed, vec![env.id()]);
        assert!(cask.check_consistency().unwrap().is_consistent());
        assert_eq!(cask.find_exact("body", "indexed").unwrap(), vec![env.id()]);
    }

    #[test]
    fn reput_replays_missing_index_entries() {
        let cask = Cask::in_memory();
        let env = note(&cask, schema(&cask), "again");
        cask.put(&env).unwrap();
        cask.index().remove(&env.id());

        assert!(cask.put(&env).unwrap().deduplicated);
        assert!(cask.index().contains(&env.id()));
    }

    #[test]
    fn compaction_keeps_heads_and_referenced_versions() {
        let cask = Cask::in_memory();
        let schema = schema(&cask);
        let v1 = note(&cask, schema, "v1");
        let v2 = cask
            .seal(EnvelopeBuilder::new(schema, &b"v2"[..]).previous(v1.id()))
            .unwrap();
        let v3 = cask
            .seal(EnvelopeBuilder::new(schema, &b"v3"[..]).previous(v2.id()))
            .unwrap();
        let citation = cask
            .seal(EnvelopeBuilder::new(schema, &b"cite"[..]).relate("cites", v2.id()))
            .unwrap();
        for env in [&v1, &v2, &v3, &citation] {
            cask.put(env).unwrap();
        }

        let report = cask.compact().unwrap();
        assert_eq!(report.removed, vec![v1.id()]);
        assert_eq!(report.retained, vec![v2.id()]);

        assert_eq!(cask.get(&v1.id()).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(cask.get(&v2.id()).is_ok());
        assert_eq!(cask.head_of(&v1.id()).unwrap(), v3.id());
        assert!(cask.check_consistency().unwrap().is_consistent());
        // Schemas typing stored envelopes are never candidates either.
        assert!(cask.contains(&schema).unwrap());
    }

    #[test]
    fn type_chain_uses_configured_depth() {
        let cask = Cask::in_memory();
        let schema = schema(&cask);
        let env = note(&cask, schema, "typed");
        cask.put(&env).unwrap();
        let chain = cask.type_chain(&env.id()).unwrap();
        assert_eq!(chain.immediate(), Some(schema));
        assert_eq!(chain.len(), 2);
    }
}
