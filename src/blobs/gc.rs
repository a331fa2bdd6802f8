//! Mark and sweep garbage collection for the blob store.
//!
//! Live roots are the values of all tags, all hashes protected by a temp tag and any extra
//! roots supplied by the node, e.g. the content hashes of document entries. Children of
//! live hash sequences are live too. Everything else is deleted.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use n0_future::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    hash::{parse_hash_seq, BlobFormat, Hash, HashAndFormat},
    metrics::Metrics,
    store::Store,
    tags::Tags,
};
use crate::error::Result;

/// Supplies additional live hashes at the start of every run.
pub type ExtraRoots = Arc<dyn Fn() -> Result<BTreeSet<Hash>> + Send + Sync + 'static>;

/// Outcome of a single collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of blobs found live.
    pub live: usize,
    /// Number of blobs deleted.
    pub deleted: usize,
}

/// Runs one mark and sweep pass.
pub(crate) async fn run_gc(
    store: &Store,
    tags: &Tags,
    extra_roots: Option<&ExtraRoots>,
    metrics: &Metrics,
) -> Result<GcStats> {
    let _epoch = store.begin_gc().await;
    let live = gc_mark(store, tags, extra_roots).await?;
    let deleted = gc_sweep(store, &live, metrics).await?;
    Ok(GcStats {
        live: live.len(),
        deleted,
    })
}

async fn gc_sweep(store: &Store, live: &BTreeSet<Hash>, metrics: &Metrics) -> Result<usize> {
    let candidates = store
        .list()
        .into_iter()
        .filter(|hash| !live.contains(hash))
        .collect::<Vec<_>>();
    let deleted = store.delete(candidates).await?;
    for hash in &deleted {
        debug!(hash = %hash.fmt_short(), "gc: deleted");
    }
    metrics.gc_deleted.inc_by(deleted.len() as u64);
    Ok(deleted.len())
}

async fn gc_mark(
    store: &Store,
    tags: &Tags,
    extra_roots: Option<&ExtraRoots>,
) -> Result<BTreeSet<Hash>> {
    let mut roots = BTreeSet::<HashAndFormat>::new();
    // temp tags before tags: content is tagged before its temp tag goes away
    roots.extend(store.protected_hashes().into_iter().map(HashAndFormat::raw));
    roots.extend(tags.roots()?);
    if let Some(extra) = extra_roots {
        roots.extend(extra()?.into_iter().map(HashAndFormat::raw));
    }

    let mut live = BTreeSet::new();
    for HashAndFormat { hash, format } in roots {
        live.insert(hash);
        if format != BlobFormat::HashSeq {
            continue;
        }
        if !store.has(&hash) {
            warn!(hash = %hash.fmt_short(), "gc: hash sequence not found");
            continue;
        }
        let data = match store.read_to_bytes(&hash).await {
            Ok(data) => data,
            Err(err) => {
                warn!(hash = %hash.fmt_short(), "gc: reading hash sequence failed: {err}");
                continue;
            }
        };
        match parse_hash_seq(&data) {
            Some(children) => live.extend(children),
            None => warn!(hash = %hash.fmt_short(), "gc: hash sequence parse failed"),
        }
    }
    debug!(live = live.len(), "gc mark done");
    Ok(live)
}

/// Runs [`run_gc`] every `period` until the handle is dropped.
pub(crate) fn spawn_gc(
    store: Store,
    tags: Tags,
    extra_roots: Option<ExtraRoots>,
    metrics: Arc<Metrics>,
    period: Duration,
) -> AbortOnDropHandle<()> {
    info!("starting GC task with interval {period:?}");
    let task = async move {
        loop {
            tokio::time::sleep(period).await;
            match run_gc(&store, &tags, extra_roots.as_ref(), &metrics).await {
                Ok(stats) => debug!(?stats, "gc run complete"),
                Err(err) => error!("gc run failed, skipping: {err}"),
            }
        }
    };
    AbortOnDropHandle::new(tokio::spawn(task.instrument(tracing::debug_span!("gc"))))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::blobs::{hash::encode_hash_seq, store::BlobStatus, tags::Tag};

    #[tokio::test]
    async fn tags_keep_blobs_alive() -> Result<()> {
        let store = Store::memory();
        let tags = Tags::memory()?;
        let (tag, _) = store.import_bytes(Bytes::from_static(b"kept")).await?;
        let hash = *tag.hash();
        tags.set(&Tag::from("t"), tag.hash_and_format())?;
        drop(tag);

        assert_eq!(run_gc(&store, &tags, None, &Metrics::default()).await?.deleted, 0);
        assert!(store.has(&hash));

        tags.delete(&Tag::from("t"))?;
        assert_eq!(run_gc(&store, &tags, None, &Metrics::default()).await?.deleted, 1);
        assert_eq!(store.status(&hash), BlobStatus::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn retag_prevents_collection() -> Result<()> {
        let store = Store::memory();
        let tags = Tags::memory()?;
        let (tag, _) = store.import_bytes(Bytes::from_static(b"data")).await?;
        tags.set(&Tag::from("a"), tag.hash_and_format())?;
        tags.set(&Tag::from("b"), tag.hash_and_format())?;
        let hash = *tag.hash();
        drop(tag);

        tags.delete(&Tag::from("a"))?;
        run_gc(&store, &tags, None, &Metrics::default()).await?;
        assert!(store.has(&hash));
        Ok(())
    }

    #[tokio::test]
    async fn temp_tags_and_extra_roots_protect() -> Result<()> {
        let store = Store::memory();
        let tags = Tags::memory()?;
        let (protected, _) = store.import_bytes(Bytes::from_static(b"in flight")).await?;
        let (doc_content, _) = store.import_bytes(Bytes::from_static(b"doc")).await?;
        let doc_hash = *doc_content.hash();
        drop(doc_content);

        let extra: ExtraRoots = Arc::new(move || Ok([doc_hash].into_iter().collect()));
        let stats = run_gc(&store, &tags, Some(&extra), &Metrics::default()).await?;
        assert_eq!(stats.deleted, 0);
        assert!(store.has(protected.hash()));
        assert!(store.has(&doc_hash));
        Ok(())
    }

    #[tokio::test]
    async fn content_tagged_between_mark_and_sweep_survives() -> Result<()> {
        let store = Store::memory();
        let tags = Tags::memory()?;
        let metrics = Metrics::default();

        let epoch = store.begin_gc().await;
        let live = gc_mark(&store, &tags, None).await?;
        // an import that finishes after the mark phase looked at tags and temp tags
        let (tag, _) = store.import_bytes(Bytes::from_static(b"late")).await?;
        let hash = *tag.hash();
        tags.set(&Tag::from("user-tag"), tag.hash_and_format())?;
        drop(tag);
        assert!(!live.contains(&hash));
        assert_eq!(gc_sweep(&store, &live, &metrics).await?, 0);
        drop(epoch);
        assert!(store.has(&hash));

        // the next run sees the tag
        assert_eq!(run_gc(&store, &tags, None, &metrics).await?.deleted, 0);
        assert!(store.has(&hash));
        Ok(())
    }

    #[tokio::test]
    async fn retag_after_untag_prevents_collection() -> Result<()> {
        let store = Store::memory();
        let tags = Tags::memory()?;
        let (tag, _) = store.import_bytes(Bytes::from_static(b"data")).await?;
        let hash = *tag.hash();
        tags.set(&Tag::from("a"), tag.hash_and_format())?;
        drop(tag);

        tags.delete(&Tag::from("a"))?;
        tags.set(&Tag::from("b"), HashAndFormat::raw(hash))?;
        assert_eq!(run_gc(&store, &tags, None, &Metrics::default()).await?.deleted, 0);
        assert!(store.has(&hash));

        tags.delete(&Tag::from("b"))?;
        assert_eq!(run_gc(&store, &tags, None, &Metrics::default()).await?.deleted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn gc_runs_do_not_overlap() -> Result<()> {
        let store = Store::memory();
        let epoch = store.begin_gc().await;
        let second = tokio::time::timeout(Duration::from_millis(50), store.begin_gc()).await;
        assert!(second.is_err());
        drop(epoch);
        let _second = store.begin_gc().await;
        Ok(())
    }

    #[tokio::test]
    async fn hash_seq_children_are_live() -> Result<()> {
        let store = Store::memory();
        let tags = Tags::memory()?;
        let (a, _) = store.import_bytes(Bytes::from_static(b"child a")).await?;
        let (b, _) = store.import_bytes(Bytes::from_static(b"child b")).await?;
        let (seq, _) = store
            .import_bytes(encode_hash_seq([*a.hash(), *b.hash()]))
            .await?;
        tags.set(&Tag::from("col"), HashAndFormat::hash_seq(*seq.hash()))?;
        let children = [*a.hash(), *b.hash()];
        drop((a, b, seq));

        let stats = run_gc(&store, &tags, None, &Metrics::default()).await?;
        assert_eq!(stats, GcStats { live: 3, deleted: 0 });
        assert!(children.iter().all(|h| store.has(h)));
        Ok(())
    }
}
