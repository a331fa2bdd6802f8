//! Two nodes talking to each other over localhost.

use std::{future::Future, time::Duration};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures_util::StreamExt;
use iroh_node::{
    AddrInfoOptions, Node, NodeOptions, RelayMode,
    blobs::{BlobStatus, DownloadOptions},
    docs::{LiveEvent, Query, ShareMode},
    gossip::{DeliveryScope, GossipEvent, TopicId},
    ticket::{BlobTicket, DocTicket, TopicTicket},
};
use tracing::info;
use tracing_test::traced_test;

const TIMEOUT: Duration = Duration::from_secs(30);

async fn test_node(enable_docs: bool) -> Result<Node> {
    let node = Node::memory_with_options(NodeOptions {
        enable_docs,
        node_discovery: false,
        relay_mode: RelayMode::Disabled,
        ..Default::default()
    })
    .await?;
    info!(me = %node.net().node_id().fmt_short(), "node spawned");
    Ok(node)
}

async fn with_timeout<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .context("timed out")?
}

#[tokio::test]
#[traced_test]
async fn gossip_hello() -> Result<()> {
    let alice = test_node(false).await?;
    let bob = test_node(false).await?;

    let topic = TopicId::from_bytes([23u8; 32]);
    let ticket = alice.gossip().ticket(topic, AddrInfoOptions::RelayAndAddresses);
    let ticket: TopicTicket = ticket.to_string().parse()?;

    let (_alice_tx, mut alice_rx) = alice.gossip().subscribe(topic, []).await?.split();
    let (bob_tx, mut bob_rx) = bob.gossip().subscribe_ticket(&ticket).await?.split();

    with_timeout(async {
        bob_rx.joined().await?;
        while let Some(event) = alice_rx.next().await {
            if event == GossipEvent::PeerJoined(bob.net().node_id()) {
                return Ok(());
            }
        }
        bail!("alice stopped receiving events")
    })
    .await?;

    bob_tx.broadcast(Bytes::from_static(b"hello")).await?;
    let (from, content, scope) = with_timeout(async {
        while let Some(event) = alice_rx.next().await {
            if let GossipEvent::MessageReceived {
                from,
                content,
                scope,
                ..
            } = event
            {
                return Ok((from, content, scope));
            }
        }
        bail!("alice stopped receiving events")
    })
    .await?;
    assert_eq!(from, bob.net().node_id());
    assert_eq!(content, Bytes::from_static(b"hello"));
    assert!(matches!(scope, DeliveryScope::Swarm(_)));

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn blob_download_by_ticket() -> Result<()> {
    let provider = test_node(false).await?;
    let getter = test_node(false).await?;

    let added = provider.blobs().import_bytes(Bytes::from_static(b"test-data")).await?;
    let ticket = provider.blobs().share(
        added.hash,
        added.format,
        AddrInfoOptions::RelayAndAddresses,
    )?;
    let ticket: BlobTicket = ticket.to_string().parse()?;
    assert_eq!(getter.blobs().status(added.hash), BlobStatus::NotFound);

    let outcome = with_timeout(async {
        Ok(getter
            .blobs()
            .download_ticket(&ticket, DownloadOptions::default())
            .finish()
            .await?)
    })
    .await?;
    assert_eq!(outcome.bytes_written, 9);
    assert_eq!(
        getter.blobs().status(added.hash),
        BlobStatus::Complete { size: 9 }
    );
    assert_eq!(
        getter.blobs().read_to_bytes(added.hash).await?,
        Bytes::from_static(b"test-data")
    );
    // The download is tagged, so it survives garbage collection.
    getter.blobs().gc().await?;
    assert!(getter.blobs().has(added.hash));

    provider.shutdown().await?;
    getter.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn doc_sync_by_ticket() -> Result<()> {
    let alice = test_node(true).await?;
    let bob = test_node(true).await?;

    let alice_docs = alice.docs()?;
    let doc = alice_docs.create().await?;
    let author = alice_docs.author_default()?;
    let hash = doc.set(author, "greeting", "hi").await?;

    let ticket = doc
        .share(ShareMode::Write, AddrInfoOptions::RelayAndAddresses)
        .await?;
    let ticket: DocTicket = ticket.to_string().parse()?;
    let (bob_doc, mut events) = bob.docs()?.join_and_subscribe(ticket).await?;
    assert_eq!(bob_doc.id(), doc.id());

    let alice_id = alice.net().node_id();
    with_timeout(async {
        let mut content_ready = false;
        let mut neighbor_up = false;
        while let Some(event) = events.next().await {
            match event {
                LiveEvent::ContentReady { hash: ready } if ready == hash => content_ready = true,
                LiveEvent::NeighborUp(peer) if peer == alice_id => neighbor_up = true,
                LiveEvent::SyncFinished(event) => {
                    if let Err(err) = event.result {
                        bail!("sync failed: {err}");
                    }
                }
                _ => {}
            }
            if content_ready && neighbor_up {
                return Ok(());
            }
        }
        bail!("bob stopped receiving events")
    })
    .await?;

    let entry = bob_doc
        .get_one(Query::key_exact("greeting"))
        .await?
        .context("entry missing")?;
    assert_eq!(entry.author(), author);
    assert_eq!(entry.content_hash(), hash);
    assert_eq!(
        bob_doc.read_to_bytes(&entry).await?,
        Bytes::from_static(b"hi")
    );

    // Writes after the join travel over gossip.
    let mut alice_events = doc.subscribe().await?;
    let bob_author = bob.docs()?.author_default()?;
    let reply = bob_doc.set(bob_author, "reply", "hello alice").await?;
    with_timeout(async {
        while let Some(event) = alice_events.next().await {
            if let LiveEvent::ContentReady { hash } = event {
                if hash == reply {
                    return Ok(());
                }
            }
        }
        bail!("alice stopped receiving events")
    })
    .await?;
    let entry = doc
        .get_one(Query::key_exact("reply"))
        .await?
        .context("reply missing")?;
    assert_eq!(entry.author(), bob_author);
    assert_eq!(
        doc.read_to_bytes(&entry).await?,
        Bytes::from_static(b"hello alice")
    );

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}
