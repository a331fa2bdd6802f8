//! The serving side of blob transfer.

use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use n0_future::boxed::BoxFuture;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    metrics::Metrics,
    protocol::{Request, Response, MAX_CHUNK_BATCH, MAX_MESSAGE_SIZE, MAX_REQUEST_SIZE},
    store::Store,
};
use crate::{
    endpoint::remote_peer,
    protocol::ProtocolHandler,
    util::{read_message, write_message},
};

/// Accepts blob requests and serves them from the store.
#[derive(Debug, Clone)]
pub struct BlobsProtocol {
    store: Store,
    metrics: Arc<Metrics>,
}

impl BlobsProtocol {
    pub(crate) fn new(store: Store, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }
}

impl ProtocolHandler for BlobsProtocol {
    fn accept(&self, connection: Connection) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let remote = remote_peer(&connection)?;
            let connection_id = connection.stable_id() as u64;
            let span = debug_span!("connection", connection_id, remote = %remote.fmt_short());
            async move {
                while let Ok((writer, reader)) = connection.accept_bi().await {
                    let request_id = reader.id().index();
                    let span = debug_span!("stream", stream_id = %request_id);
                    let this = this.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) = this.handle_stream(reader, writer).await {
                                warn!("error: {err:#}");
                            }
                        }
                        .instrument(span),
                    );
                }
                Ok(())
            }
            .instrument(span)
            .await
        })
    }
}

impl BlobsProtocol {
    async fn handle_stream(&self, mut reader: RecvStream, mut writer: SendStream) -> Result<()> {
        let mut buf = BytesMut::with_capacity(1024);
        let Some(request) = read_message::<Request>(&mut reader, &mut buf, MAX_REQUEST_SIZE).await?
        else {
            return Ok(());
        };
        debug!(?request, "got request");
        self.metrics.requests_served.inc();
        match request {
            Request::Size { hash } => match self.store.outboard(&hash) {
                Some(outboard) => {
                    let response = Response::Size {
                        size: outboard.size(),
                    };
                    write_message(&mut writer, &mut buf, &response, MAX_MESSAGE_SIZE).await?;
                }
                None => self.not_found(&mut writer, &mut buf).await?,
            },
            Request::Chunks { hash, start, end } => {
                let Some(outboard) = self.store.outboard(&hash) else {
                    return self.not_found(&mut writer, &mut buf).await;
                };
                let end = end
                    .min(outboard.chunks())
                    .min(start.saturating_add(MAX_CHUNK_BATCH));
                let data = match self.store.encode_chunks(&hash, start, end).await {
                    Ok(data) => data,
                    // deleted while we were serving it
                    Err(err) if err.is_not_found() => {
                        return self.not_found(&mut writer, &mut buf).await;
                    }
                    Err(err) => return Err(err.into()),
                };
                self.metrics.bytes_sent.inc_by(data.len() as u64);
                trace!(start, end, len = data.len(), "sending chunks");
                let response = Response::Encoded { data };
                write_message(&mut writer, &mut buf, &response, MAX_MESSAGE_SIZE).await?;
            }
        }
        writer.finish()?;
        Ok(())
    }

    async fn not_found(&self, writer: &mut SendStream, buf: &mut BytesMut) -> Result<()> {
        self.metrics.requests_not_found.inc();
        write_message(writer, buf, &Response::NotFound, MAX_MESSAGE_SIZE).await?;
        writer.finish()?;
        Ok(())
    }
}
