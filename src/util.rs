//! Framing helpers shared by the wire protocols, and path/key conversions.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ConfigSnafu;

/// Writes `frame` as a length-prefixed, postcard-encoded message.
pub(crate) async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    buffer: &mut BytesMut,
    frame: &T,
    max_message_size: usize,
) -> Result<()> {
    let len = postcard::experimental::serialized_size(&frame)?;
    ensure!(
        len < max_message_size,
        "message of {len} bytes exceeds the limit of {max_message_size}"
    );
    buffer.clear();
    buffer.resize(len, 0u8);
    let slice = postcard::to_slice(&frame, buffer)?;
    writer.write_u32(len as u32).await?;
    writer.write_all(slice).await?;
    Ok(())
}

/// Reads a length-prefixed message and decodes it.
///
/// Returns `None` on a clean end of stream.
pub(crate) async fn read_message<T: DeserializeOwned>(
    reader: impl AsyncRead + Unpin,
    buffer: &mut BytesMut,
    max_message_size: usize,
) -> Result<Option<T>> {
    match read_lp(reader, buffer, max_message_size).await? {
        None => Ok(None),
        Some(data) => {
            let message = postcard::from_bytes(&data)?;
            Ok(Some(message))
        }
    }
}

/// Reads a length-prefixed frame.
///
/// If the end of the stream is reached before a new frame starts, returns `None`.
pub(crate) async fn read_lp(
    mut reader: impl AsyncRead + Unpin,
    buffer: &mut BytesMut,
    max_message_size: usize,
) -> Result<Option<Bytes>> {
    let size = match reader.read_u32().await {
        Ok(size) => size,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let size = usize::try_from(size).context("frame larger than usize")?;
    if size > max_message_size {
        bail!("incoming message of {size} bytes exceeds the limit of {max_message_size}");
    }
    let mut reader = reader.take(size as u64);
    buffer.clear();
    buffer.reserve(size);
    while buffer.len() < size {
        let r = reader.read_buf(buffer).await?;
        if r == 0 {
            bail!("stream ended inside a frame");
        }
    }
    Ok(Some(buffer.split_to(size).freeze()))
}

/// Turns a file path into a document key.
///
/// The path is made relative to `root` if given, prefixed with `prefix` and terminated with a
/// null byte.
pub fn path_to_key(
    path: impl AsRef<Path>,
    prefix: Option<String>,
    root: Option<PathBuf>,
) -> crate::Result<Bytes> {
    let path = path.as_ref();
    let path = match root {
        Some(root) => path.strip_prefix(&root).map_err(|_| {
            ConfigSnafu {
                message: format!("{} is not inside {}", path.display(), root.display()),
            }
            .build()
        })?,
        None => path,
    };
    let suffix = path.to_str().ok_or_else(|| {
        ConfigSnafu {
            message: format!("{} is not valid unicode", path.display()),
        }
        .build()
    })?;
    let mut key = prefix.unwrap_or_default().into_bytes();
    key.extend_from_slice(suffix.as_bytes());
    key.push(b'\0');
    Ok(key.into())
}

/// Inverse of [`path_to_key`].
pub fn key_to_path(
    key: impl AsRef<[u8]>,
    prefix: Option<String>,
    root: Option<PathBuf>,
) -> crate::Result<PathBuf> {
    let key = key.as_ref();
    let key = key.strip_suffix(b"\0").unwrap_or(key);
    let key = match prefix {
        Some(prefix) => key.strip_prefix(prefix.as_bytes()).ok_or_else(|| {
            ConfigSnafu {
                message: format!("key does not start with prefix {prefix}"),
            }
            .build()
        })?,
        None => key,
    };
    let path = std::str::from_utf8(key).map_err(|_| {
        ConfigSnafu {
            message: "key is not valid utf8".to_string(),
        }
        .build()
    })?;
    Ok(match root {
        Some(root) => root.join(path),
        None => PathBuf::from(path),
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Frame {
        id: u32,
        body: Vec<u8>,
    }

    #[tokio::test]
    async fn framing() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);
        let frames = vec![
            Frame { id: 1, body: vec![] },
            Frame { id: 2, body: vec![7; 200] },
        ];
        let expected = frames.iter().map(|f| f.id).collect::<Vec<_>>();
        let writer = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            for frame in frames {
                write_message(&mut a, &mut buf, &frame, 1024).await?;
            }
            anyhow::Ok(())
        });
        let mut buf = BytesMut::new();
        let mut got = vec![];
        while let Some(frame) = read_message::<Frame>(&mut b, &mut buf, 1024).await? {
            got.push(frame.id);
        }
        writer.await??;
        assert_eq!(got, expected);
        Ok(())
    }

    #[tokio::test]
    async fn request_and_response_share_a_buffer() -> Result<()> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut buf = BytesMut::new();
        let request = Frame { id: 1, body: vec![1; 40] };
        write_message(&mut client, &mut buf, &request, 1024).await?;

        let mut server_buf = BytesMut::new();
        let got = read_message::<Frame>(&mut server, &mut server_buf, 1024).await?;
        assert_eq!(got, Some(request));
        let response = Frame { id: 2, body: vec![2; 300] };
        write_message(&mut server, &mut server_buf, &response, 1024).await?;

        // the buffer still holds the request bytes
        assert!(!buf.is_empty());
        let got = read_message::<Frame>(&mut client, &mut buf, 1024).await?;
        assert_eq!(got, Some(response));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = BytesMut::new();
        let mut sink = Vec::new();
        let big = Frame { id: 0, body: vec![0; 100] };
        assert!(write_message(&mut sink, &mut buf, &big, 50).await.is_err());

        let mut input: &[u8] = &[0, 0, 1, 0, 1, 2];
        assert!(read_lp(&mut input, &mut buf, 16).await.is_err());
    }

    #[test]
    fn path_key_roundtrip() {
        let root = PathBuf::from("/data");
        let key = path_to_key("/data/a/b.txt", Some("files/".into()), Some(root.clone())).unwrap();
        assert_eq!(&key[..], b"files/a/b.txt\0");
        let path = key_to_path(&key, Some("files/".into()), Some(root)).unwrap();
        assert_eq!(path, PathBuf::from("/data/a/b.txt"));

        assert!(path_to_key("/other/x", None, Some("/data".into())).is_err());
        assert!(key_to_path(b"x\0", Some("files/".into()), None).is_err());
    }
}
