//! Storage stream: the download exchange and its two consumption modes.
//!
//! A download frames `{offset, size, padded group name, remote name}` under
//! the DOWNLOAD_FILE command and validates the response header only; the body
//! length comes from the reply and is consumed as a stream. A connection that
//! did not deliver exactly the declared length is presumed desynchronized and
//! removed from its pool instead of returned.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::connection::{Conn, ConnPool};
use crate::errors::{FdfsError, Result};
use crate::protocol::{encode_header, pad_string, recv_header};
use crate::types::{
    StorageCommand, DOWNLOAD_CHUNK_SIZE, FDFS_GROUP_NAME_MAX_LEN, FDFS_PROTO_CMD_RESP,
    FDFS_PROTO_HEADER_LEN, FDFS_PROTO_PKG_LEN_SIZE,
};

fn download_request(offset: i64, size: i64, group_name: &str, remote_filename: &str) -> BytesMut {
    let body_len =
        2 * FDFS_PROTO_PKG_LEN_SIZE + FDFS_GROUP_NAME_MAX_LEN + remote_filename.len();
    let mut frame = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + body_len);
    frame.put(encode_header(
        body_len as i64,
        StorageCommand::DownloadFile.into(),
        0,
    ));
    frame.put_i64(offset);
    frame.put_i64(size);
    frame.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
    frame.put_slice(remote_filename.as_bytes());
    frame
}

async fn start_download(
    pool: &Arc<ConnPool>,
    mut conn: Conn,
    offset: i64,
    size: i64,
    group_name: &str,
    remote_filename: &str,
) -> Result<(Conn, i64)> {
    let frame = download_request(offset, size, group_name, remote_filename);
    if let Err(err) = conn.write_all(&frame).await {
        pool.remove(conn);
        return Err(err.into());
    }
    match recv_header(&mut conn, FDFS_PROTO_CMD_RESP, -1).await {
        Ok(header) => Ok((conn, header.length)),
        Err(err) => {
            pool.remove(conn);
            Err(err)
        }
    }
}

/// Pull-mode download handle.
///
/// Reads come straight from the connection's frame reader. The caller must
/// call [`Download::close`] exactly once when done; the connection is
/// returned to its pool only if the declared body was fully consumed and is
/// closed otherwise. Dropping the handle without closing it closes the
/// socket and frees the admission slot, so nothing leaks, but the connection
/// is lost to the pool.
#[derive(Debug)]
pub struct Download {
    conn: Option<Conn>,
    pool: Arc<ConnPool>,
    length: i64,
    consumed: i64,
}

impl Download {
    pub(crate) async fn start(
        pool: Arc<ConnPool>,
        conn: Conn,
        offset: i64,
        size: i64,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<Self> {
        let (conn, length) = start_download(&pool, conn, offset, size, group_name, remote_filename).await?;
        Ok(Self {
            conn: Some(conn),
            pool,
            length,
            consumed: 0,
        })
    }

    /// Body length the server declared
    pub fn length(&self) -> i64 {
        self.length
    }

    /// Bytes consumed so far
    pub fn consumed(&self) -> i64 {
        self.consumed
    }

    /// Reads the next chunk of the body into `buf`; 0 once the declared
    /// length has been consumed.
    ///
    /// End-of-stream before the declared length is a
    /// [`FdfsError::ShortPackage`] failure and marks the connection for
    /// removal at close.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };

        let remaining = (self.length - self.consumed).max(0) as usize;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(remaining);
        let n = conn.reader().read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(FdfsError::ShortPackage {
                expected: self.length as u64,
                actual: self.consumed as u64,
            });
        }
        self.consumed += n as i64;
        Ok(n)
    }

    /// Releases the connection, exactly once per download
    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if self.consumed == self.length {
                self.pool.put(conn).await;
            } else {
                warn!(
                    declared = self.length,
                    consumed = self.consumed,
                    "download body not fully consumed, removing connection"
                );
                self.pool.remove(conn);
            }
        }
    }
}

/// Push-mode download: stream the body into `sink` in 32 KiB chunks.
///
/// Returns the number of bytes transferred, which always equals the declared
/// body length on success. On any failure (early end-of-stream, a sink that
/// stops accepting bytes, an I/O error) the connection is removed from the
/// pool rather than returned.
pub(crate) async fn download_to<W>(
    pool: Arc<ConnPool>,
    conn: Conn,
    offset: i64,
    size: i64,
    group_name: &str,
    remote_filename: &str,
    sink: &mut W,
) -> Result<i64>
where
    W: AsyncWrite + Unpin,
{
    let (mut conn, total) =
        start_download(&pool, conn, offset, size, group_name, remote_filename).await?;

    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut received: i64 = 0;
    while received < total {
        let want = DOWNLOAD_CHUNK_SIZE.min((total - received) as usize);
        let n = match conn.reader().read(&mut buf[..want]).await {
            Ok(n) => n,
            Err(err) => {
                pool.remove(conn);
                return Err(err.into());
            }
        };
        if n == 0 {
            // clean end-of-stream before the declared length
            break;
        }

        let mut pos = 0;
        while pos < n {
            let written = match sink.write(&buf[pos..n]).await {
                Ok(written) => written,
                Err(err) => {
                    pool.remove(conn);
                    return Err(err.into());
                }
            };
            if written == 0 {
                pool.remove(conn);
                return Err(FdfsError::ShortWrite);
            }
            pos += written;
        }
        received += n as i64;
    }

    if received != total {
        warn!(
            declared = total,
            received, "download stream ended short, removing connection"
        );
        pool.remove(conn);
        return Err(FdfsError::ShortPackage {
            expected: total as u64,
            actual: received as u64,
        });
    }

    pool.put(conn).await;
    sink.flush().await?;
    Ok(total)
}
