//! Client facade.
//!
//! Resolves file IDs, decides between the local metadata fast path and a
//! storage round trip, resolves storage locations through the tracker, and
//! hands out per-endpoint connection pools on demand.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::debug;

use crate::base64;
use crate::connection::{default_dialer, Conn, ConnPool, PoolOptions, Stats};
use crate::errors::{FdfsError, Result};
use crate::protocol::{
    active_test, encode_header, ip_to_string, pad_string, read_cstr, read_i64, read_u32,
    recv_package, split_file_id,
};
use crate::storage::{self, Download};
use crate::types::*;

/// Client for a FastDFS cluster.
///
/// One pool serves the configured tracker address; storage pools are created
/// lazily, keyed by the `ip:port` the tracker resolves for a group.
///
/// Must be created within a tokio runtime (the pools spawn background
/// tasks).
///
/// # Example
///
/// ```no_run
/// use fdfs::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::new(ClientConfig::new("192.168.1.100:22122"))?;
///
///     let info = client
///         .get_file_info("group1/M00/02/44/wKgBaF8Q2xSAF6nWAAAYvPXVYTk902.jpg")
///         .await?;
///     println!("{} bytes from {}", info.file_size, info.source_ip_addr);
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct Client {
    opt: ClientConfig,
    tracker_pool: Arc<ConnPool>,
    store_pools: Mutex<HashMap<String, Arc<ConnPool>>>,
}

impl Client {
    /// Creates a client with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::validate_config(&config)?;

        let dialer = match &config.dialer {
            Some(dialer) => dialer.clone(),
            None => default_dialer(&config.addr, config.dial_timeout),
        };
        let tracker_pool = ConnPool::new(pool_options(&config, dialer));

        Ok(Self {
            opt: config,
            tracker_pool,
            store_pools: Mutex::new(HashMap::new()),
        })
    }

    fn validate_config(config: &ClientConfig) -> Result<()> {
        if config.addr.is_empty() || !config.addr.contains(':') {
            return Err(FdfsError::InvalidArgument(format!(
                "invalid tracker address: {:?}",
                config.addr
            )));
        }
        Ok(())
    }

    /// Resolves size, creation time, checksum and origin of a file.
    ///
    /// When the remote name carries a decodable metadata fragment, the answer
    /// is computed locally without any network traffic. Trunk and appender
    /// files (longer remote names, or a size-marker bit in the fragment) fall
    /// back to [`Self::query_file_info`].
    pub async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        if remote_filename.len() < NORMAL_LOGIC_FILENAME_LENGTH {
            return Err(FdfsError::InvalidFileId(file_id.to_string()));
        }

        let fragment = &remote_filename.as_bytes()
            [FDFS_LOGIC_FILE_PATH_LEN..FDFS_LOGIC_FILE_PATH_LEN + FDFS_FILENAME_BASE64_LENGTH];
        let fragment = std::str::from_utf8(fragment)
            .map_err(|_| FdfsError::InvalidFileId(file_id.to_string()))?;
        let decoded = base64::decode_auto(fragment)?;
        // ip(4) + create time(4) + size(8) + crc32(4)
        if decoded.len() < 20 {
            return Err(FdfsError::InvalidFileId(file_id.to_string()));
        }

        let raw_size = read_i64(&decoded, 8);
        if needs_storage_query(remote_filename.len(), raw_size) {
            debug!(file_id, "metadata not derivable from remote name, querying server");
            return self.query_file_info(&group_name, &remote_filename).await;
        }

        // sign bit set: the low 32 bits are the real size; otherwise the
        // size cannot be known from the name alone
        let file_size = if raw_size >> 63 != 0 {
            raw_size & 0xFFFF_FFFF
        } else {
            -1
        };

        Ok(FileInfo {
            file_size,
            create_time: UNIX_EPOCH + Duration::from_secs(read_u32(&decoded, 4) as u64),
            crc32: read_u32(&decoded, 16),
            source_ip_addr: ip_to_string(read_u32(&decoded, 0)),
        })
    }

    /// Queries file metadata from the server over the default pool
    pub async fn query_file_info(
        &self,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<FileInfo> {
        let frame = query_frame(
            StorageCommand::QueryFileInfo.into(),
            group_name,
            remote_filename,
        )?;
        let body = self
            .round_trip(&self.tracker_pool, &frame, QUERY_FILE_INFO_BODY_LEN as i64)
            .await?;

        Ok(FileInfo {
            file_size: read_i64(&body, 0),
            create_time: UNIX_EPOCH
                + Duration::from_secs(read_i64(&body, FDFS_PROTO_PKG_LEN_SIZE).max(0) as u64),
            crc32: read_i64(&body, 2 * FDFS_PROTO_PKG_LEN_SIZE) as u32,
            source_ip_addr: read_cstr(&body[3 * FDFS_PROTO_PKG_LEN_SIZE..]),
        })
    }

    /// Resolves the storage server holding `remote_filename` through the
    /// tracker
    pub async fn query_storage_location(
        &self,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<StorageServer> {
        self.query_storage_location_for(group_name, remote_filename, TrackerCommand::QueryFetchOne)
            .await
    }

    /// Resolves a storage server for the given tracker command, e.g.
    /// [`TrackerCommand::QueryUpdate`] for operations that must reach the
    /// source server
    pub async fn query_storage_location_for(
        &self,
        group_name: &str,
        remote_filename: &str,
        command: TrackerCommand,
    ) -> Result<StorageServer> {
        let frame = query_frame(command.into(), group_name, remote_filename)?;
        let body = self.round_trip(&self.tracker_pool, &frame, -1).await?;

        if body.len() < TRACKER_QUERY_STORAGE_FETCH_BODY_LEN
            || (body.len() - TRACKER_QUERY_STORAGE_FETCH_BODY_LEN) % (FDFS_IPADDR_SIZE - 1) != 0
        {
            return Err(FdfsError::InvalidResponse(format!(
                "storage location body length {}",
                body.len()
            )));
        }

        let group_name = read_cstr(&body[..FDFS_GROUP_NAME_MAX_LEN]);
        let ip_addr = read_cstr(
            &body[FDFS_GROUP_NAME_MAX_LEN..FDFS_GROUP_NAME_MAX_LEN + FDFS_IPADDR_SIZE - 1],
        );
        let port = read_i64(&body, FDFS_GROUP_NAME_MAX_LEN + FDFS_IPADDR_SIZE - 1) as u16;

        Ok(StorageServer {
            group_name,
            ip_addr,
            port,
        })
    }

    /// Opens a pull-mode download of `size` bytes starting at `offset`;
    /// `size` 0 means the rest of the file.
    ///
    /// The returned handle must be closed exactly once.
    pub async fn download(&self, file_id: &str, offset: i64, size: i64) -> Result<Download> {
        let (group_name, remote_filename, pool, conn) =
            self.storage_conn(file_id, offset, size).await?;
        Download::start(pool, conn, offset, size, &group_name, &remote_filename).await
    }

    /// Streams a download into `sink`, returning the number of bytes
    /// transferred
    pub async fn download_to<W>(
        &self,
        file_id: &str,
        offset: i64,
        size: i64,
        sink: &mut W,
    ) -> Result<i64>
    where
        W: AsyncWrite + Unpin,
    {
        let (group_name, remote_filename, pool, conn) =
            self.storage_conn(file_id, offset, size).await?;
        storage::download_to(pool, conn, offset, size, &group_name, &remote_filename, sink).await
    }

    /// Usage counters of the default (tracker) pool
    pub async fn stats(&self) -> Stats {
        self.tracker_pool.stats().await
    }

    /// Closes every pool. Safe to call more than once; subsequent operations
    /// fail with [`FdfsError::PoolClosed`].
    pub async fn close(&self) {
        self.tracker_pool.close().await;
        let pools: Vec<_> = self.store_pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.close().await;
        }
    }

    async fn storage_conn(
        &self,
        file_id: &str,
        offset: i64,
        size: i64,
    ) -> Result<(String, String, Arc<ConnPool>, Conn)> {
        if offset < 0 || size < 0 {
            return Err(FdfsError::InvalidArgument(format!(
                "negative download range: offset {}, size {}",
                offset, size
            )));
        }
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let server = self
            .query_storage_location(&group_name, &remote_filename)
            .await?;
        let addr = format!("{}:{}", server.ip_addr, server.port);
        let pool = self.store_pool(&addr).await?;
        let conn = self.conn_for(&pool).await?;
        Ok((group_name, remote_filename, pool, conn))
    }

    /// Returns the pool for a storage endpoint, creating it on first use
    async fn store_pool(&self, addr: &str) -> Result<Arc<ConnPool>> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(FdfsError::InvalidResponse(
                "empty storage address".to_string(),
            ));
        }
        if addr == self.opt.addr {
            return Ok(self.tracker_pool.clone());
        }

        let mut pools = self.store_pools.lock().await;
        let pool = pools.entry(addr.to_string()).or_insert_with(|| {
            ConnPool::new(pool_options(
                &self.opt,
                default_dialer(addr, self.opt.dial_timeout),
            ))
        });
        Ok(pool.clone())
    }

    /// Checks out a connection; a pool hit is verified with an active-test
    /// ping before use
    async fn conn_for(&self, pool: &Arc<ConnPool>) -> Result<Conn> {
        let (mut conn, is_new) = pool.get().await?;
        if !is_new {
            if let Err(err) = active_test(&mut conn).await {
                debug!(%err, "pooled connection failed active test");
                pool.remove(conn);
                return Err(err);
            }
        }
        Ok(conn)
    }

    /// One request/response exchange over a pool-managed connection.
    ///
    /// The connection goes back to the pool only after a clean, fully
    /// consumed exchange; any failure removes it, since an unread body would
    /// desynchronize the next request on a reused socket.
    async fn round_trip(
        &self,
        pool: &Arc<ConnPool>,
        frame: &[u8],
        expect_len: i64,
    ) -> Result<Vec<u8>> {
        let mut conn = self.conn_for(pool).await?;
        let result = async {
            conn.write_all(frame).await?;
            recv_package(&mut conn, FDFS_PROTO_CMD_RESP, expect_len).await
        }
        .await;

        match result {
            Ok(body) => {
                pool.put(conn).await;
                Ok(body)
            }
            Err(err) => {
                pool.remove(conn);
                Err(err)
            }
        }
    }
}

/// Whether a file's true metadata must come from the server: trunk-length
/// names, over-length names without the trunk mark, and appender files
fn needs_storage_query(name_len: usize, raw_size: i64) -> bool {
    name_len > TRUNK_LOGIC_FILENAME_LENGTH
        || (name_len > NORMAL_LOGIC_FILENAME_LENGTH && raw_size & TRUNK_FILE_MARK_SIZE == 0)
        || raw_size & APPENDER_FILE_MARK_SIZE != 0
}

fn pool_options(config: &ClientConfig, dialer: crate::connection::Dialer) -> PoolOptions {
    PoolOptions {
        dialer,
        pool_size: config.pool_size(),
        pool_timeout: config.pool_timeout(),
        idle_timeout: config.idle_timeout,
        idle_check_frequency: config.idle_check_frequency,
    }
}

/// Frames a `{padded group name, remote name}` query under `cmd`
fn query_frame(cmd: u8, group_name: &str, remote_filename: &str) -> Result<BytesMut> {
    if group_name.is_empty() || group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
        return Err(FdfsError::InvalidArgument(format!(
            "invalid group name: {:?}",
            group_name
        )));
    }

    let body_len = FDFS_GROUP_NAME_MAX_LEN + remote_filename.len();
    let mut frame = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + body_len);
    frame.put(encode_header(body_len as i64, cmd, 0));
    frame.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
    frame.put_slice(remote_filename.as_bytes());
    Ok(frame)
}
