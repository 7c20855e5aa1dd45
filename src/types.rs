//! Protocol types and constants.
//!
//! Wire-level constants, command codes, and the data structures exchanged with
//! tracker and storage servers.

use std::time::{Duration, SystemTime};

use crate::connection::Dialer;

/// Default network port of a tracker server
pub const TRACKER_DEFAULT_PORT: u16 = 22122;

/// Protocol header size: 8-byte body length + command byte + status byte
pub const FDFS_PROTO_HEADER_LEN: usize = 10;
/// Width of every length/port integer on the wire
pub const FDFS_PROTO_PKG_LEN_SIZE: usize = 8;

/// Field size limits
pub const FDFS_GROUP_NAME_MAX_LEN: usize = 16;
/// Fixed width of ip address fields (NUL-terminated within the field)
pub const FDFS_IPADDR_SIZE: usize = 16;
/// Leading `"M00/XX/XX/"` logical path prefix of a remote name
pub const FDFS_LOGIC_FILE_PATH_LEN: usize = 10;
/// Width of the metadata fragment embedded in a remote name
pub const FDFS_FILENAME_BASE64_LENGTH: usize = 27;
/// Maximum file extension length, without the dot
pub const FDFS_FILE_EXT_NAME_MAX_LEN: usize = 6;
/// Extra suffix carried by trunk-file remote names
pub const FDFS_TRUNK_FILE_INFO_LEN: usize = 16;

/// Shortest structurally valid remote name: path prefix, metadata fragment,
/// dot and extension
pub const NORMAL_LOGIC_FILENAME_LENGTH: usize =
    FDFS_LOGIC_FILE_PATH_LEN + FDFS_FILENAME_BASE64_LENGTH + FDFS_FILE_EXT_NAME_MAX_LEN + 1;
/// Remote-name length of a trunk file
pub const TRUNK_LOGIC_FILENAME_LENGTH: usize =
    NORMAL_LOGIC_FILENAME_LENGTH + FDFS_TRUNK_FILE_INFO_LEN;

/// Bit set in the embedded size field of trunk files
pub const TRUNK_FILE_MARK_SIZE: i64 = 512 << 50;
/// Bit set in the embedded size field of appender files
pub const APPENDER_FILE_MARK_SIZE: i64 = TRUNK_FILE_MARK_SIZE;

/// Per-record size of a storage-location response:
/// group(16) + ip(15) + port(8)
pub const TRACKER_QUERY_STORAGE_FETCH_BODY_LEN: usize =
    FDFS_GROUP_NAME_MAX_LEN + FDFS_IPADDR_SIZE - 1 + FDFS_PROTO_PKG_LEN_SIZE;
/// Fixed body size of a query-file-info response:
/// size(8) + create time(8) + crc32(8) + ip(16)
pub const QUERY_FILE_INFO_BODY_LEN: usize = 3 * FDFS_PROTO_PKG_LEN_SIZE + FDFS_IPADDR_SIZE;

/// Chunk size used when pushing a download body into a sink
pub const DOWNLOAD_CHUNK_SIZE: usize = 32 * 1024;

/// Command code of every response header
pub const FDFS_PROTO_CMD_RESP: u8 = 100;
/// Connection liveness probe, valid against tracker and storage servers
pub const FDFS_PROTO_CMD_ACTIVE_TEST: u8 = 111;

/// Tracker protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackerCommand {
    /// Resolve a storage server for upload, any group
    QueryStoreWithoutGroupOne = 101,
    /// Resolve the storage server holding an existing file
    QueryFetchOne = 102,
    /// Resolve the storage server to update an existing file
    QueryUpdate = 103,
}

impl From<TrackerCommand> for u8 {
    fn from(cmd: TrackerCommand) -> u8 {
        cmd as u8
    }
}

/// Storage protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageCommand {
    /// Stream a file body, optionally a byte range of it
    DownloadFile = 14,
    /// Query size, creation time, checksum and origin of a file
    QueryFileInfo = 22,
}

impl From<StorageCommand> for u8 {
    fn from(cmd: StorageCommand) -> u8 {
        cmd as u8
    }
}

/// Information about a stored file.
///
/// Produced either by decoding the metadata fragment embedded in the remote
/// name or by a query-file-info round trip; both paths yield this shape.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Size of the file in bytes, `-1` when it cannot be derived locally
    pub file_size: i64,
    /// Timestamp when the file was created
    pub create_time: SystemTime,
    /// CRC32 checksum of the file
    pub crc32: u32,
    /// IP address of the source storage server
    pub source_ip_addr: String,
}

/// A storage server resolved through the tracker
#[derive(Debug, Clone)]
pub struct StorageServer {
    /// Group the server belongs to
    pub group_name: String,
    /// IP address of the storage server
    pub ip_addr: String,
    /// Port number of the storage server
    pub port: u16,
}

/// Client configuration options.
///
/// Zero-ish values (`pool_size == 0`, `pool_timeout == None`) mean "use the
/// derived default"; the resolved values are available through [`Self::pool_size`]
/// and [`Self::pool_timeout`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Tracker address in `"host:port"` format
    pub addr: String,
    /// Dial function used by every pool; `None` selects the default TCP dialer
    pub dialer: Option<Dialer>,
    /// Timeout for establishing a connection
    pub dial_timeout: Duration,
    /// Maximum connections per pool; 0 selects `10 × available parallelism`
    pub pool_size: usize,
    /// Maximum wait for a pool admission slot; `None` selects the dial timeout
    pub pool_timeout: Option<Duration>,
    /// Idle time after which a pooled connection is considered stale
    pub idle_timeout: Duration,
    /// How often the background reaper scans for stale connections
    pub idle_check_frequency: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", TRACKER_DEFAULT_PORT),
            dialer: None,
            dial_timeout: Duration::from_secs(5),
            pool_size: 0,
            pool_timeout: None,
            idle_timeout: Duration::from_secs(5 * 60),
            idle_check_frequency: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration pointed at the given tracker address
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Sets a custom dial function
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Sets the connect timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the maximum number of connections per pool
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the maximum wait for a pool admission slot
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = Some(timeout);
        self
    }

    /// Sets the idle timeout of pooled connections
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the stale-connection scan frequency
    pub fn with_idle_check_frequency(mut self, frequency: Duration) -> Self {
        self.idle_check_frequency = frequency;
        self
    }

    /// Resolved pool capacity
    pub fn pool_size(&self) -> usize {
        if self.pool_size > 0 {
            return self.pool_size;
        }
        10 * std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Resolved admission wait
    pub fn pool_timeout(&self) -> Duration {
        self.pool_timeout.unwrap_or(self.dial_timeout)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("addr", &self.addr)
            .field("dialer", &self.dialer.as_ref().map(|_| "custom"))
            .field("dial_timeout", &self.dial_timeout)
            .field("pool_size", &self.pool_size)
            .field("pool_timeout", &self.pool_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle_check_frequency", &self.idle_check_frequency)
            .finish()
    }
}
