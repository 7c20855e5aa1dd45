//! Protocol header codec and framing.
//!
//! Every exchange is one frame: a fixed 10-byte header followed by the
//! declared body.
//!
//! ```text
//! +---------------------+---------+---------+
//! | body length (int64) | command | status  |
//! | 8 bytes, big-endian | 1 byte  | 1 byte  |
//! +---------------------+---------+---------+
//! ```
//!
//! Requests always carry status 0; a response is accepted only with status 0,
//! the expected command, and a non-negative body length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::connection::Conn;
use crate::errors::{FdfsError, Result};
use crate::types::{
    FDFS_GROUP_NAME_MAX_LEN, FDFS_PROTO_CMD_ACTIVE_TEST, FDFS_PROTO_CMD_RESP,
    FDFS_PROTO_HEADER_LEN,
};

/// Largest single allocation step while receiving a declared body
const BODY_ALLOC_LIMIT: usize = 1024 * 1024;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the body that follows the header
    pub length: i64,
    /// Command code
    pub cmd: u8,
    /// Status code; 0 means success
    pub status: u8,
}

/// Encodes a header into its 10-byte wire form
pub fn encode_header(length: i64, cmd: u8, status: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN);
    buf.put_i64(length);
    buf.put_u8(cmd);
    buf.put_u8(status);
    buf.freeze()
}

/// Decodes a header from a buffer of at least 10 bytes
pub fn decode_header(data: &[u8]) -> Result<Header> {
    if data.len() < FDFS_PROTO_HEADER_LEN {
        return Err(FdfsError::InvalidResponse(format!(
            "header too short: {} bytes",
            data.len()
        )));
    }
    let mut buf = &data[..FDFS_PROTO_HEADER_LEN];
    let length = buf.get_i64();
    let cmd = buf.get_u8();
    let status = buf.get_u8();
    Ok(Header { length, cmd, status })
}

/// Writes a request header; request status is always 0
pub async fn send_header(conn: &mut Conn, length: i64, cmd: u8) -> Result<()> {
    conn.write_all(&encode_header(length, cmd, 0)).await?;
    Ok(())
}

/// Reads and validates a response header.
///
/// `expect_len < 0` accepts any non-negative declared length, for exchanges
/// whose body length is only known from the reply.
pub async fn recv_header(conn: &mut Conn, expect_cmd: u8, expect_len: i64) -> Result<Header> {
    let header = {
        let data = conn.reader().read_n(FDFS_PROTO_HEADER_LEN).await?;
        decode_header(data)?
    };

    if header.cmd != expect_cmd {
        return Err(FdfsError::UnexpectedCommand {
            expected: expect_cmd,
            actual: header.cmd,
        });
    }
    if header.status != 0 {
        return Err(FdfsError::Remote(header.status));
    }
    if header.length < 0 {
        return Err(FdfsError::NegativeBodyLength(header.length));
    }
    if expect_len >= 0 && header.length != expect_len {
        return Err(FdfsError::LengthMismatch {
            expected: expect_len,
            actual: header.length,
        });
    }

    conn.touch();
    Ok(header)
}

/// Receives a full frame: validated header plus its declared body.
///
/// Short reads are accumulated until the body is complete; a clean
/// end-of-stream before that is a [`FdfsError::ShortPackage`] failure.
pub async fn recv_package(conn: &mut Conn, expect_cmd: u8, expect_len: i64) -> Result<Vec<u8>> {
    let header = recv_header(conn, expect_cmd, expect_len).await?;
    let total = header.length as usize;

    let mut body: Vec<u8> = Vec::with_capacity(total.min(BODY_ALLOC_LIMIT));
    let mut received = 0;
    while received < total {
        if received == body.len() {
            let step = (total - body.len()).min(BODY_ALLOC_LIMIT);
            body.resize(body.len() + step, 0);
        }
        let n = conn.reader().read(&mut body[received..]).await?;
        if n == 0 {
            return Err(FdfsError::ShortPackage {
                expected: total as u64,
                actual: received as u64,
            });
        }
        received += n;
    }

    conn.touch();
    Ok(body)
}

/// Liveness probe for a connection taken from the idle list: a header-only
/// ACTIVE_TEST exchange
pub async fn active_test(conn: &mut Conn) -> Result<()> {
    send_header(conn, 0, FDFS_PROTO_CMD_ACTIVE_TEST).await?;
    recv_header(conn, FDFS_PROTO_CMD_RESP, 0).await?;
    Ok(())
}

/// Splits a file ID into group name and remote filename.
///
/// A file ID has the format `"groupName/path/to/file"`, for example
/// `"group1/M00/00/00/wKgBcFxyz.jpg"`.
pub fn split_file_id(file_id: &str) -> Result<(String, String)> {
    let trimmed = file_id.trim();
    let (group_name, remote_filename) = trimmed
        .split_once('/')
        .ok_or_else(|| FdfsError::InvalidFileId(file_id.to_string()))?;

    if group_name.is_empty() || group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
        return Err(FdfsError::InvalidFileId(file_id.to_string()));
    }
    if remote_filename.is_empty() {
        return Err(FdfsError::InvalidFileId(file_id.to_string()));
    }

    Ok((group_name.to_string(), remote_filename.to_string()))
}

/// Pads a string to a fixed-width field with NUL bytes, truncating if longer
pub fn pad_string(s: &str, length: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(length);
    let bytes = s.as_bytes();
    let copy_len = bytes.len().min(length);
    buf.put_slice(&bytes[..copy_len]);
    buf.resize(length, 0);
    buf.freeze()
}

/// Extracts a string from a fixed-width field, stopping at the first NUL
pub fn read_cstr(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Reads a big-endian int64 at `offset`; 0 if the buffer is too short
pub fn read_i64(data: &[u8], offset: usize) -> i64 {
    match data.get(offset..offset + 8) {
        Some(mut field) => field.get_i64(),
        None => 0,
    }
}

/// Reads a big-endian uint32 at `offset`; 0 if the buffer is too short
pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    match data.get(offset..offset + 4) {
        Some(mut field) => field.get_u32(),
        None => 0,
    }
}

/// Renders a uint32 source address as a dotted quad
pub fn ip_to_string(ip: u32) -> String {
    Ipv4Addr::from(ip).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let encoded = encode_header(1024, 14, 0);
        assert_eq!(encoded.len(), FDFS_PROTO_HEADER_LEN);

        let decoded = decode_header(&encoded).unwrap();
        assert_eq!(decoded.length, 1024);
        assert_eq!(decoded.cmd, 14);
        assert_eq!(decoded.status, 0);
    }

    #[test]
    fn header_rejects_short_buffer() {
        assert!(decode_header(&[0u8; 9]).is_err());
    }

    #[test]
    fn split_file_id_variants() {
        let (group, remote) = split_file_id("group1/M00/00/00/test.jpg").unwrap();
        assert_eq!(group, "group1");
        assert_eq!(remote, "M00/00/00/test.jpg");

        assert!(split_file_id("no-separator").is_err());
        assert!(split_file_id("/missing-group").is_err());
        assert!(split_file_id("group1/").is_err());
        assert!(split_file_id("a-group-name-longer-than-16/file.jpg").is_err());
    }

    #[test]
    fn pad_and_read_back() {
        let padded = pad_string("group1", FDFS_GROUP_NAME_MAX_LEN);
        assert_eq!(padded.len(), FDFS_GROUP_NAME_MAX_LEN);
        assert_eq!(read_cstr(&padded), "group1");

        // field without a terminator uses the full width
        assert_eq!(read_cstr(b"abc"), "abc");
    }

    #[test]
    fn integer_fields() {
        let mut buf = BytesMut::new();
        buf.put_i64(-7);
        buf.put_u32(0x0a000005);
        assert_eq!(read_i64(&buf, 0), -7);
        assert_eq!(read_u32(&buf, 8), 0x0a000005);
        // out-of-range reads are zero, matching fixed-width field semantics
        assert_eq!(read_i64(&buf, 8), 0);
    }

    #[test]
    fn ip_rendering() {
        assert_eq!(ip_to_string(0x0a000005), "10.0.0.5");
        assert_eq!(ip_to_string(u32::MAX), "255.255.255.255");
    }
}
