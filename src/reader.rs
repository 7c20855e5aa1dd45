//! Buffered frame reader.
//!
//! Reads exact byte counts from a stream, growing an internal scratch buffer
//! as needed; carries no protocol knowledge. The scratch buffer is reused
//! across frames, and growth is capped per step so a corrupt multi-gigabyte
//! length declaration cannot trigger a single huge allocation.

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Largest single allocation step while growing the scratch buffer
const BYTES_ALLOC_LIMIT: usize = 1024 * 1024;

/// Buffered reader over one half of a pooled connection.
///
/// Generic over the stream type so tests can drive it with scripted reads.
#[derive(Debug)]
pub struct FrameReader<R> {
    src: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a stream with a fresh scratch buffer
    pub fn new(src: R) -> Self {
        Self {
            src: BufReader::new(src),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Reads exactly `n` bytes, returning them as a slice of the internal
    /// scratch buffer. The slice is valid until the next call.
    pub async fn read_n(&mut self, n: usize) -> std::io::Result<&[u8]> {
        if self.buf.capacity() >= n {
            self.buf.resize(n, 0);
            self.src.read_exact(&mut self.buf[..n]).await?;
            return Ok(&self.buf[..n]);
        }

        self.buf.clear();
        let mut pos = 0;
        while pos < n {
            let step = (n - self.buf.len()).min(BYTES_ALLOC_LIMIT);
            let filled = self.buf.len();
            self.buf.resize(filled + step, 0);
            let nn = self.src.read_exact(&mut self.buf[pos..]).await?;
            pos += nn;
        }

        Ok(&self.buf[..n])
    }

    /// Reads into a caller-supplied buffer, returning the number of bytes
    /// read; 0 signals end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.src.read(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn read_n_accumulates_across_short_reads() {
        let mock = Builder::new()
            .read(b"abc")
            .read(b"defg")
            .read(b"hij")
            .build();
        let mut reader = FrameReader::new(mock);
        assert_eq!(reader.read_n(10).await.unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn read_n_reuses_scratch_between_frames() {
        let mock = Builder::new().read(b"0123456789").build();
        let mut reader = FrameReader::new(mock);
        assert_eq!(reader.read_n(4).await.unwrap(), b"0123");
        assert_eq!(reader.read_n(6).await.unwrap(), b"456789");
    }

    #[tokio::test]
    async fn read_n_fails_on_truncated_stream() {
        let mock = Builder::new().read(b"abc").build();
        let mut reader = FrameReader::new(mock);
        let err = reader.read_n(8).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_passes_through_stream_chunks() {
        let mock = Builder::new().read(b"hello").build();
        let mut reader = FrameReader::new(mock);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
