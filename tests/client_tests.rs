//! End-to-end client behavior against a mock tracker/storage server.
//!
//! The mock answers every exchange the client speaks: active test,
//! query-file-info, storage-location fetch (pointing back at itself so it
//! also plays the storage role, which additionally exercises the pool-sharing
//! path for a storage address equal to the tracker address), and download.
//! Accepted-connection counts make pooling and poisoning observable from the
//! outside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use fdfs::{base64, Client, ClientConfig, FdfsError};

const PAYLOAD_LEN: usize = 70_000;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i * 31 % 251) as u8).collect()
}

struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockServer {
    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_mock() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_conn(stream, addr));
        }
    });
    MockServer {
        addr,
        accepted,
        handle,
    }
}

async fn respond(stream: &mut TcpStream, status: u8, body: &[u8]) {
    let mut frame = Vec::with_capacity(10 + body.len());
    frame.extend_from_slice(&(body.len() as i64).to_be_bytes());
    frame.push(100);
    frame.push(status);
    frame.extend_from_slice(body);
    let _ = stream.write_all(&frame).await;
}

async fn serve_conn(mut stream: TcpStream, self_addr: SocketAddr) {
    loop {
        let mut header = [0u8; 10];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let body_len = i64::from_be_bytes(header[..8].try_into().unwrap()) as usize;
        let cmd = header[8];
        let mut body = vec![0u8; body_len];
        if body_len > 0 && stream.read_exact(&mut body).await.is_err() {
            return;
        }

        match cmd {
            // active test: header-only ack
            111 => respond(&mut stream, 0, &[]).await,

            // query file info: fixed sample record
            22 => {
                let mut resp = Vec::new();
                resp.extend_from_slice(&1024i64.to_be_bytes());
                resp.extend_from_slice(&1_700_000_000i64.to_be_bytes());
                resp.extend_from_slice(&0x12345678i64.to_be_bytes());
                let mut ip = [0u8; 16];
                ip[..8].copy_from_slice(b"10.0.0.5");
                resp.extend_from_slice(&ip);
                respond(&mut stream, 0, &resp).await;
            }

            // storage fetch: this server is also the storage node
            102 => {
                let mut resp = Vec::new();
                let mut group = [0u8; 16];
                group[..6].copy_from_slice(b"group1");
                resp.extend_from_slice(&group);
                let mut ip = [0u8; 15];
                let ip_str = self_addr.ip().to_string();
                ip[..ip_str.len()].copy_from_slice(ip_str.as_bytes());
                resp.extend_from_slice(&ip);
                resp.extend_from_slice(&(self_addr.port() as i64).to_be_bytes());
                respond(&mut stream, 0, &resp).await;
            }

            // download: remote name selects the scenario
            14 => {
                let remote = String::from_utf8_lossy(&body[32..]).to_string();
                let data = payload();
                if remote.contains("missing") {
                    respond(&mut stream, 2, &[]).await;
                } else if remote.contains("truncated") {
                    // advertise the full length, deliver a fraction, sever
                    let mut frame = Vec::new();
                    frame.extend_from_slice(&(data.len() as i64).to_be_bytes());
                    frame.push(100);
                    frame.push(0);
                    frame.extend_from_slice(&data[..1000]);
                    let _ = stream.write_all(&frame).await;
                    return;
                } else {
                    let offset = i64::from_be_bytes(body[..8].try_into().unwrap()) as usize;
                    let size = i64::from_be_bytes(body[8..16].try_into().unwrap()) as usize;
                    let start = offset.min(data.len());
                    let end = if size == 0 {
                        data.len()
                    } else {
                        (start + size).min(data.len())
                    };
                    respond(&mut stream, 0, &data[start..end]).await;
                }
            }

            _ => return,
        }
    }
}

fn test_client(server: &MockServer) -> Client {
    let config = ClientConfig::new(server.addr.to_string())
        .with_pool_size(4)
        .with_dial_timeout(Duration::from_secs(1));
    Client::new(config).unwrap()
}

/// Remote name carrying a decodable metadata fragment for the given fields
fn fast_path_remote(ip: u32, ts: u32, raw_size: i64, crc: u32) -> String {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&ip.to_be_bytes());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&raw_size.to_be_bytes());
    buf.extend_from_slice(&crc.to_be_bytes());
    let encoded = base64::encode(&buf);
    // 20 bytes encode to 28 symbols with one trailing pad; remote names carry
    // the 27 significant ones
    assert_eq!(encoded.len(), 28);
    format!("M00/00/00/{}.abcdef", &encoded[..27])
}

#[tokio::test]
async fn file_info_decodes_locally_without_network() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    let remote = fast_path_remote(0x0a000005, 1_700_000_000, i64::MIN | 1024, 0x12345678);
    let info = client
        .get_file_info(&format!("group1/{}", remote))
        .await
        .unwrap();

    assert_eq!(info.file_size, 1024);
    assert_eq!(info.crc32, 0x12345678);
    assert_eq!(info.source_ip_addr, "10.0.0.5");
    assert_eq!(
        info.create_time,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );
    assert_eq!(server.accepted(), 0, "fast path must not touch the network");

    client.close().await;
}

#[tokio::test]
async fn file_info_without_exact_size_bit_is_unknown() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    // sign bit clear: size not derivable from the name
    let remote = fast_path_remote(0x7f000001, 1_600_000_000, 0, 42);
    let info = client
        .get_file_info(&format!("group1/{}", remote))
        .await
        .unwrap();

    assert_eq!(info.file_size, -1);
    assert_eq!(info.source_ip_addr, "127.0.0.1");
    assert_eq!(server.accepted(), 0);

    client.close().await;
}

#[tokio::test]
async fn short_remote_name_is_invalid() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    // 41-character remote name, below the minimum structural length
    let err = client
        .get_file_info("group1/M00/C0/3B/AAAAAAAAAAAAAAAAAAAAAAAAAAA.jpg")
        .await
        .unwrap_err();
    assert!(matches!(err, FdfsError::InvalidFileId(_)), "got {:?}", err);

    let err = client.get_file_info("no-separator").await.unwrap_err();
    assert!(matches!(err, FdfsError::InvalidFileId(_)));

    client.close().await;
}

#[tokio::test]
async fn appender_mark_falls_back_to_server_query() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    let raw_size = i64::MIN | (512i64 << 50) | 7;
    let remote = fast_path_remote(0x0a000005, 1_700_000_000, raw_size, 1);
    let info = client
        .get_file_info(&format!("group1/{}", remote))
        .await
        .unwrap();

    // values come from the server record, not the fragment
    assert_eq!(info.file_size, 1024);
    assert_eq!(info.crc32, 0x12345678);
    assert_eq!(server.accepted(), 1);

    client.close().await;
}

#[tokio::test]
async fn slow_path_parses_the_fixed_record() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    // over-trunk-length remote name always queries the server
    let remote = format!("M00/00/00/{}", "A".repeat(51));
    let info = client
        .get_file_info(&format!("group1/{}", remote))
        .await
        .unwrap();

    assert_eq!(info.file_size, 1024);
    assert_eq!(
        info.create_time,
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    );
    assert_eq!(info.crc32, 0x12345678);
    assert_eq!(info.source_ip_addr, "10.0.0.5");

    // the exchange went over one pooled connection, returned afterwards
    assert_eq!(server.accepted(), 1);
    let stats = client.stats().await;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.pool_conns, 1);

    client.close().await;
}

#[tokio::test]
async fn storage_location_resolves_through_tracker() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    let location = client
        .query_storage_location("group1", "M00/00/00/file.bin")
        .await
        .unwrap();
    assert_eq!(location.group_name, "group1");
    assert_eq!(location.ip_addr, server.addr.ip().to_string());
    assert_eq!(location.port, server.addr.port());

    client.close().await;
}

#[tokio::test]
async fn pull_download_streams_and_repools_the_connection() {
    let server = spawn_mock().await;
    let client = test_client(&server);
    let expected = payload();

    let mut download = client
        .download("group1/M00/00/00/file.bin", 0, 0)
        .await
        .unwrap();
    assert_eq!(download.length(), expected.len() as i64);

    let mut out = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = download.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(out, expected);
    download.close().await;

    // the tracker exchange and the download shared one pooled connection,
    // and a second download reuses it
    assert_eq!(server.accepted(), 1);
    let mut second = client
        .download("group1/M00/00/00/file.bin", 0, 0)
        .await
        .unwrap();
    let mut out = Vec::new();
    loop {
        let n = second.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(out, expected);
    second.close().await;
    assert_eq!(server.accepted(), 1);

    client.close().await;
}

#[tokio::test]
async fn push_download_delivers_ranges() {
    let server = spawn_mock().await;
    let client = test_client(&server);
    let expected = payload();

    let mut out = Vec::new();
    let n = client
        .download_to("group1/M00/00/00/file.bin", 0, 0, &mut out)
        .await
        .unwrap();
    assert_eq!(n, expected.len() as i64);
    assert_eq!(out, expected);

    let mut range = Vec::new();
    let n = client
        .download_to("group1/M00/00/00/file.bin", 100, 500, &mut range)
        .await
        .unwrap();
    assert_eq!(n, 500);
    assert_eq!(range, expected[100..600]);

    let err = client
        .download_to("group1/M00/00/00/file.bin", -1, 0, &mut Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FdfsError::InvalidArgument(_)));

    client.close().await;
}

#[tokio::test]
async fn push_download_into_a_file() {
    let server = spawn_mock().await;
    let client = test_client(&server);
    let expected = payload();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    let mut file = tokio::fs::File::create(&path).await.unwrap();
    client
        .download_to("group1/M00/00/00/file.bin", 0, 0, &mut file)
        .await
        .unwrap();
    drop(file);

    assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);

    client.close().await;
}

#[tokio::test]
async fn truncated_download_poisons_the_connection() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    let err = client
        .download_to(
            "group1/M00/00/00/truncated.bin",
            0,
            0,
            &mut Vec::new(),
        )
        .await
        .unwrap_err();
    match err {
        FdfsError::ShortPackage { expected, actual } => {
            assert_eq!(expected, PAYLOAD_LEN as u64);
            assert!(actual < expected);
        }
        other => panic!("expected short package, got {:?}", other),
    }

    // the poisoned connection was removed, so the next exchange has to dial
    let before = server.accepted();
    let mut out = Vec::new();
    client
        .download_to("group1/M00/00/00/file.bin", 0, 0, &mut out)
        .await
        .unwrap();
    assert_eq!(out, payload());
    assert_eq!(server.accepted(), before + 1);

    client.close().await;
}

#[tokio::test]
async fn truncated_pull_download_surfaces_short_package() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    let mut download = client
        .download("group1/M00/00/00/truncated.bin", 0, 0)
        .await
        .unwrap();
    assert_eq!(download.length(), PAYLOAD_LEN as i64);

    let mut chunk = [0u8; 8192];
    let err = loop {
        match download.read(&mut chunk).await {
            Ok(0) => panic!("download claimed completion despite truncation"),
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, FdfsError::ShortPackage { .. }), "got {:?}", err);
    assert!(download.consumed() < download.length());
    download.close().await;

    // close after a partial body removes instead of pooling
    let before = server.accepted();
    client
        .query_storage_location("group1", "M00/00/00/file.bin")
        .await
        .unwrap();
    assert_eq!(server.accepted(), before + 1);

    client.close().await;
}

#[tokio::test]
async fn remote_status_is_surfaced() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    let err = client
        .download("group1/M00/00/00/missing.bin", 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, FdfsError::Remote(2)), "got {:?}", err);

    client.close().await;
}

#[tokio::test]
async fn closed_client_rejects_operations() {
    let server = spawn_mock().await;
    let client = test_client(&server);

    client.close().await;
    client.close().await; // idempotent

    let err = client
        .query_storage_location("group1", "M00/00/00/file.bin")
        .await
        .unwrap_err();
    assert!(matches!(err, FdfsError::PoolClosed), "got {:?}", err);
}

#[tokio::test]
async fn rejects_malformed_configuration() {
    assert!(Client::new(ClientConfig::new("")).is_err());
    assert!(Client::new(ClientConfig::new("no-port")).is_err());

    let config = ClientConfig::new("127.0.0.1:22122")
        .with_pool_size(3)
        .with_pool_timeout(Duration::from_millis(10));
    assert_eq!(config.pool_size(), 3);
    assert_eq!(config.pool_timeout(), Duration::from_millis(10));
    assert!(Client::new(config).is_ok());
}
