//! One-shot file-transfer workers for RustyArcade.
//!
//! The multiplexer binds a listener on an ephemeral port, returns the port
//! to the client in its reply, and hands the listener to one of these
//! workers as a detached task. A worker accepts exactly one inbound
//! connection, moves the bytes, and exits. Failures never reach the
//! control channel; the client deduces them from the dead data channel.

use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::logging::{log, log_error, LogLevel};

pub const CHUNK_SIZE: usize = 4096;

/// How long a worker waits for the client's secondary connection.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

async fn accept_one(listener: &TcpListener, what: &str) -> Option<tokio::net::TcpStream> {
    match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
        Ok(Ok((stream, _addr))) => Some(stream),
        Ok(Err(e)) => {
            log_error(&format!("{} accept failed", what), &e);
            None
        }
        Err(_) => {
            log(LogLevel::Transfer, &format!("{} accept timed out", what));
            None
        }
    }
}

/// Receive exactly `filesize` bytes into `path`. A peer that closes early
/// leaves a truncated artifact behind; the catalog entry was committed by
/// the multiplexer before this worker ran.
pub async fn serve_upload(listener: TcpListener, path: PathBuf, filesize: u64) {
    let Some(mut stream) = accept_one(&listener, "Upload").await else {
        return;
    };

    let mut file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            log_error("Cannot open artifact for writing", &e);
            return;
        }
    };

    let mut buffer = [0u8; CHUNK_SIZE];
    let mut remaining = filesize;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        if stream.read_exact(&mut buffer[..want]).await.is_err() {
            break;
        }
        if let Err(e) = file.write_all(&buffer[..want]).await {
            log_error("Failed writing artifact", &e);
            break;
        }
        remaining -= want as u64;
    }

    if let Err(e) = file.flush().await {
        log_error("Failed flushing artifact", &e);
    }
    log(
        LogLevel::Transfer,
        &format!("File saved: {}", path.display()),
    );
}

/// Stream `path` to the client in chunks until EOF; the client knows the
/// expected size from the control-channel reply.
pub async fn serve_download(listener: TcpListener, path: PathBuf) {
    let Some(mut stream) = accept_one(&listener, "Download").await else {
        return;
    };

    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            log_error("Cannot open artifact for reading", &e);
            return;
        }
    };

    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = match file.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_error("Failed reading artifact", &e);
                break;
            }
        };
        if stream.write_all(&buffer[..read]).await.is_err() {
            break;
        }
    }

    log(
        LogLevel::Transfer,
        &format!("File sent: {}", path.display()),
    );
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpStream;

    async fn ephemeral_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    #[tokio::test]
    async fn upload_writes_exact_byte_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.py");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let (listener, port) = ephemeral_listener().await;
        let worker = tokio::spawn(serve_upload(
            listener,
            path.clone(),
            payload.len() as u64,
        ));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        worker.await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), payload);
    }

    #[tokio::test]
    async fn truncated_upload_stops_at_last_whole_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.py");

        let (listener, port) = ephemeral_listener().await;
        let worker = tokio::spawn(serve_upload(listener, path.clone(), 10_000));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&vec![7u8; CHUNK_SIZE + 100]).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        worker.await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), CHUNK_SIZE);
    }

    #[tokio::test]
    async fn download_streams_until_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.py");
        let payload: Vec<u8> = (0..9_999u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (listener, port) = ephemeral_listener().await;
        let worker = tokio::spawn(serve_download(listener, path));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();

        worker.await.unwrap();
        assert_eq!(received, payload);
    }
}
