//! Full-duplex byte relay between two streams

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Copy bytes in both directions until either direction finishes.
///
/// The two directions run concurrently; the first to end (EOF or error)
/// wins the race, after which both streams are dropped and therefore
/// closed, which unblocks the losing direction on the peer side. The
/// completed direction is flushed before the race resolves.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = tokio::io::copy(&mut a_read, &mut b_write) => match result {
            Ok(n) => debug!(bytes = n, "forward direction finished"),
            Err(error) => trace!(%error, "forward direction errored"),
        },
        result = tokio::io::copy(&mut b_read, &mut a_write) => match result {
            Ok(n) => debug!(bytes = n, "reverse direction finished"),
            Err(error) => trace!(%error, "reverse direction errored"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relays_bytes_both_ways() {
        let (mut client, client_side) = duplex(64);
        let (mut backend, backend_side) = duplex(64);

        let relay = tokio::spawn(splice(client_side, backend_side));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_one_side_unblocks_the_other() {
        let (client, client_side) = duplex(64);
        let (mut backend, backend_side) = duplex(64);

        let relay = tokio::spawn(splice(client_side, backend_side));

        // Ending the client stream must end the splice, which closes the
        // backend-facing stream and turns a blocked read into EOF.
        drop(client);

        let read = tokio::time::timeout(Duration::from_secs(1), async {
            let mut buf = [0u8; 8];
            backend.read(&mut buf).await.unwrap()
        })
        .await
        .expect("backend read should unblock once the client side closes");
        assert_eq!(read, 0);

        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_bytes_in_flight_are_flushed_before_close() {
        let (mut client, client_side) = duplex(64);
        let (mut backend, backend_side) = duplex(64);

        let relay = tokio::spawn(splice(client_side, backend_side));

        // Write a response and close immediately, as a backend would.
        backend.write_all(b"HTTP/1.1 200 OK\r\n\r\nok").await.unwrap();
        drop(backend);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HTTP/1.1 200 OK\r\n\r\nok");

        relay.await.unwrap();
    }
}
