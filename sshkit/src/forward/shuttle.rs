//! Bidirectional byte relay between two streams.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default read size for each direction.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Bytes relayed in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShuttleStats {
    /// Bytes read from the first stream and written to the second.
    pub a_to_b: u64,

    /// Bytes read from the second stream and written to the first.
    pub b_to_a: u64,
}

/// Relay bytes between `a` and `b` until either reaches end of stream.
///
/// Whichever side is readable is read in chunks of at most `chunk_size`
/// bytes and written to the other. Order is preserved per direction. Once
/// one side hits EOF (or errors), both sides are shut down.
pub async fn shuttle<A, B>(a: &mut A, b: &mut B, chunk_size: usize) -> io::Result<ShuttleStats>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut stats = ShuttleStats::default();
    let result = relay(a, b, chunk_size.max(1), &mut stats).await;

    // Either side may already be gone
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;

    result.map(|()| stats)
}

async fn relay<A, B>(a: &mut A, b: &mut B, chunk_size: usize, stats: &mut ShuttleStats) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut from_a = vec![0u8; chunk_size];
    let mut from_b = vec![0u8; chunk_size];

    loop {
        tokio::select! {
            read = a.read(&mut from_a) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                b.write_all(&from_a[..n]).await?;
                b.flush().await?;
                stats.a_to_b += n as u64;
            }
            read = b.read(&mut from_b) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                a.write_all(&from_b[..n]).await?;
                a.flush().await?;
                stats.b_to_a += n as u64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut local, mut a) = duplex(64);
        let (mut b, mut remote) = duplex(64);

        let relay = tokio::spawn(async move { shuttle(&mut a, &mut b, 16).await });

        let request = b"request bytes that exceed one chunk";
        local.write_all(request).await.unwrap();
        let mut got = vec![0u8; request.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, request);

        remote.write_all(b"reply").await.unwrap();
        let mut got = [0u8; 5];
        local.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply");

        // Closing one end finishes the relay and closes the other
        drop(local);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(
            stats,
            ShuttleStats {
                a_to_b: request.len() as u64,
                b_to_a: 5
            }
        );

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
