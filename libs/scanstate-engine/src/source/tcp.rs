use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use scanstate_api::{Delivery, MessageSource, SourceError, SourceFuture};

use super::channel::{ChannelPublisher, ChannelSource};

// ═══════════════════════════════════════════════════════════════
//  TcpLineSource: newline-delimited envelopes over TCP
// ═══════════════════════════════════════════════════════════════

/// Accepts TCP connections; every non-empty line is one envelope.
///
/// Lines are queued in a [`ChannelSource`], so ack/nack/redelivery behave the
/// same as for the in-process source. Messages not yet settled when the
/// process stops are lost: senders get no acknowledgement over the socket.
pub struct TcpLineSource {
    inner: ChannelSource,
    local_addr: SocketAddr,
    token: CancellationToken,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpLineSource {
    pub async fn bind(addr: &str) -> Result<Self, SourceError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SourceError::Unavailable(format!("bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "tcp source listening");

        let (inner, publisher) = ChannelSource::named(format!("tcp://{local_addr}"));
        let token = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(listener, publisher, token.clone()));

        Ok(Self { inner, local_addr, token, acceptor: Mutex::new(Some(acceptor)) })
    }

    /// Bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, publisher: ChannelPublisher, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "tcp source client connected");
                    tokio::spawn(read_lines(stream, peer, publisher.clone(), token.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tcp source accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    publisher.finish();
    tracing::info!("tcp source acceptor stopped");
}

async fn read_lines(
    stream: TcpStream,
    peer: SocketAddr,
    publisher: ChannelPublisher,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = publisher.publish(line.as_bytes()) {
                    tracing::warn!(%peer, error = %e, "tcp source dropped line");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "tcp source read error");
                break;
            }
        }
    }
    tracing::info!(%peer, "tcp source client disconnected");
}

impl MessageSource for TcpLineSource {
    fn receive(&self) -> SourceFuture<'_, Option<Delivery>> {
        self.inner.receive()
    }

    fn ack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()> {
        self.inner.ack(ack_id)
    }

    fn nack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()> {
        self.inner.nack(ack_id)
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.token.cancel();
            let acceptor = self.acceptor.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(handle) = acceptor {
                let _ = handle.await;
            }
            self.inner.close().await
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn lines_become_deliveries() {
        let source = TcpLineSource::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(source.local_addr()).await.unwrap();
        client.write_all(b"{\"a\":1}\n\n  \n{\"b\":2}\r\n").await.unwrap();
        client.flush().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), source.receive()).await.unwrap().unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), source.receive()).await.unwrap().unwrap().unwrap();
        assert_eq!(first.data, b"{\"a\":1}");
        assert_eq!(second.data, b"{\"b\":2}");
        assert!(first.ack_id.starts_with("tcp://127.0.0.1:"));

        source.ack(&first.ack_id).await.unwrap();
        source.ack(&second.ack_id).await.unwrap();
        source.close().await.unwrap();
        assert_eq!(source.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn bind_failure_is_unavailable() {
        let err = TcpLineSource::bind("256.0.0.1:0").await.err().unwrap();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }
}
