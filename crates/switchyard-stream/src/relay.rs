//! Plain SSE relay

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::pump::{PumpSummary, SsePump, SsePumpOptions};

/// Relay an upstream SSE body unchanged.
///
/// Uses the default limits (4 MiB lines, no ping, no idle timeout) and no
/// hooks. Firing `cancel` ends the relay as a client disconnect.
pub async fn relay_sse<R, W>(
    upstream: R,
    writer: W,
    cancel: CancellationToken,
) -> Result<PumpSummary>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    SsePump::new(SsePumpOptions::default())
        .with_cancel(cancel)
        .run(upstream, writer, &mut ())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_relay_is_byte_transparent() {
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
            ": keep-alive\n\ndata: [DONE]\n\n",
        );
        let (writer, mut client) = tokio::io::duplex(64 * 1024);

        let summary = relay_sse(body.as_bytes(), writer, CancellationToken::new())
            .await
            .unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, body);
        assert_eq!(summary.events, 1);
        assert_eq!(summary.bytes_written, body.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_honors_cancellation() {
        let (_upstream_tx, upstream) = tokio::io::duplex(1024);
        let (writer, _client) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = relay_sse(upstream, writer, cancel).await.unwrap_err();
        assert!(matches!(err, crate::PumpError::ClientDisconnect));
    }
}
