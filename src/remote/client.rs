//! Remote agent RPC client
//!
//! One channel per operation, secure (TLS with root-certificate validation
//! plus the per-call auth tag) or explicitly-opted-in plaintext. Streaming
//! calls consume server-pushed lines in arrival order and can be cancelled
//! through the supplied token, which closes the socket instead of waiting
//! for natural stream completion.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, Result};
use crate::remote::protocol::{
    CallEnvelope, StreamEvent, CHUNK_SIZE, LOG_STREAM_CREATE, PROGRAM_DEVICE, RESET_DEVICE,
    START_DEBUG, STOP_DEBUG,
};

/// Time allowed for the remote agent to acknowledge a debug-lock release
const RELEASE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel flavor, fixed at controller construction
#[derive(Debug, Clone)]
pub enum ChannelSecurity {
    /// TLS channel; `root_cert` adds a PEM root to the trust store
    Secure {
        auth_key: String,
        root_cert: Option<PathBuf>,
    },
    /// Plaintext channel, for explicitly configured trusted networks only
    Insecure,
}

/// Client side of the remote agent protocol
#[derive(Debug)]
pub struct RpcClient {
    host: String,
    security: ChannelSecurity,
}

impl RpcClient {
    pub fn new(host: &str, security: ChannelSecurity) -> Self {
        Self {
            host: host.to_string(),
            security,
        }
    }

    fn auth_key(&self) -> &str {
        match &self.security {
            ChannelSecurity::Secure { auth_key, .. } => auth_key,
            ChannelSecurity::Insecure => "",
        }
    }

    fn url(&self) -> String {
        match self.security {
            ChannelSecurity::Secure { .. } => format!("wss://{}", self.host),
            ChannelSecurity::Insecure => format!("ws://{}", self.host),
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        let url = self.url();
        debug!("connecting to {}", url);
        let connect_failed = |e: tokio_tungstenite::tungstenite::Error| RemoteError::ConnectFailed {
            host: self.host.clone(),
            reason: e.to_string(),
        };

        let (ws, _) = match &self.security {
            ChannelSecurity::Insecure => connect_async(url.as_str()).await.map_err(connect_failed)?,
            ChannelSecurity::Secure { root_cert, .. } => {
                let connector = build_tls_connector(root_cert.as_deref())?;
                connect_async_tls_with_config(url.as_str(), None, false, Some(connector))
                    .await
                    .map_err(connect_failed)?
            }
        };
        Ok(ws)
    }

    /// Open a channel and send the call envelope.
    async fn open_call(&self, envelope: &CallEnvelope) -> Result<WsStream> {
        let mut ws = self.connect().await?;
        let frame =
            serde_json::to_string(envelope).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        ws.send(Message::Text(frame))
            .await
            .map_err(|_| RemoteError::ChannelClosed)?;
        Ok(ws)
    }

    /// Upload the firmware image in fixed-size chunks, then consume the
    /// server's progress stream until completion.
    pub async fn program_device(
        &self,
        image: &Path,
        cancel: &CancellationToken,
        on_line: impl FnMut(&str),
    ) -> Result<()> {
        info!("programming device from {}", image.display());
        let envelope = CallEnvelope::new(PROGRAM_DEVICE, self.auth_key());
        let mut ws = self.open_call(&envelope).await?;

        let mut file = tokio::fs::File::open(image).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                let _ = ws.close(None).await;
                return Err(RemoteError::Cancelled.into());
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ws.send(Message::Binary(buf[..n].to_vec()))
                .await
                .map_err(|_| RemoteError::ChannelClosed)?;
        }
        // Empty chunk marks end of upload.
        ws.send(Message::Binary(Vec::new()))
            .await
            .map_err(|_| RemoteError::ChannelClosed)?;

        consume_stream(&mut ws, cancel, on_line).await
    }

    /// Reset the target; the server streams progress lines until done.
    pub async fn reset_device(
        &self,
        cancel: &CancellationToken,
        on_line: impl FnMut(&str),
    ) -> Result<()> {
        info!("resetting device via {}", self.host);
        let envelope = CallEnvelope::new(RESET_DEVICE, self.auth_key());
        let mut ws = self.open_call(&envelope).await?;
        consume_stream(&mut ws, cancel, on_line).await
    }

    /// Stream the named log until the server closes it or the user cancels.
    pub async fn log_stream_create(
        &self,
        filename: &str,
        cancel: &CancellationToken,
        on_line: impl FnMut(&str),
    ) -> Result<()> {
        info!("opening log stream for {}", filename);
        let envelope =
            CallEnvelope::new(LOG_STREAM_CREATE, self.auth_key()).with_filename(filename);
        let mut ws = self.open_call(&envelope).await?;
        consume_stream(&mut ws, cancel, on_line).await
    }

    /// Hold the remote debug lock for the duration of `body`.
    ///
    /// The lock is acquired before `body` runs and released on every exit
    /// path, including when `body` fails.
    pub async fn debug_session<F, Fut>(&self, cancel: &CancellationToken, body: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let envelope = CallEnvelope::new(START_DEBUG, self.auth_key());
        let mut ws = self.open_call(&envelope).await?;
        wait_for_ack(&mut ws, Some(cancel)).await?;
        info!("remote debug lock acquired");

        let result = body().await;

        let release = self.release_debug_lock(&mut ws).await;
        let _ = ws.close(None).await;
        match (result, release) {
            (Ok(()), release) => release,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!("debug lock release failed: {}", release_err);
                Err(err)
            }
        }
    }

    async fn release_debug_lock(&self, ws: &mut WsStream) -> Result<()> {
        let envelope = CallEnvelope::new(STOP_DEBUG, self.auth_key());
        let frame =
            serde_json::to_string(&envelope).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        ws.send(Message::Text(frame))
            .await
            .map_err(|_| RemoteError::ChannelClosed)?;
        match tokio::time::timeout(RELEASE_ACK_TIMEOUT, wait_for_ack(ws, None)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Protocol("release not acknowledged".to_string()).into()),
        }
    }
}

/// Consume stream events in arrival order until completion or cancellation.
async fn consume_stream(
    ws: &mut WsStream,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancelling active stream");
                let _ = ws.close(None).await;
                return Err(RemoteError::Cancelled.into());
            }
            msg = ws.next() => match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(Message::Text(text))) => {
                    let event: StreamEvent = serde_json::from_str(&text)
                        .map_err(|e| RemoteError::Protocol(e.to_string()))?;
                    if let Some(error) = event.error {
                        return Err(RemoteError::Server(error).into());
                    }
                    if let Some(line) = event.data {
                        on_line(line.trim_end());
                    }
                    if event.done {
                        return Ok(());
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(RemoteError::Protocol(e.to_string()).into()),
            }
        }
    }
}

/// Wait for a `done` event acknowledging a unary call.
async fn wait_for_ack(ws: &mut WsStream, cancel: Option<&CancellationToken>) -> Result<()> {
    loop {
        let msg = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    let _ = ws.close(None).await;
                    return Err(RemoteError::Cancelled.into());
                }
                msg = ws.next() => msg,
            },
            None => ws.next().await,
        };
        match msg {
            None | Some(Ok(Message::Close(_))) => {
                return Err(RemoteError::ChannelClosed.into());
            }
            Some(Ok(Message::Text(text))) => {
                let event: StreamEvent = serde_json::from_str(&text)
                    .map_err(|e| RemoteError::Protocol(e.to_string()))?;
                if let Some(error) = event.error {
                    return Err(RemoteError::Server(error).into());
                }
                if event.done {
                    return Ok(());
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(RemoteError::Protocol(e.to_string()).into()),
        }
    }
}

fn build_tls_connector(root_cert: Option<&Path>) -> Result<Connector> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = root_cert {
        let pem = std::fs::read(path)?;
        let cert = native_tls::Certificate::from_pem(&pem)
            .map_err(|e| RemoteError::Tls(e.to_string()))?;
        builder.add_root_certificate(cert);
    }
    let connector = builder
        .build()
        .map_err(|e| RemoteError::Tls(e.to_string()))?;
    Ok(Connector::NativeTls(connector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use std::io::Write;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerStream = WebSocketStream<TcpStream>;

    async fn read_envelope(ws: &mut ServerStream) -> CallEnvelope {
        let msg = ws.next().await.unwrap().unwrap();
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    async fn send_event(ws: &mut ServerStream, event: StreamEvent) {
        let frame = serde_json::to_string(&event).unwrap();
        ws.send(Message::Text(frame)).await.unwrap();
    }

    /// Bind a one-shot fake agent and return its host:port.
    async fn serve<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        addr.to_string()
    }

    fn client(host: &str) -> RpcClient {
        RpcClient::new(host, ChannelSecurity::Insecure)
    }

    #[tokio::test]
    async fn test_reset_device_consumes_progress_in_order() {
        let host = serve(|mut ws| async move {
            let envelope = read_envelope(&mut ws).await;
            assert_eq!(envelope.method, "reset_device");
            assert_eq!(envelope.signature, "ecived_teser");
            send_event(&mut ws, StreamEvent::line("resetting")).await;
            send_event(&mut ws, StreamEvent::line("reset complete")).await;
            send_event(&mut ws, StreamEvent::done()).await;
        })
        .await;

        let mut lines = Vec::new();
        client(&host)
            .reset_device(&CancellationToken::new(), |line| {
                lines.push(line.to_string())
            })
            .await
            .unwrap();
        assert_eq!(lines, vec!["resetting", "reset complete"]);
    }

    #[tokio::test]
    async fn test_server_error_event_is_surfaced() {
        let host = serve(|mut ws| async move {
            read_envelope(&mut ws).await;
            send_event(
                &mut ws,
                StreamEvent {
                    error: Some("flash locked".to_string()),
                    ..StreamEvent::default()
                },
            )
            .await;
        })
        .await;

        let err = client(&host)
            .reset_device(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("flash locked"));
    }

    #[tokio::test]
    async fn test_program_device_chunked_upload() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&vec![0xA5u8; 5000]).unwrap();
        image.flush().unwrap();

        let host = serve(|mut ws| async move {
            let envelope = read_envelope(&mut ws).await;
            assert_eq!(envelope.method, "program_device");

            let mut total = 0usize;
            let mut chunks = Vec::new();
            loop {
                let msg = ws.next().await.unwrap().unwrap();
                let data = match msg {
                    Message::Binary(data) => data,
                    other => panic!("unexpected frame: {other:?}"),
                };
                if data.is_empty() {
                    break;
                }
                assert!(data.len() <= CHUNK_SIZE);
                chunks.push(data.len());
                total += data.len();
            }
            assert_eq!(total, 5000);
            assert_eq!(chunks, vec![2048, 2048, 904]);
            send_event(&mut ws, StreamEvent::line(&format!("wrote {total} bytes"))).await;
            send_event(&mut ws, StreamEvent::done()).await;
        })
        .await;

        let mut lines = Vec::new();
        client(&host)
            .program_device(image.path(), &CancellationToken::new(), |line| {
                lines.push(line.to_string())
            })
            .await
            .unwrap();
        assert_eq!(lines, vec!["wrote 5000 bytes"]);
    }

    #[tokio::test]
    async fn test_log_stream_cancellation_is_clean() {
        let host = serve(|mut ws| async move {
            let envelope = read_envelope(&mut ws).await;
            assert_eq!(envelope.filename.as_deref(), Some("itm.log"));
            loop {
                send_event(&mut ws, StreamEvent::line("tick")).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        let err = client(&host)
            .log_stream_create("itm.log", &cancel, move |_| canceller.cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Cancelled));
    }

    #[tokio::test]
    async fn test_debug_session_brackets_body() {
        let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel();
        let host = serve(|mut ws| async move {
            let start = read_envelope(&mut ws).await;
            assert_eq!(start.method, "start_debug");
            send_event(&mut ws, StreamEvent::done()).await;

            let stop = read_envelope(&mut ws).await;
            assert_eq!(stop.method, "stop_debug");
            assert_eq!(stop.signature, "gubed_pots");
            send_event(&mut ws, StreamEvent::done()).await;
            stopped_tx.send(()).unwrap();
        })
        .await;

        let mut ran = false;
        client(&host)
            .debug_session(&CancellationToken::new(), || async {
                ran = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(ran);
        stopped_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_debug_session_releases_lock_on_body_failure() {
        let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel();
        let host = serve(|mut ws| async move {
            read_envelope(&mut ws).await;
            send_event(&mut ws, StreamEvent::done()).await;
            let stop = read_envelope(&mut ws).await;
            assert_eq!(stop.method, "stop_debug");
            send_event(&mut ws, StreamEvent::done()).await;
            stopped_tx.send(()).unwrap();
        })
        .await;

        let err = client(&host)
            .debug_session(&CancellationToken::new(), || async {
                Err(LaunchError::Process("gdb returned: 2".to_string()))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gdb returned: 2"));
        // The release still reached the agent.
        stopped_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reports_host() {
        let err = client("127.0.0.1:1")
            .reset_device(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection to 127.0.0.1:1 failed"));
    }
}
