//! Control server: one framed JSON request per connection, handled serially.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use backup_wire::{ControlRequest, ControlResponse, FrameTransport, WireError};

use crate::error::CoordinatorError;
use crate::scheduler::ControlEnvelope;

/// Accept clients until shutdown. Returns an error only when the scheduler
/// can no longer be reached.
pub async fn serve(
    listener: TcpListener,
    requests: mpsc::Sender<ControlEnvelope>,
    mut shutdown: broadcast::Receiver<()>,
    read_timeout: Duration,
) -> Result<(), CoordinatorError> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "control accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "control client connected");
                handle_client(stream, &requests, read_timeout).await?;
            }
        }
    }
    Ok(())
}

/// Serve one client: read a request, forward it, write the reply.
pub async fn handle_client<S>(
    stream: S,
    requests: &mpsc::Sender<ControlEnvelope>,
    read_timeout: Duration,
) -> Result<(), CoordinatorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transport = FrameTransport::new(stream);

    let text = match tokio::time::timeout(read_timeout, transport.receive_text()).await {
        Ok(Ok(text)) => text,
        Ok(Err(WireError::PeerClosed)) => {
            tracing::debug!("control client closed before sending a request");
            return Ok(());
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "unreadable control request");
            reply(transport, ControlResponse::error(err.to_string())).await;
            return Ok(());
        }
        Err(_) => {
            tracing::warn!(timeout = ?read_timeout, "control client sent nothing, dropping");
            transport.abort();
            return Ok(());
        }
    };

    let request = match ControlRequest::parse(&text) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "malformed control request");
            reply(transport, ControlResponse::error(err.to_string())).await;
            return Ok(());
        }
    };

    let (respond_to, response) = oneshot::channel();
    if requests
        .send(ControlEnvelope {
            request,
            respond_to,
        })
        .await
        .is_err()
    {
        reply(transport, ControlResponse::abort()).await;
        return Err(CoordinatorError::ChannelClosed("scheduler requests"));
    }

    match response.await {
        Ok(response) => {
            reply(transport, response).await;
            Ok(())
        }
        Err(_) => {
            reply(transport, ControlResponse::abort()).await;
            Err(CoordinatorError::ChannelClosed("scheduler replies"))
        }
    }
}

/// Best effort: the client may already be gone.
async fn reply<S>(mut transport: FrameTransport<S>, response: ControlResponse)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = match serde_json::to_string(&response) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode control response");
            return;
        }
    };
    if let Err(err) = transport.send_text(&payload).await {
        tracing::debug!(error = %err, "control reply not delivered");
        return;
    }
    if let Err(err) = transport.close().await {
        tracing::debug!(error = %err, "control connection close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{duplex, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn exchange(client: DuplexStream, text: &str) -> Value {
        let mut transport = FrameTransport::new(client);
        transport.send_text(text).await.expect("send");
        let reply = transport.receive_text().await.expect("reply");
        serde_json::from_str(&reply).expect("json")
    }

    #[tokio::test]
    async fn malformed_json_gets_error_reply() {
        let (client, server) = duplex(4096);
        let (tx, mut rx) = mpsc::channel::<ControlEnvelope>(1);

        let served = tokio::spawn(async move { handle_client(server, &tx, TIMEOUT).await });
        let reply = exchange(client, "{not json").await;

        assert_eq!(reply["message"], "ERROR");
        assert!(reply["data"].is_string());
        served.await.unwrap().expect("server keeps running");
        assert!(rx.try_recv().is_err(), "nothing forwarded");
    }

    #[tokio::test]
    async fn extra_fields_are_malformed() {
        let (client, server) = duplex(4096);
        let (tx, _rx) = mpsc::channel::<ControlEnvelope>(1);
        tokio::spawn(async move { handle_client(server, &tx, TIMEOUT).await });

        let reply = exchange(client, r#"{"command":"delete_node","args":{},"x":1}"#).await;
        assert_eq!(reply["message"], "ERROR");
    }

    #[tokio::test]
    async fn valid_request_is_forwarded_and_answered() {
        let (client, server) = duplex(4096);
        let (tx, mut rx) = mpsc::channel::<ControlEnvelope>(1);

        tokio::spawn(async move {
            let envelope = rx.recv().await.expect("envelope");
            assert_eq!(envelope.request.command, "query_backups");
            envelope
                .respond_to
                .send(ControlResponse::ok(json!([])))
                .expect("reply");
        });
        let served = tokio::spawn(async move { handle_client(server, &tx, TIMEOUT).await });

        let reply = exchange(
            client,
            r#"{"command":"query_backups","args":{"name":"n","path":"/p"}}"#,
        )
        .await;
        assert_eq!(reply, json!({"message": "OK", "data": []}));
        served.await.unwrap().expect("served");
    }

    #[tokio::test]
    async fn dead_scheduler_yields_abort_and_error() {
        let (client, server) = duplex(4096);
        let (tx, rx) = mpsc::channel::<ControlEnvelope>(1);
        drop(rx);

        let served = tokio::spawn(async move { handle_client(server, &tx, TIMEOUT).await });
        let reply = exchange(client, r#"{"command":"delete_node","args":{"name":"n"}}"#).await;

        assert_eq!(reply, json!({"message": "ABORT", "data": null}));
        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinatorError::ChannelClosed(_)), "got: {err}");
    }

    #[tokio::test]
    async fn scheduler_dropping_the_reply_yields_abort() {
        let (client, server) = duplex(4096);
        let (tx, mut rx) = mpsc::channel::<ControlEnvelope>(1);
        tokio::spawn(async move {
            let envelope = rx.recv().await.expect("envelope");
            drop(envelope);
        });
        let served = tokio::spawn(async move { handle_client(server, &tx, TIMEOUT).await });

        let reply = exchange(client, r#"{"command":"delete_node","args":{"name":"n"}}"#).await;
        assert_eq!(reply["message"], "ABORT");
        assert!(served.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_dropped_after_timeout() {
        let (client, server) = duplex(4096);
        let (tx, _rx) = mpsc::channel::<ControlEnvelope>(1);

        let served = tokio::spawn(async move { handle_client(server, &tx, TIMEOUT).await });
        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        served.await.unwrap().expect("timeout is not fatal");
        drop(client);
    }

    #[tokio::test]
    async fn serve_stops_on_scheduler_death() {
        let listener = backup_wire::bind_listener("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel::<ControlEnvelope>(1);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        drop(rx);

        let server = tokio::spawn(serve(listener, tx, shutdown_rx, TIMEOUT));
        let response = backup_wire::send_request(
            &addr.to_string(),
            &ControlRequest::new("delete_node", serde_json::Map::new()),
        )
        .await
        .expect("response");

        assert_eq!(response, ControlResponse::abort());
        assert!(server.await.unwrap().is_err());
    }
}
