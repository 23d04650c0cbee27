//! WebSocket server for OCPP 1.6-J connections
//!
//! One task per station: the read loop runs the handler in arrival order,
//! a separate writer task drains the connection's outbox into the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::application::core::SharedChargingCore;
use crate::application::handlers::OcppHandlerV16;
use crate::shared::ShutdownSignal;

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";
const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";
/// Grace period for the writer to flush after the read loop ends
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub struct OcppServer {
    listener: TcpListener,
    core: SharedChargingCore,
    shutdown: ShutdownSignal,
    shutdown_timeout: Duration,
}

impl OcppServer {
    pub async fn bind(
        address: &str,
        core: SharedChargingCore,
        shutdown: ShutdownSignal,
        shutdown_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            core,
            shutdown,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, then wait for open connections
    /// to wind down.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "OCPP 1.6 central system listening");
            info!("Charge points should connect to ws://{}/ocpp/{{charge_point_id}}", addr);
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let core = self.core.clone();
                        let shutdown = self.shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, core, shutdown).await {
                                warn!(%addr, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = self.shutdown.wait() => {
                    info!("WebSocket server received shutdown signal");
                    break;
                }
            }
            while connections.try_join_next().is_some() {}
        }

        let open = connections.len();
        if open > 0 {
            info!(connections = open, "Closing station connections");
        }
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown timeout elapsed, aborting remaining connections");
            connections.abort_all();
        }
        info!("WebSocket server stopped");
    }
}

/// Station identity from the handshake path: `/ocpp/{id}` or `/{id}`.
pub fn extract_charge_point_id(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    let id = path.strip_prefix("ocpp/").unwrap_or(path).trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    core: SharedChargingCore,
    shutdown: ShutdownSignal,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    debug!(%addr, "New TCP connection");

    let mut charge_point_id: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
        let path = req.uri().path();
        let Some(id) = extract_charge_point_id(path) else {
            warn!(%addr, path, "Handshake without charge point id");
            return Err(reject(StatusCode::NOT_FOUND, "expected /ocpp/{charge_point_id}"));
        };

        let requested = req
            .headers()
            .get(SUBPROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if requested.split(',').map(str::trim).any(|p| p == OCPP_SUBPROTOCOL) {
            response
                .headers_mut()
                .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static(OCPP_SUBPROTOCOL));
        } else if !requested.is_empty() {
            warn!(%addr, charge_point_id = id.as_str(), requested, "Station does not offer ocpp1.6");
            return Err(reject(StatusCode::BAD_REQUEST, "unsupported subprotocol"));
        }

        charge_point_id = Some(id);
        Ok(response)
    })
    .await?;

    let Some(charge_point_id) = charge_point_id else {
        return Ok(());
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbox, mut rx) = mpsc::unbounded_channel::<String>();
    let registration = core.handle_connect(&charge_point_id, outbox.clone());
    let connection_id = registration.connection_id;
    info!(
        charge_point_id = charge_point_id.as_str(),
        %addr,
        connection_id,
        evicted = registration.evicted,
        "Station connected"
    );

    let writer = {
        let charge_point_id = charge_point_id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                debug!(charge_point_id = charge_point_id.as_str(), "-> {}", message);
                if let Err(e) = ws_sender.send(Message::Text(message)).await {
                    error!(charge_point_id = charge_point_id.as_str(), error = %e, "Send failed");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        })
    };

    let handler = OcppHandlerV16::new(charge_point_id.clone(), core.clone(), outbox);
    loop {
        let message = tokio::select! {
            message = ws_receiver.next() => message,
            _ = shutdown.wait() => {
                info!(charge_point_id = charge_point_id.as_str(), "Closing connection for shutdown");
                break;
            }
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if core.registry.connection_id(&charge_point_id) != Some(connection_id) {
                    warn!(
                        charge_point_id = charge_point_id.as_str(),
                        connection_id,
                        "Connection replaced by a newer one, dropping"
                    );
                    break;
                }
                if let Some(reply) = handler.handle(&text).await {
                    if handler.outbox.send(reply).is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Binary(data))) => {
                warn!(
                    charge_point_id = charge_point_id.as_str(),
                    bytes = data.len(),
                    "Binary frame ignored"
                );
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(charge_point_id = charge_point_id.as_str(), ?frame, "Close frame received");
                break;
            }
            Some(Ok(_)) => core.registry.touch(&charge_point_id),
            Some(Err(e)) => {
                warn!(charge_point_id = charge_point_id.as_str(), error = %e, "WebSocket error");
                break;
            }
            None => break,
        }
    }

    let stopped = core.handle_disconnect(&charge_point_id, connection_id).await;
    drop(handler);
    info!(
        charge_point_id = charge_point_id.as_str(),
        connection_id,
        force_stopped = stopped.len(),
        "Station disconnected"
    );

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        abort.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn next_text(ws: &mut Client) -> serde_json::Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("no frame within timeout")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn call(ws: &mut Client, frame: &str) {
        ws.send(Message::Text(frame.into())).await.unwrap();
    }

    #[tokio::test]
    async fn station_session_over_loopback() {
        let h = Harness::new().await;
        let shutdown = ShutdownSignal::new();
        let server = OcppServer::bind("127.0.0.1:0", h.core.clone(), shutdown.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(server.run());

        let mut request = format!("ws://{}/ocpp/CP001", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));
        let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(response.headers().get("Sec-WebSocket-Protocol").unwrap(), "ocpp1.6");
        assert!(h.registry.is_online("CP001"));

        call(
            &mut ws,
            r#"[2,"s-1","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Available"}]"#,
        )
        .await;
        let reply = next_text(&mut ws).await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "s-1");

        // The start reply is held back until the driver answers; calls behind
        // it on the same socket are still served.
        call(
            &mut ws,
            r#"[2,"st-1","StartTransaction",{"connectorId":1,"idTag":"driver-1","meterStart":0,"timestamp":"2024-01-01T00:00:00Z"}]"#,
        )
        .await;
        call(&mut ws, r#"[2,"hb-1","Heartbeat",{}]"#).await;
        let reply = next_text(&mut ws).await;
        assert_eq!(reply[1], "hb-1");
        assert!(reply[2]["currentTime"].is_string());

        h.wait_for_pending("driver-1").await;
        assert!(h.confirmations.respond("driver-1", true));
        let reply = next_text(&mut ws).await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "st-1");
        assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
        let transaction_id = reply[2]["transactionId"].as_i64().unwrap() as i32;
        assert!(transaction_id > 0);
        assert_eq!(h.registry.connector_transaction("CP001", 1), Some(transaction_id));

        // Dropping the socket tears the session down and force-stops the transaction
        ws.close(None).await.unwrap();
        drop(ws);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while h.registry.is_online("CP001") || h.ledger.active_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "session was not torn down");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.trigger();
        server_task.await.unwrap();
    }

    #[test]
    fn charge_point_id_from_path() {
        assert_eq!(extract_charge_point_id("/ocpp/CP001"), Some("CP001".into()));
        assert_eq!(extract_charge_point_id("/ocpp/CP001/"), Some("CP001".into()));
        assert_eq!(extract_charge_point_id("/CP002"), Some("CP002".into()));
        assert_eq!(extract_charge_point_id("/ocpp/"), None);
        assert_eq!(extract_charge_point_id("/"), None);
        assert_eq!(extract_charge_point_id("/a/b/c"), None);
    }
}
