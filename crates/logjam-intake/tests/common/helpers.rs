// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use logjam_intake::config::Config;
use logjam_intake::dispatcher::{Dispatcher, DispatcherService};
use logjam_intake::intake_server::IntakeServer;
use logjam_intake::sink::Sink;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const TEST_TOKEN: &str = "integration-token";

/// A running intake bound to an ephemeral local port
pub struct TestIntake {
    pub addr: SocketAddr,
    pub dispatcher: Dispatcher,
    pub server_cancel: CancellationToken,
    pub dispatcher_cancel: CancellationToken,
    pub server_handle: JoinHandle<std::io::Result<()>>,
    pub dispatcher_handle: JoinHandle<()>,
}

impl TestIntake {
    /// Stops accepting and waits for open connections, then waits for the dispatcher to drain
    pub async fn shutdown(self) {
        self.server_cancel.cancel();
        timeout(Duration::from_secs(5), self.server_handle)
            .await
            .expect("server did not stop")
            .expect("server task failed")
            .expect("server returned an error");
        self.dispatcher_cancel.cancel();
        timeout(Duration::from_secs(5), self.dispatcher_handle)
            .await
            .expect("dispatcher did not stop")
            .expect("dispatcher task failed");
    }
}

pub fn test_config() -> Config {
    Config {
        tokens: logjam_intake::auth::TokenSet::from_config_str(TEST_TOKEN),
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

pub async fn start_intake(config: Config, sink: Arc<dyn Sink>) -> TestIntake {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind ephemeral port");
    let addr = listener.local_addr().expect("Failed to read local address");

    let dispatcher_cancel = CancellationToken::new();
    let (service, dispatcher) = DispatcherService::new(sink, config.dispatcher.clone());
    let dispatcher_handle = tokio::spawn(service.run(dispatcher_cancel.clone()));

    let server = IntakeServer::new(&config, dispatcher.clone());
    let server_cancel = CancellationToken::new();
    let server_handle = {
        let server_cancel = server_cancel.clone();
        tokio::spawn(async move { server.serve(listener, server_cancel).await })
    };

    TestIntake {
        addr,
        dispatcher,
        server_cancel,
        dispatcher_cancel,
        server_handle,
        dispatcher_handle,
    }
}

/// Send an HTTP request over TCP and return the status and body
pub async fn send_tcp_request(
    addr: SocketAddr,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> Result<(StatusCode, String), Box<dyn std::error::Error>> {
    let stream = timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", addr.to_string());
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }

    let body = Bytes::from(body.unwrap_or_default().to_string());
    let request = request_builder.body(Full::new(body))?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;

    let status = response.status();
    let bytes = timeout(Duration::from_secs(2), response.into_body().collect())
        .await??
        .to_bytes();
    Ok((status, String::from_utf8(bytes.to_vec())?))
}

/// Polls `condition` until it holds or the deadline passes
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
