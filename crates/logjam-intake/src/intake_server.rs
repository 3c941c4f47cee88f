// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::body::{Body as HttpBody, Incoming};
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use serde_json::json;
use std::error::Error;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::AuthGate;
use crate::config::Config;
use crate::decoder::{BodyDecoder, Shape, Strictness};
use crate::dispatcher::Dispatcher;
use crate::http_utils::{
    create_html_response, create_json_response, create_text_response,
    log_and_create_http_response, HttpResponse,
};
use crate::record::{record_from_query, Batch, RepeatedParam};

pub const ROOT_PATH: &str = "/";
pub const DOC_PATH: &str = "/doc";
pub const HEALTH_PATH: &str = "/health";
pub const INFO_PATH: &str = "/info";
pub const LOG_PATH: &str = "/log";
pub const MULTI_PATH: &str = "/multi";

const DOC_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Logjam</title></head>
<body>
<h1>Logjam</h1>
<p>This service accepts log events over HTTP and hands every accepted event to the configured
sink. Authenticated endpoints expect the <code>x-logjam-token</code> header.</p>
<ul>
<li><code>PUT /log?field=value&amp;...</code>: one event built from the query parameters</li>
<li><code>POST /log</code>: one event as a JSON object</li>
<li><code>POST /multi</code>: several events as a JSON array of objects</li>
<li><code>GET /health</code>: liveness check</li>
<li><code>GET /info</code>: endpoints, limits and delivery counters</li>
</ul>
</body>
</html>
"#;

struct IntakeState {
    auth: AuthGate,
    decoder: BodyDecoder,
    dispatcher: Dispatcher,
    single_strictness: Strictness,
    multi_strictness: Strictness,
    repeated_param: RepeatedParam,
    info_config: serde_json::Value,
}

/// HTTP front of the intake. Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct IntakeServer {
    state: Arc<IntakeState>,
}

impl IntakeServer {
    pub fn new(config: &Config, dispatcher: Dispatcher) -> Self {
        let info_config = json!({
            "max_body_bytes": config.max_body_bytes,
            "accepted_content_types": config.accepted_content_types,
            "schema_closed": config.schema.is_closed(),
            "single_strict": config.single_strictness == Strictness::Strict,
            "multi_strict": config.multi_strictness == Strictness::Strict,
            "repeated_param": config.repeated_param.as_str(),
            "dispatch_workers": config.dispatcher.workers,
            "dispatch_queue_size": config.dispatcher.queue_size,
            "dispatch_overflow": config.dispatcher.overflow,
        });

        Self {
            state: Arc::new(IntakeState {
                auth: AuthGate::new(config.tokens.clone()),
                decoder: config.body_decoder(),
                dispatcher,
                single_strictness: config.single_strictness,
                multi_strictness: config.multi_strictness,
                repeated_param: config.repeated_param,
                info_config,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.state.dispatcher
    }

    /// Binds `addr` and serves until `cancel` fires.
    pub async fn start(&self, addr: &str, cancel: CancellationToken) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Logjam intake listening on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    /// Accepts connections until `cancel` fires, then lets open connections finish their
    /// current request and closes them.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> io::Result<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        let intake = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            // called for each http request
            let intake = intake.clone();
            async move { intake.handle(req).await }
        });

        loop {
            let (conn, peer) = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e);
                    }
                    Ok(accepted) => accepted,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // Don't kill server on panic - log and continue
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            let cancel = cancel.clone();
            joinset.spawn(async move {
                let connection = server.serve_connection(conn, service);
                tokio::pin!(connection);
                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    () = cancel.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };
                if let Err(e) = result {
                    debug!("Connection error from {peer}: {e}");
                }
            });
        }

        debug!(
            "Intake server stopped accepting, waiting on {} open connections",
            joinset.len()
        );
        while let Some(finished) = joinset.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Connection handler panicked: {:?}", e);
                }
            }
        }
        Ok(())
    }

    /// Handles one request behind the recovery boundary: the route runs on its own task and a
    /// panic there becomes a generic 500.
    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: HttpBody + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let state = Arc::clone(&self.state);

        match tokio::spawn(async move { state.route(req).await }).await {
            Ok(response) => response,
            Err(e) if e.is_panic() => {
                error!("Handler for {method} {path} panicked: {e:?}");
                log_and_create_http_response(
                    "Internal Server Error",
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
            Err(e) => log_and_create_http_response(
                &format!("Handler for {method} {path} did not complete: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }
}

impl IntakeState {
    async fn route<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: HttpBody,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match (&method, path.as_str()) {
            (&Method::GET, ROOT_PATH) => create_text_response("Go away.", StatusCode::BAD_REQUEST),
            (&Method::GET, DOC_PATH) => create_html_response(DOC_PAGE),
            (&Method::GET, HEALTH_PATH) => create_text_response("ok\n", StatusCode::OK),
            (&Method::GET, INFO_PATH) => self.info_handler(),
            (&Method::PUT, LOG_PATH) => self.log_query_handler(req).await,
            (&Method::POST, LOG_PATH) => {
                self.log_body_handler(req, Shape::Object, self.single_strictness, "ok\n")
                    .await
            }
            (&Method::POST, MULTI_PATH) => {
                self.log_body_handler(req, Shape::ArrayOfObjects, self.multi_strictness, "ok")
                    .await
            }
            (_, ROOT_PATH | DOC_PATH | HEALTH_PATH | INFO_PATH | LOG_PATH | MULTI_PATH) => {
                log_and_create_http_response(
                    &format!("Method {method} is not allowed on {path}"),
                    StatusCode::METHOD_NOT_ALLOWED,
                )
            }
            _ => log_and_create_http_response(
                &format!("No route for {path}"),
                StatusCode::NOT_FOUND,
            ),
        }
    }

    /// Builds one record from the query string.
    async fn log_query_handler<B>(&self, req: Request<B>) -> http::Result<HttpResponse> {
        if let Err(e) = self.auth.authorize(req.headers()) {
            return log_and_create_http_response(&e.to_string(), e.status_code());
        }
        let record = record_from_query(req.uri().query(), self.repeated_param);
        self.dispatch_records(vec![record], "ok").await
    }

    async fn log_body_handler<B>(
        &self,
        req: Request<B>,
        shape: Shape,
        strictness: Strictness,
        success_body: &'static str,
    ) -> http::Result<HttpResponse>
    where
        B: HttpBody,
        B::Error: Into<Box<dyn Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        if let Err(e) = self.auth.authorize(&parts.headers) {
            return log_and_create_http_response(&e.to_string(), e.status_code());
        }

        match self
            .decoder
            .decode(&parts.headers, body, shape, strictness)
            .await
        {
            Ok(decoded) => {
                self.dispatch_records(decoded.into_records(), success_body)
                    .await
            }
            Err(e) => log_and_create_http_response(&e.to_string(), e.status_code()),
        }
    }

    async fn dispatch_records(
        &self,
        records: Batch,
        success_body: &'static str,
    ) -> http::Result<HttpResponse> {
        let count = records.len();
        match self.dispatcher.dispatch_batch(records).await {
            Ok(()) => {
                debug!("Accepted {count} log records");
                create_text_response(success_body, StatusCode::OK)
            }
            Err(e) => log_and_create_http_response(&e.to_string(), e.status_code()),
        }
    }

    fn info_handler(&self) -> http::Result<HttpResponse> {
        let response_json = json!(
            {
                "endpoints": [
                    ROOT_PATH,
                    DOC_PATH,
                    HEALTH_PATH,
                    INFO_PATH,
                    LOG_PATH,
                    MULTI_PATH
                ],
                "config": self.info_config,
                "stats": self.dispatcher.stats(),
                "queued": self.dispatcher.queued()
            }
        );
        create_json_response(&response_json, StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{TokenSet, TOKEN_HEADER};
    use crate::dispatcher::{DispatcherService, DispatcherSettings, OverflowPolicy};
    use crate::record::LogRecord;
    use crate::sink::{Sink, SinkError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Frame;
    use hyper::header;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;

    const TOKEN: &str = "test-token";

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<LogRecord>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn deliver(&self, record: LogRecord) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    /// Panics as soon as anything tries to read it.
    struct PanickingBody;

    impl HttpBody for PanickingBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            panic!("body exploded");
        }
    }

    fn test_config() -> Config {
        Config {
            tokens: TokenSet::from_config_str(TOKEN),
            max_body_bytes: 64,
            ..Default::default()
        }
    }

    fn running_server() -> (IntakeServer, Arc<RecordingSink>, CancellationToken) {
        let sink = Arc::new(RecordingSink::default());
        let config = test_config();
        let (service, dispatcher) =
            DispatcherService::new(sink.clone(), config.dispatcher.clone());
        let cancel = CancellationToken::new();
        tokio::spawn(service.run(cancel.clone()));
        (IntakeServer::new(&config, dispatcher), sink, cancel)
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn body_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn wait_for_records(sink: &RecordingSink, expected: usize) {
        for _ in 0..500 {
            if sink.records.lock().unwrap().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sink never received {expected} records");
    }

    #[tokio::test]
    async fn test_root_says_go_away() {
        let (server, _, _) = running_server();
        let response = server
            .handle(request(Method::GET, "/", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Go away.");
    }

    #[tokio::test]
    async fn test_doc_and_health() {
        let (server, _, _) = running_server();

        let response = server
            .handle(request(Method::GET, "/doc", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("<h1>Logjam</h1>"));

        let response = server
            .handle(request(Method::GET, "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok\n");
    }

    #[tokio::test]
    async fn test_info_reports_endpoints_limits_and_stats() {
        let (server, _, _) = running_server();
        let response = server
            .handle(request(Method::GET, "/info", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let info: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            info["endpoints"],
            json!(["/", "/doc", "/health", "/info", "/log", "/multi"])
        );
        assert_eq!(info["config"]["max_body_bytes"], json!(64));
        assert_eq!(info["config"]["dispatch_overflow"], json!("reject"));
        assert_eq!(info["config"]["repeated_param"], json!("first"));
        assert_eq!(info["stats"]["accepted"], json!(0));
        assert_eq!(info["queued"], json!(0));
    }

    #[tokio::test]
    async fn test_unknown_path_and_wrong_method() {
        let (server, _, _) = running_server();

        let response = server
            .handle(request(Method::GET, "/nope", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server
            .handle(request(Method::DELETE, "/log", Some(TOKEN), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = server
            .handle(request(Method::GET, "/multi", Some(TOKEN), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_put_log_requires_token() {
        let (server, sink, _) = running_server();

        let response = server
            .handle(request(Method::PUT, "/log?a=1", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_string(response).await,
            "{\"message\":\"missing key in request header\"}"
        );

        let response = server
            .handle(request(Method::PUT, "/log?a=1", Some("wrong"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, "{\"message\":\"invalid key\"}");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_log_dispatches_query_record() {
        let (server, sink, _) = running_server();
        let response = server
            .handle(request(
                Method::PUT,
                "/log?level=info&msg=hello%20world",
                Some(TOKEN),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");

        wait_for_records(&sink, 1).await;
        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].field_names(), vec!["level", "msg"]);
        assert_eq!(records[0].get("msg"), Some(&json!("hello world")));
    }

    #[tokio::test]
    async fn test_post_log_dispatches_body_record() {
        let (server, sink, _) = running_server();
        let response = server
            .handle(request(
                Method::POST,
                "/log",
                Some(TOKEN),
                r#"{"msg":"hi","n":1}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok\n");

        wait_for_records(&sink, 1).await;
        assert_eq!(
            sink.records.lock().unwrap()[0].field_names(),
            vec!["msg", "n"]
        );
    }

    #[tokio::test]
    async fn test_post_log_decode_failures() {
        let (server, _, _) = running_server();

        let response = server
            .handle(request(Method::POST, "/log", Some(TOKEN), r#"{"a":1"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("badly-formed JSON"));

        let response = server
            .handle(request(Method::POST, "/log", Some(TOKEN), r#"{"a":1}{"b":2}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server
            .handle(request(
                Method::POST,
                "/log",
                Some(TOKEN),
                &format!(r#"{{"a":"{}"}}"#, "x".repeat(100)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut xml = request(Method::POST, "/log", Some(TOKEN), "<a/>");
        xml.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/xml"),
        );
        let response = server.handle(xml).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_post_multi_dispatches_each_element() {
        let (server, sink, _) = running_server();
        let response = server
            .handle(request(
                Method::POST,
                "/multi",
                Some(TOKEN),
                r#"[{"a":1},{"b":2},{"c":3}]"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");

        wait_for_records(&sink, 3).await;
        let mut names = sink
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.field_names().join(","))
            .collect::<Vec<String>>();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_full_queue_answers_service_unavailable() {
        let config = Config {
            dispatcher: DispatcherSettings {
                queue_size: 1,
                overflow: OverflowPolicy::Reject,
                ..Default::default()
            },
            ..test_config()
        };
        // No dispatcher service runs, so the single queue slot stays taken.
        let (_service, dispatcher) =
            DispatcherService::new(Arc::new(RecordingSink::default()), config.dispatcher.clone());
        let server = IntakeServer::new(&config, dispatcher);

        let response = server
            .handle(request(Method::PUT, "/log?a=1", Some(TOKEN), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = server
            .handle(request(Method::PUT, "/log?a=2", Some(TOKEN), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.dispatcher().stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_multi_is_admitted_whole_or_not_at_all() {
        let config = Config {
            dispatcher: DispatcherSettings {
                queue_size: 3,
                overflow: OverflowPolicy::Reject,
                ..Default::default()
            },
            ..test_config()
        };
        let (_service, dispatcher) =
            DispatcherService::new(Arc::new(RecordingSink::default()), config.dispatcher.clone());
        let server = IntakeServer::new(&config, dispatcher);

        let response = server
            .handle(request(Method::POST, "/multi", Some(TOKEN), r#"[{"a":1},{"b":2}]"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = server
            .handle(request(Method::POST, "/multi", Some(TOKEN), r#"[{"c":3},{"d":4}]"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.dispatcher().queued(), 2);

        let response = server
            .handle(request(
                Method::POST,
                "/multi",
                Some(TOKEN),
                r#"[{"a":1},{"b":2},{"c":3},{"d":4}]"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_string(response).await,
            r#"{"message":"Batch of 4 records exceeds the log queue capacity of 3"}"#
        );
        assert_eq!(server.dispatcher().queued(), 2);
        assert_eq!(server.dispatcher().stats().accepted, 2);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_server_error() {
        let (server, _, _) = running_server();
        let panicking = Request::builder()
            .method(Method::POST)
            .uri("/log")
            .header(TOKEN_HEADER, TOKEN)
            .body(PanickingBody)
            .unwrap();

        let response = server.handle(panicking).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            "{\"message\":\"Internal Server Error\"}"
        );

        let response = server
            .handle(request(Method::GET, "/health", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unauthorized_request_body_is_never_read() {
        let (server, _, _) = running_server();
        let unauthorized = Request::builder()
            .method(Method::POST)
            .uri("/multi")
            .body(PanickingBody)
            .unwrap();

        let response = server.handle(unauthorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
