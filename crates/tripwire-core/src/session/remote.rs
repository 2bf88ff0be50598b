//! Network transports: legacy HTTP+SSE and streamable HTTP.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sse::{SseEvent, SseParser};
use super::{is_response_to, RpcChannel};
use crate::error::{CoreError, Result};

const SESSION_HEADER: &str = "mcp-session-id";

fn with_headers(mut builder: RequestBuilder, headers: &BTreeMap<String, String>) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn parse_url(server: &str, url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| CoreError::connect(server, format!("invalid url '{url}': {e}")))
}

/// Picks the response to `id` out of a JSON body, which may be a batch.
fn find_response(body: Value, id: u64) -> Option<Value> {
    match body {
        Value::Array(items) => items.into_iter().find(|m| is_response_to(m, id)),
        single if is_response_to(&single, id) => Some(single),
        _ => None,
    }
}

/// Legacy transport: one long-lived `GET` event stream carries responses;
/// requests are `POST`ed to the endpoint announced in its first event.
pub(crate) struct SseChannel {
    server: String,
    http: Client,
    headers: BTreeMap<String, String>,
    post_url: Url,
    events: mpsc::Receiver<SseEvent>,
    reader: JoinHandle<()>,
}

impl SseChannel {
    pub(crate) async fn connect(
        server: &str,
        http: Client,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let base = parse_url(server, url)?;
        let response = with_headers(http.get(base.clone()), headers)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| CoreError::connect(server, e.to_string()))?;

        let (tx, mut events) = mpsc::channel(64);
        let name = server.to_string();
        let reader = tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in parser.feed(&bytes) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(server = %name, error = %e, "event stream failed");
                        return;
                    }
                }
            }
            debug!(server = %name, "event stream ended");
        });

        let post_url = loop {
            let event = events
                .recv()
                .await
                .ok_or_else(|| CoreError::connect(server, "stream closed before endpoint event"))?;
            if event.kind() == "endpoint" {
                break base.join(event.data.trim()).map_err(|e| {
                    CoreError::protocol(server, format!("bad endpoint '{}': {e}", event.data))
                })?;
            }
        };
        debug!(server, endpoint = %post_url, "sse endpoint announced");

        Ok(Self {
            server: server.to_string(),
            http,
            headers: headers.clone(),
            post_url,
            events,
            reader,
        })
    }

    async fn post(&self, message: &Value) -> Result<()> {
        with_headers(self.http.post(self.post_url.clone()), &self.headers)
            .json(message)
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| CoreError::protocol(&self.server, format!("post failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for SseChannel {
    async fn request(&mut self, id: u64, message: Value) -> Result<Value> {
        self.post(&message).await?;
        while let Some(event) = self.events.recv().await {
            if event.kind() != "message" {
                continue;
            }
            match serde_json::from_str::<Value>(&event.data) {
                Ok(incoming) if is_response_to(&incoming, id) => return Ok(incoming),
                Ok(_) => {}
                Err(e) => debug!(server = %self.server, error = %e, "ignoring non-JSON event"),
            }
        }
        Err(CoreError::protocol(&self.server, "event stream closed"))
    }

    async fn notify(&mut self, message: Value) -> Result<()> {
        self.post(&message).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.reader.abort();
        Ok(())
    }
}

impl Drop for SseChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Streamable HTTP: every message is a `POST`; the reply is JSON or a short
/// event stream. The server may assign a session id on `initialize`.
pub(crate) struct HttpChannel {
    server: String,
    http: Client,
    url: Url,
    headers: BTreeMap<String, String>,
    session_id: Option<String>,
}

impl HttpChannel {
    pub(crate) fn new(
        server: &str,
        http: Client,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            server: server.to_string(),
            http,
            url: parse_url(server, url)?,
            headers: headers.clone(),
            session_id: None,
        })
    }

    async fn post(&mut self, message: &Value) -> Result<Response> {
        let mut builder = with_headers(self.http.post(self.url.clone()), &self.headers)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, id.as_str());
        }
        let response = builder
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| CoreError::protocol(&self.server, format!("post failed: {e}")))?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(id.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn request(&mut self, id: u64, message: Value) -> Result<Value> {
        let response = self.post(&message).await?;
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if !is_stream {
            let body: Value = response
                .json()
                .await
                .map_err(|e| CoreError::protocol(&self.server, format!("bad response body: {e}")))?;
            return find_response(body, id)
                .ok_or_else(|| CoreError::protocol(&self.server, "response did not answer request"));
        }

        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| CoreError::protocol(&self.server, format!("stream failed: {e}")))?;
            for event in parser.feed(&bytes) {
                if event.kind() != "message" {
                    continue;
                }
                if let Ok(body) = serde_json::from_str::<Value>(&event.data) {
                    if let Some(found) = find_response(body, id) {
                        return Ok(found);
                    }
                }
            }
        }
        Err(CoreError::protocol(&self.server, "stream ended without a response"))
    }

    async fn notify(&mut self, message: Value) -> Result<()> {
        self.post(&message).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(id) = self.session_id.take() {
            let result = with_headers(self.http.delete(self.url.clone()), &self.headers)
                .header(SESSION_HEADER, id.as_str())
                .send()
                .await;
            if let Err(e) = result {
                debug!(server = %self.server, error = %e, "session delete failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_find_response_in_batch() {
        let batch = json!([
            {"jsonrpc": "2.0", "method": "notifications/progress"},
            {"jsonrpc": "2.0", "id": 4, "result": {"ok": true}}
        ]);
        assert_eq!(find_response(batch, 4).unwrap()["result"]["ok"], true);
        assert!(find_response(json!({"id": 3, "result": {}}), 4).is_none());
    }

    #[tokio::test]
    async fn test_http_json_response_and_session_header() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "abc")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})),
            )
            .mount(&mock)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock)
            .await;

        let mut channel = HttpChannel::new(
            "remote",
            Client::new(),
            &format!("{}/mcp", mock.uri()),
            &BTreeMap::new(),
        )
        .unwrap();
        let response = channel
            .request(1, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await
            .unwrap();
        assert_eq!(response["result"]["tools"], json!([]));
        assert_eq!(channel.session_id.as_deref(), Some("abc"));

        channel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_event_stream_response() {
        let mock = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"prompts\":[]}}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&mock)
            .await;

        let mut channel =
            HttpChannel::new("remote", Client::new(), &mock.uri(), &BTreeMap::new()).unwrap();
        let response = channel
            .request(2, json!({"jsonrpc": "2.0", "id": 2, "method": "prompts/list"}))
            .await
            .unwrap();
        assert_eq!(response["result"]["prompts"], json!([]));
    }
}
