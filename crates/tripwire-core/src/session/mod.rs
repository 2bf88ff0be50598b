//! # Server Sessions
//!
//! Opens an MCP session to a configured server, lists what it exposes and
//! closes it again.
//!
//! ## Architecture
//!
//! ```text
//!   Connector::open(entry, timeout)
//!          │
//!          ▼
//!   ┌──────────────────────────────┐
//!   │ McpSession<C: RpcChannel>    │  initialize, notifications/initialized,
//!   │                              │  paginated */list, close
//!   └──────────────┬───────────────┘
//!          ┌───────┴────────┬─────────────────┐
//!          ▼                ▼                 ▼
//!   StdioChannel      SseChannel        HttpChannel
//!   child process     GET stream +      POST per message,
//!   newline JSON      POST endpoint     Mcp-Session-Id
//! ```
//!
//! The whole of [`Connector::open`] (spawn or connect, then handshake) runs
//! under one wall-clock timeout regardless of transport.
//!
//! ## References
//!
//! - MCP lifecycle: <https://modelcontextprotocol.io/specification/2025-03-26/basic/lifecycle>
//! - MCP transports: <https://modelcontextprotocol.io/specification/2025-03-26/basic/transports>

mod remote;
mod sse;
mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use tripwire_registry::{CapabilityDescriptor, PromptDescriptor, ResourceDescriptor, ToolDescriptor};

use crate::error::{CoreError, Result};
use crate::target::{ServerEntry, Transport};

pub use sse::{SseEvent, SseParser};

pub(crate) use remote::{HttpChannel, SseChannel};
pub(crate) use stdio::StdioChannel;

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Upper bound on `nextCursor` pages followed per listing.
const MAX_PAGES: usize = 64;

/// What the server said about itself in `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Reported name.
    pub name: Option<String>,
    /// Reported version.
    pub version: Option<String>,
    /// Negotiated protocol revision.
    pub protocol_version: Option<String>,
    /// Declared capabilities object.
    pub capabilities: Value,
    /// Free-text instructions, if any.
    pub instructions: Option<String>,
}

impl ServerInfo {
    fn from_initialize(result: &Value) -> Self {
        let info = result.get("serverInfo");
        let text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);
        Self {
            name: text(info.and_then(|i| i.get("name"))),
            version: text(info.and_then(|i| i.get("version"))),
            protocol_version: text(result.get("protocolVersion")),
            capabilities: result.get("capabilities").cloned().unwrap_or(Value::Null),
            instructions: text(result.get("instructions")),
        }
    }

    /// Whether the server declared `capability`.
    ///
    /// A server that declares no capabilities object at all is asked anyway.
    pub fn supports(&self, capability: &str) -> bool {
        match self.capabilities.as_object() {
            Some(caps) => caps.contains_key(capability),
            None => true,
        }
    }
}

/// Everything a server exposes, from one listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerListing {
    /// From `initialize`.
    pub info: ServerInfo,
    /// From `prompts/list`.
    pub prompts: Vec<PromptDescriptor>,
    /// From `resources/list`.
    pub resources: Vec<ResourceDescriptor>,
    /// From `tools/list`.
    pub tools: Vec<ToolDescriptor>,
}

impl ServerListing {
    /// All entities as descriptors: prompts, then resources, then tools.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.prompts
            .iter()
            .cloned()
            .map(CapabilityDescriptor::Prompt)
            .chain(self.resources.iter().cloned().map(CapabilityDescriptor::Resource))
            .chain(self.tools.iter().cloned().map(CapabilityDescriptor::Tool))
            .collect()
    }
}

/// An open session with one server.
#[async_trait]
pub trait Session: Send {
    /// What the server reported at initialization.
    fn server_info(&self) -> &ServerInfo;

    /// Lists tools, following pagination.
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>>;

    /// Lists prompts, following pagination.
    async fn list_prompts(&mut self) -> Result<Vec<PromptDescriptor>>;

    /// Lists resources, following pagination.
    async fn list_resources(&mut self) -> Result<Vec<ResourceDescriptor>>;

    /// Captured server output, for failure reports.
    fn diagnostics(&self) -> Option<String> {
        None
    }

    /// Ends the session and releases the transport.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a session, failing with [`CoreError::ConnectTimeout`] if the
    /// handshake does not finish within `timeout`.
    async fn open(&self, entry: &ServerEntry, timeout: Duration) -> Result<Box<dyn Session>>;
}

/// Lists prompts, resources and tools, each under `timeout`.
pub async fn list_all(
    server: &str,
    session: &mut dyn Session,
    timeout: Duration,
) -> Result<ServerListing> {
    let info = session.server_info().clone();
    let expired = || CoreError::ConnectTimeout {
        server: server.to_string(),
        timeout,
    };

    let prompts = tokio::time::timeout(timeout, session.list_prompts())
        .await
        .map_err(|_| expired())??;
    let resources = tokio::time::timeout(timeout, session.list_resources())
        .await
        .map_err(|_| expired())??;
    let tools = tokio::time::timeout(timeout, session.list_tools())
        .await
        .map_err(|_| expired())??;

    Ok(ServerListing {
        info,
        prompts,
        resources,
        tools,
    })
}

/// A bidirectional JSON-RPC message pipe.
#[async_trait]
pub(crate) trait RpcChannel: Send {
    /// Sends a request and returns the response carrying the same `id`.
    async fn request(&mut self, id: u64, message: Value) -> Result<Value>;

    /// Sends a notification.
    async fn notify(&mut self, message: Value) -> Result<()>;

    /// Captured output of the other side.
    fn diagnostics(&self) -> Option<String> {
        None
    }

    /// Closes the pipe.
    async fn shutdown(&mut self) -> Result<()>;
}

/// The MCP client state machine over any [`RpcChannel`].
pub(crate) struct McpSession<C> {
    server: String,
    channel: C,
    next_id: u64,
    info: ServerInfo,
}

impl<C: RpcChannel> McpSession<C> {
    /// Runs the `initialize` handshake.
    pub(crate) async fn handshake(server: &str, channel: C) -> Result<Self> {
        let mut session = Self {
            server: server.to_string(),
            channel,
            next_id: 1,
            info: ServerInfo::default(),
        };

        let result = session
            .call(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "tripwire",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        session.info = ServerInfo::from_initialize(&result);

        session
            .channel
            .notify(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;

        info!(
            server = %session.server,
            name = session.info.name.as_deref().unwrap_or("?"),
            protocol = session.info.protocol_version.as_deref().unwrap_or("?"),
            "session initialized"
        );
        Ok(session)
    }

    async fn call_raw(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        debug!(server = %self.server, method, id, "request");
        self.channel.request(id, message).await
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let response = self.call_raw(method, params).await?;
        rpc_result(&self.server, method, response)
    }

    async fn list_paged(&mut self, capability: &str, method: &str, key: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        if !self.info.supports(capability) {
            debug!(server = %self.server, capability, "not declared, skipping");
            return Ok(items);
        }

        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let response = self.call_raw(method, params).await?;
            if error_code(&response) == Some(METHOD_NOT_FOUND) {
                break;
            }
            let result = rpc_result(&self.server, method, response)?;
            if let Some(page) = result.get(key).and_then(Value::as_array) {
                items.extend(page.iter().cloned());
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, items: Vec<Value>, key: &str) -> Result<Vec<T>> {
        serde_json::from_value(Value::Array(items))
            .map_err(|e| CoreError::protocol(&self.server, format!("malformed {key}: {e}")))
    }
}

#[async_trait]
impl<C: RpcChannel> Session for McpSession<C> {
    fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>> {
        let items = self.list_paged("tools", "tools/list", "tools").await?;
        self.decode(items, "tools")
    }

    async fn list_prompts(&mut self) -> Result<Vec<PromptDescriptor>> {
        let items = self.list_paged("prompts", "prompts/list", "prompts").await?;
        self.decode(items, "prompts")
    }

    async fn list_resources(&mut self) -> Result<Vec<ResourceDescriptor>> {
        let items = self
            .list_paged("resources", "resources/list", "resources")
            .await?;
        self.decode(items, "resources")
    }

    fn diagnostics(&self) -> Option<String> {
        self.channel.diagnostics()
    }

    async fn close(&mut self) -> Result<()> {
        debug!(server = %self.server, "closing session");
        self.channel.shutdown().await
    }
}

fn error_code(response: &Value) -> Option<i64> {
    response
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
}

fn rpc_result(server: &str, method: &str, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(CoreError::protocol(
            server,
            format!("{method} failed: {message} ({})", error_code(&response).unwrap_or(0)),
        ));
    }
    match response.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(CoreError::protocol(server, format!("{method}: response has no result"))),
    }
}

/// Returns true if `message` is the response to request `id`.
pub(crate) fn is_response_to(message: &Value, id: u64) -> bool {
    message.get("id").and_then(Value::as_u64) == Some(id)
        && (message.get("result").is_some() || message.get("error").is_some())
}

/// Opens sessions over the real transports.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    suppress_io: bool,
    http: reqwest::Client,
}

impl TransportConnector {
    /// Creates a connector. With `suppress_io` the stderr of child servers
    /// is captured instead of inherited.
    pub fn new(suppress_io: bool) -> Self {
        Self {
            suppress_io,
            http: reqwest::Client::new(),
        }
    }

    async fn open_inner(&self, entry: &ServerEntry) -> Result<Box<dyn Session>> {
        let server = entry.name.as_str();
        let session: Box<dyn Session> = match &entry.transport {
            Transport::Stdio { command, args, env } => {
                let channel = StdioChannel::spawn(server, command, args, env, self.suppress_io)?;
                Box::new(McpSession::handshake(server, channel).await?)
            }
            Transport::Sse { url, headers } => {
                let channel = SseChannel::connect(server, self.http.clone(), url, headers).await?;
                Box::new(McpSession::handshake(server, channel).await?)
            }
            Transport::Http { url, headers } => {
                let channel = HttpChannel::new(server, self.http.clone(), url, headers)?;
                Box::new(McpSession::handshake(server, channel).await?)
            }
        };
        Ok(session)
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn open(&self, entry: &ServerEntry, timeout: Duration) -> Result<Box<dyn Session>> {
        match tokio::time::timeout(timeout, self.open_inner(entry)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ConnectTimeout {
                server: entry.name.clone(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned responses, recording what was sent.
    struct ScriptedChannel {
        responses: VecDeque<Value>,
        sent: Vec<Value>,
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn request(&mut self, id: u64, message: Value) -> Result<Value> {
            self.sent.push(message);
            let mut response = self
                .responses
                .pop_front()
                .ok_or_else(|| CoreError::protocol("scripted", "out of responses"))?;
            response["id"] = json!(id);
            Ok(response)
        }

        async fn notify(&mut self, message: Value) -> Result<()> {
            self.sent.push(message);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn scripted(responses: Vec<Value>) -> ScriptedChannel {
        ScriptedChannel {
            responses: responses.into(),
            sent: Vec::new(),
        }
    }

    fn init(capabilities: Value) -> Value {
        json!({"jsonrpc": "2.0", "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "serverInfo": {"name": "demo", "version": "1.0"}
        }})
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized() {
        let session = McpSession::handshake("demo", scripted(vec![init(json!({"tools": {}}))]))
            .await
            .unwrap();
        assert_eq!(session.info.name.as_deref(), Some("demo"));
        assert_eq!(session.channel.sent[0]["method"], "initialize");
        assert_eq!(session.channel.sent[0]["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(session.channel.sent[1]["method"], "notifications/initialized");
        assert!(session.channel.sent[1].get("id").is_none());
    }

    #[tokio::test]
    async fn test_tools_follow_pagination() {
        let mut session = McpSession::handshake(
            "demo",
            scripted(vec![
                init(json!({"tools": {}})),
                json!({"result": {"tools": [{"name": "a"}], "nextCursor": "p2"}}),
                json!({"result": {"tools": [{"name": "b"}]}}),
            ]),
        )
        .await
        .unwrap();

        let tools = session.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(session.channel.sent[3]["params"]["cursor"], "p2");
    }

    #[tokio::test]
    async fn test_undeclared_capability_is_not_requested() {
        let mut session = McpSession::handshake("demo", scripted(vec![init(json!({"tools": {}}))]))
            .await
            .unwrap();
        assert!(session.list_prompts().await.unwrap().is_empty());
        assert_eq!(session.channel.sent.len(), 2);
    }

    #[tokio::test]
    async fn test_method_not_found_is_empty() {
        let mut session = McpSession::handshake(
            "demo",
            scripted(vec![
                init(json!({"resources": {}})),
                json!({"error": {"code": METHOD_NOT_FOUND, "message": "nope"}}),
            ]),
        )
        .await
        .unwrap();
        assert!(session.list_resources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_errors_are_protocol_errors() {
        let mut session = McpSession::handshake(
            "demo",
            scripted(vec![
                init(json!({"tools": {}})),
                json!({"error": {"code": -32603, "message": "boom"}}),
            ]),
        )
        .await
        .unwrap();
        let err = session.list_tools().await.unwrap_err();
        assert!(matches!(err, CoreError::Protocol { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_listing_descriptor_order() {
        let listing = ServerListing {
            info: ServerInfo::default(),
            prompts: vec![PromptDescriptor {
                name: "p".to_string(),
                description: None,
                arguments: vec![],
            }],
            resources: vec![],
            tools: vec![ToolDescriptor {
                name: "t".to_string(),
                description: None,
                input_schema: json!({}),
                annotations: None,
            }],
        };
        let names: Vec<String> = listing
            .descriptors()
            .iter()
            .map(|d| format!("{}:{}", d.kind(), d.name()))
            .collect();
        assert_eq!(names, vec!["prompt:p", "tool:t"]);
    }
}
