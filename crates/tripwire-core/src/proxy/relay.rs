//! Guardrail relay between one client connection and one server.
//!
//! Messages are newline-delimited JSON-RPC. Before a message is forwarded
//! it is evaluated against the `(client, server)` rule set:
//!
//! | Direction | Block outcome |
//! |-----------|---------------|
//! | client -> server request | not forwarded; the client gets a denial carrying the request id |
//! | client -> server notification | dropped |
//! | server -> client response | replaced by a denial carrying the same id |
//! | server -> client request or notification | dropped |
//!
//! Batches are judged element by element. Lines that are not JSON are
//! evaluated as plain text and dropped when blocked.
//!
//! Responses are evaluated with the tool of the `tools/call` request that
//! shares their id, so tool-scoped rules see both halves of a call.
//!
//! Each direction is pumped independently, so a server that writes while
//! it reads never waits on its own client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tripwire_guard::{Direction, RuleMatch, RuleSet, TrafficMessage};

use crate::error::Result;
use crate::proxy::audit::{AuditRecord, AuditSink};

/// JSON-RPC error code of a guardrail denial.
pub const GUARDRAIL_BLOCK_CODE: i64 = -32003;

/// Denials queued for the client.
const REPLY_CAPACITY: usize = 64;

/// What a relay needs besides its streams.
#[derive(Debug, Clone)]
pub struct RelayContext {
    /// Compiled rules for this `(client, server)` pair.
    pub rules: std::sync::Arc<RuleSet>,
    /// Where matches are recorded.
    pub audit: AuditSink,
    /// Identifies this connection in the audit log.
    pub session_id: String,
}

/// Message counts of a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Messages passed through unchanged.
    pub forwarded: u64,
    /// Messages stopped or replaced.
    pub blocked: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    blocked: AtomicU64,
}

impl Counters {
    fn add(&self, routed: &Routed) {
        self.forwarded.fetch_add(routed.forwarded, Ordering::Relaxed);
        self.blocked.fetch_add(routed.blocked, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

/// Tool of each `tools/call` still waiting for its response, by id.
type Pending = Mutex<HashMap<String, String>>;

#[derive(Default)]
struct Inspected {
    id: Option<Value>,
    method: Option<String>,
    tool: Option<String>,
}

/// Runs until the server closes, the client closes and the server has
/// answered, or `shutdown` fires.
///
/// Each direction keeps its arrival order.
pub async fn relay<CR, CW, SR, SW>(
    ctx: RelayContext,
    client_reader: CR,
    client_writer: CW,
    server_reader: SR,
    server_writer: SW,
    shutdown: watch::Receiver<bool>,
) -> Result<RelayStats>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    SR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
{
    if *shutdown.borrow() {
        return Ok(RelayStats::default());
    }

    let pending = Pending::default();
    let counters = Counters::default();
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);

    let requests = pump_requests(
        &ctx,
        client_reader,
        server_writer,
        reply_tx,
        &pending,
        &counters,
        shutdown.clone(),
    );
    let responses = pump_responses(
        &ctx,
        server_reader,
        client_writer,
        reply_rx,
        &pending,
        &counters,
        shutdown,
    );
    tokio::pin!(requests, responses);

    let outcome = tokio::select! {
        done = &mut responses => done,
        done = &mut requests => match done {
            // The server still owes answers for what it already received.
            Ok(()) => responses.await,
            Err(e) => Err(e),
        },
    };

    let stats = counters.snapshot();
    info!(
        session = %ctx.session_id,
        server = ctx.rules.server(),
        forwarded = stats.forwarded,
        blocked = stats.blocked,
        "relay finished"
    );
    outcome.map(|()| stats)
}

/// Client to server. Closes the server's input when done.
async fn pump_requests<R, W>(
    ctx: &RelayContext,
    reader: R,
    mut writer: W,
    replies: mpsc::Sender<Value>,
    pending: &Pending,
    counters: &Counters,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    let result = loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(session = %ctx.session_id, "client closed");
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            },
        };

        let routed = route(ctx, Direction::Request, &line, pending).await;
        counters.add(&routed);

        if let Some(reply) = routed.reply {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                sent = replies.send(reply) => if sent.is_err() {
                    break Ok(());
                },
            }
        }
        if let Some(forward) = routed.forward {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                written = write_line(&mut writer, &forward) => if let Err(e) = written {
                    break Err(e);
                },
            }
        }
    };

    let _ = writer.shutdown().await;
    result
}

/// Server to client, interleaved with denials from the request side.
async fn pump_responses<R, W>(
    ctx: &RelayContext,
    reader: R,
    mut writer: W,
    mut replies: mpsc::Receiver<Value>,
    pending: &Pending,
    counters: &Counters,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut replies_open = true;

    loop {
        let outgoing = tokio::select! {
            _ = shutdown.changed() => {
                debug!(session = %ctx.session_id, "relay shutting down");
                return Ok(());
            }
            reply = replies.recv(), if replies_open => match reply {
                Some(reply) => reply.to_string(),
                None => {
                    replies_open = false;
                    continue;
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!(session = %ctx.session_id, "server closed");
                    return Ok(());
                };
                let routed = route(ctx, Direction::Response, &line, pending).await;
                counters.add(&routed);
                match routed.forward {
                    Some(forward) => forward,
                    None => continue,
                }
            }
        };

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            written = write_line(&mut writer, &outgoing) => written?,
        }
    }
}

/// What becomes of one line.
#[derive(Debug, Default)]
struct Routed {
    /// Sent on in the line's own direction.
    forward: Option<String>,
    /// Sent back to the client instead.
    reply: Option<Value>,
    forwarded: u64,
    blocked: u64,
}

enum Step {
    Pass(Value),
    Deny(Value),
    Drop,
}

async fn route(ctx: &RelayContext, direction: Direction, line: &str, pending: &Pending) -> Routed {
    let (is_batch, messages) = match serde_json::from_str::<Value>(line) {
        Ok(Value::Array(items)) if !items.is_empty() => (true, items),
        Ok(message) => (false, vec![message]),
        Err(_) => return route_text(ctx, direction, line).await,
    };

    let mut routed = Routed::default();
    let mut kept = Vec::with_capacity(messages.len());
    let mut denials = Vec::new();
    for message in messages {
        let step = match direction {
            Direction::Request => from_client(ctx, message, pending).await,
            Direction::Response => from_server(ctx, message, pending).await,
        };
        match step {
            Step::Pass(message) => {
                routed.forwarded += 1;
                kept.push(message);
            }
            Step::Deny(denial) => {
                routed.blocked += 1;
                match direction {
                    Direction::Request => denials.push(denial),
                    Direction::Response => kept.push(denial),
                }
            }
            Step::Drop => routed.blocked += 1,
        }
    }

    routed.forward = if routed.blocked == 0 {
        Some(line.to_string())
    } else if kept.is_empty() {
        None
    } else if is_batch {
        Some(Value::Array(kept).to_string())
    } else {
        kept.pop().map(|message| message.to_string())
    };
    routed.reply = match (is_batch, denials.len()) {
        (_, 0) => None,
        (true, _) => Some(Value::Array(denials)),
        (false, _) => denials.pop(),
    };
    routed
}

async fn route_text(ctx: &RelayContext, direction: Direction, line: &str) -> Routed {
    let text = Value::String(line.to_string());
    match evaluate(ctx, direction, &text, &Inspected::default()).await {
        Some(_) => {
            debug!(session = %ctx.session_id, %direction, "dropped non-JSON line");
            Routed {
                blocked: 1,
                ..Routed::default()
            }
        }
        None => Routed {
            forward: Some(line.to_string()),
            forwarded: 1,
            ..Routed::default()
        },
    }
}

async fn from_client(ctx: &RelayContext, message: Value, pending: &Pending) -> Step {
    let seen = inspect(&message);
    let blocked = evaluate(ctx, Direction::Request, &message, &seen).await;

    match (blocked, &seen.id) {
        (Some(hit), Some(id)) => Step::Deny(denial(id, &hit)),
        (Some(_), None) => Step::Drop,
        (None, id) => {
            if let (Some(id), Some(tool)) = (id, &seen.tool) {
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id_key(id), tool.clone());
            }
            Step::Pass(message)
        }
    }
}

async fn from_server(ctx: &RelayContext, message: Value, pending: &Pending) -> Step {
    let mut seen = inspect(&message);
    let is_response = seen.method.is_none();
    if is_response {
        if let Some(id) = &seen.id {
            seen.tool = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id_key(id));
        }
    }

    match evaluate(ctx, Direction::Response, &message, &seen).await {
        Some(hit) => match (&seen.id, is_response) {
            (Some(id), true) => Step::Deny(denial(id, &hit)),
            _ => Step::Drop,
        },
        None => Step::Pass(message),
    }
}

/// Evaluates and audits; returns the blocking match, if any.
async fn evaluate(ctx: &RelayContext, direction: Direction, message: &Value, seen: &Inspected) -> Option<RuleMatch> {
    let evaluation = ctx.rules.evaluate(&TrafficMessage {
        direction,
        tool: seen.tool.as_deref(),
        payload: message,
    });
    if evaluation.is_clean() {
        return None;
    }

    for hit in &evaluation.matches {
        ctx.audit
            .record(AuditRecord {
                timestamp: chrono::Utc::now(),
                session_id: ctx.session_id.clone(),
                client: ctx.rules.client().to_string(),
                server: ctx.rules.server().to_string(),
                direction,
                message_id: seen.id.clone(),
                method: seen.method.clone(),
                tool: seen.tool.clone(),
                rule_id: hit.rule_id.clone(),
                action: hit.action,
                detail: hit.detail.clone(),
            })
            .await;
    }
    evaluation.blocked().cloned()
}

fn inspect(message: &Value) -> Inspected {
    let method = message.get("method").and_then(Value::as_str).map(str::to_string);
    let tool = if method.as_deref() == Some("tools/call") {
        message
            .pointer("/params/name")
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };
    Inspected {
        id: message.get("id").filter(|id| !id.is_null()).cloned(),
        method,
        tool,
    }
}

fn id_key(id: &Value) -> String {
    id.to_string()
}

/// The error returned in place of a blocked message.
pub fn denial(id: &Value, hit: &RuleMatch) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": GUARDRAIL_BLOCK_CODE,
            "message": format!("blocked by guardrail {}", hit.rule_id),
            "data": {
                "rule": hit.rule_id,
                "action": hit.action.to_string(),
            },
        },
    })
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
