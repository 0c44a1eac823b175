//! Turning logical calls into tracked messages.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use layer_tl_types::Value;

use crate::Engine;
use crate::connection::RecallOptions;
use crate::datacenter::DataCenter;
use crate::errors::InvocationError;
use crate::message::{OutgoingMessage, PendingReply};
use crate::retry::RetryContext;

/// Encrypted-chat methods that share one ordered queue.
const SECRET_CHAT_METHODS: &[&str] = &[
    "messages.setEncryptedTyping",
    "messages.readEncryptedHistory",
    "messages.sendEncrypted",
    "messages.sendEncryptedFile",
    "messages.sendEncryptedService",
    "messages.receivedQueue",
];

const SECRET_QUEUE: &str = "secret";

// ─── CallOptions ──────────────────────────────────────────────────────────────

/// Per-call knobs.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Target datacenter. Defaults to the authorized one.
    pub datacenter:       Option<i32>,
    /// Ordered queue tag.
    pub queue:            Option<String>,
    /// File traffic; prefers the media datacenter.
    pub file:             bool,
    pub bot_api:          bool,
    /// Fire and forget.
    pub no_response:      bool,
    /// Queue without flushing.
    pub postpone:         bool,
    /// `args.multiple` holds one argument object per call.
    pub multiple:         bool,
    /// Flood-wait ceiling in seconds for this call.
    pub flood_wait_limit: Option<u64>,
    /// Resend under this message id.
    pub msg_id:           Option<i64>,
}

impl CallOptions {
    pub fn on(dc_id: i32) -> Self {
        Self { datacenter: Some(dc_id), ..Self::default() }
    }

    pub fn file(mut self, v: bool) -> Self { self.file = v; self }
    pub fn queue(mut self, tag: impl Into<String>) -> Self { self.queue = Some(tag.into()); self }
    pub fn no_response(mut self, v: bool) -> Self { self.no_response = v; self }
    pub fn postpone(mut self, v: bool) -> Self { self.postpone = v; self }
    pub fn flood_wait_limit(mut self, secs: u64) -> Self { self.flood_wait_limit = Some(secs); self }
}

/// What [`Engine::call`] hands back.
#[derive(Debug)]
pub enum Pending {
    One(PendingReply),
    /// Fan-out or split call, in argument order.
    Many(Vec<PendingReply>),
}

impl Pending {
    /// Wait for every reply. In a batch, a benign error stands in as
    /// `Value::Null` for its own member only.
    pub async fn wait(self) -> Result<Value, InvocationError> {
        match self {
            Self::One(p) => p.wait().await,
            Self::Many(ps) => {
                let mut out = Vec::with_capacity(ps.len());
                for p in ps {
                    out.push(match p.wait().await {
                        Err(e) if e.is_benign() => Value::Null,
                        other => other?,
                    });
                }
                Ok(Value::Vector(out))
            }
        }
    }
}

/// A call resolved to its datacenter and cut into the messages it becomes.
struct Outgoing {
    dc:      Arc<DataCenter>,
    opts:    CallOptions,
    /// Argument object of every message, in write order.
    members: Vec<Value>,
    batched: bool,
}

impl Outgoing {
    /// Options for one member written on its own.
    fn member_opts(&self) -> CallOptions {
        CallOptions { multiple: false, ..self.opts.clone() }
    }
}

// ─── Engine: dispatch ─────────────────────────────────────────────────────────

impl Engine {
    /// Write a call and return its pending reply without waiting for it.
    pub async fn call(&self, method: &str, args: Value, opts: CallOptions) -> Result<Pending, InvocationError> {
        let out = self.prepare(method, args, opts)?;
        let mut replies = self.issue(method, &out).await?;
        if out.batched {
            return Ok(Pending::Many(replies));
        }
        replies.pop().map(Pending::One).ok_or(InvocationError::Dropped)
    }

    fn prepare(&self, method: &str, args: Value, mut opts: CallOptions) -> Result<Outgoing, InvocationError> {
        let dc = self.route(method, &args, &mut opts)?;
        if SECRET_CHAT_METHODS.contains(&method) {
            opts.queue = Some(SECRET_QUEUE.to_string());
        }

        let mut args = args;
        let mut batch = None;
        if let Some(obj) = args.as_object_mut() {
            if let Some(Value::Vector(list)) = obj.remove("multiple") {
                opts.multiple = true;
                batch = Some(list);
            }
        }
        if batch.is_none() {
            let max = self.inner.settings.message_length_max;
            if let Some(text) = args.get("message").and_then(Value::as_str) {
                if text.chars().count() > max {
                    let chunks = split_message(text, max);
                    tracing::debug!("[dispatch] splitting {method} into {} chunks", chunks.len());
                    batch = Some(chunks.into_iter().map(|chunk| {
                        let mut single = args.clone();
                        if let Some(o) = single.as_object_mut() {
                            o.set("message", chunk);
                        }
                        single
                    }).collect());
                    opts.queue = Some(method.to_string());
                    opts.multiple = true;
                }
            }
        }

        Ok(match batch {
            Some(members) => Outgoing { dc, opts, members, batched: true },
            None => Outgoing { dc, opts, members: vec![args], batched: false },
        })
    }

    /// Write every member; a batch goes out in one flush.
    async fn issue(&self, method: &str, out: &Outgoing) -> Result<Vec<PendingReply>, InvocationError> {
        if !out.batched {
            let reply = self.call_single(&out.dc, method, out.members[0].clone(), &out.opts).await?;
            return Ok(vec![reply]);
        }
        let single_opts = CallOptions { postpone: true, ..out.member_opts() };
        let mut replies = Vec::with_capacity(out.members.len());
        for single in &out.members {
            replies.push(self.call_single(&out.dc, method, single.clone(), &single_opts).await?);
        }
        if !out.opts.postpone {
            out.dc.flush_all().await;
        }
        Ok(replies)
    }

    /// Pick the datacenter, following inline-message and media redirects.
    fn route(&self, method: &str, args: &Value, opts: &mut CallOptions) -> Result<Arc<DataCenter>, InvocationError> {
        let current = opts.datacenter
            .or_else(|| self.authorized_dc())
            .ok_or_else(|| InvocationError::Usage(format!("no datacenter selected for {method}")))?;
        let mut target = current;

        if let Some(id) = args.get("id") {
            let inline = matches!(id.predicate(), Some("inputBotInlineMessageID" | "inputBotInlineMessageID64"));
            if let (true, Some(dc_id)) = (inline, id.get("dc_id").and_then(Value::as_i32)) {
                if dc_id != current {
                    tracing::debug!("[dispatch] {method}: inline message lives on DC{dc_id}");
                    target = dc_id;
                }
            }
        }
        if opts.file && target > 0 && self.has_datacenter(-target) {
            tracing::debug!("[dispatch] {method}: using media DC{}", -target);
            target = -target;
        }

        opts.datacenter = Some(target);
        self.datacenter(target)
            .ok_or_else(|| InvocationError::Usage(format!("unknown DC{target}")))
    }

    async fn call_single(
        &self,
        dc:     &Arc<DataCenter>,
        method: &str,
        args:   Value,
        opts:   &CallOptions,
    ) -> Result<PendingReply, InvocationError> {
        let info = self.inner.schema.find_method(method)
            .ok_or_else(|| InvocationError::UnknownMethod(method.to_string()))?;
        let unencrypted = !dc.has_temp_key() && !method.contains('.') && method != "ping_delay_disconnect";
        let user_related = is_user_related(method, &args);

        let mut msg = OutgoingMessage::call(method, args, info.result_type)
            .unencrypted(unencrypted)
            .queue(opts.queue.clone())
            .user_related(user_related)
            .file_related(opts.file)
            .bot_api(opts.bot_api)
            .flood_wait_limit(opts.flood_wait_limit);
        if let Some(id) = opts.msg_id {
            msg = msg.with_msg_id(id);
        }
        let (msg, pending) = msg.into_tracked();
        dc.send(msg, !opts.postpone).await?;
        Ok(pending)
    }

    /// Write a call and wait for its result.
    ///
    /// Benign errors come back as `Value::Null`. Flood waits are slept off
    /// through the retry policy as long as they stay under the ceiling. In a
    /// batch both apply per member: only the member that hit the flood wait
    /// is written again.
    pub async fn call_and_await(&self, method: &str, args: Value, opts: CallOptions) -> Result<Value, InvocationError> {
        let out = self.prepare(method, args, opts)?;
        let replies = self.issue(method, &out).await?;
        if out.opts.no_response {
            return Ok(Value::Null);
        }
        let retry_opts = CallOptions { postpone: false, msg_id: None, ..out.member_opts() };
        let mut results = Vec::with_capacity(replies.len());
        for (args, reply) in out.members.iter().zip(replies) {
            results.push(self.settle(&out.dc, method, args, &retry_opts, reply).await?);
        }
        if out.batched {
            Ok(Value::Vector(results))
        } else {
            Ok(results.pop().unwrap_or(Value::Null))
        }
    }

    /// Wait for one member, rewriting it after each flood wait the policy
    /// allows.
    async fn settle(
        &self,
        dc:     &Arc<DataCenter>,
        method: &str,
        args:   &Value,
        opts:   &CallOptions,
        reply:  PendingReply,
    ) -> Result<Value, InvocationError> {
        let limit = opts.flood_wait_limit.unwrap_or(self.inner.settings.flood_wait_limit);
        let mut reply = reply;
        let mut fail_count = NonZeroU32::MIN;
        let mut slept_so_far = Duration::ZERO;
        loop {
            let error = match reply.wait().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_benign() => {
                    tracing::warn!("[dispatch] {method}: ignoring {e}");
                    return Ok(Value::Null);
                }
                Err(e) => e,
            };
            let ctx = RetryContext {
                fail_count,
                slept_so_far,
                flood_wait_limit: Some(Duration::from_secs(limit)),
                error,
            };
            match self.inner.retry_policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    tokio::time::sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                    reply = self.call_single(dc, method, args.clone(), opts).await?;
                }
                ControlFlow::Break(()) => return Err(ctx.error),
            }
        }
    }

    /// Resend `msg_id` (or the container it names) sent on `dc_id`,
    /// optionally moving it to `target`.
    pub async fn recall(
        &self,
        dc_id:    i32,
        msg_id:   i64,
        target:   Option<i32>,
        postpone: bool,
    ) -> Result<usize, InvocationError> {
        let dc = self.datacenter(dc_id)
            .ok_or_else(|| InvocationError::Usage(format!("unknown DC{dc_id}")))?;
        let datacenter = match target.filter(|&t| t != dc_id) {
            Some(t) => Some(self.datacenter(t).ok_or_else(|| InvocationError::Usage(format!("unknown DC{t}")))?),
            None => None,
        };
        let Some(conn) = dc.connections().into_iter().find(|c| c.is_tracking(msg_id)) else {
            tracing::debug!("[dispatch] could not resend {msg_id}: not tracked on DC{dc_id}");
            return Ok(0);
        };
        Ok(conn.recall(msg_id, RecallOptions { datacenter, postpone }).await)
    }
}

fn is_user_related(method: &str, args: &Value) -> bool {
    match method {
        "auth.exportAuthorization" | "updates.getDifference" => true,
        "users.getUsers" => args.get("id")
            .and_then(Value::as_vec)
            .is_some_and(|ids| ids.len() == 1 && ids[0].predicate() == Some("inputUserSelf")),
        _ => false,
    }
}

/// Split `text` into pieces of at most `max` characters, breaking after
/// whitespace where one is in reach.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max).min(chars.len());
        if end < chars.len() {
            if let Some(ws) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if ws > 0 {
                    end = start + ws + 1;
                }
            }
        }
        out.push(chars[start..end].iter().collect());
        start = end;
    }
    out
}
