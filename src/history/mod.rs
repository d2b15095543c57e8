//! Append-only session history with budgeted storage and streamed resets.
//!
//! `SessionHistory` is the single authority for one drawing session's
//! message log. It owns the log indices and size accounting, the ban list,
//! the invite store, the thumbnail handshake, and the streamed-reset state
//! machine; persistence is delegated to a [`HistoryBackend`].
//!
//! Streamed reset state machine:
//! ```text
//!            start_streamed_reset            prepare_streamed_reset
//!   None ──────────────────────► Streaming ──────────────────────► Prepared
//!    ▲                               │                                 │
//!    │        abort / error          │                                 │
//!    └───────────────────────────────┴─────────────────────────────────┘
//!                                          resolve_streamed_reset
//! ```
//!
//! While `Streaming`, replacement messages accumulate in a backend-owned
//! pending log; the live log keeps accepting appends. `resolve` swaps the
//! logs atomically, so readers either see the whole old epoch or the whole
//! new one, never a mix.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3
//! (log-structured storage).

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::banlist::{BanList, SessionBanner};
use crate::invite::{CheckInviteResult, Invite, InviteUse, MAX_INVITES, MAX_INVITE_USES};
use crate::message::{Message, MessageType};
use crate::resetstream::ResetStreamConsumer;
use crate::servercmd::ServerReply;

/// Extra allowance on top of the size limit for emergency messages, so
/// critical control traffic is accepted even when the session is full.
pub const EMERGENCY_SPACE_BYTES: usize = 512;

/// Catch-up keys rotate within this range.
pub const MIN_CATCHUP_KEY: i32 = 1;
pub const MAX_CATCHUP_KEY: i32 = 1_000_000_000;

/// Hand out the current catch-up key and advance to the next, wrapping at
/// an arbitrary but plenty large value.
pub fn increment_next_catchup_key(next_catchup_key: &mut i32) -> i32 {
    let result = *next_catchup_key;
    *next_catchup_key = if result < MAX_CATCHUP_KEY {
        result + 1
    } else {
        MIN_CATCHUP_KEY
    };
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStreamState {
    None,
    Streaming,
    Prepared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetStartResult {
    Ok,
    AlreadyActive,
    OutOfSpace,
    WriteError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetAddResult {
    Ok,
    NotActive,
    InvalidUser,
    BadType,
    DisallowedType,
    OutOfSpace,
    ConsumerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetPrepareResult {
    Ok,
    NotActive,
    InvalidUser,
    OutOfSpace,
    InvalidMessageCount,
    ConsumerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetAbortResult {
    Ok,
    NotActive,
    InvalidUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailStartResult {
    Ok,
    InvalidUser,
    AlreadyGenerating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFinishResult {
    Ok,
    InvalidUser,
    InvalidCorrelator,
    NoData,
    WriteError,
}

/// Result of finalizing a pending reset log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedResetStream {
    pub message_count: i64,
    pub size_in_bytes: usize,
}

/// Import statistics from a ban import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BanImport {
    pub total: i32,
    pub imported: i32,
}

/// A client's resumption point: session, reset epoch, log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryIndex {
    pub session_id: String,
    /// Reset epoch identifier (the session's `last_reset_time`).
    pub start_id: i64,
    pub history_pos: i64,
}

impl HistoryIndex {
    pub fn new(session_id: impl Into<String>, start_id: i64, history_pos: i64) -> Self {
        Self {
            session_id: session_id.into(),
            start_id,
            history_pos,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.session_id.is_empty() && self.history_pos >= 0
    }
}

/// Persistence and policy hooks supplied by a history implementation.
///
/// All hooks run on the session's single writer; they may block, but the
/// call order is exactly the logical operation order.
pub trait HistoryBackend: Send {
    /// Persist one appended message.
    fn history_add(&mut self, msg: &Message);

    /// Replace the retained log after an atomic reset.
    fn history_reset(&mut self, messages: &[Message]);

    /// Ban trail hooks, for backends that journal moderation actions.
    fn history_add_ban(
        &mut self,
        _id: i32,
        _username: &str,
        _ip: IpAddr,
        _ext_auth_id: &str,
        _sid: &str,
        _banned_by: &str,
    ) {
    }
    fn history_remove_ban(&mut self, _id: i32) {}

    /// Fetch retained messages after the given index for catch-up streams.
    /// Returns the batch and the index of its last message.
    fn get_batch(&self, after_index: i64) -> (Vec<Message>, i64);

    /// Open the pending log for a streamed reset, seeded with server-side
    /// state messages.
    fn open_reset_stream(&mut self, seed: &[Message]) -> StreamResetStartResult;

    /// Append one decoded message to the pending log.
    fn add_reset_stream_message(&mut self, msg: &Message) -> StreamResetAddResult;

    /// Seal the pending log so it can be resolved.
    fn prepare_reset_stream(&mut self) -> StreamResetPrepareResult;

    /// Swap the pending log in as the live log, starting at
    /// `new_first_index`. Returns the pending log's message count and size.
    fn resolve_reset_stream(&mut self, new_first_index: i64)
        -> Result<ResolvedResetStream, String>;

    /// Throw the pending log away.
    fn discard_reset_stream(&mut self);

    fn has_thumbnail(&self) -> bool;
    fn thumbnail_generated_at(&self) -> Option<DateTime<Utc>>;
    /// Store thumbnail bytes; empty data clears. False on write failure.
    fn set_thumbnail(&mut self, data: &[u8]) -> bool;

    /// Transient size limit override; 0 means none.
    fn override_size_limit(&self) -> usize {
        0
    }

    /// Auto-reset threshold in bytes above the post-reset base; 0 disables.
    fn auto_reset_threshold(&self) -> usize {
        0
    }
}

/// Handle for unregistering a new-messages listener.
pub type ListenerId = u64;

static THUMBNAIL_CORRELATOR_INDEX: AtomicU32 = AtomicU32::new(0);

/// The per-session history engine. See the module docs for an overview.
///
/// All operations are synchronous; concurrency is the caller's concern
/// (see [`crate::session`] for the single-writer loop).
pub struct SessionHistory<B: HistoryBackend> {
    id: String,
    start_time: DateTime<Utc>,
    backend: B,

    size_in_bytes: usize,
    base_size_limit: usize,
    auto_reset_base_size: usize,
    first_index: i64,
    last_index: i64,
    last_reset_time: i64,

    banlist: BanList,
    invites: HashMap<String, Invite>,

    reset_stream_state: ResetStreamState,
    reset_stream_ctx_id: u8,
    reset_stream_size: usize,
    reset_stream_start_index: i64,
    reset_stream_message_count: i64,
    reset_stream_consumer: Option<ResetStreamConsumer>,
    reset_stream_add_error: StreamResetAddResult,

    thumbnail_ctx_id: u8,
    thumbnail_correlator: String,

    auth_ops: HashSet<String>,
    auth_trusted: HashSet<String>,
    auth_usernames: HashMap<String, String>,

    listeners: Vec<(ListenerId, Box<dyn FnMut() + Send>)>,
    next_listener_id: ListenerId,
}

impl<B: HistoryBackend> SessionHistory<B> {
    pub fn new(id: impl Into<String>, backend: B) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            start_time: now,
            backend,
            size_in_bytes: 0,
            base_size_limit: 0,
            auto_reset_base_size: 0,
            first_index: 0,
            last_index: -1,
            last_reset_time: now.timestamp_millis(),
            banlist: BanList::new(),
            invites: HashMap::new(),
            reset_stream_state: ResetStreamState::None,
            reset_stream_ctx_id: 0,
            reset_stream_size: 0,
            reset_stream_start_index: 0,
            reset_stream_message_count: 0,
            reset_stream_consumer: None,
            reset_stream_add_error: StreamResetAddResult::ConsumerError,
            thumbnail_ctx_id: 0,
            thumbnail_correlator: String::new(),
            auth_ops: HashSet::new(),
            auth_trusted: HashSet::new(),
            auth_usernames: HashMap::new(),
            listeners: Vec::new(),
            next_listener_id: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn first_index(&self) -> i64 {
        self.first_index
    }

    pub fn last_index(&self) -> i64 {
        self.last_index
    }

    pub fn last_reset_time(&self) -> i64 {
        self.last_reset_time
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    // --- size accounting ---------------------------------------------------

    pub fn base_size_limit(&self) -> usize {
        self.base_size_limit
    }

    pub fn set_base_size_limit(&mut self, base_size_limit: usize) {
        self.base_size_limit = Self::clamp_size_limit(base_size_limit);
    }

    fn clamp_size_limit(size_limit: usize) -> usize {
        size_limit.min(i32::MAX as usize)
    }

    /// The limit in force: the backend's override when nonzero (even when
    /// smaller than base), the base limit otherwise. 0 means unlimited.
    pub fn current_size_limit(&self) -> usize {
        let override_limit = self.backend.override_size_limit();
        if override_limit == 0 {
            self.base_size_limit
        } else {
            override_limit
        }
    }

    fn has_space_for(&self, bytes: usize, extra: usize) -> bool {
        let size_limit = self.current_size_limit();
        size_limit == 0 || self.size_in_bytes + bytes <= size_limit + extra
    }

    pub fn has_regular_space_for(&self, bytes: usize) -> bool {
        self.has_space_for(bytes, 0)
    }

    pub fn has_emergency_space_for(&self, bytes: usize) -> bool {
        self.has_space_for(bytes, EMERGENCY_SPACE_BYTES)
    }

    /// Auto-reset trigger point: the configured threshold above the size at
    /// the last reset, capped to 90% of the limit so a session never fills
    /// completely before the reset delegate responds. 0 when disabled.
    pub fn effective_auto_reset_threshold(&self) -> usize {
        let mut t = self.backend.auto_reset_threshold();
        if t > 0 {
            t += self.auto_reset_base_size;
            let size_limit = self.current_size_limit();
            if size_limit > 0 {
                t = t.min((size_limit as f64 * 0.9) as usize);
            }
        }
        t
    }

    fn reset_auto_reset_threshold_base(&mut self) {
        self.auto_reset_base_size = self.size_in_bytes;
    }

    // --- log ---------------------------------------------------------------

    /// Adopt counters from a backend that loaded an existing log. Must be
    /// called before any append.
    pub fn history_loaded(&mut self, size: usize, message_count: i64) {
        debug_assert_eq!(self.last_index, -1);
        self.size_in_bytes = size;
        self.last_index = message_count - 1;
        self.auto_reset_base_size = size;
    }

    /// Append within the regular budget. False means the session is full.
    pub fn add_message(&mut self, msg: &Message) -> bool {
        if self.has_regular_space_for(msg.length()) {
            self.add_message_internal(msg);
            self.notify_new_messages();
            true
        } else {
            false
        }
    }

    /// Append within the emergency budget, for control messages that must
    /// reach clients even when the session is full.
    pub fn add_emergency_message(&mut self, msg: &Message) -> bool {
        if self.has_emergency_space_for(msg.length()) {
            self.add_message_internal(msg);
            self.notify_new_messages();
            true
        } else {
            false
        }
    }

    fn add_message_internal(&mut self, msg: &Message) {
        self.size_in_bytes += msg.length();
        self.last_index += 1;
        self.backend.history_add(msg);
    }

    /// Fetch retained messages after `after_index` for a catch-up stream.
    pub fn get_batch(&self, after_index: i64) -> (Vec<Message>, i64) {
        self.backend.get_batch(after_index)
    }

    /// Atomically replace the log. Rejected (false) when the replacement
    /// exceeds the current size limit; the log is unchanged in that case.
    pub fn reset(&mut self, new_history: &[Message]) -> bool {
        let new_size: usize = new_history.iter().map(Message::length).sum();

        let size_limit = self.current_size_limit();
        if size_limit > 0 && new_size > size_limit {
            return false;
        }

        if self.reset_stream_state != ResetStreamState::None {
            self.abort_active_streamed_reset();
        }
        self.size_in_bytes = new_size;
        self.last_reset_time = Utc::now().timestamp_millis();
        self.first_index = self.last_index + 1;
        self.last_index += new_history.len() as i64;
        self.reset_auto_reset_threshold_base();
        self.backend.history_reset(new_history);
        log::info!(
            "session {}: history reset, {} messages retained",
            self.id,
            new_history.len()
        );
        self.notify_new_messages();
        true
    }

    pub fn history_index(&self) -> HistoryIndex {
        HistoryIndex::new(self.id.clone(), self.last_reset_time, self.last_index)
    }

    /// Whether a client resuming at `hi` can skip catch-up: it must belong
    /// to the current reset epoch and point inside the retained range.
    pub fn can_skip_to_history_index(&self, hi: &HistoryIndex) -> bool {
        hi.is_valid()
            && hi.session_id == self.id
            && hi.start_id == self.last_reset_time
            && hi.history_pos >= self.first_index
            && hi.history_pos <= self.last_index
    }

    // --- streamed reset ----------------------------------------------------

    pub fn reset_stream_state(&self) -> ResetStreamState {
        self.reset_stream_state
    }

    /// Begin a streamed reset driven by client `ctx_id`. Appends a soft
    /// reset marker and a stream-start reply to the live log so other
    /// clients observe the handoff, then opens the backend's pending log.
    pub fn start_streamed_reset(
        &mut self,
        ctx_id: u8,
        correlator: &str,
        server_side_state_messages: &[Message],
    ) -> StreamResetStartResult {
        if self.reset_stream_state != ResetStreamState::None {
            return StreamResetStartResult::AlreadyActive;
        }

        let soft_reset_msg = Message::make_soft_reset(0);
        let reset_start_msg = ServerReply::make_streamed_reset_start(ctx_id, correlator);
        if !self.has_regular_space_for(soft_reset_msg.length() + reset_start_msg.length()) {
            return StreamResetStartResult::OutOfSpace;
        }

        self.add_message_internal(&soft_reset_msg);
        self.add_message_internal(&reset_start_msg);

        let result = self.backend.open_reset_stream(server_side_state_messages);
        if result == StreamResetStartResult::Ok {
            self.reset_stream_state = ResetStreamState::Streaming;
            self.reset_stream_ctx_id = ctx_id;
            self.reset_stream_size = 0;
            self.reset_stream_start_index = self.last_index + 1;
            self.reset_stream_message_count = 0;
            log::info!("session {}: streamed reset started by {ctx_id}", self.id);
        }

        self.notify_new_messages();
        result
    }

    /// Feed one `ResetStream` chunk from the resetting client. An empty
    /// payload is a flush ping and a no-op.
    pub fn add_stream_reset_message(&mut self, ctx_id: u8, msg: &Message) -> StreamResetAddResult {
        if self.reset_stream_state != ResetStreamState::Streaming {
            return StreamResetAddResult::NotActive;
        }

        if self.reset_stream_ctx_id != ctx_id {
            return StreamResetAddResult::InvalidUser;
        }

        let Some(data) = msg.reset_stream_data() else {
            return StreamResetAddResult::BadType;
        };

        if !data.is_empty() {
            let mut consumer = self.reset_stream_consumer.take().unwrap_or_default();
            self.reset_stream_add_error = StreamResetAddResult::ConsumerError;
            let ok = consumer.push(data, |m| self.receive_reset_stream_message(m));
            self.reset_stream_consumer = Some(consumer);
            if !ok {
                debug_assert_ne!(self.reset_stream_add_error, StreamResetAddResult::Ok);
                return self.reset_stream_add_error;
            }
        }
        StreamResetAddResult::Ok
    }

    /// Sink for messages decoded out of the reset stream. Rejections latch
    /// the error code for the enclosing operation to report.
    fn receive_reset_stream_message(&mut self, mut msg: Message) -> bool {
        if msg.is_control() || (msg.is_server_meta() && msg.msg_type() != MessageType::Chat) {
            self.reset_stream_add_error = StreamResetAddResult::DisallowedType;
            return false;
        }

        let new_size = self.reset_stream_size + msg.length();
        let size_limit = self.current_size_limit();
        if size_limit > 0 && new_size > size_limit {
            self.reset_stream_add_error = StreamResetAddResult::OutOfSpace;
            return false;
        }
        self.reset_stream_size = new_size;

        if msg.context_id() != self.reset_stream_ctx_id {
            msg.set_context_id(self.reset_stream_ctx_id);
        }

        let result = self.backend.add_reset_stream_message(&msg);
        if result == StreamResetAddResult::Ok {
            self.reset_stream_message_count += 1;
            true
        } else {
            self.reset_stream_add_error = result;
            false
        }
    }

    /// Seal the stream: drain the consumer, verify the message count, cap
    /// the pending log with a caught-up marker, and let the backend prepare
    /// the swap.
    pub fn prepare_streamed_reset(
        &mut self,
        ctx_id: u8,
        expected_message_count: i64,
    ) -> StreamResetPrepareResult {
        if self.reset_stream_state != ResetStreamState::Streaming {
            return StreamResetPrepareResult::NotActive;
        }

        if self.reset_stream_ctx_id != ctx_id {
            return StreamResetPrepareResult::InvalidUser;
        }

        self.reset_stream_add_error = StreamResetAddResult::ConsumerError;
        let free_ok = match self.reset_stream_consumer.take() {
            Some(consumer) => consumer.finish(|m| self.receive_reset_stream_message(m)),
            None => true,
        };
        if !free_ok {
            return match self.reset_stream_add_error {
                StreamResetAddResult::OutOfSpace => StreamResetPrepareResult::OutOfSpace,
                _ => StreamResetPrepareResult::ConsumerError,
            };
        }

        if self.reset_stream_message_count != expected_message_count || expected_message_count == 0
        {
            log::warn!(
                "session {}: reset stream message count mismatch, got {} expected {}",
                self.id,
                self.reset_stream_message_count,
                expected_message_count
            );
            self.abort_active_streamed_reset();
            return StreamResetPrepareResult::InvalidMessageCount;
        }

        match self
            .backend
            .add_reset_stream_message(&ServerReply::make_caught_up(0))
        {
            StreamResetAddResult::Ok => {}
            StreamResetAddResult::OutOfSpace => return StreamResetPrepareResult::OutOfSpace,
            _ => return StreamResetPrepareResult::ConsumerError,
        }

        let result = self.backend.prepare_reset_stream();
        self.reset_stream_state = if result == StreamResetPrepareResult::Ok {
            ResetStreamState::Prepared
        } else {
            ResetStreamState::None
        };

        self.reset_stream_ctx_id = 0;
        result
    }

    /// Swap the pending log in as the live log. On success, returns the
    /// pending log's message count (the caller's index offset); the state
    /// returns to `None` either way.
    pub fn resolve_streamed_reset(&mut self) -> Result<i64, String> {
        if self.reset_stream_state != ResetStreamState::Prepared {
            return Err("reset stream is not prepared".into());
        }

        let new_first_index = self.last_index + 1;
        let resolved = self.backend.resolve_reset_stream(new_first_index);
        self.reset_stream_state = ResetStreamState::None;
        self.reset_stream_ctx_id = 0;

        let resolved = resolved?;
        self.size_in_bytes = resolved.size_in_bytes;
        self.last_reset_time = Utc::now().timestamp_millis();
        self.first_index = new_first_index;
        self.last_index += resolved.message_count;
        self.auto_reset_base_size = self.reset_stream_size;
        log::info!(
            "session {}: streamed reset resolved, {} messages, {} bytes",
            self.id,
            resolved.message_count,
            resolved.size_in_bytes
        );
        Ok(resolved.message_count)
    }

    /// Abort a streamed reset while it is still streaming. `None` aborts
    /// regardless of which client is resetting.
    pub fn abort_streamed_reset(&mut self, ctx_id: Option<u8>) -> StreamResetAbortResult {
        if self.reset_stream_state == ResetStreamState::Streaming {
            if ctx_id.is_none() || ctx_id == Some(self.reset_stream_ctx_id) {
                self.abort_active_streamed_reset();
                StreamResetAbortResult::Ok
            } else {
                StreamResetAbortResult::InvalidUser
            }
        } else {
            StreamResetAbortResult::NotActive
        }
    }

    fn abort_active_streamed_reset(&mut self) {
        self.backend.discard_reset_stream();
        self.reset_stream_state = ResetStreamState::None;
        self.reset_stream_ctx_id = 0;
        if let Some(consumer) = self.reset_stream_consumer.take() {
            consumer.discard();
        }
    }

    /// Diagnostic description of the in-flight streamed reset, `Null` when
    /// none is active.
    pub fn streamed_reset_description(&self) -> Value {
        let state = match self.reset_stream_state {
            ResetStreamState::None => return Value::Null,
            ResetStreamState::Streaming => "streaming",
            ResetStreamState::Prepared => "prepared",
        };
        json!({
            "state": state,
            "ctxId": self.reset_stream_ctx_id,
            "size": self.reset_stream_size,
            "startIndex": self.reset_stream_start_index,
            "messageCount": self.reset_stream_message_count,
            "haveConsumer": self.reset_stream_consumer.is_some(),
        })
    }

    // --- bans --------------------------------------------------------------

    pub fn ban_list(&self) -> &BanList {
        &self.banlist
    }

    /// Place a ban and journal it through the backend. False on duplicate.
    pub fn add_ban(
        &mut self,
        username: &str,
        ip: IpAddr,
        ext_auth_id: &str,
        sid: &str,
        banned_by: &str,
        banner: Option<SessionBanner>,
    ) -> bool {
        let id = self
            .banlist
            .add_ban(username, ip, ext_auth_id, sid, banned_by, banner);
        if id > 0 {
            self.backend
                .history_add_ban(id, username, ip, ext_auth_id, sid, banned_by);
            true
        } else {
            false
        }
    }

    /// Import a ban export, attributing each entry to `banner`. `None` on
    /// structural error.
    pub fn import_bans(
        &mut self,
        data: &Value,
        banner: Option<&SessionBanner>,
    ) -> Option<BanImport> {
        let mut report = BanImport::default();
        let mut accepted = Vec::new();
        if !BanList::import_bans(data, |b| accepted.push(b)) {
            return None;
        }
        for ban in accepted {
            report.total += 1;
            if self.add_ban(
                &ban.username,
                ban.ip,
                &ban.ext_auth_id,
                &ban.sid,
                &ban.banned_by,
                banner.cloned(),
            ) {
                report.imported += 1;
            }
        }
        Some(report)
    }

    /// Lift a ban, returning the unbanned username (empty if id unknown).
    pub fn remove_ban(&mut self, id: i32) -> String {
        let unbanned = self.banlist.remove_ban(id);
        if !unbanned.is_empty() {
            self.backend.history_remove_ban(id);
        }
        unbanned
    }

    // --- invites -----------------------------------------------------------

    pub fn invites(&self) -> impl Iterator<Item = &Invite> {
        self.invites.values()
    }

    pub fn invite(&self, secret: &str) -> Option<&Invite> {
        self.invites.get(secret)
    }

    /// Create an invite with a fresh secret. `None` when the session's
    /// invite cap is reached. `max_uses` is clamped into the allowed range.
    pub fn create_invite(
        &mut self,
        created_by: &str,
        max_uses: i32,
        trust: bool,
        op: bool,
    ) -> Option<&Invite> {
        if self.invites.len() >= MAX_INVITES {
            return None;
        }
        let secret = self.generate_invite_secret();
        let invite = Invite {
            secret: secret.clone(),
            creator: created_by.into(),
            at: iso_now(),
            max_uses: max_uses.clamp(1, MAX_INVITE_USES),
            trust,
            op,
            uses: HashMap::new(),
        };
        self.invites.insert(secret.clone(), invite);
        self.invites.get(&secret)
    }

    pub fn remove_invite(&mut self, secret: &str) -> bool {
        self.invites.remove(secret).is_some()
    }

    /// Remove the invite with the lexicographically smallest creation
    /// timestamp, returning its secret.
    pub fn remove_oldest_invite(&mut self) -> Option<String> {
        let oldest = self
            .invites
            .values()
            .min_by(|a, b| a.at.cmp(&b.at))?
            .secret
            .clone();
        self.invites.remove(&oldest);
        Some(oldest)
    }

    /// Check (and with `use_invite`, record) a client's use of an invite.
    ///
    /// Usage is keyed by `client_key`; presenting the same key again never
    /// consumes a second use, and a changed name is recorded in place.
    pub fn check_invite(
        &mut self,
        client_key: &str,
        name: &str,
        secret: &str,
        use_invite: bool,
    ) -> CheckInviteResult {
        if client_key.is_empty() {
            return CheckInviteResult::NoClientKey;
        }

        if !secret.is_empty() {
            if let Some(invite) = self.invites.get_mut(secret) {
                if let Some(invite_use) = invite.uses.get_mut(client_key) {
                    return if !use_invite || invite_use.name == name {
                        CheckInviteResult::AlreadyInvited
                    } else {
                        invite_use.name = name.into();
                        CheckInviteResult::AlreadyInvitedNameChanged
                    };
                } else if invite.has_uses_remaining() {
                    return if use_invite {
                        invite.uses.insert(
                            client_key.into(),
                            InviteUse {
                                name: name.into(),
                                at: iso_now(),
                            },
                        );
                        CheckInviteResult::InviteUsed
                    } else {
                        CheckInviteResult::InviteOk
                    };
                } else {
                    return CheckInviteResult::MaxUsesReached;
                }
            }
        }

        CheckInviteResult::NotFound
    }

    fn generate_invite_secret(&self) -> String {
        loop {
            let mut secret = Uuid::new_v4().simple().to_string();
            secret.truncate(12);
            if !self.invites.contains_key(&secret) {
                return secret;
            }
        }
    }

    // --- thumbnail handshake -----------------------------------------------

    /// Assign thumbnail generation to client `ctx_id`, returning the
    /// correlator the client must echo back with the image data.
    pub fn start_thumbnail_generation(&mut self, ctx_id: u8) -> (ThumbnailStartResult, String) {
        if ctx_id == 0 {
            return (ThumbnailStartResult::InvalidUser, String::new());
        }

        if ctx_id == self.thumbnail_ctx_id {
            return (ThumbnailStartResult::AlreadyGenerating, String::new());
        }

        self.thumbnail_ctx_id = ctx_id;
        self.thumbnail_correlator = format!(
            "{:x}:{:x}",
            THUMBNAIL_CORRELATOR_INDEX.fetch_add(1, Ordering::Relaxed),
            Utc::now().timestamp_millis()
        );
        (ThumbnailStartResult::Ok, self.thumbnail_correlator.clone())
    }

    /// Accept thumbnail data. The payload must start with the UTF-8 bytes
    /// of the stored correlator; the remainder is the image. The handshake
    /// is cleared whether or not the data is usable.
    pub fn finish_thumbnail_generation(&mut self, ctx_id: u8, data: &[u8]) -> ThumbnailFinishResult {
        if self.thumbnail_ctx_id != ctx_id {
            return ThumbnailFinishResult::InvalidUser;
        }

        if !data.starts_with(self.thumbnail_correlator.as_bytes()) {
            return ThumbnailFinishResult::InvalidCorrelator;
        }
        let correlator_len = self.thumbnail_correlator.len();

        self.thumbnail_ctx_id = 0;
        self.thumbnail_correlator.clear();

        let image = &data[correlator_len..];
        if image.is_empty() {
            return ThumbnailFinishResult::NoData;
        }

        if !self.backend.set_thumbnail(image) {
            return ThumbnailFinishResult::WriteError;
        }

        ThumbnailFinishResult::Ok
    }

    /// Clear the handshake. A zero `ctx_id` or empty correlator matches
    /// anything. True if a handshake was cleared.
    pub fn cancel_thumbnail_generation(&mut self, ctx_id: u8, correlator: &str) -> bool {
        if (ctx_id == 0 || ctx_id == self.thumbnail_ctx_id)
            && (correlator.is_empty() || correlator == self.thumbnail_correlator)
        {
            self.thumbnail_ctx_id = 0;
            self.thumbnail_correlator.clear();
            true
        } else {
            false
        }
    }

    pub fn purge_thumbnail(&mut self) {
        self.backend.set_thumbnail(&[]);
    }

    /// Diagnostic description of thumbnail state.
    pub fn thumbnail_description(&self) -> Value {
        let mut data = json!({});
        if self.backend.has_thumbnail() {
            if let Some(at) = self.backend.thumbnail_generated_at() {
                data["generatedAt"] = json!(at.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
        }
        if self.thumbnail_ctx_id != 0 || !self.thumbnail_correlator.is_empty() {
            data["generatorCtxId"] = json!(self.thumbnail_ctx_id);
            data["generatorCorrelator"] = json!(self.thumbnail_correlator);
        }
        data
    }

    // --- authenticated identities -------------------------------------------

    pub fn set_authenticated_operator(&mut self, auth_id: &str, op: bool) {
        if op {
            debug_assert!(!auth_id.is_empty());
            if !auth_id.is_empty() {
                self.auth_ops.insert(auth_id.into());
            }
        } else {
            self.auth_ops.remove(auth_id);
        }
    }

    pub fn set_authenticated_trust(&mut self, auth_id: &str, trusted: bool) {
        if trusted {
            debug_assert!(!auth_id.is_empty());
            if !auth_id.is_empty() {
                self.auth_trusted.insert(auth_id.into());
            }
        } else {
            self.auth_trusted.remove(auth_id);
        }
    }

    pub fn set_authenticated_username(&mut self, auth_id: &str, username: &str) {
        debug_assert!(!auth_id.is_empty());
        debug_assert!(!username.is_empty());
        if !auth_id.is_empty() && !username.is_empty() {
            self.auth_usernames.insert(auth_id.into(), username.into());
        }
    }

    pub fn is_authenticated_operator(&self, auth_id: &str) -> bool {
        self.auth_ops.contains(auth_id)
    }

    pub fn is_authenticated_trusted(&self, auth_id: &str) -> bool {
        self.auth_trusted.contains(auth_id)
    }

    pub fn authenticated_username_for(&self, auth_id: &str) -> Option<&str> {
        self.auth_usernames.get(auth_id).map(String::as_str)
    }

    // --- notifications -----------------------------------------------------

    /// Register a callback invoked synchronously whenever new messages are
    /// appended. Callbacks must not reenter mutating operations; they only
    /// get a nudge, reads happen through `get_batch`.
    pub fn on_new_messages(&mut self, callback: impl FnMut() + Send + 'static) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(callback)));
        id
    }

    pub fn remove_new_messages_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn notify_new_messages(&mut self) {
        for (_, callback) in &mut self.listeners {
            callback();
        }
    }
}

fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBackend;
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn history(id: &str) -> SessionHistory<MemoryBackend> {
        SessionHistory::new(id, MemoryBackend::new())
    }

    /// A canvas message with the given total wire length.
    fn msg_of_len(total_len: usize, ctx_id: u8) -> Message {
        assert!(total_len >= crate::message::HEADER_LEN);
        Message::new(
            MessageType::DrawDabs,
            ctx_id,
            vec![0u8; total_len - crate::message::HEADER_LEN],
        )
    }

    /// Wrap inner messages into a single reset-stream chunk.
    fn reset_chunk(ctx_id: u8, inner: &[Message]) -> Message {
        let bytes: Vec<u8> = inner.iter().flat_map(|m| m.encode()).collect();
        Message::new(MessageType::ResetStream, ctx_id, bytes)
    }

    // --- budget ------------------------------------------------------------

    #[test]
    fn test_budget_gate() {
        let mut h = history("budget");
        h.set_base_size_limit(1000);

        assert!(h.add_message(&msg_of_len(600, 1)));
        assert_eq!(h.size_in_bytes(), 600);

        assert!(!h.add_message(&msg_of_len(500, 1)));
        assert_eq!(h.size_in_bytes(), 600);
        assert_eq!(h.last_index(), 0);

        assert!(h.add_emergency_message(&msg_of_len(500, 1)));
        assert_eq!(h.size_in_bytes(), 1100);
        assert_eq!(h.last_index(), 1);
    }

    #[test]
    fn test_emergency_space_has_a_ceiling_too() {
        let mut h = history("budget2");
        h.set_base_size_limit(1000);
        assert!(h.add_message(&msg_of_len(1000, 1)));
        assert!(!h.add_emergency_message(&msg_of_len(
            EMERGENCY_SPACE_BYTES + 1,
            1
        )));
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let mut h = history("nolimit");
        for _ in 0..100 {
            assert!(h.add_message(&msg_of_len(10_000, 1)));
        }
        assert_eq!(h.size_in_bytes(), 1_000_000);
    }

    #[test]
    fn test_size_accounting_matches_sum_of_lengths() {
        let mut h = history("sum");
        let lengths = [4usize, 17, 60, 128, 9];
        for &len in &lengths {
            assert!(h.add_message(&msg_of_len(len, 2)));
        }
        assert_eq!(h.size_in_bytes(), lengths.iter().sum::<usize>());
        assert_eq!(
            h.last_index() - h.first_index() + 1,
            lengths.len() as i64
        );
    }

    #[test]
    fn test_override_size_limit_takes_precedence() {
        let mut h = history("override");
        h.set_base_size_limit(1000);
        assert_eq!(h.current_size_limit(), 1000);

        // An override below base still wins
        h.backend_mut().set_override_size_limit(100);
        assert_eq!(h.current_size_limit(), 100);
        assert!(!h.add_message(&msg_of_len(200, 1)));

        h.backend_mut().set_override_size_limit(0);
        assert_eq!(h.current_size_limit(), 1000);
        assert!(h.add_message(&msg_of_len(200, 1)));
    }

    #[test]
    fn test_base_size_limit_clamped() {
        let mut h = history("clamp");
        h.set_base_size_limit(usize::MAX);
        assert_eq!(h.base_size_limit(), i32::MAX as usize);
    }

    #[test]
    fn test_history_loaded() {
        let mut h = history("loaded");
        h.history_loaded(4096, 37);
        assert_eq!(h.size_in_bytes(), 4096);
        assert_eq!(h.last_index(), 36);
        assert_eq!(h.first_index(), 0);
    }

    // --- atomic reset ------------------------------------------------------

    #[test]
    fn test_reset_rejected_over_limit() {
        let mut h = history("reset-reject");
        h.set_base_size_limit(100);
        assert!(h.add_message(&msg_of_len(10, 1)));

        assert!(!h.reset(&[msg_of_len(50, 1), msg_of_len(60, 1)]));
        // Log unchanged
        assert_eq!(h.size_in_bytes(), 10);
        assert_eq!(h.last_index(), 0);
        assert_eq!(h.first_index(), 0);
    }

    #[test]
    fn test_reset_swaps_log_and_advances_epoch() {
        let mut h = history("reset");
        for _ in 0..5 {
            assert!(h.add_message(&msg_of_len(100, 1)));
        }
        let old_last = h.last_index();
        let old_reset_time = h.last_reset_time();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let replacement = vec![msg_of_len(30, 1), msg_of_len(40, 1)];
        assert!(h.reset(&replacement));

        assert_eq!(h.first_index(), old_last + 1);
        assert_eq!(h.last_index(), old_last + 2);
        assert_eq!(h.size_in_bytes(), 70);
        assert!(h.last_reset_time() > old_reset_time);
        assert_eq!(h.backend().message_count(), 2);
    }

    #[test]
    fn test_reset_discards_streaming_reset() {
        let mut h = history("reset-abort");
        assert_eq!(
            h.start_streamed_reset(3, "cor", &[]),
            StreamResetStartResult::Ok
        );
        assert!(h.reset(&[msg_of_len(10, 1)]));
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
        assert!(h.resolve_streamed_reset().is_err());
    }

    #[test]
    fn test_reset_discards_prepared_reset() {
        let mut h = history("reset-abort-prepared");
        assert_eq!(
            h.start_streamed_reset(3, "cor", &[]),
            StreamResetStartResult::Ok
        );
        let chunk = reset_chunk(3, &[msg_of_len(10, 3)]);
        assert_eq!(h.add_stream_reset_message(3, &chunk), StreamResetAddResult::Ok);
        assert_eq!(h.prepare_streamed_reset(3, 1), StreamResetPrepareResult::Ok);
        assert_eq!(h.reset_stream_state(), ResetStreamState::Prepared);

        assert!(h.reset(&[msg_of_len(10, 1)]));
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
        assert!(h.resolve_streamed_reset().is_err());
    }

    // --- history index -----------------------------------------------------

    #[test]
    fn test_can_skip_to_history_index() {
        let mut h = history("skip");
        for _ in 0..10 {
            assert!(h.add_message(&msg_of_len(10, 1)));
        }

        let hi = h.history_index();
        assert_eq!(hi.history_pos, 9);
        assert!(h.can_skip_to_history_index(&hi));
        assert!(h.can_skip_to_history_index(&HistoryIndex::new(
            "skip",
            h.last_reset_time(),
            0
        )));

        // Outside the retained range
        assert!(!h.can_skip_to_history_index(&HistoryIndex::new(
            "skip",
            h.last_reset_time(),
            10
        )));
        // Wrong session
        assert!(!h.can_skip_to_history_index(&HistoryIndex::new(
            "other",
            h.last_reset_time(),
            5
        )));
        // Stale reset epoch
        assert!(!h.can_skip_to_history_index(&HistoryIndex::new(
            "skip",
            h.last_reset_time() - 1,
            5
        )));
        // Invalid
        assert!(!h.can_skip_to_history_index(&HistoryIndex::new("", 0, -1)));
    }

    // --- streamed reset ----------------------------------------------------

    #[test]
    fn test_streamed_reset_happy_path() {
        let mut h = history("stream");
        for _ in 0..4 {
            assert!(h.add_message(&msg_of_len(50, 1)));
        }

        assert_eq!(
            h.start_streamed_reset(7, "cor-1", &[]),
            StreamResetStartResult::Ok
        );
        assert_eq!(h.reset_stream_state(), ResetStreamState::Streaming);
        // The soft reset and stream start markers went to the live log
        assert_eq!(h.last_index(), 5);

        let inner = [msg_of_len(10, 7), msg_of_len(20, 7), msg_of_len(30, 7)];
        let chunk = reset_chunk(7, &inner);
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);

        assert_eq!(h.prepare_streamed_reset(7, 3), StreamResetPrepareResult::Ok);
        assert_eq!(h.reset_stream_state(), ResetStreamState::Prepared);

        let old_last = h.last_index();
        let offset = h.resolve_streamed_reset().unwrap();
        // 3 user messages + the caught-up marker
        assert_eq!(offset, 4);
        assert_eq!(h.first_index(), old_last + 1);
        assert_eq!(h.last_index(), old_last + 4);

        let caught_up_len = ServerReply::make_caught_up(0).length();
        assert_eq!(h.size_in_bytes(), 60 + caught_up_len);
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
    }

    #[test]
    fn test_streamed_reset_wrong_count() {
        let mut h = history("stream-count");
        assert_eq!(
            h.start_streamed_reset(7, "cor-1", &[]),
            StreamResetStartResult::Ok
        );
        let chunk = reset_chunk(7, &[msg_of_len(10, 7), msg_of_len(20, 7), msg_of_len(30, 7)]);
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);

        assert_eq!(
            h.prepare_streamed_reset(7, 5),
            StreamResetPrepareResult::InvalidMessageCount
        );
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
        // Pending log is gone
        assert!(h.resolve_streamed_reset().is_err());
    }

    #[test]
    fn test_streamed_reset_zero_expected_count_rejected() {
        let mut h = history("stream-zero");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        assert_eq!(
            h.prepare_streamed_reset(7, 0),
            StreamResetPrepareResult::InvalidMessageCount
        );
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
    }

    #[test]
    fn test_streamed_reset_seed_counts_toward_offset() {
        let mut h = history("stream-seed");
        let seed = vec![
            Message::make_server_command(0, &serde_json::json!({"type": "sessionconf"})),
        ];
        assert_eq!(
            h.start_streamed_reset(7, "c", &seed),
            StreamResetStartResult::Ok
        );
        let chunk = reset_chunk(7, &[msg_of_len(10, 7)]);
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);
        assert_eq!(h.prepare_streamed_reset(7, 1), StreamResetPrepareResult::Ok);
        // seed + 1 user message + caught-up
        assert_eq!(h.resolve_streamed_reset().unwrap(), 3);
    }

    #[test]
    fn test_streamed_reset_already_active() {
        let mut h = history("stream-dup");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        assert_eq!(
            h.start_streamed_reset(8, "d", &[]),
            StreamResetStartResult::AlreadyActive
        );
    }

    #[test]
    fn test_streamed_reset_start_out_of_space() {
        let mut h = history("stream-full");
        h.set_base_size_limit(20);
        assert!(h.add_message(&msg_of_len(20, 1)));
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::OutOfSpace
        );
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
        assert_eq!(h.last_index(), 0);
    }

    #[test]
    fn test_add_stream_reset_message_guards() {
        let mut h = history("stream-guards");
        let chunk = reset_chunk(7, &[msg_of_len(10, 7)]);
        assert_eq!(
            h.add_stream_reset_message(7, &chunk),
            StreamResetAddResult::NotActive
        );

        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        assert_eq!(
            h.add_stream_reset_message(8, &chunk),
            StreamResetAddResult::InvalidUser
        );
        assert_eq!(
            h.add_stream_reset_message(7, &msg_of_len(10, 7)),
            StreamResetAddResult::BadType
        );
    }

    #[test]
    fn test_empty_chunk_is_flush_ping() {
        let mut h = history("stream-ping");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        let ping = Message::new(MessageType::ResetStream, 7, Vec::new());
        assert_eq!(h.add_stream_reset_message(7, &ping), StreamResetAddResult::Ok);
    }

    #[test]
    fn test_stream_rejects_control_and_meta_messages() {
        let mut h = history("stream-types");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );

        let control = Message::new(MessageType::Ping, 7, Vec::new());
        let chunk = reset_chunk(7, &[control]);
        assert_eq!(
            h.add_stream_reset_message(7, &chunk),
            StreamResetAddResult::DisallowedType
        );

        let meta = Message::make_soft_reset(7);
        let chunk = reset_chunk(7, &[meta]);
        assert_eq!(
            h.add_stream_reset_message(7, &chunk),
            StreamResetAddResult::DisallowedType
        );

        // Chat is the one server-meta type allowed through
        let chat = Message::new(MessageType::Chat, 7, b"hi".to_vec());
        let chunk = reset_chunk(7, &[chat]);
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);
    }

    #[test]
    fn test_stream_out_of_space() {
        let mut h = history("stream-space");
        h.set_base_size_limit(200);

        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        let chunk = reset_chunk(7, &[msg_of_len(150, 7), msg_of_len(100, 7)]);
        assert_eq!(
            h.add_stream_reset_message(7, &chunk),
            StreamResetAddResult::OutOfSpace
        );

        // The error is sticky for the prepare that follows
        assert_eq!(
            h.prepare_streamed_reset(7, 2),
            StreamResetPrepareResult::OutOfSpace
        );
    }

    #[test]
    fn test_stream_forces_context_id() {
        let mut h = history("stream-ctx");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        // Inner message claims to be from someone else
        let chunk = reset_chunk(7, &[msg_of_len(10, 3)]);
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);
        assert_eq!(h.prepare_streamed_reset(7, 1), StreamResetPrepareResult::Ok);
        assert!(h.resolve_streamed_reset().is_ok());

        let (batch, _) = h.get_batch(h.first_index() - 1);
        assert_eq!(batch[0].context_id(), 7);
    }

    #[test]
    fn test_stream_partial_tail_fails_prepare() {
        let mut h = history("stream-partial");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        let inner = msg_of_len(40, 7);
        let bytes = inner.encode();
        // Send all but the last byte
        let chunk = Message::new(MessageType::ResetStream, 7, bytes[..bytes.len() - 1].to_vec());
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);

        assert_eq!(
            h.prepare_streamed_reset(7, 1),
            StreamResetPrepareResult::ConsumerError
        );
    }

    #[test]
    fn test_abort_streamed_reset() {
        let mut h = history("stream-abort");
        assert_eq!(
            h.abort_streamed_reset(None),
            StreamResetAbortResult::NotActive
        );

        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        assert_eq!(
            h.abort_streamed_reset(Some(3)),
            StreamResetAbortResult::InvalidUser
        );
        assert_eq!(h.reset_stream_state(), ResetStreamState::Streaming);

        assert_eq!(h.abort_streamed_reset(Some(7)), StreamResetAbortResult::Ok);
        assert_eq!(h.reset_stream_state(), ResetStreamState::None);
    }

    #[test]
    fn test_live_log_keeps_accepting_during_stream() {
        let mut h = history("stream-live");
        assert_eq!(
            h.start_streamed_reset(7, "c", &[]),
            StreamResetStartResult::Ok
        );
        let before = h.last_index();
        assert!(h.add_message(&msg_of_len(25, 2)));
        assert_eq!(h.last_index(), before + 1);

        // Live appends don't count into the pending stream size
        let chunk = reset_chunk(7, &[msg_of_len(10, 7)]);
        assert_eq!(h.add_stream_reset_message(7, &chunk), StreamResetAddResult::Ok);
        assert_eq!(h.prepare_streamed_reset(7, 1), StreamResetPrepareResult::Ok);
        let caught_up_len = ServerReply::make_caught_up(0).length();
        assert!(h.resolve_streamed_reset().is_ok());
        assert_eq!(h.size_in_bytes(), 10 + caught_up_len);
    }

    #[test]
    fn test_streamed_reset_description() {
        let mut h = history("stream-desc");
        assert_eq!(h.streamed_reset_description(), Value::Null);

        h.start_streamed_reset(7, "c", &[]);
        let desc = h.streamed_reset_description();
        assert_eq!(desc["state"], json!("streaming"));
        assert_eq!(desc["ctxId"], json!(7));
        assert_eq!(desc["messageCount"], json!(0));
    }

    // --- auto reset --------------------------------------------------------

    #[test]
    fn test_auto_reset_threshold_disabled() {
        let h = history("autoreset-off");
        assert_eq!(h.effective_auto_reset_threshold(), 0);
    }

    #[test]
    fn test_auto_reset_threshold_capped_at_ninety_percent() {
        let mut h = history("autoreset-cap");
        h.set_base_size_limit(1000);
        h.backend_mut().set_auto_reset_threshold(950);
        assert_eq!(h.effective_auto_reset_threshold(), 900);

        h.backend_mut().set_auto_reset_threshold(500);
        assert_eq!(h.effective_auto_reset_threshold(), 500);
    }

    #[test]
    fn test_auto_reset_threshold_relative_to_reset_base() {
        let mut h = history("autoreset-base");
        h.set_base_size_limit(10_000);
        h.backend_mut().set_auto_reset_threshold(500);

        for _ in 0..10 {
            assert!(h.add_message(&msg_of_len(100, 1)));
        }
        assert!(h.reset(&[msg_of_len(300, 1)]));
        // Base is now 300, so the trigger point moves up with it
        assert_eq!(h.effective_auto_reset_threshold(), 800);
    }

    // --- bans --------------------------------------------------------------

    #[test]
    fn test_add_and_remove_ban() {
        let mut h = history("bans");
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(h.add_ban("alice", ip, "", "sid-1", "op", None));
        assert!(!h.add_ban("alice", ip, "", "sid-1", "op", None));

        let id = h.ban_list().bans()[0].id;
        assert_eq!(h.remove_ban(id), "alice");
        assert_eq!(h.remove_ban(id), "");
    }

    #[test]
    fn test_import_bans_reports_counts() {
        let mut h = history("ban-import");
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(h.add_ban("bob", ip, "", "sid-b", "op", None));

        let data = json!({"bans": [
            {"username": "bob", "ip": "10.0.0.2", "sid": "sid-b", "bannedBy": "op"},
            {"username": "carol", "ip": "10.0.0.3", "sid": "sid-c", "bannedBy": "op"},
        ]});
        let report = h.import_bans(&data, None).unwrap();
        assert_eq!(report.total, 2);
        // bob was already banned
        assert_eq!(report.imported, 1);
        assert_eq!(h.ban_list().len(), 2);

        assert!(h.import_bans(&json!(42), None).is_none());
    }

    // --- invites -----------------------------------------------------------

    #[test]
    fn test_invite_lifecycle() {
        let mut h = history("invites");
        let secret = h
            .create_invite("alice", 2, true, false)
            .map(|i| i.secret.clone())
            .unwrap();

        assert_eq!(
            h.check_invite("k1", "bob", &secret, true),
            CheckInviteResult::InviteUsed
        );
        assert_eq!(
            h.check_invite("k1", "bob", &secret, true),
            CheckInviteResult::AlreadyInvited
        );
        assert_eq!(
            h.check_invite("k2", "carol", &secret, true),
            CheckInviteResult::InviteUsed
        );
        assert_eq!(
            h.check_invite("k3", "dave", &secret, true),
            CheckInviteResult::MaxUsesReached
        );
        assert_eq!(h.invite(&secret).unwrap().uses.len(), 2);
    }

    #[test]
    fn test_invite_dry_run_does_not_consume() {
        let mut h = history("invite-dry");
        let secret = h
            .create_invite("alice", 1, false, false)
            .map(|i| i.secret.clone())
            .unwrap();

        assert_eq!(
            h.check_invite("k1", "bob", &secret, false),
            CheckInviteResult::InviteOk
        );
        assert!(h.invite(&secret).unwrap().uses.is_empty());

        assert_eq!(
            h.check_invite("k1", "bob", &secret, true),
            CheckInviteResult::InviteUsed
        );
    }

    #[test]
    fn test_invite_name_change_updates_record() {
        let mut h = history("invite-rename");
        let secret = h
            .create_invite("alice", 5, false, false)
            .map(|i| i.secret.clone())
            .unwrap();

        assert_eq!(
            h.check_invite("k1", "bob", &secret, true),
            CheckInviteResult::InviteUsed
        );
        assert_eq!(
            h.check_invite("k1", "bobby", &secret, true),
            CheckInviteResult::AlreadyInvitedNameChanged
        );
        assert_eq!(h.invite(&secret).unwrap().uses["k1"].name, "bobby");
        // Dry-run probe with yet another name leaves the record alone
        assert_eq!(
            h.check_invite("k1", "robert", &secret, false),
            CheckInviteResult::AlreadyInvited
        );
        assert_eq!(h.invite(&secret).unwrap().uses["k1"].name, "bobby");
        assert_eq!(h.invite(&secret).unwrap().uses.len(), 1);
    }

    #[test]
    fn test_invite_guards() {
        let mut h = history("invite-guards");
        let secret = h
            .create_invite("alice", 1, false, false)
            .map(|i| i.secret.clone())
            .unwrap();

        assert_eq!(
            h.check_invite("", "bob", &secret, true),
            CheckInviteResult::NoClientKey
        );
        assert_eq!(
            h.check_invite("k1", "bob", "wrong", true),
            CheckInviteResult::NotFound
        );
        assert_eq!(
            h.check_invite("k1", "bob", "", true),
            CheckInviteResult::NotFound
        );
    }

    #[test]
    fn test_invite_cap_and_clamp() {
        let mut h = history("invite-cap");
        for _ in 0..MAX_INVITES {
            assert!(h.create_invite("alice", 1, false, false).is_some());
        }
        assert!(h.create_invite("alice", 1, false, false).is_none());

        let mut h = history("invite-clamp");
        let over = h.create_invite("a", MAX_INVITE_USES + 10, false, false).unwrap();
        assert_eq!(over.max_uses, MAX_INVITE_USES);
        let under = h.create_invite("a", 0, false, false).unwrap();
        assert_eq!(under.max_uses, 1);
    }

    #[test]
    fn test_invite_secrets_unique() {
        let mut h = history("invite-unique");
        let mut secrets = std::collections::HashSet::new();
        for _ in 0..MAX_INVITES {
            let secret = h
                .create_invite("a", 1, false, false)
                .map(|i| i.secret.clone())
                .unwrap();
            assert!(secrets.insert(secret));
        }
    }

    #[test]
    fn test_remove_oldest_invite() {
        let mut h = history("invite-oldest");
        assert!(h.remove_oldest_invite().is_none());

        let first = h
            .create_invite("a", 1, false, false)
            .map(|i| i.secret.clone())
            .unwrap();
        let second = h
            .create_invite("a", 1, false, false)
            .map(|i| i.secret.clone())
            .unwrap();
        // Identical timestamps are possible within a second; force an order
        h.invites.get_mut(&first).unwrap().at = "2026-08-01T00:00:00Z".into();
        h.invites.get_mut(&second).unwrap().at = "2026-08-02T00:00:00Z".into();

        assert_eq!(h.remove_oldest_invite(), Some(first));
        assert_eq!(h.remove_oldest_invite(), Some(second));
        assert_eq!(h.remove_oldest_invite(), None);
    }

    // --- thumbnail handshake -----------------------------------------------

    #[test]
    fn test_thumbnail_handshake() {
        let mut h = history("thumb");
        let (result, correlator) = h.start_thumbnail_generation(3);
        assert_eq!(result, ThumbnailStartResult::Ok);
        assert!(correlator.contains(':'));

        let mut data = correlator.clone().into_bytes();
        data.extend_from_slice(b"image-bytes");
        assert_eq!(
            h.finish_thumbnail_generation(3, &data),
            ThumbnailFinishResult::Ok
        );
        assert_eq!(h.backend().thumbnail(), Some(&b"image-bytes"[..]));

        // Handshake is cleared: a second finish is from nobody
        assert_eq!(
            h.finish_thumbnail_generation(3, &data),
            ThumbnailFinishResult::InvalidUser
        );
    }

    #[test]
    fn test_thumbnail_guards() {
        let mut h = history("thumb-guards");
        assert_eq!(
            h.start_thumbnail_generation(0),
            (ThumbnailStartResult::InvalidUser, String::new())
        );

        let (result, correlator) = h.start_thumbnail_generation(3);
        assert_eq!(result, ThumbnailStartResult::Ok);
        assert_eq!(
            h.start_thumbnail_generation(3).0,
            ThumbnailStartResult::AlreadyGenerating
        );

        // Data not prefixed with the correlator
        assert_eq!(
            h.finish_thumbnail_generation(3, b"xxx-something"),
            ThumbnailFinishResult::InvalidCorrelator
        );
        // The handshake survives a bad correlator
        let mut data = correlator.into_bytes();
        data.extend_from_slice(b"img");
        assert_eq!(
            h.finish_thumbnail_generation(3, &data),
            ThumbnailFinishResult::Ok
        );
    }

    #[test]
    fn test_thumbnail_no_data() {
        let mut h = history("thumb-empty");
        let (_, correlator) = h.start_thumbnail_generation(4);
        assert_eq!(
            h.finish_thumbnail_generation(4, correlator.as_bytes()),
            ThumbnailFinishResult::NoData
        );
        assert!(!h.backend().has_thumbnail());
    }

    #[test]
    fn test_thumbnail_cancel() {
        let mut h = history("thumb-cancel");
        let (_, correlator) = h.start_thumbnail_generation(5);

        assert!(!h.cancel_thumbnail_generation(6, ""));
        assert!(!h.cancel_thumbnail_generation(5, "mismatch"));
        assert!(h.cancel_thumbnail_generation(5, &correlator));

        // Wildcards: ctx 0 and empty correlator match anything
        let (_, _) = h.start_thumbnail_generation(5);
        assert!(h.cancel_thumbnail_generation(0, ""));
    }

    #[test]
    fn test_thumbnail_correlators_unique() {
        let mut h = history("thumb-cor");
        let (_, a) = h.start_thumbnail_generation(1);
        h.cancel_thumbnail_generation(0, "");
        let (_, b) = h.start_thumbnail_generation(1);
        assert_ne!(a, b);
    }

    // --- authenticated identities ------------------------------------------

    #[test]
    fn test_auth_sets() {
        let mut h = history("auth");
        h.set_authenticated_operator("auth-1", true);
        h.set_authenticated_trust("auth-1", true);
        h.set_authenticated_username("auth-1", "alice");

        assert!(h.is_authenticated_operator("auth-1"));
        assert!(h.is_authenticated_trusted("auth-1"));
        assert_eq!(h.authenticated_username_for("auth-1"), Some("alice"));
        assert_eq!(h.authenticated_username_for("auth-2"), None);

        h.set_authenticated_operator("auth-1", false);
        h.set_authenticated_trust("auth-1", false);
        assert!(!h.is_authenticated_operator("auth-1"));
        assert!(!h.is_authenticated_trusted("auth-1"));
    }

    // --- notifications -----------------------------------------------------

    #[test]
    fn test_new_messages_listener() {
        let mut h = history("listen");
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = h.on_new_messages(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert!(h.add_message(&msg_of_len(10, 1)));
        assert!(h.add_emergency_message(&msg_of_len(10, 1)));
        assert!(h.reset(&[]));
        assert_eq!(count.load(Ordering::Relaxed), 3);

        // A rejected append does not notify
        h.set_base_size_limit(4);
        assert!(!h.add_message(&msg_of_len(10, 1)));
        assert_eq!(count.load(Ordering::Relaxed), 3);

        assert!(h.remove_new_messages_listener(id));
        assert!(!h.remove_new_messages_listener(id));
    }

    // --- catch-up keys -----------------------------------------------------

    #[test]
    fn test_catchup_key_rotation() {
        let mut key = MIN_CATCHUP_KEY;
        assert_eq!(increment_next_catchup_key(&mut key), MIN_CATCHUP_KEY);
        assert_eq!(key, MIN_CATCHUP_KEY + 1);

        key = MAX_CATCHUP_KEY;
        assert_eq!(increment_next_catchup_key(&mut key), MAX_CATCHUP_KEY);
        assert_eq!(key, MIN_CATCHUP_KEY);
    }
}
