//! Single-writer session loop.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionHandle ── mpsc inbox ── task ── SessionHistory
//! Client B ──┘        │                                       │
//!                     └◄── broadcast "new messages" ──────────┘
//! ```
//!
//! One tokio task owns the `SessionHistory` and drains an unbounded inbox
//! of closures, so every mutation runs to completion in arrival order and
//! observable behavior is linearizable without a lock. `SessionHandle` is
//! the cheap, cloneable front: each method enqueues a closure and awaits a
//! oneshot reply.
//!
//! The new-messages notification is edge-triggered: it rides a small
//! broadcast channel, and a lagging subscriber just observes `Lagged` and
//! reads the log range it missed via [`SessionHandle::get_batch`].

use std::fmt;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::banlist::SessionBanner;
use crate::history::{
    BanImport, HistoryBackend, HistoryIndex, ResetStreamState, SessionHistory,
    StreamResetAbortResult, StreamResetAddResult, StreamResetPrepareResult,
    StreamResetStartResult, ThumbnailFinishResult, ThumbnailStartResult,
};
use crate::invite::{CheckInviteResult, Invite};
use crate::message::Message;

/// Buffered notification slots per subscriber before it observes `Lagged`.
const NOTIFY_CAPACITY: usize = 16;

type Command<B> = Box<dyn FnOnce(&mut SessionHistory<B>) + Send>;

/// The session loop has shut down (all handles dropped or task aborted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

impl fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session loop is closed")
    }
}

impl std::error::Error for SessionClosed {}

/// Consistent view of the history counters between mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub first_index: i64,
    pub last_index: i64,
    pub size_in_bytes: usize,
    pub last_reset_time: i64,
    pub current_size_limit: usize,
    pub reset_stream_state: ResetStreamState,
}

/// Cloneable front for a spawned session loop.
pub struct SessionHandle<B: HistoryBackend> {
    tx: mpsc::UnboundedSender<Command<B>>,
    notify: broadcast::Sender<()>,
}

impl<B: HistoryBackend> Clone for SessionHandle<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<B: HistoryBackend + 'static> SessionHandle<B> {
    /// Move `history` into a dedicated writer task and return its handle.
    /// The task stops when the last handle is dropped.
    pub fn spawn(mut history: SessionHistory<B>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<B>>();
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);

        let notify = notify_tx.clone();
        history.on_new_messages(move || {
            // No receivers is fine; subscribers come and go
            let _ = notify.send(());
        });

        let session_id = history.id().to_string();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                command(&mut history);
            }
            log::debug!("session {session_id}: writer loop stopped");
        });

        Self {
            tx,
            notify: notify_tx,
        }
    }

    /// Subscribe to new-message nudges. On `Lagged`, read the log range;
    /// nothing is lost, only nudges coalesce.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    async fn call<R, F>(&self, f: F) -> Result<R, SessionClosed>
    where
        R: Send + 'static,
        F: FnOnce(&mut SessionHistory<B>) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command: Command<B> = Box::new(move |history| {
            let _ = reply_tx.send(f(history));
        });
        self.tx.send(command).map_err(|_| SessionClosed)?;
        reply_rx.await.map_err(|_| SessionClosed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionClosed> {
        self.call(|h| SessionSnapshot {
            first_index: h.first_index(),
            last_index: h.last_index(),
            size_in_bytes: h.size_in_bytes(),
            last_reset_time: h.last_reset_time(),
            current_size_limit: h.current_size_limit(),
            reset_stream_state: h.reset_stream_state(),
        })
        .await
    }

    pub async fn set_base_size_limit(&self, limit: usize) -> Result<(), SessionClosed> {
        self.call(move |h| h.set_base_size_limit(limit)).await
    }

    pub async fn add_message(&self, msg: Message) -> Result<bool, SessionClosed> {
        self.call(move |h| h.add_message(&msg)).await
    }

    pub async fn add_emergency_message(&self, msg: Message) -> Result<bool, SessionClosed> {
        self.call(move |h| h.add_emergency_message(&msg)).await
    }

    pub async fn get_batch(&self, after_index: i64) -> Result<(Vec<Message>, i64), SessionClosed> {
        self.call(move |h| h.get_batch(after_index)).await
    }

    pub async fn history_index(&self) -> Result<HistoryIndex, SessionClosed> {
        self.call(|h| h.history_index()).await
    }

    pub async fn can_skip_to_history_index(
        &self,
        hi: HistoryIndex,
    ) -> Result<bool, SessionClosed> {
        self.call(move |h| h.can_skip_to_history_index(&hi)).await
    }

    pub async fn reset(&self, new_history: Vec<Message>) -> Result<bool, SessionClosed> {
        self.call(move |h| h.reset(&new_history)).await
    }

    pub async fn start_streamed_reset(
        &self,
        ctx_id: u8,
        correlator: String,
        server_side_state_messages: Vec<Message>,
    ) -> Result<StreamResetStartResult, SessionClosed> {
        self.call(move |h| {
            h.start_streamed_reset(ctx_id, &correlator, &server_side_state_messages)
        })
        .await
    }

    pub async fn add_stream_reset_message(
        &self,
        ctx_id: u8,
        msg: Message,
    ) -> Result<StreamResetAddResult, SessionClosed> {
        self.call(move |h| h.add_stream_reset_message(ctx_id, &msg))
            .await
    }

    pub async fn prepare_streamed_reset(
        &self,
        ctx_id: u8,
        expected_message_count: i64,
    ) -> Result<StreamResetPrepareResult, SessionClosed> {
        self.call(move |h| h.prepare_streamed_reset(ctx_id, expected_message_count))
            .await
    }

    pub async fn resolve_streamed_reset(&self) -> Result<Result<i64, String>, SessionClosed> {
        self.call(|h| h.resolve_streamed_reset()).await
    }

    pub async fn abort_streamed_reset(
        &self,
        ctx_id: Option<u8>,
    ) -> Result<StreamResetAbortResult, SessionClosed> {
        self.call(move |h| h.abort_streamed_reset(ctx_id)).await
    }

    pub async fn create_invite(
        &self,
        created_by: String,
        max_uses: i32,
        trust: bool,
        op: bool,
    ) -> Result<Option<Invite>, SessionClosed> {
        self.call(move |h| h.create_invite(&created_by, max_uses, trust, op).cloned())
            .await
    }

    pub async fn remove_invite(&self, secret: String) -> Result<bool, SessionClosed> {
        self.call(move |h| h.remove_invite(&secret)).await
    }

    pub async fn remove_oldest_invite(&self) -> Result<Option<String>, SessionClosed> {
        self.call(|h| h.remove_oldest_invite()).await
    }

    pub async fn check_invite(
        &self,
        client_key: String,
        name: String,
        secret: String,
        use_invite: bool,
    ) -> Result<CheckInviteResult, SessionClosed> {
        self.call(move |h| h.check_invite(&client_key, &name, &secret, use_invite))
            .await
    }

    pub async fn add_ban(
        &self,
        username: String,
        ip: std::net::IpAddr,
        ext_auth_id: String,
        sid: String,
        banned_by: String,
        banner: Option<SessionBanner>,
    ) -> Result<bool, SessionClosed> {
        self.call(move |h| h.add_ban(&username, ip, &ext_auth_id, &sid, &banned_by, banner))
            .await
    }

    pub async fn remove_ban(&self, id: i32) -> Result<String, SessionClosed> {
        self.call(move |h| h.remove_ban(id)).await
    }

    pub async fn import_bans(
        &self,
        data: Value,
        banner: Option<SessionBanner>,
    ) -> Result<Option<BanImport>, SessionClosed> {
        self.call(move |h| h.import_bans(&data, banner.as_ref()))
            .await
    }

    pub async fn ban_list_json(&self, full: bool) -> Result<Value, SessionClosed> {
        self.call(move |h| h.ban_list().to_json(full)).await
    }

    pub async fn start_thumbnail_generation(
        &self,
        ctx_id: u8,
    ) -> Result<(ThumbnailStartResult, String), SessionClosed> {
        self.call(move |h| h.start_thumbnail_generation(ctx_id))
            .await
    }

    pub async fn finish_thumbnail_generation(
        &self,
        ctx_id: u8,
        data: Vec<u8>,
    ) -> Result<ThumbnailFinishResult, SessionClosed> {
        self.call(move |h| h.finish_thumbnail_generation(ctx_id, &data))
            .await
    }

    pub async fn cancel_thumbnail_generation(
        &self,
        ctx_id: u8,
        correlator: String,
    ) -> Result<bool, SessionClosed> {
        self.call(move |h| h.cancel_thumbnail_generation(ctx_id, &correlator))
            .await
    }

    pub async fn streamed_reset_description(&self) -> Result<Value, SessionClosed> {
        self.call(|h| h.streamed_reset_description()).await
    }

    pub async fn thumbnail_description(&self) -> Result<Value, SessionClosed> {
        self.call(|h| h.thumbnail_description()).await
    }
}
