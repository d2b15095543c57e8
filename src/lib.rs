//! # fresco-session — Session history engine for the Fresco server
//!
//! The server side of Fresco keeps one authoritative, append-only message
//! log per drawing session. This crate is that engine: it ingests canvas
//! mutation messages from concurrent clients, enforces the session's byte
//! budget, coordinates atomic and streamed resets, and owns the session's
//! bans, invites and thumbnail handshake.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  messages   ┌───────────────┐  hooks   ┌────────────────┐
//! │ Clients  │ ──────────► │ SessionHistory│ ───────► │ HistoryBackend │
//! │ (many)   │             │ (one writer)  │          │ (memory/disk)  │
//! └────┬─────┘             └──────┬────────┘          └────────────────┘
//!      │    catch-up              │ new messages
//!      ◄──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`] — Opaque messages and the binary wire framing
//! - [`servercmd`] — JSON command/reply envelope ([`ServerCommand`], [`ServerReply`])
//! - [`banlist`] — Session bans with JSON import/export
//! - [`invite`] — Invites with per-client usage tracking
//! - [`resetstream`] — Reset-stream chunk accumulator
//! - [`history`] — The session history engine and its backend trait
//! - [`session`] — Single-writer loop (task + inbox) around a history

pub mod banlist;
pub mod history;
pub mod invite;
pub mod message;
pub mod resetstream;
pub mod servercmd;
pub mod session;

// Re-exports for convenience
pub use banlist::{BanList, SessionBan, SessionBanner};
pub use history::memory::MemoryBackend;
pub use history::{
    increment_next_catchup_key, BanImport, HistoryBackend, HistoryIndex, ListenerId,
    ResetStreamState, ResolvedResetStream, SessionHistory, StreamResetAbortResult,
    StreamResetAddResult, StreamResetPrepareResult, StreamResetStartResult,
    ThumbnailFinishResult, ThumbnailStartResult, EMERGENCY_SPACE_BYTES, MAX_CATCHUP_KEY,
    MIN_CATCHUP_KEY,
};
pub use invite::{CheckInviteResult, Invite, InviteUse, MAX_INVITES, MAX_INVITE_USES};
pub use message::{Message, MessageError, MessageType};
pub use resetstream::ResetStreamConsumer;
pub use servercmd::{ReplyType, ServerCommand, ServerReply};
pub use session::{SessionClosed, SessionHandle, SessionSnapshot};
