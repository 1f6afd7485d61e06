//! # shelfstream
//!
//! Event-driven cache synchronization for the authors/books service pair.
//!
//! Each service owns its primary entities and keeps a local, read-only cache
//! of the other service's entities, kept eventually consistent over an event
//! stream. Delivery is at-least-once; convergence comes from idempotent
//! upserts, not broker-level dedup.
//!
//! ## Architecture
//!
//! ```text
//! domain write -> Publisher -> broker topic -> Consumer -> Dispatcher
//!                                                  |
//!                                          handler (publisher-less sync)
//!                                                  |
//!                                           Cache Repository
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: the wire envelope shared by every event
//! - [`publisher`] / [`consumer`]: the broker ports and their Redis Streams
//!   implementations
//! - [`memory`]: in-process implementation of the same ports
//! - [`retry`]: bounded exponential backoff schedule
//! - [`dlq`]: dead-letter records for messages that cannot be applied
//! - [`cache`]: idempotent foreign-entity cache and link stores
//! - [`authors`] / [`books`]: the two service sides
//! - [`config`], [`shutdown`]: worker plumbing

pub mod authors;
pub mod books;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod domain;
pub mod envelope;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod shutdown;

pub use consumer::{EventConsumer, EventHandler, HandlerRegistry};
pub use envelope::EventEnvelope;
pub use publisher::EventPublisher;

/// Event-type catalog. By convention the topic carrying an event equals its
/// `event_type`.
pub mod topics {
    pub const AUTHOR_CREATED: &str = "author.created";
    pub const AUTHOR_UPDATED: &str = "author.updated";
    pub const AUTHOR_DELETED: &str = "author.deleted";
    pub const AUTHOR_BOOK_LINKED: &str = "author_book.linked";
    pub const AUTHOR_BOOK_UNLINKED: &str = "author_book.unlinked";

    pub const BOOK_CREATED: &str = "book.created";
    pub const BOOK_UPDATED: &str = "book.updated";
    pub const BOOK_DELETED: &str = "book.deleted";
    pub const BOOK_AUTHOR_LINKED: &str = "book_author.linked";
    pub const BOOK_AUTHOR_UNLINKED: &str = "book_author.unlinked";
}
