//! Authors-service side of the synchronization engine.
//!
//! This service owns authors and the author-to-book assignments it makes,
//! and keeps a local cache of books owned by the books service. Outbound:
//! [`AuthorService`] publishes `author.*` and `author_book.*` events after
//! committing its primary writes. Inbound: [`BookSync`] applies `book.*` and
//! `book_author.*` events to the cache; it is constructed without any
//! publisher, so consuming an event can never emit one.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::{CacheEntity, CacheError, ForeignCache, LinkStore};
use crate::consumer::{ConsumerError, EventConsumer, EventHandler, HandlerError};
use crate::domain::{decode_fields, object, require_i64, DomainError, RepositoryError};
use crate::publisher::EventPublisher;
use crate::topics;

/// An author as this service owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub nationality: Option<String>,
}

/// Fields for creating or replacing an author record.
#[derive(Debug, Clone)]
pub struct NewAuthor {
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub nationality: Option<String>,
}

/// Port to the primary author store. The concrete relational implementation
/// lives outside this crate; [`MemoryAuthorRepository`] stands in for it in
/// tests and local runs.
#[async_trait]
pub trait AuthorRepository: Send + Sync {
    async fn create(&self, author: NewAuthor) -> Result<Author, RepositoryError>;
    async fn get(&self, id: i64) -> Result<Option<Author>, RepositoryError>;
    async fn update(&self, id: i64, author: NewAuthor) -> Result<Option<Author>, RepositoryError>;
    async fn delete(&self, id: i64) -> Result<bool, RepositoryError>;
}

/// In-process author store.
#[derive(Default)]
pub struct MemoryAuthorRepository {
    rows: RwLock<HashMap<i64, Author>>,
    next_id: AtomicI64,
}

impl MemoryAuthorRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorRepository for MemoryAuthorRepository {
    async fn create(&self, author: NewAuthor) -> Result<Author, RepositoryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let created = Author {
            id,
            name: author.name,
            birth_date: author.birth_date,
            nationality: author.nationality,
        };
        self.rows.write().await.insert(id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: i64) -> Result<Option<Author>, RepositoryError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn update(&self, id: i64, author: NewAuthor) -> Result<Option<Author>, RepositoryError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) => {
                row.name = author.name;
                row.birth_date = author.birth_date;
                row.nationality = author.nationality;
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: i64) -> Result<bool, RepositoryError> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }
}

/// A book row cached from the books service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBook {
    pub book_id: i64,
    pub title: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub publication_year: Option<i64>,
}

impl CacheEntity for CachedBook {
    const NAMESPACE: &'static str = "books_cache";

    fn id(&self) -> i64 {
        self.book_id
    }
}

/// Domain orchestration for the write path. Publishes one event per
/// committed primary change, threading the caller's correlation id through
/// unchanged. Publish failures come back to the caller, which owns the
/// rollback-or-degrade decision.
pub struct AuthorService {
    repo: Arc<dyn AuthorRepository>,
    books: Arc<dyn ForeignCache<CachedBook>>,
    links: Arc<dyn LinkStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl AuthorService {
    pub fn new(
        repo: Arc<dyn AuthorRepository>,
        books: Arc<dyn ForeignCache<CachedBook>>,
        links: Arc<dyn LinkStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            books,
            links,
            publisher,
        }
    }

    fn validate(author: &NewAuthor) -> Result<(), DomainError> {
        if author.name.trim().len() < 2 {
            return Err(DomainError::Validation(
                "author name must be at least 2 characters".to_string(),
            ));
        }
        Ok(())
    }

    fn change_payload(author: &Author) -> Map<String, Value> {
        object(json!({
            "author_id": author.id,
            "name": author.name,
            "birth_date": author.birth_date,
            "nationality": author.nationality,
        }))
    }

    pub async fn create_author(
        &self,
        author: NewAuthor,
        correlation_id: Option<String>,
    ) -> Result<Author, DomainError> {
        Self::validate(&author)?;

        let created = self.repo.create(author).await?;
        self.publisher
            .publish(
                topics::AUTHOR_CREATED,
                Self::change_payload(&created),
                correlation_id,
            )
            .await?;
        Ok(created)
    }

    pub async fn update_author(
        &self,
        id: i64,
        author: NewAuthor,
        correlation_id: Option<String>,
    ) -> Result<Option<Author>, DomainError> {
        Self::validate(&author)?;

        match self.repo.update(id, author).await? {
            Some(updated) => {
                self.publisher
                    .publish(
                        topics::AUTHOR_UPDATED,
                        Self::change_payload(&updated),
                        correlation_id,
                    )
                    .await?;
                Ok(Some(updated))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_author(
        &self,
        id: i64,
        correlation_id: Option<String>,
    ) -> Result<bool, DomainError> {
        if !self.repo.delete(id).await? {
            return Ok(false);
        }

        self.publisher
            .publish(
                topics::AUTHOR_DELETED,
                object(json!({"author_id": id})),
                correlation_id,
            )
            .await?;
        Ok(true)
    }

    /// Assign books to an author. Every book id must already be present in
    /// the local cache; one `author_book.linked` event is published per
    /// assignment.
    pub async fn assign_books(
        &self,
        author_id: i64,
        book_ids: &[i64],
        correlation_id: Option<String>,
    ) -> Result<(), DomainError> {
        if self.repo.get(author_id).await?.is_none() {
            return Err(DomainError::NotFound(format!(
                "author {author_id} not found"
            )));
        }
        for book_id in book_ids {
            if self.books.get(*book_id).await?.is_none() {
                return Err(DomainError::NotFound(format!(
                    "book {book_id} not found in cache"
                )));
            }
        }

        for book_id in book_ids {
            self.links.link(author_id, *book_id).await?;
            self.publisher
                .publish(
                    topics::AUTHOR_BOOK_LINKED,
                    object(json!({"author_id": author_id, "book_id": book_id})),
                    correlation_id.clone(),
                )
                .await?;
        }
        Ok(())
    }

    /// Remove one assignment; publishes only when the link actually existed.
    pub async fn unassign_book(
        &self,
        author_id: i64,
        book_id: i64,
        correlation_id: Option<String>,
    ) -> Result<bool, DomainError> {
        if self.repo.get(author_id).await?.is_none() {
            return Err(DomainError::NotFound(format!(
                "author {author_id} not found"
            )));
        }

        if !self.links.unlink(author_id, book_id).await? {
            return Ok(false);
        }

        self.publisher
            .publish(
                topics::AUTHOR_BOOK_UNLINKED,
                object(json!({"author_id": author_id, "book_id": book_id})),
                correlation_id,
            )
            .await?;
        Ok(true)
    }

    /// An author together with its cached book rows.
    pub async fn get_author_with_books(
        &self,
        author_id: i64,
    ) -> Result<Option<(Author, Vec<CachedBook>)>, DomainError> {
        let author = match self.repo.get(author_id).await? {
            Some(author) => author,
            None => return Ok(None),
        };

        let mut books = Vec::new();
        for book_id in self.links.links_for(author_id).await? {
            if let Some(book) = self.books.get(book_id).await? {
                books.push(book);
            }
        }
        Ok(Some((author, books)))
    }
}

/// The event path's view of this service: cache and link writes only.
///
/// Structurally publisher-less; there is no field to hold one, so the
/// publish-consume-publish cycle is unrepresentable from here.
pub struct BookSync {
    books: Arc<dyn ForeignCache<CachedBook>>,
    links: Arc<dyn LinkStore>,
}

impl BookSync {
    pub fn new(books: Arc<dyn ForeignCache<CachedBook>>, links: Arc<dyn LinkStore>) -> Self {
        Self { books, links }
    }

    pub async fn upsert_book(&self, book: CachedBook) -> Result<(), CacheError> {
        debug!(book_id = book.book_id, "Upserting cached book");
        self.books.upsert(book).await
    }

    /// Drop the cached row and every author link referencing it.
    pub async fn remove_book(&self, book_id: i64) -> Result<(), CacheError> {
        self.links.unlink_foreign(book_id).await?;
        self.books.remove(book_id).await
    }

    pub async fn link_book(&self, author_id: i64, book_id: i64) -> Result<(), CacheError> {
        self.links.link(author_id, book_id).await
    }

    pub async fn unlink_book(&self, author_id: i64, book_id: i64) -> Result<(), CacheError> {
        self.links.unlink(author_id, book_id).await.map(|_| ())
    }
}

struct BookUpsertHandler {
    sync: Arc<BookSync>,
}

#[async_trait]
impl EventHandler for BookUpsertHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let book: CachedBook = decode_fields(data)?;
        Ok(self.sync.upsert_book(book).await?)
    }
}

struct BookRemoveHandler {
    sync: Arc<BookSync>,
}

#[async_trait]
impl EventHandler for BookRemoveHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let book_id = require_i64(data, "book_id")?;
        Ok(self.sync.remove_book(book_id).await?)
    }
}

struct BookLinkHandler {
    sync: Arc<BookSync>,
}

#[async_trait]
impl EventHandler for BookLinkHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let author_id = require_i64(data, "author_id")?;
        let book_id = require_i64(data, "book_id")?;
        Ok(self.sync.link_book(author_id, book_id).await?)
    }
}

struct BookUnlinkHandler {
    sync: Arc<BookSync>,
}

#[async_trait]
impl EventHandler for BookUnlinkHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let author_id = require_i64(data, "author_id")?;
        let book_id = require_i64(data, "book_id")?;
        Ok(self.sync.unlink_book(author_id, book_id).await?)
    }
}

/// Wire every book-side event type to its handler. `book.created` and
/// `book.updated` share the upsert handler: both mean "this is the current
/// state of the book".
pub fn register_book_handlers(
    consumer: &dyn EventConsumer,
    sync: Arc<BookSync>,
) -> Result<(), ConsumerError> {
    consumer.register_handler(
        topics::BOOK_CREATED,
        Arc::new(BookUpsertHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::BOOK_UPDATED,
        Arc::new(BookUpsertHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::BOOK_DELETED,
        Arc::new(BookRemoveHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::BOOK_AUTHOR_LINKED,
        Arc::new(BookLinkHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::BOOK_AUTHOR_UNLINKED,
        Arc::new(BookUnlinkHandler { sync }),
    )?;
    Ok(())
}
