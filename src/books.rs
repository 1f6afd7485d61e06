//! Books-service side of the synchronization engine.
//!
//! Mirror of the authors side: this service owns books, publishes `book.*`
//! and `book_author.*` events after its primary writes, and projects
//! `author.*` / `author_book.*` events into a local authors cache through
//! the publisher-less [`AuthorSync`]. The cached author row keeps only the
//! fields this service reads (name, nationality), not the full author
//! schema.

use async_trait::async_trait;
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

/// A book as this service owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub isbn: Option<String>,
    pub publication_year: Option<i64>,
}

/// Fields for creating or replacing a book record.
#[derive(Debug, Clone)]
pub struct NewBook {
    pub title: String,
    pub isbn: Option<String>,
    pub publication_year: Option<i64>,
}

/// Port to the primary book store.
#[async_trait]
pub trait BookRepository: Send + Sync {
    async fn create(&self, book: NewBook) -> Result<Book, RepositoryError>;
    async fn get(&self, id: i64) -> Result<Option<Book>, RepositoryError>;
    async fn update(&self, id: i64, book: NewBook) -> Result<Option<Book>, RepositoryError>;
    async fn delete(&self, id: i64) -> Result<bool, RepositoryError>;
}

/// In-process book store.
#[derive(Default)]
pub struct MemoryBookRepository {
    rows: RwLock<HashMap<i64, Book>>,
    next_id: AtomicI64,
}

impl MemoryBookRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookRepository for MemoryBookRepository {
    async fn create(&self, book: NewBook) -> Result<Book, RepositoryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let created = Book {
            id,
            title: book.title,
            isbn: book.isbn,
            publication_year: book.publication_year,
        };
        self.rows.write().await.insert(id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: i64) -> Result<Option<Book>, RepositoryError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn update(&self, id: i64, book: NewBook) -> Result<Option<Book>, RepositoryError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) => {
                row.title = book.title;
                row.isbn = book.isbn;
                row.publication_year = book.publication_year;
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: i64) -> Result<bool, RepositoryError> {
        Ok(self.rows.write().await.remove(&id).is_some())
    }
}

/// An author row cached from the authors service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAuthor {
    pub author_id: i64,
    pub name: String,
    #[serde(default)]
    pub nationality: Option<String>,
}

impl CacheEntity for CachedAuthor {
    const NAMESPACE: &'static str = "authors_cache";

    fn id(&self) -> i64 {
        self.author_id
    }
}

/// Domain orchestration for the write path; publishes one event per
/// committed primary change.
pub struct BookService {
    repo: Arc<dyn BookRepository>,
    authors: Arc<dyn ForeignCache<CachedAuthor>>,
    links: Arc<dyn LinkStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl BookService {
    pub fn new(
        repo: Arc<dyn BookRepository>,
        authors: Arc<dyn ForeignCache<CachedAuthor>>,
        links: Arc<dyn LinkStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            authors,
            links,
            publisher,
        }
    }

    fn validate(book: &NewBook) -> Result<(), DomainError> {
        if book.title.trim().is_empty() {
            return Err(DomainError::Validation(
                "book title must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn change_payload(book: &Book) -> Map<String, Value> {
        object(json!({
            "book_id": book.id,
            "title": book.title,
            "isbn": book.isbn,
            "publication_year": book.publication_year,
        }))
    }

    pub async fn create_book(
        &self,
        book: NewBook,
        correlation_id: Option<String>,
    ) -> Result<Book, DomainError> {
        Self::validate(&book)?;

        let created = self.repo.create(book).await?;
        self.publisher
            .publish(
                topics::BOOK_CREATED,
                Self::change_payload(&created),
                correlation_id,
            )
            .await?;
        Ok(created)
    }

    pub async fn update_book(
        &self,
        id: i64,
        book: NewBook,
        correlation_id: Option<String>,
    ) -> Result<Option<Book>, DomainError> {
        Self::validate(&book)?;

        match self.repo.update(id, book).await? {
            Some(updated) => {
                self.publisher
                    .publish(
                        topics::BOOK_UPDATED,
                        Self::change_payload(&updated),
                        correlation_id,
                    )
                    .await?;
                Ok(Some(updated))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_book(
        &self,
        id: i64,
        correlation_id: Option<String>,
    ) -> Result<bool, DomainError> {
        if !self.repo.delete(id).await? {
            return Ok(false);
        }

        self.publisher
            .publish(
                topics::BOOK_DELETED,
                object(json!({"book_id": id})),
                correlation_id,
            )
            .await?;
        Ok(true)
    }

    /// Assign authors to a book; every author id must already be cached.
    pub async fn assign_authors(
        &self,
        book_id: i64,
        author_ids: &[i64],
        correlation_id: Option<String>,
    ) -> Result<(), DomainError> {
        if self.repo.get(book_id).await?.is_none() {
            return Err(DomainError::NotFound(format!("book {book_id} not found")));
        }
        for author_id in author_ids {
            if self.authors.get(*author_id).await?.is_none() {
                return Err(DomainError::NotFound(format!(
                    "author {author_id} not found in cache"
                )));
            }
        }

        for author_id in author_ids {
            self.links.link(book_id, *author_id).await?;
            self.publisher
                .publish(
                    topics::BOOK_AUTHOR_LINKED,
                    object(json!({"book_id": book_id, "author_id": author_id})),
                    correlation_id.clone(),
                )
                .await?;
        }
        Ok(())
    }

    /// Remove one assignment; publishes only when the link actually existed.
    pub async fn unassign_author(
        &self,
        book_id: i64,
        author_id: i64,
        correlation_id: Option<String>,
    ) -> Result<bool, DomainError> {
        if self.repo.get(book_id).await?.is_none() {
            return Err(DomainError::NotFound(format!("book {book_id} not found")));
        }

        if !self.links.unlink(book_id, author_id).await? {
            return Ok(false);
        }

        self.publisher
            .publish(
                topics::BOOK_AUTHOR_UNLINKED,
                object(json!({"book_id": book_id, "author_id": author_id})),
                correlation_id,
            )
            .await?;
        Ok(true)
    }

    /// A book together with its cached author rows.
    pub async fn get_book_with_authors(
        &self,
        book_id: i64,
    ) -> Result<Option<(Book, Vec<CachedAuthor>)>, DomainError> {
        let book = match self.repo.get(book_id).await? {
            Some(book) => book,
            None => return Ok(None),
        };

        let mut authors = Vec::new();
        for author_id in self.links.links_for(book_id).await? {
            if let Some(author) = self.authors.get(author_id).await? {
                authors.push(author);
            }
        }
        Ok(Some((book, authors)))
    }
}

/// The event path's view of this service: cache and link writes only, with
/// no publisher field to hold, so an inbound event can never fan back out.
pub struct AuthorSync {
    authors: Arc<dyn ForeignCache<CachedAuthor>>,
    links: Arc<dyn LinkStore>,
}

impl AuthorSync {
    pub fn new(authors: Arc<dyn ForeignCache<CachedAuthor>>, links: Arc<dyn LinkStore>) -> Self {
        Self { authors, links }
    }

    pub async fn upsert_author(&self, author: CachedAuthor) -> Result<(), CacheError> {
        debug!(author_id = author.author_id, "Upserting cached author");
        self.authors.upsert(author).await
    }

    /// Drop the cached row and every book link referencing it.
    pub async fn remove_author(&self, author_id: i64) -> Result<(), CacheError> {
        self.links.unlink_foreign(author_id).await?;
        self.authors.remove(author_id).await
    }

    pub async fn link_author(&self, book_id: i64, author_id: i64) -> Result<(), CacheError> {
        self.links.link(book_id, author_id).await
    }

    pub async fn unlink_author(&self, book_id: i64, author_id: i64) -> Result<(), CacheError> {
        self.links.unlink(book_id, author_id).await.map(|_| ())
    }
}

struct AuthorUpsertHandler {
    sync: Arc<AuthorSync>,
}

#[async_trait]
impl EventHandler for AuthorUpsertHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let author: CachedAuthor = decode_fields(data)?;
        Ok(self.sync.upsert_author(author).await?)
    }
}

struct AuthorRemoveHandler {
    sync: Arc<AuthorSync>,
}

#[async_trait]
impl EventHandler for AuthorRemoveHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let author_id = require_i64(data, "author_id")?;
        Ok(self.sync.remove_author(author_id).await?)
    }
}

struct AuthorLinkHandler {
    sync: Arc<AuthorSync>,
}

#[async_trait]
impl EventHandler for AuthorLinkHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let author_id = require_i64(data, "author_id")?;
        let book_id = require_i64(data, "book_id")?;
        Ok(self.sync.link_author(book_id, author_id).await?)
    }
}

struct AuthorUnlinkHandler {
    sync: Arc<AuthorSync>,
}

#[async_trait]
impl EventHandler for AuthorUnlinkHandler {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
        let author_id = require_i64(data, "author_id")?;
        let book_id = require_i64(data, "book_id")?;
        Ok(self.sync.unlink_author(book_id, author_id).await?)
    }
}

/// Wire every author-side event type to its handler. `author.created` and
/// `author.updated` share the upsert handler.
pub fn register_author_handlers(
    consumer: &dyn EventConsumer,
    sync: Arc<AuthorSync>,
) -> Result<(), ConsumerError> {
    consumer.register_handler(
        topics::AUTHOR_CREATED,
        Arc::new(AuthorUpsertHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::AUTHOR_UPDATED,
        Arc::new(AuthorUpsertHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::AUTHOR_DELETED,
        Arc::new(AuthorRemoveHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::AUTHOR_BOOK_LINKED,
        Arc::new(AuthorLinkHandler { sync: sync.clone() }),
    )?;
    consumer.register_handler(
        topics::AUTHOR_BOOK_UNLINKED,
        Arc::new(AuthorUnlinkHandler { sync }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, MemoryLinkStore};
    use crate::consumer::EventConsumer;
    use crate::dlq::MemoryDeadLetterQueue;
    use crate::memory::MemoryBroker;
    use crate::publisher::EventPublisher;
    use crate::retry::RetryPolicy;

    /// Full consume-side wiring over the in-memory transport, the way a
    /// books worker assembles it.
    struct SyncFixture {
        broker: MemoryBroker,
        consumer: crate::memory::MemoryConsumer,
        authors: Arc<MemoryCache<CachedAuthor>>,
        links: Arc<MemoryLinkStore>,
        dlq: Arc<MemoryDeadLetterQueue>,
    }

    async fn start_sync() -> SyncFixture {
        let broker = MemoryBroker::new();
        let authors: Arc<MemoryCache<CachedAuthor>> = Arc::new(MemoryCache::new());
        let links = Arc::new(MemoryLinkStore::new());
        let dlq = Arc::new(MemoryDeadLetterQueue::new());

        let sync = Arc::new(AuthorSync::new(authors.clone(), links.clone()));
        let consumer = broker.consumer(RetryPolicy::fast(), dlq.clone());
        register_author_handlers(&consumer, sync).unwrap();
        consumer.start().await.unwrap();

        SyncFixture {
            broker,
            consumer,
            authors,
            links,
            dlq,
        }
    }

    fn author_payload(author_id: i64, name: &str) -> Map<String, Value> {
        object(json!({
            "author_id": author_id,
            "name": name,
            "birth_date": "1921-09-06",
            "nationality": "Spanish",
        }))
    }

    #[tokio::test]
    async fn test_created_updated_deleted_converges_end_to_end() {
        let fx = start_sync().await;
        let publisher = fx.broker.publisher();
        publisher.start().await.unwrap();

        publisher
            .publish(topics::AUTHOR_CREATED, author_payload(1, "X"), None)
            .await
            .unwrap();
        fx.broker.settled().await;
        assert_eq!(fx.authors.get(1).await.unwrap().unwrap().name, "X");

        publisher
            .publish(topics::AUTHOR_UPDATED, author_payload(1, "Y"), None)
            .await
            .unwrap();
        fx.broker.settled().await;
        assert_eq!(fx.authors.get(1).await.unwrap().unwrap().name, "Y");

        publisher
            .publish(
                topics::AUTHOR_DELETED,
                object(json!({"author_id": 1})),
                None,
            )
            .await
            .unwrap();
        fx.broker.settled().await;
        assert!(fx.authors.get(1).await.unwrap().is_none());

        fx.consumer.stop().await.unwrap();
        assert_eq!(fx.dlq.count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let fx = start_sync().await;
        let publisher = fx.broker.publisher();
        publisher.start().await.unwrap();

        for _ in 0..3 {
            publisher
                .publish(topics::AUTHOR_CREATED, author_payload(1, "X"), None)
                .await
                .unwrap();
        }
        fx.broker.settled().await;
        fx.consumer.stop().await.unwrap();

        assert_eq!(fx.authors.len().await, 1);
        assert_eq!(fx.authors.get(1).await.unwrap().unwrap().name, "X");
    }

    #[tokio::test]
    async fn test_link_before_create_in_either_order_converges() {
        let fx = start_sync().await;
        let publisher = fx.broker.publisher();
        publisher.start().await.unwrap();

        // The link event outruns the author's own created event; settling
        // in between pins that delivery order across topics.
        publisher
            .publish(
                topics::AUTHOR_BOOK_LINKED,
                object(json!({"author_id": 7, "book_id": 3})),
                None,
            )
            .await
            .unwrap();
        fx.broker.settled().await;

        publisher
            .publish(topics::AUTHOR_CREATED, author_payload(7, "Z"), None)
            .await
            .unwrap();
        fx.broker.settled().await;
        fx.consumer.stop().await.unwrap();

        assert_eq!(fx.links.links_for(3).await.unwrap(), vec![7]);
        assert!(fx.authors.get(7).await.unwrap().is_some());
        assert_eq!(fx.dlq.count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_for_never_cached_author_is_harmless() {
        let fx = start_sync().await;
        let publisher = fx.broker.publisher();
        publisher.start().await.unwrap();

        publisher
            .publish(
                topics::AUTHOR_DELETED,
                object(json!({"author_id": 404})),
                None,
            )
            .await
            .unwrap();
        fx.broker.settled().await;
        fx.consumer.stop().await.unwrap();

        assert!(fx.authors.is_empty().await);
        assert_eq!(fx.dlq.count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_purges_links_both_ways() {
        let fx = start_sync().await;
        let publisher = fx.broker.publisher();
        publisher.start().await.unwrap();

        publisher
            .publish(topics::AUTHOR_CREATED, author_payload(7, "Z"), None)
            .await
            .unwrap();
        fx.broker.settled().await;

        publisher
            .publish(
                topics::AUTHOR_BOOK_LINKED,
                object(json!({"author_id": 7, "book_id": 3})),
                None,
            )
            .await
            .unwrap();
        fx.broker.settled().await;

        publisher
            .publish(
                topics::AUTHOR_DELETED,
                object(json!({"author_id": 7})),
                None,
            )
            .await
            .unwrap();
        fx.broker.settled().await;
        fx.consumer.stop().await.unwrap();

        assert!(fx.authors.get(7).await.unwrap().is_none());
        assert!(fx.links.links_for(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_book_service_publish_and_validation() {
        let repo = Arc::new(MemoryBookRepository::new());
        let authors: Arc<MemoryCache<CachedAuthor>> = Arc::new(MemoryCache::new());
        let links = Arc::new(MemoryLinkStore::new());
        let broker = MemoryBroker::new();
        let publisher = Arc::new(broker.publisher());
        publisher.start().await.unwrap();

        let service = BookService::new(repo, authors.clone(), links, publisher);

        let empty_title = NewBook {
            title: "  ".to_string(),
            isbn: None,
            publication_year: None,
        };
        assert!(matches!(
            service.create_book(empty_title, None).await,
            Err(DomainError::Validation(_))
        ));

        let created = service
            .create_book(
                NewBook {
                    title: "Nada".to_string(),
                    isbn: Some("978-84-233-1162-6".to_string()),
                    publication_year: Some(1944),
                },
                Some("req-3".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(created.id, 1);

        // Assigning an uncached author is rejected on the write path; the
        // event path's link handler has no such check by design.
        assert!(matches!(
            service.assign_authors(created.id, &[9], None).await,
            Err(DomainError::NotFound(_))
        ));

        authors
            .upsert(CachedAuthor {
                author_id: 9,
                name: "Carmen Laforet".to_string(),
                nationality: Some("Spanish".to_string()),
            })
            .await
            .unwrap();
        service.assign_authors(created.id, &[9], None).await.unwrap();

        let (book, cached) = service
            .get_book_with_authors(created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(book.title, "Nada");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "Carmen Laforet");
    }

    #[tokio::test]
    async fn test_cached_author_keeps_subset_of_fields() {
        // birth_date is published by the authors service but not part of
        // this service's projection; decoding must not reject it.
        let author: CachedAuthor = decode_fields(&author_payload(5, "W")).unwrap();
        assert_eq!(author.author_id, 5);
        assert_eq!(author.nationality.as_deref(), Some("Spanish"));
    }
}
