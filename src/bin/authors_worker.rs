//! Authors-service sync worker.
//!
//! Consumes `book.*` and `book_author.*` events and projects them into this
//! service's local book cache. The sync service is constructed without a
//! publisher, so nothing consumed here can fan back out as a new event.
//!
//! Configuration comes from `SHELFSTREAM_CONFIG` (TOML, see
//! [`shelfstream::config`]); `RUST_LOG` controls logging.

use std::sync::Arc;

use deadpool_redis::{Config as RedisPoolConfig, Runtime};
use tracing::info;

use shelfstream::authors::{register_book_handlers, BookSync, CachedBook};
use shelfstream::cache::{RedisCache, RedisLinkStore};
use shelfstream::config::SyncConfig;
use shelfstream::consumer::{EventConsumer, RedisStreamConsumer};
use shelfstream::dlq::RedisDeadLetterQueue;
use shelfstream::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = SyncConfig::load()?;
    info!(
        service = %config.service.name,
        consumer_group = %config.consumer_group(),
        "Authors sync worker starting"
    );

    let pool =
        RedisPoolConfig::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;

    let books: Arc<RedisCache<CachedBook>> = Arc::new(RedisCache::new(pool.clone()));
    let links = Arc::new(RedisLinkStore::new(pool.clone(), "author_books"));
    let sync = Arc::new(BookSync::new(books, links));

    let dlq = Arc::new(RedisDeadLetterQueue::with_stream(
        pool,
        config.dlq.stream.clone(),
        config.dlq.max_len,
    ));
    let consumer = RedisStreamConsumer::new(
        config.redis.url.clone(),
        config.consumer_group(),
        config.consumer_name(),
        config.retry_policy(),
        dlq,
    );
    register_book_handlers(&consumer, sync)?;
    consumer.start().await?;

    let shutdown = ShutdownSignal::new();
    shutdown.wait().await;

    consumer.stop().await?;
    info!("Authors sync worker stopped");
    Ok(())
}
