//! The Connector: the single owner of database access.
//!
//! Mirrors the original `DBConnector`'s split between a pooled asynchronous
//! path (`runQuery`/`runInteraction`) and a single dedicated connection for
//! synchronous, blocking calls (`runQueryNow`/`runInteractionNow`), plus
//! placeholder normalization and quiescence tracking via the notification
//! [`Bus`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use sqlx::any::{install_default_drivers, AnyConnectOptions, AnyConnection, AnyKind, AnyPoolOptions};
use sqlx::{AnyPool, ConnectOptions, Connection};
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::BoundedCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::notify::{Bus, Category, Notification};
use crate::schema;
use crate::url::DatabaseUrl;

/// Bound on [`Connector::query_times`], matching the original's
/// `MAX_QUERY_TIMES`.
pub const MAX_QUERY_TIMES: usize = 1000;

/// An open transaction against the `Any` backend. Store modules are handed
/// one of these; they never see the pool or the dedicated connection
/// directly.
pub type Txn<'c> = sqlx::Transaction<'c, sqlx::Any>;

/// A dynamically typed bind value, used by store modules that assemble SQL
/// with a variable number of placeholders (e.g. the `IN (...)` clauses in
/// `iterate_changes`).
#[derive(Debug, Clone)]
pub enum Bind {
    Text(String),
    Int(i64),
    Null,
}

impl From<&str> for Bind {
    fn from(s: &str) -> Self {
        Bind::Text(s.to_string())
    }
}
impl From<String> for Bind {
    fn from(s: String) -> Self {
        Bind::Text(s)
    }
}
impl From<i64> for Bind {
    fn from(v: i64) -> Self {
        Bind::Int(v)
    }
}
impl From<Option<i64>> for Bind {
    fn from(v: Option<i64>) -> Self {
        match v {
            Some(v) => Bind::Int(v),
            None => Bind::Null,
        }
    }
}
impl From<Option<String>> for Bind {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(v) => Bind::Text(v),
            None => Bind::Null,
        }
    }
}
impl From<bool> for Bind {
    fn from(v: bool) -> Self {
        Bind::Int(if v { 1 } else { 0 })
    }
}

pub struct Connector {
    pool: AnyPool,
    dedicated: AsyncMutex<Option<AnyConnection>>,
    sqlx_url: String,
    backend: AnyKind,
    clock: Arc<dyn Clock>,
    bus: Arc<Bus>,
    query_times: StdMutex<VecDeque<Duration>>,
    pending_operation_count: AtomicI64,

    pub(crate) change_cache: BoundedCache<i64, Arc<crate::changes::Change>>,
    pub(crate) sourcestamp_cache: BoundedCache<i64, Arc<crate::sourcestamps::SourceStamp>>,
}

impl Connector {
    /// Connects using the given URL (see [`DatabaseUrl::parse`]), creating
    /// the schema if the database is empty.
    pub async fn open(url: &str, basedir: Option<&str>) -> Result<Arc<Self>> {
        let parsed = DatabaseUrl::parse(url, basedir)?;
        Self::open_parsed(parsed).await
    }

    pub async fn open_parsed(parsed: DatabaseUrl) -> Result<Arc<Self>> {
        install_default_drivers();
        let sqlx_url = parsed.as_sqlx_url();

        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .connect(&sqlx_url)
            .await?;
        let backend = pool.any_kind();

        schema::create_or_open_db(&pool).await?;

        Ok(Arc::new(Connector {
            pool,
            dedicated: AsyncMutex::new(None),
            sqlx_url,
            backend,
            clock: Arc::new(SystemClock),
            bus: Bus::new(),
            query_times: StdMutex::new(VecDeque::with_capacity(MAX_QUERY_TIMES)),
            pending_operation_count: AtomicI64::new(0),
            change_cache: BoundedCache::default(),
            sourcestamp_cache: BoundedCache::default(),
        }))
    }

    /// Swaps in a caller-supplied clock, for tests that need virtual time.
    /// Must be called before any store operation runs.
    pub fn with_clock(mut self: Arc<Self>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_clock must be called before the connector is shared")
            .clock = clock;
        self
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Rewrites `?` placeholders to the backend's native style. `sqlx::Any`
    /// already accepts `?` for every supported backend, so this exists to
    /// honor the original contract and to normalize SQL assembled by hand
    /// (e.g. a dynamic `IN (...)` clause) before it is logged or compared.
    pub fn normalize(&self, sql: &str) -> String {
        match self.backend {
            AnyKind::Postgres => {
                let mut out = String::with_capacity(sql.len());
                let mut n = 0;
                for c in sql.chars() {
                    if c == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(c);
                    }
                }
                out
            }
            _ => sql.to_string(),
        }
    }

    /// A parenthesized, comma-separated list of `count` placeholders, e.g.
    /// `placeholders(3) == "(?,?,?)"`.
    pub fn placeholders(&self, count: usize) -> String {
        if count == 0 {
            return "()".to_string();
        }
        let mut s = String::from("(");
        for i in 0..count {
            if i > 0 {
                s.push(',');
            }
            s.push('?');
        }
        s.push(')');
        s
    }

    fn bind_query<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
        binds: &'q [Bind],
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        for b in binds {
            query = match b {
                Bind::Text(s) => query.bind(s.as_str()),
                Bind::Int(v) => query.bind(*v),
                Bind::Null => query.bind(Option::<i64>::None),
            };
        }
        query
    }

    /// Runs a query against the pool, returning the matched rows.
    pub async fn run_query_async(
        &self,
        sql: &str,
        binds: &[Bind],
    ) -> Result<Vec<sqlx::any::AnyRow>> {
        let start = Instant::now();
        let normalized = self.normalize(sql);
        let query = Self::bind_query(sqlx::query(&normalized), binds);
        let rows = query.fetch_all(&self.pool).await?;
        self.record_query_time(start.elapsed());
        Ok(rows)
    }

    /// Runs `f` inside a pooled transaction, tracking quiescence via the
    /// notification bus for the duration of the call.
    pub async fn run_interaction_async<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut Txn<'_>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let start = Instant::now();
        self.pending_operation_count.fetch_add(1, Ordering::SeqCst);
        let guard = self.bus.start_operation().await;

        let mut txn = self.pool.begin().await?;
        let result = f(&mut txn).await;
        let outcome = match result {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        };

        drop(guard);
        self.pending_operation_count.fetch_sub(1, Ordering::SeqCst);
        self.record_query_time(start.elapsed());
        outcome
    }

    /// Runs `f` on the dedicated non-pooled connection, blocking until it
    /// completes. On failure, rolls back and, if that also fails, drops the
    /// connection so the next call reconnects (`Error::LostConnection`).
    pub async fn run_interaction_sync<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut Txn<'_>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let start = Instant::now();
        let guard = self.bus.start_operation().await;
        let mut slot = self.dedicated.lock().await;

        if slot.is_none() {
            let parsed = self.sqlx_url.parse().map_err(|_| {
                Error::Configuration(format!("invalid connection url: {}", self.sqlx_url))
            })?;
            let options = AnyConnectOptions::from_url(&parsed)
                .map_err(|e| Error::Configuration(format!("invalid connection options: {e}")))?;
            *slot = Some(options.connect().await?);
        }

        let conn = slot.as_mut().expect("dedicated connection just established");
        let mut txn = match conn.begin().await {
            Ok(t) => t,
            Err(e) => {
                *slot = None;
                drop(guard);
                self.record_query_time(start.elapsed());
                return Err(Error::from(e));
            }
        };

        let result = f(&mut txn).await;
        let outcome = match result {
            Ok(value) => match txn.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    *slot = None;
                    Err(Error::from(e))
                }
            },
            Err(e) => {
                if txn.rollback().await.is_err() {
                    *slot = None;
                    drop(e);
                    drop(guard);
                    self.record_query_time(start.elapsed());
                    return Err(Error::LostConnection);
                }
                Err(e)
            }
        };

        drop(guard);
        self.record_query_time(start.elapsed());
        outcome
    }

    /// Reads the `version` table. `None` means the database is empty (no
    /// version table yet) rather than an error.
    pub async fn get_version(&self) -> Result<Option<i64>> {
        match schema::open_db(&self.pool).await {
            Ok(()) => Ok(Some(schema::SCHEMA_VERSION)),
            Err(Error::NotReady(crate::error::NotReadyReason::Empty)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Records a `last_access` row for observability, matching the
    /// original's per-client-class touch log.
    pub async fn record_last_access(&self, who: &str, writing: bool) -> Result<()> {
        let now = self.now();
        sqlx::query(&self.normalize(
            "INSERT INTO last_access (who, writing, last_access) VALUES (?, ?, ?)",
        ))
        .bind(who)
        .bind(if writing { 1i64 } else { 0i64 })
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queues a notification; delivery is deferred to quiescence.
    pub async fn notify(&self, category: Category, ids: Vec<i64>) {
        self.bus.notify(category, ids).await;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    pub async fn has_pending_operations(&self) -> bool {
        self.bus.has_pending_operations().await
    }

    /// Bounded ring of the last [`MAX_QUERY_TIMES`] measured latencies.
    pub fn query_times(&self) -> Vec<Duration> {
        self.query_times.lock().expect("query_times mutex poisoned").iter().cloned().collect()
    }

    fn record_query_time(&self, elapsed: Duration) {
        let mut times = self.query_times.lock().expect("query_times mutex poisoned");
        times.push_back(elapsed);
        if times.len() > MAX_QUERY_TIMES {
            times.pop_front();
        }
    }

    /// Runs a statement against an open transaction, normalizing placeholders
    /// first. Store modules use this (rather than `sqlx::query` directly) so
    /// every query benefits from the same `?` → `$n` rewriting `run_query_async`
    /// applies to pooled queries.
    pub async fn exec_txn(
        &self,
        txn: &mut Txn<'_>,
        sql: &str,
        binds: &[Bind],
    ) -> Result<sqlx::any::AnyQueryResult> {
        let normalized = self.normalize(sql);
        let query = Self::bind_query(sqlx::query(&normalized), binds);
        Ok(query.execute(&mut **txn).await?)
    }

    pub async fn fetch_all_txn(
        &self,
        txn: &mut Txn<'_>,
        sql: &str,
        binds: &[Bind],
    ) -> Result<Vec<sqlx::any::AnyRow>> {
        let normalized = self.normalize(sql);
        let query = Self::bind_query(sqlx::query(&normalized), binds);
        Ok(query.fetch_all(&mut **txn).await?)
    }

    pub async fn fetch_optional_txn(
        &self,
        txn: &mut Txn<'_>,
        sql: &str,
        binds: &[Bind],
    ) -> Result<Option<sqlx::any::AnyRow>> {
        let normalized = self.normalize(sql);
        let query = Self::bind_query(sqlx::query(&normalized), binds);
        Ok(query.fetch_optional(&mut **txn).await?)
    }
}

/// `max(current id in table, 0) + 1`, computed and held inside the caller's
/// transaction so concurrent allocations against the same table serialize.
pub async fn next_id(txn: &mut Txn<'_>, table: &str, id_column: &str) -> Result<i64> {
    let sql = format!("SELECT MAX({id_column}) FROM {table}");
    let row: (Option<i64>,) = sqlx::query_as(&sql).fetch_one(&mut **txn).await?;
    Ok(row.0.unwrap_or(0) + 1)
}
