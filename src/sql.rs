// src/sql.rs
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{SatieError, SatieResult};

/// Counting semaphore over Mutex + Condvar (std has no counting semaphore).
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = lock(&self.count);
        while *count == 0 {
            count = match self.cond.wait(count) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
        }
        *count -= 1;
    }

    fn release(&self) {
        *lock(&self.count) += 1;
        self.cond.notify_one();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    sem: Semaphore,
    size: usize,
}

/// Fixed-size connection pool: `get` waits on the semaphore, then pops under
/// the mutex; returning pushes and posts. At every instant
/// `leased + idle == size`.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Pool<T> {
    pub fn new(conns: Vec<T>) -> Self {
        let size = conns.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(conns),
                sem: Semaphore::new(size),
                size,
            }),
        }
    }

    /// Borrow a connection, blocking while the pool is exhausted. The lease
    /// returns it on drop — on every exit path, including unwinding.
    pub fn get(&self) -> Lease<T> {
        self.inner.sem.acquire();
        let conn = lock(&self.inner.idle)
            .pop()
            .expect("semaphore admitted a borrower with no idle connection");
        Lease {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.inner.idle).len()
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Scoped lease on a pooled connection.
pub struct Lease<T> {
    conn: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for Lease<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.conn.as_ref().expect("lease already returned")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("lease already returned")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            lock(&self.pool.idle).push(conn);
            self.pool.sem.release();
        }
    }
}

/// Connection parameters for the SQL backend.
#[derive(Debug, Clone)]
pub struct SqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Username/password verification service. The reactor takes this as an
/// explicitly initialised dependency so tests can substitute an in-memory
/// store for the SQL-backed one.
pub trait UserStore: Send + Sync {
    /// `is_login` true checks credentials; false registers a new user.
    /// Returns success; any backend failure reads as false.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool;
}

/// Postgres-backed user store over the fixed-size pool.
pub struct PgUserStore {
    pool: Pool<postgres::Client>,
}

impl PgUserStore {
    /// Eagerly open `size` connections.
    pub fn connect(cfg: &SqlConfig, size: usize) -> SatieResult<Self> {
        if size == 0 {
            return Err(SatieError::Sql("pool size must be positive".into()));
        }
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let client = postgres::Config::new()
                .host(&cfg.host)
                .port(cfg.port)
                .user(&cfg.user)
                .password(&cfg.password)
                .dbname(&cfg.database)
                .connect(postgres::NoTls)?;
            conns.push(client);
        }
        log::info!("SQL pool ready: {} connections to {}:{}", size, cfg.host, cfg.port);
        Ok(Self {
            pool: Pool::new(conns),
        })
    }
}

impl UserStore for PgUserStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let mut conn = self.pool.get();
        if is_login {
            match conn.query_opt(
                r#"SELECT password FROM "user" WHERE username = $1 LIMIT 1"#,
                &[&username],
            ) {
                Ok(Some(row)) => match row.try_get::<_, String>(0) {
                    // Plaintext comparison, matching the source contract.
                    Ok(stored) => stored == password,
                    Err(e) => {
                        log::warn!("login row decode failed: {}", e);
                        false
                    }
                },
                Ok(None) => false,
                Err(e) => {
                    log::warn!("login query failed: {}", e);
                    false
                }
            }
        } else {
            match conn.query_opt(
                r#"SELECT username FROM "user" WHERE username = $1 LIMIT 1"#,
                &[&username],
            ) {
                Ok(Some(_)) => false,
                Ok(None) => match conn.execute(
                    r#"INSERT INTO "user"(username, password) VALUES($1, $2)"#,
                    &[&username, &password],
                ) {
                    Ok(_) => true,
                    Err(e) => {
                        log::warn!("register insert failed: {}", e);
                        false
                    }
                },
                Err(e) => {
                    log::warn!("register query failed: {}", e);
                    false
                }
            }
        }
    }
}

/// In-memory user store for tests and SQL-less deployments.
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_users(users: &[(&str, &str)]) -> Self {
        let store = Self::new();
        {
            let mut map = lock(&store.users);
            for (u, p) in users {
                map.insert(u.to_string(), p.to_string());
            }
        }
        store
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemoryUserStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let mut users = lock(&self.users);
        if is_login {
            users.get(username).map(|p| p == password).unwrap_or(false)
        } else if users.contains_key(username) {
            false
        } else {
            users.insert(username.to_string(), password.to_string());
            true
        }
    }
}
