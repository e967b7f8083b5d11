//! SQLite-backed mail store and shared sync plumbing.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;

/// A message as persisted locally: metadata plus the raw bytes fetched
/// from the server. `body` and `raw_message` hold the same bytes; the
/// raw copy is kept so callers can re-parse MIME without refetching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub uid: u32,
    pub mailbox: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    pub size: u32,
    pub flags: Vec<String>,
    pub gmail_labels: Vec<String>,
    pub body: Vec<u8>,
    pub headers: Vec<u8>,
    pub raw_message: Vec<u8>,
    pub synced: DateTime<Utc>,
}

/// Per-mailbox watermark: the highest UID durably persisted under the
/// mailbox's current UIDVALIDITY generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxState {
    pub name: String,
    pub uid_validity: u32,
    pub last_uid: u32,
    pub last_sync: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Returns true if the error chain bottoms out in a [`Cancelled`],
/// so callers can exit cleanly on a user-requested stop.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

/// Cooperative cancellation flag shared between the signal handler and
/// the sync loop. Checked at every suspension boundary; backoff sleeps
/// go through [`CancelToken::wait_timeout`] so they wake up early.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock().unwrap();
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().unwrap()
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    /// Sleeps for up to `timeout`, returning early when cancelled.
    /// Returns true if the token was cancelled during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let cancelled = self.inner.cancelled.lock().unwrap();
        let (cancelled, _) = self
            .inner
            .cond
            .wait_timeout_while(cancelled, timeout, |cancelled| !*cancelled)
            .unwrap();
        *cancelled
    }
}

/// Gzip at the default level. Empty input stays empty so blank fields
/// never carry a gzip header.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .context("failed to write gzip data")?;
    encoder.finish().context("failed to finish gzip stream")
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("failed to read gzip data")?;
    Ok(out)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS emails (
        mailbox TEXT NOT NULL,
        uid INTEGER NOT NULL,
        subject TEXT,
        from_addr TEXT,
        to_addrs TEXT,
        date INTEGER,
        size INTEGER,
        flags TEXT,
        gmail_labels TEXT,
        synced INTEGER,
        PRIMARY KEY (mailbox, uid)
    )",
    "CREATE INDEX IF NOT EXISTS idx_emails_mailbox ON emails(mailbox)",
    "CREATE INDEX IF NOT EXISTS idx_emails_synced ON emails(synced)",
    "CREATE TABLE IF NOT EXISTS email_content (
        mailbox TEXT NOT NULL,
        uid INTEGER NOT NULL,
        body BLOB,
        headers BLOB,
        raw_message BLOB,
        PRIMARY KEY (mailbox, uid),
        FOREIGN KEY (mailbox, uid) REFERENCES emails(mailbox, uid) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS mailbox_state (
        name TEXT PRIMARY KEY,
        uid_validity INTEGER NOT NULL,
        last_uid INTEGER NOT NULL,
        last_sync INTEGER NOT NULL
    )",
];

type EmailMetaRow = (
    String,
    i64,
    String,
    String,
    String,
    i64,
    i64,
    String,
    String,
    i64,
);

/// Durable store for the mail corpus. The writer path is capped at a
/// single connection so batch transactions never contend; the browse
/// server opens a separate read-only handle.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let options = if read_only {
            SqliteConnectOptions::new()
                .filename(path.as_ref())
                .read_only(true)
        } else {
            SqliteConnectOptions::new()
                .filename(path.as_ref())
                .create_if_missing(true)
                .foreign_keys(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {}", path.as_ref().display()))?;

        let store = Self { pool };

        if !read_only {
            if let Err(err) = store.init_schema().await {
                store.pool.close().await;
                return Err(err.context("failed to initialize schema"));
            }
        }

        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn save_email(&self, email: &Email) -> Result<()> {
        self.save_email_batch(std::slice::from_ref(email)).await
    }

    /// Upserts metadata and content rows for the whole batch in one
    /// transaction. A failure on any row rolls back everything.
    pub async fn save_email_batch(&self, emails: &[Email]) -> Result<()> {
        if emails.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        for email in emails {
            let to_json =
                serde_json::to_string(&email.to).context("failed to serialize to addresses")?;
            let flags_json =
                serde_json::to_string(&email.flags).context("failed to serialize flags")?;
            let labels_json = serde_json::to_string(&email.gmail_labels)
                .context("failed to serialize gmail labels")?;

            sqlx::query(
                "INSERT OR REPLACE INTO emails (
                    mailbox, uid, subject, from_addr, to_addrs, date, size, flags, gmail_labels, synced
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&email.mailbox)
            .bind(email.uid as i64)
            .bind(&email.subject)
            .bind(&email.from)
            .bind(&to_json)
            .bind(email.date.timestamp())
            .bind(email.size as i64)
            .bind(&flags_json)
            .bind(&labels_json)
            .bind(email.synced.timestamp())
            .execute(&mut *tx)
            .await
            .context("failed to insert email metadata")?;

            let body = compress(&email.body).context("failed to compress body")?;
            let headers = compress(&email.headers).context("failed to compress headers")?;
            let raw_message =
                compress(&email.raw_message).context("failed to compress raw message")?;

            sqlx::query(
                "INSERT OR REPLACE INTO email_content (
                    mailbox, uid, body, headers, raw_message
                ) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&email.mailbox)
            .bind(email.uid as i64)
            .bind(&body)
            .bind(&headers)
            .bind(&raw_message)
            .execute(&mut *tx)
            .await
            .context("failed to insert email content")?;
        }

        tx.commit().await.context("failed to commit email batch")
    }

    pub async fn get_email(&self, mailbox: &str, uid: u32) -> Result<Option<Email>> {
        type Row = (
            String,
            i64,
            String,
            String,
            String,
            i64,
            i64,
            String,
            String,
            i64,
            Option<Vec<u8>>,
            Option<Vec<u8>>,
            Option<Vec<u8>>,
        );

        let row = sqlx::query_as::<_, Row>(
            "SELECT e.mailbox, e.uid, e.subject, e.from_addr, e.to_addrs, e.date, e.size,
                    e.flags, e.gmail_labels, e.synced, c.body, c.headers, c.raw_message
             FROM emails e
             LEFT JOIN email_content c ON e.mailbox = c.mailbox AND e.uid = c.uid
             WHERE e.mailbox = ? AND e.uid = ?",
        )
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get email")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut email = email_from_meta((
            row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8, row.9,
        ))?;
        email.body = decompress(&row.10.unwrap_or_default()).context("failed to decompress body")?;
        email.headers =
            decompress(&row.11.unwrap_or_default()).context("failed to decompress headers")?;
        email.raw_message = decompress(&row.12.unwrap_or_default())
            .context("failed to decompress raw message")?;

        Ok(Some(email))
    }

    pub async fn save_mailbox_state(&self, state: &MailboxState) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO mailbox_state (name, uid_validity, last_uid, last_sync)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&state.name)
        .bind(state.uid_validity as i64)
        .bind(state.last_uid as i64)
        .bind(state.last_sync.timestamp())
        .execute(&self.pool)
        .await
        .context("failed to save mailbox state")?;
        Ok(())
    }

    pub async fn get_mailbox_state(&self, mailbox: &str) -> Result<Option<MailboxState>> {
        let row = sqlx::query_as::<_, (String, i64, i64, i64)>(
            "SELECT name, uid_validity, last_uid, last_sync FROM mailbox_state WHERE name = ?",
        )
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get mailbox state")?;

        Ok(row.map(|(name, uid_validity, last_uid, last_sync)| MailboxState {
            name,
            uid_validity: uid_validity as u32,
            last_uid: last_uid as u32,
            last_sync: timestamp(last_sync),
        }))
    }

    /// Lists known mailboxes from the state table, so folders that were
    /// never synced do not appear in the browse view.
    pub async fn list_mailboxes(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT name FROM mailbox_state ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list mailboxes")?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    pub async fn count_messages(&self, mailbox: &str) -> Result<usize> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM emails WHERE mailbox = ?")
            .bind(mailbox)
            .fetch_one(&self.pool)
            .await
            .context("failed to count messages")?;
        Ok(row.0 as usize)
    }

    /// Metadata-only page for the browse list view, newest UID first.
    pub async fn list_emails(&self, mailbox: &str, limit: usize, offset: usize) -> Result<Vec<Email>> {
        let rows = sqlx::query_as::<_, EmailMetaRow>(
            "SELECT mailbox, uid, subject, from_addr, to_addrs, date, size, flags, gmail_labels, synced
             FROM emails
             WHERE mailbox = ?
             ORDER BY uid DESC
             LIMIT ? OFFSET ?",
        )
        .bind(mailbox)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to list emails")?;

        rows.into_iter().map(email_from_meta).collect()
    }
}

fn email_from_meta(row: EmailMetaRow) -> Result<Email> {
    let (mailbox, uid, subject, from, to_json, date, size, flags_json, labels_json, synced) = row;
    Ok(Email {
        uid: uid as u32,
        mailbox,
        subject,
        from,
        to: serde_json::from_str(&to_json).context("failed to parse to addresses")?,
        date: timestamp(date),
        size: size as u32,
        flags: serde_json::from_str(&flags_json).context("failed to parse flags")?,
        gmail_labels: serde_json::from_str(&labels_json).context("failed to parse gmail labels")?,
        body: Vec::new(),
        headers: Vec::new(),
        raw_message: Vec::new(),
        synced: timestamp(synced),
    })
}

fn timestamp(unix: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(unix, 0).unwrap_or_default()
}
