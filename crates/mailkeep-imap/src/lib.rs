//! IMAP client wrapper: TLS dialing, login, reconnect with backoff, and
//! retry-decorated mailbox operations over the `imap` crate.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use imap::types::{Fetch, Flag, Name};
use imap::{ClientBuilder, Connection, ConnectionMode, Session, TlsKind};
use imap_proto::{Address, NameAttribute};
use tracing::{debug, info, warn};

use mailkeep_core::CancelToken;

/// Retries per operation; reconnect runs its own loop with the same cap.
const MAX_RETRIES: usize = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Header section fills `headers`, the bare BODY.PEEK[] fills both
/// `body` and `raw_message`.
const FETCH_ITEMS: &str = "(FLAGS ENVELOPE RFC822.SIZE UID BODY.PEEK[HEADER] BODY.PEEK[])";

const STANDARD_FLAGS: [&str; 6] = [
    "\\Seen",
    "\\Answered",
    "\\Flagged",
    "\\Deleted",
    "\\Draft",
    "\\Recent",
];

const NETWORK_ERROR_PATTERNS: [&str; 8] = [
    "connection reset",
    "broken pipe",
    "connection refused",
    "no route to host",
    "network is unreachable",
    "i/o timeout",
    "connection timed out",
    "unexpected eof",
];

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedMailbox {
    pub uid_validity: u32,
    pub exists: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeAddress {
    pub mailbox: String,
    pub host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub from: Vec<EnvelopeAddress>,
    pub to: Vec<EnvelopeAddress>,
}

/// One fetched message with the raw sections the store persists.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub uid: u32,
    pub flags: Vec<String>,
    pub size: u32,
    pub envelope: Option<Envelope>,
    pub body: Vec<u8>,
    pub headers: Vec<u8>,
    pub raw_message: Vec<u8>,
    pub gmail_labels: Vec<String>,
}

/// Connection-stateful IMAP client. Not safe for concurrent use: one
/// connection, one in-flight command.
pub struct ImapClient {
    session: Option<Session<Connection>>,
    opts: ConnectOptions,
    fetch_gmail_labels: bool,
}

impl ImapClient {
    pub fn connect(opts: ConnectOptions) -> Result<Self> {
        let session = open_session(&opts)?;
        info!(host = %opts.host, port = opts.port, "connected to IMAP server");
        Ok(Self {
            session: Some(session),
            opts,
            fetch_gmail_labels: false,
        })
    }

    /// Toggles extraction of non-standard flag tokens as Gmail labels
    /// on fetched messages.
    pub fn set_fetch_gmail_labels(&mut self, enabled: bool) {
        self.fetch_gmail_labels = enabled;
    }

    /// Best-effort LOGOUT; the socket closes either way.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.logout() {
                debug!(error = %err, "logout failed");
            }
        }
    }

    /// Lists selectable folders, sorted. Folders carrying `\Noselect`
    /// (e.g. the `[Gmail]` namespace container) are dropped.
    pub fn list_mailboxes(&mut self, cancel: &CancelToken) -> Result<Vec<String>> {
        let mut names = self.with_retry(cancel, |session| {
            let list = session.list(None, Some("*"))?;
            let mut names = Vec::new();
            for name in list.iter() {
                if is_non_selectable(name) {
                    debug!(mailbox = name.name(), "skipping non-selectable mailbox");
                    continue;
                }
                names.push(name.name().to_string());
            }
            Ok(names)
        })?;
        names.sort();
        Ok(names)
    }

    pub fn select_mailbox(&mut self, cancel: &CancelToken, mailbox: &str) -> Result<SelectedMailbox> {
        let selected = self
            .with_retry(cancel, |session| session.select(mailbox))
            .with_context(|| format!("failed to select mailbox {mailbox}"))?;
        let uid_validity = selected
            .uid_validity
            .with_context(|| format!("server reported no UIDVALIDITY for {mailbox}"))?;
        Ok(SelectedMailbox {
            uid_validity,
            exists: selected.exists,
        })
    }

    /// All UIDs in the selected mailbox, ascending. The library hands
    /// back an unordered set, so the sort is mandatory here.
    pub fn uid_search_all(&mut self, cancel: &CancelToken) -> Result<Vec<u32>> {
        let uids = self
            .with_retry(cancel, |session| session.uid_search("ALL"))
            .context("failed to search messages")?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    pub fn fetch_messages(&mut self, cancel: &CancelToken, uids: &[u32]) -> Result<Vec<Message>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let uid_set = uid_set(uids);
        let fetch_labels = self.fetch_gmail_labels;
        self.with_retry(cancel, |session| {
            let fetches = session.uid_fetch(&uid_set, FETCH_ITEMS)?;
            let mut messages = Vec::new();
            for fetch in fetches.iter() {
                let Some(uid) = fetch.uid else {
                    continue;
                };
                messages.push(convert_fetch(uid, fetch, fetch_labels));
            }
            Ok(messages)
        })
        .context("failed to fetch messages")
    }

    /// Heuristic: a server is Gmail iff it lists any `[Gmail]/` or
    /// `[Google Mail]/` folder.
    pub fn is_gmail_server(&mut self, cancel: &CancelToken) -> Result<bool> {
        let mailboxes = self.list_mailboxes(cancel)?;
        Ok(mailboxes.iter().any(|name| is_gmail_folder(name)))
    }

    /// Runs `op` against the live session, reconnecting and retrying on
    /// network errors. Protocol errors surface immediately; the token
    /// is checked before every attempt.
    fn with_retry<T>(
        &mut self,
        cancel: &CancelToken,
        mut op: impl FnMut(&mut Session<Connection>) -> imap::error::Result<T>,
    ) -> Result<T> {
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            cancel.check()?;

            if attempt > 0 {
                self.reconnect(cancel)?;
            }

            let session = match self.session.as_mut() {
                Some(session) => session,
                None => bail!("not connected to IMAP server"),
            };

            match op(session) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_network_error(&err) {
                        return Err(anyhow::Error::new(err));
                    }
                    warn!(
                        attempt = attempt + 1,
                        total = MAX_RETRIES + 1,
                        error = %err,
                        "network error, reconnecting"
                    );
                    last_err = Some(err);
                }
            }
        }

        let err = last_err
            .map(anyhow::Error::new)
            .unwrap_or_else(|| anyhow!("retry loop exhausted without an attempt"));
        Err(err.context(format!("operation failed after {} attempts", MAX_RETRIES + 1)))
    }

    fn reconnect(&mut self, cancel: &CancelToken) -> Result<()> {
        self.session = None;

        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=MAX_RETRIES {
            cancel.check()?;
            info!(attempt, max = MAX_RETRIES, "attempting to reconnect");

            match open_session(&self.opts) {
                Ok(session) => {
                    self.session = Some(session);
                    info!("reconnected successfully");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "reconnection attempt failed");
                    last_err = Some(err);
                    if attempt < MAX_RETRIES {
                        debug!(backoff_secs = backoff.as_secs(), "waiting before retry");
                        if cancel.wait_timeout(backoff) {
                            return Err(mailkeep_core::Cancelled.into());
                        }
                        backoff = next_backoff(backoff);
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow!("no reconnect attempts made"));
        Err(err.context(format!("failed to reconnect after {MAX_RETRIES} attempts")))
    }
}

fn open_session(opts: &ConnectOptions) -> Result<Session<Connection>> {
    let mode = if opts.tls {
        ConnectionMode::Tls
    } else {
        ConnectionMode::Plaintext
    };

    let client = ClientBuilder::new(opts.host.as_str(), opts.port)
        .tls_kind(TlsKind::Native)
        .mode(mode)
        .connect()
        .with_context(|| format!("failed to connect to {}:{}", opts.host, opts.port))?;

    let session = client
        .login(&opts.username, &opts.password)
        .map_err(|err| err.0)
        .context("failed to login")?;

    Ok(session)
}

fn is_non_selectable(name: &Name) -> bool {
    name.attributes()
        .iter()
        .any(|attr| matches!(attr, NameAttribute::NoSelect))
}

fn convert_fetch(uid: u32, fetch: &Fetch, fetch_labels: bool) -> Message {
    let flags = flags_to_strings(fetch.flags());
    let gmail_labels = if fetch_labels {
        extract_gmail_labels(&flags)
    } else {
        Vec::new()
    };
    let body = fetch.body().unwrap_or_default().to_vec();

    Message {
        uid,
        size: fetch.size.unwrap_or(0),
        envelope: fetch.envelope().map(convert_envelope),
        headers: fetch.header().unwrap_or_default().to_vec(),
        raw_message: body.clone(),
        body,
        flags,
        gmail_labels,
    }
}

fn convert_envelope(envelope: &imap_proto::Envelope<'_>) -> Envelope {
    Envelope {
        subject: envelope
            .subject
            .as_deref()
            .map(|raw| String::from_utf8_lossy(raw).into_owned()),
        date: envelope.date.as_deref().and_then(parse_date_bytes),
        from: convert_addresses(envelope.from.as_deref()),
        to: convert_addresses(envelope.to.as_deref()),
    }
}

fn parse_date_bytes(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(raw);
    let unix = mailparse::dateparse(text.trim()).ok()?;
    DateTime::from_timestamp(unix, 0)
}

fn convert_addresses(addresses: Option<&[Address<'_>]>) -> Vec<EnvelopeAddress> {
    addresses
        .map(|addresses| addresses.iter().filter_map(convert_address).collect())
        .unwrap_or_default()
}

fn convert_address(address: &Address<'_>) -> Option<EnvelopeAddress> {
    let mailbox = address.mailbox.as_deref()?;
    let host = address.host.as_deref()?;
    Some(EnvelopeAddress {
        mailbox: String::from_utf8_lossy(mailbox).into_owned(),
        host: String::from_utf8_lossy(host).into_owned(),
    })
}

/// Envelope date when present, else the ingestion instant.
pub fn parse_envelope_date(envelope: Option<&Envelope>) -> DateTime<Utc> {
    envelope
        .and_then(|envelope| envelope.date)
        .unwrap_or_else(Utc::now)
}

pub fn flags_to_strings(flags: &[Flag<'_>]) -> Vec<String> {
    flags.iter().map(flag_to_string).collect()
}

fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        other => format!("{other:?}"),
    }
}

/// A flag is a Gmail label iff it is not a standard IMAP flag. The
/// stored label strips one leading backslash; tokens without one are
/// dropped rather than guessed at.
pub fn extract_gmail_labels(flags: &[String]) -> Vec<String> {
    let mut labels = Vec::new();
    for flag in flags {
        if is_standard_flag(flag) {
            continue;
        }
        if let Some(label) = flag.strip_prefix('\\') {
            if !label.is_empty() {
                labels.push(label.to_string());
            }
        }
    }
    labels
}

fn is_standard_flag(flag: &str) -> bool {
    STANDARD_FLAGS.contains(&flag)
}

pub fn is_gmail_folder(name: &str) -> bool {
    name.starts_with("[Gmail]/") || name.starts_with("[Google Mail]/")
}

pub fn is_gmail_all_mail(name: &str) -> bool {
    name == "[Gmail]/All Mail" || name == "[Google Mail]/All Mail"
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

fn is_network_error(err: &imap::Error) -> bool {
    match err {
        imap::Error::Io(io_err) => {
            is_network_io_kind(io_err.kind()) || matches_network_pattern(&io_err.to_string())
        }
        imap::Error::ConnectionLost => true,
        other => matches_network_pattern(&other.to_string()),
    }
}

fn is_network_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

fn matches_network_pattern(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    NETWORK_ERROR_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}
