//! Mailbox sync orchestration: discovery, Gmail folder policy, delta
//! computation against the persisted watermark, and batched fetch+store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use mailkeep_core::{CancelToken, Email, MailboxState, SqliteStore, is_cancellation};
use mailkeep_imap::{
    ImapClient, Message, SelectedMailbox, is_gmail_all_mail, parse_envelope_date,
};

/// Messages fetched and persisted per transaction. Small on purpose:
/// each message can be multi-MB and progress stays observable.
pub const BATCH_SIZE: usize = 5;

/// Gmail section of the configuration file. The boolean options are
/// tri-valued so an absent key can keep defaulting to true without
/// breaking users who set it explicitly.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailConfig {
    pub enabled: Option<bool>,
    pub skip_all_mail: Option<bool>,
    pub fetch_labels: Option<bool>,
    #[serde(default)]
    pub exclude_folders: Vec<String>,
    #[serde(default)]
    pub include_folders: Vec<String>,
}

impl GmailConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn should_skip_all_mail(&self) -> bool {
        self.skip_all_mail.unwrap_or(true)
    }

    pub fn should_fetch_labels(&self) -> bool {
        self.fetch_labels.unwrap_or(true)
    }
}

/// Pure per-mailbox skip policy. Only effective when the configuration
/// enables Gmail handling and the server actually is Gmail.
pub struct GmailFilter {
    config: GmailConfig,
    enabled: bool,
}

impl GmailFilter {
    pub fn new(config: GmailConfig, is_gmail: bool) -> Self {
        let enabled = config.is_enabled() && is_gmail;
        Self { config, enabled }
    }

    /// Evaluation order: include list overrides everything, then the
    /// All Mail rule, then the exclude list.
    pub fn should_skip(&self, mailbox: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.config.include_folders.is_empty() {
            return !matches_any_pattern(mailbox, &self.config.include_folders);
        }
        if self.config.should_skip_all_mail() && is_gmail_all_mail(mailbox) {
            return true;
        }
        if !self.config.exclude_folders.is_empty()
            && matches_any_pattern(mailbox, &self.config.exclude_folders)
        {
            return true;
        }
        false
    }

    pub fn filter_mailboxes(&self, mailboxes: Vec<String>) -> Vec<String> {
        if !self.enabled {
            return mailboxes;
        }
        mailboxes
            .into_iter()
            .filter(|mailbox| !self.should_skip(mailbox))
            .collect()
    }
}

fn matches_any_pattern(mailbox: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| matches_pattern(mailbox, pattern))
}

/// Exact match, or a single-`*` glob where the input must start with
/// the part before the star and end with the part after it. No `?`,
/// no escaping; IMAP folder names are full of brackets.
pub fn matches_pattern(mailbox: &str, pattern: &str) -> bool {
    if mailbox == pattern {
        return true;
    }
    match pattern.split_once('*') {
        Some((prefix, suffix)) => mailbox.starts_with(prefix) && mailbox.ends_with(suffix),
        None => false,
    }
}

/// If a folder named exactly `INBOX` exists anywhere in the list, move
/// it to the front; the relative order of the rest is preserved.
pub fn prioritize_inbox(mut mailboxes: Vec<String>) -> Vec<String> {
    let Some(index) = mailboxes.iter().position(|mailbox| mailbox == "INBOX") else {
        return mailboxes;
    };
    if index > 0 {
        let inbox = mailboxes.remove(index);
        mailboxes.insert(0, inbox);
    }
    mailboxes
}

/// The slice of the IMAP client the syncer drives. Lets tests script a
/// server without a socket.
pub trait MailSource {
    fn list_mailboxes(&mut self, cancel: &CancelToken) -> Result<Vec<String>>;
    fn select_mailbox(&mut self, cancel: &CancelToken, mailbox: &str) -> Result<SelectedMailbox>;
    fn uid_search_all(&mut self, cancel: &CancelToken) -> Result<Vec<u32>>;
    fn fetch_messages(&mut self, cancel: &CancelToken, uids: &[u32]) -> Result<Vec<Message>>;
    fn set_fetch_gmail_labels(&mut self, enabled: bool);
}

impl MailSource for ImapClient {
    fn list_mailboxes(&mut self, cancel: &CancelToken) -> Result<Vec<String>> {
        ImapClient::list_mailboxes(self, cancel)
    }

    fn select_mailbox(&mut self, cancel: &CancelToken, mailbox: &str) -> Result<SelectedMailbox> {
        ImapClient::select_mailbox(self, cancel, mailbox)
    }

    fn uid_search_all(&mut self, cancel: &CancelToken) -> Result<Vec<u32>> {
        ImapClient::uid_search_all(self, cancel)
    }

    fn fetch_messages(&mut self, cancel: &CancelToken, uids: &[u32]) -> Result<Vec<Message>> {
        ImapClient::fetch_messages(self, cancel, uids)
    }

    fn set_fetch_gmail_labels(&mut self, enabled: bool) {
        ImapClient::set_fetch_gmail_labels(self, enabled)
    }
}

/// Narrow seam for progress rendering; the terminal implementation
/// lives in the binary.
pub trait ProgressSink {
    fn start(&mut self, mailbox: &str, total: usize);
    fn inc(&mut self, count: usize);
    fn finish(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub total_messages: usize,
    pub new_messages: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub processed_mailboxes: usize,
    pub total_messages: usize,
    pub new_messages: usize,
}

/// Drives the per-mailbox state machine. The client is blocking; the
/// store is async, bridged through the runtime handle the way the rest
/// of the workspace does it.
pub struct Syncer<C> {
    client: C,
    store: SqliteStore,
    runtime: Handle,
    progress: Option<Box<dyn ProgressSink>>,
    gmail_filter: Option<GmailFilter>,
}

impl<C: MailSource> Syncer<C> {
    pub fn new(client: C, store: SqliteStore, runtime: Handle) -> Self {
        Self {
            client,
            store,
            runtime,
            progress: None,
            gmail_filter: None,
        }
    }

    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_gmail_config(mut self, config: GmailConfig, is_gmail: bool) -> Self {
        if config.is_enabled() && config.should_fetch_labels() && is_gmail {
            self.client.set_fetch_gmail_labels(true);
        }
        self.gmail_filter = Some(GmailFilter::new(config, is_gmail));
        self
    }

    pub fn into_client(self) -> C {
        self.client
    }

    /// Discovers mailboxes, applies the Gmail policy, syncs each one.
    /// Per-mailbox failures are logged and skipped; cancellation aborts
    /// the whole run.
    pub fn sync_all(&mut self, cancel: &CancelToken) -> Result<SyncReport> {
        let mut mailboxes = self
            .client
            .list_mailboxes(cancel)
            .context("failed to list mailboxes")?;

        if let Some(filter) = &self.gmail_filter {
            let before = mailboxes.len();
            mailboxes = filter.filter_mailboxes(mailboxes);
            let skipped = before - mailboxes.len();
            if skipped > 0 {
                info!(skipped, "gmail filter skipped mailboxes");
            }
        }

        let mailboxes = prioritize_inbox(mailboxes);
        info!(count = mailboxes.len(), "found mailboxes to sync");

        let mut report = SyncReport::default();
        for mailbox in &mailboxes {
            cancel.check()?;

            match self.sync_mailbox(cancel, mailbox) {
                Ok(stats) => {
                    report.processed_mailboxes += 1;
                    report.total_messages += stats.total_messages;
                    report.new_messages += stats.new_messages;
                }
                Err(err) if is_cancellation(&err) => return Err(err),
                Err(err) => {
                    error!(mailbox = %mailbox, error = %err, "failed to sync mailbox");
                }
            }
        }

        info!(
            mailboxes = report.processed_mailboxes,
            total = report.total_messages,
            new = report.new_messages,
            "sync completed"
        );
        Ok(report)
    }

    pub fn sync_mailbox(&mut self, cancel: &CancelToken, mailbox: &str) -> Result<MailboxStats> {
        let selected = self.client.select_mailbox(cancel, mailbox)?;

        let mut state = self
            .runtime
            .block_on(self.store.get_mailbox_state(mailbox))
            .context("failed to load mailbox state")?;

        if let Some(existing) = &state {
            if existing.uid_validity != selected.uid_validity {
                warn!(mailbox = %mailbox, "UIDVALIDITY changed, performing full resync");
                state = None;
            }
        }
        let start_uid = state
            .map(|state| state.last_uid.saturating_add(1))
            .unwrap_or(1);

        if selected.exists == 0 {
            info!(mailbox = %mailbox, "mailbox is empty");
            self.save_state(mailbox, selected.uid_validity, 0)?;
            return Ok(MailboxStats::default());
        }

        let uids = self.client.uid_search_all(cancel)?;
        if uids.is_empty() {
            info!(mailbox = %mailbox, "mailbox is empty");
            self.save_state(mailbox, selected.uid_validity, 0)?;
            return Ok(MailboxStats::default());
        }

        let to_sync: Vec<u32> = uids.iter().copied().filter(|&uid| uid >= start_uid).collect();
        if to_sync.is_empty() {
            info!(mailbox = %mailbox, total = uids.len(), "no new messages");
            return Ok(MailboxStats {
                total_messages: uids.len(),
                new_messages: 0,
            });
        }

        info!(mailbox = %mailbox, count = to_sync.len(), "syncing new messages");
        if let Some(progress) = self.progress.as_mut() {
            progress.start(mailbox, to_sync.len());
        }

        for chunk in to_sync.chunks(BATCH_SIZE) {
            if let Err(err) = self.sync_batch(cancel, mailbox, chunk) {
                if let Some(progress) = self.progress.as_mut() {
                    progress.finish();
                }
                return Err(err);
            }
        }

        if let Some(progress) = self.progress.as_mut() {
            progress.finish();
        }

        // The watermark only advances once every batch has landed, so
        // an aborted run retries the unfinished UIDs next time.
        let last_uid = to_sync[to_sync.len() - 1];
        self.save_state(mailbox, selected.uid_validity, last_uid)?;

        Ok(MailboxStats {
            total_messages: uids.len(),
            new_messages: to_sync.len(),
        })
    }

    fn sync_batch(&mut self, cancel: &CancelToken, mailbox: &str, uids: &[u32]) -> Result<()> {
        cancel.check()?;
        let messages = self.client.fetch_messages(cancel, uids)?;
        cancel.check()?;

        let synced = Utc::now();
        let emails: Vec<Email> = messages
            .into_iter()
            .map(|message| convert_message(mailbox, message, synced))
            .collect();

        self.runtime
            .block_on(self.store.save_email_batch(&emails))
            .context("failed to save emails")?;

        if let Some(progress) = self.progress.as_mut() {
            progress.inc(emails.len());
        }
        Ok(())
    }

    fn save_state(&self, mailbox: &str, uid_validity: u32, last_uid: u32) -> Result<()> {
        let state = MailboxState {
            name: mailbox.to_string(),
            uid_validity,
            last_uid,
            last_sync: Utc::now(),
        };
        self.runtime
            .block_on(self.store.save_mailbox_state(&state))
            .context("failed to save mailbox state")
    }
}

fn convert_message(mailbox: &str, message: Message, synced: DateTime<Utc>) -> Email {
    let date = parse_envelope_date(message.envelope.as_ref());
    let (subject, from, to) = match &message.envelope {
        Some(envelope) => (
            envelope.subject.clone().unwrap_or_default(),
            envelope
                .from
                .first()
                .map(|address| format!("{}@{}", address.mailbox, address.host))
                .unwrap_or_default(),
            envelope
                .to
                .iter()
                .map(|address| format!("{}@{}", address.mailbox, address.host))
                .collect(),
        ),
        None => (String::new(), String::new(), Vec::new()),
    };

    Email {
        uid: message.uid,
        mailbox: mailbox.to_string(),
        subject,
        from,
        to,
        date,
        size: message.size,
        flags: message.flags,
        gmail_labels: message.gmail_labels,
        body: message.body,
        headers: message.headers,
        raw_message: message.raw_message,
        synced,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use tokio::runtime::Runtime;

    use mailkeep_imap::{Envelope, EnvelopeAddress};

    use super::*;

    #[derive(Clone, Default)]
    struct FakeMailbox {
        uid_validity: u32,
        uids: Vec<u32>,
    }

    /// Scripted server: shared interior so tests can mutate it between
    /// runs and inspect the calls afterwards.
    #[derive(Clone, Default)]
    struct FakeSource {
        inner: Arc<Mutex<FakeState>>,
        labels_enabled: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeState {
        mailboxes: Vec<String>,
        boxes: HashMap<String, FakeMailbox>,
        selected: Option<String>,
        failing_selects: Vec<String>,
        fetch_calls: Vec<Vec<u32>>,
        cancel_after_fetches: Option<usize>,
    }

    impl FakeSource {
        fn new(boxes: &[(&str, u32, &[u32])]) -> Self {
            let source = Self::default();
            {
                let mut state = source.inner.lock().unwrap();
                for (name, uid_validity, uids) in boxes {
                    state.mailboxes.push(name.to_string());
                    state.boxes.insert(
                        name.to_string(),
                        FakeMailbox {
                            uid_validity: *uid_validity,
                            uids: uids.to_vec(),
                        },
                    );
                }
            }
            source
        }

        fn set_uids(&self, mailbox: &str, uid_validity: u32, uids: &[u32]) {
            let mut state = self.inner.lock().unwrap();
            state.boxes.insert(
                mailbox.to_string(),
                FakeMailbox {
                    uid_validity,
                    uids: uids.to_vec(),
                },
            );
        }

        fn fail_select(&self, mailbox: &str) {
            self.inner
                .lock()
                .unwrap()
                .failing_selects
                .push(mailbox.to_string());
        }

        fn fetch_calls(&self) -> Vec<Vec<u32>> {
            self.inner.lock().unwrap().fetch_calls.clone()
        }

        /// Simulates a signal arriving while the nth fetch is on the wire.
        fn cancel_after_fetches(&self, count: usize) {
            self.inner.lock().unwrap().cancel_after_fetches = Some(count);
        }
    }

    impl MailSource for FakeSource {
        fn list_mailboxes(&mut self, _cancel: &CancelToken) -> Result<Vec<String>> {
            Ok(self.inner.lock().unwrap().mailboxes.clone())
        }

        fn select_mailbox(
            &mut self,
            _cancel: &CancelToken,
            mailbox: &str,
        ) -> Result<SelectedMailbox> {
            let mut state = self.inner.lock().unwrap();
            if state.failing_selects.iter().any(|name| name == mailbox) {
                return Err(anyhow!("SELECT failed for {mailbox}"));
            }
            let fake = state
                .boxes
                .get(mailbox)
                .cloned()
                .ok_or_else(|| anyhow!("no such mailbox {mailbox}"))?;
            state.selected = Some(mailbox.to_string());
            Ok(SelectedMailbox {
                uid_validity: fake.uid_validity,
                exists: fake.uids.len() as u32,
            })
        }

        fn uid_search_all(&mut self, _cancel: &CancelToken) -> Result<Vec<u32>> {
            let state = self.inner.lock().unwrap();
            let selected = state
                .selected
                .as_ref()
                .ok_or_else(|| anyhow!("no mailbox selected"))?;
            Ok(state.boxes[selected].uids.clone())
        }

        fn fetch_messages(&mut self, cancel: &CancelToken, uids: &[u32]) -> Result<Vec<Message>> {
            let mut state = self.inner.lock().unwrap();
            state.fetch_calls.push(uids.to_vec());
            if state.cancel_after_fetches == Some(state.fetch_calls.len()) {
                cancel.cancel();
            }
            Ok(uids.iter().map(|&uid| fake_message(uid)).collect())
        }

        fn set_fetch_gmail_labels(&mut self, enabled: bool) {
            self.labels_enabled.store(enabled, Ordering::SeqCst);
        }
    }

    fn fake_message(uid: u32) -> Message {
        Message {
            uid,
            flags: vec!["\\Seen".to_string()],
            size: 512 + uid,
            envelope: Some(Envelope {
                subject: Some(format!("message {uid}")),
                date: DateTime::from_timestamp(1_700_000_000 + uid as i64, 0),
                from: vec![EnvelopeAddress {
                    mailbox: "sender".to_string(),
                    host: "example.com".to_string(),
                }],
                to: vec![EnvelopeAddress {
                    mailbox: "me".to_string(),
                    host: "example.com".to_string(),
                }],
            }),
            body: format!("body {uid}").into_bytes(),
            headers: format!("Subject: message {uid}\r\n").into_bytes(),
            raw_message: format!("body {uid}").into_bytes(),
            gmail_labels: Vec::new(),
        }
    }

    fn harness() -> (Runtime, SqliteStore) {
        let runtime = Runtime::new().unwrap();
        let store = runtime
            .block_on(SqliteStore::open(":memory:", false))
            .unwrap();
        (runtime, store)
    }

    fn syncer(source: FakeSource, runtime: &Runtime, store: &SqliteStore) -> Syncer<FakeSource> {
        Syncer::new(source, store.clone(), runtime.handle().clone())
    }

    #[test]
    fn empty_mailbox_records_state_with_zero_watermark() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[])]);
        let mut syncer = syncer(source, &runtime, &store);

        let stats = syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();
        assert_eq!(stats, MailboxStats::default());

        let state = runtime
            .block_on(store.get_mailbox_state("INBOX"))
            .unwrap()
            .unwrap();
        assert_eq!(state.uid_validity, 10);
        assert_eq!(state.last_uid, 0);
    }

    #[test]
    fn first_sync_persists_all_messages_in_one_batch() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[1, 2, 3])]);
        let mut syncer = syncer(source.clone(), &runtime, &store);

        let stats = syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.new_messages, 3);
        assert_eq!(source.fetch_calls(), vec![vec![1, 2, 3]]);

        assert_eq!(runtime.block_on(store.count_messages("INBOX")).unwrap(), 3);
        let state = runtime
            .block_on(store.get_mailbox_state("INBOX"))
            .unwrap()
            .unwrap();
        assert_eq!(state.last_uid, 3);

        let email = runtime
            .block_on(store.get_email("INBOX", 2))
            .unwrap()
            .unwrap();
        assert_eq!(email.subject, "message 2");
        assert_eq!(email.from, "sender@example.com");
        assert_eq!(email.to, vec!["me@example.com"]);
        assert_eq!(email.body, b"body 2");
    }

    #[test]
    fn incremental_sync_fetches_only_new_uids() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[1, 2, 3])]);
        let mut syncer = syncer(source.clone(), &runtime, &store);
        syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();

        source.set_uids("INBOX", 10, &[1, 2, 3, 4, 5, 6, 7]);
        let stats = syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();

        assert_eq!(stats.total_messages, 7);
        assert_eq!(stats.new_messages, 4);
        assert_eq!(
            source.fetch_calls(),
            vec![vec![1, 2, 3], vec![4, 5, 6, 7]],
            "second run must only fetch the delta"
        );

        let state = runtime
            .block_on(store.get_mailbox_state("INBOX"))
            .unwrap()
            .unwrap();
        assert_eq!(state.last_uid, 7);
    }

    #[test]
    fn resync_without_changes_is_idempotent() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[1, 2, 3])]);
        let mut syncer = syncer(source.clone(), &runtime, &store);

        syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();
        let before = runtime
            .block_on(store.get_mailbox_state("INBOX"))
            .unwrap()
            .unwrap();

        let stats = syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();
        assert_eq!(stats.new_messages, 0);
        assert_eq!(source.fetch_calls().len(), 1, "no refetch on second run");

        let after = runtime
            .block_on(store.get_mailbox_state("INBOX"))
            .unwrap()
            .unwrap();
        assert_eq!(after.last_uid, before.last_uid);
        assert_eq!(runtime.block_on(store.count_messages("INBOX")).unwrap(), 3);
    }

    #[test]
    fn uidvalidity_change_triggers_full_resync() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[1, 2, 3])]);
        let mut syncer = syncer(source.clone(), &runtime, &store);
        syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();

        source.set_uids("INBOX", 11, &[1, 2]);
        let stats = syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();

        assert_eq!(stats.new_messages, 2);
        assert_eq!(
            source.fetch_calls(),
            vec![vec![1, 2, 3], vec![1, 2]],
            "reset must restart from UID 1"
        );

        let state = runtime
            .block_on(store.get_mailbox_state("INBOX"))
            .unwrap()
            .unwrap();
        assert_eq!(state.uid_validity, 11);
        assert_eq!(state.last_uid, 2);
    }

    #[test]
    fn large_mailboxes_are_fetched_in_batches_of_five() {
        let (runtime, store) = harness();
        let uids: Vec<u32> = (1..=12).collect();
        let source = FakeSource::new(&[("INBOX", 10, &uids)]);
        let mut syncer = syncer(source.clone(), &runtime, &store);

        syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();

        let sizes: Vec<usize> = source.fetch_calls().iter().map(|call| call.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(runtime.block_on(store.count_messages("INBOX")).unwrap(), 12);
    }

    #[test]
    fn sync_all_isolates_per_mailbox_failures() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("Broken", 1, &[1]), ("INBOX", 10, &[1, 2])]);
        source.fail_select("Broken");
        let mut syncer = syncer(source, &runtime, &store);

        let report = syncer.sync_all(&CancelToken::new()).unwrap();
        assert_eq!(report.processed_mailboxes, 1);
        assert_eq!(report.new_messages, 2);
        assert_eq!(runtime.block_on(store.count_messages("INBOX")).unwrap(), 2);
    }

    #[test]
    fn sync_all_aborts_on_cancellation() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[1, 2])]);
        let mut syncer = syncer(source, &runtime, &store);

        let cancel = CancelToken::new();
        cancel.cancel();

        let err = syncer.sync_all(&cancel).unwrap_err();
        assert!(is_cancellation(&err));
    }

    #[test]
    fn cancellation_mid_batch_keeps_earlier_batches_and_watermark() {
        let (runtime, store) = harness();
        let uids: Vec<u32> = (1..=12).collect();
        let source = FakeSource::new(&[("INBOX", 10, &uids)]);
        source.cancel_after_fetches(2);
        let mut syncer = syncer(source, &runtime, &store);

        let cancel = CancelToken::new();
        let err = syncer.sync_mailbox(&cancel, "INBOX").unwrap_err();
        assert!(is_cancellation(&err));

        // First batch is durable, the in-flight one is not, and the
        // watermark did not advance so the next run retries from UID 1.
        assert_eq!(runtime.block_on(store.count_messages("INBOX")).unwrap(), 5);
        assert!(
            runtime
                .block_on(store.get_mailbox_state("INBOX"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn resumed_run_reprocesses_unfinished_uids() {
        let (runtime, store) = harness();
        let uids: Vec<u32> = (1..=12).collect();
        let source = FakeSource::new(&[("INBOX", 10, &uids)]);
        source.cancel_after_fetches(2);
        let mut syncer = syncer(source.clone(), &runtime, &store);

        let cancel = CancelToken::new();
        syncer.sync_mailbox(&cancel, "INBOX").unwrap_err();

        let stats = syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();
        assert_eq!(stats.new_messages, 12, "no watermark means a full pass");
        assert_eq!(runtime.block_on(store.count_messages("INBOX")).unwrap(), 12);
        assert_eq!(
            runtime
                .block_on(store.get_mailbox_state("INBOX"))
                .unwrap()
                .unwrap()
                .last_uid,
            12
        );
    }

    #[test]
    fn watermark_is_monotonic_across_growing_runs() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[1])]);
        let mut syncer = syncer(source.clone(), &runtime, &store);

        let mut previous = 0;
        for upper in [1u32, 4, 4, 9, 15] {
            let uids: Vec<u32> = (1..=upper).collect();
            source.set_uids("INBOX", 10, &uids);
            syncer.sync_mailbox(&CancelToken::new(), "INBOX").unwrap();

            let state = runtime
                .block_on(store.get_mailbox_state("INBOX"))
                .unwrap()
                .unwrap();
            assert!(state.last_uid >= previous, "watermark must never move back");
            previous = state.last_uid;
        }
        assert_eq!(previous, 15);
    }

    #[test]
    fn gmail_label_fetch_enabled_with_config() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[])]);
        let labels_enabled = source.labels_enabled.clone();

        let _syncer = syncer(source, &runtime, &store)
            .with_gmail_config(GmailConfig::default(), true);
        assert!(labels_enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn gmail_label_fetch_stays_off_for_non_gmail() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[("INBOX", 10, &[])]);
        let labels_enabled = source.labels_enabled.clone();

        let _syncer = syncer(source, &runtime, &store)
            .with_gmail_config(GmailConfig::default(), false);
        assert!(!labels_enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn default_gmail_filter_drops_all_mail_only() {
        let (runtime, store) = harness();
        let source = FakeSource::new(&[
            ("INBOX", 1, &[]),
            ("[Gmail]/All Mail", 1, &[]),
            ("[Gmail]/Sent Mail", 1, &[]),
            ("[Gmail]/Spam", 1, &[]),
        ]);
        let mut syncer =
            syncer(source, &runtime, &store).with_gmail_config(GmailConfig::default(), true);

        syncer.sync_all(&CancelToken::new()).unwrap();

        let synced = runtime.block_on(store.list_mailboxes()).unwrap();
        assert_eq!(synced, vec!["INBOX", "[Gmail]/Sent Mail", "[Gmail]/Spam"]);
    }

    #[test]
    fn filter_is_a_subsequence_of_its_input() {
        let config = GmailConfig {
            exclude_folders: vec!["[Gmail]/*".to_string()],
            ..GmailConfig::default()
        };
        let filter = GmailFilter::new(config, true);

        let input = vec![
            "Archive".to_string(),
            "[Gmail]/Spam".to_string(),
            "INBOX".to_string(),
            "[Gmail]/Trash".to_string(),
        ];
        let output = filter.filter_mailboxes(input.clone());
        assert_eq!(output, vec!["Archive", "INBOX"]);

        for mailbox in &input {
            assert_eq!(
                filter.should_skip(mailbox),
                !output.contains(mailbox),
                "membership must match should_skip for {mailbox}"
            );
        }
    }

    #[test]
    fn include_list_overrides_all_other_rules() {
        let config = GmailConfig {
            include_folders: vec!["INBOX".to_string(), "[Gmail]/All Mail".to_string()],
            exclude_folders: vec!["INBOX".to_string()],
            ..GmailConfig::default()
        };
        let filter = GmailFilter::new(config, true);

        assert!(!filter.should_skip("INBOX"));
        assert!(!filter.should_skip("[Gmail]/All Mail"));
        assert!(filter.should_skip("[Gmail]/Sent Mail"));
    }

    #[test]
    fn filter_disabled_off_gmail_servers() {
        let filter = GmailFilter::new(GmailConfig::default(), false);
        assert!(!filter.should_skip("[Gmail]/All Mail"));

        let disabled = GmailFilter::new(
            GmailConfig {
                enabled: Some(false),
                ..GmailConfig::default()
            },
            true,
        );
        assert!(!disabled.should_skip("[Gmail]/All Mail"));
    }

    #[test]
    fn all_mail_skip_can_be_turned_off() {
        let config = GmailConfig {
            skip_all_mail: Some(false),
            ..GmailConfig::default()
        };
        let filter = GmailFilter::new(config, true);
        assert!(!filter.should_skip("[Gmail]/All Mail"));
    }

    #[test]
    fn pattern_matching_supports_single_wildcard() {
        assert!(matches_pattern("[Gmail]/Spam", "[Gmail]/*"));
        assert!(!matches_pattern("INBOX", "[Gmail]/*"));
        assert!(matches_pattern("[Gmail]/Spam", "*Spam"));
        assert!(matches_pattern("INBOX", "INBOX"));
        assert!(!matches_pattern("INBOX2", "INBOX"));
        assert!(matches_pattern("Lists/rust/announce", "Lists/*announce"));
        assert!(!matches_pattern("Lists/rust", "Lists/*announce"));
    }

    #[test]
    fn inbox_moves_to_front_preserving_order() {
        let list = |names: &[&str]| -> Vec<String> {
            names.iter().map(|name| name.to_string()).collect()
        };

        assert_eq!(
            prioritize_inbox(list(&["Archive", "INBOX", "Sent"])),
            list(&["INBOX", "Archive", "Sent"])
        );
        assert_eq!(
            prioritize_inbox(list(&["INBOX", "Archive"])),
            list(&["INBOX", "Archive"])
        );
        assert_eq!(
            prioritize_inbox(list(&["Archive", "Sent"])),
            list(&["Archive", "Sent"])
        );
        assert!(prioritize_inbox(Vec::new()).is_empty());
    }

    #[test]
    fn conversion_tolerates_missing_envelope() {
        let message = Message {
            uid: 9,
            flags: vec!["\\Seen".to_string()],
            size: 100,
            envelope: None,
            body: b"raw".to_vec(),
            headers: Vec::new(),
            raw_message: b"raw".to_vec(),
            gmail_labels: Vec::new(),
        };

        let before = Utc::now();
        let email = convert_message("INBOX", message, before);
        assert_eq!(email.subject, "");
        assert_eq!(email.from, "");
        assert!(email.to.is_empty());
        assert!(email.date >= before, "missing envelope date falls back to now");
    }
}
