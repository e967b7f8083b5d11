use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use warp::Filter;
use warp::http::StatusCode;
use warp::reply::{self, Reply, Response};

use mailkeep_core::{Email, SqliteStore};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

/// Read-only browse server over the store. Mailbox names contain `/`,
/// so every endpoint addresses them through the query string instead of
/// path segments.
pub async fn run(store: SqliteStore, addr: SocketAddr) -> Result<()> {
    info!(%addr, "browse server listening");
    let (_addr, server) = warp::serve(routes(store)).bind_with_graceful_shutdown(addr, async {
        let _ = tokio::signal::ctrl_c().await;
    });
    server.await;
    info!("browse server stopped");
    Ok(())
}

fn routes(
    store: SqliteStore,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let mailboxes = warp::path!("api" / "v1" / "mailboxes")
        .and(with_store(store.clone()))
        .and_then(list_mailboxes);
    let emails = warp::path!("api" / "v1" / "emails")
        .and(warp::query::<EmailListQuery>())
        .and(with_store(store.clone()))
        .and_then(list_emails);
    let email = warp::path!("api" / "v1" / "email")
        .and(warp::query::<EmailQuery>())
        .and(with_store(store.clone()))
        .and_then(get_email);
    let download = warp::path!("api" / "v1" / "email" / "download")
        .and(warp::query::<EmailQuery>())
        .and(with_store(store))
        .and_then(download_email);
    let index = warp::path::end().map(|| reply::html(INDEX_HTML));

    warp::get().and(mailboxes.or(emails).or(download).or(email).or(index))
}

fn with_store(
    store: SqliteStore,
) -> impl Filter<Extract = (SqliteStore,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

#[derive(Serialize)]
struct MailboxInfo {
    name: String,
    count: usize,
    last_uid: u32,
    last_sync: String,
}

#[derive(Deserialize)]
struct EmailListQuery {
    mailbox: String,
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct EmailQuery {
    mailbox: String,
    uid: u32,
}

#[derive(Serialize)]
struct EmailSummary {
    uid: u32,
    subject: String,
    from: String,
    to: Vec<String>,
    date: String,
    size: u32,
    flags: Vec<String>,
}

#[derive(Serialize)]
struct EmailListResponse {
    emails: Vec<EmailSummary>,
    page: usize,
    limit: usize,
    total: usize,
    total_pages: usize,
}

#[derive(Serialize)]
struct EmailDetail {
    #[serde(flatten)]
    summary: EmailSummary,
    gmail_labels: Vec<String>,
    synced: String,
    headers: String,
    body: String,
    body_text: String,
    body_html: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn summary(email: &Email) -> EmailSummary {
    EmailSummary {
        uid: email.uid,
        subject: email.subject.clone(),
        from: email.from.clone(),
        to: email.to.clone(),
        date: email.date.to_rfc3339(),
        size: email.size,
        flags: email.flags.clone(),
    }
}

fn error_response(message: &str, err: anyhow::Error) -> Response {
    error!(error = ?err, "{message}");
    reply::with_status(
        reply::json(&ErrorBody {
            error: message.to_string(),
        }),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
    .into_response()
}

fn not_found(message: &str) -> Response {
    reply::with_status(
        reply::json(&ErrorBody {
            error: message.to_string(),
        }),
        StatusCode::NOT_FOUND,
    )
    .into_response()
}

async fn list_mailboxes(store: SqliteStore) -> Result<Response, Infallible> {
    let result: Result<Vec<MailboxInfo>> = async {
        let names = store.list_mailboxes().await?;
        let mut mailboxes = Vec::with_capacity(names.len());
        for name in names {
            let Some(state) = store.get_mailbox_state(&name).await? else {
                continue;
            };
            let count = store.count_messages(&name).await?;
            mailboxes.push(MailboxInfo {
                name,
                count,
                last_uid: state.last_uid,
                last_sync: state.last_sync.to_rfc3339(),
            });
        }
        Ok(mailboxes)
    }
    .await;

    match result {
        Ok(mailboxes) => Ok(reply::json(&mailboxes).into_response()),
        Err(err) => Ok(error_response("failed to list mailboxes", err)),
    }
}

async fn list_emails(query: EmailListQuery, store: SqliteStore) -> Result<Response, Infallible> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * limit;

    let result: Result<EmailListResponse> = async {
        let total = store.count_messages(&query.mailbox).await?;
        let emails = store.list_emails(&query.mailbox, limit, offset).await?;
        Ok(EmailListResponse {
            emails: emails.iter().map(summary).collect(),
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        })
    }
    .await;

    match result {
        Ok(response) => Ok(reply::json(&response).into_response()),
        Err(err) => Ok(error_response("failed to list emails", err)),
    }
}

async fn get_email(query: EmailQuery, store: SqliteStore) -> Result<Response, Infallible> {
    match store.get_email(&query.mailbox, query.uid).await {
        Ok(Some(email)) => {
            let extracted = crate::mime::extract_body(&email.raw_message);
            let detail = EmailDetail {
                summary: summary(&email),
                gmail_labels: email.gmail_labels.clone(),
                synced: email.synced.to_rfc3339(),
                headers: String::from_utf8_lossy(&email.headers).into_owned(),
                body: extracted.preferred().to_string(),
                body_text: extracted.text,
                body_html: extracted.html,
            };
            Ok(reply::json(&detail).into_response())
        }
        Ok(None) => Ok(not_found("email not found")),
        Err(err) => Ok(error_response("failed to load email", err)),
    }
}

async fn download_email(query: EmailQuery, store: SqliteStore) -> Result<Response, Infallible> {
    match store.get_email(&query.mailbox, query.uid).await {
        Ok(Some(email)) => {
            let filename = format!("{}-{}.eml", query.mailbox.replace('/', "_"), query.uid);
            let response = warp::http::Response::builder()
                .header("Content-Type", "message/rfc822")
                .header(
                    "Content-Disposition",
                    format!("attachment; filename=\"{filename}\""),
                )
                .body(email.raw_message.into());
            match response {
                Ok(response) => Ok(response),
                Err(err) => Ok(error_response("failed to build download", err.into())),
            }
        }
        Ok(None) => Ok(not_found("email not found")),
        Err(err) => Ok(error_response("failed to load email", err)),
    }
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>mailkeep</title>
<style>
* { margin: 0; padding: 0; box-sizing: border-box; }
body { font-family: -apple-system, "Segoe UI", Roboto, sans-serif; background: #f5f5f5; }
.container { display: flex; height: 100vh; }
.sidebar { width: 250px; background: #2c3e50; color: white; overflow-y: auto; }
.sidebar h2 { padding: 16px 20px; background: #1a252f; font-size: 16px; }
.mailbox-item { padding: 10px 20px; cursor: pointer; border-bottom: 1px solid #34495e;
  display: flex; justify-content: space-between; align-items: center; }
.mailbox-item:hover { background: #34495e; }
.mailbox-item.active { background: #3498db; }
.mailbox-name { flex: 1; overflow: hidden; text-overflow: ellipsis; white-space: nowrap; }
.mailbox-count { background: #1a252f; padding: 2px 8px; border-radius: 10px; font-size: 11px; }
.email-list { width: 340px; background: white; border-right: 1px solid #ddd;
  display: flex; flex-direction: column; }
.email-list h2 { padding: 16px 20px; background: #ecf0f1; font-size: 15px; border-bottom: 1px solid #ddd; }
.email-list-content { flex: 1; overflow-y: auto; }
.email-item { padding: 12px 16px; border-bottom: 1px solid #eee; cursor: pointer; }
.email-item:hover { background: #f8f9fa; }
.email-item.active { background: #e3f2fd; }
.email-subject { font-weight: 600; font-size: 13px; margin-bottom: 4px; }
.email-from { font-size: 12px; color: #666; margin-bottom: 2px; }
.email-date { font-size: 11px; color: #999; }
.pagination { display: flex; justify-content: center; align-items: center; gap: 8px;
  padding: 10px; background: #ecf0f1; border-top: 1px solid #ddd; }
.pagination button { padding: 4px 10px; background: #3498db; color: white; border: none;
  border-radius: 3px; cursor: pointer; font-size: 12px; }
.pagination button:disabled { background: #95a5a6; cursor: not-allowed; }
.pagination span { font-size: 12px; color: #555; }
.viewer { flex: 1; background: white; overflow-y: auto; padding: 20px; }
.viewer-header { border-bottom: 2px solid #eee; padding-bottom: 12px; margin-bottom: 16px; }
.viewer-header h1 { font-size: 20px; margin-bottom: 8px; }
.viewer-meta { font-size: 13px; color: #666; line-height: 1.6; }
.flag { display: inline-block; background: #ecf0f1; border-radius: 3px; padding: 1px 6px;
  font-size: 11px; margin-right: 4px; color: #555; }
.download-btn { float: right; padding: 6px 12px; background: #3498db; color: white;
  text-decoration: none; border-radius: 4px; font-size: 13px; }
.download-btn:hover { background: #2980b9; }
.email-body { white-space: pre-wrap; font-family: monospace; font-size: 13px; line-height: 1.5; }
.empty-state { display: flex; align-items: center; justify-content: center; height: 100%;
  color: #999; font-size: 14px; }
iframe.html-body { width: 100%; border: none; min-height: 400px; }
</style>
</head>
<body>
<div class="container">
  <div class="sidebar"><h2>Mailboxes</h2><div id="mailboxes"></div></div>
  <div class="email-list">
    <h2 id="list-title">Select a mailbox</h2>
    <div class="email-list-content" id="emails"></div>
    <div class="pagination" id="pagination" style="display: none;">
      <button id="prev-page">Previous</button>
      <span id="page-info"></span>
      <button id="next-page">Next</button>
    </div>
  </div>
  <div class="viewer" id="viewer"><div class="empty-state">Select an email to view</div></div>
</div>
<script>
let currentMailbox = null;
let currentPage = 1;
let totalPages = 1;

function el(tag, className, text) {
  const node = document.createElement(tag);
  if (className) node.className = className;
  if (text !== undefined) node.textContent = text;
  return node;
}

async function loadMailboxes() {
  const res = await fetch('/api/v1/mailboxes');
  const boxes = await res.json();
  const list = document.getElementById('mailboxes');
  list.innerHTML = '';
  for (const box of boxes) {
    const item = el('div', 'mailbox-item');
    item.appendChild(el('span', 'mailbox-name', box.name));
    item.appendChild(el('span', 'mailbox-count', String(box.count)));
    item.onclick = () => {
      for (const other of list.children) other.classList.remove('active');
      item.classList.add('active');
      currentMailbox = box.name;
      currentPage = 1;
      loadEmails();
    };
    list.appendChild(item);
  }
}

async function loadEmails() {
  document.getElementById('list-title').textContent = currentMailbox;
  const res = await fetch('/api/v1/emails?mailbox=' + encodeURIComponent(currentMailbox) +
    '&page=' + currentPage);
  const data = await res.json();
  totalPages = Math.max(data.total_pages, 1);

  const list = document.getElementById('emails');
  list.innerHTML = '';
  for (const mail of data.emails) {
    const item = el('div', 'email-item');
    item.appendChild(el('div', 'email-subject', mail.subject || '(no subject)'));
    item.appendChild(el('div', 'email-from', mail.from));
    item.appendChild(el('div', 'email-date', mail.date.replace('T', ' ').slice(0, 19)));
    item.onclick = () => {
      for (const other of list.children) other.classList.remove('active');
      item.classList.add('active');
      loadEmail(mail.uid);
    };
    list.appendChild(item);
  }

  const pagination = document.getElementById('pagination');
  pagination.style.display = totalPages > 1 ? 'flex' : 'none';
  document.getElementById('page-info').textContent = 'Page ' + currentPage + ' of ' + totalPages;
  document.getElementById('prev-page').disabled = currentPage <= 1;
  document.getElementById('next-page').disabled = currentPage >= totalPages;
}

document.getElementById('prev-page').onclick = () => { currentPage--; loadEmails(); };
document.getElementById('next-page').onclick = () => { currentPage++; loadEmails(); };

async function loadEmail(uid) {
  const res = await fetch('/api/v1/email?mailbox=' + encodeURIComponent(currentMailbox) +
    '&uid=' + uid);
  const mail = await res.json();

  const viewer = document.getElementById('viewer');
  viewer.innerHTML = '';

  const header = el('div', 'viewer-header');
  const download = el('a', 'download-btn', 'Download .eml');
  download.href = '/api/v1/email/download?mailbox=' + encodeURIComponent(currentMailbox) +
    '&uid=' + uid;
  header.appendChild(download);
  header.appendChild(el('h1', null, mail.subject || '(no subject)'));

  const meta = el('div', 'viewer-meta');
  meta.appendChild(el('div', null, 'From: ' + mail.from));
  meta.appendChild(el('div', null, 'To: ' + mail.to.join(', ')));
  meta.appendChild(el('div', null, 'Date: ' + mail.date));
  const flags = el('div');
  for (const flag of mail.flags) flags.appendChild(el('span', 'flag', flag));
  meta.appendChild(flags);
  header.appendChild(meta);
  viewer.appendChild(header);

  if (mail.body_html) {
    const iframe = el('iframe', 'html-body');
    viewer.appendChild(iframe);
    iframe.srcdoc = mail.body_html;
    iframe.onload = () => {
      iframe.style.height = (iframe.contentWindow.document.body.scrollHeight + 20) + 'px';
    };
  } else {
    viewer.appendChild(el('pre', 'email-body', mail.body_text || mail.body));
  }
}

loadMailboxes();
</script>
</body>
</html>
"#;
