//! User-facing reply texts
//!
//! Everything the user reads is built here so the state machine and the
//! orchestrator only decide *which* reply, not its wording.

use crate::backend::{
    BackendError, BackendOperation, Citation, FetchSummary, PlatformConnection, SearchResponse, SourceInfo,
};
use crate::error::CoreError;
use crate::jobs::{Job, JobKind, JobNotification, JobStats, JobStatus};
use crate::rate_limit::CommandClass;
use crate::session::Role;
use crate::state_machine::DocumentCandidate;
use crate::wire::ResponseDescriptor;
use std::fmt::Write;
use std::time::Duration;

const SNIPPET_CHARS: usize = 100;

pub fn welcome() -> ResponseDescriptor {
    ResponseDescriptor::text(
        "Welcome! I can search across your connected data sources.\n\n\
         • /connect to link Google Drive, Slack, Notion and more\n\
         • /upload to index a document\n\
         • /search <query>, or just type a question\n\
         • /help for every command",
    )
    .with_action("Connect a source", "cmd:/connect")
    .with_action("Upload a file", "cmd:/upload")
    .with_action("Help", "cmd:/help")
}

pub fn help(is_admin: bool) -> ResponseDescriptor {
    let mut text = String::from(
        "Commands:\n\
         /search <query> - search your sources (or just type)\n\
         /documents - pick a document from the last results\n\
         /upload - index a file\n\
         /attach <job_id> - add a file to a running job\n\
         /connect - link a data source\n\
         /sources - list connected sources\n\
         /fetch [source] - pull the latest data from a source\n\
         /sync <source> - refresh a connected source\n\
         /process <document_id> - run document processing\n\
         /status [job_id] - check background jobs\n\
         /cancel - abandon the current step",
    );
    if is_admin {
        text.push_str(
            "\n/admin stats - usage overview\n\
             /admin users - list authorized users\n\
             /admin add_user <user_id> - allow a user\n\
             /admin remove_user <user_id> - stop allowing a user",
        );
    }
    ResponseDescriptor::text(text)
}

pub fn unauthorized() -> ResponseDescriptor {
    ResponseDescriptor::text("Sorry, you are not authorized to use this assistant.")
}

pub fn rate_limited(class: CommandClass, retry_after: Duration) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "You're sending {class} requests too quickly. Try again in {}.",
        humanize(retry_after)
    ))
}

pub fn greeting() -> ResponseDescriptor {
    ResponseDescriptor::text("Hi! Ask me anything about your documents, or use /help to see what I can do.")
}

pub fn query_too_short(min_chars: usize) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "Please send a question of at least {min_chars} characters so I can search for it."
    ))
}

pub fn search_prompt(history: &[String]) -> ResponseDescriptor {
    history.iter().fold(
        ResponseDescriptor::text("What would you like to search for? Just type your question."),
        |reply, query| reply.with_action(query.clone(), format!("cmd:/search {query}")),
    )
}

pub fn search_results(query: &str, response: &SearchResponse) -> ResponseDescriptor {
    let mut text = format!("🔍 Results for \"{query}\"\n\n");
    if let Some(answer) = response.answer.as_deref().filter(|a| !a.trim().is_empty()) {
        text.push_str(answer.trim());
        text.push_str("\n\n");
    }

    if !response.citations.is_empty() {
        text.push_str("Sources:\n");
        for citation in &response.citations {
            write_citation(&mut text, citation);
        }
    }

    let count = response.citations.len();
    let _ = write!(text, "Found {count} result{}", if count == 1 { "" } else { "s" });
    if count > 0 {
        text.push_str("\nReply with more detail to refine this search.");
    }

    let mut reply = ResponseDescriptor::text(text);
    for citation in &response.citations {
        if let Some(url) = &citation.url {
            reply = reply.with_attachment(citation.title.clone(), url.clone());
        }
    }
    if response.citations.iter().any(|c| c.document_id.is_some()) {
        reply = reply.with_action("Pick a document", "cmd:/documents");
    }
    reply.with_action("New search", "cmd:/search")
}

fn write_citation(text: &mut String, citation: &Citation) {
    let _ = write!(text, "[{}] {}", citation.id, citation.title);
    if let Some(url) = &citation.url {
        let _ = write!(text, " ({url})");
    }
    text.push('\n');
    let _ = write!(text, "    {}", citation.source.as_deref().unwrap_or("Unknown"));
    if let Some(snippet) = citation.snippet.as_deref() {
        let clean = snippet.replace('\n', " ");
        let clean = clean.trim();
        if !clean.is_empty() {
            let _ = write!(text, " | {}", truncate(clean, SNIPPET_CHARS));
        }
    }
    text.push_str("\n\n");
}

pub fn no_results(query: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "No results found for \"{query}\".\n\nTry different keywords, connect more sources with /connect, \
         or check your sources are synced."
    ))
}

pub fn upload_prompt(max_file_size_bytes: u64) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "📤 Send me the file to index (up to {}). Use /cancel to stop.",
        format_size(max_file_size_bytes)
    ))
}

pub fn attach_prompt(job_id: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "Send the file to attach to job {job_id}. Use /cancel to stop."
    ))
}

pub fn still_waiting_for_file() -> ResponseDescriptor {
    ResponseDescriptor::text("I'm still waiting for a file. Send one, or use /cancel to stop.")
        .with_action("Cancel", "cmd:/cancel")
}

pub fn unsupported_file(file_name: &str, supported: &[&str]) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "I can't index \"{file_name}\". Supported types: {}.",
        supported.join(", ")
    ))
}

pub fn file_too_large(file_name: &str, size_bytes: u64, max_bytes: u64) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "\"{file_name}\" is {}, over the {} limit.",
        format_size(size_bytes),
        format_size(max_bytes)
    ))
}

pub fn upload_started(file_name: &str, job_id: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "📤 Received {file_name}. Indexing has started (job {job_id}); I'll let you know when it's done."
    ))
    .with_action("Check status", format!("cmd:/status {job_id}"))
}

pub fn upload_indexed(file_name: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!("✅ {file_name} is uploaded and searchable."))
}

pub fn platform_prompt(candidates: &[String]) -> ResponseDescriptor {
    candidates.iter().fold(
        ResponseDescriptor::text("Which data source would you like to connect?"),
        |reply, platform| reply.with_action(platform_label(platform), format!("choice:{platform}")),
    )
}

pub fn invalid_choice(candidates: &[String]) -> ResponseDescriptor {
    candidates.iter().fold(
        ResponseDescriptor::text(format!(
            "That isn't one of the options. Pick one of: {}",
            candidates.join(", ")
        )),
        |reply, platform| reply.with_action(platform_label(platform), format!("choice:{platform}")),
    )
}

fn platform_label(platform: &str) -> String {
    match platform {
        "drive" => "Google Drive".to_string(),
        "slack" => "Slack".to_string(),
        "notion" => "Notion".to_string(),
        "custom" => "Custom API".to_string(),
        other => other.to_string(),
    }
}

pub fn connected(platform: &str, connection: &PlatformConnection) -> ResponseDescriptor {
    let label = platform_label(platform);
    let mut reply = match &connection.oauth_url {
        Some(url) => ResponseDescriptor::text(format!(
            "🔗 Almost there: authorize access to {label} using the link below."
        ))
        .with_attachment(format!("Authorize {label}"), url.clone()),
        None => ResponseDescriptor::text(format!("✅ {label} connected.")),
    };
    if let Some(job_id) = &connection.job_id {
        reply.reply_text.push_str(&format!("\nInitial sync started (job {job_id})."));
    }
    reply
}

pub fn sources(sources: &[SourceInfo]) -> ResponseDescriptor {
    if sources.is_empty() {
        return ResponseDescriptor::text("No sources connected yet. Use /connect to link one.")
            .with_action("Connect a source", "cmd:/connect");
    }

    let mut text = String::from("📚 Connected sources:\n");
    for (n, source) in sources.iter().enumerate() {
        let status = match source.status.as_deref() {
            Some("active") => "✅",
            Some("error") => "❌",
            _ => "⏸️",
        };
        let _ = write!(text, "\n{}. {status} {}", n + 1, source.name);
        if let Some(platform) = &source.platform {
            let _ = write!(text, " ({})", platform_label(platform));
        }
        let count = source.document_count;
        let _ = write!(text, "\n    {count} document{}", if count == 1 { "" } else { "s" });
        if let Some(last_sync) = &source.last_sync {
            let _ = write!(text, ", last sync {last_sync}");
        }
    }
    ResponseDescriptor::text(text)
        .with_action("Fetch latest", "cmd:/fetch")
        .with_action("Connect another", "cmd:/connect")
}

/// Active sources as fetch buttons
pub fn fetch_picker(sources: &[SourceInfo]) -> ResponseDescriptor {
    let active: Vec<&SourceInfo> = sources.iter().filter(|s| s.is_active()).collect();
    if active.is_empty() {
        return ResponseDescriptor::text("No active sources to fetch from. Use /connect to link one.")
            .with_action("Connect a source", "cmd:/connect");
    }
    active.into_iter().fold(
        ResponseDescriptor::text("📥 Pick a source to fetch the latest data from:"),
        |reply, source| reply.with_action(source.name.clone(), format!("cmd:/fetch {}", source.id)),
    )
}

pub fn documents_fetched(source: &str, summary: &FetchSummary) -> ResponseDescriptor {
    let name = summary.source_name.as_deref().unwrap_or(source);
    let count = summary.item_count;
    let mut text = format!("✅ Fetched {count} item{} from {name}.", if count == 1 { "" } else { "s" });
    if let Some(updated) = &summary.last_updated {
        let _ = write!(text, "\nLast updated: {updated}");
    }
    if let Some(status) = &summary.sync_status {
        let _ = write!(text, "\nSync status: {status}");
    }
    if let Some(detail) = summary.summary.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        let _ = write!(text, "\n\n{detail}");
    }
    ResponseDescriptor::text(text)
}

pub fn finish_current_step(state_name: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!(
        "Let's finish the current step first ({}), or use /cancel.",
        state_name.replace('_', " ")
    ))
    .with_action("Cancel", "cmd:/cancel")
}

pub fn no_documents() -> ResponseDescriptor {
    ResponseDescriptor::text("There are no documents to pick from. Run a search first.")
}

pub fn document_page(candidates: &[DocumentCandidate], page: usize, page_size: usize) -> ResponseDescriptor {
    let pages = candidates.len().div_ceil(page_size).max(1);
    let start = page * page_size;
    let mut text = format!("Pick a document (page {} of {pages}):\n", page + 1);
    let mut reply = ResponseDescriptor::default();

    for (offset, candidate) in candidates.iter().skip(start).take(page_size).enumerate() {
        let _ = writeln!(text, "{}. {}", offset + 1, candidate.title);
        reply = reply.with_action(
            truncate(&candidate.title, 40),
            format!("select:{}", start + offset),
        );
    }
    if page > 0 {
        reply = reply.with_action("« Prev", "page:prev");
    }
    if page + 1 < pages {
        reply = reply.with_action("Next »", "page:next");
    }
    text.push_str("Reply with a number, or use /cancel.");
    reply.reply_text = text;
    reply
}

pub fn invalid_selection() -> ResponseDescriptor {
    ResponseDescriptor::text("That number isn't on the list. Pick one of the documents shown, or use /cancel.")
}

pub fn job_started(kind: JobKind, label: &str, job_id: &str) -> ResponseDescriptor {
    let what = match kind {
        JobKind::Process => "Processing",
        JobKind::Sync => "Syncing",
        JobKind::Upload => "Indexing",
        JobKind::Search => "Searching",
    };
    ResponseDescriptor::text(format!(
        "⏳ {what} {label} (job {job_id}). I'll let you know when it's done."
    ))
    .with_action("Check status", format!("cmd:/status {job_id}"))
}

pub fn usage(command: &str, syntax: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!("Usage: /{command} {syntax}"))
}

pub fn sync_usage(platforms: &[String]) -> ResponseDescriptor {
    platforms.iter().fold(usage("sync", "<source>"), |reply, platform| {
        reply.with_action(format!("Sync {}", platform_label(platform)), format!("cmd:/sync {platform}"))
    })
}

pub fn cancelled(abandoned_jobs: usize) -> ResponseDescriptor {
    let text = match abandoned_jobs {
        0 => "Cancelled. What would you like to do next?".to_string(),
        1 => "Cancelled. I've stopped tracking 1 background job.".to_string(),
        n => format!("Cancelled. I've stopped tracking {n} background jobs."),
    };
    ResponseDescriptor::text(text)
}

pub fn nothing_to_cancel() -> ResponseDescriptor {
    ResponseDescriptor::text("There's nothing to cancel.")
}

pub fn session_expired(state_name: &str, abandoned_jobs: usize) -> ResponseDescriptor {
    let mut text = String::from("Your previous session timed out");
    if state_name != "idle" {
        let _ = write!(text, " while {}", state_name.replace('_', " "));
    }
    text.push('.');
    if abandoned_jobs > 0 {
        let _ = write!(
            text,
            " I've stopped tracking {abandoned_jobs} background job{}.",
            if abandoned_jobs == 1 { "" } else { "s" }
        );
    }
    ResponseDescriptor::text(text)
}

pub fn admin_required() -> ResponseDescriptor {
    ResponseDescriptor::text("This command requires admin privileges.")
}

pub fn admin_usage() -> ResponseDescriptor {
    ResponseDescriptor::text(
        "Admin commands:\n\
         /admin stats - usage overview\n\
         /admin users - list authorized users\n\
         /admin add_user <user_id> - allow a user\n\
         /admin remove_user <user_id> - stop allowing a user",
    )
}

pub fn user_list(open: bool, members: &[(String, Role)]) -> ResponseDescriptor {
    let mut text = String::from(if open {
        "👥 No allow-list is configured, so every user is allowed."
    } else {
        "👥 Authorized users:"
    });
    for (user_id, role) in members {
        let badge = if *role == Role::Admin { "👑" } else { "👤" };
        let _ = write!(text, "\n{badge} {user_id}");
    }
    ResponseDescriptor::text(text)
}

pub fn user_added(user_id: &str, added: bool) -> ResponseDescriptor {
    ResponseDescriptor::text(if added {
        format!("✅ User {user_id} added to the allow-list.")
    } else {
        format!("ℹ️ User {user_id} is already on the allow-list.")
    })
}

pub fn user_removed(user_id: &str, removed: bool) -> ResponseDescriptor {
    ResponseDescriptor::text(if removed {
        format!("✅ User {user_id} removed from the allow-list.")
    } else {
        format!("❌ Can't remove user {user_id}: not on the allow-list, or an admin.")
    })
}

pub fn unknown_command(name: &str) -> ResponseDescriptor {
    ResponseDescriptor::text(format!("I don't know the command /{name}. Use /help to see what I can do."))
}

pub fn stale_action() -> ResponseDescriptor {
    ResponseDescriptor::text("That option is no longer available. Use /help to see what I can do.")
}

pub fn unknown_action() -> ResponseDescriptor {
    ResponseDescriptor::text("I didn't understand that. Use /help to see what I can do.")
}

pub fn backend_failed(operation: BackendOperation, error: &BackendError) -> ResponseDescriptor {
    use crate::backend::BackendErrorKind;

    let what = match operation {
        BackendOperation::Search => "search",
        BackendOperation::Upload => "upload",
        BackendOperation::FetchJobStatus => "status check",
        BackendOperation::ConnectPlatform => "connection",
        BackendOperation::ProcessDocument => "document processing request",
        BackendOperation::SyncSource => "sync request",
        BackendOperation::GetSources => "source listing",
        BackendOperation::FetchDocuments => "fetch",
    };
    let why = match error.kind {
        BackendErrorKind::Timeout => "the service took too long to respond",
        BackendErrorKind::Unavailable => "the service is unreachable right now",
        BackendErrorKind::Error { code: 404 } => "the service couldn't find what was asked for",
        BackendErrorKind::Error { .. } => "the service reported an error",
    };
    ResponseDescriptor::text(format!(
        "❌ Your {what} didn't go through: {why}. Please try again in a moment."
    ))
}

pub fn job_status(job: &Job) -> ResponseDescriptor {
    let mut text = format!("Job {} ({} {}): {}", job.job_id, job.kind, job.label, job.status);
    match job.status {
        JobStatus::Pending | JobStatus::Running => {
            let _ = write!(text, ", {}% done", job.progress);
        }
        JobStatus::Failed if job.outcome_unknown => text.push_str(", outcome could not be confirmed"),
        _ => {}
    }
    ResponseDescriptor::text(text)
}

pub fn job_list(jobs: &[Job]) -> ResponseDescriptor {
    if jobs.is_empty() {
        return ResponseDescriptor::text("You have no background jobs running.");
    }
    let mut text = String::from("Background jobs:\n");
    for job in jobs {
        let _ = writeln!(
            text,
            "• {} {} - {} ({}%)",
            job.kind, job.label, job.status, job.progress
        );
    }
    ResponseDescriptor::text(text.trim_end().to_string())
}

pub fn job_finished(note: &JobNotification) -> ResponseDescriptor {
    let text = match (note.status, note.kind) {
        (JobStatus::Completed, JobKind::Upload) => format!("✅ {} indexed.", note.label),
        (JobStatus::Completed, JobKind::Sync) => format!("✅ {} finished.", note.label),
        (JobStatus::Completed, _) => format!("✅ {} is done.", note.label),
        (_, _) if note.outcome_unknown => format!(
            "⚠️ I couldn't confirm the status of {} (job {}). It may still finish; check with /status later.",
            note.label, note.job_id
        ),
        (_, _) => {
            let detail = note
                .result
                .as_ref()
                .and_then(|r| r.get("error"))
                .and_then(|e| e.as_str())
                .map(|e| format!(": {e}"))
                .unwrap_or_default();
            format!("❌ {} failed{detail}.", note.label)
        }
    };
    ResponseDescriptor::text(text)
}

pub fn stats(active_sessions: usize, jobs: &JobStats) -> ResponseDescriptor {
    let mut text = format!("Active sessions: {active_sessions}\nJobs tracked: {}", jobs.total());
    for (status, count) in &jobs.by_status {
        let _ = write!(text, "\n  {status}: {count}");
    }
    ResponseDescriptor::text(text)
}

pub fn unavailable() -> ResponseDescriptor {
    ResponseDescriptor::text("Something went wrong on our side. Please try again shortly.")
}

/// Reply for an error handled inside the core
pub fn for_error(error: &CoreError) -> ResponseDescriptor {
    match error {
        CoreError::AuthRejected(_) => unauthorized(),
        CoreError::RateLimitExceeded { class, retry_after } => rate_limited(*class, *retry_after),
        CoreError::InvalidStateTransition(_) => unknown_action(),
        CoreError::Backend { operation, error } => backend_failed(*operation, error),
        CoreError::JobNotFound(job_id) => ResponseDescriptor::text(format!(
            "I don't know a job called {job_id}. Use /status to list yours."
        )),
        CoreError::SessionStoreUnavailable(_) | CoreError::JobStoreUnavailable(_) => unavailable(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn format_size(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{}.{} MB", bytes / MB, (bytes % MB) * 10 / MB)
    } else {
        format!("{} KB", bytes.div_ceil(1024))
    }
}

fn humanize(d: Duration) -> String {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    match secs {
        0..=1 => "a second".to_string(),
        2..=90 => format!("{secs} seconds"),
        _ => format!("{} minutes", secs.div_ceil(60)),
    }
}
