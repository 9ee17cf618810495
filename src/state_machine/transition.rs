//! Pure state transition function
//!
//! Total over (state, event): every pair yields a session and effects. Input
//! that makes no sense in the current state leaves the state untouched,
//! replies with guidance and is reported as [`Disposition::Ignored`].
//!
//! Backend calls are requested as effects while the session keeps its
//! pre-call state; the call's result arrives as another event and only then
//! moves the flow on. A failed call therefore leaves the user on the same
//! step, free to retry.

use super::{
    Command, ConversationState, DocumentCandidate, Effect, Event, PageDirection, SourceListing, UploadPurpose,
};
use crate::backend::{PlatformConnection, SearchResponse, SourceInfo, UploadReceipt};
use crate::jobs::JobKind;
use crate::reply;
use crate::session::{Role, UserSession};
use crate::wire::{FileRef, ResponseDescriptor};

/// Shortest query sent to the backend
pub const MIN_QUERY_CHARS: usize = 3;

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "txt", "rtf", "jpg", "jpeg", "png", "gif", "bmp", "mp3", "wav", "ogg",
    "m4a", "csv", "xlsx", "xls", "md", "html", "xml", "json",
];

/// Small talk that is answered instead of searched
const GREETINGS: &[&str] = &[
    "hello", "hi", "hey", "thanks", "thank you", "ok", "okay", "yes", "no", "sure", "fine", "good",
    "great", "nice",
];

/// Flow parameters the transition needs from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSettings {
    pub max_file_size_bytes: u64,
    pub pagination_size: usize,
    /// Sources offered by /connect
    pub platforms: Vec<String>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 50 * 1024 * 1024,
            pagination_size: 5,
            platforms: ["drive", "slack", "notion", "custom"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl FlowSettings {
    fn page_size(&self) -> usize {
        self.pagination_size.max(1)
    }
}

/// Whether the event moved the conversation or was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Not meaningful in the current state; state unchanged
    Ignored(String),
}

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub session: UserSession,
    pub effects: Vec<Effect>,
    pub disposition: Disposition,
}

impl TransitionResult {
    pub fn new(session: UserSession) -> Self {
        Self {
            session,
            effects: vec![],
            disposition: Disposition::Applied,
        }
    }

    /// Stay put and explain
    pub fn ignored(session: UserSession, reason: impl Into<String>, guidance: ResponseDescriptor) -> Self {
        Self {
            session,
            effects: vec![Effect::Reply(guidance)],
            disposition: Disposition::Ignored(reason.into()),
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_reply(self, response: ResponseDescriptor) -> Self {
        self.with_effect(Effect::Reply(response))
    }
}

/// Pure transition function
///
/// Given the same session, settings and event it always produces the same
/// result. Timestamps are left alone; the session store refreshes them on
/// save.
pub fn transition(session: &UserSession, settings: &FlowSettings, event: Event) -> TransitionResult {
    let next = session.clone();
    let mut result = match event {
        Event::Command(command) => on_command(next, settings, command),
        Event::Text(text) => on_text(next, settings, &text),
        Event::File(file) => on_file(next, settings, file),
        Event::Choice(choice) => match next.state.clone() {
            ConversationState::AwaitingPlatformChoice { candidates } => choose_platform(next, &candidates, &choice),
            _ => stale(next, "choice"),
        },
        Event::Select(index) => match next.state.clone() {
            ConversationState::AwaitingDocumentSelection { candidates, .. } => {
                select_document(next, &candidates, index)
            }
            _ => stale(next, "select"),
        },
        Event::Page(direction) => match next.state.clone() {
            ConversationState::AwaitingDocumentSelection { candidates, page } => {
                turn_page(next, settings, candidates, page, direction)
            }
            _ => stale(next, "page"),
        },
        Event::Unrecognized(raw) => {
            let reason = format!("unrecognized input {raw:?} in {}", next.state.name());
            TransitionResult::ignored(next, reason, reply::unknown_action())
        }

        Event::SearchCompleted { query, response } => search_completed(next, query, response),
        Event::UploadAccepted { file_name, receipt } => upload_accepted(next, &file_name, receipt),
        Event::PlatformConnected { platform, connection } => platform_connected(next, &platform, connection),
        Event::JobStarted { kind, label, job_id } => job_started(next, kind, &label, job_id),
        Event::SourcesListed { listing, sources } => sources_listed(next, listing, &sources),
        Event::DocumentsFetched { source, summary } => {
            TransitionResult::new(next).with_reply(reply::documents_fetched(&source, &summary))
        }
        Event::BackendFailed { operation, error } => {
            TransitionResult::new(next).with_reply(reply::backend_failed(operation, &error))
        }
        Event::SessionExpired => session_expired(next),
    };

    // a job outlives its flow once the conversation is back to Idle
    if result.session.state.is_idle() {
        result.session.state_context.flow_jobs.clear();
    }
    result
}

// ============================================================================
// Commands
// ============================================================================

fn on_command(mut next: UserSession, settings: &FlowSettings, command: Command) -> TransitionResult {
    match command {
        Command::Start => {
            next.state = ConversationState::Idle;
            TransitionResult::new(next).with_reply(reply::welcome())
        }
        Command::Help => {
            let is_admin = next.role == Role::Admin;
            TransitionResult::new(next).with_reply(reply::help(is_admin))
        }
        Command::Upload => {
            next.state = ConversationState::AwaitingFileUpload {
                purpose: UploadPurpose::Index,
            };
            TransitionResult::new(next).with_reply(reply::upload_prompt(settings.max_file_size_bytes))
        }
        Command::Attach(Some(job_id)) => {
            let prompt = reply::attach_prompt(&job_id);
            next.state = ConversationState::AwaitingFileUpload {
                purpose: UploadPurpose::AttachToJob { job_id },
            };
            TransitionResult::new(next).with_reply(prompt)
        }
        Command::Attach(None) => {
            TransitionResult::ignored(next, "attach without a job id", reply::usage("attach", "<job_id>"))
        }
        Command::Connect => {
            next.state = ConversationState::AwaitingPlatformChoice {
                candidates: settings.platforms.clone(),
            };
            TransitionResult::new(next).with_reply(reply::platform_prompt(&settings.platforms))
        }
        Command::Search(Some(query)) => submit_query(next, &query, None),
        Command::Search(None) => {
            next.state = ConversationState::Idle;
            let prompt = reply::search_prompt(&next.state_context.search_history);
            TransitionResult::new(next).with_reply(prompt)
        }
        Command::Documents => offer_documents(next, settings),
        Command::Process(Some(document_id)) => TransitionResult::new(next).with_effect(Effect::ProcessDocument {
            title: document_id.clone(),
            document_id,
        }),
        Command::Process(None) => {
            TransitionResult::ignored(next, "process without a document id", reply::usage("process", "<document_id>"))
        }
        Command::Sync(Some(source)) => TransitionResult::new(next).with_effect(Effect::SyncSource { source }),
        Command::Sync(None) => {
            TransitionResult::ignored(next, "sync without a source", reply::sync_usage(&settings.platforms))
        }
        Command::Sources => TransitionResult::new(next).with_effect(Effect::ListSources {
            listing: SourceListing::Overview,
        }),
        Command::Fetch(Some(source)) => TransitionResult::new(next).with_effect(Effect::FetchDocuments { source }),
        Command::Fetch(None) => TransitionResult::new(next).with_effect(Effect::ListSources {
            listing: SourceListing::FetchPicker,
        }),
        Command::Status(job_id) => TransitionResult::new(next).with_effect(Effect::ReportJobStatus { job_id }),
        Command::Cancel => cancel(next),
        Command::Admin(arg) => {
            if next.role != Role::Admin {
                return TransitionResult::ignored(next, "admin command from non-admin", reply::admin_required());
            }
            admin(next, arg.as_deref())
        }
        Command::Unknown(name) => {
            let guidance = reply::unknown_command(&name);
            TransitionResult::ignored(next, format!("unknown command /{name}"), guidance)
        }
    }
}

/// `/admin <subcommand> [user_id]`; bare `/admin` shows stats
fn admin(next: UserSession, arg: Option<&str>) -> TransitionResult {
    let mut words = arg.unwrap_or("stats").split_whitespace();
    let subcommand = words.next().map(str::to_ascii_lowercase);
    let target = words.next().map(String::from);

    let effect = match (subcommand.as_deref(), target, words.next()) {
        (Some("stats"), None, None) => Effect::ReportStats,
        (Some("users"), None, None) => Effect::ListUsers,
        (Some("add_user"), Some(user_id), None) => Effect::GrantAccess { user_id },
        (Some("remove_user"), Some(user_id), None) => Effect::RevokeAccess { user_id },
        _ => return TransitionResult::ignored(next, "unknown admin subcommand", reply::admin_usage()),
    };
    TransitionResult::new(next).with_effect(effect)
}

/// Back to Idle, dropping all flow data and abandoning the flow's jobs
fn cancel(mut next: UserSession) -> TransitionResult {
    let was_idle = next.state.is_idle();
    let job_ids = take_flow_jobs(&mut next);
    let abandoned = job_ids.len();
    next.reset();

    if was_idle && job_ids.is_empty() {
        return TransitionResult::new(next).with_reply(reply::nothing_to_cancel());
    }

    let mut result = TransitionResult::new(next);
    if !job_ids.is_empty() {
        result = result.with_effect(Effect::AbandonJobs { job_ids });
    }
    result.with_reply(reply::cancelled(abandoned))
}

/// Expiry observed: same as an implicit /cancel
fn session_expired(mut next: UserSession) -> TransitionResult {
    let state_name = next.state.name();
    let job_ids = take_flow_jobs(&mut next);
    let abandoned = job_ids.len();
    let was_idle = next.state.is_idle();
    next.reset();

    let mut result = TransitionResult::new(next);
    if !job_ids.is_empty() {
        result = result.with_effect(Effect::AbandonJobs { job_ids });
    }
    if was_idle && abandoned == 0 {
        return result;
    }
    result.with_reply(reply::session_expired(state_name, abandoned))
}

/// Jobs of a flow still in progress; an Idle session has none to abandon
fn take_flow_jobs(next: &mut UserSession) -> Vec<String> {
    let job_ids = std::mem::take(&mut next.state_context.flow_jobs);
    if next.state.is_idle() {
        return Vec::new();
    }
    job_ids
}

// ============================================================================
// Free text
// ============================================================================

fn on_text(next: UserSession, settings: &FlowSettings, text: &str) -> TransitionResult {
    match next.state.clone() {
        ConversationState::Idle => submit_query(next, text, None),
        ConversationState::AwaitingSearchRefinement { last_query, .. } => {
            submit_query(next, text, Some(&last_query))
        }
        ConversationState::AwaitingFileUpload { .. } => {
            TransitionResult::ignored(next, "text while awaiting a file", reply::still_waiting_for_file())
        }
        ConversationState::AwaitingPlatformChoice { candidates } => choose_platform(next, &candidates, text),
        ConversationState::AwaitingDocumentSelection { candidates, page } => {
            // numbers are 1-based within the page shown
            let page_size = settings.page_size();
            let index = text
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| (1..=page_size).contains(n))
                .and_then(|n| page.checked_mul(page_size)?.checked_add(n - 1));
            match index {
                Some(index) => select_document(next, &candidates, index),
                None => TransitionResult::ignored(next, "text while awaiting a selection", reply::invalid_selection()),
            }
        }
    }
}

fn is_greeting(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_end_matches(['!', '.', '?'])
        .to_lowercase();
    GREETINGS.contains(&normalized.as_str())
}

/// Search `text`, appended to `refine` when refining a previous query
fn submit_query(next: UserSession, text: &str, refine: Option<&str>) -> TransitionResult {
    let text = text.trim();
    if is_greeting(text) {
        return TransitionResult::new(next).with_reply(reply::greeting());
    }
    if text.chars().count() < MIN_QUERY_CHARS {
        return TransitionResult::ignored(next, "query too short", reply::query_too_short(MIN_QUERY_CHARS));
    }

    let query = match refine {
        Some(previous) => format!("{previous} {text}"),
        None => text.to_string(),
    };
    TransitionResult::new(next).with_effect(Effect::Search { query })
}

fn search_completed(mut next: UserSession, query: String, response: SearchResponse) -> TransitionResult {
    next.state_context.remember_query(&query);

    if response.is_empty() {
        next.state = ConversationState::Idle;
        return TransitionResult::new(next).with_reply(reply::no_results(&query));
    }

    let results = reply::search_results(&query, &response);
    // only cited results can be refined or picked from
    if response.citations.is_empty() {
        next.state = ConversationState::Idle;
        return TransitionResult::new(next).with_reply(results);
    }
    next.state = ConversationState::AwaitingSearchRefinement {
        last_query: query,
        last_citations: response.citations,
    };
    TransitionResult::new(next).with_reply(results)
}

// ============================================================================
// Files
// ============================================================================

fn on_file(next: UserSession, settings: &FlowSettings, file: FileRef) -> TransitionResult {
    let purpose = match &next.state {
        ConversationState::AwaitingFileUpload { purpose } => purpose.clone(),
        ConversationState::Idle | ConversationState::AwaitingSearchRefinement { .. } => UploadPurpose::Index,
        ConversationState::AwaitingPlatformChoice { .. } | ConversationState::AwaitingDocumentSelection { .. } => {
            let guidance = reply::finish_current_step(next.state.name());
            return TransitionResult::ignored(next, "file during another flow", guidance);
        }
    };

    let supported = file
        .extension()
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()));
    if !supported {
        let guidance = reply::unsupported_file(&file.file_name, SUPPORTED_EXTENSIONS);
        return TransitionResult::ignored(next, "unsupported file type", guidance);
    }
    if file.size_bytes > settings.max_file_size_bytes {
        let guidance = reply::file_too_large(&file.file_name, file.size_bytes, settings.max_file_size_bytes);
        return TransitionResult::ignored(next, "file too large", guidance);
    }

    TransitionResult::new(next).with_effect(Effect::Upload { file, purpose })
}

fn upload_accepted(mut next: UserSession, file_name: &str, receipt: UploadReceipt) -> TransitionResult {
    let purpose = match std::mem::take(&mut next.state) {
        ConversationState::AwaitingFileUpload { purpose } => purpose,
        other => {
            next.state = other;
            UploadPurpose::Index
        }
    };

    let Some(job_id) = receipt.job_id else {
        return TransitionResult::new(next).with_reply(reply::upload_indexed(file_name));
    };

    let label = match purpose {
        UploadPurpose::Index => file_name.to_string(),
        UploadPurpose::AttachToJob { job_id: parent } => format!("{file_name} (for job {parent})"),
    };
    let started = reply::upload_started(file_name, &job_id);
    track_job(next, job_id, JobKind::Upload, label).with_reply(started)
}

// ============================================================================
// Platforms
// ============================================================================

fn choose_platform(next: UserSession, candidates: &[String], choice: &str) -> TransitionResult {
    let choice = choice.trim();
    let picked = candidates
        .iter()
        .find(|c| c.eq_ignore_ascii_case(choice))
        .or_else(|| {
            choice
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| candidates.get(i))
        });

    match picked {
        Some(platform) => TransitionResult::new(next).with_effect(Effect::ConnectPlatform {
            platform: platform.clone(),
        }),
        None => TransitionResult::ignored(
            next,
            format!("choice {choice:?} not among candidates"),
            reply::invalid_choice(candidates),
        ),
    }
}

fn platform_connected(mut next: UserSession, platform: &str, connection: PlatformConnection) -> TransitionResult {
    if matches!(next.state, ConversationState::AwaitingPlatformChoice { .. }) {
        next.state = ConversationState::Idle;
    }
    let connected = reply::connected(platform, &connection);
    match connection.job_id {
        Some(job_id) => track_job(next, job_id, JobKind::Sync, format!("{platform} sync")).with_reply(connected),
        None => TransitionResult::new(next).with_reply(connected),
    }
}

fn sources_listed(next: UserSession, listing: SourceListing, sources: &[SourceInfo]) -> TransitionResult {
    let listed = match listing {
        SourceListing::Overview => reply::sources(sources),
        SourceListing::FetchPicker => reply::fetch_picker(sources),
    };
    TransitionResult::new(next).with_reply(listed)
}

// ============================================================================
// Documents
// ============================================================================

fn offer_documents(mut next: UserSession, settings: &FlowSettings) -> TransitionResult {
    match next.state.clone() {
        ConversationState::AwaitingSearchRefinement { last_citations, .. } => {
            let mut candidates: Vec<DocumentCandidate> = Vec::new();
            for citation in last_citations {
                let Some(document_id) = citation.document_id else {
                    continue;
                };
                if candidates.iter().all(|c| c.document_id != document_id) {
                    candidates.push(DocumentCandidate {
                        document_id,
                        title: citation.title,
                    });
                }
            }
            if candidates.is_empty() {
                return TransitionResult::ignored(next, "no documents in last results", reply::no_documents());
            }
            let page = reply::document_page(&candidates, 0, settings.page_size());
            next.state = ConversationState::AwaitingDocumentSelection { candidates, page: 0 };
            TransitionResult::new(next).with_reply(page)
        }
        ConversationState::AwaitingDocumentSelection { candidates, page } => {
            let listing = reply::document_page(&candidates, page, settings.page_size());
            TransitionResult::new(next).with_reply(listing)
        }
        _ => TransitionResult::ignored(next, "documents requested without results", reply::no_documents()),
    }
}

fn select_document(next: UserSession, candidates: &[DocumentCandidate], index: usize) -> TransitionResult {
    match candidates.get(index) {
        Some(candidate) => TransitionResult::new(next).with_effect(Effect::ProcessDocument {
            document_id: candidate.document_id.clone(),
            title: candidate.title.clone(),
        }),
        None => TransitionResult::ignored(
            next,
            format!("selection {index} out of range"),
            reply::invalid_selection(),
        ),
    }
}

fn turn_page(
    mut next: UserSession,
    settings: &FlowSettings,
    candidates: Vec<DocumentCandidate>,
    page: usize,
    direction: PageDirection,
) -> TransitionResult {
    let last_page = candidates.len().div_ceil(settings.page_size()).saturating_sub(1);
    let page = match direction {
        PageDirection::Next => (page + 1).min(last_page),
        PageDirection::Prev => page.saturating_sub(1),
    };
    let listing = reply::document_page(&candidates, page, settings.page_size());
    next.state = ConversationState::AwaitingDocumentSelection { candidates, page };
    TransitionResult::new(next).with_reply(listing)
}

// ============================================================================
// Jobs
// ============================================================================

fn job_started(mut next: UserSession, kind: JobKind, label: &str, job_id: String) -> TransitionResult {
    if matches!(next.state, ConversationState::AwaitingDocumentSelection { .. }) {
        next.state = ConversationState::Idle;
    }
    let started = reply::job_started(kind, label, &job_id);
    track_job(next, job_id, kind, label.to_string()).with_reply(started)
}

/// Remember the job on the session and ask for it to be tracked
fn track_job(mut next: UserSession, job_id: String, kind: JobKind, label: String) -> TransitionResult {
    if !next.state_context.flow_jobs.contains(&job_id) {
        next.state_context.flow_jobs.push(job_id.clone());
    }
    TransitionResult::new(next).with_effect(Effect::RegisterJob { job_id, kind, label })
}

fn stale(next: UserSession, what: &str) -> TransitionResult {
    let reason = format!("{what} in {}", next.state.name());
    TransitionResult::ignored(next, reason, reply::stale_action())
}
