//! Events that drive state transitions

use super::{ConversationState, SourceListing};
use crate::backend::{
    BackendError, BackendOperation, FetchSummary, PlatformConnection, SearchResponse, SourceInfo, UploadReceipt,
};
use crate::jobs::JobKind;
use crate::rate_limit::CommandClass;
use crate::wire::{FileRef, InboundBody};

/// A parsed slash command. Arguments are the trimmed rest of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Upload,
    Attach(Option<String>),
    Connect,
    Search(Option<String>),
    Documents,
    Process(Option<String>),
    Sync(Option<String>),
    Sources,
    Fetch(Option<String>),
    Status(Option<String>),
    Cancel,
    Admin(Option<String>),
    Unknown(String),
}

impl Command {
    /// Parse `/name[@bot] args...`; the leading slash is optional.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let line = line.strip_prefix('/').unwrap_or(line);
        let (head, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        let name = head
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let arg = Some(rest.trim())
            .filter(|rest| !rest.is_empty())
            .map(String::from);

        match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "upload" => Command::Upload,
            "attach" => Command::Attach(arg),
            "connect" => Command::Connect,
            "search" => Command::Search(arg),
            "documents" | "docs" => Command::Documents,
            "process" => Command::Process(arg),
            "sync" => Command::Sync(arg),
            "sources" => Command::Sources,
            "fetch" => Command::Fetch(arg),
            "status" => Command::Status(arg),
            "cancel" => Command::Cancel,
            "admin" => Command::Admin(arg),
            _ => Command::Unknown(name),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help => "help",
            Command::Upload => "upload",
            Command::Attach(_) => "attach",
            Command::Connect => "connect",
            Command::Search(_) => "search",
            Command::Documents => "documents",
            Command::Process(_) => "process",
            Command::Sync(_) => "sync",
            Command::Sources => "sources",
            Command::Fetch(_) => "fetch",
            Command::Status(_) => "status",
            Command::Cancel => "cancel",
            Command::Admin(_) => "admin",
            Command::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Next,
    Prev,
}

/// Events that can occur in a conversation
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // User input
    Command(Command),
    Text(String),
    File(FileRef),
    /// Option picked from a list (quick action or typed)
    Choice(String),
    /// Absolute index into the offered candidates
    Select(usize),
    Page(PageDirection),
    /// Callback data that did not parse
    Unrecognized(String),

    // Backend results
    SearchCompleted {
        query: String,
        response: SearchResponse,
    },
    UploadAccepted {
        file_name: String,
        receipt: UploadReceipt,
    },
    PlatformConnected {
        platform: String,
        connection: PlatformConnection,
    },
    JobStarted {
        kind: JobKind,
        label: String,
        job_id: String,
    },
    SourcesListed {
        listing: SourceListing,
        sources: Vec<SourceInfo>,
    },
    DocumentsFetched {
        source: String,
        summary: FetchSummary,
    },
    BackendFailed {
        operation: BackendOperation,
        error: BackendError,
    },

    // Lifecycle
    /// The stored session was found past its expiry
    SessionExpired,
}

impl Event {
    /// Normalize an inbound transport body
    pub fn from_inbound(body: &InboundBody) -> Self {
        match body {
            InboundBody::Command(line) => Event::Command(Command::parse(line)),
            InboundBody::Text(text) if text.trim_start().starts_with('/') => {
                Event::Command(Command::parse(text))
            }
            InboundBody::Text(text) => Event::Text(text.trim().to_string()),
            InboundBody::File(file) => Event::File(file.clone()),
            InboundBody::Callback(data) => Self::from_callback(data),
        }
    }

    /// Quick-action data: `cmd:<line>`, `choice:<value>`, `select:<n>`,
    /// `page:next|prev`
    pub fn from_callback(data: &str) -> Self {
        let Some((tag, value)) = data.split_once(':') else {
            return Event::Unrecognized(data.to_string());
        };
        match (tag, value) {
            ("cmd", line) => Event::Command(Command::parse(line)),
            ("choice", value) if !value.trim().is_empty() => Event::Choice(value.trim().to_string()),
            ("select", n) => n
                .trim()
                .parse()
                .map_or_else(|_| Event::Unrecognized(data.to_string()), Event::Select),
            ("page", "next") => Event::Page(PageDirection::Next),
            ("page", "prev") => Event::Page(PageDirection::Prev),
            _ => Event::Unrecognized(data.to_string()),
        }
    }

    /// Rate-limiting bucket for this event when it arrives in `state`.
    /// Free text is charged to whatever it answers.
    pub fn command_class(&self, state: &ConversationState) -> CommandClass {
        match (self, state) {
            (Event::Text(_), ConversationState::AwaitingPlatformChoice { .. }) => CommandClass::Connect,
            (Event::Text(_), ConversationState::AwaitingDocumentSelection { .. }) => CommandClass::Jobs,
            (Event::Text(_), ConversationState::AwaitingFileUpload { .. }) => CommandClass::General,
            (Event::Command(Command::Search(_)) | Event::Text(_), _) => CommandClass::Search,
            (Event::Command(Command::Upload | Command::Attach(_)) | Event::File(_), _) => CommandClass::Upload,
            (Event::Command(Command::Connect) | Event::Choice(_), _) => CommandClass::Connect,
            (
                Event::Command(Command::Process(_) | Command::Sync(_) | Command::Fetch(_)) | Event::Select(_),
                _,
            ) => CommandClass::Jobs,
            _ => CommandClass::General,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Command(command) => command.name(),
            Event::Text(_) => "text",
            Event::File(_) => "file",
            Event::Choice(_) => "choice",
            Event::Select(_) => "select",
            Event::Page(_) => "page",
            Event::Unrecognized(_) => "unrecognized",
            Event::SearchCompleted { .. } => "search_completed",
            Event::UploadAccepted { .. } => "upload_accepted",
            Event::PlatformConnected { .. } => "platform_connected",
            Event::JobStarted { .. } => "job_started",
            Event::SourcesListed { .. } => "sources_listed",
            Event::DocumentsFetched { .. } => "documents_fetched",
            Event::BackendFailed { .. } => "backend_failed",
            Event::SessionExpired => "session_expired",
        }
    }
}
