//! Conversation state machine
//!
//! Elm-style: `transition` is pure, and everything that touches the outside
//! world comes back as an [`Effect`] for the orchestrator to run. Results of
//! backend calls are fed back in as further events.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::{Effect, SourceListing};
pub use event::{Command, Event, PageDirection};
pub use state::{ConversationState, DocumentCandidate, UploadPurpose};
pub use transition::{transition, Disposition, FlowSettings};
