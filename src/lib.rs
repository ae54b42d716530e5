pub mod agent;
pub mod config;
pub mod errors;
pub mod events;
pub mod form;
pub mod logging;
pub mod notify;
pub mod state;
pub mod transport;

pub use agent::{AgentDeps, DraftAgent, SaveOutcome, SkipReason};
pub use config::{AgentOptions, DraftsaveToml};
pub use errors::DraftError;
pub use events::{EventSource, HostEvent, HostSignals};
pub use form::{FormSource, JsonFileForm};
pub use notify::Callbacks;
pub use state::{DraftPhase, DraftState, Payload, SaveStatus};
pub use transport::{HttpTransport, SaveReceipt, SaveRequest, SaveTransport};
