//! Session lifecycle: options, state machine and the controller.

mod controller;
mod error;
mod models;
mod options;

pub use controller::{
    ARTIFACT_LABEL, SINGLEUSER_APP_ENV, SessionController, SpawnRequest, StopOutcome, USER_LABEL,
};
pub use error::{SpawnError, SpawnResult};
pub use models::{Interface, Session, SessionOptions, SessionState, UserIdentity};
pub use options::{FormData, FormOptionsParser, SessionOptionsParser, form_from_pairs};
