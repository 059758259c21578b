//! Spawn form parsing.

use std::collections::HashMap;

use super::error::{SpawnError, SpawnResult};
use super::models::{Interface, SessionOptions};
use crate::validate::validate_artifact_id;

/// Raw spawn options as posted by the front-end: every key may carry
/// several values.
pub type FormData = HashMap<String, Vec<String>>;

/// Turns raw front-end options into validated session options.
pub trait SessionOptionsParser: Send + Sync {
    fn parse(&self, form: &FormData) -> SpawnResult<SessionOptions>;
}

/// Recognizes `artifact` and `lab`, keeps the first value of each and
/// ignores every other key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormOptionsParser;

impl SessionOptionsParser for FormOptionsParser {
    fn parse(&self, form: &FormData) -> SpawnResult<SessionOptions> {
        let artifact = match first_value(form, "artifact") {
            Some(id) => {
                validate_artifact_id(id).map_err(|message| SpawnError::InvalidOption {
                    key: "artifact".to_string(),
                    message,
                })?;
                Some(id.to_string())
            }
            None => None,
        };

        let interface = match first_value(form, "lab") {
            Some(flag) => {
                Interface::from_lab_flag(flag).map_err(|message| SpawnError::InvalidOption {
                    key: "lab".to_string(),
                    message,
                })?
            }
            None => Interface::default(),
        };

        Ok(SessionOptions {
            artifact,
            interface,
        })
    }
}

/// First non-blank value of a key.
fn first_value<'a>(form: &'a FormData, key: &str) -> Option<&'a str> {
    form.get(key)
        .and_then(|values| values.first())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Build form data from single-valued pairs.
pub fn form_from_pairs<K, V, I>(pairs: I) -> FormData
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut form = FormData::new();
    for (key, value) in pairs {
        form.entry(key.into()).or_default().push(value.into());
    }
    form
}
