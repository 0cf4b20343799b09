//! Line-oriented command protocol.
//!
//! One command per line, fields separated by `:::`:
//!
//! ```text
//! help
//! submitsecret:::<secret>
//! verifysecret:::<secret>:::<id>:::<verifier key ref>
//! getsecretstate:::<id>:::<prover key ref>
//! ```
//!
//! Fields past the ones a command needs are ignored. Every line produces a
//! text response; failures are rendered as their error message.

use tracing::debug;

use crate::engine::VerificationEngine;
use crate::error::{CommitmentError, Result};

pub const FIELD_SEPARATOR: &str = ":::";

pub const UNRECOGNIZED_PREFIX: &str = "Unrecognized command...";

const NO_MATCH: &str = "No Match";
const MATCH: &str = "Match";

struct CommandInfo {
    name: &'static str,
    description: &'static str,
}

const COMMANDS: [CommandInfo; 4] = [
    CommandInfo {
        name: "help",
        description: "Returns the info of the available commands.",
    },
    CommandInfo {
        name: "submitsecret",
        description: "Receives a secret by the prover and returns uuid with prover and verifier keys to perform other operations. Example: submitsecret:::secret.",
    },
    CommandInfo {
        name: "verifysecret",
        description: "Receives a secret, a uuid and a verifier key, and returns whether the secrets match or not. Example: verifysecret:::secret:::uuid:::verifierkey.",
    },
    CommandInfo {
        name: "getsecretstate",
        description: "Receives a uuid and a prover key, and returns whether the secrets match, not match, or if still missing for verifier submission. Example: getsecretstate:::uuid:::proverkey",
    },
];

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Help,
    SubmitSecret {
        secret: String,
    },
    VerifySecret {
        secret: String,
        id: String,
        verifier_key_ref: String,
    },
    GetSecretState {
        id: String,
        prover_key_ref: String,
    },
    Unrecognized(String),
}

impl Request {
    /// Parses one line. A single trailing line ending is dropped first.
    ///
    /// Fails with [`CommitmentError::MalformedCommand`] when a known command
    /// has fewer fields than it needs.
    pub fn parse(line: &str) -> Result<Self> {
        let line = strip_line_ending(line);
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();

        match fields[0] {
            "help" => Ok(Request::Help),
            "submitsecret" => {
                require_fields(&fields, 2)?;
                Ok(Request::SubmitSecret {
                    secret: fields[1].to_string(),
                })
            }
            "verifysecret" => {
                require_fields(&fields, 4)?;
                Ok(Request::VerifySecret {
                    secret: fields[1].to_string(),
                    id: fields[2].to_string(),
                    verifier_key_ref: fields[3].to_string(),
                })
            }
            "getsecretstate" => {
                require_fields(&fields, 3)?;
                Ok(Request::GetSecretState {
                    id: fields[1].to_string(),
                    prover_key_ref: fields[2].to_string(),
                })
            }
            other => Ok(Request::Unrecognized(other.to_string())),
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn require_fields(fields: &[&str], required: usize) -> Result<()> {
    if fields.len() < required {
        return Err(CommitmentError::MalformedCommand {
            required,
            found: fields.len(),
        });
    }
    Ok(())
}

/// Lists every command, one `Name: .. | Description: ..` line each.
pub fn help_text() -> String {
    let mut text = String::from("\nAVAILABLE COMMANDS");
    for command in &COMMANDS {
        text.push_str(&format!(
            "\nName: {} | Description: {}",
            command.name, command.description
        ));
    }
    text
}

/// Turns command lines into engine calls and engine results into text.
pub struct CommandProtocol {
    engine: VerificationEngine,
}

impl CommandProtocol {
    pub fn new(engine: VerificationEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &VerificationEngine {
        &self.engine
    }

    /// Handles one line and returns the response text. Never fails: errors
    /// are reported to the client as their message.
    pub fn handle_line(&self, line: &str) -> String {
        let response = Request::parse(line).and_then(|request| self.dispatch(request));
        match response {
            Ok(text) => text,
            Err(err) => {
                debug!(error = %err, "command failed");
                err.to_string()
            }
        }
    }

    pub fn dispatch(&self, request: Request) -> Result<String> {
        match request {
            Request::Help => Ok(help_text()),
            Request::SubmitSecret { secret } => {
                let submission = self.engine.submit_secret(&secret)?;
                Ok(submission.to_string())
            }
            Request::VerifySecret {
                secret,
                id,
                verifier_key_ref,
            } => {
                let verdict = if self.engine.verify_secret(&secret, &id, &verifier_key_ref)? {
                    MATCH
                } else {
                    NO_MATCH
                };
                Ok(verdict.to_string())
            }
            Request::GetSecretState { id, prover_key_ref } => {
                let state = self
                    .engine
                    .get_secret_state(&id, &prover_key_ref)?
                    .into_result()?;
                Ok(state.to_string())
            }
            Request::Unrecognized(name) => {
                debug!(command = %name, "unrecognized command");
                Ok(format!("{UNRECOGNIZED_PREFIX}{}", help_text()))
            }
        }
    }
}
