//! Parsing of typed input lines.

use std::path::PathBuf;

use thiserror::Error;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Send text to the selected peer
    Say(String),
    /// Select a peer and make sure a session exists
    Peer(String),
    /// Rotate the key shared with the selected peer
    Rotate,
    /// Tear down the session with the selected peer
    Close,
    /// Tear down every session
    CloseAll,
    /// List sessions
    Sessions,
    /// Write an encrypted backup of all session keys
    Backup(PathBuf),
    /// Import session keys from a backup
    Restore(PathBuf),
    /// Show commands
    Help,
    /// Leave
    Quit,
    /// Blank line
    Empty,
}

/// Input that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// Unrecognized slash command.
    #[error("unknown command /{0}, try /help")]
    UnknownCommand(String),

    /// A command is missing its argument.
    #[error("/{command} needs {argument}")]
    MissingArgument {
        /// Command name
        command: &'static str,
        /// What was expected
        argument: &'static str,
    },
}

/// Command summary shown by `/help`.
pub const HELP: &str = "\
/peer <id>        select a peer and open a session
/rotate           rotate the key with the selected peer
/close            end the session with the selected peer
/close-all        end every session
/sessions         list sessions
/backup <file>    write an encrypted key backup
/restore <file>   import a key backup
/quit             leave
anything else is sent to the selected peer";

/// Parse one input line. Lines starting with `/` are commands; `//` sends a
/// literal slash.
pub fn parse(line: &str) -> Result<Input, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(Input::Empty);
    }
    if let Some(escaped) = line.strip_prefix("//") {
        return Ok(Input::Say(format!("/{escaped}")));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Say(line.to_string()));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    match name {
        "peer" => required("peer", "a peer id", argument).map(|id| Input::Peer(id.to_string())),
        "rotate" => Ok(Input::Rotate),
        "close" => Ok(Input::Close),
        "close-all" => Ok(Input::CloseAll),
        "sessions" => Ok(Input::Sessions),
        "backup" => required("backup", "a file path", argument).map(|p| Input::Backup(p.into())),
        "restore" => required("restore", "a file path", argument).map(|p| Input::Restore(p.into())),
        "help" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        other => Err(InputError::UnknownCommand(other.to_string())),
    }
}

fn required<'a>(
    command: &'static str,
    argument: &'static str,
    value: &'a str,
) -> Result<&'a str, InputError> {
    if value.is_empty() {
        return Err(InputError::MissingArgument { command, argument });
    }
    Ok(value)
}
