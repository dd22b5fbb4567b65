//! CLI utilities for the MLLP tools.
//!
//! The utilities present in this module are used by `mllp_send` to read messages
//! and commands from a terminal.
use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::protocol::hl7::SEGMENT_DELIMITER;

/// List of possible errors while reading user input.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no message provided")]
    Empty,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Drop the current connection `.close`
    Close,
    /// Send the message read from the file `.file <path>`
    File(PathBuf),
    /// Segments typed on consecutive lines, ended by a blank line
    Send(Vec<u8>),
}

/// Prompt user for a message or a command.
///
/// Each line is one segment; a blank line (or end of input) ends the message.
/// Lines starting with `.` are commands when they come first.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CliError>
where
    R: BufRead,
    W: Write,
{
    write!(&mut writer, "> ")?;
    writer.flush()?;

    let mut segments: Vec<String> = Vec::new();
    loop {
        let mut s = String::default();
        let read = reader.read_line(&mut s)?;
        let line = s.trim_end_matches(['\r', '\n']);

        if read == 0 {
            if segments.is_empty() {
                return Ok(Command::Exit);
            }
            return Ok(Command::Send(join_segments(&segments)));
        }

        if segments.is_empty() {
            match line.trim() {
                "" => return Err(CliError::Empty),
                command if command.starts_with('.') => return parse_command(command),
                _ => {}
            }
        } else if line.trim().is_empty() {
            return Ok(Command::Send(join_segments(&segments)));
        }

        segments.push(line.to_string());
        write!(&mut writer, "... ")?;
        writer.flush()?;
    }
}

fn parse_command(input: &str) -> Result<Command, CliError> {
    let mut parts = input.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim).filter(|a| !a.is_empty());

    match (command, argument) {
        (".exit", None) => Ok(Command::Exit),
        (".close", None) => Ok(Command::Close),
        (".file", Some(path)) => Ok(Command::File(PathBuf::from(path))),
        (".file", None) => Err(CliError::InvalidCommandArguments {
            command: command.to_string(),
            reason: "expected a file path".to_string(),
        }),
        (".exit" | ".close", Some(_)) => Err(CliError::InvalidCommandArguments {
            command: command.to_string(),
            reason: "takes no arguments".to_string(),
        }),
        _ => Err(CliError::UnrecognizedCommand(input.to_string())),
    }
}

fn join_segments(segments: &[String]) -> Vec<u8> {
    let mut message = Vec::new();
    for segment in segments {
        message.extend_from_slice(segment.as_bytes());
        message.push(SEGMENT_DELIMITER);
    }
    message
}

/// Reads an HL7 message from `path`, normalizing line endings to segment delimiters.
pub fn load_message(path: &Path) -> Result<Vec<u8>, CliError> {
    let message = normalize_segments(&fs::read(path)?);
    if message.is_empty() {
        return Err(CliError::Empty);
    }
    Ok(message)
}

/// Turns `\r\n` and `\n` line endings into `\r`, drops blank lines and makes sure
/// the last segment is terminated.
pub fn normalize_segments(bytes: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(bytes.len() + 1);
    for segment in bytes.split(|&b| b == b'\r' || b == b'\n') {
        if segment.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        message.extend_from_slice(segment);
        message.push(SEGMENT_DELIMITER);
    }
    message
}
