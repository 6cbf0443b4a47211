#![forbid(unsafe_code)]

//! `agent-runner-ctl`: local CLI companion for `agent-runner`.
//!
//! Connects to the runner's IPC socket, authenticates with the token the
//! runner wrote next to its workspaces, and sends one command.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "agent-runner-ctl",
    about = "Local CLI for agent-runner",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the runner's `ipc_name` config).
    #[arg(long, default_value = "agent-runner")]
    ipc_name: String,

    /// Token file written by the runner
    /// (`<workspace.root>/.agent-runner/ipc-token`).
    #[arg(long)]
    token_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered sessions.
    List,

    /// Show runner status.
    Info,

    /// Start a session from a JSON session config file.
    Start {
        /// Path to the session config (camelCase JSON).
        config: PathBuf,
    },

    /// Send raw input to a session's provider.
    Input {
        /// Session ID.
        session_id: String,
        /// Text to send; a trailing newline is added.
        data: String,
    },

    /// Stop a session.
    Stop {
        /// Session ID.
        session_id: String,
        /// Stop ungracefully (the session ends FAILED).
        #[arg(long)]
        force: bool,
    },

    /// Pause a running session.
    Pause {
        /// Session ID.
        session_id: String,
    },

    /// Resume a paused session.
    Resume {
        /// Session ID.
        session_id: String,
    },

    /// Approve a pending approval.
    Approve {
        /// Session ID.
        session_id: String,
        /// Approval ID.
        approval_id: String,
        /// Optional note.
        #[arg(long)]
        note: Option<String>,
    },

    /// Deny a pending approval.
    Deny {
        /// Session ID.
        session_id: String,
        /// Approval ID.
        approval_id: String,
        /// Optional note.
        #[arg(long)]
        note: Option<String>,
    },
}

fn main() {
    let args = Cli::parse();

    let token = match std::fs::read_to_string(&args.token_file) {
        Ok(token) => token.trim().to_owned(),
        Err(err) => {
            eprintln!("Cannot read token file {}: {err}", args.token_file.display());
            std::process::exit(1);
        }
    };

    let request = match build_request(&args.command, &token) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    match send_ipc_command(&args.ipc_name, &request) {
        Ok(response) => {
            let ok = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
            if ok {
                match response.get("data") {
                    Some(data) => {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    }
                    None => println!("OK"),
                }
            } else {
                let err_msg = response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                eprintln!("Error: {err_msg}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to runner: {err}");
            eprintln!("Is agent-runner running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

fn build_request(command: &Command, token: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let payload = match command {
        Command::List => return Ok(json!({ "command": "list", "auth_token": token })),
        Command::Info => return Ok(json!({ "command": "info", "auth_token": token })),
        Command::Start { config } => {
            let raw = std::fs::read_to_string(config)?;
            let config: Value = serde_json::from_str(&raw)?;
            json!({ "type": "START", "config": config })
        }
        Command::Input { session_id, data } => {
            json!({ "type": "INPUT", "sessionId": session_id, "data": format!("{data}\n") })
        }
        Command::Stop { session_id, force } => {
            json!({ "type": "STOP", "sessionId": session_id, "graceful": !force })
        }
        Command::Pause { session_id } => json!({ "type": "PAUSE", "sessionId": session_id }),
        Command::Resume { session_id } => json!({ "type": "RESUME", "sessionId": session_id }),
        Command::Approve {
            session_id,
            approval_id,
            note,
        } => approval(session_id, approval_id, "approved", note.as_deref()),
        Command::Deny {
            session_id,
            approval_id,
            note,
        } => approval(session_id, approval_id, "denied", note.as_deref()),
    };
    Ok(json!({ "command": "dispatch", "auth_token": token, "payload": payload }))
}

fn approval(session_id: &str, approval_id: &str, decision: &str, note: Option<&str>) -> Value {
    let mut payload = json!({
        "type": "APPROVE",
        "sessionId": session_id,
        "approvalId": approval_id,
        "decision": decision,
    });
    if let Some(note) = note {
        payload["note"] = Value::String(note.to_owned());
    }
    payload
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &Value,
) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
