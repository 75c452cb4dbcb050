// SPDX-License-Identifier: MIT
//! Control client (spec §6 "CLI surface", SPEC_FULL.md §4.9).
//!
//! `sssonectorctl <status|metrics|reload|stop>` talks to the daemon's
//! Unix socket in `state_dir` and prints the JSON response.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use sssonector::ipc::{send_request, IpcRequest};

#[derive(Parser, Debug)]
#[command(name = "sssonectorctl", about = "Control client for the sssonector daemon")]
struct Cli {
    /// Path to the daemon's IPC socket, `<state_dir>/sssonector.ipc`.
    #[arg(long)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Status,
    Metrics,
    Reload,
    Stop,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let request = match cli.command {
        Command::Status => IpcRequest::Status,
        Command::Metrics => IpcRequest::Metrics,
        Command::Reload => IpcRequest::Reload,
        Command::Stop => IpcRequest::Stop,
    };

    match rt.block_on(send_request(&cli.socket, request)) {
        Ok(response) => {
            match serde_json::to_string_pretty(&response) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{response:?}"),
            }
            if response.ok {
                std::process::ExitCode::from(0)
            } else {
                std::process::ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("failed to reach daemon at {}: {e}", cli.socket.display());
            std::process::ExitCode::from(2)
        }
    }
}
