// SPDX-License-Identifier: MIT
//! Structured logging setup and the startup-phase JSONL log (Design
//! Notes "Startup phase log", §6 "Persisted state").
//!
//! `tracing` + `tracing-subscriber` with the `json` feature, matching
//! the teacher crate's own logging stack.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, SsError};

/// Installs a global `tracing` subscriber. `format` is `"json"` or
/// `"text"` per §6's `logging.format` field.
pub fn init(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

/// Strict ordered phase set the engine must not skip or reorder
/// (Design Notes "Startup phase log").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    PreStartup = 0,
    Initialization = 1,
    Connection = 2,
    Listen = 3,
}

#[derive(Debug, Serialize)]
pub struct StartupEvent {
    pub phase: &'static str,
    pub component: String,
    pub operation: String,
    pub details: String,
    pub duration_ms: u64,
    pub status: &'static str,
    pub error: Option<String>,
    pub timestamp: u64,
}

fn phase_name(p: Phase) -> &'static str {
    match p {
        Phase::PreStartup => "PreStartup",
        Phase::Initialization => "Initialization",
        Phase::Connection => "Connection",
        Phase::Listen => "Listen",
    }
}

/// Appends `StartupEvent` records to `<log_dir>/startup.log` and refuses
/// out-of-order phase transitions (Design Notes).
pub struct StartupLog {
    file: Mutex<std::fs::File>,
    last_phase: Mutex<Option<Phase>>,
    allow_listen: bool,
}

impl StartupLog {
    pub fn open(log_dir: &Path, allow_listen: bool) -> Result<Self> {
        std::fs::create_dir_all(log_dir).map_err(SsError::Io)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("startup.log"))
            .map_err(SsError::Io)?;
        Ok(StartupLog {
            file: Mutex::new(file),
            last_phase: Mutex::new(None),
            allow_listen,
        })
    }

    /// Record one startup event, rejecting transitions that would move
    /// backward in the strict phase order, or step into `Listen` on a
    /// client endpoint (Design Notes: "server only" phase).
    pub fn record(
        &self,
        phase: Phase,
        component: &str,
        operation: &str,
        details: &str,
        started: Instant,
        result: std::result::Result<(), &str>,
    ) -> Result<()> {
        if phase == Phase::Listen && !self.allow_listen {
            return Err(SsError::ConfigInvalid {
                reason: "Listen phase is server-only".into(),
            });
        }

        {
            let mut last = self.last_phase.lock().unwrap();
            if let Some(prev) = *last {
                if phase < prev {
                    return Err(SsError::ConfigInvalid {
                        reason: format!(
                            "startup phase out of order: {:?} after {:?}",
                            phase, prev
                        ),
                    });
                }
            }
            *last = Some(phase);
        }

        let event = StartupEvent {
            phase: phase_name(phase),
            component: component.to_string(),
            operation: operation.to_string(),
            details: details.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            status: if result.is_ok() { "ok" } else { "error" },
            error: result.err().map(|s| s.to_string()),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs(),
        };

        let line = serde_json::to_string(&event).map_err(|e| SsError::ConfigInvalid {
            reason: format!("failed to serialize startup event: {e}"),
        })?;
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}").map_err(SsError::Io)?;
        Ok(())
    }
}
