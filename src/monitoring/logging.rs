// Copyright (c) 2026 Meshnet
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Logging setup driven by environment variables:
//!
//! - `MESH_LOGLEVEL`: error | warn | info | debug | trace (default info)
//! - `MESH_COLORS`: false disables ANSI colors
//! - `MESH_ALWAYS_LOG_CALLER`: true adds target, file and line to every event
//! - `MESH_LOG_JSON`: true switches to JSON output

use tracing::Level;

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_level() -> Level {
    match std::env::var("MESH_LOGLEVEL")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init_logging() {
    let level = env_level();
    let colors = env_flag("MESH_COLORS", true);
    let caller = env_flag("MESH_ALWAYS_LOG_CALLER", false);

    if env_flag("MESH_LOG_JSON", false) {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_target(true)
            .with_file(caller)
            .with_line_number(caller)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(colors)
            .with_target(caller)
            .with_file(caller)
            .with_line_number(caller)
            .with_level(true)
            .compact()
            .try_init();
    }
}
