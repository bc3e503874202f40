// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;

/// Target used for per-packet audit records when packet logging is enabled.
pub const PACKET_TARGET: &str = "packet";

/// Map the numeric `--debug-level` option onto a tracing filter directive.
///
/// Level 0 keeps warnings and errors, 1 adds info, 2 adds debug and
/// anything higher enables trace output.
pub fn filter_for_debug_level(debug_level: u32) -> EnvFilter {
    // RUST_LOG always wins over the command line option
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive_for_debug_level(debug_level)))
}

fn directive_for_debug_level(debug_level: u32) -> &'static str {
    match debug_level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the process-wide subscriber. Called once from each binary's main.
pub fn init(debug_level: u32) {
    let filter = filter_for_debug_level(debug_level);
    fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .init();
}
