// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame receiver application: binds the control plane, builds the shared
//! buffer arena and decoder from configuration, and serves the reassembly
//! pipeline until shutdown.

use anyhow::{bail, Context};
use clap::Parser;
use framepipe_ipc::{IpcMessage, MsgType, MsgVal};
use framepipe_receiver::config::{
    CONFIG_CTRL_ENDPOINT, CONFIG_FRAME_READY_ENDPOINT, CONFIG_FRAME_RELEASE_ENDPOINT,
    CONFIG_RX_ENDPOINT,
};
use framepipe_receiver::ReceiverController;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "frame_receiver", version, about = "Detector frame receiver")]
struct Options {
    /// Set the runtime verbosity level
    #[arg(short = 'd', long = "debug-level", default_value_t = 0)]
    debug_level: u32,

    /// Load logger configuration from a file
    #[arg(short = 'l', long = "log-config")]
    log_config: Option<PathBuf>,

    /// Number of IPC worker threads
    #[arg(long = "io-threads", default_value_t = 1)]
    io_threads: usize,

    /// Bind the control channel to this endpoint
    #[arg(long = "ctrl", default_value = "tcp://0.0.0.0:5000")]
    ctrl: String,

    /// Endpoint for the internal rx thread channel
    #[arg(long = "rx-endpoint", default_value = "inproc://rx_channel")]
    rx_endpoint: String,

    /// Bind the frame ready notification channel to this endpoint
    #[arg(long = "frame-ready-endpoint", default_value = "tcp://0.0.0.0:5001")]
    frame_ready_endpoint: String,

    /// Bind the frame release channel to this endpoint
    #[arg(long = "frame-release-endpoint", default_value = "tcp://0.0.0.0:5002")]
    frame_release_endpoint: String,

    /// Apply a JSON configuration file (object or array of objects) at startup
    #[arg(short = 'c', long = "config", alias = "json")]
    config: Option<PathBuf>,
}

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn request_shutdown(_signum: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::Release);
    }
}

fn install_shutdown_handlers(flag: Arc<AtomicBool>) {
    let _ = SHUTDOWN.set(flag);
    // SAFETY: handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
    }
}

fn run(options: Options) -> anyhow::Result<()> {
    let mut controller = ReceiverController::new(options.io_threads);
    install_shutdown_handlers(controller.shutdown_flag());

    // Channel bindings from the command line form the initial configuration
    let mut initial = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
    initial.set_param(CONFIG_CTRL_ENDPOINT, json!(options.ctrl));
    initial.set_param(CONFIG_RX_ENDPOINT, json!(options.rx_endpoint));
    initial.set_param(CONFIG_FRAME_READY_ENDPOINT, json!(options.frame_ready_endpoint));
    initial.set_param(
        CONFIG_FRAME_RELEASE_ENDPOINT,
        json!(options.frame_release_endpoint),
    );
    controller
        .configure(&initial)
        .map_err(|e| anyhow::anyhow!("startup configuration failed: {e}"))?;

    if let Some(path) = &options.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        let entries: Vec<Value> = match parsed {
            Value::Array(entries) => entries,
            object @ Value::Object(_) => vec![object],
            _ => bail!("config file must contain a JSON object or array"),
        };
        for params in entries {
            let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
            msg.params = params;
            controller
                .configure(&msg)
                .map_err(|e| anyhow::anyhow!("config file entry rejected: {e}"))?;
        }
        info!("applied configuration from {}", path.display());
    }

    controller.run();
    Ok(())
}

fn main() {
    let options = Options::parse();
    if let Some(path) = &options.log_config {
        // Logger config files carry filter directives, one per line
        if let Ok(text) = std::fs::read_to_string(path) {
            let directives: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            std::env::set_var("RUST_LOG", directives.join(","));
        }
    }
    framepipe_common::logging::init(options.debug_level);
    framepipe_common::signals::install_fatal_handlers();

    info!("frame receiver starting");
    if let Err(e) = run(options) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
