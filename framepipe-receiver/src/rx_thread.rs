// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receiver I/O thread. A calloop event loop owns the receive sockets and
//! multiplexes them with the controller's command channel and a periodic
//! tick that drives the decoder's buffer monitor. Completed frames are
//! reported back to the controller as events.

use crate::config::{ReceiverConfig, RxType};
use crate::decoder::{DecoderInstance, DecoderStatus, FrameReceiveState};
use calloop::channel::{channel, Event as ChannelEvent, Sender as LoopSender};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction};
use crossbeam_channel::Sender;
use framepipe_common::error::ConfigError;
use nix::sys::socket::{recv, recvmsg, setsockopt, sockopt, MsgFlags, SockaddrStorage};
use std::io::IoSliceMut;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Commands from the controller to the I/O thread.
#[derive(Debug)]
pub enum RxCommand {
    Precharge {
        start_buffer_id: usize,
        num_buffers: usize,
    },
    ReleaseBuffer {
        buffer_id: usize,
    },
    ResetStatistics,
    Stop,
}

/// Events from the I/O thread back to the controller.
#[derive(Debug)]
pub enum RxEvent {
    /// Announced once at startup; triggers the buffer precharge.
    Identity { thread_name: String },
    FrameReady { frame_number: u64, buffer_id: usize },
    Status(DecoderStatus),
}

pub struct RxThreadHandle {
    commands: LoopSender<RxCommand>,
    join: Option<JoinHandle<()>>,
}

impl RxThreadHandle {
    pub fn send(&self, command: RxCommand) {
        let _ = self.commands.send(command);
    }

    /// Stop the loop after the current packet and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.commands.send(RxCommand::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RxThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RxState {
    decoder: DecoderInstance,
    events: Sender<RxEvent>,
    stream_accum: Vec<u8>,
    stop: bool,
}

impl RxState {
    fn drain_ready(&mut self) {
        for (frame_number, buffer_id) in
            self.decoder.as_decoder_mut().core_mut().take_ready_frames()
        {
            debug!("frame {frame_number} ready in buffer {buffer_id}");
            let _ = self.events.send(RxEvent::FrameReady {
                frame_number,
                buffer_id,
            });
        }
    }
}

const TICK_PERIOD: Duration = Duration::from_millis(100);

/// Spawn the I/O thread for the configured transport. The decoder is moved
/// into the thread; it is rebuilt by the controller on reconfiguration.
pub fn start_rx_thread(
    config: &ReceiverConfig,
    decoder: DecoderInstance,
    events: Sender<RxEvent>,
) -> Result<RxThreadHandle, ConfigError> {
    let (cmd_tx, cmd_rx) = channel::<RxCommand>();
    let rx_type = config.rx_type;
    let address = config.rx_address.clone();
    let ports = config.rx_ports.clone();
    let recv_buffer_size = config.rx_recv_buffer_size;

    // Socket setup failures must be reported to the caller, so bind before
    // spawning the service thread.
    let mut udp_sockets = Vec::new();
    let mut listeners = Vec::new();
    match rx_type {
        RxType::Udp => {
            for port in &ports {
                let socket = UdpSocket::bind((address.as_str(), *port)).map_err(|e| {
                    ConfigError::new(format!("failed to bind receive socket on port {port}: {e}"))
                })?;
                socket.set_nonblocking(true)?;
                if let Err(e) = setsockopt(&socket, sockopt::RcvBuf, &recv_buffer_size) {
                    warn!("failed to set receive buffer size on port {port}: {e}");
                }
                info!("listening for frame data on udp port {port}");
                udp_sockets.push(socket);
            }
        }
        RxType::Tcp | RxType::Stream => {
            for port in &ports {
                let listener = TcpListener::bind((address.as_str(), *port)).map_err(|e| {
                    ConfigError::new(format!("failed to bind receive socket on port {port}: {e}"))
                })?;
                listener.set_nonblocking(true)?;
                info!("listening for frame data on tcp port {port}");
                listeners.push(listener);
            }
        }
    }

    let join = std::thread::Builder::new()
        .name("rx-thread".to_string())
        .spawn(move || {
            let mut event_loop: EventLoop<'static, RxState> = match EventLoop::try_new() {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    error!("failed to create rx event loop: {e}");
                    return;
                }
            };
            let handle = event_loop.handle();

            let mut state = RxState {
                decoder,
                events,
                stream_accum: Vec::new(),
                stop: false,
            };

            // Command channel from the controller
            if handle
                .insert_source(cmd_rx, |event, _, state: &mut RxState| {
                    if let ChannelEvent::Msg(command) = event {
                        handle_command(command, state);
                    }
                })
                .is_err()
            {
                error!("failed to register rx command channel");
                return;
            }

            // Periodic tick: buffer monitor plus status refresh
            if handle
                .insert_source(
                    Timer::from_duration(TICK_PERIOD),
                    |_, _, state: &mut RxState| {
                        state.decoder.as_decoder_mut().monitor_buffers();
                        state.drain_ready();
                        let status = state.decoder.as_decoder().core().status();
                        let _ = state.events.send(RxEvent::Status(status));
                        TimeoutAction::ToDuration(TICK_PERIOD)
                    },
                )
                .is_err()
            {
                error!("failed to register rx tick timer");
                return;
            }

            for socket in udp_sockets {
                if handle
                    .insert_source(
                        Generic::new(socket, Interest::READ, Mode::Level),
                        |_, socket, state: &mut RxState| {
                            handle_udp_readable(socket.as_ref(), state);
                            Ok(PostAction::Continue)
                        },
                    )
                    .is_err()
                {
                    error!("failed to register udp socket with reactor");
                    return;
                }
            }

            for listener in listeners {
                let accept_handle = handle.clone();
                if handle
                    .insert_source(
                        Generic::new(listener, Interest::READ, Mode::Level),
                        move |_, listener, _state: &mut RxState| {
                            accept_connections(listener.as_ref(), &accept_handle);
                            Ok(PostAction::Continue)
                        },
                    )
                    .is_err()
                {
                    error!("failed to register tcp listener with reactor");
                    return;
                }
            }

            let _ = state.events.send(RxEvent::Identity {
                thread_name: "rx-thread".to_string(),
            });

            info!("rx thread service running");
            while !state.stop {
                if let Err(e) = event_loop.dispatch(Some(TICK_PERIOD), &mut state) {
                    error!("rx event loop error: {e}");
                    break;
                }
            }
            info!("rx thread service exiting");
        })
        .map_err(|e| ConfigError::new(format!("failed to spawn rx thread: {e}")))?;

    Ok(RxThreadHandle {
        commands: cmd_tx,
        join: Some(join),
    })
}

fn handle_command(command: RxCommand, state: &mut RxState) {
    match command {
        RxCommand::Precharge {
            start_buffer_id,
            num_buffers,
        } => {
            let core = state.decoder.as_decoder_mut().core_mut();
            for buffer_id in start_buffer_id..start_buffer_id + num_buffers {
                core.push_empty_buffer(buffer_id);
            }
            info!("precharged {num_buffers} empty buffers from id {start_buffer_id}");
        }
        RxCommand::ReleaseBuffer { buffer_id } => {
            state
                .decoder
                .as_decoder_mut()
                .core_mut()
                .push_empty_buffer(buffer_id);
        }
        RxCommand::ResetStatistics => {
            state.decoder.as_decoder_mut().reset_statistics();
        }
        RxCommand::Stop => {
            state.stop = true;
        }
    }
}

/// Service one readable UDP socket: peek the packet header, let the decoder
/// choose the payload destination, then receive header and payload in one
/// scattered read so payload bytes are written once, in place.
fn handle_udp_readable(socket: &UdpSocket, state: &mut RxState) {
    let fd = socket.as_raw_fd();
    let mut completed = false;

    if let DecoderInstance::Udp(decoder) = &mut state.decoder {
        if decoder.requires_header_peek() {
            let (header_ptr, header_len) = decoder.packet_header_raw();
            // SAFETY: scratch header buffer owned by the decoder.
            let header_slice = unsafe { std::slice::from_raw_parts_mut(header_ptr, header_len) };
            let peeked = match recv(fd, header_slice, MsgFlags::MSG_PEEK) {
                Ok(n) => n,
                Err(nix::errno::Errno::EAGAIN) => return,
                Err(e) => {
                    warn!("udp header peek failed: {e}");
                    return;
                }
            };
            if let Err(e) = decoder.process_packet_header(peeked) {
                warn!("dropping packet: {e}");
                // Consume and discard the datagram the peek looked at
                let mut discard = [0u8; 64];
                let _ = recv(fd, &mut discard, MsgFlags::empty());
                return;
            }
        }

        let (header_ptr, header_len) = decoder.packet_header_raw();
        let (payload_ptr, payload_len) = decoder.next_payload();
        // SAFETY: both regions are owned by the decoder for the duration of
        // this call; the payload region was selected by process_packet_header.
        let bytes_received = unsafe {
            let mut iov = [
                IoSliceMut::new(std::slice::from_raw_parts_mut(header_ptr, header_len)),
                IoSliceMut::new(std::slice::from_raw_parts_mut(payload_ptr, payload_len)),
            ];
            match recvmsg::<SockaddrStorage>(fd, &mut iov, None, MsgFlags::empty()) {
                Ok(msg) => msg.bytes,
                Err(nix::errno::Errno::EAGAIN) => return,
                Err(e) => {
                    warn!("udp receive failed: {e}");
                    return;
                }
            }
        };

        completed = decoder.process_packet(bytes_received) == FrameReceiveState::Complete;
    }

    if completed {
        state.drain_ready();
    }
}

fn accept_connections(listener: &TcpListener, handle: &LoopHandle<'static, RxState>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("accepted frame data connection from {peer}");
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let result = handle.insert_source(
                    Generic::new(stream, Interest::READ, Mode::Level),
                    |_, stream, state: &mut RxState| {
                        Ok(handle_stream_readable(stream.as_ref().as_raw_fd(), state))
                    },
                );
                if result.is_err() {
                    warn!("failed to register accepted connection with reactor");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("accept failed on frame data socket: {e}");
                break;
            }
        }
    }
}

/// One read per readiness event; short reads return to the reactor so other
/// sockets are serviced between chunks.
fn handle_stream_readable(fd: RawFd, state: &mut RxState) -> PostAction {
    let mut completed = false;
    let action = match &mut state.decoder {
        DecoderInstance::Tcp(decoder) => {
            let (ptr, len) = match decoder.next_message_buffer() {
                Ok(target) => target,
                Err(e) => {
                    warn!("stream decode error: {e}");
                    return PostAction::Continue;
                }
            };
            // SAFETY: destination provided by the decoder for this read.
            let buf = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
            match recv(fd, buf, MsgFlags::empty()) {
                Ok(0) => {
                    info!("frame data connection closed");
                    PostAction::Remove
                }
                Ok(n) => {
                    completed = decoder.process_message(n) == FrameReceiveState::Complete;
                    PostAction::Continue
                }
                Err(nix::errno::Errno::EAGAIN) => PostAction::Continue,
                Err(e) => {
                    warn!("stream receive failed: {e}");
                    PostAction::Remove
                }
            }
        }
        DecoderInstance::Stream(_) => handle_framed_readable(fd, state, &mut completed),
        DecoderInstance::Udp(_) => PostAction::Remove,
    };

    if completed {
        state.drain_ready();
    }
    action
}

/// Framed-message transport: accumulate bytes and hand complete parts to
/// the decoder with the end-of-parts flag from the framing layer.
fn handle_framed_readable(fd: RawFd, state: &mut RxState, completed: &mut bool) -> PostAction {
    let mut chunk = [0u8; 65536];
    let n = match recv(fd, &mut chunk, MsgFlags::empty()) {
        Ok(0) => {
            info!("frame data connection closed");
            return PostAction::Remove;
        }
        Ok(n) => n,
        Err(nix::errno::Errno::EAGAIN) => return PostAction::Continue,
        Err(e) => {
            warn!("stream receive failed: {e}");
            return PostAction::Remove;
        }
    };
    state.stream_accum.extend_from_slice(&chunk[..n]);

    let DecoderInstance::Stream(decoder) = &mut state.decoder else {
        return PostAction::Remove;
    };
    let mut consumed_total = 0;
    while let Some((parts, consumed)) = try_parse_multipart(&state.stream_accum[consumed_total..]) {
        let count = parts.len();
        for (index, part) in parts.iter().enumerate() {
            if decoder.process_message(part, index + 1 == count) == FrameReceiveState::Complete {
                *completed = true;
            }
        }
        consumed_total += consumed;
    }
    state.stream_accum.drain(..consumed_total);
    PostAction::Continue
}

/// Parse one complete multipart frame, returning its parts and the bytes
/// consumed. Returns None while the frame is still partial.
fn try_parse_multipart(buf: &[u8]) -> Option<(Vec<Vec<u8>>, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
    if count == 0 || count > 16 {
        // Resynchronise by skipping the bogus count word
        return Some((Vec::new(), 4));
    }
    let mut offset = 4;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < offset + 4 {
            return None;
        }
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().ok()?) as usize;
        offset += 4;
        if buf.len() < offset + len {
            return None;
        }
        parts.push(buf[offset..offset + len].to_vec());
        offset += len;
    }
    Some((parts, offset))
}
