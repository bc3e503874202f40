// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watchdog for container-library calls that can block. Arming the timer
//! before a call schedules an error callback on a dedicated thread; if the
//! call has not finished when the threshold expires the callback fires
//! while the call continues. Finishing the timer reports the elapsed time
//! for the duration aggregates.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fraction of the error threshold above which a completed call is logged
/// as a warning.
const WARNING_DURATION_FRACTION: f64 = 0.1;

pub type TimeoutCallback = Box<dyn Fn(String) + Send>;

enum WatchdogCmd {
    Arm {
        id: u64,
        function_name: String,
        deadline: Instant,
    },
    Disarm {
        id: u64,
    },
    Shutdown,
}

struct ActiveCall {
    id: u64,
    function_name: String,
    started: Instant,
    timeout_ms: u64,
}

pub struct WatchdogTimer {
    tx: Sender<WatchdogCmd>,
    worker: Option<JoinHandle<()>>,
    active: Mutex<Option<ActiveCall>>,
    next_id: Mutex<u64>,
}

impl WatchdogTimer {
    pub fn new(timeout_callback: TimeoutCallback) -> WatchdogTimer {
        let (tx, rx) = unbounded::<WatchdogCmd>();
        let worker = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                let mut armed: Option<(u64, String, Instant)> = None;
                loop {
                    let wait = match &armed {
                        Some((_, _, deadline)) => {
                            deadline.saturating_duration_since(Instant::now())
                        }
                        None => Duration::from_secs(3600),
                    };
                    match rx.recv_timeout(wait) {
                        Ok(WatchdogCmd::Arm {
                            id,
                            function_name,
                            deadline,
                        }) => {
                            armed = Some((id, function_name, deadline));
                        }
                        Ok(WatchdogCmd::Disarm { id }) => {
                            if armed.as_ref().is_some_and(|(armed_id, _, _)| *armed_id == id) {
                                armed = None;
                            }
                        }
                        Ok(WatchdogCmd::Shutdown) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Some((_, function_name, deadline)) = armed.take() {
                                if Instant::now() >= deadline {
                                    timeout_callback(format!(
                                        "{function_name} | Watchdog timed out"
                                    ));
                                }
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn watchdog thread");
        WatchdogTimer {
            tx,
            worker: Some(worker),
            active: Mutex::new(None),
            next_id: Mutex::new(0),
        }
    }

    /// Arm the watchdog ahead of a call. A zero threshold records the
    /// duration without scheduling the callback.
    pub fn start_timer(&self, function_name: &str, watchdog_timeout_ms: u64) {
        let id = {
            let mut next_id = self.next_id.lock().expect("watchdog id poisoned");
            *next_id += 1;
            *next_id
        };
        let started = Instant::now();
        if watchdog_timeout_ms > 0 {
            debug!("{function_name} | Registering {watchdog_timeout_ms}ms watchdog timer");
            let _ = self.tx.send(WatchdogCmd::Arm {
                id,
                function_name: function_name.to_string(),
                deadline: started + Duration::from_millis(watchdog_timeout_ms),
            });
        }
        *self.active.lock().expect("watchdog state poisoned") = Some(ActiveCall {
            id,
            function_name: function_name.to_string(),
            started,
            timeout_ms: watchdog_timeout_ms,
        });
    }

    /// Disarm after the call returns; yields the duration in microseconds.
    pub fn finish_timer(&self) -> u64 {
        let call = self
            .active
            .lock()
            .expect("watchdog state poisoned")
            .take();
        let Some(call) = call else {
            return 0;
        };
        let _ = self.tx.send(WatchdogCmd::Disarm { id: call.id });
        let duration_us = call.started.elapsed().as_micros() as u64;
        let duration_ms = duration_us as f64 / 1000.0;
        if call.timeout_ms > 0
            && duration_ms > call.timeout_ms as f64 * WARNING_DURATION_FRACTION
        {
            warn!("{} | Call took {duration_us}us", call.function_name);
        } else {
            debug!("{} | Call took {duration_us}us", call.function_name);
        }
        duration_us
    }
}

impl Drop for WatchdogTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(WatchdogCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded as channel;

    #[test]
    fn fires_on_slow_call() {
        let (tx, rx) = channel();
        let watchdog = WatchdogTimer::new(Box::new(move |msg| {
            let _ = tx.send(msg);
        }));
        watchdog.start_timer("slow_call", 20);
        std::thread::sleep(Duration::from_millis(100));
        let msg = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("watchdog did not fire");
        assert!(msg.contains("slow_call"));
        assert!(msg.contains("timed out"));
        // The call eventually finishes and the duration is still reported
        let duration = watchdog.finish_timer();
        assert!(duration >= 100_000);
    }

    #[test]
    fn does_not_fire_on_fast_call() {
        let (tx, rx) = channel();
        let watchdog = WatchdogTimer::new(Box::new(move |msg| {
            let _ = tx.send(msg);
        }));
        watchdog.start_timer("fast_call", 500);
        let duration = watchdog.finish_timer();
        assert!(duration < 500_000);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn zero_threshold_never_arms() {
        let (tx, rx) = channel();
        let watchdog = WatchdogTimer::new(Box::new(move |msg| {
            let _ = tx.send(msg);
        }));
        watchdog.start_timer("untimed_call", 0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(watchdog.finish_timer() >= 20_000);
        assert!(rx.try_recv().is_err());
    }
}
