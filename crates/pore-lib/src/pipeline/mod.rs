//! Out-of-process event detection with periodic, coalesced delivery.
//!
//! A `PipelineRun` owns one detector process. A relay thread decodes the
//! process's output into a bounded mailbox; the coordinator drains that
//! mailbox on each `tick`, delivering at most one status update and one
//! events batch per tick, and exactly one `Done` at the end of the run.

mod message;
mod process;
mod relay;

pub use message::{decode_line, encode_line, Message, WorkerRequest};
pub use process::WorkerCommand;
pub use relay::StreamEnd;

use crate::params::DetectionConfig;
use crate::signal::EventRecord;
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use log::{debug, info, warn};
use relay::RelayEvent;
use serde::Serialize;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to launch detector {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run already started")]
    AlreadyStarted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encoding worker request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Interval between drain ticks when driven by `drive`.
    pub tick_period: Duration,
    /// How long a terminated worker gets before it is killed.
    pub terminate_grace: Duration,
    pub mailbox_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(500),
            terminate_grace: Duration::from_secs(2),
            mailbox_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Cancelling,
    Cancelled,
    Draining,
    Completed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Cancelled | RunState::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// The detector exited abnormally or its stream could not be read.
    WorkerFailed {
        exit_code: Option<i32>,
        stream_error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Finished,
}

/// Requests cancellation of a run from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Only raises the flag; the next tick terminates the worker and delivers `Done`.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct PipelineRun {
    state: RunState,
    options: PipelineOptions,
    child: Option<Child>,
    mailbox: Option<Receiver<RelayEvent>>,
    relay: Option<JoinHandle<()>>,
    pending_status: String,
    pending_events: Vec<EventRecord>,
    stop_requested: Arc<AtomicBool>,
    finished: bool,
    stream_end: Option<StreamEnd>,
    exit_status: Option<ExitStatus>,
    /// Escalation step for a worker that closed its stream but keeps running.
    linger: Option<Linger>,
}

#[derive(Debug, Clone, Copy)]
enum Linger {
    /// Waiting for a voluntary exit until the deadline.
    Waiting(Instant),
    /// SIGTERM sent; killed at the deadline.
    Signalled(Instant),
}

impl PipelineRun {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            state: RunState::Idle,
            options,
            child: None,
            mailbox: None,
            relay: None,
            pending_status: String::new(),
            pending_events: Vec::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            finished: false,
            stream_end: None,
            exit_status: None,
            linger: None,
        }
    }

    /// Create a run and start it in one step.
    pub fn spawn(
        command: &WorkerCommand,
        filenames: &[PathBuf],
        config: &DetectionConfig,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let mut run = Self::new(options);
        run.start(command, filenames, config)?;
        Ok(run)
    }

    /// Launch the detector for `filenames` and begin relaying its output.
    pub fn start(
        &mut self,
        command: &WorkerCommand,
        filenames: &[PathBuf],
        config: &DetectionConfig,
    ) -> Result<(), PipelineError> {
        if self.state != RunState::Idle {
            return Err(PipelineError::AlreadyStarted);
        }
        let request = WorkerRequest {
            filenames: filenames.to_vec(),
            config: *config,
        };
        let (mut child, stdout) = process::spawn(command, &request)?;
        let (tx, rx) = bounded(self.options.mailbox_capacity.max(1));
        let relay = match relay::spawn_relay(stdout, tx) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = process::terminate(&mut child, self.options.terminate_grace);
                return Err(err.into());
            }
        };
        self.child = Some(child);
        self.mailbox = Some(rx);
        self.relay = Some(relay);
        self.state = RunState::Running;
        Ok(())
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.stop_requested))
    }

    pub fn cancel(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Exit status of the reaped worker, once the run is terminal.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Final classification of the run; `None` until `Done` has been delivered.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.state {
            RunState::Cancelled => Some(RunOutcome::Cancelled),
            RunState::Completed => {
                let stream_error = match &self.stream_end {
                    Some(StreamEnd::TransportError(err)) => Some(err.clone()),
                    _ => None,
                };
                let exited_cleanly = self.exit_status.map_or(true, |s| s.success());
                if stream_error.is_none() && exited_cleanly {
                    Some(RunOutcome::Completed)
                } else {
                    Some(RunOutcome::WorkerFailed {
                        exit_code: self.exit_status.and_then(|s| s.code()),
                        stream_error,
                    })
                }
            }
            _ => None,
        }
    }

    /// One drain step. Delivers buffered status, then buffered events, then `Done` if the run ends.
    pub fn tick(&mut self, deliver: &mut dyn FnMut(Message)) -> TickOutcome {
        if self.state.is_terminal() {
            return TickOutcome::Finished;
        }
        self.drain_mailbox();

        if !self.pending_status.is_empty() {
            deliver(Message::StatusUpdate(std::mem::take(&mut self.pending_status)));
        }
        if !self.pending_events.is_empty() {
            deliver(Message::EventsBatch(std::mem::take(&mut self.pending_events)));
        }

        if self.stop_requested.load(Ordering::SeqCst) {
            self.state = RunState::Cancelling;
            self.shutdown_worker();
            self.state = RunState::Cancelled;
            info!("Detection cancelled");
            deliver(Message::Done);
            return TickOutcome::Finished;
        }
        if self.finished {
            self.state = RunState::Draining;
            if !self.poll_worker() {
                return TickOutcome::Continue;
            }
            self.release_relay(Duration::ZERO);
            self.state = RunState::Completed;
            info!("Detection finished: {:?}", self.outcome());
            deliver(Message::Done);
            return TickOutcome::Finished;
        }
        TickOutcome::Continue
    }

    /// Tick on `tick_period` from the calling thread until `Done` has been delivered.
    pub fn drive(mut self, mut deliver: impl FnMut(Message)) -> RunOutcome {
        while self.tick(&mut deliver) == TickOutcome::Continue {
            std::thread::sleep(self.options.tick_period);
        }
        self.outcome().unwrap_or(RunOutcome::Cancelled)
    }

    fn drain_mailbox(&mut self) {
        let Some(mailbox) = &self.mailbox else {
            return;
        };
        loop {
            match mailbox.try_recv() {
                Ok(RelayEvent::Message(Message::StatusUpdate(text))) => self.pending_status = text,
                Ok(RelayEvent::Message(Message::EventsBatch(events))) => {
                    self.pending_events.extend(events)
                }
                Ok(RelayEvent::Message(Message::Done)) => {}
                Ok(RelayEvent::Closed(end)) => {
                    self.finished = true;
                    self.stream_end = Some(end);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.finished {
                        self.finished = true;
                        self.stream_end = Some(StreamEnd::TransportError(
                            "relay stopped without closing the stream".into(),
                        ));
                    }
                    break;
                }
            }
        }
    }

    fn shutdown_worker(&mut self) {
        if let Some(mut child) = self.child.take() {
            match process::terminate(&mut child, self.options.terminate_grace) {
                Ok(status) => self.exit_status = Some(status),
                Err(err) => warn!("failed to terminate detector: {}", err),
            }
        }
        self.release_relay(Duration::from_millis(200));
    }

    /// Check whether a worker whose stream ended has exited, without blocking.
    ///
    /// A lingering worker gets `terminate_grace`, then SIGTERM, then another
    /// `terminate_grace` before it is killed; each step happens on a later tick.
    fn poll_worker(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("detector exited: {}", status);
                self.exit_status = Some(status);
                self.child = None;
                return true;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("failed to poll detector: {}", err);
                self.child = None;
                return true;
            }
        }
        let now = Instant::now();
        let grace = self.options.terminate_grace;
        match self.linger {
            None => self.linger = Some(Linger::Waiting(now + grace)),
            Some(Linger::Waiting(deadline)) if now >= deadline => {
                warn!(
                    "detector {} closed its stream but is still running; terminating",
                    child.id()
                );
                process::request_stop(child);
                self.linger = Some(Linger::Signalled(now + grace));
            }
            Some(Linger::Signalled(deadline)) if now >= deadline => {
                warn!("detector {} ignored termination; killing", child.id());
                match process::kill(child) {
                    Ok(status) => self.exit_status = Some(status),
                    Err(err) => warn!("failed to kill detector: {}", err),
                }
                self.child = None;
                return true;
            }
            Some(_) => {}
        }
        false
    }

    /// Drop the mailbox so a relay blocked on a full mailbox wakes up, then
    /// join it if it exits within `wait`.
    fn release_relay(&mut self, wait: Duration) {
        self.mailbox = None;
        if let Some(handle) = self.relay.take() {
            let deadline = Instant::now() + wait;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // something else still holds the write end of the pipe
                debug!("relay still reading; detaching it");
            }
        }
    }
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        if !self.state.is_terminal() && self.child.is_some() {
            debug!("dropping a live run; terminating its detector");
            self.shutdown_worker();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::params::{validate, RawParameters};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    fn config() -> DetectionConfig {
        validate(&RawParameters::default()).unwrap()
    }

    fn fast() -> PipelineOptions {
        PipelineOptions {
            tick_period: Duration::from_millis(20),
            terminate_grace: Duration::from_secs(2),
            mailbox_capacity: 4,
        }
    }

    fn event(level: f64) -> EventRecord {
        EventRecord {
            array_row: 0,
            event_length: 2,
            raw_points_per_side: 1,
            baseline: 1.0,
            n_levels: 1,
            raw_data: vec![1.0, level, level, 1.0],
            levels: vec![level],
            level_lengths: vec![2],
        }
    }

    /// Shell line printing one message verbatim.
    fn emit(message: &Message) -> String {
        format!("printf '%s\\n' '{}'", serde_json::to_string(message).unwrap())
    }

    fn done_count(messages: &[Message]) -> usize {
        messages.iter().filter(|m| **m == Message::Done).count()
    }

    fn event_total(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| match m {
                Message::EventsBatch(batch) => batch.len(),
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn two_file_run_delivers_status_events_then_done() {
        let events: Vec<EventRecord> = (1..=5).map(|i| event(i as f64 / 10.0)).collect();
        let script = [
            "cat > /dev/null".to_string(),
            emit(&Message::StatusUpdate("5 events".into())),
            emit(&Message::EventsBatch(events)),
        ]
        .join("; ");
        let files = vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")];
        let run = PipelineRun::spawn(&sh(&script), &files, &config(), fast()).unwrap();

        let mut delivered = Vec::new();
        let outcome = run.drive(|m| delivered.push(m));
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(event_total(&delivered), 5);
        let last_status = delivered.iter().rev().find_map(|m| match m {
            Message::StatusUpdate(s) => Some(s.clone()),
            _ => None,
        });
        assert_eq!(last_status.as_deref(), Some("5 events"));
        assert_eq!(delivered.last(), Some(&Message::Done));
        assert_eq!(done_count(&delivered), 1);
    }

    #[test]
    fn status_is_last_write_wins_within_a_tick() {
        let script = [
            emit(&Message::StatusUpdate("first".into())),
            emit(&Message::StatusUpdate("second".into())),
            emit(&Message::EventsBatch(vec![event(0.5)])),
            emit(&Message::StatusUpdate("third".into())),
        ]
        .join("; ");
        let mut run =
            PipelineRun::spawn(&sh(&script), &[], &config(), PipelineOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(800));

        let mut delivered = Vec::new();
        assert_eq!(run.tick(&mut |m| delivered.push(m)), TickOutcome::Finished);
        assert_eq!(
            delivered,
            vec![
                Message::StatusUpdate("third".into()),
                Message::EventsBatch(vec![event(0.5)]),
                Message::Done,
            ]
        );
        // nothing follows Done
        assert_eq!(run.tick(&mut |m| delivered.push(m)), TickOutcome::Finished);
        assert_eq!(delivered.len(), 3);
    }

    #[test]
    fn cancel_before_any_message() {
        let mut run =
            PipelineRun::spawn(&sh("exec sleep 30"), &[], &config(), fast()).unwrap();
        run.cancel();
        let started = Instant::now();
        let mut delivered = Vec::new();
        assert_eq!(run.tick(&mut |m| delivered.push(m)), TickOutcome::Finished);
        assert_eq!(delivered, vec![Message::Done]);
        assert_eq!(run.state(), RunState::Cancelled);
        assert_eq!(run.outcome(), Some(RunOutcome::Cancelled));
        let status = run.exit_status().expect("worker reaped");
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_from_another_thread() {
        let script = format!(
            "{}; exec sleep 30",
            emit(&Message::StatusUpdate("working".into()))
        );
        let run = PipelineRun::spawn(&sh(&script), &[], &config(), fast()).unwrap();
        let handle = run.cancel_handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            handle.cancel();
        });
        let mut delivered = Vec::new();
        let outcome = run.drive(|m| delivered.push(m));
        canceller.join().unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(delivered.last(), Some(&Message::Done));
        assert_eq!(done_count(&delivered), 1);
    }

    #[test]
    fn coalescing_is_lossless() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..3 {
            let mut lines = Vec::new();
            let mut expected = 0;
            for _ in 0..rng.gen_range(1..12) {
                let size = rng.gen_range(0..9);
                expected += size;
                let batch: Vec<EventRecord> = (0..size).map(|i| event(i as f64)).collect();
                lines.push(emit(&Message::EventsBatch(batch)));
                if rng.gen_bool(0.3) {
                    lines.push(format!("sleep 0.0{}", rng.gen_range(1..5)));
                }
                if rng.gen_bool(0.5) {
                    lines.push(emit(&Message::StatusUpdate(format!("{} so far", expected))));
                }
            }
            let run = PipelineRun::spawn(&sh(&lines.join("; ")), &[], &config(), fast()).unwrap();
            let mut delivered = Vec::new();
            assert_eq!(run.drive(|m| delivered.push(m)), RunOutcome::Completed);
            assert_eq!(event_total(&delivered), expected);
            assert_eq!(done_count(&delivered), 1);
            assert_eq!(delivered.last(), Some(&Message::Done));
        }
    }

    #[test]
    fn done_from_the_wire_is_ignored() {
        let script = [
            emit(&Message::Done),
            emit(&Message::StatusUpdate("after".into())),
        ]
        .join("; ");
        let run = PipelineRun::spawn(&sh(&script), &[], &config(), fast()).unwrap();
        let mut delivered = Vec::new();
        run.drive(|m| delivered.push(m));
        assert_eq!(
            delivered,
            vec![Message::StatusUpdate("after".into()), Message::Done]
        );
    }

    #[test]
    fn abnormal_exit_is_reported() {
        let script = format!("{}; exit 3", emit(&Message::StatusUpdate("oops".into())));
        let run = PipelineRun::spawn(&sh(&script), &[], &config(), fast()).unwrap();
        let mut delivered = Vec::new();
        let outcome = run.drive(|m| delivered.push(m));
        assert_eq!(
            outcome,
            RunOutcome::WorkerFailed {
                exit_code: Some(3),
                stream_error: None
            }
        );
        assert_eq!(done_count(&delivered), 1);
    }

    #[test]
    fn garbage_on_the_stream_is_reported() {
        let run = PipelineRun::spawn(&sh("echo 'not json'"), &[], &config(), fast()).unwrap();
        let mut delivered = Vec::new();
        match run.drive(|m| delivered.push(m)) {
            RunOutcome::WorkerFailed { stream_error, .. } => assert!(stream_error.is_some()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(delivered, vec![Message::Done]);
    }

    #[test]
    fn second_start_is_rejected() {
        let mut run = PipelineRun::spawn(&sh("exit 0"), &[], &config(), fast()).unwrap();
        assert!(matches!(
            run.start(&sh("exit 0"), &[], &config()),
            Err(PipelineError::AlreadyStarted)
        ));
    }

    /// Tick until `Finished`, returning the slowest single tick.
    fn tick_to_end(run: &mut PipelineRun, delivered: &mut Vec<Message>) -> Duration {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut slowest = Duration::ZERO;
        loop {
            let started = Instant::now();
            let outcome = run.tick(&mut |m| delivered.push(m));
            slowest = slowest.max(started.elapsed());
            if outcome == TickOutcome::Finished {
                return slowest;
            }
            assert!(Instant::now() < deadline, "run never finished");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn lingering_worker_never_blocks_a_tick() {
        let options = PipelineOptions {
            terminate_grace: Duration::from_millis(300),
            ..fast()
        };
        let script = format!(
            "{}; exec >&-; trap '' TERM; exec sleep 30",
            emit(&Message::StatusUpdate("closing".into()))
        );
        let mut run = PipelineRun::spawn(&sh(&script), &[], &config(), options).unwrap();
        let mut delivered = Vec::new();
        let slowest = tick_to_end(&mut run, &mut delivered);
        assert!(slowest < Duration::from_millis(250), "slowest tick {:?}", slowest);
        assert_eq!(run.state(), RunState::Completed);
        assert_eq!(
            run.outcome(),
            Some(RunOutcome::WorkerFailed {
                exit_code: None,
                stream_error: None
            })
        );
        assert_eq!(done_count(&delivered), 1);
        assert_eq!(delivered.last(), Some(&Message::Done));
    }

    #[test]
    fn cancel_wins_over_a_finished_stream() {
        let script = format!(
            "{}; exec >&-; exec sleep 30",
            emit(&Message::StatusUpdate("closing".into()))
        );
        let mut run = PipelineRun::spawn(&sh(&script), &[], &config(), fast()).unwrap();
        let mut delivered = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while run.state() != RunState::Draining {
            assert_eq!(run.tick(&mut |m| delivered.push(m)), TickOutcome::Continue);
            assert!(Instant::now() < deadline, "stream never closed");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(run.finished);

        run.cancel();
        assert_eq!(run.tick(&mut |m| delivered.push(m)), TickOutcome::Finished);
        assert_eq!(run.state(), RunState::Cancelled);
        assert_eq!(run.outcome(), Some(RunOutcome::Cancelled));
        assert_eq!(done_count(&delivered), 1);
        assert_eq!(delivered.last(), Some(&Message::Done));
        assert!(run.exit_status().is_some());
    }

    #[test]
    fn dropping_a_live_run_kills_its_worker() {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let run = PipelineRun::spawn(&sh("exec sleep 30"), &[], &config(), fast()).unwrap();
        let pid = Pid::from_raw(run.child.as_ref().unwrap().id() as i32);
        assert_eq!(kill(pid, None), Ok(()));
        drop(run);
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn idle_run_never_spawned() {
        let run = PipelineRun::new(fast());
        assert_eq!(run.state(), RunState::Idle);
        assert_eq!(run.outcome(), None);
    }
}
