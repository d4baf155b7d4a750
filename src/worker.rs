//! Background thread owning a device session.
//!
//! The worker takes the [`Isx3`] session by value, so the transport and the
//! configuration are never shared. Callers talk to it through a command
//! channel and receive one event per record, per finished sweep and per
//! completed command. Configuration changes sent during a sweep wait in the
//! channel until the sweep is over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{ElectrodeCombination, SetupRequest};
use crate::errors::{DriverError, Result};
use crate::isx3::Isx3;
use crate::sweep::{MeasurementRecord, SweepResult};

/// Granularity of the cancel check while waiting between repetitions.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// How long a sweep command keeps starting new sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Exactly this many sweeps.
    Count(u32),
    /// New sweeps start until this much time has passed since the first one.
    For(Duration),
}

impl Repeat {
    fn check(self) -> Result<()> {
        match self {
            Repeat::Count(0) => Err(DriverError::config(
                "repetitions",
                "a sweep command needs at least one repetition",
            )),
            Repeat::For(d) if d.is_zero() => Err(DriverError::config(
                "duration",
                "a timed sweep command needs a non-zero duration",
            )),
            _ => Ok(()),
        }
    }

    fn allows(self, started: u32, since: Instant) -> bool {
        match self {
            Repeat::Count(n) => started < n,
            Repeat::For(d) => started == 0 || since.elapsed() < d,
        }
    }
}

#[derive(Debug)]
pub enum WorkerCommand {
    /// Apply a setup request and send it to the device.
    Configure(SetupRequest),
    /// Run sweeps `interval` apart, numbered from `first_index`.
    Sweep {
        first_index: u64,
        repeat: Repeat,
        interval: Duration,
    },
    Restart,
    Shutdown,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Configured,
    Record {
        measurement_index: u64,
        record: MeasurementRecord,
    },
    /// One sweep with the frequency and electrode axes read back after it.
    SweepFinished {
        measurement_index: u64,
        result: SweepResult,
        frequencies: Vec<f32>,
        electrodes: Vec<ElectrodeCombination>,
    },
    /// Every sweep of a command ran; carries the next unused index.
    Completed { next_index: u64 },
    /// A sweep command stopped early on request; carries the next unused index.
    Cancelled { next_index: u64 },
    Restarted,
    Failed(DriverError),
}

/// A command with the cancel flag that was current when it was sent.
struct Queued {
    command: WorkerCommand,
    cancel: Arc<AtomicBool>,
}

/// Handle on the worker thread.
pub struct SweepWorker {
    commands: Sender<Queued>,
    events: Receiver<WorkerEvent>,
    cancel: Mutex<Arc<AtomicBool>>,
    shutting_down: Arc<AtomicBool>,
    handle: Option<JoinHandle<Isx3>>,
}

impl SweepWorker {
    pub fn spawn(device: Isx3) -> Self {
        let (commands, command_rx) = mpsc::channel();
        let (event_tx, events) = mpsc::channel();
        let shutting_down = Arc::new(AtomicBool::new(false));
        let stopping = Arc::clone(&shutting_down);
        let handle = thread::spawn(move || run(device, command_rx, event_tx, stopping));
        Self {
            commands,
            events,
            cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            shutting_down,
            handle: Some(handle),
        }
    }

    /// Queue a command. Sweep commands with nothing to repeat are refused here.
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        if let WorkerCommand::Sweep { repeat, .. } = &command {
            repeat.check()?;
        }
        let cancel = Arc::clone(&*self.current_cancel());
        self.commands
            .send(Queued { command, cancel })
            .map_err(|_| DriverError::NotReady("worker has stopped".into()))
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Cancel every sweep sent so far, running or still queued.
    ///
    /// The running sweep stops after its current chunk. Commands sent after
    /// this call are unaffected.
    pub fn cancel(&self) {
        let mut current = self.current_cancel();
        current.store(true, Ordering::Relaxed);
        *current = Arc::new(AtomicBool::new(false));
    }

    fn current_cancel(&self) -> MutexGuard<'_, Arc<AtomicBool>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the worker and take the session back.
    ///
    /// Commands still waiting in the channel are dropped.
    pub fn shutdown(mut self) -> Result<Isx3> {
        self.stop()
            .ok_or_else(|| DriverError::NotReady("worker thread panicked".into()))
    }

    fn stop(&mut self) -> Option<Isx3> {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.cancel();
        let _ = self.commands.send(Queued {
            command: WorkerCommand::Shutdown,
            cancel: Arc::new(AtomicBool::new(false)),
        });
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl Drop for SweepWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run(
    mut device: Isx3,
    commands: Receiver<Queued>,
    events: Sender<WorkerEvent>,
    shutting_down: Arc<AtomicBool>,
) -> Isx3 {
    info!("sweep worker started");
    while let Ok(Queued { command, cancel }) = commands.recv() {
        if shutting_down.load(Ordering::Relaxed) {
            debug!("worker: shutting down, dropping {command:?}");
            break;
        }
        debug!("worker: {command:?}");
        let event = match command {
            WorkerCommand::Configure(request) => match device.do_initial_setup(&request) {
                Ok(()) => WorkerEvent::Configured,
                Err(e) => WorkerEvent::Failed(e),
            },
            WorkerCommand::Sweep {
                first_index,
                repeat,
                interval,
            } => sweep_repeatedly(&mut device, &events, &cancel, first_index, repeat, interval),
            WorkerCommand::Restart => match device.restart() {
                Ok(()) => WorkerEvent::Restarted,
                Err(e) => WorkerEvent::Failed(e),
            },
            WorkerCommand::Shutdown => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    info!("sweep worker stopped");
    device
}

/// Run the sweeps, streaming records and results, and return the terminating event.
fn sweep_repeatedly(
    device: &mut Isx3,
    events: &Sender<WorkerEvent>,
    cancel: &AtomicBool,
    first_index: u64,
    repeat: Repeat,
    interval: Duration,
) -> WorkerEvent {
    let started_at = Instant::now();
    let mut measurement_index = first_index;
    let mut started = 0u32;
    loop {
        if started > 0 && !wait_interval(interval, cancel) {
            return WorkerEvent::Cancelled {
                next_index: measurement_index,
            };
        }
        if !repeat.allows(started, started_at) {
            info!("{started} sweep(s) done");
            return WorkerEvent::Completed {
                next_index: measurement_index,
            };
        }
        started = started.saturating_add(1);

        match sweep_once(device, events, cancel, measurement_index) {
            Ok(finished) => {
                let _ = events.send(finished);
            }
            Err(DriverError::Cancelled) => {
                return WorkerEvent::Cancelled {
                    next_index: measurement_index,
                }
            }
            Err(e) => {
                warn!("sweep {measurement_index} failed: {e}");
                return WorkerEvent::Failed(e);
            }
        }
        measurement_index += 1;
    }
}

fn sweep_once(
    device: &mut Isx3,
    events: &Sender<WorkerEvent>,
    cancel: &AtomicBool,
    measurement_index: u64,
) -> Result<WorkerEvent> {
    let result = device.run_sweep(Some(cancel), |record| {
        let _ = events.send(WorkerEvent::Record {
            measurement_index,
            record: record.clone(),
        });
    })?;
    let frequencies = device.get_frequency_list()?;
    let electrodes = device.get_extension_port_channel()?;
    Ok(WorkerEvent::SweepFinished {
        measurement_index,
        result,
        frequencies,
        electrodes,
    })
}

/// Sleep for `interval`; false if cancelled meanwhile.
fn wait_interval(interval: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_single;
    use crate::config::{
        CurrentRange, FeChannel, FeMode, FrequencyScale, InjectionType, TimeStampMode,
    };
    use crate::frame::Transport;
    use crate::isx3::SessionState;
    use crate::mock::{ack, frame, result_frame, MockPort};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const FREQUENCIES: [f32; 2] = [1e3, 1e5];

    fn request() -> SetupRequest {
        SetupRequest {
            fmin: 1e3,
            fmax: 1e5,
            fnum: 2,
            scale: FrequencyScale::Logarithmic,
            channel: FeChannel::Bnc,
            mode: FeMode::FourPoint,
            range: CurrentRange::Select10mA,
            precision: 1.0,
            excitation: InjectionType::Voltage,
            amplitude: 0.25,
            combinations: vec![[1, 2, 3, 4]],
            timestamp: TimeStampMode::Off,
            report_current_range: true,
        }
    }

    /// One sweep of `request()` plus the axis queries that follow it.
    fn queue_sweep(port: &mut MockPort, value: f32) {
        port.queue_acks(4);
        port.queue(&result_frame(0, 0x01, value, 0.0));
        port.queue(&result_frame(1, 0x01, value, 1.0));

        let mut list = vec![0x04];
        for f in FREQUENCIES {
            list.extend_from_slice(&encode_single(f));
        }
        port.queue(&frame(0xB7, &list));
        port.queue(&ack(0x83));
        port.queue(&frame(0xB3, &[1, 2, 3, 4]));
        port.queue(&ack(0x83));
    }

    fn next(worker: &SweepWorker) -> WorkerEvent {
        worker.events().recv_timeout(TIMEOUT).unwrap()
    }

    fn configured_worker(port: MockPort) -> SweepWorker {
        let worker = SweepWorker::spawn(Isx3::from_transport(Box::new(port)));
        worker.send(WorkerCommand::Configure(request())).unwrap();
        assert!(matches!(next(&worker), WorkerEvent::Configured));
        worker
    }

    /// A session whose restart waits `settle` and then hands out `reopened`.
    fn restartable(port: MockPort, settle: Duration, reopened: MockPort) -> Isx3 {
        let mut reopened = Some(reopened);
        Isx3::from_transport(Box::new(port)).with_reopen(settle, move || {
            reopened
                .take()
                .map(|p| Box::new(p) as Box<dyn Transport>)
                .ok_or_else(|| DriverError::NotReady("already reopened".into()))
        })
    }

    #[test]
    fn configure_then_sweep_with_caller_index() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        queue_sweep(&mut port, 10.0);
        queue_sweep(&mut port, 20.0);
        let worker = configured_worker(port);

        worker
            .send(WorkerCommand::Sweep {
                first_index: 7,
                repeat: Repeat::Count(2),
                interval: Duration::ZERO,
            })
            .unwrap();

        let mut records = 0;
        let mut finished = Vec::new();
        loop {
            match next(&worker) {
                WorkerEvent::Record { .. } => records += 1,
                WorkerEvent::SweepFinished {
                    measurement_index,
                    result,
                    frequencies,
                    electrodes,
                } => {
                    assert_eq!(frequencies, FREQUENCIES.to_vec());
                    assert_eq!(electrodes, vec![[1, 2, 3, 4]]);
                    finished.push((measurement_index, result.real[0][1]));
                }
                WorkerEvent::Completed { next_index } => {
                    assert_eq!(next_index, 9);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(records, 4);
        assert_eq!(finished, vec![(7, 10.0), (8, 20.0)]);

        let device = worker.shutdown().unwrap();
        assert_eq!(device.configuration().fnum(), 2);
    }

    #[test]
    fn timed_repeat_stops_once_the_duration_has_passed() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        queue_sweep(&mut port, 1.0);
        let worker = configured_worker(port);

        worker
            .send(WorkerCommand::Sweep {
                first_index: 0,
                repeat: Repeat::For(Duration::from_millis(10)),
                interval: Duration::from_millis(30),
            })
            .unwrap();

        let mut sweeps = 0;
        loop {
            match next(&worker) {
                WorkerEvent::Record { .. } => {}
                WorkerEvent::SweepFinished { .. } => sweeps += 1,
                WorkerEvent::Completed { next_index } => {
                    assert_eq!(next_index, 1);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(sweeps, 1);
    }

    #[test]
    fn sweep_commands_without_repetitions_are_refused() {
        let worker = SweepWorker::spawn(Isx3::from_transport(Box::new(MockPort::new())));
        for repeat in [Repeat::Count(0), Repeat::For(Duration::ZERO)] {
            let err = worker
                .send(WorkerCommand::Sweep {
                    first_index: 0,
                    repeat,
                    interval: Duration::ZERO,
                })
                .unwrap_err();
            assert!(err.is_configuration());
        }
        assert!(worker.events().try_recv().is_err());
    }

    #[test]
    fn failures_are_reported_and_the_worker_keeps_running() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        let worker = configured_worker(port);

        worker
            .send(WorkerCommand::Sweep {
                first_index: 0,
                repeat: Repeat::Count(1),
                interval: Duration::ZERO,
            })
            .unwrap();
        assert!(matches!(
            next(&worker),
            WorkerEvent::Failed(DriverError::Timeout(_))
        ));

        let mut bad = request();
        bad.combinations.clear();
        worker.send(WorkerCommand::Configure(bad)).unwrap();
        match next(&worker) {
            WorkerEvent::Failed(e) => assert!(e.is_configuration()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn cancel_during_interval() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        queue_sweep(&mut port, 1.0);
        let worker = configured_worker(port);

        worker
            .send(WorkerCommand::Sweep {
                first_index: 3,
                repeat: Repeat::Count(5),
                interval: Duration::from_secs(60),
            })
            .unwrap();
        loop {
            if let WorkerEvent::SweepFinished { .. } = next(&worker) {
                break;
            }
        }
        worker.cancel();
        assert!(matches!(
            next(&worker),
            WorkerEvent::Cancelled { next_index: 4 }
        ));
    }

    #[test]
    fn cancel_reaches_a_sweep_still_in_the_queue() {
        let mut first = MockPort::new();
        first.queue_acks(4);
        first.queue_acks(1);
        let mut reopened = MockPort::new();
        queue_sweep(&mut reopened, 5.0);
        let device = restartable(first, Duration::from_millis(200), reopened);
        let worker = SweepWorker::spawn(device);
        worker.send(WorkerCommand::Configure(request())).unwrap();
        assert!(matches!(next(&worker), WorkerEvent::Configured));

        worker.send(WorkerCommand::Restart).unwrap();
        worker
            .send(WorkerCommand::Sweep {
                first_index: 5,
                repeat: Repeat::Count(3),
                interval: Duration::from_secs(1),
            })
            .unwrap();
        worker.cancel();
        worker
            .send(WorkerCommand::Sweep {
                first_index: 5,
                repeat: Repeat::Count(1),
                interval: Duration::ZERO,
            })
            .unwrap();

        assert!(matches!(next(&worker), WorkerEvent::Restarted));
        assert!(matches!(
            next(&worker),
            WorkerEvent::Cancelled { next_index: 5 }
        ));
        assert!(matches!(next(&worker), WorkerEvent::Record { .. }));
        assert!(matches!(next(&worker), WorkerEvent::Record { .. }));
        assert!(matches!(
            next(&worker),
            WorkerEvent::SweepFinished {
                measurement_index: 5,
                ..
            }
        ));
        assert!(matches!(
            next(&worker),
            WorkerEvent::Completed { next_index: 6 }
        ));
    }

    #[test]
    fn shutdown_skips_queued_sweeps() {
        let mut first = MockPort::new();
        first.queue_acks(1);
        let device = restartable(first, Duration::from_millis(300), MockPort::new());
        let worker = SweepWorker::spawn(device);

        worker.send(WorkerCommand::Restart).unwrap();
        worker
            .send(WorkerCommand::Sweep {
                first_index: 0,
                repeat: Repeat::Count(3),
                interval: Duration::from_secs(1),
            })
            .unwrap();
        worker.cancel();

        let begun = Instant::now();
        let device = worker.shutdown().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(device.state(), SessionState::Ready);
    }

    #[test]
    fn restart_through_the_worker() {
        let mut port = MockPort::new();
        port.queue_acks(1);
        let device = Isx3::from_transport(Box::new(port)).with_reopen(
            Duration::from_millis(1),
            || Ok(Box::new(MockPort::new()) as Box<dyn Transport>),
        );
        let worker = SweepWorker::spawn(device);
        worker.send(WorkerCommand::Restart).unwrap();
        assert!(matches!(next(&worker), WorkerEvent::Restarted));
        let device = worker.shutdown().unwrap();
        assert_eq!(device.state(), SessionState::Ready);
    }
}
