//! The thread group behind every device.
//!
//! Each worker runs three threads:
//!
//! * **listener**: polls the control channel and dispatches commands. Commands
//!   that touch hardware are forwarded to the acquisition thread; `STOP`,
//!   `SET_TIME`, `SET_DIR` and `EXIT` only flip shared state so they are
//!   answered even while a run is in progress.
//! * **acquisition**: owns the [`DeviceDriver`]. Arms on `START`, blocks on the
//!   [`StartBarrier`], then records until the driver reports completion or a
//!   stop is requested.
//! * **submitter**: drains captured frames into a [`Presenter`], so a slow
//!   display never holds up acquisition.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::barrier::{Gate, StartBarrier, Ticket};
use crate::config::DeviceSettings;
use crate::control_channel::{ControlEndpoint, ReplyHandle};
use crate::message::{Command, DeviceEvent, DeviceId, Notification, Reply, RunId, RunOutcome};

const LISTEN_POLL: Duration = Duration::from_millis(50);
const IDLE_POLL: Duration = Duration::from_millis(20);
const FRAME_QUEUE: usize = 4;

/// Everything a worker needs from the coordinator, injected at construction.
#[derive(Debug)]
pub struct WorkerContext {
    pub id: DeviceId,
    pub control: ControlEndpoint,
    pub events: Sender<Notification>,
    pub barrier: StartBarrier,
}

/// Parameters of the run being armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub run: RunId,
    pub file_name: String,
    pub save_dir: PathBuf,
    pub duration_ms: u32,
}

/// One step of a recording.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded<F> {
    /// Acquisition is still going; optionally with something to display.
    Data(Option<F>),
    /// The planned duration has been covered.
    Complete,
}

/// Narrow adapter over one hardware family.
///
/// All methods run on the acquisition thread. Errors are logged and turned
/// into a single `ERROR` notification at the worker boundary.
pub trait DeviceDriver: Send {
    type Frame: Send + 'static;
    type Error: std::error::Error + Send;

    fn initialize(&mut self) -> Result<(), Self::Error>;

    fn check_connection(&mut self) -> bool {
        true
    }

    fn reconfigure(&mut self, settings: &DeviceSettings) -> Result<(), Self::Error>;

    /// Prepare for the run: open output files, push configuration.
    fn arm(&mut self, plan: &RunPlan) -> Result<(), Self::Error>;

    /// Called once the start barrier has been released.
    fn begin(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Live data while no run is active. `None` means nothing to show.
    fn preview(&mut self) -> Result<Option<Self::Frame>, Self::Error> {
        Ok(None)
    }

    fn record(&mut self) -> Result<Recorded<Self::Frame>, Self::Error>;

    /// Close out the run. Also called with `Terminated` when the run was
    /// aborted before the barrier released.
    fn finish(&mut self, outcome: RunOutcome) -> Result<(), Self::Error>;

    fn close(&mut self) {}
}

/// Consumer of captured frames on the submitter thread.
pub trait Presenter<F>: Send {
    fn present(&mut self, frame: &F);

    /// The device failed; show it.
    fn present_error(&mut self) {}
}

/// Presenter for devices without a display.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDisplay;

impl<F> Presenter<F> for NoDisplay {
    fn present(&mut self, _frame: &F) {}
}

enum Feed<F> {
    Frame(F),
    Fault,
}

#[derive(Debug)]
struct RunParams {
    duration_ms: u32,
    save_dir: PathBuf,
}

#[derive(Debug)]
struct SharedState {
    connected: AtomicBool,
    acquiring: AtomicBool,
    force_stop: AtomicBool,
    hard_stopped: AtomicBool,
    exit: AtomicBool,
    params: Mutex<RunParams>,
}

impl SharedState {
    fn stop_requested(&self) -> bool {
        self.force_stop.load(Ordering::Acquire)
    }
}

/// A command the listener handed to the acquisition thread.
struct Job {
    seq: u64,
    command: Command,
    /// Barrier generation `START` belongs to, taken on receipt.
    ticket: Option<Ticket>,
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub id: DeviceId,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn join(self) {
        for t in self.threads {
            if t.join().is_err() {
                log::error!("A thread of {} panicked", self.id);
            }
        }
    }
}

/// Start the listener, acquisition and submitter threads for one device.
pub fn spawn<D, P>(ctx: WorkerContext, driver: D, presenter: P) -> std::io::Result<WorkerHandle>
where
    D: DeviceDriver + 'static,
    P: Presenter<D::Frame> + 'static,
{
    let WorkerContext {
        id,
        control,
        events,
        barrier,
    } = ctx;

    let state = Arc::new(SharedState {
        connected: AtomicBool::new(false),
        acquiring: AtomicBool::new(false),
        force_stop: AtomicBool::new(false),
        hard_stopped: AtomicBool::new(false),
        exit: AtomicBool::new(false),
        params: Mutex::new(RunParams {
            duration_ms: 20_000,
            save_dir: PathBuf::from("."),
        }),
    });
    // Rendezvous: the listener only forwards while the acquisition thread is idle
    let (job_tx, job_rx) = bounded::<Job>(1);
    let (feed_tx, feed_rx) = bounded::<Feed<D::Frame>>(FRAME_QUEUE);
    let replies = control.reply_handle();

    let submitter = thread::Builder::new()
        .name(format!("{id}-submit"))
        .spawn(move || submit(feed_rx, presenter))?;

    let acquisition = {
        let state = Arc::clone(&state);
        let mut worker = Acquisition {
            id,
            driver,
            state,
            barrier: barrier.clone(),
            events,
            replies: replies.clone(),
            feed: feed_tx,
        };
        thread::Builder::new()
            .name(format!("{id}-acquire"))
            .spawn(move || worker.run(&job_rx))?
    };

    let listener = thread::Builder::new()
        .name(format!("{id}-listen"))
        .spawn(move || listen(id, &control, &replies, &state, &barrier, &job_tx))?;

    Ok(WorkerHandle {
        id,
        threads: vec![listener, acquisition, submitter],
    })
}

fn listen(
    id: DeviceId,
    control: &ControlEndpoint,
    replies: &ReplyHandle,
    state: &SharedState,
    barrier: &StartBarrier,
    jobs: &Sender<Job>,
) {
    loop {
        let envelope = match control.recv_timeout(LISTEN_POLL) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(_) => {
                log::debug!("{id}: control channel closed");
                state.exit.store(true, Ordering::Release);
                state.force_stop.store(true, Ordering::Release);
                return;
            }
        };
        let seq = envelope.seq;
        log::debug!("{id}: received {}", envelope.command.name());

        match envelope.command {
            Command::Stop => {
                if state.acquiring.load(Ordering::Acquire) {
                    state.hard_stopped.store(true, Ordering::Release);
                    state.force_stop.store(true, Ordering::Release);
                }
                replies.send(seq, Reply::Ack);
            }
            Command::SetTime(duration_ms) => {
                state.params.lock().duration_ms = duration_ms;
                replies.send(seq, Reply::Ack);
            }
            Command::SetDir(dir) => {
                state.params.lock().save_dir = dir;
                replies.send(seq, Reply::Ack);
            }
            Command::Exit => {
                state.exit.store(true, Ordering::Release);
                state.force_stop.store(true, Ordering::Release);
                replies.send(seq, Reply::Ack);
                return;
            }
            command @ (Command::CheckConn | Command::Start { .. } | Command::Reconfigure(_)) => {
                let connected = state.connected.load(Ordering::Acquire);
                let busy = state.acquiring.load(Ordering::Acquire);
                if !connected {
                    replies.send(seq, refusal(&command));
                } else if busy {
                    // Hardware is in use by a run; do not queue behind it
                    let reply = match command {
                        Command::CheckConn => Reply::Connected(true),
                        _ => Reply::Refused,
                    };
                    replies.send(seq, reply);
                } else {
                    // Pinned on receipt so a clear during arming aborts the run
                    let ticket = matches!(command, Command::Start { .. }).then(|| barrier.ticket());
                    let job = Job {
                        seq,
                        command,
                        ticket,
                    };
                    if let Err(e) = jobs.try_send(job) {
                        let command = match e {
                            TrySendError::Full(job) | TrySendError::Disconnected(job) => job.command,
                        };
                        replies.send(seq, refusal(&command));
                    }
                }
            }
        }
    }
}

fn refusal(command: &Command) -> Reply {
    match command {
        Command::CheckConn => Reply::Connected(false),
        _ => Reply::Refused,
    }
}

fn submit<F, P: Presenter<F>>(feed: Receiver<Feed<F>>, mut presenter: P) {
    while let Ok(first) = feed.recv() {
        // Only the newest frame is worth drawing
        let mut latest = None;
        for item in std::iter::once(first).chain(feed.try_iter()) {
            match item {
                Feed::Frame(frame) => latest = Some(frame),
                Feed::Fault => {
                    latest = None;
                    presenter.present_error();
                }
            }
        }
        if let Some(frame) = latest {
            presenter.present(&frame);
        }
    }
}

struct Acquisition<D: DeviceDriver> {
    id: DeviceId,
    driver: D,
    state: Arc<SharedState>,
    barrier: StartBarrier,
    events: Sender<Notification>,
    replies: ReplyHandle,
    feed: Sender<Feed<D::Frame>>,
}

impl<D: DeviceDriver> Acquisition<D> {
    fn run(&mut self, jobs: &Receiver<Job>) {
        if let Err(e) = self.driver.initialize() {
            log::error!("{}: initialization failed: {}", self.id, e);
            return;
        }
        self.state.connected.store(true, Ordering::Release);
        log::info!("{}: connected", self.id);

        let mut previewing = true;
        while !self.state.exit.load(Ordering::Acquire) {
            let job = if previewing {
                jobs.try_recv().map_err(|e| match e {
                    TryRecvError::Empty => RecvTimeoutError::Timeout,
                    TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                })
            } else {
                jobs.recv_timeout(IDLE_POLL)
            };

            let outcome = match job {
                Ok(job) => self.handle(job),
                Err(RecvTimeoutError::Timeout) => Ok(()),
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if let Err(e) = outcome {
                self.fail(&e);
                return;
            }

            match self.driver.preview() {
                Ok(Some(frame)) => {
                    previewing = true;
                    self.offer(frame);
                }
                Ok(None) => previewing = false,
                Err(e) => {
                    self.fail(&e);
                    return;
                }
            }
        }
        self.driver.close();
        log::debug!("{}: acquisition thread exiting", self.id);
    }

    fn handle(&mut self, job: Job) -> Result<(), D::Error> {
        match job.command {
            Command::CheckConn => {
                let ok = self.driver.check_connection();
                self.replies.send(job.seq, Reply::Connected(ok));
            }
            Command::Reconfigure(settings) => match self.driver.reconfigure(&settings) {
                Ok(()) => {
                    self.replies.send(job.seq, Reply::Ack);
                    self.notify(DeviceEvent::Received);
                }
                Err(e) => {
                    log::warn!("{}: reconfiguration rejected: {}", self.id, e);
                    self.replies.send(job.seq, Reply::Refused);
                }
            },
            Command::Start { run, file_name } => {
                let plan = {
                    let params = self.state.params.lock();
                    RunPlan {
                        run,
                        file_name,
                        save_dir: params.save_dir.clone(),
                        duration_ms: params.duration_ms,
                    }
                };
                let ticket = job.ticket.unwrap_or_else(|| self.barrier.ticket());
                self.acquire(job.seq, &plan, ticket)?;
            }
            other => {
                log::warn!("{}: {} is not handled by acquisition", self.id, other.name());
                self.replies.send(job.seq, Reply::Refused);
            }
        }
        Ok(())
    }

    fn acquire(&mut self, seq: u64, plan: &RunPlan, ticket: Ticket) -> Result<(), D::Error> {
        self.state.force_stop.store(false, Ordering::Release);
        self.state.hard_stopped.store(false, Ordering::Release);
        self.state.acquiring.store(true, Ordering::Release);
        let result = self.acquire_inner(seq, plan, ticket);
        self.state.acquiring.store(false, Ordering::Release);
        result
    }

    fn acquire_inner(&mut self, seq: u64, plan: &RunPlan, ticket: Ticket) -> Result<(), D::Error> {
        if !self.barrier.is_current(ticket) {
            log::debug!("{}: {} was abandoned before arming", self.id, plan.run);
            self.replies.send(seq, Reply::Refused);
            return Ok(());
        }
        if let Err(e) = self.driver.arm(plan) {
            log::warn!("{}: arming for {} failed: {}", self.id, plan.run, e);
            self.replies.send(seq, Reply::Refused);
            return Ok(());
        }

        self.replies.send(seq, Reply::Ack);
        log::debug!("{}: armed for {}, waiting on barrier", self.id, plan.run);

        let outcome = match self.barrier.wait(ticket) {
            Gate::Aborted => RunOutcome::Terminated,
            Gate::Released if self.state.stop_requested() => RunOutcome::Terminated,
            Gate::Released => match self.record(plan.run) {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Err(close) = self.driver.finish(RunOutcome::Terminated) {
                        log::warn!("{}: could not close recording: {}", self.id, close);
                    }
                    return Err(e);
                }
            },
        };

        self.driver.finish(outcome)?;
        log::info!("{}: {} finished ({:?})", self.id, plan.run, outcome);
        self.notify(DeviceEvent::Finished {
            run: plan.run,
            outcome,
        });
        Ok(())
    }

    fn record(&mut self, run: RunId) -> Result<RunOutcome, D::Error> {
        self.driver.begin()?;
        self.notify(DeviceEvent::Started { run });

        loop {
            if self.state.stop_requested() {
                if self.state.hard_stopped.load(Ordering::Acquire) {
                    log::info!("{}: hard stop during {}", self.id, run);
                } else {
                    log::debug!("{}: stopping {} for exit", self.id, run);
                }
                return Ok(RunOutcome::Terminated);
            }
            crate::profile_scope!("record");
            match self.driver.record() {
                Ok(Recorded::Data(Some(frame))) => self.offer(frame),
                Ok(Recorded::Data(None)) => {}
                Ok(Recorded::Complete) => return Ok(RunOutcome::Completed),
                Err(e) => return Err(e),
            }
        }
    }

    fn offer(&self, frame: D::Frame) {
        // A full queue means the display is behind; drop the frame
        let _ = self.feed.try_send(Feed::Frame(frame));
    }

    fn notify(&self, event: DeviceEvent) {
        if self.events.send(Notification::new(self.id, event)).is_err() {
            log::warn!("{}: coordinator is gone", self.id);
        }
    }

    /// Report the fault once and release the hardware. The listener stays up
    /// so `EXIT` is still acknowledged.
    fn fail(&mut self, error: &D::Error) {
        log::error!("{}: acquisition error: {}", self.id, error);
        self.state.connected.store(false, Ordering::Release);
        let _ = self.feed.send(Feed::Fault);
        if self.events.send(Notification::error(self.id)).is_err() {
            log::warn!("{}: coordinator is gone", self.id);
        }
        self.driver.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::control_channel::{pair, ControlLink};
    use crate::message::DeviceKind;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("scripted fault")]
    pub(crate) struct ScriptedFault;

    /// Driver whose behaviour is decided by a few knobs.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ScriptedDriver {
        pub fail_init: bool,
        pub records_until_complete: Option<usize>,
        pub fail_after_records: Option<usize>,
        pub records: Arc<AtomicUsize>,
        pub finished: Arc<Mutex<Vec<RunOutcome>>>,
        pub armed: Arc<Mutex<Vec<RunPlan>>>,
        /// Delay applied to the first `arm` only.
        pub slow_first_arm: Option<Duration>,
    }

    impl DeviceDriver for ScriptedDriver {
        type Frame = u32;
        type Error = ScriptedFault;

        fn initialize(&mut self) -> Result<(), ScriptedFault> {
            if self.fail_init {
                Err(ScriptedFault)
            } else {
                Ok(())
            }
        }

        fn reconfigure(&mut self, _settings: &DeviceSettings) -> Result<(), ScriptedFault> {
            Ok(())
        }

        fn arm(&mut self, plan: &RunPlan) -> Result<(), ScriptedFault> {
            let first = self.armed.lock().is_empty();
            if let Some(delay) = self.slow_first_arm.filter(|_| first) {
                thread::sleep(delay);
            }
            self.armed.lock().push(plan.clone());
            Ok(())
        }

        fn record(&mut self) -> Result<Recorded<u32>, ScriptedFault> {
            let n = self.records.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after_records.is_some_and(|limit| n > limit) {
                return Err(ScriptedFault);
            }
            if self.records_until_complete.is_some_and(|limit| n >= limit) {
                return Ok(Recorded::Complete);
            }
            thread::sleep(Duration::from_millis(1));
            Ok(Recorded::Data(Some(n as u32)))
        }

        fn finish(&mut self, outcome: RunOutcome) -> Result<(), ScriptedFault> {
            self.finished.lock().push(outcome);
            Ok(())
        }
    }

    /// Presenter that counts what reaches it.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CountingPresenter {
        pub frames: Arc<AtomicUsize>,
        pub errors: Arc<AtomicUsize>,
    }

    impl Presenter<u32> for CountingPresenter {
        fn present(&mut self, _frame: &u32) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        fn present_error(&mut self) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        link: ControlLink,
        events: Receiver<Notification>,
        barrier: StartBarrier,
        handle: WorkerHandle,
    }

    fn start(driver: ScriptedDriver, presenter: CountingPresenter) -> Harness {
        let (link, control) = pair();
        let (events_tx, events) = unbounded();
        let barrier = StartBarrier::new();
        let ctx = WorkerContext {
            id: DeviceId::new(DeviceKind::Daq, 0),
            control,
            events: events_tx,
            barrier: barrier.clone(),
        };
        let handle = spawn(ctx, driver, presenter).unwrap();
        Harness {
            link,
            events,
            barrier,
            handle,
        }
    }

    const ACK: Duration = Duration::from_secs(2);

    fn start_command(run: u64) -> Command {
        Command::Start {
            run: RunId(run),
            file_name: "trial".into(),
        }
    }

    fn wait_connected(h: &mut Harness) {
        for _ in 0..100 {
            if h.link.request(Command::CheckConn, ACK).unwrap() == Reply::Connected(true) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        unreachable!("worker never connected");
    }

    fn exit(mut h: Harness) {
        assert_eq!(h.link.request(Command::Exit, ACK).unwrap(), Reply::Ack);
        h.barrier.clear();
        h.handle.join();
    }

    #[test]
    fn test_failed_initialization_reports_disconnected() {
        let mut h = start(
            ScriptedDriver {
                fail_init: true,
                ..Default::default()
            },
            CountingPresenter::default(),
        );
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            h.link.request(Command::CheckConn, ACK).unwrap(),
            Reply::Connected(false)
        );
        assert_eq!(h.link.request(start_command(1), ACK).unwrap(), Reply::Refused);
        exit(h);
    }

    #[test]
    fn test_run_to_completion() {
        let driver = ScriptedDriver {
            records_until_complete: Some(20),
            ..Default::default()
        };
        let armed = driver.armed.clone();
        let finished = driver.finished.clone();
        let presenter = CountingPresenter::default();
        let frames = presenter.frames.clone();
        let mut h = start(driver, presenter);
        wait_connected(&mut h);

        assert_eq!(h.link.request(Command::SetTime(1234), ACK).unwrap(), Reply::Ack);
        assert_eq!(h.link.request(start_command(7), ACK).unwrap(), Reply::Ack);
        assert_eq!(armed.lock()[0].duration_ms, 1234);
        h.barrier.release();

        let started = h.events.recv_timeout(ACK).unwrap();
        assert_eq!(started.event, DeviceEvent::Started { run: RunId(7) });
        let done = h.events.recv_timeout(ACK).unwrap();
        assert_eq!(
            done.event,
            DeviceEvent::Finished {
                run: RunId(7),
                outcome: RunOutcome::Completed
            }
        );
        assert_eq!(*finished.lock(), vec![RunOutcome::Completed]);
        thread::sleep(Duration::from_millis(20));
        assert!(frames.load(Ordering::SeqCst) > 0);
        exit(h);
    }

    #[test]
    fn test_stop_terminates_run() {
        let driver = ScriptedDriver::default();
        let mut h = start(driver, CountingPresenter::default());
        wait_connected(&mut h);

        h.link.request(start_command(1), ACK).unwrap();
        h.barrier.release();
        assert_eq!(
            h.events.recv_timeout(ACK).unwrap().event,
            DeviceEvent::Started { run: RunId(1) }
        );

        // Busy devices still answer the connectivity check
        assert_eq!(
            h.link.request(Command::CheckConn, ACK).unwrap(),
            Reply::Connected(true)
        );
        assert_eq!(h.link.request(Command::Stop, ACK).unwrap(), Reply::Ack);
        assert_eq!(
            h.events.recv_timeout(ACK).unwrap().event,
            DeviceEvent::Finished {
                run: RunId(1),
                outcome: RunOutcome::Terminated
            }
        );
        exit(h);
    }

    #[test]
    fn test_stop_before_release_records_nothing() {
        let driver = ScriptedDriver::default();
        let records = driver.records.clone();
        let presenter = CountingPresenter::default();
        let frames = presenter.frames.clone();
        let mut h = start(driver, presenter);
        wait_connected(&mut h);

        h.link.request(start_command(3), ACK).unwrap();
        h.link.request(Command::Stop, ACK).unwrap();
        h.barrier.clear();

        assert_eq!(
            h.events.recv_timeout(ACK).unwrap().event,
            DeviceEvent::Finished {
                run: RunId(3),
                outcome: RunOutcome::Terminated
            }
        );
        assert_eq!(records.load(Ordering::SeqCst), 0);
        assert_eq!(frames.load(Ordering::SeqCst), 0);
        exit(h);
    }

    #[test]
    fn test_fault_reports_error_once_and_still_acks_exit() {
        let driver = ScriptedDriver {
            fail_after_records: Some(3),
            ..Default::default()
        };
        let finished = driver.finished.clone();
        let presenter = CountingPresenter::default();
        let errors = presenter.errors.clone();
        let mut h = start(driver, presenter);
        wait_connected(&mut h);

        h.link.request(start_command(2), ACK).unwrap();
        h.barrier.release();
        assert!(matches!(
            h.events.recv_timeout(ACK).unwrap().event,
            DeviceEvent::Started { .. }
        ));
        assert_eq!(
            h.events.recv_timeout(ACK).unwrap().event,
            DeviceEvent::Error { index: 0 }
        );
        assert!(h.events.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(*finished.lock(), vec![RunOutcome::Terminated]);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.link.request(Command::CheckConn, ACK).unwrap(),
            Reply::Connected(false)
        );
        exit(h);
    }

    #[test]
    fn test_reconfigure_notifies_received() {
        let mut h = start(ScriptedDriver::default(), CountingPresenter::default());
        wait_connected(&mut h);
        let settings = DeviceSettings::Daq(crate::config::DaqSettings::default());
        assert_eq!(
            h.link.request(Command::Reconfigure(settings), ACK).unwrap(),
            Reply::Ack
        );
        assert_eq!(
            h.events.recv_timeout(ACK).unwrap().event,
            DeviceEvent::Received
        );
        exit(h);
    }
}
