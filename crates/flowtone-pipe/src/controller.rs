//! Pipe lifecycle controller.
//!
//! One control thread per pipe owns the state machine (Ready / Running /
//! Paused / Closed), the pending parameter map, and the active run's
//! channels. The loop selects over the command mailbox, the pump's
//! production-ticket requests, and the stage runners' completion reports.
//!
//! Pause is implemented entirely through the ticket service: while paused
//! the controller stops answering ticket requests and the pump parks on its
//! ticket receive, which starves the chain without any per-runner state.
//! Cancellation is broadcast by dropping the cancel channel's sender.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, never, unbounded};
use tracing::{debug, error, info, warn};

use flowtone_core::{Message, Params, PipeError, Processor, Pump, Sink, SingleUse, Stage};

use crate::pipe::Action;
use crate::runner::{
    StageOutcome, StageReport, spawn_fanout, spawn_processor, spawn_pump, spawn_sink,
};

pub(crate) enum Command {
    Begin {
        action: Action,
        done: Sender<Result<(), PipeError>>,
    },
    Push {
        params: Params,
    },
    /// Hand the stage instances back to the caller and close the pipe.
    /// Only legal without an active run.
    TakeStages {
        reply: Sender<Result<StageSet, PipeError>>,
    },
}

pub(crate) struct StageSet {
    pub pump: Box<dyn Pump>,
    pub processors: Vec<Box<dyn Processor>>,
    pub sinks: Vec<Box<dyn Sink>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Running,
    Paused,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Closed => "closed",
        }
    }
}

struct RunnerJoins {
    pump: JoinHandle<Box<dyn Pump>>,
    processors: Vec<JoinHandle<Box<dyn Processor>>>,
    fanout: JoinHandle<()>,
    sinks: Vec<JoinHandle<Box<dyn Sink>>>,
}

struct ActiveRun {
    req_rx: Receiver<()>,
    ticket_tx: Sender<Params>,
    reports_rx: Receiver<StageReport>,
    /// Stops production only: dropped on the first stage failure so blocks
    /// already in flight still drain to the sinks.
    pump_cancel_tx: Option<Sender<()>>,
    /// Full broadcast: dropped on close, which also drops in-flight blocks.
    cancel_tx: Option<Sender<()>>,
    joins: RunnerJoins,
    done: Sender<Result<(), PipeError>>,
    expected_reports: usize,
    received_reports: usize,
    failures: Vec<PipeError>,
    pump_gone: bool,
}

impl ActiveRun {
    fn cancel_pump(&mut self) {
        self.pump_cancel_tx.take();
    }

    fn cancel_all(&mut self) {
        self.pump_cancel_tx.take();
        self.cancel_tx.take();
    }
}

pub(crate) fn spawn_controller(
    name: String,
    stages: StageSet,
    guards: Vec<SingleUse>,
    cmd_rx: Receiver<Command>,
) {
    let thread_name = format!("{name}-control");
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || Controller::new(name, stages, guards).run_loop(cmd_rx))
        .unwrap_or_else(|e| panic!("failed to spawn {thread_name} thread: {e}"));
}

struct Controller {
    name: String,
    state: State,
    stages: Option<StageSet>,
    guards: Vec<SingleUse>,
    pending: Params,
    active: Option<ActiveRun>,
    close_pending: Option<Sender<Result<(), PipeError>>>,
    cancel_requested: bool,
    orphaned: bool,
}

enum Event {
    Command(Option<Command>),
    TicketRequest,
    PumpGone,
    Report(Option<StageReport>),
}

impl Controller {
    fn new(name: String, stages: StageSet, guards: Vec<SingleUse>) -> Self {
        Self {
            name,
            state: State::Ready,
            stages: Some(stages),
            guards,
            pending: Params::new(),
            active: None,
            close_pending: None,
            cancel_requested: false,
            orphaned: false,
        }
    }

    fn run_loop(mut self, cmd_rx: Receiver<Command>) {
        info!("pipe '{}': controller started", self.name);
        let never_cmd = never::<Command>();
        let never_req = never::<()>();
        let never_rep = never::<StageReport>();

        loop {
            if self.orphaned && self.active.is_none() {
                break;
            }

            let cmd_arm = if self.orphaned { &never_cmd } else { &cmd_rx };
            let (req_arm, rep_arm) = match self.active.as_ref() {
                Some(active)
                    if self.state == State::Running
                        && !active.pump_gone
                        && active.failures.is_empty() =>
                {
                    (&active.req_rx, &active.reports_rx)
                },
                Some(active) => (&never_req, &active.reports_rx),
                None => (&never_req, &never_rep),
            };

            let event = crossbeam_channel::select! {
                recv(cmd_arm) -> msg => Event::Command(msg.ok()),
                recv(req_arm) -> msg => match msg {
                    Ok(()) => Event::TicketRequest,
                    Err(_) => Event::PumpGone,
                },
                recv(rep_arm) -> msg => Event::Report(msg.ok()),
            };

            match event {
                Event::Command(Some(command)) => self.on_command(command),
                Event::Command(None) => {
                    // Pipe handle dropped. Cancel any active run, then wind
                    // down once its runners have reported.
                    self.orphaned = true;
                    if let Some(active) = self.active.as_mut() {
                        self.cancel_requested = true;
                        active.cancel_all();
                    }
                },
                Event::TicketRequest => self.serve_ticket(),
                Event::PumpGone => {
                    if let Some(active) = self.active.as_mut() {
                        active.pump_gone = true;
                    }
                },
                Event::Report(Some(report)) => self.on_report(report),
                Event::Report(None) => {
                    // All report senders dropped; any queued reports were
                    // already delivered, so the run is over.
                    if self.active.is_some() {
                        self.finish_run();
                    }
                },
            }
        }
        info!("pipe '{}': controller exited", self.name);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Push { params } => {
                debug!("pipe '{}': parameters queued", self.name);
                self.pending.merge(params);
            },
            Command::TakeStages { reply } => {
                if matches!(self.state, State::Running | State::Paused) {
                    let _ = reply.send(Err(PipeError::InvalidState {
                        command: "take stages",
                        state: self.state.name(),
                    }));
                    return;
                }
                match self.stages.take() {
                    Some(set) => {
                        info!("pipe '{}': stages reclaimed, closing", self.name);
                        self.state = State::Closed;
                        let _ = reply.send(Ok(set));
                    },
                    None => {
                        let _ = reply.send(Err(PipeError::InvalidState {
                            command: "take stages",
                            state: "dissolved",
                        }));
                    },
                }
            },
            Command::Begin { action, done } => match (action, self.state) {
                (Action::Run, State::Ready) => self.start_run(done),
                (Action::Pause, State::Running) => {
                    info!("pipe '{}': paused", self.name);
                    self.state = State::Paused;
                    let _ = done.send(Ok(()));
                },
                (Action::Resume, State::Paused) => {
                    info!("pipe '{}': resumed", self.name);
                    self.state = State::Running;
                    let _ = done.send(Ok(()));
                },
                (Action::Close, State::Ready) => {
                    info!("pipe '{}': closed", self.name);
                    self.state = State::Closed;
                    let _ = done.send(Ok(()));
                },
                (Action::Close, State::Running | State::Paused) => {
                    if self.close_pending.is_some() {
                        let _ = done.send(Err(PipeError::InvalidState {
                            command: "close",
                            state: "closing",
                        }));
                        return;
                    }
                    info!("pipe '{}': closing, cancelling active run", self.name);
                    self.cancel_requested = true;
                    if let Some(active) = self.active.as_mut() {
                        active.cancel_all();
                    }
                    self.close_pending = Some(done);
                },
                (action, state) => {
                    warn!(
                        "pipe '{}': rejecting {} while {}",
                        self.name,
                        action.name(),
                        state.name()
                    );
                    let _ = done.send(Err(PipeError::InvalidState {
                        command: action.name(),
                        state: state.name(),
                    }));
                },
            },
        }
    }

    /// Answers one pump ticket: drains pending params into the response so
    /// they ride in-band with the next produced block.
    fn serve_ticket(&mut self) {
        let params = self.pending.take();
        if let Some(active) = self.active.as_ref() {
            // A send failure means the pump exited between request and
            // response; its report is already on the way.
            let _ = active.ticket_tx.send(params);
        }
    }

    fn on_report(&mut self, report: StageReport) {
        let finished = {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            match report.outcome {
                StageOutcome::Completed => {
                    debug!("pipe '{}': stage {} completed", self.name, report.uid);
                },
                StageOutcome::Cancelled => {
                    debug!("pipe '{}': stage {} cancelled", self.name, report.uid);
                },
                StageOutcome::Failed(err) => {
                    error!("pipe '{}': stage {} failed: {err}", self.name, report.uid);
                    active.failures.push(err);
                    // Stop production; the chain below the failure drains
                    // and unwinds through channel disconnects, so blocks
                    // already in flight still reach the sinks.
                    active.cancel_pump();
                },
            }
            active.received_reports += 1;
            active.received_reports == active.expected_reports
        };
        if finished {
            self.finish_run();
        }
    }

    fn start_run(&mut self, done: Sender<Result<(), PipeError>>) {
        let mut set = self.stages.take().expect("stage set present while ready");

        if let Err(err) = setup_stages(&self.name, &mut set) {
            for guard in &self.guards {
                guard.reset();
            }
            self.stages = Some(set);
            let _ = done.send(Err(err));
            return;
        }

        let StageSet {
            pump,
            processors,
            sinks,
        } = set;
        let expected_reports = 1 + processors.len() + sinks.len();

        let (req_tx, req_rx) = bounded(1);
        let (ticket_tx, ticket_rx) = bounded(1);
        let (pump_cancel_tx, pump_cancel_rx) = bounded::<()>(0);
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let (report_tx, reports_rx) = unbounded();
        let (pump_tx, mut chain_rx) = bounded::<Message>(1);

        let pump_join = spawn_pump(
            &self.name,
            pump,
            req_tx,
            ticket_rx,
            pump_tx,
            pump_cancel_rx,
            report_tx.clone(),
        );

        let mut processor_joins = Vec::with_capacity(processors.len());
        for (index, processor) in processors.into_iter().enumerate() {
            let (tx, rx) = bounded::<Message>(1);
            processor_joins.push(spawn_processor(
                &self.name,
                index,
                processor,
                chain_rx,
                tx,
                cancel_rx.clone(),
                report_tx.clone(),
            ));
            chain_rx = rx;
        }

        let mut sink_txs = Vec::with_capacity(sinks.len());
        let mut sink_joins = Vec::with_capacity(sinks.len());
        for (index, sink) in sinks.into_iter().enumerate() {
            let (tx, rx) = bounded::<Message>(1);
            sink_txs.push((sink.uid(), tx));
            sink_joins.push(spawn_sink(
                &self.name,
                index,
                sink,
                rx,
                cancel_rx.clone(),
                report_tx.clone(),
            ));
        }

        let fanout_join = spawn_fanout(&self.name, chain_rx, sink_txs, cancel_rx);

        self.active = Some(ActiveRun {
            req_rx,
            ticket_tx,
            reports_rx,
            pump_cancel_tx: Some(pump_cancel_tx),
            cancel_tx: Some(cancel_tx),
            joins: RunnerJoins {
                pump: pump_join,
                processors: processor_joins,
                fanout: fanout_join,
                sinks: sink_joins,
            },
            done,
            expected_reports,
            received_reports: 0,
            failures: Vec::new(),
            pump_gone: false,
        });
        self.state = State::Running;
        info!("pipe '{}': running", self.name);
    }

    /// Joins every runner, flushes every stage, resets the single-use
    /// guards, and resolves the run handle. Leaves the pipe Ready, or
    /// Closed when a close was pending.
    fn finish_run(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveRun {
            joins,
            done,
            mut failures,
            pump_cancel_tx,
            cancel_tx,
            ..
        } = active;
        drop(pump_cancel_tx);
        drop(cancel_tx);

        let pump = joins.pump.join().expect("pump runner thread panicked");
        let processors: Vec<_> = joins
            .processors
            .into_iter()
            .map(|j| j.join().expect("processor runner thread panicked"))
            .collect();
        let _ = joins.fanout.join();
        let sinks: Vec<_> = joins
            .sinks
            .into_iter()
            .map(|j| j.join().expect("sink runner thread panicked"))
            .collect();

        let mut set = StageSet {
            pump,
            processors,
            sinks,
        };
        failures.extend(flush_stages(&self.name, &mut set));
        for guard in &self.guards {
            guard.reset();
        }
        self.stages = Some(set);

        let result = run_result(self.cancel_requested, failures);
        match &result {
            Ok(()) => info!("pipe '{}': run finished", self.name),
            Err(err) => info!("pipe '{}': run finished: {err}", self.name),
        }
        let _ = done.send(result);

        self.cancel_requested = false;
        if let Some(close_done) = self.close_pending.take() {
            self.state = State::Closed;
            info!("pipe '{}': closed", self.name);
            let _ = close_done.send(Ok(()));
        } else {
            self.state = State::Ready;
        }
    }
}

fn run_result(cancelled: bool, mut failures: Vec<PipeError>) -> Result<(), PipeError> {
    if failures.is_empty() {
        if cancelled {
            return Err(PipeError::Cancelled);
        }
        return Ok(());
    }
    let first = failures.remove(0);
    if failures.is_empty() {
        return Err(first);
    }
    Err(PipeError::Multiple {
        first: Box::new(first),
        related: failures,
    })
}

fn each_stage(set: &mut StageSet) -> Vec<&mut dyn Stage> {
    let mut stages: Vec<&mut dyn Stage> = Vec::with_capacity(1 + set.processors.len() + set.sinks.len());
    stages.push(set.pump.as_mut());
    for processor in &mut set.processors {
        stages.push(processor.as_mut());
    }
    for sink in &mut set.sinks {
        stages.push(sink.as_mut());
    }
    stages
}

/// Calls `setup` on every stage in pipeline order, failing fast. On
/// failure, the stages that were already set up are flushed before the
/// error is returned, so no successful setup is left unbracketed.
fn setup_stages(pipe_name: &str, set: &mut StageSet) -> Result<(), PipeError> {
    let mut stages = each_stage(set);
    let mut failure = None;
    for index in 0..stages.len() {
        let setup = catch_unwind(AssertUnwindSafe(|| stages[index].setup(pipe_name)));
        let error = match setup {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(payload) => anyhow::anyhow!("stage setup panicked: {}", payload_message(payload)),
        };
        failure = Some((index, stages[index].uid(), error));
        break;
    }
    let Some((failed_index, uid, source)) = failure else {
        return Ok(());
    };
    for stage in &mut stages[..failed_index] {
        if let Err(e) = flush_one(pipe_name, *stage) {
            warn!("pipe '{pipe_name}': flush after failed setup: {e}");
        }
    }
    Err(PipeError::SetupFailed { uid, source })
}

/// Flushes every stage exactly once, collecting failures as uid-tagged
/// work errors.
fn flush_stages(pipe_name: &str, set: &mut StageSet) -> Vec<PipeError> {
    let mut errors = Vec::new();
    for stage in each_stage(set) {
        let uid = stage.uid();
        if let Err(source) = flush_one(pipe_name, stage) {
            error!("pipe '{pipe_name}': flush failed for stage {uid}: {source}");
            errors.push(PipeError::Work { uid, source });
        }
    }
    errors
}

fn flush_one(pipe_name: &str, stage: &mut dyn Stage) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(|| stage.flush(pipe_name))) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "stage flush panicked: {}",
            payload_message(payload)
        )),
    }
}

fn payload_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
