//! Per-stage runner threads and the channel plumbing between them.
//!
//! Every stage of a running pipe is an independent named OS thread. Data
//! moves over bounded channels; a shared cancel channel (never written,
//! dropped by the controller to broadcast) is observed at every suspension
//! point. Runners never panic upward: work failures and stage panics are
//! converted into structured reports tagged with the stage uid, and each
//! runner hands its stage instance back through its join handle so the
//! controller can flush it and reuse it on the next run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use tracing::warn;

use flowtone_core::{Message, Params, PipeError, Processor, Pump, Sink, Stage, Uid};

/// How a stage runner left its loop.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    /// Drained to end of stream (or upstream closed) and exited cleanly.
    Completed,
    /// Exited at a suspension point after cancellation.
    Cancelled,
    /// A work call failed; the error is already uid-tagged.
    Failed(PipeError),
}

#[derive(Debug)]
pub(crate) struct StageReport {
    pub uid: Uid,
    pub outcome: StageOutcome,
}

/// Applies and removes the params addressed to `stage` from `params`.
///
/// Entries whose closure fails to downcast are dropped with a warning; a
/// mis-typed parameter must not kill the stream.
fn apply_params(params: &mut Params, stage: &mut dyn Stage) {
    let uid = stage.uid();
    for apply in params.detach(uid) {
        if !apply(stage.as_any_mut()) {
            warn!("dropping parameter for stage {uid}: target type mismatch");
        }
    }
}

fn panic_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "stage panicked".to_string());
    anyhow::anyhow!("stage panicked: {message}")
}

fn work_failure(uid: Uid, source: anyhow::Error) -> StageOutcome {
    StageOutcome::Failed(PipeError::Work { uid, source })
}

/// True once the controller has dropped the cancel sender. Checked at the
/// top of every runner loop so cancellation wins over data that happens to
/// be ready on the same select.
fn is_cancelled(cancel_rx: &Receiver<()>) -> bool {
    matches!(cancel_rx.try_recv(), Err(TryRecvError::Disconnected))
}

fn spawn_named<T: Send + 'static>(
    name: String,
    body: impl FnOnce() -> T + Send + 'static,
) -> JoinHandle<T> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .unwrap_or_else(|e| panic!("failed to spawn {name} thread: {e}"))
}

/// Pump runner: ticket-gated producer loop.
///
/// The ticket request/response pair doubles as the pause gate: the
/// controller withholds ticket responses while the pipe is paused, which
/// parks the pump here without any extra state in the runner.
pub(crate) fn spawn_pump(
    pipe_name: &str,
    mut pump: Box<dyn Pump>,
    req_tx: Sender<()>,
    ticket_rx: Receiver<Params>,
    out_tx: Sender<Message>,
    cancel_rx: Receiver<()>,
    report_tx: Sender<StageReport>,
) -> JoinHandle<Box<dyn Pump>> {
    let thread_name = format!("{pipe_name}-pump");
    spawn_named(thread_name, move || {
        let uid = pump.uid();
        let outcome = loop {
            if is_cancelled(&cancel_rx) {
                break StageOutcome::Cancelled;
            }
            if req_tx.send(()).is_err() {
                break StageOutcome::Cancelled;
            }
            let mut params = select! {
                recv(ticket_rx) -> msg => match msg {
                    Ok(params) => params,
                    Err(_) => break StageOutcome::Cancelled,
                },
                recv(cancel_rx) -> _ => break StageOutcome::Cancelled,
            };
            apply_params(&mut params, pump.as_mut());

            let produced = match catch_unwind(AssertUnwindSafe(|| pump.produce())) {
                Ok(Ok(produced)) => produced,
                Ok(Err(e)) => break work_failure(uid, e),
                Err(payload) => break work_failure(uid, panic_error(payload)),
            };
            let Some(buffer) = produced else {
                // End of stream: exiting drops out_tx, which closes the
                // chain downstream.
                break StageOutcome::Completed;
            };

            let message = Message::new(buffer, params, uid);
            select! {
                send(out_tx, message) -> res => {
                    if res.is_err() {
                        break StageOutcome::Cancelled;
                    }
                },
                recv(cancel_rx) -> _ => break StageOutcome::Cancelled,
            }
        };
        let _ = report_tx.send(StageReport { uid, outcome });
        pump
    })
}

pub(crate) fn spawn_processor(
    pipe_name: &str,
    index: usize,
    mut processor: Box<dyn Processor>,
    in_rx: Receiver<Message>,
    out_tx: Sender<Message>,
    cancel_rx: Receiver<()>,
    report_tx: Sender<StageReport>,
) -> JoinHandle<Box<dyn Processor>> {
    let thread_name = format!("{pipe_name}-proc-{index}");
    spawn_named(thread_name, move || {
        let uid = processor.uid();
        let outcome = loop {
            if is_cancelled(&cancel_rx) {
                break StageOutcome::Cancelled;
            }
            let mut message = select! {
                recv(in_rx) -> msg => match msg {
                    Ok(message) => message,
                    Err(_) => break StageOutcome::Completed,
                },
                recv(cancel_rx) -> _ => break StageOutcome::Cancelled,
            };
            apply_params(&mut message.params, processor.as_mut());

            let input = Arc::clone(&message.buffer);
            let output = match catch_unwind(AssertUnwindSafe(|| processor.process(&input))) {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => break work_failure(uid, e),
                Err(payload) => break work_failure(uid, panic_error(payload)),
            };
            message.buffer = Arc::new(output);

            select! {
                send(out_tx, message) -> res => {
                    if res.is_err() {
                        break StageOutcome::Cancelled;
                    }
                },
                recv(cancel_rx) -> _ => break StageOutcome::Cancelled,
            }
        };
        let _ = report_tx.send(StageReport { uid, outcome });
        processor
    })
}

/// Fan-out splitter: clones the shared buffer to every sink channel.
///
/// Params are not clonable (single-shot closures), so each sink's entries
/// are detached before forking; a sink only ever sees params addressed to
/// it. A sink whose runner has exited is dropped from the fork list while
/// the remaining sinks keep receiving the stream; the splitter exits when
/// no sinks remain, upstream closes, or the run is cancelled. Dropping the
/// sink senders then closes the remaining sinks.
pub(crate) fn spawn_fanout(
    pipe_name: &str,
    in_rx: Receiver<Message>,
    mut sink_txs: Vec<(Uid, Sender<Message>)>,
    cancel_rx: Receiver<()>,
) -> JoinHandle<()> {
    let thread_name = format!("{pipe_name}-fanout");
    spawn_named(thread_name, move || {
        'main: while !sink_txs.is_empty() {
            if is_cancelled(&cancel_rx) {
                break;
            }
            let mut message = select! {
                recv(in_rx) -> msg => match msg {
                    Ok(message) => message,
                    Err(_) => break,
                },
                recv(cancel_rx) -> _ => break,
            };
            let mut dead = Vec::new();
            for (sink_uid, sink_tx) in &sink_txs {
                let mut params = Params::new();
                for apply in message.params.detach(*sink_uid) {
                    params.attach(*sink_uid, apply);
                }
                let fork = Message {
                    buffer: Arc::clone(&message.buffer),
                    params,
                    source: message.source,
                };
                select! {
                    send(sink_tx, fork) -> res => {
                        if res.is_err() {
                            // That sink's runner is gone; keep feeding the
                            // others.
                            dead.push(*sink_uid);
                        }
                    },
                    recv(cancel_rx) -> _ => break 'main,
                }
            }
            if !dead.is_empty() {
                sink_txs.retain(|(uid, _)| !dead.contains(uid));
            }
        }
    })
}

pub(crate) fn spawn_sink(
    pipe_name: &str,
    index: usize,
    mut sink: Box<dyn Sink>,
    in_rx: Receiver<Message>,
    cancel_rx: Receiver<()>,
    report_tx: Sender<StageReport>,
) -> JoinHandle<Box<dyn Sink>> {
    let thread_name = format!("{pipe_name}-sink-{index}");
    spawn_named(thread_name, move || {
        let uid = sink.uid();
        let outcome = loop {
            if is_cancelled(&cancel_rx) {
                break StageOutcome::Cancelled;
            }
            let mut message = select! {
                recv(in_rx) -> msg => match msg {
                    Ok(message) => message,
                    Err(_) => break StageOutcome::Completed,
                },
                recv(cancel_rx) -> _ => break StageOutcome::Cancelled,
            };
            apply_params(&mut message.params, sink.as_mut());

            let input = Arc::clone(&message.buffer);
            match catch_unwind(AssertUnwindSafe(|| sink.consume(&input))) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => break work_failure(uid, e),
                Err(payload) => break work_failure(uid, panic_error(payload)),
            }
        };
        let _ = report_tx.send(StageReport { uid, outcome });
        sink
    })
}
