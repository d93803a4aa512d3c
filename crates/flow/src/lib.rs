//! A minimal cold-stream primitive with combine-latest, merge and
//! sequential flat-map composition over tokio channels.
//!
//! A [`Flow`] is a description of a value-over-time sequence; nothing
//! runs until [`Flow::subscribe`] is called. Subscribing hands the
//! producer an [`Emitter`] and returns a [`Subscription`], a scoped
//! resource: dropping or cancelling it stops delivery and propagates
//! cancellation upstream through every combinator stage.

use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Error, Result};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// One delivery to a subscriber. Exactly one terminal event
/// (`Completed` or `Failed`) is delivered per subscription.
#[derive(Debug)]
pub enum FlowEvent<T> {
    Value(T),
    Completed,
    Failed(Error),
}

/// Terminal summary handed to [`FlowHooks`] completion callbacks.
#[derive(Debug)]
pub enum FlowOutcome {
    Finished,
    Failed(Error),
}

/// Producer-side handle. Emissions after the terminal event are
/// dropped; producers should poll [`Emitter::cancelled`] and stop
/// early when the subscriber has gone away.
pub struct Emitter<T> {
    events: mpsc::UnboundedSender<FlowEvent<T>>,
    cancel: watch::Receiver<bool>,
    terminated: Arc<AtomicBool>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            terminated: Arc::clone(&self.terminated),
        }
    }
}

impl<T> Emitter<T> {
    /// Delivers a value. Returns false if the flow already terminated
    /// or the subscriber is gone.
    pub fn emit(&self, value: T) -> bool {
        if self.terminated.load(Ordering::Acquire) || self.is_cancelled() {
            debug!("flow emission dropped after terminal or cancellation");
            return false;
        }
        self.events.send(FlowEvent::Value(value)).is_ok()
    }

    /// Delivers the normal terminal. At most one terminal wins.
    pub fn complete(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(FlowEvent::Completed);
        }
    }

    /// Delivers the failure terminal. At most one terminal wins.
    pub fn fail(&self, error: Error) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(FlowEvent::Failed(error));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.events.is_closed()
    }

    /// Resolves once the subscription is cancelled or dropped.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut cancel = self.cancel.clone();
        async move {
            // An Err means the subscription was dropped outright.
            let _ = cancel.wait_for(|cancelled| *cancelled).await;
        }
    }
}

/// Subscriber-side handle. `recv` yields events until the terminal;
/// afterwards it returns `None`. Dropping the handle cancels the
/// subscription.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<FlowEvent<T>>,
    cancel: watch::Sender<bool>,
    finished: bool,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the terminal has been delivered,
    /// the subscription was cancelled, or the producer went away.
    pub async fn recv(&mut self) -> Option<FlowEvent<T>> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(event) => {
                if matches!(event, FlowEvent::Completed | FlowEvent::Failed(_)) {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Releases the subscription: no further delivery to this
    /// subscriber, cancellation propagated upstream.
    pub fn cancel(&mut self) {
        let _ = self.cancel.send(true);
        self.events.close();
        self.finished = true;
    }

    /// Drains the subscription to its end, returning all emitted
    /// values and the terminal outcome (`None` if the producer went
    /// away without one).
    pub async fn collect(mut self) -> (Vec<T>, Option<FlowOutcome>) {
        let mut values = Vec::new();
        loop {
            match self.recv().await {
                Some(FlowEvent::Value(value)) => values.push(value),
                Some(FlowEvent::Completed) => return (values, Some(FlowOutcome::Finished)),
                Some(FlowEvent::Failed(error)) => {
                    return (values, Some(FlowOutcome::Failed(error)))
                }
                None => return (values, None),
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Side-effect hooks for [`Flow::handle_events`]. Hooks never alter
/// the forwarded events.
#[derive(Default)]
pub struct FlowHooks {
    on_subscribe: Option<Box<dyn FnOnce() + Send>>,
    on_complete: Option<Box<dyn FnOnce(&FlowOutcome) + Send>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl FlowHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires synchronously when a subscriber attaches.
    pub fn on_subscribe(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_subscribe = Some(Box::new(hook));
        self
    }

    /// Fires exactly once with the terminal outcome.
    pub fn on_complete(mut self, hook: impl FnOnce(&FlowOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Fires if the subscription is released before completion.
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }
}

/// A cold description of an asynchronous value sequence failing with
/// [`anyhow::Error`].
pub struct Flow<T> {
    connect: Box<dyn FnOnce(Emitter<T>) + Send>,
}

impl<T: Send + 'static> Flow<T> {
    /// Builds a flow from a producer closure invoked at subscribe
    /// time. Producers that do asynchronous work spawn onto the tokio
    /// runtime and should stop once [`Emitter::cancelled`] resolves.
    pub fn new(connect: impl FnOnce(Emitter<T>) + Send + 'static) -> Self {
        Self {
            connect: Box::new(connect),
        }
    }

    /// Single value, then completion.
    pub fn just(value: T) -> Self {
        Flow::new(move |emitter| {
            emitter.emit(value);
            emitter.complete();
        })
    }

    /// Immediate failure terminal.
    pub fn fail(error: Error) -> Self {
        Flow::new(move |emitter| emitter.fail(error))
    }

    /// Runs an async body per subscription; its `Ok` value is emitted
    /// and the flow completes, its `Err` becomes the failure terminal.
    pub fn once<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Flow::new(move |emitter| {
            tokio::spawn(async move {
                let cancelled = emitter.cancelled();
                tokio::pin!(cancelled);
                tokio::select! {
                    _ = &mut cancelled => {}
                    result = future => match result {
                        Ok(value) => {
                            emitter.emit(value);
                            emitter.complete();
                        }
                        Err(error) => emitter.fail(error),
                    }
                }
            });
        })
    }

    /// Starts the flow. Requires a tokio runtime context for any flow
    /// whose producer spawns.
    pub fn subscribe(self) -> Subscription<T> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let emitter = Emitter {
            events: events_tx,
            cancel: cancel_rx,
            terminated: Arc::new(AtomicBool::new(false)),
        };
        (self.connect)(emitter);
        Subscription {
            events: events_rx,
            cancel: cancel_tx,
            finished: false,
        }
    }

    /// Transforms each value. Completion and failure pass through
    /// unchanged; a panic inside `f` becomes the failure terminal
    /// rather than being swallowed.
    pub fn map<U: Send + 'static>(self, f: impl Fn(T) -> U + Send + 'static) -> Flow<U> {
        Flow::new(move |emitter| {
            let mut upstream = self.subscribe();
            tokio::spawn(async move {
                let cancelled = emitter.cancelled();
                tokio::pin!(cancelled);
                loop {
                    tokio::select! {
                        _ = &mut cancelled => break,
                        event = upstream.recv() => match event {
                            Some(FlowEvent::Value(value)) => {
                                match catch_unwind(AssertUnwindSafe(|| f(value))) {
                                    Ok(mapped) => {
                                        emitter.emit(mapped);
                                    }
                                    Err(payload) => {
                                        emitter.fail(anyhow!(
                                            "map function panicked: {}",
                                            panic_text(payload.as_ref())
                                        ));
                                        break;
                                    }
                                }
                            }
                            Some(FlowEvent::Completed) => {
                                emitter.complete();
                                break;
                            }
                            Some(FlowEvent::Failed(error)) => {
                                emitter.fail(error);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            });
        })
    }

    /// Sequential chaining: each upstream value selects an inner flow
    /// that runs to completion before the next upstream event is
    /// consumed. An inner failure fails the whole chain.
    pub fn flat_map<U: Send + 'static>(
        self,
        mut f: impl FnMut(T) -> Flow<U> + Send + 'static,
    ) -> Flow<U> {
        Flow::new(move |emitter| {
            let mut upstream = self.subscribe();
            tokio::spawn(async move {
                let cancelled = emitter.cancelled();
                tokio::pin!(cancelled);
                'outer: loop {
                    tokio::select! {
                        _ = &mut cancelled => break 'outer,
                        event = upstream.recv() => match event {
                            Some(FlowEvent::Value(value)) => {
                                let mut inner = f(value).subscribe();
                                loop {
                                    tokio::select! {
                                        _ = &mut cancelled => break 'outer,
                                        inner_event = inner.recv() => match inner_event {
                                            Some(FlowEvent::Value(mapped)) => {
                                                emitter.emit(mapped);
                                            }
                                            Some(FlowEvent::Completed) | None => break,
                                            Some(FlowEvent::Failed(error)) => {
                                                emitter.fail(error);
                                                break 'outer;
                                            }
                                        }
                                    }
                                }
                            }
                            Some(FlowEvent::Completed) => {
                                emitter.complete();
                                break 'outer;
                            }
                            Some(FlowEvent::Failed(error)) => {
                                emitter.fail(error);
                                break 'outer;
                            }
                            None => break 'outer,
                        }
                    }
                }
            });
        })
    }

    /// Attaches side effects without altering the event sequence.
    pub fn handle_events(self, hooks: FlowHooks) -> Flow<T> {
        Flow::new(move |emitter| {
            let FlowHooks {
                on_subscribe,
                mut on_complete,
                mut on_cancel,
            } = hooks;
            if let Some(hook) = on_subscribe {
                hook();
            }
            let mut upstream = self.subscribe();
            tokio::spawn(async move {
                let cancelled = emitter.cancelled();
                tokio::pin!(cancelled);
                loop {
                    tokio::select! {
                        _ = &mut cancelled => {
                            if let Some(hook) = on_cancel.take() {
                                hook();
                            }
                            break;
                        }
                        event = upstream.recv() => match event {
                            Some(FlowEvent::Value(value)) => {
                                emitter.emit(value);
                            }
                            Some(FlowEvent::Completed) => {
                                if let Some(hook) = on_complete.take() {
                                    hook(&FlowOutcome::Finished);
                                }
                                emitter.complete();
                                break;
                            }
                            Some(FlowEvent::Failed(error)) => {
                                let outcome = FlowOutcome::Failed(error);
                                if let Some(hook) = on_complete.take() {
                                    hook(&outcome);
                                }
                                let FlowOutcome::Failed(error) = outcome else {
                                    break;
                                };
                                emitter.fail(error);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            });
        })
    }
}

/// Joins two flows: no output until both sides have emitted at least
/// once, then a fresh pair on every subsequent emission from either
/// side. Completes only when both inputs complete; the first failure
/// from either side terminates immediately and cancels the other.
pub fn combine_latest<A, B>(a: Flow<A>, b: Flow<B>) -> Flow<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    Flow::new(move |emitter| {
        let mut left = a.subscribe();
        let mut right = b.subscribe();
        tokio::spawn(async move {
            let cancelled = emitter.cancelled();
            tokio::pin!(cancelled);
            let mut latest_left: Option<A> = None;
            let mut latest_right: Option<B> = None;
            let mut left_done = false;
            let mut right_done = false;
            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    event = left.recv(), if !left_done => match event {
                        Some(FlowEvent::Value(value)) => {
                            latest_left = Some(value);
                            if let (Some(l), Some(r)) = (&latest_left, &latest_right) {
                                emitter.emit((l.clone(), r.clone()));
                            }
                        }
                        Some(FlowEvent::Failed(error)) => {
                            emitter.fail(error);
                            break;
                        }
                        Some(FlowEvent::Completed) | None => {
                            left_done = true;
                            if right_done {
                                emitter.complete();
                                break;
                            }
                        }
                    },
                    event = right.recv(), if !right_done => match event {
                        Some(FlowEvent::Value(value)) => {
                            latest_right = Some(value);
                            if let (Some(l), Some(r)) = (&latest_left, &latest_right) {
                                emitter.emit((l.clone(), r.clone()));
                            }
                        }
                        Some(FlowEvent::Failed(error)) => {
                            emitter.fail(error);
                            break;
                        }
                        Some(FlowEvent::Completed) | None => {
                            right_done = true;
                            if left_done {
                                emitter.complete();
                                break;
                            }
                        }
                    },
                }
            }
        });
    })
}

/// Interleaves two flows, forwarding every value as it arrives.
/// Completion happens only after both inputs terminate. A failure on
/// one side does not short-circuit the other: the remaining side keeps
/// draining, then the first failure becomes the merged terminal.
pub fn merge<T: Send + 'static>(a: Flow<T>, b: Flow<T>) -> Flow<T> {
    Flow::new(move |emitter| {
        let mut left = a.subscribe();
        let mut right = b.subscribe();
        tokio::spawn(async move {
            let cancelled = emitter.cancelled();
            tokio::pin!(cancelled);
            let mut left_done = false;
            let mut right_done = false;
            let mut deferred_failure: Option<Error> = None;
            while !(left_done && right_done) {
                tokio::select! {
                    _ = &mut cancelled => return,
                    event = left.recv(), if !left_done => match event {
                        Some(FlowEvent::Value(value)) => {
                            emitter.emit(value);
                        }
                        Some(FlowEvent::Failed(error)) => {
                            left_done = true;
                            match deferred_failure {
                                None => deferred_failure = Some(error),
                                Some(_) => debug!(%error, "merge discarded a second failure"),
                            }
                        }
                        Some(FlowEvent::Completed) | None => left_done = true,
                    },
                    event = right.recv(), if !right_done => match event {
                        Some(FlowEvent::Value(value)) => {
                            emitter.emit(value);
                        }
                        Some(FlowEvent::Failed(error)) => {
                            right_done = true;
                            match deferred_failure {
                                None => deferred_failure = Some(error),
                                Some(_) => debug!(%error, "merge discarded a second failure"),
                            }
                        }
                        Some(FlowEvent::Completed) | None => right_done = true,
                    },
                }
            }
            match deferred_failure {
                Some(error) => emitter.fail(error),
                None => emitter.complete(),
            }
        });
    })
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
