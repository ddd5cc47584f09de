//! Service container: the event loop that glues a [`Channel`] (held in a
//! [`ChannelManager`] so its deferred-task FIFO has somewhere to live), a
//! [`SessionHandler`], and the deferred send-path retry queue into the
//! single cooperatively scheduled task a service runs as.
//!
//! Lifecycle mirrors a typical service container: `initialize` builds the
//! channel and handler, `configure`/`validate` are hooks a concrete service
//! implements via [`ServiceLogic`], `run` drives the loop below until a
//! [`StopEvent`] is signalled, `finalize` tears the channel down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelManager, DeferredTask};
use crate::control::FbspHeader;
use crate::fbsp::send::{self, SendHooks, DEFAULT_RESUME_TIMEOUT};
use crate::fbsp::session::SessionHandler;

/// Hooks a concrete service implements around the container lifecycle.
/// Default implementations are no-ops, matching the "most services only
/// care about `run`" shape of the dispatch table they register into
/// [`SessionHandler`] directly.
pub trait ServiceLogic {
    fn configure(&mut self) {}
    fn validate(&mut self) -> Result<(), String> {
        Ok(())
    }
    /// Called once per container loop iteration when that iteration found
    /// nothing to do (no inbound messages, no deferred tasks). The default
    /// no-op is right for services with no periodic work of their own.
    fn idle(&mut self) {}
    fn finalize(&mut self) {}
}

/// A cooperative stop flag the container loop polls once per iteration.
/// Clone a handle out via [`ServiceContainer::stop_handle`] to request
/// shutdown from a signal handler, a test, or another task.
#[derive(Clone, Default)]
pub struct StopEvent(Arc<AtomicBool>);

impl StopEvent {
    pub fn new() -> Self {
        StopEvent(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One iteration's worth of work: how many inbound messages were processed
/// and how many deferred tasks (session retries) were drained. Returned
/// from [`ServiceContainer::tick`] so callers (and tests) can observe
/// progress without instrumenting the loop itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub messages_processed: usize,
    pub sessions_retried: usize,
}

struct LoggingHooks;
impl SendHooks for LoggingHooks {}

/// Owns the channel manager, session table, and retry cadence for one
/// running service.
pub struct ServiceContainer {
    channels: ChannelManager,
    primary: u32,
    handler: SessionHandler,
    resume_timeout: Duration,
    hooks: LoggingHooks,
    /// Whether `tick` drains the whole deferred queue in one pass (`true`)
    /// or just its head (`false`, the default — one per tick).
    process_all_deferred: bool,
    stop: StopEvent,
}

impl ServiceContainer {
    pub fn new(channel: Channel, handler: SessionHandler) -> Self {
        let mut channels = ChannelManager::new();
        let primary = channels.register(channel);
        ServiceContainer {
            channels,
            primary,
            handler,
            resume_timeout: DEFAULT_RESUME_TIMEOUT,
            hooks: LoggingHooks,
            process_all_deferred: false,
            stop: StopEvent::new(),
        }
    }

    pub fn with_resume_timeout(mut self, timeout: Duration) -> Self {
        self.resume_timeout = timeout;
        self
    }

    /// Process every deferred task in one call instead of one per tick.
    pub fn with_process_all_deferred(mut self, process_all: bool) -> Self {
        self.process_all_deferred = process_all;
        self
    }

    /// A handle that can signal this container's `run` loop to stop.
    pub fn stop_handle(&self) -> StopEvent {
        self.stop.clone()
    }

    /// Register an additional channel, returning the id later code uses to
    /// address it (e.g. from a [`DeferredTask`]).
    pub fn register_channel(&mut self, channel: Channel) -> u32 {
        self.channels.register(channel)
    }

    /// Run `logic.configure()` then `logic.validate()`, per the
    /// initialize→configure→validate lifecycle stage.
    pub fn prepare(&mut self, logic: &mut dyn ServiceLogic) -> Result<(), String> {
        logic.configure();
        logic.validate()
    }

    /// Process deferred callbacks, then every currently queued inbound
    /// message. One call is one "process deferred callbacks → poll →
    /// dispatch" cycle; `run` calls this in a loop and invokes
    /// [`ServiceLogic::idle`] when a cycle did nothing.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        for task in self.channels.process_deferred(self.process_all_deferred) {
            match task {
                DeferredTask::RetrySend { channel_id, routing_id } => {
                    let outcome = {
                        let Some(channel) = self.channels.get_mut(channel_id) else { continue };
                        let Some(session) = self.handler.session_mut(&routing_id) else { continue };
                        send::retry_send(channel, session, self.resume_timeout, &mut self.hooks)
                    };
                    debug!(?routing_id, ?outcome, "retried suspended session");
                    report.sessions_retried += 1;
                    if outcome == send::RetryOutcome::StillBlocked {
                        self.channels.defer(DeferredTask::RetrySend { channel_id, routing_id });
                    }
                }
            }
        }

        let mut inbound_batch = Vec::new();
        if let Some(channel) = self.channels.get_mut(self.primary) {
            while let Some(inbound) = channel.try_recv() {
                inbound_batch.push(inbound);
            }
        }
        for inbound in inbound_batch {
            self.dispatch_inbound(inbound).await;
            report.messages_processed += 1;
        }

        report
    }

    /// Run until `logic`'s container [`StopEvent`] is signalled. Idles on a
    /// short interval between ticks when nothing is queued, the
    /// cooperative-scheduling equivalent of blocking in a poll call.
    pub async fn run(&mut self, logic: &mut dyn ServiceLogic) {
        let mut idle = tokio::time::interval(Duration::from_millis(50));
        while !self.stop.is_stopped() {
            let report = self.tick().await;
            if report.messages_processed == 0 && report.sessions_retried == 0 {
                logic.idle();
                idle.tick().await;
            }
        }
    }

    async fn dispatch_inbound(&mut self, inbound: crate::channel::Inbound) {
        if inbound.frames.is_empty() {
            warn!("dropped inbound message with no header frame");
            return;
        }
        let header = match FbspHeader::unpack(&inbound.frames[0]) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "dropped malformed header");
                return;
            }
        };
        let payload = &inbound.frames[1..];
        let routing_id = inbound.routing_id.clone();

        let reply = self.handler.receive(routing_id.clone(), &header, payload);

        if let Some(endpoint) = self.handler.take_pending_disconnect() {
            if let Some(channel) = self.channels.get_mut(self.primary) {
                channel.disconnect(&endpoint);
            }
        }

        if let Some(reply) = reply {
            let (reply_header, reply_frames) = reply.to_wire();
            let session = self.handler.session_mut(&routing_id);
            let Some(channel) = self.channels.get_mut(self.primary) else { return };
            match send::send(channel, session, reply_header, reply_frames, true, &mut self.hooks) {
                Ok(true) => debug!(?routing_id, "reply sent"),
                Ok(false) => {
                    debug!(?routing_id, "reply deferred");
                    self.channels.defer(DeferredTask::RetrySend {
                        channel_id: self.primary,
                        routing_id,
                    });
                }
                Err(e) => error!(?routing_id, error = %e, "failed to send reply"),
            }
        }
    }
}

/// Run the lifecycle end to end: prepare, run until stopped, finalize.
/// Intended as the body of a service's `main`.
pub async fn run_service(mut container: ServiceContainer, mut logic: impl ServiceLogic) -> Result<(), String> {
    container.prepare(&mut logic)?;
    info!("service container starting");
    container.run(&mut logic).await;
    logic.finalize();
    info!("service container stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_event_starts_unset_and_latches() {
        let stop = StopEvent::new();
        assert!(!stop.is_stopped());
        stop.stop();
        assert!(stop.is_stopped());
    }

    #[test]
    fn stop_event_clone_shares_state() {
        let stop = StopEvent::new();
        let handle = stop.clone();
        handle.stop();
        assert!(stop.is_stopped());
    }
}
