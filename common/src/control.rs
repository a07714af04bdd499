use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    cycle::StatusIndicator,
    influx::ClientFactory,
    runtime::Logger,
    sensors::SensorBus,
    store::BlobStore,
    web::{handle, PostAction, WebReply, WebRequest},
};

pub const MAX_WAIT_MS: u64 = 1_000;
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Clock {
    fn monotonic_ms(&self) -> u64;

    fn epoch_ms(&self) -> Option<i64>;
}

pub struct Envelope {
    pub request: WebRequest,
    pub reply: Sender<WebReply>,
}

#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<Envelope>,
}

impl ControlHandle {
    pub fn call(&self, request: WebRequest) -> WebReply {
        let (reply_tx, reply_rx) = mpsc::channel();
        let envelope = Envelope {
            request,
            reply: reply_tx,
        };
        if self.tx.send(envelope).is_err() {
            return WebReply::text(503, "control loop stopped");
        }
        reply_rx
            .recv_timeout(REPLY_TIMEOUT)
            .unwrap_or_else(|_| WebReply::text(503, "control loop did not answer"))
    }
}

pub fn channel() -> (ControlHandle, Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel();
    (ControlHandle { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop(PostAction),
}

/// Serves at most one web request per iteration, then runs the upload
/// timer. Sole owner of the [`Logger`].
pub struct ControlLoop<S, F: ClientFactory, B, I, C> {
    logger: Logger<S, F, B>,
    requests: Receiver<Envelope>,
    indicator: I,
    clock: C,
    server_gone: bool,
}

impl<S, F, B, I, C> ControlLoop<S, F, B, I, C>
where
    S: BlobStore,
    F: ClientFactory,
    B: SensorBus,
    I: StatusIndicator,
    C: Clock,
{
    pub fn new(logger: Logger<S, F, B>, requests: Receiver<Envelope>, indicator: I, clock: C) -> Self {
        Self {
            logger,
            requests,
            indicator,
            clock,
            server_gone: false,
        }
    }

    pub fn logger(&self) -> &Logger<S, F, B> {
        &self.logger
    }

    pub fn step(&mut self) -> Step {
        let now = self.clock.monotonic_ms();
        let wait = Duration::from_millis(
            self.logger
                .next_cycle_in_ms(now)
                .unwrap_or(MAX_WAIT_MS)
                .min(MAX_WAIT_MS),
        );

        if self.server_gone {
            thread::sleep(wait);
        } else {
            match self.requests.recv_timeout(wait) {
                Ok(envelope) => {
                    let reply = handle(&mut self.logger, envelope.request, self.clock.monotonic_ms());
                    let after = reply.after;
                    if envelope.reply.send(reply).is_err() {
                        debug!("web client went away before the reply");
                    }
                    if let Some(action) = after {
                        return Step::Stop(action);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("web server channel closed; running without it");
                    self.server_gone = true;
                }
            }
        }

        let now = self.clock.monotonic_ms();
        match self.logger.tick(now, self.clock.epoch_ms()) {
            Some(Ok(_)) => self.indicator.signal_success(),
            Some(Err(_)) => self.indicator.signal_failure(),
            None => {}
        }
        Step::Continue
    }

    pub fn run(mut self) -> PostAction {
        loop {
            if let Step::Stop(action) = self.step() {
                return action;
            }
        }
    }
}
