//! Serializes the updates of a single channel.
//!
//! Both parties may try to propose the next update at the same time. Each
//! side runs one [SerializedQueue] per channel, which executes our own
//! ("self") updates and the counterparty's ("other") updates strictly one at
//! a time. Which side wins a race is decided by the [NoncePolicy]: the side
//! whose next nonce is larger has priority, ties go to alice. A running
//! update of the side without priority is interrupted when an update of the
//! side with priority arrives, it is retried afterwards.

use std::{collections::VecDeque, future::Future, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("update has nonce {actual}, expected {expected}")]
    NonceMismatch { expected: u64, actual: u64 },
    #[error("update queue closed")]
    Closed,
    #[error("could not read the current nonce: {0}")]
    NonceUnavailable(String),
}

/// Nonce each party proposes its next update with.
pub trait NoncePolicy: Send + Sync + 'static {
    fn next_nonce(&self, current: u64, is_alice: bool) -> u64;
}

/// Parties take turns in blocks of two, alice proposes 1, 4, 5, 8, 9, ...
/// and bob 2, 3, 6, 7, ..., so concurrent proposals never share a nonce.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnTaking;

impl NoncePolicy for TurnTaking {
    fn next_nonce(&self, current: u64, is_alice: bool) -> u64 {
        let rotated = current % 4;
        let mapped = match (is_alice, rotated) {
            (true, 0) => 1,
            (true, _) => 4,
            (false, 3) => 6,
            (false, 2) => 3,
            (false, _) => 2,
        };
        current - rotated + mapped
    }
}

/// Every update increments the nonce by one, whoever proposes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl NoncePolicy for Sequential {
    fn next_nonce(&self, current: u64, _is_alice: bool) -> u64 {
        current + 1
    }
}

/// Handed to a running update, fires when it should step aside for a
/// higher priority update.
#[derive(Debug, Clone)]
pub struct Interrupt(Option<watch::Receiver<bool>>);

impl Interrupt {
    pub fn never() -> Self {
        Self(None)
    }

    pub fn is_fired(&self) -> bool {
        self.0.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Completes once the interrupt fired, never if it cannot fire anymore.
    pub async fn fired(&self) {
        if let Some(rx) = &self.0 {
            let mut rx = rx.clone();
            if rx.wait_for(|fired| *fired).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Executes the updates of one channel on behalf of a [SerializedQueue].
///
/// `execute_self` and `execute_other` return `None` if they were
/// interrupted before changing anything, the update is then queued again.
#[async_trait]
pub trait UpdateExecutor: Send + Sync + 'static {
    type SelfUpdate: Send + Sync + 'static;
    type OtherUpdate: Send + Sync + 'static;
    type SelfOutput: Send + 'static;
    type OtherOutput: Send + 'static;
    type SelfError: From<QueueError> + Send + 'static;
    type OtherError: From<QueueError> + Send + 'static;

    async fn current_nonce(&self) -> Result<u64, QueueError>;

    async fn execute_self(
        &self,
        update: &Self::SelfUpdate,
        interrupt: Interrupt,
    ) -> Option<Result<Self::SelfOutput, Self::SelfError>>;

    async fn execute_other(
        &self,
        update: &Self::OtherUpdate,
        interrupt: Interrupt,
    ) -> Option<Result<Self::OtherOutput, Self::OtherError>>;

    fn other_nonce(&self, update: &Self::OtherUpdate) -> u64;

    /// Whether `update` may run when the counterparty's next nonce is
    /// `expected`.
    fn matches_nonce(&self, update: &Self::OtherUpdate, expected: u64) -> bool {
        self.other_nonce(update) == expected
    }
}

type SelfResult<E> = Result<<E as UpdateExecutor>::SelfOutput, <E as UpdateExecutor>::SelfError>;
type OtherResult<E> =
    Result<<E as UpdateExecutor>::OtherOutput, <E as UpdateExecutor>::OtherError>;

struct SelfJob<E: UpdateExecutor> {
    update: E::SelfUpdate,
    reply: oneshot::Sender<SelfResult<E>>,
}

struct OtherJob<E: UpdateExecutor> {
    update: E::OtherUpdate,
    reply: oneshot::Sender<OtherResult<E>>,
}

/// Handle to the queue of one channel. The queue stops once all handles
/// are dropped.
pub struct SerializedQueue<E: UpdateExecutor> {
    self_tx: mpsc::UnboundedSender<SelfJob<E>>,
    other_tx: mpsc::UnboundedSender<OtherJob<E>>,
}

impl<E: UpdateExecutor> Clone for SerializedQueue<E> {
    fn clone(&self) -> Self {
        Self {
            self_tx: self.self_tx.clone(),
            other_tx: self.other_tx.clone(),
        }
    }
}

impl<E: UpdateExecutor> SerializedQueue<E> {
    /// Spawn the queue on the current tokio runtime.
    pub fn new(executor: Arc<E>, is_alice: bool, policy: Box<dyn NoncePolicy>) -> Self {
        let (self_tx, self_rx) = mpsc::unbounded_channel();
        let (other_tx, other_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            executor,
            is_alice,
            policy,
            self_rx,
            other_rx,
            self_open: true,
            other_open: true,
            selfs: VecDeque::new(),
            others: VecDeque::new(),
        };
        tokio::spawn(worker.run());
        Self { self_tx, other_tx }
    }

    /// Queue one of our own updates. It is queued immediately, the returned
    /// future only waits for the result.
    pub fn execute_self(
        &self,
        update: E::SelfUpdate,
    ) -> impl Future<Output = SelfResult<E>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.self_tx.send(SelfJob { update, reply }).is_ok();
        async move {
            if !sent {
                return Err(QueueError::Closed.into());
            }
            rx.await.unwrap_or_else(|_| Err(QueueError::Closed.into()))
        }
    }

    /// Queue an update proposed by the counterparty.
    pub fn execute_other(
        &self,
        update: E::OtherUpdate,
    ) -> impl Future<Output = OtherResult<E>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.other_tx.send(OtherJob { update, reply }).is_ok();
        async move {
            if !sent {
                return Err(QueueError::Closed.into());
            }
            rx.await.unwrap_or_else(|_| Err(QueueError::Closed.into()))
        }
    }
}

struct Worker<E: UpdateExecutor> {
    executor: Arc<E>,
    is_alice: bool,
    policy: Box<dyn NoncePolicy>,
    self_rx: mpsc::UnboundedReceiver<SelfJob<E>>,
    other_rx: mpsc::UnboundedReceiver<OtherJob<E>>,
    self_open: bool,
    other_open: bool,
    selfs: VecDeque<SelfJob<E>>,
    others: VecDeque<OtherJob<E>>,
}

impl<E: UpdateExecutor> Worker<E> {
    async fn run(mut self) {
        loop {
            self.drain();
            if self.selfs.is_empty() && self.others.is_empty() {
                if !self.wait_for_job().await {
                    trace!("update queue stopped");
                    return;
                }
                continue;
            }

            let current = match self.executor.current_nonce().await {
                Ok(nonce) => nonce,
                Err(e) => {
                    self.fail_front(e);
                    continue;
                }
            };
            let self_next = self.policy.next_nonce(current, self.is_alice);
            let other_next = self.policy.next_nonce(current, !self.is_alice);
            let self_priority = self_next > other_next || (self_next == other_next && self.is_alice);

            if self_priority {
                if let Some(job) = self.selfs.pop_front() {
                    self.run_self(job, false, other_next).await;
                } else if let Some(job) = self.others.pop_front() {
                    if self.check_other(&job, other_next) {
                        self.run_other(job, true, other_next).await;
                    } else {
                        self.reject(job, other_next);
                    }
                }
            } else if let Some(job) = self.others.pop_front() {
                if self.check_other(&job, other_next) {
                    self.run_other(job, false, other_next).await;
                } else {
                    self.reject(job, other_next);
                }
            } else if let Some(job) = self.selfs.pop_front() {
                self.run_self(job, true, other_next).await;
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(job) = self.self_rx.try_recv() {
            self.selfs.push_back(job);
        }
        while let Ok(job) = self.other_rx.try_recv() {
            self.others.push_back(job);
        }
    }

    /// Wait until a job arrives, `false` once no job can arrive anymore.
    async fn wait_for_job(&mut self) -> bool {
        tokio::select! {
            job = self.self_rx.recv(), if self.self_open => match job {
                Some(job) => self.selfs.push_back(job),
                None => self.self_open = false,
            },
            job = self.other_rx.recv(), if self.other_open => match job {
                Some(job) => self.others.push_back(job),
                None => self.other_open = false,
            },
            else => return false,
        }
        true
    }

    fn fail_front(&mut self, error: QueueError) {
        debug!(%error, "failing queued update");
        if let Some(job) = self.others.pop_front() {
            let _ = job.reply.send(Err(error.into()));
        } else if let Some(job) = self.selfs.pop_front() {
            let _ = job.reply.send(Err(error.into()));
        }
    }

    fn check_other(&self, job: &OtherJob<E>, expected: u64) -> bool {
        self.executor.matches_nonce(&job.update, expected)
    }

    fn reject(&self, job: OtherJob<E>, expected: u64) {
        let actual = self.executor.other_nonce(&job.update);
        debug!(expected, actual, "rejecting counterparty update");
        let _ = job
            .reply
            .send(Err(QueueError::NonceMismatch { expected, actual }.into()));
    }

    /// Queue (or reject) a counterparty update that arrived while another
    /// update runs. Returns whether it was queued.
    fn arrived_other(&mut self, job: OtherJob<E>, expected: u64) -> bool {
        if self.check_other(&job, expected) {
            self.others.push_back(job);
            true
        } else {
            self.reject(job, expected);
            false
        }
    }

    async fn run_self(&mut self, job: SelfJob<E>, interruptible: bool, other_next: u64) {
        let (fire, interrupt) = interrupt_pair(interruptible);
        let executor = Arc::clone(&self.executor);
        let mut task = Box::pin(async move {
            let result = executor.execute_self(&job.update, interrupt).await;
            (job, result)
        });

        let (job, result) = loop {
            tokio::select! {
                out = &mut task => break out,
                job = self.other_rx.recv(), if self.other_open => match job {
                    Some(job) => {
                        if self.arrived_other(job, other_next) && interruptible {
                            trace!("interrupting own update");
                            let _ = fire.send(true);
                        }
                    }
                    None => self.other_open = false,
                },
                job = self.self_rx.recv(), if self.self_open => match job {
                    Some(job) => self.selfs.push_back(job),
                    None => self.self_open = false,
                },
            }
        };

        match result {
            Some(result) => {
                let _ = job.reply.send(result);
            }
            None => self.selfs.push_front(job),
        }
    }

    async fn run_other(&mut self, job: OtherJob<E>, interruptible: bool, other_next: u64) {
        let (fire, interrupt) = interrupt_pair(interruptible);
        let executor = Arc::clone(&self.executor);
        let mut task = Box::pin(async move {
            let result = executor.execute_other(&job.update, interrupt).await;
            (job, result)
        });

        let (job, result) = loop {
            tokio::select! {
                out = &mut task => break out,
                job = self.self_rx.recv(), if self.self_open => match job {
                    Some(job) => {
                        self.selfs.push_back(job);
                        if interruptible {
                            trace!("interrupting counterparty update");
                            let _ = fire.send(true);
                        }
                    }
                    None => self.self_open = false,
                },
                job = self.other_rx.recv(), if self.other_open => match job {
                    Some(job) => {
                        self.arrived_other(job, other_next);
                    }
                    None => self.other_open = false,
                },
            }
        };

        match result {
            Some(result) => {
                let _ = job.reply.send(result);
            }
            None => self.others.push_front(job),
        }
    }
}

fn interrupt_pair(interruptible: bool) -> (watch::Sender<bool>, Interrupt) {
    let (tx, rx) = watch::channel(false);
    let interrupt = if interruptible {
        Interrupt(Some(rx))
    } else {
        Interrupt::never()
    };
    (tx, interrupt)
}
