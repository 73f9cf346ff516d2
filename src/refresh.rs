//! Single-flight credential refresh.
//!
//! The coordinator is a two-state machine (`Idle`, `Refreshing`) with a FIFO
//! queue attached. The first caller to need a refresh while idle becomes the
//! leader and performs it; callers arriving while the refresh is in flight
//! are queued and settled by the leader once it completes. If the leader's
//! future is dropped, leadership passes to the head of the queue.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::error::{ApiError, TerminalAuthError, TransportError};
use crate::session::SessionSignal;
use crate::transport::{ApiRequest, ApiResponse};

/// Network operations the coordinator drives.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Obtains a new credential. Does not store it.
    async fn refresh(&self) -> Result<Credential, ApiError>;

    /// Re-sends a request with headers derived from the current credential.
    /// A replay is never handed back to the coordinator.
    async fn replay(&self, request: ApiRequest) -> Result<ApiResponse, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
}

/// What a caller waits on the refresh for.
#[derive(Debug, Clone)]
enum Job {
    /// A request rejected with 401, replayed once the credential is replaced.
    Replay(ApiRequest),
    /// An explicit refresh; settles with the stored credential.
    Refresh,
}

impl Job {
    fn label(&self) -> &str {
        match self {
            Job::Replay(request) => &request.path,
            Job::Refresh => "explicit refresh",
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Response(ApiResponse),
    Credential(Credential),
}

impl Outcome {
    fn into_response(self) -> Result<ApiResponse, ApiError> {
        match self {
            Outcome::Response(response) => Ok(response),
            Outcome::Credential(_) => Err(TransportError::InvalidRequest(
                "refresh settled a replay with a credential".into(),
            )
            .into()),
        }
    }

    fn into_credential(self) -> Result<Credential, ApiError> {
        match self {
            Outcome::Credential(credential) => Ok(credential),
            Outcome::Response(_) => Err(TransportError::InvalidRequest(
                "refresh settled an explicit refresh with a response".into(),
            )
            .into()),
        }
    }
}

enum Handoff {
    Settled(Result<Outcome, ApiError>),
    /// The leader went away; the receiver leads from here. `refreshed` says
    /// whether the new credential is already stored.
    Lead { job: Job, refreshed: bool },
}

struct PendingRequest {
    job: Job,
    done: oneshot::Sender<Handoff>,
}

struct RefreshState {
    phase: RefreshPhase,
    queue: VecDeque<PendingRequest>,
}

enum Admission {
    Leader(Job),
    Replay(ApiRequest),
    Queued(oneshot::Receiver<Handoff>),
    Ended,
}

pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    credentials: Arc<CredentialStore>,
    session: Arc<SessionSignal>,
    refreshes: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(credentials: Arc<CredentialStore>, session: Arc<SessionSignal>) -> Self {
        Self {
            state: Mutex::new(RefreshState {
                phase: RefreshPhase::Idle,
                queue: VecDeque::new(),
            }),
            credentials,
            session,
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.state.lock().phase
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of refresh calls issued so far.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub async fn on_unauthorized<B>(
        &self,
        backend: &B,
        request: ApiRequest,
    ) -> Result<ApiResponse, ApiError>
    where
        B: SessionBackend + ?Sized,
    {
        self.settle(backend, Job::Replay(request)).await?.into_response()
    }

    /// Refreshes the credential outside a 401 episode. Joins a refresh that is
    /// already in flight instead of starting a second one. A failure is
    /// terminal exactly as it is for a replayed request.
    pub async fn refresh<B>(&self, backend: &B) -> Result<Credential, ApiError>
    where
        B: SessionBackend + ?Sized,
    {
        self.settle(backend, Job::Refresh).await?.into_credential()
    }

    async fn settle<B>(&self, backend: &B, job: Job) -> Result<Outcome, ApiError>
    where
        B: SessionBackend + ?Sized,
    {
        match self.admit(job) {
            Admission::Leader(job) => self.lead(backend, job, false).await,
            Admission::Replay(request) => {
                debug!(path = %request.path, "credential already replaced, replaying");
                backend.replay(request).await.map(Outcome::Response)
            }
            Admission::Queued(rx) => match rx.await {
                Ok(Handoff::Settled(result)) => result,
                Ok(Handoff::Lead { job, refreshed }) => {
                    debug!(job = job.label(), refreshed, "previous leader dropped, taking over");
                    self.lead(backend, job, refreshed).await
                }
                Err(_) => Err(TerminalAuthError::new("refresh abandoned").into()),
            },
            Admission::Ended => Err(TerminalAuthError::new("session ended").into()),
        }
    }

    // Observing the phase and enqueueing happen under one lock, with no
    // suspension point in between.
    fn admit(&self, job: Job) -> Admission {
        let mut state = self.state.lock();

        if state.phase == RefreshPhase::Refreshing {
            let (done, rx) = oneshot::channel();
            debug!(job = job.label(), queued = state.queue.len() + 1, "refresh in flight, queueing");
            state.queue.push_back(PendingRequest { job, done });
            return Admission::Queued(rx);
        }

        let request = match job {
            Job::Refresh => {
                state.phase = RefreshPhase::Refreshing;
                return Admission::Leader(Job::Refresh);
            }
            Job::Replay(request) => request,
        };

        let current = self.credentials.get();
        if current.as_ref() == request.sent_with() {
            state.phase = RefreshPhase::Refreshing;
            Admission::Leader(Job::Replay(request))
        } else if current.is_some() {
            // A refresh settled while this request was on the wire.
            Admission::Replay(request)
        } else {
            // The credential was cleared while this request was on the wire.
            Admission::Ended
        }
    }

    async fn lead<B>(&self, backend: &B, job: Job, refreshed: bool) -> Result<Outcome, ApiError>
    where
        B: SessionBackend + ?Sized,
    {
        let mut guard = LeaderGuard {
            coordinator: self,
            refreshed,
            in_progress: None,
            settled: false,
        };

        if !guard.refreshed {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            info!(trigger = job.label(), "refreshing credential");

            match backend.refresh().await {
                Ok(credential) => {
                    self.credentials.set(credential);
                    self.session.arm();
                    guard.refreshed = true;
                    info!("credential refreshed, settling waiters");
                }
                Err(error) => {
                    guard.settled = true;
                    return Err(self.fail(error));
                }
            }
        }

        let result = self.run(backend, job.clone()).await;
        let mut replayed = 0usize;
        while let Some(pending) = self.next_pending() {
            let job = pending.job.clone();
            guard.in_progress = Some(pending);
            let outcome = self.run(backend, job).await;
            if let Some(pending) = guard.in_progress.take() {
                // The waiter may have been dropped.
                let _ = pending.done.send(Handoff::Settled(outcome));
            }
            replayed += 1;
        }
        guard.settled = true;
        debug!(replayed, "refresh queue drained");
        result
    }

    async fn run<B>(&self, backend: &B, job: Job) -> Result<Outcome, ApiError>
    where
        B: SessionBackend + ?Sized,
    {
        match job {
            Job::Replay(request) => backend.replay(request).await.map(Outcome::Response),
            Job::Refresh => self
                .credentials
                .get()
                .map(Outcome::Credential)
                .ok_or_else(|| TerminalAuthError::new("session ended").into()),
        }
    }

    /// Clears the credential, rejects every waiter and raises one expiry.
    fn fail(&self, error: ApiError) -> ApiError {
        warn!(%error, "credential refresh failed");
        let terminal = TerminalAuthError::new(error.to_string());

        self.credentials.clear();
        let pending = {
            let mut state = self.state.lock();
            state.phase = RefreshPhase::Idle;
            std::mem::take(&mut state.queue)
        };

        let rejected = pending.len();
        for waiter in pending {
            let _ = waiter
                .done
                .send(Handoff::Settled(Err(terminal.clone().into())));
        }
        debug!(rejected, "rejected queued requests");

        self.session.expire(terminal.reason.clone());
        terminal.into()
    }

    /// Pops the next queued request, or returns to `Idle` when none is left.
    fn next_pending(&self) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        let next = state.queue.pop_front();
        if next.is_none() {
            state.phase = RefreshPhase::Idle;
        }
        next
    }
}

/// Hands leadership to the oldest live waiter if the leading future is
/// dropped before it settles. A job that was mid-replay goes back to the
/// front of the queue and is replayed again.
struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    refreshed: bool,
    in_progress: Option<PendingRequest>,
    settled: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.coordinator.state.lock();
        if let Some(pending) = self.in_progress.take() {
            state.queue.push_front(pending);
        }

        while let Some(next) = state.queue.pop_front() {
            let handoff = Handoff::Lead {
                job: next.job,
                refreshed: self.refreshed,
            };
            if next.done.send(handoff).is_ok() {
                debug!(queued = state.queue.len(), "leader dropped, leadership handed off");
                return;
            }
        }
        state.phase = RefreshPhase::Idle;
    }
}
