//! The agreement driver: a state machine around acquire, replay, DirSync
//! and backoff.
//!
//! One driver task runs per agreement. It sleeps on the agreement's event
//! set, consumes latched events at each transition, and owns the periodic
//! DirSync timer and the backoff timer. Shutdown is cooperative: `stop()`
//! raises the shutdown event and waits for the runner to acknowledge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::agreement::Agreement;
use crate::backoff::{BackoffStrategy, BackoffTimer};
use crate::connection::{Capability, ConnResult, ConnectionControl, RemoteDirectory};
use crate::events::{
    event_name, EventSet, EVENT_AGMT_CHANGED, EVENT_BACKOFF_EXPIRED, EVENT_PROTOCOL_SHUTDOWN,
    EVENT_REPLICATE_NOW, EVENT_RUN_DIRSYNC, EVENT_TRIGGERING_CRITERIA_MET, EVENT_WINDOW_CLOSED,
    EVENT_WINDOW_OPENED,
};
use crate::inbound;
use crate::outbound::{self, UpdateResult};
use crate::ruv::Ruv;
use crate::store::DirectoryStore;

pub const PROTOCOL_BACKOFF_MINIMUM: u64 = 3;
pub const PROTOCOL_BACKOFF_MAXIMUM: u64 = 60 * 5;
pub const PROTOCOL_BUSY_BACKOFF_MINIMUM: u64 = PROTOCOL_BACKOFF_MINIMUM;

/// Maximum time to wait between replication sessions; on expiry a session
/// is started anyway, just to be safe.
pub const MAX_WAIT_BETWEEN_SESSIONS: Duration = Duration::from_secs(60 * 5);

/// Period of the inbound DirSync poll.
pub const PERIODIC_DIRSYNC_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// How long `stop()` waits for the runner to acknowledge before declaring
/// the shutdown non-graceful.
pub const PROTOCOL_STOP_GRACE: Duration = Duration::from_secs(1200);

/// A backoff timer whose expiry event went missing is killed once it is
/// this many seconds past due.
const STALE_BACKOFF_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Start,
    WaitWindowOpen,
    WaitChanges,
    ReadyToAcquire,
    BackoffStart,
    Backoff,
    SendingUpdates,
    StopFatalError,
    StopFatalErrorPart2,
    StopNormalTermination,
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Start => "start",
        State::WaitWindowOpen => "wait_for_window_to_open",
        State::WaitChanges => "wait_for_changes",
        State::ReadyToAcquire => "ready_to_acquire_replica",
        State::BackoffStart => "start_backoff",
        State::Backoff => "backoff",
        State::SendingUpdates => "sending_updates",
        State::StopFatalError | State::StopFatalErrorPart2 => "stop_fatal_error",
        State::StopNormalTermination => "stop_normal_termination",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireCode {
    Success,
    ReplicaBusy,
    FatalError,
    ConsumerWasUptodate,
    TransientError,
}

fn acquire_name(code: AcquireCode) -> &'static str {
    match code {
        AcquireCode::Success => "success",
        AcquireCode::ReplicaBusy => "replica_busy",
        AcquireCode::FatalError => "fatal_error",
        AcquireCode::ConsumerWasUptodate => "consumer_was_uptodate",
        AcquireCode::TransientError => "transient_error",
    }
}

/// Verdict on the consumer's update vector before replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExamineRuv {
    PristineReplica,
    GenerationMismatch,
    ReplicaTooOld,
    Ok,
    ParamError,
}

/// Normalize the post-session pause and the busy-wait interval. The pause
/// must always exceed the busy wait so another supplier can get in.
pub fn set_pause_and_busy_time(pausetime: &mut i64, busywaittime: &mut i64) {
    if *pausetime == 0 && *busywaittime == 0 {
        *busywaittime = PROTOCOL_BUSY_BACKOFF_MINIMUM as i64;
    } else if *pausetime != 0 && *busywaittime == 0 {
        if *pausetime < 2 {
            *pausetime = 2;
        }
        *busywaittime = *pausetime - 1;
    } else if *pausetime == 0 && *busywaittime != 0 {
        *pausetime = *busywaittime + 1;
    } else if *pausetime <= *busywaittime {
        *pausetime = *busywaittime + 1;
    }
}

/// Notification surface shared by every protocol flavor; cloneable and
/// safe to call from any task.
#[derive(Clone)]
pub struct ProtocolHandle {
    events: Arc<EventSet>,
    terminate: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl ProtocolHandle {
    pub(crate) fn new(
        events: Arc<EventSet>,
        terminate: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    ) -> ProtocolHandle {
        ProtocolHandle { events, terminate, stopped }
    }

    /// A change landed in the replicated area.
    pub fn notify_update(&self) {
        self.events.notify(EVENT_TRIGGERING_CRITERIA_MET);
    }

    pub fn notify_agmt_changed(&self) {
        self.events.notify(EVENT_AGMT_CHANGED);
    }

    pub fn notify_window_opened(&self) {
        self.events.notify(EVENT_WINDOW_OPENED);
    }

    pub fn notify_window_closed(&self) {
        self.events.notify(EVENT_WINDOW_CLOSED);
    }

    pub fn update_now(&self) {
        self.events.notify(EVENT_REPLICATE_NOW);
    }

    pub fn run_dirsync(&self) {
        self.events.notify(EVENT_RUN_DIRSYNC);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Request shutdown and wait for the runner to acknowledge. Returns
    /// `false` when the grace period ran out and teardown proceeds
    /// non-gracefully.
    pub async fn stop(&self) -> bool {
        self.terminate.store(true, Ordering::SeqCst);
        self.events.notify(EVENT_PROTOCOL_SHUTDOWN);
        let start = Instant::now();
        while !self.is_stopped() && start.elapsed() < PROTOCOL_STOP_GRACE {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if self.is_stopped() {
            debug!("protocol stopped after {} seconds", start.elapsed().as_secs());
            true
        } else {
            warn!(
                "protocol did not stop after {} seconds; continuing teardown",
                PROTOCOL_STOP_GRACE.as_secs()
            );
            false
        }
    }
}

/// The capability set both protocol flavors implement.
#[async_trait]
pub trait SyncProtocol: Send {
    /// Run until shutdown (incremental) or completion (total refresh).
    async fn run(&mut self);
    fn handle(&self) -> ProtocolHandle;
}

/// The incremental synchronization protocol.
pub struct WindowsIncProtocol<S, C> {
    agmt: Arc<Agreement>,
    store: Arc<S>,
    conn: C,
    events: Arc<EventSet>,
    terminate: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    backoff: Option<BackoffTimer>,
    replica_acquired: bool,
    last_acquire_code: AcquireCode,
    dirsync_timer: Option<JoinHandle<()>>,
}

impl<S, C> WindowsIncProtocol<S, C>
where
    S: DirectoryStore,
    C: RemoteDirectory + ConnectionControl,
{
    pub fn new(agmt: Arc<Agreement>, store: Arc<S>, conn: C) -> WindowsIncProtocol<S, C> {
        WindowsIncProtocol {
            agmt,
            store,
            conn,
            events: Arc::new(EventSet::new()),
            terminate: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            backoff: None,
            replica_acquired: false,
            last_acquire_code: AcquireCode::Success,
            dirsync_timer: None,
        }
    }

    fn is_shutdown(&self) -> bool {
        // occurred() clears the bit, so the terminate flag is consulted as
        // well; a later check must still see the shutdown.
        self.events.occurred(EVENT_PROTOCOL_SHUTDOWN) || self.terminate.load(Ordering::SeqCst)
    }

    async fn protocol_sleep(&self, duration: Option<Duration>) {
        self.events.sleep(duration).await;
    }

    fn unexpected_event(&self, state: State, event: u32) {
        debug!(
            "{}: incremental protocol: event {} consumed as a wake-up in state {}",
            self.agmt.long_name(),
            event_name(event),
            state_name(state)
        );
    }

    /// Acquire the consumer: check whether it is already up to date, then
    /// connect and make sure a CSN can be generated for the session.
    async fn acquire_replica(&mut self, check_ruv: bool) -> (AcquireCode, Option<Ruv>) {
        if self.replica_acquired {
            warn!("{}: remote replica already acquired", self.agmt.long_name());
            return (AcquireCode::Success, None);
        }
        let name = self.agmt.long_name();

        let consumer_ruv = match self.store.load_consumer_ruv(&name).await {
            Ok(ruv) => ruv,
            Err(err) => {
                error!("{}: failed to load the consumer RUV: {}", name, err);
                return (AcquireCode::TransientError, None);
            }
        };
        let is_newer = match (&consumer_ruv, self.store.local_ruv().await) {
            (None, _) => true,
            (Some(consumer), Ok(local)) => local.is_newer_than(consumer),
            (_, Err(err)) => {
                error!("{}: failed to read the local RUV: {}", name, err);
                return (AcquireCode::TransientError, None);
            }
        };

        // The consumer-RUV check is skipped when a dirsync pass is due:
        // there may be nothing to push, but there is something to pull.
        if !is_newer && check_ruv {
            self.last_acquire_code = AcquireCode::ConsumerWasUptodate;
            return (AcquireCode::ConsumerWasUptodate, consumer_ruv);
        }

        let code = match self.conn.connect().await {
            ConnResult::Success => {
                // An operation is about to go out; the linger timer must
                // not fire in the middle of it.
                self.conn.cancel_linger().await;
                if self.conn.replica_supports_dirsync().await == Capability::Unknown {
                    AcquireCode::TransientError
                } else {
                    match self.store.current_csn(&self.agmt.local_subtree()).await {
                        Ok(Some(_)) => AcquireCode::Success,
                        _ => {
                            error!(
                                "{}: unable to obtain the current CSN; replication is aborting",
                                name
                            );
                            AcquireCode::FatalError
                        }
                    }
                }
            }
            ConnResult::TlsNotEnabled => AcquireCode::FatalError,
            _ => AcquireCode::TransientError,
        };

        if code == AcquireCode::Success {
            self.replica_acquired = true;
        } else {
            // Not acquired, so release will not run; reinstate the linger
            // timer here.
            self.conn.start_linger().await;
        }
        self.last_acquire_code = code;
        (code, consumer_ruv)
    }

    async fn release_replica(&mut self) {
        if !self.replica_acquired {
            return;
        }
        self.conn.start_linger().await;
        self.replica_acquired = false;
    }

    async fn examine_update_vector(&self, ruv: Option<&Ruv>) -> ExamineRuv {
        let remote_ruv = match ruv {
            None => return ExamineRuv::PristineReplica,
            Some(ruv) => ruv,
        };
        let local_ruv = match self.store.local_ruv().await {
            Ok(ruv) => ruv,
            Err(_) => return ExamineRuv::ParamError,
        };
        match (remote_ruv.generation(), local_ruv.generation()) {
            (Some(remote_gen), Some(local_gen)) if remote_gen == local_gen => ExamineRuv::Ok,
            _ => ExamineRuv::GenerationMismatch,
        }
    }

    async fn record_acquire_failure(&mut self) {
        let (_, code) = self.conn.get_error().await;
        let acquire = self.last_acquire_code;
        self.agmt.set_last_update_status(code, acquire as i32, acquire_name(acquire));
    }

    /// The main state machine. Does not return until the protocol shuts
    /// down.
    async fn run_state_machine(&mut self) {
        let name = self.agmt.long_name();
        let mut current_state = State::Start;
        let mut next_state = State::Start;
        let mut done = false;
        let mut is_first_start = true;
        let mut run_dirsync = false;
        let mut wait_change_timer_set = false;
        let mut use_busy_backoff_timer = false;
        let mut pausetime: i64 = 0;
        let mut busywaittime: i64 = 0;
        let mut num_changes_sent: u32 = 0;
        let mut ruv: Option<Ruv> = None;

        self.stopped.store(false, Ordering::SeqCst);
        if let Ok(Some(cookie)) = self.store.load_cookie(&name).await {
            self.agmt.set_cookie(Some(cookie));
        }

        while !done {
            match current_state {
                State::Start => {
                    if self.is_shutdown() {
                        done = true;
                        continue;
                    }
                    next_state = if self.agmt.schedule_in_window_now() {
                        State::ReadyToAcquire
                    } else {
                        State::WaitWindowOpen
                    };
                    // Stale events from previous states must not confuse a
                    // fresh start.
                    self.events.reset();
                    self.conn.cancel_linger().await;
                    self.conn.disconnect().await;
                    pausetime = self.agmt.pausetime();
                    busywaittime = self.agmt.busywaittime();
                    if pausetime != 0 || busywaittime != 0 {
                        set_pause_and_busy_time(&mut pausetime, &mut busywaittime);
                    }
                    if is_first_start {
                        let events = self.events.clone();
                        self.dirsync_timer = Some(tokio::spawn(async move {
                            loop {
                                tokio::time::sleep(PERIODIC_DIRSYNC_INTERVAL).await;
                                events.notify(EVENT_RUN_DIRSYNC);
                            }
                        }));
                        is_first_start = false;
                    }
                }

                State::WaitWindowOpen => {
                    if self.is_shutdown() {
                        done = true;
                    } else if self.events.occurred(EVENT_WINDOW_OPENED) {
                        next_state = State::ReadyToAcquire;
                    } else if self.events.occurred(EVENT_REPLICATE_NOW) {
                        next_state = State::ReadyToAcquire;
                    } else if self.events.occurred(EVENT_AGMT_CHANGED) {
                        next_state = State::Start;
                        run_dirsync = true;
                        self.conn.set_agmt_changed().await;
                    } else if self.events.occurred(EVENT_RUN_DIRSYNC) {
                        // The window is closed; remember the request for
                        // the next session instead of spinning on the
                        // latched bit.
                        run_dirsync = true;
                    } else if self.events.occurred(EVENT_TRIGGERING_CRITERIA_MET) {
                        self.protocol_sleep(None).await;
                    } else if self.events.occurred(EVENT_WINDOW_CLOSED) {
                        self.unexpected_event(current_state, EVENT_WINDOW_CLOSED);
                        self.protocol_sleep(None).await;
                    } else if self.events.occurred(EVENT_BACKOFF_EXPIRED) {
                        self.unexpected_event(current_state, EVENT_BACKOFF_EXPIRED);
                        self.protocol_sleep(None).await;
                    } else {
                        debug!(
                            "{}: incremental protocol: waiting for the update window to open",
                            name
                        );
                        self.protocol_sleep(None).await;
                    }
                }

                State::WaitChanges => {
                    if self.is_shutdown() {
                        done = true;
                    } else if self.events.occurred(EVENT_REPLICATE_NOW) {
                        next_state = State::ReadyToAcquire;
                        wait_change_timer_set = false;
                        run_dirsync = true;
                    } else if self.events.occurred(EVENT_RUN_DIRSYNC) {
                        next_state = State::ReadyToAcquire;
                        wait_change_timer_set = false;
                        run_dirsync = true;
                    } else if self.events.occurred(EVENT_AGMT_CHANGED) {
                        next_state = State::Start;
                        self.conn.set_agmt_changed().await;
                        wait_change_timer_set = false;
                        // An agreement change doubles as "send updates
                        // now"; pull as well.
                        run_dirsync = true;
                    } else if self.events.occurred(EVENT_WINDOW_CLOSED) {
                        next_state = State::WaitWindowOpen;
                        wait_change_timer_set = false;
                    } else if self.events.occurred(EVENT_TRIGGERING_CRITERIA_MET) {
                        next_state = State::ReadyToAcquire;
                        wait_change_timer_set = false;
                    } else if self.events.occurred(EVENT_WINDOW_OPENED) {
                        self.unexpected_event(current_state, EVENT_WINDOW_OPENED);
                        wait_change_timer_set = false;
                    } else if self.events.occurred(EVENT_BACKOFF_EXPIRED) {
                        self.unexpected_event(current_state, EVENT_BACKOFF_EXPIRED);
                        wait_change_timer_set = false;
                    } else if wait_change_timer_set {
                        // The inter-session timer expired with nothing to
                        // do; run a safety session anyway.
                        next_state = State::Start;
                        run_dirsync = true;
                        wait_change_timer_set = false;
                    } else {
                        wait_change_timer_set = true;
                        self.protocol_sleep(Some(MAX_WAIT_BETWEEN_SESSIONS)).await;
                    }
                }

                State::ReadyToAcquire => {
                    if self.is_shutdown() {
                        done = true;
                        continue;
                    }
                    let (code, new_ruv) = self.acquire_replica(!run_dirsync).await;
                    debug!("{}: acquire_replica returned {}", name, acquire_name(code));
                    ruv = new_ruv;
                    use_busy_backoff_timer = false;
                    next_state = match code {
                        AcquireCode::Success => State::SendingUpdates,
                        AcquireCode::ReplicaBusy => {
                            use_busy_backoff_timer = true;
                            State::BackoffStart
                        }
                        AcquireCode::ConsumerWasUptodate => State::WaitChanges,
                        AcquireCode::TransientError => State::BackoffStart,
                        AcquireCode::FatalError => State::StopFatalError,
                    };
                    if code != AcquireCode::Success {
                        self.record_acquire_failure().await;
                    }
                }

                State::BackoffStart => {
                    if self.is_shutdown() {
                        done = true;
                    } else if self.events.occurred(EVENT_REPLICATE_NOW) {
                        next_state = State::ReadyToAcquire;
                    } else if self.events.occurred(EVENT_RUN_DIRSYNC) {
                        run_dirsync = true;
                        next_state = State::ReadyToAcquire;
                    } else if self.events.occurred(EVENT_AGMT_CHANGED) {
                        next_state = State::Start;
                        run_dirsync = true;
                        self.conn.set_agmt_changed().await;
                    } else if self.events.occurred(EVENT_WINDOW_CLOSED) {
                        next_state = State::WaitWindowOpen;
                    } else if self.events.occurred(EVENT_TRIGGERING_CRITERIA_MET) {
                        // Consume and ignore; the backoff governs retries.
                    } else if self.events.occurred(EVENT_WINDOW_OPENED) {
                        self.unexpected_event(current_state, EVENT_WINDOW_OPENED);
                    } else if self.events.occurred(EVENT_BACKOFF_EXPIRED) {
                        self.unexpected_event(current_state, EVENT_BACKOFF_EXPIRED);
                    } else {
                        let mut timer = if use_busy_backoff_timer {
                            // The consumer said busy; wait a fixed
                            // interval, not an exponential ramp.
                            let busy = if busywaittime > 0 {
                                busywaittime as u64
                            } else {
                                PROTOCOL_BUSY_BACKOFF_MINIMUM
                            };
                            BackoffTimer::new(BackoffStrategy::Fixed, busy, busy)
                        } else {
                            BackoffTimer::new(
                                BackoffStrategy::Exponential,
                                PROTOCOL_BACKOFF_MINIMUM,
                                PROTOCOL_BACKOFF_MAXIMUM,
                            )
                        };
                        let delay = timer.reset(self.events.clone());
                        debug!(
                            "{}: replication session backing off for {} seconds",
                            name, delay
                        );
                        self.backoff = Some(timer);
                        next_state = State::Backoff;
                        use_busy_backoff_timer = false;
                        self.protocol_sleep(None).await;
                    }
                }

                State::Backoff => {
                    if self.is_shutdown() {
                        self.backoff = None;
                        done = true;
                    } else if self.events.occurred(EVENT_REPLICATE_NOW) {
                        self.backoff = None;
                        next_state = State::ReadyToAcquire;
                    } else if self.events.occurred(EVENT_RUN_DIRSYNC) {
                        self.backoff = None;
                        run_dirsync = true;
                        next_state = State::ReadyToAcquire;
                    } else if self.events.occurred(EVENT_AGMT_CHANGED) {
                        next_state = State::Start;
                        run_dirsync = true;
                        self.conn.set_agmt_changed().await;
                        self.backoff = None;
                    } else if self.events.occurred(EVENT_WINDOW_CLOSED) {
                        next_state = State::WaitWindowOpen;
                        self.backoff = None;
                    } else if self.events.occurred(EVENT_BACKOFF_EXPIRED) {
                        let (code, new_ruv) = self.acquire_replica(true).await;
                        debug!("{}: acquire_replica returned {}", name, acquire_name(code));
                        ruv = new_ruv;
                        next_state = match code {
                            AcquireCode::Success => State::SendingUpdates,
                            AcquireCode::ReplicaBusy => State::Backoff,
                            AcquireCode::ConsumerWasUptodate => State::WaitChanges,
                            AcquireCode::TransientError => State::Backoff,
                            AcquireCode::FatalError => State::StopFatalError,
                        };
                        if code != AcquireCode::Success {
                            self.record_acquire_failure().await;
                        }
                        if next_state == State::Backoff {
                            if let Some(timer) = self.backoff.as_mut() {
                                let delay = timer.step(self.events.clone());
                                debug!(
                                    "{}: replication session backing off for {} seconds",
                                    name, delay
                                );
                            }
                            self.protocol_sleep(None).await;
                        } else {
                            self.backoff = None;
                        }
                    } else if self.events.occurred(EVENT_TRIGGERING_CRITERIA_MET) {
                        // Changes are available. A backoff timer long past
                        // its fire time lost its expiry event; kill it and
                        // go, rather than hanging here forever.
                        let stale = self
                            .backoff
                            .as_ref()
                            .map(|t| t.expired_for(STALE_BACKOFF_SECS))
                            .unwrap_or(true);
                        if stale {
                            self.backoff = None;
                            next_state = State::ReadyToAcquire;
                        } else {
                            self.protocol_sleep(None).await;
                        }
                    } else if self.events.occurred(EVENT_WINDOW_OPENED) {
                        self.unexpected_event(current_state, EVENT_WINDOW_OPENED);
                        self.protocol_sleep(None).await;
                    } else {
                        self.protocol_sleep(None).await;
                    }
                }

                State::SendingUpdates => {
                    self.agmt.set_update_in_progress(true);
                    num_changes_sent = 0;
                    if self.is_shutdown() {
                        self.release_replica().await;
                        self.agmt.set_update_in_progress(false);
                        self.agmt.set_last_update_status(0, 0, "Protocol stopped");
                        done = true;
                        continue;
                    }
                    self.agmt.set_last_update_status(0, 0, "Incremental update started");

                    let mut result = UpdateResult::NoMoreUpdates;
                    match self.examine_update_vector(ruv.as_ref()).await {
                        ExamineRuv::ParamError => {
                            next_state = State::StopFatalError;
                        }
                        ExamineRuv::PristineReplica => {
                            error!(
                                "{}: replica has no update vector; it has never been initialized",
                                name
                            );
                            next_state = State::BackoffStart;
                        }
                        ExamineRuv::GenerationMismatch => {
                            error!(
                                "{}: replica has a different generation ID than the local data",
                                name
                            );
                            next_state = State::BackoffStart;
                        }
                        ExamineRuv::ReplicaTooOld => {
                            error!(
                                "{}: replica update vector is too out of date to synchronize \
                                 incrementally; the replica must be reinitialized",
                                name
                            );
                            next_state = State::BackoffStart;
                        }
                        ExamineRuv::Ok => {
                            let remote_ruv = ruv.clone().expect("examined ok");
                            // Keep the CSN generator ahead of both sides.
                            if self.store.update_csngen_state(&remote_ruv).await.is_err() {
                                error!(
                                    "{}: incremental protocol: fatal error - too much time \
                                     skew between replicas",
                                    name
                                );
                                next_state = State::StopFatalError;
                            } else {
                                let (update_result, sent) = outbound::send_updates(
                                    &self.agmt,
                                    &mut self.conn,
                                    &*self.store,
                                    &remote_ruv,
                                    &self.events,
                                    &self.terminate,
                                )
                                .await;
                                result = update_result;
                                num_changes_sent = sent;
                                next_state = match update_result {
                                    UpdateResult::NoMoreUpdates => {
                                        self.agmt.set_last_update_status(
                                            0,
                                            0,
                                            "Incremental update succeeded",
                                        );
                                        State::WaitChanges
                                    }
                                    UpdateResult::Yield => {
                                        self.agmt.set_last_update_status(
                                            0,
                                            0,
                                            "Incremental update succeeded and yielded",
                                        );
                                        State::BackoffStart
                                    }
                                    UpdateResult::TransientError => State::BackoffStart,
                                    UpdateResult::FatalError => State::StopFatalError,
                                    UpdateResult::ScheduleWindowClosed => State::WaitWindowOpen,
                                    UpdateResult::ConnectionLost => State::BackoffStart,
                                    UpdateResult::Timeout => State::BackoffStart,
                                };
                            }
                        }
                    }

                    if run_dirsync {
                        if inbound::dirsync_run(&self.agmt, &mut self.conn, &*self.store).await {
                            if let Some(cookie) = self.agmt.cookie() {
                                if let Err(err) = self.store.save_cookie(&name, &cookie).await {
                                    error!(
                                        "{}: failed to save the dirsync cookie: {}",
                                        name, err
                                    );
                                }
                            }
                        }
                        run_dirsync = false;
                    }

                    self.agmt.set_update_in_progress(false);
                    self.release_replica().await;
                    if result == UpdateResult::Timeout {
                        // A timed-out session leaves the stream in an
                        // unknown state; start over.
                        self.conn.disconnect().await;
                    }
                    if result == UpdateResult::ScheduleWindowClosed {
                        self.conn.disconnect().await;
                    }
                    if result == UpdateResult::NoMoreUpdates
                        && num_changes_sent > 0
                        && pausetime > 0
                    {
                        // Give other suppliers a chance to acquire the
                        // consumer before immediately re-acquiring it.
                        info!(
                            "{}: pausing updates for {} seconds to allow other suppliers \
                             to update the consumer",
                            name, pausetime
                        );
                        let mut loops = pausetime;
                        while loops > 0 && !self.is_shutdown() {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            loops -= 1;
                        }
                        if self.terminate.load(Ordering::SeqCst) {
                            done = true;
                        }
                    }
                }

                State::StopFatalError => {
                    self.agmt.set_last_update_status(
                        0,
                        -1,
                        "Incremental update has failed and requires administrator action",
                    );
                    error!(
                        "{}: incremental update failed and requires administrator action",
                        name
                    );
                    next_state = State::StopFatalErrorPart2;
                }

                State::StopFatalErrorPart2 => {
                    // Only an agreement change or shutdown can rescue the
                    // protocol from here; everything else is drained so
                    // this state cannot busy-loop.
                    if self.is_shutdown() {
                        done = true;
                    } else if self.events.occurred(EVENT_AGMT_CHANGED) {
                        next_state = State::StopNormalTermination;
                    } else {
                        self.events.reset();
                        self.protocol_sleep(None).await;
                    }
                }

                State::StopNormalTermination => {
                    done = true;
                }
            }

            debug!(
                "{}: state: {} -> {}",
                name,
                state_name(current_state),
                state_name(next_state)
            );
            current_state = next_state;
        }

        self.backoff = None;
        self.stopped.store(true, Ordering::SeqCst);
        self.conn.cancel_linger().await;
        self.conn.disconnect().await;
    }
}

#[async_trait]
impl<S, C> SyncProtocol for WindowsIncProtocol<S, C>
where
    S: DirectoryStore,
    C: RemoteDirectory + ConnectionControl + Sync,
{
    async fn run(&mut self) {
        self.terminate.store(false, Ordering::SeqCst);
        self.run_state_machine().await;
    }

    fn handle(&self) -> ProtocolHandle {
        ProtocolHandle::new(self.events.clone(), self.terminate.clone(), self.stopped.clone())
    }
}

impl<S, C> Drop for WindowsIncProtocol<S, C> {
    fn drop(&mut self) {
        if let Some(timer) = self.dirsync_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_busy_time_invariants() {
        // Neither set: busy falls back to its minimum.
        let (mut pause, mut busy) = (0i64, 0i64);
        set_pause_and_busy_time(&mut pause, &mut busy);
        assert_eq!(busy, PROTOCOL_BUSY_BACKOFF_MINIMUM as i64);

        // Pause only: busy becomes pause - 1, pause at least 2.
        let (mut pause, mut busy) = (1i64, 0i64);
        set_pause_and_busy_time(&mut pause, &mut busy);
        assert_eq!((pause, busy), (2, 1));

        // Busy only: pause becomes busy + 1.
        let (mut pause, mut busy) = (0i64, 5i64);
        set_pause_and_busy_time(&mut pause, &mut busy);
        assert_eq!((pause, busy), (6, 5));

        // Both set but inverted: pause is pushed above busy.
        let (mut pause, mut busy) = (3i64, 7i64);
        set_pause_and_busy_time(&mut pause, &mut busy);
        assert!(pause > busy);
        assert_eq!(pause, 8);
    }

    #[test]
    fn state_names_cover_the_machine() {
        assert_eq!(state_name(State::Start), "start");
        assert_eq!(
            state_name(State::StopFatalError),
            state_name(State::StopFatalErrorPart2)
        );
        assert_eq!(state_name(State::StopNormalTermination), "stop_normal_termination");
    }
}
