use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use salbridge_api::{
    AckStage, Acknowledgment, Command, CorrelationId, Fields, Inbound, Ingress, RemoteId, Transport,
};

use crate::error::CommandError;

/// Final outcome of a command.
pub type CommandResult = Result<(), CommandError>;

type Completion = Box<dyn FnOnce(&CommandResult)>;

/// Observable status of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Pending,
    Accepted,
    InProgress { percent: Option<f32>, duration: Option<Duration> },
    Complete,
    Failed(CommandError),
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Complete | CommandStatus::Failed(_))
    }

    pub fn result(&self) -> Option<CommandResult> {
        match self {
            CommandStatus::Complete => Some(Ok(())),
            CommandStatus::Failed(e) => Some(Err(e.clone())),
            _ => None,
        }
    }

    fn from_result(result: &CommandResult) -> Self {
        match result {
            Ok(()) => CommandStatus::Complete,
            Err(e) => CommandStatus::Failed(e.clone()),
        }
    }
}

/// Caller's view of one issued command.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    correlation: CorrelationId,
    name: String,
    status: watch::Receiver<CommandStatus>,
}

impl CommandHandle {
    pub fn correlation(&self) -> CorrelationId {
        self.correlation
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> CommandStatus {
        self.status.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Resolution, if already known.
    pub fn result(&self) -> Option<CommandResult> {
        self.status.borrow().result()
    }

    /// Wait for the resolution. Must be awaited from a task that does not
    /// block the drains, e.g. a `spawn_local` task next to the UI loop.
    pub async fn wait(&mut self) -> CommandResult {
        if let Some(result) = self.result() {
            return result;
        }
        match self.status.wait_for(CommandStatus::is_terminal).await {
            Ok(status) => status.result().unwrap_or(Err(CommandError::Disconnected)),
            // bridge dropped with the command still pending
            Err(_) => Err(CommandError::Disconnected),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `limit`. The command keeps
    /// running; `None` only means it isn't resolved yet.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Option<CommandResult> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }
}

/// Options for one command issue.
pub struct CommandRequest {
    name: String,
    args: Fields,
    timeout: Option<Duration>,
    on_complete: Option<Completion>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Fields::new(),
            timeout: None,
            on_complete: None,
        }
    }

    pub fn args(mut self, args: Fields) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Called exactly once on the UI context when the command resolves.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CommandResult) + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

/// Sequencer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub issued: u64,
    pub completed: u64,
    /// FAILED resolutions: timeouts, disconnects, cancels, transport and
    /// remote failures.
    pub failed: u64,
    /// REJECTED resolutions, never executed: busy refusals and remote rejections.
    pub rejected: u64,
    pub timed_out: u64,
    pub busy: u64,
    /// Acknowledgments for commands already resolved by a remote terminal ack.
    pub duplicate_acks: u64,
    /// Acknowledgments matching no pending command.
    pub unmatched_acks: u64,
    /// Acknowledgments with a stage lower than one already seen.
    pub out_of_order_acks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedBy {
    Remote,
    Local,
}

struct Pending {
    name: String,
    rank: u8,
    deadline: Instant,
    timer: CancellationToken,
    status: watch::Sender<CommandStatus>,
    on_complete: Option<Completion>,
}

/// Command lifecycle tracking for one remote. UI context only.
pub struct Sequencer {
    remote: RemoteId,
    default_timeout: Duration,
    pending: HashMap<CorrelationId, Pending>,
    by_name: HashMap<String, CorrelationId>,
    recent: VecDeque<(CorrelationId, ResolvedBy)>,
    recent_capacity: usize,
    stats: SequencerStats,
}

impl Sequencer {
    pub fn new(remote: RemoteId, default_timeout: Duration, recent_capacity: usize) -> Self {
        Self {
            remote,
            default_timeout,
            pending: HashMap::new(),
            by_name: HashMap::new(),
            recent: VecDeque::new(),
            recent_capacity,
            stats: SequencerStats::default(),
        }
    }

    /// Issue a command. Returns immediately; refusals (not connected, busy,
    /// transport error) are reported as an already resolved handle.
    ///
    /// `ingress` is the current session's: the deadline timer pushes
    /// [`Inbound::Deadline`] through it. `None` means not connected.
    pub fn issue(
        &mut self,
        transport: &dyn Transport,
        ingress: Option<&Ingress>,
        request: CommandRequest,
    ) -> CommandHandle {
        let CommandRequest { name, args, timeout, on_complete } = request;
        let correlation = CorrelationId::next();
        let (tx, rx) = watch::channel(CommandStatus::Pending);
        let handle = CommandHandle { correlation, name: name.clone(), status: rx };
        self.stats.issued += 1;

        let Some(ingress) = ingress else {
            tracing::debug!(remote = %self.remote, command = %name, "remote not connected, failing command");
            self.refuse(tx, on_complete, CommandError::Disconnected);
            return handle;
        };
        if let Some(other) = self.by_name.get(&name) {
            tracing::debug!(remote = %self.remote, command = %name, pending = %other, "command already pending");
            self.stats.busy += 1;
            self.refuse(tx, on_complete, CommandError::Busy(name));
            return handle;
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let command = Command {
            remote: self.remote.clone(),
            name: name.clone(),
            args,
            correlation,
            timeout,
        };
        if let Err(e) = transport.send_command(&command) {
            tracing::warn!(remote = %self.remote, command = %name, error = %e, "command send failed");
            self.refuse(tx, on_complete, CommandError::Transport(e.to_string()));
            return handle;
        }

        let timer = CancellationToken::new();
        spawn_deadline(ingress.clone(), correlation, timeout, timer.clone());

        tracing::debug!(remote = %self.remote, command = %name, correlation = %correlation, ?timeout, "command issued");
        self.by_name.insert(name.clone(), correlation);
        self.pending.insert(
            correlation,
            Pending {
                name,
                rank: 0,
                deadline: deadline_after(Instant::now(), timeout),
                timer,
                status: tx,
                on_complete,
            },
        );
        handle
    }

    fn refuse(&mut self, tx: watch::Sender<CommandStatus>, on_complete: Option<Completion>, error: CommandError) {
        self.count_failure(&error);
        let result = Err(error);
        tx.send_replace(CommandStatus::from_result(&result));
        if let Some(callback) = on_complete {
            callback(&result);
        }
    }

    pub fn on_acknowledgment(&mut self, ack: Acknowledgment) {
        let correlation = ack.correlation;
        let Some(entry) = self.pending.get_mut(&correlation) else {
            match self.recent.iter().find(|(id, _)| *id == correlation) {
                Some((_, ResolvedBy::Remote)) => {
                    self.stats.duplicate_acks += 1;
                    tracing::debug!(remote = %self.remote, correlation = %correlation, "acknowledgment after terminal, discarded");
                }
                _ => {
                    self.stats.unmatched_acks += 1;
                    tracing::debug!(remote = %self.remote, correlation = %correlation, "unmatched acknowledgment, discarded");
                }
            }
            return;
        };

        let rank = ack.stage.rank();
        if rank < entry.rank {
            self.stats.out_of_order_acks += 1;
            tracing::debug!(remote = %self.remote, correlation = %correlation, stage = ?ack.stage, "out of order acknowledgment, discarded");
            return;
        }
        if rank == entry.rank && matches!(ack.stage, AckStage::Ack) {
            self.stats.duplicate_acks += 1;
            return;
        }
        entry.rank = rank;

        match ack.stage {
            AckStage::Ack => {
                entry.status.send_replace(CommandStatus::Accepted);
            }
            AckStage::InProgress { percent, duration } => {
                entry.status.send_replace(CommandStatus::InProgress { percent, duration });
            }
            AckStage::Complete => self.resolve(correlation, Ok(()), ResolvedBy::Remote),
            AckStage::Failed { reason } => {
                self.resolve(correlation, Err(CommandError::Failed(reason)), ResolvedBy::Remote)
            }
            AckStage::Rejected { reason } => {
                self.resolve(correlation, Err(CommandError::Rejected(reason)), ResolvedBy::Remote)
            }
        }
    }

    /// Deadline timer fired.
    pub fn on_deadline(&mut self, correlation: CorrelationId) {
        if self.pending.contains_key(&correlation) {
            self.resolve(correlation, Err(CommandError::Timeout), ResolvedBy::Local);
        }
    }

    /// Time out every command whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for correlation in expired {
            self.resolve(correlation, Err(CommandError::Timeout), ResolvedBy::Local);
        }
    }

    /// Cancel a pending command. Returns `false` if it is already resolved.
    pub fn cancel(&mut self, transport: &dyn Transport, correlation: CorrelationId) -> bool {
        if !self.pending.contains_key(&correlation) {
            return false;
        }
        if let Err(e) = transport.cancel_command(&self.remote, correlation) {
            tracing::debug!(remote = %self.remote, correlation = %correlation, error = %e, "remote cancel not delivered");
        }
        self.resolve(correlation, Err(CommandError::Cancelled), ResolvedBy::Local);
        true
    }

    /// Resolve every pending command with `error`.
    pub fn fail_all(&mut self, error: CommandError) {
        let ids: Vec<CorrelationId> = self.pending.keys().copied().collect();
        if !ids.is_empty() {
            tracing::info!(remote = %self.remote, count = ids.len(), %error, "failing pending commands");
        }
        for correlation in ids {
            self.resolve(correlation, Err(error.clone()), ResolvedBy::Local);
        }
    }

    fn resolve(&mut self, correlation: CorrelationId, result: CommandResult, by: ResolvedBy) {
        let Some(entry) = self.pending.remove(&correlation) else {
            return;
        };
        if self.by_name.get(&entry.name) == Some(&correlation) {
            self.by_name.remove(&entry.name);
        }
        entry.timer.cancel();

        match &result {
            Ok(()) => self.stats.completed += 1,
            Err(e) => self.count_failure(e),
        }
        match &result {
            Ok(()) => tracing::debug!(remote = %self.remote, command = %entry.name, correlation = %correlation, "command complete"),
            Err(e) => tracing::info!(remote = %self.remote, command = %entry.name, correlation = %correlation, error = %e, "command failed"),
        }

        if self.recent_capacity > 0 {
            if self.recent.len() == self.recent_capacity {
                self.recent.pop_front();
            }
            self.recent.push_back((correlation, by));
        }

        entry.status.send_replace(CommandStatus::from_result(&result));
        if let Some(callback) = entry.on_complete {
            callback(&result);
        }
    }

    fn count_failure(&mut self, error: &CommandError) {
        if error.is_rejection() {
            self.stats.rejected += 1;
            return;
        }
        if *error == CommandError::Timeout {
            self.stats.timed_out += 1;
        }
        self.stats.failed += 1;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Names of the pending commands with their correlation ids.
    pub fn pending(&self) -> Vec<(CorrelationId, String)> {
        let mut pending: Vec<_> = self.pending.iter().map(|(id, p)| (*id, p.name.clone())).collect();
        pending.sort();
        pending
    }

    pub fn stats(&self) -> SequencerStats {
        self.stats
    }
}

/// Roughly 30 years, the same horizon tokio uses for an unreachable sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating at a far-future instant for huge timeouts.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now.checked_add(FAR_FUTURE).unwrap_or(now))
}

/// Arm a deadline timer. Without a runtime the periodic
/// [`Sequencer::expire`] sweep is the only deadline source.
fn spawn_deadline(ingress: Ingress, correlation: CorrelationId, timeout: Duration, token: CancellationToken) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::debug!(correlation = %correlation, "no runtime, deadline left to the tick sweep");
        return;
    };
    runtime.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                ingress.push(Inbound::Deadline(correlation));
            }
        }
    });
}
