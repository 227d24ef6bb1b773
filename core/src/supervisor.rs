//! Owns one worker process end to end.
//!
//! Both output streams are pumped line by line into a single queue. A monitor
//! task consumes the queue in order: every line lands in the log tail, then in
//! the [`SessionMachine`]. The same task watches the login timer and the
//! process exit, and runs the shutdown escalation when the session dies.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use herd_protocol::InstanceSnapshot;
use herd_protocol::SessionState;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::classifier::DeathCause;
use crate::classifier::SessionEffect;
use crate::classifier::SessionMachine;
use crate::config::HerdConfig;
use crate::control::ControlChannel;
use crate::error::HerdErr;
use crate::error::Result;
use crate::log_tail::LogTail;
use crate::process::ProcessHandle;
use crate::process::spawn_worker;
use crate::registry::RegistryInner;

/// How long the monitor keeps draining output after the worker exits.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

pub struct Instance {
    id: i32,
    agent_label: String,
    process: ProcessHandle,
    control: ControlChannel,
    session: Mutex<SessionMachine>,
    log: Mutex<LogTail>,
    auto_clear_at: Mutex<Option<DateTime<Utc>>>,
    /// Commands from outside, applied by the monitor between lines.
    commands: mpsc::UnboundedSender<InstanceCommand>,
    cancel: CancellationToken,
    shutdown_once: OnceCell<()>,
    debug: bool,
    login_timeout: Duration,
    termination_grace: Duration,
    eviction_delay: Duration,
    registry: Weak<RegistryInner>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("agent_label", &self.agent_label)
            .field("control_address", &self.control.address())
            .finish_non_exhaustive()
    }
}

enum InstanceCommand {
    Toggle {
        target: SessionState,
        reply: oneshot::Sender<Result<SessionState>>,
    },
}

/// A freshly spawned instance plus the signal that fires once it is awaiting
/// login with at least one login URL.
pub(crate) struct Launched {
    pub(crate) instance: Arc<Instance>,
    pub(crate) ready: oneshot::Receiver<()>,
}

pub(crate) fn launch(
    config: &HerdConfig,
    agent_label: String,
    env: &HashMap<String, String>,
    control_address: PathBuf,
    registry: Weak<RegistryInner>,
) -> Result<Launched> {
    let spawned = spawn_worker(&config.worker, env)?;
    let id = spawned.handle.pid();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tracing::info!(pid = id, agent_label = %agent_label, "spawned worker");

    let instance = Arc::new(Instance {
        id,
        agent_label,
        process: spawned.handle,
        control: ControlChannel::new(control_address),
        session: Mutex::new(SessionMachine::default()),
        log: Mutex::new(LogTail::new(config.log_tail_chars)),
        auto_clear_at: Mutex::new(None),
        commands: command_tx,
        cancel: CancellationToken::new(),
        shutdown_once: OnceCell::new(),
        debug: config.debug,
        login_timeout: config.login_timeout(),
        termination_grace: config.termination_grace(),
        eviction_delay: config.eviction_delay(),
        registry,
    });

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    // A line can never show more than the whole tail; four bytes per char.
    let max_line_bytes = config.log_tail_chars.saturating_mul(4).max(1);
    spawn_line_pump(spawned.stdout, line_tx.clone(), max_line_bytes);
    spawn_line_pump(spawned.stderr, line_tx, max_line_bytes);

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(Arc::clone(&instance).monitor(line_rx, command_rx, ready_tx));

    Ok(Launched {
        instance,
        ready: ready_rx,
    })
}

fn spawn_line_pump<R>(stream: R, tx: mpsc::UnboundedSender<String>, max_line_bytes: usize)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            match read_capped_line(&mut reader, &mut buf, max_line_bytes).await {
                Ok(false) => break,
                Ok(true) => {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!("worker output stream failed: {err}");
                    break;
                }
            }
        }
    });
}

/// Reads one line into `buf`, keeping at most `limit` bytes of it and
/// discarding the rest up to the newline. Returns false at end of stream.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut read_any = false;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(read_any);
        }
        read_any = true;
        let (taken, complete) = match chunk.iter().position(|byte| *byte == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (chunk.len(), false),
        };
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..taken.min(room)]);
        reader.consume(taken);
        if complete {
            return Ok(true);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Instance {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn agent_label(&self) -> &str {
        &self.agent_label
    }

    pub fn control_address(&self) -> &Path {
        self.control.address()
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Current state, with OS liveness taking precedence over what the
    /// output said.
    pub async fn session_state(&self) -> SessionState {
        let session = self.session.lock().await;
        self.effective_state(&session)
    }

    fn effective_state(&self, session: &SessionMachine) -> SessionState {
        if self.process.is_alive() {
            session.state()
        } else {
            SessionState::Dead
        }
    }

    pub async fn auto_clear_at(&self) -> Option<DateTime<Utc>> {
        *self.auto_clear_at.lock().await
    }

    pub async fn log_tail(&self) -> String {
        self.log.lock().await.as_str().to_string()
    }

    /// Point-in-time view, enriched with the worker's contacts when it can
    /// still answer.
    pub async fn snapshot(&self) -> InstanceSnapshot {
        let (session_state, login_artifacts, display_name) = {
            let session = self.session.lock().await;
            (
                self.effective_state(&session),
                session.login_artifacts().to_vec(),
                session.display_name().to_string(),
            )
        };
        let log_tail = self.log_tail().await;
        let auto_clear_at = self.auto_clear_at().await;

        let contacts = if session_state == SessionState::Dead {
            Vec::new()
        } else {
            match self.control.list_contacts().await {
                Ok(contacts) => contacts,
                Err(err) => {
                    tracing::debug!(pid = self.id, "contacts unavailable: {err}");
                    Vec::new()
                }
            }
        };
        let avatar_url = contacts
            .first()
            .map(|contact| contact.head_img_url.clone())
            .unwrap_or_default();

        InstanceSnapshot {
            id: self.id,
            session_state,
            login_artifacts,
            display_name,
            avatar_url,
            contacts,
            log_tail,
            agent_label: self.agent_label.clone(),
            auto_clear_at,
        }
    }

    /// Pauses or resumes message handling and returns the resulting state.
    /// Only ACTIVE and ACTIVE_PAUSED are valid targets. A session that is not
    /// logged in is left unchanged. Applied by the monitor task so it never
    /// races a transition driven by output.
    pub async fn toggle(&self, target: SessionState) -> Result<SessionState> {
        if !target.is_toggle_target() {
            return Err(HerdErr::InvalidTransition {
                from: self.session_state().await,
                to: target,
            });
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.commands.send(InstanceCommand::Toggle {
            target,
            reply: reply_tx,
        });
        if sent.is_err() {
            return Ok(SessionState::Dead);
        }
        reply_rx.await.unwrap_or(Ok(SessionState::Dead))
    }

    async fn apply_toggle(&self, target: SessionState) -> Result<SessionState> {
        {
            let session = self.session.lock().await;
            let current = self.effective_state(&session);
            let applies = session.check_toggle(target)?;
            if !applies || current == SessionState::Dead || current == target {
                return Ok(current);
            }
        }

        let handling = self
            .control
            .set_active(target == SessionState::Active)
            .await?;

        // A concurrent delete may have killed the session meanwhile.
        let mut session = self.session.lock().await;
        if matches!(
            session.state(),
            SessionState::Active | SessionState::ActivePaused
        ) {
            session.set_handling_messages(handling);
        }
        tracing::info!(pid = self.id, state = %session.state(), "toggled message handling");
        Ok(self.effective_state(&session))
    }

    /// Runs the shutdown escalation exactly once. Later and concurrent
    /// callers wait for the first run to finish.
    pub async fn shutdown(self: &Arc<Self>, cause: DeathCause) {
        self.shutdown_once
            .get_or_init(|| self.run_shutdown(cause))
            .await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_once.initialized()
    }

    async fn run_shutdown(self: &Arc<Self>, cause: DeathCause) {
        tracing::info!(pid = self.id, agent_label = %self.agent_label, %cause, "stopping instance");
        self.cancel.cancel();
        self.session.lock().await.mark_dead();

        if self.process.terminate() {
            tokio::time::sleep(self.termination_grace).await;
            if self.process.kill() {
                tracing::debug!(pid = self.id, "worker ignored SIGTERM, sent SIGKILL");
            }
        }
        let exit = self.process.wait_exit().await;
        tracing::debug!(pid = self.id, "worker exited: {exit}");

        self.control.close();
        self.schedule_eviction().await;
    }

    async fn schedule_eviction(self: &Arc<Self>) {
        {
            let mut auto_clear_at = self.auto_clear_at.lock().await;
            if auto_clear_at.is_some() {
                return;
            }
            let clear_at = TimeDelta::from_std(self.eviction_delay)
                .ok()
                .and_then(|delay| Utc::now().checked_add_signed(delay))
                .unwrap_or_else(Utc::now);
            *auto_clear_at = Some(clear_at);
        }

        let instance = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(instance.eviction_delay).await;
            if let Some(registry) = instance.registry.upgrade() {
                registry.evict(&instance).await;
            }
        });
    }

    async fn monitor(
        self: Arc<Self>,
        mut lines: mpsc::UnboundedReceiver<String>,
        mut commands: mpsc::UnboundedReceiver<InstanceCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut login_deadline: Option<Instant> = None;
        let mut output_open = true;

        let cause = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                Some(command) = commands.recv() => match command {
                    InstanceCommand::Toggle { target, reply } => {
                        let _ = reply.send(self.apply_toggle(target).await);
                    }
                },
                line = lines.recv(), if output_open => match line {
                    Some(line) => {
                        if let Some(cause) = self.handle_line(&line, &mut ready_tx, &mut login_deadline).await {
                            break cause;
                        }
                    }
                    None => output_open = false,
                },
                exit = self.process.wait_exit() => {
                    let drained = self.drain_after_exit(&mut lines, &mut ready_tx).await;
                    tracing::info!(pid = self.id, "worker exited: {exit}");
                    break drained.unwrap_or(DeathCause::ProcessExited);
                }
                _ = sleep_until_deadline(login_deadline) => {
                    login_deadline = None;
                    let effect = self.session.lock().await.login_deadline_elapsed();
                    if let Some(SessionEffect::Shutdown(cause)) = effect {
                        break cause;
                    }
                }
            }
        };

        self.shutdown(cause).await;
        drop(ready_tx);
    }

    async fn drain_after_exit(
        &self,
        lines: &mut mpsc::UnboundedReceiver<String>,
        ready_tx: &mut Option<oneshot::Sender<()>>,
    ) -> Option<DeathCause> {
        let mut ignored_deadline = None;
        let drain = async {
            while let Some(line) = lines.recv().await {
                if let Some(cause) = self
                    .handle_line(&line, ready_tx, &mut ignored_deadline)
                    .await
                {
                    return Some(cause);
                }
            }
            None
        };
        tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain)
            .await
            .unwrap_or(None)
    }

    async fn handle_line(
        &self,
        line: &str,
        ready_tx: &mut Option<oneshot::Sender<()>>,
        login_deadline: &mut Option<Instant>,
    ) -> Option<DeathCause> {
        if self.debug {
            tracing::debug!(pid = self.id, "{line}");
        }
        self.log.lock().await.push_line(line);

        let effects = self.session.lock().await.observe_line(line);
        for effect in effects {
            match effect {
                SessionEffect::Ready => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
                SessionEffect::ArmLoginTimer => {
                    *login_deadline = Some(Instant::now() + self.login_timeout);
                }
                SessionEffect::Shutdown(cause) => return Some(cause),
            }
        }
        None
    }
}
