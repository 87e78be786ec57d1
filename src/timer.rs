/// Dead man's switch timer.
///
/// One `WatchdogTimer` owns the task, the deadline and the single live alarm.
/// The alarm state, the fire instant and the cycle counter sit behind one
/// lock, so `reset`, `arm` and the alarm's own fire check are linearizable:
///
/// - `reset` is accepted only while `Armed` and strictly before the fire
///   instant; it moves the fire instant and wakes the alarm to re-read it.
/// - The alarm fires only if, under the lock, its cycle is still current and
///   the fire instant has passed. It flips to `Fired` before releasing the
///   lock, so a racing `reset` sees `Fired` and is rejected.
/// - `arm` bumps the cycle and aborts the pending alarm. A superseded alarm
///   that wakes anyway sees a stale cycle and exits without firing.
use crate::config::{Deadline, MAX_DEADLINE};
use crate::task::{OutcomeRecord, TaskSpec};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where the current arm cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmState {
    /// Alarm pending, task not yet run.
    Armed,
    /// Alarm expired; task running or done.
    Fired,
    /// No alarm. Only `arm` leaves this state.
    Stopped,
}

/// Wall-clock view of a freshly armed or extended deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub cycle: u64,
    /// When the arm or reset took effect.
    pub at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Answer to a reset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Deadline pushed out; no execution this cycle yet.
    Extended(Expiry),
    /// Too late: the alarm already fired, or the timer is stopped.
    Expired,
}

impl ResetOutcome {
    #[cfg(test)]
    pub fn is_extended(&self) -> bool {
        matches!(self, ResetOutcome::Extended(_))
    }
}

/// Point-in-time state, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub state: ArmState,
    pub cycle: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

struct Alarm {
    state: ArmState,
    cycle: u64,
    fire_at: Instant,
    /// Wakes the pending alarm when `fire_at` moves.
    reprogram: Arc<Notify>,
    /// Present only while `Armed`.
    handle: Option<JoinHandle<()>>,
}

pub struct WatchdogTimer {
    task: TaskSpec,
    deadline: Deadline,
    outcomes: mpsc::Sender<OutcomeRecord>,
    alarm: Mutex<Alarm>,
}

impl WatchdogTimer {
    /// Create a stopped timer. Call `arm` to start the first cycle.
    pub fn new(task: TaskSpec, deadline: Deadline, outcomes: mpsc::Sender<OutcomeRecord>) -> Self {
        Self {
            task,
            deadline,
            outcomes,
            alarm: Mutex::new(Alarm {
                state: ArmState::Stopped,
                cycle: 0,
                fire_at: Instant::now(),
                reprogram: Arc::new(Notify::new()),
                handle: None,
            }),
        }
    }

    pub fn task(&self) -> &TaskSpec {
        &self.task
    }

    /// Start a fresh cycle from any state, cancelling a pending alarm.
    ///
    /// A task already running from an earlier cycle is left alone and still
    /// delivers its outcome.
    pub async fn arm(self: &Arc<Self>) -> Expiry {
        let mut alarm = self.alarm.lock().await;
        if let Some(previous) = alarm.handle.take() {
            previous.abort();
        }

        alarm.cycle += 1;
        alarm.state = ArmState::Armed;
        alarm.fire_at = fire_instant(Instant::now(), self.deadline);
        alarm.reprogram = Arc::new(Notify::new());

        let cycle = alarm.cycle;
        let reprogram = Arc::clone(&alarm.reprogram);
        alarm.handle = Some(tokio::spawn(Arc::clone(self).run_alarm(cycle, reprogram)));

        let expiry = Expiry::from_now(cycle, self.deadline);
        tracing::info!(
            cycle,
            expires_at = %expiry.expires_at.to_rfc3339(),
            command = %self.task.command_line(),
            "timer armed"
        );
        expiry
    }

    /// Push the current cycle's fire time out to `now + deadline`.
    pub async fn reset(&self, deadline: Deadline) -> ResetOutcome {
        let mut alarm = self.alarm.lock().await;
        let now = Instant::now();
        if alarm.state != ArmState::Armed || now >= alarm.fire_at {
            tracing::debug!(cycle = alarm.cycle, state = ?alarm.state, "reset rejected");
            return ResetOutcome::Expired;
        }

        alarm.fire_at = fire_instant(now, deadline);
        alarm.reprogram.notify_one();

        let expiry = Expiry::from_now(alarm.cycle, deadline);
        tracing::debug!(
            cycle = alarm.cycle,
            expires_at = %expiry.expires_at.to_rfc3339(),
            "timer reset"
        );
        ResetOutcome::Extended(expiry)
    }

    /// Reset using the configured deadline.
    pub async fn extend(&self) -> ResetOutcome {
        self.reset(self.deadline).await
    }

    /// Cancel any pending alarm and go to `Stopped`.
    pub async fn stop(&self) {
        let mut alarm = self.alarm.lock().await;
        if let Some(pending) = alarm.handle.take() {
            pending.abort();
        }
        if alarm.state != ArmState::Stopped {
            tracing::info!(cycle = alarm.cycle, "timer stopped");
        }
        alarm.state = ArmState::Stopped;
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        let alarm = self.alarm.lock().await;
        let expires_at = match alarm.state {
            ArmState::Armed => {
                let remaining = alarm.fire_at.saturating_duration_since(Instant::now());
                chrono::Duration::from_std(remaining)
                    .ok()
                    .map(|remaining| Utc::now() + remaining)
            }
            ArmState::Fired | ArmState::Stopped => None,
        };
        TimerSnapshot {
            state: alarm.state,
            cycle: alarm.cycle,
            expires_at,
        }
    }

    /// Alarm body for one cycle: wait, re-check under the lock, then fire.
    async fn run_alarm(self: Arc<Self>, cycle: u64, reprogram: Arc<Notify>) {
        loop {
            let fire_at = {
                let mut alarm = self.alarm.lock().await;
                if alarm.cycle != cycle || alarm.state != ArmState::Armed {
                    tracing::debug!(cycle, "stale alarm discarded");
                    return;
                }
                if Instant::now() >= alarm.fire_at {
                    alarm.state = ArmState::Fired;
                    // Detach rather than abort: this task is the one running.
                    alarm.handle = None;
                    break;
                }
                alarm.fire_at
            };

            tokio::select! {
                _ = tokio::time::sleep_until(fire_at) => {}
                _ = reprogram.notified() => {}
            }
        }

        let record = self.task.execute(cycle).await;
        if self.outcomes.send(record).await.is_err() {
            tracing::warn!(cycle, "no reporter listening, outcome dropped");
        }
    }
}

/// `now + deadline`, saturating at the longest accepted deadline.
fn fire_instant(now: Instant, deadline: Deadline) -> Instant {
    now.checked_add(deadline.duration())
        .or_else(|| now.checked_add(MAX_DEADLINE))
        .unwrap_or(now)
}

impl Expiry {
    fn from_now(cycle: u64, deadline: Deadline) -> Self {
        let at = Utc::now();
        let expires_at = chrono::Duration::from_std(deadline.duration())
            .ok()
            .and_then(|d| at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            cycle,
            at,
            expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn timer(command: &str, millis: u64) -> (Arc<WatchdogTimer>, mpsc::Receiver<OutcomeRecord>) {
        let (tx, rx) = mpsc::channel(1);
        let task = TaskSpec::new(command).unwrap();
        let deadline = Deadline::new(Duration::from_millis(millis)).unwrap();
        (Arc::new(WatchdogTimer::new(task, deadline, tx)), rx)
    }

    fn millis(ms: u64) -> Deadline {
        Deadline::new(Duration::from_millis(ms)).unwrap()
    }

    #[tokio::test]
    async fn test_new_timer_is_stopped() {
        let (timer, _rx) = timer("true", 50);
        let snapshot = timer.snapshot().await;
        assert_eq!(snapshot.state, ArmState::Stopped);
        assert_eq!(snapshot.cycle, 0);
        assert_eq!(snapshot.expires_at, None);
    }

    #[tokio::test]
    async fn test_reset_on_stopped_timer_is_rejected() {
        let (timer, _rx) = timer("true", 50);
        assert_eq!(timer.extend().await, ResetOutcome::Expired);
    }

    #[tokio::test]
    async fn test_fires_once_with_output() {
        let (timer, mut rx) = timer("echo hello", 100);
        let start = Instant::now();
        timer.arm().await;

        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(record.cycle, 1);
        assert!(record.output.contains("hello"));
        assert_eq!(record.failure, None);
        assert_eq!(timer.snapshot().await.state, ArmState::Fired);

        // Nothing else arrives for this cycle.
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_produces_failure() {
        let (timer, mut rx) = timer("doesnotexist-binary", 50);
        timer.arm().await;

        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(record.output.is_empty());
        assert!(!record.failure.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_before_expiry_is_accepted() {
        let (timer, _rx) = timer("true", 5_000);
        let armed = timer.arm().await;
        match timer.extend().await {
            ResetOutcome::Extended(expiry) => {
                assert_eq!(expiry.cycle, armed.cycle);
                assert!(expiry.expires_at >= armed.expires_at);
            }
            ResetOutcome::Expired => panic!("reset before expiry must be accepted"),
        }
        assert_eq!(timer.snapshot().await.state, ArmState::Armed);
    }

    #[tokio::test]
    async fn test_reset_measures_from_reset_time() {
        let (timer, mut rx) = timer("true", 200);
        let start = Instant::now();
        timer.arm().await;

        sleep(Duration::from_millis(50)).await;
        assert!(timer.reset(millis(200)).await.is_extended());

        // The original deadline (200ms) passes without a fire.
        assert!(timeout(Duration::from_millis(170), rx.recv()).await.is_err());

        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(record.cycle, 1);
    }

    #[tokio::test]
    async fn test_shorter_reset_takes_effect() {
        let (timer, mut rx) = timer("true", 10_000);
        let start = Instant::now();
        timer.arm().await;
        assert!(timer.reset(millis(50)).await.is_extended());

        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reset_after_expiry_is_rejected() {
        let (timer, mut rx) = timer("true", 50);
        timer.arm().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(timer.extend().await, ResetOutcome::Expired);
        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.cycle, 1);
    }

    #[tokio::test]
    async fn test_reset_racing_expiry_resolves_once() {
        for _ in 0..20 {
            let (timer, mut rx) = timer("true", 20);
            timer.arm().await;
            sleep(Duration::from_millis(19)).await;

            // Shrinking windows so the cycle expires somewhere inside the loop.
            let mut rejected_at = None;
            for attempt in 0..20u64 {
                let accepted = timer.reset(millis(20 - attempt)).await.is_extended();
                match rejected_at {
                    None if !accepted => rejected_at = Some(attempt),
                    Some(first) => assert!(
                        !accepted,
                        "reset {attempt} accepted after reset {first} was rejected"
                    ),
                    None => {}
                }
                sleep(Duration::from_millis(2)).await;
            }
            assert!(rejected_at.is_some(), "cycle never expired");

            // Whatever the interleaving, this cycle fires exactly once.
            let record = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.cycle, 1);
            assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
            assert_eq!(timer.extend().await, ResetOutcome::Expired);
        }
    }

    #[tokio::test]
    async fn test_concurrent_resets_all_resolve() {
        let (timer, mut rx) = timer("true", 30);
        timer.arm().await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let timer = Arc::clone(&timer);
            handles.push(tokio::spawn(async move {
                sleep(Duration::from_millis(i * 4)).await;
                timer.reset(Deadline::new(Duration::from_millis(30)).unwrap()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.cycle, 1);
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_after_fire_starts_new_cycle() {
        let (timer, mut rx) = timer("true", 50);
        let start = Instant::now();
        timer.arm().await;

        sleep(Duration::from_millis(100)).await;
        let restarted = timer.arm().await;
        assert_eq!(restarted.cycle, 2);

        let first = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.cycle, 1);
        assert_eq!(second.cycle, 2);
        assert!(first.finished_at <= second.finished_at);
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_back_to_back_restarts_only_last_fires() {
        let (timer, mut rx) = timer("true", 100);
        timer.arm().await;
        timer.arm().await;
        timer.arm().await;
        let last = timer.arm().await;
        assert_eq!(last.cycle, 4);

        let record = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.cycle, 4);
        assert!(timeout(Duration::from_millis(250), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_does_not_lose_in_flight_outcome() {
        let (timer, mut rx) = timer("sleep 0.2", 20);
        timer.arm().await;

        // Cycle 1 is executing its task when the restart lands.
        sleep(Duration::from_millis(80)).await;
        assert_eq!(timer.snapshot().await.state, ArmState::Fired);
        timer.arm().await;

        let mut cycles = vec![
            timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap().cycle,
            timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap().cycle,
        ];
        cycles.sort_unstable();
        assert_eq!(cycles, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_alarm() {
        let (timer, mut rx) = timer("true", 50);
        timer.arm().await;
        timer.stop().await;

        assert_eq!(timer.snapshot().await.state, ArmState::Stopped);
        assert_eq!(timer.extend().await, ResetOutcome::Expired);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_while_armed_has_expiry() {
        let (timer, _rx) = timer("true", 60_000);
        let armed = timer.arm().await;
        let snapshot = timer.snapshot().await;
        assert_eq!(snapshot.state, ArmState::Armed);
        assert_eq!(snapshot.cycle, 1);
        let expires_at = snapshot.expires_at.unwrap();
        let drift = (expires_at - armed.expires_at).num_milliseconds().abs();
        assert!(drift < 1_000);
    }

    #[tokio::test]
    async fn test_longest_deadline_arms_and_resets() {
        let (tx, _rx) = mpsc::channel(1);
        let task = TaskSpec::new("true").unwrap();
        let deadline = Deadline::new(MAX_DEADLINE).unwrap();
        let timer = Arc::new(WatchdogTimer::new(task, deadline, tx));

        let armed = timer.arm().await;
        assert!(armed.expires_at > armed.at);
        assert!(timer.extend().await.is_extended());
        assert_eq!(timer.snapshot().await.state, ArmState::Armed);
        timer.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_reporter_does_not_panic_producer() {
        let (timer, rx) = timer("true", 20);
        drop(rx);
        timer.arm().await;
        sleep(Duration::from_millis(150)).await;
        assert_eq!(timer.snapshot().await.state, ArmState::Fired);
    }
}
