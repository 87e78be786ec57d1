use crate::task::OutcomeRecord;
use tokio::sync::mpsc;

/// Whether the reporter stops after the first outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Report one outcome, then return so the process can exit.
    OneShot,
    /// Report outcomes until every producer is gone.
    Recurring,
}

/// What the reporter saw before it returned.
#[derive(Debug, Default)]
pub struct ReportSummary {
    pub reported: u64,
    pub last: Option<OutcomeRecord>,
}

/// Sole consumer of outcome records.
///
/// One reporter lives for the whole process, across every arm cycle.
pub struct Reporter {
    outcomes: mpsc::Receiver<OutcomeRecord>,
    mode: ReportMode,
}

impl Reporter {
    pub fn new(outcomes: mpsc::Receiver<OutcomeRecord>, mode: ReportMode) -> Self {
        Self { outcomes, mode }
    }

    pub async fn run(mut self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        while let Some(record) = self.outcomes.recv().await {
            log_outcome(&record);
            summary.reported += 1;
            summary.last = Some(record);

            if self.mode == ReportMode::OneShot {
                tracing::info!("one-shot cycle reported, exiting");
                return summary;
            }
        }
        tracing::debug!(reported = summary.reported, "outcome channel closed");
        summary
    }
}

fn log_outcome(record: &OutcomeRecord) {
    let output = record.output.trim_end();
    match &record.failure {
        Some(failure) => {
            tracing::error!(
                cycle = record.cycle,
                finished_at = %record.finished_at.to_rfc3339(),
                %failure,
                "task failed"
            );
            if !output.is_empty() {
                tracing::info!(cycle = record.cycle, "task output:\n{output}");
            }
        }
        None if !output.is_empty() => {
            tracing::info!(
                cycle = record.cycle,
                finished_at = %record.finished_at.to_rfc3339(),
                "task output:\n{output}"
            );
        }
        None => tracing::info!(
            cycle = record.cycle,
            finished_at = %record.finished_at.to_rfc3339(),
            "task completed with no output"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_shot_stops_after_first_record() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(OutcomeRecord::succeeded(1, "first".to_string()))
            .await
            .unwrap();
        tx.send(OutcomeRecord::succeeded(2, "second".to_string()))
            .await
            .unwrap();

        let summary = Reporter::new(rx, ReportMode::OneShot).run().await;
        assert_eq!(summary.reported, 1);
        assert_eq!(summary.last.unwrap().cycle, 1);
    }

    #[tokio::test]
    async fn test_one_shot_counts_empty_record() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(OutcomeRecord::succeeded(1, String::new()))
            .await
            .unwrap();

        let summary = Reporter::new(rx, ReportMode::OneShot).run().await;
        assert_eq!(summary.reported, 1);
        let last = summary.last.unwrap();
        assert!(last.output.is_empty());
        assert!(!last.is_failure());
    }

    #[tokio::test]
    async fn test_recurring_drains_until_closed() {
        let (tx, rx) = mpsc::channel(1);
        let reporter = tokio::spawn(Reporter::new(rx, ReportMode::Recurring).run());

        tx.send(OutcomeRecord::succeeded(1, "ok".to_string()))
            .await
            .unwrap();
        tx.send(OutcomeRecord::failed(2, String::new(), "exit status 1".to_string()))
            .await
            .unwrap();
        tx.send(OutcomeRecord::succeeded(3, String::new()))
            .await
            .unwrap();
        drop(tx);

        let summary = reporter.await.unwrap();
        assert_eq!(summary.reported, 3);
        assert_eq!(summary.last.unwrap().cycle, 3);
    }

    #[tokio::test]
    async fn test_recurring_survives_failures() {
        let (tx, rx) = mpsc::channel(1);
        let reporter = tokio::spawn(Reporter::new(rx, ReportMode::Recurring).run());

        for cycle in 1..=3 {
            tx.send(OutcomeRecord::failed(cycle, String::new(), "boom".to_string()))
                .await
                .unwrap();
        }
        drop(tx);

        let summary = reporter.await.unwrap();
        assert_eq!(summary.reported, 3);
        assert!(summary.last.unwrap().is_failure());
    }

    #[tokio::test]
    async fn test_no_records_returns_empty_summary() {
        let (tx, rx) = mpsc::channel::<OutcomeRecord>(1);
        drop(tx);
        let summary = Reporter::new(rx, ReportMode::OneShot).run().await;
        assert_eq!(summary.reported, 0);
        assert!(summary.last.is_none());
    }
}
