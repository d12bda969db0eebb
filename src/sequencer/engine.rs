//! Enrollment state machine and due-step sweep

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SequencerSettings;
use crate::error::{Result, SyndicateError};
use crate::sequencer::{
    render_template, Channel, ConditionAction, ConditionKind, EnrollmentStatus, ExecutedStep, Sequence,
    SequenceEnrollment, SequenceStats, SequenceStep, StepOutcome,
};
use crate::store::{timestamp_value, DocumentStore, DocumentStoreExt, Query, SortOrder};

const SEQUENCES: &str = "sequences";
const ENROLLMENTS: &str = "enrollments";

/// Stop reason once a step exhausts its send attempts
pub const DELIVERY_FAILED: &str = "delivery_failed";

/// What the core asks a channel to deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub enrollment_id: String,
    pub subject_id: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Injected transport for email/LinkedIn/SMS/phone
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, request: &SendRequest) -> std::result::Result<SendReceipt, String>;
}

/// Sender that only records requests. Subjects can be marked failing.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SendRequest>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `subject_id` fails until [`Self::recover`]
    pub fn fail_for(&self, subject_id: impl Into<String>) {
        self.failing.lock().insert(subject_id.into());
    }

    pub fn recover(&self, subject_id: &str) {
        self.failing.lock().remove(subject_id);
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send(&self, request: &SendRequest) -> std::result::Result<SendReceipt, String> {
        if self.failing.lock().contains(&request.subject_id) {
            return Err(format!("{:?} delivery to {} rejected", request.channel, request.subject_id));
        }
        info!(
            subject_id = %request.subject_id,
            channel = ?request.channel,
            "Outreach step sent"
        );
        self.sent.lock().push(request.clone());
        Ok(SendReceipt {
            message_id: Uuid::new_v4().to_string(),
        })
    }
}

/// Releases an in-flight claim on drop
struct InFlight<'a> {
    claims: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.id);
    }
}

/// Runs outreach sequences over a [`DocumentStore`]
pub struct Sequencer {
    store: Arc<dyn DocumentStore>,
    sender: Arc<dyn ChannelSender>,
    settings: SequencerSettings,
    enroll_lock: AsyncMutex<()>,
    stats_lock: AsyncMutex<()>,
    in_flight: Mutex<HashSet<String>>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn DocumentStore>, sender: Arc<dyn ChannelSender>, settings: SequencerSettings) -> Self {
        Self {
            store,
            sender,
            settings,
            enroll_lock: AsyncMutex::new(()),
            stats_lock: AsyncMutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn create_sequence(&self, name: impl Into<String>, steps: Vec<SequenceStep>) -> Result<Sequence> {
        let sequence = Sequence::new(name, steps)?;
        self.store.create_doc(SEQUENCES, &sequence.id, &sequence).await?;
        info!(sequence_id = %sequence.id, name = %sequence.name, steps = sequence.steps.len(), "Sequence created");
        Ok(sequence)
    }

    pub async fn get_sequence(&self, id: &str) -> Result<Option<Sequence>> {
        self.store.get_doc(SEQUENCES, id).await
    }

    pub async fn get_enrollment(&self, id: &str) -> Result<Option<SequenceEnrollment>> {
        self.store.get_doc(ENROLLMENTS, id).await
    }

    async fn load_sequence(&self, id: &str) -> Result<Sequence> {
        self.get_sequence(id)
            .await?
            .ok_or_else(|| SyndicateError::SequenceNotFound(id.to_string()))
    }

    async fn load_enrollment(&self, id: &str) -> Result<SequenceEnrollment> {
        self.get_enrollment(id)
            .await?
            .ok_or_else(|| SyndicateError::EnrollmentNotFound(id.to_string()))
    }

    async fn save_enrollment(&self, enrollment: &SequenceEnrollment) -> Result<()> {
        self.store.put_doc(ENROLLMENTS, &enrollment.id, enrollment).await
    }

    async fn bump_stats(&self, sequence_id: &str, update: impl FnOnce(&mut SequenceStats)) -> Result<()> {
        let _guard = self.stats_lock.lock().await;
        let mut sequence = self.load_sequence(sequence_id).await?;
        update(&mut sequence.stats);
        self.store.put_doc(SEQUENCES, sequence_id, &sequence).await
    }

    /// Claim an enrollment for execution; fails if another sweep holds it
    fn claim(&self, id: &str) -> Result<InFlight<'_>> {
        if !self.in_flight.lock().insert(id.to_string()) {
            return Err(SyndicateError::EnrollmentBusy(id.to_string()));
        }
        Ok(InFlight {
            claims: &self.in_flight,
            id: id.to_string(),
        })
    }

    async fn finish(&self, enrollment: &mut SequenceEnrollment, now: DateTime<Utc>) -> Result<()> {
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.completed_at = Some(now);
        enrollment.next_execution_at = None;
        self.save_enrollment(enrollment).await?;
        self.bump_stats(&enrollment.sequence_id, |stats| stats.completed += 1)
            .await?;
        info!(enrollment_id = %enrollment.id, subject_id = %enrollment.subject_id, "Enrollment completed");
        Ok(())
    }

    /// Enroll a subject. A second active enrollment for the same
    /// (sequence, subject) pair is rejected with `AlreadyEnrolled`.
    #[instrument(skip(self, metadata))]
    pub async fn enroll_in_sequence(
        &self,
        sequence_id: &str,
        subject_id: &str,
        metadata: Map<String, Value>,
    ) -> Result<SequenceEnrollment> {
        let _guard = self.enroll_lock.lock().await;
        let sequence = self.load_sequence(sequence_id).await?;

        let active = Query::new()
            .eq("sequence_id", sequence_id)
            .eq("subject_id", subject_id)
            .eq("status", EnrollmentStatus::Active.as_str())
            .limit(1);
        if !self.store.query(ENROLLMENTS, &active).await?.is_empty() {
            return Err(SyndicateError::AlreadyEnrolled {
                sequence_id: sequence_id.to_string(),
                subject_id: subject_id.to_string(),
            });
        }

        let now = Utc::now();
        let first_delay = sequence.steps.first().map(SequenceStep::delay).unwrap_or_else(Duration::zero);
        let enrollment = SequenceEnrollment {
            id: Uuid::new_v4().to_string(),
            sequence_id: sequence_id.to_string(),
            subject_id: subject_id.to_string(),
            status: EnrollmentStatus::Active,
            current_step_index: 0,
            executed_steps: Vec::new(),
            next_execution_at: Some(now + first_delay),
            metadata,
            signals: Vec::new(),
            enrolled_at: now,
            completed_at: None,
            stopped_at: None,
            stop_reason: None,
        };
        self.store.create_doc(ENROLLMENTS, &enrollment.id, &enrollment).await?;
        self.bump_stats(sequence_id, |stats| stats.enrolled += 1).await?;

        info!(enrollment_id = %enrollment.id, "Subject enrolled");
        Ok(enrollment)
    }

    /// Stop an active enrollment. Stopping twice is a no-op; a completed
    /// enrollment cannot be stopped.
    pub async fn stop_enrollment(&self, id: &str, reason: impl Into<String>) -> Result<SequenceEnrollment> {
        let mut enrollment = self.load_enrollment(id).await?;
        match enrollment.status {
            EnrollmentStatus::Stopped => return Ok(enrollment),
            EnrollmentStatus::Completed => {
                return Err(SyndicateError::InvalidTransition(format!(
                    "enrollment {} is already completed",
                    id
                )))
            }
            EnrollmentStatus::Active => {}
        }

        let reason = reason.into();
        enrollment.status = EnrollmentStatus::Stopped;
        enrollment.stopped_at = Some(Utc::now());
        enrollment.next_execution_at = None;
        enrollment.stop_reason = Some(reason.clone());
        self.save_enrollment(&enrollment).await?;
        self.bump_stats(&enrollment.sequence_id, |stats| stats.stopped += 1)
            .await?;

        info!(enrollment_id = %id, reason = %reason, "Enrollment stopped");
        Ok(enrollment)
    }

    /// Record a condition signal and apply the matching action of the most
    /// recently executed step (or the current step if none ran yet).
    #[instrument(skip(self))]
    pub async fn handle_condition(&self, id: &str, kind: ConditionKind) -> Result<SequenceEnrollment> {
        let _claim = self.claim(id)?;
        let mut enrollment = self.load_enrollment(id).await?;
        if !enrollment.is_active() {
            debug!(status = ?enrollment.status, "Condition on inactive enrollment ignored");
            return Ok(enrollment);
        }

        let sequence = self.load_sequence(&enrollment.sequence_id).await?;
        if !enrollment.has_signal(kind) {
            enrollment.signals.push(kind);
        }

        let now = Utc::now();
        let index = enrollment.condition_step_index();
        let action = sequence.steps.get(index).and_then(|step| step.condition(kind)).cloned();

        match action {
            Some(ConditionAction::JumpTo { next_step_index }) => {
                debug!(from = index, to = next_step_index, "Condition jump");
                enrollment.current_step_index = next_step_index;
                enrollment.next_execution_at = Some(now + sequence.steps[next_step_index].delay());
            }
            Some(ConditionAction::Terminate) => {
                self.finish(&mut enrollment, now).await?;
                return Ok(enrollment);
            }
            Some(ConditionAction::Advance) => {
                enrollment.current_step_index = enrollment.current_step_index.max(index + 1);
                match sequence.steps.get(enrollment.current_step_index) {
                    Some(next) => enrollment.next_execution_at = Some(now + next.delay()),
                    None => {
                        self.finish(&mut enrollment, now).await?;
                        return Ok(enrollment);
                    }
                }
            }
            Some(ConditionAction::Fallback { .. }) => {
                let already_substituted = enrollment
                    .executed_steps
                    .iter()
                    .any(|step| step.step_index == index && step.substituted);
                if !already_substituted {
                    enrollment.current_step_index = index;
                    enrollment.next_execution_at = Some(now);
                }
            }
            None if kind == ConditionKind::Unsubscribed => {
                self.save_enrollment(&enrollment).await?;
                return self.stop_enrollment(id, "unsubscribed").await;
            }
            None => {}
        }

        self.save_enrollment(&enrollment).await?;
        Ok(enrollment)
    }

    /// Run the enrollment's current step.
    ///
    /// Recorded signals can substitute a fallback step or terminate the
    /// sequence. A failed send is recorded and rescheduled, then reported
    /// as `ChannelSend`.
    #[instrument(skip(self))]
    pub async fn execute_sequence_step(&self, id: &str) -> Result<SequenceEnrollment> {
        let _claim = self.claim(id)?;

        let mut enrollment = self.load_enrollment(id).await?;
        if !enrollment.is_active() {
            return Err(SyndicateError::InvalidTransition(format!(
                "enrollment {} is {}",
                id,
                enrollment.status.as_str()
            )));
        }

        let sequence = self.load_sequence(&enrollment.sequence_id).await?;
        let now = Utc::now();
        let index = enrollment.current_step_index;
        let Some(configured) = sequence.steps.get(index) else {
            self.finish(&mut enrollment, now).await?;
            return Ok(enrollment);
        };

        let mut step = configured;
        let mut substituted = false;
        for condition in configured
            .conditions
            .iter()
            .filter(|c| enrollment.has_signal(c.kind))
        {
            match &condition.action {
                ConditionAction::Terminate => {
                    self.finish(&mut enrollment, now).await?;
                    return Ok(enrollment);
                }
                ConditionAction::Fallback { step: fallback } => {
                    step = fallback.as_ref();
                    substituted = true;
                    break;
                }
                _ => {}
            }
        }

        let request = SendRequest {
            enrollment_id: enrollment.id.clone(),
            subject_id: enrollment.subject_id.clone(),
            channel: step.channel,
            subject: step
                .subject
                .as_deref()
                .map(|s| render_template(s, &enrollment.subject_id, &enrollment.metadata)),
            body: render_template(&step.template, &enrollment.subject_id, &enrollment.metadata),
        };

        match self.sender.send(&request).await {
            Ok(receipt) => {
                enrollment.executed_steps.push(ExecutedStep {
                    step_index: index,
                    channel: step.channel,
                    outcome: StepOutcome::Sent,
                    substituted,
                    executed_at: now,
                    message_id: Some(receipt.message_id),
                    error: None,
                });
                enrollment.current_step_index = index + 1;
                match sequence.steps.get(index + 1) {
                    Some(next) => {
                        enrollment.next_execution_at = Some(now + next.delay());
                        self.save_enrollment(&enrollment).await?;
                    }
                    None => self.finish(&mut enrollment, now).await?,
                }
                debug!(step = index, substituted, "Sequence step executed");
                Ok(enrollment)
            }
            Err(e) => {
                enrollment.executed_steps.push(ExecutedStep {
                    step_index: index,
                    channel: step.channel,
                    outcome: StepOutcome::Failed,
                    substituted,
                    executed_at: now,
                    message_id: None,
                    error: Some(e.clone()),
                });
                let attempts = enrollment
                    .executed_steps
                    .iter()
                    .rev()
                    .take_while(|s| s.step_index == index && s.outcome == StepOutcome::Failed)
                    .count();
                enrollment.next_execution_at =
                    Some(now + Duration::minutes(i64::from(self.settings.retry_delay_minutes)));
                self.save_enrollment(&enrollment).await?;

                if attempts >= self.settings.max_send_attempts.max(1) as usize {
                    warn!(step = index, attempts, error = %e, "Sequence step undeliverable, stopping");
                    self.stop_enrollment(id, DELIVERY_FAILED).await?;
                } else {
                    warn!(step = index, attempts, error = %e, "Sequence step send failed, rescheduled");
                }
                Err(SyndicateError::ChannelSend(e))
            }
        }
    }

    /// Execute every active enrollment due at `now`. Failures are isolated
    /// per enrollment; returns how many succeeded.
    #[instrument(skip(self))]
    pub async fn process_due_sequence_steps(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = Query::new()
            .eq("status", EnrollmentStatus::Active.as_str())
            .lte("next_execution_at", timestamp_value(now))
            .order_by("next_execution_at", SortOrder::Asc)
            .limit(self.settings.batch_limit);
        let enrollments: Vec<SequenceEnrollment> = self.store.query_docs(ENROLLMENTS, &due).await?;

        let mut processed = 0;
        for enrollment in &enrollments {
            match self.execute_sequence_step(&enrollment.id).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    warn!(enrollment_id = %enrollment.id, error = %e, "Due step failed");
                }
            }
        }

        if !enrollments.is_empty() {
            info!(due = enrollments.len(), processed, "Sequence sweep finished");
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn create_test_sequencer() -> (Sequencer, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new());
        let sequencer = Sequencer::new(
            Arc::new(InMemoryStore::new()),
            sender.clone(),
            SequencerSettings::default(),
        );
        (sequencer, sender)
    }

    fn outreach_steps() -> Vec<SequenceStep> {
        vec![
            SequenceStep::new(Channel::Email, 0, "Hi {{first_name}}")
                .with_subject("Quick question for {{company}}")
                .on(ConditionKind::EmailBounced, ConditionAction::JumpTo { next_step_index: 2 })
                .on(ConditionKind::Replied, ConditionAction::Terminate),
            SequenceStep::new(Channel::Email, 0, "Following up"),
            SequenceStep::new(Channel::Linkedin, 0, "Connecting on LinkedIn"),
        ]
    }

    fn metadata() -> Map<String, Value> {
        json!({"first_name": "Ada", "company": "Analytical"})
            .as_object()
            .cloned()
            .unwrap()
    }

    // === Enrollment Tests ===

    #[tokio::test]
    async fn test_enroll_twice_is_rejected() {
        let (sequencer, _) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();

        assert_ok!(sequencer.enroll_in_sequence(&sequence.id, "lead-1", metadata()).await);
        let err = sequencer
            .enroll_in_sequence(&sequence.id, "lead-1", metadata())
            .await
            .unwrap_err();

        assert!(matches!(err, SyndicateError::AlreadyEnrolled { .. }));
        assert!(err.to_string().contains("already enrolled"));
        let stored = sequencer.get_sequence(&sequence.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.enrolled, 1);
    }

    #[tokio::test]
    async fn test_concurrent_enrollment_admits_one() {
        let (sequencer, _) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();

        let (a, b) = tokio::join!(
            sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()),
            sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    }

    #[tokio::test]
    async fn test_reenroll_after_stop() {
        let (sequencer, _) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let first = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();

        let stopped = sequencer.stop_enrollment(&first.id, "manual").await.unwrap();
        assert_eq!(stopped.status, EnrollmentStatus::Stopped);
        assert!(stopped.next_execution_at.is_none());
        assert_ok!(sequencer.stop_enrollment(&first.id, "again").await);

        assert_ok!(sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await);
        let stats = sequencer.get_sequence(&sequence.id).await.unwrap().unwrap().stats;
        assert_eq!(stats, SequenceStats { enrolled: 2, completed: 0, stopped: 1 });
    }

    #[tokio::test]
    async fn test_enroll_unknown_sequence() {
        let (sequencer, _) = create_test_sequencer();
        assert!(matches!(
            sequencer.enroll_in_sequence("nope", "lead-1", Map::new()).await,
            Err(SyndicateError::SequenceNotFound(_))
        ));
    }

    // === Execution Tests ===

    #[tokio::test]
    async fn test_execute_advances_and_completes() {
        let (sequencer, sender) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", metadata()).await.unwrap();

        let after_first = sequencer.execute_sequence_step(&enrollment.id).await.unwrap();
        assert_eq!(after_first.current_step_index, 1);
        assert_eq!(after_first.executed_steps.len(), 1);
        assert!(after_first.next_execution_at.is_some());

        sequencer.execute_sequence_step(&enrollment.id).await.unwrap();
        let done = sequencer.execute_sequence_step(&enrollment.id).await.unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert!(done.next_execution_at.is_none());

        let sent = sender.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].body, "Hi Ada");
        assert_eq!(sent[0].subject.as_deref(), Some("Quick question for Analytical"));
        assert_eq!(sent[2].channel, Channel::Linkedin);

        let stats = sequencer.get_sequence(&sequence.id).await.unwrap().unwrap().stats;
        assert_eq!(stats.completed, 1);

        assert!(matches!(
            sequencer.stop_enrollment(&enrollment.id, "late").await,
            Err(SyndicateError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_send_is_recorded_and_rescheduled() {
        let (sequencer, sender) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();
        sender.fail_for("lead-1");

        let err = sequencer.execute_sequence_step(&enrollment.id).await.unwrap_err();
        assert!(matches!(err, SyndicateError::ChannelSend(_)));

        let stored = sequencer.get_enrollment(&enrollment.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step_index, 0);
        assert_eq!(stored.executed_steps[0].outcome, StepOutcome::Failed);
        assert!(stored.next_execution_at.unwrap() > Utc::now() + Duration::minutes(29));
    }

    #[tokio::test]
    async fn test_undeliverable_step_stops_enrollment() {
        let sender = Arc::new(RecordingSender::new());
        let sequencer = Sequencer::new(
            Arc::new(InMemoryStore::new()),
            sender.clone(),
            SequencerSettings {
                max_send_attempts: 3,
                ..SequencerSettings::default()
            },
        );
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();
        sender.fail_for("lead-1");

        for _ in 0..2 {
            assert!(sequencer.execute_sequence_step(&enrollment.id).await.is_err());
            let stored = sequencer.get_enrollment(&enrollment.id).await.unwrap().unwrap();
            assert_eq!(stored.status, EnrollmentStatus::Active);
        }

        let err = sequencer.execute_sequence_step(&enrollment.id).await.unwrap_err();
        assert!(matches!(err, SyndicateError::ChannelSend(_)));

        let stored = sequencer.get_enrollment(&enrollment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Stopped);
        assert_eq!(stored.stop_reason.as_deref(), Some(DELIVERY_FAILED));
        assert_eq!(stored.executed_steps.len(), 3);
        assert!(stored.next_execution_at.is_none());

        let stats = sequencer.get_sequence(&sequence.id).await.unwrap().unwrap().stats;
        assert_eq!(stats.stopped, 1);
        assert!(matches!(
            sequencer.execute_sequence_step(&enrollment.id).await,
            Err(SyndicateError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_enrollment_is_rejected() {
        let (sequencer, _) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();

        let claim = sequencer.claim(&enrollment.id).unwrap();
        assert!(matches!(
            sequencer.execute_sequence_step(&enrollment.id).await,
            Err(SyndicateError::EnrollmentBusy(_))
        ));
        assert!(matches!(
            sequencer.handle_condition(&enrollment.id, ConditionKind::Replied).await,
            Err(SyndicateError::EnrollmentBusy(_))
        ));
        drop(claim);

        assert_ok!(sequencer.execute_sequence_step(&enrollment.id).await);
        assert_ok!(sequencer.handle_condition(&enrollment.id, ConditionKind::Replied).await);
    }

    // === Condition Tests ===

    #[tokio::test]
    async fn test_bounce_jumps_to_step_two() {
        let (sequencer, sender) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();
        sequencer.execute_sequence_step(&enrollment.id).await.unwrap();

        let moved = sequencer
            .handle_condition(&enrollment.id, ConditionKind::EmailBounced)
            .await
            .unwrap();
        assert_eq!(moved.current_step_index, 2);

        sequencer.execute_sequence_step(&enrollment.id).await.unwrap();
        let channels: Vec<Channel> = sender.sent().iter().map(|r| r.channel).collect();
        assert_eq!(channels, vec![Channel::Email, Channel::Linkedin]);
    }

    #[tokio::test]
    async fn test_reply_terminates_sequence() {
        let (sequencer, _) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();
        sequencer.execute_sequence_step(&enrollment.id).await.unwrap();

        let done = sequencer
            .handle_condition(&enrollment.id, ConditionKind::Replied)
            .await
            .unwrap();

        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert_eq!(done.signals, vec![ConditionKind::Replied]);
    }

    #[tokio::test]
    async fn test_bounce_substitutes_fallback_step() {
        let (sequencer, sender) = create_test_sequencer();
        let fallback = SequenceStep::new(Channel::Linkedin, 0, "Trying LinkedIn, {{subject_id}}");
        let sequence = sequencer
            .create_sequence(
                "fallback",
                vec![
                    SequenceStep::new(Channel::Email, 0, "Hello").on(
                        ConditionKind::EmailBounced,
                        ConditionAction::Fallback { step: Box::new(fallback) },
                    ),
                    SequenceStep::new(Channel::Email, 60, "Second"),
                ],
            )
            .await
            .unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-9", Map::new()).await.unwrap();

        sequencer.execute_sequence_step(&enrollment.id).await.unwrap();
        let rewound = sequencer
            .handle_condition(&enrollment.id, ConditionKind::EmailBounced)
            .await
            .unwrap();
        assert_eq!(rewound.current_step_index, 0);

        let after = sequencer.execute_sequence_step(&enrollment.id).await.unwrap();
        assert!(after.executed_steps[1].substituted);
        assert_eq!(after.current_step_index, 1);
        assert_eq!(sender.sent()[1].body, "Trying LinkedIn, lead-9");

        let again = sequencer
            .handle_condition(&enrollment.id, ConditionKind::EmailBounced)
            .await
            .unwrap();
        assert_eq!(again.current_step_index, 1);
    }

    #[tokio::test]
    async fn test_unhandled_unsubscribe_stops() {
        let (sequencer, _) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        let enrollment = sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();

        let stopped = sequencer
            .handle_condition(&enrollment.id, ConditionKind::Unsubscribed)
            .await
            .unwrap();

        assert_eq!(stopped.status, EnrollmentStatus::Stopped);
        assert_eq!(stopped.stop_reason.as_deref(), Some("unsubscribed"));
    }

    // === Sweep Tests ===

    #[tokio::test]
    async fn test_sweep_isolates_failing_enrollment() {
        let (sequencer, sender) = create_test_sequencer();
        let sequence = sequencer.create_sequence("intro", outreach_steps()).await.unwrap();
        for subject in ["healthy-1", "broken", "healthy-2"] {
            sequencer.enroll_in_sequence(&sequence.id, subject, Map::new()).await.unwrap();
        }
        sender.fail_for("broken");

        let processed = sequencer.process_due_sequence_steps(Utc::now()).await.unwrap();

        assert_eq!(processed, 2);
        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_skips_enrollments_not_due() {
        let (sequencer, sender) = create_test_sequencer();
        let sequence = sequencer
            .create_sequence("later", vec![SequenceStep::new(Channel::Sms, 60, "Later")])
            .await
            .unwrap();
        sequencer.enroll_in_sequence(&sequence.id, "lead-1", Map::new()).await.unwrap();

        assert_eq!(sequencer.process_due_sequence_steps(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            sequencer
                .process_due_sequence_steps(Utc::now() + Duration::minutes(61))
                .await
                .unwrap(),
            1
        );
        assert!(sender.sent().len() == 1);
    }
}
