//! Human Signal Broker: questions out as comments, answers back as signals.
//!
//! A step that needs a human posts one or more questions through `ask`. Each
//! question becomes a tracker comment and a `pending` row tied to the run and
//! step. Replies to that comment are parsed, recorded exactly once with a
//! compare-and-set out of `pending`, and the owning run is woken through the
//! signal channel. The runtime resumes a blocked run only when none of its
//! questions are still pending.

mod parser;

pub use parser::{NO_REASON, ParsedAnswer, parse_reply};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::collab::IssueTracker;
use crate::db::DbHandle;
use crate::errors::BrokerError;
use crate::models::*;

/// Responder recorded on answers the broker synthesises itself.
pub const SYSTEM_RESPONDER: &str = "system";

/// A question a step wants to ask.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionSpec {
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone)]
pub enum AskOutcome {
    /// Questions are out; the step should suspend on these ids.
    Waiting(Vec<String>),
    /// Every question for this step is resolved, in the order asked.
    Resolved(Vec<PendingQuestion>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(SignalPayload),
    AlreadyAnswered { question_id: String },
    NotAQuestionReply,
}

#[derive(Clone)]
pub struct HumanSignalBroker {
    db: DbHandle,
    tracker: Arc<dyn IssueTracker>,
    signals: mpsc::UnboundedSender<String>,
    question_timeout: chrono::Duration,
}

impl HumanSignalBroker {
    pub fn new(
        db: DbHandle,
        tracker: Arc<dyn IssueTracker>,
        signals: mpsc::UnboundedSender<String>,
        question_timeout: chrono::Duration,
    ) -> Self {
        Self {
            db,
            tracker,
            signals,
            question_timeout,
        }
    }

    /// Post a question as a comment on the run's item and record it pending.
    pub async fn post_question(
        &self,
        run: &RunRecord,
        step_name: &str,
        spec: &QuestionSpec,
    ) -> Result<PendingQuestion, BrokerError> {
        let id = uuid::Uuid::new_v4().to_string();
        let body = render_question(spec);
        let comment_id = self
            .tracker
            .post_comment(&run.item_id, &body, None)
            .await
            .map_err(|e| BrokerError::PostFailed {
                item_id: run.item_id.clone(),
                message: format!("{:#}", e),
            })?;

        let now = Utc::now();
        let question = PendingQuestion {
            id,
            item_id: run.item_id.clone(),
            run_id: run.id.clone(),
            step_name: step_name.to_string(),
            kind: spec.kind,
            prompt: spec.prompt.clone(),
            options: spec.options.clone(),
            comment_id,
            state: QuestionState::Pending,
            answer: None,
            deadline: now + self.question_timeout,
            created_at: now,
        };
        let stored = question.clone();
        self.db.call(move |db| db.insert_question(&stored)).await?;
        tracing::info!(
            run_id = %run.id,
            item_id = %run.item_id,
            question_id = %question.id,
            kind = question.kind.as_str(),
            "question posted"
        );
        Ok(question)
    }

    /// Ask a step's questions, idempotently across re-executions.
    ///
    /// The first call posts every question. Later calls post only those a
    /// crash left unposted, and report `Resolved` once nothing is pending.
    pub async fn ask(
        &self,
        run: &RunRecord,
        step_name: &str,
        specs: &[QuestionSpec],
    ) -> Result<AskOutcome, BrokerError> {
        let (run_id, step) = (run.id.clone(), step_name.to_string());
        let mut asked = self
            .db
            .call(move |db| db.questions_for_step(&run_id, &step))
            .await?;

        for spec in specs.iter().skip(asked.len()) {
            asked.push(self.post_question(run, step_name, spec).await?);
        }

        let pending: Vec<String> = asked
            .iter()
            .filter(|q| q.state == QuestionState::Pending)
            .map(|q| q.id.clone())
            .collect();
        if pending.is_empty() {
            Ok(AskOutcome::Resolved(asked))
        } else {
            Ok(AskOutcome::Waiting(pending))
        }
    }

    /// Record an answer for the question posted as `parent_comment_id` and
    /// signal its run. At most one answer per question is ever delivered.
    pub async fn deliver_answer(
        &self,
        parent_comment_id: &str,
        answer: ParsedAnswer,
        responder: &str,
        source_comment_id: Option<&str>,
    ) -> Result<DeliveryOutcome, BrokerError> {
        let parent = parent_comment_id.to_string();
        let Some(question) = self
            .db
            .call(move |db| db.question_by_comment(&parent))
            .await?
        else {
            return Ok(DeliveryOutcome::NotAQuestionReply);
        };

        if question.state != QuestionState::Pending {
            tracing::debug!(question_id = %question.id, state = question.state.as_str(), "late answer ignored");
            return Ok(DeliveryOutcome::AlreadyAnswered {
                question_id: question.id,
            });
        }

        let payload = SignalPayload {
            question_id: question.id.clone(),
            response_type: answer.response_type,
            selected_option: answer.selected_option,
            custom_text: answer.custom_text,
            responded_by: responder.to_string(),
            responded_at: Utc::now(),
            source_comment_id: source_comment_id.map(String::from),
        };
        let (id, stored) = (question.id.clone(), payload.clone());
        let won = self
            .db
            .call(move |db| db.resolve_question(&id, QuestionState::Answered, Some(&stored)))
            .await?;
        if !won {
            return Ok(DeliveryOutcome::AlreadyAnswered {
                question_id: question.id,
            });
        }

        tracing::info!(
            run_id = %question.run_id,
            question_id = %question.id,
            response = ?payload.response_type,
            "answer delivered"
        );
        self.signal(&question.run_id);
        Ok(DeliveryOutcome::Delivered(payload))
    }

    /// Time out every pending question past its deadline and signal the
    /// owning runs with a `timeout` response.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<PendingQuestion>, BrokerError> {
        let overdue = self.db.call(move |db| db.overdue_questions(now)).await?;
        let mut expired = Vec::new();
        for mut question in overdue {
            let payload = SignalPayload {
                question_id: question.id.clone(),
                response_type: ResponseType::Timeout,
                selected_option: None,
                custom_text: None,
                responded_by: SYSTEM_RESPONDER.to_string(),
                responded_at: now,
                source_comment_id: None,
            };
            let (id, stored) = (question.id.clone(), payload.clone());
            let won = self
                .db
                .call(move |db| db.resolve_question(&id, QuestionState::TimedOut, Some(&stored)))
                .await?;
            if won {
                tracing::warn!(run_id = %question.run_id, question_id = %question.id, "question timed out");
                self.signal(&question.run_id);
                question.state = QuestionState::TimedOut;
                question.answer = Some(payload);
                expired.push(question);
            }
        }
        Ok(expired)
    }

    /// Cancel every pending question of a run. Returns how many were released.
    pub async fn release_for_run(&self, run_id: &str) -> Result<usize, BrokerError> {
        let id = run_id.to_string();
        let released = self.db.call(move |db| db.cancel_questions_for_run(&id)).await?;
        if released > 0 {
            tracing::info!(run_id, released, "pending questions released");
        }
        Ok(released)
    }

    fn signal(&self, run_id: &str) {
        if self.signals.send(run_id.to_string()).is_err() {
            // Receiver gone (shutdown). The startup recovery pass resumes it.
            tracing::warn!(run_id, "signal channel closed; run resumes on next start");
        }
    }
}

/// Comment body for a question: prompt, options and reply instructions.
pub fn render_question(spec: &QuestionSpec) -> String {
    let heading = match spec.kind {
        QuestionKind::Clarification => "Clarification needed",
        QuestionKind::SolutionChoice => "Choose an approach",
        QuestionKind::Approval => "Approval requested",
    };
    let mut body = format!("**{}**\n\n{}\n", heading, spec.prompt.trim());
    if !spec.options.is_empty() {
        body.push_str("\nOptions:\n");
        for option in &spec.options {
            body.push_str(&format!("- `OPTION:{}` {}\n", option.id, option.label));
        }
    }
    let instructions = match spec.kind {
        QuestionKind::Clarification => {
            "Reply to this comment with `APPROVE` to accept the assumption, \
             `REJECT: <correction>` to correct it, or an `OPTION:<id>` above."
        }
        QuestionKind::SolutionChoice => {
            "Reply to this comment with `OPTION:<id>`, or `REJECT: <reason>` to reject all options."
        }
        QuestionKind::Approval => {
            "Reply to this comment with `APPROVE` or `REJECT: <reason>`."
        }
    };
    body.push('\n');
    body.push_str(instructions);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Phase;
    use crate::test_support::MockTracker;

    struct Fixture {
        db: DbHandle,
        tracker: Arc<MockTracker>,
        broker: HumanSignalBroker,
        signals: mpsc::UnboundedReceiver<String>,
        run: RunRecord,
    }

    async fn fixture() -> Fixture {
        let db = DbHandle::in_memory().unwrap();
        let run = db
            .call(|db| db.create_run("run-1", "item-1", Phase::Refinement, Utc::now()))
            .await
            .unwrap();
        let tracker = Arc::new(MockTracker::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = HumanSignalBroker::new(db.clone(), tracker.clone(), tx, chrono::Duration::hours(72));
        Fixture {
            db,
            tracker,
            broker,
            signals: rx,
            run,
        }
    }

    fn clarification(prompt: &str) -> QuestionSpec {
        QuestionSpec {
            kind: QuestionKind::Clarification,
            prompt: prompt.to_string(),
            options: vec![],
        }
    }

    #[tokio::test]
    async fn test_post_question_records_pending_with_deadline() {
        let f = fixture().await;
        let q = f
            .broker
            .post_question(&f.run, "clarify", &clarification("Which currency?"))
            .await
            .unwrap();
        assert_eq!(q.state, QuestionState::Pending);
        assert!(q.deadline > Utc::now() + chrono::Duration::hours(71));
        let comments = f.tracker.comments_for("item-1");
        assert_eq!(comments.len(), 1);
        assert!(comments[0].body.contains("Which currency?"));
        assert_eq!(comments[0].id, q.comment_id);
    }

    #[tokio::test]
    async fn test_ask_is_idempotent() {
        let f = fixture().await;
        let specs = vec![clarification("One?"), clarification("Two?")];
        let first = f.broker.ask(&f.run, "clarify", &specs).await.unwrap();
        let second = f.broker.ask(&f.run, "clarify", &specs).await.unwrap();
        match (first, second) {
            (AskOutcome::Waiting(a), AskOutcome::Waiting(b)) => {
                assert_eq!(a.len(), 2);
                assert_eq!(a, b);
            }
            other => panic!("Expected two Waiting outcomes, got {:?}", other),
        }
        assert_eq!(f.tracker.comments_for("item-1").len(), 2);
    }

    #[tokio::test]
    async fn test_double_delivery_signals_once() {
        let mut f = fixture().await;
        let q = f
            .broker
            .post_question(&f.run, "clarify", &clarification("Which currency?"))
            .await
            .unwrap();

        let first = f
            .broker
            .deliver_answer(&q.comment_id, ParsedAnswer::approved(), "alice", Some("r1"))
            .await
            .unwrap();
        let second = f
            .broker
            .deliver_answer(&q.comment_id, ParsedAnswer::rejected("no"), "bob", Some("r2"))
            .await
            .unwrap();

        assert!(matches!(first, DeliveryOutcome::Delivered(ref p) if p.responded_by == "alice"));
        assert_eq!(
            second,
            DeliveryOutcome::AlreadyAnswered {
                question_id: q.id.clone()
            }
        );
        assert_eq!(f.signals.recv().await.as_deref(), Some("run-1"));
        assert!(f.signals.try_recv().is_err());

        let stored = f.db.call(move |db| db.get_question(&q.id)).await.unwrap().unwrap();
        assert_eq!(stored.answer.unwrap().response_type, ResponseType::Approved);
    }

    #[tokio::test]
    async fn test_reply_to_unknown_comment() {
        let f = fixture().await;
        let outcome = f
            .broker
            .deliver_answer("not-a-question", ParsedAnswer::approved(), "alice", None)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::NotAQuestionReply);
    }

    #[tokio::test]
    async fn test_ask_resolves_after_answers() {
        let f = fixture().await;
        let specs = vec![clarification("One?")];
        let AskOutcome::Waiting(ids) = f.broker.ask(&f.run, "clarify", &specs).await.unwrap() else {
            panic!("Expected Waiting");
        };
        let comment = f.tracker.comments_for("item-1")[0].id.clone();
        f.broker
            .deliver_answer(&comment, ParsedAnswer::option("a"), "alice", None)
            .await
            .unwrap();
        match f.broker.ask(&f.run, "clarify", &specs).await.unwrap() {
            AskOutcome::Resolved(questions) => {
                assert_eq!(questions[0].id, ids[0]);
                assert_eq!(
                    questions[0].answer.as_ref().unwrap().selected_option.as_deref(),
                    Some("A")
                );
            }
            other => panic!("Expected Resolved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expire_overdue_times_out_and_signals() {
        let mut f = fixture().await;
        let q = f
            .broker
            .post_question(&f.run, "clarify", &clarification("Which currency?"))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::hours(73);
        let expired = f.broker.expire_overdue(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].answer.as_ref().unwrap().response_type, ResponseType::Timeout);
        assert_eq!(f.signals.recv().await.as_deref(), Some("run-1"));

        // An answer arriving after the timeout is not delivered.
        let late = f
            .broker
            .deliver_answer(&q.comment_id, ParsedAnswer::approved(), "alice", None)
            .await
            .unwrap();
        assert!(matches!(late, DeliveryOutcome::AlreadyAnswered { .. }));
    }

    #[tokio::test]
    async fn test_release_for_run_cancels_pending() {
        let f = fixture().await;
        f.broker
            .ask(&f.run, "clarify", &[clarification("One?"), clarification("Two?")])
            .await
            .unwrap();
        assert_eq!(f.broker.release_for_run("run-1").await.unwrap(), 2);
        let pending = f.db.call(|db| db.pending_count_for_run("run-1")).await.unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn test_render_question_lists_options() {
        let body = render_question(&QuestionSpec {
            kind: QuestionKind::SolutionChoice,
            prompt: "How should we store invoices?".into(),
            options: vec![
                QuestionOption { id: "A".into(), label: "Postgres".into() },
                QuestionOption { id: "B".into(), label: "S3".into() },
            ],
        });
        assert!(body.contains("`OPTION:A` Postgres"));
        assert!(body.contains("`OPTION:B` S3"));
        assert!(body.contains("Choose an approach"));
    }
}
