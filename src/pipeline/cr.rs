//! The code-review feedback sub-state-machine (steps 7-9).
//!
//! WaitingForReview → FeedbackReceived → FixInProgress → FixPushed.
//! Step 7 polls PR comments until one matches the configured pattern; the
//! earliest match in the host's natural order wins for the whole run.
//! Step 8 turns the feedback into an agent fix; step 9 publishes it.

use crate::providers::CodeHost;
use anyhow::{Result, bail};
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fences the fix agent uses to mark its reply summary.
pub const SUMMARY_FENCE: &str = "---CRSUMMARY---";

/// Reply posted on the PR when the agent produced no summary.
pub const FALLBACK_REPLY: &str = "CR feedback addressed. Changes pushed.";

/// Poll PR comments until one matches `pattern` or `poll_timeout` elapses.
/// Returns the matching comment body. The sleep between rounds is
/// cancellation-aware; cancellation surfaces as an error and therefore as a
/// resumable step failure.
pub async fn poll_for_feedback(
    host: &dyn CodeHost,
    pr_number: u64,
    pattern: &Regex,
    poll_interval: Duration,
    poll_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let start = Instant::now();
    loop {
        let comments = host.pr_comments(pr_number).await?;
        if let Some(comment) = comments.iter().find(|c| pattern.is_match(&c.body)) {
            tracing::info!(
                pr = pr_number,
                comment_id = comment.id,
                author = %comment.author,
                "review feedback received"
            );
            return Ok(comment.body.clone());
        }

        if start.elapsed() >= poll_timeout {
            bail!(
                "poll timeout after {}s waiting for a PR comment matching '{}'",
                poll_timeout.as_secs(),
                pattern.as_str()
            );
        }

        tokio::select! {
            () = cancel.cancelled() => bail!("cancelled while waiting for review feedback"),
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// The prompt asking the agent to address review feedback.
pub fn fix_prompt(feedback: &str) -> String {
    format!(
        "A reviewer left the following feedback on your pull request. Address \
         every point by editing the working tree.\n\n## Review feedback\n\n\
         {feedback}\n\nWhen you are done, output a short summary of what you \
         changed between two `{SUMMARY_FENCE}` fences, e.g.\n\n\
         {SUMMARY_FENCE}\nTightened input validation in the auth handler.\n\
         {SUMMARY_FENCE}\n"
    )
}

/// Text between the first pair of summary fences, trimmed. `None` when the
/// fences are absent or the summary is empty.
pub fn extract_summary(output: &str) -> Option<String> {
    let start = output.find(SUMMARY_FENCE)? + SUMMARY_FENCE.len();
    let end = output[start..].find(SUMMARY_FENCE)? + start;
    let summary = output[start..end].trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Issue, PrComment, PullRequest};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Host stub that serves a scripted comment list per poll round.
    struct ScriptedHost {
        rounds: Mutex<Vec<Vec<PrComment>>>,
        polls: Mutex<usize>,
    }

    impl ScriptedHost {
        fn new(rounds: Vec<Vec<PrComment>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
                polls: Mutex::new(0),
            }
        }

        fn poll_count(&self) -> usize {
            *self.polls.lock().unwrap()
        }
    }

    fn comment(id: u64, body: &str) -> PrComment {
        PrComment {
            id,
            author: "reviewer".to_string(),
            body: body.to_string(),
        }
    }

    #[async_trait]
    impl CodeHost for ScriptedHost {
        fn has_changes(&self, _dir: &Path) -> Result<bool> {
            unreachable!()
        }
        fn current_branch(&self, _dir: &Path) -> Result<String> {
            unreachable!()
        }
        async fn commit_and_push(&self, _: &Path, _: &str, _: &str) -> Result<()> {
            unreachable!()
        }
        async fn push(&self, _: &Path, _: &str) -> Result<()> {
            unreachable!()
        }
        async fn amend_and_force_push(&self, _: &Path, _: &str, _: Option<&str>) -> Result<()> {
            unreachable!()
        }
        async fn fetch_and_rebase(&self, _: &Path, _: &str) -> Result<()> {
            unreachable!()
        }
        async fn create_pr(&self, _: &str, _: &str, _: &str, _: &str) -> Result<PullRequest> {
            unreachable!()
        }
        async fn pr_comments(&self, _number: u64) -> Result<Vec<PrComment>> {
            *self.polls.lock().unwrap() += 1;
            let mut rounds = self.rounds.lock().unwrap();
            if rounds.len() > 1 {
                Ok(rounds.remove(0))
            } else {
                Ok(rounds.first().cloned().unwrap_or_default())
            }
        }
        async fn post_pr_comment(&self, _: u64, _: &str) -> Result<()> {
            unreachable!()
        }
        async fn pr_state(&self, _: u64) -> Result<String> {
            unreachable!()
        }
        async fn get_issue(&self, _: u64) -> Result<Issue> {
            unreachable!()
        }
        async fn list_issues(&self, _: &str, _: &str) -> Result<Vec<Issue>> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_existing_match_needs_one_poll_round() {
        let host = ScriptedHost::new(vec![vec![
            comment(1, "looks good so far"),
            comment(2, "Claude finished reviewing: please rename the flag"),
        ]]);
        let pattern = Regex::new("Claude finished").unwrap();

        let feedback = poll_for_feedback(
            &host,
            1,
            &pattern,
            Duration::from_millis(10),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(feedback, "Claude finished reviewing: please rename the flag");
        assert_eq!(host.poll_count(), 1);
    }

    #[tokio::test]
    async fn test_earliest_match_wins() {
        let host = ScriptedHost::new(vec![vec![
            comment(1, "Claude finished: first pass"),
            comment(2, "Claude finished: second pass"),
        ]]);
        let pattern = Regex::new("Claude finished").unwrap();

        let feedback = poll_for_feedback(
            &host,
            1,
            &pattern,
            Duration::from_millis(10),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(feedback, "Claude finished: first pass");
    }

    #[tokio::test]
    async fn test_poll_until_match_appears() {
        let host = ScriptedHost::new(vec![
            vec![],
            vec![comment(1, "still reviewing")],
            vec![comment(1, "still reviewing"), comment(2, "Claude finished")],
        ]);
        let pattern = Regex::new("Claude finished").unwrap();

        let feedback = poll_for_feedback(
            &host,
            1,
            &pattern,
            Duration::from_millis(5),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(feedback, "Claude finished");
        assert_eq!(host.poll_count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_error_mentions_poll_timeout() {
        let host = ScriptedHost::new(vec![vec![comment(1, "unrelated")]]);
        let pattern = Regex::new("Claude finished").unwrap();

        let err = poll_for_feedback(
            &host,
            1,
            &pattern,
            Duration::from_millis(20),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("poll timeout"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_the_sleep() {
        let host = ScriptedHost::new(vec![vec![]]);
        let pattern = Regex::new("never").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = poll_for_feedback(
            &host,
            1,
            &pattern,
            Duration::from_secs(60),
            Duration::from_secs(600),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_extract_summary_between_fences() {
        let output = format!(
            "thinking...\n{SUMMARY_FENCE}\nRenamed the flag and fixed the test.\n{SUMMARY_FENCE}\ntrailing"
        );
        assert_eq!(
            extract_summary(&output).as_deref(),
            Some("Renamed the flag and fixed the test.")
        );
    }

    #[test]
    fn test_extract_summary_absent_or_empty() {
        assert_eq!(extract_summary("no fences here"), None);
        let empty = format!("{SUMMARY_FENCE}\n   \n{SUMMARY_FENCE}");
        assert_eq!(extract_summary(&empty), None);
        let unclosed = format!("{SUMMARY_FENCE}\ndangling");
        assert_eq!(extract_summary(&unclosed), None);
    }

    #[test]
    fn test_fix_prompt_embeds_feedback_and_fences() {
        let prompt = fix_prompt("please rename the flag");
        assert!(prompt.contains("please rename the flag"));
        assert!(prompt.matches(SUMMARY_FENCE).count() >= 2);
    }
}
