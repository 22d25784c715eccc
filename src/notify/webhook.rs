//! Generic JSON webhook notifications.

use serde::Serialize;
use tracing::instrument;

use super::{kept_prefix, monitor_url, post_json, truncate_content, truncate_results, ActionArgs, Result};
use crate::{
    config::NotifyConfig,
    search::{Content, Match, MatchPreview},
};

/// `utm_source` of links in webhook payloads.
pub const UTM_SOURCE: &str = "code-monitor-webhook";

/// Body of a webhook request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// The monitor's description.
    pub monitor_description: String,

    /// Link to the monitor's edit page.
    #[serde(rename = "monitorURL")]
    pub monitor_url: String,

    /// The monitor's saved query.
    pub query: String,

    /// Results, when the action includes them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<WebhookResult>,
}

/// A single result in a webhook payload.
///
/// Exactly one of `diff` and `message` is set, with its matched ranges as
/// `[start, end)` byte offsets. Ranges always fall within the kept part of a
/// truncated preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResult {
    /// Repository name.
    pub repository: String,

    /// Full commit ID.
    pub commit: String,

    /// Diff preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,

    /// Matched spans within `diff`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_diff_ranges: Option<Vec<[usize; 2]>>,

    /// Commit message preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Matched spans within `message`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_message_ranges: Option<Vec<[usize; 2]>>,
}

impl WebhookResult {
    /// Converts `result`, truncating its preview to the content limits.
    ///
    /// Ranges that start past the kept lines are dropped and ranges that run
    /// into the truncation marker are clipped.
    pub fn new(result: &Match, limits: &NotifyConfig) -> Self {
        let split = |content: &Content| {
            let kept = kept_prefix(
                &content.content,
                limits.max_content_lines,
                limits.max_content_bytes,
            )
            .unwrap_or(content.content.len());
            let ranges: Vec<[usize; 2]> = content
                .ranges
                .iter()
                .filter(|range| range.start < kept)
                .map(|range| [range.start, range.end.min(kept)])
                .collect();
            let preview = truncate_content(
                &content.content,
                limits.max_content_lines,
                limits.max_content_bytes,
            );
            (Some(preview), Some(ranges))
        };

        let ((diff, matched_diff_ranges), (message, matched_message_ranges)) =
            match &result.preview {
                MatchPreview::Diff(content) => (split(content), (None, None)),
                MatchPreview::Message(content) => ((None, None), split(content)),
            };

        Self {
            repository: result.repository.clone(),
            commit: result.commit.clone(),
            diff,
            matched_diff_ranges,
            message,
            matched_message_ranges,
        }
    }
}

/// Builds the payload for a monitor run.
pub fn build_payload(args: &ActionArgs, limits: &NotifyConfig) -> Result<Payload> {
    let results = if args.include_results {
        truncate_results(&args.results, limits.max_results)
            .kept
            .iter()
            .map(|result| WebhookResult::new(result, limits))
            .collect()
    } else {
        Vec::new()
    };

    Ok(Payload {
        monitor_description: args.monitor_description.clone(),
        monitor_url: monitor_url(&args.external_url, args.monitor_id, args.utm_source)?
            .to_string(),
        query: args.query.clone(),
        results,
    })
}

/// Builds the payload sent when a user tests a webhook action.
pub fn build_test_payload(description: &str) -> Payload {
    Payload {
        monitor_description: description.to_string(),
        monitor_url: String::new(),
        query: String::new(),
        results: Vec::new(),
    }
}

/// Posts the payload for a monitor run to `url`.
#[instrument(skip_all, fields(monitor.id = args.monitor_id), err)]
pub async fn send_webhook_notification(
    client: &reqwest::Client,
    url: &str,
    args: &ActionArgs,
    limits: &NotifyConfig,
) -> Result {
    let payload = build_payload(args, limits)?;
    post_json(client, url, &payload).await
}

/// Posts a test payload to `url`.
#[instrument(skip(client), err)]
pub async fn send_test_webhook(client: &reqwest::Client, description: &str, url: &str) -> Result {
    post_json(client, url, &build_test_payload(description)).await
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::{
        notify::{
            fixtures::{args, diff_match, message_match},
            Error, StatusCodeError,
        },
        search::Range,
    };

    #[test]
    fn serializes_flat_payload() {
        let diff = diff_match(1);
        let message = message_match(2);
        let payload = build_payload(
            &args(vec![diff.clone(), message.clone()]),
            &NotifyConfig::default(),
        )
        .unwrap();

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "monitorDescription": "My test monitor",
                "monitorURL": "https://sourcegraph.example.com/code-monitoring/7?utm_source=code-monitor-test",
                "query": "test patternType:literal",
                "results": [
                    {
                        "repository": "github.com/test/test",
                        "commit": diff.commit,
                        "diff": "file.go file.go\n@@ -1 +1 @@\n-x\n+test\n",
                        "matchedDiffRanges": [[32, 36]],
                    },
                    {
                        "repository": "github.com/test/test",
                        "commit": message.commit,
                        "message": "add a test\n",
                        "matchedMessageRanges": [[6, 10]],
                    },
                ],
            })
        );
    }

    #[test]
    fn caps_results_and_omits_them_unless_included() {
        let results: Vec<_> = (0..8).map(diff_match).collect();

        let payload = build_payload(&args(results.clone()), &NotifyConfig::default()).unwrap();
        assert_eq!(payload.results.len(), 5);

        let payload = build_payload(
            &ActionArgs {
                include_results: false,
                ..args(results)
            },
            &NotifyConfig::default(),
        )
        .unwrap();
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("results").is_none());
    }

    #[test]
    fn truncates_large_previews_and_their_ranges() {
        let line = format!("+{}\n", "x".repeat(1999));
        let content = format!("file.go file.go\n{}", line.repeat(500));
        let last_line = content.len() - line.len();
        let result = Match {
            preview: MatchPreview::Diff(Content {
                content,
                ranges: vec![
                    Range { start: 0, end: 4 },
                    Range { start: 17, end: 4000 },
                    Range {
                        start: last_line,
                        end: last_line + 5,
                    },
                ],
            }),
            ..diff_match(1)
        };

        let payload = build_payload(&args(vec![result]), &NotifyConfig::default()).unwrap();
        let body = serde_json::to_string(&payload).unwrap();
        assert!(body.len() < 10_000);

        let result = &payload.results[0];
        let diff = result.diff.as_deref().unwrap();
        let kept = format!("file.go file.go\n{line}");
        assert_eq!(diff, format!("{kept}...\n"));
        assert_eq!(
            result.matched_diff_ranges,
            Some(vec![[0, 4], [17, kept.len()]])
        );
    }

    #[tokio::test]
    async fn posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "monitorDescription": "My test monitor",
                "query": "test patternType:literal",
            })))
            .with_status(200)
            .create_async()
            .await;

        send_webhook_notification(
            &reqwest::Client::new(),
            &format!("{}/hook", server.url()),
            &args(vec![diff_match(1)]),
            &NotifyConfig::default(),
        )
        .await
        .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_carries_description() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::Json(json!({
                "monitorDescription": "Deploys",
                "monitorURL": "",
                "query": "",
            })))
            .with_status(200)
            .create_async()
            .await;

        send_test_webhook(&reqwest::Client::new(), "Deploys", &server.url())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(201)
            .with_body("created")
            .create_async()
            .await;

        let err = send_test_webhook(&reqwest::Client::new(), "Deploys", &server.url())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::StatusCode(StatusCodeError { code: 201, ref body, .. }) if body == "created"
        ));

        mock.assert_async().await;
    }
}
