//! Slack incoming-webhook notifications.

use serde::Serialize;
use tracing::instrument;
use url::Url;

use super::{
    commit_url, monitor_url, post_json, search_url, truncate_content, truncate_results,
    ActionArgs, Error, Result,
};
use crate::config::NotifyConfig;

/// `utm_source` of links in Slack messages.
pub const UTM_SOURCE: &str = "code-monitor-slack-webhook";

const SLACK_HOST: &str = "hooks.slack.com";

/// Body of an incoming-webhook request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payload {
    /// Sections in display order.
    pub blocks: Vec<Block>,
}

/// A Block Kit section with markdown text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    #[serde(rename = "type")]
    kind: &'static str,
    text: Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Text {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

impl Block {
    /// A section rendering `text` as Slack markdown.
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            kind: "section",
            text: Text {
                kind: "mrkdwn",
                text: text.into(),
            },
        }
    }

    /// The section's markdown.
    pub fn text(&self) -> &str {
        &self.text.text
    }
}

/// Checks that `url` is a Slack incoming-webhook URL.
pub fn validate_slack_url(url: &str) -> Result<Url> {
    let invalid = || Error::InvalidSlackUrl(url.to_string());

    let parsed = Url::parse(url).map_err(|_| invalid())?;
    if parsed.scheme() != "https" || parsed.host_str() != Some(SLACK_HOST) {
        return Err(invalid());
    }

    Ok(parsed)
}

/// Builds the message for a monitor run.
pub fn build_payload(args: &ActionArgs, limits: &NotifyConfig) -> Result<Payload> {
    let truncated = truncate_results(&args.results, limits.max_results);
    let search = search_url(&args.external_url, &args.query, args.utm_source)?;

    let mut blocks = vec![Block::markdown(format!(
        "{}'s Sourcegraph Code monitor, *{}*, detected *{}* new {}.",
        args.monitor_owner_name,
        args.monitor_description,
        truncated.total_count,
        matches(truncated.total_count),
    ))];

    if args.include_results {
        for result in truncated.kept {
            blocks.push(Block::markdown(format!(
                "{} match: <{}|{}@{}>",
                result.preview.label(),
                commit_url(&args.external_url, result)?,
                result.repository,
                result.short_commit(),
            )));
            blocks.push(Block::markdown(code_block(&truncate_content(
                &result.preview.content().content,
                limits.max_content_lines,
                limits.max_content_bytes,
            ))));
        }
        if truncated.truncated_count > 0 {
            blocks.push(Block::markdown(format!(
                "...and <{search}|{} more {}>.",
                truncated.truncated_count,
                matches(truncated.truncated_count),
            )));
        }
    } else {
        blocks.push(Block::markdown(format!("<{search}|View results>")));
    }

    blocks.push(Block::markdown(format!(
        "If you are {}, you can <{}|edit your code monitor>",
        args.monitor_owner_name,
        monitor_url(&args.external_url, args.monitor_id, args.utm_source)?,
    )));

    Ok(Payload { blocks })
}

/// Builds the message sent when a user tests a Slack action.
pub fn build_test_payload(description: &str) -> Payload {
    Payload {
        blocks: vec![
            Block::markdown(format!("Test message for Code Monitor *{description}*")),
            Block::markdown(
                "This is a test notification; it isn't triggered by a search result.",
            ),
        ],
    }
}

fn matches(count: usize) -> &'static str {
    if count == 1 {
        "match"
    } else {
        "matches"
    }
}

fn code_block(content: &str) -> String {
    let escaped = content.replace("```", "\\`\\`\\`");
    if escaped.ends_with('\n') {
        format!("```\n{escaped}```")
    } else {
        format!("```\n{escaped}\n```")
    }
}

/// Posts the message for a monitor run to `url`.
#[instrument(skip_all, fields(monitor.id = args.monitor_id), err)]
pub async fn send_slack_notification(
    client: &reqwest::Client,
    url: &str,
    args: &ActionArgs,
    limits: &NotifyConfig,
) -> Result {
    let payload = build_payload(args, limits)?;
    post_json(client, url, &payload).await
}

/// Posts a test message to `url`.
#[instrument(skip(client), err)]
pub async fn send_test_slack_webhook(
    client: &reqwest::Client,
    description: &str,
    url: &str,
) -> Result {
    post_json(client, url, &build_test_payload(description)).await
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::notify::{
        fixtures::{args, diff_match, message_match},
        StatusCodeError,
    };

    fn texts(payload: &Payload) -> Vec<&str> {
        payload.blocks.iter().map(Block::text).collect()
    }

    #[test]
    fn validates_slack_urls() {
        assert!(validate_slack_url("https://hooks.slack.com/services/T0/B0/x").is_ok());

        for url in [
            "http://hooks.slack.com/services/x",
            "https://hooks.slack.com.evil.com/services/x",
            "https://example.com/services/x",
            "not a url",
        ] {
            assert!(
                matches!(validate_slack_url(url), Err(Error::InvalidSlackUrl(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn builds_summary_results_and_footer() {
        let payload = build_payload(
            &args(vec![diff_match(1), message_match(2)]),
            &NotifyConfig::default(),
        )
        .unwrap();
        let texts = texts(&payload);

        assert_eq!(texts.len(), 6);
        assert_eq!(
            texts[0],
            "alice's Sourcegraph Code monitor, *My test monitor*, detected *2* new matches."
        );
        assert!(texts[1].starts_with("Diff match: <https://sourcegraph.example.com/"));
        assert!(texts[1].ends_with("|github.com/test/test@0000001>"));
        assert_eq!(texts[2], "```\nfile.go file.go\n@@ -1 +1 @@\n-x\n+test\n```");
        assert!(texts[3].starts_with("Message match: "));
        assert_eq!(
            texts[5],
            "If you are alice, you can \
             <https://sourcegraph.example.com/code-monitoring/7?utm_source=code-monitor-test|edit your code monitor>"
        );
    }

    #[test]
    fn links_remaining_matches() {
        let results = (0..7).map(diff_match).collect();
        let payload = build_payload(&args(results), &NotifyConfig::default()).unwrap();
        let texts = texts(&payload);

        // Summary, two sections per kept result, the "more" link, and the footer.
        assert_eq!(texts.len(), 1 + 2 * 5 + 1 + 1);
        assert_eq!(
            texts[11],
            "...and <https://sourcegraph.example.com/search?q=test+patternType%3Aliteral\
             &utm_source=code-monitor-test|2 more matches>."
        );
    }

    #[test]
    fn omits_results_unless_included() {
        let payload = build_payload(
            &ActionArgs {
                include_results: false,
                ..args(vec![diff_match(1)])
            },
            &NotifyConfig::default(),
        )
        .unwrap();
        let texts = texts(&payload);

        assert_eq!(texts.len(), 3);
        assert!(texts[0].ends_with("detected *1* new match."));
        assert!(texts[1].ends_with("|View results>"));
    }

    #[test]
    fn escapes_fences_in_content() {
        assert_eq!(code_block("a ``` b"), "```\na \\`\\`\\` b\n```");
    }

    #[test]
    fn serializes_as_block_kit() {
        let value = serde_json::to_value(build_test_payload("Deploys")).unwrap();
        assert_eq!(
            value["blocks"][0],
            json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": "Test message for Code Monitor *Deploys*" }
            })
        );
    }

    #[tokio::test]
    async fn posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/services/x")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Regex(r#""type":"mrkdwn""#.to_string()))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let url = format!("{}/services/x", server.url());
        send_slack_notification(
            &reqwest::Client::new(),
            &url,
            &args(vec![diff_match(1)]),
            &NotifyConfig::default(),
        )
        .await
        .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_ok_status_is_reported_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(404)
            .with_body("invalid_token")
            .create_async()
            .await;

        let err = send_test_slack_webhook(&reqwest::Client::new(), "Deploys", &server.url())
            .await
            .unwrap_err();

        let Error::StatusCode(StatusCodeError { code, status, body }) = err else {
            panic!("expected a status code error, got {err:?}");
        };
        assert_eq!(code, 404);
        assert_eq!(status, "404 Not Found");
        assert_eq!(body, "invalid_token");

        mock.assert_async().await;
    }
}
