//! Email notifications.
//!
//! [`template_data`] flattens an [`ActionArgs`] into the values the
//! templates need, [`render`] turns those into a subject and bodies, and
//! [`build_email`] adds recipients and, when a reply mailbox is configured,
//! a signed reply address plus threading headers. Delivery is left to a
//! [`Mailer`].

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use hmac::{Hmac, Mac};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use sha2::Sha256;
use tracing::instrument;
use url::Url;

use super::{
    commit_url, monitor_url, pluralize, search_url, truncate_content, truncate_results,
    ActionArgs, Error, Result,
};
use crate::{
    config::{NotifyConfig, ReplyConfig},
    monitor::{MonitorId, Priority},
    job::JobId,
};

/// `utm_source` of links in monitor emails.
pub const UTM_SOURCE: &str = "code-monitor-email";

// Names the full result list the "more" line points at, so it stays
// singular whatever the count.
const TRUNCATED_RESULT_NOUN: &str = "result";

const SUBJECT: &str = "{% if is_test %}Test: {% endif %}\
{% if priority %}[{{ priority }} event] {% endif %}{{ description }}";

const TEXT: &str = r#"Code monitor: {{ description }}

{{ total_count }} new {{ result_pluralized }} found.
{% if include_results %}{% for result in truncated_results %}
{{ result.kind }} match: {{ result.repository }}@{{ result.commit }}
{{ result.commit_url }}
{{ result.content }}
{% endfor %}{% endif %}{% if display_more_link %}
...and {{ truncated_count }} more in the full {{ truncated_result_pluralized }} list.
{% endif %}
View all {{ result_pluralized }}: {{ search_url }}
Edit this code monitor: {{ code_monitor_url }}
"#;

const HTML: &str = r#"<p><strong>Code monitor:</strong> {{ description }}</p>
<p>{{ total_count }} new {{ result_pluralized }} found.</p>
{% if include_results %}{% for result in truncated_results %}<div>
  <p>{{ result.kind }} match: <a href="{{ result.commit_url }}">{{ result.repository }}@{{ result.commit }}</a></p>
  <pre>{{ result.content }}</pre>
</div>
{% endfor %}{% endif %}{% if display_more_link %}<p>...and {{ truncated_count }} more in the full {{ truncated_result_pluralized }} list.</p>
{% endif %}<p><a href="{{ search_url }}">View all {{ result_pluralized }}</a></p>
<p><a href="{{ code_monitor_url }}">Edit this code monitor</a></p>
"#;

/// A result as shown in an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayResult {
    /// `Diff`, `Message`, or `Test`.
    pub kind: String,

    /// Repository name.
    pub repository: String,

    /// Abbreviated commit ID.
    pub commit: String,

    /// Link to the commit.
    pub commit_url: String,

    /// Truncated preview text.
    pub content: String,
}

/// Values the email templates are rendered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateData {
    /// `Critical` for critical monitors, empty otherwise.
    pub priority: String,

    /// Link to the monitor's edit page.
    pub code_monitor_url: String,

    /// Link to the monitor's search results.
    pub search_url: String,

    /// The monitor's description.
    pub description: String,

    /// Results rendered into the body, capped by the display limit.
    pub truncated_results: Vec<DisplayResult>,

    /// Number of results found.
    pub total_count: usize,

    /// Number of results beyond the counting cap.
    pub truncated_count: usize,

    /// `result` or `results`, agreeing with `total_count`.
    pub result_pluralized: String,

    /// Noun used in the "more" line, as in "the full result list".
    pub truncated_result_pluralized: String,

    /// Whether some results aren't shown in the body.
    pub display_more_link: bool,

    /// Whether result contents are rendered at all.
    pub include_results: bool,

    /// Set for test notifications.
    pub is_test: bool,
}

/// A rendered email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Recipient addresses.
    pub to: Vec<String>,

    /// Subject line.
    pub subject: String,

    /// Plain text body.
    pub text: String,

    /// HTML body.
    pub html: String,

    /// Signed reply address, when replies are enabled.
    pub reply_to: Option<String>,

    /// Extra headers such as `Message-ID` and `References`.
    pub headers: Vec<(String, String)>,
}

/// Delivers rendered emails.
pub trait Mailer: Send + Sync + 'static {
    /// Sends `email` to its recipients.
    fn send(&self, email: Email) -> impl Future<Output = std::result::Result<(), Error>> + Send;
}

/// A mailer that keeps every email in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailer {
    sent: Arc<Mutex<Vec<Email>>>,
}

impl MemoryMailer {
    /// Emails sent so far, oldest first.
    pub fn sent(&self) -> Vec<Email> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Mailer for MemoryMailer {
    async fn send(&self, email: Email) -> Result {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(email);
        Ok(())
    }
}

/// Builds the template values for a monitor run.
pub fn template_data(
    args: &ActionArgs,
    priority: Priority,
    limits: &NotifyConfig,
) -> Result<TemplateData> {
    let truncated = truncate_results(&args.results, limits.max_results);

    let truncated_results = if args.include_results {
        truncated
            .kept
            .iter()
            .take(limits.max_display_results)
            .map(|result| -> Result<DisplayResult> {
                Ok(DisplayResult {
                    kind: result.preview.label().to_string(),
                    repository: result.repository.clone(),
                    commit: result.short_commit().to_string(),
                    commit_url: commit_url(&args.external_url, result)?.to_string(),
                    content: truncate_content(
                        &result.preview.content().content,
                        limits.max_content_lines,
                        limits.max_content_bytes,
                    ),
                })
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    Ok(TemplateData {
        priority: match priority {
            Priority::Critical => "Critical".to_string(),
            Priority::Normal => String::new(),
        },
        code_monitor_url: monitor_url(&args.external_url, args.monitor_id, args.utm_source)?
            .to_string(),
        search_url: search_url(&args.external_url, &args.query, args.utm_source)?.to_string(),
        description: args.monitor_description.clone(),
        display_more_link: args.include_results
            && truncated.total_count > truncated_results.len(),
        truncated_results,
        total_count: truncated.total_count,
        truncated_count: truncated.truncated_count,
        result_pluralized: pluralize("result", truncated.total_count),
        truncated_result_pluralized: TRUNCATED_RESULT_NOUN.to_string(),
        include_results: args.include_results,
        is_test: false,
    })
}

/// Template values for a test email with one synthetic result.
pub fn test_template_data(description: &str, external_url: &Url) -> Result<TemplateData> {
    Ok(TemplateData {
        priority: String::new(),
        code_monitor_url: external_url.join("code-monitoring")?.to_string(),
        search_url: external_url.join("search")?.to_string(),
        description: description.to_string(),
        truncated_results: vec![DisplayResult {
            kind: "Test".to_string(),
            repository: "test-repo".to_string(),
            commit: "0000000".to_string(),
            commit_url: String::new(),
            content: "This is a test\nfor a code monitoring result.".to_string(),
        }],
        total_count: 1,
        truncated_count: 0,
        result_pluralized: pluralize("result", 1),
        truncated_result_pluralized: TRUNCATED_RESULT_NOUN.to_string(),
        display_more_link: false,
        include_results: true,
        is_test: true,
    })
}

/// Rendered subject and bodies.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Renders the subject, text, and HTML templates.
pub fn render(data: &TemplateData) -> Result<Rendered> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("subject.txt", SUBJECT)?;
    env.add_template("body.txt", TEXT)?;
    env.add_template("body.html", HTML)?;

    Ok(Rendered {
        subject: env.get_template("subject.txt")?.render(data)?,
        text: env.get_template("body.txt")?.render(data)?,
        html: env.get_template("body.html")?.render(data)?,
    })
}

/// Signs a reply token for one monitor run.
pub fn reply_token(secret: &str, monitor_id: MonitorId, trigger_job_id: JobId) -> Result<String> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| Error::InvalidReplySecret)?;
    mac.update(format!("{monitor_id}:{trigger_job_id}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Renders the email for a monitor run.
pub fn build_email(
    args: &ActionArgs,
    recipients: &[String],
    priority: Priority,
    limits: &NotifyConfig,
) -> Result<Email> {
    let Rendered {
        subject,
        text,
        html,
    } = render(&template_data(args, priority, limits)?)?;

    let mut email = Email {
        to: recipients.to_vec(),
        subject,
        text,
        html,
        reply_to: None,
        headers: Vec::new(),
    };
    if let Some(reply) = &limits.reply {
        add_reply_headers(&mut email, reply, args.monitor_id, args.trigger_job_id)?;
    }

    Ok(email)
}

fn add_reply_headers(
    email: &mut Email,
    reply: &ReplyConfig,
    monitor_id: MonitorId,
    trigger_job_id: JobId,
) -> Result {
    let (local, domain) = reply
        .address
        .rsplit_once('@')
        .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
        .ok_or_else(|| Error::InvalidReplyAddress(reply.address.clone()))?;

    let token = reply_token(&reply.secret, monitor_id, trigger_job_id)?;
    email.reply_to = Some(format!("{local}+{token}@{domain}"));

    // Every run of a monitor references the same thread root.
    let thread = format!("<codemonitor-{monitor_id}@{domain}>");
    email.headers = vec![
        (
            "Message-ID".to_string(),
            format!("<codemonitor-{monitor_id}-{trigger_job_id}@{domain}>"),
        ),
        ("In-Reply-To".to_string(), thread.clone()),
        ("References".to_string(), thread),
    ];

    Ok(())
}

/// Renders and delivers the email for a monitor run.
#[instrument(
    skip_all,
    fields(monitor.id = args.monitor_id, recipients = recipients.len()),
    err
)]
pub async fn send_email<M: Mailer>(
    mailer: &M,
    args: &ActionArgs,
    recipients: &[String],
    priority: Priority,
    limits: &NotifyConfig,
) -> Result {
    let email = build_email(args, recipients, priority, limits)?;
    mailer.send(email).await
}

/// Sends a test email for a monitor that hasn't run yet.
#[instrument(skip(mailer, external_url), err)]
pub async fn send_test_email<M: Mailer>(
    mailer: &M,
    description: &str,
    recipients: &[String],
    external_url: &Url,
) -> Result {
    let Rendered {
        subject,
        text,
        html,
    } = render(&test_template_data(description, external_url)?)?;

    mailer
        .send(Email {
            to: recipients.to_vec(),
            subject,
            text,
            html,
            reply_to: None,
            headers: Vec::new(),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{
        external_base,
        fixtures::{args, diff_match, message_match},
    };

    fn nine_results() -> Vec<crate::search::Match> {
        (0..9)
            .map(|n| if n % 2 == 0 { diff_match(n) } else { message_match(n) })
            .collect()
    }

    #[test]
    fn nine_results_are_counted_and_capped() {
        let data = template_data(
            &args(nine_results()),
            Priority::Normal,
            &NotifyConfig::default(),
        )
        .unwrap();

        assert_eq!(data.total_count, 9);
        assert_eq!(data.result_pluralized, "results");
        assert_eq!(data.truncated_count, 4);
        assert_eq!(data.truncated_result_pluralized, "result");
        assert_eq!(data.truncated_results.len(), 3);
        assert_eq!(
            data.truncated_results
                .iter()
                .map(|result| result.kind.as_str())
                .collect::<Vec<_>>(),
            ["Diff", "Message", "Diff"]
        );
        assert!(data.display_more_link);
        assert_eq!(data.priority, "");
        assert_eq!(
            data.search_url,
            "https://sourcegraph.example.com/search?q=test+patternType%3Aliteral&utm_source=code-monitor-test"
        );
    }

    #[test]
    fn more_line_names_the_truncated_count() {
        let data = template_data(
            &args(nine_results()),
            Priority::Normal,
            &NotifyConfig::default(),
        )
        .unwrap();
        let rendered = render(&data).unwrap();

        assert!(rendered.text.contains("9 new results found."));
        assert!(rendered
            .text
            .contains("...and 4 more in the full result list."));
    }

    #[test]
    fn results_are_omitted_unless_included() {
        let data = template_data(
            &ActionArgs {
                include_results: false,
                ..args(nine_results())
            },
            Priority::Critical,
            &NotifyConfig::default(),
        )
        .unwrap();

        assert!(data.truncated_results.is_empty());
        assert!(!data.display_more_link);
        assert_eq!(data.total_count, 9);
        assert_eq!(data.priority, "Critical");
    }

    #[test]
    fn renders_subject_and_bodies() {
        let data = template_data(
            &args(vec![diff_match(1)]),
            Priority::Critical,
            &NotifyConfig::default(),
        )
        .unwrap();
        let rendered = render(&data).unwrap();

        assert_eq!(rendered.subject, "[Critical event] My test monitor");
        assert!(rendered.text.contains("1 new result found."));
        assert!(rendered.text.contains("Diff match: github.com/test/test@0000001"));
        assert!(!rendered.text.contains("more in the full"));
        assert!(rendered.html.contains("<pre>file.go file.go"));
        assert!(rendered
            .text
            .contains("https://sourcegraph.example.com/code-monitoring/7?utm_source=code-monitor-test"));
    }

    #[test]
    fn html_body_is_escaped() {
        let mut data = template_data(
            &args(vec![diff_match(1)]),
            Priority::Normal,
            &NotifyConfig::default(),
        )
        .unwrap();
        data.description = "<script>".to_string();

        let rendered = render(&data).unwrap();
        assert!(rendered.html.contains("&lt;script&gt;"));
        assert!(rendered.text.contains("<script>"));
    }

    #[test]
    fn reply_headers_thread_runs() {
        let limits = NotifyConfig {
            reply: Some(ReplyConfig {
                address: "monitors@example.com".to_string(),
                secret: "hunter2".to_string(),
            }),
            ..NotifyConfig::default()
        };
        let email = build_email(
            &args(vec![diff_match(1)]),
            &["alice@example.com".to_string()],
            Priority::Normal,
            &limits,
        )
        .unwrap();

        let token = reply_token("hunter2", 7, 11).unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(
            email.reply_to.as_deref(),
            Some(format!("monitors+{token}@example.com").as_str())
        );
        assert_eq!(
            email.headers,
            vec![
                (
                    "Message-ID".to_string(),
                    "<codemonitor-7-11@example.com>".to_string()
                ),
                (
                    "In-Reply-To".to_string(),
                    "<codemonitor-7@example.com>".to_string()
                ),
                (
                    "References".to_string(),
                    "<codemonitor-7@example.com>".to_string()
                ),
            ]
        );
    }

    #[test]
    fn reply_tokens_differ_per_run_and_secret() {
        let token = reply_token("hunter2", 7, 11).unwrap();
        assert_ne!(token, reply_token("hunter2", 7, 12).unwrap());
        assert_ne!(token, reply_token("hunter3", 7, 11).unwrap());
        assert_eq!(token, reply_token("hunter2", 7, 11).unwrap());
    }

    #[test]
    fn no_reply_headers_without_mailbox() {
        let email = build_email(
            &args(vec![]),
            &["alice@example.com".to_string()],
            Priority::Normal,
            &NotifyConfig::default(),
        )
        .unwrap();

        assert!(email.reply_to.is_none());
        assert!(email.headers.is_empty());
    }

    #[test]
    fn rejects_malformed_reply_address() {
        let limits = NotifyConfig {
            reply: Some(ReplyConfig {
                address: "monitors".to_string(),
                secret: "hunter2".to_string(),
            }),
            ..NotifyConfig::default()
        };

        assert!(matches!(
            build_email(&args(vec![]), &[], Priority::Normal, &limits),
            Err(Error::InvalidReplyAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_email_is_delivered() {
        let mailer = MemoryMailer::default();
        let base = external_base("https://sourcegraph.example.com").unwrap();

        send_test_email(&mailer, "My monitor", &["bob@example.com".to_string()], &base)
            .await
            .unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Test: My monitor");
        assert_eq!(sent[0].to, vec!["bob@example.com".to_string()]);
        assert!(sent[0].text.contains("test-repo@0000000"));
    }
}
