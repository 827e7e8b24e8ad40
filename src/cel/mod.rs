//! Assembles the variable environment handed to user CEL expressions.
//!
//! Produces a whitelisted, shaped `serde_json::Value`; this module does not
//! evaluate CEL expressions, only builds the context they run against.

use serde_json::{Map, Value, json};

use crate::event::Event;

/// Fields that must never appear in an assembled context, even if present on
/// the source event.
pub const FORBIDDEN_FIELDS: &[&str] = &[
    "provider",
    "installation_id",
    "account_id",
    "ghe_url",
    "clone_url",
    "source_project_id",
    "target_project_id",
    "request",
    "state",
];

/// A CEL variable environment, shaped as `{"body": {"event": ..., "pipelinerun": ..., "repository": ...}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CelContext(Value);

impl CelContext {
    /// Returns the underlying JSON value.
    #[must_use]
    pub fn into_inner(self) -> Value {
        self.0
    }

    /// Borrows the underlying JSON value.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }
}

fn insert_if_non_empty(map: &mut Map<String, Value>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_owned(), Value::String(value.to_owned()));
    }
}

fn insert_if_some_non_empty(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        insert_if_non_empty(map, key, value);
    }
}

fn event_kind_str(kind: crate::event::EventKind) -> &'static str {
    use crate::event::EventKind;
    match kind {
        EventKind::Push => "push",
        EventKind::PullRequest => "pull_request",
        EventKind::PullRequestLabeled => "pull_request_labeled",
        EventKind::IssueComment => "issue_comment",
        EventKind::CommitComment => "commit_comment",
    }
}

fn trigger_target_str(target: crate::event::TriggerTarget) -> &'static str {
    use crate::event::TriggerTarget;
    match target {
        TriggerTarget::PullRequest => "pull_request",
        TriggerTarget::Push => "push",
    }
}

fn assemble_event_map(event: &Event) -> Value {
    let mut map = Map::new();

    insert_if_non_empty(&mut map, "event_type", event_kind_str(event.event_type));
    insert_if_non_empty(&mut map, "trigger_target", trigger_target_str(event.matching_kind()));
    insert_if_non_empty(&mut map, "sha", &event.sha);
    insert_if_some_non_empty(&mut map, "sha_title", event.sha_title.as_deref());
    insert_if_non_empty(&mut map, "base_branch", &event.base_branch);
    insert_if_non_empty(&mut map, "head_branch", &event.head_branch);
    insert_if_non_empty(&mut map, "default_branch", &event.default_branch);
    insert_if_non_empty(&mut map, "organization", &event.organization);
    insert_if_non_empty(&mut map, "repository", &event.repository);
    insert_if_non_empty(&mut map, "url", &event.url);
    insert_if_some_non_empty(&mut map, "sha_url", event.sha_url.as_deref());
    insert_if_some_non_empty(&mut map, "base_url", event.base_url.as_deref());
    insert_if_some_non_empty(&mut map, "head_url", event.head_url.as_deref());
    insert_if_non_empty(&mut map, "sender", &event.sender);
    insert_if_some_non_empty(&mut map, "target_pipelinerun", event.target_pipelinerun.as_deref());

    if event.pull_request_number != 0 {
        map.insert(
            "pull_request_number".to_owned(),
            Value::Number(event.pull_request_number.into()),
        );
        insert_if_some_non_empty(&mut map, "pull_request_title", event.pull_request_title.as_deref());
        if !event.pull_request_labels.is_empty() {
            map.insert(
                "pull_request_labels".to_owned(),
                Value::Array(
                    event
                        .pull_request_labels
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect(),
                ),
            );
        }
    }

    if let Some(comment) = event.trigger_comment.as_deref()
        && !comment.is_empty()
    {
        map.insert("trigger_comment".to_owned(), Value::String(comment.to_owned()));
    }

    debug_assert!(
        FORBIDDEN_FIELDS.iter().all(|field| !map.contains_key(*field)),
        "whitelist assembly must never produce a forbidden field"
    );

    Value::Object(map)
}

/// Builds a CEL context for `pipelinerun`/`repository` identity plus, if
/// `event` is given, its whitelisted field set.
///
/// `event` is `None` when no triggering event is available (e.g. a purely
/// scheduled run); the `event` sub-map is then omitted entirely.
#[must_use]
pub fn assemble(
    event: Option<&Event>,
    pipelinerun_name: &str,
    pipelinerun_namespace: &str,
    repository_name: &str,
    repository_namespace: &str,
) -> CelContext {
    let mut body = Map::new();

    if let Some(event) = event {
        body.insert("event".to_owned(), assemble_event_map(event));
    }

    body.insert(
        "pipelinerun".to_owned(),
        json!({ "name": pipelinerun_name, "namespace": pipelinerun_namespace }),
    );
    body.insert(
        "repository".to_owned(),
        json!({ "name": repository_name, "namespace": repository_namespace }),
    );

    CelContext(json!({ "body": Value::Object(body) }))
}
