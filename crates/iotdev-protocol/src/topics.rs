//! MQTT topic builders for the AWS IoT reserved topic namespace.
//!
//! Topic structure:
//! ```text
//! $aws/things/{thing}/shadow/{get|update|delete}[/accepted|/rejected|/delta]
//! $aws/things/{thing}/shadow/name/{shadow}/...
//! $aws/things/{thing}/jobs/get[/accepted|/rejected]
//! $aws/things/{thing}/jobs/notify
//! $aws/things/{thing}/jobs/{job_id}/get[/accepted|/rejected]
//! $aws/things/{thing}/jobs/{job_id}/update[/accepted|/rejected]
//! $aws/things/{thing}/tunnels/notify
//! $aws/certificates/create/json[/accepted|/rejected]
//! $aws/certificates/create-from-csr/json[/accepted|/rejected]
//! $aws/provisioning-templates/{template}/provision/json[/accepted|/rejected]
//! ```

const THINGS: &str = "$aws/things";

pub const ACCEPTED: &str = "accepted";
pub const REJECTED: &str = "rejected";
pub const DELTA: &str = "delta";

/// Append `/accepted` to a request topic.
pub fn accepted(topic: &str) -> String {
    format!("{topic}/{ACCEPTED}")
}

/// Append `/rejected` to a request topic.
pub fn rejected(topic: &str) -> String {
    format!("{topic}/{REJECTED}")
}

// ─── Shadow topics ───

/// Shadow topic prefix. `None` selects the classic (unnamed) shadow.
pub fn shadow_prefix(thing_name: &str, shadow_name: Option<&str>) -> String {
    match shadow_name {
        Some(name) => format!("{THINGS}/{thing_name}/shadow/name/{name}"),
        None => format!("{THINGS}/{thing_name}/shadow"),
    }
}

pub fn shadow_get(thing_name: &str, shadow_name: Option<&str>) -> String {
    format!("{}/get", shadow_prefix(thing_name, shadow_name))
}

pub fn shadow_update(thing_name: &str, shadow_name: Option<&str>) -> String {
    format!("{}/update", shadow_prefix(thing_name, shadow_name))
}

pub fn shadow_delete(thing_name: &str, shadow_name: Option<&str>) -> String {
    format!("{}/delete", shadow_prefix(thing_name, shadow_name))
}

pub fn shadow_delta(thing_name: &str, shadow_name: Option<&str>) -> String {
    format!("{}/{DELTA}", shadow_update(thing_name, shadow_name))
}

// ─── Jobs topics ───

pub fn jobs_prefix(thing_name: &str) -> String {
    format!("{THINGS}/{thing_name}/jobs")
}

pub fn jobs_get(thing_name: &str) -> String {
    format!("{}/get", jobs_prefix(thing_name))
}

pub fn jobs_notify(thing_name: &str) -> String {
    format!("{}/notify", jobs_prefix(thing_name))
}

pub fn job_get(thing_name: &str, job_id: &str) -> String {
    format!("{}/{job_id}/get", jobs_prefix(thing_name))
}

pub fn job_update(thing_name: &str, job_id: &str) -> String {
    format!("{}/{job_id}/update", jobs_prefix(thing_name))
}

// ─── Secure tunneling ───

pub fn tunnels_notify(thing_name: &str) -> String {
    format!("{THINGS}/{thing_name}/tunnels/notify")
}

/// Expand a notify topic format containing a `{thing_name}` placeholder.
pub fn format_thing_topic(format: &str, thing_name: &str) -> String {
    format.replace("{thing_name}", thing_name)
}

// ─── Fleet provisioning ───

pub fn certificates_create() -> String {
    "$aws/certificates/create/json".to_string()
}

pub fn certificates_create_from_csr() -> String {
    "$aws/certificates/create-from-csr/json".to_string()
}

pub fn provision(template_name: &str) -> String {
    format!("$aws/provisioning-templates/{template_name}/provision/json")
}

// ─── Subscription patterns (with MQTT wildcards) ───

/// Responses to the pending-jobs listing.
pub fn jobs_get_responses(thing_name: &str) -> String {
    format!("{}/#", jobs_get(thing_name))
}

/// Responses to any per-job describe request.
pub fn job_get_responses(thing_name: &str) -> String {
    format!("{}/+/get/#", jobs_prefix(thing_name))
}

/// Responses to any per-job update request.
pub fn job_update_responses(thing_name: &str) -> String {
    format!("{}/+/update/#", jobs_prefix(thing_name))
}

// ─── Filter matching ───

/// Match a topic against an MQTT filter with `+` and `#` wildcards.
///
/// Topics beginning with `$` are never matched by a leading wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Number of literal characters before the first wildcard in a filter.
///
/// Used to break ties when several registered filters match one topic.
pub fn literal_prefix_len(filter: &str) -> usize {
    filter.find(['+', '#']).unwrap_or(filter.len())
}
