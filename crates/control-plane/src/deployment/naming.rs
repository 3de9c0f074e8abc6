//! Deterministic names for images, containers and dev services.

const SHORT_COMMIT_LEN: usize = 7;
const SHORT_ID_LEN: usize = 6;

/// Lowercase `[a-z0-9-]` with runs of other characters collapsed to one dash.
///
/// # Errors
/// Returns an error when nothing usable is left.
pub fn slugify(name: &str) -> Result<String, String> {
    let mut slug = String::new();
    let mut previous_was_separator = false;

    for character in name.chars() {
        let lowercase = character.to_ascii_lowercase();
        if lowercase.is_ascii_alphanumeric() {
            slug.push(lowercase);
            previous_was_separator = false;
            continue;
        }

        if !previous_was_separator {
            slug.push('-');
            previous_was_separator = true;
        }
    }

    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        return Err(format!("'{name}' cannot be turned into a resource name"));
    }

    Ok(slug)
}

fn truncate_label(label: &str, max_len: usize, fallback: &str) -> String {
    let mut truncated = label.chars().take(max_len).collect::<String>();
    while truncated.ends_with('-') {
        let _ = truncated.pop();
    }

    if truncated.is_empty() {
        fallback.to_string()
    } else {
        truncated
    }
}

fn slug_or(name: &str, fallback: &str) -> String {
    slugify(name).unwrap_or_else(|_| fallback.to_string())
}

#[must_use]
pub fn short_commit(commit_hash: &str) -> String {
    commit_hash.chars().take(SHORT_COMMIT_LEN).collect()
}

fn short_id(id: &str) -> String {
    id.replace('-', "").chars().take(SHORT_ID_LEN).collect()
}

/// `<org-slug>/<app-name>:<short-commit>`.
#[must_use]
pub fn image_tag(organization_slug: &str, application_name: &str, commit_hash: &str) -> String {
    format!(
        "{}/{}:{}",
        slug_or(organization_slug, "org"),
        truncate_label(&slug_or(application_name, "app"), 63, "app"),
        short_commit(commit_hash)
    )
}

/// `<app-name>-<short-commit>-<deployment>`. The deployment suffix keeps two
/// deployments of one commit from colliding while both exist.
#[must_use]
pub fn container_name(application_name: &str, commit_hash: &str, deployment_id: &str) -> String {
    let suffix = format!("{}-{}", short_commit(commit_hash), short_id(deployment_id));
    let max_prefix = 63_usize.saturating_sub(suffix.len() + 1);
    let prefix = truncate_label(&slug_or(application_name, "app"), max_prefix.max(1), "app");
    format!("{prefix}-{suffix}")
}

/// Compose project for an application; stable across deployments.
#[must_use]
pub fn compose_project(application_name: &str, application_id: &str) -> String {
    let suffix = short_id(application_id);
    let max_prefix = 63_usize.saturating_sub(suffix.len() + 1);
    let prefix = truncate_label(&slug_or(application_name, "app"), max_prefix.max(1), "app");
    format!("{prefix}-{suffix}")
}

/// Swarm service running the live-dev container of an application.
#[must_use]
pub fn dev_service_name(application_id: &str) -> String {
    format!("dev-{}", application_id.replace('-', ""))
}
