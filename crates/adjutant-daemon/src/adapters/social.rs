//! Social-post adapter: publishes approved posts per platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use adjutant_core::error::Failure;
use adjutant_core::vault::{ActionNote, Stem};
use async_trait::async_trait;
use tracing::info;

use super::transport::{Delivery, Transport};
use super::{Adapter, DispatchContext, Outcome, Route};

const PLATFORMS: &[&str] = &["LINKEDIN", "TWITTER", "FACEBOOK", "INSTAGRAM"];
const SOCIAL_TYPES: &[&str] = &[
    "social_post_approval",
    "social_post_request",
    "post_request",
    "cloud_draft_social",
    "linkedin_message",
];

/// Publishes approved social posts. Channel: `social_post`.
pub struct SocialAdapter {
    transport: Arc<dyn Transport>,
}

impl SocialAdapter {
    /// Create the adapter over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn platform_for(route_stem: &str, note: &ActionNote) -> String {
        if let Some(platform) = note.preamble.get("platform") {
            return platform.to_ascii_lowercase();
        }
        PLATFORMS
            .iter()
            .find(|platform| route_stem.contains(*platform))
            .map_or_else(|| "social".to_string(), |p| p.to_ascii_lowercase())
    }
}

#[async_trait]
impl Adapter for SocialAdapter {
    fn name(&self) -> &'static str {
        "social"
    }

    fn channel(&self) -> Option<&'static str> {
        Some("social_post")
    }

    fn matches(&self, route: &Route) -> bool {
        let stem = route.inner_stem();
        PLATFORMS.iter().any(|p| stem.starts_with(p))
            || stem.starts_with("SOCIAL_")
            || route.action.starts_with("post_to_")
            || route.action == "social_post"
            || SOCIAL_TYPES.contains(&route.note_type.as_str())
    }

    async fn dispatch(
        &self,
        _ctx: &DispatchContext,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<Outcome, Failure> {
        let platform = Self::platform_for(&stem.as_str().to_ascii_uppercase(), note);
        let content = note
            .preamble
            .get_any(&["content", "text", "post", "message", "caption"])
            .map_or_else(|| content_section(&note.body), str::to_string);
        if content.is_empty() {
            return Ok(Outcome::Rejected {
                reason: "no post content found".to_string(),
            });
        }

        let mut fields = BTreeMap::new();
        fields.insert("platform".to_string(), platform.clone());
        let delivery = Delivery {
            channel: "social_post",
            stem: stem.as_str().to_string(),
            action: format!("post_to_{platform}"),
            fields,
            body: content,
        };
        self.transport.deliver(&delivery).await?;
        info!(stem = %stem, platform, "social post dispatched");
        Ok(Outcome::Sent)
    }
}

/// The `## Drafted Content` / `## Content` section when present, otherwise
/// the whole body.
fn content_section(body: &str) -> String {
    for heading in ["## Drafted Content", "## Content", "## Post"] {
        if let Some(start) = body.find(heading) {
            let after = &body[start + heading.len()..];
            let end = after.find("\n## ").unwrap_or(after.len());
            return after[..end].trim().to_string();
        }
    }
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::vault::Preamble;
    use chrono::Utc;

    #[test]
    fn test_platform_detection() {
        let note = ActionNote::new(Preamble::new("social_post_approval", "", Utc::now()), "");
        assert_eq!(
            SocialAdapter::platform_for("LINKEDIN_POST_X_20260101000000", &note),
            "linkedin"
        );

        let note = note.with_field("platform", "Twitter");
        assert_eq!(
            SocialAdapter::platform_for("SOCIAL_X_20260101000000", &note),
            "twitter"
        );
    }

    #[test]
    fn test_content_section() {
        let body = "# Post\n\n## Drafted Content\n\nBig news!\n\n## Instructions\n\nmove it";
        assert_eq!(content_section(body), "Big news!");
    }
}
