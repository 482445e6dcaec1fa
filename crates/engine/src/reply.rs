#![forbid(unsafe_code)]

use cx_core::JobStatus;
use cx_storage::JobRow;

pub const FALLBACK_PERSONA_NAME: &str = "the selected persona";

#[derive(Clone, Debug)]
pub struct ReplyFormat {
    /// Base of the public API; used for a watch link when no media is attached.
    pub public_base_url: Option<String>,
    pub max_chars: usize,
}

impl Default for ReplyFormat {
    fn default() -> Self {
        Self {
            public_base_url: None,
            max_chars: 280,
        }
    }
}

/// Text of the outbound reply for a finished job.
pub fn compose_reply(
    job: &JobRow,
    persona_name: Option<&str>,
    media_attached: bool,
    format: &ReplyFormat,
) -> String {
    let name = persona_name.unwrap_or(FALLBACK_PERSONA_NAME);
    match job.status {
        JobStatus::Completed => {
            let link = match format.public_base_url.as_deref() {
                Some(base) if !media_attached => format!(
                    " Watch it here: {}/api/jobs/{}/video",
                    base.trim_end_matches('/'),
                    job.id
                ),
                _ => String::new(),
            };
            fit_query(
                |query| format!("Here's {name} explaining '{query}'!{link}"),
                &job.query,
                format.max_chars,
            )
        }
        _ => {
            let error = job.error.as_deref().unwrap_or("unknown error");
            fit_query(
                |query| {
                    format!(
                        "Sorry, I couldn't generate the explanation for '{query}' by {name}. \
                         Error: {error}"
                    )
                },
                &job.query,
                format.max_chars,
            )
        }
    }
}

/// Shortens only the quoted query when the rest of the reply fits, so a
/// trailing link stays intact.
fn fit_query(render: impl Fn(&str) -> String, query: &str, max_chars: usize) -> String {
    let full = render(query);
    if full.chars().count() <= max_chars {
        return full;
    }
    let frame = render("").chars().count();
    if frame < max_chars {
        return render(&truncate_chars(query.to_string(), max_chars - frame));
    }
    truncate_chars(full, max_chars)
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cx_core::{ArtifactRef, JobId, OriginRef, PersonaId};

    fn job(status: JobStatus, query: &str, error: Option<&str>) -> JobRow {
        JobRow {
            id: JobId::try_new("J1").expect("job id"),
            revision: 3,
            persona_id: PersonaId::try_new("P1").expect("persona id"),
            query: query.to_string(),
            status,
            origin: Some(OriginRef::try_new("tweet:42", None).expect("origin")),
            result_ref: (status == JobStatus::Completed).then(|| ArtifactRef::new("final.mp4")),
            error: error.map(str::to_string),
            reply_posted: false,
            reply_posted_at_ms: None,
            reply_receipt: None,
            created_at_ms: 1,
            updated_at_ms: 2,
            completed_at_ms: Some(2),
        }
    }

    #[test]
    fn completed_reply_names_persona_and_query() {
        let text = compose_reply(
            &job(JobStatus::Completed, "black holes", None),
            Some("Albert Einstein"),
            true,
            &ReplyFormat::default(),
        );
        assert_eq!(text, "Here's Albert Einstein explaining 'black holes'!");
    }

    #[test]
    fn completed_reply_links_video_when_media_is_missing() {
        let format = ReplyFormat {
            public_base_url: Some("https://cx.example/".to_string()),
            max_chars: 280,
        };
        let text = compose_reply(
            &job(JobStatus::Completed, "black holes", None),
            None,
            false,
            &format,
        );
        assert_eq!(
            text,
            "Here's the selected persona explaining 'black holes'! \
             Watch it here: https://cx.example/api/jobs/J1/video"
        );
    }

    #[test]
    fn error_reply_carries_the_failure() {
        let text = compose_reply(
            &job(
                JobStatus::Error,
                "black holes",
                Some("produce visuals failed: visual planning failed: empty"),
            ),
            Some("Albert Einstein"),
            false,
            &ReplyFormat::default(),
        );
        assert_eq!(
            text,
            "Sorry, I couldn't generate the explanation for 'black holes' by Albert Einstein. \
             Error: produce visuals failed: visual planning failed: empty"
        );
    }

    #[test]
    fn long_replies_are_cut_on_char_boundaries() {
        let query = "é".repeat(400);
        let text = compose_reply(
            &job(JobStatus::Completed, &query, None),
            Some("Marie Curie"),
            true,
            &ReplyFormat::default(),
        );
        assert_eq!(text.chars().count(), 280);
        assert!(text.ends_with("…'!"), "{text}");
    }

    #[test]
    fn long_query_is_shortened_before_the_watch_link() {
        let format = ReplyFormat {
            public_base_url: Some("https://cx.example".to_string()),
            max_chars: 280,
        };
        let query = "why ".repeat(100);
        let text = compose_reply(
            &job(JobStatus::Completed, &query, None),
            Some("Marie Curie"),
            false,
            &format,
        );
        assert_eq!(text.chars().count(), 280);
        assert!(text.starts_with("Here's Marie Curie explaining 'why why"), "{text}");
        assert!(text.contains("…'!"), "{text}");
        assert!(
            text.ends_with(" Watch it here: https://cx.example/api/jobs/J1/video"),
            "{text}"
        );
    }
}
