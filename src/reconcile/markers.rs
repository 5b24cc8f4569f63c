//! Dedup markers and deterministic naming conventions
//!
//! Re-run recognition is embedded in the migrated artifacts themselves:
//! attachment filenames carry the source attachment id, and comment bodies
//! carry a first-line marker derived from the source comment identity.
//! There is no side index. Everything about those conventions lives here so
//! the format can be changed in one place.

use crate::model::{SourceAttachment, SourceComment, SourceIssue};

/// Longest filename the target accepts. Over-long names are truncated in the
/// stem so the extension and disambiguating id suffix always survive.
pub const MAX_FILENAME_LEN: usize = 255;

/// Attachments at or above this size are never uploaded; a reference
/// comment with a download link stands in for them.
pub const OVERSIZE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Derive the deterministic target filename for a source attachment:
/// `<stem>-<external_id><ext>`, percent-encoded when non-ASCII, capped at
/// [`MAX_FILENAME_LEN`].
///
/// The id suffix makes re-runs recognize prior migrations even if the
/// source content changed, and keeps same-named attachments distinct.
pub fn attachment_filename(original: &str, external_id: &str) -> String {
    let (stem, ext) = split_extension(original);
    let name = format!("{}-{}{}", stem, external_id, ext);

    let encoded = !name.is_ascii();
    let name = if encoded {
        urlencoding::encode(&name).into_owned()
    } else {
        name
    };

    if name.len() <= MAX_FILENAME_LEN {
        return name;
    }

    // Truncate the stem only; the `-{id}{ext}` tail must survive intact.
    // Encoding leaves `-` and digits alone, so the tail's encoded length is
    // computable from its parts.
    let suffix_len = if encoded {
        1 + urlencoding::encode(external_id).len() + urlencoding::encode(ext).len()
    } else {
        1 + external_id.len() + ext.len()
    };
    let (stem, suffix) = name.split_at(name.len() - suffix_len);
    let mut cut = MAX_FILENAME_LEN.saturating_sub(suffix_len).min(stem.len());
    while cut > 0 && !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    // Never end the stem inside a %XX escape
    if let Some(pos) = stem[..cut].rfind('%') {
        if cut - pos < 3 {
            cut = pos;
        }
    }
    format!("{}{}", &stem[..cut], suffix)
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        // A leading dot is a hidden file, not an extension
        Some(0) | None => (filename, ""),
        Some(idx) => (&filename[..idx], &filename[idx..]),
    }
}

/// Render a migrated comment body. The first line is the permalink back to
/// the source comment and ends with the dedup marker; the original author,
/// timestamp and text follow in a quote block.
pub fn render_comment(issue: &SourceIssue, comment: &SourceComment) -> String {
    let marker = comment.identity.marker();
    format!(
        "{}\n\n{{quote}}\n*{} {}*\n\n{}\n{{quote}}\n",
        issue.comment_permalink(&marker),
        comment.author,
        comment.timestamp,
        comment.body
    )
}

/// Whether an existing target comment is the migrated copy of the source
/// comment with this marker. Matches the original convention: the first
/// line of the body ends with `c<identity>`.
pub fn comment_matches_marker(existing_body: &str, marker: &str) -> bool {
    existing_body
        .lines()
        .next()
        .map(|first| first.trim_end().ends_with(marker))
        .unwrap_or(false)
}

/// Marker embedded in an oversized-attachment reference comment
pub fn attachment_ref_marker(external_id: &str) -> String {
    format!("[attachment-id: {}]", external_id)
}

/// Render the reference comment standing in for an attachment too large to
/// upload. The embedded id marker is what re-runs search for.
pub fn render_attachment_reference(attachment: &SourceAttachment) -> String {
    format!(
        "Attachment {} ({} bytes) exceeds the upload limit and was not migrated.\nDownload: {} {}\n",
        attachment.filename,
        attachment.size_bytes,
        attachment.download_url,
        attachment_ref_marker(&attachment.external_id)
    )
}

/// Whether any existing target comment already references this attachment id
pub fn has_attachment_reference(comment_bodies: &[String], external_id: &str) -> bool {
    let marker = attachment_ref_marker(external_id);
    comment_bodies.iter().any(|body| body.contains(&marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttachmentBody, CommentIdentity, SourceKind};

    fn issue() -> SourceIssue {
        SourceIssue {
            kind: SourceKind::BugzillaCgi,
            external_id: "42".to_string(),
            title: "t".to_string(),
            description: String::new(),
            priority: "P1".to_string(),
            status: "NEW".to_string(),
            resolution: None,
            comments: vec![],
            attachments: vec![],
            web_base: "http://bz.example.com".to_string(),
            is_bug: true,
            first_comment_is_description: true,
        }
    }

    #[test]
    fn test_filename_suffixing() {
        assert_eq!(attachment_filename("log.txt", "7"), "log-7.txt");
        assert_eq!(attachment_filename("log.txt", "9"), "log-9.txt");
        assert_eq!(attachment_filename("core", "12"), "core-12");
        assert_eq!(attachment_filename("a.tar.gz", "3"), "a.tar-3.gz");
    }

    #[test]
    fn test_filename_non_ascii_is_percent_encoded() {
        let name = attachment_filename("réport.txt", "5");
        assert!(name.is_ascii());
        assert!(name.contains("%C3%A9"));
        assert!(name.ends_with("-5.txt"));
    }

    #[test]
    fn test_filename_cap_preserves_id_and_extension() {
        let long_stem = "x".repeat(300);
        let name = attachment_filename(&format!("{}.txt", long_stem), "1234");
        assert_eq!(name.len(), MAX_FILENAME_LEN);
        assert!(name.ends_with("-1234.txt"));
    }

    #[test]
    fn test_filename_cap_never_splits_a_percent_escape() {
        let long_stem = "\u{e9}".repeat(60);
        let name = attachment_filename(&format!("{}.txt", long_stem), "12");
        assert!(name.len() <= MAX_FILENAME_LEN);
        assert!(name.ends_with("-12.txt"));
        // Every escape in the truncated name is still a full %XX triplet
        assert!(urlencoding::decode(&name).is_ok());
        assert!(!name.trim_end_matches("-12.txt").ends_with("%C3"));
    }

    #[test]
    fn test_filename_under_cap_untouched() {
        let name = attachment_filename("short.bin", "88");
        assert_eq!(name, "short-88.bin");
    }

    #[test]
    fn test_comment_render_and_match() {
        let c = SourceComment {
            identity: CommentIdentity::Sequence(3),
            author: "alice".to_string(),
            timestamp: "2014-02-01 10:00".to_string(),
            body: "it crashes".to_string(),
        };
        let body = render_comment(&issue(), &c);
        assert!(body.starts_with("http://bz.example.com/show_bug.cgi?id=42#c3\n"));
        assert!(body.contains("*alice 2014-02-01 10:00*"));
        assert!(body.contains("{quote}"));

        assert!(comment_matches_marker(&body, "c3"));
        assert!(!comment_matches_marker(&body, "c4"));
        assert!(!comment_matches_marker("no marker here\n\nbody", "c3"));
    }

    #[test]
    fn test_attachment_reference_roundtrip() {
        let a = SourceAttachment {
            external_id: "991".to_string(),
            filename: "huge.iso".to_string(),
            size_bytes: 20 * 1024 * 1024,
            download_url: "http://bz.example.com/attachment.cgi?id=991".to_string(),
            body: AttachmentBody::Inline(vec![]),
        };
        let body = render_attachment_reference(&a);
        assert!(body.contains("[attachment-id: 991]"));
        assert!(body.contains("attachment.cgi?id=991"));

        assert!(has_attachment_reference(&[body], "991"));
        assert!(!has_attachment_reference(&["other".to_string()], "991"));
    }
}
