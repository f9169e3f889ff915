//! Tag classification: derives `tag_mask`, `tag_main`, `tag_sub` and an optional
//! minion id from the `prefix/main/.../sub[/minion_id]` tag shapes emitted on
//! the event bus.

/// Closed-enumeration classification buckets. New tag shapes extend this list;
/// anything that doesn't match a known shape falls back to its own leading
/// path segment as `tag_main` with an empty `tag_sub`.
pub mod well_known {
    pub const SALT_JOB: &str = "job";
    pub const SALT_JOB_NEW: &str = "new";
    pub const SALT_JOB_RET: &str = "ret";
    pub const SALT_JOB_PROG: &str = "prog";
    pub const SALT_BATCH: &str = "batch";
    pub const SALT_BATCH_START: &str = "batch_start";
    pub const SALT_BATCH_DONE: &str = "batch_done";
    pub const SALT_KEY: &str = "key";
    pub const SALT_STATS: &str = "stats";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub tag_mask: String,
    pub tag_main: String,
    pub tag_sub: String,
    pub minion_id: Option<String>,
}

/// Classify a tag into `(tag_mask, tag_main, tag_sub, minion_id)`.
///
/// Only the `ret` job shape and the bare minion-targeted shapes carry a
/// minion id; other shapes never populate `minion_id` even when a trailing
/// path segment happens to look like one (see job/new in the test below —
/// the source never encodes a minion id in that shape, a stray trailing
/// segment is just part of an irregular tag and must not be misread as one).
pub fn get_tag_mask(tag: &str) -> TagInfo {
    use well_known::*;

    let segments: Vec<&str> = tag.split('/').collect();

    if segments.len() >= 4 && segments[0] == "salt" && segments[1] == SALT_JOB {
        let sub = segments[3];
        let (tag_sub, minion_id, mask_suffix): (String, Option<String>, &str) = match sub {
            SALT_JOB_NEW => (SALT_JOB_NEW.to_string(), None, "/new"),
            SALT_JOB_RET => {
                let id = segments.get(4).map(|s| s.to_string());
                let suffix = if id.is_some() { "/ret/{id}" } else { "/ret" };
                (SALT_JOB_RET.to_string(), id, suffix)
            }
            SALT_JOB_PROG => {
                let id = segments.get(4).map(|s| s.to_string());
                let suffix = if id.is_some() { "/prog/{id}" } else { "/prog" };
                (SALT_JOB_PROG.to_string(), id, suffix)
            }
            other => (other.to_string(), None, ""),
        };
        return TagInfo {
            tag_mask: format!("salt/job/{{jid}}{}", mask_suffix),
            tag_main: SALT_JOB.to_string(),
            tag_sub,
            minion_id,
        };
    }

    if segments.len() >= 4 && segments[0] == "salt" && segments[1] == SALT_BATCH {
        let tag_sub = match segments[3] {
            "start" => SALT_BATCH_START,
            "done" => SALT_BATCH_DONE,
            other => other,
        };
        return TagInfo {
            tag_mask: format!("salt/batch/{{jid}}/{}", tag_sub),
            tag_main: SALT_BATCH.to_string(),
            tag_sub: tag_sub.to_string(),
            minion_id: None,
        };
    }

    if segments.len() >= 2 && segments[0] == "salt" && segments[1] == SALT_KEY {
        return TagInfo {
            tag_mask: "salt/key".to_string(),
            tag_main: SALT_KEY.to_string(),
            tag_sub: String::new(),
            minion_id: None,
        };
    }

    if segments.len() >= 2 && segments[0] == "salt" && segments[1] == SALT_STATS {
        return TagInfo {
            tag_mask: "salt/stats".to_string(),
            tag_main: SALT_STATS.to_string(),
            tag_sub: String::new(),
            minion_id: None,
        };
    }

    // Unrecognized shape: fall back to the first segment as tag_main so callers
    // still get a stable (if coarse) classification instead of an error.
    let tag_main = segments.get(1).or(segments.first()).unwrap_or(&"").to_string();
    TagInfo {
        tag_mask: tag.to_string(),
        tag_main,
        tag_sub: String::new(),
        minion_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_new_does_not_extract_minion_id_from_trailing_segment() {
        let info = get_tag_mask("salt/job/20240101000000/new/minion-a");
        assert_eq!(info.tag_main, "job");
        assert_eq!(info.tag_sub, "new");
        assert_eq!(info.minion_id, None);
    }

    #[test]
    fn job_ret_extracts_minion_id() {
        let info = get_tag_mask("salt/job/20240101000000/ret/minion-a");
        assert_eq!(info.tag_main, "job");
        assert_eq!(info.tag_sub, "ret");
        assert_eq!(info.minion_id, Some("minion-a".to_string()));
        assert_eq!(info.tag_mask, "salt/job/{jid}/ret/{id}");
    }

    #[test]
    fn batch_start_and_done() {
        let start = get_tag_mask("salt/batch/20240101000000/start");
        assert_eq!(start.tag_main, "batch");
        assert_eq!(start.tag_sub, "batch_start");

        let done = get_tag_mask("salt/batch/20240101000000/done");
        assert_eq!(done.tag_sub, "batch_done");
    }

    #[test]
    fn key_and_stats_have_no_sub() {
        assert_eq!(get_tag_mask("salt/key").tag_main, "key");
        assert_eq!(get_tag_mask("salt/stats").tag_main, "stats");
    }

    #[test]
    fn unrecognized_shape_falls_back_to_second_segment() {
        let info = get_tag_mask("minion/refresh/minion-a");
        assert_eq!(info.tag_main, "refresh");
        assert_eq!(info.tag_sub, "");
        assert_eq!(info.minion_id, None);
    }
}
