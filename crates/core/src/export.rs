//! Review report export.
//!
//! [`build_report`] is a pure function of an annotation snapshot: it orders
//! entries by order key, nests replies under their parents, groups threads
//! into timestamp buckets and drops tombstones that nobody replied to.
//! Tombstones with surviving replies stay in the report as a "deleted" marker
//! so the thread still reads correctly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::annotation::{Annotation, AnnotationStatus};
use crate::types::{AnnotationId, IdentityId, OrderKey, Timestamp, VideoId};
use crate::video::format_timecode;

/// Default bucket width (10 seconds of media time).
pub const DEFAULT_BUCKET_MS: i64 = 10_000;

/// Rendering options for a report.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub bucket_ms: i64,
    /// Frame rate for `HH:MM:SS:FF` timecodes, when known.
    pub frame_rate: Option<f64>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            bucket_ms: DEFAULT_BUCKET_MS,
            frame_rate: None,
        }
    }
}

/// Structured review report for one video.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub video_id: VideoId,
    pub generated_at: Timestamp,
    /// Number of entries rendered, deleted markers included.
    pub annotation_count: usize,
    pub buckets: Vec<ReportBucket>,
}

/// Threads whose root falls in `[start_ms, end_ms)`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportBucket {
    pub start_ms: i64,
    pub end_ms: i64,
    pub label: String,
    pub threads: Vec<ReportEntry>,
}

/// One rendered annotation and its replies.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub order_key: OrderKey,
    pub annotation_id: AnnotationId,
    pub author_id: IdentityId,
    pub timestamp_ms: i64,
    pub timecode: String,
    /// `None` for deleted markers.
    pub body: Option<String>,
    pub status: AnnotationStatus,
    pub edited: bool,
    pub deleted: bool,
    pub position_unverified: bool,
    pub created_at: Timestamp,
    pub replies: Vec<ReportEntry>,
}

/// Build a report from a snapshot.
///
/// The snapshot may arrive in any order. Replies whose parent is not part of
/// the snapshot are rendered as thread roots.
pub fn build_report(
    video_id: &str,
    snapshot: &[Annotation],
    options: &ReportOptions,
    generated_at: Timestamp,
) -> ExportReport {
    let bucket_ms = options.bucket_ms.max(1);

    let mut ordered: Vec<&Annotation> = snapshot.iter().collect();
    ordered.sort_by_key(|a| a.order_key);

    let known: HashSet<AnnotationId> = ordered.iter().map(|a| a.id).collect();
    let mut children: HashMap<AnnotationId, Vec<&Annotation>> = HashMap::new();
    let mut roots: Vec<&Annotation> = Vec::new();
    for &annotation in &ordered {
        match annotation.parent_id {
            Some(parent) if known.contains(&parent) => {
                children.entry(parent).or_default().push(annotation)
            }
            _ => roots.push(annotation),
        }
    }

    let mut annotation_count = 0;
    let mut by_bucket: BTreeMap<i64, Vec<ReportEntry>> = BTreeMap::new();
    for root in roots {
        if let Some(entry) = render_entry(root, &children, options, &mut annotation_count) {
            let start = root.timestamp_ms.div_euclid(bucket_ms) * bucket_ms;
            by_bucket.entry(start).or_default().push(entry);
        }
    }

    let buckets = by_bucket
        .into_iter()
        .map(|(start_ms, threads)| {
            let end_ms = start_ms + bucket_ms;
            ReportBucket {
                start_ms,
                end_ms,
                label: format!(
                    "{} - {}",
                    format_timecode(start_ms, options.frame_rate),
                    format_timecode(end_ms, options.frame_rate)
                ),
                threads,
            }
        })
        .collect();

    ExportReport {
        video_id: video_id.to_string(),
        generated_at,
        annotation_count,
        buckets,
    }
}

/// Render one annotation and its kept descendants. Returns `None` for a
/// tombstone with nothing beneath it.
fn render_entry(
    annotation: &Annotation,
    children: &HashMap<AnnotationId, Vec<&Annotation>>,
    options: &ReportOptions,
    count: &mut usize,
) -> Option<ReportEntry> {
    let replies: Vec<ReportEntry> = children
        .get(&annotation.id)
        .map(|kids| {
            kids.iter()
                .filter_map(|kid| render_entry(kid, children, options, count))
                .collect()
        })
        .unwrap_or_default();

    let deleted = annotation.is_deleted();
    if deleted && replies.is_empty() {
        return None;
    }

    *count += 1;
    Some(ReportEntry {
        order_key: annotation.order_key,
        annotation_id: annotation.id,
        author_id: annotation.author_id.clone(),
        timestamp_ms: annotation.timestamp_ms,
        timecode: format_timecode(annotation.timestamp_ms, options.frame_rate),
        body: (!deleted).then(|| annotation.body.clone()),
        status: annotation.status,
        edited: annotation.status == AnnotationStatus::Edited,
        deleted,
        position_unverified: annotation.position_unverified,
        created_at: annotation.created_at,
        replies,
    })
}

/// Render a report as Markdown for sharing outside the app.
pub fn render_markdown(report: &ExportReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Review report: {}", report.video_id);
    let _ = writeln!(
        out,
        "\n_{} annotations, generated {}_",
        report.annotation_count,
        report.generated_at.to_rfc3339()
    );

    for bucket in &report.buckets {
        let _ = writeln!(out, "\n## {}\n", bucket.label);
        for thread in &bucket.threads {
            write_entry(&mut out, thread, 0);
        }
    }
    out
}

fn write_entry(out: &mut String, entry: &ReportEntry, depth: usize) {
    let indent = "  ".repeat(depth);
    let body = match &entry.body {
        Some(body) => body.replace('\n', " "),
        None => "_[deleted]_".to_string(),
    };
    let mut flags = String::new();
    if entry.edited {
        flags.push_str(" (edited)");
    }
    if entry.position_unverified {
        flags.push_str(" (position unverified)");
    }
    let _ = writeln!(
        out,
        "{indent}- **#{}** `{}` {}: {}{}",
        entry.order_key, entry.timecode, entry.author_id, body, flags
    );
    for reply in &entry.replies {
        write_entry(out, reply, depth + 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
