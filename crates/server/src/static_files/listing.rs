//! Generated HTML directory listings

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fileserve_config::CompressedSuffixes;
use std::path::Path;
use tracing::debug;

use super::entry::truncate_to_secs;
use super::vfs::{FileMeta, FileSystem};
use crate::error::ServeError;

/// Content type of generated listings
pub const LISTING_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Render the listing of `dir` as seen at `request_path`.
///
/// Compressed siblings are hidden and children whose metadata cannot be
/// read are skipped. Rows are sorted by name.
pub async fn render_directory_index(
    fs: &dyn FileSystem,
    dir: &Path,
    request_path: &str,
    suffixes: &CompressedSuffixes,
) -> Result<Bytes, ServeError> {
    let entries = fs
        .read_dir(dir)
        .await
        .map_err(|e| ServeError::open(dir, e))?;

    let mut rows: Vec<(String, FileMeta)> = Vec::with_capacity(entries.len());
    for entry in entries {
        if suffixes.iter().any(|suffix| entry.name.ends_with(suffix)) {
            continue;
        }
        match entry.metadata {
            Ok(meta) => rows.push((entry.name, meta)),
            Err(e) => {
                debug!(dir = %dir.display(), name = %entry.name, error = %e, "Skipping unreadable entry");
            }
        }
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(Bytes::from(render_html(request_path, &rows)))
}

fn render_html(request_path: &str, rows: &[(String, FileMeta)]) -> String {
    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{}/", request_path)
    };
    let title = html_escape::encode_text(&base);

    let mut html = String::with_capacity(256 + rows.len() * 128);
    html.push_str(&format!(
        "<html><head><title>{title}</title><style>.dir {{ font-weight: bold }}</style></head><body><h1>{title}</h1><ul>"
    ));

    if base != "/" {
        html.push_str(&format!(
            r#"<li><a href="{}" class="dir">..</a></li>"#,
            html_escape::encode_double_quoted_attribute(&encode_path(parent_of(&base)))
        ));
    }

    let encoded_base = encode_path(&base);
    for (name, meta) in rows {
        let href = format!("{}{}", encoded_base, urlencoding::encode(name));
        let (class, aux) = if meta.is_dir {
            ("dir", "dir".to_string())
        } else {
            ("file", format!("file, {} bytes", meta.len))
        };
        let modified = DateTime::<Utc>::from(truncate_to_secs(meta.modified))
            .format("%Y-%m-%d %H:%M:%S +0000 UTC");
        html.push_str(&format!(
            r#"<li><a href="{}" class="{}">{}</a>, {}, last modified {}</li>"#,
            html_escape::encode_double_quoted_attribute(&href),
            class,
            html_escape::encode_text(name),
            aux,
            modified
        ));
    }

    html.push_str("</ul></body></html>");
    html
}

/// `/a/b/` becomes `/a/`
fn parent_of(base: &str) -> &str {
    let trimmed = base.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[..=pos],
        None => "/",
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
