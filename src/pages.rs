//! HTML pages for `/` and `/{feed}`.
//!
//! Templates are read from the template directory on every request so they
//! can be edited without a restart. `[feeds]` and `[name]` are the only
//! placeholders.

use serde::Serialize;
use std::path::Path;

use crate::config::FeedConfig;

pub const INDEX_TEMPLATE: &str = "Index.html";
pub const FEED_TEMPLATE: &str = "Feed.html";

const BUILTIN_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Camera HTTP Server</title></head>
<body>
<h1>Cameras</h1>
<ul id="feeds"></ul>
<script>
var feeds = [feeds];
var list = document.getElementById("feeds");
feeds.forEach(function (feed) {
  var item = document.createElement("li");
  var link = document.createElement("a");
  link.href = "/" + encodeURIComponent(feed.Name);
  link.textContent = feed.Name;
  item.appendChild(link);
  if (feed.SnapshotSecondsInterval > 0) {
    var img = document.createElement("img");
    img.src = link.href + "/snapshot";
    img.width = 320;
    item.appendChild(document.createElement("br"));
    item.appendChild(img);
  }
  list.appendChild(item);
});
</script>
</body>
</html>
"#;

const BUILTIN_FEED: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>[name]</title></head>
<body>
<h1>[name]</h1>
<img src="/[name]/mjpeg" alt="[name]">
<p><a href="/">All cameras</a></p>
</body>
</html>
"#;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FeedSummary<'a> {
    name: &'a str,
    snapshot_seconds_interval: f64,
}

fn template(dir: &Path, file: &str, builtin: &str) -> String {
    let path = dir.join(file);
    match std::fs::read_to_string(&path) {
        Ok(page) => page,
        Err(err) => {
            log::debug!("using built-in page, {} unavailable: {}", path.display(), err);
            builtin.to_string()
        }
    }
}

/// JSON array of `{"Name", "SnapshotSecondsInterval"}` for every feed.
pub fn feeds_json(feeds: &[FeedConfig]) -> String {
    let summaries: Vec<FeedSummary<'_>> = feeds
        .iter()
        .map(|feed| FeedSummary {
            name: &feed.name,
            snapshot_seconds_interval: feed
                .snapshot_interval
                .map(|interval| interval.as_secs_f64())
                .unwrap_or(0.0),
        })
        .collect();
    serde_json::to_string(&summaries).unwrap_or_else(|_| "[]".to_string())
}

pub fn render_index(template_dir: &Path, feeds: &[FeedConfig]) -> String {
    template(template_dir, INDEX_TEMPLATE, BUILTIN_INDEX).replace("[feeds]", &feeds_json(feeds))
}

pub fn render_feed(template_dir: &Path, name: &str) -> String {
    template(template_dir, FEED_TEMPLATE, BUILTIN_FEED).replace("[name]", name)
}
