use crate::error::{Result, UpdateError};
use crate::model::{Author, Entry, ReleaseFeed};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event as XEvent};
use quick_xml::Reader;
use reqwest::Url;
use std::io::BufRead;

pub mod fetch;

pub use fetch::{FeedResponse, FeedTransport, HttpFeedTransport};

const FEED_TITLE_FALLBACK: &str = "Unknown";

pub fn parse_feed_bytes(bytes: &[u8]) -> Result<ReleaseFeed> {
  parse_feed(bytes)
}

/// Streams an Atom-style release feed into a [`ReleaseFeed`].
///
/// Entries missing any required field (or carrying an unparseable URI or
/// timestamp) are dropped without error. Feed-level fields fall back to
/// defaults when absent.
pub fn parse_feed<R: BufRead>(input: R) -> Result<ReleaseFeed> {
  let mut rdr = Reader::from_reader(input);
  rdr.trim_text(false);
  let mut buf = Vec::new();

  let mut feed = FeedFields::default();
  let mut entry = EntryFields::default();
  let mut entries = Vec::new();

  let mut current: Option<String> = None;
  let mut in_entry = false;
  let mut in_author = false;
  let mut depth: usize = 0;
  let mut saw_root = false;
  let mut dropped = 0usize;

  loop {
    let ev = rdr
      .read_event_into(&mut buf)
      .map_err(|e| UpdateError::Parse(e.to_string()))?;

    match ev {
      XEvent::Start(e) => {
        saw_root = true;
        depth += 1;
        let name = local_name(&e);
        open_element(&name, &e, in_entry, &mut feed, &mut entry);
        match name.as_str() {
          "entry" => in_entry = true,
          "author" if in_entry => in_author = true,
          _ => {}
        }
        current = Some(name);
      }
      XEvent::Empty(e) => {
        saw_root = true;
        let name = local_name(&e);
        open_element(&name, &e, in_entry, &mut feed, &mut entry);
        if name == "entry" {
          // `<entry/>` has nothing to materialize.
          dropped += 1;
        }
      }
      XEvent::Text(t) => {
        let text = t
          .unescape()
          .map_err(|e| UpdateError::Parse(e.to_string()))?;
        append_text(current.as_deref(), &text, in_entry, in_author, &mut feed, &mut entry);
      }
      XEvent::CData(c) => {
        let text = String::from_utf8_lossy(&c).into_owned();
        append_text(current.as_deref(), &text, in_entry, in_author, &mut feed, &mut entry);
      }
      XEvent::End(e) => {
        depth = depth.saturating_sub(1);
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        match name.as_str() {
          "entry" => {
            in_entry = false;
            in_author = false;
            match std::mem::take(&mut entry).build() {
              Some(built) => entries.push(built),
              None => dropped += 1,
            }
          }
          "author" => in_author = false,
          _ => {}
        }
        current = None;
      }
      XEvent::Eof => break,
      _ => {}
    }
    buf.clear();
  }

  if !saw_root {
    return Err(UpdateError::Parse("document has no root element".to_string()));
  }
  if depth > 0 {
    return Err(UpdateError::Parse("unexpected end of document".to_string()));
  }
  if dropped > 0 {
    tracing::debug!(dropped, kept = entries.len(), "dropped incomplete feed entries");
  }

  Ok(feed.build(entries))
}

fn local_name(e: &BytesStart<'_>) -> String {
  String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
  e.attributes()
    .flatten()
    .find(|a| a.key.local_name().as_ref() == key)
    .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn open_element(
  name: &str,
  e: &BytesStart<'_>,
  in_entry: bool,
  feed: &mut FeedFields,
  entry: &mut EntryFields,
) {
  if name == "entry" {
    *entry = EntryFields::default();
    return;
  }

  if !in_entry {
    if name == "link" && feed.link.is_none() {
      let rel = attr(e, b"rel");
      if rel.as_deref().map_or(true, |r| r == "alternate" || r == "self") {
        feed.link = attr(e, b"href");
      }
    }
    return;
  }

  match name {
    "link" => {
      let href = attr(e, b"href");
      if attr(e, b"rel").as_deref() == Some("enclosure") {
        if entry.asset_link.is_empty() {
          entry.asset_link = href.unwrap_or_default();
        }
      } else if entry.link.is_empty() {
        entry.link = href.unwrap_or_default();
      }
    }
    "author" => {
      if let Some(uri) = attr(e, b"uri") {
        entry.author_uri = uri;
      }
    }
    "category" => {
      if let Some(term) = attr(e, b"term") {
        entry.category = term;
      }
    }
    _ => {}
  }
}

fn append_text(
  current: Option<&str>,
  text: &str,
  in_entry: bool,
  in_author: bool,
  feed: &mut FeedFields,
  entry: &mut EntryFields,
) {
  if text.trim().is_empty() {
    return;
  }
  let Some(current) = current else {
    return;
  };

  if !in_entry {
    let slot = match current {
      "title" => &mut feed.title,
      "subtitle" | "description" => &mut feed.description,
      "updated" => &mut feed.updated,
      _ => return,
    };
    slot.push_str(text);
    return;
  }

  let slot = match current {
    "title" => &mut entry.title,
    "summary" => &mut entry.summary,
    "updated" => &mut entry.updated,
    "published" => &mut entry.published,
    "id" => &mut entry.id,
    "name" if in_author => &mut entry.author_name,
    "uri" if in_author => &mut entry.author_uri,
    "assetLink" => &mut entry.asset_link,
    "category" => &mut entry.category,
    _ => return,
  };
  slot.push_str(text);
}

#[derive(Debug, Default)]
struct FeedFields {
  title: String,
  description: String,
  link: Option<String>,
  updated: String,
}

impl FeedFields {
  fn build(self, entries: Vec<Entry>) -> ReleaseFeed {
    let title = self.title.trim();
    let description = self.description.trim();
    ReleaseFeed {
      title: if title.is_empty() {
        FEED_TITLE_FALLBACK.to_string()
      } else {
        title.to_string()
      },
      description: (!description.is_empty()).then(|| description.to_string()),
      link: self.link.as_deref().and_then(|l| Url::parse(l.trim()).ok()),
      updated: parse_timestamp(&self.updated).unwrap_or_else(Utc::now),
      entries,
    }
  }
}

#[derive(Debug, Default)]
struct EntryFields {
  title: String,
  link: String,
  id: String,
  updated: String,
  published: String,
  author_name: String,
  author_uri: String,
  summary: String,
  asset_link: String,
  category: String,
}

impl EntryFields {
  fn build(self) -> Option<Entry> {
    let title = required(&self.title)?;
    let id = required(&self.id)?;
    let category = required(&self.category)?;
    let author_name = required(&self.author_name)?;
    let link = Url::parse(required(&self.link)?).ok()?;
    let asset_link = Url::parse(required(&self.asset_link)?).ok()?;
    let author_uri = Url::parse(required(&self.author_uri)?).ok()?;
    let updated = parse_timestamp(&self.updated)?;
    let published = match required(&self.published) {
      Some(raw) => parse_timestamp(raw)?,
      None => updated,
    };

    Some(Entry {
      title: title.to_string(),
      link,
      id: id.to_string(),
      updated,
      published,
      author: Author {
        name: author_name.to_string(),
        uri: author_uri,
      },
      summary: self.summary.trim().to_string(),
      asset_link,
      category: category.to_string(),
    })
  }
}

fn required(raw: &str) -> Option<&str> {
  let t = raw.trim();
  (!t.is_empty()).then_some(t)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(raw.trim())
    .ok()
    .map(|t| t.with_timezone(&Utc))
}
