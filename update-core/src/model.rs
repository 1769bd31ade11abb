use chrono::{DateTime, Utc};
use reqwest::Url;

/// A parsed release feed. Entries keep the order they had in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFeed {
  pub title: String,
  pub description: Option<String>,
  pub link: Option<Url>,
  pub updated: DateTime<Utc>,
  pub entries: Vec<Entry>,
}

impl ReleaseFeed {
  pub fn entries_in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
    self
      .entries
      .iter()
      .filter(move |e| e.category.eq_ignore_ascii_case(category))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  pub title: String,
  pub link: Url,
  pub id: String,
  pub updated: DateTime<Utc>,
  pub published: DateTime<Utc>,
  pub author: Author,
  pub summary: String,
  pub asset_link: Url,
  pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
  pub name: String,
  pub uri: Url,
}
