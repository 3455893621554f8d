/// Type definitions for the nideriji wire format and the export data model.
///
/// Wire shapes (all responses are JSON, all requests are form-encoded):
///
/// - `POST /api/login/`                   – [`LoginResponse`]
/// - `POST /api/v2/sync/`                 – [`SyncResponse`]
/// - `POST /api/diary/all_by_ids/{user}/` – [`DiariesResponse`]
/// - `GET  /api/image/{user}/{image}/`    – raw image bytes
///
/// The service is loose about numeric ids: the same field may arrive as a JSON
/// number or as a string, so the id types below accept both.
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RecordError;

// ---------------------------------------------------------------------------
// Primitive / ID types
// ---------------------------------------------------------------------------

/// Server-side diary id. Opaque, unique per author.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DiaryId(String);

impl DiaryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for DiaryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(NumOrStr::deserialize(deserializer)?.into_string()))
    }
}

/// Numeric account id. Its decimal rendering is also the privacy key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        match NumOrStr::deserialize(deserializer)? {
            NumOrStr::Num(n) => Ok(Self(n)),
            NumOrStr::Str(s) => s
                .trim()
                .parse()
                .map(Self)
                .map_err(|_| D::Error::custom(format!("invalid user id {:?}", s))),
        }
    }
}

/// Image id as written in `[图N]` placeholders and used in image URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ImageId(pub u64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ImageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        UserId::deserialize(deserializer).map(|u| Self(u.0))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

impl NumOrStr {
    fn into_string(self) -> String {
        match self {
            NumOrStr::Num(n) => n.to_string(),
            NumOrStr::Str(s) => s,
        }
    }
}

/// Accepts `null`, a string, or a number and yields a string.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Str(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        None => String::new(),
        Some(Loose::Str(s)) => s,
        Some(Loose::Int(i)) => i.to_string(),
        Some(Loose::Float(f)) => f.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Whose diaries a run exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Myself,
    Partner,
}

impl Scope {
    /// Top-level folder name under the output directory.
    pub fn folder_name(self) -> &'static str {
        match self {
            Scope::Myself => "myself",
            Scope::Partner => "partner",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub error: i64,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub userid: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub error: i64,
    #[serde(default)]
    pub diaries: Vec<WireSummary>,
    #[serde(default)]
    pub diaries_paired: Vec<WireSummary>,
    #[serde(default)]
    pub images: Vec<WireImage>,
    #[serde(default)]
    pub images_paired: Vec<WireImage>,
    #[serde(default)]
    pub user_config: Option<WireUserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireUserConfig {
    #[serde(default)]
    pub userid: Option<UserId>,
    #[serde(default)]
    pub paired_user_config: Option<Box<WireUserConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSummary {
    pub id: DiaryId,
    #[serde(default, deserialize_with = "lenient_string")]
    pub createddate: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireImage {
    pub image_id: ImageId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiariesResponse {
    #[serde(default)]
    pub error: i64,
    #[serde(default)]
    pub diaries: Vec<WireDiary>,
}

/// Full diary body as returned by `all_by_ids`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireDiary {
    pub id: DiaryId,
    #[serde(default)]
    pub user: Option<UserId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub createddate: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub weather: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub mood: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub space: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub createdtime: String,
}

// ---------------------------------------------------------------------------
// Export model
// ---------------------------------------------------------------------------

/// Parse a `YYYY-MM-DD` date string.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Index entry: just enough to filter by date and request the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiarySummary {
    pub id: DiaryId,
    pub created_date: NaiveDate,
}

impl DiarySummary {
    pub fn new(id: DiaryId, created_date: &str) -> Result<Self, RecordError> {
        let created_date = parse_date(created_date).ok_or_else(|| RecordError::InvalidDate {
            id: id.to_string(),
            value: created_date.to_string(),
        })?;
        Ok(Self { id, created_date })
    }
}

impl TryFrom<WireSummary> for DiarySummary {
    type Error = RecordError;

    fn try_from(w: WireSummary) -> Result<Self, Self::Error> {
        DiarySummary::new(w.id, &w.createddate)
    }
}

/// What `list_diaries` yields for one account.
#[derive(Debug, Clone)]
pub struct DiaryIndex {
    pub author: UserId,
    pub summaries: Vec<DiarySummary>,
    /// Ids of every image in the author's pool, as the index reports them.
    pub image_ids: Vec<ImageId>,
}

/// A fully fetched diary. Body decryption and image-id extraction have
/// already happened when a value of this type exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiaryRecord {
    pub id: DiaryId,
    pub author: UserId,
    pub created_date: NaiveDate,
    pub title: String,
    pub content: String,
    pub weather: Option<String>,
    pub mood: Option<String>,
    pub space: Option<String>,
    pub created_time: Option<String>,
    pub image_ids: BTreeSet<ImageId>,
}

impl DiaryRecord {
    /// Build a record from the wire body, validating the date and running the
    /// privacy decryption and image-id extraction exactly once.
    pub fn from_wire(wire: WireDiary, author: UserId) -> Result<Self, RecordError> {
        let created_date =
            parse_date(&wire.createddate).ok_or_else(|| RecordError::InvalidDate {
                id: wire.id.to_string(),
                value: wire.createddate.clone(),
            })?;

        let cleaned = crate::privacy::strip_escaped_surrogates(&wire.content);
        let content = crate::privacy::decrypt(&cleaned, &author.to_string());
        let image_ids = crate::images::extract_ids(&content);

        Ok(Self {
            id: wire.id,
            author: wire.user.unwrap_or(author),
            created_date,
            title: wire.title,
            content,
            weather: non_empty(wire.weather),
            mood: non_empty(wire.mood),
            space: non_empty(wire.space),
            created_time: non_empty(wire.createdtime),
            image_ids,
        })
    }

    pub fn weekday(&self) -> Weekday {
        self.created_date.weekday()
    }

    pub fn month(&self) -> MonthKey {
        MonthKey::of(self.created_date)
    }
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t.to_string()) }
}

/// Calendar month, the partition key for on-disk storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Per-month aggregate driving folder creation and one image download batch.
#[derive(Debug, Clone)]
pub struct MonthBucket {
    pub key: MonthKey,
    pub markdown_dir: PathBuf,
    pub pictures_dir: PathBuf,
    pub records: Vec<DiaryRecord>,
    /// Union of the image ids referenced by `records`.
    pub image_ids: BTreeSet<ImageId>,
}

impl MonthBucket {
    pub fn new(key: MonthKey, markdown_root: &std::path::Path) -> Self {
        let markdown_dir = markdown_root.join(key.to_string());
        let pictures_dir = markdown_dir.join("Pictures");
        Self {
            key,
            markdown_dir,
            pictures_dir,
            records: Vec::new(),
            image_ids: BTreeSet::new(),
        }
    }

    pub fn push(&mut self, record: DiaryRecord) {
        self.image_ids.extend(record.image_ids.iter().copied());
        self.records.push(record);
    }
}

/// Raw image payload plus the file extension it should be stored under.
#[derive(Clone)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("bytes", &format!("<{} bytes>", self.bytes.len()))
            .field("extension", &self.extension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(date: &str, content: &str) -> WireDiary {
        WireDiary {
            id: DiaryId::new("1"),
            user: None,
            createddate: date.into(),
            title: "T".into(),
            content: content.into(),
            weather: "晴".into(),
            mood: String::new(),
            space: String::new(),
            createdtime: String::new(),
        }
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let s: WireSummary = serde_json::from_str(r#"{"id": 42, "createddate": "2024-03-05"}"#).unwrap();
        assert_eq!(s.id.as_str(), "42");
        let s: WireSummary = serde_json::from_str(r#"{"id": "abc", "createddate": "2024-03-05"}"#).unwrap();
        assert_eq!(s.id.as_str(), "abc");

        let c: WireUserConfig = serde_json::from_str(r#"{"userid": "12345"}"#).unwrap();
        assert_eq!(c.userid, Some(UserId(12345)));
        let i: WireImage = serde_json::from_str(r#"{"image_id": 17}"#).unwrap();
        assert_eq!(i.image_id, ImageId(17));
    }

    #[test]
    fn lenient_fields_tolerate_null_and_numbers() {
        let d: WireDiary = serde_json::from_str(
            r#"{"id": 1, "createddate": "2024-03-05", "title": null, "content": "x", "createdtime": 1709600000}"#,
        )
        .unwrap();
        assert_eq!(d.title, "");
        assert_eq!(d.createdtime, "1709600000");
    }

    #[test]
    fn record_rejects_bad_dates() {
        let err = DiaryRecord::from_wire(wire("2024-02-30", ""), UserId(1)).unwrap_err();
        assert!(matches!(err, RecordError::InvalidDate { .. }));
        assert!(DiarySummary::new(DiaryId::new("x"), "yesterday").is_err());
    }

    #[test]
    fn record_extracts_images_and_tags() {
        let r = DiaryRecord::from_wire(wire("2024-03-05", "见 [图17] 和 [图42] [图17]"), UserId(9)).unwrap();
        assert_eq!(r.image_ids, BTreeSet::from([ImageId(17), ImageId(42)]));
        assert_eq!(r.weather.as_deref(), Some("晴"));
        assert_eq!(r.mood, None);
        assert_eq!(r.author, UserId(9));
        assert_eq!(r.weekday(), Weekday::Tue);
        assert_eq!(r.month().to_string(), "2024-03");
    }

    #[test]
    fn bucket_unions_image_ids() {
        let mut bucket = MonthBucket::new(
            MonthKey { year: 2024, month: 3 },
            std::path::Path::new("/tmp/md"),
        );
        bucket.push(DiaryRecord::from_wire(wire("2024-03-05", "[图17]"), UserId(1)).unwrap());
        bucket.push(DiaryRecord::from_wire(wire("2024-03-06", "[图17][图42]"), UserId(1)).unwrap());
        assert_eq!(bucket.image_ids.len(), 2);
        assert_eq!(bucket.pictures_dir, std::path::Path::new("/tmp/md/2024-03/Pictures"));
    }
}
