// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Job listing data model.
//!
//! A __listing__ is one job posting record pulled from the upstream feed. A
//! __snapshot__ is the full ordered collection of listings known at one point
//! in time. Jobwatch always compares two snapshots: the previous snapshot kept
//! in storage, and the current snapshot freshly read from the feed.
//!
//! # Listing Identity
//!
//! Every listing carries a stable opaque [`ListingId`] assigned by the feed.
//! Identity is never recomputed from content, so a listing whose title or URL
//! gets corrected upstream is still the same listing.
//!
//! # Field Values
//!
//! Field-level diffs and patches carry values as plain JSON. This keeps the
//! `{old, new}` shape of a diff identical to what the feed itself publishes,
//! and lets storage backends accept partial updates without a dedicated patch
//! type per field.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashSet},
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Stable opaque identifier of a listing.
#[derive(Default, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    /// Construct new listing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Treat listing identifier as string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ListingId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl From<&str> for ListingId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ListingId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// A job posting record.
///
/// # Invariants
///
/// - Identifier, title, company name, and URL are never empty.
/// - Locations and terms behave as sets: no duplicates, first occurrence
///   order preserved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub company_name: String,

    /// Canonical posting URL, unique across a snapshot.
    pub url: String,

    #[serde(default)]
    pub company_url: Option<String>,

    #[serde(default)]
    pub sponsorship: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub locations: Vec<String>,

    /// Hiring terms, e.g., "Summer 2026".
    #[serde(default, deserialize_with = "null_as_default")]
    pub terms: Vec<String>,

    #[serde(default)]
    pub source: Option<String>,

    /// Posting time in unix seconds.
    #[serde(default)]
    pub date_posted: Option<i64>,

    /// Last upstream modification in unix seconds.
    pub date_updated: i64,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default = "default_true")]
    pub is_visible: bool,
}

impl Listing {
    /// Parse a single raw feed record.
    ///
    /// The record is deserialized, checked for required content, and
    /// normalized. The `index` is only used to point at the offending record
    /// when parsing fails.
    ///
    /// # Errors
    ///
    /// - Return [`ValidationError::Record`] if the record cannot be
    ///   deserialized at all, e.g., missing identifier or wrong field type.
    /// - Return [`ValidationError::MissingField`] if a required text field is
    ///   blank.
    pub fn from_record(index: usize, record: Value) -> Result<Self> {
        let mut listing: Listing =
            serde_json::from_value(record).map_err(|err| ValidationError::Record {
                index,
                reason: err.to_string(),
            })?;

        if listing.id.as_str().trim().is_empty() {
            return Err(ValidationError::Record {
                index,
                reason: "listing identifier is empty".into(),
            });
        }

        listing.validate()?;
        listing.normalize();

        Ok(listing)
    }

    /// Check that required text fields hold content.
    ///
    /// # Errors
    ///
    /// - Return [`ValidationError::MissingField`] for the first blank
    ///   required field.
    pub fn validate(&self) -> Result<()> {
        let required = [
            (Field::Url, &self.url),
            (Field::CompanyName, &self.company_name),
            (Field::Title, &self.title),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    id: self.id.clone(),
                    field,
                });
            }
        }

        Ok(())
    }

    /// Remove duplicate locations and terms, keeping first occurrences.
    pub fn normalize(&mut self) {
        self.locations = dedup_preserving_order(std::mem::take(&mut self.locations));
        self.terms = dedup_preserving_order(std::mem::take(&mut self.terms));
    }

    /// Current value of a field as JSON.
    pub fn field(&self, field: Field) -> Value {
        match field {
            Field::Url => Value::from(self.url.as_str()),
            Field::CompanyName => Value::from(self.company_name.as_str()),
            Field::Title => Value::from(self.title.as_str()),
            Field::Sponsorship => self.sponsorship.as_deref().map_or(Value::Null, Value::from),
            Field::Source => self.source.as_deref().map_or(Value::Null, Value::from),
            Field::DatePosted => self.date_posted.map_or(Value::Null, Value::from),
            Field::CompanyUrl => self.company_url.as_deref().map_or(Value::Null, Value::from),
            Field::Locations => Value::from(self.locations.clone()),
            Field::Terms => Value::from(self.terms.clone()),
            Field::DateUpdated => Value::from(self.date_updated),
            Field::Active => Value::from(self.active),
            Field::IsVisible => Value::from(self.is_visible),
        }
    }

    /// Every field of the listing as a field map.
    ///
    /// Applying the result to any listing with the same identifier turns it
    /// into an exact copy of this listing.
    pub fn to_fields(&self) -> FieldMap {
        Field::ALL
            .iter()
            .map(|field| (*field, self.field(*field)))
            .collect()
    }

    /// Set a single field from a JSON value.
    ///
    /// # Errors
    ///
    /// - Return [`ValidationError::WrongType`] if the value does not fit the
    ///   field. The listing is left untouched in that case.
    pub fn set_field(&mut self, field: Field, value: Value) -> Result<()> {
        let id = self.id.clone();
        let wrong_type = |expected: &'static str| ValidationError::WrongType {
            id: id.clone(),
            field,
            expected,
        };

        match field {
            Field::Url => self.url = required_string(value).ok_or_else(|| wrong_type("text"))?,
            Field::CompanyName => {
                self.company_name = required_string(value).ok_or_else(|| wrong_type("text"))?
            }
            Field::Title => self.title = required_string(value).ok_or_else(|| wrong_type("text"))?,
            Field::Sponsorship => {
                self.sponsorship =
                    optional_string(value).ok_or_else(|| wrong_type("text or null"))?
            }
            Field::Source => {
                self.source = optional_string(value).ok_or_else(|| wrong_type("text or null"))?
            }
            Field::CompanyUrl => {
                self.company_url =
                    optional_string(value).ok_or_else(|| wrong_type("text or null"))?
            }
            Field::DatePosted => {
                self.date_posted =
                    optional_integer(value).ok_or_else(|| wrong_type("integer or null"))?
            }
            Field::Locations => {
                self.locations = string_list(value).ok_or_else(|| wrong_type("list of text"))?
            }
            Field::Terms => {
                self.terms = string_list(value).ok_or_else(|| wrong_type("list of text"))?
            }
            Field::DateUpdated => {
                self.date_updated = value.as_i64().ok_or_else(|| wrong_type("integer"))?
            }
            Field::Active => self.active = value.as_bool().ok_or_else(|| wrong_type("boolean"))?,
            Field::IsVisible => {
                self.is_visible = value.as_bool().ok_or_else(|| wrong_type("boolean"))?
            }
        }

        Ok(())
    }

    /// Apply a set of field values as one unit.
    ///
    /// Either every field is applied, or none are.
    ///
    /// # Errors
    ///
    /// - Return [`ValidationError::WrongType`] for the first value that does
    ///   not fit its field.
    pub fn apply_fields(&mut self, fields: &FieldMap) -> Result<()> {
        let mut patched = self.clone();
        for (field, value) in fields {
            patched.set_field(*field, value.clone())?;
        }
        patched.normalize();
        *self = patched;

        Ok(())
    }
}

/// Named, non-identity field of a [`Listing`].
///
/// Serialized with the same names the upstream feed uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Url,
    CompanyName,
    Title,
    Sponsorship,
    Source,
    DatePosted,
    CompanyUrl,
    Locations,
    Terms,
    DateUpdated,
    Active,
    IsVisible,
}

impl Field {
    /// Every listing field.
    pub const ALL: [Field; 12] = [
        Field::Url,
        Field::CompanyName,
        Field::Title,
        Field::Sponsorship,
        Field::Source,
        Field::DatePosted,
        Field::CompanyUrl,
        Field::Locations,
        Field::Terms,
        Field::DateUpdated,
        Field::Active,
        Field::IsVisible,
    ];

    /// Fields always compared between snapshots.
    pub const PRIMARY: [Field; 3] = [Field::Active, Field::IsVisible, Field::DateUpdated];

    /// Fields compared only when a content correction is detected.
    pub const SECONDARY: [Field; 9] = [
        Field::Url,
        Field::CompanyName,
        Field::Title,
        Field::Sponsorship,
        Field::Source,
        Field::DatePosted,
        Field::CompanyUrl,
        Field::Locations,
        Field::Terms,
    ];

    /// Wire name of field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Url => "url",
            Field::CompanyName => "company_name",
            Field::Title => "title",
            Field::Sponsorship => "sponsorship",
            Field::Source => "source",
            Field::DatePosted => "date_posted",
            Field::CompanyUrl => "company_url",
            Field::Locations => "locations",
            Field::Terms => "terms",
            Field::DateUpdated => "date_updated",
            Field::Active => "active",
            Field::IsVisible => "is_visible",
        }
    }
}

impl Display for Field {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = UnknownField;

    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        Field::ALL
            .into_iter()
            .find(|field| field.as_str() == name)
            .ok_or_else(|| UnknownField(name.to_string()))
    }
}

/// Field name that does not belong to a listing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown listing field {0:?}")]
pub struct UnknownField(pub String);

/// Field values keyed by field.
pub type FieldMap = BTreeMap<Field, Value>;

/// Ordered collection of listings at one point in time.
#[derive(Default, Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Snapshot(Vec<Listing>);

impl Snapshot {
    /// Construct new snapshot from listings in iteration order.
    pub fn new(listings: Vec<Listing>) -> Self {
        Self(listings)
    }

    /// Validate raw records one by one.
    ///
    /// Records that fail validation are collected and returned next to the
    /// snapshot of valid listings. One bad record never rejects the batch.
    pub fn from_records(records: Vec<Value>) -> (Self, Vec<ValidationError>) {
        let mut listings = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();

        for (index, record) in records.into_iter().enumerate() {
            match Listing::from_record(index, record) {
                Ok(listing) => listings.push(listing),
                Err(error) => rejected.push(error),
            }
        }

        (Self(listings), rejected)
    }

    /// Parse a JSON array document of raw records.
    ///
    /// # Errors
    ///
    /// - Return [`serde_json::Error`] if the document is not a JSON array.
    pub fn from_json(data: &str) -> std::result::Result<(Self, Vec<ValidationError>), serde_json::Error> {
        let records: Vec<Value> = serde_json::from_str(data)?;
        Ok(Self::from_records(records))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Listing> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Listing] {
        self.0.as_slice()
    }

    /// Find listing by identifier.
    pub fn get(&self, id: &ListingId) -> Option<&Listing> {
        self.0.iter().find(|listing| &listing.id == id)
    }

    /// Find listing by identifier for modification.
    pub fn get_mut(&mut self, id: &ListingId) -> Option<&mut Listing> {
        self.0.iter_mut().find(|listing| &listing.id == id)
    }

    /// Append listings in order.
    pub fn extend(&mut self, listings: impl IntoIterator<Item = Listing>) {
        self.0.extend(listings);
    }

    /// Keep only listings matching predicate.
    pub fn retain(&mut self, predicate: impl FnMut(&Listing) -> bool) {
        self.0.retain(predicate);
    }

    pub fn into_vec(self) -> Vec<Listing> {
        self.0
    }
}

impl FromIterator<Listing> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Listing>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Snapshot {
    type Item = Listing;
    type IntoIter = std::vec::IntoIter<Listing>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Listing;
    type IntoIter = std::slice::Iter<'a, Listing>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Record of a notification delivered for a listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrackingEntry {
    pub message_id: String,
    pub channel_id: String,

    /// Delivery time in unix seconds.
    #[serde(default)]
    pub posted_at: i64,
}

/// Tracking entries keyed by listing, one entry per notified channel.
pub type TrackingMap = BTreeMap<ListingId, Vec<TrackingEntry>>;

/// Malformed listing record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Record could not be read as a listing at all.
    #[error("record {index} is not a valid listing: {reason}")]
    Record { index: usize, reason: String },

    /// Required text field is blank.
    #[error("listing {id} is missing required field {field}")]
    MissingField { id: ListingId, field: Field },

    /// Field value has wrong type.
    #[error("listing {id} expects {expected} for field {field}")]
    WrongType {
        id: ListingId,
        field: Field,
        expected: &'static str,
    },
}

fn default_true() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn required_string(value: Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text),
        _ => None,
    }
}

fn optional_string(value: Value) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(text) => Some(Some(text)),
        _ => None,
    }
}

fn optional_integer(value: Value) -> Option<Option<i64>> {
    match value {
        Value::Null => Some(None),
        value => value.as_i64().map(Some),
    }
}

fn string_list(value: Value) -> Option<Vec<String>> {
    match value {
        Value::Null => Some(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => Some(text),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Friendly result alias :3
type Result<T, E = ValidationError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) fn sample(id: &str, date_updated: i64) -> Listing {
    Listing {
        id: ListingId::new(id),
        title: format!("Software Engineer Intern {id}"),
        company_name: format!("Company {id}"),
        url: format!("https://jobs.example.com/{id}"),
        company_url: Some("https://example.com".into()),
        sponsorship: Some("Offers Sponsorship".into()),
        locations: vec!["San Francisco, CA".into()],
        terms: vec!["Summer 2026".into()],
        source: Some("feed".into()),
        date_posted: Some(date_updated),
        date_updated,
        active: true,
        is_visible: true,
    }
}
