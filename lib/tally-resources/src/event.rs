use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_common::collections::FastHashMap;

/// A value carried by an [`Event`] field.
#[derive(Clone, Debug, PartialEq)]
pub enum EventValue {
    /// A string.
    String(String),

    /// A number.
    Number(f64),

    /// A duration.
    Duration(Duration),

    /// A point in time.
    Time(DateTime<Utc>),

    /// A list of strings.
    List(Vec<String>),
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for EventValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for EventValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Duration> for EventValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl From<DateTime<Utc>> for EventValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

impl From<Vec<String>> for EventValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// An event to be matched against resource profiles.
///
/// Events are opaque to the engine itself: their fields are only ever inspected by the [`FilterEngine`] and the
/// optional [`ProfileIndex`].
///
/// [`FilterEngine`]: crate::FilterEngine
/// [`ProfileIndex`]: crate::ProfileIndex
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    tenant: String,
    id: String,
    time: Option<DateTime<Utc>>,
    fields: FastHashMap<String, EventValue>,
}

impl Event {
    /// Creates an empty event.
    pub fn new<T, I>(tenant: T, id: I) -> Self
    where
        T: Into<String>,
        I: Into<String>,
    {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            time: None,
            fields: FastHashMap::default(),
        }
    }

    /// Sets the time the event happened at.
    ///
    /// Profile activation intervals are checked against this time, falling back to the current time when unset.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets a field, replacing any previous value.
    pub fn with_field<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<EventValue>,
    {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns the tenant of the event.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Returns the ID of the event.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the time the event happened at, if set.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    /// Returns the value of the field `name`, if present.
    pub fn field(&self, name: &str) -> Option<&EventValue> {
        self.fields.get(name)
    }

    /// Returns an iterator over all fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &EventValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}
