//! Resolution of human-supplied `field name -> value` pairs against a GitHub Projects (v2) schema.
//!
//! A [`ProjectSchema`] is fetched once per invocation. Each requested pair is looked up by exact
//! field name, coerced according to the field's data type and handed to a mutation callback, one
//! field at a time. The first failure aborts the remaining updates.

use std::{collections::BTreeMap, fmt, future::Future};

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::logger::Logger;

/// Snapshot of a project, see https://docs.github.com/en/graphql/reference/objects#projectv2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawProject")]
pub struct ProjectSchema {
    pub id: String,
    pub title: String,
    pub url: String,
    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDefinition {
    pub id: String,
    pub name: String,
    pub data_type: FieldDataType,
    /// Only populated for [`FieldDataType::SingleSelect`].
    pub options: Vec<FieldOption>,
}

/// `ProjectV2FieldType` as returned by the API. Unknown names are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldDataType {
    Text,
    SingleSelect,
    Date,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub id: String,
    pub name: String,
}

/// Serializes to the `ProjectV2FieldValue` GraphQL input shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldValue {
    Text(String),
    SingleSelectOptionId(String),
    Date(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedUpdate {
    pub field_id: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("field {0:?} not found")]
    FieldNotFound(String),
    #[error("option {0:?} not found")]
    OptionNotFound(String),
    #[error("unsupported field type {0:?}")]
    UnsupportedFieldType(String),
    #[error("invalid date {value:?}, expected an RFC 3339 timestamp")]
    InvalidDateFormat {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl From<String> for FieldDataType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "TEXT" => Self::Text,
            "SINGLE_SELECT" => Self::SingleSelect,
            "DATE" => Self::Date,
            _ => Self::Other(raw),
        }
    }
}

impl From<FieldDataType> for String {
    fn from(data_type: FieldDataType) -> Self {
        data_type.to_string()
    }
}

impl fmt::Display for FieldDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("TEXT"),
            Self::SingleSelect => f.write_str("SINGLE_SELECT"),
            Self::Date => f.write_str("DATE"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

impl ProjectSchema {
    /// First field whose name matches byte for byte.
    pub fn find_field(&self, name: &str) -> Result<&FieldDefinition, FieldError> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| FieldError::FieldNotFound(name.to_string()))
    }

    /// Link to a project item as shown in the web UI.
    pub fn item_url(&self, database_id: u64) -> String {
        format!("{}?pane=issue&itemId={database_id}", self.url)
    }
}

/// Turns a raw string into the typed value the field expects.
pub fn coerce(field: &FieldDefinition, raw: &str) -> Result<ResolvedUpdate, FieldError> {
    let value = match &field.data_type {
        FieldDataType::Text => FieldValue::Text(raw.to_string()),
        FieldDataType::SingleSelect => {
            // duplicate option names are not rejected, the first one wins
            let option = field
                .options
                .iter()
                .find(|option| option.name == raw)
                .ok_or_else(|| FieldError::OptionNotFound(raw.to_string()))?;
            FieldValue::SingleSelectOptionId(option.id.clone())
        }
        FieldDataType::Date => {
            let date = DateTime::parse_from_rfc3339(raw).map_err(|source| {
                FieldError::InvalidDateFormat {
                    value: raw.to_string(),
                    source,
                }
            })?;
            FieldValue::Date(date)
        }
        other @ FieldDataType::Other(_) => {
            return Err(FieldError::UnsupportedFieldType(other.to_string()))
        }
    };

    Ok(ResolvedUpdate {
        field_id: field.id.clone(),
        value,
    })
}

/// Lookup and coercion in one step, with both intermediate results handed to `logger`.
pub fn resolve(
    schema: &ProjectSchema,
    field_name: &str,
    raw: &str,
    logger: Logger,
) -> Result<ResolvedUpdate, FieldError> {
    let field = schema.find_field(field_name)?;
    logger.print_json("found field", field);

    let update = coerce(field, raw)?;
    logger.print_json("update project fields input", &update);

    Ok(update)
}

/// Applies every requested field in name order, one `mutate` call per field.
///
/// Stops at the first lookup, coercion or mutation error; later fields are never attempted.
/// Returns the number of fields that were updated.
pub async fn apply_updates<F, Fut>(
    schema: &ProjectSchema,
    requests: &BTreeMap<String, String>,
    logger: Logger,
    mut mutate: F,
) -> anyhow::Result<usize>
where
    F: FnMut(ResolvedUpdate) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut applied = 0;

    for (field_name, raw) in requests {
        let update = resolve(schema, field_name, raw, logger)?;

        debug!("updating field {field_name:?} to {raw:?}");
        mutate(update)
            .await
            .context(format!("updating field {field_name:?}"))?;

        applied += 1;
    }

    Ok(applied)
}

#[derive(Deserialize)]
struct RawProject {
    id: String,
    #[serde(default)]
    title: String,
    url: String,
    fields: RawFieldConnection,
}

#[derive(Deserialize)]
struct RawFieldConnection {
    nodes: Vec<RawField>,
}

/// One member of the `ProjectV2FieldConfiguration` union.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    id: String,
    name: String,
    data_type: FieldDataType,
    #[serde(default)]
    options: Vec<FieldOption>,
}

impl From<RawProject> for ProjectSchema {
    fn from(raw: RawProject) -> Self {
        let fields = raw
            .fields
            .nodes
            .into_iter()
            .map(|field| FieldDefinition {
                id: field.id,
                name: field.name,
                data_type: field.data_type,
                options: field.options,
            })
            .collect();

        Self {
            id: raw.id,
            title: raw.title,
            url: raw.url,
            fields,
        }
    }
}
