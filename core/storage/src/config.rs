//! Provider configuration schemas and validation helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use siberian_common::{Error, ProviderId, Result};

use crate::gcs::GcsConfig;
use crate::gdrive::GDriveConfig;
use crate::local::LocalConfig;
use crate::s3::S3Config;

/// Input widget type of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Password,
    Textarea,
    Number,
    Select,
}

/// One configuration field.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Allowed values for `Select` fields.
    pub options: &'static [&'static str],
}

impl FieldSpec {
    pub const fn required(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            kind,
            required: true,
            options: &[],
        }
    }

    pub const fn optional(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            kind,
            required: false,
            options: &[],
        }
    }

    pub const fn select(
        name: &'static str,
        label: &'static str,
        required: bool,
        options: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            label,
            kind: FieldKind::Select,
            required,
            options,
        }
    }
}

/// Validated configuration of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    Local(LocalConfig),
    Gdrive(GDriveConfig),
    Gcs(GcsConfig),
    S3(S3Config),
}

impl ProviderConfig {
    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderConfig::Local(_) => ProviderId::Local,
            ProviderConfig::Gdrive(_) => ProviderId::Gdrive,
            ProviderConfig::Gcs(_) => ProviderId::Gcs,
            ProviderConfig::S3(_) => ProviderId::S3,
        }
    }

    /// The provider-specific body, as persisted in the settings store.
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            ProviderConfig::Local(c) => serde_json::to_value(c)?,
            ProviderConfig::Gdrive(c) => serde_json::to_value(c)?,
            ProviderConfig::Gcs(c) => serde_json::to_value(c)?,
            ProviderConfig::S3(c) => serde_json::to_value(c)?,
        };
        Ok(value)
    }
}

/// Read access to raw, unvalidated configuration input.
///
/// Strings are trimmed and empty strings count as missing.
pub(crate) struct RawConfig<'a> {
    fields: &'a serde_json::Map<String, Value>,
    schema: &'static [FieldSpec],
}

impl<'a> RawConfig<'a> {
    pub(crate) fn new(raw: &'a Value, schema: &'static [FieldSpec]) -> Result<Self> {
        let fields = raw.as_object().ok_or_else(|| {
            Error::Validation("Configuration must be a JSON object".to_string())
        })?;
        let raw = Self { fields, schema };
        raw.check_required()?;
        Ok(raw)
    }

    fn check_required(&self) -> Result<()> {
        for spec in self.schema.iter().filter(|s| s.required) {
            if self.text(spec.name).is_none() {
                return Err(Error::Validation(format!(
                    "Missing required field '{}' ({})",
                    spec.name, spec.label
                )));
            }
        }
        for spec in self.schema.iter().filter(|s| s.kind == FieldKind::Select) {
            if let Some(value) = self.text(spec.name) {
                if !spec.options.contains(&value.as_str()) {
                    return Err(Error::Validation(format!(
                        "Field '{}' must be one of: {}",
                        spec.name,
                        spec.options.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Trimmed, non-empty string value. Numbers are rendered as text.
    pub(crate) fn text(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// A field the schema marks as required.
    pub(crate) fn required(&self, name: &str) -> Result<String> {
        self.text(name)
            .ok_or_else(|| Error::Validation(format!("Missing required field '{}'", name)))
    }

    /// Non-negative integer, accepting numeric strings.
    pub(crate) fn number(&self, name: &str) -> Result<Option<u64>> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                Error::Validation(format!("Field '{}' must be a positive integer", name))
            }),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
                Error::Validation(format!("Field '{}' must be a positive integer", name))
            }),
            Some(_) => Err(Error::Validation(format!(
                "Field '{}' must be a positive integer",
                name
            ))),
        }
    }
}
