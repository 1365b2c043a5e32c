//! The settings aggregate owned by the device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Business identity printed on invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreProfile {
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub currency: String,
    /// Logo reference: a remote URL, a `data:` URI or a device-local path.
    pub logo: Option<String>,
}

impl Default for StoreProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            phone: String::new(),
            email: String::new(),
            currency: "USD".to_string(),
            logo: None,
        }
    }
}

/// Tax configuration applied to invoice totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaxConfig {
    pub enabled: bool,
    pub label: String,
    /// Percentage, e.g. `7.5`.
    pub rate: f64,
    /// Whether listed prices already include tax.
    pub inclusive: bool,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            label: "Tax".to_string(),
            rate: 0.0,
            inclusive: false,
        }
    }
}

/// Invoice numbering and layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvoiceTemplate {
    pub prefix: String,
    pub next_number: u64,
    pub footer: String,
    pub show_logo: bool,
}

impl Default for InvoiceTemplate {
    fn default() -> Self {
        Self {
            prefix: "INV-".to_string(),
            next_number: 1,
            footer: String::new(),
            show_logo: true,
        }
    }
}

/// Signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: Option<String>,
    pub name: String,
    pub email: String,
}

/// The single authoritative settings aggregate.
///
/// Created with defaults at first run, edited section by section, never
/// deleted. The remote copy is a cache of this document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsDocument {
    pub store: StoreProfile,
    pub tax: TaxConfig,
    pub invoice: InvoiceTemplate,
    pub user: UserProfile,
    pub onboarded_at: Option<DateTime<Utc>>,
}

/// Editable sections of [`SettingsDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsSection {
    Store,
    Tax,
    Invoice,
    User,
}

impl SettingsSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsSection::Store => "store",
            SettingsSection::Tax => "tax",
            SettingsSection::Invoice => "invoice",
            SettingsSection::User => "user",
        }
    }
}

impl fmt::Display for SettingsSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingsSection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "store" => Ok(SettingsSection::Store),
            "tax" => Ok(SettingsSection::Tax),
            "invoice" => Ok(SettingsSection::Invoice),
            "user" => Ok(SettingsSection::User),
            other => Err(Error::InvalidInput(format!(
                "Unknown settings section '{}'",
                other
            ))),
        }
    }
}

impl SettingsDocument {
    /// Merge a JSON object into one section.
    ///
    /// Keys absent from `patch` keep their current value. The document is
    /// left untouched when the patch does not fit the section's shape.
    ///
    /// # Errors
    /// - `patch` is not a JSON object
    /// - a patched field has the wrong type
    pub fn apply_patch(&mut self, section: SettingsSection, patch: &serde_json::Value) -> Result<()> {
        let patch = patch.as_object().ok_or_else(|| {
            Error::InvalidInput(format!("Patch for '{}' must be a JSON object", section))
        })?;

        match section {
            SettingsSection::Store => self.store = merge(&self.store, patch)?,
            SettingsSection::Tax => self.tax = merge(&self.tax, patch)?,
            SettingsSection::Invoice => self.invoice = merge(&self.invoice, patch)?,
            SettingsSection::User => self.user = merge(&self.user, patch)?,
        }
        Ok(())
    }

    /// Whether onboarding has been completed on this device.
    pub fn is_onboarded(&self) -> bool {
        self.onboarded_at.is_some()
    }
}

fn merge<T>(current: &T, patch: &serde_json::Map<String, serde_json::Value>) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(current)?;
    if let Some(fields) = value.as_object_mut() {
        for (key, v) in patch {
            fields.insert(key.clone(), v.clone());
        }
    }
    serde_json::from_value(value).map_err(|e| Error::InvalidInput(format!("Invalid patch: {}", e)))
}

/// Partial settings payload for the metadata API.
///
/// Sections left as `None` are not sent, so the remote keeps its copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax: Option<TaxConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<InvoiceTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    pub onboarded_at: Option<DateTime<Utc>>,
}

impl SettingsUpload {
    /// Every section.
    pub fn full(doc: &SettingsDocument) -> Self {
        Self {
            store: Some(doc.store.clone()),
            tax: Some(doc.tax.clone()),
            invoice: Some(doc.invoice.clone()),
            user: Some(doc.user.clone()),
            onboarded_at: doc.onboarded_at,
        }
    }

    /// Only what the remote needs to know that onboarding happened.
    pub fn onboarding(doc: &SettingsDocument) -> Self {
        Self {
            store: Some(doc.store.clone()),
            user: Some(doc.user.clone()),
            onboarded_at: doc.onboarded_at,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_patch_merges_into_section() {
        let mut doc = SettingsDocument::default();
        doc.apply_patch(SettingsSection::Store, &json!({"name": "Corner Shop", "phone": "555"}))
            .unwrap();

        assert_eq!(doc.store.name, "Corner Shop");
        assert_eq!(doc.store.phone, "555");
        assert_eq!(doc.store.currency, "USD");
        assert_eq!(doc.tax, TaxConfig::default());
    }

    #[test]
    fn test_patch_with_wrong_type_leaves_document() {
        let mut doc = SettingsDocument::default();
        let before = doc.clone();
        let result = doc.apply_patch(SettingsSection::Tax, &json!({"rate": "high"}));

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(doc, before);
    }

    #[test]
    fn test_patch_must_be_object() {
        let mut doc = SettingsDocument::default();
        assert!(doc.apply_patch(SettingsSection::User, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_section_from_str() {
        assert_eq!("Invoice".parse::<SettingsSection>().unwrap(), SettingsSection::Invoice);
        assert!("billing".parse::<SettingsSection>().is_err());
    }

    #[test]
    fn test_onboarding_upload_omits_other_sections() {
        let mut doc = SettingsDocument::default();
        doc.onboarded_at = Some(Utc::now());
        let upload = SettingsUpload::onboarding(&doc);
        let value = serde_json::to_value(&upload).unwrap();

        assert!(value.get("store").is_some());
        assert!(value.get("user").is_some());
        assert!(value.get("tax").is_none());
        assert!(value.get("invoice").is_none());
        assert!(value.get("onboardedAt").is_some());
    }

    #[test]
    fn test_document_tolerates_missing_fields() {
        let doc: SettingsDocument = serde_json::from_str(r#"{"store":{"name":"A"}}"#).unwrap();
        assert_eq!(doc.store.name, "A");
        assert_eq!(doc.invoice.prefix, "INV-");
    }

    proptest! {
        #[test]
        fn prop_patch_keeps_untouched_fields(footer in ".*", next in 1u64..1_000_000) {
            let mut doc = SettingsDocument::default();
            doc.invoice.footer = footer.clone();
            doc.apply_patch(SettingsSection::Invoice, &json!({"nextNumber": next})).unwrap();

            prop_assert_eq!(doc.invoice.next_number, next);
            prop_assert_eq!(&doc.invoice.footer, &footer);
            prop_assert_eq!(&doc.invoice.prefix, "INV-");
        }
    }
}
