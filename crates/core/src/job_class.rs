//! Job classes and their submission-time parameter validation.
//!
//! A [`JobClass`] decides which queue a job waits in, which worker command
//! runs it, and which completion hooks fire when it finishes. The set is
//! closed: adding a class means adding a variant here plus its config and
//! hook registration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a generation prompt in characters.
pub const MAX_PROMPT_LENGTH: usize = 4_000;

/// Upper bound for `num_images` on a generation job.
pub const MAX_IMAGES_PER_JOB: u64 = 16;

/// Upper bound for `steps` on a training job.
pub const MAX_TRAINING_STEPS: u64 = 1_000_000;

/// Upper bound for `max_pages` on a scraping job.
pub const MAX_SCRAPE_PAGES: u64 = 10_000;

// ---------------------------------------------------------------------------
// JobClass
// ---------------------------------------------------------------------------

/// The category of an orchestrated job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    Generation,
    Training,
    Scraping,
    Labeling,
}

impl JobClass {
    /// Every class, in a stable order.
    pub const ALL: [JobClass; 4] = [
        JobClass::Generation,
        JobClass::Training,
        JobClass::Scraping,
        JobClass::Labeling,
    ];

    /// Return the wire-format string for this variant.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Training => "training",
            Self::Scraping => "scraping",
            Self::Labeling => "labeling",
        }
    }

    /// Upper-case name used for per-class environment variables.
    pub fn env_prefix(self) -> &'static str {
        match self {
            Self::Generation => "GENERATION",
            Self::Training => "TRAINING",
            Self::Scraping => "SCRAPING",
            Self::Labeling => "LABELING",
        }
    }

    /// Kind of artifact a successful job of this class produces.
    pub fn artifact_kind(self) -> &'static str {
        match self {
            Self::Generation => "image_batch",
            Self::Training => "checkpoint",
            Self::Scraping => "scraped_directory",
            Self::Labeling => "label_set",
        }
    }

    /// Validate submission parameters for this class.
    ///
    /// Params must be a JSON object. Class-specific required keys:
    /// - **generation**: `prompt`
    /// - **training**: `dataset`
    /// - **scraping**: `url`
    /// - **labeling**: `dataset`
    pub fn validate_params(self, params: &Value) -> Result<(), CoreError> {
        let obj = params
            .as_object()
            .ok_or_else(|| CoreError::Validation("params must be a JSON object".to_string()))?;

        match self {
            Self::Generation => {
                let prompt = required_str(obj, "prompt")?;
                if prompt.chars().count() > MAX_PROMPT_LENGTH {
                    return Err(CoreError::Validation(format!(
                        "prompt exceeds maximum length of {MAX_PROMPT_LENGTH} characters"
                    )));
                }
                optional_int(obj, "num_images", 1, MAX_IMAGES_PER_JOB)?;
                if let Some(neg) = obj.get("negative_prompt") {
                    if !neg.is_string() {
                        return Err(CoreError::Validation(
                            "negative_prompt must be a string".to_string(),
                        ));
                    }
                }
            }
            Self::Training => {
                required_str(obj, "dataset")?;
                optional_int(obj, "steps", 1, MAX_TRAINING_STEPS)?;
                if obj.contains_key("base_model") {
                    required_str(obj, "base_model")?;
                }
            }
            Self::Scraping => {
                let url = required_str(obj, "url")?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(CoreError::Validation(format!(
                        "url must start with http:// or https://, got '{url}'"
                    )));
                }
                optional_int(obj, "max_pages", 1, MAX_SCRAPE_PAGES)?;
            }
            Self::Labeling => {
                required_str(obj, "dataset")?;
                if let Some(labels) = obj.get("labels") {
                    let items = labels.as_array().ok_or_else(|| {
                        CoreError::Validation("labels must be an array of strings".to_string())
                    })?;
                    for (i, item) in items.iter().enumerate() {
                        match item.as_str() {
                            Some(s) if !s.trim().is_empty() => {}
                            _ => {
                                return Err(CoreError::Validation(format!(
                                    "labels[{i}] must be a non-empty string"
                                )))
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for JobClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(Self::Generation),
            "training" => Ok(Self::Training),
            "scraping" => Ok(Self::Scraping),
            "labeling" => Ok(Self::Labeling),
            _ => Err(CoreError::Validation(format!(
                "Invalid job_class: '{s}'. Must be one of: generation, training, scraping, labeling"
            ))),
        }
    }
}

impl std::fmt::Display for JobClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn required_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, CoreError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(CoreError::Validation(format!("{key} must not be empty"))),
        Some(_) => Err(CoreError::Validation(format!("{key} must be a string"))),
        None => Err(CoreError::Validation(format!("{key} is required"))),
    }
}

fn optional_int(
    obj: &Map<String, Value>,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), CoreError> {
    let Some(value) = obj.get(key) else {
        return Ok(());
    };
    match value.as_u64() {
        Some(n) if (min..=max).contains(&n) => Ok(()),
        _ => Err(CoreError::Validation(format!(
            "{key} must be an integer between {min} and {max}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn class_string_roundtrip() {
        for class in JobClass::ALL {
            assert_eq!(class.as_str().parse::<JobClass>().unwrap(), class);
        }
    }

    #[test]
    fn unknown_class_rejected() {
        assert_matches!("upscaling".parse::<JobClass>(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn class_serializes_snake_case() {
        assert_eq!(serde_json::to_value(JobClass::Labeling).unwrap(), json!("labeling"));
    }

    #[test]
    fn params_must_be_object() {
        let err = JobClass::Generation.validate_params(&json!("x")).unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn generation_requires_prompt() {
        assert!(JobClass::Generation.validate_params(&json!({"prompt": "x"})).is_ok());
        assert!(JobClass::Generation.validate_params(&json!({})).is_err());
        assert!(JobClass::Generation.validate_params(&json!({"prompt": "   "})).is_err());
        assert!(JobClass::Generation.validate_params(&json!({"prompt": 3})).is_err());
    }

    #[test]
    fn generation_prompt_length_limit() {
        let long = "a".repeat(MAX_PROMPT_LENGTH + 1);
        assert!(JobClass::Generation
            .validate_params(&json!({ "prompt": long }))
            .is_err());
    }

    #[test]
    fn generation_num_images_range() {
        let ok = json!({"prompt": "cat", "num_images": 4});
        let zero = json!({"prompt": "cat", "num_images": 0});
        let many = json!({"prompt": "cat", "num_images": 17});
        assert!(JobClass::Generation.validate_params(&ok).is_ok());
        assert!(JobClass::Generation.validate_params(&zero).is_err());
        assert!(JobClass::Generation.validate_params(&many).is_err());
    }

    #[test]
    fn training_requires_dataset_and_positive_steps() {
        assert!(JobClass::Training
            .validate_params(&json!({"dataset": "album-7", "steps": 500}))
            .is_ok());
        assert!(JobClass::Training.validate_params(&json!({"steps": 500})).is_err());
        assert!(JobClass::Training
            .validate_params(&json!({"dataset": "album-7", "steps": -1}))
            .is_err());
        assert!(JobClass::Training
            .validate_params(&json!({"dataset": "album-7", "base_model": ""}))
            .is_err());
    }

    #[test]
    fn scraping_requires_http_url() {
        assert!(JobClass::Scraping
            .validate_params(&json!({"url": "https://example.com"}))
            .is_ok());
        assert!(JobClass::Scraping
            .validate_params(&json!({"url": "ftp://example.com"}))
            .is_err());
    }

    #[test]
    fn labeling_labels_must_be_strings() {
        assert!(JobClass::Labeling
            .validate_params(&json!({"dataset": "d", "labels": ["cat", "dog"]}))
            .is_ok());
        assert!(JobClass::Labeling
            .validate_params(&json!({"dataset": "d", "labels": ["cat", ""]}))
            .is_err());
        assert!(JobClass::Labeling
            .validate_params(&json!({"dataset": "d", "labels": "cat"}))
            .is_err());
    }
}
