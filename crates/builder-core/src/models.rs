use std::{fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------
// ENUMS
// ---------------------------------------------

/// Pipeline position of a build request.
///
/// Variants are declared in pipeline order, so `Ord` follows the order in
/// which stages are visited. `Finished` and `Failed` are terminal.
#[derive(
    Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum BuildStage {
    #[serde(rename = "Getting")]
    ContextGetting,
    #[serde(rename = "Building")]
    ImageBuilding,
    #[serde(rename = "Pushing")]
    ImagePushing,
    #[serde(rename = "Creating")]
    ImageSourceCreating,
    Finished,
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown build stage: {0:?}")]
pub struct UnknownStage(pub String);

impl BuildStage {
    pub const INITIAL: BuildStage = BuildStage::ContextGetting;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextGetting => "Getting",
            Self::ImageBuilding => "Building",
            Self::ImagePushing => "Pushing",
            Self::ImageSourceCreating => "Creating",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
        }
    }

    /// Recognised wire value, or `None` for empty and unknown values.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }

    /// The stage that follows a successful run of this one.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::ContextGetting => Some(Self::ImageBuilding),
            Self::ImageBuilding => Some(Self::ImagePushing),
            Self::ImagePushing => Some(Self::ImageSourceCreating),
            Self::ImageSourceCreating => Some(Self::Finished),
            Self::Finished | Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Getting" => Ok(Self::ContextGetting),
            "Building" => Ok(Self::ImageBuilding),
            "Pushing" => Ok(Self::ImagePushing),
            "Creating" => Ok(Self::ImageSourceCreating),
            "Finished" => Ok(Self::Finished),
            "Failed" => Ok(Self::Failed),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [BuildStage; 6] = [
        BuildStage::ContextGetting,
        BuildStage::ImageBuilding,
        BuildStage::ImagePushing,
        BuildStage::ImageSourceCreating,
        BuildStage::Finished,
        BuildStage::Failed,
    ];

    #[test]
    fn wire_values_match_status_strings() {
        for stage in ALL {
            assert_eq!(BuildStage::parse(stage.as_str()), Some(stage));
            assert_eq!(
                serde_json::to_value(stage).unwrap(),
                serde_json::Value::String(stage.to_string())
            );
        }
    }

    #[test]
    fn empty_and_unknown_values_are_not_stages() {
        assert_eq!(BuildStage::parse(""), None);
        assert_eq!(BuildStage::parse("getting"), None);
        assert_eq!(
            "Cooking".parse::<BuildStage>(),
            Err(UnknownStage("Cooking".to_string()))
        );
    }

    #[test]
    fn next_walks_the_pipeline_in_order_without_skipping() {
        let mut stage = BuildStage::INITIAL;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            visited.push(next);
            stage = next;
        }

        assert_eq!(visited, ALL[..5].to_vec());
        assert!(stage.is_terminal());
    }

    #[test]
    fn failed_is_absorbing() {
        assert!(BuildStage::Failed.is_terminal());
        assert_eq!(BuildStage::Failed.next(), None);
        assert!(!BuildStage::ImagePushing.is_terminal());
    }
}
