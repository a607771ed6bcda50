use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which rule produced an evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EvaluationSource {
    Default,
    Override,
    Targeting,
    Rollout,
    Schedule,
    Disabled,
    /// The flag could not be read; the value is the last one seen by this
    /// instance, or the type's false/zero default if there was none.
    StoreUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_display() {
        assert_eq!(EvaluationSource::Default.to_string(), "default");
        assert_eq!(EvaluationSource::Targeting.to_string(), "targeting");
        assert_eq!(
            EvaluationSource::StoreUnavailable.to_string(),
            "store_unavailable"
        );
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&EvaluationSource::StoreUnavailable).unwrap();
        assert_eq!(json, "\"store_unavailable\"");
        assert_eq!(
            EvaluationSource::from_str("override").unwrap(),
            EvaluationSource::Override
        );
    }
}
