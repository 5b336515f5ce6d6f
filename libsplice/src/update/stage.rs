use serde::{Deserialize, Serialize};

/// Lifecycle of an update. It only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Preparing,
    Applied,
    Reversed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::Applied => "applied",
            Stage::Reversed => "reversed",
        }
    }

    /// Changes may only be added or removed before the first apply
    pub fn accepts_changes(&self) -> bool {
        *self == Stage::Preparing
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Stage::default(), Stage::Preparing);
        assert_eq!(Stage::Applied.to_string(), "applied");
        assert_eq!(serde_json::to_string(&Stage::Reversed).unwrap(), "\"reversed\"");
        assert!(!Stage::Applied.accepts_changes());
    }
}
