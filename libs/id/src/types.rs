//! Identifier definitions.

use crate::{define_id, define_opaque_id};

// =============================================================================
// Locally minted
// =============================================================================

define_id!(
    /// Identifies one launched task. Minted fresh for every launch.
    TaskId,
    "task"
);

// =============================================================================
// Minted by the cluster manager
// =============================================================================

define_opaque_id!(
    /// Registration id handed back by the manager on subscribe.
    FrameworkId
);
define_opaque_id!(
    /// Identifies one resource offer. Valid for a single offer round.
    OfferId
);
define_opaque_id!(
    /// Identifies the agent (host) an offer originates from.
    AgentId
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let s = id.to_string();
        let parsed: TaskId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("task_"));
    }

    #[test]
    fn test_task_id_invalid_prefix() {
        let result: Result<TaskId, _> = "app_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_task_id_missing_separator() {
        let result: Result<TaskId, _> = "task01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_task_id_bad_ulid() {
        let result: Result<TaskId, _> = "task_not-a-ulid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_task_id_serde() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_task_ids_sort_by_creation() {
        let a = TaskId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = TaskId::new();
        assert!(a < b);
    }

    #[test]
    fn test_opaque_id_keeps_value() {
        let id: OfferId = "5f3c-O12".parse().unwrap();
        assert_eq!(id.as_str(), "5f3c-O12");
        assert_eq!(id.to_string(), "5f3c-O12");
    }

    #[test]
    fn test_opaque_id_with_prefix() {
        assert_eq!(OfferId::with_prefix("local-offer", 7).as_str(), "local-offer-7");
    }

    #[test]
    fn test_opaque_id_rejects_empty() {
        assert!(AgentId::parse("").unwrap_err().is_empty());
        assert!(serde_json::from_str::<FrameworkId>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn opaque_id_accepts_any_nonempty(s in ".+") {
            let id = AgentId::parse(s.clone()).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }
    }
}
