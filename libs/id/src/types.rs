//! ID definitions.

use crate::{define_id, define_name_id};

// =============================================================================
// Master-generated
// =============================================================================

define_id!(FrameworkId, "fw");
define_id!(SlaveId, "slave");
define_id!(OfferId, "offer");
define_id!(MasterId, "master");

// =============================================================================
// Framework-chosen
// =============================================================================

define_name_id!(TaskId);
define_name_id!(ExecutorId);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_framework_id_roundtrip() {
        let id = FrameworkId::new();
        let parsed: FrameworkId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("fw_"));
    }

    #[test]
    fn test_slave_id_rejects_framework_prefix() {
        let fw = FrameworkId::new().to_string();
        let err = fw.parse::<SlaveId>().unwrap_err();
        assert!(matches!(err, IdError::InvalidPrefix { expected: "slave", .. }));
    }

    #[test]
    fn test_offer_id_missing_separator() {
        let err = "offer01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<OfferId>().unwrap_err();
        assert_eq!(err, IdError::MissingSeparator);
    }

    #[test]
    fn test_offer_id_invalid_ulid() {
        let err = "offer_nope".parse::<OfferId>().unwrap_err();
        assert!(matches!(err, IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!("".parse::<FrameworkId>().unwrap_err().is_empty());
        assert!(TaskId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_task_id_rejects_control_characters() {
        let err = TaskId::parse("task\n1").unwrap_err();
        assert!(err.is_name_error());
    }

    #[test]
    fn test_task_id_json_is_plain_string() {
        let id = TaskId::parse("web-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"web-1\"");
        let back: TaskId = serde_json::from_str("\"web-1\"").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ExecutorId>("\"\"").is_err());
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = OfferId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = OfferId::new();
        assert!(first < second);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            FrameworkId::PREFIX,
            SlaveId::PREFIX,
            OfferId::PREFIX,
            MasterId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn test_name_ids_keep_printable_text(s in "[a-zA-Z0-9._-]{1,32}") {
            let id = ExecutorId::parse(s.clone()).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }
    }
}
