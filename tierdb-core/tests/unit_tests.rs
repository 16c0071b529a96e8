//! Unit tests for tierdb-core

use std::io::Write;

use tierdb_core::{
    utils::{align_up, format_bytes, is_aligned, is_power_of_two},
    AbortReason, Config, Error, IoResultExt, Metrics, Timestamp, TxnConfig,
};

mod types_tests {
    use super::*;

    #[test]
    fn test_timestamp_bounds() {
        assert!(Timestamp::ZERO < Timestamp::new(1));
        assert!(Timestamp::new(u64::MAX - 1) < Timestamp::MAX);
        assert_eq!(Timestamp::default(), Timestamp::ZERO);
    }

    #[test]
    fn test_timestamp_conversions() {
        let ts: Timestamp = 42u64.into();
        assert_eq!(ts.get(), 42);
        assert_eq!(ts.to_string(), "ts42");
    }

    #[test]
    fn test_timestamp_json() {
        let text = serde_json::to_string(&Timestamp::new(7)).unwrap();
        assert_eq!(text, "7");
        let back: Timestamp = serde_json::from_str(&text).unwrap();
        assert_eq!(back, Timestamp::new(7));
    }
}

mod error_tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = [
            (Error::ResourceExhausted { resource: "pages".into() }, "RESOURCE_EXHAUSTED"),
            (Error::AddressRace { addr: 0x200000 }, "ADDRESS_RACE"),
            (Error::InvalidHandle { message: "x".into() }, "INVALID_HANDLE"),
            (Error::conflict(AbortReason::WriteConflict), "CONFLICT_ABORT"),
            (Error::StaleSlot { thread_id: 0, slot_index: 0 }, "STALE_SLOT_ABORT"),
            (Error::Configuration { message: "x".into() }, "CONFIG_ERROR"),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "{}", err);
        }
    }

    #[test]
    fn test_only_conflicts_restart() {
        for reason in [
            AbortReason::WriteConflict,
            AbortReason::ReadTimestamp,
            AbortReason::LostUpdate,
            AbortReason::ReadValidation,
            AbortReason::PendingVersion,
            AbortReason::LoggerRefused,
        ] {
            assert!(Error::conflict(reason).is_abort());
        }

        let not_found = Error::RowNotFound {
            table: "t".into(),
            cf_id: 0,
            row_id: 3,
        };
        assert!(!not_found.is_abort());
        assert!(not_found.is_recoverable());
        assert!(!Error::ResourceExhausted { resource: "slots".into() }.is_abort());
    }

    #[test]
    fn test_io_errors() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.error_code(), "IO_ERROR");
        assert!(!err.is_recoverable());

        let res: std::io::Result<()> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.io_context(|| "mapping page 3".to_string()).unwrap_err();
        assert!(err.to_string().contains("mapping page 3"));
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::RowNotFound {
            table: "accounts".into(),
            cf_id: 1,
            row_id: 12,
        };
        let text = err.to_string();
        assert!(text.contains("accounts"));
        assert!(text.contains("12"));

        let err = Error::conflict(AbortReason::LoggerRefused);
        assert!(err.to_string().contains("commit logger"));
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "arena": {{ "filename_prefix": "pool_", "num_nodes": 2 }}, "txn": {{ "max_threads": 8 }} }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.arena.filename_prefix, "pool_");
        assert_eq!(config.arena.num_nodes, Some(2));
        assert_eq!(config.txn.max_threads, 8);
        assert_eq!(config.txn.max_accesses_per_txn, TxnConfig::default().max_accesses_per_txn);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_rejected_documents() {
        for text in [
            "not json",
            r#"{ "arena": { "filename_prefix": "a/b" } }"#,
            r#"{ "arena": { "num_nodes": 0 } }"#,
            r#"{ "txn": { "max_threads": 0 } }"#,
            r#"{ "txn": { "commit_slots_per_thread": 65537 } }"#,
            r#"{ "txn": { "access_bucket_size": 0 } }"#,
        ] {
            let err = Config::from_json(text).unwrap_err();
            assert_eq!(err.error_code(), "CONFIG_ERROR", "{}", text);
        }
    }

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }
}

mod metrics_tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.record_alloc(4);
        metrics.record_alloc(1);
        metrics.record_alloc_failure();
        metrics.record_commit();
        metrics.record_abort();
        metrics.record_abort();
        metrics.record_versions_reclaimed(5);

        let snap = metrics.snapshot();
        assert_eq!(snap.entries_allocated, 2);
        assert_eq!(snap.pages_allocated, 5);
        assert_eq!(snap.alloc_failures, 1);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.aborts, 2);
        assert_eq!(snap.versions_reclaimed, 5);
        assert_eq!(snap.fatal_inconsistencies, 0);
    }
}

mod utils_tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(200 * 1024 * 1024), "200 MB");
    }

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2 * 1024 * 1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(12));
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(4097, 4096), 8192);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8193, 4096));
    }
}
