use crate::core::{init, ErrorCode, InitFlags};
use crate::scanner::{free_settings, Engine, EngineField, EngineState, FieldValue, Settings};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn new_engine() -> Engine {
        init(InitFlags::DEFAULT).unwrap();
        Engine::new().unwrap()
    }

    // (field, read-only, zero allowed, 32 bits wide)
    const NUM_FIELDS: &[(EngineField, bool, bool, bool)] = &[
        (EngineField::MaxScansize, false, true, false),
        (EngineField::MaxFilesize, false, true, false),
        (EngineField::MaxRecursion, false, false, true),
        (EngineField::MaxFiles, false, true, true),
        (EngineField::MinCcCount, false, true, true),
        (EngineField::MinSsnCount, false, true, true),
        (EngineField::DbOptions, true, true, true),
        (EngineField::DbVersion, true, true, true),
        (EngineField::AcOnly, false, true, true),
        (EngineField::AcMindepth, false, true, true),
        (EngineField::AcMaxdepth, false, true, true),
        (EngineField::Keeptmp, false, true, true),
        (EngineField::BytecodeSecurity, false, true, true),
        (EngineField::BytecodeTimeout, false, true, true),
        (EngineField::BytecodeMode, false, true, true),
    ];

    const NUM_VALUES: &[u64] = &[
        0,
        1,
        2,
        1 << 6,
        (1 << 6) - 1,
        1 << 16,
        (1 << 16) - 1,
        (1 << 16) + 1,
        (1 << 32) - 1,
        1 << 32,
        (1 << 32) + 1,
        (1 << 48) - 1,
        1 << 48,
        (1 << 48) + 1,
        u64::MAX,
    ];

    const STRING_FIELDS: &[EngineField] = &[EngineField::PuaCategories, EngineField::Tmpdir];

    #[test]
    fn test_get_set_num() {
        let engine = new_engine();

        for &(field, read_only, zero_ok, narrow) in NUM_FIELDS {
            for &value in NUM_VALUES {
                if read_only {
                    let first = engine.get_num(field).unwrap();
                    assert_eq!(engine.get_num(field).unwrap(), first, "{} is not stable", field);
                    assert_eq!(engine.set_num(field, value).unwrap_err().code(), ErrorCode::Earg);
                    continue;
                }
                if narrow && value > u32::MAX as u64 {
                    let err = engine.set_num(field, value).unwrap_err();
                    assert_eq!(err.code(), ErrorCode::Earg, "{} accepted {}", field, value);
                    continue;
                }
                if !zero_ok && value == 0 {
                    continue;
                }
                engine.set_num(field, value).unwrap();
                assert_eq!(engine.get_num(field).unwrap(), value, "{}", field);
            }
        }
        engine.free().unwrap();
    }

    #[test]
    fn test_zero_rejected_where_forbidden() {
        let engine = new_engine();
        let before = engine.get_num(EngineField::MaxRecursion).unwrap();
        assert_eq!(
            engine.set_num(EngineField::MaxRecursion, 0).unwrap_err().code(),
            ErrorCode::Earg
        );
        assert_eq!(engine.get_num(EngineField::MaxRecursion).unwrap(), before);
        engine.free().unwrap();
    }

    #[test]
    fn test_kind_mismatch() {
        let engine = new_engine();
        assert_eq!(engine.set_num(EngineField::Tmpdir, 1).unwrap_err().code(), ErrorCode::Earg);
        assert_eq!(engine.get_num(EngineField::Tmpdir).unwrap_err().code(), ErrorCode::Earg);
        assert_eq!(
            engine.set_string(EngineField::MaxFiles, "1").unwrap_err().code(),
            ErrorCode::Earg
        );
        assert_eq!(engine.get_string(EngineField::MaxFiles).unwrap_err().code(), ErrorCode::Earg);
        engine.free().unwrap();
    }

    #[test]
    fn test_get_set_string() {
        let engine = new_engine();
        let values = ["", "abc", "ABcd", "123abc", "αβδ", "ΑΒΔ"];

        for &field in STRING_FIELDS {
            for value in values {
                engine.set_string(field, value).unwrap();
                assert_eq!(engine.get_string(field).unwrap(), value);
            }
        }
        engine.free().unwrap();
    }

    #[test]
    fn test_get_set_string_size() {
        let engine = new_engine();
        let sizes = [32usize, 64, 128, 256, 512, 1024, 2048, 8192, 16384, 32768];

        for &field in STRING_FIELDS {
            for size in sizes {
                for len in [size - 1, size, size + 1] {
                    let value = "a".repeat(len);
                    engine.set_string(field, &value).unwrap();
                    let back = engine.get_string(field).unwrap();
                    assert_eq!(back.len(), len);
                    assert_eq!(back, value);
                }
            }
        }
        engine.free().unwrap();
    }

    #[test]
    fn test_new_free() {
        let engine = new_engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(engine.free().is_ok());
        assert_eq!(engine.state(), EngineState::Freed);
    }

    #[test]
    fn test_freed_engine_rejects_everything() {
        let engine = new_engine();
        engine.free().unwrap();

        assert_eq!(engine.free().unwrap_err().code(), ErrorCode::Estate);
        assert_eq!(engine.addref().unwrap_err().code(), ErrorCode::Estate);
        assert_eq!(engine.get_num(EngineField::MaxFiles).unwrap_err().code(), ErrorCode::Estate);
        assert_eq!(
            engine.set_num(EngineField::MaxFiles, 1).unwrap_err().code(),
            ErrorCode::Estate
        );
        assert_eq!(engine.compile().unwrap_err().code(), ErrorCode::Estate);
        assert_eq!(engine.copy_settings().unwrap_err().code(), ErrorCode::Estate);
        assert_eq!(engine.ref_count(), 0);
    }

    #[test]
    fn test_settings() {
        let engine = new_engine();

        let settings = engine.copy_settings().unwrap();
        assert!(!settings.is_empty());
        engine.apply_settings(&settings).unwrap();
        engine.apply_settings(&settings).unwrap();
        assert_eq!(engine.copy_settings().unwrap(), settings);
        free_settings(settings).unwrap();
        engine.free().unwrap();
    }

    #[test]
    fn test_settings_move_between_engines() {
        let source = new_engine();
        source.set_num(EngineField::MaxFiles, 77).unwrap();
        source.set_string(EngineField::Tmpdir, "/var/tmp/scan").unwrap();
        let settings = source.copy_settings().unwrap();
        source.free().unwrap();

        let target = new_engine();
        target.apply_settings(&settings).unwrap();
        assert_eq!(target.get_num(EngineField::MaxFiles).unwrap(), 77);
        assert_eq!(target.get_string(EngineField::Tmpdir).unwrap(), "/var/tmp/scan");
        assert_eq!(target.state(), EngineState::Configured);
        free_settings(settings).unwrap();
        target.free().unwrap();
    }

    #[test]
    fn test_edited_settings_apply() {
        let engine = new_engine();
        let mut settings = engine.copy_settings().unwrap();
        settings.set(EngineField::MaxScansize, FieldValue::Num(1 << 40)).unwrap();
        assert!(settings.set(EngineField::MaxRecursion, FieldValue::Num(0)).is_err());

        engine.apply_settings(&settings).unwrap();
        assert_eq!(engine.get_num(EngineField::MaxScansize).unwrap(), 1 << 40);
        engine.free().unwrap();
    }

    #[test]
    fn test_compile() {
        let engine = new_engine();
        engine.compile().unwrap();
        assert_eq!(engine.state(), EngineState::Compiled);
        assert_eq!(engine.signature_count().unwrap(), 0);
        engine.free().unwrap();
    }

    #[test]
    fn test_compiled_engine_is_frozen() {
        let engine = new_engine();
        engine.set_num(EngineField::MaxFiles, 5).unwrap();
        let settings = engine.copy_settings().unwrap();
        engine.compile().unwrap();

        assert_eq!(
            engine.set_num(EngineField::MaxFiles, 6).unwrap_err().code(),
            ErrorCode::Estate
        );
        assert_eq!(
            engine.set_string(EngineField::Tmpdir, "/tmp").unwrap_err().code(),
            ErrorCode::Estate
        );
        assert_eq!(engine.apply_settings(&settings).unwrap_err().code(), ErrorCode::Estate);
        assert_eq!(engine.compile().unwrap_err().code(), ErrorCode::Estate);

        // Reads still work after compile.
        assert_eq!(engine.get_num(EngineField::MaxFiles).unwrap(), 5);
        assert!(engine.get_num(EngineField::DbOptions).is_ok());
        engine.free().unwrap();
    }

    #[test]
    fn test_compile_rejects_inverted_depths() {
        let engine = new_engine();
        engine.set_num(EngineField::AcMindepth, 5).unwrap();
        engine.set_num(EngineField::AcMaxdepth, 2).unwrap();
        assert_eq!(engine.compile().unwrap_err().code(), ErrorCode::Earg);
        assert_eq!(engine.state(), EngineState::Configured);
        engine.free().unwrap();
    }

    #[test]
    fn test_addref() {
        let engine = new_engine();
        engine.addref().unwrap();
        assert_eq!(engine.ref_count(), 2);

        engine.free().unwrap();
        assert_eq!(engine.ref_count(), 1);
        assert_ne!(engine.state(), EngineState::Freed);
        engine.set_num(EngineField::MaxFiles, 9).unwrap();

        engine.free().unwrap();
        assert_eq!(engine.state(), EngineState::Freed);
    }

    #[test]
    fn test_free_count_matches_addrefs() {
        let engine = new_engine();
        for _ in 0..4 {
            engine.addref().unwrap();
        }
        for _ in 0..5 {
            assert_ne!(engine.state(), EngineState::Freed);
            engine.free().unwrap();
        }
        assert_eq!(engine.state(), EngineState::Freed);
        assert!(engine.free().is_err());
    }

    #[test]
    fn test_scan_before_compile_is_a_state_error() {
        let engine = new_engine();
        let err = engine
            .scan_buffer(b"data", &crate::scanner::ScanOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Estate);
        engine.free().unwrap();
    }

    proptest! {
        #[test]
        fn prop_narrow_fields_reject_wide_values(value in (u32::MAX as u64 + 1)..=u64::MAX) {
            let engine = new_engine();
            for &(field, read_only, _, narrow) in NUM_FIELDS {
                if narrow && !read_only {
                    prop_assert_eq!(engine.set_num(field, value).unwrap_err().code(), ErrorCode::Earg);
                }
            }
            engine.free().unwrap();
        }

        #[test]
        fn prop_wide_fields_round_trip(value in any::<u64>()) {
            let engine = new_engine();
            engine.set_num(EngineField::MaxScansize, value).unwrap();
            engine.set_num(EngineField::MaxFilesize, value).unwrap();
            prop_assert_eq!(engine.get_num(EngineField::MaxScansize).unwrap(), value);
            prop_assert_eq!(engine.get_num(EngineField::MaxFilesize).unwrap(), value);
            engine.free().unwrap();
        }

        #[test]
        fn prop_strings_round_trip(value in ".*") {
            let engine = new_engine();
            engine.set_string(EngineField::PuaCategories, &value).unwrap();
            prop_assert_eq!(engine.get_string(EngineField::PuaCategories).unwrap(), value);
            engine.free().unwrap();
        }
    }
}
