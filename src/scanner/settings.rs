use crate::core::{Error, Result, FUNCTIONALITY_LEVEL};
use crate::scanner::fields::{EngineField, FieldValue};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Detached snapshot of an engine's field values.
///
/// Produced by `Engine::copy_settings`, consumed by `Engine::apply_settings`
/// on the same or another engine. Its lifetime is independent of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    flevel: u32,
    values: BTreeMap<EngineField, FieldValue>,
}

impl Settings {
    pub(crate) fn from_values(values: BTreeMap<EngineField, FieldValue>) -> Self {
        Self {
            flevel: FUNCTIONALITY_LEVEL,
            values,
        }
    }

    /// Snapshot holding only the given writable values, stamped for this
    /// engine generation. Every entry is validated.
    pub fn with_values<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (EngineField, FieldValue)>,
    {
        let mut settings = Self::from_values(BTreeMap::new());
        for (field, value) in values {
            settings.set(field, value)?;
        }
        Ok(settings)
    }

    pub fn functionality_level(&self) -> u32 {
        self.flevel
    }

    pub fn get(&self, field: EngineField) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn set(&mut self, field: EngineField, value: FieldValue) -> Result<()> {
        field.spec().validate(field, &value)?;
        self.values.insert(field, value);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (EngineField, &FieldValue)> {
        self.values.iter().map(|(f, v)| (*f, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("cannot write settings {:?}", path))?;
        Ok(())
    }

    /// Reads a snapshot written by [`Settings::save`]. Every writable entry
    /// is validated.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("cannot read settings {:?}", path))?;
        let settings: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse settings {:?}", path))?;
        settings
            .writable_entries()
            .with_context(|| format!("invalid settings in {:?}", path))?;
        Ok(settings)
    }

    /// Checks that the snapshot can be applied to an engine of this
    /// generation and returns the writable entries to apply.
    pub(crate) fn writable_entries(&self) -> Result<Vec<(EngineField, FieldValue)>> {
        if self.flevel != FUNCTIONALITY_LEVEL {
            return Err(Error::arg(format!(
                "settings were taken from functionality level {}, engine is {}",
                self.flevel, FUNCTIONALITY_LEVEL
            )));
        }

        let mut entries = Vec::with_capacity(self.values.len());
        for (field, value) in &self.values {
            if field.is_read_only() {
                continue;
            }
            field.spec().validate(*field, value)?;
            entries.push((*field, value.clone()));
        }
        Ok(entries)
    }
}

/// Releases a snapshot. Ownership makes a second release impossible.
pub fn free_settings(settings: Settings) -> Result<()> {
    log::trace!("releasing settings snapshot with {} fields", settings.len());
    drop(settings);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;

    #[test]
    fn test_with_values_validates() {
        let settings = Settings::with_values(vec![
            (EngineField::MaxFiles, FieldValue::Num(50)),
            (EngineField::Tmpdir, FieldValue::from("/tmp/scan")),
        ])
        .unwrap();
        assert_eq!(settings.len(), 2);
        assert_eq!(settings.get(EngineField::MaxFiles), Some(&FieldValue::Num(50)));

        let err = Settings::with_values(vec![(EngineField::MaxRecursion, FieldValue::Num(0))]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Earg);

        let err = Settings::with_values(vec![(EngineField::DbVersion, FieldValue::Num(1))]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Earg);
    }

    #[test]
    fn test_foreign_generation_is_rejected() {
        let mut settings = Settings::with_values(vec![(EngineField::MaxFiles, FieldValue::Num(5))]).unwrap();
        settings.flevel = FUNCTIONALITY_LEVEL + 1;
        assert_eq!(settings.writable_entries().unwrap_err().code(), ErrorCode::Earg);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.yaml");
        let settings = Settings::with_values(vec![(EngineField::MaxFiles, FieldValue::Num(12))]).unwrap();
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);

        std::fs::write(&path, format!("flevel: {}\nvalues:\n  max_recursion: 0\n", FUNCTIONALITY_LEVEL)).unwrap();
        assert!(Settings::load(&path).is_err());
        assert!(Settings::load(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let settings = Settings::with_values(vec![
            (EngineField::MaxScansize, FieldValue::Num(u64::MAX)),
            (EngineField::PuaCategories, FieldValue::from(".Packer")),
            (EngineField::Tmpdir, FieldValue::from("αβδ")),
        ])
        .unwrap();
        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(yaml.contains("max_scansize"));
        let back: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, settings);
        assert!(free_settings(back).is_ok());
    }
}
