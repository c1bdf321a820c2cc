use crate::error::CodingError;
use engagement_config::ValidatedConfig;
use engagement_ids::CodeSchemeId;
use engagement_vocab::Cleaner;
use std::collections::HashMap;

/// Cleaner bound to each auto-coded scheme.
#[derive(Debug, Clone, Default)]
pub struct CleanerRegistry {
    by_scheme: HashMap<CodeSchemeId, Cleaner>,
}

impl CleanerRegistry {
    /// Collect cleaners from every coding dataset. A scheme bound to two
    /// different cleaners is a configuration error.
    pub fn from_config(config: &ValidatedConfig) -> Result<Self, CodingError> {
        let mut registry = Self::default();
        for dataset in config.coding_datasets() {
            for scheme in &dataset.code_scheme_configurations {
                if let Some(cleaner) = &scheme.auto_coder {
                    registry.bind(scheme.code_scheme.clone(), cleaner.clone())?;
                }
            }
        }
        Ok(registry)
    }

    pub fn bind(&mut self, scheme_id: CodeSchemeId, cleaner: Cleaner) -> Result<(), CodingError> {
        match self.by_scheme.get(&scheme_id) {
            Some(existing) if existing != &cleaner => Err(CodingError::CleanerConflict {
                scheme_id,
                first: existing.to_string(),
                second: cleaner.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.by_scheme.insert(scheme_id, cleaner);
                Ok(())
            }
        }
    }

    pub fn get(&self, scheme_id: &CodeSchemeId) -> Option<&Cleaner> {
        self.by_scheme.get(scheme_id)
    }

    pub fn len(&self) -> usize {
        self.by_scheme.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scheme.is_empty()
    }
}
