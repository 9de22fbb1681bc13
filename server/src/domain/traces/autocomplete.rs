//! Autocomplete tag lookups

use std::sync::Arc;

use crate::call::Call;
use crate::core::constants::MAX_NAMES;
use crate::data::schema::AUTOCOMPLETE_TAGS;
use crate::data::session::{Session, Statement};

/// Values seen for the configured autocomplete keys
#[derive(Clone)]
pub struct AutocompleteTags {
    session: Arc<dyn Session>,
    keys: Vec<String>,
    enabled: bool,
}

impl AutocompleteTags {
    pub fn new(session: Arc<dyn Session>, keys: Vec<String>, enabled: bool) -> Self {
        Self {
            session,
            keys,
            enabled,
        }
    }

    pub fn get_keys(&self) -> Call<Vec<String>> {
        if !self.enabled {
            return Call::empty_list();
        }
        Call::create(self.keys.clone())
    }

    /// Distinct values recorded for `key`, sorted
    pub fn get_values(&self, key: &str) -> Call<Vec<String>> {
        let key = key.trim();
        if !self.enabled || key.is_empty() {
            return Call::empty_list();
        }
        let session = self.session.clone();
        let partition = Some(key.to_string());
        Call::new("select-autocomplete-values", move |_| {
            let session = session.clone();
            let statement = Statement::SelectNames {
                table: AUTOCOMPLETE_TAGS,
                partition: partition.clone(),
                limit: MAX_NAMES,
            };
            async move {
                let backend = session.backend_name();
                let mut values = session.execute(statement).await?.into_names(backend)?;
                values.sort();
                Ok(values)
            }
        })
    }
}
