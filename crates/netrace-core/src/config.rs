use std::{
    collections::{
        HashMap,
        hash_map::{IntoIter, Iter},
    },
    fmt::{Debug, Display},
    str::FromStr,
};

use thiserror::Error;

/// Per section configuration
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &str, value: impl Display, err: impl Display) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            err: err.to_string(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return a comma separed list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.get_separated_list(config_name, ',')
    }

    /// Return a list of values split on `separator`. Return empty vector if field is missing.
    pub fn get_separated_list<T>(
        &self,
        config_name: &str,
        separator: char,
    ) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(separator))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(item, config_name))
            .collect()
    }

    /// Return a comma separed list of values. Return default vector if field is missing.
    pub fn get_list_with_default<T>(
        &self,
        config_name: &str,
        default: Vec<T>,
    ) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        if self.inner.contains_key(config_name) {
            self.get_list(config_name)
        } else {
            Ok(default)
        }
    }

    /// Return an Iter to the underlying HashMap
    pub fn iter(&self) -> Iter<'_, String, String> {
        self.inner.iter()
    }

    /// Return an IntoIter to the underlying HashMap
    #[allow(clippy::should_implement_trait)]
    pub fn into_iter(self) -> IntoIter<String, String> {
        self.inner.into_iter()
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::invalid(config_name, value, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModuleConfig {
        ModuleConfig::from_iter([
            ("capacity", "512"),
            ("pids", "1, 2,,3"),
            ("meta", "sk_buff.mark == 1; sk_buff.len in {1,2}"),
            ("broken", "abc"),
        ])
    }

    #[test]
    fn typed_values() {
        let config = config();
        assert_eq!(config.required::<usize>("capacity"), Ok(512));
        assert_eq!(
            config.required::<usize>("missing"),
            Err(ConfigError::RequiredValue {
                field: "missing".to_string()
            })
        );
        assert_eq!(config.optional::<usize>("missing"), Ok(None));
        assert_eq!(config.with_default("missing", 7usize), Ok(7));
        assert_eq!(config.with_default("capacity", 7usize), Ok(512));
        assert!(matches!(
            config.with_default("broken", 1u32),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn lists() {
        let config = config();
        assert_eq!(config.get_list::<i32>("pids"), Ok(vec![1, 2, 3]));
        assert_eq!(config.get_list::<i32>("missing"), Ok(vec![]));
        assert_eq!(
            config.get_list_with_default::<i32>("missing", vec![9]),
            Ok(vec![9])
        );
        assert_eq!(
            config.get_separated_list::<String>("meta", ';'),
            Ok(vec![
                "sk_buff.mark == 1".to_string(),
                "sk_buff.len in {1,2}".to_string()
            ])
        );
    }
}
