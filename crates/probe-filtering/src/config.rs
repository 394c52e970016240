use std::sync::Arc;

use netrace_core::{
    ConfigError, ModuleConfig,
    filter::{Combinator, Filter, FilterSet},
};
use probe_common::{Pid, btf::Btf};

use crate::{
    FilterError,
    meta::{self, MetaFilter},
    process::ProcessFilter,
};

/// Separator of meta expressions, which can contain commas.
pub const META_SEPARATOR: char = ';';

/// [`Config`] is the user configuration of the filters attached to the
/// hooks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// How filters are combined.
    pub combinator: Combinator,
    /// Meta expressions, all of them are evaluated by a single meta filter.
    pub meta: Vec<String>,
    /// Processes of interest.
    pub pid_targets: Vec<Pid>,
}

/// Extract Config from configuration file
impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let pid_targets = config
            .get_list::<i32>("pids")?
            .into_iter()
            .map(|pid| match pid {
                pid if pid > 0 => Ok(Pid::from_raw(pid)),
                pid => Err(ConfigError::invalid("pids", pid, "pids must be positive")),
            })
            .collect::<Result<_, _>>()?;

        Ok(Config {
            combinator: config.with_default("combinator", Combinator::And)?,
            meta: config.get_separated_list("meta", META_SEPARATOR)?,
            pid_targets,
        })
    }
}

impl Config {
    /// Compile the configured filters into a [`FilterSet`].
    pub fn build(&self, btf: &Btf) -> Result<FilterSet, FilterError> {
        let mut filters: Vec<Arc<dyn Filter>> = Vec::new();

        if !self.meta.is_empty() {
            let mut fields = Vec::with_capacity(self.meta.len());
            let mut targets = Vec::with_capacity(self.meta.len());
            for (index, expression) in self.meta.iter().enumerate() {
                let (field, target) =
                    meta::compile(btf, expression, index).map_err(|source| FilterError::Meta {
                        expression: expression.clone(),
                        source,
                    })?;
                log::debug!("meta filter {index}: {expression} -> {:?}", field.loads());
                fields.push(field);
                targets.push(target);
            }
            filters.push(Arc::new(MetaFilter::new(fields, targets)?));
        }

        if !self.pid_targets.is_empty() {
            filters.push(Arc::new(ProcessFilter::new(&self.pid_targets)?));
        }

        let set = FilterSet::new(self.combinator, filters)?;
        log::debug!("filters {:#x?} combined with {}", set.tags(), set.combinator());
        Ok(set)
    }
}
