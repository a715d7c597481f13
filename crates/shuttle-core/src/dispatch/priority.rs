//! Priority routing by content path.
//!
//! Rules have the form `{prefix}[|{mainQueueMatcher}]={pathMatcher}`. A
//! package whose paths match a rule goes to the priority aliases
//! `{main}-{prefix}` of the main queues instead of the main queues
//! themselves. The optional main queue matcher limits which main queues get
//! an alias.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{DispatchingStrategy, fan_out};
use crate::app::QueueProvider;
use crate::domain::QueueItemStatus;
use crate::error::{Result, ShuttleError};
use crate::ports::DistributionPackage;

#[derive(Debug, Clone)]
pub struct PriorityRule {
    prefix: String,
    main_matcher: Option<Regex>,
    path_matcher: Regex,
}

impl PriorityRule {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn applies_to_queue(&self, main: &str) -> bool {
        self.main_matcher.as_ref().is_none_or(|re| re.is_match(main))
    }

    fn matches_path(&self, path: &str) -> bool {
        self.path_matcher.is_match(path)
    }

    fn alias(&self, main: &str) -> String {
        format!("{main}-{}", self.prefix)
    }
}

fn full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| ShuttleError::configuration(format!("invalid matcher '{pattern}': {err}")))
}

impl FromStr for PriorityRule {
    type Err = ShuttleError;

    fn from_str(rule: &str) -> Result<Self> {
        let (selector, path_pattern) = rule
            .split_once('=')
            .ok_or_else(|| ShuttleError::configuration(format!("priority rule '{rule}' has no '='")))?;
        let (prefix, main_pattern) = match selector.split_once('|') {
            Some((prefix, main)) => (prefix, Some(main)),
            None => (selector, None),
        };
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(ShuttleError::configuration(format!(
                "priority rule '{rule}' has an empty queue prefix"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            main_matcher: main_pattern.map(|p| full_match(p.trim())).transpose()?,
            path_matcher: full_match(path_pattern.trim())?,
        })
    }
}

pub struct PriorityQueueDispatchingStrategy {
    rules: Vec<PriorityRule>,
    main_queues: Vec<String>,
}

impl PriorityQueueDispatchingStrategy {
    pub fn new<R: AsRef<str>>(rules: &[R], main_queues: Vec<String>) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| rule.as_ref().parse())
            .collect::<Result<Vec<PriorityRule>>>()?;
        Ok(Self { rules, main_queues })
    }

    /// Target queues for a package with `paths`.
    pub fn route(&self, paths: &[String]) -> Vec<String> {
        let rule = self
            .rules
            .iter()
            .find(|rule| paths.iter().any(|path| rule.matches_path(path)));
        match rule {
            Some(rule) => {
                debug!(prefix = rule.prefix(), "priority rule matched");
                self.main_queues
                    .iter()
                    .map(|main| {
                        if rule.applies_to_queue(main) {
                            rule.alias(main)
                        } else {
                            main.clone()
                        }
                    })
                    .collect()
            }
            None => self.main_queues.clone(),
        }
    }

    /// Copy each main queue's endpoint to its priority aliases.
    pub fn rewrite_endpoints(&self, endpoints: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut rewritten = endpoints.clone();
        for main in &self.main_queues {
            let Some(endpoint) = endpoints.get(main) else {
                continue;
            };
            for rule in self.rules.iter().filter(|rule| rule.applies_to_queue(main)) {
                rewritten.insert(rule.alias(main), endpoint.clone());
            }
        }
        rewritten
    }
}

#[async_trait]
impl DispatchingStrategy for PriorityQueueDispatchingStrategy {
    async fn add(
        &self,
        package: &dyn DistributionPackage,
        provider: &dyn QueueProvider,
    ) -> Result<Vec<QueueItemStatus>> {
        let names = self.route(&package.info().paths());
        fan_out(package, package.to_queue_item(), provider, &names).await
    }

    fn queue_names(&self) -> Vec<String> {
        let mut names = self.main_queues.clone();
        for main in &self.main_queues {
            for rule in self.rules.iter().filter(|rule| rule.applies_to_queue(main)) {
                let alias = rule.alias(main);
                if !names.contains(&alias) {
                    names.push(alias);
                }
            }
        }
        names
    }
}
