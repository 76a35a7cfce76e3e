// Data spaces: the axes a dataset's rows vary over
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Set of axes fixed at a row, one bit per axis in space order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Frequency(u32);

impl Frequency {
    pub fn contains_axis(self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }

    /// Indices of the fixed axes, in space order.
    pub fn axes(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |i| self.contains_axis(*i))
    }

    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

/// Structured enumeration of the axes a dataset's rows can belong to.
///
/// Axes are ordered; every combination of them is a frequency. Aliases give
/// names to combinations (e.g. `subject` = `group` + `member`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub name: String,
    axes: Vec<String>,
    #[serde(default)]
    aliases: BTreeMap<String, Frequency>,
}

impl Space {
    pub fn new(name: impl Into<String>, axes: &[&str]) -> StoreResult<Self> {
        if axes.is_empty() || axes.len() > 16 {
            return Err(StoreError::Configuration(format!(
                "a space needs between 1 and 16 axes, got {}",
                axes.len()
            )));
        }
        let axes: Vec<String> = axes.iter().map(|a| a.to_string()).collect();
        for (i, axis) in axes.iter().enumerate() {
            if axis.is_empty() || axis.contains('+') || axes[..i].contains(axis) {
                return Err(StoreError::Configuration(format!("invalid axis name '{axis}'")));
            }
        }
        Ok(Self {
            name: name.into(),
            axes,
            aliases: BTreeMap::new(),
        })
    }

    /// Name a combination of axes, e.g. `with_alias("subject", &["group", "member"])`.
    pub fn with_alias(mut self, alias: &str, axes: &[&str]) -> StoreResult<Self> {
        if self.axis_index(alias).is_some() {
            return Err(StoreError::Configuration(format!(
                "alias '{alias}' shadows an axis"
            )));
        }
        let mut bits = 0;
        for axis in axes {
            let index = self.axis_index(axis).ok_or_else(|| {
                StoreError::Configuration(format!("unknown axis '{axis}' in alias '{alias}'"))
            })?;
            bits |= 1 << index;
        }
        self.aliases.insert(alias.to_string(), Frequency(bits));
        Ok(self)
    }

    /// Four single-letter axes, `a` to `d`, as used by generated test datasets.
    pub fn test() -> Self {
        Self {
            name: "test".to_string(),
            axes: ["a", "b", "c", "d"].iter().map(|a| a.to_string()).collect(),
            aliases: BTreeMap::new(),
        }
    }

    /// Groups of subjects imaged at several visits.
    pub fn clinical() -> Self {
        let axes = ["group", "member", "visit"];
        let bits = |names: &[&str]| {
            Frequency(
                names
                    .iter()
                    .map(|n| 1 << axes.iter().position(|a| a == n).unwrap_or(0))
                    .fold(0, |acc, b| acc | b),
            )
        };
        let aliases = [
            ("constant", bits(&[])),
            ("subject", bits(&["group", "member"])),
            ("matchedpoint", bits(&["member", "visit"])),
            ("groupedvisit", bits(&["group", "visit"])),
            ("session", bits(&["group", "member", "visit"])),
        ];
        Self {
            name: "clinical".to_string(),
            axes: axes.iter().map(|a| a.to_string()).collect(),
            aliases: aliases
                .into_iter()
                .map(|(name, freq)| (name.to_string(), freq))
                .collect(),
        }
    }

    /// Built-in spaces by name.
    pub fn builtin(name: &str) -> StoreResult<Self> {
        match name {
            "test" => Ok(Self::test()),
            "clinical" => Ok(Self::clinical()),
            other => Err(StoreError::Configuration(format!("unknown space '{other}'"))),
        }
    }

    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a == name)
    }

    /// Every axis fixed: the frequency of leaf rows.
    pub fn leaf(&self) -> Frequency {
        Frequency((1 << self.axes.len()) - 1)
    }

    /// No axis fixed: the single dataset-wide row.
    pub fn root(&self) -> Frequency {
        Frequency(0)
    }

    /// All frequencies of the space, root first.
    pub fn frequencies(&self) -> impl Iterator<Item = Frequency> {
        (0..=self.leaf().0).map(Frequency)
    }

    /// Resolve an alias, an axis, `+`-joined axes, or a run of one-letter axes.
    pub fn parse_frequency(&self, name: &str) -> StoreResult<Frequency> {
        if let Some(freq) = self.aliases.get(name) {
            return Ok(*freq);
        }
        if let Some(index) = self.axis_index(name) {
            return Ok(Frequency(1 << index));
        }
        if name == "root" || name.is_empty() {
            return Ok(self.root());
        }

        let parts: Vec<String> = if name.contains('+') {
            name.split('+').map(str::to_string).collect()
        } else {
            name.chars().map(String::from).collect()
        };
        let mut bits = 0;
        for part in &parts {
            let index = self.axis_index(part).ok_or_else(|| {
                StoreError::Configuration(format!(
                    "'{name}' is not a frequency of the {} space",
                    self.name
                ))
            })?;
            bits |= 1 << index;
        }
        Ok(Frequency(bits))
    }

    /// Canonical name of a frequency; inverse of [`Space::parse_frequency`].
    pub fn frequency_name(&self, freq: Frequency) -> String {
        if let Some((alias, _)) = self.aliases.iter().find(|(_, f)| **f == freq) {
            return alias.clone();
        }
        if freq.is_root() {
            return "root".to_string();
        }
        let names: Vec<&str> = freq.axes().map(|i| self.axes[i].as_str()).collect();
        if self.axes.iter().all(|a| a.chars().count() == 1) {
            names.concat()
        } else {
            names.join("+")
        }
    }
}
