//! Strategy manifest: identity, parameter grid and instrumentation hooks,
//! plus the descriptive metadata an ideator attaches to a candidate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// A tunable strategy parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub type_hint: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(default = "default_true")]
    pub tunable: bool,
}

fn default_true() -> bool {
    true
}

impl ParameterSpec {
    /// Check a candidate value against bounds and choices.
    pub fn admits(&self, value: &Value) -> bool {
        if let Some(choices) = &self.choices {
            if !choices.contains(value) {
                return false;
            }
        }
        if let Some(x) = value.as_f64() {
            if self.min_value.map(|lo| x < lo).unwrap_or(false) {
                return false;
            }
            if self.max_value.map(|hi| x > hi).unwrap_or(false) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    pub instrument_id: String,
    pub bar_type: String,
    #[serde(default = "default_warmup")]
    pub warmup: String,
    #[serde(default = "default_true")]
    pub subscribe_trade_ticks: bool,
    #[serde(default)]
    pub subscribe_quote_ticks: bool,
    #[serde(default = "default_true")]
    pub request_historical_bars: bool,
}

fn default_warmup() -> String {
    "3D".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSpec {
    /// RFC3339
    pub start: String,
    pub end: String,
    pub initial_cash: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default)]
    pub commission_bps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_symbol: Option<String>,
}

fn default_slippage_bps() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub strategy_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataSpec>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtest: Option<BacktestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_context: Option<String>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_author() -> String {
    "llm-agent".to_string()
}

/// The document a new experiment starts from.
///
/// Beyond identity, parameter grid and hook ids the pipeline treats the
/// contents as opaque; the remaining fields are carried for executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyManifest {
    pub metadata: StrategyMetadata,
    #[serde(default)]
    pub default_config: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameter_grid: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub instrumentation_hooks: Vec<String>,
}

impl StrategyManifest {
    pub fn strategy_id(&self) -> &str {
        &self.metadata.strategy_id
    }

    pub fn validate(&self) -> Result<()> {
        if self.metadata.strategy_id.trim().is_empty() {
            return Err(PipelineError::InvalidManifest("strategy_id is empty".into()));
        }
        let specs = &self.metadata.parameters;
        for (name, values) in &self.parameter_grid {
            if values.is_empty() {
                return Err(PipelineError::InvalidManifest(format!(
                    "parameter grid entry {name} has no candidate values"
                )));
            }
            if specs.is_empty() {
                continue;
            }
            let spec = specs.iter().find(|p| &p.name == name).ok_or_else(|| {
                PipelineError::InvalidManifest(format!("grid key {name} is not a declared parameter"))
            })?;
            if let Some(bad) = values.iter().find(|v| !spec.admits(v)) {
                return Err(PipelineError::InvalidManifest(format!(
                    "grid value {bad} for {name} is outside its declared bounds"
                )));
            }
        }
        if let Some(hook) = self.instrumentation_hooks.iter().find(|h| h.trim().is_empty()) {
            return Err(PipelineError::InvalidManifest(format!("blank instrumentation hook {hook:?}")));
        }
        Ok(())
    }

    /// Number of combinations `iter_parameter_grid` yields.
    pub fn grid_size(&self) -> usize {
        if self.parameter_grid.is_empty() {
            return 0;
        }
        self.parameter_grid.values().map(Vec::len).product()
    }

    /// Cartesian product of the grid in key order; the last key varies fastest.
    pub fn iter_parameter_grid(&self) -> GridIter<'_> {
        let axes: Vec<(&str, &[Value])> = self
            .parameter_grid
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        let done = axes.is_empty() || axes.iter().any(|(_, v)| v.is_empty());
        GridIter {
            cursor: vec![0; axes.len()],
            axes,
            done,
        }
    }

    /// Defaults with `overrides` layered on top.
    pub fn build_config(&self, overrides: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut config = self.default_config.clone();
        for (k, v) in overrides {
            config.insert(k.clone(), v.clone());
        }
        config
    }
}

pub struct GridIter<'a> {
    axes: Vec<(&'a str, &'a [Value])>,
    cursor: Vec<usize>,
    done: bool,
}

impl Iterator for GridIter<'_> {
    type Item = BTreeMap<String, Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self
            .axes
            .iter()
            .zip(&self.cursor)
            .map(|((name, values), &i)| (name.to_string(), values[i].clone()))
            .collect();

        // odometer step
        let mut pos = self.axes.len();
        loop {
            if pos == 0 {
                self.done = true;
                break;
            }
            pos -= 1;
            self.cursor[pos] += 1;
            if self.cursor[pos] < self.axes[pos].1.len() {
                break;
            }
            self.cursor[pos] = 0;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> StrategyManifest {
        serde_json::from_value(json!({
            "metadata": {
                "strategy_id": "ema_cross",
                "display_name": "EMA cross",
                "summary": "fast/slow crossover",
                "parameters": [
                    {"name": "fast", "type_hint": "int", "min_value": 2.0, "max_value": 50.0},
                    {"name": "slow", "type_hint": "int", "min_value": 10.0}
                ]
            },
            "default_config": {"fast": 10, "slow": 30, "trade_size": 1},
            "parameter_grid": {"fast": [5, 10], "slow": [20, 40, 60]},
            "instrumentation_hooks": ["on_bar"]
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let m = manifest();
        assert_eq!(m.metadata.version, "0.1.0");
        assert_eq!(m.metadata.author, "llm-agent");
        assert!(m.metadata.parameters[0].tunable);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_grid_is_cartesian_product() {
        let m = manifest();
        let combos: Vec<_> = m.iter_parameter_grid().collect();
        assert_eq!(combos.len(), 6);
        assert_eq!(m.grid_size(), 6);
        assert_eq!(combos[0]["fast"], json!(5));
        assert_eq!(combos[0]["slow"], json!(20));
        assert_eq!(combos[1]["slow"], json!(40));
        assert_eq!(combos[5]["fast"], json!(10));
        assert_eq!(combos[5]["slow"], json!(60));
    }

    #[test]
    fn test_empty_grid_yields_nothing() {
        let mut m = manifest();
        m.parameter_grid.clear();
        assert_eq!(m.iter_parameter_grid().count(), 0);
        assert_eq!(m.grid_size(), 0);
    }

    #[test]
    fn test_build_config_overrides() {
        let m = manifest();
        let mut overrides = BTreeMap::new();
        overrides.insert("fast".to_string(), json!(5));
        let cfg = m.build_config(&overrides);
        assert_eq!(cfg["fast"], json!(5));
        assert_eq!(cfg["slow"], json!(30));
        assert_eq!(cfg["trade_size"], json!(1));
    }

    #[test]
    fn test_validate_rejects_undeclared_and_out_of_bounds() {
        let mut m = manifest();
        m.parameter_grid.insert("lookback".into(), vec![json!(3)]);
        assert!(matches!(m.validate(), Err(PipelineError::InvalidManifest(_))));

        let mut m = manifest();
        m.parameter_grid.insert("fast".into(), vec![json!(1)]);
        assert!(m.validate().is_err());

        let mut m = manifest();
        m.parameter_grid.insert("slow".into(), vec![]);
        assert!(m.validate().is_err());

        let mut m = manifest();
        m.metadata.strategy_id = "  ".into();
        assert!(m.validate().is_err());
    }
}
