use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dispatch::RecordingOptions;
use crate::env::{self, parse_bool};
use crate::error::{TraceError, TraceResult};

/// How placeholder values are produced for a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Discipline {
    /// Inputs are used as given and every kernel runs on real data.
    #[default]
    Concrete,
    /// Inputs are replaced by data-less tensors with static shapes.
    Simulated,
    /// Like `Simulated`, but extents and plain integer inputs become symbols.
    Symbolic,
}

impl Discipline {
    pub fn as_str(self) -> &'static str {
        match self {
            Discipline::Concrete => "real",
            Discipline::Simulated => "fake",
            Discipline::Symbolic => "symbolic",
        }
    }

    pub fn is_simulated(self) -> bool {
        !matches!(self, Discipline::Concrete)
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Discipline {
    type Err = TraceError;

    fn from_str(raw: &str) -> TraceResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "real" | "concrete" => Ok(Discipline::Concrete),
            "fake" | "simulated" => Ok(Discipline::Simulated),
            "symbolic" => Ok(Discipline::Symbolic),
            other => Err(TraceError::Config(format!(
                "unknown tracing discipline '{other}', expected real, fake or symbolic"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Discipline {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Discipline {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// What the recording layer does with arguments whose tensor type it does not understand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BailOutPolicy {
    /// Decline the call so a registered subclass handler can take it.
    #[default]
    Delegate,
    /// Fail immediately with an unrecognized-input error.
    Propagate,
}

impl BailOutPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            BailOutPolicy::Delegate => "delegate",
            BailOutPolicy::Propagate => "propagate",
        }
    }
}

impl FromStr for BailOutPolicy {
    type Err = TraceError;

    fn from_str(raw: &str) -> TraceResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "delegate" => Ok(BailOutPolicy::Delegate),
            "propagate" | "error" => Ok(BailOutPolicy::Propagate),
            other => Err(TraceError::Config(format!(
                "unknown bail-out policy '{other}', expected delegate or propagate"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for BailOutPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for BailOutPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Settings for one [`TraceSession`](super::TraceSession).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub discipline: Discipline,
    /// Record before autograd lowering: side-effectful calls stay in the graph.
    pub pre_dispatch: bool,
    /// Attach the module path stack to nodes when a module root is registered.
    pub record_module_stack: bool,
    /// Let the simulation layer convert real tensors it meets instead of failing.
    pub allow_non_simulated_inputs: bool,
    pub error_on_data_dependent_ops: bool,
    pub bail_out: BailOutPolicy,
    /// Flag low-precision pointwise results so a backend can replicate eager rounding.
    pub emulate_precision_casts: bool,
    /// Attach the outermost intercepted operator to every node created beneath it.
    pub preserve_node_meta: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            discipline: Discipline::Concrete,
            pre_dispatch: false,
            record_module_stack: false,
            allow_non_simulated_inputs: false,
            error_on_data_dependent_ops: true,
            bail_out: BailOutPolicy::Delegate,
            emulate_precision_casts: false,
            preserve_node_meta: false,
        }
    }
}

impl TraceConfig {
    pub fn with_discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    pub fn from_json_str(raw: &str) -> TraceResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Defaults overridden by the `FXTRACE_*` environment variables.
    pub fn from_env() -> TraceResult<Self> {
        Self::from_lookup(env::var)
    }

    /// Defaults overridden by whatever `lookup` returns for the `FXTRACE_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TraceResult<Self> {
        let mut config = TraceConfig::default();
        if let Some(raw) = lookup("FXTRACE_DISCIPLINE") {
            config.discipline = raw.parse()?;
        }
        if let Some(raw) = lookup("FXTRACE_PRE_DISPATCH") {
            config.pre_dispatch = parse_bool(&raw);
        }
        if let Some(raw) = lookup("FXTRACE_STRICT_DATA_DEPENDENT") {
            config.error_on_data_dependent_ops = parse_bool(&raw);
        }
        if let Some(raw) = lookup("FXTRACE_RECORD_MODULE_STACK") {
            config.record_module_stack = parse_bool(&raw);
        }
        if let Some(raw) = lookup("FXTRACE_BAIL_OUT") {
            config.bail_out = raw.parse()?;
        }
        if let Some(raw) = lookup("FXTRACE_EMULATE_PRECISION_CASTS") {
            config.emulate_precision_casts = parse_bool(&raw);
        }
        Ok(config)
    }

    pub fn recording_options(&self) -> RecordingOptions {
        RecordingOptions {
            pre_dispatch: self.pre_dispatch,
            error_on_data_dependent_ops: self.error_on_data_dependent_ops,
            bail_out: self.bail_out,
            emulate_precision_casts: self.emulate_precision_casts,
            preserve_node_meta: self.preserve_node_meta,
        }
    }
}
