use std::collections::HashMap;

use anyhow::Result;
use fxtrace::{BailOutPolicy, Discipline, TraceConfig, TraceError};

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_trace_real_data_strictly() {
    let config = TraceConfig::default();
    assert_eq!(config.discipline, Discipline::Concrete);
    assert!(!config.pre_dispatch);
    assert!(!config.record_module_stack);
    assert!(config.error_on_data_dependent_ops);
    assert_eq!(config.bail_out, BailOutPolicy::Delegate);
    assert!(!config.emulate_precision_casts);
}

#[test]
fn environment_keys_override_defaults() -> Result<()> {
    let config = TraceConfig::from_lookup(lookup_from(&[
        ("FXTRACE_DISCIPLINE", "Symbolic"),
        ("FXTRACE_PRE_DISPATCH", "yes"),
        ("FXTRACE_STRICT_DATA_DEPENDENT", "0"),
        ("FXTRACE_RECORD_MODULE_STACK", "on"),
        ("FXTRACE_BAIL_OUT", "error"),
        ("FXTRACE_EMULATE_PRECISION_CASTS", "true"),
    ]))?;
    assert_eq!(config.discipline, Discipline::Symbolic);
    assert!(config.pre_dispatch);
    assert!(!config.error_on_data_dependent_ops);
    assert!(config.record_module_stack);
    assert_eq!(config.bail_out, BailOutPolicy::Propagate);
    assert!(config.emulate_precision_casts);
    Ok(())
}

#[test]
fn discipline_accepts_its_aliases() -> Result<()> {
    for (raw, expected) in [
        ("real", Discipline::Concrete),
        ("concrete", Discipline::Concrete),
        ("fake", Discipline::Simulated),
        (" simulated ", Discipline::Simulated),
        ("symbolic", Discipline::Symbolic),
    ] {
        assert_eq!(raw.parse::<Discipline>()?, expected, "{raw}");
    }
    assert_eq!(Discipline::Simulated.to_string(), "fake");
    assert!(Discipline::Symbolic.is_simulated());
    assert!(!Discipline::Concrete.is_simulated());
    Ok(())
}

#[test]
fn unknown_values_are_config_errors() {
    let err =
        TraceConfig::from_lookup(lookup_from(&[("FXTRACE_DISCIPLINE", "eager")])).unwrap_err();
    assert!(matches!(err, TraceError::Config(ref msg) if msg.contains("eager")), "{err}");

    let err = TraceConfig::from_lookup(lookup_from(&[("FXTRACE_BAIL_OUT", "ignore")])).unwrap_err();
    assert!(matches!(err, TraceError::Config(_)), "{err}");
}

#[test]
fn json_fills_missing_fields_with_defaults() -> Result<()> {
    let config =
        TraceConfig::from_json_str(r#"{"discipline": "fake", "preserve_node_meta": true}"#)?;
    assert_eq!(config.discipline, Discipline::Simulated);
    assert!(config.preserve_node_meta);
    assert!(config.error_on_data_dependent_ops);

    let rendered = serde_json::to_value(&config)?;
    assert_eq!(rendered["discipline"], "fake");
    assert_eq!(rendered["bail_out"], "delegate");

    let err = TraceConfig::from_json_str(r#"{"discipline": "lazy"}"#).unwrap_err();
    assert!(matches!(err, TraceError::Json(_)), "{err}");
    Ok(())
}

#[test]
fn recording_options_mirror_the_config() {
    let config = TraceConfig {
        pre_dispatch: true,
        bail_out: BailOutPolicy::Propagate,
        preserve_node_meta: true,
        ..TraceConfig::default()
    };
    let options = config.recording_options();
    assert!(options.pre_dispatch);
    assert!(options.error_on_data_dependent_ops);
    assert_eq!(options.bail_out, BailOutPolicy::Propagate);
    assert!(!options.emulate_precision_casts);
    assert!(options.preserve_node_meta);
}
