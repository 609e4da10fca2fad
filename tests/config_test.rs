// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integration tests for CclConfig sources
//!
//! ```bash
//! cargo test --test config_test
//! ```

use std::collections::HashMap;

use ccl::coll::CollType;
use ccl::config::{CclConfig, ENV_ALGO_FALLBACK};
use ccl::error::Code;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_defaults() {
    let config = CclConfig::default();
    assert!(config.enable_algo_fallback);
    assert_eq!(config.local_poll_delay, 0);
    assert_eq!(config.strings(CollType::Bcast).main, None);
    assert_eq!(config.strings(CollType::Barrier).scaleout, None);

    println!("✓ Default config has no overrides");
}

#[test]
fn test_env_names() {
    assert_eq!(
        CclConfig::env_names(CollType::Bcast),
        ("CCL_BCAST".to_string(), "CCL_BCAST_SCALEOUT".to_string())
    );
    assert_eq!(
        CclConfig::env_names(CollType::ReduceScatter),
        (
            "CCL_REDUCE_SCATTER".to_string(),
            "CCL_REDUCE_SCATTER_SCALEOUT".to_string()
        )
    );

    println!("✓ Environment variable names follow the collective names");
}

#[test]
fn test_from_lookup() {
    let config = CclConfig::from_lookup(lookup_from(&[
        ("CCL_ALLGATHER", "naive:0-4095;ring:4096-max"),
        ("CCL_REDUCE_SCALEOUT", "tree"),
        (ENV_ALGO_FALLBACK, "0"),
    ]))
    .unwrap();

    assert_eq!(
        config.strings(CollType::Allgather).main.as_deref(),
        Some("naive:0-4095;ring:4096-max")
    );
    assert_eq!(config.strings(CollType::Allgather).scaleout, None);
    assert_eq!(config.strings(CollType::Reduce).scaleout.as_deref(), Some("tree"));
    assert!(!config.enable_algo_fallback);

    println!("✓ Config read through a lookup function");
}

#[test]
fn test_fallback_switch_values() {
    for (value, expected) in [("1", true), ("true", true), ("FALSE", false), ("off", false)] {
        let config = CclConfig::from_lookup(lookup_from(&[(ENV_ALGO_FALLBACK, value)])).unwrap();
        assert_eq!(config.enable_algo_fallback, expected, "value {}", value);
    }

    let err = CclConfig::from_lookup(lookup_from(&[(ENV_ALGO_FALLBACK, "maybe")])).unwrap_err();
    assert_eq!(err.code(), Code::ConfigurationError);

    println!("✓ Fallback switch parsing");
}

#[test]
fn test_json_round_trip() {
    let config = CclConfig::new()
        .with_main(CollType::Bcast, "naive:0-99;scatter_ring:100-max")
        .with_scaleout(CollType::Alltoall, "naive")
        .with_algo_fallback(false)
        .with_local_poll_delay(3);

    let json = config.to_json_string().unwrap();
    let parsed = CclConfig::from_json_str(&json).unwrap();
    assert_eq!(parsed, config);

    println!("✓ Config survives JSON");
}

#[test]
fn test_partial_json() {
    let config = CclConfig::from_json_str(r#"{"barrier": {"main": "ring"}}"#).unwrap();
    assert_eq!(config.strings(CollType::Barrier).main.as_deref(), Some("ring"));
    assert!(config.enable_algo_fallback);

    let err = CclConfig::from_json_str("{not json").unwrap_err();
    assert_eq!(err.code(), Code::SerializationError);

    println!("✓ Missing JSON fields take their defaults");
}

#[test]
fn test_logging_initializers_are_idempotent() {
    use ccl::util::logging::{
        init_logging, init_logging_for_rank, init_logging_with_level, LOG_ENV,
    };

    assert_eq!(LOG_ENV, "CCL_LOG");
    init_logging_for_rank(0, 4);
    init_logging_with_level(log::LevelFilter::Debug);
    init_logging();
    ccl::ccl_debug!("logging initialized for rank {}", 0);

    println!("✓ Repeated logging initialization is harmless");
}
