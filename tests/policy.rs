//! Retry and criticality policy tests.

use std::time::Duration;

use reelforge::core::{criticality_of, fallback_output, Criticality, Manifest, RetryPolicy};

#[test]
fn test_linear_backoff_grows_per_attempt() {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1000,
    };

    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
}

#[test]
fn test_retry_bound() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 3);

    assert!(policy.should_retry(1));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
}

#[test]
fn test_retry_config_parsed_from_manifest() {
    let yaml = r#"
name: custom-retries
step_timeout_seconds: 30
steps:
  - name: score
    agent: composer
    timeout_seconds: 10
    retry:
      max_attempts: 5
      base_delay_ms: 250
    input:
      mood: calm
"#;
    let manifest = Manifest::from_yaml(yaml).unwrap();
    let step = &manifest.steps[0];

    assert_eq!(step.retry.max_attempts, 5);
    assert_eq!(step.retry.base_delay_ms, 250);
    assert_eq!(step.timeout(&manifest), Duration::from_secs(10));
}

#[test]
fn test_retry_defaults_when_omitted() {
    let yaml = r#"
name: defaults
steps:
  - name: curate
    agent: curator
    input:
      topic: anything
"#;
    let manifest = Manifest::from_yaml(yaml).unwrap();
    let step = &manifest.steps[0];

    assert_eq!(step.retry.max_attempts, 3);
    assert_eq!(step.retry.base_delay_ms, 1000);
    // Manifest-level default timeout applies
    assert_eq!(step.timeout(&manifest), Duration::from_secs(120));
}

#[test]
fn test_criticality_covers_all_known_agents() {
    let critical = ["curator", "scriptwriter", "narrator", "assembler", "publisher"];
    let non_critical = ["composer", "attribution"];

    for agent in critical {
        assert_eq!(criticality_of(agent), Criticality::Critical, "{}", agent);
    }
    for agent in non_critical {
        assert_eq!(criticality_of(agent), Criticality::NonCritical, "{}", agent);
    }
}

#[test]
fn test_unknown_agent_is_critical() {
    assert_eq!(criticality_of("colorist"), Criticality::Critical);
    assert_eq!(criticality_of(""), Criticality::Critical);
}

#[test]
fn test_fallback_payloads_are_agent_specific() {
    let composer = fallback_output("composer");
    assert_eq!(composer["fallback"], true);
    assert!(composer["track"].is_null());

    let attribution = fallback_output("attribution");
    assert_eq!(attribution["fallback"], true);
    assert_eq!(attribution["credits"].as_array().unwrap().len(), 0);

    // Agents without a bespoke payload still get the flag
    let generic = fallback_output("colorist");
    assert_eq!(generic["fallback"], true);
}
