//! Tests for deployment resolution and fallback chains.

use ratekeeper_rate_limit::{DeploymentConfig, DeploymentMapper};

fn mapper() -> DeploymentMapper {
    DeploymentMapper::new(vec![
        DeploymentConfig::new("a")
            .with_model_name("gpt-4")
            .with_region("eastus")
            .with_tpm_quota(1_000)
            .with_fallback("b"),
        DeploymentConfig::new("b").with_model_name("gpt-4").with_fallback("c"),
        DeploymentConfig::new("c").with_model_name("gpt-4-32k"),
    ])
    .unwrap()
}

#[test]
fn test_resolve_known_deployment() {
    let mapper = mapper();
    let a = mapper.resolve("a").unwrap();
    assert_eq!(a.model_name().as_deref(), Some("gpt-4"));
    assert_eq!(a.region().as_deref(), Some("eastus"));
    assert_eq!(*a.tpm_quota(), Some(1_000));
    assert!(mapper.resolve("missing").is_none());
}

#[test]
fn test_fallback_chain_follows_links_in_order() {
    let mapper = mapper();
    assert_eq!(mapper.fallback_chain("a"), vec!["a", "b", "c"]);
    assert_eq!(mapper.fallback_chain("b"), vec!["b", "c"]);
    assert_eq!(mapper.fallback_chain("c"), vec!["c"]);
}

#[test]
fn test_unmapped_target_is_its_own_chain() {
    assert_eq!(mapper().fallback_chain("gpt-3.5-turbo"), vec!["gpt-3.5-turbo"]);
}

#[test]
fn test_model_for_uses_deployment_model() {
    let mapper = mapper();
    assert_eq!(mapper.model_for("c"), "gpt-4-32k");
    assert_eq!(mapper.model_for("gpt-3.5-turbo"), "gpt-3.5-turbo");
}

#[test]
fn test_two_node_cycle_is_rejected() {
    let err = DeploymentMapper::new(vec![
        DeploymentConfig::new("a").with_fallback("b"),
        DeploymentConfig::new("b").with_fallback("a"),
    ])
    .unwrap_err();
    assert!(err.message.contains("Cyclic"), "{}", err);
}

#[test]
fn test_self_cycle_is_rejected() {
    assert!(DeploymentMapper::new(vec![DeploymentConfig::new("a").with_fallback("a")]).is_err());
}

#[test]
fn test_cycle_reached_from_tail_is_rejected() {
    let result = DeploymentMapper::new(vec![
        DeploymentConfig::new("head").with_fallback("x"),
        DeploymentConfig::new("x").with_fallback("y"),
        DeploymentConfig::new("y").with_fallback("x"),
    ]);
    assert!(result.is_err());
}

#[test]
fn test_missing_fallback_is_rejected() {
    let err = DeploymentMapper::new(vec![DeploymentConfig::new("a").with_fallback("ghost")])
        .unwrap_err();
    assert!(err.message.contains("ghost"));
}

#[test]
fn test_duplicate_names_are_rejected() {
    assert!(
        DeploymentMapper::new(vec![DeploymentConfig::new("a"), DeploymentConfig::new("a")])
            .is_err()
    );
}
