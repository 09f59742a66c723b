use shipyard::gate::GatePolicy;
use shipyard::pipeline::StageRegistry;
use shipyard::presets::{PRESETS, generate_preset};
use shipyard::recipe::Recipe;
use shipyard::stages;
use shipyard::validation::validate_recipe;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[test]
fn every_preset_loads_and_validates() {
    let temp = tempdir().unwrap();
    let registry = build_registry();

    for preset in PRESETS {
        let path = temp.path().join(format!("recipes/{preset}.yaml"));
        generate_preset(preset, &path).unwrap();

        let recipe = Recipe::load(&path).unwrap();
        let report = validate_recipe(&recipe, &registry);
        assert!(report.is_ok(), "{preset}: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "{preset}: {:?}", report.warnings);
    }
}

#[test]
fn gitops_preset_orders_release_stages() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("gitops.yaml");
    generate_preset("gitops", &path).unwrap();
    let recipe = Recipe::load(&path).unwrap();

    let labels: Vec<&str> = recipe.pipeline.iter().map(|s| s.label()).collect();
    assert_eq!(
        labels,
        vec![
            "clean-workspace",
            "checkout",
            "sonarqube",
            "dependency-check",
            "trivy-fs",
            "build",
            "trivy-image",
            "publish",
            "update-manifest",
            "push-manifest"
        ]
    );
    assert!(recipe.notify.is_some());

    for stage in recipe.pipeline.iter().filter(|s| s.stage == "scan") {
        assert_eq!(stage.policy, GatePolicy::Advisory, "{}", stage.label());
    }
    for label in ["build", "publish", "update-manifest", "push-manifest"] {
        let stage = recipe.pipeline.iter().find(|s| s.label() == label).unwrap();
        assert_eq!(stage.policy, GatePolicy::Blocking, "{label}");
    }
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let err = generate_preset("kubernetes-magic", &temp.path().join("x.yaml")).unwrap_err();
    assert!(err.to_string().contains("gitops"));
}
