use std::{fs, path::PathBuf};
use coffeeshop::{
    catalog::{CatalogLoader, DirCatalogLoader},
    error::ConfigurationError,
};
use tempfile::tempdir;

#[test]
fn test_demo_catalog_loads() {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/catalog");
    let registry = DirCatalogLoader::new(dir).load().unwrap();

    assert_eq!(registry.default_app().id, "wall");
    let running: Vec<_> = registry.running().iter().map(|a| a.id.as_str()).collect();
    assert_eq!(running, vec!["trivia", "counter", "photos"]);
    assert_eq!(registry.available()[0].id, "weather");

    let counter = registry.find("counter").unwrap();
    assert!(!counter.uses_pass_through());
    assert_eq!(counter.parameter("watchTopic"), Some("counter_taps"));
    assert!(registry.find("photos").unwrap().uses_pass_through());
}

#[test]
fn test_catalog_rejects_huge_idle_timeout() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("catalog.yaml"), "default: wall\n").unwrap();
    fs::write(
        dir.path().join("wall.yaml"),
        "id: wall\nname: Wall\nidle_timeout: 18446744073709551615\n\
         connection:\n  topic: wall\n  display_url: http://x\n",
    )
    .unwrap();

    let err = DirCatalogLoader::new(dir.path().to_path_buf()).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigurationError::InvalidSetting { key, .. } if key == "wall.idle_timeout"
    ));
}
