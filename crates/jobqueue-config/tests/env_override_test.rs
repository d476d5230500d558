//! Environment layering. Kept to a single test because it mutates the
//! process environment.

use jobqueue_config::{ConfigLoader, StoreKind, ENVIRONMENT_VAR};

#[tokio::test]
async fn test_environment_file_and_variables_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("default.toml"),
        "[manager]\ndefault_concurrency = 2\n\n[demo]\nranks = 2\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("staging.toml"),
        "[demo]\nranks = 4\nmax_retry = 5\n\n[store]\nkind = \"mysql\"\n",
    )
    .unwrap();

    std::env::set_var(ENVIRONMENT_VAR, "staging");
    std::env::set_var("JOBQUEUE_MANAGER__DEFAULT_CONCURRENCY", "6");
    std::env::set_var("JOBQUEUE_DEMO__TOPICS", "resize,encode");
    std::env::set_var("JOBQUEUE_STORE__DATABASE__URL", "mysql://app@db:3306/jobs");

    let loader = ConfigLoader::new(dir.path());

    for key in [
        ENVIRONMENT_VAR,
        "JOBQUEUE_MANAGER__DEFAULT_CONCURRENCY",
        "JOBQUEUE_DEMO__TOPICS",
        "JOBQUEUE_STORE__DATABASE__URL",
    ] {
        std::env::remove_var(key);
    }

    let config = loader.unwrap().get().await;

    assert_eq!(config.app.environment, "staging");
    assert_eq!(config.manager.default_concurrency, 6);
    assert_eq!(config.demo.ranks, 4);
    assert_eq!(config.demo.max_retry, 5);
    assert_eq!(config.demo.topics, vec!["resize", "encode"]);
    assert_eq!(config.store.kind, StoreKind::Mysql);
    assert_eq!(config.store.database.url, "mysql://app@db:3306/jobs");
}
