//! Integration tests for the convergence flow.
//!
//! These tests drive a spawned installer worker through the producer API
//! and observe the result on the platform:
//! 1. Producers register or update resources
//! 2. The worker computes and executes module and configuration tasks
//! 3. MockPlatform records what was installed, started and applied
//!
//! Uses MockPlatform to simulate the host registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use converge_agent::tasks::default_creators;
use converge_agent::{LiveModule, MockPlatform, ModuleStatus, Platform};
use converge_reconcile::{
    Attributes, InstallableResource, InstallationEvent, InstallationListener, Installer,
    InstallerConfig, ResourceState, RetryTrigger, StateStore,
};
use serde_json::json;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

/// Remembers which urls were processed, and into which state.
#[derive(Default)]
struct ProcessedLog {
    processed: Mutex<Vec<(String, ResourceState)>>,
}

impl ProcessedLog {
    fn contains(&self, url: &str, state: ResourceState) -> bool {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .any(|(u, s)| u == url && *s == state)
    }
}

impl InstallationListener for ProcessedLog {
    fn on_event(&self, event: &InstallationEvent) {
        if let InstallationEvent::Processed { url, state, .. } = event {
            self.processed.lock().unwrap().push((url.clone(), *state));
        }
    }
}

struct Agent {
    installer: Installer,
    worker: JoinHandle<()>,
    processed: Arc<ProcessedLog>,
}

impl Agent {
    fn start(dir: &Path, platform: &Arc<MockPlatform>, retry: &Arc<RetryTrigger>) -> Self {
        let config = InstallerConfig {
            cycle_delay: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
            data_dir: dir.to_path_buf(),
        };
        let store = StateStore::open(dir.join("installer.db")).unwrap();
        let creators = default_creators(platform.clone(), 3);
        let processed = Arc::new(ProcessedLog::default());
        let (installer, worker) = Installer::new(
            config,
            store,
            creators,
            processed.clone(),
            Arc::clone(retry),
        );
        Self {
            installer,
            worker: tokio::spawn(worker.run()),
            processed,
        }
    }

    async fn wait_for_processed(&self, url: &str, state: ResourceState) {
        let poll = async {
            while !self.processed.contains(url, state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(WAIT, poll).await.is_err() {
            panic!("timed out waiting for {} to become {}", url, state);
        }
    }

    async fn stop(self) {
        self.installer.deactivate();
        tokio::time::timeout(WAIT, self.worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

fn test_platform() -> (Arc<MockPlatform>, Arc<RetryTrigger>) {
    let retry = Arc::new(RetryTrigger::new());
    let platform = Arc::new(MockPlatform::new().with_retry_trigger(Arc::clone(&retry)));
    (platform, retry)
}

fn module(id: &str, name: &str, version: &str) -> InstallableResource {
    let content = format!("{}@{}", name, version).into_bytes();
    InstallableResource::module(id, name, version, Some(content))
}

fn config(id: &str, properties: serde_json::Value) -> InstallableResource {
    let attributes: Attributes = serde_json::from_value(properties).unwrap();
    InstallableResource::config(id, attributes)
}

async fn wait_for_module(
    platform: &MockPlatform,
    name: &str,
    check: impl Fn(Option<&LiveModule>) -> bool,
) {
    let poll = async {
        loop {
            let module = platform.find_module(name).await.unwrap();
            if check(module.as_ref()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(WAIT, poll).await.is_err() {
        panic!(
            "timed out waiting for module {}, operations: {:?}",
            name,
            platform.operations().await
        );
    }
}

async fn wait_for_configs(
    platform: &MockPlatform,
    check: impl Fn(&BTreeMap<String, Attributes>) -> bool,
) {
    let poll = async {
        loop {
            if check(&platform.configs().await) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(WAIT, poll).await.is_err() {
        panic!("timed out waiting for configs: {:?}", platform.configs().await);
    }
}

fn is_active(module: Option<&LiveModule>) -> bool {
    module.is_some_and(|m| m.status == ModuleStatus::Active)
}

#[tokio::test]
async fn test_install_and_start_module() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let agent = Agent::start(dir.path(), &platform, &retry);

    agent
        .installer
        .register_resources("file", vec![module("a.jar", "org.example.a", "1.0.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.a", is_active).await;

    assert_eq!(
        platform.module_content("org.example.a").await.unwrap(),
        b"org.example.a@1.0.0"
    );
    assert_eq!(
        platform.operations().await,
        vec!["install org.example.a", "start org.example.a"]
    );
    assert!(retry.events_count() >= 2);
    agent.stop().await;
}

#[tokio::test]
async fn test_upgrade_keeps_one_installed_resource() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let agent = Agent::start(dir.path(), &platform, &retry);

    agent
        .installer
        .register_resources("file", vec![module("a-1.jar", "org.example.a", "1.0.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.a", is_active).await;

    agent
        .installer
        .update_resources("file", vec![module("a-2.jar", "org.example.a", "2.0.0")], vec![])
        .unwrap();
    wait_for_module(&platform, "org.example.a", |m| {
        is_active(m) && m.is_some_and(|m| m.version.to_string() == "2.0.0")
    })
    .await;

    agent.stop().await;

    let table = StateStore::open(dir.path().join("installer.db"))
        .unwrap()
        .load_table()
        .unwrap();
    let group = table.group("module:org.example.a").unwrap();
    let installed: Vec<&str> = group
        .resources()
        .iter()
        .filter(|r| r.state() == ResourceState::Installed)
        .map(|r| r.url())
        .collect();
    assert_eq!(installed, vec!["file:a-2.jar"]);
    assert_eq!(group.len(), 2);
    assert_eq!(platform.modules().await.len(), 1);
}

#[tokio::test]
async fn test_full_set_removes_missing_module() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let agent = Agent::start(dir.path(), &platform, &retry);

    agent
        .installer
        .register_resources(
            "file",
            vec![
                module("a.jar", "org.example.a", "1.0.0"),
                module("b.jar", "org.example.b", "1.0.0"),
            ],
        )
        .unwrap();
    wait_for_module(&platform, "org.example.a", is_active).await;
    wait_for_module(&platform, "org.example.b", is_active).await;

    agent
        .installer
        .register_resources("file", vec![module("a.jar", "org.example.a", "1.0.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.b", |m| m.is_none()).await;

    let operations = platform.operations().await;
    assert!(operations.contains(&"stop org.example.b".to_string()));
    assert!(operations.contains(&"uninstall org.example.b".to_string()));
    assert_eq!(
        operations.iter().filter(|op| op.ends_with("org.example.a")).count(),
        2
    );
    assert!(is_active(platform.find_module("org.example.a").await.unwrap().as_ref()));
    agent.stop().await;
}

#[tokio::test]
async fn test_failed_update_is_retried_in_same_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let agent = Agent::start(dir.path(), &platform, &retry);

    agent
        .installer
        .register_resources("file", vec![module("a.jar", "org.example.a", "1.0.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.a", is_active).await;

    platform.fail_next_updates(2);
    agent
        .installer
        .register_resources("file", vec![module("a.jar", "org.example.a", "1.1.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.a", |m| {
        is_active(m) && m.is_some_and(|m| m.version.to_string() == "1.1.0")
    })
    .await;

    assert_eq!(
        platform.module_content("org.example.a").await.unwrap(),
        b"org.example.a@1.1.0"
    );
    let updates = platform
        .operations()
        .await
        .iter()
        .filter(|op| op.starts_with("update"))
        .count();
    assert_eq!(updates, 1);
    agent.stop().await;
}

#[tokio::test]
async fn test_blocked_start_retried_after_lifecycle_event() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    platform.block_start("org.example.a").await;
    let agent = Agent::start(dir.path(), &platform, &retry);

    agent
        .installer
        .register_resources("file", vec![module("a.jar", "org.example.a", "1.0.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.a", |m| m.is_some()).await;

    // the failed start waits for the next cycle
    let pending = async {
        while !retry.retries_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, pending).await.unwrap();
    assert!(!is_active(platform.find_module("org.example.a").await.unwrap().as_ref()));

    platform.unblock_start("org.example.a").await;
    wait_for_module(&platform, "org.example.a", is_active).await;
    assert_eq!(
        platform.operations().await,
        vec!["install org.example.a", "start org.example.a"]
    );
    agent.stop().await;
}

#[tokio::test]
async fn test_configurations_applied_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let agent = Agent::start(dir.path(), &platform, &retry);

    agent
        .installer
        .register_resources(
            "cfg",
            vec![
                config("org.example.http.cfg", json!({"port": 8080})),
                config("org.example.logger-audit.cfg", json!({"level": "info"})),
            ],
        )
        .unwrap();
    wait_for_configs(&platform, |configs| configs.len() == 2).await;

    let configs = platform.configs().await;
    assert_eq!(configs["org.example.http"]["port"], json!(8080));
    let (factory_pid, properties) = configs
        .iter()
        .find(|(pid, _)| pid.starts_with("org.example.logger."))
        .unwrap();
    assert_eq!(properties["level"], json!("info"));

    agent.installer.register_resources("cfg", vec![]).unwrap();
    wait_for_configs(&platform, |configs| configs.is_empty()).await;
    assert!(platform
        .operations()
        .await
        .contains(&format!("delete {}", factory_pid)));
    agent.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();

    let agent = Agent::start(dir.path(), &platform, &retry);
    agent
        .installer
        .register_resources("file", vec![module("a.jar", "org.example.a", "1.0.0")])
        .unwrap();
    wait_for_module(&platform, "org.example.a", is_active).await;
    agent.stop().await;

    // a new worker only knows about the module through the state database
    let agent = Agent::start(dir.path(), &platform, &retry);
    agent
        .installer
        .update_resources("file", vec![], vec!["a.jar".to_string()])
        .unwrap();
    wait_for_module(&platform, "org.example.a", |m| m.is_none()).await;

    assert_eq!(
        platform.operations().await,
        vec![
            "install org.example.a",
            "start org.example.a",
            "stop org.example.a",
            "uninstall org.example.a",
            "refresh",
        ]
    );
    agent.stop().await;
}

#[tokio::test]
async fn test_unchanged_snapshot_not_updated_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let build = b"org.example.a build 42".to_vec();

    let agent = Agent::start(dir.path(), &platform, &retry);
    agent
        .installer
        .register_resources(
            "file",
            vec![InstallableResource::module(
                "a.jar",
                "org.example.a",
                "1.0.0.SNAPSHOT",
                Some(build.clone()),
            )],
        )
        .unwrap();
    wait_for_module(&platform, "org.example.a", is_active).await;
    agent.stop().await;

    // the same build published again under a newer snapshot version
    let agent = Agent::start(dir.path(), &platform, &retry);
    agent
        .installer
        .update_resources(
            "file",
            vec![InstallableResource::module(
                "a-next.jar",
                "org.example.a",
                "1.0.1.SNAPSHOT",
                Some(build),
            )],
            vec![],
        )
        .unwrap();
    agent
        .wait_for_processed("file:a-next.jar", ResourceState::Installed)
        .await;
    agent.stop().await;

    assert_eq!(
        platform.operations().await,
        vec!["install org.example.a", "start org.example.a"]
    );
    assert!(is_active(platform.find_module("org.example.a").await.unwrap().as_ref()));

    let table = StateStore::open(dir.path().join("installer.db"))
        .unwrap()
        .load_table()
        .unwrap();
    let group = table.group("module:org.example.a").unwrap();
    let active = group.first_resource().unwrap();
    assert_eq!(active.url(), "file:a-next.jar");
    assert_eq!(table.installed_digest(group.entity_id()), Some(active.digest()));
}

#[tokio::test]
async fn test_invalid_scheme_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (platform, retry) = test_platform();
    let agent = Agent::start(dir.path(), &platform, &retry);

    let err = agent
        .installer
        .register_resources("file:x", vec![module("a.jar", "org.example.a", "1.0.0")])
        .unwrap_err();
    assert!(err.is_invalid_scheme());
    agent.stop().await;
    assert!(platform.operations().await.is_empty());
}
