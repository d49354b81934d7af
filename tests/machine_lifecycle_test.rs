//! 机器生命周期集成测试：服务主循环、快照恢复、Advance 与 Inspect 并发

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rollup_machine::backend::mock::template_hash;
use rollup_machine::backend::MockFactory;
use rollup_machine::repository::Repository;
use rollup_machine::{
    service, Advancer, AdvancerOptions, AppConfig, Application, CompletionStatus, LoadOptions,
    MachineInstance, MachineManager, MemoryRepository, ShutdownManager, ShutdownReason,
    SnapshotPolicy,
};
use tokio_util::sync::CancellationToken;

async fn repository_with_app(template: &Path, inputs: usize) -> Arc<MemoryRepository> {
    std::fs::create_dir_all(template).unwrap();
    let repo = Arc::new(MemoryRepository::new());
    repo.add_application(Application::new("echo", template, template_hash(template)))
        .await;
    for i in 0..inputs {
        repo.add_input("echo", format!("input-{i}").into_bytes())
            .await
            .unwrap();
    }
    repo
}

async fn wait_for_results(repo: &MemoryRepository, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while repo.results("echo").await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("inputs were not processed in time");
}

#[tokio::test]
async fn test_service_processes_inputs_and_closes_machines() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository_with_app(&dir.path().join("template"), 3).await;
    let factory = Arc::new(MockFactory::default());
    let stats = factory.stats();

    let mut config = AppConfig::default();
    config.manager.refresh_interval_ms = 10;
    config.advancer.snapshot_dir = dir.path().join("snapshots");
    config.http.address = "127.0.0.1:0".to_string();

    let shutdown = Arc::new(ShutdownManager::new());
    let handle = tokio::spawn(service::run(
        config,
        repo.clone(),
        factory.clone(),
        shutdown.clone(),
    ));

    wait_for_results(&repo, 3).await;
    repo.add_input("echo", b"late".to_vec()).await.unwrap();
    wait_for_results(&repo, 4).await;

    shutdown.shutdown(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();

    let results = repo.results("echo").await;
    assert!(results.iter().all(|r| r.status == CompletionStatus::Accepted));
    assert_eq!(results[3].outputs, vec![b"late".to_vec()]);
    assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    // 每个创建过的机器进程（包括 fork）最终都被关闭
    assert_eq!(stats.created(), stats.shutdowns());
}

#[tokio::test]
async fn test_restart_resumes_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("template");
    let repo = repository_with_app(&template, 5).await;
    let factory = Arc::new(MockFactory::default());
    let cancel = CancellationToken::new();
    let options = AdvancerOptions {
        snapshot_policy: SnapshotPolicy::EveryN(2),
        snapshot_dir: dir.path().join("snapshots"),
    };

    let first = Arc::new(MachineManager::new(
        repo.clone(),
        factory.clone(),
        LoadOptions::default(),
    ));
    first.update_machines(&cancel).await.unwrap();
    Advancer::new(first.clone(), repo.clone(), options.clone())
        .step(&cancel)
        .await
        .unwrap();
    first.close().await.unwrap();

    let latest = repo.latest_snapshot("echo").await.unwrap().unwrap();
    assert_eq!(latest.processed_inputs, 4);

    repo.add_input("echo", b"after-restart".to_vec()).await.unwrap();
    let second = Arc::new(MachineManager::new(
        repo.clone(),
        factory.clone(),
        LoadOptions::default(),
    ));
    second.update_machines(&cancel).await.unwrap();
    let machine = second.get_machine("echo").await.unwrap();
    assert_eq!(machine.processed_inputs().await, 5);

    Advancer::new(second.clone(), repo.clone(), options)
        .step(&cancel)
        .await
        .unwrap();
    let results = repo.results("echo").await;
    assert_eq!(results.len(), 6);

    // 从模板完整重放得到相同的状态哈希
    let reference = MachineInstance::load(
        Arc::new(Application::new("echo", &template, template_hash(&template))),
        None,
        factory.as_ref(),
        &LoadOptions::default(),
    )
    .await
    .unwrap();
    let payloads: Vec<Vec<u8>> = (0..5)
        .map(|i| format!("input-{i}").into_bytes())
        .chain(std::iter::once(b"after-restart".to_vec()))
        .collect();
    let mut last = None;
    for (index, payload) in payloads.iter().enumerate() {
        last = Some(reference.advance(&cancel, payload, index as u64).await.unwrap());
    }
    assert_eq!(last.unwrap().machine_hash, results[5].machine_hash);

    reference.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_inspects_run_alongside_advances() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository_with_app(&dir.path().join("template"), 20).await;
    let factory = Arc::new(MockFactory::default());
    let cancel = CancellationToken::new();

    let manager = Arc::new(MachineManager::new(
        repo.clone(),
        factory.clone(),
        LoadOptions::default(),
    ));
    manager.update_machines(&cancel).await.unwrap();
    let machine = manager.get_machine("echo").await.unwrap();

    let advancer = Advancer::new(manager.clone(), repo.clone(), AdvancerOptions::default());
    let inspects: Vec<_> = (0..20)
        .map(|_| {
            let machine = machine.clone();
            tokio::spawn(async move {
                machine
                    .inspect(&CancellationToken::new(), b"state?")
                    .await
                    .unwrap()
            })
        })
        .collect();

    assert_eq!(advancer.step(&cancel).await.unwrap(), 20);
    for inspect in inspects {
        let result = inspect.await.unwrap();
        assert_eq!(result.status, CompletionStatus::Accepted);
        assert!(result.processed_inputs <= 20);
    }
    assert_eq!(machine.processed_inputs().await, 20);

    manager.close().await.unwrap();
    let stats = factory.stats();
    assert_eq!(stats.created(), stats.shutdowns());
}
