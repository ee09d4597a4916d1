//! End-to-end scheduling scenarios (spec §8): linear chains, failure
//! propagation, soft dependencies, bounded parallel fan-out, group
//! derivation, and range runs.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stc::compiler::compile;
use stc::listener::Listener;
use stc::model::Status;
use stc::processor::ProcessorConfig;
use stc::scenario;
use stc::coordinator::Coordinator;
use tempfile::tempdir;

fn write_scenario(dir: &std::path::Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("scenario.xml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "{contents}").unwrap();
    path
}

async fn run(dir: &std::path::Path, xml: &str, workers: usize) -> Arc<Coordinator> {
    let path = write_scenario(dir, xml);
    let scenario = scenario::load(&path).unwrap();
    let (flow, log_dir) = compile(&scenario).unwrap();
    let coordinator = Coordinator::new(flow, log_dir, workers, ProcessorConfig::default()).unwrap();
    coordinator.reset().await.unwrap();
    coordinator.start();
    coordinator.wait_for().await;
    coordinator
}

#[tokio::test]
async fn scenario_1_linear_chain_all_succeed() {
    let dir = tempdir().unwrap();
    let coordinator = run(
        dir.path(),
        r#"
<scenario name="linear">
  <step name="a" exec="true" />
  <step name="b" exec="true" requires="a" />
  <step name="c" exec="true" requires="b" />
</scenario>
"#,
        4,
    )
    .await;

    assert_eq!(coordinator.get_status("a").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("b").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("c").await, Some(Status::Succeeded));
    assert_eq!(coordinator.wait_for().await, 0);

    let events = coordinator.get_records().await.unwrap();
    let order: Vec<&str> = events.iter().map(|e| e.step.as_str()).collect();
    assert_eq!(order, vec!["a", "a", "b", "b", "c", "c"]);
}

#[tokio::test]
async fn scenario_2_failure_propagates_to_skip() {
    let dir = tempdir().unwrap();
    let coordinator = run(
        dir.path(),
        r#"
<scenario name="propagation">
  <step name="a" exec="true" />
  <step name="b" exec="false" requires="a" />
  <step name="c" exec="true" requires="b" />
</scenario>
"#,
        4,
    )
    .await;

    assert_eq!(coordinator.get_status("a").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("b").await, Some(Status::Failed));
    assert_eq!(coordinator.get_status("c").await, Some(Status::Skipped));
    assert_eq!(coordinator.wait_for().await, 1);
}

#[tokio::test]
async fn scenario_3_soft_dependency_does_not_doom() {
    let dir = tempdir().unwrap();
    let coordinator = run(
        dir.path(),
        r#"
<scenario name="soft">
  <step name="a" exec="true" />
  <step name="b" exec="false" requires="a" />
  <step name="c" exec="true" requires="!b" />
</scenario>
"#,
        4,
    )
    .await;

    assert_eq!(coordinator.get_status("a").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("b").await, Some(Status::Failed));
    assert_eq!(coordinator.get_status("c").await, Some(Status::Succeeded));
    assert_eq!(coordinator.wait_for().await, 1);
}

struct ConcurrencyTracker {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Listener for ConcurrencyTracker {
    fn on_start(&self, _step: &str, _command: &str) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn on_completion(&self, _step: &str, _status: Status) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn scenario_4_parallel_fan_out_respects_worker_pool() {
    let dir = tempdir().unwrap();
    let mut xml = String::from(r#"<scenario name="fanout"><step name="root" exec="true" />"#);
    for i in 0..10 {
        xml.push_str(&format!(r#"<step name="c{i}" exec="sleep 0.05" requires="root" />"#));
    }
    xml.push_str("</scenario>");

    let path = write_scenario(dir.path(), &xml);
    let scenario = scenario::load(&path).unwrap();
    let (flow, log_dir) = compile(&scenario).unwrap();
    let coordinator = Coordinator::new(flow, log_dir, 4, ProcessorConfig::default()).unwrap();

    let tracker = Arc::new(ConcurrencyTracker {
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });
    coordinator.add_listener(tracker.clone() as Arc<dyn Listener>);

    coordinator.reset().await.unwrap();
    coordinator.start();
    let exit_code = coordinator.wait_for().await;

    assert_eq!(exit_code, 0);
    assert!(tracker.max.load(Ordering::SeqCst) <= 4);
    for i in 0..10 {
        assert_eq!(coordinator.get_status(&format!("c{i}")).await, Some(Status::Succeeded));
    }
}

#[tokio::test]
async fn scenario_5_group_status_derives_from_children() {
    let dir = tempdir().unwrap();
    let coordinator = run(
        dir.path(),
        r#"
<scenario name="groups">
  <group name="g">
    <step name="g1" exec="true" />
    <step name="g2" exec="true" />
  </group>
  <step name="d" exec="true" requires="g" />
</scenario>
"#,
        4,
    )
    .await;

    assert_eq!(coordinator.get_status("g1").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("g2").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("g").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("d").await, Some(Status::Succeeded));

    let events = coordinator.get_records().await.unwrap();
    let d_start = events.iter().position(|e| e.step == "d").unwrap();
    let g1_done = events.iter().rposition(|e| e.step == "g1").unwrap();
    let g2_done = events.iter().rposition(|e| e.step == "g2").unwrap();
    assert!(d_start > g1_done && d_start > g2_done);
}

#[tokio::test]
async fn scenario_6_range_run_skips_outside_the_active_subgraph() {
    let dir = tempdir().unwrap();
    let path = write_scenario(
        dir.path(),
        r#"
<scenario name="range">
  <step name="a" exec="true" />
  <step name="b1" exec="true" requires="a" />
  <step name="c1" exec="true" requires="b1" />
  <step name="d" exec="true" requires="c1" />
</scenario>
"#,
    );
    let scenario = scenario::load(&path).unwrap();
    let (flow, log_dir) = compile(&scenario).unwrap();
    let coordinator = Coordinator::new(flow, log_dir, 4, ProcessorConfig::default()).unwrap();

    coordinator
        .reset_range(&["b1".to_string()], &["c1".to_string()])
        .await
        .unwrap();
    coordinator.start();
    let exit_code = coordinator.wait_for().await;

    assert_eq!(coordinator.get_status("a").await, Some(Status::Skipped));
    assert_eq!(coordinator.get_status("b1").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("c1").await, Some(Status::Succeeded));
    assert_eq!(coordinator.get_status("d").await, Some(Status::Skipped));
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn p5_reset_is_idempotent_for_deterministic_commands() {
    let dir = tempdir().unwrap();
    let path = write_scenario(
        dir.path(),
        r#"
<scenario name="idempotent">
  <step name="a" exec="true" />
  <step name="b" exec="false" requires="a" />
</scenario>
"#,
    );
    let scenario = scenario::load(&path).unwrap();
    let (flow, log_dir) = compile(&scenario).unwrap();
    let coordinator = Coordinator::new(flow, log_dir, 4, ProcessorConfig::default()).unwrap();

    coordinator.reset().await.unwrap();
    coordinator.start();
    let first_exit = coordinator.wait_for().await;
    let first = (
        coordinator.get_status("a").await,
        coordinator.get_status("b").await,
    );

    coordinator.reset().await.unwrap();
    coordinator.start();
    let second_exit = coordinator.wait_for().await;
    let second = (
        coordinator.get_status("a").await,
        coordinator.get_status("b").await,
    );

    assert_eq!(first, second);
    assert_eq!(first_exit, second_exit);
}
