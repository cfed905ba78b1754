// End-to-end console session against an in-process deployment

use std::io::Write;
use std::time::Duration;

use fencelock_server::console::{self, Command};
use fencelock_server::startup::LocalDeployment;
use fencelock_server::{Cli, Configuration};

const FAST_CONFIG: &str = r#"
cluster:
  nodes: 3
raft:
  election_timeout_ms: 150
  election_jitter_ms: 150
  heartbeat_interval_ms: 30
  vote_rpc_timeout_ms: 100
  append_rpc_timeout_ms: 100
  commit_timeout_ms: 2000
quorum:
  timeout_ms: 2000
  vote_timeout_ms: 500
region_client:
  request_timeout_ms: 500
  retry_delay_ms: 10
  max_retries: 2
"#;

async fn deployment(peer_regions: &str) -> LocalDeployment {
    let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
    let yaml = format!(
        "region:\n  id: us\n  peers: [{}]\n{}",
        peer_regions, FAST_CONFIG
    );
    file.write_all(yaml.as_bytes()).unwrap();
    let configuration = Configuration::load(&Cli {
        config: Some(file.path().to_string_lossy().to_string()),
        ..Cli::default()
    })
    .unwrap();
    LocalDeployment::start(&configuration, Duration::from_secs(10))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_console_session() {
    let deployment = deployment("").await;
    assert_eq!(deployment.regions().len(), 1);

    let input = b"acquire L1 c1 30000\n\
                  acquire L1 c2\n\
                  release L1 c1 1\n\
                  acquire L1 c2\n\
                  bogus\n\
                  status\n\
                  quit\n\
                  check L1\n";
    let mut output: Vec<u8> = Vec::new();
    console::run(&deployment, &input[..], &mut output)
        .await
        .unwrap();
    let output = String::from_utf8(output).unwrap();

    let replies: Vec<&str> = output
        .lines()
        .map(|l| l.trim_start_matches("> "))
        .filter(|l| !l.is_empty())
        .collect();
    assert!(replies[1].starts_with("OK lock=L1 holder=c1 region=us token=1"), "{}", output);
    assert!(replies[2].starts_with("ALREADY_LOCKED lock=L1 holder=c1"), "{}", output);
    assert!(replies[3].starts_with("OK lock=L1 holder=c1"), "{}", output);
    assert!(replies[4].starts_with("OK lock=L1 holder=c2 region=us token=2"), "{}", output);
    assert!(replies[5].starts_with("unknown command 'bogus'"), "{}", output);
    assert!(output.contains("* region us"), "{}", output);
    // The check after quit never runs
    assert_eq!(output.matches("OK lock=L1").count(), 3, "{}", output);

    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_console_region_controls() {
    let deployment = deployment("eu, ap").await;
    assert_eq!(deployment.regions().len(), 3);

    let reply = console::execute(&deployment, Command::Disconnect("eu".to_string())).await;
    assert_eq!(reply.as_deref(), Some("region eu disconnected"));
    let acquired = console::execute(
        &deployment,
        Command::parse("acquire L2 c1 30000").unwrap().unwrap(),
    )
    .await
    .unwrap();
    assert!(acquired.starts_with("OK"), "{}", acquired);

    console::execute(&deployment, Command::Reconnect("eu".to_string())).await;
    let synced = console::execute(&deployment, Command::Sync("eu".to_string()))
        .await
        .unwrap();
    assert!(synced.starts_with("installed 0 locks from eu"), "{}", synced);

    assert_eq!(console::execute(&deployment, Command::Quit).await, None);
    deployment.shutdown();
}
