use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time;

use accord_node::config::NodeConfig;
use accord_node::network::{LocalNetwork, Network};
use accord_node::node::Node;
use accord_node::types::{Item, ItemState};

fn test_config(dir: &Path) -> NodeConfig {
    NodeConfig {
        data_dir: dir.join("data"),
        key_path: dir.join("keys/node.toml"),
        rpc_listen: "127.0.0.1:0".parse().expect("valid socket addr"),
        persist_ledger: true,
        max_elections_time_ms: 500,
        poll_interval_ms: 50,
        default_state_expiry_secs: 3600,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approved_records_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let item = Item::new(b"durable approval".to_vec());
    let item_id = item.id().clone();

    {
        let network = Arc::new(LocalNetwork::new(
            config.max_elections_time(),
            config.poll_interval(),
        ));
        let node = Node::new(config.clone(), Arc::clone(&network) as Arc<dyn Network>)?;
        let handle = node.handle();
        network.register(&handle);

        let settled = handle.register_item_and_wait(item.clone()).await?;
        assert_eq!(settled.state, ItemState::Approved);
        handle.shutdown();
    }
    // Let lifecycle tasks wind down before the database is reopened.
    time::sleep(Duration::from_millis(250)).await;

    let network = Arc::new(LocalNetwork::new(
        config.max_elections_time(),
        config.poll_interval(),
    ));
    let node = Node::new(config, Arc::clone(&network) as Arc<dyn Network>)?;
    let handle = node.handle();
    network.register(&handle);

    // In-flight elections are gone; finalized state is not.
    assert_eq!(handle.status().elections_in_flight, 0);
    let record = handle
        .check_item_id(&item_id)?
        .context("approved record lost across restart")?;
    assert_eq!(record.state, ItemState::Approved);

    // Resubmission answers straight from the ledger, without an election.
    let info = handle.register_item(item, None)?;
    assert_eq!(info.result.state, ItemState::Approved);
    assert!(!info.result.have_copy);
    assert_eq!(handle.status().elections_in_flight, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_identity_is_stable_across_restarts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let network = Arc::new(LocalNetwork::new(
        config.max_elections_time(),
        config.poll_interval(),
    ));

    let first = {
        let node = Node::new(config.clone(), Arc::clone(&network) as Arc<dyn Network>)?;
        let address = node.handle().address().clone();
        node.handle().shutdown();
        address
    };
    time::sleep(Duration::from_millis(250)).await;

    let node = Node::new(config, Arc::clone(&network) as Arc<dyn Network>)?;
    assert_eq!(node.handle().address(), &first);
    Ok(())
}
