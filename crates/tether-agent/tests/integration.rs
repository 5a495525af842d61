mod common;

use common::*;
use std::time::Duration;
use tether_common::marker::skip_preamble;
use tether_common::{
    Cause, ChannelError, CloseReason, Envelope, HeartbeatConfig, Outcome, SecureConnection,
    SecurityPolicy,
};
use tether_controller::ControllerError;
use tokio::io::BufReader;
use tokio::net::TcpStream;

#[tokio::test]
async fn echo_over_plaintext_tcp() {
    let agent = start_agent(2, false).await;
    let remote = connect_plain(agent.addr).await;

    assert_eq!(remote.banner(), "test agent (tether.v1)");
    let outcome = remote.run("echo", b"hello agent").await.unwrap();
    assert_eq!(outcome, Outcome::Success(b"hello agent".to_vec()));
}

#[tokio::test]
async fn echo_over_encrypted_tcp() {
    let agent = start_agent(2, true).await;
    let remote = connect_with(agent.addr, true, HeartbeatConfig::default()).await;

    let outcome = remote.run("echo", b"sealed").await.unwrap();
    assert_eq!(outcome, Outcome::Success(b"sealed".to_vec()));
}

#[tokio::test]
async fn key_mismatch_kills_connection() {
    let agent = start_agent(1, false).await;
    let remote = connect_with(agent.addr, true, HeartbeatConfig::default()).await;

    assert!(remote.run("echo", b"x").await.is_err());
    assert!(remote.close_reason().is_some());
}

#[tokio::test]
async fn concurrent_tasks_use_separate_slots() {
    let agent = start_agent(2, false).await;
    let remote = connect_plain(agent.addr).await;

    let slow = remote.dispatch("sleep", b"200").await.unwrap();
    let fast = remote.dispatch("echo", b"quick").await.unwrap();
    assert_eq!(fast.outcome().await.unwrap(), Outcome::Success(b"quick".to_vec()));
    assert_eq!(slow.outcome().await.unwrap(), Outcome::Success(b"200".to_vec()));
}

#[tokio::test]
async fn full_pool_reports_busy_failure() {
    let agent = start_agent(1, false).await;
    let remote = connect_plain(agent.addr).await;

    let _running = remote.dispatch("sleep", b"60000").await.unwrap();
    let refused = remote.run("echo", b"x").await.unwrap();
    assert!(matches!(refused, Outcome::Failure(m) if m.contains("busy")));
}

#[tokio::test]
async fn interrupt_merges_duplicate_causes() {
    let agent = start_agent(1, false).await;
    let remote = connect_plain(agent.addr).await;

    let task = remote.dispatch("sleep", b"60000").await.unwrap();
    let id = task.id();
    let pool = agent.state.pool.clone();
    wait_until(|| pool.slots()[0].current_task() == Some(id)).await;

    remote
        .interrupt(id, vec![Cause::user("Johnny"), Cause::user("Johnny")])
        .await
        .unwrap();
    remote.interrupt(id, vec![Cause::user("Jane")]).await.unwrap();

    let Outcome::Interrupted(causes) = task.outcome().await.unwrap() else {
        panic!("expected interrupted outcome");
    };
    assert_eq!(causes[0], Cause::user("Johnny"));
    assert!(causes.len() <= 2);
    assert_eq!(causes.iter().filter(|c| **c == Cause::user("Johnny")).count(), 1);
}

#[tokio::test]
async fn kill_hard_then_yank_restores_capacity() {
    let agent = start_agent(1, false).await;
    let remote = connect_plain(agent.addr).await;
    let pool = agent.state.pool.clone();

    let task = remote.dispatch("sleep", b"60000").await.unwrap();
    let id = task.id();
    wait_until(|| pool.slots()[0].current_task() == Some(id)).await;
    let slot = pool.slots()[0].id();

    pool.kill_hard(slot, "operator kill").unwrap();
    assert_eq!(
        task.outcome().await.unwrap(),
        Outcome::Interrupted(vec![Cause::killed_hard("operator kill")])
    );
    let dead = pool.get(slot).unwrap();
    assert_eq!(dead.cause_of_death().unwrap().task, Some(id));

    let refused = remote.run("echo", b"x").await.unwrap();
    assert!(matches!(refused, Outcome::Failure(_)));

    pool.yank(slot).unwrap();
    assert_eq!(pool.slots().len(), 1);
    let outcome = remote.run("echo", b"back").await.unwrap();
    assert_eq!(outcome, Outcome::Success(b"back".to_vec()));
}

#[tokio::test]
async fn controller_disconnect_interrupts_its_tasks() {
    let agent = start_agent(1, false).await;
    let pool = agent.state.pool.clone();
    {
        let remote = connect_plain(agent.addr).await;
        let task = remote.dispatch("sleep", b"60000").await.unwrap();
        let id = task.id();
        wait_until(|| pool.slots()[0].current_task() == Some(id)).await;
        remote.close().await;
    }
    wait_until(|| pool.idle_count() == 1).await;
}

#[tokio::test]
async fn denied_envelope_closes_connection() {
    let agent = start_agent(1, false).await;
    let stream = TcpStream::connect(agent.addr).await.unwrap();
    let (rd, wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    skip_preamble(&mut rd, |_| {}).await.unwrap();
    let mut conn = SecureConnection::open(rd, wr, SecurityPolicy::controller());

    conn.write_object(&Envelope::Outcome {
        id: 1,
        outcome: Outcome::Success(b"forged".to_vec()),
    })
    .await
    .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), conn.read_object())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ChannelError::Closed(CloseReason::PeerClosed)));
    assert_eq!(agent.state.pool.idle_count(), 1);
}

#[tokio::test]
async fn connect_to_nothing_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let options = tether_controller::ConnectOptions::default();
    let err = tether_controller::connect(&controller_config(addr), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Io(_)));
}
