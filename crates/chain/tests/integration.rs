//! Mock chain behaviour relied upon by the job pipeline tests.

use std::sync::Arc;
use std::time::Duration;
use vtn_chain::{
    parse_job_payload, with_timeout, ChainClient, ChainError, MockChainClient, RewardMode,
};
use vtn_types::{JobId, StreamId};

#[tokio::test]
async fn test_event_to_job_parameters() {
    let chain = MockChainClient::new("transcoder").with_active(true).with_stake(1_000);
    let stream = StreamId::new("origin-node", "feed").unwrap();
    let log = chain.add_job(&stream, "P240p30fps16x9,P360p30fps16x9", JobId::from(42u64), "origin", 5);

    let mut events = chain.subscribe_job_events().await.unwrap();
    chain.emit(log.clone());
    let received = events.recv().await.unwrap();
    assert_eq!(received.job_id, JobId::from(42u64));

    let tx = chain.transaction_by_hash(&received.tx_hash).await.unwrap();
    let params = parse_job_payload(&tx.input).unwrap();
    assert_eq!(params.stream_id.node_id(), "origin-node");
    assert_eq!(params.profile_tag, "P240p30fps16x9,P360p30fps16x9");

    let info = chain.job_info(&received).await.unwrap();
    assert_eq!(info.broadcaster, "origin");
    assert_eq!(info.transcoder, chain.account());
}

#[tokio::test]
async fn test_closed_subscription_ends_channel() {
    let chain = MockChainClient::new("t");
    let mut events = chain.subscribe_job_events().await.unwrap();
    chain.close_subscriptions();
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_subscription_failure_is_transient() {
    let chain = MockChainClient::new("t");
    chain.fail_next_subscriptions(1);
    let err = chain.subscribe_job_events().await.unwrap_err();
    assert!(err.is_transient());
    assert!(chain.subscribe_job_events().await.is_ok());
    assert_eq!(chain.subscriptions(), 1);
}

#[tokio::test]
async fn test_unknown_transaction_is_permanent() {
    let chain = MockChainClient::new("t");
    let err = chain
        .transaction_by_hash(&vtn_chain::TxHash([0xEE; 32]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::TransactionNotFound(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_shared_client_is_object_safe() {
    let chain: Arc<dyn ChainClient> = Arc::new(MockChainClient::new("t").with_active(true));
    assert!(chain.is_active_transcoder().await.unwrap());
    assert!(chain.reward().await.is_ok());
}

#[tokio::test]
async fn test_reward_failure_modes() {
    let chain = MockChainClient::new("t");
    chain.set_reward_mode(RewardMode::Fail);
    assert!(chain.reward().await.unwrap_err().is_transient());
    chain.set_reward_mode(RewardMode::AlreadyRewarded);
    assert_eq!(chain.reward().await.unwrap_err(), ChainError::AlreadyRewarded);
}

#[tokio::test(start_paused = true)]
async fn test_rpc_tier_bounds_slow_calls() {
    let result: Result<(), _> = with_timeout(Duration::from_millis(10), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    })
    .await;
    assert!(matches!(result, Err(ChainError::Timeout(_))));
}
