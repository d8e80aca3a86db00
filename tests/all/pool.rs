use crate::helpers::{get_client_settings, get_rabbitmq_settings};
use burrow::amqp::configuration::ClientSettings;
use burrow::amqp::ConnectionFactory;
use burrow::pool::{ChannelPool, PoolError, PoolSettings};
use std::time::Duration;

async fn get_pool(settings: ClientSettings) -> ChannelPool {
    let factory = ConnectionFactory::new_from_config(&get_rabbitmq_settings()).unwrap();
    ChannelPool::connect(factory, PoolSettings::from(&settings))
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn checkout_times_out_when_every_channel_is_leased() {
    // Arrange
    let pool = get_pool(ClientSettings {
        pool_size: 1,
        checkout_timeout_millis: 200,
        ..get_client_settings()
    })
    .await;
    let lease = pool.get_channel().await.unwrap();

    // Act
    let outcome = pool.get_channel().await;

    // Assert
    assert!(matches!(outcome, Err(PoolError::ChannelTimeout(_))));
    pool.return_channel(lease);
    assert!(pool.get_channel().await.is_ok());
    pool.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_waiting_checkout_gets_the_returned_channel() {
    let pool = get_pool(ClientSettings {
        pool_size: 1,
        ..get_client_settings()
    })
    .await;
    let lease = pool.get_channel().await.unwrap();
    let channel_id = lease.id();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_channel().await.map(|channel| channel.id()) }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(lease);

    assert_eq!(channel_id, waiter.await.unwrap().unwrap());
    pool.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn reconnecting_rebuilds_the_pool_on_a_new_generation() {
    let pool = get_pool(get_client_settings()).await;
    let stale = pool.get_channel().await.unwrap();
    assert_eq!(1, pool.generation());

    pool.reconnect().await.unwrap();

    assert_eq!(2, pool.generation());
    let fresh = pool.get_channel().await.unwrap();
    assert_eq!(2, fresh.generation());
    assert_eq!(1, stale.generation());
    // Leases from before the swap are closed, not pooled.
    drop(stale);
    let mut leases = vec![fresh];
    for _ in 1..get_client_settings().pool_size {
        let lease = pool.get_channel().await.unwrap();
        assert_eq!(2, lease.generation());
        leases.push(lease);
    }
    drop(leases);
    pool.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_closed_pool_refuses_checkouts() {
    let pool = get_pool(get_client_settings()).await;
    let terminated = pool.terminated();

    pool.shutdown().await;
    pool.shutdown().await;

    assert!(pool.is_closed());
    assert!(terminated.is_cancelled());
    assert!(matches!(pool.get_channel().await, Err(PoolError::Closed)));
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn a_pool_size_of_zero_still_serves_one_channel() {
    let pool = get_pool(ClientSettings {
        pool_size: 0,
        checkout_timeout_millis: 200,
        ..get_client_settings()
    })
    .await;

    let lease = pool.get_channel().await.unwrap();
    assert!(matches!(
        pool.get_channel().await,
        Err(PoolError::ChannelTimeout(_))
    ));
    drop(lease);
    pool.shutdown().await;
}
