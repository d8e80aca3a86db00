use crate::helpers::{get_client, unique_name};
use burrow::amqp::configuration::RpcSettings;
use burrow::rpc::{CallOptions, RpcClient, RpcError, RpcServer};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
struct Lookup {
    customer_id: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Customer {
    customer_id: String,
    name: String,
}

async fn lookup_server(queue: &str, shutdown: &CancellationToken) -> burrow::Client {
    let client = get_client().await;
    let server = RpcServer::new(client.clone(), queue).await.unwrap();
    server
        .serve_json(
            |_cx: Context, request: Lookup| async move {
                if request.customer_id == "missing" {
                    return Err("customer not found".to_owned());
                }
                Ok(Customer {
                    name: format!("Customer {}", request.customer_id),
                    customer_id: request.customer_id,
                })
            },
            shutdown,
        )
        .await
        .unwrap();
    client
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn calls_get_the_reply_of_the_server() {
    // Arrange
    let queue = unique_name("customer-lookup");
    let shutdown = CancellationToken::new();
    let server_client = lookup_server(&queue, &shutdown).await;
    let rpc = RpcClient::new(get_client().await, &RpcSettings::default())
        .await
        .unwrap();

    // Act
    let customer: Customer = rpc
        .call_json(
            &Context::current(),
            &queue,
            &Lookup {
                customer_id: "c1".into(),
            },
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(
        Customer {
            customer_id: "c1".into(),
            name: "Customer c1".into(),
        },
        customer
    );

    shutdown.cancel();
    server_client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn server_errors_come_back_as_application_errors() {
    let queue = unique_name("customer-lookup");
    let shutdown = CancellationToken::new();
    let server_client = lookup_server(&queue, &shutdown).await;
    let rpc = RpcClient::new(get_client().await, &RpcSettings::default())
        .await
        .unwrap();

    let outcome = rpc
        .call(
            &Context::current(),
            &queue,
            &Lookup {
                customer_id: "missing".into(),
            },
        )
        .await;

    match outcome {
        Err(RpcError::Application(message)) => assert_eq!("customer not found", message),
        other => panic!("Unexpected outcome: {other:?}"),
    }
    shutdown.cancel();
    server_client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn calls_without_a_server_time_out() {
    let client = get_client().await;
    let queue = unique_name("nobody-serves");
    // Declared, never consumed.
    RpcServer::new(client.clone(), queue.as_str()).await.unwrap();
    let rpc = RpcClient::new(client.clone(), &RpcSettings::default())
        .await
        .unwrap();

    let outcome = rpc
        .call_with_timeout(
            &Context::current(),
            &queue,
            &serde_json::json!({ "ping": true }),
            Duration::from_millis(300),
        )
        .await;

    assert!(matches!(outcome, Err(RpcError::Timeout(_))));
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker"]
async fn cancelled_calls_return_straight_away() {
    let client = get_client().await;
    let queue = unique_name("nobody-serves");
    RpcServer::new(client.clone(), queue.as_str()).await.unwrap();
    let rpc = RpcClient::new(client.clone(), &RpcSettings::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = rpc
        .call_with_options(
            &Context::current(),
            &queue,
            &serde_json::json!({ "ping": true }),
            CallOptions {
                timeout: None,
                cancel: Some(cancel),
            },
        )
        .await;

    assert!(matches!(outcome, Err(RpcError::Cancelled)));
    client.shutdown().await;
}
