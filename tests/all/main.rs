mod helpers;
mod pool;
mod publish_consume;
mod retries;
mod rpc;
mod topology;
