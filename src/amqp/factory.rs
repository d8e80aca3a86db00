use crate::amqp::configuration::{RabbitMqSettings, RabbitMqTlsSettings};
use anyhow::Context;
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::types::LongString;
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a RabbitMq broker, as many times as needed: the pool uses it both at startup and
/// every time it reconnects.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    connection_name: Option<String>,
    /// `None` means plain text.
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    /// Expected on the server certificate.
    domain: String,
}

impl Tls {
    fn new(settings: &RabbitMqTlsSettings, host: &str) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = settings.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        let connector = builder
            .build()
            .context("TLS configuration for RabbitMQ failed")?;
        Ok(Self {
            connector,
            domain: settings.domain.clone().unwrap_or_else(|| host.to_owned()),
        })
    }
}

impl ConnectionFactory {
    /// Validate `settings` (e.g. the TLS certificate chain) without dialing the broker.
    ///
    /// The connection timeout defaults to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let uri = settings.amqp_uri();
        let tls = match &settings.tls {
            Some(tls) => Some(Arc::new(Tls::new(tls, &uri.authority.host)?)),
            None => None,
        };
        Ok(Self {
            uri,
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            connection_name: settings.connection_name.clone(),
            tls,
        })
    }

    /// The host this factory dials, for logging purposes.
    pub fn host(&self) -> &str {
        &self.uri.authority.host
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a new connection, encrypted if TLS settings were provided.
    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self),
        fields(host = %self.host(), tls = self.is_tls())
    )]
    pub async fn new_connection(&self) -> Result<Connection, anyhow::Error> {
        let properties = self.connection_properties();
        let connect = async {
            match &self.tls {
                None => Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        tokio::time::timeout(self.connection_timeout, connect)
            .await
            .with_context(|| {
                format!(
                    "Timed out after {:?} while connecting to RabbitMq",
                    self.connection_timeout
                )
            })?
            .with_context(|| format!("Failed to connect to RabbitMq at {}", self.host()))
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match &self.connection_name {
            Some(name) => properties.with_connection_name(LongString::from(name.as_str())),
            None => properties,
        }
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<Connection, lapin::Error> {
        Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake against the expected domain.
                let mut tcp_uri = uri.clone();
                tcp_uri.scheme = AMQPScheme::AMQP;
                tcp_uri
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
            }),
            properties,
        )
        .await
    }
}
