use crate::amqp::configuration::{ConnectionSettings, TlsSettings};
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;

/// Used when [`ConnectionSettings::connection_timeout_seconds`] is not set.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to build a [`ConnectionFactory`] or to open a connection with it.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionFactoryError {
    #[error("The TLS configuration for RabbitMq is invalid")]
    Tls(#[source] anyhow::Error),
    #[error("Timed out after {0:?} while connecting to RabbitMq")]
    Timeout(Duration),
    #[error("Failed to connect to RabbitMq")]
    Connect(#[source] lapin::Error),
}

/// Opens connections to the broker described by a [`ConnectionSettings`].
///
/// Connections are encrypted when the settings carry a TLS section.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    timeout: Duration,
    tls: Option<Arc<TlsConnector>>,
}

struct TlsConnector {
    connector: NativeTlsConnector,
    /// The name the server certificate is checked against.
    domain: String,
}

impl TlsConnector {
    fn from_settings(tls: &TlsSettings, host: &str) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = tls.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        Ok(Self {
            connector: builder.build()?,
            domain: tls.domain.clone().unwrap_or_else(|| host.to_owned()),
        })
    }
}

impl ConnectionFactory {
    pub fn new_from_config(settings: &ConnectionSettings) -> Result<Self, ConnectionFactoryError> {
        let tls = match &settings.tls {
            Some(tls) => Some(Arc::new(
                TlsConnector::from_settings(tls, &settings.host)
                    .map_err(ConnectionFactoryError::Tls)?,
            )),
            None => None,
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a new connection, giving up after the configured timeout.
    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip(self),
        fields(host = %self.uri.authority.host, tls = self.is_encrypted())
    )]
    pub async fn new_connection(&self) -> Result<lapin::Connection, ConnectionFactoryError> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let tls = self.tls.clone();
        let connecting = lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                let Some(tls) = &tls else {
                    return uri.connect();
                };
                // The TLS handshake happens on top of a plain AMQP connection.
                let mut plain = uri.clone();
                plain.scheme = AMQPScheme::AMQP;
                plain
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
            }),
            properties,
        );
        let connection = tokio::time::timeout(self.timeout, connecting)
            .await
            .map_err(|_| ConnectionFactoryError::Timeout(self.timeout))?
            .map_err(ConnectionFactoryError::Connect)?;
        connection.on_error(|e| {
            tracing::warn!(error = ?e, "The connection to RabbitMq broke");
        });
        Ok(connection)
    }
}
