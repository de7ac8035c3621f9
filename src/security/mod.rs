//! Authentication and authorization contracts
//!
//! The processor consults the [`Authenticator`] at CONNECT and the
//! [`Authorizator`] at PUBLISH and SUBSCRIBE. Denied publishes are still
//! acked per their QoS and silently dropped; denied subscriptions get
//! the failure code in SUBACK.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{AuthConfig, AuthzConfig};
use crate::protocol::{QoS, ReturnCode};

/// Credential check performed at CONNECT when the user flag is set
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns `ReturnCode::Accepted` or the CONNACK code to refuse with
    async fn check_valid(&self, username: &str, password: Option<&Bytes>) -> ReturnCode;
}

/// Topic-level policy consulted on PUBLISH and SUBSCRIBE
#[async_trait]
pub trait Authorizator: Send + Sync {
    async fn can_write(
        &self,
        topic: &str,
        username: Option<&str>,
        client_id: &str,
        qos: QoS,
    ) -> bool;

    async fn can_read(&self, filter: &str, username: Option<&str>, client_id: &str) -> bool;
}

/// Accepts any credentials
pub struct AcceptAllAuthenticator;

#[async_trait]
impl Authenticator for AcceptAllAuthenticator {
    async fn check_valid(&self, _username: &str, _password: Option<&Bytes>) -> ReturnCode {
        ReturnCode::Accepted
    }
}

/// Authenticates against the user list in the configuration file
pub struct ConfigAuthenticator {
    users: Vec<(String, String)>,
}

impl ConfigAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl Authenticator for ConfigAuthenticator {
    async fn check_valid(&self, username: &str, password: Option<&Bytes>) -> ReturnCode {
        let Some((_, stored)) = self.users.iter().find(|(u, _)| u == username) else {
            return ReturnCode::BadUsernameOrPassword;
        };
        let supplied = password.map(|p| p.as_ref()).unwrap_or(&[]);
        if supplied == stored.as_bytes() {
            ReturnCode::Accepted
        } else {
            ReturnCode::BadUsernameOrPassword
        }
    }
}

/// Permits every publish and subscribe
pub struct PermitAllAuthorizator;

#[async_trait]
impl Authorizator for PermitAllAuthorizator {
    async fn can_write(
        &self,
        _topic: &str,
        _username: Option<&str>,
        _client_id: &str,
        _qos: QoS,
    ) -> bool {
        true
    }

    async fn can_read(&self, _filter: &str, _username: Option<&str>, _client_id: &str) -> bool {
        true
    }
}

/// Restricts traffic to a single allowed topic and optionally a single
/// publish QoS. Either restriction may be absent.
pub struct TopicPolicyAuthorizator {
    allowed_topic: Option<String>,
    allowed_qos: Option<QoS>,
}

impl TopicPolicyAuthorizator {
    pub fn new(allowed_topic: Option<String>, allowed_qos: Option<QoS>) -> Self {
        Self {
            allowed_topic,
            allowed_qos,
        }
    }

    pub fn from_config(config: &AuthzConfig) -> Option<Self> {
        if config.allowed_topic.is_none() && config.allowed_qos.is_none() {
            return None;
        }
        let allowed_qos = config.allowed_qos.and_then(QoS::from_u8);
        Some(Self::new(config.allowed_topic.clone(), allowed_qos))
    }
}

#[async_trait]
impl Authorizator for TopicPolicyAuthorizator {
    async fn can_write(
        &self,
        topic: &str,
        _username: Option<&str>,
        _client_id: &str,
        qos: QoS,
    ) -> bool {
        let topic_ok = self
            .allowed_topic
            .as_deref()
            .map(|allowed| allowed == topic)
            .unwrap_or(true);
        let qos_ok = self.allowed_qos.map(|allowed| allowed == qos).unwrap_or(true);
        topic_ok && qos_ok
    }

    async fn can_read(&self, filter: &str, _username: Option<&str>, _client_id: &str) -> bool {
        self.allowed_topic
            .as_deref()
            .map(|allowed| allowed == filter)
            .unwrap_or(true)
    }
}

/// Shared trait-object aliases used across the broker
pub type DynAuthenticator = Arc<dyn Authenticator>;
pub type DynAuthorizator = Arc<dyn Authorizator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthUser;

    #[tokio::test]
    async fn config_authenticator_checks_credentials() {
        let auth = ConfigAuthenticator::new(&AuthConfig {
            allow_anonymous: false,
            users: vec![AuthUser {
                username: "alice".into(),
                password: "secret".into(),
            }],
        });

        assert_eq!(
            auth.check_valid("alice", Some(&Bytes::from_static(b"secret")))
                .await,
            ReturnCode::Accepted
        );
        assert_eq!(
            auth.check_valid("alice", Some(&Bytes::from_static(b"wrong")))
                .await,
            ReturnCode::BadUsernameOrPassword
        );
        assert_eq!(
            auth.check_valid("mallory", Some(&Bytes::from_static(b"secret")))
                .await,
            ReturnCode::BadUsernameOrPassword
        );
    }

    #[tokio::test]
    async fn topic_policy_restricts_topic_and_qos() {
        let authz = TopicPolicyAuthorizator::new(Some("telemetry".into()), Some(QoS::AtLeastOnce));

        assert!(authz.can_write("telemetry", None, "c", QoS::AtLeastOnce).await);
        assert!(!authz.can_write("other", None, "c", QoS::AtLeastOnce).await);
        assert!(!authz.can_write("telemetry", None, "c", QoS::ExactlyOnce).await);
        assert!(authz.can_read("telemetry", None, "c").await);
        assert!(!authz.can_read("other", None, "c").await);
    }
}
