//! Types for configuring SOCKS selectors.
//!
//! These are meant to be embedded in an application's own configuration
//! and deserialized with `serde`.

use crate::msg::AuthMethod;
use crate::selector::{ClientSelector, Credentials, ServerSelector};

use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

/// Configuration for the client side of a SOCKS5 negotiation.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Method codes to advertise, in order.  Empty means "no
    /// authentication".  Ignored when a username is set.
    #[serde(default)]
    methods: Vec<u8>,
    /// Username to send, if the server wants one.
    #[serde(default)]
    username: Option<String>,
    /// Password to send along with `username`.
    #[serde(default)]
    password: Option<String>,
}

impl ClientConfig {
    /// Return the methods this configuration advertises.
    ///
    /// With a username set, this is only username/password
    /// authentication: the credentials are sent before the server
    /// answers, so any other method would leak them to the target.
    pub fn methods(&self) -> Vec<AuthMethod> {
        if self.credentials().is_some() {
            let userpass: u8 = AuthMethod::USERNAME_PASSWORD.into();
            if self.methods.iter().any(|m| *m != userpass) {
                warn!("SOCKS username is set; offering only username/password authentication");
            }
            return vec![AuthMethod::USERNAME_PASSWORD];
        }
        self.methods.iter().map(|m| (*m).into()).collect()
    }

    /// Return the credentials from this configuration, if a username is
    /// set.
    pub fn credentials(&self) -> Option<Credentials> {
        match &self.username {
            Some(u) if !u.is_empty() => Some(Credentials::new(
                u.clone(),
                self.password.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// Build a [`ClientSelector`] from this configuration.
    pub fn build_selector(&self) -> ClientSelector {
        ClientSelector::new(self.credentials(), &self.methods())
    }
}

/// Configuration for the server side of a SOCKS5 negotiation.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Method codes we accept, most preferred first.
    #[serde(default = "default_server_methods")]
    methods: Vec<u8>,
    /// Map from username to password, for username/password
    /// authentication.
    #[serde(default)]
    users: HashMap<String, String>,
}

/// Default value for `methods` in ServerConfig.
fn default_server_methods() -> Vec<u8> {
    vec![AuthMethod::NO_AUTH.into()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            methods: default_server_methods(),
            users: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Build a [`ServerSelector`] from this configuration.
    pub fn build_selector(&self) -> ServerSelector {
        let methods: Vec<AuthMethod> = self.methods.iter().map(|m| (*m).into()).collect();
        let mut selector = ServerSelector::new(&methods);
        for (user, password) in &self.users {
            selector.add_user(user.clone(), password.clone());
        }
        selector
    }
}
