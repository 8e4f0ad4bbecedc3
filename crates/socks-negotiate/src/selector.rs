//! Authentication method negotiation strategies.
//!
//! A [`Selector`] decides which authentication methods are advertised or
//! chosen, and runs the sub-negotiation for the method that was picked.
//! [`ClientSelector`] is the one a dialing client normally uses;
//! [`ServerSelector`] runs the server side of username/password
//! authentication.

use crate::msg::{send, AuthMethod, UserPassRequest, UserPassResponse};
use crate::msg::{USERPASS_FAILED, USERPASS_SUCCEEDED};
use crate::stream::BoxStream;
use crate::{Error, Result};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// A strategy for choosing an authentication method and running its
/// sub-negotiation.
///
/// A selector belongs to a single connection: the read and write paths of
/// that connection share it, and the connection's own locks serialize
/// calls into it.
#[async_trait]
pub trait Selector: Send + Sync {
    /// Return the methods to advertise, in order of preference.
    fn methods(&self) -> Vec<AuthMethod>;

    /// Choose one of the methods that a client `offered`.
    ///
    /// The default picks the first of our [`methods`](Selector::methods)
    /// that the client offered, or [`AuthMethod::NO_ACCEPTABLE`] if there
    /// is none.  If we advertise nothing, we accept
    /// [`AuthMethod::NO_AUTH`] whenever it is offered.
    fn select(&self, offered: &[AuthMethod]) -> AuthMethod {
        let mine = self.methods();
        if mine.is_empty() {
            return if offered.contains(&AuthMethod::NO_AUTH) {
                AuthMethod::NO_AUTH
            } else {
                AuthMethod::NO_ACCEPTABLE
            };
        }
        mine.into_iter()
            .find(|m| offered.contains(m))
            .unwrap_or(AuthMethod::NO_ACCEPTABLE)
    }

    /// Run the sub-negotiation for `method` over `stream`.
    ///
    /// Returns the stream that the connection should use from now on:
    /// either `stream` itself or a replacement that wraps it.  An error
    /// aborts the handshake.
    async fn on_selected(&self, method: AuthMethod, stream: BoxStream) -> Result<BoxStream>;

    /// Return true if an authentication response still has to be read.
    fn is_authentication_to_read(&self) -> bool;

    /// Record that an authentication response has to be read.
    fn set_authentication_read(&self);
}

/// A username and password for RFC 1929 authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The username.  An empty username disables authentication.
    username: String,
    /// The password.
    password: String,
}

impl Credentials {
    /// Construct a new set of credentials.
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Return the username.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish()
    }
}

/// The selector that a SOCKS client uses by default.
///
/// It advertises its configured methods, and sends its credentials (if
/// it has any) as soon as the method request is out, without waiting
/// for the server's choice.
///
/// A selector with credentials should therefore advertise only
/// [`AuthMethod::USERNAME_PASSWORD`]: a server that picks any other
/// method would take the credentials for application data.
/// [`ClientConfig`](crate::ClientConfig) builds selectors that way.
#[derive(Debug, Default)]
pub struct ClientSelector {
    /// Methods to advertise.
    methods: Vec<AuthMethod>,
    /// Credentials to send, if any.
    credentials: Option<Credentials>,
    /// Set once a username/password request has been sent and its
    /// response is outstanding.
    auth_to_read: AtomicBool,
}

impl ClientSelector {
    /// Construct a new ClientSelector.
    pub fn new(credentials: Option<Credentials>, methods: &[AuthMethod]) -> Self {
        ClientSelector {
            methods: methods.to_vec(),
            credentials,
            auth_to_read: AtomicBool::new(false),
        }
    }

    /// Add more methods to advertise.
    ///
    /// Only useful before the selector is handed to a connection.
    pub fn add_method(&mut self, methods: &[AuthMethod]) {
        self.methods.extend_from_slice(methods);
    }
}

#[async_trait]
impl Selector for ClientSelector {
    fn methods(&self) -> Vec<AuthMethod> {
        self.methods.clone()
    }

    fn select(&self, _offered: &[AuthMethod]) -> AuthMethod {
        AuthMethod::NO_AUTH
    }

    async fn on_selected(&self, method: AuthMethod, mut stream: BoxStream) -> Result<BoxStream> {
        if method == AuthMethod::NO_ACCEPTABLE {
            return Err(Error::MethodRejected);
        }
        match &self.credentials {
            Some(creds) if !creds.username.is_empty() => {
                let req =
                    UserPassRequest::new(creds.username.as_bytes(), creds.password.as_bytes())?;
                req.write_to(&mut stream).await?;
                trace!("Sent username/password request for {:?}", creds.username);
                self.set_authentication_read();
            }
            _ => {}
        }
        Ok(stream)
    }

    fn is_authentication_to_read(&self) -> bool {
        self.auth_to_read.load(Ordering::SeqCst)
    }

    fn set_authentication_read(&self) {
        self.auth_to_read.store(true, Ordering::SeqCst);
    }
}

/// A selector for SOCKS servers.
///
/// It picks the first of its methods (in preference order) that the
/// client offers, and checks username/password requests against a
/// table of known users.
#[derive(Default)]
pub struct ServerSelector {
    /// Methods we accept, most preferred first.
    methods: Vec<AuthMethod>,
    /// Map from username to password, as raw bytes.
    users: HashMap<Vec<u8>, Vec<u8>>,
    /// Unused on the server side, but part of the Selector contract.
    auth_to_read: AtomicBool,
}

impl ServerSelector {
    /// Construct a new ServerSelector accepting `methods`.
    pub fn new(methods: &[AuthMethod]) -> Self {
        ServerSelector {
            methods: methods.to_vec(),
            users: HashMap::new(),
            auth_to_read: AtomicBool::new(false),
        }
    }

    /// Allow a user to log in with the given password.
    ///
    /// Usernames and passwords are compared byte for byte.
    pub fn add_user<U: Into<Vec<u8>>, P: Into<Vec<u8>>>(&mut self, username: U, password: P) {
        self.users.insert(username.into(), password.into());
    }

    /// Return true if `req` names a known user with the right password.
    fn check(&self, req: &UserPassRequest) -> bool {
        match self.users.get(req.username()) {
            Some(password) => password[..] == *req.password(),
            None => false,
        }
    }
}

#[async_trait]
impl Selector for ServerSelector {
    fn methods(&self) -> Vec<AuthMethod> {
        self.methods.clone()
    }

    async fn on_selected(&self, method: AuthMethod, mut stream: BoxStream) -> Result<BoxStream> {
        match method {
            AuthMethod::NO_ACCEPTABLE => Err(Error::MethodRejected),
            AuthMethod::USERNAME_PASSWORD => {
                let req = UserPassRequest::read_from(&mut stream).await?;
                let status = if self.check(&req) {
                    debug!("Accepted SOCKS user {:?}", req);
                    USERPASS_SUCCEEDED
                } else {
                    warn!("Rejected SOCKS user {:?}", req);
                    USERPASS_FAILED
                };
                send(&mut stream, &UserPassResponse::new(status).encode()).await?;
                if status == USERPASS_SUCCEEDED {
                    Ok(stream)
                } else {
                    Err(Error::AuthFailed(status))
                }
            }
            _ => Ok(stream),
        }
    }

    fn is_authentication_to_read(&self) -> bool {
        self.auth_to_read.load(Ordering::SeqCst)
    }

    fn set_authentication_read(&self) {
        self.auth_to_read.store(true, Ordering::SeqCst);
    }
}
