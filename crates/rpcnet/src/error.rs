//! Error types for the RPC runtime

use bytes::Bytes;
use thiserror::Error;

/// Local (runtime or transport) errors
///
/// Cloneable so that a latched failure, such as the one stored by a
/// destroyed batch queue, can be handed to every later caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocalError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("endpoint parse error: {0}")]
    EndpointParse(String),

    #[error("proxy parse error: {0}")]
    ProxyParse(String),

    #[error("{kind} `{id}' is already registered")]
    AlreadyRegistered { kind: String, id: String },

    #[error("no {kind} is registered with id `{id}'")]
    NotRegistered { kind: String, id: String },

    #[error("object adapter id `{0}' is already in use")]
    ObjectAdapterIdInUse(String),

    #[error("object adapter `{0}' deactivated")]
    ObjectAdapterDeactivated(String),

    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    #[error("illegal identity: `{0}'")]
    IllegalIdentity(String),

    #[error("illegal servant: {0}")]
    IllegalServant(String),

    #[error("socket error ({kind:?}): {message}")]
    Socket {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("connection closed by peer")]
    CloseConnection,

    #[error("connection manually closed (graceful: {graceful})")]
    ConnectionManuallyClosed { graceful: bool },

    #[error("datagram limit exceeded: {size} bytes exceeds maximum {max}")]
    DatagramLimit { size: usize, max: usize },

    #[error("no suitable endpoint available for proxy `{0}'")]
    NoEndpoint(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bad magic number: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocol { major: u8, minor: u8 },

    #[error("memory limit exceeded: {size} bytes exceeds maximum {max}")]
    MemoryLimit { size: usize, max: usize },

    #[error("marshal error: {0}")]
    Marshal(String),

    #[error("object does not exist: identity `{identity}' facet `{facet}' operation `{operation}'")]
    ObjectNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("facet does not exist: identity `{identity}' facet `{facet}' operation `{operation}'")]
    FacetNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("operation does not exist: identity `{identity}' facet `{facet}' operation `{operation}'")]
    OperationNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    #[error("unknown user exception: {0}")]
    UnknownUser(String),

    #[error("unknown exception: {0}")]
    Unknown(String),

    #[error("invocation timed out")]
    InvocationTimeout,

    #[error("invocation canceled")]
    InvocationCanceled,

    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
}

/// Coarse classification of a [`LocalError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Registration,
    State,
    Argument,
    Transport,
    Protocol,
    Dispatch,
    Invocation,
    Unsupported,
}

impl LocalError {
    pub fn kind(&self) -> ErrorKind {
        use LocalError::*;
        match self {
            Initialization(_) | EndpointParse(_) | ProxyParse(_) => ErrorKind::Configuration,
            AlreadyRegistered { .. } | NotRegistered { .. } | ObjectAdapterIdInUse(_) => {
                ErrorKind::Registration
            }
            ObjectAdapterDeactivated(_) | CommunicatorDestroyed => ErrorKind::State,
            IllegalIdentity(_) | IllegalServant(_) => ErrorKind::Argument,
            Socket { .. }
            | ConnectFailed(_)
            | ConnectionRefused(_)
            | ConnectionLost(_)
            | ConnectTimeout
            | ConnectionTimeout
            | CloseConnection
            | ConnectionManuallyClosed { .. }
            | DatagramLimit { .. }
            | NoEndpoint(_) => ErrorKind::Transport,
            Protocol(_) | BadMagic(_) | UnsupportedProtocol { .. } | MemoryLimit { .. }
            | Marshal(_) => ErrorKind::Protocol,
            ObjectNotExist { .. }
            | FacetNotExist { .. }
            | OperationNotExist { .. }
            | UnknownLocal(_)
            | UnknownUser(_)
            | Unknown(_) => ErrorKind::Dispatch,
            InvocationTimeout | InvocationCanceled => ErrorKind::Invocation,
            FeatureNotSupported(_) => ErrorKind::Unsupported,
        }
    }

    /// True for failures that mean the underlying connection is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LocalError::Socket { .. }
                | LocalError::ConnectionLost(_)
                | LocalError::ConnectionTimeout
                | LocalError::CloseConnection
                | LocalError::ConnectionManuallyClosed { .. }
        )
    }
}

impl From<std::io::Error> for LocalError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused => LocalError::ConnectionRefused(err.to_string()),
            Io::TimedOut => LocalError::ConnectionTimeout,
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof => {
                LocalError::ConnectionLost(err.to_string())
            }
            kind => LocalError::Socket {
                kind,
                message: err.to_string(),
            },
        }
    }
}

/// Application-defined exception raised by a servant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("user exception `{type_id}'")]
pub struct UserError {
    pub type_id: String,
    pub payload: Bytes,
}

impl UserError {
    pub fn new(type_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id: type_id.into(),
            payload: payload.into(),
        }
    }
}

/// Outcome of a failed invocation or dispatch
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error(transparent)]
    Local(#[from] LocalError),

    #[error(transparent)]
    User(#[from] UserError),
}

impl RpcError {
    pub fn as_local(&self) -> Option<&LocalError> {
        match self {
            RpcError::Local(e) => Some(e),
            RpcError::User(_) => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Local(err.into())
    }
}

pub type Result<T> = std::result::Result<T, LocalError>;
