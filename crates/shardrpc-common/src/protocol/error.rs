use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardRpcError {
    #[error("bind target is not in the cluster: {0}")]
    InvalidNode(String),

    #[error("server is already bound")]
    AlreadyBound,

    #[error("server is not bound")]
    NotBound,

    #[error("server has been shut down")]
    NetworkShutdown,

    #[error("failed to bind listener: {0}")]
    NetworkBind(#[source] std::io::Error),

    #[error("invalid cluster: {0}")]
    InvalidCluster(String),

    #[error("no handler registered for message '{0}'")]
    NoHandler(String),

    #[error("handler failed: {0}")]
    HandlerError(String),

    #[error("request timed out before a response was generated")]
    Timeout,

    #[error("request rejected: executor is saturated")]
    Rejected,

    #[error("cluster coordinator unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShardRpcError>;
