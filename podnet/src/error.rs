use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflicting update for {0}")]
    Conflict(String),

    #[error(transparent)]
    NetId(#[from] podnet_netid::Error),

    #[error(transparent)]
    NetUtils(#[from] podnet_netutils::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("{program} {args:?} failed: {output}")]
    Command {
        program: String,
        args: Vec<String>,
        output: String,
    },

    #[error("requested netid {0} not allocated")]
    RequestedVnidNotAllocated(u32),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Optimistic-concurrency losses are retried by mutation paths;
    /// everything else propagates.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
