use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("StoreError: {0}")]
    Store(#[from] StoreError),

    #[error("SerializationError: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("PlanFileError: {0}")]
    PlanFile(#[from] serde_yaml::Error),

    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),

    #[error("ProvisionError: {0}")]
    Provision(String),

    #[error("ExecutorError: {0}")]
    Executor(String),

    #[error("UnsupportedProvider: provider {0:?} is not supported")]
    UnsupportedProvider(String),

    #[error("MissingSecret: cluster {cluster:?} does not declare secret {name:?}")]
    MissingSecret { cluster: String, name: String },

    #[error("ClusterNotFound: {0:?}")]
    ClusterNotFound(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Store(_) => "store",
            Error::Serialization(_) => "serialization",
            Error::PlanFile(_) => "planfile",
            Error::Io(_) => "io",
            Error::Provision(_) => "provision",
            Error::Executor(_) => "executor",
            Error::UnsupportedProvider(_) => "unsupportedprovider",
            Error::MissingSecret { .. } => "missingsecret",
            Error::ClusterNotFound(_) => "clusternotfound",
        }
        .to_string()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
