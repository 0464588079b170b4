use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} terminated by a signal")]
    Signalled { program: String },

    #[error("transfer {from} -> {to} failed with exit code {exit_code}")]
    Transfer {
        from: String,
        to: String,
        exit_code: i32,
    },
}
