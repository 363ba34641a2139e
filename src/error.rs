use thiserror::Error;

/// Fatal conditions that abort the whole run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("MSVC is not found")]
    ToolchainNotFound,
    #[error("could not find an export table in the dumpbin output")]
    ExportTableNotFound,
}
