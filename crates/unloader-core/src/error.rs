#![forbid(unsafe_code)]

/// Failure of an operation explicitly requested by the user.
///
/// Observer-driven work never produces these; DOM transience degrades to
/// no-ops instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloaderError {
    /// No transcript container has been found yet.
    NotStarted,
    /// The feature is switched off.
    Disabled,
}

impl core::fmt::Display for UnloaderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotStarted => f.write_str("no transcript container is being observed"),
            Self::Disabled => f.write_str("virtualization is disabled"),
        }
    }
}

impl std::error::Error for UnloaderError {}
